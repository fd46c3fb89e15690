// Integration tests for the l2c compiler
// These tests compile L2 programs and verify the emitted assembly text.

use l2c::compile;
use pretty_assertions::assert_eq;

fn compile_ok(source: &str) -> Vec<String> {
    compile(source).expect("program should compile")
}

/// Function labels are every line ending in `:` that is not a control-flow
/// label.
fn function_labels(insns: &[String]) -> Vec<usize> {
    insns
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            line.ends_with(':')
                && !line.starts_with("IF_FALSE_")
                && !line.starts_with("IF_END_")
                && !line.starts_with("WHILE_START_")
                && !line.starts_with("WHILE_END_")
        })
        .map(|(i, _)| i)
        .collect()
}

#[test]
fn output_constant() {
    let insns = compile_ok("output 4;");
    assert_eq!(insns[0], "  .extern allocate");
    assert!(insns.contains(&"  movl $4, %eax".to_string()));
    // The output expression is the last thing evaluated before teardown.
    let pos = insns.iter().position(|l| l == "  movl $4, %eax").unwrap();
    assert_eq!(
        &insns[pos + 1..],
        &[
            "  add $0, %esp",
            "  movl %ebp, %esp",
            "  pop %ebp",
            "  ret",
        ]
    );
}

#[test]
fn entry_block_shape() {
    let insns = compile_ok("output 4;");
    let entry = insns.iter().position(|l| l == "Entry:").unwrap();
    assert_eq!(insns[entry - 2], "  .globl Entry");
    assert_eq!(insns[entry - 1], "  .type Entry, @function");
}

#[test]
fn every_function_label_is_followed_by_the_frame_prologue() {
    let insns = compile_ok(
        "struct N { int v; N n; }; \
         def f(N x) : int { return x.v; } \
         def g(int a, int b) : int { int c; c := a + b; return c; } \
         N p; int r; p := new N; p.v := 2; r := f(p); \
         while (r < 10) { r := g(r, r); } \
         output r;",
    );

    let labels = function_labels(&insns);
    assert_eq!(labels.len(), 3); // f, g, Entry
    for label in labels {
        assert_eq!(insns[label + 1], "  push %ebp", "after {}", insns[label]);
        assert_eq!(insns[label + 2], "  movl %esp, %ebp");
        assert!(insns[label + 3].starts_with("  pushl $0x"));
        assert!(insns[label + 4].starts_with("  pushl $0x"));
    }
}

#[test]
fn labels_are_unique_across_functions() {
    let insns = compile_ok(
        "def f(int a) : int { int r; if (a < 1) { r := 1; } else { r := 2; } return r; } \
         def g(int a) : int { int r; r := 0; while (r < a) { r := r + 1; } return r; } \
         int x; if (1 < 2) { x := f(1); } else { x := g(2); } \
         output x;",
    );
    let mut labels: Vec<&String> = insns.iter().filter(|l| l.ends_with(':')).collect();
    let total = labels.len();
    labels.sort();
    labels.dedup();
    assert_eq!(labels.len(), total, "duplicate labels emitted");
}

#[test]
fn arithmetic_precedence_scenario() {
    // 1 + 2 * 3: the 1 is spilled, the product stays in %eax, the spill is
    // reloaded into %edx and added.
    let insns = compile_ok("output 1 + 2 * 3;");
    let imul = insns.iter().position(|l| l == "  imul %edx, %eax").unwrap();
    assert_eq!(insns[imul + 1], "  add $4, %esp");
    assert_eq!(insns[imul + 2], "  movl -12(%ebp), %edx");
    assert_eq!(insns[imul + 3], "  add %edx, %eax");
}

#[test]
fn loop_scenario_has_matched_labels() {
    let insns = compile_ok("int x; x := 0; while (x < 3) { x := x + 1; } output x;");
    let start = insns.iter().position(|l| l == "WHILE_START_0:").unwrap();
    let end = insns.iter().position(|l| l == "WHILE_END_0:").unwrap();
    let je = insns.iter().position(|l| l == "  je WHILE_END_0").unwrap();
    let jmp = insns.iter().position(|l| l == "  jmp WHILE_START_0").unwrap();
    assert!(start < je && je < jmp && jmp < end);
}

#[test]
fn struct_allocation_scenario() {
    let insns =
        compile_ok("struct N { int v; N n; }; N p; p := new N; p.v := 5; output p.v;");
    let push = insns.iter().position(|l| l == "  pushl $2").unwrap();
    assert_eq!(insns[push + 1], "  call allocate");
    assert_eq!(insns[push + 2], "  sub $4, %esp");
    assert_eq!(insns[push + 3], "  movl $0x02000005, -4(%eax)");
}

#[test]
fn call_scenario_marks_reference_slots_for_the_collector() {
    let insns = compile_ok(
        "struct N { int v; N n; }; \
         def f(N x) : int { return 1; } \
         N a; a := new N; output f(a);",
    );

    let f = insns.iter().position(|l| l == "f:").unwrap();
    assert_eq!(insns[f + 3], "  pushl $0x00000001"); // arg 0 is a reference
    let entry = insns.iter().position(|l| l == "Entry:").unwrap();
    assert_eq!(insns[entry + 4], "  pushl $0x00000001"); // local `a`
}

#[test]
fn nested_structs_chain_dereferences() {
    let insns = compile_ok(
        "struct N { int v; N n; }; \
         N p; p := new N; p.n := new N; p.n.v := 9; output p.n.v;",
    );
    // Reading p.n.v walks: address of p, deref to object, field 1, deref,
    // field 0, deref.
    let tail = [
        "  movl %ebp, %eax",
        "  sub $12, %eax",
        "  movl (%eax), %eax",
        "  add $4, %eax",
        "  movl (%eax), %eax",
        "  add $0, %eax",
        "  movl (%eax), %eax",
    ];
    let last = insns
        .iter()
        .rposition(|l| l == "  movl %ebp, %eax")
        .unwrap();
    assert_eq!(&insns[last..last + tail.len()], &tail);
}

#[test]
fn nil_compiles_to_zero() {
    let insns = compile_ok("struct N { int v; N n; }; N p; p := nil; output 0;");
    assert!(insns.contains(&"  movl $0, %eax".to_string()));
}

#[test]
fn compile_errors_surface_through_the_pipeline() {
    assert!(compile("output 4").is_err()); // missing semicolon
    assert!(compile("output x + * y;").is_err()); // parse error
    assert!(compile("output missing;").is_err()); // codegen error
    assert!(compile("int x; x := new int; output x;").is_err()); // new int
}

#[test]
fn no_partial_output_on_error() {
    // Duplicate function in the second definition: the driver gets an
    // error, not a half-emitted program.
    let result = compile(
        "def f() : int { return 1; } def f() : int { return 2; } output f();",
    );
    assert!(result.is_err());
}
