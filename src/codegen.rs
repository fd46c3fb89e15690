//! Code generation: lower the AST into 32-bit x86 AT&T assembly.
//!
//! Every expression leaves its value in `%eax`. Binary operators evaluate
//! the left operand first and spill it to a stack temporary, so the value
//! held across a potentially-allocating right operand lives where the
//! collector can see it. When generating the left-hand side of an
//! assignment the access-path visitor stops one dereference early and
//! leaves an address in `%eax` instead.
//!
//! Every function prologue pushes two bitmap words below the saved
//! `%ebp`: one for parameters, one for locals, with bit `i` set iff the
//! corresponding slot holds a reference. These are the collector's typing
//! contract for the frame; they are present even when zero.

use crate::ast::*;
use crate::error::CodeGenError;
use crate::symtab::{SymbolTable, FIRST_PARAM_OFFSET};

type Result<T> = std::result::Result<T, CodeGenError>;

/// Combination tails for the spill-and-combine binary operators. The left
/// operand has been reloaded into `%edx`, the right is in `%eax`.
const ADD_TAIL: &[&str] = &["  add %edx, %eax"];
const SUB_TAIL: &[&str] = &["  sub %eax, %edx", "  movl %edx, %eax"];
const MUL_TAIL: &[&str] = &["  imul %edx, %eax"];
const LT_TAIL: &[&str] = &["  cmp %eax, %edx", "  setl %al", "  movzbl %al, %eax"];
const LE_TAIL: &[&str] = &["  cmp %eax, %edx", "  setle %al", "  movzbl %al, %eax"];
const EQ_TAIL: &[&str] = &["  cmp %eax, %edx", "  sete %al", "  movzbl %al, %eax"];
const AND_TAIL: &[&str] = &["  andl %edx, %eax"];
const OR_TAIL: &[&str] = &["  orl %edx, %eax"];

/// Code generator state
pub struct CodeGen {
    insns: Vec<String>,
    symbols: SymbolTable,
    next_label: u32,
    in_lhs_of_assignment: bool,
    in_top_level_scope: bool,
}

/// Generate assembly for a whole program.
pub fn generate(program: &Program) -> Result<Vec<String>> {
    CodeGen::new().generate(program)
}

impl CodeGen {
    pub fn new() -> Self {
        Self {
            insns: Vec::new(),
            symbols: SymbolTable::new(),
            next_label: 0,
            in_lhs_of_assignment: false,
            in_top_level_scope: true,
        }
    }

    pub fn generate(mut self, program: &Program) -> Result<Vec<String>> {
        self.emit("  .extern allocate");
        self.gen_program(program)?;
        Ok(self.insns)
    }

    fn emit(&mut self, line: impl Into<String>) {
        self.insns.push(line.into());
    }

    fn fresh_label_index(&mut self) -> u32 {
        let n = self.next_label;
        self.next_label += 1;
        n
    }

    /// Run `body` with a fresh stack temporary. Acquisition opens a scope
    /// and emits `sub $4, %esp`; the guard emits the matching `add` and
    /// closes the scope on every exit path. Temporaries are always
    /// `int`-typed: they only ever hold one-step spills of values already
    /// computed, never a reference the collector would have to trace.
    fn with_tmp<T>(&mut self, body: impl FnOnce(&mut CodeGen, i32) -> Result<T>) -> Result<T> {
        let name = self.symbols.fresh_tmp_name();
        self.symbols.open_scope();
        let offset = self
            .symbols
            .allocate_var(&name, INT_TYPE)
            .expect("temporary names are unique within a program");
        self.emit("  sub $4, %esp");

        let mut guard = scopeguard::guard(&mut *self, |gen| {
            gen.emit("  add $4, %esp");
            gen.symbols.close_scope();
        });
        body(&mut guard, offset)
    }

    fn gen_program(&mut self, program: &Program) -> Result<()> {
        for def in &program.type_defs {
            self.symbols.add_type_def(def)?;
        }
        for def in &program.fun_defs {
            self.symbols.add_fn_def(def)?;
        }
        for def in &program.fun_defs {
            self.gen_fun_def(def)?;
        }

        let locals_info = locals_bitmap("Entry", &program.body.decls)?;

        self.symbols.reset_locals();
        self.in_top_level_scope = true;

        self.emit("  .globl Entry");
        self.emit("  .type Entry, @function");
        self.emit("Entry:");
        self.emit("  push %ebp");
        self.emit("  movl %esp, %ebp");
        self.emit("  pushl $0x00000000");
        self.emit(format!("  pushl $0x{locals_info:08x}"));

        self.gen_block(&program.body)?;
        self.gen_arith(&program.output)?;

        self.emit(format!("  add ${}, %esp", program.body.decls.len() * 4));
        self.emit("  movl %ebp, %esp");
        self.emit("  pop %ebp");
        self.emit("  ret");
        Ok(())
    }

    fn gen_fun_def(&mut self, def: &FunctionDef) -> Result<()> {
        let arg_info = locals_bitmap(&def.name, &def.params)?;
        let locals_info = locals_bitmap(&def.name, &def.body.decls)?;

        self.symbols.reset_locals();

        self.emit(format!("{}:", def.name));
        self.emit("  push %ebp");
        self.emit("  movl %esp, %ebp");
        self.emit(format!("  pushl $0x{arg_info:08x}"));
        self.emit(format!("  pushl $0x{locals_info:08x}"));

        // Parameters live above the saved %ebp; the shared address
        // computation reaches them through negative offsets.
        self.symbols.open_scope();
        let mut offset = FIRST_PARAM_OFFSET;
        for param in &def.params {
            self.symbols.add_param(&param.name, &param.type_name, offset)?;
            offset -= 4;
        }

        self.gen_block(&def.body)?;
        self.gen_arith(&def.ret)?;

        self.emit(format!("  add ${}, %esp", def.body.decls.len() * 4));
        self.emit("  movl %ebp, %esp");
        self.emit("  pop %ebp");
        self.emit("  ret");
        self.emit("");

        self.symbols.close_scope();
        Ok(())
    }

    fn gen_block(&mut self, block: &Block) -> Result<()> {
        let was_top_level = self.in_top_level_scope;
        self.in_top_level_scope = false;

        let stack_size = block.decls.len() * 4;
        self.emit(format!("  sub ${stack_size}, %esp"));

        // Locals are only allowed in the outermost block of a function or
        // of the program; this keeps the locals bitmap well-defined and
        // the collector's frame scan linear.
        if !was_top_level && stack_size > 0 {
            return Err(CodeGenError::InnerScopeLocals);
        }

        self.symbols.open_scope();

        for decl in &block.decls {
            let offset = self.symbols.allocate_var(&decl.name, &decl.type_name)?;
            self.emit(format!("  movl $0, -{offset}(%ebp)"));
        }
        for stmt in &block.stmts {
            self.gen_stmt(stmt)?;
        }

        if !was_top_level {
            self.emit(format!("  add ${stack_size}, %esp"));
            self.symbols.close_scope();
        }
        self.in_top_level_scope = was_top_level;
        Ok(())
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Assign { target, value } => {
                // RHS first: if the LHS names a field of a heap object and
                // the RHS allocates, no stale object address may live in a
                // register across the collection.
                self.gen_arith(value)?;
                self.with_tmp(|gen, tmp| {
                    gen.emit(format!("  movl %eax, -{tmp}(%ebp)"));
                    gen.in_lhs_of_assignment = true;
                    let lhs = gen.gen_access(target);
                    gen.in_lhs_of_assignment = false;
                    lhs?;
                    gen.emit(format!("  movl -{tmp}(%ebp), %edx"));
                    gen.emit("  movl %edx, (%eax)");
                    Ok(())
                })
            }
            Stmt::If {
                guard,
                then_block,
                else_block,
            } => {
                let n = self.fresh_label_index();
                self.gen_rexp(guard)?;
                self.emit("  cmp $0, %eax");
                self.emit(format!("  je IF_FALSE_{n}"));
                self.gen_block(then_block)?;
                self.emit(format!("  jmp IF_END_{n}"));
                self.emit(format!("IF_FALSE_{n}:"));
                self.gen_block(else_block)?;
                self.emit(format!("IF_END_{n}:"));
                Ok(())
            }
            Stmt::While { guard, body } => {
                let n = self.fresh_label_index();
                self.emit(format!("WHILE_START_{n}:"));
                self.gen_rexp(guard)?;
                self.emit("  cmp $0, %eax");
                self.emit(format!("  je WHILE_END_{n}"));
                self.gen_block(body)?;
                self.emit(format!("  jmp WHILE_START_{n}"));
                self.emit(format!("WHILE_END_{n}:"));
                Ok(())
            }
        }
    }

    fn gen_arith(&mut self, expr: &ArithExpr) -> Result<()> {
        match expr {
            ArithExpr::Integer(value) => {
                self.emit(format!("  movl ${value}, %eax"));
                Ok(())
            }
            ArithExpr::Nil => {
                // nil is the integer 0
                self.emit("  movl $0, %eax");
                Ok(())
            }
            ArithExpr::New(type_name) => self.gen_new(type_name),
            ArithExpr::Access(path) => self.gen_access(path),
            ArithExpr::Add(lhs, rhs) => self.gen_spilled_arith(lhs, rhs, ADD_TAIL),
            ArithExpr::Subtract(lhs, rhs) => self.gen_spilled_arith(lhs, rhs, SUB_TAIL),
            ArithExpr::Multiply(lhs, rhs) => self.gen_spilled_arith(lhs, rhs, MUL_TAIL),
            ArithExpr::Call(name, args) => self.gen_call(name, args),
        }
    }

    fn gen_rexp(&mut self, expr: &RelExpr) -> Result<()> {
        match expr {
            RelExpr::LessThan(lhs, rhs) => self.gen_spilled_arith(lhs, rhs, LT_TAIL),
            RelExpr::LessEq(lhs, rhs) => self.gen_spilled_arith(lhs, rhs, LE_TAIL),
            RelExpr::Equal(lhs, rhs) => self.gen_spilled_arith(lhs, rhs, EQ_TAIL),
            // No short-circuiting: both operands are 0/1 values and the
            // combination is a plain bitwise instruction.
            RelExpr::And(lhs, rhs) => self.gen_spilled_rel(lhs, rhs, AND_TAIL),
            RelExpr::Or(lhs, rhs) => self.gen_spilled_rel(lhs, rhs, OR_TAIL),
            RelExpr::Not(operand) => {
                self.gen_rexp(operand)?;
                self.emit("  cmp $0, %eax");
                self.emit("  sete %al");
                self.emit("  movzbl %al, %eax");
                Ok(())
            }
        }
    }

    /// Evaluate `lhs`, spill it, evaluate `rhs`, reload the spill into
    /// `%edx`, then combine with `tail`.
    fn gen_spilled_arith(&mut self, lhs: &ArithExpr, rhs: &ArithExpr, tail: &[&str]) -> Result<()> {
        self.with_tmp(|gen, tmp| {
            gen.gen_arith(lhs)?;
            gen.emit(format!("  movl %eax, -{tmp}(%ebp)"));
            gen.gen_arith(rhs)?;
            gen.emit(format!("  movl -{tmp}(%ebp), %edx"));
            for line in tail {
                gen.emit(*line);
            }
            Ok(())
        })
    }

    fn gen_spilled_rel(&mut self, lhs: &RelExpr, rhs: &RelExpr, tail: &[&str]) -> Result<()> {
        self.with_tmp(|gen, tmp| {
            gen.gen_rexp(lhs)?;
            gen.emit(format!("  movl %eax, -{tmp}(%ebp)"));
            gen.gen_rexp(rhs)?;
            gen.emit(format!("  movl -{tmp}(%ebp), %edx"));
            for line in tail {
                gen.emit(*line);
            }
            Ok(())
        })
    }

    /// Address-or-value visit of an access path. The root's address is
    /// `%ebp` minus its offset; each field selector dereferences once and
    /// adds the field displacement. In value position the final address is
    /// dereferenced; in LHS position it is left in `%eax`.
    fn gen_access(&mut self, path: &AccessPath) -> Result<()> {
        let var = match self.symbols.lookup(&path.root) {
            Some(var) => var.clone(),
            None => {
                return Err(CodeGenError::UndefinedVariable {
                    name: path.root.clone(),
                })
            }
        };

        self.emit("  movl %ebp, %eax");
        self.emit(format!("  sub ${}, %eax", var.offset));

        let mut type_name = var.type_name;
        for field in &path.fields {
            let (index, next_type) = match self.symbols.type_info(&type_name) {
                Some(info) => match info.field(field) {
                    Some((index, field_type)) => (index, field_type.to_string()),
                    None => {
                        return Err(CodeGenError::UndefinedField {
                            field: field.clone(),
                            type_name,
                        })
                    }
                },
                None => {
                    return Err(CodeGenError::NotARecord { name: type_name });
                }
            };
            self.emit("  movl (%eax), %eax");
            self.emit(format!("  add ${}, %eax", index * 4));
            type_name = next_type;
        }

        if !self.in_lhs_of_assignment {
            self.emit("  movl (%eax), %eax");
        }
        Ok(())
    }

    /// `new T`: allocate, stamp the header with the type's tag, then
    /// zero-fill every field. Allocation happens strictly before any field
    /// write, and nothing between the `call` and the last fill can
    /// allocate, so the collector never sees a half-built object.
    fn gen_new(&mut self, type_name: &str) -> Result<()> {
        let (size, tag) = match self.symbols.type_info(type_name) {
            Some(info) => (info.fields.len(), info.tag()),
            None => {
                return Err(CodeGenError::UndefinedType {
                    name: type_name.to_string(),
                })
            }
        };

        self.emit(format!("  pushl ${size}"));
        self.emit("  call allocate");
        self.emit("  sub $4, %esp");
        self.emit(format!("  movl $0x{tag:08x}, -4(%eax)"));
        for i in 0..size {
            self.emit(format!("  movl $0, {}(%eax)", i * 4));
        }
        Ok(())
    }

    /// Caller side of the cdecl-like convention: arguments are evaluated
    /// and pushed in reverse order. The symbol table's running offset is
    /// bumped per push so temporaries created while evaluating later
    /// arguments land below the words already on the stack.
    fn gen_call(&mut self, name: &str, args: &[ArithExpr]) -> Result<()> {
        let arity = self.symbols.arity_of(name)?;
        if arity != args.len() {
            return Err(CodeGenError::ArityMismatch {
                name: name.to_string(),
                expected: arity,
                given: args.len(),
            });
        }

        let stack_space = args.len() as i32 * 4;
        for arg in args.iter().rev() {
            self.gen_arith(arg)?;
            self.emit("  push %eax");
            self.symbols.adjust_stack(4);
        }

        self.emit(format!("  call {name}"));
        self.emit(format!("  add ${stack_space}, %esp"));
        self.symbols.adjust_stack(-stack_space);
        Ok(())
    }
}

/// Bitmap with bit `i` set iff declaration `i` holds a reference. A frame
/// word can describe at most 32 slots.
fn locals_bitmap(owner: &str, decls: &[Declaration]) -> Result<u32> {
    if decls.len() > 32 {
        return Err(CodeGenError::TooManyLocals {
            name: owner.to_string(),
        });
    }
    let mut info = 0u32;
    for (i, decl) in decls.iter().enumerate() {
        if decl.is_reference() {
            info |= 1 << i;
        }
    }
    Ok(info)
}
