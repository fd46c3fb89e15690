//! Canonical source printer for L2 programs
//!
//! The printed form re-lexes and re-parses to a structurally equal tree:
//! arithmetic operators are fully parenthesized, and logical operands are
//! bracketed wherever the grammar would otherwise regroup them. `!` is
//! greedy (`"!" rexp` swallows everything to its right), so a negation
//! always prints with a bracketed operand and is itself bracketed when it
//! appears as an operand of `&&`/`||`.

use crate::ast::*;

/// Print a whole program in canonical concrete syntax.
pub fn print_program(program: &Program) -> String {
    let mut printer = Printer::new();
    printer.program(program);
    printer.out
}

/// Print a single arithmetic expression (used by the `--print` driver mode
/// and by diagnostics in tests).
pub fn print_arith(expr: &ArithExpr) -> String {
    arith(expr)
}

fn arith(expr: &ArithExpr) -> String {
    match expr {
        ArithExpr::Integer(value) => value.to_string(),
        ArithExpr::Nil => "nil".to_string(),
        ArithExpr::New(type_name) => format!("new {type_name}"),
        ArithExpr::Access(path) => access(path),
        ArithExpr::Add(lhs, rhs) => format!("({} + {})", arith(lhs), arith(rhs)),
        ArithExpr::Subtract(lhs, rhs) => format!("({} - {})", arith(lhs), arith(rhs)),
        ArithExpr::Multiply(lhs, rhs) => format!("({} * {})", arith(lhs), arith(rhs)),
        ArithExpr::Call(name, args) => {
            let args: Vec<String> = args.iter().map(arith).collect();
            format!("{name}({})", args.join(", "))
        }
    }
}

fn access(path: &AccessPath) -> String {
    let mut out = path.root.clone();
    for field in &path.fields {
        out.push('.');
        out.push_str(field);
    }
    out
}

fn rexp(expr: &RelExpr) -> String {
    match expr {
        RelExpr::LessThan(lhs, rhs) => format!("{} < {}", arith(lhs), arith(rhs)),
        RelExpr::LessEq(lhs, rhs) => format!("{} <= {}", arith(lhs), arith(rhs)),
        RelExpr::Equal(lhs, rhs) => format!("{} = {}", arith(lhs), arith(rhs)),
        RelExpr::And(lhs, rhs) => format!("{} && {}", chain_lhs(lhs), rprim(rhs)),
        RelExpr::Or(lhs, rhs) => format!("{} || {}", chain_lhs(lhs), rprim(rhs)),
        RelExpr::Not(operand) => format!("![{}]", rexp(operand)),
    }
}

/// Left operand of `&&`/`||`: chains stay flat (the grammar regroups them
/// left-associatively), but a negation must be bracketed or `!` would
/// swallow the rest of the chain.
fn chain_lhs(expr: &RelExpr) -> String {
    match expr {
        RelExpr::Not(_) => format!("[{}]", rexp(expr)),
        _ => rexp(expr),
    }
}

/// Right operand of `&&`/`||`: anything but a bare comparison is bracketed.
fn rprim(expr: &RelExpr) -> String {
    match expr {
        RelExpr::And(..) | RelExpr::Or(..) | RelExpr::Not(_) => format!("[{}]", rexp(expr)),
        _ => rexp(expr),
    }
}

struct Printer {
    out: String,
    indent: usize,
}

impl Printer {
    fn new() -> Self {
        Printer {
            out: String::new(),
            indent: 0,
        }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn program(&mut self, program: &Program) {
        for type_def in &program.type_defs {
            self.type_def(type_def);
        }
        for fun_def in &program.fun_defs {
            self.fun_def(fun_def);
        }
        self.block(&program.body);
        self.line(format!("output {};", arith(&program.output)));
    }

    fn type_def(&mut self, def: &TypeDef) {
        self.line(format!("struct {} {{", def.name));
        self.indent += 1;
        for field in &def.fields {
            self.line(format!("{} {};", field.type_name, field.name));
        }
        self.indent -= 1;
        self.line("};");
    }

    fn fun_def(&mut self, def: &FunctionDef) {
        let params: Vec<String> = def
            .params
            .iter()
            .map(|p| format!("{} {}", p.type_name, p.name))
            .collect();
        self.line(format!(
            "def {}({}) : {} {{",
            def.name,
            params.join(", "),
            def.return_type
        ));
        self.indent += 1;
        self.block(&def.body);
        self.line(format!("return {};", arith(&def.ret)));
        self.indent -= 1;
        self.line("}");
    }

    fn block(&mut self, block: &Block) {
        for decl in &block.decls {
            self.line(format!("{} {};", decl.type_name, decl.name));
        }
        for stmt in &block.stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { target, value } => {
                self.line(format!("{} := {};", access(target), arith(value)));
            }
            Stmt::If {
                guard,
                then_block,
                else_block,
            } => {
                self.line(format!("if ({}) {{", rexp(guard)));
                self.indent += 1;
                self.block(then_block);
                self.indent -= 1;
                if else_block.decls.is_empty() && else_block.stmts.is_empty() {
                    self.line("}");
                } else {
                    self.line("} else {");
                    self.indent += 1;
                    self.block(else_block);
                    self.indent -= 1;
                    self.line("}");
                }
            }
            Stmt::While { guard, body } => {
                self.line(format!("while ({}) {{", rexp(guard)));
                self.indent += 1;
                self.block(body);
                self.indent -= 1;
                self.line("}");
            }
        }
    }
}
