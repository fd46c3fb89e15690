//! L2 Parser - recursive descent over the token stream
//!
//! The grammar is LL(1) except at the start of a factor, where a two-token
//! lookahead (`Id` followed by `(`) distinguishes a function call from an
//! access path. Binary operators are
//! left-associative; `*` binds tighter than `+`/`-`; `&&` and `||` share a
//! single precedence level. Errors are raised on the first mismatch and
//! there is no recovery.

use crate::ast::*;
use crate::error::ParseError;
use crate::token::{ArithOp, LBinOp, RelOp, Token};

type Result<T> = std::result::Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn unexpected(expected: impl Into<String>, found: &Token) -> ParseError {
    ParseError::UnexpectedToken {
        expected: expected.into(),
        found: found.describe(),
    }
}

fn at_end(expected: impl Into<String>) -> ParseError {
    ParseError::UnexpectedEnd {
        expected: expected.into(),
    }
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.tokens.get(self.pos) {
            Some(tok) if tok == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(tok) => Err(unexpected(expected.describe(), tok)),
            None => Err(at_end(expected.describe())),
        }
    }

    fn parse_id(&mut self) -> Result<String> {
        match self.tokens.get(self.pos) {
            Some(Token::Id(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            Some(tok) => Err(unexpected("an identifier", tok)),
            None => Err(at_end("an identifier")),
        }
    }

    fn parse_type_name(&mut self) -> Result<String> {
        match self.tokens.get(self.pos) {
            Some(Token::TypeName(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            Some(tok) => Err(unexpected("a type name", tok)),
            None => Err(at_end("a type name")),
        }
    }

    /// Parse a complete program:
    /// `typedef* fundef* block "output" arith ";"`
    pub fn parse(&mut self) -> Result<Program> {
        let mut type_defs = Vec::new();
        while self.peek() == Some(&Token::Struct) {
            type_defs.push(self.parse_type_def()?);
        }

        let mut fun_defs = Vec::new();
        while self.peek() == Some(&Token::Def) {
            fun_defs.push(self.parse_fun_def()?);
        }

        let body = self.parse_block()?;

        self.expect(&Token::Output)?;
        let output = self.parse_arith()?;
        self.expect(&Token::Semicolon)?;

        if let Some(tok) = self.peek() {
            return Err(unexpected("the end of the program", tok));
        }

        Ok(Program {
            type_defs,
            fun_defs,
            body,
            output,
        })
    }

    /// `"struct" TypeName "{" decl* "}" ";"`
    fn parse_type_def(&mut self) -> Result<TypeDef> {
        self.expect(&Token::Struct)?;
        let name = self.parse_type_name()?;
        if is_int_type(&name) {
            return Err(ParseError::StructInt);
        }
        self.expect(&Token::LBrace)?;
        let fields = self.parse_decls()?;
        self.expect(&Token::RBrace)?;
        self.expect(&Token::Semicolon)?;
        Ok(TypeDef { name, fields })
    }

    /// `"def" Id "(" params? ")" ":" TypeName "{" block "return" arith ";" "}"`
    fn parse_fun_def(&mut self) -> Result<FunctionDef> {
        self.expect(&Token::Def)?;
        let name = self.parse_id()?;

        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if matches!(self.peek(), Some(Token::TypeName(_))) {
            loop {
                let type_name = self.parse_type_name()?;
                let param = self.parse_id()?;
                params.push(Declaration::new(type_name, param));
                if self.peek() != Some(&Token::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.expect(&Token::RParen)?;

        self.expect(&Token::HasType)?;
        let return_type = self.parse_type_name()?;

        self.expect(&Token::LBrace)?;
        let body = self.parse_block()?;
        self.expect(&Token::Return)?;
        let ret = self.parse_arith()?;
        self.expect(&Token::Semicolon)?;
        self.expect(&Token::RBrace)?;

        Ok(FunctionDef {
            name,
            params,
            return_type,
            body,
            ret,
        })
    }

    /// `decl* stmt*`
    fn parse_block(&mut self) -> Result<Block> {
        let decls = self.parse_decls()?;
        let mut stmts = Vec::new();
        while self.peek().is_some_and(Token::starts_stmt) {
            stmts.push(self.parse_stmt()?);
        }
        Ok(Block { decls, stmts })
    }

    fn parse_decls(&mut self) -> Result<Vec<Declaration>> {
        let mut decls = Vec::new();
        while self.peek().is_some_and(Token::is_type_name) {
            decls.push(self.parse_decl()?);
        }
        Ok(decls)
    }

    /// `TypeName Id ";"`
    fn parse_decl(&mut self) -> Result<Declaration> {
        let type_name = self.parse_type_name()?;
        let name = self.parse_id()?;
        self.expect(&Token::Semicolon)?;
        Ok(Declaration::new(type_name, name))
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        match self.peek() {
            Some(Token::While) => self.parse_loop(),
            Some(Token::If) => self.parse_cond(),
            Some(Token::Id(_)) => self.parse_assign(),
            Some(tok) => Err(unexpected("a statement", tok)),
            None => Err(at_end("a statement")),
        }
    }

    /// `access ":=" (funcall | arith) ";"`
    fn parse_assign(&mut self) -> Result<Stmt> {
        let target = self.parse_access()?;
        self.expect(&Token::Assign)?;
        let value = self.parse_arith()?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Assign { target, value })
    }

    /// `"if" "(" rexp ")" "{" block "}" ("else" "{" block "}")?`
    fn parse_cond(&mut self) -> Result<Stmt> {
        self.expect(&Token::If)?;
        self.expect(&Token::LParen)?;
        let guard = self.parse_rexp()?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::LBrace)?;
        let then_block = self.parse_block()?;
        self.expect(&Token::RBrace)?;

        let else_block = if self.peek() == Some(&Token::Else) {
            self.advance();
            self.expect(&Token::LBrace)?;
            let block = self.parse_block()?;
            self.expect(&Token::RBrace)?;
            block
        } else {
            Block::default()
        };

        Ok(Stmt::If {
            guard,
            then_block,
            else_block,
        })
    }

    /// `"while" "(" rexp ")" "{" block "}"`
    fn parse_loop(&mut self) -> Result<Stmt> {
        self.expect(&Token::While)?;
        self.expect(&Token::LParen)?;
        let guard = self.parse_rexp()?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::LBrace)?;
        let body = self.parse_block()?;
        self.expect(&Token::RBrace)?;
        Ok(Stmt::While { guard, body })
    }

    /// `Id "(" (arith ("," arith)*)? ")"`
    fn parse_funcall(&mut self) -> Result<ArithExpr> {
        let name = self.parse_id()?;
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_arith()?);
                if self.peek() != Some(&Token::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.expect(&Token::RParen)?;
        Ok(ArithExpr::Call(name, args))
    }

    /// `Id ("." Id)*`
    fn parse_access(&mut self) -> Result<AccessPath> {
        let root = self.parse_id()?;
        let mut fields = Vec::new();
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            fields.push(self.parse_id()?);
        }
        Ok(AccessPath { root, fields })
    }

    /// `term (("+" | "-") term)*`, left-associative
    fn parse_arith(&mut self) -> Result<ArithExpr> {
        let mut left = self.parse_term()?;
        while let Some(Token::ArithOp(op @ (ArithOp::Plus | ArithOp::Minus))) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_term()?;
            left = match op {
                ArithOp::Plus => ArithExpr::Add(Box::new(left), Box::new(right)),
                ArithOp::Minus => ArithExpr::Subtract(Box::new(left), Box::new(right)),
                ArithOp::Times => unreachable!(),
            };
        }
        Ok(left)
    }

    /// `factor ("*" factor)*`, left-associative
    fn parse_term(&mut self) -> Result<ArithExpr> {
        let mut left = self.parse_factor()?;
        while self.peek() == Some(&Token::ArithOp(ArithOp::Times)) {
            self.advance();
            let right = self.parse_factor()?;
            left = ArithExpr::Multiply(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// `"(" arith ")" | Num | funcall | access | "nil" | "new" TypeName`
    fn parse_factor(&mut self) -> Result<ArithExpr> {
        match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let expr = self.parse_arith()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Num(value)) => {
                let value = *value;
                self.advance();
                Ok(ArithExpr::Integer(value))
            }
            // The one LL(2) spot in the grammar: `Id (` begins a call,
            // a bare `Id` begins an access path.
            Some(Token::Id(_)) if self.peek_at(1) == Some(&Token::LParen) => {
                self.parse_funcall()
            }
            Some(Token::Id(_)) => Ok(ArithExpr::Access(self.parse_access()?)),
            Some(Token::Nil) => {
                self.advance();
                Ok(ArithExpr::Nil)
            }
            Some(Token::New) => {
                self.advance();
                let type_name = self.parse_type_name()?;
                if is_int_type(&type_name) {
                    return Err(ParseError::NewInt);
                }
                Ok(ArithExpr::New(type_name))
            }
            Some(tok) => Err(unexpected("an expression", tok)),
            None => Err(at_end("an expression")),
        }
    }

    /// `rprim (("&&" | "||") rprim)*`, left-to-right at a single level
    fn parse_rexp(&mut self) -> Result<RelExpr> {
        let mut left = self.parse_rprim()?;
        while let Some(Token::LBinOp(op)) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_rprim()?;
            left = match op {
                LBinOp::And => RelExpr::And(Box::new(left), Box::new(right)),
                LBinOp::Or => RelExpr::Or(Box::new(left), Box::new(right)),
            };
        }
        Ok(left)
    }

    /// `"!" rexp | "[" rexp "]" | arith relop arith`
    fn parse_rprim(&mut self) -> Result<RelExpr> {
        match self.peek() {
            Some(Token::LNeg) => {
                self.advance();
                let operand = self.parse_rexp()?;
                Ok(RelExpr::Not(Box::new(operand)))
            }
            Some(Token::LBracket) => {
                self.advance();
                let inner = self.parse_rexp()?;
                self.expect(&Token::RBracket)?;
                Ok(inner)
            }
            _ => {
                let lhs = self.parse_arith()?;
                let op = match self.peek() {
                    Some(Token::RelOp(op)) => *op,
                    Some(tok) => return Err(unexpected("a relational operator", tok)),
                    None => return Err(at_end("a relational operator")),
                };
                self.advance();
                let rhs = self.parse_arith()?;
                Ok(match op {
                    RelOp::LessThan => RelExpr::LessThan(lhs, rhs),
                    RelOp::LessEq => RelExpr::LessEq(lhs, rhs),
                    RelOp::Equal => RelExpr::Equal(lhs, rhs),
                })
            }
        }
    }
}

/// Parse a token sequence into a program.
pub fn parse(tokens: Vec<Token>) -> Result<Program> {
    Parser::new(tokens).parse()
}
