//! Recursive-descent parser.
//!
//! Statements that the sandbox always rejects (imports, `global`, `raise`,
//! ...) are still parsed so the checker can report them with a precise
//! location instead of a generic syntax error.

use std::rc::Rc;

use crate::ast::*;
use crate::error::{ParseResult, SyntaxError};
use crate::lexer::tokenize;
use crate::span::Span;
use crate::token::{Keyword, Token, TokenKind};

/// Maximum nesting of blocks and sub-expressions.
pub const MAX_NESTING: usize = 64;

const AUG_ASSIGN_OPS: &[(&str, BinaryOp)] = &[
    ("+=", BinaryOp::Add),
    ("-=", BinaryOp::Sub),
    ("*=", BinaryOp::Mult),
    ("@=", BinaryOp::MatMult),
    ("/=", BinaryOp::Div),
    ("//=", BinaryOp::FloorDiv),
    ("%=", BinaryOp::Mod),
    ("**=", BinaryOp::Pow),
    ("<<=", BinaryOp::LShift),
    (">>=", BinaryOp::RShift),
    ("|=", BinaryOp::BitOr),
    ("^=", BinaryOp::BitXor),
    ("&=", BinaryOp::BitAnd),
];

/// Parse a complete program.
pub fn parse(source: &str) -> ParseResult<Module> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse_module()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    // ---- token helpers -------------------------------------------------

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_nth(&self, n: usize) -> &TokenKind {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + n).min(last)].kind
    }

    fn span(&self) -> Span {
        self.peek().span
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> ParseResult<Span> {
        if self.at_op(op) {
            Ok(self.advance().span)
        } else {
            Err(self.unexpected(&format!("'{op}'")))
        }
    }

    fn at_kw(&self, kw: Keyword) -> bool {
        matches!(&self.peek().kind, TokenKind::Keyword(k) if *k == kw)
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: Keyword) -> ParseResult<Span> {
        if self.at_kw(kw) {
            Ok(self.advance().span)
        } else {
            Err(self.unexpected(&format!("'{}'", kw.as_str())))
        }
    }

    fn expect_name(&mut self) -> ParseResult<(String, Span)> {
        match &self.peek().kind {
            TokenKind::Name(name) => {
                let name = name.clone();
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn expect_newline(&mut self) -> ParseResult<()> {
        match self.peek().kind {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Newline | TokenKind::Eof) || self.at_op(";")
    }

    fn unexpected(&self, wanted: &str) -> SyntaxError {
        let tok = self.peek();
        SyntaxError::new(
            format!("invalid syntax: expected {wanted}, found {}", tok.describe()),
            tok.span,
        )
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(SyntaxError::new(
                "too many nested blocks or expressions",
                self.span(),
            ));
        }
        let out = f(self);
        self.depth -= 1;
        out
    }

    /// Runs a left-associative chain; every link it adds deepens the tree by one.
    fn chain(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<Expr>) -> ParseResult<Expr> {
        let outer = self.depth;
        let out = f(self);
        self.depth = outer;
        out
    }

    fn link(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(SyntaxError::new("expression chain nested too deeply", self.span()));
        }
        Ok(())
    }

    /// Whether the current token can begin an expression.
    fn starts_expr(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Name(_) | TokenKind::Int(_) | TokenKind::Float(_) | TokenKind::Str(_) => {
                true
            }
            TokenKind::Keyword(kw) => matches!(
                kw,
                Keyword::None
                    | Keyword::True
                    | Keyword::False
                    | Keyword::Not
                    | Keyword::Lambda
                    | Keyword::Await
            ),
            TokenKind::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "..."),
            _ => false,
        }
    }

    // ---- statements ------------------------------------------------------

    fn parse_module(mut self) -> ParseResult<Module> {
        let mut body = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Indent => {
                    return Err(SyntaxError::new("unexpected indent", self.span()));
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(Module { body })
    }

    fn parse_statement(&mut self) -> ParseResult<Vec<Stmt>> {
        let span = self.span();
        let stmt = match &self.peek().kind {
            TokenKind::Keyword(Keyword::If) => {
                self.advance();
                self.parse_if_rest(span)?
            }
            TokenKind::Keyword(Keyword::While) => self.parse_while()?,
            TokenKind::Keyword(Keyword::For) => self.parse_for()?,
            TokenKind::Keyword(Keyword::Try) => self.parse_try()?,
            TokenKind::Keyword(Keyword::With) => self.parse_with()?,
            TokenKind::Keyword(Keyword::Def) => self.parse_def()?,
            TokenKind::Keyword(Keyword::Class) => self.parse_class()?,
            TokenKind::Keyword(Keyword::Async) => {
                self.advance();
                let inner = match &self.peek().kind {
                    TokenKind::Keyword(Keyword::Def) => self.parse_def()?,
                    TokenKind::Keyword(Keyword::For) => self.parse_for()?,
                    TokenKind::Keyword(Keyword::With) => self.parse_with()?,
                    _ => return Err(self.unexpected("'def', 'for' or 'with'")),
                };
                Stmt {
                    kind: StmtKind::Async(Box::new(inner)),
                    span,
                }
            }
            TokenKind::Op("@") => {
                return Err(SyntaxError::new("decorators are not supported", span));
            }
            _ => return self.parse_simple_line(),
        };
        Ok(vec![stmt])
    }

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_op(":")?;
        self.nested(|p| {
            if !matches!(p.peek().kind, TokenKind::Newline) {
                return p.parse_simple_line();
            }
            p.advance();
            if !matches!(p.peek().kind, TokenKind::Indent) {
                return Err(SyntaxError::new("expected an indented block", p.span()));
            }
            p.advance();
            let mut body = Vec::new();
            loop {
                match p.peek().kind {
                    TokenKind::Dedent => {
                        p.advance();
                        break;
                    }
                    TokenKind::Eof => break,
                    TokenKind::Newline => {
                        p.advance();
                    }
                    _ => body.extend(p.parse_statement()?),
                }
            }
            Ok(body)
        })
    }

    fn parse_if_rest(&mut self, span: Span) -> ParseResult<Stmt> {
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = if self.at_kw(Keyword::Elif) {
            let elif_span = self.advance().span;
            vec![self.parse_if_rest(elif_span)?]
        } else if self.eat_kw(Keyword::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            span,
        })
    }

    fn parse_else_block(&mut self) -> ParseResult<Vec<Stmt>> {
        if self.eat_kw(Keyword::Else) {
            self.parse_block()
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let span = self.expect_kw(Keyword::While)?;
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = self.parse_else_block()?;
        Ok(Stmt {
            kind: StmtKind::While { test, body, orelse },
            span,
        })
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let span = self.expect_kw(Keyword::For)?;
        let target = self.parse_target_list()?;
        self.expect_kw(Keyword::In)?;
        let iter = self.parse_testlist()?;
        let body = self.parse_block()?;
        let orelse = self.parse_else_block()?;
        Ok(Stmt {
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
            },
            span,
        })
    }

    fn parse_try(&mut self) -> ParseResult<Stmt> {
        let span = self.expect_kw(Keyword::Try)?;
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.at_kw(Keyword::Except) {
            let handler_span = self.advance().span;
            let mut types = Vec::new();
            let mut bind = None;
            if !self.at_op(":") {
                if self.eat_op("(") {
                    loop {
                        types.push(self.expect_name()?.0);
                        if !self.eat_op(",") || self.at_op(")") {
                            break;
                        }
                    }
                    self.expect_op(")")?;
                } else {
                    types.push(self.expect_name()?.0);
                    if self.at_op(".") {
                        return Err(SyntaxError::new(
                            "except clauses must name built-in exception types",
                            self.span(),
                        ));
                    }
                }
                if self.eat_kw(Keyword::As) {
                    bind = Some(self.expect_name()?.0);
                }
            }
            let handler_body = self.parse_block()?;
            handlers.push(ExceptHandler {
                types,
                bind,
                body: handler_body,
                span: handler_span,
            });
        }
        let orelse = if !handlers.is_empty() {
            self.parse_else_block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw(Keyword::Finally) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(SyntaxError::new(
                "expected 'except' or 'finally' block",
                self.span(),
            ));
        }
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            span,
        })
    }

    fn parse_with(&mut self) -> ParseResult<Stmt> {
        let span = self.expect_kw(Keyword::With)?;
        let mut items = Vec::new();
        loop {
            let context = self.parse_test()?;
            let target = if self.eat_kw(Keyword::As) {
                let t = self.parse_bitor()?;
                validate_target(&t)?;
                Some(t)
            } else {
                None
            };
            items.push(WithItem { context, target });
            if !self.eat_op(",") {
                break;
            }
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::With { items, body },
            span,
        })
    }

    fn parse_def(&mut self) -> ParseResult<Stmt> {
        let span = self.expect_kw(Keyword::Def)?;
        let (name, _) = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_params(")")?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.parse_test()?;
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::FunctionDef(Rc::new(FunctionDef {
                name,
                params,
                body,
                span,
            })),
            span,
        })
    }

    fn parse_params(&mut self, closer: &str) -> ParseResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.at_op(closer) {
            if self.at_op("*") || self.at_op("**") || self.at_op("/") {
                return Err(SyntaxError::new(
                    "variadic and positional-only parameters are not supported",
                    self.span(),
                ));
            }
            let (name, span) = self.expect_name()?;
            if self.at_op(":") && closer == ")" {
                self.advance();
                self.parse_test()?;
            }
            let default = if self.eat_op("=") {
                Some(self.parse_test()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(SyntaxError::new(
                    "non-default argument follows default argument",
                    span,
                ));
            }
            if params.iter().any(|p| p.name == name) {
                return Err(SyntaxError::new(
                    format!("duplicate argument '{name}' in function definition"),
                    span,
                ));
            }
            params.push(Param {
                name,
                default,
                span,
            });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn parse_class(&mut self) -> ParseResult<Stmt> {
        let span = self.expect_kw(Keyword::Class)?;
        let (name, _) = self.expect_name()?;
        if self.eat_op("(") && !self.eat_op(")") {
            return Err(SyntaxError::new(
                "class bases are not supported",
                self.span(),
            ));
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::ClassDef { name, body },
            span,
        })
    }

    fn parse_simple_line(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut stmts = vec![self.parse_small()?];
        while self.eat_op(";") {
            if matches!(self.peek().kind, TokenKind::Newline | TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_small()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn parse_small(&mut self) -> ParseResult<Stmt> {
        let span = self.span();
        let kind = match self.peek().kind.clone() {
            TokenKind::Keyword(Keyword::Pass) => {
                self.advance();
                StmtKind::Pass
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                StmtKind::Break
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                StmtKind::Continue
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                if self.at_line_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_testlist()?))
                }
            }
            TokenKind::Keyword(Keyword::Import) => {
                self.advance();
                let mut names = Vec::new();
                loop {
                    names.push(self.parse_dotted_name()?);
                    if self.eat_kw(Keyword::As) {
                        self.expect_name()?;
                    }
                    if !self.eat_op(",") {
                        break;
                    }
                }
                StmtKind::Import { names }
            }
            TokenKind::Keyword(Keyword::From) => {
                self.advance();
                let mut module = String::new();
                while self.at_op(".") || self.at_op("...") {
                    if let TokenKind::Op(op) = self.advance().kind {
                        module.push_str(op);
                    }
                }
                if !self.at_kw(Keyword::Import) {
                    module.push_str(&self.parse_dotted_name()?);
                }
                self.expect_kw(Keyword::Import)?;
                let mut names = Vec::new();
                if self.eat_op("*") {
                    names.push("*".to_string());
                } else {
                    let parens = self.eat_op("(");
                    loop {
                        names.push(self.expect_name()?.0);
                        if self.eat_kw(Keyword::As) {
                            self.expect_name()?;
                        }
                        if !self.eat_op(",") || (parens && self.at_op(")")) {
                            break;
                        }
                    }
                    if parens {
                        self.expect_op(")")?;
                    }
                }
                StmtKind::ImportFrom { module, names }
            }
            TokenKind::Keyword(kw @ (Keyword::Global | Keyword::Nonlocal)) => {
                self.advance();
                let mut names = vec![self.expect_name()?.0];
                while self.eat_op(",") {
                    names.push(self.expect_name()?.0);
                }
                if kw == Keyword::Global {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            TokenKind::Keyword(Keyword::Del) => {
                self.advance();
                let target = self.parse_target_list()?;
                let targets = match target.kind {
                    ExprKind::Tuple(items) => items,
                    _ => vec![target],
                };
                StmtKind::Delete(targets)
            }
            TokenKind::Keyword(Keyword::Raise) => {
                self.advance();
                if self.at_line_end() {
                    StmtKind::Raise(None)
                } else {
                    let exc = self.parse_test()?;
                    if self.eat_kw(Keyword::From) {
                        self.parse_test()?;
                    }
                    StmtKind::Raise(Some(exc))
                }
            }
            TokenKind::Keyword(Keyword::Assert) => {
                self.advance();
                let test = self.parse_test()?;
                let msg = if self.eat_op(",") {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            _ => return self.parse_expr_statement(),
        };
        Ok(Stmt { kind, span })
    }

    fn parse_dotted_name(&mut self) -> ParseResult<String> {
        let mut name = self.expect_name()?.0;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?.0);
        }
        Ok(name)
    }

    fn parse_expr_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.span();
        let first = self.parse_testlist_or_yield()?;

        if let TokenKind::Op(op) = self.peek().kind {
            if let Some((_, bin)) = AUG_ASSIGN_OPS.iter().find(|(text, _)| *text == op) {
                self.advance();
                match first.kind {
                    ExprKind::Name(_) | ExprKind::Subscript { .. } | ExprKind::Attribute { .. } => {
                    }
                    _ => {
                        return Err(SyntaxError::new(
                            format!(
                                "'{}' is an illegal expression for augmented assignment",
                                first.kind.name()
                            ),
                            first.span,
                        ))
                    }
                }
                let value = self.parse_testlist_or_yield()?;
                return Ok(Stmt {
                    kind: StmtKind::AugAssign {
                        target: first,
                        op: *bin,
                        value,
                    },
                    span,
                });
            }
        }

        if self.at_op(":") {
            return Err(SyntaxError::new(
                "variable annotations are not supported",
                self.span(),
            ));
        }

        if self.at_op("=") {
            let mut targets = vec![first];
            let mut value;
            loop {
                self.expect_op("=")?;
                value = self.parse_testlist_or_yield()?;
                if self.at_op("=") {
                    targets.push(value);
                    continue;
                }
                break;
            }
            for t in &targets {
                validate_target(t)?;
            }
            return Ok(Stmt {
                kind: StmtKind::Assign { targets, value },
                span,
            });
        }

        Ok(Stmt {
            kind: StmtKind::Expr(first),
            span,
        })
    }

    // ---- expressions -----------------------------------------------------

    fn parse_testlist_or_yield(&mut self) -> ParseResult<Expr> {
        if self.at_kw(Keyword::Yield) {
            self.parse_yield()
        } else {
            self.parse_testlist()
        }
    }

    fn parse_yield(&mut self) -> ParseResult<Expr> {
        let span = self.expect_kw(Keyword::Yield)?;
        self.eat_kw(Keyword::From);
        let value = if self.starts_expr() {
            Some(Box::new(self.parse_testlist()?))
        } else {
            None
        };
        Ok(Expr {
            kind: ExprKind::Yield(value),
            span,
        })
    }

    /// `test (',' test)* [',']`, producing a tuple when a comma is present.
    fn parse_testlist(&mut self) -> ParseResult<Expr> {
        let first = self.parse_test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let span = first.span;
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expr() {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            span,
        })
    }

    /// Assignment-style target list for `for` and `del`.
    fn parse_target_list(&mut self) -> ParseResult<Expr> {
        let first = self.parse_bitor()?;
        let expr = if self.at_op(",") {
            let span = first.span;
            let mut items = vec![first];
            while self.eat_op(",") {
                if !self.starts_expr() {
                    break;
                }
                items.push(self.parse_bitor()?);
            }
            Expr {
                kind: ExprKind::Tuple(items),
                span,
            }
        } else {
            first
        };
        validate_target(&expr)?;
        Ok(expr)
    }

    fn parse_test(&mut self) -> ParseResult<Expr> {
        self.nested(|p| {
            if p.at_kw(Keyword::Lambda) {
                return p.parse_lambda();
            }
            if p.at_op(":=") {
                return Err(SyntaxError::new(
                    "assignment expressions are not supported",
                    p.span(),
                ));
            }
            let body = p.parse_or_test()?;
            if p.at_op(":=") {
                return Err(SyntaxError::new(
                    "assignment expressions are not supported",
                    p.span(),
                ));
            }
            if !p.eat_kw(Keyword::If) {
                return Ok(body);
            }
            let test = p.parse_or_test()?;
            p.expect_kw(Keyword::Else)?;
            let orelse = p.parse_test()?;
            let span = body.span;
            Ok(Expr {
                kind: ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                span,
            })
        })
    }

    fn parse_lambda(&mut self) -> ParseResult<Expr> {
        let span = self.expect_kw(Keyword::Lambda)?;
        let params = self.parse_params(":")?;
        self.expect_op(":")?;
        let body = self.parse_test()?;
        Ok(Expr {
            kind: ExprKind::Lambda(Rc::new(Lambda { params, body })),
            span,
        })
    }

    fn parse_or_test(&mut self) -> ParseResult<Expr> {
        let first = self.parse_and_test()?;
        if !self.at_kw(Keyword::Or) {
            return Ok(first);
        }
        let span = first.span;
        let mut values = vec![first];
        while self.eat_kw(Keyword::Or) {
            values.push(self.parse_and_test()?);
        }
        Ok(Expr {
            kind: ExprKind::BoolOp {
                op: BoolOp::Or,
                values,
            },
            span,
        })
    }

    fn parse_and_test(&mut self) -> ParseResult<Expr> {
        let first = self.parse_not_test()?;
        if !self.at_kw(Keyword::And) {
            return Ok(first);
        }
        let span = first.span;
        let mut values = vec![first];
        while self.eat_kw(Keyword::And) {
            values.push(self.parse_not_test()?);
        }
        Ok(Expr {
            kind: ExprKind::BoolOp {
                op: BoolOp::And,
                values,
            },
            span,
        })
    }

    fn parse_not_test(&mut self) -> ParseResult<Expr> {
        if self.at_kw(Keyword::Not) {
            let span = self.advance().span;
            let operand = self.nested(|p| p.parse_not_test())?;
            return Ok(Expr {
                kind: ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.parse_comparison()
    }

    fn parse_comp_op(&mut self) -> Option<CmpOp> {
        let op = match &self.peek().kind {
            TokenKind::Op("==") => CmpOp::Eq,
            TokenKind::Op("!=") => CmpOp::NotEq,
            TokenKind::Op("<") => CmpOp::Lt,
            TokenKind::Op("<=") => CmpOp::LtE,
            TokenKind::Op(">") => CmpOp::Gt,
            TokenKind::Op(">=") => CmpOp::GtE,
            TokenKind::Keyword(Keyword::In) => CmpOp::In,
            TokenKind::Keyword(Keyword::Not)
                if matches!(self.peek_nth(1), TokenKind::Keyword(Keyword::In)) =>
            {
                self.advance();
                CmpOp::NotIn
            }
            TokenKind::Keyword(Keyword::Is) => {
                if matches!(self.peek_nth(1), TokenKind::Keyword(Keyword::Not)) {
                    self.advance();
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.parse_comp_op() {
            ops.push(op);
            comparators.push(self.parse_bitor()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let span = left.span;
        Ok(Expr {
            kind: ExprKind::Compare {
                left: Box::new(left),
                ops,
                comparators,
            },
            span,
        })
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> ParseResult<Expr>,
    ) -> ParseResult<Expr> {
        self.chain(|p| {
            let mut left = next(p)?;
            loop {
                let found = match &p.peek().kind {
                    TokenKind::Op(op) => ops.iter().find(|(text, _)| text == op).map(|(_, b)| *b),
                    _ => None,
                };
                let Some(op) = found else { break };
                p.link()?;
                p.advance();
                let right = next(p)?;
                let span = left.span;
                left = Expr {
                    kind: ExprKind::BinOp {
                        left: Box::new(left),
                        op,
                        right: Box::new(right),
                    },
                    span,
                };
            }
            Ok(left)
        })
    }

    fn parse_bitor(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("|", BinaryOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("^", BinaryOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("&", BinaryOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[("<<", BinaryOp::LShift), (">>", BinaryOp::RShift)],
            Self::parse_arith,
        )
    }

    fn parse_arith(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::parse_term,
        )
    }

    fn parse_term(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[
                ("*", BinaryOp::Mult),
                ("/", BinaryOp::Div),
                ("//", BinaryOp::FloorDiv),
                ("%", BinaryOp::Mod),
                ("@", BinaryOp::MatMult),
            ],
            Self::parse_factor,
        )
    }

    fn parse_factor(&mut self) -> ParseResult<Expr> {
        let op = match &self.peek().kind {
            TokenKind::Op("-") => Some(UnaryOp::Neg),
            TokenKind::Op("+") => Some(UnaryOp::Pos),
            TokenKind::Op("~") => Some(UnaryOp::Invert),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.advance().span;
            let operand = self.nested(|p| p.parse_factor())?;
            return Ok(Expr {
                kind: ExprKind::UnaryOp {
                    op,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> ParseResult<Expr> {
        let base = if self.at_kw(Keyword::Await) {
            let span = self.advance().span;
            let inner = self.parse_primary()?;
            Expr {
                kind: ExprKind::Await(Box::new(inner)),
                span,
            }
        } else {
            self.parse_primary()?
        };
        if !self.eat_op("**") {
            return Ok(base);
        }
        let exponent = self.nested(|p| p.parse_factor())?;
        let span = base.span;
        Ok(Expr {
            kind: ExprKind::BinOp {
                left: Box::new(base),
                op: BinaryOp::Pow,
                right: Box::new(exponent),
            },
            span,
        })
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        self.chain(|p| {
            let mut expr = p.parse_atom()?;
            loop {
                if p.at_op("(") {
                    p.link()?;
                    p.advance();
                    expr = p.parse_call(expr)?;
                } else if p.at_op("[") {
                    p.link()?;
                    p.advance();
                    let index = p.parse_subscript()?;
                    p.expect_op("]")?;
                    let span = expr.span;
                    expr = Expr {
                        kind: ExprKind::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    };
                } else if p.at_op(".") {
                    p.link()?;
                    p.advance();
                    let (attr, _) = p.expect_name()?;
                    let span = expr.span;
                    expr = Expr {
                        kind: ExprKind::Attribute {
                            value: Box::new(expr),
                            attr,
                        },
                        span,
                    };
                } else {
                    break;
                }
            }
            Ok(expr)
        })
    }

    fn parse_call(&mut self, func: Expr) -> ParseResult<Expr> {
        let mut args = Vec::new();
        let mut keywords: Vec<KeywordArg> = Vec::new();
        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(SyntaxError::new(
                    "argument unpacking is not supported",
                    self.span(),
                ));
            }
            let is_keyword = matches!(self.peek().kind, TokenKind::Name(_))
                && matches!(self.peek_nth(1), TokenKind::Op("="));
            if is_keyword {
                let (name, span) = self.expect_name()?;
                self.expect_op("=")?;
                if keywords.iter().any(|k| k.name == name) {
                    return Err(SyntaxError::new(
                        format!("keyword argument repeated: {name}"),
                        span,
                    ));
                }
                let value = self.parse_test()?;
                keywords.push(KeywordArg { name, value });
            } else {
                let span = self.span();
                if !keywords.is_empty() {
                    return Err(SyntaxError::new(
                        "positional argument follows keyword argument",
                        span,
                    ));
                }
                let arg = self.parse_test()?;
                if self.at_kw(Keyword::For) {
                    let generators = self.parse_comp_for()?;
                    args.push(Expr {
                        kind: ExprKind::GeneratorExp {
                            elt: Box::new(arg),
                            generators,
                        },
                        span,
                    });
                } else {
                    args.push(arg);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        let span = func.span;
        Ok(Expr {
            kind: ExprKind::Call {
                func: Box::new(func),
                args,
                keywords,
            },
            span,
        })
    }

    fn parse_subscript(&mut self) -> ParseResult<Expr> {
        let first = self.parse_slice_item()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let span = first.span;
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.parse_slice_item()?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            span,
        })
    }

    fn parse_slice_item(&mut self) -> ParseResult<Expr> {
        let span = self.span();
        let lower = if self.at_op(":") {
            None
        } else {
            let e = self.parse_test()?;
            if !self.at_op(":") {
                return Ok(e);
            }
            Some(Box::new(e))
        };
        self.expect_op(":")?;
        let bound_end = |p: &Self| p.at_op(":") || p.at_op("]") || p.at_op(",");
        let upper = if bound_end(self) {
            None
        } else {
            Some(Box::new(self.parse_test()?))
        };
        let step = if self.eat_op(":") && !(self.at_op("]") || self.at_op(",")) {
            Some(Box::new(self.parse_test()?))
        } else {
            None
        };
        Ok(Expr {
            kind: ExprKind::Slice { lower, upper, step },
            span,
        })
    }

    fn parse_comp_for(&mut self) -> ParseResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        loop {
            if self.at_kw(Keyword::Async) {
                return Err(SyntaxError::new(
                    "asynchronous comprehensions are not supported",
                    self.span(),
                ));
            }
            if !self.eat_kw(Keyword::For) {
                break;
            }
            let target = self.parse_target_list()?;
            self.expect_kw(Keyword::In)?;
            let iter = self.parse_or_test()?;
            let mut ifs = Vec::new();
            while self.eat_kw(Keyword::If) {
                ifs.push(self.parse_or_test()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn parse_atom(&mut self) -> ParseResult<Expr> {
        let tok = self.peek().clone();
        let span = tok.span;
        let kind = match tok.kind {
            TokenKind::Name(name) => {
                self.advance();
                ExprKind::Name(name)
            }
            TokenKind::Int(v) => {
                self.advance();
                ExprKind::Constant(Constant::Int(v))
            }
            TokenKind::Float(v) => {
                self.advance();
                ExprKind::Constant(Constant::Float(v))
            }
            TokenKind::Str(first) => {
                self.advance();
                let mut text = first;
                while let TokenKind::Str(next) = &self.peek().kind {
                    text.push_str(next);
                    self.advance();
                }
                ExprKind::Constant(Constant::Str(text))
            }
            TokenKind::Keyword(Keyword::None) => {
                self.advance();
                ExprKind::Constant(Constant::None)
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                ExprKind::Constant(Constant::Bool(true))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                ExprKind::Constant(Constant::Bool(false))
            }
            TokenKind::Op("...") => {
                self.advance();
                ExprKind::Constant(Constant::Ellipsis)
            }
            TokenKind::Op("(") => {
                self.advance();
                return self.nested(|p| p.parse_paren(span));
            }
            TokenKind::Op("[") => {
                self.advance();
                return self.nested(|p| p.parse_list_display(span));
            }
            TokenKind::Op("{") => {
                self.advance();
                return self.nested(|p| p.parse_brace_display(span));
            }
            TokenKind::Op("*") => {
                return Err(SyntaxError::new(
                    "starred expressions are not supported",
                    span,
                ));
            }
            _ => return Err(self.unexpected("an expression")),
        };
        Ok(Expr { kind, span })
    }

    fn parse_paren(&mut self, span: Span) -> ParseResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr {
                kind: ExprKind::Tuple(Vec::new()),
                span,
            });
        }
        if self.at_kw(Keyword::Yield) {
            let y = self.parse_yield()?;
            self.expect_op(")")?;
            return Ok(y);
        }
        let first = self.parse_test()?;
        if self.at_kw(Keyword::For) {
            let generators = self.parse_comp_for()?;
            self.expect_op(")")?;
            return Ok(Expr {
                kind: ExprKind::GeneratorExp {
                    elt: Box::new(first),
                    generators,
                },
                span,
            });
        }
        if !self.at_op(",") {
            self.expect_op(")")?;
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op(")") {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect_op(")")?;
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            span,
        })
    }

    fn parse_list_display(&mut self, span: Span) -> ParseResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr {
                kind: ExprKind::List(Vec::new()),
                span,
            });
        }
        let first = self.parse_test()?;
        if self.at_kw(Keyword::For) {
            let generators = self.parse_comp_for()?;
            self.expect_op("]")?;
            return Ok(Expr {
                kind: ExprKind::ListComp {
                    elt: Box::new(first),
                    generators,
                },
                span,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect_op("]")?;
        Ok(Expr {
            kind: ExprKind::List(items),
            span,
        })
    }

    fn parse_brace_display(&mut self, span: Span) -> ParseResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr {
                kind: ExprKind::Dict(Vec::new()),
                span,
            });
        }
        if self.at_op("**") {
            return Err(SyntaxError::new(
                "dict unpacking is not supported",
                self.span(),
            ));
        }
        let first = self.parse_test()?;
        if self.eat_op(":") {
            let value = self.parse_test()?;
            if self.at_kw(Keyword::For) {
                let generators = self.parse_comp_for()?;
                self.expect_op("}")?;
                return Ok(Expr {
                    kind: ExprKind::DictComp {
                        key: Box::new(first),
                        value: Box::new(value),
                        generators,
                    },
                    span,
                });
            }
            let mut pairs = vec![(first, value)];
            while self.eat_op(",") {
                if self.at_op("}") {
                    break;
                }
                if self.at_op("**") {
                    return Err(SyntaxError::new(
                        "dict unpacking is not supported",
                        self.span(),
                    ));
                }
                let k = self.parse_test()?;
                self.expect_op(":")?;
                let v = self.parse_test()?;
                pairs.push((k, v));
            }
            self.expect_op("}")?;
            return Ok(Expr {
                kind: ExprKind::Dict(pairs),
                span,
            });
        }
        if self.at_kw(Keyword::For) {
            let generators = self.parse_comp_for()?;
            self.expect_op("}")?;
            return Ok(Expr {
                kind: ExprKind::SetComp {
                    elt: Box::new(first),
                    generators,
                },
                span,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect_op("}")?;
        Ok(Expr {
            kind: ExprKind::Set(items),
            span,
        })
    }
}

fn validate_target(expr: &Expr) -> ParseResult<()> {
    match &expr.kind {
        ExprKind::Name(_) | ExprKind::Subscript { .. } | ExprKind::Attribute { .. } => Ok(()),
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            items.iter().try_for_each(validate_target)
        }
        other => Err(SyntaxError::new(
            format!("cannot assign to {}", other.name()),
            expr.span,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_stmt(src: &str) -> StmtKind {
        parse(src).unwrap().body.remove(0).kind
    }

    #[test]
    fn test_parses_assignment_and_binop_precedence() {
        let StmtKind::Assign { targets, value } = first_stmt("x = 1 + 2 * 3\n") else {
            panic!("expected assignment");
        };
        assert_eq!(targets.len(), 1);
        let ExprKind::BinOp { op, right, .. } = value.kind else {
            panic!("expected binop");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(
            right.kind,
            ExprKind::BinOp {
                op: BinaryOp::Mult,
                ..
            }
        ));
    }

    #[test]
    fn test_power_is_right_associative_and_binds_tighter_than_unary() {
        let StmtKind::Expr(e) = first_stmt("-2 ** 2") else {
            panic!("expected expr");
        };
        let ExprKind::UnaryOp { op, operand } = e.kind else {
            panic!("expected unary");
        };
        assert_eq!(op, UnaryOp::Neg);
        assert!(matches!(
            operand.kind,
            ExprKind::BinOp {
                op: BinaryOp::Pow,
                ..
            }
        ));
    }

    #[test]
    fn test_parses_compound_statements() {
        let src = "\
for i in range(3):
    if i == 1:
        continue
    elif i > 1:
        break
    else:
        pass
else:
    done = True
";
        let StmtKind::For { body, orelse, .. } = first_stmt(src) else {
            panic!("expected for");
        };
        assert_eq!(body.len(), 1);
        assert_eq!(orelse.len(), 1);
        let StmtKind::If { orelse, .. } = &body[0].kind else {
            panic!("expected if");
        };
        assert!(matches!(orelse[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn test_parses_function_with_defaults() {
        let StmtKind::FunctionDef(def) = first_stmt("def f(a, b=2):\n    return a + b\n") else {
            panic!("expected def");
        };
        assert_eq!(def.name, "f");
        assert_eq!(def.params.len(), 2);
        assert!(def.params[1].default.is_some());
    }

    #[test]
    fn test_parses_try_handlers() {
        let src = "try:\n    x = 1\nexcept (KeyError, ValueError) as e:\n    x = 2\nfinally:\n    y = 3\n";
        let StmtKind::Try {
            handlers,
            finalbody,
            ..
        } = first_stmt(src)
        else {
            panic!("expected try");
        };
        assert_eq!(handlers[0].types, vec!["KeyError", "ValueError"]);
        assert_eq!(handlers[0].bind.as_deref(), Some("e"));
        assert_eq!(finalbody.len(), 1);
    }

    #[test]
    fn test_parses_comprehensions_and_displays() {
        let StmtKind::Expr(e) = first_stmt("[x * 2 for x in range(3) if x]") else {
            panic!();
        };
        assert!(matches!(e.kind, ExprKind::ListComp { .. }));
        let StmtKind::Expr(e) = first_stmt("{k: v for k, v in pairs}") else {
            panic!();
        };
        assert!(matches!(e.kind, ExprKind::DictComp { .. }));
        let StmtKind::Expr(e) = first_stmt("{1, 2}") else {
            panic!();
        };
        assert!(matches!(e.kind, ExprKind::Set(_)));
        let StmtKind::Expr(e) = first_stmt("sum(x for x in xs)") else {
            panic!();
        };
        let ExprKind::Call { args, .. } = e.kind else {
            panic!();
        };
        assert!(matches!(args[0].kind, ExprKind::GeneratorExp { .. }));
    }

    #[test]
    fn test_parses_calls_with_keywords() {
        let StmtKind::Expr(e) = first_stmt("print(1, 2, sep='-')") else {
            panic!();
        };
        let ExprKind::Call { args, keywords, .. } = e.kind else {
            panic!();
        };
        assert_eq!(args.len(), 2);
        assert_eq!(keywords[0].name, "sep");
    }

    #[test]
    fn test_parses_slices() {
        let StmtKind::Expr(e) = first_stmt("a[1:10:2]") else {
            panic!();
        };
        let ExprKind::Subscript { index, .. } = e.kind else {
            panic!();
        };
        assert!(matches!(
            index.kind,
            ExprKind::Slice {
                lower: Some(_),
                upper: Some(_),
                step: Some(_)
            }
        ));
    }

    #[test]
    fn test_parses_rejected_statements_for_checker() {
        assert!(matches!(first_stmt("import os"), StmtKind::Import { .. }));
        assert!(matches!(
            first_stmt("from os import path"),
            StmtKind::ImportFrom { .. }
        ));
        assert!(matches!(first_stmt("global x"), StmtKind::Global(_)));
        assert!(matches!(first_stmt("raise"), StmtKind::Raise(None)));
        assert!(matches!(
            first_stmt("async def f():\n    pass\n"),
            StmtKind::Async(_)
        ));
    }

    #[test]
    fn test_chained_assignment_and_unpacking() {
        let StmtKind::Assign { targets, .. } = first_stmt("a = b = 1") else {
            panic!();
        };
        assert_eq!(targets.len(), 2);
        let StmtKind::Assign { targets, .. } = first_stmt("a, b = 1, 2") else {
            panic!();
        };
        assert!(matches!(targets[0].kind, ExprKind::Tuple(_)));
    }

    #[test]
    fn test_invalid_targets_rejected() {
        let err = parse("1 = x").unwrap_err();
        assert!(err.message.contains("cannot assign"));
        let err = parse("f() += 1").unwrap_err();
        assert!(err.message.contains("augmented assignment"));
    }

    #[test]
    fn test_syntax_error_location() {
        let err = parse("x = (1,\ny = 2\n").unwrap_err();
        assert_eq!(err.span.line, 2);
    }

    #[test]
    fn test_deep_nesting_is_rejected_not_overflowing() {
        let src = format!("x = {}1{}", "(".repeat(500), ")".repeat(500));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nested"));
    }

    #[test]
    fn test_long_operator_chain_is_rejected_not_overflowing() {
        let src = format!("x = 1{}\n", " + 1".repeat(5000));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nested"), "{}", err.message);

        let src = format!("x = a{}\n", ".b".repeat(5000));
        assert!(parse(&src).is_err());
        let src = format!("x = f{}\n", "()".repeat(5000));
        assert!(parse(&src).is_err());
        let src = format!("x = a{}\n", "[0]".repeat(5000));
        assert!(parse(&src).is_err());
    }

    #[test]
    fn test_short_chains_still_parse() {
        let module = parse(&format!("x = 1{}\n", " + 1".repeat(40))).unwrap();
        assert_eq!(module.body.len(), 1);
        parse("y = a.b.c(1)[0].d(2, 3)\nz = a and b and c or d\n").unwrap();
        // flat chains build one node, not a nested tree
        parse(&format!("z = a{}\n", " and a".repeat(5000))).unwrap();
        parse(&format!("z = a{}\n", " < a".repeat(5000))).unwrap();
    }

    #[test]
    fn test_node_count_grows_with_program() {
        let small = parse("x = 1").unwrap().node_count();
        let large = parse("x = [1, 2, 3, 4]").unwrap().node_count();
        assert_eq!(small, 4);
        assert!(large > small);
    }
}
