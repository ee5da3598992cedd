//! Syntax tree for the script language.
//!
//! Function and lambda bodies are reference counted so evaluated closures can
//! hold on to them without borrowing the whole module.

use std::rc::Rc;

use crate::span::Span;

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    /// `a = b = value`; each target receives the same value.
    Assign {
        targets: Vec<Expr>,
        value: Expr,
    },
    AugAssign {
        target: Expr,
        op: BinaryOp,
        value: Expr,
    },
    Pass,
    Break,
    Continue,
    Return(Option<Expr>),
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    FunctionDef(Rc<FunctionDef>),
    ClassDef {
        name: String,
        body: Vec<Stmt>,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
    With {
        items: Vec<WithItem>,
        body: Vec<Stmt>,
    },
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    Import {
        names: Vec<String>,
    },
    ImportFrom {
        module: String,
        names: Vec<String>,
    },
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    Delete(Vec<Expr>),
    Raise(Option<Expr>),
    /// `async def`, `async for` or `async with`.
    Async(Box<Stmt>),
}

impl StmtKind {
    /// Node kind name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            StmtKind::Expr(_) => "Expr",
            StmtKind::Assign { .. } => "Assign",
            StmtKind::AugAssign { .. } => "AugAssign",
            StmtKind::Pass => "Pass",
            StmtKind::Break => "Break",
            StmtKind::Continue => "Continue",
            StmtKind::Return(_) => "Return",
            StmtKind::If { .. } => "If",
            StmtKind::While { .. } => "While",
            StmtKind::For { .. } => "For",
            StmtKind::FunctionDef(_) => "FunctionDef",
            StmtKind::ClassDef { .. } => "ClassDef",
            StmtKind::Try { .. } => "Try",
            StmtKind::With { .. } => "With",
            StmtKind::Assert { .. } => "Assert",
            StmtKind::Import { .. } => "Import",
            StmtKind::ImportFrom { .. } => "ImportFrom",
            StmtKind::Global(_) => "Global",
            StmtKind::Nonlocal(_) => "Nonlocal",
            StmtKind::Delete(_) => "Delete",
            StmtKind::Raise(_) => "Raise",
            StmtKind::Async(inner) => match inner.kind {
                StmtKind::For { .. } => "AsyncFor",
                StmtKind::With { .. } => "AsyncWith",
                _ => "AsyncFunctionDef",
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<Param>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    /// Exception type names; empty for a bare `except:`.
    pub types: Vec<String>,
    pub bind: Option<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithItem {
    pub context: Expr,
    pub target: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ellipsis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mult => "*",
            BinaryOp::MatMult => "@",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::LShift => "<<",
            BinaryOp::RShift => ">>",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAnd => "&",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordArg {
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Name(String),
    Constant(Constant),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Set(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    BoolOp {
        op: BoolOp,
        values: Vec<Expr>,
    },
    BinOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<CmpOp>,
        comparators: Vec<Expr>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Lambda(Rc<Lambda>),
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<KeywordArg>,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    ListComp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    SetComp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    GeneratorExp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    Yield(Option<Box<Expr>>),
    Await(Box<Expr>),
}

impl ExprKind {
    /// Node kind name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Name(_) => "Name",
            ExprKind::Constant(_) => "Constant",
            ExprKind::List(_) => "List",
            ExprKind::Tuple(_) => "Tuple",
            ExprKind::Set(_) => "Set",
            ExprKind::Dict(_) => "Dict",
            ExprKind::BoolOp { .. } => "BoolOp",
            ExprKind::BinOp { .. } => "BinOp",
            ExprKind::UnaryOp { .. } => "UnaryOp",
            ExprKind::Compare { .. } => "Compare",
            ExprKind::IfExp { .. } => "IfExp",
            ExprKind::Lambda(_) => "Lambda",
            ExprKind::Call { .. } => "Call",
            ExprKind::Attribute { .. } => "Attribute",
            ExprKind::Subscript { .. } => "Subscript",
            ExprKind::Slice { .. } => "Slice",
            ExprKind::ListComp { .. } => "ListComp",
            ExprKind::SetComp { .. } => "SetComp",
            ExprKind::GeneratorExp { .. } => "GeneratorExp",
            ExprKind::DictComp { .. } => "DictComp",
            ExprKind::Yield(_) => "Yield",
            ExprKind::Await(_) => "Await",
        }
    }
}

/// Read-only traversal over the tree. Override a method and call the
/// matching `walk_*` function to keep descending.
pub trait Visitor {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }

    fn visit_param(&mut self, param: &Param) {
        if let Some(default) = &param.default {
            self.visit_expr(default);
        }
    }

    fn visit_handler(&mut self, handler: &ExceptHandler) {
        for stmt in &handler.body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_comprehension(&mut self, comp: &Comprehension) {
        self.visit_expr(&comp.target);
        self.visit_expr(&comp.iter);
        for cond in &comp.ifs {
            self.visit_expr(cond);
        }
    }

    fn visit_keyword(&mut self, keyword: &KeywordArg) {
        self.visit_expr(&keyword.value);
    }
}

pub fn walk_body<V: Visitor + ?Sized>(visitor: &mut V, body: &[Stmt]) {
    for stmt in body {
        visitor.visit_stmt(stmt);
    }
}

pub fn walk_stmt<V: Visitor + ?Sized>(visitor: &mut V, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Expr(e) => visitor.visit_expr(e),
        StmtKind::Assign { targets, value } => {
            for t in targets {
                visitor.visit_expr(t);
            }
            visitor.visit_expr(value);
        }
        StmtKind::AugAssign { target, value, .. } => {
            visitor.visit_expr(target);
            visitor.visit_expr(value);
        }
        StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Import { .. }
        | StmtKind::ImportFrom { .. }
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_) => {}
        StmtKind::Return(value) | StmtKind::Raise(value) => {
            if let Some(v) = value {
                visitor.visit_expr(v);
            }
        }
        StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
            visitor.visit_expr(test);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
        } => {
            visitor.visit_expr(target);
            visitor.visit_expr(iter);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        StmtKind::FunctionDef(def) => {
            for p in &def.params {
                visitor.visit_param(p);
            }
            walk_body(visitor, &def.body);
        }
        StmtKind::ClassDef { body, .. } => walk_body(visitor, body),
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            walk_body(visitor, body);
            for h in handlers {
                visitor.visit_handler(h);
            }
            walk_body(visitor, orelse);
            walk_body(visitor, finalbody);
        }
        StmtKind::With { items, body } => {
            for item in items {
                visitor.visit_expr(&item.context);
                if let Some(t) = &item.target {
                    visitor.visit_expr(t);
                }
            }
            walk_body(visitor, body);
        }
        StmtKind::Assert { test, msg } => {
            visitor.visit_expr(test);
            if let Some(m) = msg {
                visitor.visit_expr(m);
            }
        }
        StmtKind::Delete(targets) => {
            for t in targets {
                visitor.visit_expr(t);
            }
        }
        StmtKind::Async(inner) => visitor.visit_stmt(inner),
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    match &expr.kind {
        ExprKind::Name(_) | ExprKind::Constant(_) => {}
        ExprKind::List(items) | ExprKind::Tuple(items) | ExprKind::Set(items) => {
            for e in items {
                visitor.visit_expr(e);
            }
        }
        ExprKind::Dict(pairs) => {
            for (k, v) in pairs {
                visitor.visit_expr(k);
                visitor.visit_expr(v);
            }
        }
        ExprKind::BoolOp { values, .. } => {
            for v in values {
                visitor.visit_expr(v);
            }
        }
        ExprKind::BinOp { left, right, .. } => {
            visitor.visit_expr(left);
            visitor.visit_expr(right);
        }
        ExprKind::UnaryOp { operand, .. } => visitor.visit_expr(operand),
        ExprKind::Compare {
            left, comparators, ..
        } => {
            visitor.visit_expr(left);
            for c in comparators {
                visitor.visit_expr(c);
            }
        }
        ExprKind::IfExp { test, body, orelse } => {
            visitor.visit_expr(test);
            visitor.visit_expr(body);
            visitor.visit_expr(orelse);
        }
        ExprKind::Lambda(lambda) => {
            for p in &lambda.params {
                visitor.visit_param(p);
            }
            visitor.visit_expr(&lambda.body);
        }
        ExprKind::Call {
            func,
            args,
            keywords,
        } => {
            visitor.visit_expr(func);
            for a in args {
                visitor.visit_expr(a);
            }
            for k in keywords {
                visitor.visit_keyword(k);
            }
        }
        ExprKind::Attribute { value, .. } => visitor.visit_expr(value),
        ExprKind::Subscript { value, index } => {
            visitor.visit_expr(value);
            visitor.visit_expr(index);
        }
        ExprKind::Slice { lower, upper, step } => {
            for part in [lower, upper, step].into_iter().flatten() {
                visitor.visit_expr(part);
            }
        }
        ExprKind::ListComp { elt, generators }
        | ExprKind::SetComp { elt, generators }
        | ExprKind::GeneratorExp { elt, generators } => {
            for g in generators {
                visitor.visit_comprehension(g);
            }
            visitor.visit_expr(elt);
        }
        ExprKind::DictComp {
            key,
            value,
            generators,
        } => {
            for g in generators {
                visitor.visit_comprehension(g);
            }
            visitor.visit_expr(key);
            visitor.visit_expr(value);
        }
        ExprKind::Yield(value) => {
            if let Some(v) = value {
                visitor.visit_expr(v);
            }
        }
        ExprKind::Await(value) => visitor.visit_expr(value),
    }
}

struct NodeCounter {
    count: usize,
}

impl Visitor for NodeCounter {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        self.count += 1;
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        self.count += 1;
        walk_expr(self, expr);
    }

    fn visit_param(&mut self, param: &Param) {
        self.count += 1;
        if let Some(default) = &param.default {
            self.visit_expr(default);
        }
    }

    fn visit_handler(&mut self, handler: &ExceptHandler) {
        self.count += 1;
        walk_body(self, &handler.body);
    }

    fn visit_comprehension(&mut self, comp: &Comprehension) {
        self.count += 1;
        self.visit_expr(&comp.target);
        self.visit_expr(&comp.iter);
        for cond in &comp.ifs {
            self.visit_expr(cond);
        }
    }

    fn visit_keyword(&mut self, keyword: &KeywordArg) {
        self.count += 1;
        self.visit_expr(&keyword.value);
    }
}

impl Module {
    /// Total number of nodes, counting the module itself.
    pub fn node_count(&self) -> usize {
        let mut counter = NodeCounter { count: 1 };
        walk_body(&mut counter, &self.body);
        counter.count
    }
}
