//! Static policy checker.
//!
//! Rejects disallowed syntax before anything runs. The first violation
//! aborts with the node kind and its location. Work is linear in the size of
//! the tree: one counting pass, one binding pass, one rule pass.

use std::collections::{BTreeSet, HashSet};

use cordon_script::ast::{
    walk_expr, walk_stmt, Comprehension, Constant, ExceptHandler, Expr, ExprKind, KeywordArg,
    Module, Param, Stmt, StmtKind, UnaryOp, Visitor,
};
use cordon_script::{parse, Span};

use crate::error::{Result, SandboxError};
use crate::policy::{Policy, INPUT_NAME};

/// Outcome of a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub ast_nodes: usize,
}

/// Names pre-declared by the inputs of an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputBindings {
    pub names: BTreeSet<String>,
    /// Inputs whose values are arrays, usable as loop iterables.
    pub iterable_names: BTreeSet<String>,
}

impl InputBindings {
    pub fn from_inputs(inputs: Option<&serde_json::Value>) -> Self {
        let mut bindings = Self::default();
        match inputs {
            None => {}
            Some(serde_json::Value::Object(map)) => {
                for (key, value) in map {
                    bindings.names.insert(key.clone());
                    if value.is_array() {
                        bindings.iterable_names.insert(key.clone());
                    }
                }
            }
            Some(other) => {
                bindings.names.insert(INPUT_NAME.to_string());
                if other.is_array() {
                    bindings.iterable_names.insert(INPUT_NAME.to_string());
                }
            }
        }
        bindings
    }
}

/// Parse `source` and check it against `policy`.
pub fn check(source: &str, policy: &Policy, inputs: &InputBindings) -> Result<CheckReport> {
    let module = parse(source)?;
    check_module(&module, policy, inputs)
}

/// Check an already parsed module.
pub fn check_module(module: &Module, policy: &Policy, inputs: &InputBindings) -> Result<CheckReport> {
    let mut budget = NodeBudget {
        count: 1,
        limit: policy.max_ast_nodes,
        overflow: None,
    };
    cordon_script::ast::walk_body(&mut budget, &module.body);
    if let Some((node, span)) = budget.overflow {
        return Err(SandboxError::policy(node, "AST node limit exceeded", span));
    }

    let mut bound = BindingCollector {
        names: inputs.names.iter().cloned().collect(),
    };
    cordon_script::ast::walk_body(&mut bound, &module.body);

    let mut checker = Checker {
        policy,
        bound: bound.names,
        iter_names: inputs.iterable_names.iter().cloned().collect(),
        loop_depth: 0,
        comp_depth: 0,
    };
    checker.check_body(&module.body, false)?;
    Ok(CheckReport {
        ast_nodes: budget.count,
    })
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

struct NodeBudget {
    count: usize,
    limit: usize,
    overflow: Option<(&'static str, Span)>,
}

impl NodeBudget {
    fn tick(&mut self, node: &'static str, span: Span) {
        self.count += 1;
        if self.count > self.limit && self.overflow.is_none() {
            self.overflow = Some((node, span));
        }
    }
}

impl Visitor for NodeBudget {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        self.tick(stmt.kind.name(), stmt.span);
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        self.tick(expr.kind.name(), expr.span);
        walk_expr(self, expr);
    }

    fn visit_param(&mut self, param: &Param) {
        self.tick("arg", param.span);
        if let Some(default) = &param.default {
            self.visit_expr(default);
        }
    }

    fn visit_handler(&mut self, handler: &ExceptHandler) {
        self.tick("ExceptHandler", handler.span);
        cordon_script::ast::walk_body(self, &handler.body);
    }

    fn visit_comprehension(&mut self, comp: &Comprehension) {
        self.tick("comprehension", comp.target.span);
        self.visit_expr(&comp.target);
        self.visit_expr(&comp.iter);
        for cond in &comp.ifs {
            self.visit_expr(cond);
        }
    }

    fn visit_keyword(&mut self, keyword: &KeywordArg) {
        self.tick("keyword", keyword.value.span);
        self.visit_expr(&keyword.value);
    }
}

/// Collects every name bound anywhere in the program.
struct BindingCollector {
    names: HashSet<String>,
}

impl BindingCollector {
    fn bind_target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name(n) => {
                self.names.insert(n.clone());
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.bind_target(item);
                }
            }
            _ => {}
        }
    }
}

impl Visitor for BindingCollector {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                for t in targets {
                    self.bind_target(t);
                }
            }
            StmtKind::AugAssign { target, .. } => self.bind_target(target),
            StmtKind::For { target, .. } => self.bind_target(target),
            StmtKind::FunctionDef(def) => {
                self.names.insert(def.name.clone());
            }
            StmtKind::ClassDef { name, .. } => {
                self.names.insert(name.clone());
            }
            StmtKind::With { items, .. } => {
                for item in items {
                    if let Some(t) = &item.target {
                        self.bind_target(t);
                    }
                }
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_param(&mut self, param: &Param) {
        self.names.insert(param.name.clone());
        if let Some(default) = &param.default {
            self.visit_expr(default);
        }
    }

    fn visit_handler(&mut self, handler: &ExceptHandler) {
        if let Some(bind) = &handler.bind {
            self.names.insert(bind.clone());
        }
        cordon_script::ast::walk_body(self, &handler.body);
    }

    fn visit_comprehension(&mut self, comp: &Comprehension) {
        self.bind_target(&comp.target);
        self.visit_expr(&comp.iter);
        for cond in &comp.ifs {
            self.visit_expr(cond);
        }
    }
}

struct Checker<'p> {
    policy: &'p Policy,
    bound: HashSet<String>,
    iter_names: HashSet<String>,
    loop_depth: usize,
    comp_depth: usize,
}

impl<'p> Checker<'p> {
    fn deny<T>(&self, node: &str, message: impl Into<String>, span: Span) -> Result<T> {
        Err(SandboxError::policy(node, message, span))
    }

    fn check_body(&mut self, body: &[Stmt], class_body: bool) -> Result<()> {
        for stmt in body {
            self.check_stmt(stmt, class_body)?;
        }
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &Stmt, class_body: bool) -> Result<()> {
        let p = self.policy;
        let node = stmt.kind.name();
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Import { .. } | StmtKind::ImportFrom { .. } => {
                self.deny(node, "import is not allowed", span)
            }
            StmtKind::Global(_) => self.deny(node, "global is not allowed", span),
            StmtKind::Nonlocal(_) => self.deny(node, "nonlocal is not allowed", span),
            StmtKind::Delete(_) => self.deny(node, "del is not allowed", span),
            StmtKind::Raise(_) => self.deny(node, "raise is not allowed", span),
            StmtKind::Async(_) => self.deny(node, "async is not allowed", span),
            StmtKind::FunctionDef(def) => {
                if !p.allow_def {
                    return self.deny(node, "def is not allowed", span);
                }
                if is_dunder(&def.name) && !(class_body && def.name == "__init__") {
                    return self.deny(node, "dunder names are not allowed", span);
                }
                self.check_params(&def.params)?;
                self.check_body(&def.body, false)
            }
            StmtKind::ClassDef { name, body } => {
                if !p.allow_class {
                    return self.deny(node, "class is not allowed", span);
                }
                if is_dunder(name) {
                    return self.deny(node, "dunder names are not allowed", span);
                }
                self.check_body(body, true)
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                if !p.allow_try {
                    return self.deny(node, "try/except is not allowed", span);
                }
                self.check_body(body, false)?;
                for h in handlers {
                    if let Some(bind) = &h.bind {
                        if is_dunder(bind) {
                            return self.deny("ExceptHandler", "dunder names are not allowed", h.span);
                        }
                    }
                    self.check_body(&h.body, false)?;
                }
                self.check_body(orelse, false)?;
                self.check_body(finalbody, false)
            }
            StmtKind::With { items, body } => {
                if !p.allow_with {
                    return self.deny(node, "with is not allowed", span);
                }
                for item in items {
                    self.check_expr(&item.context)?;
                    if let Some(t) = &item.target {
                        self.check_target(t)?;
                    }
                }
                self.check_body(body, false)
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                if !p.allow_loops {
                    return self.deny(node, "loops are not allowed", span);
                }
                if p.restrict_loop_iterables && !self.is_allowed_iter(iter) {
                    return self.deny(node, "loop iterable is not allowed", span);
                }
                self.loop_depth += 1;
                if self.loop_depth > p.max_loop_nesting {
                    return self.deny(node, "loop nesting too deep", span);
                }
                self.check_target(target)?;
                self.check_expr(iter)?;
                self.check_body(body, false)?;
                self.check_body(orelse, false)?;
                self.loop_depth -= 1;
                Ok(())
            }
            StmtKind::While { test, body, orelse } => {
                if !p.allow_loops {
                    return self.deny(node, "loops are not allowed", span);
                }
                self.loop_depth += 1;
                if self.loop_depth > p.max_loop_nesting {
                    return self.deny(node, "loop nesting too deep", span);
                }
                self.check_expr(test)?;
                self.check_body(body, false)?;
                self.check_body(orelse, false)?;
                self.loop_depth -= 1;
                Ok(())
            }
            StmtKind::If { test, body, orelse } => {
                self.check_expr(test)?;
                self.check_body(body, false)?;
                self.check_body(orelse, false)
            }
            StmtKind::Assign { targets, value } => {
                if let [Expr {
                    kind: ExprKind::Name(name),
                    ..
                }] = targets.as_slice()
                {
                    if self.is_allowed_iter(value) {
                        self.iter_names.insert(name.clone());
                    } else {
                        self.iter_names.remove(name);
                    }
                }
                for t in targets {
                    self.check_target(t)?;
                }
                self.check_expr(value)
            }
            StmtKind::AugAssign { target, value, .. } => {
                if let ExprKind::Name(name) = &target.kind {
                    self.check_name(name, false, target.span)?;
                }
                self.check_target(target)?;
                self.check_expr(value)
            }
            StmtKind::Expr(e) => self.check_expr(e),
            StmtKind::Return(value) => match value {
                Some(v) => self.check_expr(v),
                None => Ok(()),
            },
            StmtKind::Assert { test, msg } => {
                self.check_expr(test)?;
                if let Some(m) = msg {
                    self.check_expr(m)?;
                }
                Ok(())
            }
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => Ok(()),
        }
    }

    fn check_params(&mut self, params: &[Param]) -> Result<()> {
        for param in params {
            if is_dunder(&param.name) {
                return self.deny("arg", "dunder names are not allowed", param.span);
            }
            if let Some(default) = &param.default {
                self.check_expr(default)?;
            }
        }
        Ok(())
    }

    /// Store-context rules: reserved names may be assigned.
    fn check_target(&mut self, target: &Expr) -> Result<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                if is_dunder(name) && !self.policy.reserved_names.contains(name) {
                    return self.deny("Name", "dunder names are not allowed", target.span);
                }
                Ok(())
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.check_target(item)?;
                }
                Ok(())
            }
            ExprKind::Subscript { value, index } => {
                if !self.policy.allow_subscript {
                    return self.deny("Subscript", "subscript is not allowed", target.span);
                }
                self.check_expr(value)?;
                self.check_expr(index)
            }
            ExprKind::Attribute { .. } => self.check_attribute(target),
            _ => self.check_expr(target),
        }
    }

    /// Load-context identifier rule.
    fn check_name(&self, name: &str, call: bool, span: Span) -> Result<()> {
        let p = self.policy;
        if p.reserved_names.contains(name) {
            return self.deny("Name", format!("reserved name '{name}' cannot be read"), span);
        }
        if is_dunder(name) {
            return self.deny("Name", "dunder names are not allowed", span);
        }
        if self.bound.contains(name) {
            return Ok(());
        }
        if call {
            if p.call_name_allowlist.contains(name) {
                return Ok(());
            }
            return self.deny("Call", format!("call '{name}' is not allowed"), span);
        }
        if p.builtin_allowlist.contains(name) {
            return Ok(());
        }
        self.deny("Name", format!("name '{name}' is not allowed"), span)
    }

    fn check_attribute(&mut self, expr: &Expr) -> Result<()> {
        let ExprKind::Attribute { value, attr } = &expr.kind else {
            return Ok(());
        };
        if attr.starts_with("__") {
            return self.deny("Attribute", "dunder attribute is not allowed", expr.span);
        }
        let ExprKind::Name(root) = &value.kind else {
            return self.deny(
                "Attribute",
                "only root.attr attribute access is allowed",
                expr.span,
            );
        };
        let allowed = self
            .policy
            .attr_allowlist
            .get(root)
            .is_some_and(|attrs| attrs.contains(attr));
        if !allowed {
            return self.deny(
                "Attribute",
                format!("attribute '{root}.{attr}' is not allowed"),
                expr.span,
            );
        }
        Ok(())
    }

    fn check_exprs(&mut self, exprs: &[Expr]) -> Result<()> {
        for e in exprs {
            self.check_expr(e)?;
        }
        Ok(())
    }

    fn check_expr(&mut self, expr: &Expr) -> Result<()> {
        let p = self.policy;
        let node = expr.kind.name();
        let span = expr.span;
        match &expr.kind {
            ExprKind::Name(name) => self.check_name(name, false, span),
            ExprKind::Constant(_) => Ok(()),
            ExprKind::List(items) | ExprKind::Tuple(items) | ExprKind::Set(items) => {
                if items.len() > p.max_literal_elems {
                    return self.deny(node, "literal too large", span);
                }
                self.check_exprs(items)
            }
            ExprKind::Dict(pairs) => {
                if pairs.len() > p.max_literal_elems {
                    return self.deny(node, "literal too large", span);
                }
                for (k, v) in pairs {
                    self.check_expr(k)?;
                    self.check_expr(v)?;
                }
                Ok(())
            }
            ExprKind::BoolOp { values, .. } => self.check_exprs(values),
            ExprKind::BinOp { left, op, right } => {
                if *op == cordon_script::ast::BinaryOp::Mult {
                    let limit = i128::from(p.max_const_alloc_elems);
                    let pairs = [(left, right), (right, left)];
                    for (seq, count) in pairs {
                        if let (Some(len), Some(n)) = (const_len(seq), const_int(count, limit)) {
                            if len.saturating_mul(n) > limit {
                                return self.deny(node, "suspicious constant allocation", span);
                            }
                        }
                    }
                }
                self.check_expr(left)?;
                self.check_expr(right)
            }
            ExprKind::UnaryOp { operand, .. } => self.check_expr(operand),
            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.check_expr(left)?;
                self.check_exprs(comparators)
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.check_expr(test)?;
                self.check_expr(body)?;
                self.check_expr(orelse)
            }
            ExprKind::Lambda(lambda) => {
                if !p.allow_lambda {
                    return self.deny(node, "lambda is not allowed", span);
                }
                self.check_params(&lambda.params)?;
                self.check_expr(&lambda.body)
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                match &func.kind {
                    ExprKind::Name(name) => {
                        self.check_name(name, true, func.span)?;
                        if (name == "list" || name == "tuple") && !self.bound.contains(name) {
                            let limit = i128::from(p.max_const_alloc_elems);
                            if let Some(size) = args.first().and_then(|a| range_size(a, limit)) {
                                if size > limit {
                                    return self.deny(node, "suspicious constant allocation", span);
                                }
                            }
                        }
                    }
                    ExprKind::Attribute { .. } => self.check_attribute(func)?,
                    _ => {
                        return self.deny(
                            node,
                            "only f(...) or root.attr(...) calls are allowed",
                            span,
                        )
                    }
                }
                self.check_exprs(args)?;
                for k in keywords {
                    self.check_expr(&k.value)?;
                }
                Ok(())
            }
            ExprKind::Attribute { .. } => self.check_attribute(expr),
            ExprKind::Subscript { value, index } => {
                if !p.allow_subscript {
                    return self.deny(node, "subscript is not allowed", span);
                }
                self.check_expr(value)?;
                self.check_expr(index)
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.check_expr(part)?;
                }
                Ok(())
            }
            ExprKind::ListComp { elt, generators }
            | ExprKind::SetComp { elt, generators }
            | ExprKind::GeneratorExp { elt, generators } => {
                self.check_comprehension(node, span, generators, &[elt.as_ref()])
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => self.check_comprehension(node, span, generators, &[key.as_ref(), value.as_ref()]),
            ExprKind::Yield(_) => self.deny(node, "yield is not allowed", span),
            ExprKind::Await(_) => self.deny(node, "await is not allowed", span),
        }
    }

    fn check_comprehension(
        &mut self,
        node: &str,
        span: Span,
        generators: &[Comprehension],
        elts: &[&Expr],
    ) -> Result<()> {
        let p = self.policy;
        if !p.allow_comprehension {
            return self.deny(node, "comprehension is not allowed", span);
        }
        self.comp_depth += 1;
        if self.comp_depth > p.max_comp_nesting {
            return self.deny(node, "comprehension nesting too deep", span);
        }
        if p.restrict_loop_iterables && generators.iter().any(|g| !self.is_allowed_iter(&g.iter)) {
            return self.deny(node, "comprehension iterable is not allowed", span);
        }
        for g in generators {
            self.check_target(&g.target)?;
            self.check_expr(&g.iter)?;
            self.check_exprs(&g.ifs)?;
        }
        for elt in elts {
            self.check_expr(elt)?;
        }
        self.comp_depth -= 1;
        Ok(())
    }

    fn is_allowed_iter(&self, expr: &Expr) -> bool {
        let p = self.policy;
        match &expr.kind {
            ExprKind::Name(name) if p.allow_loop_iter_names => self.iter_names.contains(name),
            ExprKind::Call { func, .. } => match &func.kind {
                ExprKind::Name(name) => p.loop_iter_allowlist.contains(name),
                _ => false,
            },
            ExprKind::List(_) | ExprKind::Tuple(_) => p.allow_loop_iter_literals,
            _ => false,
        }
    }
}

/// Fold a constant integer expression. Results that overflow or exceed
/// `huge` collapse to `huge + 1`.
fn const_int(expr: &Expr, huge: i128) -> Option<i128> {
    use cordon_script::ast::BinaryOp;
    let clamp = |v: i128| if v.abs() > huge { Some(huge + 1) } else { Some(v) };
    match &expr.kind {
        ExprKind::Constant(Constant::Int(v)) => Some(i128::from(*v)),
        ExprKind::UnaryOp { op, operand } => {
            let v = const_int(operand, huge)?;
            match op {
                UnaryOp::Pos => Some(v),
                UnaryOp::Neg => Some(-v),
                _ => None,
            }
        }
        ExprKind::BinOp { left, op, right } => {
            let a = const_int(left, huge)?;
            let b = const_int(right, huge)?;
            match op {
                BinaryOp::Add => clamp(a + b),
                BinaryOp::Sub => clamp(a - b),
                BinaryOp::Mult => clamp(a.saturating_mul(b)),
                BinaryOp::FloorDiv if b != 0 => Some(floor_div(a, b)),
                BinaryOp::Pow if b >= 0 => {
                    if a.abs() >= 2 && b > 30 {
                        return Some(huge + 1);
                    }
                    let exp = u32::try_from(b).ok()?;
                    match a.checked_pow(exp) {
                        Some(v) => clamp(v),
                        None => Some(huge + 1),
                    }
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn const_len(expr: &Expr) -> Option<i128> {
    match &expr.kind {
        ExprKind::List(items) | ExprKind::Tuple(items) => Some(items.len() as i128),
        ExprKind::Constant(Constant::Str(s)) => Some(s.chars().count() as i128),
        _ => None,
    }
}

fn floor_div(a: i128, b: i128) -> i128 {
    let q = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Element count of `range(...)` when all bounds fold to constants.
fn range_size(expr: &Expr, huge: i128) -> Option<i128> {
    let ExprKind::Call { func, args, .. } = &expr.kind else {
        return None;
    };
    if !matches!(&func.kind, ExprKind::Name(n) if n == "range") {
        return None;
    }
    match args.len() {
        1 => Some(const_int(&args[0], huge)?.max(0)),
        2 | 3 => {
            let start = const_int(&args[0], huge)?;
            let stop = const_int(&args[1], huge)?;
            let step = match args.get(2) {
                Some(s) => const_int(s, huge)?,
                None => 1,
            };
            if step == 0 {
                return None;
            }
            let adjust = if step > 0 { step - 1 } else { step + 1 };
            Some(floor_div(stop - start + adjust, step).max(0))
        }
        _ => None,
    }
}
