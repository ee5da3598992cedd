use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use cordon_script::ast::{
    BinaryOp, BoolOp, Comprehension, Constant, ExceptHandler, Expr, ExprKind, FunctionDef, Lambda, Module,
    Param, Stmt, StmtKind, UnaryOp,
};
use cordon_script::Span;

use super::builtins::Builtin;
use super::ops;
use super::scope::Scope;
use super::value::{
    BoundMethod, ClassObj, Closure, DictStore, FunctionBody, InstanceObj, Value,
};
use super::{exception_matches, EvalResult, Fault};
use crate::capability::{CallArgs, CapabilityFault, CapabilityInvoker};
use crate::error::SandboxError;
use crate::guard::{Clock, OutputStream, SandboxRng, StepCounter, StreamKind};
use crate::policy::{Policy, INPUT_NAME};
use crate::roots::{RootAttr, RootContext, RootError, RootProxy};

/// Everything the evaluator reaches outside the script itself.
pub struct ExecContext<'a> {
    pub clock: Rc<Clock>,
    pub rng: SandboxRng,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub capabilities: &'a mut dyn CapabilityInvoker,
    pub capability_names: Vec<String>,
    pub roots: Vec<Rc<RootProxy>>,
}

/// How a statement block finished.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Interpreter<'a> {
    policy: &'a Policy,
    steps: StepCounter,
    depth: usize,
    ctx: ExecContext<'a>,
    globals: Rc<Scope>,
}

impl<'a> Interpreter<'a> {
    /// Set up the base scope: allow-listed builtins, capabilities and roots.
    /// Script globals live in a child of it.
    pub fn new(policy: &'a Policy, ctx: ExecContext<'a>) -> Self {
        let base = Scope::root();
        for name in policy
            .builtin_allowlist
            .iter()
            .chain(policy.call_name_allowlist.iter())
        {
            if let Some(b) = Builtin::from_name(name) {
                base.set(name, Value::Builtin(b));
            }
        }
        for name in &ctx.capability_names {
            base.set(name, Value::Capability(Rc::from(name.as_str())));
        }
        for root in &ctx.roots {
            base.set(root.name(), Value::Root(root.clone()));
        }
        let globals = Scope::child(&base);
        Self {
            policy,
            steps: StepCounter::new(policy.max_steps),
            depth: 0,
            ctx,
            globals,
        }
    }

    /// Bind execution inputs as frozen values. A mapping binds each key;
    /// any other value binds `input`.
    pub fn bind_inputs(&self, inputs: Option<&serde_json::Value>) {
        match inputs {
            None => {}
            Some(serde_json::Value::Object(map)) => {
                for (key, value) in map {
                    self.globals.set(key, Value::from_json(value));
                }
            }
            Some(other) => self.globals.set(INPUT_NAME, Value::from_json(other)),
        }
    }

    pub fn run(&mut self, module: &Module) -> Result<(), SandboxError> {
        let globals = self.globals.clone();
        match self.exec_block(&module.body, &globals) {
            Ok(_) => Ok(()),
            Err(fault) => Err(fault.into_error()),
        }
    }

    pub fn globals(&self) -> &Rc<Scope> {
        &self.globals
    }

    pub fn steps(&self) -> u64 {
        self.steps.used()
    }

    pub fn stdout_bytes(&self) -> usize {
        self.ctx.stdout.bytes_written()
    }

    pub fn stderr_bytes(&self) -> usize {
        self.ctx.stderr.bytes_written()
    }

    pub fn clock(&self) -> &Rc<Clock> {
        &self.ctx.clock
    }

    pub(super) fn alloc_limit(&self) -> u64 {
        self.policy.max_const_alloc_elems
    }

    fn tick(&mut self, span: Span) -> EvalResult<()> {
        self.steps.tick().map_err(|e| Fault::Abort(e.at(span)))
    }

    /// One step for an element consumed by an iteration.
    pub(super) fn tick_item(&mut self) -> EvalResult<()> {
        self.steps.tick().map_err(Fault::Abort)
    }

    pub(super) fn write_output(&mut self, stream: StreamKind, text: &str) {
        match stream {
            StreamKind::Stdout => self.ctx.stdout.write(text),
            StreamKind::Stderr => self.ctx.stderr.write(text),
        }
    }

    /// Materialise an iterable, one step per element.
    pub(super) fn collect(&mut self, value: &Value) -> EvalResult<Vec<Value>> {
        if let Value::Range(r) = value {
            ops::check_alloc(r.len(), self.alloc_limit())?;
        }
        let mut out = Vec::new();
        for item in ops::iterate(value)? {
            self.tick_item()?;
            out.push(item);
        }
        Ok(out)
    }

    // ---- statements ----

    fn exec_block(&mut self, body: &[Stmt], scope: &Rc<Scope>) -> EvalResult<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> EvalResult<Flow> {
        self.tick(stmt.span)?;
        self.exec_stmt_kind(stmt, scope)
            .map_err(|fault| fault.at(stmt.span))
    }

    fn exec_stmt_kind(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> EvalResult<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope)?;
                for target in targets {
                    self.assign(target, value.clone(), scope)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value, scope)?,
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::If { test, body, orelse } => {
                let branch = if self.eval(test, scope)?.truthy() {
                    body
                } else {
                    orelse
                };
                return self.exec_block(branch, scope);
            }
            StmtKind::While { test, body, orelse } => {
                while self.eval(test, scope)?.truthy() {
                    match self.exec_block(body, scope)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Normal | Flow::Continue => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                return self.exec_block(orelse, scope);
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter, scope)?;
                for item in ops::iterate(&iterable)? {
                    self.tick_item()?;
                    self.assign(target, item, scope)?;
                    match self.exec_block(body, scope)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Normal | Flow::Continue => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                return self.exec_block(orelse, scope);
            }
            StmtKind::FunctionDef(def) => {
                let closure = self.make_closure(
                    &def.name,
                    &def.params,
                    FunctionBody::Block(def.clone()),
                    scope,
                )?;
                scope.set(&def.name, Value::Function(Rc::new(closure)));
            }
            StmtKind::ClassDef { name, body } => {
                let class_scope = Scope::child(scope);
                self.exec_block(body, &class_scope)?;
                let class = ClassObj {
                    name: name.clone(),
                    attrs: RefCell::new(class_scope.take_vars()),
                };
                scope.set(name, Value::Class(Rc::new(class)));
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody, scope),
            StmtKind::With { items, body } => {
                for item in items {
                    let value = self.eval(&item.context, scope)?;
                    if let Some(target) = &item.target {
                        self.assign(target, value, scope)?;
                    }
                }
                return self.exec_block(body, scope);
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, scope)?.truthy() {
                    let message = match msg {
                        Some(m) => self.eval(m, scope)?.to_str(),
                        None => String::new(),
                    };
                    return Err(Fault::raise("AssertionError", message));
                }
            }
            StmtKind::Import { .. }
            | StmtKind::ImportFrom { .. }
            | StmtKind::Global(_)
            | StmtKind::Nonlocal(_)
            | StmtKind::Delete(_)
            | StmtKind::Raise(_)
            | StmtKind::Async(_) => {
                let node = stmt.kind.name();
                return Err(Fault::Abort(SandboxError::policy(
                    node,
                    format!("{node} is not allowed"),
                    stmt.span,
                )));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
        scope: &Rc<Scope>,
    ) -> EvalResult<Flow> {
        let outcome = match self.exec_block(body, scope) {
            Err(Fault::Raise(exc)) => {
                let handler = handlers.iter().find(|h| {
                    h.types.is_empty()
                        || h.types.iter().any(|t| exception_matches(exc.type_name, t))
                });
                match handler {
                    Some(h) => {
                        if let Some(bind) = &h.bind {
                            scope.set(bind, Value::str(&exc.message));
                        }
                        self.exec_block(&h.body, scope)
                    }
                    None => Err(Fault::Raise(exc)),
                }
            }
            Ok(Flow::Normal) => self.exec_block(orelse, scope),
            other => other,
        };
        // Guard faults unwind without running cleanup code.
        if matches!(outcome, Err(Fault::Abort(_))) {
            return outcome;
        }
        match self.exec_block(finalbody, scope)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn assign(&mut self, target: &Expr, value: Value, scope: &Rc<Scope>) -> EvalResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                scope.set(name, value);
                Ok(())
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                let items = self.collect(&value)?;
                if items.len() < targets.len() {
                    return Err(Fault::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    )));
                }
                if items.len() > targets.len() {
                    return Err(Fault::value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    )));
                }
                for (t, v) in targets.iter().zip(items) {
                    self.assign(t, v, scope)?;
                }
                Ok(())
            }
            ExprKind::Subscript { value: obj, index } => {
                let container = self.eval(obj, scope)?;
                if matches!(index.kind, ExprKind::Slice { .. }) {
                    return Err(Fault::type_error("slice assignment is not supported"));
                }
                let key = self.eval(index, scope)?;
                ops::store_subscript(&container, &key, value)
            }
            ExprKind::Attribute { value: obj, attr } => {
                let object = self.eval(obj, scope)?;
                set_attribute(&object, attr, value)
            }
            other => Err(Fault::type_error(format!(
                "cannot assign to {}",
                other.name()
            ))),
        }
    }

    fn aug_assign(
        &mut self,
        target: &Expr,
        op: BinaryOp,
        value: &Expr,
        scope: &Rc<Scope>,
    ) -> EvalResult<()> {
        let limit = self.alloc_limit();
        match &target.kind {
            ExprKind::Name(name) => {
                let current = lookup(scope, name)?;
                let rhs = self.eval(value, scope)?;
                scope.set(name, ops::binary(op, &current, &rhs, limit)?);
                Ok(())
            }
            ExprKind::Subscript { value: obj, index } => {
                let container = self.eval(obj, scope)?;
                if matches!(index.kind, ExprKind::Slice { .. }) {
                    return Err(Fault::type_error("slice assignment is not supported"));
                }
                let key = self.eval(index, scope)?;
                let current = ops::subscript(&container, &key)?;
                let rhs = self.eval(value, scope)?;
                ops::store_subscript(&container, &key, ops::binary(op, &current, &rhs, limit)?)
            }
            ExprKind::Attribute { value: obj, attr } => {
                let object = self.eval(obj, scope)?;
                let current = self.attribute(&object, attr)?;
                let rhs = self.eval(value, scope)?;
                set_attribute(&object, attr, ops::binary(op, &current, &rhs, limit)?)
            }
            other => Err(Fault::type_error(format!(
                "cannot assign to {}",
                other.name()
            ))),
        }
    }

    // ---- expressions ----

    fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> EvalResult<Value> {
        self.tick(expr.span)?;
        self.eval_kind(expr, scope).map_err(|fault| fault.at(expr.span))
    }

    fn eval_kind(&mut self, expr: &Expr, scope: &Rc<Scope>) -> EvalResult<Value> {
        let limit = self.alloc_limit();
        match &expr.kind {
            ExprKind::Name(name) => lookup(scope, name),
            ExprKind::Constant(c) => Ok(match c {
                Constant::None => Value::None,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(i) => Value::Int(*i),
                Constant::Float(f) => Value::Float(*f),
                Constant::Str(s) => Value::str(s),
                Constant::Ellipsis => return Err(Fault::type_error("'...' is not supported")),
            }),
            ExprKind::List(items) => Ok(Value::list(self.eval_all(items, scope)?)),
            ExprKind::Tuple(items) => Ok(Value::tuple(self.eval_all(items, scope)?)),
            ExprKind::Set(items) => {
                let members = self.eval_all(items, scope)?;
                Ok(Value::Set(Rc::new(RefCell::new(DictStore::from_members(
                    members,
                )?))))
            }
            ExprKind::Dict(pairs) => {
                let mut store = DictStore::new();
                for (k, v) in pairs {
                    let key = self.eval(k, scope)?;
                    let value = self.eval(v, scope)?;
                    store.insert(key.to_key()?, key, value);
                }
                Ok(Value::dict(store))
            }
            ExprKind::BoolOp { op, values } => {
                let mut last = Value::None;
                for v in values {
                    last = self.eval(v, scope)?;
                    let short = match op {
                        BoolOp::And => !last.truthy(),
                        BoolOp::Or => last.truthy(),
                    };
                    if short {
                        break;
                    }
                }
                Ok(last)
            }
            ExprKind::BinOp { left, op, right } => {
                let a = self.eval(left, scope)?;
                let b = self.eval(right, scope)?;
                ops::binary(*op, &a, &b, limit)
            }
            ExprKind::UnaryOp { op, operand } => {
                let v = self.eval(operand, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                    other => ops::unary(*other, &v),
                }
            }
            ExprKind::Compare {
                left,
                ops: cmp_ops,
                comparators,
            } => {
                let mut lhs = self.eval(left, scope)?;
                for (op, comparator) in cmp_ops.iter().zip(comparators) {
                    let rhs = self.eval(comparator, scope)?;
                    if !ops::compare(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
            ExprKind::Lambda(lambda) => {
                let closure = self.make_closure(
                    "<lambda>",
                    &lambda.params,
                    FunctionBody::Expr(lambda.clone()),
                    scope,
                )?;
                Ok(Value::Function(Rc::new(closure)))
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                let callee = self.eval(func, scope)?;
                let args = self.eval_all(args, scope)?;
                let mut kwargs = Vec::with_capacity(keywords.len());
                for kw in keywords {
                    kwargs.push((kw.name.clone(), self.eval(&kw.value, scope)?));
                }
                self.call_value(callee, args, kwargs)
            }
            ExprKind::Attribute { value, attr } => {
                let object = self.eval(value, scope)?;
                self.attribute(&object, attr)
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval(value, scope)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let lower = self.slice_bound(lower.as_deref(), scope)?;
                    let upper = self.slice_bound(upper.as_deref(), scope)?;
                    let step = self.slice_bound(step.as_deref(), scope)?;
                    return ops::slice(&container, lower, upper, step);
                }
                let key = self.eval(index, scope)?;
                ops::subscript(&container, &key)
            }
            ExprKind::Slice { .. } => Err(Fault::type_error("slice outside of a subscript")),
            ExprKind::ListComp { elt, generators } | ExprKind::GeneratorExp { elt, generators } => {
                let inner = Scope::child(scope);
                let mut out = Vec::new();
                self.comprehend(generators, &inner, &mut |this, s| {
                    let v = this.eval(elt, s)?;
                    ops::check_alloc(out.len() as u64 + 1, limit)?;
                    out.push(v);
                    Ok(())
                })?;
                Ok(Value::list(out))
            }
            ExprKind::SetComp { elt, generators } => {
                let inner = Scope::child(scope);
                let mut store = DictStore::new();
                self.comprehend(generators, &inner, &mut |this, s| {
                    let v = this.eval(elt, s)?;
                    ops::check_alloc(store.len() as u64 + 1, limit)?;
                    store.insert(v.to_key()?, v, Value::None);
                    Ok(())
                })?;
                Ok(Value::Set(Rc::new(RefCell::new(store))))
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                let inner = Scope::child(scope);
                let mut store = DictStore::new();
                self.comprehend(generators, &inner, &mut |this, s| {
                    let k = this.eval(key, s)?;
                    let v = this.eval(value, s)?;
                    ops::check_alloc(store.len() as u64 + 1, limit)?;
                    store.insert(k.to_key()?, k, v);
                    Ok(())
                })?;
                Ok(Value::dict(store))
            }
            ExprKind::Yield(_) | ExprKind::Await(_) => {
                let node = expr.kind.name();
                Err(Fault::Abort(SandboxError::policy(
                    node,
                    format!("{node} is not allowed"),
                    expr.span,
                )))
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr], scope: &Rc<Scope>) -> EvalResult<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e, scope)).collect()
    }

    fn slice_bound(&mut self, part: Option<&Expr>, scope: &Rc<Scope>) -> EvalResult<Option<i64>> {
        let Some(expr) = part else { return Ok(None) };
        match self.eval(expr, scope)? {
            Value::None => Ok(None),
            v => v.as_int().map(Some).ok_or_else(|| {
                Fault::type_error("slice indices must be integers or None")
            }),
        }
    }

    fn comprehend(
        &mut self,
        generators: &[Comprehension],
        scope: &Rc<Scope>,
        emit: &mut dyn FnMut(&mut Self, &Rc<Scope>) -> EvalResult<()>,
    ) -> EvalResult<()> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(self, scope);
        };
        let iterable = self.eval(&first.iter, scope)?;
        'items: for item in ops::iterate(&iterable)? {
            self.tick_item()?;
            self.assign(&first.target, item, scope)?;
            for cond in &first.ifs {
                if !self.eval(cond, scope)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehend(rest, scope, emit)?;
        }
        Ok(())
    }

    // ---- functions, classes, capabilities ----

    fn make_closure(
        &mut self,
        name: &str,
        params: &[Param],
        body: FunctionBody,
        scope: &Rc<Scope>,
    ) -> EvalResult<Closure> {
        let mut defaults = Vec::with_capacity(params.len());
        for p in params {
            defaults.push(match &p.default {
                Some(expr) => Some(self.eval(expr, scope)?),
                None => None,
            });
        }
        Ok(Closure {
            name: name.to_string(),
            params: params.iter().map(|p| p.name.clone()).collect(),
            defaults,
            body,
            env: scope.clone(),
        })
    }

    pub(super) fn call_value(
        &mut self,
        callee: Value,
        mut args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        match callee {
            Value::Builtin(b) => self.call_builtin(b, args, kwargs),
            Value::Function(closure) => self.call_function(&closure, args, kwargs),
            Value::BoundMethod(method) => {
                args.insert(0, method.receiver.clone());
                self.call_function(&method.function, args, kwargs)
            }
            Value::Class(class) => self.instantiate(class, args, kwargs),
            Value::Capability(name) => self.call_capability(&name, args, kwargs),
            Value::RootMethod(root, attr) => self.call_root(&root, &attr, args, kwargs),
            other => Err(Fault::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &mut self,
        closure: &Rc<Closure>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        if self.depth >= self.policy.max_recursion {
            return Err(Fault::Abort(SandboxError::RecursionExceeded {
                limit: self.policy.max_recursion,
                location: None,
            }));
        }
        let name = &closure.name;
        let n = closure.params.len();
        if args.len() > n {
            return Err(Fault::type_error(format!(
                "{name}() takes {n} positional argument{} but {} were given",
                if n == 1 { "" } else { "s" },
                args.len()
            )));
        }
        let mut slots: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        slots.resize(n, None);
        for (key, value) in kwargs {
            match closure.params.iter().position(|p| *p == key) {
                Some(i) if slots[i].is_some() => {
                    return Err(Fault::type_error(format!(
                        "{name}() got multiple values for argument '{key}'"
                    )))
                }
                Some(i) => slots[i] = Some(value),
                None => {
                    return Err(Fault::type_error(format!(
                        "{name}() got an unexpected keyword argument '{key}'"
                    )))
                }
            }
        }
        let local = Scope::child(&closure.env);
        for (i, slot) in slots.into_iter().enumerate() {
            let param = &closure.params[i];
            let value = slot.or_else(|| closure.defaults[i].clone()).ok_or_else(|| {
                Fault::type_error(format!(
                    "{name}() missing required argument: '{param}'"
                ))
            })?;
            local.set(param, value);
        }

        self.depth += 1;
        let result = match &closure.body {
            FunctionBody::Block(def) => {
                let def: Rc<FunctionDef> = def.clone();
                self.exec_block(&def.body, &local).map(|flow| match flow {
                    Flow::Return(v) => v,
                    _ => Value::None,
                })
            }
            FunctionBody::Expr(lambda) => {
                let lambda: Rc<Lambda> = lambda.clone();
                self.eval(&lambda.body, &local)
            }
        };
        self.depth -= 1;
        result
    }

    fn instantiate(
        &mut self,
        class: Rc<ClassObj>,
        mut args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        let init = class.attrs.borrow().get("__init__").cloned();
        let instance = Value::Instance(Rc::new(InstanceObj {
            class: class.clone(),
            fields: RefCell::new(HashMap::new()),
        }));
        match init {
            Some(Value::Function(f)) => {
                args.insert(0, instance.clone());
                self.call_function(&f, args, kwargs)?;
            }
            _ if !args.is_empty() || !kwargs.is_empty() => {
                return Err(Fault::type_error(format!(
                    "{}() takes no arguments",
                    class.name
                )))
            }
            _ => {}
        }
        Ok(instance)
    }

    fn call_capability(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        let call = plain_call_args(&args, &kwargs)?;
        match self.ctx.capabilities.invoke(name, call) {
            Ok(json) => Ok(Value::from_json(&json)),
            Err(CapabilityFault::Failed(message)) => Err(Fault::raise("CapabilityError", message)),
            Err(CapabilityFault::Abort(err)) => Err(Fault::Abort(err)),
        }
    }

    fn call_root(
        &mut self,
        root: &Rc<RootProxy>,
        attr: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        let call = plain_call_args(&args, &kwargs)?;
        let mut rctx = RootContext {
            clock: &self.ctx.clock,
            rng: &mut self.ctx.rng,
        };
        root.call(attr, &call, &mut rctx)
            .map(|json| Value::from_json(&json))
            .map_err(root_fault)
    }

    fn attribute(&mut self, object: &Value, attr: &str) -> EvalResult<Value> {
        match object {
            Value::Root(root) => match root.access(attr) {
                Some(RootAttr::Callable) => Ok(Value::RootMethod(root.clone(), Rc::from(attr))),
                Some(RootAttr::Value) => root
                    .read(attr)
                    .map(|json| Value::from_json(&json))
                    .map_err(root_fault),
                None => Err(root_fault(RootError::NotAllowed {
                    root: root.name().to_string(),
                    attr: attr.to_string(),
                })),
            },
            Value::Instance(obj) => {
                if let Some(v) = obj.fields.borrow().get(attr) {
                    return Ok(v.clone());
                }
                match obj.class.attrs.borrow().get(attr) {
                    Some(Value::Function(f)) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
                        receiver: object.clone(),
                        function: f.clone(),
                    }))),
                    Some(v) => Ok(v.clone()),
                    None => Err(Fault::raise(
                        "AttributeError",
                        format!("'{}' object has no attribute '{attr}'", obj.class.name),
                    )),
                }
            }
            Value::Class(class) => class.attrs.borrow().get(attr).cloned().ok_or_else(|| {
                Fault::raise(
                    "AttributeError",
                    format!("type object '{}' has no attribute '{attr}'", class.name),
                )
            }),
            other => Err(Fault::raise(
                "AttributeError",
                format!("'{}' object has no attribute '{attr}'", other.type_name()),
            )),
        }
    }
}

fn lookup(scope: &Scope, name: &str) -> EvalResult<Value> {
    scope
        .lookup(name)
        .ok_or_else(|| Fault::raise("NameError", format!("name '{name}' is not defined")))
}

fn set_attribute(object: &Value, attr: &str, value: Value) -> EvalResult<()> {
    match object {
        Value::Instance(obj) => {
            obj.fields.borrow_mut().insert(attr.to_string(), value);
            Ok(())
        }
        Value::Class(class) => {
            class.attrs.borrow_mut().insert(attr.to_string(), value);
            Ok(())
        }
        Value::Root(root) => Err(Fault::raise(
            "AttributeError",
            format!("{}.{attr} is read-only", root.name()),
        )),
        other => Err(Fault::raise(
            "AttributeError",
            format!("'{}' object attribute '{attr}' is read-only", other.type_name()),
        )),
    }
}

fn plain_call_args(args: &[Value], kwargs: &[(String, Value)]) -> EvalResult<CallArgs> {
    let mut call = CallArgs::default();
    for a in args {
        call.args.push(a.to_plain_json()?);
    }
    for (k, v) in kwargs {
        call.kwargs.insert(k.clone(), v.to_plain_json()?);
    }
    Ok(call)
}

fn root_fault(err: RootError) -> Fault {
    let type_name = match &err {
        RootError::NotAllowed { .. }
        | RootError::NotCallable { .. }
        | RootError::Unknown { .. }
        | RootError::UnknownTarget(_) => "AttributeError",
        RootError::BadArguments(_) => "TypeError",
        RootError::Failed(_) => "ValueError",
    };
    Fault::raise(type_name, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStream;
    use crate::capability::NoCapabilities;
    use crate::error::ResourceKind;
    use crate::roots::{RootCatalog, RootSpec};

    struct Run {
        globals: Rc<Scope>,
        steps: u64,
        audit: Rc<AuditStream>,
        result: Result<(), SandboxError>,
    }

    fn run_with(source: &str, policy: &Policy, inputs: Option<serde_json::Value>) -> Run {
        let module = cordon_script::parse(source).unwrap();
        let audit = Rc::new(AuditStream::in_memory());
        let clock = Rc::new(Clock::fake(0.0, 0.0));
        let mut caps = NoCapabilities;
        let spec = RootSpec::new("math", "math")
            .allow_call("sqrt")
            .allow_value("pi");
        let roots = vec![Rc::new(RootCatalog::builtin().instantiate(&spec).unwrap())];
        let ctx = ExecContext {
            clock: clock.clone(),
            rng: SandboxRng::seeded(0),
            stdout: OutputStream::new(StreamKind::Stdout, 1000, audit.clone(), clock.clone()),
            stderr: OutputStream::new(StreamKind::Stderr, 1000, audit.clone(), clock),
            capabilities: &mut caps,
            capability_names: Vec::new(),
            roots,
        };
        let mut interp = Interpreter::new(policy, ctx);
        interp.bind_inputs(inputs.as_ref());
        let result = interp.run(&module);
        Run {
            globals: interp.globals().clone(),
            steps: interp.steps(),
            audit,
            result,
        }
    }

    fn run(source: &str) -> Run {
        run_with(source, &Policy::permissive(), None)
    }

    fn global(run: &Run, name: &str) -> Value {
        run.globals.lookup(name).unwrap()
    }

    fn runtime_type(run: &Run) -> String {
        match run.result.clone().unwrap_err() {
            SandboxError::Runtime { error_type, .. } => error_type,
            other => panic!("expected Runtime, got {other:?}"),
        }
    }

    #[test]
    fn test_arithmetic_and_control_flow() {
        let r = run("total = 0\nfor i in range(10):\n    if i % 2 == 0:\n        continue\n    total += i\n");
        r.result.as_ref().unwrap();
        assert_eq!(global(&r, "total"), Value::Int(25));
    }

    #[test]
    fn test_functions_defaults_and_keywords() {
        let r = run("def f(a, b=10):\n    return a * b\nx = f(2)\ny = f(2, b=3)\n");
        r.result.as_ref().unwrap();
        assert_eq!(global(&r, "x"), Value::Int(20));
        assert_eq!(global(&r, "y"), Value::Int(6));
    }

    #[test]
    fn test_missing_argument_is_type_error() {
        let r = run("def f(a):\n    return a\nf()\n");
        assert_eq!(runtime_type(&r), "TypeError");
    }

    #[test]
    fn test_recursion_limit_aborts() {
        let policy = Policy {
            max_recursion: 20,
            ..Policy::permissive()
        };
        let r = run_with("def f(n):\n    return f(n + 1)\nf(0)\n", &policy, None);
        match r.result.unwrap_err() {
            SandboxError::RecursionExceeded { limit: 20, location } => {
                assert_eq!(location.map(|s| s.line), Some(2));
            }
            other => panic!("expected RecursionExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_try_catches_script_exceptions_only() {
        let r = run("try:\n    x = 1 / 0\nexcept ZeroDivisionError as e:\n    msg = e\nfinally:\n    done = True\n");
        r.result.as_ref().unwrap();
        assert_eq!(global(&r, "msg"), Value::str("division by zero"));
        assert_eq!(global(&r, "done"), Value::Bool(true));

        let policy = Policy {
            max_steps: 50,
            ..Policy::permissive()
        };
        let r = run_with(
            "try:\n    while True:\n        pass\nexcept Exception:\n    caught = True\n",
            &policy,
            None,
        );
        match r.result.unwrap_err() {
            SandboxError::StepBudgetExceeded { limit: 50, .. } => {}
            other => panic!("expected StepBudgetExceeded, got {other:?}"),
        }
        assert!(r.globals.lookup("caught").is_none());
    }

    #[test]
    fn test_step_count_is_deterministic() {
        let src = "x = [i * 2 for i in range(5)]\ny = sum(x)\n";
        let first = run(src);
        let second = run(src);
        first.result.as_ref().unwrap();
        assert_eq!(first.steps, second.steps);

        let exact = Policy {
            max_steps: first.steps,
            ..Policy::permissive()
        };
        run_with(src, &exact, None).result.unwrap();
        let short = Policy {
            max_steps: first.steps - 1,
            ..Policy::permissive()
        };
        match run_with(src, &short, None).result.unwrap_err() {
            SandboxError::StepBudgetExceeded { .. } => {}
            other => panic!("expected StepBudgetExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_inputs_are_frozen() {
        let r = run_with(
            "cfg['k'] = 2\n",
            &Policy::permissive(),
            Some(serde_json::json!({"cfg": {"k": 1}})),
        );
        assert_eq!(runtime_type(&r), "TypeError");

        let r = run_with("n = len(input)\n", &Policy::permissive(), Some(serde_json::json!([1, 2, 3])));
        r.result.as_ref().unwrap();
        assert_eq!(global(&r, "n"), Value::Int(3));
    }

    #[test]
    fn test_allocation_ceiling_applies_at_runtime() {
        let policy = Policy {
            max_const_alloc_elems: 100,
            ..Policy::permissive()
        };
        let r = run_with("n = 1000\nx = [0] * n\n", &policy, None);
        match r.result.unwrap_err() {
            SandboxError::ResourceLimitExceeded {
                resource: ResourceKind::Memory,
                ..
            } => {}
            other => panic!("expected ResourceLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_classes_and_methods() {
        let src = "class Counter:\n    def __init__(self, start):\n        self.n = start\n    def bump(self):\n        self.n += 1\n        return self.n\nc = Counter(5)\nc.bump()\nv = c.bump()\n";
        let r = run(src);
        r.result.as_ref().unwrap();
        assert_eq!(global(&r, "v"), Value::Int(7));
    }

    #[test]
    fn test_print_emits_stdout_events() {
        let r = run("print('a', 1, sep='-')\nprint('oops', file='stderr')\n");
        r.result.as_ref().unwrap();
        let events = r.audit.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "stdout");
        assert_eq!(events[0].data["text"], "a-1\n");
        assert_eq!(events[1].kind, "stderr");
    }

    #[test]
    fn test_comprehensions_do_not_leak_targets() {
        let r = run("xs = {k: k * k for k in range(3) if k}\n");
        r.result.as_ref().unwrap();
        assert_eq!(global(&r, "xs").repr(), "{1: 1, 2: 4}");
        assert!(r.globals.lookup("k").is_none());
    }

    #[test]
    fn test_roots_expose_only_allowed_attributes() {
        let r = run("a = math.sqrt(16)\nb = math.pi\n");
        r.result.as_ref().unwrap();
        assert_eq!(global(&r, "a"), Value::Float(4.0));
        assert!(matches!(global(&r, "b"), Value::Float(_)));

        let r = run("math.system('ls')\n");
        assert_eq!(runtime_type(&r), "AttributeError");
    }

    #[test]
    fn test_sorted_min_max_with_keys() {
        let r = run("words = ['ccc', 'a', 'bb']\ns = sorted(words, key=len, reverse=True)\nm = min(words, key=len)\nz = max([], default=0)\n");
        r.result.as_ref().unwrap();
        assert_eq!(global(&r, "s").repr(), "['ccc', 'bb', 'a']");
        assert_eq!(global(&r, "m"), Value::str("a"));
        assert_eq!(global(&r, "z"), Value::Int(0));
    }

    #[test]
    fn test_unpacking_and_slices() {
        let r = run("a, (b, c) = 1, [2, 3]\nt = 'abcdef'[::-2]\n");
        r.result.as_ref().unwrap();
        assert_eq!(global(&r, "c"), Value::Int(3));
        assert_eq!(global(&r, "t"), Value::str("fdb"));

        let r = run("a, b = [1, 2, 3]\n");
        assert_eq!(runtime_type(&r), "ValueError");
    }

    #[test]
    fn test_runtime_error_carries_location() {
        let r = run("x = 1\ny = {}['missing']\n");
        match r.result.unwrap_err() {
            SandboxError::Runtime {
                error_type,
                location,
                ..
            } => {
                assert_eq!(error_type, "KeyError");
                assert_eq!(location.map(|s| s.line), Some(2));
            }
            other => panic!("expected Runtime, got {other:?}"),
        }
    }
}
