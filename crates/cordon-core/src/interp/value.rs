//! Runtime values.
//!
//! Mutable containers are `Rc<RefCell<..>>`; frozen variants (`Tuple`,
//! `FrozenDict`, `FrozenSet`) wrap plain `Rc` so nothing can write through
//! them. Every value that crosses the sandbox boundary comes in frozen.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use cordon_script::ast::{FunctionDef, Lambda};

use super::builtins::Builtin;
use super::scope::Scope;
use super::{EvalResult, Fault};
use crate::roots::RootProxy;

/// Nesting beyond which repr, equality and hashing stop descending.
const MAX_STRUCTURAL_DEPTH: usize = 200;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    Dict(Rc<RefCell<DictStore>>),
    FrozenDict(Rc<DictStore>),
    Set(Rc<RefCell<DictStore>>),
    FrozenSet(Rc<DictStore>),
    Range(Range),
    Function(Rc<Closure>),
    Builtin(Builtin),
    Class(Rc<ClassObj>),
    Instance(Rc<InstanceObj>),
    BoundMethod(Rc<BoundMethod>),
    Capability(Rc<str>),
    Root(Rc<RootProxy>),
    RootMethod(Rc<RootProxy>, Rc<str>),
}

/// Hashable projection of a value, used for dict keys and set members.
///
/// Numbers normalise so that `1`, `1.0` and `True` collide as they compare
/// equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<Key>),
    FrozenSet(Vec<Key>),
}

/// Insertion-ordered hash table backing dicts and sets.
#[derive(Clone, Default)]
pub struct DictStore {
    entries: Vec<(Value, Value)>,
    index: HashMap<Key, usize>,
}

impl DictStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.index.contains_key(key)
    }

    /// Insert or overwrite; an existing entry keeps its position and
    /// original key object.
    pub fn insert(&mut self, key: Key, k: Value, v: Value) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = v,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((k, v));
            }
        }
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn key_set(&self) -> impl Iterator<Item = &Key> {
        self.index.keys()
    }

    /// Build a set store from values.
    pub fn from_members(members: impl IntoIterator<Item = Value>) -> EvalResult<Self> {
        let mut store = Self::new();
        for m in members {
            let key = m.to_key()?;
            store.insert(key, m, Value::None);
        }
        Ok(store)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> u64 {
        let (start, stop, step) = (
            i128::from(self.start),
            i128::from(self.stop),
            i128::from(self.step),
        );
        let n = if step > 0 {
            (stop - start + step - 1) / step
        } else {
            (start - stop - step - 1) / (-step)
        };
        n.max(0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u64) -> i64 {
        (i128::from(self.start) + i128::from(self.step) * i128::from(index)) as i64
    }

    pub fn contains(&self, v: i64) -> bool {
        let (v, start, step) = (i128::from(v), i128::from(self.start), i128::from(self.step));
        let in_bounds = if step > 0 {
            v >= start && v < i128::from(self.stop)
        } else {
            v <= start && v > i128::from(self.stop)
        };
        in_bounds && (v - start) % step == 0
    }
}

pub enum FunctionBody {
    Block(Rc<FunctionDef>),
    Expr(Rc<Lambda>),
}

/// A user function together with its defining scope.
pub struct Closure {
    pub name: String,
    pub params: Vec<String>,
    pub defaults: Vec<Option<Value>>,
    pub body: FunctionBody,
    pub env: Rc<Scope>,
}

pub struct ClassObj {
    pub name: String,
    pub attrs: RefCell<HashMap<String, Value>>,
}

pub struct InstanceObj {
    pub class: Rc<ClassObj>,
    pub fields: RefCell<HashMap<String, Value>>,
}

pub struct BoundMethod {
    pub receiver: Value,
    pub function: Rc<Closure>,
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::from(items))
    }

    pub fn dict(store: DictStore) -> Self {
        Value::Dict(Rc::new(RefCell::new(store)))
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::FrozenDict(_) => "FrozenDict",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Range(_) => "range",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Class(_) => "type",
            Value::Instance(obj) => &obj.class.name,
            Value::BoundMethod(_) => "method",
            Value::Capability(_) => "capability",
            Value::Root(_) => "root",
            Value::RootMethod(..) => "root_method",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(d) | Value::Set(d) => !d.borrow().is_empty(),
            Value::FrozenDict(d) | Value::FrozenSet(d) => !d.is_empty(),
            Value::Range(r) => !r.is_empty(),
            _ => true,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_)
                | Value::Builtin(_)
                | Value::Class(_)
                | Value::BoundMethod(_)
                | Value::Capability(_)
                | Value::RootMethod(..)
        )
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Float view of any number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    pub fn to_key(&self) -> EvalResult<Key> {
        self.key_at(0)
    }

    fn key_at(&self, depth: usize) -> EvalResult<Key> {
        if depth > MAX_STRUCTURAL_DEPTH {
            return Err(Fault::raise(
                "RecursionError",
                "maximum nesting depth exceeded while hashing",
            ));
        }
        Ok(match self {
            Value::None => Key::None,
            Value::Bool(b) => Key::Int(i64::from(*b)),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) => float_key(*f),
            Value::Str(s) => Key::Str(s.clone()),
            Value::Tuple(items) => Key::Tuple(
                items
                    .iter()
                    .map(|v| v.key_at(depth + 1))
                    .collect::<EvalResult<_>>()?,
            ),
            Value::FrozenSet(store) => {
                let mut keys: Vec<Key> = store.key_set().cloned().collect();
                keys.sort();
                Key::FrozenSet(keys)
            }
            other => {
                return Err(Fault::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )))
            }
        })
    }

    /// Convert a JSON document into a deeply frozen value.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::str(s),
            serde_json::Value::Array(items) => {
                Value::tuple(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let mut store = DictStore::new();
                for (k, v) in map {
                    store.insert(Key::Str(Rc::from(k.as_str())), Value::str(k), Value::from_json(v));
                }
                Value::FrozenDict(Rc::new(store))
            }
        }
    }

    /// Plain JSON for values handed to capabilities. Fails on values with no
    /// JSON form.
    pub fn to_plain_json(&self) -> EvalResult<serde_json::Value> {
        self.plain_json_at(0)
    }

    fn plain_json_at(&self, depth: usize) -> EvalResult<serde_json::Value> {
        if depth > MAX_STRUCTURAL_DEPTH {
            return Err(Fault::value_error("value nested too deeply to pass"));
        }
        let not_plain =
            |v: &Value| Fault::type_error(format!("cannot pass '{}' across a capability", v.type_name()));
        Ok(match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => match serde_json::Number::from_f64(*f) {
                Some(n) => serde_json::Value::Number(n),
                None => return Err(Fault::value_error("non-finite float cannot be passed")),
            },
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::List(_) | Value::Tuple(_) | Value::Set(_) | Value::FrozenSet(_) => {
                let items = self.sequence_snapshot().ok_or_else(|| not_plain(self))?;
                serde_json::Value::Array(
                    items
                        .iter()
                        .map(|v| v.plain_json_at(depth + 1))
                        .collect::<EvalResult<_>>()?,
                )
            }
            Value::Dict(_) | Value::FrozenDict(_) => {
                let mut map = serde_json::Map::new();
                for (k, v) in self.dict_entries().unwrap_or_default() {
                    let key = match &k {
                        Value::Str(s) => s.to_string(),
                        Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) => k.to_str(),
                        other => return Err(not_plain(other)),
                    };
                    map.insert(key, v.plain_json_at(depth + 1)?);
                }
                serde_json::Value::Object(map)
            }
            other => return Err(not_plain(other)),
        })
    }

    /// Elements of list-like values (list, tuple, set, frozenset).
    pub fn sequence_snapshot(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items.borrow().clone()),
            Value::Tuple(items) => Some(items.to_vec()),
            Value::Set(store) => Some(store.borrow().keys().cloned().collect()),
            Value::FrozenSet(store) => Some(store.keys().cloned().collect()),
            _ => None,
        }
    }

    pub fn dict_entries(&self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Dict(store) => Some(store.borrow().entries().to_vec()),
            Value::FrozenDict(store) => Some(store.entries().to_vec()),
            _ => None,
        }
    }

    /// Identity of heap-allocated values, for cycle detection.
    pub fn heap_id(&self) -> Option<usize> {
        match self {
            Value::List(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            Value::Dict(rc) | Value::Set(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            Value::FrozenDict(rc) | Value::FrozenSet(rc) => {
                Some(Rc::as_ptr(rc) as *const u8 as usize)
            }
            Value::Tuple(rc) => Some(rc.as_ptr() as *const u8 as usize),
            Value::Instance(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            _ => None,
        }
    }

    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, &mut Vec::new());
        out
    }

    /// `str()` of a value: strings render bare, everything else as repr.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.repr(),
        }
    }

    fn write_repr(&self, out: &mut String, stack: &mut Vec<usize>) {
        if let Some(id) = self.heap_id() {
            if stack.contains(&id) || stack.len() > MAX_STRUCTURAL_DEPTH {
                out.push_str(match self {
                    Value::Dict(_) | Value::FrozenDict(_) => "{...}",
                    Value::Tuple(_) => "(...)",
                    _ => "[...]",
                });
                return;
            }
            stack.push(id);
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&float_repr(*f)),
            Value::Str(s) => out.push_str(&str_repr(s)),
            Value::List(items) => {
                let items = items.borrow().clone();
                write_seq(out, "[", "]", &items, stack);
            }
            Value::Tuple(items) => {
                if items.len() == 1 {
                    out.push('(');
                    items[0].write_repr(out, stack);
                    out.push_str(",)");
                } else {
                    write_seq(out, "(", ")", items, stack);
                }
            }
            Value::Dict(_) | Value::FrozenDict(_) => {
                let entries = self.dict_entries().unwrap_or_default();
                out.push('{');
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.write_repr(out, stack);
                    out.push_str(": ");
                    v.write_repr(out, stack);
                }
                out.push('}');
            }
            Value::Set(_) | Value::FrozenSet(_) => {
                let items = self.sequence_snapshot().unwrap_or_default();
                let frozen = matches!(self, Value::FrozenSet(_));
                if items.is_empty() {
                    out.push_str(if frozen { "frozenset()" } else { "set()" });
                } else if frozen {
                    write_seq(out, "frozenset({", "})", &items, stack);
                } else {
                    write_seq(out, "{", "}", &items, stack);
                }
            }
            Value::Range(r) => {
                if r.step == 1 {
                    out.push_str(&format!("range({}, {})", r.start, r.stop));
                } else {
                    out.push_str(&format!("range({}, {}, {})", r.start, r.stop, r.step));
                }
            }
            Value::Function(f) => out.push_str(&format!("<function {}>", f.name)),
            Value::Builtin(b) => out.push_str(&format!("<built-in function {}>", b.name())),
            Value::Class(c) => out.push_str(&format!("<class '{}'>", c.name)),
            Value::Instance(obj) => out.push_str(&format!("<{} object>", obj.class.name)),
            Value::BoundMethod(m) => out.push_str(&format!(
                "<bound method {} of {}>",
                m.function.name,
                m.receiver.type_name()
            )),
            Value::Capability(name) => out.push_str(&format!("<capability {name}>")),
            Value::Root(root) => out.push_str(&format!("<root {}>", root.name())),
            Value::RootMethod(root, attr) => {
                out.push_str(&format!("<root method {}.{}>", root.name(), attr))
            }
        }
        if self.heap_id().is_some() {
            stack.pop();
        }
    }
}

fn write_seq(out: &mut String, open: &str, close: &str, items: &[Value], stack: &mut Vec<usize>) {
    out.push_str(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.write_repr(out, stack);
    }
    out.push_str(close);
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other, 0)
    }
}

fn float_key(f: f64) -> Key {
    if f == 0.0 {
        return Key::Int(0);
    }
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        return Key::Int(f as i64);
    }
    Key::Float(f.to_bits())
}

/// Structural equality with numeric cross-type comparison.
pub fn values_equal(a: &Value, b: &Value, depth: usize) -> bool {
    if depth > MAX_STRUCTURAL_DEPTH {
        return false;
    }
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Float(_), _) | (_, Value::Float(_)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (x, y) if x.as_int().is_some() && y.as_int().is_some() => x.as_int() == y.as_int(),
        (Value::List(_), Value::List(_)) | (Value::Tuple(_), Value::Tuple(_)) => {
            if let (Value::List(x), Value::List(y)) = (a, b) {
                if Rc::ptr_eq(x, y) {
                    return true;
                }
            }
            let (Some(xs), Some(ys)) = (a.sequence_snapshot(), b.sequence_snapshot()) else {
                return false;
            };
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys.iter())
                    .all(|(x, y)| values_equal(x, y, depth + 1))
        }
        (Value::Dict(_) | Value::FrozenDict(_), Value::Dict(_) | Value::FrozenDict(_)) => {
            let (Some(xs), Some(ys)) = (a.dict_entries(), b.dict_entries()) else {
                return false;
            };
            if xs.len() != ys.len() {
                return false;
            }
            let lookup: Vec<(Key, Value)> = ys
                .into_iter()
                .filter_map(|(k, v)| k.to_key().ok().map(|key| (key, v)))
                .collect();
            xs.iter().all(|(k, v)| {
                let Ok(key) = k.to_key() else { return false };
                lookup
                    .iter()
                    .find(|(other, _)| *other == key)
                    .is_some_and(|(_, w)| values_equal(v, w, depth + 1))
            })
        }
        (Value::Set(_) | Value::FrozenSet(_), Value::Set(_) | Value::FrozenSet(_)) => {
            let keys = |v: &Value| -> Vec<Key> {
                let mut k: Vec<Key> = match v {
                    Value::Set(s) => s.borrow().key_set().cloned().collect(),
                    Value::FrozenSet(s) => s.key_set().cloned().collect(),
                    _ => Vec::new(),
                };
                k.sort();
                k
            };
            keys(a) == keys(b)
        }
        (Value::Range(x), Value::Range(y)) => {
            let (lx, ly) = (x.len(), y.len());
            lx == ly && (lx == 0 || (x.start == y.start && (lx == 1 || x.step == y.step)))
        }
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Class(x), Value::Class(y)) => Rc::ptr_eq(x, y),
        (Value::Instance(x), Value::Instance(y)) => Rc::ptr_eq(x, y),
        (Value::Capability(x), Value::Capability(y)) => x == y,
        (Value::Root(x), Value::Root(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Float repr: shortest round-trip digits, exponent form
/// outside `1e-4 <= |x| < 1e16`.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0".into() } else { "0.0".into() };
    }
    let sci = format!("{f:e}");
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    if (-4..16).contains(&exp) {
        let plain = format!("{f}");
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    }
}

/// String repr with quote selection and escapes.
pub fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}
