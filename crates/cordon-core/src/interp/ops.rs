//! Operators, subscripts and iteration over values.

use std::cmp::Ordering;
use std::rc::Rc;

use cordon_script::ast::{BinaryOp, CmpOp, UnaryOp};

use super::value::{values_equal, DictStore, Key, Value};
use super::{EvalResult, Fault};
use crate::error::{ResourceKind, SandboxError};

/// Abort when a single operation would materialise more than `limit`
/// elements.
pub fn check_alloc(n: u64, limit: u64) -> EvalResult<()> {
    if n > limit {
        return Err(Fault::Abort(SandboxError::ResourceLimitExceeded {
            resource: ResourceKind::Memory,
            message: format!(
                "allocation of {n} elements exceeds max_const_alloc_elems={limit}"
            ),
            location: None,
        }));
    }
    Ok(())
}

fn unsupported(op: &str, a: &Value, b: &Value) -> Fault {
    Fault::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        a.type_name(),
        b.type_name()
    ))
}

pub fn binary(op: BinaryOp, a: &Value, b: &Value, alloc_limit: u64) -> EvalResult<Value> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        if let (Value::Bool(p), Value::Bool(q)) = (a, b) {
            match op {
                BinaryOp::BitAnd => return Ok(Value::Bool(*p & *q)),
                BinaryOp::BitOr => return Ok(Value::Bool(*p | *q)),
                BinaryOp::BitXor => return Ok(Value::Bool(*p ^ *q)),
                _ => {}
            }
        }
        return int_binary(op, x, y);
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return float_binary(op, x, y).map_err(|f| match f {
            Fault::Raise(exc) if exc.message.is_empty() => unsupported(op.symbol(), a, b),
            other => other,
        });
    }
    match (op, a, b) {
        (BinaryOp::Add, Value::Str(x), Value::Str(y)) => {
            check_alloc((x.chars().count() + y.chars().count()) as u64, alloc_limit)?;
            Ok(Value::Str(Rc::from(format!("{x}{y}"))))
        }
        (BinaryOp::Add, Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            check_alloc((x.len() + y.len()) as u64, alloc_limit)?;
            Ok(Value::list(x.iter().chain(y.iter()).cloned().collect()))
        }
        (BinaryOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
            check_alloc((x.len() + y.len()) as u64, alloc_limit)?;
            Ok(Value::tuple(x.iter().chain(y.iter()).cloned().collect()))
        }
        (BinaryOp::Mult, seq, n) | (BinaryOp::Mult, n, seq)
            if n.as_int().is_some()
                && matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_)) =>
        {
            let times = n.as_int().unwrap_or(0).max(0) as u64;
            repeat(seq, times, alloc_limit)
        }
        (
            BinaryOp::BitOr | BinaryOp::BitAnd | BinaryOp::Sub | BinaryOp::BitXor,
            Value::Set(_) | Value::FrozenSet(_),
            Value::Set(_) | Value::FrozenSet(_),
        ) => set_binary(op, a, b),
        _ => Err(unsupported(op.symbol(), a, b)),
    }
}

fn repeat(seq: &Value, times: u64, alloc_limit: u64) -> EvalResult<Value> {
    match seq {
        Value::Str(s) => {
            let total = (s.chars().count() as u64).saturating_mul(times);
            check_alloc(total, alloc_limit)?;
            Ok(Value::Str(Rc::from(s.repeat(times as usize))))
        }
        Value::List(items) => {
            let items = items.borrow();
            check_alloc((items.len() as u64).saturating_mul(times), alloc_limit)?;
            Ok(Value::list(repeat_items(&items, times)))
        }
        Value::Tuple(items) => {
            check_alloc((items.len() as u64).saturating_mul(times), alloc_limit)?;
            Ok(Value::tuple(repeat_items(items, times)))
        }
        other => Err(Fault::type_error(format!(
            "can't multiply sequence of type '{}'",
            other.type_name()
        ))),
    }
}

fn repeat_items(items: &[Value], times: u64) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * times as usize);
    for _ in 0..times {
        out.extend(items.iter().cloned());
    }
    out
}

fn set_members(v: &Value) -> Vec<(Key, Value)> {
    let store = match v {
        Value::Set(s) => s.borrow().clone(),
        Value::FrozenSet(s) => (**s).clone(),
        _ => DictStore::new(),
    };
    let mut out = Vec::with_capacity(store.len());
    for k in store.keys() {
        if let Ok(key) = k.to_key() {
            out.push((key, k.clone()));
        }
    }
    out
}

fn set_binary(op: BinaryOp, a: &Value, b: &Value) -> EvalResult<Value> {
    let left = set_members(a);
    let right = set_members(b);
    let in_right = |k: &Key| right.iter().any(|(rk, _)| rk == k);
    let in_left = |k: &Key| left.iter().any(|(lk, _)| lk == k);
    let mut store = DictStore::new();
    let mut add = |k: &Key, v: &Value| store.insert(k.clone(), v.clone(), Value::None);
    match op {
        BinaryOp::BitOr => {
            left.iter().chain(right.iter()).for_each(|(k, v)| add(k, v));
        }
        BinaryOp::BitAnd => left.iter().filter(|(k, _)| in_right(k)).for_each(|(k, v)| add(k, v)),
        BinaryOp::Sub => left.iter().filter(|(k, _)| !in_right(k)).for_each(|(k, v)| add(k, v)),
        _ => {
            left.iter().filter(|(k, _)| !in_right(k)).for_each(|(k, v)| add(k, v));
            right.iter().filter(|(k, _)| !in_left(k)).for_each(|(k, v)| add(k, v));
        }
    }
    Ok(match a {
        Value::FrozenSet(_) => Value::FrozenSet(Rc::new(store)),
        _ => Value::Set(Rc::new(std::cell::RefCell::new(store))),
    })
}

fn floor_div_i64(x: i64, y: i64) -> Option<i64> {
    let q = x.checked_div(y)?;
    if (x % y != 0) && ((x < 0) != (y < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn int_binary(op: BinaryOp, x: i64, y: i64) -> EvalResult<Value> {
    let int = |v: Option<i64>| v.map(Value::Int).ok_or_else(Fault::overflow);
    match op {
        BinaryOp::Add => int(x.checked_add(y)),
        BinaryOp::Sub => int(x.checked_sub(y)),
        BinaryOp::Mult => int(x.checked_mul(y)),
        BinaryOp::Div => {
            if y == 0 {
                return Err(Fault::zero_division("division by zero"));
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinaryOp::FloorDiv => {
            if y == 0 {
                return Err(Fault::zero_division("integer division or modulo by zero"));
            }
            int(floor_div_i64(x, y))
        }
        BinaryOp::Mod => {
            if y == 0 {
                return Err(Fault::zero_division("integer modulo by zero"));
            }
            let r = x.checked_rem(y).unwrap_or(0);
            Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
        }
        BinaryOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(Fault::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            match (x, u32::try_from(y)) {
                (0 | 1, _) => Ok(Value::Int(if y == 0 { 1 } else { x })),
                (-1, _) => Ok(Value::Int(if y % 2 == 0 { 1 } else { -1 })),
                (_, Ok(exp)) => int(x.checked_pow(exp)),
                (_, Err(_)) => Err(Fault::overflow()),
            }
        }
        BinaryOp::BitAnd => Ok(Value::Int(x & y)),
        BinaryOp::BitOr => Ok(Value::Int(x | y)),
        BinaryOp::BitXor => Ok(Value::Int(x ^ y)),
        BinaryOp::LShift => {
            if y < 0 {
                return Err(Fault::value_error("negative shift count"));
            }
            if x == 0 {
                return Ok(Value::Int(0));
            }
            if y >= 63 {
                return Err(Fault::overflow());
            }
            let shifted = x << y;
            if shifted >> y != x {
                return Err(Fault::overflow());
            }
            Ok(Value::Int(shifted))
        }
        BinaryOp::RShift => {
            if y < 0 {
                return Err(Fault::value_error("negative shift count"));
            }
            Ok(Value::Int(if y >= 64 { if x < 0 { -1 } else { 0 } } else { x >> y }))
        }
        BinaryOp::MatMult => Err(Fault::type_error(
            "unsupported operand type(s) for @: 'int' and 'int'",
        )),
    }
}

/// Float arithmetic. An empty-message `TypeError` marks an unsupported
/// operator so the caller can name the operand types.
fn float_binary(op: BinaryOp, x: f64, y: f64) -> EvalResult<Value> {
    match op {
        BinaryOp::Add => Ok(Value::Float(x + y)),
        BinaryOp::Sub => Ok(Value::Float(x - y)),
        BinaryOp::Mult => Ok(Value::Float(x * y)),
        BinaryOp::Div => {
            if y == 0.0 {
                return Err(Fault::zero_division("float division by zero"));
            }
            Ok(Value::Float(x / y))
        }
        BinaryOp::FloorDiv => {
            if y == 0.0 {
                return Err(Fault::zero_division("float floor division by zero"));
            }
            Ok(Value::Float((x / y).floor()))
        }
        BinaryOp::Mod => {
            if y == 0.0 {
                return Err(Fault::zero_division("float modulo"));
            }
            let r = x % y;
            Ok(Value::Float(if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r }))
        }
        BinaryOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(Fault::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Err(Fault::value_error(
                    "negative number cannot be raised to a fractional power",
                ));
            }
            let r = x.powf(y);
            if r.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(Fault::raise("OverflowError", "numerical result out of range"));
            }
            Ok(Value::Float(r))
        }
        _ => Err(Fault::type_error("")),
    }
}

pub fn unary(op: UnaryOp, v: &Value) -> EvalResult<Value> {
    let bad = || {
        let sym = match op {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Invert => "~",
            UnaryOp::Not => "not",
        };
        Fault::type_error(format!("bad operand type for unary {sym}: '{}'", v.type_name()))
    };
    match op {
        UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
        UnaryOp::Neg => match v {
            Value::Float(f) => Ok(Value::Float(-f)),
            other => match other.as_int() {
                Some(i) => i.checked_neg().map(Value::Int).ok_or_else(Fault::overflow),
                None => Err(bad()),
            },
        },
        UnaryOp::Pos => match v {
            Value::Float(f) => Ok(Value::Float(*f)),
            other => other.as_int().map(Value::Int).ok_or_else(bad),
        },
        UnaryOp::Invert => v.as_int().map(|i| Value::Int(!i)).ok_or_else(bad),
    }
}

/// Ordering for `<`-style comparisons. `Ok(None)` means unordered (NaN).
pub fn partial_order(a: &Value, b: &Value, symbol: &str) -> EvalResult<Option<Ordering>> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Ok(Some(x.cmp(&y)));
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return Ok(x.partial_cmp(&y));
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(Some(x.cmp(y))),
        (Value::List(_), Value::List(_)) | (Value::Tuple(_), Value::Tuple(_)) => {
            let xs = a.sequence_snapshot().unwrap_or_default();
            let ys = b.sequence_snapshot().unwrap_or_default();
            for (x, y) in xs.iter().zip(ys.iter()) {
                if !values_equal(x, y, 0) {
                    return partial_order(x, y, symbol);
                }
            }
            Ok(Some(xs.len().cmp(&ys.len())))
        }
        _ => Err(Fault::type_error(format!(
            "'{symbol}' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Total ordering used by `sorted`, `min` and `max`.
pub fn order(a: &Value, b: &Value) -> EvalResult<Ordering> {
    Ok(partial_order(a, b, "<")?.unwrap_or(Ordering::Equal))
}

fn identical(a: &Value, b: &Value) -> bool {
    match (a.heap_id(), b.heap_id()) {
        (Some(x), Some(y)) => x == y,
        (None, None) => match (a, b) {
            (Value::None, Value::None) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            _ => values_equal(a, b, 0) && a.type_name() == b.type_name(),
        },
        _ => false,
    }
}

pub fn compare(op: CmpOp, a: &Value, b: &Value) -> EvalResult<bool> {
    let ordered = |sym: &str, f: fn(Ordering) -> bool| -> EvalResult<bool> {
        Ok(partial_order(a, b, sym)?.is_some_and(f))
    };
    match op {
        CmpOp::Eq => Ok(values_equal(a, b, 0)),
        CmpOp::NotEq => Ok(!values_equal(a, b, 0)),
        CmpOp::Lt => ordered("<", Ordering::is_lt),
        CmpOp::LtE => ordered("<=", Ordering::is_le),
        CmpOp::Gt => ordered(">", Ordering::is_gt),
        CmpOp::GtE => ordered(">=", Ordering::is_ge),
        CmpOp::Is => Ok(identical(a, b)),
        CmpOp::IsNot => Ok(!identical(a, b)),
        CmpOp::In => contains(b, a),
        CmpOp::NotIn => contains(b, a).map(|found| !found),
    }
}

pub fn contains(container: &Value, item: &Value) -> EvalResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            other => Err(Fault::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(_) | Value::Tuple(_) => Ok(container
            .sequence_snapshot()
            .unwrap_or_default()
            .iter()
            .any(|v| values_equal(v, item, 0))),
        Value::Dict(store) | Value::Set(store) => Ok(store.borrow().contains(&item.to_key()?)),
        Value::FrozenDict(store) | Value::FrozenSet(store) => Ok(store.contains(&item.to_key()?)),
        Value::Range(r) => Ok(match item {
            Value::Float(f) if f.fract() == 0.0 => r.contains(*f as i64),
            other => other.as_int().is_some_and(|i| r.contains(i)),
        }),
        other => Err(Fault::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn normalize_index(index: &Value, len: usize, what: &str) -> EvalResult<usize> {
    let Some(i) = index.as_int() else {
        return Err(Fault::type_error(format!(
            "{what} indices must be integers or slices, not {}",
            index.type_name()
        )));
    };
    let len_i = len as i64;
    let real = if i < 0 { i + len_i } else { i };
    if real < 0 || real >= len_i {
        return Err(Fault::raise("IndexError", format!("{what} index out of range")));
    }
    Ok(real as usize)
}

pub fn subscript(value: &Value, index: &Value) -> EvalResult<Value> {
    match value {
        Value::List(items) => {
            let items = items.borrow();
            let i = normalize_index(index, items.len(), "list")?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            let i = normalize_index(index, items.len(), "tuple")?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(index, chars.len(), "string")?;
            Ok(Value::Str(Rc::from(chars[i].to_string())))
        }
        Value::Range(r) => {
            let len = usize::try_from(r.len()).unwrap_or(usize::MAX);
            let i = normalize_index(index, len, "range object")?;
            Ok(Value::Int(r.get(i as u64)))
        }
        Value::Dict(_) | Value::FrozenDict(_) => {
            let key = index.to_key()?;
            let found = match value {
                Value::Dict(store) => store.borrow().get(&key).cloned(),
                Value::FrozenDict(store) => store.get(&key).cloned(),
                _ => None,
            };
            found.ok_or_else(|| Fault::raise("KeyError", index.repr()))
        }
        other => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// Element positions selected by a slice over a sequence of `len` items.
pub fn slice_positions(
    len: usize,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> EvalResult<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Fault::value_error("slice step cannot be zero"));
    }
    let len = len as i64;
    let mut out = Vec::new();
    if step > 0 {
        let clamp = |x: i64| {
            if x < 0 {
                (x + len).max(0)
            } else {
                x.min(len)
            }
        };
        let (mut i, hi) = (lower.map_or(0, clamp), upper.map_or(len, clamp));
        while i < hi {
            out.push(i as usize);
            i += step;
        }
    } else {
        let clamp = |x: i64| {
            if x < 0 {
                (x + len).max(-1)
            } else {
                x.min(len - 1)
            }
        };
        let (mut i, lo) = (lower.map_or(len - 1, clamp), upper.map_or(-1, clamp));
        while i > lo {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}

pub fn slice(
    value: &Value,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> EvalResult<Value> {
    match value {
        Value::List(items) => {
            let items = items.borrow();
            let picked = slice_positions(items.len(), lower, upper, step)?;
            Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Tuple(items) => {
            let picked = slice_positions(items.len(), lower, upper, step)?;
            Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picked = slice_positions(chars.len(), lower, upper, step)?;
            Ok(Value::Str(Rc::from(
                picked.into_iter().map(|i| chars[i]).collect::<String>(),
            )))
        }
        other => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn store_subscript(target: &Value, index: &Value, value: Value) -> EvalResult<()> {
    match target {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let i = normalize_index(index, len, "list").map_err(|f| match f {
                Fault::Raise(exc) if exc.type_name == "IndexError" => {
                    Fault::raise("IndexError", "list assignment index out of range")
                }
                other => other,
            })?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(store) => {
            let key = index.to_key()?;
            store.borrow_mut().insert(key, index.clone(), value);
            Ok(())
        }
        Value::FrozenDict(_) => Err(Fault::type_error("FrozenDict is read-only")),
        other => Err(Fault::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Lazy iteration over an iterable value.
pub enum ValueIter {
    Range { next: i128, stop: i128, step: i128 },
    Items(std::vec::IntoIter<Value>),
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Range { next, stop, step } => {
                let more = if *step > 0 { *next < *stop } else { *next > *stop };
                if !more {
                    return None;
                }
                let v = *next as i64;
                *next += *step;
                Some(Value::Int(v))
            }
            ValueIter::Items(items) => items.next(),
        }
    }
}

pub fn iterate(value: &Value) -> EvalResult<ValueIter> {
    let items = match value {
        Value::Range(r) => {
            return Ok(ValueIter::Range {
                next: i128::from(r.start),
                stop: i128::from(r.stop),
                step: i128::from(r.step),
            })
        }
        Value::Str(s) => s.chars().map(|c| Value::Str(Rc::from(c.to_string()))).collect(),
        Value::Dict(store) => store.borrow().keys().cloned().collect(),
        Value::FrozenDict(store) => store.keys().cloned().collect(),
        other => match other.sequence_snapshot() {
            Some(items) => items,
            None => {
                return Err(Fault::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        },
    };
    Ok(ValueIter::Items(items.into_iter()))
}
