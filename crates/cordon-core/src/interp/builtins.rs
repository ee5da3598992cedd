//! Built-in functions available to scripts.

use std::cmp::Ordering;
use std::rc::Rc;

use cordon_script::ast::BinaryOp;

use super::eval::Interpreter;
use super::ops;
use super::value::{DictStore, Range, Value};
use super::{EvalResult, Fault};
use crate::guard::StreamKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Abs,
    All,
    Any,
    Bool,
    Dict,
    Divmod,
    Enumerate,
    Float,
    Int,
    Len,
    List,
    Max,
    Min,
    Pow,
    Print,
    Range,
    Repr,
    Reversed,
    Round,
    Set,
    Sorted,
    Str,
    Sum,
    Tuple,
    Zip,
}

impl Builtin {
    pub const ALL: &'static [Builtin] = &[
        Builtin::Abs,
        Builtin::All,
        Builtin::Any,
        Builtin::Bool,
        Builtin::Dict,
        Builtin::Divmod,
        Builtin::Enumerate,
        Builtin::Float,
        Builtin::Int,
        Builtin::Len,
        Builtin::List,
        Builtin::Max,
        Builtin::Min,
        Builtin::Pow,
        Builtin::Print,
        Builtin::Range,
        Builtin::Repr,
        Builtin::Reversed,
        Builtin::Round,
        Builtin::Set,
        Builtin::Sorted,
        Builtin::Str,
        Builtin::Sum,
        Builtin::Tuple,
        Builtin::Zip,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Abs => "abs",
            Builtin::All => "all",
            Builtin::Any => "any",
            Builtin::Bool => "bool",
            Builtin::Dict => "dict",
            Builtin::Divmod => "divmod",
            Builtin::Enumerate => "enumerate",
            Builtin::Float => "float",
            Builtin::Int => "int",
            Builtin::Len => "len",
            Builtin::List => "list",
            Builtin::Max => "max",
            Builtin::Min => "min",
            Builtin::Pow => "pow",
            Builtin::Print => "print",
            Builtin::Range => "range",
            Builtin::Repr => "repr",
            Builtin::Reversed => "reversed",
            Builtin::Round => "round",
            Builtin::Set => "set",
            Builtin::Sorted => "sorted",
            Builtin::Str => "str",
            Builtin::Sum => "sum",
            Builtin::Tuple => "tuple",
            Builtin::Zip => "zip",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.name() == name)
    }
}

/// Keyword arguments of one builtin call; leftovers are an error.
struct Kwargs {
    func: &'static str,
    items: Vec<(String, Value)>,
}

impl Kwargs {
    fn take(&mut self, key: &str) -> Option<Value> {
        let pos = self.items.iter().position(|(k, _)| k == key)?;
        Some(self.items.remove(pos).1)
    }

    fn finish(&self) -> EvalResult<()> {
        match self.items.first() {
            Some((k, _)) => Err(Fault::type_error(format!(
                "{}() got an unexpected keyword argument '{k}'",
                self.func
            ))),
            None => Ok(()),
        }
    }
}

fn arity(func: &str, args: &[Value], min: usize, max: usize) -> EvalResult<()> {
    let n = args.len();
    if n < min {
        return Err(Fault::type_error(format!(
            "{func}() expected at least {min} argument{}, got {n}",
            if min == 1 { "" } else { "s" }
        )));
    }
    if n > max {
        return Err(Fault::type_error(format!(
            "{func}() expected at most {max} argument{}, got {n}",
            if max == 1 { "" } else { "s" }
        )));
    }
    Ok(())
}

fn index_arg(func: &str, v: &Value) -> EvalResult<i64> {
    v.as_int().ok_or_else(|| {
        Fault::type_error(format!(
            "'{}' object cannot be interpreted as an integer (in {func}())",
            v.type_name()
        ))
    })
}

fn float_to_int(f: f64) -> EvalResult<i64> {
    if f.is_nan() {
        return Err(Fault::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Fault::raise(
            "OverflowError",
            "cannot convert float infinity to integer",
        ));
    }
    if f < i64::MIN as f64 || f >= i64::MAX as f64 {
        return Err(Fault::overflow());
    }
    Ok(f as i64)
}

fn parse_int(text: &str, base: u32) -> EvalResult<i64> {
    let invalid = || {
        Fault::value_error(format!(
            "invalid literal for int() with base {base}: {}",
            super::value::str_repr(text)
        ))
    };
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let digits = match base {
        16 => digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits),
        8 => digits
            .strip_prefix("0o")
            .or_else(|| digits.strip_prefix("0O"))
            .unwrap_or(digits),
        2 => digits
            .strip_prefix("0b")
            .or_else(|| digits.strip_prefix("0B"))
            .unwrap_or(digits),
        _ => digits,
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return Err(invalid());
    }
    let magnitude = u64::from_str_radix(digits, base).map_err(|e| match e.kind() {
        std::num::IntErrorKind::PosOverflow => Fault::overflow(),
        _ => invalid(),
    })?;
    let value = if negative {
        0i128 - i128::from(magnitude)
    } else {
        i128::from(magnitude)
    };
    i64::try_from(value).map_err(|_| Fault::overflow())
}

fn parse_float(text: &str) -> EvalResult<f64> {
    let trimmed = text.trim();
    trimmed.parse::<f64>().map_err(|_| {
        Fault::value_error(format!(
            "could not convert string to float: {}",
            super::value::str_repr(text)
        ))
    })
}

/// `pow(base, exp, modulus)` with the result taking the sign of `modulus`.
fn mod_pow(base: i64, exp: i64, modulus: i64) -> i64 {
    let m = i128::from(modulus).abs();
    let mut result: i128 = 1 % m;
    let mut b = i128::from(base).rem_euclid(m);
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result = result * b % m;
        }
        b = b * b % m;
        e >>= 1;
    }
    if modulus < 0 && result != 0 {
        result += i128::from(modulus);
    }
    result as i64
}

/// Round half to even at a negative number of decimal places.
fn round_int(value: i64, ndigits: i64) -> EvalResult<i64> {
    if ndigits >= 0 {
        return Ok(value);
    }
    if ndigits < -18 {
        return Ok(0);
    }
    let p = 10i128.pow((-ndigits) as u32);
    let v = i128::from(value);
    let (q, r) = (v.div_euclid(p), v.rem_euclid(p));
    let q = if 2 * r > p || (2 * r == p && q % 2 != 0) {
        q + 1
    } else {
        q
    };
    i64::try_from(q * p).map_err(|_| Fault::overflow())
}

fn round_float(value: f64, ndigits: i64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let p = 10f64.powi(ndigits.unsigned_abs().min(308) as i32);
    let scaled = if ndigits >= 0 { value * p } else { value / p };
    if !scaled.is_finite() {
        return value;
    }
    let rounded = if ndigits >= 0 {
        scaled.round_ties_even() / p
    } else {
        scaled.round_ties_even() * p
    };
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

impl Interpreter<'_> {
    pub(super) fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        let name = builtin.name();
        let mut kw = Kwargs {
            func: name,
            items: kwargs,
        };
        let takes_keywords = matches!(
            builtin,
            Builtin::Dict
                | Builtin::Print
                | Builtin::Max
                | Builtin::Min
                | Builtin::Sorted
                | Builtin::Enumerate
                | Builtin::Int
                | Builtin::Round
                | Builtin::Sum
        );
        if !takes_keywords {
            kw.finish()?;
        }

        match builtin {
            Builtin::Dict => self.builtin_dict(args, std::mem::take(&mut kw.items)),
            Builtin::Print => self.builtin_print(args, kw),
            Builtin::Max | Builtin::Min => self.builtin_extreme(builtin, args, kw),
            Builtin::Sorted => self.builtin_sorted(args, kw),
            Builtin::Enumerate => {
                let start = kw.take("start");
                kw.finish()?;
                self.builtin_enumerate(args, start)
            }
            Builtin::Int => {
                let base = kw.take("base");
                kw.finish()?;
                self.builtin_int(args, base)
            }
            Builtin::Round => {
                let ndigits = kw.take("ndigits");
                kw.finish()?;
                builtin_round(args, ndigits)
            }
            Builtin::Sum => {
                let start = kw.take("start");
                kw.finish()?;
                self.builtin_sum(args, start)
            }
            Builtin::Abs => {
                arity(name, &args, 1, 1)?;
                match &args[0] {
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    v => match v.as_int() {
                        Some(i) => i.checked_abs().map(Value::Int).ok_or_else(Fault::overflow),
                        None => Err(Fault::type_error(format!(
                            "bad operand type for abs(): '{}'",
                            v.type_name()
                        ))),
                    },
                }
            }
            Builtin::All | Builtin::Any => {
                arity(name, &args, 1, 1)?;
                let want = builtin == Builtin::Any;
                for item in ops::iterate(&args[0])? {
                    self.tick_item()?;
                    if item.truthy() == want {
                        return Ok(Value::Bool(want));
                    }
                }
                Ok(Value::Bool(!want))
            }
            Builtin::Bool => {
                arity(name, &args, 0, 1)?;
                Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
            }
            Builtin::Divmod => {
                arity(name, &args, 2, 2)?;
                let limit = self.alloc_limit();
                let q = ops::binary(BinaryOp::FloorDiv, &args[0], &args[1], limit)?;
                let r = ops::binary(BinaryOp::Mod, &args[0], &args[1], limit)?;
                Ok(Value::tuple(vec![q, r]))
            }
            Builtin::Float => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Ok(Value::Float(0.0)),
                    Some(Value::Str(s)) => parse_float(s).map(Value::Float),
                    Some(v) => v.as_f64().map(Value::Float).ok_or_else(|| {
                        Fault::type_error(format!(
                            "float() argument must be a string or a number, not '{}'",
                            v.type_name()
                        ))
                    }),
                }
            }
            Builtin::Len => {
                arity(name, &args, 1, 1)?;
                let n = match &args[0] {
                    Value::Str(s) => s.chars().count() as u64,
                    Value::List(items) => items.borrow().len() as u64,
                    Value::Tuple(items) => items.len() as u64,
                    Value::Dict(store) | Value::Set(store) => store.borrow().len() as u64,
                    Value::FrozenDict(store) | Value::FrozenSet(store) => store.len() as u64,
                    Value::Range(r) => r.len(),
                    other => {
                        return Err(Fault::type_error(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                };
                i64::try_from(n).map(Value::Int).map_err(|_| Fault::overflow())
            }
            Builtin::List | Builtin::Tuple | Builtin::Set => {
                arity(name, &args, 0, 1)?;
                let items = match args.first() {
                    Some(v) => self.collect(v)?,
                    None => Vec::new(),
                };
                Ok(match builtin {
                    Builtin::List => Value::list(items),
                    Builtin::Tuple => Value::tuple(items),
                    _ => Value::Set(Rc::new(std::cell::RefCell::new(DictStore::from_members(
                        items,
                    )?))),
                })
            }
            Builtin::Pow => {
                arity(name, &args, 2, 3)?;
                if args.len() == 2 {
                    return ops::binary(BinaryOp::Pow, &args[0], &args[1], self.alloc_limit());
                }
                let (Some(base), Some(exp), Some(modulus)) =
                    (args[0].as_int(), args[1].as_int(), args[2].as_int())
                else {
                    return Err(Fault::type_error(
                        "pow() 3rd argument not allowed unless all arguments are integers",
                    ));
                };
                if modulus == 0 {
                    return Err(Fault::value_error("pow() 3rd argument cannot be 0"));
                }
                if exp < 0 {
                    return Err(Fault::value_error(
                        "pow() 2nd argument cannot be negative when 3rd argument specified",
                    ));
                }
                Ok(Value::Int(mod_pow(base, exp, modulus)))
            }
            Builtin::Range => {
                let ints = args
                    .iter()
                    .map(|v| index_arg(name, v))
                    .collect::<EvalResult<Vec<i64>>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => {
                        return Err(Fault::type_error(format!(
                            "range expected 1 to 3 arguments, got {}",
                            ints.len()
                        )))
                    }
                };
                if step == 0 {
                    return Err(Fault::value_error("range() arg 3 must not be zero"));
                }
                Ok(Value::Range(Range { start, stop, step }))
            }
            Builtin::Repr => {
                arity(name, &args, 1, 1)?;
                Ok(Value::str(&args[0].repr()))
            }
            Builtin::Reversed => {
                arity(name, &args, 1, 1)?;
                if matches!(args[0], Value::Set(_) | Value::FrozenSet(_)) {
                    return Err(Fault::type_error(format!(
                        "'{}' object is not reversible",
                        args[0].type_name()
                    )));
                }
                let mut items = self.collect(&args[0])?;
                items.reverse();
                Ok(Value::list(items))
            }
            Builtin::Str => {
                arity(name, &args, 0, 1)?;
                Ok(Value::str(&args.first().map(Value::to_str).unwrap_or_default()))
            }
            Builtin::Zip => self.builtin_zip(args),
        }
    }

    fn builtin_dict(&mut self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> EvalResult<Value> {
        arity("dict", &args, 0, 1)?;
        let mut store = DictStore::new();
        if let Some(source) = args.first() {
            if let Some(entries) = source.dict_entries() {
                for (k, v) in entries {
                    self.tick_item()?;
                    store.insert(k.to_key()?, k, v);
                }
            } else {
                for (i, item) in ops::iterate(source)?.enumerate() {
                    self.tick_item()?;
                    let pair = match &item {
                        Value::Str(_) => None,
                        other => other.sequence_snapshot(),
                    };
                    match pair.as_deref() {
                        Some([k, v]) => store.insert(k.to_key()?, k.clone(), v.clone()),
                        Some(other) => {
                            return Err(Fault::value_error(format!(
                                "dictionary update sequence element #{i} has length {}; 2 is required",
                                other.len()
                            )))
                        }
                        None => {
                            return Err(Fault::type_error(format!(
                                "cannot convert dictionary update sequence element #{i} to a sequence"
                            )))
                        }
                    }
                }
            }
        }
        for (k, v) in kwargs {
            let key = Value::str(&k);
            store.insert(key.to_key()?, key, v);
        }
        Ok(Value::dict(store))
    }

    fn builtin_print(&mut self, args: Vec<Value>, mut kw: Kwargs) -> EvalResult<Value> {
        let text_kw = |kw: &mut Kwargs, key: &str, default: &str| -> EvalResult<String> {
            match kw.take(key) {
                None | Some(Value::None) => Ok(default.to_string()),
                Some(Value::Str(s)) => Ok(s.to_string()),
                Some(other) => Err(Fault::type_error(format!(
                    "{key} must be None or a string, not {}",
                    other.type_name()
                ))),
            }
        };
        let sep = text_kw(&mut kw, "sep", " ")?;
        let end = text_kw(&mut kw, "end", "\n")?;
        let stream = match kw.take("file") {
            None | Some(Value::None) => StreamKind::Stdout,
            Some(Value::Str(s)) if &*s == "stdout" => StreamKind::Stdout,
            Some(Value::Str(s)) if &*s == "stderr" => StreamKind::Stderr,
            Some(_) => {
                return Err(Fault::value_error(
                    "print() file must be 'stdout' or 'stderr'",
                ))
            }
        };
        kw.finish()?;
        let mut text = args.iter().map(Value::to_str).collect::<Vec<_>>().join(&sep);
        text.push_str(&end);
        self.write_output(stream, &text);
        Ok(Value::None)
    }

    fn builtin_extreme(
        &mut self,
        builtin: Builtin,
        args: Vec<Value>,
        mut kw: Kwargs,
    ) -> EvalResult<Value> {
        let name = builtin.name();
        let key = kw.take("key").filter(|k| !matches!(k, Value::None));
        let default = kw.take("default");
        kw.finish()?;
        let items = match args.len() {
            0 => {
                return Err(Fault::type_error(format!(
                    "{name} expected at least 1 argument, got 0"
                )))
            }
            1 => self.collect(&args[0])?,
            _ => {
                if default.is_some() {
                    return Err(Fault::type_error(format!(
                        "Cannot specify a default for {name}() with multiple positional arguments"
                    )));
                }
                args
            }
        };
        let want = if builtin == Builtin::Max {
            Ordering::Greater
        } else {
            Ordering::Less
        };
        let mut best: Option<(Value, Value)> = None;
        for item in items {
            let k = match &key {
                Some(f) => self.call_value(f.clone(), vec![item.clone()], Vec::new())?,
                None => item.clone(),
            };
            let replace = match &best {
                None => true,
                Some((best_key, _)) => ops::order(&k, best_key)? == want,
            };
            if replace {
                best = Some((k, item));
            }
        }
        match (best, default) {
            (Some((_, item)), _) => Ok(item),
            (None, Some(d)) => Ok(d),
            (None, None) => Err(Fault::value_error(format!(
                "{name}() arg is an empty sequence"
            ))),
        }
    }

    fn builtin_sorted(&mut self, args: Vec<Value>, mut kw: Kwargs) -> EvalResult<Value> {
        let key = kw.take("key").filter(|k| !matches!(k, Value::None));
        let reverse = kw.take("reverse").is_some_and(|v| v.truthy());
        kw.finish()?;
        arity("sorted", &args, 1, 1)?;
        let items = self.collect(&args[0])?;
        let mut decorated = Vec::with_capacity(items.len());
        for item in items {
            let k = match &key {
                Some(f) => self.call_value(f.clone(), vec![item.clone()], Vec::new())?,
                None => item.clone(),
            };
            decorated.push((k, item));
        }
        let mut failure: Option<Fault> = None;
        decorated.sort_by(|(a, _), (b, _)| {
            if failure.is_some() {
                return Ordering::Equal;
            }
            match ops::order(a, b) {
                Ok(o) if reverse => o.reverse(),
                Ok(o) => o,
                Err(f) => {
                    failure = Some(f);
                    Ordering::Equal
                }
            }
        });
        if let Some(f) = failure {
            return Err(f);
        }
        Ok(Value::list(decorated.into_iter().map(|(_, v)| v).collect()))
    }

    fn builtin_enumerate(&mut self, args: Vec<Value>, start: Option<Value>) -> EvalResult<Value> {
        arity("enumerate", &args, 1, 2)?;
        let start = match start.as_ref().or(args.get(1)) {
            Some(v) => index_arg("enumerate", v)?,
            None => 0,
        };
        let items = self.collect(&args[0])?;
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let n = start.checked_add(i as i64).ok_or_else(Fault::overflow)?;
            out.push(Value::tuple(vec![Value::Int(n), item]));
        }
        Ok(Value::list(out))
    }

    fn builtin_int(&mut self, args: Vec<Value>, base: Option<Value>) -> EvalResult<Value> {
        arity("int", &args, 0, 2)?;
        let base = match base.as_ref().or(args.get(1)) {
            Some(b) => Some(index_arg("int", b)?),
            None => None,
        };
        let Some(value) = args.first() else {
            return Ok(Value::Int(0));
        };
        if let Some(b) = base {
            let Value::Str(s) = value else {
                return Err(Fault::type_error(
                    "int() can't convert non-string with explicit base",
                ));
            };
            if !(2..=36).contains(&b) {
                return Err(Fault::value_error("int() base must be >= 2 and <= 36"));
            }
            return parse_int(s, b as u32).map(Value::Int);
        }
        match value {
            Value::Str(s) => parse_int(s, 10).map(Value::Int),
            Value::Float(f) => float_to_int(*f).map(Value::Int),
            v => v.as_int().map(Value::Int).ok_or_else(|| {
                Fault::type_error(format!(
                    "int() argument must be a string or a number, not '{}'",
                    v.type_name()
                ))
            }),
        }
    }

    fn builtin_sum(&mut self, args: Vec<Value>, start: Option<Value>) -> EvalResult<Value> {
        arity("sum", &args, 1, 2)?;
        let mut total = start.or_else(|| args.get(1).cloned()).unwrap_or(Value::Int(0));
        if matches!(total, Value::Str(_)) {
            return Err(Fault::type_error(
                "sum() can't sum strings [use ''.join(seq) instead]",
            ));
        }
        let limit = self.alloc_limit();
        for item in ops::iterate(&args[0])? {
            self.tick_item()?;
            total = ops::binary(BinaryOp::Add, &total, &item, limit)?;
        }
        Ok(total)
    }

    fn builtin_zip(&mut self, args: Vec<Value>) -> EvalResult<Value> {
        if args.is_empty() {
            return Ok(Value::list(Vec::new()));
        }
        let mut iters = args
            .iter()
            .map(ops::iterate)
            .collect::<EvalResult<Vec<_>>>()?;
        let limit = self.alloc_limit();
        let mut out = Vec::new();
        'rows: loop {
            let mut row = Vec::with_capacity(iters.len());
            for it in iters.iter_mut() {
                match it.next() {
                    Some(v) => row.push(v),
                    None => break 'rows,
                }
            }
            self.tick_item()?;
            ops::check_alloc(out.len() as u64 + 1, limit)?;
            out.push(Value::tuple(row));
        }
        Ok(Value::list(out))
    }
}

fn builtin_round(args: Vec<Value>, ndigits: Option<Value>) -> EvalResult<Value> {
    arity("round", &args, 1, 2)?;
    let ndigits = match ndigits.as_ref().or(args.get(1)) {
        None | Some(Value::None) => None,
        Some(v) => Some(index_arg("round", v)?),
    };
    match (&args[0], ndigits) {
        (Value::Float(f), None) => {
            if f.is_nan() {
                return Err(Fault::value_error("cannot convert float NaN to integer"));
            }
            if f.is_infinite() {
                return Err(Fault::raise(
                    "OverflowError",
                    "cannot convert float infinity to integer",
                ));
            }
            float_to_int(f.round_ties_even()).map(Value::Int)
        }
        (Value::Float(f), Some(nd)) => Ok(Value::Float(round_float(*f, nd))),
        (v, nd) => match v.as_int() {
            Some(i) => round_int(i, nd.unwrap_or(0)).map(Value::Int),
            None => Err(Fault::type_error(format!(
                "type {} doesn't define __round__ method",
                v.type_name()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for b in Builtin::ALL {
            assert_eq!(Builtin::from_name(b.name()), Some(*b));
        }
        assert_eq!(Builtin::from_name("eval"), None);
    }

    #[test]
    fn test_modular_pow_follows_modulus_sign() {
        assert_eq!(mod_pow(3, 4, 5), 1);
        assert_eq!(mod_pow(3, 2, -4), -3);
        assert_eq!(mod_pow(-2, 3, 5), 2);
        assert_eq!(mod_pow(7, 0, 1), 0);
    }

    #[test]
    fn test_int_rounding_is_half_even() {
        assert_eq!(round_int(1250, -2).unwrap(), 1200);
        assert_eq!(round_int(1350, -2).unwrap(), 1400);
        assert_eq!(round_int(-150, -2).unwrap(), -200);
        assert_eq!(round_int(42, 3).unwrap(), 42);
    }

    #[test]
    fn test_float_rounding() {
        assert_eq!(round_float(2.675, 1), 2.7);
        assert_eq!(round_float(0.5, 0), 0.0);
        assert_eq!(round_float(1234.5, -2), 1200.0);
    }

    #[test]
    fn test_int_parsing() {
        assert_eq!(parse_int(" -42 ", 10).unwrap(), -42);
        assert_eq!(parse_int("ff", 16).unwrap(), 255);
        assert_eq!(parse_int("0x1F", 16).unwrap(), 31);
        match parse_int("12a", 10) {
            Err(Fault::Raise(exc)) => assert_eq!(exc.type_name, "ValueError"),
            other => panic!("expected ValueError, got {other:?}"),
        }
        match parse_int("99999999999999999999", 10) {
            Err(Fault::Raise(exc)) => assert_eq!(exc.type_name, "OverflowError"),
            other => panic!("expected OverflowError, got {other:?}"),
        }
    }

    #[test]
    fn test_float_conversion_rejects_non_finite_ints() {
        match float_to_int(f64::NAN) {
            Err(Fault::Raise(exc)) => assert_eq!(exc.type_name, "ValueError"),
            other => panic!("expected ValueError, got {other:?}"),
        }
        assert_eq!(float_to_int(-3.9).unwrap(), -3);
    }
}
