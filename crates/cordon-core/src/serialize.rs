//! JSON-safe conversion of script values.
//!
//! Everything the host receives from a script (result, stats, events,
//! locals) passes through [`to_safe_json`], which bounds depth, item count,
//! string length and total bytes, and replaces what it cannot represent with
//! `<truncated:..>` or `<opaque:..>` markers instead of failing.

use crate::error::{Result, SandboxError};
use crate::interp::Value;

pub const MAX_DEPTH: usize = 10;
pub const MAX_ITEMS: usize = 2000;
pub const MAX_STR: usize = 10_000;

/// Depth ceiling used when sizing capability return values.
const SIZE_MAX_DEPTH: usize = 6;

const TRUNCATED_SUFFIX: &str = "<truncated>";

/// Float rendering in the `[+][.N](f|F|e|E|%)` mini-language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatFormat {
    sign: bool,
    precision: usize,
    style: FloatStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FloatStyle {
    Fixed,
    FixedUpper,
    Exp,
    ExpUpper,
    Percent,
}

impl FloatFormat {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || {
            SandboxError::InvalidConfig(format!(
                "float_format '{spec}' is not supported; expected e.g. '.6f' or '.3e'"
            ))
        };
        let (sign, rest) = match spec.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        let mut chars = rest.chars();
        let style = match chars.next_back() {
            Some('f') => FloatStyle::Fixed,
            Some('F') => FloatStyle::FixedUpper,
            Some('e') => FloatStyle::Exp,
            Some('E') => FloatStyle::ExpUpper,
            Some('%') => FloatStyle::Percent,
            _ => return Err(invalid()),
        };
        let precision = match chars.as_str() {
            "" => 6,
            p => {
                let digits = p.strip_prefix('.').ok_or_else(invalid)?;
                let n: usize = digits.parse().map_err(|_| invalid())?;
                if n > 50 {
                    return Err(invalid());
                }
                n
            }
        };
        Ok(Self {
            sign,
            precision,
            style,
        })
    }

    pub fn render(&self, value: f64) -> String {
        // Negative zero renders as zero.
        let value = if value == 0.0 { 0.0 } else { value };
        let upper = matches!(self.style, FloatStyle::FixedUpper | FloatStyle::ExpUpper);
        let mut body = if value.is_nan() {
            "nan".to_string()
        } else if value.is_infinite() {
            if value > 0.0 { "inf" } else { "-inf" }.to_string()
        } else {
            match self.style {
                FloatStyle::Fixed | FloatStyle::FixedUpper => {
                    format!("{:.*}", self.precision, value)
                }
                FloatStyle::Exp | FloatStyle::ExpUpper => exp_notation(value, self.precision),
                FloatStyle::Percent => format!("{:.*}%", self.precision, value * 100.0),
            }
        };
        if !value.is_finite() && self.style == FloatStyle::Percent {
            body.push('%');
        }
        if upper {
            body = body.to_uppercase();
        }
        if self.sign && !body.starts_with('-') {
            body.insert(0, '+');
        }
        body
    }
}

/// `1.5e3` style from Rust becomes `1.500e+03`.
fn exp_notation(value: f64, precision: usize) -> String {
    let raw = format!("{:.*e}", precision, value);
    match raw.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        None => raw,
    }
}

struct SafeJson<'a> {
    float_format: Option<&'a FloatFormat>,
    max_bytes: Option<usize>,
    count: usize,
    bytes: usize,
    path: Vec<usize>,
}

impl SafeJson<'_> {
    fn convert(&mut self, value: &Value, depth: usize) -> Result<serde_json::Value> {
        self.count += 1;
        if self.count > MAX_ITEMS {
            return Ok(marker("too_many_items"));
        }
        if depth > MAX_DEPTH {
            return Ok(marker("depth_limit"));
        }
        if self.max_bytes.is_some_and(|limit| self.bytes > limit) {
            return Ok(marker("byte_limit"));
        }
        let id = value.heap_id();
        if let Some(id) = id {
            if self.path.contains(&id) {
                return Ok(marker("cycle"));
            }
            self.path.push(id);
        }
        let out = self.convert_inner(value, depth);
        if id.is_some() {
            self.path.pop();
        }
        out
    }

    fn convert_inner(&mut self, value: &Value, depth: usize) -> Result<serde_json::Value> {
        Ok(match value {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => self.float(*f)?,
            Value::Str(s) => serde_json::Value::String(self.string(s)),
            Value::List(_) | Value::Tuple(_) | Value::Set(_) | Value::FrozenSet(_) => {
                let items = value.sequence_snapshot().unwrap_or_default();
                let mut out = Vec::with_capacity(items.len().min(MAX_ITEMS));
                for item in &items {
                    out.push(self.convert(item, depth + 1)?);
                }
                serde_json::Value::Array(out)
            }
            Value::Dict(_) | Value::FrozenDict(_) => {
                let entries = value.dict_entries().unwrap_or_default();
                let mut map = serde_json::Map::new();
                for (k, v) in entries.iter().take(MAX_ITEMS) {
                    let key = self.key(k, depth + 1)?;
                    let converted = self.convert(v, depth + 1)?;
                    map.insert(key, converted);
                }
                serde_json::Value::Object(map)
            }
            opaque => serde_json::Value::String(format!("<opaque:{}>", opaque.type_name())),
        })
    }

    fn float(&mut self, f: f64) -> Result<serde_json::Value> {
        if let Some(fmt) = self.float_format {
            let s = fmt.render(f);
            self.bytes += s.len();
            return Ok(serde_json::Value::String(s));
        }
        // Negative zero renders as zero.
        let f = if f == 0.0 { 0.0 } else { f };
        serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| {
                SandboxError::Serialization(format!(
                    "non-finite float {} cannot be represented; configure determinism.float_format to render it",
                    crate::interp::value::float_repr(f)
                ))
            })
    }

    fn string(&mut self, s: &str) -> String {
        let out = match s.char_indices().nth(MAX_STR) {
            Some((cut, _)) => format!("{}{TRUNCATED_SUFFIX}", &s[..cut]),
            None => s.to_string(),
        };
        self.bytes += out.len();
        out
    }

    fn key(&mut self, key: &Value, depth: usize) -> Result<String> {
        Ok(match self.convert(key, depth)? {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => "None".to_string(),
            serde_json::Value::Bool(true) => "True".to_string(),
            serde_json::Value::Bool(false) => "False".to_string(),
            serde_json::Value::Number(n) => match key {
                Value::Float(f) => crate::interp::value::float_repr(*f),
                _ => n.to_string(),
            },
            other => other.to_string(),
        })
    }
}

fn marker(reason: &str) -> serde_json::Value {
    serde_json::Value::String(format!("<truncated:{reason}>"))
}

/// Convert a script value into bounded, JSON-safe form.
///
/// `max_bytes` bounds the accumulated size of strings and rendered floats;
/// once exceeded, remaining nodes become `<truncated:byte_limit>`.
pub fn to_safe_json(
    value: &Value,
    float_format: Option<&FloatFormat>,
    max_bytes: Option<usize>,
) -> Result<serde_json::Value> {
    SafeJson {
        float_format,
        max_bytes,
        count: 0,
        bytes: 0,
        path: Vec::new(),
    }
    .convert(value, 0)
}

/// Rough size of a JSON value, used for capability return and bandwidth
/// budgets. Scalars count 8 bytes, strings their length up to 10000
/// characters; nesting below depth 6 and items past 2000 are not counted.
pub fn approx_bytes(value: &serde_json::Value) -> u64 {
    let mut count = 0;
    size_at(value, 0, &mut count)
}

fn size_at(value: &serde_json::Value, depth: usize, count: &mut usize) -> u64 {
    *count += 1;
    if *count > MAX_ITEMS || depth > SIZE_MAX_DEPTH {
        return 0;
    }
    match value {
        serde_json::Value::Null => 0,
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => 8,
        serde_json::Value::String(s) => s.chars().count().min(MAX_STR) as u64,
        serde_json::Value::Array(items) => items
            .iter()
            .take(MAX_ITEMS)
            .map(|item| size_at(item, depth + 1, count))
            .sum(),
        serde_json::Value::Object(map) => {
            let mut total = 0;
            for (k, v) in map.iter().take(MAX_ITEMS) {
                *count += 1;
                total += k.chars().count().min(MAX_STR) as u64;
                total += size_at(v, depth + 1, count);
            }
            total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::value::DictStore;
    use crate::interp::Key;
    use serde_json::json;

    fn safe(v: &Value) -> serde_json::Value {
        to_safe_json(v, None, None).unwrap()
    }

    #[test]
    fn test_float_formats() {
        let f = FloatFormat::parse(".2f").unwrap();
        assert_eq!(f.render(3.14159), "3.14");
        assert_eq!(f.render(-0.0), "0.00");
        assert_eq!(FloatFormat::parse(".3e").unwrap().render(1234.5), "1.234e+03");
        assert_eq!(FloatFormat::parse("E").unwrap().render(0.00012), "1.200000E-04");
        assert_eq!(FloatFormat::parse("+.1f").unwrap().render(2.0), "+2.0");
        assert_eq!(FloatFormat::parse(".0%").unwrap().render(0.25), "25%");
        assert_eq!(f.render(f64::NAN), "nan");
        assert_eq!(FloatFormat::parse("F").unwrap().render(f64::INFINITY), "INF");
    }

    #[test]
    fn test_invalid_float_format_mentions_setting() {
        for spec in ["", "q", ".xf", "6", ".999f"] {
            match FloatFormat::parse(spec) {
                Err(SandboxError::InvalidConfig(msg)) => assert!(msg.contains("float_format")),
                other => panic!("expected InvalidConfig for {spec:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_containers_convert() {
        let mut store = DictStore::new();
        store.insert(Key::Int(1), Value::Int(1), Value::tuple(vec![Value::Bool(true)]));
        store.insert(Key::None, Value::None, Value::str("x"));
        let v = Value::dict(store);
        assert_eq!(safe(&v), json!({"1": [true], "None": "x"}));
    }

    #[test]
    fn test_non_finite_float_needs_format() {
        match to_safe_json(&Value::Float(f64::NAN), None, None) {
            Err(SandboxError::Serialization(_)) => {}
            other => panic!("expected Serialization, got {other:?}"),
        }
        let fmt = FloatFormat::parse(".2f").unwrap();
        assert_eq!(
            to_safe_json(&Value::Float(f64::INFINITY), Some(&fmt), None).unwrap(),
            json!("inf")
        );
    }

    #[test]
    fn test_cycles_and_depth_are_marked() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert_eq!(safe(&list), json!([1, "<truncated:cycle>"]));

        let mut nested = Value::Int(0);
        for _ in 0..12 {
            nested = Value::list(vec![nested]);
        }
        let out = safe(&nested).to_string();
        assert!(out.contains("<truncated:depth_limit>"));
    }

    #[test]
    fn test_shared_references_are_not_cycles() {
        let shared = Value::list(vec![Value::Int(7)]);
        let outer = Value::list(vec![shared.clone(), shared]);
        assert_eq!(safe(&outer), json!([[7], [7]]));
    }

    #[test]
    fn test_item_and_string_limits() {
        let items: Vec<Value> = (0..2500).map(Value::Int).collect();
        let out = safe(&Value::list(items));
        let arr = out.as_array().unwrap();
        assert_eq!(arr[1998], json!(1998));
        assert_eq!(arr[1999], json!("<truncated:too_many_items>"));

        let long = "a".repeat(MAX_STR + 5);
        let out = safe(&Value::str(&long));
        assert!(out.as_str().unwrap().ends_with("<truncated>"));
    }

    #[test]
    fn test_byte_limit_cuts_late_items() {
        let items: Vec<Value> = (0..10).map(|_| Value::str("0123456789")).collect();
        let out = to_safe_json(&Value::list(items), None, Some(25)).unwrap();
        let arr = out.as_array().unwrap();
        assert_eq!(arr[0], json!("0123456789"));
        assert_eq!(arr[9], json!("<truncated:byte_limit>"));
    }

    #[test]
    fn test_opaque_values() {
        let v = Value::Builtin(crate::interp::Builtin::Len);
        assert_eq!(safe(&v), json!("<opaque:builtin_function_or_method>"));
    }

    #[test]
    fn test_approx_bytes_counts() {
        assert_eq!(approx_bytes(&json!(null)), 0);
        assert_eq!(approx_bytes(&json!(5)), 8);
        assert_eq!(approx_bytes(&json!("abcd")), 4);
        assert_eq!(approx_bytes(&json!({"ab": [1, "xyz"]})), 2 + 8 + 3);
    }
}
