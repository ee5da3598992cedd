//! Root objects: allow-listed, read-only namespaces such as `math`.
//!
//! A [`RootSpec`] names a catalog target and the attributes scripts may
//! touch. Attributes outside the allow tree do not exist as far as the
//! script is concerned; everything a root hands back is frozen by the
//! evaluator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capability::CallArgs;
use crate::guard::{Clock, SandboxRng};

/// How a script may use an allowed attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootAttr {
    Callable,
    Value,
}

/// Allow-tree entry: `true` for a callable, `{"value": true}` for a
/// readable constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowEntry {
    Callable(bool),
    Value { value: bool },
}

impl AllowEntry {
    fn access(self) -> Option<RootAttr> {
        match self {
            AllowEntry::Callable(true) => Some(RootAttr::Callable),
            AllowEntry::Value { value: true } => Some(RootAttr::Value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootSpec {
    /// Name bound in the script's globals.
    pub name: String,
    /// Catalog identifier of the backing object.
    pub target: String,
    #[serde(default)]
    pub allow_tree: BTreeMap<String, AllowEntry>,
}

impl RootSpec {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            allow_tree: BTreeMap::new(),
        }
    }

    pub fn allow_call(mut self, attr: &str) -> Self {
        self.allow_tree
            .insert(attr.to_string(), AllowEntry::Callable(true));
        self
    }

    pub fn allow_value(mut self, attr: &str) -> Self {
        self.allow_tree
            .insert(attr.to_string(), AllowEntry::Value { value: true });
        self
    }

    /// Attributes reachable through this root, for the policy's
    /// `attr_allowlist`.
    pub fn attrs(&self) -> BTreeSet<String> {
        self.allow_tree
            .iter()
            .filter(|(_, entry)| entry.access().is_some())
            .map(|(attr, _)| attr.clone())
            .collect()
    }

    pub fn access(&self, attr: &str) -> Option<RootAttr> {
        self.allow_tree.get(attr).and_then(|entry| entry.access())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RootError {
    #[error("{root}.{attr} is not allowed")]
    NotAllowed { root: String, attr: String },

    #[error("{root}.{attr} is not callable")]
    NotCallable { root: String, attr: String },

    #[error("{root} has no attribute '{attr}'")]
    Unknown { root: String, attr: String },

    #[error("{0}")]
    BadArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("unknown root target '{0}'")]
    UnknownTarget(String),
}

/// Worker services available to root calls.
pub struct RootContext<'a> {
    pub clock: &'a Clock,
    pub rng: &'a mut SandboxRng,
}

/// Object backing a root.
pub trait RootObject: Send + Sync {
    /// Constant attribute, if the object has one named `attr`.
    fn read(&self, attr: &str) -> Option<serde_json::Value>;

    /// Call `attr`. Unknown attributes return [`RootError::Unknown`].
    fn call(
        &self,
        attr: &str,
        call: &CallArgs,
        ctx: &mut RootContext<'_>,
    ) -> Result<serde_json::Value, RootError>;
}

/// A root as seen by the script: the backing object filtered through its
/// allow tree.
#[derive(Clone)]
pub struct RootProxy {
    name: String,
    allow: BTreeMap<String, RootAttr>,
    target: Arc<dyn RootObject>,
}

impl std::fmt::Debug for RootProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootProxy")
            .field("name", &self.name)
            .field("allow", &self.allow)
            .finish()
    }
}

impl RootProxy {
    pub fn new(
        name: impl Into<String>,
        allow: BTreeMap<String, RootAttr>,
        target: Arc<dyn RootObject>,
    ) -> Self {
        Self {
            name: name.into(),
            allow,
            target,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access(&self, attr: &str) -> Option<RootAttr> {
        self.allow.get(attr).copied()
    }

    pub fn attrs(&self) -> BTreeSet<String> {
        self.allow.keys().cloned().collect()
    }

    fn not_allowed(&self, attr: &str) -> RootError {
        RootError::NotAllowed {
            root: self.name.clone(),
            attr: attr.to_string(),
        }
    }

    fn unknown(&self, attr: &str) -> RootError {
        RootError::Unknown {
            root: self.name.clone(),
            attr: attr.to_string(),
        }
    }

    pub fn read(&self, attr: &str) -> Result<serde_json::Value, RootError> {
        match self.access(attr) {
            Some(RootAttr::Value) => self.target.read(attr).ok_or_else(|| self.unknown(attr)),
            Some(RootAttr::Callable) => Err(RootError::BadArguments(format!(
                "{}.{attr} must be called",
                self.name
            ))),
            None => Err(self.not_allowed(attr)),
        }
    }

    pub fn call(
        &self,
        attr: &str,
        call: &CallArgs,
        ctx: &mut RootContext<'_>,
    ) -> Result<serde_json::Value, RootError> {
        match self.access(attr) {
            Some(RootAttr::Callable) => match self.target.call(attr, call, ctx) {
                Err(RootError::Unknown { .. }) => Err(self.unknown(attr)),
                other => other,
            },
            Some(RootAttr::Value) => Err(RootError::NotCallable {
                root: self.name.clone(),
                attr: attr.to_string(),
            }),
            None => Err(self.not_allowed(attr)),
        }
    }
}

/// Root objects addressable by target name.
#[derive(Clone, Default)]
pub struct RootCatalog {
    entries: BTreeMap<String, Arc<dyn RootObject>>,
}

impl std::fmt::Debug for RootCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCatalog")
            .field("targets", &self.targets())
            .finish()
    }
}

impl RootCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `math`, `json`, `random` and `time`.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        catalog.register("math", Arc::new(MathRoot));
        catalog.register("json", Arc::new(JsonRoot));
        catalog.register("random", Arc::new(RandomRoot));
        catalog.register("time", Arc::new(TimeRoot));
        catalog
    }

    pub fn register(&mut self, target: impl Into<String>, object: Arc<dyn RootObject>) {
        self.entries.insert(target.into(), object);
    }

    pub fn contains(&self, target: &str) -> bool {
        self.entries.contains_key(target)
    }

    pub fn targets(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn instantiate(&self, spec: &RootSpec) -> Result<RootProxy, RootError> {
        let target = self
            .entries
            .get(&spec.target)
            .cloned()
            .ok_or_else(|| RootError::UnknownTarget(spec.target.clone()))?;
        let allow = spec
            .allow_tree
            .iter()
            .filter_map(|(attr, entry)| entry.access().map(|a| (attr.clone(), a)))
            .collect();
        Ok(RootProxy::new(spec.name.clone(), allow, target))
    }
}

fn unknown(root: &str, attr: &str) -> RootError {
    RootError::Unknown {
        root: root.to_string(),
        attr: attr.to_string(),
    }
}

fn num(call: &CallArgs, index: usize, name: &str) -> Result<f64, RootError> {
    call.f64_at(index, name).map_err(RootError::BadArguments)
}

fn int(call: &CallArgs, index: usize, name: &str) -> Result<i64, RootError> {
    call.i64_at(index, name).map_err(RootError::BadArguments)
}

fn finite(x: f64) -> Result<serde_json::Value, RootError> {
    if x.is_nan() {
        return Err(RootError::Failed("math domain error".into()));
    }
    if x.is_infinite() {
        return Err(RootError::Failed("math range error".into()));
    }
    Ok(json!(x))
}

fn to_int(x: f64) -> Result<serde_json::Value, RootError> {
    if x.is_finite() && x >= i64::MIN as f64 && x < i64::MAX as f64 {
        Ok(json!(x as i64))
    } else {
        Err(RootError::Failed("integer overflow".into()))
    }
}

fn domain(ok: bool) -> Result<(), RootError> {
    if ok {
        Ok(())
    } else {
        Err(RootError::Failed("math domain error".into()))
    }
}

fn overflow() -> RootError {
    RootError::Failed("integer overflow".into())
}

fn factorial(n: i64) -> Result<i64, RootError> {
    if n < 0 {
        return Err(RootError::Failed(
            "factorial() not defined for negative values".into(),
        ));
    }
    (1..=n).try_fold(1i64, |acc, k| acc.checked_mul(k)).ok_or_else(overflow)
}

/// `n! / (n-k)!`, optionally divided by `k!`.
fn falling(n: i64, k: i64, choose: bool) -> Result<i64, RootError> {
    if n < 0 || k < 0 {
        return Err(RootError::Failed("n and k must be non-negative integers".into()));
    }
    if k > n {
        return Ok(0);
    }
    let k = if choose { k.min(n - k) } else { k };
    let mut acc: i128 = 1;
    for i in 0..k {
        acc *= i128::from(n - i);
        if choose {
            acc /= i128::from(i + 1);
        }
        if acc > i128::from(i64::MAX) {
            return Err(overflow());
        }
    }
    i64::try_from(acc).map_err(|_| overflow())
}

struct MathRoot;

impl RootObject for MathRoot {
    fn read(&self, attr: &str) -> Option<serde_json::Value> {
        match attr {
            "pi" => Some(json!(std::f64::consts::PI)),
            "e" => Some(json!(std::f64::consts::E)),
            "tau" => Some(json!(std::f64::consts::TAU)),
            _ => None,
        }
    }

    fn call(
        &self,
        attr: &str,
        call: &CallArgs,
        _ctx: &mut RootContext<'_>,
    ) -> Result<serde_json::Value, RootError> {
        let x = || num(call, 0, "x");
        match attr {
            "sin" => finite(x()?.sin()),
            "cos" => finite(x()?.cos()),
            "tan" => finite(x()?.tan()),
            "asin" | "acos" => {
                let v = x()?;
                domain((-1.0..=1.0).contains(&v))?;
                finite(if attr == "asin" { v.asin() } else { v.acos() })
            }
            "atan" => finite(x()?.atan()),
            "atan2" => finite(num(call, 0, "y")?.atan2(num(call, 1, "x")?)),
            "sinh" => finite(x()?.sinh()),
            "cosh" => finite(x()?.cosh()),
            "tanh" => finite(x()?.tanh()),
            "asinh" => finite(x()?.asinh()),
            "acosh" => {
                let v = x()?;
                domain(v >= 1.0)?;
                finite(v.acosh())
            }
            "atanh" => {
                let v = x()?;
                domain(v > -1.0 && v < 1.0)?;
                finite(v.atanh())
            }
            "exp" => finite(x()?.exp()),
            "log" => {
                let v = x()?;
                domain(v > 0.0)?;
                match call.get(1, "base") {
                    Some(_) => {
                        let base = num(call, 1, "base")?;
                        domain(base > 0.0 && base != 1.0)?;
                        finite(v.ln() / base.ln())
                    }
                    None => finite(v.ln()),
                }
            }
            "log10" | "log2" => {
                let v = x()?;
                domain(v > 0.0)?;
                finite(if attr == "log10" { v.log10() } else { v.log2() })
            }
            "sqrt" => {
                let v = x()?;
                domain(v >= 0.0)?;
                finite(v.sqrt())
            }
            "pow" => finite(num(call, 0, "x")?.powf(num(call, 1, "y")?)),
            "floor" => to_int(x()?.floor()),
            "ceil" => to_int(x()?.ceil()),
            "trunc" => to_int(x()?.trunc()),
            "fabs" => finite(x()?.abs()),
            "fmod" => {
                let y = num(call, 1, "y")?;
                domain(y != 0.0)?;
                finite(x()? % y)
            }
            "hypot" => finite(num(call, 0, "x")?.hypot(num(call, 1, "y")?)),
            "degrees" => finite(x()?.to_degrees()),
            "radians" => finite(x()?.to_radians()),
            "copysign" => finite(num(call, 0, "x")?.copysign(num(call, 1, "y")?)),
            "isfinite" => Ok(json!(x()?.is_finite())),
            "isinf" => Ok(json!(x()?.is_infinite())),
            "isnan" => Ok(json!(x()?.is_nan())),
            "factorial" => factorial(int(call, 0, "n")?).map(|v| json!(v)),
            "comb" => falling(int(call, 0, "n")?, int(call, 1, "k")?, true).map(|v| json!(v)),
            "perm" => falling(int(call, 0, "n")?, int(call, 1, "k")?, false).map(|v| json!(v)),
            "prod" => {
                let items = match call.get(0, "iterable") {
                    Some(serde_json::Value::Array(items)) => items,
                    _ => return Err(RootError::BadArguments("prod() expects a sequence".into())),
                };
                if items.iter().all(|v| v.is_i64()) {
                    items
                        .iter()
                        .filter_map(|v| v.as_i64())
                        .try_fold(1i64, |acc, v| acc.checked_mul(v))
                        .map(|v| json!(v))
                        .ok_or_else(overflow)
                } else {
                    let mut acc = 1.0;
                    for item in items {
                        acc *= item.as_f64().ok_or_else(|| {
                            RootError::BadArguments("prod() expects numbers".into())
                        })?;
                    }
                    finite(acc)
                }
            }
            _ => Err(unknown("math", attr)),
        }
    }
}

/// `", "` / `": "` separators, matching the usual script-side `dumps`.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + std::io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> std::io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + std::io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> std::io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + std::io::Write>(
        &mut self,
        writer: &mut W,
    ) -> std::io::Result<()> {
        writer.write_all(b": ")
    }
}

fn dumps(value: &serde_json::Value, indent: Option<usize>) -> Result<String, RootError> {
    let mut out = Vec::new();
    let written = match indent {
        Some(n) => {
            let pad = " ".repeat(n);
            let formatter = serde_json::ser::PrettyFormatter::with_indent(pad.as_bytes());
            serde::Serialize::serialize(
                value,
                &mut serde_json::Serializer::with_formatter(&mut out, formatter),
            )
        }
        None => serde::Serialize::serialize(
            value,
            &mut serde_json::Serializer::with_formatter(&mut out, SpacedFormatter),
        ),
    };
    written.map_err(|e| RootError::Failed(e.to_string()))?;
    String::from_utf8(out).map_err(|e| RootError::Failed(e.to_string()))
}

struct JsonRoot;

impl RootObject for JsonRoot {
    fn read(&self, _attr: &str) -> Option<serde_json::Value> {
        None
    }

    fn call(
        &self,
        attr: &str,
        call: &CallArgs,
        _ctx: &mut RootContext<'_>,
    ) -> Result<serde_json::Value, RootError> {
        match attr {
            "dumps" => {
                let value = call
                    .get(0, "obj")
                    .ok_or_else(|| RootError::BadArguments("dumps() missing 'obj'".into()))?;
                let indent = match call.kwargs.get("indent") {
                    None | Some(serde_json::Value::Null) => None,
                    Some(n) => Some(n.as_u64().map(|n| n as usize).ok_or_else(|| {
                        RootError::BadArguments("indent must be a non-negative integer".into())
                    })?),
                };
                dumps(value, indent).map(|s| json!(s))
            }
            "loads" => {
                let text = call.str_at(0, "s").map_err(RootError::BadArguments)?;
                serde_json::from_str(text).map_err(|e| RootError::Failed(e.to_string()))
            }
            _ => Err(unknown("json", attr)),
        }
    }
}

struct RandomRoot;

impl RootObject for RandomRoot {
    fn read(&self, _attr: &str) -> Option<serde_json::Value> {
        None
    }

    fn call(
        &self,
        attr: &str,
        call: &CallArgs,
        ctx: &mut RootContext<'_>,
    ) -> Result<serde_json::Value, RootError> {
        match attr {
            "random" => Ok(json!(ctx.rng.random())),
            "uniform" => {
                let (a, b) = (num(call, 0, "a")?, num(call, 1, "b")?);
                Ok(json!(ctx.rng.uniform(a, b)))
            }
            "randint" => {
                let (a, b) = (int(call, 0, "a")?, int(call, 1, "b")?);
                ctx.rng
                    .randint(a, b)
                    .map(|v| json!(v))
                    .ok_or_else(|| RootError::Failed(format!("empty range for randint({a}, {b})")))
            }
            "randrange" => {
                let (start, stop) = match call.get(1, "stop") {
                    Some(_) => (int(call, 0, "start")?, int(call, 1, "stop")?),
                    None => (0, int(call, 0, "stop")?),
                };
                let step = match call.get(2, "step") {
                    Some(_) => int(call, 2, "step")?,
                    None => 1,
                };
                if step == 0 {
                    return Err(RootError::Failed("zero step for randrange()".into()));
                }
                let span = i128::from(stop) - i128::from(start);
                let count = (span + i128::from(step) - i128::from(step.signum())) / i128::from(step);
                let count = usize::try_from(count.max(0)).map_err(|_| overflow())?;
                let pick = ctx
                    .rng
                    .index(count)
                    .ok_or_else(|| RootError::Failed("empty range for randrange()".into()))?;
                Ok(json!(start + step * pick as i64))
            }
            "choice" => {
                let items = sequence(call, "seq")?;
                let pick = ctx
                    .rng
                    .index(items.len())
                    .ok_or_else(|| RootError::Failed("cannot choose from an empty sequence".into()))?;
                Ok(items[pick].clone())
            }
            "sample" => {
                let mut pool = sequence(call, "population")?.clone();
                let k = usize::try_from(int(call, 1, "k")?)
                    .map_err(|_| RootError::Failed("sample larger than population or is negative".into()))?;
                if k > pool.len() {
                    return Err(RootError::Failed(
                        "sample larger than population or is negative".into(),
                    ));
                }
                let mut picked = Vec::with_capacity(k);
                for _ in 0..k {
                    let i = ctx.rng.index(pool.len()).ok_or_else(overflow)?;
                    picked.push(pool.swap_remove(i));
                }
                Ok(serde_json::Value::Array(picked))
            }
            _ => Err(unknown("random", attr)),
        }
    }
}

fn sequence<'c>(call: &'c CallArgs, name: &str) -> Result<&'c Vec<serde_json::Value>, RootError> {
    match call.get(0, name) {
        Some(serde_json::Value::Array(items)) => Ok(items),
        _ => Err(RootError::BadArguments(format!("'{name}' must be a sequence"))),
    }
}

struct TimeRoot;

impl RootObject for TimeRoot {
    fn read(&self, _attr: &str) -> Option<serde_json::Value> {
        None
    }

    fn call(
        &self,
        attr: &str,
        _call: &CallArgs,
        ctx: &mut RootContext<'_>,
    ) -> Result<serde_json::Value, RootError> {
        match attr {
            "time" => Ok(json!(ctx.clock.now())),
            "monotonic" | "perf_counter" => Ok(json!(ctx.clock.elapsed_secs())),
            _ => Err(unknown("time", attr)),
        }
    }
}
