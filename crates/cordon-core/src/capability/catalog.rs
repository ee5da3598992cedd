//! Capabilities addressable by stable path, e.g. `text:upper`.
//!
//! Fresh-process workers can only see capabilities through a catalog, so a
//! host that ships its own worker binary registers its capabilities here and
//! passes the catalog to [`crate::worker::worker_main`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::{from_fn, CallArgs, CapState, Capability};

const MAX_SLEEP_MS: i64 = 60_000;
const MAX_REPEAT_BYTES: usize = 10_000_000;

#[derive(Clone, Default)]
pub struct CapabilityCatalog {
    entries: BTreeMap<String, Arc<dyn Capability>>,
}

impl std::fmt::Debug for CapabilityCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityCatalog")
            .field("paths", &self.paths())
            .finish()
    }
}

impl CapabilityCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The catalog compiled into the stock worker binary.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        catalog.register("text:upper", Arc::new(TextMap(str::to_uppercase)));
        catalog.register("text:lower", Arc::new(TextMap(str::to_lowercase)));
        catalog.register(
            "text:count_words",
            from_fn(|call| {
                call.expect_len(1)?;
                let text = call.str_at(0, "text")?;
                Ok(json!(text.split_whitespace().count()))
            }),
        );
        catalog.register("math:add", from_fn(add));
        catalog.register("http:get", Arc::new(HttpGet));
        catalog.register(
            "debug:echo",
            from_fn(|call| Ok(call.args.first().cloned().unwrap_or(serde_json::Value::Null))),
        );
        catalog.register("debug:sleep_ms", from_fn(sleep_ms));
        catalog.register("debug:repeat", from_fn(repeat));
        catalog.register(
            "debug:fail",
            from_fn(|call| {
                let message = call.str_at(0, "message").unwrap_or("requested failure");
                Err(message.to_string())
            }),
        );
        catalog
    }

    pub fn register(&mut self, path: impl Into<String>, capability: Arc<dyn Capability>) {
        self.entries.insert(path.into(), capability);
    }

    pub fn resolve(&self, path: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Single-string transformation.
struct TextMap(fn(&str) -> String);

impl Capability for TextMap {
    fn validate(&self, call: &CallArgs) -> Result<(), String> {
        call.expect_len(1)?;
        call.str_at(0, "text").map(|_| ())
    }

    fn call(&self, _state: &mut CapState, call: &CallArgs) -> Result<serde_json::Value, String> {
        let text = call.str_at(0, "text")?;
        Ok(json!((self.0)(text)))
    }
}

fn add(call: &CallArgs) -> Result<serde_json::Value, String> {
    call.expect_len(2)?;
    if let (Ok(a), Ok(b)) = (call.i64_at(0, "a"), call.i64_at(1, "b")) {
        return a
            .checked_add(b)
            .map(|sum| json!(sum))
            .ok_or_else(|| "integer overflow".to_string());
    }
    let sum = call.f64_at(0, "a")? + call.f64_at(1, "b")?;
    Ok(json!(sum))
}

fn sleep_ms(call: &CallArgs) -> Result<serde_json::Value, String> {
    let ms = call.i64_at(0, "ms")?;
    if !(0..=MAX_SLEEP_MS).contains(&ms) {
        return Err(format!("ms must be between 0 and {MAX_SLEEP_MS}"));
    }
    std::thread::sleep(Duration::from_millis(ms as u64));
    Ok(serde_json::Value::Null)
}

fn repeat(call: &CallArgs) -> Result<serde_json::Value, String> {
    let text = call.str_at(0, "text")?;
    let n = call.i64_at(1, "n")?;
    let n = usize::try_from(n).map_err(|_| "n must be non-negative".to_string())?;
    if text.len().saturating_mul(n) > MAX_REPEAT_BYTES {
        return Err("repeated text too large".to_string());
    }
    Ok(json!(text.repeat(n)))
}

/// `http:get(url, timeout_s=5.0)` returning `{"status", "body"}`.
struct HttpGet;

impl Capability for HttpGet {
    fn init(&self) -> Result<CapState, String> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("cordon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(CapState::new(client))
    }

    fn validate(&self, call: &CallArgs) -> Result<(), String> {
        let url = call.str_at(0, "url")?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("unsupported url scheme: {url}"));
        }
        if call.get(1, "timeout_s").is_some() {
            let timeout = call.f64_at(1, "timeout_s")?;
            if !(timeout.is_finite() && timeout > 0.0) {
                return Err("timeout_s must be positive".to_string());
            }
        }
        Ok(())
    }

    fn call(&self, state: &mut CapState, call: &CallArgs) -> Result<serde_json::Value, String> {
        let client = state
            .get_mut::<reqwest::blocking::Client>()
            .ok_or("http client not initialised")?;
        let url = call.str_at(0, "url")?;
        let timeout = call.f64_at(1, "timeout_s").unwrap_or(5.0);
        let response = client
            .get(url)
            .timeout(Duration::from_secs_f64(timeout))
            .send()
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().map_err(|e| e.to_string())?;
        Ok(json!({ "status": status, "body": body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(catalog: &CapabilityCatalog, path: &str, args: CallArgs) -> Result<serde_json::Value, String> {
        let cap = catalog.resolve(path).unwrap();
        let mut state = cap.init()?;
        cap.validate(&args)?;
        let out = cap.call(&mut state, &args);
        cap.close(state);
        out
    }

    #[test]
    fn test_builtin_paths() {
        let catalog = CapabilityCatalog::builtin();
        for path in ["text:upper", "math:add", "http:get", "debug:fail"] {
            assert!(catalog.contains(path), "{path}");
        }
        assert!(catalog.resolve("os:system").is_none());
    }

    #[test]
    fn test_text_capabilities() {
        let catalog = CapabilityCatalog::builtin();
        let args = CallArgs::positional(vec![json!("Hello World")]);
        assert_eq!(call(&catalog, "text:upper", args.clone()).unwrap(), json!("HELLO WORLD"));
        assert_eq!(call(&catalog, "text:lower", args.clone()).unwrap(), json!("hello world"));
        assert_eq!(call(&catalog, "text:count_words", args).unwrap(), json!(2));
        let bad = CallArgs::positional(vec![json!(3)]);
        assert!(call(&catalog, "text:upper", bad).is_err());
    }

    #[test]
    fn test_add_keeps_integers() {
        let catalog = CapabilityCatalog::builtin();
        let ints = CallArgs::positional(vec![json!(2), json!(40)]);
        assert_eq!(call(&catalog, "math:add", ints).unwrap(), json!(42));
        let mixed = CallArgs::positional(vec![json!(1), json!(0.5)]);
        assert_eq!(call(&catalog, "math:add", mixed).unwrap(), json!(1.5));
    }

    #[test]
    fn test_http_rejects_non_http_urls() {
        let cap = CapabilityCatalog::builtin().resolve("http:get").unwrap();
        let args = CallArgs::positional(vec![json!("file:///etc/passwd")]);
        assert!(cap.validate(&args).unwrap_err().contains("scheme"));
    }

    #[test]
    fn test_debug_helpers() {
        let catalog = CapabilityCatalog::builtin();
        let args = CallArgs::positional(vec![json!("ab"), json!(3)]);
        assert_eq!(call(&catalog, "debug:repeat", args).unwrap(), json!("ababab"));
        let args = CallArgs::positional(vec![json!("boom")]);
        assert_eq!(call(&catalog, "debug:fail", args).unwrap_err(), "boom");
    }
}
