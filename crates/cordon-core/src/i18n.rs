//! Localised error messages.
//!
//! Errors raised by the engine carry a stable message key and its
//! parameters on [`ErrorInfo`]. A bundle maps keys to templates with
//! `{name}` placeholders. Lookups fall back to the `en` bundle, then to
//! the key itself.
//!
//! ```
//! use cordon_core::i18n::{register_bundle, translate, Params};
//!
//! register_bundle("fr", [("error.import_not_allowed", "import interdit")]);
//! assert_eq!(translate("error.import_not_allowed", "fr", &Params::new()), "import interdit");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{OnceLock, PoisonError, RwLock};

use crate::error::{ErrorInfo, SandboxError};

pub const DEFAULT_LOCALE: &str = "en";

/// Placeholder values for a message template.
pub type Params = BTreeMap<String, String>;

type Bundles = HashMap<String, HashMap<String, String>>;

const EN: &[(&str, &str)] = &[
    ("error.import_not_allowed", "import is not allowed"),
    ("error.global_not_allowed", "global is not allowed"),
    ("error.nonlocal_not_allowed", "nonlocal is not allowed"),
    ("error.del_not_allowed", "del is not allowed"),
    ("error.raise_not_allowed", "raise is not allowed"),
    ("error.async_not_allowed", "async is not allowed"),
    ("error.await_not_allowed", "await is not allowed"),
    ("error.yield_not_allowed", "yield is not allowed"),
    ("error.def_not_allowed", "def is not allowed"),
    ("error.class_not_allowed", "class is not allowed"),
    ("error.lambda_not_allowed", "lambda is not allowed"),
    ("error.try_not_allowed", "try/except is not allowed"),
    ("error.with_not_allowed", "with is not allowed"),
    ("error.subscript_not_allowed", "subscript is not allowed"),
    ("error.dunder_name_not_allowed", "dunder names are not allowed"),
    ("error.dunder_attr_not_allowed", "dunder attribute is not allowed"),
    ("error.attr_root_only", "only root.attr attribute access is allowed"),
    ("error.attr_not_allowed", "attribute '{root}.{attr}' is not allowed"),
    ("error.call_form", "only f(...) or root.attr(...) calls are allowed"),
    ("error.call_not_allowed", "call '{name}' is not allowed"),
    ("error.name_not_allowed", "name '{name}' is not allowed"),
    ("error.reserved_name", "reserved name '{name}' cannot be read"),
    ("error.loops_not_allowed", "loops are not allowed"),
    ("error.loop_iter_not_allowed", "loop iterable is not allowed"),
    ("error.loop_nesting_too_deep", "loop nesting too deep"),
    ("error.comp_not_allowed", "comprehension is not allowed"),
    ("error.comp_iter_not_allowed", "comprehension iterable is not allowed"),
    ("error.comp_nesting_too_deep", "comprehension nesting too deep"),
    ("error.literal_too_large", "literal too large"),
    ("error.suspicious_const_alloc", "suspicious constant allocation"),
    ("error.ast_node_limit", "AST node limit exceeded"),
    ("error.step_limit", "step budget exceeded (max_steps={max_steps})"),
    ("error.recursion_limit", "maximum recursion depth exceeded (max_recursion={limit})"),
    ("error.timeout", "execution timed out after {ms}ms"),
    ("error.cap_budget", "capability '{capability}' exceeded its {dimension} budget ({limit})"),
    ("error.token_budget", "token budget exhausted for '{capability}': needed {need}, available {remaining}"),
    ("error.resource_limit", "{resource} limit exceeded: {msg}"),
    ("error.worker_fault", "worker fault: {msg}"),
];

const ZH_CN: &[(&str, &str)] = &[
    ("error.import_not_allowed", "禁止 import"),
    ("error.global_not_allowed", "禁止 global"),
    ("error.nonlocal_not_allowed", "禁止 nonlocal"),
    ("error.del_not_allowed", "禁止 del"),
    ("error.raise_not_allowed", "禁止 raise"),
    ("error.async_not_allowed", "禁止 async"),
    ("error.await_not_allowed", "禁止 await"),
    ("error.yield_not_allowed", "禁止 yield"),
    ("error.def_not_allowed", "禁止 def"),
    ("error.class_not_allowed", "禁止 class"),
    ("error.lambda_not_allowed", "禁止 lambda"),
    ("error.try_not_allowed", "禁止 try/except"),
    ("error.with_not_allowed", "禁止 with"),
    ("error.subscript_not_allowed", "禁止下标访问"),
    ("error.dunder_name_not_allowed", "禁止双下划线名称"),
    ("error.dunder_attr_not_allowed", "禁止双下划线属性"),
    ("error.attr_root_only", "仅允许 root.attr 形式的属性访问"),
    ("error.attr_not_allowed", "属性 '{root}.{attr}' 不被允许"),
    ("error.call_form", "仅允许 f(...) 或 root.attr(...) 形式的调用"),
    ("error.call_not_allowed", "调用 '{name}' 不被允许"),
    ("error.name_not_allowed", "名称 '{name}' 不被允许"),
    ("error.reserved_name", "保留名称 '{name}' 不可读取"),
    ("error.loops_not_allowed", "禁止循环"),
    ("error.loop_iter_not_allowed", "循环迭代对象不被允许"),
    ("error.loop_nesting_too_deep", "循环嵌套过深"),
    ("error.comp_not_allowed", "禁止推导式"),
    ("error.comp_iter_not_allowed", "推导式迭代对象不被允许"),
    ("error.comp_nesting_too_deep", "推导式嵌套过深"),
    ("error.literal_too_large", "字面量过大"),
    ("error.suspicious_const_alloc", "可疑的大常量分配"),
    ("error.ast_node_limit", "AST 节点数量超限"),
    ("error.step_limit", "执行步数超限：{max_steps}"),
    ("error.recursion_limit", "递归深度超限：{limit}"),
    ("error.timeout", "超时（超过 {ms}ms）"),
    ("error.cap_budget", "能力 '{capability}' 的 {dimension} 预算超限（{limit}）"),
    ("error.token_budget", "'{capability}' 的 token 预算超限：需要 {need}，剩余 {remaining}"),
    ("error.resource_limit", "{resource} 资源超限：{msg}"),
    ("error.worker_fault", "worker 故障：{msg}"),
];

/// Policy messages without parameters.
const POLICY_KEYS: &[(&str, &str)] = &[
    ("import is not allowed", "error.import_not_allowed"),
    ("global is not allowed", "error.global_not_allowed"),
    ("nonlocal is not allowed", "error.nonlocal_not_allowed"),
    ("del is not allowed", "error.del_not_allowed"),
    ("raise is not allowed", "error.raise_not_allowed"),
    ("async is not allowed", "error.async_not_allowed"),
    ("await is not allowed", "error.await_not_allowed"),
    ("yield is not allowed", "error.yield_not_allowed"),
    ("def is not allowed", "error.def_not_allowed"),
    ("class is not allowed", "error.class_not_allowed"),
    ("lambda is not allowed", "error.lambda_not_allowed"),
    ("try/except is not allowed", "error.try_not_allowed"),
    ("with is not allowed", "error.with_not_allowed"),
    ("subscript is not allowed", "error.subscript_not_allowed"),
    ("dunder names are not allowed", "error.dunder_name_not_allowed"),
    ("dunder attribute is not allowed", "error.dunder_attr_not_allowed"),
    ("only root.attr attribute access is allowed", "error.attr_root_only"),
    ("only f(...) or root.attr(...) calls are allowed", "error.call_form"),
    ("loops are not allowed", "error.loops_not_allowed"),
    ("loop iterable is not allowed", "error.loop_iter_not_allowed"),
    ("loop nesting too deep", "error.loop_nesting_too_deep"),
    ("comprehension is not allowed", "error.comp_not_allowed"),
    ("comprehension iterable is not allowed", "error.comp_iter_not_allowed"),
    ("comprehension nesting too deep", "error.comp_nesting_too_deep"),
    ("literal too large", "error.literal_too_large"),
    ("suspicious constant allocation", "error.suspicious_const_alloc"),
    ("AST node limit exceeded", "error.ast_node_limit"),
];

fn bundles() -> &'static RwLock<Bundles> {
    static BUNDLES: OnceLock<RwLock<Bundles>> = OnceLock::new();
    BUNDLES.get_or_init(|| {
        let mut all = Bundles::new();
        for (locale, entries) in [("en", EN), ("zh-CN", ZH_CN)] {
            let bundle = entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            all.insert(locale.to_string(), bundle);
        }
        RwLock::new(all)
    })
}

/// Add or override messages for `locale`. An empty locale is ignored.
pub fn register_bundle<I, K, V>(locale: &str, messages: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    if locale.is_empty() {
        return;
    }
    let mut all = bundles().write().unwrap_or_else(PoisonError::into_inner);
    all.entry(locale.to_string())
        .or_default()
        .extend(messages.into_iter().map(|(k, v)| (k.into(), v.into())));
}

/// Locales with a registered bundle, sorted.
pub fn locales() -> Vec<String> {
    let all = bundles().read().unwrap_or_else(PoisonError::into_inner);
    let mut names: Vec<String> = all.keys().cloned().collect();
    names.sort();
    names
}

fn template(key: &str, locale: &str) -> Option<String> {
    let all = bundles().read().unwrap_or_else(PoisonError::into_inner);
    all.get(locale)
        .and_then(|b| b.get(key))
        .or_else(|| all.get(DEFAULT_LOCALE).and_then(|b| b.get(key)))
        .cloned()
}

/// Render `key` in `locale`. Unknown keys render as themselves.
pub fn translate(key: &str, locale: &str, params: &Params) -> String {
    let text = template(key, locale).unwrap_or_else(|| key.to_string());
    fill(&text, params)
}

/// Translate an engine message by recognising its text. Anything
/// unrecognised is returned as is.
pub fn translate_message(message: &str, locale: &str) -> String {
    match policy_key(message) {
        Some((key, params)) => translate(key, locale, &params),
        None => message.to_string(),
    }
}

/// Copy of `info` with its message rendered in `locale`.
pub fn translate_error(info: &ErrorInfo, locale: &str) -> ErrorInfo {
    let mut out = info.clone();
    if locale.is_empty() || locale == DEFAULT_LOCALE {
        return out;
    }
    let message = match &info.message_key {
        Some(key) => template(key, locale).map(|t| fill(&t, &info.message_params)),
        None => Some(translate_message(&info.message, locale)),
    };
    if let Some(message) = message {
        out.message = message;
    }
    out
}

/// Stable key and parameters for an engine error, when it has one.
pub(crate) fn message_key(err: &SandboxError) -> Option<(&'static str, Params)> {
    let key = match err {
        SandboxError::PolicyViolation { message, .. } => return policy_key(message),
        SandboxError::StepBudgetExceeded { limit, .. } => {
            ("error.step_limit", params([("max_steps", limit.to_string())]))
        }
        SandboxError::RecursionExceeded { limit, .. } => {
            ("error.recursion_limit", params([("limit", limit.to_string())]))
        }
        SandboxError::Timeout { limit_ms } => ("error.timeout", params([("ms", limit_ms.to_string())])),
        SandboxError::BudgetExceeded {
            capability,
            dimension,
            limit,
        } => (
            "error.cap_budget",
            params([
                ("capability", capability.clone()),
                ("dimension", dimension.to_string()),
                ("limit", limit.clone()),
            ]),
        ),
        SandboxError::TokenExhausted {
            capability,
            needed,
            available,
        } => (
            "error.token_budget",
            params([
                ("capability", capability.clone()),
                ("need", needed.to_string()),
                ("remaining", available.to_string()),
            ]),
        ),
        SandboxError::ResourceLimitExceeded {
            resource, message, ..
        } => (
            "error.resource_limit",
            params([("resource", resource.to_string()), ("msg", message.clone())]),
        ),
        SandboxError::WorkerFault(msg) => ("error.worker_fault", params([("msg", msg.clone())])),
        _ => return None,
    };
    Some(key)
}

fn policy_key(message: &str) -> Option<(&'static str, Params)> {
    if let Some((_, key)) = POLICY_KEYS.iter().find(|(text, _)| *text == message) {
        return Some((*key, Params::new()));
    }
    if let Some(target) = quoted(message, "attribute '", "' is not allowed") {
        let (root, attr) = target.split_once('.')?;
        return Some((
            "error.attr_not_allowed",
            params([("root", root.to_string()), ("attr", attr.to_string())]),
        ));
    }
    let named = [
        ("call '", "' is not allowed", "error.call_not_allowed"),
        ("name '", "' is not allowed", "error.name_not_allowed"),
        ("reserved name '", "' cannot be read", "error.reserved_name"),
    ];
    named.iter().find_map(|(prefix, suffix, key)| {
        quoted(message, prefix, suffix).map(|name| (*key, params([("name", name.to_string())])))
    })
}

fn quoted<'a>(message: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    message.strip_prefix(prefix)?.strip_suffix(suffix)
}

fn params<const N: usize>(pairs: [(&str, String); N]) -> Params {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Substitute `{name}` placeholders in one pass; unknown ones stay literal.
fn fill(template: &str, params: &Params) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let hit = after
            .find('}')
            .and_then(|close| params.get(&after[..close]).map(|v| (close, v)));
        match hit {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BudgetDimension;
    use cordon_script::Span;

    #[test]
    fn test_english_templates_reproduce_engine_messages() {
        let errors = [
            SandboxError::policy("Import", "import is not allowed", Span::new(1, 1)),
            SandboxError::policy("Attribute", "attribute 'math.cos' is not allowed", Span::new(1, 1)),
            SandboxError::StepBudgetExceeded {
                limit: 10,
                location: None,
            },
            SandboxError::Timeout { limit_ms: 250 },
            SandboxError::BudgetExceeded {
                capability: "fetch".into(),
                dimension: BudgetDimension::Rate,
                limit: "max_qps=1".into(),
            },
            SandboxError::TokenExhausted {
                capability: "upper".into(),
                needed: 5,
                available: 3,
            },
            SandboxError::WorkerFault("exit status 3".into()),
        ];
        for err in errors {
            let info = ErrorInfo::from_error(&err, None);
            let key = info.message_key.as_deref().unwrap();
            assert_eq!(translate(key, "en", &info.message_params), info.message, "{key}");
        }
    }

    #[test]
    fn test_translate_error_to_chinese() {
        let err = SandboxError::policy("Attribute", "attribute 'math.cos' is not allowed", Span::new(2, 1));
        let info = ErrorInfo::from_error(&err, None);
        assert_eq!(info.message_key.as_deref(), Some("error.attr_not_allowed"));

        let zh = translate_error(&info, "zh-CN");
        assert_eq!(zh.message, "属性 'math.cos' 不被允许");
        assert_eq!(zh.kind, info.kind);
        assert_eq!(zh.lineno, Some(2));

        let timeout = ErrorInfo::from_error(&SandboxError::Timeout { limit_ms: 300 }, None);
        assert_eq!(translate_error(&timeout, "zh-CN").message, "超时（超过 300ms）");
    }

    #[test]
    fn test_default_locale_and_unkeyed_errors_unchanged() {
        let info = ErrorInfo::from_error(&SandboxError::policy("Import", "import is not allowed", Span::new(1, 1)), None);
        assert_eq!(translate_error(&info, "en"), info);
        assert_eq!(translate_error(&info, ""), info);

        let runtime = ErrorInfo::from_error(
            &SandboxError::Runtime {
                error_type: "ZeroDivisionError".into(),
                message: "division by zero".into(),
                location: None,
            },
            None,
        );
        assert!(runtime.message_key.is_none());
        assert_eq!(translate_error(&runtime, "zh-CN").message, "division by zero");
    }

    #[test]
    fn test_registered_bundle_falls_back_to_english() {
        register_bundle("de-TEST", [("error.import_not_allowed", "import ist verboten")]);
        assert!(locales().contains(&"de-TEST".to_string()));
        let none = Params::new();
        assert_eq!(translate("error.import_not_allowed", "de-TEST", &none), "import ist verboten");
        // missing from the bundle: english text
        assert_eq!(translate("error.del_not_allowed", "de-TEST", &none), "del is not allowed");
        // unknown everywhere: the key itself
        assert_eq!(translate("error.nope", "de-TEST", &none), "error.nope");

        // later registrations extend the same bundle
        register_bundle("de-TEST", [("error.del_not_allowed", "del ist verboten")]);
        assert_eq!(translate("error.del_not_allowed", "de-TEST", &none), "del ist verboten");
        assert_eq!(translate("error.import_not_allowed", "de-TEST", &none), "import ist verboten");

        register_bundle("", [("error.del_not_allowed", "ignored")]);
        assert!(!locales().contains(&String::new()));
    }

    #[test]
    fn test_translate_message_recognises_named_violations() {
        assert_eq!(translate_message("call 'open' is not allowed", "zh-CN"), "调用 'open' 不被允许");
        assert_eq!(translate_message("loop nesting too deep", "zh-CN"), "循环嵌套过深");
        assert_eq!(translate_message("something else", "zh-CN"), "something else");
    }

    #[test]
    fn test_fill_leaves_unknown_placeholders() {
        let p = params([("a", "{b}".to_string())]);
        assert_eq!(fill("{a} {b} {", &p), "{b} {b} {");
    }
}
