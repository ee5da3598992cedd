//! Host configuration loaded from TOML.
//!
//! ```toml
//! preset = "compute_plus_math"
//! mode = "spawn"
//! session_tokens = 1000
//! locale = "zh-CN"
//!
//! [policy]
//! max_steps = 50000
//!
//! [[capabilities]]
//! name = "upper"
//! path = "text:upper"
//! tokens_per_call = 1
//!
//! [[audit_sinks]]
//! kind = "file"
//! path = "/var/log/cordon/audit.jsonl"
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::audit::AuditSinkSpec;
use crate::capability::CapabilitySpec;
use crate::env::{SandboxedEnv, SandboxedEnvBuilder};
use crate::error::Result;
use crate::policy::Policy;
use crate::presets;
use crate::protocol::ProcessMode;
use crate::roots::RootSpec;
use crate::runner::RunnerSpec;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Starting point; its roots are always kept.
    pub preset: Option<String>,
    /// Replaces the preset's policy when both are given.
    pub policy: Option<Policy>,
    pub mode: ProcessMode,
    pub runner: RunnerSpec,
    pub capabilities: Vec<CapabilitySpec>,
    pub roots: Vec<RootSpec>,
    pub audit_sinks: Vec<AuditSinkSpec>,
    pub session_tokens: Option<u64>,
    pub tenant_tokens: Option<u64>,
    /// Locale of result error messages; `en` when unset.
    pub locale: Option<String>,
}

impl EnvConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("invalid cordon configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn into_builder(self) -> Result<SandboxedEnvBuilder> {
        let mut builder = SandboxedEnv::builder();
        if let Some(name) = &self.preset {
            builder = builder.preset(presets::preset(name)?);
        }
        if let Some(policy) = self.policy {
            builder = builder.policy(policy);
        }
        if let Some(locale) = self.locale {
            builder = builder.locale(locale);
        }
        let builder = self
            .audit_sinks
            .into_iter()
            .fold(builder, |b, spec| b.audit_sink_spec(spec));
        Ok(builder
            .mode(self.mode)
            .runner(self.runner)
            .capabilities(self.capabilities)
            .roots(self.roots)
            .session_tokens(self.session_tokens)
            .tenant_tokens(self.tenant_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use std::io::Write;

    const SAMPLE: &str = r#"
preset = "compute_plus_math"
session_tokens = 100

[policy]
max_steps = 5000

[[capabilities]]
name = "upper"
path = "text:upper"
tokens_per_call = 2

[capabilities.budget]
max_calls = 3

[[audit_sinks]]
kind = "memory"

[runner]
kind = "command"
command = ["cordon-worker", "--log-json"]
"#;

    #[test]
    fn test_parse_sample() {
        let config = EnvConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.preset.as_deref(), Some("compute_plus_math"));
        assert_eq!(config.policy.as_ref().unwrap().max_steps, 5000);
        assert_eq!(config.capabilities[0].budget.max_calls, Some(3));
        // unset budget fields fall back to their defaults
        assert_eq!(config.capabilities[0].budget.max_ret_bytes, Some(200_000));
        assert_eq!(config.audit_sinks, vec![AuditSinkSpec::Memory]);
        assert!(!config.runner.is_local());
        assert_eq!(config.mode, ProcessMode::Spawn);
    }

    #[test]
    fn test_into_builder_builds_env() {
        let env = EnvConfig::from_toml_str(SAMPLE)
            .unwrap()
            .into_builder()
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(env.policy().max_steps, 5000);
        // preset roots survive an inline policy
        assert!(env.policy().attr_allowlist["math"].contains("sqrt"));
        assert!(env.policy().call_name_allowlist.contains("upper"));
        assert_eq!(env.session_ledger().remaining(), Some(100));
        assert!(env.memory_sink().is_some());
        assert_eq!(env.locale(), "en");
    }

    #[test]
    fn test_locale_reaches_env() {
        let config = EnvConfig::from_toml_str("locale = \"zh-CN\"\n").unwrap();
        assert_eq!(config.locale.as_deref(), Some("zh-CN"));
        let env = config.into_builder().unwrap().build().unwrap();
        assert_eq!(env.locale(), "zh-CN");
    }

    #[test]
    fn test_unknown_preset_is_invalid_config() {
        let config = EnvConfig {
            preset: Some("everything".into()),
            ..EnvConfig::default()
        };
        match config.into_builder() {
            Err(SandboxError::InvalidConfig(msg)) => assert!(msg.contains("everything")),
            Err(other) => panic!("expected InvalidConfig, got {other:?}"),
            Ok(_) => panic!("expected InvalidConfig, got a builder"),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"mode = \"fork\"\n").unwrap();
        let config = EnvConfig::load(file.path()).unwrap();
        assert_eq!(config.mode, ProcessMode::Fork);

        let err = EnvConfig::load("/nonexistent/cordon.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_bad_toml_has_context() {
        let err = EnvConfig::from_toml_str("mode = 3").unwrap_err();
        assert_eq!(err.to_string(), "invalid cordon configuration");
    }
}
