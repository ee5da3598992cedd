//! Execution policy: every static and runtime limit for one sandbox.
//!
//! A [`Policy`] is immutable once an environment is built; the env shares it
//! as `Arc<Policy>` and ships a copy to each worker.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::serialize::FloatFormat;

/// Built-ins exposed by the default policy.
pub const SAFE_BUILTINS: &[&str] = &[
    "None",
    "True",
    "False",
    "abs",
    "all",
    "any",
    "bool",
    "dict",
    "enumerate",
    "float",
    "int",
    "len",
    "list",
    "max",
    "min",
    "range",
    "reversed",
    "round",
    "set",
    "sorted",
    "str",
    "sum",
    "tuple",
    "zip",
    "print",
];

/// Names the script writes to hand values back to the host.
pub const RESULT_NAME: &str = "__result__";
pub const EVENTS_NAME: &str = "__events__";
pub const STATS_NAME: &str = "__stats__";

/// Binding used for non-mapping inputs.
pub const INPUT_NAME: &str = "input";

/// Reproducibility knobs for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeterminismConfig {
    pub seed: u64,
    /// Start of the fake clock in seconds since the epoch. `None` keeps the
    /// real clock.
    pub fake_time: Option<f64>,
    /// Seconds the fake clock advances on every read.
    pub time_step: f64,
    /// Rendering applied to floats in results, events, stats and locals,
    /// e.g. `".6f"` or `".3e"`.
    pub float_format: Option<String>,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            fake_time: None,
            time_step: 0.0,
            float_format: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsMode {
    None,
    #[default]
    Tmp,
    Ro,
}

/// OS hardening requested for the worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsHardeningConfig {
    pub seccomp_profile: Option<PathBuf>,
    pub seccomp_enforce: bool,
    pub no_network: bool,
    pub fs_mode: FsMode,
    pub fs_enforce: bool,
    pub fs_chroot: bool,
    pub tmp_dir: Option<PathBuf>,
}

impl Default for OsHardeningConfig {
    fn default() -> Self {
        Self {
            seccomp_profile: None,
            seccomp_enforce: false,
            no_network: true,
            fs_mode: FsMode::Tmp,
            fs_enforce: false,
            fs_chroot: false,
            tmp_dir: None,
        }
    }
}

/// Static and runtime limits for one sandbox environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub builtin_allowlist: BTreeSet<String>,
    pub call_name_allowlist: BTreeSet<String>,
    /// `root -> {attr, ...}` pairs permitted for `root.attr`.
    pub attr_allowlist: BTreeMap<String, BTreeSet<String>>,

    pub allow_def: bool,
    pub allow_lambda: bool,
    pub allow_class: bool,
    pub allow_try: bool,
    pub allow_with: bool,
    pub allow_loops: bool,
    pub allow_comprehension: bool,
    pub allow_subscript: bool,

    /// Dunder names the script may assign but never read.
    #[serde(alias = "allow_dunder_names")]
    pub reserved_names: BTreeSet<String>,

    pub restrict_loop_iterables: bool,
    pub loop_iter_allowlist: BTreeSet<String>,
    pub allow_loop_iter_literals: bool,
    pub allow_loop_iter_names: bool,

    pub max_ast_nodes: usize,
    pub max_loop_nesting: usize,
    pub max_comp_nesting: usize,
    pub max_literal_elems: usize,
    pub max_const_alloc_elems: u64,

    pub timeout_ms: u64,
    pub max_steps: u64,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
    pub max_memory_mb: u64,
    pub max_cpu_seconds: u64,
    pub max_open_files: u64,
    pub max_recursion: usize,

    pub determinism: Option<DeterminismConfig>,
    pub input_schema: Option<serde_json::Value>,
    pub output_schema: Option<serde_json::Value>,
    #[serde(alias = "os_sandbox")]
    pub os_hardening: Option<OsHardeningConfig>,
}

fn string_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            builtin_allowlist: string_set(SAFE_BUILTINS),
            call_name_allowlist: string_set(SAFE_BUILTINS),
            attr_allowlist: BTreeMap::new(),
            allow_def: false,
            allow_lambda: false,
            allow_class: false,
            allow_try: false,
            allow_with: false,
            allow_loops: true,
            allow_comprehension: true,
            allow_subscript: true,
            reserved_names: string_set(&[RESULT_NAME, EVENTS_NAME, STATS_NAME]),
            restrict_loop_iterables: true,
            loop_iter_allowlist: string_set(&["range", "list", "tuple"]),
            allow_loop_iter_literals: true,
            allow_loop_iter_names: true,
            max_ast_nodes: 7000,
            max_loop_nesting: 3,
            max_comp_nesting: 3,
            max_literal_elems: 100_000,
            max_const_alloc_elems: 1_000_000,
            timeout_ms: 800,
            max_steps: 120_000,
            max_stdout_bytes: 32_000,
            max_stderr_bytes: 32_000,
            max_memory_mb: 256,
            max_cpu_seconds: 1,
            max_open_files: 32,
            max_recursion: 300,
            determinism: None,
            input_schema: None,
            output_schema: None,
            os_hardening: None,
        }
    }
}

impl Policy {
    /// A permissive variant for trusted snippets: definitions, lambdas,
    /// classes, `try` and `with` enabled and loop iterables unrestricted.
    pub fn permissive() -> Self {
        Self {
            allow_def: true,
            allow_lambda: true,
            allow_class: true,
            allow_try: true,
            allow_with: true,
            restrict_loop_iterables: false,
            ..Self::default()
        }
    }

    /// Allow `root.attr` for every attribute in `attrs` (builder pattern).
    pub fn with_root_attrs<I, S>(mut self, root: &str, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_root_attrs(root, attrs);
        self
    }

    pub fn allow_root_attrs<I, S>(&mut self, root: &str, attrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attr_allowlist
            .entry(root.to_string())
            .or_default()
            .extend(attrs.into_iter().map(Into::into));
    }

    /// Permit calling `name(...)`.
    pub fn allow_call(&mut self, name: &str) {
        self.call_name_allowlist.insert(name.to_string());
    }

    pub fn with_determinism(mut self, determinism: DeterminismConfig) -> Self {
        self.determinism = Some(determinism);
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Float rendering configured through determinism, if any.
    pub fn float_format(&self) -> Result<Option<FloatFormat>> {
        match self
            .determinism
            .as_ref()
            .and_then(|d| d.float_format.as_deref())
        {
            Some(spec) => FloatFormat::parse(spec).map(Some),
            None => Ok(None),
        }
    }

    /// Reject self-contradictory or unusable limits.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(SandboxError::InvalidConfig(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        if self.max_steps == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_steps must be greater than zero".into(),
            ));
        }
        if self.max_recursion == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_recursion must be greater than zero".into(),
            ));
        }
        for name in &self.reserved_names {
            if !(name.starts_with("__") && name.ends_with("__")) {
                return Err(SandboxError::InvalidConfig(format!(
                    "reserved name '{name}' must be a dunder name"
                )));
            }
        }
        for (root, attrs) in &self.attr_allowlist {
            if let Some(attr) = attrs.iter().find(|a| a.starts_with("__")) {
                return Err(SandboxError::InvalidConfig(format!(
                    "attr_allowlist entry '{root}.{attr}' exposes a dunder attribute"
                )));
            }
        }
        if let Some(det) = &self.determinism {
            if det.time_step < 0.0 || !det.time_step.is_finite() {
                return Err(SandboxError::InvalidConfig(
                    "determinism.time_step must be a non-negative finite number".into(),
                ));
            }
        }
        self.float_format()?;
        Ok(())
    }
}
