//! cordon core library
//!
//! Runs untrusted script code with bounded capability. A script is checked
//! statically against a [`Policy`], shipped to a separate worker process and
//! evaluated under step, recursion, time and OS resource ceilings; every
//! side effect goes through a budgeted, token-metered capability.
//!
//! The host entry point is [`SandboxedEnv`]; worker binaries call
//! [`worker::worker_main`].

pub mod audit;
pub mod capability;
pub mod checker;
pub mod config;
pub mod env;
pub mod error;
pub mod guard;
pub mod hardening;
pub mod i18n;
pub mod interp;
pub mod metrics;
pub mod obs;
pub mod plugins;
pub mod policy;
pub mod presets;
pub mod protocol;
pub mod result;
pub mod roots;
pub mod runner;
pub mod schema;
pub mod serialize;
pub mod telemetry;
pub mod worker;

pub use audit::{AuditSink, AuditSinkSpec, Event, MemorySink};
pub use capability::{
    from_fn, BudgetSpec, CallArgs, Capability, CapabilityCatalog, CapabilitySpec, ScopeBundle,
    TokenLedger, TokenSnapshot,
};
pub use checker::{check, CheckReport, InputBindings};
pub use config::EnvConfig;
pub use env::{SandboxedEnv, SandboxedEnvBuilder};
pub use error::{
    BudgetDimension, ErrorInfo, ErrorKind, ResourceKind, Result, SandboxError, SchemaStage, Stage,
};
pub use i18n::{register_bundle, translate, translate_error, translate_message};
pub use plugins::{AuditFilePlugin, MathRootsPlugin, Plugin, PluginContext, TextCapsPlugin};
pub use policy::{DeterminismConfig, FsMode, OsHardeningConfig, Policy};
pub use presets::{preset, presets, PolicyPreset};
pub use protocol::ProcessMode;
pub use result::{RunMetrics, RunStats, SandboxResult};
pub use roots::{RootCatalog, RootObject, RootSpec};
pub use runner::{ProcessLauncher, RunnerSpec, WorkerLauncher};
pub use schema::{BuiltinValidator, SchemaError, SchemaValidator};
pub use worker::{worker_main, WorkerCatalogs};
