//! `SandboxedEnv`: the host-facing entry point.
//!
//! An environment is built once and then executes any number of scripts,
//! concurrently if the caller wishes. Every `execute` call gets its own
//! worker process and exec token scope; session and tenant ledgers are
//! shared across calls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;
use uuid::Uuid;

use crate::audit::{self, AuditSink, AuditSinkSpec, LineWriter, MemorySink, TracingSink};
use crate::capability::{Capability, CapabilitySpec, ScopeBundle, TokenLedger};
use crate::checker::{check, InputBindings};
use crate::error::{ErrorInfo, ErrorKind, Result, SandboxError, SchemaStage};
use crate::i18n;
use crate::metrics::METRICS;
use crate::obs::{self, ExecutionSpan};
use crate::plugins::{apply_plugins, Plugin, PluginContext};
use crate::policy::Policy;
use crate::presets::PolicyPreset;
use crate::protocol::{ProcessMode, WorkerOutcome, WorkerRequest, PROTOCOL_VERSION};
use crate::result::{RunMetrics, RunStats, SandboxResult};
use crate::roots::{RootObject, RootSpec};
use crate::runner::{LaunchJob, ProcessLauncher, RunnerSpec, WorkerLauncher};
use crate::schema::{BuiltinValidator, SchemaValidator};
use crate::worker::{WorkerBindings, WorkerCatalogs};

pub struct SandboxedEnvBuilder {
    policy: Policy,
    mode: ProcessMode,
    capabilities: Vec<CapabilitySpec>,
    registry: BTreeMap<String, Arc<dyn Capability>>,
    root_specs: Vec<RootSpec>,
    live_roots: Vec<String>,
    runner: RunnerSpec,
    audit_sinks: Vec<Arc<dyn AuditSink>>,
    audit_specs: Vec<AuditSinkSpec>,
    session: Arc<TokenLedger>,
    tenant: Arc<TokenLedger>,
    plugins: Vec<Box<dyn Plugin>>,
    schema: Option<Arc<dyn SchemaValidator>>,
    catalogs: WorkerCatalogs,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    audit_out: Option<LineWriter>,
    locale: String,
}

impl Default for SandboxedEnvBuilder {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            mode: ProcessMode::default(),
            capabilities: Vec::new(),
            registry: BTreeMap::new(),
            root_specs: Vec::new(),
            live_roots: Vec::new(),
            runner: RunnerSpec::default(),
            audit_sinks: Vec::new(),
            audit_specs: Vec::new(),
            session: TokenLedger::unlimited(),
            tenant: TokenLedger::unlimited(),
            plugins: Vec::new(),
            schema: None,
            catalogs: WorkerCatalogs::builtin(),
            launcher: None,
            audit_out: None,
            locale: i18n::DEFAULT_LOCALE.to_string(),
        }
    }
}

impl SandboxedEnvBuilder {
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Use a preset's policy and add its roots.
    pub fn preset(mut self, preset: PolicyPreset) -> Self {
        self.policy = preset.policy;
        self.root_specs.extend(preset.roots);
        self
    }

    pub fn mode(mut self, mode: ProcessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn capability(mut self, spec: CapabilitySpec) -> Self {
        self.capabilities.push(spec);
        self
    }

    pub fn capabilities(mut self, specs: impl IntoIterator<Item = CapabilitySpec>) -> Self {
        self.capabilities.extend(specs);
        self
    }

    /// Bind a live capability object. Duplicate-parent mode only.
    pub fn register_capability(mut self, spec: CapabilitySpec, handle: Arc<dyn Capability>) -> Self {
        self.registry.insert(spec.name.clone(), handle);
        self.capabilities.push(CapabilitySpec { path: None, ..spec });
        self
    }

    pub fn root(mut self, spec: RootSpec) -> Self {
        self.root_specs.push(spec);
        self
    }

    pub fn roots(mut self, specs: impl IntoIterator<Item = RootSpec>) -> Self {
        self.root_specs.extend(specs);
        self
    }

    /// Expose a live object as a root. Duplicate-parent mode only.
    pub fn live_root(mut self, spec: RootSpec, object: Arc<dyn RootObject>) -> Self {
        self.catalogs.roots.register(spec.target.clone(), object);
        self.live_roots.push(spec.name.clone());
        self.root_specs.push(spec);
        self
    }

    pub fn runner(mut self, runner: RunnerSpec) -> Self {
        self.runner = runner;
        self
    }

    /// A live sink, fed on the host after each execution. Duplicate-parent
    /// mode only.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sinks.push(sink);
        self
    }

    pub fn audit_sink_spec(mut self, spec: AuditSinkSpec) -> Self {
        self.audit_specs.push(spec);
        self
    }

    pub fn session_ledger(mut self, ledger: Arc<TokenLedger>) -> Self {
        self.session = ledger;
        self
    }

    pub fn tenant_ledger(mut self, ledger: Arc<TokenLedger>) -> Self {
        self.tenant = ledger;
        self
    }

    pub fn session_tokens(self, tokens: Option<u64>) -> Self {
        self.session_ledger(Arc::new(TokenLedger::new(tokens)))
    }

    pub fn tenant_tokens(self, tokens: Option<u64>) -> Self {
        self.tenant_ledger(Arc::new(TokenLedger::new(tokens)))
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn schema_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.schema = Some(validator);
        self
    }

    /// Catalogs used to resolve paths for duplicate-parent workers.
    pub fn catalogs(mut self, catalogs: WorkerCatalogs) -> Self {
        self.catalogs = catalogs;
        self
    }

    /// Replace process launching, e.g. with an in-process fake in tests.
    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Destination of stdout audit-sink lines; defaults to process stdout.
    pub fn audit_output(mut self, writer: LineWriter) -> Self {
        self.audit_out = Some(writer);
        self
    }

    /// Locale of result error messages, e.g. `zh-CN`.
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn build(mut self) -> Result<SandboxedEnv> {
        let plugins = std::mem::take(&mut self.plugins);
        apply_plugins(
            &plugins,
            &mut PluginContext {
                policy: &mut self.policy,
                capabilities: &mut self.capabilities,
                roots: &mut self.root_specs,
                audit_sinks: &mut self.audit_specs,
                locale: &mut self.locale,
            },
        )?;

        self.check_mode()?;
        self.check_runner()?;
        for spec in &self.audit_specs {
            spec.validate().map_err(|e| invalid(e.to_string()))?;
        }

        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.capabilities {
            if !seen.insert(spec.name.as_str()) {
                return Err(invalid(format!("capability '{}' is declared twice", spec.name)));
            }
            spec.budget.validate(&spec.name)?;
            if spec.path.is_none() && !self.registry.contains_key(&spec.name) {
                return Err(invalid(format!(
                    "capability '{}' has neither a catalog path nor a registered handle",
                    spec.name
                )));
            }
        }

        let mut policy = self.policy;
        for root in &self.root_specs {
            policy.allow_root_attrs(&root.name, root.attrs());
        }
        for spec in &self.capabilities {
            policy.allow_call(&spec.name);
        }
        policy.validate()?;

        let mut host_sinks = self.audit_sinks;
        let mut memory = None;
        let mut worker_sinks = Vec::new();
        for spec in self.audit_specs {
            match spec {
                AuditSinkSpec::Memory => {
                    let sink = Arc::new(MemorySink::new());
                    memory.get_or_insert_with(|| sink.clone());
                    host_sinks.push(sink);
                }
                AuditSinkSpec::Otel { service_name } => {
                    host_sinks.push(Arc::new(TracingSink::new(service_name)));
                }
                other => worker_sinks.push(other),
            }
        }

        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ProcessLauncher::new(self.runner.clone())));
        tracing::debug!(
            event = "env.built",
            mode = self.mode.as_str(),
            capabilities = self.capabilities.len(),
            roots = self.root_specs.len(),
        );
        Ok(SandboxedEnv {
            policy: Arc::new(policy),
            mode: self.mode,
            capabilities: self.capabilities,
            registry: self.registry,
            root_specs: self.root_specs,
            catalogs: self.catalogs,
            schema: self.schema.unwrap_or_else(|| Arc::new(BuiltinValidator::new())),
            session: self.session,
            tenant: self.tenant,
            host_sinks,
            worker_sinks,
            memory,
            launcher,
            audit_out: self.audit_out.unwrap_or_else(audit::stdout_writer),
            locale: self.locale,
        })
    }

    /// Fresh-process workers rebuild everything from descriptors.
    fn check_mode(&self) -> Result<()> {
        if self.mode != ProcessMode::Spawn {
            return Ok(());
        }
        if !self.registry.is_empty() {
            return Err(invalid(
                "a capability registry needs fork mode; use catalog paths".into(),
            ));
        }
        if !self.live_roots.is_empty() {
            return Err(invalid(format!(
                "live roots ({}) need fork mode; use catalog targets",
                self.live_roots.join(", ")
            )));
        }
        if !self.audit_sinks.is_empty() {
            return Err(invalid(
                "live audit sinks need fork mode; use audit sink specs".into(),
            ));
        }
        for (stage, schema) in [
            ("input_schema", &self.policy.input_schema),
            ("output_schema", &self.policy.output_schema),
        ] {
            if matches!(schema, Some(s) if !s.is_object()) {
                return Err(invalid(format!("{stage} must be a JSON object in spawn mode")));
            }
        }
        if self.schema.is_some() && self.policy.output_schema.is_some() {
            return Err(invalid(
                "a custom schema validator cannot check output_schema in spawn mode".into(),
            ));
        }
        Ok(())
    }

    fn check_runner(&self) -> Result<()> {
        if self.runner.is_local() {
            return Ok(());
        }
        if self.mode != ProcessMode::Spawn {
            return Err(invalid("a command runner requires spawn mode".into()));
        }
        if self.audit_specs.iter().any(|s| matches!(s, AuditSinkSpec::Stdout)) {
            return Err(invalid(
                "the stdout audit sink is not supported with a command runner".into(),
            ));
        }
        Ok(())
    }
}

fn invalid(message: String) -> SandboxError {
    SandboxError::InvalidConfig(message)
}

/// A configured sandbox.
pub struct SandboxedEnv {
    policy: Arc<Policy>,
    mode: ProcessMode,
    capabilities: Vec<CapabilitySpec>,
    registry: BTreeMap<String, Arc<dyn Capability>>,
    root_specs: Vec<RootSpec>,
    catalogs: WorkerCatalogs,
    schema: Arc<dyn SchemaValidator>,
    session: Arc<TokenLedger>,
    tenant: Arc<TokenLedger>,
    host_sinks: Vec<Arc<dyn AuditSink>>,
    worker_sinks: Vec<AuditSinkSpec>,
    memory: Option<Arc<MemorySink>>,
    launcher: Arc<dyn WorkerLauncher>,
    audit_out: LineWriter,
    locale: String,
}

impl std::fmt::Debug for SandboxedEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxedEnv")
            .field("mode", &self.mode)
            .field("capabilities", &self.capabilities)
            .field("roots", &self.root_specs)
            .finish_non_exhaustive()
    }
}

impl SandboxedEnv {
    pub fn builder() -> SandboxedEnvBuilder {
        SandboxedEnvBuilder::default()
    }

    /// The effective policy, after roots and capabilities were merged in.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn session_ledger(&self) -> &Arc<TokenLedger> {
        &self.session
    }

    pub fn tenant_ledger(&self) -> &Arc<TokenLedger> {
        &self.tenant
    }

    /// The first `memory` sink declared through a spec.
    pub fn memory_sink(&self) -> Option<&Arc<MemorySink>> {
        self.memory.as_ref()
    }

    /// Run `code` in a fresh worker. `inputs` objects are bound key by key,
    /// any other value as `input`. `tokens` seeds the exec scope.
    pub async fn execute(
        &self,
        code: &str,
        inputs: Option<serde_json::Value>,
        tokens: Option<u64>,
    ) -> SandboxResult {
        let execution_id = Uuid::new_v4().to_string();
        let span = ExecutionSpan::span(&execution_id);
        self.execute_inner(code, inputs, tokens, execution_id)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        code: &str,
        inputs: Option<serde_json::Value>,
        tokens: Option<u64>,
        execution_id: String,
    ) -> SandboxResult {
        let started = Instant::now();
        METRICS.inc_executions();
        obs::emit_execution_started(&execution_id, self.mode.as_str(), code.len());
        let scopes = ScopeBundle::new(
            Arc::new(TokenLedger::new(tokens)),
            self.session.clone(),
            self.tenant.clone(),
        );

        if let Err(err) = self.precheck(code, inputs.as_ref()).await {
            METRICS.inc_policy_rejections();
            let info = ErrorInfo::from_error(&err, Some(code));
            obs::emit_execution_rejected(&execution_id, &info.error_type, &info.message);
            let info = i18n::translate_error(&info, &self.locale);
            return SandboxResult::rejected(info, scopes.snapshot());
        }

        let mut result = match self.launch(code, inputs, &scopes, &execution_id).await {
            Ok(outcome) => assemble(outcome, &scopes),
            Err(err) => {
                let metrics = RunMetrics {
                    wall_ms: started.elapsed().as_millis() as u64,
                    ..RunMetrics::default()
                };
                SandboxResult::failed(ErrorInfo::from_error(&err, Some(code)), Vec::new(), metrics, scopes.snapshot())
            }
        };

        match result.error_kind() {
            Some(ErrorKind::Timeout) => METRICS.inc_timeouts(),
            Some(ErrorKind::WorkerFault) => {
                METRICS.inc_worker_faults();
                if let Some(error) = &result.error {
                    obs::emit_worker_fault(&execution_id, &error.message);
                }
            }
            _ => {}
        }
        METRICS.add_capability_calls(result.metrics.capability_calls());
        audit::replay(&self.host_sinks, &execution_id, &result.events);
        obs::emit_execution_finished(
            &execution_id,
            started.elapsed().as_millis() as u64,
            result.events.len(),
            result.ok,
        );
        if let Some(error) = result.error.take() {
            result.error = Some(i18n::translate_error(&error, &self.locale));
        }
        result
    }

    /// Everything that must fail before a worker starts.
    async fn precheck(&self, code: &str, inputs: Option<&serde_json::Value>) -> Result<()> {
        if let Some(serde_json::Value::Object(map)) = inputs {
            if let Some(key) = map.keys().find(|k| self.policy.reserved_names.contains(*k)) {
                return Err(SandboxError::PolicyViolation {
                    node: "Input".into(),
                    message: format!("input '{key}' uses a reserved name"),
                    location: None,
                });
            }
        }
        // Parsing and walking are CPU bound; keep them off the reactor.
        let source = code.to_string();
        let policy = self.policy.clone();
        let bindings = InputBindings::from_inputs(inputs);
        tokio::task::spawn_blocking(move || check(&source, &policy, &bindings).map(|_| ()))
            .await
            .map_err(|e| SandboxError::WorkerFault(format!("policy check aborted: {e}")))??;
        if let Some(schema) = &self.policy.input_schema {
            self.schema
                .validate(inputs.unwrap_or(&serde_json::Value::Null), schema)
                .map_err(|e| e.into_sandbox(SchemaStage::Input))?;
        }
        Ok(())
    }

    async fn launch(
        &self,
        code: &str,
        inputs: Option<serde_json::Value>,
        scopes: &ScopeBundle,
        execution_id: &str,
    ) -> Result<WorkerOutcome> {
        let bindings = match self.mode {
            ProcessMode::Fork => Some(self.live_bindings()?),
            ProcessMode::Spawn => None,
        };
        let request = WorkerRequest {
            version: PROTOCOL_VERSION,
            execution_id: execution_id.to_string(),
            code: code.to_string(),
            policy: (*self.policy).clone(),
            capabilities: self.capabilities.clone(),
            roots: self.root_specs.clone(),
            inputs,
            mode: self.mode,
            audit_sinks: self.worker_sinks.clone(),
        };
        let job = LaunchJob {
            request,
            bindings,
            scopes: scopes.clone(),
            audit_out: self.audit_out.clone(),
            timeout: Duration::from_millis(self.policy.timeout_ms),
        };
        self.launcher.launch(job).await
    }

    /// Live handles for a duplicate-parent worker.
    fn live_bindings(&self) -> Result<WorkerBindings> {
        let mut capabilities = Vec::with_capacity(self.capabilities.len());
        for spec in &self.capabilities {
            let handle = match &spec.path {
                Some(path) => self.catalogs.capabilities.resolve(path).ok_or_else(|| {
                    SandboxError::WorkerFault(format!("unknown capability path '{path}'"))
                })?,
                None => self.registry.get(&spec.name).cloned().ok_or_else(|| {
                    SandboxError::WorkerFault(format!("capability '{}' is not registered", spec.name))
                })?,
            };
            capabilities.push((spec.clone(), handle));
        }
        let roots = self
            .root_specs
            .iter()
            .map(|spec| {
                self.catalogs
                    .roots
                    .instantiate(spec)
                    .map_err(|e| SandboxError::WorkerFault(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkerBindings {
            capabilities,
            roots,
            schema: self.schema.clone(),
        })
    }
}

/// Turn a worker's report into the caller's result.
fn assemble(outcome: WorkerOutcome, scopes: &ScopeBundle) -> SandboxResult {
    let token_scopes = scopes.snapshot();
    match outcome.error {
        Some(error) => SandboxResult::failed(error, outcome.events, outcome.metrics, token_scopes),
        None if !outcome.ok => SandboxResult::failed(
            ErrorInfo::from_error(
                &SandboxError::WorkerFault("worker reported failure without an error".into()),
                None,
            ),
            outcome.events,
            outcome.metrics,
            token_scopes,
        ),
        None => SandboxResult {
            ok: true,
            result: outcome.result,
            locals: outcome.locals,
            error: None,
            events: outcome.events,
            metrics: outcome.metrics,
            stats: RunStats {
                user: outcome.user_stats,
                token_scopes,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{from_fn, LocalTokens};
    use crate::plugins::TextCapsPlugin;
    use crate::worker::evaluate;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Evaluates in-process, without a worker.
    struct InlineLauncher {
        requests: Mutex<Vec<WorkerRequest>>,
    }

    impl InlineLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl WorkerLauncher for InlineLauncher {
        async fn launch(&self, job: LaunchJob) -> Result<WorkerOutcome> {
            self.requests.lock().unwrap().push(job.request.clone());
            let bindings = match job.bindings {
                Some(b) => b,
                None => WorkerCatalogs::builtin().resolve(&job.request)?,
            };
            Ok(evaluate(
                &job.request,
                bindings,
                Vec::new(),
                Box::new(LocalTokens::new(job.scopes)),
            ))
        }
    }

    fn env(builder: SandboxedEnvBuilder) -> (SandboxedEnv, Arc<InlineLauncher>) {
        let launcher = InlineLauncher::new();
        let env = builder.launcher(launcher.clone()).build().unwrap();
        (env, launcher)
    }

    #[tokio::test]
    async fn test_execute_result_and_stats() {
        let (env, _) = env(SandboxedEnv::builder());
        let result = env
            .execute("__result__ = {'value': 123}\n__stats__ = {'items': 42}\n", None, None)
            .await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.result, json!({"value": 123}));
        assert_eq!(result.stats.user, json!({"items": 42}));
    }

    #[tokio::test]
    async fn test_policy_violation_starts_no_worker() {
        let (env, launcher) = env(SandboxedEnv::builder());
        let result = env.execute("import os\n", None, None).await;
        assert!(!result.ok);
        assert_eq!(result.error_kind(), Some(ErrorKind::PolicyViolation));
        assert!(result.events.is_empty());
        assert!(launcher.requests.lock().unwrap().is_empty());
        let error = result.error.unwrap();
        assert_eq!(error.lineno, Some(1));
        assert!(error.caret.is_some());
    }

    #[tokio::test]
    async fn test_locale_translates_result_errors() {
        let (zh, _) = env(SandboxedEnv::builder().locale("zh-CN"));
        assert_eq!(zh.locale(), "zh-CN");
        let rejected = zh.execute("import os\n", None, None).await;
        let error = rejected.error.unwrap();
        assert_eq!(error.kind, ErrorKind::PolicyViolation);
        assert_eq!(error.message, "禁止 import");
        assert_eq!(error.message_key.as_deref(), Some("error.import_not_allowed"));

        let (short, _) = env(SandboxedEnv::builder()
            .policy(Policy::default().with_max_steps(5))
            .locale("zh-CN"));
        let result = short
            .execute("t = 0\nfor i in range(100):\n    t = t + i\n", None, None)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::StepBudgetExceeded));
        assert_eq!(result.error.unwrap().message, "执行步数超限：5");
    }

    #[tokio::test]
    async fn test_unknown_locale_falls_back_to_english() {
        i18n::register_bundle("pt-TEST", [("error.global_not_allowed", "global não é permitido")]);
        let (env, _) = env(SandboxedEnv::builder().locale("pt-TEST"));
        let result = env.execute("global x\n", None, None).await;
        assert_eq!(result.error.unwrap().message, "global não é permitido");
        let result = env.execute("import os\n", None, None).await;
        assert_eq!(result.error.unwrap().message, "import is not allowed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_long_operator_chain_rejected_without_crashing() {
        let (env, launcher) = env(SandboxedEnv::builder());
        let code = format!("x = 1{}\n", " + 1".repeat(5000));
        let result = env.execute(&code, None, None).await;
        assert!(!result.ok);
        assert_eq!(result.error_kind(), Some(ErrorKind::SyntaxError));
        assert!(launcher.requests.lock().unwrap().is_empty());

        // the engine is still usable afterwards
        let result = env.execute("__result__ = 1 + 1 + 1\n", None, None).await;
        assert_eq!(result.result, json!(3));
    }

    #[tokio::test]
    async fn test_reserved_input_names_rejected() {
        let (env, launcher) = env(SandboxedEnv::builder());
        let result = env
            .execute("x = 1\n", Some(json!({"__result__": 5})), None)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::PolicyViolation));
        assert!(launcher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_input_schema_checked_on_host() {
        let mut policy = Policy::default();
        policy.input_schema = Some(json!({"type": "object", "required": ["n"]}));
        let (env, launcher) = env(SandboxedEnv::builder().policy(policy));
        let result = env.execute("x = 1\n", Some(json!({"m": 1})), None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::SchemaValidationError));
        assert!(launcher.requests.lock().unwrap().is_empty());

        let result = env.execute("__result__ = n * 2\n", Some(json!({"n": 4})), None).await;
        assert_eq!(result.result, json!(8));
    }

    #[tokio::test]
    async fn test_build_merges_roots_and_capability_names() {
        let (env, launcher) = env(SandboxedEnv::builder()
            .preset(crate::presets::preset("compute_plus_math").unwrap())
            .plugin(TextCapsPlugin::default()));
        assert!(env.policy().call_name_allowlist.contains("upper"));
        assert!(env.policy().attr_allowlist["math"].contains("sqrt"));
        let result = env
            .execute("__result__ = [upper('x'), math.floor(2.5)]\n", None, None)
            .await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.result, json!(["X", 2]));
        let request = &launcher.requests.lock().unwrap()[0];
        assert_eq!(request.capabilities.len(), 3);
        assert_eq!(request.roots[0].name, "math");
    }

    #[tokio::test]
    async fn test_token_scopes_shared_across_executions() {
        let (env, _) = env(SandboxedEnv::builder()
            .session_tokens(Some(10))
            .capability(CapabilitySpec::from_path("upper", "text:upper").with_tokens(7, 0.0)));
        let first = env.execute("x = upper('a')\n", None, Some(5)).await;
        assert!(first.ok, "{:?}", first.error);
        assert_eq!(first.stats.token_scopes.exec, Some(0));
        assert_eq!(first.stats.token_scopes.session, Some(8));

        let second = env.execute("x = upper('a')\n", None, None).await;
        assert!(second.ok, "{:?}", second.error);
        assert_eq!(env.session_ledger().remaining(), Some(1));
    }

    #[tokio::test]
    async fn test_memory_sink_receives_events() {
        let (env, _) = env(SandboxedEnv::builder().audit_sink_spec(AuditSinkSpec::Memory));
        let result = env.execute("print('hi')\n", None, None).await;
        assert!(result.ok, "{:?}", result.error);
        let events = env.memory_sink().unwrap().events();
        assert_eq!(events, result.events);
        assert_eq!(events[0].kind, "stdout");
    }

    #[test]
    fn test_spawn_mode_rejects_registry() {
        let err = SandboxedEnv::builder()
            .register_capability(CapabilitySpec::registered("f"), from_fn(|_| Ok(json!(1))))
            .build()
            .unwrap_err();
        match err {
            SandboxError::InvalidConfig(msg) => assert!(msg.contains("registry")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_spawn_mode_rejects_live_sinks_and_custom_output_validator() {
        let sink: Arc<dyn AuditSink> = Arc::new(MemorySink::new());
        assert!(SandboxedEnv::builder().audit_sink(sink.clone()).build().is_err());
        assert!(SandboxedEnv::builder()
            .mode(ProcessMode::Fork)
            .audit_sink(sink)
            .build()
            .is_ok());

        let mut policy = Policy::default();
        policy.output_schema = Some(json!({"type": "object"}));
        let custom: Arc<dyn SchemaValidator> = Arc::new(BuiltinValidator::new());
        assert!(SandboxedEnv::builder()
            .policy(policy.clone())
            .schema_validator(custom)
            .build()
            .is_err());

        policy.output_schema = Some(json!(true));
        assert!(SandboxedEnv::builder().policy(policy).build().is_err());
    }

    #[test]
    fn test_command_runner_constraints() {
        let runner = RunnerSpec::Command {
            command: vec!["cordon-worker".into()],
            env: Default::default(),
            cwd: None,
        };
        assert!(SandboxedEnv::builder()
            .runner(runner.clone())
            .mode(ProcessMode::Fork)
            .build()
            .is_err());
        assert!(SandboxedEnv::builder()
            .runner(runner.clone())
            .audit_sink_spec(AuditSinkSpec::Stdout)
            .build()
            .is_err());
        assert!(SandboxedEnv::builder().runner(runner).build().is_ok());
    }

    #[test]
    fn test_unusable_webhook_timeout_rejected_at_build() {
        let err = SandboxedEnv::builder()
            .audit_sink_spec(AuditSinkSpec::Webhook {
                url: "http://127.0.0.1:9/audit".into(),
                timeout_s: f64::INFINITY,
            })
            .build()
            .unwrap_err();
        match err {
            SandboxError::InvalidConfig(msg) => assert!(msg.contains("timeout_s")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_and_unbound_capabilities_rejected() {
        let spec = CapabilitySpec::from_path("upper", "text:upper");
        assert!(SandboxedEnv::builder()
            .capability(spec.clone())
            .capability(spec)
            .build()
            .is_err());
        assert!(SandboxedEnv::builder()
            .mode(ProcessMode::Fork)
            .capability(CapabilitySpec::registered("ghost"))
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn test_fork_mode_passes_live_bindings() {
        let (env, _) = env(SandboxedEnv::builder()
            .mode(ProcessMode::Fork)
            .register_capability(
                CapabilitySpec::registered("double"),
                from_fn(|call| Ok(json!(call.i64_at(0, "n")? * 2))),
            ));
        let result = env.execute("__result__ = double(21)\n", None, None).await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.result, json!(42));
        assert_eq!(result.metrics.capabilities["double"].calls, 1);
    }
}
