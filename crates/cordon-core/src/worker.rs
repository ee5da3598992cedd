//! The worker side of an execution.
//!
//! A worker receives one [`WorkerRequest`], applies OS hardening and
//! resource ceilings, evaluates the checked script on a dedicated thread and
//! reports a [`WorkerOutcome`]. Fresh-process workers resolve capabilities
//! and roots through [`WorkerCatalogs`]; forked workers inherit live
//! handles from the host.

use std::io::{BufRead, BufReader, Write};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::audit::{AuditSink, AuditStream, Event, LineWriter};
use crate::capability::{Capability, CapabilityCatalog, CapabilitySpec, Dispatcher, TokenClient};
use crate::checker::{check_module, InputBindings};
use crate::error::{ErrorInfo, Result, SandboxError, SchemaStage};
use crate::guard::{self, Clock, OutputStream, SandboxRng, StreamKind};
use crate::hardening;
use crate::interp::value::DictStore;
use crate::interp::{ExecContext, Interpreter, Key, Scope, Value};
use crate::policy::{EVENTS_NAME, RESULT_NAME, STATS_NAME};
use crate::protocol::{
    read_message, write_message, HostReply, ProtocolError, WorkerMessage, WorkerOutcome, WorkerRequest,
};
use crate::result::RunMetrics;
use crate::roots::{RootCatalog, RootProxy};
use crate::schema::{BuiltinValidator, SchemaValidator};
use crate::serialize::{to_safe_json, FloatFormat};

/// Stack reserved for the evaluator thread.
pub const EVAL_STACK_BYTES: usize = 64 * 1024 * 1024;

/// What a worker binary can construct from descriptors.
#[derive(Clone)]
pub struct WorkerCatalogs {
    pub capabilities: CapabilityCatalog,
    pub roots: RootCatalog,
    pub schema: Arc<dyn SchemaValidator>,
}

impl std::fmt::Debug for WorkerCatalogs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCatalogs")
            .field("capabilities", &self.capabilities)
            .field("roots", &self.roots)
            .finish()
    }
}

impl WorkerCatalogs {
    pub fn builtin() -> Self {
        Self {
            capabilities: CapabilityCatalog::builtin(),
            roots: RootCatalog::builtin(),
            schema: Arc::new(BuiltinValidator::new()),
        }
    }

    /// Resolve every descriptor of `request` into live handles.
    pub fn resolve(&self, request: &WorkerRequest) -> Result<WorkerBindings> {
        let mut capabilities = Vec::with_capacity(request.capabilities.len());
        for spec in &request.capabilities {
            let path = spec.path.as_deref().ok_or_else(|| {
                SandboxError::WorkerFault(format!(
                    "capability '{}' has no catalog path",
                    spec.name
                ))
            })?;
            let handle = self.capabilities.resolve(path).ok_or_else(|| {
                SandboxError::WorkerFault(format!("unknown capability path '{path}'"))
            })?;
            capabilities.push((spec.clone(), handle));
        }
        let roots = request
            .roots
            .iter()
            .map(|spec| {
                self.roots
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

/// Live handles one execution runs with.
pub struct WorkerBindings {
    pub capabilities: Vec<(CapabilitySpec, Arc<dyn Capability>)>,
    pub roots: Vec<RootProxy>,
    pub schema: Arc<dyn SchemaValidator>,
}

/// Shared writer towards the host.
#[derive(Clone)]
pub struct HostLink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl HostLink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn send(&self, message: &WorkerMessage) -> std::result::Result<(), ProtocolError> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        write_message(&mut *writer, message)
    }

    /// Line writer that forwards stdout audit envelopes to the host.
    pub fn audit_writer(&self) -> LineWriter {
        let link = self.clone();
        Arc::new(move |line: &str| {
            link.send(&WorkerMessage::AuditLine {
                line: line.to_string(),
            })
            .map_err(std::io::Error::other)
        })
    }
}

/// Token client that asks the host, which owns every ledger.
pub struct ProtocolTokens<R> {
    reader: R,
    link: HostLink,
}

impl<R: BufRead> ProtocolTokens<R> {
    pub fn new(reader: R, link: HostLink) -> Self {
        Self { reader, link }
    }
}

impl<R: BufRead> TokenClient for ProtocolTokens<R> {
    fn consume(&mut self, capability: &str, n: u64, init_exec: Option<u64>) -> Result<()> {
        let fault = |e: ProtocolError| SandboxError::WorkerFault(format!("token channel: {e}"));
        self.link
            .send(&WorkerMessage::ConsumeTokens {
                capability: capability.to_string(),
                n,
                init_exec,
            })
            .map_err(fault)?;
        match read_message::<_, HostReply>(&mut self.reader).map_err(fault)? {
            Some(HostReply::TokensGranted) => Ok(()),
            Some(HostReply::TokensDenied { needed, available }) => Err(SandboxError::TokenExhausted {
                capability: capability.to_string(),
                needed,
                available,
            }),
            None => Err(SandboxError::WorkerFault(
                "host closed the token channel".into(),
            )),
        }
    }
}

/// Entry point for worker binaries: serve one request on stdin/stdout.
pub fn worker_main(catalogs: WorkerCatalogs) -> anyhow::Result<()> {
    serve(&catalogs, BufReader::new(std::io::stdin()), std::io::stdout())?;
    Ok(())
}

/// Read a request from `reader`, run it and report on `writer`.
pub fn serve<R, W>(catalogs: &WorkerCatalogs, mut reader: R, writer: W) -> std::result::Result<(), ProtocolError>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    let link = HostLink::new(writer);
    let request: WorkerRequest = match read_message(&mut reader)? {
        Some(request) => request,
        None => {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "no request on stdin",
            )))
        }
    };
    request.check_version()?;
    tracing::debug!(event = "worker.request", execution_id = %request.execution_id);
    let bindings = catalogs.resolve(&request);
    serve_request(request, bindings, reader, link)
}

/// Run an already decoded request and send the `finished` message.
pub fn serve_request<R>(
    request: WorkerRequest,
    bindings: Result<WorkerBindings>,
    reader: R,
    link: HostLink,
) -> std::result::Result<(), ProtocolError>
where
    R: BufRead + Send + 'static,
{
    let outcome = match bindings {
        Ok(bindings) => {
            let sinks = build_sinks(&request, &link);
            let tokens = ProtocolTokens::new(reader, link.clone());
            run(request, bindings, sinks, tokens)
        }
        Err(err) => WorkerOutcome::failure(
            ErrorInfo::from_error(&err, None),
            Vec::new(),
            RunMetrics::default(),
        ),
    };
    link.send(&WorkerMessage::Finished {
        outcome: Box::new(outcome),
    })
}

/// Worker-side sinks. A sink that cannot be opened is skipped.
fn build_sinks(request: &WorkerRequest, link: &HostLink) -> Vec<Arc<dyn AuditSink>> {
    let writer = link.audit_writer();
    request
        .audit_sinks
        .iter()
        .filter(|spec| !spec.is_host_side())
        .filter_map(|spec| match spec.build_worker_sink(&writer) {
            Ok(sink) => Some(sink),
            Err(e) => {
                tracing::warn!(event = "audit.sink_unavailable", sink = spec.kind(), error = %e);
                None
            }
        })
        .collect()
}

/// Harden the process, then evaluate on the evaluator thread.
pub fn run<T>(
    request: WorkerRequest,
    bindings: WorkerBindings,
    sinks: Vec<Arc<dyn AuditSink>>,
    tokens: T,
) -> WorkerOutcome
where
    T: TokenClient + Send + 'static,
{
    let fail = |err: SandboxError| {
        WorkerOutcome::failure(ErrorInfo::from_error(&err, None), Vec::new(), RunMetrics::default())
    };
    match hardening::apply(request.policy.os_hardening.as_ref()) {
        Ok(report) => {
            for skipped in &report.skipped {
                tracing::warn!(event = "worker.hardening_skipped", detail = %skipped);
            }
        }
        Err(e) => return fail(SandboxError::WorkerFault(format!("os hardening failed: {e}"))),
    }

    // A forked child runs with logging disabled; the eval thread inherits that.
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    let spawned = std::thread::Builder::new()
        .name("cordon-eval".into())
        .stack_size(EVAL_STACK_BYTES)
        .spawn(move || {
            let _dispatch = tracing::dispatcher::set_default(&dispatch);
            let baseline = guard::measure_baseline();
            for warning in guard::apply_resource_limits(&request.policy, baseline) {
                tracing::debug!(event = "worker.limit_skipped", detail = %warning);
            }
            evaluate(&request, bindings, sinks, Box::new(tokens))
        });
    match spawned {
        Ok(handle) => handle
            .join()
            .unwrap_or_else(|_| fail(SandboxError::WorkerFault("evaluator thread panicked".into()))),
        Err(e) => fail(SandboxError::WorkerFault(format!(
            "cannot start evaluator thread: {e}"
        ))),
    }
}

struct Finished {
    result: serde_json::Value,
    locals: serde_json::Map<String, serde_json::Value>,
    user_stats: serde_json::Value,
}

/// Evaluate one request on the current thread.
pub fn evaluate(
    request: &WorkerRequest,
    bindings: WorkerBindings,
    sinks: Vec<Arc<dyn AuditSink>>,
    tokens: Box<dyn TokenClient>,
) -> WorkerOutcome {
    let started = Instant::now();
    let clock = Rc::new(Clock::from_determinism(request.policy.determinism.as_ref()));
    let audit = Rc::new(AuditStream::new(request.execution_id.clone(), sinks));
    let mut metrics = RunMetrics::default();

    let finished = run_script(request, bindings, tokens, &clock, &audit, &mut metrics);

    metrics.wall_ms = started.elapsed().as_millis() as u64;
    let usage = guard::process_usage();
    metrics.user_ms = usage.user_ms;
    metrics.sys_ms = usage.sys_ms;
    metrics.max_rss_kb = usage.max_rss_kb;

    match finished {
        Ok(done) => WorkerOutcome {
            ok: true,
            result: done.result,
            locals: done.locals,
            error: None,
            events: audit.take_events(),
            metrics,
            user_stats: done.user_stats,
        },
        Err(err) => WorkerOutcome::failure(
            ErrorInfo::from_error(&err, Some(&request.code)),
            audit.take_events(),
            metrics,
        ),
    }
}

fn run_script(
    request: &WorkerRequest,
    bindings: WorkerBindings,
    tokens: Box<dyn TokenClient>,
    clock: &Rc<Clock>,
    audit: &Rc<AuditStream>,
    metrics: &mut RunMetrics,
) -> Result<Finished> {
    let policy = &request.policy;
    let float_format = policy.float_format()?;
    let module = cordon_script::parse(&request.code)?;
    let inputs = InputBindings::from_inputs(request.inputs.as_ref());
    metrics.ast_nodes = check_module(&module, policy, &inputs)?.ast_nodes;

    let mut dispatcher = Dispatcher::new(bindings.capabilities, audit.clone(), clock.clone(), tokens)?;
    let capability_names = dispatcher.names();
    let ctx = ExecContext {
        clock: clock.clone(),
        rng: SandboxRng::from_determinism(policy.determinism.as_ref()),
        stdout: OutputStream::new(StreamKind::Stdout, policy.max_stdout_bytes, audit.clone(), clock.clone()),
        stderr: OutputStream::new(StreamKind::Stderr, policy.max_stderr_bytes, audit.clone(), clock.clone()),
        capabilities: &mut dispatcher,
        capability_names,
        roots: bindings.roots.into_iter().map(Rc::new).collect(),
    };
    let mut interp = Interpreter::new(policy, ctx);
    interp.bind_inputs(request.inputs.as_ref());
    let outcome = interp.run(&module);
    metrics.steps = interp.steps();
    metrics.stdout_bytes = interp.stdout_bytes();
    metrics.stderr_bytes = interp.stderr_bytes();
    let globals = interp.globals().clone();
    drop(interp);

    dispatcher.close();
    metrics.capabilities = dispatcher.stats();
    outcome?;

    let outputs = Outputs {
        float_format: float_format.as_ref(),
        max_bytes: Some(policy.max_stdout_bytes),
    };
    let result = outputs.named(&globals, RESULT_NAME)?;
    let user_stats = outputs.named(&globals, STATS_NAME)?;
    let locals = outputs.locals(&globals)?;
    if let Some(events) = globals.get_local(EVENTS_NAME) {
        outputs.emit_user_events(&events, clock, audit)?;
    }

    if let Some(schema) = &policy.output_schema {
        bindings
            .schema
            .validate(&result, schema)
            .map_err(|e| e.into_sandbox(SchemaStage::Output))?;
    }
    Ok(Finished {
        result,
        locals,
        user_stats,
    })
}

/// Conversion of script values for the host.
struct Outputs<'a> {
    float_format: Option<&'a FloatFormat>,
    max_bytes: Option<usize>,
}

impl Outputs<'_> {
    fn convert(&self, value: &Value) -> Result<serde_json::Value> {
        to_safe_json(value, self.float_format, self.max_bytes)
    }

    fn named(&self, globals: &Scope, name: &str) -> Result<serde_json::Value> {
        match globals.get_local(name) {
            Some(value) => self.convert(&value),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// Script globals, minus dunder names.
    fn locals(&self, globals: &Scope) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut store = DictStore::new();
        for (name, value) in globals.snapshot() {
            if name.starts_with("__") {
                continue;
            }
            store.insert(Key::Str(Rc::from(name.as_str())), Value::str(&name), value);
        }
        match self.convert(&Value::dict(store))? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(serde_json::Map::new()),
        }
    }

    /// Append the script's `__events__` to the stream. A non-list value is
    /// treated as a single event.
    fn emit_user_events(&self, raw: &Value, clock: &Clock, audit: &AuditStream) -> Result<()> {
        let items = match raw {
            Value::List(items) => items.borrow().clone(),
            other => vec![other.clone()],
        };
        for item in items {
            let event = match item.dict_entries() {
                Some(entries) => self.dict_event(&entries, clock)?,
                None => Event::new(
                    clock.elapsed_ms(),
                    "user",
                    serde_json::json!({ "value": self.convert(&item)? }),
                ),
            };
            audit.emit(event);
        }
        Ok(())
    }

    fn dict_event(&self, entries: &[(Value, Value)], clock: &Clock) -> Result<Event> {
        let field = |name: &str| {
            entries
                .iter()
                .find(|(k, _)| matches!(k, Value::Str(s) if &**s == name))
                .map(|(_, v)| v.clone())
        };
        let kind = field("type")
            .map(|v| v.to_str())
            .unwrap_or_else(|| "user".to_string());
        let ts_ms = match field("ts_ms") {
            Some(Value::Int(ms)) => ms.max(0) as u64,
            Some(Value::Float(ms)) if ms.is_finite() => ms.max(0.0) as u64,
            _ => clock.elapsed_ms(),
        };
        let data = match field("data") {
            Some(Value::None) | None => {
                let mut rest = DictStore::new();
                for (k, v) in entries {
                    let reserved = matches!(k, Value::Str(s) if matches!(&**s, "type" | "ts_ms" | "data"));
                    if reserved {
                        continue;
                    }
                    if let Ok(key) = k.to_key() {
                        rest.insert(key, k.clone(), v.clone());
                    }
                }
                self.convert(&Value::dict(rest))?
            }
            Some(data) => self.convert(&data)?,
        };
        Ok(Event::new(ts_ms, &kind, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{from_fn, LocalTokens, ScopeBundle};
    use crate::error::ErrorKind;
    use crate::policy::Policy;
    use crate::protocol::{ProcessMode, PROTOCOL_VERSION};
    use crate::roots::RootSpec;
    use serde_json::json;

    fn request(code: &str, policy: Policy) -> WorkerRequest {
        WorkerRequest {
            version: PROTOCOL_VERSION,
            execution_id: "test".into(),
            code: code.into(),
            policy,
            capabilities: Vec::new(),
            roots: Vec::new(),
            inputs: None,
            mode: ProcessMode::Spawn,
            audit_sinks: Vec::new(),
        }
    }

    fn eval(request: &WorkerRequest) -> WorkerOutcome {
        let bindings = WorkerCatalogs::builtin().resolve(request).unwrap();
        evaluate(
            request,
            bindings,
            Vec::new(),
            Box::new(LocalTokens::new(ScopeBundle::unlimited())),
        )
    }

    #[test]
    fn test_result_stats_and_locals() {
        let out = eval(&request(
            "x = 2\n__result__ = {'value': 123}\n__stats__ = {'items': 42}\n",
            Policy::default(),
        ));
        assert!(out.ok, "{:?}", out.error);
        assert_eq!(out.result, json!({"value": 123}));
        assert_eq!(out.user_stats, json!({"items": 42}));
        assert_eq!(out.locals.get("x"), Some(&json!(2)));
        assert!(!out.locals.contains_key("__result__"));
        assert!(out.metrics.steps > 0);
        assert!(out.metrics.ast_nodes > 0);
    }

    #[test]
    fn test_user_events_shapes() {
        let code = "__events__ = [{'type': 'progress', 'pct': 50}, {'data': [1, 2], 'ts_ms': 7}, 'done']\n";
        let out = eval(&request(code, Policy::default()));
        assert!(out.ok, "{:?}", out.error);
        assert_eq!(out.events.len(), 3);
        assert_eq!(out.events[0].kind, "progress");
        assert_eq!(out.events[0].data, json!({"pct": 50}));
        assert_eq!(out.events[1].kind, "user");
        assert_eq!(out.events[1].ts_ms, 7);
        assert_eq!(out.events[1].data, json!([1, 2]));
        assert_eq!(out.events[2].data, json!({"value": "done"}));
    }

    #[test]
    fn test_single_event_value_is_wrapped() {
        let out = eval(&request("__events__ = {'type': 'only'}\n", Policy::default()));
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].kind, "only");
    }

    #[test]
    fn test_runtime_error_has_excerpt() {
        let out = eval(&request("x = 1\ny = x / 0\n", Policy::default()));
        assert!(!out.ok);
        let error = out.error.unwrap();
        assert_eq!(error.kind, ErrorKind::RuntimeError);
        assert_eq!(error.error_type, "ZeroDivisionError");
        assert_eq!(error.lineno, Some(2));
        assert_eq!(error.excerpt.as_deref(), Some("y = x / 0"));
        assert_eq!(out.result, serde_json::Value::Null);
    }

    #[test]
    fn test_output_schema_checked_in_worker() {
        let mut policy = Policy::default();
        policy.output_schema = Some(json!({"type": "object", "required": ["value"]}));
        let out = eval(&request("__result__ = {'other': 1}\n", policy));
        let error = out.error.unwrap();
        assert_eq!(error.kind, ErrorKind::SchemaValidationError);
        assert_eq!(error.detail.unwrap()["stage"], "output");
    }

    #[test]
    fn test_capabilities_and_roots_resolve_from_catalogs() {
        let mut policy = Policy::default().with_root_attrs("math", ["sqrt"]);
        policy.allow_call("upper");
        let mut req = request("__result__ = [upper('ab'), math.sqrt(16)]\n", policy);
        req.capabilities = vec![CapabilitySpec::from_path("upper", "text:upper")];
        req.roots = vec![RootSpec::new("math", "math").allow_call("sqrt")];
        let out = eval(&req);
        assert!(out.ok, "{:?}", out.error);
        assert_eq!(out.result, json!(["AB", 4.0]));
        assert_eq!(out.metrics.capabilities["upper"].calls, 1);
        assert_eq!(out.events.iter().filter(|e| e.kind == "cap").count(), 1);
    }

    #[test]
    fn test_unresolvable_descriptors_are_worker_faults() {
        let mut req = request("x = 1", Policy::default());
        req.capabilities = vec![CapabilitySpec::registered("live")];
        match WorkerCatalogs::builtin().resolve(&req) {
            Err(SandboxError::WorkerFault(msg)) => assert!(msg.contains("no catalog path")),
            Err(other) => panic!("expected WorkerFault, got {other:?}"),
            Ok(_) => panic!("expected WorkerFault, got bindings"),
        }
        req.capabilities = vec![CapabilitySpec::from_path("x", "nope:nope")];
        assert!(WorkerCatalogs::builtin().resolve(&req).is_err());
    }

    #[test]
    fn test_protocol_tokens_round_trip() {
        let mut replies = Vec::new();
        write_message(&mut replies, &HostReply::TokensGranted).unwrap();
        write_message(
            &mut replies,
            &HostReply::TokensDenied {
                needed: 4,
                available: 1,
            },
        )
        .unwrap();

        let sent = Arc::new(Mutex::new(Vec::<u8>::new()));
        let link = HostLink::new(SharedBuf(sent.clone()));
        let mut tokens = ProtocolTokens::new(std::io::Cursor::new(replies), link);
        tokens.consume("shout", 2, Some(10)).unwrap();
        match tokens.consume("shout", 4, None) {
            Err(SandboxError::TokenExhausted { needed, available, .. }) => {
                assert_eq!((needed, available), (4, 1));
            }
            other => panic!("expected TokenExhausted, got {other:?}"),
        }
        match tokens.consume("shout", 1, None) {
            Err(SandboxError::WorkerFault(_)) => {}
            other => panic!("expected WorkerFault, got {other:?}"),
        }

        let text = String::from_utf8(sent.lock().unwrap().clone()).unwrap();
        let first: WorkerMessage = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(
            first,
            WorkerMessage::ConsumeTokens {
                capability: "shout".into(),
                n: 2,
                init_exec: Some(10)
            }
        );
    }

    #[test]
    fn test_audit_writer_sends_audit_lines() {
        let sent = Arc::new(Mutex::new(Vec::<u8>::new()));
        let link = HostLink::new(SharedBuf(sent.clone()));
        (link.audit_writer())("{\"type\":\"cap\"}").unwrap();
        let text = String::from_utf8(sent.lock().unwrap().clone()).unwrap();
        let message: WorkerMessage = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(
            message,
            WorkerMessage::AuditLine {
                line: "{\"type\":\"cap\"}".into()
            }
        );
    }

    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_token_denial_aborts_script() {
        let mut policy = Policy::permissive();
        policy.allow_call("shout");
        let mut req = request(
            "try:\n    x = shout('a')\nexcept Exception:\n    x = 'caught'\n",
            policy,
        );
        req.capabilities = vec![CapabilitySpec::from_path("shout", "text:upper").with_tokens(5, 0.0)];
        let bindings = WorkerCatalogs::builtin().resolve(&req).unwrap();
        let scopes = ScopeBundle::new(
            crate::capability::TokenLedger::limited(1),
            crate::capability::TokenLedger::limited(1),
            crate::capability::TokenLedger::limited(1),
        );
        let out = evaluate(&req, bindings, Vec::new(), Box::new(LocalTokens::new(scopes)));
        assert_eq!(out.error.unwrap().kind, ErrorKind::TokenExhausted);
    }

    #[test]
    fn test_capability_failure_is_catchable() {
        let mut policy = Policy::permissive();
        policy.allow_call("boom");
        let mut req = request(
            "try:\n    boom('x')\nexcept CapabilityError:\n    __result__ = 'caught'\n",
            policy,
        );
        req.capabilities = vec![CapabilitySpec::registered("boom")];
        let bindings = WorkerBindings {
            capabilities: vec![(
                req.capabilities[0].clone(),
                from_fn(|_| Err("nope".to_string())),
            )],
            roots: Vec::new(),
            schema: Arc::new(BuiltinValidator::new()),
        };
        let out = evaluate(
            &req,
            bindings,
            Vec::new(),
            Box::new(LocalTokens::new(ScopeBundle::unlimited())),
        );
        assert!(out.ok, "{:?}", out.error);
        assert_eq!(out.result, json!("caught"));
    }
}
