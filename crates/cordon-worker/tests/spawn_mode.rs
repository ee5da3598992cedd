//! Fresh-process executions against the real worker binary.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cordon_core::audit::LineWriter;
use cordon_core::{
    AuditSinkSpec, BudgetDimension, BudgetSpec, CapabilitySpec, DeterminismConfig, ErrorKind,
    Policy, RootSpec, RunnerSpec, SandboxedEnv, SandboxedEnvBuilder, TokenLedger,
};
use serde_json::json;

fn worker() -> RunnerSpec {
    RunnerSpec::Local {
        program: Some(PathBuf::from(env!("CARGO_BIN_EXE_cordon-worker"))),
    }
}

fn policy() -> Policy {
    Policy::default().with_timeout_ms(10_000)
}

fn builder() -> SandboxedEnvBuilder {
    SandboxedEnv::builder().runner(worker()).policy(policy())
}

#[tokio::test]
async fn test_result_locals_and_stats() {
    let env = builder().build().unwrap();
    let result = env
        .execute(
            "total = sum(items)\n__result__ = {'value': total}\n__stats__ = {'items': len(items)}\n",
            Some(json!({"items": [1, 2, 3]})),
            None,
        )
        .await;
    assert!(result.ok, "{:?}", result.error);
    assert_eq!(result.result, json!({"value": 6}));
    assert_eq!(result.stats.user, json!({"items": 3}));
    assert_eq!(result.locals["total"], json!(6));
    assert!(result.metrics.steps > 0);
    assert!(result.metrics.wall_ms > 0 || result.metrics.steps > 0);
}

#[tokio::test]
async fn test_non_mapping_input_bound_as_input() {
    let env = builder().build().unwrap();
    let result = env
        .execute("__result__ = [x * 2 for x in input]\n", Some(json!([1, 2])), None)
        .await;
    assert!(result.ok, "{:?}", result.error);
    assert_eq!(result.result, json!([2, 4]));
}

#[tokio::test]
async fn test_runtime_error_reports_location() {
    let env = builder().build().unwrap();
    let result = env.execute("a = 1\nb = a // 0\n", None, None).await;
    assert!(!result.ok);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::RuntimeError);
    assert_eq!(error.error_type, "ZeroDivisionError");
    assert_eq!(error.lineno, Some(2));
    assert_eq!(result.result, serde_json::Value::Null);
}

#[tokio::test]
async fn test_step_budget_is_exact() {
    let code = "t = 0\nfor i in range(50):\n    t = t + i\n__result__ = t\n";
    let env = builder().build().unwrap();
    let measured = env.execute(code, None, None).await;
    assert!(measured.ok, "{:?}", measured.error);
    let steps = measured.metrics.steps;

    let exact = builder()
        .policy(policy().with_max_steps(steps))
        .build()
        .unwrap();
    let result = exact.execute(code, None, None).await;
    assert!(result.ok, "{:?}", result.error);
    assert_eq!(result.result, json!(1225));

    let short = builder()
        .policy(policy().with_max_steps(steps - 1))
        .build()
        .unwrap();
    let result = short.execute(code, None, None).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::StepBudgetExceeded));
}

#[tokio::test]
async fn test_timeout_kills_worker() {
    let mut policy = Policy::default().with_timeout_ms(300).with_max_steps(u64::MAX / 2);
    policy.max_cpu_seconds = 30;
    let env = builder().policy(policy).build().unwrap();
    let started = std::time::Instant::now();
    let result = env.execute("while True:\n    pass\n", None, None).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn test_token_draining_across_scopes() {
    let env = builder()
        .session_tokens(Some(10))
        .capability(
            CapabilitySpec::from_path("upper", "text:upper")
                .with_budget(BudgetSpec::unlimited())
                .with_tokens(7, 0.0),
        )
        .build()
        .unwrap();

    let first = env.execute("x = upper('a')\n", None, Some(5)).await;
    assert!(first.ok, "{:?}", first.error);
    assert_eq!(first.stats.token_scopes.exec, Some(0));
    assert_eq!(first.stats.token_scopes.session, Some(8));

    let second = env.execute("x = upper('a')\n", None, None).await;
    assert!(second.ok, "{:?}", second.error);
    assert_eq!(second.stats.token_scopes.session, Some(1));

    // the unset tenant scope absorbs what session cannot cover
    let third = env.execute("x = upper('a')\n", None, None).await;
    assert!(third.ok, "{:?}", third.error);
    assert_eq!(third.stats.token_scopes.session, Some(0));
    assert_eq!(third.stats.token_scopes.tenant, None);
}

#[tokio::test]
async fn test_token_exhaustion_is_uncatchable() {
    let env = builder()
        .policy({
            let mut p = Policy::permissive().with_timeout_ms(10_000);
            p.allow_try = true;
            p
        })
        .session_ledger(TokenLedger::limited(3))
        .tenant_ledger(TokenLedger::limited(0))
        .capability(CapabilitySpec::from_path("upper", "text:upper").with_tokens(5, 0.0))
        .build()
        .unwrap();
    let result = env
        .execute(
            "try:\n    x = upper('a')\nexcept Exception:\n    x = 'caught'\n",
            None,
            Some(1),
        )
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::TokenExhausted));
    assert_eq!(result.events_of("cap").count(), 1);
    assert_eq!(env.session_ledger().remaining(), Some(3));
}

#[tokio::test]
async fn test_rate_limit_only() {
    let determinism = DeterminismConfig {
        fake_time: Some(1_700_000_000.0),
        time_step: 0.001,
        ..DeterminismConfig::default()
    };
    let env = builder()
        .policy(policy().with_determinism(determinism))
        .capability(
            CapabilitySpec::from_path("upper", "text:upper")
                .with_budget(BudgetSpec::unlimited().with_max_qps(1.0)),
        )
        .build()
        .unwrap();
    let result = env.execute("a = upper('x')\nb = upper('y')\n", None, None).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::BudgetExceeded));
    assert_eq!(result.budget_dimension(), Some(BudgetDimension::Rate));
}

#[tokio::test]
async fn test_identical_determinism_gives_identical_runs() {
    let determinism = DeterminismConfig {
        seed: 7,
        fake_time: Some(1_000.0),
        time_step: 0.5,
        float_format: Some(".4f".into()),
    };
    let env = builder()
        .policy(policy().with_determinism(determinism))
        .root(
            RootSpec::new("random", "random")
                .allow_call("random")
                .allow_call("randint"),
        )
        .root(RootSpec::new("time", "time").allow_call("time"))
        .build()
        .unwrap();
    let code = "r = random.random()\nprint(random.randint(1, 100))\n__result__ = [r, time.time()]\n";
    let a = env.execute(code, None, None).await;
    let b = env.execute(code, None, None).await;
    assert!(a.ok, "{:?}", a.error);
    assert_eq!(a.result, b.result);
    assert_eq!(a.events, b.events);
}

#[tokio::test]
async fn test_stdout_sink_lines_reach_host() {
    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = lines.clone();
    let writer: LineWriter = Arc::new(move |line: &str| {
        seen.lock().unwrap().push(line.to_string());
        Ok(())
    });
    let env = builder()
        .audit_sink_spec(AuditSinkSpec::Stdout)
        .audit_output(writer)
        .build()
        .unwrap();
    let result = env.execute("print('hello')\n", None, None).await;
    assert!(result.ok, "{:?}", result.error);
    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 1);
    let envelope: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(envelope["type"], "stdout");
}

#[tokio::test]
async fn test_file_sink_written_by_worker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let env = builder()
        .plugin(cordon_core::AuditFilePlugin::new(&path))
        .build()
        .unwrap();
    let result = env.execute("print('a')\nprint('b')\n", None, None).await;
    assert!(result.ok, "{:?}", result.error);
    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written.lines().count(), 2);
}

#[tokio::test]
async fn test_command_runner_crash_is_worker_fault() {
    let env = SandboxedEnv::builder()
        .policy(policy())
        .runner(RunnerSpec::Command {
            command: vec!["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()],
            env: Default::default(),
            cwd: None,
        })
        .build()
        .unwrap();
    let result = env.execute("x = 1\n", None, None).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::WorkerFault));
    assert!(result.error.unwrap().message.contains("boom"));
}

#[tokio::test]
async fn test_unknown_catalog_path_is_worker_fault() {
    let env = builder()
        .capability(CapabilitySpec::from_path("nope", "nowhere:nothing"))
        .build()
        .unwrap();
    let result = env.execute("x = 1\n", None, None).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::WorkerFault));
}
