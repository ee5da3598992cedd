//! Fork-mode executions: live bindings cross into a forked child.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cordon_core::capability::CallArgs;
use cordon_core::roots::{RootContext, RootError};
use cordon_core::{
    from_fn, AuditSink, CapabilitySpec, ErrorKind, MemorySink, Policy, ProcessMode, RootObject,
    RootSpec, SandboxedEnv,
};
use serde_json::json;

struct Greeter;

impl RootObject for Greeter {
    fn read(&self, attr: &str) -> Option<serde_json::Value> {
        (attr == "greeting").then(|| json!("hello"))
    }

    fn call(
        &self,
        attr: &str,
        call: &CallArgs,
        _ctx: &mut RootContext<'_>,
    ) -> Result<serde_json::Value, RootError> {
        match attr {
            "greet" => {
                let name = call.str_at(0, "name").map_err(RootError::BadArguments)?;
                Ok(json!(format!("hello, {name}")))
            }
            _ => Err(RootError::Unknown {
                root: "greeter".into(),
                attr: attr.into(),
            }),
        }
    }
}

fn policy() -> Policy {
    Policy::default().with_timeout_ms(10_000)
}

#[tokio::test]
async fn test_registered_capability_and_live_root() {
    let env = SandboxedEnv::builder()
        .mode(ProcessMode::Fork)
        .policy(policy())
        .register_capability(
            CapabilitySpec::registered("triple"),
            from_fn(|call| Ok(json!(call.i64_at(0, "n")? * 3))),
        )
        .live_root(
            RootSpec::new("greeter", "greeter")
                .allow_call("greet")
                .allow_value("greeting"),
            Arc::new(Greeter),
        )
        .build()
        .unwrap();
    let result = env
        .execute(
            "__result__ = [triple(4), greeter.greet('ada'), greeter.greeting]\n",
            None,
            None,
        )
        .await;
    assert!(result.ok, "{:?}", result.error);
    assert_eq!(result.result, json!([12, "hello, ada", "hello"]));
    assert_eq!(result.events_of("cap").count(), 1);
}

#[tokio::test]
async fn test_live_sink_replayed_on_host() {
    let sink = Arc::new(MemorySink::new());
    let dyn_sink: Arc<dyn AuditSink> = sink.clone();
    let env = SandboxedEnv::builder()
        .mode(ProcessMode::Fork)
        .policy(policy())
        .audit_sink(dyn_sink)
        .build()
        .unwrap();
    let result = env.execute("print('one')\nprint('two')\n", None, None).await;
    assert!(result.ok, "{:?}", result.error);
    assert_eq!(sink.events(), result.events);
    assert_eq!(result.stdout(), "one\ntwo\n");
}

#[tokio::test]
async fn test_forked_child_killed_on_timeout() {
    let mut policy = Policy::default()
        .with_timeout_ms(300)
        .with_max_steps(u64::MAX / 2);
    policy.max_cpu_seconds = 30;
    let env = SandboxedEnv::builder()
        .mode(ProcessMode::Fork)
        .policy(policy)
        .build()
        .unwrap();
    let started = Instant::now();
    let result = env.execute("while True:\n    pass\n", None, None).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_capability_failure_is_catchable() {
    let env = SandboxedEnv::builder()
        .mode(ProcessMode::Fork)
        .policy(Policy::permissive().with_timeout_ms(10_000))
        .register_capability(
            CapabilitySpec::registered("flaky"),
            from_fn(|_| Err("upstream unavailable".to_string())),
        )
        .build()
        .unwrap();
    let code = "try:\n    v = flaky()\nexcept Exception:\n    v = 'fallback'\n__result__ = v\n";
    let result = env.execute(code, None, None).await;
    assert!(result.ok, "{:?}", result.error);
    assert_eq!(result.result, json!("fallback"));
}
