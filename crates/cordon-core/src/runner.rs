//! Host side of the worker boundary: launch a worker process, serve its
//! token requests and enforce the wall-clock timeout.
//!
//! Every worker runs in its own process group so a timeout can kill the
//! worker together with anything it started.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::audit::LineWriter;
use crate::capability::ScopeBundle;
use crate::error::{ResourceKind, Result, SandboxError};
use crate::protocol::{decode_line, encode_line, HostReply, ProcessMode, WorkerMessage, WorkerOutcome, WorkerRequest, MAX_LINE_BYTES};
use crate::worker::WorkerBindings;

/// Environment variable naming the worker binary.
pub const WORKER_BIN_ENV: &str = "CORDON_WORKER_BIN";

/// Default worker binary name.
pub const WORKER_BIN: &str = "cordon-worker";

/// How much worker stderr is kept for fault messages.
const STDERR_TAIL_BYTES: usize = 4096;

/// Where fresh-process workers come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerSpec {
    /// The worker binary on this machine. Without `program` it is found
    /// through `CORDON_WORKER_BIN`, next to the current executable, or on
    /// `PATH`.
    Local {
        #[serde(default)]
        program: Option<PathBuf>,
    },
    /// An arbitrary command speaking the worker protocol, e.g. a wrapper
    /// that enters a container first.
    Command {
        command: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
}

impl Default for RunnerSpec {
    fn default() -> Self {
        RunnerSpec::Local { program: None }
    }
}

impl RunnerSpec {
    pub fn is_local(&self) -> bool {
        matches!(self, RunnerSpec::Local { .. })
    }

    fn command(&self) -> Result<tokio::process::Command> {
        match self {
            RunnerSpec::Local { program } => {
                let program = program.clone().unwrap_or_else(locate_worker);
                Ok(tokio::process::Command::new(program))
            }
            RunnerSpec::Command { command, env, cwd } => {
                let (program, args) = command.split_first().ok_or_else(|| {
                    SandboxError::InvalidConfig("runner command is empty".into())
                })?;
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args).envs(env);
                if let Some(cwd) = cwd {
                    cmd.current_dir(cwd);
                }
                Ok(cmd)
            }
        }
    }
}

fn locate_worker() -> PathBuf {
    if let Some(path) = std::env::var_os(WORKER_BIN_ENV) {
        return PathBuf::from(path);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BIN)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(WORKER_BIN))
}

/// One execution handed to a launcher.
pub struct LaunchJob {
    pub request: WorkerRequest,
    /// Live handles for fork mode; fresh processes resolve descriptors.
    pub bindings: Option<WorkerBindings>,
    pub scopes: ScopeBundle,
    /// Destination of worker stdout-sink lines.
    pub audit_out: LineWriter,
    pub timeout: Duration,
}

/// Runs a job in a worker and returns what the worker reported.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, job: LaunchJob) -> Result<WorkerOutcome>;
}

/// Launches OS processes: `fork` or the worker binary.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    runner: RunnerSpec,
}

impl ProcessLauncher {
    pub fn new(runner: RunnerSpec) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, job: LaunchJob) -> Result<WorkerOutcome> {
        match job.request.mode {
            ProcessMode::Spawn => spawn_worker(&self.runner, job).await,
            ProcessMode::Fork => fork_worker(job).await,
        }
    }
}

/// Kills a worker's process group when dropped.
struct GroupKill {
    pgid: libc::pid_t,
}

impl GroupKill {
    /// Falls back to the leader alone when the group does not exist (yet).
    fn kill(&self) {
        // SAFETY: signalling a process group we created, or its leader.
        unsafe {
            if libc::killpg(self.pgid, libc::SIGKILL) != 0 {
                libc::kill(self.pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn spawn_worker(runner: &RunnerSpec, job: LaunchJob) -> Result<WorkerOutcome> {
    let mut cmd = runner.command()?;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::WorkerFault(format!("cannot start worker: {e}")))?;
    let pid = child.id();
    crate::obs::emit_worker_spawned(&job.request.execution_id, pid);
    let group = pid.map(|pid| GroupKill { pgid: pid as libc::pid_t });

    let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take()) else {
        return Err(SandboxError::WorkerFault("worker pipes unavailable".into()));
    };
    let stderr_tail = tokio::spawn(read_tail(stderr));

    let request_line = encode_line(&job.request).map_err(fault)?;
    let session = async {
        let mut stdin = stdin;
        stdin
            .write_all(request_line.as_bytes())
            .await
            .map_err(|e| SandboxError::WorkerFault(format!("cannot send request: {e}")))?;
        stdin.flush().await.map_err(|e| fault(e.into()))?;
        serve_session(BufReader::new(stdout), stdin, &job.scopes, &job.audit_out).await
    };
    let session_error = match tokio::time::timeout(job.timeout, session).await {
        Ok(Ok(Some(outcome))) => return Ok(outcome),
        Ok(Ok(None)) => None,
        Ok(Err(e)) => Some(e),
        Err(_) => return Err(timed_out(&job)),
    };
    drop(group);
    let status = child.wait().await.ok();
    let tail = stderr_tail.await.unwrap_or_default();
    Err(explain_exit(session_error, status, &tail))
}

async fn fork_worker(job: LaunchJob) -> Result<WorkerOutcome> {
    let LaunchJob {
        request,
        bindings,
        scopes,
        audit_out,
        timeout,
    } = job;
    let execution_id = request.execution_id.clone();
    let limit_ms = request.policy.timeout_ms;
    let bindings = bindings.ok_or_else(|| SandboxError::WorkerFault("fork mode needs live bindings".into()))?;

    let forked = fork::fork_serve(request, bindings)?;
    crate::obs::emit_worker_spawned(&execution_id, Some(forked.pid as u32));
    let group = GroupKill { pgid: forked.pid };
    let stderr_tail = tokio::spawn(read_tail(tokio::fs::File::from_std(forked.stderr)));

    let session = serve_session(
        BufReader::new(tokio::fs::File::from_std(forked.from_child)),
        tokio::fs::File::from_std(forked.to_child),
        &scopes,
        &audit_out,
    );
    let finished = tokio::time::timeout(timeout, session).await;
    // Kill before reaping; the pid must not be signalled once it can be reused.
    drop(group);
    let status = reap(forked.pid).await;
    let session_error = match finished {
        Err(_) => {
            tracing::warn!(event = "worker.timeout", execution_id = %execution_id, limit_ms);
            return Err(SandboxError::Timeout { limit_ms });
        }
        Ok(Ok(Some(outcome))) => return Ok(outcome),
        Ok(Ok(None)) => None,
        Ok(Err(e)) => Some(e),
    };
    let tail = stderr_tail.await.unwrap_or_default();
    Err(explain_exit(session_error, status, &tail))
}

async fn reap(pid: libc::pid_t) -> Option<ExitStatus> {
    tokio::task::spawn_blocking(move || {
        let mut status: libc::c_int = 0;
        // SAFETY: waiting on our own child.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        (rc == pid).then(|| ExitStatus::from_raw(status))
    })
    .await
    .ok()
    .flatten()
}

fn timed_out(job: &LaunchJob) -> SandboxError {
    tracing::warn!(
        event = "worker.timeout",
        execution_id = %job.request.execution_id,
        limit_ms = job.request.policy.timeout_ms,
    );
    SandboxError::Timeout {
        limit_ms: job.request.policy.timeout_ms,
    }
}

fn fault(e: crate::protocol::ProtocolError) -> SandboxError {
    SandboxError::WorkerFault(format!("worker protocol: {e}"))
}

/// Answer token requests and forward audit lines until the worker reports
/// `finished`. `Ok(None)` means the worker closed its stdout first.
async fn serve_session<R, W>(
    mut reader: R,
    mut writer: W,
    scopes: &ScopeBundle,
    audit_out: &LineWriter,
) -> Result<Option<WorkerOutcome>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_line(&mut line)
            .await
            .map_err(|e| fault(e.into()))?;
        if n == 0 {
            return Ok(None);
        }
        match decode_line::<WorkerMessage>(&line).map_err(fault)? {
            WorkerMessage::ConsumeTokens {
                capability,
                n,
                init_exec,
            } => {
                if let Some(tokens) = init_exec {
                    scopes.init_exec(tokens);
                }
                let reply = match scopes.consume(&capability, n) {
                    Ok(()) => HostReply::TokensGranted,
                    Err(SandboxError::TokenExhausted { needed, available, .. }) => {
                        HostReply::TokensDenied { needed, available }
                    }
                    Err(other) => return Err(other),
                };
                let encoded = encode_line(&reply).map_err(fault)?;
                writer
                    .write_all(encoded.as_bytes())
                    .await
                    .map_err(|e| fault(e.into()))?;
                writer.flush().await.map_err(|e| fault(e.into()))?;
            }
            WorkerMessage::AuditLine { line } => {
                if let Err(e) = audit_out(&line) {
                    tracing::warn!(event = "audit.sink_failed", sink = "stdout", error = %e);
                }
            }
            WorkerMessage::Finished { outcome } => return Ok(Some(*outcome)),
        }
    }
}

/// Keep the last bytes of a stream.
async fn read_tail<R: AsyncRead + Unpin>(mut stream: R) -> String {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES * 2 {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
        }
    }
    if tail.len() > STDERR_TAIL_BYTES {
        tail.drain(..tail.len() - STDERR_TAIL_BYTES);
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Explain a worker whose session ended without an outcome. What the exit
/// status and stderr say wins over the pipe error that ended the session.
fn explain_exit(session_error: Option<SandboxError>, status: Option<ExitStatus>, stderr: &str) -> SandboxError {
    let classified = classify_exit(status, stderr);
    match (session_error, classified) {
        (Some(SandboxError::WorkerFault(cause)), SandboxError::WorkerFault(exit)) => {
            SandboxError::WorkerFault(format!("{exit}; session ended with: {cause}"))
        }
        (Some(other), SandboxError::WorkerFault(_)) => other,
        (_, classified) => classified,
    }
}

/// Explain a worker that died without reporting.
pub(crate) fn classify_exit(status: Option<ExitStatus>, stderr: &str) -> SandboxError {
    if status.and_then(|s| s.signal()) == Some(libc::SIGXCPU) {
        return SandboxError::ResourceLimitExceeded {
            resource: ResourceKind::Cpu,
            message: "CPU time limit exceeded".into(),
            location: None,
        };
    }
    if stderr.contains("memory allocation of") {
        return SandboxError::ResourceLimitExceeded {
            resource: ResourceKind::Memory,
            message: "memory limit exceeded".into(),
            location: None,
        };
    }
    let status = status.map_or_else(|| "unknown status".to_string(), |s| s.to_string());
    let stderr = stderr.trim();
    if stderr.is_empty() {
        SandboxError::WorkerFault(format!("worker exited without a result ({status})"))
    } else {
        SandboxError::WorkerFault(format!("worker exited without a result ({status}): {stderr}"))
    }
}

mod fork {
    use std::fs::File;
    use std::io::BufReader;
    use std::os::fd::{FromRawFd, OwnedFd};

    use crate::error::{Result, SandboxError};
    use crate::protocol::WorkerRequest;
    use crate::worker::{serve_request, HostLink, WorkerBindings};

    pub(super) struct Forked {
        pub pid: libc::pid_t,
        pub to_child: File,
        pub from_child: File,
        pub stderr: File,
    }

    fn pipe() -> Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds is a valid two-element array.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(SandboxError::WorkerFault(format!(
                "pipe2: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: pipe2 returned two fresh descriptors we now own.
        Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
    }

    /// Fork a child that serves `request` from memory and exits.
    pub(super) fn fork_serve(request: WorkerRequest, bindings: WorkerBindings) -> Result<Forked> {
        let (child_in, host_out) = pipe()?;
        let (host_in, child_out) = pipe()?;
        let (err_in, err_out) = pipe()?;

        // SAFETY: the child only runs the worker and leaves with _exit.
        match unsafe { libc::fork() } {
            -1 => Err(SandboxError::WorkerFault(format!(
                "fork: {}",
                std::io::Error::last_os_error()
            ))),
            0 => {
                drop((host_out, host_in, err_in));
                child_main(request, bindings, child_in, child_out, err_out)
            }
            pid => {
                // Both sides set the group so a kill right after fork still
                // reaches it.
                // SAFETY: pid is our freshly forked child.
                unsafe {
                    libc::setpgid(pid, pid);
                }
                Ok(Forked {
                    pid,
                    to_child: File::from(host_out),
                    from_child: File::from(host_in),
                    stderr: File::from(err_in),
                })
            }
        }
    }

    fn child_main(
        request: WorkerRequest,
        bindings: WorkerBindings,
        input: OwnedFd,
        output: OwnedFd,
        stderr: OwnedFd,
    ) -> ! {
        use std::os::fd::AsRawFd;
        // SAFETY: plain syscalls on descriptors owned by this process.
        unsafe {
            libc::setpgid(0, 0);
            libc::dup2(stderr.as_raw_fd(), libc::STDERR_FILENO);
        }
        drop(stderr);
        // Subscriber locks may have been held by other host threads.
        let _quiet = tracing::dispatcher::set_default(&tracing::Dispatch::none());

        let link = HostLink::new(File::from(output));
        let reader = BufReader::new(File::from(input));
        let code = match serve_request(request, Ok(bindings), reader, link) {
            Ok(()) => 0,
            Err(_) => 1,
        };
        // SAFETY: leave without running the host's atexit handlers.
        unsafe { libc::_exit(code) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::TokenLedger;
    use crate::protocol::{write_message, PROTOCOL_VERSION};
    use std::sync::{Arc, Mutex};

    fn lines(messages: &[WorkerMessage]) -> Vec<u8> {
        let mut buf = Vec::new();
        for m in messages {
            write_message(&mut buf, m).unwrap();
        }
        buf
    }

    fn collecting_writer() -> (LineWriter, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let writer: LineWriter = Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
            Ok(())
        });
        (writer, seen)
    }

    #[tokio::test]
    async fn test_session_answers_tokens_and_forwards_audit() {
        let outcome = WorkerOutcome {
            ok: true,
            result: serde_json::json!(1),
            locals: Default::default(),
            error: None,
            events: Vec::new(),
            metrics: Default::default(),
            user_stats: serde_json::Value::Null,
        };
        let input = lines(&[
            WorkerMessage::ConsumeTokens {
                capability: "f".into(),
                n: 3,
                init_exec: Some(5),
            },
            WorkerMessage::ConsumeTokens {
                capability: "f".into(),
                n: 3,
                init_exec: Some(5),
            },
            WorkerMessage::AuditLine { line: "{}".into() },
            WorkerMessage::Finished {
                outcome: Box::new(outcome.clone()),
            },
        ]);
        // exec unset, so the first request seeds it to 5
        let scopes = ScopeBundle::new(
            Arc::new(TokenLedger::new(None)),
            TokenLedger::limited(0),
            TokenLedger::limited(0),
        );
        let (audit_out, seen) = collecting_writer();
        let mut replies = Vec::new();
        let finished = serve_session(&input[..], &mut replies, &scopes, &audit_out)
            .await
            .unwrap();
        assert_eq!(finished, Some(outcome));
        assert_eq!(seen.lock().unwrap().as_slice(), ["{}"]);

        let replies: Vec<HostReply> = String::from_utf8(replies)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies[0], HostReply::TokensGranted);
        assert_eq!(
            replies[1],
            HostReply::TokensDenied {
                needed: 3,
                available: 2
            }
        );
        assert_eq!(scopes.snapshot().exec, Some(2));
    }

    #[tokio::test]
    async fn test_session_eof_is_none() {
        let (audit_out, _) = collecting_writer();
        let finished = serve_session(&b""[..], tokio::io::sink(), &ScopeBundle::unlimited(), &audit_out)
            .await
            .unwrap();
        assert!(finished.is_none());
    }

    #[tokio::test]
    async fn test_session_rejects_garbage() {
        let (audit_out, _) = collecting_writer();
        match serve_session(&b"nope\n"[..], tokio::io::sink(), &ScopeBundle::unlimited(), &audit_out).await {
            Err(SandboxError::WorkerFault(msg)) => assert!(msg.contains("malformed")),
            other => panic!("expected WorkerFault, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_exit() {
        let xcpu = ExitStatus::from_raw(libc::SIGXCPU);
        match classify_exit(Some(xcpu), "") {
            SandboxError::ResourceLimitExceeded { resource, .. } => assert_eq!(resource, ResourceKind::Cpu),
            other => panic!("expected ResourceLimitExceeded, got {other:?}"),
        }
        let abort = ExitStatus::from_raw(libc::SIGABRT);
        match classify_exit(Some(abort), "memory allocation of 1024 bytes failed") {
            SandboxError::ResourceLimitExceeded { resource, .. } => assert_eq!(resource, ResourceKind::Memory),
            other => panic!("expected ResourceLimitExceeded, got {other:?}"),
        }
        match classify_exit(Some(ExitStatus::from_raw(1 << 8)), "boom") {
            SandboxError::WorkerFault(msg) => assert!(msg.contains("boom")),
            other => panic!("expected WorkerFault, got {other:?}"),
        }
    }

    #[test]
    fn test_runner_spec_serde() {
        let spec: RunnerSpec = serde_json::from_value(serde_json::json!({
            "kind": "command",
            "command": ["docker", "run", "-i", "cordon-worker"]
        }))
        .unwrap();
        assert!(!spec.is_local());
        assert_eq!(RunnerSpec::default(), RunnerSpec::Local { program: None });
    }

    fn spawn_job(code: &str) -> LaunchJob {
        let (audit_out, _) = collecting_writer();
        LaunchJob {
            request: WorkerRequest {
                version: PROTOCOL_VERSION,
                execution_id: "e".into(),
                code: code.into(),
                policy: Default::default(),
                capabilities: Vec::new(),
                roots: Vec::new(),
                inputs: None,
                mode: ProcessMode::Spawn,
                audit_sinks: Vec::new(),
            },
            bindings: None,
            scopes: ScopeBundle::unlimited(),
            audit_out,
            timeout: Duration::from_secs(5),
        }
    }

    fn shell(script: &str) -> ProcessLauncher {
        ProcessLauncher::new(RunnerSpec::Command {
            command: vec!["sh".into(), "-c".into(), script.into()],
            env: Default::default(),
            cwd: None,
        })
    }

    #[tokio::test]
    async fn test_missing_worker_binary_is_worker_fault() {
        let launcher = ProcessLauncher::new(RunnerSpec::Local {
            program: Some(PathBuf::from("/nonexistent/cordon-worker")),
        });
        match launcher.launch(spawn_job("x = 1")).await {
            Err(SandboxError::WorkerFault(msg)) => assert!(msg.contains("cannot start worker")),
            other => panic!("expected WorkerFault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_crashed_worker_keeps_its_stderr() {
        // The worker exits before reading the request, so the write may hit
        // a closed pipe; the fault still has to carry the worker's stderr.
        let code = format!("x = '{}'", "a".repeat(1 << 20));
        let launcher = shell("exec 0<&-; echo boom >&2; exit 3");
        match launcher.launch(spawn_job(&code)).await {
            Err(SandboxError::WorkerFault(msg)) => {
                assert!(msg.contains("boom"), "{msg}");
                assert!(msg.contains('3'), "{msg}");
            }
            other => panic!("expected WorkerFault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_killed_by_cpu_limit_is_classified() {
        let launcher = shell("exec 0<&-; kill -XCPU $$");
        match launcher.launch(spawn_job("x = 1")).await {
            Err(SandboxError::ResourceLimitExceeded { resource, .. }) => {
                assert_eq!(resource, ResourceKind::Cpu)
            }
            other => panic!("expected ResourceLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_explain_exit_prefers_exit_diagnostics() {
        let broken = SandboxError::WorkerFault("cannot send request: Broken pipe".into());
        match explain_exit(Some(broken), Some(ExitStatus::from_raw(3 << 8)), "boom\n") {
            SandboxError::WorkerFault(msg) => {
                assert!(msg.contains("boom"));
                assert!(msg.contains("Broken pipe"));
            }
            other => panic!("expected WorkerFault, got {other:?}"),
        }
        let broken = SandboxError::WorkerFault("cannot send request: Broken pipe".into());
        match explain_exit(Some(broken), Some(ExitStatus::from_raw(libc::SIGXCPU)), "") {
            SandboxError::ResourceLimitExceeded { resource, .. } => assert_eq!(resource, ResourceKind::Cpu),
            other => panic!("expected ResourceLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_group_kill_falls_back_to_the_leader() {
        // The child stays in our process group, so no group carries its pid.
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        GroupKill {
            pgid: child.id() as libc::pid_t,
        }
        .kill();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }
}
