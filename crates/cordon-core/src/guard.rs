//! Runtime guard: steps, clocks, randomness, output ceilings and OS limits.
//!
//! Everything here runs inside the worker. The host enforces the wall-clock
//! deadline separately by killing the worker's process group.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::audit::{AuditStream, Event};
use crate::error::{Result, SandboxError};
use crate::policy::{DeterminismConfig, Policy};

/// Counts evaluator steps against `max_steps`.
#[derive(Debug, Clone)]
pub struct StepCounter {
    used: u64,
    limit: u64,
}

impl StepCounter {
    pub fn new(limit: u64) -> Self {
        Self { used: 0, limit }
    }

    pub fn tick(&mut self) -> Result<()> {
        self.used += 1;
        if self.used > self.limit {
            return Err(SandboxError::StepBudgetExceeded {
                limit: self.limit,
                location: None,
            });
        }
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

/// Worker clock. The fake variant advances by a fixed step on every read so
/// repeated runs observe identical timestamps.
#[derive(Debug)]
pub enum Clock {
    Real {
        origin: Instant,
    },
    Fake {
        start: f64,
        step: f64,
        reads: Cell<u64>,
    },
}

impl Clock {
    pub fn real() -> Self {
        Clock::Real {
            origin: Instant::now(),
        }
    }

    pub fn fake(start: f64, step: f64) -> Self {
        Clock::Fake {
            start,
            step,
            reads: Cell::new(0),
        }
    }

    pub fn from_determinism(det: Option<&DeterminismConfig>) -> Self {
        match det.and_then(|d| d.fake_time.map(|t| (t, d.time_step))) {
            Some((start, step)) => Clock::fake(start, step),
            None => Clock::real(),
        }
    }

    /// Seconds since the Unix epoch.
    pub fn now(&self) -> f64 {
        match self {
            Clock::Real { .. } => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            Clock::Fake { start, step, reads } => {
                let n = reads.get();
                reads.set(n + 1);
                start + n as f64 * step
            }
        }
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn elapsed_ms(&self) -> u64 {
        (self.elapsed_secs() * 1000.0).max(0.0) as u64
    }

    /// Monotonic seconds since the clock was created.
    pub fn elapsed_secs(&self) -> f64 {
        match self {
            Clock::Real { origin } => origin.elapsed().as_secs_f64(),
            Clock::Fake { start, .. } => self.now() - start,
        }
    }
}

/// Script-visible PRNG, seeded when determinism is configured.
#[derive(Debug)]
pub struct SandboxRng {
    inner: StdRng,
}

impl SandboxRng {
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_determinism(det: Option<&DeterminismConfig>) -> Self {
        match det {
            Some(d) => Self::seeded(d.seed),
            None => Self {
                inner: StdRng::from_entropy(),
            },
        }
    }

    /// Uniform float in `[0, 1)`.
    pub fn random(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    /// Uniform integer in `[low, high]`.
    pub fn randint(&mut self, low: i64, high: i64) -> Option<i64> {
        (low <= high).then(|| self.inner.gen_range(low..=high))
    }

    pub fn uniform(&mut self, a: f64, b: f64) -> f64 {
        a + (b - a) * self.random()
    }

    /// Index into a sequence of `len` items.
    pub fn index(&mut self, len: usize) -> Option<usize> {
        (len > 0).then(|| self.inner.gen_range(0..len))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Byte-capped script output. Every accepted write becomes one event; the
/// write that hits the ceiling is cut and marked `truncated`.
pub struct OutputStream {
    kind: StreamKind,
    limit: usize,
    written: usize,
    audit: Rc<AuditStream>,
    clock: Rc<Clock>,
}

impl OutputStream {
    pub fn new(kind: StreamKind, limit: usize, audit: Rc<AuditStream>, clock: Rc<Clock>) -> Self {
        Self {
            kind,
            limit,
            written: 0,
            audit,
            clock,
        }
    }

    pub fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let remaining = self.limit.saturating_sub(self.written);
        if remaining == 0 {
            return;
        }
        let mut cut = text.len().min(remaining);
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let chunk = &text[..cut];
        self.written += chunk.len();
        let mut data = json!({ "text": chunk });
        if cut < text.len() {
            data["truncated"] = json!(true);
        }
        self.audit.emit(Event::new(
            self.clock.elapsed_ms(),
            self.kind.as_str(),
            data,
        ));
    }

    pub fn bytes_written(&self) -> usize {
        self.written
    }
}

/// Resource usage of the current process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub user_ms: u64,
    pub sys_ms: u64,
    pub max_rss_kb: u64,
}

#[cfg(unix)]
pub fn process_usage() -> Usage {
    // SAFETY: getrusage only writes into the zeroed struct we pass.
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) };
    if rc != 0 {
        return Usage::default();
    }
    let ms = |tv: libc::timeval| (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000;
    Usage {
        user_ms: ms(ru.ru_utime),
        sys_ms: ms(ru.ru_stime),
        max_rss_kb: ru.ru_maxrss.max(0) as u64,
    }
}

#[cfg(not(unix))]
pub fn process_usage() -> Usage {
    Usage::default()
}

/// Footprint measured at worker bootstrap. Ceilings are granted as growth
/// on top of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Baseline {
    pub address_space_bytes: u64,
    pub highest_fd: u64,
}

#[cfg(target_os = "linux")]
pub fn measure_baseline() -> Baseline {
    let page = {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            4096
        }
    };
    let address_space_bytes = std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()))
        .map(|pages| pages * page)
        .unwrap_or(0);
    let highest_fd = std::fs::read_dir("/proc/self/fd")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<u64>().ok()))
                .max()
                .unwrap_or(2)
        })
        .unwrap_or(2);
    Baseline {
        address_space_bytes,
        highest_fd,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn measure_baseline() -> Baseline {
    Baseline::default()
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(target_os = "linux", not(target_env = "gnu")))]
type RlimitResource = libc::c_int;

#[cfg(target_os = "linux")]
fn lower_limit(resource: RlimitResource, soft: u64, hard: u64) -> std::io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit/setrlimit read and write the rlimit structs we own.
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let cap = |v: u64| {
        if current.rlim_max == libc::RLIM_INFINITY {
            v
        } else {
            v.min(current.rlim_max)
        }
    };
    let new = libc::rlimit {
        rlim_cur: cap(soft),
        rlim_max: cap(hard),
    };
    if unsafe { libc::setrlimit(resource, &new) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Apply CPU, address-space and descriptor ceilings. Best effort: failures
/// are returned as warnings, never as errors.
#[cfg(target_os = "linux")]
pub fn apply_resource_limits(policy: &Policy, baseline: Baseline) -> Vec<String> {
    let mut warnings = Vec::new();
    let cpu = policy.max_cpu_seconds.max(1);
    if let Err(e) = lower_limit(libc::RLIMIT_CPU, cpu, cpu + 1) {
        warnings.push(format!("RLIMIT_CPU: {e}"));
    }
    let memory = baseline
        .address_space_bytes
        .saturating_add(policy.max_memory_mb.saturating_mul(1024 * 1024));
    if let Err(e) = lower_limit(libc::RLIMIT_AS, memory, memory) {
        warnings.push(format!("RLIMIT_AS: {e}"));
    }
    let files = baseline.highest_fd + 1 + policy.max_open_files;
    if let Err(e) = lower_limit(libc::RLIMIT_NOFILE, files, files) {
        warnings.push(format!("RLIMIT_NOFILE: {e}"));
    }
    warnings
}

#[cfg(not(target_os = "linux"))]
pub fn apply_resource_limits(_policy: &Policy, _baseline: Baseline) -> Vec<String> {
    vec!["resource limits are only applied on Linux".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_counter_allows_exactly_limit() {
        let mut steps = StepCounter::new(3);
        for _ in 0..3 {
            steps.tick().unwrap();
        }
        match steps.tick().unwrap_err() {
            SandboxError::StepBudgetExceeded { limit, .. } => assert_eq!(limit, 3),
            other => panic!("expected StepBudgetExceeded, got {other:?}"),
        }
        assert_eq!(steps.used(), 4);
    }

    #[test]
    fn test_fake_clock_advances_per_read() {
        let clock = Clock::fake(1000.0, 0.5);
        assert_eq!(clock.now(), 1000.0);
        assert_eq!(clock.now(), 1000.5);
        assert_eq!(clock.elapsed_ms(), 1000);
    }

    #[test]
    fn test_seeded_rng_repeats() {
        let mut a = SandboxRng::seeded(7);
        let mut b = SandboxRng::seeded(7);
        let xs: Vec<f64> = (0..4).map(|_| a.random()).collect();
        let ys: Vec<f64> = (0..4).map(|_| b.random()).collect();
        assert_eq!(xs, ys);
        assert_eq!(a.randint(3, 2), None);
        let r = a.randint(1, 6).unwrap();
        assert!((1..=6).contains(&r));
    }

    #[test]
    fn test_output_stream_truncates_once() {
        let audit = Rc::new(AuditStream::in_memory());
        let clock = Rc::new(Clock::fake(0.0, 0.0));
        let mut out = OutputStream::new(StreamKind::Stdout, 5, audit.clone(), clock);
        out.write("abc");
        out.write("defgh");
        out.write("ignored");
        let events = audit.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data["text"], "abc");
        assert!(events[0].data.get("truncated").is_none());
        assert_eq!(events[1].data["text"], "de");
        assert_eq!(events[1].data["truncated"], true);
        assert_eq!(out.bytes_written(), 5);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let audit = Rc::new(AuditStream::in_memory());
        let clock = Rc::new(Clock::real());
        let mut out = OutputStream::new(StreamKind::Stderr, 2, audit.clone(), clock);
        out.write("é!");
        assert_eq!(audit.events()[0].data["text"], "é");
        assert_eq!(audit.events()[0].kind, "stderr");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_baseline_reports_footprint() {
        let b = measure_baseline();
        assert!(b.address_space_bytes > 0);
        assert!(b.highest_fd >= 2);
    }
}
