//! Best-effort OS hardening applied once at worker bootstrap.
//!
//! Linux gets a filesystem confinement step (scratch directory, optional
//! chroot, or a read-only root in a private mount namespace) followed by a
//! seccomp-BPF filter compiled from a Docker-style profile plus an optional
//! network deny list. Other platforms accept the configuration only when
//! nothing is enforced.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::policy::{FsMode, OsHardeningConfig};

#[derive(Debug, thiserror::Error)]
pub enum HardeningError {
    #[error("invalid seccomp profile: {0}")]
    InvalidProfile(String),

    #[error("unknown syscall '{0}'")]
    UnknownSyscall(String),

    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("hardening io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OS hardening requires Linux support ({0} enforcement requested)")]
    Unsupported(&'static str),
}

const ACTIONS: &[&str] = &[
    "SCMP_ACT_ALLOW",
    "SCMP_ACT_ERRNO",
    "SCMP_ACT_KILL",
    "SCMP_ACT_TRAP",
    "SCMP_ACT_LOG",
    "SCMP_ACT_KILL_PROCESS",
    "SCMP_ACT_KILL_THREAD",
];

fn default_action() -> String {
    "SCMP_ACT_ALLOW".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRule {
    pub names: Vec<String>,
    #[serde(default = "default_action")]
    pub action: String,
}

/// Docker-style seccomp profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeccompProfile {
    #[serde(rename = "defaultAction")]
    pub default_action: String,
    pub syscalls: Vec<SyscallRule>,
}

fn invalid(msg: &str) -> HardeningError {
    HardeningError::InvalidProfile(msg.to_string())
}

/// Parse and check a profile document.
pub fn validate_seccomp_profile(doc: &serde_json::Value) -> Result<SeccompProfile, HardeningError> {
    let obj = doc
        .as_object()
        .ok_or_else(|| invalid("profile must be an object"))?;
    let default = obj
        .get("defaultAction")
        .ok_or_else(|| invalid("missing defaultAction"))?;
    if !default.as_str().is_some_and(|a| ACTIONS.contains(&a)) {
        return Err(invalid("defaultAction invalid"));
    }
    let rules = obj
        .get("syscalls")
        .and_then(|s| s.as_array())
        .ok_or_else(|| invalid("syscalls must be a list"))?;
    for rule in rules {
        let rule = rule
            .as_object()
            .ok_or_else(|| invalid("syscall rule must be an object"))?;
        if let Some(action) = rule.get("action") {
            if !action.as_str().is_some_and(|a| ACTIONS.contains(&a)) {
                return Err(invalid("syscall action invalid"));
            }
        }
        let names = rule
            .get("names")
            .and_then(|n| n.as_array())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("syscall names must be a non-empty list"))?;
        if !names.iter().all(|n| n.as_str().is_some_and(|s| !s.is_empty())) {
            return Err(invalid("syscall name invalid"));
        }
    }
    serde_json::from_value(doc.clone()).map_err(|e| HardeningError::InvalidProfile(e.to_string()))
}

/// Add `names` to the profile's first allow rule, creating one if needed.
pub fn merge_allow_syscalls(mut profile: SeccompProfile, names: &[&str]) -> SeccompProfile {
    let index = match profile
        .syscalls
        .iter()
        .position(|r| r.action == "SCMP_ACT_ALLOW")
    {
        Some(i) => i,
        None => {
            profile.syscalls.push(SyscallRule {
                names: Vec::new(),
                action: default_action(),
            });
            profile.syscalls.len() - 1
        }
    };
    let rule = &mut profile.syscalls[index];
    rule.names
        .extend(names.iter().filter(|n| !n.is_empty()).map(|n| n.to_string()));
    rule.names.sort();
    rule.names.dedup();
    profile
}

/// Syscalls denied by `no_network`.
pub const NETWORK_SYSCALLS: &[&str] = &[
    "socket",
    "connect",
    "accept",
    "accept4",
    "bind",
    "listen",
    "sendto",
    "recvfrom",
    "sendmsg",
    "recvmsg",
    "getsockopt",
    "setsockopt",
    "getpeername",
    "getsockname",
    "shutdown",
];

/// What hardening actually took effect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardeningReport {
    pub scratch_dir: Option<PathBuf>,
    pub chrooted: bool,
    pub read_only_root: bool,
    pub seccomp_rules: usize,
    /// Best-effort steps that were skipped.
    pub skipped: Vec<String>,
}

pub trait OsHardening {
    fn apply(&self, config: &OsHardeningConfig) -> Result<HardeningReport, HardeningError>;
}

/// Hardening for the current platform.
pub fn platform() -> Box<dyn OsHardening> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxHardening)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NoopHardening)
    }
}

/// Fallback that applies nothing and refuses enforcement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHardening;

impl OsHardening for NoopHardening {
    fn apply(&self, config: &OsHardeningConfig) -> Result<HardeningReport, HardeningError> {
        if config.seccomp_enforce {
            return Err(HardeningError::Unsupported("seccomp"));
        }
        if config.fs_enforce {
            return Err(HardeningError::Unsupported("filesystem"));
        }
        Ok(HardeningReport {
            skipped: vec!["os hardening unavailable on this platform".to_string()],
            ..HardeningReport::default()
        })
    }
}

fn load_profile(config: &OsHardeningConfig) -> Result<Option<SeccompProfile>, HardeningError> {
    let Some(path) = &config.seccomp_profile else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path)?;
    let doc: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| HardeningError::InvalidProfile(e.to_string()))?;
    validate_seccomp_profile(&doc).map(Some)
}

fn scratch_dir(config: &OsHardeningConfig) -> Result<PathBuf, HardeningError> {
    match &config.tmp_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Ok(dir.clone())
        }
        None => Ok(tempfile::Builder::new()
            .prefix("cordon_")
            .tempdir()?
            .into_path()),
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    use super::*;

    const BPF_LD_W_ABS: u16 = 0x00 | 0x00 | 0x20;
    const BPF_JMP_JEQ_K: u16 = 0x05 | 0x10 | 0x00;
    const BPF_JMP_JGE_K: u16 = 0x05 | 0x30 | 0x00;
    const BPF_RET_K: u16 = 0x06 | 0x00;

    const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
    const SECCOMP_FILTER_FLAG_TSYNC: libc::c_ulong = 1;

    const RET_KILL_PROCESS: u32 = 0x8000_0000;
    const RET_KILL_THREAD: u32 = 0x0000_0000;
    const RET_TRAP: u32 = 0x0003_0000;
    const RET_ERRNO: u32 = 0x0005_0000;
    const RET_LOG: u32 = 0x7ffc_0000;
    const RET_ALLOW: u32 = 0x7fff_0000;

    #[cfg(target_arch = "x86_64")]
    const AUDIT_ARCH: u32 = 0xc000_003e;
    #[cfg(target_arch = "aarch64")]
    const AUDIT_ARCH: u32 = 0xc000_00b7;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct SockFilter {
        code: u16,
        jt: u8,
        jf: u8,
        k: u32,
    }

    #[repr(C)]
    struct SockFprog {
        len: libc::c_ushort,
        filter: *const SockFilter,
    }

    fn stmt(code: u16, k: u32) -> SockFilter {
        SockFilter {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    fn jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
        SockFilter { code, jt, jf, k }
    }

    fn os_error(call: &'static str) -> HardeningError {
        HardeningError::Os {
            call,
            source: std::io::Error::last_os_error(),
        }
    }

    fn action_code(action: &str, errno: i32) -> u32 {
        match action {
            "SCMP_ACT_ERRNO" => RET_ERRNO | (errno as u32 & 0xffff),
            "SCMP_ACT_KILL" | "SCMP_ACT_KILL_THREAD" => RET_KILL_THREAD,
            "SCMP_ACT_KILL_PROCESS" => RET_KILL_PROCESS,
            "SCMP_ACT_TRAP" => RET_TRAP,
            "SCMP_ACT_LOG" => RET_LOG,
            _ => RET_ALLOW,
        }
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn syscall_number(name: &str) -> Option<i64> {
        let nr = match name {
            "socket" => libc::SYS_socket,
            "socketpair" => libc::SYS_socketpair,
            "connect" => libc::SYS_connect,
            "accept" => libc::SYS_accept,
            "accept4" => libc::SYS_accept4,
            "bind" => libc::SYS_bind,
            "listen" => libc::SYS_listen,
            "sendto" => libc::SYS_sendto,
            "recvfrom" => libc::SYS_recvfrom,
            "sendmsg" => libc::SYS_sendmsg,
            "recvmsg" => libc::SYS_recvmsg,
            "getsockopt" => libc::SYS_getsockopt,
            "setsockopt" => libc::SYS_setsockopt,
            "getpeername" => libc::SYS_getpeername,
            "getsockname" => libc::SYS_getsockname,
            "shutdown" => libc::SYS_shutdown,
            "read" => libc::SYS_read,
            "write" => libc::SYS_write,
            "close" => libc::SYS_close,
            "openat" => libc::SYS_openat,
            "unlinkat" => libc::SYS_unlinkat,
            "mkdirat" => libc::SYS_mkdirat,
            "renameat" => libc::SYS_renameat,
            "fchmod" => libc::SYS_fchmod,
            "fchown" => libc::SYS_fchown,
            "truncate" => libc::SYS_truncate,
            "ftruncate" => libc::SYS_ftruncate,
            "getdents64" => libc::SYS_getdents64,
            "execve" => libc::SYS_execve,
            "execveat" => libc::SYS_execveat,
            "clone" => libc::SYS_clone,
            "kill" => libc::SYS_kill,
            "ptrace" => libc::SYS_ptrace,
            "mount" => libc::SYS_mount,
            "umount2" => libc::SYS_umount2,
            "chroot" => libc::SYS_chroot,
            "setuid" => libc::SYS_setuid,
            "setgid" => libc::SYS_setgid,
            #[cfg(target_arch = "x86_64")]
            "open" => libc::SYS_open,
            #[cfg(target_arch = "x86_64")]
            "creat" => libc::SYS_creat,
            #[cfg(target_arch = "x86_64")]
            "unlink" => libc::SYS_unlink,
            #[cfg(target_arch = "x86_64")]
            "mkdir" => libc::SYS_mkdir,
            #[cfg(target_arch = "x86_64")]
            "rmdir" => libc::SYS_rmdir,
            #[cfg(target_arch = "x86_64")]
            "rename" => libc::SYS_rename,
            #[cfg(target_arch = "x86_64")]
            "chmod" => libc::SYS_chmod,
            #[cfg(target_arch = "x86_64")]
            "chown" => libc::SYS_chown,
            #[cfg(target_arch = "x86_64")]
            "fork" => libc::SYS_fork,
            #[cfg(target_arch = "x86_64")]
            "vfork" => libc::SYS_vfork,
            _ => return None,
        };
        Some(nr as i64)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn syscall_number(_name: &str) -> Option<i64> {
        None
    }

    /// Compile `(syscall, action)` rules into a BPF program. Earlier rules
    /// win for a syscall listed twice.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn compile(rules: &[(i64, u32)], default: u32) -> Vec<SockFilter> {
        let mut prog = vec![
            stmt(BPF_LD_W_ABS, 4),
            jump(BPF_JMP_JEQ_K, AUDIT_ARCH, 1, 0),
            stmt(BPF_RET_K, RET_KILL_PROCESS),
            stmt(BPF_LD_W_ABS, 0),
        ];
        if cfg!(target_arch = "x86_64") {
            // x32 syscalls carry bit 30.
            prog.push(jump(BPF_JMP_JGE_K, 0x4000_0000, 0, 1));
            prog.push(stmt(BPF_RET_K, RET_KILL_PROCESS));
        }
        for (nr, action) in rules {
            prog.push(jump(BPF_JMP_JEQ_K, *nr as u32, 0, 1));
            prog.push(stmt(BPF_RET_K, *action));
        }
        prog.push(stmt(BPF_RET_K, default));
        prog
    }

    fn install(prog: &[SockFilter]) -> Result<(), HardeningError> {
        let len = libc::c_ushort::try_from(prog.len())
            .map_err(|_| invalid("filter has too many rules"))?;
        let fprog = SockFprog {
            len,
            filter: prog.as_ptr(),
        };
        // SAFETY: prctl with PR_SET_NO_NEW_PRIVS takes integer arguments only.
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(os_error("prctl(PR_SET_NO_NEW_PRIVS)"));
        }
        // SAFETY: fprog points at `prog`, which outlives the call; the kernel
        // copies the program before returning.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                SECCOMP_FILTER_FLAG_TSYNC,
                &fprog as *const SockFprog,
            )
        };
        if rc != 0 {
            return Err(os_error("seccomp(SECCOMP_SET_MODE_FILTER)"));
        }
        Ok(())
    }

    fn path_cstring(path: &std::path::Path) -> Result<CString, HardeningError> {
        CString::new(path.as_os_str().as_bytes()).map_err(|e| HardeningError::Io(e.into()))
    }

    fn confine_tmp(config: &OsHardeningConfig, report: &mut HardeningReport) -> Result<(), HardeningError> {
        let dir = scratch_dir(config)?;
        for var in ["TMPDIR", "TEMP", "TMP"] {
            std::env::set_var(var, &dir);
        }
        std::env::set_current_dir(&dir)?;
        report.scratch_dir = Some(dir.clone());
        if config.fs_chroot {
            let c_dir = path_cstring(&dir)?;
            // SAFETY: c_dir is a valid NUL-terminated path.
            let rc = unsafe { libc::chroot(c_dir.as_ptr()) };
            if rc == 0 {
                std::env::set_current_dir("/")?;
                report.chrooted = true;
            } else if config.fs_enforce {
                return Err(os_error("chroot"));
            } else {
                report.skipped.push(format!(
                    "chroot: {}",
                    std::io::Error::last_os_error()
                ));
            }
        }
        Ok(())
    }

    fn remount_read_only() -> Result<(), HardeningError> {
        // SAFETY: unshare takes a flag word only.
        if unsafe { libc::unshare(libc::CLONE_NEWNS) } != 0 {
            return Err(os_error("unshare(CLONE_NEWNS)"));
        }
        let root = c"/";
        // SAFETY: all pointers are valid NUL-terminated strings or null where
        // the kernel accepts null.
        let rc = unsafe {
            libc::mount(
                std::ptr::null(),
                root.as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(os_error("mount(MS_PRIVATE)"));
        }
        // SAFETY: as above.
        let rc = unsafe {
            libc::mount(
                root.as_ptr(),
                root.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(os_error("mount(MS_REMOUNT|MS_RDONLY)"));
        }
        Ok(())
    }

    pub struct LinuxHardening;

    impl OsHardening for LinuxHardening {
        fn apply(&self, config: &OsHardeningConfig) -> Result<HardeningReport, HardeningError> {
            let mut report = HardeningReport::default();
            // Read before any chroot hides the file.
            let profile = load_profile(config)?;

            match config.fs_mode {
                FsMode::None => {}
                FsMode::Tmp => confine_tmp(config, &mut report)?,
                FsMode::Ro => match remount_read_only() {
                    Ok(()) => report.read_only_root = true,
                    Err(e) if config.fs_enforce => return Err(e),
                    Err(e) => report.skipped.push(e.to_string()),
                },
            }

            if profile.is_none() && !config.no_network {
                return Ok(report);
            }

            let mut rules: Vec<(i64, u32)> = Vec::new();
            if config.no_network {
                for name in NETWORK_SYSCALLS {
                    if let Some(nr) = syscall_number(name) {
                        rules.push((nr, action_code("SCMP_ACT_ERRNO", libc::EACCES)));
                    }
                }
            }
            let default = match &profile {
                Some(p) => {
                    for rule in &p.syscalls {
                        let action = action_code(&rule.action, libc::EPERM);
                        for name in &rule.names {
                            match syscall_number(name) {
                                Some(nr) => rules.push((nr, action)),
                                None if config.seccomp_enforce => {
                                    return Err(HardeningError::UnknownSyscall(name.clone()))
                                }
                                None => report.skipped.push(format!("seccomp: unknown syscall '{name}'")),
                            }
                        }
                    }
                    action_code(&p.default_action, libc::EPERM)
                }
                None => RET_ALLOW,
            };

            #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
            {
                let prog = compile(&rules, default);
                match install(&prog) {
                    Ok(()) => report.seccomp_rules = rules.len(),
                    Err(e) if config.seccomp_enforce => return Err(e),
                    Err(e) => report.skipped.push(e.to_string()),
                }
            }
            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                let _ = default;
                if config.seccomp_enforce {
                    return Err(HardeningError::Unsupported("seccomp"));
                }
                report.skipped.push("seccomp: unsupported architecture".to_string());
            }
            Ok(report)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_syscall_table_covers_network_deny_list() {
            for name in NETWORK_SYSCALLS {
                assert!(syscall_number(name).is_some(), "{name}");
            }
            assert!(syscall_number("not_a_syscall").is_none());
        }

        #[test]
        fn test_compiled_program_shape() {
            let prog = compile(&[(41, RET_ERRNO | 13)], RET_ALLOW);
            let last = prog[prog.len() - 1];
            assert_eq!(last.code, BPF_RET_K);
            assert_eq!(last.k, RET_ALLOW);
            let jeq = prog[prog.len() - 3];
            assert_eq!((jeq.code, jeq.k, jeq.jt, jeq.jf), (BPF_JMP_JEQ_K, 41, 0, 1));
            assert_eq!(prog[1].k, AUDIT_ARCH);
        }
    }
}

/// Apply `config` with the platform implementation. `None` is a no-op.
pub fn apply(config: Option<&OsHardeningConfig>) -> Result<HardeningReport, HardeningError> {
    match config {
        Some(config) => platform().apply(config),
        None => Ok(HardeningReport::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_validation() {
        let ok = json!({
            "defaultAction": "SCMP_ACT_ERRNO",
            "syscalls": [{"names": ["read", "write"], "action": "SCMP_ACT_ALLOW"}]
        });
        let profile = validate_seccomp_profile(&ok).unwrap();
        assert_eq!(profile.default_action, "SCMP_ACT_ERRNO");

        for bad in [
            json!([]),
            json!({"syscalls": []}),
            json!({"defaultAction": "ALLOW", "syscalls": []}),
            json!({"defaultAction": "SCMP_ACT_ALLOW"}),
            json!({"defaultAction": "SCMP_ACT_ALLOW", "syscalls": [{"names": []}]}),
            json!({"defaultAction": "SCMP_ACT_ALLOW", "syscalls": [{"names": [""]}]}),
            json!({"defaultAction": "SCMP_ACT_ALLOW", "syscalls": [{"names": ["read"], "action": "NOPE"}]}),
        ] {
            match validate_seccomp_profile(&bad) {
                Err(HardeningError::InvalidProfile(_)) => {}
                other => panic!("expected InvalidProfile for {bad}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_merge_allow_syscalls() {
        let profile = validate_seccomp_profile(&json!({
            "defaultAction": "SCMP_ACT_ERRNO",
            "syscalls": [
                {"names": ["ptrace"], "action": "SCMP_ACT_KILL"},
                {"names": ["write"]}
            ]
        }))
        .unwrap();
        let merged = merge_allow_syscalls(profile, &["read", "write", ""]);
        assert_eq!(merged.syscalls[1].names, vec!["read", "write"]);

        let bare = SeccompProfile {
            default_action: "SCMP_ACT_ERRNO".into(),
            syscalls: vec![],
        };
        let merged = merge_allow_syscalls(bare, &["exit_group"]);
        assert_eq!(merged.syscalls.len(), 1);
        assert_eq!(merged.syscalls[0].action, "SCMP_ACT_ALLOW");
    }

    #[test]
    fn test_noop_rejects_enforcement() {
        let config = OsHardeningConfig {
            seccomp_enforce: true,
            ..OsHardeningConfig::default()
        };
        match NoopHardening.apply(&config) {
            Err(HardeningError::Unsupported(what)) => assert_eq!(what, "seccomp"),
            other => panic!("expected Unsupported, got {other:?}"),
        }
        let report = NoopHardening.apply(&OsHardeningConfig::default()).unwrap();
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn test_absent_config_is_noop() {
        assert_eq!(apply(None).unwrap(), HardeningReport::default());
    }
}
