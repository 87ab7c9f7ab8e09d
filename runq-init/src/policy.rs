//! Guest hardening policy.
//!
//! All tables the init consults at boot live in one immutable [`GuestPolicy`]
//! value, built once in `main` and shared behind an `Arc`. Tests construct
//! their own policies instead of mutating process-wide state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::resource::Resource;
use runq_protocol::{Rlimit, SignalKind, RLIM_INFINITY, SIGUSR1_HOOK, SIGUSR2_HOOK};

use crate::harden::HardenError;

/// Default interval between reaper runs.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Tables driving guest hardening and signal hooks.
#[derive(Debug, Clone)]
pub struct GuestPolicy {
    /// Sysctls applied unless the boot spec requests the key itself.
    pub sysctl_default: BTreeMap<String, String>,
    /// Sysctls applied unconditionally, after everything else.
    pub sysctl_override: BTreeMap<String, String>,
    /// Runtime-mandated rlimit floors, keyed by OCI name.
    pub rlimit_floors: BTreeMap<String, Rlimit>,
    /// OCI rlimit name → kernel resource.
    pub rlimit_resources: BTreeMap<String, Resource>,
    /// Paths remounted read-only.
    pub readonly_paths: Vec<PathBuf>,
    /// Paths covered with an empty source.
    pub masked_paths: Vec<PathBuf>,
    /// Signals answered by running a guest-local hook.
    pub sig_commands: BTreeMap<SignalKind, PathBuf>,
    /// Reaper cadence.
    pub reaper_interval: Duration,
}

fn string_map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Default for GuestPolicy {
    fn default() -> Self {
        let sysctl_default = string_map(&[
            ("fs.file-max", "102400"),
            ("kernel.panic_on_oops", "1"),
            ("kernel.threads-max", "100000"),
            ("net.ipv6.conf.all.disable_ipv6", "1"),
            ("net.ipv6.conf.default.disable_ipv6", "1"),
            ("vm.overcommit_memory", "0"),
            ("vm.panic_on_oom", "0"),
        ]);

        let sysctl_override = string_map(&[("kernel.kexec_load_disabled", "1")]);

        let rlimit_floors = [
            ("RLIMIT_NOFILE", Rlimit::new(65536, 65536)),
            ("RLIMIT_NPROC", Rlimit::new(RLIM_INFINITY, RLIM_INFINITY)),
            ("RLIMIT_SIGPENDING", Rlimit::new(65536, 65536)),
        ]
        .into_iter()
        .map(|(name, limit)| (name.to_string(), limit))
        .collect();

        let rlimit_resources = [
            ("RLIMIT_AS", Resource::RLIMIT_AS),
            ("RLIMIT_CORE", Resource::RLIMIT_CORE),
            ("RLIMIT_CPU", Resource::RLIMIT_CPU),
            ("RLIMIT_DATA", Resource::RLIMIT_DATA),
            ("RLIMIT_FSIZE", Resource::RLIMIT_FSIZE),
            ("RLIMIT_LOCKS", Resource::RLIMIT_LOCKS),
            ("RLIMIT_MEMLOCK", Resource::RLIMIT_MEMLOCK),
            ("RLIMIT_MSGQUEUE", Resource::RLIMIT_MSGQUEUE),
            ("RLIMIT_NICE", Resource::RLIMIT_NICE),
            ("RLIMIT_NOFILE", Resource::RLIMIT_NOFILE),
            ("RLIMIT_NPROC", Resource::RLIMIT_NPROC),
            ("RLIMIT_RSS", Resource::RLIMIT_RSS),
            ("RLIMIT_RTPRIO", Resource::RLIMIT_RTPRIO),
            ("RLIMIT_RTTIME", Resource::RLIMIT_RTTIME),
            ("RLIMIT_SIGPENDING", Resource::RLIMIT_SIGPENDING),
            ("RLIMIT_STACK", Resource::RLIMIT_STACK),
        ]
        .into_iter()
        .map(|(name, resource)| (name.to_string(), resource))
        .collect();

        let readonly_paths = ["/proc/bus", "/proc/sysrq-trigger"]
            .into_iter()
            .map(PathBuf::from)
            .collect();

        let masked_paths = [
            "/proc/kcore",
            "/proc/latency_stats",
            "/proc/timer_list",
            "/proc/timer_stats",
            "/proc/sched_debug",
            "/proc/scsi",
            "/sys/firmware",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect();

        let sig_commands = [
            (SignalKind::Usr1, PathBuf::from(SIGUSR1_HOOK)),
            (SignalKind::Usr2, PathBuf::from(SIGUSR2_HOOK)),
        ]
        .into_iter()
        .collect();

        Self {
            sysctl_default,
            sysctl_override,
            rlimit_floors,
            rlimit_resources,
            readonly_paths,
            masked_paths,
            sig_commands,
            reaper_interval: REAPER_INTERVAL,
        }
    }
}

impl GuestPolicy {
    /// Resolve an OCI rlimit name to its kernel resource.
    pub fn resolve_rlimit(&self, name: &str) -> Result<Resource, HardenError> {
        self.rlimit_resources
            .get(name)
            .copied()
            .ok_or_else(|| HardenError::UnknownRlimit(name.to_string()))
    }

    /// Set the reaper cadence
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Add or replace an override sysctl
    pub fn sysctl_override<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.sysctl_override.insert(key.into(), value.into());
        self
    }

    /// Add or replace an rlimit floor
    pub fn rlimit_floor<S: Into<String>>(mut self, name: S, limit: Rlimit) -> Self {
        self.rlimit_floors.insert(name.into(), limit);
        self
    }

    /// Replace both path restriction sets
    pub fn restricted_paths(mut self, readonly: Vec<PathBuf>, masked: Vec<PathBuf>) -> Self {
        self.readonly_paths = readonly;
        self.masked_paths = masked;
        self
    }
}
