//! Boot-time guest hardening.
//!
//! [`Hardener::harden`] runs once, before the supervised process starts:
//!
//! 1. default sysctls the boot spec does not set itself,
//! 2. sysctls requested by the boot spec,
//! 3. override sysctls, unconditionally,
//! 4. rlimit floors, then requested rlimits merged against them,
//! 5. read-only and masked paths.
//!
//! Default and requested sysctl failures and path failures are collected as
//! warnings. An unknown rlimit name, an `setrlimit` failure, or a failed
//! override write aborts boot.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::resource::Resource;
use runq_protocol::{Rlimit, Vmdata};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::kernel::Kernel;
use crate::policy::GuestPolicy;

/// Fatal hardening errors. Boot must not continue after any of these.
#[derive(Debug, Error)]
pub enum HardenError {
    #[error("unknown rlimit {0}")]
    UnknownRlimit(String),

    #[error("invalid rlimit {name}: soft {soft} exceeds hard {hard}")]
    InvalidRlimit { name: String, soft: u64, hard: u64 },

    #[error("failed to enforce sysctl {key}={value}: {source}")]
    OverrideSysctl {
        key: String,
        value: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to set {name} to {soft}/{hard}: {source}")]
    Rlimit {
        name: String,
        soft: u64,
        hard: u64,
        #[source]
        source: io::Error,
    },
}

/// A non-fatal hardening failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardenWarning {
    Sysctl {
        key: String,
        value: String,
        reason: String,
    },
    ReadonlyPath { path: PathBuf, reason: String },
    MaskedPath { path: PathBuf, reason: String },
}

impl fmt::Display for HardenWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardenWarning::Sysctl { key, value, reason } => {
                write!(f, "sysctl {}={}: {}", key, value, reason)
            }
            HardenWarning::ReadonlyPath { path, reason } => {
                write!(f, "read-only {}: {}", path.display(), reason)
            }
            HardenWarning::MaskedPath { path, reason } => {
                write!(f, "mask {}: {}", path.display(), reason)
            }
        }
    }
}

/// Outcome of a successful hardening run.
#[derive(Debug, Clone, Default)]
pub struct HardenReport {
    /// Sysctl values successfully written, last write wins.
    pub sysctls: BTreeMap<String, String>,
    /// Rlimits applied, by OCI name.
    pub rlimits: BTreeMap<String, Rlimit>,
    /// Failures that did not abort boot.
    pub warnings: Vec<HardenWarning>,
}

/// Merge a requested rlimit with the runtime floor for the same resource.
///
/// A request whose hard limit is below the floor's hard limit would loosen a
/// mandatory floor, so the floor is kept as a whole. Otherwise the request
/// stands, including a soft limit below the floor's soft value.
///
/// The default `RLIMIT_NPROC` floor is unlimited, so every finite NPROC
/// request is replaced by unlimited. Guests cannot cap their process count
/// through the boot descriptor.
pub fn effective_rlimit(floor: Option<Rlimit>, requested: Rlimit) -> Rlimit {
    match floor {
        Some(floor) if requested.hard < floor.hard => floor,
        _ => requested,
    }
}

/// Clamp a limit to the platform ceiling, keeping `soft <= hard`.
pub fn clamp_to_ceiling(limit: Rlimit, ceiling: Option<u64>) -> Rlimit {
    match ceiling {
        Some(ceiling) => {
            let hard = limit.hard.min(ceiling);
            Rlimit::new(limit.soft.min(hard), hard)
        }
        None => limit,
    }
}

/// Applies a [`GuestPolicy`] and a boot descriptor to the guest kernel.
pub struct Hardener<K> {
    policy: Arc<GuestPolicy>,
    kernel: K,
}

impl<K: Kernel> Hardener<K> {
    pub fn new(policy: Arc<GuestPolicy>, kernel: K) -> Self {
        Self { policy, kernel }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Run the full hardening sequence.
    pub fn harden(&mut self, vmdata: &Vmdata) -> Result<HardenReport, HardenError> {
        info!(
            sysctls = vmdata.sysctls.len(),
            rlimits = vmdata.rlimits.len(),
            "hardening guest"
        );
        let mut report = HardenReport::default();

        self.apply_sysctls(vmdata, &mut report)?;
        self.apply_rlimits(vmdata, &mut report)?;
        self.restrict_paths(vmdata, &mut report);

        if report.warnings.is_empty() {
            info!("guest hardening complete");
        } else {
            warn!(
                warnings = report.warnings.len(),
                "guest hardening complete with warnings"
            );
        }
        Ok(report)
    }

    fn apply_sysctls(
        &mut self,
        vmdata: &Vmdata,
        report: &mut HardenReport,
    ) -> Result<(), HardenError> {
        let policy = Arc::clone(&self.policy);

        for (key, value) in &policy.sysctl_default {
            if vmdata.sysctls.contains_key(key) {
                debug!(key = %key, "default sysctl superseded by boot spec");
                continue;
            }
            self.write_sysctl_soft(key, value, report);
        }

        for (key, value) in &vmdata.sysctls {
            self.write_sysctl_soft(key, value, report);
        }

        // Overrides go last and abort on the first failure.
        for (key, value) in &policy.sysctl_override {
            if let Err(source) = self.kernel.write_sysctl(key, value) {
                error!(key = %key, value = %value, error = %source, "override sysctl failed");
                return Err(HardenError::OverrideSysctl {
                    key: key.clone(),
                    value: value.clone(),
                    source,
                });
            }
            report.sysctls.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn write_sysctl_soft(&mut self, key: &str, value: &str, report: &mut HardenReport) {
        match self.kernel.write_sysctl(key, value) {
            Ok(()) => {
                report.sysctls.insert(key.to_string(), value.to_string());
            }
            Err(e) => {
                warn!(key, value, error = %e, "sysctl write failed");
                report.warnings.push(HardenWarning::Sysctl {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn apply_rlimits(
        &mut self,
        vmdata: &Vmdata,
        report: &mut HardenReport,
    ) -> Result<(), HardenError> {
        let policy = Arc::clone(&self.policy);

        // Resolve and validate every request before touching the kernel.
        let mut requested = Vec::with_capacity(vmdata.rlimits.len());
        for (name, limit) in &vmdata.rlimits {
            let resource = policy.resolve_rlimit(name)?;
            if !limit.is_valid() {
                return Err(HardenError::InvalidRlimit {
                    name: name.clone(),
                    soft: limit.soft,
                    hard: limit.hard,
                });
            }
            requested.push((name, resource, *limit));
        }

        for (name, floor) in &policy.rlimit_floors {
            let resource = policy.resolve_rlimit(name)?;
            self.apply_rlimit(name, resource, *floor, report)?;
        }

        for (name, resource, limit) in requested {
            let floor = policy.rlimit_floors.get(name).copied();
            let effective = effective_rlimit(floor, limit);
            if effective != limit {
                info!(
                    name = %name,
                    requested_soft = limit.soft,
                    requested_hard = limit.hard,
                    "rlimit request below runtime floor, keeping floor"
                );
            }
            self.apply_rlimit(name, resource, effective, report)?;
        }
        Ok(())
    }

    fn apply_rlimit(
        &mut self,
        name: &str,
        resource: Resource,
        limit: Rlimit,
        report: &mut HardenReport,
    ) -> Result<(), HardenError> {
        let limit = clamp_to_ceiling(limit, self.kernel.rlimit_ceiling(resource));
        debug!(name, soft = limit.soft, hard = limit.hard, "setting rlimit");
        self.kernel
            .set_rlimit(resource, limit)
            .map_err(|source| HardenError::Rlimit {
                name: name.to_string(),
                soft: limit.soft,
                hard: limit.hard,
                source,
            })?;
        report.rlimits.insert(name.to_string(), limit);
        Ok(())
    }

    fn restrict_paths(&mut self, vmdata: &Vmdata, report: &mut HardenReport) {
        let policy = Arc::clone(&self.policy);

        let readonly = policy
            .readonly_paths
            .iter()
            .cloned()
            .chain(vmdata.readonly_paths.iter().map(PathBuf::from));
        for path in readonly {
            if let Err(e) = self.kernel.remount_readonly(&path) {
                warn!(path = %path.display(), error = %e, "read-only remount failed");
                report.warnings.push(HardenWarning::ReadonlyPath {
                    path,
                    reason: e.to_string(),
                });
            }
        }

        let masked = policy
            .masked_paths
            .iter()
            .cloned()
            .chain(vmdata.masked_paths.iter().map(PathBuf::from));
        for path in masked {
            if let Err(e) = self.kernel.mask_path(&path) {
                warn!(path = %path.display(), error = %e, "masking failed");
                report.warnings.push(HardenWarning::MaskedPath {
                    path,
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runq_protocol::RLIM_INFINITY;

    #[test]
    fn test_stricter_soft_wins() {
        let floor = Rlimit::new(65536, 65536);
        assert_eq!(
            effective_rlimit(Some(floor), Rlimit::new(10, 65536)),
            Rlimit::new(10, 65536)
        );
        assert_eq!(
            effective_rlimit(Some(floor), Rlimit::new(10, RLIM_INFINITY)),
            Rlimit::new(10, RLIM_INFINITY)
        );
    }

    #[test]
    fn test_request_above_floor_applies_as_is() {
        let floor = Rlimit::new(65536, 65536);
        let request = Rlimit::new(1_000_000, 1_000_000);
        assert_eq!(effective_rlimit(Some(floor), request), request);
    }

    #[test]
    fn test_floor_dominates_lowered_hard() {
        let floor = Rlimit::new(65536, 65536);
        assert_eq!(effective_rlimit(Some(floor), Rlimit::new(100, 200)), floor);
    }

    #[test]
    fn test_unlimited_nproc_floor_overrides_finite_request() {
        let floors = GuestPolicy::default().rlimit_floors;
        let floor = floors.get("RLIMIT_NPROC").copied();
        assert_eq!(floor, Some(Rlimit::unlimited()));
        assert_eq!(
            effective_rlimit(floor, Rlimit::new(4096, 4096)),
            Rlimit::unlimited()
        );
        assert_eq!(
            effective_rlimit(floor, Rlimit::new(1, RLIM_INFINITY)),
            Rlimit::new(1, RLIM_INFINITY)
        );
    }

    #[test]
    fn test_no_floor_keeps_request() {
        let request = Rlimit::new(0, 0);
        assert_eq!(effective_rlimit(None, request), request);
    }

    #[test]
    fn test_clamp_to_ceiling() {
        let limit = Rlimit::new(2_000_000, 4_000_000);
        assert_eq!(
            clamp_to_ceiling(limit, Some(1_048_576)),
            Rlimit::new(1_048_576, 1_048_576)
        );
        assert_eq!(clamp_to_ceiling(limit, None), limit);
        assert_eq!(
            clamp_to_ceiling(Rlimit::new(10, 65536), Some(1_048_576)),
            Rlimit::new(10, 65536)
        );
    }

    #[test]
    fn test_warning_display() {
        let w = HardenWarning::MaskedPath {
            path: PathBuf::from("/proc/kcore"),
            reason: "No such file or directory".into(),
        };
        assert_eq!(w.to_string(), "mask /proc/kcore: No such file or directory");
    }
}
