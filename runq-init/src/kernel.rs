//! Kernel access used by the hardener.
//!
//! [`Kernel`] is the seam between the hardening sequence and the running
//! kernel. [`LinuxKernel`] writes `/proc/sys`, calls `setrlimit(2)` and
//! `mount(2)`; tests substitute an in-memory recorder.

use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use nix::sys::resource::{setrlimit, Resource};
use runq_protocol::{is_valid_sysctl_key, Rlimit};
use tracing::debug;

/// Operations the hardener performs against the guest kernel.
pub trait Kernel {
    /// Write `value` to the sysctl named `key` (dotted form).
    fn write_sysctl(&mut self, key: &str, value: &str) -> io::Result<()>;

    /// Set both limits of `resource` for the init process (inherited by children).
    fn set_rlimit(&mut self, resource: Resource, limit: Rlimit) -> io::Result<()>;

    /// Highest value the platform accepts for `resource`, when known.
    fn rlimit_ceiling(&self, resource: Resource) -> Option<u64>;

    /// Bind-remount `path` read-only.
    fn remount_readonly(&mut self, path: &Path) -> io::Result<()>;

    /// Hide the contents of `path` behind an empty source.
    fn mask_path(&mut self, path: &Path) -> io::Result<()>;
}

/// Map a dotted sysctl name onto its `/proc/sys` file.
///
/// `key` must pass [`is_valid_sysctl_key`]; other keys may resolve outside
/// `root`.
pub fn sysctl_path(root: &Path, key: &str) -> PathBuf {
    root.join(key.replace('.', "/"))
}

/// The running Linux kernel.
#[derive(Debug, Clone)]
pub struct LinuxKernel {
    proc_sys: PathBuf,
}

impl Default for LinuxKernel {
    fn default() -> Self {
        Self::new("/proc/sys")
    }
}

impl LinuxKernel {
    /// Create a kernel handle whose sysctls live under `proc_sys`.
    pub fn new<P: Into<PathBuf>>(proc_sys: P) -> Self {
        Self {
            proc_sys: proc_sys.into(),
        }
    }
}

impl Kernel for LinuxKernel {
    fn write_sysctl(&mut self, key: &str, value: &str) -> io::Result<()> {
        if !is_valid_sysctl_key(key) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid sysctl key {key:?}"),
            ));
        }
        let path = sysctl_path(&self.proc_sys, key);
        debug!(key, value, path = %path.display(), "writing sysctl");
        std::fs::write(&path, value)
    }

    #[allow(clippy::unnecessary_cast)]
    fn set_rlimit(&mut self, resource: Resource, limit: Rlimit) -> io::Result<()> {
        setrlimit(
            resource,
            limit.soft as libc::rlim_t,
            limit.hard as libc::rlim_t,
        )?;
        Ok(())
    }

    fn rlimit_ceiling(&self, resource: Resource) -> Option<u64> {
        match resource {
            Resource::RLIMIT_NOFILE => std::fs::read_to_string(self.proc_sys.join("fs/nr_open"))
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            _ => None,
        }
    }

    fn remount_readonly(&mut self, path: &Path) -> io::Result<()> {
        if !path.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "path does not exist"));
        }
        mount(
            Some(path),
            path,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;
        mount(
            Some(path),
            path,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )?;
        Ok(())
    }

    fn mask_path(&mut self, path: &Path) -> io::Result<()> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            mount(
                Some("tmpfs"),
                path,
                Some("tmpfs"),
                MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        } else {
            mount(
                Some(Path::new("/dev/null")),
                path,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )?;
        }
        Ok(())
    }
}
