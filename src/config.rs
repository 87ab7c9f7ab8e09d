//! Configuration for a proxied VM
//!
//! A [`ProxyConfig`] is built in code with the builder methods or read from a
//! JSON boot spec file. [`ProxyConfig::into_vmdata`] turns it into the boot
//! descriptor sent to the guest.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use runq_protocol::{
    is_valid_sysctl_key, Command, DiskDescriptor, Disktype, Rlimit, SignalKind, Vmdata,
    KERNEL_PARAMETERS, MIN_MEM_MIB,
};
use serde::{Deserialize, Deserializer};
use tracing::info;

use crate::disk;
use crate::{Error, Result};

/// Default vsock port the guest init listens on.
pub const DEFAULT_VSOCK_PORT: u32 = 1;

/// Depth of the single writer queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// A disk requested by the boot spec, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiskSpec {
    /// Stable identifier (used as the virtio serial)
    pub id: String,
    /// Host path of the device or image
    pub path: PathBuf,
    /// Explicit backend type, skipping detection for regular files
    #[serde(default)]
    pub format: Option<Disktype>,
    /// Mount point inside the guest
    #[serde(default)]
    pub mount: Option<String>,
}

impl DiskSpec {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(id: S, path: P) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            format: None,
            mount: None,
        }
    }

    /// Set an explicit format hint
    pub fn format(mut self, format: Disktype) -> Self {
        self.format = Some(format);
        self
    }

    /// Set the guest mount point
    pub fn mount<S: Into<String>>(mut self, mount: S) -> Self {
        self.mount = Some(mount.into());
        self
    }

    /// Classify the backend, refusing disks whose type cannot be determined.
    pub fn classify(&self) -> Result<DiskDescriptor> {
        match disk::classify(&self.path, self.format) {
            Disktype::Unknown => Err(Error::UnknownDisk {
                id: self.id.clone(),
                path: self.path.clone(),
            }),
            disktype => Ok(DiskDescriptor {
                id: self.id.clone(),
                path: self.path.display().to_string(),
                disktype,
                mount: self.mount.clone(),
            }),
        }
    }
}

/// Configuration for proxying one VM
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Guest memory in megabytes (default: 128)
    pub memory_mb: u32,
    /// Additional kernel command line arguments
    pub extra_cmdline: Vec<String>,
    /// Vsock port the guest init listens on
    pub vsock_port: u32,
    /// Guest reaper cadence (humantime string in the boot spec)
    #[serde(deserialize_with = "humantime_opt")]
    pub reaper_interval: Option<Duration>,
    /// Requested sysctls
    pub sysctls: BTreeMap<String, String>,
    /// Requested rlimits by OCI name
    pub rlimits: BTreeMap<String, Rlimit>,
    /// Extra read-only paths
    pub readonly_paths: Vec<String>,
    /// Extra masked paths
    pub masked_paths: Vec<String>,
    /// Disks to attach
    pub disks: Vec<DiskSpec>,
    /// Guest hostname
    pub hostname: Option<String>,
    /// Container entrypoint
    pub entrypoint: Option<Command>,
    /// Signals forwarded from the host
    pub signals: Vec<SignalKind>,
    /// Depth of the single writer queue
    pub queue_depth: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            extra_cmdline: Vec::new(),
            vsock_port: DEFAULT_VSOCK_PORT,
            reaper_interval: None,
            sysctls: BTreeMap::new(),
            rlimits: BTreeMap::new(),
            readonly_paths: Vec::new(),
            masked_paths: Vec::new(),
            disks: Vec::new(),
            hostname: None,
            entrypoint: None,
            signals: SignalKind::ALL.to_vec(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

fn humantime_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

impl ProxyConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON boot spec file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read boot spec {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        info!(path = %path.display(), disks = config.disks.len(), "loaded boot spec");
        Ok(config)
    }

    /// Set the memory size in megabytes
    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Add extra kernel command line arguments
    pub fn extra_cmdline<S: Into<String>>(mut self, args: S) -> Self {
        self.extra_cmdline.push(args.into());
        self
    }

    /// Set the guest vsock port
    pub fn vsock_port(mut self, port: u32) -> Self {
        self.vsock_port = port;
        self
    }

    /// Set the guest reaper cadence
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = Some(interval);
        self
    }

    /// Request a sysctl
    pub fn sysctl<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.sysctls.insert(key.into(), value.into());
        self
    }

    /// Request an rlimit by OCI name
    pub fn rlimit<S: Into<String>>(mut self, name: S, limit: Rlimit) -> Self {
        self.rlimits.insert(name.into(), limit);
        self
    }

    /// Add a path to remount read-only
    pub fn readonly_path<S: Into<String>>(mut self, path: S) -> Self {
        self.readonly_paths.push(path.into());
        self
    }

    /// Add a path to mask
    pub fn masked_path<S: Into<String>>(mut self, path: S) -> Self {
        self.masked_paths.push(path.into());
        self
    }

    /// Attach a disk
    pub fn disk(mut self, disk: DiskSpec) -> Self {
        self.disks.push(disk);
        self
    }

    /// Set the guest hostname
    pub fn hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set the container entrypoint
    pub fn entrypoint(mut self, command: Command) -> Self {
        self.entrypoint = Some(command);
        self
    }

    /// Replace the forwarded signal set
    pub fn signals(mut self, signals: Vec<SignalKind>) -> Self {
        self.signals = signals;
        self
    }

    /// Set the writer queue depth
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Build the kernel command line string
    pub fn kernel_cmdline(&self) -> String {
        let mut cmdline = vec![
            KERNEL_PARAMETERS.to_string(),
            format!("runq.port={}", self.vsock_port),
        ];
        if let Some(interval) = self.reaper_interval {
            cmdline.push(format!("runq.reaper_interval={}", interval.as_secs().max(1)));
        }
        cmdline.extend(self.extra_cmdline.iter().cloned());
        cmdline.join(" ")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.memory_mb < MIN_MEM_MIB {
            return Err(Error::Config(format!(
                "Memory must be at least {}MB",
                MIN_MEM_MIB
            )));
        }

        match &self.entrypoint {
            Some(command) if !command.path.is_empty() => {}
            _ => return Err(Error::Config("An entrypoint is required".into())),
        }

        for (name, limit) in &self.rlimits {
            if !limit.is_valid() {
                return Err(Error::Config(format!(
                    "rlimit {} has soft {} above hard {}",
                    name, limit.soft, limit.hard
                )));
            }
        }

        if let Some(key) = self.sysctls.keys().find(|k| !is_valid_sysctl_key(k)) {
            return Err(Error::Config(format!("Invalid sysctl key: {key:?}")));
        }

        let mut ids = HashSet::new();
        for disk in &self.disks {
            if disk.id.is_empty() {
                return Err(Error::Config(format!(
                    "Disk at {} has no id",
                    disk.path.display()
                )));
            }
            if !ids.insert(disk.id.as_str()) {
                return Err(Error::Config(format!("Duplicate disk id: {}", disk.id)));
            }
        }

        if self.queue_depth == 0 {
            return Err(Error::Config("Queue depth must be at least 1".into()));
        }

        Ok(())
    }

    /// Validate, classify every disk and assemble the boot descriptor.
    pub fn into_vmdata(&self) -> Result<Vmdata> {
        self.validate()?;

        let disks = self
            .disks
            .iter()
            .map(DiskSpec::classify)
            .collect::<Result<Vec<_>>>()?;

        Ok(Vmdata {
            mem_mib: self.memory_mb,
            kernel_params: self.kernel_cmdline(),
            sysctls: self.sysctls.clone(),
            rlimits: self.rlimits.clone(),
            readonly_paths: self.readonly_paths.clone(),
            masked_paths: self.masked_paths.clone(),
            disks,
            hostname: self.hostname.clone(),
        })
    }
}
