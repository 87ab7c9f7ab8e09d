//! Init settings read from the kernel command line.
//!
//! The host passes `runq.port=<vsock port>` and
//! `runq.reaper_interval=<seconds>`; anything missing or unparsable falls
//! back to the defaults.

use std::time::Duration;

use tracing::warn;

use crate::policy::REAPER_INTERVAL;

/// Default vsock port of the control channel.
pub const DEFAULT_PORT: u32 = 1;

/// How long a single control-channel read waits before re-checking for shutdown.
pub const DEFAULT_POLL: Duration = Duration::from_secs(1);

/// Settings for the init process itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitConfig {
    pub port: u32,
    pub reaper_interval: Duration,
    pub poll: Duration,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            reaper_interval: REAPER_INTERVAL,
            poll: DEFAULT_POLL,
        }
    }
}

impl InitConfig {
    /// Parse `runq.*` parameters out of a kernel command line.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        for param in cmdline.split_whitespace() {
            if let Some(port) = param.strip_prefix("runq.port=") {
                match port.parse() {
                    Ok(port) => config.port = port,
                    Err(_) => warn!(value = port, "ignoring invalid runq.port"),
                }
            } else if let Some(secs) = param.strip_prefix("runq.reaper_interval=") {
                match secs.parse::<u64>() {
                    Ok(secs) if secs > 0 => config.reaper_interval = Duration::from_secs(secs),
                    _ => warn!(value = secs, "ignoring invalid runq.reaper_interval"),
                }
            }
        }
        config
    }

    /// Read `/proc/cmdline`, falling back to defaults when it is unreadable.
    pub fn load() -> Self {
        match std::fs::read_to_string("/proc/cmdline") {
            Ok(cmdline) => Self::from_cmdline(&cmdline),
            Err(e) => {
                warn!(error = %e, "cannot read /proc/cmdline, using defaults");
                Self::default()
            }
        }
    }
}
