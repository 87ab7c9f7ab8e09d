//! runq guest init
//!
//! Runs as PID 1 inside the VM. The init:
//! - reads control messages from the host over a single stream
//! - hardens the guest (sysctls, rlimits, restricted paths) before the
//!   container process starts
//! - starts and signals the supervised process, running signal hooks
//! - reaps zombie processes in the background

pub mod cmdline;
pub mod dispatch;
pub mod error;
pub mod harden;
pub mod kernel;
pub mod policy;
pub mod reaper;

pub use dispatch::{ControlLoop, Dispatcher, GuestActions, InitActions, LoopState};
pub use error::{InitError, Result};
pub use harden::{HardenError, HardenReport, HardenWarning, Hardener};
pub use kernel::{Kernel, LinuxKernel};
pub use policy::GuestPolicy;
pub use reaper::{ExitEvent, ExitWatch, Reaper, ReaperHandle};
