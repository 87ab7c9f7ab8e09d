//! runq: host proxy for micro-VM containers
//!
//! Each container runs as a lightweight VM whose init talks to a host proxy
//! over a single control channel. This crate is the host side:
//!
//! - **Boot descriptor**: [`ProxyConfig`] validates the boot spec and
//!   classifies every disk backend ([`disk::classify`]) into a
//!   [`runq_protocol::Vmdata`].
//! - **Single writer**: [`ChannelWriter`] owns the write half; every frame
//!   goes through its queue.
//! - **Signal forwarding**: [`SignalProxy`] turns host signals into Signal
//!   messages.
//! - **Session**: [`ProxySession`] ties the above together for one VM.
//!
//! # Example
//!
//! ```no_run
//! use runq::{ProxyConfig, ProxySession};
//! use runq_protocol::Command;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::new()
//!         .memory_mb(256)
//!         .entrypoint(Command::new("/bin/sh").arg("-c").arg("sleep 60"));
//!
//!     let stream = tokio::net::UnixStream::connect("/run/runq/vm.sock").await?;
//!     let summary = ProxySession::new(config).run(stream).await?;
//!     println!("guest sent {} messages", summary.received);
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod disk;
pub mod error;
pub mod proxy;
pub mod signal_proxy;

pub use channel::{AsyncFrameReader, ChannelWriter};
pub use config::{DiskSpec, ProxyConfig};
pub use error::{Error, Result};
pub use proxy::{ProxySession, SessionSummary};
pub use signal_proxy::{ProxyState, SignalProxy, SignalTable};
