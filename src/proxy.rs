//! One host proxy session.
//!
//! A session owns the guest control channel for the lifetime of a VM: it
//! sends the boot descriptor and the entrypoint, forwards host signals and
//! keeps reading until the guest closes the channel.

use std::sync::Arc;
use std::time::Duration;

use runq_protocol::{Message, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{AsyncFrameReader, ChannelWriter};
use crate::config::ProxyConfig;
use crate::signal_proxy::{SignalProxy, SignalTable};
use crate::{Error, Result};

/// What a finished session observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Messages received from the guest.
    pub received: usize,
}

/// Drives the control channel of one VM.
pub struct ProxySession {
    config: ProxyConfig,
    table: Arc<SignalTable>,
    forward_signals: bool,
    read_timeout: Option<Duration>,
}

impl ProxySession {
    pub fn new(config: ProxyConfig) -> Self {
        let table = Arc::new(SignalTable::new(&config.signals));
        Self {
            config,
            table,
            forward_signals: true,
            read_timeout: None,
        }
    }

    /// Whether to subscribe to host signals (default: true)
    pub fn forward_signals(mut self, enable: bool) -> Self {
        self.forward_signals = enable;
        self
    }

    /// Fail when the guest is silent for longer than `timeout`
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Run the session over `stream` until the guest closes it.
    ///
    /// Nothing is written when the boot descriptor cannot be assembled.
    pub async fn run<S>(self, stream: S) -> Result<SessionSummary>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let vmdata = self.config.into_vmdata()?;
        let entrypoint = self
            .config
            .entrypoint
            .clone()
            .ok_or_else(|| Error::Config("An entrypoint is required".into()))?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = ChannelWriter::spawn(write_half, self.config.queue_depth);

        info!(
            mem_mib = vmdata.mem_mib,
            disks = vmdata.disks.len(),
            entrypoint = %entrypoint.path,
            "starting guest"
        );
        writer.send(Message::Vmdata(Box::new(vmdata))).await?;
        writer.send(Message::Command(entrypoint)).await?;

        let mut signal_proxy = SignalProxy::new(Arc::clone(&self.table), writer.clone());
        if self.forward_signals {
            signal_proxy.start()?;
        }

        let result = self.read_until_closed(read_half).await;

        signal_proxy.shutdown();
        drop(signal_proxy);
        drop(writer);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "control channel writer failed"),
            Err(e) => warn!(error = %e, "control channel writer panicked"),
        }

        result
    }

    async fn read_until_closed<R>(&self, read_half: R) -> Result<SessionSummary>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = AsyncFrameReader::new(read_half);
        let mut summary = SessionSummary::default();
        loop {
            let deadline = self.read_timeout.map(|t| Instant::now() + t);
            match reader.read_message(deadline).await {
                Ok(Some(message)) => {
                    debug!(kind = %message.kind(), "message from guest");
                    summary.received += 1;
                }
                Ok(None) => {
                    info!(received = summary.received, "guest closed the control channel");
                    return Ok(summary);
                }
                Err(ProtocolError::Timeout) => {
                    return Err(Error::Timeout(format!(
                        "no message from guest within {}",
                        humantime::format_duration(self.read_timeout.unwrap_or_default())
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
