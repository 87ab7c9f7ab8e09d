//! Host side of the control channel.
//!
//! All writes to the guest go through one [`ChannelWriter`]: a tokio task owns
//! the write half and drains an mpsc queue, so frames from the proxy session
//! and the signal listener never interleave. [`AsyncFrameReader`] is the
//! async counterpart of [`runq_protocol::FrameReader`].

use runq_protocol::{Message, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Cloneable handle to the single writer task.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::Sender<Message>,
}

impl ChannelWriter {
    /// Spawn the writer task on the current runtime.
    ///
    /// The task ends when every handle is dropped or a write fails; its
    /// result carries the write error, if any.
    pub fn spawn<W>(writer: W, depth: usize) -> (Self, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let task = tokio::spawn(write_loop(writer, rx));
        (Self { tx }, task)
    }

    /// Queue a message, waiting for room in the queue.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, message: Message) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => Error::ChannelFull,
            TrySendError::Closed(_) => Error::ChannelClosed,
        })
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Message>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %message.kind(), error = %e, "dropping unencodable message");
                continue;
            }
        };
        writer.write_all(&frame).await?;
        writer.flush().await?;
        debug!(kind = %message.kind(), bytes = frame.len(), "control message sent");
    }
    Ok(())
}

/// Buffered frame decoder over an async byte stream.
pub struct AsyncFrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> AsyncFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the peer closes the stream on a frame boundary
    /// and [`ProtocolError::Timeout`] once `deadline` passes. Partial frames
    /// stay buffered across timeouts.
    pub async fn read_message(
        &mut self,
        deadline: Option<Instant>,
    ) -> std::result::Result<Option<Message>, ProtocolError> {
        let mut chunk = [0u8; 4096];
        loop {
            match Message::decode(&self.buf) {
                Ok((message, used)) => {
                    self.buf.drain(..used);
                    return Ok(Some(message));
                }
                Err(e) if e.is_incomplete() => {}
                Err(e) => return Err(e),
            }

            let read = self.inner.read(&mut chunk);
            let n = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, read)
                    .await
                    .map_err(|_| ProtocolError::Timeout)??,
                None => read.await?,
            };

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::ConnectionClosed(self.buf.len()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runq_protocol::{Command, SignalKind};
    use std::time::Duration;

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let first = Message::Command(Command::new("/bin/app"));
        let second = Message::Signal(SignalKind::Term);
        let mock = tokio_test::io::Builder::new()
            .write(&first.encode().unwrap())
            .write(&second.encode().unwrap())
            .build();

        let (writer, task) = ChannelWriter::spawn(mock, 4);
        writer.send(first).await.unwrap();
        writer.try_send(second).unwrap();
        drop(writer);

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_writer_rejects_messages() {
        let (writer, task) = ChannelWriter::spawn(tokio::io::sink(), 1);
        task.abort();
        let _ = task.await;

        assert!(writer.is_closed());
        assert!(matches!(
            writer.try_send(Message::Signal(SignalKind::Int)),
            Err(Error::ChannelClosed)
        ));
        assert!(matches!(
            writer.send(Message::Signal(SignalKind::Int)).await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        // Nothing reads the duplex, so the writer task stalls after filling it.
        let (client, _server) = tokio::io::duplex(8);
        let (writer, _task) = ChannelWriter::spawn(client, 1);

        let mut full = false;
        for _ in 0..16 {
            if let Err(Error::ChannelFull) = writer.try_send(Message::Signal(SignalKind::Hup)) {
                full = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(full);
    }

    #[tokio::test]
    async fn test_reader_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(16);
        let (writer, task) = ChannelWriter::spawn(client, 4);
        let mut reader = AsyncFrameReader::new(server);

        writer
            .send(Message::Command(Command::new("/bin/app").arg("-v")))
            .await
            .unwrap();
        writer.send(Message::Signal(SignalKind::Usr1)).await.unwrap();
        drop(writer);

        assert_eq!(
            reader.read_message(None).await.unwrap(),
            Some(Message::Command(Command::new("/bin/app").arg("-v")))
        );
        assert_eq!(
            reader.read_message(None).await.unwrap(),
            Some(Message::Signal(SignalKind::Usr1))
        );
        task.await.unwrap().unwrap();
        assert_eq!(reader.read_message(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_deadline() {
        let (_client, server) = tokio::io::duplex(16);
        let mut reader = AsyncFrameReader::new(server);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(
            reader.read_message(Some(deadline)).await,
            Err(ProtocolError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_reader_eof_mid_frame() {
        let (mut client, server) = tokio::io::duplex(16);
        client.write_all(&[2, 0, 0, 0, 2, b'1']).await.unwrap();
        drop(client);

        let mut reader = AsyncFrameReader::new(server);
        assert!(matches!(
            reader.read_message(None).await,
            Err(ProtocolError::ConnectionClosed(6))
        ));
    }
}
