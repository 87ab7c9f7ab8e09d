//! Shared wire-format types for runq host ↔ guest control messages.
//!
//! This crate is the single source of truth for the control protocol spoken
//! between the host proxy (`runq`) and the guest init (`runq-init`).
//!
//! ## Wire Format
//!
//! Every message is framed as:
//!
//! ```text
//! ┌───────────┬──────────────┬───────────────────┐
//! │ kind (1B) │ length (4 B) │ payload (N bytes) │
//! └───────────┴──────────────┴───────────────────┘
//! ```
//!
//! - **kind**: one byte mapping to [`MsgKind`] (`1` Command, `2` Signal, `3` Vmdata).
//! - **length**: `u32` big-endian, size of the payload only (not including the 5-byte header).
//! - **payload**: JSON-encoded body. A Signal payload is the bare signal number.
//!
//! The channel is a byte stream, so [`Message::decode`] reports
//! [`ProtocolError::TruncatedMessage`] when a frame is not complete yet.
//! Callers keep the bytes and retry once more data has arrived;
//! [`FrameReader`] does exactly that over any [`std::io::Read`].

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors produced while framing, parsing, or sequencing control messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer bytes are buffered than the frame needs. Recoverable: read more.
    #[error("truncated message: need {needed} bytes, have {available}")]
    TruncatedMessage { needed: usize, available: usize },

    /// The kind byte does not name Command, Signal or Vmdata.
    #[error("malformed message: unknown kind byte {0}")]
    MalformedMessage(u8),

    /// The declared payload length exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {0} bytes (max {max})", max = MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),

    /// The payload does not parse as the body of its kind.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MsgKind,
        #[source]
        source: serde_json::Error,
    },

    /// A Signal payload names a number outside the forwarded signal set.
    #[error("unknown signal number {0}")]
    UnknownSignal(u32),

    /// A second Vmdata arrived after the boot descriptor was consumed.
    #[error("unexpected Vmdata: boot descriptor already received")]
    UnexpectedVmdata,

    /// A Command arrived before the boot descriptor.
    #[error("command received before Vmdata")]
    CommandBeforeVmdata,

    /// The peer closed the stream in the middle of a frame.
    #[error("connection closed mid-frame ({0} bytes buffered)")]
    ConnectionClosed(usize),

    /// The caller-supplied deadline passed before a full frame arrived.
    #[error("timed out waiting for a control message")]
    Timeout,

    /// Encoding a payload failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O error occurred while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True when the error only means "wait for more bytes".
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::TruncatedMessage { .. })
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 1 (kind) + 4 (length).
pub const HEADER_SIZE: usize = 5;

/// Largest payload either endpoint accepts (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Minimum amount of guest RAM in MiB.
pub const MIN_MEM_MIB: u32 = 64;

/// Kernel boot parameters every guest starts with.
pub const KERNEL_PARAMETERS: &str = "console=ttyS0 panic=1 module.sig_enforce=1 loglevel=3";

/// Guest hook executed instead of delivering SIGUSR1.
pub const SIGUSR1_HOOK: &str = "/.runq/SIGUSR1";

/// Guest hook executed instead of delivering SIGUSR2.
pub const SIGUSR2_HOOK: &str = "/.runq/SIGUSR2";

/// Rlimit value meaning "no limit".
pub const RLIM_INFINITY: u64 = u64::MAX;

/// How long [`FrameReader`] waits before retrying a reader that reported
/// `WouldBlock`.
pub const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(5);

/// Whether `key` is a dotted sysctl name such as `vm.overcommit_memory`.
///
/// Segments are non-empty and limited to `[A-Za-z0-9_-]`, so a key can never
/// name a path outside `/proc/sys`.
pub fn is_valid_sysctl_key(key: &str) -> bool {
    !key.is_empty()
        && key.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

// ---------------------------------------------------------------------------
// MsgKind
// ---------------------------------------------------------------------------

/// Discriminator byte of a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    /// Never sent; names a kind byte that failed to decode.
    Unknown = 0,
    /// Command to execute
    Command = 1,
    /// POSIX signal forwarded from the host
    Signal = 2,
    /// VM boot descriptor
    Vmdata = 3,
}

impl From<u8> for MsgKind {
    fn from(byte: u8) -> Self {
        match byte {
            1 => MsgKind::Command,
            2 => MsgKind::Signal,
            3 => MsgKind::Vmdata,
            _ => MsgKind::Unknown,
        }
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgKind::Unknown => "Unknown",
            MsgKind::Command => "Command",
            MsgKind::Signal => "Signal",
            MsgKind::Vmdata => "Vmdata",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// SignalKind
// ---------------------------------------------------------------------------

/// A signal the host proxy forwards into the guest.
///
/// The wire carries Linux signal numbers because the guest is always Linux;
/// each endpoint maps them to its native numbering once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalKind {
    Hup,
    Int,
    Quit,
    Term,
    Usr1,
    Usr2,
    Cont,
    Stop,
}

impl SignalKind {
    /// The forwarded set, in subscription order.
    pub const ALL: [SignalKind; 8] = [
        SignalKind::Hup,
        SignalKind::Int,
        SignalKind::Quit,
        SignalKind::Term,
        SignalKind::Usr1,
        SignalKind::Usr2,
        SignalKind::Cont,
        SignalKind::Stop,
    ];

    /// Signal number as carried in a Signal payload.
    pub const fn wire_number(self) -> u32 {
        match self {
            SignalKind::Hup => 1,
            SignalKind::Int => 2,
            SignalKind::Quit => 3,
            SignalKind::Usr1 => 10,
            SignalKind::Usr2 => 12,
            SignalKind::Term => 15,
            SignalKind::Cont => 18,
            SignalKind::Stop => 19,
        }
    }

    pub fn from_wire(number: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.wire_number() == number)
    }

    pub const fn name(self) -> &'static str {
        match self {
            SignalKind::Hup => "SIGHUP",
            SignalKind::Int => "SIGINT",
            SignalKind::Quit => "SIGQUIT",
            SignalKind::Term => "SIGTERM",
            SignalKind::Usr1 => "SIGUSR1",
            SignalKind::Usr2 => "SIGUSR2",
            SignalKind::Cont => "SIGCONT",
            SignalKind::Stop => "SIGSTOP",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Data types: Command
// ---------------------------------------------------------------------------

/// Request to execute a program in the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Absolute path of the executable inside the guest.
    pub path: String,
    /// Arguments, not including the program itself.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Working directory (optional).
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Command {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Data types: Vmdata
// ---------------------------------------------------------------------------

/// A (soft, hard) resource limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    pub soft: u64,
    pub hard: u64,
}

impl Rlimit {
    pub const fn new(soft: u64, hard: u64) -> Self {
        Self { soft, hard }
    }

    pub const fn unlimited() -> Self {
        Self::new(RLIM_INFINITY, RLIM_INFINITY)
    }

    /// A limit is well formed when the soft value does not exceed the hard one.
    pub const fn is_valid(&self) -> bool {
        self.soft <= self.hard
    }
}

/// Backend type of a VM disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disktype {
    /// Disk type could not be determined; the disk must not be attached.
    #[default]
    Unknown,
    /// Character or block special file.
    BlockDevice,
    /// Qcow2 image.
    Qcow2Image,
    /// Regular file used as a block device.
    RawFile,
}

impl Disktype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disktype::Unknown => "unknown",
            Disktype::BlockDevice => "block_device",
            Disktype::Qcow2Image => "qcow2_image",
            Disktype::RawFile => "raw_file",
        }
    }
}

/// A classified disk handed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    /// Stable identifier (used as the virtio serial).
    pub id: String,
    /// Host path of the backing device or image.
    pub path: String,
    /// Classified backend type.
    pub disktype: Disktype,
    /// Mount point inside the guest (optional).
    #[serde(default)]
    pub mount: Option<String>,
}

/// VM boot descriptor, sent exactly once before the first Command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vmdata {
    /// Guest memory in MiB (at least [`MIN_MEM_MIB`]).
    pub mem_mib: u32,
    /// Kernel command line.
    pub kernel_params: String,
    /// Requested sysctls (name → value).
    #[serde(default)]
    pub sysctls: BTreeMap<String, String>,
    /// Requested rlimits keyed by OCI name (e.g. `RLIMIT_NOFILE`).
    #[serde(default)]
    pub rlimits: BTreeMap<String, Rlimit>,
    /// Extra paths to remount read-only.
    #[serde(default)]
    pub readonly_paths: Vec<String>,
    /// Extra paths to mask.
    #[serde(default)]
    pub masked_paths: Vec<String>,
    /// Disks attached to the VM.
    #[serde(default)]
    pub disks: Vec<DiskDescriptor>,
    /// Guest hostname (optional).
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Default for Vmdata {
    fn default() -> Self {
        Self {
            mem_mib: MIN_MEM_MIB,
            kernel_params: KERNEL_PARAMETERS.to_string(),
            sysctls: BTreeMap::new(),
            rlimits: BTreeMap::new(),
            readonly_paths: Vec::new(),
            masked_paths: Vec::new(),
            disks: Vec::new(),
            hostname: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message (wire frame)
// ---------------------------------------------------------------------------

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command(Command),
    Signal(SignalKind),
    Vmdata(Box<Vmdata>),
}

impl Message {
    pub fn kind(&self) -> MsgKind {
        match self {
            Message::Command(_) => MsgKind::Command,
            Message::Signal(_) => MsgKind::Signal,
            Message::Vmdata(_) => MsgKind::Vmdata,
        }
    }

    /// Encode this message into a complete frame (header + payload).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Message::Command(cmd) => serde_json::to_vec(cmd)?,
            Message::Signal(sig) => serde_json::to_vec(&sig.wire_number())?,
            Message::Vmdata(vmdata) => serde_json::to_vec(vmdata)?,
        };
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.push(self.kind() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns the message and the number of bytes it occupied.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if let Some(&byte) = data.first() {
            if MsgKind::from(byte) == MsgKind::Unknown {
                return Err(ProtocolError::MalformedMessage(byte));
            }
        }
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::TruncatedMessage {
                needed: HEADER_SIZE,
                available: data.len(),
            });
        }

        let kind = MsgKind::from(data[0]);
        let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(length));
        }

        let total = HEADER_SIZE + length;
        if data.len() < total {
            return Err(ProtocolError::TruncatedMessage {
                needed: total,
                available: data.len(),
            });
        }

        let message = Self::from_payload(kind, &data[HEADER_SIZE..total])?;
        Ok((message, total))
    }

    fn from_payload(kind: MsgKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        let invalid = |source| ProtocolError::InvalidPayload { kind, source };
        match kind {
            MsgKind::Command => Ok(Message::Command(
                serde_json::from_slice(payload).map_err(invalid)?,
            )),
            MsgKind::Signal => {
                let number: u32 = serde_json::from_slice(payload).map_err(invalid)?;
                SignalKind::from_wire(number)
                    .map(Message::Signal)
                    .ok_or(ProtocolError::UnknownSignal(number))
            }
            MsgKind::Vmdata => Ok(Message::Vmdata(Box::new(
                serde_json::from_slice(payload).map_err(invalid)?,
            ))),
            MsgKind::Unknown => Err(ProtocolError::MalformedMessage(kind as u8)),
        }
    }
}

// ---------------------------------------------------------------------------
// FrameReader (stream decoding)
// ---------------------------------------------------------------------------

/// Buffered frame decoder over a blocking byte stream.
///
/// Truncated frames stay buffered across calls, so a read that times out
/// mid-frame can be retried without losing data. Readers with a read timeout
/// (`WouldBlock`/`TimedOut`) are polled until the caller's deadline passes,
/// pausing [`WOULD_BLOCK_BACKOFF`] after each `WouldBlock`.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Number of bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the peer closes the stream on a frame boundary.
    pub fn read_message(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<Message>, ProtocolError> {
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

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ProtocolError::Timeout);
            }

            match self.inner.read(&mut chunk) {
                Ok(0) if self.buf.is_empty() => return Ok(None),
                Ok(0) => return Err(ProtocolError::ConnectionClosed(self.buf.len())),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let pause = match deadline {
                        Some(d) => {
                            WOULD_BLOCK_BACKOFF.min(d.saturating_duration_since(Instant::now()))
                        }
                        None => WOULD_BLOCK_BACKOFF,
                    };
                    std::thread::sleep(pause);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn sample_vmdata() -> Vmdata {
        let mut vmdata = Vmdata {
            mem_mib: 256,
            hostname: Some("box".into()),
            ..Vmdata::default()
        };
        vmdata
            .sysctls
            .insert("kernel.kexec_load_disabled".into(), "0".into());
        vmdata
            .rlimits
            .insert("RLIMIT_NOFILE".into(), Rlimit::new(100, 200));
        vmdata
            .rlimits
            .insert("RLIMIT_NPROC".into(), Rlimit::unlimited());
        vmdata.masked_paths.push("/proc/keys".into());
        vmdata.disks.push(DiskDescriptor {
            id: "data".into(),
            path: "/var/lib/runq/data.qcow2".into(),
            disktype: Disktype::Qcow2Image,
            mount: Some("/data".into()),
        });
        vmdata
    }

    fn samples() -> Vec<Message> {
        vec![
            Message::Command(Command::new("/bin/sh").arg("-c").arg("echo hi")),
            Message::Signal(SignalKind::Term),
            Message::Vmdata(Box::new(sample_vmdata())),
        ]
    }

    /// Hands out one byte per read call.
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let end = buf.len().min(1);
            self.0.read(&mut buf[..end])
        }
    }

    /// Always reports a read timeout.
    struct Stalled;

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    #[test]
    fn message_round_trip() {
        for msg in samples() {
            let bytes = msg.encode().unwrap();
            let (decoded, used) = Message::decode(&bytes).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn signal_frame_layout() {
        let bytes = Message::Signal(SignalKind::Term).encode().unwrap();
        assert_eq!(bytes, vec![2, 0, 0, 0, 2, b'1', b'5']);
    }

    #[test]
    fn every_prefix_is_incomplete() {
        for msg in samples() {
            let bytes = msg.encode().unwrap();
            for len in 0..bytes.len() {
                let err = Message::decode(&bytes[..len]).unwrap_err();
                assert!(err.is_incomplete(), "prefix {} of {:?}: {}", len, msg.kind(), err);
            }
        }
    }

    #[test]
    fn unknown_kind_is_malformed() {
        for byte in [0u8, 4, 255] {
            let data = [byte, 0, 0, 0, 0];
            assert!(matches!(
                Message::decode(&data),
                Err(ProtocolError::MalformedMessage(b)) if b == byte
            ));
        }
        // Detected from the first byte alone.
        assert!(matches!(
            Message::decode(&[0]),
            Err(ProtocolError::MalformedMessage(0))
        ));
    }

    #[test]
    fn msg_kind_from_byte() {
        assert_eq!(MsgKind::from(1), MsgKind::Command);
        assert_eq!(MsgKind::from(2), MsgKind::Signal);
        assert_eq!(MsgKind::from(3), MsgKind::Vmdata);
        assert_eq!(MsgKind::from(0), MsgKind::Unknown);
        assert_eq!(MsgKind::from(42), MsgKind::Unknown);
    }

    #[test]
    fn oversized_length_rejected_before_payload() {
        let len = (MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes();
        let data = [1, len[0], len[1], len[2], len[3]];
        assert!(matches!(
            Message::decode(&data),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn bad_payloads() {
        let mut data = vec![1, 0, 0, 0, 3];
        data.extend_from_slice(b"{{{");
        assert!(matches!(
            Message::decode(&data),
            Err(ProtocolError::InvalidPayload {
                kind: MsgKind::Command,
                ..
            })
        ));

        let mut data = vec![2, 0, 0, 0, 1];
        data.push(b'9');
        assert!(matches!(
            Message::decode(&data),
            Err(ProtocolError::UnknownSignal(9))
        ));
    }

    #[test]
    fn signal_wire_numbers() {
        let expected = [
            (SignalKind::Hup, 1),
            (SignalKind::Int, 2),
            (SignalKind::Quit, 3),
            (SignalKind::Term, 15),
            (SignalKind::Usr1, 10),
            (SignalKind::Usr2, 12),
            (SignalKind::Cont, 18),
            (SignalKind::Stop, 19),
        ];
        for (kind, number) in expected {
            assert_eq!(kind.wire_number(), number);
            assert_eq!(SignalKind::from_wire(number), Some(kind));
        }
        assert_eq!(SignalKind::from_wire(9), None);
    }

    #[test]
    fn vmdata_defaults() {
        let vmdata: Vmdata = serde_json::from_str(r#"{"mem_mib":128,"kernel_params":"quiet"}"#).unwrap();
        assert!(vmdata.sysctls.is_empty());
        assert!(vmdata.disks.is_empty());

        let default = Vmdata::default();
        assert_eq!(default.mem_mib, MIN_MEM_MIB);
        assert_eq!(default.kernel_params, KERNEL_PARAMETERS);
    }

    #[test]
    fn infinite_rlimit_survives_json() {
        let json = serde_json::to_string(&Rlimit::unlimited()).unwrap();
        let back: Rlimit = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hard, RLIM_INFINITY);
        assert!(!Rlimit::new(10, 5).is_valid());
    }

    #[test]
    fn frame_reader_reads_back_to_back_frames() {
        let mut stream = Vec::new();
        for msg in samples() {
            stream.extend(msg.encode().unwrap());
        }
        let mut reader = FrameReader::new(Cursor::new(stream));
        for msg in samples() {
            assert_eq!(reader.read_message(None).unwrap(), Some(msg));
        }
        assert_eq!(reader.read_message(None).unwrap(), None);
    }

    #[test]
    fn frame_reader_reassembles_split_frames() {
        let bytes = Message::Vmdata(Box::new(sample_vmdata())).encode().unwrap();
        let mut reader = FrameReader::new(Trickle(Cursor::new(bytes)));
        let msg = reader.read_message(None).unwrap().unwrap();
        assert_eq!(msg.kind(), MsgKind::Vmdata);
    }

    #[test]
    fn frame_reader_eof_mid_frame() {
        let bytes = Message::Signal(SignalKind::Hup).encode().unwrap();
        let mut reader = FrameReader::new(Cursor::new(bytes[..3].to_vec()));
        assert!(matches!(
            reader.read_message(None),
            Err(ProtocolError::ConnectionClosed(3))
        ));
    }

    #[test]
    fn frame_reader_respects_deadline() {
        let mut reader = FrameReader::new(Stalled);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(
            reader.read_message(Some(deadline)),
            Err(ProtocolError::Timeout)
        ));
    }

    /// Non-blocking reader that counts how often it was polled.
    struct Polled(usize);

    impl Read for Polled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.0 += 1;
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    #[test]
    fn frame_reader_backs_off_on_would_block() {
        let mut reader = FrameReader::new(Polled(0));
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(matches!(
            reader.read_message(Some(deadline)),
            Err(ProtocolError::Timeout)
        ));
        // 50ms at a 5ms backoff; a busy loop would poll thousands of times.
        assert!(reader.get_ref().0 <= 20, "polled {} times", reader.get_ref().0);
    }

    #[test]
    fn sysctl_key_validation() {
        for key in [
            "vm.overcommit_memory",
            "net.ipv6.conf.all.disable_ipv6",
            "fs.file-max",
            "kernel.threads-max",
        ] {
            assert!(is_valid_sysctl_key(key), "{key}");
        }
        for key in [
            "",
            "/tmp/victim/file",
            "kernel/kexec_load_disabled",
            "..kernel",
            "kernel..x",
            "kernel.",
            "net.ipv4.conf.eth0 .x",
            "kernel.core_pattern\n",
        ] {
            assert!(!is_valid_sysctl_key(key), "{key}");
        }
    }

    #[test]
    fn frame_reader_stops_on_malformed() {
        let mut reader = FrameReader::new(Cursor::new(vec![7, 0, 0, 0, 0]));
        assert!(matches!(
            reader.read_message(None),
            Err(ProtocolError::MalformedMessage(7))
        ));
    }
}
