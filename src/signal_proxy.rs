//! Host signal forwarding.
//!
//! The proxy subscribes to the forwarded signal set, and a listener thread
//! turns each delivery into a Signal message queued on the single writer.
//! Forwarding is fire-and-forget: a full queue drops the signal with a log
//! line and never blocks the listener. Once the channel is closed every
//! delivered signal gets the host's default action.
//!
//! Shutdown resets the forwarded signals to `SIG_DFL`. The signal-hook
//! registry never reinstalls its handler afterwards, so a process starts at
//! most one proxy that actually receives signals.
//!
//! ```text
//! Idle ──start()──▶ Subscribed ──▶ Forwarding ──shutdown() / channel closed──▶ Closed
//! ```

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use libc::c_int;
use runq_protocol::{Message, SignalKind};
use signal_hook::consts::FORBIDDEN;
use signal_hook::iterator::{Handle, Signals};
use signal_hook::low_level::emulate_default_handler;
use tracing::{debug, info, warn};

use crate::channel::ChannelWriter;
use crate::{Error, Result};

/// Forwarded signals and their host-native numbers.
#[derive(Debug, Clone)]
pub struct SignalTable {
    entries: Vec<(SignalKind, c_int)>,
}

fn native_number(kind: SignalKind) -> c_int {
    match kind {
        SignalKind::Hup => libc::SIGHUP,
        SignalKind::Int => libc::SIGINT,
        SignalKind::Quit => libc::SIGQUIT,
        SignalKind::Term => libc::SIGTERM,
        SignalKind::Usr1 => libc::SIGUSR1,
        SignalKind::Usr2 => libc::SIGUSR2,
        SignalKind::Cont => libc::SIGCONT,
        SignalKind::Stop => libc::SIGSTOP,
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new(&SignalKind::ALL)
    }
}

impl SignalTable {
    /// Table for `kinds`, in order, without duplicates.
    pub fn new(kinds: &[SignalKind]) -> Self {
        let mut entries: Vec<(SignalKind, c_int)> = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            if !entries.iter().any(|(k, _)| *k == kind) {
                entries.push((kind, native_number(kind)));
            }
        }
        Self { entries }
    }

    pub fn kinds(&self) -> impl Iterator<Item = SignalKind> + '_ {
        self.entries.iter().map(|(kind, _)| *kind)
    }

    pub fn native(&self, kind: SignalKind) -> Option<c_int> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, n)| *n)
    }

    pub fn kind(&self, native: c_int) -> Option<SignalKind> {
        self.entries
            .iter()
            .find(|(_, n)| *n == native)
            .map(|(k, _)| *k)
    }

    /// Native numbers a process can install a handler for.
    pub fn catchable(&self) -> Vec<c_int> {
        self.entries
            .iter()
            .map(|(_, n)| *n)
            .filter(|n| !FORBIDDEN.contains(n))
            .collect()
    }
}

/// Lifecycle of a [`SignalProxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    Subscribed,
    Forwarding,
    Closed,
}

/// Forwards host signals to the guest as Signal messages.
pub struct SignalProxy {
    table: Arc<SignalTable>,
    writer: ChannelWriter,
    state: Arc<Mutex<ProxyState>>,
    handle: Option<Handle>,
    listener: Option<JoinHandle<()>>,
}

fn lock(state: &Mutex<ProxyState>) -> MutexGuard<'_, ProxyState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What became of one delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Forwarded {
    Queued,
    /// Queue full or message rejected.
    Dropped,
    /// Proxy not forwarding yet.
    Inactive,
    /// Channel gone; the signal belongs to the host.
    Closed,
}

/// Queue one Signal message if the proxy is forwarding.
fn forward_signal(
    state: &Mutex<ProxyState>,
    writer: &ChannelWriter,
    kind: SignalKind,
) -> Forwarded {
    let mut state = lock(state);
    match *state {
        ProxyState::Forwarding => {}
        ProxyState::Closed => return Forwarded::Closed,
        other => {
            debug!(signal = %kind, state = ?other, "signal not forwarded");
            return Forwarded::Inactive;
        }
    }
    if writer.is_closed() {
        warn!(signal = %kind, "control channel closed, signal proxy closing");
        *state = ProxyState::Closed;
        return Forwarded::Closed;
    }
    match writer.try_send(Message::Signal(kind)) {
        Ok(()) => {
            debug!(signal = %kind, "signal forwarded");
            Forwarded::Queued
        }
        Err(Error::ChannelClosed) => {
            warn!(signal = %kind, "control channel closed, signal proxy closing");
            *state = ProxyState::Closed;
            Forwarded::Closed
        }
        Err(e) => {
            warn!(signal = %kind, error = %e, "dropping signal");
            Forwarded::Dropped
        }
    }
}

/// Put `native` back to its default disposition.
fn reset_default(native: c_int) -> io::Result<()> {
    // SAFETY: the action is fully initialized (zeroed, SIG_DFL, empty mask)
    // before sigaction reads it.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(native, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl SignalProxy {
    pub fn new(table: Arc<SignalTable>, writer: ChannelWriter) -> Self {
        Self {
            table,
            writer,
            state: Arc::new(Mutex::new(ProxyState::Idle)),
            handle: None,
            listener: None,
        }
    }

    pub fn state(&self) -> ProxyState {
        *lock(&self.state)
    }

    /// Subscribe to the catchable signals of the table and start forwarding.
    pub fn start(&mut self) -> Result<()> {
        let current = self.state();
        if current != ProxyState::Idle {
            return Err(Error::Signal(format!(
                "signal proxy cannot start from {current:?}"
            )));
        }

        for kind in self.table.kinds() {
            if self
                .table
                .native(kind)
                .is_some_and(|n| FORBIDDEN.contains(&n))
            {
                info!(signal = %kind, "signal cannot be caught, not forwarded");
            }
        }

        let mut signals = Signals::new(self.table.catchable())?;
        *lock(&self.state) = ProxyState::Subscribed;
        self.handle = Some(signals.handle());

        let table = Arc::clone(&self.table);
        let state = Arc::clone(&self.state);
        let writer = self.writer.clone();
        let listener = std::thread::Builder::new()
            .name("signal-proxy".into())
            .spawn(move || {
                for native in signals.forever() {
                    let Some(kind) = table.kind(native) else {
                        debug!(native, "ignoring unmapped signal");
                        continue;
                    };
                    if forward_signal(&state, &writer, kind) == Forwarded::Closed {
                        if let Err(e) = emulate_default_handler(native) {
                            warn!(native, error = %e, "default signal action failed");
                        }
                    }
                }
            });
        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                self.shutdown();
                return Err(e.into());
            }
        };
        self.listener = Some(listener);

        *lock(&self.state) = ProxyState::Forwarding;
        info!(signals = self.table.catchable().len(), "signal proxy forwarding");
        Ok(())
    }

    /// Forward one signal now. Returns whether it was queued.
    pub fn forward(&self, kind: SignalKind) -> bool {
        forward_signal(&self.state, &self.writer, kind) == Forwarded::Queued
    }

    /// Stop forwarding, unsubscribe and restore the default dispositions.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        let previous = std::mem::replace(&mut *lock(&self.state), ProxyState::Closed);
        let subscribed = self.handle.is_some();
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        if subscribed {
            for native in self.table.catchable() {
                if let Err(e) = reset_default(native) {
                    warn!(native, error = %e, "restoring default signal action failed");
                }
            }
        }
        if previous != ProxyState::Closed {
            info!("signal proxy closed");
        }
    }
}

impl Drop for SignalProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}
