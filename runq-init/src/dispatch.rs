//! Guest control loop.
//!
//! Messages from the host are decoded and handled strictly in arrival order
//! by a single thread. The loop starts in [`LoopState::AwaitingVmdata`]; the
//! boot descriptor hardens the guest and moves it to
//! [`LoopState::Running`]. The first Command after that becomes the
//! supervised process, later Commands run alongside it. Signals go to the
//! supervised process or, for signals with a hook, run the hook instead.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use runq_protocol::{Command, FrameReader, Message, ProtocolError, SignalKind, Vmdata};
use tracing::{debug, info, warn};

use crate::error::{InitError, Result};
use crate::harden::{HardenReport, Hardener};
use crate::kernel::Kernel;

/// Native signal for each forwarded signal.
pub fn native_signal(kind: SignalKind) -> Signal {
    match kind {
        SignalKind::Hup => Signal::SIGHUP,
        SignalKind::Int => Signal::SIGINT,
        SignalKind::Quit => Signal::SIGQUIT,
        SignalKind::Term => Signal::SIGTERM,
        SignalKind::Usr1 => Signal::SIGUSR1,
        SignalKind::Usr2 => Signal::SIGUSR2,
        SignalKind::Cont => Signal::SIGCONT,
        SignalKind::Stop => Signal::SIGSTOP,
    }
}

/// Side effects of the control loop.
pub trait GuestActions {
    /// Harden the guest according to the boot descriptor.
    fn harden(&mut self, vmdata: &Vmdata) -> Result<HardenReport>;

    /// Start a process and return its pid without waiting for it.
    fn spawn(&mut self, command: &Command) -> Result<Pid>;

    /// Deliver a signal to a process.
    fn deliver(&mut self, pid: Pid, signal: SignalKind) -> Result<()>;

    /// Whether a signal hook is installed at `hook`.
    fn hook_exists(&self, hook: &Path) -> bool;
}

/// [`GuestActions`] against the real guest.
pub struct InitActions<K> {
    hardener: Hardener<K>,
}

impl<K: Kernel> InitActions<K> {
    pub fn new(hardener: Hardener<K>) -> Self {
        Self { hardener }
    }
}

impl<K: Kernel> GuestActions for InitActions<K> {
    fn harden(&mut self, vmdata: &Vmdata) -> Result<HardenReport> {
        let report = self.hardener.harden(vmdata)?;
        if let Some(hostname) = &vmdata.hostname {
            if let Err(e) = nix::unistd::sethostname(hostname) {
                warn!(hostname = %hostname, error = %e, "failed to set hostname");
            }
        }
        for disk in &vmdata.disks {
            info!(
                id = %disk.id,
                disktype = disk.disktype.as_str(),
                mount = ?disk.mount,
                "disk attached"
            );
        }
        Ok(report)
    }

    fn spawn(&mut self, command: &Command) -> Result<Pid> {
        let mut cmd = std::process::Command::new(&command.path);
        cmd.args(&command.args);
        cmd.envs(command.env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        // The child is collected by the reaper, not through `Child`.
        let child = cmd.spawn().map_err(|source| InitError::Spawn {
            path: command.path.clone(),
            source,
        })?;
        Ok(Pid::from_raw(child.id() as i32))
    }

    fn deliver(&mut self, pid: Pid, signal: SignalKind) -> Result<()> {
        kill(pid, native_signal(signal)).map_err(|source| InitError::Deliver {
            signal,
            pid: pid.as_raw(),
            source,
        })
    }

    fn hook_exists(&self, hook: &Path) -> bool {
        hook.is_file()
    }
}

/// Where the control loop is in the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingVmdata,
    Running,
}

/// Applies decoded messages to the guest.
pub struct Dispatcher<A> {
    actions: A,
    sig_commands: BTreeMap<SignalKind, PathBuf>,
    state: LoopState,
    /// Pid of the supervised process, 0 before it starts.
    supervised: Arc<AtomicI32>,
}

impl<A: GuestActions> Dispatcher<A> {
    pub fn new(actions: A, sig_commands: BTreeMap<SignalKind, PathBuf>) -> Self {
        Self {
            actions,
            sig_commands,
            state: LoopState::AwaitingVmdata,
            supervised: Arc::new(AtomicI32::new(0)),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn actions(&self) -> &A {
        &self.actions
    }

    /// Shared view of the supervised pid (0 until the first Command runs).
    pub fn supervised_pid(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.supervised)
    }

    pub fn dispatch(&mut self, message: Message) -> Result<()> {
        match (self.state, message) {
            (LoopState::AwaitingVmdata, Message::Vmdata(vmdata)) => {
                info!(mem_mib = vmdata.mem_mib, disks = vmdata.disks.len(), "boot descriptor received");
                let report = self.actions.harden(&vmdata)?;
                for warning in &report.warnings {
                    warn!(%warning, "hardening warning");
                }
                self.state = LoopState::Running;
                Ok(())
            }
            (LoopState::Running, Message::Vmdata(_)) => Err(ProtocolError::UnexpectedVmdata.into()),
            (LoopState::AwaitingVmdata, Message::Command(_)) => {
                Err(ProtocolError::CommandBeforeVmdata.into())
            }
            (LoopState::Running, Message::Command(command)) => self.start(&command),
            (_, Message::Signal(signal)) => {
                self.handle_signal(signal);
                Ok(())
            }
        }
    }

    fn start(&mut self, command: &Command) -> Result<()> {
        let pid = self.actions.spawn(command)?;
        if self.supervised.load(Ordering::SeqCst) == 0 {
            info!(path = %command.path, pid = pid.as_raw(), "supervised process started");
            self.supervised.store(pid.as_raw(), Ordering::SeqCst);
        } else {
            info!(path = %command.path, pid = pid.as_raw(), "auxiliary process started");
        }
        Ok(())
    }

    /// Signals are best effort: failures are logged, never returned.
    fn handle_signal(&mut self, signal: SignalKind) {
        if let Some(hook) = self.sig_commands.get(&signal) {
            if self.actions.hook_exists(hook) {
                let command = Command::new(hook.to_string_lossy());
                match self.actions.spawn(&command) {
                    Ok(pid) => debug!(%signal, hook = %hook.display(), pid = pid.as_raw(), "signal hook started"),
                    Err(e) => warn!(%signal, hook = %hook.display(), error = %e, "signal hook failed"),
                }
                return;
            }
            debug!(%signal, hook = %hook.display(), "no hook installed, delivering signal");
        }

        let pid = self.supervised.load(Ordering::SeqCst);
        if pid == 0 {
            warn!(%signal, "no supervised process, dropping signal");
            return;
        }
        match self.actions.deliver(Pid::from_raw(pid), signal) {
            Ok(()) => debug!(%signal, pid, "signal delivered"),
            Err(e) => warn!(error = %e, "signal delivery failed"),
        }
    }
}

/// Reads the control channel and feeds the dispatcher until the host closes it.
pub struct ControlLoop<R, A> {
    reader: FrameReader<R>,
    dispatcher: Dispatcher<A>,
    poll: Duration,
    stop: Arc<AtomicBool>,
}

impl<R: Read, A: GuestActions> ControlLoop<R, A> {
    /// `poll` bounds each read so a raised `stop` flag is noticed; the reader
    /// should carry a read timeout no longer than `poll`.
    pub fn new(reader: R, dispatcher: Dispatcher<A>, poll: Duration) -> Self {
        Self {
            reader: FrameReader::new(reader),
            dispatcher,
            poll,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends the loop at the next poll.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn dispatcher(&self) -> &Dispatcher<A> {
        &self.dispatcher
    }

    /// Run until the channel closes (`Ok`) or a protocol or fatal error occurs.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("control loop stopping");
                return Ok(());
            }
            match self.reader.read_message(Some(Instant::now() + self.poll)) {
                Ok(Some(message)) => {
                    debug!(kind = %message.kind(), "control message");
                    self.dispatcher.dispatch(message)?;
                }
                Ok(None) => {
                    info!("control channel closed by host");
                    return Ok(());
                }
                Err(ProtocolError::Timeout) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_signal_numbers() {
        for kind in SignalKind::ALL {
            assert_eq!(native_signal(kind) as i32 as u32, kind.wire_number());
        }
    }
}
