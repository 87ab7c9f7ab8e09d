//! Periodic zombie reaper.
//!
//! As PID 1 the init inherits every orphan in the guest. A background thread
//! wakes every [`GuestPolicy::reaper_interval`](crate::policy::GuestPolicy)
//! and collects all terminated children. Each reaped child is reported on
//! an optional channel so the init notices when its supervised process ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// A child collected by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: Pid,
    /// Exit code, or 128 + signal number for signaled children.
    pub code: i32,
}

fn exit_code(status: WaitStatus) -> Option<(Pid, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, code)),
        WaitStatus::Signaled(pid, signal, _) => Some((pid, 128 + signal as i32)),
        _ => None,
    }
}

/// Collect every terminated child without blocking.
pub fn reap_zombies() -> Vec<ExitEvent> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some((pid, code)) = exit_code(status) {
                    reaped.push(ExitEvent { pid, code });
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                // Retried on the next tick.
                warn!(error = %e, "waitpid failed");
                break;
            }
        }
    }
    reaped
}

/// Reaper configuration.
#[derive(Debug, Clone, Copy)]
pub struct Reaper {
    interval: Duration,
}

impl Reaper {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start the reaper thread.
    ///
    /// Exit events are sent on `events` when given; a closed receiver is
    /// ignored.
    pub fn spawn(self, events: Option<mpsc::Sender<ExitEvent>>) -> std::io::Result<ReaperHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = self.interval;
        let thread = std::thread::Builder::new()
            .name("reaper".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
                let reaped = reap_zombies();
                if !reaped.is_empty() {
                    debug!(count = reaped.len(), "reaped zombies");
                }
                if let Some(tx) = &events {
                    for event in reaped {
                        let _ = tx.send(event);
                    }
                }
            })?;

        Ok(ReaperHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Stops the reaper thread when stopped or dropped.
pub struct ReaperHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Watches for the exit of the supervised process.
///
/// The supervised pid is published after the child is spawned, so the reaper
/// may report its exit first. Events seen before publication are kept until
/// the pid is known. Once it is, the child is also polled directly with
/// `waitpid(pid, WNOHANG)` every tick instead of waiting for the next sweep.
#[derive(Debug)]
pub struct ExitWatch {
    supervised: Arc<AtomicI32>,
    early: HashMap<i32, i32>,
}

impl ExitWatch {
    pub fn new(supervised: Arc<AtomicI32>) -> Self {
        Self {
            supervised,
            early: HashMap::new(),
        }
    }

    /// Feed one reaper event. Returns the exit code when it is the supervised
    /// process.
    pub fn record(&mut self, event: ExitEvent) -> Option<i32> {
        match self.supervised.load(Ordering::SeqCst) {
            0 => {
                self.early.insert(event.pid.as_raw(), event.code);
                None
            }
            pid if pid == event.pid.as_raw() => Some(event.code),
            _ => None,
        }
    }

    /// Exit code of the supervised process if it has terminated.
    pub fn check(&mut self) -> Option<i32> {
        let pid = self.supervised.load(Ordering::SeqCst);
        if pid == 0 {
            return None;
        }
        if !self.early.is_empty() {
            let code = self.early.remove(&pid);
            self.early.clear();
            if code.is_some() {
                return code;
            }
        }
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => exit_code(status).map(|(_, code)| code),
            // Already collected by the reaper; its event follows.
            Err(Errno::ECHILD) | Err(Errno::EINTR) => None,
            Err(e) => {
                warn!(pid, error = %e, "waitpid on supervised process failed");
                None
            }
        }
    }

    /// Block until the supervised process exits and return its exit code.
    pub fn wait(mut self, events: &mpsc::Receiver<ExitEvent>, poll: Duration) -> i32 {
        loop {
            match events.recv_timeout(poll) {
                Ok(event) => {
                    if let Some(code) = self.record(event) {
                        return code;
                    }
                    while let Ok(event) = events.try_recv() {
                        if let Some(code) = self.record(event) {
                            return code;
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => std::thread::sleep(poll),
            }
            if let Some(code) = self.check() {
                return code;
            }
        }
    }

    /// Run [`wait`](Self::wait) on a thread and raise `stop` when the
    /// supervised process exits.
    pub fn spawn(
        self,
        events: mpsc::Receiver<ExitEvent>,
        poll: Duration,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let supervised = Arc::clone(&self.supervised);
        std::thread::Builder::new()
            .name("exit-watch".into())
            .spawn(move || {
                let code = self.wait(&events, poll);
                info!(
                    pid = supervised.load(Ordering::SeqCst),
                    code, "supervised process exited"
                );
                stop.store(true, Ordering::SeqCst);
            })
    }
}
