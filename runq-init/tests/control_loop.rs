//! Control loop sequencing with a fake guest.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::unistd::Pid;
use runq_init::{
    ControlLoop, Dispatcher, GuestActions, GuestPolicy, HardenReport, InitError, LoopState,
};
use runq_protocol::{Command, Message, ProtocolError, SignalKind, Vmdata};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Harden(u32),
    Spawn(String),
    Deliver(i32, SignalKind),
}

#[derive(Default)]
struct FakeGuest {
    actions: Vec<Action>,
    hooks: BTreeSet<PathBuf>,
    next_pid: i32,
}

impl FakeGuest {
    fn with_hook(mut self, hook: &str) -> Self {
        self.hooks.insert(PathBuf::from(hook));
        self
    }
}

impl GuestActions for FakeGuest {
    fn harden(&mut self, vmdata: &Vmdata) -> runq_init::Result<HardenReport> {
        self.actions.push(Action::Harden(vmdata.mem_mib));
        Ok(HardenReport::default())
    }

    fn spawn(&mut self, command: &Command) -> runq_init::Result<Pid> {
        self.actions.push(Action::Spawn(command.path.clone()));
        self.next_pid += 1;
        Ok(Pid::from_raw(100 + self.next_pid))
    }

    fn deliver(&mut self, pid: Pid, signal: SignalKind) -> runq_init::Result<()> {
        self.actions.push(Action::Deliver(pid.as_raw(), signal));
        Ok(())
    }

    fn hook_exists(&self, hook: &Path) -> bool {
        self.hooks.contains(hook)
    }
}

fn frames(messages: &[Message]) -> Vec<u8> {
    messages
        .iter()
        .flat_map(|m| m.encode().unwrap())
        .collect()
}

fn boot(mem_mib: u32) -> Message {
    Message::Vmdata(Box::new(Vmdata {
        mem_mib,
        ..Vmdata::default()
    }))
}

fn control_loop(guest: FakeGuest, bytes: Vec<u8>) -> ControlLoop<Cursor<Vec<u8>>, FakeGuest> {
    let dispatcher = Dispatcher::new(guest, GuestPolicy::default().sig_commands);
    ControlLoop::new(Cursor::new(bytes), dispatcher, Duration::from_secs(1))
}

fn recorded(lp: &ControlLoop<Cursor<Vec<u8>>, FakeGuest>) -> &[Action] {
    &lp.dispatcher().actions().actions
}

#[test]
fn boot_then_command_then_signal() {
    let bytes = frames(&[
        boot(256),
        Message::Command(Command::new("/bin/app").arg("--serve")),
        Message::Signal(SignalKind::Term),
    ]);
    let mut lp = control_loop(FakeGuest::default(), bytes);

    lp.run().unwrap();

    assert_eq!(
        recorded(&lp),
        &[
            Action::Harden(256),
            Action::Spawn("/bin/app".into()),
            Action::Deliver(101, SignalKind::Term),
        ]
    );
    assert_eq!(lp.dispatcher().state(), LoopState::Running);
    assert_eq!(lp.dispatcher().supervised_pid().load(Ordering::SeqCst), 101);
}

#[test]
fn second_vmdata_terminates_loop() {
    let bytes = frames(&[
        boot(128),
        boot(512),
        Message::Command(Command::new("/bin/app")),
    ]);
    let mut lp = control_loop(FakeGuest::default(), bytes);

    match lp.run() {
        Err(InitError::Protocol(ProtocolError::UnexpectedVmdata)) => {}
        other => panic!("expected UnexpectedVmdata, got {other:?}"),
    }
    // Nothing after the second descriptor was processed.
    assert_eq!(recorded(&lp), &[Action::Harden(128)]);
}

#[test]
fn command_before_vmdata_is_rejected() {
    let bytes = frames(&[Message::Command(Command::new("/bin/app")), boot(256)]);
    let mut lp = control_loop(FakeGuest::default(), bytes);

    match lp.run() {
        Err(InitError::Protocol(ProtocolError::CommandBeforeVmdata)) => {}
        other => panic!("expected CommandBeforeVmdata, got {other:?}"),
    }
    assert!(recorded(&lp).is_empty());
    assert_eq!(lp.dispatcher().state(), LoopState::AwaitingVmdata);
}

#[test]
fn later_commands_do_not_replace_supervised_process() {
    let bytes = frames(&[
        boot(256),
        Message::Command(Command::new("/bin/app")),
        Message::Command(Command::new("/bin/sidecar")),
        Message::Signal(SignalKind::Hup),
    ]);
    let mut lp = control_loop(FakeGuest::default(), bytes);

    lp.run().unwrap();

    assert_eq!(
        recorded(&lp).last(),
        Some(&Action::Deliver(101, SignalKind::Hup))
    );
}

#[test]
fn installed_hook_replaces_delivery() {
    let bytes = frames(&[
        boot(256),
        Message::Command(Command::new("/bin/app")),
        Message::Signal(SignalKind::Usr1),
    ]);
    let mut lp = control_loop(FakeGuest::default().with_hook("/.runq/SIGUSR1"), bytes);

    lp.run().unwrap();

    assert_eq!(
        recorded(&lp),
        &[
            Action::Harden(256),
            Action::Spawn("/bin/app".into()),
            Action::Spawn("/.runq/SIGUSR1".into()),
        ]
    );
}

#[test]
fn missing_hook_falls_back_to_delivery() {
    let bytes = frames(&[
        boot(256),
        Message::Command(Command::new("/bin/app")),
        Message::Signal(SignalKind::Usr2),
    ]);
    let mut lp = control_loop(FakeGuest::default().with_hook("/.runq/SIGUSR1"), bytes);

    lp.run().unwrap();

    assert_eq!(
        recorded(&lp).last(),
        Some(&Action::Deliver(101, SignalKind::Usr2))
    );
}

#[test]
fn signal_without_supervised_process_is_dropped() {
    let bytes = frames(&[boot(256), Message::Signal(SignalKind::Int)]);
    let mut lp = control_loop(FakeGuest::default(), bytes);

    lp.run().unwrap();

    assert_eq!(recorded(&lp), &[Action::Harden(256)]);
}

#[test]
fn malformed_frame_terminates_loop() {
    let mut bytes = frames(&[boot(256)]);
    bytes.extend_from_slice(&[9, 0, 0, 0, 2, b'{', b'}']);
    let mut lp = control_loop(FakeGuest::default(), bytes);

    match lp.run() {
        Err(InitError::Protocol(ProtocolError::MalformedMessage(9))) => {}
        other => panic!("expected MalformedMessage, got {other:?}"),
    }
    assert_eq!(recorded(&lp), &[Action::Harden(256)]);
}

#[test]
fn closed_channel_mid_frame_is_an_error() {
    let mut bytes = frames(&[boot(256)]);
    bytes.extend_from_slice(&[2, 0, 0]);
    let mut lp = control_loop(FakeGuest::default(), bytes);

    assert!(matches!(
        lp.run(),
        Err(InitError::Protocol(ProtocolError::ConnectionClosed(3)))
    ));
}

#[test]
fn stop_flag_ends_loop_before_reading() {
    let bytes = frames(&[boot(256)]);
    let mut lp = control_loop(FakeGuest::default(), bytes);
    lp.stop_flag().store(true, Ordering::SeqCst);

    lp.run().unwrap();

    assert!(recorded(&lp).is_empty());
}

#[test]
fn empty_hook_table_always_delivers() {
    let bytes = frames(&[
        boot(256),
        Message::Command(Command::new("/bin/app")),
        Message::Signal(SignalKind::Usr1),
    ]);
    let dispatcher = Dispatcher::new(
        FakeGuest::default().with_hook("/.runq/SIGUSR1"),
        BTreeMap::new(),
    );
    let mut lp = ControlLoop::new(Cursor::new(bytes), dispatcher, Duration::from_secs(1));

    lp.run().unwrap();

    assert_eq!(
        lp.dispatcher().actions().actions.last(),
        Some(&Action::Deliver(101, SignalKind::Usr1))
    );
}
