//! Guest init for runq VMs
//!
//! Mounts the pseudo filesystems, waits for the host proxy on vsock and runs
//! the control loop until the host goes away or the supervised process exits.

#[cfg(not(target_os = "linux"))]
compile_error!("runq-init is Linux-only (runs as PID 1 inside the VM)");

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use nix::mount::{mount, MsFlags};
use nix::sys::socket::{
    accept, bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    VsockAddr,
};
use nix::sys::time::TimeVal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use runq_init::cmdline::InitConfig;
use runq_init::{
    ControlLoop, Dispatcher, ExitWatch, GuestPolicy, Hardener, InitActions, InitError,
    LinuxKernel, Reaper, Result,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("runq init starting");
    let is_init = std::process::id() == 1;
    if is_init {
        mount_pseudo_filesystems();
    }

    let code = match run() {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "init failed");
            1
        }
    };

    if is_init {
        // PID 1 must never exit or the kernel panics.
        nix::unistd::sync();
        if let Err(e) = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF) {
            error!(error = %e, "power off failed");
        }
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }
    std::process::exit(code);
}

fn run() -> Result<()> {
    let config = InitConfig::load();
    let policy = Arc::new(GuestPolicy::default().reaper_interval(config.reaper_interval));

    let (exit_tx, exit_rx) = mpsc::channel();
    let _reaper = Reaper::new(policy.reaper_interval).spawn(Some(exit_tx))?;

    let stream = accept_host(config.port, config.poll)?;

    let hardener = Hardener::new(Arc::clone(&policy), LinuxKernel::default());
    let dispatcher = Dispatcher::new(InitActions::new(hardener), policy.sig_commands.clone());
    let supervised = dispatcher.supervised_pid();
    let mut control = ControlLoop::new(stream, dispatcher, config.poll);

    ExitWatch::new(supervised).spawn(exit_rx, config.poll, control.stop_flag())?;

    control.run()
}

/// Mount /proc, /sys and /dev. Failures are logged; an already mounted
/// filesystem is not an error.
fn mount_pseudo_filesystems() {
    let mounts = [
        ("proc", "/proc", "proc"),
        ("sysfs", "/sys", "sysfs"),
        ("devtmpfs", "/dev", "devtmpfs"),
    ];
    for (source, target, fstype) in mounts {
        let _ = std::fs::create_dir_all(target);
        let flags = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC;
        match mount(Some(source), target, Some(fstype), flags, None::<&str>) {
            Ok(()) | Err(nix::errno::Errno::EBUSY) => {}
            Err(e) => warn!(target, error = %e, "mount failed"),
        }
    }
}

/// Listen on vsock and accept the single host connection.
fn accept_host(port: u32, poll: Duration) -> Result<File> {
    let listener = socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = VsockAddr::new(libc::VMADDR_CID_ANY, port);

    // The vsock transport may still be probing right after boot.
    let mut attempt = 0;
    loop {
        match bind(listener.as_raw_fd(), &addr) {
            Ok(()) => break,
            Err(e) if attempt < 30 => {
                attempt += 1;
                warn!(attempt, error = %e, "vsock bind failed, retrying in 200ms");
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                return Err(InitError::Channel(format!(
                    "vsock bind on port {} failed: {}",
                    port, e
                )))
            }
        }
    }
    listen(&listener, Backlog::new(1)?)?;
    info!(port, "listening on vsock");

    let fd = accept(listener.as_raw_fd())?;
    // SAFETY: accept returned a new descriptor that nothing else owns.
    let stream = unsafe { OwnedFd::from_raw_fd(fd) };
    let timeout = TimeVal::new(poll.as_secs() as _, poll.subsec_micros() as _);
    setsockopt(&stream, sockopt::ReceiveTimeout, &timeout)?;
    info!("host connected");
    Ok(File::from(stream))
}
