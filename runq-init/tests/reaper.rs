//! Zombie reaping. `waitpid(-1)` collects every child of the test process,
//! so this file holds a single test.

use std::sync::atomic::AtomicI32;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use runq_init::reaper::reap_zombies;
use runq_init::{ExitWatch, Reaper};

fn spawn_exiting(code: i32) -> i32 {
    let child = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("exit {code}"))
        .spawn()
        .unwrap();
    child.id() as i32
}

#[test]
fn reaper_collects_exited_children() {
    // Direct sweep.
    let pid = spawn_exiting(3);
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut found = None;
    while found.is_none() && Instant::now() < deadline {
        found = reap_zombies().into_iter().find(|e| e.pid.as_raw() == pid);
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(found.map(|e| e.code), Some(3));
    assert!(reap_zombies().is_empty());

    // Background thread reports exits on its channel.
    let (tx, rx) = mpsc::channel();
    let handle = Reaper::new(Duration::from_millis(20)).spawn(Some(tx)).unwrap();
    let pid = spawn_exiting(7);

    let event = loop {
        let event = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        if event.pid.as_raw() == pid {
            break event;
        }
    };
    assert_eq!(event.code, 7);

    handle.stop();
    // The stopped reaper dropped its sender.
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());

    // The supervised child is polled directly, long before a slow sweep.
    let (_tx, rx) = mpsc::channel();
    let slow = Reaper::new(Duration::from_secs(3600)).spawn(None).unwrap();
    let pid = spawn_exiting(4);
    let supervised = Arc::new(AtomicI32::new(pid));
    let started = Instant::now();
    let code = ExitWatch::new(supervised).wait(&rx, Duration::from_millis(20));
    assert_eq!(code, 4);
    assert!(started.elapsed() < Duration::from_secs(10));
    slow.stop();
}
