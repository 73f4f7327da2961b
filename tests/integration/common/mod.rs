#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::{Duration, Instant},
};

use nix::{sys::signal, unistd::Pid};
use svcmgr::host::{ProcessHost, SystemHost};

static NEXT_SLEEP: AtomicU32 = AtomicU32::new(0);

/// A `sleep` command no other test or process will be running.
pub fn unique_sleep_command() -> String {
    let offset = NEXT_SLEEP.fetch_add(1, Ordering::SeqCst);
    format!("sleep {}", 40_000 + (std::process::id() % 5_000) * 10 + offset)
}

pub fn write_registry(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("svcmgr.yaml");
    fs::write(&path, content).expect("failed to write registry");
    path
}

pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    SystemHost::new().is_alive(pid)
}

/// Best-effort cleanup of a process group left behind by a failed test.
pub fn kill_group(pid: u32) {
    let _ = signal::killpg(Pid::from_raw(pid as i32), signal::Signal::SIGKILL);
    let _ = signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGKILL);
}

/// PIDs whose command line is exactly `command`.
pub fn pids_running(command: &str) -> Vec<u32> {
    SystemHost::new()
        .list_processes()
        .expect("failed to list processes")
        .into_iter()
        .filter(|entry| !entry.zombie && entry.command_line() == command)
        .map(|entry| entry.pid)
        .collect()
}
