//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use portreeve::daemon::Daemon;
use portreeve::probe::MockProbe;

/// Starts a daemon over `root` with a fresh mock probe.
pub fn start_daemon(root: &Path) -> (Daemon, Arc<MockProbe>) {
    start_daemon_with(root, Arc::new(MockProbe::new()))
}

/// Starts a daemon over `root` with a prepared probe. Startup recovery
/// reclaims restored grants whose port is not bound, so restart tests
/// bind the ports they expect to survive before calling this.
pub fn start_daemon_with(root: &Path, probe: Arc<MockProbe>) -> (Daemon, Arc<MockProbe>) {
    let daemon = Daemon::start_with_probe(root, Arc::clone(&probe) as _).unwrap();
    (daemon, probe)
}

/// A listener record for `port` held by `pid`.
pub fn listener(port: u16, pid: u32) -> portreeve::probe::ListenerInfo {
    portreeve::probe::ListenerInfo {
        port: portreeve::Port::try_from(port).unwrap(),
        pid: Some(pid),
        process_name: "holder".to_string(),
        command: "holder --serve".to_string(),
        working_dir: None,
    }
}

/// Writes a user `config.json` into `root` before daemon start.
pub fn write_config(root: &Path, json: &str) {
    std::fs::create_dir_all(root).unwrap();
    std::fs::write(root.join("config.json"), json).unwrap();
}

/// Polls `predicate` up to `timeout`, returning whether it became true.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    predicate()
}

/// Spawns a short-lived child process and returns its PID after it has
/// exited, giving tests a PID that is guaranteed dead.
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawning `true`");
    let pid = child.id();
    child.wait().expect("waiting for `true`");
    pid
}
