#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{
    path::Path,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use common::{
    LISTENER_MARKER, free_port, is_process_alive, port_open, python3_available,
    spawn_listener, wait_for_port, wait_until, write_config, write_listener_script,
};
use nix::{
    sys::signal::{self, Signal},
    unistd::{self, Pid},
};
use svcwarden::{config::load_config, supervisor::ProcessSupervisor};
use tempfile::tempdir;

const WARDEN: &str = env!("CARGO_BIN_EXE_warden");
const WATCHDOG: &str = env!("CARGO_BIN_EXE_warden-watchdog");

/// Config with one listener service. Services outlive the supervisor unless the watchdog
/// removes them.
fn listener_config(dir: &Path, port: u16) -> String {
    let script = write_listener_script(dir);
    let yaml = format!(
        r#"version: "1"
settings:
  startup_grace: 300ms
  terminate_on_parent_death: false
watchdog:
  poll_interval: 50ms
  sweep_timeout: 2s
services:
  backend:
    port: {port}
    command: ["python3", "{}", "{port}", "{LISTENER_MARKER}"]
    identity:
      all: ["{LISTENER_MARKER}"]
"#,
        script.display()
    );
    write_config(dir, &yaml).to_str().unwrap().to_string()
}

fn wait_for_exit(child: &mut std::process::Child, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().expect("failed to poll watchdog") {
            return status.code();
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn spawn_watchdog(target: u32, ports: &[u16]) -> std::process::Child {
    Command::new(WATCHDOG)
        .arg(target.to_string())
        .args(ports.iter().map(u16::to_string))
        .args(["--poll-interval-ms", "50", "--sweep-timeout-ms", "3000"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn watchdog")
}

#[test]
fn dead_target_exits_immediately_without_sweeping() {
    if !python3_available() {
        eprintln!("Skipping dead_target_exits_immediately_without_sweeping: python3 not found");
        return;
    }
    let temp = tempdir().unwrap();
    let mut gone = Command::new("true").spawn().unwrap();
    let gone_pid = gone.id();
    gone.wait().unwrap();

    let port = free_port();
    let mut bystander = spawn_listener(temp.path(), port);

    let mut watchdog = spawn_watchdog(gone_pid, &[port]);
    assert_eq!(wait_for_exit(&mut watchdog, Duration::from_secs(5)), Some(0));
    assert!(port_open(port), "watchdog swept although its target was never alive");

    let _ = bystander.kill();
    let _ = bystander.wait();
}

#[test]
fn supervisor_death_triggers_port_sweep() {
    if !python3_available() {
        eprintln!("Skipping supervisor_death_triggers_port_sweep: python3 not found");
        return;
    }
    let temp = tempdir().unwrap();
    let port_a = free_port();
    let port_b = free_port();
    let mut orphan_a = spawn_listener(temp.path(), port_a);
    let mut orphan_b = spawn_listener(temp.path(), port_b);
    let (pid_a, pid_b) = (orphan_a.id(), orphan_b.id());

    let mut fake_supervisor = Command::new("sleep").arg("60").spawn().unwrap();
    let mut watchdog = spawn_watchdog(fake_supervisor.id(), &[port_a, port_b]);
    std::thread::sleep(Duration::from_millis(300));
    assert!(watchdog.try_wait().unwrap().is_none(), "watchdog exited while target lived");

    fake_supervisor.kill().unwrap();
    fake_supervisor.wait().unwrap();

    assert_eq!(wait_for_exit(&mut watchdog, Duration::from_secs(10)), Some(0));
    let _ = orphan_a.wait();
    let _ = orphan_b.wait();
    assert!(!is_process_alive(pid_a));
    assert!(!is_process_alive(pid_b));
    assert!(!port_open(port_a));
    assert!(!port_open(port_b));
}

#[test]
fn termination_signal_runs_cleanup_and_exits_zero() {
    let mut target = Command::new("sleep").arg("60").spawn().unwrap();
    let target_pid = target.id();

    let mut watchdog = spawn_watchdog(target_pid, &[]);
    std::thread::sleep(Duration::from_millis(300));
    signal::kill(Pid::from_raw(watchdog.id() as i32), Signal::SIGTERM).unwrap();

    assert_eq!(wait_for_exit(&mut watchdog, Duration::from_secs(10)), Some(0));
    assert!(wait_until(Duration::from_secs(2), || target
        .try_wait()
        .unwrap()
        .is_some()));
    assert!(!is_process_alive(target_pid));
}

#[test]
fn invalid_invocation_exits_with_one() {
    let status = Command::new(WATCHDOG)
        .arg("not-a-pid")
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));

    let status = Command::new(WATCHDOG).stderr(Stdio::null()).status().unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn supervisor_spawns_one_detached_watchdog() {
    let temp = tempdir().unwrap();
    let config = load_config(Some(listener_config(temp.path(), free_port()).as_str())).unwrap();
    let supervisor = ProcessSupervisor::observer(&config).unwrap();

    let first = supervisor.spawn_watchdog(Path::new(WATCHDOG)).unwrap();
    let second = supervisor.spawn_watchdog(Path::new(WATCHDOG)).unwrap();
    assert_eq!(first, second, "a live watchdog is reused");

    let watchdog = Pid::from_raw(first as i32);
    assert!(wait_until(Duration::from_secs(2), || {
        unistd::getsid(Some(watchdog)) == Ok(watchdog)
    }), "watchdog does not lead its own session");
    assert_ne!(unistd::getsid(None), Ok(watchdog));

    // SIGKILL: a termination request would make it clean up this test process.
    signal::kill(watchdog, Signal::SIGKILL).unwrap();
}

#[test]
fn killed_supervisor_leaves_no_listener_behind() {
    if !python3_available() {
        eprintln!("Skipping killed_supervisor_leaves_no_listener_behind: python3 not found");
        return;
    }
    let temp = tempdir().unwrap();
    let port = free_port();
    let config = listener_config(temp.path(), port);

    let mut warden = Command::new(WARDEN)
        .args(["run", "--config", &config])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn warden");
    wait_for_port(port);

    signal::kill(Pid::from_raw(warden.id() as i32), Signal::SIGKILL).unwrap();
    warden.wait().unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || !port_open(port)),
        "port {port} still open after the supervisor was killed"
    );
}
