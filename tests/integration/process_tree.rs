#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use common::{free_port, is_process_alive, wait_until, write_config};
use svcwarden::{
    config::load_config,
    constants::DEFAULT_MODE,
    inspector::default_inspector,
    supervisor::ProcessSupervisor,
    tree::ProcessTreeKiller,
};
use tempfile::tempdir;

fn killer() -> ProcessTreeKiller {
    ProcessTreeKiller::new(
        default_inspector(),
        Duration::from_secs(1),
        Duration::from_secs(1),
    )
}

#[test]
fn kill_tree_removes_every_descendant() {
    let inspector = default_inspector();
    let mut root = Command::new("sh")
        .args(["-c", "sleep 60 & sleep 60 & wait"])
        .stdout(Stdio::null())
        .spawn()
        .expect("failed to spawn tree");
    let pid = root.id();

    let mut children = Vec::new();
    assert!(
        wait_until(Duration::from_secs(5), || {
            children = inspector.descendants(pid).unwrap_or_default();
            children.len() >= 2
        }),
        "children never appeared"
    );

    killer().kill_tree(pid).expect("tree should die");
    let _ = root.wait();

    assert!(!is_process_alive(pid));
    for child in children {
        assert!(
            wait_until(Duration::from_secs(2), || !is_process_alive(child)),
            "child {child} survived"
        );
    }
}

#[test]
fn stubborn_root_is_forced_within_bound() {
    let mut root = Command::new("sh")
        .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
        .stdout(Stdio::null())
        .spawn()
        .expect("failed to spawn stubborn shell");
    let pid = root.id();
    std::thread::sleep(Duration::from_millis(200));

    let killer = killer();
    let started = Instant::now();
    killer.terminate(pid).expect("SIGKILL cannot be ignored");
    let elapsed = started.elapsed();
    let _ = root.wait();

    assert!(elapsed >= Duration::from_millis(900), "terminate returned before the graceful window");
    assert!(elapsed < killer.escalation_bound() + Duration::from_secs(1));
    assert!(!is_process_alive(pid));
}

#[test]
fn terminate_of_dead_pid_is_a_no_op() {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();

    let started = Instant::now();
    killer().terminate(pid).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn stopping_a_tree_service_takes_its_children_down() {
    let temp = tempdir().unwrap();
    let port = free_port();
    let yaml = format!(
        "version: \"1\"\nsettings:\n  startup_grace: 300ms\n  graceful_timeout: 1s\n  force_timeout: 1s\nservices:\n  frontend:\n    port: {port}\n    kill_tree: true\n    command: [\"sh\", \"-c\", \"sleep 60 & sleep 60 & wait\"]\n"
    );
    let path = write_config(temp.path(), &yaml);
    let config = load_config(Some(path.to_str().unwrap())).unwrap();
    let supervisor = ProcessSupervisor::new(&config).unwrap();

    assert!(supervisor.start_service("frontend", DEFAULT_MODE));
    let pid = supervisor.process_info("frontend").unwrap().pid;

    let inspector = default_inspector();
    let mut children = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        children = inspector.descendants(pid).unwrap_or_default();
        children.len() >= 2
    }));

    assert!(supervisor.stop_service("frontend"));
    assert!(!is_process_alive(pid));
    for child in children {
        assert!(
            wait_until(Duration::from_secs(2), || !is_process_alive(child)),
            "child {child} of the tree service survived"
        );
    }
}
