#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{
    net::TcpListener,
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use common::{
    LISTENER_MARKER, free_port, is_process_alive, port_open, python3_available,
    spawn_listener, wait_for_port, wait_for_port_closed, wait_for_process_exit, wait_until,
    write_config, write_listener_script,
};
use svcwarden::{
    config::{Config, load_config},
    constants::{DEFAULT_MODE, UNMANAGED_NOTE},
    supervisor::{ProcessSupervisor, ServiceState, StatusKind},
};
use tempfile::tempdir;

const FAST_SETTINGS: &str = r#"settings:
  startup_grace: 300ms
  graceful_timeout: 1s
  force_timeout: 1s
  restart_settle: 100ms
"#;

fn load(dir: &Path, services: &str) -> Config {
    let yaml = format!("version: \"1\"\n{FAST_SETTINGS}services:\n{services}");
    let path = write_config(dir, &yaml);
    load_config(Some(path.to_str().unwrap())).expect("config should load")
}

fn listener_service(dir: &Path, name: &str, port: u16) -> String {
    let script = write_listener_script(dir);
    format!(
        "  {name}:\n    port: {port}\n    command: [\"python3\", \"{}\", \"{port}\", \"{LISTENER_MARKER}\"]\n    identity:\n      all: [\"{LISTENER_MARKER}\"]\n",
        script.display()
    )
}

#[test]
fn start_status_stop_round_trip() {
    if !python3_available() {
        eprintln!("Skipping start_status_stop_round_trip: python3 not found");
        return;
    }
    let temp = tempdir().unwrap();
    let port = free_port();
    let config = load(temp.path(), &listener_service(temp.path(), "backend", port));
    let supervisor = ProcessSupervisor::new(&config).unwrap();

    assert!(supervisor.start_service("backend", DEFAULT_MODE));
    wait_for_port(port);

    let status = supervisor.get_service_status("backend");
    assert_eq!(status.status, StatusKind::Running);
    assert_eq!(status.note, None);
    let pid = status.pid.expect("managed service reports its pid");

    // A second start keeps the existing process.
    assert!(supervisor.start_service("backend", DEFAULT_MODE));
    assert_eq!(supervisor.tracked_services(), vec!["backend".to_string()]);
    assert_eq!(supervisor.process_info("backend").unwrap().pid, pid);

    assert!(
        wait_until(Duration::from_secs(5), || {
            supervisor
                .get_logs("backend", 10)
                .iter()
                .any(|line| line == &format!("listening on {port}"))
        }),
        "service output never reached the log buffer"
    );

    assert!(supervisor.stop_service("backend"));
    assert!(supervisor.stop_service("backend"));
    assert_eq!(supervisor.service_state("backend"), ServiceState::Stopped);
    assert!(!is_process_alive(pid));
    wait_for_port_closed(port);
    assert_eq!(
        supervisor.get_service_status("backend").status,
        StatusKind::Stopped
    );
}

#[test]
fn restart_replaces_the_process() {
    if !python3_available() {
        eprintln!("Skipping restart_replaces_the_process: python3 not found");
        return;
    }
    let temp = tempdir().unwrap();
    let port = free_port();
    let config = load(temp.path(), &listener_service(temp.path(), "backend", port));
    let supervisor = ProcessSupervisor::new(&config).unwrap();

    assert!(supervisor.start_service("backend", DEFAULT_MODE));
    let first = supervisor.process_info("backend").unwrap().pid;

    assert!(supervisor.restart_service("backend", DEFAULT_MODE));
    let second = supervisor.process_info("backend").unwrap().pid;
    assert_ne!(first, second);
    assert!(!is_process_alive(first));

    assert!(supervisor.stop_service("backend"));
}

#[test]
fn leftover_from_previous_run_is_cleaned_at_construction() {
    if !python3_available() {
        eprintln!("Skipping leftover_from_previous_run_is_cleaned_at_construction: python3 not found");
        return;
    }
    let temp = tempdir().unwrap();
    let port = free_port();
    let mut leaked = spawn_listener(temp.path(), port);
    let leaked_pid = leaked.id();

    let config = load(temp.path(), &listener_service(temp.path(), "backend", port));
    let supervisor = ProcessSupervisor::new(&config).unwrap();
    let _ = leaked.wait();

    assert!(!is_process_alive(leaked_pid));
    assert!(!port_open(port));
    assert!(
        supervisor
            .get_logs("backend", 10)
            .iter()
            .any(|line| line.contains(&format!("terminating leftover PID {leaked_pid}")))
    );

    // A fresh instance can bind the port again.
    assert!(supervisor.start_service("backend", DEFAULT_MODE));
    wait_for_port(port);
    assert!(supervisor.stop_service("backend"));
}

#[test]
fn untracked_instance_is_adopted_by_stop() {
    if !python3_available() {
        eprintln!("Skipping untracked_instance_is_adopted_by_stop: python3 not found");
        return;
    }
    let temp = tempdir().unwrap();
    let port = free_port();
    let config = load(temp.path(), &listener_service(temp.path(), "backend", port));
    let supervisor = ProcessSupervisor::observer(&config).unwrap();

    let mut leaked = spawn_listener(temp.path(), port);
    let leaked_pid = leaked.id();

    let status = supervisor.get_service_status("backend");
    assert_eq!(status.status, StatusKind::Running);
    assert_eq!(status.note.as_deref(), Some(UNMANAGED_NOTE));

    assert!(supervisor.stop_service("backend"));
    let _ = leaked.wait();
    wait_for_process_exit(leaked_pid);
}

#[test]
fn foreign_port_owner_is_never_killed() {
    let temp = tempdir().unwrap();
    let foreign = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = foreign.local_addr().unwrap().port();

    let config = load(
        temp.path(),
        &format!(
            "  backend:\n    port: {port}\n    command: [\"sleep\", \"30\"]\n    identity:\n      all: [\"uvicorn\"]\n"
        ),
    );
    let supervisor = ProcessSupervisor::new(&config).unwrap();

    let status = supervisor.get_service_status("backend");
    assert_eq!(status.status, StatusKind::Running);
    assert_eq!(status.note.as_deref(), Some(UNMANAGED_NOTE));

    assert!(supervisor.stop_service("backend"));
    assert!(supervisor.cleanup_hanging_processes().is_empty());
    assert!(port_open(port));
    drop(foreign);
}

#[test]
fn immediate_exit_reports_failure_with_diagnosis() {
    let temp = tempdir().unwrap();
    let port = free_port();
    let config = load(
        temp.path(),
        &format!(
            "  rag:\n    port: {port}\n    command: [\"sh\", \"-c\", \"echo 'ImportError: cannot import name faiss' >&2; exit 1\"]\n    identity:\n      all: [\"rag\"]\n  ghost:\n    port: {}\n    command: [\"/no/such/program\"]\n",
            free_port()
        ),
    );
    let supervisor = ProcessSupervisor::new(&config).unwrap();

    assert!(!supervisor.start_service("rag", DEFAULT_MODE));
    assert_eq!(supervisor.service_state("rag"), ServiceState::Failed);
    assert!(supervisor.process_info("rag").is_none());
    let logs = supervisor.get_logs("rag", 100);
    assert!(logs.iter().any(|line| line.contains("ImportError")));
    assert!(
        logs.iter()
            .any(|line| line.contains("a required module is not installed"))
    );

    assert!(!supervisor.start_service("ghost", DEFAULT_MODE));
    assert_eq!(supervisor.service_state("ghost"), ServiceState::Failed);
    assert!(!supervisor.get_logs("ghost", 10).is_empty());
}

#[test]
fn log_buffer_stays_bounded_under_heavy_output() {
    let temp = tempdir().unwrap();
    let port = free_port();
    let yaml = format!(
        "version: \"1\"\nsettings:\n  startup_grace: 200ms\n  graceful_timeout: 1s\n  force_timeout: 1s\n  log_capacity: 100\nservices:\n  chatty:\n    port: {port}\n    command: [\"sh\", \"-c\", \"seq 1 3000; sleep 30\"]\n"
    );
    let path = write_config(temp.path(), &yaml);
    let config = load_config(Some(path.to_str().unwrap())).unwrap();
    let supervisor = ProcessSupervisor::new(&config).unwrap();

    assert!(supervisor.start_service("chatty", DEFAULT_MODE));
    assert!(
        wait_until(Duration::from_secs(10), || {
            supervisor
                .get_logs("chatty", 1)
                .last()
                .is_some_and(|line| line == "3000")
        }),
        "reader never caught up with the output"
    );

    let logs = supervisor.get_logs("chatty", 10_000);
    assert_eq!(logs.len(), 100);
    assert_eq!(logs.first().map(String::as_str), Some("2901"));
    assert_eq!(supervisor.get_logs("chatty", 5).len(), 5);

    assert!(supervisor.stop_service("chatty"));
}

#[test]
fn status_queries_do_not_wait_for_a_slow_stop() {
    let temp = tempdir().unwrap();
    let port = free_port();
    let yaml = format!(
        "version: \"1\"\nsettings:\n  startup_grace: 200ms\n  graceful_timeout: 2s\n  force_timeout: 1s\nservices:\n  stubborn:\n    port: {port}\n    kill_tree: true\n    command: [\"sh\", \"-c\", \"trap '' TERM; while true; do sleep 1; done\"]\n"
    );
    let path = write_config(temp.path(), &yaml);
    let config = load_config(Some(path.to_str().unwrap())).unwrap();
    let supervisor = Arc::new(ProcessSupervisor::new(&config).unwrap());

    assert!(supervisor.start_service("stubborn", DEFAULT_MODE));
    let pid = supervisor.process_info("stubborn").unwrap().pid;

    let stopper = {
        let supervisor = supervisor.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let stopped = supervisor.stop_service("stubborn");
            (stopped, started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(200));
    let started = Instant::now();
    let _ = supervisor.get_service_status("stubborn");
    let _ = supervisor.get_logs("stubborn", 10);
    assert!(started.elapsed() < Duration::from_millis(900));

    let (stopped, elapsed) = stopper.join().unwrap();
    assert!(stopped);
    assert!(elapsed < Duration::from_secs(3) + Duration::from_secs(2));
    assert!(!is_process_alive(pid));
}

#[test]
fn service_outlives_the_thread_that_started_it() {
    let temp = tempdir().unwrap();
    let port = free_port();
    let config = load(
        temp.path(),
        &format!("  sleeper:\n    port: {port}\n    command: [\"sleep\", \"30\"]\n"),
    );
    let supervisor = Arc::new(ProcessSupervisor::new(&config).unwrap());

    let started = {
        let supervisor = supervisor.clone();
        thread::spawn(move || supervisor.start_service("sleeper", DEFAULT_MODE))
            .join()
            .unwrap()
    };
    assert!(started);
    let pid = supervisor.process_info("sleeper").unwrap().pid;

    thread::sleep(Duration::from_millis(500));
    assert!(is_process_alive(pid), "service died with the starting thread");
    assert_eq!(
        supervisor.get_service_status("sleeper").status,
        StatusKind::Running
    );
    assert_eq!(supervisor.service_state("sleeper"), ServiceState::Running);

    assert!(supervisor.stop_service("sleeper"));
    assert!(!is_process_alive(pid));
}

#[test]
fn service_that_exits_on_its_own_is_reconciled() {
    let temp = tempdir().unwrap();
    let port = free_port();
    let config = load(
        temp.path(),
        &format!("  oneshot:\n    port: {port}\n    command: [\"sh\", \"-c\", \"sleep 1\"]\n"),
    );
    let supervisor = ProcessSupervisor::new(&config).unwrap();

    assert!(supervisor.start_service("oneshot", DEFAULT_MODE));
    assert_eq!(supervisor.tracked_services(), vec!["oneshot".to_string()]);

    assert!(
        wait_until(Duration::from_secs(5), || {
            supervisor.service_state("oneshot") == ServiceState::Stopped
        }),
        "exited service still reported as {}",
        supervisor.service_state("oneshot")
    );
    assert!(supervisor.tracked_services().is_empty());
    assert!(supervisor.process_info("oneshot").is_none());
    assert_eq!(
        supervisor.get_service_status("oneshot").status,
        StatusKind::Stopped
    );
    assert!(
        supervisor
            .get_logs("oneshot", 10)
            .iter()
            .any(|line| line.contains("exited"))
    );

    assert!(supervisor.start_service("oneshot", DEFAULT_MODE));
    assert_eq!(supervisor.service_state("oneshot"), ServiceState::Running);
    assert!(supervisor.stop_service("oneshot"));
}

#[test]
fn stop_does_not_wait_for_a_descendant_holding_the_output_pipe() {
    let temp = tempdir().unwrap();
    let port = free_port();
    let yaml = format!(
        "version: \"1\"\nsettings:\n  startup_grace: 200ms\n  graceful_timeout: 200ms\n  force_timeout: 200ms\nservices:\n  leaky:\n    port: {port}\n    command: [\"sh\", \"-c\", \"trap '' TERM; sleep 300 & echo \\\"holder $!\\\"; exec sleep 300\"]\n"
    );
    let path = write_config(temp.path(), &yaml);
    let config = load_config(Some(path.to_str().unwrap())).unwrap();
    let supervisor = ProcessSupervisor::new(&config).unwrap();

    assert!(supervisor.start_service("leaky", DEFAULT_MODE));
    let mut holder = None;
    assert!(wait_until(Duration::from_secs(5), || {
        holder = supervisor
            .get_logs("leaky", 10)
            .iter()
            .find_map(|line| line.strip_prefix("holder ")?.trim().parse::<u32>().ok());
        holder.is_some()
    }));
    let holder = holder.unwrap();

    let started = Instant::now();
    assert!(supervisor.stop_service("leaky"));
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(400) + Duration::from_millis(200),
        "stop took {elapsed:?}"
    );

    assert!(is_process_alive(holder));
    let _ = std::process::Command::new("kill")
        .args(["-9", &holder.to_string()])
        .status();
}
