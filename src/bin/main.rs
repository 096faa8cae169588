use std::{
    collections::BTreeMap,
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use svcwarden::{
    cli::{Cli, Commands, parse_args},
    config::{Config, load_config},
    error::SupervisorError,
    supervisor::{ProcessSupervisor, ServiceStatus},
    watchdog::locate_watchdog_binary,
};

const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Run {
            service,
            mode,
            no_watchdog,
        } => run_foreground(&config, &service, &mode, !no_watchdog)?,
        Commands::Status { service, json } => {
            let supervisor = ProcessSupervisor::observer(&config)?;
            let names = selected_services(&config, service.into_iter().collect())?;
            let statuses: BTreeMap<String, ServiceStatus> = names
                .into_iter()
                .map(|name| {
                    let status = supervisor.get_service_status(&name);
                    (name, status)
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print_status_table(&statuses);
            }
        }
        Commands::Stop { service } => {
            let supervisor = ProcessSupervisor::observer(&config)?;
            let stopped = match service {
                Some(name) => {
                    selected_services(&config, vec![name.clone()])?;
                    supervisor.stop_service(&name)
                }
                None => supervisor.stop_all(),
            };
            if !stopped {
                return Err("one or more services could not be stopped".into());
            }
        }
        Commands::Cleanup => {
            let supervisor = ProcessSupervisor::observer(&config)?;
            let terminated = supervisor.cleanup_hanging_processes();
            if terminated.is_empty() {
                println!("No hanging processes found");
            } else {
                for pid in terminated {
                    println!("Terminated PID {pid}");
                }
            }
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn selected_services(
    config: &Config,
    requested: Vec<String>,
) -> Result<Vec<String>, SupervisorError> {
    if requested.is_empty() {
        return Ok(config.services.keys().cloned().collect());
    }
    for name in &requested {
        if !config.services.contains_key(name) {
            return Err(SupervisorError::UnknownService(name.clone()));
        }
    }
    Ok(requested)
}

fn run_foreground(
    config: &Config,
    requested: &[String],
    mode: &str,
    with_watchdog: bool,
) -> Result<(), Box<dyn Error>> {
    let names = selected_services(config, requested.to_vec())?;
    let supervisor = ProcessSupervisor::new(config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    if with_watchdog {
        match locate_watchdog_binary().and_then(|path| supervisor.spawn_watchdog(&path)) {
            Ok(pid) => info!("Watchdog running as PID {pid}"),
            Err(err) => warn!("Running without a watchdog: {err}"),
        }
    }

    let mut cursors: Vec<(String, u64)> = Vec::with_capacity(names.len());
    for name in names {
        if supervisor.start_service(&name, mode) {
            info!("Service '{name}' is running");
        } else {
            error!("Service '{name}' failed to start");
        }
        cursors.push((name, 0));
    }

    while !shutdown.load(Ordering::SeqCst) {
        for (name, cursor) in cursors.iter_mut() {
            let (lines, next) = supervisor.logs_since(name, *cursor);
            for line in lines {
                println!("{name} | {line}");
            }
            *cursor = next;
        }
        thread::sleep(OUTPUT_POLL_INTERVAL);
    }

    println!("warden is shutting down... stopping services");
    if !supervisor.stop_all() {
        return Err("one or more services could not be stopped".into());
    }
    Ok(())
}

fn print_status_table(statuses: &BTreeMap<String, ServiceStatus>) {
    let width = statuses.keys().map(String::len).max().unwrap_or(7).max(7);
    println!(
        "{:<width$}  {:<8}  {:>7}  {:>5}  {:>6}  {:>8}  NOTE",
        "SERVICE", "STATUS", "PID", "PORT", "CPU%", "MEM(MB)"
    );

    for (name, status) in statuses {
        let pid = status.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into());
        let cpu = status
            .cpu_percent
            .map(|cpu| format!("{cpu:.1}"))
            .unwrap_or_else(|| "-".into());
        let memory = status
            .memory_mb
            .map(|mb| format!("{mb:.1}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<width$}  {:<8}  {:>7}  {:>5}  {:>6}  {:>8}  {}",
            name,
            status.status.to_string(),
            pid,
            status.port,
            cpu,
            memory,
            status.note.as_deref().unwrap_or("")
        );
    }
}
