use clap::{Parser, error::ErrorKind};
use std::{
    panic::{self, AssertUnwindSafe},
    process,
    sync::atomic::Ordering,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use svcwarden::{
    cli::LogLevelArg,
    config::WatchdogSettings,
    constants::{WATCHDOG_POLL_INTERVAL, WATCHDOG_SWEEP_TIMEOUT},
    inspector::default_inspector,
    watchdog::Watchdog,
};

/// Kills whatever still holds the given ports once the supervisor is gone.
#[derive(Parser)]
#[command(name = "warden-watchdog", version)]
struct Args {
    /// PID of the supervisor to watch.
    supervisor_pid: u32,

    /// Ports to sweep during cleanup.
    ports: Vec<u16>,

    /// Liveness poll interval in milliseconds.
    #[arg(long, default_value_t = WATCHDOG_POLL_INTERVAL.as_millis() as u64)]
    poll_interval_ms: u64,

    /// Upper bound for the parallel sweep in milliseconds.
    #[arg(long, default_value_t = WATCHDOG_SWEEP_TIMEOUT.as_millis() as u64)]
    sweep_timeout_ms: u64,

    /// Override the logging verbosity.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<LogLevelArg>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };

    init_logging(args.log_level);

    let settings = WatchdogSettings {
        poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
        sweep_timeout: Duration::from_millis(args.sweep_timeout_ms),
    };
    let mut watchdog = Watchdog::new(
        args.supervisor_pid,
        &args.ports,
        &settings,
        default_inspector(),
    );

    let shutdown = watchdog.shutdown_flag();
    if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
        warn!("Termination signals will not trigger cleanup: {err}");
    }

    match panic::catch_unwind(AssertUnwindSafe(|| watchdog.run())) {
        Ok(Some(report)) => info!(
            "Watchdog exiting after sweeping {} port(s), {} process(es) killed",
            args.ports.len(),
            report.killed.len()
        ),
        Ok(None) => {}
        Err(_) => error!("Cleanup was cut short by an internal error"),
    }
    process::exit(0);
}

fn init_logging(level: Option<LogLevelArg>) {
    let filter = if let Some(level) = level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
