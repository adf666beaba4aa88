//! echo-dispatch: a readiness-driven TCP echo server
//!
//! The control process accepts connections and waits for them to become
//! readable using one of several strategies:
//! - `basic`: blocking accept, every connection handed to a worker
//! - `select`: level-triggered, interest list rebuilt per wait
//! - `poll`: level-triggered, incremental interest table
//! - `epoll`: edge-triggered (epoll/kqueue through mio)
//!
//! Ready connections are echoed inline or, with `--worker`, handed to a pool
//! of worker processes over a descriptor-passing queue.

mod config;
mod dispatch;
mod protocols;
mod runtime;

use config::{Config, Mode, Role};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("echo-dispatch: {e}");
            ExitCode::FAILURE
        }
    }
}

fn try_main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.role {
        Role::Worker => {
            dispatch::worker::run(config.max_frame)?;
            Ok(())
        }
        Role::Control(mode) => run_control(&config, mode),
    }
}

fn run_control(config: &Config, mode: Mode) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    info!(
        mode = ?mode,
        listen = %config.listen,
        backlog = config.backlog,
        timeout_ms = config.timeout.as_millis() as u64,
        worker = config.worker || mode == Mode::Basic,
        workers = config.workers,
        "Starting echo-dispatch"
    );

    let stats = runtime::run(config, mode, &shutdown)?;

    info!(
        accepted = stats.accepted,
        served_inline = stats.served_inline,
        handed_off = stats.handed_off,
        dropped = stats.dropped,
        "Shutting down"
    );
    if mode != Mode::Basic {
        info!("Max. number of connections: {}", stats.peak_connections);
    }
    Ok(())
}
