//! Control-process runtime.
//!
//! - `listener`: bound server socket, non-blocking accept
//! - `connection`: connection state machine and slab registry
//! - `multiplexer`: select / poll / edge-triggered readiness backends
//! - `event_loop`: the accept/ready/dispatch cycle for the multiplexed modes
//! - `basic`: blocking accept straight into the worker pool

mod basic;
mod connection;
mod event_loop;
mod listener;
pub mod multiplexer;

pub use basic::BasicServer;
pub use event_loop::{EventLoop, LoopOptions};
pub use listener::{Listener, ListenerOptions};

use crate::config::{Config, Mode};
use crate::dispatch::{WorkerOptions, WorkerPool};
use std::io;
use std::sync::atomic::AtomicBool;
use tracing::info;

/// Counters for one run, read at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Most connections open at the same time. Not tracked in `basic` mode.
    pub peak_connections: usize,
    pub accepted: u64,
    pub served_inline: u64,
    pub handed_off: u64,
    /// Closed without a response: errors, hang-ups, limits.
    pub dropped: u64,
}

/// Serve `mode` until `shutdown` is set.
pub fn run(config: &Config, mode: Mode, shutdown: &AtomicBool) -> io::Result<LoopStats> {
    let multiplexed = mode != Mode::Basic;
    let listener = Listener::bind(
        &config.listen,
        &ListenerOptions {
            backlog: config.backlog,
            reuse_address: config.reuse_address,
            nonblocking: multiplexed,
            accept_timeout: (!multiplexed).then_some(config.timeout),
        },
    )?;
    info!(addr = %listener.local_addr()?, backlog = config.backlog, "Listening");

    if !multiplexed {
        let pool = spawn_pool(config)?;
        let mut server = BasicServer::new(listener, pool, config.max_frame);
        server.run(shutdown)?;
        return Ok(server.shutdown());
    }

    let mux = multiplexer::for_mode(mode, config.batch_size)?;
    let mut event_loop = EventLoop::new(
        listener,
        mux,
        LoopOptions {
            max_connections: config.max_connections,
            max_frame: config.max_frame,
            timeout: config.timeout,
        },
    )?;
    if config.worker {
        event_loop = event_loop.with_pool(spawn_pool(config)?);
    }

    event_loop.run(shutdown)?;
    Ok(event_loop.shutdown())
}

fn spawn_pool(config: &Config) -> io::Result<WorkerPool> {
    WorkerPool::spawn(&WorkerOptions {
        program: std::env::current_exe()?,
        workers: config.workers,
        max_frame: config.max_frame,
        log_level: config.log_level.clone(),
        shutdown_grace: config.shutdown_grace,
    })
}
