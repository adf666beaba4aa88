//! `basic` mode: blocking accept, every connection goes to the worker pool.
//!
//! The listener is blocking with an accept timeout, so the loop wakes up at
//! least once per timeout to check for shutdown and reap workers.
//!
//! Connections are open only in the workers, so no peak is recorded here.

use super::listener::{is_transient_accept_error, Accepted, Listener};
use super::LoopStats;
use crate::dispatch::WorkerPool;
use crate::protocols::echo;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Back-off after an accept error that is likely to repeat (e.g. EMFILE).
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(10);

pub struct BasicServer {
    listener: Listener,
    pool: WorkerPool,
    max_frame: usize,
    stats: LoopStats,
}

impl BasicServer {
    pub fn new(listener: Listener, pool: WorkerPool, max_frame: usize) -> Self {
        Self {
            listener,
            pool,
            max_frame,
            stats: LoopStats::default(),
        }
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        info!(workers = self.pool.live_workers(), "Basic server started");

        while !shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok(Accepted::Connection(stream, peer)) => self.dispatch(stream, peer),
                Ok(Accepted::WouldBlock) => {}
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "Accept attempt abandoned");
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    thread::sleep(ACCEPT_ERROR_PAUSE);
                }
            }
            self.pool.reap();
        }
        Ok(())
    }

    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.stats.accepted += 1;

        match self.pool.dispatch(stream, peer) {
            Ok(seq) => {
                trace!(seq, peer = %peer, "Handed off connection");
                self.stats.handed_off += 1;
            }
            Err(err) => {
                warn!(
                    peer = %peer,
                    full = err.is_full(),
                    error = %err.error,
                    "Hand-off failed, serving inline"
                );
                match echo::handle_connection(err.message.stream, err.message.peer, self.max_frame)
                {
                    Ok(_) => self.stats.served_inline += 1,
                    Err(_) => self.stats.dropped += 1,
                }
            }
        }
    }

    /// Close the listener, stop the workers, return the final counters.
    pub fn shutdown(self) -> LoopStats {
        let dispatch = self.pool.shutdown();
        debug!(
            handed_off = dispatch.handed_off,
            rejected = dispatch.rejected,
            "Worker pool stopped"
        );
        self.stats
    }
}
