//! Fixed pool of worker processes behind the hand-off queue.

use super::handoff::{self, HandoffMessage, SendError};
use socket2::Socket;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How to launch the pool.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Executable re-run with `--serve-queue`.
    pub program: PathBuf,
    pub workers: usize,
    pub max_frame: usize,
    pub log_level: String,
    /// Time workers get to drain the queue after it is closed.
    pub shutdown_grace: Duration,
}

struct Worker {
    id: usize,
    child: Child,
}

/// Hand-off counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub handed_off: u64,
    pub rejected: u64,
}

/// Control side of the hand-off queue plus the worker processes reading it.
pub struct WorkerPool {
    queue: Option<Socket>,
    workers: Vec<Worker>,
    next_seq: u64,
    stats: DispatchStats,
    shutdown_grace: Duration,
}

impl WorkerPool {
    /// Start `options.workers` processes, each sharing the receiving end of
    /// one queue on its standard input.
    pub fn spawn(options: &WorkerOptions) -> io::Result<Self> {
        let (control, worker_end) = handoff::queue()?;
        let mut pool = Self::with_queue(control, options.shutdown_grace);

        for id in 0..options.workers {
            let queue: OwnedFd = worker_end.try_clone()?.into();
            let child = Command::new(&options.program)
                .arg("--serve-queue")
                .arg("--max-frame")
                .arg(options.max_frame.to_string())
                .arg("--log-level")
                .arg(&options.log_level)
                .stdin(Stdio::from(queue))
                .spawn()?;

            info!(worker = id, pid = child.id(), "Worker started");
            pool.workers.push(Worker { id, child });
        }

        // Only the workers may hold the receiving end, so the queue reads as
        // closed once they are all gone.
        drop(worker_end);
        Ok(pool)
    }

    /// A pool over an existing queue whose consumers are managed elsewhere.
    pub fn with_queue(control: Socket, shutdown_grace: Duration) -> Self {
        Self {
            queue: Some(control),
            workers: Vec::new(),
            next_seq: 0,
            stats: DispatchStats::default(),
            shutdown_grace,
        }
    }

    /// Hand a ready connection to the pool.
    ///
    /// On failure the connection comes back inside the error and remains the
    /// caller's to serve or close.
    pub fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<u64, SendError> {
        let seq = self.next_seq;
        let message = HandoffMessage { seq, peer, stream };

        let Some(queue) = self.queue.as_ref() else {
            self.stats.rejected += 1;
            return Err(SendError {
                message,
                error: io::Error::new(io::ErrorKind::BrokenPipe, "hand-off queue closed"),
            });
        };

        match handoff::send(queue, message) {
            Ok(()) => {
                self.next_seq += 1;
                self.stats.handed_off += 1;
                Ok(seq)
            }
            Err(err) => {
                self.stats.rejected += 1;
                Err(err)
            }
        }
    }

    /// Collect workers that have exited. Returns how many exited.
    ///
    /// Nothing restarts a dead worker. Once all are gone the queue reads as
    /// closed and every dispatch fails back to the caller.
    pub fn reap(&mut self) -> usize {
        let before = self.workers.len();
        self.workers.retain_mut(|worker| match worker.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                error!(worker = worker.id, pid = worker.child.id(), %status, "Worker exited");
                false
            }
            Err(e) => {
                warn!(worker = worker.id, error = %e, "Failed to poll worker");
                true
            }
        });

        let exited = before - self.workers.len();
        if exited > 0 && self.workers.is_empty() {
            error!("No workers left, connections will be served inline");
        }
        exited
    }

    /// Worker processes still running.
    pub fn live_workers(&self) -> usize {
        self.workers.len()
    }

    #[cfg(test)]
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Close the queue, let workers drain it, then kill whatever is left.
    pub fn shutdown(mut self) -> DispatchStats {
        self.queue = None;

        let deadline = Instant::now() + self.shutdown_grace;
        while Instant::now() < deadline && self.reap_clean() > 0 {
            thread::sleep(Duration::from_millis(10));
        }
        self.kill_remaining();
        self.stats
    }

    /// Like `reap`, but a worker leaving on a closed queue is expected.
    fn reap_clean(&mut self) -> usize {
        self.workers.retain_mut(|worker| match worker.child.try_wait() {
            Ok(Some(status)) => {
                debug!(worker = worker.id, %status, "Worker finished");
                false
            }
            Ok(None) | Err(_) => true,
        });
        self.workers.len()
    }

    fn kill_remaining(&mut self) {
        for mut worker in self.workers.drain(..) {
            warn!(worker = worker.id, pid = worker.child.id(), "Terminating worker");
            let _ = worker.child.kill();
            let _ = worker.child.wait();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.kill_remaining();
    }
}
