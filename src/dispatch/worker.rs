//! Worker process: serve connections taken off the hand-off queue.

use super::handoff;
use crate::protocols::echo;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use socket2::Socket;
use std::io;
use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry point for `--serve-queue`: the queue arrives on standard input.
pub fn run(max_frame: usize) -> io::Result<()> {
    let queue: OwnedFd = io::stdin().as_fd().try_clone_to_owned()?;
    let queue = Socket::from(queue);

    // A terminal interrupt reaches the whole process group. Workers keep
    // draining until the control process closes the queue.
    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&interrupted))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&interrupted))?;

    let served = serve_queue(&queue, max_frame)?;
    info!(
        pid = std::process::id(),
        served,
        interrupted = interrupted.load(Ordering::Relaxed),
        "Queue closed, worker exiting"
    );
    Ok(())
}

/// Serve connections until the queue is closed. Returns how many were served.
pub fn serve_queue(queue: &Socket, max_frame: usize) -> io::Result<u64> {
    let pid = std::process::id();
    let mut served = 0;

    loop {
        let message = match handoff::recv(queue) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(served),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(pid, error = %e, "Discarding malformed hand-off");
                continue;
            }
            Err(e) => return Err(e),
        };

        // O_NONBLOCK lives on the shared open file description; the control
        // process has let go of its copy, so switching it here is safe.
        if let Err(e) = message.stream.set_nonblocking(false) {
            debug!(pid, seq = message.seq, error = %e, "Dropping hand-off");
            continue;
        }

        debug!(pid, seq = message.seq, peer = %message.peer, "Serving handed-off connection");
        let _ = echo::handle_connection(message.stream, message.peer, max_frame);
        served += 1;
    }
}
