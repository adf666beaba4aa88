//! Readiness notification behind one interface.
//!
//! Three backends:
//! - `select`: level-triggered, interest list rebuilt on every wait
//! - `poll`: level-triggered, `pollfd` table updated incrementally
//! - `edge`: edge-triggered through mio (epoll on Linux, kqueue on macOS)
//!
//! Level-triggered backends report a descriptor on every wait while it stays
//! ready. The edge backend reports it once per transition, so the caller
//! must drain all pending work for that descriptor before waiting again.

mod edge;
mod poll;
mod select;

pub use edge::EdgeMultiplexer;
pub use mio::Token;
pub use poll::PollMultiplexer;
pub use select::SelectMultiplexer;

use crate::config::Mode;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// How a backend reports readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Reported on every wait while the condition holds.
    Level,
    /// Reported once per transition into the ready state.
    Edge,
}

/// One ready descriptor from a `wait` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEvent {
    pub token: Token,
    pub readable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// A readiness notification mechanism.
pub trait Multiplexer: Send {
    /// Start watching `fd` for read readiness; events for it carry `token`.
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<()>;

    /// Stop watching `fd`.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until at least one descriptor is ready or `timeout` elapses.
    ///
    /// `events` is cleared first. A wait interrupted by a signal returns
    /// with no events.
    fn wait(&mut self, events: &mut Vec<ReadinessEvent>, timeout: Option<Duration>)
        -> io::Result<()>;

    fn trigger(&self) -> Trigger;

    fn name(&self) -> &'static str;
}

/// Build the backend for a multiplexed mode.
pub fn for_mode(mode: Mode, batch_size: usize) -> io::Result<Box<dyn Multiplexer>> {
    match mode {
        Mode::Select => Ok(Box::new(SelectMultiplexer::new())),
        Mode::Poll => Ok(Box::new(PollMultiplexer::new())),
        Mode::Epoll => Ok(Box::new(EdgeMultiplexer::new(batch_size)?)),
        Mode::Basic => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "basic mode does not use a multiplexer",
        )),
    }
}
