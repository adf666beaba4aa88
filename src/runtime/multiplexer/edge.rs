//! Edge-triggered backend on mio (epoll on Linux, kqueue on macOS).
//!
//! mio registers every source edge-triggered, so a descriptor is reported
//! once per transition into readiness.

use super::{Multiplexer, ReadinessEvent, Token, Trigger};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct EdgeMultiplexer {
    poll: Poll,
    events: Events,
}

impl EdgeMultiplexer {
    pub fn new(batch_size: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(batch_size),
        })
    }
}

impl Multiplexer for EdgeMultiplexer {
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(
        &mut self,
        events: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        events.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        events.extend(self.events.iter().map(|event| ReadinessEvent {
            token: event.token(),
            readable: event.is_readable(),
            error: event.is_error(),
            hangup: event.is_read_closed() || event.is_write_closed(),
        }));
        Ok(())
    }

    fn trigger(&self) -> Trigger {
        Trigger::Edge
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}
