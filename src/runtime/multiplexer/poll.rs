//! Level-triggered `poll(2)` backend.
//!
//! The `pollfd` table is kept between waits and edited in place; removal
//! swaps the last entry into the freed slot.

use super::{Multiplexer, ReadinessEvent, Token, Trigger};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct PollMultiplexer {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    /// Descriptor to position in `fds`/`tokens`.
    index: HashMap<RawFd, usize>,
}

impl PollMultiplexer {
    pub fn new() -> Self {
        Self {
            fds: Vec::new(),
            tokens: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl Default for PollMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Round up so a sub-millisecond timeout does not turn into a busy poll.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t.as_millis() + u128::from(t.subsec_nanos() % 1_000_000 != 0);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl Multiplexer for PollMultiplexer {
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        if self.index.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} already registered"),
            ));
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.tokens.push(token);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let idx = self
            .index
            .remove(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor not registered"))?;

        self.fds.swap_remove(idx);
        self.tokens.swap_remove(idx);
        if let Some(moved) = self.fds.get(idx) {
            self.index.insert(moved.fd, idx);
        }
        Ok(())
    }

    fn wait(
        &mut self,
        events: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        events.clear();

        // SAFETY: `fds` is a valid, exclusively borrowed array of pollfd.
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for (pfd, &token) in self.fds.iter().zip(&self.tokens) {
            let revents = pfd.revents;
            if revents == 0 {
                continue;
            }
            events.push(ReadinessEvent {
                token,
                readable: revents & libc::POLLIN != 0,
                error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                hangup: revents & libc::POLLHUP != 0,
            });
        }
        Ok(())
    }

    fn trigger(&self) -> Trigger {
        Trigger::Level
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_rounding() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(1000))), 1000);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1500))), 2);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
    }

    #[test]
    fn test_swap_remove_keeps_index() {
        let mut mux = PollMultiplexer::new();
        // Registration does not touch the descriptors, so any numbers do.
        mux.register(100, Token(0)).unwrap();
        mux.register(101, Token(1)).unwrap();
        mux.register(102, Token(2)).unwrap();

        mux.deregister(100).unwrap();
        assert_eq!(mux.fds.len(), 2);
        assert_eq!(mux.index[&102], 0);
        assert_eq!(mux.tokens[0], Token(2));

        mux.deregister(102).unwrap();
        mux.deregister(101).unwrap();
        assert!(mux.fds.is_empty());
        assert!(mux.index.is_empty());
    }
}
