//! Level-triggered `select(2)` backend.
//!
//! The kernel keeps no interest state for `select`, so every wait hands it
//! the full descriptor set again.

use super::{Multiplexer, ReadinessEvent, Token, Trigger};
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct SelectMultiplexer {
    interests: BTreeMap<RawFd, Token>,
}

impl SelectMultiplexer {
    pub fn new() -> Self {
        Self {
            interests: BTreeMap::new(),
        }
    }
}

impl Default for SelectMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_set() -> libc::fd_set {
    // SAFETY: fd_set is plain data; FD_ZERO puts it in a defined state.
    unsafe {
        let mut set: libc::fd_set = mem::zeroed();
        libc::FD_ZERO(&mut set);
        set
    }
}

impl Multiplexer for SelectMultiplexer {
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} exceeds FD_SETSIZE"),
            ));
        }
        if self.interests.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} already registered"),
            ));
        }
        self.interests.insert(fd, token);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor not registered"))
    }

    fn wait(
        &mut self,
        events: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        events.clear();

        let mut read_set = empty_set();
        let mut max_fd: RawFd = -1;

        for &fd in self.interests.keys() {
            // SAFETY: fd was bounds-checked against FD_SETSIZE on register.
            unsafe { libc::FD_SET(fd, &mut read_set) };
            max_fd = max_fd.max(fd);
        }

        let mut tv = timeout.map(|t| libc::timeval {
            tv_sec: t.as_secs() as libc::time_t,
            tv_usec: t.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);

        // SAFETY: the sets and timeval live for the duration of the call.
        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                tv_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(());
        }

        for (&fd, &token) in &self.interests {
            // SAFETY: same set as above, populated by the kernel.
            if unsafe { libc::FD_ISSET(fd, &read_set) } {
                events.push(ReadinessEvent {
                    token,
                    readable: true,
                    error: false,
                    hangup: false,
                });
            }
        }
        Ok(())
    }

    fn trigger(&self) -> Trigger {
        Trigger::Level
    }

    fn name(&self) -> &'static str {
        "select"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_descriptor_beyond_setsize() {
        let mut mux = SelectMultiplexer::new();
        let fd = libc::FD_SETSIZE as RawFd;
        assert!(mux.register(fd, Token(0)).is_err());
        assert!(mux.register(-1, Token(0)).is_err());
    }

    #[test]
    fn test_empty_set_times_out() {
        let mut mux = SelectMultiplexer::new();
        let mut events = Vec::new();
        mux.wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(events.is_empty());
    }
}
