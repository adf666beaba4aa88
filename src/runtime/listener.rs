//! Listening socket setup and non-blocking accept.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Listener options resolved from configuration.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub backlog: u32,
    pub reuse_address: bool,
    /// Non-blocking accept for the multiplexed modes.
    pub nonblocking: bool,
    /// Upper bound on a blocking accept, so the caller can check for shutdown.
    pub accept_timeout: Option<Duration>,
}

/// Outcome of a single accept attempt.
#[derive(Debug)]
pub enum Accepted {
    Connection(TcpStream, SocketAddr),
    /// Nothing pending (or the accept timeout elapsed).
    WouldBlock,
}

/// The bound, listening server socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    nonblocking: bool,
    /// SO_RCVTIMEO is set on the listener and must not leak to connections.
    timed_accept: bool,
}

impl Listener {
    /// Bind and listen. Any failure here is fatal for the server.
    pub fn bind(addr: &str, options: &ListenerOptions) -> io::Result<Self> {
        let addr = resolve(addr)?;
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        if options.reuse_address {
            socket.set_reuse_address(true)?;
        }
        socket.set_nonblocking(options.nonblocking)?;
        if let Some(timeout) = options.accept_timeout {
            // A zero SO_RCVTIMEO blocks forever.
            if timeout.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "accept timeout must be non-zero",
                ));
            }
            // SO_RCVTIMEO bounds accept() as well as recv()
            socket.set_read_timeout(Some(timeout))?;
        }
        socket.bind(&addr.into())?;
        socket.listen(backlog(options.backlog))?;

        Ok(Self {
            inner: socket.into(),
            nonblocking: options.nonblocking,
            timed_accept: options.accept_timeout.is_some(),
        })
    }

    /// Accept one pending connection.
    ///
    /// Accepted streams inherit the listener's blocking mode explicitly, since
    /// accept(2) does not carry O_NONBLOCK over on Linux. The accept timeout
    /// is inherited by the kernel, so it is cleared: connections have no
    /// read deadline.
    pub fn accept(&self) -> io::Result<Accepted> {
        match self.inner.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(self.nonblocking)?;
                if self.timed_accept {
                    stream.set_read_timeout(None)?;
                }
                Ok(Accepted::Connection(stream, peer))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Accepted::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(Accepted::WouldBlock),
            Err(e) => Err(e),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Errors that only spoil one accept attempt; the listener stays usable.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ECONNABORTED) | Some(libc::EINTR) | Some(libc::EPROTO)
    ) || matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
    )
}

fn backlog(configured: u32) -> i32 {
    if configured == 0 {
        libc::SOMAXCONN
    } else {
        configured.min(i32::MAX as u32) as i32
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {addr}"),
        )
    })
}
