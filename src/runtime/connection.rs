//! Connection state machine and registry.
//!
//! A connection lives for exactly one request/response cycle:
//! `Accepted -> Ready -> Dispatched -> Closed`. The registry owns it while
//! it waits for readiness; servicing it moves it out of the registry.

use slab::Slab;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered for read interest, waiting for the peer.
    Accepted,
    /// A readiness event arrived.
    Ready,
    /// Handed to the echo handler or the worker pool.
    Dispatched,
    /// Terminal; the descriptor has been released.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
}

impl Connection {
    /// Create a new connection in the accepted state.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Readiness observed for this connection.
    pub fn mark_ready(&mut self) {
        debug_assert_eq!(self.state, ConnState::Accepted);
        self.state = ConnState::Ready;
    }

    /// Give up ownership of the socket to whoever services it.
    pub fn dispatch(mut self) -> (TcpStream, SocketAddr) {
        debug_assert_eq!(self.state, ConnState::Ready);
        self.state = ConnState::Dispatched;
        (self.stream, self.peer)
    }

    /// Release the descriptor without servicing the connection.
    pub fn close(mut self) -> ConnState {
        self.state = ConnState::Closed;
        drop(self.stream);
        self.state
    }
}

/// Registry of idle connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. The slab key doubles
/// as the multiplexer token for the connection.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Remove every connection, handing each to `f`.
    pub fn drain(&mut self, mut f: impl FnMut(usize, Connection)) {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(conn) = self.connections.try_remove(id) {
                f(id, conn);
            }
        }
    }
}
