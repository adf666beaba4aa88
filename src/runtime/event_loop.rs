//! Readiness event loop.
//!
//! One control thread owns the listener, the connection registry and the
//! multiplexer. The only place it blocks is `Multiplexer::wait`.
//!
//! Per wait cycle:
//! 1. listener ready: accept (until would-block under edge triggering, once
//!    under level triggering) and register each connection for reads
//! 2. connection ready: deregister, take it out of the registry, then echo
//!    inline or hand it to the worker pool
//! 3. error or hang-up with nothing to read: close without servicing

use super::connection::{Connection, ConnectionRegistry};
use super::listener::{is_transient_accept_error, Accepted, Listener};
use super::multiplexer::{Multiplexer, ReadinessEvent, Token, Trigger};
use super::LoopStats;
use crate::dispatch::WorkerPool;
use crate::protocols::echo;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Registry keys are dense from zero; mio keeps `usize::MAX` for itself.
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// Transient accept failures tolerated per listener event before deferring
/// the rest of the backlog to the next turn.
const MAX_TRANSIENT_ACCEPT_ERRORS: usize = 8;

/// Tunables for the loop.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub max_connections: usize,
    pub max_frame: usize,
    /// Pacing for `wait`; not a per-connection deadline.
    pub timeout: Duration,
}

pub struct EventLoop {
    listener: Listener,
    registry: ConnectionRegistry,
    mux: Box<dyn Multiplexer>,
    pool: Option<WorkerPool>,
    events: Vec<ReadinessEvent>,
    accepted: Vec<(TcpStream, SocketAddr)>,
    /// The edge backend will not report the listener again until it has been
    /// drained, so an interrupted drain is resumed on the next turn.
    accept_pending: bool,
    options: LoopOptions,
    stats: LoopStats,
}

impl EventLoop {
    /// Take ownership of the listener and start watching it.
    pub fn new(
        listener: Listener,
        mut mux: Box<dyn Multiplexer>,
        options: LoopOptions,
    ) -> io::Result<Self> {
        mux.register(listener.fd(), LISTENER_TOKEN)?;

        Ok(Self {
            listener,
            registry: ConnectionRegistry::new(options.max_connections),
            mux,
            pool: None,
            events: Vec::new(),
            accepted: Vec::new(),
            accept_pending: false,
            options,
            stats: LoopStats::default(),
        })
    }

    /// Hand ready connections to `pool` instead of serving them inline.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Connections accepted and still waiting for their request.
    #[cfg(test)]
    pub fn open_connections(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Run until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        info!(
            backend = self.mux.name(),
            trigger = ?self.mux.trigger(),
            timeout_ms = self.options.timeout.as_millis() as u64,
            max_connections = self.registry.capacity(),
            worker = self.pool.is_some(),
            "Event loop started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            self.turn()?;
        }
        Ok(())
    }

    /// One wait plus the handling of everything it reported.
    pub fn turn(&mut self) -> io::Result<()> {
        let mut events = mem::take(&mut self.events);
        self.mux.wait(&mut events, Some(self.options.timeout))?;

        if self.accept_pending && !events.iter().any(|e| e.token == LISTENER_TOKEN) {
            self.accept_ready();
        }
        for event in &events {
            match event.token {
                LISTENER_TOKEN => self.accept_ready(),
                Token(conn_id) => self.connection_ready(conn_id, event),
            }
        }
        self.events = events;

        if let Some(pool) = self.pool.as_mut() {
            pool.reap();
        }
        Ok(())
    }

    fn accept_ready(&mut self) {
        let drain = self.mux.trigger() == Trigger::Edge;
        let mut accepted = mem::take(&mut self.accepted);

        let listener = &self.listener;
        self.accept_pending = accept_batch(|| listener.accept(), drain, &mut accepted);
        for (stream, peer) in accepted.drain(..) {
            self.admit(stream, peer);
        }
        self.accepted = accepted;
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.stats.accepted += 1;
        let fd = stream.as_raw_fd();

        let conn_id = match self.registry.insert(Connection::new(stream, peer)) {
            Ok(conn_id) => conn_id,
            Err(conn) => {
                warn!(peer = %peer, limit = self.registry.capacity(), "Connection limit reached");
                conn.close();
                self.stats.dropped += 1;
                return;
            }
        };

        if let Err(e) = self.mux.register(fd, Token(conn_id)) {
            debug!(conn_id, peer = %peer, error = %e, "Registration failed");
            if let Some(conn) = self.registry.remove(conn_id) {
                conn.close();
            }
            self.stats.dropped += 1;
            return;
        }

        self.stats.peak_connections = self.stats.peak_connections.max(self.registry.len());
        trace!(conn_id, peer = %peer, "Accepted connection");
    }

    fn connection_ready(&mut self, conn_id: usize, event: &ReadinessEvent) {
        // Stale events for a connection closed earlier in the same batch.
        let Some(fd) = self.registry.get(conn_id).map(Connection::fd) else {
            return;
        };

        // Deregister before servicing so an edge backend cannot deliver the
        // same connection twice.
        if let Err(e) = self.mux.deregister(fd) {
            debug!(conn_id, error = %e, "Deregistration failed");
        }
        let Some(mut conn) = self.registry.remove(conn_id) else {
            return;
        };

        if !event.readable {
            debug!(
                conn_id,
                peer = %conn.peer(),
                error = event.error,
                hangup = event.hangup,
                "Closing connection"
            );
            conn.close();
            self.stats.dropped += 1;
            return;
        }

        conn.mark_ready();
        let (stream, peer) = conn.dispatch();

        let Some(pool) = self.pool.as_mut() else {
            self.serve_inline(stream, peer);
            return;
        };

        match pool.dispatch(stream, peer) {
            Ok(seq) => {
                trace!(conn_id, seq, peer = %peer, "Handed off connection");
                self.stats.handed_off += 1;
            }
            Err(err) => {
                warn!(
                    peer = %peer,
                    full = err.is_full(),
                    error = %err.error,
                    "Hand-off failed, serving inline"
                );
                self.serve_inline(err.message.stream, err.message.peer);
            }
        }
    }

    fn serve_inline(&mut self, stream: TcpStream, peer: SocketAddr) {
        match echo::handle_connection(stream, peer, self.options.max_frame) {
            Ok(_) => self.stats.served_inline += 1,
            Err(_) => self.stats.dropped += 1,
        }
    }

    /// Close the listener and every open connection, stop the workers, and
    /// return the final counters.
    pub fn shutdown(mut self) -> LoopStats {
        let _ = self.mux.deregister(self.listener.fd());

        let mux = &mut self.mux;
        let mut abandoned = 0;
        self.registry.drain(|_, conn| {
            let _ = mux.deregister(conn.fd());
            conn.close();
            abandoned += 1;
        });
        if abandoned > 0 {
            debug!(abandoned, "Dropped in-flight connections");
        }

        if let Some(pool) = self.pool.take() {
            let dispatch = pool.shutdown();
            debug!(
                handed_off = dispatch.handed_off,
                rejected = dispatch.rejected,
                "Worker pool stopped"
            );
        }
        self.stats
    }
}

/// Run the accept attempts for one listener event, collecting connections
/// into `accepted`.
///
/// Level triggering makes a single attempt; the listener is reported again on
/// the next wait. Edge triggering drains until would-block. Returns `true`
/// when a drain stopped before would-block (repeated transient errors, or a
/// hard error such as EMFILE) and must be resumed without a new event.
fn accept_batch(
    mut accept: impl FnMut() -> io::Result<Accepted>,
    drain: bool,
    accepted: &mut Vec<(TcpStream, SocketAddr)>,
) -> bool {
    let mut transient = 0;
    loop {
        match accept() {
            Ok(Accepted::Connection(stream, peer)) => accepted.push((stream, peer)),
            Ok(Accepted::WouldBlock) => return false,
            Err(e) if is_transient_accept_error(&e) => {
                debug!(error = %e, "Accept attempt abandoned");
                transient += 1;
                if drain && transient >= MAX_TRANSIENT_ACCEPT_ERRORS {
                    debug!(transient, "Deferring accept to the next turn");
                    return true;
                }
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                return drain;
            }
        }

        if !drain {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::dispatch::{handoff, worker};
    use crate::runtime::listener::ListenerOptions;
    use crate::runtime::multiplexer;
    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    const MODES: [Mode; 3] = [Mode::Select, Mode::Poll, Mode::Epoll];

    fn event_loop(mode: Mode) -> EventLoop {
        let listener = Listener::bind(
            "127.0.0.1:0",
            &ListenerOptions {
                backlog: 0,
                reuse_address: true,
                nonblocking: true,
                accept_timeout: None,
            },
        )
        .unwrap();
        let mux = multiplexer::for_mode(mode, 256).unwrap();
        EventLoop::new(
            listener,
            mux,
            LoopOptions {
                max_connections: 1024,
                max_frame: echo::MAX_FRAME,
                timeout: Duration::from_millis(20),
            },
        )
        .unwrap()
    }

    struct Running {
        addr: SocketAddr,
        shutdown: Arc<AtomicBool>,
        handle: JoinHandle<LoopStats>,
    }

    impl Running {
        fn start(mut event_loop: EventLoop) -> Self {
            let addr = event_loop.local_addr().unwrap();
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&shutdown);
            let handle = thread::spawn(move || {
                event_loop.run(&flag).unwrap();
                event_loop.shutdown()
            });
            Self {
                addr,
                shutdown,
                handle,
            }
        }

        fn stop(self) -> LoopStats {
            self.shutdown.store(true, Ordering::Relaxed);
            self.handle.join().unwrap()
        }
    }

    fn round_trip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(payload).unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        reply
    }

    #[test]
    fn test_echo_all_sizes() {
        for mode in MODES {
            let running = Running::start(event_loop(mode));
            for len in 1..=echo::MAX_FRAME {
                let payload: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
                assert_eq!(round_trip(running.addr, &payload), payload, "{mode:?} len {len}");
            }
            let stats = running.stop();
            assert_eq!(stats.accepted, echo::MAX_FRAME as u64);
            assert_eq!(stats.served_inline, echo::MAX_FRAME as u64);
        }
    }

    #[test]
    fn test_concurrent_clients_get_their_own_payload() {
        for mode in MODES {
            let running = Running::start(event_loop(mode));
            let addr = running.addr;

            let clients: Vec<_> = (0..20)
                .map(|i| {
                    thread::spawn(move || {
                        let payload = format!("client-{i:02}-{mode:?}");
                        (payload.clone(), round_trip(addr, payload.as_bytes()))
                    })
                })
                .collect();

            for client in clients {
                let (sent, received) = client.join().unwrap();
                assert_eq!(received, sent.as_bytes());
            }
            running.stop();
        }
    }

    #[test]
    fn test_peak_counts_simultaneous_connections() {
        for mode in MODES {
            let running = Running::start(event_loop(mode));

            let mut clients: Vec<TcpStream> = (0..50)
                .map(|_| TcpStream::connect(running.addr).unwrap())
                .collect();
            // Several wait cycles so every pending connection is accepted.
            thread::sleep(Duration::from_millis(500));

            for (i, client) in clients.iter_mut().enumerate() {
                let payload = format!("{i}");
                client.write_all(payload.as_bytes()).unwrap();
                let mut reply = Vec::new();
                client.read_to_end(&mut reply).unwrap();
                assert_eq!(reply, payload.as_bytes());
            }

            let stats = running.stop();
            assert!(stats.peak_connections >= 50, "{mode:?}: {stats:?}");
            assert_eq!(stats.accepted, 50);
        }
    }

    #[test]
    fn test_edge_trigger_drains_burst_in_one_turn() {
        let mut event_loop = event_loop(Mode::Epoll);
        let addr = event_loop.local_addr().unwrap();

        let _clients: Vec<TcpStream> = (0..16).map(|_| TcpStream::connect(addr).unwrap()).collect();
        thread::sleep(Duration::from_millis(50));

        event_loop.turn().unwrap();
        assert_eq!(event_loop.open_connections(), 16);
        assert_eq!(event_loop.stats().peak_connections, 16);
    }

    #[test]
    fn test_level_trigger_accepts_once_per_turn() {
        for mode in [Mode::Select, Mode::Poll] {
            let mut event_loop = event_loop(mode);
            let addr = event_loop.local_addr().unwrap();

            let _clients: Vec<TcpStream> =
                (0..4).map(|_| TcpStream::connect(addr).unwrap()).collect();
            thread::sleep(Duration::from_millis(50));

            event_loop.turn().unwrap();
            assert_eq!(event_loop.open_connections(), 1, "{mode:?}");

            // The listener is still ready, so the next turns pick up the rest.
            for _ in 0..3 {
                event_loop.turn().unwrap();
            }
            assert_eq!(event_loop.open_connections(), 4, "{mode:?}");
        }
    }

    #[test]
    fn test_empty_request_completes_cleanly() {
        for mode in MODES {
            let running = Running::start(event_loop(mode));

            let mut silent = TcpStream::connect(running.addr).unwrap();
            silent.shutdown(Shutdown::Write).unwrap();
            let mut reply = Vec::new();
            silent.read_to_end(&mut reply).unwrap();
            assert!(reply.is_empty());

            assert_eq!(round_trip(running.addr, b"after"), b"after");
            let stats = running.stop();
            assert_eq!(stats.dropped, 0, "{mode:?}: {stats:?}");
        }
    }

    #[test]
    fn test_reset_before_data_does_not_stop_loop() {
        for mode in MODES {
            let running = Running::start(event_loop(mode));

            for _ in 0..5 {
                let abrupt = TcpStream::connect(running.addr).unwrap();
                socket2::SockRef::from(&abrupt)
                    .set_linger(Some(Duration::ZERO))
                    .unwrap();
                drop(abrupt);
            }
            thread::sleep(Duration::from_millis(100));

            assert_eq!(round_trip(running.addr, b"still here"), b"still here");
            let stats = running.stop();
            assert!(stats.served_inline >= 1, "{mode:?}: {stats:?}");
        }
    }

    fn failing_accept(
        script: Vec<io::Result<Accepted>>,
    ) -> (impl FnMut() -> io::Result<Accepted>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut script = script.into_iter();
        let accept = move || {
            counter.fetch_add(1, Ordering::Relaxed);
            script
                .next()
                .unwrap_or_else(|| Err(io::Error::from_raw_os_error(libc::EINTR)))
        };
        (accept, calls)
    }

    #[test]
    fn test_edge_drain_gives_up_on_repeated_transient_errors() {
        let (accept, calls) = failing_accept(Vec::new());
        let mut accepted = Vec::new();

        assert!(accept_batch(accept, true, &mut accepted));
        assert_eq!(calls.load(Ordering::Relaxed), MAX_TRANSIENT_ACCEPT_ERRORS);
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_edge_drain_survives_isolated_transient_error() {
        let (accept, calls) = failing_accept(vec![
            Err(io::Error::from_raw_os_error(libc::ECONNABORTED)),
            Ok(Accepted::WouldBlock),
        ]);
        let mut accepted = Vec::new();

        assert!(!accept_batch(accept, true, &mut accepted));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_hard_accept_error_resumes_only_under_edge() {
        let emfile = || vec![Err(io::Error::from_raw_os_error(libc::EMFILE))];
        let mut accepted = Vec::new();

        let (accept, _) = failing_accept(emfile());
        assert!(accept_batch(accept, true, &mut accepted));

        let (accept, calls) = failing_accept(emfile());
        assert!(!accept_batch(accept, false, &mut accepted));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_edge_loop_resumes_deferred_accept() {
        let mut event_loop = event_loop(Mode::Epoll);
        let addr = event_loop.local_addr().unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        // Consume the listener's only edge notification without accepting.
        let mut events = Vec::new();
        event_loop
            .mux
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events.len(), 1);

        event_loop.accept_pending = true;
        event_loop.turn().unwrap();
        assert_eq!(event_loop.open_connections(), 1);
        assert!(!event_loop.accept_pending);
    }

    #[test]
    fn test_connection_limit_closes_excess() {
        let listener = Listener::bind(
            "127.0.0.1:0",
            &ListenerOptions {
                backlog: 0,
                reuse_address: true,
                nonblocking: true,
                accept_timeout: None,
            },
        )
        .unwrap();
        let mut event_loop = EventLoop::new(
            listener,
            multiplexer::for_mode(Mode::Epoll, 64).unwrap(),
            LoopOptions {
                max_connections: 2,
                max_frame: echo::MAX_FRAME,
                timeout: Duration::from_millis(20),
            },
        )
        .unwrap();
        let addr = event_loop.local_addr().unwrap();

        let _clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
        thread::sleep(Duration::from_millis(50));
        event_loop.turn().unwrap();

        assert_eq!(event_loop.open_connections(), 2);
        assert_eq!(event_loop.stats().accepted, 3);
        assert_eq!(event_loop.stats().dropped, 1);
    }

    #[test]
    fn test_handoff_serves_each_connection_once() {
        for mode in MODES {
            let (control, worker_end) = handoff::queue().unwrap();
            let consumer =
                thread::spawn(move || worker::serve_queue(&worker_end, echo::MAX_FRAME).unwrap());

            let pool = WorkerPool::with_queue(control, Duration::from_secs(1));
            let running = Running::start(event_loop(mode).with_pool(pool));

            for i in 0..30 {
                let payload = format!("handoff-{i}");
                assert_eq!(round_trip(running.addr, payload.as_bytes()), payload.as_bytes());
            }

            let stats = running.stop();
            assert_eq!(stats.handed_off, 30, "{mode:?}: {stats:?}");
            assert_eq!(stats.served_inline, 0);
            // Shutdown closed the queue, so the consumer has seen everything.
            assert_eq!(consumer.join().unwrap(), 30);
        }
    }

    #[test]
    fn test_dead_pool_falls_back_to_inline() {
        let (control, worker_end) = handoff::queue().unwrap();
        drop(worker_end);
        let pool = WorkerPool::with_queue(control, Duration::ZERO);
        let running = Running::start(event_loop(Mode::Poll).with_pool(pool));

        assert_eq!(round_trip(running.addr, b"no workers"), b"no workers");
        let stats = running.stop();
        assert_eq!(stats.handed_off, 0);
        assert_eq!(stats.served_inline, 1);
    }
}
