//! End-to-end tests against the built `echo-dispatch` binary.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_echo-dispatch");

struct Server {
    child: Child,
    addr: SocketAddr,
}

impl Server {
    fn start(args: &[&str]) -> Server {
        let addr = free_addr();
        let child = Command::new(BIN)
            .args(args)
            .arg("--listen")
            .arg(addr.to_string())
            .arg("--timeout")
            .arg("50")
            .env("RUST_LOG", "info")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start echo-dispatch");

        let server = Server { child, addr };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(reply) = echo(self.addr, b"ready?") {
                assert_eq!(reply, b"ready?");
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("server on {} never became ready", self.addr);
    }

    /// SIGINT, then collect the output.
    fn stop(self) -> Output {
        let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGINT) };
        assert_eq!(rc, 0);
        self.child.wait_with_output().unwrap()
    }
}

fn free_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

fn echo(addr: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.write_all(payload)?;
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply)?;
    Ok(reply)
}

fn concurrent_clients(addr: SocketAddr, clients: usize) {
    let handles: Vec<_> = (0..clients)
        .map(|i| {
            thread::spawn(move || {
                let payload = format!("client-{i:03}");
                let reply = echo(addr, payload.as_bytes()).unwrap();
                assert_eq!(reply, payload.as_bytes());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

fn peak_connections(output: &Output) -> usize {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .find(|line| line.contains("Max. number of connections:"))
        .unwrap_or_else(|| panic!("no peak line in output:\n{stdout}"));
    line.rsplit(' ').next().unwrap().trim().parse().unwrap()
}

fn run_mode(args: &[&str]) -> Output {
    let server = Server::start(args);
    concurrent_clients(server.addr, 20);

    let output = server.stop();
    assert!(
        output.status.success(),
        "exit {:?}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

#[test]
fn test_select_inline() {
    assert!(peak_connections(&run_mode(&["select"])) >= 1);
}

#[test]
fn test_poll_inline() {
    assert!(peak_connections(&run_mode(&["poll"])) >= 1);
}

#[test]
fn test_epoll_inline() {
    assert!(peak_connections(&run_mode(&["epoll"])) >= 1);
}

#[test]
fn test_select_with_workers() {
    assert!(peak_connections(&run_mode(&["select", "--worker", "--workers", "2"])) >= 1);
}

#[test]
fn test_epoll_with_workers() {
    assert!(peak_connections(&run_mode(&["epoll", "--worker", "--workers", "2"])) >= 1);
}

#[test]
fn test_basic_mode() {
    let output = run_mode(&["basic", "--workers", "2"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("Max. number of connections:"));
}

#[test]
fn test_mode_aliases() {
    run_mode(&["level-table"]);
    run_mode(&["edge-table"]);
}

#[test]
fn test_zero_timeout_rejected() {
    let output = Command::new(BIN)
        .args(["basic", "--timeout", "0"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("timeout"));
}

#[test]
fn test_peak_counts_idle_connections() {
    let server = Server::start(&["poll"]);

    let idle: Vec<TcpStream> = (0..10)
        .map(|_| TcpStream::connect(server.addr).unwrap())
        .collect();
    // Accepted in order, so by the time this is served the idle ones are open.
    assert_eq!(echo(server.addr, b"last").unwrap(), b"last");
    drop(idle);

    let output = server.stop();
    assert!(output.status.success());
    assert!(peak_connections(&output) >= 10);
}

#[test]
fn test_unknown_mode_fails() {
    let output = Command::new(BIN).arg("kqueue").output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_missing_mode_fails() {
    let output = Command::new(BIN).output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_zero_workers_rejected() {
    let output = Command::new(BIN)
        .args(["select", "--worker", "--workers", "0"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("workers"));
}
