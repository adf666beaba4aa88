//! echo-bench: concurrent load generator for echo-dispatch.
//!
//! Each request opens a connection, sends a timestamp, reads the echo back
//! and checks it. Failures are counted per class and summarised at the end.

use chrono::Utc;
use clap::Parser;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Largest payload the server echoes in one request.
const MAX_PAYLOAD: usize = 32;

#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(about = "Load generator for echo-dispatch", long_about = None)]
struct BenchArgs {
    /// Total number of requests
    requests: u64,

    /// Concurrent client tasks
    #[arg(short, long, default_value_t = 10)]
    workers: usize,

    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    addr: String,

    /// Log every failed request
    #[arg(short, long)]
    verbose: bool,

    /// Per-request timeout in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Connect,
    Write,
    Read,
    Integrity,
    Timeout,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Failure::Connect => "connect",
            Failure::Write => "write",
            Failure::Read => "read",
            Failure::Integrity => "integrity",
            Failure::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Results gathered by one task, merged at the end.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Tally {
    successes: u64,
    connect: u64,
    write: u64,
    read: u64,
    integrity: u64,
    timeout: u64,
    total_latency: Duration,
}

impl Tally {
    fn record(&mut self, outcome: Result<Duration, Failure>) {
        match outcome {
            Ok(latency) => {
                self.successes += 1;
                self.total_latency += latency;
            }
            Err(Failure::Connect) => self.connect += 1,
            Err(Failure::Write) => self.write += 1,
            Err(Failure::Read) => self.read += 1,
            Err(Failure::Integrity) => self.integrity += 1,
            Err(Failure::Timeout) => self.timeout += 1,
        }
    }

    fn merge(&mut self, other: &Tally) {
        self.successes += other.successes;
        self.connect += other.connect;
        self.write += other.write;
        self.read += other.read;
        self.integrity += other.integrity;
        self.timeout += other.timeout;
        self.total_latency += other.total_latency;
    }

    fn errors(&self) -> u64 {
        self.connect + self.write + self.read + self.integrity + self.timeout
    }

    fn average_ms(&self) -> f64 {
        if self.successes == 0 {
            return 0.0;
        }
        self.total_latency.as_secs_f64() * 1000.0 / self.successes as f64
    }
}

fn payload() -> Vec<u8> {
    let mut bytes = Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
        .into_bytes();
    bytes.truncate(MAX_PAYLOAD);
    bytes
}

/// One connect/send/receive/compare cycle.
async fn request(addr: &str, payload: &[u8]) -> Result<(), Failure> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|_| Failure::Connect)?;
    stream.write_all(payload).await.map_err(|_| Failure::Write)?;

    // The server closes after one response.
    let mut reply = Vec::with_capacity(MAX_PAYLOAD);
    stream
        .read_to_end(&mut reply)
        .await
        .map_err(|_| Failure::Read)?;

    if reply != payload {
        return Err(Failure::Integrity);
    }
    Ok(())
}

async fn timed_request(addr: &str, limit: Duration) -> Result<Duration, Failure> {
    let payload = payload();
    let start = Instant::now();
    match timeout(limit, request(addr, &payload)).await {
        Ok(Ok(())) => Ok(start.elapsed()),
        Ok(Err(failure)) => Err(failure),
        Err(_) => Err(Failure::Timeout),
    }
}

async fn client_task(
    id: usize,
    addr: Arc<str>,
    next: Arc<AtomicU64>,
    requests: u64,
    limit: Duration,
) -> Tally {
    let mut tally = Tally::default();
    loop {
        let request_id = next.fetch_add(1, Ordering::Relaxed);
        if request_id >= requests {
            break;
        }
        let outcome = timed_request(&addr, limit).await;
        if let Err(failure) = outcome {
            warn!(task = id, request = request_id, %failure, "Request failed");
        }
        tally.record(outcome);
    }
    debug!(task = id, successes = tally.successes, "Client task finished");
    tally
}

async fn run(args: &BenchArgs) -> Tally {
    let addr: Arc<str> = Arc::from(args.addr.as_str());
    let next = Arc::new(AtomicU64::new(0));
    let limit = Duration::from_secs(args.timeout);

    let handles: Vec<_> = (0..args.workers.max(1))
        .map(|id| {
            tokio::spawn(client_task(
                id,
                Arc::clone(&addr),
                Arc::clone(&next),
                args.requests,
                limit,
            ))
        })
        .collect();

    let mut total = Tally::default();
    for handle in handles {
        match handle.await {
            Ok(tally) => total.merge(&tally),
            Err(e) => warn!(error = %e, "Client task panicked"),
        }
    }
    total
}

fn report(tally: &Tally, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        tally.successes as f64 / secs
    } else {
        0.0
    };

    println!("Errors: {}", tally.errors());
    println!("Successes: {}", tally.successes);
    for (failure, count) in [
        (Failure::Connect, tally.connect),
        (Failure::Write, tally.write),
        (Failure::Read, tally.read),
        (Failure::Integrity, tally.integrity),
        (Failure::Timeout, tally.timeout),
    ] {
        println!("  {failure}: {count}");
    }
    println!("Average response time: {:.3} ms", tally.average_ms());
    println!("Requests per second: {rate:.1}");
    println!("Time spent: {secs:.3} s");
}

#[tokio::main]
async fn main() {
    let args = BenchArgs::parse();

    let default_level = if args.verbose { "warn" } else { "error" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let start = Instant::now();
    let tally = run(&args).await;
    report(&tally, start.elapsed());
}
