//! Worker hand-off.
//!
//! The control process moves ready connections to a fixed pool of worker
//! processes instead of serving them inline:
//!
//! - `handoff`: the queue and its record format (descriptor passing)
//! - `pool`: spawning, reaping and stopping workers; non-blocking dispatch
//! - `worker`: the loop each worker process runs
//!
//! A connection that cannot be queued (queue full, pool gone) is returned to
//! the caller rather than dropped.

pub mod handoff;
pub mod pool;
pub mod worker;

pub use handoff::{HandoffMessage, SendError};
pub use pool::{DispatchStats, WorkerOptions, WorkerPool};
