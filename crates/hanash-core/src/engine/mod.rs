//! Per-download engine: coordinator, worker pool, workers, assembler
//!
//! Five components cooperate per active download. The coordinator owns the
//! state machine and byte accounting; the pool manager keeps up to N
//! workers busy; each worker fetches one byte-range segment into its own
//! file; the assembler splices finished segments into the in-progress file
//! and persists the completed set. All of them poll their channels on a
//! ~100 ms cadence and meet on a 3-party barrier at shutdown so no task
//! outlives the coordinator.

mod assembler;
mod coordinator;
mod pool;
mod rate_limiter;
mod worker;

pub use assembler::Assembler;
pub use coordinator::Coordinator;
pub use pool::PoolManager;
pub use rate_limiter::RateLimiter;
pub use worker::Worker;

use hanash_types::{Segment, Status};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Poll cadence of the coordinator, pool manager and assembler loops.
pub(crate) const TICK: std::time::Duration = std::time::Duration::from_millis(100);

/// Messages handled by the coordinator.
#[derive(Debug, Clone)]
pub enum CoordinatorMsg {
    /// Requested or reported status change (user control, assembler done).
    Status(Status),
    /// Number of workers with a live transfer.
    LiveWorkers(usize),
    /// Segments not yet completed (in flight + queued).
    RemainingJobs(usize),
    /// New global speed limit for this download, bytes/s, 0 disables.
    SpeedLimit(u64),
    /// A worker hit an HTTP error status.
    ServerError(u16),
}

/// Messages forwarded by the coordinator to the pool manager.
#[derive(Debug, Clone)]
pub enum PoolMsg {
    Status(Status),
    SpeedLimit(u64),
    MaxConnections(usize),
}

/// Byte count reports flowing from a worker slot to the coordinator.
#[derive(Debug, Clone, Copy)]
pub enum ByteReport {
    /// Bytes received from the server; counted for progress and speed.
    Net(u64),
    /// Bytes already on disk (resume seed) or a negative rollback after an
    /// aborted attempt; counted for progress but never for speed.
    Disk(i64),
}

/// Messages consumed by the assembler.
#[derive(Debug, Clone)]
pub enum PartMsg {
    /// Segment file fully downloaded, ready to append.
    Completed(String),
    /// Shut down and rendezvous on the barrier.
    Exit,
}

/// Queue of segments waiting for a worker, shared between the pool manager
/// (drains it) and workers (push failed segments back for another attempt).
pub(crate) type JobQueue = Arc<Mutex<VecDeque<Segment>>>;
