//! Message-driven scheduler for one partition replica.
//!
//! One scheduler instance runs per partition replica. It orders and
//! replicates transactions for that partition, collects matching replica
//! responses, gates reads on cluster-committed writes, and maintains the
//! repair-log truncation point used for garbage collection and leader
//! failover. Everything here is single-threaded with respect to scheduler
//! state; execution work is handed off through a task queue.

mod buffered_reads;
mod counter;
mod ids;
mod mp_gate;
mod repair_log;
mod replay;
mod scheduler;
mod truncation;
mod txn_state;
pub mod types;

pub use buffered_reads::BufferedReadLog;
pub use counter::{CounterOutcome, DuplicateCounter, ReplicaUpdate};
pub use ids::{SpHandleAllocator, UniqueIdAllocator};
pub use mp_gate::MpDurabilityGate;
pub use repair_log::RepairLog;
pub use replay::{ReplaySequencer, SequenceDecision};
pub use scheduler::{SchedulerConfig, SpScheduler};
pub use truncation::RepairLogTruncationTracker;
pub use txn_state::{TxnKind, TxnState};
pub use types::*;
