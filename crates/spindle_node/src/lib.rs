//! Node-side plumbing for spindle partitions: the file-backed command log,
//! an in-process mailbox network, and the partition event-loop host that
//! drives a scheduler against an execution engine.

pub mod mailbox;
pub mod partition;
pub mod wal;

pub use mailbox::{LocalNetwork, SiteInbox};
pub use partition::{
    ExecOutcome, ExecutionEngine, PartitionConfig, PartitionHandle, response_digest,
};
pub use wal::{CommandLogConfig, FileCommandLog, LoggedRecord, SyncMode};
