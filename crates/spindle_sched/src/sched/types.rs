//! Shared types for the partition scheduler.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the scheduler core, the durability layer, and the node plumbing.
//! Message structs describe the logical boundary; the wire format belongs to
//! whatever transport carries them.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical partition identifier.
pub type PartitionId = u32;
/// Site identifier: one mailbox endpoint (host + site), unique cluster-wide.
pub type SiteId = u64;
/// Per-partition sequence handle. Strictly increasing on a leader.
pub type SpHandle = i64;
/// Transaction identifier. Equals the sp-handle for local single-partition
/// writes; assigned upstream for multi-partition and replayed work.
pub type TxnId = i64;
/// Timestamp-bearing identifier used by the command log for idempotency.
pub type UniqueId = i64;

/// 32-byte result digest compared across replicas to detect divergence.
pub type Digest = [u8; 32];

/// Compose a site id from a host id and a per-host site index.
pub const fn make_site_id(host: u32, index: u32) -> SiteId {
    ((index as u64) << 32) | host as u64
}

/// Host component of a site id.
pub const fn host_of(site: SiteId) -> u32 {
    site as u32
}

/// Sentinel for "no handle assigned yet".
pub const NO_HANDLE: SpHandle = i64::MIN;

/// Destination for counters whose aggregated response is dropped on the
/// floor (repair work with no surviving client, pipeline flushes).
pub const NO_DESTINATION: SiteId = u64::MAX;

/// Read consistency level for the partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadLevel {
    /// Served by any replica without coordination.
    Fast,
    /// Held until preceding writes are cluster-committed.
    Safe,
}

/// Scope of a stored procedure invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureScope {
    /// Ordinary single-partition procedure; txn id is rewritten to the
    /// locally assigned handle.
    Partition,
    /// Cluster every-site system procedure; keeps its upstream ids.
    EverySite,
}

/// Opaque stored-procedure invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub procedure: String,
    pub params: Bytes,
    pub scope: ProcedureScope,
}

impl Invocation {
    pub fn partition(procedure: impl Into<String>, params: Bytes) -> Self {
        Self {
            procedure: procedure.into(),
            params,
            scope: ProcedureScope::Partition,
        }
    }

    pub fn is_everysite(&self) -> bool {
        self.scope == ProcedureScope::EverySite
    }
}

/// Single-partition initiation: run one procedure on this partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateTask {
    pub initiator: SiteId,
    pub coordinator: SiteId,
    /// Truncation handle piggy-backed for replicas.
    pub trunc_handle: SpHandle,
    pub txn_id: TxnId,
    pub unique_id: UniqueId,
    pub read_only: bool,
    pub single_partition: bool,
    pub invocation: Invocation,
    /// Client-interface handle echoed back in the response.
    pub ci_handle: i64,
    pub connection_id: i64,
    pub for_replay: bool,
    /// Set on the copy the leader multicasts to its replicas.
    pub replica_copy: bool,
    pub sp_handle: SpHandle,
}

/// Completion status carried by an initiate response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    UserAbort,
    Failure,
    /// Replay duplicate; the transaction was not dispatched.
    Ignored,
}

/// Response to an [`InitiateTask`], produced by execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub txn_id: TxnId,
    pub sp_handle: SpHandle,
    pub source: SiteId,
    pub initiator: SiteId,
    pub ci_handle: i64,
    pub connection_id: i64,
    pub read_only: bool,
    pub status: ResponseStatus,
    pub result: Bytes,
    pub hashes: Vec<Digest>,
}

impl InitiateResponse {
    /// Synthesized ignored-transaction reply for a replay duplicate.
    pub fn ignored(task: &InitiateTask, source: SiteId) -> Self {
        Self {
            txn_id: task.txn_id,
            sp_handle: task.sp_handle,
            source,
            initiator: task.initiator,
            ci_handle: task.ci_handle,
            connection_id: task.connection_id,
            read_only: task.read_only,
            status: ResponseStatus::Ignored,
            result: Bytes::new(),
            hashes: Vec::new(),
        }
    }
}

/// Kind of multi-partition fragment work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentKind {
    Normal,
    SysProc,
    /// Per-site system procedure fragment; results legitimately differ
    /// across sites, so determinism checks are keyed per site.
    SysProcPerSite,
}

/// Scatter fragment of a multi-partition transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentTask {
    pub initiator: SiteId,
    pub coordinator: SiteId,
    pub txn_id: TxnId,
    pub sp_handle: SpHandle,
    pub trunc_handle: SpHandle,
    pub involved_partitions: Vec<PartitionId>,
    pub kind: FragmentKind,
    /// Last fragment of the transaction for this site.
    pub final_task: bool,
    pub read_only: bool,
    pub for_replay: bool,
    /// Set on the copy forwarded to replicas.
    pub replica_copy: bool,
    /// Routed through the leader path even on a demoted site
    /// (leader-migration hand-off).
    pub handled_by_original_leader: bool,
    /// Embedded initiation logged with the first fragment.
    pub initiate: Option<Box<InitiateTask>>,
}

/// Fragment completion status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentStatus {
    Success,
    UserError,
    UnexpectedError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentResponse {
    pub txn_id: TxnId,
    pub sp_handle: SpHandle,
    pub source: SiteId,
    pub destination: SiteId,
    /// Site that executed the fragment; rewritten before forwarding to the
    /// coordinator, which tracks dependencies per executor site.
    pub executor_site: SiteId,
    pub status: FragmentStatus,
    pub result: Bytes,
    pub hashes: Vec<Digest>,
    /// Responses to borrowed work must not be held in the read buffer.
    pub bufferable: bool,
    /// Restart exception flagged misrouted; forward to `destination` as-is.
    pub misrouted: bool,
    /// Work ran on a demoted site acting as the original leader; forces the
    /// truncation side effects that normally only run on the leader.
    pub handled_by_original_leader: bool,
}

/// Coordinator's commit/rollback notice closing a multi-partition txn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteTxn {
    pub txn_id: TxnId,
    pub sp_handle: SpHandle,
    pub coordinator: SiteId,
    /// Addressed to the partition leader (possibly a just-promoted or
    /// just-demoted site during leader migration).
    pub to_leader: bool,
    pub restart: bool,
    pub read_only: bool,
    pub ack_requested: bool,
    pub trunc_handle: SpHandle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteTxnResponse {
    pub txn_id: TxnId,
    pub sp_handle: SpHandle,
    pub source: SiteId,
    pub restart: bool,
    pub ack_requested: bool,
    /// Leader site the ack bounces back to.
    pub sp_initiator: SiteId,
}

/// Multi-partition read executed locally on the coordinator's buddy site,
/// without replication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowTask {
    pub fragment: FragmentTask,
    pub input_deps: BTreeMap<u32, Bytes>,
}

/// Replay-stream marker for a multi-partition transaction; pairs with the
/// first fragment carrying the same unique id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpSentinel {
    pub txn_id: TxnId,
    pub unique_id: UniqueId,
    pub initiator: SiteId,
}

/// Leader's notice that it wrote a viable-replay fault-log entry; the
/// replica writes its own entry at the given handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFault {
    pub fault_handle: SpHandle,
    pub unique_id: UniqueId,
}

/// Explicit truncation broadcast, sent when no replicated traffic has
/// piggy-backed the handle recently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairLogTruncate {
    pub handle: SpHandle,
}

/// Ordered no-op that flushes the command-log pipeline and advances the
/// truncation point; treated like a write with no procedure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyTask {
    pub txn_id: TxnId,
    pub sp_handle: SpHandle,
    pub unique_id: UniqueId,
    pub sp_initiator: SiteId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyResponse {
    pub txn_id: TxnId,
    pub sp_handle: SpHandle,
    pub source: SiteId,
    pub sp_initiator: SiteId,
}

/// Coordinated-crash notice sent to peers after a determinism failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpPlanThenExit {
    pub procedure: String,
    pub source: SiteId,
}

/// Every message class the scheduler can receive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Initiate(InitiateTask),
    InitiateResponse(InitiateResponse),
    Fragment(FragmentTask),
    FragmentResponse(FragmentResponse),
    CompleteTxn(CompleteTxn),
    CompleteTxnResponse(CompleteTxnResponse),
    Borrow(BorrowTask),
    MpSentinel(MpSentinel),
    LogFault(LogFault),
    RepairLogTruncate(RepairLogTruncate),
    DummyTask(DummyTask),
    DummyResponse(DummyResponse),
    Dump,
    DumpPlanThenExit(DumpPlanThenExit),
}

impl Message {
    /// Unique id for replay sequencing, when the message takes part in it.
    pub fn replay_unique_id(&self) -> Option<UniqueId> {
        match self {
            Message::Initiate(m) if m.for_replay => Some(m.unique_id),
            Message::Fragment(m) if m.for_replay => Some(m.initiate.as_ref()?.unique_id),
            Message::MpSentinel(m) => Some(m.unique_id),
            _ => None,
        }
    }
}

/// Work handed to the site thread for execution, or back to the initiator
/// thread for deferred scheduler work.
pub enum SiteTask {
    Procedure {
        msg: InitiateTask,
        completion: Option<Completion>,
    },
    Fragment {
        msg: FragmentTask,
        input_deps: Option<BTreeMap<u32, Bytes>>,
        bufferable: bool,
        completion: Option<Completion>,
    },
    CompleteTxn {
        msg: CompleteTxn,
    },
    Flush {
        msg: DummyTask,
        completion: Option<Completion>,
    },
    /// Deferred: send the latest truncation handle to replicas if no
    /// replicated message has carried it since this was scheduled.
    TruncationBroadcast,
}

impl SiteTask {
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            SiteTask::Procedure { msg, .. } => Some(msg.txn_id),
            SiteTask::Fragment { msg, .. } => Some(msg.txn_id),
            SiteTask::CompleteTxn { msg } => Some(msg.txn_id),
            SiteTask::Flush { msg, .. } => Some(msg.txn_id),
            SiteTask::TruncationBroadcast => None,
        }
    }

    pub fn set_completion(&mut self, handle: Option<Completion>) {
        match self {
            SiteTask::Procedure { completion, .. }
            | SiteTask::Fragment { completion, .. }
            | SiteTask::Flush { completion, .. } => *completion = handle,
            SiteTask::CompleteTxn { .. } | SiteTask::TruncationBroadcast => {}
        }
    }
}

impl std::fmt::Debug for SiteTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteTask::Procedure { msg, .. } => f
                .debug_struct("Procedure")
                .field("txn_id", &msg.txn_id)
                .field("sp_handle", &msg.sp_handle)
                .field("procedure", &msg.invocation.procedure)
                .finish(),
            SiteTask::Fragment { msg, .. } => f
                .debug_struct("Fragment")
                .field("txn_id", &msg.txn_id)
                .field("sp_handle", &msg.sp_handle)
                .field("final_task", &msg.final_task)
                .finish(),
            SiteTask::CompleteTxn { msg } => f
                .debug_struct("CompleteTxn")
                .field("txn_id", &msg.txn_id)
                .field("sp_handle", &msg.sp_handle)
                .finish(),
            SiteTask::Flush { msg, .. } => f
                .debug_struct("Flush")
                .field("txn_id", &msg.txn_id)
                .finish(),
            SiteTask::TruncationBroadcast => f.write_str("TruncationBroadcast"),
        }
    }
}

/// Point-to-point and multicast message delivery. Delivery is FIFO per
/// source/destination pair; sends never block the caller.
pub trait Mailbox: Send + Sync {
    fn send(&self, dest: SiteId, msg: Message);
    fn multicast(&self, dests: &[SiteId], msg: Message);
}

/// Queue of work consumed by the site thread.
pub trait TaskQueue: Send + Sync {
    fn offer(&self, task: SiteTask);
}

/// One-shot completion signal used for command-log back-pressure. The
/// execution site may block on it before emitting a response; it carries no
/// payload and cannot be cancelled.
#[derive(Clone, Default)]
pub struct Completion(Arc<CompletionInner>);

#[derive(Default)]
struct CompletionInner {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        let mut done = self.0.done.lock().expect("completion lock poisoned");
        *done = true;
        self.0.cv.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.0.done.lock().expect("completion lock poisoned")
    }

    pub fn wait(&self) {
        let mut done = self.0.done.lock().expect("completion lock poisoned");
        while !*done {
            done = self.0.cv.wait(done).expect("completion lock poisoned");
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Completion").field(&self.is_complete()).finish()
    }
}

/// Settable boolean future for fault-log writes. `wait` blocks until the
/// writer reports the outcome.
#[derive(Clone, Default)]
pub struct StatusHandle(Arc<StatusInner>);

#[derive(Default)]
struct StatusInner {
    status: Mutex<Option<bool>>,
    cv: Condvar,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ok: bool) {
        let mut status = self.0.status.lock().expect("status lock poisoned");
        *status = Some(ok);
        self.0.cv.notify_all();
    }

    pub fn wait(&self) -> bool {
        let mut status = self.0.status.lock().expect("status lock poisoned");
        loop {
            if let Some(ok) = *status {
                return ok;
            }
            status = self.0.cv.wait(status).expect("status lock poisoned");
        }
    }

    pub fn try_get(&self) -> Option<bool> {
        *self.0.status.lock().expect("status lock poisoned")
    }
}

impl std::fmt::Debug for StatusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StatusHandle").field(&self.try_get()).finish()
    }
}

/// Envelope appended to the command log alongside a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEnvelope {
    pub sp_handle: SpHandle,
    pub unique_id: UniqueId,
    pub involved_partitions: Vec<PartitionId>,
    /// Serialized originating message, or `None` for pipeline flushes.
    pub initiate: Option<InitiateTask>,
}

/// Outcome of offering a task to the command log.
pub enum LogResult {
    /// The task may run immediately. Async logging attaches a back-pressure
    /// completion; a disabled log attaches none.
    Offer {
        task: SiteTask,
        completion: Option<Completion>,
    },
    /// Synchronous logging retained the task; the log redelivers it through
    /// the durability sink once the entry is on disk.
    Pending,
}

/// Receives tasks back from a synchronous command log once durable. The
/// implementation must re-enter the partition loop; the sink is never
/// invoked on the initiator thread.
pub trait DurabilitySink: Send + Sync {
    fn durable(&self, task: SiteTask);
}

/// Asynchronous durability oracle for the partition.
///
/// The scheduler treats the log as external: it offers entries, learns
/// whether the task can run immediately, and blocks on fault-log writes
/// during membership transitions.
pub trait CommandLog: Send + Sync {
    fn is_synchronous(&self) -> bool;

    /// Append one transaction record.
    fn log(&self, task: SiteTask, envelope: LogEnvelope) -> LogResult;

    /// Append a viable-replay fault-log entry. Returns `None` when logging
    /// is disabled, otherwise a handle resolved after the write hits disk.
    fn log_fault(
        &self,
        leader: SiteId,
        replicas: &[SiteId],
        partition: PartitionId,
        fault_handle: SpHandle,
    ) -> Option<StatusHandle>;

    /// Seed the log's idempotency high-water mark (replica promotion path).
    fn initialize_last_durable(&self, unique_id: UniqueId);

    fn register_sink(&self, sink: Arc<dyn DurabilitySink>);
}
