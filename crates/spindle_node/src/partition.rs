//! Partition event-loop host.
//!
//! One named thread owns the scheduler for a partition replica. Mailbox
//! traffic, durability callbacks, and control commands all arrive over a
//! single channel, so every scheduler touch happens on that thread. Site
//! tasks produced by the scheduler are drained after each event and run
//! against the execution engine; responses loop back through the scheduler
//! exactly like responses from remote replicas do.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use spindle_sched::{
    CommandLog, CompleteTxn, CompleteTxnResponse, Digest, DummyResponse, DurabilitySink,
    FragmentResponse, FragmentStatus, FragmentTask, InitiateResponse, InitiateTask, Message,
    PartitionId, ReadLevel, ResponseStatus, SchedulerConfig, SiteId, SiteTask, SpScheduler,
    TaskQueue, TxnState,
};

use crate::mailbox::LocalNetwork;

#[derive(Clone, Copy, Debug)]
pub struct PartitionConfig {
    pub partition: PartitionId,
    pub site_id: SiteId,
    pub read_level: ReadLevel,
}

/// Result of running one piece of work in the execution engine.
#[derive(Clone, Debug)]
pub struct ExecOutcome {
    pub status: ResponseStatus,
    pub result: Bytes,
}

impl ExecOutcome {
    pub fn success(result: impl Into<Bytes>) -> Self {
        Self {
            status: ResponseStatus::Success,
            result: result.into(),
        }
    }

    pub fn abort(result: impl Into<Bytes>) -> Self {
        Self {
            status: ResponseStatus::UserAbort,
            result: result.into(),
        }
    }
}

/// Deterministic procedure runner for this partition. Implementations must
/// produce identical results on every replica; the digest of each outcome
/// is what the duplicate counters compare.
pub trait ExecutionEngine: Send + 'static {
    fn procedure(&mut self, task: &InitiateTask, txn: &TxnState) -> ExecOutcome;

    fn fragment(
        &mut self,
        task: &FragmentTask,
        input_deps: Option<&BTreeMap<u32, Bytes>>,
        txn: &TxnState,
    ) -> ExecOutcome;

    fn complete(&mut self, _msg: &CompleteTxn) {}
}

/// Replica determinism digest over a response.
pub fn response_digest(status: ResponseStatus, result: &[u8]) -> Digest {
    let code: u8 = match status {
        ResponseStatus::Success => 0,
        ResponseStatus::UserAbort => 1,
        ResponseStatus::Failure => 2,
        ResponseStatus::Ignored => 3,
    };
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[code]);
    hasher.update(result);
    *hasher.finalize().as_bytes()
}

type ControlFn = Box<dyn FnOnce(&mut SpScheduler) -> Result<()> + Send>;

enum Event {
    Inbound(Message),
    /// Task handed back by a synchronous command log once durable.
    Durable(SiteTask),
    Control(ControlFn),
    Shutdown,
}

struct EventSink {
    tx: Sender<Event>,
}

impl DurabilitySink for EventSink {
    fn durable(&self, task: SiteTask) {
        if self.tx.send(Event::Durable(task)).is_err() {
            tracing::debug!("durable task dropped: partition loop is gone");
        }
    }
}

struct ChannelTaskQueue {
    tx: Sender<SiteTask>,
}

impl TaskQueue for ChannelTaskQueue {
    fn offer(&self, task: SiteTask) {
        if self.tx.send(task).is_err() {
            tracing::debug!("site task dropped: partition loop is gone");
        }
    }
}

pub struct PartitionHandle {
    site_id: SiteId,
    network: LocalNetwork,
    events: Sender<Event>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl PartitionHandle {
    pub fn spawn(
        config: PartitionConfig,
        network: &LocalNetwork,
        engine: Box<dyn ExecutionEngine>,
        command_log: Option<Arc<dyn CommandLog>>,
    ) -> Result<Self> {
        let (mailbox, inbox) = network.register(config.site_id);
        let (events_tx, events_rx) = mpsc::channel();
        let (tasks_tx, tasks_rx) = mpsc::channel();

        let mut scheduler = SpScheduler::new(
            SchedulerConfig {
                partition: config.partition,
                site_id: config.site_id,
                read_level: config.read_level,
            },
            mailbox,
            Arc::new(ChannelTaskQueue { tx: tasks_tx }),
        );
        if let Some(log) = command_log {
            log.register_sink(Arc::new(EventSink {
                tx: events_tx.clone(),
            }));
            scheduler.set_command_log(log);
        }

        // Pump mailbox traffic into the single event channel. Exits when
        // the site is unregistered from the network.
        let pump_tx = events_tx.clone();
        thread::Builder::new()
            .name(format!("partition-{}-inbox", config.partition))
            .spawn(move || {
                while let Some(msg) = inbox.recv() {
                    if pump_tx.send(Event::Inbound(msg)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|err| anyhow!("spawn inbox pump: {err}"))?;

        let thread = thread::Builder::new()
            .name(format!("partition-{}", config.partition))
            .spawn(move || partition_loop(scheduler, engine, events_rx, tasks_rx))
            .map_err(|err| anyhow!("spawn partition loop: {err}"))?;

        Ok(Self {
            site_id: config.site_id,
            network: network.clone(),
            events: events_tx,
            thread: Some(thread),
        })
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Run a closure against the scheduler on its own thread.
    pub fn control(&self, f: impl FnOnce(&mut SpScheduler) -> Result<()> + Send + 'static) {
        if self.events.send(Event::Control(Box::new(f))).is_err() {
            tracing::debug!(site = self.site_id, "control dropped: partition loop is gone");
        }
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.control(move |sched| {
            sched.set_leader_state(is_leader);
            Ok(())
        });
    }

    pub fn update_replicas(
        &self,
        replicas: Vec<SiteId>,
        partition_masters: BTreeMap<PartitionId, SiteId>,
    ) {
        self.control(move |sched| sched.update_replicas(replicas, &partition_masters));
    }

    pub fn enable_fault_log_writes(&self) {
        self.control(|sched| sched.enable_fault_log_writes());
    }

    /// Whether the loop has stopped, normally or fatally.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Poll until the loop stops or the timeout passes; true when stopped.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Stop the loop and surface its outcome; a fatal scheduler error
    /// (hash mismatch, protocol violation) comes back as `Err`.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.events.send(Event::Shutdown);
        self.network.unregister(self.site_id);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow!("partition loop panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for PartitionHandle {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
        self.network.unregister(self.site_id);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn partition_loop(
    mut scheduler: SpScheduler,
    mut engine: Box<dyn ExecutionEngine>,
    events: Receiver<Event>,
    tasks: Receiver<SiteTask>,
) -> Result<()> {
    let site_id = scheduler.site_id();
    loop {
        let Ok(event) = events.recv() else {
            return Ok(());
        };
        let step = match event {
            Event::Shutdown => return Ok(()),
            Event::Inbound(msg) => scheduler.receive(msg),
            Event::Durable(task) => {
                // The redelivered task runs first, then the work gated
                // behind its durability drains in arrival order.
                let txn_id = task.txn_id();
                run_task(&mut scheduler, engine.as_mut(), site_id, task).and_then(|()| {
                    if let Some(txn_id) = txn_id {
                        scheduler.offer_pending_mp_tasks(txn_id);
                    }
                    Ok(())
                })
            }
            Event::Control(f) => f(&mut scheduler),
        };
        if let Err(err) = step {
            tracing::error!(site = site_id, error = ?err, "partition loop terminating");
            return Err(err);
        }

        // Drain the site work produced by this event; responses delivered
        // back into the scheduler may enqueue more.
        loop {
            let Ok(task) = tasks.try_recv() else {
                break;
            };
            if let Err(err) = run_task(&mut scheduler, engine.as_mut(), site_id, task) {
                tracing::error!(site = site_id, error = ?err, "partition loop terminating");
                return Err(err);
            }
        }
    }
}

fn run_task(
    scheduler: &mut SpScheduler,
    engine: &mut dyn ExecutionEngine,
    site_id: SiteId,
    task: SiteTask,
) -> Result<()> {
    match task {
        SiteTask::TruncationBroadcast => {
            scheduler.flush_truncation();
            Ok(())
        }
        SiteTask::Procedure { msg, completion } => {
            let mut txn = TxnState::single_partition(&msg);
            let outcome = engine.procedure(&msg, &txn);
            txn.mark_done();
            // Durability precedes the reply.
            if let Some(completion) = completion {
                completion.wait();
            }
            let digest = response_digest(outcome.status, &outcome.result);
            let response = InitiateResponse {
                txn_id: msg.txn_id,
                sp_handle: msg.sp_handle,
                source: site_id,
                initiator: msg.initiator,
                ci_handle: msg.ci_handle,
                connection_id: msg.connection_id,
                read_only: msg.read_only,
                status: outcome.status,
                result: outcome.result,
                hashes: vec![digest],
            };
            scheduler.deliver(Message::InitiateResponse(response))
        }
        SiteTask::Fragment {
            msg,
            input_deps,
            bufferable,
            completion,
        } => {
            let txn = if bufferable {
                TxnState::participant(&msg)
            } else {
                TxnState::borrowed(msg.sp_handle, &msg)
            };
            let outcome = engine.fragment(&msg, input_deps.as_ref(), &txn);
            if let Some(completion) = completion {
                completion.wait();
            }
            let status = match outcome.status {
                ResponseStatus::Success => FragmentStatus::Success,
                ResponseStatus::UserAbort => FragmentStatus::UserError,
                ResponseStatus::Failure | ResponseStatus::Ignored => {
                    FragmentStatus::UnexpectedError
                }
            };
            let digest = response_digest(outcome.status, &outcome.result);
            let response = FragmentResponse {
                txn_id: msg.txn_id,
                sp_handle: msg.sp_handle,
                source: site_id,
                destination: msg.coordinator,
                executor_site: site_id,
                status,
                result: outcome.result,
                hashes: vec![digest],
                bufferable,
                misrouted: false,
                handled_by_original_leader: msg.handled_by_original_leader,
            };
            scheduler.deliver(Message::FragmentResponse(response))
        }
        SiteTask::CompleteTxn { msg } => {
            engine.complete(&msg);
            let response = CompleteTxnResponse {
                txn_id: msg.txn_id,
                sp_handle: msg.sp_handle,
                source: site_id,
                restart: msg.restart,
                ack_requested: msg.ack_requested,
                sp_initiator: msg.coordinator,
            };
            scheduler.deliver(Message::CompleteTxnResponse(response))
        }
        SiteTask::Flush { msg, completion } => {
            let mut txn = TxnState::flush(&msg);
            txn.mark_done();
            if let Some(completion) = completion {
                completion.wait();
            }
            let response = DummyResponse {
                txn_id: msg.txn_id,
                sp_handle: msg.sp_handle,
                source: site_id,
                sp_initiator: msg.sp_initiator,
            };
            scheduler.deliver(Message::DummyResponse(response))
        }
    }
}
