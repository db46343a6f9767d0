//! Dispatch core for one partition replica.
//!
//! All scheduler state is owned by the partition's initiator thread; work
//! destined for execution is handed to the site task queue and deferred
//! scheduler work is re-posted to the same queue. Inbound messages are
//! classified here, stamped with local handles, replicated to peers when
//! required, and logged to the command log before execution may answer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, ensure, Result};

use super::buffered_reads::BufferedReadLog;
use super::counter::{CounterOutcome, DuplicateCounter, ReplicaUpdate};
use super::ids::{SpHandleAllocator, UniqueIdAllocator};
use super::mp_gate::MpDurabilityGate;
use super::repair_log::RepairLog;
use super::replay::{ReplaySequencer, SequenceDecision};
use super::truncation::RepairLogTruncationTracker;
use super::txn_state::TxnState;
use super::types::{
    host_of, BorrowTask, CommandLog, CompleteTxn, CompleteTxnResponse, DummyResponse, DummyTask,
    DumpPlanThenExit, FragmentKind, FragmentResponse, FragmentTask, InitiateResponse,
    InitiateTask, LogEnvelope, LogFault, LogResult, Mailbox, Message, PartitionId, ReadLevel,
    RepairLogTruncate, SiteId, SiteTask, SpHandle, StatusHandle, TaskQueue, TxnId,
    NO_DESTINATION, NO_HANDLE,
};

#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    pub partition: PartitionId,
    pub site_id: SiteId,
    pub read_level: ReadLevel,
}

type CounterKey = (TxnId, SpHandle);

pub struct SpScheduler {
    partition: PartitionId,
    site_id: SiteId,
    read_level: ReadLevel,
    is_leader: bool,

    mailbox: Arc<dyn Mailbox>,
    tasks: Arc<dyn TaskQueue>,
    command_log: Option<Arc<dyn CommandLog>>,

    replicas: Vec<SiteId>,
    send_to: Vec<SiteId>,

    outstanding: HashMap<TxnId, TxnState>,
    /// Ordered by txn id then handle so membership changes drain completed
    /// counters in response order.
    counters: BTreeMap<CounterKey, DuplicateCounter>,
    mp_gate: MpDurabilityGate,
    buffered_reads: Option<BufferedReadLog>,
    truncation: RepairLogTruncationTracker,
    repair_log: RepairLog,
    replay: ReplaySequencer,

    sp_handles: SpHandleAllocator,
    unique_ids: UniqueIdAllocator,
    replay_complete: bool,
    max_scheduled: SpHandle,
    balance_checkpoint: SpHandle,
}

impl SpScheduler {
    pub fn new(
        config: SchedulerConfig,
        mailbox: Arc<dyn Mailbox>,
        tasks: Arc<dyn TaskQueue>,
    ) -> Self {
        let sp_handles = SpHandleAllocator::new(config.partition);
        let current = sp_handles.current();
        Self {
            partition: config.partition,
            site_id: config.site_id,
            read_level: config.read_level,
            is_leader: false,
            mailbox,
            tasks,
            command_log: None,
            replicas: Vec::new(),
            send_to: Vec::new(),
            outstanding: HashMap::new(),
            counters: BTreeMap::new(),
            mp_gate: MpDurabilityGate::new(),
            buffered_reads: (config.read_level == ReadLevel::Safe)
                .then(BufferedReadLog::new),
            // Start at the current handle so initial reads release freely.
            truncation: RepairLogTruncationTracker::new(current),
            repair_log: RepairLog::new(),
            replay: ReplaySequencer::new(config.site_id),
            sp_handles,
            unique_ids: UniqueIdAllocator::new(config.partition),
            replay_complete: false,
            max_scheduled: current,
            balance_checkpoint: NO_HANDLE,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn truncation_handle(&self) -> SpHandle {
        self.truncation.handle()
    }

    pub fn max_scheduled_handle(&self) -> SpHandle {
        self.max_scheduled
    }

    pub fn has_counter(&self, txn_id: TxnId, sp_handle: SpHandle) -> bool {
        self.counters.contains_key(&(txn_id, sp_handle))
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn buffered_read_len(&self) -> usize {
        self.buffered_reads.as_ref().map_or(0, BufferedReadLog::len)
    }

    pub fn repair_log_len(&self) -> usize {
        self.repair_log.len()
    }

    // ------------------------------------------------------------------
    // Membership-service commands
    // ------------------------------------------------------------------

    pub fn set_leader_state(&mut self, is_leader: bool) {
        self.is_leader = is_leader;
        tracing::info!(
            partition = self.partition,
            site = self.site_id,
            is_leader,
            "leader state changed"
        );
    }

    pub fn set_command_log(&mut self, log: Arc<dyn CommandLog>) {
        self.command_log = Some(log);
    }

    /// Replay is complete: buffered replay stragglers may drain and viable
    /// replay entries may be written to the fault log from here on.
    pub fn enable_fault_log_writes(&mut self) -> Result<()> {
        self.replay_complete = true;
        self.replay.mark_end_of_log();
        self.deliver_ready_replay()?;
        self.write_viable_replay_entry();
        Ok(())
    }

    /// Adopt a handle stamped elsewhere so local allocation stays ahead of
    /// everything this partition has seen.
    pub fn set_max_seen(&mut self, handle: SpHandle) {
        self.sp_handles.observe(handle);
        self.write_viable_replay_entry();
    }

    /// Apply a new replica set. Counters shrink to the surviving replicas;
    /// the ones that completed are finalized in txn-id order to preserve
    /// response ordering, then a viable-replay entry is written and waited
    /// on before new transactions are accepted.
    pub fn update_replicas(
        &mut self,
        replicas: Vec<SiteId>,
        partition_masters: &BTreeMap<PartitionId, SiteId>,
    ) -> Result<()> {
        tracing::debug!(
            partition = self.partition,
            site = self.site_id,
            ?replicas,
            masters = partition_masters.len(),
            "updating replica set"
        );
        self.replicas = replicas;
        self.send_to = self
            .replicas
            .iter()
            .copied()
            .filter(|id| *id != self.site_id)
            .collect();

        let mut done = Vec::new();
        for (key, counter) in self.counters.iter_mut() {
            if counter.update_replicas(&self.replicas) == ReplicaUpdate::Done {
                done.push(*key);
            }
        }
        // BTreeMap iteration already yields (txn, handle) order; keep the
        // explicit sort as the ordering is a correctness requirement, not
        // an artifact of the container.
        done.sort_unstable();

        for key in done {
            let Some(mut counter) = self.counters.remove(&key) else {
                continue;
            };
            let txn = self.outstanding.get(&key.0);
            if txn.is_none() || txn.is_some_and(TxnState::is_done) {
                // MP writes advance to the txn's first handle, SP writes to
                // the counter key's handle.
                let safe_handle = self
                    .outstanding
                    .remove(&key.0)
                    .map(|t| t.sp_handle)
                    .unwrap_or(key.1);
                self.advance_truncation(safe_handle);
            }
            match counter.take_last_response() {
                Some(Message::FragmentResponse(mut resp)) => {
                    // The coordinator tracks dependencies per executor site.
                    resp.executor_site = self.site_id;
                    self.mailbox
                        .send(counter.destination(), Message::FragmentResponse(resp));
                }
                Some(resp) => {
                    if counter.destination() != NO_DESTINATION {
                        self.mailbox.send(counter.destination(), resp);
                    }
                }
                None => {
                    tracing::warn!(
                        txn_id = counter.txn_id(),
                        "txn lost all replicas with no response recorded"
                    );
                }
            }
        }

        let written = self.write_viable_replay_entry();
        Self::block_fault_log_write(self.partition, written);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message entry points
    // ------------------------------------------------------------------

    /// Receive one message from the mailbox, sequencing replay traffic
    /// before dispatch.
    pub fn receive(&mut self, message: Message) -> Result<()> {
        let Some(unique_id) = message.replay_unique_id() else {
            return self.deliver(message);
        };

        if !self.is_leader {
            // Replicas track replay progress without buffering.
            self.replay.update_last_seen(unique_id);
            self.replay.update_last_polled(unique_id);
            return self.deliver(message);
        }

        if let Some(dupe) = self.replay.dedupe(unique_id, &message) {
            let dest = dupe.initiator;
            self.mailbox.send(dest, Message::InitiateResponse(dupe));
            return Ok(());
        }

        match self.replay.offer(unique_id, message) {
            SequenceDecision::Deliver(message) => self.deliver(message),
            SequenceDecision::Queued => self.deliver_ready_replay(),
        }
    }

    /// Dispatch one message. Fatal protocol violations and determinism
    /// failures surface as errors; the embedding node owns process fate.
    pub fn deliver(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Initiate(m) => self.handle_initiate(m),
            Message::InitiateResponse(m) => self.handle_initiate_response(m),
            Message::Fragment(m) => self.handle_fragment(m),
            Message::FragmentResponse(m) => self.handle_fragment_response(m),
            Message::CompleteTxn(m) => self.handle_complete(m),
            Message::CompleteTxnResponse(m) => self.handle_complete_response(m),
            Message::Borrow(m) => self.handle_borrow(m),
            Message::MpSentinel(m) => {
                tracing::debug!(txn_id = m.txn_id, "sentinel outside replay; ignored");
                Ok(())
            }
            Message::LogFault(m) => self.handle_log_fault(m),
            Message::RepairLogTruncate(m) => self.handle_truncate_broadcast(m),
            Message::DummyTask(m) => self.handle_dummy_task(m),
            Message::DummyResponse(m) => self.handle_dummy_response(m),
            Message::Dump => self.handle_dump(),
            Message::DumpPlanThenExit(m) => self.handle_dump_plan(m),
        }
    }

    /// Repair entry used during leader promotion: perform the work locally
    /// when this site needs it, forward to the remaining repair targets, and
    /// collect their responses under one counter.
    pub fn repair(&mut self, needs_repair: &[SiteId], message: Message) -> Result<()> {
        match message {
            Message::Initiate(m) => self.repair_initiate(needs_repair, m),
            Message::Fragment(m) => self.repair_fragment(needs_repair, m),
            Message::CompleteTxn(mut m) => {
                // Safe to run complete-transaction repair through the
                // ordinary leader path on every target.
                m.to_leader = true;
                self.handle_complete(m)
            }
            other => bail!("unexpected repair message: {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Single-partition initiation
    // ------------------------------------------------------------------

    fn handle_initiate(&mut self, message: InitiateTask) -> Result<()> {
        ensure!(
            message.single_partition,
            "partition scheduler received a multi-partition initiation"
        );

        if self.is_leader || message.read_only {
            // A short-circuit read is only legal when the client interface
            // is local to this host; a remote FAST read on a non-leader
            // means routing is broken.
            if !self.is_leader
                && message.read_only
                && self.read_level == ReadLevel::Fast
                && host_of(message.initiator) != host_of(self.site_id)
            {
                bail!(
                    "site {} accepted a short-circuit read from remote host {}",
                    self.site_id,
                    host_of(message.initiator)
                );
            }

            let new_handle;
            let unique_id;
            if message.for_replay {
                unique_id = message.unique_id;
                self.unique_ids.adopt(unique_id)?;
                new_handle = self.sp_handles.advance();
                self.note_scheduled(new_handle);
            } else if self.is_leader && !message.read_only {
                new_handle = self.sp_handles.advance();
                self.note_scheduled(new_handle);
                unique_id = self.unique_ids.next();
            } else {
                // Reads reuse the newest scheduled handle; a timestamp-only
                // unique id keeps read-heavy time from going bursty.
                unique_id = self.unique_ids.synthetic_now();
                new_handle = self.max_scheduled;
            }

            let mut stamped = message;
            stamped.trunc_handle = self.truncation.handle();
            stamped.sp_handle = new_handle;
            self.repair_log
                .record(new_handle, Message::Initiate(stamped.clone()));
            // Every-site system procedures keep their upstream ids.
            if !stamped.invocation.is_everysite() {
                stamped.txn_id = new_handle;
                stamped.unique_id = unique_id;
            }

            if self.is_leader && !stamped.read_only && !self.send_to.is_empty() {
                let mut replica = stamped.clone();
                replica.initiator = self.site_id;
                replica.coordinator = self.site_id;
                replica.replica_copy = true;
                replica.trunc_handle = self.truncation.handle_for_replicas();
                self.mailbox
                    .multicast(&self.send_to, Message::Initiate(replica));

                let counter = DuplicateCounter::new(
                    stamped.initiator,
                    stamped.txn_id,
                    self.replicas.clone(),
                    Message::Initiate(stamped.clone()),
                );
                self.add_counter((stamped.txn_id, new_handle), counter)?;
            }

            self.offer_initiate_task(stamped)
        } else {
            // Replica receiving the leader's copy of a write.
            self.set_max_seen(message.sp_handle);
            self.repair_log
                .record(message.sp_handle, Message::Initiate(message.clone()));
            // Run-everywhere txns carry the coordinator's unique id; only
            // adopt ids minted for this partition.
            if UniqueIdAllocator::partition_of(message.unique_id) == self.partition {
                self.unique_ids.adopt(message.unique_id)?;
            }
            self.offer_initiate_task(message)
        }
    }

    fn offer_initiate_task(&mut self, message: InitiateTask) -> Result<()> {
        let shortcut_read = message.read_only && self.read_level == ReadLevel::Fast;
        let envelope = LogEnvelope {
            sp_handle: message.sp_handle,
            unique_id: message.unique_id,
            involved_partitions: Vec::new(),
            initiate: Some(message.clone()),
        };
        let task = SiteTask::Procedure {
            msg: message,
            completion: None,
        };
        if shortcut_read {
            self.tasks.offer(task);
            return Ok(());
        }
        self.log_task(task, envelope);
        Ok(())
    }

    /// Hand a task to the command log. An async log returns the task with a
    /// back-pressure completion; a sync log retains it for redelivery.
    fn log_task(&mut self, task: SiteTask, envelope: LogEnvelope) {
        match &self.command_log {
            None => self.tasks.offer(task),
            Some(log) => match log.log(task, envelope) {
                LogResult::Offer {
                    mut task,
                    completion,
                } => {
                    task.set_completion(completion);
                    self.tasks.offer(task);
                }
                LogResult::Pending => {}
            },
        }
    }

    fn handle_initiate_response(&mut self, response: InitiateResponse) -> Result<()> {
        if response.read_only {
            // Reads never have counters and never advance the truncation
            // point.
            if self.read_level == ReadLevel::Fast || !self.is_leader {
                self.mailbox
                    .send(response.initiator, Message::InitiateResponse(response));
                return Ok(());
            }
            let trunc = self.truncation.handle();
            let buffered = self
                .buffered_reads
                .as_mut()
                .expect("safe read level allocates the buffered read log");
            buffered.offer_initiate(self.mailbox.as_ref(), response, trunc);
            return Ok(());
        }

        let key = (response.txn_id, response.sp_handle);
        let outcome = self
            .counters
            .get_mut(&key)
            .map(|counter| counter.offer_initiate(&response));
        match outcome {
            Some(CounterOutcome::Done) => {
                let mut counter = self.counters.remove(&key).expect("counter just offered");
                self.advance_truncation(response.sp_handle);
                if counter.destination() != NO_DESTINATION {
                    if let Some(resp) = counter.take_last_response() {
                        self.mailbox.send(counter.destination(), resp);
                    }
                }
                Ok(())
            }
            Some(CounterOutcome::Waiting) => Ok(()),
            Some(CounterOutcome::Mismatch) => {
                self.determinism_failure(&key, "replicas produced different results")
            }
            Some(CounterOutcome::Abort) => self.determinism_failure(
                &key,
                "transaction succeeded on one replica and rolled back on another",
            ),
            None => {
                // Leader without replication, or a replica answering the
                // leader's copy.
                self.advance_truncation(response.sp_handle);
                self.mailbox
                    .send(response.initiator, Message::InitiateResponse(response));
                Ok(())
            }
        }
    }

    /// A determinism failure is cluster-fatal: ask the peers to dump their
    /// plans and exit, then report the failure to the embedding node.
    fn determinism_failure(&mut self, key: &CounterKey, reason: &str) -> Result<()> {
        let procedure = self
            .counters
            .get(key)
            .map(|c| c.procedure_name().to_string())
            .unwrap_or_default();
        if self.is_leader && !self.send_to.is_empty() {
            tracing::info!(?key, procedure, "sending dump plan request to replicas");
            self.mailbox.multicast(
                &self.send_to,
                Message::DumpPlanThenExit(DumpPlanThenExit {
                    procedure: procedure.clone(),
                    source: self.site_id,
                }),
            );
        }
        bail!("hash mismatch: {reason} (procedure {procedure})");
    }

    // ------------------------------------------------------------------
    // Multi-partition fragments
    // ------------------------------------------------------------------

    fn handle_fragment(&mut self, message: FragmentTask) -> Result<()> {
        let mut stamped = message.clone();
        // A demoted site keeps handling fragments addressed to it as the
        // original leader until the migration drains.
        if !message.replica_copy && (self.is_leader || message.handled_by_original_leader) {
            let new_handle = if message.read_only {
                self.max_scheduled
            } else {
                let handle = self.sp_handles.advance();
                if !self.outstanding.contains_key(&message.txn_id) {
                    self.note_scheduled(handle);
                }
                handle
            };
            stamped.sp_handle = new_handle;
            if let Some(initiate) = stamped.initiate.as_mut() {
                initiate.sp_handle = new_handle;
            }
            self.repair_log
                .record(new_handle, Message::Fragment(stamped.clone()));

            // Read-only work is not propagated unless it's a sysproc that
            // expects to run everywhere; skipping it avoids a determinism
            // check and the extra messaging.
            if !self.send_to.is_empty()
                && (!message.read_only || stamped.kind != FragmentKind::Normal)
            {
                let mut replica = stamped.clone();
                replica.initiator = self.site_id;
                replica.coordinator = self.site_id;
                replica.replica_copy = true;
                replica.trunc_handle = self.truncation.handle_for_replicas();
                self.mailbox
                    .multicast(&self.send_to, Message::Fragment(replica));

                let counter = if stamped.kind == FragmentKind::SysProcPerSite {
                    DuplicateCounter::per_site(
                        message.coordinator,
                        message.txn_id,
                        self.replicas.clone(),
                        Message::Fragment(message.clone()),
                    )
                } else {
                    DuplicateCounter::new(
                        message.coordinator,
                        message.txn_id,
                        self.replicas.clone(),
                        Message::Fragment(message.clone()),
                    )
                };
                self.add_counter((message.txn_id, new_handle), counter)?;
            }
        } else {
            self.repair_log
                .record(stamped.sp_handle, Message::Fragment(stamped.clone()));
            self.set_max_seen(stamped.sp_handle);
        }
        self.offer_fragment_task(stamped, None, true)
    }

    fn offer_fragment_task(
        &mut self,
        message: FragmentTask,
        input_deps: Option<BTreeMap<u32, bytes::Bytes>>,
        bufferable: bool,
    ) -> Result<()> {
        let mut log_this = false;
        if !self.outstanding.contains_key(&message.txn_id) {
            self.outstanding
                .insert(message.txn_id, TxnState::participant(&message));
            // First fragment for the txn: writes and safe reads go through
            // the command log, fast reads straight to the queue.
            let shortcut_read = message.read_only && self.read_level == ReadLevel::Fast;
            log_this = !shortcut_read;
        }

        // Read-only transactions close out on their final fragment without
        // waiting for a complete-transaction message.
        let read_only_txn = self
            .outstanding
            .get(&message.txn_id)
            .is_some_and(|t| t.read_only);
        if message.final_task && read_only_txn {
            self.outstanding.remove(&message.txn_id);
        }

        let envelope = LogEnvelope {
            sp_handle: message.sp_handle,
            unique_id: message
                .initiate
                .as_ref()
                .map(|i| i.unique_id)
                .unwrap_or(NO_HANDLE),
            involved_partitions: message.involved_partitions.clone(),
            initiate: message.initiate.as_deref().cloned(),
        };
        let txn_id = message.txn_id;
        let task = SiteTask::Fragment {
            msg: message,
            input_deps,
            bufferable,
            completion: None,
        };

        if log_this {
            match &self.command_log {
                None => self.queue_or_offer_mp(task),
                Some(log) => match log.log(task, envelope) {
                    LogResult::Offer {
                        mut task,
                        completion,
                    } => {
                        task.set_completion(completion);
                        self.queue_or_offer_mp(task);
                    }
                    LogResult::Pending => {
                        // First fragment of an MP txn under synchronous
                        // logging: gate later work for this txn until the
                        // entry is durable.
                        self.mp_gate.open(txn_id)?;
                    }
                },
            }
            Ok(())
        } else {
            self.queue_or_offer_mp(task);
            Ok(())
        }
    }

    fn queue_or_offer_mp(&mut self, task: SiteTask) {
        if let Some(task) = self.mp_gate.queue_or_pass(task) {
            self.tasks.offer(task);
        }
    }

    /// Durability callback: the first fragment of the txn is on disk, so the
    /// work queued behind it may flow to the site in arrival order.
    pub fn offer_pending_mp_tasks(&mut self, txn_id: TxnId) {
        for task in self.mp_gate.drain(txn_id) {
            self.tasks.offer(task);
        }
    }

    fn handle_fragment_response(&mut self, response: FragmentResponse) -> Result<()> {
        if response.misrouted {
            self.mailbox
                .send(response.destination, Message::FragmentResponse(response));
            return Ok(());
        }

        let key = (response.txn_id, response.sp_handle);
        let outcome = self
            .counters
            .get_mut(&key)
            .map(|counter| counter.offer_fragment(&response));
        match outcome {
            Some(CounterOutcome::Done) => {
                let force = response.handled_by_original_leader;
                if let Some(txn) = self.outstanding.get(&response.txn_id) {
                    if txn.is_done() {
                        let handle = txn.sp_handle;
                        self.advance_truncation_with(handle, force);
                    }
                }
                let mut counter = self.counters.remove(&key).expect("counter just offered");
                if let Some(Message::FragmentResponse(mut resp)) = counter.take_last_response() {
                    resp.executor_site = self.site_id;
                    self.mailbox
                        .send(counter.destination(), Message::FragmentResponse(resp));
                }
                return Ok(());
            }
            Some(CounterOutcome::Waiting) => return Ok(()),
            Some(CounterOutcome::Mismatch) => {
                bail!("hash mismatch running multi-partition work")
            }
            Some(CounterOutcome::Abort) => {
                bail!("partial rollback running multi-partition work")
            }
            None => {}
        }

        let txn = self.outstanding.get(&response.txn_id);
        if self.read_level == ReadLevel::Safe
            && self.is_leader
            && !self.send_to.is_empty()
            && response.bufferable
            && txn.map_or(true, |t| t.read_only)
        {
            // One-shot reads and multi-fragment MP reads wait for preceding
            // writes to be acknowledged across the cluster.
            let gate = txn.map(|t| t.sp_handle).unwrap_or(response.sp_handle);
            let trunc = self.truncation.handle();
            let buffered = self
                .buffered_reads
                .as_mut()
                .expect("safe read level allocates the buffered read log");
            buffered.offer_fragment(self.mailbox.as_ref(), response, gate, trunc);
            return Ok(());
        }

        if let Some(txn) = txn {
            if !txn.read_only && txn.is_done() {
                let handle = txn.sp_handle;
                self.advance_truncation(handle);
            }
        }
        self.mailbox
            .send(response.destination, Message::FragmentResponse(response));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Complete-transaction handling
    // ------------------------------------------------------------------

    fn handle_complete(&mut self, message: CompleteTxn) -> Result<()> {
        let original = message.clone();
        let mut stamped = message;
        // The message targets whichever site the coordinator believes leads
        // the partition; during migration that may be a just-demoted site.
        if stamped.to_leader {
            let handle = self.sp_handles.advance();
            stamped.coordinator = self.site_id;
            stamped.sp_handle = handle;
            stamped.to_leader = false;
            stamped.ack_requested = true;
            self.repair_log
                .record(handle, Message::CompleteTxn(stamped.clone()));
            if !self.send_to.is_empty() && !stamped.read_only {
                self.mailbox
                    .multicast(&self.send_to, Message::CompleteTxn(stamped.clone()));
            }
        } else if !self.is_leader {
            self.set_max_seen(stamped.sp_handle);
            if self.outstanding.contains_key(&stamped.txn_id) {
                self.repair_log
                    .record(stamped.sp_handle, Message::CompleteTxn(stamped.clone()));
            }
        }

        if let Some(txn) = self.outstanding.get(&stamped.txn_id) {
            let sysproc = txn.sysproc;
            if !self.send_to.is_empty()
                && original.to_leader
                && !stamped.restart
                && (!stamped.read_only || sysproc)
            {
                let counter = DuplicateCounter::new(
                    stamped.coordinator,
                    stamped.txn_id,
                    self.replicas.clone(),
                    Message::CompleteTxn(original),
                );
                self.add_counter((stamped.txn_id, stamped.sp_handle), counter)?;
            }
            let task = SiteTask::CompleteTxn { msg: stamped };
            self.queue_or_offer_mp(task);
            Ok(())
        } else {
            // Rejoin cutoff: this site never saw the fragments, but the
            // leader may already be waiting on replica responses. Keep the
            // ack request so the synthesized response still bounces up.
            let response = CompleteTxnResponse {
                txn_id: stamped.txn_id,
                sp_handle: stamped.sp_handle,
                source: self.site_id,
                restart: stamped.restart,
                ack_requested: stamped.ack_requested,
                sp_initiator: stamped.coordinator,
            };
            self.handle_complete_response(response)
        }
    }

    fn handle_complete_response(&mut self, response: CompleteTxnResponse) -> Result<()> {
        let key = (response.txn_id, response.sp_handle);
        let mut txn_done = !response.restart;
        if let Some(counter) = self.counters.get_mut(&key) {
            txn_done = counter.offer_complete(&response) == CounterOutcome::Done;
        }

        if txn_done {
            ensure!(
                !response.restart,
                "restarted txn {} cannot complete",
                response.txn_id
            );
            self.counters.remove(&key);
            if let Some(mut txn) = self.outstanding.remove(&response.txn_id) {
                txn.mark_done();
                // Advancing here rather than on the fragment response keeps
                // replicas from treating a fragment as committed before the
                // whole MP txn is.
                self.advance_truncation(txn.sp_handle);
            }
        }

        // The response ends at the partition leader; the coordinator does
        // not track it.
        if !self.is_leader && response.ack_requested {
            let dest = response.sp_initiator;
            self.mailbox.send(dest, Message::CompleteTxnResponse(response));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Borrowed work, flushes, faults, diagnostics
    // ------------------------------------------------------------------

    /// Borrowed MP reads run locally without replication and do not advance
    /// the sp-handle; the next message from the leader would move it
    /// backwards anyway.
    fn handle_borrow(&mut self, message: BorrowTask) -> Result<()> {
        let task = SiteTask::Fragment {
            msg: message.fragment,
            input_deps: Some(message.input_deps),
            bufferable: false,
            completion: None,
        };
        self.tasks.offer(task);
        Ok(())
    }

    fn handle_dummy_task(&mut self, message: DummyTask) -> Result<()> {
        let mut stamped = message;
        if self.is_leader {
            let handle = self.sp_handles.advance();
            self.note_scheduled(handle);
            // The command log tracks unique ids, so even a no-op advances
            // the generator.
            let unique_id = self.unique_ids.next();
            stamped = DummyTask {
                txn_id: handle,
                sp_handle: handle,
                unique_id,
                sp_initiator: self.site_id,
            };
            if !self.send_to.is_empty() {
                self.mailbox
                    .multicast(&self.send_to, Message::DummyTask(stamped.clone()));
                let counter = DuplicateCounter::new(
                    NO_DESTINATION,
                    stamped.txn_id,
                    self.replicas.clone(),
                    Message::DummyTask(stamped.clone()),
                );
                self.add_counter((stamped.txn_id, handle), counter)?;
            }
        } else {
            self.set_max_seen(stamped.sp_handle);
        }

        let envelope = LogEnvelope {
            sp_handle: stamped.sp_handle,
            unique_id: stamped.unique_id,
            involved_partitions: Vec::new(),
            initiate: None,
        };
        let task = SiteTask::Flush {
            msg: stamped,
            completion: None,
        };
        self.log_task(task, envelope);
        Ok(())
    }

    fn handle_dummy_response(&mut self, response: DummyResponse) -> Result<()> {
        let key = (response.txn_id, response.sp_handle);
        let outcome = self
            .counters
            .get_mut(&key)
            .map(|counter| counter.offer_dummy(&response));
        match outcome {
            None => {
                // Leader without replication, or the replica's own copy.
                self.advance_truncation(response.sp_handle);
                if !self.is_leader {
                    let dest = response.sp_initiator;
                    self.mailbox.send(dest, Message::DummyResponse(response));
                }
            }
            Some(CounterOutcome::Done) => {
                self.counters.remove(&key);
                self.advance_truncation(response.sp_handle);
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Replicas receive this when the leader writes a viable-replay entry:
    /// write the local entry at the given handle and block until it is on
    /// disk before taking more transactions.
    fn handle_log_fault(&mut self, message: LogFault) -> Result<()> {
        let written = self.write_fault_entry_at(message.fault_handle);
        Self::block_fault_log_write(self.partition, written);
        self.set_max_seen(message.fault_handle);
        self.unique_ids.adopt(message.unique_id)?;
        if let Some(log) = &self.command_log {
            log.initialize_last_durable(self.unique_ids.last_unique_id());
        }
        Ok(())
    }

    fn handle_truncate_broadcast(&mut self, message: RepairLogTruncate) -> Result<()> {
        self.truncation.advance(message.handle);
        self.repair_log.truncate(self.truncation.handle());
        Ok(())
    }

    fn handle_dump(&mut self) -> Result<()> {
        tracing::warn!(
            partition = self.partition,
            site = self.site_id,
            is_leader = self.is_leader,
            replicas = ?self.replicas,
            current_handle = self.sp_handles.current(),
            truncation_handle = self.truncation.handle(),
            outstanding = ?self.outstanding.keys().collect::<Vec<_>>(),
            counters = self.counters.len(),
            replay_pending = self.replay.pending_len(),
            "state dump"
        );
        for (key, counter) in &self.counters {
            tracing::warn!(?key, procedure = counter.procedure_name(), "open counter");
        }
        if self.is_leader && !self.send_to.is_empty() {
            self.mailbox.multicast(&self.send_to, Message::Dump);
        }
        Ok(())
    }

    fn handle_dump_plan(&mut self, message: DumpPlanThenExit) -> Result<()> {
        tracing::error!(
            reporter = message.source,
            procedure = message.procedure,
            "peer detected a hash mismatch; shutting down"
        );
        bail!("hash mismatch reported by site {}", message.source);
    }

    // ------------------------------------------------------------------
    // Repair
    // ------------------------------------------------------------------

    fn repair_initiate(&mut self, needs_repair: &[SiteId], message: InitiateTask) -> Result<()> {
        ensure!(
            message.single_partition,
            "repair received a multi-partition initiation"
        );
        // Expect exactly the repair targets to answer. The original client
        // interface is gone, so the aggregated response goes nowhere.
        let counter = DuplicateCounter::new(
            NO_DESTINATION,
            message.txn_id,
            needs_repair.to_vec(),
            Message::Initiate(message.clone()),
        );
        self.add_counter((message.txn_id, message.sp_handle), counter)?;
        self.unique_ids.adopt(message.unique_id)?;

        let mut remote: Vec<SiteId> = needs_repair.to_vec();
        if let Some(at) = remote.iter().position(|id| *id == self.site_id) {
            remote.remove(at);
            self.offer_initiate_task(message.clone())?;
        }
        if !remote.is_empty() {
            let mut replica = message;
            replica.initiator = self.site_id;
            replica.coordinator = self.site_id;
            replica.replica_copy = true;
            self.mailbox.multicast(&remote, Message::Initiate(replica));
        }
        Ok(())
    }

    fn repair_fragment(&mut self, needs_repair: &[SiteId], message: FragmentTask) -> Result<()> {
        let counter = DuplicateCounter::new(
            // The coordinator's site does not change across SP repair.
            message.coordinator,
            message.txn_id,
            needs_repair.to_vec(),
            Message::Fragment(message.clone()),
        );
        self.add_counter((message.txn_id, message.sp_handle), counter)?;

        let mut remote: Vec<SiteId> = needs_repair.to_vec();
        if let Some(at) = remote.iter().position(|id| *id == self.site_id) {
            ensure!(
                !self.outstanding.contains_key(&message.txn_id),
                "repair delivered a fragment this site has already seen (txn {})",
                message.txn_id
            );
            remote.remove(at);
            self.offer_fragment_task(message.clone(), None, true)?;
        }
        if !remote.is_empty() {
            let mut replica = message;
            replica.initiator = self.site_id;
            replica.coordinator = self.site_id;
            replica.replica_copy = true;
            self.mailbox.multicast(&remote, Message::Fragment(replica));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Balance-leader checkpoint
    // ------------------------------------------------------------------

    /// The outgoing leader records the highest scheduled handle at the start
    /// of a leader migration.
    pub fn checkpoint_balance(&mut self) {
        self.balance_checkpoint = self.max_scheduled;
        tracing::info!(
            site = self.site_id,
            checkpoint = self.balance_checkpoint,
            "leader migration checkpoint"
        );
    }

    /// True once every duplicate counter opened below the checkpoint has
    /// drained; the new leader may then replay in-flight work.
    pub fn txn_done_before_checkpoint(&mut self) -> bool {
        if self.balance_checkpoint == NO_HANDLE {
            return false;
        }
        let blocking: Vec<CounterKey> = self
            .counters
            .keys()
            .copied()
            .filter(|(_, handle)| *handle < self.balance_checkpoint)
            .collect();
        if !blocking.is_empty() {
            tracing::debug!(
                checkpoint = self.balance_checkpoint,
                ?blocking,
                "counters still open below the migration checkpoint"
            );
            return false;
        }
        tracing::info!(
            site = self.site_id,
            checkpoint = self.balance_checkpoint,
            "in-flight work before the migration checkpoint has completed"
        );
        self.balance_checkpoint = NO_HANDLE;
        true
    }

    // ------------------------------------------------------------------
    // Truncation and fault-log plumbing
    // ------------------------------------------------------------------

    fn note_scheduled(&mut self, handle: SpHandle) {
        self.max_scheduled = self.max_scheduled.max(handle);
    }

    fn advance_truncation(&mut self, handle: SpHandle) {
        self.advance_truncation_with(handle, false);
    }

    fn advance_truncation_with(&mut self, handle: SpHandle, force: bool) {
        if !self.truncation.advance(handle) {
            return;
        }
        self.repair_log.truncate(self.truncation.handle());
        // Replicas advance their local point quietly so a promotion with no
        // missing repair transactions can still release reads.
        if !self.is_leader && !force {
            return;
        }
        self.release_buffered_reads();
        self.schedule_truncation_broadcast();
    }

    fn release_buffered_reads(&mut self) {
        let trunc = self.truncation.handle();
        if let Some(buffered) = self.buffered_reads.as_mut() {
            buffered.release(self.mailbox.as_ref(), trunc);
        }
    }

    /// Defer the explicit truncation broadcast through the task queue; by
    /// the time it runs a replicated message has usually carried the handle
    /// already and the broadcast is suppressed.
    fn schedule_truncation_broadcast(&mut self) {
        if self.send_to.is_empty() {
            return;
        }
        self.tasks.offer(SiteTask::TruncationBroadcast);
    }

    /// Body of the deferred broadcast task.
    pub fn flush_truncation(&mut self) {
        if !self.truncation.broadcast_due() {
            return;
        }
        self.truncation.mark_broadcast();
        let handle = self.truncation.handle();
        // Keep the local repair log's point current as well.
        self.repair_log.truncate(handle);
        if !self.send_to.is_empty() {
            self.mailbox.multicast(
                &self.send_to,
                Message::RepairLogTruncate(RepairLogTruncate { handle }),
            );
        }
    }

    /// Snapshot-monitor callback, run under the partition lock.
    pub fn snapshot_completed(&mut self, truncation_snapshot: bool, succeeded: bool) {
        if truncation_snapshot && succeeded {
            self.write_viable_replay_entry();
        }
    }

    /// If appropriate, write the viable replay set to the command log and
    /// tell the replicas to do the same. Safe to call from either role.
    fn write_viable_replay_entry(&mut self) -> Option<StatusHandle> {
        if !self.replay_complete || !self.is_leader {
            return None;
        }
        let fault_handle = self.sp_handles.advance();
        let written = self.write_fault_entry_at(fault_handle);
        let fault = LogFault {
            fault_handle,
            unique_id: self.unique_ids.last_unique_id(),
        };
        if !self.send_to.is_empty() {
            self.mailbox.multicast(&self.send_to, Message::LogFault(fault));
        }
        written
    }

    fn write_fault_entry_at(&mut self, fault_handle: SpHandle) -> Option<StatusHandle> {
        if !self.replay_complete {
            return None;
        }
        let log = self.command_log.as_ref()?;
        log.log_fault(self.site_id, &self.replicas, self.partition, fault_handle)
    }

    fn block_fault_log_write(partition: PartitionId, written: Option<StatusHandle>) {
        let Some(written) = written else {
            return;
        };
        if !written.wait() {
            tracing::warn!(partition, "viable replay entry was not written");
        }
    }

    // ------------------------------------------------------------------
    // Counter registry
    // ------------------------------------------------------------------

    /// Plain insertion is unsafe: colliding keys from two different
    /// transactions are a protocol violation unless both are complete
    /// messages from distinct coordinators (leader migration).
    fn add_counter(&mut self, key: CounterKey, counter: DuplicateCounter) -> Result<()> {
        match self.counters.get(&key) {
            None => {
                self.counters.insert(key, counter);
                Ok(())
            }
            Some(existing) => {
                if existing.collision_from_leader_migration(&counter) {
                    tracing::info!(
                        ?key,
                        "complete-transaction counters collided across a leader migration"
                    );
                    return Ok(());
                }
                tracing::error!(
                    ?key,
                    existing = ?existing.open_message(),
                    incoming = ?counter.open_message(),
                    "duplicate counter key collision"
                );
                bail!("two duplicate counters collided on {key:?}");
            }
        }
    }

    fn deliver_ready_replay(&mut self) -> Result<()> {
        while let Some(message) = self.replay.poll() {
            self.deliver(message)?;
        }
        while let Some(message) = self.replay.drain() {
            match message {
                Message::Initiate(task) => {
                    // Replay ended before this could be sequenced; reject it
                    // back to the initiator.
                    let response = InitiateResponse::ignored(&task, self.site_id);
                    self.mailbox
                        .send(task.initiator, Message::InitiateResponse(response));
                }
                other => {
                    tracing::debug!(message = ?other, "dropping unsequenced replay message");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::super::types::{Invocation, ProcedureScope, ResponseStatus};
    use super::*;

    #[derive(Default)]
    struct RecordingMailbox {
        sent: Mutex<Vec<(SiteId, Message)>>,
    }

    impl RecordingMailbox {
        fn take(&self) -> Vec<(SiteId, Message)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    impl Mailbox for RecordingMailbox {
        fn send(&self, dest: SiteId, msg: Message) {
            self.sent.lock().unwrap().push((dest, msg));
        }

        fn multicast(&self, dests: &[SiteId], msg: Message) {
            for dest in dests {
                self.send(*dest, msg.clone());
            }
        }
    }

    #[derive(Default)]
    struct RecordingQueue {
        tasks: Mutex<VecDeque<SiteTask>>,
    }

    impl RecordingQueue {
        fn pop(&self) -> Option<SiteTask> {
            self.tasks.lock().unwrap().pop_front()
        }

        fn len(&self) -> usize {
            self.tasks.lock().unwrap().len()
        }

        fn execution_len(&self) -> usize {
            self.tasks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| !matches!(t, SiteTask::TruncationBroadcast))
                .count()
        }
    }

    impl TaskQueue for RecordingQueue {
        fn offer(&self, task: SiteTask) {
            self.tasks.lock().unwrap().push_back(task);
        }
    }

    struct SyncFakeLog {
        retained: Mutex<Vec<SiteTask>>,
        faults: Mutex<Vec<SpHandle>>,
    }

    impl SyncFakeLog {
        fn new() -> Self {
            Self {
                retained: Mutex::new(Vec::new()),
                faults: Mutex::new(Vec::new()),
            }
        }

        fn take_retained(&self) -> Vec<SiteTask> {
            std::mem::take(&mut self.retained.lock().unwrap())
        }

        fn fault_count(&self) -> usize {
            self.faults.lock().unwrap().len()
        }
    }

    impl CommandLog for SyncFakeLog {
        fn is_synchronous(&self) -> bool {
            true
        }

        fn log(&self, task: SiteTask, _envelope: LogEnvelope) -> LogResult {
            self.retained.lock().unwrap().push(task);
            LogResult::Pending
        }

        fn log_fault(
            &self,
            _leader: SiteId,
            _replicas: &[SiteId],
            _partition: PartitionId,
            fault_handle: SpHandle,
        ) -> Option<StatusHandle> {
            self.faults.lock().unwrap().push(fault_handle);
            let handle = StatusHandle::new();
            handle.set(true);
            Some(handle)
        }

        fn initialize_last_durable(&self, _unique_id: super::super::types::UniqueId) {}

        fn register_sink(&self, _sink: Arc<dyn super::super::types::DurabilitySink>) {}
    }

    const LEADER: SiteId = 101;
    const PEER: SiteId = 102;
    const CLIENT: SiteId = 900;
    const COORDINATOR: SiteId = 500;

    struct Harness {
        mailbox: Arc<RecordingMailbox>,
        queue: Arc<RecordingQueue>,
        sched: SpScheduler,
    }

    fn leader_harness(read_level: ReadLevel, replicas: &[SiteId]) -> Harness {
        let mailbox = Arc::new(RecordingMailbox::default());
        let queue = Arc::new(RecordingQueue::default());
        let mut sched = SpScheduler::new(
            SchedulerConfig {
                partition: 0,
                site_id: LEADER,
                read_level,
            },
            mailbox.clone(),
            queue.clone(),
        );
        sched.set_leader_state(true);
        sched
            .update_replicas(replicas.to_vec(), &BTreeMap::new())
            .expect("replica update");
        mailbox.take();
        Harness {
            mailbox,
            queue,
            sched,
        }
    }

    fn write_invocation(txn_id: TxnId) -> InitiateTask {
        InitiateTask {
            initiator: CLIENT,
            coordinator: CLIENT,
            trunc_handle: NO_HANDLE,
            txn_id,
            unique_id: NO_HANDLE,
            read_only: false,
            single_partition: true,
            invocation: Invocation::partition("InsertRow", Bytes::from_static(b"row")),
            ci_handle: 7,
            connection_id: 3,
            for_replay: false,
            replica_copy: false,
            sp_handle: NO_HANDLE,
        }
    }

    fn read_invocation(txn_id: TxnId) -> InitiateTask {
        let mut task = write_invocation(txn_id);
        task.read_only = true;
        task.invocation = Invocation::partition("ScanRows", Bytes::new());
        task
    }

    fn response_for(task: &InitiateTask, source: SiteId, hash: u8) -> InitiateResponse {
        InitiateResponse {
            txn_id: task.txn_id,
            sp_handle: task.sp_handle,
            source,
            initiator: task.initiator,
            ci_handle: task.ci_handle,
            connection_id: task.connection_id,
            read_only: task.read_only,
            status: ResponseStatus::Success,
            result: Bytes::from_static(b"ok"),
            hashes: vec![[hash; 32]],
        }
    }

    /// Pull the procedure message the scheduler queued for execution.
    fn queued_procedure(queue: &RecordingQueue) -> InitiateTask {
        loop {
            match queue.pop() {
                Some(SiteTask::Procedure { msg, .. }) => return msg,
                Some(SiteTask::TruncationBroadcast) => continue,
                other => panic!("expected procedure task, got {other:?}"),
            }
        }
    }

    fn fragment_for(txn_id: TxnId, read_only: bool, final_task: bool) -> FragmentTask {
        FragmentTask {
            initiator: COORDINATOR,
            coordinator: COORDINATOR,
            txn_id,
            sp_handle: NO_HANDLE,
            trunc_handle: NO_HANDLE,
            involved_partitions: vec![0, 1],
            kind: FragmentKind::Normal,
            final_task,
            read_only,
            for_replay: false,
            replica_copy: false,
            handled_by_original_leader: false,
            initiate: None,
        }
    }

    #[test]
    fn replicated_write_aggregates_and_advances_truncation() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER]);
        h.sched
            .deliver(Message::Initiate(write_invocation(555)))
            .expect("deliver write");

        // The peer got a replica copy with the same stamped handle.
        let sent = h.mailbox.take();
        let (dest, copy) = match sent.as_slice() {
            [(dest, Message::Initiate(copy))] => (*dest, copy.clone()),
            other => panic!("unexpected outbound traffic: {other:?}"),
        };
        assert_eq!(dest, PEER);
        assert!(copy.replica_copy);

        let local = queued_procedure(&h.queue);
        assert_eq!(local.txn_id, local.sp_handle, "write txn id is its handle");
        assert_eq!(copy.sp_handle, local.sp_handle);
        assert!(h.sched.has_counter(local.txn_id, local.sp_handle));

        let before = h.sched.truncation_handle();
        h.sched
            .deliver(Message::InitiateResponse(response_for(&local, LEADER, 0xab)))
            .expect("local response");
        assert!(h.sched.has_counter(local.txn_id, local.sp_handle));
        assert!(h.mailbox.take().is_empty(), "no reply before all replicas");

        h.sched
            .deliver(Message::InitiateResponse(response_for(&local, PEER, 0xab)))
            .expect("peer response");
        assert!(!h.sched.has_counter(local.txn_id, local.sp_handle));
        assert_eq!(h.sched.truncation_handle(), local.sp_handle);
        assert!(h.sched.truncation_handle() > before);

        let sent = h.mailbox.take();
        match sent.as_slice() {
            [(dest, Message::InitiateResponse(resp))] => {
                assert_eq!(*dest, CLIENT);
                assert_eq!(resp.txn_id, local.txn_id);
            }
            other => panic!("unexpected aggregate forwarding: {other:?}"),
        }
    }

    #[test]
    fn hash_mismatch_is_fatal_and_alerts_peers() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER]);
        h.sched
            .deliver(Message::Initiate(write_invocation(555)))
            .expect("deliver write");
        h.mailbox.take();
        let local = queued_procedure(&h.queue);

        h.sched
            .deliver(Message::InitiateResponse(response_for(&local, LEADER, 0xab)))
            .expect("local response");
        let err = h
            .sched
            .deliver(Message::InitiateResponse(response_for(&local, PEER, 0xde)))
            .expect_err("divergent hash must be fatal");
        assert!(err.to_string().contains("hash mismatch"), "{err}");

        let sent = h.mailbox.take();
        match sent.as_slice() {
            [(dest, Message::DumpPlanThenExit(plan))] => {
                assert_eq!(*dest, PEER);
                assert_eq!(plan.procedure, "InsertRow");
                assert_eq!(plan.source, LEADER);
            }
            other => panic!("expected dump plan to peer, got {other:?}"),
        }
    }

    #[test]
    fn replay_duplicate_unique_id_is_ignored_not_dispatched() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER]);
        let unique_id = UniqueIdAllocator::from_components(1_600_000_000_000, 1, 0);
        let mut first = write_invocation(42);
        first.for_replay = true;
        first.unique_id = unique_id;
        let second = first.clone();

        h.sched
            .receive(Message::Initiate(first))
            .expect("first replay message");
        assert_eq!(h.queue.execution_len(), 1);

        h.sched
            .receive(Message::Initiate(second))
            .expect("duplicate replay message");
        assert_eq!(h.queue.execution_len(), 1, "duplicate must not dispatch");

        let sent = h.mailbox.take();
        match sent.as_slice() {
            [(dest, Message::InitiateResponse(resp))] => {
                assert_eq!(*dest, CLIENT);
                assert_eq!(resp.status, ResponseStatus::Ignored);
            }
            other => panic!("expected ignored response, got {other:?}"),
        }
    }

    #[test]
    fn safe_read_waits_for_preceding_write() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER]);

        h.sched
            .deliver(Message::Initiate(write_invocation(200)))
            .expect("write");
        h.mailbox.take();
        let write = queued_procedure(&h.queue);

        h.sched
            .deliver(Message::Initiate(read_invocation(201)))
            .expect("read");
        let read = queued_procedure(&h.queue);
        assert_eq!(
            read.sp_handle, write.sp_handle,
            "read reuses the newest scheduled handle"
        );

        // Read executes first; its response must be buffered.
        let mut read_resp = response_for(&read, LEADER, 0x01);
        read_resp.read_only = true;
        h.sched
            .deliver(Message::InitiateResponse(read_resp))
            .expect("read response");
        assert_eq!(h.sched.buffered_read_len(), 1);
        assert!(h.mailbox.take().is_empty(), "read held behind the write");

        h.sched
            .deliver(Message::InitiateResponse(response_for(&write, LEADER, 0xab)))
            .expect("local write response");
        h.sched
            .deliver(Message::InitiateResponse(response_for(&write, PEER, 0xab)))
            .expect("peer write response");

        assert_eq!(h.sched.buffered_read_len(), 0);
        let kinds: Vec<(SiteId, bool)> = h
            .mailbox
            .take()
            .into_iter()
            .map(|(dest, msg)| match msg {
                Message::InitiateResponse(r) => (dest, r.read_only),
                other => panic!("unexpected message: {other:?}"),
            })
            .collect();
        // The read releases while the truncation point advances, before the
        // write's aggregated reply is forwarded.
        assert_eq!(kinds, vec![(CLIENT, true), (CLIENT, false)]);
    }

    #[test]
    fn migration_checkpoint_waits_for_older_counters() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER]);

        h.sched
            .deliver(Message::Initiate(write_invocation(1)))
            .expect("first write");
        let first = queued_procedure(&h.queue);
        h.sched
            .deliver(Message::Initiate(write_invocation(2)))
            .expect("second write");
        let second = queued_procedure(&h.queue);
        h.mailbox.take();

        h.sched.checkpoint_balance();
        assert!(
            !h.sched.txn_done_before_checkpoint(),
            "counter below the checkpoint is still open"
        );

        h.sched
            .deliver(Message::InitiateResponse(response_for(&first, LEADER, 0xab)))
            .expect("local response");
        h.sched
            .deliver(Message::InitiateResponse(response_for(&first, PEER, 0xab)))
            .expect("peer response");
        assert!(h.sched.txn_done_before_checkpoint());
        assert!(
            !h.sched.txn_done_before_checkpoint(),
            "checkpoint resets after reporting completion"
        );
        assert!(h.sched.has_counter(second.txn_id, second.sp_handle));
    }

    #[test]
    fn sync_logging_gates_mp_work_behind_first_fragment() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER]);
        let log = Arc::new(SyncFakeLog::new());
        h.sched.set_command_log(log.clone());

        h.sched
            .deliver(Message::Fragment(fragment_for(900, false, false)))
            .expect("first fragment");
        assert_eq!(h.queue.execution_len(), 0, "first fragment held by the log");

        h.sched
            .deliver(Message::Fragment(fragment_for(900, false, false)))
            .expect("second fragment");
        h.sched
            .deliver(Message::CompleteTxn(CompleteTxn {
                txn_id: 900,
                sp_handle: NO_HANDLE,
                coordinator: COORDINATOR,
                to_leader: true,
                restart: false,
                read_only: false,
                ack_requested: false,
                trunc_handle: NO_HANDLE,
            }))
            .expect("complete");
        assert_eq!(h.queue.execution_len(), 0, "follow-ups queue behind durability");

        // Durability callback: the log redelivers the first fragment, then
        // the gate drains in arrival order.
        for task in log.take_retained() {
            h.queue.offer(task);
        }
        h.sched.offer_pending_mp_tasks(900);

        let mut order = Vec::new();
        while let Some(task) = h.queue.pop() {
            match task {
                SiteTask::Fragment { .. } => order.push("fragment"),
                SiteTask::CompleteTxn { .. } => order.push("complete"),
                SiteTask::TruncationBroadcast => {}
                other => panic!("unexpected task: {other:?}"),
            }
        }
        assert_eq!(order, vec!["fragment", "fragment", "complete"]);
    }

    #[test]
    fn membership_change_drains_done_counters_in_txn_order() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER, 103]);

        h.sched
            .deliver(Message::Initiate(write_invocation(1)))
            .expect("first write");
        let first = queued_procedure(&h.queue);
        h.sched
            .deliver(Message::Initiate(write_invocation(2)))
            .expect("second write");
        let second = queued_procedure(&h.queue);
        h.mailbox.take();

        for msg in [&first, &second] {
            h.sched
                .deliver(Message::InitiateResponse(response_for(msg, LEADER, 0xab)))
                .expect("local response");
            h.sched
                .deliver(Message::InitiateResponse(response_for(msg, 103, 0xab)))
                .expect("surviving peer response");
        }
        assert!(h.sched.has_counter(first.txn_id, first.sp_handle));
        assert!(h.sched.has_counter(second.txn_id, second.sp_handle));

        // PEER vanishes; both counters complete and drain in txn order.
        h.sched
            .update_replicas(vec![LEADER, 103], &BTreeMap::new())
            .expect("replica update");

        let replies: Vec<TxnId> = h
            .mailbox
            .take()
            .into_iter()
            .filter_map(|(dest, msg)| match msg {
                Message::InitiateResponse(r) => {
                    assert_eq!(dest, CLIENT);
                    Some(r.txn_id)
                }
                _ => None,
            })
            .collect();
        assert_eq!(replies, vec![first.txn_id, second.txn_id]);
        assert_eq!(h.sched.truncation_handle(), second.sp_handle);
    }

    #[test]
    fn pipeline_flush_advances_truncation_through_replicas() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER]);
        h.sched
            .deliver(Message::DummyTask(DummyTask {
                txn_id: NO_HANDLE,
                sp_handle: NO_HANDLE,
                unique_id: NO_HANDLE,
                sp_initiator: NO_DESTINATION,
            }))
            .expect("flush");

        let sent = h.mailbox.take();
        let flush = match sent.as_slice() {
            [(dest, Message::DummyTask(flush))] => {
                assert_eq!(*dest, PEER);
                flush.clone()
            }
            other => panic!("expected replicated flush, got {other:?}"),
        };
        assert!(h.sched.has_counter(flush.txn_id, flush.sp_handle));

        for source in [LEADER, PEER] {
            h.sched
                .deliver(Message::DummyResponse(DummyResponse {
                    txn_id: flush.txn_id,
                    sp_handle: flush.sp_handle,
                    source,
                    sp_initiator: LEADER,
                }))
                .expect("flush response");
        }
        assert!(!h.sched.has_counter(flush.txn_id, flush.sp_handle));
        assert_eq!(h.sched.truncation_handle(), flush.sp_handle);
    }

    #[test]
    fn replica_adopts_leader_copy_and_forwards_its_response() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let queue = Arc::new(RecordingQueue::default());
        let mut sched = SpScheduler::new(
            SchedulerConfig {
                partition: 0,
                site_id: PEER,
                read_level: ReadLevel::Safe,
            },
            mailbox.clone(),
            queue.clone(),
        );

        let mut copy = write_invocation(0);
        copy.initiator = LEADER;
        copy.coordinator = LEADER;
        copy.replica_copy = true;
        copy.sp_handle = (40 << 14) | 0;
        copy.txn_id = copy.sp_handle;
        copy.unique_id = UniqueIdAllocator::from_components(1_600_000_000_000, 0, 0);

        sched.deliver(Message::Initiate(copy.clone())).expect("copy");
        assert_eq!(queue.execution_len(), 1);
        assert_eq!(sched.repair_log_len(), 1);

        // Local execution responds; with no counter the replica forwards to
        // the leader.
        sched
            .deliver(Message::InitiateResponse(response_for(&copy, PEER, 0xab)))
            .expect("local response");
        let sent = mailbox.take();
        match sent.as_slice() {
            [(dest, Message::InitiateResponse(_))] => assert_eq!(*dest, LEADER),
            other => panic!("unexpected forwarding: {other:?}"),
        }
    }

    #[test]
    fn misrouted_fragment_responses_bounce_to_their_destination() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER]);
        let response = FragmentResponse {
            txn_id: 40,
            sp_handle: 40,
            source: PEER,
            destination: COORDINATOR,
            executor_site: PEER,
            status: super::super::types::FragmentStatus::UnexpectedError,
            result: Bytes::new(),
            hashes: Vec::new(),
            bufferable: true,
            misrouted: true,
            handled_by_original_leader: false,
        };
        h.sched
            .deliver(Message::FragmentResponse(response))
            .expect("misrouted bounce");
        match h.mailbox.take().as_slice() {
            [(dest, Message::FragmentResponse(resp))] => {
                assert_eq!(*dest, COORDINATOR);
                assert!(resp.misrouted);
                assert_eq!(resp.executor_site, PEER, "forwarded untouched");
            }
            other => panic!("expected misrouted forward, got {other:?}"),
        }
    }

    #[test]
    fn remote_short_circuit_reads_are_rejected_on_replicas() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let queue = Arc::new(RecordingQueue::default());
        let mut sched = SpScheduler::new(
            SchedulerConfig {
                partition: 0,
                site_id: super::super::types::make_site_id(2, 1),
                read_level: ReadLevel::Fast,
            },
            mailbox,
            queue,
        );

        let mut read = read_invocation(5);
        read.initiator = super::super::types::make_site_id(9, 7);
        let err = sched
            .deliver(Message::Initiate(read))
            .expect_err("remote fast read on a replica is a routing failure");
        assert!(err.to_string().contains("short-circuit"), "{err}");
    }

    #[test]
    fn multi_partition_initiation_is_rejected() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER]);
        let mut task = write_invocation(1);
        task.single_partition = false;
        let err = h
            .sched
            .deliver(Message::Initiate(task))
            .expect_err("multi-partition initiations never reach this scheduler");
        assert!(err.to_string().contains("multi-partition"), "{err}");
    }

    #[test]
    fn everysite_sysproc_keeps_upstream_ids() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER]);
        let mut task = write_invocation(555);
        task.unique_id = 12_345;
        task.invocation = Invocation {
            procedure: "@UpdateSettings".to_string(),
            params: Bytes::new(),
            scope: ProcedureScope::EverySite,
        };

        h.sched.deliver(Message::Initiate(task)).expect("everysite");
        let queued = queued_procedure(&h.queue);
        assert_eq!(queued.txn_id, 555, "everysite work keeps its upstream txn id");
        assert_eq!(queued.unique_id, 12_345);
        assert!(queued.sp_handle > NO_HANDLE, "local handle still stamped");
    }

    #[test]
    fn borrowed_reads_run_without_replication() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER]);
        let mut fragment = fragment_for(950, true, false);
        fragment.sp_handle = 17;
        h.sched
            .deliver(Message::Borrow(BorrowTask {
                fragment,
                input_deps: BTreeMap::new(),
            }))
            .expect("borrow");

        assert!(h.mailbox.take().is_empty(), "borrows never replicate");
        assert_eq!(h.sched.outstanding_len(), 0, "borrows are not outstanding");
        match h.queue.pop() {
            Some(SiteTask::Fragment { bufferable, .. }) => {
                assert!(!bufferable, "borrow responses bypass the read buffer")
            }
            other => panic!("expected borrowed fragment task, got {other:?}"),
        }
    }

    #[test]
    fn repair_runs_locally_and_forwards_to_targets() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER]);
        let mut message = write_invocation(0);
        message.txn_id = (7 << 14) | 0;
        message.sp_handle = message.txn_id;
        message.unique_id = UniqueIdAllocator::from_components(1_600_000_000_000, 0, 0);

        h.sched
            .repair(&[LEADER, PEER], Message::Initiate(message.clone()))
            .expect("repair");
        assert!(h.sched.has_counter(message.txn_id, message.sp_handle));

        let local = queued_procedure(&h.queue);
        assert_eq!(local.sp_handle, message.sp_handle);
        match h.mailbox.take().as_slice() {
            [(dest, Message::Initiate(copy))] => {
                assert_eq!(*dest, PEER);
                assert!(copy.replica_copy);
            }
            other => panic!("expected repair copy to peer, got {other:?}"),
        }

        // Both targets answer; the counter drains without forwarding (the
        // original client interface is gone).
        for source in [LEADER, PEER] {
            h.sched
                .deliver(Message::InitiateResponse(response_for(&local, source, 0xab)))
                .expect("repair response");
        }
        assert!(!h.sched.has_counter(message.txn_id, message.sp_handle));
        assert!(h.mailbox.take().is_empty());
    }

    #[test]
    fn truncation_snapshot_rewrites_the_viable_replay_entry() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER]);
        let log = Arc::new(SyncFakeLog::new());
        h.sched.set_command_log(log.clone());

        h.sched
            .enable_fault_log_writes()
            .expect("enable fault log writes");
        assert_eq!(log.fault_count(), 1);

        h.sched.snapshot_completed(true, true);
        assert_eq!(log.fault_count(), 2);

        // Failed or non-truncation snapshots write nothing.
        h.sched.snapshot_completed(true, false);
        h.sched.snapshot_completed(false, true);
        assert_eq!(log.fault_count(), 2);
    }

    #[test]
    fn counter_collision_outside_migration_is_fatal() {
        let mut h = leader_harness(ReadLevel::Safe, &[LEADER, PEER]);
        h.sched
            .deliver(Message::Initiate(write_invocation(1)))
            .expect("write");
        let local = queued_procedure(&h.queue);
        h.mailbox.take();

        // A repaired initiate reusing the same {txn, handle} must collide.
        let mut repair = write_invocation(1);
        repair.txn_id = local.txn_id;
        repair.sp_handle = local.sp_handle;
        let err = h
            .sched
            .repair(&[PEER], Message::Initiate(repair))
            .expect_err("collision must be fatal");
        assert!(err.to_string().contains("collided"), "{err}");
    }
}
