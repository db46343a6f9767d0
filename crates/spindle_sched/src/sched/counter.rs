//! Replica response collector and determinism arbiter.
//!
//! One counter exists per `{txn_id, sp_handle}` for every replicated
//! operation. Each replica response is offered to the counter; the first
//! response fixes the expected result digests, later responses must match
//! them exactly. When every expected replica has answered, the canonical
//! response is forwarded to the counter's destination.

use super::types::{
    CompleteTxnResponse, Digest, DummyResponse, FragmentResponse, FragmentStatus,
    InitiateResponse, Message, ResponseStatus, SiteId, TxnId,
};

/// Result of offering one response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterOutcome {
    /// More replicas still owe a response.
    Waiting,
    /// All expected replicas answered and matched.
    Done,
    /// Replicas produced different result digests.
    Mismatch,
    /// The operation succeeded on one replica and rolled back on another.
    Abort,
}

/// Result of shrinking the expected set on a membership change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaUpdate {
    Continue,
    Done,
}

#[derive(Debug)]
pub struct DuplicateCounter {
    destination: SiteId,
    txn_id: TxnId,
    expected: Vec<SiteId>,
    /// Digest vector fixed by the first response carrying hashes.
    hashes: Option<Vec<Digest>>,
    /// Commit outcome fixed by the first response that reports one.
    succeeded: Option<bool>,
    last_response: Option<Message>,
    /// The notice that opened the counter, kept for collision diagnosis
    /// and mismatch diagnostics.
    open_message: Message,
    /// Per-site system-procedure fragments legitimately differ across
    /// sites; digests are not compared for them.
    per_site: bool,
}

impl DuplicateCounter {
    pub fn new(
        destination: SiteId,
        txn_id: TxnId,
        expected: Vec<SiteId>,
        open_message: Message,
    ) -> Self {
        Self {
            destination,
            txn_id,
            expected,
            hashes: None,
            succeeded: None,
            last_response: None,
            open_message,
            per_site: false,
        }
    }

    /// Counter for per-site sysproc fragments: counts responses without
    /// comparing digests.
    pub fn per_site(
        destination: SiteId,
        txn_id: TxnId,
        expected: Vec<SiteId>,
        open_message: Message,
    ) -> Self {
        let mut counter = Self::new(destination, txn_id, expected, open_message);
        counter.per_site = true;
        counter
    }

    pub fn destination(&self) -> SiteId {
        self.destination
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn open_message(&self) -> &Message {
        &self.open_message
    }

    pub fn last_response(&self) -> Option<&Message> {
        self.last_response.as_ref()
    }

    pub fn take_last_response(&mut self) -> Option<Message> {
        self.last_response.take()
    }

    /// Procedure name from the opening notice, for diagnostics.
    pub fn procedure_name(&self) -> &str {
        match &self.open_message {
            Message::Initiate(m) => &m.invocation.procedure,
            Message::Fragment(m) => m
                .initiate
                .as_ref()
                .map(|i| i.invocation.procedure.as_str())
                .unwrap_or("<fragment>"),
            Message::CompleteTxn(_) => "<complete>",
            _ => "<none>",
        }
    }

    pub fn offer_initiate(&mut self, resp: &InitiateResponse) -> CounterOutcome {
        self.check_common(
            resp.source,
            Some(&resp.hashes),
            Some(resp.status == ResponseStatus::Success),
            Message::InitiateResponse(resp.clone()),
        )
    }

    pub fn offer_fragment(&mut self, resp: &FragmentResponse) -> CounterOutcome {
        self.check_common(
            resp.source,
            Some(&resp.hashes),
            Some(resp.status == FragmentStatus::Success),
            Message::FragmentResponse(resp.clone()),
        )
    }

    pub fn offer_complete(&mut self, resp: &CompleteTxnResponse) -> CounterOutcome {
        self.check_common(
            resp.source,
            None,
            None,
            Message::CompleteTxnResponse(resp.clone()),
        )
    }

    pub fn offer_dummy(&mut self, resp: &DummyResponse) -> CounterOutcome {
        self.check_common(resp.source, None, None, Message::DummyResponse(resp.clone()))
    }

    fn check_common(
        &mut self,
        source: SiteId,
        hashes: Option<&[Digest]>,
        succeeded: Option<bool>,
        response: Message,
    ) -> CounterOutcome {
        if let Some(succeeded) = succeeded {
            match self.succeeded {
                None => self.succeeded = Some(succeeded),
                Some(first) if first != succeeded => {
                    tracing::error!(
                        txn_id = self.txn_id,
                        source,
                        procedure = self.procedure_name(),
                        "replica commit status diverged"
                    );
                    return CounterOutcome::Abort;
                }
                Some(_) => {}
            }
        }

        if !self.per_site {
            if let Some(hashes) = hashes {
                match &self.hashes {
                    None => self.hashes = Some(hashes.to_vec()),
                    Some(expected) if expected.as_slice() != hashes => {
                        tracing::error!(
                            txn_id = self.txn_id,
                            source,
                            procedure = self.procedure_name(),
                            "replica result digests diverged"
                        );
                        return CounterOutcome::Mismatch;
                    }
                    Some(_) => {}
                }
            }
        }

        self.last_response = Some(response);

        match self.expected.iter().position(|id| *id == source) {
            Some(at) => {
                self.expected.remove(at);
            }
            None => {
                tracing::debug!(
                    txn_id = self.txn_id,
                    source,
                    "response from a site no longer in the expected set"
                );
            }
        }

        if self.expected.is_empty() {
            CounterOutcome::Done
        } else {
            CounterOutcome::Waiting
        }
    }

    /// Drop replicas that left the cluster from the expected set.
    pub fn update_replicas(&mut self, replicas: &[SiteId]) -> ReplicaUpdate {
        self.expected.retain(|id| replicas.contains(id));
        if self.expected.is_empty() {
            ReplicaUpdate::Done
        } else {
            ReplicaUpdate::Continue
        }
    }

    /// A colliding key is legal only when both opening notices are
    /// complete-transaction messages from different coordinators, a known
    /// artefact of leader migration.
    pub fn collision_from_leader_migration(&self, other: &DuplicateCounter) -> bool {
        match (&self.open_message, &other.open_message) {
            (Message::CompleteTxn(a), Message::CompleteTxn(b)) => {
                a.coordinator != b.coordinator
            }
            _ => false,
        }
    }
}
