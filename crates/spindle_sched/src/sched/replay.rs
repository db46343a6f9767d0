//! Unique-id ordering for command-log replay.
//!
//! During replay the partition must reproduce the schedule it originally
//! produced. Single-partition replay messages arrive from the local log
//! while multi-partition work arrives from the MP coordinator's log, so the
//! two streams meet here: an MP sentinel in the local stream marks where an
//! MP transaction belongs, and single-partition messages that arrive after
//! it are held until the matching first fragment shows up. Duplicate unique
//! ids are answered with a synthesized ignored-transaction response instead
//! of being dispatched twice.

use std::collections::{BTreeMap, VecDeque};

use super::types::{InitiateResponse, Message, SiteId, UniqueId};

/// What the caller should do with an offered message.
#[derive(Debug)]
pub enum SequenceDecision {
    /// Dispatch now; the sequencer has no ordering claim on it.
    Deliver(Message),
    /// Held for ordering; poll for messages that became dispatchable.
    Queued,
}

#[derive(Debug, Default)]
struct ReplayEntry {
    sentinel_seen: bool,
    first_fragment: Option<Message>,
    /// Single-partition messages ordered behind this MP transaction.
    blocked: VecDeque<Message>,
}

impl ReplayEntry {
    fn is_ready(&self) -> bool {
        self.sentinel_seen && self.first_fragment.is_some()
    }
}

#[derive(Debug)]
pub struct ReplaySequencer {
    site_id: SiteId,
    entries: BTreeMap<UniqueId, ReplayEntry>,
    ready: VecDeque<Message>,
    last_polled: UniqueId,
    last_seen: UniqueId,
    end_of_log: bool,
}

impl ReplaySequencer {
    pub fn new(site_id: SiteId) -> Self {
        Self {
            site_id,
            entries: BTreeMap::new(),
            ready: VecDeque::new(),
            last_polled: UniqueId::MIN,
            last_seen: UniqueId::MIN,
            end_of_log: false,
        }
    }

    /// Offer a replay message for sequencing.
    pub fn offer(&mut self, unique_id: UniqueId, message: Message) -> SequenceDecision {
        self.note_seen(unique_id);
        match message {
            Message::MpSentinel(_) => {
                if unique_id > self.last_polled {
                    self.entries.entry(unique_id).or_default().sentinel_seen = true;
                    self.promote_ready();
                }
                SequenceDecision::Queued
            }
            Message::Fragment(fragment) => {
                if unique_id <= self.last_polled {
                    // Follow-up batch (or restart) of a released MP txn.
                    return SequenceDecision::Deliver(Message::Fragment(fragment));
                }
                let entry = self.entries.entry(unique_id).or_default();
                if entry.first_fragment.is_some() {
                    // Later batches of a still-pending MP txn flow directly;
                    // only the first fragment is sequenced.
                    return SequenceDecision::Deliver(Message::Fragment(fragment));
                }
                entry.first_fragment = Some(Message::Fragment(fragment));
                self.promote_ready();
                SequenceDecision::Queued
            }
            other => {
                // Single-partition replay work orders against the latest MP
                // transaction marked in the local stream. Fragment-only
                // entries have no local position yet and do not block.
                let last_marked = self
                    .entries
                    .iter_mut()
                    .filter(|(_, entry)| entry.sentinel_seen)
                    .next_back();
                match last_marked {
                    None => {
                        self.last_polled = self.last_polled.max(unique_id);
                        SequenceDecision::Deliver(other)
                    }
                    Some((_, entry)) => {
                        entry.blocked.push_back(other);
                        SequenceDecision::Queued
                    }
                }
            }
        }
    }

    /// Detect a replayed unique id that was already scheduled. Returns the
    /// ignored-transaction response to bounce back to the initiator.
    pub fn dedupe(&self, unique_id: UniqueId, message: &Message) -> Option<InitiateResponse> {
        let Message::Initiate(task) = message else {
            return None;
        };
        if unique_id <= self.last_seen {
            return Some(InitiateResponse::ignored(task, self.site_id));
        }
        None
    }

    /// Next message whose ordering constraints are satisfied.
    pub fn poll(&mut self) -> Option<Message> {
        self.promote_ready();
        self.ready.pop_front()
    }

    /// After the end of the replay log, yield everything still held so the
    /// caller can reject or discard it; sentinels with no fragment will
    /// never become ready on their own.
    pub fn drain(&mut self) -> Option<Message> {
        if !self.end_of_log {
            return None;
        }
        if let Some(message) = self.ready.pop_front() {
            return Some(message);
        }
        while let Some((&unique_id, _)) = self.entries.iter().next() {
            let mut entry = self.entries.remove(&unique_id).expect("entry just observed");
            self.last_polled = self.last_polled.max(unique_id);
            if let Some(fragment) = entry.first_fragment.take() {
                self.ready.push_back(fragment);
            }
            self.ready.extend(entry.blocked);
            if let Some(message) = self.ready.pop_front() {
                return Some(message);
            }
        }
        None
    }

    /// Replay stream is complete; anything still buffered may be drained.
    pub fn mark_end_of_log(&mut self) {
        self.end_of_log = true;
    }

    /// Replicas do not buffer; they only track the high-water marks so a
    /// later promotion starts from the right spot.
    pub fn update_last_seen(&mut self, unique_id: UniqueId) {
        self.note_seen(unique_id);
    }

    pub fn update_last_polled(&mut self, unique_id: UniqueId) {
        self.last_polled = self.last_polled.max(unique_id);
    }

    pub fn pending_len(&self) -> usize {
        self.entries.len() + self.ready.len()
    }

    fn note_seen(&mut self, unique_id: UniqueId) {
        self.last_seen = self.last_seen.max(unique_id);
    }

    fn promote_ready(&mut self) {
        while let Some((&unique_id, entry)) = self.entries.iter().next() {
            if !entry.is_ready() {
                break;
            }
            let mut entry = self.entries.remove(&unique_id).expect("entry just observed");
            self.last_polled = self.last_polled.max(unique_id);
            if let Some(fragment) = entry.first_fragment.take() {
                self.ready.push_back(fragment);
            }
            self.ready.extend(entry.blocked);
        }
    }
}
