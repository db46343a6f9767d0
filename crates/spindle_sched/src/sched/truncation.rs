//! Repair-log truncation point bookkeeping.
//!
//! The truncation handle is the highest sp-handle known to be committed on
//! every replica; everything at or below it can be discarded from repair
//! logs. The handle rides along in every outbound replicated message, and a
//! dedicated broadcast is only sent when no replicated traffic has carried
//! a fresher value by the time the scheduled broadcast runs. That amortises
//! the explicit message to one per burst of low-throughput commits.

use super::types::{SpHandle, NO_HANDLE};

#[derive(Debug)]
pub struct RepairLogTruncationTracker {
    handle: SpHandle,
    last_sent: SpHandle,
}

impl RepairLogTruncationTracker {
    pub fn new(initial: SpHandle) -> Self {
        Self {
            handle: initial,
            last_sent: NO_HANDLE,
        }
    }

    pub fn handle(&self) -> SpHandle {
        self.handle
    }

    /// Advance the truncation point. Returns true when the handle moved;
    /// a stale handle is accepted silently (promotion and rejoin move the
    /// observed commit point backwards).
    pub fn advance(&mut self, handle: SpHandle) -> bool {
        if handle > self.handle {
            self.handle = handle;
            true
        } else {
            tracing::debug!(
                current = self.handle,
                offered = handle,
                "truncation handle not advanced"
            );
            false
        }
    }

    /// Handle to piggy-back on an outbound replicated message. Counts as a
    /// send for broadcast suppression.
    pub fn handle_for_replicas(&mut self) -> SpHandle {
        self.last_sent = self.handle;
        self.handle
    }

    /// Whether a scheduled broadcast still has news for the replicas.
    pub fn broadcast_due(&self) -> bool {
        self.last_sent < self.handle
    }

    pub fn mark_broadcast(&mut self) {
        self.last_sent = self.handle;
    }
}
