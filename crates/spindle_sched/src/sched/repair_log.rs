//! In-memory record of recent stamped messages, kept by every replica so a
//! promoted leader can rebuild outstanding state after failover. Entries at
//! or below the truncation point are discarded.

use std::collections::VecDeque;

use super::types::{Message, SpHandle};

#[derive(Debug)]
struct RepairEntry {
    sp_handle: SpHandle,
    message: Message,
}

#[derive(Debug, Default)]
pub struct RepairLog {
    entries: VecDeque<RepairEntry>,
}

impl RepairLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message once its local sp-handle is assigned. Handles are
    /// appended in arrival order; repair replays them in that order.
    pub fn record(&mut self, sp_handle: SpHandle, message: Message) {
        self.entries.push_back(RepairEntry { sp_handle, message });
    }

    /// Drop every entry the cluster no longer needs for repair.
    pub fn truncate(&mut self, handle: SpHandle) {
        while let Some(front) = self.entries.front() {
            if front.sp_handle > handle {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// Messages above the truncation point, oldest first.
    pub fn contents(&self) -> impl Iterator<Item = (SpHandle, &Message)> {
        self.entries.iter().map(|e| (e.sp_handle, &e.message))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::RepairLogTruncate;
    use super::*;

    fn trunc_msg(handle: SpHandle) -> Message {
        Message::RepairLogTruncate(RepairLogTruncate { handle })
    }

    #[test]
    fn truncate_discards_committed_prefix() {
        let mut log = RepairLog::new();
        for handle in [10, 20, 30] {
            log.record(handle, trunc_msg(handle));
        }
        log.truncate(20);
        let kept: Vec<SpHandle> = log.contents().map(|(h, _)| h).collect();
        assert_eq!(kept, vec![30]);
        log.truncate(100);
        assert!(log.is_empty());
    }
}
