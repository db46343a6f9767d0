//! Durability gate for multi-partition transactions under synchronous
//! command logging.
//!
//! When the first fragment of an MP transaction is logged synchronously the
//! task cannot run until the entry is on disk. Follow-up fragments and the
//! complete-transaction task for that txn id queue here instead of the site
//! task queue; the durability callback drains them in arrival order.
//! Without the gate, a restarted MP transaction would not be ordered behind
//! the logging of its own first fragment.

use std::collections::{HashMap, VecDeque};

use anyhow::{ensure, Result};

use super::types::{SiteTask, TxnId};

#[derive(Default)]
pub struct MpDurabilityGate {
    pending: HashMap<TxnId, VecDeque<SiteTask>>,
}

impl MpDurabilityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate for a transaction whose first fragment is pending
    /// durability. A transaction can only be gated once.
    pub fn open(&mut self, txn_id: TxnId) -> Result<()> {
        ensure!(
            !self.pending.contains_key(&txn_id),
            "txn {txn_id} already has a durability gate"
        );
        self.pending.insert(txn_id, VecDeque::new());
        Ok(())
    }

    pub fn is_gated(&self, txn_id: TxnId) -> bool {
        self.pending.contains_key(&txn_id)
    }

    /// Queue the task behind the gate when one is open for its txn;
    /// otherwise hand it back for immediate dispatch.
    pub fn queue_or_pass(&mut self, task: SiteTask) -> Option<SiteTask> {
        let Some(txn_id) = task.txn_id() else {
            return Some(task);
        };
        match self.pending.get_mut(&txn_id) {
            Some(queue) => {
                queue.push_back(task);
                None
            }
            None => Some(task),
        }
    }

    /// Close the gate and yield the queued tasks in arrival order.
    pub fn drain(&mut self, txn_id: TxnId) -> Vec<SiteTask> {
        self.pending
            .remove(&txn_id)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }
}
