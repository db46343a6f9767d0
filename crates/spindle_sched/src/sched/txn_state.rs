//! Per-transaction state tracked while a transaction is outstanding.

use super::types::{DummyTask, FragmentTask, InitiateTask, SpHandle, TxnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnKind {
    SpWrite,
    SpRead,
    MpParticipant,
    /// Borrowed multi-partition read run locally; never tracked as
    /// outstanding.
    MpBorrow,
    /// Pipeline-flush no-op.
    Flush,
}

/// State for one outstanding transaction. Created on the first message seen
/// for a txn id, mutated by execution, removed once the final response has
/// been aggregated (or eagerly for read-only final fragments).
#[derive(Clone, Debug)]
pub struct TxnState {
    pub txn_id: TxnId,
    pub kind: TxnKind,
    /// First sp-handle assigned locally for this transaction.
    pub sp_handle: SpHandle,
    pub read_only: bool,
    done: bool,
    /// The fragment kind recorded from the originating notice; complete
    /// handling needs it to decide whether sysproc completes replicate.
    pub sysproc: bool,
}

impl TxnState {
    pub fn single_partition(msg: &InitiateTask) -> Self {
        Self {
            txn_id: msg.txn_id,
            kind: if msg.read_only {
                TxnKind::SpRead
            } else {
                TxnKind::SpWrite
            },
            sp_handle: msg.sp_handle,
            read_only: msg.read_only,
            done: false,
            sysproc: false,
        }
    }

    pub fn participant(msg: &FragmentTask) -> Self {
        Self {
            txn_id: msg.txn_id,
            kind: TxnKind::MpParticipant,
            sp_handle: msg.sp_handle,
            read_only: msg.read_only,
            done: false,
            sysproc: !matches!(msg.kind, super::types::FragmentKind::Normal),
        }
    }

    pub fn borrowed(sp_handle: SpHandle, msg: &FragmentTask) -> Self {
        Self {
            txn_id: msg.txn_id,
            kind: TxnKind::MpBorrow,
            sp_handle,
            read_only: true,
            done: false,
            sysproc: false,
        }
    }

    pub fn flush(msg: &DummyTask) -> Self {
        Self {
            txn_id: msg.txn_id,
            kind: TxnKind::Flush,
            sp_handle: msg.sp_handle,
            read_only: true,
            done: false,
            sysproc: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Set once execution has run the final piece of work for the txn.
    pub fn mark_done(&mut self) {
        self.done = true;
    }
}
