//! Holding pen for SAFE-consistency read responses (leader only).
//!
//! A SAFE read may not be answered until every write scheduled before it is
//! committed across the cluster. Each buffered response carries a gate
//! sp-handle; entries are released in FIFO order whenever the truncation
//! point reaches their gate.

use std::collections::VecDeque;

use super::types::{
    FragmentResponse, InitiateResponse, Mailbox, Message, SiteId, SpHandle,
};

#[derive(Debug)]
struct BufferedRead {
    gate: SpHandle,
    destination: SiteId,
    response: Message,
}

#[derive(Debug, Default)]
pub struct BufferedReadLog {
    entries: VecDeque<BufferedRead>,
}

impl BufferedReadLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a single-partition read response. Its gate is its own
    /// sp-handle, which at initiation time was the newest scheduled write.
    pub fn offer_initiate(
        &mut self,
        mailbox: &dyn Mailbox,
        response: InitiateResponse,
        trunc_handle: SpHandle,
    ) {
        self.entries.push_back(BufferedRead {
            gate: response.sp_handle,
            destination: response.initiator,
            response: Message::InitiateResponse(response),
        });
        self.release(mailbox, trunc_handle);
    }

    /// Buffer a multi-partition read fragment response, gated on the
    /// transaction's first local sp-handle.
    pub fn offer_fragment(
        &mut self,
        mailbox: &dyn Mailbox,
        response: FragmentResponse,
        gate: SpHandle,
        trunc_handle: SpHandle,
    ) {
        self.entries.push_back(BufferedRead {
            gate,
            destination: response.destination,
            response: Message::FragmentResponse(response),
        });
        self.release(mailbox, trunc_handle);
    }

    /// Deliver every buffered read whose gate the truncation point has
    /// reached, preserving arrival order.
    pub fn release(&mut self, mailbox: &dyn Mailbox, trunc_handle: SpHandle) {
        while let Some(front) = self.entries.front() {
            if front.gate > trunc_handle {
                break;
            }
            let entry = self.entries.pop_front().expect("front just observed");
            mailbox.send(entry.destination, entry.response);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
