//! In-process mailbox network.
//!
//! Sites register by id and get a mailbox handle plus an inbox receiver.
//! Each destination is backed by one channel, so delivery is FIFO per
//! source/destination pair as long as a source sends from one thread, which
//! is exactly the partition model. There is no wire format here; the real
//! transport lives outside this crate.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use spindle_sched::{Mailbox, Message, SiteId};

type Registry = Mutex<HashMap<SiteId, Sender<Message>>>;

/// Shared registry of every site's inbox.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<Registry>,
}

/// Receiving side of one site's inbox.
pub struct SiteInbox {
    rx: Receiver<Message>,
}

impl SiteInbox {
    pub fn recv(&self) -> Option<Message> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Message> {
        self.rx.recv_timeout(timeout).ok()
    }
}

struct NetworkMailbox {
    registry: Arc<Registry>,
}

impl Mailbox for NetworkMailbox {
    fn send(&self, dest: SiteId, msg: Message) {
        let sender = self
            .registry
            .lock()
            .expect("mailbox registry poisoned")
            .get(&dest)
            .cloned();
        match sender {
            Some(sender) => {
                if sender.send(msg).is_err() {
                    tracing::debug!(dest, "dropping message for a departed site");
                }
            }
            None => tracing::warn!(dest, "dropping message for an unknown site"),
        }
    }

    fn multicast(&self, dests: &[SiteId], msg: Message) {
        for dest in dests {
            self.send(*dest, msg.clone());
        }
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a site, returning its outbound mailbox and inbound queue.
    /// Re-registering an id replaces the previous inbox (rejoin).
    pub fn register(&self, site_id: SiteId) -> (Arc<dyn Mailbox>, SiteInbox) {
        let (tx, rx) = mpsc::channel();
        self.registry
            .lock()
            .expect("mailbox registry poisoned")
            .insert(site_id, tx);
        let mailbox = Arc::new(NetworkMailbox {
            registry: self.registry.clone(),
        });
        (mailbox, SiteInbox { rx })
    }

    pub fn unregister(&self, site_id: SiteId) {
        self.registry
            .lock()
            .expect("mailbox registry poisoned")
            .remove(&site_id);
    }
}
