// ── Inbound event handlers ──
//
// Copy-on-write list: dispatch iterates a snapshot, so a handler may
// register or remove handlers (including itself) without deadlocking.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::envelope;
use crate::error::Error;

/// Identifies one registration made with [`CloudLink::on`](super::CloudLink::on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Callback for a named inbound event.
pub type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// An event received from the cloud.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub name: String,
    pub data: Value,
    /// Present when the sender expects an acknowledgement.
    pub ack: Option<AckResponder>,
}

/// Sends the acknowledgement for one inbound event on the session it
/// arrived on. If that session is gone, the reply fails with
/// [`Error::NotConnected`].
#[derive(Clone)]
pub struct AckResponder {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
}

impl AckResponder {
    pub fn new(id: u64, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn respond(&self, data: Value) -> Result<(), Error> {
        let text = envelope::encode_ack(self.id, data)?;
        self.outbound
            .send(Message::text(text))
            .map_err(|_| Error::NotConnected)
    }
}

impl fmt::Debug for AckResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckResponder").field("id", &self.id).finish()
    }
}

struct Registered {
    id: HandlerId,
    event: String,
    handler: EventHandler,
}

pub(crate) struct HandlerRegistry {
    entries: ArcSwap<Vec<Arc<Registered>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn add(&self, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registered = Arc::new(Registered {
            id,
            event: event.to_owned(),
            handler,
        });
        self.entries.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&registered));
            next
        });
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut removed = false;
        self.entries.rcu(|current| {
            let next: Vec<_> = current.iter().filter(|r| r.id != id).cloned().collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    /// Invoke every handler for `event.name`, in registration order.
    /// Returns how many ran.
    pub(crate) fn dispatch(&self, event: &InboundEvent) -> usize {
        let snapshot = self.entries.load();
        let mut invoked = 0;
        for registered in snapshot.iter().filter(|r| r.event == event.name) {
            (registered.handler)(event);
            invoked += 1;
        }
        invoked
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.load().len()
    }
}
