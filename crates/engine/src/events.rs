//! Fire-and-forget notifications published after a commit lands.
//!
//! Each subscriber owns a bounded queue. A full queue drops the event for that
//! subscriber only; publishing never blocks and never fails the commit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use sheetwright_core::{EntityId, EntitySnapshot, SessionId};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct EntityCommitted {
    pub entity_id: EntityId,
    /// `None` for one-shot operations that bypass sessions.
    pub session_id: Option<SessionId>,
    pub operation: String,
    pub revision: u64,
    pub snapshot: Arc<EntitySnapshot>,
}

pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<Vec<Sender<EntityCommitted>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Receiver<EntityCommitted> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: EntityCommitted) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(entity_id = %event.entity_id, revision = event.revision, "subscriber queue full, event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("pruning disconnected subscriber");
                false
            }
        });
        delivered
    }

    /// Events dropped on full queues since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetwright_core::{CanonicalState, DerivedFields};

    fn event(revision: u64) -> EntityCommitted {
        let entity_id = EntityId::new();
        EntityCommitted {
            entity_id,
            session_id: None,
            operation: "item.acquire".into(),
            revision,
            snapshot: Arc::new(EntitySnapshot {
                entity_id,
                revision,
                canonical: CanonicalState::default(),
                derived: DerivedFields::default(),
            }),
        }
    }

    #[test]
    fn slow_subscriber_does_not_block_others() {
        let bus = EventBus::new(1);
        let slow = bus.subscribe();
        let fast = bus.subscribe();

        assert_eq!(bus.publish(event(2)), 2);
        assert_eq!(fast.try_recv().unwrap().revision, 2);
        // `slow` never drains, so its queue is full now.
        assert_eq!(bus.publish(event(3)), 1);
        assert_eq!(bus.dropped(), 1);
        assert_eq!(fast.try_recv().unwrap().revision, 3);
        assert_eq!(slow.try_recv().unwrap().revision, 2);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.publish(event(2)), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx.try_recv().is_ok());
    }
}
