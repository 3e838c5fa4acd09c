// src/change_bus.rs
//! Change Bus (spec §4.3): one bus per collection, fanning change events out
//! to every live subscriber over an unbounded `crossbeam` channel.
//!
//! `publish` is a non-blocking channel send to pull-based subscribers, not a
//! synchronous callback - so a collection may call it while still holding
//! its own write lock. Doing so is what makes per-subscriber delivery order
//! match commit order: two writers racing to publish after unlocking could
//! interleave their sequence numbers, but publishing inside the locked
//! section serializes both the write and its announcement together.

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened to a document (spec §3's Change Event `op`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One change, delivered to every subscriber registered at the moment the
/// write that produced it was applied. `seq` is a per-collection monotonic
/// counter establishing the delivery order every subscriber agrees on.
///
/// Mirrors spec §3's Change Event shape exactly: `doc` is the post-state
/// (`None` on `Delete`), `old` is the pre-state (`None` on `Insert`). `meta`
/// is reserved for future annotation (e.g. a bulk operation's batch id) and
/// is always `None` today - nothing in this crate sets it yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub collection: String,
    pub id: String,
    pub kind: ChangeKind,
    pub rev: String,
    pub doc: Option<Value>,
    pub old: Option<Value>,
    pub meta: Option<Value>,
}

/// A live subscription. Dropping it unregisters the subscriber; no more
/// events are sent to it once dropped, and none already queued are lost to
/// other subscribers.
pub struct Subscription {
    receiver: Receiver<ChangeEvent>,
}

impl Subscription {
    /// Block until the next event arrives, or return `None` once the bus
    /// (and every sender with it) has been dropped.
    pub fn recv(&self) -> Option<ChangeEvent> {
        self.receiver.recv().ok()
    }

    /// Non-blocking poll for the next already-queued event.
    pub fn try_recv(&self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn iter(&self) -> crossbeam::channel::Iter<'_, ChangeEvent> {
        self.receiver.iter()
    }

    /// Narrow this subscription to events touching a single document id -
    /// the shape `DocumentHandle::changes()` needs (spec §4.4).
    pub fn filter_by_id(self, id: impl Into<String>) -> FilteredSubscription {
        FilteredSubscription { inner: self, id: id.into() }
    }
}

/// A [`Subscription`] narrowed to one document id. Events for other ids on
/// the same collection are silently skipped rather than buffered.
pub struct FilteredSubscription {
    inner: Subscription,
    id: String,
}

impl FilteredSubscription {
    pub fn recv(&self) -> Option<ChangeEvent> {
        loop {
            let event = self.inner.recv()?;
            if event.id == self.id {
                return Some(event);
            }
        }
    }

    pub fn try_recv(&self) -> Option<ChangeEvent> {
        loop {
            match self.inner.try_recv() {
                Some(event) if event.id == self.id => return Some(event),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

/// Per-collection publish/subscribe fan-out.
pub struct ChangeBus {
    subscribers: parking_lot::Mutex<Vec<Sender<ChangeEvent>>>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        ChangeBus {
            subscribers: parking_lot::Mutex::new(Vec::new()),
            next_seq: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        Subscription { receiver: rx }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Fan an event out to every live subscriber. Dead (disconnected)
    /// subscribers are pruned lazily on publish.
    pub fn publish(&self, event: ChangeEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drop every live sender, so every outstanding `recv()` returns `None`
    /// instead of blocking forever. Used when a collection closes.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(bus: &ChangeBus, id: &str) -> ChangeEvent {
        ChangeEvent {
            seq: bus.next_seq(),
            collection: "people".into(),
            id: id.into(),
            kind: ChangeKind::Insert,
            rev: "1-abc".into(),
            doc: Some(json!({"name": "Alice"})),
            old: None,
            meta: None,
        }
    }

    #[test]
    fn subscriber_receives_published_event() {
        let bus = ChangeBus::new();
        let sub = bus.subscribe();
        bus.publish(event(&bus, "doc1"));
        let got = sub.recv().unwrap();
        assert_eq!(got.id, "doc1");
    }

    #[test]
    fn multiple_subscribers_each_get_every_event() {
        let bus = ChangeBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(event(&bus, "doc1"));
        assert_eq!(a.recv().unwrap().id, "doc1");
        assert_eq!(b.recv().unwrap().id, "doc1");
    }

    #[test]
    fn ordering_is_preserved_per_subscriber() {
        let bus = ChangeBus::new();
        let sub = bus.subscribe();
        bus.publish(event(&bus, "a"));
        bus.publish(event(&bus, "b"));
        bus.publish(event(&bus, "c"));
        assert_eq!(sub.recv().unwrap().id, "a");
        assert_eq!(sub.recv().unwrap().id, "b");
        assert_eq!(sub.recv().unwrap().id, "c");
    }

    #[test]
    fn dropped_subscriber_is_pruned_on_next_publish() {
        let bus = ChangeBus::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        bus.publish(event(&bus, "doc1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn try_recv_is_non_blocking_when_empty() {
        let bus = ChangeBus::new();
        let sub = bus.subscribe();
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn filtered_subscription_skips_other_ids() {
        let bus = ChangeBus::new();
        let sub = bus.subscribe().filter_by_id("b");
        bus.publish(event(&bus, "a"));
        bus.publish(event(&bus, "b"));
        bus.publish(event(&bus, "a"));
        assert_eq!(sub.recv().unwrap().id, "b");
        assert!(sub.try_recv().is_none());
    }
}
