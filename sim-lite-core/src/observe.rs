use crate::types::{EventKey, ListenerId, ServiceMode, SimTime};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

// ─── Listener sets ────────────────────────────────────────────

/// An ordered callback list keyed by registration order. Subscription
/// hands back a [`ListenerId`]; unsubscribing removes by that identity.
/// Emission snapshots the list first, so a listener may subscribe or
/// unsubscribe re-entrantly without poisoning the iteration.
pub struct Listeners<E> {
    entries: RefCell<Vec<(ListenerId, Rc<dyn Fn(&E)>)>>,
    next: RefCell<ListenerId>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            next: RefCell::new(0),
        }
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, f: Rc<dyn Fn(&E)>) -> ListenerId {
        let mut next = self.next.borrow_mut();
        let id = *next;
        *next += 1;
        self.entries.borrow_mut().push((id, f));
        id
    }

    pub fn subscribe_fn<F: Fn(&E) + 'static>(&self, f: F) -> ListenerId {
        self.subscribe(Rc::new(f))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(lid, _)| *lid != id);
        entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Rc<dyn Fn(&E)>> = self
            .entries
            .borrow()
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for f in snapshot {
            f(event);
        }
    }
}

// ─── Lifecycle event enums ────────────────────────────────────

/// Executive lifecycle notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutiveEvent {
    Starting,
    Started,
    Stopping,
    Stopped,
    Paused,
    Resumed,
    Reset,
    Finished,
}

/// Model lifecycle notifications, fired on the executive's thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelEvent {
    Starting,
    Started,
    Stopping,
    Stopped,
    Reset,
}

// ─── Dispatch trace ───────────────────────────────────────────

/// One dispatched event, as recorded by the executive when the
/// `Executive` diagnostic key is enabled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceRecord {
    pub seq: u64,
    pub key: EventKey,
    pub when: SimTime,
    pub priority: f64,
    pub mode: ServiceMode,
    pub daemon: bool,
    /// Number of co-delivered events for batched service.
    pub batch_size: usize,
}

/// Append-only dispatch trace, queryable after (or during) a run.
#[derive(Clone, Default)]
pub struct TraceLog {
    records: Rc<RefCell<Vec<TraceRecord>>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, record: TraceRecord) {
        self.records.borrow_mut().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    pub fn snapshot(&self) -> Vec<TraceRecord> {
        self.records.borrow().clone()
    }

    pub fn clear(&self) {
        self.records.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn listeners_fire_in_registration_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            listeners.subscribe_fn(move |v: &u32| order.borrow_mut().push((tag, *v)));
        }
        listeners.emit(&7);
        assert_eq!(&*order.borrow(), &[("a", 7), ("b", 7), ("c", 7)]);
    }

    #[test]
    fn unsubscribe_removes_by_identity() {
        let listeners: Listeners<()> = Listeners::new();
        let hits = Rc::new(Cell::new(0));
        let h1 = hits.clone();
        let keep = listeners.subscribe_fn(move |_| h1.set(h1.get() + 1));
        let h2 = hits.clone();
        let drop_id = listeners.subscribe_fn(move |_| h2.set(h2.get() + 10));
        assert!(listeners.unsubscribe(drop_id));
        assert!(!listeners.unsubscribe(drop_id));
        listeners.emit(&());
        assert_eq!(hits.get(), 1);
        let _ = keep;
    }

    #[test]
    fn reentrant_unsubscribe_during_emit_is_safe() {
        let listeners: Rc<Listeners<()>> = Rc::new(Listeners::new());
        let inner = listeners.clone();
        let id = Rc::new(Cell::new(0));
        let id_in = id.clone();
        let lid = listeners.subscribe_fn(move |_| {
            inner.unsubscribe(id_in.get());
        });
        id.set(lid);
        listeners.emit(&());
        assert!(listeners.is_empty());
    }
}
