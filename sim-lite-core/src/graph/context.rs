use crate::types::{EdgeId, EventKey, SimTime, SyncId, VertexId};
use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use uuid::Uuid;

struct Entry {
    value: Rc<dyn Any>,
    volatile: bool,
}

/// Per-run bookkeeping the execution protocol threads through a graph
/// traversal. Private to the graph module.
pub(crate) struct RunState {
    /// Arrival counts per vertex for the current traversal.
    pub arrivals: HashMap<VertexId, usize>,
    pub fired: HashSet<VertexId>,
    /// Edges whose completion signaler is outstanding.
    pub signalers: HashSet<EdgeId>,
    /// Edges between `EdgeStarting` and `EdgeFinishing`.
    pub active: HashSet<EdgeId>,
    pub exec_started: HashMap<EdgeId, SimTime>,
    /// Scheduled default-duration completion events, rescinded when the
    /// signaler is consumed early (e.g. by a co-finish).
    pub completion_events: HashMap<EdgeId, EventKey>,
    pub children_remaining: HashMap<EdgeId, usize>,
    pub sync_ready: HashMap<SyncId, HashSet<VertexId>>,
    pub cancelled: bool,
}

struct CtxInner {
    id: Uuid,
    entries: HashMap<Uuid, Entry>,
    run: RunState,
}

/// A keyed map carrying state across event handlers for a single
/// execution instance of a task graph. Keys are object identities
/// (Guids); each key carries a volatile flag — volatile keys are cleared
/// between executive runs in a single pass.
#[derive(Clone)]
pub struct GraphContext {
    inner: Rc<RefCell<CtxInner>>,
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphContext {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(CtxInner {
                id: Uuid::new_v4(),
                entries: HashMap::new(),
                run: RunState {
                    arrivals: HashMap::new(),
                    fired: HashSet::new(),
                    signalers: HashSet::new(),
                    active: HashSet::new(),
                    exec_started: HashMap::new(),
                    completion_events: HashMap::new(),
                    children_remaining: HashMap::new(),
                    sync_ready: HashMap::new(),
                    cancelled: false,
                },
            })),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.borrow().id
    }

    pub fn set(&self, key: Uuid, value: Rc<dyn Any>) {
        self.inner.borrow_mut().entries.insert(
            key,
            Entry {
                value,
                volatile: false,
            },
        );
    }

    /// Insert a value whose key is cleared between executive runs.
    pub fn set_volatile(&self, key: Uuid, value: Rc<dyn Any>) {
        self.inner.borrow_mut().entries.insert(
            key,
            Entry {
                value,
                volatile: true,
            },
        );
    }

    pub fn get<T: 'static>(&self, key: Uuid) -> Option<Rc<T>> {
        let inner = self.inner.borrow();
        let entry = inner.entries.get(&key)?;
        entry.value.clone().downcast::<T>().ok()
    }

    pub fn remove(&self, key: Uuid) -> bool {
        self.inner.borrow_mut().entries.remove(&key).is_some()
    }

    pub fn contains(&self, key: Uuid) -> bool {
        self.inner.borrow().entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Single pass dropping every volatile-flagged key.
    pub fn clear_volatiles(&self) {
        self.inner
            .borrow_mut()
            .entries
            .retain(|_, entry| !entry.volatile);
    }

    /// Abandon the run: the execution protocol refuses further phases
    /// under this context.
    pub fn cancel(&self) {
        self.inner.borrow_mut().run.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().run.cancelled
    }

    pub(crate) fn run(&self) -> Ref<'_, RunState> {
        Ref::map(self.inner.borrow(), |i| &i.run)
    }

    pub(crate) fn run_mut(&self) -> RefMut<'_, RunState> {
        RefMut::map(self.inner.borrow_mut(), |i| &mut i.run)
    }
}
