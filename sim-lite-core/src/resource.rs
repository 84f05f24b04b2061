use crate::error::{SimError, SimResult};
use crate::fiber::EventController;
use crate::observe::Listeners;
use crate::types::{ListenerId, ResourceId};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, trace};
use uuid::Uuid;

/// What happens to granted quantity on release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DischargePolicy {
    /// Persistent resources return quantity to the pool.
    Return,
    /// Consumables are destroyed: released quantity leaves the capacity.
    Consume,
}

/// Candidate view handed to request scoring closures.
pub struct ResourceView<'a> {
    pub id: ResourceId,
    pub name: &'a str,
    pub guid: Uuid,
    pub capacity: f64,
    pub available: f64,
    pub persistent: bool,
}

/// Scores a candidate resource for a request. `f64::MIN` rejects the
/// candidate outright.
pub type ScoreFn = Rc<dyn Fn(&ResourceView<'_>) -> f64>;

#[derive(Clone, Debug)]
pub enum ResourceEvent {
    Added {
        resource: ResourceId,
    },
    Acquired {
        resource: ResourceId,
        quantity: f64,
    },
    Released {
        resource: ResourceId,
        quantity: f64,
    },
}

struct ResCell {
    name: String,
    guid: Uuid,
    capacity: f64,
    available: f64,
    persistent: bool,
    discharge: DischargePolicy,
}

// ─── Requests ─────────────────────────────────────────────────

struct ReqInner {
    quantity_desired: f64,
    quantity_obtained: f64,
    score: ScoreFn,
    priority: f64,
    acquired_from: Option<ResourceId>,
    reserved: bool,
    replicator: Option<Rc<dyn Fn() -> ResourceRequest>>,
    manager: Option<Weak<MgrShared>>,
}

/// A declared need for a quantity of resource. Shared handle: the
/// manager mutates `quantity_obtained`/`acquired_from` through it.
#[derive(Clone)]
pub struct ResourceRequest {
    inner: Rc<RefCell<ReqInner>>,
}

impl ResourceRequest {
    pub fn new(quantity: f64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ReqInner {
                quantity_desired: quantity,
                quantity_obtained: 0.0,
                score: Rc::new(|view| view.available),
                priority: 0.0,
                acquired_from: None,
                reserved: false,
                replicator: None,
                manager: None,
            })),
        }
    }

    pub fn with_score(self, score: ScoreFn) -> Self {
        self.inner.borrow_mut().score = score;
        self
    }

    pub fn with_priority(self, priority: f64) -> Self {
        self.inner.borrow_mut().priority = priority;
        self
    }

    pub fn with_replicator(self, f: Rc<dyn Fn() -> ResourceRequest>) -> Self {
        self.inner.borrow_mut().replicator = Some(f);
        self
    }

    pub fn quantity_desired(&self) -> f64 {
        self.inner.borrow().quantity_desired
    }

    pub fn quantity_obtained(&self) -> f64 {
        self.inner.borrow().quantity_obtained
    }

    pub fn acquired_from(&self) -> Option<ResourceId> {
        self.inner.borrow().acquired_from
    }

    pub fn is_reserved(&self) -> bool {
        self.inner.borrow().reserved
    }

    pub fn priority(&self) -> f64 {
        self.inner.borrow().priority
    }

    /// Changing priority re-arbitrates the owning manager immediately, so
    /// a queued waiter is re-ranked without waiting for the next release.
    pub fn set_priority(&self, priority: f64) {
        let manager = {
            let mut req = self.inner.borrow_mut();
            req.priority = priority;
            req.manager.as_ref().and_then(Weak::upgrade)
        };
        if let Some(shared) = manager {
            ResourceManager { shared }.rearbitrate();
        }
    }

    /// Fresh copy of this request: the declared need and scoring, with no
    /// grant state. Uses the replicator when one is installed.
    pub fn replicate(&self) -> ResourceRequest {
        let replicator = self.inner.borrow().replicator.clone();
        if let Some(f) = replicator {
            return f();
        }
        let req = self.inner.borrow();
        ResourceRequest {
            inner: Rc::new(RefCell::new(ReqInner {
                quantity_desired: req.quantity_desired,
                quantity_obtained: 0.0,
                score: req.score.clone(),
                priority: req.priority,
                acquired_from: None,
                reserved: false,
                replicator: req.replicator.clone(),
                manager: None,
            })),
        }
    }

    fn score(&self, view: &ResourceView<'_>) -> f64 {
        (self.inner.borrow().score)(view)
    }

    fn same_request(&self, other: &ResourceRequest) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

// ─── Manager ──────────────────────────────────────────────────

struct Waiter {
    req: ResourceRequest,
    ctl: EventController,
    seq: u64,
}

struct MgrShared {
    name: String,
    cells: RefCell<Vec<ResCell>>,
    waiters: RefCell<Vec<Waiter>>,
    listeners: Listeners<ResourceEvent>,
    next_seq: Cell<u64>,
}

/// A pool of acquirable resources with scored request selection,
/// priority-ordered waiting queues, and fiber-suspending blocking
/// acquisition.
#[derive(Clone)]
pub struct ResourceManager {
    shared: Rc<MgrShared>,
}

impl ResourceManager {
    pub fn new(name: &str) -> Self {
        Self {
            shared: Rc::new(MgrShared {
                name: name.to_string(),
                cells: RefCell::new(Vec::new()),
                waiters: RefCell::new(Vec::new()),
                listeners: Listeners::new(),
                next_seq: Cell::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn on_event<F: Fn(&ResourceEvent) + 'static>(&self, f: F) -> ListenerId {
        self.shared.listeners.subscribe_fn(f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.unsubscribe(id)
    }

    pub fn add_resource(&self, name: &str, capacity: f64, persistent: bool) -> ResourceId {
        let id = {
            let mut cells = self.shared.cells.borrow_mut();
            let id = cells.len() as ResourceId;
            cells.push(ResCell {
                name: name.to_string(),
                guid: Uuid::new_v4(),
                capacity,
                available: capacity,
                persistent,
                discharge: if persistent {
                    DischargePolicy::Return
                } else {
                    DischargePolicy::Consume
                },
            });
            id
        };
        debug!(target: "sim_lite::resources", manager = %self.shared.name, name, capacity, "resource added");
        self.shared.listeners.emit(&ResourceEvent::Added { resource: id });
        self.rearbitrate();
        id
    }

    pub fn resource_count(&self) -> usize {
        self.shared.cells.borrow().len()
    }

    pub fn available(&self, id: ResourceId) -> f64 {
        self.shared.cells.borrow()[id as usize].available
    }

    pub fn capacity(&self, id: ResourceId) -> f64 {
        self.shared.cells.borrow()[id as usize].capacity
    }

    pub fn total_available(&self) -> f64 {
        self.shared.cells.borrow().iter().map(|c| c.available).sum()
    }

    pub fn total_capacity(&self) -> f64 {
        self.shared.cells.borrow().iter().map(|c| c.capacity).sum()
    }

    pub fn waiter_count(&self) -> usize {
        self.shared.waiters.borrow().len()
    }

    // ── Acquisition ──

    /// Non-blocking acquire: grants from the best-scoring acceptable
    /// resource, or returns false immediately.
    pub fn try_acquire(&self, req: &ResourceRequest) -> bool {
        match self.grant(req, false) {
            Some(event) => {
                self.shared.listeners.emit(&event);
                true
            }
            None => false,
        }
    }

    /// Earmark: hold the quantity without committing the acquisition.
    pub fn reserve(&self, req: &ResourceRequest) -> bool {
        match self.grant(req, true) {
            Some(event) => {
                self.shared.listeners.emit(&event);
                true
            }
            None => false,
        }
    }

    /// Return an earmarked quantity to the pool.
    pub fn unreserve(&self, req: &ResourceRequest) {
        if req.is_reserved() {
            self.release(req);
        }
    }

    /// Commit an earmarked reservation into a full acquisition.
    pub fn acquire_reserved(&self, req: &ResourceRequest) {
        req.inner.borrow_mut().reserved = false;
    }

    /// Blocking acquire. Only legal from a detachable event thread: the
    /// calling fiber suspends until arbitration satisfies the request.
    pub async fn acquire(&self, req: &ResourceRequest, ctl: &EventController) -> SimResult<bool> {
        if !ctl.can_suspend() {
            return Err(SimError::ResourceRequest {
                reason: "blocking acquire requires a running detachable event".into(),
            });
        }
        loop {
            if self.try_acquire(req) {
                return Ok(true);
            }
            self.enqueue_waiter(req, ctl);
            let guard = WaiterGuard {
                shared: self.shared.clone(),
                req: req.clone(),
            };
            let outcome = ctl.suspend_until_resumed().await;
            drop(guard);
            outcome?;
            if req.quantity_obtained() > 0.0 {
                return Ok(true);
            }
            // Spurious resume: retry.
        }
    }

    /// Return the granted quantity. Persistent resources take it back
    /// into the pool; consumables destroy it. Triggers re-arbitration of
    /// the waiting queue.
    pub fn release(&self, req: &ResourceRequest) {
        let event = {
            let (from, obtained) = {
                let mut inner = req.inner.borrow_mut();
                let out = (inner.acquired_from, inner.quantity_obtained);
                inner.acquired_from = None;
                inner.quantity_obtained = 0.0;
                inner.reserved = false;
                out
            };
            let Some(id) = from else { return };
            if obtained <= 0.0 {
                return;
            }
            let mut cells = self.shared.cells.borrow_mut();
            let cell = &mut cells[id as usize];
            match cell.discharge {
                DischargePolicy::Return => {
                    cell.available = (cell.available + obtained).min(cell.capacity);
                }
                DischargePolicy::Consume => {
                    cell.capacity -= obtained;
                }
            }
            trace!(target: "sim_lite::resources", manager = %self.shared.name, resource = id, obtained, "released");
            ResourceEvent::Released {
                resource: id,
                quantity: obtained,
            }
        };
        self.shared.listeners.emit(&event);
        self.rearbitrate();
    }

    // ── Internals ──

    /// Best-scoring acceptable resource with sufficient availability, or
    /// None. The returned event is emitted by the caller once no borrow
    /// is held.
    fn grant(&self, req: &ResourceRequest, reserve: bool) -> Option<ResourceEvent> {
        let desired = req.quantity_desired();
        let granted_from = {
            let mut cells = self.shared.cells.borrow_mut();
            let mut best: Option<(f64, usize)> = None;
            for (i, cell) in cells.iter().enumerate() {
                if cell.available < desired {
                    continue;
                }
                let view = ResourceView {
                    id: i as ResourceId,
                    name: &cell.name,
                    guid: cell.guid,
                    capacity: cell.capacity,
                    available: cell.available,
                    persistent: cell.persistent,
                };
                let score = req.score(&view);
                if score == f64::MIN {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((s, _)) => score > s,
                };
                if better {
                    best = Some((score, i));
                }
            }
            let (_, idx) = best?;
            cells[idx].available -= desired;
            idx as ResourceId
        };
        {
            let mut inner = req.inner.borrow_mut();
            inner.quantity_obtained = desired;
            inner.acquired_from = Some(granted_from);
            inner.reserved = reserve;
            inner.manager = Some(Rc::downgrade(&self.shared));
        }
        trace!(target: "sim_lite::resources", manager = %self.shared.name, resource = granted_from, desired, reserve, "granted");
        Some(ResourceEvent::Acquired {
            resource: granted_from,
            quantity: desired,
        })
    }

    fn enqueue_waiter(&self, req: &ResourceRequest, ctl: &EventController) {
        {
            let mut inner = req.inner.borrow_mut();
            inner.manager = Some(Rc::downgrade(&self.shared));
        }
        let seq = self.shared.next_seq.get();
        self.shared.next_seq.set(seq + 1);
        self.shared.waiters.borrow_mut().push(Waiter {
            req: req.clone(),
            ctl: ctl.clone(),
            seq,
        });
    }

    /// Walk the waiting queue (priority descending, FIFO within a tie)
    /// granting whatever now fits. Runs on every release and addition.
    pub(crate) fn rearbitrate(&self) {
        let (resumed, events) = {
            let mut waiters = self.shared.waiters.borrow_mut();
            waiters.sort_by(|a, b| {
                b.req
                    .priority()
                    .total_cmp(&a.req.priority())
                    .then(a.seq.cmp(&b.seq))
            });
            let mut resumed = Vec::new();
            let mut events = Vec::new();
            let mut remaining = Vec::new();
            for waiter in waiters.drain(..) {
                match self.grant(&waiter.req, false) {
                    Some(event) => {
                        events.push(event);
                        resumed.push(waiter.ctl);
                    }
                    None => remaining.push(waiter),
                }
            }
            *waiters = remaining;
            (resumed, events)
        };
        for event in &events {
            self.shared.listeners.emit(event);
        }
        for ctl in resumed {
            ctl.resume();
        }
    }
}

/// Drops a parked waiter if its fiber unwinds before being granted.
struct WaiterGuard {
    shared: Rc<MgrShared>,
    req: ResourceRequest,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.shared
            .waiters
            .borrow_mut()
            .retain(|w| !w.req.same_request(&self.req));
    }
}

// ─── Multi-request atomic acquisition ─────────────────────────

/// Replicates a request list and acquires the replicas atomically:
/// either every reservation succeeds and is committed, or none holds.
pub struct MultiRequestProcessor {
    entries: Vec<(ResourceManager, ResourceRequest)>,
}

impl MultiRequestProcessor {
    /// Each `(manager, request)` pair is replicated; the originals are
    /// left untouched.
    pub fn new(sources: &[(ResourceManager, ResourceRequest)]) -> Self {
        Self {
            entries: sources
                .iter()
                .map(|(m, r)| (m.clone(), r.replicate()))
                .collect(),
        }
    }

    pub fn requests(&self) -> &[(ResourceManager, ResourceRequest)] {
        &self.entries
    }

    /// Reserve every replica. On any failure the reservations made so
    /// far are rolled back and false is returned.
    pub fn try_reserve_all(&self) -> bool {
        let mut reserved: Vec<&(ResourceManager, ResourceRequest)> = Vec::new();
        for entry in &self.entries {
            if entry.0.reserve(&entry.1) {
                reserved.push(entry);
            } else {
                for (mgr, req) in reserved {
                    mgr.unreserve(req);
                }
                return false;
            }
        }
        true
    }

    /// Non-blocking atomic acquire: reserve all then commit.
    pub fn try_acquire_all(&self) -> bool {
        if !self.try_reserve_all() {
            return false;
        }
        for (mgr, req) in &self.entries {
            mgr.acquire_reserved(req);
        }
        true
    }

    /// Blocking atomic acquire: parks the calling fiber and retries on
    /// every release or addition observed on any involved manager.
    pub async fn acquire_all(&self, ctl: &EventController) -> SimResult<bool> {
        if !ctl.can_suspend() {
            return Err(SimError::ResourceRequest {
                reason: "blocking multi-acquire requires a running detachable event".into(),
            });
        }
        loop {
            if self.try_acquire_all() {
                return Ok(true);
            }
            let subs: Vec<(ResourceManager, ListenerId)> = self
                .entries
                .iter()
                .map(|(mgr, _)| {
                    let ctl = ctl.clone();
                    let lid = mgr.on_event(move |event| {
                        if matches!(
                            event,
                            ResourceEvent::Released { .. } | ResourceEvent::Added { .. }
                        ) {
                            ctl.resume();
                        }
                    });
                    (mgr.clone(), lid)
                })
                .collect();
            let outcome = ctl.suspend_until_resumed().await;
            for (mgr, lid) in subs {
                mgr.remove_listener(lid);
            }
            outcome?;
        }
    }

    /// Release every replica (reserved or acquired).
    pub fn release_all(&self) {
        for (mgr, req) in &self.entries {
            mgr.release(req);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::executive::Executive;
    use crate::types::{epoch_plus_minutes as m, sim_epoch, SimDuration};

    #[test]
    fn try_acquire_prefers_the_best_score() {
        let mgr = ResourceManager::new("pool");
        mgr.add_resource("small", 5.0, true);
        mgr.add_resource("large", 50.0, true);
        // Default scoring prefers the most available quantity.
        let req = ResourceRequest::new(2.0);
        assert!(mgr.try_acquire(&req));
        assert_eq!(req.acquired_from(), Some(1));
        assert_eq!(mgr.available(1), 48.0);
        mgr.release(&req);
        assert_eq!(mgr.available(1), 50.0);
    }

    #[test]
    fn min_score_rejects_a_candidate() {
        let mgr = ResourceManager::new("pool");
        mgr.add_resource("forbidden", 10.0, true);
        mgr.add_resource("allowed", 1.0, true);
        let req = ResourceRequest::new(1.0).with_score(Rc::new(|view: &ResourceView<'_>| {
            if view.name == "forbidden" {
                f64::MIN
            } else {
                1.0
            }
        }));
        assert!(mgr.try_acquire(&req));
        assert_eq!(req.acquired_from(), Some(1));

        // Once the only acceptable resource is drained, nothing fits.
        let second = ResourceRequest::new(1.0).with_score(Rc::new(|view: &ResourceView<'_>| {
            if view.name == "forbidden" {
                f64::MIN
            } else {
                1.0
            }
        }));
        assert!(!mgr.try_acquire(&second));
    }

    #[test]
    fn consumable_release_destroys_quantity() {
        let mgr = ResourceManager::new("fuel");
        mgr.add_resource("tank", 100.0, false);
        let req = ResourceRequest::new(30.0);
        assert!(mgr.try_acquire(&req));
        mgr.release(&req);
        assert_eq!(mgr.capacity(0), 70.0);
        assert_eq!(mgr.available(0), 70.0);
    }

    #[test]
    fn blocking_acquire_suspends_until_release() {
        let exec = Executive::new(SimConfig::default());
        let mgr = ResourceManager::new("tellers");
        mgr.add_resource("teller", 1.0, true);

        let acquired_at = Rc::new(RefCell::new(None));

        let mgr1 = mgr.clone();
        exec.request_detachable_event(
            move |ctl, _| {
                let mgr = mgr1.clone();
                async move {
                    let req = ResourceRequest::new(1.0);
                    assert!(mgr.acquire(&req, &ctl).await?);
                    ctl.suspend_for(SimDuration::minutes(10)).await?;
                    mgr.release(&req);
                    Ok(())
                }
            },
            sim_epoch(),
        )
        .unwrap();

        let mgr2 = mgr.clone();
        let exec2 = exec.clone();
        let at = acquired_at.clone();
        exec.request_detachable_event(
            move |ctl, _| {
                let mgr = mgr2.clone();
                let exec = exec2.clone();
                let at = at.clone();
                async move {
                    let req = ResourceRequest::new(1.0);
                    assert!(mgr.acquire(&req, &ctl).await?);
                    *at.borrow_mut() = Some(exec.now());
                    mgr.release(&req);
                    Ok(())
                }
            },
            m(2),
        )
        .unwrap();

        exec.start().unwrap();
        assert_eq!(*acquired_at.borrow(), Some(m(10)));
        assert_eq!(mgr.total_available(), 1.0);
        assert_eq!(mgr.waiter_count(), 0);
    }

    #[test]
    fn waiters_are_served_by_priority_then_fifo() {
        let exec = Executive::new(SimConfig::default());
        let mgr = ResourceManager::new("pool");
        mgr.add_resource("unit", 1.0, true);
        let order = Rc::new(RefCell::new(Vec::new()));

        // Holder occupies the unit until t=10.
        let mgr_h = mgr.clone();
        exec.request_detachable_event(
            move |ctl, _| {
                let mgr = mgr_h.clone();
                async move {
                    let req = ResourceRequest::new(1.0);
                    assert!(mgr.acquire(&req, &ctl).await?);
                    ctl.suspend_for(SimDuration::minutes(10)).await?;
                    mgr.release(&req);
                    Ok(())
                }
            },
            sim_epoch(),
        )
        .unwrap();

        for (tag, priority, at) in [("low", 0.0, 1), ("high", 5.0, 2), ("mid", 1.0, 3)] {
            let mgr_c = mgr.clone();
            let order = order.clone();
            exec.request_detachable_event(
                move |ctl, _| {
                    let mgr = mgr_c.clone();
                    let order = order.clone();
                    async move {
                        let req = ResourceRequest::new(1.0).with_priority(priority);
                        assert!(mgr.acquire(&req, &ctl).await?);
                        order.borrow_mut().push(tag);
                        mgr.release(&req);
                        Ok(())
                    }
                },
                m(at),
            )
            .unwrap();
        }

        exec.start().unwrap();
        assert_eq!(&*order.borrow(), &["high", "mid", "low"]);
    }

    #[test]
    fn multi_request_reserve_all_is_atomic() {
        let tellers = ResourceManager::new("tellers");
        tellers.add_resource("t", 1.0, true);
        let stamps = ResourceManager::new("stamps");
        stamps.add_resource("s", 1.0, true);

        // Drain the stamps pool so the multi-acquire cannot complete.
        let hog = ResourceRequest::new(1.0);
        assert!(stamps.try_acquire(&hog));

        let mrp = MultiRequestProcessor::new(&[
            (tellers.clone(), ResourceRequest::new(1.0)),
            (stamps.clone(), ResourceRequest::new(1.0)),
        ]);
        assert!(!mrp.try_acquire_all());
        // The teller reservation must have been rolled back.
        assert_eq!(tellers.total_available(), 1.0);

        stamps.release(&hog);
        assert!(mrp.try_acquire_all());
        assert_eq!(tellers.total_available(), 0.0);
        assert_eq!(stamps.total_available(), 0.0);
        mrp.release_all();
        assert_eq!(tellers.total_available(), 1.0);
        assert_eq!(stamps.total_available(), 1.0);
    }

    #[test]
    fn priority_change_rearbitrates_immediately() {
        let exec = Executive::new(SimConfig::default());
        let mgr = ResourceManager::new("pool");
        mgr.add_resource("unit", 1.0, true);
        let order = Rc::new(RefCell::new(Vec::new()));

        let mgr_h = mgr.clone();
        exec.request_detachable_event(
            move |ctl, _| {
                let mgr = mgr_h.clone();
                async move {
                    let req = ResourceRequest::new(1.0);
                    assert!(mgr.acquire(&req, &ctl).await?);
                    ctl.suspend_for(SimDuration::minutes(10)).await?;
                    mgr.release(&req);
                    Ok(())
                }
            },
            sim_epoch(),
        )
        .unwrap();

        let late_req = ResourceRequest::new(1.0);
        for (tag, at, req) in [
            ("first", 1, ResourceRequest::new(1.0)),
            ("late", 2, late_req.clone()),
        ] {
            let mgr_c = mgr.clone();
            let order = order.clone();
            exec.request_detachable_event(
                move |ctl, _| {
                    let mgr = mgr_c.clone();
                    let order = order.clone();
                    let req = req.clone();
                    async move {
                        assert!(mgr.acquire(&req, &ctl).await?);
                        order.borrow_mut().push(tag);
                        ctl.suspend_for(SimDuration::minutes(1)).await?;
                        mgr.release(&req);
                        Ok(())
                    }
                },
                m(at),
            )
            .unwrap();
        }

        // Bump the late waiter above the first one before the release.
        exec.request_event(
            move |_, _| {
                late_req.set_priority(10.0);
                Ok(())
            },
            m(5),
        )
        .unwrap();

        exec.start().unwrap();
        assert_eq!(&*order.borrow(), &["late", "first"]);
    }
}
