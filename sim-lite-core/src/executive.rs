use crate::config::SimConfig;
use crate::error::{ErrorLog, SimError, SimResult};
use crate::fiber::{EventController, FiberCell, FiberPhase, FiberState};
use crate::graph::GraphContext;
use crate::observe::{ExecutiveEvent, Listeners, TraceLog, TraceRecord};
use crate::types::{EventKey, ExecState, FiberId, ListenerId, ServiceMode, SimTime};
use futures::future::LocalBoxFuture;
use futures::task::noop_waker;
use std::any::Any;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::{debug, trace};

/// Optional payload delivered with an event. Identity (`Rc::ptr_eq`) is
/// what batching and target-based rescinds compare.
pub type EventData = Option<Rc<dyn Any>>;

/// A synchronous event callback. Shared so the same callback can be
/// scheduled repeatedly (a prerequisite for batched service).
pub type SyncCallback = Rc<dyn Fn(&Executive, &EventData) -> SimResult<()>>;

type FiberFuture = LocalBoxFuture<'static, SimResult<()>>;

/// Factory invoked at dispatch time to produce a detachable body.
pub type FiberFactory = Box<dyn FnOnce(EventController, EventData) -> FiberFuture>;

enum EventAction {
    Sync(SyncCallback),
    Spawn(FiberFactory),
    Resume(FiberId),
}

pub(crate) struct QueuedEvent {
    key: EventKey,
    when: SimTime,
    priority: f64,
    daemon: bool,
    mode: ServiceMode,
    action: EventAction,
    data: EventData,
}

/// Read-only view of a queued event, handed to rescind predicates.
pub struct EventInfo<'a> {
    pub key: EventKey,
    pub when: SimTime,
    pub priority: f64,
    pub daemon: bool,
    pub mode: ServiceMode,
    pub data: &'a EventData,
}

// ─── Queue ordering ───────────────────────────────────────────

/// Total order over queued events: `when` ascending, `priority`
/// descending, non-daemon before daemon, then insertion order.
#[derive(Clone, Copy, Debug)]
struct EventOrd {
    when: SimTime,
    priority: f64,
    daemon: bool,
    seq: u64,
}

impl PartialEq for EventOrd {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EventOrd {}

impl PartialOrd for EventOrd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventOrd {
    fn cmp(&self, other: &Self) -> Ordering {
        self.when
            .cmp(&other.when)
            .then_with(|| other.priority.total_cmp(&self.priority))
            .then_with(|| self.daemon.cmp(&other.daemon))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

fn data_identical(a: &EventData, b: &EventData) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

// ─── Core state ───────────────────────────────────────────────

struct ExecCore {
    config: SimConfig,
    clock: SimTime,
    start_time: SimTime,
    state: ExecState,
    queue: BTreeMap<EventOrd, QueuedEvent>,
    index: HashMap<EventKey, EventOrd>,
    /// Count of queued non-daemon events; zero means nothing keeps the
    /// executive alive.
    non_daemon: usize,
    next_key: EventKey,
    next_seq: u64,
    dispatch_seq: u64,
    stop_requested: bool,
    pause_requested: bool,
    fibers: HashMap<FiberId, FiberCell>,
    next_fiber: FiberId,
    current: Option<EventController>,
}

pub(crate) struct ExecShared {
    core: RefCell<ExecCore>,
    listeners: Listeners<ExecutiveEvent>,
    errors: ErrorLog,
    trace: TraceLog,
    trace_enabled: bool,
}

/// The executive: virtual clock, priority-ordered event queue, and the
/// single-threaded cooperative dispatch loop. Cheap to clone; all clones
/// share one engine.
#[derive(Clone)]
pub struct Executive {
    shared: Rc<ExecShared>,
}

impl Executive {
    pub fn new(config: SimConfig) -> Self {
        Self::with_error_log(config, ErrorLog::new())
    }

    /// Builds an executive that deposits dispatch failures on `errors`
    /// (the model's collection).
    pub fn with_error_log(config: SimConfig, errors: ErrorLog) -> Self {
        let trace_enabled = config.diagnostics.is_enabled("Executive");
        let start = crate::types::sim_epoch();
        let core = ExecCore {
            config,
            clock: start,
            start_time: start,
            state: ExecState::Stopped,
            queue: BTreeMap::new(),
            index: HashMap::new(),
            non_daemon: 0,
            next_key: 0,
            next_seq: 0,
            dispatch_seq: 0,
            stop_requested: false,
            pause_requested: false,
            fibers: HashMap::new(),
            next_fiber: 0,
            current: None,
        };
        Self {
            shared: Rc::new(ExecShared {
                core: RefCell::new(core),
                listeners: Listeners::new(),
                errors,
                trace: TraceLog::new(),
                trace_enabled,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Rc<ExecShared>) -> Self {
        Self { shared }
    }

    // ── Accessors ──

    pub fn now(&self) -> SimTime {
        self.shared.core.borrow().clock
    }

    pub fn state(&self) -> ExecState {
        self.shared.core.borrow().state
    }

    pub fn error_log(&self) -> ErrorLog {
        self.shared.errors.clone()
    }

    pub fn trace_log(&self) -> TraceLog {
        self.shared.trace.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.core.borrow().queue.len()
    }

    pub fn next_event_time(&self) -> Option<SimTime> {
        let core = self.shared.core.borrow();
        core.queue.keys().next().map(|ord| ord.when)
    }

    pub fn live_fiber_count(&self) -> usize {
        self.shared.core.borrow().fibers.len()
    }

    /// Controller of the detachable event currently on the stack, if any.
    pub fn current_controller(&self) -> Option<EventController> {
        self.shared.core.borrow().current.clone()
    }

    pub fn on_lifecycle<F: Fn(&ExecutiveEvent) + 'static>(&self, f: F) -> ListenerId {
        self.shared.listeners.subscribe_fn(f)
    }

    pub fn remove_lifecycle_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.unsubscribe(id)
    }

    /// Initial clock value. Valid only before the run starts.
    pub fn set_start_time(&self, t: SimTime) -> SimResult<()> {
        let mut core = self.shared.core.borrow_mut();
        if core.state != ExecState::Stopped {
            return Err(SimError::ExecutiveState {
                state: core.state,
                operation: "set_start_time",
            });
        }
        core.start_time = t;
        core.clock = t;
        Ok(())
    }

    /// Purges volatile-flagged keys from a graph context. Invoked by the
    /// model between executive runs.
    pub fn clear_volatiles(&self, ctx: &GraphContext) {
        ctx.clear_volatiles();
    }

    // ── Event requests ──

    /// Schedule a synchronous event at `when` (priority 0, no payload).
    pub fn request_event<F>(&self, f: F, when: SimTime) -> SimResult<EventKey>
    where
        F: Fn(&Executive, &EventData) -> SimResult<()> + 'static,
    {
        self.request_event_with(Rc::new(f), when, 0.0, None, ServiceMode::Synchronous)
    }

    /// Full-control synchronous/batched request. `cb` must be shared
    /// (the same `Rc`) across requests that should batch together.
    pub fn request_event_with(
        &self,
        cb: SyncCallback,
        when: SimTime,
        priority: f64,
        data: EventData,
        mode: ServiceMode,
    ) -> SimResult<EventKey> {
        match mode {
            ServiceMode::Synchronous | ServiceMode::Batched => {
                self.schedule(EventAction::Sync(cb), when, priority, false, mode, data)
            }
            _ => Err(SimError::Structural {
                reason: "detachable modes take a fiber body, not a callback".into(),
            }),
        }
    }

    /// Daemon variant: identical, but the event does not keep the
    /// executive alive on its own.
    pub fn request_daemon_event<F>(&self, f: F, when: SimTime) -> SimResult<EventKey>
    where
        F: Fn(&Executive, &EventData) -> SimResult<()> + 'static,
    {
        self.schedule(
            EventAction::Sync(Rc::new(f)),
            when,
            0.0,
            true,
            ServiceMode::Synchronous,
            None,
        )
    }

    pub fn request_daemon_event_with(
        &self,
        cb: SyncCallback,
        when: SimTime,
        priority: f64,
        data: EventData,
    ) -> SimResult<EventKey> {
        self.schedule(
            EventAction::Sync(cb),
            when,
            priority,
            true,
            ServiceMode::Synchronous,
            data,
        )
    }

    /// Schedule a detachable event: `f` is called at dispatch with the
    /// thread's controller and builds the suspendable body.
    pub fn request_detachable_event<F, Fut>(&self, f: F, when: SimTime) -> SimResult<EventKey>
    where
        F: FnOnce(EventController, EventData) -> Fut + 'static,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        self.request_detachable_event_with(f, when, 0.0, None, ServiceMode::Detachable)
    }

    pub fn request_detachable_event_with<F, Fut>(
        &self,
        f: F,
        when: SimTime,
        priority: f64,
        data: EventData,
        mode: ServiceMode,
    ) -> SimResult<EventKey>
    where
        F: FnOnce(EventController, EventData) -> Fut + 'static,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        let mode = match mode {
            ServiceMode::Detachable | ServiceMode::AsynchronousActor => mode,
            _ => ServiceMode::Detachable,
        };
        let factory: FiberFactory = Box::new(move |ctl, data| Box::pin(f(ctl, data)));
        self.schedule(EventAction::Spawn(factory), when, priority, false, mode, data)
    }

    pub(crate) fn schedule_resume(
        &self,
        fiber: FiberId,
        when: SimTime,
        priority: f64,
    ) -> SimResult<EventKey> {
        self.schedule(
            EventAction::Resume(fiber),
            when,
            priority,
            false,
            ServiceMode::Synchronous,
            None,
        )
    }

    fn schedule(
        &self,
        action: EventAction,
        when: SimTime,
        priority: f64,
        daemon: bool,
        mode: ServiceMode,
        data: EventData,
    ) -> SimResult<EventKey> {
        let mut core = self.shared.core.borrow_mut();
        if core.state == ExecState::Finished {
            return Err(SimError::ExecutiveState {
                state: core.state,
                operation: "request_event",
            });
        }
        let mut when = when;
        if when < core.clock {
            if core.config.ignore_causality_violations {
                when = core.clock;
            } else {
                return Err(SimError::Causality {
                    requested: when,
                    now: core.clock,
                });
            }
        }
        let key = core.next_key;
        core.next_key += 1;
        let seq = core.next_seq;
        core.next_seq += 1;
        let ord = EventOrd {
            when,
            priority,
            daemon,
            seq,
        };
        core.queue.insert(
            ord,
            QueuedEvent {
                key,
                when,
                priority,
                daemon,
                mode,
                action,
                data,
            },
        );
        core.index.insert(key, ord);
        if !daemon {
            core.non_daemon += 1;
        }
        trace!(target: "sim_lite::executive", key, %when, priority, daemon, "event requested");
        Ok(key)
    }

    // ── Rescinding ──

    /// Remove a future event. A no-op (false) for already-dispatched keys.
    pub fn unrequest(&self, key: EventKey) -> bool {
        let mut core = self.shared.core.borrow_mut();
        remove_event(&mut core, key)
    }

    /// Remove every future event whose payload is `target` (by identity).
    pub fn unrequest_for_target(&self, target: &Rc<dyn Any>) -> usize {
        self.unrequest_where(|info| {
            info.data
                .as_ref()
                .is_some_and(|d| Rc::ptr_eq(d, target))
        })
    }

    /// Remove every future event matching `pred`.
    pub fn unrequest_where<P>(&self, pred: P) -> usize
    where
        P: Fn(&EventInfo<'_>) -> bool,
    {
        let mut core = self.shared.core.borrow_mut();
        let doomed: Vec<EventKey> = core
            .queue
            .values()
            .filter(|ev| {
                pred(&EventInfo {
                    key: ev.key,
                    when: ev.when,
                    priority: ev.priority,
                    daemon: ev.daemon,
                    mode: ev.mode,
                    data: &ev.data,
                })
            })
            .map(|ev| ev.key)
            .collect();
        let mut removed = 0;
        for key in doomed {
            if remove_event(&mut core, key) {
                removed += 1;
            }
        }
        removed
    }

    // ── Lifecycle ──

    /// Run the dispatch loop until it finishes, pauses, or is stopped.
    pub fn start(&self) -> SimResult<()> {
        {
            let mut core = self.shared.core.borrow_mut();
            match core.state {
                ExecState::Running => {
                    return Err(SimError::ExecutiveState {
                        state: core.state,
                        operation: "start",
                    })
                }
                ExecState::Finished => {
                    return Err(SimError::ExecutiveState {
                        state: core.state,
                        operation: "start",
                    })
                }
                ExecState::Stopped => {
                    core.clock = core.start_time;
                    core.state = ExecState::Running;
                    core.stop_requested = false;
                    core.pause_requested = false;
                    drop(core);
                    self.shared.listeners.emit(&ExecutiveEvent::Starting);
                    self.shared.listeners.emit(&ExecutiveEvent::Started);
                }
                ExecState::Paused => {
                    core.state = ExecState::Running;
                    core.pause_requested = false;
                    drop(core);
                    self.shared.listeners.emit(&ExecutiveEvent::Resumed);
                }
            }
        }
        self.run()
    }

    /// Resume a paused run. Alias of `start` with a paused-state check.
    pub fn resume(&self) -> SimResult<()> {
        if self.state() != ExecState::Paused {
            return Err(SimError::ExecutiveState {
                state: self.state(),
                operation: "resume",
            });
        }
        self.start()
    }

    /// Request a stop. Inside a run, dispatch halts before the next
    /// event; outside one, the executive finishes immediately.
    pub fn stop(&self) {
        let state = {
            let mut core = self.shared.core.borrow_mut();
            if core.state == ExecState::Finished {
                return;
            }
            core.stop_requested = true;
            core.state
        };
        self.shared.listeners.emit(&ExecutiveEvent::Stopping);
        if matches!(state, ExecState::Stopped | ExecState::Paused) {
            self.finish(true);
        }
    }

    /// Halt dispatch after the current event, leaving the queue intact.
    pub fn pause(&self) {
        let mut core = self.shared.core.borrow_mut();
        if core.state == ExecState::Running {
            core.pause_requested = true;
        }
    }

    /// Return to `Stopped`: queue cleared, live detachable threads
    /// dropped (their release handlers run), clock restored.
    pub fn reset(&self) -> SimResult<()> {
        let fibers: Vec<FiberCell> = {
            let mut core = self.shared.core.borrow_mut();
            if core.state == ExecState::Running {
                return Err(SimError::ExecutiveState {
                    state: core.state,
                    operation: "reset",
                });
            }
            core.queue.clear();
            core.index.clear();
            core.non_daemon = 0;
            core.stop_requested = false;
            core.pause_requested = false;
            core.clock = core.start_time;
            core.state = ExecState::Stopped;
            core.fibers.drain().map(|(_, cell)| cell).collect()
        };
        for cell in &fibers {
            cell.state.borrow_mut().phase = FiberPhase::Finished;
        }
        drop(fibers);
        self.shared.listeners.emit(&ExecutiveEvent::Reset);
        Ok(())
    }

    // ── Dispatch loop ──

    fn run(&self) -> SimResult<()> {
        loop {
            enum Step {
                Finish(bool),
                Pause,
                Dispatch(QueuedEvent, Vec<QueuedEvent>),
            }
            let step = {
                let mut core = self.shared.core.borrow_mut();
                if core.stop_requested {
                    Step::Finish(true)
                } else if core.pause_requested {
                    Step::Pause
                } else if core.non_daemon == 0 {
                    // Daemon events never keep the run alive.
                    Step::Finish(false)
                } else {
                    let ord = *core.queue.keys().next().expect("non_daemon > 0");
                    let ev = core.queue.remove(&ord).expect("popped head");
                    core.index.remove(&ev.key);
                    if !ord.daemon {
                        core.non_daemon -= 1;
                    }
                    core.clock = ev.when;
                    core.dispatch_seq += 1;
                    let batch = drain_batch(&mut core, &ord, &ev);
                    Step::Dispatch(ev, batch)
                }
            };
            match step {
                Step::Finish(stopped) => {
                    self.finish(stopped);
                    return Ok(());
                }
                Step::Pause => {
                    {
                        let mut core = self.shared.core.borrow_mut();
                        core.state = ExecState::Paused;
                        core.pause_requested = false;
                    }
                    self.shared.listeners.emit(&ExecutiveEvent::Paused);
                    return Ok(());
                }
                Step::Dispatch(ev, batch) => self.dispatch(ev, batch),
            }
        }
    }

    fn dispatch(&self, ev: QueuedEvent, batch: Vec<QueuedEvent>) {
        if self.shared.trace_enabled {
            let seq = self.shared.core.borrow().dispatch_seq;
            self.shared.trace.append(TraceRecord {
                seq,
                key: ev.key,
                when: ev.when,
                priority: ev.priority,
                mode: ev.mode,
                daemon: ev.daemon,
                batch_size: 1 + batch.len(),
            });
        }
        trace!(target: "sim_lite::executive", key = ev.key, when = %ev.when, "dispatch");
        match ev.action {
            EventAction::Sync(cb) => {
                // Batched duplicates were drained: one logical firing.
                if let Err(e) = cb(self, &ev.data) {
                    debug!(target: "sim_lite::executive", error = %e, "callback failed");
                    self.shared.errors.post(e, None, Some(ev.when));
                }
            }
            EventAction::Spawn(factory) => {
                self.spawn_fiber(factory, ev.data, ev.priority);
                for b in batch {
                    if let EventAction::Spawn(f) = b.action {
                        self.spawn_fiber(f, b.data, b.priority);
                    }
                }
            }
            EventAction::Resume(id) => self.resume_fiber(id),
        }
    }

    fn finish(&self, stopped: bool) {
        let fibers: Vec<FiberCell> = {
            let mut core = self.shared.core.borrow_mut();
            core.state = ExecState::Finished;
            core.stop_requested = false;
            core.pause_requested = false;
            core.queue.clear();
            core.index.clear();
            core.non_daemon = 0;
            core.current = None;
            core.fibers.drain().map(|(_, cell)| cell).collect()
        };
        for cell in &fibers {
            cell.state.borrow_mut().phase = FiberPhase::Finished;
        }
        drop(fibers);
        if stopped {
            self.shared.listeners.emit(&ExecutiveEvent::Stopped);
        }
        self.shared.listeners.emit(&ExecutiveEvent::Finished);
        debug!(target: "sim_lite::executive", "run finished");
    }

    // ── Fibers ──

    fn spawn_fiber(&self, factory: FiberFactory, data: EventData, priority: f64) {
        let id = {
            let mut core = self.shared.core.borrow_mut();
            if core.fibers.len() >= core.config.worker_threads {
                let limit = core.config.worker_threads;
                drop(core);
                self.shared
                    .errors
                    .post(SimError::FiberLimit { limit }, None, Some(self.now()));
                return;
            }
            let id = core.next_fiber;
            core.next_fiber += 1;
            id
        };
        let state = Rc::new(RefCell::new(FiberState {
            id,
            phase: FiberPhase::Running,
            resume_key: None,
            resume_granted: false,
            abort_requested: false,
            priority,
        }));
        let controller = EventController {
            exec: Rc::downgrade(&self.shared),
            state: state.clone(),
        };
        let future = factory(controller.clone(), data);
        {
            let mut core = self.shared.core.borrow_mut();
            core.fibers.insert(
                id,
                FiberCell {
                    future: Some(future),
                    state,
                    controller,
                },
            );
        }
        self.poll_fiber(id);
    }

    fn resume_fiber(&self, id: FiberId) {
        let state = {
            let core = self.shared.core.borrow();
            core.fibers.get(&id).map(|cell| cell.state.clone())
        };
        // A missing fiber means it was aborted; the resume is stale.
        let Some(state) = state else { return };
        {
            let mut st = state.borrow_mut();
            st.resume_granted = true;
            st.resume_key = None;
        }
        self.poll_fiber(id);
    }

    fn poll_fiber(&self, id: FiberId) {
        let taken = {
            let mut core = self.shared.core.borrow_mut();
            let Some(cell) = core.fibers.get_mut(&id) else {
                return;
            };
            let Some(future) = cell.future.take() else {
                return;
            };
            let controller = cell.controller.clone();
            core.current = Some(controller.clone());
            (future, controller)
        };
        let (mut future, controller) = taken;
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let poll = future.as_mut().poll(&mut cx);
        let finished = {
            let mut core = self.shared.core.borrow_mut();
            core.current = None;
            match poll {
                Poll::Pending => {
                    if let Some(cell) = core.fibers.get_mut(&id) {
                        cell.future = Some(future);
                    }
                    None
                }
                Poll::Ready(result) => {
                    core.fibers.remove(&id);
                    Some(result)
                }
            }
        };
        if let Some(result) = finished {
            controller.state.borrow_mut().phase = FiberPhase::Finished;
            match result {
                Ok(()) => {}
                Err(SimError::FiberAborted) => {
                    trace!(target: "sim_lite::executive", fiber = id, "fiber aborted");
                }
                Err(e) => {
                    let now = self.now();
                    self.shared.errors.post(e, None, Some(now));
                }
            }
        }
    }

    pub(crate) fn abort_fiber(&self, id: FiberId) {
        let cell = {
            let mut core = self.shared.core.borrow_mut();
            let cell = core.fibers.remove(&id);
            if let Some(cell) = &cell {
                let resume = cell.state.borrow().resume_key;
                if let Some(key) = resume {
                    remove_event(&mut core, key);
                }
                cell.state.borrow_mut().phase = FiberPhase::Finished;
            }
            cell
        };
        // Dropping the parked future runs its release handlers with no
        // core borrow held.
        drop(cell);
    }
}

fn remove_event(core: &mut ExecCore, key: EventKey) -> bool {
    if let Some(ord) = core.index.remove(&key) {
        if core.queue.remove(&ord).is_some() {
            if !ord.daemon {
                core.non_daemon -= 1;
            }
            return true;
        }
    }
    false
}

/// Drain immediately-following queue entries that belong to the same
/// logical batch as `ev` (same instant, same priority, same callback or
/// subscriber payload identity).
fn drain_batch(core: &mut ExecCore, ord: &EventOrd, ev: &QueuedEvent) -> Vec<QueuedEvent> {
    if !matches!(
        ev.mode,
        ServiceMode::Batched | ServiceMode::AsynchronousActor
    ) {
        return Vec::new();
    }
    let mut batch = Vec::new();
    loop {
        let next = match core.queue.iter().next() {
            Some((&nord, nev))
                if nord.when == ord.when
                    && nord.priority.total_cmp(&ord.priority) == Ordering::Equal
                    && nev.mode == ev.mode
                    && data_identical(&nev.data, &ev.data)
                    && actions_batchable(&ev.action, &nev.action) =>
            {
                Some(nord)
            }
            _ => None,
        };
        match next {
            Some(nord) => {
                let nev = core.queue.remove(&nord).expect("batch head");
                core.index.remove(&nev.key);
                if !nord.daemon {
                    core.non_daemon -= 1;
                }
                batch.push(nev);
            }
            None => break,
        }
    }
    batch
}

fn actions_batchable(a: &EventAction, b: &EventAction) -> bool {
    match (a, b) {
        (EventAction::Sync(x), EventAction::Sync(y)) => Rc::ptr_eq(x, y),
        (EventAction::Spawn(_), EventAction::Spawn(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{epoch_plus_minutes, sim_epoch, SimDuration};

    fn collect_tags() -> (Rc<RefCell<Vec<(&'static str, SimTime)>>>, Executive) {
        (
            Rc::new(RefCell::new(Vec::new())),
            Executive::new(SimConfig::default()),
        )
    }

    #[test]
    fn same_instant_same_priority_dispatches_fifo() {
        let (seen, exec) = collect_tags();
        for tag in ["A", "B", "C"] {
            let seen = seen.clone();
            exec.request_event(
                move |ex: &Executive, _: &EventData| {
                    seen.borrow_mut().push((tag, ex.now()));
                    Ok(())
                },
                epoch_plus_minutes(10),
            )
            .unwrap();
        }
        exec.start().unwrap();
        let seen = seen.borrow();
        assert_eq!(
            seen.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec!["A", "B", "C"]
        );
        assert!(seen.iter().all(|(_, at)| *at == epoch_plus_minutes(10)));
    }

    #[test]
    fn higher_priority_fires_first_at_same_instant() {
        let (seen, exec) = collect_tags();
        let at = epoch_plus_minutes(5);
        for (tag, priority) in [("low", -1.0), ("high", 10.0), ("mid", 0.0)] {
            let seen = seen.clone();
            exec.request_event_with(
                Rc::new(move |ex: &Executive, _: &EventData| {
                    seen.borrow_mut().push((tag, ex.now()));
                    Ok(())
                }),
                at,
                priority,
                None,
                ServiceMode::Synchronous,
            )
            .unwrap();
        }
        exec.start().unwrap();
        assert_eq!(
            seen.borrow().iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec!["high", "mid", "low"]
        );
    }

    #[test]
    fn rescinded_event_never_fires() {
        let (seen, exec) = collect_tags();
        let s1 = seen.clone();
        exec.request_event(
            move |ex: &Executive, _: &EventData| {
                s1.borrow_mut().push(("e1", ex.now()));
                Ok(())
            },
            epoch_plus_minutes(5),
        )
        .unwrap();
        let s2 = seen.clone();
        let key2 = exec
            .request_event(
                move |ex: &Executive, _: &EventData| {
                    s2.borrow_mut().push(("e2", ex.now()));
                    Ok(())
                },
                epoch_plus_minutes(6),
            )
            .unwrap();
        let exec2 = exec.clone();
        exec.request_event(
            move |_: &Executive, _: &EventData| {
                assert!(exec2.unrequest(key2));
                Ok(())
            },
            epoch_plus_minutes(3),
        )
        .unwrap();
        exec.start().unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].0, "e1");
    }

    #[test]
    fn daemon_events_do_not_keep_the_run_alive() {
        let (seen, exec) = collect_tags();
        let s = seen.clone();
        exec.request_daemon_event(
            move |ex: &Executive, _: &EventData| {
                s.borrow_mut().push(("daemon", ex.now()));
                Ok(())
            },
            epoch_plus_minutes(60),
        )
        .unwrap();
        let s = seen.clone();
        exec.request_event(
            move |ex: &Executive, _: &EventData| {
                s.borrow_mut().push(("real", ex.now()));
                Ok(())
            },
            epoch_plus_minutes(1),
        )
        .unwrap();
        exec.start().unwrap();
        // The daemon at t=60 is dropped once the last non-daemon ran.
        assert_eq!(seen.borrow().iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec!["real"]);
        assert_eq!(exec.state(), ExecState::Finished);
    }

    #[test]
    fn non_daemon_fires_before_daemon_in_a_tie() {
        let (seen, exec) = collect_tags();
        let at = epoch_plus_minutes(2);
        let s = seen.clone();
        exec.request_daemon_event(
            move |_: &Executive, _: &EventData| {
                s.borrow_mut().push(("daemon", at));
                Ok(())
            },
            at,
        )
        .unwrap();
        let s = seen.clone();
        exec.request_event(
            move |_: &Executive, _: &EventData| {
                s.borrow_mut().push(("normal", at));
                Ok(())
            },
            at,
        )
        .unwrap();
        // A later non-daemon anchor keeps the run alive past the tie.
        let s = seen.clone();
        exec.request_event(
            move |ex: &Executive, _: &EventData| {
                s.borrow_mut().push(("anchor", ex.now()));
                Ok(())
            },
            epoch_plus_minutes(3),
        )
        .unwrap();
        exec.start().unwrap();
        assert_eq!(
            seen.borrow().iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec!["normal", "daemon", "anchor"]
        );
    }

    #[test]
    fn causality_violation_fails_unless_configured_away() {
        let exec = Executive::new(SimConfig::default());
        exec.set_start_time(epoch_plus_minutes(10)).unwrap();
        let err = exec
            .request_event(|_, _| Ok(()), epoch_plus_minutes(5))
            .unwrap_err();
        assert!(matches!(err, SimError::Causality { .. }));

        let lenient = Executive::new(SimConfig {
            ignore_causality_violations: true,
            ..Default::default()
        });
        lenient.set_start_time(epoch_plus_minutes(10)).unwrap();
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        lenient
            .request_event(
                move |ex: &Executive, _: &EventData| {
                    *s.borrow_mut() = Some(ex.now());
                    Ok(())
                },
                epoch_plus_minutes(5),
            )
            .unwrap();
        lenient.start().unwrap();
        assert_eq!(*seen.borrow(), Some(epoch_plus_minutes(10)));
    }

    #[test]
    fn batched_events_deliver_once() {
        let exec = Executive::new(SimConfig::default());
        let hits = Rc::new(RefCell::new(0u32));
        let h = hits.clone();
        let cb: SyncCallback = Rc::new(move |_, _| {
            *h.borrow_mut() += 1;
            Ok(())
        });
        let payload: Rc<dyn Any> = Rc::new("batch");
        let at = epoch_plus_minutes(1);
        for _ in 0..3 {
            exec.request_event_with(
                cb.clone(),
                at,
                0.0,
                Some(payload.clone()),
                ServiceMode::Batched,
            )
            .unwrap();
        }
        // Different payload: a separate logical firing.
        exec.request_event_with(cb.clone(), at, 0.0, None, ServiceMode::Batched)
            .unwrap();
        exec.start().unwrap();
        assert_eq!(*hits.borrow(), 2);
    }

    #[test]
    fn detachable_suspend_advances_virtual_time_only() {
        let exec = Executive::new(SimConfig::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let exec_in = exec.clone();
        exec.request_detachable_event(
            move |ctl, _| {
                let seen = s.clone();
                let exec = exec_in.clone();
                async move {
                    seen.borrow_mut().push(("a", exec.now()));
                    ctl.suspend_for(SimDuration::minutes(5)).await?;
                    seen.borrow_mut().push(("b", exec.now()));
                    Ok(())
                }
            },
            sim_epoch(),
        )
        .unwrap();
        exec.start().unwrap();
        let seen = seen.borrow();
        assert_eq!(seen[0], ("a", sim_epoch()));
        assert_eq!(seen[1], ("b", epoch_plus_minutes(5)));
        assert_eq!(exec.live_fiber_count(), 0);
    }

    #[test]
    fn callback_error_lands_in_the_log_and_run_continues() {
        let exec = Executive::new(SimConfig::default());
        let seen = Rc::new(RefCell::new(0u32));
        exec.request_event(
            |_, _| {
                Err(SimError::TaskExecution {
                    reason: "deliberate".into(),
                })
            },
            epoch_plus_minutes(1),
        )
        .unwrap();
        let s = seen.clone();
        exec.request_event(
            move |_, _| {
                *s.borrow_mut() += 1;
                Ok(())
            },
            epoch_plus_minutes(2),
        )
        .unwrap();
        exec.start().unwrap();
        assert_eq!(*seen.borrow(), 1);
        assert_eq!(exec.error_log().len(), 1);
    }

    #[test]
    fn pause_halts_and_resume_continues() {
        let exec = Executive::new(SimConfig::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let pauser = exec.clone();
        exec.request_event(
            move |_, _| {
                s.borrow_mut().push("first");
                pauser.pause();
                Ok(())
            },
            epoch_plus_minutes(1),
        )
        .unwrap();
        let s = seen.clone();
        exec.request_event(
            move |_, _| {
                s.borrow_mut().push("second");
                Ok(())
            },
            epoch_plus_minutes(2),
        )
        .unwrap();
        exec.start().unwrap();
        assert_eq!(exec.state(), ExecState::Paused);
        assert_eq!(&*seen.borrow(), &["first"]);
        exec.resume().unwrap();
        assert_eq!(exec.state(), ExecState::Finished);
        assert_eq!(&*seen.borrow(), &["first", "second"]);
    }

    #[test]
    fn abort_drops_a_parked_fiber_and_runs_release_handlers() {
        struct Guard(Rc<RefCell<bool>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                *self.0.borrow_mut() = true;
            }
        }
        let exec = Executive::new(SimConfig::default());
        let released = Rc::new(RefCell::new(false));
        let reached_end = Rc::new(RefCell::new(false));
        let ctl_slot: Rc<RefCell<Option<EventController>>> = Rc::new(RefCell::new(None));

        let released_in = released.clone();
        let reached = reached_end.clone();
        let slot = ctl_slot.clone();
        exec.request_detachable_event(
            move |ctl, _| {
                let released_in = released_in.clone();
                let reached = reached.clone();
                *slot.borrow_mut() = Some(ctl.clone());
                async move {
                    let _guard = Guard(released_in);
                    ctl.suspend_for(SimDuration::minutes(30)).await?;
                    *reached.borrow_mut() = true;
                    Ok(())
                }
            },
            epoch_plus_minutes(1),
        )
        .unwrap();
        let slot = ctl_slot.clone();
        exec.request_event(
            move |_, _| {
                slot.borrow().as_ref().unwrap().abort();
                Ok(())
            },
            epoch_plus_minutes(2),
        )
        .unwrap();
        exec.start().unwrap();
        assert!(*released.borrow(), "Drop guard must run on abort");
        assert!(!*reached_end.borrow());
        assert_eq!(exec.live_fiber_count(), 0);
    }

    #[test]
    fn unrequest_for_target_removes_by_payload_identity() {
        let exec = Executive::new(SimConfig::default());
        let target: Rc<dyn Any> = Rc::new(42u32);
        let other: Rc<dyn Any> = Rc::new(43u32);
        let cb: SyncCallback = Rc::new(|_, _| Ok(()));
        exec.request_event_with(
            cb.clone(),
            epoch_plus_minutes(1),
            0.0,
            Some(target.clone()),
            ServiceMode::Synchronous,
        )
        .unwrap();
        exec.request_event_with(
            cb.clone(),
            epoch_plus_minutes(2),
            0.0,
            Some(target.clone()),
            ServiceMode::Synchronous,
        )
        .unwrap();
        exec.request_event_with(
            cb,
            epoch_plus_minutes(3),
            0.0,
            Some(other),
            ServiceMode::Synchronous,
        )
        .unwrap();
        assert_eq!(exec.unrequest_for_target(&target), 2);
        assert_eq!(exec.queue_len(), 1);
    }

    #[test]
    fn trace_records_dispatches_when_enabled() {
        let mut config = SimConfig::default();
        config.diagnostics.enable("Executive");
        let exec = Executive::new(config);
        exec.request_event(|_, _| Ok(()), epoch_plus_minutes(1))
            .unwrap();
        exec.request_event(|_, _| Ok(()), epoch_plus_minutes(2))
            .unwrap();
        exec.start().unwrap();
        let records = exec.trace_log().snapshot();
        assert_eq!(records.len(), 2);
        assert!(records[0].when < records[1].when);
    }
}
