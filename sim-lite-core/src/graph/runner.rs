use crate::error::{SimError, SimResult};
use crate::executive::Executive;
use crate::graph::context::GraphContext;
use crate::graph::{EdgeEvent, EdgeKind, EdgePhase, TaskGraph};
use crate::types::{EdgeId, SimDuration, VertexId};
use std::rc::Rc;
use tracing::{trace, warn};

/// User callback invoked at `EdgeExecutionStarting`. It must arrange for
/// `signal_completion` to run — immediately, from a later event, or from
/// a detachable event thread holding the [`CompletionSignaler`].
pub type EdgeCallback = Rc<dyn Fn(&EdgeActivation) -> SimResult<()>>;

/// Everything a task callback needs: the runner, the edge, and the run's
/// graph context.
pub struct EdgeActivation {
    pub runner: TaskRunner,
    pub edge: EdgeId,
    pub ctx: GraphContext,
}

impl EdgeActivation {
    pub fn executive(&self) -> &Executive {
        &self.runner.exec
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.runner.graph
    }

    /// Hand out the one-shot completion signaler for this activation.
    pub fn completion_signaler(&self) -> CompletionSignaler {
        CompletionSignaler {
            runner: self.runner.clone(),
            edge: self.edge,
            ctx: self.ctx.clone(),
        }
    }

    pub fn signal_completion(&self) {
        self.runner.signal_completion(self.edge, &self.ctx);
    }
}

/// One-shot handle that completes an edge's execution when consumed.
pub struct CompletionSignaler {
    runner: TaskRunner,
    edge: EdgeId,
    ctx: GraphContext,
}

impl CompletionSignaler {
    pub fn signal(self) {
        self.runner.signal_completion(self.edge, &self.ctx);
    }

    pub fn edge(&self) -> EdgeId {
        self.edge
    }
}

/// Drives task-graph execution through the executive: every protocol
/// phase is an event at the current instant, so FIFO ordering preserves
/// the phase sequence and interleaves co-started work fairly.
#[derive(Clone)]
pub struct TaskRunner {
    graph: TaskGraph,
    exec: Executive,
}

impl TaskRunner {
    pub fn new(graph: &TaskGraph, exec: &Executive) -> Self {
        Self {
            graph: graph.clone(),
            exec: exec.clone(),
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn executive(&self) -> &Executive {
        &self.exec
    }

    /// Begin executing `edge` under `ctx` by satisfying its pre-vertex.
    pub fn start_task(&self, edge: EdgeId, ctx: &GraphContext) -> SimResult<()> {
        let pre = self.graph.pre_vertex(edge);
        let runner = self.clone();
        let ctx = ctx.clone();
        self.exec.request_event(
            move |_, _| {
                runner.arrive(pre, &ctx);
                Ok(())
            },
            self.exec.now(),
        )?;
        Ok(())
    }

    /// Clears errors whose target task was removed from the graph.
    /// The management sweep of the error collection.
    pub fn sweep_removed(&self) -> usize {
        let mut cleared = 0;
        for guid in self.graph.drain_removed() {
            cleared += self.exec.error_log().clear_for_target(guid);
        }
        cleared
    }

    // ── Vertex protocol ──

    fn arrive(&self, v: VertexId, ctx: &GraphContext) {
        if ctx.is_cancelled() {
            return;
        }
        let (required, sync) = {
            let g = self.graph.inner.borrow();
            let cell = &g.vertices[v as usize];
            let required = cell
                .inbound
                .iter()
                .filter(|&&e| !g.edges[e as usize].removed)
                .count();
            (required.max(1), cell.synchronizer)
        };
        let satisfied = {
            let mut run = ctx.run_mut();
            if run.fired.contains(&v) {
                return;
            }
            let n = run.arrivals.entry(v).or_insert(0);
            *n += 1;
            *n >= required
        };
        if !satisfied {
            return;
        }
        match sync {
            None => self.fire_vertex(v, ctx),
            Some(sid) => {
                let members = self.graph.sync_members(sid);
                let all_ready = {
                    let mut run = ctx.run_mut();
                    let ready = run.sync_ready.entry(sid).or_default();
                    ready.insert(v);
                    ready.len() == members.len()
                };
                if all_ready {
                    ctx.run_mut().sync_ready.remove(&sid);
                    // Rendezvous: all members advance, registration order.
                    for member in members {
                        self.fire_vertex(member, ctx);
                    }
                } else {
                    trace!(target: "sim_lite::task", vertex = v, sync = sid, "held at rendezvous");
                }
            }
        }
    }

    fn fire_vertex(&self, v: VertexId, ctx: &GraphContext) {
        {
            let mut run = ctx.run_mut();
            if !run.fired.insert(v) {
                return;
            }
        }
        let outbound = {
            let mut g = self.graph.inner.borrow_mut();
            g.vertices[v as usize].ttl += 1;
            g.vertices[v as usize].outbound.clone()
        };
        for e in outbound {
            let (kind, removed, target) = {
                let g = self.graph.inner.borrow();
                let cell = &g.edges[e as usize];
                (cell.kind, cell.removed, cell.post)
            };
            if removed {
                continue;
            }
            match kind {
                EdgeKind::Task => self.schedule_phase(e, EdgePhase::Starting, ctx),
                EdgeKind::Ligature => self.schedule_arrive(target, ctx),
            }
        }
    }

    fn schedule_arrive(&self, v: VertexId, ctx: &GraphContext) {
        let runner = self.clone();
        let ctx = ctx.clone();
        let result = self.exec.request_event(
            move |_, _| {
                runner.arrive(v, &ctx);
                Ok(())
            },
            self.exec.now(),
        );
        if result.is_err() {
            trace!(target: "sim_lite::task", vertex = v, "arrival dropped: executive closed");
        }
    }

    fn schedule_phase(&self, edge: EdgeId, phase: EdgePhase, ctx: &GraphContext) {
        let runner = self.clone();
        let ctx = ctx.clone();
        let result = self.exec.request_event(
            move |_, _| {
                runner.run_phase(edge, phase, &ctx);
                Ok(())
            },
            self.exec.now(),
        );
        if result.is_err() {
            trace!(target: "sim_lite::task", edge, ?phase, "phase dropped: executive closed");
        }
    }

    // ── Edge protocol ──

    fn run_phase(&self, edge: EdgeId, phase: EdgePhase, ctx: &GraphContext) {
        if ctx.is_cancelled() || self.graph.is_removed(edge) {
            return;
        }
        let guid = self.graph.task_guid(edge);
        self.graph.listeners.emit(&EdgeEvent {
            edge,
            guid,
            phase,
            context: ctx.id(),
            at: self.exec.now(),
        });
        match phase {
            EdgePhase::Starting => self.phase_starting(edge, ctx),
            EdgePhase::ExecutionStarting => self.phase_execution_starting(edge, ctx),
            EdgePhase::ExecutionFinishing => self.phase_execution_finishing(edge, ctx),
            EdgePhase::Finishing => self.phase_finishing(edge, ctx),
        }
    }

    fn phase_starting(&self, edge: EdgeId, ctx: &GraphContext) {
        let pre = self.graph.pre_vertex(edge);
        {
            let mut run = ctx.run_mut();
            if !run.active.insert(edge) {
                return;
            }
            // Re-arm the pre-vertex: arrivals for the next traversal pass
            // accumulate from zero once this one is underway.
            run.fired.remove(&pre);
            run.arrivals.remove(&pre);
        }
        let costarts = {
            let g = self.graph.inner.borrow();
            g.edges[edge as usize].costarts.clone()
        };
        for co in costarts {
            let launch = {
                let g = self.graph.inner.borrow();
                !g.edges[co as usize].removed
            } && !ctx.run().active.contains(&co);
            if launch {
                self.schedule_phase(co, EdgePhase::Starting, ctx);
            }
        }
        self.schedule_phase(edge, EdgePhase::ExecutionStarting, ctx);
    }

    fn phase_execution_starting(&self, edge: EdgeId, ctx: &GraphContext) {
        let guid = self.graph.task_guid(edge);
        let now = self.exec.now();

        // Exactly one completion signaler may exist per (edge, context);
        // re-entry past this point is the hard error, so the starting
        // window closes here.
        let duplicate = {
            let mut run = ctx.run_mut();
            run.active.remove(&edge);
            !run.signalers.insert(edge)
        };
        if duplicate {
            let name = self.graph.task_name(edge);
            self.exec.error_log().post(
                SimError::TaskExecution {
                    reason: format!(
                        "task '{name}' re-entered before its completion signaler was consumed"
                    ),
                },
                Some(guid),
                Some(now),
            );
            ctx.cancel();
            return;
        }
        ctx.run_mut().exec_started.insert(edge, now);

        let (children, callback, duration, nominal) = {
            let g = self.graph.inner.borrow();
            let cell = &g.edges[edge as usize];
            let children: Vec<EdgeId> = cell
                .children
                .iter()
                .copied()
                .filter(|&c| !g.edges[c as usize].removed)
                .collect();
            (
                children,
                cell.callback.clone(),
                cell.duration,
                cell.stats.and_then(|s| s.nominal()),
            )
        };

        if !children.is_empty() {
            ctx.run_mut()
                .children_remaining
                .insert(edge, children.len());
            for child in &children {
                let entry = {
                    let g = self.graph.inner.borrow();
                    let pre = g.edges[*child as usize].pre;
                    g.vertices[pre as usize]
                        .inbound
                        .iter()
                        .all(|&e| g.edges[e as usize].removed)
                };
                if entry {
                    self.schedule_phase(*child, EdgePhase::Starting, ctx);
                }
            }
        }

        if let Some(callback) = callback {
            let activation = EdgeActivation {
                runner: self.clone(),
                edge,
                ctx: ctx.clone(),
            };
            if let Err(err) = callback(&activation) {
                let name = self.graph.task_name(edge);
                warn!(target: "sim_lite::task", task = %name, error = %err, "edge callback failed");
                self.exec.error_log().post(
                    SimError::TaskExecution {
                        reason: format!("task '{name}': {err}"),
                    },
                    Some(guid),
                    Some(now),
                );
                self.graph.validity().set_self_valid(guid, false);
                ctx.run_mut().signalers.remove(&edge);
            }
        } else if children.is_empty() {
            // Default execution: complete after the planned duration.
            let d = duration.or(nominal).unwrap_or_else(SimDuration::zero);
            if d.is_zero() {
                self.signal_completion(edge, ctx);
            } else {
                let runner = self.clone();
                let ctx2 = ctx.clone();
                let result = self.exec.request_event(
                    move |_, _| {
                        runner.signal_completion(edge, &ctx2);
                        Ok(())
                    },
                    now + d,
                );
                match result {
                    Ok(key) => {
                        ctx.run_mut().completion_events.insert(edge, key);
                    }
                    Err(_) => {
                        ctx.run_mut().signalers.remove(&edge);
                    }
                }
            }
        }
    }

    /// Consume the completion signaler and advance to
    /// `EdgeExecutionFinishing`. Double signals are ignored with a warning.
    pub fn signal_completion(&self, edge: EdgeId, ctx: &GraphContext) {
        if ctx.is_cancelled() {
            return;
        }
        let (had, pending) = {
            let mut run = ctx.run_mut();
            (
                run.signalers.remove(&edge),
                run.completion_events.remove(&edge),
            )
        };
        if let Some(key) = pending {
            // No-op when this call IS the pending completion event.
            self.exec.unrequest(key);
        }
        if !had {
            warn!(target: "sim_lite::task", edge, "completion signaled with no outstanding signaler");
            return;
        }
        self.schedule_phase(edge, EdgePhase::ExecutionFinishing, ctx);
    }

    fn phase_execution_finishing(&self, edge: EdgeId, ctx: &GraphContext) {
        let now = self.exec.now();
        let started = ctx.run_mut().exec_started.remove(&edge);
        if let Some(started) = started {
            self.graph.record_timing(edge, now - started);
        }
        let cofinishes = {
            let g = self.graph.inner.borrow();
            g.edges[edge as usize].cofinishes.clone()
        };
        for co in cofinishes {
            if ctx.run().signalers.contains(&co) {
                self.signal_completion(co, ctx);
            }
        }
        // Post-vertex propagation is scheduled before the Finishing
        // phase so FIFO keeps the protocol order observable.
        let post = self.graph.post_vertex(edge);
        self.schedule_arrive(post, ctx);
        self.schedule_phase(edge, EdgePhase::Finishing, ctx);
    }

    fn phase_finishing(&self, edge: EdgeId, ctx: &GraphContext) {
        let (post, parent) = {
            let g = self.graph.inner.borrow();
            let cell = &g.edges[edge as usize];
            (cell.post, cell.parent)
        };
        {
            // Re-arm the post-vertex (it fired just before this phase).
            let mut run = ctx.run_mut();
            run.fired.remove(&post);
            run.arrivals.remove(&post);
        }
        if let Some(parent) = parent {
            let done = {
                let mut run = ctx.run_mut();
                match run.children_remaining.get_mut(&parent) {
                    Some(n) => {
                        *n -= 1;
                        *n == 0
                    }
                    None => false,
                }
            };
            if done {
                ctx.run_mut().children_remaining.remove(&parent);
                self.signal_completion(parent, ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::graph::EdgePhase;
    use crate::types::epoch_plus_minutes as m;
    use std::cell::RefCell;

    fn setup() -> (TaskGraph, Executive, TaskRunner, GraphContext) {
        let graph = TaskGraph::new();
        let exec = Executive::new(SimConfig::default());
        let runner = TaskRunner::new(&graph, &exec);
        (graph, exec, runner, GraphContext::new())
    }

    fn record_phases(graph: &TaskGraph) -> Rc<RefCell<Vec<(EdgeId, EdgePhase)>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        graph.on_edge_event(move |ev: &EdgeEvent| {
            l.borrow_mut().push((ev.edge, ev.phase));
        });
        log
    }

    #[test]
    fn single_task_walks_all_four_phases_in_order() {
        let (graph, exec, runner, ctx) = setup();
        let t = graph.add_task("t");
        let log = record_phases(&graph);
        runner.start_task(t, &ctx).unwrap();
        exec.start().unwrap();
        assert_eq!(
            &*log.borrow(),
            &[
                (t, EdgePhase::Starting),
                (t, EdgePhase::ExecutionStarting),
                (t, EdgePhase::ExecutionFinishing),
                (t, EdgePhase::Finishing),
            ]
        );
    }

    #[test]
    fn successor_starts_only_after_predecessor_finishes() {
        let (graph, exec, runner, ctx) = setup();
        let a = graph.add_task("a");
        let b = graph.add_task("b");
        graph.connect(a, b);
        let log = record_phases(&graph);
        runner.start_task(a, &ctx).unwrap();
        exec.start().unwrap();
        let log = log.borrow();
        let a_finish = log
            .iter()
            .position(|&(e, p)| e == a && p == EdgePhase::ExecutionFinishing)
            .unwrap();
        let b_start = log
            .iter()
            .position(|&(e, p)| e == b && p == EdgePhase::Starting)
            .unwrap();
        assert!(a_finish < b_start);
        assert_eq!(graph.vertex_ttl(graph.pre_vertex(b)), 1);
    }

    #[test]
    fn join_vertex_waits_for_both_predecessors() {
        let (graph, exec, runner, ctx) = setup();
        let a = graph.add_task("a");
        let b = graph.add_task("b");
        let c = graph.add_task("c");
        graph.connect(a, c);
        graph.connect(b, c);
        graph.set_duration(a, SimDuration::minutes(5));
        graph.set_duration(b, SimDuration::minutes(9));
        let c_started = Rc::new(RefCell::new(None));
        let cs = c_started.clone();
        let exec3 = exec.clone();
        graph.on_edge_event(move |ev: &EdgeEvent| {
            if ev.phase == EdgePhase::Starting && ev.edge == c {
                *cs.borrow_mut() = Some(exec3.now());
            }
        });
        runner.start_task(a, &ctx).unwrap();
        runner.start_task(b, &ctx).unwrap();
        exec.start().unwrap();
        // c must wait for the slower predecessor (b at t=9).
        assert_eq!(*c_started.borrow(), Some(m(9)));
    }

    #[test]
    fn duration_task_completes_in_virtual_time() {
        let (graph, exec, runner, ctx) = setup();
        let t = graph.add_task("t");
        graph.set_duration(t, SimDuration::minutes(42));
        graph.enable_timing(t);
        let finished_at = Rc::new(RefCell::new(None));
        let f = finished_at.clone();
        let exec2 = exec.clone();
        graph.on_edge_event(move |ev: &EdgeEvent| {
            if ev.phase == EdgePhase::ExecutionFinishing {
                *f.borrow_mut() = Some(exec2.now());
            }
        });
        runner.start_task(t, &ctx).unwrap();
        exec.start().unwrap();
        assert_eq!(*finished_at.borrow(), Some(m(42)));
        let stats = graph.timing(t).unwrap();
        assert_eq!(stats.nominal(), Some(SimDuration::minutes(42)));
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn costarts_fire_together_and_cofinishes_complete_together() {
        let (graph, exec, runner, ctx) = setup();
        let main = graph.add_task("main");
        let side = graph.add_task("side");
        graph.set_duration(main, SimDuration::minutes(10));
        // The side task would run for an hour on its own.
        graph.set_duration(side, SimDuration::minutes(60));
        graph.add_costart(main, side);
        graph.add_cofinish(main, side);
        let log = record_phases(&graph);
        runner.start_task(main, &ctx).unwrap();
        exec.start().unwrap();
        let log = log.borrow();
        let side_started = log
            .iter()
            .any(|&(e, p)| e == side && p == EdgePhase::Starting);
        assert!(side_started, "costart must start with its principal");
        let side_finish = log
            .iter()
            .position(|&(e, p)| e == side && p == EdgePhase::ExecutionFinishing);
        assert!(
            side_finish.is_some(),
            "cofinish must complete with its principal"
        );
        assert_eq!(exec.now(), m(10), "the run ends when the principal does");
    }

    #[test]
    fn reentry_before_signaler_consumption_is_a_hard_error() {
        let (graph, exec, runner, ctx) = setup();
        let t = graph.add_task("t");
        // A callback that never signals: the signaler stays outstanding.
        graph.set_callback(t, Rc::new(|_activation: &EdgeActivation| Ok(())));
        runner.start_task(t, &ctx).unwrap();
        // Re-enter the same edge under the same context a minute later,
        // while the first signaler is still outstanding.
        let r2 = runner.clone();
        let ctx2 = ctx.clone();
        exec.request_event(
            move |_, _| {
                r2.start_task(t, &ctx2)?;
                Ok(())
            },
            m(1),
        )
        .unwrap();
        exec.start().unwrap();
        assert_eq!(exec.error_log().len(), 1);
        assert!(
            ctx.is_cancelled(),
            "the run must abort on a duplicate signaler"
        );
    }

    #[test]
    fn failing_callback_records_error_and_invalidates_task() {
        let (graph, exec, runner, ctx) = setup();
        let t = graph.add_task("t");
        graph.set_callback(
            t,
            Rc::new(|_activation: &EdgeActivation| {
                Err(SimError::TaskExecution {
                    reason: "simulated fault".into(),
                })
            }),
        );
        runner.start_task(t, &ctx).unwrap();
        exec.start().unwrap();
        let errors = exec.error_log().snapshot();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].target, Some(graph.task_guid(t)));
        assert!(!graph.validity().self_valid(graph.task_guid(t)));
    }

    #[test]
    fn removed_task_errors_are_swept() {
        let (graph, exec, runner, ctx) = setup();
        let t = graph.add_task("t");
        graph.set_callback(
            t,
            Rc::new(|_activation: &EdgeActivation| {
                Err(SimError::TaskExecution {
                    reason: "fault".into(),
                })
            }),
        );
        runner.start_task(t, &ctx).unwrap();
        exec.start().unwrap();
        assert_eq!(exec.error_log().len(), 1);
        graph.remove_task(t);
        assert_eq!(runner.sweep_removed(), 1);
        assert!(exec.error_log().is_empty());
    }

    #[test]
    fn children_gate_their_parents_completion() {
        let (graph, exec, runner, ctx) = setup();
        let parent = graph.add_task("parent");
        let c1 = graph.add_task("c1");
        let c2 = graph.add_task("c2");
        graph.set_duration(c1, SimDuration::minutes(5));
        graph.set_duration(c2, SimDuration::minutes(3));
        graph.add_child(parent, c1);
        graph.add_child(parent, c2);
        graph.connect(c1, c2); // c2 runs after c1 inside the parent
        let finished_at = Rc::new(RefCell::new(None));
        let f = finished_at.clone();
        let exec2 = exec.clone();
        graph.on_edge_event(move |ev: &EdgeEvent| {
            if ev.edge == parent && ev.phase == EdgePhase::ExecutionFinishing {
                *f.borrow_mut() = Some(exec2.now());
            }
        });
        runner.start_task(parent, &ctx).unwrap();
        exec.start().unwrap();
        assert_eq!(
            *finished_at.borrow(),
            Some(m(8)),
            "parent completes when the child chain does (5 + 3)"
        );
    }

    #[test]
    fn synchronizer_holds_until_every_member_is_ready() {
        let (graph, exec, runner, ctx) = setup();
        let feed1 = graph.add_task("feed1");
        let feed2 = graph.add_task("feed2");
        let w1 = graph.add_task("w1");
        let w2 = graph.add_task("w2");
        graph.set_duration(feed1, SimDuration::minutes(2));
        graph.set_duration(feed2, SimDuration::minutes(20));
        graph.connect(feed1, w1);
        graph.connect(feed2, w2);
        graph.add_synchronizer(vec![graph.pre_vertex(w1), graph.pre_vertex(w2)]);
        let starts = Rc::new(RefCell::new(Vec::new()));
        let s = starts.clone();
        let exec2 = exec.clone();
        graph.on_edge_event(move |ev: &EdgeEvent| {
            if ev.phase == EdgePhase::Starting && (ev.edge == w1 || ev.edge == w2) {
                s.borrow_mut().push((ev.edge, exec2.now()));
            }
        });
        runner.start_task(feed1, &ctx).unwrap();
        runner.start_task(feed2, &ctx).unwrap();
        exec.start().unwrap();
        let starts = starts.borrow();
        assert_eq!(starts.len(), 2);
        // Both held to the rendezvous at t=20.
        assert!(starts.iter().all(|&(_, at)| at == m(20)));
    }
}
