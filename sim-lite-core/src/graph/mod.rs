pub mod context;
pub mod runner;
pub mod stats;

pub use context::GraphContext;
pub use runner::{CompletionSignaler, EdgeActivation, EdgeCallback, TaskRunner};
pub use stats::DurationStats;

use crate::observe::Listeners;
use crate::types::{EdgeId, ListenerId, SimDuration, SimTime, SyncId, VertexId};
use crate::validity::{StructureChange, ValidityService};
use petgraph::graph::{DiGraph, NodeIndex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;
use uuid::Uuid;

// ─── Arena cells ──────────────────────────────────────────────

/// Which end of its owning edge a vertex is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexRole {
    Pre,
    Post,
}

/// An edge is either a task (with execution semantics) or a bare
/// ligature joining one task's post vertex to another's pre vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Task,
    Ligature,
}

pub(crate) struct VertexCell {
    pub name: String,
    pub role: VertexRole,
    pub owner: EdgeId,
    /// Edges that must fire into this vertex before it triggers.
    pub inbound: Vec<EdgeId>,
    pub outbound: Vec<EdgeId>,
    pub synchronizer: Option<SyncId>,
    /// Trigger-to-launch counter: total times this vertex has fired.
    pub ttl: u32,
}

pub(crate) struct EdgeCell {
    pub name: String,
    pub guid: Uuid,
    pub kind: EdgeKind,
    pub pre: VertexId,
    pub post: VertexId,
    pub parent: Option<EdgeId>,
    pub children: Vec<EdgeId>,
    pub costarts: Vec<EdgeId>,
    pub cofinishes: Vec<EdgeId>,
    /// Planned duration used when no callback drives completion.
    pub duration: Option<SimDuration>,
    pub stats: Option<DurationStats>,
    pub callback: Option<EdgeCallback>,
    pub removed: bool,
}

struct SyncCell {
    members: Vec<VertexId>,
}

pub(crate) struct GraphInner {
    pub vertices: Vec<VertexCell>,
    pub edges: Vec<EdgeCell>,
    syncs: Vec<SyncCell>,
    /// petgraph mirror of the vertex topology for traversal queries.
    topo: DiGraph<VertexId, EdgeId>,
    topo_idx: HashMap<VertexId, NodeIndex>,
    removed_guids: Vec<Uuid>,
}

// ─── Events ───────────────────────────────────────────────────

/// Execution-protocol phases, in firing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgePhase {
    Starting,
    ExecutionStarting,
    ExecutionFinishing,
    Finishing,
}

#[derive(Clone, Debug)]
pub struct EdgeEvent {
    pub edge: EdgeId,
    pub guid: Uuid,
    pub phase: EdgePhase,
    pub context: Uuid,
    pub at: SimTime,
}

/// The task graph: edges (tasks) between pre/post vertices, ligatures,
/// hierarchy, co-start/co-finish coupling, and synchronizers. Execution
/// is driven by a [`TaskRunner`] over an [`Executive`](crate::executive::Executive).
#[derive(Clone)]
pub struct TaskGraph {
    pub(crate) inner: Rc<RefCell<GraphInner>>,
    validity: ValidityService,
    pub(crate) listeners: Rc<Listeners<EdgeEvent>>,
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(GraphInner {
                vertices: Vec::new(),
                edges: Vec::new(),
                syncs: Vec::new(),
                topo: DiGraph::new(),
                topo_idx: HashMap::new(),
                removed_guids: Vec::new(),
            })),
            validity: ValidityService::new(),
            listeners: Rc::new(Listeners::new()),
        }
    }

    pub fn validity(&self) -> &ValidityService {
        &self.validity
    }

    pub fn on_edge_event<F: Fn(&EdgeEvent) + 'static>(&self, f: F) -> ListenerId {
        self.listeners.subscribe_fn(f)
    }

    pub fn remove_edge_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    // ── Construction ──

    /// Creates a task edge with fresh pre and post vertices.
    pub fn add_task(&self, name: &str) -> EdgeId {
        let guid = Uuid::new_v4();
        let edge = {
            let mut g = self.inner.borrow_mut();
            let edge = g.edges.len() as EdgeId;
            let pre = new_vertex(&mut g, &format!("{name}.pre"), VertexRole::Pre, edge);
            let post = new_vertex(&mut g, &format!("{name}.post"), VertexRole::Post, edge);
            g.edges.push(EdgeCell {
                name: name.to_string(),
                guid,
                kind: EdgeKind::Task,
                pre,
                post,
                parent: None,
                children: Vec::new(),
                costarts: Vec::new(),
                cofinishes: Vec::new(),
                duration: None,
                stats: None,
                callback: None,
                removed: false,
            });
            g.vertices[pre as usize].outbound.push(edge);
            g.vertices[post as usize].inbound.push(edge);
            let (pi, qi) = (g.topo_idx[&pre], g.topo_idx[&post]);
            g.topo.add_edge(pi, qi, edge);
            edge
        };
        self.validity.add_node(guid);
        trace!(target: "sim_lite::task", edge, name, "task added");
        edge
    }

    /// Joins `pred`'s post vertex to `succ`'s pre vertex with a ligature.
    /// `succ` will not start until every inbound ligature has fired.
    pub fn connect(&self, pred: EdgeId, succ: EdgeId) -> EdgeId {
        let (lig, pred_guid, succ_guid) = {
            let mut g = self.inner.borrow_mut();
            let from = g.edges[pred as usize].post;
            let to = g.edges[succ as usize].pre;
            let lig = g.edges.len() as EdgeId;
            let name = format!("{}->{}", g.edges[pred as usize].name, g.edges[succ as usize].name);
            g.edges.push(EdgeCell {
                name,
                guid: Uuid::new_v4(),
                kind: EdgeKind::Ligature,
                pre: from,
                post: to,
                parent: None,
                children: Vec::new(),
                costarts: Vec::new(),
                cofinishes: Vec::new(),
                duration: None,
                stats: None,
                callback: None,
                removed: false,
            });
            g.vertices[from as usize].outbound.push(lig);
            g.vertices[to as usize].inbound.push(lig);
            let (fi, ti) = (g.topo_idx[&from], g.topo_idx[&to]);
            g.topo.add_edge(fi, ti, lig);
            (
                lig,
                g.edges[pred as usize].guid,
                g.edges[succ as usize].guid,
            )
        };
        self.validity.link_upstream(pred_guid, succ_guid);
        self.validity
            .note_structure_change(succ_guid, StructureChange::AddPreEdge);
        lig
    }

    /// Makes `child` part of `parent`'s internal subgraph. The parent
    /// completes execution only when all its children have finished.
    pub fn add_child(&self, parent: EdgeId, child: EdgeId) {
        let (parent_guid, child_guid) = {
            let mut g = self.inner.borrow_mut();
            if !g.edges[parent as usize].children.contains(&child) {
                g.edges[parent as usize].children.push(child);
            }
            g.edges[child as usize].parent = Some(parent);
            (g.edges[parent as usize].guid, g.edges[child as usize].guid)
        };
        self.validity.link_child(parent_guid, child_guid);
    }

    /// `co` starts in the same instant `principal` starts.
    pub fn add_costart(&self, principal: EdgeId, co: EdgeId) {
        let guid = {
            let mut g = self.inner.borrow_mut();
            if !g.edges[principal as usize].costarts.contains(&co) {
                g.edges[principal as usize].costarts.push(co);
            }
            g.edges[principal as usize].guid
        };
        self.validity
            .note_structure_change(guid, StructureChange::AddCostart);
    }

    /// `co` completes together with `principal`.
    pub fn add_cofinish(&self, principal: EdgeId, co: EdgeId) {
        let mut g = self.inner.borrow_mut();
        if !g.edges[principal as usize].cofinishes.contains(&co) {
            g.edges[principal as usize].cofinishes.push(co);
        }
    }

    /// A rendezvous over `members`: none of the vertices fires until all
    /// of them are satisfied, then all fire in registration order.
    pub fn add_synchronizer(&self, members: Vec<VertexId>) -> SyncId {
        let (sid, affected) = {
            let mut g = self.inner.borrow_mut();
            let sid = g.syncs.len() as SyncId;
            for &v in &members {
                g.vertices[v as usize].synchronizer = Some(sid);
            }
            g.syncs.push(SyncCell {
                members: members.clone(),
            });
            let affected: Vec<Uuid> = members
                .iter()
                .map(|&v| {
                    let owner = g.vertices[v as usize].owner;
                    g.edges[owner as usize].guid
                })
                .collect();
            (sid, affected)
        };
        for guid in affected {
            self.validity
                .note_structure_change(guid, StructureChange::NewSynchronizer);
        }
        sid
    }

    /// Detaches a task from the graph. Ligatures touching its vertices
    /// are dropped; co-finish partners are left uncoupled (no healing
    /// edge is synthesized for the no-successor case). The removed guid
    /// is queued for the error-sweep.
    pub fn remove_task(&self, edge: EdgeId) -> Uuid {
        let guid = {
            let mut g = self.inner.borrow_mut();
            let (pre, post, guid) = {
                let cell = &mut g.edges[edge as usize];
                cell.removed = true;
                (cell.pre, cell.post, cell.guid)
            };
            let doomed: Vec<EdgeId> = g
                .edges
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    e.kind == EdgeKind::Ligature
                        && !e.removed
                        && (e.pre == pre || e.pre == post || e.post == pre || e.post == post)
                })
                .map(|(i, _)| i as EdgeId)
                .collect();
            let mut dead: std::collections::HashSet<EdgeId> = doomed.iter().copied().collect();
            dead.insert(edge);
            for &lig in &doomed {
                g.edges[lig as usize].removed = true;
                let (from, to) = (g.edges[lig as usize].pre, g.edges[lig as usize].post);
                g.vertices[from as usize].outbound.retain(|&e| e != lig);
                g.vertices[to as usize].inbound.retain(|&e| e != lig);
            }
            g.topo.retain_edges(|topo, ei| !dead.contains(&topo[ei]));
            for cell in g.edges.iter_mut() {
                cell.children.retain(|&c| c != edge);
                cell.costarts.retain(|&c| c != edge);
                cell.cofinishes.retain(|&c| c != edge);
            }
            g.removed_guids.push(guid);
            guid
        };
        self.validity.remove_node(guid);
        guid
    }

    /// Guids removed since the last management sweep.
    pub fn drain_removed(&self) -> Vec<Uuid> {
        std::mem::take(&mut self.inner.borrow_mut().removed_guids)
    }

    // ── Edge configuration ──

    pub fn set_callback(&self, edge: EdgeId, callback: EdgeCallback) {
        self.inner.borrow_mut().edges[edge as usize].callback = Some(callback);
    }

    pub fn set_duration(&self, edge: EdgeId, d: SimDuration) {
        self.inner.borrow_mut().edges[edge as usize].duration = Some(d);
    }

    /// Opt this edge into duration statistics.
    pub fn enable_timing(&self, edge: EdgeId) {
        let mut g = self.inner.borrow_mut();
        if g.edges[edge as usize].stats.is_none() {
            g.edges[edge as usize].stats = Some(DurationStats::new());
        }
    }

    pub fn timing(&self, edge: EdgeId) -> Option<DurationStats> {
        self.inner.borrow().edges[edge as usize].stats
    }

    pub fn record_timing(&self, edge: EdgeId, d: SimDuration) {
        if let Some(stats) = self.inner.borrow_mut().edges[edge as usize].stats.as_mut() {
            stats.record(d);
        }
    }

    pub fn set_explicit_timing(&self, edge: EdgeId, d: SimDuration) {
        if let Some(stats) = self.inner.borrow_mut().edges[edge as usize].stats.as_mut() {
            stats.set_explicit(d);
        }
    }

    /// PERT triple `(optimistic, nominal, pessimistic)` for analysis.
    pub fn pert_durations(
        &self,
        edge: EdgeId,
    ) -> Option<(SimDuration, SimDuration, SimDuration)> {
        let stats = self.inner.borrow().edges[edge as usize].stats?;
        Some((stats.optimistic()?, stats.nominal()?, stats.pessimistic()?))
    }

    // ── Accessors ──

    pub fn task_guid(&self, edge: EdgeId) -> Uuid {
        self.inner.borrow().edges[edge as usize].guid
    }

    pub fn task_name(&self, edge: EdgeId) -> String {
        self.inner.borrow().edges[edge as usize].name.clone()
    }

    pub fn pre_vertex(&self, edge: EdgeId) -> VertexId {
        self.inner.borrow().edges[edge as usize].pre
    }

    pub fn post_vertex(&self, edge: EdgeId) -> VertexId {
        self.inner.borrow().edges[edge as usize].post
    }

    pub fn vertex_role(&self, v: VertexId) -> VertexRole {
        self.inner.borrow().vertices[v as usize].role
    }

    pub fn vertex_name(&self, v: VertexId) -> String {
        self.inner.borrow().vertices[v as usize].name.clone()
    }

    /// How many times the vertex has fired, across all runs.
    pub fn vertex_ttl(&self, v: VertexId) -> u32 {
        self.inner.borrow().vertices[v as usize].ttl
    }

    pub fn is_removed(&self, edge: EdgeId) -> bool {
        self.inner.borrow().edges[edge as usize].removed
    }

    pub fn task_count(&self) -> usize {
        self.inner
            .borrow()
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Task && !e.removed)
            .count()
    }

    /// Downstream task edges reachable from `edge` through the vertex
    /// topology mirror.
    pub fn downstream_tasks(&self, edge: EdgeId) -> Vec<EdgeId> {
        let g = self.inner.borrow();
        let start = g.topo_idx[&g.edges[edge as usize].post];
        let mut out = Vec::new();
        let mut dfs = petgraph::visit::Dfs::new(&g.topo, start);
        while let Some(node) = dfs.next(&g.topo) {
            let vid = g.topo[node];
            let cell = &g.vertices[vid as usize];
            let owner = &g.edges[cell.owner as usize];
            if cell.role == VertexRole::Pre && owner.kind == EdgeKind::Task && !owner.removed {
                out.push(cell.owner);
            }
        }
        out
    }

    pub(crate) fn sync_members(&self, sid: SyncId) -> Vec<VertexId> {
        self.inner.borrow().syncs[sid as usize].members.clone()
    }
}

fn new_vertex(g: &mut GraphInner, name: &str, role: VertexRole, owner: EdgeId) -> VertexId {
    let id = g.vertices.len() as VertexId;
    g.vertices.push(VertexCell {
        name: name.to_string(),
        role,
        owner,
        inbound: Vec::new(),
        outbound: Vec::new(),
        synchronizer: None,
        ttl: 0,
    });
    let idx = g.topo.add_node(id);
    g.topo_idx.insert(id, idx);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_get_their_own_pre_and_post_vertices() {
        let graph = TaskGraph::new();
        let t = graph.add_task("t");
        assert_eq!(graph.vertex_role(graph.pre_vertex(t)), VertexRole::Pre);
        assert_eq!(graph.vertex_role(graph.post_vertex(t)), VertexRole::Post);
        assert_eq!(graph.task_count(), 1);
    }

    #[test]
    fn connect_marks_the_successor_for_revalidation() {
        let graph = TaskGraph::new();
        let a = graph.add_task("a");
        let b = graph.add_task("b");
        graph.connect(a, b);
        // AddPreEdge can only invalidate.
        assert!(!graph.validity().self_valid(graph.task_guid(b)));
        assert!(graph.validity().self_valid(graph.task_guid(a)));
    }

    #[test]
    fn downstream_traversal_follows_ligatures() {
        let graph = TaskGraph::new();
        let a = graph.add_task("a");
        let b = graph.add_task("b");
        let c = graph.add_task("c");
        graph.connect(a, b);
        graph.connect(b, c);
        let downstream = graph.downstream_tasks(a);
        assert!(downstream.contains(&b));
        assert!(downstream.contains(&c));
        assert!(!downstream.contains(&a));
    }

    #[test]
    fn remove_task_drops_its_ligatures_and_queues_the_guid() {
        let graph = TaskGraph::new();
        let a = graph.add_task("a");
        let b = graph.add_task("b");
        let c = graph.add_task("c");
        graph.connect(a, b);
        graph.connect(b, c);
        let guid = graph.remove_task(b);
        assert!(graph.is_removed(b));
        assert_eq!(graph.drain_removed(), vec![guid]);
        assert!(graph.drain_removed().is_empty());
        assert!(graph.downstream_tasks(a).is_empty());
    }
}
