use crate::observe::Listeners;
use crate::types::ListenerId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::trace;
use uuid::Uuid;

/// Topology mutations that can only ever invalidate the node they touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructureChange {
    AddPreEdge,
    RemovePreEdge,
    AddCostart,
    RemoveCostart,
    NewSynchronizer,
    Unknown,
}

/// How a contributor feeds a node's overall validity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DependKind {
    Upstream,
    Child,
}

/// One node's validity flip within a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidityChange {
    pub node: Uuid,
    pub previous: bool,
    pub current: bool,
}

struct NodeCell {
    self_valid: bool,
    overall: bool,
}

struct VsInner {
    /// Edges run contributor → dependent; a node's overall validity is
    /// the conjunction of its own state and every incoming neighbour.
    graph: DiGraph<Uuid, DependKind>,
    index: HashMap<Uuid, NodeIndex>,
    nodes: HashMap<Uuid, NodeCell>,
}

/// Tracks per-node validity: `overall = self ∧ children ∧ upstream`,
/// reassessed downstream whenever any input changes. One aggregated
/// notification fires per mutating call.
#[derive(Clone)]
pub struct ValidityService {
    inner: Rc<RefCell<VsInner>>,
    listeners: Rc<Listeners<Vec<ValidityChange>>>,
}

impl Default for ValidityService {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidityService {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(VsInner {
                graph: DiGraph::new(),
                index: HashMap::new(),
                nodes: HashMap::new(),
            })),
            listeners: Rc::new(Listeners::new()),
        }
    }

    pub fn on_change<F: Fn(&Vec<ValidityChange>) + 'static>(&self, f: F) -> ListenerId {
        self.listeners.subscribe_fn(f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn add_node(&self, node: Uuid) {
        let mut inner = self.inner.borrow_mut();
        if inner.index.contains_key(&node) {
            return;
        }
        let idx = inner.graph.add_node(node);
        inner.index.insert(node, idx);
        inner.nodes.insert(
            node,
            NodeCell {
                self_valid: true,
                overall: true,
            },
        );
    }

    pub fn remove_node(&self, node: Uuid) {
        let dependents = {
            let mut inner = self.inner.borrow_mut();
            let Some(idx) = inner.index.remove(&node) else {
                return;
            };
            let dependents: Vec<Uuid> = inner
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .map(|n| inner.graph[n])
                .collect();
            // remove_node swaps the last node into `idx`; fix its index.
            let moved = inner.graph.node_indices().last();
            inner.graph.remove_node(idx);
            if let Some(last) = moved {
                if last != idx {
                    if let Some(moved_guid) = inner.graph.node_weight(idx).copied() {
                        inner.index.insert(moved_guid, idx);
                    }
                }
            }
            inner.nodes.remove(&node);
            dependents
        };
        self.reassess(dependents);
    }

    pub fn contains(&self, node: Uuid) -> bool {
        self.inner.borrow().index.contains_key(&node)
    }

    pub fn link_upstream(&self, upstream: Uuid, downstream: Uuid) {
        self.link(upstream, downstream, DependKind::Upstream);
    }

    /// A child contributes to its parent's overall validity.
    pub fn link_child(&self, parent: Uuid, child: Uuid) {
        self.link(child, parent, DependKind::Child);
    }

    fn link(&self, contributor: Uuid, dependent: Uuid, kind: DependKind) {
        {
            let mut inner = self.inner.borrow_mut();
            let (Some(&from), Some(&to)) =
                (inner.index.get(&contributor), inner.index.get(&dependent))
            else {
                return;
            };
            if inner.graph.find_edge(from, to).is_none() {
                inner.graph.add_edge(from, to, kind);
            }
        }
        self.reassess(vec![dependent]);
    }

    pub fn unlink(&self, contributor: Uuid, dependent: Uuid) {
        {
            let mut inner = self.inner.borrow_mut();
            let (Some(&from), Some(&to)) =
                (inner.index.get(&contributor), inner.index.get(&dependent))
            else {
                return;
            };
            if let Some(edge) = inner.graph.find_edge(from, to) {
                inner.graph.remove_edge(edge);
            }
        }
        self.reassess(vec![dependent]);
    }

    pub fn self_valid(&self, node: Uuid) -> bool {
        self.inner
            .borrow()
            .nodes
            .get(&node)
            .map(|c| c.self_valid)
            .unwrap_or(false)
    }

    pub fn overall_valid(&self, node: Uuid) -> bool {
        self.inner
            .borrow()
            .nodes
            .get(&node)
            .map(|c| c.overall)
            .unwrap_or(false)
    }

    pub fn set_self_valid(&self, node: Uuid, valid: bool) {
        {
            let mut inner = self.inner.borrow_mut();
            match inner.nodes.get_mut(&node) {
                Some(cell) if cell.self_valid != valid => cell.self_valid = valid,
                _ => return,
            }
        }
        trace!(target: "sim_lite::validity", %node, valid, "self validity set");
        self.reassess(vec![node]);
    }

    /// Structure changes can only invalidate: the touched node's self
    /// state is forced false regardless of the change kind.
    pub fn note_structure_change(&self, node: Uuid, change: StructureChange) {
        trace!(target: "sim_lite::validity", %node, ?change, "structure change");
        self.set_self_valid(node, false);
    }

    /// Recomputes overall validity from `origins` outward (downstream),
    /// then fires one aggregated notification for every flip.
    fn reassess(&self, origins: Vec<Uuid>) {
        let changes = {
            let mut inner = self.inner.borrow_mut();
            let mut pre: HashMap<Uuid, bool> = HashMap::new();
            let mut queue: VecDeque<Uuid> = origins.into();
            let cap = 4 * (inner.graph.edge_count() + inner.graph.node_count() + 4);
            let mut steps = 0usize;
            while let Some(node) = queue.pop_front() {
                steps += 1;
                if steps > cap {
                    break;
                }
                let Some(&idx) = inner.index.get(&node) else {
                    continue;
                };
                let incoming_ok = inner
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|n| {
                        let guid = inner.graph[n];
                        inner.nodes.get(&guid).map(|c| c.overall).unwrap_or(true)
                    });
                let new_overall = inner
                    .nodes
                    .get(&node)
                    .map(|c| c.self_valid)
                    .unwrap_or(false)
                    && incoming_ok;
                let old_overall = inner.nodes.get(&node).map(|c| c.overall).unwrap_or(false);
                if new_overall != old_overall {
                    pre.entry(node).or_insert(old_overall);
                    if let Some(cell) = inner.nodes.get_mut(&node) {
                        cell.overall = new_overall;
                    }
                    let downstream: Vec<Uuid> = inner
                        .graph
                        .neighbors_directed(idx, Direction::Outgoing)
                        .map(|n| inner.graph[n])
                        .collect();
                    queue.extend(downstream);
                }
            }
            let changes: Vec<ValidityChange> = pre
                .into_iter()
                .filter_map(|(node, previous)| {
                    let current = inner.nodes.get(&node)?.overall;
                    (current != previous).then_some(ValidityChange {
                        node,
                        previous,
                        current,
                    })
                })
                .collect();
            changes
        };
        if !changes.is_empty() {
            self.listeners.emit(&changes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn overall_is_conjunction_of_self_upstream_and_children() {
        let vs = ValidityService::new();
        let ids = nodes(3);
        let (up, task, child) = (ids[0], ids[1], ids[2]);
        for id in &ids {
            vs.add_node(*id);
        }
        vs.link_upstream(up, task);
        vs.link_child(task, child);
        assert!(vs.overall_valid(task));

        vs.set_self_valid(child, false);
        assert!(!vs.overall_valid(task), "invalid child invalidates parent");
        assert!(vs.overall_valid(up), "upstream unaffected");

        vs.set_self_valid(child, true);
        assert!(vs.overall_valid(task));

        vs.set_self_valid(up, false);
        assert!(!vs.overall_valid(task), "invalid upstream invalidates");
        assert!(vs.self_valid(task), "self state untouched");
    }

    #[test]
    fn invalidity_propagates_down_a_chain_and_heals() {
        let vs = ValidityService::new();
        let ids = nodes(4);
        for id in &ids {
            vs.add_node(*id);
        }
        for pair in ids.windows(2) {
            vs.link_upstream(pair[0], pair[1]);
        }
        vs.set_self_valid(ids[0], false);
        for id in &ids[1..] {
            assert!(!vs.overall_valid(*id));
        }
        vs.set_self_valid(ids[0], true);
        for id in &ids {
            assert!(vs.overall_valid(*id));
        }
    }

    #[test]
    fn structure_changes_force_self_invalid() {
        let vs = ValidityService::new();
        let ids = nodes(1);
        vs.add_node(ids[0]);
        vs.note_structure_change(ids[0], StructureChange::AddPreEdge);
        assert!(!vs.self_valid(ids[0]));
        assert!(!vs.overall_valid(ids[0]));
    }

    #[test]
    fn one_aggregated_notification_per_transaction() {
        let vs = ValidityService::new();
        let ids = nodes(3);
        for id in &ids {
            vs.add_node(*id);
        }
        vs.link_upstream(ids[0], ids[1]);
        vs.link_upstream(ids[1], ids[2]);

        let batches = Rc::new(RefCell::new(Vec::new()));
        let b = batches.clone();
        vs.on_change(move |changes: &Vec<ValidityChange>| {
            b.borrow_mut().push(changes.len());
        });

        vs.set_self_valid(ids[0], false);
        assert_eq!(
            &*batches.borrow(),
            &[3],
            "three flips delivered as one batch"
        );
    }

    #[test]
    fn removing_an_upstream_restores_dependents() {
        let vs = ValidityService::new();
        let ids = nodes(2);
        for id in &ids {
            vs.add_node(*id);
        }
        vs.link_upstream(ids[0], ids[1]);
        vs.set_self_valid(ids[0], false);
        assert!(!vs.overall_valid(ids[1]));
        vs.remove_node(ids[0]);
        assert!(vs.overall_valid(ids[1]));
    }
}
