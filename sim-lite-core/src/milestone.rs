use crate::error::{SimError, SimResult};
use crate::types::{ListenerId, MilestoneId, RelationshipId, SimDuration, SimTime};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, trace};

// ─── Relationships ────────────────────────────────────────────

/// Directed constraint variants. The dependent milestone must fall in the
/// window the relationship derives from its independent milestone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelKind {
    /// dependent ≤ independent
    Lte,
    /// dependent ≥ independent
    Gte,
    /// dependent = independent + offset
    Strut,
    /// The milestone cannot leave the instant it was pinned at.
    Pin,
}

struct RelCell {
    kind: RelKind,
    dep: MilestoneId,
    ind: MilestoneId,
    /// Strut displacement; zero for the equality strut.
    offset: SimDuration,
    /// Pin anchor value.
    pin_value: Option<SimTime>,
    reciprocal: Option<RelationshipId>,
    enabled: bool,
    enabled_stack: Vec<bool>,
    removed: bool,
}

// ─── Milestones ───────────────────────────────────────────────

struct MsCell {
    name: String,
    instant: SimTime,
    active: bool,
    active_stack: Vec<bool>,
    /// Every relationship this milestone participates in, either side.
    rels: Vec<RelationshipId>,
    listeners: Vec<(ListenerId, Rc<dyn Fn(&MilestoneChange)>)>,
}

/// Fired once per changed milestone, after a reconciliation transaction
/// commits, carrying the prior instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MilestoneChange {
    pub milestone: MilestoneId,
    pub previous: SimTime,
    pub current: SimTime,
}

struct NetInner {
    milestones: Vec<MsCell>,
    rels: Vec<RelCell>,
    propagating: bool,
    next_listener: ListenerId,
}

/// Arena of milestones and directed relationships. Moving any milestone
/// reconciles every enabled relationship or rolls the whole transaction
/// back. Handles are cheap clones over shared state.
#[derive(Clone)]
pub struct MilestoneNetwork {
    inner: Rc<RefCell<NetInner>>,
}

impl Default for MilestoneNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MilestoneNetwork {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(NetInner {
                milestones: Vec::new(),
                rels: Vec::new(),
                propagating: false,
                next_listener: 0,
            })),
        }
    }

    // ── Milestones ──

    pub fn create_milestone(&self, name: &str, at: SimTime) -> MilestoneId {
        let mut net = self.inner.borrow_mut();
        let id = net.milestones.len() as MilestoneId;
        net.milestones.push(MsCell {
            name: name.to_string(),
            instant: at,
            active: true,
            active_stack: Vec::new(),
            rels: Vec::new(),
            listeners: Vec::new(),
        });
        trace!(target: "sim_lite::milestone", id, name, %at, "milestone created");
        id
    }

    pub fn instant(&self, id: MilestoneId) -> SimTime {
        self.inner.borrow().milestones[id as usize].instant
    }

    pub fn name(&self, id: MilestoneId) -> String {
        self.inner.borrow().milestones[id as usize].name.clone()
    }

    pub fn is_active(&self, id: MilestoneId) -> bool {
        self.inner.borrow().milestones[id as usize].active
    }

    /// An inactive milestone is indeterminate: it neither constrains nor
    /// fires change events.
    pub fn set_active(&self, id: MilestoneId, active: bool) {
        self.inner.borrow_mut().milestones[id as usize].active = active;
    }

    pub fn push_active(&self, id: MilestoneId, active: bool) {
        let mut net = self.inner.borrow_mut();
        let cell = &mut net.milestones[id as usize];
        let prior = cell.active;
        cell.active_stack.push(prior);
        cell.active = active;
    }

    pub fn pop_active(&self, id: MilestoneId) -> bool {
        let mut net = self.inner.borrow_mut();
        let cell = &mut net.milestones[id as usize];
        if let Some(prior) = cell.active_stack.pop() {
            cell.active = prior;
        }
        cell.active
    }

    pub fn observe<F: Fn(&MilestoneChange) + 'static>(
        &self,
        id: MilestoneId,
        f: F,
    ) -> ListenerId {
        let mut net = self.inner.borrow_mut();
        let lid = net.next_listener;
        net.next_listener += 1;
        net.milestones[id as usize].listeners.push((lid, Rc::new(f)));
        lid
    }

    pub fn unobserve(&self, id: MilestoneId, listener: ListenerId) -> bool {
        let mut net = self.inner.borrow_mut();
        let listeners = &mut net.milestones[id as usize].listeners;
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != listener);
        listeners.len() != before
    }

    // ── Relationship construction ──

    /// `a ≤ b`. Installs the pair: `Lte(a, b)` driving `a`, and its
    /// reciprocal `Gte(b, a)` driving `b`. Returns the primary.
    pub fn add_lte(&self, a: MilestoneId, b: MilestoneId) -> SimResult<RelationshipId> {
        self.add_pair(
            RelKind::Lte,
            a,
            b,
            SimDuration::zero(),
            RelKind::Gte,
            b,
            a,
            SimDuration::zero(),
        )
    }

    /// `a ≥ b`, reciprocal `Lte(b, a)`.
    pub fn add_gte(&self, a: MilestoneId, b: MilestoneId) -> SimResult<RelationshipId> {
        self.add_pair(
            RelKind::Gte,
            a,
            b,
            SimDuration::zero(),
            RelKind::Lte,
            b,
            a,
            SimDuration::zero(),
        )
    }

    /// `dep = ind + offset`, reciprocal `Strut(-offset)` swapped.
    pub fn add_strut(
        &self,
        dep: MilestoneId,
        ind: MilestoneId,
        offset: SimDuration,
    ) -> SimResult<RelationshipId> {
        self.add_pair(RelKind::Strut, dep, ind, offset, RelKind::Strut, ind, dep, -offset)
    }

    /// Equality is the zero-offset strut.
    pub fn add_eq(&self, a: MilestoneId, b: MilestoneId) -> SimResult<RelationshipId> {
        self.add_strut(a, b, SimDuration::zero())
    }

    /// Anchors `m` at its current instant. Pins have no reciprocal.
    pub fn add_pin(&self, m: MilestoneId) -> SimResult<RelationshipId> {
        let mut net = self.inner.borrow_mut();
        if net.propagating {
            return Err(SimError::NetworkBusy);
        }
        let at = net.milestones[m as usize].instant;
        let id = net.rels.len() as RelationshipId;
        net.rels.push(RelCell {
            kind: RelKind::Pin,
            dep: m,
            ind: m,
            offset: SimDuration::zero(),
            pin_value: Some(at),
            reciprocal: None,
            enabled: true,
            enabled_stack: Vec::new(),
            removed: false,
        });
        net.milestones[m as usize].rels.push(id);
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_pair(
        &self,
        kind: RelKind,
        dep: MilestoneId,
        ind: MilestoneId,
        offset: SimDuration,
        rkind: RelKind,
        rdep: MilestoneId,
        rind: MilestoneId,
        roffset: SimDuration,
    ) -> SimResult<RelationshipId> {
        let mut net = self.inner.borrow_mut();
        if net.propagating {
            return Err(SimError::NetworkBusy);
        }
        let primary = net.rels.len() as RelationshipId;
        let secondary = primary + 1;
        net.rels.push(RelCell {
            kind,
            dep,
            ind,
            offset,
            pin_value: None,
            reciprocal: Some(secondary),
            enabled: true,
            enabled_stack: Vec::new(),
            removed: false,
        });
        net.rels.push(RelCell {
            kind: rkind,
            dep: rdep,
            ind: rind,
            offset: roffset,
            pin_value: None,
            reciprocal: Some(primary),
            enabled: true,
            enabled_stack: Vec::new(),
            removed: false,
        });
        net.milestones[dep as usize].rels.push(primary);
        net.milestones[ind as usize].rels.push(primary);
        net.milestones[rdep as usize].rels.push(secondary);
        net.milestones[rind as usize].rels.push(secondary);
        Ok(primary)
    }

    /// Removes a relationship and its reciprocal.
    pub fn remove_relationship(&self, id: RelationshipId) -> SimResult<()> {
        let mut net = self.inner.borrow_mut();
        if net.propagating {
            return Err(SimError::NetworkBusy);
        }
        let recip = net.rels[id as usize].reciprocal;
        net.rels[id as usize].removed = true;
        if let Some(r) = recip {
            net.rels[r as usize].removed = true;
        }
        Ok(())
    }

    pub fn is_enabled(&self, id: RelationshipId) -> bool {
        let net = self.inner.borrow();
        let rel = &net.rels[id as usize];
        rel.enabled && !rel.removed
    }

    /// Enables or disables the relationship and its reciprocal together.
    pub fn set_enabled(&self, id: RelationshipId, enabled: bool) {
        let mut net = self.inner.borrow_mut();
        let recip = net.rels[id as usize].reciprocal;
        net.rels[id as usize].enabled = enabled;
        if let Some(r) = recip {
            net.rels[r as usize].enabled = enabled;
        }
    }

    pub fn push_enabled(&self, id: RelationshipId, enabled: bool) {
        let mut net = self.inner.borrow_mut();
        let recip = net.rels[id as usize].reciprocal;
        let prior = net.rels[id as usize].enabled;
        net.rels[id as usize].enabled_stack.push(prior);
        net.rels[id as usize].enabled = enabled;
        if let Some(r) = recip {
            let prior = net.rels[r as usize].enabled;
            net.rels[r as usize].enabled_stack.push(prior);
            net.rels[r as usize].enabled = enabled;
        }
    }

    pub fn pop_enabled(&self, id: RelationshipId) -> bool {
        let mut net = self.inner.borrow_mut();
        let recip = net.rels[id as usize].reciprocal;
        if let Some(prior) = net.rels[id as usize].enabled_stack.pop() {
            net.rels[id as usize].enabled = prior;
        }
        if let Some(r) = recip {
            if let Some(prior) = net.rels[r as usize].enabled_stack.pop() {
                net.rels[r as usize].enabled = prior;
            }
        }
        net.rels[id as usize].enabled
    }

    /// True when the relationship's constraint currently holds (vacuously
    /// true for disabled/removed relationships and inactive milestones).
    pub fn is_satisfied(&self, id: RelationshipId) -> bool {
        let net = self.inner.borrow();
        rel_satisfied(&net, id)
    }

    /// Every enabled relationship holds. The external observation-point
    /// invariant.
    pub fn all_satisfied(&self) -> bool {
        let net = self.inner.borrow();
        (0..net.rels.len() as RelationshipId).all(|id| rel_satisfied(&net, id))
    }

    // ── Movement ──

    /// Installs `t` on `m` and reconciles every enabled relationship by
    /// breadth-first propagation. On success returns the change set (one
    /// entry per moved milestone, prior value included) after firing each
    /// milestone's listeners once. An unsatisfiable window rolls every
    /// touched milestone back and nothing is fired.
    pub fn move_to(&self, m: MilestoneId, t: SimTime) -> SimResult<Vec<MilestoneChange>> {
        let (changes, fired) = {
            let mut net = self.inner.borrow_mut();
            if net.propagating {
                return Err(SimError::NetworkBusy);
            }
            if !net.milestones[m as usize].active {
                net.milestones[m as usize].instant = t;
                return Ok(Vec::new());
            }
            if net.milestones[m as usize].instant == t {
                return Ok(Vec::new());
            }
            net.propagating = true;
            let result = propagate(&mut net, m, t);
            net.propagating = false;
            let changes = result?;
            let mut fired: Vec<(Rc<dyn Fn(&MilestoneChange)>, MilestoneChange)> = Vec::new();
            for change in &changes {
                for (_, f) in &net.milestones[change.milestone as usize].listeners {
                    fired.push((f.clone(), change.clone()));
                }
            }
            (changes, fired)
        };
        for (f, change) in fired {
            f(&change);
        }
        Ok(changes)
    }
}

// ─── Reconciliation internals ─────────────────────────────────

/// Reaction window a single relationship imposes on its dependent,
/// given the independent endpoint's current instant. None when the
/// relationship does not constrain (inactive independent, unanchored pin).
fn reaction_of(net: &NetInner, rid: RelationshipId) -> Option<(Option<SimTime>, Option<SimTime>)> {
    let rel = &net.rels[rid as usize];
    match rel.kind {
        RelKind::Pin => rel.pin_value.map(|at| (Some(at), Some(at))),
        _ => {
            if !net.milestones[rel.ind as usize].active {
                return None;
            }
            let ind = net.milestones[rel.ind as usize].instant;
            Some(match rel.kind {
                RelKind::Lte => (None, Some(ind)),
                RelKind::Gte => (Some(ind), None),
                RelKind::Strut => (Some(ind + rel.offset), Some(ind + rel.offset)),
                RelKind::Pin => unreachable!(),
            })
        }
    }
}

/// Intersection of every enabled reaction window over `dep`'s
/// relationships. The bounds may cross mid-transaction while a neighbor
/// is still queued for its own update; callers must not treat a crossed
/// window as a conflict — only the post-propagation verification pass
/// decides that, against fully settled values.
fn window_of(net: &NetInner, dep: MilestoneId) -> (Option<SimTime>, Option<SimTime>) {
    let mut lo: Option<SimTime> = None;
    let mut hi: Option<SimTime> = None;
    for &rid in &net.milestones[dep as usize].rels {
        let rel = &net.rels[rid as usize];
        if rel.removed || !rel.enabled || rel.dep != dep {
            continue;
        }
        let Some((rlo, rhi)) = reaction_of(net, rid) else {
            continue;
        };
        lo = match (lo, rlo) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        hi = match (hi, rhi) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
    (lo, hi)
}

fn rel_satisfied(net: &NetInner, id: RelationshipId) -> bool {
    let rel = &net.rels[id as usize];
    if rel.removed || !rel.enabled {
        return true;
    }
    let dep_cell = &net.milestones[rel.dep as usize];
    if !dep_cell.active {
        return true;
    }
    match rel.kind {
        RelKind::Pin => Some(dep_cell.instant) == rel.pin_value,
        _ => {
            let ind_cell = &net.milestones[rel.ind as usize];
            if !ind_cell.active {
                return true;
            }
            match rel.kind {
                RelKind::Lte => dep_cell.instant <= ind_cell.instant,
                RelKind::Gte => dep_cell.instant >= ind_cell.instant,
                RelKind::Strut => dep_cell.instant == ind_cell.instant + rel.offset,
                RelKind::Pin => unreachable!(),
            }
        }
    }
}

fn propagate(
    net: &mut NetInner,
    root: MilestoneId,
    t: SimTime,
) -> SimResult<Vec<MilestoneChange>> {
    // First-touch snapshot, in touch order, for rollback and events.
    let mut touched: Vec<(MilestoneId, SimTime)> = Vec::new();
    let mut touched_at: HashMap<MilestoneId, usize> = HashMap::new();

    fn touch(
        net: &mut NetInner,
        touched: &mut Vec<(MilestoneId, SimTime)>,
        touched_at: &mut HashMap<MilestoneId, usize>,
        id: MilestoneId,
        value: SimTime,
    ) {
        if !touched_at.contains_key(&id) {
            touched_at.insert(id, touched.len());
            touched.push((id, net.milestones[id as usize].instant));
        }
        net.milestones[id as usize].instant = value;
    }

    touch(net, &mut touched, &mut touched_at, root, t);

    let mut queue: VecDeque<(MilestoneId, Option<RelationshipId>)> = VecDeque::new();
    queue.push_back((root, None));

    // Oscillation guard: an unsatisfiable strut cycle never reaches a
    // fixed point, so bound the worklist.
    let cap = 64 + 16 * (net.rels.len() + 1) * (net.milestones.len() + 1);
    let mut steps = 0usize;
    let mut last_driver: Option<RelationshipId> = None;

    while let Some((cur, via)) = queue.pop_front() {
        steps += 1;
        if steps > cap {
            let blamed = last_driver.or(via).unwrap_or(0);
            rollback(net, &touched);
            return Err(SimError::MilestoneWindow {
                relationship: blamed,
            });
        }
        // The reciprocal of the relationship we arrived through is
        // suppressed: the dual never drives back at its driver.
        let skip = via.and_then(|r| net.rels[r as usize].reciprocal);
        let rel_ids = net.milestones[cur as usize].rels.clone();
        for rid in rel_ids {
            let dep = {
                let rel = &net.rels[rid as usize];
                if rel.removed
                    || !rel.enabled
                    || rel.kind == RelKind::Pin
                    || rel.ind != cur
                    || rel.dep == cur
                    || Some(rid) == skip
                {
                    continue;
                }
                rel.dep
            };
            if !net.milestones[dep as usize].active {
                continue;
            }
            last_driver = Some(rid);
            let (mut lo, mut hi) = window_of(net, dep);
            if let (Some(l), Some(h)) = (lo, hi) {
                if l > h {
                    // A crossed intersection here only means some other
                    // neighbor still holds its pre-transaction instant.
                    // Follow the driver's fresh demand; the final
                    // verification pass decides real conflicts.
                    match reaction_of(net, rid) {
                        Some((rlo, rhi)) => {
                            lo = rlo;
                            hi = rhi;
                        }
                        None => continue,
                    }
                }
            }
            let current = net.milestones[dep as usize].instant;
            let mut target = current;
            if let Some(lo) = lo {
                if target < lo {
                    target = lo;
                }
            }
            if let Some(hi) = hi {
                if target > hi {
                    target = hi;
                }
            }
            if target != current {
                touch(net, &mut touched, &mut touched_at, dep, target);
                queue.push_back((dep, Some(rid)));
            }
        }
    }

    // Final verification across everything the transaction touched —
    // the root in particular was installed, not clamped.
    for &(mid, _) in &touched {
        for &rid in &net.milestones[mid as usize].rels.clone() {
            let rel = &net.rels[rid as usize];
            if rel.dep != mid {
                continue;
            }
            if !rel_satisfied(net, rid) {
                rollback(net, &touched);
                return Err(SimError::MilestoneWindow { relationship: rid });
            }
        }
    }

    let changes: Vec<MilestoneChange> = touched
        .iter()
        .filter(|(id, prev)| net.milestones[*id as usize].instant != *prev)
        .map(|&(id, prev)| MilestoneChange {
            milestone: id,
            previous: prev,
            current: net.milestones[id as usize].instant,
        })
        .collect();
    debug!(target: "sim_lite::milestone", root, moved = changes.len(), "reconciled");
    Ok(changes)
}

fn rollback(net: &mut NetInner, touched: &[(MilestoneId, SimTime)]) {
    for &(id, prev) in touched.iter().rev() {
        net.milestones[id as usize].instant = prev;
    }
}
