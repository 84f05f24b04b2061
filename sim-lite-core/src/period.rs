use crate::error::{SimError, SimResult};
use crate::milestone::MilestoneNetwork;
use crate::types::{ListenerId, MilestoneId, RelationshipId, SimDuration, SimTime};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// Governs which of start/duration/end a setter may move, and what the
/// other two do in response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentMode {
    None,
    FixedStart,
    FixedDuration,
    FixedEnd,
    InferStart,
    InferDuration,
    InferEnd,
    Locked,
}

struct PeriodState {
    name: String,
    mode: AdjustmentMode,
    mode_stack: Vec<AdjustmentMode>,
    /// Relationships installed on behalf of the current mode.
    rels: Vec<RelationshipId>,
    duration: SimDuration,
    has_duration: bool,
}

/// A (start, duration, end) triad backed by two milestones and an
/// adjustment-mode policy. Modes that couple start and end express the
/// coupling as relationships in the underlying network, so moves arriving
/// from other constraints honor it too.
#[derive(Clone)]
pub struct TimePeriod {
    net: MilestoneNetwork,
    start: MilestoneId,
    end: MilestoneId,
    state: Rc<RefCell<PeriodState>>,
}

impl TimePeriod {
    pub fn new(
        net: &MilestoneNetwork,
        name: &str,
        start: SimTime,
        end: SimTime,
        mode: AdjustmentMode,
    ) -> SimResult<Self> {
        let start_ms = net.create_milestone(&format!("{name}.start"), start);
        let end_ms = net.create_milestone(&format!("{name}.end"), end);
        let period = Self {
            net: net.clone(),
            start: start_ms,
            end: end_ms,
            state: Rc::new(RefCell::new(PeriodState {
                name: name.to_string(),
                mode: AdjustmentMode::None,
                mode_stack: Vec::new(),
                rels: Vec::new(),
                duration: end - start,
                has_duration: true,
            })),
        };
        period.switch_mode(mode)?;
        Ok(period)
    }

    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    pub fn adjustment_mode(&self) -> AdjustmentMode {
        self.state.borrow().mode
    }

    pub fn start_milestone(&self) -> MilestoneId {
        self.start
    }

    pub fn end_milestone(&self) -> MilestoneId {
        self.end
    }

    /// Identity comparison for membership checks.
    pub fn same_period(&self, other: &TimePeriod) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    // ── Getters ──

    pub fn has_start(&self) -> bool {
        self.net.is_active(self.start)
    }

    pub fn has_end(&self) -> bool {
        self.net.is_active(self.end)
    }

    pub fn start(&self) -> Option<SimTime> {
        self.has_start().then(|| self.net.instant(self.start))
    }

    pub fn end(&self) -> Option<SimTime> {
        self.has_end().then(|| self.net.instant(self.end))
    }

    pub fn duration(&self) -> Option<SimDuration> {
        if self.has_start() && self.has_end() {
            Some(self.net.instant(self.end) - self.net.instant(self.start))
        } else if self.state.borrow().has_duration {
            Some(self.state.borrow().duration)
        } else {
            None
        }
    }

    pub fn contains(&self, t: SimTime) -> bool {
        match (self.start(), self.end()) {
            (Some(s), Some(e)) => s <= t && t <= e,
            _ => false,
        }
    }

    pub fn overlaps(&self, other: &TimePeriod) -> bool {
        match (self.start(), self.end(), other.start(), other.end()) {
            (Some(s1), Some(e1), Some(s2), Some(e2)) => s1 <= e2 && s2 <= e1,
            _ => false,
        }
    }

    // ── Setters (mode-governed) ──

    pub fn set_start(&self, t: SimTime) -> SimResult<()> {
        let mode = self.adjustment_mode();
        match mode {
            AdjustmentMode::InferStart | AdjustmentMode::Locked => {
                Err(SimError::TimePeriodAdjustment { mode })
            }
            AdjustmentMode::FixedStart => {
                // Start anchors the triad: moving it translates the period.
                let d = self.stored_duration();
                self.net.move_to(self.start, t)?;
                self.net.move_to(self.end, t + d)?;
                Ok(())
            }
            AdjustmentMode::FixedDuration | AdjustmentMode::InferEnd => {
                // The installed strut drags the end along.
                self.net.move_to(self.start, t)?;
                Ok(())
            }
            AdjustmentMode::None
            | AdjustmentMode::FixedEnd
            | AdjustmentMode::InferDuration => {
                self.net.move_to(self.start, t)?;
                self.recompute_duration();
                Ok(())
            }
        }
    }

    pub fn set_end(&self, t: SimTime) -> SimResult<()> {
        let mode = self.adjustment_mode();
        match mode {
            AdjustmentMode::InferEnd | AdjustmentMode::Locked => {
                Err(SimError::TimePeriodAdjustment { mode })
            }
            AdjustmentMode::FixedEnd => {
                let d = self.stored_duration();
                self.net.move_to(self.end, t)?;
                self.net.move_to(self.start, t - d)?;
                Ok(())
            }
            AdjustmentMode::FixedDuration | AdjustmentMode::InferStart => {
                self.net.move_to(self.end, t)?;
                Ok(())
            }
            AdjustmentMode::None
            | AdjustmentMode::FixedStart
            | AdjustmentMode::InferDuration => {
                self.net.move_to(self.end, t)?;
                self.recompute_duration();
                Ok(())
            }
        }
    }

    pub fn set_duration(&self, d: SimDuration) -> SimResult<()> {
        let mode = self.adjustment_mode();
        match mode {
            AdjustmentMode::FixedDuration
            | AdjustmentMode::InferDuration
            | AdjustmentMode::Locked => Err(SimError::TimePeriodAdjustment { mode }),
            AdjustmentMode::None => {
                let mut state = self.state.borrow_mut();
                state.duration = d;
                state.has_duration = true;
                Ok(())
            }
            AdjustmentMode::FixedStart => {
                let s = self.net.instant(self.start);
                self.net.move_to(self.end, s + d)?;
                self.store_duration(d);
                Ok(())
            }
            AdjustmentMode::FixedEnd => {
                let e = self.net.instant(self.end);
                self.net.move_to(self.start, e - d)?;
                self.store_duration(d);
                Ok(())
            }
            AdjustmentMode::InferStart => {
                self.uninstall_rels();
                let e = self.net.instant(self.end);
                let moved = self.net.move_to(self.start, e - d);
                self.store_duration(d);
                self.install_rels(AdjustmentMode::InferStart)?;
                moved?;
                Ok(())
            }
            AdjustmentMode::InferEnd => {
                self.uninstall_rels();
                let s = self.net.instant(self.start);
                let moved = self.net.move_to(self.end, s + d);
                self.store_duration(d);
                self.install_rels(AdjustmentMode::InferEnd)?;
                moved?;
                Ok(())
            }
        }
    }

    // ── Clearing ──

    /// Deactivates the start milestone, making it indeterminate.
    pub fn clear_start(&self) {
        self.net.set_active(self.start, false);
    }

    pub fn clear_end(&self) {
        self.net.set_active(self.end, false);
    }

    pub fn clear_duration(&self) {
        self.state.borrow_mut().has_duration = false;
    }

    pub fn restore_start(&self) {
        self.net.set_active(self.start, true);
    }

    pub fn restore_end(&self) {
        self.net.set_active(self.end, true);
    }

    // ── Mode stack ──

    pub fn push_adjustment_mode(&self, mode: AdjustmentMode) -> SimResult<()> {
        let prior = self.adjustment_mode();
        self.state.borrow_mut().mode_stack.push(prior);
        self.switch_mode(mode)
    }

    pub fn pop_adjustment_mode(&self) -> SimResult<AdjustmentMode> {
        let prior = self.state.borrow_mut().mode_stack.pop();
        match prior {
            Some(mode) => {
                self.switch_mode(mode)?;
                Ok(mode)
            }
            None => Ok(self.adjustment_mode()),
        }
    }

    fn switch_mode(&self, mode: AdjustmentMode) -> SimResult<()> {
        self.uninstall_rels();
        self.install_rels(mode)?;
        self.state.borrow_mut().mode = mode;
        trace!(target: "sim_lite::period", period = %self.name(), ?mode, "adjustment mode set");
        Ok(())
    }

    fn install_rels(&self, mode: AdjustmentMode) -> SimResult<()> {
        let mut installed = Vec::new();
        match mode {
            AdjustmentMode::FixedDuration
            | AdjustmentMode::InferStart
            | AdjustmentMode::InferEnd => {
                let d = self.current_span();
                installed.push(self.net.add_strut(self.end, self.start, d)?);
            }
            AdjustmentMode::Locked => {
                installed.push(self.net.add_pin(self.start)?);
                installed.push(self.net.add_pin(self.end)?);
            }
            _ => {}
        }
        self.state.borrow_mut().rels = installed;
        Ok(())
    }

    fn uninstall_rels(&self) {
        let rels: Vec<RelationshipId> = self.state.borrow_mut().rels.drain(..).collect();
        for rel in rels {
            let _ = self.net.remove_relationship(rel);
        }
    }

    fn current_span(&self) -> SimDuration {
        if self.has_start() && self.has_end() {
            self.net.instant(self.end) - self.net.instant(self.start)
        } else {
            self.stored_duration()
        }
    }

    fn stored_duration(&self) -> SimDuration {
        self.state.borrow().duration
    }

    fn store_duration(&self, d: SimDuration) {
        let mut state = self.state.borrow_mut();
        state.duration = d;
        state.has_duration = true;
    }

    fn recompute_duration(&self) {
        if self.has_start() && self.has_end() {
            let d = self.net.instant(self.end) - self.net.instant(self.start);
            self.store_duration(d);
        }
    }
}

/// `a + b`: a fresh `None`-mode period spanning min-start to max-end.
impl std::ops::Add<&TimePeriod> for &TimePeriod {
    type Output = SimResult<TimePeriod>;

    fn add(self, other: &TimePeriod) -> SimResult<TimePeriod> {
        let starts = [self.start(), other.start()];
        let ends = [self.end(), other.end()];
        let start = starts.iter().flatten().min().copied().unwrap_or_else(|| {
            self.net.instant(self.start)
        });
        let end = ends.iter().flatten().max().copied().unwrap_or(start);
        let name = format!("{}+{}", self.name(), other.name());
        TimePeriod::new(&self.net, &name, start, end, AdjustmentMode::None)
    }
}

// ─── Envelope ─────────────────────────────────────────────────

struct EnvInner {
    children: Vec<TimePeriod>,
    subs: Vec<(MilestoneId, ListenerId)>,
}

/// Read-only aggregate period: start = min of child starts, end = max of
/// child ends, refreshed whenever any child milestone moves.
#[derive(Clone)]
pub struct TimePeriodEnvelope {
    net: MilestoneNetwork,
    start: MilestoneId,
    end: MilestoneId,
    inner: Rc<RefCell<EnvInner>>,
}

impl TimePeriodEnvelope {
    pub fn new(net: &MilestoneNetwork, name: &str) -> Self {
        let start = net.create_milestone(&format!("{name}.env.start"), crate::types::sim_epoch());
        let end = net.create_milestone(&format!("{name}.env.end"), crate::types::sim_epoch());
        net.set_active(start, false);
        net.set_active(end, false);
        Self {
            net: net.clone(),
            start,
            end,
            inner: Rc::new(RefCell::new(EnvInner {
                children: Vec::new(),
                subs: Vec::new(),
            })),
        }
    }

    pub fn start(&self) -> Option<SimTime> {
        self.net
            .is_active(self.start)
            .then(|| self.net.instant(self.start))
    }

    pub fn end(&self) -> Option<SimTime> {
        self.net
            .is_active(self.end)
            .then(|| self.net.instant(self.end))
    }

    pub fn child_count(&self) -> usize {
        self.inner.borrow().children.len()
    }

    pub fn add_period(&self, period: &TimePeriod) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.children.iter().any(|c| c.same_period(period)) {
                return;
            }
            inner.children.push(period.clone());
            for ms in [period.start_milestone(), period.end_milestone()] {
                let me = self.clone();
                let lid = self.net.observe(ms, move |_| me.refresh());
                inner.subs.push((ms, lid));
            }
        }
        self.refresh();
    }

    pub fn remove_period(&self, period: &TimePeriod) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.children.retain(|c| !c.same_period(period));
            let doomed: Vec<(MilestoneId, ListenerId)> = inner
                .subs
                .iter()
                .filter(|(ms, _)| {
                    *ms == period.start_milestone() || *ms == period.end_milestone()
                })
                .copied()
                .collect();
            inner
                .subs
                .retain(|(ms, _)| *ms != period.start_milestone() && *ms != period.end_milestone());
            for (ms, lid) in doomed {
                self.net.unobserve(ms, lid);
            }
        }
        self.refresh();
    }

    /// Recomputes the bounds from the children. Called automatically on
    /// every child milestone change.
    fn refresh(&self) {
        let (min_start, max_end) = {
            let inner = self.inner.borrow();
            let min_start = inner.children.iter().filter_map(|c| c.start()).min();
            let max_end = inner.children.iter().filter_map(|c| c.end()).max();
            (min_start, max_end)
        };
        match min_start {
            Some(s) => {
                self.net.set_active(self.start, true);
                let _ = self.net.move_to(self.start, s);
            }
            None => self.net.set_active(self.start, false),
        }
        match max_end {
            Some(e) => {
                self.net.set_active(self.end, true);
                let _ = self.net.move_to(self.end, e);
            }
            None => self.net.set_active(self.end, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::epoch_plus_minutes as m;

    fn net() -> MilestoneNetwork {
        MilestoneNetwork::new()
    }

    #[test]
    fn fixed_duration_shifts_end_with_start() {
        let net = net();
        // 10:00 → 11:00
        let p = TimePeriod::new(&net, "p", m(600), m(660), AdjustmentMode::FixedDuration).unwrap();
        p.set_start(m(615)).unwrap(); // 10:15
        assert_eq!(p.start(), Some(m(615)));
        assert_eq!(p.end(), Some(m(675))); // 11:15
        assert_eq!(p.duration(), Some(SimDuration::minutes(60)));
    }

    #[test]
    fn fixed_duration_rejects_duration_writes() {
        let net = net();
        let p = TimePeriod::new(&net, "p", m(0), m(60), AdjustmentMode::FixedDuration).unwrap();
        let err = p.set_duration(SimDuration::minutes(10)).unwrap_err();
        assert!(matches!(
            err,
            SimError::TimePeriodAdjustment {
                mode: AdjustmentMode::FixedDuration
            }
        ));
    }

    #[test]
    fn fixed_start_anchors_and_translates() {
        let net = net();
        let p = TimePeriod::new(&net, "p", m(100), m(160), AdjustmentMode::FixedStart).unwrap();
        // Setting the start translates the whole period.
        p.set_start(m(200)).unwrap();
        assert_eq!(p.end(), Some(m(260)));
        // Setting the end leaves the start and recomputes the duration.
        p.set_end(m(230)).unwrap();
        assert_eq!(p.start(), Some(m(200)));
        assert_eq!(p.duration(), Some(SimDuration::minutes(30)));
        // Setting the duration moves the end.
        p.set_duration(SimDuration::minutes(45)).unwrap();
        assert_eq!(p.end(), Some(m(245)));
    }

    #[test]
    fn fixed_end_moves_start() {
        let net = net();
        let p = TimePeriod::new(&net, "p", m(100), m(160), AdjustmentMode::FixedEnd).unwrap();
        p.set_duration(SimDuration::minutes(20)).unwrap();
        assert_eq!(p.start(), Some(m(140)));
        assert_eq!(p.end(), Some(m(160)));
        p.set_end(m(200)).unwrap();
        assert_eq!(p.start(), Some(m(180)), "duration preserved when end moves");
    }

    #[test]
    fn infer_start_follows_end() {
        let net = net();
        let p = TimePeriod::new(&net, "p", m(100), m(160), AdjustmentMode::InferStart).unwrap();
        assert!(matches!(
            p.set_start(m(0)),
            Err(SimError::TimePeriodAdjustment { .. })
        ));
        p.set_end(m(220)).unwrap();
        assert_eq!(p.start(), Some(m(160)), "start = end - duration");
        p.set_duration(SimDuration::minutes(10)).unwrap();
        assert_eq!(p.start(), Some(m(210)));
        assert_eq!(p.end(), Some(m(220)));
    }

    #[test]
    fn infer_end_follows_start() {
        let net = net();
        let p = TimePeriod::new(&net, "p", m(0), m(30), AdjustmentMode::InferEnd).unwrap();
        assert!(matches!(
            p.set_end(m(99)),
            Err(SimError::TimePeriodAdjustment { .. })
        ));
        p.set_start(m(10)).unwrap();
        assert_eq!(p.end(), Some(m(40)));
        p.set_duration(SimDuration::minutes(5)).unwrap();
        assert_eq!(p.end(), Some(m(15)));
    }

    #[test]
    fn locked_rejects_everything() {
        let net = net();
        let p = TimePeriod::new(&net, "p", m(0), m(30), AdjustmentMode::Locked).unwrap();
        assert!(p.set_start(m(1)).is_err());
        assert!(p.set_end(m(1)).is_err());
        assert!(p.set_duration(SimDuration::minutes(1)).is_err());
        // The pins also shield the milestones from network-driven moves.
        assert!(net.move_to(p.start_milestone(), m(5)).is_err());
        assert_eq!(p.start(), Some(m(0)));
    }

    #[test]
    fn push_pop_mode_round_trips() {
        let net = net();
        let p = TimePeriod::new(&net, "p", m(0), m(60), AdjustmentMode::FixedDuration).unwrap();
        p.push_adjustment_mode(AdjustmentMode::None).unwrap();
        assert_eq!(p.adjustment_mode(), AdjustmentMode::None);
        p.set_duration(SimDuration::minutes(5)).unwrap();
        p.pop_adjustment_mode().unwrap();
        assert_eq!(p.adjustment_mode(), AdjustmentMode::FixedDuration);
        // Back in FixedDuration: start moves drag the end again.
        p.set_start(m(10)).unwrap();
        assert_eq!(p.end(), Some(m(70)));
    }

    #[test]
    fn clear_makes_fields_indeterminate() {
        let net = net();
        let p = TimePeriod::new(&net, "p", m(0), m(60), AdjustmentMode::None).unwrap();
        p.clear_start();
        assert_eq!(p.start(), None);
        assert_eq!(p.duration(), Some(SimDuration::minutes(60)), "stored duration survives");
        p.clear_duration();
        assert_eq!(p.duration(), None);
        p.restore_start();
        assert_eq!(p.start(), Some(m(0)));
    }

    #[test]
    fn envelope_tracks_min_start_and_max_end() {
        let net = net();
        let p1 = TimePeriod::new(&net, "p1", m(10), m(40), AdjustmentMode::FixedDuration).unwrap();
        let p2 = TimePeriod::new(&net, "p2", m(20), m(90), AdjustmentMode::FixedDuration).unwrap();
        let env = TimePeriodEnvelope::new(&net, "env");
        assert_eq!(env.start(), None);

        env.add_period(&p1);
        env.add_period(&p2);
        assert_eq!(env.start(), Some(m(10)));
        assert_eq!(env.end(), Some(m(90)));

        // Moving a child updates the envelope automatically.
        p1.set_start(m(5)).unwrap();
        assert_eq!(env.start(), Some(m(5)));
        assert_eq!(env.end(), Some(m(90)));
        p2.set_start(m(70)).unwrap(); // drags p2.end to 140
        assert_eq!(env.end(), Some(m(140)));

        env.remove_period(&p1);
        assert_eq!(env.start(), Some(m(70)));
    }

    #[test]
    fn period_addition_yields_spanning_none_mode_period() {
        let net = net();
        let p1 = TimePeriod::new(&net, "p1", m(10), m(40), AdjustmentMode::None).unwrap();
        let p2 = TimePeriod::new(&net, "p2", m(30), m(80), AdjustmentMode::None).unwrap();
        let sum = (&p1 + &p2).unwrap();
        assert_eq!(sum.adjustment_mode(), AdjustmentMode::None);
        assert_eq!(sum.start(), Some(m(10)));
        assert_eq!(sum.end(), Some(m(80)));
        assert_eq!(sum.duration(), Some(SimDuration::minutes(70)));
    }
}
