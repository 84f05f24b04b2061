use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;
use tracing::{debug, warn};

/// Outcome of a requested transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionResult {
    Success,
    /// One reason per vetoing or failing handler.
    Failure(Vec<String>),
    /// The (from, to) pair was never declared.
    NotPermitted,
}

impl TransitionResult {
    pub fn succeeded(&self) -> bool {
        matches!(self, TransitionResult::Success)
    }
}

/// A handler in one of the three chains. `inlinable` declares whether it
/// may run while another transition is already in progress.
struct Handler<S> {
    f: Rc<dyn Fn(S, S) -> Result<(), String>>,
    inlinable: bool,
}

struct Chains<S> {
    tests: Vec<Handler<S>>,
    prepares: Vec<Handler<S>>,
    commits: Vec<Handler<S>>,
}

impl<S> Chains<S> {
    fn new() -> Self {
        Self {
            tests: Vec::new(),
            prepares: Vec::new(),
            commits: Vec::new(),
        }
    }
}

/// An enumerated state space with declared transitions. Each transition
/// runs its test chain first (any veto cancels the transition and the
/// machine stays in the source state), then prepare and commit chains in
/// registration order. A committed state may carry a follow-on
/// transition, taken immediately after entry.
pub struct StateMachine<S: Copy + Eq + Hash + Debug> {
    current: S,
    transitions: HashMap<(S, S), Chains<S>>,
    followups: HashMap<S, S>,
    in_progress: bool,
}

impl<S: Copy + Eq + Hash + Debug> StateMachine<S> {
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            transitions: HashMap::new(),
            followups: HashMap::new(),
            in_progress: false,
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Declares `from → to` as permitted (with empty handler chains).
    pub fn declare(&mut self, from: S, to: S) -> &mut Self {
        self.transitions.entry((from, to)).or_insert_with(Chains::new);
        self
    }

    pub fn is_declared(&self, from: S, to: S) -> bool {
        self.transitions.contains_key(&(from, to))
    }

    pub fn add_test<F>(&mut self, from: S, to: S, inlinable: bool, f: F) -> &mut Self
    where
        F: Fn(S, S) -> Result<(), String> + 'static,
    {
        self.chains(from, to).tests.push(Handler {
            f: Rc::new(f),
            inlinable,
        });
        self
    }

    pub fn add_prepare<F>(&mut self, from: S, to: S, inlinable: bool, f: F) -> &mut Self
    where
        F: Fn(S, S) -> Result<(), String> + 'static,
    {
        self.chains(from, to).prepares.push(Handler {
            f: Rc::new(f),
            inlinable,
        });
        self
    }

    pub fn add_commit<F>(&mut self, from: S, to: S, inlinable: bool, f: F) -> &mut Self
    where
        F: Fn(S, S) -> Result<(), String> + 'static,
    {
        self.chains(from, to).commits.push(Handler {
            f: Rc::new(f),
            inlinable,
        });
        self
    }

    /// Entering `state` immediately requests the transition to `next`.
    pub fn set_followup(&mut self, state: S, next: S) -> &mut Self {
        self.followups.insert(state, next);
        self
    }

    fn chains(&mut self, from: S, to: S) -> &mut Chains<S> {
        self.transitions.entry((from, to)).or_insert_with(Chains::new)
    }

    /// Attempts `current → to`, running the handler chains. Follow-on
    /// transitions registered for entered states are drained afterwards;
    /// a failing follow-on leaves the machine in the intermediate state
    /// and reports the failure.
    pub fn do_transition(&mut self, to: S) -> TransitionResult {
        let mut pending = VecDeque::new();
        pending.push_back(to);
        let mut last = TransitionResult::Success;
        while let Some(next) = pending.pop_front() {
            last = self.transition_once(next);
            if !last.succeeded() {
                return last;
            }
            if let Some(&follow) = self.followups.get(&self.current) {
                pending.push_back(follow);
            }
        }
        last
    }

    fn transition_once(&mut self, to: S) -> TransitionResult {
        let from = self.current;
        let Some(chains) = self.transitions.get(&(from, to)) else {
            warn!(target: "sim_lite::state", ?from, ?to, "transition not permitted");
            return TransitionResult::NotPermitted;
        };

        let inlined = self.in_progress;
        // Snapshot handler Rcs so handlers may mutate the machine's
        // subscriptions re-entrantly (they must not transition it).
        let collect = |hs: &[Handler<S>]| -> Result<Vec<Rc<dyn Fn(S, S) -> Result<(), String>>>, Vec<String>> {
            let mut out = Vec::with_capacity(hs.len());
            let mut refusals = Vec::new();
            for h in hs {
                if inlined && !h.inlinable {
                    refusals.push(format!(
                        "handler for {:?}->{:?} is not inlinable during an in-progress transition",
                        from, to
                    ));
                } else {
                    out.push(h.f.clone());
                }
            }
            if refusals.is_empty() {
                Ok(out)
            } else {
                Err(refusals)
            }
        };

        let tests = match collect(&chains.tests) {
            Ok(t) => t,
            Err(r) => return TransitionResult::Failure(r),
        };
        let prepares = match collect(&chains.prepares) {
            Ok(t) => t,
            Err(r) => return TransitionResult::Failure(r),
        };
        let commits = match collect(&chains.commits) {
            Ok(t) => t,
            Err(r) => return TransitionResult::Failure(r),
        };

        self.in_progress = true;
        let result = (|| {
            let mut vetoes = Vec::new();
            for test in &tests {
                if let Err(reason) = test(from, to) {
                    vetoes.push(reason);
                }
            }
            if !vetoes.is_empty() {
                return TransitionResult::Failure(vetoes);
            }
            for prepare in &prepares {
                if let Err(reason) = prepare(from, to) {
                    return TransitionResult::Failure(vec![reason]);
                }
            }
            self.current = to;
            for commit in &commits {
                if let Err(reason) = commit(from, to) {
                    return TransitionResult::Failure(vec![reason]);
                }
            }
            TransitionResult::Success
        })();
        self.in_progress = false;

        match &result {
            TransitionResult::Success => {
                debug!(target: "sim_lite::state", ?from, ?to, "transition committed")
            }
            TransitionResult::Failure(reasons) => {
                debug!(target: "sim_lite::state", ?from, ?to, ?reasons, "transition cancelled")
            }
            TransitionResult::NotPermitted => {}
        }
        result
    }
}
