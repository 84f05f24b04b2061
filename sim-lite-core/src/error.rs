use crate::period::AdjustmentMode;
use crate::types::{ExecState, RelationshipId, SimTime};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use uuid::Uuid;

/// Kernel error taxonomy. Local failures are returned to the caller;
/// simulation-level failures are deposited on the model's [`ErrorLog`].
#[derive(Clone, Debug, Error)]
pub enum SimError {
    #[error("event requested at {requested} is earlier than the clock at {now}")]
    Causality { requested: SimTime, now: SimTime },

    #[error("executive is {state:?}: {operation} refused")]
    ExecutiveState {
        state: ExecState,
        operation: &'static str,
    },

    #[error("task callback failed: {reason}")]
    TaskExecution { reason: String },

    #[error("validity violation: {reason}")]
    Validity { reason: String },

    #[error("no admissible window satisfies relationship {relationship}")]
    MilestoneWindow { relationship: RelationshipId },

    #[error("milestone network is reconciling; structural change rejected")]
    NetworkBusy,

    #[error("assignment not permitted in adjustment mode {mode:?}")]
    TimePeriodAdjustment { mode: AdjustmentMode },

    #[error("resource request refused: {reason}")]
    ResourceRequest { reason: String },

    #[error("state machine: {reason}")]
    StateMachine { reason: String },

    #[error("structural error: {reason}")]
    Structural { reason: String },

    #[error("detachable event thread aborted")]
    FiberAborted,

    #[error("live detachable event threads exceed worker_threads cap of {limit}")]
    FiberLimit { limit: usize },
}

pub type SimResult<T> = Result<T, SimError>;

/// One recorded simulation-level failure. `target` names the model object
/// the failure attaches to (e.g. the task whose callback failed) so
/// sweeps can clear errors for removed objects.
#[derive(Clone, Debug)]
pub struct ModelError {
    pub error: SimError,
    pub target: Option<Uuid>,
    pub at: Option<SimTime>,
}

/// Shared append-only error collection. The executive and services hold
/// clones of one log; the model owns the canonical handle.
#[derive(Clone, Default)]
pub struct ErrorLog {
    entries: Rc<RefCell<Vec<ModelError>>>,
    hook: Rc<RefCell<Option<Rc<dyn Fn(&ModelError)>>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, error: SimError, target: Option<Uuid>, at: Option<SimTime>) {
        let entry = ModelError { error, target, at };
        tracing::debug!(target: "sim_lite::errors", error = %entry.error, "error recorded");
        let hook = self.hook.borrow().clone();
        self.entries.borrow_mut().push(entry.clone());
        // Hook runs with no borrow held; it may stop the executive or post again.
        if let Some(hook) = hook {
            hook(&entry);
        }
    }

    /// Installs the abort-policy hook, invoked after each deposit.
    pub fn set_hook(&self, hook: Rc<dyn Fn(&ModelError)>) {
        *self.hook.borrow_mut() = Some(hook);
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ModelError> {
        self.entries.borrow().clone()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// Drops every entry whose target is `guid`. Used by the task
    /// management sweep after a task is removed from its graph.
    pub fn clear_for_target(&self, guid: Uuid) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|e| e.target != Some(guid));
        before - entries.len()
    }
}

impl std::fmt::Debug for ErrorLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorLog")
            .field("entries", &self.entries.borrow().len())
            .finish()
    }
}
