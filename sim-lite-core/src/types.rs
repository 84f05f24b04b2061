use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ─── Scalar aliases ───────────────────────────────────────────

/// Virtual simulation instant. The executive's clock only ever moves
/// forward through values of this type.
pub type SimTime = DateTime<Utc>;

/// Signed span between two simulation instants.
pub type SimDuration = chrono::Duration;

/// Event queue key, monotonically assigned. Used for rescinding.
pub type EventKey = u64;

/// Detachable event thread identifier.
pub type FiberId = u64;

/// Milestone arena index.
pub type MilestoneId = u32;

/// Relationship arena index.
pub type RelationshipId = u32;

/// Task-graph vertex arena index.
pub type VertexId = u32;

/// Task-graph edge arena index.
pub type EdgeId = u32;

/// Synchronizer (rendezvous) identifier.
pub type SyncId = u32;

/// Resource arena index within one manager.
pub type ResourceId = u32;

/// Listener registration handle — unsubscribes by identity.
pub type ListenerId = u64;

// ─── Executive state ──────────────────────────────────────────

/// Lifecycle state of the executive's run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecState {
    Stopped,
    Running,
    Paused,
    Finished,
}

impl ExecState {
    /// Returns true once the executive can no longer dispatch.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecState::Finished)
    }
}

// ─── Event service modes ──────────────────────────────────────

/// How an event's callback is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceMode {
    /// Plain callback on the executive's thread.
    Synchronous,
    /// Callback runs as a suspendable event thread (green task).
    Detachable,
    /// Identical queued events with the same callback and payload are
    /// drained and delivered as a single logical firing.
    Batched,
    /// Detachable delivery that drains co-scheduled subscribers as one batch.
    AsynchronousActor,
}

// ─── Model state ──────────────────────────────────────────────

/// Lifecycle state of a composed model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelState {
    Init,
    Running,
    Paused,
    Stopped,
    Finished,
}

impl ModelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelState::Finished)
    }
}

// ─── Time helpers ─────────────────────────────────────────────

/// Simulation epoch used by default-constructed clocks. An arbitrary
/// fixed origin keeps virtual timestamps stable across runs.
pub fn sim_epoch() -> SimTime {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

/// Shorthand for `sim_epoch() + minutes`, the granularity most scenario
/// tests speak in.
pub fn epoch_plus_minutes(minutes: i64) -> SimTime {
    sim_epoch() + SimDuration::minutes(minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_offsets_are_stable() {
        assert_eq!(
            epoch_plus_minutes(90) - sim_epoch(),
            SimDuration::minutes(90)
        );
    }

    #[test]
    fn exec_state_terminality() {
        assert!(ExecState::Finished.is_terminal());
        assert!(!ExecState::Paused.is_terminal());
        assert!(!ExecState::Running.is_terminal());
    }
}
