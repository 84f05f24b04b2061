//! sim-lite-core — a discrete-event simulation kernel.
//!
//! The executive owns a virtual clock and a priority-ordered event
//! queue; everything else is built on top of it: detachable event
//! threads (green tasks that suspend in virtual time), a task graph with
//! validity propagation, a milestone constraint network with reactive
//! reconciliation, a resource arbitration layer, and a port/connector
//! item-flow overlay. A [`Model`](model::Model) composes the pieces into
//! a runnable unit.
//!
//! Strictly single-threaded and cooperative: one callback or coroutine
//! is ever on the stack, time advances only at dispatch, and suspension
//! points are explicit.

pub mod config;
pub mod error;
pub mod executive;
pub mod fiber;
pub mod graph;
pub mod milestone;
pub mod model;
pub mod observe;
pub mod period;
pub mod port;
pub mod resource;
pub mod state;
pub mod types;
pub mod validity;

pub use config::{DiagnosticsConfig, ExecutiveKind, SimConfig};
pub use error::{ErrorLog, ModelError, SimError, SimResult};
pub use executive::{EventData, EventInfo, Executive, SyncCallback};
pub use fiber::EventController;
pub use graph::{
    CompletionSignaler, DurationStats, EdgeActivation, EdgeCallback, EdgeEvent, EdgeKind,
    EdgePhase, GraphContext, TaskGraph, TaskRunner, VertexRole,
};
pub use milestone::{MilestoneChange, MilestoneNetwork, RelKind};
pub use model::{Model, ModelObject, TaskProcessor};
pub use observe::{ExecutiveEvent, Listeners, ModelEvent, TraceLog, TraceRecord};
pub use period::{AdjustmentMode, TimePeriod, TimePeriodEnvelope};
pub use port::{
    BufferPersistence, Connector, InputPort, InputPortManager, OutputPort, OutputPortManager,
    PortChannel, PortEvent, PortItem, PortMeta, PortRef, PortSelector, PortSet, PortSetEvent,
    WriteAction,
};
pub use resource::{
    DischargePolicy, MultiRequestProcessor, ResourceEvent, ResourceManager, ResourceRequest,
    ResourceView, ScoreFn,
};
pub use state::{StateMachine, TransitionResult};
pub use types::{
    EdgeId, EventKey, ExecState, FiberId, ListenerId, MilestoneId, ModelState, RelationshipId,
    ResourceId, ServiceMode, SimDuration, SimTime, SyncId, VertexId,
};
pub use validity::{StructureChange, ValidityChange, ValidityService};
