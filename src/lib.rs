//! agent-trace - runtime instrumentation for agent/environment systems
//!
//! Wrap computations with a [`Tracer`], track values from inside them and
//! read back partitioned [`SystemTrace`]s from the [`EventStore`].

pub mod capture;
pub mod collector;
pub mod context;
pub mod error;
pub mod identity;
pub mod model;
pub mod scope;
pub mod store;
pub mod tracer;

pub use capture::{CapturedValue, TracedArgs};
pub use collector::{track_message, track_state, IoRole, StateCollector};
pub use context::{ContextBackend, EventHandle, ExecutionContext};
pub use error::{FixSuggestion, TraceError};
pub use identity::{SystemIdentity, TracedSystem};
pub use model::{
    traces_to_value, ComputeStep, Event, EventPartitionElement, Message, Origin, SystemTrace,
};
pub use scope::{flush_active_events, EventScope};
pub use store::EventStore;
pub use tracer::{ManageEvent, Tracer, TracerConfig};
