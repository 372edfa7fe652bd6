//! # Instrumentation wrapper
//!
//! A [`Tracer`] wraps one kind of computation (an LM call, an environment
//! step) and turns each invocation into compute steps on an [`Event`].
//!
//! ## Call lifecycle
//!
//! 1. Resolve the identity tuple (configuration errors stop here, nothing mutated)
//! 2. Reset the domain's collector
//! 3. `manage_event = create`: open an event (optionally in a new partition)
//! 4. Record the declared arguments as inputs
//! 5. Run the computation (the only suspension point on the async path)
//! 6. Record the result as outputs (tuples element-wise)
//! 7. Drain the collector into one compute step per origin
//! 8. Attach the steps to the created or active event
//! 9. `manage_event = end`: close and deliver the active event of this type
//!
//! Teardown runs from a drop guard: an event opened in step 3 is closed and
//! delivered on every exit path, including cancellation of an async call.
//!
//! ## Backends
//!
//! | Entry point | Context |
//! |-------------|---------|
//! | [`Tracer::call`] | current domain (thread, or the enclosing task scope) |
//! | [`Tracer::call_async`] | new task scope forked from the caller |

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info};

use crate::capture::{capture_result, CapturedValue, TracedArgs};
use crate::collector::{IoRole, StateCollector, TrackedRecord};
use crate::context::{self, EventHandle, ExecutionContext};
use crate::error::TraceError;
use crate::identity::{SystemIdentity, TracedSystem};
use crate::model::{
    now_secs, ArbitraryInput, ArbitraryOutput, ComputeInput, ComputeOutput, ComputeStep, Event,
    MessageInput, MessageOutput, Origin,
};
use crate::store::EventStore;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// What a traced call does with events of its `event_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManageEvent {
    /// Attach to whatever event of this type is active
    #[default]
    None,
    /// Open a new event for the duration of the call
    Create,
    /// Close and deliver the active event of this type
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub origin: Origin,
    pub event_type: String,
    pub manage_event: ManageEvent,
    pub increment_partition: bool,
    /// Default finetune flag, OR-ed with the flag of each tracked message
    pub finetune_step: bool,
    pub log_result: bool,
    /// Computation name used in logs (defaults to `event_type`)
    pub name: Option<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            origin: Origin::Agent,
            event_type: String::new(),
            manage_event: ManageEvent::None,
            increment_partition: false,
            finetune_step: true,
            log_result: false,
            name: None,
        }
    }
}

impl TracerConfig {
    pub fn new(origin: Origin, event_type: impl Into<String>) -> Self {
        Self {
            origin,
            event_type: event_type.into(),
            ..Self::default()
        }
    }

    /// Load a config from YAML
    ///
    /// ```yaml
    /// origin: agent
    /// event_type: lm_call
    /// manage_event: create
    /// increment_partition: true
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self, TraceError> {
        let config: TracerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TraceError> {
        if self.event_type.trim().is_empty() {
            return Err(TraceError::InvalidConfig {
                details: "event_type must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// TRACER
// ============================================================================

/// Configured wrapper for one kind of traced computation
#[derive(Debug, Clone)]
pub struct Tracer {
    config: TracerConfig,
    store: Arc<EventStore>,
}

impl Tracer {
    pub fn new(origin: Origin, event_type: impl Into<String>) -> Self {
        Self::from_config(TracerConfig::new(origin, event_type))
    }

    pub fn from_config(config: TracerConfig) -> Self {
        Self {
            config,
            store: EventStore::global(),
        }
    }

    pub fn manage_event(mut self, manage_event: ManageEvent) -> Self {
        self.config.manage_event = manage_event;
        self
    }

    pub fn increment_partition(mut self, increment: bool) -> Self {
        self.config.increment_partition = increment;
        self
    }

    pub fn finetune_step(mut self, finetune: bool) -> Self {
        self.config.finetune_step = finetune;
        self
    }

    pub fn log_result(mut self, log_result: bool) -> Self {
        self.config.log_result = log_result;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn with_store(mut self, store: Arc<EventStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    fn computation(&self) -> &str {
        self.config.name.as_deref().unwrap_or(&self.config.event_type)
    }

    /// Step 1: nothing is mutated before this succeeds
    fn resolve<S: TracedSystem + ?Sized>(
        &self,
        system: &S,
        args: &TracedArgs,
    ) -> Result<SystemIdentity, TraceError> {
        let identity = SystemIdentity::resolve(system)?;
        args.validate()?;
        Ok(identity)
    }

    /// Trace a synchronous computation
    pub fn call<S, R, E, F>(&self, system: &S, args: TracedArgs, f: F) -> Result<R, E>
    where
        S: TracedSystem + ?Sized,
        R: Serialize,
        E: From<TraceError> + Display,
        F: FnOnce() -> Result<R, E>,
    {
        let identity = self.resolve(system, &args)?;
        let guard = self.begin(ExecutionContext::current(), identity, args);
        let outcome = f();
        self.finish(guard, outcome)
    }

    /// Trace an asynchronous computation in its own task scope
    ///
    /// The identity is resolved eagerly; the returned future borrows neither
    /// the tracer nor the system, so it can be spawned.
    pub fn call_async<S, R, E, F, Fut>(
        &self,
        system: &S,
        args: TracedArgs,
        f: F,
    ) -> impl Future<Output = Result<R, E>>
    where
        S: TracedSystem + ?Sized,
        R: Serialize,
        E: From<TraceError> + Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let resolved = self.resolve(system, &args);
        let tracer = self.clone();
        async move {
            let identity = match resolved {
                Ok(identity) => identity,
                Err(err) => return Err(E::from(err)),
            };
            context::inherit(async move {
                let guard = tracer.begin(ExecutionContext::task_scoped(), identity, args);
                let outcome = f().await;
                tracer.finish(guard, outcome)
            })
            .await
        }
    }

    /// Steps 2-4
    fn begin(
        &self,
        ctx: ExecutionContext,
        identity: SystemIdentity,
        args: TracedArgs,
    ) -> CallGuard {
        let parent_identity = ctx.replace_identity(Some(identity.clone()));
        let parent_collector = ctx.replace_collector(StateCollector::new());
        let compute_began = now_secs();

        let created = (self.config.manage_event == ManageEvent::Create).then(|| {
            let partition_index = if self.config.increment_partition {
                let index = self.store.increment_partition(
                    &identity.system_name,
                    &identity.system_id,
                    &identity.system_instance_id,
                );
                debug!(partition_index = index, "incremented partition");
                index
            } else {
                0
            };
            let event = Event::opened_at(
                self.config.event_type.as_str(),
                compute_began,
                partition_index,
            );
            let handle = EventHandle::new(event, Some(identity.clone()));
            ctx.set_current_event(handle.clone());
            debug!(
                event_type = %self.config.event_type,
                system_instance_id = %identity.system_instance_id,
                partition_index,
                "created event"
            );
            handle
        });

        let origin = self.config.origin;
        ctx.with_collector(|collector| {
            for (name, value) in args.into_entries() {
                collector.track_captured(name, value, origin, IoRole::Input, None);
            }
        });

        CallGuard {
            ctx,
            store: Arc::clone(&self.store),
            identity,
            created,
            compute_began,
            parent_identity,
            parent_collector,
        }
    }

    /// Steps 6-9
    fn finish<R, E>(&self, guard: CallGuard, outcome: Result<R, E>) -> Result<R, E>
    where
        R: Serialize,
        E: Display,
    {
        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                error!(
                    computation = %self.computation(),
                    event_type = %self.config.event_type,
                    error = %err,
                    "exception in traced computation"
                );
                return Err(err);
            }
        };

        let ctx = guard.ctx;
        let origin = self.config.origin;
        ctx.with_collector(|collector| {
            for (name, value) in capture_result(&result) {
                collector.track_captured(name, value, origin, IoRole::Output, None);
            }
        });

        let (inputs, outputs) = ctx
            .with_collector(StateCollector::get_traced_data)
            .unwrap_or_default();
        let compute_ended = now_secs();
        let steps = self.build_steps(inputs, outputs, guard.compute_began, compute_ended);

        let target = guard
            .created
            .clone()
            .or_else(|| ctx.get_active_event(&self.config.event_type));
        match target {
            Some(handle) => {
                for step in steps {
                    handle.attach_step(step);
                }
            }
            None if !steps.is_empty() => {
                debug!(
                    event_type = %self.config.event_type,
                    "no open event; compute steps discarded"
                );
            }
            None => {}
        }

        if self.config.log_result {
            match CapturedValue::capture(&result) {
                CapturedValue::Json(value) => {
                    info!(computation = %self.computation(), result = %value, "function result")
                }
                CapturedValue::Unserializable { reason } => {
                    info!(
                        computation = %self.computation(),
                        %reason,
                        "function result not representable"
                    )
                }
            }
        }

        if self.config.manage_event == ManageEvent::End {
            if let Some(handle) = ctx.get_active_event(&self.config.event_type) {
                ctx.clear_current_event(&self.config.event_type);
                if let Some(event) = handle.close(compute_ended) {
                    let owner = handle.owner().unwrap_or(&guard.identity);
                    deliver_event(&guard.store, owner, event);
                }
            }
        }

        Ok(result)
    }

    /// Step 7: one compute step per origin that produced anything
    fn build_steps(
        &self,
        inputs: Vec<TrackedRecord>,
        outputs: Vec<TrackedRecord>,
        compute_began: f64,
        compute_ended: f64,
    ) -> Vec<ComputeStep> {
        let mut buckets: [OriginBucket; 2] = Default::default();
        let slot = |origin: Origin| match origin {
            Origin::Agent => 0,
            Origin::Environment => 1,
        };

        for record in inputs {
            match record {
                TrackedRecord::State {
                    name,
                    value,
                    origin,
                    annotation,
                } => {
                    if let Some(note) = annotation {
                        debug!(name = %name, annotation = %note, "tracked input");
                    }
                    buckets[slot(origin)]
                        .inputs
                        .push(ComputeInput::Arbitrary(ArbitraryInput::single(name, value)));
                }
                TrackedRecord::Messages {
                    messages,
                    model_name,
                    finetune,
                    origin,
                } => {
                    let finetune = finetune || self.config.finetune_step;
                    let mut details = ArbitraryInput::single("model_name", json!(model_name));
                    details
                        .inputs
                        .insert("finetune".to_string(), json!(finetune).into());
                    let b = &mut buckets[slot(origin)];
                    b.inputs.push(ComputeInput::Message(MessageInput { messages }));
                    b.inputs.push(ComputeInput::Arbitrary(details));
                    b.model_name = Some(model_name);
                }
            }
        }

        for record in outputs {
            match record {
                TrackedRecord::State {
                    name,
                    value,
                    origin,
                    annotation,
                } => {
                    if let Some(note) = annotation {
                        debug!(name = %name, annotation = %note, "tracked output");
                    }
                    buckets[slot(origin)]
                        .outputs
                        .push(ComputeOutput::Arbitrary(ArbitraryOutput::single(name, value)));
                }
                TrackedRecord::Messages {
                    messages,
                    model_name,
                    origin,
                    ..
                } => {
                    let b = &mut buckets[slot(origin)];
                    b.outputs
                        .push(ComputeOutput::Message(MessageOutput { messages }));
                    b.model_name = Some(model_name);
                }
            }
        }

        let [agent, environment] = buckets;
        let mut steps = Vec::with_capacity(2);
        if !agent.is_empty() {
            steps.push(ComputeStep::agent(
                agent.model_name,
                compute_began,
                compute_ended,
                agent.inputs,
                agent.outputs,
            ));
        }
        if !environment.is_empty() {
            steps.push(ComputeStep::environment(
                compute_began,
                compute_ended,
                environment.inputs,
                environment.outputs,
            ));
        }
        steps
    }
}

#[derive(Default)]
struct OriginBucket {
    inputs: Vec<ComputeInput>,
    outputs: Vec<ComputeOutput>,
    model_name: Option<String>,
}

impl OriginBucket {
    fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}

// ============================================================================
// TEARDOWN
// ============================================================================

/// Teardown, run on every exit path including cancellation
struct CallGuard {
    ctx: ExecutionContext,
    store: Arc<EventStore>,
    identity: SystemIdentity,
    created: Option<EventHandle>,
    compute_began: f64,
    /// State of an enclosing call on the same domain, restored on drop
    parent_identity: Option<SystemIdentity>,
    parent_collector: Option<StateCollector>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.created.take() {
            if let Some(event) = handle.close(now_secs()) {
                debug!(event_type = %event.event_type, "storing unclosed event at teardown");
                let owner = handle.owner().unwrap_or(&self.identity);
                deliver_event(&self.store, owner, event);
            }
            self.ctx.clear_event_if_same(&handle);
        }
        if let Some(collector) = self.parent_collector.take() {
            self.ctx.replace_collector(collector);
        }
        self.ctx.replace_identity(self.parent_identity.take());
    }
}

/// Hand a closed event to the store; failures are logged and the event dropped
pub(crate) fn deliver_event(store: &EventStore, owner: &SystemIdentity, event: Event) {
    let event_type = event.event_type.clone();
    if let Err(err) = store.add_event(
        &owner.system_name,
        &owner.system_id,
        &owner.system_instance_id,
        event,
    ) {
        error!(%err, event_type = %event_type, "event discarded: store delivery failed");
    }
}
