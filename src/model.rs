//! Trace data model
//!
//! Value types for captured inputs/outputs, compute steps, events,
//! partitions and per-instance system traces.
//! - ComputeStep: one origin's grouped capture, ordered by `event_order`
//! - Event: one traced span, `closed` set exactly once
//! - SystemTrace: partitioned history of one system instance
//!
//! Export is a pure rendering into `serde_json::Value`; values that could not
//! be captured as JSON are dropped item by item with a warning.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::capture::CapturedValue;
use crate::error::TraceError;

/// Current wall-clock time as epoch seconds
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Which side of a traced computation a capture belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Decision-making side (LM calls, policies)
    Agent,
    /// World-state side (environment steps)
    Environment,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Agent => write!(f, "agent"),
            Origin::Environment => write!(f, "environment"),
        }
    }
}

// ═══════════════════════════════════════════
// CAPTURED INPUTS / OUTPUTS
// ═══════════════════════════════════════════

/// One {role, content} pair of a conversational exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArbitraryInput {
    pub inputs: BTreeMap<String, CapturedValue>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArbitraryOutput {
    pub outputs: BTreeMap<String, CapturedValue>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageInput {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageOutput {
    pub messages: Vec<Message>,
}

impl ArbitraryInput {
    pub fn single(name: impl Into<String>, value: impl Into<CapturedValue>) -> Self {
        let mut inputs = BTreeMap::new();
        inputs.insert(name.into(), value.into());
        Self { inputs }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).and_then(CapturedValue::as_json)
    }
}

impl ArbitraryOutput {
    pub fn single(name: impl Into<String>, value: impl Into<CapturedValue>) -> Self {
        let mut outputs = BTreeMap::new();
        outputs.insert(name.into(), value.into());
        Self { outputs }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name).and_then(CapturedValue::as_json)
    }
}

/// One entry of a compute step's input list
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeInput {
    Arbitrary(ArbitraryInput),
    Message(MessageInput),
}

/// One entry of a compute step's output list
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeOutput {
    Arbitrary(ArbitraryOutput),
    Message(MessageOutput),
}

impl ComputeInput {
    /// Render for export, `None` when nothing representable is left
    pub fn to_value(&self) -> Option<Value> {
        match self {
            ComputeInput::Arbitrary(input) => export_entries("inputs", &input.inputs),
            ComputeInput::Message(input) => Some(json!({ "messages": input.messages })),
        }
    }
}

impl ComputeOutput {
    pub fn to_value(&self) -> Option<Value> {
        match self {
            ComputeOutput::Arbitrary(output) => export_entries("outputs", &output.outputs),
            ComputeOutput::Message(output) => Some(json!({ "messages": output.messages })),
        }
    }
}

/// Render `{key: {name: value, ...}}`, dropping entries that were never JSON
fn export_entries(key: &str, entries: &BTreeMap<String, CapturedValue>) -> Option<Value> {
    let mut rendered = Map::new();
    for (name, value) in entries {
        match value {
            CapturedValue::Json(v) => {
                rendered.insert(name.clone(), v.clone());
            }
            CapturedValue::Unserializable { reason } => {
                let err = TraceError::Serialization {
                    name: name.clone(),
                    reason: reason.clone(),
                };
                warn!(%err, "dropping unserializable value from export");
            }
        }
    }
    if rendered.is_empty() {
        return None;
    }
    let mut outer = Map::new();
    outer.insert(key.to_string(), Value::Object(rendered));
    Some(Value::Object(outer))
}

// ═══════════════════════════════════════════
// COMPUTE STEPS
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Agent { model_name: Option<String> },
    Environment,
}

/// One grouped capture for a single origin within an event
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeStep {
    pub kind: StepKind,
    /// Position within the owning event (assigned on attach, starts at 1)
    pub event_order: u32,
    pub compute_began: f64,
    pub compute_ended: f64,
    pub compute_input: Vec<ComputeInput>,
    pub compute_output: Vec<ComputeOutput>,
}

impl ComputeStep {
    pub fn agent(
        model_name: Option<String>,
        compute_began: f64,
        compute_ended: f64,
        compute_input: Vec<ComputeInput>,
        compute_output: Vec<ComputeOutput>,
    ) -> Self {
        Self {
            kind: StepKind::Agent { model_name },
            event_order: 0,
            compute_began,
            compute_ended: compute_ended.max(compute_began),
            compute_input,
            compute_output,
        }
    }

    pub fn environment(
        compute_began: f64,
        compute_ended: f64,
        compute_input: Vec<ComputeInput>,
        compute_output: Vec<ComputeOutput>,
    ) -> Self {
        Self {
            kind: StepKind::Environment,
            event_order: 0,
            compute_began,
            compute_ended: compute_ended.max(compute_began),
            compute_input,
            compute_output,
        }
    }

    pub fn origin(&self) -> Origin {
        match self.kind {
            StepKind::Agent { .. } => Origin::Agent,
            StepKind::Environment => Origin::Environment,
        }
    }

    pub fn model_name(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Agent { model_name } => model_name.as_deref(),
            StepKind::Environment => None,
        }
    }

    pub fn message_inputs(&self) -> impl Iterator<Item = &MessageInput> {
        self.compute_input.iter().filter_map(|input| match input {
            ComputeInput::Message(m) => Some(m),
            ComputeInput::Arbitrary(_) => None,
        })
    }

    pub fn message_outputs(&self) -> impl Iterator<Item = &MessageOutput> {
        self.compute_output.iter().filter_map(|output| match output {
            ComputeOutput::Message(m) => Some(m),
            ComputeOutput::Arbitrary(_) => None,
        })
    }

    pub fn arbitrary_inputs(&self) -> impl Iterator<Item = &ArbitraryInput> {
        self.compute_input.iter().filter_map(|input| match input {
            ComputeInput::Arbitrary(a) => Some(a),
            ComputeInput::Message(_) => None,
        })
    }

    pub fn arbitrary_outputs(&self) -> impl Iterator<Item = &ArbitraryOutput> {
        self.compute_output.iter().filter_map(|output| match output {
            ComputeOutput::Arbitrary(a) => Some(a),
            ComputeOutput::Message(_) => None,
        })
    }

    pub fn to_value(&self) -> Value {
        let compute_input: Vec<Value> = self
            .compute_input
            .iter()
            .filter_map(ComputeInput::to_value)
            .collect();
        let compute_output: Vec<Value> = self
            .compute_output
            .iter()
            .filter_map(ComputeOutput::to_value)
            .collect();
        json!({
            "event_order": self.event_order,
            "compute_began": self.compute_began,
            "compute_ended": self.compute_ended,
            "compute_input": compute_input,
            "compute_output": compute_output,
        })
    }
}

// ═══════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════

/// One traced invocation span
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub opened: f64,
    /// `None` while open; set exactly once
    pub closed: Option<f64>,
    pub partition_index: u64,
    pub agent_compute_step: Option<ComputeStep>,
    pub environment_compute_steps: Vec<ComputeStep>,
    steps_recorded: u32,
}

impl Event {
    /// Open a new event now
    pub fn open(event_type: impl Into<String>, partition_index: u64) -> Self {
        Self::opened_at(event_type, now_secs(), partition_index)
    }

    pub fn opened_at(event_type: impl Into<String>, opened: f64, partition_index: u64) -> Self {
        Self {
            event_type: event_type.into(),
            opened,
            closed: None,
            partition_index,
            agent_compute_step: None,
            environment_compute_steps: Vec::new(),
            steps_recorded: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Close the event; a second close is a no-op and returns false
    pub fn close(&mut self, at: f64) -> bool {
        if self.closed.is_some() {
            return false;
        }
        self.closed = Some(at.max(self.opened));
        true
    }

    /// Attach a compute step, assigning the next `event_order`
    ///
    /// Agent steps fill the single agent slot (a later one replaces it);
    /// environment steps are appended. Returns `None` once closed.
    pub fn attach_step(&mut self, mut step: ComputeStep) -> Option<u32> {
        if self.is_closed() {
            debug!(event_type = %self.event_type, "ignoring compute step for closed event");
            return None;
        }
        self.steps_recorded += 1;
        step.event_order = self.steps_recorded;
        let order = step.event_order;
        match step.kind {
            StepKind::Agent { .. } => {
                if self.agent_compute_step.replace(step).is_some() {
                    debug!(event_type = %self.event_type, "agent compute step replaced");
                }
            }
            StepKind::Environment => self.environment_compute_steps.push(step),
        }
        Some(order)
    }

    /// All attached steps in `event_order`
    pub fn compute_steps(&self) -> Vec<&ComputeStep> {
        let mut steps: Vec<&ComputeStep> = self
            .agent_compute_step
            .iter()
            .chain(self.environment_compute_steps.iter())
            .collect();
        steps.sort_by_key(|s| s.event_order);
        steps
    }

    pub fn to_value(&self) -> Value {
        let agent: Vec<Value> = self
            .agent_compute_step
            .iter()
            .map(ComputeStep::to_value)
            .collect();
        let environment: Vec<Value> = self
            .environment_compute_steps
            .iter()
            .map(ComputeStep::to_value)
            .collect();
        json!({
            "event_type": self.event_type,
            "opened": self.opened,
            "closed": self.closed,
            "partition_index": self.partition_index,
            "agent_compute_steps": agent,
            "environment_compute_steps": environment,
        })
    }
}

// ═══════════════════════════════════════════
// PARTITIONS / TRACES
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct EventPartitionElement {
    pub partition_index: u64,
    pub events: Vec<Event>,
}

impl EventPartitionElement {
    pub fn to_value(&self) -> Value {
        let events: Vec<Value> = self.events.iter().map(Event::to_value).collect();
        json!({
            "partition_index": self.partition_index,
            "events": events,
        })
    }
}

/// Full partitioned history of one system instance
#[derive(Debug, Clone, PartialEq)]
pub struct SystemTrace {
    pub system_name: String,
    pub system_id: String,
    pub system_instance_id: String,
    /// Partitions in increasing index order
    pub partition: Vec<EventPartitionElement>,
    /// Highest partition index issued for the instance
    pub current_partition_index: u64,
}

impl SystemTrace {
    pub fn partition(&self, index: u64) -> Option<&EventPartitionElement> {
        self.partition.iter().find(|p| p.partition_index == index)
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.partition.iter().flat_map(|p| p.events.iter())
    }

    pub fn event_count(&self) -> usize {
        self.partition.iter().map(|p| p.events.len()).sum()
    }

    pub fn to_value(&self) -> Value {
        let partition: Vec<Value> = self
            .partition
            .iter()
            .map(EventPartitionElement::to_value)
            .collect();
        json!({
            "system_id": self.system_id,
            "partition": partition,
            "current_partition_index": self.current_partition_index,
        })
    }
}

/// Render a batch of traces as the export array
pub fn traces_to_value(traces: &[SystemTrace]) -> Value {
    Value::Array(traces.iter().map(SystemTrace::to_value).collect())
}
