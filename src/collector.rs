//! Per-call state collector
//!
//! Buffers values tracked during one instrumented call, tagged by origin and
//! role. Each concurrency domain (thread or task scope) owns its own
//! collector through the [`ExecutionContext`](crate::context::ExecutionContext),
//! so concurrent calls never see each other's records.

use serde::Serialize;
use tracing::debug;

use crate::capture::CapturedValue;
use crate::context::ExecutionContext;
use crate::model::{Message, Origin};

/// Whether a tracked value went into or came out of the computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoRole {
    Input,
    Output,
}

/// One raw record awaiting consolidation into a compute step
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedRecord {
    State {
        name: String,
        value: CapturedValue,
        origin: Origin,
        annotation: Option<String>,
    },
    Messages {
        messages: Vec<Message>,
        model_name: String,
        finetune: bool,
        origin: Origin,
    },
}

impl TrackedRecord {
    pub fn origin(&self) -> Origin {
        match self {
            TrackedRecord::State { origin, .. } | TrackedRecord::Messages { origin, .. } => *origin,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateCollector {
    inputs: Vec<TrackedRecord>,
    outputs: Vec<TrackedRecord>,
}

impl StateCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a generic tagged value (never fails)
    pub fn track_state<T: Serialize + ?Sized>(
        &mut self,
        name: impl Into<String>,
        value: &T,
        origin: Origin,
        role: IoRole,
        annotation: Option<&str>,
    ) {
        self.track_captured(
            name,
            CapturedValue::capture(value),
            origin,
            role,
            annotation,
        );
    }

    pub(crate) fn track_captured(
        &mut self,
        name: impl Into<String>,
        value: CapturedValue,
        origin: Origin,
        role: IoRole,
        annotation: Option<&str>,
    ) {
        let record = TrackedRecord::State {
            name: name.into(),
            value,
            origin,
            annotation: annotation.map(str::to_string),
        };
        self.push(record, role);
    }

    /// Append a conversational exchange
    pub fn track_message(
        &mut self,
        messages: Vec<Message>,
        model_name: impl Into<String>,
        finetune: bool,
        origin: Origin,
        role: IoRole,
    ) {
        let record = TrackedRecord::Messages {
            messages,
            model_name: model_name.into(),
            finetune,
            origin,
        };
        self.push(record, role);
    }

    fn push(&mut self, record: TrackedRecord, role: IoRole) {
        match role {
            IoRole::Input => self.inputs.push(record),
            IoRole::Output => self.outputs.push(record),
        }
    }

    /// Drain all records as `(inputs, outputs)`, leaving the collector empty
    pub fn get_traced_data(&mut self) -> (Vec<TrackedRecord>, Vec<TrackedRecord>) {
        (
            std::mem::take(&mut self.inputs),
            std::mem::take(&mut self.outputs),
        )
    }

    pub fn reset(&mut self) {
        if !self.is_empty() {
            debug!(
                discarded = self.len(),
                "resetting collector with undrained records"
            );
        }
        self.inputs.clear();
        self.outputs.clear();
    }

    pub fn len(&self) -> usize {
        self.inputs.len() + self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════
// CALL-SITE API (current concurrency domain)
// ═══════════════════════════════════════════

/// Track a value inside the currently executing traced call
///
/// Outside a traced call the value is dropped.
pub fn track_state<T: Serialize + ?Sized>(
    name: &str,
    value: &T,
    origin: Origin,
    role: IoRole,
    annotation: Option<&str>,
) {
    let Some(ctx) = active_call(name) else {
        return;
    };
    let captured = CapturedValue::capture(value);
    ctx.with_collector(|c| c.track_captured(name, captured, origin, role, annotation));
}

/// Track an LM exchange inside the currently executing traced call
pub fn track_message(
    messages: Vec<Message>,
    model_name: &str,
    finetune: bool,
    origin: Origin,
    role: IoRole,
) {
    let Some(ctx) = active_call("messages") else {
        return;
    };
    ctx.with_collector(|c| c.track_message(messages, model_name, finetune, origin, role));
}

/// Context of the traced call executing here, if any
fn active_call(name: &str) -> Option<ExecutionContext> {
    let ctx = ExecutionContext::current();
    if ctx.identity().is_none() {
        debug!(name, "no traced call active; record dropped");
        return None;
    }
    Some(ctx)
}
