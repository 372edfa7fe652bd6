//! Error types with fix suggestions
//!
//! Computation errors are never wrapped here: the traced computation's own
//! error type travels back to the caller unchanged.

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraceError {
    // ─────────────────────────────────────────────────────────────
    // Configuration errors (TRACE-010 to TRACE-012)
    // ─────────────────────────────────────────────────────────────
    #[error("TRACE-010: traced system is missing required identity attribute '{field}'")]
    MissingIdentity { field: &'static str },

    #[error("TRACE-011: tracked argument '{name}' cannot be bound (declared more than once)")]
    UnbindableArgument { name: String },

    #[error("TRACE-012: invalid tracer config: {details}")]
    InvalidConfig { details: String },

    // ─────────────────────────────────────────────────────────────
    // Export errors (TRACE-030)
    // ─────────────────────────────────────────────────────────────
    #[error("TRACE-030: value '{name}' cannot be represented for export: {reason}")]
    Serialization { name: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Store errors (TRACE-040)
    // ─────────────────────────────────────────────────────────────
    #[error("TRACE-040: event store rejected '{event_type}' for instance '{instance}': {reason}")]
    StoreDelivery {
        event_type: String,
        instance: String,
        reason: String,
    },
}

impl TraceError {
    /// Configuration errors are raised before any tracing state is touched
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TraceError::MissingIdentity { .. }
                | TraceError::UnbindableArgument { .. }
                | TraceError::InvalidConfig { .. }
        )
    }
}

impl From<serde_yaml::Error> for TraceError {
    fn from(err: serde_yaml::Error) -> Self {
        TraceError::InvalidConfig {
            details: err.to_string(),
        }
    }
}

impl FixSuggestion for TraceError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            TraceError::MissingIdentity { .. } => {
                Some("Give the traced system a non-empty system_name and system_instance_id")
            }
            TraceError::UnbindableArgument { .. } => {
                Some("Use unique names when declaring tracked arguments")
            }
            TraceError::InvalidConfig { .. } => {
                Some("Check origin is 'agent' or 'environment' and manage_event is 'create' or 'end'")
            }
            TraceError::Serialization { .. } => {
                Some("Track a JSON-representable value (maps need string keys)")
            }
            TraceError::StoreDelivery { .. } => {
                Some("Close the event and set a system_instance_id before delivering it")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_codes() {
        let err = TraceError::MissingIdentity {
            field: "system_name",
        };
        assert!(err.to_string().starts_with("TRACE-010"));
        assert!(err.to_string().contains("system_name"));
    }

    #[test]
    fn configuration_classification() {
        assert!(TraceError::UnbindableArgument { name: "x".into() }.is_configuration());
        assert!(!TraceError::StoreDelivery {
            event_type: "lm_call".into(),
            instance: "i".into(),
            reason: "open".into(),
        }
        .is_configuration());
    }

    #[test]
    fn every_variant_has_a_suggestion() {
        let errors = [
            TraceError::MissingIdentity { field: "x" },
            TraceError::UnbindableArgument { name: "x".into() },
            TraceError::InvalidConfig { details: "x".into() },
            TraceError::Serialization {
                name: "x".into(),
                reason: "y".into(),
            },
            TraceError::StoreDelivery {
                event_type: "x".into(),
                instance: "y".into(),
                reason: "z".into(),
            },
        ];
        assert!(errors.iter().all(|e| e.fix_suggestion().is_some()));
    }
}
