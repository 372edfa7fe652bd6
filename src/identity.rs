//! System identity
//!
//! `system_name` (logical system) → `system_id` (stable derived id) →
//! `system_instance_id` (one running instance).

use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::error::TraceError;

/// A system whose calls can be traced
///
/// Returning `None` (or an empty string) for a required attribute makes
/// every traced call on the system fail with a configuration error.
pub trait TracedSystem {
    fn system_name(&self) -> Option<&str>;

    fn system_instance_id(&self) -> Option<&str>;

    /// Override the id derived from `system_name`
    fn system_id(&self) -> Option<&str> {
        None
    }
}

/// Stable id for a logical system (xxh3-64, lowercase hex)
pub fn derive_system_id(system_name: &str) -> String {
    format!("{:016x}", xxh3_64(system_name.as_bytes()))
}

/// Resolved identity tuple of the call currently executing
///
/// Uses Arc<str> so context snapshots clone without copying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SystemIdentity {
    pub system_name: Arc<str>,
    pub system_id: Arc<str>,
    pub system_instance_id: Arc<str>,
}

impl SystemIdentity {
    pub fn new(system_name: impl Into<String>, system_instance_id: impl Into<String>) -> Self {
        let system_name: String = system_name.into();
        let system_id = derive_system_id(&system_name);
        Self {
            system_name: system_name.into(),
            system_id: system_id.into(),
            system_instance_id: system_instance_id.into().into(),
        }
    }

    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = system_id.into().into();
        self
    }

    /// Read the identity tuple off a traced system
    pub fn resolve<S: TracedSystem + ?Sized>(system: &S) -> Result<Self, TraceError> {
        let system_name = required(system.system_name(), "system_name")?;
        let system_instance_id = required(system.system_instance_id(), "system_instance_id")?;
        let identity = Self::new(system_name, system_instance_id);
        Ok(match system.system_id().filter(|id| !id.is_empty()) {
            Some(id) => identity.with_system_id(id),
            None => identity,
        })
    }
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, TraceError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(TraceError::MissingIdentity { field })
}

impl TracedSystem for SystemIdentity {
    fn system_name(&self) -> Option<&str> {
        Some(&self.system_name)
    }

    fn system_instance_id(&self) -> Option<&str> {
        Some(&self.system_instance_id)
    }

    fn system_id(&self) -> Option<&str> {
        Some(&self.system_id)
    }
}
