//! Event store
//!
//! Process-wide sink for closed events, partitioned per system instance.
//! - Per-instance traces live in a DashMap, each behind its own mutex, so
//!   writers for unrelated instances never contend
//! - Writers share a gate (read side); snapshots and resets take the gate
//!   exclusively, so they never observe a half-applied write
//! - Append-only: nothing delivered is mutated or removed until `reset`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::TraceError;
use crate::model::{Event, EventPartitionElement, SystemTrace};

/// Partition implicitly issued when an instance is first seen
pub const INITIAL_PARTITION: u64 = 0;

struct InstanceTrace {
    /// Creation order, for stable snapshot ordering
    seq: u64,
    system_name: String,
    system_id: String,
    current_partition_index: u64,
    partitions: BTreeMap<u64, Vec<Event>>,
}

impl InstanceTrace {
    fn to_system_trace(&self, system_instance_id: &str) -> SystemTrace {
        SystemTrace {
            system_name: self.system_name.clone(),
            system_id: self.system_id.clone(),
            system_instance_id: system_instance_id.to_string(),
            partition: self
                .partitions
                .iter()
                .map(|(index, events)| EventPartitionElement {
                    partition_index: *index,
                    events: events.clone(),
                })
                .collect(),
            current_partition_index: self.current_partition_index,
        }
    }
}

/// Concurrency-safe registry of closed events
pub struct EventStore {
    instances: DashMap<Arc<str>, Arc<Mutex<InstanceTrace>>>,
    gate: RwLock<()>,
    next_seq: AtomicU64,
}

static GLOBAL_STORE: Lazy<Arc<EventStore>> = Lazy::new(|| Arc::new(EventStore::new()));

impl EventStore {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            gate: RwLock::new(()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Shared store used by tracers that were not given one
    pub fn global() -> Arc<EventStore> {
        Arc::clone(&GLOBAL_STORE)
    }

    /// Get or lazily create an instance trace (caller holds the gate)
    fn instance(
        &self,
        system_name: &str,
        system_id: &str,
        system_instance_id: &str,
    ) -> Arc<Mutex<InstanceTrace>> {
        if let Some(existing) = self.instances.get(system_instance_id) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .instances
            .entry(Arc::from(system_instance_id))
            .or_insert_with(|| {
                debug!(system_instance_id, system_name, "new system trace");
                Arc::new(Mutex::new(InstanceTrace {
                    seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                    system_name: system_name.to_string(),
                    system_id: system_id.to_string(),
                    current_partition_index: INITIAL_PARTITION,
                    partitions: BTreeMap::new(),
                }))
            });
        Arc::clone(entry.value())
    }

    /// Allocate the next partition index for an instance (1, 2, 3, ...)
    pub fn increment_partition(
        &self,
        system_name: &str,
        system_id: &str,
        system_instance_id: &str,
    ) -> u64 {
        let _gate = self.gate.read();
        let trace = self.instance(system_name, system_id, system_instance_id);
        let mut trace = trace.lock();
        trace.current_partition_index += 1;
        trace.current_partition_index
    }

    /// Append a closed event to its partition
    pub fn add_event(
        &self,
        system_name: &str,
        system_id: &str,
        system_instance_id: &str,
        event: Event,
    ) -> Result<(), TraceError> {
        let rejected = |reason: &str| TraceError::StoreDelivery {
            event_type: event.event_type.clone(),
            instance: system_instance_id.to_string(),
            reason: reason.to_string(),
        };
        if system_instance_id.is_empty() {
            return Err(rejected("missing system_instance_id"));
        }
        if !event.is_closed() {
            return Err(rejected("event is still open"));
        }

        let _gate = self.gate.read();
        let trace = self.instance(system_name, system_id, system_instance_id);
        let mut trace = trace.lock();
        debug!(
            system_instance_id,
            event_type = %event.event_type,
            partition_index = event.partition_index,
            "event stored"
        );
        trace
            .partitions
            .entry(event.partition_index)
            .or_default()
            .push(event);
        Ok(())
    }

    /// Consistent snapshot of every known instance, in first-seen order
    pub fn get_system_traces(&self) -> Vec<SystemTrace> {
        let _gate = self.gate.write();
        let mut traces: Vec<(u64, SystemTrace)> = self
            .instances
            .iter()
            .map(|entry| {
                let trace = entry.value().lock();
                (trace.seq, trace.to_system_trace(entry.key()))
            })
            .collect();
        traces.sort_by_key(|(seq, _)| *seq);
        traces.into_iter().map(|(_, trace)| trace).collect()
    }

    /// Snapshot of a single instance
    pub fn get_system_trace(&self, system_instance_id: &str) -> Option<SystemTrace> {
        let _gate = self.gate.write();
        self.instances
            .get(system_instance_id)
            .map(|entry| entry.value().lock().to_system_trace(system_instance_id))
    }

    /// Forget every instance (between export cycles / test runs)
    pub fn reset(&self) {
        let _gate = self.gate.write();
        self.instances.clear();
        debug!("event store reset");
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("instances", &self.instance_count())
            .finish()
    }
}
