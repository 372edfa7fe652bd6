//! # Execution Context
//!
//! Per-concurrency-domain tracing state: the open events keyed by
//! `event_type`, the identity tuple of the call executing in the domain, and
//! that domain's [`StateCollector`].
//!
//! ## Backends
//!
//! | Backend | Storage | Nested / concurrent calls |
//! |---------|---------|---------------------------|
//! | `ThreadConfined` | `thread_local!` | share the thread's state; a nested call overwrites the identity |
//! | `TaskScoped` | `tokio::task_local!` | each scope starts from a snapshot of its parent; writes stay private |
//!
//! A task scope is restored to the parent's state when the scoped future
//! completes, fails or is dropped (cancellation), since the task-local value
//! only lives for the duration of the scope.
//!
//! ```text
//! parent scope ── fork() ──► child scope (identity + open events cloned,
//!      ▲                          fresh collector)
//!      └──── child completes / is cancelled: parent state untouched
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::collector::StateCollector;
use crate::identity::SystemIdentity;
use crate::model::{ComputeStep, Event};

// ============================================================================
// EVENT HANDLE
// ============================================================================

/// Shared handle to one open event
///
/// The event lives in the handle until it is closed: closing takes it out,
/// transferring ownership to whoever delivers it to the store. Any later
/// close or attach through another clone of the handle is a no-op.
#[derive(Clone)]
pub struct EventHandle {
    slot: Arc<Mutex<Option<Event>>>,
    event_type: Arc<str>,
    partition_index: u64,
    owner: Option<SystemIdentity>,
}

impl EventHandle {
    pub fn new(event: Event, owner: Option<SystemIdentity>) -> Self {
        Self {
            event_type: event.event_type.as_str().into(),
            partition_index: event.partition_index,
            slot: Arc::new(Mutex::new(Some(event))),
            owner,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn partition_index(&self) -> u64 {
        self.partition_index
    }

    /// Identity of the instance that opened the event
    pub fn owner(&self) -> Option<&SystemIdentity> {
        self.owner.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(|e| !e.is_closed())
    }

    /// Attach a compute step; `None` once the event has been closed
    pub fn attach_step(&self, step: ComputeStep) -> Option<u32> {
        self.slot.lock().as_mut().and_then(|e| e.attach_step(step))
    }

    /// Close the event and take ownership of it (only the first caller gets it)
    pub fn close(&self, at: f64) -> Option<Event> {
        let mut event = self.slot.lock().take()?;
        event.close(at);
        Some(event)
    }

    /// Copy of the event while it is still held by the handle
    pub fn snapshot(&self) -> Option<Event> {
        self.slot.lock().clone()
    }

    pub fn same_event(&self, other: &EventHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle")
            .field("event_type", &self.event_type)
            .field("partition_index", &self.partition_index)
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// CONTEXT STATE
// ============================================================================

/// Tracing state of one concurrency domain
#[derive(Debug, Default)]
pub struct ContextState {
    identity: Option<SystemIdentity>,
    active_events: HashMap<String, EventHandle>,
    collector: StateCollector,
}

impl ContextState {
    /// Snapshot for a child scope: identity and open events are inherited,
    /// the collector starts empty
    pub fn fork(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            active_events: self
                .active_events
                .iter()
                .filter(|(_, handle)| handle.is_open())
                .map(|(k, h)| (k.clone(), h.clone()))
                .collect(),
            collector: StateCollector::new(),
        }
    }
}

thread_local! {
    static THREAD_STATE: RefCell<ContextState> = RefCell::new(ContextState::default());
}

tokio::task_local! {
    static TASK_STATE: RefCell<ContextState>;
}

/// Whether the caller runs inside a task scope
pub fn in_task_scope() -> bool {
    TASK_STATE.try_with(|_| ()).is_ok()
}

// ============================================================================
// EXECUTION CONTEXT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextBackend {
    ThreadConfined,
    TaskScoped,
}

/// Accessor for the tracing state of one backend
///
/// Both backends expose the same operations. A `TaskScoped` context used
/// outside any task scope has no state: reads return `None`, writes are
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    backend: ContextBackend,
}

impl ExecutionContext {
    pub fn thread_confined() -> Self {
        Self {
            backend: ContextBackend::ThreadConfined,
        }
    }

    pub fn task_scoped() -> Self {
        Self {
            backend: ContextBackend::TaskScoped,
        }
    }

    /// Task scope when inside one, otherwise the current thread
    pub fn current() -> Self {
        if in_task_scope() {
            Self::task_scoped()
        } else {
            Self::thread_confined()
        }
    }

    pub fn backend(&self) -> ContextBackend {
        self.backend
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> Option<R> {
        match self.backend {
            ContextBackend::ThreadConfined => THREAD_STATE
                .try_with(|cell| f(&mut cell.borrow_mut()))
                .ok(),
            ContextBackend::TaskScoped => {
                if !in_task_scope() {
                    debug!("task-scoped context used outside a task scope");
                    return None;
                }
                TASK_STATE.try_with(|cell| f(&mut cell.borrow_mut())).ok()
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Active events
    // ─────────────────────────────────────────────────────────────

    /// Publish an open event under its `event_type`
    pub fn set_current_event(&self, handle: EventHandle) {
        self.with_state(|state| {
            state
                .active_events
                .insert(handle.event_type().to_string(), handle)
        });
    }

    pub fn clear_current_event(&self, event_type: &str) -> Option<EventHandle> {
        self.with_state(|state| state.active_events.remove(event_type))
            .flatten()
    }

    /// Remove `handle` only if it is still the active event of its type
    pub fn clear_event_if_same(&self, handle: &EventHandle) -> bool {
        self.with_state(|state| {
            let same = state
                .active_events
                .get(handle.event_type())
                .is_some_and(|active| active.same_event(handle));
            if same {
                state.active_events.remove(handle.event_type());
            }
            same
        })
        .unwrap_or(false)
    }

    /// Open event of `event_type`; closed leftovers are pruned
    pub fn get_active_event(&self, event_type: &str) -> Option<EventHandle> {
        self.with_state(|state| match state.active_events.get(event_type) {
            Some(handle) if handle.is_open() => Some(handle.clone()),
            Some(_) => {
                state.active_events.remove(event_type);
                None
            }
            None => None,
        })
        .flatten()
    }

    pub fn active_event_types(&self) -> Vec<String> {
        let mut types = self
            .with_state(|state| state.active_events.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        types.sort();
        types
    }

    pub(crate) fn drain_active_events(&self) -> Vec<EventHandle> {
        self.with_state(|state| state.active_events.drain().map(|(_, h)| h).collect())
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────

    pub fn set_identity(&self, identity: SystemIdentity) {
        self.with_state(|state| state.identity = Some(identity));
    }

    pub fn identity(&self) -> Option<SystemIdentity> {
        self.with_state(|state| state.identity.clone()).flatten()
    }

    pub fn clear_identity(&self) {
        self.with_state(|state| state.identity = None);
    }

    /// Install `identity`, returning the one it displaced
    pub(crate) fn replace_identity(
        &self,
        identity: Option<SystemIdentity>,
    ) -> Option<SystemIdentity> {
        self.with_state(|state| std::mem::replace(&mut state.identity, identity))
            .flatten()
    }

    // ─────────────────────────────────────────────────────────────
    // Collector / forking
    // ─────────────────────────────────────────────────────────────

    pub fn with_collector<R>(&self, f: impl FnOnce(&mut StateCollector) -> R) -> Option<R> {
        self.with_state(|state| f(&mut state.collector))
    }

    /// Install `collector`, returning the enclosing call's collector
    pub(crate) fn replace_collector(&self, collector: StateCollector) -> Option<StateCollector> {
        self.with_state(|state| std::mem::replace(&mut state.collector, collector))
    }

    /// Snapshot of this domain's state for a child scope
    pub fn fork(&self) -> ContextState {
        self.with_state(|state| state.fork()).unwrap_or_default()
    }
}

// ============================================================================
// TASK SCOPES
// ============================================================================

/// Run `fut` in a fresh task scope inheriting the caller's state
///
/// The child sees the caller's identity and open events; everything it
/// writes is private and gone once the future finishes or is dropped.
pub fn inherit<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let snapshot = ExecutionContext::current().fork();
    TASK_STATE.scope(RefCell::new(snapshot), fut)
}

/// `tokio::spawn` with the caller's state inherited at fork time
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(inherit(fut))
}
