//! Manually managed events
//!
//! [`EventScope`] opens an event around a block of traced calls: calls made
//! with `manage_event = none` while the scope is alive attach their compute
//! steps to it, and the event is closed and delivered when the scope ends.
//!
//! In async code open the scope inside [`context::inherit`](crate::context::inherit)
//! so the event is only visible to that task.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::{EventHandle, ExecutionContext};
use crate::error::TraceError;
use crate::identity::{SystemIdentity, TracedSystem};
use crate::model::{now_secs, Event};
use crate::store::{EventStore, INITIAL_PARTITION};
use crate::tracer::deliver_event;

/// Open event that is closed and delivered on drop
#[must_use = "the event is closed as soon as the scope is dropped"]
pub struct EventScope {
    ctx: ExecutionContext,
    store: Arc<EventStore>,
    handle: Option<EventHandle>,
}

impl EventScope {
    /// Open an event for the identity of the call currently executing
    pub fn open(event_type: &str) -> Self {
        Self::open_in(event_type, EventStore::global())
    }

    pub fn open_in(event_type: &str, store: Arc<EventStore>) -> Self {
        let ctx = ExecutionContext::current();
        let owner = ctx.identity();
        Self::start(ctx, store, event_type, owner)
    }

    /// Open an event owned by `system`
    pub fn open_for<S: TracedSystem + ?Sized>(
        system: &S,
        event_type: &str,
        store: Arc<EventStore>,
    ) -> Result<Self, TraceError> {
        let identity = SystemIdentity::resolve(system)?;
        Ok(Self::start(
            ExecutionContext::current(),
            store,
            event_type,
            Some(identity),
        ))
    }

    fn start(
        ctx: ExecutionContext,
        store: Arc<EventStore>,
        event_type: &str,
        owner: Option<SystemIdentity>,
    ) -> Self {
        let handle = EventHandle::new(Event::open(event_type, INITIAL_PARTITION), owner);
        ctx.set_current_event(handle.clone());
        debug!(event_type, "event scope opened");
        Self {
            ctx,
            store,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&EventHandle> {
        self.handle.as_ref()
    }

    /// Close now instead of at end of scope
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.ctx.clear_event_if_same(&handle);
        let Some(event) = handle.close(now_secs()) else {
            return;
        };
        match handle.owner() {
            Some(owner) => deliver_event(&self.store, owner, event),
            None => discard_unowned(&event),
        }
    }
}

impl Drop for EventScope {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Close and deliver every event still open in the current domain
///
/// Returns the number of events delivered.
pub fn flush_active_events(store: &EventStore) -> usize {
    let ctx = ExecutionContext::current();
    let fallback = ctx.identity();
    let mut delivered = 0;
    for handle in ctx.drain_active_events() {
        let Some(event) = handle.close(now_secs()) else {
            continue;
        };
        match handle.owner().or(fallback.as_ref()) {
            Some(owner) => {
                deliver_event(store, owner, event);
                delivered += 1;
            }
            None => discard_unowned(&event),
        }
    }
    debug!(delivered, "flushed active events");
    delivered
}

fn discard_unowned(event: &Event) {
    warn!(
        event_type = %event.event_type,
        "event discarded: no system instance to deliver to"
    );
}
