//! Typed publish/subscribe event dispatch.
//!
//! Events are immutable notifications keyed by their runtime type. Handlers
//! subscribe to a concrete event type, optionally with a structural filter,
//! and are invoked synchronously and in subscription order whenever a
//! matching event is released. Dispatch for one emission completes fully
//! before control returns to the releasing callback.
//!
//! Two conventional event categories are layered on this one mechanism:
//! a *mutation* event is released and handled privately by the data manager
//! that owns the affected state, which validates and applies the change, then
//! releases a public *observation* event so unrelated components can react.
//! The bus itself draws no distinction between the two.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    rc::Rc,
};

use crate::{context::KernelHandle, error::NucleusResult};

/// Marker trait for events dispatched through the kernel.
///
/// Implement it on any `'static` type; the kernel keys dispatch on the
/// concrete type and never inspects the payload.
pub trait SimulationEvent: Any {}

/// Identifies a single subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A type-erased handler stored in the subscriber table.
///
/// The wrapper created at subscription time downcasts the payload back to the
/// concrete event type and applies the structural filter before invoking the
/// typed handler.
pub(crate) type ErasedEventHandler =
    Rc<dyn Fn(&KernelHandle, &dyn Any) -> NucleusResult<()>>;

struct EventSubscription {
    id: SubscriptionId,
    handler: ErasedEventHandler,
}

/// The subscriber table: event type key to handlers in subscription order.
pub(crate) struct EventSubscriptions {
    table: HashMap<TypeId, Vec<EventSubscription>>,
    index: HashMap<SubscriptionId, TypeId>,
    next_id: u64,
}

impl EventSubscriptions {
    pub(crate) fn new() -> Self {
        Self {
            table: HashMap::new(),
            index: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers an erased handler under an event type key.
    pub(crate) fn subscribe_erased(
        &mut self,
        event_type: TypeId,
        handler: ErasedEventHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.table
            .entry(event_type)
            .or_default()
            .push(EventSubscription { id, handler });
        self.index.insert(id, event_type);
        id
    }

    /// Removes a subscription. Returns `false` if the id is unknown or was
    /// already removed.
    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(event_type) = self.index.remove(&id) else {
            return false;
        };
        if let Some(handlers) = self.table.get_mut(&event_type) {
            handlers.retain(|s| s.id != id);
        }
        true
    }

    /// Returns a snapshot of the handlers registered for an event type, in
    /// subscription order. The snapshot lets dispatch run without holding a
    /// borrow of the table, so handlers may themselves subscribe or
    /// unsubscribe.
    pub(crate) fn handlers_for(&self, event_type: TypeId) -> Vec<ErasedEventHandler> {
        self.table
            .get(&event_type)
            .map(|handlers| handlers.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the number of live subscriptions for an event type.
    #[cfg(test)]
    pub(crate) fn subscription_count(&self, event_type: TypeId) -> usize {
        self.table.get(&event_type).map_or(0, |h| h.len())
    }
}
