//! Capability contexts handed to plugin initializers, data managers, actors,
//! and reports.
//!
//! Every context wraps a weak handle to the simulation's single-owner state.
//! Callbacks therefore never hold a strong reference into the kernel: a
//! context that outlives its simulation fails with
//! [`NucleusError::SimulationShutdown`] instead of keeping dead state alive.
//! The contexts share one kernel surface (time, plans, events, data managers,
//! output); the distinct types exist so a registration site documents which
//! kind of component it is wiring in.

use std::{
    any::{Any, TypeId},
    cell::RefCell,
    rc::{Rc, Weak},
    sync::Arc,
};

use crate::{
    error::{NucleusError, NucleusResult},
    events::{ErasedEventHandler, SimulationEvent, SubscriptionId},
    managers::DataManager,
    plugin::PluginData,
    simulation::{OutputItem, PlanCallback, SimInner},
};

/// Weak, cloneable handle to a simulation's inner state.
///
/// Mirrors the single-owner model: the [`Simulation`] holds the only strong
/// reference; every context upgrades on each operation and fails cleanly once
/// the simulation is gone.
///
/// [`Simulation`]: crate::simulation::Simulation
#[derive(Clone)]
pub(crate) struct KernelHandle {
    inner: Weak<RefCell<SimInner>>,
}

impl KernelHandle {
    pub(crate) fn from_inner(inner: &Rc<RefCell<SimInner>>) -> Self {
        Self {
            inner: Rc::downgrade(inner),
        }
    }

    fn upgrade(&self) -> NucleusResult<Rc<RefCell<SimInner>>> {
        self.inner.upgrade().ok_or(NucleusError::SimulationShutdown)
    }

    pub(crate) fn time(&self) -> NucleusResult<f64> {
        Ok(self.upgrade()?.borrow().current_time())
    }

    pub(crate) fn add_plan(
        &self,
        time: f64,
        key: Option<String>,
        callback: PlanCallback,
    ) -> NucleusResult<()> {
        let inner = self.upgrade()?;
        let mut inner = inner.borrow_mut();
        inner.schedule_plan(time, key, callback)?;
        Ok(())
    }

    pub(crate) fn cancel_plan(&self, key: &str) -> NucleusResult<bool> {
        Ok(self.upgrade()?.borrow_mut().cancel_plan(key))
    }

    /// Wraps a typed handler (plus optional structural filter) into an erased
    /// table entry keyed by the event's `TypeId`.
    pub(crate) fn subscribe_typed<E, H>(
        &self,
        filter: Option<Box<dyn Fn(&E) -> bool>>,
        handler: H,
    ) -> NucleusResult<SubscriptionId>
    where
        E: SimulationEvent,
        H: Fn(&KernelHandle, &E) -> NucleusResult<()> + 'static,
    {
        let erased: ErasedEventHandler = Rc::new(move |handle, payload| {
            let Some(event) = payload.downcast_ref::<E>() else {
                return Ok(());
            };
            if let Some(filter) = &filter {
                if !filter(event) {
                    return Ok(());
                }
            }
            handler(handle, event)
        });
        let inner = self.upgrade()?;
        let id = inner
            .borrow_mut()
            .subscribe_erased(TypeId::of::<E>(), erased);
        Ok(id)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> NucleusResult<bool> {
        Ok(self.upgrade()?.borrow_mut().unsubscribe(id))
    }

    pub(crate) fn data_manager<T: DataManager>(&self) -> NucleusResult<Rc<RefCell<T>>> {
        self.upgrade()?.borrow().data_manager::<T>()
    }

    /// Synchronous fan-out: the handler list is snapshotted before dispatch so
    /// handlers may subscribe or unsubscribe re-entrantly, and every handler
    /// registered at emission time runs before this returns.
    pub(crate) fn release_event<E: SimulationEvent>(&self, event: E) -> NucleusResult<()> {
        let handlers = self
            .upgrade()?
            .borrow()
            .event_handlers(TypeId::of::<E>());
        for handler in handlers {
            handler(self, &event)?;
        }
        Ok(())
    }

    pub(crate) fn release_output(&self, item: OutputItem) -> NucleusResult<()> {
        self.upgrade()?.borrow_mut().push_output(item);
        Ok(())
    }

    pub(crate) fn halt(&self) -> NucleusResult<()> {
        self.upgrade()?.borrow_mut().request_halt();
        Ok(())
    }
}

macro_rules! impl_kernel_api {
    ($context:ident) => {
        impl $context {
            pub(crate) fn from_handle(handle: KernelHandle) -> Self {
                Self { handle }
            }

            /// Returns the current simulation time.
            pub fn current_time(&self) -> NucleusResult<f64> {
                self.handle.time()
            }

            /// Schedules `callback` to run at simulation time `time`.
            ///
            /// Fails if `time` is in the past or not finite.
            pub fn add_plan(
                &self,
                time: f64,
                callback: impl FnOnce(&ActorContext) -> NucleusResult<()> + 'static,
            ) -> NucleusResult<()> {
                self.handle.add_plan(time, None, Box::new(callback))
            }

            /// Schedules a keyed plan that can later be canceled with
            /// [`cancel_plan`](Self::cancel_plan). Fails if another plan with
            /// the same key is still pending.
            pub fn add_keyed_plan(
                &self,
                time: f64,
                key: impl Into<String>,
                callback: impl FnOnce(&ActorContext) -> NucleusResult<()> + 'static,
            ) -> NucleusResult<()> {
                self.handle
                    .add_plan(time, Some(key.into()), Box::new(callback))
            }

            /// Cancels the pending plan registered under `key`, guaranteeing
            /// it never fires. Returns `false` (not an error) if the key is
            /// unknown or the plan already fired.
            pub fn cancel_plan(&self, key: &str) -> NucleusResult<bool> {
                self.handle.cancel_plan(key)
            }

            /// Subscribes `handler` to every released event of type `E`.
            pub fn subscribe<E: SimulationEvent>(
                &self,
                handler: impl Fn(&$context, &E) -> NucleusResult<()> + 'static,
            ) -> NucleusResult<SubscriptionId> {
                self.handle.subscribe_typed(None, move |handle: &KernelHandle, event: &E| {
                    handler(&$context::from_handle(handle.clone()), event)
                })
            }

            /// Subscribes `handler` to released events of type `E` for which
            /// `filter` returns `true`.
            pub fn subscribe_filtered<E: SimulationEvent>(
                &self,
                filter: impl Fn(&E) -> bool + 'static,
                handler: impl Fn(&$context, &E) -> NucleusResult<()> + 'static,
            ) -> NucleusResult<SubscriptionId> {
                self.handle.subscribe_typed(
                    Some(Box::new(filter)),
                    move |handle: &KernelHandle, event: &E| {
                        handler(&$context::from_handle(handle.clone()), event)
                    },
                )
            }

            /// Removes a subscription made from any context.
            pub fn unsubscribe(&self, id: SubscriptionId) -> NucleusResult<bool> {
                self.handle.unsubscribe(id)
            }

            /// Retrieves the data manager registered under type `T`.
            pub fn data_manager<T: DataManager>(&self) -> NucleusResult<Rc<RefCell<T>>> {
                self.handle.data_manager::<T>()
            }

            /// Releases `event` to all matching subscribers, synchronously and
            /// in subscription order. Zero subscribers is not an error.
            pub fn release_event<E: SimulationEvent>(&self, event: E) -> NucleusResult<()> {
                self.handle.release_event(event)
            }

            /// Releases an output item to the simulation's output sink.
            pub fn release_output(&self, item: impl Any + Send) -> NucleusResult<()> {
                self.handle.release_output(Box::new(item))
            }

            /// Requests that the simulation stop before executing the next
            /// plan. Plans still pending when the loop exits never fire.
            pub fn halt(&self) -> NucleusResult<()> {
                self.handle.halt()
            }
        }
    };
}

/// Context passed to actor initializers and to every plan callback.
pub struct ActorContext {
    handle: KernelHandle,
}

/// Context passed to [`DataManager::init`] and to handlers subscribed from it.
///
/// [`DataManager::init`]: crate::managers::DataManager::init
pub struct DataManagerContext {
    handle: KernelHandle,
}

/// Context passed to report initializers; reports are the conventional home
/// of output-producing subscriptions.
pub struct ReportContext {
    handle: KernelHandle,
}

impl_kernel_api!(ActorContext);
impl_kernel_api!(DataManagerContext);
impl_kernel_api!(ReportContext);

impl DataManagerContext {
    /// Releases a public observation event after a private mutation has been
    /// validated and applied. Identical dispatch to
    /// [`release_event`](Self::release_event); the distinct name marks the
    /// authority boundary at the call site.
    pub fn release_observation_event<E: SimulationEvent>(&self, event: E) -> NucleusResult<()> {
        self.handle.release_event(event)
    }
}

/// Context passed to a plugin's initializer.
///
/// Carries the plugin's own data blobs in addition to the kernel surface, so
/// an initializer can only see data it owns.
pub struct PluginContext {
    handle: KernelHandle,
    data: Vec<Arc<dyn PluginData>>,
}

impl PluginContext {
    pub(crate) fn new(handle: KernelHandle, data: Vec<Arc<dyn PluginData>>) -> Self {
        Self { handle, data }
    }

    /// Returns the current simulation time.
    pub fn current_time(&self) -> NucleusResult<f64> {
        self.handle.time()
    }

    /// Retrieves this plugin's own data blob of type `T`.
    ///
    /// Only blobs attached to this plugin via
    /// [`PluginBuilder::with_data`](crate::plugin::PluginBuilder::with_data)
    /// are visible; other plugins' data is not reachable from here.
    pub fn plugin_data<T: PluginData>(&self) -> NucleusResult<Arc<T>> {
        for blob in &self.data {
            let any: Arc<dyn Any + Send + Sync> = blob.clone();
            if let Ok(typed) = any.downcast::<T>() {
                return Ok(typed);
            }
        }
        Err(NucleusError::UnknownPluginData {
            type_name: std::any::type_name::<T>(),
        })
    }

    /// Registers a data manager and immediately runs its `init` with a bound
    /// [`DataManagerContext`]. Managers registered by earlier-ordered plugins
    /// are already retrievable from within `init`.
    pub fn add_data_manager<T: DataManager>(&self, manager: T) -> NucleusResult<()> {
        let inner = self.handle.upgrade()?;
        let cell = inner.borrow_mut().insert_data_manager(manager)?;
        // Init runs with no borrow of the kernel held, so the manager can
        // schedule plans, subscribe, and retrieve other managers.
        let ctx = DataManagerContext::from_handle(self.handle.clone());
        let result = cell.borrow_mut().init(&ctx);
        result
    }

    /// Queues a one-shot actor initializer, run after all plugin initializers
    /// in registration order.
    pub fn add_actor(
        &self,
        actor: impl FnOnce(&ActorContext) -> NucleusResult<()> + 'static,
    ) -> NucleusResult<()> {
        self.handle
            .upgrade()?
            .borrow_mut()
            .queue_actor(Box::new(actor));
        Ok(())
    }

    /// Queues a one-shot report initializer, run after all actors in
    /// registration order.
    pub fn add_report(
        &self,
        report: impl FnOnce(&ReportContext) -> NucleusResult<()> + 'static,
    ) -> NucleusResult<()> {
        self.handle
            .upgrade()?
            .borrow_mut()
            .queue_report(Box::new(report));
        Ok(())
    }

    /// Schedules `callback` to run at simulation time `time`.
    pub fn add_plan(
        &self,
        time: f64,
        callback: impl FnOnce(&ActorContext) -> NucleusResult<()> + 'static,
    ) -> NucleusResult<()> {
        self.handle.add_plan(time, None, Box::new(callback))
    }

    /// Schedules a keyed plan that can later be canceled by key.
    pub fn add_keyed_plan(
        &self,
        time: f64,
        key: impl Into<String>,
        callback: impl FnOnce(&ActorContext) -> NucleusResult<()> + 'static,
    ) -> NucleusResult<()> {
        self.handle
            .add_plan(time, Some(key.into()), Box::new(callback))
    }

    /// Cancels a pending keyed plan scheduled earlier in initialization.
    pub fn cancel_plan(&self, key: &str) -> NucleusResult<bool> {
        self.handle.cancel_plan(key)
    }

    /// Subscribes `handler` to every released event of type `E`. Handlers
    /// fire after initialization, so they receive an [`ActorContext`].
    pub fn subscribe<E: SimulationEvent>(
        &self,
        handler: impl Fn(&ActorContext, &E) -> NucleusResult<()> + 'static,
    ) -> NucleusResult<SubscriptionId> {
        self.handle
            .subscribe_typed(None, move |handle: &KernelHandle, event: &E| {
                handler(&ActorContext::from_handle(handle.clone()), event)
            })
    }
}
