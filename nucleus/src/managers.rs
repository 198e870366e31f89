//! Data managers: long-lived, stateful, type-keyed simulation services.

use std::{
    any::{Any, TypeId, type_name},
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
};

use crate::{
    context::DataManagerContext,
    error::{NucleusError, NucleusResult},
};

/// A stateful per-simulation service registered by a plugin.
///
/// A data manager is registered under exactly one concrete type key and is
/// retrievable by that type from any context once its owning plugin's
/// initializer has run. `init` is invoked immediately at registration with a
/// context bound to the in-progress simulation, so a manager can schedule
/// plans, subscribe to events, and retrieve managers registered by
/// earlier-ordered plugins.
pub trait DataManager: Any {
    /// Called once at registration.
    fn init(&mut self, ctx: &DataManagerContext) -> NucleusResult<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Type-keyed registry of data managers.
///
/// Each entry is an `Rc<RefCell<T>>` erased to `Rc<dyn Any>`; retrieval
/// downcasts back to the concrete type. Managers are shared within a single
/// simulation thread only, so `Rc` is deliberate.
pub(crate) struct DataManagerRegistry {
    entries: HashMap<TypeId, Rc<dyn Any>>,
}

impl DataManagerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers a manager under its concrete type, rejecting duplicates.
    pub(crate) fn insert<T: DataManager>(
        &mut self,
        manager: T,
    ) -> NucleusResult<Rc<RefCell<T>>> {
        let key = TypeId::of::<T>();
        if self.entries.contains_key(&key) {
            return Err(NucleusError::DuplicateDataManager {
                type_name: type_name::<T>(),
            });
        }
        let cell = Rc::new(RefCell::new(manager));
        self.entries.insert(key, cell.clone());
        Ok(cell)
    }

    /// Retrieves the manager registered under `T`.
    pub(crate) fn get<T: DataManager>(&self) -> NucleusResult<Rc<RefCell<T>>> {
        let entry = self
            .entries
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or(NucleusError::UnknownDataManager {
                type_name: type_name::<T>(),
            })?;
        entry
            .downcast::<RefCell<T>>()
            .map_err(|_| NucleusError::UnknownDataManager {
                type_name: type_name::<T>(),
            })
    }
}
