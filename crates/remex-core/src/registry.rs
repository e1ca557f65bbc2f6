//! Object registry.
//!
//! Maps object handles to live instances and their reference counts. Every
//! operation is safe to call concurrently from many connection tasks; the
//! refcount of a handle is only ever changed while holding its map shard.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::descriptor::TypeDescriptor;
use crate::handle::ObjectHandle;
use crate::reflect::{Constructor, Instance, TypeEntry};
use crate::value::Value;

/// A borrowed view of one registered object.
#[derive(Clone)]
pub struct RegisteredObject {
    entry: Arc<TypeEntry>,
    instance: Arc<Mutex<Instance>>,
}

impl RegisteredObject {
    /// Catalog entry of the object's runtime type.
    pub fn type_entry(&self) -> &Arc<TypeEntry> {
        &self.entry
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        self.entry.descriptor()
    }

    /// Run `f` with exclusive access to the instance.
    pub fn with_instance<R>(&self, f: impl FnOnce(&mut (dyn Any + Send)) -> R) -> R {
        let mut guard = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_mut())
    }
}

impl std::fmt::Debug for RegisteredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredObject")
            .field("descriptor", self.descriptor())
            .finish_non_exhaustive()
    }
}

struct Slot {
    object: RegisteredObject,
    ref_count: usize,
}

/// What a `release` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The count dropped but references remain.
    Decremented(usize),
    /// The last reference was released and the entry removed.
    Removed,
    /// No entry existed for the handle.
    Missing,
}

/// Thread-safe handle-to-object table.
#[derive(Default)]
pub struct ObjectRegistry {
    entries: DashMap<ObjectHandle, Slot>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `constructor` of `entry` with already coerced arguments.
    ///
    /// Returns `None` when the constructor fails; the failure is logged, never
    /// propagated.
    pub fn create(
        &self,
        entry: &Arc<TypeEntry>,
        constructor: &Constructor,
        args: Vec<Value>,
    ) -> Option<ObjectHandle> {
        let type_name = entry.descriptor().to_string();

        match constructor.construct(&type_name, args) {
            Ok(instance) => Some(self.insert(Arc::clone(entry), instance)),
            Err(e) => {
                warn!("Failed to create {}: {}", type_name, e);
                None
            }
        }
    }

    /// Register an existing instance with a reference count of one.
    pub fn insert(&self, entry: Arc<TypeEntry>, instance: Instance) -> ObjectHandle {
        let object = RegisteredObject {
            entry,
            instance: Arc::new(Mutex::new(instance)),
        };
        loop {
            let handle = ObjectHandle::generate();
            if let Entry::Vacant(vacant) = self.entries.entry(handle) {
                debug!("Registered {} as {}", object.descriptor(), handle);
                vacant.insert(Slot {
                    object,
                    ref_count: 1,
                });
                return handle;
            }
        }
    }

    /// Look up an object without touching its reference count.
    pub fn get(&self, handle: ObjectHandle) -> Option<RegisteredObject> {
        self.entries.get(&handle).map(|slot| slot.object.clone())
    }

    /// Add a reference to an existing object, returning its type.
    pub fn retain(&self, handle: ObjectHandle) -> Option<TypeDescriptor> {
        let mut slot = self.entries.get_mut(&handle)?;
        slot.ref_count += 1;
        debug!("Retained {} (refs={})", handle, slot.ref_count);
        Some(slot.object.descriptor().clone())
    }

    /// Drop one reference; the entry is removed when none remain.
    ///
    /// Releasing an unknown handle is a no-op.
    pub fn release(&self, handle: ObjectHandle) -> ReleaseOutcome {
        match self.entries.entry(handle) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.ref_count = slot.ref_count.saturating_sub(1);
                if slot.ref_count == 0 {
                    occupied.remove();
                    debug!("Released last reference to {}", handle);
                    ReleaseOutcome::Removed
                } else {
                    ReleaseOutcome::Decremented(slot.ref_count)
                }
            }
            Entry::Vacant(_) => ReleaseOutcome::Missing,
        }
    }

    pub fn ref_count(&self, handle: ObjectHandle) -> Option<usize> {
        self.entries.get(&handle).map(|slot| slot.ref_count)
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
