//! Handle management for layer-owned objects
//!
//! The application only ever sees opaque non-zero IDs for shadow swapchains.
//! `HandleTable` maps those IDs to the objects the layer owns, so nothing is
//! ever recovered by casting a handle back into a pointer.
//!
//! # Dispatchable handles (VkInstance, VkDevice, VkQueue)
//!
//! The loader stores a pointer to its dispatch table in the first
//! pointer-sized word of every dispatchable object. That pointer is identical
//! for every layer in the chain, which makes it the natural key for looking up
//! the next layer's function tables.

use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Loader dispatch-table pointer of a dispatchable handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DispatchKey(pub usize);

/// Read the dispatch key out of a dispatchable handle.
/// # Safety
/// `raw` must be a live dispatchable handle created through the loader.
pub unsafe fn dispatch_key(raw: u64) -> DispatchKey {
    DispatchKey(*(raw as usize as *const usize))
}

/// Table of layer-owned objects keyed by the IDs handed to the application.
///
/// Not synchronized on its own; the registry keeps it behind its lock.
pub struct HandleTable<T> {
    next_handle: u64,
    objects: FxHashMap<u64, Arc<T>>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            next_handle: 1, // 0 is VK_NULL_HANDLE
            objects: FxHashMap::default(),
        }
    }

    /// Store an object and issue a fresh handle for it
    pub fn insert(&mut self, object: Arc<T>) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(handle, object);
        handle
    }

    pub fn get(&self, handle: u64) -> Option<Arc<T>> {
        self.objects.get(&handle).cloned()
    }

    pub fn remove(&mut self, handle: u64) -> Option<Arc<T>> {
        self.objects.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
