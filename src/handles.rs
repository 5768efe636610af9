//! Resource handle management.
//!
//! Opaque string tokens name host-side resources whose lifetime matches
//! neither the guest's nor the host's collector: per-actor storage, queue
//! messages and batches. One [`HandleTable`] is built per resource type.

use crate::error::BridgeError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

/// Opaque handle token
pub type Handle = String;

/// Table of live handles for one resource type
pub struct HandleTable<T> {
    /// Monotonic allocation counter, never reset
    next: AtomicU64,
    /// Live resources by handle
    entries: DashMap<Handle, T>,
    /// Total handles released
    released: AtomicU64,
}

impl<T> HandleTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: DashMap::new(),
            released: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh token; never reused within the table's lifetime
    pub fn allocate(&self, prefix: &str) -> Handle {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}:{}:{}", prefix, n, &suffix[..8])
    }

    /// Bind a resource to an allocated handle
    pub fn register(&self, handle: &str, resource: T) -> Result<(), BridgeError> {
        check_handle(handle)?;
        if self.entries.contains_key(handle) {
            return Err(BridgeError::internal_error(format!(
                "Handle '{}' is already registered",
                handle
            )));
        }
        self.entries.insert(handle.to_string(), resource);
        debug!(handle = %handle, "Registered handle");
        Ok(())
    }

    /// Allocate and register in one step
    pub fn insert(&self, prefix: &str, resource: T) -> Handle {
        let handle = self.allocate(prefix);
        self.entries.insert(handle.clone(), resource);
        debug!(handle = %handle, "Registered handle");
        handle
    }

    /// Run `f` against the live resource
    pub fn with<R>(&self, handle: &str, f: impl FnOnce(&mut T) -> R) -> Result<R, BridgeError> {
        check_handle(handle)?;
        let mut entry = self
            .entries
            .get_mut(handle)
            .ok_or_else(|| BridgeError::handle_not_active(handle))?;
        Ok(f(entry.value_mut()))
    }

    /// Drop a handle, returning its resource if it was live
    pub fn release(&self, handle: &str) -> Option<T> {
        let removed = self.entries.remove(handle).map(|(_, resource)| resource);
        if removed.is_some() {
            self.released.fetch_add(1, Ordering::Relaxed);
            debug!(handle = %handle, "Released handle");
        }
        removed
    }

    /// Whether a handle is live
    pub fn contains(&self, handle: &str) -> bool {
        self.entries.contains_key(handle)
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handles are live
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total handles allocated so far
    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }

    /// Total handles released so far
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

impl<T: Clone> HandleTable<T> {
    /// Look up a live resource
    pub fn lookup(&self, handle: &str) -> Result<T, BridgeError> {
        self.with(handle, |resource| resource.clone())
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_handle(handle: &str) -> Result<(), BridgeError> {
    if handle.trim().is_empty() {
        return Err(BridgeError::handle_malformed());
    }
    Ok(())
}
