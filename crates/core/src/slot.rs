//! Single-slot shared resource cell.
//!
//! A [`ResourceSlot`] holds at most one fully constructed value. The owner
//! fills it with [`try_set`](ResourceSlot::try_set) after construction and
//! empties it with [`take`](ResourceSlot::take) during shutdown; everyone else
//! only reads a shared `Arc` through [`get`](ResourceSlot::get).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Optional, atomically swappable, shared handle.
pub struct ResourceSlot<T> {
    name: &'static str,
    inner: Mutex<Option<Arc<T>>>,
}

impl<T> ResourceSlot<T> {
    /// Create an empty slot. `name` is used in logs.
    pub const fn empty(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Store `value` if the slot is empty.
    ///
    /// Returns the stored `Arc` on success. If another value is already
    /// present, the new value is handed back in `Err` together with the
    /// existing value so the caller can release what it just built.
    pub fn try_set(&self, value: T) -> Result<Arc<T>, (T, Arc<T>)> {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some(existing) => Err((value, Arc::clone(existing))),
            None => {
                let stored = Arc::new(value);
                *guard = Some(Arc::clone(&stored));
                Ok(stored)
            }
        }
    }

    /// Current value, if any.
    pub fn get(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }

    /// Clear the slot and return what it held.
    pub fn take(&self) -> Option<Arc<T>> {
        self.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    pub fn is_present(&self) -> bool {
        !self.is_empty()
    }

    // A panic while holding the guard cannot leave a half-written Option,
    // so a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> fmt::Debug for ResourceSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSlot")
            .field("name", &self.name)
            .field("present", &self.is_present())
            .finish()
    }
}
