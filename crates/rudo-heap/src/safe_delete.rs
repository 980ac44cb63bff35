//! Deferred destruction of shared metadata.
//!
//! GC threads may still be reading a page's metadata after the page has been
//! freed. While at least one such window is open, deletions are parked here
//! and performed when the last window closes.

use parking_lot::Mutex;

#[derive(Debug)]
struct Inner<T> {
    enabled: usize,
    deferred: Vec<T>,
}

/// Defers dropping values while readers may still see them.
#[derive(Debug)]
pub struct SafeDelete<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for SafeDelete<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SafeDelete<T> {
    /// Creates a deleter with deferral disabled.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                enabled: 0,
                deferred: Vec::new(),
            }),
        }
    }

    /// Opens a deferral window. Windows nest.
    pub fn enable_deferred_delete(&self) {
        self.inner.lock().enabled += 1;
    }

    /// Closes a deferral window, deleting everything parked once the last
    /// window closes.
    ///
    /// # Panics
    ///
    /// Panics if no window is open.
    pub fn disable_deferred_delete(&self) {
        let deferred = {
            let mut inner = self.inner.lock();
            assert!(inner.enabled > 0, "Unbalanced disable_deferred_delete");
            inner.enabled -= 1;
            if inner.enabled > 0 {
                return;
            }
            std::mem::take(&mut inner.deferred)
        };

        // Drop outside the lock
        drop(deferred);
    }

    /// Deletes `item` now, or parks it if a window is open.
    pub fn schedule_delete(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.enabled > 0 {
            inner.deferred.push(item);
        } else {
            drop(inner);
            drop(item);
        }
    }

    /// Number of parked deletions.
    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.inner.lock().deferred.len()
    }
}
