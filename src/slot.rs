use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A nullable pointer that is only ever replaced atomically.
///
/// Used for the head of the stack and for every node's link to the node
/// below it.
#[repr(transparent)]
pub(crate) struct AtomicSlot<T> {
    ptr: AtomicPtr<T>,
}

impl<T> AtomicSlot<T> {
    pub(crate) const fn null() -> Self {
        AtomicSlot {
            ptr: AtomicPtr::new(null_mut()),
        }
    }

    pub(crate) fn load_ptr(&self) -> *mut T {
        self.ptr.load(Ordering::Acquire)
    }

    pub(crate) fn store_ptr(&self, ptr: *mut T) {
        self.ptr.store(ptr, Ordering::Relaxed);
    }

    /// On failure returns the pointer the slot held instead of `current`.
    pub(crate) fn compare_exchange(
        &self,
        current: *mut T,
        new: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut T, *mut T> {
        self.ptr.compare_exchange(current, new, success, failure)
    }

    /// Exclusive access, no synchronization needed.
    pub(crate) fn take(&mut self) -> *mut T {
        core::mem::replace(self.ptr.get_mut(), null_mut())
    }
}
