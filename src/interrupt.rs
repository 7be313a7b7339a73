use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, Thread};

/// A sticky interruption flag for backoff waits.
///
/// Hand clones to whoever may cancel the `*_interruptible` operations; the
/// operations themselves may run on any thread. Interrupting sets the flag
/// and wakes every thread currently parked in a backoff wait on this token.
/// Nothing clears the flag except [`Interrupt::clear`], so a caller that got
/// [`StackError::InterruptedWait`](crate::StackError::InterruptedWait) can
/// still observe why.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    waiters: Mutex<Vec<Thread>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        for waiter in self.waiters().iter() {
            waiter.unpark();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resets the flag, returning whether it was set.
    pub fn clear(&self) -> bool {
        self.inner.flag.swap(false, Ordering::AcqRel)
    }

    /// Makes the calling thread wakeable by [`interrupt`](Self::interrupt)
    /// until the guard drops. Check the flag only after registering, or a
    /// concurrent interrupt can be missed.
    pub(crate) fn register(&self) -> Registration<'_> {
        self.waiters().push(thread::current());
        Registration { interrupt: self }
    }

    fn waiters(&self) -> MutexGuard<'_, Vec<Thread>> {
        // the list stays consistent even if a holder panicked
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.waiters().len()
    }
}

pub(crate) struct Registration<'a> {
    interrupt: &'a Interrupt,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let id = thread::current().id();
        let mut waiters = self.interrupt.waiters();
        if let Some(pos) = waiters.iter().position(|t| t.id() == id) {
            waiters.swap_remove(pos);
        }
    }
}
