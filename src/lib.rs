//! A lock free LIFO stack.
//!
//! Both `push` and `pop` retry a single compare-and-swap on the head of the
//! stack. A caller that loses the race backs off for an exponentially
//! growing, jittered delay before trying again. Unlinked nodes are reclaimed
//! through hazard pointers, so a thread still reading a node that another
//! thread popped never touches freed memory.

mod backoff;
mod base;
mod error;
mod interrupt;
mod slot;

pub use backoff::{Backoff, BackoffConfig};
pub use base::{IntoIter, Stack};
pub use error::{ConfigError, PushError, StackError};
pub use interrupt::Interrupt;
pub(crate) use slot::AtomicSlot;

extern crate alloc;

#[cfg(feature = "arbitrary")]
#[derive(Clone, Debug)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum Operation<T> {
    Push { item: T },
    Pop,
    PopPush,
    Append { items: Vec<T> },
    Count,
}
