use crate::{AtomicSlot, Backoff, BackoffConfig, ConfigError, Interrupt, PushError, StackError};
use alloc::alloc::{alloc, dealloc, handle_alloc_error};
use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicUsize, Ordering};
use haphazard::{Domain, HazardPointer, Singleton};

pub(crate) struct Node<V> {
    val: V,
    next: AtomicSlot<Self>,
}

impl<V> Node<V> {
    /// Hands the value back if the allocator refuses.
    fn new(val: V) -> Result<NonNull<Self>, V> {
        let raw = unsafe { alloc(Self::layout()) }.cast::<Self>();

        match NonNull::new(raw) {
            Some(node) => {
                unsafe {
                    ptr::write(
                        node.as_ptr(),
                        Node {
                            val,
                            next: AtomicSlot::null(),
                        },
                    );
                }
                Ok(node)
            }
            None => Err(val),
        }
    }

    fn layout() -> Layout {
        Layout::new::<Self>()
    }

    unsafe fn dealloc(raw: *mut Self) {
        dealloc(raw.cast(), Self::layout());
    }

    unsafe fn drop(raw: *mut Self) {
        ptr::drop_in_place(&mut (*raw).val);
        Self::dealloc(raw);
    }

    /// Moves the value out and frees the node. Only for nodes this thread
    /// owns exclusively.
    unsafe fn into_val(raw: *mut Self) -> V {
        let val = ptr::read(&(*raw).val);
        Self::dealloc(raw);
        val
    }
}

struct NodeFamily;

unsafe impl Singleton for NodeFamily {}

static NODES: Domain<NodeFamily> = Domain::new(&NodeFamily);

/// A lock free LIFO stack.
///
/// `push` and `pop` each take effect at the instant their CAS on the head
/// succeeds. Lost races are retried after a delay chosen by the stack's
/// [`Backoff`]. Every successful push and pop bumps
/// [`operation_count`](Self::operation_count) exactly once.
pub struct Stack<V> {
    head: AtomicSlot<Node<V>>,
    len: AtomicUsize,
    ops: AtomicUsize,
    backoff: Backoff,
    _owns: PhantomData<*mut V>,
}

// Values only ever cross threads by move, so `V: Sync` is not needed.
unsafe impl<V: Send> Send for Stack<V> {}
unsafe impl<V: Send> Sync for Stack<V> {}

impl<V> Stack<V> {
    pub fn new() -> Self {
        Stack {
            head: AtomicSlot::null(),
            len: AtomicUsize::new(0),
            ops: AtomicUsize::new(0),
            backoff: Backoff::default(),
            _owns: PhantomData,
        }
    }

    pub fn with_backoff(config: BackoffConfig) -> Result<Self, ConfigError> {
        Ok(Stack {
            head: AtomicSlot::null(),
            len: AtomicUsize::new(0),
            ops: AtomicUsize::new(0),
            backoff: Backoff::new(config)?,
            _owns: PhantomData,
        })
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Number of pushes and pops completed so far.
    pub fn operation_count(&self) -> usize {
        self.ops.load(Ordering::Relaxed)
    }

    /// Depth of the stack. Exact once concurrent operations have finished,
    /// approximate while they are in flight.
    pub fn len(&self) -> usize {
        let len = self.len.load(Ordering::Relaxed);
        // a pop may decrement before the matching push incremented
        if len > isize::MAX as usize {
            0
        } else {
            len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load_ptr().is_null()
    }
}

impl<V> Stack<V>
where
    V: Send + 'static,
{
    /// Pushes `val` on top of the stack.
    ///
    /// Like `Box::new`, aborts through [`handle_alloc_error`] if no memory is
    /// left for the node; use [`try_push`](Self::try_push) to observe that
    /// instead.
    pub fn push(&self, val: V) {
        if let Err(err) = self.push_with(val, None) {
            debug_assert!(matches!(err.error, StackError::AllocationFailure { .. }));
            handle_alloc_error(Node::<V>::layout());
        }
    }

    /// Pushes `val`, returning it with [`StackError::AllocationFailure`] if
    /// the node cannot be allocated.
    pub fn try_push(&self, val: V) -> Result<(), PushError<V>> {
        self.push_with(val, None)
    }

    /// Like [`try_push`](Self::try_push), but gives up with
    /// [`StackError::InterruptedWait`] if `interrupt` fires while backing off.
    pub fn push_interruptible(&self, val: V, interrupt: &Interrupt) -> Result<(), PushError<V>> {
        self.push_with(val, Some(interrupt))
    }

    fn push_with(&self, val: V, interrupt: Option<&Interrupt>) -> Result<(), PushError<V>> {
        let node = Node::new(val).map_err(|val| {
            PushError::new(
                val,
                StackError::AllocationFailure {
                    size: Node::<V>::layout().size(),
                },
            )
        })?;

        let mut failures = 0u32;

        loop {
            let head_ptr = self.head.load_ptr();

            // not yet published, nobody else can see the node
            unsafe { node.as_ref() }.next.store_ptr(head_ptr);

            let res = if lose_race() {
                Err(head_ptr)
            } else {
                self.head.compare_exchange(
                    head_ptr,
                    node.as_ptr(),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
            };

            match res {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    self.ops.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(_) => {
                    if let Err(error) = self.backoff.wait(failures, interrupt) {
                        let val = unsafe { Node::into_val(node.as_ptr()) };
                        return Err(PushError::new(val, error));
                    }
                    failures = failures.saturating_add(1);
                }
            }
        }
    }

    /// Removes and returns the top element, or [`StackError::EmptyStack`] if
    /// there was none when the head was read.
    pub fn pop(&self) -> Result<V, StackError> {
        self.pop_with(None)
    }

    /// Like [`pop`](Self::pop), but gives up with
    /// [`StackError::InterruptedWait`] if `interrupt` fires while backing off.
    pub fn pop_interruptible(&self, interrupt: &Interrupt) -> Result<V, StackError> {
        self.pop_with(Some(interrupt))
    }

    fn pop_with(&self, interrupt: Option<&Interrupt>) -> Result<V, StackError> {
        let mut hazard = HazardPointer::new_in_domain(&NODES);
        let mut failures = 0u32;

        loop {
            let old_head = protect(&self.head, &mut hazard).ok_or(StackError::EmptyStack)?;

            // protected, so the node is not freed even if it was popped
            // meanwhile; a stale `next` only feeds a CAS that then fails
            let next_ptr = unsafe { old_head.as_ref() }.next.load_ptr();

            let res = if lose_race() {
                Err(old_head.as_ptr())
            } else {
                self.head.compare_exchange(
                    old_head.as_ptr(),
                    next_ptr,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
            };

            match res {
                Ok(_) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    self.ops.fetch_add(1, Ordering::Relaxed);

                    // the successful CAS made us the only reader of `val`
                    let val = unsafe { ptr::read(&old_head.as_ref().val) };

                    hazard.reset_protection();
                    unsafe {
                        NODES.retire_ptr::<_, Unlinked<_>>(old_head.as_ptr());
                    }

                    return Ok(val);
                }
                Err(_) => {
                    self.backoff.wait(failures, interrupt)?;
                    failures = failures.saturating_add(1);
                }
            }
        }
    }

    /// Moves every element of `other` on top of this stack, keeping their
    /// order, with a single CAS. Counts as one push per moved element.
    pub fn append(&self, mut other: Self) {
        let new_head = other.head.take();
        if new_head.is_null() {
            return;
        }

        let mut moved = 1;
        let mut tail = new_head;
        unsafe {
            while !(*tail).next.load_ptr().is_null() {
                tail = (*tail).next.load_ptr();
                moved += 1;
            }
        }

        let mut failures = 0u32;
        let mut old_head = self.head.load_ptr();

        loop {
            unsafe {
                (*tail).next.store_ptr(old_head);
            }

            match self.head.compare_exchange(
                old_head,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(now) => {
                    // the chain is still private, so there is nothing an
                    // interrupt could hand back
                    self.backoff.wait_uninterruptible(failures);
                    failures = failures.saturating_add(1);
                    old_head = now;
                }
            }
        }

        self.len.fetch_add(moved, Ordering::Relaxed);
        self.ops.fetch_add(moved, Ordering::Relaxed);

        tracing::debug!(moved, failures, "appended chain");
    }
}

#[cfg(test)]
thread_local! {
    static LOST_RACES: core::cell::Cell<u32> = core::cell::Cell::new(0);
}

/// Makes the calling thread's next `n` push or pop CAS attempts lose.
#[cfg(test)]
fn lose_next_races(n: u32) {
    LOST_RACES.with(|races| races.set(n));
}

#[cfg(test)]
fn lose_race() -> bool {
    LOST_RACES.with(|races| match races.get() {
        0 => false,
        n => {
            races.set(n - 1);
            true
        }
    })
}

#[cfg(not(test))]
#[inline(always)]
fn lose_race() -> bool {
    false
}

/// Publishes a hazard for the pointer currently in `slot`, retrying until the
/// slot is seen unchanged after the hazard became visible.
fn protect<V>(
    slot: &AtomicSlot<Node<V>>,
    hazard: &mut HazardPointer<'static, NodeFamily>,
) -> Option<NonNull<Node<V>>> {
    let mut ptr = slot.load_ptr();

    loop {
        hazard.protect_raw(ptr);
        fence(Ordering::SeqCst);

        let now = slot.load_ptr();
        if ptr::eq(ptr, now) {
            return NonNull::new(ptr);
        }
        ptr = now;
    }
}

impl<V> Default for Stack<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Stack<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("len", &self.len())
            .field("operation_count", &self.operation_count())
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<V> Drop for Stack<V> {
    fn drop(&mut self) {
        let mut curr = self.head.take();

        unsafe {
            while !curr.is_null() {
                let next = (*curr).next.take();
                Node::drop(curr);
                curr = next;
            }
        }

        NODES.eager_reclaim();
    }
}

/// A popped node awaiting reclamation. Its value has already been moved out,
/// so reclaiming only frees the memory.
#[repr(transparent)]
struct Unlinked<V>(NonNull<Node<V>>);

impl<V> Drop for Unlinked<V> {
    fn drop(&mut self) {
        unsafe {
            Node::dealloc(self.0.as_ptr());
        }
    }
}

impl<V> core::ops::Deref for Unlinked<V> {
    type Target = Node<V>;
    fn deref(&self) -> &Self::Target {
        unsafe { self.0.as_ref() }
    }
}

unsafe impl<V> haphazard::raw::Pointer<Node<V>> for Unlinked<V> {
    fn into_raw(self) -> *mut Node<V> {
        let raw = self.0.as_ptr();
        core::mem::forget(self);
        raw
    }

    unsafe fn from_raw(ptr: *mut Node<V>) -> Self {
        Self(NonNull::new_unchecked(ptr))
    }
}

/// Owned iterator popping from the top. No hazards are needed: the stack is
/// exclusively owned.
pub struct IntoIter<V> {
    stack: Stack<V>,
}

impl<V> Iterator for IntoIter<V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        let head = self.stack.head.take();
        if head.is_null() {
            return None;
        }

        unsafe {
            let next = (*head).next.take();
            self.stack.head.store_ptr(next);
            let len = self.stack.len.get_mut();
            *len = len.wrapping_sub(1);
            Some(Node::into_val(head))
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.stack.len();
        (len, Some(len))
    }
}

impl<V> ExactSizeIterator for IntoIter<V> {}

impl<V> IntoIterator for Stack<V> {
    type Item = V;
    type IntoIter = IntoIter<V>;

    fn into_iter(self) -> IntoIter<V> {
        IntoIter { stack: self }
    }
}

impl<V> FromIterator<V> for Stack<V>
where
    V: Send + 'static,
{
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        let stack = Stack::new();
        iter.into_iter().for_each(|val| stack.push(val));
        stack
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_new_node() {
        let node = Node::new(1).unwrap();

        unsafe {
            assert_eq!(Node::into_val(node.as_ptr()), 1);
        }
    }

    #[test]
    fn test_push_pop() {
        let stack = Stack::new();

        stack.push(1);

        assert_eq!(stack.len(), 1);
        assert_eq!(stack.pop(), Ok(1));
        assert_eq!(stack.pop(), Err(StackError::EmptyStack));
        assert_eq!(stack.operation_count(), 2);
    }

    #[test]
    fn test_lifo() {
        let stack = Stack::new();

        stack.push('a');
        stack.push('b');
        stack.push('c');

        assert_eq!(stack.pop(), Ok('c'));
        assert_eq!(stack.pop(), Ok('b'));
        assert_eq!(stack.pop(), Ok('a'));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_empty_pop_not_counted() {
        let stack = Stack::<u8>::new();

        for _ in 0..5 {
            assert_eq!(stack.pop(), Err(StackError::EmptyStack));
        }

        assert_eq!(stack.operation_count(), 0);
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_try_push() {
        let stack = Stack::new();

        assert!(stack.try_push(String::from("x")).is_ok());
        assert_eq!(stack.pop().as_deref(), Ok("x"));
    }

    #[test]
    fn test_interrupt_only_seen_while_waiting() {
        let stack = Stack::new();
        let interrupt = Interrupt::new();
        interrupt.interrupt();

        assert!(stack.push_interruptible(7, &interrupt).is_ok());
        assert_eq!(stack.pop_interruptible(&interrupt), Ok(7));
        assert_eq!(
            stack.pop_interruptible(&interrupt),
            Err(StackError::EmptyStack)
        );
        assert!(interrupt.is_interrupted());
    }

    #[test]
    fn test_retries_after_lost_races() {
        let stack = Stack::with_backoff(BackoffConfig::low_latency()).unwrap();
        let interrupt = Interrupt::new();

        lose_next_races(3);
        assert!(stack.push_interruptible(1, &interrupt).is_ok());

        lose_next_races(3);
        stack.push(2);

        lose_next_races(3);
        assert_eq!(stack.pop_interruptible(&interrupt), Ok(2));

        assert_eq!(stack.operation_count(), 3);
        assert_eq!(stack.len(), 1);
        assert!(!interrupt.is_interrupted());
    }

    #[test]
    fn test_interrupted_push_returns_value() {
        let stack = Stack::with_backoff(BackoffConfig::low_latency()).unwrap();
        stack.push(String::from("below"));

        let interrupt = Interrupt::new();
        interrupt.interrupt();

        lose_next_races(1);
        let err = stack
            .push_interruptible(String::from("kept"), &interrupt)
            .unwrap_err();

        assert_eq!(err.error, StackError::InterruptedWait);
        assert_eq!(err.into_inner(), "kept");
        assert!(interrupt.is_interrupted());

        assert_eq!(stack.len(), 1);
        assert_eq!(stack.operation_count(), 1);
        assert_eq!(stack.pop().as_deref(), Ok("below"));
    }

    #[test]
    fn test_interrupted_push_drops_nothing_twice() {
        let counter = Arc::new(());
        let stack = Stack::with_backoff(BackoffConfig::low_latency()).unwrap();
        let interrupt = Interrupt::new();
        interrupt.interrupt();

        lose_next_races(1);
        let returned = stack
            .push_interruptible(counter.clone(), &interrupt)
            .unwrap_err()
            .into_inner();

        assert_eq!(Arc::strong_count(&counter), 2);
        drop(returned);
        assert_eq!(Arc::strong_count(&counter), 1);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_interrupted_pop_leaves_value_linked() {
        let stack = Stack::with_backoff(BackoffConfig::low_latency()).unwrap();
        stack.push(5);

        let interrupt = Interrupt::new();
        interrupt.interrupt();

        lose_next_races(1);
        assert_eq!(
            stack.pop_interruptible(&interrupt),
            Err(StackError::InterruptedWait)
        );
        assert!(interrupt.is_interrupted());

        assert_eq!(stack.len(), 1);
        assert_eq!(stack.operation_count(), 1);

        assert!(interrupt.clear());
        assert_eq!(stack.pop_interruptible(&interrupt), Ok(5));
    }

    #[test]
    fn test_interrupt_from_other_thread_during_push() {
        let stack = Arc::new(
            Stack::with_backoff(
                BackoffConfig::default()
                    .with_min_delay(Duration::from_secs(30))
                    .with_max_delay(Duration::from_secs(60)),
            )
            .unwrap(),
        );
        let interrupt = Interrupt::new();

        let pusher = {
            let stack = stack.clone();
            let interrupt = interrupt.clone();
            thread::spawn(move || {
                lose_next_races(1);
                let start = Instant::now();
                let res = stack.push_interruptible(9, &interrupt);
                (res.map_err(|err| (err.error, err.into_inner())), start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        interrupt.interrupt();

        let (res, elapsed) = pusher.join().unwrap();
        assert_eq!(res, Err((StackError::InterruptedWait, 9)));
        assert!(elapsed < Duration::from_secs(10), "woke after {elapsed:?}");
        assert!(stack.is_empty());
    }

    #[test]
    fn test_drop_releases_values() {
        let counter = Arc::new(());

        {
            let stack = Stack::new();
            for _ in 0..10 {
                stack.push(counter.clone());
            }
            drop(stack.pop());
            assert_eq!(Arc::strong_count(&counter), 10);
        }

        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn test_popped_value_outlives_node() {
        let stack = Stack::new();
        stack.push(vec![1, 2, 3]);

        let val = stack.pop().unwrap();
        NODES.eager_reclaim();

        assert_eq!(val, vec![1, 2, 3]);
    }

    #[test]
    fn test_push_pop_sync() {
        let stack = Arc::new(Stack::with_backoff(BackoffConfig::low_latency()).unwrap());

        let mut threads = vec![];

        for i in 0..10 {
            let stack = stack.clone();

            threads.push(thread::spawn(move || {
                let mut pushed = 0;
                let mut popped = 0;
                for _ in 0..1_000 {
                    if rand::random::<u8>() % 3 != 0 {
                        stack.push(i);
                        pushed += 1;
                    } else if stack.pop().is_ok() {
                        popped += 1;
                    }
                }
                (pushed, popped)
            }))
        }

        let (pushed, popped) = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .fold((0, 0), |(a, b), (c, d)| (a + c, b + d));

        assert_eq!(stack.operation_count(), pushed + popped);
        assert_eq!(stack.len(), pushed - popped);

        let stack = Arc::try_unwrap(stack).unwrap();
        assert_eq!(stack.into_iter().count(), pushed - popped);
    }

    #[test]
    fn test_append() {
        let expected = vec![2, 3, 7, 2, 0, 0, 3, 4, 2, 5];

        let stack = Stack::new();

        expected[expected.len() / 2..]
            .iter()
            .rev()
            .for_each(|&e| stack.push(e));

        let other = Stack::new();

        expected[..expected.len() / 2]
            .iter()
            .rev()
            .for_each(|&e| other.push(e));

        stack.append(other);

        assert_eq!(stack.len(), expected.len());
        assert_eq!(stack.operation_count(), 10);

        let actual: Vec<i32> = stack.into_iter().collect();

        assert_eq!(expected, actual);
    }

    #[test]
    fn test_append_empty() {
        let stack = Stack::new();
        stack.push(1);

        stack.append(Stack::new());

        assert_eq!(stack.len(), 1);
        assert_eq!(stack.operation_count(), 1);
    }

    #[test]
    fn test_append_concurrent() {
        let stack = Arc::new(Stack::with_backoff(BackoffConfig::low_latency()).unwrap());

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let stack = stack.clone();
                thread::spawn(move || {
                    for round in 0..50 {
                        let other: Stack<_> = (0..4).map(|i| (t, round, i)).collect();
                        stack.append(other);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(stack.len(), 8 * 50 * 4);

        let stack = Arc::try_unwrap(stack).unwrap();
        let all: Vec<_> = stack.into_iter().collect();
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());

        // every appended chunk stays contiguous and in order
        for chunk in all.chunks(4) {
            let (t, round, _) = chunk[0];
            let expected: Vec<_> = (0..4).rev().map(|i| (t, round, i)).collect();
            assert_eq!(chunk, expected.as_slice());
        }
    }

    #[test]
    fn test_from_iter_order() {
        let stack: Stack<_> = (1..=4).collect();

        assert_eq!(stack.len(), 4);
        assert_eq!(stack.into_iter().collect::<Vec<_>>(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_into_iter_drop_partial() {
        let counter = Arc::new(());
        let stack: Stack<_> = (0..6).map(|_| counter.clone()).collect();

        let mut iter = stack.into_iter();
        assert_eq!(iter.len(), 6);
        drop(iter.next());
        assert_eq!(iter.len(), 5);
        drop(iter);

        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
