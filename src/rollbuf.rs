//! Bounded shift-FIFO buffers used for every inter-stage hand-off.
//!
//! [`RollBuffer`] is the plain primitive: a fixed-capacity FIFO that, when
//! full, shifts its oldest elements out to make room. [`SyncRollBuffer`]
//! wraps it with a mutex, a condition variable and a two-bit reset/cancel
//! status so a producer can feed a consumer that blocks for a minimum fill.
//! Producers never block; on over-run the oldest data is dropped and logged.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Fixed-capacity FIFO that shifts in place when full.
///
/// Elements are stored oldest-first. `append` keeps at most the newest
/// `capacity` elements ever seen; `shift(n)` drops the oldest `n`.
#[derive(Debug)]
pub struct RollBuffer<T> {
    buf: Vec<T>,
    capacity: usize,
}

impl<T: Clone> RollBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "roll buffer capacity must be at least 1");
        RollBuffer { buf: Vec::with_capacity(capacity), capacity }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Valid elements, oldest first.
    pub fn get(&self) -> &[T] {
        &self.buf
    }

    /// Appends `xs`, shifting existing elements out as needed. When `xs`
    /// alone exceeds the capacity only its tail is kept. Returns how many
    /// elements were shifted out (0 = no over-run).
    pub fn append(&mut self, xs: &[T]) -> usize {
        if xs.len() >= self.capacity {
            let dropped = self.buf.len() + xs.len() - self.capacity;
            self.buf.clear();
            self.buf.extend_from_slice(&xs[xs.len() - self.capacity..]);
            dropped
        } else {
            let overflow = (self.buf.len() + xs.len()).saturating_sub(self.capacity);
            self.buf.drain(..overflow);
            self.buf.extend_from_slice(xs);
            overflow
        }
    }

    /// Single-element form of [`RollBuffer::append`].
    pub fn append_one(&mut self, x: T) -> usize {
        if self.buf.len() == self.capacity {
            self.buf.remove(0);
            self.buf.push(x);
            1
        } else {
            self.buf.push(x);
            0
        }
    }

    /// Drops the oldest `n` elements; `n >= len` clears, `n == 0` is a no-op.
    pub fn shift(&mut self, n: usize) {
        if n >= self.buf.len() {
            self.buf.clear();
        } else {
            self.buf.drain(..n);
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Reset/cancel bits observed by both ends of a [`SyncRollBuffer`].
///
/// `cancel` is monotonic: once set it stays set until teardown. `reset` is
/// one-shot and cleared by the consumer through
/// [`RollGuard::release_and_signal`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub cancel: bool,
    pub reset: bool,
}

impl Status {
    pub fn flagged(&self) -> bool {
        self.cancel || self.reset
    }
}

#[derive(Debug)]
struct Inner<T> {
    buf: RollBuffer<T>,
    status: Status,
}

/// Single-producer / single-consumer roll buffer with wait-for-N semantics.
#[derive(Debug)]
pub struct SyncRollBuffer<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    broadcast: bool,
}

impl<T: Clone> SyncRollBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, false)
    }

    /// Like [`SyncRollBuffer::new`] but waking every waiter on each signal.
    pub fn new_broadcast(capacity: usize) -> Self {
        Self::with_policy(capacity, true)
    }

    fn with_policy(capacity: usize, broadcast: bool) -> Self {
        SyncRollBuffer {
            inner: Mutex::new(Inner { buf: RollBuffer::new(capacity), status: Status::default() }),
            ready: Condvar::new(),
            broadcast,
        }
    }

    // A poisoned mutex only means another thread panicked mid-update of
    // plain data; the buffer stays usable and these operations stay total.
    fn lock_inner(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        if self.broadcast {
            self.ready.notify_all();
        } else {
            self.ready.notify_one();
        }
    }

    /// Appends under the lock, then signals and yields. Never blocks; on
    /// over-run the oldest elements are dropped and counted in the return.
    pub fn append(&self, xs: &[T]) -> usize {
        let dropped = self.lock_inner().buf.append(xs);
        if dropped > 0 {
            log::warn!("roll-buffer overrun: dropped {} elements", dropped);
        }
        self.notify();
        thread::yield_now();
        dropped
    }

    pub fn append_one(&self, x: T) -> usize {
        let dropped = self.lock_inner().buf.append_one(x);
        if dropped > 0 {
            log::warn!("roll-buffer overrun: dropped {} elements", dropped);
        }
        self.notify();
        thread::yield_now();
        dropped
    }

    /// Blocks until at least `n` elements are buffered or a status bit is
    /// raised, then returns the locked handle.
    pub fn wait_at_least(&self, n: usize) -> RollGuard<'_, T> {
        let mut inner = self.lock_inner();
        while inner.buf.len() < n && !inner.status.flagged() {
            inner = self.ready.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        RollGuard { inner, owner: self }
    }

    /// Blocks until anything is buffered or a status bit is raised.
    pub fn wait_any(&self) -> RollGuard<'_, T> {
        self.wait_at_least(1)
    }

    /// Locks without waiting.
    pub fn lock(&self) -> RollGuard<'_, T> {
        RollGuard { inner: self.lock_inner(), owner: self }
    }

    /// Raises `reset`, discards buffered data and wakes waiters.
    pub fn reset(&self) {
        {
            let mut inner = self.lock_inner();
            inner.status.reset = true;
            inner.buf.reset();
        }
        self.notify();
    }

    /// Raises `cancel` and wakes waiters. Buffered data is kept; producers
    /// must stop appending once they observe the flag.
    pub fn cancel(&self) {
        self.lock_inner().status.cancel = true;
        self.notify();
    }

    pub fn status(&self) -> Status {
        self.lock_inner().status
    }

    pub fn len(&self) -> usize {
        self.lock_inner().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes the consumer without touching the buffer. Used by producers
    /// that batched several guarded appends and signal once at the end.
    pub fn signal(&self) {
        self.notify();
    }
}

/// Locked view of a [`SyncRollBuffer`], handed out by the wait/lock calls.
///
/// Dropping the guard (or calling [`RollGuard::release`]) just unlocks;
/// [`RollGuard::release_and_signal`] additionally acknowledges a pending
/// reset and wakes the other side. Holding a guard across blocking I/O
/// deadlocks the pipeline.
pub struct RollGuard<'a, T> {
    inner: MutexGuard<'a, Inner<T>>,
    owner: &'a SyncRollBuffer<T>,
}

impl<'a, T: Clone> RollGuard<'a, T> {
    pub fn get(&self) -> &[T] {
        self.inner.buf.get()
    }

    pub fn len(&self) -> usize {
        self.inner.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buf.is_empty()
    }

    pub fn status(&self) -> Status {
        self.inner.status
    }

    pub fn append(&mut self, xs: &[T]) -> usize {
        self.inner.buf.append(xs)
    }

    pub fn append_one(&mut self, x: T) -> usize {
        self.inner.buf.append_one(x)
    }

    pub fn shift(&mut self, n: usize) {
        self.inner.buf.shift(n);
    }

    pub fn reset(&mut self) {
        self.inner.buf.reset();
    }

    /// Unlocks.
    pub fn release(self) {}

    /// Acknowledges a pending reset (cancel stays up), unlocks, signals.
    pub fn release_and_signal(self) {
        let RollGuard { mut inner, owner } = self;
        inner.status.reset = false;
        drop(inner);
        owner.notify();
    }
}
