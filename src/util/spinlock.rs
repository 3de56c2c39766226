//! Module `spinlock` implement a read-write lock that spins instead of
//! parking the thread.
//!
//! The engine's shared state (the published file view, the live catalog,
//! the write-ahead-buffer) is held for a handful of instructions at a
//! time, short enough that paying for a futex wait is a net loss. The
//! lock keeps its whole state in one atomic word:
//!
//! * bit 63 - a writer is inside the critical section.
//! * bit 62 - the gate: a writer is waiting, new readers must hold off.
//! * bits 0..62 - count of readers inside the critical section.
//!
//! Readers enter optimistically: bump the count, and if the word turns
//! out to be gated, back out and spin until the gate lifts. A writer
//! closes the gate, drains the readers, flips the writer bit and has the
//! value to itself. Contention is counted and reported through
//! [Db::info][crate::Db::info], which makes latch pressure visible
//! without any feature flag.

use std::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering::SeqCst},
};

const WRITER: u64 = 1 << 63;
const GATE: u64 = 1 << 62;
const READERS: u64 = GATE - 1;

/// Read-write spinlock over a value of type `T`.
pub struct Spinlock<T> {
    word: AtomicU64,
    conflicts: AtomicU64,
    value: UnsafeCell<T>,
}

// the lock hands out &T and &mut T under the word's protocol, so it is
// as shareable as the value itself.
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send + Sync> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create a new lock over `value`.
    pub fn new(value: T) -> Spinlock<T> {
        Spinlock {
            word: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Enter the critical section for reading. Any number of readers can
    /// be inside at once.
    pub fn read(&self) -> ReadGuard<T> {
        loop {
            let word = self.word.fetch_add(1, SeqCst);
            if (word & (WRITER | GATE)) == 0 {
                break ReadGuard { lock: self };
            }

            // a writer is in, or waiting; undo the bump and hold off so
            // the writer is not starved by a reader stampede.
            self.word.fetch_sub(1, SeqCst);
            self.conflicts.fetch_add(1, SeqCst);
            while (self.word.load(SeqCst) & (WRITER | GATE)) != 0 {
                hint::spin_loop();
            }
        }
    }

    /// Enter the critical section for writing, exclusively.
    pub fn write(&self) -> WriteGuard<T> {
        // close the gate; only one writer gets to own it.
        while (self.word.fetch_or(GATE, SeqCst) & GATE) != 0 {
            self.conflicts.fetch_add(1, SeqCst);
            while (self.word.load(SeqCst) & GATE) != 0 {
                hint::spin_loop();
            }
        }

        // gate is ours, wait for the readers inside to leave.
        while (self.word.load(SeqCst) & READERS) != 0 {
            hint::spin_loop();
        }
        self.word.fetch_or(WRITER, SeqCst);

        WriteGuard { lock: self }
    }

    /// Number of times a thread found this lock contended, since
    /// creation.
    pub fn to_conflicts(&self) -> u64 {
        self.conflicts.load(SeqCst)
    }
}

/// Shared access to the locked value; released on drop.
pub struct ReadGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.word.fetch_sub(1, SeqCst);
    }
}

/// Exclusive access to the locked value; released on drop.
pub struct WriteGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        // clear our bits only; optimistic readers may have bumped the
        // count already and will back themselves out.
        self.lock.word.fetch_and(!(WRITER | GATE), SeqCst);
    }
}

#[cfg(test)]
#[path = "spinlock_test.rs"]
mod spinlock_test;
