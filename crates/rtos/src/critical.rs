//! Port spinlock (`portMUX_TYPE`).
//!
//! Unlike a scoped mutex, a critical section may be entered in one function
//! and exited in another, which the cross-core stall protocol relies on. The
//! lock is recursive for its owning thread and masks interrupts up to
//! [`EXCM_LEVEL`] while held.

use core::hint;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::port::{self, EXCM_LEVEL};

/// Recursive spinlock owned by a single thread at a time.
pub struct PortMux {
    owner: AtomicU64,
    count: AtomicU32,
    saved_level: AtomicU8,
}

impl PortMux {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
            count: AtomicU32::new(0),
            saved_level: AtomicU8::new(0),
        }
    }

    /// Enters the critical section, spinning until the lock is free.
    pub fn enter(&self) {
        let me = port::thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            self.count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let level = port::set_int_level(EXCM_LEVEL);
        while self
            .owner
            .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        self.saved_level.store(level, Ordering::Relaxed);
        self.count.store(1, Ordering::Relaxed);
    }

    /// Enters the critical section only if it is free or already ours.
    pub fn try_enter(&self) -> bool {
        let me = port::thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            self.count.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let level = port::set_int_level(EXCM_LEVEL);
        if self
            .owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.saved_level.store(level, Ordering::Relaxed);
            self.count.store(1, Ordering::Relaxed);
            true
        } else {
            port::restore_int_level(level);
            false
        }
    }

    /// Leaves one level of the critical section.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread does not hold the lock.
    pub fn exit(&self) {
        let me = port::thread_token();
        assert_eq!(
            self.owner.load(Ordering::Acquire),
            me,
            "critical section exited by a thread that does not own it"
        );
        if self.count.fetch_sub(1, Ordering::Relaxed) == 1 {
            let level = self.saved_level.load(Ordering::Relaxed);
            self.owner.store(0, Ordering::Release);
            port::restore_int_level(level);
        }
    }

    /// Enters the critical section for the lifetime of the returned guard.
    pub fn lock(&self) -> CriticalGuard<'_> {
        self.enter();
        CriticalGuard { mux: self }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }
}

impl Default for PortMux {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a [`PortMux`] critical section.
pub struct CriticalGuard<'a> {
    mux: &'a PortMux,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.mux.exit();
    }
}
