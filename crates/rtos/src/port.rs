//! Per-thread execution context.
//!
//! Every host thread carries the core it is bound to, whether it is currently
//! servicing an interrupt, and its interrupt mask level. Task threads and
//! dispatcher threads bind themselves when they start; any other thread runs
//! on core 0 at mask level 0.

use core::fmt;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bound on the number of logical cores a system may model.
pub const MAX_CORES: usize = 4;

/// Mask level taken by the port critical section (`XCHAL_EXCM_LEVEL`).
pub const EXCM_LEVEL: u8 = 3;

/// Index of a logical CPU core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CoreId(pub u8);

impl CoreId {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU {}", self.0)
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CORE: Cell<CoreId> = const { Cell::new(CoreId(0)) };
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
    static INT_LEVEL: Cell<u8> = const { Cell::new(0) };
    static TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// Returns the core the calling thread executes on.
pub fn current_core() -> CoreId {
    CORE.with(Cell::get)
}

pub(crate) fn bind_core(core: CoreId) {
    CORE.with(|c| c.set(core));
}

/// Returns true while the calling thread runs an interrupt handler.
pub fn in_isr_context() -> bool {
    IN_ISR.with(Cell::get)
}

/// Returns the current interrupt mask level of the calling thread.
pub fn int_level() -> u8 {
    INT_LEVEL.with(Cell::get)
}

/// Raises the interrupt mask to at least `level` and returns the previous level.
///
/// Mirrors `portSET_INTERRUPT_MASK_FROM_ISR`: the mask never drops as a side
/// effect, so nested callers can restore in reverse order.
pub fn set_int_level(level: u8) -> u8 {
    INT_LEVEL.with(|l| {
        let previous = l.get();
        l.set(previous.max(level));
        previous
    })
}

/// Restores a mask level previously returned by [`set_int_level`].
pub fn restore_int_level(previous: u8) {
    INT_LEVEL.with(|l| l.set(previous));
}

/// Unique, non-zero identity of the calling thread, used as spinlock owner tag.
pub(crate) fn thread_token() -> u64 {
    TOKEN.with(|t| {
        let mut token = t.get();
        if token == 0 {
            token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
            t.set(token);
        }
        token
    })
}

/// Marks the calling thread as servicing an interrupt until dropped.
pub(crate) struct IsrScope {
    previous: bool,
    level: u8,
}

impl IsrScope {
    pub(crate) fn enter(level: u8) -> Self {
        let previous = IN_ISR.with(|f| f.replace(true));
        let level = set_int_level(level);
        Self { previous, level }
    }
}

impl Drop for IsrScope {
    fn drop(&mut self) {
        restore_int_level(self.level);
        IN_ISR.with(|f| f.set(self.previous));
    }
}
