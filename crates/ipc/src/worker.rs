//! Per-core worker task.
//!
//! A worker sleeps until a caller wakes it, then services at most one regular
//! request and one non-blocking request per wake. For regular requests the
//! acknowledgement is given before the callback when the caller waits for the
//! start, and after it when the caller waits for the end. That ordering is
//! the whole contract of [`Ipc::call`](crate::Ipc::call) and
//! [`Ipc::call_blocking`](crate::Ipc::call_blocking).

use core::hint;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{error, trace};
use parking_lot::Mutex;
use smp_rtos::{CoreId, NotifyAction, Semaphore, TaskHandle};

use crate::config::WakeStrategy;

/// Notification bit: caller waits until the callback has started.
pub(crate) const WAIT_FOR_START: u32 = 1 << 0;
/// Notification bit: caller waits until the callback has returned.
pub(crate) const WAIT_FOR_END: u32 = 1 << 1;
/// Notification bit: a non-blocking callback is pending.
pub(crate) const NO_BLOCK: u32 = 1 << 2;

pub(crate) type CallFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitMode {
    ForStart,
    ForEnd,
}

impl WaitMode {
    pub(crate) fn bit(self) -> u32 {
        match self {
            WaitMode::ForStart => WAIT_FOR_START,
            WaitMode::ForEnd => WAIT_FOR_END,
        }
    }
}

struct CallRequest {
    func: CallFn,
    wait: WaitMode,
}

/// State shared between a worker task and its callers.
pub(crate) struct CoreWorker {
    core: CoreId,
    wake_strategy: WakeStrategy,
    /// Drop back to the base priority after every wake.
    restore_priority: bool,
    request: Mutex<Option<CallRequest>>,
    ack: Semaphore,
    wake: Semaphore,
    nb_pending: AtomicBool,
    nb_args_ready: AtomicBool,
    nb_func: spin::Mutex<Option<CallFn>>,
    stop: AtomicBool,
    served: AtomicU64,
}

impl CoreWorker {
    pub(crate) fn new(core: CoreId, wake_strategy: WakeStrategy, restore_priority: bool) -> Self {
        Self {
            core,
            wake_strategy,
            restore_priority,
            request: Mutex::new(None),
            ack: Semaphore::binary(),
            wake: Semaphore::binary(),
            nb_pending: AtomicBool::new(false),
            nb_args_ready: AtomicBool::new(false),
            nb_func: spin::Mutex::new(None),
            stop: AtomicBool::new(false),
            served: AtomicU64::new(0),
        }
    }

    /// Installs a regular request. The caller must hold the call mutex.
    pub(crate) fn publish(&self, func: CallFn, wait: WaitMode) {
        *self.request.lock() = Some(CallRequest { func, wait });
    }

    pub(crate) fn wait_ack(&self) {
        // Without a timeout the take cannot fail.
        let _ = self.ack.take(None);
    }

    /// Claims the non-blocking slot and installs `func`; false if it is taken.
    pub(crate) fn claim_nonblocking(&self, func: CallFn) -> bool {
        if self
            .nb_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.nb_func.lock() = Some(func);
        self.nb_args_ready.store(true, Ordering::Release);
        true
    }

    pub(crate) fn nonblocking_pending(&self) -> bool {
        self.nb_pending.load(Ordering::Acquire)
    }

    /// Callbacks completed by this worker, of both kinds.
    pub(crate) fn served(&self) -> u64 {
        self.served.load(Ordering::Acquire)
    }

    /// Wakes the worker task. Safe to call from interrupt context.
    pub(crate) fn wake(&self, task: &TaskHandle, bits: u32) {
        match self.wake_strategy {
            WakeStrategy::Notify => task.notify(bits, NotifyAction::SetBits),
            WakeStrategy::Semaphore => {
                // Overflow means a wake is already pending, which covers this one.
                let _ = self.wake.give_from_isr();
            }
        }
    }

    pub(crate) fn request_stop(&self, task: &TaskHandle) {
        self.stop.store(true, Ordering::Release);
        self.wake(task, 0);
    }

    /// Worker loop; returns after [`request_stop`](Self::request_stop).
    pub(crate) fn run(&self, task: &TaskHandle) {
        trace!(target: "ipc", "worker for {} running as {:?}", self.core, task.id());
        loop {
            let bits = match self.wake_strategy {
                WakeStrategy::Notify => task.notification().wait(u32::MAX, None).unwrap_or(0),
                WakeStrategy::Semaphore => {
                    let _ = self.wake.take(None);
                    self.pending_bits()
                }
            };
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if bits & NO_BLOCK != 0 {
                self.run_nonblocking();
            }
            if bits & (WAIT_FOR_START | WAIT_FOR_END) != 0 {
                self.run_request();
            }
            if self.restore_priority {
                task.set_priority(task.base_priority());
            }
        }
        trace!(target: "ipc", "worker for {} stopped", self.core);
    }

    fn pending_bits(&self) -> u32 {
        let mut bits = 0;
        if self.nb_pending.load(Ordering::Acquire) {
            bits |= NO_BLOCK;
        }
        if let Some(request) = self.request.lock().as_ref() {
            bits |= request.wait.bit();
        }
        bits
    }

    fn run_nonblocking(&self) {
        if !self.nb_pending.load(Ordering::Acquire) {
            return;
        }
        // The claimer sets `pending` before the callback is in place.
        while !self.nb_args_ready.load(Ordering::Acquire) {
            hint::spin_loop();
        }
        let func = self.nb_func.lock().take();
        if let Some(func) = func {
            self.invoke(func);
        }
        // The slot stays claimed until the callback has returned.
        self.nb_args_ready.store(false, Ordering::Release);
        self.nb_pending.store(false, Ordering::Release);
    }

    fn run_request(&self) {
        let Some(CallRequest { func, wait }) = self.request.lock().take() else {
            return;
        };
        if wait == WaitMode::ForStart {
            let _ = self.ack.give();
        }
        self.invoke(func);
        if wait == WaitMode::ForEnd {
            let _ = self.ack.give();
        }
    }

    fn invoke(&self, func: CallFn) {
        if panic::catch_unwind(AssertUnwindSafe(func)).is_err() {
            error!(target: "ipc", "callback on {} panicked", self.core);
        }
        self.served.fetch_add(1, Ordering::AcqRel);
    }
}
