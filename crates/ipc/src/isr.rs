//! ISR-level cross-core calls and the stall rendezvous.
//!
//! A call publishes a callback into a single process-wide slot and raises the
//! cross-core interrupt of the other core. The callback runs inside that
//! interrupt, outside any task, while the caller spins on a start or end flag.
//! Calls are serialized globally: a new call waits for `end_done` of the
//! previous one before it publishes.
//!
//! Stalling parks the other core in a spin loop on `finish_cmd` so the calling
//! core can touch shared state that the other core must not observe midway.
//! Stall and release nest per core; only the outermost pair issues the
//! cross-core interrupt and the finish command.

use core::hint;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error};
use smp_rtos::{port, CoreId, InterruptController, InterruptSource, IntrHandle, PortMux, System};

use crate::error::{IpcError, IpcResult};
use crate::worker::WaitMode;

/// Interrupt mask level held by a core while the other core is stalled.
pub const STALL_INT_LEVEL: u8 = 5;

/// Callback run on the other core in interrupt context.
pub type IsrFn = Box<dyn FnOnce() + Send + 'static>;

/// Whether stall requests are honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StallState {
    Idle = 0,
    Running = 1,
}

/// Counters for the rendezvous, cumulative since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsrStats {
    /// Cross-core interrupts raised by calls and first-level stalls.
    pub cross_core_calls: u64,
    /// Finish commands issued by outermost releases.
    pub finish_commands: u64,
}

struct Rendezvous {
    start_done: AtomicBool,
    end_done: AtomicBool,
    finish_cmd: AtomicBool,
    pending: spin::Mutex<Option<IsrFn>>,
}

impl Rendezvous {
    fn new() -> Self {
        Self {
            start_done: AtomicBool::new(false),
            end_done: AtomicBool::new(true),
            finish_cmd: AtomicBool::new(false),
            pending: spin::Mutex::new(None),
        }
    }

    /// Body of the cross-core interrupt handler.
    fn service(&self) {
        let func = self.pending.lock().take();
        self.start_done.store(true, Ordering::Release);
        let outcome = func.map(|func| panic::catch_unwind(AssertUnwindSafe(func)));
        self.end_done.store(true, Ordering::Release);
        if let Some(Err(payload)) = outcome {
            panic::resume_unwind(payload);
        }
    }

    fn wait_for_finish(&self) {
        while !self.finish_cmd.load(Ordering::Acquire) {
            hint::spin_loop();
        }
    }

    fn spin_until(flag: &AtomicBool) {
        while !flag.load(Ordering::Acquire) {
            hint::spin_loop();
        }
    }
}

/// ISR-level IPC service for a one- or two-core system.
pub struct IsrIpc {
    interrupts: Arc<InterruptController>,
    num_cores: usize,
    shared: Arc<Rendezvous>,
    mux: PortMux,
    state: AtomicU8,
    nested: Vec<AtomicI32>,
    saved_level: AtomicU8,
    handles: spin::Mutex<Vec<IntrHandle>>,
    calls: AtomicU64,
    finishes: AtomicU64,
}

impl IsrIpc {
    /// Creates the service. Each core routes its line with [`init_on_core`](Self::init_on_core).
    pub fn new(system: &System) -> IpcResult<Self> {
        let num_cores = system.num_cores();
        if num_cores > 2 {
            return Err(IpcError::InvalidArg("ISR IPC supports at most two cores"));
        }
        Ok(Self {
            interrupts: Arc::clone(system.interrupts()),
            num_cores,
            shared: Arc::new(Rendezvous::new()),
            mux: PortMux::new(),
            state: AtomicU8::new(StallState::Idle as u8),
            nested: (0..num_cores).map(|_| AtomicI32::new(0)).collect(),
            saved_level: AtomicU8::new(0),
            handles: spin::Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
            finishes: AtomicU64::new(0),
        })
    }

    /// Routes the cross-core interrupt aimed at `core`. Initializing any core
    /// other than core 0 arms the stall.
    pub fn init_on_core(&self, core: CoreId) -> IpcResult<()> {
        if core.index() >= self.num_cores {
            return Err(IpcError::InvalidArg("core index out of range"));
        }
        let shared = Arc::clone(&self.shared);
        let handle = self.interrupts.allocate(
            core,
            InterruptSource::FromCpu(core),
            STALL_INT_LEVEL,
            Arc::new(move || shared.service()),
        )?;
        self.handles.lock().push(handle);
        if core != CoreId(0) {
            self.state.store(StallState::Running as u8, Ordering::Release);
        }
        debug!(target: "ipc_isr", "cross-core line to {core} routed");
        Ok(())
    }

    pub fn state(&self) -> StallState {
        if self.state.load(Ordering::Acquire) == StallState::Running as u8 {
            StallState::Running
        } else {
            StallState::Idle
        }
    }

    /// Runs `func` on the other core and returns once it has started.
    pub fn call<F>(&self, func: F) -> IpcResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let _critical = self.mux.lock();
        self.call_and_wait(Box::new(func), WaitMode::ForStart)
    }

    /// Runs `func` on the other core and returns once it has finished.
    pub fn call_blocking<F>(&self, func: F) -> IpcResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let _critical = self.mux.lock();
        self.call_and_wait(Box::new(func), WaitMode::ForEnd)
    }

    fn other_core(&self) -> IpcResult<CoreId> {
        if self.num_cores < 2 {
            return Err(IpcError::InvalidState("no other core to call"));
        }
        Ok(if port::current_core() == CoreId(0) {
            CoreId(1)
        } else {
            CoreId(0)
        })
    }

    fn call_and_wait(&self, func: IsrFn, wait: WaitMode) -> IpcResult<()> {
        let target = self.other_core()?;
        let source = InterruptSource::FromCpu(target);
        if !self.interrupts.is_allocated(source) {
            return Err(IpcError::InvalidState("ISR IPC is not initialized on the other core"));
        }

        Rendezvous::spin_until(&self.shared.end_done);
        *self.shared.pending.lock() = Some(func);
        self.shared.start_done.store(false, Ordering::Release);
        self.shared.end_done.store(false, Ordering::Release);

        if let Err(err) = self.interrupts.raise(source) {
            self.shared.pending.lock().take();
            self.shared.start_done.store(true, Ordering::Release);
            self.shared.end_done.store(true, Ordering::Release);
            return Err(err.into());
        }
        self.calls.fetch_add(1, Ordering::Relaxed);

        match wait {
            WaitMode::ForStart => Rendezvous::spin_until(&self.shared.start_done),
            WaitMode::ForEnd => Rendezvous::spin_until(&self.shared.end_done),
        }
        Ok(())
    }

    /// Parks the other core until the matching [`release_other_core`](Self::release_other_core).
    ///
    /// Masks interrupts on the calling core up to [`STALL_INT_LEVEL`]. Nested
    /// calls only bump the per-core counter.
    pub fn stall_other_core(&self) {
        if self.state() != StallState::Running {
            return;
        }
        let level = port::set_int_level(STALL_INT_LEVEL);
        let nested = &self.nested[port::current_core().index()];
        if nested.fetch_add(1, Ordering::AcqRel) == 0 {
            self.mux.enter();
            self.saved_level.store(level, Ordering::Relaxed);
            self.shared.finish_cmd.store(false, Ordering::Release);
            let shared = Arc::clone(&self.shared);
            let parked = self.call_and_wait(
                Box::new(move || shared.wait_for_finish()),
                WaitMode::ForStart,
            );
            if let Err(err) = parked {
                error!(target: "ipc_isr", "failed to stall the other core: {err}");
                nested.fetch_sub(1, Ordering::AcqRel);
                self.mux.exit();
                port::restore_int_level(level);
            }
            return;
        }
        // The outermost stall already masked interrupts.
        port::restore_int_level(level);
    }

    /// Undoes one [`stall_other_core`](Self::stall_other_core).
    ///
    /// # Panics
    ///
    /// Panics when called more often than `stall_other_core` on this core.
    pub fn release_other_core(&self) {
        if self.state() != StallState::Running {
            return;
        }
        let remaining =
            self.nested[port::current_core().index()].fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.shared.finish_cmd.store(true, Ordering::Release);
            self.finishes.fetch_add(1, Ordering::Relaxed);
            Rendezvous::spin_until(&self.shared.end_done);
            self.mux.exit();
            port::restore_int_level(self.saved_level.load(Ordering::Relaxed));
        } else {
            assert!(
                remaining > 0,
                "release_other_core called without a matching stall_other_core"
            );
        }
    }

    /// Stall depth of the calling core.
    pub fn stall_depth(&self) -> i32 {
        self.nested
            .get(port::current_core().index())
            .map_or(0, |nested| nested.load(Ordering::Acquire))
    }

    /// Disables stalling until [`stall_resume`](Self::stall_resume).
    pub fn stall_pause(&self) {
        let _critical = self.mux.lock();
        self.state.store(StallState::Idle as u8, Ordering::Release);
    }

    pub fn stall_resume(&self) {
        let _critical = self.mux.lock();
        self.state.store(StallState::Running as u8, Ordering::Release);
    }

    /// Disables stalling without taking the lock, for use on the panic path.
    pub fn stall_abort(&self) {
        self.state.store(StallState::Idle as u8, Ordering::Release);
    }

    pub fn stats(&self) -> IsrStats {
        IsrStats {
            cross_core_calls: self.calls.load(Ordering::Relaxed),
            finish_commands: self.finishes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for IsrIpc {
    fn drop(&mut self) {
        for handle in self.handles.lock().drain(..) {
            let _ = self.interrupts.free(handle);
        }
    }
}
