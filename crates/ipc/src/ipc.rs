//! Task-level inter-processor calls.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use smp_rtos::task::{self, DEFAULT_PRIORITY};
use smp_rtos::{port, CoreId, System, TaskConfig, TaskHandle, MAX_PRIORITIES};

use crate::config::{IpcConfig, PriorityPolicy};
use crate::error::{IpcError, IpcResult};
use crate::worker::{CallFn, CoreWorker, WaitMode, NO_BLOCK};

#[cfg(feature = "isr")]
use crate::isr::IsrIpc;

struct WorkerSlot {
    shared: Arc<CoreWorker>,
    task: TaskHandle,
    thread: Option<JoinHandle<()>>,
}

/// Cross-core call service: one worker task pinned to every core.
///
/// # Example
///
/// ```no_run
/// use smp_ipc::{Ipc, IpcConfig};
/// use smp_rtos::{CoreId, System};
///
/// let system = System::start_default()?;
/// let ipc = Ipc::init(system, IpcConfig::default())?;
/// ipc.call_blocking(CoreId(1), || println!("hello from the other core"))?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Ipc {
    system: Arc<System>,
    config: IpcConfig,
    workers: Vec<WorkerSlot>,
    call_mutexes: Vec<Mutex<()>>,
    #[cfg(feature = "isr")]
    isr: Option<Arc<IsrIpc>>,
}

impl Ipc {
    /// Spawns the workers and returns once every one of them is running.
    ///
    /// With the `isr` feature each worker also routes the cross-core
    /// interrupt of its core before reporting in; systems with more than two
    /// cores run without the ISR-level service.
    pub fn init(system: Arc<System>, config: IpcConfig) -> IpcResult<Self> {
        let num_cores = system.num_cores();
        let mutexes = match config.priority_policy {
            PriorityPolicy::CallersPriority => num_cores,
            PriorityPolicy::Fixed => 1,
        };
        let priority = match config.priority_policy {
            PriorityPolicy::CallersPriority => DEFAULT_PRIORITY,
            PriorityPolicy::Fixed => config.task_priority,
        };

        #[cfg(feature = "isr")]
        let isr = if num_cores <= 2 {
            Some(Arc::new(IsrIpc::new(&system)?))
        } else {
            log::warn!(target: "ipc", "ISR IPC disabled on a {num_cores}-core system");
            None
        };

        let mut ipc = Self {
            system,
            config,
            workers: Vec::with_capacity(num_cores),
            call_mutexes: (0..mutexes).map(|_| Mutex::new(())).collect(),
            #[cfg(feature = "isr")]
            isr,
        };

        let (started_tx, started_rx) = mpsc::channel::<IpcResult<()>>();
        for index in 0..num_cores {
            let core = CoreId(index as u8);
            let restore = ipc.config.priority_policy == PriorityPolicy::CallersPriority;
            let shared = Arc::new(CoreWorker::new(core, ipc.config.wake, restore));
            let worker = Arc::clone(&shared);
            let started = started_tx.clone();
            #[cfg(feature = "isr")]
            let isr = ipc.isr.clone();

            let spawned = ipc.system.spawn(
                TaskConfig::new(format!("ipc{index}"))
                    .with_priority(priority)
                    .pinned_to(core)
                    .with_stack_size(ipc.config.task_stack_size),
                move || {
                    #[cfg(feature = "isr")]
                    let ready = match &isr {
                        Some(isr) => isr.init_on_core(core),
                        None => Ok(()),
                    };
                    #[cfg(not(feature = "isr"))]
                    let ready = Ok(());

                    let routed = ready.is_ok();
                    let _ = started.send(ready);
                    if routed {
                        worker.run(&task::current());
                    }
                },
            )?;
            let (task, thread) = spawned.into_parts();
            ipc.workers.push(WorkerSlot {
                shared,
                task,
                thread: Some(thread),
            });
        }
        drop(started_tx);

        for _ in 0..num_cores {
            match started_rx.recv() {
                Ok(ready) => ready?,
                Err(_) => return Err(IpcError::InvalidState("ipc worker exited during start")),
            }
        }
        info!(target: "ipc", "ipc workers running on {num_cores} core(s)");
        Ok(ipc)
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    /// Handle of the worker task serving `core`.
    pub fn worker_task(&self, core: CoreId) -> Option<&TaskHandle> {
        self.workers.get(core.index()).map(|slot| &slot.task)
    }

    /// Callbacks the worker of `core` has completed.
    pub fn served(&self, core: CoreId) -> u64 {
        self.workers
            .get(core.index())
            .map_or(0, |slot| slot.shared.served())
    }

    /// The ISR-level service, when this system supports it.
    #[cfg(feature = "isr")]
    pub fn isr(&self) -> Option<&Arc<IsrIpc>> {
        self.isr.as_ref()
    }

    fn slot(&self, core: CoreId) -> IpcResult<&WorkerSlot> {
        self.workers
            .get(core.index())
            .ok_or(IpcError::InvalidArg("core index out of range"))
    }

    /// Runs `func` on `core` and returns as soon as it has started.
    ///
    /// The caller may run concurrently with `func`; anything `func` reports
    /// back must go through state it captured.
    pub fn call<F>(&self, core: CoreId, func: F) -> IpcResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_and_wait(core, Box::new(func), WaitMode::ForStart)
    }

    /// Runs `func` on `core` and returns once it has finished.
    pub fn call_blocking<F>(&self, core: CoreId, func: F) -> IpcResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_and_wait(core, Box::new(func), WaitMode::ForEnd)
    }

    fn call_and_wait(&self, core: CoreId, func: CallFn, wait: WaitMode) -> IpcResult<()> {
        let slot = self.slot(core)?;
        if !self.system.is_scheduler_running() {
            return Err(IpcError::InvalidState("scheduler is not running"));
        }

        let _serial = self.lock_worker(core, slot);
        slot.shared.publish(func, wait);
        slot.shared.wake(&slot.task, wait.bit());
        slot.shared.wait_ack();
        debug!(target: "ipc", "call on {core} acknowledged ({wait:?})");
        Ok(())
    }

    fn lock_worker(&self, core: CoreId, slot: &WorkerSlot) -> MutexGuard<'_, ()> {
        match self.config.priority_policy {
            PriorityPolicy::CallersPriority => {
                let caller = task::current().priority();
                if slot.task.priority() < caller {
                    slot.task.set_priority(caller);
                }
                let guard = self.call_mutexes[core.index()].lock();
                slot.task.set_priority(caller);
                guard
            }
            PriorityPolicy::Fixed => self.call_mutexes[0].lock(),
        }
    }

    /// Hands `func` to the worker of `core` without waiting for it.
    ///
    /// Callable from interrupt context and with the scheduler suspended. Fails
    /// with [`IpcError::Busy`] while an earlier non-blocking call to the same
    /// core has not been picked up; the call is dropped, not queued.
    pub fn call_nonblocking<F>(&self, core: CoreId, func: F) -> IpcResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = self.slot(core)?;
        if core == port::current_core() && !self.system.is_scheduler_running() {
            return Err(IpcError::InvalidState("scheduler is not running on this core"));
        }
        if !slot.shared.claim_nonblocking(Box::new(func)) {
            return Err(IpcError::Busy);
        }

        if !port::in_isr_context()
            && self.config.priority_policy == PriorityPolicy::CallersPriority
        {
            slot.task.set_priority(MAX_PRIORITIES - 1);
        }
        slot.shared.wake(&slot.task, NO_BLOCK);
        Ok(())
    }
}

impl Drop for Ipc {
    fn drop(&mut self) {
        for slot in &self.workers {
            slot.shared.request_stop(&slot.task);
        }
        let me = thread::current().id();
        for slot in &mut self.workers {
            if let Some(thread) = slot.thread.take() {
                if thread.thread().id() != me {
                    let _ = thread.join();
                }
            }
        }
        debug!(target: "ipc", "ipc workers stopped");
    }
}
