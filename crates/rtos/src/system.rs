//! The system context.
//!
//! [`System`] owns everything that is per-core and process-wide in the RTOS
//! model: interrupt dispatchers, tick sources, idle tasks, hook tables and the
//! scheduler state. It is constructed explicitly and handed to the services
//! that need it; dropping the last reference stops every service thread.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};
use parking_lot::Mutex;

use crate::crosscore::{Crosscore, CROSSCORE_LEVEL, REASON_PRINT_BACKTRACE};
use crate::error::RtosError;
use crate::hooks::Hooks;
use crate::interrupt::{InterruptController, InterruptSource};
use crate::port::{CoreId, EXCM_LEVEL, MAX_CORES};
use crate::task::{self, SpawnedTask, TaskConfig, TaskHandle, TaskState, IDLE_PRIORITY};
use crate::tick::{self, MAX_TICK_RATE_HZ};

/// Terminal handler for fatal conditions; the default aborts the process.
pub type AbortHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration for the system context.
#[derive(Clone)]
pub struct SystemConfig {
    pub num_cores: usize,
    pub tick_rate_hz: u32,
    pub idle_period: Duration,
    pub abort_handler: Option<AbortHandler>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_cores: 2,
            tick_rate_hz: 100,
            idle_period: Duration::from_millis(1),
            abort_handler: None,
        }
    }
}

impl fmt::Debug for SystemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemConfig")
            .field("num_cores", &self.num_cores)
            .field("tick_rate_hz", &self.tick_rate_hz)
            .field("idle_period", &self.idle_period)
            .field("abort_handler", &self.abort_handler.is_some())
            .finish()
    }
}

impl SystemConfig {
    /// Creates a new system configuration builder.
    pub fn builder() -> SystemConfigBuilder {
        SystemConfigBuilder::default()
    }
}

/// Builder for ergonomic system configuration construction.
#[derive(Default)]
pub struct SystemConfigBuilder {
    config: SystemConfig,
}

impl SystemConfigBuilder {
    /// Sets the number of logical cores (1..=`MAX_CORES`).
    pub fn num_cores(mut self, cores: usize) -> Self {
        self.config.num_cores = cores;
        self
    }

    /// Sets the scheduler tick rate (`configTICK_RATE_HZ`).
    pub fn tick_rate_hz(mut self, rate: u32) -> Self {
        self.config.tick_rate_hz = rate;
        self
    }

    /// Sets how long each idle task sleeps between idle hook passes.
    pub fn idle_period(mut self, period: Duration) -> Self {
        self.config.idle_period = period;
        self
    }

    /// Replaces the process abort with a custom terminal handler.
    pub fn abort_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.config.abort_handler = Some(Arc::new(handler));
        self
    }

    /// Builds the system configuration.
    pub fn build(self) -> SystemConfig {
        self.config
    }
}

/// Scheduler state as reported by `xTaskGetSchedulerState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    NotStarted = 0,
    Running = 1,
    Suspended = 2,
}

impl SchedulerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Suspended,
            _ => Self::NotStarted,
        }
    }
}

/// Process-wide RTOS context.
pub struct System {
    config: SystemConfig,
    state: AtomicU8,
    interrupts: Arc<InterruptController>,
    hooks: Arc<Hooks>,
    ticks: Arc<Vec<AtomicU64>>,
    idle_tasks: Mutex<Vec<TaskHandle>>,
    tasks: Mutex<Vec<TaskHandle>>,
    crosscore: Arc<Crosscore>,
    running: Arc<AtomicBool>,
    services: Mutex<Vec<JoinHandle<()>>>,
}

impl System {
    /// Creates a system context. Service threads start with [`start`](Self::start).
    pub fn new(config: SystemConfig) -> Result<Arc<Self>, RtosError> {
        if config.num_cores == 0 || config.num_cores > MAX_CORES {
            return Err(RtosError::InvalidArg("core count out of range"));
        }
        if config.tick_rate_hz == 0 || config.tick_rate_hz > MAX_TICK_RATE_HZ {
            return Err(RtosError::InvalidArg("tick rate out of range"));
        }
        let cores = config.num_cores;
        Ok(Arc::new(Self {
            config,
            state: AtomicU8::new(SchedulerState::NotStarted as u8),
            interrupts: Arc::new(InterruptController::new(cores)),
            hooks: Arc::new(Hooks::new(cores)),
            ticks: Arc::new((0..cores).map(|_| AtomicU64::new(0)).collect()),
            idle_tasks: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            crosscore: Arc::new(Crosscore::new(cores)),
            running: Arc::new(AtomicBool::new(false)),
            services: Mutex::new(Vec::new()),
        }))
    }

    /// Creates and starts a system with the default configuration.
    pub fn start_default() -> Result<Arc<Self>, RtosError> {
        let system = Self::new(SystemConfig::default())?;
        system.start()?;
        Ok(system)
    }

    /// Starts the per-core dispatchers, tick sources and idle tasks, then
    /// marks the scheduler as running (`vTaskStartScheduler`).
    pub fn start(&self) -> Result<(), RtosError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RtosError::InvalidState("scheduler already started"));
        }

        let mut services = self.services.lock();
        for index in 0..self.config.num_cores {
            let core = CoreId(index as u8);

            let interrupts = Arc::clone(&self.interrupts);
            services.push(
                thread::Builder::new()
                    .name(format!("isr{index}"))
                    .spawn(move || interrupts.run_dispatcher(core))?,
            );

            let hooks = Arc::clone(&self.hooks);
            let ticks = Arc::clone(&self.ticks);
            self.interrupts.allocate(
                core,
                InterruptSource::Tick(core),
                EXCM_LEVEL,
                Arc::new(move || {
                    ticks[core.index()].fetch_add(1, Ordering::AcqRel);
                    hooks.run_tick(core);
                }),
            )?;
            let crosscore = Arc::clone(&self.crosscore);
            self.interrupts.allocate(
                core,
                InterruptSource::Crosscore(core),
                CROSSCORE_LEVEL,
                Arc::new(move || crosscore.handle(core)),
            )?;
            services.push(tick::spawn_ticker(
                core,
                self.tick_period(),
                Arc::clone(&self.interrupts),
                Arc::clone(&self.running),
            )?);

            let hooks = Arc::clone(&self.hooks);
            let running = Arc::clone(&self.running);
            let idle_period = self.config.idle_period;
            let idle = task::spawn(
                TaskConfig::new(format!("IDLE{index}"))
                    .with_priority(IDLE_PRIORITY)
                    .pinned_to(core)
                    .with_stack_size(64 * 1024),
                move || {
                    while running.load(Ordering::Acquire) {
                        if hooks.run_idle(core) {
                            thread::sleep(idle_period);
                        } else {
                            thread::yield_now();
                        }
                    }
                },
            )?;
            let (handle, thread) = idle.into_parts();
            self.register(&handle);
            self.idle_tasks.lock().push(handle);
            services.push(thread);
        }

        self.state
            .store(SchedulerState::Running as u8, Ordering::Release);
        info!(
            target: "rtos",
            "scheduler started on {} core(s), tick {} Hz",
            self.config.num_cores, self.config.tick_rate_hz
        );
        Ok(())
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn num_cores(&self) -> usize {
        self.config.num_cores
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        SchedulerState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.scheduler_state() == SchedulerState::Running
    }

    /// `vTaskSuspendAll`.
    pub fn suspend_all(&self) {
        let _ = self.state.compare_exchange(
            SchedulerState::Running as u8,
            SchedulerState::Suspended as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// `xTaskResumeAll`.
    pub fn resume_all(&self) {
        let _ = self.state.compare_exchange(
            SchedulerState::Suspended as u8,
            SchedulerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Validates a core index against this system.
    pub fn check_core(&self, core: CoreId) -> Result<(), RtosError> {
        if core.index() < self.config.num_cores {
            Ok(())
        } else {
            Err(RtosError::InvalidArg("core index out of range"))
        }
    }

    /// Spawns a task, validating its core affinity first.
    pub fn spawn<F>(&self, config: TaskConfig, body: F) -> Result<SpawnedTask, RtosError>
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(core) = config.affinity {
            self.check_core(core)?;
        }
        let spawned = task::spawn(config, body)?;
        self.register(spawned.handle());
        Ok(spawned)
    }

    fn register(&self, handle: &TaskHandle) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| task.state() != TaskState::Deleted);
        tasks.push(handle.clone());
    }

    /// The task `core` is running: its highest-priority ready task.
    pub fn running_task(&self, core: CoreId) -> Option<TaskHandle> {
        self.tasks
            .lock()
            .iter()
            .filter(|task| task.affinity().unwrap_or_default() == core)
            .filter(|task| task.state() == TaskState::Ready)
            .max_by_key(|task| task.priority())
            .cloned()
    }

    /// Asks `core` to log its own backtrace from its request line
    /// (`esp_crosscore_int_send_print_backtrace`).
    pub fn request_backtrace(&self, core: CoreId) -> Result<(), RtosError> {
        self.check_core(core)?;
        self.crosscore.post(core, REASON_PRINT_BACKTRACE);
        self.interrupts.raise(InterruptSource::Crosscore(core))?;
        self.crosscore.count(core);
        Ok(())
    }

    /// Backtrace requests sent to `core` since start.
    pub fn backtrace_requests(&self, core: CoreId) -> u64 {
        self.crosscore.requests(core)
    }

    /// Handle of the idle task pinned to `core`, once the system has started.
    pub fn idle_task(&self, core: CoreId) -> Option<TaskHandle> {
        self.idle_tasks.lock().get(core.index()).cloned()
    }

    pub fn interrupts(&self) -> &Arc<InterruptController> {
        &self.interrupts
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    /// Ticks observed on `core` since start.
    pub fn tick_count(&self, core: CoreId) -> u64 {
        self.ticks
            .get(core.index())
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    pub fn tick_period(&self) -> Duration {
        tick::tick_period(self.config.tick_rate_hz)
    }

    /// Routes a fatal condition to the abort handler.
    pub fn abort(&self, reason: &str) {
        error!(target: "rtos", "abort() was called: {reason}");
        match &self.config.abort_handler {
            Some(handler) => handler(reason),
            None => std::process::abort(),
        }
    }

    /// Stops every service thread and waits for them to exit.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.state
            .store(SchedulerState::NotStarted as u8, Ordering::Release);
        self.interrupts.stop();

        let me = thread::current().id();
        let services: Vec<_> = self.services.lock().drain(..).collect();
        for service in services {
            if service.thread().id() != me {
                let _ = service.join();
            }
        }
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}
