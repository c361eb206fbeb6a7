//! Task watchdog.
//!
//! Tasks subscribe and then call [`TaskWatchdog::reset`] periodically. The
//! timer is fed only once every subscribed task has reset since the last
//! feed. When stage 0 expires the interrupt handler feeds the timer, reports
//! the tasks that did not reset and either aborts or carries on, depending on
//! the `panic` setting. Stage 1 resets the system if the handler never ran.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use smp_rtos::task;
use smp_rtos::{port, CoreId, HookId, IntrHandle, RtosError, System, TaskHandle, TaskId};

use crate::error::{WdtError, WdtResult};
use crate::hal::{duration_to_ticks, Stage, StageAction, WatchdogHal};

/// Interrupt level of the timeout handler.
pub const TWDT_INTR_LEVEL: u8 = 1;

/// Called from the timeout interrupt with the tasks that did not reset.
pub type TimeoutHandler = Arc<dyn Fn(&TimeoutReport) + Send + Sync>;

/// Details of one stage 0 expiry.
#[derive(Debug, Clone)]
pub struct TimeoutReport {
    /// Core that serviced the timeout interrupt.
    pub core: CoreId,
    /// Subscribed tasks that had not reset when the timer expired.
    pub stragglers: Vec<TaskHandle>,
    /// Task each core was running when the timer expired.
    pub running: Vec<(CoreId, Option<TaskHandle>)>,
}

impl TimeoutReport {
    pub fn names(&self) -> Vec<&str> {
        self.stragglers.iter().map(TaskHandle::name).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerConfig {
    timeout: Duration,
    panic: bool,
}

struct Entry {
    task: TaskHandle,
    has_reset: bool,
    idle_hook: Option<HookId>,
}

struct State {
    hal: Box<dyn WatchdogHal>,
    timer: Option<TimerConfig>,
    entries: Vec<Entry>,
    intr: Option<IntrHandle>,
}

impl State {
    fn find(&self, id: TaskId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.task.id() == id)
    }

    fn all_reset(&self) -> bool {
        self.entries.iter().all(|entry| entry.has_reset)
    }

    fn initialized(&self) -> WdtResult<TimerConfig> {
        self.timer
            .ok_or(WdtError::InvalidState("task watchdog is not initialized"))
    }

    /// Feeds the timer and starts a new window for every entry.
    fn feed(&mut self) {
        self.hal.write_protect_disable();
        self.hal.feed();
        self.hal.write_protect_enable();
        for entry in &mut self.entries {
            entry.has_reset = false;
        }
    }

    /// Stage 0 interrupts at `timeout`, stage 1 resets the system at twice that.
    fn program(&mut self, timeout: Duration) {
        let ticks = duration_to_ticks(timeout);
        self.hal.write_protect_disable();
        self.hal.disable();
        self.hal.configure_stage(Stage::Stage0, ticks, StageAction::Interrupt);
        self.hal.configure_stage(
            Stage::Stage1,
            ticks.saturating_mul(2),
            StageAction::ResetSystem,
        );
        self.hal.enable();
        self.hal.write_protect_enable();
    }
}

struct Inner {
    state: spin::Mutex<State>,
    handler: spin::Mutex<Option<TimeoutHandler>>,
    system: Weak<System>,
    num_cores: usize,
    timeouts: AtomicU64,
}

impl Inner {
    fn reset_entry(&self, id: TaskId) -> WdtResult<()> {
        let mut state = self.state.lock();
        state.initialized()?;
        let index = state.find(id).ok_or(WdtError::NotFound)?;
        state.entries[index].has_reset = true;
        if state.all_reset() {
            state.feed();
        }
        Ok(())
    }

    fn cpu_label(&self, task: &TaskHandle) -> String {
        match task.affinity() {
            Some(core) => core.to_string(),
            None => {
                let cores: Vec<String> =
                    (0..self.num_cores).map(|core| core.to_string()).collect();
                format!("CPU {}", cores.join("/"))
            }
        }
    }

    /// Stage 0 interrupt handler.
    fn on_timeout(&self) {
        let core = port::current_core();
        let (stragglers, panic) = {
            let mut state = self.state.lock();
            state.hal.write_protect_disable();
            state.hal.handle_intr();
            state.hal.write_protect_enable();
            if state.entries.is_empty() {
                return;
            }
            let stragglers: Vec<TaskHandle> = state
                .entries
                .iter()
                .filter(|entry| !entry.has_reset)
                .map(|entry| entry.task.clone())
                .collect();
            (stragglers, state.timer.is_some_and(|timer| timer.panic))
        };

        error!(
            target: "task_wdt",
            "Task watchdog got triggered. The following tasks did not reset the watchdog in time:"
        );
        for task in &stragglers {
            error!(target: "task_wdt", " - {} ({})", task.name(), self.cpu_label(task));
        }
        self.timeouts.fetch_add(1, Ordering::AcqRel);

        let system = self.system.upgrade();
        let running: Vec<(CoreId, Option<TaskHandle>)> = (0..self.num_cores)
            .map(|index| {
                let cpu = CoreId(index as u8);
                (cpu, system.as_ref().and_then(|system| system.running_task(cpu)))
            })
            .collect();
        error!(target: "task_wdt", "Tasks currently running:");
        for (cpu, task) in &running {
            let name = task.as_ref().map_or("?", TaskHandle::name);
            error!(target: "task_wdt", "{cpu}: {name}");
        }

        let report = TimeoutReport {
            core,
            stragglers,
            running,
        };
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(&report);
        }

        if panic {
            error!(target: "task_wdt", "Aborting.");
            if let Some(system) = &system {
                system.abort("task watchdog got triggered");
            }
            return;
        }

        // Every other core logs its own backtrace from its request line.
        if let Some(system) = &system {
            for (cpu, _) in report.running.iter().filter(|(cpu, _)| *cpu != core) {
                if let Err(err) = system.request_backtrace(*cpu) {
                    warn!(target: "task_wdt", "backtrace request to {cpu} failed: {err}");
                }
            }
        }
        let backtrace = Backtrace::force_capture();
        error!(target: "task_wdt", "Print {core} (current core) backtrace\n{backtrace}");
    }
}

/// Task watchdog bound to one watchdog timer.
pub struct TaskWatchdog {
    system: Arc<System>,
    inner: Arc<Inner>,
}

impl TaskWatchdog {
    /// Wraps `hal`; nothing is armed until [`init`](Self::init).
    pub fn new(system: Arc<System>, hal: Box<dyn WatchdogHal>) -> Self {
        let inner = Arc::new(Inner {
            state: spin::Mutex::new(State {
                hal,
                timer: None,
                entries: Vec::new(),
                intr: None,
            }),
            handler: spin::Mutex::new(None),
            system: Arc::downgrade(&system),
            num_cores: system.num_cores(),
            timeouts: AtomicU64::new(0),
        });
        Self { system, inner }
    }

    /// Arms the watchdog, or updates timeout and panic mode if it is armed.
    ///
    /// The timeout interrupt is routed to the calling core.
    pub fn init(&self, timeout: Duration, panic: bool) -> WdtResult<()> {
        if duration_to_ticks(timeout) == 0 {
            return Err(WdtError::InvalidArg("timeout is shorter than one watchdog tick"));
        }
        let config = TimerConfig { timeout, panic };
        let mut state = self.inner.state.lock();
        if state.timer.is_some() {
            state.program(timeout);
            state.timer = Some(config);
            info!(target: "task_wdt", "reconfigured: timeout {timeout:?}, panic {panic}");
            return Ok(());
        }

        let core = port::current_core();
        self.system.check_core(core)?;
        let source = state.hal.group().interrupt_source();
        let inner = Arc::clone(&self.inner);
        let handle = self.system.interrupts().allocate(
            core,
            source,
            TWDT_INTR_LEVEL,
            Arc::new(move || inner.on_timeout()),
        )?;
        state.intr = Some(handle);
        state.program(timeout);
        state.timer = Some(config);
        info!(target: "task_wdt", "initialized on {core}: timeout {timeout:?}, panic {panic}");
        Ok(())
    }

    /// Disarms the watchdog. Every task must have been deleted first.
    pub fn deinit(&self) -> WdtResult<()> {
        let intr = {
            let mut state = self.inner.state.lock();
            state.initialized()?;
            if !state.entries.is_empty() {
                return Err(WdtError::InvalidState("tasks are still subscribed"));
            }
            state.hal.write_protect_disable();
            state.hal.disable();
            state.hal.write_protect_enable();
            state.timer = None;
            state.intr.take()
        };
        if let Some(handle) = intr {
            self.system.interrupts().free(handle)?;
        }
        info!(target: "task_wdt", "deinitialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    /// Configured stage 0 timeout, once initialized.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.state.lock().timer.map(|timer| timer.timeout)
    }

    /// Subscribes `task`, or the calling task for `None`.
    ///
    /// Subscribing an idle task installs an idle hook that resets on its behalf.
    pub fn add(&self, task: Option<&TaskHandle>) -> WdtResult<()> {
        let task = task.cloned().unwrap_or_else(task::current);
        let idle_core = (0..self.system.num_cores())
            .map(|index| CoreId(index as u8))
            .find(|core| self.system.idle_task(*core).as_ref() == Some(&task));

        let mut state = self.inner.state.lock();
        state.initialized()?;
        if state.find(task.id()).is_some() {
            return Err(WdtError::InvalidArg("task is already subscribed"));
        }
        state.entries.try_reserve(1).map_err(|_| WdtError::NoMem)?;

        let idle_hook = match idle_core {
            Some(core) => Some(self.register_idle_reset(core, task.id())?),
            None => None,
        };
        let all_others_reset = state.all_reset();
        debug!(target: "task_wdt", "subscribed {} ({})", task.name(), self.inner.cpu_label(&task));
        state.entries.push(Entry {
            task,
            has_reset: true,
            idle_hook,
        });
        if all_others_reset {
            state.feed();
        }
        Ok(())
    }

    fn register_idle_reset(&self, core: CoreId, id: TaskId) -> WdtResult<HookId> {
        let inner = Arc::downgrade(&self.inner);
        self.system
            .hooks()
            .register_idle(
                core,
                Arc::new(move || {
                    if let Some(inner) = inner.upgrade() {
                        let _ = inner.reset_entry(id);
                    }
                    true
                }),
            )
            .map_err(|err| match err {
                RtosError::NoMem(_) => WdtError::NoMem,
                other => other.into(),
            })
    }

    /// Marks the calling task as alive for the current window.
    pub fn reset(&self) -> WdtResult<()> {
        self.inner.reset_entry(task::current().id())
    }

    /// Unsubscribes `task`, or the calling task for `None`.
    pub fn delete(&self, task: Option<&TaskHandle>) -> WdtResult<()> {
        let task = task.cloned().unwrap_or_else(task::current);
        let entry = {
            let mut state = self.inner.state.lock();
            state.initialized()?;
            let index = state.find(task.id()).ok_or(WdtError::NotFound)?;
            let entry = state.entries.remove(index);
            if state.all_reset() {
                state.feed();
            }
            entry
        };
        if let Some(hook) = entry.idle_hook {
            self.system.hooks().deregister(hook);
        }
        debug!(target: "task_wdt", "unsubscribed {}", task.name());
        Ok(())
    }

    /// `Ok` when `task` (or the calling task) is subscribed.
    pub fn status(&self, task: Option<&TaskHandle>) -> WdtResult<()> {
        let task = task.cloned().unwrap_or_else(task::current);
        let state = self.inner.state.lock();
        state.initialized()?;
        state.find(task.id()).map(|_| ()).ok_or(WdtError::NotFound)
    }

    /// Installs the hook called from the timeout interrupt.
    pub fn set_timeout_handler<F>(&self, handler: F)
    where
        F: Fn(&TimeoutReport) + Send + Sync + 'static,
    {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }

    pub fn subscribed(&self) -> Vec<TaskHandle> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Stage 0 expiries handled with at least one task subscribed.
    pub fn timeouts(&self) -> u64 {
        self.inner.timeouts.load(Ordering::Acquire)
    }
}

impl Drop for TaskWatchdog {
    fn drop(&mut self) {
        let (intr, hooks) = {
            let mut state = self.inner.state.lock();
            if state.timer.take().is_some() {
                state.hal.write_protect_disable();
                state.hal.disable();
                state.hal.write_protect_enable();
            }
            let hooks: Vec<HookId> = state.entries.drain(..).filter_map(|e| e.idle_hook).collect();
            (state.intr.take(), hooks)
        };
        for hook in hooks {
            self.system.hooks().deregister(hook);
        }
        if let Some(handle) = intr {
            let _ = self.system.interrupts().free(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::testing::{feeds, HalOp, RecordingHal};
    use crate::hal::TimerGroup;
    use parking_lot::Mutex;
    use smp_rtos::{InterruptSource, SystemConfig, TaskConfig};
    use std::thread;
    use std::time::Instant;

    fn watchdog(system: &Arc<System>) -> (TaskWatchdog, Arc<Mutex<Vec<HalOp>>>) {
        let (hal, ops) = RecordingHal::new(TimerGroup::Timg0);
        (TaskWatchdog::new(Arc::clone(system), Box::new(hal)), ops)
    }

    fn idle_system() -> Arc<System> {
        System::new(SystemConfig::default()).unwrap()
    }

    fn handle(system: &System, name: &str) -> TaskHandle {
        system
            .spawn(TaskConfig::new(name), || {})
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn operations_require_init() {
        let system = idle_system();
        let (wdt, _) = watchdog(&system);
        let task = handle(&system, "t");
        assert!(matches!(wdt.add(Some(&task)), Err(WdtError::InvalidState(_))));
        assert!(matches!(wdt.status(Some(&task)), Err(WdtError::InvalidState(_))));
        assert!(matches!(wdt.reset(), Err(WdtError::InvalidState(_))));
        assert!(matches!(wdt.deinit(), Err(WdtError::InvalidState(_))));
    }

    #[test]
    fn init_programs_both_stages_and_reinit_updates_them() {
        let system = idle_system();
        let (wdt, ops) = watchdog(&system);
        wdt.init(Duration::from_millis(100), false).unwrap();
        assert!(system.interrupts().is_allocated(InterruptSource::Watchdog(0)));
        assert_eq!(
            ops.lock().as_slice(),
            [
                HalOp::Disable,
                HalOp::Configure(Stage::Stage0, 200, StageAction::Interrupt),
                HalOp::Configure(Stage::Stage1, 400, StageAction::ResetSystem),
                HalOp::Enable,
            ]
        );

        ops.lock().clear();
        wdt.init(Duration::from_millis(50), true).unwrap();
        assert!(ops
            .lock()
            .contains(&HalOp::Configure(Stage::Stage0, 100, StageAction::Interrupt)));
        assert!(wdt.is_initialized());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let system = idle_system();
        let (wdt, _) = watchdog(&system);
        assert!(matches!(
            wdt.init(Duration::from_micros(100), false),
            Err(WdtError::InvalidArg(_))
        ));
    }

    #[test]
    fn subscription_errors() {
        let system = idle_system();
        let (wdt, _) = watchdog(&system);
        wdt.init(Duration::from_secs(1), false).unwrap();
        let a = handle(&system, "a");
        let b = handle(&system, "b");

        wdt.add(Some(&a)).unwrap();
        assert!(matches!(wdt.add(Some(&a)), Err(WdtError::InvalidArg(_))));
        assert!(wdt.status(Some(&a)).is_ok());
        assert!(matches!(wdt.status(Some(&b)), Err(WdtError::NotFound)));
        assert!(matches!(wdt.inner.reset_entry(b.id()), Err(WdtError::NotFound)));
        assert!(matches!(wdt.delete(Some(&b)), Err(WdtError::NotFound)));
        // The test thread itself never subscribed.
        assert!(matches!(wdt.reset(), Err(WdtError::NotFound)));
    }

    #[test]
    fn feeds_only_once_every_task_reset() {
        for n in 1..=4 {
            let system = idle_system();
            let (wdt, ops) = watchdog(&system);
            wdt.init(Duration::from_secs(1), false).unwrap();
            let tasks: Vec<_> = (0..n).map(|i| handle(&system, &format!("t{i}"))).collect();
            for task in &tasks {
                wdt.add(Some(task)).unwrap();
            }

            // Align on a window boundary: the first task is the only one
            // whose flag was cleared by the feed on its own subscription.
            let before = feeds(&ops);
            for task in tasks.iter().rev() {
                wdt.inner.reset_entry(task.id()).unwrap();
            }
            assert_eq!(feeds(&ops), before + 1);

            for window in 1..=3 {
                let before = feeds(&ops);
                for task in &tasks[..n - 1] {
                    wdt.inner.reset_entry(task.id()).unwrap();
                    wdt.inner.reset_entry(task.id()).unwrap();
                }
                assert_eq!(feeds(&ops), before, "n = {n}, window {window}");
                wdt.inner.reset_entry(tasks[n - 1].id()).unwrap();
                assert_eq!(feeds(&ops), before + 1, "n = {n}, window {window}");
            }
        }
    }

    #[test]
    fn deleting_last_straggler_feeds() {
        let system = idle_system();
        let (wdt, ops) = watchdog(&system);
        wdt.init(Duration::from_secs(1), false).unwrap();
        let a = handle(&system, "a");
        let b = handle(&system, "b");
        wdt.add(Some(&a)).unwrap();
        wdt.add(Some(&b)).unwrap();
        wdt.inner.reset_entry(a.id()).unwrap();

        let before = feeds(&ops);
        wdt.inner.reset_entry(a.id()).unwrap();
        assert_eq!(feeds(&ops), before);
        wdt.delete(Some(&b)).unwrap();
        assert_eq!(feeds(&ops), before + 1);
        assert_eq!(wdt.subscribed(), vec![a]);
    }

    #[test]
    fn deinit_requires_empty_list() {
        let system = idle_system();
        let (wdt, ops) = watchdog(&system);
        wdt.init(Duration::from_secs(1), false).unwrap();
        let a = handle(&system, "a");
        wdt.add(Some(&a)).unwrap();
        assert!(matches!(wdt.deinit(), Err(WdtError::InvalidState(_))));

        wdt.delete(Some(&a)).unwrap();
        wdt.deinit().unwrap();
        assert_eq!(ops.lock().last(), Some(&HalOp::Disable));
        assert!(!system.interrupts().is_allocated(InterruptSource::Watchdog(0)));
        assert!(matches!(wdt.deinit(), Err(WdtError::InvalidState(_))));
    }

    #[test]
    fn timeout_reports_stragglers() {
        let system = idle_system();
        let (wdt, ops) = watchdog(&system);
        wdt.init(Duration::from_secs(1), false).unwrap();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        wdt.set_timeout_handler(move |report| {
            sink.lock()
                .push(report.names().into_iter().map(str::to_owned).collect::<Vec<_>>());
        });

        let a = handle(&system, "a");
        let b = handle(&system, "b");
        wdt.add(Some(&a)).unwrap();
        wdt.add(Some(&b)).unwrap();
        wdt.inner.reset_entry(a.id()).unwrap();
        wdt.inner.reset_entry(a.id()).unwrap();

        wdt.inner.on_timeout();
        assert_eq!(reports.lock().as_slice(), [vec![String::from("b")]]);
        assert!(ops.lock().contains(&HalOp::HandleIntr));
        assert_eq!(wdt.timeouts(), 1);
    }

    #[test]
    fn timeout_with_empty_list_only_feeds() {
        let system = idle_system();
        let (wdt, ops) = watchdog(&system);
        wdt.init(Duration::from_secs(1), true).unwrap();
        wdt.inner.on_timeout();
        assert_eq!(ops.lock().last(), Some(&HalOp::HandleIntr));
        assert_eq!(wdt.timeouts(), 0);
    }

    #[test]
    fn panic_mode_aborts() {
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        let system = System::new(
            SystemConfig::builder()
                .abort_handler(move |reason| sink.lock().push(reason.to_owned()))
                .build(),
        )
        .unwrap();
        let (wdt, _) = watchdog(&system);
        wdt.init(Duration::from_secs(1), true).unwrap();
        let a = handle(&system, "a");
        wdt.add(Some(&a)).unwrap();

        wdt.inner.on_timeout();
        assert_eq!(
            reasons.lock().as_slice(),
            ["task watchdog got triggered".to_owned()]
        );
    }

    #[test]
    fn timeout_requests_backtrace_from_every_other_core() {
        for cores in [2, 4] {
            let system = System::new(SystemConfig::builder().num_cores(cores).build()).unwrap();
            system.start().unwrap();
            let (wdt, _) = watchdog(&system);
            wdt.init(Duration::from_secs(1), false).unwrap();
            let running = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&running);
            wdt.set_timeout_handler(move |report| {
                let names = report
                    .running
                    .iter()
                    .map(|(cpu, task)| (*cpu, task.as_ref().map(|t| t.name().to_owned())));
                sink.lock().extend(names);
            });
            // Joined first so only the idle tasks are ready.
            let a = system.spawn(TaskConfig::new("a"), || {}).unwrap();
            let a_handle = a.handle().clone();
            a.join().unwrap();
            wdt.add(Some(&a_handle)).unwrap();

            wdt.inner.on_timeout();
            assert_eq!(system.backtrace_requests(CoreId(0)), 0, "{cores} cores");
            for index in 1..cores {
                let cpu = CoreId(index as u8);
                assert_eq!(system.backtrace_requests(cpu), 1, "{cores} cores, {cpu}");
            }
            let expected: Vec<_> = (0..cores)
                .map(|index| (CoreId(index as u8), Some(format!("IDLE{index}"))))
                .collect();
            assert_eq!(*running.lock(), expected);
        }
    }

    #[test]
    fn panic_mode_requests_no_backtraces() {
        let config = SystemConfig::builder().abort_handler(|_| {}).build();
        let system = System::new(config).unwrap();
        system.start().unwrap();
        let (wdt, _) = watchdog(&system);
        wdt.init(Duration::from_secs(1), true).unwrap();
        let a = handle(&system, "a");
        wdt.add(Some(&a)).unwrap();

        wdt.inner.on_timeout();
        assert_eq!(system.backtrace_requests(CoreId(1)), 0);
    }

    #[test]
    fn cpu_labels() {
        let system = idle_system();
        let (wdt, _) = watchdog(&system);
        let pinned = system
            .spawn(TaskConfig::new("p").pinned_to(CoreId(1)), || {})
            .unwrap()
            .into_parts()
            .0;
        let free = handle(&system, "f");
        assert_eq!(wdt.inner.cpu_label(&pinned), "CPU 1");
        assert_eq!(wdt.inner.cpu_label(&free), "CPU 0/1");
    }

    #[test]
    fn idle_task_resets_through_hook() {
        let system = System::start_default().unwrap();
        let (wdt, ops) = watchdog(&system);
        wdt.init(Duration::from_secs(1), false).unwrap();
        let idle = system.idle_task(CoreId(1)).unwrap();
        let hooks_before = system.hooks().idle_hook_count(CoreId(1));

        wdt.add(Some(&idle)).unwrap();
        assert_eq!(system.hooks().idle_hook_count(CoreId(1)), hooks_before + 1);

        let before = feeds(&ops);
        let deadline = Instant::now() + Duration::from_secs(5);
        while feeds(&ops) < before + 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(feeds(&ops) >= before + 3);

        wdt.delete(Some(&idle)).unwrap();
        assert_eq!(system.hooks().idle_hook_count(CoreId(1)), hooks_before);
    }
}
