//! Two-stage watchdog timer abstraction and its host simulation.
//!
//! The watchdogs only talk to the timer through [`WatchdogHal`]. Register
//! writes go through a write-protect key: every mutating call made while the
//! timer is write-protected is ignored, so callers bracket them with
//! [`write_protect_disable`](WatchdogHal::write_protect_disable) and
//! [`write_protect_enable`](WatchdogHal::write_protect_enable).

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smp_rtos::{InterruptController, InterruptSource, System};

use crate::error::WdtResult;

/// Duration of one watchdog tick, in microseconds.
pub const MWDT_TICK_US: u64 = 500;

/// Number of timeout stages driven by the watchdogs.
pub const STAGE_COUNT: usize = 2;

/// Converts a timeout into watchdog ticks, saturating at `u32::MAX`.
pub fn duration_to_ticks(timeout: Duration) -> u32 {
    let ticks = timeout.as_micros() / u128::from(MWDT_TICK_US);
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

pub fn ticks_to_duration(ticks: u32) -> Duration {
    Duration::from_micros(u64::from(ticks) * MWDT_TICK_US)
}

/// MWDT stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// First stage, counted from the last feed.
    Stage0,
    /// Second stage, counted from the expiry of stage 0.
    Stage1,
}

impl Stage {
    pub fn index(self) -> usize {
        match self {
            Stage::Stage0 => 0,
            Stage::Stage1 => 1,
        }
    }
}

/// Behavior of a stage when it times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageAction {
    /// No effect on the system.
    #[default]
    Off,
    /// Raise the timer group's watchdog interrupt.
    Interrupt,
    /// Reset the CPU core.
    ResetCpu,
    /// Reset the whole system.
    ResetSystem,
}

/// Timer group owning a watchdog instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerGroup {
    Timg0,
    Timg1,
}

impl TimerGroup {
    pub fn index(self) -> u8 {
        match self {
            TimerGroup::Timg0 => 0,
            TimerGroup::Timg1 => 1,
        }
    }

    /// Interrupt source the group raises on an `Interrupt` stage.
    pub fn interrupt_source(self) -> InterruptSource {
        InterruptSource::Watchdog(self.index())
    }
}

/// Hardware two-stage watchdog timer.
pub trait WatchdogHal: Send {
    fn group(&self) -> TimerGroup;
    fn write_protect_disable(&mut self);
    fn write_protect_enable(&mut self);
    fn configure_stage(&mut self, stage: Stage, timeout_ticks: u32, action: StageAction);
    /// Restarts counting from stage 0.
    fn feed(&mut self);
    fn enable(&mut self);
    fn disable(&mut self);
    /// Acknowledges the stage 0 interrupt and feeds the timer.
    fn handle_intr(&mut self);
    fn is_enabled(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
struct StageConfig {
    ticks: u32,
    action: StageAction,
}

struct SimState {
    write_protected: bool,
    enabled: bool,
    stages: [StageConfig; STAGE_COUNT],
    stage: usize,
    stage_started: Instant,
    deadline: Option<Instant>,
    intr_pending: bool,
    stopped: bool,
    feeds: u64,
    expirations: [u64; STAGE_COUNT],
    ignored_writes: u64,
}

impl SimState {
    fn arm_stage(&mut self, stage: usize, from: Instant) {
        self.stage = stage;
        self.stage_started = from;
        self.deadline = Some(from + ticks_to_duration(self.stages[stage].ticks));
    }

    fn restart(&mut self) {
        if self.enabled {
            self.arm_stage(0, Instant::now());
        }
    }

    fn writable(&mut self, op: &str) -> bool {
        if self.write_protected {
            self.ignored_writes += 1;
            trace!(target: "wdt", "{op} ignored: timer is write-protected");
        }
        !self.write_protected
    }
}

struct SimShared {
    group: TimerGroup,
    state: Mutex<SimState>,
    changed: Condvar,
    interrupts: Arc<InterruptController>,
    system: Weak<System>,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock()
    }

    fn run(&self) {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return;
            }
            let deadline = match state.deadline {
                Some(deadline) if state.enabled => deadline,
                _ => {
                    self.changed.wait(&mut state);
                    continue;
                }
            };
            if Instant::now() < deadline {
                self.changed.wait_until(&mut state, deadline);
                continue;
            }

            let stage = state.stage;
            let action = state.stages[stage].action;
            state.expirations[stage] += 1;
            if stage + 1 < STAGE_COUNT {
                state.arm_stage(stage + 1, deadline);
            } else {
                state.deadline = None;
            }
            if action == StageAction::Interrupt {
                state.intr_pending = true;
            }
            MutexGuard::unlocked(&mut state, || self.expire(stage, action));
        }
    }

    fn expire(&self, stage: usize, action: StageAction) {
        trace!(target: "wdt", "{:?} stage {stage} expired: {action:?}", self.group);
        match action {
            StageAction::Off => {}
            StageAction::Interrupt => {
                if let Err(err) = self.interrupts.raise(self.group.interrupt_source()) {
                    warn!(target: "wdt", "{:?} watchdog interrupt lost: {err}", self.group);
                }
            }
            StageAction::ResetCpu | StageAction::ResetSystem => {
                if let Some(system) = self.system.upgrade() {
                    system.abort(&format!("{:?} watchdog reset ({action:?})", self.group));
                }
            }
        }
    }
}

/// Host watchdog timer: a thread counts the stages against the wall clock.
pub struct SimMwdt {
    shared: Arc<SimShared>,
    thread: Option<JoinHandle<()>>,
}

impl SimMwdt {
    /// Creates a disabled, write-protected timer for `group`.
    pub fn new(system: &Arc<System>, group: TimerGroup) -> WdtResult<Self> {
        let shared = Arc::new(SimShared {
            group,
            state: Mutex::new(SimState {
                write_protected: true,
                enabled: false,
                stages: [StageConfig::default(); STAGE_COUNT],
                stage: 0,
                stage_started: Instant::now(),
                deadline: None,
                intr_pending: false,
                stopped: false,
                feeds: 0,
                expirations: [0; STAGE_COUNT],
                ignored_writes: 0,
            }),
            changed: Condvar::new(),
            interrupts: Arc::clone(system.interrupts()),
            system: Arc::downgrade(system),
        });
        let timer = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("mwdt{}", group.index()))
            .spawn(move || timer.run())
            .map_err(smp_rtos::RtosError::from)?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Read-only view of the timer that stays valid after the HAL is boxed.
    pub fn monitor(&self) -> SimMonitor {
        SimMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    fn update(&mut self, op: &str, apply: impl FnOnce(&mut SimState)) {
        let mut state = self.shared.lock();
        if state.writable(op) {
            apply(&mut state);
            self.shared.changed.notify_all();
        }
    }
}

impl WatchdogHal for SimMwdt {
    fn group(&self) -> TimerGroup {
        self.shared.group
    }

    fn write_protect_disable(&mut self) {
        self.shared.lock().write_protected = false;
    }

    fn write_protect_enable(&mut self) {
        self.shared.lock().write_protected = true;
    }

    fn configure_stage(&mut self, stage: Stage, timeout_ticks: u32, action: StageAction) {
        self.update("configure_stage", |state| {
            let index = stage.index();
            state.stages[index] = StageConfig {
                ticks: timeout_ticks,
                action,
            };
            if state.enabled && state.deadline.is_some() && state.stage == index {
                let started = state.stage_started;
                state.arm_stage(index, started);
            }
        });
    }

    fn feed(&mut self) {
        self.update("feed", |state| {
            state.feeds += 1;
            state.restart();
        });
    }

    fn enable(&mut self) {
        self.update("enable", |state| {
            state.enabled = true;
            state.restart();
        });
    }

    fn disable(&mut self) {
        self.update("disable", |state| {
            state.enabled = false;
            state.deadline = None;
        });
    }

    fn handle_intr(&mut self) {
        self.update("handle_intr", |state| {
            state.intr_pending = false;
            state.feeds += 1;
            state.restart();
        });
    }

    fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }
}

impl Drop for SimMwdt {
    fn drop(&mut self) {
        self.shared.lock().stopped = true;
        self.shared.changed.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

/// Observation handle for a [`SimMwdt`].
#[derive(Clone)]
pub struct SimMonitor {
    shared: Arc<SimShared>,
}

impl SimMonitor {
    pub fn feeds(&self) -> u64 {
        self.shared.lock().feeds
    }

    pub fn expirations(&self, stage: Stage) -> u64 {
        self.shared.lock().expirations[stage.index()]
    }

    pub fn stage_config(&self, stage: Stage) -> (u32, StageAction) {
        let config = self.shared.lock().stages[stage.index()];
        (config.ticks, config.action)
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    pub fn is_write_protected(&self) -> bool {
        self.shared.lock().write_protected
    }

    pub fn interrupt_pending(&self) -> bool {
        self.shared.lock().intr_pending
    }

    /// Mutating calls dropped because the timer was write-protected.
    pub fn ignored_writes(&self) -> u64 {
        self.shared.lock().ignored_writes
    }
}
