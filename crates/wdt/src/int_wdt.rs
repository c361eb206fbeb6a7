//! Interrupt watchdog.
//!
//! A liveness heartbeat for the scheduler tick. Every core runs a tick hook;
//! core 0 feeds the timer, and with `check_all_cores` only once every other
//! core has ticked since the previous feed. A core that sits with interrupts
//! masked for longer than the timeout therefore lets stage 0 expire, which
//! aborts the system.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{error, info};
use smp_rtos::{CoreId, HookId, IntrHandle, System};

use crate::error::{WdtError, WdtResult};
use crate::hal::{duration_to_ticks, Stage, StageAction, WatchdogHal};

/// Stage timeouts armed by `init`, before the first feed reprograms them.
pub const IWDT_INITIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Interrupt level of the expiry handler.
pub const IWDT_INTR_LEVEL: u8 = 4;

/// Interrupt watchdog settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntWdtConfig {
    pub timeout: Duration,
    /// Feed only when every core has ticked since the last feed.
    pub check_all_cores: bool,
}

impl Default for IntWdtConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(300),
            check_all_cores: true,
        }
    }
}

struct Inner {
    hal: spin::Mutex<Box<dyn WatchdogHal>>,
    config: IntWdtConfig,
    others_mask: u32,
    ticked: AtomicU32,
    feeds: AtomicU64,
    system: Weak<System>,
}

impl Inner {
    fn on_tick(&self, core: CoreId) {
        if core != CoreId(0) {
            if self.config.check_all_cores {
                self.ticked.fetch_or(1 << core.0, Ordering::AcqRel);
            }
            return;
        }
        if self.config.check_all_cores
            && self.ticked.load(Ordering::Acquire) & self.others_mask != self.others_mask
        {
            return;
        }

        let ticks = duration_to_ticks(self.config.timeout);
        {
            let mut hal = self.hal.lock();
            hal.write_protect_disable();
            hal.configure_stage(Stage::Stage0, ticks, StageAction::Interrupt);
            hal.configure_stage(Stage::Stage1, ticks.saturating_mul(2), StageAction::ResetSystem);
            hal.feed();
            hal.write_protect_enable();
        }
        self.ticked.fetch_and(!self.others_mask, Ordering::AcqRel);
        self.feeds.fetch_add(1, Ordering::Relaxed);
    }

    /// The first core that has not ticked since the last feed, else core 0.
    fn stalled_core(&self) -> CoreId {
        let missing = self.others_mask & !self.ticked.load(Ordering::Acquire);
        if missing == 0 {
            CoreId(0)
        } else {
            CoreId(missing.trailing_zeros() as u8)
        }
    }

    fn on_timeout(&self) {
        let reason = format!("Interrupt wdt timeout on {}", self.stalled_core());
        error!(target: "int_wdt", "{reason}");
        if let Some(system) = self.system.upgrade() {
            system.abort(&reason);
        }
    }
}

/// Running interrupt watchdog; dropping it disarms the timer.
pub struct IntWdt {
    system: Arc<System>,
    inner: Arc<Inner>,
    hooks: Vec<HookId>,
    intr: Option<IntrHandle>,
}

impl IntWdt {
    /// Arms `hal` and installs the tick hooks and the expiry handler.
    ///
    /// The timeout must cover at least two scheduler ticks.
    pub fn init(
        system: Arc<System>,
        hal: Box<dyn WatchdogHal>,
        config: IntWdtConfig,
    ) -> WdtResult<Self> {
        if config.timeout < system.tick_period() * 2 {
            return Err(WdtError::InvalidArg("timeout must cover at least two ticks"));
        }

        let others_mask = (1..system.num_cores()).fold(0u32, |mask, core| mask | 1 << core);
        let source = hal.group().interrupt_source();
        let inner = Arc::new(Inner {
            hal: spin::Mutex::new(hal),
            config,
            others_mask,
            ticked: AtomicU32::new(0),
            feeds: AtomicU64::new(0),
            system: Arc::downgrade(&system),
        });

        {
            let initial = duration_to_ticks(IWDT_INITIAL_TIMEOUT);
            let mut hal = inner.hal.lock();
            hal.write_protect_disable();
            hal.configure_stage(Stage::Stage0, initial, StageAction::Interrupt);
            hal.configure_stage(Stage::Stage1, initial, StageAction::ResetSystem);
            hal.enable();
            hal.write_protect_enable();
        }

        let mut wdt = Self {
            system,
            inner,
            hooks: Vec::new(),
            intr: None,
        };
        let handler = Arc::clone(&wdt.inner);
        wdt.intr = Some(wdt.system.interrupts().allocate(
            CoreId(0),
            source,
            IWDT_INTR_LEVEL,
            Arc::new(move || handler.on_timeout()),
        )?);
        for index in 0..wdt.system.num_cores() {
            let core = CoreId(index as u8);
            let hook = Arc::clone(&wdt.inner);
            let id = wdt
                .system
                .hooks()
                .register_tick(core, Arc::new(move || hook.on_tick(core)))?;
            wdt.hooks.push(id);
        }

        info!(
            target: "int_wdt",
            "initialized: timeout {:?}, checking {} core(s)",
            config.timeout,
            if config.check_all_cores { wdt.system.num_cores() } else { 1 }
        );
        Ok(wdt)
    }

    pub fn config(&self) -> IntWdtConfig {
        self.inner.config
    }

    /// Number of times core 0 has fed the timer.
    pub fn feeds(&self) -> u64 {
        self.inner.feeds.load(Ordering::Relaxed)
    }
}

impl Drop for IntWdt {
    fn drop(&mut self) {
        for hook in self.hooks.drain(..) {
            self.system.hooks().deregister(hook);
        }
        if let Some(handle) = self.intr.take() {
            let _ = self.system.interrupts().free(handle);
        }
        let mut hal = self.inner.hal.lock();
        hal.write_protect_disable();
        hal.disable();
        hal.write_protect_enable();
    }
}
