//! Per-core idle and tick hooks.
//!
//! Idle hooks run from each core's idle task; tick hooks run from each core's
//! tick interrupt. Tables are guarded by spinlocks because tick hooks are
//! invoked from interrupt context. Hooks are copied out of the table before
//! they run, so a hook may register or deregister hooks itself.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::error::RtosError;
use crate::port::CoreId;

/// Number of hooks of each kind a core can hold.
pub const MAX_HOOKS: usize = 8;

/// Idle hook; returning `false` asks the idle task to poll again immediately.
pub type IdleHook = Arc<dyn Fn() -> bool + Send + Sync>;
/// Tick hook, called once per scheduler tick.
pub type TickHook = Arc<dyn Fn() + Send + Sync>;

/// Registration identity used for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u32);

struct HookTable<H> {
    slots: heapless::Vec<(HookId, H), MAX_HOOKS>,
}

impl<H: Clone> HookTable<H> {
    fn new() -> Self {
        Self {
            slots: heapless::Vec::new(),
        }
    }

    fn insert(&mut self, id: HookId, hook: H) -> Result<(), RtosError> {
        self.slots
            .push((id, hook))
            .map_err(|_| RtosError::NoMem("hook table is full"))
    }

    fn remove(&mut self, id: HookId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|(slot, _)| *slot != id);
        before != self.slots.len()
    }

    fn snapshot(&self) -> heapless::Vec<H, MAX_HOOKS> {
        self.slots.iter().map(|(_, hook)| hook.clone()).collect()
    }
}

/// Idle and tick hook tables for every core.
pub struct Hooks {
    idle: Vec<Mutex<HookTable<IdleHook>>>,
    tick: Vec<Mutex<HookTable<TickHook>>>,
    next_id: AtomicU32,
}

impl Hooks {
    pub(crate) fn new(num_cores: usize) -> Self {
        Self {
            idle: (0..num_cores).map(|_| Mutex::new(HookTable::new())).collect(),
            tick: (0..num_cores).map(|_| Mutex::new(HookTable::new())).collect(),
            next_id: AtomicU32::new(1),
        }
    }

    fn allocate_id(&self) -> HookId {
        HookId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn check_core(&self, core: CoreId) -> Result<(), RtosError> {
        if core.index() < self.idle.len() {
            Ok(())
        } else {
            Err(RtosError::InvalidArg("core index out of range"))
        }
    }

    /// `esp_register_freertos_idle_hook_for_cpu`.
    pub fn register_idle(&self, core: CoreId, hook: IdleHook) -> Result<HookId, RtosError> {
        self.check_core(core)?;
        let id = self.allocate_id();
        self.idle[core.index()].lock().insert(id, hook)?;
        Ok(id)
    }

    /// `esp_register_freertos_tick_hook_for_cpu`.
    pub fn register_tick(&self, core: CoreId, hook: TickHook) -> Result<HookId, RtosError> {
        self.check_core(core)?;
        let id = self.allocate_id();
        self.tick[core.index()].lock().insert(id, hook)?;
        Ok(id)
    }

    /// Removes a hook of either kind from whichever core holds it.
    pub fn deregister(&self, id: HookId) -> bool {
        let mut removed = false;
        for table in &self.idle {
            removed |= table.lock().remove(id);
        }
        for table in &self.tick {
            removed |= table.lock().remove(id);
        }
        removed
    }

    pub fn idle_hook_count(&self, core: CoreId) -> usize {
        self.idle
            .get(core.index())
            .map_or(0, |table| table.lock().slots.len())
    }

    pub fn tick_hook_count(&self, core: CoreId) -> usize {
        self.tick
            .get(core.index())
            .map_or(0, |table| table.lock().slots.len())
    }

    /// Runs the idle hooks of `core`; true when every hook returned true.
    pub(crate) fn run_idle(&self, core: CoreId) -> bool {
        let hooks = self.idle[core.index()].lock().snapshot();
        hooks.iter().fold(true, |all, hook| hook() && all)
    }

    pub(crate) fn run_tick(&self, core: CoreId) {
        let hooks = self.tick[core.index()].lock().snapshot();
        for hook in hooks {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn idle_hooks_run_until_deregistered() {
        let hooks = Hooks::new(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = hooks
            .register_idle(
                CoreId(1),
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    true
                }),
            )
            .unwrap();

        assert!(hooks.run_idle(CoreId(1)));
        assert!(hooks.run_idle(CoreId(0)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        assert!(hooks.deregister(id));
        assert!(!hooks.deregister(id));
        hooks.run_idle(CoreId(1));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn full_table_reports_no_mem() {
        let hooks = Hooks::new(1);
        for _ in 0..MAX_HOOKS {
            hooks.register_tick(CoreId(0), Arc::new(|| {})).unwrap();
        }
        assert!(matches!(
            hooks.register_tick(CoreId(0), Arc::new(|| {})),
            Err(RtosError::NoMem(_))
        ));
        assert_eq!(hooks.tick_hook_count(CoreId(0)), MAX_HOOKS);
    }

    #[test]
    fn unknown_core_is_rejected() {
        let hooks = Hooks::new(1);
        assert!(matches!(
            hooks.register_idle(CoreId(2), Arc::new(|| true)),
            Err(RtosError::InvalidArg(_))
        ));
    }

    #[test]
    fn idle_result_is_conjunction() {
        let hooks = Hooks::new(1);
        hooks.register_idle(CoreId(0), Arc::new(|| true)).unwrap();
        hooks.register_idle(CoreId(0), Arc::new(|| false)).unwrap();
        assert!(!hooks.run_idle(CoreId(0)));
    }
}
