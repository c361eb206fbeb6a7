//! Interrupt controller with one dispatcher per core.
//!
//! Sources are routed to the core that allocated them. Raising a source queues
//! it on that core's dispatcher thread, which runs the handler with the ISR
//! flag set and the mask raised to the allocation level. A source already
//! pending is not queued twice, matching a level-triggered line.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, trace};
use parking_lot::{Condvar, Mutex};

use crate::error::RtosError;
use crate::port::{self, CoreId, IsrScope};

/// Interrupt sources known to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptSource {
    /// Cross-core line aimed at the given core (`FROM_CPU_INTRn`).
    FromCpu(CoreId),
    /// Scheduler tick of the given core.
    Tick(CoreId),
    /// Cross-core request line of the given core.
    Crosscore(CoreId),
    /// Level interrupt of a watchdog timer group, by group index.
    Watchdog(u8),
}

/// Interrupt service routine.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// Allocation returned by [`InterruptController::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrHandle {
    source: InterruptSource,
    core: CoreId,
}

impl IntrHandle {
    pub fn source(&self) -> InterruptSource {
        self.source
    }

    pub fn core(&self) -> CoreId {
        self.core
    }
}

#[derive(Clone)]
struct Route {
    core: CoreId,
    level: u8,
    handler: InterruptHandler,
}

#[derive(Default)]
struct LineState {
    queue: VecDeque<InterruptSource>,
    stopped: bool,
}

#[derive(Default)]
struct CoreLine {
    state: Mutex<LineState>,
    wake: Condvar,
}

/// Routes interrupt sources to per-core dispatchers.
pub struct InterruptController {
    lines: Vec<CoreLine>,
    routes: Mutex<HashMap<InterruptSource, Route>>,
    delivered: Mutex<HashMap<InterruptSource, Arc<AtomicU64>>>,
}

impl InterruptController {
    pub(crate) fn new(num_cores: usize) -> Self {
        Self {
            lines: (0..num_cores).map(|_| CoreLine::default()).collect(),
            routes: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Routes `source` to `core` and installs its handler (`esp_intr_alloc`).
    pub fn allocate(
        &self,
        core: CoreId,
        source: InterruptSource,
        level: u8,
        handler: InterruptHandler,
    ) -> Result<IntrHandle, RtosError> {
        if core.index() >= self.lines.len() {
            return Err(RtosError::InvalidArg("core index out of range"));
        }
        let mut routes = self.routes.lock();
        if routes.contains_key(&source) {
            return Err(RtosError::InvalidState("interrupt source already allocated"));
        }
        routes.insert(
            source,
            Route {
                core,
                level,
                handler,
            },
        );
        trace!(target: "rtos", "allocated {source:?} on {core} at level {level}");
        Ok(IntrHandle { source, core })
    }

    /// Releases an allocation (`esp_intr_free`).
    pub fn free(&self, handle: IntrHandle) -> Result<(), RtosError> {
        let mut routes = self.routes.lock();
        match routes.get(&handle.source) {
            Some(route) if route.core == handle.core => {
                routes.remove(&handle.source);
                Ok(())
            }
            _ => Err(RtosError::InvalidArg("interrupt handle is not allocated")),
        }
    }

    pub fn is_allocated(&self, source: InterruptSource) -> bool {
        self.routes.lock().contains_key(&source)
    }

    /// Asserts `source`, queueing its handler on the routed core.
    pub fn raise(&self, source: InterruptSource) -> Result<(), RtosError> {
        let core = match self.routes.lock().get(&source) {
            Some(route) => route.core,
            None => return Err(RtosError::InvalidState("interrupt source is not routed")),
        };
        let line = &self.lines[core.index()];
        let mut state = line.state.lock();
        if !state.queue.contains(&source) {
            state.queue.push_back(source);
            line.wake.notify_one();
        }
        Ok(())
    }

    /// Number of times the handler of `source` has been entered.
    pub fn delivered_count(&self, source: InterruptSource) -> u64 {
        self.delivered
            .lock()
            .get(&source)
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    fn counter(&self, source: InterruptSource) -> Arc<AtomicU64> {
        Arc::clone(self.delivered.lock().entry(source).or_default())
    }

    /// Dispatcher loop for one core; returns once [`stop`](Self::stop) is called.
    pub(crate) fn run_dispatcher(&self, core: CoreId) {
        port::bind_core(core);
        let line = &self.lines[core.index()];
        loop {
            let source = {
                let mut state = line.state.lock();
                loop {
                    if state.stopped {
                        return;
                    }
                    if let Some(source) = state.queue.pop_front() {
                        break source;
                    }
                    line.wake.wait(&mut state);
                }
            };

            let route = self.routes.lock().get(&source).cloned();
            let Some(route) = route else {
                continue;
            };
            self.counter(source).fetch_add(1, Ordering::AcqRel);

            let _scope = IsrScope::enter(route.level);
            let handler = route.handler;
            if panic::catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                error!(target: "rtos", "handler for {source:?} on {core} panicked");
            }
        }
    }

    pub(crate) fn stop(&self) {
        for line in &self.lines {
            line.state.lock().stopped = true;
            line.wake.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn start(controller: &Arc<InterruptController>, core: CoreId) -> thread::JoinHandle<()> {
        let controller = Arc::clone(controller);
        thread::spawn(move || controller.run_dispatcher(core))
    }

    #[test]
    fn handler_runs_on_routed_core_in_isr_context() {
        let controller = Arc::new(InterruptController::new(2));
        let dispatcher = start(&controller, CoreId(1));
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        controller
            .allocate(
                CoreId(1),
                InterruptSource::FromCpu(CoreId(1)),
                5,
                Arc::new(move || {
                    let _ = tx.lock().send((
                        port::current_core(),
                        port::in_isr_context(),
                        port::int_level(),
                    ));
                }),
            )
            .unwrap();

        controller.raise(InterruptSource::FromCpu(CoreId(1))).unwrap();
        let observed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(observed, (CoreId(1), true, 5));
        assert_eq!(
            controller.delivered_count(InterruptSource::FromCpu(CoreId(1))),
            1
        );

        controller.stop();
        dispatcher.join().unwrap();
    }

    #[test]
    fn double_allocation_is_rejected() {
        let controller = InterruptController::new(1);
        let handle = controller
            .allocate(CoreId(0), InterruptSource::Watchdog(0), 1, Arc::new(|| {}))
            .unwrap();
        assert!(matches!(
            controller.allocate(CoreId(0), InterruptSource::Watchdog(0), 1, Arc::new(|| {})),
            Err(RtosError::InvalidState(_))
        ));
        controller.free(handle).unwrap();
        assert!(!controller.is_allocated(InterruptSource::Watchdog(0)));
    }

    #[test]
    fn raising_unrouted_source_fails() {
        let controller = InterruptController::new(1);
        assert!(matches!(
            controller.raise(InterruptSource::Watchdog(1)),
            Err(RtosError::InvalidState(_))
        ));
        assert!(matches!(
            controller.allocate(CoreId(3), InterruptSource::Watchdog(1), 1, Arc::new(|| {})),
            Err(RtosError::InvalidArg(_))
        ));
    }
}
