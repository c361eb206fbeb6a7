//! Per-core scheduler tick sources.
//!
//! Each core gets a thread that raises that core's tick interrupt at the
//! configured rate. Deadlines are absolute so the tick does not drift with
//! dispatch latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::warn;

use crate::error::RtosError;
use crate::interrupt::{InterruptController, InterruptSource};
use crate::port::CoreId;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Highest supported tick rate.
pub(crate) const MAX_TICK_RATE_HZ: u32 = 10_000;

/// Period of one tick at `rate_hz`.
pub(crate) fn tick_period(rate_hz: u32) -> Duration {
    Duration::from_nanos(NSEC_PER_SEC / rate_hz as u64)
}

pub(crate) fn spawn_ticker(
    core: CoreId,
    period: Duration,
    interrupts: Arc<InterruptController>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, RtosError> {
    let handle = thread::Builder::new()
        .name(format!("tick{}", core.0))
        .spawn(move || ticker_thread(core, period, &interrupts, &running))?;
    Ok(handle)
}

fn ticker_thread(
    core: CoreId,
    period: Duration,
    interrupts: &InterruptController,
    running: &AtomicBool,
) {
    let mut next_tick = Instant::now();

    while running.load(Ordering::Acquire) {
        next_tick += period;

        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        }

        if let Err(err) = interrupts.raise(InterruptSource::Tick(core)) {
            warn!(target: "rtos", "tick on {core} dropped: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_period_from_rate() {
        assert_eq!(tick_period(100), Duration::from_millis(10));
        assert_eq!(tick_period(1000), Duration::from_micros(1000));
    }
}
