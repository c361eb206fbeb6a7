//! Cross-core requests (`esp_crosscore_int`).
//!
//! Each core owns one request line. A sender ORs a reason into the target's
//! pending word and raises the line; the handler on the target drains the
//! word and acts on every reason it finds.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{error, trace};

use crate::port::CoreId;

/// Ask the target core to log its own backtrace.
pub const REASON_PRINT_BACKTRACE: u32 = 1 << 0;

/// Priority level of the request line.
pub(crate) const CROSSCORE_LEVEL: u8 = 1;

pub(crate) struct Crosscore {
    reasons: Vec<AtomicU32>,
    requests: Vec<AtomicU64>,
}

impl Crosscore {
    pub(crate) fn new(cores: usize) -> Self {
        Self {
            reasons: (0..cores).map(|_| AtomicU32::new(0)).collect(),
            requests: (0..cores).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Marks `reason` pending on `core`; the caller raises the line.
    pub(crate) fn post(&self, core: CoreId, reason: u32) {
        if let Some(word) = self.reasons.get(core.index()) {
            word.fetch_or(reason, Ordering::AcqRel);
        }
    }

    pub(crate) fn count(&self, core: CoreId) {
        if let Some(count) = self.requests.get(core.index()) {
            count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn requests(&self, core: CoreId) -> u64 {
        self.requests
            .get(core.index())
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    /// Request line handler, runs on the dispatcher of `core`.
    pub(crate) fn handle(&self, core: CoreId) {
        let Some(word) = self.reasons.get(core.index()) else {
            return;
        };
        let reasons = word.swap(0, Ordering::AcqRel);
        trace!(target: "rtos", "crosscore request on {core}: {reasons:#x}");
        if reasons & REASON_PRINT_BACKTRACE != 0 {
            let backtrace = Backtrace::force_capture();
            error!(target: "rtos", "Print {core} backtrace\n{backtrace}");
        }
    }
}
