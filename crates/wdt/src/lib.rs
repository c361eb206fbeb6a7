//! # smp-wdt - Task and interrupt watchdogs
//!
//! Two independent liveness monitors built on a two-stage watchdog timer:
//!
//! - [`task_wdt`] - subscribed tasks must each reset within the timeout;
//!   stragglers are reported from the stage 0 interrupt
//! - [`int_wdt`] - the scheduler tick of every core must keep running
//! - [`hal`] - the [`WatchdogHal`] trait and [`SimMwdt`], a host timer
//!
//! Stage 0 raises the timer group's interrupt; stage 1 resets the system
//! through [`smp_rtos::System::abort`] if stage 0 went unanswered.

mod error;

pub mod hal;
pub mod int_wdt;
pub mod task_wdt;

pub use error::{WdtError, WdtResult};
pub use hal::{SimMwdt, SimMonitor, Stage, StageAction, TimerGroup, WatchdogHal, MWDT_TICK_US};
pub use int_wdt::{IntWdt, IntWdtConfig, IWDT_INITIAL_TIMEOUT};
pub use task_wdt::{TaskWatchdog, TimeoutHandler, TimeoutReport};
