//! # smp-rtos - Host model of a symmetric multi-core RTOS
//!
//! The cross-core call and watchdog services are written against a small RTOS
//! surface: tasks pinned to cores, blocking semaphores and task notifications,
//! a port spinlock, an interrupt controller and per-core idle/tick hooks. This
//! crate provides that surface on a hosted target, mapping every logical core
//! to its own interrupt dispatcher thread, tick source and idle task.
//!
//! ## Module Overview
//!
//! - [`port`] - Per-thread execution context (current core, ISR flag, mask level)
//! - [`task`] - Task control blocks, priorities and spawning
//! - [`primitives`] - Semaphores and task notifications
//! - [`critical`] - Recursive port spinlock (`portMUX`)
//! - [`interrupt`] - Interrupt controller with per-core dispatchers
//! - `crosscore` - Per-core request lines, such as remote backtrace printing
//! - [`hooks`] - Idle and tick hook tables
//! - [`system`] - The explicitly constructed system context

mod crosscore;
mod error;
mod tick;

pub mod critical;
pub mod hooks;
pub mod interrupt;
pub mod port;
pub mod primitives;
pub mod system;
pub mod task;

pub use critical::{CriticalGuard, PortMux};
pub use crosscore::REASON_PRINT_BACKTRACE;
pub use error::RtosError;
pub use hooks::{HookId, Hooks, IdleHook, TickHook, MAX_HOOKS};
pub use interrupt::{InterruptController, InterruptHandler, InterruptSource, IntrHandle};
pub use port::{CoreId, MAX_CORES};
pub use primitives::{Notification, NotifyAction, Semaphore, SyncError};
pub use system::{AbortHandler, SchedulerState, System, SystemConfig, SystemConfigBuilder};
pub use task::{SpawnedTask, TaskConfig, TaskHandle, TaskId, TaskState, MAX_PRIORITIES};
