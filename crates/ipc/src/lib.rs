//! # smp-ipc - Inter-processor calls
//!
//! Runs closures on a chosen core of an [`smp_rtos::System`].
//!
//! ## Module Overview
//!
//! - [`ipc`] - Task-level calls served by one pinned worker per core:
//!   wait-for-start, wait-for-end and the non-blocking, ISR-safe variant
//! - [`isr`] - Calls executed directly in the other core's cross-core
//!   interrupt, and the nested stall/release rendezvous built on them
//!   (feature `isr`)
//! - [`config`] - Priority policy and wake strategy
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! use smp_ipc::{Ipc, IpcConfig};
//! use smp_rtos::{CoreId, System};
//!
//! let system = System::start_default()?;
//! let ipc = Ipc::init(system, IpcConfig::default())?;
//!
//! let counter = Arc::new(AtomicU32::new(0));
//! let remote = Arc::clone(&counter);
//! ipc.call_blocking(CoreId(1), move || {
//!     remote.fetch_add(1, Ordering::SeqCst);
//! })?;
//! assert_eq!(counter.load(Ordering::SeqCst), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod worker;

pub mod config;
pub mod ipc;
#[cfg(feature = "isr")]
pub mod isr;

pub use config::{IpcConfig, IpcConfigBuilder, PriorityPolicy, WakeStrategy, IPC_STACK_SIZE};
pub use error::{IpcError, IpcResult};
pub use ipc::Ipc;
#[cfg(feature = "isr")]
pub use isr::{IsrFn, IsrIpc, IsrStats, StallState, STALL_INT_LEVEL};
