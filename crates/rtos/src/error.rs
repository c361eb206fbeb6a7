use std::io;

use thiserror::Error;

/// Errors reported by the RTOS model.
#[derive(Debug, Error)]
pub enum RtosError {
    /// A core index, priority or configuration value is out of range.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    /// The operation does not fit the current system state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// A fixed-size table is full.
    #[error("no free slot: {0}")]
    NoMem(&'static str),
    /// The host refused to create a thread for a task.
    #[error("failed to spawn task: {0}")]
    Spawn(#[from] io::Error),
}
