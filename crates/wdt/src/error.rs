use smp_rtos::RtosError;
use thiserror::Error;

/// Errors returned by the watchdog services.
#[derive(Debug, Error)]
pub enum WdtError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// The task is not subscribed to the watchdog.
    #[error("task is not subscribed")]
    NotFound,
    #[error("out of memory")]
    NoMem,
    #[error(transparent)]
    Rtos(#[from] RtosError),
}

pub type WdtResult<T> = Result<T, WdtError>;
