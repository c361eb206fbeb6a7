use smp_rtos::RtosError;
use thiserror::Error;

/// Errors returned by the cross-core call services.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Core index out of range, or no worker serves the core.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    /// The scheduler is not running or the service is not initialized.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// A non-blocking call to the same core has not been picked up yet.
    #[error("previous non-blocking call has not completed")]
    Busy,
    /// The underlying RTOS refused a resource.
    #[error(transparent)]
    Rtos(#[from] RtosError),
}

pub type IpcResult<T> = Result<T, IpcError>;
