//! Custom error types for the marshaling core.
//!
//! Every failure the core can produce is captured at a call or task boundary and
//! converted into one of the typed errors below. None of them is allowed to take
//! down a run loop or a worker thread.
//!
//! ## Error Hierarchy
//!
//! - **`MarshalError`**: Outcome of a marshaled call that did not produce a value.
//!   `TargetDestroyed` and `ExceptionInCall` are the two failures a caller normally
//!   sees; `ContextClosed` and `ReentrantCall` guard against misuse of the run loops.
//! - **`LockError`**: Device contention. Acquisition never waits, so `Busy` is the
//!   only variant.
//! - **`TaskError`**: Why a worker task did not succeed. Cooperative cancellation is
//!   carried as `Cancelled` so an operation can propagate it with `?`; the runner maps
//!   it to the `Aborted` terminal state rather than to a failure.
//! - **`ConsoleError`**: Application-level wrapper used by configuration loading and
//!   the binary.
//!
//! `Display` output of these types is the text the surrounding UI shows the user.

use crate::device_lock::DeviceId;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ConsoleError>;

/// Failure of a marshaled call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// The receiving object was torn down before the call ran.
    #[error("Target object has been already destroyed")]
    TargetDestroyed,

    /// The operation returned an error or panicked; carries its text.
    #[error("{0}")]
    ExceptionInCall(String),

    /// The destination run loop has stopped.
    #[error("Owning context '{0}' is no longer running")]
    ContextClosed(String),

    /// The destination is already parked waiting on the caller.
    #[error("Blocking call from '{from}' into '{to}' would deadlock: '{to}' is waiting on '{from}'")]
    ReentrantCall {
        /// Context making the call.
        from: String,
        /// Context that is waiting on `from`.
        to: String,
    },
}

/// Failure to obtain exclusive device access.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another operation holds the device.
    #[error("Device is busy ({label})")]
    Busy {
        /// The requested device.
        device: DeviceId,
        /// Label of the holding operation.
        label: String,
    },
}

impl LockError {
    /// Label of the operation currently holding the device.
    pub fn holder_label(&self) -> &str {
        match self {
            LockError::Busy { label, .. } => label,
        }
    }
}

/// Failure of a worker task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The device was held when the task asked for it.
    #[error("Device is busy ({label})")]
    Busy {
        /// The requested device.
        device: DeviceId,
        /// Label of the holding operation.
        label: String,
    },

    /// Cancellation was observed at a checkpoint.
    #[error("Task was cancelled")]
    Cancelled,

    /// The time limit passed; checked at checkpoints.
    #[error("Task exceeded its time limit of {0:?}")]
    TimedOut(std::time::Duration),

    /// The device reported an I/O failure.
    #[error("Device error: {0}")]
    Device(String),

    /// Any other error returned by the operation.
    #[error("{0}")]
    Operation(String),

    /// The operation panicked.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The task ran, but the outcome could not be marshaled back.
    #[error("Failed to deliver task result: {0}")]
    Delivery(MarshalError),
}

impl TaskError {
    /// Builds a `TaskError` from an operation failure, preserving typed task errors
    /// that were propagated through `anyhow`.
    pub fn from_operation(err: anyhow::Error) -> Self {
        match err.downcast::<TaskError>() {
            Ok(task_err) => task_err,
            Err(err) => match err.downcast::<crate::device::DeviceError>() {
                Ok(device_err) => TaskError::Device(device_err.to_string()),
                Err(err) => TaskError::Operation(format!("{err:#}")),
            },
        }
    }
}

impl From<LockError> for TaskError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Busy { device, label } => TaskError::Busy { device, label },
        }
    }
}

/// Top-level error for configuration and the command-line front end.
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// Loading or merging configuration sources failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O error, e.g. spawning a worker thread.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A marshaled call failed.
    #[error("Call failed: {0}")]
    Marshal(#[from] MarshalError),

    /// A device lock was refused.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// A task failed.
    #[error("Task failed: {0}")]
    Task(#[from] TaskError),

    /// The subscriber could not be installed or the log settings are invalid.
    #[error("Failed to initialize tracing: {0}")]
    Tracing(String),
}

impl From<figment::Error> for ConsoleError {
    fn from(value: figment::Error) -> Self {
        ConsoleError::Config(Box::new(value))
    }
}
