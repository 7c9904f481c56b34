//! Background device work.
//!
//! A task is requested with [`TaskRunner::submit_task`]. The runner takes the
//! device's [`LockTicket`](crate::device_lock::LockTicket) on the requesting
//! thread, moves it into a job queued on a worker context, and releases it on every
//! exit path before the outcome is marshaled back to the requester's
//! [`ResultSink`].
//!
//! ```text
//! Idle -> Acquiring -> Busy
//!                   -> Running -> Completing -> Succeeded | Failed | Aborted
//! ```

mod context;
mod handle;
mod runner;
mod sink;
mod state;

pub use context::TaskContext;
pub use handle::{TaskHandle, TaskId};
pub use runner::{TaskOptions, TaskRunner};
pub use sink::{ResultSink, TaskReport};
pub use state::TaskState;
