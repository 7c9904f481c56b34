//! # DAQ Marshal Core Library
//!
//! The concurrency core of an instrument-control console. A single-threaded front
//! end (dialogs, widgets, a script interpreter) invokes operations that must run on
//! a worker thread doing device I/O, and receives their results back on its own
//! thread, without ever touching a receiver that has already been torn down.
//!
//! ## Crate Structure
//!
//! - **`guard`**: `Target` and `GuardRef`, the lifetime tracker every marshaled call
//!   is checked against before it runs.
//! - **`marshal`**: owning contexts (`RunLoop`, `OwningContext`), the cloneable
//!   `ContextHandle` used to post calls into them, and `MarshaledFn`.
//! - **`device_lock`**: the non-blocking, one-ticket-per-device lock table.
//! - **`task`**: `TaskRunner`, worker task state machine, cooperative cancellation
//!   and result delivery through `ResultSink`.
//! - **`device`**: `SimulatedDevice`, an in-memory register/FIFO/memory channel with
//!   fault injection.
//! - **`register_batch`**: register-map read/write batches run as a single task.
//! - **`events`**: `CoreEvent` and the `EventBus` observability hook.
//! - **`error`**: `MarshalError`, `LockError`, `TaskError` and the top-level
//!   `ConsoleError`.
//! - **`config`** / **`tracing_setup`**: Figment configuration and subscriber setup.

pub mod config;
pub mod device;
pub mod device_lock;
pub mod error;
pub mod events;
pub mod guard;
pub mod marshal;
pub mod register_batch;
pub mod task;
pub mod tracing_setup;
