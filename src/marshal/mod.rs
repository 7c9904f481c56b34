//! Safe cross-thread invocation.
//!
//! Operations are moved to the thread that owns their target and executed there,
//! never concurrently with other calls in that context. Blocking calls return an
//! [`Outcome`]; fire-and-forget calls report failures only to the event sink.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use daq_marshal::events::EventBus;
//! use daq_marshal::marshal::{DispatchMode, OwningContext, Outcome};
//!
//! let hw = OwningContext::spawn("hw", Arc::new(EventBus::default())).unwrap();
//! let channel = hw.handle().register_target("channel 0");
//!
//! let outcome = hw
//!     .handle()
//!     .post(&channel.guard(), DispatchMode::Blocking, || Ok(0x1234_u32));
//! assert_eq!(outcome, Outcome::Success(0x1234));
//! ```

mod call;
mod functor;
mod run_loop;

pub use call::{DispatchMode, Outcome};
pub use functor::MarshaledFn;
pub use run_loop::{ContextHandle, ContextStats, OwningContext, RunLoop};

pub(crate) use call::panic_message;
pub(crate) use run_loop::{ContextShared, WaitEdge};
