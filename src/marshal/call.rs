//! Call descriptors and failure capture.

use crate::error::MarshalError;
use crate::guard::GuardRef;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::oneshot;

/// How the caller waits for a marshaled call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Park the calling thread until the destination has run the call.
    Blocking,
    /// Queue the call and return at once; failures go to the event sink only.
    FireAndForget,
}

/// Result of [`ContextHandle::post`](super::ContextHandle::post).
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum Outcome<R> {
    /// The call ran and returned a value (blocking mode only).
    Success(R),
    /// The call did not produce a value.
    Failed(MarshalError),
    /// The call was queued (fire-and-forget mode).
    Dispatched,
}

impl<R> Outcome<R> {
    /// `true` for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&MarshalError> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Converts a blocking outcome into a `Result`. Returns `None` for
    /// [`Outcome::Dispatched`], which carries no result.
    pub fn into_result(self) -> Option<Result<R, MarshalError>> {
        match self {
            Outcome::Success(value) => Some(Ok(value)),
            Outcome::Failed(err) => Some(Err(err)),
            Outcome::Dispatched => None,
        }
    }
}

/// What happened when a descriptor was serviced. Used by the run loop for
/// bookkeeping and event reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallReport {
    Completed,
    TargetDestroyed,
    Failed(String),
}

/// Receives the report of a serviced call before any reply reaches the caller.
pub(crate) type Recorder<'a> = &'a dyn Fn(&GuardRef, DispatchMode, CallReport);

type Job = Box<dyn FnOnce(bool, &dyn Fn(CallReport)) + Send>;

/// One marshaled invocation in flight.
pub(crate) struct CallDescriptor {
    pub(crate) guard: GuardRef,
    pub(crate) mode: DispatchMode,
    job: Job,
}

impl CallDescriptor {
    /// A call whose result is sent back through `reply`.
    pub(crate) fn blocking<R, F>(
        guard: GuardRef,
        op: F,
        reply: oneshot::Sender<Result<R, MarshalError>>,
    ) -> Self
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let job: Job = Box::new(move |alive, record| {
            if !alive {
                record(CallReport::TargetDestroyed);
                let _ = reply.send(Err(MarshalError::TargetDestroyed));
                return;
            }
            let result = invoke(op);
            record(match &result {
                Ok(_) => CallReport::Completed,
                Err(err) => CallReport::Failed(err.to_string()),
            });
            // The caller may have given up waiting; nothing to do then.
            let _ = reply.send(result);
        });
        Self {
            guard,
            mode: DispatchMode::Blocking,
            job,
        }
    }

    /// A call nobody waits for.
    pub(crate) fn fire_and_forget<R, F>(guard: GuardRef, op: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: 'static,
    {
        let job: Job = Box::new(move |alive, record| {
            if !alive {
                record(CallReport::TargetDestroyed);
                return;
            }
            record(match invoke(op) {
                Ok(_) => CallReport::Completed,
                Err(err) => CallReport::Failed(err.to_string()),
            });
        });
        Self {
            guard,
            mode: DispatchMode::FireAndForget,
            job,
        }
    }

    /// Runs the call if its target is still alive. `record` sees the report
    /// before a blocking caller is woken.
    pub(crate) fn execute(self, record: Recorder<'_>) {
        let alive = self.guard.is_alive();
        let guard = self.guard;
        let mode = self.mode;
        (self.job)(alive, &|report| record(&guard, mode, report));
    }
}

/// Runs `op`, converting both returned errors and panics into
/// [`MarshalError::ExceptionInCall`].
pub(crate) fn invoke<R, F>(op: F) -> Result<R, MarshalError>
where
    F: FnOnce() -> anyhow::Result<R>,
{
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(MarshalError::ExceptionInCall(format!("{err:#}"))),
        Err(payload) => Err(MarshalError::ExceptionInCall(format!(
            "panic: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::Target;
    use anyhow::anyhow;
    use parking_lot::Mutex;

    fn run(desc: CallDescriptor) -> Vec<CallReport> {
        let reports = Mutex::new(Vec::new());
        desc.execute(&|_, _, report| reports.lock().push(report));
        reports.into_inner()
    }

    #[test]
    fn invoke_captures_errors_and_panics() {
        assert_eq!(invoke(|| Ok(7)), Ok(7));
        assert_eq!(
            invoke::<(), _>(|| Err(anyhow!("register 0x10 is read-only"))),
            Err(MarshalError::ExceptionInCall(
                "register 0x10 is read-only".into()
            ))
        );
        match invoke::<(), _>(|| panic!("boom")) {
            Err(MarshalError::ExceptionInCall(msg)) => assert_eq!(msg, "panic: boom"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn blocking_descriptor_skips_dead_target() {
        let target = Target::attach("view", "ui");
        let guard = target.guard();
        drop(target);

        let (tx, mut rx) = oneshot::channel();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = std::sync::Arc::clone(&ran);
        let desc = CallDescriptor::blocking(
            guard,
            move || {
                ran2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            },
            tx,
        );

        assert_eq!(run(desc), vec![CallReport::TargetDestroyed]);
        assert_eq!(rx.try_recv().unwrap(), Err(MarshalError::TargetDestroyed));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn fire_and_forget_reports_failure_text() {
        let target = Target::attach("status bar", "ui");
        let desc = CallDescriptor::fire_and_forget(target.guard(), || -> anyhow::Result<()> {
            Err(anyhow!("widget hidden"))
        });
        assert_eq!(desc.mode, DispatchMode::FireAndForget);
        assert_eq!(run(desc), vec![CallReport::Failed("widget hidden".into())]);
    }

    #[test]
    fn report_is_recorded_before_the_caller_is_woken() {
        let target = Target::attach("channel", "hw");
        let (tx, rx) = oneshot::channel::<Result<u32, MarshalError>>();
        let rx = Mutex::new(rx);
        let desc = CallDescriptor::blocking(target.guard(), || Ok(5), tx);

        let replied_first = Mutex::new(None);
        desc.execute(&|_, _, report| {
            assert_eq!(report, CallReport::Completed);
            *replied_first.lock() = Some(rx.lock().try_recv().is_ok());
        });
        assert_eq!(*replied_first.lock(), Some(false));
        assert_eq!(rx.lock().try_recv().unwrap(), Ok(5));
    }

    #[test]
    fn outcome_helpers() {
        let ok: Outcome<u32> = Outcome::Success(1);
        assert!(ok.is_success());
        assert_eq!(ok.into_result(), Some(Ok(1)));

        let dispatched: Outcome<u32> = Outcome::Dispatched;
        assert!(dispatched.failure().is_none());
        assert_eq!(dispatched.into_result(), None);
    }
}
