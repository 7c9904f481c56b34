//! Delivery of task results and progress to the requesting context.

use super::state::TaskState;
use crate::device_lock::DeviceId;
use crate::error::{MarshalError, TaskError};
use crate::guard::GuardRef;
use crate::marshal::{ContextHandle, DispatchMode};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Final result of a worker task as seen by the requester.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReport<T> {
    /// Value returned by the operation.
    Succeeded(T),
    /// Why the operation produced no value.
    Failed(TaskError),
    /// The task was cancelled.
    Aborted,
    /// The device was held by the operation named `holder`.
    Busy { device: DeviceId, holder: String },
}

impl<T> TaskReport<T> {
    /// Terminal state that corresponds to this report.
    pub fn state(&self) -> TaskState {
        match self {
            TaskReport::Succeeded(_) => TaskState::Succeeded,
            TaskReport::Failed(_) => TaskState::Failed,
            TaskReport::Aborted => TaskState::Aborted,
            TaskReport::Busy { .. } => TaskState::Busy,
        }
    }

    /// Collapses the report into a `Result`, with `Aborted` as
    /// [`TaskError::Cancelled`].
    pub fn into_result(self) -> Result<T, TaskError> {
        match self {
            TaskReport::Succeeded(value) => Ok(value),
            TaskReport::Failed(err) => Err(err),
            TaskReport::Aborted => Err(TaskError::Cancelled),
            TaskReport::Busy { device, holder } => Err(TaskError::Busy {
                device,
                label: holder,
            }),
        }
    }
}

type CompletionFn<T> = Box<dyn FnOnce(TaskReport<T>) -> anyhow::Result<()> + Send>;
type ProgressFn<P> = Arc<dyn Fn(P) -> anyhow::Result<()> + Send + Sync>;

/// A guarded target in an owning context that receives one task's outcome.
///
/// The completion callback runs at most once, on the target's context, and only
/// while the target is alive. Progress callbacks are always fire-and-forget.
pub struct ResultSink<T, P = ()> {
    context: ContextHandle,
    guard: GuardRef,
    mode: Option<DispatchMode>,
    completion: Mutex<Option<CompletionFn<T>>>,
    progress: Option<ProgressFn<P>>,
}

impl<T, P> fmt::Debug for ResultSink<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSink")
            .field("context", &self.context.name())
            .field("target", &self.guard.label())
            .field("mode", &self.mode)
            .field("delivered", &self.completion.lock().is_none())
            .finish()
    }
}

impl<T> ResultSink<T>
where
    T: Send + 'static,
{
    /// Delivers the report to `on_complete`, run on `context` while `guard` is alive.
    pub fn new<F>(context: &ContextHandle, guard: GuardRef, on_complete: F) -> Self
    where
        F: FnOnce(TaskReport<T>) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            context: context.clone(),
            guard,
            mode: None,
            completion: Mutex::new(Some(Box::new(on_complete))),
            progress: None,
        }
    }
}

impl<T, P> ResultSink<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    /// Also forwards progress values of type `Q` reported by the operation.
    pub fn with_progress<Q, F>(self, on_progress: F) -> ResultSink<T, Q>
    where
        Q: Send + 'static,
        F: Fn(Q) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        ResultSink {
            context: self.context,
            guard: self.guard,
            mode: self.mode,
            completion: self.completion,
            progress: Some(Arc::new(on_progress)),
        }
    }

    /// Overrides the runner's default completion mode for this sink.
    ///
    /// Use [`DispatchMode::Blocking`] when the requester must have processed the
    /// result before the worker moves on, [`DispatchMode::FireAndForget`] for
    /// side-effecting callbacks such as UI updates.
    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Completion mode requested by this sink, if any.
    pub fn mode(&self) -> Option<DispatchMode> {
        self.mode
    }

    /// The guard of the receiving target.
    pub fn guard(&self) -> &GuardRef {
        &self.guard
    }

    /// Sends the final report. Subsequent calls are ignored.
    pub(crate) fn deliver(&self, report: TaskReport<T>, mode: DispatchMode) -> Result<(), MarshalError> {
        let Some(on_complete) = self.completion.lock().take() else {
            error!(target = %self.guard.label(), "task report delivered twice; ignoring");
            return Ok(());
        };
        let op = move || on_complete(report);
        match mode {
            DispatchMode::Blocking => self.context.call(&self.guard, op),
            DispatchMode::FireAndForget => self
                .context
                .post(&self.guard, DispatchMode::FireAndForget, op)
                .failure()
                .cloned()
                .map_or(Ok(()), Err),
        }
    }

    /// Forwards one progress value. Dropped if no progress callback was set.
    pub(crate) fn progress(&self, value: P) {
        if let Some(on_progress) = &self.progress {
            let on_progress = Arc::clone(on_progress);
            self.context
                .call_async(&self.guard, move || on_progress(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::marshal::RunLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn completion_runs_once() {
        let (mut run_loop, handle) = RunLoop::new("ui", Arc::new(EventBus::default()));
        let target = handle.register_target("dialog");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let sink: ResultSink<u32> = ResultSink::new(&handle, target.guard(), move |report| {
            assert_eq!(report, TaskReport::Succeeded(5));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        sink.deliver(TaskReport::Succeeded(5), DispatchMode::FireAndForget)
            .unwrap();
        sink.deliver(TaskReport::Succeeded(6), DispatchMode::FireAndForget)
            .unwrap();
        assert!(run_loop.run_until(Duration::from_secs(1), || calls.load(Ordering::SeqCst) == 1));
        run_loop.run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_delivery_to_dead_target_reports_it() {
        let (_run_loop, handle) = RunLoop::new("ui", Arc::new(EventBus::default()));
        let target = handle.register_target("dialog");
        let sink: ResultSink<()> = ResultSink::new(&handle, target.guard(), |_| Ok(()))
            .with_mode(DispatchMode::Blocking);
        assert_eq!(sink.mode(), Some(DispatchMode::Blocking));
        drop(target);

        // Same thread, so the call degenerates to an inline check.
        assert_eq!(
            sink.deliver(TaskReport::Aborted, DispatchMode::Blocking),
            Err(MarshalError::TargetDestroyed)
        );
    }

    #[test]
    fn report_maps_to_terminal_state() {
        assert_eq!(TaskReport::Succeeded(()).state(), TaskState::Succeeded);
        assert_eq!(TaskReport::<()>::Aborted.state(), TaskState::Aborted);
        let busy = TaskReport::<()>::Busy {
            device: DeviceId::new("dev0"),
            holder: "register write".into(),
        };
        assert_eq!(busy.state(), TaskState::Busy);
        assert!(matches!(
            busy.into_result(),
            Err(TaskError::Busy { label, .. }) if label == "register write"
        ));
    }
}
