//! Long-lived worker threads that execute device operations.

use super::context::TaskContext;
use super::handle::{TaskCell, TaskHandle, TaskId};
use super::sink::{ResultSink, TaskReport};
use super::state::TaskState;
use crate::config::{ConsoleConfig, TaskConfig, WorkerConfig};
use crate::device_lock::{DeviceId, DeviceLockRegistry, LockTicket};
use crate::error::{LockError, MarshalError, TaskError};
use crate::events::EventSink;
use crate::guard::Target;
use crate::marshal::{panic_message, DispatchMode, OwningContext, WaitEdge};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

/// Per-submission overrides of the runner defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    /// Time limit enforced at the operation's checkpoints.
    pub timeout: Option<Duration>,
    /// How the final report is delivered. Takes precedence over the sink's mode.
    pub completion: Option<DispatchMode>,
}

impl TaskOptions {
    /// Options with a time limit.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Schedules device operations onto worker threads.
///
/// Each worker is an [`OwningContext`], so a task is itself a marshaled
/// fire-and-forget call into a worker's run loop. Failures of individual tasks are
/// captured and reported; the worker threads live until [`shutdown`](Self::shutdown).
pub struct TaskRunner {
    workers: Vec<OwningContext>,
    /// One queue target per worker; alive for the runner's lifetime.
    queues: Vec<Target>,
    locks: DeviceLockRegistry,
    completion: DispatchMode,
    timeout: Option<Duration>,
    next_worker: AtomicUsize,
    next_task: AtomicU64,
}

impl TaskRunner {
    /// Starts `workers.count` worker threads.
    pub fn new(
        workers: &WorkerConfig,
        tasks: &TaskConfig,
        locks: DeviceLockRegistry,
        events: Arc<dyn EventSink>,
    ) -> std::io::Result<Self> {
        let count = workers.count.max(1);
        let mut contexts = Vec::with_capacity(count);
        let mut queues = Vec::with_capacity(count);
        for index in 0..count {
            let name = format!("{}-{}", workers.thread_name_prefix, index);
            let ctx = OwningContext::spawn(name, Arc::clone(&events))?;
            queues.push(ctx.handle().register_target("task queue"));
            contexts.push(ctx);
        }
        info!(workers = count, completion = ?tasks.completion, "task runner started");

        Ok(Self {
            workers: contexts,
            queues,
            locks,
            completion: tasks.completion,
            timeout: tasks.timeout(),
            next_worker: AtomicUsize::new(0),
            next_task: AtomicU64::new(1),
        })
    }

    /// Starts a runner with the worker and task settings of `config`.
    pub fn from_config(
        config: &ConsoleConfig,
        locks: DeviceLockRegistry,
        events: Arc<dyn EventSink>,
    ) -> std::io::Result<Self> {
        Self::new(&config.workers, &config.tasks, locks, events)
    }

    /// The lock table tasks acquire from.
    pub fn locks(&self) -> &DeviceLockRegistry {
        &self.locks
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Requests device work with the runner's default options.
    ///
    /// The device is acquired right here, on the calling thread. If it is held, the
    /// task ends in [`TaskState::Busy`] and `sink` receives [`TaskReport::Busy`];
    /// nothing is queued. Otherwise `operation` runs on a worker thread and its
    /// outcome is marshaled back to `sink` after the device has been released.
    pub fn submit_task<T, P, F>(
        &self,
        device: impl Into<DeviceId>,
        label: impl Into<String>,
        operation: F,
        sink: ResultSink<T, P>,
    ) -> TaskHandle
    where
        F: FnOnce(&TaskContext<T, P>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
        P: Send + 'static,
    {
        self.submit_with(TaskOptions::default(), device, label, operation, sink)
    }

    /// Like [`submit_task`](Self::submit_task) with per-task options.
    pub fn submit_with<T, P, F>(
        &self,
        options: TaskOptions,
        device: impl Into<DeviceId>,
        label: impl Into<String>,
        operation: F,
        sink: ResultSink<T, P>,
    ) -> TaskHandle
    where
        F: FnOnce(&TaskContext<T, P>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
        P: Send + 'static,
    {
        let device = device.into();
        let label = label.into();
        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        let cell = TaskCell::new(id, device.clone(), label.clone());
        let handle = TaskHandle {
            cell: Arc::clone(&cell),
        };
        let mode = options
            .completion
            .or(sink.mode())
            .unwrap_or(self.completion);
        let timeout = options.timeout.or(self.timeout);
        let sink = Arc::new(sink);

        cell.advance(TaskState::Acquiring);
        let ticket = match self.locks.try_acquire(&device, label.clone()) {
            Ok(ticket) => ticket,
            Err(LockError::Busy { device, label: holder }) => {
                info!(task_id = %id, %device, %holder, requested = %label, "task refused: device busy");
                if let Err(err) = sink.deliver(TaskReport::Busy { device, holder }, mode) {
                    warn!(task_id = %id, error = %err, "busy report not delivered");
                }
                cell.advance(TaskState::Busy);
                return handle;
            }
        };

        if self.workers.is_empty() {
            drop(ticket);
            let err = MarshalError::ContextClosed("task runner".into());
            fail_unqueued(&cell, &sink, mode, err);
            return handle;
        }
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = self.workers[index].handle();
        let queue = self.queues[index].guard();
        cell.assign_worker(worker.shared());
        debug!(task_id = %id, %device, %label, worker = %worker.name(), "task queued");

        let job = {
            let cell = Arc::clone(&cell);
            let sink = Arc::clone(&sink);
            move || {
                run_task(cell, sink, ticket, operation, timeout, mode);
                Ok(())
            }
        };
        let outcome = worker.post(&queue, DispatchMode::FireAndForget, job);
        if let Some(err) = outcome.failure() {
            // The rejected job, and the ticket inside it, are already dropped.
            fail_unqueued(&cell, &sink, mode, err.clone());
        }
        handle
    }

    /// Stops every worker after the tasks already queued and joins the threads.
    ///
    /// Called from a run-loop thread, blocking deliveries of the remaining tasks to
    /// that context are refused instead of waiting for it. A worker already blocked
    /// on the calling context is stopped without being joined.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for worker in &mut self.workers {
            match WaitEdge::enter(worker.handle().shared()) {
                Ok(_edge) => worker.shutdown(),
                Err(err) => {
                    error!(worker = %worker.handle().name(), error = %err, "worker is blocked on this context");
                    worker.stop_detached();
                }
            }
        }
        self.workers.clear();
        self.queues.clear();
        info!("task runner stopped");
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fail_unqueued<T, P>(
    cell: &TaskCell,
    sink: &ResultSink<T, P>,
    mode: DispatchMode,
    err: MarshalError,
) where
    T: Send + 'static,
    P: Send + 'static,
{
    error!(task_id = %cell.id, error = %err, "task could not be queued");
    cell.advance(TaskState::Completing);
    if let Err(err) = sink.deliver(TaskReport::Failed(TaskError::Delivery(err)), mode) {
        warn!(task_id = %cell.id, error = %err, "failure report not delivered");
    }
    cell.advance(TaskState::Failed);
}

fn run_task<T, P, F>(
    cell: Arc<TaskCell>,
    sink: Arc<ResultSink<T, P>>,
    ticket: LockTicket,
    operation: F,
    timeout: Option<Duration>,
    mode: DispatchMode,
) where
    F: FnOnce(&TaskContext<T, P>) -> anyhow::Result<T>,
    T: Send + 'static,
    P: Send + 'static,
{
    let span = info_span!("task", task_id = %cell.id, device = %cell.device, label = %cell.label);
    let _entered = span.enter();

    cell.advance(TaskState::Running);
    let report = if cell.is_cancelled() {
        debug!("cancelled before start");
        TaskReport::Aborted
    } else {
        let ctx = TaskContext::new(Arc::clone(&cell), Arc::clone(&sink), timeout);
        match panic::catch_unwind(AssertUnwindSafe(|| operation(&ctx))) {
            Ok(Ok(value)) => TaskReport::Succeeded(value),
            Ok(Err(err)) => match TaskError::from_operation(err) {
                TaskError::Cancelled => TaskReport::Aborted,
                err => TaskReport::Failed(err),
            },
            Err(payload) => {
                TaskReport::Failed(TaskError::Panicked(panic_message(payload.as_ref())))
            }
        }
    };

    // The requester must find the device free once it hears the outcome.
    ticket.release();
    cell.advance(TaskState::Completing);

    let terminal = report.state();
    match &report {
        TaskReport::Failed(err) => warn!(error = %err, "task failed"),
        _ => info!(state = %terminal, "task finished"),
    }
    if let Err(err) = sink.deliver(report, mode) {
        warn!(error = %err, "task report not delivered");
    }
    cell.advance(terminal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::marshal::RunLoop;
    use anyhow::anyhow;
    use parking_lot::Mutex;

    fn runner(locks: DeviceLockRegistry) -> TaskRunner {
        TaskRunner::new(
            &WorkerConfig::default(),
            &TaskConfig::default(),
            locks,
            Arc::new(EventBus::default()),
        )
        .unwrap()
    }

    #[test]
    fn successful_task_reports_value_and_releases_device() {
        let locks = DeviceLockRegistry::new();
        let runner = runner(locks.clone());
        let (mut ui, ui_handle) = RunLoop::new("ui", Arc::new(EventBus::default()));
        let view = ui_handle.register_target("register view");
        let received = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&received);
        let probe = locks.clone();

        let sink = ResultSink::new(&ui_handle, view.guard(), move |report| {
            // Device is already free when the report arrives.
            assert!(!probe.is_busy(&"dev0".into()));
            *slot.lock() = Some(report);
            Ok(())
        });
        let task = runner.submit_task("dev0", "register read", |ctx| {
            assert_eq!(ctx.label(), "register read");
            ctx.checkpoint()?;
            Ok(0xBEEF_u32)
        }, sink);

        assert!(ui.run_until(Duration::from_secs(5), || received.lock().is_some()));
        assert_eq!(*received.lock(), Some(TaskReport::Succeeded(0xBEEF)));
        assert_eq!(task.wait_timeout(Duration::from_secs(5)), Some(TaskState::Succeeded));
        assert!(!locks.is_busy(&"dev0".into()));
    }

    #[test]
    fn operation_error_becomes_failed_report() {
        let runner = runner(DeviceLockRegistry::new());
        let (mut ui, ui_handle) = RunLoop::new("ui", Arc::new(EventBus::default()));
        let view = ui_handle.register_target("view");
        let received = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&received);

        let sink = ResultSink::new(&ui_handle, view.guard(), move |report: TaskReport<()>| {
            *slot.lock() = Some(report);
            Ok(())
        });
        runner.submit_task("dev0", "stream export", |_| Err(anyhow!("malformed frame")), sink);

        assert!(ui.run_until(Duration::from_secs(5), || received.lock().is_some()));
        assert_eq!(
            *received.lock(),
            Some(TaskReport::Failed(TaskError::Operation("malformed frame".into())))
        );
    }

    #[test]
    fn panicking_operation_leaves_worker_usable() {
        let runner = runner(DeviceLockRegistry::new());
        let (_ui, ui_handle) = RunLoop::new("ui", Arc::new(EventBus::default()));
        let view = ui_handle.register_target("view");

        let first = runner.submit_task(
            "dev0",
            "register write",
            |_| -> anyhow::Result<()> { panic!("driver bug") },
            ResultSink::new(&ui_handle, view.guard(), |_| Ok(())),
        );
        assert_eq!(first.wait_timeout(Duration::from_secs(5)), Some(TaskState::Failed));

        let second = runner.submit_task(
            "dev0",
            "register write",
            |_| Ok(()),
            ResultSink::new(&ui_handle, view.guard(), |_| Ok(())),
        );
        assert_eq!(second.wait_timeout(Duration::from_secs(5)), Some(TaskState::Succeeded));
    }

    #[test]
    fn timeout_is_reported_as_failure() {
        let runner = runner(DeviceLockRegistry::new());
        let (_ui, ui_handle) = RunLoop::new("ui", Arc::new(EventBus::default()));
        let view = ui_handle.register_target("view");

        let task = runner.submit_with(
            TaskOptions::with_timeout(Duration::from_millis(20)),
            "dev0",
            "stream capture",
            |ctx| -> anyhow::Result<()> {
                loop {
                    ctx.checkpoint()?;
                    std::thread::sleep(Duration::from_millis(2));
                }
            },
            ResultSink::new(&ui_handle, view.guard(), |_| Ok(())),
        );
        assert_eq!(task.wait_timeout(Duration::from_secs(5)), Some(TaskState::Failed));
    }

    #[test]
    fn submissions_after_shutdown_fail_without_leaking() {
        let locks = DeviceLockRegistry::new();
        let mut runner = runner(locks.clone());
        runner.shutdown();
        assert_eq!(runner.worker_count(), 0);

        let (mut ui, ui_handle) = RunLoop::new("ui", Arc::new(EventBus::default()));
        let view = ui_handle.register_target("view");
        let received = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&received);
        let sink = ResultSink::new(&ui_handle, view.guard(), move |report: TaskReport<()>| {
            *slot.lock() = Some(report);
            Ok(())
        });

        let task = runner.submit_task("dev0", "register read", |_| Ok(()), sink);
        assert_eq!(task.state(), TaskState::Failed);
        assert!(!locks.is_busy(&"dev0".into()));
        assert_eq!(ui.run_pending(), 1);
        assert!(matches!(
            *received.lock(),
            Some(TaskReport::Failed(TaskError::Delivery(MarshalError::ContextClosed(_))))
        ));
    }
}
