//! What a running operation sees of its task.

use super::handle::{TaskCell, TaskId};
use super::sink::ResultSink;
use crate::device_lock::DeviceId;
use crate::error::TaskError;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Passed to every task operation while it runs on a worker thread.
///
/// Operations call [`checkpoint`](Self::checkpoint) between device accesses and
/// propagate its error with `?`; that is the only way cancellation and time limits
/// take effect. In-flight I/O is never interrupted.
pub struct TaskContext<T, P = ()> {
    cell: Arc<TaskCell>,
    sink: Arc<ResultSink<T, P>>,
    started: Instant,
    timeout: Option<Duration>,
}

impl<T, P> TaskContext<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    pub(crate) fn new(cell: Arc<TaskCell>, sink: Arc<ResultSink<T, P>>, timeout: Option<Duration>) -> Self {
        Self {
            cell,
            sink,
            started: Instant::now(),
            timeout,
        }
    }

    /// Identity of the running task.
    pub fn task_id(&self) -> TaskId {
        self.cell.id
    }

    /// Device held for the duration of the task.
    pub fn device(&self) -> &DeviceId {
        &self.cell.device
    }

    /// Operation label the device ticket was taken under.
    pub fn label(&self) -> &str {
        &self.cell.label
    }

    /// Whether the requester asked for cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }

    /// Time left before the task's limit, if it has one.
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout
            .map(|limit| limit.saturating_sub(self.started.elapsed()))
    }

    /// Fails with [`TaskError::Cancelled`] or [`TaskError::TimedOut`] when the task
    /// should stop.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        if let Some(limit) = self.timeout {
            if self.started.elapsed() >= limit {
                return Err(TaskError::TimedOut(limit));
            }
        }
        Ok(())
    }

    /// Sends a progress value to the requester without waiting.
    pub fn report_progress(&self, value: P) {
        self.sink.progress(value);
    }
}
