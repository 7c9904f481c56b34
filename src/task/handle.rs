//! Shared task record and the requester's handle to it.

use super::state::TaskState;
use crate::device_lock::DeviceId;
use crate::marshal::{ContextShared, WaitEdge};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Identity of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// State shared between the runner, the worker and every handle.
pub(crate) struct TaskCell {
    pub(crate) id: TaskId,
    pub(crate) device: DeviceId,
    pub(crate) label: String,
    state: Mutex<TaskState>,
    changed: Condvar,
    cancelled: AtomicBool,
    /// Worker context the task was queued on.
    worker: OnceLock<Arc<ContextShared>>,
}

impl TaskCell {
    pub(crate) fn new(id: TaskId, device: DeviceId, label: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            device,
            label,
            state: Mutex::new(TaskState::Idle),
            changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
            worker: OnceLock::new(),
        })
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Moves to `next`. Illegal transitions are logged and ignored.
    pub(crate) fn advance(&self, next: TaskState) {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            error!(task_id = %self.id, from = %*state, to = %next, "illegal task transition");
            debug_assert!(false, "illegal task transition {} -> {}", *state, next);
            return;
        }
        trace!(task_id = %self.id, from = %*state, to = %next, "task transition");
        *state = next;
        drop(state);
        self.changed.notify_all();
    }

    pub(crate) fn assign_worker(&self, worker: &Arc<ContextShared>) {
        let _ = self.worker.set(Arc::clone(worker));
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Parks until terminal. Returns `None` without parking when the worker is
    /// itself blocked on the calling context.
    fn wait_terminal(&self, deadline: Option<Instant>) -> Option<TaskState> {
        let state = self.state();
        if state.is_terminal() {
            return Some(state);
        }
        // While parked, blocking deliveries back to this context are refused.
        let _edge = match self.worker.get().map(WaitEdge::enter).transpose() {
            Ok(edge) => edge,
            Err(err) => {
                error!(task_id = %self.id, error = %err, "task is waiting on this context; not parking");
                return None;
            }
        };

        let mut state = self.state.lock();
        while !state.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return state.is_terminal().then_some(*state);
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        Some(*state)
    }
}

/// The requester's view of a submitted task.
///
/// Cloneable; every clone observes the same task.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) cell: Arc<TaskCell>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id)
            .field("device", &self.cell.device)
            .field("label", &self.cell.label)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskHandle {
    /// Identity of the task.
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    /// Device the task operates on.
    pub fn device(&self) -> &DeviceId {
        &self.cell.device
    }

    /// Operation label.
    pub fn label(&self) -> &str {
        &self.cell.label
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// Whether the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Requests cooperative cancellation. Callable from any thread; the operation
    /// notices at its next checkpoint.
    pub fn cancel(&self) {
        trace!(task_id = %self.cell.id, "cancellation requested");
        self.cell.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.cell.is_cancelled()
    }

    /// Parks until the task is terminal and returns its final state.
    ///
    /// While a run-loop thread waits here, blocking deliveries to its context fail
    /// with [`MarshalError::ReentrantCall`](crate::error::MarshalError::ReentrantCall)
    /// and the task still finishes. If the worker is already blocked delivering
    /// to the calling context, returns the current, non-terminal state at once.
    pub fn wait(&self) -> TaskState {
        self.cell.wait_terminal(None).unwrap_or_else(|| self.state())
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskState> {
        self.cell.wait_terminal(Some(Instant::now() + timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cell() -> Arc<TaskCell> {
        TaskCell::new(TaskId(1), DeviceId::new("dev0"), "register write".into())
    }

    #[test]
    fn wait_returns_once_terminal() {
        let cell = cell();
        let handle = TaskHandle {
            cell: Arc::clone(&cell),
        };
        assert_eq!(handle.wait_timeout(Duration::from_millis(5)), None);

        let worker = thread::spawn(move || {
            cell.advance(TaskState::Acquiring);
            cell.advance(TaskState::Running);
            cell.advance(TaskState::Completing);
            cell.advance(TaskState::Succeeded);
        });
        assert_eq!(handle.wait(), TaskState::Succeeded);
        worker.join().unwrap();
        assert!(handle.is_finished());
    }

    #[test]
    fn cancel_is_visible_to_all_clones() {
        let handle = TaskHandle { cell: cell() };
        let other = handle.clone();
        handle.cancel();
        assert!(other.is_cancel_requested());
        assert_eq!(other.id().to_string(), "task-1");
    }
}
