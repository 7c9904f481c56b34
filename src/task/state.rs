//! Worker task lifecycle.

use serde::Serialize;
use std::fmt;

/// Lifecycle state of a worker task.
///
/// ```text
/// Idle -> Acquiring -> Busy                       (terminal)
///                   -> Running -> Completing -> Succeeded | Failed | Aborted
///                   -> Completing                 (job could not be queued)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    /// Created, nothing attempted yet.
    Idle,
    /// Trying to take the device ticket.
    Acquiring,
    /// The device was held by another operation.
    Busy,
    /// The operation is executing on a worker.
    Running,
    /// Device released; the report is being delivered.
    Completing,
    /// The operation returned a value.
    Succeeded,
    /// The operation failed, panicked or timed out, or could not be queued.
    Failed,
    /// Cancelled cooperatively.
    Aborted,
}

impl TaskState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Busy | TaskState::Succeeded | TaskState::Failed | TaskState::Aborted
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, Busy)
                | (Acquiring, Running)
                | (Acquiring, Completing)
                | (Running, Completing)
                | (Completing, Succeeded)
                | (Completing, Failed)
                | (Completing, Aborted)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Idle => "idle",
            TaskState::Acquiring => "acquiring",
            TaskState::Busy => "busy",
            TaskState::Running => "running",
            TaskState::Completing => "completing",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::TaskState::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [Idle, Acquiring, Running, Completing, Succeeded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        assert!(Succeeded.is_terminal());
    }

    #[test]
    fn running_requires_acquisition() {
        assert!(!Idle.can_transition_to(Running));
        assert!(!Busy.can_transition_to(Running));
        assert!(!Completing.can_transition_to(Running));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [Busy, Succeeded, Failed, Aborted] {
            assert!(terminal.is_terminal());
            for next in [Idle, Acquiring, Running, Completing, Succeeded, Failed, Aborted] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }
}
