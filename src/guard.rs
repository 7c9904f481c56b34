//! Lifetime tracking for objects that receive marshaled calls.
//!
//! A [`Target`] is embedded in any long-lived owning-thread object (a dialog, a
//! register-map view, a script session) that other threads will call back into.
//! The object hands out [`GuardRef`] clones instead of references to itself. A
//! `GuardRef` never keeps the object alive; it only answers "is the object still
//! there?" so the run loop can drop calls aimed at something that has been torn down.
//!
//! ```text
//! owning object ──owns──> Target ──Arc──> GuardState { destroyed: RwLock<bool> }
//!                                              ^
//! pending calls / worker tasks ──GuardRef──────┘
//! ```
//!
//! The destroyed flag flips exactly once, when the `Target` is detached or dropped.
//! Readers and the single writer are serialized by the lock, so a checker never sees
//! a half-destroyed target. Neither side holds the lock for longer than the flag
//! access itself.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Stable identity of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(Uuid);

impl TargetId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct GuardState {
    id: TargetId,
    label: String,
    context: String,
    destroyed: RwLock<bool>,
}

/// Shared, non-owning reference to a target's liveness.
///
/// Cheap to clone and usable from any thread.
#[derive(Debug, Clone)]
pub struct GuardRef {
    state: Arc<GuardState>,
}

impl GuardRef {
    /// Returns `true` until the target has been detached.
    pub fn is_alive(&self) -> bool {
        !*self.state.destroyed.read()
    }

    /// Identity of the guarded target.
    pub fn id(&self) -> TargetId {
        self.state.id
    }

    /// Human-readable name given at registration.
    pub fn label(&self) -> &str {
        &self.state.label
    }

    /// Name of the owning context the target was registered with.
    pub fn context_name(&self) -> &str {
        &self.state.context
    }

    /// Whether two references guard the same target.
    pub fn same_target(&self, other: &GuardRef) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// The owning side of a guard.
///
/// Detaches the guard when dropped, so embedding a `Target` in an object makes the
/// object's own teardown the teardown hook.
#[derive(Debug)]
pub struct Target {
    guard: GuardRef,
    detached: bool,
}

impl Target {
    /// Creates a live target. Most callers go through
    /// [`ContextHandle::register_target`](crate::marshal::ContextHandle::register_target),
    /// which records the owning context's name.
    pub fn attach(label: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            guard: GuardRef {
                state: Arc::new(GuardState {
                    id: TargetId::new(),
                    label: label.into(),
                    context: context.into(),
                    destroyed: RwLock::new(false),
                }),
            },
            detached: false,
        }
    }

    /// A new reference to this target's guard.
    pub fn guard(&self) -> GuardRef {
        self.guard.clone()
    }

    /// Identity of this target.
    pub fn id(&self) -> TargetId {
        self.guard.id()
    }

    /// Tears the target down explicitly. Equivalent to dropping it.
    pub fn detach(mut self) {
        self.mark_destroyed();
    }

    fn mark_destroyed(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        let mut destroyed = self.guard.state.destroyed.write();
        if *destroyed {
            debug!(target_id = %self.guard.id(), "guard already marked destroyed");
            return;
        }
        *destroyed = true;
        drop(destroyed);

        debug!(
            target_id = %self.guard.id(),
            label = %self.guard.label(),
            context = %self.guard.context_name(),
            "target detached"
        );
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        self.mark_destroyed();
    }
}
