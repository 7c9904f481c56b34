//! Observability hook for the marshaling core.
//!
//! The core reports three kinds of non-fatal incidents: device contention, calls
//! aimed at destroyed targets, and failures inside marshaled calls. They are logged
//! through `tracing` and fanned out to any number of subscribers over a Tokio
//! broadcast channel, the same way measurements are distributed to GUI and storage
//! consumers elsewhere in the application.
//!
//! ```text
//! run loops ───┐
//! lock registry┼──> EventBus ──┬──> status bar / message box (UI layer)
//! task runner ─┘   (broadcast) └──> session log
//! ```
//!
//! [`CoreEvent::user_message`] is the only place user-visible strings are produced.

use crate::device_lock::DeviceId;
use crate::guard::TargetId;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default broadcast capacity when none is configured.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An incident reported by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CoreEvent {
    /// A task could not start because the device was held.
    Busy {
        /// The held device.
        device: DeviceId,
        /// Label of the operation holding the device.
        holder: String,
        /// Label of the operation that was refused.
        requested: String,
    },
    /// A marshaled call reached a target that no longer exists.
    TargetDestroyed {
        /// Identity of the destroyed target.
        target: TargetId,
        /// Its label.
        label: String,
        /// Context that dropped the call.
        context: String,
    },
    /// A marshaled call failed while executing.
    ExceptionInCall {
        /// Context the call ran in.
        context: String,
        /// Label of the target.
        label: String,
        /// Error or panic text.
        details: String,
        /// `true` when nobody was waiting for the result.
        asynchronous: bool,
    },
}

impl CoreEvent {
    /// Text suitable for a status bar or message box.
    pub fn user_message(&self) -> String {
        match self {
            CoreEvent::Busy { holder, .. } => format!("Device is busy ({holder})"),
            CoreEvent::TargetDestroyed { .. } => {
                "Target object has been already destroyed".to_string()
            }
            CoreEvent::ExceptionInCall {
                details,
                asynchronous: true,
                ..
            } => format!("Warning: exception thrown in asynchronously marshaled call: {details}"),
            CoreEvent::ExceptionInCall { details, .. } => details.clone(),
        }
    }
}

/// Receiver of core events.
pub trait EventSink: Send + Sync {
    /// Records one event. Must not block.
    fn emit(&self, event: CoreEvent);
}

/// Logs every event and broadcasts it to subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus that retains up to `capacity` unread events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: CoreEvent) {
        match &event {
            CoreEvent::Busy {
                device,
                holder,
                requested,
            } => {
                debug!(%device, %holder, %requested, "device busy");
            }
            CoreEvent::TargetDestroyed {
                target,
                label,
                context,
            } => {
                debug!(%target, %label, %context, "call dropped: target destroyed");
            }
            CoreEvent::ExceptionInCall {
                context,
                label,
                details,
                asynchronous: true,
            } => {
                warn!(
                    %context,
                    %label,
                    "exception thrown in asynchronously marshaled call: {details}"
                );
            }
            CoreEvent::ExceptionInCall {
                context,
                label,
                details,
                asynchronous: false,
            } => {
                debug!(%context, %label, %details, "marshaled call failed");
            }
        }
        // No subscribers is fine; the log line above is the record.
        let _ = self.tx.send(event);
    }
}

/// Drains every event currently queued for `rx`.
pub fn drain(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged");
            }
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn busy_message_names_holder() {
        let event = CoreEvent::Busy {
            device: DeviceId::new("dev0"),
            holder: "register write".into(),
            requested: "stream export".into(),
        };
        assert_eq!(event.user_message(), "Device is busy (register write)");
    }

    #[test]
    fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(CoreEvent::ExceptionInCall {
            context: "ui".into(),
            label: "plot".into(),
            details: "bad range".into(),
            asynchronous: false,
        });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_message(), "bad range");
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let bus = EventBus::new(1);
        bus.emit(CoreEvent::TargetDestroyed {
            target: crate::guard::Target::attach("x", "ui").id(),
            label: "x".into(),
            context: "ui".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[traced_test]
    #[test]
    fn async_failures_are_logged() {
        let bus = EventBus::default();
        bus.emit(CoreEvent::ExceptionInCall {
            context: "ui".into(),
            label: "status bar".into(),
            details: "widget gone".into(),
            asynchronous: true,
        });
        assert!(logs_contain(
            "exception thrown in asynchronously marshaled call: widget gone"
        ));
    }
}
