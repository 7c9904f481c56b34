//! Device-wide exclusive access ("app-wide lock").
//!
//! At most one [`LockTicket`] exists per device at any instant. Acquisition never
//! waits: a second requester gets [`LockError::Busy`] carrying the label of the
//! operation in flight, and decides for itself whether to retry or tell the user.
//! Queueing is deliberately absent so that user-visible operations are never
//! silently reordered behind one another.
//!
//! Tickets release on drop, so every exit path of the holding scope (normal
//! return, `?` propagation, panic unwinding, cooperative abort) frees the device.
//!
//! # Example
//!
//! ```
//! use daq_marshal::device_lock::{DeviceId, DeviceLockRegistry};
//!
//! let locks = DeviceLockRegistry::new();
//! let dev0 = DeviceId::new("dev0");
//!
//! let ticket = locks.try_acquire(&dev0, "register write").unwrap();
//! assert!(locks.try_acquire(&dev0, "stream export").is_err());
//! drop(ticket);
//! assert!(locks.try_acquire(&dev0, "stream export").is_ok());
//! ```

use crate::error::LockError;
use crate::events::{CoreEvent, EventSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Identity of a managed device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Who holds a device and for what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketInfo {
    /// Monotonic serial, unique per registry.
    pub serial: u64,
    /// Device the ticket is for.
    pub device: DeviceId,
    /// Operation label, e.g. "register write" or "stream export".
    pub label: String,
    /// Name of the thread that acquired the ticket.
    pub holder: String,
    /// When the ticket was handed out.
    pub acquired_at: DateTime<Utc>,
}

struct RegistryInner {
    tickets: Mutex<HashMap<DeviceId, TicketInfo>>,
    next_serial: AtomicU64,
    events: Option<Arc<dyn EventSink>>,
}

/// Process-wide table of outstanding tickets.
///
/// Create one at startup and hand clones to every collaborator that needs device
/// access; clones share the same table.
#[derive(Clone)]
pub struct DeviceLockRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for DeviceLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceLockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLockRegistry")
            .field("tickets", &*self.inner.tickets.lock())
            .finish()
    }
}

impl DeviceLockRegistry {
    /// Creates an empty registry that reports nothing.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an empty registry that reports contention to `events`.
    pub fn with_events(events: Arc<dyn EventSink>) -> Self {
        Self::build(Some(events))
    }

    fn build(events: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tickets: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Takes exclusive access to `device` for the operation named `label`.
    ///
    /// Fails immediately with [`LockError::Busy`] if a ticket is outstanding.
    pub fn try_acquire(
        &self,
        device: &DeviceId,
        label: impl Into<String>,
    ) -> Result<LockTicket, LockError> {
        let label = label.into();
        let mut tickets = self.inner.tickets.lock();

        if let Some(current) = tickets.get(device) {
            let err = LockError::Busy {
                device: device.clone(),
                label: current.label.clone(),
            };
            let holder = current.label.clone();
            drop(tickets);

            debug!(%device, %holder, requested = %label, "device lock refused");
            if let Some(events) = &self.inner.events {
                events.emit(CoreEvent::Busy {
                    device: device.clone(),
                    holder,
                    requested: label,
                });
            }
            return Err(err);
        }

        let info = TicketInfo {
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
            device: device.clone(),
            label,
            holder: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
            acquired_at: Utc::now(),
        };
        tickets.insert(device.clone(), info.clone());
        drop(tickets);

        trace!(%device, label = %info.label, serial = info.serial, "device lock acquired");
        Ok(LockTicket {
            registry: Arc::clone(&self.inner),
            info,
            released: false,
        })
    }

    /// The ticket currently outstanding for `device`, if any.
    pub fn holder(&self, device: &DeviceId) -> Option<TicketInfo> {
        self.inner.tickets.lock().get(device).cloned()
    }

    /// Whether `device` is currently held.
    pub fn is_busy(&self, device: &DeviceId) -> bool {
        self.inner.tickets.lock().contains_key(device)
    }

    /// Number of devices currently held.
    pub fn held_count(&self) -> usize {
        self.inner.tickets.lock().len()
    }
}

/// Exclusive access to one device.
///
/// Released exactly once: explicitly through [`release`](Self::release) or
/// implicitly when dropped.
#[must_use = "dropping a ticket releases the device immediately"]
pub struct LockTicket {
    registry: Arc<RegistryInner>,
    info: TicketInfo,
    released: bool,
}

impl fmt::Debug for LockTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTicket")
            .field("info", &self.info)
            .field("released", &self.released)
            .finish()
    }
}

impl LockTicket {
    /// Details of this ticket.
    pub fn info(&self) -> &TicketInfo {
        &self.info
    }

    /// The device this ticket grants access to.
    pub fn device(&self) -> &DeviceId {
        &self.info.device
    }

    /// The operation label recorded at acquisition.
    pub fn label(&self) -> &str {
        &self.info.label
    }

    /// Releases the device now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut tickets = self.registry.tickets.lock();
        match tickets.get(&self.info.device) {
            Some(current) if current.serial == self.info.serial => {
                tickets.remove(&self.info.device);
                drop(tickets);
                trace!(
                    device = %self.info.device,
                    label = %self.info.label,
                    serial = self.info.serial,
                    "device lock released"
                );
            }
            other => {
                let other = other.map(|t| t.serial);
                drop(tickets);
                error!(
                    device = %self.info.device,
                    serial = self.info.serial,
                    outstanding = ?other,
                    "released ticket was not the outstanding one"
                );
            }
        }
    }
}

impl Drop for LockTicket {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{drain, EventBus};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn second_acquire_reports_current_label() {
        let locks = DeviceLockRegistry::new();
        let dev = DeviceId::new("dev0");

        let ticket = locks.try_acquire(&dev, "register write").unwrap();
        assert_eq!(ticket.label(), "register write");
        assert_eq!(ticket.device(), &dev);

        let err = locks.try_acquire(&dev, "stream export").unwrap_err();
        assert_eq!(
            err,
            LockError::Busy {
                device: dev.clone(),
                label: "register write".into()
            }
        );

        ticket.release();
        assert!(!locks.is_busy(&dev));
        assert!(locks.try_acquire(&dev, "stream export").is_ok());
    }

    #[test]
    fn devices_are_independent() {
        let locks = DeviceLockRegistry::new();
        let _a = locks.try_acquire(&"dev0".into(), "a").unwrap();
        let _b = locks.try_acquire(&"dev1".into(), "b").unwrap();
        assert_eq!(locks.held_count(), 2);
    }

    #[test]
    fn holder_is_visible_while_held() {
        let locks = DeviceLockRegistry::new();
        let dev = DeviceId::new("dev0");
        assert!(locks.holder(&dev).is_none());

        let ticket = locks.try_acquire(&dev, "script command").unwrap();
        let holder = locks.holder(&dev).unwrap();
        assert_eq!(holder, *ticket.info());
        drop(ticket);
        assert!(locks.holder(&dev).is_none());
    }

    #[test]
    fn unwinding_releases_the_ticket() {
        let locks = DeviceLockRegistry::new();
        let dev = DeviceId::new("dev0");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ticket = locks.try_acquire(&dev, "register write").unwrap();
            panic!("device exploded");
        }));
        assert!(result.is_err());
        assert!(!locks.is_busy(&dev));
    }

    #[test]
    fn exactly_one_concurrent_winner() {
        for _ in 0..200 {
            let locks = DeviceLockRegistry::new();
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|label| {
                    let locks = locks.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        // Hold the winning ticket until both threads have tried.
                        let ticket = locks.try_acquire(&"dev0".into(), label);
                        barrier.wait();
                        ticket.is_ok()
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
            assert!(!locks.is_busy(&"dev0".into()));
        }
    }

    #[test]
    fn contention_is_reported_to_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let locks = DeviceLockRegistry::with_events(Arc::new(bus));
        let dev = DeviceId::new("dev0");

        let _held = locks.try_acquire(&dev, "register write").unwrap();
        let _ = locks.try_acquire(&dev, "stream export");

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![CoreEvent::Busy {
                device: dev,
                holder: "register write".into(),
                requested: "stream export".into(),
            }]
        );
    }
}
