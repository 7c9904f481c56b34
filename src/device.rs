//! In-memory device used by the demo and by tests.
//!
//! `SimulatedDevice` models one channel of an instrument: a register file, FIFO
//! ports that queue words, and a block of memory. Every access can be made to fail
//! on demand, either deterministically (`fail_next`) or at a seeded random rate,
//! so that task failure paths can be exercised without hardware.
//!
//! The device has no notion of exclusive access of its own; callers are expected to
//! hold the device's [`LockTicket`](crate::device_lock::LockTicket) for the
//! duration of a logical operation.

use crate::device_lock::DeviceId;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Register address.
pub type Addr = u32;
/// Register-width data word.
pub type Word = u32;

/// Errors raised by device accesses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The access failed on the bus.
    #[error("I/O fault at address {addr:#010x}")]
    Fault {
        /// Address being accessed.
        addr: Addr,
    },

    /// A FIFO read asked for more words than are queued.
    #[error("FIFO at address {addr:#010x} holds {available} words, {requested} requested")]
    FifoUnderrun {
        /// FIFO port address.
        addr: Addr,
        /// Words asked for.
        requested: usize,
        /// Words queued.
        available: usize,
    },

    /// Address beyond the simulated address space.
    #[error("Address {addr:#010x} is outside the device address space")]
    InvalidAddress {
        /// Offending address.
        addr: Addr,
    },

    /// The device was unplugged.
    #[error("Device '{0}' is disconnected")]
    Disconnected(DeviceId),
}

#[derive(Default)]
struct DeviceState {
    registers: HashMap<Addr, Word>,
    fifos: HashMap<Addr, VecDeque<Word>>,
    memory: BTreeMap<Addr, Word>,
    connected: bool,
    fail_next: u32,
    failure_rate: f64,
    accesses: u64,
}

/// A simulated instrument channel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimulatedDevice {
    id: DeviceId,
    address_limit: Addr,
    latency: Duration,
    state: Arc<Mutex<DeviceState>>,
    rng: Arc<Mutex<StdRng>>,
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("id", &self.id)
            .field("address_limit", &self.address_limit)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl SimulatedDevice {
    /// A connected device with a 64 KiB address space and no access latency.
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self::with_seed(id, 0x5d_u64)
    }

    /// Like [`new`](Self::new) with an explicit seed for random fault injection.
    pub fn with_seed(id: impl Into<DeviceId>, seed: u64) -> Self {
        Self {
            id: id.into(),
            address_limit: 0x1_0000,
            latency: Duration::ZERO,
            state: Arc::new(Mutex::new(DeviceState {
                connected: true,
                ..DeviceState::default()
            })),
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Sleeps for `latency` on every access.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Device identity used for locking.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Makes the next `count` accesses fail with [`DeviceError::Fault`].
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Makes each access fail with probability `rate` (clamped to `0.0..=1.0`).
    pub fn set_failure_rate(&self, rate: f64) {
        self.state.lock().failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Simulates unplugging or re-plugging the device.
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Number of accesses attempted so far, failed ones included.
    pub fn access_count(&self) -> u64 {
        self.state.lock().accesses
    }

    /// Reads a register. Unwritten registers read as zero.
    pub fn read_reg(&self, addr: Addr) -> Result<Word, DeviceError> {
        self.access(addr, |state| Ok(state.registers.get(&addr).copied().unwrap_or(0)))
    }

    /// Writes a register.
    pub fn write_reg(&self, addr: Addr, value: Word) -> Result<(), DeviceError> {
        self.access(addr, |state| {
            state.registers.insert(addr, value);
            Ok(())
        })
    }

    /// Pops `len` words from the FIFO at `addr`.
    pub fn read_fifo(&self, addr: Addr, len: usize) -> Result<Vec<Word>, DeviceError> {
        self.access(addr, |state| {
            let fifo = state.fifos.entry(addr).or_default();
            if fifo.len() < len {
                return Err(DeviceError::FifoUnderrun {
                    addr,
                    requested: len,
                    available: fifo.len(),
                });
            }
            Ok(fifo.drain(..len).collect())
        })
    }

    /// Pushes `words` onto the FIFO at `addr`.
    pub fn write_fifo(&self, addr: Addr, words: &[Word]) -> Result<(), DeviceError> {
        self.access(addr, |state| {
            state.fifos.entry(addr).or_default().extend(words.iter().copied());
            Ok(())
        })
    }

    /// Reads `len` consecutive words starting at `addr`.
    pub fn read_mem(&self, addr: Addr, len: usize) -> Result<Vec<Word>, DeviceError> {
        self.check_range(addr, len)?;
        self.access(addr, |state| {
            Ok((0..len as Addr)
                .map(|offset| state.memory.get(&(addr + offset)).copied().unwrap_or(0))
                .collect())
        })
    }

    /// Writes `words` to consecutive addresses starting at `addr`.
    pub fn write_mem(&self, addr: Addr, words: &[Word]) -> Result<(), DeviceError> {
        self.check_range(addr, words.len())?;
        self.access(addr, |state| {
            for (offset, word) in words.iter().enumerate() {
                state.memory.insert(addr + offset as Addr, *word);
            }
            Ok(())
        })
    }

    fn check_range(&self, addr: Addr, len: usize) -> Result<(), DeviceError> {
        let end = u64::from(addr) + len as u64;
        if end > u64::from(self.address_limit) {
            return Err(DeviceError::InvalidAddress { addr });
        }
        Ok(())
    }

    fn access<R>(
        &self,
        addr: Addr,
        op: impl FnOnce(&mut DeviceState) -> Result<R, DeviceError>,
    ) -> Result<R, DeviceError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let mut state = self.state.lock();
        state.accesses += 1;
        if !state.connected {
            return Err(DeviceError::Disconnected(self.id.clone()));
        }
        if addr >= self.address_limit {
            return Err(DeviceError::InvalidAddress { addr });
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DeviceError::Fault { addr });
        }
        if state.failure_rate > 0.0 && self.rng.lock().gen_bool(state.failure_rate) {
            return Err(DeviceError::Fault { addr });
        }
        trace!(device = %self.id, addr, "device access");
        op(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_default_to_zero_and_keep_writes() {
        let dev = SimulatedDevice::new("dev0");
        assert_eq!(dev.read_reg(0x10), Ok(0));
        dev.write_reg(0x10, 0xCAFE).unwrap();
        assert_eq!(dev.read_reg(0x10), Ok(0xCAFE));
        assert_eq!(dev.access_count(), 3);
    }

    #[test]
    fn fifo_is_first_in_first_out() {
        let dev = SimulatedDevice::new("dev0");
        dev.write_fifo(0x20, &[1, 2, 3]).unwrap();
        assert_eq!(dev.read_fifo(0x20, 2), Ok(vec![1, 2]));
        assert_eq!(
            dev.read_fifo(0x20, 2),
            Err(DeviceError::FifoUnderrun {
                addr: 0x20,
                requested: 2,
                available: 1
            })
        );
    }

    #[test]
    fn memory_range_is_checked() {
        let dev = SimulatedDevice::new("dev0");
        dev.write_mem(0x100, &[7, 8]).unwrap();
        assert_eq!(dev.read_mem(0xFF, 4), Ok(vec![0, 7, 8, 0]));
        assert!(matches!(
            dev.write_mem(0xFFFF, &[1, 2]),
            Err(DeviceError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn injected_faults_are_consumed() {
        let dev = SimulatedDevice::new("dev0");
        dev.fail_next(2);
        assert_eq!(dev.read_reg(4), Err(DeviceError::Fault { addr: 4 }));
        assert_eq!(dev.write_reg(4, 1), Err(DeviceError::Fault { addr: 4 }));
        assert_eq!(dev.read_reg(4), Ok(0));
    }

    #[test]
    fn full_failure_rate_always_fails() {
        let dev = SimulatedDevice::with_seed("dev0", 42);
        dev.set_failure_rate(1.0);
        for addr in 0..16 {
            assert!(dev.read_reg(addr).is_err());
        }
        dev.set_failure_rate(0.0);
        assert!(dev.read_reg(0).is_ok());
    }

    #[test]
    fn disconnected_device_refuses_access() {
        let dev = SimulatedDevice::new("dev1");
        dev.set_connected(false);
        assert_eq!(
            dev.read_reg(0),
            Err(DeviceError::Disconnected(DeviceId::new("dev1")))
        );
    }
}
