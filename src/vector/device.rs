//! Accelerator residency backends.
//!
//! The index keeps its working set in host memory; a backend decides whether
//! a device can hold a mirror of it. Transfers are best-effort: when no
//! device is present, or it runs out of room, the index stays on the CPU.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A compute device that can hold a copy of the index vectors.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Reserve `bytes` of device memory. `Err` carries the reason.
    fn reserve(&self, bytes: usize) -> Result<(), String>;

    /// Return `bytes` previously reserved.
    fn release(&self, bytes: usize);
}

/// Host-only build: no device, every transfer falls back to CPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevice;

impl DeviceBackend for NoDevice {
    fn name(&self) -> &str {
        "none"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn reserve(&self, _bytes: usize) -> Result<(), String> {
        Err("no accelerator device available".to_string())
    }

    fn release(&self, _bytes: usize) {}
}

#[derive(Debug)]
struct DeviceState {
    available: bool,
    capacity: usize,
    used: usize,
}

/// A device with a fixed memory budget and no compute of its own.
///
/// Used to exercise residency handling on machines without an accelerator.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                available: true,
                capacity: capacity_bytes,
                used: 0,
            })),
        }
    }

    /// Simulate the device disappearing or coming back.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    pub fn capacity_bytes(&self) -> usize {
        self.state.lock().capacity
    }
}

impl DeviceBackend for SimulatedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    fn is_available(&self) -> bool {
        self.state.lock().available
    }

    fn reserve(&self, bytes: usize) -> Result<(), String> {
        let mut state = self.state.lock();
        if !state.available {
            return Err("device is unavailable".to_string());
        }
        let wanted = state.used.saturating_add(bytes);
        if wanted > state.capacity {
            return Err(format!(
                "device holds {} of {} bytes, cannot add {bytes}",
                state.used, state.capacity
            ));
        }
        state.used = wanted;
        Ok(())
    }

    fn release(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(bytes);
    }
}

/// Default backend for this build.
pub fn default_device() -> Arc<dyn DeviceBackend> {
    Arc::new(NoDevice)
}
