//! Device registry and device selection.
//!
//! Devices are enumerated once when the execution context is built. Each
//! device owns the stream pool for its hardware queues.

use std::fmt;

use tracing::debug;

use crate::config::{DeviceSelectionPolicy, SchedulerConfig};
use crate::error::{KernelFlowError, Result};
use crate::runtime::GpuRuntime;
use crate::stream::StreamPool;

/// Index of a device within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One device and its stream pool.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    streams: StreamPool,
}

impl Device {
    fn new(id: DeviceId, max_streams: Option<usize>) -> Self {
        Self {
            id,
            streams: StreamPool::new(id, max_streams),
        }
    }

    /// Device id.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Stream pool of this device.
    #[must_use]
    pub fn streams(&self) -> &StreamPool {
        &self.streams
    }

    /// Mutable stream pool of this device.
    pub fn streams_mut(&mut self) -> &mut StreamPool {
        &mut self.streams
    }

    /// Number of streams currently running work.
    #[must_use]
    pub fn busy_streams(&self) -> usize {
        self.streams.busy_count()
    }
}

/// Devices visible to one execution context.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    current: DeviceId,
    next_round_robin: usize,
}

impl DeviceRegistry {
    /// Create a registry with `count` devices.
    pub fn new(count: usize, max_streams: Option<usize>) -> Result<Self> {
        if count == 0 {
            return Err(KernelFlowError::BackendUnavailable(
                "no devices available".to_string(),
            ));
        }
        Ok(Self {
            devices: (0..count)
                .map(|i| Device::new(DeviceId(i), max_streams))
                .collect(),
            current: DeviceId(0),
            next_round_robin: 0,
        })
    }

    /// Enumerate the runtime's devices, capped by `number_of_gpus`.
    pub fn enumerate(runtime: &dyn GpuRuntime, config: &SchedulerConfig) -> Result<Self> {
        let available = runtime.device_count()?;
        let count = match config.number_of_gpus {
            Some(limit) => limit.min(available),
            None => available,
        };
        debug!(
            backend = runtime.name(),
            available,
            count,
            "Enumerated devices"
        );
        Self::new(count, config.max_streams_per_device)
    }

    /// Number of devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Validate a device id.
    pub fn check(&self, id: DeviceId) -> Result<()> {
        if id.0 < self.devices.len() {
            Ok(())
        } else {
            Err(KernelFlowError::InvalidDevice {
                id,
                count: self.devices.len(),
            })
        }
    }

    /// Get a device.
    pub fn get(&self, id: DeviceId) -> Result<&Device> {
        self.check(id)?;
        Ok(&self.devices[id.0])
    }

    /// Get a device mutably.
    pub fn get_mut(&mut self, id: DeviceId) -> Result<&mut Device> {
        self.check(id)?;
        Ok(&mut self.devices[id.0])
    }

    /// Currently selected device.
    #[must_use]
    pub fn current(&self) -> DeviceId {
        self.current
    }

    /// Select the current device.
    pub fn set_current(&mut self, id: DeviceId) -> Result<()> {
        self.check(id)?;
        self.current = id;
        Ok(())
    }

    /// Iterate over devices.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Iterate over devices mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }

    /// Pick the device for an element that needs a new stream.
    ///
    /// `resident_bytes` reports how many bytes of the element's arrays are
    /// already up to date on a device; it is only consulted by
    /// [`DeviceSelectionPolicy::MinTransfer`].
    pub fn select_device<F>(&mut self, policy: DeviceSelectionPolicy, resident_bytes: F) -> DeviceId
    where
        F: Fn(DeviceId) -> usize,
    {
        let selected = match policy {
            DeviceSelectionPolicy::SingleDevice => self.current,
            DeviceSelectionPolicy::RoundRobin => {
                let id = DeviceId(self.next_round_robin % self.devices.len());
                self.next_round_robin = (id.0 + 1) % self.devices.len();
                id
            }
            DeviceSelectionPolicy::LeastLoaded => self
                .devices
                .iter()
                .min_by_key(|d| (d.busy_streams(), d.id != self.current, d.id))
                .map(|d| d.id)
                .unwrap_or(self.current),
            DeviceSelectionPolicy::MinTransfer => {
                let current = self.current;
                let mut best = (resident_bytes(current), current);
                for device in &self.devices {
                    let bytes = resident_bytes(device.id);
                    if bytes > best.0 {
                        best = (bytes, device.id);
                    }
                }
                best.1
            }
        };
        debug!(policy = %policy, device = %selected, "Selected device");
        selected
    }
}
