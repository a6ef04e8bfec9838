//! CPU runtime implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use kernelflow_core::device::DeviceId;
use kernelflow_core::error::{KernelFlowError, Result};
use kernelflow_core::runtime::{EventHandle, GpuRuntime, MemoryHandle, StreamHandle};

use crate::memory::HostMemory;

/// A call received by the simulated runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuCall {
    /// Memory allocated.
    Allocate {
        /// New allocation.
        memory: MemoryHandle,
        /// Size in bytes.
        bytes: usize,
    },
    /// Memory released.
    Free(MemoryHandle),
    /// Stream created.
    CreateStream {
        /// Owning device.
        device: DeviceId,
        /// New stream.
        stream: StreamHandle,
    },
    /// Stream destroyed.
    DestroyStream(StreamHandle),
    /// Host waited for a stream.
    SynchronizeStream(StreamHandle),
    /// Host waited for a device.
    SynchronizeDevice(DeviceId),
    /// Active device changed.
    SetActiveDevice(DeviceId),
    /// Event recorded on a stream.
    RecordEvent {
        /// Stream the event belongs to.
        stream: StreamHandle,
        /// New event.
        event: EventHandle,
    },
    /// Stream made to wait for an event.
    WaitEvent {
        /// Waiting stream.
        stream: StreamHandle,
        /// Awaited event.
        event: EventHandle,
    },
    /// Event destroyed.
    DestroyEvent(EventHandle),
    /// Memory prefetched to a device.
    Prefetch {
        /// Prefetched allocation.
        memory: MemoryHandle,
        /// Target device.
        device: DeviceId,
    },
}

/// Snapshot of runtime activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuRuntimeStats {
    /// Live allocations.
    pub live_allocations: usize,
    /// Bytes held by live allocations.
    pub bytes_in_use: usize,
    /// Streams created so far.
    pub streams_created: u64,
    /// Streams not yet destroyed.
    pub live_streams: usize,
    /// Events not yet destroyed.
    pub live_events: usize,
    /// Stream synchronizations.
    pub stream_synchronizations: u64,
    /// Device synchronizations.
    pub device_synchronizations: u64,
}

/// In-process implementation of [`GpuRuntime`].
///
/// Simulates `device_count` devices sharing host memory.
pub struct CpuRuntime {
    /// Number of simulated devices.
    device_count: usize,
    /// Currently active device.
    active: AtomicUsize,
    /// Allocations.
    memory: RwLock<HostMemory>,
    /// Live streams and their device.
    streams: RwLock<HashMap<StreamHandle, DeviceId>>,
    /// Live events and the stream they were recorded on.
    events: RwLock<HashMap<EventHandle, StreamHandle>>,
    /// Handle counter for streams and events.
    next_handle: AtomicU64,
    /// Total streams created.
    streams_created: AtomicU64,
    /// Total stream synchronizations.
    stream_syncs: AtomicU64,
    /// Total device synchronizations.
    device_syncs: AtomicU64,
    /// Calls received, oldest first.
    calls: Mutex<Vec<CpuCall>>,
}

impl CpuRuntime {
    /// Create a runtime with one device.
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// Create a runtime simulating `device_count` devices.
    pub fn with_devices(device_count: usize) -> Self {
        info!("Initializing CPU runtime (devices={})", device_count);

        Self {
            device_count,
            active: AtomicUsize::new(0),
            memory: RwLock::new(HostMemory::new()),
            streams: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            streams_created: AtomicU64::new(0),
            stream_syncs: AtomicU64::new(0),
            device_syncs: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<CpuCall> {
        self.calls.lock().clone()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Activity snapshot.
    pub fn stats(&self) -> CpuRuntimeStats {
        let memory = self.memory.read();
        CpuRuntimeStats {
            live_allocations: memory.len(),
            bytes_in_use: memory.bytes_in_use(),
            streams_created: self.streams_created.load(Ordering::Relaxed),
            live_streams: self.streams.read().len(),
            live_events: self.events.read().len(),
            stream_synchronizations: self.stream_syncs.load(Ordering::Relaxed),
            device_synchronizations: self.device_syncs.load(Ordering::Relaxed),
        }
    }

    /// Read `len` bytes of an allocation.
    pub fn read_bytes(&self, memory: MemoryHandle, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.memory.read().read(memory, offset, len)
    }

    /// Write bytes into an allocation.
    pub fn write_bytes(&self, memory: MemoryHandle, offset: usize, bytes: &[u8]) -> Result<()> {
        self.memory.write().write(memory, offset, bytes)
    }

    /// Read `count` little-endian `f32` values.
    pub fn read_f32(&self, memory: MemoryHandle, offset: usize, count: usize) -> Result<Vec<f32>> {
        let bytes = self.read_bytes(memory, offset, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Write little-endian `f32` values.
    pub fn write_f32(&self, memory: MemoryHandle, offset: usize, values: &[f32]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_bytes(memory, offset, &bytes)
    }

    fn log(&self, call: CpuCall) {
        self.calls.lock().push(call);
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_device(&self, device: DeviceId) -> Result<()> {
        if device.0 < self.device_count {
            Ok(())
        } else {
            Err(KernelFlowError::InvalidDevice {
                id: device,
                count: self.device_count,
            })
        }
    }

    fn check_stream(&self, stream: StreamHandle) -> Result<DeviceId> {
        self.streams
            .read()
            .get(&stream)
            .copied()
            .ok_or_else(|| KernelFlowError::backend(format!("unknown {}", stream)))
    }
}

impl Default for CpuRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuRuntime for CpuRuntime {
    fn name(&self) -> &str {
        "cpu"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.device_count)
    }

    fn allocate(&self, bytes: usize) -> Result<MemoryHandle> {
        let memory = self.memory.write().allocate(bytes);
        self.log(CpuCall::Allocate { memory, bytes });
        Ok(memory)
    }

    fn free(&self, memory: MemoryHandle) -> Result<()> {
        self.memory.write().free(memory)?;
        self.log(CpuCall::Free(memory));
        Ok(())
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle> {
        self.check_device(device)?;
        let active = self.active.load(Ordering::Acquire);
        if active != device.0 {
            return Err(KernelFlowError::backend(format!(
                "cannot create a stream on device {} while device {} is active",
                device, active
            )));
        }
        let stream = StreamHandle(self.next_handle());
        self.streams.write().insert(stream, device);
        self.streams_created.fetch_add(1, Ordering::Relaxed);
        self.log(CpuCall::CreateStream { device, stream });
        debug!("Created CPU stream {} on device {}", stream, device);
        Ok(stream)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        if self.streams.write().remove(&stream).is_none() {
            return Err(KernelFlowError::backend(format!("unknown {}", stream)));
        }
        self.log(CpuCall::DestroyStream(stream));
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()> {
        self.check_stream(stream)?;
        self.stream_syncs.fetch_add(1, Ordering::Relaxed);
        self.log(CpuCall::SynchronizeStream(stream));
        Ok(())
    }

    fn synchronize_device(&self, device: DeviceId) -> Result<()> {
        self.check_device(device)?;
        self.device_syncs.fetch_add(1, Ordering::Relaxed);
        self.log(CpuCall::SynchronizeDevice(device));
        Ok(())
    }

    fn set_active_device(&self, device: DeviceId) -> Result<()> {
        self.check_device(device)?;
        self.active.store(device.0, Ordering::Release);
        self.log(CpuCall::SetActiveDevice(device));
        Ok(())
    }

    fn active_device(&self) -> Result<DeviceId> {
        Ok(DeviceId(self.active.load(Ordering::Acquire)))
    }

    fn record_event(&self, stream: StreamHandle) -> Result<EventHandle> {
        self.check_stream(stream)?;
        let event = EventHandle(self.next_handle());
        self.events.write().insert(event, stream);
        self.log(CpuCall::RecordEvent { stream, event });
        Ok(event)
    }

    fn wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()> {
        self.check_stream(stream)?;
        if !self.events.read().contains_key(&event) {
            return Err(KernelFlowError::backend(format!("unknown event {:?}", event)));
        }
        self.log(CpuCall::WaitEvent { stream, event });
        Ok(())
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        if self.events.write().remove(&event).is_none() {
            return Err(KernelFlowError::backend(format!("unknown event {:?}", event)));
        }
        self.log(CpuCall::DestroyEvent(event));
        Ok(())
    }

    fn prefetch(
        &self,
        memory: MemoryHandle,
        device: DeviceId,
        stream: Option<StreamHandle>,
    ) -> Result<()> {
        self.check_device(device)?;
        if let Some(stream) = stream {
            self.check_stream(stream)?;
        }
        if !self.memory.read().contains(memory) {
            return Err(KernelFlowError::backend(format!(
                "unknown allocation {:?}",
                memory
            )));
        }
        self.log(CpuCall::Prefetch { memory, device });
        Ok(())
    }
}
