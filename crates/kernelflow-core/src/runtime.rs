//! Runtime collaborator interface.
//!
//! The scheduler never talks to a GPU driver directly. Everything it needs
//! from the driver goes through [`GpuRuntime`]: memory allocation, stream
//! lifecycle, synchronization, events and the active device. Backends
//! implement it (`kernelflow-cpu` simulates one in-process, `kernelflow-cuda`
//! wraps the CUDA driver).

use std::fmt;

use crate::device::DeviceId;
use crate::error::Result;

/// Opaque handle to a memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryHandle(pub u64);

/// Opaque handle to a hardware stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

/// Opaque handle to a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Driver operations consumed by the scheduler.
///
/// Implementations must be callable from whichever thread currently holds
/// the execution context.
pub trait GpuRuntime: Send + Sync {
    /// Human readable backend name.
    fn name(&self) -> &str;

    /// Number of devices visible to the process.
    fn device_count(&self) -> Result<usize>;

    /// Allocate `bytes` of memory visible to host and devices.
    fn allocate(&self, bytes: usize) -> Result<MemoryHandle>;

    /// Release an allocation.
    fn free(&self, memory: MemoryHandle) -> Result<()>;

    /// Create a stream on `device`. The device must be active.
    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle>;

    /// Destroy a stream.
    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Block the host until all work on `stream` has completed.
    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Block the host until all work on `device` has completed.
    fn synchronize_device(&self, device: DeviceId) -> Result<()>;

    /// Make `device` the target of subsequent calls.
    fn set_active_device(&self, device: DeviceId) -> Result<()>;

    /// Currently active device.
    fn active_device(&self) -> Result<DeviceId>;

    /// Record an event capturing all work submitted to `stream` so far.
    fn record_event(&self, stream: StreamHandle) -> Result<EventHandle>;

    /// Make future work on `stream` wait until `event` has completed.
    fn wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()>;

    /// Destroy an event.
    fn destroy_event(&self, event: EventHandle) -> Result<()>;

    /// Move `memory` towards `device` ahead of use, ordered on `stream`.
    ///
    /// Backends without migratable memory keep the default no-op.
    fn prefetch(
        &self,
        _memory: MemoryHandle,
        _device: DeviceId,
        _stream: Option<StreamHandle>,
    ) -> Result<()> {
        Ok(())
    }
}
