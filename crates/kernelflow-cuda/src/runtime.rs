//! CUDA driver runtime.
//!
//! Arrays live in managed memory (`cuMemAllocManaged`) so that the host and
//! every device can address them. The scheduler's location tracker decides
//! when a copy is stale; [`GpuRuntime::prefetch`] migrates the pages ahead of
//! a launch with `cuMemPrefetchAsync`.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use cudarc::driver::sys as cuda_sys;
use cudarc::driver::{CudaContext, CudaEvent, CudaStream};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use kernelflow_core::device::DeviceId;
use kernelflow_core::error::{KernelFlowError, Result};
use kernelflow_core::runtime::{EventHandle, GpuRuntime, MemoryHandle, StreamHandle};

/// Stream owned by the runtime together with its device.
struct OwnedStream {
    device: DeviceId,
    stream: Arc<CudaStream>,
}

/// Managed allocation and the device whose context created it.
#[derive(Debug, Clone, Copy)]
struct ManagedAllocation {
    ptr: cuda_sys::CUdeviceptr,
    bytes: usize,
    device: DeviceId,
}

/// Number of devices reported by the CUDA driver.
///
/// With dynamic loading, cudarc panics on first use when the driver library
/// cannot be opened. That case is reported as an unavailable backend rather
/// than unwinding into the caller.
pub(crate) fn driver_device_count() -> Result<usize> {
    match std::panic::catch_unwind(CudaContext::device_count) {
        Ok(Ok(count)) => Ok(count.max(0) as usize),
        Ok(Err(e)) => Err(KernelFlowError::BackendUnavailable(format!(
            "CUDA driver error: {}",
            e
        ))),
        Err(_) => Err(KernelFlowError::BackendUnavailable(
            "CUDA driver library not found".to_string(),
        )),
    }
}

fn check(result: cuda_sys::CUresult, what: &str) -> Result<()> {
    if result == cuda_sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(KernelFlowError::backend(format!("{} failed: {:?}", what, result)))
    }
}

/// [`GpuRuntime`] backed by the CUDA driver API.
///
/// One primary context is retained per device. Allocations are managed
/// memory created in the context of the device active at the time.
pub struct CudaRuntime {
    contexts: Vec<Arc<CudaContext>>,
    active: AtomicUsize,
    next_handle: AtomicU64,
    allocations: Mutex<HashMap<MemoryHandle, ManagedAllocation>>,
    streams: Mutex<HashMap<StreamHandle, OwnedStream>>,
    events: Mutex<HashMap<EventHandle, CudaEvent>>,
}

impl CudaRuntime {
    /// Open every visible CUDA device.
    pub fn new() -> Result<Self> {
        let count = driver_device_count()?;
        if count == 0 {
            return Err(KernelFlowError::BackendUnavailable(
                "no CUDA device found".to_string(),
            ));
        }

        let contexts = (0..count)
            .map(|ordinal| {
                CudaContext::new(ordinal).map_err(|e| {
                    KernelFlowError::backend(format!(
                        "Failed to create CUDA device {}: {}",
                        ordinal, e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(devices = count, "CUDA runtime initialized");

        Ok(Self {
            contexts,
            active: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
            allocations: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
        })
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn context(&self, device: DeviceId) -> Result<&Arc<CudaContext>> {
        self.contexts
            .get(device.0)
            .ok_or(KernelFlowError::InvalidDevice {
                id: device,
                count: self.contexts.len(),
            })
    }

    /// Make `device`'s context current on the calling thread.
    fn bind(&self, device: DeviceId) -> Result<()> {
        self.context(device)?
            .bind_to_thread()
            .map_err(|e| KernelFlowError::backend(format!("Failed to bind device {}: {}", device, e)))
    }

    fn stream(&self, stream: StreamHandle) -> Result<Arc<CudaStream>> {
        self.streams
            .lock()
            .get(&stream)
            .map(|s| Arc::clone(&s.stream))
            .ok_or_else(|| KernelFlowError::backend(format!("unknown {}", stream)))
    }
}

impl GpuRuntime for CudaRuntime {
    fn name(&self) -> &str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.contexts.len())
    }

    fn allocate(&self, bytes: usize) -> Result<MemoryHandle> {
        let device = DeviceId(self.active.load(Ordering::Acquire));
        let size = bytes.max(1);
        self.bind(device)?;

        let mut ptr: cuda_sys::CUdeviceptr = 0;
        unsafe {
            check(
                cuda_sys::lib().cuMemAllocManaged(
                    &mut ptr,
                    size,
                    cuda_sys::CUmemAttach_flags::CU_MEM_ATTACH_GLOBAL as u32,
                ),
                "cuMemAllocManaged",
            )?;
            if let Err(err) = check(cuda_sys::lib().cuMemsetD8_v2(ptr, 0, size), "cuMemsetD8") {
                let _ = cuda_sys::lib().cuMemFree_v2(ptr);
                return Err(err);
            }
        }
        self.context(device)?
            .synchronize()
            .map_err(|e| KernelFlowError::backend(format!("Failed to zero allocation: {}", e)))?;

        let handle = MemoryHandle(self.next());
        self.allocations.lock().insert(
            handle,
            ManagedAllocation {
                ptr,
                bytes: size,
                device,
            },
        );
        debug!(memory = handle.0, bytes, device = %device, "allocated managed memory");
        Ok(handle)
    }

    fn free(&self, memory: MemoryHandle) -> Result<()> {
        let allocation = self
            .allocations
            .lock()
            .remove(&memory)
            .ok_or_else(|| KernelFlowError::backend(format!("unknown allocation {:?}", memory)))?;
        self.bind(allocation.device)?;
        unsafe { check(cuda_sys::lib().cuMemFree_v2(allocation.ptr), "cuMemFree") }
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle> {
        let active = self.active.load(Ordering::Acquire);
        if active != device.0 {
            return Err(KernelFlowError::backend(format!(
                "stream requested on device {} while device {} is active",
                device, active
            )));
        }

        let stream = self
            .context(device)?
            .new_stream()
            .map_err(|e| KernelFlowError::backend(format!("Failed to create stream: {}", e)))?;

        let handle = StreamHandle(self.next());
        self.streams
            .lock()
            .insert(handle, OwnedStream { device, stream });
        Ok(handle)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        let owned = self
            .streams
            .lock()
            .remove(&stream)
            .ok_or_else(|| KernelFlowError::backend(format!("unknown {}", stream)))?;
        // Pending work completes before the stream is released.
        owned
            .stream
            .synchronize()
            .map_err(|e| KernelFlowError::backend(format!("Failed to destroy stream: {}", e)))
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()> {
        self.stream(stream)?
            .synchronize()
            .map_err(|e| KernelFlowError::backend(format!("Stream sync failed: {}", e)))
    }

    fn synchronize_device(&self, device: DeviceId) -> Result<()> {
        self.context(device)?
            .synchronize()
            .map_err(|e| KernelFlowError::backend(format!("Device sync failed: {}", e)))
    }

    fn set_active_device(&self, device: DeviceId) -> Result<()> {
        self.bind(device)?;
        self.active.store(device.0, Ordering::Release);
        Ok(())
    }

    fn active_device(&self) -> Result<DeviceId> {
        Ok(DeviceId(self.active.load(Ordering::Acquire)))
    }

    fn record_event(&self, stream: StreamHandle) -> Result<EventHandle> {
        let event = self
            .stream(stream)?
            .record_event(None)
            .map_err(|e| KernelFlowError::backend(format!("Failed to record event: {}", e)))?;

        let handle = EventHandle(self.next());
        self.events.lock().insert(handle, event);
        Ok(handle)
    }

    fn wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()> {
        let target = self.stream(stream)?;
        let events = self.events.lock();
        let event = events
            .get(&event)
            .ok_or_else(|| KernelFlowError::backend(format!("unknown event {:?}", event)))?;
        target
            .wait(event)
            .map_err(|e| KernelFlowError::backend(format!("Failed to wait on event: {}", e)))
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        self.events
            .lock()
            .remove(&event)
            .map(drop)
            .ok_or_else(|| KernelFlowError::backend(format!("unknown event {:?}", event)))
    }

    fn prefetch(
        &self,
        memory: MemoryHandle,
        device: DeviceId,
        stream: Option<StreamHandle>,
    ) -> Result<()> {
        let allocation = *self
            .allocations
            .lock()
            .get(&memory)
            .ok_or_else(|| KernelFlowError::backend(format!("unknown allocation {:?}", memory)))?;
        let target = self.context(device)?.cu_device();
        // Keep the stream alive for the duration of the call.
        let stream = stream.map(|s| self.stream(s)).transpose()?;
        let cu_stream = stream
            .as_ref()
            .map_or(ptr::null_mut(), |s| s.cu_stream());

        self.bind(device)?;
        unsafe {
            check(
                cuda_sys::lib().cuMemPrefetchAsync(allocation.ptr, allocation.bytes, target, cu_stream),
                "cuMemPrefetchAsync",
            )?;
        }
        debug!(memory = memory.0, device = %device, bytes = allocation.bytes, "prefetched managed memory");
        Ok(())
    }
}

impl Drop for CudaRuntime {
    fn drop(&mut self) {
        let allocations = std::mem::take(self.allocations.get_mut());
        for (handle, allocation) in allocations {
            if self.bind(allocation.device).is_err() {
                continue;
            }
            let result = unsafe { cuda_sys::lib().cuMemFree_v2(allocation.ptr) };
            if result != cuda_sys::CUresult::CUDA_SUCCESS {
                warn!(memory = handle.0, error = ?result, "Failed to free managed memory");
            }
        }
    }
}

impl std::fmt::Debug for CudaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let streams: Vec<(StreamHandle, DeviceId)> = self
            .streams
            .lock()
            .iter()
            .map(|(h, s)| (*h, s.device))
            .collect();
        f.debug_struct("CudaRuntime")
            .field("devices", &self.contexts.len())
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("allocations", &self.allocations.lock().len())
            .field("streams", &streams)
            .field("events", &self.events.lock().len())
            .finish()
    }
}
