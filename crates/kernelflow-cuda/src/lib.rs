//! CUDA Backend for KernelFlow
//!
//! This crate implements [`GpuRuntime`](kernelflow_core::GpuRuntime) on top of
//! the CUDA driver API through cudarc.
//!
//! # Requirements
//!
//! - NVIDIA GPU and driver
//! - CUDA 12 driver library loadable at runtime
//!
//! Without the `cuda` feature the crate still builds; [`CudaRuntime::new`]
//! then returns [`KernelFlowError::BackendUnavailable`](kernelflow_core::KernelFlowError::BackendUnavailable).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kernelflow_core::prelude::*;
//! use kernelflow_cuda::CudaRuntime;
//!
//! let runtime = Arc::new(CudaRuntime::new()?);
//! let mut ctx = ExecutionContext::new(runtime, SchedulerConfig::default())?;
//! ```

#![warn(missing_docs)]

#[cfg(feature = "cuda")]
mod runtime;

#[cfg(feature = "cuda")]
pub use runtime::CudaRuntime;

// Placeholder implementation when CUDA is not available
#[cfg(not(feature = "cuda"))]
mod stub {
    use kernelflow_core::device::DeviceId;
    use kernelflow_core::error::{KernelFlowError, Result};
    use kernelflow_core::runtime::{EventHandle, GpuRuntime, MemoryHandle, StreamHandle};

    /// Stub CUDA runtime when the CUDA feature is disabled.
    #[derive(Debug)]
    pub struct CudaRuntime;

    impl CudaRuntime {
        /// Create fails when CUDA is not available.
        pub fn new() -> Result<Self> {
            Err(unavailable())
        }
    }

    fn unavailable() -> KernelFlowError {
        KernelFlowError::BackendUnavailable("CUDA feature not enabled".to_string())
    }

    impl GpuRuntime for CudaRuntime {
        fn name(&self) -> &str {
            "cuda"
        }

        fn device_count(&self) -> Result<usize> {
            Ok(0)
        }

        fn allocate(&self, _bytes: usize) -> Result<MemoryHandle> {
            Err(unavailable())
        }

        fn free(&self, _memory: MemoryHandle) -> Result<()> {
            Err(unavailable())
        }

        fn create_stream(&self, _device: DeviceId) -> Result<StreamHandle> {
            Err(unavailable())
        }

        fn destroy_stream(&self, _stream: StreamHandle) -> Result<()> {
            Err(unavailable())
        }

        fn synchronize_stream(&self, _stream: StreamHandle) -> Result<()> {
            Err(unavailable())
        }

        fn synchronize_device(&self, _device: DeviceId) -> Result<()> {
            Err(unavailable())
        }

        fn set_active_device(&self, _device: DeviceId) -> Result<()> {
            Err(unavailable())
        }

        fn active_device(&self) -> Result<DeviceId> {
            Err(unavailable())
        }

        fn record_event(&self, _stream: StreamHandle) -> Result<EventHandle> {
            Err(unavailable())
        }

        fn wait_event(&self, _stream: StreamHandle, _event: EventHandle) -> Result<()> {
            Err(unavailable())
        }

        fn destroy_event(&self, _event: EventHandle) -> Result<()> {
            Err(unavailable())
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaRuntime;

/// Whether at least one CUDA device can run scheduled work.
///
/// False without the `cuda` feature, without a loadable driver library or
/// without devices.
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Devices a [`CudaRuntime`] would open, 0 when the backend is unusable.
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        runtime::driver_device_count().unwrap_or(0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_stub_is_unavailable() {
        assert!(!is_cuda_available());
        assert_eq!(cuda_device_count(), 0);
        assert!(matches!(
            CudaRuntime::new(),
            Err(kernelflow_core::KernelFlowError::BackendUnavailable(_))
        ));
    }

    #[test]
    #[cfg(feature = "cuda")]
    fn test_runtime_matches_device_count() {
        use kernelflow_core::GpuRuntime;

        if !is_cuda_available() {
            return;
        }
        let runtime = CudaRuntime::new().unwrap();
        assert_eq!(runtime.device_count().unwrap(), cuda_device_count());
    }

    #[test]
    #[cfg(feature = "cuda")]
    fn test_managed_memory_prefetch() {
        use kernelflow_core::device::DeviceId;
        use kernelflow_core::GpuRuntime;

        if !is_cuda_available() {
            return;
        }
        let runtime = CudaRuntime::new().unwrap();
        runtime.set_active_device(DeviceId(0)).unwrap();
        let memory = runtime.allocate(4096).unwrap();
        let stream = runtime.create_stream(DeviceId(0)).unwrap();

        runtime.prefetch(memory, DeviceId(0), Some(stream)).unwrap();
        runtime.prefetch(memory, DeviceId(0), None).unwrap();
        runtime.synchronize_stream(stream).unwrap();

        runtime.destroy_stream(stream).unwrap();
        runtime.free(memory).unwrap();
        assert!(runtime.free(memory).is_err());
    }
}
