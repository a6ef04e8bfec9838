//! # KernelFlow
//!
//! DAG scheduler for GPU work.
//!
//! Applications submit kernel launches, array copies and library calls in
//! program order. KernelFlow computes data dependencies between them, runs
//! independent work concurrently on separate streams, orders dependent work
//! with cross-stream event waits and tracks where each array holds
//! up-to-date data.
//!
//! ## Quick Start
//!
//! ```ignore
//! use kernelflow::prelude::*;
//!
//! let mut flow = KernelFlow::builder()
//!     .backend(Backend::Auto)
//!     .config(SchedulerConfig::default())
//!     .build()?;
//!
//! let x = flow.allocate_array(4096)?;
//! let y = flow.allocate_array(4096)?;
//! flow.submit(KernelLaunch::new("square").grid(8).block(128).input(x).output(y))?;
//! flow.prepare_host_read(y)?;
//! flow.shutdown()?;
//! ```
//!
//! ## Backends
//!
//! - **CPU** - In-process simulation (always available)
//! - **CUDA** - NVIDIA GPUs (requires `cuda` feature)
//!
//! ```toml
//! [dependencies]
//! kernelflow = { version = "0.1", features = ["cuda"] }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

// Re-export core types
pub use kernelflow_core::*;

// Re-export CPU backend (always available)
pub use kernelflow_cpu::CpuRuntime;

#[cfg(feature = "cuda")]
pub use kernelflow_cuda::CudaRuntime;

use kernelflow_core::config::{load_config, load_config_from_env};
use kernelflow_core::context::SharedExecutionContext;
use kernelflow_core::error::Result;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{Backend, KernelFlow, KernelFlowBuilder};
    pub use kernelflow_core::prelude::*;
    pub use kernelflow_cpu::CpuRuntime;
}

/// Runtime backend behind a [`KernelFlow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Best available backend, CPU as fallback.
    #[default]
    Auto,
    /// In-process simulation.
    Cpu,
    /// CUDA driver.
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Auto => write!(f, "auto"),
            Backend::Cpu => write!(f, "cpu"),
            Backend::Cuda => write!(f, "cuda"),
        }
    }
}

/// Main KernelFlow facade.
///
/// Owns an [`ExecutionContext`] over the selected backend and dereferences
/// to it.
pub struct KernelFlow {
    backend: Backend,
    context: ExecutionContext,
}

impl KernelFlow {
    /// Create a new builder.
    pub fn builder() -> KernelFlowBuilder {
        KernelFlowBuilder::new()
    }

    /// Create with default settings.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create with a specific backend.
    pub fn with_backend(backend: Backend) -> Result<Self> {
        Self::builder().backend(backend).build()
    }

    /// Resolved backend (never [`Backend::Auto`]).
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The execution context.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// The execution context, mutably.
    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Take the execution context out of the facade.
    pub fn into_context(self) -> ExecutionContext {
        self.context
    }

    /// Share the execution context between threads.
    pub fn into_shared(self) -> SharedExecutionContext {
        self.context.into_shared()
    }

    /// Finish all work and destroy every stream.
    pub fn shutdown(mut self) -> Result<()> {
        self.context.cleanup()
    }
}

impl Deref for KernelFlow {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl DerefMut for KernelFlow {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.context
    }
}

impl fmt::Debug for KernelFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelFlow")
            .field("backend", &self.backend)
            .field("context", &self.context)
            .finish()
    }
}

/// Where the builder takes its configuration from.
#[derive(Debug, Clone)]
enum ConfigSource {
    Value(SchedulerConfig),
    File(PathBuf),
    Environment,
}

/// Builder for [`KernelFlow`].
#[derive(Debug, Clone)]
pub struct KernelFlowBuilder {
    backend: Backend,
    config: ConfigSource,
    cpu_devices: usize,
}

impl KernelFlowBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            backend: Backend::Auto,
            config: ConfigSource::Value(SchedulerConfig::default()),
            cpu_devices: 1,
        }
    }

    /// Set the backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Use an explicit configuration.
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = ConfigSource::Value(config);
        self
    }

    /// Load configuration from a TOML file with environment overrides.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = ConfigSource::File(path.into());
        self
    }

    /// Load configuration from `KERNELFLOW_*` environment variables.
    pub fn config_from_env(mut self) -> Self {
        self.config = ConfigSource::Environment;
        self
    }

    /// Number of devices the CPU backend simulates.
    pub fn cpu_devices(mut self, count: usize) -> Self {
        self.cpu_devices = count;
        self
    }

    /// Build the runtime and its execution context.
    pub fn build(self) -> Result<KernelFlow> {
        let config = match &self.config {
            ConfigSource::Value(config) => config.clone(),
            ConfigSource::File(path) => load_config(path)?,
            ConfigSource::Environment => load_config_from_env()?,
        };

        let (backend, runtime) = match self.backend {
            Backend::Auto => self.build_auto()?,
            Backend::Cpu => (Backend::Cpu, self.cpu_runtime()),
            Backend::Cuda => (Backend::Cuda, Self::cuda_runtime()?),
        };

        let context = ExecutionContext::new(runtime, config)?;
        Ok(KernelFlow { backend, context })
    }

    fn cpu_runtime(&self) -> Arc<dyn GpuRuntime> {
        Arc::new(CpuRuntime::with_devices(self.cpu_devices))
    }

    #[cfg(feature = "cuda")]
    fn cuda_runtime() -> Result<Arc<dyn GpuRuntime>> {
        Ok(Arc::new(kernelflow_cuda::CudaRuntime::new()?))
    }

    #[cfg(not(feature = "cuda"))]
    fn cuda_runtime() -> Result<Arc<dyn GpuRuntime>> {
        Err(KernelFlowError::BackendUnavailable(
            "CUDA feature not enabled".to_string(),
        ))
    }

    /// Auto-select the best available backend.
    fn build_auto(&self) -> Result<(Backend, Arc<dyn GpuRuntime>)> {
        if availability::cuda() {
            tracing::info!("Auto-selected CUDA backend");
            return Ok((Backend::Cuda, Self::cuda_runtime()?));
        }

        tracing::info!("Auto-selected CPU backend (no GPU available)");
        Ok((Backend::Cpu, self.cpu_runtime()))
    }
}

impl Default for KernelFlowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check availability of backends at runtime.
pub mod availability {
    /// Check if CUDA is available.
    pub fn cuda() -> bool {
        #[cfg(feature = "cuda")]
        {
            kernelflow_cuda::is_cuda_available()
        }
        #[cfg(not(feature = "cuda"))]
        {
            false
        }
    }

    /// Get list of available backends.
    pub fn available_backends() -> Vec<super::Backend> {
        let mut backends = vec![super::Backend::Cpu];
        if cuda() {
            backends.push(super::Backend::Cuda);
        }
        backends
    }
}
