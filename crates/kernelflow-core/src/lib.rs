//! # KernelFlow Core
//!
//! Core types for the KernelFlow GPU DAG scheduler.
//!
//! KernelFlow schedules GPU work (kernel launches, array copies, library
//! calls) so that operations without data conflicts run concurrently on
//! independent streams, while operations touching the same memory run in the
//! order correctness requires.
//!
//! ## Core Abstractions
//!
//! - [`ArgumentDescriptor`] - One operand of a computation
//! - [`DependencyComputation`] - Overlap analysis between two elements
//! - [`Computation`] - Launch logic of an element
//! - [`StreamPool`] - Free and busy streams of one device
//! - [`ArrayLocationTracker`] - Up-to-date copies of array data
//! - [`ExecutionContext`] - The scheduler itself
//! - [`GpuRuntime`] - Driver operations consumed by the scheduler
//!
//! ## Example
//!
//! ```ignore
//! use kernelflow_core::prelude::*;
//!
//! let mut ctx = ExecutionContext::new(runtime, SchedulerConfig::default())?;
//! let x = ctx.allocate_array(1024)?;
//! let y = ctx.allocate_array(1024)?;
//! ctx.submit(KernelLaunch::new("square").grid(8).block(128).input(x).output(y))?;
//! ctx.prepare_host_read(y)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod argument;
pub mod computation;
pub mod config;
pub mod context;
pub mod dag;
pub mod dependency;
pub mod device;
pub mod element;
pub mod error;
pub mod location;
pub mod runtime;
pub mod stream;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::argument::{ArgumentDescriptor, ArgumentId, ArrayHandle, ArrayId};
    pub use crate::computation::{
        ArrayBinding, ArrayCopy, Computation, ComputationKind, CopyDirection, Dim3,
        HostAccessMode, HostArrayAccess, KernelLaunch, LaunchContext, LaunchFn, LibraryCall,
        LocationAccess,
    };
    pub use crate::config::{
        load_config, load_config_from_env, DependencyPolicy, DeviceSelectionPolicy,
        ExecutionPolicy, NewStreamPolicy, ParentStreamPolicy, SchedulerConfig,
        SchedulerConfigBuilder,
    };
    pub use crate::context::{ContextStats, ExecutionContext, SharedExecutionContext, SyncTarget};
    pub use crate::dag::{DagEdge, DagVertex, ExecutionDag};
    pub use crate::dependency::{
        ActiveArgumentSet, DefaultDependencyComputation, DependencyComputation,
        WithConstDependencyComputation,
    };
    pub use crate::device::{Device, DeviceId, DeviceRegistry};
    pub use crate::element::{
        CompletionHandle, ComputationalElement, Dependency, ElementId, ElementState,
        ExecutionStream,
    };
    pub use crate::error::{KernelFlowError, Result};
    pub use crate::location::{ArrayLocationTracker, Location};
    pub use crate::runtime::{EventHandle, GpuRuntime, MemoryHandle, StreamHandle};
    pub use crate::stream::{Stream, StreamId, StreamPool, StreamPoolStats};
}

pub use argument::{ArgumentDescriptor, ArrayHandle, ArrayId};
pub use computation::Computation;
pub use config::SchedulerConfig;
pub use context::ExecutionContext;
pub use dependency::DependencyComputation;
pub use error::{KernelFlowError, Result};
pub use location::ArrayLocationTracker;
pub use runtime::GpuRuntime;
pub use stream::StreamPool;
