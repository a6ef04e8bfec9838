//! # KernelFlow CPU Backend
//!
//! In-process simulation of a multi-device GPU runtime.
//!
//! [`CpuRuntime`] implements [`GpuRuntime`](kernelflow_core::GpuRuntime)
//! with host memory and bookkeeping-only streams and events. Work enqueued on
//! a stream runs immediately on the calling thread, so every stream is always
//! idle by the time it is synchronized. The runtime still validates every
//! call the way a driver would (unknown handles, streams created on an
//! inactive device, double frees) and keeps a log of the calls it received.
//! It is the fallback backend and the backend used by tests.

#![warn(missing_docs)]

mod memory;
mod runtime;

pub use memory::HostMemory;
pub use runtime::{CpuCall, CpuRuntime, CpuRuntimeStats};
