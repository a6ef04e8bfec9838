//! Launch logic of computational elements.
//!
//! A [`Computation`] describes what an element does: its operands, whether
//! it may run on an asynchronous stream and how to launch it. The execution
//! context owns scheduling; a computation only sees the [`LaunchContext`]
//! prepared for its launch.
//!
//! Four kinds are provided: [`KernelLaunch`], [`ArrayCopy`], [`LibraryCall`]
//! and [`HostArrayAccess`]. The work itself is a caller-supplied closure.

use std::fmt;

use crate::argument::{ArgumentDescriptor, ArrayHandle, ArrayId};
use crate::device::DeviceId;
use crate::element::ElementId;
use crate::error::{KernelFlowError, Result};
use crate::location::Location;
use crate::runtime::{GpuRuntime, MemoryHandle, StreamHandle};

/// Work executed by a computation.
pub type LaunchFn = Box<dyn FnMut(&LaunchContext<'_>) -> Result<()> + Send>;

/// Kind of a computational element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputationKind {
    /// GPU kernel launch.
    KernelLaunch,
    /// Host-driven copy into or out of an array.
    ArrayCopy,
    /// Call into a GPU library.
    LibraryCall,
    /// Host read or write of array data.
    HostArrayAccess,
}

impl ComputationKind {
    /// Short name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputationKind::KernelLaunch => "kernel",
            ComputationKind::ArrayCopy => "array-copy",
            ComputationKind::LibraryCall => "library-call",
            ComputationKind::HostArrayAccess => "host-access",
        }
    }
}

impl fmt::Display for ComputationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an operand affects the array's location set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationAccess {
    /// Data is read; the set is unchanged.
    Read,
    /// Data is written; the set becomes the executing location.
    Write,
    /// The executing location gains a valid copy; other copies stay valid.
    RelaxedWrite,
}

/// Memory bound to one array operand for a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayBinding {
    /// Array or view id.
    pub array: ArrayId,
    /// Allocation backing the root array.
    pub memory: MemoryHandle,
    /// Byte offset of the array within the allocation.
    pub offset: usize,
    /// Size of the array in bytes.
    pub bytes: usize,
}

/// Everything a computation sees while launching.
pub struct LaunchContext<'a> {
    element: ElementId,
    runtime: &'a dyn GpuRuntime,
    location: Location,
    stream: Option<StreamHandle>,
    arrays: Vec<ArrayBinding>,
}

impl<'a> LaunchContext<'a> {
    pub(crate) fn new(
        element: ElementId,
        runtime: &'a dyn GpuRuntime,
        location: Location,
        stream: Option<StreamHandle>,
        arrays: Vec<ArrayBinding>,
    ) -> Self {
        Self {
            element,
            runtime,
            location,
            stream,
            arrays,
        }
    }

    /// Element being launched.
    #[must_use]
    pub fn element(&self) -> ElementId {
        self.element
    }

    /// Runtime collaborator.
    #[must_use]
    pub fn runtime(&self) -> &dyn GpuRuntime {
        self.runtime
    }

    /// Where the element executes.
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }

    /// Executing device, `None` on the host.
    #[must_use]
    pub fn device(&self) -> Option<DeviceId> {
        self.location.device()
    }

    /// Stream to enqueue on; `None` means the default or host path.
    #[must_use]
    pub fn stream(&self) -> Option<StreamHandle> {
        self.stream
    }

    /// Memory bound to an array operand.
    pub fn binding(&self, array: ArrayId) -> Result<&ArrayBinding> {
        self.arrays
            .iter()
            .find(|b| b.array == array)
            .ok_or(KernelFlowError::UnknownArray(array))
    }

    /// All bound arrays.
    #[must_use]
    pub fn bindings(&self) -> &[ArrayBinding] {
        &self.arrays
    }
}

/// Launch logic of an element.
pub trait Computation: Send {
    /// Kind of the computation.
    fn kind(&self) -> ComputationKind;

    /// Name used in logs and DAG exports.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Operands; snapshotted when the element is created.
    fn arguments(&self) -> Vec<ArgumentDescriptor>;

    /// Whether the work may run on an asynchronous stream.
    ///
    /// Host-side work returns false and always runs synchronously.
    fn can_use_stream(&self) -> bool {
        true
    }

    /// Effect of an operand on its array's location set.
    ///
    /// `const_aware` is true when the context uses the const-aware
    /// dependency policy.
    fn location_access(&self, arg: &ArgumentDescriptor, const_aware: bool) -> LocationAccess {
        let _ = const_aware;
        if arg.is_const() {
            LocationAccess::Read
        } else {
            LocationAccess::Write
        }
    }

    /// Launch the work.
    fn execute(&mut self, launch: &LaunchContext<'_>) -> Result<()>;
}

/// Three-dimensional launch extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    /// X extent.
    pub x: u32,
    /// Y extent.
    pub y: u32,
    /// Z extent.
    pub z: u32,
}

impl Dim3 {
    /// Create an extent.
    #[must_use]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Total number of items.
    #[must_use]
    pub fn count(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<(u32, u32)> for Dim3 {
    fn from((x, y): (u32, u32)) -> Self {
        Self::new(x, y, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

/// Maximum threads per block accepted by [`KernelLaunch`].
pub const MAX_THREADS_PER_BLOCK: u64 = 1024;

/// A kernel launch with a grid and block configuration.
pub struct KernelLaunch {
    name: String,
    grid: Dim3,
    block: Dim3,
    shared_memory: usize,
    arguments: Vec<ArgumentDescriptor>,
    body: Option<LaunchFn>,
}

impl KernelLaunch {
    /// Create a launch of `name` with a 1x1x1 grid and block.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grid: Dim3::new(1, 1, 1),
            block: Dim3::new(1, 1, 1),
            shared_memory: 0,
            arguments: Vec::new(),
            body: None,
        }
    }

    /// Set the grid extent.
    pub fn grid(mut self, grid: impl Into<Dim3>) -> Self {
        self.grid = grid.into();
        self
    }

    /// Set the block extent.
    pub fn block(mut self, block: impl Into<Dim3>) -> Self {
        self.block = block.into();
        self
    }

    /// Set dynamic shared memory in bytes.
    pub fn shared_memory(mut self, bytes: usize) -> Self {
        self.shared_memory = bytes;
        self
    }

    /// Append an operand.
    pub fn arg(mut self, arg: ArgumentDescriptor) -> Self {
        self.arguments.push(arg);
        self
    }

    /// Append a read-only array operand.
    pub fn input(self, array: ArrayHandle) -> Self {
        self.arg(ArgumentDescriptor::const_array(array))
    }

    /// Append a read-write array operand.
    pub fn output(self, array: ArrayHandle) -> Self {
        self.arg(ArgumentDescriptor::mut_array(array))
    }

    /// Set the work performed by the launch.
    pub fn body<F>(mut self, body: F) -> Self
    where
        F: FnMut(&LaunchContext<'_>) -> Result<()> + Send + 'static,
    {
        self.body = Some(Box::new(body));
        self
    }

    /// Dynamic shared memory in bytes.
    #[must_use]
    pub fn shared_memory_bytes(&self) -> usize {
        self.shared_memory
    }

    fn validate(&self, element: ElementId) -> Result<()> {
        if self.grid.count() == 0 || self.block.count() == 0 {
            return Err(KernelFlowError::launch_failed(
                element,
                format!("kernel '{}' has an empty grid or block", self.name),
            ));
        }
        if self.block.count() > MAX_THREADS_PER_BLOCK {
            return Err(KernelFlowError::launch_failed(
                element,
                format!(
                    "kernel '{}' block of {} threads exceeds {}",
                    self.name,
                    self.block.count(),
                    MAX_THREADS_PER_BLOCK
                ),
            ));
        }
        Ok(())
    }
}

impl Computation for KernelLaunch {
    fn kind(&self) -> ComputationKind {
        ComputationKind::KernelLaunch
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn arguments(&self) -> Vec<ArgumentDescriptor> {
        self.arguments.clone()
    }

    fn execute(&mut self, launch: &LaunchContext<'_>) -> Result<()> {
        self.validate(launch.element())?;
        match self.body.as_mut() {
            Some(body) => body(launch),
            None => Ok(()),
        }
    }
}

/// Direction of an [`ArrayCopy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Host data is copied into the array.
    IntoArray,
    /// Array data is copied out to the host.
    FromArray,
}

/// Host-driven copy between an array and host memory.
///
/// Runs synchronously on the host. Copying into the array leaves only the
/// host copy valid. Copying out of it makes the host copy valid too; other
/// copies stay valid only under the const-aware policy.
pub struct ArrayCopy {
    array: ArrayHandle,
    direction: CopyDirection,
    bytes: usize,
    body: Option<LaunchFn>,
}

impl ArrayCopy {
    /// Copy `bytes` from host memory into `array`.
    pub fn into_array(array: ArrayHandle, bytes: usize) -> Self {
        Self {
            array,
            direction: CopyDirection::IntoArray,
            bytes,
            body: None,
        }
    }

    /// Copy `bytes` out of `array` into host memory.
    pub fn from_array(array: ArrayHandle, bytes: usize) -> Self {
        Self {
            array,
            direction: CopyDirection::FromArray,
            bytes,
            body: None,
        }
    }

    /// Set the copy routine.
    pub fn body<F>(mut self, body: F) -> Self
    where
        F: FnMut(&LaunchContext<'_>) -> Result<()> + Send + 'static,
    {
        self.body = Some(Box::new(body));
        self
    }

    /// Copy direction.
    #[must_use]
    pub fn direction(&self) -> CopyDirection {
        self.direction
    }
}

impl Computation for ArrayCopy {
    fn kind(&self) -> ComputationKind {
        ComputationKind::ArrayCopy
    }

    fn arguments(&self) -> Vec<ArgumentDescriptor> {
        let is_const = self.direction == CopyDirection::FromArray;
        vec![ArgumentDescriptor::array(self.array, is_const)]
    }

    fn can_use_stream(&self) -> bool {
        false
    }

    fn location_access(&self, _arg: &ArgumentDescriptor, const_aware: bool) -> LocationAccess {
        match self.direction {
            CopyDirection::IntoArray => LocationAccess::Write,
            CopyDirection::FromArray if const_aware => LocationAccess::RelaxedWrite,
            CopyDirection::FromArray => LocationAccess::Write,
        }
    }

    fn execute(&mut self, launch: &LaunchContext<'_>) -> Result<()> {
        let binding = launch.binding(self.array.id())?;
        if self.bytes > binding.bytes {
            return Err(KernelFlowError::OutOfBounds {
                array: self.array.id(),
                requested: self.bytes,
                size: binding.bytes,
            });
        }
        match self.body.as_mut() {
            Some(body) => body(launch),
            None => Ok(()),
        }
    }
}

/// Call into a GPU library (BLAS, FFT, ...) over array operands.
pub struct LibraryCall {
    name: String,
    arguments: Vec<ArgumentDescriptor>,
    body: Option<LaunchFn>,
}

impl LibraryCall {
    /// Create a call of `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            body: None,
        }
    }

    /// Append an operand.
    pub fn arg(mut self, arg: ArgumentDescriptor) -> Self {
        self.arguments.push(arg);
        self
    }

    /// Set the library routine.
    pub fn body<F>(mut self, body: F) -> Self
    where
        F: FnMut(&LaunchContext<'_>) -> Result<()> + Send + 'static,
    {
        self.body = Some(Box::new(body));
        self
    }
}

impl Computation for LibraryCall {
    fn kind(&self) -> ComputationKind {
        ComputationKind::LibraryCall
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn arguments(&self) -> Vec<ArgumentDescriptor> {
        self.arguments.clone()
    }

    fn execute(&mut self, launch: &LaunchContext<'_>) -> Result<()> {
        match self.body.as_mut() {
            Some(body) => body(launch),
            None => Ok(()),
        }
    }
}

/// Host access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAccessMode {
    /// The host reads the array.
    Read,
    /// The host writes the array.
    Write,
}

/// Synchronous host read or write of array data.
pub struct HostArrayAccess {
    array: ArrayHandle,
    mode: HostAccessMode,
    body: Option<LaunchFn>,
}

impl HostArrayAccess {
    /// Host read of `array`.
    pub fn read(array: ArrayHandle) -> Self {
        Self {
            array,
            mode: HostAccessMode::Read,
            body: None,
        }
    }

    /// Host write of `array`.
    pub fn write(array: ArrayHandle) -> Self {
        Self {
            array,
            mode: HostAccessMode::Write,
            body: None,
        }
    }

    /// Set the access routine.
    pub fn body<F>(mut self, body: F) -> Self
    where
        F: FnMut(&LaunchContext<'_>) -> Result<()> + Send + 'static,
    {
        self.body = Some(Box::new(body));
        self
    }

    /// Access mode.
    #[must_use]
    pub fn mode(&self) -> HostAccessMode {
        self.mode
    }
}

impl Computation for HostArrayAccess {
    fn kind(&self) -> ComputationKind {
        ComputationKind::HostArrayAccess
    }

    fn arguments(&self) -> Vec<ArgumentDescriptor> {
        let is_const = self.mode == HostAccessMode::Read;
        vec![ArgumentDescriptor::array(self.array, is_const)]
    }

    fn can_use_stream(&self) -> bool {
        false
    }

    fn execute(&mut self, launch: &LaunchContext<'_>) -> Result<()> {
        match self.body.as_mut() {
            Some(body) => body(launch),
            None => Ok(()),
        }
    }
}
