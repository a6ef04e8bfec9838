//! Computational elements: the unit of scheduling.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::argument::{ArgumentDescriptor, ArrayId};
use crate::computation::Computation;
use crate::config::DependencyPolicy;
use crate::dependency::{dependency_computation, ActiveArgumentSet, DependencyComputation};
use crate::device::DeviceId;
use crate::error::{KernelFlowError, Result};
use crate::runtime::{EventHandle, StreamHandle};
use crate::stream::Stream;

/// Identifier of a computational element within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementState {
    /// Registered, not yet scheduled.
    Created,
    /// Dependencies computed and stream assigned.
    Scheduled,
    /// Launched.
    Started,
    /// Completion observed by a synchronization, or failed.
    Finished,
}

impl ElementState {
    /// Whether `next` directly follows this state.
    #[must_use]
    pub fn can_transition_to(&self, next: ElementState) -> bool {
        matches!(
            (self, next),
            (ElementState::Created, ElementState::Scheduled)
                | (ElementState::Scheduled, ElementState::Started)
                | (ElementState::Started, ElementState::Finished)
        )
    }
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementState::Created => "created",
            ElementState::Scheduled => "scheduled",
            ElementState::Started => "started",
            ElementState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Where an element runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStream {
    /// Synchronously on the host.
    Host,
    /// On the default stream of a device, synchronized after launch.
    DeviceDefault(DeviceId),
    /// On a stream borrowed from the device's pool.
    Pooled(Stream),
    /// On a caller-owned stream.
    Manual(Stream),
}

impl ExecutionStream {
    /// Runtime handle of the stream, if the element runs on one.
    #[must_use]
    pub fn handle(&self) -> Option<StreamHandle> {
        match self {
            ExecutionStream::Pooled(s) | ExecutionStream::Manual(s) => Some(s.handle()),
            _ => None,
        }
    }

    /// Device the element runs on, if any.
    #[must_use]
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            ExecutionStream::Host => None,
            ExecutionStream::DeviceDefault(d) => Some(*d),
            ExecutionStream::Pooled(s) | ExecutionStream::Manual(s) => Some(s.device()),
        }
    }

    /// Whether the element completes before its launch returns.
    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        matches!(
            self,
            ExecutionStream::Host | ExecutionStream::DeviceDefault(_)
        )
    }
}

impl fmt::Display for ExecutionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStream::Host => write!(f, "host"),
            ExecutionStream::DeviceDefault(d) => write!(f, "default stream of device {}", d),
            ExecutionStream::Pooled(s) => write!(f, "stream {}", s.id()),
            ExecutionStream::Manual(s) => write!(f, "manual stream {}", s.handle()),
        }
    }
}

#[derive(Debug, Default)]
struct CompletionState {
    finished: bool,
    error: Option<KernelFlowError>,
}

/// Caller-side view of an element's completion.
///
/// The handle is cheap to clone. Use
/// [`ExecutionContext::wait`](crate::context::ExecutionContext::wait) to block
/// until the element finished and obtain its outcome.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    element: ElementId,
    state: Arc<Mutex<CompletionState>>,
}

impl CompletionHandle {
    pub(crate) fn new(element: ElementId) -> Self {
        Self {
            element,
            state: Arc::new(Mutex::new(CompletionState::default())),
        }
    }

    /// Element this handle belongs to.
    #[must_use]
    pub fn element(&self) -> ElementId {
        self.element
    }

    /// Whether completion was observed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Failure of the element, if it failed.
    #[must_use]
    pub fn error(&self) -> Option<KernelFlowError> {
        self.state.lock().error.clone()
    }

    /// Outcome once finished; `None` while still running.
    #[must_use]
    pub fn result(&self) -> Option<Result<()>> {
        let state = self.state.lock();
        if !state.finished {
            return None;
        }
        Some(match &state.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        })
    }

    pub(crate) fn complete(&self, outcome: Result<()>) {
        let mut state = self.state.lock();
        state.finished = true;
        if let Err(err) = outcome {
            state.error = Some(err);
        }
    }
}

/// Ordering edge recorded at scheduling time.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Older element.
    pub parent: ElementId,
    /// Shared operands that created the edge.
    pub arguments: Vec<ArgumentDescriptor>,
}

/// A schedulable unit of work.
pub struct ComputationalElement {
    id: ElementId,
    arguments: Vec<ArgumentDescriptor>,
    dependency: Box<dyn DependencyComputation>,
    computation: Box<dyn Computation>,
    state: ElementState,
    manual_stream: Option<Stream>,
    pub(crate) stream: Option<ExecutionStream>,
    pub(crate) parents: Vec<Dependency>,
    pub(crate) completion_event: Option<EventHandle>,
    pub(crate) handle: CompletionHandle,
}

impl ComputationalElement {
    pub(crate) fn new(
        id: ElementId,
        computation: Box<dyn Computation>,
        policy: DependencyPolicy,
        manual_stream: Option<Stream>,
    ) -> Self {
        let arguments = computation.arguments();
        Self {
            id,
            dependency: dependency_computation(policy, &arguments),
            arguments,
            computation,
            state: ElementState::Created,
            manual_stream,
            stream: None,
            parents: Vec::new(),
            completion_event: None,
            handle: CompletionHandle::new(id),
        }
    }

    /// Element id.
    #[must_use]
    pub fn id(&self) -> ElementId {
        self.id
    }

    /// Operands as given at construction.
    #[must_use]
    pub fn arguments(&self) -> &[ArgumentDescriptor] {
        &self.arguments
    }

    /// Array ids (arrays or views) referenced by the operands.
    pub fn arrays(&self) -> impl Iterator<Item = ArrayId> + '_ {
        self.arguments.iter().filter_map(|a| a.array_id())
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ElementState {
        self.state
    }

    /// Human readable name of the computation.
    #[must_use]
    pub fn name(&self) -> &str {
        self.computation.name()
    }

    /// Whether the element may run on an asynchronous stream.
    #[must_use]
    pub fn can_use_stream(&self) -> bool {
        self.computation.can_use_stream()
    }

    /// Caller-provided stream, if any.
    #[must_use]
    pub fn manual_stream(&self) -> Option<Stream> {
        self.manual_stream
    }

    /// Assigned stream, once scheduled.
    #[must_use]
    pub fn stream(&self) -> Option<ExecutionStream> {
        self.stream
    }

    /// Parents recorded at scheduling time.
    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.parents
    }

    /// Operands that can still order later elements.
    #[must_use]
    pub fn active_arguments(&self) -> &ActiveArgumentSet {
        self.dependency.active_arguments()
    }

    /// Whether this element could still order a later element.
    #[must_use]
    pub fn has_possible_dependencies(&self) -> bool {
        self.dependency.has_possible_dependencies()
    }

    /// Compute the operands shared with a newer element.
    pub fn compute_dependencies(&mut self, other: &ActiveArgumentSet) -> Vec<ArgumentDescriptor> {
        self.dependency.compute_dependencies(other)
    }

    pub(crate) fn restore_arguments(&mut self, arguments: &[ArgumentDescriptor]) {
        self.dependency.restore(arguments);
    }

    pub(crate) fn computation(&self) -> &dyn Computation {
        self.computation.as_ref()
    }

    pub(crate) fn computation_mut(&mut self) -> &mut dyn Computation {
        self.computation.as_mut()
    }

    pub(crate) fn transition(&mut self, next: ElementState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(KernelFlowError::InvalidState {
                expected: format!("element {} before {}", self.id, next),
                actual: self.state.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Walk the remaining states up to Finished.
    ///
    /// An element that failed before its launch still passes through
    /// Started.
    pub(crate) fn finish(&mut self) -> Result<()> {
        if self.state == ElementState::Scheduled {
            self.transition(ElementState::Started)?;
        }
        self.transition(ElementState::Finished)
    }
}

impl fmt::Debug for ComputationalElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationalElement")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state)
            .field("stream", &self.stream)
            .field("arguments", &self.arguments)
            .finish()
    }
}
