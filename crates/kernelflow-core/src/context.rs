//! Execution context: the DAG scheduler.
//!
//! The context receives computational elements, computes their dependencies
//! against the frontier of live elements, assigns streams, inserts
//! cross-stream event waits, launches them and keeps the array location
//! tracker current. Completion is observed lazily: elements are retired only
//! when a host-observable access, an explicit synchronization or cleanup
//! proves they finished. Retiring an element releases its stream once no
//! other live element uses it.
//!
//! The context is single-threaded. Wrap it in a [`SharedExecutionContext`]
//! to call it from several threads.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::argument::{ArrayHandle, ArrayId};
use crate::computation::{
    ArrayBinding, Computation, HostArrayAccess, LaunchContext, LocationAccess,
};
use crate::config::{DeviceSelectionPolicy, ExecutionPolicy, ParentStreamPolicy, SchedulerConfig};
use crate::dag::{DagEdge, DagVertex, ExecutionDag};
use crate::dependency::ActiveArgumentSet;
use crate::device::{Device, DeviceId, DeviceRegistry};
use crate::element::{
    CompletionHandle, ComputationalElement, Dependency, ElementId, ElementState, ExecutionStream,
};
use crate::error::{KernelFlowError, Result};
use crate::location::{ArrayLocationTracker, Location};
use crate::runtime::{GpuRuntime, MemoryHandle, StreamHandle};
use crate::stream::{Stream, StreamId, StreamPoolStats};

/// Execution context shared between threads.
pub type SharedExecutionContext = Arc<Mutex<ExecutionContext>>;

/// What [`ExecutionContext::synchronize`] waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    /// Every live element using the array.
    Array(ArrayHandle),
    /// Every live element on the device.
    Device(DeviceId),
    /// Every live element.
    All,
}

/// Snapshot of context activity.
#[derive(Debug, Clone, Default)]
pub struct ContextStats {
    /// Elements registered.
    pub elements_registered: u64,
    /// Elements scheduled.
    pub elements_scheduled: u64,
    /// Elements retired after successful completion.
    pub elements_finished: u64,
    /// Elements whose launch failed.
    pub elements_failed: u64,
    /// Scheduled elements not yet retired.
    pub live_elements: usize,
    /// Elements that can still order new work.
    pub frontier_size: usize,
    /// Cross-stream event waits inserted.
    pub event_waits: u64,
    /// Host-side stream or device synchronizations.
    pub host_synchronizations: u64,
    /// Prefetches issued.
    pub prefetches: u64,
    /// Arrays and views not yet freed.
    pub live_arrays: usize,
    /// Per-device stream pool statistics.
    pub pools: Vec<StreamPoolStats>,
}

#[derive(Debug, Default)]
struct Counters {
    registered: u64,
    scheduled: u64,
    finished: u64,
    failed: u64,
    event_waits: u64,
    host_synchronizations: u64,
    prefetches: u64,
}

/// DAG scheduler over a [`GpuRuntime`].
pub struct ExecutionContext {
    runtime: Arc<dyn GpuRuntime>,
    config: SchedulerConfig,
    devices: DeviceRegistry,
    tracker: ArrayLocationTracker,
    memory: HashMap<ArrayId, MemoryHandle>,
    elements: HashMap<ElementId, ComputationalElement>,
    frontier: Vec<ElementId>,
    stream_users: HashMap<StreamHandle, usize>,
    stream_tail: HashMap<StreamHandle, ElementId>,
    manual_streams: Vec<Stream>,
    dag: Option<ExecutionDag>,
    next_element: u64,
    next_array: u64,
    counters: Counters,
}

impl ExecutionContext {
    /// Create a context, enumerating the runtime's devices.
    pub fn new(runtime: Arc<dyn GpuRuntime>, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let devices = DeviceRegistry::enumerate(runtime.as_ref(), &config)?;
        Self::with_devices(runtime, config, devices)
    }

    /// Create a context over an already built device registry.
    ///
    /// The registry may cover fewer devices than the runtime exposes, never
    /// more.
    pub fn with_devices(
        runtime: Arc<dyn GpuRuntime>,
        config: SchedulerConfig,
        mut devices: DeviceRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let available = runtime.device_count()?;
        if devices.device_count() > available {
            return Err(KernelFlowError::invalid_config(format!(
                "registry has {} devices but the {} runtime exposes {}",
                devices.device_count(),
                runtime.name(),
                available
            )));
        }
        let active = runtime.active_device()?;
        if devices.check(active).is_ok() {
            devices.set_current(active)?;
        } else {
            runtime.set_active_device(DeviceId(0))?;
        }

        info!(
            backend = runtime.name(),
            devices = devices.device_count(),
            execution_policy = %config.execution_policy,
            dependency_policy = %config.dependency_policy,
            "Created execution context"
        );

        let dag = config.record_dag.then(ExecutionDag::new);
        Ok(Self {
            runtime,
            config,
            devices,
            tracker: ArrayLocationTracker::new(),
            memory: HashMap::new(),
            elements: HashMap::new(),
            frontier: Vec::new(),
            stream_users: HashMap::new(),
            stream_tail: HashMap::new(),
            manual_streams: Vec::new(),
            dag,
            next_element: 0,
            next_array: 0,
            counters: Counters::default(),
        })
    }

    /// Wrap the context for use from several threads.
    pub fn into_shared(self) -> SharedExecutionContext {
        Arc::new(Mutex::new(self))
    }

    /// Runtime collaborator.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn GpuRuntime> {
        &self.runtime
    }

    /// Configuration fixed at construction.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Execution policy.
    #[must_use]
    pub fn execution_policy(&self) -> ExecutionPolicy {
        self.config.execution_policy
    }

    // ===== Devices =====

    /// Number of devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.device_count()
    }

    /// Get a device.
    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.devices.get(id)
    }

    /// Current device.
    #[must_use]
    pub fn current_device(&self) -> DeviceId {
        self.devices.current()
    }

    /// Select the current device and make it active in the runtime.
    pub fn set_current_device(&mut self, id: DeviceId) -> Result<()> {
        self.devices.set_current(id)?;
        self.runtime.set_active_device(id)
    }

    /// Create a caller-owned stream outside the pool.
    pub fn create_manual_stream(&mut self, device: DeviceId) -> Result<Stream> {
        self.devices.check(device)?;
        self.activate(device)?;
        let handle = self.runtime.create_stream(device)?;
        let stream = Stream::new(
            StreamId {
                device,
                index: self.manual_streams.len(),
            },
            handle,
        );
        self.manual_streams.push(stream);
        debug!(device = %device, handle = %handle, "Created manual stream");
        Ok(stream)
    }

    // ===== Arrays =====

    /// Allocate a managed array, up to date on the host.
    pub fn allocate_array(&mut self, bytes: usize) -> Result<ArrayHandle> {
        let memory = self.runtime.allocate(bytes)?;
        let id = ArrayId(self.next_array);
        self.next_array += 1;
        self.tracker.register_array(id, bytes);
        self.memory.insert(id, memory);
        debug!(array = %id, bytes, "Allocated array");
        Ok(ArrayHandle::root_array(id))
    }

    /// Create a view of `bytes` starting at `offset` within `parent`.
    pub fn create_view(
        &mut self,
        parent: ArrayHandle,
        offset: usize,
        bytes: usize,
    ) -> Result<ArrayHandle> {
        let id = ArrayId(self.next_array);
        self.tracker.register_view(id, parent.id(), offset, bytes)?;
        self.next_array += 1;
        let root = self.tracker.root_of(id)?;
        debug!(view = %id, root = %root, offset, bytes, "Created array view");
        Ok(ArrayHandle::view(id, root))
    }

    /// Free an array after every element using it finished.
    ///
    /// Freeing a root array releases its memory and makes its views stale.
    pub fn free_array(&mut self, array: ArrayHandle) -> Result<()> {
        let id = array.id();
        if self.tracker.is_live(id)? {
            self.synchronize(SyncTarget::Array(array))?;
        }
        self.tracker.free(id)?;
        if !array.is_view() {
            if let Some(memory) = self.memory.remove(&id) {
                self.runtime.free(memory)?;
            }
        }
        debug!(array = %id, "Freed array");
        Ok(())
    }

    /// Make the array's data valid for a host read.
    pub fn prepare_host_read(&mut self, array: ArrayHandle) -> Result<()> {
        let handle = self.submit(HostArrayAccess::read(array))?;
        self.wait(&handle)
    }

    /// Make the array ready for a host write.
    pub fn prepare_host_write(&mut self, array: ArrayHandle) -> Result<()> {
        let handle = self.submit(HostArrayAccess::write(array))?;
        self.wait(&handle)
    }

    /// Locations holding an up-to-date copy of the array.
    pub fn array_locations(&mut self, array: ArrayHandle) -> Result<BTreeSet<Location>> {
        self.tracker.locations(array.id())
    }

    /// Whether `location` holds an up-to-date copy of the array.
    pub fn is_up_to_date(&mut self, array: ArrayHandle, location: Location) -> Result<bool> {
        self.tracker.is_up_to_date(array.id(), location)
    }

    /// Memory backing an array or view.
    pub fn binding(&self, array: ArrayHandle) -> Result<ArrayBinding> {
        self.array_binding(array.id())
    }

    fn array_binding(&self, id: ArrayId) -> Result<ArrayBinding> {
        self.tracker.check_live(id)?;
        let root = self.tracker.root_of(id)?;
        let memory = *self
            .memory
            .get(&root)
            .ok_or(KernelFlowError::UnknownArray(root))?;
        Ok(ArrayBinding {
            array: id,
            memory,
            offset: self.tracker.offset_of(id)?,
            bytes: self.tracker.size_of(id)?,
        })
    }

    // ===== Elements =====

    /// Register an element without scheduling it.
    pub fn register<C>(&mut self, computation: C) -> ElementId
    where
        C: Computation + 'static,
    {
        self.register_boxed(Box::new(computation), None)
    }

    /// Register an element bound to a manual stream.
    pub fn register_on_stream<C>(&mut self, computation: C, stream: Stream) -> Result<ElementId>
    where
        C: Computation + 'static,
    {
        if !self.manual_streams.contains(&stream) {
            return Err(KernelFlowError::InvalidState {
                expected: "manual stream created by this context".to_string(),
                actual: format!("stream {}", stream.handle()),
            });
        }
        Ok(self.register_boxed(Box::new(computation), Some(stream)))
    }

    /// Register a boxed computation.
    pub fn register_boxed(
        &mut self,
        computation: Box<dyn Computation>,
        manual_stream: Option<Stream>,
    ) -> ElementId {
        let id = ElementId(self.next_element);
        self.next_element += 1;
        let element = ComputationalElement::new(
            id,
            computation,
            self.config.dependency_policy,
            manual_stream,
        );
        trace!(element = %id, name = element.name(), "Registered element");
        self.elements.insert(id, element);
        self.counters.registered += 1;
        id
    }

    /// Register and schedule in one step.
    pub fn submit<C>(&mut self, computation: C) -> Result<CompletionHandle>
    where
        C: Computation + 'static,
    {
        let id = self.register(computation);
        self.schedule(id)
    }

    /// Register on a manual stream and schedule in one step.
    pub fn submit_on_stream<C>(&mut self, computation: C, stream: Stream) -> Result<CompletionHandle>
    where
        C: Computation + 'static,
    {
        let id = self.register_on_stream(computation, stream)?;
        self.schedule(id)
    }

    /// A registered, live element.
    #[must_use]
    pub fn element(&self, id: ElementId) -> Option<&ComputationalElement> {
        self.elements.get(&id)
    }

    /// Elements that can still order new work, oldest first.
    #[must_use]
    pub fn frontier(&self) -> &[ElementId] {
        &self.frontier
    }

    /// Number of scheduled elements not yet retired.
    #[must_use]
    pub fn live_elements(&self) -> usize {
        self.elements
            .values()
            .filter(|e| e.state() != ElementState::Created)
            .count()
    }

    /// Recorded DAG, when `record_dag` is enabled.
    #[must_use]
    pub fn dag(&self) -> Option<&ExecutionDag> {
        self.dag.as_ref()
    }

    /// Schedule a registered element.
    ///
    /// Fails with [`KernelFlowError::AlreadyScheduled`] on a second call. If
    /// placement fails (stale arrays, stream exhaustion) the element stays
    /// registered and can be scheduled again. Failures of the launch itself
    /// are stored in the returned handle.
    pub fn schedule(&mut self, id: ElementId) -> Result<CompletionHandle> {
        let mut element = match self.elements.remove(&id) {
            Some(element) if element.state() == ElementState::Created => element,
            Some(element) => {
                self.elements.insert(id, element);
                return Err(KernelFlowError::AlreadyScheduled(id));
            }
            None if id.0 < self.next_element => {
                return Err(KernelFlowError::AlreadyScheduled(id));
            }
            None => return Err(KernelFlowError::UnknownElement(id)),
        };

        if let Err(err) = self.place(&mut element) {
            self.elements.insert(id, element);
            return Err(err);
        }
        self.counters.scheduled += 1;
        let handle = element.handle.clone();
        self.launch(element)?;
        Ok(handle)
    }

    /// Wait until the element finished and return its outcome.
    pub fn wait(&mut self, handle: &CompletionHandle) -> Result<()> {
        if let Some(result) = handle.result() {
            return result;
        }
        let stream = match self.elements.get(&handle.element()) {
            Some(element) => match (element.state(), element.stream()) {
                (ElementState::Created, _) | (_, None) => {
                    return Err(KernelFlowError::InvalidState {
                        expected: "scheduled element".to_string(),
                        actual: element.state().to_string(),
                    })
                }
                (_, Some(stream)) => stream,
            },
            None => return Err(KernelFlowError::UnknownElement(handle.element())),
        };
        self.synchronize_stream(stream)?;
        handle.result().unwrap_or(Ok(()))
    }

    /// Block until the target's live elements finished, then retire them.
    pub fn synchronize(&mut self, target: SyncTarget) -> Result<()> {
        match target {
            SyncTarget::All => {
                for device in 0..self.devices.device_count() {
                    self.runtime.synchronize_device(DeviceId(device))?;
                    self.counters.host_synchronizations += 1;
                }
                let live: Vec<ElementId> = self.live_ids(|_| true);
                self.retire(live)?;
                for device in self.devices.iter_mut() {
                    device.streams_mut().release_all();
                }
                self.stream_users.clear();
                self.stream_tail.clear();
                debug!("Synchronized all devices");
            }
            SyncTarget::Device(device) => {
                self.devices.check(device)?;
                self.runtime.synchronize_device(device)?;
                self.counters.host_synchronizations += 1;
                let live = self.live_ids(|e| e.stream().and_then(|s| s.device()) == Some(device));
                self.retire(live)?;
                debug!(device = %device, "Synchronized device");
            }
            SyncTarget::Array(array) => {
                self.tracker.check_live(array.id())?;
                let root = self.tracker.root_of(array.id())?;
                let mut streams: Vec<ExecutionStream> = Vec::new();
                for element in self.elements.values() {
                    if element.state() == ElementState::Created {
                        continue;
                    }
                    let uses_array = element
                        .arguments()
                        .iter()
                        .any(|a| a.root_array() == Some(root));
                    if let (true, Some(stream)) = (uses_array, element.stream()) {
                        if !streams.contains(&stream) {
                            streams.push(stream);
                        }
                    }
                }
                for stream in streams {
                    self.synchronize_stream(stream)?;
                }
                trace!(array = %array.id(), "Synchronized array");
            }
        }
        Ok(())
    }

    /// Finish all work and destroy every stream.
    pub fn cleanup(&mut self) -> Result<()> {
        self.synchronize(SyncTarget::All)?;
        let runtime = Arc::clone(&self.runtime);
        for device in self.devices.iter_mut() {
            device.streams_mut().cleanup(runtime.as_ref())?;
        }
        for stream in self.manual_streams.drain(..) {
            runtime.destroy_stream(stream.handle())?;
        }
        info!("Execution context cleaned up");
        Ok(())
    }

    /// Activity snapshot.
    #[must_use]
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            elements_registered: self.counters.registered,
            elements_scheduled: self.counters.scheduled,
            elements_finished: self.counters.finished,
            elements_failed: self.counters.failed,
            live_elements: self.live_elements(),
            frontier_size: self.frontier.len(),
            event_waits: self.counters.event_waits,
            host_synchronizations: self.counters.host_synchronizations,
            prefetches: self.counters.prefetches,
            live_arrays: self.tracker.live_count(),
            pools: self.devices.iter().map(|d| d.streams().stats()).collect(),
        }
    }

    // ===== Scheduling internals =====

    /// Compute dependencies and assign a stream. Rolled back on error.
    fn place(&mut self, element: &mut ComputationalElement) -> Result<()> {
        for array in element.arrays() {
            self.tracker.check_live(array)?;
        }

        let active = element.active_arguments().clone();
        if !active.is_empty() {
            for parent in self.frontier.clone() {
                if let Some(member) = self.elements.get_mut(&parent) {
                    let arguments = member.compute_dependencies(&active);
                    if !arguments.is_empty() {
                        element.parents.push(Dependency { parent, arguments });
                    }
                }
            }
            let elements = &self.elements;
            self.frontier.retain(|id| {
                elements
                    .get(id)
                    .map_or(false, |e| e.has_possible_dependencies())
            });
        }

        match self.assign_stream(element) {
            Ok(stream) => {
                element.stream = Some(stream);
                element.transition(ElementState::Scheduled)?;
                debug!(
                    element = %element.id(),
                    name = element.name(),
                    stream = %stream,
                    parents = element.parents.len(),
                    "Scheduled element"
                );
                Ok(())
            }
            Err(err) => {
                self.restore_parents(element);
                Err(err)
            }
        }
    }

    fn assign_stream(&mut self, element: &ComputationalElement) -> Result<ExecutionStream> {
        if !element.can_use_stream() {
            return Ok(ExecutionStream::Host);
        }
        if let Some(stream) = element.manual_stream() {
            return Ok(ExecutionStream::Manual(stream));
        }
        if self.config.execution_policy == ExecutionPolicy::Sync {
            return Ok(ExecutionStream::DeviceDefault(self.devices.current()));
        }

        if let Some(stream) = self.parent_stream(element) {
            *self.stream_users.entry(stream.handle()).or_insert(0) += 1;
            return Ok(ExecutionStream::Pooled(stream));
        }

        let policy = self.config.device_selection_policy;
        let resident: Vec<usize> = match policy {
            DeviceSelectionPolicy::MinTransfer => (0..self.devices.device_count())
                .map(|d| self.tracker.resident_bytes(element.arrays(), DeviceId(d)))
                .collect(),
            _ => Vec::new(),
        };
        let device = self
            .devices
            .select_device(policy, |d| resident.get(d.0).copied().unwrap_or(0));
        let stream = self
            .devices
            .get_mut(device)?
            .streams_mut()
            .retrieve(self.runtime.as_ref(), self.config.new_stream_policy)?;
        *self.stream_users.entry(stream.handle()).or_insert(0) += 1;
        Ok(ExecutionStream::Pooled(stream))
    }

    /// A live parent's pooled stream the element may continue on.
    fn parent_stream(&self, element: &ComputationalElement) -> Option<Stream> {
        element.parents.iter().find_map(|dep| {
            let parent = self.elements.get(&dep.parent)?;
            let stream = match parent.stream()? {
                ExecutionStream::Pooled(stream) => stream,
                _ => return None,
            };
            match self.config.parent_stream_policy {
                ParentStreamPolicy::SameAsParent => Some(stream),
                ParentStreamPolicy::Disjoint => {
                    (self.stream_tail.get(&stream.handle()) == Some(&dep.parent)).then_some(stream)
                }
            }
        })
    }

    /// Order after parents, update locations and launch.
    fn launch(&mut self, mut element: ComputationalElement) -> Result<()> {
        let id = element.id();
        let Some(stream) = element.stream else {
            return Err(KernelFlowError::InvalidState {
                expected: "element with an assigned stream".to_string(),
                actual: "unassigned".to_string(),
            });
        };
        self.record_vertex(&element, stream);

        if let Err(err) = self.prepare_launch(&element, stream) {
            self.fail(element, err.clone())?;
            return Err(err);
        }

        let bindings = match self.bindings(&element) {
            Ok(bindings) => bindings,
            Err(err) => {
                self.fail(element, err.clone())?;
                return Err(err);
            }
        };
        let location = match stream.device() {
            Some(device) => Location::Device(device),
            None => Location::Host,
        };
        element.transition(ElementState::Started)?;
        let launch = LaunchContext::new(
            id,
            self.runtime.as_ref(),
            location,
            stream.handle(),
            bindings,
        );
        let outcome = element.computation_mut().execute(&launch);
        drop(launch);

        if let Err(err) = outcome {
            return self.fail(element, err);
        }

        match stream {
            ExecutionStream::Pooled(s) | ExecutionStream::Manual(s) => {
                let event = match self.runtime.record_event(s.handle()) {
                    Ok(event) => event,
                    Err(err) => return self.fail(element, err),
                };
                element.completion_event = Some(event);
                self.stream_tail.insert(s.handle(), id);
                if let ExecutionStream::Pooled(s) = stream {
                    if let Ok(device) = self.devices.get_mut(s.device()) {
                        device.streams_mut().record_launch(s.id());
                    }
                }
                if element.has_possible_dependencies() {
                    self.frontier.push(id);
                }
                self.elements.insert(id, element);

                // Manual streams skip placement but not the SYNC guarantee.
                if matches!(stream, ExecutionStream::Manual(_))
                    && self.config.execution_policy == ExecutionPolicy::Sync
                {
                    if let Err(err) = self.runtime.synchronize_stream(s.handle()) {
                        return match self.elements.remove(&id) {
                            Some(element) => self.fail(element, err),
                            None => Err(err),
                        };
                    }
                    self.counters.host_synchronizations += 1;
                    let live = self.live_ids(|e| e.stream() == Some(stream));
                    self.retire(live)?;
                }
            }
            ExecutionStream::DeviceDefault(device) => {
                if let Err(err) = self.runtime.synchronize_device(device) {
                    return self.fail(element, err);
                }
                self.counters.host_synchronizations += 1;
                self.elements.insert(id, element);
                self.retire(vec![id])?;
            }
            ExecutionStream::Host => {
                self.elements.insert(id, element);
                self.retire(vec![id])?;
            }
        }
        Ok(())
    }

    /// Insert waits on parents and update the location tracker.
    fn prepare_launch(
        &mut self,
        element: &ComputationalElement,
        stream: ExecutionStream,
    ) -> Result<()> {
        if let Some(device) = stream.device() {
            self.activate(device)?;
        }

        let mut parent_streams: Vec<ExecutionStream> = Vec::new();
        let mut events = Vec::new();
        for dep in &element.parents {
            let Some(parent) = self.elements.get(&dep.parent) else {
                continue;
            };
            let Some(parent_stream) = parent.stream() else {
                continue;
            };
            if stream.is_synchronous() {
                if !parent_streams.contains(&parent_stream) {
                    parent_streams.push(parent_stream);
                }
            } else if parent_stream.handle() != stream.handle() {
                if let Some(event) = parent.completion_event {
                    events.push((dep.parent, event));
                }
            }
        }

        for parent_stream in parent_streams {
            self.synchronize_stream(parent_stream)?;
        }
        if let Some(handle) = stream.handle() {
            for (parent, event) in events {
                self.runtime.wait_event(handle, event)?;
                self.counters.event_waits += 1;
                trace!(element = %element.id(), parent = %parent, "Inserted event wait");
            }
        }

        self.update_locations(element, stream)
    }

    fn update_locations(
        &mut self,
        element: &ComputationalElement,
        stream: ExecutionStream,
    ) -> Result<()> {
        let location = match stream.device() {
            Some(device) => Location::Device(device),
            None => Location::Host,
        };
        let const_aware = self.config.is_const_aware();
        let operands = ActiveArgumentSet::from_arguments(element.arguments());
        for arg in operands.iter() {
            let Some(array) = arg.array_id() else {
                continue;
            };
            match element.computation().location_access(arg, const_aware) {
                LocationAccess::Read => {
                    if !self.tracker.mark_reader(array, location)? {
                        continue;
                    }
                    match location {
                        Location::Host => self.tracker.mark_synchronized(array, location)?,
                        Location::Device(device) if self.config.input_prefetch => {
                            let memory = self.array_binding(array)?.memory;
                            self.runtime.prefetch(memory, device, stream.handle())?;
                            self.tracker.mark_synchronized(array, location)?;
                            self.counters.prefetches += 1;
                            trace!(array = %array, device = %device, "Prefetched array");
                        }
                        Location::Device(_) => {}
                    }
                }
                LocationAccess::Write => self.tracker.mark_writer(array, location, false)?,
                LocationAccess::RelaxedWrite => self.tracker.mark_writer(array, location, true)?,
            }
        }
        Ok(())
    }

    fn bindings(&self, element: &ComputationalElement) -> Result<Vec<ArrayBinding>> {
        let mut bindings: Vec<ArrayBinding> = Vec::new();
        for array in element.arrays() {
            if bindings.iter().any(|b| b.array == array) {
                continue;
            }
            bindings.push(self.array_binding(array)?);
        }
        Ok(bindings)
    }

    /// Record a failed launch. Parents get their operands back.
    ///
    /// The handle is completed before any runtime call so that a failing
    /// cleanup cannot leave it pending.
    fn fail(&mut self, mut element: ComputationalElement, err: KernelFlowError) -> Result<()> {
        let id = element.id();
        warn!(element = %id, name = element.name(), error = %err, "Element failed");
        element.finish()?;
        element.handle.complete(Err(err));
        self.counters.failed += 1;

        self.frontier.retain(|f| *f != id);
        self.restore_parents(&mut element);
        if let Some(stream) = element.stream.and_then(|s| s.handle()) {
            if self.stream_tail.get(&stream) == Some(&id) {
                self.stream_tail.remove(&stream);
            }
        }
        if let Some(ExecutionStream::Pooled(stream)) = element.stream {
            self.release_stream_use(stream)?;
        }
        if let Some(event) = element.completion_event.take() {
            self.runtime.destroy_event(event)?;
        }
        Ok(())
    }

    fn restore_parents(&mut self, element: &mut ComputationalElement) {
        for dep in element.parents.drain(..) {
            if let Some(parent) = self.elements.get_mut(&dep.parent) {
                parent.restore_arguments(&dep.arguments);
                if !self.frontier.contains(&dep.parent) {
                    self.frontier.push(dep.parent);
                }
            }
        }
    }

    /// Synchronize one stream on the host and retire everything on it.
    fn synchronize_stream(&mut self, stream: ExecutionStream) -> Result<()> {
        let live = match stream {
            ExecutionStream::Host => Vec::new(),
            ExecutionStream::DeviceDefault(device) => {
                self.runtime.synchronize_device(device)?;
                self.counters.host_synchronizations += 1;
                self.live_ids(|e| e.stream().and_then(|s| s.device()) == Some(device))
            }
            ExecutionStream::Pooled(s) | ExecutionStream::Manual(s) => {
                self.runtime.synchronize_stream(s.handle())?;
                self.counters.host_synchronizations += 1;
                self.live_ids(|e| e.stream().and_then(|x| x.handle()) == Some(s.handle()))
            }
        };
        self.retire(live)
    }

    fn live_ids<F>(&self, filter: F) -> Vec<ElementId>
    where
        F: Fn(&ComputationalElement) -> bool,
    {
        self.elements
            .values()
            .filter(|e| e.state() != ElementState::Created && filter(e))
            .map(|e| e.id())
            .collect()
    }

    /// Mark elements and, transitively, their live ancestors as finished.
    fn retire(&mut self, ids: Vec<ElementId>) -> Result<()> {
        let mut pending = ids;
        while let Some(id) = pending.pop() {
            let Some(mut element) = self.elements.remove(&id) else {
                continue;
            };
            if element.state() == ElementState::Created {
                self.elements.insert(id, element);
                continue;
            }
            element.finish()?;
            element.handle.complete(Ok(()));
            if let Some(event) = element.completion_event.take() {
                self.runtime.destroy_event(event)?;
            }
            self.frontier.retain(|f| *f != id);
            if let Some(stream) = element.stream.and_then(|s| s.handle()) {
                if self.stream_tail.get(&stream) == Some(&id) {
                    self.stream_tail.remove(&stream);
                }
            }
            if let Some(ExecutionStream::Pooled(stream)) = element.stream {
                self.release_stream_use(stream)?;
            }
            self.counters.finished += 1;
            trace!(element = %id, "Retired element");
            pending.extend(element.parents.iter().map(|d| d.parent));
        }
        Ok(())
    }

    fn release_stream_use(&mut self, stream: Stream) -> Result<()> {
        let remaining = match self.stream_users.get_mut(&stream.handle()) {
            Some(users) => {
                *users = users.saturating_sub(1);
                *users
            }
            None => return Ok(()),
        };
        if remaining == 0 {
            self.stream_users.remove(&stream.handle());
            self.devices
                .get_mut(stream.device())?
                .streams_mut()
                .release(stream.id())?;
        }
        Ok(())
    }

    fn activate(&self, device: DeviceId) -> Result<()> {
        if self.runtime.active_device()? != device {
            self.runtime.set_active_device(device)?;
        }
        Ok(())
    }

    fn record_vertex(&mut self, element: &ComputationalElement, stream: ExecutionStream) {
        if let Some(dag) = self.dag.as_mut() {
            dag.add_vertex(DagVertex {
                element: element.id(),
                name: element.name().to_string(),
                kind: element.computation().kind(),
                stream: stream.to_string(),
            });
            for dep in &element.parents {
                dag.add_edge(DagEdge {
                    parent: dep.parent,
                    child: element.id(),
                    arguments: dep.arguments.clone(),
                });
            }
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("backend", &self.runtime.name())
            .field("config", &self.config)
            .field("devices", &self.devices.device_count())
            .field("live_elements", &self.live_elements())
            .field("frontier", &self.frontier)
            .finish()
    }
}
