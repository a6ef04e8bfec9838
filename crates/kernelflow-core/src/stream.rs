//! Per-device stream pool.
//!
//! A pool owns every stream it created on its device. Streams are either
//! free or busy; busy streams carry at least one live element. Streams are
//! only destroyed by [`StreamPool::cleanup`].

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use tracing::{debug, info};

use crate::config::NewStreamPolicy;
use crate::device::DeviceId;
use crate::error::{KernelFlowError, Result};
use crate::runtime::{GpuRuntime, StreamHandle};

/// Position of a stream within its device's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    /// Owning device.
    pub device: DeviceId,
    /// Creation index on the device.
    pub index: usize,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.index)
    }
}

/// A hardware stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    id: StreamId,
    handle: StreamHandle,
}

impl Stream {
    pub(crate) fn new(id: StreamId, handle: StreamHandle) -> Self {
        Self { id, handle }
    }

    /// Stream id.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Device the stream belongs to.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.id.device
    }

    /// Runtime handle.
    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        self.handle
    }
}

/// Streams of one device.
#[derive(Debug)]
pub struct StreamPool {
    device: DeviceId,
    streams: Vec<Stream>,
    free: VecDeque<usize>,
    busy: BTreeSet<usize>,
    max_streams: Option<usize>,
    launches: Vec<u64>,
    total_launches: u64,
}

impl StreamPool {
    /// Create an empty pool for `device`.
    #[must_use]
    pub fn new(device: DeviceId, max_streams: Option<usize>) -> Self {
        Self {
            device,
            streams: Vec::new(),
            free: VecDeque::new(),
            busy: BTreeSet::new(),
            max_streams,
            launches: Vec::new(),
            total_launches: 0,
        }
    }

    /// Owning device.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Take a free stream, marking it busy.
    pub fn acquire_free_stream(&mut self) -> Result<Stream> {
        let index = self
            .free
            .pop_front()
            .ok_or(KernelFlowError::NoFreeStream {
                device: self.device,
            })?;
        self.busy.insert(index);
        Ok(self.streams[index])
    }

    /// Create a new stream, busy on creation.
    ///
    /// The owning device is made active first if it is not.
    pub fn create_stream(&mut self, runtime: &dyn GpuRuntime) -> Result<Stream> {
        if let Some(limit) = self.max_streams {
            if self.streams.len() >= limit {
                return Err(KernelFlowError::NoFreeStream {
                    device: self.device,
                });
            }
        }
        if runtime.active_device()? != self.device {
            runtime.set_active_device(self.device)?;
        }
        let handle = runtime.create_stream(self.device)?;
        let id = StreamId {
            device: self.device,
            index: self.streams.len(),
        };
        let stream = Stream::new(id, handle);
        self.streams.push(stream);
        self.launches.push(0);
        self.busy.insert(id.index);
        info!(stream = %id, handle = %handle, "Created stream");
        Ok(stream)
    }

    /// Obtain a stream for new work according to `policy`.
    pub fn retrieve(&mut self, runtime: &dyn GpuRuntime, policy: NewStreamPolicy) -> Result<Stream> {
        match policy {
            NewStreamPolicy::ReuseFree => match self.acquire_free_stream() {
                Ok(stream) => Ok(stream),
                Err(KernelFlowError::NoFreeStream { .. }) => self.create_stream(runtime),
                Err(e) => Err(e),
            },
            NewStreamPolicy::AlwaysNew => self.create_stream(runtime),
        }
    }

    /// Return a busy stream to the free set.
    pub fn release(&mut self, id: StreamId) -> Result<()> {
        let index = self.index_of(id)?;
        if !self.busy.remove(&index) {
            return Err(KernelFlowError::InvalidState {
                expected: format!("stream {} busy", id),
                actual: "free".to_string(),
            });
        }
        self.free.push_back(index);
        debug!(stream = %id, "Released stream");
        Ok(())
    }

    /// Return every stream to the free set.
    pub fn release_all(&mut self) {
        while let Some(index) = self.busy.pop_first() {
            self.free.push_back(index);
        }
    }

    /// Count a launch on a stream.
    pub fn record_launch(&mut self, id: StreamId) {
        if id.device == self.device {
            if let Some(count) = self.launches.get_mut(id.index) {
                *count += 1;
                self.total_launches += 1;
            }
        }
    }

    /// Look up a stream.
    #[must_use]
    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        if id.device == self.device {
            self.streams.get(id.index)
        } else {
            None
        }
    }

    /// Whether the stream is in the free set.
    #[must_use]
    pub fn is_free(&self, id: StreamId) -> bool {
        id.device == self.device && self.free.contains(&id.index)
    }

    /// Number of streams created.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.streams.len()
    }

    /// Number of free streams.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of busy streams.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    /// Utilization statistics.
    #[must_use]
    pub fn stats(&self) -> StreamPoolStats {
        StreamPoolStats {
            device: self.device,
            created: self.streams.len(),
            free: self.free.len(),
            busy: self.busy.len(),
            total_launches: self.total_launches,
            per_stream_launches: self.launches.clone(),
        }
    }

    /// Destroy every stream of the pool.
    pub fn cleanup(&mut self, runtime: &dyn GpuRuntime) -> Result<()> {
        for stream in self.streams.drain(..) {
            runtime.destroy_stream(stream.handle)?;
        }
        self.free.clear();
        self.busy.clear();
        self.launches.clear();
        debug!(device = %self.device, "Destroyed streams");
        Ok(())
    }

    fn index_of(&self, id: StreamId) -> Result<usize> {
        if id.device == self.device && id.index < self.streams.len() {
            Ok(id.index)
        } else {
            Err(KernelFlowError::InvalidState {
                expected: format!("stream of device {}", self.device),
                actual: format!("stream {}", id),
            })
        }
    }
}

/// Snapshot of a pool.
#[derive(Debug, Clone)]
pub struct StreamPoolStats {
    /// Owning device.
    pub device: DeviceId,
    /// Streams created.
    pub created: usize,
    /// Streams free.
    pub free: usize,
    /// Streams busy.
    pub busy: usize,
    /// Launches across all streams.
    pub total_launches: u64,
    /// Launches per stream.
    pub per_stream_launches: Vec<u64>,
}

impl StreamPoolStats {
    /// How evenly launches spread over the pool's streams.
    ///
    /// An even share per stream divided by the share of the busiest stream:
    /// 1.0 when every stream ran as many launches as the others, `1/n` when
    /// a single stream of `n` ran all of them. A pool without launches
    /// counts as even.
    #[must_use]
    pub fn launch_spread(&self) -> f64 {
        let busiest = self.per_stream_launches.iter().copied().max().unwrap_or(0);
        if busiest == 0 {
            return 1.0;
        }
        let even_share = self.total_launches as f64 / self.per_stream_launches.len() as f64;
        even_share / busiest as f64
    }
}

impl fmt::Display for StreamPoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device {}: {} streams ({} free, {} busy), {} launches, {:.0}% spread",
            self.device,
            self.created,
            self.free,
            self.busy,
            self.total_launches,
            self.launch_spread() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{Call, MockRuntime};

    fn assert_invariant(pool: &StreamPool) {
        assert_eq!(pool.free_count() + pool.busy_count(), pool.created_count());
    }

    #[test]
    fn test_acquire_from_empty_pool_fails() {
        let mut pool = StreamPool::new(DeviceId(0), None);
        let err = pool.acquire_free_stream().unwrap_err();
        assert!(matches!(err, KernelFlowError::NoFreeStream { device } if device == DeviceId(0)));
    }

    #[test]
    fn test_acquire_release_keeps_invariant() {
        let runtime = MockRuntime::new(1);
        let mut pool = StreamPool::new(DeviceId(0), None);
        let s1 = pool.create_stream(&runtime).unwrap();
        let s2 = pool.create_stream(&runtime).unwrap();
        assert_invariant(&pool);
        assert_eq!(pool.busy_count(), 2);

        pool.release(s1.id()).unwrap();
        assert_invariant(&pool);
        assert!(pool.is_free(s1.id()));

        let again = pool.acquire_free_stream().unwrap();
        assert_eq!(again, s1);
        assert_invariant(&pool);

        pool.release(s2.id()).unwrap();
        pool.release(s1.id()).unwrap();
        assert_eq!(pool.free_count(), 2);
        assert_invariant(&pool);
    }

    #[test]
    fn test_double_release_is_rejected() {
        let runtime = MockRuntime::new(1);
        let mut pool = StreamPool::new(DeviceId(0), None);
        let s = pool.create_stream(&runtime).unwrap();
        pool.release(s.id()).unwrap();
        assert!(pool.release(s.id()).is_err());
        assert_invariant(&pool);
    }

    #[test]
    fn test_create_activates_owning_device() {
        let runtime = MockRuntime::new(2);
        let mut pool = StreamPool::new(DeviceId(1), None);
        let stream = pool.create_stream(&runtime).unwrap();
        assert_eq!(stream.device(), DeviceId(1));

        let calls = runtime.calls();
        assert_eq!(calls[0], Call::SetActiveDevice(DeviceId(1)));
        assert!(matches!(calls[1], Call::CreateStream(DeviceId(1), _)));
    }

    #[test]
    fn test_stream_limit() {
        let runtime = MockRuntime::new(1);
        let mut pool = StreamPool::new(DeviceId(0), Some(1));
        let s = pool.retrieve(&runtime, NewStreamPolicy::ReuseFree).unwrap();
        assert!(matches!(
            pool.retrieve(&runtime, NewStreamPolicy::ReuseFree),
            Err(KernelFlowError::NoFreeStream { .. })
        ));

        pool.release(s.id()).unwrap();
        assert_eq!(pool.retrieve(&runtime, NewStreamPolicy::ReuseFree).unwrap(), s);
    }

    #[test]
    fn test_always_new_ignores_free_streams() {
        let runtime = MockRuntime::new(1);
        let mut pool = StreamPool::new(DeviceId(0), None);
        let s1 = pool.retrieve(&runtime, NewStreamPolicy::AlwaysNew).unwrap();
        pool.release(s1.id()).unwrap();
        let s2 = pool.retrieve(&runtime, NewStreamPolicy::AlwaysNew).unwrap();
        assert_ne!(s1, s2);
        assert_eq!(pool.created_count(), 2);
    }

    #[test]
    fn test_release_all_and_cleanup() {
        let runtime = MockRuntime::new(1);
        let mut pool = StreamPool::new(DeviceId(0), None);
        pool.create_stream(&runtime).unwrap();
        pool.create_stream(&runtime).unwrap();
        pool.release_all();
        assert_eq!(pool.free_count(), 2);
        assert_invariant(&pool);

        pool.cleanup(&runtime).unwrap();
        assert_eq!(pool.created_count(), 0);
        let destroyed = runtime
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::DestroyStream(_)))
            .count();
        assert_eq!(destroyed, 2);
    }

    #[test]
    fn test_launch_spread() {
        let runtime = MockRuntime::new(1);
        let mut pool = StreamPool::new(DeviceId(0), None);
        assert_eq!(pool.stats().launch_spread(), 1.0);

        let a = pool.create_stream(&runtime).unwrap();
        let b = pool.create_stream(&runtime).unwrap();
        pool.record_launch(a.id());
        assert!((pool.stats().launch_spread() - 0.5).abs() < 1e-9);

        pool.record_launch(b.id());
        assert!((pool.stats().launch_spread() - 1.0).abs() < 1e-9);

        pool.record_launch(a.id());
        pool.record_launch(a.id());
        assert!((pool.stats().launch_spread() - 2.0 / 3.0).abs() < 1e-9);
    }
}
