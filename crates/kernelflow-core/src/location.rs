//! Array memory-location tracking.
//!
//! For every managed array the tracker records the set of locations holding
//! an up-to-date copy of its data. The tracker only decides whether a
//! synchronization is owed; moving data is the runtime's job.
//!
//! Views share their root array's memory. A view caches the root's location
//! set and refreshes it lazily: the root carries a generation counter bumped
//! on every change, and a view whose recorded generation is behind copies the
//! root's set on its next access.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::trace;

use crate::argument::ArrayId;
use crate::device::DeviceId;
use crate::error::{KernelFlowError, Result};

/// Where an up-to-date copy of array data can live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    /// Host memory.
    Host,
    /// Memory of a device.
    Device(DeviceId),
}

impl Location {
    /// Device id, if this is a device location.
    #[must_use]
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Location::Host => None,
            Location::Device(id) => Some(*id),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => write!(f, "host"),
            Location::Device(id) => write!(f, "device {}", id),
        }
    }
}

impl From<DeviceId> for Location {
    fn from(id: DeviceId) -> Self {
        Location::Device(id)
    }
}

#[derive(Debug)]
struct ArrayRecord {
    root: ArrayId,
    offset: usize,
    bytes: usize,
    locations: BTreeSet<Location>,
    /// Roots: bumped on every change. Views: last root generation copied.
    generation: u64,
    freed: bool,
}

/// Location sets of every managed array and view.
#[derive(Debug, Default)]
pub struct ArrayLocationTracker {
    arrays: HashMap<ArrayId, ArrayRecord>,
}

impl ArrayLocationTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new array, up to date on the host only.
    pub fn register_array(&mut self, id: ArrayId, bytes: usize) {
        self.arrays.insert(
            id,
            ArrayRecord {
                root: id,
                offset: 0,
                bytes,
                locations: BTreeSet::from([Location::Host]),
                generation: 0,
                freed: false,
            },
        );
    }

    /// Register a view of `parent` covering `bytes` starting at `offset`.
    pub fn register_view(
        &mut self,
        id: ArrayId,
        parent: ArrayId,
        offset: usize,
        bytes: usize,
    ) -> Result<()> {
        self.check_live(parent)?;
        let (root, base, parent_bytes) = {
            let record = self.record(parent)?;
            (record.root, record.offset, record.bytes)
        };
        let end = offset.checked_add(bytes).unwrap_or(usize::MAX);
        if end > parent_bytes {
            return Err(KernelFlowError::OutOfBounds {
                array: parent,
                requested: end,
                size: parent_bytes,
            });
        }
        let root_record = self.record(root)?;
        let view = ArrayRecord {
            root,
            offset: base + offset,
            bytes,
            locations: root_record.locations.clone(),
            generation: root_record.generation,
            freed: false,
        };
        self.arrays.insert(id, view);
        Ok(())
    }

    /// Whether the id was ever registered.
    #[must_use]
    pub fn contains(&self, id: ArrayId) -> bool {
        self.arrays.contains_key(&id)
    }

    /// Root allocation of an array or view.
    pub fn root_of(&self, id: ArrayId) -> Result<ArrayId> {
        Ok(self.record(id)?.root)
    }

    /// Size of an array or view in bytes.
    pub fn size_of(&self, id: ArrayId) -> Result<usize> {
        Ok(self.record(id)?.bytes)
    }

    /// Byte offset of a view within its root (0 for roots).
    pub fn offset_of(&self, id: ArrayId) -> Result<usize> {
        Ok(self.record(id)?.offset)
    }

    /// Fail with [`KernelFlowError::ArrayFreed`] if the array or its root was freed.
    pub fn check_live(&self, id: ArrayId) -> Result<()> {
        let record = self.record(id)?;
        if record.freed || self.record(record.root)?.freed {
            return Err(KernelFlowError::ArrayFreed(id));
        }
        Ok(())
    }

    /// Whether the array is registered and not freed.
    pub fn is_live(&self, id: ArrayId) -> Result<bool> {
        match self.check_live(id) {
            Ok(()) => Ok(true),
            Err(KernelFlowError::ArrayFreed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current location set of an array or view.
    pub fn locations(&mut self, id: ArrayId) -> Result<BTreeSet<Location>> {
        self.check_live(id)?;
        self.refresh(id)?;
        Ok(self.record(id)?.locations.clone())
    }

    /// Whether `location` holds an up-to-date copy.
    pub fn is_up_to_date(&mut self, id: ArrayId, location: Location) -> Result<bool> {
        self.check_live(id)?;
        self.refresh(id)?;
        Ok(self.record(id)?.locations.contains(&location))
    }

    /// Record a write at `location`.
    ///
    /// The set is reset to `{location}`. With `relaxed`, the location is added
    /// instead; this is only used for writes that leave the other copies valid.
    pub fn mark_writer(&mut self, id: ArrayId, location: Location, relaxed: bool) -> Result<()> {
        self.check_live(id)?;
        if relaxed {
            self.update_root(id, |set| {
                set.insert(location);
            })
        } else {
            self.update_root(id, |set| {
                set.clear();
                set.insert(location);
            })
        }
    }

    /// Whether reading at `location` owes a synchronization. Never mutates.
    pub fn mark_reader(&mut self, id: ArrayId, location: Location) -> Result<bool> {
        Ok(!self.is_up_to_date(id, location)?)
    }

    /// Record that a transfer to `location` completed.
    pub fn mark_synchronized(&mut self, id: ArrayId, location: Location) -> Result<()> {
        self.check_live(id)?;
        self.update_root(id, |set| {
            set.insert(location);
        })
    }

    /// Keep only `location` as up to date.
    pub fn invalidate_all_except(&mut self, id: ArrayId, location: Location) -> Result<()> {
        self.mark_writer(id, location, false)
    }

    /// Free an array or view. Freeing a root also makes its views stale.
    ///
    /// A view whose root was freed counts as freed.
    pub fn free(&mut self, id: ArrayId) -> Result<()> {
        let root = self.root_of(id)?;
        if self.record(id)?.freed || self.record(root)?.freed {
            return Err(KernelFlowError::ArrayAlreadyFreed(id));
        }
        let record = self
            .arrays
            .get_mut(&id)
            .ok_or(KernelFlowError::UnknownArray(id))?;
        record.freed = true;
        record.locations.clear();
        trace!(array = %id, "Freed array");
        Ok(())
    }

    /// Sum of the sizes of `arrays` up to date on `device`.
    pub fn resident_bytes<I>(&mut self, arrays: I, device: DeviceId) -> usize
    where
        I: IntoIterator<Item = ArrayId>,
    {
        arrays
            .into_iter()
            .filter_map(|id| match self.is_up_to_date(id, Location::Device(device)) {
                Ok(true) => self.size_of(id).ok(),
                _ => None,
            })
            .sum()
    }

    /// Number of arrays and views not yet freed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.arrays
            .iter()
            .filter(|(id, _)| matches!(self.check_live(**id), Ok(())))
            .count()
    }

    fn record(&self, id: ArrayId) -> Result<&ArrayRecord> {
        self.arrays.get(&id).ok_or(KernelFlowError::UnknownArray(id))
    }

    fn refresh(&mut self, id: ArrayId) -> Result<()> {
        let root = self.root_of(id)?;
        if root == id {
            return Ok(());
        }
        let (generation, locations) = {
            let root_record = self.record(root)?;
            (root_record.generation, root_record.locations.clone())
        };
        if let Some(view) = self.arrays.get_mut(&id) {
            if view.generation != generation {
                trace!(view = %id, root = %root, "Refreshed view locations");
                view.locations = locations;
                view.generation = generation;
            }
        }
        Ok(())
    }

    fn update_root<F>(&mut self, id: ArrayId, update: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeSet<Location>),
    {
        let root = self.root_of(id)?;
        let record = self
            .arrays
            .get_mut(&root)
            .ok_or(KernelFlowError::UnknownArray(root))?;
        let before = record.locations.clone();
        update(&mut record.locations);
        if record.locations != before {
            record.generation += 1;
        }
        trace!(array = %id, locations = ?record.locations, "Updated array locations");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ArrayId = ArrayId(1);
    const GPU0: Location = Location::Device(DeviceId(0));
    const GPU1: Location = Location::Device(DeviceId(1));

    fn tracker() -> ArrayLocationTracker {
        let mut t = ArrayLocationTracker::new();
        t.register_array(A, 64);
        t
    }

    #[test]
    fn test_new_array_is_on_host() {
        let mut t = tracker();
        assert_eq!(t.locations(A).unwrap(), BTreeSet::from([Location::Host]));
    }

    #[test]
    fn test_write_resets_to_writer() {
        let mut t = tracker();
        t.mark_synchronized(A, GPU0).unwrap();
        t.mark_writer(A, GPU1, false).unwrap();
        assert!(t.is_up_to_date(A, GPU1).unwrap());
        assert!(!t.is_up_to_date(A, GPU0).unwrap());
        assert!(!t.is_up_to_date(A, Location::Host).unwrap());
    }

    #[test]
    fn test_relaxed_write_adds() {
        let mut t = tracker();
        t.mark_writer(A, GPU0, false).unwrap();
        t.mark_writer(A, Location::Host, true).unwrap();
        assert_eq!(
            t.locations(A).unwrap(),
            BTreeSet::from([Location::Host, GPU0])
        );
    }

    #[test]
    fn test_reader_never_mutates() {
        let mut t = tracker();
        assert!(t.mark_reader(A, GPU0).unwrap());
        assert!(t.mark_reader(A, GPU0).unwrap());
        assert!(!t.mark_reader(A, Location::Host).unwrap());
        assert_eq!(t.locations(A).unwrap(), BTreeSet::from([Location::Host]));

        t.mark_synchronized(A, GPU0).unwrap();
        assert!(!t.mark_reader(A, GPU0).unwrap());
    }

    #[test]
    fn test_invalidate_all_except() {
        let mut t = tracker();
        t.mark_synchronized(A, GPU0).unwrap();
        t.mark_synchronized(A, GPU1).unwrap();
        t.invalidate_all_except(A, GPU1).unwrap();
        assert_eq!(t.locations(A).unwrap(), BTreeSet::from([GPU1]));
    }

    #[test]
    fn test_view_refreshes_lazily() {
        let mut t = tracker();
        let view = ArrayId(2);
        t.register_view(view, A, 16, 32).unwrap();
        assert_eq!(t.root_of(view).unwrap(), A);
        assert_eq!(t.offset_of(view).unwrap(), 16);

        t.mark_writer(A, GPU0, false).unwrap();
        assert_eq!(t.locations(view).unwrap(), BTreeSet::from([GPU0]));

        // A write through the view updates the shared root.
        t.mark_writer(view, GPU1, false).unwrap();
        assert_eq!(t.locations(A).unwrap(), BTreeSet::from([GPU1]));
    }

    #[test]
    fn test_view_bounds() {
        let mut t = tracker();
        let err = t.register_view(ArrayId(2), A, 60, 8).unwrap_err();
        assert!(matches!(err, KernelFlowError::OutOfBounds { requested: 68, size: 64, .. }));
    }

    #[test]
    fn test_free_twice_and_stale_access() {
        let mut t = tracker();
        let view = ArrayId(2);
        t.register_view(view, A, 0, 8).unwrap();
        t.free(A).unwrap();

        assert!(matches!(t.free(A), Err(KernelFlowError::ArrayAlreadyFreed(id)) if id == A));
        assert!(matches!(t.is_up_to_date(A, GPU0), Err(KernelFlowError::ArrayFreed(_))));
        assert!(matches!(t.check_live(view), Err(KernelFlowError::ArrayFreed(id)) if id == view));
        assert!(matches!(t.free(view), Err(KernelFlowError::ArrayAlreadyFreed(id)) if id == view));
        assert!(!t.is_live(A).unwrap());
        assert_eq!(t.live_count(), 0);
    }

    #[test]
    fn test_unknown_array() {
        let mut t = tracker();
        assert!(matches!(
            t.is_up_to_date(ArrayId(99), Location::Host),
            Err(KernelFlowError::UnknownArray(_))
        ));
    }

    #[test]
    fn test_resident_bytes() {
        let mut t = tracker();
        t.register_array(ArrayId(3), 128);
        t.mark_writer(ArrayId(3), GPU1, false).unwrap();
        assert_eq!(t.resident_bytes([A, ArrayId(3)], DeviceId(1)), 128);
        assert_eq!(t.resident_bytes([A, ArrayId(3)], DeviceId(0)), 0);
    }
}
