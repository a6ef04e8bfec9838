//! Host-backed allocations.

use std::collections::HashMap;

use kernelflow_core::error::{KernelFlowError, Result};
use kernelflow_core::runtime::MemoryHandle;

/// Allocations of the simulated runtime.
#[derive(Debug, Default)]
pub struct HostMemory {
    allocations: HashMap<MemoryHandle, Vec<u8>>,
    next_handle: u64,
}

impl HostMemory {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `bytes` zeroed bytes.
    pub fn allocate(&mut self, bytes: usize) -> MemoryHandle {
        self.next_handle += 1;
        let handle = MemoryHandle(self.next_handle);
        self.allocations.insert(handle, vec![0; bytes]);
        handle
    }

    /// Release an allocation.
    pub fn free(&mut self, handle: MemoryHandle) -> Result<()> {
        self.allocations
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| unknown(handle))
    }

    /// Whether the handle is live.
    pub fn contains(&self, handle: MemoryHandle) -> bool {
        self.allocations.contains_key(&handle)
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Whether no allocation is live.
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Total bytes allocated.
    pub fn bytes_in_use(&self) -> usize {
        self.allocations.values().map(Vec::len).sum()
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read(&self, handle: MemoryHandle, offset: usize, len: usize) -> Result<Vec<u8>> {
        let data = self.allocations.get(&handle).ok_or_else(|| unknown(handle))?;
        let range = checked_range(data.len(), offset, len)?;
        Ok(data[range].to_vec())
    }

    /// Overwrite bytes starting at `offset`.
    pub fn write(&mut self, handle: MemoryHandle, offset: usize, bytes: &[u8]) -> Result<()> {
        let data = self
            .allocations
            .get_mut(&handle)
            .ok_or_else(|| unknown(handle))?;
        let range = checked_range(data.len(), offset, bytes.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }
}

fn unknown(handle: MemoryHandle) -> KernelFlowError {
    KernelFlowError::backend(format!("unknown allocation {:?}", handle))
}

fn checked_range(size: usize, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(KernelFlowError::backend(format!(
            "access of {} bytes at offset {} exceeds allocation of {} bytes",
            len, offset, size
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let mut memory = HostMemory::new();
        let handle = memory.allocate(8);
        memory.write(handle, 2, &[1, 2, 3]).unwrap();
        assert_eq!(memory.read(handle, 0, 6).unwrap(), vec![0, 0, 1, 2, 3, 0]);
        assert_eq!(memory.bytes_in_use(), 8);
    }

    #[test]
    fn test_out_of_range_access() {
        let mut memory = HostMemory::new();
        let handle = memory.allocate(4);
        assert!(memory.write(handle, 3, &[1, 2]).is_err());
        assert!(memory.read(handle, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_double_free() {
        let mut memory = HostMemory::new();
        let handle = memory.allocate(4);
        memory.free(handle).unwrap();
        assert!(memory.free(handle).is_err());
        assert!(memory.is_empty());
    }
}
