//! # Host Memory
//!
//! A region of host memory shared between the caller and a device queue.
//! Read and write commands capture a [`HostMemory`] at record time and touch
//! its bytes only when the command executes, so the caller must not rely on
//! its contents until the dispatch has completed.

use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::error::{HalError, HalResult};

/// Shared, growable-at-creation host byte region.
#[derive(Clone, Debug, Default)]
pub struct HostMemory {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostMemory {
    /// Creates a zeroed region of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Wraps existing bytes.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copies a slice of plain values into a new region.
    #[must_use]
    pub fn from_slice_of<T: Pod>(values: &[T]) -> Self {
        Self::from_vec(bytemuck::cast_slice(values).to_vec())
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Returns true if the region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out the whole region.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Copies out the region reinterpreted as `T` values.
    ///
    /// Trailing bytes that do not fill a whole `T` are ignored.
    #[must_use]
    pub fn to_vec_of<T: Pod>(&self) -> Vec<T> {
        let size = std::mem::size_of::<T>();
        if size == 0 {
            return Vec::new();
        }
        self.bytes
            .lock()
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    /// Copies `len` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: usize, len: usize) -> HalResult<Vec<u8>> {
        let bytes = self.bytes.lock();
        let range = checked_range(offset, len, bytes.len())?;
        Ok(bytes[range].to_vec())
    }

    /// Copies `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> HalResult<()> {
        let mut bytes = self.bytes.lock();
        let range = checked_range(offset, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Runs `f` with exclusive access to the bytes.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.lock())
    }
}

fn checked_range(offset: usize, len: usize, total: usize) -> HalResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= total)
        .ok_or_else(|| {
            HalError::invalid(format!(
                "host range {offset}..{offset}+{len} exceeds host memory of {total} bytes"
            ))
        })?;
    Ok(offset..end)
}
