use std::{alloc::Layout, path::Path};

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::{AtomicBuffer, error::LogBufferError};

enum Backing {
    Heap { layout: Layout },
    Shmem { _shmem: Shmem },
}

/// A zeroed memory region, either process-private or backed by a
/// `shared_memory` flink file. Creation zeroes; opening attaches as-is.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
    backing: Backing,
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn create(path: &Path, len: usize) -> Result<Self, LogBufferError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match ShmemConf::new().size(len).flink(path).create() {
            Ok(shmem) => {
                let ptr = shmem.as_ptr();
                // created mappings are not guaranteed zeroed on every platform
                unsafe { std::ptr::write_bytes(ptr, 0, len) };
                Ok(Self { ptr, len, backing: Backing::Shmem { _shmem: shmem } })
            }
            Err(ShmemError::LinkExists) => {
                tracing::warn!(?path, "stale shmem link found, removing and recreating");
                let _ = std::fs::remove_file(path);
                Self::create(path, len)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn open(path: &Path, expected_min_len: usize) -> Result<Self, LogBufferError> {
        if !path.exists() {
            return Err(LogBufferError::NonExistingFile);
        }
        let shmem = ShmemConf::new().flink(path).open()?;
        if shmem.len() < expected_min_len {
            return Err(LogBufferError::SizeMismatch {
                expected: expected_min_len,
                actual: shmem.len(),
            });
        }
        let ptr = shmem.as_ptr();
        let len = shmem.len();
        Ok(Self { ptr, len, backing: Backing::Shmem { _shmem: shmem } })
    }

    pub fn heap(len: usize) -> Self {
        let layout =
            Layout::array::<u8>(len).unwrap().align_to(64).unwrap().pad_to_align();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "allocation of {len} bytes failed");
        Self { ptr, len, backing: Backing::Heap { layout } }
    }

    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn buffer(&self, offset: usize, len: usize) -> AtomicBuffer {
        assert!(offset + len <= self.len, "region slice out of bounds");
        AtomicBuffer::new(unsafe { self.ptr.add(offset) }, len)
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Backing::Heap { layout } = self.backing {
            unsafe { std::alloc::dealloc(self.ptr, layout) };
        }
        // Shmem drops its mapping itself; the creator also unlinks the file.
    }
}
