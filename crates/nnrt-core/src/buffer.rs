use std::fmt;
use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;
use tracing::trace;

use crate::{NnrtError, NnrtResult};

/// Counts shared-buffer allocations and releases for one allocator.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.allocated().saturating_sub(self.released())
    }

    fn record_allocation(&self) {
        self.allocated.fetch_add(1, Ordering::SeqCst);
    }

    fn record_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// A file-descriptor backed, memory-mapped region.
///
/// The descriptor and the mapping are owned together and released
/// together when the buffer is dropped, so a buffer is released exactly
/// once whichever path drops it.
pub struct SharedBuffer {
    map: MmapMut,
    file: File,
    len: usize,
    tracker: Option<Arc<AllocationTracker>>,
}

impl SharedBuffer {
    pub fn allocate(len: usize) -> NnrtResult<Self> {
        if len == 0 {
            return Err(NnrtError::invalid_argument(
                "shared buffer length must be non-zero",
            ));
        }
        let file = tempfile::tempfile()
            .map_err(|err| NnrtError::memory(format!("failed to create shared memory: {err}")))?;
        file.set_len(len as u64)
            .map_err(|err| NnrtError::memory(format!("failed to size shared memory: {err}")))?;
        // SAFETY: the file is private to this buffer (unlinked temp file)
        // and lives as long as the mapping.
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|err| NnrtError::memory(format!("failed to map shared memory: {err}")))?;
        trace!(len, "shared buffer mapped");
        Ok(Self {
            map,
            file,
            len,
            tracker: None,
        })
    }

    /// Allocates and counts the buffer against `tracker` until dropped.
    pub fn allocate_tracked(len: usize, tracker: Arc<AllocationTracker>) -> NnrtResult<Self> {
        let mut buffer = Self::allocate(len)?;
        tracker.record_allocation();
        buffer.tracker = Some(tracker);
        Ok(buffer)
    }

    pub fn from_bytes(bytes: &[u8]) -> NnrtResult<Self> {
        let mut buffer = Self::allocate(bytes.len())?;
        buffer.as_mut_slice().copy_from_slice(bytes);
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..]
    }

    pub fn flush(&self) -> NnrtResult<()> {
        self.map
            .flush()
            .map_err(|err| NnrtError::memory(format!("failed to flush shared memory: {err}")))
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    #[cfg(unix)]
    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.file.as_raw_fd()
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            tracker.record_release();
        }
        trace!(len = self.len, "shared buffer released");
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len)
            .field("tracked", &self.tracker.is_some())
            .finish()
    }
}
