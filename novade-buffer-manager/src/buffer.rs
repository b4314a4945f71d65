//! Manages buffer objects and their kernel handles.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::unistd::{lseek, Whence};

use crate::error::{BufferError, Result};
use crate::video::VideoBufferInfo;

/// A kernel buffer handle (GEM handle) local to one open display device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GemHandle(pub u32);

/// Result of a dumb-buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    pub handle: GemHandle,
    /// Bytes per line chosen by the driver.
    pub pitch: u32,
    /// Total bytes backing the allocation.
    pub size: u64,
}

/// The buffer-import capability of a display device.
///
/// This is the narrow surface buffer pools get instead of the whole display
/// device: turn dma-bufs into handles and back, allocate linear memory, and
/// release handles.
pub trait GemDevice: Send + Sync {
    /// Imports a dma-buf. Importing the same dma-buf twice returns the same handle.
    fn import_dma_buf(&self, fd: BorrowedFd<'_>) -> io::Result<GemHandle>;

    fn export_dma_buf(&self, handle: GemHandle) -> io::Result<OwnedFd>;

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation>;

    /// Drops the handle. Memory is freed once no other reference (dma-buf fd,
    /// framebuffer, other process) remains.
    fn close_handle(&self, handle: GemHandle) -> io::Result<()>;
}

/// Represents a unique identifier for a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    fn new_unique() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        BufferId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where the memory behind a buffer object came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Externally owned memory imported from a dma-buf.
    Imported,
    /// Device-native memory allocated by this manager.
    Allocated { pitch: u32 },
}

/// A reference on kernel-level buffer memory.
///
/// Dropping the object releases the reference; the manager closes the kernel
/// handle when the last object for it is gone. Callers share objects through
/// `Arc` and must keep one alive for as long as a framebuffer is built on it.
pub struct BufferObject {
    id: BufferId,
    handle: GemHandle,
    size: u64,
    origin: BufferOrigin,
    manager: Arc<BufferManager>,
}

impl BufferObject {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn handle(&self) -> GemHandle {
        self.handle
    }

    /// Bytes of memory the object refers to.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    pub fn manager(&self) -> &Arc<BufferManager> {
        &self.manager
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("origin", &self.origin)
            .finish()
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        self.manager.release(self.handle);
    }
}

/// Hands out buffer objects for one display device and counts references per
/// kernel handle.
pub struct BufferManager {
    device: Arc<dyn GemDevice>,
    handles: Mutex<HashMap<GemHandle, usize>>,
}

impl BufferManager {
    pub fn new(device: Arc<dyn GemDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// The handle table lock is held across every ioctl that creates or closes
    /// a handle, so a close can never race an import that received the same handle.
    fn lock_handles(&self) -> MutexGuard<'_, HashMap<GemHandle, usize>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wraps externally-owned memory shared through `fd` without copying it.
    ///
    /// # Errors
    /// `InvalidDescriptor` if `fd` cannot be sized, `SizeMismatch` if it holds
    /// fewer than `size` bytes, `Import` if the kernel rejects it.
    pub fn import_from_fd(self: &Arc<Self>, fd: BorrowedFd<'_>, size: u64) -> Result<Arc<BufferObject>> {
        let actual = dma_buf_len(fd).map_err(BufferError::InvalidDescriptor)?;
        if actual < size {
            return Err(BufferError::SizeMismatch { expected: size, actual });
        }

        let mut handles = self.lock_handles();
        let handle = self.device.import_dma_buf(fd).map_err(BufferError::Import)?;
        let refs = handles.entry(handle).or_insert(0);
        *refs += 1;
        tracing::trace!(handle = handle.0, refs = *refs, size = actual, "imported dma-buf");

        Ok(Arc::new(BufferObject {
            id: BufferId::new_unique(),
            handle,
            size: actual,
            origin: BufferOrigin::Imported,
            manager: Arc::clone(self),
        }))
    }

    /// Allocates device-native memory large enough for a frame described by `info`.
    ///
    /// The allocation is a linear 32-bpp dumb buffer whose rows cover the first
    /// plane's stride.
    pub fn create_from_video_buffer_info(self: &Arc<Self>, info: &VideoBufferInfo) -> Result<Arc<BufferObject>> {
        let stride = info.strides[0];
        if stride == 0 || info.size == 0 {
            return Err(BufferError::InvalidGeometry {
                width: info.width,
                height: info.height,
            });
        }
        let width = stride.div_ceil(4);
        let row = u64::from(width) * 4;
        let height = u32::try_from(info.size.div_ceil(row)).map_err(|_| BufferError::InvalidGeometry {
            width: info.width,
            height: info.height,
        })?;
        self.allocate_dumb(width, height, 32, info.size)
    }

    /// Allocates a `width`x`height` dumb buffer at `bpp` bits per pixel that
    /// must hold at least `min_size` bytes.
    pub fn allocate_dumb(self: &Arc<Self>, width: u32, height: u32, bpp: u32, min_size: u64) -> Result<Arc<BufferObject>> {
        let mut handles = self.lock_handles();
        let allocation = self
            .device
            .create_dumb(width, height, bpp)
            .map_err(|source| BufferError::Alloc { size: min_size, source })?;

        if allocation.size < min_size {
            if let Err(e) = self.device.close_handle(allocation.handle) {
                tracing::warn!("Failed to close short allocation {}: {}", allocation.handle.0, e);
            }
            return Err(BufferError::ShortAllocation {
                expected: min_size,
                actual: allocation.size,
            });
        }

        *handles.entry(allocation.handle).or_insert(0) += 1;
        tracing::debug!(
            handle = allocation.handle.0,
            pitch = allocation.pitch,
            size = allocation.size,
            "allocated dumb buffer {}x{}@{}",
            width,
            height,
            bpp
        );

        Ok(Arc::new(BufferObject {
            id: BufferId::new_unique(),
            handle: allocation.handle,
            size: allocation.size,
            origin: BufferOrigin::Allocated { pitch: allocation.pitch },
            manager: Arc::clone(self),
        }))
    }

    /// Exports the memory behind `bo` as a new dma-buf descriptor.
    pub fn export_dma_buf(&self, bo: &BufferObject) -> Result<OwnedFd> {
        self.device.export_dma_buf(bo.handle).map_err(BufferError::Export)
    }

    /// Number of kernel handles currently held open.
    pub fn live_handles(&self) -> usize {
        self.lock_handles().len()
    }

    /// Number of buffer objects sharing `handle`.
    pub fn handle_refs(&self, handle: GemHandle) -> usize {
        self.lock_handles().get(&handle).copied().unwrap_or(0)
    }

    fn release(&self, handle: GemHandle) {
        let mut handles = self.lock_handles();
        let Some(refs) = handles.get_mut(&handle) else {
            tracing::warn!("Released unknown buffer handle {}", handle.0);
            return;
        };
        *refs -= 1;
        if *refs > 0 {
            return;
        }
        handles.remove(&handle);
        if let Err(e) = self.device.close_handle(handle) {
            tracing::warn!("Failed to close buffer handle {}: {}", handle.0, e);
        } else {
            tracing::trace!(handle = handle.0, "closed buffer handle");
        }
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("live_handles", &self.live_handles())
            .finish_non_exhaustive()
    }
}

/// Size of the memory behind a dma-buf, found by seeking to its end.
fn dma_buf_len(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let raw = fd.as_raw_fd();
    let end = lseek(raw, 0, Whence::SeekEnd)?;
    lseek(raw, 0, Whence::SeekSet)?;
    u64::try_from(end).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
}
