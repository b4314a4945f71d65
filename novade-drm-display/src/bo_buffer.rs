//! Display-capable buffers for buffer-pool collaborators.
//!
//! Pools get a [`BoImporter`] rather than the session: it can wrap pipeline
//! frames as buffer objects and allocate fresh device memory, nothing else.

use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use novade_buffer_manager::{BufferError, BufferManager, BufferObject, VideoBuffer, VideoBufferInfo};
use tracing::debug;

use crate::error::{DisplayError, Result};

/// A pipeline frame re-wrapped over a buffer object.
///
/// The wrapper keeps its source frame alive, and the buffer object keeps the
/// kernel handle alive, so neither side can free memory the other still uses.
pub struct DrmBoBuffer {
    parent: Arc<dyn VideoBuffer>,
    bo: Arc<BufferObject>,
    info: VideoBufferInfo,
    timestamp: Option<Duration>,
}

impl DrmBoBuffer {
    pub fn parent(&self) -> &Arc<dyn VideoBuffer> {
        &self.parent
    }

    pub fn bo(&self) -> &Arc<BufferObject> {
        &self.bo
    }
}

impl fmt::Debug for DrmBoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmBoBuffer")
            .field("bo", &self.bo)
            .field("info", &self.info)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl VideoBuffer for DrmBoBuffer {
    fn info(&self) -> &VideoBufferInfo {
        &self.info
    }

    fn dma_fd(&self) -> Option<BorrowedFd<'_>> {
        self.parent.dma_fd()
    }

    fn buffer_object(&self) -> Option<&Arc<BufferObject>> {
        Some(&self.bo)
    }

    fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }
}

/// Format of a capture queue a producer wants buffers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    /// Capture fourcc.
    pub pixel_format: u32,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufType {
    Capture,
    CaptureMplane,
    Output,
    OutputMplane,
}

/// Placement of one memory plane inside a [`DmaBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneDesc {
    pub offset: u32,
    pub length: u32,
    pub bytes_per_line: u32,
}

/// A freshly allocated, exported buffer for a producer queue.
#[derive(Debug)]
pub struct DmaBuffer {
    pub index: u32,
    pub buf_type: BufType,
    pub fd: OwnedFd,
    /// Usable bytes.
    pub length: u64,
    pub bo: Arc<BufferObject>,
}

/// Splits a `length`-byte buffer into `planes` with a full-size first plane
/// and equal shares for the rest.
fn layout_planes(format: &CaptureFormat, length: u64, planes: &mut [PlaneDesc]) {
    let length = u32::try_from(length).unwrap_or(u32::MAX);
    match planes {
        [] => {}
        [only] => {
            *only = PlaneDesc {
                offset: 0,
                length,
                bytes_per_line: format.bytes_per_line,
            };
        }
        [luma, chroma @ ..] => {
            let luma_len = format.bytes_per_line.saturating_mul(format.height).min(length);
            *luma = PlaneDesc {
                offset: 0,
                length: luma_len,
                bytes_per_line: format.bytes_per_line,
            };
            let count = chroma.len() as u32;
            let share = (length - luma_len) / count;
            let chroma_stride = if count == 1 {
                format.bytes_per_line
            } else {
                format.bytes_per_line / 2
            };
            for (i, plane) in chroma.iter_mut().enumerate() {
                *plane = PlaneDesc {
                    offset: luma_len + share * i as u32,
                    length: share,
                    bytes_per_line: chroma_stride,
                };
            }
        }
    }
}

/// The buffer-import capability handed to buffer pools.
#[derive(Clone)]
pub struct BoImporter {
    manager: Arc<BufferManager>,
}

impl BoImporter {
    pub fn new(manager: Arc<BufferManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<BufferManager> {
        &self.manager
    }

    /// Wraps `buffer` as a display-capable buffer sharing its memory.
    ///
    /// A frame that already carries a buffer object of this device shares it;
    /// any other frame has its dma-buf imported.
    pub fn convert(&self, buffer: &Arc<dyn VideoBuffer>) -> Result<Arc<DrmBoBuffer>> {
        let info = *buffer.info();
        let bo = match buffer.buffer_object() {
            Some(bo) if Arc::ptr_eq(bo.manager(), &self.manager) => Arc::clone(bo),
            _ => {
                let fd = buffer.dma_fd().ok_or_else(|| {
                    DisplayError::Import(BufferError::InvalidDescriptor(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "buffer has no exportable descriptor",
                    )))
                })?;
                self.manager.import_from_fd(fd, info.size).map_err(DisplayError::Import)?
            }
        };
        debug!(handle = bo.handle().0, "wrapped buffer as buffer object");

        Ok(Arc::new(DrmBoBuffer {
            parent: Arc::clone(buffer),
            bo,
            info,
            timestamp: buffer.timestamp(),
        }))
    }

    /// Allocates an exported 32-bpp dumb buffer big enough for a frame of
    /// `format` and fills `planes` with its layout.
    pub fn allocate(
        &self,
        format: &CaptureFormat,
        index: u32,
        buf_type: BufType,
        planes: &mut [PlaneDesc],
    ) -> Result<DmaBuffer> {
        let width = format.bytes_per_line / 4;
        let height = format.height.saturating_mul(2);
        if width == 0 || height == 0 {
            return Err(DisplayError::Alloc(BufferError::InvalidGeometry {
                width: format.width,
                height: format.height,
            }));
        }

        let bo = self
            .manager
            .allocate_dumb(width, height, 32, u64::from(format.size_image))
            .map_err(DisplayError::Alloc)?;
        let fd = self.manager.export_dma_buf(&bo).map_err(DisplayError::Alloc)?;
        let length = u64::from(format.size_image).max(bo.size());
        layout_planes(format, length, planes);
        debug!(index, handle = bo.handle().0, length, "allocated capture buffer");

        Ok(DmaBuffer {
            index,
            buf_type,
            fd,
            length,
            bo,
        })
    }
}

impl fmt::Debug for BoImporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoImporter").field("manager", &self.manager).finish()
    }
}
