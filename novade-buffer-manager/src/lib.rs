//! # Novade Buffer Manager
//!
//! This crate manages the buffer objects that back frames handed to the display
//! engine. It turns externally-owned memory (a dma-buf file descriptor exported
//! by a capture or processing stage) into a kernel buffer handle without copying,
//! and allocates device-native memory when no such buffer exists yet.
//!
//! Buffer objects are reference counted: the same dma-buf imported twice maps to
//! the same kernel handle, and that handle is closed only when the last
//! [`BufferObject`] referring to it is released.
//!
//! The crate also defines the boundary to the video pipeline: the [`VideoBuffer`]
//! trait and the [`VideoBufferInfo`] layout descriptor.

pub mod buffer;
pub mod error;
pub mod video;

// Re-export key types for convenience.
pub use buffer::{BufferId, BufferManager, BufferObject, BufferOrigin, DumbAllocation, GemDevice, GemHandle};
pub use error::{BufferError, Result};
pub use video::{PixelFormat, VideoBuffer, VideoBufferInfo, MAX_PLANES};
