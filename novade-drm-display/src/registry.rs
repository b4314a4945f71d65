//! Framebuffer registry: at most one display-engine framebuffer per video buffer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use novade_buffer_manager::{BufferObject, VideoBuffer};

use crate::device::{FramebufferId, KmsDevice};

/// A framebuffer object, removed from the device when dropped.
pub struct Framebuffer {
    id: FramebufferId,
    device: Arc<dyn KmsDevice>,
}

impl Framebuffer {
    /// Takes ownership of framebuffer `id` on `device`.
    pub fn new(id: FramebufferId, device: Arc<dyn KmsDevice>) -> Self {
        Self { id, device }
    }

    pub fn id(&self) -> FramebufferId {
        self.id
    }
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Framebuffer").field(&self.id).finish()
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Err(e) = self.device.remove_framebuffer(self.id) {
            tracing::warn!("Failed to remove framebuffer {}: {}", self.id, e);
        } else {
            tracing::trace!(fb = self.id.0, "removed framebuffer");
        }
    }
}

/// What callers get back for a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbSlot {
    pub fb: FramebufferId,
    /// Small slot number, assigned in insertion order and never reused.
    pub index: usize,
}

struct Entry {
    slot: FbSlot,
    source: Weak<dyn VideoBuffer>,
    // Fields drop in order: the framebuffer goes before the memory behind it.
    framebuffer: Framebuffer,
    _bo: Arc<BufferObject>,
}

/// Buffer identity: the address of the shared frame allocation.
///
/// Each entry holds a `Weak` to its frame, which keeps the allocation (and so
/// the address) from being reused while the entry exists.
fn identity(buffer: &Arc<dyn VideoBuffer>) -> usize {
    Arc::as_ptr(buffer) as *const () as usize
}

/// Framebuffers keyed by the identity of the frame they were built for.
#[derive(Default)]
pub struct FramebufferRegistry {
    entries: HashMap<usize, Entry>,
    next_index: usize,
}

impl FramebufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot registered for `buffer`, if any.
    pub fn lookup(&self, buffer: &Arc<dyn VideoBuffer>) -> Option<FbSlot> {
        self.entries.get(&identity(buffer)).map(|entry| entry.slot)
    }

    /// Whether `buffer` has a framebuffer.
    pub fn contains(&self, buffer: &Arc<dyn VideoBuffer>) -> bool {
        self.entries.contains_key(&identity(buffer))
    }

    /// Returns the existing slot for `buffer`, or registers the framebuffer
    /// `create` builds. Nothing is inserted when `create` fails.
    pub fn insert_if_absent<F, E>(&mut self, buffer: &Arc<dyn VideoBuffer>, create: F) -> Result<FbSlot, E>
    where
        F: FnOnce() -> Result<(Framebuffer, Arc<BufferObject>), E>,
    {
        let key = identity(buffer);
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.slot);
        }

        let (framebuffer, bo) = create()?;
        let slot = FbSlot {
            fb: framebuffer.id(),
            index: self.next_index,
        };
        self.next_index += 1;
        self.entries.insert(
            key,
            Entry {
                slot,
                source: Arc::downgrade(buffer),
                framebuffer,
                _bo: bo,
            },
        );
        tracing::debug!(fb = slot.fb.0, index = slot.index, "registered framebuffer");
        Ok(slot)
    }

    /// Destroys the framebuffer registered for `buffer`.
    ///
    /// # Returns
    ///
    /// The slot it occupied, or `None` if `buffer` was not registered.
    pub fn remove(&mut self, buffer: &Arc<dyn VideoBuffer>) -> Option<FbSlot> {
        self.entries.remove(&identity(buffer)).map(|entry| entry.slot)
    }

    /// Destroys the framebuffers of every buffer the pipeline has released.
    /// Returns how many were dropped.
    pub fn purge_released(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let alive = entry.source.strong_count() > 0;
            if !alive {
                tracing::debug!(fb = entry.framebuffer.id().0, index = entry.slot.index, "purging released buffer");
            }
            alive
        });
        before - self.entries.len()
    }

    /// Number of registered framebuffers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for FramebufferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramebufferRegistry")
            .field("entries", &self.entries.len())
            .field("next_index", &self.next_index)
            .finish()
    }
}
