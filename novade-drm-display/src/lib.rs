//! Video presentation on a DRM/KMS display controller.
//!
//! A [`DisplaySession`] owns one display device. It resolves the output path
//! (connector, encoder, CRTC, optional overlay plane), turns pipeline frames
//! into framebuffers at most once per frame, and puts them on screen through
//! a mode-set followed by page flips, or through overlay plane updates.
//!
//! The kernel interface sits behind [`KmsDevice`]; [`device::card`] is the
//! implementation for `/dev/dri` nodes.

pub mod bo_buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod fourcc;
pub mod logging;
pub mod present;
pub mod registry;
pub mod session;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use bo_buffer::{BoImporter, BufType, CaptureFormat, DmaBuffer, DrmBoBuffer, PlaneDesc};
pub use config::{DisplayMode, LoggingConfig, SessionConfig};
pub use device::{
    ConnectorId, CrtcId, DeviceOpener, EncoderId, FramebufferId, KmsDevice, ModeInfo, OpenedDevice, PlaneId, Rect,
};
pub use error::{DisplayError, InitError, PresentError, Result};
pub use present::{PresentKind, PresentState};
pub use registry::FbSlot;
pub use session::{create, install, instance, set_preview, DisplaySession, SessionCell, SharedSession};
pub use topology::Topology;

pub use novade_buffer_manager::{BufferManager, BufferObject, PixelFormat, VideoBuffer, VideoBufferInfo};
