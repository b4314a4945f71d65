//! The kernel mode-setting boundary.
//!
//! [`KmsDevice`] is the seam between the session logic and the display
//! driver, the same way the compositor backends sit behind a trait. The real
//! implementation in [`card`] talks to a DRM node through the `drm` crate;
//! tests substitute a recording fake.

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

use novade_buffer_manager::{GemDevice, GemHandle, MAX_PLANES};

use crate::config::SessionConfig;
use crate::error::InitError;

pub mod card;

pub use card::CardOpener;

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

object_id!(
    /// A physical display output.
    ConnectorId
);
object_id!(EncoderId);
object_id!(
    /// A scan-out engine.
    CrtcId
);
object_id!(PlaneId);
object_id!(
    /// A display-engine framebuffer object.
    FramebufferId
);

/// An axis-aligned rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self { left, top, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when the rectangle lies inside a `width`x`height` area.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = u64::from(self.left) + u64::from(self.width);
        let bottom = u64::from(self.top) + u64::from(self.height);
        right <= u64::from(width) && bottom <= u64::from(height)
    }
}

/// A display mode line as reported by a connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    pub name: String,
    pub hdisplay: u16,
    pub vdisplay: u16,
    pub vrefresh: u32,
    pub preferred: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceIds {
    pub connectors: Vec<ConnectorId>,
    pub encoders: Vec<EncoderId>,
    /// In kernel enumeration order; the position of a CRTC is its index.
    pub crtcs: Vec<CrtcId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    /// Interface name and number, e.g. "HDMI-A-1".
    pub name: String,
    pub connected: bool,
    pub current_encoder: Option<EncoderId>,
    pub encoders: Vec<EncoderId>,
    pub modes: Vec<ModeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: EncoderId,
    pub crtc: Option<CrtcId>,
    pub possible_crtcs: Vec<CrtcId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: PlaneId,
    pub possible_crtcs: Vec<CrtcId>,
    /// Display-engine fourccs the plane can scan out.
    pub formats: Vec<u32>,
    pub crtc: Option<CrtcId>,
}

/// Layout of a framebuffer to create from buffer handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub width: u32,
    pub height: u32,
    /// Display-engine fourcc.
    pub fourcc: u32,
    pub handles: [Option<GemHandle>; MAX_PLANES],
    pub pitches: [u32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
}

/// Mode-setting operations of an open display device.
///
/// Every call may block on the driver.
pub trait KmsDevice: Send + Sync {
    /// The device's file descriptor, for collaborators that share the device context.
    fn fd(&self) -> BorrowedFd<'_>;

    fn driver_name(&self) -> &str;

    fn resources(&self) -> io::Result<ResourceIds>;

    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo>;

    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo>;

    fn planes(&self) -> io::Result<Vec<PlaneInfo>>;

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<FramebufferId>;

    fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()>;

    /// Binds `fb` to `crtc` and drives `connector` with `mode`, scanning out
    /// from `origin` inside the framebuffer.
    fn set_crtc(
        &self,
        crtc: CrtcId,
        fb: FramebufferId,
        origin: (u32, u32),
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> io::Result<()>;

    /// Schedules `fb` for the next vertical blank and waits for the flip to
    /// complete. A flip that does not complete in time fails with
    /// `ErrorKind::TimedOut`.
    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> io::Result<()>;

    /// Shows the `src` region of `fb` at `dst` on `crtc` through `plane`.
    fn set_plane(&self, plane: PlaneId, crtc: CrtcId, fb: FramebufferId, src: Rect, dst: Rect) -> io::Result<()>;
}

/// An open display device: its mode-setting side and the buffer-import
/// capability handed to buffer pools.
#[derive(Clone)]
pub struct OpenedDevice {
    pub kms: Arc<dyn KmsDevice>,
    pub gem: Arc<dyn GemDevice>,
}

impl OpenedDevice {
    /// Shares one device object as both capabilities.
    pub fn new<D>(device: Arc<D>) -> Self
    where
        D: KmsDevice + GemDevice + 'static,
    {
        Self {
            kms: device.clone(),
            gem: device,
        }
    }
}

impl fmt::Debug for OpenedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedDevice")
            .field("driver", &self.kms.driver_name())
            .finish_non_exhaustive()
    }
}

/// Opens the display device a session runs on.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, config: &SessionConfig) -> Result<OpenedDevice, InitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_bounds() {
        let rect = Rect::new(0, 0, 1920, 1080);
        assert!(!rect.is_empty());
        assert!(rect.fits_within(1920, 1080));
        assert!(!Rect::new(1, 0, 1920, 1080).fits_within(1920, 1080));
        assert!(Rect::new(10, 10, 0, 5).is_empty());
        assert!(!Rect::new(u32::MAX, 0, 2, 1).fits_within(u32::MAX, 1));
    }

    #[test]
    fn test_ids_display_as_numbers() {
        assert_eq!(CrtcId(42).to_string(), "42");
        assert_eq!(ConnectorId(7).to_string(), "7");
    }
}
