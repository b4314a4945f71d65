// Error types for the display session, using `thiserror`.

use std::io;
use std::path::PathBuf;

use novade_buffer_manager::BufferError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::device::{ConnectorId, CrtcId, Rect};

/// Top-level error of every public display operation.
#[derive(Error, Debug)]
pub enum DisplayError {
    /// Device open or topology resolution failed. Fatal to the session.
    #[error("display initialization failed: {0}")]
    Init(#[from] InitError),

    /// The frame's memory could not be imported. Drop this frame.
    #[error("buffer import failed: {0}")]
    Import(#[source] BufferError),

    /// Device-native memory could not be allocated.
    #[error("buffer allocation failed: {0}")]
    Alloc(#[source] BufferError),

    /// The display engine rejected the framebuffer layout. Drop this frame.
    #[error("display engine rejected {width}x{height} framebuffer ({fourcc:#010x}): {source}")]
    Framebuffer {
        width: u32,
        height: u32,
        fourcc: u32,
        #[source]
        source: io::Error,
    },

    /// Mode-set, page flip or plane update failed. Surfaced as a dropped frame.
    #[error("presentation failed: {0}")]
    Present(#[from] PresentError),

    #[error("render_buffer called before render_init")]
    NotInitialized,

    #[error("display already initialized; recreate the session to change topology")]
    AlreadyInitialized,

    #[error("buffer is currently scanned out and cannot be released")]
    BufferOnScreen,

    #[error("the process-wide display session already exists")]
    SessionExists,

    #[error("no display device is open")]
    NoDevice,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("logging initialization failed: {0}")]
    Logging(String),
}

/// Failures while opening the device or resolving the output topology.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("no usable DRM device found (tried {tried:?})")]
    NoDeviceFound { tried: Vec<PathBuf> },

    #[error("failed to query display resources: {0}")]
    Resources(#[source] io::Error),

    #[error("no connected connector matches {0:?}")]
    NoConnector(Option<ConnectorId>),

    #[error("connector {0:?} reports no display modes")]
    NoMode(ConnectorId),

    #[error("no CRTC matches {0:?}")]
    NoCrtc(Option<CrtcId>),

    #[error("no overlay plane on CRTC {crtc:?} supports format {fourcc:#010x}")]
    NoPlane { crtc: CrtcId, fourcc: u32 },

    #[error("compose rectangle {rect:?} is empty or exceeds {width}x{height}")]
    InvalidCompose { rect: Rect, width: u32, height: u32 },

    #[error("pixel format {0:#010x} has no display-engine equivalent")]
    UnsupportedFormat(u32),

    #[error("session was created without preview; local display is disabled")]
    PreviewDisabled,
}

/// Failures of a single presentation attempt.
#[derive(Error, Debug)]
pub enum PresentError {
    #[error("mode-set failed: {0}")]
    Modeset(#[source] io::Error),

    /// `busy` is set when a previous flip is still pending; the frame should be
    /// dropped and the next one presented normally.
    #[error("page flip failed (busy: {busy}): {source}")]
    Flip {
        busy: bool,
        #[source]
        source: io::Error,
    },

    /// The flip was queued but its completion event never arrived. The new
    /// framebuffer may be scanned out at any moment.
    #[error("page flip queued but not confirmed: {0}")]
    FlipUnconfirmed(#[source] io::Error),

    #[error("plane update failed: {0}")]
    Plane(#[source] io::Error),

    #[error("overlay mode requested but no overlay plane was resolved")]
    NoPlane,

    #[error("invalid plane geometry {0:?}")]
    InvalidGeometry(Rect),
}

impl PresentError {
    /// True when the failure only means "try again with the next frame".
    pub fn is_busy(&self) -> bool {
        matches!(self, PresentError::Flip { busy: true, .. } | PresentError::FlipUnconfirmed(_))
    }

    /// True when the frame was handed to the controller despite the error.
    pub fn is_flip_queued(&self) -> bool {
        matches!(self, PresentError::FlipUnconfirmed(_))
    }
}

impl DisplayError {
    /// True for per-frame failures a caller may recover from by moving on to
    /// the next frame.
    pub fn is_frame_drop(&self) -> bool {
        matches!(
            self,
            DisplayError::Import(_) | DisplayError::Alloc(_) | DisplayError::Framebuffer { .. } | DisplayError::Present(_)
        )
    }
}

pub type Result<T, E = DisplayError> = std::result::Result<T, E>;
