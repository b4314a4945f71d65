//! Translation from capture fourccs to display-engine fourccs.

use drm::buffer::DrmFourcc;
use novade_buffer_manager::PixelFormat;

use crate::error::InitError;

/// Maps a capture-side fourcc to the display-engine format with the same memory layout.
///
/// Only the fixed set of [`PixelFormat`]s is known; any other code is an error.
pub fn to_drm_fourcc(code: u32) -> Result<DrmFourcc, InitError> {
    let format = PixelFormat::from_fourcc(code).ok_or(InitError::UnsupportedFormat(code))?;
    Ok(match format {
        PixelFormat::Nv12 => DrmFourcc::Nv12,
        PixelFormat::Nv16 => DrmFourcc::Nv16,
        PixelFormat::Yuv420 => DrmFourcc::Yuv420,
        PixelFormat::Yuyv => DrmFourcc::Yuyv,
        PixelFormat::Uyvy => DrmFourcc::Uyvy,
        PixelFormat::Rgb565 => DrmFourcc::Rgb565,
        // R, G, B in memory is little-endian B8G8R8.
        PixelFormat::Rgb24 => DrmFourcc::Bgr888,
        PixelFormat::Bgr32 | PixelFormat::Xbgr32 => DrmFourcc::Xrgb8888,
        PixelFormat::Abgr32 => DrmFourcc::Argb8888,
    })
}

/// [`to_drm_fourcc`] as the raw code the kernel interface takes.
pub fn to_drm_code(code: u32) -> Result<u32, InitError> {
    to_drm_fourcc(code).map(|fourcc| fourcc as u32)
}
