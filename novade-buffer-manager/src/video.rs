//! The video-buffer boundary: frame layout descriptors and the trait through
//! which pipeline buffers are handed to the display side.

use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::BufferObject;
use crate::error::{BufferError, Result};

/// Maximum number of memory planes a frame can have.
pub const MAX_PLANES: usize = 4;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// Capture-side pixel formats with a known memory layout.
///
/// The codes are the V4L2 fourccs produced by the capture pipeline; the
/// display side translates them to display-engine codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Y plane followed by an interleaved CbCr plane, 4:2:0.
    Nv12,
    /// Y plane followed by an interleaved CbCr plane, 4:2:2.
    Nv16,
    /// Three planes Y, Cb, Cr, 4:2:0.
    Yuv420,
    /// Packed Y0 Cb Y1 Cr.
    Yuyv,
    /// Packed Cb Y0 Cr Y1.
    Uyvy,
    /// 16-bit RGB 5:6:5.
    Rgb565,
    /// 24-bit R, G, B byte order.
    Rgb24,
    /// 32-bit B, G, R, X byte order.
    Bgr32,
    /// 32-bit B, G, R, X byte order (new-style code).
    Xbgr32,
    /// 32-bit B, G, R, A byte order.
    Abgr32,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 10] = [
        PixelFormat::Nv12,
        PixelFormat::Nv16,
        PixelFormat::Yuv420,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Rgb565,
        PixelFormat::Rgb24,
        PixelFormat::Bgr32,
        PixelFormat::Xbgr32,
        PixelFormat::Abgr32,
    ];

    /// The V4L2 fourcc of this format.
    pub const fn fourcc(self) -> u32 {
        match self {
            PixelFormat::Nv12 => fourcc(b"NV12"),
            PixelFormat::Nv16 => fourcc(b"NV16"),
            PixelFormat::Yuv420 => fourcc(b"YU12"),
            PixelFormat::Yuyv => fourcc(b"YUYV"),
            PixelFormat::Uyvy => fourcc(b"UYVY"),
            PixelFormat::Rgb565 => fourcc(b"RGBP"),
            PixelFormat::Rgb24 => fourcc(b"RGB3"),
            PixelFormat::Bgr32 => fourcc(b"BGR4"),
            PixelFormat::Xbgr32 => fourcc(b"XR24"),
            PixelFormat::Abgr32 => fourcc(b"AR24"),
        }
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.fourcc() == code)
    }

    /// Number of memory planes the format occupies.
    pub const fn planes(self) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv16 => 2,
            PixelFormat::Yuv420 => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.fourcc().to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

fn align_up(value: u32, alignment: u32) -> Option<u32> {
    value.checked_add(alignment - 1).map(|v| v / alignment * alignment)
}

/// Memory layout of one frame.
///
/// Strides and offsets are in bytes and indexed by plane; entries past
/// `planes` are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoBufferInfo {
    /// V4L2 fourcc of the frame.
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub aligned_width: u32,
    pub aligned_height: u32,
    pub planes: usize,
    pub strides: [u32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
    /// Total bytes covered by all planes.
    pub size: u64,
}

impl VideoBufferInfo {
    /// Computes the default layout for `format` at `width`x`height`.
    ///
    /// Widths are aligned to 16 pixels and heights to 2 lines so chroma planes
    /// of subsampled formats start on whole rows.
    pub fn new(format: u32, width: u32, height: u32) -> Result<Self> {
        let pixel_format = PixelFormat::from_fourcc(format).ok_or(BufferError::UnsupportedFormat(format))?;
        let geometry = BufferError::InvalidGeometry { width, height };
        if width == 0 || height == 0 {
            return Err(geometry);
        }
        let (Some(aligned_width), Some(aligned_height)) = (align_up(width, 16), align_up(height, 2)) else {
            return Err(geometry);
        };

        let aw = u64::from(aligned_width);
        let ah = u64::from(aligned_height);
        let luma = aw * ah;
        let (strides, offsets, size): ([u64; MAX_PLANES], [u64; MAX_PLANES], u64) = match pixel_format {
            PixelFormat::Nv12 => ([aw, aw, 0, 0], [0, luma, 0, 0], luma + luma / 2),
            PixelFormat::Nv16 => ([aw, aw, 0, 0], [0, luma, 0, 0], luma * 2),
            PixelFormat::Yuv420 => {
                let chroma = (aw / 2) * (ah / 2);
                ([aw, aw / 2, aw / 2, 0], [0, luma, luma + chroma, 0], luma + chroma * 2)
            }
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Rgb565 => ([aw * 2, 0, 0, 0], [0; 4], luma * 2),
            PixelFormat::Rgb24 => ([aw * 3, 0, 0, 0], [0; 4], luma * 3),
            PixelFormat::Bgr32 | PixelFormat::Xbgr32 | PixelFormat::Abgr32 => ([aw * 4, 0, 0, 0], [0; 4], luma * 4),
        };

        let narrow = |values: [u64; MAX_PLANES]| -> Option<[u32; MAX_PLANES]> {
            let mut out = [0u32; MAX_PLANES];
            for (slot, value) in out.iter_mut().zip(values) {
                *slot = u32::try_from(value).ok()?;
            }
            Some(out)
        };
        let (Some(strides), Some(offsets)) = (narrow(strides), narrow(offsets)) else {
            return Err(BufferError::InvalidGeometry { width, height });
        };

        Ok(Self {
            format,
            width,
            height,
            aligned_width,
            aligned_height,
            planes: pixel_format.planes(),
            strides,
            offsets,
            size,
        })
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(self.format)
    }

    /// Byte length of `plane`, derived from the offset of the next plane or the total size.
    pub fn plane_len(&self, plane: usize) -> u64 {
        if plane >= self.planes {
            return 0;
        }
        let start = u64::from(self.offsets[plane]);
        let end = if plane + 1 < self.planes {
            u64::from(self.offsets[plane + 1])
        } else {
            self.size
        };
        end.saturating_sub(start)
    }
}

/// A frame produced by the video pipeline.
///
/// The display side never owns or copies the pixel data. It imports the
/// backing memory by reference, either through an exported dma-buf
/// descriptor or through a buffer object the frame already carries.
/// Buffer identity is the identity of the `Arc` holding the frame.
pub trait VideoBuffer: Send + Sync + fmt::Debug {
    fn info(&self) -> &VideoBufferInfo;

    /// Exportable dma-buf descriptor backing the frame, if any.
    fn dma_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Buffer object already wrapping the frame's memory, if any.
    fn buffer_object(&self) -> Option<&Arc<BufferObject>> {
        None
    }

    fn timestamp(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(PixelFormat::Nv12, b"NV12")]
    #[case(PixelFormat::Yuv420, b"YU12")]
    #[case(PixelFormat::Rgb565, b"RGBP")]
    #[case(PixelFormat::Xbgr32, b"XR24")]
    fn test_fourcc_codes(#[case] format: PixelFormat, #[case] code: &[u8; 4]) {
        assert_eq!(format.fourcc(), u32::from_le_bytes(*code));
        assert_eq!(PixelFormat::from_fourcc(u32::from_le_bytes(*code)), Some(format));
    }

    #[test]
    fn test_unknown_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(u32::from_le_bytes(*b"MJPG")), None);
        let err = VideoBufferInfo::new(u32::from_le_bytes(*b"MJPG"), 64, 64).unwrap_err();
        assert!(matches!(err, BufferError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_nv12_layout_1080p() {
        let info = VideoBufferInfo::new(PixelFormat::Nv12.fourcc(), 1920, 1080).unwrap();
        assert_eq!(info.aligned_width, 1920);
        assert_eq!(info.aligned_height, 1080);
        assert_eq!(info.planes, 2);
        assert_eq!(info.strides, [1920, 1920, 0, 0]);
        assert_eq!(info.offsets, [0, 1920 * 1080, 0, 0]);
        assert_eq!(info.size, 1920 * 1080 * 3 / 2);
        assert_eq!(info.plane_len(0), 1920 * 1080);
        assert_eq!(info.plane_len(1), 1920 * 1080 / 2);
        assert_eq!(info.plane_len(2), 0);
    }

    #[test]
    fn test_width_alignment() {
        let info = VideoBufferInfo::new(PixelFormat::Yuyv.fourcc(), 641, 481).unwrap();
        assert_eq!(info.aligned_width, 656);
        assert_eq!(info.aligned_height, 482);
        assert_eq!(info.strides[0], 656 * 2);
        assert_eq!(info.size, 656 * 482 * 2);
    }

    #[test]
    fn test_yuv420_three_planes() {
        let info = VideoBufferInfo::new(PixelFormat::Yuv420.fourcc(), 64, 32).unwrap();
        assert_eq!(info.planes, 3);
        assert_eq!(info.strides, [64, 32, 32, 0]);
        assert_eq!(info.offsets, [0, 2048, 2048 + 512, 0]);
        assert_eq!(info.size, 2048 + 1024);
    }

    #[test]
    fn test_zero_geometry_rejected() {
        let err = VideoBufferInfo::new(PixelFormat::Nv12.fourcc(), 0, 480).unwrap_err();
        assert!(matches!(err, BufferError::InvalidGeometry { width: 0, height: 480 }));
    }

    #[test]
    fn test_display_is_fourcc_text() {
        assert_eq!(PixelFormat::Nv16.to_string(), "NV16");
    }
}
