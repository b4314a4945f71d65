//! Error types for buffer import and allocation.

use std::io;
use thiserror::Error;

/// Errors raised while importing or allocating buffer objects.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The file descriptor handed in does not describe a usable dma-buf.
    #[error("invalid buffer descriptor: {0}")]
    InvalidDescriptor(#[source] io::Error),

    /// The dma-buf is smaller than the frame it is supposed to hold.
    #[error("dma-buf holds {actual} bytes but {expected} are required")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The kernel refused to turn the dma-buf into a buffer handle.
    #[error("PRIME import failed: {0}")]
    Import(#[source] io::Error),

    /// Device-native allocation failed (exhaustion or unsupported geometry).
    #[error("allocation of {size} bytes failed: {source}")]
    Alloc {
        size: u64,
        #[source]
        source: io::Error,
    },

    /// The device returned less memory than requested.
    #[error("allocation returned {actual} bytes but {expected} are required")]
    ShortAllocation { expected: u64, actual: u64 },

    /// Exporting a buffer handle as a dma-buf failed.
    #[error("dma-buf export failed: {0}")]
    Export(#[source] io::Error),

    /// The pixel format has no known memory layout.
    #[error("unsupported pixel format {0:#010x}")]
    UnsupportedFormat(u32),

    /// Width, height or stride are zero or overflow the layout computation.
    #[error("invalid buffer geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },
}

impl BufferError {
    /// True for failures of device-native allocation, false for import failures.
    pub fn is_alloc(&self) -> bool {
        matches!(
            self,
            BufferError::Alloc { .. } | BufferError::ShortAllocation { .. } | BufferError::Export(_)
        )
    }
}

pub type Result<T, E = BufferError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_alloc_classification() {
        let alloc = BufferError::Alloc {
            size: 4096,
            source: io::Error::from_raw_os_error(12),
        };
        assert!(alloc.is_alloc());
        assert!(alloc.source().is_some());

        let import = BufferError::SizeMismatch { expected: 10, actual: 5 };
        assert!(!import.is_alloc());
        assert_eq!(import.to_string(), "dma-buf holds 5 bytes but 10 are required");
    }

    #[test]
    fn test_unsupported_format_display() {
        let err = BufferError::UnsupportedFormat(0x3231_564e);
        assert_eq!(err.to_string(), "unsupported pixel format 0x3231564e");
    }
}
