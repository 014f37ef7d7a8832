//! Cache entry types and the decode collaborator seam.

use std::io;

use thiserror::Error;

use crate::allocator::PixelBuffer;

/// Load state of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadStatus {
    /// No load has been requested, or the entry was reset.
    #[default]
    Idle,
    /// A decode is in flight; the entry must not be evicted.
    Loading,
    /// Pixels are resident and valid.
    Loaded,
    /// The last decode failed.
    Failed,
    /// The last allocation was refused even after eviction.
    OutOfMemory,
}

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Rgba32,
    Bgra32,
}

/// One resident or pending cache entry: buffer handle, dimensions, load
/// state, and pixel format.
///
/// The default entry is empty: no buffer, zero dimensions, [`ReadStatus::Idle`].
#[derive(Debug, Default)]
pub struct ImageData {
    buffer: Option<PixelBuffer>,
    width: u32,
    height: u32,
    status: ReadStatus,
    format: ImageFormat,
}

impl ImageData {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn status(&self) -> ReadStatus {
        self.status
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// True if this entry currently owns a pixel buffer.
    pub fn is_resident(&self) -> bool {
        self.buffer.is_some()
    }

    /// Bytes held by this entry's buffer, `0` when empty.
    pub fn memory_size(&self) -> usize {
        self.buffer.as_ref().map_or(0, PixelBuffer::len)
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.buffer.as_ref().map(PixelBuffer::as_slice)
    }

    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.buffer.as_mut().map(PixelBuffer::as_mut_slice)
    }

    pub(crate) fn buffer(&self) -> Option<&PixelBuffer> {
        self.buffer.as_ref()
    }

    pub(crate) fn take_buffer(&mut self) -> Option<PixelBuffer> {
        self.buffer.take()
    }

    pub(crate) fn set_status(&mut self, status: ReadStatus) {
        self.status = status;
    }

    pub(crate) fn set_format(&mut self, format: ImageFormat) {
        self.format = format;
    }

    /// Replaces this entry's contents. A previously held buffer is released.
    pub(crate) fn install(
        &mut self,
        buffer: PixelBuffer,
        width: u32,
        height: u32,
        status: ReadStatus,
        format: ImageFormat,
    ) {
        self.buffer = Some(buffer);
        self.width = width;
        self.height = height;
        self.status = status;
        self.format = format;
    }

    /// Returns the entry to its empty state. The buffer, if any, is released.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A decoded frame handed over by the external decode stage.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub pixels: Vec<u8>,
}

/// Decode collaborator: turns an image path into raw pixels.
///
/// The cache itself never touches the filesystem or a codec; playback and
/// prefetch workers inject their decoder when calling
/// [`ImageCollection::load_image`](crate::collection::ImageCollection::load_image).
pub trait FrameDecoder {
    fn decode(&self, path: &str) -> Result<DecodedFrame, DecodeError>;
}

/// Errors produced by a [`FrameDecoder`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unsupported or corrupt image data in {path}")]
    Malformed { path: String },
}
