//! Seqview Image Cache Library
//!
//! Bounded-memory cache for decoded frames of streaming image sequences.
//! Frames are held per concurrency partition with oldest-first eviction
//! against one shared memory budget — an explicit byte cap, or an adaptive
//! RAM-headroom policy when no cap is configured.

pub mod allocator;
pub mod catalog;
pub mod collection;
pub mod config;
pub mod image;
mod order;
pub mod ram;

pub use allocator::{
    AdmissionPolicy, AllocatorStats, ImageAllocator, PixelBuffer, BYTES_PER_TEXEL,
};
pub use catalog::{ImageCatalog, Partition};
pub use collection::{CacheStats, ImageCollection};
pub use config::{CacheConfig, ConfigError};
pub use image::{DecodeError, DecodedFrame, FrameDecoder, ImageData, ImageFormat, ReadStatus};
pub use ram::{RamProbe, SystemRam};
