//! One cache partition: the path-to-image map, the eviction order, and the
//! allocation/eviction/loading orchestration.
//!
//! A collection performs no locking of its own. Every mutating operation
//! takes `&mut self`, so callers reach it through the partition mutex owned
//! by the [`ImageCatalog`](crate::catalog::ImageCatalog) — holding the lock
//! is enforced by the type system.
//!
//! # Eviction
//!
//! Entries are kept in an insertion/usage order, oldest first. When the
//! allocator refuses an allocation, the collection unloads entries one at a
//! time and retries, scanning from a resumable cursor rather than the true
//! head: entries confirmed non-evictable (in-flight loads, the entry being
//! allocated for) move the cursor past them, so a cache with many pinned old
//! entries does not pay a full rescan on every allocation. A touch re-inserts
//! an entry at the tail — past the cursor — making it scannable again.

use std::collections::HashMap;

use log::{debug, warn};

use crate::allocator::{ImageAllocator, PixelBuffer};
use crate::catalog::Partition;
use crate::image::{FrameDecoder, ImageData, ImageFormat, ReadStatus};
use crate::order::{OrderKey, OrderList};

/// Usage counters for one collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Entries currently in the map (resident or pending).
    pub image_count: usize,
    /// Bytes held by this collection's buffers.
    pub resident_bytes: u64,
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries unloaded to make room for new allocations.
    pub evictions: u64,
}

/// A single cache partition.
pub struct ImageCollection {
    partition: Partition,
    allocator: ImageAllocator,
    images: HashMap<String, ImageData>,
    order: OrderList,
    order_index: HashMap<String, OrderKey>,
    /// Resumable eviction cursor. `None` means the cursor ran off the end
    /// and re-anchors at the next inserted node.
    scan_start: Option<OrderKey>,
    latest_request_frame: i64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ImageCollection {
    pub(crate) fn new(partition: Partition, allocator: ImageAllocator) -> Self {
        Self {
            partition,
            allocator,
            images: HashMap::new(),
            order: OrderList::new(),
            order_index: HashMap::new(),
            scan_start: None,
            latest_request_frame: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Looks up an entry. Lookup only — the eviction order is untouched, but
    /// the frame bookkeeping advances.
    pub fn get_image(&mut self, path: &str, frame: i64) -> Option<&ImageData> {
        self.update_request_frame(frame);
        if self.images.contains_key(path) {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.images.get(path)
    }

    /// Inserts an empty placeholder for `path`, or returns the existing
    /// entry. Marks the entry most recently used either way.
    pub fn add_image(&mut self, path: &str, frame: i64) -> &ImageData {
        self.update_request_frame(frame);
        self.touch(path);
        self.images.entry(path.to_string()).or_default()
    }

    /// Reserves a buffer for a new or replaced entry.
    ///
    /// Any buffer the entry already holds is released first, so replacing an
    /// entry never needs room for both generations at once. If the allocator
    /// refuses, entries are evicted oldest-first (skipping pinned ones) and
    /// the allocation retried; `None` when no evictable candidate remains.
    /// On failure the entry stays in the map, empty.
    pub fn allocate_image(&mut self, path: &str, width: u32, height: u32) -> Option<&ImageData> {
        self.touch(path);
        self.images.entry(path.to_string()).or_default();
        if let Some(entry) = self.images.get_mut(path) {
            if entry.is_resident() {
                self.allocator.deallocate_image(entry);
            }
        }

        let buffer = self.allocate_with_eviction(path, width, height)?;

        let entry = self.images.get_mut(path)?;
        let format = entry.format();
        entry.install(buffer, width, height, ReadStatus::Idle, format);
        Some(&*entry)
    }

    /// Loads `path` through the injected decoder, allocating (and evicting
    /// if needed) for the decoded dimensions.
    ///
    /// Returns the entry directly if it is already loaded. Decode failure
    /// marks the entry [`ReadStatus::Failed`]; an allocation that fails even
    /// after eviction marks it [`ReadStatus::OutOfMemory`].
    pub fn load_image(
        &mut self,
        path: &str,
        decoder: &dyn FrameDecoder,
    ) -> Option<&ImageData> {
        self.touch(path);
        self.images.entry(path.to_string()).or_default();

        let already_loaded = self
            .images
            .get(path)
            .is_some_and(|img| img.status() == ReadStatus::Loaded && img.is_resident());
        if already_loaded {
            return self.images.get(path);
        }

        // Drop any stale buffer so its budget is reusable before the reload.
        if let Some(entry) = self.images.get_mut(path) {
            if entry.is_resident() {
                self.allocator.deallocate_image(entry);
            }
        }

        self.set_image_status(path, ReadStatus::Loading);
        let decoded = match decoder.decode(path) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("{:?} cache: decode failed for {path}: {err}", self.partition);
                self.set_image_status(path, ReadStatus::Failed);
                return None;
            }
        };

        let Some(mut buffer) = self.allocate_with_eviction(path, decoded.width, decoded.height)
        else {
            self.set_image_status(path, ReadStatus::OutOfMemory);
            return None;
        };
        let n = decoded.pixels.len().min(buffer.len());
        buffer.as_mut_slice()[..n].copy_from_slice(&decoded.pixels[..n]);

        let entry = self.images.get_mut(path)?;
        entry.install(
            buffer,
            decoded.width,
            decoded.height,
            ReadStatus::Loaded,
            decoded.format,
        );
        Some(&*entry)
    }

    /// Copies an already-decoded image owned elsewhere (typically an entry
    /// of another partition) into this collection's management. `false` if
    /// the source holds no pixels or the allocation fails.
    pub fn add_image_from_src(
        &mut self,
        path: &str,
        frame: i64,
        src: &ImageData,
        width: u32,
        height: u32,
    ) -> bool {
        self.update_request_frame(frame);
        let Some(src_pixels) = src.data() else {
            return false;
        };

        self.touch(path);
        self.images.entry(path.to_string()).or_default();
        if let Some(entry) = self.images.get_mut(path) {
            if entry.is_resident() {
                self.allocator.deallocate_image(entry);
            }
        }

        let Some(mut buffer) = self.allocate_with_eviction(path, width, height) else {
            return false;
        };
        let n = src_pixels.len().min(buffer.len());
        buffer.as_mut_slice()[..n].copy_from_slice(&src_pixels[..n]);

        let Some(entry) = self.images.get_mut(path) else {
            return false;
        };
        entry.install(buffer, width, height, ReadStatus::Loaded, src.format());
        true
    }

    /// Sets the load state of an existing entry. No effect if absent.
    pub fn set_image_status(&mut self, path: &str, status: ReadStatus) {
        if let Some(image) = self.images.get_mut(path) {
            image.set_status(status);
        }
    }

    /// Sets the pixel format of an existing entry. No effect if absent.
    pub fn set_image_format(&mut self, path: &str, format: ImageFormat) {
        if let Some(image) = self.images.get_mut(path) {
            image.set_format(format);
        }
    }

    /// Explicitly evicts one entry: frees its buffer and removes it from the
    /// map and the eviction order. `false` if the path is absent.
    pub fn unload_image(&mut self, path: &str) -> bool {
        let Some(mut image) = self.images.remove(path) else {
            return false;
        };
        self.allocator.deallocate_image(&mut image);
        self.remove_order(path);
        true
    }

    /// Unloads every entry and clears all ordering and frame state.
    pub fn reset_all(&mut self) {
        let count = self.images.len();
        for (_, mut image) in self.images.drain() {
            self.allocator.deallocate_image(&mut image);
        }
        self.order.clear();
        self.order_index.clear();
        self.scan_start = None;
        self.latest_request_frame = 0;
        if count > 0 {
            debug!("{:?} cache: reset, {count} entries unloaded", self.partition);
        }
    }

    /// Clears only ordering/cursor state; resident data stays valid. Used
    /// when the order of evaluation (e.g. playback direction) changes. The
    /// order rebuilds lazily as entries are touched.
    pub fn reset_order(&mut self) {
        self.order.clear();
        self.order_index.clear();
        self.scan_start = None;
    }

    pub fn image_map(&self) -> &HashMap<String, ImageData> {
        &self.images
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    /// The most recent frame number requested of this partition.
    pub fn latest_request_frame(&self) -> i64 {
        self.latest_request_frame
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            image_count: self.images.len(),
            resident_bytes: self
                .images
                .values()
                .map(|img| img.memory_size() as u64)
                .sum(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    fn update_request_frame(&mut self, frame: i64) {
        self.latest_request_frame = self.latest_request_frame.max(frame);
    }

    /// Marks `path` most recently used, (re)inserting its node at the back
    /// of the eviction order.
    fn touch(&mut self, path: &str) {
        if let Some(key) = self.order_index.remove(path) {
            if self.scan_start == Some(key) {
                self.scan_start = self.order.next(key);
            }
            self.order.remove(key);
        }
        let key = self.order.push_back(path.to_string());
        if self.scan_start.is_none() {
            // The cursor ran off the end; re-anchor at the new tail.
            self.scan_start = Some(key);
        }
        self.order_index.insert(path.to_string(), key);
        debug_assert_eq!(self.order.len(), self.order_index.len());
    }

    fn remove_order(&mut self, path: &str) {
        if let Some(key) = self.order_index.remove(path) {
            if self.scan_start == Some(key) {
                self.scan_start = self.order.next(key);
            }
            self.order.remove(key);
        }
    }

    /// Try-allocate / evict-one / retry until the allocator admits the
    /// buffer or no evictable candidate remains.
    fn allocate_with_eviction(
        &mut self,
        path: &str,
        width: u32,
        height: u32,
    ) -> Option<PixelBuffer> {
        ImageAllocator::mem_size(width, height)?;
        loop {
            if let Some(buffer) = self.allocator.allocate_image(width, height) {
                return Some(buffer);
            }
            if !self.unload_next_unused(path) {
                warn!(
                    "{:?} cache: cannot free memory for {width}x{height} ({path})",
                    self.partition
                );
                return None;
            }
        }
    }

    /// Unloads the oldest entry not pinned by an in-flight load, resuming
    /// from where the previous scan stopped. `false` when no candidate
    /// remains between the cursor and the tail.
    fn unload_next_unused(&mut self, keep_path: &str) -> bool {
        if self.order.is_empty() {
            return false;
        }
        let mut cursor = self.scan_start;
        while let Some(key) = cursor {
            let next = self.order.next(key);
            let Some(path) = self.order.path(key).map(str::to_string) else {
                break;
            };

            let Some(image) = self.images.get(&path) else {
                // Orphaned order node; drop it and keep scanning.
                self.remove_order(&path);
                cursor = next;
                continue;
            };

            let pinned = path == keep_path || image.status() == ReadStatus::Loading;
            if pinned {
                // Confirmed non-evictable; the cursor moves past it.
                self.scan_start = next;
                cursor = next;
                continue;
            }

            debug!(
                "{:?} cache: evicting {path} ({} bytes)",
                self.partition,
                image.memory_size()
            );
            self.unload_image(&path);
            self.evictions += 1;
            return true;
        }
        false
    }
}
