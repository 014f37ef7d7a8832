//! Catalog of per-partition collections sharing one allocator.

use std::sync::Mutex;

use log::debug;

use crate::allocator::{AllocatorStats, ImageAllocator};
use crate::collection::ImageCollection;
use crate::config::CacheConfig;

/// Concurrency partition ("critical-section type").
///
/// Unrelated request categories get independent collections, each behind its
/// own lock, so playback reads never contend with prefetch work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Full-resolution frames consumed by playback.
    FullImage,
    /// Downscaled preview frames.
    Preview,
}

impl Partition {
    pub const COUNT: usize = 2;
    pub const ALL: [Partition; Partition::COUNT] = [Partition::FullImage, Partition::Preview];

    fn index(self) -> usize {
        self as usize
    }
}

/// The cache root: one [`ImageCollection`] per partition, all wired to a
/// single shared [`ImageAllocator`].
///
/// Collections are reached through [`collection`](Self::collection), which
/// hands out the partition mutex — the "external lock" every mutating
/// collection operation requires. Never call back into the same partition
/// while holding its lock; that deadlocks.
pub struct ImageCatalog {
    allocator: ImageAllocator,
    collections: [Mutex<ImageCollection>; Partition::COUNT],
}

impl ImageCatalog {
    pub fn new(config: &CacheConfig) -> Self {
        let allocator = ImageAllocator::new(config);
        let collections =
            Partition::ALL.map(|p| Mutex::new(ImageCollection::new(p, allocator.clone())));
        Self {
            allocator,
            collections,
        }
    }

    /// The lock-acquiring entry point for one partition.
    pub fn collection(&self, partition: Partition) -> &Mutex<ImageCollection> {
        &self.collections[partition.index()]
    }

    pub fn allocator(&self) -> &ImageAllocator {
        &self.allocator
    }

    /// Bytes currently held by resident images across all partitions.
    pub fn used_memory(&self) -> u64 {
        self.allocator.used_bytes()
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    /// Full cache teardown: unloads every entry in every partition.
    ///
    /// Each partition's lock is acquired independently, one at a time —
    /// never a single lock spanning all partitions — so this is safe to call
    /// while other threads work in other partitions.
    pub fn reset(&self) {
        debug!("image catalog: full reset");
        for partition in Partition::ALL {
            self.collections[partition.index()]
                .lock()
                .unwrap()
                .reset_all();
        }
    }

    /// Clears every partition's eviction order while keeping resident data,
    /// with the same per-partition locking discipline as [`reset`](Self::reset).
    pub fn reset_order(&self) {
        for partition in Partition::ALL {
            self.collections[partition.index()]
                .lock()
                .unwrap()
                .reset_order();
        }
    }
}

impl Default for ImageCatalog {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BYTES_PER_TEXEL;

    const W: u32 = 8;
    const H: u32 = 8;
    const FRAME_BYTES: u64 = (W * H * BYTES_PER_TEXEL) as u64;

    fn catalog_with_budget(frames: u64) -> ImageCatalog {
        ImageCatalog::new(&CacheConfig::default().with_budget_bytes(frames * FRAME_BYTES))
    }

    #[test]
    fn test_partitions_are_independent_but_share_budget() {
        let catalog = catalog_with_budget(1);

        {
            let mut full = catalog.collection(Partition::FullImage).lock().unwrap();
            assert!(full.allocate_image("a.png", W, H).is_some());
        }
        assert_eq!(catalog.used_memory(), FRAME_BYTES);

        // The preview partition sees the shared budget as exhausted and has
        // nothing of its own to evict.
        {
            let mut preview = catalog.collection(Partition::Preview).lock().unwrap();
            assert!(preview.allocate_image("a.png", W, H).is_none());
        }

        catalog.reset();
        {
            let mut preview = catalog.collection(Partition::Preview).lock().unwrap();
            assert!(preview.allocate_image("a.png", W, H).is_some());
        }
    }

    #[test]
    fn test_reset_clears_every_partition() {
        let catalog = catalog_with_budget(8);

        for partition in Partition::ALL {
            let mut col = catalog.collection(partition).lock().unwrap();
            col.allocate_image("a.png", W, H);
            col.allocate_image("b.png", W, H);
        }
        assert_eq!(catalog.used_memory(), 4 * FRAME_BYTES);

        catalog.reset();
        assert_eq!(catalog.used_memory(), 0);
        for partition in Partition::ALL {
            let col = catalog.collection(partition).lock().unwrap();
            assert_eq!(col.num_images(), 0);
        }
    }

    #[test]
    fn test_reset_order_keeps_entries() {
        let catalog = catalog_with_budget(8);

        for partition in Partition::ALL {
            let mut col = catalog.collection(partition).lock().unwrap();
            col.allocate_image("a.png", W, H);
        }

        catalog.reset_order();
        assert_eq!(catalog.used_memory(), 2 * FRAME_BYTES);
        for partition in Partition::ALL {
            let col = catalog.collection(partition).lock().unwrap();
            assert_eq!(col.num_images(), 1);
        }
    }

    #[test]
    fn test_concurrent_partition_access() {
        use std::sync::Arc;
        use std::thread;

        let catalog = Arc::new(catalog_with_budget(64));

        let handles: Vec<_> = Partition::ALL
            .into_iter()
            .map(|partition| {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || {
                    for i in 0..32 {
                        let path = format!("seq/{i:04}.png");
                        let mut col = catalog.collection(partition).lock().unwrap();
                        col.allocate_image(&path, W, H);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Budget held across both partitions; bookkeeping stayed exact.
        let stats = catalog.allocator_stats();
        assert!(stats.used_bytes <= 64 * FRAME_BYTES);
        assert_eq!(
            stats.used_bytes,
            Partition::ALL
                .iter()
                .map(|&p| {
                    catalog
                        .collection(p)
                        .lock()
                        .unwrap()
                        .stats()
                        .resident_bytes
                })
                .sum::<u64>()
        );
    }
}
