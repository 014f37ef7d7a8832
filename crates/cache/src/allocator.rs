//! Budget-enforced allocator for decoded frame buffers.
//!
//! The allocator is a pure resource-budget oracle. Every live buffer is
//! registered in an internal map from buffer id to allocated size, so
//! reallocation and deallocation never depend on caller-supplied sizes —
//! the registry is the single authoritative record. Buffers are handed out
//! as [`PixelBuffer`] guards that deregister themselves on drop, keeping
//! the used-memory counter exact without any manual bookkeeping by callers.
//!
//! Admission is checked before every non-forced allocation: either against
//! an explicit byte budget, or against the system's RAM headroom when no
//! budget is configured.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::CacheConfig;
use crate::image::ImageData;
use crate::ram::{RamProbe, SystemRam};

/// Bytes per decoded texel (RGBA).
pub const BYTES_PER_TEXEL: u32 = 4;

/// Admission policy applied before every non-forced allocation.
pub enum AdmissionPolicy {
    /// Fail when used + requested would exceed a hard byte cap.
    FixedBudget(u64),
    /// Adaptive: keep a fraction of total RAM available. With
    /// `count_against_total`, compare used + requested against total RAM
    /// instead of the live available figure (for platforms that compress
    /// idle memory and report unreliable availability).
    RamHeadroom {
        probe: Arc<dyn RamProbe>,
        min_free_ratio: f64,
        count_against_total: bool,
    },
}

impl AdmissionPolicy {
    /// Builds the policy the configuration selects: an explicit budget when
    /// one is set, the RAM-headroom policy against live system memory
    /// otherwise.
    pub fn from_config(config: &CacheConfig) -> Self {
        match config.max_image_memory {
            Some(max) => Self::FixedBudget(max),
            None => Self::RamHeadroom {
                probe: Arc::new(SystemRam),
                min_free_ratio: config.min_free_ram_ratio,
                count_against_total: config.compressed_memory_platform,
            },
        }
    }

    fn admits(&self, used: u64, requested: u64) -> bool {
        match self {
            Self::FixedBudget(max) => used.saturating_add(requested) <= *max,
            Self::RamHeadroom {
                probe,
                min_free_ratio,
                count_against_total,
            } => {
                let total = probe.total_bytes();
                if total == 0 {
                    // RAM query failed; there is nothing to enforce against.
                    return true;
                }
                if *count_against_total {
                    used.saturating_add(requested) <= total
                } else {
                    let available_after = probe.available_bytes().saturating_sub(requested);
                    available_after as f64 / total as f64 > *min_free_ratio
                }
            }
        }
    }
}

impl fmt::Debug for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedBudget(max) => f.debug_tuple("FixedBudget").field(max).finish(),
            Self::RamHeadroom {
                min_free_ratio,
                count_against_total,
                ..
            } => f
                .debug_struct("RamHeadroom")
                .field("min_free_ratio", min_free_ratio)
                .field("count_against_total", count_against_total)
                .finish(),
        }
    }
}

/// Snapshot of allocator usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorStats {
    /// Bytes currently registered to live buffers.
    pub used_bytes: u64,
    /// High-water mark of `used_bytes`.
    pub peak_used_bytes: u64,
    /// Number of live registered buffers.
    pub live_buffers: usize,
    /// Allocation requests refused by the admission check.
    pub denied_allocations: u64,
}

/// Shared allocator state. Buffers hold an `Arc` back to this so they can
/// deregister themselves without a reference to the full allocator.
struct AllocShared {
    policy: AdmissionPolicy,
    /// Bytes currently registered. Updated while the registry lock is held
    /// so the counter and the registry never diverge.
    used: AtomicU64,
    peak: AtomicU64,
    denied: AtomicU64,
    /// Buffer id -> allocated size.
    registry: Mutex<HashMap<u64, usize>>,
    next_id: AtomicU64,
}

impl Drop for AllocShared {
    fn drop(&mut self) {
        // All buffers hold an Arc to this state, so by the time it drops
        // every buffer has deregistered. Anything left is bookkeeping drift.
        debug_assert_eq!(
            self.used.load(Ordering::Acquire),
            0,
            "image memory still registered at allocator teardown"
        );
    }
}

/// Shared, internally synchronized allocator handle.
///
/// Cloning is cheap and shares the budget, registry, and counters; the
/// catalog clones one allocator into every partition. Collections may not
/// outlive it — buffer guards keep the shared state alive until the last
/// one drops.
#[derive(Clone)]
pub struct ImageAllocator {
    shared: Arc<AllocShared>,
}

impl ImageAllocator {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_policy(AdmissionPolicy::from_config(config))
    }

    pub fn with_policy(policy: AdmissionPolicy) -> Self {
        Self {
            shared: Arc::new(AllocShared {
                policy,
                used: AtomicU64::new(0),
                peak: AtomicU64::new(0),
                denied: AtomicU64::new(0),
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Buffer size for a `width` x `height` frame. `None` for empty or
    /// overflowing dimensions.
    pub fn mem_size(width: u32, height: u32) -> Option<u64> {
        let bytes = (width as u64)
            .checked_mul(height as u64)?
            .checked_mul(BYTES_PER_TEXEL as u64)?;
        (bytes != 0).then_some(bytes)
    }

    /// Applies the admission check against the current used-memory counter.
    pub fn is_allocable(&self, requested: u64) -> bool {
        self.shared.policy.admits(self.used_bytes(), requested)
    }

    /// Allocates a zero-initialized buffer for a `width` x `height` frame,
    /// subject to the admission check. `None` on refusal or native failure.
    pub fn allocate_image(&self, width: u32, height: u32) -> Option<PixelBuffer> {
        let size = Self::mem_size(width, height)?;
        if !self.is_allocable(size) {
            self.shared.denied.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.allocate_registered(size as usize)
    }

    /// Allocates `size` bytes. `force` bypasses the admission check only;
    /// native allocation failure still returns `None`. Zero-sized requests
    /// fail.
    pub fn allocate(&self, size: usize, force: bool) -> Option<PixelBuffer> {
        if size == 0 {
            return None;
        }
        if !force && !self.is_allocable(size as u64) {
            self.shared.denied.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.allocate_registered(size)
    }

    /// Resizes a buffer by allocating a replacement, copying
    /// `min(old, new)` bytes, and releasing the original.
    ///
    /// `None` input behaves as [`allocate`](Self::allocate). A buffer this
    /// allocator did not register fails rather than guessing at its size.
    /// On any failure the original buffer comes back in `Err`, untouched
    /// and still registered. The admission check counts the original as
    /// still live.
    pub fn reallocate(
        &self,
        buffer: Option<PixelBuffer>,
        new_size: usize,
        force: bool,
    ) -> Result<PixelBuffer, Option<PixelBuffer>> {
        let Some(old) = buffer else {
            return self.allocate(new_size, force).ok_or(None);
        };
        if !old.registered_with(self) {
            return Err(Some(old));
        }
        let Some(mut fresh) = self.allocate(new_size, force) else {
            return Err(Some(old));
        };

        let n = old.len().min(new_size);
        fresh.as_mut_slice()[..n].copy_from_slice(&old.as_slice()[..n]);
        drop(old);
        Ok(fresh)
    }

    /// Releases a buffer. `false` for `None` or a buffer this allocator did
    /// not register (a foreign buffer is still returned to its own
    /// allocator when dropped here).
    pub fn deallocate(&self, buffer: Option<PixelBuffer>) -> bool {
        match buffer {
            None => false,
            Some(buf) => buf.registered_with(self),
        }
    }

    /// Releases an entry's buffer and resets the entry to its empty state.
    /// This is the only way memory is freed while the [`ImageData`] itself
    /// stays valid. `false` if the entry holds no buffer registered here.
    pub fn deallocate_image(&self, image: &mut ImageData) -> bool {
        let owned = image
            .buffer()
            .is_some_and(|buf| buf.registered_with(self));
        if !owned {
            return false;
        }
        drop(image.take_buffer());
        image.reset();
        true
    }

    /// Bytes currently registered to live buffers.
    pub fn used_bytes(&self) -> u64 {
        self.shared.used.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AllocatorStats {
        let live_buffers = self.shared.registry.lock().unwrap().len();
        AllocatorStats {
            used_bytes: self.used_bytes(),
            peak_used_bytes: self.shared.peak.load(Ordering::Acquire),
            live_buffers,
            denied_allocations: self.shared.denied.load(Ordering::Relaxed),
        }
    }

    fn allocate_registered(&self, size: usize) -> Option<PixelBuffer> {
        let mut data = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            return None;
        }
        data.resize(size, 0);

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.shared.registry.lock().unwrap();
            registry.insert(id, size);
            let used = self.shared.used.fetch_add(size as u64, Ordering::Release) + size as u64;
            self.shared.peak.fetch_max(used, Ordering::AcqRel);
        }

        Some(PixelBuffer {
            id,
            data,
            shared: Arc::clone(&self.shared),
        })
    }
}

impl fmt::Debug for ImageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageAllocator")
            .field("policy", &self.shared.policy)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

/// An owning handle to one registered pixel buffer.
///
/// Created only by [`ImageAllocator`]. Dropping the handle erases its
/// registry entry and returns its bytes to the budget, so memory can never
/// leak out of the used-memory accounting.
pub struct PixelBuffer {
    id: u64,
    data: Vec<u8>,
    shared: Arc<AllocShared>,
}

impl PixelBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn registered_with(&self, allocator: &ImageAllocator) -> bool {
        Arc::ptr_eq(&self.shared, &allocator.shared)
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.shared.registry.lock() {
            if let Some(size) = registry.remove(&self.id) {
                // Floored at zero to tolerate bookkeeping drift rather than
                // underflowing.
                let _ = self.shared.used.fetch_update(
                    Ordering::Release,
                    Ordering::Acquire,
                    |used| Some(used.saturating_sub(size as u64)),
                );
            }
        }
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Scripted RAM figures for exercising the headroom policy.
    struct FakeRam {
        total: u64,
        available: AtomicU64,
    }

    impl FakeRam {
        fn new(total: u64, available: u64) -> Self {
            Self {
                total,
                available: AtomicU64::new(available),
            }
        }

        fn set_available(&self, bytes: u64) {
            self.available.store(bytes, Ordering::Relaxed);
        }
    }

    impl RamProbe for FakeRam {
        fn total_bytes(&self) -> u64 {
            self.total
        }

        fn available_bytes(&self) -> u64 {
            self.available.load(Ordering::Relaxed)
        }
    }

    fn budget_allocator(bytes: u64) -> ImageAllocator {
        ImageAllocator::with_policy(AdmissionPolicy::FixedBudget(bytes))
    }

    #[test]
    fn test_allocate_tracks_used_memory() {
        let alloc = budget_allocator(1024 * 1024);

        let a = alloc.allocate(1000, false).unwrap();
        let b = alloc.allocate(2000, false).unwrap();
        assert_eq!(alloc.used_bytes(), 3000);
        assert_eq!(alloc.stats().live_buffers, 2);

        drop(a);
        assert_eq!(alloc.used_bytes(), 2000);
        drop(b);
        assert_eq!(alloc.used_bytes(), 0);
        assert_eq!(alloc.stats().live_buffers, 0);
    }

    #[test]
    fn test_allocate_image_sizes_by_texel() {
        let alloc = budget_allocator(1024 * 1024);
        let buf = alloc.allocate_image(16, 8).unwrap();
        assert_eq!(buf.len(), 16 * 8 * BYTES_PER_TEXEL as usize);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_over_budget_fails_without_mutating_state() {
        let alloc = budget_allocator(1024);
        let _held = alloc.allocate(1024, false).unwrap();

        assert!(alloc.allocate(1, false).is_none());

        let stats = alloc.stats();
        assert_eq!(stats.used_bytes, 1024);
        assert_eq!(stats.live_buffers, 1);
        assert_eq!(stats.denied_allocations, 1);
    }

    #[test]
    fn test_force_allocate_bypasses_admission() {
        let alloc = budget_allocator(16);
        let buf = alloc.allocate(1024, true).unwrap();
        assert_eq!(buf.len(), 1024);
        assert_eq!(alloc.used_bytes(), 1024);
    }

    #[test]
    fn test_zero_sized_allocation_fails() {
        let alloc = budget_allocator(1024);
        assert!(alloc.allocate(0, false).is_none());
        assert!(alloc.allocate(0, true).is_none());
        assert!(alloc.allocate_image(0, 16).is_none());
    }

    #[test]
    fn test_mem_size_overflow() {
        assert_eq!(ImageAllocator::mem_size(16, 16), Some(16 * 16 * 4));
        assert_eq!(ImageAllocator::mem_size(0, 100), None);
        assert_eq!(ImageAllocator::mem_size(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn test_reallocate_none_behaves_as_allocate() {
        let alloc = budget_allocator(1024);
        let buf = alloc.reallocate(None, 512, false).unwrap();
        assert_eq!(buf.len(), 512);
        assert_eq!(alloc.used_bytes(), 512);
    }

    #[test]
    fn test_reallocate_copies_min_prefix() {
        let alloc = budget_allocator(1024 * 1024);

        let mut buf = alloc.allocate(4, false).unwrap();
        buf.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);

        // Grow: old bytes preserved, the rest zeroed.
        let grown = alloc.reallocate(Some(buf), 8, false).unwrap();
        assert_eq!(grown.as_slice(), &[1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(alloc.stats().live_buffers, 1);
        assert_eq!(alloc.used_bytes(), 8);

        // Shrink: prefix kept.
        let shrunk = alloc.reallocate(Some(grown), 2, false).unwrap();
        assert_eq!(shrunk.as_slice(), &[1, 2]);
        assert_eq!(alloc.used_bytes(), 2);
    }

    #[test]
    fn test_reallocate_admission_counts_old_buffer() {
        // Budget fits the old and new buffer together or not at all.
        let alloc = budget_allocator(100);
        let buf = alloc.allocate(80, false).unwrap();

        // 80 (old, still live) + 40 (new) > 100.
        let result = alloc.reallocate(Some(buf), 40, false);
        let Err(Some(original)) = result else {
            panic!("expected the original buffer back");
        };
        assert_eq!(original.len(), 80);
        assert_eq!(alloc.used_bytes(), 80);
        assert_eq!(alloc.stats().live_buffers, 1);
    }

    #[test]
    fn test_reallocate_foreign_buffer_fails_unchanged() {
        let alloc_a = budget_allocator(1024);
        let alloc_b = budget_allocator(1024);

        let buf = alloc_a.allocate(100, false).unwrap();
        let result = alloc_b.reallocate(Some(buf), 200, false);

        let Err(Some(original)) = result else {
            panic!("expected the original buffer back");
        };
        assert_eq!(original.len(), 100);
        assert_eq!(alloc_a.used_bytes(), 100);
        assert_eq!(alloc_b.used_bytes(), 0);
        assert_eq!(alloc_b.stats().live_buffers, 0);
    }

    #[test]
    fn test_deallocate() {
        let alloc = budget_allocator(1024);
        let buf = alloc.allocate(100, false).unwrap();

        assert!(alloc.deallocate(Some(buf)));
        assert_eq!(alloc.used_bytes(), 0);
        assert!(!alloc.deallocate(None));
    }

    #[test]
    fn test_deallocate_foreign_buffer() {
        let alloc_a = budget_allocator(1024);
        let alloc_b = budget_allocator(1024);

        let buf = alloc_a.allocate(100, false).unwrap();
        // Not registered with B; the drop still returns it to A.
        assert!(!alloc_b.deallocate(Some(buf)));
        assert_eq!(alloc_a.used_bytes(), 0);
        assert_eq!(alloc_b.used_bytes(), 0);
    }

    #[test]
    fn test_deallocate_image_resets_entry() {
        let alloc = budget_allocator(1024 * 1024);
        let mut image = ImageData::default();
        assert!(!alloc.deallocate_image(&mut image));

        let buf = alloc.allocate_image(8, 8).unwrap();
        image.install(
            buf,
            8,
            8,
            crate::image::ReadStatus::Loaded,
            crate::image::ImageFormat::Rgba32,
        );

        assert!(alloc.deallocate_image(&mut image));
        assert!(!image.is_resident());
        assert_eq!(image.width(), 0);
        assert_eq!(image.height(), 0);
        assert_eq!(image.status(), crate::image::ReadStatus::Idle);
        assert_eq!(alloc.used_bytes(), 0);
    }

    #[test]
    fn test_peak_tracking() {
        let alloc = budget_allocator(1024 * 1024);

        let a = alloc.allocate(1000, false).unwrap();
        let b = alloc.allocate(2000, false).unwrap();
        drop(a);
        drop(b);

        let stats = alloc.stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.peak_used_bytes, 3000);
    }

    #[test]
    fn test_headroom_policy_with_fake_probe() {
        let probe = Arc::new(FakeRam::new(1000, 500));
        let alloc = ImageAllocator::with_policy(AdmissionPolicy::RamHeadroom {
            probe: Arc::clone(&probe) as Arc<dyn RamProbe>,
            min_free_ratio: 0.10,
            count_against_total: false,
        });

        // 500 available - 300 requested leaves 20% of total: admitted.
        assert!(alloc.allocate(300, false).is_some());

        // 500 available - 450 requested leaves 5% of total: refused.
        assert!(alloc.allocate(450, false).is_none());

        // The system freed memory; the same request is admitted now.
        probe.set_available(900);
        assert!(alloc.allocate(450, false).is_some());
    }

    #[test]
    fn test_headroom_compressed_variant_compares_total() {
        let probe = Arc::new(FakeRam::new(1000, 1000));
        let alloc = ImageAllocator::with_policy(AdmissionPolicy::RamHeadroom {
            probe: probe as Arc<dyn RamProbe>,
            min_free_ratio: 0.10,
            count_against_total: true,
        });

        let _held = alloc.allocate(900, false).unwrap();
        // 900 used + 200 requested > 1000 total, despite "available" RAM.
        assert!(alloc.allocate(200, false).is_none());
        // 900 + 100 == 1000 still fits.
        assert!(alloc.allocate(100, false).is_some());
    }

    #[test]
    fn test_headroom_failed_query_admits() {
        let probe = Arc::new(FakeRam::new(0, 0));
        let alloc = ImageAllocator::with_policy(AdmissionPolicy::RamHeadroom {
            probe: probe as Arc<dyn RamProbe>,
            min_free_ratio: 0.10,
            count_against_total: false,
        });

        assert!(alloc.allocate(1024, false).is_some());
    }

    #[test]
    fn test_shared_handles_share_budget() {
        let alloc = budget_allocator(1000);
        let clone = alloc.clone();

        let _a = alloc.allocate(600, false).unwrap();
        assert_eq!(clone.used_bytes(), 600);
        assert!(clone.allocate(600, false).is_none());
        assert!(clone.allocate(400, false).is_some());
    }
}
