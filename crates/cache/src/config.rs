//! Cache configuration: explicit budget override and admission tuning.
//!
//! The budget can be set programmatically or through the
//! `SEQVIEW_IMAGE_CACHE_MB` environment variable. When no budget is
//! configured the cache is "unlimited" and governed only by the RAM-headroom
//! admission policy.

use std::env;

use thiserror::Error;

/// Fraction of total RAM that must stay available under the headroom policy.
pub const DEFAULT_MIN_FREE_RAM_RATIO: f64 = 0.10;

const ENV_IMAGE_CACHE_MB: &str = "SEQVIEW_IMAGE_CACHE_MB";

/// Configuration for the image cache subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Explicit memory budget in bytes. `None` means unlimited: admission is
    /// governed by the RAM-headroom policy instead.
    pub max_image_memory: Option<u64>,
    /// Fraction of total RAM that must remain available after an allocation
    /// under the headroom policy.
    pub min_free_ram_ratio: f64,
    /// Compare used+requested against total RAM instead of the live
    /// available figure. Platforms that transparently compress idle memory
    /// report availability figures that are often near zero.
    pub compressed_memory_platform: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_image_memory: None,
            min_free_ram_ratio: DEFAULT_MIN_FREE_RAM_RATIO,
            compressed_memory_platform: cfg!(target_os = "macos"),
        }
    }
}

impl CacheConfig {
    /// Sets an explicit budget in megabytes. `0` means unlimited.
    pub fn with_budget_mb(self, mb: u64) -> Self {
        self.with_budget_bytes(mb * 1024 * 1024)
    }

    /// Sets an explicit budget in bytes. `0` means unlimited.
    pub fn with_budget_bytes(mut self, bytes: u64) -> Self {
        self.max_image_memory = (bytes != 0).then_some(bytes);
        self
    }

    /// Removes any explicit budget; the headroom policy governs.
    pub fn unlimited(mut self) -> Self {
        self.max_image_memory = None;
        self
    }

    /// Sets the headroom ratio, clamped to `0.0..=1.0`.
    pub fn with_min_free_ram_ratio(mut self, ratio: f64) -> Self {
        self.min_free_ram_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Overrides the compressed-memory platform detection.
    pub fn with_compressed_memory_platform(mut self, enabled: bool) -> Self {
        self.compressed_memory_platform = enabled;
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// `SEQVIEW_IMAGE_CACHE_MB` sets the explicit budget in megabytes.
    /// Absent or `0` leaves the budget unlimited.
    ///
    /// # Errors
    /// Returns an error if the variable is set to a non-numeric value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = env::var(ENV_IMAGE_CACHE_MB) {
            let mb: u64 = val
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(ENV_IMAGE_CACHE_MB.to_string()))?;
            config.max_image_memory = (mb != 0).then(|| mb * 1024 * 1024);
        }

        Ok(config)
    }

    /// Returns the explicit budget in megabytes, if one is configured.
    pub fn budget_mb(&self) -> Option<u64> {
        self.max_image_memory.map(|bytes| bytes / (1024 * 1024))
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration key.
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
}
