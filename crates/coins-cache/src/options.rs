/// Default memory budget of a coins cache, matching the default `-dbcache` of Bitcoin Core.
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 450 << 20;

/// Configuration options for a [`CoinsCache`](crate::CoinsCache).
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Memory usage above which the cache asks to be flushed.
    pub max_memory_bytes: usize,

    /// Drop flushed entries from memory instead of keeping them as clean entries.
    pub evict_on_flush: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            evict_on_flush: false,
        }
    }
}

impl CacheOptions {
    /// Create new cache options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for configuring cache options
    pub fn builder() -> CacheOptionsBuilder {
        CacheOptionsBuilder::default()
    }
}

/// Builder pattern for CacheOptions
#[derive(Default)]
pub struct CacheOptionsBuilder {
    options: CacheOptions,
}

impl CacheOptionsBuilder {
    /// Set the memory budget in bytes
    pub fn max_memory_bytes(mut self, bytes: usize) -> Self {
        self.options.max_memory_bytes = bytes;
        self
    }

    /// Set the memory budget in MiB
    pub fn max_memory_mb(mut self, mb: usize) -> Self {
        self.options.max_memory_bytes = mb << 20;
        self
    }

    /// Set whether flushed entries are evicted
    pub fn evict_on_flush(mut self, evict: bool) -> Self {
        self.options.evict_on_flush = evict;
        self
    }

    /// Build the final CacheOptions
    pub fn build(self) -> CacheOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_options_builder() {
        let options = CacheOptions::builder()
            .max_memory_mb(16)
            .evict_on_flush(true)
            .build();

        assert_eq!(options.max_memory_bytes, 16 * 1024 * 1024);
        assert!(options.evict_on_flush);
    }

    #[test]
    fn test_cache_options_defaults() {
        let options = CacheOptions::default();

        assert_eq!(options.max_memory_bytes, 450 * 1024 * 1024);
        assert!(!options.evict_on_flush);
    }
}
