//! Buffer pool configuration

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_MAX_CACHED_PER_CLASS, DEFAULT_MAX_SIZE_CLASS, DEFAULT_MIN_SIZE_CLASS};

/// Configuration for buffer pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Name of the buffer pool
    pub name: String,
    /// Smallest size class handed out; smaller requests are rounded up to it
    pub min_size_class: usize,
    /// Largest pooled size class; larger requests get an exact, unpooled allocation
    pub max_size_class: usize,
    /// Maximum number of idle backing stores retained per size class
    pub max_cached_per_class: usize,
    /// Zero backing stores when they are returned to the pool
    pub zero_on_release: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_size_class: DEFAULT_MIN_SIZE_CLASS,
            max_size_class: DEFAULT_MAX_SIZE_CLASS,
            max_cached_per_class: DEFAULT_MAX_CACHED_PER_CLASS,
            zero_on_release: false,
        }
    }
}

impl BufferPoolConfig {
    /// Create a new configuration with custom name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the minimum size class
    pub fn with_min_size_class(mut self, size: usize) -> Self {
        self.min_size_class = size;
        self
    }

    /// Set the maximum pooled size class
    pub fn with_max_size_class(mut self, size: usize) -> Self {
        self.max_size_class = size;
        self
    }

    /// Set how many idle stores each class retains
    pub fn with_max_cached_per_class(mut self, count: usize) -> Self {
        self.max_cached_per_class = count;
        self
    }

    /// Set zero-on-release behavior
    pub fn with_zero_on_release(mut self, zero: bool) -> Self {
        self.zero_on_release = zero;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::ScatterError;

        if self.min_size_class == 0 || !self.min_size_class.is_power_of_two() {
            return Err(ScatterError::invalid_parameter(
                "min_size_class",
                "Minimum size class must be a non-zero power of two",
            ));
        }

        if !self.max_size_class.is_power_of_two() {
            return Err(ScatterError::invalid_parameter(
                "max_size_class",
                "Maximum size class must be a power of two",
            ));
        }

        if self.min_size_class > self.max_size_class {
            return Err(ScatterError::invalid_parameter(
                "min_size_class",
                "Minimum size class cannot exceed maximum size class",
            ));
        }

        Ok(())
    }

    /// Size class a request of `length` bytes is served from, or `None` if unpooled
    pub fn size_class_for(&self, length: usize) -> Option<usize> {
        let class = length.max(self.min_size_class).checked_next_power_of_two()?;
        (class <= self.max_size_class).then_some(class)
    }

    /// Worst-case bytes retained by idle stores across all classes
    pub fn max_retained_bytes(&self) -> usize {
        let mut total = 0usize;
        let mut class = self.min_size_class;
        while class <= self.max_size_class {
            total = total.saturating_add(class.saturating_mul(self.max_cached_per_class));
            class = match class.checked_mul(2) {
                Some(next) => next,
                None => break,
            };
        }
        total
    }
}

/// Builder pattern for buffer pool configuration
pub struct BufferPoolConfigBuilder {
    config: BufferPoolConfig,
}

impl BufferPoolConfigBuilder {
    /// Create a new builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: BufferPoolConfig::new(name),
        }
    }

    /// Set minimum size class
    pub fn min_size_class(mut self, size: usize) -> Self {
        self.config.min_size_class = size;
        self
    }

    /// Set maximum size class
    pub fn max_size_class(mut self, size: usize) -> Self {
        self.config.max_size_class = size;
        self
    }

    /// Set idle stores retained per class
    pub fn max_cached_per_class(mut self, count: usize) -> Self {
        self.config.max_cached_per_class = count;
        self
    }

    /// Zero stores on release
    pub fn zero_on_release(mut self, enable: bool) -> Self {
        self.config.zero_on_release = enable;
        self
    }

    /// Build the configuration
    pub fn build(self) -> crate::error::Result<BufferPoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes() {
        let config = BufferPoolConfig::new("classes")
            .with_min_size_class(64)
            .with_max_size_class(4096);

        assert_eq!(config.size_class_for(1), Some(64));
        assert_eq!(config.size_class_for(64), Some(64));
        assert_eq!(config.size_class_for(65), Some(128));
        assert_eq!(config.size_class_for(4096), Some(4096));
        assert_eq!(config.size_class_for(4097), None);
    }

    #[test]
    fn test_builder_validation() {
        assert!(BufferPoolConfigBuilder::new("bad").min_size_class(0).build().is_err());
        assert!(BufferPoolConfigBuilder::new("bad").min_size_class(100).build().is_err());
        assert!(BufferPoolConfigBuilder::new("bad")
            .min_size_class(8192)
            .max_size_class(4096)
            .build()
            .is_err());

        let config = BufferPoolConfigBuilder::new("ok")
            .min_size_class(16)
            .max_size_class(64)
            .max_cached_per_class(2)
            .build()
            .unwrap();
        assert_eq!(config.max_retained_bytes(), (16 + 32 + 64) * 2);
    }
}
