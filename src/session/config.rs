//! Session configuration

use crate::{
    buffers::BufferPoolConfig,
    error::{Result, ScatterError},
    transport::ScatterFlags,
};

/// Configuration applied when opening a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Human-readable session name used in logs
    pub name: String,
    /// Flags used by request sets and round maps created without explicit flags
    pub default_flags: ScatterFlags,
    /// Dedicated result-buffer pool; `None` uses the process-wide shared pool
    pub buffer_pool: Option<BufferPoolConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            default_flags: ScatterFlags::empty(),
            buffer_pool: None,
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with custom name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set default batch flags
    pub fn with_default_flags(mut self, flags: ScatterFlags) -> Self {
        self.default_flags = flags;
        self
    }

    /// Give the session its own buffer pool
    pub fn with_buffer_pool(mut self, config: BufferPoolConfig) -> Self {
        self.buffer_pool = Some(config);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ScatterError::invalid_parameter(
                "name",
                "Session name cannot be empty",
            ));
        }
        if let Some(pool) = &self.buffer_pool {
            pool.validate()?;
        }
        Ok(())
    }
}
