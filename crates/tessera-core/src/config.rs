//! Configuration system for Tessera

use crate::error::{Result, TesseraError};
use crate::logging::{LogCategory, LogLevel};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Global configuration for Tessera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Linear sub-allocator settings
    pub memory: MemoryConfig,
    /// Atlas packer settings
    pub atlas: AtlasConfig,
    /// Frame pacing settings
    pub frame: FrameConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Category-specific log levels (category name -> level string)
    pub category_levels: HashMap<String, String>,
    /// Rate limiting duration in seconds
    pub rate_limit_seconds: u64,
    /// Maximum number of messages before rate limiting kicks in
    pub max_rate_limit_count: u32,
    /// Install a `tracing-subscriber` fmt layer on `logging::init`
    pub install_subscriber: bool,
}

/// Linear sub-allocator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size in bytes of every page requested from the memory provider,
    /// unless a single request is larger
    pub default_page_size: u64,
}

/// Atlas packer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Edge length of every atlas surface, unless a single request is larger
    pub default_page_size: u32,
    /// Number of empty pages kept resident instead of being released
    pub retained_empty_pages: usize,
}

/// Frame synchronizer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Number of frames the CPU may record ahead of the GPU
    pub max_frames_in_flight: usize,
    /// Fence wait bound used while recovering from device loss
    pub device_loss_timeout_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut category_levels = HashMap::new();

        category_levels.insert("core".to_string(), "info".to_string());
        category_levels.insert("memory".to_string(), "info".to_string());
        category_levels.insert("atlas".to_string(), "info".to_string());
        category_levels.insert("upload".to_string(), "info".to_string());
        category_levels.insert("frame".to_string(), "warn".to_string()); // per-frame noise
        category_levels.insert("backend".to_string(), "info".to_string());

        Self {
            category_levels,
            rate_limit_seconds: 5,
            max_rate_limit_count: 10,
            install_subscriber: true,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 16 * 1024 * 1024,
        }
    }
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            default_page_size: 2048,
            retained_empty_pages: 1,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            device_loss_timeout_ms: 1000,
        }
    }
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            memory: MemoryConfig::default(),
            atlas: AtlasConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl TesseraConfig {
    /// Parse a configuration from a JSON document. Missing fields take their defaults.
    pub fn from_json(source: &str) -> Result<Self> {
        let config: TesseraConfig = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&source)
    }

    /// Serialize the configuration as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the allocators and synchronizer cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.memory.default_page_size == 0 {
            return Err(TesseraError::configuration(
                "memory.default_page_size must be non-zero",
            ));
        }
        if self.atlas.default_page_size == 0 {
            return Err(TesseraError::configuration(
                "atlas.default_page_size must be non-zero",
            ));
        }
        if self.frame.max_frames_in_flight == 0 {
            return Err(TesseraError::configuration(
                "frame.max_frames_in_flight must be at least 1",
            ));
        }
        for (category, level) in &self.logging.category_levels {
            category.parse::<LogCategory>()?;
            level.parse::<LogLevel>().map_err(|_| {
                TesseraError::configuration(format!(
                    "unknown log level '{}' for category '{}'",
                    level, category
                ))
            })?;
        }
        Ok(())
    }
}

/// Global configuration manager
pub struct ConfigManager {
    config: Arc<RwLock<TesseraConfig>>,
}

static CONFIG_MANAGER: OnceLock<ConfigManager> = OnceLock::new();

impl ConfigManager {
    /// Create a new configuration manager with default settings
    pub fn new() -> Self {
        Self::with_config(TesseraConfig::default())
    }

    /// Create a configuration manager with custom config
    pub fn with_config(config: TesseraConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Install the process-wide manager. Returns the installed instance, which is
    /// the earlier one if a manager was already installed.
    pub fn install(config: TesseraConfig) -> &'static ConfigManager {
        CONFIG_MANAGER.get_or_init(|| ConfigManager::with_config(config))
    }

    /// Get the global configuration manager instance
    pub fn instance() -> Option<&'static ConfigManager> {
        CONFIG_MANAGER.get()
    }

    /// Get a copy of the current configuration
    pub fn get_config(&self) -> TesseraConfig {
        self.config.read().clone()
    }

    /// Update the configuration. The update is discarded if it fails validation.
    pub fn update_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut TesseraConfig),
    {
        let mut candidate = self.get_config();
        updater(&mut candidate);
        candidate.validate()?;
        *self.config.write() = candidate;
        Ok(())
    }

    /// Get the current logging configuration
    pub fn get_logging_config(&self) -> LoggingConfig {
        self.config.read().logging.clone()
    }

    /// Set log level for a specific category
    pub fn set_category_level(&self, category: &str, level: &str) -> Result<()> {
        self.update_config(|config| {
            config
                .logging
                .category_levels
                .insert(category.to_string(), level.to_string());
        })
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
