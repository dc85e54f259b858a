//! Core functionality for Tessera
//!
//! Errors, configuration, category logging and the integer geometry shared by
//! the allocator and synchronization crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{AtlasConfig, ConfigManager, FrameConfig, LoggingConfig, MemoryConfig, TesseraConfig};
pub use error::{ErrorContext, Result, TesseraError};
pub use logging::{LogCategory, LogLevel};
pub use types::Region;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        config::TesseraConfig,
        error::{Result, TesseraError},
        logging::{LogCategory, LogLevel},
        types::Region,
    };
}

/// Framework version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging from the given configuration and install it as the
/// process-wide [`ConfigManager`]
pub fn init(config: &TesseraConfig) -> Result<()> {
    config.validate()?;
    logging::init(&config.logging);
    ConfigManager::install(config.clone());

    tracing::info!("Tessera Core v{} initialized", VERSION);
    Ok(())
}
