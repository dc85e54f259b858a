//! Logging system for Tessera
//!
//! Category-based filtering and rate limiting layered over `tracing`. Every
//! message that passes the category filter is emitted as a `tracing` event on
//! the `tessera` target with a `category` field, so any subscriber can pick it up.

use crate::config::LoggingConfig;
use crate::error::TesseraError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Log levels supported by the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(TesseraError::configuration(format!("unknown log level '{}'", s))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    Core,
    Memory,
    Atlas,
    Upload,
    Frame,
    Backend,
}

impl LogCategory {
    pub const ALL: [LogCategory; 6] = [
        LogCategory::Core,
        LogCategory::Memory,
        LogCategory::Atlas,
        LogCategory::Upload,
        LogCategory::Frame,
        LogCategory::Backend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Core => "core",
            LogCategory::Memory => "memory",
            LogCategory::Atlas => "atlas",
            LogCategory::Upload => "upload",
            LogCategory::Frame => "frame",
            LogCategory::Backend => "backend",
        }
    }
}

impl FromStr for LogCategory {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| TesseraError::configuration(format!("unknown log category '{}'", s)))
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-window message budget of one category
#[derive(Debug)]
struct RateLimitState {
    window_start: Instant,
    count: u32,
}

impl RateLimitState {
    fn allow(&mut self, max_count: u32, window: Duration) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count < max_count {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Per-category level filter and rate limiter
#[derive(Debug)]
pub struct CategoryFilter {
    levels: HashMap<LogCategory, LogLevel>,
    max_count: u32,
    window: Duration,
    limiters: Mutex<HashMap<LogCategory, RateLimitState>>,
}

impl CategoryFilter {
    /// Build a filter from configuration. Unknown category names and
    /// unparsable levels are skipped; `TesseraConfig::validate` reports them.
    pub fn new(config: &LoggingConfig) -> Self {
        let levels = config
            .category_levels
            .iter()
            .filter_map(|(category, level)| Some((category.parse().ok()?, level.parse().ok()?)))
            .collect();

        Self {
            levels,
            max_count: config.max_rate_limit_count,
            window: Duration::from_secs(config.rate_limit_seconds),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Categories without a configured level log at `info` and above
    pub fn is_enabled(&self, category: LogCategory, level: LogLevel) -> bool {
        level >= self.levels.get(&category).copied().unwrap_or(LogLevel::Info)
    }

    pub fn allow_rate_limited(&self, category: LogCategory) -> bool {
        self.limiters
            .lock()
            .entry(category)
            .or_insert_with(|| RateLimitState {
                window_start: Instant::now(),
                count: 0,
            })
            .allow(self.max_count, self.window)
    }
}

static FILTER: OnceLock<RwLock<CategoryFilter>> = OnceLock::new();

/// Initialize the logging system.
///
/// Installs the category filter and, when `install_subscriber` is set, a
/// `tracing-subscriber` fmt subscriber honouring `RUST_LOG`. Calling it again
/// replaces the filter; the first subscriber stays active.
pub fn init(config: &LoggingConfig) {
    let filter = CategoryFilter::new(config);
    match FILTER.get() {
        Some(current) => *current.write() = filter,
        None => {
            let _ = FILTER.set(RwLock::new(filter));
        }
    }

    if config.install_subscriber {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init();
    }
}

/// Emit one message through the category filter. Used by the `tessera_*` macros.
pub fn log_internal(level: LogLevel, category: LogCategory, message: &str, rate_limited: bool) {
    if let Some(filter) = FILTER.get() {
        let filter = filter.read();
        if !filter.is_enabled(category, level) {
            return;
        }
        if rate_limited && !filter.allow_rate_limited(category) {
            return;
        }
    }

    let category = category.as_str();
    match level {
        LogLevel::Trace => tracing::trace!(target: "tessera", category, "{}", message),
        LogLevel::Debug => tracing::debug!(target: "tessera", category, "{}", message),
        LogLevel::Info => tracing::info!(target: "tessera", category, "{}", message),
        LogLevel::Warn => tracing::warn!(target: "tessera", category, "{}", message),
        LogLevel::Error => tracing::error!(target: "tessera", category, "{}", message),
    }
}

#[macro_export]
macro_rules! tessera_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Debug, $category, &format!($($arg)*), false);
    };
}

#[macro_export]
macro_rules! tessera_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Info, $category, &format!($($arg)*), false);
    };
}

#[macro_export]
macro_rules! tessera_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Warn, $category, &format!($($arg)*), false);
    };
}

#[macro_export]
macro_rules! tessera_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Error, $category, &format!($($arg)*), false);
    };
}

// Rate-limited variants for messages that can repeat every frame
#[macro_export]
macro_rules! tessera_warn_rate_limited {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Warn, $category, &format!($($arg)*), true);
    };
}

#[macro_export]
macro_rules! tessera_error_rate_limited {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Error, $category, &format!($($arg)*), true);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(levels: &[(&str, &str)], max_count: u32) -> LoggingConfig {
        LoggingConfig {
            category_levels: levels
                .iter()
                .map(|(c, l)| (c.to_string(), l.to_string()))
                .collect(),
            rate_limit_seconds: 60,
            max_rate_limit_count: max_count,
            install_subscriber: false,
        }
    }

    #[test]
    fn test_parse_levels_and_categories() {
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());

        assert_eq!("atlas".parse::<LogCategory>().unwrap(), LogCategory::Atlas);
        assert!("widgets".parse::<LogCategory>().is_err());
        assert_eq!(LogCategory::Upload.to_string(), "upload");
    }

    #[test]
    fn test_category_levels() {
        let filter = CategoryFilter::new(&config(&[("memory", "debug"), ("bogus", "trace")], 5));

        assert!(filter.is_enabled(LogCategory::Memory, LogLevel::Debug));
        assert!(filter.is_enabled(LogCategory::Memory, LogLevel::Error));
        assert!(!filter.is_enabled(LogCategory::Memory, LogLevel::Trace));
        // unconfigured categories fall back to info
        assert!(!filter.is_enabled(LogCategory::Frame, LogLevel::Debug));
        assert!(filter.is_enabled(LogCategory::Frame, LogLevel::Info));
    }

    #[test]
    fn test_rate_limit_is_per_category() {
        let filter = CategoryFilter::new(&config(&[], 2));

        assert!(filter.allow_rate_limited(LogCategory::Upload));
        assert!(filter.allow_rate_limited(LogCategory::Upload));
        assert!(!filter.allow_rate_limited(LogCategory::Upload));
        assert!(filter.allow_rate_limited(LogCategory::Frame));
    }

    #[test]
    fn test_window_resets_budget() {
        let mut state = RateLimitState {
            window_start: Instant::now(),
            count: 0,
        };
        let window = Duration::from_millis(50);

        assert!(state.allow(1, window));
        assert!(!state.allow(1, window));
        std::thread::sleep(Duration::from_millis(80));
        assert!(state.allow(1, window));
    }

    #[test]
    fn test_macros_accept_categories() {
        tessera_debug!(LogCategory::Memory, "page {} created", 3);
        tessera_warn_rate_limited!(LogCategory::Frame, "slow frame {}ms", 40);
    }
}
