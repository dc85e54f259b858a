//! Error types for Tessera

use std::collections::BTreeMap;
use thiserror::Error;

/// Context information for errors to aid in debugging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Operation that was being performed when the error occurred
    pub operation: String,
    /// Component or module where the error occurred
    pub component: String,
    /// Additional contextual data
    pub metadata: BTreeMap<String, String>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            component: component.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the context
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Format context for logging
    pub fn format_for_log(&self) -> String {
        let mut parts = vec![
            format!("operation={}", self.operation),
            format!("component={}", self.component),
        ];

        if !self.metadata.is_empty() {
            let metadata_str = self
                .metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("metadata=[{}]", metadata_str));
        }

        parts.join(", ")
    }
}

/// Main error type for Tessera operations
#[derive(Debug, Error)]
pub enum TesseraError {
    /// The memory provider returned its null sentinel.
    #[error("Out of memory: {message}")]
    OutOfMemory {
        message: String,
        context: Option<ErrorContext>,
    },

    /// The device was lost during submission, acquisition or presentation.
    #[error("Device lost: {message}")]
    DeviceLost {
        message: String,
        context: Option<ErrorContext>,
    },

    /// The presentable surface no longer matches the swapchain.
    #[error("Surface outdated: {message}")]
    SurfaceOutdated {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Timed out: {message}")]
    Timeout {
        message: String,
        context: Option<ErrorContext>,
    },

    /// A write or copy range exceeds the allocation it targets.
    #[error("Invalid range: {message}")]
    InvalidRange {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Invalid argument: {message}")]
    InvalidArgument {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Backend error: {message}")]
    Backend {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Initialization error: {message}")]
    Initialization {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

macro_rules! constructors {
    ($($variant:ident => $plain:ident, $with_ctx:ident;)*) => {
        impl TesseraError {
            $(
                pub fn $plain<S: Into<String>>(msg: S) -> Self {
                    Self::$variant {
                        message: msg.into(),
                        context: None,
                    }
                }

                pub fn $with_ctx<S: Into<String>>(msg: S, context: ErrorContext) -> Self {
                    Self::$variant {
                        message: msg.into(),
                        context: Some(context),
                    }
                }
            )*
        }
    };
}

constructors! {
    OutOfMemory => out_of_memory, out_of_memory_with_context;
    DeviceLost => device_lost, device_lost_with_context;
    SurfaceOutdated => surface_outdated, surface_outdated_with_context;
    Timeout => timeout, timeout_with_context;
    InvalidRange => invalid_range, invalid_range_with_context;
    InvalidArgument => invalid_argument, invalid_argument_with_context;
    Backend => backend, backend_with_context;
    Configuration => configuration, configuration_with_context;
    Initialization => initialization, initialization_with_context;
}

impl TesseraError {
    /// Get the error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::OutOfMemory { context, .. }
            | Self::DeviceLost { context, .. }
            | Self::SurfaceOutdated { context, .. }
            | Self::Timeout { context, .. }
            | Self::InvalidRange { context, .. }
            | Self::InvalidArgument { context, .. }
            | Self::Backend { context, .. }
            | Self::Configuration { context, .. }
            | Self::Initialization { context, .. } => context.as_ref(),
            Self::Io(_) => None,
        }
    }

    /// Whether the frame synchronizer can recover from this error locally by
    /// rebuilding the swapchain.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost { .. } | Self::SurfaceOutdated { .. })
    }

    /// Out-of-memory conditions reported by a memory provider.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Caller contract violations. These abort the operation and are never retried.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, Self::InvalidRange { .. } | Self::InvalidArgument { .. })
    }

    /// Format error with context for logging
    pub fn format_for_log(&self) -> String {
        let base_msg = self.to_string();
        if let Some(context) = self.context() {
            format!("{} [{}]", base_msg, context.format_for_log())
        } else {
            base_msg
        }
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        TesseraError::configuration(format!("invalid configuration document: {}", err))
    }
}

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;
