//! Centralized error types for connection brokering and streams
//!
//! All errors are represented by the `StreamError` enum.
//! Use `Result<T>` as shorthand for `std::result::Result<T, StreamError>`.
//!
//! Native transport failures never cross a bridge boundary as-is: every
//! connector translates them into one of these variants first.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// All connection and stream errors
#[derive(Debug)]
pub enum StreamError {
    // === Validation ===
    /// The target URL is syntactically invalid or lacks required fields
    InvalidUrl { url: String, reason: String },
    /// No connector is registered for the URL scheme
    UnsupportedScheme { scheme: String },

    // === Broker ===
    /// A connection attempt for this target is already pending
    ConnectionInProgress { url: String },
    /// The attempt was cancelled by the caller
    Cancelled,
    /// The attempt did not complete within the configured deadline
    Timeout { after: Duration },

    // === Transport ===
    /// The addressed device or path does not exist
    NotFound { target: String },
    /// The native stack refused or failed the connection
    UnableToConnect {
        reason: String,
        /// Native status code, when the stack reports one
        status: Option<i32>,
    },

    // === Stream ===
    /// Read or write on a stream that is not open
    NotOpen,
    /// A write is still outstanding on a single-slot output stream
    WritePending,
    /// The native write primitive reported a failure
    WriteFailed { reason: String },
    /// The underlying link went away
    Disconnected,

    // === Config ===
    /// Config file could not be read or written
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Invalid config value
    ConfigValidation { field: &'static str, reason: String },
}

impl StreamError {
    /// Shorthand for an `InvalidUrl` error
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an `UnableToConnect` error without a native status
    pub fn unable_to_connect(reason: impl Into<String>) -> Self {
        Self::UnableToConnect {
            reason: reason.into(),
            status: None,
        }
    }

    /// True for errors raised before any native side effect
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. } | Self::UnsupportedScheme { .. }
        )
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigRead { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl { url, reason } => write!(f, "Invalid URL '{}': {}", url, reason),
            Self::UnsupportedScheme { scheme } => write!(f, "Unsupported scheme: {}", scheme),
            Self::ConnectionInProgress { url } => {
                write!(f, "Connection to {} already in progress", url)
            }
            Self::Cancelled => write!(f, "Connection cancelled"),
            Self::Timeout { after } => {
                write!(f, "Connection timed out after {} ms", after.as_millis())
            }
            Self::NotFound { target } => write!(f, "Not found: {}", target),
            Self::UnableToConnect { reason, status } => match status {
                Some(code) => write!(f, "Unable to connect: {} (status {})", reason, code),
                None => write!(f, "Unable to connect: {}", reason),
            },
            Self::NotOpen => write!(f, "Stream is not open"),
            Self::WritePending => write!(f, "A write is already pending"),
            Self::WriteFailed { reason } => write!(f, "Write failed: {}", reason),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::ConfigRead { path, .. } => write!(f, "Cannot access config: {}", path.display()),
            Self::ConfigValidation { field, reason } => {
                write!(f, "Invalid {}: {}", field, reason)
            }
        }
    }
}

/// Alias for Result with StreamError
pub type Result<T> = std::result::Result<T, StreamError>;
