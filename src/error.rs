//! Error types for Indriya
//!
//! Every fallible hub operation returns [`Result`]. The RPC surface reports
//! failures as numeric codes via [`Error::code`], so callers can tell
//! "permission", "not found" and "hardware failure" apart.

use crate::core::types::SensorDescriptor;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric status reported across the client RPC boundary
pub type ErrorCode = i32;

/// Stable error codes
pub mod codes {
    use super::ErrorCode;

    pub const OK: ErrorCode = 0;
    pub const CONNECT_FAILED: ErrorCode = 1001;
    pub const NOT_INITIALIZED: ErrorCode = 1002;
    pub const INVALID_PARAMETER: ErrorCode = 1003;
    pub const NOT_FOUND: ErrorCode = 1004;
    pub const CHANNEL_ERROR: ErrorCode = 1005;
    pub const HARDWARE_FAILURE: ErrorCode = 1006;
    pub const PERMISSION_DENIED: ErrorCode = 201;
    pub const PARTIAL_FAILURE: ErrorCode = 1007;
    pub const DECODE_ERROR: ErrorCode = 1008;
    pub const NOT_SUPPORTED: ErrorCode = 1009;
    pub const INTERNAL: ErrorCode = 1010;
}

/// Indriya error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Driver unreachable after the full retry budget
    #[error("Driver connect failed after {attempts} attempts")]
    ConnectFailed {
        /// Number of connect attempts made
        attempts: u32,
    },

    /// Call made before a successful connect
    #[error("Driver connection not initialized")]
    NotInitialized,

    /// Descriptor is malformed or unknown to the sensor map
    #[error("Invalid sensor descriptor: {0}")]
    InvalidDescriptor(SensorDescriptor),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Lookup miss (pid, channel, session, subscription)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create/send/receive failure on a client channel
    #[error("Channel error: {0}")]
    Channel(String),

    /// Driver returned a failure for enable/disable/set-batch/set-mode
    #[error("Driver call failed: {0}")]
    DriverCallFailed(String),

    /// Driver call timed out
    #[error("Driver call timed out")]
    Timeout,

    /// Access-control collaborator denied the call
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Some entries of a batch operation failed
    #[error("Partial failure: {failed} of {total} entries failed")]
    PartialFailure {
        /// Entries that failed
        failed: usize,
        /// Entries attempted
        total: usize,
    },

    /// Malformed bytes on the wire
    #[error("Decode error: {0}")]
    Decode(String),

    /// Operation not supported by this backend
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// TOML parse error
    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("Config serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Thread panic
    #[error("Thread panicked")]
    ThreadPanic,

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Numeric code for the RPC boundary
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConnectFailed { .. } => codes::CONNECT_FAILED,
            Error::NotInitialized => codes::NOT_INITIALIZED,
            Error::InvalidDescriptor(_) | Error::InvalidParameter(_) => codes::INVALID_PARAMETER,
            Error::NotFound(_) => codes::NOT_FOUND,
            Error::Channel(_) | Error::Io(_) => codes::CHANNEL_ERROR,
            Error::DriverCallFailed(_) | Error::Timeout => codes::HARDWARE_FAILURE,
            Error::PermissionDenied(_) => codes::PERMISSION_DENIED,
            Error::PartialFailure { .. } => codes::PARTIAL_FAILURE,
            Error::Decode(_) => codes::DECODE_ERROR,
            Error::NotSupported(_) => codes::NOT_SUPPORTED,
            Error::TomlDe(_) | Error::TomlSer(_) | Error::ThreadPanic | Error::Other(_) => {
                codes::INTERNAL
            }
        }
    }
}

/// Collapse a hub result into the numeric status returned to clients
pub fn to_code(result: &Result<()>) -> ErrorCode {
    match result {
        Ok(()) => codes::OK,
        Err(e) => e.code(),
    }
}
