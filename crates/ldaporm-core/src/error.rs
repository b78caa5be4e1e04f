//! Directory engine error types
//!
//! Error definitions classified by how callers are expected to react:
//! configuration and usage errors are caller bugs, connectivity errors are
//! surfaced untouched, protocol errors may be recovered by falling back to a
//! simpler retrieval strategy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric result code returned by a directory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    pub const OPERATIONS_ERROR: ResultCode = ResultCode(1);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(2);
    pub const TIME_LIMIT_EXCEEDED: ResultCode = ResultCode(3);
    pub const SIZE_LIMIT_EXCEEDED: ResultCode = ResultCode(4);
    pub const UNAVAILABLE_CRITICAL_EXTENSION: ResultCode = ResultCode(12);
    pub const NO_SUCH_OBJECT: ResultCode = ResultCode(32);
    pub const INVALID_CREDENTIALS: ResultCode = ResultCode(49);
    pub const BUSY: ResultCode = ResultCode(51);
    pub const UNAVAILABLE: ResultCode = ResultCode(52);
    pub const UNWILLING_TO_PERFORM: ResultCode = ResultCode(53);
    pub const SORT_CONTROL_MISSING: ResultCode = ResultCode(60);
    pub const OFFSET_RANGE_ERROR: ResultCode = ResultCode(61);
    pub const ALREADY_EXISTS: ResultCode = ResultCode(68);
    pub const OTHER: ResultCode = ResultCode(80);
    /// Client-side code used when the local library refuses a request.
    pub const NOT_SUPPORTED: ResultCode = ResultCode(92);

    /// Short symbolic name for logging.
    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            3 => "timeLimitExceeded",
            4 => "sizeLimitExceeded",
            12 => "unavailableCriticalExtension",
            32 => "noSuchObject",
            49 => "invalidCredentials",
            51 => "busy",
            52 => "unavailable",
            53 => "unwillingToPerform",
            60 => "sortControlMissing",
            61 => "offsetRangeError",
            68 => "entryAlreadyExists",
            80 => "other",
            92 => "notSupported",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Error that can occur while talking to a directory server.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Configuration errors
    /// Configuration is missing, malformed or inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    // Connectivity errors
    /// Failed to reach or talk to the server.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection timed out.
    #[error("connection timeout after {timeout_secs} seconds")]
    ConnectionTimeout { timeout_secs: u64 },

    /// The server rejected the bind.
    #[error("authentication failed for {bind_dn}: invalid credentials")]
    AuthenticationFailed { bind_dn: String },

    // Protocol errors
    /// The server answered with a non-success result code.
    #[error("directory error {code}: {message}")]
    Protocol { code: ResultCode, message: String },

    /// A request control could not be built from the given parameters.
    #[error("control encoding failed: {message}")]
    ControlEncoding { message: String },

    // Usage errors
    /// Field name is not declared on the model.
    #[error("invalid field '{field}' for model {model}")]
    InvalidField { field: String, model: String },

    /// Lookup suffix is not one of the supported comparisons.
    #[error("unknown filter suffix in '{lookup}'")]
    UnknownSuffix { lookup: String },

    /// Operand has the wrong shape for the requested lookup.
    #[error("invalid value: {message}")]
    InvalidValue { message: String },

    /// Operand or field kind does not support the requested comparison.
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    /// Builder methods were combined in an unsupported way.
    #[error("invalid usage: {message}")]
    Usage { message: String },

    /// A query was evaluated without any filter clause.
    #[error("no filter specified for {model}")]
    NoFilterSpecified { model: String },

    // Named outcomes
    /// `get()` matched nothing.
    #[error("{model} matching query does not exist")]
    DoesNotExist { model: String },

    /// `get()` matched more than one entry.
    #[error("get() returned more than one {model} ({count} found)")]
    MultipleObjectsReturned { model: String, count: usize },

    /// Indexed access past the end of the result set.
    #[error("index {index} out of range for {model}")]
    IndexOutOfRange { model: String, index: isize },

    // Mutation errors
    /// Target entry of a mutation does not exist.
    #[error("object not found: {dn}")]
    ObjectNotFound { dn: String },

    /// Entry to be added already exists.
    #[error("object already exists: {dn}")]
    ObjectAlreadyExists { dn: String },

    /// Any other failure.
    #[error("operation failed: {message}")]
    OperationFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl DirectoryError {
    /// Server unreachable, timed out or bind rejected.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DirectoryError::ConnectionFailed { .. }
                | DirectoryError::ConnectionTimeout { .. }
                | DirectoryError::AuthenticationFailed { .. }
        )
    }

    /// Configuration problem; never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, DirectoryError::InvalidConfiguration { .. })
    }

    /// Caller bug detected while building a query.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            DirectoryError::InvalidField { .. }
                | DirectoryError::UnknownSuffix { .. }
                | DirectoryError::InvalidValue { .. }
                | DirectoryError::TypeMismatch { .. }
                | DirectoryError::Usage { .. }
                | DirectoryError::NoFilterSpecified { .. }
        )
    }

    /// Lookup or indexing found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DirectoryError::DoesNotExist { .. }
                | DirectoryError::IndexOutOfRange { .. }
                | DirectoryError::ObjectNotFound { .. }
        )
    }

    /// Whether a retrieval strategy may recover by retrying with a simpler one.
    ///
    /// Every server-reported protocol failure qualifies (the named
    /// not-supported, unwilling-to-perform and protocol-error codes as well as
    /// the catch-all), and so does a control that could not be encoded locally.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            DirectoryError::Protocol { .. } | DirectoryError::ControlEncoding { .. }
        )
    }

    /// Result code carried by a protocol error.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            DirectoryError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            DirectoryError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            DirectoryError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            DirectoryError::AuthenticationFailed { .. } => "AUTH_FAILED",
            DirectoryError::Protocol { .. } => "PROTOCOL_ERROR",
            DirectoryError::ControlEncoding { .. } => "CONTROL_ENCODING",
            DirectoryError::InvalidField { .. } => "INVALID_FIELD",
            DirectoryError::UnknownSuffix { .. } => "UNKNOWN_SUFFIX",
            DirectoryError::InvalidValue { .. } => "INVALID_VALUE",
            DirectoryError::TypeMismatch { .. } => "TYPE_MISMATCH",
            DirectoryError::Usage { .. } => "INVALID_USAGE",
            DirectoryError::NoFilterSpecified { .. } => "NO_FILTER",
            DirectoryError::DoesNotExist { .. } => "DOES_NOT_EXIST",
            DirectoryError::MultipleObjectsReturned { .. } => "MULTIPLE_OBJECTS",
            DirectoryError::IndexOutOfRange { .. } => "INDEX_OUT_OF_RANGE",
            DirectoryError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            DirectoryError::ObjectAlreadyExists { .. } => "OBJECT_EXISTS",
            DirectoryError::OperationFailed { .. } => "OPERATION_FAILED",
        }
    }

    // Convenience constructors

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        DirectoryError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error from a server result code.
    pub fn protocol(code: ResultCode, message: impl Into<String>) -> Self {
        DirectoryError::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Create a control encoding error.
    pub fn control_encoding(message: impl Into<String>) -> Self {
        DirectoryError::ControlEncoding {
            message: message.into(),
        }
    }

    /// Create an invalid value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        DirectoryError::InvalidValue {
            message: message.into(),
        }
    }

    /// Create a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        DirectoryError::Usage {
            message: message.into(),
        }
    }

    /// Create an operation failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        DirectoryError::OperationFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation failed error with source.
    pub fn operation_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::OperationFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
