use thiserror::Error;

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Numeric error codes shared with every client library release.
///
/// These values travel across the C ABI unchanged, so they are stable across
/// releases. The facade only interprets the handful it needs for its own
/// control flow; everything else is passed through as [`ClientError::Client`].
pub mod codes {
    pub const TIMED_OUT: i32 = 1004;
    pub const TRANSACTION_TOO_OLD: i32 = 1007;
    pub const FUTURE_VERSION: i32 = 1009;
    pub const NOT_COMMITTED: i32 = 1020;
    pub const COMMIT_UNKNOWN_RESULT: i32 = 1021;
    pub const TRANSACTION_CANCELLED: i32 = 1025;
    pub const OPERATION_CANCELLED: i32 = 1101;
    pub const CLUSTER_VERSION_CHANGED: i32 = 1190;
    pub const UNSUPPORTED_OPERATION: i32 = 1500;
    pub const OPTION_NOT_SUPPORTED: i32 = 1501;
    pub const ENVIRONMENT_VARIABLE_INVALID: i32 = 1502;
    pub const IO_ERROR: i32 = 1510;
    pub const NETWORK_NOT_SETUP: i32 = 2008;
    pub const NETWORK_ALREADY_SETUP: i32 = 2009;
    pub const NO_CLIENTS_AVAILABLE: i32 = 2011;
    pub const LIBRARY_NOT_FOUND: i32 = 2101;
    pub const SYMBOL_MISSING: i32 = 2102;
    pub const INVALID_CLIENT_VERSION: i32 = 2103;
    pub const NULL_POINTER: i32 = 2104;
    pub const API_VERSION_NOT_SUPPORTED: i32 = 2200;
    pub const API_VERSION_ALREADY_SET: i32 = 2201;
    pub const API_VERSION_NOT_SET: i32 = 2202;
    pub const ALREADY_INITIALIZED: i32 = 2203;
}

/// Errors surfaced by the multi-version client facade.
///
/// The enum is `Clone` because failures of shared, lazily resolved resources
/// (for example a legacy database handle still materializing) are fanned out
/// to every waiter.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("client library not found: {0}")]
    LibraryNotFound(String),

    #[error("symbol missing from client library: {0}")]
    SymbolMissing(&'static str),

    #[error("operation not supported by the loaded client")]
    UnsupportedOperation,

    #[error("option not supported by the loaded client")]
    UnsupportedOption,

    #[error("api version {0} is outside the supported range")]
    ApiVersionNotSupported(i32),

    #[error("api version has already been selected")]
    ApiVersionAlreadySet,

    #[error("api version must be selected first")]
    ApiVersionNotSet,

    #[error("the multi-version api has already been initialized in this process")]
    AlreadyInitialized,

    #[error("the network has already been set up")]
    NetworkAlreadySetup,

    #[error("the network has not been set up")]
    NetworkNotSetup,

    #[error("no usable client implementations are available")]
    NoClientsAvailable,

    #[error("the cluster protocol version changed")]
    ClusterVersionChanged,

    #[error("the transaction was cancelled")]
    TransactionCancelled,

    #[error("invalid client version string: {0}")]
    InvalidClientVersion(String),

    #[error("invalid option value: {0}")]
    InvalidOptionValue(String),

    #[error("null pointer returned from client library")]
    NullPointer,

    #[error("invalid C string: {0}")]
    InvalidCString(#[from] std::ffi::NulError),

    #[error("io error: {0}")]
    Io(String),

    #[error("client error {0}")]
    Client(i32),
}

impl ClientError {
    /// Classify a nonzero code coming back over the C ABI.
    pub fn from_code(code: i32) -> ClientError {
        match code {
            codes::UNSUPPORTED_OPERATION => ClientError::UnsupportedOperation,
            codes::OPTION_NOT_SUPPORTED => ClientError::UnsupportedOption,
            codes::TRANSACTION_CANCELLED => ClientError::TransactionCancelled,
            codes::CLUSTER_VERSION_CHANGED => ClientError::ClusterVersionChanged,
            codes::NETWORK_NOT_SETUP => ClientError::NetworkNotSetup,
            codes::NETWORK_ALREADY_SETUP => ClientError::NetworkAlreadySetup,
            other => ClientError::Client(other),
        }
    }

    /// The numeric code for this error, suitable for handing to a client's
    /// `on_error` entry point.
    pub fn code(&self) -> i32 {
        match self {
            ClientError::LibraryNotFound(_) => codes::LIBRARY_NOT_FOUND,
            ClientError::SymbolMissing(_) => codes::SYMBOL_MISSING,
            ClientError::UnsupportedOperation => codes::UNSUPPORTED_OPERATION,
            ClientError::UnsupportedOption => codes::OPTION_NOT_SUPPORTED,
            ClientError::ApiVersionNotSupported(_) => codes::API_VERSION_NOT_SUPPORTED,
            ClientError::ApiVersionAlreadySet => codes::API_VERSION_ALREADY_SET,
            ClientError::ApiVersionNotSet => codes::API_VERSION_NOT_SET,
            ClientError::AlreadyInitialized => codes::ALREADY_INITIALIZED,
            ClientError::NetworkAlreadySetup => codes::NETWORK_ALREADY_SETUP,
            ClientError::NetworkNotSetup => codes::NETWORK_NOT_SETUP,
            ClientError::NoClientsAvailable => codes::NO_CLIENTS_AVAILABLE,
            ClientError::ClusterVersionChanged => codes::CLUSTER_VERSION_CHANGED,
            ClientError::TransactionCancelled => codes::TRANSACTION_CANCELLED,
            ClientError::InvalidClientVersion(_) => codes::INVALID_CLIENT_VERSION,
            ClientError::InvalidOptionValue(_) => codes::ENVIRONMENT_VARIABLE_INVALID,
            ClientError::NullPointer => codes::NULL_POINTER,
            ClientError::InvalidCString(_) => codes::INVALID_CLIENT_VERSION,
            ClientError::Io(_) => codes::IO_ERROR,
            ClientError::Client(code) => *code,
        }
    }

    /// Whether a retry loop driven through `on_error` may see this succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Client(
                codes::TIMED_OUT
                    | codes::TRANSACTION_TOO_OLD
                    | codes::FUTURE_VERSION
                    | codes::NOT_COMMITTED
                    | codes::COMMIT_UNKNOWN_RESULT
            )
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip_for_wire_errors() {
        for code in [
            codes::UNSUPPORTED_OPERATION,
            codes::OPTION_NOT_SUPPORTED,
            codes::TRANSACTION_CANCELLED,
            codes::CLUSTER_VERSION_CHANGED,
        ] {
            assert_eq!(ClientError::from_code(code).code(), code);
        }
        assert_eq!(ClientError::from_code(1234).code(), 1234);
    }

    #[test]
    fn retryable_classification() {
        assert!(ClientError::Client(codes::TIMED_OUT).is_retryable());
        assert!(ClientError::Client(codes::NOT_COMMITTED).is_retryable());
        assert!(!ClientError::TransactionCancelled.is_retryable());
        assert!(!ClientError::Client(codes::OPERATION_CANCELLED).is_retryable());
    }
}
