//! Error handling for sptape.
//!
//! One error type for the whole crate, categorized by gRPC status codes so
//! that callers can decide on retries without inspecting the cause:
//!
//! * Connection failures while dialing an access point (`Unavailable`,
//!   `Aborted`, `DeadlineExceeded`) move on to the next candidate
//! * Login rejection and bad server signatures (`Unauthenticated`,
//!   `PermissionDenied`) are fatal for the connection
//! * MAC mismatches on the packet channel and truncated media are
//!   `DataLoss`
//! * A key server refusing a key is `NotFound`
//!
//! # Example
//!
//! ```rust
//! use sptape::error::{Error, ErrorKind, Result};
//!
//! fn open(path: &str) -> Result<std::fs::File> {
//!     if path.is_empty() {
//!         return Err(Error::invalid_argument("empty path"));
//!     }
//!     Ok(std::fs::File::open(path)?)
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
///
/// Provides:
/// * Categorized error types ([`ErrorKind`])
/// * Underlying error details
/// * Conversion from common error types
/// * HTTP status code mapping
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// Allows accessing the original error when its concrete type is known.
    ///
    /// # Arguments
    /// * `E` - The target error type to downcast to
    ///
    /// # Returns
    /// * `Some(&E)` - If the underlying error is of type `E`
    /// * `None` - If the underlying error is not of type `E`
    ///
    /// # Example
    /// ```
    /// use std::io;
    ///
    /// let io_error = io::Error::new(io::ErrorKind::Other, "oh no!");
    /// let error = Error::from(io_error);
    ///
    /// if let Some(io_err) = error.downcast::<io::Error>() {
    ///     println!("IO error kind: {:?}", io_err.kind());
    /// }
    /// ```
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

/// Standard result type for sptape operations.
///
/// Wraps the standard `Result` type with our custom [`struct@Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// Each variant:
/// * Maps to a specific HTTP status code
/// * Represents a distinct failure category
/// * Carries a standard error message
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// HTTP Mapping: 499 Client Closed Request
    #[error("operation was cancelled")]
    Cancelled = 1,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("unknown error")]
    Unknown = 2,

    /// HTTP Mapping: 400 Bad Request
    #[error("invalid argument specified")]
    InvalidArgument = 3,

    /// HTTP Mapping: 504 Gateway Timeout
    #[error("operation timed out")]
    DeadlineExceeded = 4,

    /// HTTP Mapping: 404 Not Found
    #[error("not found")]
    NotFound = 5,

    /// HTTP Mapping: 409 Conflict
    #[error("attempt to create what already exists")]
    AlreadyExists = 6,

    /// HTTP Mapping: 403 Forbidden
    #[error("permission denied")]
    PermissionDenied = 7,

    /// HTTP Mapping: 401 Unauthorized
    #[error("no valid authentication credentials")]
    Unauthenticated = 16,

    /// HTTP Mapping: 429 Too Many Requests
    #[error("resource has been exhausted")]
    ResourceExhausted = 8,

    /// HTTP Mapping: 400 Bad Request
    #[error("invalid state")]
    FailedPrecondition = 9,

    /// HTTP Mapping: 409 Conflict
    #[error("operation aborted")]
    Aborted = 10,

    /// HTTP Mapping: 400 Bad Request
    #[error("out of range")]
    OutOfRange = 11,

    /// HTTP Mapping: 501 Not Implemented
    #[error("not implemented")]
    Unimplemented = 12,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("internal error")]
    Internal = 13,

    /// HTTP Mapping: 503 Service Unavailable
    #[error("service unavailable")]
    Unavailable = 14,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

impl Error {
    /// Creates a new error with specified kind and details.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::new(ErrorKind::NotFound, "user profile not found");
    /// assert_eq!(err.kind, ErrorKind::NotFound);
    /// ```
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Creates an error for operations that were interrupted mid-execution.
    ///
    /// Maps to HTTP 409 Conflict. Use when an operation couldn't complete
    /// due to conflicting changes or state.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::aborted("connection reset during handshake");
    /// assert_eq!(err.kind, ErrorKind::Aborted);
    /// ```
    pub fn aborted<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Aborted,
            error: error.into(),
        }
    }

    /// Creates an error for duplicate resource creation attempts.
    ///
    /// Maps to HTTP 409 Conflict. Use when attempting to create
    /// a resource that already exists.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::already_exists("credentials file already exists");
    /// assert_eq!(err.kind, ErrorKind::AlreadyExists);
    /// ```
    pub fn already_exists<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::AlreadyExists,
            error: error.into(),
        }
    }

    /// Creates an error for cancelled operations.
    ///
    /// Maps to HTTP 499 Client Closed Request. Use when an operation
    /// was cancelled before completion.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::cancelled("download cancelled before start");
    /// assert_eq!(err.kind, ErrorKind::Cancelled);
    /// ```
    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Cancelled,
            error: error.into(),
        }
    }

    /// Creates an error for data corruption or loss.
    ///
    /// Maps to HTTP 500 Internal Server Error. Use when data has been
    /// corrupted or lost in an unrecoverable way.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::data_loss("packet mac mismatch");
    /// assert_eq!(err.kind, ErrorKind::DataLoss);
    /// ```
    pub fn data_loss<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::DataLoss,
            error: error.into(),
        }
    }

    /// Creates an error for operations that exceeded their deadline.
    ///
    /// Maps to HTTP 504 Gateway Timeout. Use when:
    /// * A socket read times out
    /// * A worker join times out
    /// * Any time-bound operation exceeds its limit
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::deadline_exceeded("access point did not answer");
    /// assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
    /// ```
    pub fn deadline_exceeded<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::DeadlineExceeded,
            error: error.into(),
        }
    }

    /// Creates an error for operations that failed due to current state.
    ///
    /// Maps to HTTP 400 Bad Request. Use when an operation cannot proceed
    /// due to the current system state.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::failed_precondition("not logged in");
    /// assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    /// ```
    pub fn failed_precondition<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::FailedPrecondition,
            error: error.into(),
        }
    }

    /// Creates an error for internal errors.
    ///
    /// Maps to HTTP 500 Internal Server Error. Use for unexpected internal
    /// errors that shouldn't occur during normal operation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::internal("nonce counter exhausted");
    /// assert_eq!(err.kind, ErrorKind::Internal);
    /// ```
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Internal,
            error: error.into(),
        }
    }

    /// Creates an error for invalid arguments.
    ///
    /// Maps to HTTP 400 Bad Request. Use when provided arguments
    /// don't meet validation requirements.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::invalid_argument("file id must be 20 bytes");
    /// assert_eq!(err.kind, ErrorKind::InvalidArgument);
    /// ```
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::InvalidArgument,
            error: error.into(),
        }
    }

    /// Creates an error for missing resources.
    ///
    /// Maps to HTTP 404 Not Found. Use when a requested resource
    /// doesn't exist.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::not_found("no cdn url for file");
    /// assert_eq!(err.kind, ErrorKind::NotFound);
    /// ```
    pub fn not_found<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::NotFound,
            error: error.into(),
        }
    }

    /// Creates an error for values outside valid range.
    ///
    /// Maps to HTTP 400 Bad Request. Use when a value exceeds
    /// its allowed bounds.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::out_of_range("seek before start of stream");
    /// assert_eq!(err.kind, ErrorKind::OutOfRange);
    /// ```
    pub fn out_of_range<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::OutOfRange,
            error: error.into(),
        }
    }

    /// Creates an error for permission denied conditions.
    ///
    /// Maps to HTTP 403 Forbidden. Use when the caller lacks
    /// necessary permissions.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::permission_denied("server signature rejected");
    /// assert_eq!(err.kind, ErrorKind::PermissionDenied);
    /// ```
    pub fn permission_denied<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::PermissionDenied,
            error: error.into(),
        }
    }

    /// Creates an error for exhausted resources.
    ///
    /// Maps to HTTP 429 Too Many Requests. Use when a resource
    /// limit has been reached.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::resource_exhausted("rate limited by storage resolver");
    /// assert_eq!(err.kind, ErrorKind::ResourceExhausted);
    /// ```
    pub fn resource_exhausted<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::ResourceExhausted,
            error: error.into(),
        }
    }

    /// Creates an error for authentication failures.
    ///
    /// Maps to HTTP 401 Unauthorized. Use when:
    /// * The access point rejects the login
    /// * Stored credentials are refused
    /// * Authentication is required but missing
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::unauthenticated("login failed");
    /// assert_eq!(err.kind, ErrorKind::Unauthenticated);
    /// ```
    pub fn unauthenticated<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Unauthenticated,
            error: error.into(),
        }
    }

    /// Creates an error for unavailable services.
    ///
    /// Maps to HTTP 503 Service Unavailable. Use when the service
    /// is temporarily unavailable.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::unavailable("no access point reachable");
    /// assert_eq!(err.kind, ErrorKind::Unavailable);
    /// ```
    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Unavailable,
            error: error.into(),
        }
    }

    /// Creates an error for unimplemented features.
    ///
    /// Maps to HTTP 501 Not Implemented. Use when the requested
    /// operation isn't implemented.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::unimplemented("no content decryption module");
    /// assert_eq!(err.kind, ErrorKind::Unimplemented);
    /// ```
    pub fn unimplemented<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Unimplemented,
            error: error.into(),
        }
    }

    /// Creates an error for unknown errors.
    ///
    /// Maps to HTTP 500 Internal Server Error. Use when the error
    /// doesn't fit any other category.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::unknown("unexpected error occurred");
    /// assert_eq!(err.kind, ErrorKind::Unknown);
    /// ```
    pub fn unknown<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::Unknown,
            error: error.into(),
        }
    }
}

/// Returns the underlying error source.
///
/// This allows error chains to be examined for root causes.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error for display, showing both kind and details.
///
/// Format: "{kind}: {details}"
///
/// # Examples
///
/// ```rust
/// let err = Error::not_found("file not found");
/// assert_eq!(err.to_string(), "not found: file not found");
/// ```
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
///
/// Maps standard IO errors to their logical equivalents:
/// * `NotFound` -> `NotFound`
/// * `PermissionDenied` -> `PermissionDenied`
/// * `ConnectionReset` -> `Aborted`
/// * etc.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;

        // Errors that passed through `Read` or `Seek` keep their kind.
        if err.get_ref().is_some_and(|inner| inner.is::<Self>()) {
            if let Some(Ok(inner)) = err.into_inner().map(|inner| inner.downcast::<Self>()) {
                return *inner;
            }
            return Self::unknown("error lost while unwrapping");
        }

        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Wraps errors for `Read` and `Seek` implementations.
///
/// The original error is recovered when converting back.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind {
            ErrorKind::NotFound => Io::NotFound,
            ErrorKind::PermissionDenied => Io::PermissionDenied,
            ErrorKind::InvalidArgument | ErrorKind::OutOfRange => Io::InvalidInput,
            ErrorKind::DataLoss => Io::UnexpectedEof,
            ErrorKind::DeadlineExceeded => Io::TimedOut,
            ErrorKind::Unavailable => Io::ConnectionRefused,
            ErrorKind::Aborted => Io::ConnectionAborted,
            _ => Io::Other,
        };
        Self::new(kind, err)
    }
}

/// Converts HTTP client errors into appropriate error kinds.
///
/// Maps HTTP errors based on their nature:
/// * Body errors -> `DataLoss`
/// * Decode errors -> `InvalidArgument`
/// * Connect errors -> `Unavailable`
/// * Timeout errors -> `DeadlineExceeded`
/// * etc.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() {
            return Self::data_loss(err);
        }

        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_connect() {
            return Self::unavailable(err);
        }

        if err.is_redirect() {
            return Self::resource_exhausted(err);
        }

        if let Some(status) = err.status() {
            return match status.as_u16() {
                401 => Self::unauthenticated(err),
                403 => Self::permission_denied(err),
                404 => Self::not_found(err),
                429 => Self::resource_exhausted(err),
                500..=599 => Self::unavailable(err),
                _ => Self::failed_precondition(err),
            };
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        Self::unknown(err)
    }
}

/// Converts JSON errors through IO error mapping.
///
/// JSON errors are first converted to IO errors, then mapped
/// using the IO error conversion rules.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

/// Converts Protocol Buffer errors to `DataLoss`.
///
/// A message that fails to parse or serialize on the wire means the
/// stream is out of sync with the peer.
impl From<protobuf::Error> for Error {
    fn from(e: protobuf::Error) -> Self {
        Self::data_loss(e)
    }
}

/// Converts RSA errors to `PermissionDenied`.
///
/// Only signature verification of the server key uses RSA, and a failure
/// there means the peer cannot be trusted.
impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Self::permission_denied(e)
    }
}

/// Converts invalid header errors to `Internal`.
impl From<reqwest::header::InvalidHeaderValue> for Error {
    fn from(e: reqwest::header::InvalidHeaderValue) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts URL parsing errors to `Internal`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts formatting errors to `Unknown`.
impl From<std::fmt::Error> for Error {
    fn from(e: std::fmt::Error) -> Self {
        Self::unknown(e.to_string())
    }
}

/// Converts Base64 decoding errors to `InvalidArgument`.
impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts hex decoding errors to `InvalidArgument`.
impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts TOML decoding errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts integer parsing errors to `InvalidArgument`.
impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts mutex poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts UUID errors to `InvalidArgument`.
impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts IP address parsing errors to `InvalidArgument`.
///
/// Used when an access point address cannot be parsed into a valid
/// socket address.
impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Self::invalid_argument(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_kinds() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(Error::from(refused).kind, ErrorKind::Unavailable);

        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(Error::from(eof).kind, ErrorKind::DataLoss);

        let timeout = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(Error::from(timeout).kind, ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn display_includes_kind_and_cause() {
        let err = Error::data_loss("packet mac mismatch");
        assert_eq!(
            err.to_string(),
            "unrecoverable data loss or corruption: packet mac mismatch"
        );
    }

    #[test]
    fn kind_survives_io_round_trip() {
        let io = std::io::Error::from(Error::permission_denied("bad signature"));
        assert_eq!(io.kind(), std::io::ErrorKind::PermissionDenied);

        let err = Error::from(io);
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert_eq!(err.to_string(), "permission denied: bad signature");
    }

    #[test]
    fn downcast_recovers_io_error() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        let io = err.downcast::<std::io::Error>().map(std::io::Error::kind);
        assert_eq!(io, Some(std::io::ErrorKind::BrokenPipe));
    }
}
