//! Status-code taxonomy shared by every public operation.
//!
//! Each failure is a [`HttpSysError`] variant. At the API boundary the
//! variant collapses into a numeric code from the closed enumeration
//! below (0 = success), the same space the OS socket layer reports in.

use thiserror::Error;

use crate::handles::Handle;
use crate::net::stream::StreamError;

pub const NO_ERROR: u32 = 0;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_HANDLE_EOF: u32 = 38;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_ALREADY_EXISTS: u32 = 183;
pub const ERROR_MORE_DATA: u32 = 234;
pub const ERROR_NO_MORE_ITEMS: u32 = 259;
pub const ERROR_IO_PENDING: u32 = 997;
pub const ERROR_NOT_FOUND: u32 = 1168;
pub const ERROR_CONNECTION_ABORTED: u32 = 1236;
pub const ERROR_REVISION_MISMATCH: u32 = 1306;
pub const ERROR_NO_SYSTEM_RESOURCES: u32 = 1450;
pub const ERROR_TIMEOUT: u32 = 1460;
pub const ERROR_BAD_CONFIGURATION: u32 = 1610;
pub const ERROR_DUPLICATE_TAG: u32 = 2014;
pub const ERROR_INVALID_STATE: u32 = 5023;
pub const ERROR_HTTP_INVALID_HEADER: u32 = 12153;

/// Errors returned by queue, group, session and request operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpSysError {
    /// Malformed or contradictory call arguments, including stale handles.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Protocol violation in the bytes received from the wire.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A fragment with the same name is already cached.
    #[error("duplicate fragment: {0}")]
    DuplicateTag(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The request queue is at its configured length.
    #[error("service unavailable")]
    ServiceUnavailable,

    /// The peer closed the connection or the body is exhausted.
    #[error("end of stream")]
    HandleEof,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("operation timed out")]
    Timeout,

    /// Caller buffer too small; retry with `required` bytes. `request` is
    /// the request to receive again by id, null outside request receives.
    #[error("more data: {required} bytes required")]
    MoreData { required: usize, request: Handle },

    #[error("unsupported api version {major}.{minor}")]
    RevisionMismatch { major: u16, minor: u16 },

    /// TLS binding or other external configuration is missing.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The handle counter wrapped without finding a free value.
    #[error("handle space exhausted, cannot continue")]
    HandleSpaceExhausted,
}

impl HttpSysError {
    /// Numeric status code for this error.
    pub fn code(&self) -> u32 {
        match self {
            HttpSysError::InvalidParameter(_) => ERROR_INVALID_PARAMETER,
            HttpSysError::InvalidHeader(_) => ERROR_HTTP_INVALID_HEADER,
            HttpSysError::AlreadyExists(_) => ERROR_ALREADY_EXISTS,
            HttpSysError::DuplicateTag(_) => ERROR_DUPLICATE_TAG,
            HttpSysError::NotFound(_) => ERROR_NOT_FOUND,
            HttpSysError::ServiceUnavailable => ERROR_NO_SYSTEM_RESOURCES,
            HttpSysError::HandleEof => ERROR_HANDLE_EOF,
            HttpSysError::ConnectionAborted => ERROR_CONNECTION_ABORTED,
            HttpSysError::Timeout => ERROR_TIMEOUT,
            HttpSysError::MoreData { .. } => ERROR_MORE_DATA,
            HttpSysError::RevisionMismatch { .. } => ERROR_REVISION_MISMATCH,
            HttpSysError::InvalidConfiguration(_) => ERROR_BAD_CONFIGURATION,
            HttpSysError::AccessDenied(_) => ERROR_ACCESS_DENIED,
            HttpSysError::InvalidState(_) => ERROR_INVALID_STATE,
            HttpSysError::HandleSpaceExhausted => ERROR_NO_MORE_ITEMS,
        }
    }

    /// True for errors that mean the peer or transport is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            HttpSysError::HandleEof | HttpSysError::ConnectionAborted | HttpSysError::Timeout
        )
    }
}

impl From<StreamError> for HttpSysError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Closed => HttpSysError::HandleEof,
            StreamError::Timeout => HttpSysError::Timeout,
            StreamError::Io(_) | StreamError::Tls(_) => HttpSysError::ConnectionAborted,
        }
    }
}

/// Result type for the public operations.
pub type Result<T> = std::result::Result<T, HttpSysError>;

/// Collapse a result into its status code.
pub fn status_code<T>(result: &Result<T>) -> u32 {
    match result {
        Ok(_) => NO_ERROR,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_nonzero() {
        let all = [
            HttpSysError::InvalidParameter("x"),
            HttpSysError::InvalidHeader("x".into()),
            HttpSysError::AlreadyExists("x".into()),
            HttpSysError::DuplicateTag("x".into()),
            HttpSysError::NotFound("x".into()),
            HttpSysError::ServiceUnavailable,
            HttpSysError::HandleEof,
            HttpSysError::ConnectionAborted,
            HttpSysError::Timeout,
            HttpSysError::MoreData {
                required: 1,
                request: Handle::NULL,
            },
            HttpSysError::RevisionMismatch { major: 9, minor: 9 },
            HttpSysError::InvalidConfiguration("x".into()),
            HttpSysError::AccessDenied("x".into()),
            HttpSysError::InvalidState("x"),
            HttpSysError::HandleSpaceExhausted,
        ];
        let mut codes: Vec<u32> = all.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c != NO_ERROR));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn stream_errors_map_to_disconnects() {
        assert_eq!(HttpSysError::from(StreamError::Closed), HttpSysError::HandleEof);
        assert!(HttpSysError::from(StreamError::Timeout).is_disconnect());
        assert_eq!(status_code::<()>(&Ok(())), NO_ERROR);
    }
}
