//! Error types for htfs.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// How the retry driver treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: back off and try again on a fresh connection.
    Retryable,
    /// The URL was rejected or has expired: renew it, then try again.
    Renew,
    /// Terminal: surfaced to the caller as-is.
    Fatal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("no data received for {after:?}")]
    IdleTimeout { after: Duration },

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("server does not honor range requests")]
    RangeNotSupported,

    #[error("short read: connection ended at byte {actual}, expected data up to byte {expected}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("offset {offset} is past the end of the file ({size} bytes)")]
    OutOfRange { offset: u64, size: u64 },

    #[error("cannot seek to a negative position")]
    NegativeSeek,

    #[error("URL has expired")]
    Expired,

    #[error("URL renewal failed: {0}")]
    Renewal(String),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("file is closed")]
    Closed,
}

impl Error {
    /// Classifies the error for the retry driver.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Status { status, .. } => classify_status(*status),
            Error::IdleTimeout { .. }
            | Error::Timeout(_)
            | Error::Connect(_)
            | Error::Network(_)
            | Error::ShortRead { .. } => ErrorClass::Retryable,
            Error::Expired => ErrorClass::Renew,
            Error::InvalidUrl(_)
            | Error::InvalidConfig(_)
            | Error::Malformed(_)
            | Error::RangeNotSupported
            | Error::OutOfRange { .. }
            | Error::NegativeSeek
            | Error::Renewal(_)
            | Error::RetriesExhausted { .. }
            | Error::Cancelled
            | Error::Closed => ErrorClass::Fatal,
        }
    }

    /// Returns the HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// Maps an HTTP status code onto a retry class.
///
/// Only meaningful for non-success codes.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Renew,
        408 | 429 => ErrorClass::Retryable,
        500..=599 => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> Error {
        Error::Status {
            status: code,
            url: "https://example.com/a.bin".into(),
        }
    }

    #[test]
    fn test_server_errors_are_retryable() {
        for code in [500, 502, 503, 504, 599, 408, 429] {
            assert_eq!(status(code).class(), ErrorClass::Retryable, "code {code}");
        }
    }

    #[test]
    fn test_auth_errors_trigger_renewal() {
        assert_eq!(status(401).class(), ErrorClass::Renew);
        assert_eq!(status(403).class(), ErrorClass::Renew);
        assert_eq!(Error::Expired.class(), ErrorClass::Renew);
    }

    #[test]
    fn test_client_errors_are_fatal() {
        for code in [400, 404, 405, 410, 416] {
            assert_eq!(status(code).class(), ErrorClass::Fatal, "code {code}");
        }
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        let errors = [
            Error::IdleTimeout {
                after: Duration::from_secs(1),
            },
            Error::Timeout("connect".into()),
            Error::Connect("refused".into()),
            Error::Network("connection reset".into()),
            Error::ShortRead {
                expected: 10,
                actual: 4,
            },
        ];
        for e in errors {
            assert_eq!(e.class(), ErrorClass::Retryable, "{e}");
        }
    }

    #[test]
    fn test_exhausted_keeps_status() {
        let e = Error::RetriesExhausted {
            attempts: 3,
            last: Box::new(status(503)),
        };
        assert_eq!(e.class(), ErrorClass::Fatal);
        assert_eq!(e.status(), Some(503));
        assert!(e.to_string().contains("3 attempts"));
    }
}
