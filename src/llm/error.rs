//! LLM error types with retry classification.
//!
//! Distinguishes between transient errors (retried by the invocation layer)
//! and permanent errors (surface immediately).

use std::time::Duration;

/// Error from an LLM invocation.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// The kind of error
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Server-provided retry delay (Retry-After header)
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn of_kind(kind: LlmErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
            retry_after: None,
        }
    }

    /// Create a rate limit error.
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::of_kind(LlmErrorKind::RateLimited, Some(429), message)
        }
    }

    /// Create a server error.
    pub fn server_error(status_code: u16, message: String) -> Self {
        Self::of_kind(LlmErrorKind::ServerError, Some(status_code), message)
    }

    /// Create a client error (bad request, auth, etc.).
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self::of_kind(LlmErrorKind::ClientError, Some(status_code), message)
    }

    /// Create a network error (connection refused, reset, DNS).
    pub fn network_error(message: String) -> Self {
        Self::of_kind(LlmErrorKind::NetworkError, None, message)
    }

    /// Create a timeout error.
    pub fn timeout(message: String) -> Self {
        Self::of_kind(LlmErrorKind::Timeout, None, message)
    }

    /// Create a parse error.
    pub fn parse_error(message: String) -> Self {
        Self::of_kind(LlmErrorKind::ParseError, None, message)
    }

    /// Create a configuration error (unusable client setup).
    pub fn config(message: String) -> Self {
        Self::of_kind(LlmErrorKind::Config, None, message)
    }

    /// Check if this error is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::timeout(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            LlmError::network_error(format!("Connection failed: {}", e))
        } else if let Some(status) = e.status() {
            LlmError::of_kind(
                classify_http_status(status.as_u16()),
                Some(status.as_u16()),
                e.to_string(),
            )
        } else {
            LlmError::network_error(format!("Request failed: {}", e))
        }
    }
}

/// Classification of LLM errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Rate limited (429) - transient
    RateLimited,
    /// Server error (500, 502, 503, 504) - transient
    ServerError,
    /// Client error (400, 401, 403, 404) - permanent
    ClientError,
    /// Network error - transient
    NetworkError,
    /// Request timed out - transient
    Timeout,
    /// Response parsing error - permanent
    ParseError,
    /// Client is misconfigured - permanent, never retried
    Config,
}

impl LlmErrorKind {
    /// Check if this error kind is transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited
                | LlmErrorKind::ServerError
                | LlmErrorKind::NetworkError
                | LlmErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::ServerError => write!(f, "Server error"),
            LlmErrorKind::ClientError => write!(f, "Client error"),
            LlmErrorKind::NetworkError => write!(f, "Network error"),
            LlmErrorKind::Timeout => write!(f, "Timeout"),
            LlmErrorKind::ParseError => write!(f, "Parse error"),
            LlmErrorKind::Config => write!(f, "Configuration error"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        408 => LlmErrorKind::Timeout,
        500 | 502 | 503 | 504 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

/// A structured call whose argument blob is not a JSON mapping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid arguments for `{name}`: {reason}")]
pub struct CallParseError {
    /// Name of the function the model tried to call
    pub name: String,
    /// The argument blob as received
    pub raw_arguments: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmErrorKind::RateLimited.is_transient());
        assert!(LlmErrorKind::ServerError.is_transient());
        assert!(LlmErrorKind::NetworkError.is_transient());
        assert!(LlmErrorKind::Timeout.is_transient());
        assert!(!LlmErrorKind::ClientError.is_transient());
        assert!(!LlmErrorKind::ParseError.is_transient());
        assert!(!LlmErrorKind::Config.is_transient());
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(408), LlmErrorKind::Timeout);
        assert_eq!(classify_http_status(500), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(400), LlmErrorKind::ClientError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_display_includes_status() {
        let err = LlmError::client_error(401, "bad key".to_string());
        assert_eq!(err.to_string(), "Client error (HTTP 401): bad key");
        let err = LlmError::network_error("reset".to_string());
        assert_eq!(err.to_string(), "Network error: reset");
    }
}
