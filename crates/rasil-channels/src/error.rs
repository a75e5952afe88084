use thiserror::Error;

/// Typed transport failure. `retryable` drives the task queue's decision
/// between backoff and terminal failure.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    /// Network resets, timeouts, 5xx — worth retrying.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            code: "NETWORK",
            message: message.into(),
            retryable: true,
        }
    }

    /// 401/403 with refresh exhausted, revoked sessions — operator action
    /// required, never retried.
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            code: "AUTH",
            message: message.into(),
            retryable: false,
        }
    }

    /// Platform rejected the request (4xx other than auth/rate).
    pub fn api(message: impl Into<String>) -> Self {
        Self {
            code: "API",
            message: message.into(),
            retryable: false,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            code: "RATE_LIMITED",
            message: message.into(),
            retryable: true,
        }
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self {
            code: "PAYLOAD",
            message: message.into(),
            retryable: false,
        }
    }

    pub fn unsupported(op: &str) -> Self {
        Self {
            code: "UNSUPPORTED",
            message: format!("operation not supported by this transport: {}", op),
            retryable: false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            TransportError::network(e.to_string())
        } else if let Some(status) = e.status() {
            if status.as_u16() == 429 {
                TransportError::rate_limited(e.to_string())
            } else if status.is_server_error() {
                TransportError::network(e.to_string())
            } else if status.as_u16() == 401 || status.as_u16() == 403 {
                TransportError::auth(e.to_string())
            } else {
                TransportError::api(e.to_string())
            }
        } else {
            TransportError::network(e.to_string())
        }
    }
}
