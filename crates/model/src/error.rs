use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// The kind of error that occurred.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The connection failed, timed out, or was closed mid-response.
    Transport,
    /// The credential is missing or was rejected.
    Auth,
    /// The request content is malformed, either detected locally or
    /// reported by the backend.
    Validation,
    /// The model provider is rate limited.
    RateLimitExceeded,
    /// The response ended without producing any content.
    EmptyResponse,
    /// Any other errors.
    Other,
}

impl ErrorKind {
    /// Returns `true` if sending the same request again may succeed.
    ///
    /// The client never retries by itself, this is only a hint for
    /// callers that want to.
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::RateLimitExceeded)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "Transport error"),
            ErrorKind::Auth => write!(f, "Authentication error"),
            ErrorKind::Validation => write!(f, "Validation error"),
            ErrorKind::RateLimitExceeded => write!(f, "Rate limit exceeded"),
            ErrorKind::EmptyResponse => write!(f, "Empty response"),
            ErrorKind::Other => write!(f, "Other error"),
        }
    }
}
