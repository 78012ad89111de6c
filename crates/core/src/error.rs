use std::error::Error as StdError;
use std::fmt::{self, Display};

use colloquy_model::{ContentError, ErrorKind, ModelProviderError};

type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

/// The error returned by [`ModelClient`](crate::ModelClient) calls.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<BoxedSource>,
}

impl Error {
    pub(crate) fn from_provider<E: ModelProviderError>(err: E) -> Self {
        Self {
            kind: err.kind(),
            message: format!("{err}"),
            source: Some(Box::new(err)),
        }
    }

    pub(crate) fn validation<S: Into<String>>(message: S) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn empty_response() -> Self {
        Self {
            kind: ErrorKind::EmptyResponse,
            message: "the response has no content".to_owned(),
            source: None,
        }
    }

    /// Returns the kind of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if sending the same request again may succeed.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

impl From<ContentError> for Error {
    fn from(err: ContentError) -> Self {
        Self {
            kind: err.kind(),
            message: err.reason().to_owned(),
            source: Some(Box::new(err)),
        }
    }
}
