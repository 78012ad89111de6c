use std::pin::Pin;
use std::task::{self, Poll};

use serde::{Deserialize, Serialize};

use crate::ToolUse;
use crate::provider::ModelProviderError;

/// A response from the model provider.
///
/// Dropping a response before it completes must release whatever
/// resources (usually a network connection) it holds.
pub trait ModelResponse: Sized + Send + 'static {
    /// The error type that may be returned by the provider.
    type Error: ModelProviderError;

    /// Attempts to pull out the next event from the response.
    ///
    /// # Return value
    ///
    /// There are several possible return values, each indicating a
    /// distinct response state:
    ///
    /// - `Poll::Pending` means that this response is still waiting for
    ///   the next event. Implementations will ensure that the current
    ///   task will be notified when the next event may be ready.
    /// - `Poll::Ready(Ok(Some(event)))` means the response has an event
    ///   to deliver, and may produce further events on subsequent
    ///   `poll_next_event` calls.
    /// - `Poll::Ready(Ok(None))` means the response has completed.
    /// - `Poll::Ready(Err(error))` means an error occurred while
    ///   processing the response.
    ///
    /// Calling this method after completion should always return `None`.
    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>>;
}

/// The reason why a model response has finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model has finished its turn.
    Stop,
    /// The token limit was reached.
    MaxTokens,
    /// A custom stop sequence was generated.
    StopSequence,
    /// The model needs to call a tool.
    ToolUse,
}

/// Token accounting of a response.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Usage {
    /// Tokens consumed by the input.
    pub input_tokens: u64,
    /// Tokens generated.
    pub output_tokens: u64,
}

impl Usage {
    /// Merges a later report into this one.
    ///
    /// Providers report counters cumulatively, so non-zero values
    /// replace the earlier ones.
    #[inline]
    pub fn merge(&mut self, other: Usage) {
        if other.input_tokens != 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens != 0 {
            self.output_tokens = other.output_tokens;
        }
    }
}

/// Identifies a response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// The message identifier assigned by the backend.
    pub id: String,
    /// The model that actually served the request.
    pub model: String,
}

/// The event from a model response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelResponseEvent {
    /// The response has started.
    Started(ResponseMetadata),
    /// Received a text delta.
    TextDelta(String),
    /// Received a delta of the model's extended thinking.
    ThinkingDelta(String),
    /// Received the signature that closes the current thinking block.
    ThinkingSignature(String),
    /// Received a complete tool call request.
    ToolUse(ToolUse),
    /// Received updated token accounting.
    Usage(Usage),
    /// The response has been completed.
    Completed(FinishReason),
}
