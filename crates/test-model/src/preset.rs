use colloquy_model::{ErrorKind, ToolUse};
use serde::{Deserialize, Serialize};

/// The events in a preset response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PresetEvent {
    /// A text delta.
    Text(String),
    /// A delta of extended thinking.
    Thinking(String),
    /// The signature closing the preceding thinking.
    ThinkingSignature(String),
    /// A complete tool use.
    ToolUse(ToolUse),
    /// The stream breaks with an error of this kind.
    Error(ErrorKind),
}

/// The preset response for an assistant step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresetResponse {
    /// Events in this response.
    pub events: Vec<PresetEvent>,
    /// If set, the request will be rejected in the first `failures`
    /// attempts. `Some(0)` means the request is always rejected.
    pub failures: Option<u64>,
}

impl PresetResponse {
    /// Creates a `PresetResponse` with the specified events.
    #[inline]
    pub fn with_events(events: impl Into<Vec<PresetEvent>>) -> Self {
        Self {
            events: events.into(),
            failures: None,
        }
    }

    /// Creates a `PresetResponse` that streams the given text fragments.
    pub fn with_text<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_events(
            fragments
                .into_iter()
                .map(|s| PresetEvent::Text(s.into()))
                .collect::<Vec<_>>(),
        )
    }

    /// Sets failure times before a successful response. `0` means the
    /// response will always be a failure.
    #[inline]
    pub fn with_failures(mut self, failures: u64) -> Self {
        self.failures = Some(failures);
        self
    }

    pub(crate) fn has_tool_use(&self) -> bool {
        self.events
            .iter()
            .any(|event| matches!(event, PresetEvent::ToolUse(_)))
    }
}
