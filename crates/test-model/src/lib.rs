//! A local fake model for testing purpose.

mod preset;

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use colloquy_model::{
    ErrorKind, FinishReason, ModelProvider, ModelProviderError, ModelRequest,
    ModelResponse, ModelResponseEvent, ResponseMetadata, Role,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

const DEFAULT_MODEL: &str = "test-model";

#[derive(Debug)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[derive(Default)]
struct SharedState {
    requests: Vec<ModelRequest>,
    // Attempts per script step, for injected failures.
    attempts: Vec<u64>,
    live_responses: usize,
}

// Counts a response as live until it is dropped.
struct LiveGuard(Arc<Mutex<SharedState>>);

impl LiveGuard {
    fn new(state: Arc<Mutex<SharedState>>) -> Self {
        lock(&state).live_responses += 1;
        Self(state)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        lock(&self.0).live_responses -= 1;
    }
}

#[inline]
fn lock(state: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    // A panicking test must not cascade into others.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TestModelResponse {
    metadata: ResponseMetadata,
    preset: PresetResponse,
    delay: Duration,
    // 0 is `Started`, then the preset events, then `Completed`.
    event_idx: usize,
    sleep: Option<Pin<Box<Sleep>>>,
    _live: LiveGuard,
}

impl TestModelResponse {
    fn event_at(
        &self,
        idx: usize,
    ) -> Result<Option<ModelResponseEvent>, Error> {
        let events = &self.preset.events;
        if idx == 0 {
            return Ok(Some(ModelResponseEvent::Started(self.metadata.clone())));
        }
        let Some(preset_event) = events.get(idx - 1) else {
            if idx == events.len() + 1 {
                let finish_reason = if self.preset.has_tool_use() {
                    FinishReason::ToolUse
                } else {
                    FinishReason::Stop
                };
                return Ok(Some(ModelResponseEvent::Completed(finish_reason)));
            }
            // In case this method is called after completion.
            return Ok(None);
        };
        let event = match preset_event {
            PresetEvent::Text(delta) => ModelResponseEvent::TextDelta(delta.clone()),
            PresetEvent::Thinking(delta) => {
                ModelResponseEvent::ThinkingDelta(delta.clone())
            }
            PresetEvent::ThinkingSignature(signature) => {
                ModelResponseEvent::ThinkingSignature(signature.clone())
            }
            PresetEvent::ToolUse(tool_use) => {
                ModelResponseEvent::ToolUse(tool_use.clone())
            }
            PresetEvent::Error(kind) => {
                return Err(Error::new("preset stream error", *kind));
            }
        };
        Ok(Some(event))
    }
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        loop {
            if let Some(sleep) = &mut this.sleep {
                ready!(sleep.as_mut().poll(cx));
                this.sleep = None;

                let event = this.event_at(this.event_idx);
                this.event_idx += 1;
                if event.is_err() {
                    // An error ends the response.
                    this.event_idx = usize::MAX;
                }
                return Poll::Ready(event);
            }
            if this.event_idx == usize::MAX {
                return Poll::Ready(Ok(None));
            }
            this.sleep = Some(Box::pin(sleep(this.delay)));
        }
    }
}

/// A local fake model for testing purpose.
///
/// Before sending requests, you need to setup the conversation script, which
/// is how the model should respond to a request. The step is selected by the
/// number of assistant messages in the request, so the first request gets the
/// first response, and a request replaying that response gets the second one.
/// If there are no enough steps in the script, the request is rejected.
///
/// Clones share the recorded requests and the live response count.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    script: Vec<PresetResponse>,
    delay: Option<Duration>,
    state: Arc<Mutex<SharedState>>,
}

impl TestModelProvider {
    #[inline]
    pub fn add_response(&mut self, preset: PresetResponse) {
        self.script.push(preset);
    }

    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns all requests sent to this provider so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.state).requests.clone()
    }

    /// Returns the number of responses that are not dropped yet.
    pub fn live_responses(&self) -> usize {
        lock(&self.state).live_responses
    }

    fn start_response(
        &self,
        req: &ModelRequest,
    ) -> Result<TestModelResponse, Error> {
        let step_idx = req
            .messages
            .iter()
            .filter(|msg| msg.role == Role::Assistant)
            .count();

        {
            let mut state = lock(&self.state);
            state.requests.push(req.clone());

            let Some(preset) = self.script.get(step_idx) else {
                return Err(Error::new(
                    format!("no enough steps for step {step_idx}"),
                    ErrorKind::Validation,
                ));
            };
            if state.attempts.len() <= step_idx {
                state.attempts.resize(step_idx + 1, 0);
            }
            let attempts = &mut state.attempts[step_idx];
            *attempts += 1;
            match preset.failures {
                Some(0) => {
                    return Err(Error::new(
                        "preset failure",
                        ErrorKind::RateLimitExceeded,
                    ));
                }
                Some(failures) if *attempts <= failures => {
                    return Err(Error::new(
                        "preset failure",
                        ErrorKind::RateLimitExceeded,
                    ));
                }
                _ => {}
            }
        }

        Ok(TestModelResponse {
            metadata: ResponseMetadata {
                id: format!("msg_test_{step_idx}"),
                model: req
                    .options
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            },
            preset: self.script[step_idx].clone(),
            delay: self.delay.unwrap_or(Duration::from_millis(1)),
            event_idx: 0,
            sleep: None,
            _live: LiveGuard::new(Arc::clone(&self.state)),
        })
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        ready(self.start_response(req))
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use colloquy_model::{
        ContentPart, Message, ModelOptions, ToolSchema, ToolUse,
    };
    use serde_json::json;

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> Result<(String, Vec<ToolUse>, FinishReason), Error> {
        let mut resp = pin!(resp);
        let mut msg = String::new();
        let mut tool_uses = Vec::new();
        let mut finish_reason = None;
        while let Some(event) =
            poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await?
        {
            match event {
                ModelResponseEvent::TextDelta(delta) => msg.push_str(&delta),
                ModelResponseEvent::ToolUse(tool_use) => tool_uses.push(tool_use),
                ModelResponseEvent::Completed(reason) => {
                    finish_reason = Some(reason)
                }
                _ => {}
            }
        }
        Ok((msg, tool_uses, finish_reason.unwrap()))
    }

    fn read_file_use() -> ToolUse {
        ToolUse {
            id: "toolu_1".to_owned(),
            name: "read_file".to_owned(),
            input: json!({ "filename": "todo.txt" }),
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_text(["Hello, ", "world!"]));
        provider.add_response(PresetResponse::with_events([
            PresetEvent::Text("Sure, ".to_owned()),
            PresetEvent::Thinking("the user wants the todo".to_owned()),
            PresetEvent::Text("let me take a look.".to_owned()),
            PresetEvent::ToolUse(read_file_use()),
        ]));

        let mut req = ModelRequest {
            messages: vec![Message::human("Hi")],
            options: ModelOptions::default(),
            tools: vec![ToolSchema::new(
                "read_file",
                "Reads a file",
                json!({
                    "type": "object",
                    "properties": {
                        "filename": {
                            "type": "string",
                            "description": "The name of the file to read"
                        }
                    }
                }),
            )],
        };
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, _, finish_reason) = collect_response(resp).await.unwrap();
        assert_eq!(msg, "Hello, world!");
        assert_eq!(finish_reason, FinishReason::Stop);

        req.messages.push(Message::assistant(msg));
        req.messages.push(Message::human("Check my todo"));
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, tool_uses, finish_reason) =
            collect_response(resp).await.unwrap();
        assert_eq!(msg, "Sure, let me take a look.");
        assert_eq!(tool_uses, vec![read_file_use()]);
        assert_eq!(finish_reason, FinishReason::ToolUse);

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 3);

        // The script is exhausted.
        req.messages
            .push(Message::assistant([ContentPart::ToolUse(read_file_use())]));
        let Err(err) = provider.send_request(&req).await else {
            panic!("expected the request to be rejected");
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_failures() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_text(["ok"]).with_failures(2));
        let req = ModelRequest {
            messages: vec![Message::human("Hi")],
            options: ModelOptions::default(),
            tools: vec![],
        };
        for _ in 0..2 {
            let Err(err) = provider.send_request(&req).await else {
                panic!("expected a preset failure");
            };
            assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        }
        let resp = provider.send_request(&req).await.unwrap();
        assert_eq!(collect_response(resp).await.unwrap().0, "ok");
    }

    #[tokio::test]
    async fn test_error_event_ends_stream() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::Text("partial".to_owned()),
            PresetEvent::Error(ErrorKind::Transport),
            PresetEvent::Text("never".to_owned()),
        ]));
        let req = ModelRequest {
            messages: vec![Message::human("Hi")],
            options: ModelOptions::default(),
            tools: vec![],
        };
        let resp = provider.send_request(&req).await.unwrap();
        let mut resp = pin!(resp);
        let mut kinds = Vec::new();
        loop {
            match poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await {
                Ok(Some(_)) => kinds.push(None),
                Ok(None) => break,
                Err(err) => kinds.push(Some(err.kind())),
            }
        }
        assert_eq!(kinds, vec![None, None, Some(ErrorKind::Transport)]);
    }

    #[tokio::test]
    async fn test_live_responses() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_text(["a", "b", "c"]));
        let req = ModelRequest {
            messages: vec![Message::human("Hi")],
            options: ModelOptions::default(),
            tools: vec![],
        };
        let resp = provider.send_request(&req).await.unwrap();
        let other = provider.clone();
        assert_eq!(other.live_responses(), 1);
        drop(resp);
        assert_eq!(other.live_responses(), 0);
    }
}
