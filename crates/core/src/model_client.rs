use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use colloquy_model::{
    ContentPart, FinishReason, Message, MessageContent, ModelOptions,
    ModelProvider, ModelRequest, ModelResponse, ModelResponseEvent, Role,
    ToolSchema, ToolUse, Usage,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::Error;

type EventResult = Result<Option<ModelResponseEvent>, Error>;

// Object-safe view of a `ModelResponse` with the error type erased.
trait AnyResponse: Send {
    fn poll_event(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<EventResult>;
}

impl<R: ModelResponse> AnyResponse for R {
    #[inline]
    fn poll_event(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<EventResult> {
        self.poll_next_event(cx).map_err(Error::from_provider)
    }
}

type BoxedResponse = Pin<Box<dyn AnyResponse>>;
type BoxedConnectFuture =
    Pin<Box<dyn Future<Output = Result<BoxedResponse, Error>> + Send>>;
type HandlerFn = Arc<dyn Fn(ModelRequest) -> BoxedConnectFuture + Send + Sync>;

/// A chat model client over any [`ModelProvider`].
///
/// Clones are cheap and share the provider.
#[derive(Clone)]
pub struct ModelClient {
    handler_fn: HandlerFn,
}

impl ModelClient {
    /// Creates a client that sends requests to `provider`.
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        // We have to erase the type `P`, since `ModelClient` doesn't have a
        // generic parameter and we don't want it either.
        let handler_fn: HandlerFn = Arc::new(move |req| -> BoxedConnectFuture {
            trace!("got a request: {req:?}");
            let fut = provider.send_request(&req);
            Box::pin(
                async move {
                    match fut.await {
                        Ok(resp) => {
                            trace!("request accepted");
                            Ok(Box::pin(resp) as BoxedResponse)
                        }
                        Err(err) => {
                            error!("request failed: {err}");
                            Err(Error::from_provider(err))
                        }
                    }
                }
                .instrument(trace_span!("model client req")),
            )
        });
        Self { handler_fn }
    }

    /// Sends `messages` and waits for the complete response.
    ///
    /// This drains the same stream [`stream`](Self::stream) returns, so the
    /// text of the response is exactly the concatenated chunk text.
    pub async fn invoke(
        &self,
        messages: Vec<Message>,
        options: ModelOptions,
    ) -> Result<ChatResponse, Error> {
        self.stream(messages, options).collect_response().await
    }

    /// Sends `messages` and returns a stream of response chunks.
    ///
    /// Nothing is sent until the stream is first polled. Dropping the
    /// stream drops the underlying response.
    #[inline]
    pub fn stream(&self, messages: Vec<Message>, options: ModelOptions) -> ChatStream {
        self.stream_request(ModelRequest {
            messages,
            options,
            tools: Vec::new(),
        })
    }

    pub(crate) fn stream_request(&self, request: ModelRequest) -> ChatStream {
        ChatStream {
            state: State::Idle {
                handler_fn: Arc::clone(&self.handler_fn),
                request,
            },
            id: None,
            model: None,
            finish_reason: None,
            usage: Usage::default(),
            has_content: false,
        }
    }
}

enum State {
    Idle {
        handler_fn: HandlerFn,
        request: ModelRequest,
    },
    Connecting(BoxedConnectFuture),
    Streaming(BoxedResponse),
    Done,
}

/// A stream of [`ResponseChunk`]s.
///
/// Once the stream is exhausted, the response metadata is available from
/// its accessors.
pub struct ChatStream {
    state: State,
    id: Option<String>,
    model: Option<String>,
    finish_reason: Option<FinishReason>,
    usage: Usage,
    has_content: bool,
}

impl ChatStream {
    /// Returns the message identifier assigned by the backend.
    #[inline]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns the model that served the request.
    #[inline]
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Returns why the model stopped, if it did.
    #[inline]
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Returns the token usage reported so far.
    #[inline]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    fn handle_event(&mut self, event: ModelResponseEvent) -> Option<ResponseChunk> {
        trace!("got an event: {event:?}");
        let content = match event {
            ModelResponseEvent::Started(metadata) => {
                self.id = Some(metadata.id);
                self.model = Some(metadata.model);
                return None;
            }
            ModelResponseEvent::TextDelta(text) => ChunkContent::Text(text),
            ModelResponseEvent::ThinkingDelta(thinking) => {
                ChunkContent::Thinking(thinking)
            }
            ModelResponseEvent::ThinkingSignature(signature) => {
                ChunkContent::ThinkingSignature(signature)
            }
            ModelResponseEvent::ToolUse(tool_use) => ChunkContent::ToolUse(tool_use),
            ModelResponseEvent::Usage(usage) => {
                self.usage.merge(usage);
                return None;
            }
            ModelResponseEvent::Completed(reason) => {
                self.finish_reason = Some(reason);
                return None;
            }
        };
        self.has_content = true;
        Some(ResponseChunk {
            role: Role::Assistant,
            content,
        })
    }

    async fn collect_response(mut self) -> Result<ChatResponse, Error> {
        let mut content: Vec<ResponseContent> = Vec::new();
        while let Some(chunk) = self.next().await {
            push_content(&mut content, chunk?.content);
        }
        trace!("finished a request");

        Ok(ChatResponse {
            id: self.id.take().unwrap_or_default(),
            model: self.model.take().unwrap_or_default(),
            content,
            finish_reason: self.finish_reason,
            usage: self.usage,
        })
    }
}

// Consecutive text or thinking deltas are merged into one item. A signature
// closes the thinking item it follows.
fn push_content(content: &mut Vec<ResponseContent>, chunk: ChunkContent) {
    let item = match chunk {
        ChunkContent::Text(delta) => {
            if let Some(ResponseContent::Text { text }) = content.last_mut() {
                text.push_str(&delta);
                return;
            }
            ResponseContent::Text { text: delta }
        }
        ChunkContent::Thinking(delta) => {
            if let Some(ResponseContent::Thinking {
                thinking,
                signature: None,
            }) = content.last_mut()
            {
                thinking.push_str(&delta);
                return;
            }
            ResponseContent::Thinking {
                thinking: delta,
                signature: None,
            }
        }
        ChunkContent::ThinkingSignature(delta) => {
            if let Some(ResponseContent::Thinking {
                signature: signature @ None,
                ..
            }) = content.last_mut()
            {
                *signature = Some(delta);
                return;
            }
            ResponseContent::Thinking {
                thinking: String::new(),
                signature: Some(delta),
            }
        }
        ChunkContent::ToolUse(tool_use) => ResponseContent::ToolUse(tool_use),
    };
    content.push(item);
}

impl Stream for ChatStream {
    type Item = Result<ResponseChunk, Error>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Idle { .. } => {
                    let State::Idle {
                        handler_fn,
                        request,
                    } = mem::replace(&mut this.state, State::Done)
                    else {
                        unreachable!()
                    };
                    if request.messages.is_empty() {
                        return Poll::Ready(Some(Err(Error::validation(
                            "at least one message is required",
                        ))));
                    }
                    this.state = State::Connecting(handler_fn(request));
                }
                State::Connecting(fut) => match ready!(fut.as_mut().poll(cx)) {
                    Ok(resp) => this.state = State::Streaming(resp),
                    Err(err) => {
                        this.state = State::Done;
                        return Poll::Ready(Some(Err(err)));
                    }
                },
                State::Streaming(resp) => match ready!(resp.as_mut().poll_event(cx)) {
                    Ok(Some(event)) => {
                        if let Some(chunk) = this.handle_event(event) {
                            return Poll::Ready(Some(Ok(chunk)));
                        }
                    }
                    Ok(None) => {
                        // Release the response as soon as it completes.
                        this.state = State::Done;
                        if !this.has_content {
                            return Poll::Ready(Some(Err(Error::empty_response())));
                        }
                        return Poll::Ready(None);
                    }
                    Err(err) => {
                        error!("response failed: {err}");
                        this.state = State::Done;
                        return Poll::Ready(Some(Err(err)));
                    }
                },
                State::Done => return Poll::Ready(None),
            }
        }
    }
}

/// One incremental unit of a streamed response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseChunk {
    /// The author of the chunk, always [`Role::Assistant`].
    pub role: Role,
    /// The content of the chunk.
    pub content: ChunkContent,
}

impl ResponseChunk {
    /// Returns the text fragment, empty for non-text chunks.
    #[inline]
    pub fn text(&self) -> &str {
        match &self.content {
            ChunkContent::Text(text) => text,
            _ => "",
        }
    }
}

/// The content of a [`ResponseChunk`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChunkContent {
    /// A text fragment.
    Text(String),
    /// A fragment of the model's extended thinking.
    Thinking(String),
    /// The signature of the preceding thinking.
    ThinkingSignature(String),
    /// A complete tool use.
    ToolUse(ToolUse),
}

/// One content item of a [`ChatResponse`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContent {
    /// Text, consecutive deltas merged.
    Text {
        /// The text.
        text: String,
    },
    /// Extended thinking, consecutive deltas merged.
    Thinking {
        /// The thinking.
        thinking: String,
        /// The backend's signature, required to send the thinking back.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// A tool use.
    ToolUse(ToolUse),
}

/// A complete response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The message identifier assigned by the backend.
    pub id: String,
    /// The model that served the request.
    pub model: String,
    /// Content items in arrival order.
    pub content: Vec<ResponseContent>,
    /// Why the model stopped.
    pub finish_reason: Option<FinishReason>,
    /// Token usage of the request.
    pub usage: Usage,
}

impl ChatResponse {
    /// Returns the concatenated text items.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ResponseContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Returns the tool uses in arrival order.
    pub fn tool_uses(&self) -> impl Iterator<Item = &ToolUse> {
        self.content.iter().filter_map(|item| match item {
            ResponseContent::ToolUse(tool_use) => Some(tool_use),
            _ => None,
        })
    }

    /// Converts the response into an assistant message, ready to be sent
    /// back in the next turn.
    ///
    /// Signed thinking is kept so that a tool-use turn can be continued
    /// with thinking enabled. Unsigned thinking is dropped since the backend
    /// would reject it.
    pub fn into_message(self) -> Message {
        let parts: Vec<_> = self
            .content
            .into_iter()
            .filter_map(|item| match item {
                ResponseContent::Text { text } => Some(ContentPart::Text { text }),
                ResponseContent::Thinking {
                    thinking,
                    signature: Some(signature),
                } => Some(ContentPart::Thinking {
                    thinking,
                    signature,
                }),
                ResponseContent::Thinking { signature: None, .. } => None,
                ResponseContent::ToolUse(tool_use) => {
                    Some(ContentPart::ToolUse(tool_use))
                }
            })
            .collect();
        Message {
            role: Role::Assistant,
            content: MessageContent::Parts(parts),
        }
    }
}

/// A [`ModelClient`] that attaches tool schemas to every request.
#[derive(Clone)]
pub struct BoundClient {
    client: ModelClient,
    tools: Arc<[ToolSchema]>,
}

impl BoundClient {
    pub(crate) fn new(client: ModelClient, tools: Vec<ToolSchema>) -> Self {
        Self {
            client,
            tools: tools.into(),
        }
    }

    /// Returns the bound tools.
    #[inline]
    pub fn tools(&self) -> &[ToolSchema] {
        &self.tools
    }

    /// Like [`ModelClient::invoke`], with the bound tools.
    pub async fn invoke(
        &self,
        messages: Vec<Message>,
        options: ModelOptions,
    ) -> Result<ChatResponse, Error> {
        self.stream(messages, options).collect_response().await
    }

    /// Like [`ModelClient::stream`], with the bound tools.
    pub fn stream(&self, messages: Vec<Message>, options: ModelOptions) -> ChatStream {
        self.client.stream_request(ModelRequest {
            messages,
            options,
            tools: self.tools.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use colloquy_model::{ErrorKind, ToolResult};
    use colloquy_test_model::{PresetEvent, PresetResponse, TestModelProvider};
    use serde_json::json;

    use super::*;

    fn hello() -> Vec<Message> {
        vec![
            Message::system("You are a helpful assistant."),
            Message::human("Hello, how are you?"),
        ]
    }

    fn greeting_provider() -> TestModelProvider {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::Thinking("A greeting, ".to_owned()),
            PresetEvent::Thinking("be polite.".to_owned()),
            PresetEvent::Text("Hello! ".to_owned()),
            PresetEvent::Text("I'm doing well.".to_owned()),
        ]));
        provider
    }

    fn calculator_use() -> ToolUse {
        ToolUse {
            id: "toolu_1".to_owned(),
            name: "calculator".to_owned(),
            input: json!({ "operation": "add", "number1": 2, "number2": 2 }),
        }
    }

    #[tokio::test]
    async fn test_invoke() {
        let client = ModelClient::new(greeting_provider());
        let resp = client
            .invoke(hello(), ModelOptions::default().with_model("m"))
            .await
            .unwrap();
        assert_eq!(resp.id, "msg_test_0");
        assert_eq!(resp.model, "m");
        assert_eq!(
            resp.content,
            vec![
                ResponseContent::Thinking {
                    thinking: "A greeting, be polite.".to_owned(),
                    signature: None,
                },
                ResponseContent::Text {
                    text: "Hello! I'm doing well.".to_owned()
                },
            ]
        );
        assert_eq!(resp.text(), "Hello! I'm doing well.");
        assert_eq!(resp.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_stream_agrees_with_invoke() {
        let client = ModelClient::new(greeting_provider());
        let mut stream = client.stream(hello(), ModelOptions::default());
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|chunk| chunk.role == Role::Assistant));
        assert_eq!(chunks[0].text(), "");
        let streamed: String = chunks.iter().map(ResponseChunk::text).collect();

        let invoked = client.invoke(hello(), ModelOptions::default()).await.unwrap();
        assert_eq!(streamed, invoked.text());
        assert_eq!(stream.id(), Some("msg_test_0"));
        assert_eq!(stream.model(), Some("test-model"));
        assert_eq!(stream.finish_reason(), Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let provider = greeting_provider();
        let client = ModelClient::new(provider.clone());
        let mut stream = client.stream(hello(), ModelOptions::default());
        assert!(provider.requests().is_empty());
        stream.next().await.unwrap().unwrap();
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_response() {
        let provider = greeting_provider();
        let client = ModelClient::new(provider.clone());
        let mut stream = client.stream(hello(), ModelOptions::default());
        stream.next().await.unwrap().unwrap();
        assert_eq!(provider.live_responses(), 1);
        drop(stream);
        assert_eq!(provider.live_responses(), 0);
    }

    #[tokio::test]
    async fn test_empty_response() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::default());
        let client = ModelClient::new(provider);
        let err = client
            .invoke(hello(), ModelOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyResponse);

        let mut stream = client.stream(hello(), ModelOptions::default());
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyResponse);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_messages() {
        let provider = greeting_provider();
        let client = ModelClient::new(provider.clone());
        let err = client
            .invoke(vec![], ModelOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_provider_errors() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_text(["never"]).with_failures(0));
        let client = ModelClient::new(provider);
        let err = client
            .invoke(hello(), ModelOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert!(err.is_retryable());
        assert!(err.source().is_some());

        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::Text("Hel".to_owned()),
            PresetEvent::Error(ErrorKind::Transport),
        ]));
        let client = ModelClient::new(provider);
        let mut stream = client.stream(hello(), ModelOptions::default());
        assert_eq!(stream.next().await.unwrap().unwrap().text(), "Hel");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_tool_use_round_trip() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::Text("Let me calculate.".to_owned()),
            PresetEvent::ToolUse(calculator_use()),
        ]));
        provider.add_response(PresetResponse::with_text(["2 + 2 = 4"]));
        let client = ModelClient::new(provider.clone());
        let bound = BoundClient::new(
            client,
            vec![ToolSchema::new("calculator", "A simple calculator.", json!({}))],
        );

        let mut messages = vec![Message::human("What is 2 + 2?")];
        let resp = bound
            .invoke(messages.clone(), ModelOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(resp.tool_uses().collect::<Vec<_>>(), vec![&calculator_use()]);

        messages.push(resp.into_message());
        messages.push(Message::human([ContentPart::ToolResult(ToolResult {
            tool_use_id: "toolu_1".to_owned(),
            content: "4".to_owned(),
            is_error: false,
        })]));
        let resp = bound
            .invoke(messages, ModelOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.text(), "2 + 2 = 4");

        let requests = provider.requests();
        assert!(requests.iter().all(|req| req.tools.len() == 1));
        assert_eq!(
            requests[1].messages[1].content,
            MessageContent::Parts(vec![
                ContentPart::text("Let me calculate."),
                ContentPart::ToolUse(calculator_use()),
            ])
        );
    }

    #[tokio::test]
    async fn test_signed_thinking_is_carried_over() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::Thinking("Needs ".to_owned()),
            PresetEvent::Thinking("the calculator.".to_owned()),
            PresetEvent::ThinkingSignature("SIG123".to_owned()),
            PresetEvent::Thinking("Unsigned.".to_owned()),
            PresetEvent::ToolUse(calculator_use()),
        ]));
        let client = ModelClient::new(provider);
        let resp = client
            .invoke(hello(), ModelOptions::default().with_thinking_budget(1024))
            .await
            .unwrap();
        assert_eq!(
            resp.content,
            vec![
                ResponseContent::Thinking {
                    thinking: "Needs the calculator.".to_owned(),
                    signature: Some("SIG123".to_owned()),
                },
                ResponseContent::Thinking {
                    thinking: "Unsigned.".to_owned(),
                    signature: None,
                },
                ResponseContent::ToolUse(calculator_use()),
            ]
        );
        assert_eq!(
            resp.into_message().content,
            MessageContent::Parts(vec![
                ContentPart::Thinking {
                    thinking: "Needs the calculator.".to_owned(),
                    signature: "SIG123".to_owned(),
                },
                ContentPart::ToolUse(calculator_use()),
            ])
        );
    }

    #[test]
    fn test_response_serialized_form() {
        let resp = ChatResponse {
            id: "msg_1".to_owned(),
            model: "m".to_owned(),
            content: vec![
                ResponseContent::Text {
                    text: "Let me calculate.".to_owned(),
                },
                ResponseContent::ToolUse(calculator_use()),
            ],
            finish_reason: Some(FinishReason::ToolUse),
            usage: Usage {
                input_tokens: 3,
                output_tokens: 5,
            },
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][1]["type"], "tool_use");
        assert_eq!(value["content"][1]["name"], "calculator");
        assert_eq!(value["finish_reason"], "tool_use");
    }
}
