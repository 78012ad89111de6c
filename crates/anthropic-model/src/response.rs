use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use colloquy_model::{
    ErrorKind, ModelResponse, ModelResponseEvent, ResponseMetadata, ToolUse,
};
use pin_project_lite::pin_project;
use serde_json::Value;

use crate::Error;
use crate::io::{Sse, SseError};
use crate::proto::{self, ContentBlock, ContentDelta, MessageBody, StreamEvent};

// A tool use whose input is still arriving as JSON fragments.
struct PartialToolUse {
    index: usize,
    id: String,
    name: String,
    initial_input: Value,
    input_json: String,
}

impl PartialToolUse {
    fn finish(self) -> Result<ToolUse, Error> {
        let input = if self.input_json.trim().is_empty() {
            self.initial_input
        } else {
            serde_json::from_str(&self.input_json).map_err(|err| {
                Error::new(
                    format!("malformed input of tool `{}`: {err}", self.name),
                    ErrorKind::Other,
                )
            })?
        };
        Ok(ToolUse {
            id: self.id,
            name: self.name,
            input,
        })
    }
}

struct PartialState {
    // `None` when the whole message was received upfront.
    sse: Option<Sse>,
    // Decoded events that are not yet delivered to the caller.
    pending: VecDeque<ModelResponseEvent>,
    tool_uses: Vec<PartialToolUse>,
    started: bool,
    stopped: bool,
}

impl PartialState {
    fn apply(&mut self, event: StreamEvent) -> Result<(), Error> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.started = true;
                self.pending.push_back(ModelResponseEvent::Started(
                    ResponseMetadata {
                        id: message.id,
                        model: message.model,
                    },
                ));
                if let Some(usage) = message.usage {
                    self.pending
                        .push_back(ModelResponseEvent::Usage(usage.into()));
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.start_block(index, content_block),
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta { text } => {
                    self.push_text(text);
                }
                ContentDelta::ThinkingDelta { thinking } => {
                    self.push_thinking(thinking);
                }
                ContentDelta::SignatureDelta { signature } => {
                    self.push_signature(signature);
                }
                ContentDelta::InputJsonDelta { partial_json } => {
                    let Some(tool_use) =
                        self.tool_uses.iter_mut().find(|t| t.index == index)
                    else {
                        return Err(Error::new(
                            format!("input delta for unknown block {index}"),
                            ErrorKind::Other,
                        ));
                    };
                    tool_use.input_json.push_str(&partial_json);
                }
                ContentDelta::Unknown => {}
            },
            StreamEvent::ContentBlockStop { index } => {
                let Some(pos) =
                    self.tool_uses.iter().position(|t| t.index == index)
                else {
                    return Ok(());
                };
                let tool_use = self.tool_uses.remove(pos).finish()?;
                self.pending.push_back(ModelResponseEvent::ToolUse(tool_use));
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.pending
                        .push_back(ModelResponseEvent::Usage(usage.into()));
                }
                if let Some(stop_reason) = delta.stop_reason {
                    self.pending.push_back(ModelResponseEvent::Completed(
                        proto::finish_reason(&stop_reason),
                    ));
                }
            }
            StreamEvent::MessageStop => {
                self.stopped = true;
            }
            StreamEvent::Ping | StreamEvent::Unknown => {}
            StreamEvent::Error { error } => {
                return Err(Error::from_api_error(error));
            }
        }
        Ok(())
    }

    fn start_block(&mut self, index: usize, block: ContentBlock) {
        match block {
            ContentBlock::Text { text } => self.push_text(text),
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                self.push_thinking(thinking);
                self.push_signature(signature);
            }
            ContentBlock::ToolUse { id, name, input } => {
                self.tool_uses.push(PartialToolUse {
                    index,
                    id,
                    name,
                    initial_input: input,
                    input_json: String::new(),
                });
            }
            ContentBlock::Unknown => {
                trace!("skipping unknown content block {index}");
            }
        }
    }

    #[inline]
    fn push_text(&mut self, text: String) {
        if !text.is_empty() {
            self.pending.push_back(ModelResponseEvent::TextDelta(text));
        }
    }

    #[inline]
    fn push_thinking(&mut self, thinking: String) {
        if !thinking.is_empty() {
            self.pending
                .push_back(ModelResponseEvent::ThinkingDelta(thinking));
        }
    }

    #[inline]
    fn push_signature(&mut self, signature: String) {
        if !signature.is_empty() {
            self.pending
                .push_back(ModelResponseEvent::ThinkingSignature(signature));
        }
    }
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    /// A streaming response from the Messages API.
    pub struct AnthropicResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
    }
}

impl AnthropicResponse {
    #[inline]
    pub(crate) fn from_sse(sse: Sse) -> Self {
        Self::from_state(PartialState {
            sse: Some(sse),
            pending: Default::default(),
            tool_uses: Default::default(),
            started: false,
            stopped: false,
        })
    }

    /// Replays a complete message as the events a stream would produce.
    pub(crate) fn from_message(message: MessageBody) -> Result<Self, Error> {
        let mut state = PartialState {
            sse: None,
            pending: Default::default(),
            tool_uses: Default::default(),
            started: true,
            stopped: true,
        };
        state.pending.push_back(ModelResponseEvent::Started(ResponseMetadata {
            id: message.id,
            model: message.model,
        }));
        for (index, block) in message.content.into_iter().enumerate() {
            state.start_block(index, block);
            if let Some(pos) = state.tool_uses.iter().position(|t| t.index == index)
            {
                let tool_use = state.tool_uses.remove(pos).finish()?;
                state.pending.push_back(ModelResponseEvent::ToolUse(tool_use));
            }
        }
        if let Some(usage) = message.usage {
            state.pending.push_back(ModelResponseEvent::Usage(usage.into()));
        }
        if let Some(stop_reason) = message.stop_reason {
            state.pending.push_back(ModelResponseEvent::Completed(
                proto::finish_reason(&stop_reason),
            ));
        }
        Ok(Self::from_state(state))
    }

    #[inline]
    fn from_state(partial_state: PartialState) -> Self {
        let next_event_fut = async move { next_event(partial_state).await };
        Self {
            next_event_fut: Some(Box::pin(next_event_fut)),
        }
    }
}

impl ModelResponse for AnthropicResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, _)) => {
                    // Dropping the state drops the connection.
                    *this.next_event_fut = None;
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        // The stream may still have more data to pull, create a new future for
        // the next event.
        let next_event_fut = async move { next_event(partial_state).await };
        *this.next_event_fut = Some(Box::pin(next_event_fut));

        Poll::Ready(Ok(Some(event)))
    }
}

async fn next_event(mut partial_state: PartialState) -> NextEvent {
    loop {
        if let Some(event) = partial_state.pending.pop_front() {
            return Ok((Some(event), partial_state));
        }
        if partial_state.stopped {
            return Ok((None, partial_state));
        }
        let Some(sse) = &mut partial_state.sse else {
            return Ok((None, partial_state));
        };

        let sse_event = match sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                return Err(Error::new(
                    "connection closed before the message was complete",
                    ErrorKind::Transport,
                ));
            }
            Err(SseError::ChunksError(err)) => {
                return Err(Error::new(err.0, ErrorKind::Transport));
            }
            Err(err) => {
                return Err(Error::new(format!("{err:?}"), ErrorKind::Other));
            }
        };
        trace!("got sse event: {sse_event}");

        let event = serde_json::from_str::<StreamEvent>(&sse_event.data)
            .map_err(|err| {
                Error::new(format!("malformed event: {err}"), ErrorKind::Other)
            })?;
        if !partial_state.started
            && !matches!(
                event,
                StreamEvent::MessageStart { .. }
                    | StreamEvent::Ping
                    | StreamEvent::Error { .. }
            )
        {
            return Err(Error::new(
                "stream did not begin with message_start",
                ErrorKind::Other,
            ));
        }
        partial_state.apply(event)?;
    }
}
