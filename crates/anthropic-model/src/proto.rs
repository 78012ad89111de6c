use colloquy_model::{
    ContentPart, ErrorKind, FinishReason, ImageSource, Message, MessageContent,
    ModelRequest, Role, ToolChoice, ToolSchema, Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AnthropicConfig, Error};

// ------------------------------
// Types received from the server
// ------------------------------

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<UsageBody>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct MessageStart {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub usage: Option<UsageBody>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        // Empty when streamed, the signature then arrives as a delta.
        #[serde(default)]
        signature: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
pub struct UsageBody {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl From<UsageBody> for Usage {
    #[inline]
    fn from(value: UsageBody) -> Self {
        Usage {
            input_tokens: value.input_tokens,
            output_tokens: value.output_tokens,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl ApiError {
    pub fn error_kind(&self) -> ErrorKind {
        match self.kind.as_str() {
            "authentication_error" | "permission_error" => ErrorKind::Auth,
            "invalid_request_error" | "not_found_error"
            | "request_too_large" => ErrorKind::Validation,
            "rate_limit_error" => ErrorKind::RateLimitExceeded,
            "timeout_error" => ErrorKind::Transport,
            _ => ErrorKind::Other,
        }
    }
}

/// A complete (non-streaming) message, or an error object.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Message(MessageBody),
    Error { error: ApiError },
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct MessageBody {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageBody>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ModelPage {
    pub data: Vec<ModelEntry>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub last_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub created_at: String,
}

pub fn finish_reason(stop_reason: &str) -> FinishReason {
    match stop_reason {
        "max_tokens" => FinishReason::MaxTokens,
        "stop_sequence" => FinishReason::StopSequence,
        "tool_use" => FinishReason::ToolUse,
        _ => FinishReason::Stop,
    }
}

// ------------------------
// Types sent to the server
// ------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
struct Tool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireToolChoice {
    Auto,
    Any,
    Tool { name: String },
    None,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct Thinking {
    r#type: &'static str,
    budget_tokens: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    Image {
        source: WireImageSource,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Blocks(Vec<Block>),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Content,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<WireToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Thinking>,
    stream: bool,
}

// -----------
// Conversions
// -----------

pub fn create_request(
    req: &ModelRequest,
    config: &AnthropicConfig,
) -> Result<MessagesRequest, Error> {
    let Some(model) = config.resolve_model(req.options.model.as_deref())
    else {
        return Err(Error::validation(
            "no model specified, set one in the options, the config or ANTHROPIC_MODEL",
        ));
    };

    let mut system = Vec::new();
    let mut messages = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        if msg.role == Role::System {
            let Some(text) = msg.content.as_text() else {
                return Err(Error::validation(
                    "system messages may only contain text",
                ));
            };
            system.push(text.into_owned());
            continue;
        }
        messages.push(create_message(msg)?);
    }
    if messages.is_empty() {
        return Err(Error::validation(
            "at least one human or assistant message is required",
        ));
    }

    let options = &req.options;
    Ok(MessagesRequest {
        model,
        max_tokens: options.max_tokens.unwrap_or(config.max_tokens),
        system: if system.is_empty() {
            None
        } else {
            Some(system.join("\n\n"))
        },
        messages,
        temperature: options.temperature,
        top_p: options.top_p,
        top_k: options.top_k,
        stop_sequences: options.stop_sequences.clone(),
        tools: req.tools.iter().map(create_tool).collect(),
        tool_choice: options.tool_choice.as_ref().map(create_tool_choice),
        thinking: options.thinking_budget.map(|budget_tokens| Thinking {
            r#type: "enabled",
            budget_tokens,
        }),
        stream: true,
    })
}

fn create_message(msg: &Message) -> Result<WireMessage, Error> {
    let role = match msg.role {
        Role::Human => "user",
        Role::Assistant => "assistant",
        Role::System => unreachable!("system messages are hoisted"),
    };
    let content = match &msg.content {
        MessageContent::Text(text) => Content::Text(text.clone()),
        MessageContent::Parts(parts) => Content::Blocks(
            parts
                .iter()
                .map(|part| create_block(msg.role, part))
                .collect::<Result<_, _>>()?,
        ),
    };
    Ok(WireMessage { role, content })
}

fn create_block(role: Role, part: &ContentPart) -> Result<Block, Error> {
    let block = match (role, part) {
        (_, ContentPart::Text { text }) => Block::Text { text: text.clone() },
        (Role::Human, ContentPart::Image { source }) => Block::Image {
            source: match source {
                ImageSource::Base64 { media_type, data } => {
                    WireImageSource::Base64 {
                        media_type: media_type.clone(),
                        data: data.clone(),
                    }
                }
                ImageSource::Url { url } => {
                    WireImageSource::Url { url: url.clone() }
                }
            },
        },
        (Role::Human, ContentPart::ToolResult(result)) => Block::ToolResult {
            tool_use_id: result.tool_use_id.clone(),
            content: result.content.clone(),
            is_error: result.is_error,
        },
        (Role::Assistant, ContentPart::Thinking { thinking, signature }) => {
            Block::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            }
        }
        (Role::Assistant, ContentPart::ToolUse(tool_use)) => Block::ToolUse {
            id: tool_use.id.clone(),
            name: tool_use.name.clone(),
            input: tool_use.input.clone(),
        },
        (role, part) => {
            return Err(Error::validation(format!(
                "`{}` parts are not supported in {role:?} messages",
                part.kind()
            )));
        }
    };
    Ok(block)
}

#[inline]
fn create_tool(tool: &ToolSchema) -> Tool {
    Tool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.parameters.clone(),
    }
}

#[inline]
fn create_tool_choice(choice: &ToolChoice) -> WireToolChoice {
    match choice {
        ToolChoice::Auto => WireToolChoice::Auto,
        ToolChoice::Any => WireToolChoice::Any,
        ToolChoice::Tool(name) => WireToolChoice::Tool { name: name.clone() },
        ToolChoice::None => WireToolChoice::None,
    }
}
