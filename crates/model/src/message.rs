use std::borrow::Cow;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mime::Mime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ErrorKind;

/// Image media types the hosted models accept.
pub const SUPPORTED_IMAGE_TYPES: [&str; 4] =
    ["image/jpeg", "image/png", "image/gif", "image/webp"];

/// The author of a message.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// The user.
    Human,
    /// The model.
    Assistant,
}

/// A complete message in a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    /// Who wrote this message.
    pub role: Role,
    /// The content of the message.
    pub content: MessageContent,
}

impl Message {
    /// Creates a system instruction.
    #[inline]
    pub fn system<S: Into<String>>(text: S) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Creates a user message, from plain text or a list of parts.
    #[inline]
    pub fn human<C: Into<MessageContent>>(content: C) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
        }
    }

    /// Creates an assistant message, from plain text or a list of parts.
    #[inline]
    pub fn assistant<C: Into<MessageContent>>(content: C) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The content of a message, either plain text or ordered typed parts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Typed parts, kept in declaration order.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Returns the content as text if it has only text parts.
    ///
    /// Text parts are concatenated without separators. Returns `None` if
    /// any non-text part is present.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            MessageContent::Text(text) => Some(Cow::Borrowed(text)),
            MessageContent::Parts(parts) => {
                let mut text = String::new();
                for part in parts {
                    let ContentPart::Text { text: fragment } = part else {
                        return None;
                    };
                    text.push_str(fragment);
                }
                Some(Cow::Owned(text))
            }
        }
    }

    /// Returns `true` if there is nothing to send.
    #[inline]
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    #[inline]
    fn from(value: String) -> Self {
        MessageContent::Text(value)
    }
}

impl From<&str> for MessageContent {
    #[inline]
    fn from(value: &str) -> Self {
        MessageContent::Text(value.to_owned())
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    #[inline]
    fn from(value: Vec<ContentPart>) -> Self {
        MessageContent::Parts(value)
    }
}

impl<const N: usize> From<[ContentPart; N]> for MessageContent {
    #[inline]
    fn from(value: [ContentPart; N]) -> Self {
        MessageContent::Parts(value.into())
    }
}

/// One typed unit of message content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// A text fragment.
    Text {
        /// The text.
        text: String,
    },
    /// An image.
    Image {
        /// Where the image data comes from.
        source: ImageSource,
    },
    /// Extended thinking produced by the model in an earlier turn.
    ///
    /// Only valid in assistant messages. The signature must be sent back
    /// unchanged.
    Thinking {
        /// The thinking text.
        thinking: String,
        /// The backend's signature over the thinking text.
        signature: String,
    },
    /// A tool call previously requested by the model.
    ToolUse(ToolUse),
    /// The result of a tool call, sent back by the user.
    ToolResult(ToolResult),
}

impl ContentPart {
    /// Creates a text part.
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Creates an image part.
    #[inline]
    pub fn image(source: ImageSource) -> Self {
        ContentPart::Image { source }
    }

    /// Returns the discriminating kind of this part, as it appears on the
    /// wire.
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            ContentPart::Text { .. } => "text",
            ContentPart::Image { .. } => "image",
            ContentPart::Thinking { .. } => "thinking",
            ContentPart::ToolUse(_) => "tool_use",
            ContentPart::ToolResult(_) => "tool_result",
        }
    }
}

/// The payload of an image part.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    /// Inline base64-encoded bytes.
    Base64 {
        /// The MIME type of the image, e.g. `image/png`.
        media_type: String,
        /// The base64-encoded image bytes.
        data: String,
    },
    /// An image the backend fetches by itself.
    Url {
        /// The image URL.
        url: String,
    },
}

impl ImageSource {
    /// Parses a `data:<media type>;base64,<payload>` URL.
    pub fn from_data_url(url: &str) -> Result<Self, ContentError> {
        let Some(rest) = url.trim().strip_prefix("data:") else {
            return Err(ContentError::new("image URL is not a data URL"));
        };
        let Some((header, data)) = rest.split_once(',') else {
            return Err(ContentError::new("data URL has no payload"));
        };
        let Some(media_type) = header.strip_suffix(";base64") else {
            return Err(ContentError::new(
                "only base64-encoded data URLs are supported",
            ));
        };
        let media_type = check_media_type(media_type)?;
        STANDARD.decode(data).map_err(|err| {
            ContentError::new(format!("invalid base64 image payload: {err}"))
        })?;
        Ok(ImageSource::Base64 {
            media_type,
            data: data.to_owned(),
        })
    }

    /// Encodes raw image bytes.
    pub fn from_bytes(
        media_type: &str,
        bytes: &[u8],
    ) -> Result<Self, ContentError> {
        Ok(ImageSource::Base64 {
            media_type: check_media_type(media_type)?,
            data: STANDARD.encode(bytes),
        })
    }

    /// References an image by URL.
    #[inline]
    pub fn from_url<S: Into<String>>(url: S) -> Self {
        ImageSource::Url { url: url.into() }
    }
}

fn check_media_type(raw: &str) -> Result<String, ContentError> {
    let mime: Mime = raw.trim().parse().map_err(|_| {
        ContentError::new(format!("invalid media type `{raw}`"))
    })?;
    if mime.type_() != mime::IMAGE {
        return Err(ContentError::new(format!("`{raw}` is not an image type")));
    }
    let essence = mime.essence_str().to_ascii_lowercase();
    if !SUPPORTED_IMAGE_TYPES.contains(&essence.as_str()) {
        return Err(ContentError::new(format!(
            "unsupported image type `{essence}`"
        )));
    }
    Ok(essence)
}

/// Describes a tool call request from the model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolUse {
    /// The unique identifier for the tool call request.
    pub id: String,
    /// The name of the tool to call.
    pub name: String,
    /// The arguments, usually a JSON object matching the tool schema.
    pub input: Value,
}

/// The result of calling a tool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolResult {
    /// The identifier of the [`ToolUse`] this result answers.
    pub tool_use_id: String,
    /// The result of the tool call.
    pub content: String,
    /// Whether the tool call failed.
    #[serde(default)]
    pub is_error: bool,
}

/// The error returned when message content is malformed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentError {
    reason: String,
}

impl ContentError {
    /// Creates an error with the given reason.
    #[inline]
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Returns the reason for the error.
    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns the kind of this error, which is always
    /// [`ErrorKind::Validation`].
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl Display for ContentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl Error for ContentError {}
