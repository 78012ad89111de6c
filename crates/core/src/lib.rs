//! A chat model client: whole or streamed responses, tool binding and
//! output parsing over any [`ModelProvider`].

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod error;
mod model_client;
pub mod parser;
pub mod tool;

pub use colloquy_model::{
    ContentPart, ErrorKind, FinishReason, ImageSource, Message,
    MessageContent, ModelOptions, ModelProvider, Role, ToolChoice, ToolResult,
    ToolSchema, ToolUse, Usage,
};
pub use error::Error;
pub use model_client::{
    BoundClient, ChatResponse, ChatStream, ChunkContent, ModelClient,
    ResponseChunk, ResponseContent,
};
pub use parser::{OutputParser, StringOutputParser, ToolUseParser};
pub use tool::{Tool, bind};
