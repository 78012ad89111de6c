//! Turning responses into plain values.

use colloquy_model::ToolUse;

use crate::{ChatResponse, Error};

/// Extracts a value from a complete response.
pub trait OutputParser {
    /// The parsed value.
    type Output;

    /// Parses `response`.
    fn parse(&self, response: &ChatResponse) -> Result<Self::Output, Error>;
}

/// Concatenates the text items of a response. Everything else is skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringOutputParser;

impl OutputParser for StringOutputParser {
    type Output = String;

    #[inline]
    fn parse(&self, response: &ChatResponse) -> Result<String, Error> {
        Ok(response.text())
    }
}

/// Collects the tool uses of a response in arrival order.
#[derive(Clone, Copy, Debug, Default)]
pub struct ToolUseParser;

impl OutputParser for ToolUseParser {
    type Output = Vec<ToolUse>;

    #[inline]
    fn parse(&self, response: &ChatResponse) -> Result<Vec<ToolUse>, Error> {
        Ok(response.tool_uses().cloned().collect())
    }
}
