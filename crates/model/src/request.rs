use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Message;

/// A request to be sent to the model provider.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    /// The input messages.
    pub messages: Vec<Message>,
    /// Sampling and routing options.
    pub options: ModelOptions,
    /// Tools that are available to the model.
    pub tools: Vec<ToolSchema>,
}

/// Per-call options.
///
/// Every field is optional, unset fields fall back to the provider
/// configuration or the backend defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// The model identifier.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Nucleus-sampling threshold.
    pub top_p: Option<f32>,
    /// Only sample from the top K options for each token.
    pub top_k: Option<u32>,
    /// The maximum number of tokens to generate.
    pub max_tokens: Option<u32>,
    /// Custom sequences that stop the generation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// How the model should pick among the bound tools.
    pub tool_choice: Option<ToolChoice>,
    /// Enables extended thinking with the given token budget.
    pub thinking_budget: Option<u32>,
}

impl ModelOptions {
    /// Sets the model identifier.
    #[inline]
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the sampling temperature.
    #[inline]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the nucleus-sampling threshold.
    #[inline]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Sets the top-K restriction.
    #[inline]
    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Sets the maximum number of tokens to generate.
    #[inline]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Adds a stop sequence.
    #[inline]
    pub fn with_stop_sequence<S: Into<String>>(mut self, stop: S) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }

    /// Sets the tool choice.
    #[inline]
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }

    /// Enables extended thinking.
    #[inline]
    pub fn with_thinking_budget(mut self, budget_tokens: u32) -> Self {
        self.thinking_budget = Some(budget_tokens);
        self
    }
}

/// Controls whether and which tool the model must call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// The model must call one of the tools.
    Any,
    /// The model must call the named tool.
    Tool(String),
    /// The model must not call any tool.
    None,
}

/// Describes a tool that can be used by the model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Name of the tool, unique within one request.
    pub name: String,
    /// Description of the tool.
    pub description: String,
    /// Parameters definition of the tool.
    ///
    /// For most model providers, the parameters should typically be
    /// defined by a [JSON schema](https://json-schema.org/).
    pub parameters: Value,
}

impl ToolSchema {
    /// Creates a tool schema.
    #[inline]
    pub fn new<N: Into<String>, D: Into<String>>(
        name: N,
        description: D,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}
