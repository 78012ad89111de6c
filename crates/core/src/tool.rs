//! Tool binding and typed tools.

use colloquy_model::{ToolSchema, ToolUse};
use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{BoundClient, Error, ModelClient};

/// A tool the model can ask to use.
///
/// The input type describes the arguments, its JSON schema is what the
/// model sees. Executing the tool is up to the caller.
pub trait Tool {
    /// The arguments of the tool.
    type Input: JsonSchema + DeserializeOwned;

    /// Returns the name of the tool.
    fn name(&self) -> &str;

    /// Returns the description of the tool.
    fn description(&self) -> &str;

    /// Returns the schema to advertise to the model.
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            self.name(),
            self.description(),
            input_schema::<Self::Input>(),
        )
    }

    /// Decodes the arguments of a tool use addressed to this tool.
    fn parse(&self, tool_use: &ToolUse) -> Result<Self::Input, Error> {
        if tool_use.name != self.name() {
            return Err(Error::validation(format!(
                "tool use `{}` is not addressed to `{}`",
                tool_use.name,
                self.name()
            )));
        }
        serde_json::from_value(tool_use.input.clone()).map_err(|err| {
            Error::validation(format!(
                "invalid input for `{}`: {err}",
                tool_use.name
            ))
        })
    }
}

/// Generates the JSON schema of a tool input type.
///
/// The `$schema` and `title` keywords are dropped, they carry nothing for
/// the model.
pub fn input_schema<T: JsonSchema>() -> Value {
    let mut schema = schema_for!(T).to_value();
    if let Value::Object(map) = &mut schema {
        map.remove("$schema");
        map.remove("title");
    }
    schema
}

/// Binds `tools` to `client`, every request of the returned client
/// advertises them.
///
/// The schemas are not validated locally, the backend reports malformed
/// ones.
#[inline]
pub fn bind<I>(client: &ModelClient, tools: I) -> BoundClient
where
    I: IntoIterator<Item = ToolSchema>,
{
    BoundClient::new(client.clone(), tools.into_iter().collect())
}

impl ModelClient {
    /// Same as [`bind`].
    #[inline]
    pub fn bind_tools<I>(&self, tools: I) -> BoundClient
    where
        I: IntoIterator<Item = ToolSchema>,
    {
        bind(self, tools)
    }
}

#[cfg(test)]
mod tests {
    use colloquy_model::{ErrorKind, Message, ModelOptions};
    use colloquy_test_model::{PresetEvent, PresetResponse, TestModelProvider};
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize, JsonSchema)]
    #[serde(rename_all = "lowercase")]
    enum Operation {
        Add,
        Subtract,
        Multiply,
        Divide,
    }

    #[derive(Debug, PartialEq, Deserialize, JsonSchema)]
    struct CalculatorInput {
        /// The operation to perform.
        operation: Operation,
        /// The first number.
        number1: f64,
        /// The second number.
        number2: f64,
    }

    struct Calculator;

    impl Tool for Calculator {
        type Input = CalculatorInput;

        fn name(&self) -> &str {
            "calculator"
        }

        fn description(&self) -> &str {
            "A simple calculator tool."
        }
    }

    #[test]
    fn test_schema() {
        let schema = Calculator.schema();
        assert_eq!(schema.name, "calculator");
        assert_eq!(schema.description, "A simple calculator tool.");

        let parameters = &schema.parameters;
        assert_eq!(parameters["type"], "object");
        assert!(parameters.get("$schema").is_none());
        assert!(parameters.get("title").is_none());
        assert_eq!(parameters["properties"]["number1"]["type"], "number");
        assert_eq!(
            parameters["properties"]["number1"]["description"],
            "The first number."
        );
        assert_eq!(
            parameters["required"],
            json!(["operation", "number1", "number2"])
        );
    }

    #[test]
    fn test_parse() {
        let tool_use = ToolUse {
            id: "toolu_1".to_owned(),
            name: "calculator".to_owned(),
            input: json!({ "operation": "add", "number1": 2, "number2": 2 }),
        };
        assert_eq!(
            Calculator.parse(&tool_use).unwrap(),
            CalculatorInput {
                operation: Operation::Add,
                number1: 2.0,
                number2: 2.0,
            }
        );

        let mismatched = ToolUse {
            input: json!({ "operation": "power" }),
            ..tool_use.clone()
        };
        let err = Calculator.parse(&mismatched).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let misaddressed = ToolUse {
            name: "weather".to_owned(),
            ..tool_use
        };
        let err = Calculator.parse(&misaddressed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_bound_requests_carry_tools() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::ToolUse(ToolUse {
                id: "toolu_1".to_owned(),
                name: "calculator".to_owned(),
                input: json!({ "operation": "add", "number1": 2, "number2": 2 }),
            }),
        ]));
        let client = ModelClient::new(provider.clone());
        let bound = client.bind_tools([Calculator.schema()]);
        assert_eq!(bound.tools().len(), 1);

        let resp = bound
            .invoke(
                vec![Message::human("What is 2 + 2?")],
                ModelOptions::default(),
            )
            .await
            .unwrap();
        let tool_use = resp.tool_uses().next().unwrap();
        assert_eq!(Calculator.parse(tool_use).unwrap().operation, Operation::Add);

        // The unbound client sends no tools.
        client
            .invoke(vec![Message::human("Hi")], ModelOptions::default())
            .await
            .unwrap();
        let requests = provider.requests();
        assert_eq!(requests[0].tools, vec![Calculator.schema()]);
        assert!(requests[1].tools.is_empty());
    }
}
