use crate::error::ProviderError;
use crate::traits::{ChatMessage, ChatRequest, ChatResponse, Provider, ToolCall, ToolSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool<'a>>>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage<'a> {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCallRequest<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct OpenAIToolCallRequest<'a> {
    id: &'a str,
    r#type: &'static str,
    function: OpenAIFunctionRequest<'a>,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionRequest<'a> {
    name: &'a str,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAITool<'a> {
    r#type: &'static str,
    function: OpenAIToolFunction<'a>,
}

#[derive(Debug, Serialize)]
struct OpenAIToolFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAIToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    id: String,
    function: OpenAIFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunction {
    name: String,
    arguments: String,
}

/// Any backend speaking the OpenAI chat-completions wire format.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    name: &'static str,
    extra_headers: Vec<(&'static str, String)>,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            name: "openai",
            extra_headers: Vec::new(),
        }
    }

    pub fn openrouter(api_key: impl Into<String>) -> Self {
        let mut provider = Self::new(api_key)
            .with_base_url(OPENROUTER_BASE_URL)
            .with_header("X-Title", "Halyard");
        provider.name = "openrouter";
        provider
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let url = base_url.into();
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.extra_headers.push((name, value.into()));
        self
    }

    fn convert_messages(messages: &[ChatMessage]) -> Vec<OpenAIMessage<'_>> {
        messages
            .iter()
            .map(|m| {
                let tool_calls = m.tool_calls.as_ref().map(|tool_calls| {
                    tool_calls
                        .iter()
                        .map(|tc| OpenAIToolCallRequest {
                            id: &tc.id,
                            r#type: "function",
                            function: OpenAIFunctionRequest {
                                name: &tc.name,
                                arguments: Value::Object(tc.arguments.clone()).to_string(),
                            },
                        })
                        .collect()
                });

                let text = m.text();
                let content = if text.is_empty() && tool_calls.is_some() {
                    None
                } else {
                    Some(text)
                };

                OpenAIMessage {
                    role: m.role.as_str(),
                    content,
                    tool_calls,
                    tool_call_id: m.tool_call_id.as_deref(),
                }
            })
            .collect()
    }

    fn convert_tools(tools: &[ToolSpec]) -> Vec<OpenAITool<'_>> {
        tools
            .iter()
            .map(|t| OpenAITool {
                r#type: "function",
                function: OpenAIToolFunction {
                    name: &t.name,
                    description: &t.description,
                    parameters: &t.parameters_schema,
                },
            })
            .collect()
    }

    fn parse_response(response: OpenAIResponse) -> Result<ChatResponse, ProviderError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("no choices in response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| -> Result<ToolCall, ProviderError> {
                Ok(ToolCall {
                    arguments: parse_arguments(&c.function.name, &c.function.arguments)?,
                    id: c.id,
                    name: c.function.name,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let text = choice.message.content.filter(|c| !c.trim().is_empty());
        if text.is_none() && tool_calls.is_empty() {
            return Err(ProviderError::Malformed(
                "empty response: no content or tool calls".into(),
            ));
        }

        Ok(ChatResponse { text, tool_calls })
    }
}

/// Arguments arrive as a JSON-encoded string. An empty string means no
/// arguments.
fn parse_arguments(tool: &str, raw: &str) -> Result<Map<String, Value>, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ProviderError::Malformed(format!(
            "arguments for {tool} are not an object: {other}"
        ))),
        Err(e) => Err(ProviderError::Malformed(format!(
            "arguments for {tool} are not valid JSON: {e}"
        ))),
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        temperature: f64,
    ) -> Result<ChatResponse, ProviderError> {
        let openai_request = OpenAIRequest {
            model,
            messages: Self::convert_messages(request.messages),
            tools: request.tools.map(Self::convert_tools),
            temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        for (name, value) in &self.extra_headers {
            builder = builder.header(*name, value);
        }

        let response = builder.json(&openai_request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unavailable(format!(
                "{} API error {}: {}",
                self.name, status, error_text
            )));
        }

        let openai_response: OpenAIResponse = response.json().await?;
        Self::parse_response(openai_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ToolResult;
    use serde_json::json;

    fn response(value: Value) -> OpenAIResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn tool_call_arguments_are_parsed() {
        let parsed = OpenAIProvider::parse_response(response(json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {"name": "read_local_config", "arguments": "{\"file_name\":\"app.toml\"}"}
                }]
            }}]
        })))
        .unwrap();

        assert_eq!(parsed.text, None);
        assert_eq!(parsed.tool_calls[0].id, "call_9");
        assert_eq!(parsed.tool_calls[0].arguments["file_name"], "app.toml");
    }

    #[test]
    fn bad_arguments_are_malformed() {
        for raw in ["[1,2]", "{not json"] {
            let result = OpenAIProvider::parse_response(response(json!({
                "choices": [{"message": {
                    "tool_calls": [{"id": "c", "function": {"name": "list_scripts", "arguments": raw}}]
                }}]
            })));
            assert!(matches!(result, Err(ProviderError::Malformed(_))), "{raw}");
        }
    }

    #[test]
    fn empty_arguments_string_is_empty_object() {
        let parsed = OpenAIProvider::parse_response(response(json!({
            "choices": [{"message": {
                "tool_calls": [{"id": "c", "function": {"name": "list_scripts", "arguments": ""}}]
            }}]
        })))
        .unwrap();
        assert!(parsed.tool_calls[0].arguments.is_empty());
    }

    #[test]
    fn no_choices_or_empty_message_is_malformed() {
        assert!(matches!(
            OpenAIProvider::parse_response(response(json!({"choices": []}))),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            OpenAIProvider::parse_response(response(json!({
                "choices": [{"message": {"content": "  "}}]
            }))),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn messages_carry_tool_call_ids() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "execute_script".into(),
            arguments: json!({"script_name": "health.py"}).as_object().cloned().unwrap(),
        };
        let messages = vec![
            ChatMessage::assistant_with_tool_calls("", vec![call]),
            ChatMessage::tool_result("call_1", &ToolResult::success("STDOUT:\nok\n")),
        ];

        let value = serde_json::to_value(OpenAIProvider::convert_messages(&messages)).unwrap();
        assert_eq!(value[0]["content"], Value::Null);
        assert_eq!(
            value[0]["tool_calls"][0]["function"]["arguments"],
            "{\"script_name\":\"health.py\"}"
        );
        assert_eq!(value[1]["role"], "tool");
        assert_eq!(value[1]["tool_call_id"], "call_1");
        assert_eq!(value[1]["content"], "STDOUT:\nok\n");
    }
}
