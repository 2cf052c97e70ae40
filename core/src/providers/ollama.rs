use crate::error::ProviderError;
use crate::traits::{ChatMessage, ChatRequest, ChatResponse, Provider, Role, ToolCall, ToolSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OllamaTool>>,
    options: OllamaOptions,
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct OllamaMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCallRequest>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct OllamaToolCallRequest {
    function: OllamaFunctionRequest,
}

#[derive(Debug, Serialize, PartialEq)]
struct OllamaFunctionRequest {
    name: String,
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    r#type: &'static str,
    function: OllamaToolFunction,
}

#[derive(Debug, Serialize)]
struct OllamaToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OllamaToolCallResponse>>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCallResponse {
    function: OllamaFunctionResponse,
}

#[derive(Debug, Deserialize)]
struct OllamaFunctionResponse {
    name: String,
    arguments: Value,
}

/// Local models served by Ollama's `/api/chat`.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let url = base_url.into();
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Ollama has no tool role, so consecutive tool results are folded into
    /// a single user message.
    fn convert_messages(messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        let mut result = Vec::new();
        let mut tool_results_buffer: Vec<String> = Vec::new();

        for m in messages {
            if m.role == Role::Tool {
                let tool_call_id = m.tool_call_id.as_deref().unwrap_or("unknown");
                tool_results_buffer.push(format!(
                    "<tool_result id=\"{}\">\n{}\n</tool_result>",
                    tool_call_id,
                    m.text()
                ));
                continue;
            }

            flush_tool_results(&mut tool_results_buffer, &mut result);

            let tool_calls = m.tool_calls.as_ref().map(|tcs| {
                tcs.iter()
                    .map(|tc| OllamaToolCallRequest {
                        function: OllamaFunctionRequest {
                            name: tc.name.clone(),
                            arguments: Value::Object(tc.arguments.clone()),
                        },
                    })
                    .collect()
            });

            let content = m.text();
            result.push(OllamaMessage {
                role: m.role.as_str(),
                content: if content.is_empty() { None } else { Some(content) },
                tool_calls,
            });
        }

        flush_tool_results(&mut tool_results_buffer, &mut result);
        result
    }

    fn convert_tools(tools: &[ToolSpec]) -> Vec<OllamaTool> {
        tools
            .iter()
            .map(|t| OllamaTool {
                r#type: "function",
                function: OllamaToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters_schema.clone(),
                },
            })
            .collect()
    }

    fn parse_response(response: OllamaResponse) -> Result<ChatResponse, ProviderError> {
        let tool_calls = response
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| match tc.function.arguments {
                Value::Object(arguments) => Ok(ToolCall {
                    id: format!("ollama_{}", uuid::Uuid::new_v4()),
                    name: tc.function.name,
                    arguments,
                }),
                Value::Null => Ok(ToolCall {
                    id: format!("ollama_{}", uuid::Uuid::new_v4()),
                    name: tc.function.name,
                    arguments: Default::default(),
                }),
                other => Err(ProviderError::Malformed(format!(
                    "arguments for {} are not an object: {}",
                    tc.function.name, other
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let text = response.message.content.filter(|c| !c.is_empty());
        if text.is_none() && tool_calls.is_empty() && response.message.thinking.is_some() {
            tracing::debug!("Ollama returned only thinking output");
        }

        Ok(ChatResponse { text, tool_calls })
    }
}

fn flush_tool_results(buffer: &mut Vec<String>, result: &mut Vec<OllamaMessage>) {
    if buffer.is_empty() {
        return;
    }
    result.push(OllamaMessage {
        role: Role::User.as_str(),
        content: Some(format!("[Tool results]\n{}", buffer.join("\n"))),
        tool_calls: None,
    });
    buffer.clear();
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        temperature: f64,
    ) -> Result<ChatResponse, ProviderError> {
        let ollama_request = OllamaRequest {
            model: model.to_string(),
            messages: Self::convert_messages(request.messages),
            tools: request.tools.map(Self::convert_tools),
            options: OllamaOptions { temperature },
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&ollama_request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unavailable(format!(
                "Ollama API error ({}): {}",
                status, error_text
            )));
        }

        let ollama_response: OllamaResponse = response.json().await?;
        Self::parse_response(ollama_response)
    }
}
