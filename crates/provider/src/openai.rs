//! UPLINK OpenAI-compatible endpoint
//!
//! Works against hosted APIs and local servers (LM Studio, vLLM) alike.

use crate::*;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, trace};

const OPENROUTER_BASE: &str = "https://openrouter.ai/api/v1";
const OPENAI_BASE: &str = "https://api.openai.com/v1";

/// Chat-completions client
pub struct OpenAiCompatProvider {
    client: Client,
    api_key: String,
    api_base: String,
    default_model: String,
}

impl OpenAiCompatProvider {
    pub fn new(
        api_key: impl Into<String>,
        api_base: Option<String>,
        default_model: Option<String>,
    ) -> Self {
        let api_key = api_key.into();
        let api_base = api_base
            .filter(|base| !base.is_empty())
            .unwrap_or_else(|| {
                if api_key.starts_with("sk-or-") {
                    OPENROUTER_BASE.to_string()
                } else {
                    OPENAI_BASE.to_string()
                }
            })
            .trim_end_matches('/')
            .to_string();

        let default_model = default_model.unwrap_or_else(|| "gpt-4o-mini".to_string());

        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key,
            api_base,
            default_model,
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn is_local(&self) -> bool {
        self.api_base.contains("127.0.0.1") || self.api_base.contains("localhost")
    }

    fn build_request(&self, params: &ChatParams) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = params
            .messages
            .iter()
            .map(|m| {
                let mut obj = json!({ "role": &m.role });
                if let Some(content) = &m.content {
                    obj["content"] = json!(content);
                }
                if let Some(tool_calls) = &m.tool_calls {
                    let calls: Vec<serde_json::Value> = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": &call.id,
                                "type": &call.call_type,
                                "function": {
                                    "name": &call.function.name,
                                    "arguments": call.function.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                    obj["tool_calls"] = json!(calls);
                }
                if let Some(tool_call_id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(tool_call_id);
                }
                if let Some(name) = &m.name {
                    obj["name"] = json!(name);
                }
                obj
            })
            .collect();

        let model = if params.model.is_empty() {
            self.default_model.clone()
        } else {
            params.model.clone()
        };

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
        });

        if !params.tools.is_empty() {
            body["tools"] = json!(params.tools);
            body["tool_choice"] = match &params.tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::Required(name) => {
                    json!({"type": "function", "function": {"name": name}})
                }
                ToolChoice::None => json!("none"),
            };
        }

        body
    }

    fn parse_response(&self, json: serde_json::Value) -> Result<ChatResponse> {
        let choice = json["choices"]
            .get(0)
            .ok_or(ProviderError::InvalidResponse)?;
        let message = &choice["message"];
        let content = message["content"].as_str().map(|s| s.to_string());
        let finish_reason = choice["finish_reason"]
            .as_str()
            .unwrap_or("stop")
            .to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for (index, call) in calls.iter().enumerate() {
                let function = &call["function"];
                let arguments = match &function["arguments"] {
                    serde_json::Value::String(raw) if raw.trim().is_empty() => json!({}),
                    serde_json::Value::String(raw) => serde_json::from_str(raw)
                        .unwrap_or_else(|_| serde_json::Value::String(raw.clone())),
                    serde_json::Value::Null => json!({}),
                    other => other.clone(),
                };

                let id = call["id"]
                    .as_str()
                    .filter(|id| !id.is_empty())
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| format!("call_{}", index));

                tool_calls.push(ToolCall {
                    id,
                    name: function["name"].as_str().unwrap_or("").to_string(),
                    arguments,
                });
            }
        }

        let usage = json
            .get("usage")
            .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok())
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            tool_calls,
            finish_reason,
            usage,
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    async fn chat(&self, params: ChatParams) -> Result<ChatResponse> {
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured);
        }

        trace!("◆ UPLINK TO {}", self.api_base);

        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_request(&params);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }

        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), text));
            return Err(ProviderError::Api(message));
        }

        let json: serde_json::Value = serde_json::from_str(&text)?;
        debug!(
            "◆ MODEL REPLIED WITH {} TOOL CALLS",
            json["choices"][0]["message"]["tool_calls"]
                .as_array()
                .map(|v| v.len())
                .unwrap_or(0)
        );

        self.parse_response(json)
    }

    fn default_model(&self) -> String {
        self.default_model.clone()
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() || self.is_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(
            "",
            Some("http://127.0.0.1:1234/v1/".to_string()),
            Some("qwen3-8b".to_string()),
        )
    }

    // ========== Construction ==========

    #[test]
    fn test_base_selection() {
        let provider = OpenAiCompatProvider::new("sk-or-abc", None, None);
        assert_eq!(provider.api_base(), OPENROUTER_BASE);

        let provider = OpenAiCompatProvider::new("sk-abc", None, None);
        assert_eq!(provider.api_base(), OPENAI_BASE);

        assert_eq!(local().api_base(), "http://127.0.0.1:1234/v1");
    }

    #[test]
    fn test_local_endpoint_needs_no_key() {
        assert!(local().is_configured());
        assert!(!OpenAiCompatProvider::new("", None, None).is_configured());
        assert!(OpenAiCompatProvider::new("sk-abc", None, None).is_configured());
    }

    // ========== build_request ==========

    #[test]
    fn test_build_request_without_tools() {
        let params = ChatParams {
            model: String::new(),
            messages: vec![Message::user("Hello")],
            ..Default::default()
        };
        let request = local().build_request(&params);

        assert_eq!(request["model"], "qwen3-8b");
        assert!(request.get("tools").is_none());
        assert!(request.get("tool_choice").is_none());
        assert_eq!(request["messages"][0]["content"], "Hello");
    }

    #[test]
    fn test_build_request_encodes_tool_call_arguments_as_string() {
        let mut assistant = Message::assistant("");
        assistant.tool_calls = Some(vec![ToolCallDef::new(
            "call_1",
            "set_power",
            json!({"watts": 2}),
        )]);
        let params = ChatParams {
            model: "m".to_string(),
            messages: vec![assistant, Message::tool("call_1", "set_power", "ok")],
            tools: vec![Tool::new("set_power", "Set laser power", json!({}))],
            tool_choice: ToolChoice::Required("set_power".to_string()),
            ..Default::default()
        };
        let request = local().build_request(&params);

        let call = &request["messages"][0]["tool_calls"][0];
        assert_eq!(call["function"]["arguments"], "{\"watts\":2}");
        assert_eq!(request["messages"][1]["tool_call_id"], "call_1");
        assert_eq!(request["tools"][0]["function"]["name"], "set_power");
        assert_eq!(request["tool_choice"]["function"]["name"], "set_power");
    }

    // ========== parse_response ==========

    #[test]
    fn test_parse_response_tool_calls() {
        let response = local()
            .parse_response(json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [
                            {"id": "call_a", "function": {"name": "search", "arguments": "{\"query\": \"THz\"}"}},
                            {"function": {"name": "get_current_design", "arguments": ""}}
                        ]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
            }))
            .unwrap();

        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].arguments, json!({"query": "THz"}));
        assert_eq!(response.tool_calls[1].id, "call_1");
        assert_eq!(response.tool_calls[1].arguments, json!({}));
        assert_eq!(response.usage.total_tokens, 7);
    }

    #[test]
    fn test_parse_response_invalid_arguments_kept_raw() {
        let response = local()
            .parse_response(json!({
                "choices": [{
                    "message": {"tool_calls": [{"id": "c", "function": {"name": "t", "arguments": "not json"}}]}
                }]
            }))
            .unwrap();

        assert_eq!(response.tool_calls[0].arguments, json!("not json"));
        assert_eq!(response.finish_reason, "stop");
    }

    #[test]
    fn test_parse_response_missing_choices() {
        let result = local().parse_response(json!({"usage": {}}));
        assert!(matches!(result, Err(ProviderError::InvalidResponse)));
    }
}
