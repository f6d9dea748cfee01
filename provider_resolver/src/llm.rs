//! Structured-output chat completions.
//!
//! Components depend on [`StructuredLlm`] rather than a concrete client so
//! tests can script replies.

use async_trait::async_trait;
use reqwest::Client;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::common::truncate_for_log;
use crate::error::LlmError;

/// A system/user prompt pair answered under a strict JSON schema.
#[derive(Debug, Clone)]
pub struct StructuredPrompt {
    pub schema_name: String,
    pub system: String,
    pub user: String,
    pub schema: Value,
}

#[async_trait]
pub trait StructuredLlm: Send + Sync {
    /// Returns the raw JSON text of the model's answer.
    async fn complete_json(&self, prompt: &StructuredPrompt) -> Result<String, LlmError>;
}

#[derive(Clone)]
pub struct OpenAiClient {
    http_client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(
        http_client: Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(LlmError::Config("OpenAI API key is empty".into()));
        }
        Ok(Self {
            http_client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.0,
            timeout: Duration::from_secs(60),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    response_format: ResponseFormat<'a>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    strict: bool,
    schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[async_trait]
impl StructuredLlm for OpenAiClient {
    async fn complete_json(&self, prompt: &StructuredPrompt) -> Result<String, LlmError> {
        let start = Instant::now();
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: &prompt.schema_name,
                    strict: true,
                    schema: &prompt.schema,
                },
            },
        };

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "OpenAI request failed");
                LlmError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(%status, error = %truncate_for_log(&error_text), "OpenAI API error");
            return Err(LlmError::Api(format!(
                "status {status}: {}",
                truncate_for_log(&error_text)
            )));
        }

        let raw: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        debug!(
            model = %self.model,
            schema = %prompt.schema_name,
            duration_ms = start.elapsed().as_millis(),
            "OpenAI structured completion"
        );
        first_content(raw)
    }
}

fn first_content(raw: ChatResponseRaw) -> Result<String, LlmError> {
    let message = raw
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| LlmError::Api("no choices in response".into()))?;
    if let Some(refusal) = message.refusal {
        return Err(LlmError::Api(format!("model refused: {refusal}")));
    }
    message
        .content
        .ok_or_else(|| LlmError::Api("empty message content".into()))
}

/// JSON schema for `T` in the shape strict structured outputs accept: every
/// object closed with `additionalProperties: false`, every property listed as
/// required and all `$ref`s inlined.
pub fn strict_schema<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schema_for!(T)).unwrap_or_default();
    close_objects(&mut value);

    let definitions = value.get("definitions").cloned();
    if let Some(definitions) = definitions {
        inline_refs(&mut value, &definitions);
    }
    if let Value::Object(map) = &mut value {
        map.remove("definitions");
        map.remove("$schema");
        map.remove("title");
    }
    value
}

fn close_objects(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("object") {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
                if let Some(Value::Object(props)) = map.get("properties") {
                    let required = props.keys().cloned().map(Value::String).collect();
                    map.insert("required".to_string(), Value::Array(required));
                }
            }
            for (_, v) in map.iter_mut() {
                close_objects(v);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(close_objects),
        _ => {}
    }
}

fn inline_refs(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            let target = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("#/definitions/"))
                .and_then(|name| definitions.get(name))
                .cloned();
            if let Some(def) = target {
                *value = def;
                inline_refs(value, definitions);
                return;
            }
            for (_, v) in map.iter_mut() {
                inline_refs(v, definitions);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| inline_refs(v, definitions)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Inner {
        code: String,
    }

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Outer {
        label: Option<String>,
        inner: Inner,
    }

    #[test]
    fn strict_schema_closes_objects_and_inlines_refs() {
        let schema = strict_schema::<Outer>();
        assert_eq!(schema["additionalProperties"], json!(false));
        let mut required: Vec<_> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        required.sort();
        assert_eq!(required, ["inner", "label"]);

        let inner = &schema["properties"]["inner"];
        assert!(inner.get("$ref").is_none());
        assert_eq!(inner["additionalProperties"], json!(false));
        assert!(schema.get("definitions").is_none());
    }

    #[test]
    fn first_content_surfaces_refusals_and_empty_replies() {
        let ok: ChatResponseRaw = serde_json::from_value(json!({
            "choices": [{"message": {"content": "{\"specialty\":\"ENT\"}"}}]
        }))
        .unwrap();
        assert_eq!(first_content(ok).unwrap(), "{\"specialty\":\"ENT\"}");

        let refused: ChatResponseRaw = serde_json::from_value(json!({
            "choices": [{"message": {"content": null, "refusal": "no"}}]
        }))
        .unwrap();
        assert!(matches!(first_content(refused), Err(LlmError::Api(_))));

        let empty: ChatResponseRaw = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(first_content(empty), Err(LlmError::Api(_))));
    }

    #[test]
    fn blank_api_key_is_a_config_error() {
        let result = OpenAiClient::new(Client::new(), " ", "https://api.openai.com/v1", "gpt-4o");
        assert!(matches!(result, Err(LlmError::Config(_))));
    }
}
