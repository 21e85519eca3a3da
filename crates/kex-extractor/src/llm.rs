//! Structured-generation LLM clients
//!
//! Both providers are asked to answer with JSON conforming to a schema:
//! OpenAI via `response_format: json_schema`, Ollama via `format: <schema>`.
//! Responses are parsed into `serde_json::Value` and validated by the caller.

use async_trait::async_trait;
use kex_core::{KexError, LlmClient, LlmConfig, LlmProvider, Result, StructuredRequest};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

// ============================================================================
// OpenAI Client
// ============================================================================

/// OpenAI (or compatible) chat-completions client
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
    response_format: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

impl OpenAiClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.into(),
            max_tokens,
            temperature,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| KexError::Config("OpenAI API key required".to_string()))?;

        let mut client = Self::new(
            api_key.clone(),
            config.model.clone(),
            config.max_tokens,
            config.temperature,
        );
        if let Some(url) = &config.openai_base_url {
            client = client.with_base_url(url.clone());
        }
        Ok(client)
    }

    /// Set custom base URL (for Azure or compatible APIs)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate_object(&self, request: &StructuredRequest) -> Result<Value> {
        let body = OpenAiRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: json!({
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": false,
                }
            }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| KexError::Llm(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(KexError::Llm(format!("OpenAI error ({status}): {error_text}")));
        }

        let result: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| KexError::Llm(format!("Failed to parse response: {e}")))?;

        let message = result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| KexError::Llm("No response generated".to_string()))?;

        if let Some(refusal) = message.refusal {
            return Err(KexError::Llm(format!("Model refused: {refusal}")));
        }
        parse_object(message.content.as_deref().unwrap_or_default())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Ollama Client
// ============================================================================

/// Ollama `/api/generate` client
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    format: &'a Value,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            temperature: 0.0,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Self {
        let mut client = Self::new(config.ollama_url.clone(), config.model.clone());
        client.temperature = config.temperature;
        client
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate_object(&self, request: &StructuredRequest) -> Result<Value> {
        let body = OllamaRequest {
            model: &self.model,
            prompt: &request.prompt,
            format: &request.schema,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| KexError::Llm(format!("Ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(KexError::Llm(format!("Ollama error: {error_text}")));
        }

        let result: OllamaResponse = response
            .json()
            .await
            .map_err(|e| KexError::Llm(format!("Failed to parse Ollama response: {e}")))?;

        parse_object(&result.response)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Parse a model's text answer as a JSON object
///
/// Tolerates a surrounding Markdown code fence. Malformed output is an LLM
/// error so the stage retries it.
pub fn parse_object(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: Value = serde_json::from_str(body)
        .map_err(|e| KexError::Llm(format!("Response is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(KexError::Llm("Response is not a JSON object".to_string()));
    }
    debug!(bytes = body.len(), "Parsed structured response");
    Ok(value)
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an LLM client from config
///
/// `Local` has no LLM; callers use the rule-based stages instead.
pub fn create_llm_client(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider {
        LlmProvider::OpenAI | LlmProvider::Azure => {
            Ok(Box::new(OpenAiClient::from_config(config)?))
        }
        LlmProvider::Ollama => Ok(Box::new(OllamaClient::from_config(config))),
        LlmProvider::Local => Err(KexError::Config(
            "provider `local` has no LLM client; use the rule-based stages".to_string(),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================
