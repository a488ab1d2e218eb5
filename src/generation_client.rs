use crate::config::GenerationSettings;
use crate::errors::{AppError, Capability};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// One request to the structured-generation capability: raw text plus the
/// target schema description.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub schema: Value,
}

/// Text-to-structured-data capability. The returned text claims schema
/// conformance; callers must validate it.
#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, AppError>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint in JSON mode.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatCompletionsClient {
    /// Creates a new `ChatCompletionsClient`.
    ///
    /// # Arguments
    ///
    /// * `settings` - Base URL, API key and model name.
    pub fn new(settings: &GenerationSettings) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| {
                AppError::InternalError(format!("Failed to create generation client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl StructuredGenerator for ChatCompletionsClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let cap = Capability::Extraction;

        let schema = serde_json::to_string(&request.schema)?;
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
            "messages": [
                {
                    "role": "system",
                    "content": format!("{}\n\nRespond with one JSON object matching this schema:\n{}", request.system, schema)
                },
                { "role": "user", "content": request.prompt }
            ]
        });

        tracing::debug!("Requesting structured generation from {} ({})", url, self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::from_reqwest(cap, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::from_status(cap, status, &error_text));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| AppError::from_reqwest(cap, e))?;

        // Empty output is a schema violation; the extractor asks again
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| AppError::SchemaViolation("generation returned no content".to_string()))
    }
}
