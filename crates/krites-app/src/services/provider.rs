//! LLM provider abstraction for datasheet extraction.
//!
//! The pipeline talks to [`ExtractionProvider`]; the production
//! implementation drives the OpenAI Responses API with JSON-schema
//! constrained output. Tests substitute stub providers.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::tasks::ServiceTier;
use crate::pipeline::item::{EnumeratedModels, RawModelItem};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

const ENUMERATE_INSTRUCTIONS: &str = "You are reading a power-converter datasheet. \
List every distinct orderable model number the document covers, exactly as printed, \
one entry per model. Do not invent entries and do not collapse model families.";

const EXTRACT_INSTRUCTIONS: &str = "You are reading a power-converter datasheet. \
For each requested model number, report its electrical and mechanical specification \
exactly as the document states it. Leave a field null when the document does not \
state it for that model.";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing OPENAI_API_KEY environment variable")]
    MissingApiKey,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to read document {path}: {source}")]
    ReadDocument {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

/// Token counts for one provider call. Field names differ across provider
/// responses; [`TokenUsage::from_response`] normalizes them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.cached_input_tokens = self
            .cached_input_tokens
            .saturating_add(other.cached_input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    /// Pull token counts out of a raw `usage` object. Aliases are tried in
    /// priority order so both Responses-style and Completions-style payloads
    /// resolve. Cached input prefers the sum of read and write cache counters
    /// and falls back to the aggregate field.
    pub fn from_response(usage: &Value) -> Self {
        let read_cached = first_u64(
            usage,
            &["cache_read_input_tokens", "cached_read_input_tokens"],
        );
        let write_cached = first_u64(
            usage,
            &["cache_write_input_tokens", "cached_write_input_tokens"],
        );
        let cached = if read_cached + write_cached > 0 {
            read_cached + write_cached
        } else {
            first_u64(
                usage,
                &[
                    "cached_input_tokens",
                    "cached_tokens",
                    "input_tokens_details.cached_tokens",
                    "prompt_tokens_details.cached_tokens",
                ],
            )
        };
        Self {
            input_tokens: first_u64(usage, &["input_tokens", "prompt_tokens"]),
            cached_input_tokens: cached,
            output_tokens: first_u64(usage, &["output_tokens", "completion_tokens"]),
        }
    }
}

fn first_u64(value: &Value, paths: &[&str]) -> u64 {
    for path in paths {
        let mut cursor = value;
        let mut found = true;
        for segment in path.split('.') {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(n) = cursor.as_u64() {
                return n;
            }
        }
    }
    0
}

/// Payload plus the accounting metadata that rode along with it.
#[derive(Debug, Clone)]
pub struct ProviderResponse<T> {
    pub payload: T,
    pub usage: TokenUsage,
    /// Model name the provider actually served, when reported.
    pub model: Option<String>,
    pub service_tier: Option<ServiceTier>,
}

#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Upload a document, returning the provider's file reference.
    async fn upload_document(&self, path: &Path, filename: &str) -> Result<String, ProviderError>;

    /// Delete a previously uploaded document. Best-effort cleanup.
    async fn delete_document(&self, file_id: &str) -> Result<(), ProviderError>;

    /// Enumerate every model number the document covers.
    async fn list_models(
        &self,
        file_id: &str,
    ) -> Result<ProviderResponse<EnumeratedModels>, ProviderError>;

    /// Extract full specifications for one batch of model numbers.
    async fn extract_models(
        &self,
        file_id: &str,
        model_numbers: &[String],
    ) -> Result<ProviderResponse<Vec<RawModelItem>>, ProviderError>;
}

/// OpenAI Responses API implementation.
pub struct OpenAiProvider {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    service_tier: Option<ServiceTier>,
}

impl OpenAiProvider {
    /// Read the API key from the environment; a missing key fails fast at
    /// construction rather than on the first task.
    pub fn from_env(model: Option<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| ProviderError::MissingApiKey)?;
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            service_tier: None,
        })
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_service_tier(mut self, tier: ServiceTier) -> Self {
        self.service_tier = Some(tier);
        self
    }

    async fn structured_request<T>(
        &self,
        schema_name: &str,
        instructions: &str,
        file_id: &str,
        prompt: &str,
    ) -> Result<ProviderResponse<T>, ProviderError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = schemars::gen::SchemaSettings::draft07()
            .into_generator()
            .into_root_schema_for::<T>();
        let mut body = json!({
            "model": self.model,
            "instructions": instructions,
            "input": [{
                "role": "user",
                "content": [
                    { "type": "input_file", "file_id": file_id },
                    { "type": "input_text", "text": prompt },
                ],
            }],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": schema_name,
                    "schema": serde_json::to_value(&schema)?,
                    "strict": true,
                },
            },
        });
        if let Some(tier) = self.service_tier {
            body["service_tier"] = json!(tier.as_str());
        }

        let response = self
            .http
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let raw: Value = response.json().await?;

        let text = output_text(&raw).ok_or_else(|| {
            ProviderError::MalformedResponse("no output_text in response".to_string())
        })?;
        let payload: T = serde_json::from_str(text)?;
        let usage = raw
            .get("usage")
            .map(TokenUsage::from_response)
            .unwrap_or_default();
        let model = raw
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(self.model.clone()));
        let service_tier = raw
            .get("service_tier")
            .and_then(Value::as_str)
            .and_then(parse_service_tier)
            .or(self.service_tier);

        debug!(
            schema = schema_name,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            stage = "provider_call",
            "structured request completed"
        );
        Ok(ProviderResponse {
            payload,
            usage,
            model,
            service_tier,
        })
    }
}

fn parse_service_tier(raw: &str) -> Option<ServiceTier> {
    match raw {
        "auto" => Some(ServiceTier::Auto),
        "default" => Some(ServiceTier::Default),
        "flex" => Some(ServiceTier::Flex),
        "priority" => Some(ServiceTier::Priority),
        "scale" => Some(ServiceTier::Scale),
        _ => None,
    }
}

/// First `output_text` fragment in a Responses API payload.
fn output_text(raw: &Value) -> Option<&str> {
    for item in raw.get("output")?.as_array()? {
        let Some(contents) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        for content in contents {
            if content.get("type").and_then(Value::as_str) == Some("output_text") {
                if let Some(text) = content.get("text").and_then(Value::as_str) {
                    return Some(text);
                }
            }
        }
    }
    None
}

#[async_trait]
impl ExtractionProvider for OpenAiProvider {
    async fn upload_document(&self, path: &Path, filename: &str) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ProviderError::ReadDocument {
                path: path.display().to_string(),
                source,
            })?;
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/pdf")?;
        let form = multipart::Form::new()
            .text("purpose", "user_data")
            .part("file", part);

        let response = self
            .http
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let raw: Value = response.json().await?;
        let file_id = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::MalformedResponse("upload response missing id".to_string()))?;
        debug!(file_id, stage = "provider_upload", "uploaded document");
        Ok(file_id.to_string())
    }

    async fn delete_document(&self, file_id: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(format!("{}/files/{file_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(
                file_id,
                status = response.status().as_u16(),
                stage = "provider_cleanup",
                "failed to delete uploaded document"
            );
        }
        Ok(())
    }

    async fn list_models(
        &self,
        file_id: &str,
    ) -> Result<ProviderResponse<EnumeratedModels>, ProviderError> {
        self.structured_request(
            "model_enumeration",
            ENUMERATE_INSTRUCTIONS,
            file_id,
            "List every model number covered by the attached datasheet.",
        )
        .await
    }

    async fn extract_models(
        &self,
        file_id: &str,
        model_numbers: &[String],
    ) -> Result<ProviderResponse<Vec<RawModelItem>>, ProviderError> {
        let prompt = format!(
            "Extract the full specification for each of these model numbers from the attached datasheet: {}",
            model_numbers.join(", ")
        );
        let response: ProviderResponse<crate::pipeline::item::ExtractedModels> = self
            .structured_request("model_specifications", EXTRACT_INSTRUCTIONS, file_id, &prompt)
            .await?;
        Ok(ProviderResponse {
            payload: response.payload.models,
            usage: response.usage,
            model: response.model,
            service_tier: response.service_tier,
        })
    }
}
