//! The external text generator seam.
//!
//! The engine treats generation as a fallible function: structured
//! instructions and an output schema go in, a JSON payload (or a failure)
//! comes out. [`ClaudeGenerator`] is the production implementation.

use async_trait::async_trait;
use claude::{Claude, Message, Request};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a generator call.
#[derive(Debug, Clone, Error)]
pub enum GeneratorError {
    #[error("generator timed out")]
    Timeout,

    #[error("malformed generator response: {0}")]
    Malformed(String),

    #[error("generator unavailable: {0}")]
    Unavailable(String),

    #[error("generator rejected the request: {0}")]
    Rejected(String),
}

impl GeneratorError {
    /// Whether the same request may succeed if tried again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, GeneratorError::Rejected(_))
    }
}

impl From<claude::Error> for GeneratorError {
    fn from(err: claude::Error) -> Self {
        match err {
            claude::Error::Timeout => GeneratorError::Timeout,
            claude::Error::Parse(msg) => GeneratorError::Malformed(msg),
            claude::Error::MissingPayload => {
                GeneratorError::Malformed("no structured payload".to_string())
            }
            other if other.is_transient() => GeneratorError::Unavailable(other.to_string()),
            other => GeneratorError::Rejected(other.to_string()),
        }
    }
}

/// What a request is for; generators may route purposes to different models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPurpose {
    /// A full story subchapter.
    Unit,
    /// Enrichment of a derived decision consequence.
    Consequence,
}

/// A structured request to the generator.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub purpose: RequestPurpose,
    pub instructions: String,
    pub output_schema: serde_json::Value,
    /// Opaque context passed alongside the instructions.
    pub context: serde_json::Value,
}

/// An external generator of structured payloads.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a payload that should match `request.output_schema`.
    async fn generate(&self, request: GenerationRequest) -> Result<serde_json::Value, GeneratorError>;
}

/// Model used for consequence enrichment (fast and cheap).
const ENRICHMENT_MODEL: &str = "claude-3-5-haiku-20241022";

/// Generator backed by the Claude Messages API.
pub struct ClaudeGenerator {
    client: Claude,
    max_tokens: usize,
    temperature: f32,
    enrichment_model: String,
}

impl ClaudeGenerator {
    pub fn new(client: Claude) -> Self {
        Self {
            client,
            max_tokens: 8192,
            temperature: 0.8,
            enrichment_model: ENRICHMENT_MODEL.to_string(),
        }
    }

    /// Create from environment (ANTHROPIC_API_KEY).
    pub fn from_env() -> Result<Self, GeneratorError> {
        let client = Claude::from_env()?;
        Ok(Self::new(client))
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_enrichment_model(mut self, model: impl Into<String>) -> Self {
        self.enrichment_model = model.into();
        self
    }
}

#[async_trait]
impl Generator for ClaudeGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<serde_json::Value, GeneratorError> {
        let context = serde_json::to_string_pretty(&request.context)
            .map_err(|e| GeneratorError::Rejected(e.to_string()))?;
        let prompt = format!("## Story Context\n```json\n{context}\n```\n\nEmit the payload now.");

        let mut api_request = Request::new(vec![Message::user(prompt)])
            .with_system(request.instructions)
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature);
        if request.purpose == RequestPurpose::Consequence {
            api_request = api_request
                .with_model(&self.enrichment_model)
                .with_max_tokens(800)
                .with_temperature(0.3);
        }

        let payload = self
            .client
            .complete_structured(api_request, request.output_schema)
            .await?;
        Ok(payload)
    }
}
