use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::VisualDescription;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("empty response")]
    EmptyResponse,
    #[error("parse error: {0}")]
    Parse(String),
    #[error("Other: {0}")]
    Other(String),
}

/// Instruction payload for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPrompt {
    pub system: String,
    pub user: String,
}

/// Produces a single short text completion for a prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &GenerationPrompt) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    Base64 { data: String, mime_type: Option<String> },
    Url(String),
}

#[derive(Debug, Clone)]
pub struct VisionReport {
    pub description: VisualDescription,
    pub attempts: u32,
    /// Set when every attempt failed and `description` is the empty placeholder.
    pub low_confidence: bool,
}

/// Describes what is visible in a photo. Never fails: on exhaustion it
/// reports a low-confidence empty description.
#[async_trait]
pub trait VisionDescriber: Send + Sync {
    async fn describe(&self, image: &ImageInput) -> VisionReport;
}
