use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::guardrails::GuardrailResult;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const DEFAULT_TONE: &str = "descontraído";
pub const SCHEMA_VERSION: &str = "1.0";

// --- Vision evidence ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Evidence {
    pub name: String,
    pub confidence: f64,
}

impl Evidence {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self { name: name.into(), confidence }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DetectedPersons {
    #[serde(default)]
    pub count: u32,
}

/// Structured description of a photo as returned by the vision provider.
/// Missing evidence is an empty collection, never a guess.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct VisualDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub detected_persons: DetectedPersons,
    #[serde(default)]
    pub objects: Vec<Evidence>,
    #[serde(default)]
    pub actions: Vec<Evidence>,
    #[serde(default)]
    pub places: Vec<Evidence>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub notable_details: Vec<String>,
    #[serde(default)]
    pub ocr_text: String,
    #[serde(default, alias = "confidence_overall")]
    pub overall_confidence: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum DescriptionError {
    #[error("{field}: confidence {value} outside [0, 1]")]
    ConfidenceOutOfRange { field: &'static str, value: f64 },
    #[error("{field}: empty name")]
    EmptyName { field: &'static str },
}

impl VisualDescription {
    /// Placeholder used when the vision provider could not describe the image.
    pub fn low_confidence_empty() -> Self {
        Self {
            schema_version: Some(SCHEMA_VERSION.to_string()),
            overall_confidence: 0.1,
            ..Self::default()
        }
    }

    pub fn has_evidence(&self) -> bool {
        !self.objects.is_empty()
            || !self.actions.is_empty()
            || !self.places.is_empty()
            || !self.colors.is_empty()
            || !self.notable_details.is_empty()
            || !self.ocr_text.trim().is_empty()
    }

    pub fn validate(&self) -> Result<(), DescriptionError> {
        check_confidence("overall_confidence", self.overall_confidence)?;
        for (field, items) in [
            ("objects", &self.objects),
            ("actions", &self.actions),
            ("places", &self.places),
        ] {
            for item in items {
                if item.name.trim().is_empty() {
                    return Err(DescriptionError::EmptyName { field });
                }
                check_confidence(field, item.confidence)?;
            }
        }
        if self.colors.iter().any(|c| c.trim().is_empty()) {
            return Err(DescriptionError::EmptyName { field: "colors" });
        }
        if self.notable_details.iter().any(|d| d.trim().is_empty()) {
            return Err(DescriptionError::EmptyName { field: "notable_details" });
        }
        Ok(())
    }
}

fn check_confidence(field: &'static str, value: f64) -> Result<(), DescriptionError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DescriptionError::ConfidenceOutOfRange { field, value })
    }
}

// --- Anchors ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AnchorSource {
    #[serde(rename = "vision")]
    VisionDerived,
    #[serde(rename = "ocr")]
    OcrDerived,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnchorCategory {
    Object,
    Action,
    Place,
    Color,
    Detail,
    OcrWord,
}

/// A canonical token backed by visual or OCR evidence.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Anchor {
    pub token: String,
    pub original_text: String,
    pub source: AnchorSource,
    pub category: AnchorCategory,
    pub confidence: f64,
    pub weight: f64,
}

// --- Generation ---

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub tone: String,
    pub focus_tags: Vec<String>,
    /// Ranked by descending weight.
    pub anchors: Vec<Anchor>,
    /// Oldest first.
    pub prior_messages: Vec<String>,
    pub excluded_anchor_tokens: HashSet<String>,
    pub custom_instructions: Option<String>,
    pub max_attempts: u32,
}

impl GenerationRequest {
    pub fn new(tone: impl Into<String>, anchors: Vec<Anchor>) -> Self {
        Self {
            tone: tone.into(),
            focus_tags: Vec::new(),
            anchors,
            prior_messages: Vec::new(),
            excluded_anchor_tokens: HashSet::new(),
            custom_instructions: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_prior_messages(mut self, prior: Vec<String>) -> Self {
        self.prior_messages = prior;
        self
    }

    pub fn with_focus_tags(mut self, tags: Vec<String>) -> Self {
        self.focus_tags = tags;
        self
    }

    pub fn with_excluded(mut self, tokens: HashSet<String>) -> Self {
        self.excluded_anchor_tokens = tokens;
        self
    }

    pub fn with_custom_instructions(mut self, instructions: Option<String>) -> Self {
        self.custom_instructions = instructions.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("missing required parameters: tone and anchors")]
    MissingParameters,
    #[error("text provider failed: {detail}")]
    ProviderTransport { detail: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub succeeded: bool,
    pub message: Option<String>,
    pub anchors_used: Vec<String>,
    pub repetition_score: f64,
    pub is_low_confidence: bool,
    pub attempts_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl GenerationOutcome {
    pub fn failed(reason: FailureReason, attempts_used: u32) -> Self {
        Self {
            succeeded: false,
            message: None,
            anchors_used: Vec::new(),
            repetition_score: 0.0,
            is_low_confidence: false,
            attempts_used,
            failure_reason: Some(reason),
        }
    }
}

// --- HTTP surface ---

fn default_tone() -> String {
    DEFAULT_TONE.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IcebreakerRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Skips the vision call when the caller already has a description.
    #[serde(default)]
    pub description: Option<VisualDescription>,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default)]
    pub focus_tags: Vec<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RegenerateRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub focus_tags: Option<Vec<String>>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EvaluateRequest {
    pub message: String,
    #[serde(default)]
    pub anchors: Vec<String>,
    #[serde(default)]
    pub prior_messages: Vec<String>,
    #[serde(default)]
    pub regeneration_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Conversation {
    pub id: Uuid,
    pub description: VisualDescription,
    pub anchors: Vec<Anchor>,
    pub tone: String,
    pub focus_tags: Vec<String>,
    /// Oldest first.
    pub suggestions: Vec<String>,
    pub used_anchor_tokens: Vec<String>,
    pub regeneration_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IcebreakerResponse {
    pub conversation_id: Uuid,
    pub request_id: Uuid,
    pub suggestion: String,
    pub anchors: Vec<String>,
    pub anchors_used: Vec<String>,
    pub low_confidence: bool,
    pub attempts_used: u32,
    pub guardrail: GuardrailResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_attempts: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn description_accepts_vision_field_names() {
        let desc: VisualDescription = serde_json::from_value(json!({
            "schema_version": "1.0",
            "detected_persons": { "count": 1 },
            "objects": [{ "name": "cat", "confidence": 0.92, "source": "vision" }],
            "colors": ["pink"],
            "notable_details": ["cadeira rosa"],
            "confidence_overall": 0.8
        }))
        .unwrap();

        assert_eq!(desc.schema_version.as_deref(), Some("1.0"));
        assert_eq!(desc.objects, vec![Evidence::new("cat", 0.92)]);
        assert_eq!(desc.overall_confidence, 0.8);
        assert_eq!(desc.ocr_text, "");
        assert!(desc.has_evidence());
        assert_eq!(desc.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_out_of_range_confidence() {
        let desc = VisualDescription {
            places: vec![Evidence::new("kitchen", 1.4)],
            overall_confidence: 0.5,
            ..VisualDescription::default()
        };
        assert_eq!(
            desc.validate(),
            Err(DescriptionError::ConfidenceOutOfRange { field: "places", value: 1.4 })
        );
    }

    #[test]
    fn whitespace_ocr_is_not_evidence() {
        let desc = VisualDescription { ocr_text: "   ".into(), ..VisualDescription::default() };
        assert!(!desc.has_evidence());
        assert!(!VisualDescription::low_confidence_empty().has_evidence());
    }
}
