use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{AppConfig, DEMO_KEY};
use crate::models::{Evidence, VisualDescription, SCHEMA_VERSION};
use crate::providers::{
    GenerationPrompt, ImageInput, ProviderError, TextGenerator, VisionDescriber, VisionReport,
};

pub const MAX_VISION_ATTEMPTS: u32 = 2;

const VISION_SYSTEM_PROMPT: &str = r#"You extract VISUAL CONTEXT and TEXT from an image.

RULES:
- Describe ONLY what is VISIBLE or LEGIBLE.
- Do NOT infer profession, emotions, relationships, exact location or preferences.
- If there is text, transcribe it normalized into "ocr_text".
- Output MUST be JSON following the schema below, no comments, no extra text.
- "confidence_overall" is in [0.0, 1.0].
- Every item in objects, actions and places has a lowercase "name" in Brazilian Portuguese and a "confidence".
- If a field has no data, leave it empty ([] or ""). NEVER invent.

SCHEMA:
{
  "schema_version": "1.0",
  "detected_persons": { "count": 0 },
  "objects": [ { "name": "gato", "confidence": 0.92 } ],
  "actions": [ { "name": "limpando", "confidence": 0.71 } ],
  "places":  [ { "name": "cozinha", "confidence": 0.78 } ],
  "colors": ["rosa", "bege"],
  "ocr_text": "",
  "notable_details": ["cadeira rosa"],
  "confidence_overall": 0.0
}"#;

const VISION_USER_PROMPT: &str = "Analyze this image and extract its visual information following exactly the JSON schema above. \
List only clearly visible elements, dominant colors and unique but visible details. \
If you cannot identify something confidently, leave the field empty or use a low confidence.";

/// Shortens long base64 payloads in a JSON body so it can be logged.
fn truncate_base64_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let serde_json::Value::String(s) = val {
                        if s.len() > 100 {
                            *val = serde_json::Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    text_model: String,
    vision_model: String,
}

impl GeminiClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.gemini_api_key.clone(),
            base_url: config.gemini_api_base.clone(),
            text_model: config.text_model.clone(),
            vision_model: config.vision_model.clone(),
        }
    }

    fn is_demo(&self) -> bool {
        self.api_key == DEMO_KEY
    }

    async fn perform_api_call(&self, model: &str, body: &serde_json::Value) -> Result<String, ProviderError> {
        let url = format!("{}/models/{}:generateContent?key={}", self.base_url, model, self.api_key);
        info!("🔗 Making request to: {}", url.replace(&self.api_key, "***"));

        let mut loggable = body.clone();
        truncate_base64_in_json(&mut loggable);
        info!("📤 Request body: {}", serde_json::to_string(&loggable).unwrap_or_default());

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = response.status();
        let response_text = response.text().await.map_err(|e| ProviderError::Http(e.to_string()))?;
        info!("📥 Response status: {}", status);

        if !status.is_success() {
            error!("❌ Gemini API error response: {}", response_text);
            return Err(ProviderError::Http(format!("status={} body={}", status, response_text)));
        }

        let parsed: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| ProviderError::Parse(format!("{}: {}", e, response_text)))?;

        extract_first_text(&parsed).ok_or(ProviderError::EmptyResponse)
    }

    async fn resolve_image(&self, image: &ImageInput) -> Result<(String, String), ProviderError> {
        match image {
            ImageInput::Base64 { data, mime_type } => {
                let mime = match mime_type {
                    Some(mime) => mime.clone(),
                    None => {
                        let bytes = base64::engine::general_purpose::STANDARD
                            .decode(data)
                            .map_err(|e| ProviderError::Parse(format!("invalid base64 image: {e}")))?;
                        sniff_mime(&bytes).to_string()
                    }
                };
                Ok((data.clone(), mime))
            }
            ImageInput::Url(url) => {
                info!("🌐 Fetching image from {}", url);
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| ProviderError::Http(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(ProviderError::Http(format!("image fetch status={}", response.status())));
                }
                let bytes: bytes::Bytes = response.bytes().await.map_err(|e| ProviderError::Http(e.to_string()))?;
                let mime = sniff_mime(&bytes).to_string();
                Ok((base64::engine::general_purpose::STANDARD.encode(&bytes), mime))
            }
        }
    }

    async fn describe_once(&self, data: &str, mime: &str) -> Result<VisualDescription, ProviderError> {
        let body = json!({
            "systemInstruction": { "parts": [{ "text": VISION_SYSTEM_PROMPT }] },
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": VISION_USER_PROMPT },
                    { "inlineData": { "mimeType": mime, "data": data } }
                ]
            }],
            "generationConfig": {
                "temperature": 0.0,
                "maxOutputTokens": 800,
                "responseMimeType": "application/json"
            }
        });

        let text = self.perform_api_call(&self.vision_model, &body).await?;
        parse_description(&text)
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/jpeg")
}

/// Parses the vision JSON, tolerating a Markdown code fence around it.
pub fn parse_description(text: &str) -> Result<VisualDescription, ProviderError> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);

    let mut description: VisualDescription =
        serde_json::from_str(unfenced.trim()).map_err(|e| ProviderError::Parse(e.to_string()))?;
    description.validate().map_err(|e| ProviderError::Parse(e.to_string()))?;
    if description.schema_version.is_none() {
        description.schema_version = Some(SCHEMA_VERSION.to_string());
    }
    Ok(description)
}

fn demo_description() -> VisualDescription {
    VisualDescription {
        schema_version: Some(SCHEMA_VERSION.to_string()),
        objects: vec![Evidence::new("violão", 0.91), Evidence::new("cachorro", 0.84)],
        actions: vec![Evidence::new("tocando", 0.7)],
        places: vec![Evidence::new("praia", 0.88)],
        colors: vec!["azul".into(), "amarelo".into()],
        notable_details: vec!["pôr do sol ao fundo".into()],
        overall_confidence: 0.86,
        ..VisualDescription::default()
    }
}

const DEMO_TEMPLATES: [&str; 3] = [
    "Que {} incrível! Qual a história por trás disso?",
    "Fiquei curioso com esse {} na sua foto, me conta mais?",
    "Confesso que o {} chamou minha atenção logo de cara. Tem alguma história aí?",
];

/// Builds a message from the first prompt anchor; the template rotates with
/// the number of previous suggestions listed in the prompt.
fn demo_message(prompt: &GenerationPrompt) -> String {
    let anchor = prompt
        .system
        .split("ANCHORS:\n")
        .nth(1)
        .and_then(|rest| rest.lines().next())
        .and_then(|line| line.split(", ").next())
        .filter(|a| !a.is_empty())
        .unwrap_or("foto");
    let previous = prompt
        .system
        .lines()
        .filter(|line| {
            line.split_once(". ")
                .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        })
        .count();
    DEMO_TEMPLATES[previous % DEMO_TEMPLATES.len()].replace("{}", anchor)
}

#[async_trait]
impl TextGenerator for GeminiClient {
    fn name(&self) -> &str {
        &self.text_model
    }

    async fn complete(&self, prompt: &GenerationPrompt) -> Result<String, ProviderError> {
        if self.is_demo() {
            info!("Using demo mode - composing message locally");
            return Ok(demo_message(prompt));
        }

        info!("Generating text with Gemini API...");
        let body = json!({
            "systemInstruction": { "parts": [{ "text": prompt.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt.user }] }],
            "generationConfig": {
                "temperature": 0.6,
                "topP": 0.9,
                "maxOutputTokens": 120,
                "candidateCount": 1
            }
        });
        let text = self.perform_api_call(&self.text_model, &body).await?;
        let text = text.trim().trim_matches('"').trim().to_string();
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(text)
    }
}

#[async_trait]
impl VisionDescriber for GeminiClient {
    async fn describe(&self, image: &ImageInput) -> VisionReport {
        if self.is_demo() {
            info!("Using demo mode - returning sample description");
            return VisionReport { description: demo_description(), attempts: 1, low_confidence: false };
        }

        let (data, mime) = match self.resolve_image(image).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("❌ Could not load image: {}", e);
                return VisionReport {
                    description: VisualDescription::low_confidence_empty(),
                    attempts: 0,
                    low_confidence: true,
                };
            }
        };

        for attempt in 1..=MAX_VISION_ATTEMPTS {
            info!("🔍 Vision extraction attempt {}...", attempt);
            match self.describe_once(&data, &mime).await {
                Ok(description) => {
                    info!(
                        "✅ Vision extraction succeeded: confidence {:.2}, {} objects, {} colors",
                        description.overall_confidence,
                        description.objects.len(),
                        description.colors.len()
                    );
                    return VisionReport { description, attempts: attempt, low_confidence: false };
                }
                Err(e) => warn!("⚠️ Vision attempt {} failed: {}", attempt, e),
            }
        }

        error!("❌ Vision extraction exhausted, using low-confidence placeholder");
        VisionReport {
            description: VisualDescription::low_confidence_empty(),
            attempts: MAX_VISION_ATTEMPTS,
            low_confidence: true,
        }
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    Other(serde_json::Value),
}

fn extract_first_text(resp: &GeminiResponse) -> Option<String> {
    resp.candidates
        .iter()
        .flat_map(|c| c.content.parts.iter())
        .find_map(|p| match p {
            Part::Text { text } if !text.trim().is_empty() => Some(text.clone()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn prompt(system: &str) -> GenerationPrompt {
        GenerationPrompt { system: system.into(), user: "go".into() }
    }

    #[test]
    fn extracts_text_part() {
        let resp: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [
                { "inlineData": { "mimeType": "image/png", "data": "AAAA" } },
                { "text": "Que praia linda!" }
            ]}}]
        }))
        .unwrap();
        assert_eq!(extract_first_text(&resp).as_deref(), Some("Que praia linda!"));

        let empty: GeminiResponse = serde_json::from_value(json!({ "candidates": [] })).unwrap();
        assert_eq!(extract_first_text(&empty), None);
    }

    #[test]
    fn parses_fenced_description() {
        let text = "```json\n{\"objects\":[{\"name\":\"gato\",\"confidence\":0.9}],\"confidence_overall\":0.7}\n```";
        let desc = parse_description(text).unwrap();
        assert_eq!(desc.objects, vec![Evidence::new("gato", 0.9)]);
        assert_eq!(desc.schema_version.as_deref(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn rejects_invalid_description() {
        assert!(matches!(parse_description("not json"), Err(ProviderError::Parse(_))));
        let out_of_range = r#"{"objects":[{"name":"gato","confidence":3.0}],"confidence_overall":0.7}"#;
        assert!(matches!(parse_description(out_of_range), Err(ProviderError::Parse(_))));
    }

    #[test]
    fn truncates_inline_data_for_logs() {
        let mut body = json!({ "parts": [{ "inlineData": { "data": "x".repeat(500) } }] });
        truncate_base64_in_json(&mut body);
        let data = body["parts"][0]["inlineData"]["data"].as_str().unwrap();
        assert!(data.ends_with("...[truncated 450 chars]"));
    }

    #[test]
    fn sniffs_png_and_defaults_to_jpeg() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(sniff_mime(&png), "image/png");
        assert_eq!(sniff_mime(b"????"), "image/jpeg");
    }

    #[test]
    fn demo_message_uses_first_anchor_and_rotates() {
        let first = demo_message(&prompt("rules\n\nANCHORS:\npraia, violao\n\nTONE (X):\nbe nice"));
        assert_eq!(first, "Que praia incrível! Qual a história por trás disso?");

        let second = demo_message(&prompt("ANCHORS:\ncachorro\n\nPREVIOUS SUGGESTIONS (AVOID REPETITION):\n1. Que praia incrível!"));
        assert_eq!(second, "Fiquei curioso com esse cachorro na sua foto, me conta mais?");
    }

    #[tokio::test]
    async fn demo_client_works_offline() {
        let client = GeminiClient::new(&AppConfig::demo());
        let report = client.describe(&ImageInput::Url("https://cdn.example/p.jpg".into())).await;
        assert!(!report.low_confidence);
        assert_eq!(report.description.places, vec![Evidence::new("praia", 0.88)]);

        let text = client.complete(&prompt("ANCHORS:\nviolao\n")).await.unwrap();
        assert!(text.contains("violao"));
    }
}
