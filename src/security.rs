use reqwest::Url;
use thiserror::Error;

use crate::models::IcebreakerRequest;
use crate::providers::ImageInput;

pub const MAX_IMAGE_BASE64_LEN: usize = 10 * 1024 * 1024;
pub const MAX_TEXT_LEN: usize = 1000;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("image_base64, image_url or description is required")]
    MissingImage,
    #[error("image too large ({0} bytes, max 10MB)")]
    ImageTooLarge(usize),
    #[error("image_url must be a valid URL: {0}")]
    InvalidUrl(String),
}

pub fn validate_icebreaker_request(body: &IcebreakerRequest) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let has_image = body.image_base64.as_deref().is_some_and(|s| !s.trim().is_empty())
        || body.image_url.as_deref().is_some_and(|s| !s.trim().is_empty());
    if !has_image && body.description.is_none() {
        errors.push(ValidationError::MissingImage);
    }
    if let Some(data) = &body.image_base64 {
        if data.len() > MAX_IMAGE_BASE64_LEN {
            errors.push(ValidationError::ImageTooLarge(data.len()));
        }
    }
    if let Some(url) = body.image_url.as_deref().filter(|u| !u.trim().is_empty()) {
        if Url::parse(url).is_err() {
            errors.push(ValidationError::InvalidUrl(url.to_string()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn describe_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Inline data wins over a URL when both are present.
pub fn image_input(body: &IcebreakerRequest) -> Option<ImageInput> {
    if let Some(data) = body.image_base64.as_deref().filter(|s| !s.trim().is_empty()) {
        return Some(ImageInput::Base64 { data: data.trim().to_string(), mime_type: None });
    }
    body.image_url
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(|url| ImageInput::Url(url.trim().to_string()))
}

/// Strips angle brackets, trims, and caps length for text that ends up in prompts.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '<' && *c != '>')
        .collect::<String>()
        .trim()
        .chars()
        .take(MAX_TEXT_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> IcebreakerRequest {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    #[test]
    fn requires_some_image_source() {
        assert_eq!(validate_icebreaker_request(&request()), Err(vec![ValidationError::MissingImage]));

        let body = IcebreakerRequest { image_url: Some("https://cdn.example/p.jpg".into()), ..request() };
        assert_eq!(validate_icebreaker_request(&body), Ok(()));
        assert_eq!(image_input(&body), Some(ImageInput::Url("https://cdn.example/p.jpg".into())));
    }

    #[test]
    fn collects_every_problem() {
        let body = IcebreakerRequest {
            image_base64: Some("A".repeat(MAX_IMAGE_BASE64_LEN + 1)),
            image_url: Some("not a url".into()),
            ..request()
        };
        let errors = validate_icebreaker_request(&body).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::ImageTooLarge(MAX_IMAGE_BASE64_LEN + 1),
                ValidationError::InvalidUrl("not a url".into()),
            ]
        );
        assert!(describe_errors(&errors).contains("; "));
    }

    #[test]
    fn sanitizes_prompt_text() {
        assert_eq!(sanitize_text("  <b>flertante</b> "), "bflertante/b");
        assert_eq!(sanitize_text(&"é".repeat(1200)).chars().count(), MAX_TEXT_LEN);
    }
}
