//! Last-line checks applied to any message before it reaches a user.
//!
//! Every rejection carries a fallback string so callers never dead-end.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::VisualDescription;
use crate::similarity::repetition_score;

pub const MIN_ANCHOR_COUNT: usize = 1;
pub const MAX_REGENERATIONS: u32 = 1;
pub const MAX_REPETITION_RATE: f64 = 0.6;
pub const MAX_MESSAGE_LENGTH: usize = 500;
pub const MIN_VISION_CONFIDENCE: f64 = 0.5;
pub const MAX_REQUESTS_PER_MINUTE: u32 = 10;
pub const MAX_REQUESTS_PER_HOUR: u32 = 100;

const ELLIPSIS: &str = "...";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailReason {
    AnchorMissing,
    MaxRegenerations,
    HighRepetition,
    MessageTooLong,
    InvalidContext,
    LowConfidence,
    RateLimitMinute,
    RateLimitHour,
}

impl GuardrailReason {
    /// Canned text shown instead of the rejected message. `MessageTooLong`
    /// uses the truncated message instead, so this is only a last resort.
    pub fn canned_fallback(self) -> &'static str {
        match self {
            GuardrailReason::AnchorMissing => "Que foto interessante! Me conte mais sobre você.",
            GuardrailReason::MaxRegenerations => "Desculpe, já gerei o máximo de sugestões alternativas.",
            GuardrailReason::HighRepetition => "Que tal tentarmos uma abordagem diferente?",
            GuardrailReason::MessageTooLong => "Mensagem longa demais, tente outra sugestão.",
            GuardrailReason::InvalidContext => "Não foi possível analisar a imagem adequadamente.",
            GuardrailReason::LowConfidence => "A imagem não está clara o suficiente para análise.",
            GuardrailReason::RateLimitMinute => "Muitas solicitações. Tente novamente em alguns minutos.",
            GuardrailReason::RateLimitHour => "Limite de uso excedido. Tente novamente mais tarde.",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GuardrailMetrics {
    pub anchor_count: usize,
    pub message_length: usize,
    pub repetition_score: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GuardrailResult {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<GuardrailReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<GuardrailMetrics>,
}

impl GuardrailResult {
    pub fn allow(metrics: Option<GuardrailMetrics>) -> Self {
        Self { allowed: true, reason: None, fallback: None, metrics }
    }

    pub fn reject(reason: GuardrailReason, metrics: Option<GuardrailMetrics>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            fallback: Some(reason.canned_fallback().to_string()),
            metrics,
        }
    }

    /// The text to deliver: the original message when allowed, else the fallback.
    pub fn deliverable(&self, message: &str) -> String {
        if self.allowed {
            return message.to_string();
        }
        self.fallback
            .clone()
            .or_else(|| self.reason.map(|r| r.canned_fallback().to_string()))
            .unwrap_or_else(|| message.to_string())
    }
}

/// Checks run in priority order; the first failure decides the reason.
pub fn evaluate<A: AsRef<str>, P: AsRef<str>>(
    message: &str,
    anchor_tokens: &[A],
    prior_messages: &[P],
    regeneration_count: u32,
) -> GuardrailResult {
    let anchor_count = anchor_tokens
        .iter()
        .map(AsRef::as_ref)
        .filter(|t| !t.trim().is_empty())
        .collect::<HashSet<&str>>()
        .len();
    let message_length = message.chars().count();
    let metrics = GuardrailMetrics {
        anchor_count,
        message_length,
        repetition_score: repetition_score(message, prior_messages),
    };

    if anchor_count < MIN_ANCHOR_COUNT {
        return GuardrailResult::reject(GuardrailReason::AnchorMissing, Some(metrics));
    }
    if regeneration_count >= MAX_REGENERATIONS {
        return GuardrailResult::reject(GuardrailReason::MaxRegenerations, Some(metrics));
    }
    if metrics.repetition_score > MAX_REPETITION_RATE {
        return GuardrailResult::reject(GuardrailReason::HighRepetition, Some(metrics));
    }
    if message_length > MAX_MESSAGE_LENGTH {
        let keep = MAX_MESSAGE_LENGTH - ELLIPSIS.len();
        let truncated: String = message.chars().take(keep).chain(ELLIPSIS.chars()).collect();
        return GuardrailResult {
            allowed: false,
            reason: Some(GuardrailReason::MessageTooLong),
            fallback: Some(truncated),
            metrics: Some(metrics),
        };
    }

    GuardrailResult::allow(Some(metrics))
}

/// Sanity check on a vision description before anchors are built from it.
pub fn validate_visual_description(desc: &VisualDescription) -> GuardrailResult {
    let has_schema = desc
        .schema_version
        .as_deref()
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false);
    if !has_schema {
        return GuardrailResult::reject(GuardrailReason::InvalidContext, None);
    }
    if desc.overall_confidence < MIN_VISION_CONFIDENCE {
        return GuardrailResult::reject(GuardrailReason::LowConfidence, None);
    }
    GuardrailResult::allow(None)
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitCounts {
    pub per_minute: u32,
    pub per_hour: u32,
}

/// Request counts are owned by the host; the gate only reads them.
pub trait RequestQuota: Send + Sync {
    fn counts(&self, key: &str) -> RateLimitCounts;

    /// Counts earlier requests for `key` and records this one only when
    /// `check_rate_limit` admits it, as a single step. Returns the counts
    /// seen before recording.
    fn try_record(&self, key: &str) -> RateLimitCounts;
}

pub fn check_rate_limit(counts: RateLimitCounts) -> GuardrailResult {
    if counts.per_minute >= MAX_REQUESTS_PER_MINUTE {
        return GuardrailResult::reject(GuardrailReason::RateLimitMinute, None);
    }
    if counts.per_hour >= MAX_REQUESTS_PER_HOUR {
        return GuardrailResult::reject(GuardrailReason::RateLimitHour, None);
    }
    GuardrailResult::allow(None)
}

const GENERIC_OPENERS: [&str; 5] = [
    "Que foto interessante! Me conte mais sobre você.",
    "Adorei! O que você gosta de fazer no tempo livre?",
    "Muito legal! Qual é sua paixão?",
    "Que incrível! Me fale sobre seus hobbies.",
    "Adorei ver isso! O que te motiva?",
];

const CONTEXTUAL_OPENERS: &[(&[&str], &str)] = &[
    (&["praia"], "Que praia incrível! Qual seu destino favorito?"),
    (&["musica", "guitarra", "violao"], "Que talento musical! Qual instrumento você toca?"),
    (&["livro"], "Que ambiente acolhedor! Qual livro você recomenda?"),
    (&["cachorro", "pet"], "Que pet fofinho! Como ele se chama?"),
];

/// Short opener keyed on the first anchor, or a random generic one.
pub fn short_fallback_question<A: AsRef<str>, R: Rng + ?Sized>(anchor_tokens: &[A], rng: &mut R) -> String {
    if let Some(first) = anchor_tokens.first() {
        let first = first.as_ref();
        if let Some((_, question)) = CONTEXTUAL_OPENERS
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| first.contains(k)))
        {
            return question.to_string();
        }
    }
    GENERIC_OPENERS
        .choose(rng)
        .copied()
        .unwrap_or(GENERIC_OPENERS[0])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SCHEMA_VERSION;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const NONE: [&str; 0] = [];

    #[test]
    fn missing_anchor_wins() {
        let result = evaluate("x", &NONE, &NONE, 0);
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(GuardrailReason::AnchorMissing));
        assert_eq!(result.fallback.as_deref(), Some(GuardrailReason::AnchorMissing.canned_fallback()));
    }

    #[test]
    fn anchor_missing_beats_length() {
        let long = "a".repeat(900);
        let result = evaluate(&long, &NONE, &NONE, 5);
        assert_eq!(result.reason, Some(GuardrailReason::AnchorMissing));
        assert_eq!(result.metrics.unwrap().message_length, 900);
    }

    #[test]
    fn single_regeneration_cap() {
        assert!(evaluate("Que praia linda!", &["praia"], &NONE, 0).allowed);
        let result = evaluate("Que praia linda!", &["praia"], &NONE, 1);
        assert_eq!(result.reason, Some(GuardrailReason::MaxRegenerations));
    }

    #[test]
    fn rejects_repetition() {
        let result = evaluate("que praia incrivel hoje", &["praia"], &["que praia incrivel ontem"], 0);
        assert_eq!(result.reason, Some(GuardrailReason::HighRepetition));
        assert!(result.metrics.unwrap().repetition_score > MAX_REPETITION_RATE);
    }

    #[test]
    fn truncates_long_messages() {
        let long = "ç".repeat(600);
        let result = evaluate(&long, &["praia"], &NONE, 0);
        assert_eq!(result.reason, Some(GuardrailReason::MessageTooLong));
        let fallback = result.fallback.unwrap();
        assert_eq!(fallback.chars().count(), MAX_MESSAGE_LENGTH);
        assert!(fallback.ends_with("ç..."));
    }

    #[test]
    fn allowed_carries_metrics() {
        let result = evaluate("Que violão bonito!", &["violao", "violao", "praia"], &["Oi"], 0);
        assert_eq!(
            result,
            GuardrailResult::allow(Some(GuardrailMetrics {
                anchor_count: 2,
                message_length: 18,
                repetition_score: 0.0,
            }))
        );
        assert_eq!(result.deliverable("Que violão bonito!"), "Que violão bonito!");
    }

    #[test]
    fn description_sanity() {
        let mut desc = VisualDescription { overall_confidence: 0.9, ..VisualDescription::default() };
        assert_eq!(validate_visual_description(&desc).reason, Some(GuardrailReason::InvalidContext));

        desc.schema_version = Some(SCHEMA_VERSION.into());
        assert!(validate_visual_description(&desc).allowed);

        desc.overall_confidence = 0.49;
        assert_eq!(validate_visual_description(&desc).reason, Some(GuardrailReason::LowConfidence));
    }

    #[test]
    fn rate_limit_ceilings_are_independent() {
        assert!(check_rate_limit(RateLimitCounts { per_minute: 9, per_hour: 99 }).allowed);
        assert_eq!(
            check_rate_limit(RateLimitCounts { per_minute: 10, per_hour: 10 }).reason,
            Some(GuardrailReason::RateLimitMinute)
        );
        assert_eq!(
            check_rate_limit(RateLimitCounts { per_minute: 0, per_hour: 100 }).reason,
            Some(GuardrailReason::RateLimitHour)
        );
    }

    #[test]
    fn contextual_fallback_uses_first_anchor() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            short_fallback_question(&["praia", "livro"], &mut rng),
            "Que praia incrível! Qual seu destino favorito?"
        );
        assert_eq!(
            short_fallback_question(&["violao"], &mut rng),
            "Que talento musical! Qual instrumento você toca?"
        );
        assert_eq!(short_fallback_question(&["cachorro"], &mut rng), "Que pet fofinho! Como ele se chama?");
    }

    #[test]
    fn generic_fallback_is_seeded() {
        let pick = |seed| short_fallback_question(&["gato"], &mut StdRng::seed_from_u64(seed));
        assert!(GENERIC_OPENERS.contains(&pick(11).as_str()));
        assert_eq!(pick(11), pick(11));
        assert!(GENERIC_OPENERS.contains(&short_fallback_question(&NONE, &mut StdRng::seed_from_u64(2)).as_str()));
    }
}
