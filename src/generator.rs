use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

use crate::anchors::filter_available;
use crate::models::{Anchor, FailureReason, GenerationOutcome, GenerationRequest};
use crate::normalize::fold;
use crate::providers::{GenerationPrompt, ProviderError, TextGenerator};
use crate::similarity::repetition_score;

pub const MAX_REPETITION: f64 = 0.6;
pub const MIN_ANCHORS_USED: usize = 1;
pub const MAX_PROMPT_ANCHORS: usize = 5;
/// Working-set size when every anchor has been exhausted.
pub const DEGRADED_ANCHOR_COUNT: usize = 3;

pub const USER_DIRECTIVE: &str = "Generate exactly ONE message following every rule above.";
pub const NO_ANCHOR_QUESTION: &str = "O que você gosta de fazer no tempo livre?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneStyle {
    Flirty,
    Playful,
    Casual,
    Genuine,
    Spicy,
    Default,
}

/// Checked in order; the first style with a keyword inside the tone wins.
const TONE_KEYWORDS: &[(ToneStyle, &[&str])] = &[
    (ToneStyle::Flirty, &["flert", "flirt"]),
    (ToneStyle::Playful, &["descontra", "playful"]),
    (ToneStyle::Casual, &["casual"]),
    (ToneStyle::Genuine, &["genuin"]),
    (ToneStyle::Spicy, &["sensual", "picante", "spicy"]),
];

impl ToneStyle {
    pub fn from_label(tone: &str) -> Self {
        let tone = fold(tone);
        TONE_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| tone.contains(k)))
            .map(|(style, _)| *style)
            .unwrap_or(ToneStyle::Default)
    }

    pub fn directive(self) -> &'static str {
        match self {
            ToneStyle::Flirty => "Flirty and romantic, showing subtle, charming interest. Words like \"encantador\", \"olhar\", \"estilo\", \"energia\", \"conexão\" fit well.",
            ToneStyle::Playful => "Relaxed and fun, with a touch of humor and lightness. Expressions like \"que vibe\", \"curti\", \"top\" fit well.",
            ToneStyle::Casual => "Natural and spontaneous, like a chat between friends. Focus on simple observations and open invitations.",
            ToneStyle::Genuine => "Authentic and deep, showing real interest. Words like \"interessante\", \"curiosidade\", \"apaixonado\" fit well.",
            ToneStyle::Spicy => "Spicy and seductive while staying respectful. Words like \"irresistível\", \"química\", \"conexão\" fit well.",
            ToneStyle::Default => "Use a relaxed, casual tone by default.",
        }
    }
}

pub fn build_prompt(request: &GenerationRequest, working: &[Anchor], attempt: u32) -> GenerationPrompt {
    let anchor_names: Vec<&str> = working
        .iter()
        .take(MAX_PROMPT_ANCHORS)
        .map(|a| a.token.as_str())
        .collect();
    let tone = request.tone.trim();

    let mut system = format!(
        "You write ONE short, natural and original opening message for a dating app conversation, in Brazilian Portuguese.

HARD RULES:
- Base the message EXCLUSIVELY on the evidence listed under ANCHORS.
- Use AT LEAST ONE anchor, spelled exactly as listed.
- Forbidden: placeholders, generic clichés, claims the evidence does not show.
- If the anchors are not enough, return a SHORT contextual question (two lines at most).
- Avoid repeating ideas or words from PREVIOUS SUGGESTIONS; bring a new angle.
- Respect the selected TONE ({tone}).
- Output: ONLY the message text, no quotes, no bullets, no preamble.

ANCHORS:
{}",
        anchor_names.join(", ")
    );

    system.push_str(&format!(
        "\n\nTONE ({}):\n{}",
        tone.to_uppercase(),
        ToneStyle::from_label(tone).directive()
    ));

    if !request.focus_tags.is_empty() {
        system.push_str(&format!("\n\nFOCUS TAGS:\n{}", request.focus_tags.join(", ")));
    }

    if let Some(custom) = &request.custom_instructions {
        system.push_str(&format!("\n\nCUSTOM INSTRUCTIONS:\n{custom}"));
    }

    if attempt > 0 {
        system.push_str(
            "\n\nREGENERATION:\nThe previous attempt did not meet the criteria. Use at least one anchor and avoid repetition.",
        );
    }

    if !request.prior_messages.is_empty() {
        let listed: Vec<String> = request
            .prior_messages
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}. {}", i + 1, m))
            .collect();
        system.push_str(&format!(
            "\n\nPREVIOUS SUGGESTIONS (AVOID REPETITION):\n{}

VARIETY:
- Do not reuse concepts, keywords or approaches from the previous suggestions
- Explore completely different angles
- Prefer anchors the previous suggestions did not use
- Stay authentic but bring a fresh perspective",
            listed.join("\n")
        ));
    }

    GenerationPrompt { system, user: USER_DIRECTIVE.to_string() }
}

/// Anchor tokens that appear verbatim (case-insensitive) in `message`.
pub fn anchors_used(message: &str, anchors: &[Anchor]) -> Vec<String> {
    let message = message.to_lowercase();
    let mut used: Vec<String> = Vec::new();
    for anchor in anchors {
        if message.contains(anchor.token.as_str()) && !used.contains(&anchor.token) {
            used.push(anchor.token.clone());
        }
    }
    used
}

pub fn fallback_question<R: Rng + ?Sized>(anchors: &[Anchor], rng: &mut R) -> String {
    match anchors.choose(rng) {
        Some(anchor) => format!("Me conta mais sobre {}?", anchor.token),
        None => NO_ANCHOR_QUESTION.to_string(),
    }
}

/// Bounded-retry generator that only accepts messages grounded in at least
/// one anchor and not too close to earlier suggestions. Holds no per-request
/// state: each call draws its own rng.
pub struct GroundedGenerator {
    provider: Arc<dyn TextGenerator>,
    timeout: Duration,
    seed: Option<u64>,
}

impl GroundedGenerator {
    pub fn new(provider: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { provider, timeout, seed: None }
    }

    /// Every call starts from the same seed, so fallback choices repeat.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    pub async fn generate(&self, request: &GenerationRequest) -> GenerationOutcome {
        if request.tone.trim().is_empty() || request.anchors.is_empty() {
            warn!("⚠️ Generation refused: tone or anchors missing");
            return GenerationOutcome::failed(FailureReason::MissingParameters, 0);
        }

        let mut working = filter_available(&request.anchors, &request.excluded_anchor_tokens);
        if working.is_empty() {
            warn!("⚠️ All anchors exhausted, using the top {} anchors", DEGRADED_ANCHOR_COUNT);
            working = request.anchors.iter().take(DEGRADED_ANCHOR_COUNT).cloned().collect();
        }

        let max_attempts = request.max_attempts;
        for attempt in 0..=max_attempts {
            info!("🔄 Generation attempt {} via {}", attempt + 1, self.provider.name());
            let prompt = build_prompt(request, &working, attempt);

            let candidate = match self.complete(&prompt).await {
                Ok(text) => text,
                Err(e) => {
                    error!("❌ Generation attempt {} failed: {}", attempt + 1, e);
                    if attempt == max_attempts {
                        return GenerationOutcome::failed(
                            FailureReason::ProviderTransport { detail: e.to_string() },
                            attempt,
                        );
                    }
                    continue;
                }
            };

            let used = anchors_used(&candidate, &request.anchors);
            let repetition = repetition_score(&candidate, &request.prior_messages);
            info!("📊 Validation: {} anchors used, repetition {:.2}", used.len(), repetition);

            let grounded = used.len() >= MIN_ANCHORS_USED;
            let fresh = repetition <= MAX_REPETITION;

            if grounded && fresh {
                info!("✅ Accepted suggestion after {} attempt(s)", attempt + 1);
                return GenerationOutcome {
                    succeeded: true,
                    message: Some(candidate),
                    anchors_used: used,
                    repetition_score: repetition,
                    is_low_confidence: false,
                    attempts_used: attempt,
                    failure_reason: None,
                };
            }

            if attempt == max_attempts {
                warn!("⚠️ Attempts exhausted, returning a low-confidence suggestion");
                if !grounded {
                    return self.fallback_outcome(request, &working, attempt);
                }
                return GenerationOutcome {
                    succeeded: true,
                    message: Some(candidate),
                    anchors_used: used,
                    repetition_score: repetition,
                    is_low_confidence: true,
                    attempts_used: attempt,
                    failure_reason: None,
                };
            }

            info!("🔄 Regenerating: {}", if grounded { "high repetition" } else { "no anchors used" });
        }

        self.fallback_outcome(request, &working, max_attempts.saturating_add(1))
    }

    async fn complete(&self, prompt: &GenerationPrompt) -> Result<String, ProviderError> {
        let text = tokio::time::timeout(self.timeout, self.provider.complete(prompt))
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout))??;
        let text = text.trim();
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(text.to_string())
    }

    fn fallback_outcome(&self, request: &GenerationRequest, working: &[Anchor], attempts_used: u32) -> GenerationOutcome {
        let question = fallback_question(working, &mut self.rng());
        info!("📦 Fallback question: {}", question);
        GenerationOutcome {
            succeeded: true,
            anchors_used: anchors_used(&question, &request.anchors),
            repetition_score: repetition_score(&question, &request.prior_messages),
            message: Some(question),
            is_low_confidence: true,
            attempts_used,
            failure_reason: None,
        }
    }
}
