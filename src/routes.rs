use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::anchors::{build_anchors, exhausted_tokens};
use crate::config::AppConfig;
use crate::gemini::GeminiClient;
use crate::generator::{anchors_used, GroundedGenerator};
use crate::guardrails::{self, GuardrailReason, GuardrailResult, RequestQuota};
use crate::models::{
    Anchor, Conversation, EvaluateRequest, GenerationOutcome, GenerationRequest, IcebreakerRequest,
    IcebreakerResponse, RegenerateRequest, VisualDescription, DEFAULT_TONE,
};
use crate::providers::{TextGenerator, VisionDescriber};
use crate::quota::InMemoryQuota;
use crate::security::{self, sanitize_text, ValidationError};
use crate::telemetry::{GenerationMetrics, InMemoryTelemetry, TelemetryEvent, TelemetrySink, TelemetryStats};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RwLock<HashMap<Uuid, Conversation>>>,
    pub vision: Arc<dyn VisionDescriber>,
    pub generator: Arc<GroundedGenerator>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub quota: Arc<dyn RequestQuota>,
    pub config: Arc<AppConfig>,
    /// Seeds fallback-opener choices; `None` draws from entropy per request.
    pub rng_seed: Option<u64>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let gemini = Arc::new(GeminiClient::new(&config));
        Self::with_providers(config, gemini.clone(), gemini)
    }

    pub fn with_providers(
        config: AppConfig,
        vision: Arc<dyn VisionDescriber>,
        text: Arc<dyn TextGenerator>,
    ) -> Self {
        Self::build(config, vision, text, None)
    }

    /// Like `with_providers`, with every random choice drawn from `seed`.
    pub fn seeded(
        config: AppConfig,
        vision: Arc<dyn VisionDescriber>,
        text: Arc<dyn TextGenerator>,
        seed: u64,
    ) -> Self {
        Self::build(config, vision, text, Some(seed))
    }

    fn build(
        config: AppConfig,
        vision: Arc<dyn VisionDescriber>,
        text: Arc<dyn TextGenerator>,
        rng_seed: Option<u64>,
    ) -> Self {
        let mut generator = GroundedGenerator::new(text, config.generation_timeout);
        if let Some(seed) = rng_seed {
            generator = generator.with_seed(seed);
        }
        Self {
            store: Arc::default(),
            vision,
            generator: Arc::new(generator),
            telemetry: Arc::new(InMemoryTelemetry::new(config.telemetry_capacity)),
            quota: Arc::new(InMemoryQuota::new()),
            config: Arc::new(config),
            rng_seed,
        }
    }

    fn rng(&self) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    Router::new()
        .route("/api/icebreakers", post(create_icebreaker))
        .route("/api/icebreakers/:id", get(get_icebreaker))
        .route("/api/icebreakers/:id/regenerate", post(regenerate_icebreaker))
        .route("/api/anchors", post(compute_anchors))
        .route("/api/guardrails/evaluate", post(evaluate_message))
        .route("/api/metrics", get(metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("rejected by guardrail")]
    Guardrail(GuardrailResult),
    #[error("rate limit exceeded")]
    RateLimited(GuardrailResult),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response(),
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Guardrail(result) => (StatusCode::UNPROCESSABLE_ENTITY, Json(result)).into_response(),
            ApiError::RateLimited(result) => (StatusCode::TOO_MANY_REQUESTS, Json(result)).into_response(),
        }
    }
}

struct Timings {
    started: Instant,
    vision_ms: u64,
    anchors_ms: u64,
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn caller_key(user_id: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(user) = user_id.map(str::trim).filter(|u| !u.is_empty()) {
        return format!("user:{user}");
    }
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| format!("ip:{}", ip.trim()))
        .unwrap_or_else(|| "anonymous".to_string())
}

fn enforce_quota(state: &AppState, key: &str) -> Result<(), ApiError> {
    let verdict = guardrails::check_rate_limit(state.quota.try_record(key));
    if verdict.allowed {
        return Ok(());
    }
    warn!("🔐 Rate limit exceeded for {}", key);
    state.telemetry.record(TelemetryEvent::Security {
        kind: "RATE_LIMIT_EXCEEDED".into(),
        detail: key.to_string(),
    });
    Err(ApiError::RateLimited(verdict))
}

fn record_guardrail(state: &AppState, request_id: Uuid, verdict: &GuardrailResult) {
    if let Some(reason) = verdict.reason {
        warn!("🛡️ Guardrail {:?} triggered for request {}", reason, request_id);
        state.telemetry.record(TelemetryEvent::Guardrail { request_id, reason });
    }
}

fn prompt_tone(tone: &str) -> String {
    let tone = sanitize_text(tone);
    if tone.is_empty() {
        DEFAULT_TONE.to_string()
    } else {
        tone
    }
}

fn clean_tags(tags: &[String]) -> Vec<String> {
    tags.iter().map(|t| sanitize_text(t)).filter(|t| !t.is_empty()).collect()
}

fn tokens(anchors: &[Anchor]) -> Vec<String> {
    anchors.iter().map(|a| a.token.clone()).collect()
}

/// Provider output for one conversation snapshot, not yet gated.
struct Draft {
    request_id: Uuid,
    outcome: GenerationOutcome,
    candidate: String,
    generation_ms: u64,
}

/// Runs the generator against `snapshot`. Touches no shared conversation state.
async fn draft_suggestion(
    state: &AppState,
    request_id: Uuid,
    snapshot: &Conversation,
    custom_instructions: Option<String>,
) -> Draft {
    let request = GenerationRequest::new(snapshot.tone.clone(), snapshot.anchors.clone())
        .with_focus_tags(snapshot.focus_tags.clone())
        .with_prior_messages(snapshot.suggestions.clone())
        .with_excluded(exhausted_tokens(&snapshot.used_anchor_tokens))
        .with_custom_instructions(custom_instructions)
        .with_max_attempts(state.config.max_generation_attempts);

    let generation_started = Instant::now();
    let outcome = state.generator.generate(&request).await;
    let generation_ms = elapsed_ms(generation_started);

    let candidate = match &outcome.message {
        Some(message) => message.clone(),
        None => {
            if let Some(reason) = &outcome.failure_reason {
                state.telemetry.record(TelemetryEvent::Error {
                    request_id: Some(request_id),
                    kind: "GENERATION_FAILED".into(),
                    message: reason.to_string(),
                });
            }
            guardrails::short_fallback_question(&tokens(&snapshot.anchors), &mut state.rng())
        }
    };

    Draft { request_id, outcome, candidate, generation_ms }
}

/// Gates `draft` against the stored `conversation` and records what was delivered.
fn deliver(
    state: &AppState,
    conversation: &mut Conversation,
    draft: Draft,
    regeneration_count: u32,
    user_id: Option<String>,
    timings: Timings,
    vision_attempts: Option<u32>,
) -> IcebreakerResponse {
    let Draft { request_id, outcome, candidate, generation_ms } = draft;
    let anchor_tokens = tokens(&conversation.anchors);

    let verdict = guardrails::evaluate(&candidate, &anchor_tokens, &conversation.suggestions, regeneration_count);
    record_guardrail(state, request_id, &verdict);
    let suggestion = verdict.deliverable(&candidate);

    let delivered_anchors = anchors_used(&suggestion, &conversation.anchors);
    for token in &delivered_anchors {
        if !conversation.used_anchor_tokens.contains(token) {
            conversation.used_anchor_tokens.push(token.clone());
        }
    }
    conversation.suggestions.push(suggestion.clone());
    conversation.updated_at = Utc::now();

    let metrics = GenerationMetrics {
        request_id,
        user_id,
        vision_ms: timings.vision_ms,
        anchors_ms: timings.anchors_ms,
        generation_ms,
        total_latency_ms: elapsed_ms(timings.started),
        anchor_count: anchor_tokens.len(),
        anchors_used: delivered_anchors.len(),
        repetition_score: verdict
            .metrics
            .as_ref()
            .map(|m| m.repetition_score)
            .unwrap_or(outcome.repetition_score),
        message_length: suggestion.chars().count(),
        attempts_used: outcome.attempts_used,
        success: outcome.succeeded && verdict.allowed,
        guardrail_triggered: !verdict.allowed,
        guardrail_reason: verdict.reason,
    };
    state.telemetry.record(TelemetryEvent::Generation(metrics));

    info!(
        "✅ Request {} delivered {} chars (attempts: {}, guardrail: {:?})",
        request_id,
        suggestion.chars().count(),
        outcome.attempts_used + 1,
        verdict.reason
    );

    IcebreakerResponse {
        conversation_id: conversation.id,
        request_id,
        suggestion,
        anchors: anchor_tokens,
        anchors_used: delivered_anchors,
        low_confidence: outcome.is_low_confidence || !outcome.succeeded,
        attempts_used: outcome.attempts_used,
        guardrail: verdict,
        vision_attempts,
    }
}

pub async fn create_icebreaker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IcebreakerRequest>,
) -> Result<Json<IcebreakerResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    if let Err(errors) = security::validate_icebreaker_request(&body) {
        let detail = security::describe_errors(&errors);
        warn!("🔐 Invalid input: {}", detail);
        state.telemetry.record(TelemetryEvent::Security { kind: "INVALID_INPUT".into(), detail: detail.clone() });
        return Err(ApiError::BadRequest(detail));
    }
    enforce_quota(&state, &caller_key(body.user_id.as_deref(), &headers))?;

    info!("🚀 Icebreaker request {} (tone: {})", request_id, body.tone);

    let (description, vision_attempts) = match (&body.description, security::image_input(&body)) {
        (Some(description), _) => {
            description.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
            (description.clone(), None)
        }
        (None, Some(image)) => {
            let report = state.vision.describe(&image).await;
            (report.description, Some(report.attempts))
        }
        (None, None) => return Err(ApiError::BadRequest(ValidationError::MissingImage.to_string())),
    };
    let vision_ms = elapsed_ms(started);

    let check = guardrails::validate_visual_description(&description);
    if !check.allowed {
        record_guardrail(&state, request_id, &check);
        return Err(ApiError::Guardrail(check));
    }

    let anchors_started = Instant::now();
    let anchors = build_anchors(&description);
    let anchors_ms = elapsed_ms(anchors_started);

    let now = Utc::now();
    let mut conversation = Conversation {
        id: Uuid::new_v4(),
        description,
        anchors,
        tone: prompt_tone(&body.tone),
        focus_tags: clean_tags(&body.focus_tags),
        suggestions: Vec::new(),
        used_anchor_tokens: Vec::new(),
        regeneration_count: 0,
        created_at: now,
        updated_at: now,
    };
    let custom = body.custom_instructions.as_deref().map(sanitize_text);

    let draft = draft_suggestion(&state, request_id, &conversation, custom).await;
    let response = deliver(
        &state,
        &mut conversation,
        draft,
        0,
        body.user_id.clone(),
        Timings { started, vision_ms, anchors_ms },
        vision_attempts,
    );

    state.store.write().insert(conversation.id, conversation);
    Ok(Json(response))
}

pub async fn regenerate_icebreaker(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegenerateRequest>,
) -> Result<Json<IcebreakerResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    let started = Instant::now();
    enforce_quota(&state, &caller_key(body.user_id.as_deref(), &headers))?;

    let custom = body.custom_instructions.as_deref().map(sanitize_text);

    // The regeneration is claimed under the write lock, so concurrent requests
    // for the same conversation see it before any provider call.
    let claimed = {
        let mut guard = state.store.write();
        let conversation = guard.get_mut(&id).ok_or(ApiError::NotFound)?;
        let regeneration_count = conversation.regeneration_count;
        if regeneration_count >= guardrails::MAX_REGENERATIONS {
            Err(refused_regeneration(request_id, conversation))
        } else {
            if let Some(tone) = &body.tone {
                conversation.tone = prompt_tone(tone);
            }
            if let Some(tags) = &body.focus_tags {
                conversation.focus_tags = clean_tags(tags);
            }
            conversation.regeneration_count += 1;
            conversation.updated_at = Utc::now();
            Ok((regeneration_count, conversation.clone()))
        }
    };
    let (regeneration_count, snapshot) = match claimed {
        Ok(claimed) => claimed,
        Err(refused) => {
            record_guardrail(&state, request_id, &refused.guardrail);
            return Ok(Json(refused));
        }
    };

    info!("🔁 Regenerating conversation {} (request {})", id, request_id);
    let draft = draft_suggestion(&state, request_id, &snapshot, custom).await;

    let mut guard = state.store.write();
    let conversation = guard.get_mut(&id).ok_or(ApiError::NotFound)?;
    let response = deliver(
        &state,
        conversation,
        draft,
        regeneration_count,
        body.user_id.clone(),
        Timings { started, vision_ms: 0, anchors_ms: 0 },
        None,
    );
    Ok(Json(response))
}

fn refused_regeneration(request_id: Uuid, conversation: &Conversation) -> IcebreakerResponse {
    let verdict = GuardrailResult::reject(GuardrailReason::MaxRegenerations, None);
    let last = conversation.suggestions.last().cloned().unwrap_or_default();
    IcebreakerResponse {
        conversation_id: conversation.id,
        request_id,
        suggestion: verdict.deliverable(&last),
        anchors: tokens(&conversation.anchors),
        anchors_used: Vec::new(),
        low_confidence: true,
        attempts_used: 0,
        guardrail: verdict,
        vision_attempts: None,
    }
}

pub async fn get_icebreaker(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<Conversation>, ApiError> {
    let conversation = state.store.read().get(&id).cloned();
    conversation.map(Json).ok_or(ApiError::NotFound)
}

pub async fn compute_anchors(Json(description): Json<VisualDescription>) -> Result<Json<Vec<Anchor>>, ApiError> {
    description
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(build_anchors(&description)))
}

pub async fn evaluate_message(Json(body): Json<EvaluateRequest>) -> Json<GuardrailResult> {
    Json(guardrails::evaluate(
        &body.message,
        &body.anchors,
        &body.prior_messages,
        body.regeneration_count,
    ))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub hours: Option<i64>,
}

pub async fn metrics(State(state): State<AppState>, Query(query): Query<MetricsQuery>) -> Json<TelemetryStats> {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 30);
    Json(TelemetryStats::from_records(&state.telemetry.query(Duration::hours(hours))))
}
