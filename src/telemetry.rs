use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::guardrails::GuardrailReason;

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GenerationMetrics {
    pub request_id: Uuid,
    pub user_id: Option<String>,
    pub vision_ms: u64,
    pub anchors_ms: u64,
    pub generation_ms: u64,
    pub total_latency_ms: u64,
    pub anchor_count: usize,
    pub anchors_used: usize,
    pub repetition_score: f64,
    pub message_length: usize,
    pub attempts_used: u32,
    pub success: bool,
    pub guardrail_triggered: bool,
    pub guardrail_reason: Option<GuardrailReason>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Generation(GenerationMetrics),
    Guardrail { request_id: Uuid, reason: GuardrailReason },
    Error { request_id: Option<Uuid>, kind: String, message: String },
    Security { kind: String, detail: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

/// Destination for pipeline events. Injected per application so tests get
/// their own isolated instance.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
    /// Records newer than `now - window`, oldest first.
    fn query(&self, window: Duration) -> Vec<TelemetryRecord>;
}

/// Bounded ring buffer; the oldest record is dropped once full.
pub struct InMemoryTelemetry {
    capacity: usize,
    records: Mutex<VecDeque<TelemetryRecord>>,
}

impl InMemoryTelemetry {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))) }
    }

    pub fn record_at(&self, at: DateTime<Utc>, event: TelemetryEvent) {
        let record = TelemetryRecord { at, event };
        info!("📋 {}", serde_json::to_string(&record).unwrap_or_default());
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTelemetry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn record(&self, event: TelemetryEvent) {
        self.record_at(Utc::now(), event);
    }

    fn query(&self, window: Duration) -> Vec<TelemetryRecord> {
        let cutoff = Utc::now() - window;
        self.records
            .lock()
            .iter()
            .filter(|r| r.at > cutoff)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TelemetryStats {
    pub total_requests: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub avg_anchor_coverage: f64,
    pub avg_repetition_rate: f64,
    pub guardrail_trigger_rate: f64,
    pub errors: usize,
}

impl TelemetryStats {
    pub fn from_records(records: &[TelemetryRecord]) -> Self {
        let generations: Vec<&GenerationMetrics> = records
            .iter()
            .filter_map(|r| match &r.event {
                TelemetryEvent::Generation(m) => Some(m),
                _ => None,
            })
            .collect();
        let errors = records
            .iter()
            .filter(|r| matches!(r.event, TelemetryEvent::Error { .. }))
            .count();

        if generations.is_empty() {
            return Self { errors, ..Self::default() };
        }

        let n = generations.len() as f64;
        let mut latencies: Vec<u64> = generations.iter().map(|m| m.total_latency_ms).collect();
        latencies.sort_unstable();
        let p95_index = ((latencies.len() as f64 * 0.95) as usize).min(latencies.len() - 1);

        let coverage = |m: &GenerationMetrics| {
            if m.anchor_count == 0 {
                0.0
            } else {
                m.anchors_used as f64 / m.anchor_count as f64
            }
        };

        Self {
            total_requests: generations.len(),
            success_rate: generations.iter().filter(|m| m.success).count() as f64 / n,
            avg_latency_ms: latencies.iter().sum::<u64>() as f64 / n,
            p95_latency_ms: latencies[p95_index],
            avg_anchor_coverage: generations.iter().map(|m| coverage(*m)).sum::<f64>() / n,
            avg_repetition_rate: generations.iter().map(|m| m.repetition_score).sum::<f64>() / n,
            guardrail_trigger_rate: generations.iter().filter(|m| m.guardrail_triggered).count() as f64 / n,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn metrics(latency: u64, used: usize, count: usize, success: bool, triggered: bool) -> TelemetryEvent {
        TelemetryEvent::Generation(GenerationMetrics {
            request_id: Uuid::new_v4(),
            user_id: None,
            vision_ms: 0,
            anchors_ms: 0,
            generation_ms: latency,
            total_latency_ms: latency,
            anchor_count: count,
            anchors_used: used,
            repetition_score: 0.2,
            message_length: 40,
            attempts_used: 0,
            success,
            guardrail_triggered: triggered,
            guardrail_reason: triggered.then_some(GuardrailReason::HighRepetition),
        })
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let sink = InMemoryTelemetry::new(3);
        for i in 0..5 {
            sink.record(TelemetryEvent::Security { kind: "scan".into(), detail: i.to_string() });
        }
        let details: Vec<String> = sink
            .query(Duration::hours(1))
            .into_iter()
            .filter_map(|r| match r.event {
                TelemetryEvent::Security { detail, .. } => Some(detail),
                _ => None,
            })
            .collect();
        assert_eq!(details, vec!["2", "3", "4"]);
    }

    #[test]
    fn query_respects_window() {
        let sink = InMemoryTelemetry::default();
        sink.record_at(Utc::now() - Duration::hours(30), metrics(10, 1, 1, true, false));
        sink.record(metrics(20, 1, 2, true, false));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.query(Duration::hours(24)).len(), 1);
    }

    #[test]
    fn aggregates_generation_metrics() {
        let sink = InMemoryTelemetry::default();
        sink.record(metrics(100, 1, 2, true, false));
        sink.record(metrics(300, 2, 2, false, true));
        sink.record(metrics(200, 0, 0, true, false));
        sink.record(TelemetryEvent::Error { request_id: None, kind: "INTERNAL".into(), message: "boom".into() });

        let stats = TelemetryStats::from_records(&sink.query(Duration::hours(24)));
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.p95_latency_ms, 300);
        assert!((stats.avg_latency_ms - 200.0).abs() < 1e-9);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.avg_anchor_coverage - 0.5).abs() < 1e-9);
        assert!((stats.guardrail_trigger_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_is_all_zero() {
        assert_eq!(TelemetryStats::from_records(&[]), TelemetryStats::default());
    }
}
