use std::collections::HashSet;

use indexmap::map::Entry;
use indexmap::IndexMap;
use tracing::info;

use crate::models::{Anchor, AnchorCategory, AnchorSource, Evidence, VisualDescription};
use crate::normalize::normalize;

pub const MIN_WEIGHT: f64 = 0.1;
pub const MAX_WEIGHT: f64 = 1.0;
/// Confidence floor before the source bonus is applied.
pub const CONFIDENCE_FLOOR: f64 = 0.5;
pub const OCR_BONUS: f64 = 0.3;
pub const VISION_BONUS: f64 = 0.1;

pub const COLOR_CONFIDENCE: f64 = 0.8;
pub const DETAIL_CONFIDENCE: f64 = 0.7;
pub const OCR_CONFIDENCE: f64 = 0.9;

/// Token emitted when evidence existed but none of it survived normalization.
pub const FALLBACK_TOKEN: &str = "element";

pub fn calculate_weight(confidence: f64, source: AnchorSource) -> f64 {
    let bonus = match source {
        AnchorSource::OcrDerived => OCR_BONUS,
        AnchorSource::VisionDerived => VISION_BONUS,
    };
    (confidence.max(CONFIDENCE_FLOOR) + bonus).clamp(MIN_WEIGHT, MAX_WEIGHT)
}

/// Keyed by token, in first-seen order so ties sort deterministically.
#[derive(Default)]
struct AnchorSet {
    anchors: IndexMap<String, Anchor>,
}

impl AnchorSet {
    fn offer(&mut self, original: &str, confidence: f64, source: AnchorSource, category: AnchorCategory) {
        let token = normalize(original);
        if token.is_empty() {
            return;
        }
        let weight = calculate_weight(confidence, source);
        let candidate = Anchor {
            token: token.clone(),
            original_text: original.to_string(),
            source,
            category,
            confidence,
            weight,
        };
        match self.anchors.entry(token) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
            Entry::Occupied(mut slot) => {
                if weight > slot.get().weight {
                    slot.insert(candidate);
                }
            }
        }
    }

    fn offer_evidence(&mut self, items: &[Evidence], category: AnchorCategory) {
        for item in items {
            self.offer(&item.name, item.confidence, AnchorSource::VisionDerived, category);
        }
    }
}

/// Turns a vision description into a deduplicated anchor list, heaviest first.
pub fn build_anchors(desc: &VisualDescription) -> Vec<Anchor> {
    let mut set = AnchorSet::default();

    set.offer_evidence(&desc.objects, AnchorCategory::Object);
    set.offer_evidence(&desc.actions, AnchorCategory::Action);
    set.offer_evidence(&desc.places, AnchorCategory::Place);
    for color in &desc.colors {
        set.offer(color, COLOR_CONFIDENCE, AnchorSource::VisionDerived, AnchorCategory::Color);
    }
    for detail in &desc.notable_details {
        set.offer(detail, DETAIL_CONFIDENCE, AnchorSource::VisionDerived, AnchorCategory::Detail);
    }
    for word in desc.ocr_text.split_whitespace() {
        set.offer(word, OCR_CONFIDENCE, AnchorSource::OcrDerived, AnchorCategory::OcrWord);
    }

    let mut anchors: Vec<Anchor> = set.anchors.into_values().collect();

    if anchors.is_empty() && desc.has_evidence() {
        let confidence = desc.overall_confidence.clamp(0.0, 1.0);
        anchors.push(Anchor {
            token: FALLBACK_TOKEN.to_string(),
            original_text: "visual element".to_string(),
            source: AnchorSource::VisionDerived,
            category: AnchorCategory::Detail,
            confidence,
            weight: confidence.max(CONFIDENCE_FLOOR),
        });
    }

    // Stable: equal weights keep first-seen order.
    anchors.sort_by(|a, b| b.weight.total_cmp(&a.weight));

    let top: Vec<String> = anchors
        .iter()
        .take(5)
        .map(|a| format!("{}({:.2})", a.token, a.weight))
        .collect();
    info!("🔗 Computed {} unique anchors; top: {}", anchors.len(), top.join(", "));

    anchors
}

pub fn filter_available(anchors: &[Anchor], exhausted: &HashSet<String>) -> Vec<Anchor> {
    anchors
        .iter()
        .filter(|anchor| !exhausted.contains(&anchor.token))
        .cloned()
        .collect()
}

/// Canonicalizes tokens used in earlier turns so they can be excluded.
pub fn exhausted_tokens<S: AsRef<str>>(used: &[S]) -> HashSet<String> {
    used.iter()
        .map(|token| normalize(token.as_ref()))
        .filter(|token| !token.is_empty())
        .collect()
}
