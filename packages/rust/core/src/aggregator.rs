//! ConfidenceAggregator: blends self-reported confidence with validator
//! penalties and maps the score to a [`Disposition`].

use mcpextract_shared::{CandidateConfig, Disposition, Thresholds, ValidationReport};

/// Final score and review class for one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub confidence: f64,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceAggregator {
    thresholds: Thresholds,
}

impl ConfidenceAggregator {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    /// `base * multiplier`, where base is the self-reported confidence
    /// (clamped to [0, 1]) or 1.0. Any report error forces 0.0.
    pub fn aggregate(&self, candidate: &CandidateConfig, report: &ValidationReport) -> Scored {
        let confidence = if report.is_valid() {
            let base = candidate
                .confidence()
                .filter(|c| c.is_finite())
                .map_or(1.0, |c| c.clamp(0.0, 1.0));
            base * report.confidence_multiplier
        } else {
            0.0
        };

        Scored {
            confidence,
            disposition: self.classify(confidence),
        }
    }

    /// Inclusive lower bounds: `>= approve` approved, `>= review` needs review.
    pub fn classify(&self, confidence: f64) -> Disposition {
        if confidence >= self.thresholds.approve {
            Disposition::Approved
        } else if confidence >= self.thresholds.review {
            Disposition::NeedsReview
        } else {
            Disposition::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::validate;
    use serde_json::json;

    fn candidate(value: serde_json::Value) -> CandidateConfig {
        CandidateConfig::from_value(value).unwrap()
    }

    #[test]
    fn thresholds_are_inclusive() {
        let agg = ConfidenceAggregator::default();
        assert_eq!(agg.classify(0.9), Disposition::Approved);
        assert_eq!(agg.classify(0.8999), Disposition::NeedsReview);
        assert_eq!(agg.classify(0.7), Disposition::NeedsReview);
        assert_eq!(agg.classify(0.6999), Disposition::Rejected);
    }

    #[test]
    fn clean_npx_is_approved() {
        let c = candidate(json!({
            "name": "w", "command": "npx", "args": ["-y", "@acme/w"], "env": {}
        }));
        let scored = ConfidenceAggregator::default().aggregate(&c, &validate(&c));
        assert_eq!(scored.confidence, 1.0);
        assert_eq!(scored.disposition, Disposition::Approved);
    }

    #[test]
    fn self_reported_confidence_scales_score() {
        let c = candidate(json!({
            "name": "w", "command": "docker", "args": ["run", "acme/w"], "env": {},
            "confidence": 0.9
        }));
        let scored = ConfidenceAggregator::default().aggregate(&c, &validate(&c));
        assert!((scored.confidence - 0.81).abs() < 1e-12);
        assert_eq!(scored.disposition, Disposition::NeedsReview);
    }

    #[test]
    fn missing_name_is_rejected_at_zero() {
        let c = candidate(json!({"command": "npx", "args": ["-y", "p"], "env": {}, "confidence": 1.0}));
        let scored = ConfidenceAggregator::default().aggregate(&c, &validate(&c));
        assert_eq!(scored.confidence, 0.0);
        assert_eq!(scored.disposition, Disposition::Rejected);
    }

    #[test]
    fn error_candidate_is_rejected_at_zero() {
        let c = candidate(json!({"error": "invalid JSON from model"}));
        let scored = ConfidenceAggregator::default().aggregate(&c, &validate(&c));
        assert_eq!(scored.confidence, 0.0);
        assert_eq!(scored.disposition, Disposition::Rejected);
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        let c = candidate(json!({
            "name": "w", "command": "npx", "args": ["-y", "p"], "env": {}, "confidence": 3.0
        }));
        let report = validate(&c);
        let scored = ConfidenceAggregator::default().aggregate(&c, &report);
        assert_eq!(scored.confidence, report.confidence_multiplier);
        assert_eq!(scored.disposition, Disposition::Approved);
    }

    #[test]
    fn custom_thresholds() {
        let agg = ConfidenceAggregator::new(Thresholds {
            approve: 0.95,
            review: 0.5,
        });
        assert_eq!(agg.classify(0.9), Disposition::NeedsReview);
        assert_eq!(agg.classify(0.5), Disposition::NeedsReview);
    }
}
