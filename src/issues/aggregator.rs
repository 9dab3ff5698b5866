//! Confidence Aggregator - blends classifier output and community votes
//!
//! Produces a verification score in [0, 1] and a recommendation for the
//! lifecycle manager. The evaluation is a pure function of the AI result, the
//! vote tally and the policy: no clocks, no randomness.

use serde::{Deserialize, Serialize};

use crate::issues::models::{AiResult, VoteTally};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Verify,
    Reject,
    Undecided,
}

/// What carried a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionBasis {
    /// Blended score of votes and classifier confidence
    Community,
    /// Classifier confidence alone, before enough votes arrived
    AiFastPath,
    /// Forced by an administrator
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub score: f64,
    pub recommendation: Recommendation,
    pub basis: Option<DecisionBasis>,
}

/// Governance-configurable aggregation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorPolicy {
    /// Votes required before the blended score can decide
    pub min_votes: u32,
    pub ai_weight: f64,
    pub vote_weight: f64,
    /// Score at or above which an issue is verified
    pub verify_threshold: f64,
    /// Score at or below which an issue is rejected
    pub reject_threshold: f64,
    /// Classifier confidence that decides on its own
    pub fast_path_confidence: f64,
}

impl Default for AggregatorPolicy {
    fn default() -> Self {
        Self {
            min_votes: 5,
            ai_weight: 0.6,
            vote_weight: 0.4,
            verify_threshold: 0.7,
            reject_threshold: 0.3,
            fast_path_confidence: 0.9,
        }
    }
}

impl AggregatorPolicy {
    pub fn validate(&self) -> Result<(), String> {
        let weights = self.ai_weight + self.vote_weight;
        if self.ai_weight < 0.0 || self.vote_weight < 0.0 || (weights - 1.0).abs() > 1e-9 {
            return Err(format!(
                "aggregator weights must be non-negative and sum to 1.0, got {} + {}",
                self.ai_weight, self.vote_weight
            ));
        }
        if !(0.0..=1.0).contains(&self.reject_threshold)
            || !(0.0..=1.0).contains(&self.verify_threshold)
            || self.reject_threshold >= self.verify_threshold
        {
            return Err(format!(
                "thresholds must satisfy 0 <= reject ({}) < verify ({}) <= 1",
                self.reject_threshold, self.verify_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.fast_path_confidence) {
            return Err(format!(
                "fast path confidence must be within [0, 1], got {}",
                self.fast_path_confidence
            ));
        }
        Ok(())
    }
}

/// Weighted score. Classifier confidence only counts as support when the
/// classifier verified the image.
pub fn score(ai_result: Option<&AiResult>, tally: &VoteTally, policy: &AggregatorPolicy) -> f64 {
    let ai_confidence = ai_result
        .filter(|r| r.verified)
        .map(|r| r.confidence)
        .unwrap_or(0.0);
    let raw = policy.ai_weight * ai_confidence + policy.vote_weight * tally.ratio();
    raw.clamp(0.0, 1.0)
}

/// Evaluate an issue's signals.
///
/// A score at or above the verify threshold verifies once the minimum vote
/// count is reached or a classifier result is present. Rejection by score
/// always needs the minimum vote count. The classifier decides alone only
/// while fewer than `min_votes` votes are in.
pub fn evaluate(ai_result: Option<&AiResult>, tally: &VoteTally, policy: &AggregatorPolicy) -> Verdict {
    let score = score(ai_result, tally, policy);
    let enough_votes = tally.total() >= policy.min_votes;

    if (enough_votes || ai_result.is_some()) && score >= policy.verify_threshold {
        return Verdict {
            score,
            recommendation: Recommendation::Verify,
            basis: Some(DecisionBasis::Community),
        };
    }
    if enough_votes {
        let recommendation = if score <= policy.reject_threshold {
            Recommendation::Reject
        } else {
            Recommendation::Undecided
        };
        return Verdict {
            score,
            recommendation,
            basis: (recommendation == Recommendation::Reject).then_some(DecisionBasis::Community),
        };
    }

    match ai_result {
        Some(ai) if ai.confidence >= policy.fast_path_confidence => Verdict {
            score,
            recommendation: if ai.verified {
                Recommendation::Verify
            } else {
                Recommendation::Reject
            },
            basis: Some(DecisionBasis::AiFastPath),
        },
        _ => Verdict {
            score,
            recommendation: Recommendation::Undecided,
            basis: None,
        },
    }
}
