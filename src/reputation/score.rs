//! Reputation records, XP schedule and level curve
//!
//! XP only ever grows. Levels are derived from XP on demand and never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::issues::aggregator::DecisionBasis;
use crate::issues::models::{IssueId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        }
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "ADMIN" => Ok(Role::Admin),
            other => Err(CoreError::validation(format!("unknown role: {}", other))),
        }
    }
}

/// Lifecycle event consumed by the reputation engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationEvent {
    pub user_id: UserId,
    pub issue_id: IssueId,
    pub kind: ReputationEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReputationEventKind {
    IssueSubmitted,
    IssueVerified { basis: DecisionBasis },
    IssueRejected,
    /// An upvote from `voter` left a verified issue net-positive
    UpvoteReceived { voter: UserId },
}

/// Idempotency class of an award. At most one award exists per
/// `(issue, AwardKind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AwardKind {
    Submitted,
    Verified,
    Rejected,
    UpvoteReceived { voter: UserId },
}

impl AwardKind {
    /// Stable key used for persistence
    pub fn key(&self) -> String {
        match self {
            AwardKind::Submitted => "submitted".to_string(),
            AwardKind::Verified => "verified".to_string(),
            AwardKind::Rejected => "rejected".to_string(),
            AwardKind::UpvoteReceived { voter } => format!("upvote:{}", voter),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "submitted" => Some(AwardKind::Submitted),
            "verified" => Some(AwardKind::Verified),
            "rejected" => Some(AwardKind::Rejected),
            other => other
                .strip_prefix("upvote:")
                .map(|voter| AwardKind::UpvoteReceived {
                    voter: voter.to_string(),
                }),
        }
    }
}

impl fmt::Display for AwardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpAward {
    pub user_id: UserId,
    pub issue_id: IssueId,
    pub kind: AwardKind,
    pub xp: u64,
    pub awarded_at: DateTime<Utc>,
}

/// Fixed XP schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XpSchedule {
    pub submit: u64,
    pub verified: u64,
    pub verified_ai_fast_path: u64,
    pub upvote_received: u64,
}

impl Default for XpSchedule {
    fn default() -> Self {
        Self {
            submit: 10,
            verified: 25,
            verified_ai_fast_path: 15,
            upvote_received: 5,
        }
    }
}

impl XpSchedule {
    /// Award kind and XP for an event
    pub fn award_for(&self, kind: &ReputationEventKind) -> (AwardKind, u64) {
        match kind {
            ReputationEventKind::IssueSubmitted => (AwardKind::Submitted, self.submit),
            ReputationEventKind::IssueVerified {
                basis: DecisionBasis::AiFastPath,
            } => (AwardKind::Verified, self.verified_ai_fast_path),
            ReputationEventKind::IssueVerified { .. } => (AwardKind::Verified, self.verified),
            ReputationEventKind::IssueRejected => (AwardKind::Rejected, 0),
            ReputationEventKind::UpvoteReceived { voter } => (
                AwardKind::UpvoteReceived {
                    voter: voter.clone(),
                },
                self.upvote_received,
            ),
        }
    }
}

/// Level policy. Must be monotonic in XP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "curve", rename_all = "snake_case")]
pub enum LevelCurve {
    /// `floor(sqrt(xp / unit)) + 1`
    SquareRoot { unit: u64 },
    /// `xp / per_level + 1`
    Linear { per_level: u64 },
}

impl Default for LevelCurve {
    fn default() -> Self {
        LevelCurve::SquareRoot { unit: 100 }
    }
}

impl LevelCurve {
    pub fn level(&self, xp: u64) -> u32 {
        let level = match *self {
            // floor(sqrt(x)) == floor(sqrt(floor(x))) so integer division is exact here
            LevelCurve::SquareRoot { unit } => (xp / unit.max(1)).isqrt() + 1,
            LevelCurve::Linear { per_level } => xp / per_level.max(1) + 1,
        };
        level.min(u32::MAX as u64) as u32
    }

    /// Minimum XP at which `level` is reached
    pub fn xp_for_level(&self, level: u32) -> u64 {
        let steps = level.saturating_sub(1) as u64;
        match *self {
            LevelCurve::SquareRoot { unit } => steps.saturating_mul(steps).saturating_mul(unit.max(1)),
            LevelCurve::Linear { per_level } => steps.saturating_mul(per_level.max(1)),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            LevelCurve::SquareRoot { unit: 0 } | LevelCurve::Linear { per_level: 0 } => {
                Err("level curve step must be non-zero".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl FromStr for LevelCurve {
    type Err = String;

    /// Parses `sqrt:100` or `linear:100`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, step) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid level curve '{}', expected <sqrt|linear>:<step>", s))?;
        let step: u64 = step
            .trim()
            .parse()
            .map_err(|_| format!("invalid level curve step in '{}'", s))?;
        match name.trim() {
            "sqrt" => Ok(LevelCurve::SquareRoot { unit: step }),
            "linear" => Ok(LevelCurve::Linear { per_level: step }),
            other => Err(format!("unknown level curve '{}'", other)),
        }
    }
}

/// Per-user reputation state owned by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationRecord {
    pub user_id: UserId,
    pub role: Role,
    pub xp: u64,
    pub submitted_count: u32,
    pub verified_count: u32,
    pub rejected_count: u32,
    pub awards: Vec<XpAward>,
    pub created_at: DateTime<Utc>,
}

impl ReputationRecord {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self {
            user_id,
            role,
            xp: 0,
            submitted_count: 0,
            verified_count: 0,
            rejected_count: 0,
            awards: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn apply_award(&mut self, award: XpAward) {
        self.xp = self.xp.saturating_add(award.xp);
        match award.kind {
            AwardKind::Submitted => self.submitted_count += 1,
            AwardKind::Verified => self.verified_count += 1,
            AwardKind::Rejected => self.rejected_count += 1,
            AwardKind::UpvoteReceived { .. } => {}
        }
        self.awards.push(award);
    }

    /// Verified share of submitted issues (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.submitted_count == 0 {
            return 0.0;
        }
        self.verified_count as f64 / self.submitted_count as f64
    }
}

/// Read model returned to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationView {
    pub user_id: UserId,
    pub role: Role,
    pub xp: u64,
    pub level: u32,
    pub next_level_xp: u64,
    pub submitted_count: u32,
    pub verified_count: u32,
    pub rejected_count: u32,
    pub success_rate: f64,
}

impl ReputationView {
    pub fn from_record(record: &ReputationRecord, curve: &LevelCurve) -> Self {
        let level = curve.level(record.xp);
        Self {
            user_id: record.user_id.clone(),
            role: record.role,
            xp: record.xp,
            level,
            next_level_xp: curve.xp_for_level(level.saturating_add(1)),
            submitted_count: record.submitted_count,
            verified_count: record.verified_count,
            rejected_count: record.rejected_count,
            success_rate: record.success_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_root_levels() {
        let curve = LevelCurve::default();
        assert_eq!(curve.level(0), 1);
        assert_eq!(curve.level(35), 1);
        assert_eq!(curve.level(99), 1);
        assert_eq!(curve.level(100), 2);
        assert_eq!(curve.level(399), 2);
        assert_eq!(curve.level(400), 3);
        assert_eq!(curve.xp_for_level(3), 400);
    }

    #[test]
    fn test_levels_monotonic() {
        for curve in [LevelCurve::default(), LevelCurve::Linear { per_level: 100 }] {
            let mut last = 0;
            for xp in 0..5_000 {
                let level = curve.level(xp);
                assert!(level >= last);
                last = level;
            }
        }
    }

    #[test]
    fn test_linear_curve_parse() {
        let curve: LevelCurve = "linear:100".parse().unwrap();
        assert_eq!(curve.level(250), 3);
        assert!("cubic:3".parse::<LevelCurve>().is_err());
    }

    #[test]
    fn test_schedule_fast_path() {
        let schedule = XpSchedule::default();
        let (kind, xp) = schedule.award_for(&ReputationEventKind::IssueVerified {
            basis: DecisionBasis::AiFastPath,
        });
        assert_eq!(kind, AwardKind::Verified);
        assert_eq!(xp, 15);

        let (_, xp) = schedule.award_for(&ReputationEventKind::IssueVerified {
            basis: DecisionBasis::Community,
        });
        assert_eq!(xp, 25);
    }

    #[test]
    fn test_award_kind_key_roundtrip() {
        let kind = AwardKind::UpvoteReceived {
            voter: "carol".to_string(),
        };
        assert_eq!(AwardKind::from_key(&kind.key()), Some(kind));
        assert_eq!(AwardKind::from_key("bogus"), None);
    }

    #[test]
    fn test_success_rate() {
        let mut record = ReputationRecord::new("alice".to_string(), Role::User);
        assert_eq!(record.success_rate(), 0.0);
        record.submitted_count = 4;
        record.verified_count = 3;
        assert!((record.success_rate() - 0.75).abs() < 0.001);
    }
}
