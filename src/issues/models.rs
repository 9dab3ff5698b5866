//! Issue data models
//!
//! Issues, votes, AI classifier results and the status-transition history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};
use crate::issues::aggregator::{DecisionBasis, Verdict};

pub type IssueId = u64;
pub type UserId = String;

/// Maximum title length accepted on submit
pub const MAX_TITLE_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Pothole,
    Garbage,
    Streetlight,
    Flood,
    Traffic,
    Vandalism,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Pothole => "POTHOLE",
            Category::Garbage => "GARBAGE",
            Category::Streetlight => "STREETLIGHT",
            Category::Flood => "FLOOD",
            Category::Traffic => "TRAFFIC",
            Category::Vandalism => "VANDALISM",
            Category::Other => "OTHER",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "POTHOLE" => Ok(Category::Pothole),
            "GARBAGE" => Ok(Category::Garbage),
            "STREETLIGHT" => Ok(Category::Streetlight),
            "FLOOD" => Ok(Category::Flood),
            "TRAFFIC" => Ok(Category::Traffic),
            "VANDALISM" => Ok(Category::Vandalism),
            "OTHER" => Ok(Category::Other),
            other => Err(CoreError::validation(format!("unknown category: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Minor,
    #[default]
    Moderate,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Minor => "MINOR",
            Severity::Moderate => "MODERATE",
            Severity::Major => "MAJOR",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    Pending,
    Verified,
    Rejected,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Pending => "PENDING",
            IssueStatus::Verified => "VERIFIED",
            IssueStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(IssueStatus::Pending),
            "VERIFIED" => Ok(IssueStatus::Verified),
            "REJECTED" => Ok(IssueStatus::Rejected),
            other => Err(CoreError::validation(format!("unknown status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
}

impl GeoLocation {
    fn validate(&self) -> Result<()> {
        if let Some(lat) = self.latitude
            && !(-90.0..=90.0).contains(&lat)
        {
            return Err(CoreError::validation(format!("latitude out of range: {}", lat)));
        }
        if let Some(lon) = self.longitude
            && !(-180.0..=180.0).contains(&lon)
        {
            return Err(CoreError::validation(format!("longitude out of range: {}", lon)));
        }
        if self.latitude.is_some() != self.longitude.is_some() {
            return Err(CoreError::validation(
                "latitude and longitude must be provided together",
            ));
        }
        Ok(())
    }
}

/// Opinion returned by the image classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResult {
    pub verified: bool,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub predicted_label: String,
}

impl AiResult {
    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(CoreError::validation(format!(
                "AI confidence must be within [0, 1], got {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteDirection {
    Up,
    Down,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub up_count: u32,
    pub down_count: u32,
}

impl VoteTally {
    pub fn total(&self) -> u32 {
        self.up_count + self.down_count
    }

    pub fn net(&self) -> i64 {
        self.up_count as i64 - self.down_count as i64
    }

    /// `up / max(1, up + down)`
    pub fn ratio(&self) -> f64 {
        self.up_count as f64 / self.total().max(1) as f64
    }
}

/// Payload accepted by `submit`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IssueSubmission {
    pub title: String,
    pub description: String,
    pub category: Option<Category>,
    pub severity: Option<Severity>,
    pub location: Option<GeoLocation>,
    pub image_ref: Option<String>,
}

impl IssueSubmission {
    pub fn validate(&self) -> Result<Category> {
        if self.title.trim().is_empty() {
            return Err(CoreError::validation("title is required"));
        }
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(CoreError::validation(format!(
                "title exceeds {} characters",
                MAX_TITLE_LEN
            )));
        }
        if self.description.trim().is_empty() {
            return Err(CoreError::validation("description is required"));
        }
        if let Some(ref location) = self.location {
            location.validate()?;
        }
        self.category
            .ok_or_else(|| CoreError::validation("category is required"))
    }
}

/// Who caused a status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionActor {
    Aggregator { score: f64, basis: DecisionBasis },
    Admin {
        #[serde(rename = "adminId")]
        admin_id: UserId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub from: IssueStatus,
    pub to: IssueStatus,
    pub actor: TransitionActor,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub severity: Severity,
    pub location: Option<GeoLocation>,
    pub image_ref: Option<String>,
    pub reporter: UserId,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub ai_result: Option<AiResult>,
    #[serde(flatten)]
    pub tally: VoteTally,
    /// Active votes only; `NONE` removes the entry
    pub votes: BTreeMap<UserId, VoteDirection>,
    pub last_verdict: Option<Verdict>,
    pub history: Vec<StatusTransition>,
}

/// Result of applying one user's vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteChange {
    pub previous: VoteDirection,
    pub current: VoteDirection,
}

impl VoteChange {
    pub fn is_noop(&self) -> bool {
        self.previous == self.current
    }
}

impl Issue {
    pub fn new(
        id: IssueId,
        reporter: UserId,
        category: Category,
        submission: IssueSubmission,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            title: submission.title.trim().to_string(),
            description: submission.description.trim().to_string(),
            category,
            severity: submission.severity.unwrap_or_default(),
            location: submission.location,
            image_ref: submission.image_ref,
            reporter,
            status: IssueStatus::Pending,
            created_at,
            ai_result: None,
            tally: VoteTally::default(),
            votes: BTreeMap::new(),
            last_verdict: None,
            history: Vec::new(),
        }
    }

    pub fn vote_of(&self, user_id: &str) -> VoteDirection {
        self.votes.get(user_id).copied().unwrap_or(VoteDirection::None)
    }

    /// Replace the user's active vote, keeping the tally in step.
    pub fn apply_vote(&mut self, user_id: &str, direction: VoteDirection) -> VoteChange {
        let previous = self.vote_of(user_id);
        if previous == direction {
            return VoteChange { previous, current: direction };
        }

        match previous {
            VoteDirection::Up => self.tally.up_count -= 1,
            VoteDirection::Down => self.tally.down_count -= 1,
            VoteDirection::None => {}
        }
        match direction {
            VoteDirection::Up => self.tally.up_count += 1,
            VoteDirection::Down => self.tally.down_count += 1,
            VoteDirection::None => {}
        }

        if direction == VoteDirection::None {
            self.votes.remove(user_id);
        } else {
            self.votes.insert(user_id.to_string(), direction);
        }

        VoteChange { previous, current: direction }
    }

    /// Recount the vote record and compare it with the stored tally.
    pub fn check_tally(&self) -> Result<()> {
        let up = self.votes.values().filter(|v| **v == VoteDirection::Up).count() as u32;
        let down = self.votes.values().filter(|v| **v == VoteDirection::Down).count() as u32;
        if up != self.tally.up_count || down != self.tally.down_count {
            return Err(CoreError::InvariantViolation(format!(
                "issue {} tally {}/{} does not match active votes {}/{}",
                self.id, self.tally.up_count, self.tally.down_count, up, down
            )));
        }
        Ok(())
    }

    pub fn transition(&mut self, to: IssueStatus, actor: TransitionActor, at: DateTime<Utc>) {
        self.history.push(StatusTransition {
            from: self.status,
            to,
            actor,
            at,
        });
        self.status = to;
    }

    /// Basis of the latest transition into VERIFIED, if any
    pub fn verification_basis(&self) -> Option<DecisionBasis> {
        self.history
            .iter()
            .rev()
            .find(|t| t.to == IssueStatus::Verified)
            .map(|t| match &t.actor {
                TransitionActor::Aggregator { basis, .. } => *basis,
                TransitionActor::Admin { .. } => DecisionBasis::Admin,
            })
    }
}

/// Query used by `fetch`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IssueFilter {
    pub status: Option<IssueStatus>,
    pub category: Option<Category>,
    pub severity: Option<Severity>,
    pub reporter: Option<UserId>,
}

impl IssueFilter {
    pub fn matches(&self, issue: &Issue) -> bool {
        self.status.is_none_or(|s| issue.status == s)
            && self.category.is_none_or(|c| issue.category == c)
            && self.severity.is_none_or(|s| issue.severity == s)
            && self.reporter.as_ref().is_none_or(|r| &issue.reporter == r)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueStats {
    pub total: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    pub by_severity: BTreeMap<&'static str, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_issue() -> Issue {
        let submission = IssueSubmission {
            title: "Pothole on Main St".to_string(),
            description: "Deep pothole near the bus stop".to_string(),
            category: Some(Category::Pothole),
            ..Default::default()
        };
        Issue::new(1, "alice".to_string(), Category::Pothole, submission, Utc::now())
    }

    #[test]
    fn test_vote_change_and_retract() {
        let mut issue = sample_issue();
        issue.apply_vote("bob", VoteDirection::Up);
        issue.apply_vote("bob", VoteDirection::Up);
        assert_eq!(issue.tally, VoteTally { up_count: 1, down_count: 0 });

        issue.apply_vote("bob", VoteDirection::Down);
        assert_eq!(issue.tally, VoteTally { up_count: 0, down_count: 1 });

        let change = issue.apply_vote("bob", VoteDirection::None);
        assert_eq!(change.previous, VoteDirection::Down);
        assert_eq!(issue.tally.total(), 0);
        assert!(issue.votes.is_empty());
        assert!(issue.check_tally().is_ok());
    }

    #[test]
    fn test_tally_mismatch_detected() {
        let mut issue = sample_issue();
        issue.apply_vote("bob", VoteDirection::Up);
        issue.tally.up_count = 3;
        assert!(matches!(
            issue.check_tally(),
            Err(CoreError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_submission_validation() {
        let mut submission = IssueSubmission {
            title: "Broken light".to_string(),
            description: "Dark corner".to_string(),
            category: None,
            ..Default::default()
        };
        assert!(submission.validate().is_err());

        submission.category = Some(Category::Streetlight);
        assert_eq!(submission.validate().unwrap(), Category::Streetlight);

        submission.title = "   ".to_string();
        assert!(submission.validate().is_err());
    }

    #[test]
    fn test_location_ranges() {
        let submission = IssueSubmission {
            title: "Flooded underpass".to_string(),
            description: "Water up to the knees".to_string(),
            category: Some(Category::Flood),
            location: Some(GeoLocation {
                latitude: Some(95.0),
                longitude: Some(10.0),
                address: None,
            }),
            ..Default::default()
        };
        assert!(submission.validate().is_err());
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("pothole".parse::<Category>().unwrap(), Category::Pothole);
        assert!("volcano".parse::<Category>().is_err());
    }

    #[test]
    fn test_filter() {
        let issue = sample_issue();
        let filter = IssueFilter {
            status: Some(IssueStatus::Pending),
            reporter: Some("alice".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&issue));

        let filter = IssueFilter {
            category: Some(Category::Flood),
            ..Default::default()
        };
        assert!(!filter.matches(&issue));
    }
}
