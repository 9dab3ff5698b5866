//! Reputation Engine
//!
//! Turns lifecycle events into XP awards and derives levels from cumulative
//! XP. Lifecycle events are the only writers. Awarding is split into `plan`
//! (validation and idempotency, no mutation) and `commit` so that callers can
//! apply XP in the same unit of work as the issue change that caused it.

use crate::error::{CoreError, Result};
use crate::issues::models::{IssueId, UserId};
use crate::reputation::{
    AwardKind, LevelCurve, ReputationEvent, ReputationRecord, ReputationView, Role, XpAward,
    XpSchedule,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Default)]
struct ReputationState {
    users: HashMap<UserId, ReputationRecord>,
    /// Every `(issue, kind)` that has already been awarded
    awarded: HashSet<(IssueId, AwardKind)>,
    /// Bumped on every commit that changed XP or counts
    generation: u64,
}

/// Consistent copy of all reputation records
#[derive(Debug, Clone)]
pub struct ReputationSnapshot {
    pub generation: u64,
    pub records: Vec<ReputationRecord>,
}

pub struct ReputationEngine {
    schedule: XpSchedule,
    curve: LevelCurve,
    state: Arc<RwLock<ReputationState>>,
}

impl ReputationEngine {
    pub fn new(schedule: XpSchedule, curve: LevelCurve) -> Self {
        Self {
            schedule,
            curve,
            state: Arc::new(RwLock::new(ReputationState::default())),
        }
    }

    /// Register a user, or update the role of a known one.
    ///
    /// Returns true when the stored record changed.
    pub async fn register_user(&self, user_id: &str, role: Role) -> Result<bool> {
        if user_id.trim().is_empty() {
            return Err(CoreError::validation("user id is required"));
        }

        let mut state = self.state.write().await;
        match state.users.get_mut(user_id) {
            Some(record) if record.role == role => Ok(false),
            Some(record) => {
                info!(user_id = %user_id, role = role.as_str(), "Updated user role");
                record.role = role;
                Ok(true)
            }
            None => {
                state
                    .users
                    .insert(user_id.to_string(), ReputationRecord::new(user_id.to_string(), role));
                debug!(user_id = %user_id, role = role.as_str(), "Registered user");
                Ok(true)
            }
        }
    }

    /// Fails with `NotFound` for unknown users
    pub async fn role_of(&self, user_id: &str) -> Result<Role> {
        let state = self.state.read().await;
        state
            .users
            .get(user_id)
            .map(|r| r.role)
            .ok_or_else(|| CoreError::not_found("user", user_id))
    }

    pub async fn get_reputation(&self, user_id: &str) -> Result<ReputationView> {
        let state = self.state.read().await;
        state
            .users
            .get(user_id)
            .map(|r| ReputationView::from_record(r, &self.curve))
            .ok_or_else(|| CoreError::not_found("user", user_id))
    }

    /// Cumulative XP. This is the only figure the token ledger trusts.
    pub async fn earned_points(&self, user_id: &str) -> Result<u64> {
        let state = self.state.read().await;
        state
            .users
            .get(user_id)
            .map(|r| r.xp)
            .ok_or_else(|| CoreError::not_found("user", user_id))
    }

    pub fn level_for(&self, xp: u64) -> u32 {
        self.curve.level(xp)
    }

    /// Compute the awards `events` would produce without applying them.
    ///
    /// Events already awarded, or repeated within `events`, yield nothing.
    pub async fn plan(&self, events: &[ReputationEvent], at: DateTime<Utc>) -> Result<Vec<XpAward>> {
        let state = self.state.read().await;
        let mut seen: HashSet<(IssueId, AwardKind)> = HashSet::new();
        let mut awards = Vec::with_capacity(events.len());

        for event in events {
            if !state.users.contains_key(&event.user_id) {
                return Err(CoreError::not_found("user", &event.user_id));
            }

            let (kind, xp) = self.schedule.award_for(&event.kind);
            let key = (event.issue_id, kind.clone());
            if state.awarded.contains(&key) || !seen.insert(key) {
                debug!(
                    user_id = %event.user_id,
                    issue_id = event.issue_id,
                    kind = %kind,
                    "Award already granted, skipping"
                );
                continue;
            }

            awards.push(XpAward {
                user_id: event.user_id.clone(),
                issue_id: event.issue_id,
                kind,
                xp,
                awarded_at: at,
            });
        }

        Ok(awards)
    }

    /// Apply planned awards. Awards granted since planning are skipped.
    pub async fn commit(&self, awards: Vec<XpAward>) -> Result<()> {
        if awards.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().await;
        let mut changed = false;

        for award in awards {
            let key = (award.issue_id, award.kind.clone());
            if state.awarded.contains(&key) {
                continue;
            }
            let record = state.users.get_mut(&award.user_id).ok_or_else(|| {
                CoreError::InvariantViolation(format!(
                    "award for issue {} targets unregistered user {}",
                    award.issue_id, award.user_id
                ))
            })?;

            info!(
                user_id = %award.user_id,
                issue_id = award.issue_id,
                kind = %award.kind,
                xp = award.xp,
                "Awarded XP"
            );
            record.apply_award(award);
            state.awarded.insert(key);
            changed = true;
        }

        if changed {
            state.generation += 1;
        }
        Ok(())
    }

    /// `plan` followed by `commit`
    pub async fn apply(&self, events: &[ReputationEvent], at: DateTime<Utc>) -> Result<Vec<XpAward>> {
        let awards = self.plan(events, at).await?;
        self.commit(awards.clone()).await?;
        Ok(awards)
    }

    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    pub async fn snapshot(&self) -> ReputationSnapshot {
        let state = self.state.read().await;
        ReputationSnapshot {
            generation: state.generation,
            records: state.users.values().cloned().collect(),
        }
    }

    /// Replace state with records loaded from storage
    pub async fn restore(&self, records: Vec<ReputationRecord>) {
        let mut state = self.state.write().await;
        state.users.clear();
        state.awarded.clear();
        for record in records {
            for award in &record.awards {
                state.awarded.insert((award.issue_id, award.kind.clone()));
            }
            state.users.insert(record.user_id.clone(), record);
        }
        state.generation += 1;
        info!(users = state.users.len(), "Restored reputation state");
    }
}

impl Default for ReputationEngine {
    fn default() -> Self {
        Self::new(XpSchedule::default(), LevelCurve::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::aggregator::DecisionBasis;
    use crate::reputation::ReputationEventKind;

    fn event(user: &str, issue: IssueId, kind: ReputationEventKind) -> ReputationEvent {
        ReputationEvent {
            user_id: user.to_string(),
            issue_id: issue,
            kind,
        }
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let engine = ReputationEngine::default();
        let result = engine
            .plan(&[event("ghost", 1, ReputationEventKind::IssueSubmitted)], Utc::now())
            .await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
        assert!(engine.get_reputation("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_award_once_per_issue_and_kind() {
        let engine = ReputationEngine::default();
        engine.register_user("alice", Role::User).await.unwrap();

        let submitted = event("alice", 1, ReputationEventKind::IssueSubmitted);
        engine.apply(&[submitted.clone()], Utc::now()).await.unwrap();
        engine.apply(&[submitted.clone(), submitted], Utc::now()).await.unwrap();

        let verified = event(
            "alice",
            1,
            ReputationEventKind::IssueVerified {
                basis: DecisionBasis::Community,
            },
        );
        engine.apply(&[verified.clone()], Utc::now()).await.unwrap();
        engine.apply(&[verified], Utc::now()).await.unwrap();

        let view = engine.get_reputation("alice").await.unwrap();
        assert_eq!(view.xp, 35);
        assert_eq!(view.level, 1);
        assert_eq!(view.submitted_count, 1);
        assert_eq!(view.verified_count, 1);
    }

    #[tokio::test]
    async fn test_plan_does_not_mutate() {
        let engine = ReputationEngine::default();
        engine.register_user("alice", Role::User).await.unwrap();
        let before = engine.generation().await;

        let awards = engine
            .plan(&[event("alice", 4, ReputationEventKind::IssueSubmitted)], Utc::now())
            .await
            .unwrap();
        assert_eq!(awards.len(), 1);
        assert_eq!(engine.earned_points("alice").await.unwrap(), 0);
        assert_eq!(engine.generation().await, before);

        engine.commit(awards).await.unwrap();
        assert_eq!(engine.earned_points("alice").await.unwrap(), 10);
        assert!(engine.generation().await > before);
    }

    #[tokio::test]
    async fn test_upvotes_once_per_voter() {
        let engine = ReputationEngine::default();
        engine.register_user("alice", Role::User).await.unwrap();
        let upvote = |voter: &str| {
            event(
                "alice",
                9,
                ReputationEventKind::UpvoteReceived {
                    voter: voter.to_string(),
                },
            )
        };

        engine.apply(&[upvote("bob"), upvote("carol")], Utc::now()).await.unwrap();
        engine.apply(&[upvote("bob")], Utc::now()).await.unwrap();
        assert_eq!(engine.earned_points("alice").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_register_role_change() {
        let engine = ReputationEngine::default();
        assert!(engine.register_user("root", Role::User).await.unwrap());
        assert!(!engine.register_user("root", Role::User).await.unwrap());
        assert!(engine.register_user("root", Role::Admin).await.unwrap());
        assert_eq!(engine.role_of("root").await.unwrap(), Role::Admin);
        assert!(engine.register_user("  ", Role::User).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_keeps_idempotency() {
        let engine = ReputationEngine::default();
        engine.register_user("alice", Role::User).await.unwrap();
        engine
            .apply(&[event("alice", 1, ReputationEventKind::IssueSubmitted)], Utc::now())
            .await
            .unwrap();

        let records = engine.snapshot().await.records;
        let restored = ReputationEngine::default();
        restored.restore(records).await;

        restored
            .apply(&[event("alice", 1, ReputationEventKind::IssueSubmitted)], Utc::now())
            .await
            .unwrap();
        assert_eq!(restored.earned_points("alice").await.unwrap(), 10);
    }
}
