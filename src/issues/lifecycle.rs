//! Issue Lifecycle Manager
//!
//! Owns issues and their votes. Every change to one issue runs under that
//! issue's lock and follows the same shape: copy the issue, apply the change,
//! plan the XP awards it triggers, persist both, commit the awards, then
//! publish the new issue. A failure at any step leaves the issue and the
//! reputation engine untouched.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::database::DatabasePool;
use crate::error::{CoreError, Result};
use crate::external::{Classifier, ImageUpload, RetryConfig, call_with_retry};
use crate::issues::aggregator::{self, AggregatorPolicy, DecisionBasis, Recommendation};
use crate::issues::models::{
    AiResult, Issue, IssueFilter, IssueId, IssueStats, IssueStatus, IssueSubmission,
    TransitionActor, VoteDirection,
};
use crate::reputation::{ReputationEngine, ReputationEvent, ReputationEventKind, Role};

/// Outcome an admin forces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminDecision {
    Verify,
    Reject,
}

impl AdminDecision {
    pub fn target(&self) -> IssueStatus {
        match self {
            AdminDecision::Verify => IssueStatus::Verified,
            AdminDecision::Reject => IssueStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub policy: AggregatorPolicy,
    pub classifier_timeout: Duration,
    pub classifier_retry: RetryConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            policy: AggregatorPolicy::default(),
            classifier_timeout: Duration::from_secs(15),
            classifier_retry: RetryConfig::default(),
        }
    }
}

pub struct IssueLifecycle {
    issues: DashMap<IssueId, Arc<Mutex<Issue>>>,
    next_id: AtomicU64,
    reputation: Arc<ReputationEngine>,
    audit: Arc<AuditLogger>,
    classifier: Option<Arc<dyn Classifier>>,
    db: Option<Arc<DatabasePool>>,
    config: LifecycleConfig,
}

impl IssueLifecycle {
    pub fn new(reputation: Arc<ReputationEngine>, audit: Arc<AuditLogger>, config: LifecycleConfig) -> Self {
        Self {
            issues: DashMap::new(),
            next_id: AtomicU64::new(1),
            reputation,
            audit,
            classifier: None,
            db: None,
            config,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_database(mut self, db: Arc<DatabasePool>) -> Self {
        self.db = Some(db);
        self
    }

    /// `None` when no classifier is configured
    pub async fn classifier_healthy(&self) -> Option<bool> {
        match self.classifier {
            Some(ref classifier) => Some(classifier.is_healthy().await),
            None => None,
        }
    }

    /// Load issues from storage and continue numbering after the highest id
    pub fn restore(&self, issues: Vec<Issue>) {
        let count = issues.len();
        let mut max_id = 0;
        for issue in issues {
            max_id = max_id.max(issue.id);
            self.issues.insert(issue.id, Arc::new(Mutex::new(issue)));
        }
        self.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
        info!(issues = count, next_id = max_id + 1, "Restored issues");
    }

    /// Create a PENDING issue and award the reporter for submitting it
    pub async fn submit(&self, reporter: &str, submission: IssueSubmission) -> Result<Issue> {
        let category = submission.validate()?;
        self.reputation.role_of(reporter).await?;

        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let issue = Issue::new(id, reporter.to_string(), category, submission, now);

        let events = [ReputationEvent {
            user_id: reporter.to_string(),
            issue_id: id,
            kind: ReputationEventKind::IssueSubmitted,
        }];
        let awards = self.reputation.plan(&events, now).await?;
        if let Some(ref db) = self.db {
            db.persist_issue_change(&issue, &awards)
                .await
                .map_err(CoreError::Storage)?;
        }
        self.reputation.commit(awards).await?;
        self.issues.insert(id, Arc::new(Mutex::new(issue.clone())));

        info!(
            issue_id = id,
            reporter = %reporter,
            category = %category,
            "Issue submitted"
        );
        Ok(issue)
    }

    /// Set, change or retract (`NONE`) a user's vote
    pub async fn record_vote(&self, issue_id: IssueId, user_id: &str, direction: VoteDirection) -> Result<Issue> {
        let handle = self.handle(issue_id)?;
        self.reputation.role_of(user_id).await?;

        let mut current = handle.lock().await;
        if current.reporter == user_id {
            return Err(CoreError::validation("reporters cannot vote on their own issue"));
        }
        self.check_tally(&current).await?;

        let mut next = current.clone();
        let was_verified = next.status == IssueStatus::Verified;
        let change = next.apply_vote(user_id, direction);
        if change.is_noop() {
            return Ok(current.clone());
        }
        self.check_tally(&next).await?;

        let now = Utc::now();
        let mut events = Vec::new();
        if next.status == IssueStatus::Pending {
            self.evaluate(&mut next, now, &mut events);
        } else if was_verified && change.current == VoteDirection::Up && next.tally.net() > 0 {
            events.push(ReputationEvent {
                user_id: next.reporter.clone(),
                issue_id,
                kind: ReputationEventKind::UpvoteReceived {
                    voter: user_id.to_string(),
                },
            });
        }

        debug!(
            issue_id = issue_id,
            user_id = %user_id,
            previous = ?change.previous,
            current = ?change.current,
            up = next.tally.up_count,
            down = next.tally.down_count,
            "Vote recorded"
        );
        self.commit_change(&mut current, next, &events, now).await
    }

    /// Attach the classifier's opinion. Set once; an identical replay is a
    /// no-op and a different payload is a conflict.
    pub async fn attach_ai_result(&self, issue_id: IssueId, result: AiResult) -> Result<Issue> {
        result.validate()?;
        let handle = self.handle(issue_id)?;
        let mut current = handle.lock().await;

        if let Some(ref existing) = current.ai_result {
            if *existing == result {
                return Ok(current.clone());
            }
            return Err(CoreError::Conflict(format!(
                "issue {} already has an AI result",
                issue_id
            )));
        }

        let mut next = current.clone();
        next.ai_result = Some(result);

        let now = Utc::now();
        let mut events = Vec::new();
        if next.status == IssueStatus::Pending {
            self.evaluate(&mut next, now, &mut events);
        }
        self.commit_change(&mut current, next, &events, now).await
    }

    /// Ask the classifier about `image` and attach its answer. When the
    /// classifier is missing or fails the issue is returned unchanged.
    pub async fn classify(&self, issue_id: IssueId, image: ImageUpload) -> Result<Issue> {
        let snapshot = self.get(issue_id).await?;
        if snapshot.ai_result.is_some() {
            return Ok(snapshot);
        }
        let Some(ref classifier) = self.classifier else {
            warn!(issue_id = issue_id, "No classifier configured, issue proceeds without AI result");
            return Ok(snapshot);
        };

        let outcome = call_with_retry(
            "classifier",
            &self.config.classifier_retry,
            self.config.classifier_timeout,
            || classifier.classify(&image, snapshot.category),
        )
        .await;

        match outcome {
            Ok(result) => self.attach_ai_result(issue_id, result).await,
            Err(e) => {
                warn!(
                    issue_id = issue_id,
                    error = %e,
                    "Classifier unavailable, issue proceeds without AI result"
                );
                Ok(snapshot)
            }
        }
    }

    /// Forced transition by an admin. Re-entering the current state is a
    /// no-op. Every call is audit-logged.
    pub async fn admin_decide(
        &self,
        issue_id: IssueId,
        decision: AdminDecision,
        admin_id: &str,
        expected_status: Option<IssueStatus>,
    ) -> Result<Issue> {
        let handle = self.handle(issue_id)?;
        let role = self.reputation.role_of(admin_id).await?;
        if role != Role::Admin {
            self.audit
                .log_admin_denied(issue_id, admin_id, "caller is not an admin")
                .await;
            return Err(CoreError::Forbidden(format!(
                "user {} is not an admin",
                admin_id
            )));
        }

        let mut current = handle.lock().await;
        if let Some(expected) = expected_status
            && expected != current.status
        {
            let reason = format!(
                "expected status {} but issue is {}",
                expected, current.status
            );
            self.audit.log_admin_denied(issue_id, admin_id, &reason).await;
            return Err(CoreError::Conflict(reason));
        }

        let from = current.status;
        let to = decision.target();
        if from == to {
            self.audit
                .log_admin_decision(issue_id, admin_id, from, to, false)
                .await;
            return Ok(current.clone());
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.transition(
            to,
            TransitionActor::Admin {
                admin_id: admin_id.to_string(),
            },
            now,
        );
        let kind = match to {
            IssueStatus::Verified => ReputationEventKind::IssueVerified {
                basis: DecisionBasis::Admin,
            },
            _ => ReputationEventKind::IssueRejected,
        };
        let events = [ReputationEvent {
            user_id: next.reporter.clone(),
            issue_id,
            kind,
        }];

        let issue = self.commit_change(&mut current, next, &events, now).await?;
        self.audit
            .log_admin_decision(issue_id, admin_id, from, to, true)
            .await;
        info!(
            issue_id = issue_id,
            admin_id = %admin_id,
            from = %from,
            to = %to,
            "Admin override applied"
        );
        Ok(issue)
    }

    pub async fn get(&self, issue_id: IssueId) -> Result<Issue> {
        let handle = self.handle(issue_id)?;
        let issue = handle.lock().await;
        Ok(issue.clone())
    }

    /// Matching issues, newest first
    pub async fn fetch(&self, filter: &IssueFilter) -> Vec<Issue> {
        let mut issues = Vec::new();
        for handle in self.handles() {
            let issue = handle.lock().await;
            if filter.matches(&issue) {
                issues.push(issue.clone());
            }
        }
        issues.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        issues
    }

    pub async fn stats(&self) -> IssueStats {
        let mut stats = IssueStats::default();
        for handle in self.handles() {
            let issue = handle.lock().await;
            stats.total += 1;
            *stats.by_status.entry(issue.status.as_str()).or_default() += 1;
            *stats.by_severity.entry(issue.severity.as_str()).or_default() += 1;
        }
        stats
    }

    fn handle(&self, issue_id: IssueId) -> Result<Arc<Mutex<Issue>>> {
        self.issues
            .get(&issue_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::not_found("issue", issue_id))
    }

    fn handles(&self) -> Vec<Arc<Mutex<Issue>>> {
        self.issues.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn check_tally(&self, issue: &Issue) -> Result<()> {
        if let Err(e) = issue.check_tally() {
            if let CoreError::InvariantViolation(ref detail) = e {
                self.audit.log_invariant_violation("issues", detail).await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Run the aggregator on a PENDING issue and apply its recommendation
    fn evaluate(&self, issue: &mut Issue, now: DateTime<Utc>, events: &mut Vec<ReputationEvent>) {
        let verdict = aggregator::evaluate(issue.ai_result.as_ref(), &issue.tally, &self.config.policy);
        issue.last_verdict = Some(verdict);

        let (to, kind) = match (verdict.recommendation, verdict.basis) {
            (Recommendation::Verify, Some(basis)) => {
                (IssueStatus::Verified, ReputationEventKind::IssueVerified { basis })
            }
            (Recommendation::Reject, Some(_)) => (IssueStatus::Rejected, ReputationEventKind::IssueRejected),
            _ => {
                debug!(issue_id = issue.id, score = verdict.score, "Issue undecided");
                return;
            }
        };

        let basis = verdict.basis.unwrap_or(DecisionBasis::Community);
        issue.transition(
            to,
            TransitionActor::Aggregator {
                score: verdict.score,
                basis,
            },
            now,
        );
        events.push(ReputationEvent {
            user_id: issue.reporter.clone(),
            issue_id: issue.id,
            kind,
        });
        info!(
            issue_id = issue.id,
            score = verdict.score,
            basis = ?basis,
            status = %to,
            "Aggregator decided issue"
        );
    }

    /// Plan awards, persist, commit awards, then publish `next`
    async fn commit_change(
        &self,
        current: &mut Issue,
        next: Issue,
        events: &[ReputationEvent],
        now: DateTime<Utc>,
    ) -> Result<Issue> {
        let awards = self.reputation.plan(events, now).await?;
        if let Some(ref db) = self.db {
            db.persist_issue_change(&next, &awards)
                .await
                .map_err(CoreError::Storage)?;
        }
        self.reputation.commit(awards).await?;
        *current = next;
        Ok(current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ExternalError;
    use crate::issues::models::Category;
    use async_trait::async_trait;

    struct FixedClassifier(std::result::Result<AiResult, ExternalError>);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _image: &ImageUpload, _category: Category) -> std::result::Result<AiResult, ExternalError> {
            self.0.clone()
        }
    }

    async fn setup() -> (IssueLifecycle, Arc<ReputationEngine>, Arc<AuditLogger>) {
        let engine = Arc::new(ReputationEngine::default());
        for user in ["alice", "v1", "v2", "v3", "v4", "v5", "v6"] {
            engine.register_user(user, Role::User).await.unwrap();
        }
        engine.register_user("root", Role::Admin).await.unwrap();
        let audit = Arc::new(AuditLogger::default());
        let lifecycle = IssueLifecycle::new(engine.clone(), audit.clone(), LifecycleConfig::default());
        (lifecycle, engine, audit)
    }

    fn pothole() -> IssueSubmission {
        IssueSubmission {
            title: "Pothole on Main St".to_string(),
            description: "Deep pothole near the bus stop".to_string(),
            category: Some(Category::Pothole),
            ..Default::default()
        }
    }

    fn ai(verified: bool, confidence: f64) -> AiResult {
        AiResult {
            verified,
            confidence,
            predicted_label: "pothole".to_string(),
        }
    }

    fn image() -> ImageUpload {
        ImageUpload {
            file_name: "hole.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            bytes: vec![0xff, 0xd8, 0xff],
        }
    }

    #[tokio::test]
    async fn test_submit_awards_reporter() {
        let (lifecycle, engine, _) = setup().await;
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();
        assert_eq!(issue.status, IssueStatus::Pending);
        assert_eq!(engine.earned_points("alice").await.unwrap(), 10);

        assert!(matches!(
            lifecycle.submit("ghost", pothole()).await,
            Err(CoreError::NotFound { .. })
        ));
        let blank = IssueSubmission {
            title: String::new(),
            ..pothole()
        };
        assert!(matches!(
            lifecycle.submit("alice", blank).await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_votes_then_ai_verify() {
        let (lifecycle, engine, _) = setup().await;
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();

        for voter in ["v1", "v2", "v3", "v4", "v5", "v6"] {
            let updated = lifecycle.record_vote(issue.id, voter, VoteDirection::Up).await.unwrap();
            assert_eq!(updated.status, IssueStatus::Pending);
        }
        let pending = lifecycle.get(issue.id).await.unwrap();
        let verdict = pending.last_verdict.unwrap();
        assert!((verdict.score - 0.4).abs() < 1e-9);

        let verified = lifecycle.attach_ai_result(issue.id, ai(true, 0.95)).await.unwrap();
        assert_eq!(verified.status, IssueStatus::Verified);
        assert_eq!(verified.verification_basis(), Some(DecisionBasis::Community));

        let rep = engine.get_reputation("alice").await.unwrap();
        assert_eq!(rep.xp, 35);
        assert_eq!(rep.level, 1);
    }

    #[tokio::test]
    async fn test_reporter_cannot_self_vote() {
        let (lifecycle, _, _) = setup().await;
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();
        assert!(matches!(
            lifecycle.record_vote(issue.id, "alice", VoteDirection::Up).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            lifecycle.record_vote(999, "v1", VoteDirection::Up).await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_ai_result_set_once() {
        let (lifecycle, _, _) = setup().await;
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();

        lifecycle.attach_ai_result(issue.id, ai(true, 0.5)).await.unwrap();
        let replay = lifecycle.attach_ai_result(issue.id, ai(true, 0.5)).await.unwrap();
        assert_eq!(replay.history.len(), 0);
        assert!(matches!(
            lifecycle.attach_ai_result(issue.id, ai(false, 0.5)).await,
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            lifecycle.attach_ai_result(issue.id, ai(true, 1.5)).await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_fast_path_awards_less() {
        let (lifecycle, engine, _) = setup().await;
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();
        let verified = lifecycle.attach_ai_result(issue.id, ai(true, 0.93)).await.unwrap();
        assert_eq!(verified.status, IssueStatus::Verified);
        assert_eq!(verified.verification_basis(), Some(DecisionBasis::AiFastPath));
        assert_eq!(engine.earned_points("alice").await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_confident_classifier_does_not_override_votes() {
        let (lifecycle, engine, _) = setup().await;
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();
        for voter in ["v1", "v2", "v3", "v4", "v5"] {
            lifecycle.record_vote(issue.id, voter, VoteDirection::Up).await.unwrap();
        }

        let after = lifecycle.attach_ai_result(issue.id, ai(false, 0.95)).await.unwrap();
        assert_eq!(after.status, IssueStatus::Pending);
        assert!(after.history.is_empty());

        let rep = engine.get_reputation("alice").await.unwrap();
        assert_eq!(rep.xp, 10);
        assert_eq!(rep.rejected_count, 0);
    }

    #[tokio::test]
    async fn test_blended_score_verifies_before_min_votes() {
        let (lifecycle, engine, _) = setup().await;
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();
        lifecycle.record_vote(issue.id, "v1", VoteDirection::Up).await.unwrap();
        lifecycle.record_vote(issue.id, "v2", VoteDirection::Up).await.unwrap();

        let verified = lifecycle.attach_ai_result(issue.id, ai(true, 0.85)).await.unwrap();
        assert_eq!(verified.status, IssueStatus::Verified);
        assert_eq!(verified.verification_basis(), Some(DecisionBasis::Community));
        assert_eq!(engine.earned_points("alice").await.unwrap(), 35);
    }

    #[tokio::test]
    async fn test_upvote_bonus_after_verification() {
        let (lifecycle, engine, _) = setup().await;
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();
        lifecycle.attach_ai_result(issue.id, ai(true, 0.93)).await.unwrap();

        lifecycle.record_vote(issue.id, "v1", VoteDirection::Up).await.unwrap();
        lifecycle.record_vote(issue.id, "v1", VoteDirection::None).await.unwrap();
        lifecycle.record_vote(issue.id, "v1", VoteDirection::Up).await.unwrap();
        lifecycle.record_vote(issue.id, "v2", VoteDirection::Down).await.unwrap();
        assert_eq!(engine.earned_points("alice").await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_admin_override() {
        let (lifecycle, engine, audit) = setup().await;
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();

        assert!(matches!(
            lifecycle.admin_decide(issue.id, AdminDecision::Verify, "v1", None).await,
            Err(CoreError::Forbidden(_))
        ));

        let verified = lifecycle
            .admin_decide(issue.id, AdminDecision::Verify, "root", Some(IssueStatus::Pending))
            .await
            .unwrap();
        assert_eq!(verified.status, IssueStatus::Verified);

        // same state again: no-op
        lifecycle.admin_decide(issue.id, AdminDecision::Verify, "root", None).await.unwrap();
        assert!(matches!(
            lifecycle
                .admin_decide(issue.id, AdminDecision::Reject, "root", Some(IssueStatus::Pending))
                .await,
            Err(CoreError::Conflict(_))
        ));

        let rejected = lifecycle.admin_decide(issue.id, AdminDecision::Reject, "root", None).await.unwrap();
        assert_eq!(rejected.status, IssueStatus::Rejected);
        lifecycle.admin_decide(issue.id, AdminDecision::Verify, "root", None).await.unwrap();

        let rep = engine.get_reputation("alice").await.unwrap();
        assert_eq!(rep.xp, 35);
        assert_eq!(rep.verified_count, 1);
        assert_eq!(rep.rejected_count, 1);

        assert_eq!(audit.get_for_user("root").await.len(), 5);
        assert_eq!(audit.get_for_user("v1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_classify_degrades_gracefully() {
        let (lifecycle, _, _) = setup().await;
        let lifecycle = lifecycle.with_classifier(Arc::new(FixedClassifier(Err(ExternalError::Rejected(
            "unsupported image".to_string(),
        )))));
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();

        let after = lifecycle.classify(issue.id, image()).await.unwrap();
        assert!(after.ai_result.is_none());
        assert_eq!(after.status, IssueStatus::Pending);
    }

    #[tokio::test]
    async fn test_classify_attaches_result() {
        let (lifecycle, _, _) = setup().await;
        let lifecycle = lifecycle.with_classifier(Arc::new(FixedClassifier(Ok(ai(true, 0.97)))));
        let issue = lifecycle.submit("alice", pothole()).await.unwrap();

        let after = lifecycle.classify(issue.id, image()).await.unwrap();
        assert_eq!(after.ai_result, Some(ai(true, 0.97)));
        assert_eq!(after.status, IssueStatus::Verified);
    }

    #[tokio::test]
    async fn test_fetch_and_stats() {
        let (lifecycle, _, _) = setup().await;
        let first = lifecycle.submit("alice", pothole()).await.unwrap();
        let second = lifecycle.submit("alice", pothole()).await.unwrap();
        lifecycle.attach_ai_result(second.id, ai(false, 0.95)).await.unwrap();

        let all = lifecycle.fetch(&IssueFilter::default()).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);

        let pending = lifecycle
            .fetch(&IssueFilter {
                status: Some(IssueStatus::Pending),
                ..Default::default()
            })
            .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);

        let stats = lifecycle.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status.get("REJECTED"), Some(&1));
        assert_eq!(stats.by_severity.get("MODERATE"), Some(&2));
    }
}
