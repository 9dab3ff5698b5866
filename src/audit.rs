//! Audit log for admin overrides and ledger anomalies
//!
//! Bounded in memory and mirrored to `tracing` at a level matching severity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::issues::models::{IssueId, IssueStatus, UserId};

/// Auditable events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    /// Forced transition. `applied` is false when the issue was already in `to`.
    AdminDecision {
        issue_id: IssueId,
        admin_id: UserId,
        from: IssueStatus,
        to: IssueStatus,
        applied: bool,
    },
    /// Admin call refused (not an admin, or lost a race)
    AdminDecisionDenied {
        issue_id: IssueId,
        actor: UserId,
        reason: String,
    },
    InvariantViolation {
        component: String,
        detail: String,
    },
    WithdrawalSettled {
        user_id: UserId,
        transaction_id: String,
        reference: String,
    },
    WithdrawalFailed {
        user_id: UserId,
        transaction_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    pub severity: AuditSeverity,
    pub metadata: BTreeMap<String, String>,
}

impl AuditEntry {
    pub fn new(event: AuditEventType, severity: AuditSeverity) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
            severity,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    fn involves(&self, user: &str) -> bool {
        match &self.event {
            AuditEventType::AdminDecision { admin_id, .. } => admin_id == user,
            AuditEventType::AdminDecisionDenied { actor, .. } => actor == user,
            AuditEventType::WithdrawalSettled { user_id, .. }
            | AuditEventType::WithdrawalFailed { user_id, .. } => user_id == user,
            AuditEventType::InvariantViolation { .. } => false,
        }
    }
}

pub struct AuditLogger {
    entries: Arc<RwLock<VecDeque<AuditEntry>>>,
    max_entries: usize,
    min_severity: AuditSeverity,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl AuditLogger {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            max_entries: max_entries.max(1),
            min_severity: AuditSeverity::Info,
        }
    }

    pub fn with_min_severity(mut self, severity: AuditSeverity) -> Self {
        self.min_severity = severity;
        self
    }

    pub async fn log(&self, entry: AuditEntry) {
        if entry.severity < self.min_severity {
            return;
        }

        match entry.severity {
            AuditSeverity::Debug => tracing::debug!(event = ?entry.event, "AUDIT"),
            AuditSeverity::Info => tracing::info!(event = ?entry.event, "AUDIT"),
            AuditSeverity::Warning => tracing::warn!(event = ?entry.event, "AUDIT"),
            AuditSeverity::Error => tracing::error!(event = ?entry.event, "AUDIT"),
            AuditSeverity::Critical => tracing::error!(event = ?entry.event, "AUDIT CRITICAL"),
        }

        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub async fn log_admin_decision(
        &self,
        issue_id: IssueId,
        admin_id: &str,
        from: IssueStatus,
        to: IssueStatus,
        applied: bool,
    ) {
        let entry = AuditEntry::new(
            AuditEventType::AdminDecision {
                issue_id,
                admin_id: admin_id.to_string(),
                from,
                to,
                applied,
            },
            AuditSeverity::Info,
        );
        self.log(entry).await;
    }

    pub async fn log_admin_denied(&self, issue_id: IssueId, actor: &str, reason: &str) {
        let entry = AuditEntry::new(
            AuditEventType::AdminDecisionDenied {
                issue_id,
                actor: actor.to_string(),
                reason: reason.to_string(),
            },
            AuditSeverity::Warning,
        );
        self.log(entry).await;
    }

    pub async fn log_invariant_violation(&self, component: &str, detail: &str) {
        let entry = AuditEntry::new(
            AuditEventType::InvariantViolation {
                component: component.to_string(),
                detail: detail.to_string(),
            },
            AuditSeverity::Critical,
        );
        self.log(entry).await;
    }

    pub async fn log_withdrawal_settled(&self, user_id: &str, transaction_id: &str, reference: &str) {
        let entry = AuditEntry::new(
            AuditEventType::WithdrawalSettled {
                user_id: user_id.to_string(),
                transaction_id: transaction_id.to_string(),
                reference: reference.to_string(),
            },
            AuditSeverity::Info,
        );
        self.log(entry).await;
    }

    pub async fn log_withdrawal_failed(&self, user_id: &str, transaction_id: &str, reason: &str) {
        let entry = AuditEntry::new(
            AuditEventType::WithdrawalFailed {
                user_id: user_id.to_string(),
                transaction_id: transaction_id.to_string(),
                reason: reason.to_string(),
            },
            AuditSeverity::Warning,
        );
        self.log(entry).await;
    }

    /// Newest first
    pub async fn get_recent(&self, count: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().rev().take(count).cloned().collect()
    }

    pub async fn get_by_severity(&self, min_severity: AuditSeverity) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.severity >= min_severity)
            .cloned()
            .collect()
    }

    pub async fn get_for_user(&self, user: &str) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().filter(|e| e.involves(user)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded() {
        let logger = AuditLogger::new(2);
        for issue_id in 1..=3 {
            logger
                .log_admin_decision(issue_id, "root", IssueStatus::Pending, IssueStatus::Verified, true)
                .await;
        }
        let recent = logger.get_recent(10).await;
        assert_eq!(recent.len(), 2);
        assert!(matches!(
            recent[0].event,
            AuditEventType::AdminDecision { issue_id: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_filters() {
        let logger = AuditLogger::default();
        logger.log_admin_denied(1, "mallory", "not an admin").await;
        logger.log_invariant_violation("ledger", "balance mismatch").await;

        assert_eq!(logger.get_for_user("mallory").await.len(), 1);
        let critical = logger.get_by_severity(AuditSeverity::Critical).await;
        assert_eq!(critical.len(), 1);
    }

    #[tokio::test]
    async fn test_min_severity() {
        let logger = AuditLogger::default().with_min_severity(AuditSeverity::Warning);
        logger
            .log_admin_decision(1, "root", IssueStatus::Pending, IssueStatus::Rejected, true)
            .await;
        assert!(logger.get_recent(10).await.is_empty());
    }
}
