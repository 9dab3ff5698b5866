//! Reputation Repository - Database operations for the reputation system
//!
//! Users and their XP awards. XP and counters are not stored; they are
//! replayed from the award rows on load.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::reputation::{AwardKind, ReputationRecord, Role, XpAward};

pub struct ReputationRepository {
    pool: PgPool,
}

impl ReputationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize reputation schema and tables
    pub async fn init_schema(&self) -> Result<(), String> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS reputation")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create reputation schema: {}", e))?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS reputation.users (
                user_id VARCHAR(255) PRIMARY KEY,
                role VARCHAR(20) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create users table: {}", e))?;

        // One row per (issue, award kind) keeps awards idempotent
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS reputation.awards (
                issue_id BIGINT NOT NULL,
                kind_key VARCHAR(300) NOT NULL,
                user_id VARCHAR(255) NOT NULL REFERENCES reputation.users(user_id),
                xp BIGINT NOT NULL,
                awarded_at TIMESTAMP WITH TIME ZONE NOT NULL,
                PRIMARY KEY (issue_id, kind_key)
            )
        "#)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create awards table: {}", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_awards_user ON reputation.awards(user_id, awarded_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create awards index: {}", e))?;

        info!("Reputation schema initialized");
        Ok(())
    }

    pub async fn upsert_user(&self, user_id: &str, role: Role, created_at: DateTime<Utc>) -> Result<(), String> {
        sqlx::query(r#"
            INSERT INTO reputation.users (user_id, role, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET role = EXCLUDED.role
        "#)
        .bind(user_id)
        .bind(role.as_str())
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to save user: {}", e))?;

        debug!(user_id = %user_id, role = role.as_str(), "Saved user");
        Ok(())
    }

    pub async fn insert_award_with(conn: &mut PgConnection, award: &XpAward) -> Result<(), String> {
        sqlx::query(r#"
            INSERT INTO reputation.awards (issue_id, kind_key, user_id, xp, awarded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (issue_id, kind_key) DO NOTHING
        "#)
        .bind(award.issue_id as i64)
        .bind(award.kind.key())
        .bind(&award.user_id)
        .bind(award.xp as i64)
        .bind(award.awarded_at)
        .execute(conn)
        .await
        .map_err(|e| format!("Failed to save award: {}", e))?;
        Ok(())
    }

    /// Rebuild every user's record by replaying their awards in order
    pub async fn load_records(&self) -> Result<Vec<ReputationRecord>, String> {
        let user_rows = sqlx::query("SELECT user_id, role, created_at FROM reputation.users")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to load users: {}", e))?;

        let mut records = BTreeMap::new();
        for row in user_rows {
            let user_id: String = row.get("user_id");
            let role: String = row.get("role");
            let role: Role = role.parse().map_err(|e| format!("user {}: {}", user_id, e))?;
            let mut record = ReputationRecord::new(user_id.clone(), role);
            record.created_at = row.get("created_at");
            records.insert(user_id, record);
        }

        let award_rows = sqlx::query(r#"
            SELECT issue_id, kind_key, user_id, xp, awarded_at
            FROM reputation.awards
            ORDER BY awarded_at, issue_id
        "#)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("Failed to load awards: {}", e))?;

        for row in award_rows {
            let user_id: String = row.get("user_id");
            let kind_key: String = row.get("kind_key");
            let Some(kind) = AwardKind::from_key(&kind_key) else {
                return Err(format!("unknown award kind: {}", kind_key));
            };
            let issue_id: i64 = row.get("issue_id");
            let xp: i64 = row.get("xp");
            let award = XpAward {
                user_id: user_id.clone(),
                issue_id: issue_id as u64,
                kind,
                xp: xp.max(0) as u64,
                awarded_at: row.get("awarded_at"),
            };
            match records.get_mut(&user_id) {
                Some(record) => record.apply_award(award),
                None => warn!(user_id = %user_id, "Award for unknown user skipped"),
            }
        }

        Ok(records.into_values().collect())
    }
}
