//! Issue Repository
//!
//! Each issue is stored as a JSONB document next to the columns used for
//! filtering.

use sqlx::postgres::{PgConnection, PgPool};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use crate::issues::Issue;

pub struct IssueRepository {
    pool: PgPool,
}

impl IssueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS issues")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create issues schema: {}", e))?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS issues.issues (
                id BIGINT PRIMARY KEY,
                reporter VARCHAR(255) NOT NULL,
                status VARCHAR(20) NOT NULL,
                category VARCHAR(50) NOT NULL,
                severity VARCHAR(20) NOT NULL,
                document JSONB NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create issues table: {}", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_status ON issues.issues(status, created_at DESC)")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create issues status index: {}", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_reporter ON issues.issues(reporter)")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create issues reporter index: {}", e))?;

        info!("Issues schema initialized");
        Ok(())
    }

    /// Insert or replace an issue on an open connection or transaction
    pub async fn upsert_with(conn: &mut PgConnection, issue: &Issue) -> Result<(), String> {
        let id = i64::try_from(issue.id).map_err(|_| format!("issue id {} out of range", issue.id))?;
        sqlx::query(r#"
            INSERT INTO issues.issues (id, reporter, status, category, severity, document, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                document = EXCLUDED.document,
                updated_at = NOW()
        "#)
        .bind(id)
        .bind(&issue.reporter)
        .bind(issue.status.as_str())
        .bind(issue.category.as_str())
        .bind(issue.severity.as_str())
        .bind(Json(issue))
        .bind(issue.created_at)
        .execute(conn)
        .await
        .map_err(|e| format!("Failed to save issue {}: {}", issue.id, e))?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<Issue>, String> {
        let rows = sqlx::query("SELECT document FROM issues.issues ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to load issues: {}", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Json<Issue>, _>("document")
                    .map(|doc| doc.0)
                    .map_err(|e| format!("Failed to decode issue: {}", e))
            })
            .collect()
    }
}
