//! Database Connection Pool using sqlx

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::database::issues::IssueRepository;
use crate::database::ledger::LedgerRepository;
use crate::database::reputation::ReputationRepository;
use crate::issues::Issue;
use crate::reputation::XpAward;

pub struct DatabasePool {
    pool: PgPool,
    issues: IssueRepository,
    reputation: ReputationRepository,
    ledger: LedgerRepository,
}

impl DatabasePool {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, String> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .map_err(|e| format!("Failed to connect to PostgreSQL: {}", e))?;

        info!(max_connections = max_connections, "Connected to PostgreSQL");

        Ok(Self {
            issues: IssueRepository::new(pool.clone()),
            reputation: ReputationRepository::new(pool.clone()),
            ledger: LedgerRepository::new(pool.clone()),
            pool,
        })
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        info!("Initializing database schema...");
        self.issues.init_schema().await?;
        self.reputation.init_schema().await?;
        self.ledger.init_schema().await?;
        info!("Database schema initialized");
        Ok(())
    }

    /// Write an issue and the awards its change produced in one transaction
    pub async fn persist_issue_change(&self, issue: &Issue, awards: &[XpAward]) -> Result<(), String> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("Failed to begin transaction: {}", e))?;

        IssueRepository::upsert_with(&mut tx, issue).await?;
        for award in awards {
            ReputationRepository::insert_award_with(&mut tx, award).await?;
        }

        tx.commit()
            .await
            .map_err(|e| format!("Failed to commit issue change: {}", e))?;

        debug!(
            issue_id = issue.id,
            status = %issue.status,
            awards = awards.len(),
            "Persisted issue change"
        );
        Ok(())
    }

    pub fn issues(&self) -> &IssueRepository {
        &self.issues
    }

    pub fn reputation(&self) -> &ReputationRepository {
        &self.reputation
    }

    pub fn ledger(&self) -> &LedgerRepository {
        &self.ledger
    }
}
