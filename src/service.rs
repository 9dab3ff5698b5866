//! Service wiring
//!
//! Builds the components from configuration, shares one reputation engine and
//! audit log between them, and reloads persisted state on startup.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::AuditLogger;
use crate::config::CivicConfig;
use crate::database::DatabasePool;
use crate::error::CoreError;
use crate::external::{Classifier, HttpClassifier, HttpSigner, SecureHttpClient, TokenSigner, UnconfiguredSigner};
use crate::issues::{IssueLifecycle, LifecycleConfig};
use crate::ledger::{LedgerPolicy, TokenLedger};
use crate::reputation::{LeaderboardRanker, LevelCurve, ReputationEngine, Role, XpSchedule};

/// Settings for assembling a service around already-built collaborators
#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    pub schedule: XpSchedule,
    pub curve: LevelCurve,
    pub lifecycle: LifecycleConfig,
    pub ledger: LedgerPolicy,
}

pub struct CivicService {
    reputation: Arc<ReputationEngine>,
    leaderboard: LeaderboardRanker,
    issues: IssueLifecycle,
    ledger: TokenLedger,
    audit: Arc<AuditLogger>,
    db: Option<Arc<DatabasePool>>,
}

impl CivicService {
    pub fn new(
        settings: ServiceSettings,
        classifier: Option<Arc<dyn Classifier>>,
        signer: Arc<dyn TokenSigner>,
        db: Option<Arc<DatabasePool>>,
    ) -> Self {
        let reputation = Arc::new(ReputationEngine::new(settings.schedule, settings.curve));
        let audit = Arc::new(AuditLogger::default());

        let mut issues = IssueLifecycle::new(reputation.clone(), audit.clone(), settings.lifecycle);
        if let Some(classifier) = classifier {
            issues = issues.with_classifier(classifier);
        }
        let mut ledger = TokenLedger::new(reputation.clone(), signer, audit.clone(), settings.ledger);
        if let Some(ref db) = db {
            issues = issues.with_database(db.clone());
            ledger = ledger.with_database(db.clone());
        }

        Self {
            leaderboard: LeaderboardRanker::new(reputation.clone()),
            reputation,
            issues,
            ledger,
            audit,
            db,
        }
    }

    /// Build every collaborator from configuration and restore persisted state
    pub async fn from_config(config: &CivicConfig) -> Result<Self> {
        let classifier: Option<Arc<dyn Classifier>> = match config.classifier.url {
            Some(ref url) => {
                let http = SecureHttpClient::new(config.http_security(&config.classifier))
                    .context("Failed to build classifier HTTP client")?;
                Some(Arc::new(HttpClassifier::new(http, url, config.classifier.api_token.clone())?) as Arc<dyn Classifier>)
            }
            None => {
                warn!("No classifier configured, issues rely on votes and admin review");
                None
            }
        };

        let signer: Arc<dyn TokenSigner> = match config.signer.url {
            Some(ref url) => {
                let http = SecureHttpClient::new(config.http_security(&config.signer))
                    .context("Failed to build signer HTTP client")?;
                Arc::new(HttpSigner::new(http, url, config.signer.api_token.clone())?) as Arc<dyn TokenSigner>
            }
            None => Arc::new(UnconfiguredSigner) as Arc<dyn TokenSigner>,
        };

        let db = if config.database.postgres_enabled {
            let pool = DatabasePool::new(&config.database.postgres_url, config.database.max_connections)
                .await
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to connect to PostgreSQL")?;
            pool.init_schema()
                .await
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to initialize database schema")?;
            Some(Arc::new(pool))
        } else {
            info!("PostgreSQL disabled, state is kept in memory only");
            None
        };

        let settings = ServiceSettings {
            schedule: config.reputation.schedule.clone(),
            curve: config.reputation.level_curve,
            lifecycle: config.lifecycle(),
            ledger: config.ledger_policy(),
        };
        let service = Self::new(settings, classifier, signer, db);
        service.restore().await?;
        Ok(service)
    }

    /// Reload users, awards, issues and ledger accounts from storage
    pub async fn restore(&self) -> Result<()> {
        let Some(ref db) = self.db else {
            return Ok(());
        };

        let records = db
            .reputation()
            .load_records()
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to load reputation records")?;
        self.reputation.restore(records).await;

        let issues = db
            .issues()
            .load_all()
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to load issues")?;
        self.issues.restore(issues);

        let accounts = db
            .ledger()
            .load_accounts()
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to load ledger accounts")?;
        self.ledger.restore(accounts);

        Ok(())
    }

    /// Register a user vouched for by the identity provider. Returns true
    /// when the user was new or their role changed.
    pub async fn ensure_user(&self, user_id: &str, role: Role) -> crate::error::Result<bool> {
        if user_id.trim().is_empty() {
            return Err(CoreError::validation("user id is required"));
        }
        if let Ok(current) = self.reputation.role_of(user_id).await
            && current == role
        {
            return Ok(false);
        }
        if let Some(ref db) = self.db {
            db.reputation()
                .upsert_user(user_id, role, Utc::now())
                .await
                .map_err(CoreError::Storage)?;
        }
        self.reputation.register_user(user_id, role).await
    }

    pub fn reputation(&self) -> &ReputationEngine {
        &self.reputation
    }

    pub fn leaderboard(&self) -> &LeaderboardRanker {
        &self.leaderboard
    }

    pub fn issues(&self) -> &IssueLifecycle {
        &self.issues
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn has_database(&self) -> bool {
        self.db.is_some()
    }
}
