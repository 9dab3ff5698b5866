//! Ledger Repository
//!
//! Wallet bindings and the append-mostly transaction log. Only PENDING rows
//! are ever updated.

use chrono::Utc;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::ledger::{LedgerAccount, LedgerTransaction, TokenAmount};

pub struct LedgerRepository {
    pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS ledger")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create ledger schema: {}", e))?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS ledger.wallets (
                user_id VARCHAR(255) PRIMARY KEY,
                wallet_address VARCHAR(255) NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create wallets table: {}", e))?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS ledger.transactions (
                id UUID PRIMARY KEY,
                user_id VARCHAR(255) NOT NULL,
                kind VARCHAR(20) NOT NULL,
                status VARCHAR(20) NOT NULL,
                points_delta BIGINT NOT NULL,
                token_delta_micros BIGINT NOT NULL,
                idempotency_key VARCHAR(128) NOT NULL,
                wallet_address VARCHAR(255),
                settlement_reference VARCHAR(255),
                failure_reason TEXT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL,
                UNIQUE(user_id, idempotency_key)
            )
        "#)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create transactions table: {}", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_pending ON ledger.transactions(status) WHERE status = 'PENDING'")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create pending transactions index: {}", e))?;

        info!("Ledger schema initialized");
        Ok(())
    }

    pub async fn upsert_wallet(&self, user_id: &str, wallet_address: &str) -> Result<(), String> {
        sqlx::query(r#"
            INSERT INTO ledger.wallets (user_id, wallet_address, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                wallet_address = EXCLUDED.wallet_address,
                updated_at = EXCLUDED.updated_at
        "#)
        .bind(user_id)
        .bind(wallet_address)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to save wallet: {}", e))?;
        Ok(())
    }

    pub async fn insert_transaction(&self, tx: &LedgerTransaction) -> Result<(), String> {
        sqlx::query(r#"
            INSERT INTO ledger.transactions (
                id, user_id, kind, status, points_delta, token_delta_micros, idempotency_key,
                wallet_address, settlement_reference, failure_reason, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#)
        .bind(tx.id)
        .bind(&tx.user_id)
        .bind(tx.kind.as_str())
        .bind(tx.status.as_str())
        .bind(tx.points_delta)
        .bind(tx.token_delta.micros())
        .bind(&tx.idempotency_key)
        .bind(&tx.wallet_address)
        .bind(&tx.settlement_reference)
        .bind(&tx.failure_reason)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to save transaction {}: {}", tx.id, e))?;

        debug!(transaction_id = %tx.id, kind = tx.kind.as_str(), "Saved transaction");
        Ok(())
    }

    /// Record the outcome of a PENDING transaction
    pub async fn update_transaction(&self, tx: &LedgerTransaction) -> Result<(), String> {
        let result = sqlx::query(r#"
            UPDATE ledger.transactions
            SET status = $2, settlement_reference = $3, failure_reason = $4, updated_at = $5
            WHERE id = $1 AND status = 'PENDING'
        "#)
        .bind(tx.id)
        .bind(tx.status.as_str())
        .bind(&tx.settlement_reference)
        .bind(&tx.failure_reason)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to update transaction {}: {}", tx.id, e))?;

        if result.rows_affected() == 0 {
            return Err(format!("transaction {} is not pending", tx.id));
        }
        Ok(())
    }

    pub async fn load_accounts(&self) -> Result<Vec<LedgerAccount>, String> {
        let wallet_rows = sqlx::query("SELECT user_id, wallet_address FROM ledger.wallets")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to load wallets: {}", e))?;

        let mut wallets: BTreeMap<String, Option<String>> = BTreeMap::new();
        for row in wallet_rows {
            wallets.insert(row.get("user_id"), Some(row.get("wallet_address")));
        }

        let tx_rows = sqlx::query(r#"
            SELECT id, user_id, kind, status, points_delta, token_delta_micros, idempotency_key,
                   wallet_address, settlement_reference, failure_reason, created_at, updated_at
            FROM ledger.transactions
        "#)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("Failed to load transactions: {}", e))?;

        let mut transactions: BTreeMap<String, Vec<LedgerTransaction>> = BTreeMap::new();
        for row in tx_rows {
            let kind: String = row.get("kind");
            let status: String = row.get("status");
            let tx = LedgerTransaction {
                id: row.get("id"),
                user_id: row.get("user_id"),
                kind: kind.parse()?,
                status: status.parse()?,
                points_delta: row.get("points_delta"),
                token_delta: TokenAmount::from_micros(row.get("token_delta_micros")),
                idempotency_key: row.get("idempotency_key"),
                wallet_address: row.get("wallet_address"),
                settlement_reference: row.get("settlement_reference"),
                failure_reason: row.get("failure_reason"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            };
            wallets.entry(tx.user_id.clone()).or_insert(None);
            transactions.entry(tx.user_id.clone()).or_default().push(tx);
        }

        wallets
            .into_iter()
            .map(|(user_id, wallet)| {
                let txs = transactions.remove(&user_id).unwrap_or_default();
                LedgerAccount::restore(&user_id, wallet, txs)
                    .map_err(|e| format!("account {}: {}", user_id, e))
            })
            .collect()
    }
}
