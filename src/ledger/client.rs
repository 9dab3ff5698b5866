//! Token Ledger
//!
//! Points to token conversion and token withdrawal. Every balance change is a
//! recorded transaction; cached balances are re-derived from the transaction
//! list before each operation. Once an operation reaches its first balance
//! mutation the remainder runs in a spawned task holding the account lock,
//! so dropping the caller's future cannot abandon it half way.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::accounts::{
    Balance, DerivedBalances, LedgerAccount, LedgerTransaction, Settlement, TokenAmount,
    TransactionKind, TransactionStatus, validate_wallet_address,
};
use crate::audit::AuditLogger;
use crate::database::DatabasePool;
use crate::error::{CoreError, Result};
use crate::external::{ExternalError, RetryConfig, SettlementRequest, TokenSigner, call_with_retry};
use crate::issues::models::UserId;
use crate::reputation::ReputationEngine;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    /// Tokens credited per converted point
    pub conversion_rate: TokenAmount,
    /// Bound on a single signer attempt
    pub signer_timeout: Duration,
    pub signer_retry: RetryConfig,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            conversion_rate: TokenAmount::from_micros(100_000),
            signer_timeout: Duration::from_secs(10),
            signer_retry: RetryConfig::default(),
        }
    }
}

/// Outcome of a `reconcile_pending` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub attempted: usize,
    pub committed: usize,
    pub failed: usize,
    pub still_pending: usize,
}

/// Everything the detached settle phase needs
#[derive(Clone)]
struct SettleContext {
    signer: Arc<dyn TokenSigner>,
    audit: Arc<AuditLogger>,
    db: Option<Arc<DatabasePool>>,
    timeout: Duration,
    retry: RetryConfig,
}

pub struct TokenLedger {
    accounts: DashMap<UserId, Arc<Mutex<LedgerAccount>>>,
    reputation: Arc<ReputationEngine>,
    policy: LedgerPolicy,
    ctx: SettleContext,
}

impl TokenLedger {
    pub fn new(
        reputation: Arc<ReputationEngine>,
        signer: Arc<dyn TokenSigner>,
        audit: Arc<AuditLogger>,
        policy: LedgerPolicy,
    ) -> Self {
        let ctx = SettleContext {
            signer,
            audit,
            db: None,
            timeout: policy.signer_timeout,
            retry: policy.signer_retry.clone(),
        };
        Self {
            accounts: DashMap::new(),
            reputation,
            policy,
            ctx,
        }
    }

    pub fn with_database(mut self, db: Arc<DatabasePool>) -> Self {
        self.ctx.db = Some(db);
        self
    }

    /// Load accounts from storage
    pub fn restore(&self, accounts: Vec<LedgerAccount>) {
        let count = accounts.len();
        for account in accounts {
            self.accounts
                .insert(account.user_id.clone(), Arc::new(Mutex::new(account)));
        }
        info!(accounts = count, "Restored ledger accounts");
    }

    /// Points to tokens at the configured rate
    pub async fn convert(&self, user_id: &str, points: u64, idempotency_key: &str) -> Result<LedgerTransaction> {
        validate_idempotency_key(idempotency_key)?;
        if points == 0 {
            return Err(CoreError::validation("points must be greater than zero"));
        }

        let handle = self.account(user_id).await?;
        let account = handle.lock_owned().await;
        self.check(&account).await?;

        if let Some(prior) = account.find_by_key(idempotency_key) {
            return Err(replay_error(prior, TransactionKind::Convert, points, TokenAmount::ZERO));
        }

        let earned = self.reputation.earned_points(user_id).await?;
        let available = earned.saturating_sub(account.points_converted);
        if points > available {
            return Err(CoreError::InsufficientBalance {
                requested: points.to_string(),
                available: available.to_string(),
            });
        }

        let tokens = self
            .policy
            .conversion_rate
            .checked_mul_points(points)
            .ok_or_else(|| CoreError::validation("conversion amount out of range"))?;
        let tx = LedgerTransaction::convert(user_id, idempotency_key, points, tokens, Utc::now());

        let db = self.ctx.db.clone();
        let committed = tokio::spawn(async move {
            let mut account = account;
            if let Some(db) = db {
                db.ledger().insert_transaction(&tx).await.map_err(CoreError::Storage)?;
            }
            account.record(tx.clone())?;
            Ok::<_, CoreError>(tx)
        })
        .await
        .map_err(|e| CoreError::InvariantViolation(format!("ledger commit task failed: {}", e)))??;

        info!(
            user_id = %user_id,
            points = points,
            tokens = %committed.token_delta,
            transaction_id = %committed.id,
            "Converted points to tokens"
        );
        Ok(committed)
    }

    /// Withdraw tokens to the registered wallet.
    ///
    /// A signer timeout leaves the transaction PENDING and returns
    /// `ExternalService`; calling again with the same key resumes it. An
    /// explicit signer rejection returns the FAILED transaction.
    pub async fn withdraw(&self, user_id: &str, amount: TokenAmount, idempotency_key: &str) -> Result<LedgerTransaction> {
        validate_idempotency_key(idempotency_key)?;
        if !amount.is_positive() {
            return Err(CoreError::validation("amount must be greater than zero"));
        }

        let handle = self.account(user_id).await?;
        let account = handle.lock_owned().await;
        self.check(&account).await?;

        if let Some(prior) = account.find_by_key(idempotency_key) {
            if prior.status == TransactionStatus::Pending
                && prior.matches_request(TransactionKind::Withdraw, 0, amount)
            {
                let id = prior.id;
                info!(user_id = %user_id, transaction_id = %id, "Resuming pending withdrawal");
                return spawn_settle(self.ctx.clone(), account, id).await;
            }
            return Err(replay_error(prior, TransactionKind::Withdraw, 0, amount));
        }

        let wallet = account
            .wallet_address
            .clone()
            .ok_or_else(|| CoreError::validation("no wallet address registered"))?;
        if amount > account.token_balance {
            return Err(CoreError::InsufficientBalance {
                requested: amount.to_string(),
                available: account.token_balance.to_string(),
            });
        }

        let tx = LedgerTransaction::withdraw(user_id, idempotency_key, amount, &wallet, Utc::now());
        let id = tx.id;
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let mut account = account;
            if let Some(ref db) = ctx.db {
                db.ledger().insert_transaction(&tx).await.map_err(CoreError::Storage)?;
            }
            account.record(tx)?;
            debug!(transaction_id = %id, amount = %amount, "Reserved withdrawal amount");
            settle(&ctx, &mut account, id).await
        })
        .await
        .map_err(|e| CoreError::InvariantViolation(format!("ledger commit task failed: {}", e)))?
    }

    pub async fn register_wallet(&self, user_id: &str, address: &str) -> Result<()> {
        validate_wallet_address(address)?;
        let handle = self.account(user_id).await?;
        let mut account = handle.lock().await;

        if let Some(ref db) = self.ctx.db {
            db.ledger()
                .upsert_wallet(user_id, address)
                .await
                .map_err(CoreError::Storage)?;
        }
        account.wallet_address = Some(address.to_string());
        info!(user_id = %user_id, "Registered wallet address");
        Ok(())
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<Balance> {
        let handle = self.account(user_id).await?;
        let account = handle.lock().await;
        let derived = self.check(&account).await?;
        let earned = self.reputation.earned_points(user_id).await?;

        Ok(Balance {
            user_id: user_id.to_string(),
            points_earned: earned,
            points_converted: account.points_converted,
            points_balance: earned.saturating_sub(account.points_converted),
            token_balance: account.token_balance,
            pending_withdrawals: derived.reserved,
            wallet_address: account.wallet_address.clone(),
        })
    }

    /// Transactions in the order they were recorded
    pub async fn transactions(&self, user_id: &str) -> Result<Vec<LedgerTransaction>> {
        let handle = self.account(user_id).await?;
        let account = handle.lock().await;
        Ok(account.transactions.clone())
    }

    /// Resubmit every PENDING withdrawal to the signer
    pub async fn reconcile_pending(&self) -> ReconcileReport {
        let handles: Vec<_> = self.accounts.iter().map(|e| e.value().clone()).collect();
        let mut report = ReconcileReport::default();

        for handle in handles {
            let account = handle.lock_owned().await;
            if let Err(e) = self.check(&account).await {
                error!(user_id = %account.user_id, error = %e, "Skipping account during reconciliation");
                continue;
            }
            let pending: Vec<Uuid> = account.pending().map(|t| t.id).collect();
            if pending.is_empty() {
                continue;
            }

            let ctx = self.ctx.clone();
            let outcomes = tokio::spawn(async move {
                let mut account = account;
                let mut outcomes = Vec::with_capacity(pending.len());
                for id in pending {
                    outcomes.push(settle(&ctx, &mut account, id).await);
                }
                outcomes
            })
            .await;

            let outcomes = match outcomes {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    error!(error = %e, "Reconciliation task failed");
                    continue;
                }
            };
            for outcome in outcomes {
                report.attempted += 1;
                match outcome {
                    Ok(tx) if tx.status == TransactionStatus::Committed => report.committed += 1,
                    Ok(_) => report.failed += 1,
                    Err(_) => report.still_pending += 1,
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                committed = report.committed,
                failed = report.failed,
                still_pending = report.still_pending,
                "Reconciled pending withdrawals"
            );
        }
        report
    }

    /// Account handle for a registered user
    async fn account(&self, user_id: &str) -> Result<Arc<Mutex<LedgerAccount>>> {
        self.reputation.role_of(user_id).await?;
        let handle = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LedgerAccount::new(user_id))))
            .clone();
        Ok(handle)
    }

    async fn check(&self, account: &LedgerAccount) -> Result<DerivedBalances> {
        match account.verify() {
            Ok(derived) => Ok(derived),
            Err(e) => {
                error!(user_id = %account.user_id, error = %e, "Ledger invariant violated");
                if let CoreError::InvariantViolation(ref detail) = e {
                    self.ctx.audit.log_invariant_violation("ledger", detail).await;
                }
                Err(e)
            }
        }
    }
}

fn validate_idempotency_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(CoreError::validation("idempotency key is required"));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(CoreError::validation(format!(
            "idempotency key exceeds {} bytes",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    Ok(())
}

/// Error for a request whose key is already recorded
fn replay_error(prior: &LedgerTransaction, kind: TransactionKind, points: u64, amount: TokenAmount) -> CoreError {
    if !prior.matches_request(kind, points, amount) {
        return CoreError::Conflict(format!(
            "idempotency key {} was used for a different request",
            prior.idempotency_key
        ));
    }
    CoreError::DuplicateRequest(Box::new(prior.clone()))
}

async fn spawn_settle(
    ctx: SettleContext,
    account: OwnedMutexGuard<LedgerAccount>,
    id: Uuid,
) -> Result<LedgerTransaction> {
    tokio::spawn(async move {
        let mut account = account;
        settle(&ctx, &mut account, id).await
    })
    .await
    .map_err(|e| CoreError::InvariantViolation(format!("ledger commit task failed: {}", e)))?
}

/// Drive one PENDING withdrawal to COMMITTED or FAILED. Transient signer
/// failures leave it PENDING.
async fn settle(ctx: &SettleContext, account: &mut LedgerAccount, id: Uuid) -> Result<LedgerTransaction> {
    let tx = account
        .transactions
        .iter()
        .find(|t| t.id == id)
        .cloned()
        .ok_or_else(|| CoreError::not_found("transaction", id))?;
    let wallet_address = tx.wallet_address.clone().ok_or_else(|| {
        CoreError::InvariantViolation(format!("withdrawal {} has no wallet address", id))
    })?;

    let request = SettlementRequest {
        transaction_id: id,
        wallet_address,
        amount: -tx.token_delta,
    };
    let outcome = call_with_retry("signer", &ctx.retry, ctx.timeout, || ctx.signer.settle(&request)).await;

    let settlement = match outcome {
        Ok(receipt) => Settlement::Committed {
            reference: receipt.reference,
        },
        Err(ExternalError::Rejected(reason)) => Settlement::Failed { reason },
        Err(e) => {
            warn!(
                user_id = %tx.user_id,
                transaction_id = %id,
                error = %e,
                "Signer unavailable, withdrawal stays pending"
            );
            return Err(e.into_core("signer"));
        }
    };

    // persist first so memory never runs ahead of storage
    let mut next = account.clone();
    let settled = next.settle(id, settlement, Utc::now())?;
    if let Some(ref db) = ctx.db {
        db.ledger()
            .update_transaction(&settled)
            .await
            .map_err(CoreError::Storage)?;
    }
    *account = next;

    match settled.status {
        TransactionStatus::Committed => {
            let reference = settled.settlement_reference.as_deref().unwrap_or_default();
            info!(
                user_id = %settled.user_id,
                transaction_id = %id,
                reference = %reference,
                "Withdrawal committed"
            );
            ctx.audit
                .log_withdrawal_settled(&settled.user_id, &id.to_string(), reference)
                .await;
        }
        _ => {
            let reason = settled.failure_reason.as_deref().unwrap_or_default();
            warn!(
                user_id = %settled.user_id,
                transaction_id = %id,
                reason = %reason,
                "Withdrawal rejected by signer, reservation released"
            );
            ctx.audit
                .log_withdrawal_failed(&settled.user_id, &id.to_string(), reason)
                .await;
        }
    }
    Ok(settled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::SettlementReceipt;
    use crate::reputation::{ReputationEvent, ReputationEventKind, Role};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    const WALLET: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    /// Plays back queued outcomes, then succeeds
    #[derive(Default)]
    struct ScriptedSigner {
        outcomes: std::sync::Mutex<VecDeque<std::result::Result<SettlementReceipt, ExternalError>>>,
        calls: AtomicU32,
        seen: std::sync::Mutex<Vec<Uuid>>,
    }

    impl ScriptedSigner {
        fn with(outcomes: Vec<std::result::Result<SettlementReceipt, ExternalError>>) -> Self {
            Self {
                outcomes: std::sync::Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TokenSigner for ScriptedSigner {
        async fn settle(&self, request: &SettlementRequest) -> std::result::Result<SettlementReceipt, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.transaction_id);
            let next = self.outcomes.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Ok(SettlementReceipt {
                    reference: format!("ref-{}", request.transaction_id),
                })
            })
        }
    }

    fn policy() -> LedgerPolicy {
        LedgerPolicy {
            signer_timeout: Duration::from_millis(200),
            signer_retry: RetryConfig {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                backoff_multiplier: 1.0,
            },
            ..Default::default()
        }
    }

    /// Ledger with `alice` holding `xp` earned points
    async fn setup(signer: Arc<ScriptedSigner>, xp_issues: u64) -> (TokenLedger, Arc<AuditLogger>) {
        let engine = Arc::new(ReputationEngine::default());
        engine.register_user("alice", Role::User).await.unwrap();
        let events: Vec<_> = (1..=xp_issues)
            .map(|issue_id| ReputationEvent {
                user_id: "alice".to_string(),
                issue_id,
                kind: ReputationEventKind::IssueSubmitted,
            })
            .collect();
        engine.apply(&events, Utc::now()).await.unwrap();

        let audit = Arc::new(AuditLogger::default());
        let ledger = TokenLedger::new(engine, signer, audit.clone(), policy());
        (ledger, audit)
    }

    fn tokens(n: i64) -> TokenAmount {
        TokenAmount::from_tokens(n).unwrap()
    }

    #[tokio::test]
    async fn test_convert_insufficient_points() {
        let (ledger, _) = setup(Arc::new(ScriptedSigner::default()), 5).await;

        let result = ledger.convert("alice", 100, "k1").await;
        assert!(matches!(result, Err(CoreError::InsufficientBalance { .. })));

        let balance = ledger.get_balance("alice").await.unwrap();
        assert_eq!(balance.points_balance, 50);
        assert_eq!(balance.token_balance, TokenAmount::ZERO);
        assert!(ledger.transactions("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_convert_idempotent() {
        let (ledger, _) = setup(Arc::new(ScriptedSigner::default()), 5).await;

        let tx = ledger.convert("alice", 30, "k1").await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Committed);
        assert_eq!(tx.token_delta, tokens(3));
        assert_eq!(tx.points_delta, -30);

        match ledger.convert("alice", 30, "k1").await {
            Err(CoreError::DuplicateRequest(prior)) => assert_eq!(*prior, tx),
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert!(matches!(
            ledger.convert("alice", 10, "k1").await,
            Err(CoreError::Conflict(_))
        ));

        let balance = ledger.get_balance("alice").await.unwrap();
        assert_eq!(balance.points_balance, 20);
        assert_eq!(balance.points_converted, 30);
        assert_eq!(balance.token_balance, tokens(3));
    }

    #[tokio::test]
    async fn test_withdraw_twice_same_key() {
        let signer = Arc::new(ScriptedSigner::default());
        let (ledger, _) = setup(signer.clone(), 5).await;
        ledger.convert("alice", 50, "c1").await.unwrap();
        ledger.register_wallet("alice", WALLET).await.unwrap();

        let first = ledger.withdraw("alice", tokens(5), "k2").await.unwrap();
        assert_eq!(first.status, TransactionStatus::Committed);
        assert!(first.settlement_reference.is_some());

        match ledger.withdraw("alice", tokens(5), "k2").await {
            Err(CoreError::DuplicateRequest(prior)) => assert_eq!(*prior, first),
            other => panic!("expected duplicate, got {:?}", other),
        }

        let balance = ledger.get_balance("alice").await.unwrap();
        assert_eq!(balance.token_balance, TokenAmount::ZERO);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signer_timeout_then_resume() {
        let signer = Arc::new(ScriptedSigner::with(vec![Err(ExternalError::Unavailable(
            "connection refused".to_string(),
        ))]));
        let (ledger, _) = setup(signer.clone(), 10).await;
        ledger.convert("alice", 100, "c1").await.unwrap();
        ledger.register_wallet("alice", WALLET).await.unwrap();

        let result = ledger.withdraw("alice", tokens(4), "w1").await;
        assert!(matches!(result, Err(CoreError::ExternalService { .. })));

        let balance = ledger.get_balance("alice").await.unwrap();
        assert_eq!(balance.token_balance, tokens(6));
        assert_eq!(balance.pending_withdrawals, tokens(4));
        let txs = ledger.transactions("alice").await.unwrap();
        assert_eq!(txs[1].status, TransactionStatus::Pending);

        let resumed = ledger.withdraw("alice", tokens(4), "w1").await.unwrap();
        assert_eq!(resumed.status, TransactionStatus::Committed);
        assert_eq!(resumed.id, txs[1].id);

        let seen = signer.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![resumed.id, resumed.id]);
        let balance = ledger.get_balance("alice").await.unwrap();
        assert_eq!(balance.token_balance, tokens(6));
        assert_eq!(balance.pending_withdrawals, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_signer_rejection_releases_reservation() {
        let signer = Arc::new(ScriptedSigner::with(vec![Err(ExternalError::Rejected(
            "wallet blocked".to_string(),
        ))]));
        let (ledger, audit) = setup(signer, 10).await;
        ledger.convert("alice", 100, "c1").await.unwrap();
        ledger.register_wallet("alice", WALLET).await.unwrap();

        let tx = ledger.withdraw("alice", tokens(4), "w1").await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.failure_reason.as_deref(), Some("wallet blocked"));

        let balance = ledger.get_balance("alice").await.unwrap();
        assert_eq!(balance.token_balance, tokens(10));
        assert_eq!(audit.get_for_user("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn test_withdraw_preconditions() {
        let (ledger, _) = setup(Arc::new(ScriptedSigner::default()), 10).await;
        ledger.convert("alice", 100, "c1").await.unwrap();

        assert!(matches!(
            ledger.withdraw("alice", tokens(1), "w1").await,
            Err(CoreError::Validation(_))
        ));
        ledger.register_wallet("alice", WALLET).await.unwrap();
        assert!(matches!(
            ledger.withdraw("alice", tokens(11), "w1").await,
            Err(CoreError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            ledger.withdraw("alice", TokenAmount::ZERO, "w2").await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            ledger.withdraw("nobody", tokens(1), "w3").await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(ledger.register_wallet("alice", "0xnope").await.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_pending() {
        let signer = Arc::new(ScriptedSigner::with(vec![Err(ExternalError::Timeout(
            Duration::from_millis(200),
        ))]));
        let (ledger, _) = setup(signer, 10).await;
        ledger.convert("alice", 100, "c1").await.unwrap();
        ledger.register_wallet("alice", WALLET).await.unwrap();
        assert!(ledger.withdraw("alice", tokens(2), "w1").await.is_err());

        let report = ledger.reconcile_pending().await;
        assert_eq!(
            report,
            ReconcileReport {
                attempted: 1,
                committed: 1,
                failed: 0,
                still_pending: 0,
            }
        );
        assert_eq!(ledger.reconcile_pending().await.attempted, 0);
    }
}
