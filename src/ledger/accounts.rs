//! Ledger account and transaction definitions
//!
//! Token amounts are fixed-point with six decimal places, stored as signed
//! micro-token integers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::issues::models::UserId;

pub const TOKEN_DECIMALS: u32 = 6;
const MICROS_PER_TOKEN: i64 = 1_000_000;

/// Fixed-point token quantity in micro-tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(i64);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub const fn from_micros(micros: i64) -> Self {
        TokenAmount(micros)
    }

    pub fn from_tokens(tokens: i64) -> Option<Self> {
        tokens.checked_mul(MICROS_PER_TOKEN).map(TokenAmount)
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(other.0).map(TokenAmount)
    }

    pub fn checked_sub(self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_sub(other.0).map(TokenAmount)
    }

    /// `points * self`, treating `self` as a per-point rate
    pub fn checked_mul_points(self, points: u64) -> Option<TokenAmount> {
        i64::try_from(points)
            .ok()
            .and_then(|p| self.0.checked_mul(p))
            .map(TokenAmount)
    }
}

impl std::ops::Neg for TokenAmount {
    type Output = TokenAmount;

    fn neg(self) -> TokenAmount {
        TokenAmount(-self.0)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = MICROS_PER_TOKEN as u64;
        write!(f, "{}{}.{:06}", sign, abs / scale, abs % scale)
    }
}

impl FromStr for TokenAmount {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));

        if whole.is_empty() && fraction.is_empty() {
            return Err(format!("invalid token amount '{}'", s));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid token amount '{}'", s));
        }
        if fraction.len() > TOKEN_DECIMALS as usize {
            return Err(format!(
                "token amount '{}' has more than {} decimal places",
                s, TOKEN_DECIMALS
            ));
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| format!("token amount '{}' out of range", s))?
        };
        let fraction_micros: i64 = if fraction.is_empty() {
            0
        } else {
            format!("{:0<6}", fraction)
                .parse()
                .map_err(|_| format!("invalid token amount '{}'", s))?
        };

        let micros = whole
            .checked_mul(MICROS_PER_TOKEN)
            .and_then(|w| w.checked_add(fraction_micros))
            .ok_or_else(|| format!("token amount '{}' out of range", s))?;
        Ok(TokenAmount(if negative { -micros } else { micros }))
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Integer(i64),
            Decimal(f64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Integer(tokens) => TokenAmount::from_tokens(tokens)
                .ok_or_else(|| serde::de::Error::custom("token amount out of range")),
            // shortest round-trip form, so excess precision is still rejected
            Repr::Decimal(value) if value.is_finite() => value.to_string().parse().map_err(serde::de::Error::custom),
            Repr::Decimal(value) => Err(serde::de::Error::custom(format!("invalid token amount {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Convert,
    Withdraw,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Convert => "CONVERT",
            TransactionKind::Withdraw => "WITHDRAW",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CONVERT" => Ok(TransactionKind::Convert),
            "WITHDRAW" => Ok(TransactionKind::Withdraw),
            other => Err(format!("unknown transaction kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Committed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "COMMITTED" => Ok(TransactionStatus::Committed),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    /// Non-positive for conversions, zero for withdrawals
    pub points_delta: i64,
    /// Positive for conversions, negative for withdrawals
    pub token_delta: TokenAmount,
    pub idempotency_key: String,
    pub wallet_address: Option<String>,
    pub settlement_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn convert(user_id: &str, key: &str, points: u64, tokens: TokenAmount, at: DateTime<Utc>) -> Self {
        Self {
            id: compute_transaction_id(user_id, key),
            user_id: user_id.to_string(),
            kind: TransactionKind::Convert,
            status: TransactionStatus::Committed,
            points_delta: -(points.min(i64::MAX as u64) as i64),
            token_delta: tokens,
            idempotency_key: key.to_string(),
            wallet_address: None,
            settlement_reference: None,
            failure_reason: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn withdraw(user_id: &str, key: &str, amount: TokenAmount, wallet: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: compute_transaction_id(user_id, key),
            user_id: user_id.to_string(),
            kind: TransactionKind::Withdraw,
            status: TransactionStatus::Pending,
            points_delta: 0,
            token_delta: -amount,
            idempotency_key: key.to_string(),
            wallet_address: Some(wallet.to_string()),
            settlement_reference: None,
            failure_reason: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// Whether a replayed request carries the same parameters
    pub fn matches_request(&self, kind: TransactionKind, points: u64, amount: TokenAmount) -> bool {
        match kind {
            TransactionKind::Convert => {
                self.kind == kind && self.points_delta.unsigned_abs() == points
            }
            TransactionKind::Withdraw => self.kind == kind && self.token_delta == -amount,
        }
    }
}

/// Deterministic transaction id from `(user, idempotency key)`
pub fn compute_transaction_id(user_id: &str, idempotency_key: &str) -> Uuid {
    let data = format!("{}:{}", user_id, idempotency_key);
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    Uuid::from_bytes(bytes)
}

/// `0x` followed by 40 hex characters
pub fn validate_wallet_address(address: &str) -> Result<()> {
    let valid = address
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(CoreError::validation(format!(
            "invalid wallet address '{}', expected 0x followed by 40 hex characters",
            address
        )));
    }
    Ok(())
}

/// Per-user ledger state. Balances are caches of the transaction list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerAccount {
    pub user_id: UserId,
    pub wallet_address: Option<String>,
    pub points_converted: u64,
    /// Spendable tokens, net of reservations held by pending withdrawals
    pub token_balance: TokenAmount,
    pub transactions: Vec<LedgerTransaction>,
    #[serde(skip)]
    by_key: HashMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedBalances {
    pub points_converted: u64,
    pub token_balance: TokenAmount,
    pub reserved: TokenAmount,
}

impl LedgerAccount {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            wallet_address: None,
            points_converted: 0,
            token_balance: TokenAmount::ZERO,
            transactions: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    /// Rebuild an account from stored transactions
    pub fn restore(user_id: &str, wallet_address: Option<String>, mut transactions: Vec<LedgerTransaction>) -> Result<Self> {
        transactions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let mut account = Self::new(user_id);
        account.wallet_address = wallet_address;
        for tx in transactions {
            account.by_key.insert(tx.idempotency_key.clone(), account.transactions.len());
            account.transactions.push(tx);
        }
        let derived = account.derive_balances()?;
        account.points_converted = derived.points_converted;
        account.token_balance = derived.token_balance;
        Ok(account)
    }

    pub fn find_by_key(&self, key: &str) -> Option<&LedgerTransaction> {
        self.by_key.get(key).and_then(|&i| self.transactions.get(i))
    }

    pub fn pending(&self) -> impl Iterator<Item = &LedgerTransaction> {
        self.transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Pending)
    }

    /// Recompute balances from the transaction list
    pub fn derive_balances(&self) -> Result<DerivedBalances> {
        let overflow = || CoreError::InvariantViolation(format!("balance overflow for {}", self.user_id));
        let mut points_converted: u64 = 0;
        let mut token_balance = TokenAmount::ZERO;
        let mut reserved = TokenAmount::ZERO;

        for tx in &self.transactions {
            match (tx.kind, tx.status) {
                (_, TransactionStatus::Failed) => {}
                (TransactionKind::Convert, TransactionStatus::Committed) => {
                    points_converted = points_converted
                        .checked_add(tx.points_delta.unsigned_abs())
                        .ok_or_else(overflow)?;
                    token_balance = token_balance.checked_add(tx.token_delta).ok_or_else(overflow)?;
                }
                (TransactionKind::Convert, TransactionStatus::Pending) => {
                    return Err(CoreError::InvariantViolation(format!(
                        "conversion {} for {} is pending",
                        tx.id, self.user_id
                    )));
                }
                (TransactionKind::Withdraw, status) => {
                    token_balance = token_balance.checked_add(tx.token_delta).ok_or_else(overflow)?;
                    if status == TransactionStatus::Pending {
                        reserved = reserved.checked_sub(tx.token_delta).ok_or_else(overflow)?;
                    }
                }
            }
        }

        if token_balance.is_negative() {
            return Err(CoreError::InvariantViolation(format!(
                "derived token balance for {} is negative: {}",
                self.user_id, token_balance
            )));
        }

        Ok(DerivedBalances {
            points_converted,
            token_balance,
            reserved,
        })
    }

    /// Compare cached balances with the transaction list
    pub fn verify(&self) -> Result<DerivedBalances> {
        let derived = self.derive_balances()?;
        if derived.points_converted != self.points_converted || derived.token_balance != self.token_balance {
            return Err(CoreError::InvariantViolation(format!(
                "ledger account {} out of balance: cached points {} tokens {}, derived points {} tokens {}",
                self.user_id,
                self.points_converted,
                self.token_balance,
                derived.points_converted,
                derived.token_balance
            )));
        }
        Ok(derived)
    }

    /// Append a new transaction and apply its balance effect
    pub fn record(&mut self, tx: LedgerTransaction) -> Result<()> {
        if self.by_key.contains_key(&tx.idempotency_key) {
            return Err(CoreError::Conflict(format!(
                "idempotency key {} already recorded",
                tx.idempotency_key
            )));
        }

        if tx.status != TransactionStatus::Failed {
            let token_balance = self
                .token_balance
                .checked_add(tx.token_delta)
                .filter(|b| !b.is_negative())
                .ok_or_else(|| CoreError::InsufficientBalance {
                    requested: (-tx.token_delta).to_string(),
                    available: self.token_balance.to_string(),
                })?;
            self.token_balance = token_balance;
            if tx.kind == TransactionKind::Convert {
                self.points_converted += tx.points_delta.unsigned_abs();
            }
        }

        self.by_key.insert(tx.idempotency_key.clone(), self.transactions.len());
        self.transactions.push(tx);
        Ok(())
    }

    /// Move a pending withdrawal to its final state
    pub fn settle(&mut self, id: Uuid, outcome: Settlement, at: DateTime<Utc>) -> Result<LedgerTransaction> {
        let tx = self
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| CoreError::not_found("transaction", id))?;

        if tx.status != TransactionStatus::Pending {
            return Err(CoreError::InvariantViolation(format!(
                "transaction {} is {} and cannot be settled",
                id,
                tx.status.as_str()
            )));
        }

        match outcome {
            Settlement::Committed { reference } => {
                tx.status = TransactionStatus::Committed;
                tx.settlement_reference = Some(reference);
            }
            Settlement::Failed { reason } => {
                tx.status = TransactionStatus::Failed;
                tx.failure_reason = Some(reason);
                // release the reservation
                self.token_balance = self
                    .token_balance
                    .checked_sub(tx.token_delta)
                    .ok_or_else(|| CoreError::InvariantViolation(format!("balance overflow for {}", self.user_id)))?;
            }
        }
        tx.updated_at = at;
        Ok(tx.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Committed { reference: String },
    Failed { reason: String },
}

/// Balance read model
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub user_id: UserId,
    pub points_earned: u64,
    pub points_converted: u64,
    pub points_balance: u64,
    pub token_balance: TokenAmount,
    pub pending_withdrawals: TokenAmount,
    pub wallet_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    #[test]
    fn test_token_amount_parse_and_display() {
        let amount: TokenAmount = "12.5".parse().unwrap();
        assert_eq!(amount.micros(), 12_500_000);
        assert_eq!(amount.to_string(), "12.500000");
        assert_eq!("-0.000001".parse::<TokenAmount>().unwrap().micros(), -1);
        assert_eq!(".25".parse::<TokenAmount>().unwrap().micros(), 250_000);
        assert!("1.0000001".parse::<TokenAmount>().is_err());
        assert!("abc".parse::<TokenAmount>().is_err());
        assert!("".parse::<TokenAmount>().is_err());
    }

    #[test]
    fn test_token_amount_json() {
        let amount: TokenAmount = serde_json::from_str("\"5\"").unwrap();
        assert_eq!(amount, TokenAmount::from_tokens(5).unwrap());
        let amount: TokenAmount = serde_json::from_str("3").unwrap();
        assert_eq!(amount.micros(), 3_000_000);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"3.000000\"");
    }

    #[test]
    fn test_token_amount_json_decimal() {
        let amount: TokenAmount = serde_json::from_str("2.5").unwrap();
        assert_eq!(amount.micros(), 2_500_000);
        let amount: TokenAmount = serde_json::from_str("0.000001").unwrap();
        assert_eq!(amount.micros(), 1);

        assert!(serde_json::from_str::<TokenAmount>("0.0000001").is_err());
        assert!(serde_json::from_str::<TokenAmount>("1e30").is_err());
    }

    #[test]
    fn test_conversion_rate() {
        let rate: TokenAmount = "0.1".parse().unwrap();
        assert_eq!(rate.checked_mul_points(50).unwrap().to_string(), "5.000000");
    }

    #[test]
    fn test_transaction_id_deterministic() {
        assert_eq!(
            compute_transaction_id("alice", "k1"),
            compute_transaction_id("alice", "k1")
        );
        assert_ne!(
            compute_transaction_id("alice", "k1"),
            compute_transaction_id("bob", "k1")
        );
    }

    #[test]
    fn test_wallet_validation() {
        assert!(validate_wallet_address(WALLET).is_ok());
        assert!(validate_wallet_address("0x1234").is_err());
        assert!(validate_wallet_address("52908400098527886E0F7030069857D2E4169EE7aa").is_err());
    }

    #[test]
    fn test_record_and_settle() {
        let now = Utc::now();
        let mut account = LedgerAccount::new("alice");
        account
            .record(LedgerTransaction::convert("alice", "c1", 100, TokenAmount::from_tokens(10).unwrap(), now))
            .unwrap();

        let withdraw = LedgerTransaction::withdraw("alice", "w1", TokenAmount::from_tokens(4).unwrap(), WALLET, now);
        let id = withdraw.id;
        account.record(withdraw).unwrap();
        assert_eq!(account.token_balance, TokenAmount::from_tokens(6).unwrap());
        assert_eq!(account.verify().unwrap().reserved, TokenAmount::from_tokens(4).unwrap());

        account
            .settle(id, Settlement::Failed { reason: "rejected".to_string() }, now)
            .unwrap();
        assert_eq!(account.token_balance, TokenAmount::from_tokens(10).unwrap());
        assert!(account.verify().is_ok());
        assert!(
            account
                .settle(id, Settlement::Committed { reference: "x".to_string() }, now)
                .is_err()
        );
    }

    #[test]
    fn test_tampered_balance_detected() {
        let mut account = LedgerAccount::new("alice");
        account
            .record(LedgerTransaction::convert("alice", "c1", 10, TokenAmount::from_tokens(1).unwrap(), Utc::now()))
            .unwrap();
        account.token_balance = TokenAmount::from_tokens(50).unwrap();
        assert!(matches!(account.verify(), Err(CoreError::InvariantViolation(_))));
    }

    #[test]
    fn test_restore() {
        let now = Utc::now();
        let txs = vec![
            LedgerTransaction::convert("alice", "c1", 100, TokenAmount::from_tokens(10).unwrap(), now),
            LedgerTransaction::withdraw("alice", "w1", TokenAmount::from_tokens(3).unwrap(), WALLET, now),
        ];
        let account = LedgerAccount::restore("alice", Some(WALLET.to_string()), txs).unwrap();
        assert_eq!(account.points_converted, 100);
        assert_eq!(account.token_balance, TokenAmount::from_tokens(7).unwrap());
        assert!(account.find_by_key("w1").is_some());
        assert_eq!(account.pending().count(), 1);
    }
}
