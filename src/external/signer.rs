//! Settlement signer client
//!
//! The signer moves tokens on the external network. Requests carry the ledger
//! transaction id so that the signer can deduplicate resubmissions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::http::{SecureHttpClient, endpoint};
use super::ExternalError;
use crate::config::mask_secret;
use crate::ledger::TokenAmount;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub transaction_id: Uuid,
    pub wallet_address: String,
    pub amount: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub reference: String,
}

#[async_trait]
pub trait TokenSigner: Send + Sync {
    /// Settle one withdrawal. `Rejected` means the signer refused and no
    /// transfer happened; any other error leaves the outcome unknown.
    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementReceipt, ExternalError>;
}

pub struct HttpSigner {
    http: SecureHttpClient,
    settlements_url: Url,
    api_token: Option<String>,
}

impl HttpSigner {
    pub fn new(http: SecureHttpClient, base_url: &str, api_token: Option<String>) -> anyhow::Result<Self> {
        let base = http.validate_url(base_url)?;
        let settlements_url = endpoint(&base, "settlements")?;
        info!(
            url = %settlements_url,
            token = %api_token.as_deref().map(mask_secret).unwrap_or_else(|| "<none>".to_string()),
            "Configured settlement signer"
        );
        Ok(Self {
            http,
            settlements_url,
            api_token,
        })
    }
}

#[async_trait]
impl TokenSigner for HttpSigner {
    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementReceipt, ExternalError> {
        debug!(
            transaction_id = %request.transaction_id,
            amount = %request.amount,
            "Submitting settlement"
        );
        let receipt: SettlementReceipt = self
            .http
            .post_json(&self.settlements_url, request, self.api_token.as_deref())
            .await?;
        if receipt.reference.trim().is_empty() {
            return Err(ExternalError::Unavailable(
                "signer returned an empty settlement reference".to_string(),
            ));
        }
        Ok(receipt)
    }
}

/// Stand-in used when no signer URL is configured. Every settlement is
/// reported as unavailable so withdrawals stay PENDING until reconciled.
pub struct UnconfiguredSigner;

#[async_trait]
impl TokenSigner for UnconfiguredSigner {
    async fn settle(&self, _request: &SettlementRequest) -> Result<SettlementReceipt, ExternalError> {
        Err(ExternalError::Unavailable("no signer configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = SettlementRequest {
            transaction_id: Uuid::nil(),
            wallet_address: "0xabc".to_string(),
            amount: TokenAmount::from_micros(5_000_000),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["amount"], "5.000000");
        assert_eq!(json["wallet_address"], "0xabc");
        assert!(json.get("transaction_id").is_some());
    }

    #[tokio::test]
    async fn test_unconfigured_signer_is_transient() {
        let request = SettlementRequest {
            transaction_id: Uuid::nil(),
            wallet_address: "0xabc".to_string(),
            amount: TokenAmount::from_micros(1),
        };
        let err = UnconfiguredSigner.settle(&request).await.unwrap_err();
        assert!(err.is_transient());
    }
}
