//! Ledger endpoints
//!
//!   POST /ledger/convert                  -> Points to tokens
//!   POST /ledger/withdraw                 -> Tokens to the registered wallet
//!   PUT  /ledger/wallet                   -> Register or replace the wallet
//!   GET  /ledger/{user_id}/balance        -> Balance view
//!   GET  /ledger/{user_id}/transactions   -> Transaction history
//!
//! Writes act on the caller's own account. Replaying an idempotency key
//! returns 200 with the original transaction and `"replayed": true`.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiJson, ApiPath, ApiState, Identity, TransactionResponse};
use crate::ledger::{Balance, LedgerTransaction, TokenAmount};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertRequest {
    pub points: u64,
    pub idempotency_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    pub amount: TokenAmount,
    pub idempotency_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRequest {
    pub wallet_address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletResponse {
    pub user_id: String,
    pub wallet_address: String,
}

async fn convert(
    State(state): State<ApiState>,
    identity: Identity,
    ApiJson(request): ApiJson<ConvertRequest>,
) -> Result<(StatusCode, Json<TransactionResponse>), ApiError> {
    let transaction = state
        .service
        .ledger()
        .convert(&identity.user_id, request.points, &request.idempotency_key)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(TransactionResponse {
            transaction,
            replayed: false,
        }),
    ))
}

async fn withdraw(
    State(state): State<ApiState>,
    identity: Identity,
    ApiJson(request): ApiJson<WithdrawRequest>,
) -> Result<(StatusCode, Json<TransactionResponse>), ApiError> {
    let transaction = state
        .service
        .ledger()
        .withdraw(&identity.user_id, request.amount, &request.idempotency_key)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(TransactionResponse {
            transaction,
            replayed: false,
        }),
    ))
}

async fn register_wallet(
    State(state): State<ApiState>,
    identity: Identity,
    ApiJson(request): ApiJson<WalletRequest>,
) -> Result<Json<WalletResponse>, ApiError> {
    let address = request.wallet_address.trim().to_string();
    state
        .service
        .ledger()
        .register_wallet(&identity.user_id, &address)
        .await?;
    Ok(Json(WalletResponse {
        user_id: identity.user_id,
        wallet_address: address,
    }))
}

async fn get_balance(
    State(state): State<ApiState>,
    identity: Identity,
    ApiPath(user_id): ApiPath<String>,
) -> Result<Json<Balance>, ApiError> {
    identity.ensure_can_read(&user_id)?;
    Ok(Json(state.service.ledger().get_balance(&user_id).await?))
}

async fn get_transactions(
    State(state): State<ApiState>,
    identity: Identity,
    ApiPath(user_id): ApiPath<String>,
) -> Result<Json<Vec<LedgerTransaction>>, ApiError> {
    identity.ensure_can_read(&user_id)?;
    Ok(Json(state.service.ledger().transactions(&user_id).await?))
}

pub fn create_router() -> Router<ApiState> {
    Router::new()
        .route("/convert", post(convert))
        .route("/withdraw", post(withdraw))
        .route("/wallet", put(register_wallet))
        .route("/{user_id}/balance", get(get_balance))
        .route("/{user_id}/transactions", get(get_transactions))
}
