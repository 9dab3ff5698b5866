//! Reputation API Endpoints
//!
//!   GET /reputation/{user_id}        -> XP, level and counters
//!   GET /leaderboard?window=&limit=  -> Ranked users for a window

use axum::{
    Json, Router,
    extract::State,
    routing::get,
};
use serde::Deserialize;

use super::{ApiError, ApiPath, ApiQuery, ApiState};
use crate::reputation::{Leaderboard, LeaderboardWindow, ReputationView};

const MAX_LEADERBOARD_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardQuery {
    #[serde(default)]
    pub window: LeaderboardWindow,
    pub limit: Option<usize>,
}

/// GET /reputation/{user_id}
async fn get_reputation(
    State(state): State<ApiState>,
    ApiPath(user_id): ApiPath<String>,
) -> Result<Json<ReputationView>, ApiError> {
    Ok(Json(state.service.reputation().get_reputation(&user_id).await?))
}

/// GET /leaderboard
async fn get_leaderboard(
    State(state): State<ApiState>,
    ApiQuery(query): ApiQuery<LeaderboardQuery>,
) -> Json<Leaderboard> {
    let limit = query.limit.unwrap_or(50).min(MAX_LEADERBOARD_LIMIT);
    Json(state.service.leaderboard().rank(query.window, Some(limit)).await)
}

pub fn create_router() -> Router<ApiState> {
    Router::new()
        .route("/reputation/{user_id}", get(get_reputation))
        .route("/leaderboard", get(get_leaderboard))
}
