use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::api::AppState;
use crate::models::points_transaction::PointsTransaction;
use crate::models::reward::{RedemptionRecord, Reward};
use crate::models::tier::RewardTier;
use crate::services::ledger::{Ledger, LedgerError, PgLedgerStore, TierProgress};

#[derive(Debug)]
pub enum RewardsError {
    Database(sqlx::Error),
    Ledger(LedgerError),
}

impl IntoResponse for RewardsError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            RewardsError::Database(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "message": format!("Database error: {}", e) }),
            ),
            RewardsError::Ledger(e) => match e {
                LedgerError::InvalidAmount(points) => (
                    StatusCode::BAD_REQUEST,
                    json!({ "message": e.to_string(), "points": points }),
                ),
                LedgerError::RewardNotFound => {
                    (StatusCode::NOT_FOUND, json!({ "message": e.to_string() }))
                }
                LedgerError::InsufficientPoints { shortfall } => (
                    StatusCode::CONFLICT,
                    json!({ "message": e.to_string(), "shortfall": shortfall }),
                ),
                LedgerError::Store(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "message": "Ledger store error" }),
                ),
            },
        };

        (status, Json(body)).into_response()
    }
}

fn ledger(state: &AppState) -> Ledger<PgLedgerStore> {
    Ledger::new(PgLedgerStore::new(state.pool.clone()), state.tiers.clone())
}

#[derive(Debug, Serialize)]
struct PointsSummary {
    balance: i64,
    tier: RewardTier,
    progress: TierProgress,
}

/// Balance, current tier, and progress toward the next tier
async fn points_summary(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<PointsSummary>, RewardsError> {
    let ledger = ledger(&state);
    let balance = ledger.balance(user_id).await.map_err(RewardsError::Ledger)?;

    Ok(Json(PointsSummary {
        balance,
        tier: ledger.tier_for(balance).clone(),
        progress: ledger.progress(balance),
    }))
}

async fn list_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<PointsTransaction>>, RewardsError> {
    let transactions = PointsTransaction::list_for_user(&state.pool, user_id)
        .await
        .map_err(RewardsError::Database)?;

    Ok(Json(transactions))
}

async fn list_rewards(
    State(state): State<AppState>,
) -> Result<Json<Vec<Reward>>, RewardsError> {
    let rewards = Reward::list_active(&state.pool)
        .await
        .map_err(RewardsError::Database)?;

    Ok(Json(rewards))
}

async fn list_redemptions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<RedemptionRecord>>, RewardsError> {
    let redemptions = RedemptionRecord::list_for_user(&state.pool, user_id)
        .await
        .map_err(RewardsError::Database)?;

    Ok(Json(redemptions))
}

#[derive(Debug, Serialize)]
struct RedeemResponse {
    redemption: RedemptionRecord,
    balance: i64,
    progress: TierProgress,
}

async fn redeem(
    State(state): State<AppState>,
    Path((user_id, reward_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<RedeemResponse>, RewardsError> {
    let outcome = ledger(&state)
        .redeem(user_id, reward_id)
        .await
        .map_err(RewardsError::Ledger)?;

    Ok(Json(RedeemResponse {
        redemption: outcome.record,
        balance: outcome.balance,
        progress: outcome.progress,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rewards", get(list_rewards))
        .route("/users/:user_id/points", get(points_summary))
        .route("/users/:user_id/transactions", get(list_transactions))
        .route("/users/:user_id/redemptions", get(list_redemptions))
        .route("/users/:user_id/rewards/:reward_id/redeem", post(redeem))
}
