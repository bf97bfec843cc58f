use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::api::AppState;
use crate::models::bag::BagRegistration;
use crate::models::category::WasteCategory;
use crate::models::location::LocationRecord;
use crate::models::pickup::{CreatePickupData, PickupRequest};
use crate::models::points_transaction::PointsTransaction;
use crate::services::accrual;
use crate::services::ledger::{Ledger, LedgerError, PgLedgerStore};

#[derive(Debug)]
pub enum PickupsError {
    Database(sqlx::Error),
    Ledger(LedgerError),
    Validation(String),
    NotFound(&'static str),
}

impl IntoResponse for PickupsError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            PickupsError::Database(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Database error: {}", e),
            ),
            PickupsError::Ledger(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Ledger error: {}", e))
            }
            PickupsError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            PickupsError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SchedulePickupRequest {
    location_id: Uuid,
    category: WasteCategory,
    bag_count: i32,
    scheduled_for: Option<DateTime<Utc>>,
}

async fn schedule_pickup(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<SchedulePickupRequest>,
) -> Result<(StatusCode, Json<PickupRequest>), PickupsError> {
    if request.bag_count < 1 {
        return Err(PickupsError::Validation(
            "bag_count must be at least 1".to_string(),
        ));
    }

    LocationRecord::find_by_id(&state.pool, request.location_id, user_id)
        .await
        .map_err(PickupsError::Database)?
        .filter(|l| !l.is_deleted)
        .ok_or(PickupsError::NotFound("Location"))?;

    let pickup = PickupRequest::create(
        &state.pool,
        CreatePickupData {
            user_id,
            location_id: request.location_id,
            category: request.category,
            bag_count: request.bag_count,
            scheduled_for: request.scheduled_for,
        },
    )
    .await
    .map_err(PickupsError::Database)?;

    tracing::info!(pickup_id = %pickup.id, category = request.category.as_str(), "Pickup scheduled");

    Ok((StatusCode::CREATED, Json(pickup)))
}

async fn list_pickups(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<PickupRequest>>, PickupsError> {
    let pickups = PickupRequest::list_for_user(&state.pool, user_id)
        .await
        .map_err(PickupsError::Database)?;

    Ok(Json(pickups))
}

#[derive(Debug, Serialize)]
struct CompletePickupResponse {
    pickup: PickupRequest,
    award: PointsTransaction,
    balance: i64,
}

/// Marks a scheduled pickup completed and awards accrued points. The status
/// transition guard makes completion (and its award) single-shot.
async fn complete_pickup(
    State(state): State<AppState>,
    Path((user_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CompletePickupResponse>, PickupsError> {
    let pickup = PickupRequest::mark_completed(&state.pool, id, user_id)
        .await
        .map_err(PickupsError::Database)?
        .ok_or(PickupsError::NotFound("Scheduled pickup"))?;

    let points = accrual::accrual_for(pickup.category, pickup.bag_count);

    let ledger = Ledger::new(PgLedgerStore::new(state.pool.clone()), state.tiers.clone());
    let award = ledger
        .award_points(user_id, points, "pickup completed", Some(pickup.id))
        .await
        .map_err(PickupsError::Ledger)?;
    let balance = ledger.balance(user_id).await.map_err(PickupsError::Ledger)?;

    if let Some(completed_at) = pickup.completed_at {
        LocationRecord::touch_last_pickup(&state.pool, pickup.location_id, user_id, completed_at)
            .await
            .map_err(PickupsError::Database)?;
    }

    tracing::info!(pickup_id = %pickup.id, points, balance, "Pickup completed");

    Ok(Json(CompletePickupResponse {
        pickup,
        award,
        balance,
    }))
}

async fn cancel_pickup(
    State(state): State<AppState>,
    Path((user_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<PickupRequest>, PickupsError> {
    let pickup = PickupRequest::mark_cancelled(&state.pool, id, user_id)
        .await
        .map_err(PickupsError::Database)?
        .ok_or(PickupsError::NotFound("Scheduled pickup"))?;

    Ok(Json(pickup))
}

#[derive(Debug, Deserialize)]
struct RegisterBagsRequest {
    category: WasteCategory,
    bag_count: i32,
}

#[derive(Debug, Serialize)]
struct RegisterBagsResponse {
    registration: BagRegistration,
    award: PointsTransaction,
    balance: i64,
}

async fn register_bags(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<RegisterBagsRequest>,
) -> Result<(StatusCode, Json<RegisterBagsResponse>), PickupsError> {
    if request.bag_count < 1 {
        return Err(PickupsError::Validation(
            "bag_count must be at least 1".to_string(),
        ));
    }

    let registration =
        BagRegistration::create(&state.pool, user_id, request.category, request.bag_count)
            .await
            .map_err(PickupsError::Database)?;

    let points = accrual::accrual_for(request.category, request.bag_count);

    let ledger = Ledger::new(PgLedgerStore::new(state.pool.clone()), state.tiers.clone());
    let award = ledger
        .award_points(user_id, points, "bag registration", None)
        .await
        .map_err(PickupsError::Ledger)?;
    let balance = ledger.balance(user_id).await.map_err(PickupsError::Ledger)?;

    tracing::info!(registration_id = %registration.id, points, "Bags registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterBagsResponse {
            registration,
            award,
            balance,
        }),
    ))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/users/:user_id/pickups",
            get(list_pickups).post(schedule_pickup),
        )
        .route("/users/:user_id/pickups/:id/complete", post(complete_pickup))
        .route("/users/:user_id/pickups/:id/cancel", post(cancel_pickup))
        .route("/users/:user_id/bags", post(register_bags))
}
