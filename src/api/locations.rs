use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::AppError;
use crate::models::location::{LocationData, LocationRecord};
use crate::models::pending_mutation::PendingMutation;
use crate::services::reconciler::{drain, PgRemoteLocations, RetryPolicy, SyncReport};

async fn list_locations(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<LocationRecord>>, AppError> {
    let locations = LocationRecord::list_for_user(&state.pool, user_id)
        .await
        .map_err(AppError::Database)?;

    Ok(Json(locations))
}

#[derive(Debug, Deserialize)]
struct CreateLocationRequest {
    /// Client-generated id; assigned server-side when absent
    id: Option<Uuid>,
    #[serde(flatten)]
    data: LocationData,
}

async fn create_location(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<CreateLocationRequest>,
) -> Result<(StatusCode, Json<LocationRecord>), AppError> {
    request.data.validate().map_err(AppError::Validation)?;

    let id = request.id.unwrap_or_else(Uuid::new_v4);
    let record = LocationRecord::upsert(&state.pool, id, user_id, &request.data)
        .await
        .map_err(AppError::Database)?;

    tracing::info!(location_id = %record.id, "Location created");

    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_location(
    State(state): State<AppState>,
    Path((user_id, id)): Path<(Uuid, Uuid)>,
    Json(data): Json<LocationData>,
) -> Result<Json<LocationRecord>, AppError> {
    data.validate().map_err(AppError::Validation)?;

    // A direct online edit is the freshest write by definition
    let record = LocationRecord::update_lww(&state.pool, id, user_id, &data, Utc::now())
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound("Location not found".to_string()))?;

    Ok(Json(record))
}

async fn delete_location(
    State(state): State<AppState>,
    Path((user_id, id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    let deleted = LocationRecord::soft_delete(&state.pool, id, user_id)
        .await
        .map_err(AppError::Database)?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Location not found".to_string()))
    }
}

async fn set_default_location(
    State(state): State<AppState>,
    Path((user_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<LocationRecord>, AppError> {
    let record = LocationRecord::set_default(&state.pool, id, user_id)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound("Location not found".to_string()))?;

    tracing::info!(location_id = %record.id, "Default location changed");

    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    mutations: Vec<PendingMutation>,
}

/// Reconciles a client-held mutation queue against the database. The
/// response reports per-record outcomes; mutations listed as retryable
/// errors should stay queued on the device.
async fn sync_locations(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<SyncRequest>,
) -> Json<SyncReport> {
    let policy = RetryPolicy {
        max_attempts: state.config.sync_max_attempts,
        remote_timeout: Duration::from_secs(state.config.sync_remote_timeout_secs),
        ..RetryPolicy::default()
    };

    let remote = PgRemoteLocations::new(state.pool.clone());
    let (report, _remaining) = drain(&remote, user_id, request.mutations, &policy).await;

    Json(report)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/users/:user_id/locations",
            get(list_locations).post(create_location),
        )
        .route(
            "/users/:user_id/locations/sync",
            post(sync_locations),
        )
        .route(
            "/users/:user_id/locations/:id",
            put(update_location).delete(delete_location),
        )
        .route(
            "/users/:user_id/locations/:id/default",
            put(set_default_location),
        )
}
