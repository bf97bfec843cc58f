use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::category::WasteCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "pickup_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PickupStatus {
    Scheduled,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PickupRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub location_id: Uuid,
    pub category: WasteCategory,
    pub bag_count: i32,
    pub status: PickupStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreatePickupData {
    pub user_id: Uuid,
    pub location_id: Uuid,
    pub category: WasteCategory,
    pub bag_count: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl PickupRequest {
    pub async fn create(pool: &PgPool, data: CreatePickupData) -> Result<Self, sqlx::Error> {
        let pickup = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO pickup_requests (user_id, location_id, category, bag_count, scheduled_for)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(data.user_id)
        .bind(data.location_id)
        .bind(data.category)
        .bind(data.bag_count)
        .bind(data.scheduled_for)
        .fetch_one(pool)
        .await?;

        Ok(pickup)
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let pickup = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM pickup_requests WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(pickup)
    }

    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        let pickups = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM pickup_requests WHERE user_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;

        Ok(pickups)
    }

    /// Marks a scheduled pickup completed. Returns None when the pickup is
    /// missing or already left the scheduled state, so completion (and its
    /// point award) cannot run twice.
    pub async fn mark_completed(
        pool: &PgPool,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let pickup = sqlx::query_as::<_, Self>(
            r#"
            UPDATE pickup_requests
            SET status = 'completed', completed_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status = 'scheduled'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(pickup)
    }

    pub async fn mark_cancelled(
        pool: &PgPool,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let pickup = sqlx::query_as::<_, Self>(
            r#"
            UPDATE pickup_requests
            SET status = 'cancelled'
            WHERE id = $1 AND user_id = $2 AND status = 'scheduled'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(pickup)
    }
}
