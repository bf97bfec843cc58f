use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::category::WasteCategory;

/// Audit row for a batch of bags registered outside a pickup; the matching
/// point award lives in the points log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BagRegistration {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category: WasteCategory,
    pub bag_count: i32,
    pub created_at: DateTime<Utc>,
}

impl BagRegistration {
    pub async fn create(
        pool: &PgPool,
        user_id: Uuid,
        category: WasteCategory,
        bag_count: i32,
    ) -> Result<Self, sqlx::Error> {
        let registration = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO bag_registrations (user_id, category, bag_count)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(category)
        .bind(bag_count)
        .fetch_one(pool)
        .await?;

        Ok(registration)
    }

    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        let registrations = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM bag_registrations WHERE user_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;

        Ok(registrations)
    }
}
