use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "location_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LocationType {
    Home,
    Work,
    School,
    Other,
}

/// A saved pickup address. Ids are generated by the client so a record keeps
/// the same identity whether it was first written online or while offline.
/// Deletion is a soft flag; reconciliation needs tombstones to tell "deleted
/// on the server" apart from "never existed".
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LocationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location_type: LocationType,
    pub is_default: bool,
    pub notes: Option<String>,
    pub pickup_instructions: Option<String>,
    pub last_pickup_date: Option<DateTime<Utc>>,
    pub photo_ref: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationData {
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location_type: LocationType,
    pub notes: Option<String>,
    pub pickup_instructions: Option<String>,
    pub photo_ref: Option<String>,
}

impl LocationData {
    /// Boundary validation; failures here are permanent and never queued
    /// for retry.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("location name is required".to_string());
        }
        if self.address.trim().is_empty() {
            return Err("location address is required".to_string());
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err("latitude out of range".to_string());
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err("longitude out of range".to_string());
        }
        Ok(())
    }
}

impl LocationRecord {
    /// Inserts a record with a client-supplied id. If the id already exists
    /// (a create replayed after a half-finished sync) the row is refreshed
    /// instead, keeping replays idempotent.
    pub async fn upsert(
        pool: &PgPool,
        id: Uuid,
        user_id: Uuid,
        data: &LocationData,
    ) -> Result<Self, sqlx::Error> {
        let record = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO locations
                (id, user_id, name, address, latitude, longitude, location_type,
                 notes, pickup_instructions, photo_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                address = EXCLUDED.address,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                location_type = EXCLUDED.location_type,
                notes = EXCLUDED.notes,
                pickup_instructions = EXCLUDED.pickup_instructions,
                photo_ref = EXCLUDED.photo_ref,
                is_deleted = FALSE,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(&data.name)
        .bind(&data.address)
        .bind(data.latitude)
        .bind(data.longitude)
        .bind(data.location_type)
        .bind(&data.notes)
        .bind(&data.pickup_instructions)
        .bind(&data.photo_ref)
        .fetch_one(pool)
        .await?;

        Ok(record)
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let record = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM locations WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(record)
    }

    /// Lists the user's live (not soft-deleted) locations, default first
    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        let records = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM locations
            WHERE user_id = $1 AND NOT is_deleted
            ORDER BY is_default DESC, created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;

        Ok(records)
    }

    /// Applies an update only if `client_updated_at` is not older than the
    /// stored row (last-write-wins). Returns the row when the write landed,
    /// None when the server copy was newer and wins.
    pub async fn update_lww(
        pool: &PgPool,
        id: Uuid,
        user_id: Uuid,
        data: &LocationData,
        client_updated_at: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error> {
        let record = sqlx::query_as::<_, Self>(
            r#"
            UPDATE locations SET
                name = $4,
                address = $5,
                latitude = $6,
                longitude = $7,
                location_type = $8,
                notes = $9,
                pickup_instructions = $10,
                photo_ref = $11,
                updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND NOT is_deleted AND updated_at <= $3
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(client_updated_at)
        .bind(&data.name)
        .bind(&data.address)
        .bind(data.latitude)
        .bind(data.longitude)
        .bind(data.location_type)
        .bind(&data.notes)
        .bind(&data.pickup_instructions)
        .bind(&data.photo_ref)
        .fetch_optional(pool)
        .await?;

        Ok(record)
    }

    /// Soft-deletes a record, leaving a tombstone for reconciliation.
    /// Returns false when no live row matched.
    pub async fn soft_delete(pool: &PgPool, id: Uuid, user_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE locations
            SET is_deleted = TRUE, is_default = FALSE, updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND NOT is_deleted
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Makes `id` the user's only default. Unset and set run in one database
    /// transaction so no interleaving can observe zero or two defaults.
    pub async fn set_default(pool: &PgPool, id: Uuid, user_id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let mut db_tx = pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE locations
            SET is_default = FALSE, updated_at = NOW()
            WHERE user_id = $1 AND is_default AND id <> $2
            "#,
        )
        .bind(user_id)
        .bind(id)
        .execute(&mut *db_tx)
        .await?;

        let record = sqlx::query_as::<_, Self>(
            r#"
            UPDATE locations
            SET is_default = TRUE, updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND NOT is_deleted
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&mut *db_tx)
        .await?;

        match record {
            Some(record) => {
                db_tx.commit().await?;
                Ok(Some(record))
            }
            None => {
                // Target missing or deleted: keep the existing default intact
                db_tx.rollback().await?;
                Ok(None)
            }
        }
    }

    /// Stamps the last completed pickup onto the location
    pub async fn touch_last_pickup(
        pool: &PgPool,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE locations SET last_pickup_date = $3, updated_at = NOW()
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(at)
        .execute(pool)
        .await?;

        Ok(())
    }
}
