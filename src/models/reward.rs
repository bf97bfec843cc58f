use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reward {
    pub id: Uuid,
    pub name: String,
    pub points_cost: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "redemption_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RedemptionStatus {
    Pending,
    Fulfilled,
    Cancelled,
}

/// A reward claimed against the points balance. `points_spent` freezes the
/// reward's cost at redemption time; later catalog price changes do not
/// rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RedemptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reward_id: Uuid,
    pub points_spent: i64,
    pub status: RedemptionStatus,
    pub created_at: DateTime<Utc>,
}

impl Reward {
    /// Finds a reward that is still redeemable. Inactive rewards are treated
    /// the same as missing ones.
    pub async fn find_active_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let reward = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM rewards WHERE id = $1 AND active
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(reward)
    }

    /// Lists the redeemable catalog, cheapest first
    pub async fn list_active(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        let rewards = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM rewards WHERE active ORDER BY points_cost ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(rewards)
    }
}

impl RedemptionRecord {
    /// Inserts a pending redemption inside an open database transaction; the
    /// matching debit must be written in the same transaction
    pub async fn create_in_tx(
        db_tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        reward_id: Uuid,
        points_spent: i64,
    ) -> Result<Self, sqlx::Error> {
        let record = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO redemptions (user_id, reward_id, points_spent, status)
            VALUES ($1, $2, $3, 'pending')
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(reward_id)
        .bind(points_spent)
        .fetch_one(&mut **db_tx)
        .await?;

        Ok(record)
    }

    /// Lists a user's redemptions, newest first
    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        let records = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM redemptions WHERE user_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;

        Ok(records)
    }
}
