use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

/// One entry in the append-only points log. Positive points are awards,
/// negative points are redemption debits. Rows are never updated or deleted;
/// a user's balance is always the sum of their rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PointsTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub points: i64,
    pub reason: String,
    pub related_request_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTransactionData {
    pub user_id: Uuid,
    pub points: i64,
    pub reason: String,
    pub related_request_id: Option<Uuid>,
}

impl PointsTransaction {
    /// Appends a transaction to the log
    pub async fn create(pool: &PgPool, data: CreateTransactionData) -> Result<Self, sqlx::Error> {
        let tx = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO points_transactions (user_id, points, reason, related_request_id)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(data.user_id)
        .bind(data.points)
        .bind(&data.reason)
        .bind(data.related_request_id)
        .fetch_one(pool)
        .await?;

        Ok(tx)
    }

    /// Appends a transaction inside an open database transaction, used for
    /// the redemption debit that must commit together with its redemption row
    pub async fn create_in_tx(
        db_tx: &mut Transaction<'_, Postgres>,
        data: CreateTransactionData,
    ) -> Result<Self, sqlx::Error> {
        let tx = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO points_transactions (user_id, points, reason, related_request_id)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(data.user_id)
        .bind(data.points)
        .bind(&data.reason)
        .bind(data.related_request_id)
        .fetch_one(&mut **db_tx)
        .await?;

        Ok(tx)
    }

    /// Sums the user's log. COALESCE keeps an empty history at zero.
    pub async fn balance_for_user(pool: &PgPool, user_id: Uuid) -> Result<i64, sqlx::Error> {
        let (balance,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(points), 0) FROM points_transactions WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        Ok(balance)
    }

    /// Lists the user's transactions, newest first
    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM points_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }
}
