//! Rewards ledger.
//!
//! Balances are always derived by summing the append-only points log, never
//! cached, so reads cannot drift from history. The only compound write is a
//! redemption: its redemption row and negative debit commit in one database
//! transaction or not at all.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::points_transaction::{CreateTransactionData, PointsTransaction};
use crate::models::reward::{RedemptionRecord, Reward};
use crate::models::tier::{RewardTier, TierTable};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Raised inside the redemption transaction when a concurrent debit
    /// drained the balance between the caller's check and the commit
    #[error("Balance {balance} is below the redemption cost")]
    InsufficientBalance { balance: i64 },
}

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("Point award must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("Reward not found or inactive")]
    RewardNotFound,

    #[error("Insufficient points: short by {shortfall}")]
    InsufficientPoints { shortfall: i64 },

    #[error("Ledger store error: {0}")]
    Store(#[from] StoreError),
}

/// Storage seam for the ledger. The production implementation is
/// [`PgLedgerStore`]; tests use an in-memory store with the same
/// all-or-nothing redemption contract.
#[allow(async_fn_in_trait)]
pub trait LedgerStore {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError>;

    async fn append(&self, data: CreateTransactionData)
        -> Result<PointsTransaction, StoreError>;

    async fn find_active_reward(&self, reward_id: Uuid) -> Result<Option<Reward>, StoreError>;

    /// Writes the redemption row and its matching debit atomically. Must
    /// re-check the balance inside the transaction and leave no artifact on
    /// failure.
    async fn commit_redemption(
        &self,
        user_id: Uuid,
        reward: &Reward,
    ) -> Result<(RedemptionRecord, PointsTransaction), StoreError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TierProgress {
    pub current: RewardTier,
    pub next: Option<RewardTier>,
    pub percent: u8,
}

#[derive(Debug, Serialize)]
pub struct RedemptionOutcome {
    pub record: RedemptionRecord,
    pub debit: PointsTransaction,
    pub balance: i64,
    pub progress: TierProgress,
}

#[derive(Debug, Clone)]
pub struct Ledger<S> {
    store: S,
    tiers: TierTable,
}

impl<S: LedgerStore> Ledger<S> {
    pub fn new(store: S, tiers: TierTable) -> Self {
        Self { store, tiers }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64, LedgerError> {
        Ok(self.store.balance(user_id).await?)
    }

    pub fn tier_for(&self, balance: i64) -> &RewardTier {
        self.tiers.tier_for(balance)
    }

    /// Progress toward the next tier. At or above the top tier the caller
    /// gets `next: None` and a full bar.
    pub fn progress(&self, balance: i64) -> TierProgress {
        let current = self.tiers.tier_for(balance).clone();
        let next = self.tiers.next_tier(balance).cloned();

        let percent = match &next {
            None => 100,
            Some(next) => {
                let span = next.points_threshold - current.points_threshold;
                let gained = balance - current.points_threshold;
                let raw = (100.0 * gained as f64 / span as f64).round() as i64;
                raw.clamp(0, 100) as u8
            }
        };

        TierProgress {
            current,
            next,
            percent,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn award_points(
        &self,
        user_id: Uuid,
        points: i64,
        reason: &str,
        related_request_id: Option<Uuid>,
    ) -> Result<PointsTransaction, LedgerError> {
        if points <= 0 {
            return Err(LedgerError::InvalidAmount(points));
        }

        let tx = self
            .store
            .append(CreateTransactionData {
                user_id,
                points,
                reason: reason.to_string(),
                related_request_id,
            })
            .await?;

        tracing::info!(transaction_id = %tx.id, points, reason, "Points awarded");

        Ok(tx)
    }

    #[tracing::instrument(skip(self))]
    pub async fn redeem(
        &self,
        user_id: Uuid,
        reward_id: Uuid,
    ) -> Result<RedemptionOutcome, LedgerError> {
        let reward = self
            .store
            .find_active_reward(reward_id)
            .await?
            .ok_or(LedgerError::RewardNotFound)?;

        let balance = self.store.balance(user_id).await?;
        if balance < reward.points_cost {
            return Err(LedgerError::InsufficientPoints {
                shortfall: reward.points_cost - balance,
            });
        }

        let (record, debit) = match self.store.commit_redemption(user_id, &reward).await {
            Ok(pair) => pair,
            Err(StoreError::InsufficientBalance { balance }) => {
                return Err(LedgerError::InsufficientPoints {
                    shortfall: reward.points_cost - balance,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let balance = self.store.balance(user_id).await?;
        let progress = self.progress(balance);

        tracing::info!(
            redemption_id = %record.id,
            points_spent = record.points_spent,
            balance,
            "Reward redeemed"
        );

        Ok(RedemptionOutcome {
            record,
            debit,
            balance,
            progress,
        })
    }
}

/// Postgres-backed store; models own the SQL.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl LedgerStore for PgLedgerStore {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(PointsTransaction::balance_for_user(&self.pool, user_id).await?)
    }

    async fn append(
        &self,
        data: CreateTransactionData,
    ) -> Result<PointsTransaction, StoreError> {
        Ok(PointsTransaction::create(&self.pool, data).await?)
    }

    async fn find_active_reward(&self, reward_id: Uuid) -> Result<Option<Reward>, StoreError> {
        Ok(Reward::find_active_by_id(&self.pool, reward_id).await?)
    }

    async fn commit_redemption(
        &self,
        user_id: Uuid,
        reward: &Reward,
    ) -> Result<(RedemptionRecord, PointsTransaction), StoreError> {
        let mut db_tx = self.pool.begin().await?;

        // Re-check inside the transaction; a concurrent redemption may have
        // spent the balance since the caller looked.
        let (balance,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(points), 0) FROM points_transactions WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *db_tx)
        .await?;

        if balance < reward.points_cost {
            db_tx.rollback().await?;
            return Err(StoreError::InsufficientBalance { balance });
        }

        let record =
            RedemptionRecord::create_in_tx(&mut db_tx, user_id, reward.id, reward.points_cost)
                .await?;

        let debit = PointsTransaction::create_in_tx(
            &mut db_tx,
            CreateTransactionData {
                user_id,
                points: -reward.points_cost,
                reason: format!("redemption: {}", reward.name),
                related_request_id: None,
            },
        )
        .await?;

        db_tx.commit().await?;

        Ok((record, debit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::reward::RedemptionStatus;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryInner {
        transactions: Vec<PointsTransaction>,
        rewards: HashMap<Uuid, Reward>,
        redemptions: Vec<RedemptionRecord>,
    }

    /// In-memory store honoring the same all-or-nothing redemption contract
    /// as the Postgres implementation.
    #[derive(Default)]
    struct MemoryLedgerStore {
        inner: Mutex<MemoryInner>,
        fail_commit: AtomicBool,
    }

    impl MemoryLedgerStore {
        fn add_reward(&self, points_cost: i64, active: bool) -> Uuid {
            let id = Uuid::new_v4();
            self.inner.lock().unwrap().rewards.insert(
                id,
                Reward {
                    id,
                    name: format!("reward-{points_cost}"),
                    points_cost,
                    active,
                    created_at: Utc::now(),
                },
            );
            id
        }

        fn redemption_count(&self) -> usize {
            self.inner.lock().unwrap().redemptions.len()
        }

        fn transaction_count(&self) -> usize {
            self.inner.lock().unwrap().transactions.len()
        }
    }

    impl LedgerStore for MemoryLedgerStore {
        async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .transactions
                .iter()
                .filter(|t| t.user_id == user_id)
                .map(|t| t.points)
                .sum())
        }

        async fn append(
            &self,
            data: CreateTransactionData,
        ) -> Result<PointsTransaction, StoreError> {
            let tx = PointsTransaction {
                id: Uuid::new_v4(),
                user_id: data.user_id,
                points: data.points,
                reason: data.reason,
                related_request_id: data.related_request_id,
                created_at: Utc::now(),
            };
            self.inner.lock().unwrap().transactions.push(tx.clone());
            Ok(tx)
        }

        async fn find_active_reward(
            &self,
            reward_id: Uuid,
        ) -> Result<Option<Reward>, StoreError> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.rewards.get(&reward_id).filter(|r| r.active).cloned())
        }

        async fn commit_redemption(
            &self,
            user_id: Uuid,
            reward: &Reward,
        ) -> Result<(RedemptionRecord, PointsTransaction), StoreError> {
            if self.fail_commit.load(Ordering::SeqCst) {
                // Simulated mid-commit failure: nothing written
                return Err(StoreError::Database(sqlx::Error::PoolClosed));
            }

            let mut inner = self.inner.lock().unwrap();

            let balance: i64 = inner
                .transactions
                .iter()
                .filter(|t| t.user_id == user_id)
                .map(|t| t.points)
                .sum();
            if balance < reward.points_cost {
                return Err(StoreError::InsufficientBalance { balance });
            }

            let record = RedemptionRecord {
                id: Uuid::new_v4(),
                user_id,
                reward_id: reward.id,
                points_spent: reward.points_cost,
                status: RedemptionStatus::Pending,
                created_at: Utc::now(),
            };
            let debit = PointsTransaction {
                id: Uuid::new_v4(),
                user_id,
                points: -reward.points_cost,
                reason: format!("redemption: {}", reward.name),
                related_request_id: None,
                created_at: Utc::now(),
            };

            inner.redemptions.push(record.clone());
            inner.transactions.push(debit.clone());

            Ok((record, debit))
        }
    }

    fn ledger() -> Ledger<MemoryLedgerStore> {
        Ledger::new(MemoryLedgerStore::default(), TierTable::default())
    }

    #[tokio::test]
    async fn test_balance_is_commutative_sum() {
        let user = Uuid::new_v4();
        let amounts = [15, 40, 5, 100, 25];

        let forward = ledger();
        for p in amounts {
            forward.award_points(user, p, "pickup completed", None).await.unwrap();
        }

        let reverse = ledger();
        for p in amounts.iter().rev() {
            reverse.award_points(user, *p, "pickup completed", None).await.unwrap();
        }

        let expected: i64 = amounts.iter().sum();
        assert_eq!(forward.balance(user).await.unwrap(), expected);
        assert_eq!(reverse.balance(user).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_award_rejects_non_positive_amounts() {
        let ledger = ledger();
        let user = Uuid::new_v4();

        for bad in [0, -10] {
            let err = ledger.award_points(user, bad, "bag registration", None).await;
            assert!(matches!(err, Err(LedgerError::InvalidAmount(p)) if p == bad));
        }
        assert_eq!(ledger.balance(user).await.unwrap(), 0);
    }

    #[test]
    fn test_progress_bounds_across_balances() {
        let ledger = ledger();
        for balance in (0..5000).step_by(7) {
            let progress = ledger.progress(balance);
            assert!(progress.percent <= 100);
        }
        // Top tier: full bar, no next
        let top = ledger.progress(3000);
        assert!(top.next.is_none());
        assert_eq!(top.percent, 100);
    }

    #[test]
    fn test_progress_midway_between_tiers() {
        let ledger = ledger();
        // Eco Guardian (100) -> Eco Champion (400): 250 is exactly halfway
        let progress = ledger.progress(250);
        assert_eq!(progress.current.name, "Eco Guardian");
        assert_eq!(progress.next.as_ref().unwrap().name, "Eco Champion");
        assert_eq!(progress.percent, 50);
    }

    #[tokio::test]
    async fn test_award_then_redeem_scenario() {
        let store = MemoryLedgerStore::default();
        let reward_id = store.add_reward(100, true);
        let ledger = Ledger::new(store, TierTable::default());
        let user = Uuid::new_v4();

        ledger
            .award_points(user, 150, "pickup completed", None)
            .await
            .unwrap();
        assert_eq!(ledger.balance(user).await.unwrap(), 150);
        assert_eq!(ledger.tier_for(150).name, "Eco Guardian");

        let outcome = ledger.redeem(user, reward_id).await.unwrap();
        assert_eq!(outcome.record.points_spent, 100);
        assert_eq!(outcome.balance, 50);
        assert_eq!(outcome.progress.current.name, "Eco Starter");
    }

    #[tokio::test]
    async fn test_insufficient_points_reports_shortfall() {
        let store = MemoryLedgerStore::default();
        let reward_id = store.add_reward(50, true);
        let ledger = Ledger::new(store, TierTable::default());
        let user = Uuid::new_v4();

        ledger
            .award_points(user, 40, "bag registration", None)
            .await
            .unwrap();

        let err = ledger.redeem(user, reward_id).await;
        assert!(matches!(
            err,
            Err(LedgerError::InsufficientPoints { shortfall: 10 })
        ));

        // Nothing was written
        assert_eq!(ledger.balance(user).await.unwrap(), 40);
        assert_eq!(ledger.store.redemption_count(), 0);
    }

    #[tokio::test]
    async fn test_redeem_inactive_reward_not_found() {
        let store = MemoryLedgerStore::default();
        let reward_id = store.add_reward(10, false);
        let ledger = Ledger::new(store, TierTable::default());
        let user = Uuid::new_v4();

        ledger.award_points(user, 100, "pickup completed", None).await.unwrap();

        let err = ledger.redeem(user, reward_id).await;
        assert!(matches!(err, Err(LedgerError::RewardNotFound)));
    }

    #[tokio::test]
    async fn test_redemption_atomicity_on_success_and_failure() {
        let store = MemoryLedgerStore::default();
        let reward_id = store.add_reward(30, true);
        let ledger = Ledger::new(store, TierTable::default());
        let user = Uuid::new_v4();

        ledger.award_points(user, 100, "pickup completed", None).await.unwrap();
        let before_tx = ledger.store.transaction_count();

        // Failed commit leaves neither a redemption row nor a debit
        ledger.store.fail_commit.store(true, Ordering::SeqCst);
        assert!(ledger.redeem(user, reward_id).await.is_err());
        assert_eq!(ledger.store.redemption_count(), 0);
        assert_eq!(ledger.store.transaction_count(), before_tx);
        assert_eq!(ledger.balance(user).await.unwrap(), 100);

        // Successful commit writes exactly one of each
        ledger.store.fail_commit.store(false, Ordering::SeqCst);
        let outcome = ledger.redeem(user, reward_id).await.unwrap();
        assert_eq!(ledger.store.redemption_count(), 1);
        assert_eq!(ledger.store.transaction_count(), before_tx + 1);
        assert_eq!(outcome.debit.points, -30);
        assert_eq!(ledger.balance(user).await.unwrap(), 70);
    }
}
