// API module - HTTP endpoints

pub mod health;
pub mod locations;
pub mod middleware;
pub mod pickups;
pub mod rewards;

use axum::extract::FromRef;
use sqlx::PgPool;

use crate::config::Config;
use crate::models::tier::TierTable;

/// Application state shared across routers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub tiers: TierTable,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.pool.clone()
    }
}
