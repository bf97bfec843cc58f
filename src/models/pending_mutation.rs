use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::LocationData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
    /// Compound unset-then-set of the user's default, applied atomically at
    /// drain time rather than as two independent updates
    SetDefault,
}

/// One queued offline change to a location record. `seq` is a device-local
/// counter; mutations for the same record id are never reordered relative to
/// each other. `updated_at` is the device clock at the moment of the edit
/// and drives last-write-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMutation {
    pub record_id: Uuid,
    pub op: MutationOp,
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
    /// Record payload; absent for deletes and set-defaults
    pub data: Option<LocationData>,
}

impl PendingMutation {
    pub fn create(record_id: Uuid, seq: u64, data: LocationData) -> Self {
        Self {
            record_id,
            op: MutationOp::Create,
            seq,
            updated_at: Utc::now(),
            data: Some(data),
        }
    }

    pub fn update(record_id: Uuid, seq: u64, data: LocationData) -> Self {
        Self {
            record_id,
            op: MutationOp::Update,
            seq,
            updated_at: Utc::now(),
            data: Some(data),
        }
    }

    pub fn delete(record_id: Uuid, seq: u64) -> Self {
        Self {
            record_id,
            op: MutationOp::Delete,
            seq,
            updated_at: Utc::now(),
            data: None,
        }
    }

    pub fn set_default(record_id: Uuid, seq: u64) -> Self {
        Self {
            record_id,
            op: MutationOp::SetDefault,
            seq,
            updated_at: Utc::now(),
            data: None,
        }
    }
}
