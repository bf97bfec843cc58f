// Models module - Database entity representations

pub mod bag;
pub mod category;
pub mod location;
pub mod pending_mutation;
pub mod pickup;
pub mod points_transaction;
pub mod reward;
pub mod tier;

pub use bag::BagRegistration;
pub use category::WasteCategory;
pub use location::{LocationData, LocationRecord, LocationType};
pub use pending_mutation::{MutationOp, PendingMutation};
pub use pickup::{PickupRequest, PickupStatus};
pub use points_transaction::PointsTransaction;
pub use reward::{RedemptionRecord, RedemptionStatus, Reward};
pub use tier::{RewardTier, TierTable};
