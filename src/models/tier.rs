use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum TierConfigError {
    #[error("Tier table is empty")]
    Empty,

    #[error("First tier threshold must be 0, got {0}")]
    NonZeroFirst(i64),

    #[error("Tier thresholds must be strictly increasing ({0} is not above {1})")]
    NotIncreasing(i64, i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardTier {
    pub name: String,
    pub points_threshold: i64,
}

/// Ordered tier reference data. Thresholds are validated once at
/// construction, so lookups never need a tie-break.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTable {
    tiers: Vec<RewardTier>,
}

impl TierTable {
    pub fn new(tiers: Vec<RewardTier>) -> Result<Self, TierConfigError> {
        let first = tiers.first().ok_or(TierConfigError::Empty)?;
        if first.points_threshold != 0 {
            return Err(TierConfigError::NonZeroFirst(first.points_threshold));
        }

        for pair in tiers.windows(2) {
            if pair[1].points_threshold <= pair[0].points_threshold {
                return Err(TierConfigError::NotIncreasing(
                    pair[1].points_threshold,
                    pair[0].points_threshold,
                ));
            }
        }

        Ok(Self { tiers })
    }

    /// The tier with the greatest threshold at or below `balance`
    pub fn tier_for(&self, balance: i64) -> &RewardTier {
        self.tiers
            .iter()
            .rev()
            .find(|t| t.points_threshold <= balance)
            .unwrap_or(&self.tiers[0])
    }

    /// The next tier above `balance`, if any
    pub fn next_tier(&self, balance: i64) -> Option<&RewardTier> {
        self.tiers.iter().find(|t| t.points_threshold > balance)
    }

    pub fn tiers(&self) -> &[RewardTier] {
        &self.tiers
    }
}

impl Default for TierTable {
    fn default() -> Self {
        let tiers = [
            ("Eco Starter", 0),
            ("Eco Guardian", 100),
            ("Eco Champion", 400),
            ("Eco Hero", 1200),
            ("Planet Protector", 3000),
        ]
        .into_iter()
        .map(|(name, points_threshold)| RewardTier {
            name: name.to_string(),
            points_threshold,
        })
        .collect();

        Self::new(tiers).expect("default tier table is valid")
    }
}
