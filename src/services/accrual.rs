//! Points accrual rules.
//!
//! Pure mapping from (waste category, bag count) to an integer point award,
//! shared by pickup completion and bag registration. No side effects; the
//! callers hand the result to the rewards ledger.

use crate::models::category::WasteCategory;

/// Per-bag point value for a category. Hazardous waste pays the most since
/// it needs a special handling run; general waste pays the floor rate.
pub fn per_bag_rate(category: WasteCategory) -> i64 {
    match category {
        WasteCategory::Hazardous => 30,
        WasteCategory::Plastic => 20,
        WasteCategory::Organic => 15,
        WasteCategory::Recyclable => 10,
        WasteCategory::Paper => 10,
        WasteCategory::General => 5,
    }
}

/// Points awarded for `bag_count` bags of `category`.
///
/// `bag_count` below 1 yields zero rather than a negative or padded award;
/// the HTTP boundary rejects such requests before they get here.
pub fn accrual_for(category: WasteCategory, bag_count: i32) -> i64 {
    if bag_count < 1 {
        return 0;
    }
    per_bag_rate(category) * i64::from(bag_count)
}
