// Services module - Business logic

pub mod accrual;
pub mod ledger;
pub mod reconciler;
