//! Lease and done-marker protocol shared by every client of one namespace.

mod keys;
mod lease;
mod lock_coordinator;
mod range;
mod range_selector;

pub use keys::KeyLayout;
pub use lease::{DoneRecord, LeasePayload};
pub use lock_coordinator::{
    AcquireOutcome, CoordinationError, LeasePolicy, LockCoordinator, MarkDoneOutcome,
    RangeProgressRecord, RangeStatus, ReleaseOutcome, RenewOutcome,
};
pub use range::Range;
pub use range_selector::{
    choose, freshness_score, RangeSelector, ScoredRange, SelectionOutcome, SelectorConfig,
};

#[cfg(test)]
mod tests;
