//! Turning backend responses into render features.

pub mod aggregation;
pub mod exact;

pub use aggregation::{aggregate_request, aggregation_precision, merge_aggregation};
pub use exact::{ExactMerge, merge_exact, search_request};
