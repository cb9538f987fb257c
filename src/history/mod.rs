pub mod client;
pub mod reconciler;
pub mod timeline;

pub use client::{HistorySource, RestHistoryClient};
pub use reconciler::{HistoryReconciler, MergeOutcome};
pub use timeline::{Timeline, TimelineEntry};
