//! Civic issues
//!
//! - `models`: issues, votes, classifier results and transition history
//! - `aggregator`: blends classifier confidence with community votes
//! - `lifecycle`: owns issues and drives PENDING → VERIFIED / REJECTED

pub mod aggregator;
pub mod lifecycle;
pub mod models;

pub use aggregator::{AggregatorPolicy, DecisionBasis, Recommendation, Verdict};
pub use lifecycle::{AdminDecision, IssueLifecycle, LifecycleConfig};
pub use models::*;
