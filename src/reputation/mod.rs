//! Reputation and leaderboard
//!
//! Lifecycle transitions emit events that the engine turns into XP awards.
//! The leaderboard ranks users from a snapshot of engine state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌───────────────────┐     ┌────────────────────┐
//! │ ReputationEvent  │────►│ ReputationEngine  │────►│ LeaderboardRanker  │
//! │ (lifecycle)      │     │ (plan / commit)   │     │ (snapshot + cache) │
//! └──────────────────┘     └───────────────────┘     └────────────────────┘
//!                                  │
//!                                  ▼
//!                          ┌──────────────────┐
//!                          │ TokenLedger      │
//!                          │ (earned points,  │
//!                          │  read only)      │
//!                          └──────────────────┘
//! ```
//!
//! ## XP Model
//!
//! - Submit +10, verified +25 (+15 when only the classifier decided)
//! - +5 per upvote that leaves a verified issue net-positive, once per voter
//! - XP never decreases; levels are computed from XP on every read

pub mod leaderboard;
mod manager;
mod score;

pub use leaderboard::{Leaderboard, LeaderboardEntry, LeaderboardRanker, LeaderboardWindow};
pub use manager::{ReputationEngine, ReputationSnapshot};
pub use score::{
    AwardKind, LevelCurve, ReputationEvent, ReputationEventKind, ReputationRecord, ReputationView,
    Role, XpAward, XpSchedule,
};
