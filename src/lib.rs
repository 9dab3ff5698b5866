//! Civic Ledger
//!
//! Verification, reputation and token ledger service for civic issue
//! reporting. Citizens report issues, the community votes, an image
//! classifier weighs in, and verified reports earn XP that can be converted
//! into tokens and withdrawn to a wallet.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── lib.rs         - Crate root with re-exports
//! ├── main.rs        - Server entrypoint
//! ├── config.rs      - Configuration management
//! ├── error.rs       - Error taxonomy
//! ├── service.rs     - Component wiring and startup restore
//! ├── audit.rs       - Bounded audit log
//! ├── issues/        - Issue lifecycle
//! │   ├── models.rs     - Issues, votes, classifier results
//! │   ├── aggregator.rs - Confidence aggregation
//! │   └── lifecycle.rs  - Submission, voting and transitions
//! ├── reputation/    - XP and levels
//! │   ├── score.rs       - Records, XP schedule, level curve
//! │   ├── manager.rs     - Reputation engine
//! │   └── leaderboard.rs - Windowed rankings
//! ├── ledger/        - Points to tokens
//! │   ├── accounts.rs - Accounts, transactions, fixed-point amounts
//! │   └── client.rs   - Idempotent convert and withdraw
//! ├── external/      - Classifier and signer clients
//! ├── api/           - HTTP API endpoints and middleware
//! └── database/      - PostgreSQL persistence
//! ```

pub mod api;
pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod external;
pub mod issues;
pub mod ledger;
pub mod reputation;
pub mod service;

// Re-export main types for convenience
pub use audit::{AuditEntry, AuditEventType, AuditLogger, AuditSeverity};
pub use config::CivicConfig;
pub use error::{CoreError, Result};
pub use issues::{
    AdminDecision, AggregatorPolicy, AiResult, Category, Issue, IssueFilter, IssueId, IssueLifecycle,
    IssueStatus, IssueSubmission, Severity, VoteDirection,
};
pub use ledger::{Balance, LedgerTransaction, TokenAmount, TokenLedger, TransactionStatus};
pub use reputation::{
    Leaderboard, LeaderboardRanker, LeaderboardWindow, LevelCurve, ReputationEngine, ReputationView,
    Role, XpSchedule,
};
pub use service::{CivicService, ServiceSettings};
