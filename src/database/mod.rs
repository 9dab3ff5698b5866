//! PostgreSQL Database Module
//!
//! Durable storage for issues, reputation awards and ledger transactions.
//! The in-memory components remain the source of truth while running; the
//! database is written before each change is published and read back on
//! startup.

pub mod issues;
pub mod ledger;
pub mod pool;
pub mod reputation;

pub use issues::IssueRepository;
pub use ledger::LedgerRepository;
pub use pool::DatabasePool;
pub use reputation::ReputationRepository;
