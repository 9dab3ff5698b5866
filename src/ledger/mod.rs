//! Token Ledger Module
//!
//! Strictly accounted points to token conversion and token withdrawal.
//!
//! ## Transaction Types
//!
//! - Convert: debits earned points, credits tokens at the conversion rate.
//!   Committed immediately.
//! - Withdraw: reserves tokens (PENDING), then the external signer settles it
//!   (COMMITTED) or refuses it (FAILED, reservation released).
//!
//! Idempotency keys are scoped per account. The transaction id is derived
//! from the user and key, so a resubmitted withdrawal reaches the signer with
//! the same id.

pub mod accounts;
pub mod client;

pub use accounts::*;
pub use client::*;
