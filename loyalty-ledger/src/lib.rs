//! Jewels Loyalty Ledger
//!
//! Append-only points ledger with FIFO lot consumption, time-based expiry
//! and a cached per-user summary.
//!
//! # Architecture
//!
//! - **Event Sourcing**: Balances are derived from immutable entries
//! - **Per-User Serialization**: One writer per user, users run in parallel
//! - **Computed Expiry**: Expired lots never count, swept or not
//! - **Atomic Projection**: Entry and summary commit in one RocksDB batch
//!
//! # Invariants
//!
//! - Conservation: earned == active + redeemed + expired, for every user
//! - Deterministic replay: Same entries → same balance
//! - Append-only: Entries never modified or deleted
//! - No double-spend: Redemptions validate and commit under the user's lock

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod balance;
pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod projection;
pub mod storage;
pub mod sweeper;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::LoyaltyLedger;
pub use sweeper::{spawn_sweeper, SweeperHandle};
pub use types::{
    Balance, BalanceSnapshot, EarnLot, EntryReason, ExpiryPolicy, LedgerEntry, LotDraw,
    NewLedgerEntry, RedemptionResult, SweepReport, UserId, UserLoyaltySummary,
};
