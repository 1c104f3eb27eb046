//! Card Ledger
//!
//! Per-card, hash-chained fare ledger with an integrity-auditing engine.
//!
//! # Architecture
//!
//! - **Pure core**: canonical hashing (`crypto`), Merkle roots (`merkle`) and
//!   chain auditing (`audit`) know nothing about storage
//! - **Injected store**: `LedgerReader` / `LedgerWriter` traits, backed by
//!   RocksDB (`storage`) or memory (`store`)
//! - **Fan-out audit**: one task per card, results joined through a channel
//! - **Compensating repair**: single forward pass per card, one atomic batch
//!
//! # Invariants
//!
//! - One chronological order per card: timestamp, then event id
//! - `hash == hash_event(event)` for every event
//! - `prev_hash` of every non-first event equals its predecessor's hash
//! - Replaying a card's events reproduces its recorded balance
//! - Merkle roots are derived data, never authoritative

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod merkle;
pub mod metrics;
pub mod orchestrator;
pub mod repair;
pub mod storage;
pub mod store;
pub mod tamper;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use audit::{BalanceReplay, ChainAuditor, Issue, IssueKind};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::CardLedger;
pub use merkle::{CardMerkleTree, MerkleCache};
pub use orchestrator::{IntegrityOrchestrator, ValidationReport};
pub use repair::{BranchRepairer, RepairOutcome};
pub use storage::Storage;
pub use store::{InMemoryStore, LedgerReader, LedgerSnapshot, LedgerStore, LedgerWriter};
pub use tamper::{TamperRecord, TamperSimulator};
pub use types::{Card, EventType, LedgerEvent, GENESIS_PREV_HASH};
