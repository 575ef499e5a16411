//! Staking reward and slash attribution.
//!
//! The chain emits `Staking.Rewarded` and `Staking.Slashed` events without
//! saying which validator or era produced them. This crate reconstructs that
//! information by correlating each event, in emission order, against the
//! payout calls submitted in the same block (for rewards) or against the
//! validator set of the deferred slash era (for slashes), and keeps a signed
//! running total of net accumulated rewards per account.

// Decoded call variants and the recursive batch/proxy flattener.
pub mod call;

// Single-pass scan over a block's events with a generic fold accumulator.
pub mod correlate;

// Host-facing entry points: one call per delivered reward or slash event.
pub mod indexer;

// Per-account accumulated reward totals.
pub mod ledger;

// Chain-facing block model and persisted entities.
pub mod model;

// Slash-era computation over an injected chain-state query.
pub mod resolver;

// Keyed get/save persistence contract and the in-memory implementation.
pub mod store;

pub use indexer::{HistoryIndexer, IndexError};
pub use model::{AccumulatedReward, Block, HistoryElement, HistoryReward};
