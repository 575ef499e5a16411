use serde::{Deserialize, Serialize};

use crate::call::Call;

/// One finalized block as delivered by the chain connection layer.
#[derive(Debug, Clone)]
pub struct Block {
    pub number: u64,
    /// Unix timestamp in milliseconds, taken from the block's timestamp inherent.
    pub timestamp: u64,
    /// Extrinsics in submission order.
    pub extrinsics: Vec<ExtrinsicRecord>,
    /// Events in emission order.
    pub events: Vec<EventRecord>,
}

/// A submitted extrinsic with its decoded call tree.
#[derive(Debug, Clone)]
pub struct ExtrinsicRecord {
    pub index: u32,
    pub hash: String,
    /// Address of the submitter; `None` for unsigned extrinsics.
    pub signer: Option<String>,
    pub call: Call,
}

/// One event from the block's event list.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Index of this event within the block.
    pub index: u32,
    /// Section the event was emitted from, e.g. "Staking".
    pub pallet: String,
    /// Event name within the section, e.g. "Rewarded".
    pub method: String,
    /// First two positional data fields, for events that carry them.
    pub data: Option<AccountAmount>,
    /// Index of the originating extrinsic, when the event was extrinsic-bound.
    pub extrinsic_index: Option<u32>,
}

/// The `(account, amount)` head of an event's data fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAmount {
    pub account: String,
    pub amount: u128,
}

/// Deterministic identifier for the event at `event_idx` of block
/// `block_number`. Stable across reprocessing attempts.
pub fn event_id(block_number: u64, event_idx: u32) -> String {
    format!("{block_number}-{event_idx}")
}

/// One persisted record per correlated reward or slash event. Written once,
/// never mutated; reprocessing is short-circuited by an existence check on
/// the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryElement {
    pub id: String,
    pub timestamp: u64,
    pub address: String,
    pub block_number: u64,
    /// Absent when the event was not extrinsic-triggered, e.g. era-end
    /// batch payouts driven by the runtime itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extrinsic_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extrinsic_idx: Option<u32>,
    pub reward: HistoryReward,
}

/// Cause attribution embedded in a [`HistoryElement`].
///
/// `validator`/`era` are `None` when no cause event preceded the reward in
/// the block, so the record is explicitly unattributed rather than pointing
/// at an arbitrary call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReward {
    /// Index of the event whose handling produced this record.
    pub event_idx: u32,
    /// Raw amount as emitted, in decimal.
    pub amount: String,
    pub is_reward: bool,
    pub validator: Option<String>,
    pub era: Option<u32>,
}

/// Net accumulated reward per account: rewards add, slashes subtract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatedReward {
    pub address: String,
    /// Signed running total. Serialized as a decimal string since JSON
    /// numbers cap at 64 bits.
    #[serde(with = "amount_string")]
    pub amount: i128,
}

mod amount_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
