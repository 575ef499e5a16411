//! Chain adapter: converts subxt blocks, extrinsics and events into the
//! history crate's block model, and answers staking state queries over the
//! live connection.

use async_trait::async_trait;
use codec::Decode;
use history::call::Call;
use history::model::{AccountAmount, Block, EventRecord, ExtrinsicRecord};
use history::resolver::{QueryError, StakingQuery};
use subxt::dynamic::{constant, storage, Value};
use subxt::events::Phase;
use subxt::ext::scale_value::{Composite, Primitive, Value as ScaleValue, ValueDef};
use subxt::utils::AccountId32;
use subxt::{OnlineClient, PolkadotConfig};
use thiserror::Error;
use tracing::warn;

pub type ChainClient = OnlineClient<PolkadotConfig>;
pub type ChainBlock = subxt::blocks::Block<PolkadotConfig, ChainClient>;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("subxt error: {0}")]
    Subxt(#[from] subxt::Error),
}

/// Decode one finalized block into the history block model. Extrinsics and
/// events that fail to decode degrade to `Call::Other` / get skipped with a
/// diagnostic instead of failing the block.
pub async fn load_block(block: ChainBlock) -> Result<Block, ChainError> {
    let number = u64::from(block.number());
    let extrinsics = block.extrinsics().await?;
    let events = block.events().await?;

    let mut timestamp = 0u64;
    let mut extrinsic_records = Vec::new();
    for extrinsic in extrinsics.iter() {
        let index = extrinsic.index();
        let hash = format!("{:#x}", extrinsic.hash());
        let signer = extrinsic.address_bytes().and_then(signer_from_address);

        let (pallet, variant) = match (extrinsic.pallet_name(), extrinsic.variant_name()) {
            (Ok(pallet), Ok(variant)) => (pallet.to_string(), variant.to_string()),
            _ => {
                warn!(block = number, index, "undecodable extrinsic, treating as unrelated");
                extrinsic_records.push(ExtrinsicRecord {
                    index,
                    hash,
                    signer,
                    call: Call::Other,
                });
                continue;
            }
        };

        let call = match extrinsic.field_values() {
            Ok(fields) => {
                if pallet == "Timestamp" && variant == "set" {
                    if let Some(moment) = composite_field(&fields, 0).and_then(number_from_value) {
                        timestamp = u64::try_from(moment).unwrap_or_default();
                    }
                }
                decode_call(&pallet, &variant, &fields)
            }
            Err(error) => {
                warn!(block = number, index, %error, "undecodable call fields, treating as unrelated");
                Call::Other
            }
        };

        extrinsic_records.push(ExtrinsicRecord {
            index,
            hash,
            signer,
            call,
        });
    }

    let mut event_records = Vec::new();
    for event in events.iter() {
        let event = match event {
            Ok(event) => event,
            Err(error) => {
                warn!(block = number, %error, "undecodable event, skipping");
                continue;
            }
        };

        let extrinsic_index = match event.phase() {
            Phase::ApplyExtrinsic(index) => Some(index),
            _ => None,
        };
        let data = event.field_values().ok().and_then(|fields| {
            let account = account_from_value(composite_field(&fields, 0)?)?;
            let amount = number_from_value(composite_field(&fields, 1)?)?;
            Some(AccountAmount { account, amount })
        });

        event_records.push(EventRecord {
            index: event.index(),
            pallet: event.pallet_name().to_string(),
            method: event.variant_name().to_string(),
            data,
            extrinsic_index,
        });
    }

    Ok(Block {
        number,
        timestamp,
        extrinsics: extrinsic_records,
        events: event_records,
    })
}

/// Map a decoded `(pallet, call)` pair onto the call variants the flattener
/// recognizes. Anything else is `Other`.
fn decode_call<T>(pallet: &str, variant: &str, fields: &Composite<T>) -> Call {
    match (pallet, variant) {
        ("Staking", "payout_stakers") => {
            let validator = composite_field(fields, 0).and_then(account_from_value);
            let era = composite_field(fields, 1)
                .and_then(number_from_value)
                .and_then(|era| u32::try_from(era).ok());
            match (validator, era) {
                (Some(validator), Some(era)) => Call::PayoutStakers { validator, era },
                _ => Call::Other,
            }
        }
        ("Staking", "payout_validator") => composite_field(fields, 0)
            .and_then(number_from_value)
            .and_then(|era| u32::try_from(era).ok())
            .map(|era| Call::PayoutValidator { era })
            .unwrap_or(Call::Other),
        ("Utility", "batch" | "batch_all" | "force_batch") => {
            let calls = composite_field(fields, 0)
                .map(calls_from_value)
                .unwrap_or_default();
            Call::Batch { calls }
        }
        // proxy(real, force_proxy_type, call): the wrapped call is the last field.
        ("Proxy", "proxy") => fields
            .values()
            .last()
            .map(|inner| Call::Proxy {
                inner: Box::new(call_from_value(inner)),
            })
            .unwrap_or(Call::Other),
        _ => Call::Other,
    }
}

/// A runtime call decodes as two nested variants: the pallet, then the call
/// carrying its fields.
fn call_from_value<T>(value: &ScaleValue<T>) -> Call {
    let ValueDef::Variant(pallet) = &value.value else {
        return Call::Other;
    };
    let Some(first) = pallet.values.values().next() else {
        return Call::Other;
    };
    let ValueDef::Variant(call) = &first.value else {
        return Call::Other;
    };
    decode_call(&pallet.name, &call.name, &call.values)
}

fn calls_from_value<T>(value: &ScaleValue<T>) -> Vec<Call> {
    match &value.value {
        ValueDef::Composite(calls) => calls.values().map(call_from_value).collect(),
        _ => Vec::new(),
    }
}

fn composite_field<T>(fields: &Composite<T>, index: usize) -> Option<&ScaleValue<T>> {
    fields.values().nth(index)
}

/// `AccountId32` and `MultiAddress::Id` shapes both reduce to a single
/// 32-byte run of primitives.
fn account_from_value<T>(value: &ScaleValue<T>) -> Option<String> {
    let mut bytes = Vec::new();
    collect_bytes(value, &mut bytes);
    let account: [u8; 32] = bytes.try_into().ok()?;
    Some(AccountId32(account).to_string())
}

fn collect_bytes<T>(value: &ScaleValue<T>, out: &mut Vec<u8>) {
    match &value.value {
        ValueDef::Primitive(Primitive::U128(byte)) => {
            if let Ok(byte) = u8::try_from(*byte) {
                out.push(byte);
            }
        }
        ValueDef::Primitive(Primitive::U256(words)) => out.extend_from_slice(words),
        ValueDef::Composite(composite) => {
            for value in composite.values() {
                collect_bytes(value, out);
            }
        }
        ValueDef::Variant(variant) => {
            for value in variant.values.values() {
                collect_bytes(value, out);
            }
        }
        _ => {}
    }
}

fn number_from_value<T>(value: &ScaleValue<T>) -> Option<u128> {
    match &value.value {
        ValueDef::Primitive(Primitive::U128(number)) => Some(*number),
        // Compact and newtype wrappers decode as single-field composites.
        ValueDef::Composite(composite) => composite.values().next().and_then(number_from_value),
        _ => None,
    }
}

/// The signer is the trailing account id of the address bytes: either a raw
/// `AccountId32`, or `MultiAddress::Id` (variant 0) followed by the id.
fn signer_from_address(bytes: &[u8]) -> Option<String> {
    let account: [u8; 32] = match bytes.len() {
        32 => bytes.try_into().ok()?,
        33 if bytes[0] == 0 => bytes[1..].try_into().ok()?,
        _ => return None,
    };
    Some(AccountId32(account).to_string())
}

/// Staking state queries answered over the live chain connection.
pub struct SubxtStakingQuery {
    client: ChainClient,
}

impl SubxtStakingQuery {
    pub fn new(client: ChainClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StakingQuery for SubxtStakingQuery {
    async fn current_era(&self) -> Result<Option<u32>, QueryError> {
        let query = storage("Staking", "CurrentEra", Vec::<Value>::new());
        let storage_at = self.client.storage().at_latest().await.map_err(backend)?;
        match storage_at.fetch(&query).await.map_err(backend)? {
            Some(era) => Ok(Some(decode_scale::<u32>(era.encoded())?)),
            None => Ok(None),
        }
    }

    async fn slash_defer_duration(&self) -> Result<u32, QueryError> {
        let address = constant("Staking", "SlashDeferDuration");
        let value = self.client.constants().at(&address).map_err(backend)?;
        decode_scale::<u32>(value.encoded())
    }

    async fn era_stakers_clipped(&self, era: u32) -> Result<Vec<String>, QueryError> {
        let query = storage(
            "Staking",
            "ErasStakersClipped",
            vec![Value::u128(u128::from(era))],
        );
        let storage_at = self.client.storage().at_latest().await.map_err(backend)?;
        let mut entries = storage_at.iter(query).await.map_err(backend)?;

        let mut validators = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry.map_err(backend)?;
            match validator_from_key(&entry.key_bytes) {
                Some(validator) => validators.push(validator),
                None => warn!(era, "malformed era stakers key, skipping"),
            }
        }
        Ok(validators)
    }
}

fn backend(error: subxt::Error) -> QueryError {
    QueryError::Backend(error.to_string())
}

fn decode_scale<V: Decode>(bytes: &[u8]) -> Result<V, QueryError> {
    V::decode(&mut &bytes[..]).map_err(|error| QueryError::Backend(error.to_string()))
}

/// The validator id is the trailing 32 bytes of the double-map storage key.
fn validator_from_key(key_bytes: &[u8]) -> Option<String> {
    if key_bytes.len() < 32 {
        return None;
    }
    let account: [u8; 32] = key_bytes[key_bytes.len() - 32..].try_into().ok()?;
    Some(AccountId32(account).to_string())
}
