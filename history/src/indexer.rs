use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use crate::call::{payout_call_args, PayoutArgs};
use crate::correlate::{correlate, Correlated};
use crate::ledger::Ledger;
use crate::model::{event_id, Block, EventRecord, HistoryElement, HistoryReward};
use crate::resolver::{resolve_slash_era_validators, QueryError, StakingQuery};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("state query error: {0}")]
    Query(#[from] QueryError),

    #[error("block {block} has no event at index {index}")]
    MissingEvent { block: u64, index: u32 },

    #[error("event {0} carries no account/amount fields")]
    MalformedEvent(String),
}

/// Reward accumulator for the correlation scan: an index into the block's
/// payout arguments plus the distinct validators already counted. Starts at
/// -1, meaning no cause event has been seen yet.
#[derive(Debug, Clone)]
struct RewardCursor {
    call_index: i64,
    seen: HashSet<String>,
}

impl RewardCursor {
    fn start() -> Self {
        Self {
            call_index: -1,
            seen: HashSet::new(),
        }
    }
}

/// Host-facing entry points, one call per delivered reward or slash event.
///
/// Each call runs the correlation pass for the whole containing block
/// (guarded by an existence check on the event's id) and then applies the
/// triggering event's amount to the account's running total.
pub struct HistoryIndexer<S, Q> {
    store: Arc<S>,
    query: Q,
    ledger: Ledger<S>,
}

impl<S: Store, Q: StakingQuery> HistoryIndexer<S, Q> {
    pub fn new(store: Arc<S>, query: Q) -> Self {
        let ledger = Ledger::new(Arc::clone(&store));
        Self { store, query, ledger }
    }

    /// Handle one reward event delivered by the host.
    pub async fn handle_reward(&self, block: &Block, event_index: u32) -> Result<(), IndexError> {
        let event = find_event(block, event_index)?;
        self.reward_history(block, event).await?;
        self.update_accumulated(block, event, true).await
    }

    /// Handle one slash event delivered by the host.
    pub async fn handle_slash(&self, block: &Block, event_index: u32) -> Result<(), IndexError> {
        let event = find_event(block, event_index)?;
        self.slash_history(block, event).await?;
        self.update_accumulated(block, event, false).await
    }

    async fn reward_history(&self, block: &Block, event: &EventRecord) -> Result<(), IndexError> {
        if self.already_processed(block, event).await? {
            return Ok(());
        }

        let payout_args: Vec<PayoutArgs> = block
            .extrinsics
            .iter()
            .flat_map(|extrinsic| payout_call_args(&extrinsic.call, extrinsic.signer.as_deref()))
            .collect();

        if payout_args.is_empty() {
            debug!(block = block.number, "no payout calls in block, skipping reward history");
            return Ok(());
        }

        let distinct_validators: HashSet<&str> =
            payout_args.iter().map(|args| args.validator.as_str()).collect();

        let correlated = correlate(
            &block.events,
            &event.pallet,
            &event.method,
            RewardCursor::start(),
            |cursor, account| {
                // One index step per distinct validator: the first reward of
                // each payout burst names its validator, later rewards of the
                // same burst reuse the index.
                if distinct_validators.contains(account) && !cursor.seen.contains(account) {
                    let mut seen = cursor.seen.clone();
                    seen.insert(account.to_string());
                    RewardCursor {
                        call_index: cursor.call_index + 1,
                        seen,
                    }
                } else {
                    cursor.clone()
                }
            },
            |cursor, amount| {
                let attribution = usize::try_from(cursor.call_index)
                    .ok()
                    .and_then(|index| payout_args.get(index));
                HistoryReward {
                    event_idx: event.index,
                    amount: amount.to_string(),
                    is_reward: true,
                    validator: attribution.map(|args| args.validator.clone()),
                    era: attribution.map(|args| args.era),
                }
            },
        );

        self.save_correlated(block, event, correlated).await
    }

    async fn slash_history(&self, block: &Block, event: &EventRecord) -> Result<(), IndexError> {
        if self.already_processed(block, event).await? {
            return Ok(());
        }

        let (slash_era, validators) = resolve_slash_era_validators(&self.query).await?;

        let correlated = correlate(
            &block.events,
            &event.pallet,
            &event.method,
            None::<String>,
            |current, account| {
                // A validator's own slash precedes its nominators' slashes,
                // so the latest validator-set member seen is the cause.
                if validators.contains(account) {
                    Some(account.to_string())
                } else {
                    current.clone()
                }
            },
            |current, amount| HistoryReward {
                event_idx: event.index,
                amount: amount.to_string(),
                is_reward: false,
                validator: current.clone(),
                era: Some(slash_era),
            },
        );

        self.save_correlated(block, event, correlated).await
    }

    async fn save_correlated(
        &self,
        block: &Block,
        trigger: &EventRecord,
        correlated: Vec<Correlated<HistoryReward>>,
    ) -> Result<(), IndexError> {
        let extrinsic = trigger
            .extrinsic_index
            .and_then(|index| block.extrinsics.iter().find(|x| x.index == index));

        let elements: Vec<HistoryElement> = correlated
            .into_iter()
            .map(|matched| {
                if matched.payload.validator.is_none() {
                    warn!(
                        block = block.number,
                        event = matched.event_index,
                        "no cause found before event, recording unattributed"
                    );
                }
                HistoryElement {
                    id: event_id(block.number, matched.event_index),
                    timestamp: block.timestamp,
                    address: matched.account,
                    block_number: block.number,
                    extrinsic_hash: extrinsic.map(|x| x.hash.clone()),
                    extrinsic_idx: extrinsic.map(|x| x.index),
                    reward: matched.payload,
                }
            })
            .collect();

        // Attempt every save; one failure must not abort the siblings.
        let outcomes = join_all(
            elements
                .iter()
                .map(|element| self.store.save_history(element)),
        )
        .await;
        for (element, outcome) in elements.iter().zip(outcomes) {
            if let Err(error) = outcome {
                warn!(id = %element.id, %error, "failed to save history element");
            }
        }
        Ok(())
    }

    /// Runs once per delivered event, with no existence check: a redelivered
    /// event adjusts the total again even when its history element already
    /// exists.
    async fn update_accumulated(
        &self,
        block: &Block,
        event: &EventRecord,
        is_reward: bool,
    ) -> Result<(), IndexError> {
        let Some(data) = &event.data else {
            return Err(IndexError::MalformedEvent(event_id(block.number, event.index)));
        };

        let magnitude = i128::try_from(data.amount).unwrap_or(i128::MAX);
        let delta = if is_reward { magnitude } else { -magnitude };
        self.ledger.apply(&data.account, delta).await?;
        Ok(())
    }

    async fn already_processed(&self, block: &Block, event: &EventRecord) -> Result<bool, IndexError> {
        let id = event_id(block.number, event.index);
        Ok(self.store.history(&id).await?.is_some())
    }
}

fn find_event<'a>(block: &'a Block, event_index: u32) -> Result<&'a EventRecord, IndexError> {
    block
        .events
        .iter()
        .find(|event| event.index == event_index)
        .ok_or(IndexError::MissingEvent {
            block: block.number,
            index: event_index,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Call;
    use crate::model::{AccountAmount, AccumulatedReward, ExtrinsicRecord};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct StaticQuery {
        current_era: Option<u32>,
        defer: u32,
        validators: Vec<String>,
    }

    impl StaticQuery {
        fn new(current_era: Option<u32>, defer: u32, validators: &[&str]) -> Self {
            Self {
                current_era,
                defer,
                validators: validators.iter().map(|v| v.to_string()).collect(),
            }
        }

        fn unused() -> Self {
            Self::new(None, 0, &[])
        }
    }

    #[async_trait]
    impl StakingQuery for StaticQuery {
        async fn current_era(&self) -> Result<Option<u32>, QueryError> {
            Ok(self.current_era)
        }

        async fn slash_defer_duration(&self) -> Result<u32, QueryError> {
            Ok(self.defer)
        }

        async fn era_stakers_clipped(&self, _era: u32) -> Result<Vec<String>, QueryError> {
            Ok(self.validators.clone())
        }
    }

    /// Delegates to a [`MemoryStore`] but fails history saves for one id.
    struct FailingStore {
        inner: MemoryStore,
        fail_id: String,
    }

    #[async_trait]
    impl Store for FailingStore {
        async fn history(&self, id: &str) -> Result<Option<HistoryElement>, StoreError> {
            self.inner.history(id).await
        }

        async fn save_history(&self, element: &HistoryElement) -> Result<(), StoreError> {
            if element.id == self.fail_id {
                return Err(StoreError::Backend("injected failure".to_string()));
            }
            self.inner.save_history(element).await
        }

        async fn accumulated(&self, address: &str) -> Result<Option<AccumulatedReward>, StoreError> {
            self.inner.accumulated(address).await
        }

        async fn save_accumulated(&self, reward: &AccumulatedReward) -> Result<(), StoreError> {
            self.inner.save_accumulated(reward).await
        }
    }

    fn staking_event(index: u32, method: &str, account: &str, amount: u128) -> EventRecord {
        EventRecord {
            index,
            pallet: "Staking".to_string(),
            method: method.to_string(),
            data: Some(AccountAmount {
                account: account.to_string(),
                amount,
            }),
            extrinsic_index: None,
        }
    }

    fn payout_stakers(index: u32, signer: &str, validator: &str, era: u32) -> ExtrinsicRecord {
        ExtrinsicRecord {
            index,
            hash: format!("0xex{index}"),
            signer: Some(signer.to_string()),
            call: Call::PayoutStakers {
                validator: validator.to_string(),
                era,
            },
        }
    }

    fn block(number: u64, extrinsics: Vec<ExtrinsicRecord>, events: Vec<EventRecord>) -> Block {
        Block {
            number,
            timestamp: 1_600_000_000_000,
            extrinsics,
            events,
        }
    }

    #[tokio::test]
    async fn reward_burst_attributes_by_distinct_validator() {
        let store = Arc::new(MemoryStore::new());
        let indexer = HistoryIndexer::new(Arc::clone(&store), StaticQuery::unused());

        let block = block(
            1,
            vec![
                payout_stakers(0, "submitter", "v1", 10),
                payout_stakers(1, "submitter", "v2", 20),
            ],
            vec![
                staking_event(0, "Rewarded", "v1", 100),
                staking_event(1, "Rewarded", "v2", 200),
                staking_event(2, "Rewarded", "v1", 300),
            ],
        );

        indexer.handle_reward(&block, 0).await.unwrap();

        let first = store.history("1-0").await.unwrap().unwrap();
        assert_eq!(first.reward.validator.as_deref(), Some("v1"));
        assert_eq!(first.reward.era, Some(10));

        let second = store.history("1-1").await.unwrap().unwrap();
        assert_eq!(second.reward.validator.as_deref(), Some("v2"));
        assert_eq!(second.reward.era, Some(20));

        // v1's reappearance is not a new distinct validator; the index stays
        // on the latest burst.
        let third = store.history("1-2").await.unwrap().unwrap();
        assert_eq!(third.reward.validator.as_deref(), Some("v2"));
        assert_eq!(third.reward.era, Some(20));
    }

    #[tokio::test]
    async fn end_to_end_payout_stakers_reward() {
        let store = Arc::new(MemoryStore::new());
        let indexer = HistoryIndexer::new(Arc::clone(&store), StaticQuery::unused());

        let mut event = staking_event(0, "Rewarded", "validator", 1_000);
        event.extrinsic_index = Some(0);
        let block = block(
            7,
            vec![payout_stakers(0, "submitter", "validator", 5)],
            vec![event],
        );

        indexer.handle_reward(&block, 0).await.unwrap();

        let element = store.history("7-0").await.unwrap().unwrap();
        assert_eq!(element.address, "validator");
        assert_eq!(element.block_number, 7);
        assert_eq!(element.timestamp, 1_600_000_000_000);
        assert_eq!(element.extrinsic_hash.as_deref(), Some("0xex0"));
        assert_eq!(element.extrinsic_idx, Some(0));
        assert!(element.reward.is_reward);
        assert_eq!(element.reward.validator.as_deref(), Some("validator"));
        assert_eq!(element.reward.era, Some(5));
        assert_eq!(element.reward.amount, "1000");

        let total = store.accumulated("validator").await.unwrap().unwrap();
        assert_eq!(total.amount, 1_000);
    }

    #[tokio::test]
    async fn repeated_handling_writes_history_once_but_reapplies_the_total() {
        let store = Arc::new(MemoryStore::new());
        let indexer = HistoryIndexer::new(Arc::clone(&store), StaticQuery::unused());

        let block = block(
            1,
            vec![payout_stakers(0, "submitter", "v", 3)],
            vec![staking_event(0, "Rewarded", "v", 500)],
        );

        indexer.handle_reward(&block, 0).await.unwrap();
        indexer.handle_reward(&block, 0).await.unwrap();

        assert_eq!(store.history_len().await, 1);
        // The ledger has no idempotence guard: a redelivered event counts again.
        let total = store.accumulated("v").await.unwrap().unwrap();
        assert_eq!(total.amount, 1_000);
    }

    #[tokio::test]
    async fn reward_with_no_payout_calls_skips_history_but_updates_the_total() {
        let store = Arc::new(MemoryStore::new());
        let indexer = HistoryIndexer::new(Arc::clone(&store), StaticQuery::unused());

        let block = block(2, Vec::new(), vec![staking_event(0, "Rewarded", "v", 250)]);

        indexer.handle_reward(&block, 0).await.unwrap();

        assert_eq!(store.history_len().await, 0);
        assert_eq!(store.accumulated("v").await.unwrap().unwrap().amount, 250);
    }

    #[tokio::test]
    async fn reward_before_any_cause_is_recorded_unattributed() {
        let store = Arc::new(MemoryStore::new());
        let indexer = HistoryIndexer::new(Arc::clone(&store), StaticQuery::unused());

        // The nominator's reward precedes any event naming a payout validator.
        let block = block(
            3,
            vec![payout_stakers(0, "submitter", "v2", 20)],
            vec![
                staking_event(0, "Rewarded", "nominator", 50),
                staking_event(1, "Rewarded", "v2", 400),
            ],
        );

        indexer.handle_reward(&block, 0).await.unwrap();

        let unattributed = store.history("3-0").await.unwrap().unwrap();
        assert_eq!(unattributed.reward.validator, None);
        assert_eq!(unattributed.reward.era, None);

        let attributed = store.history("3-1").await.unwrap().unwrap();
        assert_eq!(attributed.reward.validator.as_deref(), Some("v2"));
        assert_eq!(attributed.reward.era, Some(20));
    }

    #[tokio::test]
    async fn slash_attributes_validator_from_the_deferred_era() {
        let store = Arc::new(MemoryStore::new());
        let query = StaticQuery::new(Some(100), 28, &["validator"]);
        let indexer = HistoryIndexer::new(Arc::clone(&store), query);

        let block = block(
            4,
            Vec::new(),
            vec![
                staking_event(0, "Slashed", "validator", 5_000),
                staking_event(1, "Slashed", "nominator", 500),
            ],
        );

        indexer.handle_slash(&block, 0).await.unwrap();

        let own = store.history("4-0").await.unwrap().unwrap();
        assert!(!own.reward.is_reward);
        assert_eq!(own.reward.validator.as_deref(), Some("validator"));
        assert_eq!(own.reward.era, Some(72));

        // The nominator's slash is explained by the validator seen before it.
        let nominator = store.history("4-1").await.unwrap().unwrap();
        assert_eq!(nominator.reward.validator.as_deref(), Some("validator"));
        assert_eq!(nominator.reward.era, Some(72));

        let total = store.accumulated("validator").await.unwrap().unwrap();
        assert_eq!(total.amount, -5_000);
    }

    #[tokio::test]
    async fn slash_with_empty_validator_set_is_recorded_unattributed() {
        let store = Arc::new(MemoryStore::new());
        let query = StaticQuery::new(Some(100), 28, &[]);
        let indexer = HistoryIndexer::new(Arc::clone(&store), query);

        let block = block(5, Vec::new(), vec![staking_event(0, "Slashed", "v", 100)]);

        indexer.handle_slash(&block, 0).await.unwrap();

        let element = store.history("5-0").await.unwrap().unwrap();
        assert_eq!(element.reward.validator, None);
        assert_eq!(element.reward.era, Some(72));
    }

    #[tokio::test]
    async fn missing_current_era_fails_the_slash() {
        let store = Arc::new(MemoryStore::new());
        let indexer = HistoryIndexer::new(Arc::clone(&store), StaticQuery::new(None, 28, &[]));

        let block = block(6, Vec::new(), vec![staking_event(0, "Slashed", "v", 100)]);

        let outcome = indexer.handle_slash(&block, 0).await;

        assert!(matches!(
            outcome,
            Err(IndexError::Query(QueryError::CurrentEraUnavailable))
        ));
        assert_eq!(store.history_len().await, 0);
    }

    #[tokio::test]
    async fn partial_save_failure_does_not_abort_siblings() {
        let store = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            fail_id: "1-1".to_string(),
        });
        let indexer = HistoryIndexer::new(Arc::clone(&store), StaticQuery::unused());

        let block = block(
            1,
            vec![payout_stakers(0, "submitter", "v", 1)],
            vec![
                staking_event(0, "Rewarded", "v", 10),
                staking_event(1, "Rewarded", "v", 20),
                staking_event(2, "Rewarded", "v", 30),
            ],
        );

        indexer.handle_reward(&block, 0).await.unwrap();

        assert!(store.history("1-0").await.unwrap().is_some());
        assert!(store.history("1-1").await.unwrap().is_none());
        assert!(store.history("1-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_event_index_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let indexer = HistoryIndexer::new(Arc::clone(&store), StaticQuery::unused());

        let block = block(1, Vec::new(), Vec::new());

        let outcome = indexer.handle_reward(&block, 9).await;

        assert!(matches!(
            outcome,
            Err(IndexError::MissingEvent { block: 1, index: 9 })
        ));
    }

    #[tokio::test]
    async fn trigger_event_without_data_fields_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let indexer = HistoryIndexer::new(Arc::clone(&store), StaticQuery::unused());

        let mut event = staking_event(0, "Rewarded", "v", 100);
        event.data = None;
        let block = block(8, Vec::new(), vec![event]);

        let outcome = indexer.handle_reward(&block, 0).await;

        assert!(matches!(outcome, Err(IndexError::MalformedEvent(id)) if id == "8-0"));
    }
}
