use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::{AccumulatedReward, HistoryElement};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Keyed, single-entity persistence. No multi-key transactions: every get
/// and save stands alone, and callers decide how failures compose.
#[async_trait]
pub trait Store: Send + Sync {
    async fn history(&self, id: &str) -> Result<Option<HistoryElement>, StoreError>;
    async fn save_history(&self, element: &HistoryElement) -> Result<(), StoreError>;
    async fn accumulated(&self, address: &str) -> Result<Option<AccumulatedReward>, StoreError>;
    async fn save_accumulated(&self, reward: &AccumulatedReward) -> Result<(), StoreError>;
}

/// In-memory store backing unit tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    history: RwLock<HashMap<String, HistoryElement>>,
    accumulated: RwLock<HashMap<String, AccumulatedReward>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn history(&self, id: &str) -> Result<Option<HistoryElement>, StoreError> {
        Ok(self.history.read().await.get(id).cloned())
    }

    async fn save_history(&self, element: &HistoryElement) -> Result<(), StoreError> {
        self.history
            .write()
            .await
            .insert(element.id.clone(), element.clone());
        Ok(())
    }

    async fn accumulated(&self, address: &str) -> Result<Option<AccumulatedReward>, StoreError> {
        Ok(self.accumulated.read().await.get(address).cloned())
    }

    async fn save_accumulated(&self, reward: &AccumulatedReward) -> Result<(), StoreError> {
        self.accumulated
            .write()
            .await
            .insert(reward.address.clone(), reward.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{event_id, HistoryReward};

    fn element(id: &str) -> HistoryElement {
        HistoryElement {
            id: id.to_string(),
            timestamp: 0,
            address: "account".to_string(),
            block_number: 1,
            extrinsic_hash: None,
            extrinsic_idx: None,
            reward: HistoryReward {
                event_idx: 0,
                amount: "10".to_string(),
                is_reward: true,
                validator: None,
                era: None,
            },
        }
    }

    #[tokio::test]
    async fn missing_entities_read_as_none() {
        let store = MemoryStore::new();

        assert!(store.history("1-0").await.unwrap().is_none());
        assert!(store.accumulated("account").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_history_reads_back_by_id() {
        let store = MemoryStore::new();
        let element = element(&event_id(5, 2));

        store.save_history(&element).await.unwrap();

        assert_eq!(store.history("5-2").await.unwrap(), Some(element));
        assert_eq!(store.history_len().await, 1);
    }

    #[tokio::test]
    async fn saving_accumulated_overwrites_the_previous_amount() {
        let store = MemoryStore::new();
        let mut reward = AccumulatedReward {
            address: "account".to_string(),
            amount: 10,
        };

        store.save_accumulated(&reward).await.unwrap();
        reward.amount = 25;
        store.save_accumulated(&reward).await.unwrap();

        assert_eq!(store.accumulated("account").await.unwrap().unwrap().amount, 25);
    }
}
