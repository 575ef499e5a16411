//! File-backed store: one JSON document per entity, grouped by kind under
//! the data directory.

use std::path::PathBuf;

use async_trait::async_trait;
use history::model::{AccumulatedReward, HistoryElement};
use history::store::{Store, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

const HISTORY_DIR: &str = "history";
const REWARDS_DIR: &str = "rewards";

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        if root.as_os_str().is_empty() {
            return Err(StoreError::Backend("data directory is empty".to_string()));
        }
        Ok(Self { root })
    }

    fn validate_key(key: &str) -> Result<(), StoreError> {
        if key.trim().is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn entity_path(&self, kind: &str, key: &str) -> PathBuf {
        self.root.join(kind).join(format!("{key}.json"))
    }

    async fn read<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>, StoreError> {
        Self::validate_key(key)?;
        let path = self.entity_path(kind, key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|error| StoreError::Serialization(error.to_string()))
    }

    async fn write<T: Serialize>(&self, kind: &str, key: &str, entity: &T) -> Result<(), StoreError> {
        Self::validate_key(key)?;
        let target = self.entity_path(kind, key);
        let temp = target.with_extension("tmp");
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec(entity)
            .map_err(|error| StoreError::Serialization(error.to_string()))?;

        // Write to a sibling temp file and rename so readers never observe a
        // partially written document.
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&temp, &target).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn history(&self, id: &str) -> Result<Option<HistoryElement>, StoreError> {
        self.read(HISTORY_DIR, id).await
    }

    async fn save_history(&self, element: &HistoryElement) -> Result<(), StoreError> {
        self.write(HISTORY_DIR, &element.id, element).await
    }

    async fn accumulated(&self, address: &str) -> Result<Option<AccumulatedReward>, StoreError> {
        self.read(REWARDS_DIR, address).await
    }

    async fn save_accumulated(&self, reward: &AccumulatedReward) -> Result<(), StoreError> {
        self.write(REWARDS_DIR, &reward.address, reward).await
    }
}
