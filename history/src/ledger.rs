use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::model::AccumulatedReward;
use crate::store::{Store, StoreError};

/// Running net reward totals, one signed amount per account.
///
/// Same-account updates are serialized through a per-account lock held
/// across the whole read-modify-write, so a reward and a slash handled
/// concurrently for one account cannot lose an update.
pub struct Ledger<S> {
    store: Arc<S>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: Store> Ledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a signed delta: positive for rewards, negative for slashes.
    /// Accounts start at zero on first touch.
    pub async fn apply(&self, address: &str, delta: i128) -> Result<(), StoreError> {
        let lock = self.account_lock(address).await;
        let _guard = lock.lock().await;

        let mut accumulated = self
            .store
            .accumulated(address)
            .await?
            .unwrap_or_else(|| AccumulatedReward {
                address: address.to_string(),
                amount: 0,
            });
        accumulated.amount = accumulated.amount.saturating_add(delta);
        self.store.save_accumulated(&accumulated).await?;

        debug!(address, delta, total = accumulated.amount, "accumulated reward updated");
        Ok(())
    }

    async fn account_lock(&self, address: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(address.to_string()).or_default().clone()
    }
}
