use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by chain-state queries.
#[derive(Debug, Error)]
pub enum QueryError {
    /// `Staking.CurrentEra` is not populated on chain.
    #[error("current era unavailable from chain state")]
    CurrentEraUnavailable,

    #[error("state query failed: {0}")]
    Backend(String),
}

/// Point-in-time staking state, injected by the chain connection layer.
#[async_trait]
pub trait StakingQuery: Send + Sync {
    /// The era the chain is currently in, if any.
    async fn current_era(&self) -> Result<Option<u32>, QueryError>;

    /// Number of eras between stake exposure and slash application.
    async fn slash_defer_duration(&self) -> Result<u32, QueryError>;

    /// Validators with clipped exposure entries for `era`.
    async fn era_stakers_clipped(&self, era: u32) -> Result<Vec<String>, QueryError>;
}

/// Compute the era a slash seen now was earned in and fetch the validators
/// that were active then.
///
/// The slash era is `current_era - slash_defer_duration`, saturating at
/// zero for young chains. A missing current era is an error for the event
/// being handled; it is not retried here.
pub async fn resolve_slash_era_validators<Q: StakingQuery + ?Sized>(
    query: &Q,
) -> Result<(u32, HashSet<String>), QueryError> {
    let current_era = query
        .current_era()
        .await?
        .ok_or(QueryError::CurrentEraUnavailable)?;
    let defer = query.slash_defer_duration().await?;
    let slash_era = current_era.saturating_sub(defer);

    let validators = query.era_stakers_clipped(slash_era).await?;
    Ok((slash_era, validators.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StaticQuery {
        current_era: Option<u32>,
        defer: u32,
        validators: Vec<String>,
        queried_eras: Mutex<Vec<u32>>,
    }

    impl StaticQuery {
        fn new(current_era: Option<u32>, defer: u32, validators: &[&str]) -> Self {
            Self {
                current_era,
                defer,
                validators: validators.iter().map(|v| v.to_string()).collect(),
                queried_eras: Mutex::new(Vec::new()),
            }
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

        async fn era_stakers_clipped(&self, era: u32) -> Result<Vec<String>, QueryError> {
            self.queried_eras.lock().unwrap().push(era);
            Ok(self.validators.clone())
        }
    }

    #[tokio::test]
    async fn slash_era_subtracts_the_defer_duration() {
        let query = StaticQuery::new(Some(100), 28, &["validator"]);

        let (slash_era, validators) = resolve_slash_era_validators(&query).await.unwrap();

        assert_eq!(slash_era, 72);
        assert_eq!(*query.queried_eras.lock().unwrap(), vec![72]);
        assert!(validators.contains("validator"));
    }

    #[tokio::test]
    async fn missing_current_era_is_an_error() {
        let query = StaticQuery::new(None, 28, &[]);

        let outcome = resolve_slash_era_validators(&query).await;

        assert!(matches!(outcome, Err(QueryError::CurrentEraUnavailable)));
    }

    #[tokio::test]
    async fn slash_era_saturates_at_zero() {
        let query = StaticQuery::new(Some(10), 28, &[]);

        let (slash_era, _) = resolve_slash_era_validators(&query).await.unwrap();

        assert_eq!(slash_era, 0);
    }

    #[tokio::test]
    async fn duplicate_validators_collapse_into_a_set() {
        let query = StaticQuery::new(Some(5), 0, &["a", "a", "b"]);

        let (_, validators) = resolve_slash_era_validators(&query).await.unwrap();

        assert_eq!(validators.len(), 2);
    }
}
