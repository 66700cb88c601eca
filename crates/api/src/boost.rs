//! Boost: spend one credit to move an entity's recency to now.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vicinity_core::{EntityId, Error, Result, StoreError};
use vicinity_store::GeoStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostReceipt {
    pub recency_at: DateTime<Utc>,
    pub remaining_credits: u32,
}

/// Credit check and decrement happen in one conditional write; a lost race re-reads
/// and re-evaluates, so one credit can never pay for two boosts.
pub struct BoostService {
    store: Arc<dyn GeoStore>,
    max_attempts: u32,
}

impl BoostService {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

    pub fn new(store: Arc<dyn GeoStore>, max_attempts: u32) -> Self {
        Self { store, max_attempts: max_attempts.max(1) }
    }

    pub async fn boost(&self, id: &EntityId) -> Result<BoostReceipt> {
        for attempt in 1..=self.max_attempts {
            let entity = self
                .store
                .get(id)
                .await
                .map_err(|e| Error::store(format!("boost read {}", id), e))?
                .ok_or_else(|| Error::NotFound(id.clone()))?;
            if entity.credits == 0 {
                info!(id = %id, "boost: insufficient credits");
                counter!("boost_total", 1u64, "outcome" => "insufficient_credits");
                return Err(Error::InsufficientCredits { id: id.clone() });
            }
            let remaining = entity.credits - 1;
            // Millisecond resolution, as stored.
            let now = DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or_else(Utc::now);
            match self.store.conditional_update(id, entity.credits, remaining, now).await {
                Ok(()) => {
                    counter!("boost_total", 1u64, "outcome" => "ok");
                    return Ok(BoostReceipt { recency_at: now, remaining_credits: remaining });
                }
                Err(StoreError::Conflict { expected, actual }) => {
                    debug!(id = %id, attempt, expected, actual, "boost: credit count moved; re-reading");
                }
                Err(StoreError::NotFound) => return Err(Error::NotFound(id.clone())),
                Err(e) => return Err(Error::store(format!("boost write {}", id), e)),
            }
        }
        counter!("boost_total", 1u64, "outcome" => "conflict");
        Err(Error::Conflict { id: id.clone(), attempts: self.max_attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vicinity_core::Entity;
    use vicinity_store::MemoryStore;

    fn id(s: &str) -> EntityId {
        EntityId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn boost_spends_one_credit_and_stamps_recency() {
        let store = Arc::new(MemoryStore::with_entities([Entity::new(id("a")).with_credits(2)]));
        let svc = BoostService::new(store.clone(), BoostService::DEFAULT_MAX_ATTEMPTS);
        let before = Utc::now() - chrono::Duration::seconds(1);
        let r = svc.boost(&id("a")).await.unwrap();
        assert_eq!(r.remaining_credits, 1);
        assert!(r.recency_at >= before);
        let e = store.get(&id("a")).await.unwrap().unwrap();
        assert_eq!((e.credits, e.recency_at), (1, r.recency_at));

        svc.boost(&id("a")).await.unwrap();
        let err = svc.boost(&id("a")).await.unwrap_err();
        assert_eq!(err, Error::InsufficientCredits { id: id("a") });
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn boost_missing_entity_is_not_found() {
        let svc = BoostService::new(Arc::new(MemoryStore::new()), 3);
        assert_eq!(svc.boost(&id("ghost")).await.unwrap_err(), Error::NotFound(id("ghost")));
    }
}
