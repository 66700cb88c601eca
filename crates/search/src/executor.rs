//! Proximity query execution: plan, fan out one range query per interval, merge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use vicinity_core::distance::distance;
use vicinity_core::planner::{BoundsPlanner, GeohashPlanner};
use vicinity_core::{BoundingInterval, Coordinate, Entity, Error, Filter, RankedCandidate, Result, StoreError};
use vicinity_store::GeoStore;

use crate::rank::{rank, rank_by_distance};

/// What to do when some interval queries fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed interval fails the whole call.
    #[default]
    Strict,
    /// Failed intervals are logged and skipped; the result is flagged partial.
    Lenient,
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Rank,
    Distance,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOpts {
    /// Applied after distance filtering and ranking.
    pub limit: Option<usize>,
    pub deadline: Option<tokio::time::Instant>,
    pub policy: FailurePolicy,
    pub order: Order,
}

impl SearchOpts {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(tokio::time::Instant::now() + timeout);
        self
    }

    pub fn lenient(mut self) -> Self {
        self.policy = FailurePolicy::Lenient;
        self
    }

    pub fn by_distance(mut self) -> Self {
        self.order = Order::Distance;
        self
    }
}

/// Counters from one execution, for `--explain` and logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchDebugInfo {
    pub intervals: usize,
    pub raw_hits: usize,
    pub after_dedup: usize,
    pub after_distance: usize,
    pub returned: usize,
    pub failed_intervals: usize,
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub candidates: Vec<RankedCandidate>,
    pub debug: SearchDebugInfo,
}

pub struct ProximityQueryExecutor {
    store: Arc<dyn GeoStore>,
    planner: Arc<dyn BoundsPlanner>,
}

impl ProximityQueryExecutor {
    pub fn new(store: Arc<dyn GeoStore>, planner: Arc<dyn BoundsPlanner>) -> Self {
        Self { store, planner }
    }

    pub fn with_default_planner(store: Arc<dyn GeoStore>) -> Self {
        Self::new(store, Arc::new(GeohashPlanner::default()))
    }

    pub fn store(&self) -> &Arc<dyn GeoStore> {
        &self.store
    }

    /// Entities in the planned ranges that pass `filters`, de-duplicated and sorted by id.
    /// Includes geohash false positives; no distance check is made. Strict failure policy.
    pub async fn fetch(
        &self,
        center: &Coordinate,
        radius_m: f64,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<Entity>> {
        let (mut entities, _) = self.gather(center, radius_m, filters, None, FailurePolicy::Strict).await?;
        if let Some(limit) = limit {
            entities.truncate(limit);
        }
        Ok(entities)
    }

    /// Full pipeline: plan, fetch, exact distance filter, rank, truncate.
    pub async fn search(
        &self,
        center: &Coordinate,
        radius_m: f64,
        filters: &[Filter],
        opts: SearchOpts,
    ) -> Result<SearchResult> {
        let t0 = Instant::now();
        let (entities, mut dbg) = self.gather(center, radius_m, filters, opts.deadline, opts.policy).await?;

        let candidates: Vec<RankedCandidate> = entities
            .into_iter()
            .filter_map(|entity| {
                let d = distance(center, &entity.coordinate()?);
                (d <= radius_m).then_some(RankedCandidate { entity, distance_m: d })
            })
            .collect();
        dbg.after_distance = candidates.len();

        let mut ranked = match opts.order {
            Order::Rank => rank(candidates),
            Order::Distance => rank_by_distance(candidates),
        };
        if let Some(limit) = opts.limit {
            ranked.truncate(limit);
        }
        dbg.returned = ranked.len();

        metrics::histogram!("search_candidates", dbg.after_distance as f64);
        metrics::histogram!("search_eval_ms", t0.elapsed().as_secs_f64() * 1_000.0);
        debug!(
            intervals = dbg.intervals,
            raw_hits = dbg.raw_hits,
            after_dedup = dbg.after_dedup,
            after_distance = dbg.after_distance,
            returned = dbg.returned,
            "proximity search evaluated"
        );
        Ok(SearchResult { candidates: ranked, debug: dbg })
    }

    /// Validate, plan, run every interval concurrently and merge.
    async fn gather(
        &self,
        center: &Coordinate,
        radius_m: f64,
        filters: &[Filter],
        deadline: Option<tokio::time::Instant>,
        policy: FailurePolicy,
    ) -> Result<(Vec<Entity>, SearchDebugInfo)> {
        let started = Instant::now();
        let intervals = self.planner.plan(center, radius_m)?;
        for f in filters {
            f.validate()?;
        }
        metrics::histogram!("search_intervals", intervals.len() as f64);

        let filters: Arc<[Filter]> = Arc::from(filters);
        let mut set = JoinSet::new();
        for (idx, iv) in intervals.iter().cloned().enumerate() {
            let store = Arc::clone(&self.store);
            let filters = Arc::clone(&filters);
            set.spawn(async move {
                let res = store.range_query(&iv.lower, &iv.upper, &filters, None).await;
                (idx, res)
            });
        }

        let mut outcomes: Vec<Option<std::result::Result<Vec<Entity>, StoreError>>> =
            (0..intervals.len()).map(|_| None).collect();
        let drain = async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((idx, res)) => outcomes[idx] = Some(res),
                    Err(e) => warn!(error = %e, "interval query task failed"),
                }
            }
        };
        match deadline {
            Some(deadline) => {
                if tokio::time::timeout_at(deadline, drain).await.is_err() {
                    set.abort_all();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    warn!(intervals = intervals.len(), elapsed_ms, "proximity search deadline exceeded; queries abandoned");
                    return Err(Error::Timeout { elapsed_ms });
                }
            }
            None => drain.await,
        }

        // Merge in interval order so the outcome does not depend on completion order.
        let mut dbg = SearchDebugInfo { intervals: intervals.len(), ..SearchDebugInfo::default() };
        let mut failures: Vec<(&BoundingInterval, StoreError)> = Vec::new();
        let mut merged: FxHashMap<_, Entity> = FxHashMap::default();
        for (iv, outcome) in intervals.iter().zip(outcomes) {
            let hits = match outcome {
                Some(Ok(hits)) => hits,
                Some(Err(e)) => {
                    failures.push((iv, e));
                    continue;
                }
                None => {
                    failures.push((iv, StoreError::Unavailable("interval query aborted".into())));
                    continue;
                }
            };
            dbg.raw_hits += hits.len();
            for e in hits {
                if e.location.is_none() {
                    continue;
                }
                match merged.get(&e.id) {
                    Some(kept) if !supersedes(&e, kept) => {}
                    _ => {
                        merged.insert(e.id.clone(), e);
                    }
                }
            }
        }

        if !failures.is_empty() {
            dbg.failed_intervals = failures.len();
            metrics::counter!("search_failed_intervals_total", failures.len() as u64);
            let detail = failures.iter().map(|(iv, e)| format!("{}: {}", iv, e)).collect::<Vec<_>>().join("; ");
            match policy {
                FailurePolicy::Strict => {
                    return Err(Error::PartialResultsSuppressed {
                        failed: failures.len(),
                        total: intervals.len(),
                        detail,
                    });
                }
                FailurePolicy::Lenient => {
                    warn!(failed = failures.len(), total = intervals.len(), %detail, "returning partial proximity results");
                    dbg.partial = true;
                }
            }
        }

        let mut entities: Vec<Entity> = merged.into_values().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        dbg.after_dedup = entities.len();
        Ok((entities, dbg))
    }
}

/// Newer recency wins; on equal recency the larger hash wins.
fn supersedes(candidate: &Entity, kept: &Entity) -> bool {
    let hash = |e: &Entity| e.location.as_ref().map(|l| l.hash().to_string());
    (candidate.recency_at, hash(candidate)) > (kept.recency_at, hash(kept))
}
