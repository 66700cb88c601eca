//! Vicinity public API façade (in-process).
//!
//! Frontends depend on the `VicinityApi` trait and the transport-friendly types here;
//! `InProcApi` wires the planner, executor and boost service over a `GeoStore`.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vicinity_core::planner::GeohashPlanner;
use vicinity_core::{Coordinate, EntityId, Filter, RankedCandidate};
use vicinity_search::{FailurePolicy, ProximityQueryExecutor, SearchDebugInfo, SearchOpts};
use vicinity_store::{spawn_ingest, Delta, GeoStore, IngestHandle, MemoryStore};

pub mod boost;
pub mod settings;

pub use boost::{BoostReceipt, BoostService};
pub use settings::Settings;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub candidates: Vec<RankedCandidate>,
    pub debug: SearchDebugInfo,
    pub took_ms: u64,
}

/// What the UI should show instead of a raw error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserNotice {
    NoNearbyMatches,
    BuyMoreCredits,
    None,
}

impl UserNotice {
    pub fn message(&self) -> Option<&'static str> {
        match self {
            UserNotice::NoNearbyMatches => Some("No nearby matches found"),
            UserNotice::BuyMoreCredits => Some("You are out of boosts. Buy more credits to boost again."),
            UserNotice::None => None,
        }
    }
}

/// API errors suitable for transport. Store internals are reduced to a short message.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timeout: {0} ms")]
    Timeout(u64),
    #[error("partial: {0}")]
    Partial(String),
    #[error("insufficient_credits: {0}")]
    InsufficientCredits(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// The façade call an error came from; notices depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Search,
    Position,
    Boost,
}

impl ApiError {
    /// Failed lookups read as an empty area. A failed boost is reported as an error.
    pub fn notice(&self, op: Operation) -> UserNotice {
        match (self, op) {
            (ApiError::InsufficientCredits(_), _) => UserNotice::BuyMoreCredits,
            (ApiError::Timeout(_) | ApiError::Unavailable(_) | ApiError::Partial(_), Operation::Search | Operation::Position) => {
                UserNotice::NoNearbyMatches
            }
            _ => UserNotice::None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Timeout(_) | ApiError::Unavailable(_) | ApiError::Partial(_))
    }
}

impl From<vicinity_core::Error> for ApiError {
    fn from(e: vicinity_core::Error) -> Self {
        use vicinity_core::Error as E;
        match e {
            E::InvalidArgument(m) => ApiError::Validation(m),
            E::StoreUnavailable { context, message } => ApiError::Unavailable(format!("{}: {}", context, message)),
            E::Timeout { elapsed_ms } => ApiError::Timeout(elapsed_ms),
            E::InsufficientCredits { id } => ApiError::InsufficientCredits(id.to_string()),
            E::PartialResultsSuppressed { failed, total, detail } => {
                warn!(failed, total, %detail, "api: partial results suppressed");
                ApiError::Partial(format!("{} of {} interval queries failed", failed, total))
            }
            E::NotFound(id) => ApiError::NotFound(id.to_string()),
            E::Conflict { id, attempts } => ApiError::Conflict(format!("{} after {} attempts", id, attempts)),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// One re-evaluation of a watched area.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyUpdate {
    /// Store epoch the search ran after.
    pub epoch: u64,
    pub result: ApiResult<SearchResponse>,
}

/// Declarative Vicinity API surface.
#[async_trait::async_trait]
pub trait VicinityApi: Send + Sync {
    /// Entities within `radius_m` of `center` passing `filters`, ranked.
    async fn search(
        &self,
        center: Coordinate,
        radius_m: f64,
        filters: Vec<Filter>,
        opts: SearchOpts,
    ) -> ApiResult<SearchResponse>;

    /// 1-based position of `target_id` in `ranked`; `(1, false)` when absent.
    fn position_of(&self, ranked: &[RankedCandidate], target_id: &str) -> ApiResult<(usize, bool)>;

    async fn boost(&self, entity_id: &str) -> ApiResult<BoostReceipt>;

    /// Search the whole area (no limit) and report where `target_id` ranks. Never runs
    /// lenient; any failed range query fails the call.
    async fn my_position(
        &self,
        center: Coordinate,
        radius_m: f64,
        filters: Vec<Filter>,
        target_id: &str,
    ) -> ApiResult<(usize, bool)>;

    /// Re-run a search whenever the store changes. Dropping the handle stops it.
    async fn watch_nearby(
        &self,
        center: Coordinate,
        radius_m: f64,
        filters: Vec<Filter>,
        opts: SearchOpts,
    ) -> ApiResult<NearbyWatch>;
}

// ----------------- In-process implementation -----------------

/// In-process implementation that calls the internal crates directly.
pub struct InProcApi {
    executor: Arc<ProximityQueryExecutor>,
    boost: BoostService,
    settings: Settings,
}

impl InProcApi {
    pub fn new(store: Arc<dyn GeoStore>, settings: Settings) -> Self {
        let planner = Arc::new(GeohashPlanner::new(settings.max_cells));
        let executor = Arc::new(ProximityQueryExecutor::new(Arc::clone(&store), planner));
        let boost = BoostService::new(store, settings.boost_max_attempts);
        Self { executor, boost, settings }
    }

    /// In-RAM deployment fed by a location stream.
    pub fn with_ingest(store: Arc<MemoryStore>, settings: Settings) -> (Self, mpsc::Sender<Delta>, IngestHandle) {
        let (tx, ingest) = spawn_ingest(Arc::clone(&store), settings.queue_cap);
        (Self::new(store, settings), tx, ingest)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn parse_id(raw: &str) -> ApiResult<EntityId> {
        EntityId::parse(raw).map_err(ApiError::from)
    }
}

/// Fill in the deployment defaults for what the caller left unset.
fn effective_opts(mut opts: SearchOpts, timeout: Duration, lenient: bool) -> SearchOpts {
    if opts.deadline.is_none() {
        opts.deadline = Some(tokio::time::Instant::now() + timeout);
    }
    if lenient {
        opts.policy = FailurePolicy::Lenient;
    }
    opts
}

async fn run_search(
    executor: &ProximityQueryExecutor,
    center: &Coordinate,
    radius_m: f64,
    filters: &[Filter],
    opts: SearchOpts,
) -> ApiResult<SearchResponse> {
    let t0 = Instant::now();
    let res = executor.search(center, radius_m, filters, opts).await?;
    Ok(SearchResponse { candidates: res.candidates, debug: res.debug, took_ms: t0.elapsed().as_millis() as u64 })
}

#[async_trait::async_trait]
impl VicinityApi for InProcApi {
    async fn search(
        &self,
        center: Coordinate,
        radius_m: f64,
        filters: Vec<Filter>,
        opts: SearchOpts,
    ) -> ApiResult<SearchResponse> {
        let t0 = Instant::now();
        info!(center = %center, radius_m, filters = filters.len(), limit = ?opts.limit, "api: search start");
        let opts = effective_opts(opts, self.settings.search_timeout, self.settings.lenient_search);
        match run_search(&self.executor, &center, radius_m, &filters, opts).await {
            Ok(resp) => {
                info!(
                    hits = resp.candidates.len(),
                    intervals = resp.debug.intervals,
                    partial = resp.debug.partial,
                    took_ms = %t0.elapsed().as_millis(),
                    "api: search ok"
                );
                Ok(resp)
            }
            Err(e) => {
                info!(error = %e, took_ms = %t0.elapsed().as_millis(), "api: search failed");
                Err(e)
            }
        }
    }

    fn position_of(&self, ranked: &[RankedCandidate], target_id: &str) -> ApiResult<(usize, bool)> {
        let id = Self::parse_id(target_id)?;
        Ok(vicinity_search::position_of(ranked, &id))
    }

    async fn boost(&self, entity_id: &str) -> ApiResult<BoostReceipt> {
        let t0 = Instant::now();
        let id = Self::parse_id(entity_id)?;
        info!(id = %id, "api: boost start");
        let receipt = self.boost.boost(&id).await?;
        info!(id = %id, remaining = receipt.remaining_credits, took_ms = %t0.elapsed().as_millis(), "api: boost ok");
        Ok(receipt)
    }

    async fn my_position(
        &self,
        center: Coordinate,
        radius_m: f64,
        filters: Vec<Filter>,
        target_id: &str,
    ) -> ApiResult<(usize, bool)> {
        let t0 = Instant::now();
        let id = Self::parse_id(target_id)?;
        info!(id = %id, center = %center, radius_m, "api: my_position start");
        // A rank read off partial results is wrong, not degraded: always strict.
        let opts = effective_opts(SearchOpts::default(), self.settings.search_timeout, false);
        let resp = run_search(&self.executor, &center, radius_m, &filters, opts).await?;
        let (position, found) = vicinity_search::position_of(&resp.candidates, &id);
        info!(position, found, of = resp.candidates.len(), took_ms = %t0.elapsed().as_millis(), "api: my_position ok");
        Ok((position, found))
    }

    async fn watch_nearby(
        &self,
        center: Coordinate,
        radius_m: f64,
        filters: Vec<Filter>,
        opts: SearchOpts,
    ) -> ApiResult<NearbyWatch> {
        info!(center = %center, radius_m, filters = filters.len(), "api: watch_nearby start");
        let mut epochs = self.executor.store().subscribe_epoch();
        let epoch0 = *epochs.borrow_and_update();
        let (timeout, lenient) = (self.settings.search_timeout, self.settings.lenient_search);
        let base = SearchOpts { deadline: None, ..opts };
        // Validation and the first result happen before the task starts.
        let first = run_search(&self.executor, &center, radius_m, &filters, effective_opts(base, timeout, lenient)).await?;

        let (tx, rx) = mpsc::channel::<NearbyUpdate>(16);
        let executor = Arc::clone(&self.executor);
        let task = tokio::spawn(async move {
            if tx.send(NearbyUpdate { epoch: epoch0, result: Ok(first) }).await.is_err() {
                return;
            }
            let mut updates = 1usize;
            while epochs.changed().await.is_ok() {
                let epoch = *epochs.borrow_and_update();
                let opts = effective_opts(base, timeout, lenient);
                let result = run_search(&executor, &center, radius_m, &filters, opts).await;
                if let Err(e) = &result {
                    debug!(epoch, error = %e, "nearby watch: search failed");
                }
                if tx.send(NearbyUpdate { epoch, result }).await.is_err() {
                    break;
                }
                updates += 1;
            }
            info!(updates, "api: nearby watch ended");
        });
        Ok(NearbyWatch { rx, cancel: CancelHandle { task: Some(task) } })
    }
}

// ----------------- Streaming primitives -----------------

/// Aborts the underlying task on `cancel()` or drop.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Live feed of search results for one area; owns its background task.
pub struct NearbyWatch {
    pub rx: mpsc::Receiver<NearbyUpdate>,
    pub cancel: CancelHandle,
}

impl NearbyWatch {
    pub async fn next(&mut self) -> Option<NearbyUpdate> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn caller_deadline_wins_and_lenient_is_deployment_opt_in() {
        let filled = effective_opts(SearchOpts::default(), Duration::from_secs(5), false);
        assert!(filled.deadline.is_some());
        assert_eq!(filled.policy, FailurePolicy::Strict);

        let own = SearchOpts::default().with_timeout(Duration::from_millis(10));
        let kept = effective_opts(own, Duration::from_secs(5), true);
        assert_eq!(kept.deadline, own.deadline);
        assert_eq!(kept.policy, FailurePolicy::Lenient);
    }
}
