//! Location ingest: coalesce high-frequency position updates per entity and
//! commit them to a `MemoryStore` in small batches.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vicinity_core::{EntityId, GeoKey};

use crate::MemoryStore;

const FLUSH_EVERY: Duration = Duration::from_millis(8);

/// One pending change to an entity's presence on the map.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Located { id: EntityId, location: GeoKey },
    Removed(EntityId),
}

impl Delta {
    pub fn id(&self) -> &EntityId {
        match self {
            Delta::Located { id, .. } => id,
            Delta::Removed(id) => id,
        }
    }
}

/// Pending location changes, at most one per entity.
///
/// A phone may report several GPS fixes between two flushes; only the last one matters,
/// so a newer delta overwrites the queued one and keeps its place in line. A `Removed`
/// overwrites a queued fix the same way (and a later fix brings the entity back).
/// When `cap` distinct entities are pending, the one waiting longest is dropped.
pub struct Coalescer {
    pending: FxHashMap<EntityId, Delta>,
    arrival: VecDeque<EntityId>,
    cap: usize,
    dropped: u64,
    superseded: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            pending: FxHashMap::default(),
            arrival: VecDeque::new(),
            cap: cap.max(1),
            dropped: 0,
            superseded: 0,
        }
    }

    pub fn len(&self) -> usize { self.pending.len() }
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }
    /// Fixes overwritten by a newer one before they were flushed.
    pub fn superseded(&self) -> u64 { self.superseded }

    pub fn push(&mut self, d: Delta) {
        if let Some(queued) = self.pending.get_mut(d.id()) {
            *queued = d;
            self.superseded += 1;
            return;
        }
        if self.arrival.len() >= self.cap {
            self.evict_oldest();
        }
        self.arrival.push_back(d.id().clone());
        self.pending.insert(d.id().clone(), d);
    }

    fn evict_oldest(&mut self) {
        let Some(stale) = self.arrival.pop_front() else { return };
        self.pending.remove(&stale);
        self.dropped += 1;
        metrics::counter!("ingest_dropped_total", 1u64);
        warn!(id = %stale, cap = self.cap, "ingest queue full; dropped oldest pending update");
    }

    /// Take every pending delta, first-arrived first.
    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let pending = &mut self.pending;
        self.arrival.drain(..).filter_map(|id| pending.remove(&id)).collect()
    }
}

/// Owns the ingest task.
pub struct IngestHandle {
    task: JoinHandle<()>,
}

impl IngestHandle {
    /// Wait for the loop to drain and exit. It exits once every sender is dropped.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "ingest task ended abnormally");
        }
    }
}

fn flush(store: &MemoryStore, coalescer: &mut Coalescer) {
    let batch = coalescer.drain_ready();
    if batch.is_empty() {
        return;
    }
    let n = batch.len();
    match store.apply_batch(batch) {
        Ok(()) => {
            metrics::histogram!("ingest_batch_size", n as f64);
            debug!(batch = n, "ingest batch committed");
        }
        Err(e) => warn!(error = %e, batch = n, "ingest batch rejected"),
    }
}

/// Spawn an ingest loop feeding `store`. Returns the delta sender and a handle to the loop.
pub fn spawn_ingest(store: Arc<MemoryStore>, cap: usize) -> (mpsc::Sender<Delta>, IngestHandle) {
    let (tx, mut rx) = mpsc::channel::<Delta>(cap.max(1));

    let task = tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut ticker = tokio::time::interval(FLUSH_EVERY);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => coalescer.push(d),
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            flush(&store, &mut coalescer);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => flush(&store, &mut coalescer),
            }
        }
        info!(dropped = coalescer.dropped(), superseded = coalescer.superseded(), "ingest loop stopped");
    });

    (tx, IngestHandle { task })
}
