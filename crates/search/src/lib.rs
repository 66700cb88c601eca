//! Vicinity search: fan a proximity query out over the store, merge, filter by exact
//! distance and rank.

#![forbid(unsafe_code)]

pub mod executor;
pub mod rank;

pub use executor::{FailurePolicy, Order, ProximityQueryExecutor, SearchDebugInfo, SearchOpts, SearchResult};
pub use rank::{position_of, rank, rank_by_distance, DEFAULT_POSITION};
