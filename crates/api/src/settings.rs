//! Runtime settings read from the environment.

use std::time::Duration;

use serde::Serialize;
use vicinity_core::planner::GeohashPlanner;

use crate::boost::BoostService;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// Deadline applied to searches that do not carry one.
    pub search_timeout: Duration,
    pub max_cells: usize,
    /// Deployment-wide opt-in to partial results.
    pub lenient_search: bool,
    pub boost_max_attempts: u32,
    pub queue_cap: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_millis(5_000),
            max_cells: GeohashPlanner::DEFAULT_MAX_CELLS,
            lenient_search: false,
            boost_max_attempts: BoostService::DEFAULT_MAX_ATTEMPTS,
            queue_cap: 2048,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; unset or unparsable values keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            search_timeout: num("VICINITY_SEARCH_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(d.search_timeout),
            max_cells: num("VICINITY_MAX_CELLS").map(|v| v as usize).unwrap_or(d.max_cells),
            lenient_search: get("VICINITY_LENIENT_SEARCH")
                .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(d.lenient_search),
            boost_max_attempts: num("VICINITY_BOOST_MAX_ATTEMPTS")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(d.boost_max_attempts),
            queue_cap: num("VICINITY_QUEUE_CAP").map(|v| v as usize).filter(|v| *v > 0).unwrap_or(d.queue_cap),
        }
    }
}
