//! Ordering of proximity results and position lookup.

use std::cmp::Ordering;

use vicinity_core::{EntityId, RankedCandidate};

/// Position reported for an entity missing from the ranking. A display fallback only;
/// callers must check the `found` flag before treating it as a rank.
pub const DEFAULT_POSITION: usize = 1;

/// Tier desc, then recency desc, then id asc. Ids are unique within a merged result, so
/// this is a total order.
pub fn compare(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.entity
        .tier
        .cmp(&a.entity.tier)
        .then_with(|| b.entity.recency_at.cmp(&a.entity.recency_at))
        .then_with(|| a.entity.id.cmp(&b.entity.id))
}

pub fn rank(mut candidates: Vec<RankedCandidate>) -> Vec<RankedCandidate> {
    candidates.sort_by(compare);
    candidates
}

/// Nearest first; ties by id.
pub fn rank_by_distance(mut candidates: Vec<RankedCandidate>) -> Vec<RankedCandidate> {
    candidates.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m).then_with(|| a.entity.id.cmp(&b.entity.id)));
    candidates
}

/// 1-based position of `target`, or `(DEFAULT_POSITION, false)`.
pub fn position_of(ranked: &[RankedCandidate], target: &EntityId) -> (usize, bool) {
    match ranked.iter().position(|c| &c.entity.id == target) {
        Some(i) => (i + 1, true),
        None => (DEFAULT_POSITION, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;
    use vicinity_core::{Entity, Tier};

    fn cand(id: &str, tier: u8, recency_s: i64, distance_m: f64) -> RankedCandidate {
        let at = DateTime::<Utc>::default() + Duration::seconds(recency_s);
        RankedCandidate {
            entity: Entity::new(EntityId::parse(id).unwrap()).with_tier(Tier(tier)).with_recency(at),
            distance_m,
        }
    }

    fn ids(v: &[RankedCandidate]) -> Vec<&str> {
        v.iter().map(|c| c.entity.id.as_str()).collect()
    }

    #[test]
    fn tier_then_recency_then_id() {
        let ranked = rank(vec![
            cand("t1", 1, 300, 10.0),
            cand("t3-old", 3, 100, 10.0),
            cand("t3-new", 3, 200, 10.0),
            cand("b", 2, 50, 10.0),
            cand("a", 2, 50, 10.0),
        ]);
        assert_eq!(ids(&ranked), vec!["t3-new", "t3-old", "a", "b", "t1"]);
    }

    #[test]
    fn by_distance_orders_nearest_first() {
        let ranked = rank_by_distance(vec![cand("far", 9, 0, 900.0), cand("y", 0, 0, 5.0), cand("x", 0, 0, 5.0)]);
        assert_eq!(ids(&ranked), vec!["x", "y", "far"]);
    }

    #[test]
    fn position_of_present_and_absent() {
        let ranked = rank(vec![cand("a", 1, 0, 1.0), cand("b", 2, 0, 1.0)]);
        assert_eq!(position_of(&ranked, &EntityId::parse("b").unwrap()), (1, true));
        assert_eq!(position_of(&ranked, &EntityId::parse("a").unwrap()), (2, true));
        assert_eq!(position_of(&ranked, &EntityId::parse("nonexistent").unwrap()), (DEFAULT_POSITION, false));
        assert_eq!(position_of(&[], &EntityId::parse("a").unwrap()), (1, false));
    }

    fn candidates() -> impl Strategy<Value = Vec<RankedCandidate>> {
        prop::collection::btree_map("[a-z]{1,6}", (0u8..4, 0i64..5, 0.0f64..5_000.0), 0..24).prop_map(|m| {
            m.into_iter().map(|(id, (tier, recency, d))| cand(&id, tier, recency, d)).collect()
        })
    }

    proptest! {
        #[test]
        fn rank_is_a_deterministic_total_order(input in candidates(), seed in any::<u64>()) {
            let ranked = rank(input.clone());
            for w in ranked.windows(2) {
                let (x, y) = (&w[0].entity, &w[1].entity);
                prop_assert!(x.tier >= y.tier);
                if x.tier == y.tier {
                    prop_assert!(x.recency_at >= y.recency_at);
                    if x.recency_at == y.recency_at {
                        prop_assert!(x.id < y.id);
                    }
                }
            }
            // Input order does not matter.
            let mut shuffled = input;
            let n = shuffled.len();
            if n > 1 {
                shuffled.rotate_left((seed % n as u64) as usize);
                shuffled.reverse();
            }
            prop_assert_eq!(rank(shuffled), ranked.clone());
            prop_assert_eq!(rank(ranked.clone()), ranked);
        }

        #[test]
        fn every_ranked_entry_reports_its_position(input in candidates()) {
            let ranked = rank(input);
            for (i, c) in ranked.iter().enumerate() {
                prop_assert_eq!(position_of(&ranked, &c.entity.id), (i + 1, true));
            }
        }
    }
}
