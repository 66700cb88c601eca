//! Bounds planning: turn a query circle into geohash key ranges.
//!
//! The circle's spherical bounding box is split at the antimeridian, covered by
//! geohash cells at a precision close to the radius, and runs of consecutive cell
//! codes are merged into one interval each. Intervals are sorted and disjoint.

use std::f64::consts::{FRAC_PI_2, PI};

use crate::distance::EARTH_RADIUS_M;
use crate::geohash::{self, STORE_PRECISION};
use crate::{BoundingInterval, Coordinate, Error, Result};

/// Sorts after every base32 character; `prefix + UPPER_SENTINEL` bounds all keys under `prefix`.
pub const UPPER_SENTINEL: char = '~';

/// Maps a query circle into key ranges whose union covers it.
pub trait BoundsPlanner: Send + Sync {
    fn plan(&self, center: &Coordinate, radius_m: f64) -> Result<Vec<BoundingInterval>>;
}

/// Default planner over geohash cells.
#[derive(Debug, Clone, Copy)]
pub struct GeohashPlanner {
    max_cells: usize,
}

impl Default for GeohashPlanner {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_CELLS)
    }
}

impl GeohashPlanner {
    pub const DEFAULT_MAX_CELLS: usize = 16;

    /// `max_cells` bounds the refinement step; the coarse cover (up to 4 cells per box) is
    /// always allowed.
    pub fn new(max_cells: usize) -> Self {
        Self { max_cells: max_cells.max(4) }
    }

    pub fn max_cells(&self) -> usize {
        self.max_cells
    }

    /// Precision the planner would use for this circle.
    pub fn precision_for(&self, center: &Coordinate, radius_m: f64) -> Result<usize> {
        validate(center, radius_m)?;
        Ok(self.choose_precision(&bounding_boxes(center, radius_m)))
    }

    fn choose_precision(&self, boxes: &[LatLngBox]) -> usize {
        let mut precision = coarse_precision(boxes);
        while precision < STORE_PRECISION && count_cells(boxes, precision + 1) <= self.max_cells as u64 {
            precision += 1;
        }
        precision
    }
}

impl BoundsPlanner for GeohashPlanner {
    fn plan(&self, center: &Coordinate, radius_m: f64) -> Result<Vec<BoundingInterval>> {
        validate(center, radius_m)?;
        let boxes = bounding_boxes(center, radius_m);
        let precision = self.choose_precision(&boxes);
        Ok(merge_runs(covering_codes(&boxes, precision), precision))
    }
}

fn validate(center: &Coordinate, radius_m: f64) -> Result<()> {
    center.validate()?;
    if !radius_m.is_finite() || radius_m <= 0.0 {
        return Err(Error::InvalidArgument(format!("radius must be a positive number of meters, got {}", radius_m)));
    }
    Ok(())
}

/// Degrees, `min_lng <= max_lng`, never crossing the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LatLngBox {
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
}

impl LatLngBox {
    fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    fn width(&self) -> f64 {
        self.max_lng - self.min_lng
    }
}

/// Spherical bounding box of the circle, split at the antimeridian.
fn bounding_boxes(center: &Coordinate, radius_m: f64) -> Vec<LatLngBox> {
    // Pad the angular radius so float error at the rim never drops a true match.
    let d = radius_m / EARTH_RADIUS_M * (1.0 + 1e-9) + 1e-12;
    let lat = center.lat.to_radians();
    let lng = center.lng.to_radians();
    let (mut min_lat, mut max_lat) = (lat - d, lat + d);

    let (min_lng, max_lng) = if d < PI && min_lat > -FRAC_PI_2 && max_lat < FRAC_PI_2 {
        let dlng = (d.sin() / lat.cos()).clamp(-1.0, 1.0).asin();
        (lng - dlng, lng + dlng)
    } else {
        // Circle contains a pole: every longitude is reachable.
        min_lat = min_lat.max(-FRAC_PI_2);
        max_lat = max_lat.min(FRAC_PI_2);
        (-PI, PI)
    };

    let (min_lat, max_lat) = (min_lat.to_degrees().max(-90.0), max_lat.to_degrees().min(90.0));
    let (min_lng, max_lng) = (min_lng.to_degrees(), max_lng.to_degrees());
    let mk = |min_lng: f64, max_lng: f64| LatLngBox { min_lat, max_lat, min_lng, max_lng };

    if max_lng - min_lng >= 360.0 {
        vec![mk(-180.0, 180.0)]
    } else if min_lng < -180.0 {
        vec![mk(-180.0, max_lng), mk(min_lng + 360.0, 180.0)]
    } else if max_lng > 180.0 {
        vec![mk(-180.0, max_lng - 360.0), mk(min_lng, 180.0)]
    } else {
        vec![mk(min_lng, max_lng)]
    }
}

/// Finest precision whose cells are at least as large as every box, so each box spans
/// at most two rows and two columns.
fn coarse_precision(boxes: &[LatLngBox]) -> usize {
    let height = boxes.iter().map(LatLngBox::height).fold(0.0, f64::max);
    let width = boxes.iter().map(LatLngBox::width).fold(0.0, f64::max);
    (1..=STORE_PRECISION)
        .rev()
        .find(|p| {
            let (h, w) = geohash::cell_size_deg(*p);
            h >= height && w >= width
        })
        .unwrap_or(1)
}

fn cell_ranges(b: &LatLngBox, precision: usize) -> ((u64, u64), (u64, u64)) {
    let (lat_bits, lng_bits) = geohash::bits(precision);
    (
        (geohash::row_of(b.min_lat, lat_bits), geohash::row_of(b.max_lat, lat_bits)),
        (geohash::col_of(b.min_lng, lng_bits), geohash::col_of(b.max_lng, lng_bits)),
    )
}

fn count_cells(boxes: &[LatLngBox], precision: usize) -> u64 {
    boxes
        .iter()
        .map(|b| {
            let ((r0, r1), (c0, c1)) = cell_ranges(b, precision);
            (r1 - r0 + 1).saturating_mul(c1 - c0 + 1)
        })
        .fold(0u64, u64::saturating_add)
}

fn covering_codes(boxes: &[LatLngBox], precision: usize) -> Vec<u64> {
    let mut codes = Vec::new();
    for b in boxes {
        let ((r0, r1), (c0, c1)) = cell_ranges(b, precision);
        for row in r0..=r1 {
            for col in c0..=c1 {
                codes.push(geohash::interleave(row, col, precision));
            }
        }
    }
    codes.sort_unstable();
    codes.dedup();
    codes
}

/// Collapse consecutive cell codes into `[hash(first), hash(last) + "~"]`.
fn merge_runs(codes: Vec<u64>, precision: usize) -> Vec<BoundingInterval> {
    let mut out = Vec::new();
    let mut iter = codes.into_iter();
    let Some(first) = iter.next() else { return out };
    let (mut start, mut end) = (first, first);
    let flush = |start: u64, end: u64, out: &mut Vec<BoundingInterval>| {
        let mut upper = geohash::code_to_hash(end, precision);
        upper.push(UPPER_SENTINEL);
        out.push(BoundingInterval { lower: geohash::code_to_hash(start, precision), upper });
    };
    for code in iter {
        if code == end + 1 {
            end = code;
        } else {
            flush(start, end, &mut out);
            start = code;
            end = code;
        }
    }
    flush(start, end, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{destination, within_radius};
    use proptest::prelude::*;

    fn c(lat: f64, lng: f64) -> Coordinate {
        Coordinate::new(lat, lng).unwrap()
    }

    fn covered(intervals: &[BoundingInterval], p: &Coordinate) -> bool {
        let h = geohash::encode(p, STORE_PRECISION);
        intervals.iter().any(|iv| iv.contains(&h))
    }

    #[test]
    fn rejects_bad_inputs_before_planning() {
        let planner = GeohashPlanner::default();
        let berlin = c(52.52, 13.405);
        for r in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(planner.plan(&berlin, r), Err(Error::InvalidArgument(_))), "radius {}", r);
        }
        let bad = Coordinate { lat: 95.0, lng: 0.0 };
        assert!(matches!(planner.plan(&bad, 100.0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn plan_is_deterministic_sorted_and_disjoint() {
        let planner = GeohashPlanner::default();
        let center = c(52.52, 13.405);
        let a = planner.plan(&center, 5_000.0).unwrap();
        let b = planner.plan(&center, 5_000.0).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
        for w in a.windows(2) {
            assert!(w[0].upper < w[1].lower, "{} overlaps {}", w[0], w[1]);
        }
        for iv in &a {
            assert!(iv.lower <= iv.upper);
        }
    }

    #[test]
    fn precision_tracks_radius() {
        let planner = GeohashPlanner::default();
        let center = c(52.52, 13.405);
        let mut last = STORE_PRECISION;
        for r in [10.0, 100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0] {
            let p = planner.precision_for(&center, r).unwrap();
            assert!(p <= last, "radius {} chose {} after {}", r, p, last);
            last = p;
        }
        assert!(planner.precision_for(&center, 10.0).unwrap() >= 7);
        assert!(planner.precision_for(&center, 1_000_000.0).unwrap() <= 3);
    }

    #[test]
    fn cell_budget_is_respected_after_refinement() {
        let planner = GeohashPlanner::new(9);
        let center = c(-33.8688, 151.2093);
        let p = planner.precision_for(&center, 2_000.0).unwrap();
        let boxes = bounding_boxes(&center, 2_000.0);
        assert!(p == coarse_precision(&boxes) || count_cells(&boxes, p) <= 9);
    }

    #[test]
    fn antimeridian_circle_covers_both_sides() {
        let planner = GeohashPlanner::default();
        let center = c(0.0, 179.999);
        let plan = planner.plan(&center, 1_000.0).unwrap();
        assert!(covered(&plan, &c(0.0, -179.999)));
        assert!(covered(&plan, &c(0.001, 179.995)));
        assert!(plan.iter().any(|iv| iv.lower.starts_with('x') || iv.lower.starts_with('r')));
        assert!(plan.iter().any(|iv| iv.lower.starts_with('8') || iv.lower.starts_with('2')));
    }

    #[test]
    fn polar_circle_spans_all_longitudes() {
        let planner = GeohashPlanner::default();
        let center = c(89.95, 10.0);
        let plan = planner.plan(&center, 20_000.0).unwrap();
        // Across the pole from the center, ~11 km away.
        assert!(covered(&plan, &c(89.95, -170.0)));
        assert!(covered(&plan, &c(90.0, 0.0)));
    }

    #[test]
    fn huge_radius_falls_back_to_coarsest_cells() {
        let planner = GeohashPlanner::default();
        let plan = planner.plan(&c(0.0, 0.0), 30_000_000.0).unwrap();
        assert_eq!(plan, vec![BoundingInterval { lower: "0".into(), upper: "z~".into() }]);
    }

    #[test]
    fn adjacent_cells_merge_into_one_interval() {
        let codes = vec![4, 5, 6, 9];
        let merged = merge_runs(codes, 1);
        assert_eq!(
            merged,
            vec![
                BoundingInterval { lower: "4".into(), upper: "6~".into() },
                BoundingInterval { lower: "9".into(), upper: "9~".into() },
            ]
        );
    }

    proptest! {
        #[test]
        fn every_point_in_radius_is_covered(
            lat in -89.0f64..89.0,
            lng in -180.0f64..=180.0,
            radius in 1.0f64..250_000.0,
            bearing in 0.0f64..360.0,
            frac in 0.0f64..=1.0,
        ) {
            let center = Coordinate { lat, lng };
            let p = destination(&center, bearing, radius * frac);
            prop_assume!(within_radius(&center, &p, radius));
            let plan = GeohashPlanner::default().plan(&center, radius).unwrap();
            prop_assert!(covered(&plan, &p), "{} not covered for center {} r={}", p, center, radius);
        }

        #[test]
        fn intervals_never_overlap(lat in -89.0f64..89.0, lng in -180.0f64..=180.0, radius in 1.0f64..500_000.0) {
            let plan = GeohashPlanner::default().plan(&Coordinate { lat, lng }, radius).unwrap();
            for w in plan.windows(2) {
                prop_assert!(w[0].upper < w[1].lower);
            }
        }
    }
}
