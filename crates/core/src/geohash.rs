//! Geohash cells as integers.
//!
//! A cell at precision `p` is identified by a `5p`-bit code interleaving longitude
//! (first) and latitude bits. The base32 alphabet is ASCII-ascending, so comparing
//! two hashes of the same length is the same as comparing their codes. Row/column
//! indices are computed in one place so stored keys and planned ranges agree.

use crate::{Coordinate, Error, Result};

pub const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
pub const MAX_PRECISION: usize = 12;
/// Precision of `GeoKey::hash` at rest (~1.2 m x 0.6 m cells).
pub const STORE_PRECISION: usize = 10;

/// Latitude/longitude extents of one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl CellBounds {
    pub fn center(&self) -> Coordinate {
        Coordinate { lat: (self.min_lat + self.max_lat) / 2.0, lng: (self.min_lng + self.max_lng) / 2.0 }
    }
}

/// `(lat_bits, lng_bits)` for a precision.
pub fn bits(precision: usize) -> (u32, u32) {
    let total = (5 * precision) as u32;
    (total / 2, (total + 1) / 2)
}

/// Cell height and width in degrees.
pub fn cell_size_deg(precision: usize) -> (f64, f64) {
    let (lat_bits, lng_bits) = bits(precision);
    (180.0 / (1u64 << lat_bits) as f64, 360.0 / (1u64 << lng_bits) as f64)
}

fn index_of(value: f64, min: f64, span: f64, nbits: u32) -> u64 {
    let n = 1u64 << nbits;
    let x = ((value - min) / span * n as f64).floor();
    if x <= 0.0 {
        0
    } else if x >= (n - 1) as f64 {
        n - 1
    } else {
        x as u64
    }
}

pub(crate) fn row_of(lat: f64, lat_bits: u32) -> u64 {
    index_of(lat, -90.0, 180.0, lat_bits)
}

pub(crate) fn col_of(lng: f64, lng_bits: u32) -> u64 {
    index_of(lng, -180.0, 360.0, lng_bits)
}

pub(crate) fn interleave(row: u64, col: u64, precision: usize) -> u64 {
    let (lat_bits, lng_bits) = bits(precision);
    let total = lat_bits + lng_bits;
    let mut code = 0u64;
    for i in 0..total {
        let bit = if i % 2 == 0 {
            (col >> (lng_bits - 1 - i / 2)) & 1
        } else {
            (row >> (lat_bits - 1 - i / 2)) & 1
        };
        code = (code << 1) | bit;
    }
    code
}

fn deinterleave(code: u64, precision: usize) -> (u64, u64) {
    let (lat_bits, lng_bits) = bits(precision);
    let total = lat_bits + lng_bits;
    let (mut row, mut col) = (0u64, 0u64);
    for i in 0..total {
        let bit = (code >> (total - 1 - i)) & 1;
        if i % 2 == 0 {
            col = (col << 1) | bit;
        } else {
            row = (row << 1) | bit;
        }
    }
    (row, col)
}

pub(crate) fn code_to_hash(code: u64, precision: usize) -> String {
    let mut out = String::with_capacity(precision);
    for k in 0..precision {
        let idx = (code >> (5 * (precision - 1 - k))) & 31;
        out.push(BASE32[idx as usize] as char);
    }
    out
}

fn hash_to_code(hash: &str) -> Result<u64> {
    let mut code = 0u64;
    for ch in hash.bytes() {
        let idx = BASE32
            .iter()
            .position(|b| *b == ch)
            .ok_or_else(|| Error::InvalidArgument(format!("invalid geohash character {:?} in {}", ch as char, hash)))?;
        code = (code << 5) | idx as u64;
    }
    Ok(code)
}

/// Cell code of the cell containing `c` at `precision`.
pub(crate) fn cell_code(c: &Coordinate, precision: usize) -> u64 {
    let (lat_bits, lng_bits) = bits(precision);
    interleave(row_of(c.lat, lat_bits), col_of(c.lng, lng_bits), precision)
}

/// Geohash of a (validated) coordinate. Precision is clamped to `1..=MAX_PRECISION`.
pub fn encode(c: &Coordinate, precision: usize) -> String {
    let precision = precision.clamp(1, MAX_PRECISION);
    code_to_hash(cell_code(c, precision), precision)
}

/// Bounds of the cell a hash names.
pub fn decode_bounds(hash: &str) -> Result<CellBounds> {
    let precision = hash.len();
    if precision == 0 || precision > MAX_PRECISION {
        return Err(Error::InvalidArgument(format!("geohash length must be 1..={}, got {}", MAX_PRECISION, precision)));
    }
    let (row, col) = deinterleave(hash_to_code(hash)?, precision);
    let (h, w) = cell_size_deg(precision);
    let min_lat = -90.0 + row as f64 * h;
    let min_lng = -180.0 + col as f64 * w;
    Ok(CellBounds { min_lat, max_lat: min_lat + h, min_lng, max_lng: min_lng + w })
}
