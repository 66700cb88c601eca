//! Vicinity core types: coordinates, geo keys, entities, filters and errors.
//!
//! Everything here is a value type. The pure parts of the proximity pipeline
//! (geohash cells, great-circle distance, bounds planning) live in submodules
//! so the search and store crates can share them without any I/O.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod distance;
pub mod error;
pub mod geohash;
pub mod planner;

pub use error::{Error, Result, StoreError};

pub mod prelude {
    pub use super::{
        BoundingInterval, Coordinate, Entity, EntityId, Filter, GeoKey, RankedCandidate, Tier,
        Value,
    };
    pub use super::distance::{distance, within_radius};
    pub use super::planner::{BoundsPlanner, GeohashPlanner};
    pub use super::{Error, Result, StoreError};
}

/// A WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Result<Self> {
        let c = Self { lat, lng };
        c.validate()?;
        Ok(c)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "coordinate out of range: lat={} lng={}",
                self.lat, self.lng
            )))
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat, self.lng)
    }
}

/// Coordinate plus its store sort key. The hash is always derived from the
/// coordinate; there is no way to build a `GeoKey` from a hash alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GeoKeyRepr")]
pub struct GeoKey {
    coordinate: Coordinate,
    hash: String,
}

#[derive(Deserialize)]
struct GeoKeyRepr {
    coordinate: Coordinate,
    // Accepted for wire compatibility, never trusted.
    #[serde(default)]
    #[allow(dead_code)]
    hash: Option<String>,
}

impl TryFrom<GeoKeyRepr> for GeoKey {
    type Error = Error;
    fn try_from(r: GeoKeyRepr) -> Result<Self> {
        GeoKey::new(r.coordinate)
    }
}

impl GeoKey {
    pub fn new(coordinate: Coordinate) -> Result<Self> {
        coordinate.validate()?;
        let hash = geohash::encode(&coordinate, geohash::STORE_PRECISION);
        Ok(Self { coordinate, hash })
    }

    pub fn coordinate(&self) -> Coordinate {
        self.coordinate
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Opaque entity identifier. Non-empty, at most 128 bytes, no whitespace or control characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub const MAX_LEN: usize = 128;

    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return Err(Error::InvalidArgument(format!(
                "entity id must be 1..={} bytes, got {}",
                Self::MAX_LEN,
                raw.len()
            )));
        }
        if raw.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(Error::InvalidArgument(format!("entity id has invalid characters: {:?}", raw)));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityId {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl FromStr for EntityId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ranking priority group; higher ranks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tier(pub u8);

/// Caller-defined attribute value. Only what filters can compare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Searchable record (a user profile in the app).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// `None` until a location is registered; such entities never match a proximity query.
    pub location: Option<GeoKey>,
    pub tier: Tier,
    pub recency_at: DateTime<Utc>,
    pub credits: u32,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            location: None,
            tier: Tier::default(),
            recency_at: DateTime::<Utc>::default(),
            credits: 0,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_location(mut self, coordinate: Coordinate) -> Result<Self> {
        self.relocate(coordinate)?;
        Ok(self)
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_recency(mut self, at: DateTime<Utc>) -> Self {
        self.recency_at = at;
        self
    }

    pub fn with_credits(mut self, credits: u32) -> Self {
        self.credits = credits;
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Replace coordinate and hash together.
    pub fn relocate(&mut self, coordinate: Coordinate) -> Result<()> {
        self.location = Some(GeoKey::new(coordinate)?);
        Ok(())
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        self.location.as_ref().map(GeoKey::coordinate)
    }
}

/// Store-side predicate forwarded verbatim with every range query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Equals { key: String, value: Value },
    In { key: String, values: SmallVec<[Value; 4]> },
    ArrayContains { key: String, value: Value },
    ArrayContainsAny { key: String, values: SmallVec<[Value; 4]> },
}

impl Filter {
    /// Upper bound on list operands, matching what document stores accept.
    pub const MAX_LIST_VALUES: usize = 10;

    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        let f = Filter::Equals { key: key.into(), value: value.into() };
        f.validate()?;
        Ok(f)
    }

    pub fn in_list<V: Into<Value>>(key: impl Into<String>, values: impl IntoIterator<Item = V>) -> Result<Self> {
        let f = Filter::In { key: key.into(), values: values.into_iter().map(Into::into).collect() };
        f.validate()?;
        Ok(f)
    }

    pub fn array_contains(key: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        let f = Filter::ArrayContains { key: key.into(), value: value.into() };
        f.validate()?;
        Ok(f)
    }

    pub fn array_contains_any<V: Into<Value>>(
        key: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Result<Self> {
        let f = Filter::ArrayContainsAny { key: key.into(), values: values.into_iter().map(Into::into).collect() };
        f.validate()?;
        Ok(f)
    }

    pub fn key(&self) -> &str {
        match self {
            Filter::Equals { key, .. }
            | Filter::In { key, .. }
            | Filter::ArrayContains { key, .. }
            | Filter::ArrayContainsAny { key, .. } => key,
        }
    }

    /// Filters can also arrive deserialized, so this is rechecked before any query runs.
    pub fn validate(&self) -> Result<()> {
        if self.key().trim().is_empty() {
            return Err(Error::InvalidArgument("filter key must not be empty".into()));
        }
        match self {
            Filter::Equals { value, .. } | Filter::ArrayContains { value, .. } => {
                if !value.is_scalar() {
                    return Err(Error::InvalidArgument(format!("filter on {} needs a scalar operand", self.key())));
                }
            }
            Filter::In { values, .. } | Filter::ArrayContainsAny { values, .. } => {
                if values.is_empty() || values.len() > Self::MAX_LIST_VALUES {
                    return Err(Error::InvalidArgument(format!(
                        "filter on {} needs 1..={} values, got {}",
                        self.key(),
                        Self::MAX_LIST_VALUES,
                        values.len()
                    )));
                }
                if values.iter().any(|v| !v.is_scalar()) {
                    return Err(Error::InvalidArgument(format!("filter on {} has a nested list", self.key())));
                }
            }
        }
        Ok(())
    }

    /// Evaluate against an entity's attributes. Used by store adapters that cannot push the
    /// predicate down.
    pub fn matches(&self, attributes: &BTreeMap<String, Value>) -> bool {
        let Some(actual) = attributes.get(self.key()) else { return false };
        match self {
            Filter::Equals { value, .. } => actual == value,
            Filter::In { values, .. } => actual.is_scalar() && values.iter().any(|v| v == actual),
            Filter::ArrayContains { value, .. } => match actual {
                Value::List(items) => items.iter().any(|v| v == value),
                _ => false,
            },
            Filter::ArrayContainsAny { values, .. } => match actual {
                Value::List(items) => items.iter().any(|v| values.contains(v)),
                _ => false,
            },
        }
    }
}

/// Inclusive range over the geohash sort order: `lower <= hash <= upper`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BoundingInterval {
    pub lower: String,
    pub upper: String,
}

impl BoundingInterval {
    pub fn contains(&self, hash: &str) -> bool {
        self.lower.as_str() <= hash && hash <= self.upper.as_str()
    }
}

impl fmt::Display for BoundingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// An entity that survived the radius filter, with its exact distance from the center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub entity: Entity,
    pub distance_m: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn coordinate_range_checks() {
        assert!(Coordinate::new(52.52, 13.405).is_ok());
        assert!(Coordinate::new(90.0, -180.0).is_ok());
        assert!(matches!(Coordinate::new(90.1, 0.0), Err(Error::InvalidArgument(_))));
        assert!(matches!(Coordinate::new(0.0, 180.5), Err(Error::InvalidArgument(_))));
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn geo_key_hash_follows_coordinate() {
        let mut e = Entity::new(EntityId::parse("u1").unwrap())
            .with_location(Coordinate::new(57.64911, 10.40744).unwrap())
            .unwrap();
        assert_eq!(e.location.as_ref().unwrap().hash(), "u4pruydqqv");
        e.relocate(Coordinate::new(42.6, -5.6).unwrap()).unwrap();
        assert!(e.location.as_ref().unwrap().hash().starts_with("ezs42"));
    }

    #[test]
    fn geo_key_deserialize_recomputes_hash() {
        let raw = r#"{"coordinate":{"lat":42.6,"lng":-5.6},"hash":"zzzzzzzzzz"}"#;
        let key: GeoKey = serde_json::from_str(raw).unwrap();
        assert!(key.hash().starts_with("ezs42"));

        let bad = r#"{"coordinate":{"lat":91.0,"lng":0.0}}"#;
        assert!(serde_json::from_str::<GeoKey>(bad).is_err());
    }

    #[test]
    fn entity_id_shape() {
        assert!(EntityId::parse("abc-123").is_ok());
        assert!(EntityId::parse("").is_err());
        assert!(EntityId::parse("has space").is_err());
        assert!(EntityId::parse("x".repeat(EntityId::MAX_LEN + 1)).is_err());
        assert!(serde_json::from_str::<EntityId>("\"\"").is_err());
    }

    #[test]
    fn filter_construction_rejects_bad_operands() {
        assert!(Filter::equals("", "x").is_err());
        assert!(Filter::in_list::<Value>("gender", []).is_err());
        assert!(Filter::in_list("n", (0..11).map(|i| i as i64)).is_err());
        assert!(Filter::equals("k", Value::List(vec![])).is_err());
        assert!(Filter::array_contains_any("k", [Value::List(vec![1i64.into()])]).is_err());
    }

    #[test]
    fn filter_matching() {
        let a = attrs(&[
            ("gender", "f".into()),
            ("age", 31i64.into()),
            ("interests", Value::List(vec!["hiking".into(), "jazz".into()])),
        ]);
        assert!(Filter::equals("gender", "f").unwrap().matches(&a));
        assert!(!Filter::equals("gender", "m").unwrap().matches(&a));
        assert!(!Filter::equals("missing", "f").unwrap().matches(&a));
        assert!(Filter::in_list("age", [30i64, 31]).unwrap().matches(&a));
        assert!(!Filter::in_list("interests", ["jazz"]).unwrap().matches(&a));
        assert!(Filter::array_contains("interests", "jazz").unwrap().matches(&a));
        assert!(!Filter::array_contains("gender", "f").unwrap().matches(&a));
        assert!(Filter::array_contains_any("interests", ["chess", "hiking"]).unwrap().matches(&a));
        assert!(!Filter::array_contains_any("interests", ["chess"]).unwrap().matches(&a));
    }

    #[test]
    fn filter_wire_shape() {
        let f = Filter::in_list("tier", [1i64, 2]).unwrap();
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v, serde_json::json!({"op": "in", "key": "tier", "values": [1, 2]}));
        let back: Filter = serde_json::from_value(v).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn interval_bounds_are_inclusive() {
        let iv = BoundingInterval { lower: "u33d".into(), upper: "u33e~".into() };
        assert!(iv.contains("u33d"));
        assert!(iv.contains("u33dzzzzzz"));
        assert!(iv.contains("u33ezzzzzz"));
        assert!(!iv.contains("u33f"));
        assert!(!iv.contains("u33czzzzzz"));
    }
}
