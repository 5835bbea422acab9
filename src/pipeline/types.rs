//! Core data types shared by the aggregation pipeline
//!
//! - `FacetValue` - one scalar level of a dimension (string, int or float)
//! - `Record` - a facted event as it travels through the inbound queue
//! - `Facet` - one dimensional rollup derived from a record
//! - `StatsRecord` - the durable per-facet aggregate

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Counter name → integer, used for record values, buffered deltas and
/// durable totals alike.
pub type CounterMap = BTreeMap<String, i64>;

/// Text-encoded content digest identifying a facet.
pub type FacetId = String;

/// A single scalar facet component
///
/// Every component hashes through its canonical text form, so the variant
/// matters: `Int(1)` encodes as `1` while `Float(1.0)` encodes as `1.000000`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FacetValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl FacetValue {
    /// Canonical text encoding used for hashing and child labels
    ///
    /// Integers use plain decimal, floats use fixed six-digit precision.
    pub fn canonical(&self) -> String {
        match self {
            FacetValue::Int(v) => v.to_string(),
            FacetValue::Float(v) => format!("{:.6}", v),
            FacetValue::Text(v) => v.clone(),
        }
    }
}

impl fmt::Display for FacetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<&str> for FacetValue {
    fn from(value: &str) -> Self {
        FacetValue::Text(value.to_string())
    }
}

impl From<String> for FacetValue {
    fn from(value: String) -> Self {
        FacetValue::Text(value)
    }
}

impl From<i64> for FacetValue {
    fn from(value: i64) -> Self {
        FacetValue::Int(value)
    }
}

impl From<f64> for FacetValue {
    fn from(value: f64) -> Self {
        FacetValue::Float(value)
    }
}

/// Ordered `(dimension name, ordered levels)` pairs of a record
pub type FacetSet = Vec<(String, Vec<FacetValue>)>;

#[derive(Debug, Error)]
#[error("corrupt record payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// A facted event record
///
/// Immutable once enqueued apart from `ttl`, the retry counter owned by the
/// queue consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub facets: FacetSet,
    pub values: CounterMap,
    #[serde(default)]
    pub ttl: u32,
}

impl Record {
    pub fn new(id: impl Into<String>, facets: FacetSet, values: CounterMap) -> Self {
        Self {
            id: id.into(),
            facets,
            values,
            ttl: 0,
        }
    }

    /// Serialize for the queue wire format (JSON)
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a queue payload
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// One dimensional rollup derived from a record
///
/// `child` is empty for root facets (no parent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub id: FacetId,
    pub parent_id: FacetId,
    pub child: String,
}

/// Durable per-facet aggregate
///
/// `lineage_token` is unique per successful write and is only ever used as
/// the expected value of a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub facet_parent_id: FacetId,
    pub facet: String,
    pub lineage_token: String,
    pub values: CounterMap,
}
