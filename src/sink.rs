//! Producer side: validate raw records and enqueue them for aggregation
//!
//! Accepted payload shape:
//!
//! ```text
//! {
//!     "id": "b32-or-int",
//!     "facets": {"device": ["tablet", "apple"], "time": [2013, 1, 15], "site": "main"},
//!     "values": {"views": 1, "view_duration": 38}
//! }
//! ```
//!
//! Facet levels are strings, ints or floats (a scalar is a one-level list);
//! values are non-negative integers. Anything else is refused here and never
//! reaches the queue.

use crate::pipeline::backend::{BackendError, RecordQueue};
use crate::pipeline::engine::MAX_PERMUTATIONS;
use crate::pipeline::facets::permutation_count;
use crate::pipeline::types::{CounterMap, FacetSet, FacetValue, Record};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("no data received")]
    Missing,

    #[error("data must be an object with \"id\", \"facets\" and \"values\" keys")]
    Shape,

    #[error("the \"id\" must be a string or int")]
    Id,

    #[error("\"facets\" must be an object")]
    Facets,

    #[error("facet values for '{0}' must be a string, int or float - or a list of them")]
    FacetValues(String),

    #[error("facet '{0}[{1}]' must be a string, int or float")]
    FacetLevel(String, usize),

    #[error("\"values\" must be an object")]
    Values,

    #[error("value '{0}' must be a non-negative integer")]
    Value(String),

    #[error("facets expand into {0} rollups (limit {1})")]
    TooManyFacets(usize, usize),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid record: {0}")]
    Validation(#[from] ValidationError),

    #[error("enqueue failed: {0}")]
    Backend(#[from] BackendError),
}

fn scalar(value: &Value) -> Option<FacetValue> {
    match value {
        Value::String(s) => Some(FacetValue::Text(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FacetValue::Int(i))
            } else if n.is_u64() {
                // Past i64: keep the exact decimal text
                Some(FacetValue::Text(n.to_string()))
            } else {
                n.as_f64().map(FacetValue::Float)
            }
        }
        _ => None,
    }
}

/// Validate a facets object, sorted by dimension name
pub fn sanitize_facets(input: &Value) -> Result<FacetSet, ValidationError> {
    let object = input.as_object().ok_or(ValidationError::Facets)?;

    let mut facets = FacetSet::with_capacity(object.len());
    for (name, raw) in object {
        let levels = match raw {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| scalar(item).ok_or_else(|| ValidationError::FacetLevel(name.clone(), i)))
                .collect::<Result<Vec<_>, _>>()?,
            other => vec![scalar(other).ok_or_else(|| ValidationError::FacetValues(name.clone()))?],
        };
        facets.push((name.clone(), levels));
    }

    facets.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(facets)
}

/// Validate a values object
pub fn sanitize_values(input: &Value) -> Result<CounterMap, ValidationError> {
    let object = input.as_object().ok_or(ValidationError::Values)?;

    object
        .iter()
        .map(|(name, raw)| match raw.as_i64() {
            Some(value) if value >= 0 => Ok((name.clone(), value)),
            _ => Err(ValidationError::Value(name.clone())),
        })
        .collect()
}

/// Build a queue record from a producer payload
pub fn make_record(data: &Value) -> Result<Record, ValidationError> {
    if data.is_null() {
        return Err(ValidationError::Missing);
    }
    let object = data.as_object().ok_or(ValidationError::Shape)?;
    let (Some(raw_facets), Some(raw_values)) = (object.get("facets"), object.get("values")) else {
        return Err(ValidationError::Shape);
    };

    let id = match object.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
        _ => return Err(ValidationError::Id),
    };

    let facets = sanitize_facets(raw_facets)?;
    let count = permutation_count(&facets);
    if count > MAX_PERMUTATIONS {
        return Err(ValidationError::TooManyFacets(count, MAX_PERMUTATIONS));
    }
    let values = sanitize_values(raw_values)?;

    Ok(Record::new(id, facets, values))
}

/// Validating front door of the inbound queue
pub struct Sink<Q> {
    queue: Q,
    queue_name: String,
}

impl<Q: RecordQueue> Sink<Q> {
    pub fn new(queue: Q, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }

    /// Validate and enqueue; returns the record id
    pub async fn submit(&self, data: &Value) -> Result<String, SinkError> {
        let record = make_record(data)?;
        self.submit_record(&record).await?;
        Ok(record.id)
    }

    pub async fn submit_record(&self, record: &Record) -> Result<(), BackendError> {
        self.queue.push(&self.queue_name, record.encode()?).await
    }

    /// Poll the completion marker until it appears or `timeout` passes
    ///
    /// Markers are short-lived and best effort: `false` means "not seen", not
    /// "not processed".
    pub async fn wait_for_completion(
        &self,
        record_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.is_complete(record_id).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
