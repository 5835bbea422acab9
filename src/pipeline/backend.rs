//! Backend traits for the shared state the aggregator works against
//!
//! - `RecordQueue` - inbound / dead-letter queues and completion markers
//! - `AggregationBuffer` - low-latency per-facet counters and the dirty set
//! - `StatsStore` - the durable, CAS-guarded per-facet aggregates
//!
//! Every operation is single-key atomic. Nothing here offers multi-key
//! transactions, and callers must stay correct under any interleaving at
//! the granularity of one key.

use super::types::{CounterMap, Facet, FacetId, StatsRecord};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The call was interrupted while waiting; it may be retried as-is
    #[error("operation interrupted")]
    Interrupted,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt backend data: {0}")]
    Corrupt(String),
}

impl BackendError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, BackendError::Interrupted)
    }

    /// Network-hiccup class failures worth a bounded retry
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Interrupted | BackendError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::OperationInterrupted) => BackendError::Interrupted,
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                BackendError::Unavailable(err.to_string())
            }
            _ => BackendError::Database(err),
        }
    }
}

/// FIFO queues of serialized records plus short-lived completion markers
#[async_trait]
pub trait RecordQueue: Send + Sync {
    /// Append a payload to the back of the named queue
    async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<(), BackendError>;

    /// Pop the front payload, waiting at most `timeout`
    ///
    /// An empty queue is `Ok(None)`, not an error.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BackendError>;

    /// Number of payloads waiting in the named queue
    async fn depth(&self, queue: &str) -> Result<usize, BackendError>;

    /// Record that `record_id` was processed; visible for `ttl`
    async fn mark_complete(&self, record_id: &str, ttl: Duration) -> Result<(), BackendError>;

    async fn is_complete(&self, record_id: &str) -> Result<bool, BackendError>;
}

/// One facet's share of a record, written as part of a pipelined group
#[derive(Debug, Clone)]
pub struct FacetWrite {
    pub facet: Facet,
    pub deltas: CounterMap,
}

/// Counters and metadata drained from the buffer for one facet
///
/// `facet` is `None` when the metadata is gone (expired independently of
/// the counters).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedEntry {
    pub facet: Option<Facet>,
    pub deltas: CounterMap,
}

/// Fast aggregation buffer
#[async_trait]
pub trait AggregationBuffer: Send + Sync {
    /// Add each delta to the facet's counters, creating them if absent
    async fn increment(&self, facet_id: &str, deltas: &CounterMap) -> Result<(), BackendError>;

    /// Store facet metadata once; returns whether it was newly written
    async fn set_metadata_if_absent(&self, facet: &Facet) -> Result<bool, BackendError>;

    /// Add the facet to the dirty set (idempotent)
    async fn mark_dirty(&self, facet_id: &str) -> Result<(), BackendError>;

    async fn list_dirty(&self) -> Result<Vec<FacetId>, BackendError>;

    async fn dirty_count(&self) -> Result<usize, BackendError>;

    /// Atomically read counters + metadata, reset the counters and drop the
    /// facet from the dirty set
    async fn read_and_clear(&self, facet_id: &str) -> Result<BufferedEntry, BackendError>;

    /// Apply one record's writes as a pipelined group
    ///
    /// Partial application is acceptable: at-least-once re-delivery of the
    /// record masks it.
    async fn apply(&self, writes: &[FacetWrite]) -> Result<(), BackendError> {
        for write in writes {
            self.increment(&write.facet.id, &write.deltas).await?;
            self.set_metadata_if_absent(&write.facet).await?;
            self.mark_dirty(&write.facet.id).await?;
        }
        Ok(())
    }
}

/// Durable per-facet aggregates with compare-and-swap updates
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Insert the record unless one exists; returns whether it was created
    async fn create_if_absent(&self, facet_id: &str, record: &StatsRecord) -> Result<bool, BackendError>;

    async fn get(&self, facet_id: &str) -> Result<Option<StatsRecord>, BackendError>;

    /// Replace lineage token and values only if the stored token still
    /// equals `expected_lineage`; returns whether the swap happened
    async fn update_if(
        &self,
        facet_id: &str,
        expected_lineage: &str,
        lineage_token: &str,
        values: &CounterMap,
    ) -> Result<bool, BackendError>;

    /// Children of `parent_id` sorted by facet label, strictly after
    /// `start_after` when given
    async fn scan_children(
        &self,
        parent_id: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StatsRecord>, BackendError>;
}
