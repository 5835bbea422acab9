//! Interrupt-tolerant wrapper around any backend
//!
//! A call that fails with `BackendError::Interrupted` is re-issued until it
//! completes, so an interruption never abandons an operation mid-flight. The
//! only way out of a blocking wait is the cooperative stop flag: an
//! interrupted `pop` observed while stopping returns "no item".

use super::backend::{AggregationBuffer, BackendError, BufferedEntry, FacetWrite, RecordQueue, StatsStore};
use super::state::StopFlag;
use super::types::{CounterMap, Facet, FacetId, StatsRecord};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Re-issue `op` for as long as it reports an interruption
pub async fn uninterrupted<T, F, Fut>(name: &str, mut op: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    loop {
        match op().await {
            Err(BackendError::Interrupted) => {
                log::debug!("{} interrupted, retrying", name);
                tokio::task::yield_now().await;
            }
            result => return result,
        }
    }
}

#[derive(Clone)]
pub struct ReliableBackend<B> {
    inner: B,
    stop: StopFlag,
}

impl<B> ReliableBackend<B> {
    pub fn new(inner: B, stop: StopFlag) -> Self {
        Self { inner, stop }
    }
}

#[async_trait]
impl<B: RecordQueue> RecordQueue for ReliableBackend<B> {
    async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<(), BackendError> {
        let inner = &self.inner;
        uninterrupted("push", move || inner.push(queue, payload.clone())).await
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BackendError> {
        loop {
            match self.inner.pop(queue, timeout).await {
                Err(BackendError::Interrupted) if self.stop.is_set() => return Ok(None),
                Err(BackendError::Interrupted) => {
                    log::debug!("pop interrupted, waiting again");
                    tokio::task::yield_now().await;
                }
                result => return result,
            }
        }
    }

    async fn depth(&self, queue: &str) -> Result<usize, BackendError> {
        let inner = &self.inner;
        uninterrupted("depth", move || inner.depth(queue)).await
    }

    async fn mark_complete(&self, record_id: &str, ttl: Duration) -> Result<(), BackendError> {
        let inner = &self.inner;
        uninterrupted("mark_complete", move || inner.mark_complete(record_id, ttl)).await
    }

    async fn is_complete(&self, record_id: &str) -> Result<bool, BackendError> {
        let inner = &self.inner;
        uninterrupted("is_complete", move || inner.is_complete(record_id)).await
    }
}

#[async_trait]
impl<B: AggregationBuffer> AggregationBuffer for ReliableBackend<B> {
    async fn increment(&self, facet_id: &str, deltas: &CounterMap) -> Result<(), BackendError> {
        let inner = &self.inner;
        uninterrupted("increment", move || inner.increment(facet_id, deltas)).await
    }

    async fn set_metadata_if_absent(&self, facet: &Facet) -> Result<bool, BackendError> {
        let inner = &self.inner;
        uninterrupted("set_metadata_if_absent", move || inner.set_metadata_if_absent(facet)).await
    }

    async fn mark_dirty(&self, facet_id: &str) -> Result<(), BackendError> {
        let inner = &self.inner;
        uninterrupted("mark_dirty", move || inner.mark_dirty(facet_id)).await
    }

    async fn list_dirty(&self) -> Result<Vec<FacetId>, BackendError> {
        let inner = &self.inner;
        uninterrupted("list_dirty", move || inner.list_dirty()).await
    }

    async fn dirty_count(&self) -> Result<usize, BackendError> {
        let inner = &self.inner;
        uninterrupted("dirty_count", move || inner.dirty_count()).await
    }

    async fn read_and_clear(&self, facet_id: &str) -> Result<BufferedEntry, BackendError> {
        let inner = &self.inner;
        uninterrupted("read_and_clear", move || inner.read_and_clear(facet_id)).await
    }

    async fn apply(&self, writes: &[FacetWrite]) -> Result<(), BackendError> {
        let inner = &self.inner;
        uninterrupted("apply", move || inner.apply(writes)).await
    }
}

#[async_trait]
impl<B: StatsStore> StatsStore for ReliableBackend<B> {
    async fn create_if_absent(&self, facet_id: &str, record: &StatsRecord) -> Result<bool, BackendError> {
        let inner = &self.inner;
        uninterrupted("create_if_absent", move || inner.create_if_absent(facet_id, record)).await
    }

    async fn get(&self, facet_id: &str) -> Result<Option<StatsRecord>, BackendError> {
        let inner = &self.inner;
        uninterrupted("get", move || inner.get(facet_id)).await
    }

    async fn update_if(
        &self,
        facet_id: &str,
        expected_lineage: &str,
        lineage_token: &str,
        values: &CounterMap,
    ) -> Result<bool, BackendError> {
        let inner = &self.inner;
        uninterrupted("update_if", move || {
            inner.update_if(facet_id, expected_lineage, lineage_token, values)
        })
        .await
    }

    async fn scan_children(
        &self,
        parent_id: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StatsRecord>, BackendError> {
        let inner = &self.inner;
        uninterrupted("scan_children", move || inner.scan_children(parent_id, start_after, limit)).await
    }
}
