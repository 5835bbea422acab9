//! In-process backend implementing queue, buffer and durable store
//!
//! Clones share state, so several daemon instances in one process see the
//! same queues, buffer and store, which is how tests exercise concurrent
//! aggregators. Each structure sits behind its own mutex, which makes every
//! single-key operation linearizable.

use super::backend::{AggregationBuffer, BackendError, BufferedEntry, FacetWrite, RecordQueue, StatsStore};
use super::types::{CounterMap, Facet, FacetId, StatsRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct BufferState {
    counters: HashMap<FacetId, CounterMap>,
    metadata: HashMap<FacetId, Facet>,
    dirty: BTreeSet<FacetId>,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    queue_signal: Notify,
    markers: Mutex<HashMap<String, Instant>>,
    buffer: Mutex<BufferState>,
    stats: Mutex<BTreeMap<FacetId, StatsRecord>>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the payloads waiting in a queue (front first)
    pub fn queued(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Counters currently buffered for a facet
    pub fn buffered(&self, facet_id: &str) -> CounterMap {
        self.inner
            .buffer
            .lock()
            .counters
            .get(facet_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of durable stats records
    pub fn stats_len(&self) -> usize {
        self.inner.stats.lock().len()
    }

    fn try_pop(&self, queue: &str) -> Option<Vec<u8>> {
        self.inner.queues.lock().get_mut(queue).and_then(|q| q.pop_front())
    }
}

fn add_saturating(counters: &mut CounterMap, deltas: &CounterMap) {
    for (name, delta) in deltas {
        let value = counters.entry(name.clone()).or_insert(0);
        *value = value.saturating_add(*delta);
    }
}

#[async_trait]
impl RecordQueue for MemoryBackend {
    async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<(), BackendError> {
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.inner.queue_signal.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push in between is not missed
            let notified = self.inner.queue_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_pop(queue) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn depth(&self, queue: &str) -> Result<usize, BackendError> {
        Ok(self.inner.queues.lock().get(queue).map_or(0, |q| q.len()))
    }

    async fn mark_complete(&self, record_id: &str, ttl: Duration) -> Result<(), BackendError> {
        let now = Instant::now();
        let mut markers = self.inner.markers.lock();
        markers.retain(|_, expires_at| *expires_at > now);
        markers.insert(record_id.to_string(), now + ttl);
        Ok(())
    }

    async fn is_complete(&self, record_id: &str) -> Result<bool, BackendError> {
        let now = Instant::now();
        Ok(self
            .inner
            .markers
            .lock()
            .get(record_id)
            .is_some_and(|expires_at| *expires_at > now))
    }
}

#[async_trait]
impl AggregationBuffer for MemoryBackend {
    async fn increment(&self, facet_id: &str, deltas: &CounterMap) -> Result<(), BackendError> {
        let mut buffer = self.inner.buffer.lock();
        let counters = buffer.counters.entry(facet_id.to_string()).or_default();
        add_saturating(counters, deltas);
        Ok(())
    }

    async fn set_metadata_if_absent(&self, facet: &Facet) -> Result<bool, BackendError> {
        let mut buffer = self.inner.buffer.lock();
        if buffer.metadata.contains_key(&facet.id) {
            return Ok(false);
        }
        buffer.metadata.insert(facet.id.clone(), facet.clone());
        Ok(true)
    }

    async fn mark_dirty(&self, facet_id: &str) -> Result<(), BackendError> {
        self.inner.buffer.lock().dirty.insert(facet_id.to_string());
        Ok(())
    }

    async fn list_dirty(&self) -> Result<Vec<FacetId>, BackendError> {
        Ok(self.inner.buffer.lock().dirty.iter().cloned().collect())
    }

    async fn dirty_count(&self) -> Result<usize, BackendError> {
        Ok(self.inner.buffer.lock().dirty.len())
    }

    async fn read_and_clear(&self, facet_id: &str) -> Result<BufferedEntry, BackendError> {
        let mut buffer = self.inner.buffer.lock();
        buffer.dirty.remove(facet_id);
        let deltas = buffer.counters.remove(facet_id).unwrap_or_default();
        Ok(BufferedEntry {
            facet: buffer.metadata.get(facet_id).cloned(),
            deltas,
        })
    }

    async fn apply(&self, writes: &[FacetWrite]) -> Result<(), BackendError> {
        let mut buffer = self.inner.buffer.lock();
        for write in writes {
            let counters = buffer.counters.entry(write.facet.id.clone()).or_default();
            add_saturating(counters, &write.deltas);
            buffer
                .metadata
                .entry(write.facet.id.clone())
                .or_insert_with(|| write.facet.clone());
            buffer.dirty.insert(write.facet.id.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl StatsStore for MemoryBackend {
    async fn create_if_absent(&self, facet_id: &str, record: &StatsRecord) -> Result<bool, BackendError> {
        let mut stats = self.inner.stats.lock();
        if stats.contains_key(facet_id) {
            return Ok(false);
        }
        stats.insert(facet_id.to_string(), record.clone());
        Ok(true)
    }

    async fn get(&self, facet_id: &str) -> Result<Option<StatsRecord>, BackendError> {
        Ok(self.inner.stats.lock().get(facet_id).cloned())
    }

    async fn update_if(
        &self,
        facet_id: &str,
        expected_lineage: &str,
        lineage_token: &str,
        values: &CounterMap,
    ) -> Result<bool, BackendError> {
        let mut stats = self.inner.stats.lock();
        match stats.get_mut(facet_id) {
            Some(record) if record.lineage_token == expected_lineage => {
                record.lineage_token = lineage_token.to_string();
                record.values = values.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_children(
        &self,
        parent_id: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StatsRecord>, BackendError> {
        let stats = self.inner.stats.lock();
        let mut children: Vec<StatsRecord> = stats
            .values()
            .filter(|r| r.facet_parent_id == parent_id)
            .filter(|r| start_after.map_or(true, |start| r.facet.as_str() > start))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.facet.cmp(&b.facet));
        children.truncate(limit);
        Ok(children)
    }
}
