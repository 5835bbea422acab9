//! Aggregator Engine - per-record handler of the aggregator daemon
//!
//! ## Architecture
//!
//! ```text
//! Record (from QueueConsumer)
//!     ↓
//! facets::expand()            every rollup the record contributes to
//!     ↓
//! AggregationBuffer::apply()  increment + metadata + dirty, one group
//!     ↓
//! SyncTrigger::is_due()       dirty > high water || interval elapsed
//!     ↓ (when due)
//! scheduler::sweep()          read_and_clear → Reconciler → StatsStore
//! ```
//!
//! Sync failures are logged and never fail the record that happened to
//! trigger the sweep; its increments are already buffered.

use super::backend::{AggregationBuffer, FacetWrite, StatsStore};
use super::facets::{expand, permutation_count};
use super::ingestion::{ProcessError, RecordHandler};
use super::reconciler::Reconciler;
use super::scheduler::{sweep, SweepReport, SyncTrigger};
use super::state::DaemonContext;
use super::types::Record;
use async_trait::async_trait;
use std::time::Instant;

/// Records expanding into more facets than this are refused
pub const MAX_PERMUTATIONS: usize = 4_096;

pub struct AggregatorEngine<B, S> {
    buffer: B,
    reconciler: Reconciler<S>,
    trigger: SyncTrigger,
    last_sync: Instant,
}

impl<B, S> AggregatorEngine<B, S>
where
    B: AggregationBuffer,
    S: StatsStore,
{
    pub fn new(buffer: B, reconciler: Reconciler<S>, trigger: SyncTrigger) -> Self {
        Self {
            buffer,
            reconciler,
            trigger,
            last_sync: Instant::now(),
        }
    }

    /// Expand a record and buffer its counters for every facet
    ///
    /// Returns the number of facets touched.
    pub async fn ingest(&self, record: &Record) -> Result<usize, ProcessError> {
        let count = permutation_count(&record.facets);
        if count > MAX_PERMUTATIONS {
            return Err(ProcessError::Handler(format!(
                "record {} expands into {} facets (limit {})",
                record.id, count, MAX_PERMUTATIONS
            )));
        }

        let writes: Vec<FacetWrite> = expand(&record.facets)
            .into_iter()
            .map(|facet| FacetWrite {
                facet,
                deltas: record.values.clone(),
            })
            .collect();

        self.buffer.apply(&writes).await?;
        Ok(writes.len())
    }

    /// Run a sweep when the trigger says so
    pub async fn maybe_sync(&mut self, ctx: &mut DaemonContext) -> Option<SweepReport> {
        let dirty = match self.buffer.dirty_count().await {
            Ok(dirty) => dirty,
            Err(e) => {
                log::warn!("⚠️  Dirty set unavailable, skipping sync check: {}", e);
                return None;
            }
        };

        if !self.trigger.is_due(dirty, self.last_sync.elapsed()) {
            return None;
        }

        self.sync_now(ctx).await
    }

    /// Sweep unconditionally; the sync clock restarts even if the sweep fails
    pub async fn sync_now(&mut self, ctx: &mut DaemonContext) -> Option<SweepReport> {
        let result = sweep(&self.buffer, &self.reconciler, ctx).await;
        self.last_sync = Instant::now();

        match result {
            Ok(report) => Some(report),
            Err(e) => {
                log::error!("❌ Sync sweep aborted: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl<B, S> RecordHandler for AggregatorEngine<B, S>
where
    B: AggregationBuffer,
    S: StatsStore,
{
    async fn process(&mut self, record: &Record, ctx: &mut DaemonContext) -> Result<(), ProcessError> {
        let touched = self.ingest(record).await?;
        ctx.stats.incr_by("facets", touched as u64);

        self.maybe_sync(ctx).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::facets::split_facet;
    use crate::pipeline::memory::MemoryBackend;
    use crate::pipeline::reconciler::ReconcilerConfig;
    use crate::pipeline::state::StopFlag;
    use crate::pipeline::types::{CounterMap, FacetValue};
    use std::time::Duration;

    fn context() -> DaemonContext {
        DaemonContext::new(StopFlag::new(), Duration::from_secs(3600))
    }

    fn engine(backend: &MemoryBackend, trigger: SyncTrigger) -> AggregatorEngine<MemoryBackend, MemoryBackend> {
        AggregatorEngine::new(
            backend.clone(),
            Reconciler::new(backend.clone(), ReconcilerConfig::default()),
            trigger,
        )
    }

    fn views(n: i64) -> CounterMap {
        let mut values = CounterMap::new();
        values.insert("views".to_string(), n);
        values
    }

    fn device_record(id: &str) -> Record {
        Record::new(
            id,
            vec![("device".to_string(), vec![FacetValue::from("tablet"), FacetValue::from("apple")])],
            views(1),
        )
    }

    #[tokio::test]
    async fn test_process_buffers_every_rollup() {
        let backend = MemoryBackend::new();
        let mut engine = engine(&backend, SyncTrigger::default());
        let mut ctx = context();

        engine.process(&device_record("r1"), &mut ctx).await.unwrap();

        // Test: device/tablet and device/tablet/apple
        assert_eq!(backend.dirty_count().await.unwrap(), 2);
        assert_eq!(ctx.stats.get("facets"), 2);

        let tablet = split_facet(&[FacetValue::from("device"), FacetValue::from("tablet")]);
        assert_eq!(backend.buffered(&tablet.id), views(1));
        assert_eq!(backend.stats_len(), 0);
    }

    #[tokio::test]
    async fn test_interval_triggers_sync() {
        let backend = MemoryBackend::new();
        let trigger = SyncTrigger {
            high_water: 5_000,
            interval: Duration::ZERO,
        };
        let mut engine = engine(&backend, trigger);
        let mut ctx = context();

        std::thread::sleep(Duration::from_millis(2));
        engine.process(&device_record("r1"), &mut ctx).await.unwrap();

        assert_eq!(backend.stats_len(), 2);
        assert_eq!(backend.dirty_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversized_record_refused() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, SyncTrigger::default());

        // 13 dimensions of depth 1: 2^13 - 1 facets
        let facets = (0..13)
            .map(|i| (format!("dim{}", i), vec![FacetValue::Int(i)]))
            .collect();
        let record = Record::new("huge", facets, views(1));

        let err = engine.ingest(&record).await.unwrap_err();
        assert!(matches!(err, ProcessError::Handler(_)));
        assert_eq!(backend.dirty_count().await.unwrap(), 0);
    }
}
