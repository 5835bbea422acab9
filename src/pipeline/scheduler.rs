//! Sync sweeps - drain dirty facets from the buffer into durable stats
//!
//! A sweep walks the dirty set once. Each facet is drained with
//! `read_and_clear` and handed to the reconciler, so increments that land
//! while the facet is mid-sync accumulate for the next sweep instead of being
//! lost or flushed twice.
//!
//! A sweep may stop part-way (stop flag, reconcile failure). Facets it did not
//! reach stay dirty and are picked up by the next sweep or the next process.

use super::backend::{AggregationBuffer, BackendError, StatsStore};
use super::reconciler::{ReconcileError, Reconciler};
use super::state::DaemonContext;
use std::time::{Duration, Instant};
use thiserror::Error;

/// When the daemon should run a sweep
#[derive(Debug, Clone)]
pub struct SyncTrigger {
    /// Dirty-set size that forces a sweep
    pub high_water: usize,

    /// Maximum time between sweeps
    pub interval: Duration,
}

impl Default for SyncTrigger {
    fn default() -> Self {
        Self {
            high_water: 5_000,
            interval: Duration::from_secs(60),
        }
    }
}

impl SyncTrigger {
    pub fn is_due(&self, dirty: usize, since_last_sync: Duration) -> bool {
        dirty > self.high_water || since_last_sync > self.interval
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Facets merged into durable stats
    pub synced: usize,

    /// Of which created for the first time
    pub created: usize,

    /// Dirty facets with nothing buffered
    pub skipped: usize,

    /// Buffered counters without facet metadata (dropped)
    pub orphaned: usize,

    /// Facets whose buffer entry could not be read (left dirty)
    pub unreadable: usize,

    /// The stop flag cut the sweep short
    pub interrupted: bool,
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("buffer error during sync: {0}")]
    Buffer(#[from] BackendError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Drain every dirty facet through the reconciler
///
/// Arguments:
/// - `buffer`: aggregation buffer holding the dirty set
/// - `reconciler`: durable merge for one facet
/// - `ctx`: stop flag (sampled per facet) and stats
///
/// On a reconcile failure the drained deltas are written back and marked
/// dirty again before the error is returned. A facet whose entry cannot be
/// read for a non-transient reason is skipped so it does not block the rest.
pub async fn sweep<B, S>(
    buffer: &B,
    reconciler: &Reconciler<S>,
    ctx: &mut DaemonContext,
) -> Result<SweepReport, SweepError>
where
    B: AggregationBuffer,
    S: StatsStore,
{
    let started = Instant::now();
    let dirty = buffer.list_dirty().await?;
    let mut report = SweepReport::default();

    log::info!("🔄 Sync sweep over {} dirty facets", dirty.len());

    for (done, facet_id) in dirty.iter().enumerate() {
        if ctx.is_stopping() {
            report.interrupted = true;
            log::info!("🛑 Sweep interrupted, {} facets left dirty", dirty.len() - done);
            break;
        }

        let entry = match buffer.read_and_clear(facet_id).await {
            Ok(entry) => entry,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                log::error!("❌ Facet {} unreadable, leaving it dirty: {}", facet_id, e);
                ctx.stats.incr("sync.unreadable");
                report.unreadable += 1;
                continue;
            }
        };
        if entry.deltas.is_empty() {
            report.skipped += 1;
            continue;
        }

        let Some(facet) = entry.facet else {
            log::warn!("⚠️  Facet {} has counters but no metadata, dropping {:?}", facet_id, entry.deltas);
            ctx.stats.incr("sync.orphaned");
            report.orphaned += 1;
            continue;
        };

        match reconciler.reconcile(&facet, &entry.deltas, &mut ctx.stats).await {
            Ok(outcome) => {
                report.synced += 1;
                if outcome.created {
                    report.created += 1;
                }
            }
            Err(e) => {
                log::error!("❌ Sync of facet {} failed: {}", facet.id, e);
                buffer.increment(&facet.id, &entry.deltas).await?;
                buffer.mark_dirty(&facet.id).await?;
                ctx.stats.incr("sync.failed");
                return Err(e.into());
            }
        }
    }

    ctx.stats.incr("sync.sweeps");
    ctx.stats.incr_by("sync.facets", report.synced as u64);
    log::info!(
        "✅ Synced {} facets ({} new, {} empty) in {}ms",
        report.synced,
        report.created,
        report.skipped,
        started.elapsed().as_millis()
    );

    Ok(report)
}
