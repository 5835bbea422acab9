//! Durable reconciliation: fold one facet's buffered deltas into its stats record
//!
//! ## Protocol
//!
//! ```text
//! create_if_absent(deltas, fresh token) ──created──▶ done
//!          │ exists
//!          ▼
//!   get(facet) ◀──────────────────────────┐
//!          │                               │
//!   merge existing + deltas                │ lost race
//!   token = H(random, facet id, old token) │
//!          │                               │
//!   update_if(expected = old token) ───────┘
//!          │ swapped
//!          ▼
//!        done
//! ```
//!
//! Several aggregator processes may run this loop against the same facet at
//! once. The lineage token is the only coordination: a writer whose read went
//! stale loses the swap and re-reads.
//!
//! Every loop is bounded. Read failures, lost swaps and transient store
//! errors each have their own budget, and exhausting one surfaces a
//! `ReconcileError` instead of spinning.

use super::backend::{BackendError, StatsStore};
use super::error_handler::ExponentialBackoff;
use super::facets::digest_parts;
use super::state::DaemonStats;
use super::types::{CounterMap, Facet, StatsRecord};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("facet {facet_id}: stats record unreadable after {retries} retries")]
    ReadRetriesExhausted { facet_id: String, retries: u32 },

    #[error("facet {facet_id}: lost {attempts} consecutive compare-and-swap races")]
    ContentionExhausted { facet_id: String, attempts: u32 },

    #[error("facet {facet_id}: store kept failing: {source}")]
    TransientRetriesExhausted {
        facet_id: String,
        #[source]
        source: BackendError,
    },

    #[error("stats store error: {0}")]
    Store(#[from] BackendError),
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound on read-merge-swap cycles for one facet
    pub max_attempts: u32,

    /// Consecutive failed reads tolerated before giving up
    pub max_read_retries: u32,

    /// Transient store errors tolerated (with backoff) before giving up
    pub transient_retries: u32,

    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 64,
            max_read_retries: 5,
            transient_retries: 8,
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(1_000),
        }
    }
}

/// Result of one successful reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// The record did not exist and was created from the deltas
    pub created: bool,

    /// Conditional updates issued (0 when created)
    pub cas_attempts: u32,

    /// Token now stored for the facet
    pub lineage_token: String,
}

/// Per-key integer sum; counters absent from `deltas` are kept as they are
pub fn merge_counters(existing: &CounterMap, deltas: &CounterMap) -> CounterMap {
    let mut merged = existing.clone();
    for (name, delta) in deltas {
        let value = merged.entry(name.clone()).or_insert(0);
        *value = value.saturating_add(*delta);
    }
    merged
}

/// Fresh lineage token chained to the facet and the token it replaces
pub fn new_lineage_token(facet_id: &str, previous: Option<&str>) -> String {
    let salt: [u8; 8] = rand::random();
    digest_parts([
        &salt[..],
        facet_id.as_bytes(),
        previous.unwrap_or_default().as_bytes(),
    ])
}

/// A write whose outcome is unknown (the call failed after being sent)
struct PendingWrite {
    token: String,
    created: bool,
}

pub struct Reconciler<S> {
    store: S,
    config: ReconcilerConfig,
}

impl<S: StatsStore> Reconciler<S> {
    pub fn new(store: S, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    /// Merge `deltas` into the durable record for `facet`
    ///
    /// Arguments:
    /// - `facet`: metadata stored alongside the counters on first create
    /// - `deltas`: counters drained from the buffer
    /// - `stats`: daemon counters (`reconcile.*`)
    ///
    /// A write that fails with a transient error may still have been applied.
    /// The next read recognises its token and reports success instead of
    /// merging the same deltas twice.
    pub async fn reconcile(
        &self,
        facet: &Facet,
        deltas: &CounterMap,
        stats: &mut DaemonStats,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut backoff = ExponentialBackoff::new(
            self.config.backoff_initial,
            self.config.backoff_max,
            self.config.transient_retries,
        );
        let mut pending: Option<PendingWrite> = None;
        let mut needs_create = true;
        let mut attempts = 0u32;
        let mut cas_attempts = 0u32;
        let mut read_failures = 0u32;

        loop {
            if needs_create {
                needs_create = false;
                let token = new_lineage_token(&facet.id, None);
                let record = StatsRecord {
                    facet_parent_id: facet.parent_id.clone(),
                    facet: facet.child.clone(),
                    lineage_token: token.clone(),
                    values: deltas.clone(),
                };

                match self.store.create_if_absent(&facet.id, &record).await {
                    Ok(true) => {
                        stats.incr("reconcile.created");
                        return Ok(ReconcileOutcome {
                            created: true,
                            cas_attempts,
                            lineage_token: token,
                        });
                    }
                    Ok(false) => {}
                    Err(e) if e.is_transient() => {
                        pending = Some(PendingWrite { token, created: true });
                        self.back_off(&mut backoff, &facet.id, e).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            attempts += 1;
            if attempts > self.config.max_attempts {
                return Err(ReconcileError::ContentionExhausted {
                    facet_id: facet.id.clone(),
                    attempts: self.config.max_attempts,
                });
            }

            let current = match self.store.get(&facet.id).await {
                Ok(Some(current)) => {
                    read_failures = 0;
                    current
                }
                Ok(None) => {
                    // Vanished between create and read; start over
                    needs_create = true;
                    continue;
                }
                Err(e) if e.is_transient() => {
                    read_failures += 1;
                    stats.incr("reconcile.read_retry");
                    if read_failures > self.config.max_read_retries {
                        return Err(ReconcileError::ReadRetriesExhausted {
                            facet_id: facet.id.clone(),
                            retries: self.config.max_read_retries,
                        });
                    }
                    self.back_off(&mut backoff, &facet.id, e).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(write) = pending.take() {
                if write.token == current.lineage_token {
                    log::debug!("facet {}: unacknowledged write was applied", facet.id);
                    stats.incr(if write.created { "reconcile.created" } else { "reconcile.updated" });
                    return Ok(ReconcileOutcome {
                        created: write.created,
                        cas_attempts,
                        lineage_token: write.token,
                    });
                }
            }

            let merged = merge_counters(&current.values, deltas);
            let token = new_lineage_token(&facet.id, Some(&current.lineage_token));
            cas_attempts += 1;

            match self
                .store
                .update_if(&facet.id, &current.lineage_token, &token, &merged)
                .await
            {
                Ok(true) => {
                    stats.incr("reconcile.updated");
                    return Ok(ReconcileOutcome {
                        created: false,
                        cas_attempts,
                        lineage_token: token,
                    });
                }
                Ok(false) => {
                    stats.incr("reconcile.cas_lost");
                    log::debug!("facet {}: lineage moved, re-reading (attempt {})", facet.id, attempts);
                }
                Err(e) if e.is_transient() => {
                    pending = Some(PendingWrite { token, created: false });
                    self.back_off(&mut backoff, &facet.id, e).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn back_off(
        &self,
        backoff: &mut ExponentialBackoff,
        facet_id: &str,
        error: BackendError,
    ) -> Result<(), ReconcileError> {
        log::warn!("⚠️  facet {}: transient store error: {}", facet_id, error);
        backoff
            .sleep()
            .await
            .map_err(|_| ReconcileError::TransientRetriesExhausted {
                facet_id: facet_id.to_string(),
                source: error,
            })
    }
}
