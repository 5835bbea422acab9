//! # Facet Aggregation Pipeline
//!
//! Turns a queue of facted event records into durable per-facet counters,
//! safely under several aggregator processes sharing one buffer and store.
//!
//! ## Architecture
//!
//! ```text
//! inbound queue
//!     ↓
//! QueueConsumer            pop / retry / dead-letter, stop flag, status line
//!     ↓
//! AggregatorEngine         expand record into every rollup
//!     ↓
//! AggregationBuffer        per-facet counters + dirty set
//!     ↓ (SyncTrigger: high water or interval)
//! scheduler::sweep         read_and_clear each dirty facet
//!     ↓
//! Reconciler               create-if-absent, then read-merge-CAS on lineage token
//!     ↓
//! StatsStore               durable stats records
//! ```
//!
//! ## Module Organization
//!
//! - `types` - Records, facets, stats records
//! - `facets` - Facet ids, parent/child split, permutation enumeration
//! - `backend` - Queue / buffer / store traits and `BackendError`
//! - `memory` - In-process backend (tests, single-process use)
//! - `db` - SQLite backend shared between processes
//! - `reliable` - Interrupt-tolerant backend wrapper
//! - `state` - Stop flag and rolling status counters
//! - `error_handler` - Exponential backoff for transient failures
//! - `ingestion` - Reliable queue consumer
//! - `reconciler` - Durable CAS merge
//! - `scheduler` - Sync trigger and sweep
//! - `engine` - Record handler wiring it all together
//! - `config` - Environment configuration

pub mod types;
pub mod facets;
pub mod backend;
pub mod memory;
pub mod db;
pub mod reliable;
pub mod state;
pub mod error_handler;
pub mod ingestion;
pub mod reconciler;
pub mod scheduler;
pub mod engine;
pub mod config;

// Re-export commonly used types
pub use types::{CounterMap, Facet, FacetId, FacetSet, FacetValue, Record, StatsRecord};
pub use backend::{AggregationBuffer, BackendError, RecordQueue, StatsStore};
pub use memory::MemoryBackend;
pub use db::SqliteBackend;
pub use reliable::ReliableBackend;
pub use state::{DaemonContext, DaemonStats, StopFlag};
pub use ingestion::{ConsumerConfig, Delivery, ProcessError, QueueConsumer, RecordHandler};
pub use reconciler::{ReconcileError, Reconciler, ReconcilerConfig};
pub use scheduler::{SweepReport, SyncTrigger};
pub use engine::AggregatorEngine;
pub use config::{AggregatorConfig, ConfigError};
