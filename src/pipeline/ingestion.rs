//! Reliable queue consumption - at-least-once delivery with bounded retry
//!
//! Per dequeued item:
//!
//! ```text
//! pop (bounded wait)
//!     ↓
//! decode ──corrupt──▶ counted, dropped
//!     ↓
//! RecordHandler::process (panics caught, treated as Err)
//!     ├─ Ok  ──▶ completion marker (best effort)          = Processed
//!     └─ Err ──▶ ttl += 1
//!                 ├─ ttl <= max_retries ──▶ back of queue  = Retrying
//!                 └─ ttl >  max_retries ──▶ dead letters   = DeadLettered
//! ```
//!
//! The stop flag is sampled once per iteration, so shutdown happens at the
//! next poll boundary and never in the middle of a record.

use super::backend::{BackendError, RecordQueue};
use super::error_handler::ExponentialBackoff;
use super::state::DaemonContext;
use super::types::Record;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;

/// Failure of a record handler; sends the record down the retry path
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("buffer write failed: {0}")]
    Buffer(#[from] BackendError),

    #[error("{0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Pluggable per-record processing step
#[async_trait]
pub trait RecordHandler: Send {
    async fn process(&mut self, record: &Record, ctx: &mut DaemonContext) -> Result<(), ProcessError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    pub dead_letter_queue: String,

    /// Bounded wait of one pop
    pub pop_timeout: Duration,

    /// Failed deliveries tolerated before dead-lettering
    pub max_retries: u32,

    /// Lifetime of the completion marker written on success
    pub completion_ttl: Duration,

    /// Attempts at re-enqueueing a failed record before giving up
    pub push_retries: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: "aggqueue".to_string(),
            dead_letter_queue: "aggqueue:dead".to_string(),
            pop_timeout: Duration::from_millis(1_000),
            max_retries: 3,
            completion_ttl: Duration::from_millis(2_000),
            push_retries: 5,
        }
    }
}

/// What happened to one dequeued item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Processed,
    Retrying,
    DeadLettered,
    Invalid,
}

pub struct QueueConsumer<Q, H> {
    queue: Q,
    handler: H,
    config: ConsumerConfig,
}

impl<Q: RecordQueue, H: RecordHandler> QueueConsumer<Q, H> {
    pub fn new(queue: Q, handler: H, config: ConsumerConfig) -> Self {
        Self { queue, handler, config }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Consume until the stop flag is set
    ///
    /// Transient queue errors are logged and the loop carries on. Only a
    /// record that could not be put back (retry or dead-letter push failed
    /// past its retry budget) ends the loop with an error.
    pub async fn run(&mut self, ctx: &mut DaemonContext) -> Result<(), BackendError> {
        log::info!("🚀 Consuming from '{}'", self.config.queue);
        log::info!("   ├─ Dead letters: '{}'", self.config.dead_letter_queue);
        log::info!("   ├─ Max retries: {}", self.config.max_retries);
        log::info!("   └─ Pop timeout: {}ms", self.config.pop_timeout.as_millis());

        while !ctx.is_stopping() {
            match self.poll_once(ctx).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    log::warn!("⚠️  Queue unavailable: {}", e);
                    ctx.stats.incr("queue.errors");
                    tokio::time::sleep(self.config.pop_timeout.min(Duration::from_millis(100))).await;
                }
                Err(e) => {
                    log::error!("❌ Consumer stopping on queue error: {}", e);
                    return Err(e);
                }
            }
            self.report_status(ctx).await;
        }

        log::info!("🛑 Stop flag observed, consumer exiting");
        ctx.stats.emit();
        Ok(())
    }

    /// One iteration: pop with timeout and handle the item, if any
    pub async fn poll_once(&mut self, ctx: &mut DaemonContext) -> Result<Option<Delivery>, BackendError> {
        let payload = match self.queue.pop(&self.config.queue, self.config.pop_timeout).await? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        ctx.stats.incr("popped");
        self.handle(&payload, ctx).await.map(Some)
    }

    /// Decode, process and route one payload
    pub async fn handle(&mut self, payload: &[u8], ctx: &mut DaemonContext) -> Result<Delivery, BackendError> {
        let mut record = match Record::decode(payload) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("⚠️  Dropping payload: {}", e);
                ctx.stats.incr("invalid");
                return Ok(Delivery::Invalid);
            }
        };

        let outcome = AssertUnwindSafe(self.handler.process(&record, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ProcessError::Panicked(panic_message(payload.as_ref()))));

        match outcome {
            Ok(()) => {
                ctx.stats.incr("processed");
                if let Err(e) = self.queue.mark_complete(&record.id, self.config.completion_ttl).await {
                    log::debug!("completion marker for {} not written: {}", record.id, e);
                }
                Ok(Delivery::Processed)
            }
            Err(e) => {
                ctx.stats.incr("failed");
                record.ttl += 1;
                log::error!("❌ Record {} failed (attempt {}): {}", record.id, record.ttl, e);

                let payload = record.encode()?;
                if record.ttl > self.config.max_retries {
                    self.push_with_backoff(&self.config.dead_letter_queue, payload).await?;
                    ctx.stats.incr("deadlettered");
                    log::warn!(
                        "☠️  Record {} dead-lettered to '{}' after {} attempts",
                        record.id,
                        self.config.dead_letter_queue,
                        record.ttl
                    );
                    Ok(Delivery::DeadLettered)
                } else {
                    self.push_with_backoff(&self.config.queue, payload).await?;
                    ctx.stats.incr("retry");
                    Ok(Delivery::Retrying)
                }
            }
        }
    }

    /// Emit the status line when due, with the dead-letter depth gauge
    pub async fn report_status(&self, ctx: &mut DaemonContext) -> Option<String> {
        if !ctx.stats.is_due() {
            return None;
        }

        match self.queue.depth(&self.config.dead_letter_queue).await {
            Ok(depth) => {
                ctx.stats.set("dead_letter_depth", depth as u64);
                if depth > 0 {
                    log::warn!(
                        "⚠️  {} record(s) waiting in dead-letter queue '{}'",
                        depth,
                        self.config.dead_letter_queue
                    );
                }
            }
            Err(e) => log::debug!("dead-letter depth unavailable: {}", e),
        }

        ctx.stats.show_status()
    }

    async fn push_with_backoff(&self, queue: &str, payload: Vec<u8>) -> Result<(), BackendError> {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(50),
            Duration::from_secs(2),
            self.config.push_retries,
        );
        loop {
            match self.queue.push(queue, payload.clone()).await {
                Err(e) if e.is_transient() => {
                    if backoff.sleep().await.is_err() {
                        return Err(e);
                    }
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::memory::MemoryBackend;
    use crate::pipeline::state::StopFlag;
    use crate::pipeline::types::{CounterMap, FacetValue};

    struct Succeeds {
        seen: Vec<String>,
        stop_after: Option<usize>,
    }

    #[async_trait]
    impl RecordHandler for Succeeds {
        async fn process(&mut self, record: &Record, ctx: &mut DaemonContext) -> Result<(), ProcessError> {
            self.seen.push(record.id.clone());
            if self.stop_after == Some(self.seen.len()) {
                ctx.stop.stop();
            }
            Ok(())
        }
    }

    struct AlwaysFails {
        attempts: Vec<u32>,
    }

    #[async_trait]
    impl RecordHandler for AlwaysFails {
        async fn process(&mut self, record: &Record, _ctx: &mut DaemonContext) -> Result<(), ProcessError> {
            self.attempts.push(record.ttl);
            Err(ProcessError::Handler("boom".into()))
        }
    }

    struct PanicsOnce {
        calls: usize,
    }

    #[async_trait]
    impl RecordHandler for PanicsOnce {
        async fn process(&mut self, record: &Record, _ctx: &mut DaemonContext) -> Result<(), ProcessError> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("counter overflow in {}", record.id);
            }
            Ok(())
        }
    }

    fn record(id: &str) -> Record {
        let mut values = CounterMap::new();
        values.insert("views".to_string(), 1);
        Record::new(id, vec![("device".to_string(), vec![FacetValue::from("tablet")])], values)
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            pop_timeout: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn context() -> DaemonContext {
        DaemonContext::new(StopFlag::new(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_success_writes_completion_marker() {
        let backend = MemoryBackend::new();
        backend.push("aggqueue", record("r1").encode().unwrap()).await.unwrap();

        let handler = Succeeds { seen: vec![], stop_after: None };
        let mut consumer = QueueConsumer::new(backend.clone(), handler, config());
        let mut ctx = context();

        assert_eq!(consumer.poll_once(&mut ctx).await.unwrap(), Some(Delivery::Processed));
        assert!(backend.is_complete("r1").await.unwrap());
        assert_eq!(ctx.stats.get("popped"), 1);
        assert_eq!(ctx.stats.get("processed"), 1);

        // Test: empty queue is an empty iteration, not an error
        assert_eq!(consumer.poll_once(&mut ctx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_handler_dead_letters_after_four_attempts() {
        let backend = MemoryBackend::new();
        backend.push("aggqueue", record("r1").encode().unwrap()).await.unwrap();

        let mut consumer = QueueConsumer::new(backend.clone(), AlwaysFails { attempts: vec![] }, config());
        let mut ctx = context();

        let mut deliveries = Vec::new();
        while let Some(delivery) = consumer.poll_once(&mut ctx).await.unwrap() {
            deliveries.push(delivery);
        }

        assert_eq!(
            deliveries,
            vec![Delivery::Retrying, Delivery::Retrying, Delivery::Retrying, Delivery::DeadLettered]
        );
        assert_eq!(consumer.handler().attempts, vec![0, 1, 2, 3]);

        let dead = backend.queued("aggqueue:dead");
        assert_eq!(dead.len(), 1);
        let dead = Record::decode(&dead[0]).unwrap();
        assert_eq!(dead.id, "r1");
        assert_eq!(dead.ttl, 4);
        assert!(backend.queued("aggqueue").is_empty());
        assert!(!backend.is_complete("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_goes_to_back_of_queue() {
        let backend = MemoryBackend::new();
        backend.push("aggqueue", record("r1").encode().unwrap()).await.unwrap();
        backend.push("aggqueue", record("r2").encode().unwrap()).await.unwrap();

        let mut consumer = QueueConsumer::new(backend.clone(), AlwaysFails { attempts: vec![] }, config());
        let mut ctx = context();
        consumer.poll_once(&mut ctx).await.unwrap();

        let ids: Vec<String> = backend
            .queued("aggqueue")
            .iter()
            .map(|p| Record::decode(p).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["r2", "r1"]);
    }

    #[tokio::test]
    async fn test_corrupt_payload_dropped() {
        let backend = MemoryBackend::new();
        backend.push("aggqueue", b"{not json".to_vec()).await.unwrap();

        let handler = Succeeds { seen: vec![], stop_after: None };
        let mut consumer = QueueConsumer::new(backend.clone(), handler, config());
        let mut ctx = context();

        assert_eq!(consumer.poll_once(&mut ctx).await.unwrap(), Some(Delivery::Invalid));
        assert_eq!(ctx.stats.get("invalid"), 1);
        assert!(backend.queued("aggqueue").is_empty());
        assert!(backend.queued("aggqueue:dead").is_empty());
        assert!(consumer.handler().seen.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_at_poll_boundary() {
        let backend = MemoryBackend::new();
        for id in ["r1", "r2", "r3"] {
            backend.push("aggqueue", record(id).encode().unwrap()).await.unwrap();
        }

        let handler = Succeeds { seen: vec![], stop_after: Some(1) };
        let mut consumer = QueueConsumer::new(backend.clone(), handler, config());
        let mut ctx = context();

        consumer.run(&mut ctx).await.unwrap();

        assert_eq!(consumer.handler().seen, vec!["r1"]);
        assert_eq!(backend.queued("aggqueue").len(), 2);
    }

    #[tokio::test]
    async fn test_status_reports_dead_letter_depth() {
        let backend = MemoryBackend::new();
        backend.push("aggqueue:dead", record("old").encode().unwrap()).await.unwrap();

        let handler = Succeeds { seen: vec![], stop_after: None };
        let consumer = QueueConsumer::new(backend, handler, config());
        let mut ctx = DaemonContext::new(StopFlag::new(), Duration::ZERO);
        ctx.stats.incr("popped");

        std::thread::sleep(Duration::from_millis(2));
        let line = consumer.report_status(&mut ctx).await.unwrap();
        assert!(line.contains("dead_letter_depth:1"));
        assert!(line.contains("popped:1"));
    }

    #[tokio::test]
    async fn test_panicking_handler_takes_retry_path() {
        let backend = MemoryBackend::new();
        backend.push("aggqueue", record("r1").encode().unwrap()).await.unwrap();

        let mut consumer = QueueConsumer::new(backend.clone(), PanicsOnce { calls: 0 }, config());
        let mut ctx = context();

        // Test: the panic is contained and the record is requeued with ttl 1
        assert_eq!(consumer.poll_once(&mut ctx).await.unwrap(), Some(Delivery::Retrying));
        assert_eq!(ctx.stats.get("failed"), 1);
        let queued = backend.queued("aggqueue");
        assert_eq!(queued.len(), 1);
        assert_eq!(Record::decode(&queued[0]).unwrap().ttl, 1);

        assert_eq!(consumer.poll_once(&mut ctx).await.unwrap(), Some(Delivery::Processed));
        assert_eq!(consumer.handler().calls, 2);
        assert!(backend.is_complete("r1").await.unwrap());
    }

    #[test]
    fn test_panic_message() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(text.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(owned.as_ref()), "bang");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
