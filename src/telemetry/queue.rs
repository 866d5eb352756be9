//! Bounded telemetry queue and the batch consumer.
//!
//! Enqueue is non-blocking and never fails the request path: when the queue
//! is full the oldest event is dropped and a counter is bumped. The worker
//! drains batches of at most 500 events or 5 seconds of arrivals, whichever
//! comes first, and writes each batch to the sink in one round trip.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{TelemetryEvent, redact::redact_event, sink::AnalyticsSink};

/// Queue capacity; overflow drops the oldest event.
pub const QUEUE_CAPACITY: usize = 50_000;
/// Maximum events per sink round trip.
pub const MAX_BATCH: usize = 500;
/// Maximum time a batch waits before flushing.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct TelemetryQueue {
    events: Mutex<VecDeque<TelemetryEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl Default for TelemetryQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

impl TelemetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Redact and enqueue one event. Returns false when an old event was
    /// dropped to make room.
    pub fn enqueue(&self, event: TelemetryEvent) -> bool {
        let event = redact_event(event);
        let mut events = self.events.lock();
        let mut clean = true;
        while events.len() >= self.capacity {
            events.pop_front();
            let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            clean = false;
            if count.is_multiple_of(1_000) {
                tracing::warn!(
                    dropped = count,
                    capacity = self.capacity,
                    "telemetry queue overflow; dropping oldest events"
                );
            }
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
        clean
    }

    /// Wake the worker, e.g. to notice a shutdown flag.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Events dropped to overflow since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn drain(&self, max: usize) -> Vec<TelemetryEvent> {
        let mut events = self.events.lock();
        let take = events.len().min(max);
        events.drain(..take).collect()
    }
}

/// Background consumer feeding the analytics sink.
pub struct TelemetryWorker {
    queue: Arc<TelemetryQueue>,
    sink: Arc<dyn AnalyticsSink>,
    shutdown: Arc<AtomicBool>,
}

impl TelemetryWorker {
    pub fn new(queue: Arc<TelemetryQueue>, sink: Arc<dyn AnalyticsSink>) -> Self {
        Self {
            queue,
            sink,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for signaling shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until shutdown; drains the queue fully before exiting.
    pub async fn run(self) {
        loop {
            let batch = self.queue.drain(MAX_BATCH);
            if !batch.is_empty() {
                self.flush(batch).await;
                // Keep draining while there is backlog.
                continue;
            }

            if self.shutdown.load(Ordering::Acquire) {
                let tail = self.queue.drain(usize::MAX);
                if !tail.is_empty() {
                    self.flush(tail).await;
                }
                tracing::info!("telemetry worker shutting down");
                return;
            }

            tokio::select! {
                _ = self.queue.notify.notified() => {}
                _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
            }
        }
    }

    async fn flush(&self, batch: Vec<TelemetryEvent>) {
        match self.sink.write_batch(&batch).await {
            Ok(written) => {
                tracing::debug!(
                    written,
                    batch = batch.len(),
                    sink = self.sink.name(),
                    "telemetry batch flushed"
                );
            }
            Err(e) => {
                // At-most-once past the queue: failed batches are not retried.
                tracing::warn!(
                    error = %e,
                    batch = batch.len(),
                    sink = self.sink.name(),
                    "telemetry batch write failed; dropping batch"
                );
            }
        }
    }
}
