//! SinkHandle - one result sink behind its own queue and worker task

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use contracts::{ResultSink, RunRecord};

use crate::error::DispatcherError;
use crate::metrics::SinkMetrics;

/// Handle to a running sink worker
pub struct SinkHandle {
    name: String,
    tx: mpsc::Sender<RunRecord>,
    metrics: Arc<SinkMetrics>,
    worker_handle: JoinHandle<()>,
}

impl SinkHandle {
    /// Spawn the worker task for `sink` with a bounded queue.
    pub fn spawn<S: ResultSink + 'static>(sink: S, queue_capacity: usize) -> Self {
        let name = sink.name().to_string();
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let metrics = Arc::new(SinkMetrics::new());

        let worker_metrics = Arc::clone(&metrics);
        let worker_name = name.clone();
        let worker_handle = tokio::spawn(async move {
            sink_worker(sink, rx, worker_metrics, worker_name).await;
        });

        Self {
            name,
            tx,
            metrics,
            worker_handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &Arc<SinkMetrics> {
        &self.metrics
    }

    /// Queue a record without waiting; a full queue drops it.
    pub fn try_send(&self, record: RunRecord) -> Result<(), DispatcherError> {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.metrics
                    .set_queue_len(self.tx.max_capacity() - self.tx.capacity());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.metrics.inc_dropped_count();
                warn!(sink = %self.name, run_id = %record.run_id, "queue full, run record dropped");
                Err(DispatcherError::QueueFull {
                    sink_name: self.name.clone(),
                    run_id: record.run_id,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(sink = %self.name, "sink worker closed unexpectedly");
                Err(DispatcherError::SinkClosed {
                    sink_name: self.name.clone(),
                })
            }
        }
    }

    /// Drain the queue, flush and close the sink.
    #[instrument(name = "sink_handle_shutdown", skip(self), fields(sink = %self.name))]
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker_handle.await {
            error!(sink = %self.name, error = ?e, "sink worker panicked");
        }
        debug!(sink = %self.name, "sink handle shut down");
    }
}

#[instrument(name = "sink_worker_loop", skip(sink, rx, metrics), fields(sink = %name))]
async fn sink_worker<S: ResultSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<RunRecord>,
    metrics: Arc<SinkMetrics>,
    name: String,
) {
    debug!("sink worker started");

    while let Some(record) = rx.recv().await {
        metrics.set_queue_len(rx.len());

        let started = Instant::now();
        match sink.write(&record).await {
            Ok(()) => metrics.record_write(started.elapsed()),
            Err(e) => {
                metrics.inc_failure_count();
                error!(run_id = %record.run_id, error = %e, "result write failed");
            }
        }
    }

    if let Err(e) = sink.flush().await {
        error!(error = %e, "flush failed on shutdown");
    }
    if let Err(e) = sink.close().await {
        error!(error = %e, "close failed on shutdown");
    }
    debug!("sink worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::record;
    use contracts::ContractError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::{sleep, Duration};

    struct MockSink {
        name: String,
        write_count: Arc<AtomicU64>,
        should_fail: bool,
        delay_ms: u64,
    }

    impl MockSink {
        fn new(name: &str, write_count: &Arc<AtomicU64>) -> Self {
            Self {
                name: name.to_string(),
                write_count: Arc::clone(write_count),
                should_fail: false,
                delay_ms: 0,
            }
        }
    }

    impl ResultSink for MockSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn write(&mut self, _record: &RunRecord) -> Result<(), ContractError> {
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.should_fail {
                return Err(ContractError::sink_write(&self.name, "mock failure"));
            }
            self.write_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), ContractError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ContractError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_handle_basic() {
        let write_count = Arc::new(AtomicU64::new(0));
        let handle = SinkHandle::spawn(MockSink::new("test", &write_count), 10);

        for i in 0..5 {
            assert!(handle.try_send(record(&format!("s1-run{i}"))).is_ok());
        }

        let metrics = Arc::clone(handle.metrics());
        handle.shutdown().await;
        assert_eq!(write_count.load(Ordering::Relaxed), 5);
        assert_eq!(metrics.snapshot().write_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_handle_queue_full() {
        let write_count = Arc::new(AtomicU64::new(0));
        let sink = MockSink {
            delay_ms: 100,
            ..MockSink::new("slow", &write_count)
        };
        let handle = SinkHandle::spawn(sink, 2);

        let rejected = (0..10)
            .filter(|i| handle.try_send(record(&format!("s1-run{i}"))).is_err())
            .count();

        assert!(rejected > 0);
        assert_eq!(handle.metrics().dropped_count(), rejected as u64);

        handle.shutdown().await;
        assert_eq!(write_count.load(Ordering::Relaxed), 10 - rejected as u64);
    }

    #[tokio::test]
    async fn test_sink_handle_failure_isolation() {
        let sink = MockSink {
            should_fail: true,
            ..MockSink::new("failing", &Arc::new(AtomicU64::new(0)))
        };
        let handle = SinkHandle::spawn(sink, 10);

        for i in 0..3 {
            handle.try_send(record(&format!("s1-run{i}"))).unwrap();
        }

        let metrics = Arc::clone(handle.metrics());
        handle.shutdown().await;
        assert_eq!(metrics.failure_count(), 3);
        assert_eq!(metrics.write_count(), 0);
    }
}
