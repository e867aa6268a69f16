//! Bounded-buffer asynchronous consumer of [`ExecutionStats`] records.
//!
//! Keeps logging off the hot path: workers hand off a record and move on
//! rather than blocking on a synchronous log call per job.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct ExecutionStats {
    pub job_id: String,
    pub language: String,
    pub code_size: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Producer-side handle. Cheaply cloned and held by every worker.
#[derive(Debug, Clone)]
pub struct StatsSink {
    tx: mpsc::Sender<ExecutionStats>,
    dropped: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl StatsSink {
    /// Spawns the consumer task and returns a handle plus its join handle.
    pub fn spawn(buffer: usize) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(buffer);
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if record.success {
                    log::info!(
                        "job {} ({}) completed: {} bytes, {}ms",
                        record.job_id,
                        record.language,
                        record.code_size,
                        (record.end_time - record.start_time).num_milliseconds(),
                    );
                } else {
                    log::warn!(
                        "job {} ({}) failed: {}",
                        record.job_id,
                        record.language,
                        record.error_message.as_deref().unwrap_or("unknown error"),
                    );
                }
            }
        });

        (Self { tx, dropped }, handle)
    }

    /// Submits a record without blocking the caller. If the buffer is full
    /// the record is dropped and counted rather than applying backpressure.
    pub fn record(&self, stats: ExecutionStats) {
        if self.tx.try_send(stats).is_err() {
            self.dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            log::warn!("stats sink buffer full, dropping record");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(job_id: &str, success: bool) -> ExecutionStats {
        let now = Utc::now();
        ExecutionStats {
            job_id: job_id.to_string(),
            language: "python".to_string(),
            code_size: 10,
            start_time: now,
            end_time: now,
            success,
            error_message: if success { None } else { Some("boom".to_string()) },
        }
    }

    #[tokio::test]
    async fn records_drain_without_blocking_the_producer() {
        let (sink, handle) = StatsSink::spawn(8);
        for i in 0..5 {
            sink.record(sample(&format!("job-{i}"), true));
        }
        drop(sink);
        handle.await.unwrap();
    }

    #[test]
    fn overflow_is_counted_not_panicked() {
        let (sink, _handle) = StatsSink::spawn(1);
        // Fill and overflow the bounded channel without ever polling it.
        for i in 0..10 {
            sink.record(sample(&format!("job-{i}"), false));
        }
        assert!(sink.dropped_count() > 0);
    }
}
