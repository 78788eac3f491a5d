//! Metric recording helpers for the upload pipeline.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!(
        "shardstream_chunks_dispatched_total",
        "Chunk dispatches sent to storage servers"
    );
    describe_counter!(
        "shardstream_chunks_completed_total",
        "Chunks stored successfully"
    );
    describe_counter!(
        "shardstream_chunks_failed_total",
        "Chunk failures by reason"
    );
    describe_counter!(
        "shardstream_chunk_retries_total",
        "Chunk dispatches retried after a failure"
    );
    describe_counter!(
        "shardstream_chunks_skipped_total",
        "Chunks skipped on resume because the ledger already had them"
    );
    describe_counter!(
        "shardstream_capacity_rejections_total",
        "Reservations rejected by the capacity accountant"
    );
    describe_counter!("shardstream_bytes_uploaded_total", "Chunk bytes stored");
    describe_counter!(
        "shardstream_sessions_started_total",
        "Upload sessions started"
    );
    describe_counter!(
        "shardstream_sessions_completed_total",
        "Upload sessions completed"
    );
    describe_counter!(
        "shardstream_sessions_failed_total",
        "Upload sessions failed by reason"
    );

    describe_gauge!("shardstream_chunks_in_flight", "Chunk dispatches in flight");
    describe_gauge!("shardstream_active_sessions", "Live upload sessions");
    describe_gauge!(
        "shardstream_servers_active",
        "Storage servers that answered the last status refresh"
    );

    describe_histogram!(
        "shardstream_chunk_dispatch_duration_seconds",
        "Time for one chunk dispatch"
    );
    describe_histogram!(
        "shardstream_session_duration_seconds",
        "Time from session start to terminal status"
    );
}

// ============== Chunk Operations ==============

pub fn record_chunk_dispatched(server_id: &str) {
    counter!("shardstream_chunks_dispatched_total", "server_id" => server_id.to_string())
        .increment(1);
}

pub fn record_chunk_completed(server_id: &str, bytes: u64, duration: Duration) {
    counter!("shardstream_chunks_completed_total", "server_id" => server_id.to_string())
        .increment(1);
    counter!("shardstream_bytes_uploaded_total").increment(bytes);
    histogram!("shardstream_chunk_dispatch_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_chunk_failed(reason: &str) {
    counter!("shardstream_chunks_failed_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_chunk_retry() {
    counter!("shardstream_chunk_retries_total").increment(1);
}

pub fn record_chunks_skipped(count: usize) {
    counter!("shardstream_chunks_skipped_total").increment(count as u64);
}

pub fn record_capacity_rejection(account_id: &str) {
    counter!("shardstream_capacity_rejections_total", "account_id" => account_id.to_string())
        .increment(1);
}

// ============== Registry ==============

pub fn set_active_servers(count: usize) {
    gauge!("shardstream_servers_active").set(count as f64);
}

/// Counts one chunk as in flight until dropped.
pub struct InFlightChunk {
    start_time: Instant,
}

impl InFlightChunk {
    pub fn start() -> Self {
        gauge!("shardstream_chunks_in_flight").increment(1.0);
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Drop for InFlightChunk {
    fn drop(&mut self) {
        gauge!("shardstream_chunks_in_flight").decrement(1.0);
    }
}

// ============== Sessions ==============

/// Tracks one session from start to its terminal status.
pub struct SessionTimer {
    start_time: Instant,
    finished: bool,
}

impl SessionTimer {
    pub fn start(resumed: bool) -> Self {
        counter!("shardstream_sessions_started_total", "resumed" => resumed.to_string())
            .increment(1);
        gauge!("shardstream_active_sessions").increment(1.0);
        Self {
            start_time: Instant::now(),
            finished: false,
        }
    }

    pub fn complete(mut self) {
        counter!("shardstream_sessions_completed_total").increment(1);
        self.finish();
    }

    pub fn fail(mut self, reason: &str) {
        counter!("shardstream_sessions_failed_total", "reason" => reason.to_string())
            .increment(1);
        self.finish();
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            gauge!("shardstream_active_sessions").decrement(1.0);
            histogram!("shardstream_session_duration_seconds")
                .record(self.start_time.elapsed().as_secs_f64());
        }
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Should not panic when called multiple times
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_in_flight_chunk_elapsed() {
        let chunk = InFlightChunk::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(chunk.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_session_timer_finishes_once() {
        let mut timer = SessionTimer::start(false);
        timer.finish();
        assert!(timer.finished);
        timer.fail("internal");
    }
}
