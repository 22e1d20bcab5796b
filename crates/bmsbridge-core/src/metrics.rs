// ── Bridge metrics ──
//
// Lock-free counters updated on the event path, read as a serializable
// snapshot by the health endpoint. Throughput is the receive rate over the
// last completed one-minute window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Length of one throughput window.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct BridgeMetrics {
    events_received: AtomicU64,
    bytes_received: AtomicU64,
    max_message_bytes: AtomicU64,
    events_decoded: AtomicU64,
    events_delivered: AtomicU64,
    events_ignored: AtomicU64,
    events_dropped: AtomicU64,
    decode_failures: AtomicU64,
    delivery_failures: AtomicU64,
    reconnects: AtomicU64,
    processed: AtomicU64,
    processing_total_us: AtomicU64,
    processing_max_us: AtomicU64,
    last_event_at: ArcSwapOption<DateTime<Utc>>,
    throughput: Mutex<ThroughputWindow>,
}

#[derive(Debug)]
struct ThroughputWindow {
    started: Instant,
    count: u64,
    last_rate: f64,
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
            last_rate: 0.0,
        }
    }
}

impl ThroughputWindow {
    /// Close the current window once it has run its length.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= THROUGHPUT_WINDOW {
            self.last_rate = self.count as f64 / elapsed.as_secs_f64();
            self.started = now;
            self.count = 0;
        }
    }
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// An inbound event carrying `size` payload bytes.
    pub fn record_received(&self, size: usize) {
        let size = u64::try_from(size).unwrap_or(u64::MAX);
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size, Ordering::Relaxed);
        self.max_message_bytes.fetch_max(size, Ordering::Relaxed);
        self.last_event_at.store(Some(Arc::new(Utc::now())));

        let mut window = self.throughput.lock().expect("throughput lock poisoned");
        window.roll(Instant::now());
        window.count += 1;
    }

    pub fn record_decoded(&self) {
        self.events_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An event on a subscribed channel that no binding matched.
    pub fn record_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// An event discarded because the dispatch queue was full or closed.
    pub fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Outcome and duration of one sink delivery.
    pub fn record_delivery(&self, delivered: bool, elapsed: Duration) {
        if delivered {
            self.events_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        }

        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.processing_total_us.fetch_add(micros, Ordering::Relaxed);
        self.processing_max_us.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total = self.processing_total_us.load(Ordering::Relaxed);
        let avg = total.checked_div(processed).unwrap_or(0);
        let received = self.events_received.load(Ordering::Relaxed);
        let bytes = self.bytes_received.load(Ordering::Relaxed);

        let messages_per_second = {
            let mut window = self.throughput.lock().expect("throughput lock poisoned");
            window.roll(Instant::now());
            window.last_rate
        };

        MetricsSnapshot {
            events_received: received,
            bytes_received: bytes,
            avg_message_bytes: bytes.checked_div(received).unwrap_or(0),
            max_message_bytes: self.max_message_bytes.load(Ordering::Relaxed),
            messages_per_second,
            events_decoded: self.events_decoded.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            avg_processing_ms: micros_to_ms(avg),
            max_processing_ms: micros_to_ms(self.processing_max_us.load(Ordering::Relaxed)),
            last_event_at: self.last_event_at.load_full().map(|t| *t),
        }
    }
}

fn micros_to_ms(micros: u64) -> f64 {
    Duration::from_micros(micros).as_secs_f64() * 1000.0
}

/// Point-in-time copy of [`BridgeMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub bytes_received: u64,
    pub avg_message_bytes: u64,
    pub max_message_bytes: u64,
    /// Receive rate over the last completed window.
    pub messages_per_second: f64,
    pub events_decoded: u64,
    pub events_delivered: u64,
    pub events_ignored: u64,
    pub events_dropped: u64,
    pub decode_failures: u64,
    pub delivery_failures: u64,
    pub reconnects: u64,
    pub avg_processing_ms: f64,
    pub max_processing_ms: f64,
    pub last_event_at: Option<DateTime<Utc>>,
}
