//! Per-packet delay sampling, throughput and composite score.
//!
//! Delay for a chunk runs from its *first* transmission to the first
//! acknowledgment that covers it; retransmissions do not restart the clock.
//! All three engines share this accumulator.

use std::time::Duration;

use tokio::time::Instant;

/// Counters kept alongside the metrics; they do not feed the score.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Data packets handed to the transport, retransmissions included.
    pub packets_sent: u64,
    pub retransmissions: u64,
    /// Timeout events (one per expiry, however many packets it resent).
    pub timeouts: u64,
    pub fast_retransmits: u64,
}

/// The externally meaningful outcome of a transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferMetrics {
    /// Application bytes per second.
    pub throughput: f64,
    /// Mean per-chunk delay in seconds.
    pub avg_delay: f64,
    pub score: f64,
}

impl TransferMetrics {
    /// `0.3 · throughput / 1000 + 0.7 / avg_delay`, or 0 without delay
    /// samples.
    pub fn compute(total_bytes: u64, elapsed: Duration, delays: &[Duration]) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            total_bytes as f64 / secs
        } else {
            0.0
        };
        let avg_delay = if delays.is_empty() {
            0.0
        } else {
            delays.iter().map(Duration::as_secs_f64).sum::<f64>() / delays.len() as f64
        };
        let score = if avg_delay > 0.0 {
            0.3 * (throughput / 1000.0) + 0.7 / avg_delay
        } else {
            0.0
        };
        Self {
            throughput,
            avg_delay,
            score,
        }
    }
}

/// Running totals for one transfer session.
#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    delays: Vec<Duration>,
    total_bytes: u64,
    started_at: Instant,
}

impl MetricsAccumulator {
    /// Start the clock now.
    pub fn start(total_bytes: u64) -> Self {
        Self {
            delays: Vec::new(),
            total_bytes,
            started_at: Instant::now(),
        }
    }

    /// Record the delay of a chunk first sent at `first_sent_at` and
    /// acknowledged at `now`.
    pub fn record_delay(&mut self, first_sent_at: Instant, now: Instant) {
        self.delays.push(now.saturating_duration_since(first_sent_at));
    }

    pub fn samples(&self) -> usize {
        self.delays.len()
    }

    /// Stop the clock at `now` and compute the final metrics.
    pub fn finish(&self, now: Instant) -> TransferMetrics {
        TransferMetrics::compute(
            self.total_bytes,
            now.saturating_duration_since(self.started_at),
            &self.delays,
        )
    }
}
