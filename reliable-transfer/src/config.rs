//! Transfer tunables.
//!
//! A [`TransferConfig`] is built once per transfer and handed to
//! [`crate::sender::send_stream`].  The per-discipline constructors carry the
//! defaults each engine was tuned with; individual fields can be overridden
//! afterwards (the CLI does this from its flags).

use std::time::Duration;

use thiserror::Error;

use crate::packet::MAX_PAYLOAD;

/// Which transmission discipline drives the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// One packet in flight at a time.
    StopAndWait,
    /// Up to `window` packets in flight, go-back-N retransmission on timeout.
    FixedWindow { window: usize },
    /// Reno-style congestion window with fast retransmit / fast recovery.
    CongestionControlled,
}

impl std::fmt::Display for Discipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopAndWait => write!(f, "stop-and-wait"),
            Self::FixedWindow { window } => write!(f, "fixed-window(W={window})"),
            Self::CongestionControlled => write!(f, "reno"),
        }
    }
}

/// Every knob an engine reads.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub discipline: Discipline,
    /// Payload bytes per packet (≤ [`MAX_PAYLOAD`]).
    pub max_segment_size: usize,
    /// Bounded wait for one acknowledgment (stop-and-wait, fixed window).
    pub ack_timeout: Duration,
    /// Retry budget: per chunk for stop-and-wait, per transfer for the fixed
    /// window, consecutive timeout events for Reno.
    pub max_retries: u32,
    /// Age after which an unacknowledged Reno packet is retransmitted.
    pub retransmit_timeout: Duration,
    /// Reno acknowledgment poll interval.
    pub poll_interval: Duration,
    /// How long the Reno sender yields when the congestion window is full.
    pub send_backoff: Duration,
    /// Initial congestion window, in packets.
    pub initial_cwnd: f64,
    /// Initial slow-start threshold, in packets.
    pub initial_ssthresh: f64,
    /// Bounded wait for the final cumulative ack once every chunk is queued.
    pub drain_timeout: Duration,
    /// Bounded wait for the receiver's ack + FIN at session close.
    pub handshake_timeout: Duration,
    /// How many times the end-of-stream marker is sent.
    pub end_marker_repeats: u32,
    /// Pause between repeated end markers.
    pub end_marker_spacing: Duration,
    /// Log a progress line every this many packets.
    pub progress_interval: u64,
}

impl TransferConfig {
    pub fn stop_and_wait() -> Self {
        Self {
            discipline: Discipline::StopAndWait,
            max_segment_size: MAX_PAYLOAD,
            ack_timeout: Duration::from_secs(1),
            max_retries: 50,
            retransmit_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            send_backoff: Duration::from_millis(1),
            initial_cwnd: 1.0,
            initial_ssthresh: 64.0,
            drain_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(1),
            end_marker_repeats: 1,
            end_marker_spacing: Duration::ZERO,
            progress_interval: 500,
        }
    }

    pub fn fixed_window(window: usize) -> Self {
        Self {
            discipline: Discipline::FixedWindow { window },
            ack_timeout: Duration::from_millis(500),
            retransmit_timeout: Duration::from_millis(500),
            ..Self::stop_and_wait()
        }
    }

    pub fn reno() -> Self {
        Self {
            discipline: Discipline::CongestionControlled,
            ack_timeout: Duration::from_millis(500),
            retransmit_timeout: Duration::from_millis(500),
            end_marker_repeats: 5,
            end_marker_spacing: Duration::from_millis(50),
            progress_interval: 100,
            ..Self::stop_and_wait()
        }
    }

    /// Defaults for `discipline`.
    pub fn for_discipline(discipline: Discipline) -> Self {
        match discipline {
            Discipline::StopAndWait => Self::stop_and_wait(),
            Discipline::FixedWindow { window } => Self::fixed_window(window),
            Discipline::CongestionControlled => Self::reno(),
        }
    }

    /// `true` when the `n`-th packet should produce a progress line.
    pub fn is_progress_tick(&self, n: u64) -> bool {
        self.progress_interval > 0 && n % self.progress_interval == 0
    }

    /// Reject combinations no engine can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_segment_size == 0 || self.max_segment_size > MAX_PAYLOAD {
            return Err(ConfigError::SegmentSize(self.max_segment_size));
        }
        if let Discipline::FixedWindow { window: 0 } = self.discipline {
            return Err(ConfigError::EmptyWindow);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::NoRetries);
        }
        if !(self.initial_cwnd >= 1.0) || !(self.initial_ssthresh >= 2.0) {
            return Err(ConfigError::InitialWindow {
                cwnd: self.initial_cwnd,
                ssthresh: self.initial_ssthresh,
            });
        }
        if self.end_marker_repeats == 0 {
            return Err(ConfigError::NoEndMarker);
        }
        Ok(())
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::stop_and_wait()
    }
}

/// Reasons a [`TransferConfig`] is rejected.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("segment size {0} outside 1..=1020")]
    SegmentSize(usize),
    #[error("fixed window must hold at least one packet")]
    EmptyWindow,
    #[error("retry budget must be at least 1")]
    NoRetries,
    #[error("initial cwnd {cwnd} must be >= 1 and ssthresh {ssthresh} >= 2")]
    InitialWindow { cwnd: f64, ssthresh: f64 },
    #[error("end-of-stream marker must be sent at least once")]
    NoEndMarker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(TransferConfig::stop_and_wait().validate(), Ok(()));
        assert_eq!(TransferConfig::fixed_window(100).validate(), Ok(()));
        assert_eq!(TransferConfig::reno().validate(), Ok(()));
    }

    #[test]
    fn discipline_defaults() {
        let saw = TransferConfig::stop_and_wait();
        assert_eq!(saw.ack_timeout, Duration::from_secs(1));
        assert_eq!(saw.max_retries, 50);

        let fw = TransferConfig::fixed_window(100);
        assert_eq!(fw.discipline, Discipline::FixedWindow { window: 100 });
        assert_eq!(fw.ack_timeout, Duration::from_millis(500));

        let reno = TransferConfig::reno();
        assert_eq!(reno.initial_cwnd, 1.0);
        assert_eq!(reno.initial_ssthresh, 64.0);
        assert_eq!(reno.end_marker_repeats, 5);
    }

    #[test]
    fn rejects_bad_segment_size() {
        let mut cfg = TransferConfig::default();
        cfg.max_segment_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::SegmentSize(0)));
        cfg.max_segment_size = MAX_PAYLOAD + 1;
        assert_eq!(cfg.validate(), Err(ConfigError::SegmentSize(MAX_PAYLOAD + 1)));
    }

    #[test]
    fn rejects_zero_window_and_budget() {
        assert_eq!(
            TransferConfig::fixed_window(0).validate(),
            Err(ConfigError::EmptyWindow)
        );
        let mut cfg = TransferConfig::reno();
        cfg.max_retries = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::NoRetries));
    }

    #[test]
    fn rejects_small_initial_window() {
        let mut cfg = TransferConfig::reno();
        cfg.initial_ssthresh = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::InitialWindow { .. })));
    }
}
