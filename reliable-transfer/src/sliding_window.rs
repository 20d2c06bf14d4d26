//! Fixed-size sliding-window engine.
//!
//! [`FixedWindow`] keeps one [`WindowEntry`] per chunk and a window of at
//! most `W` chunks that may be in flight.  Acks are cumulative; on timeout
//! every unacknowledged chunk inside the window is sent again (go-back-N).
//!
//! # Index layout
//!
//! ```text
//!  window_start      next_to_send       window_start + W
//!      │                  │                    │
//!  ────┼──────────────────┼────────────────────┼──────────▶ chunk index
//!      │ <── in flight ──▶│ <──── sendable ───▶│
//! ```
//!
//! Invariant: `window_start <= next_to_send <= window_start + W`, and
//! `window_start` never moves backwards.
//!
//! [`FixedWindow`] only manages state; [`run`] owns the I/O loop.

use tokio::time::Instant;

use crate::config::TransferConfig;
use crate::packet::decode_ack;
use crate::segment::Chunk;
use crate::sender::{TransferError, TransferSession};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// WindowEntry
// ---------------------------------------------------------------------------

/// Bookkeeping for one chunk of the stream.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub seq: i32,
    /// Time of the first transmission; `None` until the chunk is sent.
    pub first_sent_at: Option<Instant>,
    /// Total number of times this chunk has been transmitted.
    pub tx_count: u32,
    pub acked: bool,
}

// ---------------------------------------------------------------------------
// FixedWindow
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FixedWindow {
    /// Index of the first unacknowledged chunk (left window edge).
    pub window_start: usize,
    /// Index of the next chunk to consider for transmission.
    pub next_to_send: usize,
    window_size: usize,
    entries: Vec<WindowEntry>,
}

impl FixedWindow {
    /// Track `chunks` with a window of `window_size` packets (≥ 1).
    pub fn new(chunks: &[Chunk], window_size: usize) -> Self {
        Self {
            window_start: 0,
            next_to_send: 0,
            window_size: window_size.max(1),
            entries: chunks
                .iter()
                .map(|c| WindowEntry {
                    seq: c.seq,
                    first_sent_at: None,
                    tx_count: 0,
                    acked: false,
                })
                .collect(),
        }
    }

    /// `true` once every chunk has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.window_start == self.entries.len()
    }

    /// One past the last index inside the window.
    pub fn window_end(&self) -> usize {
        (self.window_start + self.window_size).min(self.entries.len())
    }

    pub fn entry(&self, index: usize) -> Option<&WindowEntry> {
        self.entries.get(index)
    }

    /// Claim every never-sent, unacknowledged chunk in
    /// `[next_to_send, window_end)` for its first transmission.
    ///
    /// Returns the claimed indices and moves `next_to_send` to the window
    /// end.
    pub fn take_sendable(&mut self, now: Instant) -> Vec<usize> {
        let end = self.window_end();
        let mut claimed = Vec::new();
        for index in self.next_to_send..end {
            let entry = &mut self.entries[index];
            if entry.acked || entry.first_sent_at.is_some() {
                continue;
            }
            entry.first_sent_at = Some(now);
            entry.tx_count = 1;
            claimed.push(index);
        }
        self.next_to_send = self.next_to_send.max(end);
        claimed
    }

    /// Process cumulative ack `ack`.
    ///
    /// Marks every chunk at or after `window_start` whose `seq < ack` as
    /// acknowledged, slides `window_start` past the acknowledged prefix and
    /// resets `next_to_send` to it.  Returns the first-send times of the
    /// newly acknowledged chunks (for delay sampling).
    pub fn on_ack(&mut self, ack: i32) -> Vec<Instant> {
        let mut first_sends = Vec::new();
        for entry in &mut self.entries[self.window_start..] {
            if entry.seq < ack && !entry.acked {
                entry.acked = true;
                if let Some(at) = entry.first_sent_at {
                    first_sends.push(at);
                }
            }
        }
        while self
            .entries
            .get(self.window_start)
            .is_some_and(|e| e.acked)
        {
            self.window_start += 1;
        }
        self.next_to_send = self.window_start;
        first_sends
    }

    /// Go-back-N step: every sent, unacknowledged chunk inside the window.
    ///
    /// Bumps `tx_count` on each returned index.
    pub fn take_retransmits(&mut self) -> Vec<usize> {
        let end = self.window_end();
        let mut resend = Vec::new();
        for index in self.window_start..end {
            let entry = &mut self.entries[index];
            if entry.acked || entry.first_sent_at.is_none() {
                continue;
            }
            entry.tx_count += 1;
            resend.push(index);
        }
        resend
    }
}

// ---------------------------------------------------------------------------
// Engine loop
// ---------------------------------------------------------------------------

/// Drive `chunks` through a fixed window until all are acknowledged.
///
/// The retry budget is shared by the whole transfer: each ack timeout and
/// each failed transport call spends one retry.  The ack timer restarts
/// only when an ack moves `window_start`; acks that make no progress do not
/// extend the wait.
pub(crate) async fn run<T: Transport>(
    transport: &T,
    chunks: &[Chunk],
    window_size: usize,
    config: &TransferConfig,
    session: &mut TransferSession,
) -> Result<(), TransferError> {
    let datagrams = chunks
        .iter()
        .map(Chunk::encode)
        .collect::<Result<Vec<_>, _>>()?;
    let mut window = FixedWindow::new(chunks, window_size);
    let mut retries = 0u32;
    let mut deadline = Instant::now() + config.ack_timeout;

    while !window.is_complete() {
        for index in window.take_sendable(Instant::now()) {
            if let Err(e) = transport.send(&datagrams[index]).await {
                log::warn!("[window] send of chunk {index} failed: {e}");
                spend_retry(&mut retries, &window, config)?;
                continue;
            }
            session.stats.packets_sent += 1;
            if config.is_progress_tick(session.stats.packets_sent) {
                log::info!(
                    "[window] progress {:.1}% (window {}..{}, sent {})",
                    window.window_start as f64 * 100.0 / chunks.len() as f64,
                    window.window_start,
                    window.window_end(),
                    session.stats.packets_sent
                );
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = if remaining.is_zero() {
            Ok(None)
        } else {
            transport.recv(remaining).await
        };
        match outcome {
            Ok(Some(datagram)) => {
                let Some(ack) = decode_ack(&datagram) else {
                    log::debug!("[window] ignoring malformed ack ({} bytes)", datagram.len());
                    continue;
                };
                let now = Instant::now();
                let before = window.window_start;
                let newly_acked = window.on_ack(ack);
                for first_sent_at in &newly_acked {
                    session.metrics.record_delay(*first_sent_at, now);
                }
                if window.window_start > before {
                    deadline = now + config.ack_timeout;
                }
                log::trace!(
                    "[window] ← ACK {ack} (+{}) window_start={}",
                    newly_acked.len(),
                    window.window_start
                );
            }
            outcome => {
                if let Err(e) = outcome {
                    log::warn!("[window] recv failed: {e}");
                }
                session.stats.timeouts += 1;
                spend_retry(&mut retries, &window, config)?;

                let resend = window.take_retransmits();
                log::debug!(
                    "[window] timeout #{retries}, retransmitting {} chunk(s) from {}",
                    resend.len(),
                    window.window_start
                );
                for index in resend {
                    match transport.send(&datagrams[index]).await {
                        Ok(()) => {
                            session.stats.packets_sent += 1;
                            session.stats.retransmissions += 1;
                        }
                        Err(e) => {
                            log::warn!("[window] resend of chunk {index} failed: {e}");
                            spend_retry(&mut retries, &window, config)?;
                        }
                    }
                }
                deadline = Instant::now() + config.ack_timeout;
            }
        }
    }
    Ok(())
}

fn spend_retry(
    retries: &mut u32,
    window: &FixedWindow,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    *retries += 1;
    if *retries >= config.max_retries {
        let seq = window
            .entry(window.window_start)
            .map_or(0, |e| e.seq);
        log::error!("[window] retry budget of {} exhausted at seq {seq}", config.max_retries);
        return Err(TransferError::RetryBudgetExhausted {
            seq,
            budget: config.max_retries,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segmenter;

    fn chunks(len: usize, mss: usize) -> Vec<Chunk> {
        Segmenter::new(&vec![0u8; len], mss).unwrap().collect()
    }

    #[test]
    fn initial_state() {
        let w = FixedWindow::new(&chunks(5000, 500), 4);
        assert_eq!(w.window_start, 0);
        assert_eq!(w.next_to_send, 0);
        assert_eq!(w.window_end(), 4);
        assert!(!w.is_complete());
    }

    #[test]
    fn sends_at_most_one_window() {
        let mut w = FixedWindow::new(&chunks(5000, 500), 4);
        let now = Instant::now();
        assert_eq!(w.take_sendable(now), vec![0, 1, 2, 3]);
        assert_eq!(w.next_to_send, 4);
        assert!(w.take_sendable(now).is_empty());
    }

    #[test]
    fn cumulative_ack_slides_window() {
        let mut w = FixedWindow::new(&chunks(5000, 500), 4);
        let now = Instant::now();
        w.take_sendable(now);

        assert_eq!(w.on_ack(1000).len(), 2);
        assert_eq!(w.window_start, 2);
        assert_eq!(w.next_to_send, 2);
        // Chunks 2 and 3 are already in flight; only 4 and 5 are new.
        assert_eq!(w.take_sendable(now), vec![4, 5]);
    }

    #[test]
    fn duplicate_ack_acknowledges_nothing() {
        let mut w = FixedWindow::new(&chunks(5000, 500), 4);
        w.take_sendable(Instant::now());
        assert_eq!(w.on_ack(500).len(), 1);
        assert!(w.on_ack(500).is_empty());
        assert_eq!(w.window_start, 1);
    }

    #[test]
    fn timeout_resends_every_unacked_chunk_in_window() {
        let mut w = FixedWindow::new(&chunks(5000, 500), 4);
        w.take_sendable(Instant::now());
        w.on_ack(500);
        w.take_sendable(Instant::now()); // chunk 4

        assert_eq!(w.take_retransmits(), vec![1, 2, 3, 4]);
        assert_eq!(w.entry(1).unwrap().tx_count, 2);
        assert_eq!(w.entry(4).unwrap().tx_count, 2);
    }

    #[test]
    fn final_ack_completes() {
        let mut w = FixedWindow::new(&chunks(1200, 500), 8);
        w.take_sendable(Instant::now());
        assert_eq!(w.on_ack(1200).len(), 3);
        assert!(w.is_complete());
        assert!(w.take_retransmits().is_empty());
    }

    #[test]
    fn window_start_never_moves_backwards() {
        let mut w = FixedWindow::new(&chunks(5000, 500), 3);
        let mut last = 0;
        for ack in [500, 1500, 1000, 0, 1500, 3000, 2000, 5000, 4000] {
            w.take_sendable(Instant::now());
            w.on_ack(ack);
            assert!(w.window_start >= last);
            assert!(w.next_to_send <= w.window_start + 3);
            last = w.window_start;
        }
        assert!(w.is_complete());
    }

    /// Lets the first `ok_sends` sends through, then fails every send.
    /// Nothing is ever received.
    struct FailingAfter {
        ok_sends: std::sync::atomic::AtomicUsize,
    }

    impl Transport for FailingAfter {
        async fn send(&self, _datagram: &[u8]) -> std::io::Result<()> {
            use std::sync::atomic::Ordering;
            let left = self.ok_sends.load(Ordering::Relaxed);
            if left == 0 {
                return Err(std::io::ErrorKind::ConnectionRefused.into());
            }
            self.ok_sends.store(left - 1, Ordering::Relaxed);
            Ok(())
        }

        async fn recv(
            &self,
            wait: std::time::Duration,
        ) -> std::io::Result<Option<Vec<u8>>> {
            tokio::time::sleep(wait).await;
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resends_spend_the_budget() {
        use crate::metrics::MetricsAccumulator;

        let chunks = chunks(2000, 500);
        let mut cfg = TransferConfig::fixed_window(2);
        cfg.max_retries = 3;
        let transport = FailingAfter {
            ok_sends: 2.into(),
        };
        let mut session = TransferSession {
            metrics: MetricsAccumulator::start(2000),
            stats: Default::default(),
        };

        let err = run(&transport, &chunks, 2, &cfg, &mut session)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::RetryBudgetExhausted { seq: 0, budget: 3 }
        ));
        // One timeout, then both failed resends use up the rest.
        assert_eq!(session.stats.timeouts, 1);
        assert_eq!(session.stats.retransmissions, 0);
        assert_eq!(session.stats.packets_sent, 2);
    }
}
