//! Stop-and-wait engine.
//!
//! # Contract
//! - At most **one** chunk is in flight at any moment (`unacked`).
//! - The next chunk is sent only after an ack equal to
//!   `seq + len(chunk)` arrives.
//! - Any other ack is ignored; the wait continues without resending and
//!   without spending a retry.
//! - On timeout the same chunk is sent again.  Reaching the retry budget
//!   for a single chunk aborts the whole transfer.

use tokio::time::Instant;

use crate::config::TransferConfig;
use crate::packet::decode_ack;
use crate::segment::Chunk;
use crate::sender::{TransferError, TransferSession};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// RetransmitEntry
// ---------------------------------------------------------------------------

/// The chunk currently awaiting its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitEntry {
    pub seq: i32,
    /// Ack id that confirms this chunk.
    pub expected_ack: i32,
    /// How many times this chunk has been transmitted (1 = first send).
    pub tx_count: u32,
    /// Timeouts and failed transmissions spent on this chunk.
    pub retries: u32,
    /// Wall-clock time of the first transmission (for delay sampling).
    pub first_sent_at: Instant,
}

// ---------------------------------------------------------------------------
// StopAndWait
// ---------------------------------------------------------------------------

/// Stop-and-wait send-side state.
#[derive(Debug, Default)]
pub struct StopAndWait {
    /// The in-flight chunk, or `None` when the sender is idle.
    pub unacked: Option<RetransmitEntry>,
}

impl StopAndWait {
    /// Move `chunk` into the in-flight slot (first transmission).
    ///
    /// Panics in debug mode if a chunk is already in flight.
    pub fn record_sent(&mut self, chunk: &Chunk, now: Instant) {
        debug_assert!(
            self.unacked.is_none(),
            "record_sent called while a chunk is already in flight"
        );
        self.unacked = Some(RetransmitEntry {
            seq: chunk.seq,
            expected_ack: chunk.end(),
            tx_count: 1,
            retries: 0,
            first_sent_at: now,
        });
    }

    /// Process an inbound ack id.
    ///
    /// Returns the acknowledged entry when `ack_id` matches the in-flight
    /// chunk and clears the slot; returns `None` for anything else.
    pub fn on_ack(&mut self, ack_id: i32) -> Option<RetransmitEntry> {
        if self
            .unacked
            .as_ref()
            .is_some_and(|e| e.expected_ack == ack_id)
        {
            self.unacked.take()
        } else {
            None
        }
    }

    /// Spend one retry on the in-flight chunk and return the new count.
    pub fn on_retry(&mut self) -> u32 {
        self.unacked.as_mut().map_or(0, |e| {
            e.retries += 1;
            e.retries
        })
    }

    /// Count a retransmission of the in-flight chunk.
    pub fn on_retransmit(&mut self) {
        if let Some(ref mut e) = self.unacked {
            e.tx_count += 1;
        }
    }

    /// `true` when a chunk is waiting for an ack.
    pub fn has_unacked(&self) -> bool {
        self.unacked.is_some()
    }
}

// ---------------------------------------------------------------------------
// Engine loop
// ---------------------------------------------------------------------------

pub(crate) async fn run<T: Transport>(
    transport: &T,
    chunks: &[Chunk],
    config: &TransferConfig,
    session: &mut TransferSession,
) -> Result<(), TransferError> {
    let mut saw = StopAndWait::default();
    let total_bytes = chunks.last().map_or(0, Chunk::end).max(1);

    for chunk in chunks {
        let datagram = chunk.encode()?;
        saw.record_sent(chunk, Instant::now());

        loop {
            if let Err(e) = transport.send(&datagram).await {
                log::warn!("[saw] send of seq={} failed: {e}", chunk.seq);
                spend_retry(&mut saw, chunk, config)?;
                saw.on_retransmit();
                continue;
            }
            session.stats.packets_sent += 1;
            if config.is_progress_tick(session.stats.packets_sent) {
                log::info!(
                    "[saw] progress {:.1}% ({} packets sent)",
                    chunk.seq as f64 * 100.0 / total_bytes as f64,
                    session.stats.packets_sent
                );
            }

            if let Some(entry) = await_match(transport, &mut saw, config).await {
                session.metrics.record_delay(entry.first_sent_at, Instant::now());
                break;
            }

            session.stats.timeouts += 1;
            let retries = spend_retry(&mut saw, chunk, config)?;
            if retries % 10 == 0 {
                log::info!("[saw] timeout #{retries} for seq={}", chunk.seq);
            }
            saw.on_retransmit();
            session.stats.retransmissions += 1;
        }
    }
    Ok(())
}

/// Wait for the ack matching the in-flight chunk, ignoring others, until
/// one ack timeout has elapsed since the transmission.
async fn await_match<T: Transport>(
    transport: &T,
    saw: &mut StopAndWait,
    config: &TransferConfig,
) -> Option<RetransmitEntry> {
    let deadline = Instant::now() + config.ack_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match transport.recv(remaining).await {
            Ok(Some(datagram)) => {
                let Some(ack) = decode_ack(&datagram) else {
                    continue;
                };
                if let Some(entry) = saw.on_ack(ack) {
                    return Some(entry);
                }
                log::debug!(
                    "[saw] wrong ACK: expected {:?}, got {ack}",
                    saw.unacked.as_ref().map(|e| e.expected_ack)
                );
            }
            Ok(None) => return None,
            Err(e) => {
                log::warn!("[saw] recv failed: {e}");
                return None;
            }
        }
    }
}

fn spend_retry(
    saw: &mut StopAndWait,
    chunk: &Chunk,
    config: &TransferConfig,
) -> Result<u32, TransferError> {
    let retries = saw.on_retry();
    if retries >= config.max_retries {
        log::error!(
            "[saw] no ACK for seq={} after {} retries",
            chunk.seq,
            config.max_retries
        );
        return Err(TransferError::RetryBudgetExhausted {
            seq: chunk.seq,
            budget: config.max_retries,
        });
    }
    Ok(retries)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
