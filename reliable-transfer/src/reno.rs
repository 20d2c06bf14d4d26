//! Congestion-controlled engine: a Reno-style window driven by two
//! concurrent activities.
//!
//! # Architecture
//!
//! ```text
//!   sender activity (caller's task)        ack activity (spawned task)
//!   ───────────────────────────────        ───────────────────────────
//!   loop:                                  while running:
//!     lock ─▶ in_flight < cwnd·MSS?          recv(poll_interval)
//!             record chunk                   ├─ ack  ─▶ lock ─▶ on_ack
//!     unlock ─▶ send                         │            └─▶ fast retransmit?
//!     (window full: sleep send_backoff)      └─ none ─▶ lock ─▶ on_poll_timeout
//!   drain: wait window_base == final                      └─▶ RTO resends
//!   running = false, join ack task
//!                     │                              │
//!                     └──────▶ Arc<Shared> ◀─────────┘
//!                              Mutex<RenoWindow>
//! ```
//!
//! Every read-modify-write of the outstanding map and congestion state goes
//! through the single [`RenoWindow`] lock.  The lock is never held across an
//! `.await`: datagrams are chosen under the lock and sent after it is
//! released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::TransferConfig;
use crate::congestion::{AckEvent, CongestionState};
use crate::metrics::{MetricsAccumulator, TransferStats};
use crate::packet::decode_ack;
use crate::segment::Chunk;
use crate::sender::TransferError;
use crate::transport::Transport;

/// A chunk sent at least once and not yet cumulatively acknowledged.
#[derive(Debug, Clone)]
struct Outstanding {
    datagram: Vec<u8>,
    first_sent_at: Instant,
    last_sent_at: Instant,
}

/// Result of a poll that saw no acknowledgment.
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Datagrams whose retransmission timer expired.
    pub resend: Vec<Vec<u8>>,
    /// The consecutive-timeout budget is spent; the transfer must abort.
    pub exhausted: bool,
}

// ---------------------------------------------------------------------------
// RenoWindow
// ---------------------------------------------------------------------------

/// Shared window state of one congestion-controlled transfer.
#[derive(Debug)]
pub struct RenoWindow {
    cc: CongestionState,
    outstanding: BTreeMap<i32, Outstanding>,
    window_base: i32,
    next_seq: i32,
    mss: usize,
    metrics: MetricsAccumulator,
    stats: TransferStats,
    consecutive_timeouts: u32,
    failed: bool,
}

impl RenoWindow {
    pub fn new(config: &TransferConfig, metrics: MetricsAccumulator) -> Self {
        Self {
            cc: CongestionState::new(config.initial_cwnd, config.initial_ssthresh),
            outstanding: BTreeMap::new(),
            window_base: 0,
            next_seq: 0,
            mss: config.max_segment_size,
            metrics,
            stats: TransferStats::default(),
            consecutive_timeouts: 0,
            failed: false,
        }
    }

    /// Lowest unacknowledged byte offset.
    pub fn window_base(&self) -> i32 {
        self.window_base
    }

    /// Offset of the next byte to be sent for the first time.
    pub fn next_seq(&self) -> i32 {
        self.next_seq
    }

    pub fn congestion(&self) -> &CongestionState {
        &self.cc
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Chunks still tracked as outstanding.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Bytes sent but not yet cumulatively acknowledged.
    pub fn bytes_in_flight(&self) -> i64 {
        (i64::from(self.next_seq) - i64::from(self.window_base)).max(0)
    }

    /// `true` while the congestion window admits another chunk.
    pub fn can_send(&self) -> bool {
        (self.bytes_in_flight() as f64) < self.cc.cwnd() * self.mss as f64
    }

    /// Track `chunk` as sent now and advance `next_seq` past it.
    pub fn record_sent(&mut self, chunk: &Chunk, datagram: Vec<u8>, now: Instant) {
        self.outstanding.insert(
            chunk.seq,
            Outstanding {
                datagram,
                first_sent_at: now,
                last_sent_at: now,
            },
        );
        self.next_seq = chunk.end();
        self.stats.packets_sent += 1;
    }

    /// Process cumulative ack `ack` received at `now`.
    ///
    /// Returns the datagram to send again when the ack triggered fast
    /// retransmit.
    pub fn on_ack(&mut self, ack: i32, now: Instant) -> Option<Vec<u8>> {
        match self.cc.on_ack(ack) {
            AckEvent::Duplicate {
                fast_retransmit: true,
            } => {
                self.stats.fast_retransmits += 1;
                let entry = self.outstanding.get_mut(&ack)?;
                entry.last_sent_at = now;
                self.stats.retransmissions += 1;
                self.stats.packets_sent += 1;
                log::debug!("[reno] fast retransmit seq={ack}");
                Some(entry.datagram.clone())
            }
            AckEvent::Duplicate { .. } | AckEvent::Stale => None,
            AckEvent::NewAck { .. } => {
                let still_outstanding = self.outstanding.split_off(&ack);
                let acked = std::mem::replace(&mut self.outstanding, still_outstanding);
                for entry in acked.values() {
                    self.metrics.record_delay(entry.first_sent_at, now);
                }
                self.window_base = self.window_base.max(ack);
                self.consecutive_timeouts = 0;
                None
            }
        }
    }

    /// Poll expired without an ack: resend every outstanding packet older
    /// than `rto` and apply the timeout penalty once.
    ///
    /// `budget` is the number of consecutive timeout events (without
    /// cumulative progress in between) that aborts the transfer.
    pub fn on_poll_timeout(&mut self, now: Instant, rto: Duration, budget: u32) -> PollOutcome {
        let expired: Vec<i32> = self
            .outstanding
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_sent_at) > rto)
            .map(|(seq, _)| *seq)
            .collect();
        if expired.is_empty() {
            return PollOutcome::default();
        }

        self.stats.timeouts += 1;
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= budget {
            self.failed = true;
            return PollOutcome {
                resend: Vec::new(),
                exhausted: true,
            };
        }

        let mut resend = Vec::with_capacity(expired.len());
        for seq in expired {
            if let Some(entry) = self.outstanding.get_mut(&seq) {
                log::debug!("[reno] RTO retransmit seq={seq}");
                entry.last_sent_at = now;
                resend.push(entry.datagram.clone());
            }
        }
        self.stats.retransmissions += resend.len() as u64;
        self.stats.packets_sent += resend.len() as u64;
        self.cc.on_timeout();
        PollOutcome {
            resend,
            exhausted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Shared {
    window: Mutex<RenoWindow>,
    running: AtomicBool,
}

/// Everything the caller needs once the bulk transfer is over.
#[derive(Debug)]
pub struct RenoOutcome {
    pub metrics: MetricsAccumulator,
    pub stats: TransferStats,
    pub congestion: CongestionState,
}

/// Send `chunks` under Reno congestion control and wait until the receiver
/// has cumulatively acknowledged `final_seq`.
///
/// The acknowledgment task is stopped and joined before returning, so the
/// caller owns the transport exclusively for the close handshake.
pub(crate) async fn run<T: Transport + 'static>(
    transport: Arc<T>,
    chunks: &[Chunk],
    final_seq: i32,
    config: &TransferConfig,
    metrics: MetricsAccumulator,
) -> Result<RenoOutcome, TransferError> {
    let shared = Arc::new(Shared {
        window: Mutex::new(RenoWindow::new(config, metrics)),
        running: AtomicBool::new(true),
    });

    let acker = tokio::spawn(acknowledgment_loop(
        Arc::clone(&transport),
        Arc::clone(&shared),
        AckLoopConfig {
            poll_interval: config.poll_interval,
            rto: config.retransmit_timeout,
            budget: config.max_retries,
        },
    ));

    let result = async {
        send_all(&*transport, &shared, chunks, config).await?;
        drain(&shared, final_seq, config).await
    }
    .await;

    shared.running.store(false, Ordering::Release);
    acker.await?;
    result?;

    let window = shared.window.lock();
    log::info!(
        "[reno] all data acknowledged: cwnd={:.2} ssthresh={:.2} phase={}",
        window.cc.cwnd(),
        window.cc.ssthresh(),
        window.cc.phase()
    );
    Ok(RenoOutcome {
        metrics: window.metrics.clone(),
        stats: window.stats.clone(),
        congestion: window.cc.clone(),
    })
}

/// Sender activity: queue every chunk for at least one transmission.
async fn send_all<T: Transport>(
    transport: &T,
    shared: &Shared,
    chunks: &[Chunk],
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let total_bytes = chunks.last().map_or(0, Chunk::end).max(1);

    for chunk in chunks {
        let datagram = chunk.encode()?;
        loop {
            let admitted = {
                let mut window = shared.window.lock();
                if window.has_failed() {
                    return Err(budget_exhausted(&window, config));
                }
                if window.can_send() {
                    window.record_sent(chunk, datagram.clone(), Instant::now());
                    Some(window.stats.packets_sent)
                } else {
                    None
                }
            };
            let Some(sent) = admitted else {
                tokio::time::sleep(config.send_backoff).await;
                continue;
            };

            if let Err(e) = transport.send(&datagram).await {
                // Still tracked; the retransmission timer will resend it.
                log::warn!("[reno] send of seq={} failed: {e}", chunk.seq);
            }
            if config.is_progress_tick(sent) {
                let window = shared.window.lock();
                log::info!(
                    "[reno] sent {sent} packets, {:.1}% queued, cwnd={:.2}, outstanding={}",
                    chunk.end() as f64 * 100.0 / total_bytes as f64,
                    window.cc.cwnd(),
                    window.outstanding()
                );
            }
            break;
        }
    }
    log::debug!("[reno] all {} chunks queued", chunks.len());
    Ok(())
}

/// Bounded wait for the cumulative ack of the last byte.
async fn drain(
    shared: &Shared,
    final_seq: i32,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let deadline = Instant::now() + config.drain_timeout;
    loop {
        {
            let window = shared.window.lock();
            if window.window_base() >= final_seq {
                return Ok(());
            }
            if window.has_failed() {
                return Err(budget_exhausted(&window, config));
            }
            if Instant::now() >= deadline {
                log::error!(
                    "[reno] timed out waiting for final ACKs (window_base={}/{final_seq})",
                    window.window_base()
                );
                return Err(TransferError::DrainTimeout {
                    waited: config.drain_timeout,
                    acked: window.window_base(),
                });
            }
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

fn budget_exhausted(window: &RenoWindow, config: &TransferConfig) -> TransferError {
    log::error!(
        "[reno] {} consecutive timeouts at window_base={}",
        config.max_retries,
        window.window_base()
    );
    TransferError::RetryBudgetExhausted {
        seq: window.window_base(),
        budget: config.max_retries,
    }
}

#[derive(Debug, Clone, Copy)]
struct AckLoopConfig {
    poll_interval: Duration,
    rto: Duration,
    budget: u32,
}

/// Acknowledgment activity: runs until `running` is cleared or the retry
/// budget is spent.
async fn acknowledgment_loop<T: Transport>(
    transport: Arc<T>,
    shared: Arc<Shared>,
    cfg: AckLoopConfig,
) {
    let mut acks_received = 0u64;
    let mut last_check = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        let (mut resend, poll_expired) = match transport.recv(cfg.poll_interval).await {
            Ok(Some(datagram)) => match decode_ack(&datagram) {
                Some(ack) => {
                    acks_received += 1;
                    let fast = shared.window.lock().on_ack(ack, Instant::now());
                    log::trace!("[reno] ← ACK {ack} (#{acks_received})");
                    (fast.into_iter().collect::<Vec<_>>(), false)
                }
                None => {
                    log::debug!("[reno] ignoring malformed ack ({} bytes)", datagram.len());
                    (Vec::new(), false)
                }
            },
            Ok(None) => (Vec::new(), true),
            Err(e) => {
                log::debug!("[reno] recv failed: {e}");
                tokio::time::sleep(cfg.poll_interval).await;
                (Vec::new(), true)
            }
        };

        // A steady stream of acks must not starve the RTO check.
        if poll_expired || last_check.elapsed() >= cfg.poll_interval {
            last_check = Instant::now();
            let poll = shared
                .window
                .lock()
                .on_poll_timeout(Instant::now(), cfg.rto, cfg.budget);
            if poll.exhausted {
                break;
            }
            resend.extend(poll.resend);
        }

        for datagram in resend {
            if let Err(e) = transport.send(&datagram).await {
                log::warn!("[reno] retransmission failed: {e}");
            }
        }
    }
    log::debug!("[reno] ack loop stopped after {acks_received} ACKs");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::Phase;
    use crate::segment::Segmenter;

    const MSS: usize = 500;

    fn window(cwnd: f64, ssthresh: f64) -> RenoWindow {
        let mut cfg = TransferConfig::reno();
        cfg.max_segment_size = MSS;
        cfg.initial_cwnd = cwnd;
        cfg.initial_ssthresh = ssthresh;
        RenoWindow::new(&cfg, MetricsAccumulator::start(5000))
    }

    fn chunks() -> Vec<Chunk> {
        Segmenter::new(&[0u8; 5000], MSS).unwrap().collect()
    }

    fn send_while_allowed(w: &mut RenoWindow, chunks: &[Chunk], next: &mut usize, now: Instant) {
        while *next < chunks.len() && w.can_send() {
            let c = &chunks[*next];
            w.record_sent(c, c.encode().unwrap(), now);
            *next += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_admits_cwnd_packets() {
        let chunks = chunks();
        let mut w = window(1.0, 64.0);
        let mut next = 0;
        let now = Instant::now();

        send_while_allowed(&mut w, &chunks, &mut next, now);
        assert_eq!(next, 1);

        assert!(w.on_ack(500, now).is_none());
        assert_eq!(w.congestion().cwnd(), 2.0);
        send_while_allowed(&mut w, &chunks, &mut next, now);
        assert_eq!(next, 3);
        assert_eq!(w.bytes_in_flight(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn new_ack_evicts_and_samples_delay() {
        let chunks = chunks();
        let mut w = window(4.0, 64.0);
        let mut next = 0;
        let sent = Instant::now();
        send_while_allowed(&mut w, &chunks, &mut next, sent);
        assert_eq!(w.outstanding(), 4);

        tokio::time::advance(Duration::from_millis(40)).await;
        w.on_ack(1500, Instant::now());
        assert_eq!(w.window_base(), 1500);
        assert_eq!(w.outstanding(), 1);
        assert_eq!(w.metrics.samples(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn triple_duplicate_resends_once() {
        let chunks = chunks();
        let mut w = window(8.0, 64.0);
        let mut next = 0;
        let now = Instant::now();
        send_while_allowed(&mut w, &chunks, &mut next, now);

        // Chunk at 500 lost; every later arrival re-acks 500.
        assert!(w.on_ack(500, now).is_none());
        assert!(w.on_ack(500, now).is_none());
        assert!(w.on_ack(500, now).is_none());
        let resent = w.on_ack(500, now).expect("third duplicate retransmits");
        assert_eq!(resent, chunks[1].encode().unwrap());
        assert_eq!(w.congestion().phase(), Phase::FastRecovery);

        let cwnd = w.congestion().cwnd();
        assert!(w.on_ack(500, now).is_none());
        assert_eq!(w.congestion().cwnd(), cwnd + 1.0);
        assert_eq!(w.stats().fast_retransmits, 1);
        assert_eq!(w.stats().retransmissions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_penalty_applies_once_per_event() {
        let chunks = chunks();
        let mut w = window(4.0, 64.0);
        let mut next = 0;
        send_while_allowed(&mut w, &chunks, &mut next, Instant::now());

        let rto = Duration::from_millis(500);
        let early = w.on_poll_timeout(Instant::now(), rto, 10);
        assert!(early.resend.is_empty());

        tokio::time::advance(Duration::from_millis(501)).await;
        let poll = w.on_poll_timeout(Instant::now(), rto, 10);
        assert_eq!(poll.resend.len(), 4);
        assert!(!poll.exhausted);
        assert_eq!(w.congestion().cwnd(), 1.0);
        assert_eq!(w.congestion().ssthresh(), 2.0);
        assert_eq!(w.congestion().phase(), Phase::SlowStart);
        assert_eq!(w.stats().timeouts, 1);

        // Timers were refreshed: nothing is due right away.
        assert!(w.on_poll_timeout(Instant::now(), rto, 10).resend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_timeouts_exhaust_budget() {
        let chunks = chunks();
        let mut w = window(1.0, 64.0);
        let mut next = 0;
        send_while_allowed(&mut w, &chunks, &mut next, Instant::now());

        let rto = Duration::from_millis(100);
        for _ in 0..2 {
            tokio::time::advance(Duration::from_millis(101)).await;
            assert!(!w.on_poll_timeout(Instant::now(), rto, 3).exhausted);
        }
        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(w.on_poll_timeout(Instant::now(), rto, 3).exhausted);
        assert!(w.has_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_timeout_budget() {
        let chunks = chunks();
        let mut w = window(2.0, 64.0);
        let mut next = 0;
        send_while_allowed(&mut w, &chunks, &mut next, Instant::now());

        let rto = Duration::from_millis(100);
        tokio::time::advance(Duration::from_millis(101)).await;
        w.on_poll_timeout(Instant::now(), rto, 2);
        w.on_ack(500, Instant::now());
        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(!w.on_poll_timeout(Instant::now(), rto, 2).exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn window_base_is_monotonic_under_random_acks() {
        use rand::Rng;

        let chunks = chunks();
        let mut rng = rand::rng();
        let mut w = window(1.0, 4.0);
        let mut next = 0;
        let mut last_base = 0;

        for _ in 0..500 {
            send_while_allowed(&mut w, &chunks, &mut next, Instant::now());
            let ack = rng.random_range(0..=10) * MSS as i32;
            w.on_ack(ack.min(w.next_seq()), Instant::now());
            if rng.random_bool(0.1) {
                tokio::time::advance(Duration::from_millis(600)).await;
                w.on_poll_timeout(Instant::now(), Duration::from_millis(500), u32::MAX);
            }
            assert!(w.window_base() >= last_base);
            assert!(w.congestion().cwnd() >= 1.0);
            assert!(w.congestion().ssthresh() >= 2.0);
            last_base = w.window_base();
        }
    }
}
