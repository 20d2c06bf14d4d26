//! Reno-style congestion state machine.
//!
//! Pure state, no I/O and no clock: [`CongestionState::on_ack`] classifies an
//! incoming cumulative ack and applies the matching window update, and
//! [`CongestionState::on_timeout`] applies the retransmission-timeout
//! penalty.  The Reno engine ([`crate::reno`]) calls these from inside its
//! critical section and acts on the returned [`AckEvent`].
//!
//! ```text
//!              cwnd >= ssthresh
//!  SlowStart ───────────────────▶ CongestionAvoidance
//!      ▲  │                          │       ▲
//!      │  │ 3 dup acks     3 dup acks│       │ new ack (cwnd = ssthresh)
//!      │  └───────────▶ FastRecovery ◀┘       │
//!      │                     └────────────────┘
//!      └──────────── timeout (from any phase)
//! ```
//!
//! `cwnd` and `ssthresh` are measured in packets and kept as `f64` so
//! congestion avoidance can grow by `1 / cwnd` per ack.

/// Duplicate acks that trigger fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// Floor for `cwnd`, and its value after a timeout.
pub const MIN_CWND: f64 = 1.0;

/// Floor for `ssthresh`.
pub const MIN_SSTHRESH: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlowStart => write!(f, "SLOW_START"),
            Self::CongestionAvoidance => write!(f, "CONGESTION_AVOIDANCE"),
            Self::FastRecovery => write!(f, "FAST_RECOVERY"),
        }
    }
}

/// What an incoming ack meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    /// Cumulative progress from `previous` to the new ack id.
    NewAck { previous: i32 },
    /// Same id as the last cumulative ack.  `fast_retransmit` is set on the
    /// duplicate that reaches [`DUP_ACK_THRESHOLD`].
    Duplicate { fast_retransmit: bool },
    /// Older than the last cumulative ack; ignored.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CongestionState {
    cwnd: f64,
    ssthresh: f64,
    phase: Phase,
    last_ack: i32,
    dup_run: u32,
}

impl CongestionState {
    /// Start in slow start with the given window and threshold (clamped to
    /// their floors), expecting byte 0 first.
    pub fn new(initial_cwnd: f64, initial_ssthresh: f64) -> Self {
        Self {
            cwnd: initial_cwnd.max(MIN_CWND),
            ssthresh: initial_ssthresh.max(MIN_SSTHRESH),
            phase: Phase::SlowStart,
            last_ack: 0,
            dup_run: 0,
        }
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Last cumulative ack id seen.
    pub fn last_ack(&self) -> i32 {
        self.last_ack
    }

    pub fn duplicate_run(&self) -> u32 {
        self.dup_run
    }

    /// Classify `ack` and update the window.
    pub fn on_ack(&mut self, ack: i32) -> AckEvent {
        if ack == self.last_ack {
            self.dup_run += 1;
            if self.dup_run == DUP_ACK_THRESHOLD {
                self.enter_fast_recovery();
                return AckEvent::Duplicate {
                    fast_retransmit: true,
                };
            }
            if self.phase == Phase::FastRecovery {
                // Window inflation: each further duplicate means one more
                // packet has left the network.
                self.cwnd += 1.0;
            }
            return AckEvent::Duplicate {
                fast_retransmit: false,
            };
        }
        if ack < self.last_ack {
            return AckEvent::Stale;
        }

        let previous = self.last_ack;
        self.grow_window();
        self.last_ack = ack;
        self.dup_run = 0;
        AckEvent::NewAck { previous }
    }

    /// Retransmission-timeout penalty.  Callers apply it at most once per
    /// timeout event.
    pub fn on_timeout(&mut self) {
        log::info!(
            "[reno] TIMEOUT: cwnd {:.2} -> {MIN_CWND}, ssthresh -> {:.2}",
            self.cwnd,
            (self.cwnd / 2.0).max(MIN_SSTHRESH)
        );
        self.ssthresh = (self.cwnd / 2.0).max(MIN_SSTHRESH);
        self.cwnd = MIN_CWND;
        self.set_phase(Phase::SlowStart);
        self.dup_run = 0;
    }

    fn grow_window(&mut self) {
        match self.phase {
            Phase::SlowStart => {
                self.cwnd += 1.0;
                if self.cwnd >= self.ssthresh {
                    self.set_phase(Phase::CongestionAvoidance);
                }
            }
            Phase::CongestionAvoidance => self.cwnd += 1.0 / self.cwnd,
            Phase::FastRecovery => {
                // Deflate on recovery exit.
                self.cwnd = self.ssthresh;
                self.set_phase(Phase::CongestionAvoidance);
            }
        }
    }

    fn enter_fast_recovery(&mut self) {
        let before = self.cwnd;
        self.ssthresh = (self.cwnd / 2.0).max(MIN_SSTHRESH);
        self.cwnd = self.ssthresh + DUP_ACK_THRESHOLD as f64;
        self.set_phase(Phase::FastRecovery);
        log::info!(
            "[reno] FAST RECOVERY at ack {}: cwnd {before:.2} -> {:.2}, ssthresh {:.2}",
            self.last_ack,
            self.cwnd,
            self.ssthresh
        );
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            log::debug!(
                "[reno] {} -> {phase} (cwnd={:.2})",
                self.phase,
                self.cwnd
            );
            self.phase = phase;
        }
    }
}
