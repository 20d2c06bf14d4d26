//! In-process network simulator for deterministic testing.
//!
//! [`link`] builds two [`SimEndpoint`]s joined by a pair of one-way wires.
//! Each direction applies its own [`LinkConfig`] fault model:
//!
//! | Fault        | Description                                         |
//! |--------------|-----------------------------------------------------|
//! | Delay        | Every datagram arrives `delay` after it was sent.   |
//! | Packet loss  | Drop a datagram with probability `loss_rate`.       |
//! | Drop list    | Drop the datagrams at the listed 1-based positions. |
//! | Duplication  | Deliver a datagram twice.                           |
//!
//! Randomness comes from a `StdRng` seeded from `LinkConfig::seed`, so a
//! failing run can be replayed.  Delivery order on a wire is FIFO.
//!
//! Every endpoint keeps a trace of what it sent (including dropped
//! datagrams) for assertions; see [`SimEndpoint::sent`].

use std::io;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::receiver::{self, ReceiveError};
use crate::transport::Transport;

/// Fault model of one direction.
///
/// Probabilities are in `[0.0, 1.0]`.
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// One-way propagation delay.
    pub delay: Duration,
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    /// 1-based positions (in send order) of datagrams to drop.
    pub drop: Vec<u64>,
    pub seed: u64,
}

impl LinkConfig {
    /// Loss-free wire with a fixed one-way delay.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Also drop the datagrams at the given 1-based positions.
    pub fn dropping(mut self, positions: impl IntoIterator<Item = u64>) -> Self {
        self.drop.extend(positions);
        self
    }

    /// Also drop and duplicate at random, reproducibly from `seed`.
    pub fn lossy(mut self, loss_rate: f64, duplicate_rate: f64, seed: u64) -> Self {
        self.loss_rate = loss_rate;
        self.duplicate_rate = duplicate_rate;
        self.seed = seed;
        self
    }
}

/// One entry of an endpoint's send trace.
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub at: Instant,
    pub bytes: Vec<u8>,
    /// The wire discarded this datagram.
    pub dropped: bool,
}

struct Faults {
    config: LinkConfig,
    rng: StdRng,
    sent: u64,
}

/// What the wire does with one datagram.
enum Fate {
    Drop,
    Deliver { copies: usize },
}

impl Faults {
    fn new(config: LinkConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            sent: 0,
        }
    }

    fn decide(&mut self) -> Fate {
        self.sent += 1;
        if self.config.drop.contains(&self.sent) {
            return Fate::Drop;
        }
        if self.config.loss_rate > 0.0 && self.rng.random::<f64>() < self.config.loss_rate {
            return Fate::Drop;
        }
        let duplicated =
            self.config.duplicate_rate > 0.0 && self.rng.random::<f64>() < self.config.duplicate_rate;
        Fate::Deliver {
            copies: if duplicated { 2 } else { 1 },
        }
    }
}

/// One end of a simulated link.
pub struct SimEndpoint {
    wire: mpsc::UnboundedSender<(Instant, Vec<u8>)>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    faults: Mutex<Faults>,
    trace: Mutex<Vec<SentDatagram>>,
}

impl std::fmt::Debug for SimEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEndpoint")
            .field("sent", &self.trace.lock().len())
            .finish_non_exhaustive()
    }
}

/// Build a connected pair of endpoints.
///
/// `forward` governs datagrams sent by the first endpoint, `reverse` those
/// sent by the second.  Must be called inside a tokio runtime.
pub fn link(forward: LinkConfig, reverse: LinkConfig) -> (SimEndpoint, SimEndpoint) {
    let (a_wire, b_inbox) = spawn_wire();
    let (b_wire, a_inbox) = spawn_wire();
    (
        SimEndpoint::new(a_wire, a_inbox, forward),
        SimEndpoint::new(b_wire, b_inbox, reverse),
    )
}

/// A task that holds each datagram until its arrival time, preserving
/// send order.
fn spawn_wire() -> (
    mpsc::UnboundedSender<(Instant, Vec<u8>)>,
    mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<(Instant, Vec<u8>)>();
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some((arrival, datagram)) = wire_rx.recv().await {
            tokio::time::sleep_until(arrival).await;
            if inbox_tx.send(datagram).is_err() {
                break;
            }
        }
    });
    (wire_tx, inbox_rx)
}

impl SimEndpoint {
    fn new(
        wire: mpsc::UnboundedSender<(Instant, Vec<u8>)>,
        inbox: mpsc::UnboundedReceiver<Vec<u8>>,
        config: LinkConfig,
    ) -> Self {
        Self {
            wire,
            inbox: tokio::sync::Mutex::new(inbox),
            faults: Mutex::new(Faults::new(config)),
            trace: Mutex::new(Vec::new()),
        }
    }

    /// Everything this endpoint has sent so far, in order.
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.trace.lock().clone()
    }

    /// Run the reference receiver on this endpoint in a background task.
    pub fn spawn_receiver(self, idle: Duration) -> JoinHandle<Result<Vec<u8>, ReceiveError>> {
        tokio::spawn(async move { receiver::serve(&self, None, idle).await })
    }
}

impl Transport for SimEndpoint {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let now = Instant::now();
        let (fate, delay) = {
            let mut faults = self.faults.lock();
            (faults.decide(), faults.config.delay)
        };
        self.trace.lock().push(SentDatagram {
            at: now,
            bytes: datagram.to_vec(),
            dropped: matches!(fate, Fate::Drop),
        });

        if let Fate::Deliver { copies } = fate {
            for _ in 0..copies {
                // A closed wire behaves like an unreachable peer: silent loss.
                let _ = self.wire.send((now + delay, datagram.to_vec()));
            }
        }
        Ok(())
    }

    async fn recv(&self, wait: Duration) -> io::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + wait;
        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout_at(deadline, inbox.recv()).await {
            Ok(Some(datagram)) => Ok(Some(datagram)),
            Ok(None) => {
                // Peer gone; nothing will ever arrive.
                tokio::time::sleep_until(deadline).await;
                Ok(None)
            }
            Err(_elapsed) => Ok(None),
        }
    }
}
