//! Session close, shared by every engine.
//!
//! ```text
//!  sender                                receiver
//!    │── end marker (seq = final) ×N ──────▶│
//!    │◀──────────────────── ack ────────────│
//!    │◀──────────────────── "fin" ──────────│
//!    │── "==FINACK==" ─────────────────────▶│
//! ```
//!
//! The bulk transfer has already been fully acknowledged when this runs, so
//! a timeout here is logged and reported but never fails the transfer.

use tokio::time::Instant;

use crate::config::TransferConfig;
use crate::packet::Packet;
use crate::transport::Transport;

/// How the close sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Both the ack and the FIN arrived.
    Closed,
    /// The wait expired; FINACK was sent anyway.
    TimedOut,
}

/// Send the end marker, wait for ack + FIN, then send FINACK.
pub async fn close_session<T: Transport>(
    transport: &T,
    final_seq: i32,
    config: &TransferConfig,
) -> HandshakeOutcome {
    let marker = encode_or_empty(&Packet::end_marker(final_seq));
    for i in 0..config.end_marker_repeats {
        if i > 0 && !config.end_marker_spacing.is_zero() {
            tokio::time::sleep(config.end_marker_spacing).await;
        }
        if let Err(e) = transport.send(&marker).await {
            log::warn!("[fin] end marker send failed: {e}");
        }
    }
    log::debug!(
        "[fin] → END seq={final_seq} (x{})",
        config.end_marker_repeats
    );

    let outcome = await_ack_and_fin(transport, config).await;
    match outcome {
        HandshakeOutcome::Closed => log::debug!("[fin] ← ACK + FIN"),
        HandshakeOutcome::TimedOut => log::warn!("[fin] timed out waiting for ACK/FIN"),
    }

    let finack = encode_or_empty(&Packet::finack());
    if let Err(e) = transport.send(&finack).await {
        log::warn!("[fin] FINACK send failed: {e}");
    }
    log::debug!("[fin] → FINACK");
    outcome
}

async fn await_ack_and_fin<T: Transport>(transport: &T, config: &TransferConfig) -> HandshakeOutcome {
    let deadline = Instant::now() + config.handshake_timeout;
    let mut got_ack = false;
    let mut got_fin = false;

    while !(got_ack && got_fin) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return HandshakeOutcome::TimedOut;
        }
        match transport.recv(remaining).await {
            Ok(Some(datagram)) => match Packet::decode(&datagram) {
                Ok(pkt) if pkt.is_fin() => got_fin = true,
                Ok(_) => got_ack = true,
                Err(e) => log::debug!("[fin] ignoring malformed reply: {e}"),
            },
            Ok(None) => return HandshakeOutcome::TimedOut,
            // Errors such as a refused port come back at once; retrying
            // would only spin until the deadline.
            Err(e) => {
                log::debug!("[fin] recv error: {e}");
                return HandshakeOutcome::TimedOut;
            }
        }
    }
    HandshakeOutcome::Closed
}

// The close packets have empty or fixed payloads well under the limit.
fn encode_or_empty(packet: &Packet) -> Vec<u8> {
    packet.encode().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::simulator::{link, LinkConfig};

    fn config() -> TransferConfig {
        let mut cfg = TransferConfig::reno();
        cfg.end_marker_repeats = 3;
        cfg.end_marker_spacing = Duration::from_millis(10);
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn closes_when_ack_and_fin_arrive() {
        let (sender, peer) = link(LinkConfig::default(), LinkConfig::default());

        let replier = tokio::spawn(async move {
            let first = peer.recv(Duration::from_secs(5)).await.unwrap().unwrap();
            assert_eq!(Packet::decode(&first).unwrap(), Packet::end_marker(900));
            peer.send(&Packet::ack(900).encode().unwrap()).await.unwrap();
            peer.send(&Packet::fin(900).encode().unwrap()).await.unwrap();
            peer
        });

        let outcome = close_session(&sender, 900, &config()).await;
        assert_eq!(outcome, HandshakeOutcome::Closed);

        let peer = replier.await.unwrap();
        let sent: Vec<Packet> = sender
            .sent()
            .iter()
            .map(|d| Packet::decode(&d.bytes).unwrap())
            .collect();
        assert_eq!(sent.len(), 4);
        assert!(sent[..3].iter().all(|p| *p == Packet::end_marker(900)));
        assert!(sent[3].is_finack());
        drop(peer);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported_and_finack_still_sent() {
        let (sender, _silent) = link(LinkConfig::default(), LinkConfig::default());

        let outcome = close_session(&sender, 0, &config()).await;
        assert_eq!(outcome, HandshakeOutcome::TimedOut);
        let last = sender.sent().last().cloned().unwrap();
        assert!(Packet::decode(&last.bytes).unwrap().is_finack());
    }

    /// Accepts every send; every recv fails at once, like a UDP socket
    /// whose peer port is closed.
    struct Refused;

    impl Transport for Refused {
        async fn send(&self, _datagram: &[u8]) -> std::io::Result<()> {
            Ok(())
        }

        async fn recv(&self, _wait: Duration) -> std::io::Result<Option<Vec<u8>>> {
            Err(std::io::ErrorKind::ConnectionRefused.into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recv_error_ends_the_wait_immediately() {
        let mut cfg = config();
        cfg.handshake_timeout = Duration::from_secs(10);
        let start = Instant::now();

        let outcome = close_session(&Refused, 0, &cfg).await;
        assert_eq!(outcome, HandshakeOutcome::TimedOut);
        // Only the marker spacing elapses; the 10 s wait is skipped.
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
