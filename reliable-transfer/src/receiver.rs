//! Reference receiving endpoint.
//!
//! [`Receiver`] is the state machine behind `reliable-transfer receive` and
//! the simulator-backed tests:
//!
//! - Data at the next expected offset is delivered, then any buffered
//!   segments that have become contiguous.
//! - Segments ahead of the expected offset are buffered silently.
//! - Duplicates (entirely below the expected offset) are discarded.
//! - Every data packet is answered with a cumulative ack carrying the next
//!   expected offset.
//! - The end-of-stream marker at the expected offset is answered with one
//!   ack and one FIN; the session closes on FINACK.
//!
//! [`Receiver`] only manages state; [`serve`] owns the I/O loop.

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::packet::{Packet, PacketError};
use crate::transport::Transport;

#[derive(Debug, Default)]
pub struct Receiver {
    /// Next contiguous byte offset expected.
    expected: i32,
    /// Segments that arrived ahead of `expected`, keyed by offset.
    out_of_order: BTreeMap<i32, Vec<u8>>,
    data: Vec<u8>,
    fin_sent: bool,
    closed: bool,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative ack value: every byte below it has been delivered.
    pub fn expected(&self) -> i32 {
        self.expected
    }

    /// `true` once a FIN has gone out in reply to the end marker.
    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    /// `true` once the sender's FINACK has arrived.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// In-order bytes delivered so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Process one inbound packet and return the replies to send.
    pub fn on_packet(&mut self, packet: Packet) -> Vec<Packet> {
        if packet.is_finack() {
            log::debug!("[recv] ← FINACK");
            self.closed = true;
            return Vec::new();
        }
        if packet.is_end_marker() {
            if packet.seq == self.expected {
                log::debug!("[recv] ← END seq={}; replying ACK + FIN", packet.seq);
                self.fin_sent = true;
                return vec![Packet::ack(self.expected), Packet::fin(self.expected)];
            }
            // Marker overtook data still missing; keep asking for the gap.
            return vec![Packet::ack(self.expected)];
        }

        self.on_segment(packet.seq, packet.payload);
        vec![Packet::ack(self.expected)]
    }

    fn on_segment(&mut self, seq: i32, payload: Vec<u8>) {
        let end = seq.saturating_add(payload.len() as i32);
        if end <= self.expected {
            log::trace!("[recv] duplicate seq={seq}");
            return;
        }
        if seq > self.expected {
            log::trace!("[recv] buffering seq={seq} (expected {})", self.expected);
            self.out_of_order.entry(seq).or_insert(payload);
            return;
        }

        // Overlaps or starts exactly at `expected`.
        let skip = (self.expected - seq) as usize;
        self.data.extend_from_slice(&payload[skip..]);
        self.expected = end;

        while let Some(entry) = self.out_of_order.first_entry() {
            let seq = *entry.key();
            if seq > self.expected {
                break;
            }
            let payload = entry.remove();
            let end = seq.saturating_add(payload.len() as i32);
            if end > self.expected {
                let skip = (self.expected - seq) as usize;
                self.data.extend_from_slice(&payload[skip..]);
                self.expected = end;
            }
        }
    }
}

/// Reasons [`serve`] gives up.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("sender went silent after {received} bytes without closing the stream")]
    Idle { received: i32 },
    #[error("reply encoding failed: {0}")]
    Packet(#[from] PacketError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Receive one stream over `transport` and return its bytes.
///
/// `first` is a datagram already read by the caller (see
/// [`crate::transport::UdpTransport::accept`]).  The session ends on
/// FINACK, or after `idle` of silence once the FIN has been sent.
pub async fn serve<T: Transport>(
    transport: &T,
    first: Option<Vec<u8>>,
    idle: Duration,
) -> Result<Vec<u8>, ReceiveError> {
    let mut receiver = Receiver::new();
    let mut pending = first;

    loop {
        let datagram = match pending.take() {
            Some(datagram) => datagram,
            None => match transport.recv(idle).await {
                Ok(Some(datagram)) => datagram,
                Ok(None) if receiver.fin_sent() => {
                    log::info!("[recv] no FINACK after FIN; closing");
                    break;
                }
                Ok(None) => {
                    return Err(ReceiveError::Idle {
                        received: receiver.expected(),
                    })
                }
                Err(e) if peer_gone(&e) => {
                    if receiver.fin_sent() {
                        log::info!("[recv] sender gone after FIN; closing");
                        break;
                    }
                    log::debug!("[recv] sender unreachable, still waiting: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            },
        };

        let packet = match Packet::decode(&datagram) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("[recv] ignoring malformed datagram: {e}");
                continue;
            }
        };
        for reply in receiver.on_packet(packet) {
            match transport.send(&reply.encode()?).await {
                Ok(()) => {}
                Err(e) if peer_gone(&e) => log::debug!("[recv] reply not delivered: {e}"),
                Err(e) => return Err(e.into()),
            }
        }
        if receiver.is_closed() {
            break;
        }
    }

    log::info!("[recv] stream complete: {} bytes", receiver.data().len());
    Ok(receiver.into_data())
}

/// A connected UDP socket reports a closed peer port as a refused
/// connection on the next call.
fn peer_gone(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionRefused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: i32, bytes: &[u8]) -> Packet {
        Packet::new(seq, bytes.to_vec())
    }

    #[test]
    fn in_order_segments_are_acked_cumulatively() {
        let mut r = Receiver::new();
        assert_eq!(r.on_packet(data(0, b"abc")), vec![Packet::ack(3)]);
        assert_eq!(r.on_packet(data(3, b"de")), vec![Packet::ack(5)]);
        assert_eq!(r.data(), b"abcde");
    }

    #[test]
    fn gap_produces_duplicate_acks_then_fills() {
        let mut r = Receiver::new();
        r.on_packet(data(0, b"aa"));
        assert_eq!(r.on_packet(data(4, b"cc")), vec![Packet::ack(2)]);
        assert_eq!(r.on_packet(data(6, b"dd")), vec![Packet::ack(2)]);
        assert_eq!(r.on_packet(data(2, b"bb")), vec![Packet::ack(8)]);
        assert_eq!(r.data(), b"aabbccdd");
    }

    #[test]
    fn duplicates_are_discarded() {
        let mut r = Receiver::new();
        r.on_packet(data(0, b"xy"));
        assert_eq!(r.on_packet(data(0, b"xy")), vec![Packet::ack(2)]);
        assert_eq!(r.data(), b"xy");
    }

    #[test]
    fn end_marker_at_expected_replies_ack_and_fin() {
        let mut r = Receiver::new();
        r.on_packet(data(0, b"abcd"));
        assert_eq!(r.on_packet(Packet::end_marker(2)), vec![Packet::ack(4)]);
        assert!(!r.fin_sent());

        let replies = r.on_packet(Packet::end_marker(4));
        assert_eq!(replies, vec![Packet::ack(4), Packet::fin(4)]);
        assert!(r.fin_sent());
        assert!(!r.is_closed());

        assert!(r.on_packet(Packet::finack()).is_empty());
        assert!(r.is_closed());
    }

    #[test]
    fn empty_stream_closes_immediately() {
        let mut r = Receiver::new();
        assert_eq!(r.on_packet(Packet::end_marker(0)).len(), 2);
        r.on_packet(Packet::finack());
        assert!(r.is_closed());
        assert!(r.into_data().is_empty());
    }

    /// Plays back a fixed sequence of receive outcomes and records replies.
    struct Scripted {
        inbound: parking_lot::Mutex<std::collections::VecDeque<io::Result<Option<Vec<u8>>>>>,
        replies: parking_lot::Mutex<Vec<Packet>>,
    }

    impl Scripted {
        fn new(inbound: Vec<io::Result<Option<Vec<u8>>>>) -> Self {
            Self {
                inbound: parking_lot::Mutex::new(inbound.into()),
                replies: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for Scripted {
        async fn send(&self, datagram: &[u8]) -> io::Result<()> {
            self.replies.lock().push(Packet::decode(datagram).unwrap());
            Ok(())
        }

        async fn recv(&self, _wait: Duration) -> io::Result<Option<Vec<u8>>> {
            self.inbound.lock().pop_front().unwrap_or(Ok(None))
        }
    }

    fn wire(packet: Packet) -> io::Result<Option<Vec<u8>>> {
        Ok(Some(packet.encode().unwrap()))
    }

    fn refused() -> io::Result<Option<Vec<u8>>> {
        Err(io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    #[tokio::test]
    async fn sender_closing_after_fin_ends_the_session() {
        // Repeated end markers: the sender has already left when the
        // later replies go out, and the next recv reports the closed port.
        let transport = Scripted::new(vec![
            wire(data(0, b"abc")),
            wire(Packet::end_marker(3)),
            wire(Packet::end_marker(3)),
            refused(),
            wire(Packet::finack()),
        ]);

        let received = serve(&transport, None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, b"abc");
        assert_eq!(transport.replies.lock().len(), 5);
    }

    #[tokio::test]
    async fn refused_port_before_fin_keeps_waiting() {
        let transport = Scripted::new(vec![
            refused(),
            wire(data(0, b"hi")),
            refused(),
            wire(Packet::end_marker(2)),
            wire(Packet::finack()),
        ]);

        let received = serve(&transport, None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, b"hi");
    }

    #[tokio::test]
    async fn other_transport_errors_are_fatal() {
        let transport = Scripted::new(vec![
            wire(data(0, b"x")),
            Err(io::Error::from(io::ErrorKind::PermissionDenied)),
        ]);

        let err = serve(&transport, None, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ReceiveError::Io(_)));
    }

    #[tokio::test]
    async fn silence_before_fin_is_an_error() {
        let transport = Scripted::new(vec![wire(data(0, b"abcd"))]);

        let err = serve(&transport, None, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ReceiveError::Idle { received: 4 }));
    }
}
