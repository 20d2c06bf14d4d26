//! Wire-format definitions for data packets and acknowledgments.
//!
//! Every datagram exchanged between sender and receiver is a [`Packet`]: a
//! signed sequence id followed by raw payload bytes.  This module is
//! responsible for:
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`].
//! - Extracting the cumulative acknowledgment id from a reply datagram.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              Sequence / Ack Id (i32, big-endian)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Payload (0..=1020 bytes) ...                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! There is no checksum: integrity is left to the datagram layer.
//!
//! Payload conventions agreed with the receiver:
//! - empty payload from the sender: end of stream at the enclosed id,
//! - [`FIN_PAYLOAD`] from the receiver: termination signal,
//! - [`FINACK_PAYLOAD`] from the sender: final close of the session.

use thiserror::Error;

/// Total datagram capacity, header included.
pub const PACKET_SIZE: usize = 1024;

/// Byte length of the sequence id header.
pub const HEADER_LEN: usize = 4;

/// Largest payload that fits in one datagram.
pub const MAX_PAYLOAD: usize = PACKET_SIZE - HEADER_LEN;

/// Payload the receiver uses to signal that it has seen the end marker.
pub const FIN_PAYLOAD: &[u8] = b"fin";

/// Payload of the last packet the sender emits.
pub const FINACK_PAYLOAD: &[u8] = b"==FINACK==";

/// A complete protocol datagram: sequence id + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Byte offset of the first payload byte (or the ack id for replies).
    pub seq: i32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a data packet.
    pub fn new(seq: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            payload: payload.into(),
        }
    }

    /// Zero-payload packet marking the end of the stream at `final_seq`.
    pub fn end_marker(final_seq: i32) -> Self {
        Self::new(final_seq, Vec::new())
    }

    /// Cumulative acknowledgment for everything below `ack`.
    pub fn ack(ack: i32) -> Self {
        Self::new(ack, Vec::new())
    }

    /// Termination signal sent by the receiver.
    pub fn fin(seq: i32) -> Self {
        Self::new(seq, FIN_PAYLOAD)
    }

    /// Final handshake packet sent by the sender.
    pub fn finack() -> Self {
        Self::new(0, FINACK_PAYLOAD)
    }

    pub fn is_end_marker(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_fin(&self) -> bool {
        self.payload == FIN_PAYLOAD
    }

    pub fn is_finack(&self) -> bool {
        self.payload == FINACK_PAYLOAD
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// Fails when the payload would push the datagram past [`PACKET_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if `buf` is shorter than [`HEADER_LEN`] or longer than
    /// [`PACKET_SIZE`].
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let seq = read_id(buf).ok_or(PacketError::BufferTooShort(buf.len()))?;
        if buf.len() > PACKET_SIZE {
            return Err(PacketError::PayloadTooLarge(buf.len() - HEADER_LEN));
        }
        Ok(Self {
            seq,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Read the cumulative ack id carried by a reply datagram.
///
/// Only the leading four bytes are inspected; anything after them is
/// ignored.  A datagram too short to hold an id yields `None`, which callers
/// treat as a no-op.
pub fn decode_ack(buf: &[u8]) -> Option<i32> {
    read_id(buf)
}

fn read_id(buf: &[u8]) -> Option<i32> {
    let head: [u8; HEADER_LEN] = buf.get(..HEADER_LEN)?.try_into().ok()?;
    Some(i32::from_be_bytes(head))
}

/// Errors that can arise when encoding or parsing a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {0} bytes is too short to contain a sequence id")]
    BufferTooShort(usize),
    #[error("payload of {0} bytes exceeds the 1020-byte limit")]
    PayloadTooLarge(usize),
}
