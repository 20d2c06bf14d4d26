//! Splits an application byte stream into maximum-segment-sized chunks.
//!
//! Each [`Chunk`] is addressed by the byte offset of its first byte, so
//! sequence ids are assigned per byte and never reused within a session.
//! The offset one past the last byte is the *final sequence id* that every
//! engine places in its end-of-stream marker.

use crate::packet::{Packet, PacketError};

/// One contiguous slice of the stream, ready to be framed as a [`Packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of `data[0]` within the stream.
    pub seq: i32,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of this chunk; also the ack id that
    /// acknowledges it.
    pub fn end(&self) -> i32 {
        self.seq + self.data.len() as i32
    }

    /// Frame this chunk as a datagram.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        Packet::new(self.seq, self.data.clone()).encode()
    }
}

/// Restartable iterator over the chunks of a stream.
///
/// Cloning a `Segmenter` (or calling [`Segmenter::restart`]) yields the same
/// sequence again from the first chunk.
#[derive(Debug, Clone)]
pub struct Segmenter<'a> {
    data: &'a [u8],
    mss: usize,
    offset: usize,
}

impl<'a> Segmenter<'a> {
    /// Create a segmenter for `data` with maximum segment size `mss`.
    ///
    /// Returns `None` when `mss` is zero or the stream is too long to be
    /// addressed by a signed 32-bit byte offset.
    pub fn new(data: &'a [u8], mss: usize) -> Option<Self> {
        if mss == 0 || i32::try_from(data.len()).is_err() {
            return None;
        }
        Some(Self {
            data,
            mss,
            offset: 0,
        })
    }

    pub fn restart(&mut self) {
        self.offset = 0;
    }

    /// Number of chunks the whole stream splits into.
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(self.mss)
    }

    /// Offset one past the last byte of the stream.
    pub fn final_seq(&self) -> i32 {
        // Bounded by the check in `new`.
        self.data.len() as i32
    }
}

impl Iterator for Segmenter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.mss).min(self.data.len());
        let chunk = Chunk {
            seq: self.offset as i32,
            data: self.data[self.offset..end].to_vec(),
        };
        self.offset = end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.data.len() - self.offset.min(self.data.len())).div_ceil(self.mss);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Segmenter<'_> {}
