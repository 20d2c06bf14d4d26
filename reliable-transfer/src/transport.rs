//! Datagram transport abstraction.
//!
//! Engines talk to the network only through [`Transport`]: an unreliable,
//! unordered send plus a receive bounded by a caller-chosen wait.  The
//! production implementation is [`UdpTransport`], a thin wrapper around
//! `tokio::net::UdpSocket` connected to a fixed peer;
//! [`crate::simulator`] provides an in-process, fault-injecting one.
//!
//! All methods take `&self` so one transport can be shared (through `Arc`)
//! between the Reno engine's sender and acknowledgment tasks.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::packet::PACKET_SIZE;

/// Unreliable datagram channel to one peer.
pub trait Transport: Send + Sync {
    /// Hand one datagram to the channel.  Success says nothing about
    /// delivery.
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait at most `wait` for the next datagram.
    ///
    /// Returns `Ok(None)` when the wait expires with nothing received.
    fn recv(&self, wait: Duration) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// A UDP socket connected to a single peer.
#[derive(Debug)]
pub struct UdpTransport {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    /// Fixed remote endpoint.
    pub peer: SocketAddr,
    inner: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral port and direct all traffic at `peer`.
    pub async fn connect(peer: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        Self::bind_to(local, peer).await
    }

    /// Bind `local` and direct all traffic at `peer`.
    pub async fn bind_to(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local).await?;
        inner.connect(peer).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            peer,
            inner,
        })
    }

    /// Bind `local`, wait for the first datagram, and lock onto its sender.
    ///
    /// Returns the transport together with that first datagram so the caller
    /// can process it.
    pub async fn accept(local: SocketAddr) -> io::Result<(Self, Vec<u8>)> {
        let inner = UdpSocket::bind(local).await?;
        let local_addr = inner.local_addr()?;
        log::info!("[udp] listening on {local_addr}");

        let mut buf = vec![0u8; PACKET_SIZE];
        let (n, peer) = inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        inner.connect(peer).await?;
        log::info!("[udp] accepted peer {peer}");
        Ok((
            Self {
                local_addr,
                peer,
                inner,
            },
            buf,
        ))
    }
}

impl Transport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.inner.send(datagram).await?;
        Ok(())
    }

    async fn recv(&self, wait: Duration) -> io::Result<Option<Vec<u8>>> {
        // One spare byte so an oversize datagram is visible as such.
        let mut buf = vec![0u8; PACKET_SIZE + 1];
        match tokio::time::timeout(wait, self.inner.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_send_recv() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();

        let t = UdpTransport::bind_to("127.0.0.1:0".parse().unwrap(), a_addr)
            .await
            .unwrap();
        t.send(b"\x00\x00\x00\x01hi").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = a.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x00\x00\x00\x01hi");
        assert_eq!(from, t.local_addr);

        a.send_to(b"\x00\x00\x00\x05", from).await.unwrap();
        let got = t.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"\x00\x00\x00\x05"[..]));
    }

    #[tokio::test]
    async fn recv_times_out_with_none() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let t = UdpTransport::bind_to("127.0.0.1:0".parse().unwrap(), a.local_addr().unwrap())
            .await
            .unwrap();
        let got = t.recv(Duration::from_millis(20)).await.unwrap();
        assert_eq!(got, None);
    }
}
