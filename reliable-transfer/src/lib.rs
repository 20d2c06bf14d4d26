//! `reliable-transfer`: reliable, in-order bulk transfer over an
//! unreliable datagram channel.
//!
//! # Architecture
//!
//! ```text
//!  byte stream
//!       │
//!  ┌────▼──────┐  chunks   ┌──────────────────────────────────────────┐
//!  │ Segmenter │──────────▶│ Engine: stop-and-wait | fixed window |   │
//!  └───────────┘           │         reno (congestion state + 2 tasks)│
//!                          └────┬───────────────────────▲─────────────┘
//!                    datagrams  │                       │ acks
//!                          ┌────▼───────────────────────┴─────┐
//!                          │ Transport (UDP or simulator link)│
//!                          └────┬─────────────────────────────┘
//!                               │ end marker / FIN / FINACK
//!                          ┌────▼──────┐      ┌─────────┐
//!                          │ Handshake │─────▶│ Metrics │
//!                          └───────────┘      └─────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]:          wire format (serialise / deserialise)
//! - [`segment`]:         byte stream to offset-addressed chunks
//! - [`config`]:          per-discipline tunables
//! - [`transport`]:       datagram channel trait + tokio UDP socket
//! - [`stop_and_wait`]:   one packet in flight
//! - [`sliding_window`]:  fixed window, go-back-N on timeout
//! - [`congestion`]:      Reno congestion state machine
//! - [`reno`]:            congestion-controlled engine (two tasks)
//! - [`handshake`]:       end marker / FIN / FINACK close
//! - [`metrics`]:         delay sampling, throughput, score
//! - [`sender`]:          engine entry point and error taxonomy
//! - [`receiver`]:        reference receiving endpoint
//! - [`simulator`]:       in-process lossy link for testing

pub mod config;
pub mod congestion;
pub mod handshake;
pub mod metrics;
pub mod packet;
pub mod receiver;
pub mod reno;
pub mod segment;
pub mod sender;
pub mod simulator;
pub mod sliding_window;
pub mod stop_and_wait;
pub mod transport;

pub use config::{Discipline, TransferConfig};
pub use sender::{send_stream, send_to, TransferError, TransferReport};
