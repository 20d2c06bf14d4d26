//! Engine entry point.
//!
//! [`send_stream`] validates the configuration, segments the stream, runs
//! the selected engine to full acknowledgment, performs the shared close
//! handshake and returns a [`TransferReport`].  Failure is all-or-nothing:
//! an exhausted retry budget yields [`TransferError`], never partial
//! metrics.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::{ConfigError, Discipline, TransferConfig};
use crate::congestion::Phase;
use crate::handshake::{close_session, HandshakeOutcome};
use crate::metrics::{MetricsAccumulator, TransferMetrics, TransferStats};
use crate::packet::PacketError;
use crate::segment::{Chunk, Segmenter};
use crate::transport::{Transport, UdpTransport};
use crate::{reno, sliding_window, stop_and_wait};

/// Mutable per-transfer state shared by the single-task engines.
#[derive(Debug)]
pub(crate) struct TransferSession {
    pub(crate) metrics: MetricsAccumulator,
    pub(crate) stats: TransferStats,
}

impl TransferSession {
    fn new(metrics: MetricsAccumulator) -> Self {
        Self {
            metrics,
            stats: TransferStats::default(),
        }
    }
}

/// Why a transfer produced no result.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("stream of {0} bytes does not fit a signed 32-bit offset space")]
    StreamTooLarge(usize),
    #[error("retry budget of {budget} exhausted at seq {seq}")]
    RetryBudgetExhausted { seq: i32, budget: u32 },
    #[error("final ack not received within {waited:?} (acknowledged up to {acked})")]
    DrainTimeout { waited: Duration, acked: i32 },
    #[error("packet encoding failed: {0}")]
    Packet(#[from] PacketError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("acknowledgment task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Outcome of a successful transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub metrics: TransferMetrics,
    pub stats: TransferStats,
    pub handshake: HandshakeOutcome,
    /// Congestion phase at the end of the bulk transfer (Reno only).
    pub final_phase: Option<Phase>,
}

/// Transfer `data` over `transport` using `config.discipline`.
pub async fn send_stream<T: Transport + 'static>(
    transport: Arc<T>,
    data: &[u8],
    config: &TransferConfig,
) -> Result<TransferReport, TransferError> {
    config.validate()?;
    let segmenter = Segmenter::new(data, config.max_segment_size)
        .ok_or(TransferError::StreamTooLarge(data.len()))?;
    let final_seq = segmenter.final_seq();
    let chunks: Vec<Chunk> = segmenter.collect();
    log::info!(
        "starting {} transfer: {} bytes in {} chunks of <= {} bytes",
        config.discipline,
        data.len(),
        chunks.len(),
        config.max_segment_size
    );

    let metrics = MetricsAccumulator::start(data.len() as u64);
    let (metrics, stats, final_phase) = match config.discipline {
        Discipline::StopAndWait => {
            let mut session = TransferSession::new(metrics);
            stop_and_wait::run(&*transport, &chunks, config, &mut session).await?;
            (session.metrics, session.stats, None)
        }
        Discipline::FixedWindow { window } => {
            let mut session = TransferSession::new(metrics);
            sliding_window::run(&*transport, &chunks, window, config, &mut session).await?;
            (session.metrics, session.stats, None)
        }
        Discipline::CongestionControlled => {
            let outcome =
                reno::run(Arc::clone(&transport), &chunks, final_seq, config, metrics).await?;
            let phase = outcome.congestion.phase();
            (outcome.metrics, outcome.stats, Some(phase))
        }
    };
    log::info!(
        "all {} bytes acknowledged ({} packets sent, {} retransmissions, {} timeouts)",
        data.len(),
        stats.packets_sent,
        stats.retransmissions,
        stats.timeouts
    );

    let handshake = close_session(&*transport, final_seq, config).await;
    let report = TransferReport {
        metrics: metrics.finish(Instant::now()),
        stats,
        handshake,
        final_phase,
    };
    log::info!(
        "throughput {:.2} B/s, avg delay {:.6} s, score {:.4}",
        report.metrics.throughput,
        report.metrics.avg_delay,
        report.metrics.score
    );
    Ok(report)
}

/// Transfer `data` to `peer` over a fresh UDP socket.
pub async fn send_to(
    peer: SocketAddr,
    data: &[u8],
    config: &TransferConfig,
) -> Result<TransferReport, TransferError> {
    let transport = UdpTransport::connect(peer).await?;
    log::debug!("[udp] {} -> {peer}", transport.local_addr);
    send_stream(Arc::new(transport), data, config).await
}
