use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::jitter::JitterBuffer;
use super::packet::RtpPacket;
use crate::health::StreamMetrics;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 2048;

/// One playout tick's worth of media
#[derive(Debug, Clone, PartialEq)]
pub enum Playout {
    Packet(RtpPacket),
    /// Buffer ran dry; the render path should insert a silence frame
    Silence,
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Clock rate to restore after a stream restart
    pub clock_rate: u32,
    /// Cadence of the playout loop
    pub playout_interval: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            clock_rate: super::clock::clock_rates::AUDIO_8KHZ,
            playout_interval: Duration::from_millis(20),
        }
    }
}

/// Receive stream: pushes decoded packets into the jitter buffer as they
/// arrive and drains it on a fixed cadence
pub struct RtpReceiver {
    socket: UdpSocket,
    buffer: Arc<JitterBuffer>,
    metrics: Arc<StreamMetrics>,
    config: ReceiverConfig,
    /// First SSRC seen; another one means the sender restarted
    locked_ssrc: Option<u32>,
}

impl RtpReceiver {
    /// Bind to `addr` (port 0 for auto-assign)
    pub async fn bind(
        addr: &str,
        buffer: Arc<JitterBuffer>,
        metrics: Arc<StreamMetrics>,
        config: ReceiverConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .context(format!("Failed to bind RTP socket on {}", addr))?;

        debug!("RTP receiver bound to {}", addr);
        Ok(Self::from_socket(socket, buffer, metrics, config))
    }

    /// Create from an already-bound socket
    pub fn from_socket(
        socket: UdpSocket,
        buffer: Arc<JitterBuffer>,
        metrics: Arc<StreamMetrics>,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            socket,
            buffer,
            metrics,
            config,
            locked_ssrc: None,
        }
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn buffer(&self) -> &Arc<JitterBuffer> {
        &self.buffer
    }

    /// Receive until cancelled, sending one [`Playout`] per tick to `sink`
    /// once the buffer has started playing.
    pub async fn run(mut self, sink: mpsc::Sender<Playout>, cancel_token: CancellationToken) -> Result<()> {
        let playout = tokio::spawn(run_playout(
            self.buffer.clone(),
            self.metrics.clone(),
            self.config.playout_interval,
            sink,
            cancel_token.clone(),
        ));

        self.receive_until_cancelled(cancel_token.clone()).await;
        cancel_token.cancel();
        playout.await.context("Playout task failed")?;
        Ok(())
    }

    async fn receive_until_cancelled(&mut self, cancel_token: CancellationToken) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut first_packet_logged = false;

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            if !first_packet_logged {
                                info!("First RTP packet received: {} bytes from {}", len, addr);
                                first_packet_logged = true;
                            }
                            self.process_datagram(&buf[..len]);
                        }
                        Err(e) => {
                            warn!("RTP receive error: {}", e);
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    debug!("RTP receive cancelled by shutdown signal");
                    break;
                }
            }
        }

        let stats = self.buffer.stats();
        info!(
            "RTP receive done: {} packets written, {} read, {} overrun drops, {} late drops",
            stats.packets_written, stats.packets_read, stats.overrun_drops, stats.late_drops
        );
    }

    /// Decode one datagram and hand it to the jitter buffer.
    /// Returns false if the datagram was dropped.
    fn process_datagram(&mut self, data: &[u8]) -> bool {
        let packet = match RtpPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.metrics.record_decode_error();
                debug!("Dropping undecodable datagram ({} bytes): {}", data.len(), e);
                return false;
            }
        };

        match self.locked_ssrc {
            None => {
                debug!("Locked onto SSRC {:#010x}", packet.ssrc);
                self.locked_ssrc = Some(packet.ssrc);
            }
            Some(ssrc) if ssrc != packet.ssrc => {
                info!(
                    "SSRC changed {:#010x} -> {:#010x}, restarting stream",
                    ssrc, packet.ssrc
                );
                self.buffer.reset();
                self.buffer.set_clock_rate(self.config.clock_rate);
                self.metrics.record_ssrc_change();
                self.locked_ssrc = Some(packet.ssrc);
            }
            Some(_) => {}
        }

        trace!("RTP seq={} ts={} len={}", packet.sequence, packet.timestamp, packet.payload.len());
        self.metrics.record_packet();
        self.buffer.write(packet);
        true
    }
}

/// Poll the buffer every `interval` and forward what it yields
pub async fn run_playout(
    buffer: Arc<JitterBuffer>,
    metrics: Arc<StreamMetrics>,
    interval: Duration,
    sink: mpsc::Sender<Playout>,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let item = match buffer.read(buffer.now_ms()) {
                    Some(packet) => {
                        metrics.record_played();
                        Playout::Packet(packet)
                    }
                    None if buffer.is_ready() => {
                        metrics.record_underrun();
                        Playout::Silence
                    }
                    // Still buffering
                    None => continue,
                };

                match sink.try_send(item) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        metrics.record_sink_overflow();
                        trace!("Playout sink full, frame dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Playout sink closed");
                        break;
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                debug!("Playout cancelled by shutdown signal");
                break;
            }
        }
    }
}
