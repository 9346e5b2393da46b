/// Health check HTTP endpoint
/// Exposes receive-stream and jitter buffer state for monitoring systems
/// (/health as JSON, /ready for orchestrators, /metrics for Prometheus)

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::rtp::jitter::{BufferState, JitterBuffer, JitterBufferStats};

/// Timeout for reading HTTP request (prevents slow-loris attacks)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters kept by the receive and playout loops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamCounters {
    pub packets_received: u64,
    pub decode_errors: u64,
    pub packets_played: u64,
    /// Playout ticks with nothing to play after playout started
    pub underruns: u64,
    pub ssrc_changes: u64,
    /// Frames dropped because the consumer fell behind
    pub sink_overflows: u64,
}

/// Shared stream metrics, updated lock-free from the RTP tasks
#[derive(Debug, Default)]
pub struct StreamMetrics {
    packets_received: AtomicU64,
    decode_errors: AtomicU64,
    packets_played: AtomicU64,
    underruns: AtomicU64,
    ssrc_changes: AtomicU64,
    sink_overflows: AtomicU64,
    /// Latched once the buffer first starts playout
    ever_ready: AtomicBool,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_played(&self) {
        self.packets_played.fetch_add(1, Ordering::Relaxed);
        self.ever_ready.store(true, Ordering::Relaxed);
    }

    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ssrc_change(&self) {
        self.ssrc_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_overflow(&self) {
        self.sink_overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether playout has ever started on this stream
    pub fn ever_ready(&self) -> bool {
        self.ever_ready.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StreamCounters {
        StreamCounters {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            packets_played: self.packets_played.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            ssrc_changes: self.ssrc_changes.load(Ordering::Relaxed),
            sink_overflows: self.sink_overflows.load(Ordering::Relaxed),
        }
    }

    /// Combined view served by /health and /metrics
    pub fn status(&self, buffer: &JitterBuffer) -> HealthStatus {
        let state = buffer.state();
        HealthStatus {
            status: "healthy",
            ready: self.ever_ready() || state == BufferState::Ready,
            state,
            stream: self.snapshot(),
            buffer: buffer.stats(),
        }
    }
}

/// Health status of the service
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    /// Playout has started at least once
    pub ready: bool,
    pub state: BufferState,
    pub stream: StreamCounters,
    pub buffer: JitterBufferStats,
}

/// Run the health check HTTP server
pub async fn run_health_server(
    port: u16,
    metrics: Arc<StreamMetrics>,
    buffer: Arc<JitterBuffer>,
    cancel_token: CancellationToken,
) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind health check server on port {}: {}", port, e);
            return;
        }
    };

    info!("Health check server listening on http://0.0.0.0:{}/health", port);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((mut socket, peer_addr)) => {
                        let metrics = metrics.clone();
                        let buffer = buffer.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(&mut socket, &metrics, &buffer).await {
                                debug!("Error handling request from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Health check server shutting down");
                break;
            }
        }
    }
}

async fn handle_request(
    socket: &mut tokio::net::TcpStream,
    metrics: &StreamMetrics,
    buffer: &JitterBuffer,
) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];

    let n = match timeout(REQUEST_TIMEOUT, socket.read(&mut buf)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!("Request timeout after {:?}", REQUEST_TIMEOUT);
            return Ok(());
        }
    };

    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);

    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = match path {
        "/health" | "/healthz" | "/health/" => build_health_response(&metrics.status(buffer)),
        // Ready once playout has started; stays ready through underruns
        "/ready" | "/readyz" | "/ready/" => build_ready_response(metrics.status(buffer).ready),
        "/metrics" => build_metrics_response(&metrics.status(buffer)),
        _ => build_not_found_response(),
    };

    socket.write_all(response.as_bytes()).await?;
    socket.flush().await?;

    Ok(())
}

fn build_health_response(status: &HealthStatus) -> String {
    let body = serde_json::to_string(status).unwrap_or_else(|e| {
        warn!("Failed to serialize health status: {}", e);
        r#"{"status":"error"}"#.to_string()
    });

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn build_ready_response(ready: bool) -> String {
    let (status_code, status_text, body) = if ready {
        (200, "OK", r#"{"ready":true}"#)
    } else {
        (503, "Service Unavailable", r#"{"ready":false}"#)
    };

    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_code,
        status_text,
        body.len(),
        body
    )
}

fn build_metrics_response(status: &HealthStatus) -> String {
    let stream = &status.stream;
    let buffer = &status.buffer;
    // Prometheus-compatible metrics format
    let body = format!(
        "# HELP rtp_playout_packets_received_total RTP packets accepted from the network\n\
         # TYPE rtp_playout_packets_received_total counter\n\
         rtp_playout_packets_received_total {}\n\
         # HELP rtp_playout_decode_errors_total Datagrams that were not valid RTP\n\
         # TYPE rtp_playout_decode_errors_total counter\n\
         rtp_playout_decode_errors_total {}\n\
         # HELP rtp_playout_packets_played_total Packets handed to the playout sink\n\
         # TYPE rtp_playout_packets_played_total counter\n\
         rtp_playout_packets_played_total {}\n\
         # HELP rtp_playout_underruns_total Playout ticks with an empty buffer\n\
         # TYPE rtp_playout_underruns_total counter\n\
         rtp_playout_underruns_total {}\n\
         # HELP rtp_playout_ssrc_changes_total Stream restarts caused by a new SSRC\n\
         # TYPE rtp_playout_ssrc_changes_total counter\n\
         rtp_playout_ssrc_changes_total {}\n\
         # HELP rtp_playout_dropped_packets_total Packets dropped by the jitter buffer\n\
         # TYPE rtp_playout_dropped_packets_total counter\n\
         rtp_playout_dropped_packets_total{{reason=\"overrun\"}} {}\n\
         rtp_playout_dropped_packets_total{{reason=\"late\"}} {}\n\
         rtp_playout_dropped_packets_total{{reason=\"duplicate\"}} {}\n\
         # HELP rtp_playout_silence_resets_total Buffer restarts at talk spurt boundaries\n\
         # TYPE rtp_playout_silence_resets_total counter\n\
         rtp_playout_silence_resets_total {}\n\
         # HELP rtp_playout_resyncs_total Buffer restarts after a sequence discontinuity\n\
         # TYPE rtp_playout_resyncs_total counter\n\
         rtp_playout_resyncs_total {}\n\
         # HELP rtp_playout_expected_packets Packets expected from the sequence range\n\
         # TYPE rtp_playout_expected_packets gauge\n\
         rtp_playout_expected_packets {}\n\
         # HELP rtp_playout_buffered_ms Media currently buffered\n\
         # TYPE rtp_playout_buffered_ms gauge\n\
         rtp_playout_buffered_ms {}\n\
         # HELP rtp_playout_jitter_ms Interarrival jitter estimate\n\
         # TYPE rtp_playout_jitter_ms gauge\n\
         rtp_playout_jitter_ms {:.3}\n\
         rtp_playout_max_jitter_ms {:.3}\n\
         # HELP rtp_playout_ready Whether playout has started (1) or not (0)\n\
         # TYPE rtp_playout_ready gauge\n\
         rtp_playout_ready {}\n",
        stream.packets_received,
        stream.decode_errors,
        stream.packets_played,
        stream.underruns,
        stream.ssrc_changes,
        buffer.overrun_drops,
        buffer.late_drops,
        buffer.duplicates,
        buffer.silence_resets,
        buffer.resyncs,
        buffer.expected_packets,
        buffer.buffered_ms,
        buffer.jitter_ms,
        buffer.max_jitter_ms,
        if status.ready { 1 } else { 0 }
    );

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn build_not_found_response() -> String {
    let body = r#"{"error":"Not Found"}"#;
    format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}
