use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use rtp_playout::cli;
use rtp_playout::config::Config;
use rtp_playout::health::{self, StreamMetrics};
use rtp_playout::rtp::{JitterBuffer, Playout, RtpClock, RtpReceiver};

/// Playout frames queued between the receiver and the consumer
const PLAYOUT_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    if args.help {
        cli::print_help();
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtp_playout=info".parse()?),
        )
        .init();

    info!("rtp-playout v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.rtp_port = port;
    }
    info!("Configuration loaded");
    info!("  RTP address: {}", config.rtp_bind_address());
    info!(
        "  Jitter buffer: target {} ms, {} slots",
        config.jitter_target_ms, config.jitter_capacity
    );
    info!(
        "  Clock rate: {} Hz, playout every {} ms",
        config.clock_rate, config.playout_interval_ms
    );

    // Handle --validate mode
    if args.validate {
        info!("Validating configuration...");
        match config.validate() {
            Ok(()) => {
                info!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let buffer = Arc::new(JitterBuffer::new(
        config.jitter_config(),
        RtpClock::new(config.clock_rate),
    ));
    let metrics = Arc::new(StreamMetrics::new());
    let cancel_token = CancellationToken::new();

    // Start health check server if configured
    if let Some(port) = config.health_port {
        tokio::spawn(health::run_health_server(
            port,
            metrics.clone(),
            buffer.clone(),
            cancel_token.clone(),
        ));
    }

    let receiver = RtpReceiver::bind(
        &config.rtp_bind_address(),
        buffer.clone(),
        metrics.clone(),
        config.receiver_config(),
    )
    .await?;
    info!("Receiving RTP on UDP port {}", receiver.local_port()?);

    let (tx, rx) = mpsc::channel(PLAYOUT_QUEUE);
    let consumer = tokio::spawn(consume_playout(rx));

    let shutdown = cancel_token.clone();
    let duration = args.duration_secs.map(Duration::from_secs);
    tokio::spawn(async move {
        wait_for_shutdown(duration).await;
        shutdown.cancel();
    });

    receiver.run(tx, cancel_token.clone()).await?;
    cancel_token.cancel();

    let (played, silence) = consumer.await.context("Playout consumer failed")?;
    let counters = metrics.snapshot();
    let stats = buffer.stats();
    info!(
        "Stream finished: {} received, {} decode errors, {} played, {} silence frames",
        counters.packets_received, counters.decode_errors, played, silence
    );
    info!(
        "Jitter buffer: {} expected, {} overrun drops, {} late drops, {} duplicates, jitter {:.2} ms (max {:.2} ms)",
        stats.expected_packets,
        stats.overrun_drops,
        stats.late_drops,
        stats.duplicates,
        stats.jitter_ms,
        stats.max_jitter_ms
    );

    Ok(())
}

/// Wait for Ctrl-C, or for `duration` to elapse if set
async fn wait_for_shutdown(duration: Option<Duration>) {
    let sleep = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Received Ctrl-C, shutting down...");
        }
        _ = sleep => {
            info!("Run duration elapsed, shutting down...");
        }
    }
}

/// Stand-in for the decoder and render path: counts what the playout loop
/// hands over. Returns (packets, silence frames).
async fn consume_playout(mut rx: mpsc::Receiver<Playout>) -> (u64, u64) {
    let mut played = 0u64;
    let mut silence = 0u64;

    while let Some(item) = rx.recv().await {
        match item {
            Playout::Packet(packet) => {
                played += 1;
                if played % 500 == 0 {
                    debug!(
                        "Played {} packets (seq={}, {} bytes)",
                        played,
                        packet.sequence,
                        packet.payload.len()
                    );
                }
            }
            Playout::Silence => silence += 1,
        }
    }

    (played, silence)
}
