//! stream_probe - Connect to one live stream and report its health.
//!
//! Registers the URL with a `StreamManager`, then logs every status
//! transition and the number of fresh frames seen per second until the
//! probe duration elapses or Ctrl-C is pressed. The session is always
//! disconnected cleanly before exit.
//!
//! `--synthetic` swaps the real decoder for generated frames, which is
//! handy for exercising the reconnect path without a media server.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ppe_sentinel::ingest::{default_opener, CaptureOpener, SyntheticConfig, SyntheticOpener};
use ppe_sentinel::{SentinelConfig, StreamManager, StreamProtocol, StreamStatus};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a live rtmp/rtmps/srt stream")]
struct Args {
    /// Stream URL (rtmp://, rtmps:// or srt://)
    #[arg(long)]
    url: String,

    /// Protocol override; inferred from the URL scheme when omitted.
    #[arg(long)]
    protocol: Option<String>,

    /// Probe duration in seconds (0 runs until Ctrl-C).
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Use generated frames instead of decoding the stream.
    #[arg(long)]
    synthetic: bool,

    /// With --synthetic, fail this many connection attempts first.
    #[arg(long, default_value_t = 0)]
    fail_first: u32,

    /// Reconnect delay override in milliseconds.
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut settings = SentinelConfig::load()?.stream;
    if let Some(ms) = args.reconnect_delay_ms {
        settings.reconnect_delay = Duration::from_millis(ms);
    }

    let opener: Arc<dyn CaptureOpener> = if args.synthetic {
        Arc::new(SyntheticOpener::new(SyntheticConfig::default()).failing_first(args.fail_first))
    } else {
        default_opener()
    };
    let protocol = match &args.protocol {
        Some(protocol) => protocol.parse::<StreamProtocol>()?,
        None => StreamProtocol::from_url(&args.url)
            .ok_or_else(|| anyhow!("cannot infer protocol from {}", args.url))?,
    };

    let manager = StreamManager::new(opener, settings);
    let id = manager.connect(&args.url, protocol.as_str())?;
    println!("stream_probe: session {} for {} ({})", id, args.url, protocol);

    let mut status = manager
        .watch_status(&id)
        .ok_or_else(|| anyhow!("session {} vanished", id))?;
    let mut frames = manager
        .subscribe(&id)
        .ok_or_else(|| anyhow!("session {} vanished", id))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || signal.cancel()).context("error setting Ctrl-C handler")?;

    let deadline = (args.seconds > 0).then(|| Instant::now() + Duration::from_secs(args.seconds));
    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    let mut window_start = Instant::now();
    let mut window_frames = 0u64;
    let mut total_frames = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *status.borrow_and_update();
                println!(
                    "stream_probe: {} (reconnect_count={})",
                    state.status.as_str(),
                    state.reconnect_count
                );
                if state.status == StreamStatus::Failed {
                    break;
                }
            }
            _ = ticker.tick() => {
                if frames.try_fresh().is_some() {
                    window_frames += 1;
                    total_frames += 1;
                }
                if window_start.elapsed() >= Duration::from_secs(1) {
                    if let Some(frame) = manager.latest_frame(&id) {
                        println!(
                            "stream_probe: {} fresh frames/s, latest {}x{}",
                            window_frames, frame.width, frame.height
                        );
                    }
                    window_start = Instant::now();
                    window_frames = 0;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
            }
        }
    }

    let final_state = manager.status(&id);
    manager.disconnect(&id).await?;
    match final_state {
        Some(state) => println!(
            "stream_probe: done, {} fresh frames, final status {}",
            total_frames,
            state.status.as_str()
        ),
        None => println!("stream_probe: done, {} fresh frames", total_frames),
    }
    Ok(())
}
