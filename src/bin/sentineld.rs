//! sentineld - PPE Sentinel processing daemon
//!
//! Serves one client over stdin/stdout:
//! 1. Reads JSON control commands (`ping`, `update_config`,
//!    `start_processing`, `stop_processing`), one per line, from stdin
//! 2. Runs the live processing loop for the requested upload or stream
//! 3. Writes every outbound message (`frame`, `alert`, `stats`, `status`,
//!    `error`, `pong`) as one JSON line on stdout
//!
//! Live streams named with `--stream` are connected at startup and kept
//! alive (with reconnection) until shutdown. Logs go to stderr.
//!
//! Stdin is read on its own thread so a pending read never holds up
//! runtime shutdown after Ctrl-C.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ppe_sentinel::detect::StubBackend;
use ppe_sentinel::ingest::default_opener;
use ppe_sentinel::session::DetectorFactory;
use ppe_sentinel::{
    ClientCommand, Detector, SentinelConfig, ServerMessage, SessionRegistry, StreamManager,
    StreamProtocol,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "PPE Sentinel live processing daemon (JSON lines over stdio)"
)]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "SENTINEL_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Client id used for the stdio session.
    #[arg(long, default_value = "stdio")]
    client_id: String,

    /// Live stream to connect at startup (rtmp://, rtmps:// or srt://). Repeatable.
    #[arg(long = "stream", value_name = "URL")]
    streams: Vec<String>,

    /// Detector backend (auto|stub|tract)
    #[arg(long, default_value = "auto", value_name = "BACKEND")]
    detector: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = SentinelConfig::load_from(args.config.as_deref())?;
    log::info!(
        "sentineld {} starting (target {} fps, inference every {} frames)",
        env!("CARGO_PKG_VERSION"),
        config.processing.target_fps,
        config.processing.inference_interval
    );

    let opener = default_opener();
    let streams = Arc::new(StreamManager::new(opener.clone(), config.stream.clone()));
    for url in &args.streams {
        let protocol = StreamProtocol::from_url(url)
            .ok_or_else(|| anyhow!("unsupported stream URL {}", url))?;
        let id = streams.connect(url, protocol.as_str())?;
        log::info!("stream {} connecting as session {}", url, id);
    }

    let factory = detector_factory(&args.detector, &config)?;
    let registry = Arc::new(SessionRegistry::new(config, streams, opener, factory)?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || signal.cancel()).context("error setting Ctrl-C handler")?;

    let mut outbound = registry.attach(&args.client_id);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outbound.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(err) => {
                    log::error!("failed to serialize {} message: {}", message.kind(), err);
                    continue;
                }
            };
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() || stdout.flush().await.is_err() {
                log::warn!("stdout closed, dropping outbound messages");
                break;
            }
        }
    });

    let mut lines = spawn_line_reader(std::io::BufReader::new(std::io::stdin()))?;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("shutdown signal received");
                break;
            }
            line = lines.recv() => match line {
                Some(Ok(line)) => handle_line(&registry, &args.client_id, &line).await,
                None => {
                    log::info!("stdin closed");
                    break;
                }
                Some(Err(err)) => {
                    log::error!("failed to read command: {}", err);
                    break;
                }
            },
        }
    }

    registry.detach(&args.client_id).await;
    registry.shutdown().await;
    let _ = writer.await;
    log::info!("sentineld stopped");
    Ok(())
}

/// Forward lines from `reader` over a channel, read on a detached thread.
/// The channel closes at end of input or after the first read error.
fn spawn_line_reader<R>(reader: R) -> Result<mpsc::Receiver<std::io::Result<String>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("sentineld-stdin".to_string())
        .spawn(move || {
            for line in reader.lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
        })
        .context("spawn stdin reader thread")?;
    Ok(rx)
}

async fn handle_line(registry: &Arc<SessionRegistry>, client_id: &str, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let command: ClientCommand = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(err) => {
            log::warn!("rejected command: {}", err);
            let _ = registry
                .send(client_id, ServerMessage::error(format!("invalid command: {}", err)))
                .await;
            return;
        }
    };
    if let Err(err) = registry.handle_command(client_id, command).await {
        log::warn!("command failed: {}", err);
    }
}

fn detector_factory(backend: &str, config: &SentinelConfig) -> Result<DetectorFactory> {
    let model_path = config.detector.model_path.clone();
    let use_tract = match backend {
        "stub" => false,
        "tract" => true,
        "auto" => cfg!(feature = "backend-tract") && model_path.exists(),
        other => return Err(anyhow!("unknown detector backend '{}'", other)),
    };

    if !use_tract {
        log::warn!("using stub detector: no detections will be produced");
        return Ok(Arc::new(|| -> Result<Box<dyn Detector>> {
            Ok(Box::new(StubBackend::new()))
        }));
    }

    #[cfg(feature = "backend-tract")]
    {
        let threshold = config.detector.confidence_threshold;
        let (width, height) = config.processing.resize_to;
        log::info!("using tract detector with model {}", model_path.display());
        Ok(Arc::new(move || -> Result<Box<dyn Detector>> {
            let backend = ppe_sentinel::detect::TractBackend::new(&model_path, width, height)?
                .with_threshold(threshold);
            Ok(Box::new(backend))
        }))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(anyhow!("the tract detector requires the backend-tract feature"))
    }
}
