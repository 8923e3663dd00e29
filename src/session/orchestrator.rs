//! Per-client processing loop.
//!
//! One task per client: fetch a frame, downscale it, run inference every Nth
//! frame (stabilize, extract violations, dispatch alerts), then annotate and
//! deliver every frame, paced to the target frame rate.
//!
//! Whatever ends the loop (end of file, failure, stop, replacement, client
//! disconnect), cleanup always runs: the frame source is released, the
//! task's records are dropped, an uploaded input file is deleted and the
//! client is told processing finished.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::protocol::{FramePayload, ServerMessage, STATUS_FINISHED};
use super::registry::SessionRegistry;
use crate::annotate;
use crate::detect::{classes, Detection, DetectionStats, Detector};
use crate::error::{Result, SentinelError};
use crate::frame::Frame;
use crate::ingest::{FrameFetch, FrameSource};
use crate::track::DetectionStabilizer;

/// Everything a processing task owns.
pub(crate) struct ProcessingJob {
    pub client_id: String,
    pub generation: u64,
    pub source: FrameSource,
    /// Uploaded input, deleted on termination.
    pub temp_file: Option<PathBuf>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
enum Exit {
    Finished,
    Cancelled,
    Disconnected,
    Failed(SentinelError),
}

struct ProcessingLoop {
    registry: Arc<SessionRegistry>,
    client_id: String,
    generation: u64,
    source: FrameSource,
    detector: Option<Box<dyn Detector>>,
    stabilizer: DetectionStabilizer,
    frame_count: u64,
    last_detections: Vec<Detection>,
    last_stats: Option<DetectionStats>,
}

pub(crate) async fn run(registry: Arc<SessionRegistry>, job: ProcessingJob) {
    let ProcessingJob {
        client_id,
        generation,
        source,
        temp_file,
        cancel,
    } = job;

    let stabilizer = DetectionStabilizer::new(registry.config().stabilizer);
    let mut task = ProcessingLoop {
        registry: registry.clone(),
        client_id: client_id.clone(),
        generation,
        source,
        detector: None,
        stabilizer,
        frame_count: 0,
        last_detections: Vec::new(),
        last_stats: None,
    };

    let exit = tokio::select! {
        biased;
        _ = cancel.cancelled() => Exit::Cancelled,
        exit = task.start_and_run() => exit,
    };

    task.cleanup(exit, temp_file).await;
}

impl ProcessingLoop {
    async fn start_and_run(&mut self) -> Exit {
        match self.load_detector().await {
            Ok(detector) => self.detector = Some(detector),
            Err(err) => return Exit::Failed(err),
        }
        self.run_loop().await
    }

    async fn load_detector(&mut self) -> Result<Box<dyn Detector>> {
        let factory = self.registry.detector_factory();
        let loaded = tokio::task::spawn_blocking(move || {
            let mut detector = factory()?;
            detector.warm_up()?;
            Ok::<_, anyhow::Error>(detector)
        })
        .await
        .map_err(|e| SentinelError::Inference(format!("detector load task failed: {}", e)))?;
        let detector =
            loaded.map_err(|e| SentinelError::Inference(format!("cannot load detector: {:#}", e)))?;
        log::info!(
            "Orchestrator: client {} task {} using detector {}",
            self.client_id,
            self.generation,
            detector.name()
        );
        Ok(detector)
    }

    async fn run_loop(&mut self) -> Exit {
        let processing = self.registry.config().processing.clone();
        let frame_interval = Duration::from_secs_f64(1.0 / processing.target_fps as f64);
        let inference_interval = u64::from(processing.inference_interval);

        loop {
            let started = Instant::now();
            if !self.registry.is_connected(&self.client_id) {
                return Exit::Disconnected;
            }

            let frame = match self.source.fetch().await {
                Ok(FrameFetch::Frame(frame)) => frame,
                Ok(FrameFetch::Pending) => {
                    tokio::time::sleep(processing.stream_wait).await;
                    continue;
                }
                Ok(FrameFetch::Finished) => return Exit::Finished,
                Err(err) => return Exit::Failed(err),
            };
            self.frame_count += 1;

            let frame = if frame.is_oversized(processing.max_frame_width, processing.max_frame_height) {
                let target = processing.resize_to;
                let (max_w, max_h) = (processing.max_frame_width, processing.max_frame_height);
                match blocking(move || frame.downscale(max_w, max_h, target)).await {
                    Ok(frame) => frame,
                    Err(err) => return Exit::Failed(err),
                }
            } else {
                frame
            };

            if self.frame_count % inference_interval == 0 {
                match self.infer(frame.clone()).await {
                    Ok(()) => {}
                    Err(SentinelError::Delivery(_)) => return Exit::Disconnected,
                    Err(err) => return Exit::Failed(err),
                }
            }

            match self.deliver_frame(frame, processing.jpeg_quality).await {
                Ok(()) => {}
                Err(SentinelError::Delivery(_)) => return Exit::Disconnected,
                Err(err) => return Exit::Failed(err),
            }

            let elapsed = started.elapsed();
            if let Some(stats) = self.last_stats.as_mut() {
                let secs = elapsed.as_secs_f64();
                stats.fps = Some(if secs > 0.0 {
                    1.0 / secs
                } else {
                    processing.target_fps as f64
                });
                let message = ServerMessage::Stats { data: stats.clone() };
                if self.registry.send(&self.client_id, message).await.is_err() {
                    return Exit::Disconnected;
                }
            }

            tokio::time::sleep(frame_interval.saturating_sub(started.elapsed())).await;
        }
    }

    /// Detect, stabilize, dispatch alerts, and push alerts plus stats.
    async fn infer(&mut self, frame: Frame) -> Result<()> {
        let Some(mut detector) = self.detector.take() else {
            return Err(SentinelError::Inference("detector not loaded".to_string()));
        };
        let (detector, output) = tokio::task::spawn_blocking(move || {
            let output = detector.detect(&frame);
            (detector, output)
        })
        .await
        .map_err(|e| SentinelError::Inference(format!("inference task failed: {}", e)))?;
        self.detector = Some(detector);
        let output = output.map_err(|e| SentinelError::Inference(format!("{:#}", e)))?;

        let stabilized = self.stabilizer.update(&output.detections);
        let violations = classes::violations(&stabilized);
        let mut stats = output.stats;
        stats.total_detections = stabilized.len();
        stats.violations_count = violations.len();

        let alerts = {
            let mut dispatcher = self
                .registry
                .alerts()
                .lock()
                .map_err(|_| SentinelError::Inference("alert dispatcher lock poisoned".to_string()))?;
            dispatcher.process_violations(&violations, Some(self.frame_count))
        };
        for alert in alerts {
            self.registry
                .send(&self.client_id, ServerMessage::Alert { data: alert })
                .await?;
        }

        self.registry
            .send(&self.client_id, ServerMessage::Stats { data: stats.clone() })
            .await?;
        self.last_stats = Some(stats);
        self.last_detections = stabilized;
        Ok(())
    }

    async fn deliver_frame(&mut self, frame: Frame, quality: u8) -> Result<()> {
        let config = self.registry.client_config(&self.client_id);
        let shown = annotate::visible_detections(&self.last_detections, config.selected_classes.as_ref());
        let show_boxes = config.show_boxes;
        let drawn = shown.clone();
        let encoded = match blocking(move || annotate::render(&frame, &drawn, show_boxes, quality)).await {
            Ok(encoded) => encoded,
            Err(err) => {
                log::warn!(
                    "Orchestrator: client {} skipped frame {}: {}",
                    self.client_id,
                    self.frame_count,
                    err
                );
                return Ok(());
            }
        };
        let payload = FramePayload {
            image: encoded.image,
            frame_number: self.frame_count,
            width: encoded.width,
            height: encoded.height,
            detections: shown,
        };
        self.registry
            .send(&self.client_id, ServerMessage::Frame { data: payload })
            .await
    }

    async fn cleanup(mut self, exit: Exit, temp_file: Option<PathBuf>) {
        self.source.release();
        let owned_records = self.registry.finish_task(&self.client_id, self.generation);

        if let Some(path) = temp_file {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => log::info!("Orchestrator: removed upload {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!(
                    "Orchestrator: failed to remove upload {}: {}",
                    path.display(),
                    err
                ),
            }
        }

        match &exit {
            Exit::Failed(err) => {
                log::error!(
                    "Orchestrator: client {} task {} failed: {}",
                    self.client_id,
                    self.generation,
                    err
                );
                let _ = self
                    .registry
                    .send(&self.client_id, ServerMessage::error(err.to_string()))
                    .await;
            }
            other => log::info!(
                "Orchestrator: client {} task {} ended ({:?}) after {} frames",
                self.client_id,
                self.generation,
                other,
                self.frame_count
            ),
        }
        if !matches!(exit, Exit::Disconnected) {
            let _ = self
                .registry
                .send(&self.client_id, ServerMessage::status(STATUS_FINISHED))
                .await;
        }
        log::debug!(
            "Orchestrator: client {} task {} cleanup done (records {})",
            self.client_id,
            self.generation,
            if owned_records { "dropped" } else { "kept for newer task" }
        );
    }
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SentinelError::Encode(format!("frame task failed: {}", e)))?
}
