//! Process-wide registry of client sessions.
//!
//! One `SessionRegistry` is created at startup and owns, per client:
//! - the outbound message channel (the transport side of `send`)
//! - the display configuration
//! - the active processing task, tagged with a generation number
//!
//! It also holds the shared collaborators every task needs: the stream
//! manager, the alert dispatcher, the capture opener and the detector factory.
//!
//! Map locks are never held across an await.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::orchestrator::{self, ProcessingJob};
use super::protocol::{ClientCommand, ClientConfig, ServerMessage, STATUS_STARTED, STATUS_STOPPED};
use crate::alert::AlertDispatcher;
use crate::config::SentinelConfig;
use crate::detect::Detector;
use crate::error::{Result, SentinelError};
use crate::ingest::{
    is_upload, resolve_upload, CaptureOpener, FrameSource, StreamManager, StreamProtocol,
};

/// Outbound queue depth per client. A full queue suspends the sender.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Builds one detector per processing task. Called on the blocking pool.
pub type DetectorFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn Detector>> + Send + Sync>;

struct TaskHandle {
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    async fn cancel_and_wait(self, client_id: &str) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            log::error!(
                "SessionRegistry: task {} for client {} ended abnormally: {}",
                self.generation,
                client_id,
                err
            );
        }
    }
}

#[derive(Default)]
struct Sessions {
    clients: HashMap<String, mpsc::Sender<ServerMessage>>,
    configs: HashMap<String, ClientConfig>,
    tasks: HashMap<String, TaskHandle>,
}

pub struct SessionRegistry {
    config: SentinelConfig,
    streams: Arc<StreamManager>,
    alerts: Arc<Mutex<AlertDispatcher>>,
    opener: Arc<dyn CaptureOpener>,
    detector_factory: DetectorFactory,
    sessions: Mutex<Sessions>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    /// Fails with `SentinelError::Config` when `config` does not validate.
    pub fn new(
        config: SentinelConfig,
        streams: Arc<StreamManager>,
        opener: Arc<dyn CaptureOpener>,
        detector_factory: DetectorFactory,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SentinelError::Config(format!("{:#}", e)))?;
        let alerts = AlertDispatcher::new(config.alert_config());
        Ok(Self {
            config,
            streams,
            alerts: Arc::new(Mutex::new(alerts)),
            opener,
            detector_factory,
            sessions: Mutex::new(Sessions::default()),
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn alerts(&self) -> &Arc<Mutex<AlertDispatcher>> {
        &self.alerts
    }

    pub(crate) fn detector_factory(&self) -> DetectorFactory {
        self.detector_factory.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Client lifecycle
    // ------------------------------------------------------------------------

    /// Register a connected client and return the receiving end of its
    /// outbound queue. Re-attaching an id replaces the previous channel.
    pub fn attach(&self, client_id: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.lock().clients.insert(client_id.to_string(), tx);
        log::info!("SessionRegistry: client {} connected", client_id);
        rx
    }

    /// Client went away: cancel its task and drop its records.
    pub async fn detach(&self, client_id: &str) {
        let task = {
            let mut sessions = self.lock();
            sessions.clients.remove(client_id);
            sessions.configs.remove(client_id);
            sessions.tasks.remove(client_id)
        };
        if let Some(task) = task {
            task.cancel_and_wait(client_id).await;
        }
        log::info!("SessionRegistry: client {} disconnected", client_id);
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.lock()
            .clients
            .get(client_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn client_config(&self, client_id: &str) -> ClientConfig {
        self.lock().configs.get(client_id).cloned().unwrap_or_default()
    }

    pub fn has_config(&self, client_id: &str) -> bool {
        self.lock().configs.contains_key(client_id)
    }

    pub fn active_generation(&self, client_id: &str) -> Option<u64> {
        self.lock().tasks.get(client_id).map(|t| t.generation)
    }

    /// Deliver one message to a client.
    pub async fn send(&self, client_id: &str, message: ServerMessage) -> Result<()> {
        let tx = self.lock().clients.get(client_id).cloned();
        let Some(tx) = tx else {
            return Err(SentinelError::Delivery(client_id.to_string()));
        };
        tx.send(message)
            .await
            .map_err(|_| SentinelError::Delivery(client_id.to_string()))
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub async fn handle_command(self: &Arc<Self>, client_id: &str, command: ClientCommand) -> Result<()> {
        match command {
            ClientCommand::Ping { timestamp } => {
                self.send(client_id, ServerMessage::Pong { timestamp }).await
            }
            ClientCommand::UpdateConfig { config } => {
                self.lock()
                    .configs
                    .entry(client_id.to_string())
                    .or_default()
                    .apply(config);
                log::debug!("SessionRegistry: client {} config updated", client_id);
                Ok(())
            }
            ClientCommand::StartProcessing {
                video_id,
                file_path,
                stream_url,
            } => {
                self.start_processing(
                    client_id,
                    video_id.as_deref(),
                    file_path.as_deref(),
                    stream_url.as_deref(),
                )
                .await
            }
            ClientCommand::StopProcessing => self.stop_processing(client_id).await,
        }
    }

    /// Resolve and open the requested source, replace any running task, and
    /// start a new one. An unusable source is reported as an `error` message
    /// and leaves the current task untouched.
    pub async fn start_processing(
        self: &Arc<Self>,
        client_id: &str,
        video_id: Option<&str>,
        file_path: Option<&str>,
        stream_url: Option<&str>,
    ) -> Result<()> {
        let (source, temp_file) = match self.open_source(video_id, file_path, stream_url).await {
            Ok(opened) => opened,
            Err(err) => {
                log::warn!("SessionRegistry: client {} source rejected: {}", client_id, err);
                return self.send(client_id, ServerMessage::error(err.to_string())).await;
            }
        };
        let description = source.to_string();

        let previous = self.lock().tasks.remove(client_id);
        if let Some(previous) = previous {
            log::info!(
                "SessionRegistry: client {} replacing task {}",
                client_id,
                previous.generation
            );
            previous.cancel_and_wait(client_id).await;
        }

        self.send(
            client_id,
            ServerMessage::Status {
                message: STATUS_STARTED.to_string(),
                source: Some(description.clone()),
            },
        )
        .await?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let job = ProcessingJob {
            client_id: client_id.to_string(),
            generation,
            source,
            temp_file,
            cancel: cancel.clone(),
        };
        {
            let mut sessions = self.lock();
            let join = tokio::spawn(orchestrator::run(self.clone(), job));
            sessions.tasks.insert(
                client_id.to_string(),
                TaskHandle {
                    generation,
                    cancel,
                    join,
                },
            );
        }
        log::info!(
            "SessionRegistry: client {} task {} started on {}",
            client_id,
            generation,
            description
        );
        Ok(())
    }

    /// Explicit stop: cancel the task and end the client session's records.
    pub async fn stop_processing(&self, client_id: &str) -> Result<()> {
        let task = {
            let mut sessions = self.lock();
            sessions.configs.remove(client_id);
            sessions.tasks.remove(client_id)
        };
        if let Some(task) = task {
            task.cancel_and_wait(client_id).await;
        }
        self.send(client_id, ServerMessage::status(STATUS_STOPPED)).await
    }

    async fn open_source(
        &self,
        video_id: Option<&str>,
        file_path: Option<&str>,
        stream_url: Option<&str>,
    ) -> Result<(FrameSource, Option<PathBuf>)> {
        if let Some(video_id) = video_id.filter(|id| !id.trim().is_empty()) {
            let upload_dir = &self.config.processing.upload_dir;
            let path = resolve_upload(upload_dir, video_id, file_path)?;
            let source = FrameSource::open_file(self.opener.clone(), &path).await?;
            let temp_file = is_upload(upload_dir, &path).then_some(path);
            return Ok((source, temp_file));
        }
        if let Some(url) = stream_url.filter(|url| !url.trim().is_empty()) {
            if StreamProtocol::from_url(url).is_none() {
                return Err(SentinelError::InvalidInput(format!(
                    "unsupported stream URL {}, use rtmp://, rtmps:// or srt://",
                    url
                )));
            }
            let source = FrameSource::attach_stream(&self.streams, url)?;
            return Ok((source, None));
        }
        Err(SentinelError::InvalidInput(
            "no video source specified".to_string(),
        ))
    }

    /// Called by a task on termination. Drops the task and config records
    /// only when `generation` is still the client's active task.
    pub(crate) fn finish_task(&self, client_id: &str, generation: u64) -> bool {
        let mut sessions = self.lock();
        let current = sessions.tasks.get(client_id).map(|t| t.generation);
        if current != Some(generation) {
            return false;
        }
        sessions.tasks.remove(client_id);
        sessions.configs.remove(client_id);
        true
    }

    /// Cancel every task and stop every stream.
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, TaskHandle)> = self.lock().tasks.drain().collect();
        for (client_id, task) in tasks {
            task.cancel_and_wait(&client_id).await;
        }
        self.streams.shutdown().await;
    }
}
