//! Live stream sessions (rtmp, rtmps, srt).
//!
//! `StreamManager` owns every live-stream session. Each session has:
//! - a maintenance thread that opens the source, primes it with one read,
//!   and reconnects with a fixed backoff whenever the reader dies
//! - once connected, a reader thread that decodes as fast as the source allows
//!   and overwrites the session's single latest-frame slot
//!
//! The scheduler side only ever sees the latest-frame slot and the status
//! record, published by the maintenance thread over a `watch` channel.
//! `connect` returns immediately; readiness is observed through `status`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{CaptureOpener, VideoCapture};
use crate::error::{Result, SentinelError};
use crate::frame::{Frame, FrameSubscription, LatestFrame};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_LIVENESS_POLL: Duration = Duration::from_millis(500);

const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    Rtmp,
    Rtmps,
    Srt,
}

impl StreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::Rtmp => "rtmp",
            StreamProtocol::Rtmps => "rtmps",
            StreamProtocol::Srt => "srt",
        }
    }

    pub fn scheme_prefix(&self) -> &'static str {
        match self {
            StreamProtocol::Rtmp => "rtmp://",
            StreamProtocol::Rtmps => "rtmps://",
            StreamProtocol::Srt => "srt://",
        }
    }

    /// Protocol implied by a URL's scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        [StreamProtocol::Rtmp, StreamProtocol::Rtmps, StreamProtocol::Srt]
            .into_iter()
            .find(|p| url.starts_with(p.scheme_prefix()))
    }
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamProtocol {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtmp" => Ok(StreamProtocol::Rtmp),
            "rtmps" => Ok(StreamProtocol::Rtmps),
            "srt" => Ok(StreamProtocol::Srt),
            other => Err(SentinelError::InvalidInput(format!(
                "unsupported stream protocol '{}', use rtmp, rtmps or srt",
                other
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Pending,
    Active,
    Reconnecting,
    Failed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Pending => "pending",
            StreamStatus::Active => "active",
            StreamStatus::Reconnecting => "reconnecting",
            StreamStatus::Failed => "failed",
        }
    }
}

/// Status record published by the maintenance thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StreamState {
    pub status: StreamStatus,
    /// Failed connection attempts since the last successful connection.
    pub reconnect_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub url: String,
    pub protocol: StreamProtocol,
    pub status: StreamStatus,
    pub reconnect_count: u32,
}

#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub reconnect_delay: Duration,
    pub disconnect_grace: Duration,
    pub liveness_poll: Duration,
    /// Give up after this many consecutive failed attempts. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            liveness_poll: DEFAULT_LIVENESS_POLL,
            max_reconnect_attempts: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Session record (shared with the background threads)
// ----------------------------------------------------------------------------

struct StreamSession {
    id: String,
    url: String,
    protocol: StreamProtocol,
    state: watch::Sender<StreamState>,
    frames: LatestFrame,
    stop: AtomicBool,
}

impl StreamSession {
    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn current(&self) -> StreamState {
        *self.state.borrow()
    }

    fn set_state(&self, status: StreamStatus, reconnect_count: u32) {
        let previous = self.state.send_replace(StreamState {
            status,
            reconnect_count,
        });
        if previous.status != status {
            log::info!(
                "StreamManager: session {} {} -> {}",
                self.id,
                previous.status.as_str(),
                status.as_str()
            );
        }
    }

    fn info(&self) -> StreamInfo {
        let state = self.current();
        StreamInfo {
            id: self.id.clone(),
            url: self.url.clone(),
            protocol: self.protocol,
            status: state.status,
            reconnect_count: state.reconnect_count,
        }
    }
}

struct SessionEntry {
    session: Arc<StreamSession>,
    maintenance: Option<JoinHandle<()>>,
}

// ----------------------------------------------------------------------------
// StreamManager
// ----------------------------------------------------------------------------

pub struct StreamManager {
    opener: Arc<dyn CaptureOpener>,
    settings: StreamSettings,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl StreamManager {
    pub fn new(opener: Arc<dyn CaptureOpener>, settings: StreamSettings) -> Self {
        Self {
            opener,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stream and start maintaining its connection.
    ///
    /// Returns the session id without waiting for the network.
    pub fn connect(&self, url: &str, protocol: &str) -> Result<String> {
        let protocol: StreamProtocol = protocol.parse()?;
        validate_url(url, protocol)?;

        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);

        let (state, _) = watch::channel(StreamState {
            status: StreamStatus::Pending,
            reconnect_count: 0,
        });
        let session = Arc::new(StreamSession {
            id: id.clone(),
            url: url.to_string(),
            protocol,
            state,
            frames: LatestFrame::new(),
            stop: AtomicBool::new(false),
        });

        let thread_session = session.clone();
        let opener = self.opener.clone();
        let settings = self.settings.clone();
        let maintenance = std::thread::Builder::new()
            .name(format!("stream-{}", id))
            .spawn(move || maintain(thread_session, opener, settings))
            .map_err(|e| {
                SentinelError::TransientIo(format!("spawn maintenance thread for {}: {}", url, e))
            })?;

        self.lock_sessions().insert(
            id.clone(),
            SessionEntry {
                session,
                maintenance: Some(maintenance),
            },
        );
        log::info!("StreamManager: session {} registered for {} ({})", id, url, protocol);
        Ok(id)
    }

    /// Stop a session, give its threads a grace period to release the
    /// capture, then drop the record.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let maintenance = {
            let mut sessions = self.lock_sessions();
            let entry = sessions
                .get_mut(id)
                .ok_or_else(|| SentinelError::NotFound(format!("stream session {}", id)))?;
            entry.session.stop.store(true, Ordering::SeqCst);
            entry.maintenance.take()
        };

        let released = wait_finished(maintenance.as_ref(), self.settings.disconnect_grace).await;
        self.lock_sessions().remove(id);
        finish_join(id, maintenance, released);
        log::info!("StreamManager: session {} disconnected", id);
        Ok(())
    }

    /// Disconnect every session. Used on process shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, Option<JoinHandle<()>>)> = {
            let mut sessions = self.lock_sessions();
            sessions
                .drain()
                .map(|(id, mut entry)| {
                    entry.session.stop.store(true, Ordering::SeqCst);
                    (id, entry.maintenance.take())
                })
                .collect()
        };
        if entries.is_empty() {
            return;
        }
        let deadline = tokio::time::Instant::now() + self.settings.disconnect_grace;
        for (id, maintenance) in entries {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let released = wait_finished(maintenance.as_ref(), remaining).await;
            finish_join(&id, maintenance, released);
        }
        log::info!("StreamManager: all sessions stopped");
    }

    pub fn status(&self, id: &str) -> Option<StreamState> {
        self.lock_sessions().get(id).map(|e| e.session.current())
    }

    /// Receiver for status transitions of one session.
    pub fn watch_status(&self, id: &str) -> Option<watch::Receiver<StreamState>> {
        self.lock_sessions().get(id).map(|e| e.session.state.subscribe())
    }

    pub fn latest_frame(&self, id: &str) -> Option<Frame> {
        self.lock_sessions().get(id).and_then(|e| e.session.frames.latest())
    }

    /// Subscription yielding each newly published frame once.
    pub fn subscribe(&self, id: &str) -> Option<FrameSubscription> {
        self.lock_sessions().get(id).map(|e| e.session.frames.subscribe())
    }

    pub fn find_by_url(&self, url: &str) -> Option<String> {
        let sessions = self.lock_sessions();
        let mut ids: Vec<&String> = sessions
            .values()
            .filter(|e| e.session.url == url)
            .map(|e| &e.session.id)
            .collect();
        ids.sort();
        ids.first().map(|id| (*id).clone())
    }

    pub fn sessions(&self) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = self.lock_sessions().values().map(|e| e.session.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_sessions().is_empty()
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        for entry in self.lock_sessions().values() {
            entry.session.stop.store(true, Ordering::SeqCst);
        }
    }
}

/// Accept only URLs carrying the protocol's scheme and a host. No network I/O.
pub fn validate_url(url: &str, protocol: StreamProtocol) -> Result<()> {
    let prefix = protocol.scheme_prefix();
    if !url.starts_with(prefix) {
        return Err(SentinelError::InvalidInput(format!(
            "{} URLs must start with {}",
            protocol, prefix
        )));
    }
    let parsed = url::Url::parse(url)
        .map_err(|e| SentinelError::InvalidInput(format!("invalid URL {}: {}", url, e)))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(SentinelError::InvalidInput(format!("URL {} has no host", url)));
    }
    Ok(())
}

async fn wait_finished(handle: Option<&JoinHandle<()>>, grace: Duration) -> bool {
    let Some(handle) = handle else {
        return true;
    };
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if handle.is_finished() {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL.min(deadline - now)).await;
    }
}

fn finish_join(id: &str, handle: Option<JoinHandle<()>>, released: bool) {
    let Some(handle) = handle else {
        return;
    };
    if !released {
        // Blocked in the decoder; it exits on its own after the read returns.
        log::warn!("StreamManager: session {} still releasing after grace period", id);
        return;
    }
    if handle.join().is_err() {
        log::error!("StreamManager: session {} maintenance thread panicked", id);
    }
}

// ----------------------------------------------------------------------------
// Background activities
// ----------------------------------------------------------------------------

fn maintain(session: Arc<StreamSession>, opener: Arc<dyn CaptureOpener>, settings: StreamSettings) {
    let mut reader: Option<JoinHandle<()>> = None;

    while !session.stop_requested() {
        let state = session.current();
        match state.status {
            StreamStatus::Active => {
                if reader.as_ref().is_some_and(|h| !h.is_finished()) {
                    sleep_unless_stopped(&session, settings.liveness_poll);
                    continue;
                }
                if let Some(handle) = reader.take() {
                    if handle.join().is_err() {
                        log::error!("StreamManager: session {} reader thread panicked", session.id);
                    }
                }
                log::warn!("StreamManager: session {} lost its reader, reconnecting", session.id);
                session.set_state(StreamStatus::Reconnecting, state.reconnect_count);
            }
            StreamStatus::Pending | StreamStatus::Reconnecting | StreamStatus::Failed => {
                let attempt = open_and_prime(opener.as_ref(), &session.url).and_then(|(capture, first)| {
                    session.frames.publish(first);
                    spawn_reader(session.clone(), capture)
                });
                match attempt {
                    Ok(handle) => {
                        reader = Some(handle);
                        session.set_state(StreamStatus::Active, 0);
                    }
                    Err(err) => {
                        let failures = state.reconnect_count.saturating_add(1);
                        log::warn!(
                            "StreamManager: session {} connect attempt {} failed: {:#}",
                            session.id,
                            failures,
                            err
                        );
                        if settings.max_reconnect_attempts.is_some_and(|max| failures >= max) {
                            log::error!(
                                "StreamManager: session {} giving up after {} attempts",
                                session.id,
                                failures
                            );
                            session.set_state(StreamStatus::Failed, failures);
                            break;
                        }
                        let status = match state.status {
                            StreamStatus::Pending => StreamStatus::Pending,
                            _ => StreamStatus::Reconnecting,
                        };
                        session.set_state(status, failures);
                        sleep_unless_stopped(&session, settings.reconnect_delay);
                    }
                }
            }
        }
    }

    if let Some(handle) = reader.take() {
        if handle.join().is_err() {
            log::error!("StreamManager: session {} reader thread panicked", session.id);
        }
    }
    log::debug!("StreamManager: session {} maintenance stopped", session.id);
}

fn open_and_prime(
    opener: &dyn CaptureOpener,
    url: &str,
) -> anyhow::Result<(Box<dyn VideoCapture>, Frame)> {
    let mut capture = opener.open(url)?;
    match capture.read() {
        Ok(Some(frame)) => Ok((capture, frame)),
        Ok(None) => {
            capture.release();
            anyhow::bail!("stream ended before the first frame")
        }
        Err(err) => {
            capture.release();
            Err(err.context("priming read"))
        }
    }
}

fn spawn_reader(
    session: Arc<StreamSession>,
    capture: Box<dyn VideoCapture>,
) -> anyhow::Result<JoinHandle<()>> {
    let name = format!("stream-{}-reader", session.id);
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || read_frames(session, capture))?;
    Ok(handle)
}

fn read_frames(session: Arc<StreamSession>, mut capture: Box<dyn VideoCapture>) {
    let mut frames_read: u64 = 0;
    while !session.stop_requested() {
        match capture.read() {
            Ok(Some(frame)) => {
                session.frames.publish(frame);
                frames_read += 1;
            }
            Ok(None) => {
                log::warn!("StreamManager: session {} source ended", session.id);
                break;
            }
            Err(err) => {
                log::warn!("StreamManager: session {} read failed: {:#}", session.id, err);
                break;
            }
        }
    }
    capture.release();
    log::debug!(
        "StreamManager: session {} reader exiting after {} frames",
        session.id,
        frames_read
    );
}

fn sleep_unless_stopped(session: &StreamSession, total: Duration) {
    let deadline = Instant::now() + total;
    while !session.stop_requested() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(STOP_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_must_match_protocol_scheme() {
        assert!(validate_url("rtmp://media.local/live/cam1", StreamProtocol::Rtmp).is_ok());
        assert!(validate_url("rtmps://media.local/live", StreamProtocol::Rtmps).is_ok());
        assert!(validate_url("srt://media.local:8890?streamid=read:cam1", StreamProtocol::Srt).is_ok());

        for (url, protocol) in [
            ("rtmps://media.local/live", StreamProtocol::Rtmp),
            ("http://media.local/live", StreamProtocol::Rtmp),
            ("rtmp://media.local/live", StreamProtocol::Srt),
            ("rtmp://", StreamProtocol::Rtmp),
        ] {
            let err = validate_url(url, protocol).unwrap_err();
            assert!(matches!(err, SentinelError::InvalidInput(_)), "{url}");
        }
    }

    #[test]
    fn protocol_parsing() {
        assert_eq!("RTMP".parse::<StreamProtocol>().unwrap(), StreamProtocol::Rtmp);
        assert_eq!("srt".parse::<StreamProtocol>().unwrap(), StreamProtocol::Srt);
        assert!("rtsp".parse::<StreamProtocol>().is_err());
        assert_eq!(
            StreamProtocol::from_url("rtmps://host/app"),
            Some(StreamProtocol::Rtmps)
        );
        assert_eq!(StreamProtocol::from_url("file.mp4"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&StreamState {
            status: StreamStatus::Reconnecting,
            reconnect_count: 2,
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"reconnecting","reconnect_count":2}"#);
    }
}
