use std::sync::Arc;
use std::time::{Duration, Instant};

use ppe_sentinel::ingest::{StreamState, SyntheticConfig, SyntheticOpener};
use ppe_sentinel::{SentinelError, StreamManager, StreamSettings, StreamStatus};

const URL: &str = "rtmp://media.local/live/cam1";
const WAIT: Duration = Duration::from_secs(10);

fn settings(max_reconnect_attempts: Option<u32>) -> StreamSettings {
    StreamSettings {
        reconnect_delay: Duration::from_millis(10),
        disconnect_grace: Duration::from_secs(2),
        liveness_poll: Duration::from_millis(10),
        max_reconnect_attempts,
    }
}

fn capture(frame_limit: Option<u64>) -> SyntheticConfig {
    SyntheticConfig {
        width: 32,
        height: 24,
        target_fps: 200,
        frame_limit,
    }
}

fn manager(opener: SyntheticOpener, max_reconnect_attempts: Option<u32>) -> StreamManager {
    StreamManager::new(Arc::new(opener), settings(max_reconnect_attempts))
}

async fn wait_for_state<F>(manager: &StreamManager, id: &str, accept: F) -> StreamState
where
    F: Fn(&StreamState) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let state = manager.status(id).expect("session exists");
        if accept(&state) {
            return state;
        }
        assert!(Instant::now() < deadline, "timed out, last state {:?}", state);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn connect_returns_before_network_and_becomes_active() {
    let manager = manager(SyntheticOpener::new(capture(None)), None);
    let id = manager.connect(URL, "rtmp").unwrap();
    assert_eq!(id.len(), 8);
    assert_eq!(manager.find_by_url(URL).as_deref(), Some(id.as_str()));

    let state = wait_for_state(&manager, &id, |s| s.status == StreamStatus::Active).await;
    assert_eq!(state.reconnect_count, 0);
    let frame = manager.latest_frame(&id).expect("primed frame");
    assert_eq!((frame.width, frame.height), (32, 24));

    let sessions = manager.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].url, URL);

    manager.disconnect(&id).await.unwrap();
    assert!(manager.is_empty());
}

#[tokio::test]
async fn failed_attempts_count_up_then_reset_on_success() {
    let manager = manager(SyntheticOpener::new(capture(None)).failing_first(3), None);
    let id = manager.connect(URL, "rtmp").unwrap();
    let mut status = manager.watch_status(&id).unwrap();

    let mut highest = 0;
    let deadline = Instant::now() + WAIT;
    loop {
        let state = *status.borrow_and_update();
        highest = highest.max(state.reconnect_count);
        if state.status == StreamStatus::Active {
            assert_eq!(state.reconnect_count, 0);
            break;
        }
        assert_ne!(state.status, StreamStatus::Failed);
        assert!(Instant::now() < deadline, "never connected");
        let _ = tokio::time::timeout(Duration::from_millis(50), status.changed()).await;
    }
    assert!(highest >= 1, "failures were counted");

    manager.disconnect(&id).await.unwrap();
}

#[tokio::test]
async fn gives_up_after_attempt_cap() {
    let manager = manager(SyntheticOpener::new(capture(None)).failing_first(100), Some(3));
    let id = manager.connect(URL, "rtmp").unwrap();

    let state = wait_for_state(&manager, &id, |s| s.status == StreamStatus::Failed).await;
    assert_eq!(state.reconnect_count, 3);
    assert!(manager.latest_frame(&id).is_none());

    manager.disconnect(&id).await.unwrap();
}

#[tokio::test]
async fn reader_loss_triggers_reconnect() {
    // Each connection yields five frames and then ends, so more than five
    // fresh frames means the session reconnected on its own.
    let manager = manager(SyntheticOpener::new(capture(Some(5))), None);
    let id = manager.connect(URL, "rtmp").unwrap();
    let mut frames = manager.subscribe(&id).unwrap();

    let mut fresh = 0;
    let deadline = Instant::now() + WAIT;
    while fresh <= 5 {
        if frames.try_fresh().is_some() {
            fresh += 1;
        }
        assert!(Instant::now() < deadline, "no reconnect observed");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_ne!(manager.status(&id).map(|s| s.status), Some(StreamStatus::Failed));

    manager.disconnect(&id).await.unwrap();
}

#[tokio::test]
async fn invalid_urls_are_rejected_synchronously() {
    let manager = manager(SyntheticOpener::new(capture(None)), None);

    for (url, protocol) in [
        ("http://media.local/live", "rtmp"),
        ("rtmp://media.local/live", "srt"),
        ("rtmp://media.local/live", "rtsp"),
    ] {
        let err = manager.connect(url, protocol).unwrap_err();
        assert!(matches!(err, SentinelError::InvalidInput(_)), "{url} as {protocol}");
    }
    assert!(manager.is_empty());
}

#[tokio::test]
async fn disconnect_unknown_session_is_not_found() {
    let manager = manager(SyntheticOpener::new(capture(None)), None);
    let err = manager.disconnect("deadbeef").await.unwrap_err();
    assert!(matches!(err, SentinelError::NotFound(_)));
}

#[tokio::test]
async fn subscription_closes_after_disconnect() {
    let manager = manager(SyntheticOpener::new(capture(None)), None);
    let id = manager.connect(URL, "rtmp").unwrap();
    let mut frames = manager.subscribe(&id).unwrap();
    wait_for_state(&manager, &id, |s| s.status == StreamStatus::Active).await;

    let deadline = Instant::now() + WAIT;
    while frames.try_fresh().is_none() {
        assert!(Instant::now() < deadline, "no fresh frame");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    manager.disconnect(&id).await.unwrap();
    assert!(manager.status(&id).is_none());
    assert!(frames.is_closed());
    assert!(frames.try_fresh().is_none());
}

#[tokio::test]
async fn shutdown_stops_every_session() {
    let manager = manager(SyntheticOpener::new(capture(None)), None);
    let first = manager.connect(URL, "rtmp").unwrap();
    let second = manager
        .connect("srt://media.local:8890?streamid=read:cam2", "srt")
        .unwrap();
    wait_for_state(&manager, &first, |s| s.status == StreamStatus::Active).await;
    wait_for_state(&manager, &second, |s| s.status == StreamStatus::Active).await;

    manager.shutdown().await;
    assert!(manager.is_empty());
}
