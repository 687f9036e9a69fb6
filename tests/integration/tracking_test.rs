//! Playback tracking integration tests.
//!
//! Records payloads into a SQLite database file and reads them back.

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use video_tracking::db::{Command, CommandExecutor};
use video_tracking::tracking::{self, TrackingEvent};

const PAYLOAD: &str = "http://example.com/v.mp4,2024-01-01T10:00:00,2024-01-01T10:02:30";

fn sqlite_target(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("tracking.db").display())
}

/// Helper to create the tracking table and return a ready executor.
async fn schema_executor(dir: &TempDir) -> CommandExecutor {
    let mut executor = CommandExecutor::with_connection_string(sqlite_target(dir)).unwrap();
    tracking::ensure_schema(&mut executor).await.unwrap();
    executor
}

async fn tracked_rows(executor: &mut CommandExecutor) -> i64 {
    executor
        .execute_scalar(Command::new("SELECT COUNT(*) FROM VideoTracking"))
        .await
        .unwrap()
        .and_then(|v| v.as_i64())
        .unwrap()
}

#[tokio::test]
async fn test_record_stores_play_time() {
    let dir = tempfile::tempdir().unwrap();
    schema_executor(&dir).await.close().await.unwrap();

    let id = tracking::record(Some(&sqlite_target(&dir)), PAYLOAD)
        .await
        .unwrap();

    let mut executor = CommandExecutor::with_connection_string(sqlite_target(&dir)).unwrap();
    let events = tracking::recent_events(&mut executor, 10).await.unwrap();
    executor.close().await.unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, id.to_string());
    assert_eq!(events[0].url, "http://example.com/v.mp4");
    assert_eq!(events[0].play_time_seconds, 150);
    assert_eq!(
        events[0].start.format("%Y-%m-%d %H:%M:%S").to_string(),
        "2024-01-01 10:00:00"
    );
}

#[tokio::test]
async fn test_record_twice_gives_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    schema_executor(&dir).await.close().await.unwrap();
    let target = sqlite_target(&dir);

    let first = tracking::record(Some(&target), PAYLOAD).await.unwrap();
    let second = tracking::record(Some(&target), PAYLOAD).await.unwrap();
    assert_ne!(first, second);

    let mut executor = CommandExecutor::with_connection_string(target).unwrap();
    assert_eq!(tracked_rows(&mut executor).await, 2);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_malformed_payload_inserts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    schema_executor(&dir).await.close().await.unwrap();
    let target = sqlite_target(&dir);

    let err = tracking::record(
        Some(&target),
        "http://example.com/v.mp4,not-a-time,2024-01-01T10:02:30",
    )
    .await
    .unwrap_err();
    assert_eq!(err.category(), "Payload Error");

    let mut executor = CommandExecutor::with_connection_string(target).unwrap();
    assert_eq!(tracked_rows(&mut executor).await, 0);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_record_without_table_reports_command_error() {
    let dir = tempfile::tempdir().unwrap();

    let err = tracking::record(Some(&sqlite_target(&dir)), PAYLOAD)
        .await
        .unwrap_err();

    assert_eq!(err.category(), "Command Error");
    assert!(err.to_string().contains("VideoTracking"));
}

#[tokio::test]
async fn test_rolled_back_events_are_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = schema_executor(&dir).await;
    let event = TrackingEvent::parse(PAYLOAD).unwrap();

    executor.begin_transaction().await.unwrap();
    tracking::record_event(&mut executor, &event).await.unwrap();
    tracking::record_event(&mut executor, &event).await.unwrap();
    executor.rollback().await.unwrap();

    assert_eq!(tracked_rows(&mut executor).await, 0);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_ensure_schema_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = schema_executor(&dir).await;

    tracking::ensure_schema(&mut executor).await.unwrap();
    assert_eq!(tracked_rows(&mut executor).await, 0);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_recent_events_newest_first_with_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = schema_executor(&dir).await;

    for payload in [
        "http://example.com/a.mp4,2024-01-01T08:00:00,2024-01-01T08:00:10",
        "http://example.com/b.mp4,2024-01-03T08:00:00,2024-01-03T08:01:00",
        "http://example.com/c.mp4,2024-01-02T08:00:00,2024-01-02T08:00:05",
    ] {
        let event = TrackingEvent::parse(payload).unwrap();
        tracking::record_event(&mut executor, &event).await.unwrap();
    }

    let events = tracking::recent_events(&mut executor, 2).await.unwrap();
    executor.close().await.unwrap();

    let urls: Vec<&str> = events.iter().map(|e| e.url.as_str()).collect();
    assert_eq!(
        urls,
        vec!["http://example.com/b.mp4", "http://example.com/c.mp4"]
    );
    assert_eq!(events[0].play_time_seconds, 60);
}
