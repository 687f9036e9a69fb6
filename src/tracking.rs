//! Video playback tracking.
//!
//! Parses `url,start,end` payloads and stores one `VideoTracking` row per
//! playback through a `CommandExecutor`.

use crate::db::{Command, CommandExecutor, DatabaseBackend, Row, Value};
use crate::error::{Result, TrackerError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

/// Inserts one playback record.
pub const INSERT_TRACKING_SQL: &str = "INSERT INTO VideoTracking (VideoTrackingId, Url, StartDateTime, EndDateTime, PlayTimeInSeconds) VALUES (:id, :url, :start, :end, :playSeconds)";

const SELECT_RECENT_SQL: &str = "SELECT VideoTrackingId, Url, StartDateTime, EndDateTime, PlayTimeInSeconds FROM VideoTracking ORDER BY StartDateTime DESC, VideoTrackingId LIMIT :limit";

const CREATE_TABLE_SQLITE: &str = "CREATE TABLE IF NOT EXISTS VideoTracking (
    VideoTrackingId TEXT PRIMARY KEY NOT NULL,
    Url TEXT NOT NULL,
    StartDateTime DATETIME NOT NULL,
    EndDateTime DATETIME NOT NULL,
    PlayTimeInSeconds INTEGER NOT NULL
)";

const CREATE_TABLE_POSTGRES: &str = "CREATE TABLE IF NOT EXISTS VideoTracking (
    VideoTrackingId UUID PRIMARY KEY,
    Url TEXT NOT NULL,
    StartDateTime TIMESTAMP NOT NULL,
    EndDateTime TIMESTAMP NOT NULL,
    PlayTimeInSeconds INTEGER NOT NULL
)";

/// Timestamp layouts accepted in payloads, tried in order after RFC 3339.
const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// One playback reported by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingEvent {
    pub url: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TrackingEvent {
    /// Parses a `url,start,end` payload.
    ///
    /// Fields are split from the right, so the URL itself may contain commas.
    pub fn parse(payload: &str) -> Result<Self> {
        let mut fields = payload.trim().rsplitn(3, ',');
        let (Some(end), Some(start), Some(url)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(TrackerError::payload(format!(
                "Expected 'url,start,end' but got '{}'",
                payload.trim()
            )));
        };

        let url = url.trim();
        if url.is_empty() {
            return Err(TrackerError::payload("URL is empty"));
        }

        let start = parse_timestamp("start", start)?;
        let end = parse_timestamp("end", end)?;
        if end < start {
            return Err(TrackerError::payload(format!(
                "End time {end} is before start time {start}"
            )));
        }

        Ok(Self {
            url: url.to_string(),
            start,
            end,
        })
    }

    /// Elapsed play time in whole seconds, rounded down.
    pub fn play_time_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    fn insert_command(&self, id: Uuid) -> Command {
        Command::new(INSERT_TRACKING_SQL)
            .with_param(":id", id)
            .with_param(":url", self.url.as_str())
            .with_param(":start", self.start)
            .with_param(":end", self.end)
            .with_param(":playSeconds", self.play_time_seconds())
    }
}

impl FromStr for TrackingEvent {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A stored playback record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedPlayback {
    pub id: String,
    pub url: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub play_time_seconds: i64,
}

impl TrackedPlayback {
    fn from_row(row: &Row) -> Result<Self> {
        let id = column(row, "VideoTrackingId")?.to_display_string();
        let url = column(row, "Url")?.to_display_string();
        let start = timestamp_column(row, "StartDateTime")?;
        let end = timestamp_column(row, "EndDateTime")?;
        let play_time_seconds = column(row, "PlayTimeInSeconds")?
            .as_i64()
            .ok_or_else(|| TrackerError::internal("PlayTimeInSeconds is not an integer"))?;

        Ok(Self {
            id,
            url,
            start,
            end,
            play_time_seconds,
        })
    }
}

/// Creates the `VideoTracking` table if it does not exist.
pub async fn ensure_schema(executor: &mut CommandExecutor) -> Result<()> {
    let ddl = match executor.backend() {
        DatabaseBackend::Postgres => CREATE_TABLE_POSTGRES,
        DatabaseBackend::Sqlite => CREATE_TABLE_SQLITE,
    };
    executor.execute(Command::new(ddl)).await?;
    info!("VideoTracking table is ready");
    Ok(())
}

/// Inserts one playback row under a freshly generated identifier.
pub async fn record_event(executor: &mut CommandExecutor, event: &TrackingEvent) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let affected = executor.execute(event.insert_command(id)).await?;
    if affected != 1 {
        warn!("Insert for {} affected {} rows", id, affected);
    }

    info!(
        "Recorded {}s of playback for {} as {}",
        event.play_time_seconds(),
        event.url,
        id
    );
    Ok(id)
}

/// Parses a payload and records it with a dedicated executor.
///
/// Uses `target` when given, otherwise the configured `ConnString`. The
/// executor is closed on every path; a close failure never hides the insert
/// error.
pub async fn record(target: Option<&str>, payload: &str) -> Result<Uuid> {
    let event = TrackingEvent::parse(payload)?;

    let mut executor = match target {
        Some(target) => CommandExecutor::with_connection_string(target)?,
        None => CommandExecutor::new()?,
    };

    let outcome = record_event(&mut executor, &event).await;
    executor.close_with(outcome).await
}

/// Returns the most recent playbacks, newest first.
pub async fn recent_events(
    executor: &mut CommandExecutor,
    limit: u32,
) -> Result<Vec<TrackedPlayback>> {
    let table = executor
        .execute_data_table(
            Command::new(SELECT_RECENT_SQL).with_param("limit", i64::from(limit)),
        )
        .await?;

    table.rows.iter().map(TrackedPlayback::from_row).collect()
}

fn parse_timestamp(field: &str, raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();

    if let Ok(zoned) = DateTime::parse_from_rfc3339(raw) {
        return Ok(zoned.naive_utc());
    }

    DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .map(|date| date.and_time(NaiveTime::MIN))
        })
        .ok_or_else(|| TrackerError::payload(format!("Invalid {field} time '{raw}'")))
}

fn column<'r>(row: &'r Row, name: &str) -> Result<&'r Value> {
    row.get(name)
        .ok_or_else(|| TrackerError::internal(format!("Column {name} missing from result")))
}

fn timestamp_column(row: &Row, name: &str) -> Result<NaiveDateTime> {
    match column(row, name)? {
        Value::Timestamp(ts) => Ok(*ts),
        Value::String(text) => parse_timestamp(name, text)
            .map_err(|_| TrackerError::internal(format!("Column {name} holds '{text}'"))),
        other => Err(TrackerError::internal(format!(
            "Column {name} is not a timestamp: {other}"
        ))),
    }
}
