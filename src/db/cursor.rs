//! Forward-only cursors over a live result.
//!
//! A cursor mutably borrows the executor that produced it, so no other
//! command can run on that connection until the cursor is dropped.

use super::executor::{map_sqlx_error, timeout_error};
use super::types::{DataTable, Row, Value};
use crate::error::{Result, TrackerError};
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;

/// Controls how much of the result a `RowCursor` yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderBehavior {
    /// Yield every row.
    #[default]
    Default,
    /// Yield at most one row.
    SingleRow,
}

/// A live, connection-bound iterator over result rows.
pub struct RowCursor<'c> {
    stream: BoxStream<'c, std::result::Result<Row, sqlx::Error>>,
    command: &'c str,
    timeout: Option<Duration>,
    behavior: ReaderBehavior,
    rows_read: usize,
    finished: bool,
}

impl<'c> RowCursor<'c> {
    pub(crate) fn new(
        stream: BoxStream<'c, std::result::Result<Row, sqlx::Error>>,
        command: &'c str,
        timeout: Option<Duration>,
        behavior: ReaderBehavior,
    ) -> Self {
        Self {
            stream,
            command,
            timeout,
            behavior,
            rows_read: 0,
            finished: false,
        }
    }

    /// Advances to the next row. Returns `None` once the result is exhausted.
    ///
    /// The command timeout applies to each wait for a row.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.finished {
            return Ok(None);
        }
        if self.behavior == ReaderBehavior::SingleRow && self.rows_read > 0 {
            self.finished = true;
            return Ok(None);
        }

        let item = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.stream.next())
                .await
                .map_err(|_| {
                    self.finished = true;
                    timeout_error(self.command, limit)
                })?,
            None => self.stream.next().await,
        };

        match item {
            Some(Ok(row)) => {
                self.rows_read += 1;
                Ok(Some(row))
            }
            Some(Err(e)) => {
                self.finished = true;
                Err(map_sqlx_error(e, self.command))
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// Buffers the remaining rows into a table.
    pub async fn into_table(mut self) -> Result<DataTable> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(DataTable::from_rows(rows))
    }

    /// Number of rows read so far.
    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    /// The SQL this cursor is reading.
    pub fn command(&self) -> &str {
        self.command
    }
}

/// A forward-only cursor over structured documents.
///
/// The first column of each row holds either a whole JSON document or one
/// chunk of a document split across rows.
pub struct DocumentCursor<'c> {
    rows: RowCursor<'c>,
}

impl<'c> DocumentCursor<'c> {
    pub(crate) fn new(rows: RowCursor<'c>) -> Self {
        Self { rows }
    }

    /// Reads the next row as one complete document.
    pub async fn next_document(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(row) = self.rows.next_row().await? else {
            return Ok(None);
        };
        let value = row.into_values().into_iter().next().unwrap_or_default();
        document_from_value(value, self.rows.command).map(Some)
    }

    /// Concatenates the remaining chunks into one text.
    pub async fn read_to_string(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(row) = self.rows.next_row().await? {
            if let Some(value) = row.into_values().into_iter().next() {
                push_chunk(&mut text, value, self.rows.command)?;
            }
        }
        Ok(text)
    }

    /// Concatenates the remaining chunks and parses them as a sequence of
    /// documents.
    pub async fn read_all(self) -> Result<Vec<serde_json::Value>> {
        let command = self.rows.command;
        let text = self.read_to_string().await?;
        serde_json::Deserializer::from_str(&text)
            .into_iter::<serde_json::Value>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| invalid_document(command, e))
    }
}

fn document_from_value(value: Value, command: &str) -> Result<serde_json::Value> {
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Json(doc) => Ok(doc),
        Value::String(text) => {
            serde_json::from_str(&text).map_err(|e| invalid_document(command, e))
        }
        Value::Bytes(bytes) => {
            serde_json::from_slice(&bytes).map_err(|e| invalid_document(command, e))
        }
        Value::Bool(b) => Ok(serde_json::Value::Bool(b)),
        Value::Int(i) => Ok(serde_json::Value::from(i)),
        Value::Float(f) => Ok(serde_json::Value::from(f)),
        other => Ok(serde_json::Value::String(other.to_display_string())),
    }
}

fn push_chunk(text: &mut String, value: Value, command: &str) -> Result<()> {
    match value {
        Value::Null => {}
        Value::String(chunk) => text.push_str(&chunk),
        Value::Json(doc) => text.push_str(&doc.to_string()),
        Value::Bytes(bytes) => {
            let chunk = String::from_utf8(bytes).map_err(|e| {
                TrackerError::command(format!("Document chunk is not UTF-8: {e} ({command})"))
            })?;
            text.push_str(&chunk);
        }
        other => text.push_str(&other.to_display_string()),
    }
    Ok(())
}

fn invalid_document(command: &str, error: serde_json::Error) -> TrackerError {
    TrackerError::command(format!("Result is not a valid document: {error} ({command})"))
}
