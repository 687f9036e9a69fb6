//! Database access layer for video-tracking.
//!
//! The `CommandExecutor` owns a single connection and at most one transaction,
//! and runs parameterized commands against PostgreSQL or SQLite.

mod command;
mod cursor;
mod executor;
mod session;
mod types;

pub use command::{Command, CommandKind, Parameter, DEFAULT_COMMAND_TIMEOUT};
pub use cursor::{DocumentCursor, ReaderBehavior, RowCursor};
pub use executor::{CommandExecutor, TransactionState};
pub use types::{ColumnInfo, DataSet, DataTable, Row, Value};

use crate::error::{Result, TrackerError};
use url::Url;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Postgres,
    Sqlite,
}

impl DatabaseBackend {
    /// Returns the backend as a string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Parses a backend from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Determines the backend from a connection string's scheme.
    ///
    /// Accepts `postgres://`, `postgresql://` and `sqlite:` targets.
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let scheme = conn_str
            .split_once(':')
            .map(|(scheme, _)| scheme.trim())
            .filter(|scheme| !scheme.is_empty())
            .ok_or_else(|| {
                TrackerError::config("Invalid connection string: missing scheme".to_string())
            })?;

        Self::parse(scheme).ok_or_else(|| {
            TrackerError::config(format!(
                "Invalid scheme '{scheme}'. Expected 'postgres', 'postgresql' or 'sqlite'"
            ))
        })
    }

    /// Positional placeholder for the given 1-based parameter number.
    pub(crate) fn placeholder(&self, number: usize) -> String {
        match self {
            Self::Postgres => format!("${number}"),
            Self::Sqlite => format!("?{number}"),
        }
    }

    /// Whether the backend can invoke stored routines with `CALL`.
    pub fn supports_stored_procedures(&self) -> bool {
        matches!(self, Self::Postgres)
    }
}

/// Returns a display-safe form of a connection string (password masked).
pub fn redact_connection_string(conn_str: &str) -> String {
    match Url::parse(conn_str) {
        Ok(mut url) if url.password().is_some() => {
            // set_password only fails for cannot-be-a-base URLs, which carry no password.
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        _ => conn_str.to_string(),
    }
}
