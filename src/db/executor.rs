//! The command executor.
//!
//! One executor owns one connection and at most one transaction. It is meant
//! to be created per logical operation and closed when that operation ends.
//! Every method takes `&mut self`, so commands on one executor run strictly in
//! the order they were issued.

use super::command::{Command, RenderedCommand};
use super::cursor::{DocumentCursor, ReaderBehavior, RowCursor};
use super::session::Session;
use super::types::{DataSet, DataTable, Value};
use super::{redact_connection_string, DatabaseBackend};
use crate::config::{Config, DEFAULT_CONNECTION_NAME};
use crate::error::{Result, TrackerError};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Message used when commit or rollback is called without an active transaction.
const TRANSACTION_NOT_INITIALIZED: &str = "Transaction is not initialized.";

/// Maximum number of characters of command text quoted in error messages.
const MAX_COMMAND_PREVIEW: usize = 120;

/// State of the executor's transaction context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// No transaction has been started.
    #[default]
    None,
    /// A transaction is open; every command is enlisted in it.
    Active,
    /// The last transaction was committed.
    Committed,
    /// The last transaction was rolled back.
    RolledBack,
}

/// Runs parameterized commands over a single lazily-opened connection.
pub struct CommandExecutor {
    connection_string: String,
    backend: DatabaseBackend,
    session: Option<Session>,
    transaction: TransactionState,
    last_command: Option<String>,
}

impl CommandExecutor {
    /// Creates an executor for the `ConnString` entry of the process-wide
    /// configuration. Does not connect.
    pub fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(&config)
    }

    /// Creates an executor for the `ConnString` entry of the given configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_connection_string(config.connection_string(DEFAULT_CONNECTION_NAME)?)
    }

    /// Creates an executor for an explicit connection string. Does not connect.
    pub fn with_connection_string(connection_string: impl Into<String>) -> Result<Self> {
        let connection_string = connection_string.into();
        let backend = DatabaseBackend::from_connection_string(&connection_string)?;

        Ok(Self {
            connection_string,
            backend,
            session: None,
            transaction: TransactionState::None,
            last_command: None,
        })
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    /// Returns true while the connection is open.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction
    }

    /// SQL text of the most recent command, as sent to the backend.
    ///
    /// Kept after failures so callers can report what was attempted.
    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    /// Starts a transaction, opening the connection if needed.
    ///
    /// Fails if a transaction is already active.
    pub async fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction == TransactionState::Active {
            return Err(TrackerError::transaction(
                "A transaction is already active on this executor.",
            ));
        }

        let session = self.ensure_open().await?;
        session
            .run_raw("BEGIN")
            .await
            .map_err(|e| map_sqlx_error(e, "BEGIN"))?;

        self.transaction = TransactionState::Active;
        info!("Transaction started");
        Ok(())
    }

    /// Commits the active transaction. The connection stays open.
    pub async fn commit(&mut self) -> Result<()> {
        self.finish_transaction("COMMIT", TransactionState::Committed)
            .await
    }

    /// Rolls back the active transaction. The connection stays open.
    pub async fn rollback(&mut self) -> Result<()> {
        self.finish_transaction("ROLLBACK", TransactionState::RolledBack)
            .await
    }

    /// Runs a command for its side effect and returns the number of affected rows.
    pub async fn execute(&mut self, command: Command) -> Result<u64> {
        let rendered = self.prepare(command)?;
        let start = Instant::now();
        let session = self.ensure_open().await?;

        let outcome = run_timed(
            rendered.timeout,
            session.execute(&rendered.sql, rendered.values),
        )
        .await;
        let affected = self.settle(&rendered.sql, rendered.timeout, outcome)?;

        debug!("Command affected {} rows in {:?}", affected, start.elapsed());
        Ok(affected)
    }

    /// Returns the first column of the first row, or `None` if there are no rows.
    pub async fn execute_scalar(&mut self, command: Command) -> Result<Option<Value>> {
        let rendered = self.prepare(command)?;
        let start = Instant::now();
        let session = self.ensure_open().await?;

        let outcome = run_timed(
            rendered.timeout,
            session.fetch_optional(&rendered.sql, rendered.values),
        )
        .await;
        let row = self.settle(&rendered.sql, rendered.timeout, outcome)?;

        debug!("Scalar command completed in {:?}", start.elapsed());
        Ok(row.and_then(|r| r.into_values().into_iter().next()))
    }

    /// Buffers the first result set of the command.
    ///
    /// The table owns its data and stays valid after the executor is closed.
    pub async fn execute_data_table(&mut self, command: Command) -> Result<DataTable> {
        let data_set = self.execute_data_set(command).await?;
        Ok(data_set.tables.into_iter().next().unwrap_or_default())
    }

    /// Buffers every row-producing result set of the command.
    pub async fn execute_data_set(&mut self, command: Command) -> Result<DataSet> {
        let rendered = self.prepare(command)?;
        let start = Instant::now();
        let session = self.ensure_open().await?;

        let outcome = run_timed(
            rendered.timeout,
            session.fetch_result_sets(&rendered.sql, rendered.values),
        )
        .await;
        let tables = self.settle(&rendered.sql, rendered.timeout, outcome)?;

        debug!(
            "Buffered {} result sets ({} rows) in {:?}",
            tables.len(),
            tables.iter().map(DataTable::row_count).sum::<usize>(),
            start.elapsed()
        );
        Ok(DataSet { tables })
    }

    /// Opens a forward-only cursor over the command's rows.
    ///
    /// The cursor borrows this executor; release it before issuing another
    /// command or closing.
    pub async fn execute_data_reader(
        &mut self,
        command: Command,
        behavior: ReaderBehavior,
    ) -> Result<RowCursor<'_>> {
        let rendered = command.render(self.backend)?;
        self.ensure_open().await?;

        let Self {
            session,
            last_command,
            ..
        } = self;
        let sql: &str = last_command.insert(rendered.sql);
        let session = session
            .as_mut()
            .ok_or_else(|| TrackerError::internal("connection is not open"))?;

        debug!("Opened cursor for {}", preview(sql));
        Ok(RowCursor::new(
            session.fetch(sql, rendered.values),
            sql,
            rendered.timeout,
            behavior,
        ))
    }

    /// Opens a cursor that reads the command's result as structured documents.
    pub async fn execute_document_reader(
        &mut self,
        command: Command,
    ) -> Result<DocumentCursor<'_>> {
        let rows = self
            .execute_data_reader(command, ReaderBehavior::Default)
            .await?;
        Ok(DocumentCursor::new(rows))
    }

    /// Closes the connection if it is open, rolling back any transaction that
    /// is still active. Safe to call more than once.
    ///
    /// Every release step is attempted; the first failure is returned.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let mut release_error = None;

        if self.transaction == TransactionState::Active {
            warn!("Rolling back transaction still active at close");
            if let Err(e) = session.run_raw("ROLLBACK").await {
                release_error = Some(TrackerError::release(format!(
                    "Failed to roll back transaction: {e}"
                )));
            }
            self.transaction = TransactionState::RolledBack;
        }

        if let Err(e) = session.close().await {
            release_error.get_or_insert_with(|| {
                TrackerError::release(format!("Failed to close connection: {e}"))
            });
        }

        debug!(
            "Closed connection to {}",
            redact_connection_string(&self.connection_string)
        );
        release_error.map_or(Ok(()), Err)
    }

    /// Closes the executor and returns `outcome`.
    ///
    /// If `outcome` is already an error, a close failure is logged and the
    /// original error is returned.
    pub async fn close_with<T>(mut self, outcome: Result<T>) -> Result<T> {
        let closed = self.close().await;
        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!("Failed to close executor after error: {}", close_err);
                Err(e)
            }
        }
    }

    async fn finish_transaction(
        &mut self,
        statement: &'static str,
        outcome: TransactionState,
    ) -> Result<()> {
        if self.transaction != TransactionState::Active {
            return Err(TrackerError::transaction(TRANSACTION_NOT_INITIALIZED));
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| TrackerError::transaction(TRANSACTION_NOT_INITIALIZED))?;

        // On failure the transaction stays active so the caller can still roll back.
        session
            .run_raw(statement)
            .await
            .map_err(|e| map_sqlx_error(e, statement))?;

        self.transaction = outcome;
        info!("Transaction finished with {}", statement);
        Ok(())
    }

    /// Maps the outcome of a timed command into our error type.
    ///
    /// A timed-out command leaves its connection mid-protocol, so the
    /// connection is dropped and the next operation reopens it.
    fn settle<T>(&mut self, sql: &str, limit: Option<Duration>, outcome: Timed<T>) -> Result<T> {
        match outcome {
            Ok(result) => result.map_err(|e| map_sqlx_error(e, sql)),
            Err(_) => {
                self.abandon_session();
                Err(timeout_error(sql, limit.unwrap_or_default()))
            }
        }
    }

    fn abandon_session(&mut self) {
        if self.session.take().is_none() {
            return;
        }
        if self.transaction == TransactionState::Active {
            warn!("Command timed out inside a transaction; the transaction is rolled back");
            self.transaction = TransactionState::RolledBack;
        }
        warn!("Dropped connection after command timeout");
    }

    /// Builds the command and records it as the live command.
    fn prepare(&mut self, command: Command) -> Result<RenderedCommand> {
        let rendered = command.render(self.backend)?;
        debug!("Prepared command: {}", preview(&rendered.sql));
        self.last_command = Some(rendered.sql.clone());
        Ok(rendered)
    }

    async fn ensure_open(&mut self) -> Result<&mut Session> {
        if self.session.is_none() {
            let target = redact_connection_string(&self.connection_string);
            debug!("Opening {} connection to {}", self.backend.as_str(), target);

            let session = Session::open(self.backend, &self.connection_string)
                .await
                .map_err(|e| TrackerError::connection(format!("Cannot connect to {target}: {e}")))?;
            self.session = Some(session);
        }

        self.session
            .as_mut()
            .ok_or_else(|| TrackerError::internal("connection is not open"))
    }
}

impl fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandExecutor")
            .field(
                "connection_string",
                &redact_connection_string(&self.connection_string),
            )
            .field("backend", &self.backend)
            .field("open", &self.is_open())
            .field("transaction", &self.transaction)
            .finish()
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        // Dropping the connection closes it; the server discards any open transaction.
        if self.session.take().is_some() {
            if self.transaction == TransactionState::Active {
                warn!("Executor dropped with an active transaction; it will be rolled back");
            }
            debug!("Connection released on drop");
        }
    }
}

/// A command raced against its timeout; `Err` means the timer fired first.
type Timed<T> = std::result::Result<SqlxResult<T>, tokio::time::error::Elapsed>;

type SqlxResult<T> = std::result::Result<T, sqlx::Error>;

async fn run_timed<T, F>(timeout: Option<Duration>, fut: F) -> Timed<T>
where
    F: Future<Output = SqlxResult<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}

pub(crate) fn timeout_error(command: &str, limit: Duration) -> TrackerError {
    TrackerError::command(format!(
        "Command timed out after {} seconds ({})",
        limit.as_secs_f64(),
        preview(command)
    ))
}

/// Classifies a sqlx error raised while running a command.
pub(crate) fn map_sqlx_error(error: sqlx::Error, command: &str) -> TrackerError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            TrackerError::connection(format!("{error} ({})", preview(command)))
        }
        _ => TrackerError::command(format!(
            "{} ({})",
            format_command_error(&error),
            preview(command)
        )),
    }
}

/// Formats a command error with PostgreSQL detail and hint when available.
fn format_command_error(error: &sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = String::from(db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }

        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }

        if let Some(constraint) = pg_error.constraint() {
            result.push_str("\n  CONSTRAINT: ");
            result.push_str(constraint);
        }
    }

    result
}

/// Single-line, length-limited command text for logs and error messages.
fn preview(command: &str) -> String {
    let flat = command.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX_COMMAND_PREVIEW {
        return flat;
    }
    let mut cut: String = flat.chars().take(MAX_COMMAND_PREVIEW).collect();
    cut.push_str("...");
    cut
}
