//! Backend connections for the command executor.
//!
//! A `Session` is one open sqlx connection. It binds rendered commands, runs
//! them, and converts backend rows into our `Row` type.

use super::command::split_statements;
use super::types::{ColumnInfo, DataTable, Row, Value};
use super::DatabaseBackend;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgConnection, PgRow, PgTypeInfo, Postgres};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{
    Column as _, ConnectOptions, Connection, Either, Row as _, TypeInfo as _, ValueRef as _,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

type SqlxResult<T> = std::result::Result<T, sqlx::Error>;

/// Column metadata shared by every row of one result set.
type ColumnCache = Option<Arc<[ColumnInfo]>>;

/// An open connection to one of the supported backends.
#[derive(Debug)]
pub(crate) enum Session {
    Postgres(PgConnection),
    Sqlite(SqliteConnection),
}

impl Session {
    /// Opens a connection. SQLite database files are created when missing.
    pub async fn open(backend: DatabaseBackend, conn_str: &str) -> SqlxResult<Self> {
        match backend {
            DatabaseBackend::Postgres => {
                Ok(Self::Postgres(PgConnection::connect(conn_str).await?))
            }
            DatabaseBackend::Sqlite => {
                let options = SqliteConnectOptions::from_str(conn_str)?.create_if_missing(true);
                Ok(Self::Sqlite(options.connect().await?))
            }
        }
    }

    /// Runs an unparameterized statement such as `BEGIN` or `COMMIT`.
    pub async fn run_raw(&mut self, sql: &str) -> SqlxResult<()> {
        debug!("Running {sql}");
        match self {
            Self::Postgres(conn) => {
                sqlx::Executor::execute(&mut *conn, sql).await?;
            }
            Self::Sqlite(conn) => {
                sqlx::Executor::execute(&mut *conn, sql).await?;
            }
        }
        Ok(())
    }

    /// Runs a command for its side effect and returns the affected row count.
    pub async fn execute(&mut self, sql: &str, values: Vec<Value>) -> SqlxResult<u64> {
        let affected = match self {
            Self::Postgres(conn) => bind_pg(sqlx::query(sql), values)
                .execute(&mut *conn)
                .await?
                .rows_affected(),
            Self::Sqlite(conn) => bind_sqlite(sqlx::query(sql), values)
                .execute(&mut *conn)
                .await?
                .rows_affected(),
        };
        Ok(affected)
    }

    /// Returns the first row of the result, if any.
    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        values: Vec<Value>,
    ) -> SqlxResult<Option<Row>> {
        let row = match self {
            Self::Postgres(conn) => bind_pg(sqlx::query(sql), values)
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| convert_pg_row(&row, &mut None)),
            Self::Sqlite(conn) => bind_sqlite(sqlx::query(sql), values)
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| convert_sqlite_row(&row, &mut None)),
        };
        Ok(row)
    }

    /// Buffers every row-producing result set of the command.
    ///
    /// A statement that returns no rows still yields an empty table when it
    /// has result columns; statements without columns yield nothing.
    pub async fn fetch_result_sets(
        &mut self,
        sql: &str,
        values: Vec<Value>,
    ) -> SqlxResult<Vec<DataTable>> {
        let per_statement = match self {
            // Prepared statements hold a single statement on Postgres, so an
            // unparameterized batch goes through the simple query protocol.
            Self::Postgres(conn) if values.is_empty() => {
                #[allow(deprecated)]
                let stream = sqlx::Executor::fetch_many(&mut *conn, sql);
                collect_statement_rows(stream, convert_pg_row).await?
            }
            Self::Postgres(conn) => {
                #[allow(deprecated)]
                let stream = bind_pg(sqlx::query(sql), values).fetch_many(&mut *conn);
                collect_statement_rows(stream, convert_pg_row).await?
            }
            Self::Sqlite(conn) => {
                #[allow(deprecated)]
                let stream = bind_sqlite(sqlx::query(sql), values).fetch_many(&mut *conn);
                collect_statement_rows(stream, convert_sqlite_row).await?
            }
        };

        let statements = split_statements(sql);
        let mut tables = Vec::with_capacity(per_statement.len());
        for (index, rows) in per_statement.into_iter().enumerate() {
            if !rows.is_empty() {
                tables.push(DataTable::from_rows(rows));
                continue;
            }

            let Some(statement) = statements.get(index) else {
                continue;
            };
            match self.statement_columns(statement).await {
                Ok(columns) if !columns.is_empty() => {
                    tables.push(DataTable::with_columns(columns));
                }
                Ok(_) => {}
                Err(e) => debug!("Could not describe statement {}: {}", index + 1, e),
            }
        }

        Ok(tables)
    }

    /// Result columns of a single statement, read from its prepared form.
    async fn statement_columns(&mut self, statement: &str) -> SqlxResult<Vec<ColumnInfo>> {
        match self {
            Self::Postgres(conn) => {
                let prepared = sqlx::Executor::prepare(&mut *conn, statement).await?;
                Ok(statement_column_infos(&prepared))
            }
            Self::Sqlite(conn) => {
                let prepared = sqlx::Executor::prepare(&mut *conn, statement).await?;
                Ok(statement_column_infos(&prepared))
            }
        }
    }

    /// Streams rows while keeping this connection borrowed.
    pub fn fetch<'c>(
        &'c mut self,
        sql: &'c str,
        values: Vec<Value>,
    ) -> BoxStream<'c, SqlxResult<Row>> {
        match self {
            Self::Postgres(conn) => {
                let mut columns: ColumnCache = None;
                bind_pg(sqlx::query(sql), values)
                    .fetch(conn)
                    .map_ok(move |row| convert_pg_row(&row, &mut columns))
                    .boxed()
            }
            Self::Sqlite(conn) => {
                let mut columns: ColumnCache = None;
                bind_sqlite(sqlx::query(sql), values)
                    .fetch(conn)
                    .map_ok(move |row| convert_sqlite_row(&row, &mut columns))
                    .boxed()
            }
        }
    }

    /// Closes the connection gracefully.
    pub async fn close(self) -> SqlxResult<()> {
        match self {
            Self::Postgres(conn) => conn.close().await,
            Self::Sqlite(conn) => conn.close().await,
        }
    }
}

/// Groups a multi-result stream by statement, one entry per completed
/// statement in execution order.
async fn collect_statement_rows<Q, R>(
    mut stream: BoxStream<'_, SqlxResult<Either<Q, R>>>,
    convert: fn(&R, &mut ColumnCache) -> Row,
) -> SqlxResult<Vec<Vec<Row>>> {
    let mut statements = Vec::new();
    let mut rows = Vec::new();
    let mut columns: ColumnCache = None;

    while let Some(item) = stream.try_next().await? {
        match item {
            // End of one statement's results.
            Either::Left(_) => {
                statements.push(std::mem::take(&mut rows));
                columns = None;
            }
            Either::Right(row) => rows.push(convert(&row, &mut columns)),
        }
    }

    if !rows.is_empty() {
        statements.push(rows);
    }

    Ok(statements)
}

/// NULL bound with an unspecified type so PostgreSQL infers it from context.
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_pg<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    values: Vec<Value>,
) -> Query<'q, Postgres, PgArguments> {
    for value in values {
        query = match value {
            Value::Null => query.bind(UntypedNull),
            Value::Bool(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::Float(v) => query.bind(v),
            Value::String(v) => query.bind(v),
            Value::Bytes(v) => query.bind(v),
            Value::Timestamp(v) => query.bind(v),
            Value::Uuid(v) => query.bind(v),
            Value::Json(v) => query.bind(sqlx::types::Json(v)),
        };
    }
    query
}

fn bind_sqlite<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: Vec<Value>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::Float(v) => query.bind(v),
            Value::String(v) => query.bind(v),
            Value::Bytes(v) => query.bind(v),
            Value::Timestamp(v) => query.bind(v),
            // Stored as text so the values stay readable from any client.
            Value::Uuid(v) => query.bind(v.hyphenated().to_string()),
            Value::Json(v) => query.bind(v.to_string()),
        };
    }
    query
}

fn statement_column_infos<'q, S: sqlx::Statement<'q>>(statement: &S) -> Vec<ColumnInfo> {
    statement
        .columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

fn column_infos<R: sqlx::Row>(row: &R) -> Arc<[ColumnInfo]> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

/// Converts a sqlx PgRow to our Row type.
fn convert_pg_row(row: &PgRow, cache: &mut ColumnCache) -> Row {
    let columns = Arc::clone(cache.get_or_insert_with(|| column_infos(row)));
    let values = columns
        .iter()
        .enumerate()
        .map(|(i, col)| convert_pg_value(row, i, &col.data_type))
        .collect();
    Row::new(columns, values)
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_pg_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .ok()
            .flatten()
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),

        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Timestamp(v.naive_utc()))
            .unwrap_or(Value::Null),

        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)
            .ok()
            .flatten()
            .map(Value::Uuid)
            .unwrap_or(Value::Null),

        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .ok()
            .flatten()
            .map(Value::Json)
            .unwrap_or(Value::Null),

        // For all other types, try to get as string
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Converts a sqlx SqliteRow to our Row type.
fn convert_sqlite_row(row: &SqliteRow, cache: &mut ColumnCache) -> Row {
    let columns = Arc::clone(cache.get_or_insert_with(|| column_infos(row)));
    let values = columns
        .iter()
        .enumerate()
        .map(|(i, col)| convert_sqlite_value(row, i, &col.data_type))
        .collect();
    Row::new(columns, values)
}

/// Converts a SQLite value using its storage class, refined by the declared
/// column type for booleans and timestamps.
fn convert_sqlite_value(row: &SqliteRow, index: usize, declared: &str) -> Value {
    let storage = match row.try_get_raw(index) {
        Ok(raw) if !raw.is_null() => raw.type_info().name().to_uppercase(),
        _ => return Value::Null,
    };
    let declared = declared.to_uppercase();

    match storage.as_str() {
        "INTEGER" | "INT8" | "BIGINT" if declared == "BOOLEAN" => row
            .try_get::<bool, _>(index)
            .map(Value::Bool)
            .or_else(|_| row.try_get::<i64, _>(index).map(Value::Int))
            .unwrap_or(Value::Null),

        "INTEGER" | "INT8" | "BIGINT" => row
            .try_get::<i64, _>(index)
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "REAL" | "FLOAT" => row
            .try_get::<f64, _>(index)
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        _ if matches!(declared.as_str(), "DATETIME" | "TIMESTAMP") => row
            .try_get::<NaiveDateTime, _>(index)
            .map(Value::Timestamp)
            .or_else(|_| row.try_get::<String, _>(index).map(Value::String))
            .unwrap_or(Value::Null),

        _ => row
            .try_get::<String, _>(index)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}
