//! Command executor integration tests.
//!
//! Runs every executor operation against a SQLite database file.

use pretty_assertions::assert_eq;
use std::time::Duration;
use tempfile::TempDir;
use video_tracking::db::{Command, CommandExecutor, ReaderBehavior, TransactionState, Value};

/// Helper to build a connection string for a fresh database file.
fn sqlite_target(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("executor.db").display())
}

/// Helper to create an executor with a small `clips` table.
async fn seeded_executor(dir: &TempDir) -> CommandExecutor {
    let mut executor = CommandExecutor::with_connection_string(sqlite_target(dir)).unwrap();
    executor
        .execute(Command::new(
            "CREATE TABLE clips (id INTEGER PRIMARY KEY, title TEXT NOT NULL, seconds INTEGER)",
        ))
        .await
        .unwrap();
    for (id, title, seconds) in [(1, "intro", 30), (2, "lesson", 600), (3, "outro", 15)] {
        executor
            .execute(
                Command::new(
                    "INSERT INTO clips (id, title, seconds) VALUES (:id, :title, :seconds)",
                )
                .with_param(":id", id)
                .with_param(":title", title)
                .with_param(":seconds", seconds),
            )
            .await
            .unwrap();
    }
    executor
}

async fn count_clips(executor: &mut CommandExecutor) -> i64 {
    executor
        .execute_scalar(Command::new("SELECT COUNT(*) FROM clips"))
        .await
        .unwrap()
        .and_then(|v| v.as_i64())
        .unwrap()
}

#[tokio::test]
async fn test_execute_reports_rows_affected() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let affected = executor
        .execute(
            Command::new("UPDATE clips SET seconds = seconds + 1 WHERE seconds < :limit")
                .with_param("limit", 100),
        )
        .await
        .unwrap();

    assert_eq!(affected, 2);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_scalar_returns_first_column_of_first_row() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let title = executor
        .execute_scalar(Command::new("SELECT title, seconds FROM clips ORDER BY id"))
        .await
        .unwrap();
    assert_eq!(title, Some(Value::from("intro")));

    let missing = executor
        .execute_scalar(
            Command::new("SELECT title FROM clips WHERE id = @id").with_param("@id", 99),
        )
        .await
        .unwrap();
    assert_eq!(missing, None);

    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_repeated_named_parameter_binds_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = CommandExecutor::with_connection_string(sqlite_target(&dir)).unwrap();

    let table = executor
        .execute_data_table(Command::new("SELECT :x AS v, :X * 2 AS w").with_param(":x", 21))
        .await
        .unwrap();

    assert_eq!(table.rows[0].values(), &[Value::Int(21), Value::Int(42)]);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_data_table_survives_close() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let table = executor
        .execute_data_table(Command::new("SELECT id, title FROM clips ORDER BY id"))
        .await
        .unwrap();
    executor.close().await.unwrap();
    drop(executor);

    assert_eq!(table.row_count(), 3);
    assert_eq!(table.column_index("TITLE"), Some(1));
    assert_eq!(table.rows[2].get("title"), Some(&Value::from("outro")));
}

#[tokio::test]
async fn test_data_set_has_one_table_per_statement() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let data_set = executor
        .execute_data_set(Command::new(
            "SELECT id FROM clips ORDER BY id; SELECT title, seconds FROM clips WHERE id = 2",
        ))
        .await
        .unwrap();

    assert_eq!(data_set.len(), 2);
    assert_eq!(data_set.tables[0].row_count(), 3);
    assert_eq!(data_set.tables[1].columns.len(), 2);
    assert_eq!(
        data_set.tables[1].rows[0].values(),
        &[Value::from("lesson"), Value::Int(600)]
    );
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_data_set_keeps_empty_result_sets_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let data_set = executor
        .execute_data_set(Command::new(
            "SELECT id, title FROM clips WHERE 0; \
             UPDATE clips SET seconds = seconds WHERE id = 1; \
             SELECT 'second' AS other",
        ))
        .await
        .unwrap();

    assert_eq!(data_set.len(), 2);
    let first = &data_set.tables[0];
    assert!(first.is_empty());
    let names: Vec<&str> = first.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "title"]);
    assert_eq!(
        data_set.tables[1].rows[0].values(),
        &[Value::from("second")]
    );
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_data_table_of_empty_first_result_set() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let table = executor
        .execute_data_table(Command::new(
            "SELECT id FROM clips WHERE id > 100; SELECT 1 AS one",
        ))
        .await
        .unwrap();

    assert_eq!(table.row_count(), 0);
    assert_eq!(table.column_index("id"), Some(0));
    assert_eq!(table.column_index("one"), None);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_rollback_discards_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    executor.begin_transaction().await.unwrap();
    for id in [10, 11] {
        executor
            .execute(
                Command::new("INSERT INTO clips (id, title) VALUES (:id, 'draft')")
                    .with_param("id", id),
            )
            .await
            .unwrap();
    }
    assert_eq!(count_clips(&mut executor).await, 5);

    executor.rollback().await.unwrap();
    assert_eq!(executor.transaction_state(), TransactionState::RolledBack);
    executor.close().await.unwrap();

    let mut reader = CommandExecutor::with_connection_string(sqlite_target(&dir)).unwrap();
    assert_eq!(count_clips(&mut reader).await, 3);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_persists_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    executor.begin_transaction().await.unwrap();
    executor
        .execute(Command::new("INSERT INTO clips (id, title) VALUES (4, 'bonus')"))
        .await
        .unwrap();
    executor.commit().await.unwrap();
    executor.close().await.unwrap();

    let mut reader = CommandExecutor::with_connection_string(sqlite_target(&dir)).unwrap();
    assert_eq!(count_clips(&mut reader).await, 4);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_close_with_active_transaction_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    executor.begin_transaction().await.unwrap();
    executor.execute(Command::new("DELETE FROM clips")).await.unwrap();
    executor.close().await.unwrap();

    assert_eq!(count_clips(&mut executor).await, 3);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_transaction_errors_without_begin() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = CommandExecutor::with_connection_string(sqlite_target(&dir)).unwrap();

    let err = executor.commit().await.unwrap_err();
    assert!(err.is_transaction_state());
    assert_eq!(err.to_string(), "Transaction error: Transaction is not initialized.");

    let err = executor.rollback().await.unwrap_err();
    assert!(err.is_transaction_state());
    assert!(!executor.is_open());
}

#[tokio::test]
async fn test_data_reader_streams_rows_then_releases() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    {
        let mut cursor = executor
            .execute_data_reader(
                Command::new("SELECT title FROM clips ORDER BY id"),
                ReaderBehavior::Default,
            )
            .await
            .unwrap();

        let mut titles = Vec::new();
        while let Some(row) = cursor.next_row().await.unwrap() {
            titles.push(row.get_index(0).unwrap().to_display_string());
        }
        assert_eq!(titles, vec!["intro", "lesson", "outro"]);
    }

    // The cursor is gone, so the connection is free again.
    assert_eq!(count_clips(&mut executor).await, 3);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_data_reader_single_row() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let cursor = executor
        .execute_data_reader(
            Command::new("SELECT id FROM clips ORDER BY id"),
            ReaderBehavior::SingleRow,
        )
        .await
        .unwrap();
    let table = cursor.into_table().await.unwrap();

    assert_eq!(table.row_count(), 1);
    assert_eq!(table.rows[0].get("id"), Some(&Value::Int(1)));
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_document_reader_parses_json_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let mut cursor = executor
        .execute_document_reader(
            Command::new(
                "SELECT json_object('title', title, 'seconds', seconds) \
                 FROM clips WHERE seconds > :min ORDER BY id",
            )
            .with_param("min", 20),
        )
        .await
        .unwrap();

    let first = cursor.next_document().await.unwrap();
    assert_eq!(
        first,
        Some(serde_json::json!({"title": "intro", "seconds": 30}))
    );
    let second = cursor.next_document().await.unwrap();
    assert_eq!(
        second,
        Some(serde_json::json!({"title": "lesson", "seconds": 600}))
    );
    assert_eq!(cursor.next_document().await.unwrap(), None);
}

#[tokio::test]
async fn test_unknown_placeholder_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let err = executor
        .execute(
            Command::new("INSERT INTO clips (id, title) VALUES (:id, :title)")
                .with_param("id", 7),
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), "Command Error");
    assert_eq!(count_clips(&mut executor).await, 3);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_backend_error_includes_command_text() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let err = executor
        .execute(Command::new("INSERT INTO clips (id, title) VALUES (1, 'dup')"))
        .await
        .unwrap_err();

    assert_eq!(err.category(), "Command Error");
    assert!(err.to_string().contains("INSERT INTO clips"));
    assert_eq!(
        executor.last_command(),
        Some("INSERT INTO clips (id, title) VALUES (1, 'dup')")
    );
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_zero_timeout_disables_timer() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let value = executor
        .execute_scalar(Command::new("SELECT SUM(seconds) FROM clips").with_timeout_secs(0))
        .await
        .unwrap();
    assert_eq!(value, Some(Value::Int(645)));
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_buffered_command_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = seeded_executor(&dir).await;

    let err = executor
        .execute_data_table(
            Command::new(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                 WHERE x < 1000000000) SELECT COUNT(*) FROM c",
            )
            .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.category(), "Command Error");
    assert!(err.to_string().contains("timed out"));
    assert!(!executor.is_open());

    // A fresh connection serves the next command.
    assert_eq!(count_clips(&mut executor).await, 3);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_stored_procedure_unsupported_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = CommandExecutor::with_connection_string(sqlite_target(&dir)).unwrap();

    let err = executor
        .execute(Command::stored_procedure("record_clip").with_param("id", 1))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "Command Error");
    assert!(!executor.is_open());
}
