//! Integration tests for begin/end asynchronous execution.

use db_access_block::DbError;
use db_access_block::db::{AsyncOptions, CompletionInfo, Database, ExecutionTarget};
use db_access_block::models::{CommandType, DbValue};
use db_access_block::provider::{ORACLE_CLIENT, SQL_CE, SQLITE};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tokio::sync::oneshot;

async fn setup_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("orders.db").display());
    let db = Database::for_provider("orders", SQLITE, &url).unwrap();

    db.execute_non_query_sql(
        CommandType::Text,
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer TEXT NOT NULL)",
    )
    .await
    .unwrap();
    db.execute_non_query_sql(
        CommandType::Text,
        "INSERT INTO orders (id, customer) VALUES (1, 'ALFKI'), (2, 'BONAP'), (3, 'ALFKI')",
    )
    .await
    .unwrap();

    (dir, db)
}

/// Options whose callback forwards the completion info to the returned receiver.
fn callback_options(state: &str) -> (AsyncOptions, oneshot::Receiver<CompletionInfo>) {
    let (tx, rx) = oneshot::channel();
    let options = AsyncOptions::default()
        .with_state(state.to_string())
        .with_callback(move |info| {
            let _ = tx.send(info);
        });
    (options, rx)
}

#[tokio::test]
async fn test_begin_end_scalar_with_callback_and_state() {
    let (_dir, db) = setup_db().await;
    let cmd = db.get_sql_string_command("SELECT COUNT(*) FROM orders").unwrap();
    let (options, completed) = callback_options("count-orders");

    let result = db
        .begin_execute_scalar(&cmd, ExecutionTarget::Auto, options)
        .unwrap();
    assert!(!result.completed_synchronously());
    assert!(result.close_connection());
    assert!(!result.dispose_command());
    assert!(result.connection().is_none());
    assert_eq!(result.command().text(), "SELECT COUNT(*) FROM orders");
    let state = result.async_state().unwrap();
    assert_eq!(state.downcast_ref::<String>().unwrap(), "count-orders");

    result.wait_handle().wait().await;
    assert!(result.wait_handle().is_set());

    let info = completed.await.unwrap();
    assert!(info.succeeded);
    assert_eq!(
        info.state.unwrap().downcast_ref::<String>().unwrap(),
        "count-orders"
    );

    assert_eq!(db.end_execute_scalar(result).await.unwrap(), DbValue::Int(3));
}

#[tokio::test]
async fn test_begin_reader_sql_disposes_command() {
    let (_dir, db) = setup_db().await;
    let result = db
        .begin_execute_reader_sql(
            CommandType::Text,
            "SELECT id FROM orders WHERE customer = 'ALFKI' ORDER BY id",
            AsyncOptions::default(),
        )
        .unwrap();
    assert!(result.dispose_command());
    assert!(result.close_connection());

    let rows = db
        .end_execute_reader(result)
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.get("id").cloned()).collect();
    assert_eq!(ids, vec![Some(DbValue::Int(1)), Some(DbValue::Int(3))]);
}

#[tokio::test]
async fn test_begin_on_caller_connection_leaves_it_open() {
    let (_dir, db) = setup_db().await;
    let connection = db.create_connection().await.unwrap();
    let cmd = db
        .get_sql_string_command("UPDATE orders SET customer = 'WOLZA' WHERE id = 2")
        .unwrap();

    let result = db
        .begin_execute_non_query(
            &cmd,
            ExecutionTarget::Connection(&connection),
            AsyncOptions::default(),
        )
        .unwrap();
    assert!(!result.close_connection());
    assert!(Arc::ptr_eq(result.connection().unwrap(), &connection));

    assert_eq!(db.end_execute_non_query(result).await.unwrap(), 1);
    assert_eq!(connection.ref_count(), 1);
    assert!(!connection.is_disposed());
    connection.release().await;
}

#[tokio::test]
async fn test_begin_inside_transaction() {
    let (_dir, db) = setup_db().await;
    let tx = db.begin_transaction().await.unwrap();
    let cmd = db.get_sql_string_command("DELETE FROM orders").unwrap();

    let result = db
        .begin_execute_non_query(&cmd, ExecutionTarget::Transaction(&tx), AsyncOptions::default())
        .unwrap();
    assert!(!result.close_connection());
    assert_eq!(db.end_execute_non_query(result).await.unwrap(), 3);
    tx.rollback().await.unwrap();

    let count = db
        .execute_scalar_sql(CommandType::Text, "SELECT COUNT(*) FROM orders")
        .await
        .unwrap();
    assert_eq!(count, DbValue::Int(3));
}

#[tokio::test]
async fn test_failed_operation_reports_through_callback_and_end() {
    let (_dir, db) = setup_db().await;
    let cmd = db.get_sql_string_command("SELECT * FROM no_such_table").unwrap();
    let (options, completed) = callback_options("failing");

    let result = db
        .begin_execute_scalar(&cmd, ExecutionTarget::Auto, options)
        .unwrap();
    let info = completed.await.unwrap();
    assert!(!info.succeeded);

    let err = db.end_execute_scalar(result).await.unwrap_err();
    assert!(matches!(err, DbError::Driver(_)));
}

#[tokio::test]
async fn test_providers_without_async_fail_before_io() {
    let invoked = Arc::new(AtomicBool::new(false));

    for (provider, connection_string) in [
        (SQL_CE, "Data Source=northwind.sdf"),
        (ORACLE_CLIENT, "Data Source=orcl;User Id=scott;Password=tiger"),
    ] {
        let db = Database::for_provider("sync-only", provider, connection_string).unwrap();
        assert!(!db.supports_async());
        let cmd = db.get_sql_string_command("SELECT 1").unwrap();

        let flag = Arc::clone(&invoked);
        let options = AsyncOptions::default().with_callback(move |_| {
            flag.store(true, Ordering::SeqCst);
        });
        let err = db
            .begin_execute_reader(&cmd, ExecutionTarget::Auto, options)
            .unwrap_err();
        assert!(matches!(err, DbError::AsyncNotSupported { .. }));

        let err = db
            .begin_execute_non_query_sql(CommandType::Text, "DELETE FROM t", AsyncOptions::default())
            .unwrap_err();
        assert!(matches!(err, DbError::AsyncNotSupported { .. }));
    }

    assert!(!invoked.load(Ordering::SeqCst));
}
