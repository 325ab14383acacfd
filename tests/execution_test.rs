//! Integration tests for command execution, connection sharing and transactions.
//!
//! Each test works on its own SQLite file so that separate connections see the
//! same data.

use db_access_block::DbError;
use db_access_block::db::{Database, ReleaseOutcome, TransactionScope};
use db_access_block::models::{CommandType, DbType, DbValue};
use db_access_block::provider::SQLITE;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Create a database with a small products table.
async fn setup_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("products.db").display());
    let db = Database::for_provider("products", SQLITE, &url).unwrap();

    db.execute_non_query_sql(
        CommandType::Text,
        "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL)",
    )
    .await
    .unwrap();
    db.execute_non_query_sql(
        CommandType::Text,
        "INSERT INTO products (id, name, price) VALUES \
         (1, 'Chai', 18.0), (2, 'Chang', 19.0), (3, 'Aniseed Syrup', 10.0)",
    )
    .await
    .unwrap();

    (dir, db)
}

async fn count_products(db: &Database) -> DbValue {
    db.execute_scalar_sql(CommandType::Text, "SELECT COUNT(*) FROM products")
        .await
        .unwrap()
}

#[tokio::test]
async fn test_reader_streams_rows_in_order() {
    let (_dir, db) = setup_db().await;

    let mut reader = db
        .execute_reader_sql(CommandType::Text, "SELECT id, name FROM products ORDER BY id")
        .await
        .unwrap();
    assert_eq!(reader.columns(), ["id", "name"]);

    let mut names = Vec::new();
    while let Some(row) = reader.read().await.unwrap() {
        names.push(row.try_get("name").unwrap().to_string());
    }
    assert_eq!(names, vec!["Chai", "Chang", "Aniseed Syrup"]);
    assert!(reader.read().await.unwrap().is_none());
}

#[tokio::test]
async fn test_table_direct_reads_whole_table() {
    let (_dir, db) = setup_db().await;
    let rows = db
        .execute_reader_sql(CommandType::TableDirect, "products")
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].len(), 3);
}

#[tokio::test]
async fn test_scalar_with_parameter() {
    let (_dir, db) = setup_db().await;
    let mut cmd = db
        .get_sql_string_command("SELECT name FROM products WHERE id = ?")
        .unwrap();
    db.add_in_parameter(&mut cmd, "id", DbType::Int32, 2).unwrap();

    assert_eq!(db.execute_scalar(&cmd).await.unwrap(), DbValue::from("Chang"));
}

#[tokio::test]
async fn test_scalar_without_rows_is_null() {
    let (_dir, db) = setup_db().await;
    let value = db
        .execute_scalar_sql(CommandType::Text, "SELECT name FROM products WHERE id = 99")
        .await
        .unwrap();
    assert!(value.is_null());
}

#[tokio::test]
async fn test_non_query_returns_affected_rows() {
    let (_dir, db) = setup_db().await;
    let affected = db
        .execute_non_query_sql(CommandType::Text, "UPDATE products SET price = price + 1")
        .await
        .unwrap();
    assert_eq!(affected, 3);
}

#[tokio::test]
async fn test_driver_error_propagates_unchanged() {
    let (_dir, db) = setup_db().await;
    let err = db
        .execute_reader_sql(CommandType::Text, "SELECT * FROM missing_table")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Driver(_)));
}

#[tokio::test]
async fn test_reader_on_caller_connection_keeps_it_open() {
    let (_dir, db) = setup_db().await;
    let connection = db.create_connection().await.unwrap();
    assert_eq!(connection.ref_count(), 1);

    let cmd = db
        .get_sql_string_command("SELECT id FROM products ORDER BY id")
        .unwrap();
    let reader = db.execute_reader_on(&cmd, &connection).await.unwrap();
    // The open reader holds its own reference.
    assert_eq!(connection.ref_count(), 2);

    let rows = reader.collect_rows().await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(connection.ref_count(), 1);
    assert!(!connection.is_disposed());

    // The connection is still usable.
    let value = db.execute_scalar_on(&cmd, &connection).await.unwrap();
    assert_eq!(value, DbValue::Int(1));

    assert_eq!(connection.release().await, ReleaseOutcome::Disposed);
    assert!(connection.is_disposed());
    assert!(matches!(
        db.execute_scalar_on(&cmd, &connection).await,
        Err(DbError::ConnectionDisposed)
    ));
}

#[tokio::test]
async fn test_closing_reader_early_returns_reference() {
    let (_dir, db) = setup_db().await;
    let connection = db.create_connection().await.unwrap();
    let cmd = db.get_sql_string_command("SELECT id FROM products").unwrap();

    let mut reader = db.execute_reader_on(&cmd, &connection).await.unwrap();
    assert!(reader.read().await.unwrap().is_some());
    reader.close().await;

    assert_eq!(connection.ref_count(), 1);
    connection.release().await;
}

#[tokio::test]
async fn test_transaction_commit() {
    let (_dir, db) = setup_db().await;
    let tx = db.begin_transaction().await.unwrap();
    let insert = db
        .get_sql_string_command("INSERT INTO products (id, name) VALUES (4, 'Tofu')")
        .unwrap();

    assert_eq!(db.execute_non_query_in(&insert, &tx).await.unwrap(), 1);
    let inside = db
        .execute_scalar_in(
            &db.get_sql_string_command("SELECT COUNT(*) FROM products").unwrap(),
            &tx,
        )
        .await
        .unwrap();
    assert_eq!(inside, DbValue::Int(4));

    tx.commit().await.unwrap();
    assert_eq!(count_products(&db).await, DbValue::Int(4));
}

#[tokio::test]
async fn test_transaction_rollback() {
    let (_dir, db) = setup_db().await;
    let tx = db.begin_transaction().await.unwrap();
    let connection = std::sync::Arc::clone(tx.connection());
    let delete = db.get_sql_string_command("DELETE FROM products").unwrap();

    assert_eq!(db.execute_non_query_in(&delete, &tx).await.unwrap(), 3);
    tx.rollback().await.unwrap();

    assert!(connection.is_disposed());
    assert_eq!(count_products(&db).await, DbValue::Int(3));
}

#[tokio::test]
async fn test_scope_complete_commits_shared_connection() {
    let (_dir, db) = setup_db().await;
    let scope = TransactionScope::new();

    scope
        .run(async {
            db.execute_non_query_sql(
                CommandType::Text,
                "INSERT INTO products (id, name) VALUES (4, 'Tofu')",
            )
            .await?;
            db.execute_non_query_sql(
                CommandType::Text,
                "INSERT INTO products (id, name) VALUES (5, 'Konbu')",
            )
            .await?;
            // Reads see the scope's own writes.
            assert_eq!(count_products(&db).await, DbValue::Int(5));
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

    assert_eq!(scope.connection_count().await, 1);
    scope.complete().await.unwrap();
    assert_eq!(count_products(&db).await, DbValue::Int(5));
}

#[tokio::test]
async fn test_scope_dispose_rolls_back() {
    let (_dir, db) = setup_db().await;
    let scope = TransactionScope::new();

    scope
        .run(db.execute_non_query_sql(CommandType::Text, "DELETE FROM products"))
        .await
        .unwrap();
    scope.dispose().await.unwrap();

    assert_eq!(count_products(&db).await, DbValue::Int(3));
}

#[tokio::test]
async fn test_reader_inside_scope_uses_scope_connection() {
    let (_dir, db) = setup_db().await;
    let scope = TransactionScope::new();

    let rows = scope
        .run(async {
            db.execute_non_query_sql(CommandType::Text, "DELETE FROM products WHERE id = 1")
                .await?;
            db.execute_reader_sql(CommandType::Text, "SELECT id FROM products")
                .await?
                .collect_rows()
                .await
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    scope.dispose().await.unwrap();
    assert_eq!(count_products(&db).await, DbValue::Int(3));
}

#[tokio::test]
async fn test_command_fails_fast_while_scope_reader_is_open() {
    let (_dir, db) = setup_db().await;
    let scope = TransactionScope::new();

    scope
        .run(async {
            let mut reader = db
                .execute_reader_sql(CommandType::Text, "SELECT id FROM products ORDER BY id")
                .await?;
            assert!(reader.read().await?.is_some());

            let busy = tokio::time::timeout(
                Duration::from_secs(3),
                db.execute_non_query_sql(CommandType::Text, "UPDATE products SET price = 0"),
            )
            .await
            .expect("command waited on the open reader");
            assert!(matches!(busy, Err(DbError::ConnectionBusy)));

            reader.close().await;
            let updated = db
                .execute_non_query_sql(CommandType::Text, "UPDATE products SET price = 0")
                .await?;
            assert_eq!(updated, 3);
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

    scope.dispose().await.unwrap();
}

#[tokio::test]
async fn test_commit_fails_fast_while_transaction_reader_is_open() {
    let (_dir, db) = setup_db().await;
    let tx = db.begin_transaction().await.unwrap();
    let connection = Arc::clone(tx.connection());
    let insert = db
        .get_sql_string_command("INSERT INTO products (id, name) VALUES (4, 'Tofu')")
        .unwrap();
    db.execute_non_query_in(&insert, &tx).await.unwrap();

    let select = db.get_sql_string_command("SELECT id FROM products").unwrap();
    let reader = db.execute_reader_in(&select, &tx).await.unwrap();
    assert!(connection.has_open_reader());

    let commit = tokio::time::timeout(Duration::from_secs(3), tx.commit())
        .await
        .expect("commit waited on the open reader");
    assert!(matches!(commit, Err(DbError::ConnectionBusy)));

    // The reader holds the last reference; closing it closes the connection and
    // the uncommitted insert is discarded.
    reader.close().await;
    assert!(connection.is_disposed());
    assert_eq!(count_products(&db).await, DbValue::Int(3));
}

#[tokio::test]
async fn test_second_reader_on_connection_is_rejected() {
    let (_dir, db) = setup_db().await;
    let connection = db.create_connection().await.unwrap();
    let cmd = db.get_sql_string_command("SELECT id FROM products").unwrap();

    let first = db.execute_reader_on(&cmd, &connection).await.unwrap();
    let second = db.execute_reader_on(&cmd, &connection).await;
    assert!(matches!(second, Err(DbError::ConnectionBusy)));
    assert_eq!(connection.ref_count(), 2);

    drop(first);
    for _ in 0..100 {
        if connection.ref_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(db.execute_scalar_on(&cmd, &connection).await.unwrap(), DbValue::Int(1));
    connection.release().await;
}
