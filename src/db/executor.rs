//! Statement execution engine.
//!
//! This module runs prepared statements on a single connection:
//! - Row streaming into a [`RowReader`](crate::db::RowReader) channel
//! - Scalar and non-query execution
//! - Transaction control statements
//! - Command timeouts
//!
//! # Architecture
//!
//! The executor uses driver-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific execution
//! - `postgres`: PostgreSQL-specific execution
//! - `sqlite`: SQLite-specific execution
//!
//! Each submodule provides identical functionality adapted to the driver's types.

use crate::db::connection::DbConnection;
use crate::db::reader::DataRow;
use crate::db::types::DecodeRow;
use crate::error::{DbError, DbResult};
use crate::models::DbValue;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

type RowSender = mpsc::Sender<DbResult<DataRow>>;

/// Stream the rows of `sql` into `sender` until the result set ends or the
/// receiving side goes away.
pub(crate) async fn stream_rows(
    conn: &mut DbConnection,
    sql: &str,
    params: &[DbValue],
    query_timeout: Duration,
    sender: &RowSender,
) -> DbResult<()> {
    debug!(
        sql = %sql,
        params = params.len(),
        timeout_secs = query_timeout.as_secs(),
        "Executing reader"
    );

    impl_db_dispatch!(conn, {
        MySql(c) => mysql::stream_rows(c, sql, params, query_timeout, sender).await,
        Postgres(c) => postgres::stream_rows(c, sql, params, query_timeout, sender).await,
        SQLite(c) => sqlite::stream_rows(c, sql, params, query_timeout, sender).await,
    })
}

/// Execute `sql` and return the first column of the first row, or NULL when the
/// statement returns no rows.
pub(crate) async fn execute_scalar(
    conn: &mut DbConnection,
    sql: &str,
    params: &[DbValue],
    query_timeout: Duration,
) -> DbResult<DbValue> {
    let start = Instant::now();
    let value = impl_db_dispatch!(conn, {
        MySql(c) => mysql::execute_scalar(c, sql, params, query_timeout).await?,
        Postgres(c) => postgres::execute_scalar(c, sql, params, query_timeout).await?,
        SQLite(c) => sqlite::execute_scalar(c, sql, params, query_timeout).await?,
    });

    debug!(
        sql = %sql,
        params = params.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Executed scalar"
    );
    Ok(value)
}

/// Execute `sql` and return the number of affected rows.
pub(crate) async fn execute_non_query(
    conn: &mut DbConnection,
    sql: &str,
    params: &[DbValue],
    query_timeout: Duration,
) -> DbResult<u64> {
    let start = Instant::now();
    let rows_affected = impl_db_dispatch!(conn, {
        MySql(c) => mysql::execute_non_query(c, sql, params, query_timeout).await?,
        Postgres(c) => postgres::execute_non_query(c, sql, params, query_timeout).await?,
        SQLite(c) => sqlite::execute_non_query(c, sql, params, query_timeout).await?,
    });

    debug!(
        sql = %sql,
        params = params.len(),
        rows_affected,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Executed non-query"
    );
    Ok(rows_affected)
}

/// Execute a transaction control statement (`BEGIN`, `COMMIT`, `ROLLBACK`).
pub(crate) async fn execute_raw(conn: &mut DbConnection, sql: &str) -> DbResult<()> {
    use sqlx::Executor;

    impl_db_dispatch!(conn, {
        MySql(c) => { c.execute(sql).await?; },
        Postgres(c) => { c.execute(sql).await?; },
        SQLite(c) => { c.execute(sql).await?; },
    });
    Ok(())
}

// =============================================================================
// Common Helper Functions
// =============================================================================

/// Forward rows from a driver stream to a reader channel.
async fn forward_rows<R: DecodeRow>(
    mut stream: BoxStream<'_, Result<R, sqlx::Error>>,
    query_timeout: Duration,
    sender: &RowSender,
) -> DbResult<()> {
    let mut columns: Option<Arc<[String]>> = None;
    let mut count = 0usize;

    loop {
        let next = match timeout(query_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Err(timeout_error("row fetch", query_timeout)),
        };
        let Some(row) = next else {
            debug!(rows = count, "Result set exhausted");
            return Ok(());
        };
        let row = row?;

        let columns = columns
            .get_or_insert_with(|| Arc::from(row.column_names()))
            .clone();
        let data = DataRow::new(columns, row.decode_values());
        count += 1;

        if sender.send(Ok(data)).await.is_err() {
            debug!(rows = count, "Reader closed before the result set was exhausted");
            return Ok(());
        }
    }
}

fn first_column<R: DecodeRow>(row: Option<R>) -> DbValue {
    row.and_then(|r| r.decode_values().into_iter().next())
        .unwrap_or(DbValue::Null)
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs())
}

// =============================================================================
// Driver-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its driver.
// The code structure is intentionally parallel to make differences obvious.

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_param;
    use sqlx::MySqlConnection;

    pub async fn stream_rows(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[DbValue],
        query_timeout: Duration,
        sender: &RowSender,
    ) -> DbResult<()> {
        // When params is empty, use raw SQL to avoid prepared statement issues
        let stream = if params.is_empty() {
            use sqlx::Executor;
            conn.fetch(sql)
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            query.fetch(conn)
        };
        forward_rows(stream, query_timeout, sender).await
    }

    pub async fn execute_scalar(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[DbValue],
        query_timeout: Duration,
    ) -> DbResult<DbValue> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, conn.fetch_optional(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            timeout(query_timeout, query.fetch_optional(conn)).await
        };

        match result {
            Ok(Ok(row)) => Ok(first_column(row)),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("scalar query", query_timeout)),
        }
    }

    pub async fn execute_non_query(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[DbValue],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        // Some statements (CREATE PROCEDURE) can't be prepared
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, conn.execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            timeout(query_timeout, query.execute(conn)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("non-query", query_timeout)),
        }
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_param;
    use sqlx::PgConnection;

    pub async fn stream_rows(
        conn: &mut PgConnection,
        sql: &str,
        params: &[DbValue],
        query_timeout: Duration,
        sender: &RowSender,
    ) -> DbResult<()> {
        let stream = if params.is_empty() {
            use sqlx::Executor;
            conn.fetch(sql)
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            query.fetch(conn)
        };
        forward_rows(stream, query_timeout, sender).await
    }

    pub async fn execute_scalar(
        conn: &mut PgConnection,
        sql: &str,
        params: &[DbValue],
        query_timeout: Duration,
    ) -> DbResult<DbValue> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, conn.fetch_optional(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, query.fetch_optional(conn)).await
        };

        match result {
            Ok(Ok(row)) => Ok(first_column(row)),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("scalar query", query_timeout)),
        }
    }

    pub async fn execute_non_query(
        conn: &mut PgConnection,
        sql: &str,
        params: &[DbValue],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, conn.execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, query.execute(conn)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("non-query", query_timeout)),
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_param;
    use sqlx::SqliteConnection;

    pub async fn stream_rows(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[DbValue],
        query_timeout: Duration,
        sender: &RowSender,
    ) -> DbResult<()> {
        let stream = if params.is_empty() {
            use sqlx::Executor;
            conn.fetch(sql)
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            query.fetch(conn)
        };
        forward_rows(stream, query_timeout, sender).await
    }

    pub async fn execute_scalar(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[DbValue],
        query_timeout: Duration,
    ) -> DbResult<DbValue> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, conn.fetch_optional(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, query.fetch_optional(conn)).await
        };

        match result {
            Ok(Ok(row)) => Ok(first_column(row)),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("scalar query", query_timeout)),
        }
    }

    pub async fn execute_non_query(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[DbValue],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, conn.execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, query.execute(conn)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("non-query", query_timeout)),
        }
    }
}
