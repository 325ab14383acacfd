//! Driver dispatch macros for reducing code duplication.
//!
//! Each driver has its own connection and row types, so most operations are
//! written once per driver and selected with a `match`. The macro below keeps
//! those matches short while every arm stays readable.

/// Macro for generating [`DbConnection`](crate::db::DbConnection) dispatch match arms.
///
/// Works on owned connections as well as `&` / `&mut` references; the binding
/// follows the scrutinee.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(conn, {
///     MySql(c) => mysql::execute(c, sql).await,
///     Postgres(c) => postgres::execute(c, sql).await,
///     SQLite(c) => sqlite::execute(c, sql).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::connection::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
