//! Database access layer.
//!
//! This module provides the data access block:
//! - Reference-counted connections shared between commands and readers
//! - Command execution (reader, scalar, non-query) with sync and begin/end forms
//! - Explicit and ambient transactions
//! - Accessors mapping result sets to typed values
//! - Type mappings and database dispatch macros

#[macro_use]
pub mod macros;
pub mod accessor;
pub mod async_result;
pub mod connection;
pub mod database;
pub mod executor;
pub mod params;
pub mod reader;
pub mod transaction;
pub mod types;
pub mod wrapper;

pub use accessor::{
    CommandAccessor, DefaultResultSetMapper, ParameterMapper, PositionalParameterMapper,
    ResultSetMapper, RowMapper, SerdeRowMapper,
};
pub use async_result::{AsyncCallback, AsyncOptions, AsyncResult, AsyncState, CompletionInfo, WaitHandle};
pub use connection::{DbConnection, ManagedConnection};
pub use database::{Database, ExecutionTarget};
pub use reader::{DataRow, RowReader};
pub use transaction::{DbTransaction, TransactionScope};
pub use wrapper::{ConnectionGuard, ConnectionWrapper, ReleaseOutcome, SharedConnection};
