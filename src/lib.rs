//! Data Access Library
//!
//! Provider-agnostic database access: commands, readers, transactions and
//! asynchronous execution over reference-counted connections, with databases
//! resolved by name from configuration.

pub mod config;
pub mod db;
pub mod error;
pub mod factory;
pub mod models;
pub mod provider;

pub use config::{Config, DataConfiguration};
pub use db::{
    AsyncOptions, AsyncResult, CommandAccessor, ConnectionWrapper, DataRow, Database,
    DbTransaction, ExecutionTarget, RowReader, SharedConnection, TransactionScope,
};
pub use error::{DbError, DbResult};
pub use factory::{DatabaseFactory, DatabaseProviderFactory};
pub use models::{Command, CommandType, DbType, DbValue};
pub use provider::DatabaseKind;
