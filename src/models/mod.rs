//! Data models for the data access block.
//!
//! This module re-exports all model types used throughout the crate.

pub mod command;
pub mod connection;
pub mod connection_string;
pub mod value;

// Re-export commonly used types
pub use command::{Command, CommandType, DbType, Parameter, ParameterDirection};
pub use connection::{DatabaseType, TransactionState};
pub use connection_string::ConnectionString;
pub use value::DbValue;
