//! Provider registry.
//!
//! A provider name (for example `System.Data.SqlClient`) selects a [`DatabaseKind`]:
//! the dialect and capability set a [`Database`](crate::db::Database) is built with.
//! Which physical driver opens the connection is decided separately, from the
//! connection string (see [`DatabaseType`](crate::models::DatabaseType)).

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SQL_CLIENT: &str = "System.Data.SqlClient";
pub const SQL_CE: &str = "System.Data.SqlServerCe.4.0";
pub const SQL_CE_35: &str = "System.Data.SqlServerCe.3.5";
pub const ORACLE_CLIENT: &str = "System.Data.OracleClient";
pub const ODBC: &str = "System.Data.Odbc";
pub const OLE_DB: &str = "System.Data.OleDb";
pub const POSTGRESQL: &str = "PostgreSQL";
pub const MYSQL: &str = "MySQL";
pub const SQLITE: &str = "SQLite";

/// Package prefix that matches every stored procedure name.
pub const ALL_PREFIX: &str = "*";

/// The concrete database flavor a provider maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    /// SQL Server
    Sql,
    /// SQL Server Compact
    SqlCe,
    Oracle,
    /// Any other provider; names and statements are passed through untouched.
    Generic,
}

impl DatabaseKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Sql => "SqlDatabase",
            Self::SqlCe => "SqlCeDatabase",
            Self::Oracle => "OracleDatabase",
            Self::Generic => "GenericDatabase",
        }
    }

    /// Prefix character prepended to parameter names, if the dialect uses one.
    pub fn parameter_token(&self) -> Option<char> {
        match self {
            Self::Sql | Self::SqlCe => Some('@'),
            Self::Oracle => Some(':'),
            Self::Generic => None,
        }
    }

    /// Whether the dialect supports begin/end asynchronous execution.
    pub fn supports_async(&self) -> bool {
        matches!(self, Self::Sql)
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Capability flags a database is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub supports_async: bool,
    pub parameter_token: Option<char>,
}

impl ProviderCapabilities {
    /// The capabilities a kind has when nothing else is known about the provider.
    pub fn for_kind(kind: DatabaseKind) -> Self {
        Self {
            supports_async: kind.supports_async(),
            parameter_token: kind.parameter_token(),
        }
    }
}

/// A provider name mapped to a database kind, from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMapping {
    pub name: String,
    pub database_type: DatabaseKind,
}

/// Maps a stored procedure name prefix to an Oracle package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OraclePackage {
    pub name: String,
    /// Required; [`ALL_PREFIX`] matches every procedure.
    pub prefix: String,
}

impl OraclePackage {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
        }
    }

    fn matches(&self, procedure: &str) -> bool {
        self.prefix == ALL_PREFIX || procedure.starts_with(&self.prefix)
    }
}

/// Qualify a stored procedure name with the first package whose prefix matches.
pub fn qualify_procedure_name(packages: &[OraclePackage], procedure: &str) -> String {
    match packages.iter().find(|p| p.matches(procedure)) {
        Some(package) if !package.name.is_empty() => format!("{}.{}", package.name, procedure),
        _ => procedure.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
struct ProviderEntry {
    kind: DatabaseKind,
    supports_async: bool,
}

/// Built-in providers: (name, kind, async capable).
///
/// The sqlx-backed providers are asynchronous by nature, so they keep async even
/// though the generic kind does not have it by default.
const BUILT_IN_PROVIDERS: &[(&str, DatabaseKind, bool)] = &[
    (SQL_CLIENT, DatabaseKind::Sql, true),
    (SQL_CE, DatabaseKind::SqlCe, false),
    (SQL_CE_35, DatabaseKind::SqlCe, false),
    (ORACLE_CLIENT, DatabaseKind::Oracle, false),
    (ODBC, DatabaseKind::Generic, false),
    (OLE_DB, DatabaseKind::Generic, false),
    (POSTGRESQL, DatabaseKind::Generic, true),
    (MYSQL, DatabaseKind::Generic, true),
    (SQLITE, DatabaseKind::Generic, true),
];

/// Resolves provider names to kinds and capabilities.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderEntry>,
}

impl ProviderRegistry {
    /// A registry holding only the built-in providers.
    pub fn new() -> Self {
        let providers = BUILT_IN_PROVIDERS
            .iter()
            .map(|(name, kind, supports_async)| {
                (
                    name.to_ascii_lowercase(),
                    ProviderEntry {
                        kind: *kind,
                        supports_async: *supports_async,
                    },
                )
            })
            .collect();
        Self { providers }
    }

    /// A registry with configured mappings layered over the built-ins.
    ///
    /// A mapping for a built-in provider replaces its kind; async support is then
    /// taken from the mapped kind. Duplicate mapping names are a configuration error.
    pub fn with_mappings(mappings: &[ProviderMapping]) -> DbResult<Self> {
        let mut registry = Self::new();
        let mut seen = std::collections::HashSet::new();
        for mapping in mappings {
            let key = mapping.name.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(DbError::configuration("provider mapping name cannot be empty"));
            }
            if !seen.insert(key.clone()) {
                return Err(DbError::configuration(format!(
                    "duplicate provider mapping '{}'",
                    mapping.name
                )));
            }
            registry.providers.insert(
                key,
                ProviderEntry {
                    kind: mapping.database_type,
                    supports_async: mapping.database_type.supports_async(),
                },
            );
        }
        Ok(registry)
    }

    /// Resolve a provider name (case-insensitive).
    pub fn resolve(&self, provider_name: &str) -> DbResult<(DatabaseKind, ProviderCapabilities)> {
        let entry = self
            .providers
            .get(&provider_name.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                DbError::configuration(format!(
                    "no database type is mapped to provider '{}' and no built-in default applies",
                    provider_name
                ))
            })?;
        Ok((
            entry.kind,
            ProviderCapabilities {
                supports_async: entry.supports_async,
                parameter_token: entry.kind.parameter_token(),
            },
        ))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
