//! Configuration handling for the data access block.
//!
//! Two layers:
//! - [`DataConfiguration`]: the JSON document naming databases, connection
//!   strings, provider mappings and Oracle packages.
//! - [`Config`]: command line arguments and environment variables for the
//!   `db-access` binary.

use crate::error::{DbError, DbResult};
use crate::provider::{OraclePackage, ProviderMapping, SQL_CLIENT};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONFIG_FILE: &str = "dataconfiguration.json";

/// The `dataConfiguration` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Name of the connection string used by `create_default`.
    pub default_database: Option<String>,
    /// Command timeout applied when a command sets none.
    pub command_timeout_secs: Option<u64>,
    pub provider_mappings: Vec<ProviderMapping>,
}

/// One entry of the `connectionStrings` section.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStringSettings {
    pub name: String,
    /// Sensitive; never logged as is.
    pub connection_string: String,
    /// Defaults to `System.Data.SqlClient`.
    #[serde(default)]
    pub provider_name: Option<String>,
}

impl ConnectionStringSettings {
    pub fn new(
        name: impl Into<String>,
        connection_string: impl Into<String>,
        provider_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
            provider_name: Some(provider_name.into()),
        }
    }

    pub fn provider_name_or_default(&self) -> &str {
        self.provider_name
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(SQL_CLIENT)
    }
}

impl std::fmt::Debug for ConnectionStringSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStringSettings")
            .field("name", &self.name)
            .field("connection_string", &"<redacted>")
            .field("provider_name", &self.provider_name)
            .finish()
    }
}

/// One entry of the `oracleConnectionSettings` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleConnectionSettings {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<OraclePackage>,
}

/// The data configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataConfiguration {
    pub data_configuration: DatabaseSettings,
    pub connection_strings: Vec<ConnectionStringSettings>,
    pub oracle_connection_settings: Vec<OracleConnectionSettings>,
}

impl DataConfiguration {
    pub fn from_json(json: &str) -> DbResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DbError::configuration(format!("invalid data configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration(format!(
                "failed to read data configuration '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }

    /// Check names are unique (case-insensitive) and values non-empty.
    pub fn validate(&self) -> DbResult<()> {
        let mut names = HashSet::new();
        for entry in &self.connection_strings {
            if entry.name.trim().is_empty() {
                return Err(DbError::configuration("connection string name cannot be empty"));
            }
            if entry.connection_string.trim().is_empty() {
                return Err(DbError::configuration(format!(
                    "connection string '{}' has no value",
                    entry.name
                )));
            }
            if !names.insert(entry.name.to_ascii_lowercase()) {
                return Err(DbError::configuration(format!(
                    "duplicate connection string '{}'",
                    entry.name
                )));
            }
        }

        let mut oracle = HashSet::new();
        for settings in &self.oracle_connection_settings {
            if !oracle.insert(settings.name.to_ascii_lowercase()) {
                return Err(DbError::configuration(format!(
                    "duplicate Oracle connection settings '{}'",
                    settings.name
                )));
            }
            if settings.packages.iter().any(|p| p.name.trim().is_empty()) {
                return Err(DbError::configuration(format!(
                    "Oracle package name cannot be empty for '{}'",
                    settings.name
                )));
            }
            if let Some(package) = settings.packages.iter().find(|p| p.prefix.is_empty()) {
                return Err(DbError::configuration(format!(
                    "Oracle package '{}' of '{}' has an empty prefix; use \"*\" to match every procedure",
                    package.name, settings.name
                )));
            }
        }

        if self.data_configuration.command_timeout_secs == Some(0) {
            return Err(DbError::configuration(
                "commandTimeoutSecs must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn connection_string(&self, name: &str) -> Option<&ConnectionStringSettings> {
        self.connection_strings
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn oracle_packages(&self, name: &str) -> &[OraclePackage] {
        self.oracle_connection_settings
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| s.packages.as_slice())
            .unwrap_or(&[])
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(
            self.data_configuration
                .command_timeout_secs
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        )
    }
}

/// How the binary executes its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Mode {
    /// Stream rows
    #[default]
    Reader,
    /// First column of the first row
    Scalar,
    /// Affected row count
    NonQuery,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reader => write!(f, "reader"),
            Self::Scalar => write!(f, "scalar"),
            Self::NonQuery => write!(f, "non-query"),
        }
    }
}

/// Command line configuration of the `db-access` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-access",
    about = "Run a command against a configured database",
    version,
    author
)]
pub struct Config {
    /// SQL text, or a stored procedure name with --procedure
    #[arg(value_name = "COMMAND")]
    pub command: String,

    /// Data configuration file
    #[arg(
        short,
        long,
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_FILE,
        env = "DB_ACCESS_CONFIG"
    )]
    pub config: PathBuf,

    /// Named database; the configured default when omitted
    #[arg(short, long, env = "DB_ACCESS_DATABASE")]
    pub database: Option<String>,

    /// Execution mode
    #[arg(short, long, value_enum, default_value = "reader", env = "DB_ACCESS_MODE")]
    pub mode: Mode,

    /// Treat COMMAND as a stored procedure name
    #[arg(long)]
    pub procedure: bool,

    /// Use begin/end asynchronous execution
    #[arg(long = "async")]
    pub use_async: bool,

    /// Positional parameter values
    #[arg(short, long = "param", value_name = "VALUE")]
    pub params: Vec<String>,

    /// Command timeout in seconds; overrides the configured value
    #[arg(long, env = "DB_ACCESS_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DB_ACCESS_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DB_ACCESS_JSON_LOGS")]
    pub json_logs: bool,

    /// Enable logging output (disabled by default to keep stdout clean)
    #[arg(long, env = "DB_ACCESS_ENABLE_LOGS")]
    pub enable_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            command: String::new(),
            config: PathBuf::from(DEFAULT_CONFIG_FILE),
            database: None,
            mode: Mode::Reader,
            procedure: false,
            use_async: false,
            params: Vec::new(),
            timeout: None,
            log_level: "info".to_string(),
            json_logs: false,
            enable_logs: false,
        }
    }

    /// The command timeout override as a Duration.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DatabaseKind;

    const NORTHWIND: &str = r#"{
        "dataConfiguration": {
            "defaultDatabase": "Northwind",
            "providerMappings": [
                { "name": "Custom.Provider", "databaseType": "oracle" }
            ]
        },
        "connectionStrings": [
            {
                "name": "Northwind",
                "connectionString": "Server=.;Database=Northwind;Trusted_Connection=True",
                "providerName": "System.Data.SqlClient"
            },
            { "name": "Local", "connectionString": "sqlite::memory:" }
        ],
        "oracleConnectionSettings": [
            { "name": "Sales", "packages": [ { "name": "SALES_PKG", "prefix": "Get" } ] }
        ]
    }"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mode, Mode::Reader);
        assert_eq!(config.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(config.timeout_duration().is_none());
    }

    #[test]
    fn test_cli_parsing() {
        let config = Config::try_parse_from([
            "db-access",
            "GetOrders",
            "--procedure",
            "--mode",
            "non-query",
            "-p",
            "1",
            "-p",
            "ALFKI",
            "--timeout",
            "5",
        ])
        .unwrap();
        assert!(config.procedure);
        assert_eq!(config.mode, Mode::NonQuery);
        assert_eq!(config.params, vec!["1", "ALFKI"]);
        assert_eq!(config.timeout_duration(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_data_configuration() {
        let config = DataConfiguration::from_json(NORTHWIND).unwrap();
        assert_eq!(
            config.data_configuration.default_database.as_deref(),
            Some("Northwind")
        );
        assert_eq!(
            config.data_configuration.provider_mappings[0].database_type,
            DatabaseKind::Oracle
        );
        assert_eq!(
            config.connection_string("northwind").unwrap().provider_name_or_default(),
            SQL_CLIENT
        );
        // No provider given
        assert_eq!(
            config.connection_string("Local").unwrap().provider_name_or_default(),
            SQL_CLIENT
        );
        assert_eq!(config.oracle_packages("SALES")[0].name, "SALES_PKG");
        assert!(config.oracle_packages("Northwind").is_empty());
        assert_eq!(
            config.command_timeout(),
            Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_duplicate_connection_string_rejected() {
        let json = r#"{
            "connectionStrings": [
                { "name": "Main", "connectionString": "sqlite::memory:" },
                { "name": "MAIN", "connectionString": "sqlite::memory:" }
            ]
        }"#;
        assert!(DataConfiguration::from_json(json).unwrap_err().is_configuration());
    }

    #[test]
    fn test_empty_connection_string_rejected() {
        let json = r#"{ "connectionStrings": [ { "name": "Main", "connectionString": " " } ] }"#;
        assert!(DataConfiguration::from_json(json).unwrap_err().is_configuration());
    }

    #[test]
    fn test_oracle_package_prefix_is_required() {
        let missing = r#"{
            "oracleConnectionSettings": [ { "name": "Sales", "packages": [ { "name": "SALES_PKG" } ] } ]
        }"#;
        assert!(DataConfiguration::from_json(missing).unwrap_err().is_configuration());

        let empty = r#"{
            "oracleConnectionSettings": [
                { "name": "Sales", "packages": [ { "name": "SALES_PKG", "prefix": "" } ] }
            ]
        }"#;
        let err = DataConfiguration::from_json(empty).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("SALES_PKG"));

        let all = r#"{
            "oracleConnectionSettings": [
                { "name": "Sales", "packages": [ { "name": "SALES_PKG", "prefix": "*" } ] }
            ]
        }"#;
        assert!(DataConfiguration::from_json(all).is_ok());
    }

    #[test]
    fn test_malformed_json_is_configuration_error() {
        assert!(DataConfiguration::from_json("{").unwrap_err().is_configuration());
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = DataConfiguration::from_file("/nonexistent/dataconfiguration.json").unwrap_err();
        assert!(err.is_configuration());
    }
}
