//! Integration tests for configuration-driven database resolution.
//!
//! The process-wide factory is exercised by a single test so that parallel tests
//! never observe each other's installs.

use db_access_block::DbError;
use db_access_block::config::DataConfiguration;
use db_access_block::factory::{DatabaseFactory, DatabaseProviderFactory};
use db_access_block::models::{CommandType, DbValue};
use db_access_block::provider::DatabaseKind;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

const NORTHWIND: &str = r#"{
    "dataConfiguration": { "defaultDatabase": "Northwind" },
    "connectionStrings": [
        {
            "name": "Northwind",
            "connectionString": "Server=.;Database=Northwind;Trusted_Connection=True",
            "providerName": "System.Data.SqlClient"
        },
        {
            "name": "Local",
            "connectionString": "sqlite::memory:",
            "providerName": "SQLite"
        }
    ]
}"#;

#[test]
fn test_create_default_northwind() {
    let factory = DatabaseProviderFactory::from_json(NORTHWIND).unwrap();
    let db = factory.create_default().unwrap();

    assert_eq!(db.name(), "Northwind");
    assert_eq!(db.kind(), DatabaseKind::Sql);
    assert!(db.supports_async());
    let cs = db.connection_string();
    assert_eq!(cs.get("Server").as_deref(), Some("."));
    assert_eq!(cs.get("database").as_deref(), Some("Northwind"));
    assert_eq!(cs.get("Trusted_Connection").as_deref(), Some("True"));
}

#[test]
fn test_missing_default_is_configuration_error() {
    let factory = DatabaseProviderFactory::from_json(
        r#"{ "connectionStrings": [ { "name": "Local", "connectionString": "sqlite::memory:" } ] }"#,
    )
    .unwrap();
    assert!(factory.create_default().unwrap_err().is_configuration());
}

#[test]
fn test_missing_named_connection_string_is_configuration_error() {
    let factory = DatabaseProviderFactory::from_json(NORTHWIND).unwrap();
    let err = factory.create("Pubs").unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("Pubs"));
}

#[test]
fn test_malformed_connection_string_is_configuration_error() {
    let factory = DatabaseProviderFactory::from_json(
        r#"{ "connectionStrings": [ { "name": "Bad", "connectionString": "postgres://[::1" } ] }"#,
    )
    .unwrap();
    assert!(factory.create("Bad").unwrap_err().is_configuration());
}

#[tokio::test]
async fn test_from_file_and_execute() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(NORTHWIND.as_bytes()).unwrap();

    let factory = DatabaseProviderFactory::from_file(file.path()).unwrap();
    let db = factory.create("local").unwrap();
    assert_eq!(db.kind(), DatabaseKind::Generic);

    let value = db
        .execute_scalar_sql(CommandType::Text, "SELECT 'ok'")
        .await
        .unwrap();
    assert_eq!(value, DbValue::from("ok"));
}

#[test]
fn test_global_factory_lifecycle() {
    DatabaseFactory::clear();
    assert!(!DatabaseFactory::is_set());
    assert!(matches!(
        DatabaseFactory::create_database(),
        Err(DbError::FactoryNotSet)
    ));

    let factory = DatabaseProviderFactory::from_json(NORTHWIND).unwrap();
    DatabaseFactory::set_provider_factory(factory, true).unwrap();
    assert_eq!(DatabaseFactory::create_database().unwrap().name(), "Northwind");
    assert_eq!(
        DatabaseFactory::create_named_database("Local").unwrap().kind(),
        DatabaseKind::Generic
    );

    // A second install with throw_if_set fails and keeps the first.
    let again = DatabaseProviderFactory::from_json(NORTHWIND).unwrap();
    assert!(matches!(
        DatabaseFactory::set_provider_factory(again, true),
        Err(DbError::FactoryAlreadySet)
    ));
    assert_eq!(DatabaseFactory::create_database().unwrap().name(), "Northwind");

    // Without throw_if_set the install replaces silently.
    let local = DatabaseProviderFactory::from_json(NORTHWIND).unwrap();
    let local = Arc::new(local);
    let named = Arc::clone(&local);
    DatabaseFactory::set_databases(
        move || local.create("Local"),
        move |name| named.create(name),
        false,
    )
    .unwrap();
    assert_eq!(DatabaseFactory::create_database().unwrap().name(), "Local");

    DatabaseFactory::clear();
    assert!(matches!(
        DatabaseFactory::create_database(),
        Err(DbError::FactoryNotSet)
    ));
    assert!(matches!(
        DatabaseFactory::create_named_database("Northwind"),
        Err(DbError::FactoryNotSet)
    ));
}
