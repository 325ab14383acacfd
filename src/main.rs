//! db-access - runs one command against a configured database.
//!
//! Rows are printed to stdout as JSON lines; scalar and non-query results as a
//! single JSON value.

use clap::Parser;
use db_access_block::config::{Config, Mode};
use db_access_block::db::{AsyncOptions, Database, ExecutionTarget, PositionalParameterMapper};
use db_access_block::db::{ParameterMapper, RowReader};
use db_access_block::factory::DatabaseProviderFactory;
use db_access_block::models::{Command, CommandType, DbValue};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Interpret a command line value: integer, float, boolean, `null`, else text.
fn parse_value(raw: &str) -> DbValue {
    if raw.eq_ignore_ascii_case("null") {
        DbValue::Null
    } else if let Ok(v) = raw.parse::<i64>() {
        DbValue::Int(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        DbValue::Float(v)
    } else if let Ok(v) = raw.parse::<bool>() {
        DbValue::Bool(v)
    } else {
        DbValue::String(raw.to_string())
    }
}

fn build_command(database: &Arc<Database>, config: &Config) -> Result<Command, Box<dyn std::error::Error>> {
    let command_type = if config.procedure {
        CommandType::StoredProcedure
    } else {
        CommandType::Text
    };
    let mut command = database.create_command(command_type, &config.command)?;
    let values: Vec<DbValue> = config.params.iter().map(|p| parse_value(p)).collect();
    PositionalParameterMapper::new(Arc::clone(database)).assign_parameters(&mut command, &values)?;
    if let Some(timeout) = config.timeout_duration() {
        command.set_timeout(timeout);
    }
    Ok(command)
}

async fn print_rows(mut reader: RowReader) -> Result<(), Box<dyn std::error::Error>> {
    let mut count = 0usize;
    while let Some(row) = reader.read().await? {
        println!("{}", serde_json::Value::Object(row.to_json_map()));
        count += 1;
    }
    info!(rows = count, "Reader finished");
    Ok(())
}

async fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let factory = DatabaseProviderFactory::from_file(&config.config)?;
    let database = match &config.database {
        Some(name) => factory.create(name)?,
        None => factory.create_default()?,
    };
    let command = build_command(&database, config)?;

    info!(
        database = %database.name(),
        mode = %config.mode,
        asynchronous = config.use_async,
        "Executing command"
    );

    match (config.mode, config.use_async) {
        (Mode::Reader, false) => print_rows(database.execute_reader(&command).await?).await?,
        (Mode::Reader, true) => {
            let result =
                database.begin_execute_reader(&command, ExecutionTarget::Auto, AsyncOptions::default())?;
            print_rows(database.end_execute_reader(result).await?).await?
        }
        (Mode::Scalar, false) => {
            println!("{}", database.execute_scalar(&command).await?.to_json());
        }
        (Mode::Scalar, true) => {
            let result =
                database.begin_execute_scalar(&command, ExecutionTarget::Auto, AsyncOptions::default())?;
            println!("{}", database.end_execute_scalar(result).await?.to_json());
        }
        (Mode::NonQuery, false) => {
            println!("{}", database.execute_non_query(&command).await?);
        }
        (Mode::NonQuery, true) => {
            let result = database.begin_execute_non_query(
                &command,
                ExecutionTarget::Auto,
                AsyncOptions::default(),
            )?;
            println!("{}", database.end_execute_non_query(result).await?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    if config.enable_logs {
        init_tracing(&config);
    }

    if let Err(e) = run(&config).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        if let Some(suggestion) = e
            .downcast_ref::<db_access_block::DbError>()
            .and_then(|e| e.suggestion())
        {
            eprintln!("Suggestion: {}", suggestion);
        }
        std::process::exit(1);
    }
    Ok(())
}
