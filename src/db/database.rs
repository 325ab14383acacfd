//! The database execution surface.
//!
//! A [`Database`] is bound to one connection string and a provider capability
//! set. It owns no connections: each operation leases one, from (in order) an
//! explicit transaction or caller connection, the ambient transaction scope, or
//! a freshly opened connection that is closed when the operation (or the reader
//! it returned) is done.

use crate::config::DEFAULT_COMMAND_TIMEOUT_SECS;
use crate::db::async_result::{AsyncOptions, AsyncResult, Completion, release_on_error};
use crate::db::connection::{DbConnection, driver_for};
use crate::db::executor;
use crate::db::reader::RowReader;
use crate::db::transaction::{DbTransaction, ScopeState, ambient_scope};
use crate::db::wrapper::{ConnectionWrapper, SharedConnection};
use crate::error::{DbError, DbResult};
use crate::models::{
    Command, CommandType, ConnectionString, DatabaseType, DbType, DbValue, Parameter,
    ParameterDirection,
};
use crate::provider::{
    DatabaseKind, OraclePackage, ProviderCapabilities, ProviderRegistry, qualify_procedure_name,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Where an operation runs.
#[derive(Debug, Clone, Copy, Default)]
pub enum ExecutionTarget<'a> {
    /// The ambient transaction if one is active, otherwise a new connection.
    #[default]
    Auto,
    /// Inside an explicit transaction.
    Transaction(&'a DbTransaction),
    /// On a connection the caller holds open.
    Connection(&'a SharedConnection),
}

impl ExecutionTarget<'_> {
    fn caller_connection(&self) -> Option<SharedConnection> {
        match self {
            Self::Auto => None,
            Self::Transaction(tx) => Some(Arc::clone(tx.connection())),
            Self::Connection(c) => Some(Arc::clone(c)),
        }
    }
}

/// A provider-bound database.
#[derive(Debug, Clone)]
pub struct Database {
    name: String,
    provider_name: String,
    kind: DatabaseKind,
    capabilities: ProviderCapabilities,
    connection_string: ConnectionString,
    oracle_packages: Vec<OraclePackage>,
    command_timeout: Duration,
}

impl Database {
    pub fn new(
        name: impl Into<String>,
        provider_name: impl Into<String>,
        kind: DatabaseKind,
        capabilities: ProviderCapabilities,
        connection_string: ConnectionString,
    ) -> Self {
        Self {
            name: name.into(),
            provider_name: provider_name.into(),
            kind,
            capabilities,
            connection_string,
            oracle_packages: Vec::new(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    /// Build a database for a built-in provider name.
    pub fn for_provider(
        name: impl Into<String>,
        provider_name: &str,
        connection_string: &str,
    ) -> DbResult<Self> {
        let (kind, capabilities) = ProviderRegistry::new().resolve(provider_name)?;
        let connection_string = ConnectionString::parse(connection_string)?;
        Ok(Self::new(
            name,
            provider_name,
            kind,
            capabilities,
            connection_string,
        ))
    }

    pub fn with_oracle_packages(mut self, packages: Vec<OraclePackage>) -> Self {
        self.oracle_packages = packages;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    pub fn supports_async(&self) -> bool {
        self.capabilities.supports_async
    }

    pub fn connection_string(&self) -> &ConnectionString {
        &self.connection_string
    }

    pub fn oracle_packages(&self) -> &[OraclePackage] {
        &self.oracle_packages
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    // =========================================================================
    // Connections and commands
    // =========================================================================

    /// Open a new connection. The caller holds its only reference and releases
    /// it when done.
    pub async fn create_connection(&self) -> DbResult<SharedConnection> {
        let connection = DbConnection::open(&self.connection_string).await?;
        debug!(database = %self.name, "Connection created");
        Ok(ConnectionWrapper::new(connection))
    }

    /// Open a connection and start a local transaction on it.
    pub async fn begin_transaction(&self) -> DbResult<DbTransaction> {
        DbTransaction::begin(&self.connection_string).await
    }

    pub fn create_command(&self, command_type: CommandType, text: &str) -> DbResult<Command> {
        Command::new(command_type, text)
    }

    pub fn get_sql_string_command(&self, sql: &str) -> DbResult<Command> {
        Command::new(CommandType::Text, sql)
    }

    pub fn get_stored_proc_command(&self, procedure: &str) -> DbResult<Command> {
        Command::new(CommandType::StoredProcedure, procedure)
    }

    /// Prefix a parameter name with the provider's token unless it has one.
    pub fn build_parameter_name(&self, name: &str) -> String {
        match self.capabilities.parameter_token {
            Some(token) if !name.starts_with(token) => format!("{}{}", token, name),
            _ => name.to_string(),
        }
    }

    pub fn add_parameter(
        &self,
        command: &mut Command,
        name: &str,
        db_type: DbType,
        direction: ParameterDirection,
        value: impl Into<DbValue>,
    ) -> DbResult<()> {
        command.push_parameter(Parameter {
            name: self.build_parameter_name(name),
            db_type,
            direction,
            value: value.into(),
            size: None,
        })
    }

    pub fn add_in_parameter(
        &self,
        command: &mut Command,
        name: &str,
        db_type: DbType,
        value: impl Into<DbValue>,
    ) -> DbResult<()> {
        self.add_parameter(command, name, db_type, ParameterDirection::Input, value)
    }

    /// Add an output parameter. Its value stays NULL: the drivers in use return
    /// results as rows, not through output parameters.
    pub fn add_out_parameter(
        &self,
        command: &mut Command,
        name: &str,
        db_type: DbType,
        size: u32,
    ) -> DbResult<()> {
        command.push_parameter(Parameter {
            name: self.build_parameter_name(name),
            db_type,
            direction: ParameterDirection::Output,
            value: DbValue::Null,
            size: Some(size),
        })
    }

    pub fn get_parameter_value(&self, command: &Command, name: &str) -> DbResult<DbValue> {
        let name = self.build_parameter_name(name);
        command
            .parameter(&name)
            .map(|p| p.value.clone())
            .ok_or_else(|| missing_parameter(&name))
    }

    pub fn set_parameter_value(
        &self,
        command: &mut Command,
        name: &str,
        value: impl Into<DbValue>,
    ) -> DbResult<()> {
        let name = self.build_parameter_name(name);
        let parameter = command
            .parameter_mut(&name)
            .ok_or_else(|| missing_parameter(&name))?;
        parameter.value = value.into();
        Ok(())
    }

    /// The statement sent to `driver` for `command`.
    pub fn statement_for(&self, command: &Command, driver: DatabaseType) -> String {
        match command.command_type() {
            CommandType::Text => command.text().to_string(),
            CommandType::StoredProcedure => {
                let procedure = match self.kind {
                    DatabaseKind::Oracle => {
                        qualify_procedure_name(&self.oracle_packages, command.text())
                    }
                    _ => command.text().to_string(),
                };
                let inputs = command
                    .parameters()
                    .iter()
                    .filter(|p| p.direction.is_input())
                    .count();
                driver.call_statement(&procedure, inputs)
            }
            CommandType::TableDirect => format!("SELECT * FROM {}", command.text()),
        }
    }

    /// Fail unless this provider supports asynchronous execution. No I/O.
    pub fn guard_async_allowed(&self) -> DbResult<()> {
        if self.capabilities.supports_async {
            Ok(())
        } else {
            Err(DbError::async_not_supported(self.kind.display_name()))
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute `command` and stream its rows.
    ///
    /// The reader holds the connection until it is exhausted, closed or dropped.
    /// A connection opened for this call is closed at that point; a caller's
    /// connection stays open.
    pub async fn execute_reader(&self, command: &Command) -> DbResult<RowReader> {
        self.execute_reader_with(command, ExecutionTarget::Auto)
            .await
    }

    pub async fn execute_reader_in(
        &self,
        command: &Command,
        transaction: &DbTransaction,
    ) -> DbResult<RowReader> {
        self.execute_reader_with(command, ExecutionTarget::Transaction(transaction))
            .await
    }

    pub async fn execute_reader_on(
        &self,
        command: &Command,
        connection: &SharedConnection,
    ) -> DbResult<RowReader> {
        self.execute_reader_with(command, ExecutionTarget::Connection(connection))
            .await
    }

    pub async fn execute_reader_sql(
        &self,
        command_type: CommandType,
        text: &str,
    ) -> DbResult<RowReader> {
        let command = self.create_command(command_type, text)?;
        self.execute_reader(&command).await
    }

    pub async fn execute_reader_with(
        &self,
        command: &Command,
        target: ExecutionTarget<'_>,
    ) -> DbResult<RowReader> {
        let execution = self.prepare(command, target)?;
        let owned = execution.owns_lease();
        end_sync(execution.reader().await, owned).await
    }

    /// Execute `command` and return the first column of the first row.
    pub async fn execute_scalar(&self, command: &Command) -> DbResult<DbValue> {
        self.execute_scalar_with(command, ExecutionTarget::Auto)
            .await
    }

    pub async fn execute_scalar_in(
        &self,
        command: &Command,
        transaction: &DbTransaction,
    ) -> DbResult<DbValue> {
        self.execute_scalar_with(command, ExecutionTarget::Transaction(transaction))
            .await
    }

    pub async fn execute_scalar_on(
        &self,
        command: &Command,
        connection: &SharedConnection,
    ) -> DbResult<DbValue> {
        self.execute_scalar_with(command, ExecutionTarget::Connection(connection))
            .await
    }

    pub async fn execute_scalar_sql(
        &self,
        command_type: CommandType,
        text: &str,
    ) -> DbResult<DbValue> {
        let command = self.create_command(command_type, text)?;
        self.execute_scalar(&command).await
    }

    pub async fn execute_scalar_with(
        &self,
        command: &Command,
        target: ExecutionTarget<'_>,
    ) -> DbResult<DbValue> {
        let execution = self.prepare(command, target)?;
        let owned = execution.owns_lease();
        end_sync(execution.scalar().await, owned).await
    }

    /// Execute `command` and return the number of affected rows.
    pub async fn execute_non_query(&self, command: &Command) -> DbResult<u64> {
        self.execute_non_query_with(command, ExecutionTarget::Auto)
            .await
    }

    pub async fn execute_non_query_in(
        &self,
        command: &Command,
        transaction: &DbTransaction,
    ) -> DbResult<u64> {
        self.execute_non_query_with(command, ExecutionTarget::Transaction(transaction))
            .await
    }

    pub async fn execute_non_query_on(
        &self,
        command: &Command,
        connection: &SharedConnection,
    ) -> DbResult<u64> {
        self.execute_non_query_with(command, ExecutionTarget::Connection(connection))
            .await
    }

    pub async fn execute_non_query_sql(
        &self,
        command_type: CommandType,
        text: &str,
    ) -> DbResult<u64> {
        let command = self.create_command(command_type, text)?;
        self.execute_non_query(&command).await
    }

    pub async fn execute_non_query_with(
        &self,
        command: &Command,
        target: ExecutionTarget<'_>,
    ) -> DbResult<u64> {
        let execution = self.prepare(command, target)?;
        let owned = execution.owns_lease();
        end_sync(execution.non_query().await, owned).await
    }

    // =========================================================================
    // Asynchronous begin/end
    // =========================================================================

    /// Start reading `command` in the background.
    ///
    /// Fails with [`DbError::AsyncNotSupported`] before any I/O when the
    /// provider has no async support.
    pub fn begin_execute_reader(
        &self,
        command: &Command,
        target: ExecutionTarget<'_>,
        options: AsyncOptions,
    ) -> DbResult<AsyncResult<RowReader>> {
        self.begin(command, target, false, options, Execution::reader)
    }

    pub fn begin_execute_reader_sql(
        &self,
        command_type: CommandType,
        text: &str,
        options: AsyncOptions,
    ) -> DbResult<AsyncResult<RowReader>> {
        self.guard_async_allowed()?;
        let command = self.create_command(command_type, text)?;
        self.begin(&command, ExecutionTarget::Auto, true, options, Execution::reader)
    }

    pub async fn end_execute_reader(&self, result: AsyncResult<RowReader>) -> DbResult<RowReader> {
        result.finish().await
    }

    pub fn begin_execute_scalar(
        &self,
        command: &Command,
        target: ExecutionTarget<'_>,
        options: AsyncOptions,
    ) -> DbResult<AsyncResult<DbValue>> {
        self.begin(command, target, false, options, Execution::scalar)
    }

    pub fn begin_execute_scalar_sql(
        &self,
        command_type: CommandType,
        text: &str,
        options: AsyncOptions,
    ) -> DbResult<AsyncResult<DbValue>> {
        self.guard_async_allowed()?;
        let command = self.create_command(command_type, text)?;
        self.begin(&command, ExecutionTarget::Auto, true, options, Execution::scalar)
    }

    pub async fn end_execute_scalar(&self, result: AsyncResult<DbValue>) -> DbResult<DbValue> {
        result.finish().await
    }

    pub fn begin_execute_non_query(
        &self,
        command: &Command,
        target: ExecutionTarget<'_>,
        options: AsyncOptions,
    ) -> DbResult<AsyncResult<u64>> {
        self.begin(command, target, false, options, Execution::non_query)
    }

    pub fn begin_execute_non_query_sql(
        &self,
        command_type: CommandType,
        text: &str,
        options: AsyncOptions,
    ) -> DbResult<AsyncResult<u64>> {
        self.guard_async_allowed()?;
        let command = self.create_command(command_type, text)?;
        self.begin(&command, ExecutionTarget::Auto, true, options, Execution::non_query)
    }

    pub async fn end_execute_non_query(&self, result: AsyncResult<u64>) -> DbResult<u64> {
        result.finish().await
    }

    fn begin<T, F, Fut>(
        &self,
        command: &Command,
        target: ExecutionTarget<'_>,
        dispose_command: bool,
        options: AsyncOptions,
        operation: F,
    ) -> DbResult<AsyncResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(Execution) -> Fut,
        Fut: Future<Output = DbResult<Completion<T>>> + Send + 'static,
    {
        self.guard_async_allowed()?;
        let execution = self.prepare(command, target)?;
        let close_connection = execution.owns_lease();
        debug!(
            database = %self.name,
            command = %command.text(),
            "Beginning asynchronous execution"
        );
        AsyncResult::spawn(
            operation(execution),
            command.clone(),
            dispose_command,
            close_connection,
            target.caller_connection(),
            options,
        )
    }

    /// Resolve everything an execution needs without doing any I/O.
    fn prepare(&self, command: &Command, target: ExecutionTarget<'_>) -> DbResult<Execution> {
        let driver = driver_for(&self.connection_string)?;
        let source = match target {
            ExecutionTarget::Transaction(tx) => {
                if !tx.state().is_active() {
                    return Err(DbError::transaction("transaction is not active", tx.id()));
                }
                LeaseSource::Shared(Arc::clone(tx.connection()))
            }
            ExecutionTarget::Connection(c) => LeaseSource::Shared(Arc::clone(c)),
            ExecutionTarget::Auto => match ambient_scope() {
                Some(scope) => LeaseSource::Ambient(scope),
                None => LeaseSource::Open,
            },
        };

        Ok(Execution {
            connection_string: self.connection_string.clone(),
            statement: self.statement_for(command, driver),
            values: command.input_values()?,
            timeout: command.timeout().unwrap_or(self.command_timeout),
            source,
        })
    }
}

fn missing_parameter(name: &str) -> DbError {
    DbError::invalid_argument(
        "parameter_name",
        format!("the command has no parameter named '{}'", name),
    )
}

/// Give back the lease of a completed operation that owns one.
async fn end_sync<T>(completion: DbResult<Completion<T>>, owned: bool) -> DbResult<T> {
    let completion = completion?;
    if owned {
        completion.connection.release().await;
    }
    Ok(completion.value)
}

// =============================================================================
// Execution plan
// =============================================================================

enum LeaseSource {
    /// Open a connection for this operation only.
    Open,
    /// Enlist in the ambient transaction scope.
    Ambient(Arc<ScopeState>),
    /// Use a connection the caller holds; the caller keeps its reference.
    Shared(SharedConnection),
}

/// A prepared operation: statement, bound values and where to run it.
pub(crate) struct Execution {
    connection_string: ConnectionString,
    statement: String,
    values: Vec<DbValue>,
    timeout: Duration,
    source: LeaseSource,
}

impl Execution {
    /// Whether the operation holds a reference it must release when done.
    fn owns_lease(&self) -> bool {
        !matches!(self.source, LeaseSource::Shared(_))
    }

    async fn acquire(&self) -> DbResult<SharedConnection> {
        match &self.source {
            LeaseSource::Open => Ok(ConnectionWrapper::new(
                DbConnection::open(&self.connection_string).await?,
            )),
            LeaseSource::Ambient(scope) => scope.connection_for(&self.connection_string).await,
            LeaseSource::Shared(connection) => Ok(Arc::clone(connection)),
        }
    }

    async fn reader(self) -> DbResult<Completion<RowReader>> {
        let owned = self.owns_lease();
        let connection = self.acquire().await?;
        let result = RowReader::open(&connection, self.statement, self.values, self.timeout).await;
        let value = release_on_error(result, &connection, owned).await?;
        Ok(Completion { value, connection })
    }

    async fn scalar(self) -> DbResult<Completion<DbValue>> {
        let owned = self.owns_lease();
        let connection = self.acquire().await?;
        let result = async {
            let mut guard = connection.lock().await?;
            executor::execute_scalar(guard.connection()?, &self.statement, &self.values, self.timeout)
                .await
        }
        .await;
        let value = release_on_error(result, &connection, owned).await?;
        Ok(Completion { value, connection })
    }

    async fn non_query(self) -> DbResult<Completion<u64>> {
        let owned = self.owns_lease();
        let connection = self.acquire().await?;
        let result = async {
            let mut guard = connection.lock().await?;
            executor::execute_non_query(
                guard.connection()?,
                &self.statement,
                &self.values,
                self.timeout,
            )
            .await
        }
        .await;
        let value = release_on_error(result, &connection, owned).await?;
        Ok(Completion { value, connection })
    }
}
