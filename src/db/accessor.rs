//! Accessors: commands whose result sets are mapped to typed values.
//!
//! A [`CommandAccessor`] pairs a command (a SQL string or a stored procedure)
//! with a [`ResultSetMapper`]. Executing it yields a lazy stream: rows are read
//! and mapped one at a time, and the reader's connection reference is returned
//! when the stream is exhausted or dropped. The stream is single-pass.

use crate::db::async_result::{AsyncOptions, AsyncResult};
use crate::db::database::{Database, ExecutionTarget};
use crate::db::reader::{DataRow, RowReader};
use crate::error::{DbError, DbResult};
use crate::models::{Command, CommandType, DbType, DbValue};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

/// Converts one row into a domain value.
pub trait RowMapper<T>: Send + Sync {
    fn map_row(&self, row: &DataRow) -> DbResult<T>;
}

impl<T, F> RowMapper<T> for F
where
    F: Fn(&DataRow) -> DbResult<T> + Send + Sync,
{
    fn map_row(&self, row: &DataRow) -> DbResult<T> {
        self(row)
    }
}

/// Maps rows onto any `Deserialize` type by column name.
pub struct SerdeRowMapper<T>(PhantomData<fn() -> T>);

impl<T> SerdeRowMapper<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for SerdeRowMapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> RowMapper<T> for SerdeRowMapper<T> {
    fn map_row(&self, row: &DataRow) -> DbResult<T> {
        serde_json::from_value(serde_json::Value::Object(row.to_json_map()))
            .map_err(|e| DbError::mapping(format!("failed to map row: {}", e)))
    }
}

/// Converts a whole reader into a stream of domain values.
pub trait ResultSetMapper<T>: Send + Sync {
    fn map_set(&self, reader: RowReader) -> BoxStream<'static, DbResult<T>>;
}

/// Applies a row mapper to each row, on demand.
pub struct DefaultResultSetMapper<T> {
    row_mapper: Arc<dyn RowMapper<T>>,
}

impl<T> DefaultResultSetMapper<T> {
    pub fn new(row_mapper: Arc<dyn RowMapper<T>>) -> Self {
        Self { row_mapper }
    }
}

impl<T: Send + 'static> ResultSetMapper<T> for DefaultResultSetMapper<T> {
    fn map_set(&self, reader: RowReader) -> BoxStream<'static, DbResult<T>> {
        let mapper = Arc::clone(&self.row_mapper);
        reader
            .map(move |row| row.and_then(|row| mapper.map_row(&row)))
            .boxed()
    }
}

/// Assigns caller values to the parameters of a command.
pub trait ParameterMapper: Send + Sync {
    fn assign_parameters(&self, command: &mut Command, values: &[DbValue]) -> DbResult<()>;
}

/// Assigns values by position.
///
/// A command without parameters gets one input parameter per value, named
/// `p1`, `p2`, ... with the provider's token. A command with parameters has its
/// input parameters set in order; the counts must match.
pub struct PositionalParameterMapper {
    database: Arc<Database>,
}

impl PositionalParameterMapper {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

impl ParameterMapper for PositionalParameterMapper {
    fn assign_parameters(&self, command: &mut Command, values: &[DbValue]) -> DbResult<()> {
        if command.parameters().is_empty() {
            for (i, value) in values.iter().enumerate() {
                let name = format!("p{}", i + 1);
                self.database
                    .add_in_parameter(command, &name, DbType::Object, value.clone())?;
            }
            return Ok(());
        }

        let names: Vec<String> = command
            .parameters()
            .iter()
            .filter(|p| p.direction.is_input())
            .map(|p| p.name.clone())
            .collect();
        if names.len() != values.len() {
            return Err(DbError::invalid_argument(
                "parameter_values",
                format!(
                    "expected {} parameter values, got {}",
                    names.len(),
                    values.len()
                ),
            ));
        }
        for (name, value) in names.iter().zip(values) {
            self.database
                .set_parameter_value(command, name, value.clone())?;
        }
        Ok(())
    }
}

/// A command whose rows are mapped to `T`.
pub struct CommandAccessor<T> {
    database: Arc<Database>,
    command_type: CommandType,
    text: String,
    parameter_mapper: Option<Arc<dyn ParameterMapper>>,
    result_set_mapper: Arc<dyn ResultSetMapper<T>>,
}

impl<T: Send + 'static> CommandAccessor<T> {
    /// An accessor for a SQL string. Parameter values are rejected unless a
    /// parameter mapper is supplied with [`sql_string_with_mappers`](Self::sql_string_with_mappers).
    pub fn sql_string(
        database: Arc<Database>,
        sql: &str,
        row_mapper: impl RowMapper<T> + 'static,
    ) -> DbResult<Self> {
        let mapper = DefaultResultSetMapper::new(Arc::new(row_mapper));
        Self::sql_string_with_mappers(database, sql, None, Arc::new(mapper))
    }

    pub fn sql_string_with_mappers(
        database: Arc<Database>,
        sql: &str,
        parameter_mapper: Option<Arc<dyn ParameterMapper>>,
        result_set_mapper: Arc<dyn ResultSetMapper<T>>,
    ) -> DbResult<Self> {
        Self::build(
            database,
            CommandType::Text,
            sql,
            parameter_mapper,
            result_set_mapper,
        )
    }

    /// An accessor for a stored procedure, with positional parameters.
    pub fn sproc(
        database: Arc<Database>,
        procedure: &str,
        row_mapper: impl RowMapper<T> + 'static,
    ) -> DbResult<Self> {
        let parameter_mapper = Arc::new(PositionalParameterMapper::new(Arc::clone(&database)));
        let mapper = DefaultResultSetMapper::new(Arc::new(row_mapper));
        Self::sproc_with_mappers(database, procedure, parameter_mapper, Arc::new(mapper))
    }

    pub fn sproc_with_mappers(
        database: Arc<Database>,
        procedure: &str,
        parameter_mapper: Arc<dyn ParameterMapper>,
        result_set_mapper: Arc<dyn ResultSetMapper<T>>,
    ) -> DbResult<Self> {
        Self::build(
            database,
            CommandType::StoredProcedure,
            procedure,
            Some(parameter_mapper),
            result_set_mapper,
        )
    }

    fn build(
        database: Arc<Database>,
        command_type: CommandType,
        text: &str,
        parameter_mapper: Option<Arc<dyn ParameterMapper>>,
        result_set_mapper: Arc<dyn ResultSetMapper<T>>,
    ) -> DbResult<Self> {
        if text.trim().is_empty() {
            return Err(DbError::invalid_argument(
                "command_text",
                "command text must not be empty",
            ));
        }
        Ok(Self {
            database,
            command_type,
            text: text.to_string(),
            parameter_mapper,
            result_set_mapper,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Execute and stream the mapped rows.
    pub async fn execute(&self, values: &[DbValue]) -> DbResult<BoxStream<'static, DbResult<T>>> {
        self.execute_with(ExecutionTarget::Auto, values).await
    }

    pub async fn execute_with(
        &self,
        target: ExecutionTarget<'_>,
        values: &[DbValue],
    ) -> DbResult<BoxStream<'static, DbResult<T>>> {
        let command = self.command(values)?;
        let reader = self.database.execute_reader_with(&command, target).await?;
        Ok(self.result_set_mapper.map_set(reader))
    }

    /// Start executing in the background. Fails before any I/O when the
    /// provider has no async support.
    pub fn begin_execute(
        &self,
        values: &[DbValue],
        options: AsyncOptions,
    ) -> DbResult<AsyncResult<RowReader>> {
        self.database.guard_async_allowed()?;
        let command = self.command(values)?;
        self.database
            .begin_execute_reader(&command, ExecutionTarget::Auto, options)
    }

    pub async fn end_execute(
        &self,
        result: AsyncResult<RowReader>,
    ) -> DbResult<BoxStream<'static, DbResult<T>>> {
        self.database.guard_async_allowed()?;
        let reader = self.database.end_execute_reader(result).await?;
        Ok(self.result_set_mapper.map_set(reader))
    }

    fn command(&self, values: &[DbValue]) -> DbResult<Command> {
        let mut command = self.database.create_command(self.command_type, &self.text)?;
        if values.is_empty() {
            return Ok(command);
        }
        match &self.parameter_mapper {
            Some(mapper) => mapper.assign_parameters(&mut command, values)?,
            None => {
                return Err(DbError::invalid_argument(
                    "parameter_values",
                    "parameter values need a parameter mapper for SQL string accessors",
                ));
            }
        }
        Ok(command)
    }
}

impl<T> std::fmt::Debug for CommandAccessor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAccessor")
            .field("database", &self.database.name())
            .field("command_type", &self.command_type)
            .field("text", &self.text)
            .field("has_parameter_mapper", &self.parameter_mapper.is_some())
            .finish()
    }
}
