//! Command-related data models.
//!
//! A [`Command`] is plain data: a command type, its text, typed parameters and an
//! optional timeout. It holds no connection; the [`Database`](crate::db::Database)
//! that executes it decides where it runs.

use crate::error::{DbError, DbResult};
use crate::models::DbValue;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the command text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Text is a SQL statement in the driver's dialect.
    #[default]
    Text,
    /// Text is the name of a stored procedure.
    StoredProcedure,
    /// Text is the name of a table whose rows are all returned.
    TableDirect,
}

/// Direction of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl ParameterDirection {
    /// Whether a value is sent to the server for this parameter.
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input | Self::InputOutput)
    }
}

/// Declared type of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbType {
    String,
    AnsiString,
    Boolean,
    Int16,
    Int32,
    Int64,
    Single,
    Double,
    Decimal,
    Binary,
    DateTime,
    Guid,
    Json,
    /// No conversion; the value is bound as given.
    Object,
}

impl DbType {
    /// Convert a value to the representation this type binds as.
    ///
    /// NULL passes through every type.
    pub fn coerce(&self, name: &str, value: DbValue) -> DbResult<DbValue> {
        if value.is_null() {
            return Ok(value);
        }

        let mismatch = |value: &DbValue| {
            DbError::invalid_argument(
                name,
                format!("cannot convert a {} value to {:?}", value.type_name(), self),
            )
        };

        match self {
            DbType::Object => Ok(value),
            DbType::String
            | DbType::AnsiString
            | DbType::Decimal
            | DbType::DateTime
            | DbType::Guid => match value {
                DbValue::String(_) => Ok(value),
                DbValue::Bytes(_) | DbValue::Json(_) => Err(mismatch(&value)),
                other => Ok(DbValue::String(other.to_string())),
            },
            DbType::Boolean => value.as_bool().map(DbValue::Bool).ok_or_else(|| mismatch(&value)),
            DbType::Int16 | DbType::Int32 | DbType::Int64 => {
                let parsed = match &value {
                    DbValue::String(s) => s.trim().parse::<i64>().ok(),
                    other => other.as_i64(),
                };
                let v = parsed.ok_or_else(|| mismatch(&value))?;
                let in_range = match self {
                    DbType::Int16 => i16::try_from(v).is_ok(),
                    DbType::Int32 => i32::try_from(v).is_ok(),
                    _ => true,
                };
                if !in_range {
                    return Err(DbError::invalid_argument(
                        name,
                        format!("value {} is out of range for {:?}", v, self),
                    ));
                }
                Ok(DbValue::Int(v))
            }
            DbType::Single | DbType::Double => {
                let parsed = match &value {
                    DbValue::String(s) => s.trim().parse::<f64>().ok(),
                    other => other.as_f64(),
                };
                parsed.map(DbValue::Float).ok_or_else(|| mismatch(&value))
            }
            DbType::Binary => match value {
                DbValue::Bytes(_) => Ok(value),
                DbValue::String(s) => Ok(DbValue::Bytes(s.into_bytes())),
                other => Err(mismatch(&other)),
            },
            DbType::Json => match value {
                DbValue::Json(_) => Ok(value),
                DbValue::String(s) => serde_json::from_str(&s)
                    .map(DbValue::Json)
                    .map_err(|e| DbError::invalid_argument(name, format!("invalid JSON: {}", e))),
                other => Ok(DbValue::Json(other.to_json())),
            },
        }
    }
}

/// A named, typed command parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub db_type: DbType,
    #[serde(default)]
    pub direction: ParameterDirection,
    #[serde(default = "null_value")]
    pub value: DbValue,
    /// Maximum size for variable-length output parameters.
    #[serde(default)]
    pub size: Option<u32>,
}

fn null_value() -> DbValue {
    DbValue::Null
}

/// A command to execute against a database.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    command_type: CommandType,
    text: String,
    parameters: Vec<Parameter>,
    timeout: Option<Duration>,
}

impl Command {
    /// Create a command. The text must not be blank.
    pub fn new(command_type: CommandType, text: impl Into<String>) -> DbResult<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(DbError::invalid_argument(
                "command_text",
                "command text cannot be empty",
            ));
        }
        Ok(Self {
            command_type,
            text,
            parameters: Vec::new(),
            timeout: None,
        })
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the command timeout, overriding the database default.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Builder form of [`set_timeout`](Self::set_timeout).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Append a parameter. Names are unique per command (case-insensitive).
    pub fn push_parameter(&mut self, parameter: Parameter) -> DbResult<()> {
        if parameter.name.trim().is_empty() {
            return Err(DbError::invalid_argument(
                "parameter_name",
                "parameter name cannot be empty",
            ));
        }
        if self.parameter(&parameter.name).is_some() {
            return Err(DbError::invalid_argument(
                "parameter_name",
                format!("parameter '{}' is already defined", parameter.name),
            ));
        }
        self.parameters.push(parameter);
        Ok(())
    }

    /// Look up a parameter by name (case-insensitive).
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Values of the parameters that are sent to the server, in declaration order,
    /// converted to their declared types.
    pub fn input_values(&self) -> DbResult<Vec<DbValue>> {
        self.parameters
            .iter()
            .filter(|p| p.direction.is_input())
            .map(|p| p.db_type.coerce(&p.name, p.value.clone()))
            .collect()
    }
}
