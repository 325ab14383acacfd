//! Database-agnostic type mappings.
//!
//! This module maps driver column values onto [`DbValue`].
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Driver-specific decoders handle the actual value extraction
//!
//! A value that cannot be decoded becomes NULL and is logged; decoding never
//! aborts a row.

use crate::models::{DatabaseType, DbValue};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Temporal,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Date and time, before integers ("interval" would match "int")
    if lower.starts_with("timestamp")
        || lower.starts_with("time")
        || lower == "date"
        || lower == "datetime"
        || lower == "interval"
    {
        return TypeCategory::Temporal;
    }

    // Integer types
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    // Boolean
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    // Float types
    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    // JSON types
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    // UUID (PostgreSQL)
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    // Binary types
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "string" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

fn float_value(v: f64) -> DbValue {
    DbValue::Float(v)
}

// =============================================================================
// Row Decoding Trait
// =============================================================================

/// Converts a driver row into column names and [`DbValue`]s.
pub trait DecodeRow {
    fn column_names(&self) -> Vec<String>;
    fn decode_values(&self) -> Vec<DbValue>;
}

impl DecodeRow for MySqlRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn decode_values(&self) -> Vec<DbValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySQL);
                mysql::decode_column(self, idx, type_name, category)
            })
            .collect()
    }
}

impl DecodeRow for PgRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn decode_values(&self) -> Vec<DbValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::PostgreSQL);
                postgres::decode_column(self, idx, category)
            })
            .collect()
    }
}

impl DecodeRow for SqliteRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn decode_values(&self) -> Vec<DbValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = sqlite::effective_type_name(self, idx, col.type_info());
                let category = categorize_type(&type_name, DatabaseType::SQLite);
                sqlite::decode_column(self, idx, &type_name, category)
            })
            .collect()
    }
}

// =============================================================================
// Driver-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Temporal => decode_temporal(row, idx, type_name),
            _ => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> DbValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => DbValue::String(v.0),
            Ok(None) => DbValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode DECIMAL: {:?}", e);
                DbValue::Null
            }
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> DbValue {
        // Check NULL first
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return DbValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return DbValue::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return DbValue::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return DbValue::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return DbValue::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<u8>, _>(idx) {
            return DbValue::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u16>, _>(idx) {
            return DbValue::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
            return DbValue::Int(v.into());
        }
        // u64 beyond i64::MAX keeps its exact digits as text
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return i64::try_from(v)
                .map(DbValue::Int)
                .unwrap_or_else(|_| DbValue::String(v.to_string()));
        }
        DbValue::Null
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> DbValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::Bool)
            .unwrap_or(DbValue::Null)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> DbValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        DbValue::Null
    }

    fn decode_binary(row: &MySqlRow, idx: usize) -> DbValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::Bytes)
            .unwrap_or(DbValue::Null)
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> DbValue {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::Json)
            .unwrap_or(DbValue::Null)
    }

    fn decode_temporal(row: &MySqlRow, idx: usize, type_name: &str) -> DbValue {
        use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

        let value = match type_name.to_lowercase().as_str() {
            "date" => row
                .try_get::<Option<NaiveDate>, _>(idx)
                .map(|v| v.map(|d| d.to_string())),
            "time" => row
                .try_get::<Option<NaiveTime>, _>(idx)
                .map(|v| v.map(|t| t.to_string())),
            _ => row
                .try_get::<Option<NaiveDateTime>, _>(idx)
                .map(|v| v.map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        };
        match value {
            Ok(v) => v.map(DbValue::String).unwrap_or(DbValue::Null),
            Err(_) => decode_text(row, idx),
        }
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> DbValue {
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(DbValue::String).unwrap_or(DbValue::Null);
        }
        // MySQL may report VARBINARY for text depending on the connection charset
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|bytes| match String::from_utf8(bytes) {
                Ok(s) => DbValue::String(s),
                Err(e) => DbValue::Bytes(e.into_bytes()),
            })
            .unwrap_or(DbValue::Null)
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> DbValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Uuid => decode_uuid(row, idx),
            TypeCategory::Temporal => decode_temporal(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> DbValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => DbValue::String(v.0),
            Ok(None) => DbValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode NUMERIC: {:?}", e);
                DbValue::Null
            }
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> DbValue {
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return DbValue::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return DbValue::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return DbValue::Int(v);
        }
        DbValue::Null
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> DbValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::Bool)
            .unwrap_or(DbValue::Null)
    }

    fn decode_float(row: &PgRow, idx: usize) -> DbValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        DbValue::Null
    }

    fn decode_binary(row: &PgRow, idx: usize) -> DbValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::Bytes)
            .unwrap_or(DbValue::Null)
    }

    fn decode_json(row: &PgRow, idx: usize) -> DbValue {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::Json)
            .unwrap_or(DbValue::Null)
    }

    fn decode_uuid(row: &PgRow, idx: usize) -> DbValue {
        row.try_get::<Option<uuid::Uuid>, _>(idx)
            .ok()
            .flatten()
            .map(|v| DbValue::String(v.to_string()))
            .unwrap_or(DbValue::Null)
    }

    fn decode_temporal(row: &PgRow, idx: usize) -> DbValue {
        use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

        if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            return v
                .map(|dt| DbValue::String(dt.to_rfc3339()))
                .unwrap_or(DbValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| DbValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                .unwrap_or(DbValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(idx) {
            return v
                .map(|d| DbValue::String(d.to_string()))
                .unwrap_or(DbValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<NaiveTime>, _>(idx) {
            return v
                .map(|t| DbValue::String(t.to_string()))
                .unwrap_or(DbValue::Null);
        }
        decode_text(row, idx)
    }

    fn decode_text(row: &PgRow, idx: usize) -> DbValue {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::String)
            .unwrap_or(DbValue::Null)
    }
}

mod sqlite {
    use super::*;
    use sqlx::ValueRef;
    use sqlx::sqlite::SqliteTypeInfo;

    /// Expression columns have no declared type; fall back to the storage
    /// class of the value itself.
    pub fn effective_type_name(row: &SqliteRow, idx: usize, declared: &SqliteTypeInfo) -> String {
        if !declared.is_null() {
            return declared.name().to_string();
        }
        row.try_get_raw(idx)
            .map(|value| value.type_info().name().to_string())
            .unwrap_or_else(|_| declared.name().to_string())
    }

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbValue {
        match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float | TypeCategory::Decimal => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            // Dates are stored as text
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_integer(row: &SqliteRow, idx: usize) -> DbValue {
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::Int)
            .unwrap_or(DbValue::Null)
    }

    fn decode_boolean(row: &SqliteRow, idx: usize) -> DbValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::Bool)
            .unwrap_or(DbValue::Null)
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> DbValue {
        row.try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map(float_value)
            .unwrap_or(DbValue::Null)
    }

    fn decode_binary(row: &SqliteRow, idx: usize) -> DbValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(DbValue::Bytes)
            .unwrap_or(DbValue::Null)
    }

    fn decode_text(row: &SqliteRow, idx: usize, type_name: &str) -> DbValue {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            if type_name.to_lowercase().contains("json") {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&v) {
                    return DbValue::Json(json);
                }
            }
            return DbValue::String(v);
        }
        DbValue::Null
    }
}
