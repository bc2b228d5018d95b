use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::data_types::{ColumnType, Record, Value};
use crate::schema::{Column, TableDefinition};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Request body must be a JSON object")]
    NotAnObject,

    #[error("Unknown field {0:?}")]
    UnknownField(String),

    #[error("Invalid value for {field:?}: expected {expected}")]
    InvalidValue {
        field: String,
        expected: &'static str,
    },

    #[error("Field {0:?} cannot be null")]
    NullNotAllowed(String),

    #[error("Missing required field {0:?}")]
    MissingField(String),

    #[error("The primary key {0:?} cannot be changed")]
    PrimaryKeyImmutable(String),

    #[error("No fields to update")]
    EmptyUpdate,

    /// A NOT NULL constraint fired in the database itself, e.g. on a column
    /// whose default evaluates to null.
    #[error("A required field is missing or null")]
    RequiredValueMissing,
}

fn coerce(column: &Column, json: &JsonValue) -> Result<Value, ValidationError> {
    let value = Value::from_json(column.column_type, json).ok_or_else(|| {
        ValidationError::InvalidValue {
            field: column.name.clone(),
            expected: column.column_type.semantic_name(),
        }
    })?;

    if value.is_null() && !column.nullable {
        return Err(ValidationError::NullNotAllowed(column.name.clone()));
    }
    Ok(value)
}

fn payload_fields<'a>(
    table: &'a TableDefinition,
    payload: &'a JsonValue,
) -> Result<impl Iterator<Item = Result<(&'a Column, Value), ValidationError>> + 'a, ValidationError>
{
    let object = payload.as_object().ok_or(ValidationError::NotAnObject)?;
    Ok(object.iter().map(|(name, json)| {
        let column = table
            .column(name)
            .ok_or_else(|| ValidationError::UnknownField(name.clone()))?;
        Ok((column, coerce(column, json)?))
    }))
}

/// Check a create payload against the table and coerce it into a record
/// with one entry per supplied column. A text or uuid primary key that is
/// left out and has no database default gets a fresh UUIDv4.
pub fn validate_create(
    table: &TableDefinition,
    payload: &JsonValue,
) -> Result<Record, ValidationError> {
    let mut record = Record::new();
    for field in payload_fields(table, payload)? {
        let (column, value) = field?;
        record.insert(column.name.clone(), value);
    }

    for column in &table.columns {
        if record.contains(&column.name) {
            continue;
        }

        if column.name == table.primary_key && !column.has_default {
            match column.column_type {
                ColumnType::Text => {
                    record.insert(
                        column.name.clone(),
                        Value::Text(Uuid::new_v4().hyphenated().to_string()),
                    );
                    continue;
                }
                ColumnType::Uuid => {
                    record.insert(column.name.clone(), Value::Uuid(Uuid::new_v4()));
                    continue;
                }
                _ => {}
            }
        }

        if !column.is_optional() {
            return Err(ValidationError::MissingField(column.name.clone()));
        }
    }

    Ok(record)
}

/// Check a partial update payload. The primary key may be echoed back
/// unchanged (it is dropped from the changes) but not modified.
pub fn validate_update(
    table: &TableDefinition,
    payload: &JsonValue,
    id: &Value,
) -> Result<Record, ValidationError> {
    let mut changes = Record::new();
    for field in payload_fields(table, payload)? {
        let (column, value) = field?;
        if column.name == table.primary_key {
            if &value != id {
                return Err(ValidationError::PrimaryKeyImmutable(column.name.clone()));
            }
            continue;
        }
        changes.insert(column.name.clone(), value);
    }

    if changes.is_empty() {
        return Err(ValidationError::EmptyUpdate);
    }
    Ok(changes)
}
