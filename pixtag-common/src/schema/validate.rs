//! Model response validation against a compiled [`OutputSchema`]

use serde_json::{Map, Value};
use thiserror::Error;

use super::{FieldType, OutputSchema, Primitive};

/// Model output does not conform to the compiled schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Response is not a JSON array (found {0})")]
    NotAnArray(&'static str),

    #[error("Response has {actual} records for {expected} images")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Record {index} is not an object (found {found})")]
    NotAnObject { index: usize, found: &'static str },

    #[error("Record {index} is missing required field '{field}'")]
    MissingField { index: usize, field: String },

    #[error("Record {index} field '{path}' expected {expected}, found {found}")]
    TypeMismatch {
        index: usize,
        path: String,
        expected: String,
        found: &'static str,
    },

    #[error("Record {index} field '{path}' has value '{value}' outside enum {name}")]
    EnumViolation {
        index: usize,
        path: String,
        name: String,
        value: String,
    },
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The value as an i64 when that is lossless. Whole floats such as `2.0`
/// count; values outside the i64 range do not.
pub fn exact_i64(value: &Value) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, hence the exclusive upper bound
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;

    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= -LIMIT && *f < LIMIT)
            .map(|f| f as i64)
    })
}

fn check(
    index: usize,
    path: &str,
    field_type: &FieldType,
    value: &Value,
) -> Result<(), ValidationError> {
    let mismatch = || ValidationError::TypeMismatch {
        index,
        path: path.to_string(),
        expected: field_type.describe(),
        found: kind(value),
    };

    match field_type {
        FieldType::Primitive(Primitive::String) => value.is_string().then_some(()).ok_or_else(mismatch),
        FieldType::Primitive(Primitive::Integer) => {
            exact_i64(value).map(|_| ()).ok_or_else(mismatch)
        }
        FieldType::Primitive(Primitive::Float) => value.is_number().then_some(()).ok_or_else(mismatch),
        FieldType::Primitive(Primitive::Boolean) => value.is_boolean().then_some(()).ok_or_else(mismatch),
        FieldType::Enum { name, values } => {
            let s = value.as_str().ok_or_else(mismatch)?;
            if values.iter().any(|v| v == s) {
                Ok(())
            } else {
                Err(ValidationError::EnumViolation {
                    index,
                    path: path.to_string(),
                    name: name.clone(),
                    value: s.to_string(),
                })
            }
        }
        FieldType::Repeated(inner) => {
            let items = value.as_array().ok_or_else(mismatch)?;
            for (i, item) in items.iter().enumerate() {
                check(index, &format!("{}[{}]", path, i), inner, item)?;
            }
            Ok(())
        }
    }
}

/// Validate a model response: a list with one record per input image, each
/// record carrying every schema field with a conforming value.
///
/// Returns the records reduced to the schema's fields, in input order. Keys
/// the schema does not declare are dropped.
pub fn validate_response(
    schema: &OutputSchema,
    response: &Value,
    expected_len: usize,
) -> Result<Vec<Map<String, Value>>, ValidationError> {
    let records = response
        .as_array()
        .ok_or_else(|| ValidationError::NotAnArray(kind(response)))?;

    if records.len() != expected_len {
        return Err(ValidationError::LengthMismatch {
            expected: expected_len,
            actual: records.len(),
        });
    }

    let mut validated = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let object = record.as_object().ok_or(ValidationError::NotAnObject {
            index,
            found: kind(record),
        })?;

        let mut kept = Map::new();
        for field in schema.fields() {
            let value = match object.get(&field.name) {
                Some(Value::Null) | None => {
                    return Err(ValidationError::MissingField {
                        index,
                        field: field.name.clone(),
                    })
                }
                Some(value) => value,
            };
            check(index, &field.name, &field.field_type, value)?;
            kept.insert(field.name.clone(), value.clone());
        }

        let extra: Vec<&String> = object
            .keys()
            .filter(|k| schema.field(k).is_none())
            .collect();
        if !extra.is_empty() {
            tracing::debug!(index, ?extra, "Dropping undeclared keys from model record");
        }

        validated.push(kept);
    }

    Ok(validated)
}
