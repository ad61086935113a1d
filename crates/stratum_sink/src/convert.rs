//! Per-type value conversion from Arrow arrays and literal strings into
//! mutation cell values.
//!
//! The match over [`ColumnType`] is exhaustive on purpose: adding a type
//! extends the enum and the compiler points at every site that must
//! learn about it. Null legality is the caller's decision; this module
//! only reports whether the source cell was null.

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Decimal128Array, Float32Array, Float64Array,
    Int16Array, Int32Array, Int64Array, Int8Array, StringArray, TimestampMicrosecondArray,
};
use stratum_client::{ColumnType, Value};

use crate::error::ConvertError;

fn downcast<'a, T: Array + 'static>(
    column: &str,
    array: &'a ArrayRef,
    declared: ColumnType,
) -> Result<&'a T, ConvertError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ConvertError::Mismatch {
            column: column.to_string(),
            actual: array.data_type().to_string(),
            declared,
        })
}

/// Reads the cell at `row` from `array` as the declared column type.
///
/// Returns `Ok(None)` for a source null.
pub fn arrow_cell(
    column: &str,
    array: &ArrayRef,
    row: usize,
    ty: ColumnType,
) -> Result<Option<Value>, ConvertError> {
    if array.is_null(row) {
        return Ok(None);
    }
    let value = match ty {
        ColumnType::Text => {
            Value::Text(downcast::<StringArray>(column, array, ty)?.value(row).to_string())
        }
        ColumnType::Binary => {
            Value::Binary(downcast::<BinaryArray>(column, array, ty)?.value(row).to_vec())
        }
        ColumnType::Bool => Value::Bool(downcast::<BooleanArray>(column, array, ty)?.value(row)),
        ColumnType::Int8 => Value::Int8(downcast::<Int8Array>(column, array, ty)?.value(row)),
        ColumnType::Int16 => Value::Int16(downcast::<Int16Array>(column, array, ty)?.value(row)),
        ColumnType::Int32 => Value::Int32(downcast::<Int32Array>(column, array, ty)?.value(row)),
        ColumnType::Int64 => Value::Int64(downcast::<Int64Array>(column, array, ty)?.value(row)),
        ColumnType::Float32 => {
            Value::Float32(downcast::<Float32Array>(column, array, ty)?.value(row))
        }
        ColumnType::Float64 => {
            Value::Float64(downcast::<Float64Array>(column, array, ty)?.value(row))
        }
        ColumnType::TimestampMicros => Value::TimestampMicros(
            downcast::<TimestampMicrosecondArray>(column, array, ty)?.value(row),
        ),
        ColumnType::Decimal { precision, scale } => {
            let decimals = downcast::<Decimal128Array>(column, array, ty)?;
            if decimals.precision() != precision || decimals.scale() != scale {
                return Err(ConvertError::Mismatch {
                    column: column.to_string(),
                    actual: array.data_type().to_string(),
                    declared: ty,
                });
            }
            Value::Decimal(decimals.value(row))
        }
    };
    Ok(Some(value))
}

/// Parses a literal string into a cell value of the declared type.
///
/// Booleans accept exactly `true`/`false`; decimals are parsed as a
/// float and scaled to the column's declared scale; timestamps use
/// RFC 3339.
pub fn parse_literal(column: &str, input: &str, ty: ColumnType) -> Result<Value, ConvertError> {
    let literal_error = |reason: String| ConvertError::Literal {
        column: column.to_string(),
        input: input.to_string(),
        declared: ty,
        reason,
    };
    let value = match ty {
        ColumnType::Text => Value::Text(input.to_string()),
        ColumnType::Binary => Value::Binary(input.as_bytes().to_vec()),
        ColumnType::Bool => match input {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(literal_error("expected 'true' or 'false'".to_string())),
        },
        ColumnType::Int8 => Value::Int8(input.parse().map_err(|e| literal_error(format!("{e}")))?),
        ColumnType::Int16 => {
            Value::Int16(input.parse().map_err(|e| literal_error(format!("{e}")))?)
        }
        ColumnType::Int32 => {
            Value::Int32(input.parse().map_err(|e| literal_error(format!("{e}")))?)
        }
        ColumnType::Int64 => {
            Value::Int64(input.parse().map_err(|e| literal_error(format!("{e}")))?)
        }
        ColumnType::Float32 => {
            Value::Float32(input.parse().map_err(|e| literal_error(format!("{e}")))?)
        }
        ColumnType::Float64 => {
            Value::Float64(input.parse().map_err(|e| literal_error(format!("{e}")))?)
        }
        ColumnType::TimestampMicros => {
            let instant = chrono::DateTime::parse_from_rfc3339(input)
                .map_err(|e| literal_error(format!("{e}")))?;
            Value::TimestampMicros(instant.timestamp_micros())
        }
        ColumnType::Decimal { scale, .. } => {
            let parsed: f64 = input.parse().map_err(|e| literal_error(format!("{e}")))?;
            let scaled = parsed * 10f64.powi(i32::from(scale));
            Value::Decimal(scaled.round() as i128)
        }
    };
    Ok(value)
}
