//! Parquet decoding into SQL-typed rows
//!
//! Arrow types collapse onto the handful of column types the importer
//! creates: booleans, 64-bit integers, doubles, dates, UTC timestamps, text
//! arrays and text. Anything without a natural mapping is rendered as text,
//! including `UInt64`, whose upper half does not fit in BIGINT. Casts are
//! strict: a value that does not fit fails the file instead of becoming NULL.

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::{cast_with_options, CastOptions};
use arrow::datatypes::{
    DataType, Date32Type, Float64Type, Int64Type, TimeUnit, TimestampMicrosecondType,
};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use bytes::Bytes;
use chrono::DateTime;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::errors::ParquetError;
use std::collections::HashSet;
use thiserror::Error;

use crate::db::{SqlType, SqlValue};
use crate::discovery::sanitize_identifier;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Parquet(#[from] ParquetError),

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_type: SqlType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}

/// A decoded column file
#[derive(Debug, Clone, Default)]
pub struct DecodedFile {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl DecodedFile {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

pub fn sql_type_for(data_type: &DataType) -> SqlType {
    match data_type {
        DataType::Boolean => SqlType::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => SqlType::BigInt,
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => SqlType::Double,
        DataType::Date32 | DataType::Date64 => SqlType::Date,
        DataType::Timestamp(_, _) => SqlType::TimestampTz,
        DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(_, _) => {
            SqlType::TextArray
        },
        _ => SqlType::Text,
    }
}

/// Lowercased, sanitized, de-duplicated column names
fn column_names<'a>(fields: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    fields
        .map(|raw| {
            let base = sanitize_identifier(raw);
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.clone()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            name
        })
        .collect()
}

pub fn decode_parquet(data: Bytes) -> Result<DecodedFile, DecodeError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
    let schema = builder.schema().clone();

    let names = column_names(schema.fields().iter().map(|f| f.name().as_str()));
    let columns: Vec<ColumnSpec> = names
        .into_iter()
        .zip(schema.fields().iter())
        .map(|(name, field)| ColumnSpec::new(name, sql_type_for(field.data_type())))
        .collect();

    let mut rows = Vec::new();
    for batch in builder.build()? {
        append_rows(&batch?, &columns, &mut rows)?;
    }

    Ok(DecodedFile { columns, rows })
}

fn append_rows(
    batch: &RecordBatch,
    columns: &[ColumnSpec],
    rows: &mut Vec<Vec<SqlValue>>,
) -> Result<(), ArrowError> {
    let converted = batch
        .columns()
        .iter()
        .zip(columns)
        .map(|(array, spec)| convert_column(array, spec.sql_type))
        .collect::<Result<Vec<_>, _>>()?;

    rows.reserve(batch.num_rows());
    for row in 0..batch.num_rows() {
        rows.push(converted.iter().map(|col| col[row].clone()).collect());
    }
    Ok(())
}

fn cast(array: &ArrayRef, to: &DataType) -> Result<ArrayRef, ArrowError> {
    let options = CastOptions {
        safe: false,
        format_options: FormatOptions::default(),
    };
    cast_with_options(array, to, &options)
}

fn convert_column(array: &ArrayRef, sql_type: SqlType) -> Result<Vec<SqlValue>, ArrowError> {
    let len = array.len();
    let null = SqlValue::Null(sql_type);

    let values: Vec<SqlValue> = match sql_type {
        SqlType::Boolean => {
            let arr = array.as_boolean();
            (0..len)
                .map(|i| if arr.is_null(i) { null.clone() } else { SqlValue::Bool(arr.value(i)) })
                .collect()
        },
        SqlType::BigInt => {
            let cast_arr = cast(array, &DataType::Int64)?;
            let arr = cast_arr.as_primitive::<Int64Type>();
            (0..len)
                .map(|i| if arr.is_null(i) { null.clone() } else { SqlValue::Int(arr.value(i)) })
                .collect()
        },
        SqlType::Double => {
            let cast_arr = cast(array, &DataType::Float64)?;
            let arr = cast_arr.as_primitive::<Float64Type>();
            (0..len)
                .map(|i| if arr.is_null(i) { null.clone() } else { SqlValue::Float(arr.value(i)) })
                .collect()
        },
        SqlType::Date => {
            let cast_arr = cast(array, &DataType::Date32)?;
            let arr = cast_arr.as_primitive::<Date32Type>();
            (0..len)
                .map(|i| match arr.value_as_date(i) {
                    Some(date) if !arr.is_null(i) => SqlValue::Date(date),
                    _ => null.clone(),
                })
                .collect()
        },
        SqlType::TimestampTz => {
            // Keep the zone so raw values stay UTC instants; naive timestamps are read as UTC
            let tz = match array.data_type() {
                DataType::Timestamp(_, tz) => tz.clone(),
                _ => None,
            };
            let cast_arr = cast(array, &DataType::Timestamp(TimeUnit::Microsecond, tz))?;
            let arr = cast_arr.as_primitive::<TimestampMicrosecondType>();
            (0..len)
                .map(|i| {
                    if arr.is_null(i) {
                        return null.clone();
                    }
                    DateTime::from_timestamp_micros(arr.value(i))
                        .map(SqlValue::Timestamp)
                        .unwrap_or_else(|| null.clone())
                })
                .collect()
        },
        SqlType::TextArray => {
            let options = FormatOptions::default();
            (0..len)
                .map(|i| match list_item(array.as_ref(), i) {
                    Some(items) => {
                        let formatter = ArrayFormatter::try_new(items.as_ref(), &options)?;
                        Ok(SqlValue::TextArray(
                            (0..items.len()).map(|j| formatter.value(j).to_string()).collect(),
                        ))
                    },
                    None => Ok(SqlValue::TextArray(Vec::new())),
                })
                .collect::<Result<Vec<_>, ArrowError>>()?
        },
        SqlType::Text => match array.data_type() {
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
                let cast_arr = cast(array, &DataType::Utf8)?;
                let arr = cast_arr.as_string::<i32>();
                (0..len)
                    .map(|i| {
                        if arr.is_null(i) {
                            null.clone()
                        } else {
                            SqlValue::Text(arr.value(i).to_string())
                        }
                    })
                    .collect()
            },
            _ => {
                let formatter = ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default())?;
                (0..len)
                    .map(|i| {
                        if array.is_null(i) {
                            null.clone()
                        } else {
                            SqlValue::Text(formatter.value(i).to_string())
                        }
                    })
                    .collect()
            },
        },
    };

    Ok(values)
}

/// Elements of a list cell; `None` for a null list
fn list_item(array: &dyn Array, row: usize) -> Option<ArrayRef> {
    if array.is_null(row) {
        return None;
    }
    match array.data_type() {
        DataType::List(_) => Some(array.as_list::<i32>().value(row)),
        DataType::LargeList(_) => Some(array.as_list::<i64>().value(row)),
        DataType::FixedSizeList(_, _) => Some(array.as_fixed_size_list().value(row)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{
        BooleanArray, Date32Array, Float32Array, Float64Array, Int32Array, ListBuilder, StringArray,
        StringBuilder, TimestampMillisecondArray, UInt64Array,
    };
    use arrow::datatypes::{Field, Schema};
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;

    fn write_parquet(batch: RecordBatch) -> Bytes {
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        Bytes::from(buf)
    }

    #[test]
    fn test_type_mapping() {
        assert_eq!(sql_type_for(&DataType::UInt32), SqlType::BigInt);
        assert_eq!(sql_type_for(&DataType::UInt64), SqlType::Text);
        assert_eq!(sql_type_for(&DataType::Decimal128(10, 2)), SqlType::Double);
        assert_eq!(
            sql_type_for(&DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into()))),
            SqlType::TimestampTz
        );
        assert_eq!(sql_type_for(&DataType::Binary), SqlType::Text);
    }

    #[test]
    fn test_column_names_are_sanitized_and_unique() {
        let names = column_names(["Name", "name", "Unit Price"].into_iter());
        assert_eq!(names, vec!["name", "name_2", "unit_price"]);
    }

    #[test]
    fn test_decode_mixed_types() {
        let mut tags = ListBuilder::new(StringBuilder::new());
        tags.values().append_value("red");
        tags.values().append_value("sale");
        tags.append(true);
        tags.append(false);

        let schema = Arc::new(Schema::new(vec![
            Field::new("ID", DataType::UInt64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("price", DataType::Float32, true),
            Field::new("active", DataType::Boolean, true),
            Field::new("launched", DataType::Date32, true),
            Field::new(
                "updated_at",
                DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
                true,
            ),
            Field::new(
                "tags",
                DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
                true,
            ),
            Field::new("qty", DataType::Int32, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(UInt64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("Widget"), None])),
                Arc::new(Float32Array::from(vec![Some(9.5), None])),
                Arc::new(BooleanArray::from(vec![Some(true), Some(false)])),
                Arc::new(Date32Array::from(vec![Some(19_000), None])),
                Arc::new(
                    TimestampMillisecondArray::from(vec![Some(1_700_000_000_000), None])
                        .with_timezone("UTC"),
                ),
                Arc::new(tags.finish()),
                Arc::new(Int32Array::from(vec![Some(3), None])),
            ],
        )
        .unwrap();

        let decoded = decode_parquet(write_parquet(batch)).unwrap();

        let types: Vec<SqlType> = decoded.columns.iter().map(|c| c.sql_type).collect();
        assert_eq!(
            types,
            vec![
                SqlType::Text,
                SqlType::Text,
                SqlType::Double,
                SqlType::Boolean,
                SqlType::Date,
                SqlType::TimestampTz,
                SqlType::TextArray,
                SqlType::BigInt,
            ]
        );
        assert_eq!(decoded.columns[0].name, "id");
        assert_eq!(decoded.rows.len(), 2);

        let first = &decoded.rows[0];
        assert_eq!(first[0], SqlValue::Text("1".to_string()));
        assert_eq!(first[1], SqlValue::Text("Widget".to_string()));
        assert_eq!(first[2], SqlValue::Float(9.5));
        assert_eq!(
            first[5],
            SqlValue::Timestamp(DateTime::from_timestamp_millis(1_700_000_000_000).unwrap())
        );
        assert_eq!(
            first[6],
            SqlValue::TextArray(vec!["red".to_string(), "sale".to_string()])
        );

        let second = &decoded.rows[1];
        assert_eq!(second[1], SqlValue::Null(SqlType::Text));
        assert_eq!(second[4], SqlValue::Null(SqlType::Date));
        assert_eq!(second[6], SqlValue::TextArray(Vec::new()));
        assert_eq!(second[7], SqlValue::Null(SqlType::BigInt));
    }

    #[test]
    fn test_unsigned_ids_beyond_i64_survive() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::UInt64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(UInt64Array::from(vec![1, 18_446_744_073_709_551_000]))],
        )
        .unwrap();

        let decoded = decode_parquet(write_parquet(batch)).unwrap();

        assert_eq!(
            decoded.rows,
            vec![
                vec![SqlValue::Text("1".to_string())],
                vec![SqlValue::Text("18446744073709551000".to_string())],
            ]
        );
    }

    #[test]
    fn test_overflowing_cast_is_an_error() {
        let array: ArrayRef = Arc::new(Float64Array::from(vec![1e300]));
        assert!(convert_column(&array, SqlType::BigInt).is_err());
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let result = decode_parquet(Bytes::from_static(b"definitely not parquet"));
        assert!(matches!(result, Err(DecodeError::Parquet(_))));
    }
}
