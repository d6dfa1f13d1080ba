//! Dynamically typed SQL values
//!
//! Column files are only known at runtime, so rows travel as `Vec<SqlValue>`
//! and are bound one value at a time. NULLs keep their column type because
//! Postgres rejects an untyped (text) NULL parameter for a BIGINT column.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;
use sqlx::query_builder::Separated;
use std::fmt;

/// Column types the importer creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Boolean,
    BigInt,
    Double,
    Date,
    TimestampTz,
    TextArray,
    Text,
}

impl SqlType {
    /// DDL spelling
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Date => "DATE",
            SqlType::TimestampTz => "TIMESTAMPTZ",
            SqlType::TextArray => "TEXT[]",
            SqlType::Text => "TEXT",
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, SqlType::Text)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null(SqlType),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    TextArray(Vec<String>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Canonical text form used for row hashing
    pub fn canonical(&self) -> Option<String> {
        match self {
            SqlValue::Null(_) => None,
            SqlValue::Bool(v) => Some(v.to_string()),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Text(v) => Some(v.clone()),
            SqlValue::Date(v) => Some(v.to_string()),
            SqlValue::Timestamp(v) => Some(v.to_rfc3339()),
            SqlValue::TextArray(v) => Some(format!("{{{}}}", v.join(","))),
        }
    }

    pub fn bind_to<'q>(
        self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            SqlValue::Null(ty) => match ty {
                SqlType::Boolean => query.bind(None::<bool>),
                SqlType::BigInt => query.bind(None::<i64>),
                SqlType::Double => query.bind(None::<f64>),
                SqlType::Date => query.bind(None::<NaiveDate>),
                SqlType::TimestampTz => query.bind(None::<DateTime<Utc>>),
                SqlType::TextArray => query.bind(None::<Vec<String>>),
                SqlType::Text => query.bind(None::<String>),
            },
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Date(v) => query.bind(v),
            SqlValue::Timestamp(v) => query.bind(v),
            SqlValue::TextArray(v) => query.bind(v),
        }
    }

    pub fn push_to(self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        match self {
            SqlValue::Null(ty) => match ty {
                SqlType::Boolean => row.push_bind(None::<bool>),
                SqlType::BigInt => row.push_bind(None::<i64>),
                SqlType::Double => row.push_bind(None::<f64>),
                SqlType::Date => row.push_bind(None::<NaiveDate>),
                SqlType::TimestampTz => row.push_bind(None::<DateTime<Utc>>),
                SqlType::TextArray => row.push_bind(None::<Vec<String>>),
                SqlType::Text => row.push_bind(None::<String>),
            },
            SqlValue::Bool(v) => row.push_bind(v),
            SqlValue::Int(v) => row.push_bind(v),
            SqlValue::Float(v) => row.push_bind(v),
            SqlValue::Text(v) => row.push_bind(v),
            SqlValue::Date(v) => row.push_bind(v),
            SqlValue::Timestamp(v) => row.push_bind(v),
            SqlValue::TextArray(v) => row.push_bind(v),
        };
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(v: Vec<String>) -> Self {
        SqlValue::TextArray(v)
    }
}
