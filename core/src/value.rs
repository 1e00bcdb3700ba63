//! Typed cell values and column metadata
//!
//! Cells arrive on the wire as text; this module maps MonetDB column types
//! onto Rust values.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::ops::Index;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MapiError, Result};

/// MonetDB column type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// tinyint
    TinyInt,
    /// smallint
    SmallInt,
    /// int
    Int,
    /// bigint (and the legacy `wrd`)
    BigInt,
    /// hugeint (128-bit)
    HugeInt,
    /// oid
    Oid,
    /// real
    Real,
    /// double / float
    Double,
    /// decimal
    Decimal,
    /// boolean
    Boolean,
    /// char
    Char,
    /// varchar
    Varchar,
    /// clob / text / str
    Clob,
    /// blob
    Blob,
    /// date
    Date,
    /// time
    Time,
    /// time with time zone
    TimeTz,
    /// timestamp
    Timestamp,
    /// timestamp with time zone
    TimestampTz,
    /// sec_interval / month_interval / day_interval
    Interval,
    /// uuid
    Uuid,
    /// json
    Json,
    /// Any type without a dedicated mapping (url, inet, geometry...)
    Other(String),
}

impl ColumnType {
    /// Map a type name from a result header
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "tinyint" => ColumnType::TinyInt,
            "smallint" => ColumnType::SmallInt,
            "int" | "integer" => ColumnType::Int,
            "bigint" | "wrd" | "lng" => ColumnType::BigInt,
            "hugeint" => ColumnType::HugeInt,
            "oid" => ColumnType::Oid,
            "real" => ColumnType::Real,
            "double" | "float" => ColumnType::Double,
            "decimal" => ColumnType::Decimal,
            "boolean" | "bit" => ColumnType::Boolean,
            "char" => ColumnType::Char,
            "varchar" => ColumnType::Varchar,
            "clob" | "text" | "str" | "string" => ColumnType::Clob,
            "blob" => ColumnType::Blob,
            "date" => ColumnType::Date,
            "time" => ColumnType::Time,
            "timetz" => ColumnType::TimeTz,
            "timestamp" => ColumnType::Timestamp,
            "timestamptz" => ColumnType::TimestampTz,
            "sec_interval" | "month_interval" | "day_interval" => ColumnType::Interval,
            "uuid" => ColumnType::Uuid,
            "json" => ColumnType::Json,
            other => ColumnType::Other(other.to_string()),
        }
    }
}

/// Column metadata from a result header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,

    /// Type name exactly as reported by the server
    pub type_name: String,

    /// Parsed column type
    pub column_type: ColumnType,

    /// Table the column belongs to (may be empty for expressions)
    pub table: String,

    /// Display length reported by the server
    pub length: Option<usize>,
}

impl Column {
    /// Create a column from its name and server type name
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            column_type: ColumnType::from_name(type_name),
            table: String::new(),
            length: None,
        }
    }
}

/// Typed cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,

    /// Boolean
    Boolean(bool),

    /// Integer types up to 64 bits (and oids)
    Integer(i64),

    /// 128-bit integer
    HugeInt(i128),

    /// Floating point
    Float(f64),

    /// Decimal, kept in its exact textual form
    Decimal(String),

    /// Character data, and every type without a dedicated variant
    Text(String),

    /// Binary data
    Blob(Vec<u8>),

    /// Date
    Date(NaiveDate),

    /// Time of day
    Time(NaiveTime),

    /// Timestamp without time zone
    Timestamp(NaiveDateTime),

    /// Timestamp with time zone
    TimestampTz(DateTime<FixedOffset>),

    /// UUID
    Uuid(Uuid),

    /// JSON document
    Json(serde_json::Value),
}

impl Value {
    /// Convert a raw cell to a value of the given column type
    ///
    /// `None` is a SQL NULL. With `type_cast` disabled every other cell is
    /// returned as text.
    pub fn from_cell(column_type: &ColumnType, raw: Option<&str>, type_cast: bool) -> Result<Value> {
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(Value::Null),
        };
        if !type_cast {
            return Ok(Value::Text(raw.to_string()));
        }

        let value = match column_type {
            ColumnType::TinyInt | ColumnType::SmallInt | ColumnType::Int | ColumnType::BigInt => {
                Value::Integer(raw.parse().map_err(|_| conversion_error(raw, column_type))?)
            }
            ColumnType::Oid => {
                // oids print as `<n>@0`
                let digits = raw.split_once('@').map(|(n, _)| n).unwrap_or(raw);
                Value::Integer(digits.parse().map_err(|_| conversion_error(raw, column_type))?)
            }
            ColumnType::HugeInt => {
                Value::HugeInt(raw.parse().map_err(|_| conversion_error(raw, column_type))?)
            }
            ColumnType::Real | ColumnType::Double => {
                Value::Float(raw.parse().map_err(|_| conversion_error(raw, column_type))?)
            }
            ColumnType::Decimal => Value::Decimal(raw.to_string()),
            ColumnType::Boolean => match raw {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                _ => return Err(conversion_error(raw, column_type)),
            },
            ColumnType::Blob => {
                Value::Blob(hex::decode(raw).map_err(|_| conversion_error(raw, column_type))?)
            }
            ColumnType::Date => Value::Date(
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|_| conversion_error(raw, column_type))?,
            ),
            ColumnType::Time => Value::Time(
                NaiveTime::parse_from_str(raw, "%H:%M:%S%.f")
                    .map_err(|_| conversion_error(raw, column_type))?,
            ),
            ColumnType::Timestamp => Value::Timestamp(
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
                    .map_err(|_| conversion_error(raw, column_type))?,
            ),
            ColumnType::TimestampTz => Value::TimestampTz(
                DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z")
                    .map_err(|_| conversion_error(raw, column_type))?,
            ),
            ColumnType::Uuid => {
                Value::Uuid(Uuid::parse_str(raw).map_err(|_| conversion_error(raw, column_type))?)
            }
            ColumnType::Json => Value::Json(
                serde_json::from_str(raw).map_err(|_| conversion_error(raw, column_type))?,
            ),
            ColumnType::Char
            | ColumnType::Varchar
            | ColumnType::Clob
            | ColumnType::TimeTz
            | ColumnType::Interval
            | ColumnType::Other(_) => Value::Text(raw.to_string()),
        };
        Ok(value)
    }

    /// Whether the value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow textual values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, if it fits in 64 bits
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::HugeInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Floating point value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::HugeInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(v) | Value::Text(v) => f.write_str(v),
            Value::Blob(v) => f.write_str(&hex::encode_upper(v)),
            Value::Date(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v),
            Value::TimestampTz(v) => write!(f, "{}", v),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

fn conversion_error(raw: &str, column_type: &ColumnType) -> MapiError {
    MapiError::Conversion(format!("cannot convert '{}' to {:?}", raw, column_type))
}

/// A result row: cells keyed by column position
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row over shared column metadata
    pub fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no cells
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cell at a column position
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Cell of the first column with the given name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.values.get(i))
    }

    /// Column metadata
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Cells in column order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume the row, returning its cells
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Row as a column name to value mapping. When two columns share a
    /// name the first one wins, as with [`Row::get_by_name`].
    pub fn to_map(&self) -> HashMap<String, Value> {
        let mut map = HashMap::with_capacity(self.values.len());
        for (column, value) in self.columns.iter().zip(self.values.iter()) {
            map.entry(column.name.clone()).or_insert_with(|| value.clone());
        }
        map
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}
