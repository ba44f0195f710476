//! Row shapes and the mapping between PostgreSQL values and JSON
//!
//! Rows come back either positional ([`RowMode::Tuple`]) or keyed by column
//! name ([`RowMode::Dict`]). Column order is preserved in both shapes.

use serde_json::{Map, Number, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Decimal;
use sqlx::{Column, Postgres, Row as _, TypeInfo, ValueRef};

use crate::error::{DbError, DbResult};

/// How fetched rows are exposed to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowMode {
    /// Positional values
    #[default]
    Tuple,
    /// Values keyed by column name
    Dict,
}

impl RowMode {
    pub fn from_dict_rows(dict_rows: bool) -> Self {
        if dict_rows {
            RowMode::Dict
        } else {
            RowMode::Tuple
        }
    }
}

/// One fetched row
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Tuple(Vec<Value>),
    Dict(Map<String, Value>),
}

impl Row {
    /// Value at a column position
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Row::Tuple(values) => values.get(index),
            Row::Dict(map) => map.values().nth(index),
        }
    }

    /// Value by column name. Only dict rows carry names.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        match self {
            Row::Tuple(_) => None,
            Row::Dict(map) => map.get(name),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Row::Tuple(values) => values.len(),
            Row::Dict(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the row and keep its first column
    pub fn into_first(self) -> Option<Value> {
        match self {
            Row::Tuple(values) => values.into_iter().next(),
            Row::Dict(map) => map.into_iter().next().map(|(_, value)| value),
        }
    }

    /// Convert to JSON (array for tuples, object for dicts)
    pub fn into_json(self) -> Value {
        match self {
            Row::Tuple(values) => Value::Array(values),
            Row::Dict(map) => Value::Object(map),
        }
    }
}

/// Bind JSON parameters positionally (`$1`, `$2`, ...).
///
/// Null binds as a text NULL, so comparing it against a non-text column needs
/// an explicit cast in the SQL.
pub fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            Value::Array(_) | Value::Object(_) => query.bind(sqlx::types::Json(param)),
        };
    }
    query
}

/// Decode a driver row in the requested shape
pub fn decode_row(row: &PgRow, mode: RowMode) -> DbResult<Row> {
    match mode {
        RowMode::Tuple => {
            let values = (0..row.len())
                .map(|index| decode_column(row, index))
                .collect::<DbResult<Vec<_>>>()?;
            Ok(Row::Tuple(values))
        }
        RowMode::Dict => {
            let mut map = Map::with_capacity(row.len());
            for (index, column) in row.columns().iter().enumerate() {
                map.insert(column.name().to_string(), decode_column(row, index)?);
            }
            Ok(Row::Dict(map))
        }
    }
}

/// Decode only the first column of a driver row. Later columns may have any
/// type, supported or not.
pub fn decode_first_column(row: &PgRow) -> DbResult<Value> {
    decode_column(row, 0)
}

fn decode_column(row: &PgRow, index: usize) -> DbResult<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => Value::Bool(row.try_get::<bool, _>(index)?),
        "INT2" => Value::from(row.try_get::<i16, _>(index)?),
        "INT4" => Value::from(row.try_get::<i32, _>(index)?),
        "INT8" => Value::from(row.try_get::<i64, _>(index)?),
        "FLOAT4" => float(f64::from(row.try_get::<f32, _>(index)?)),
        "FLOAT8" => float(row.try_get::<f64, _>(index)?),
        "NUMERIC" => decimal(row.try_get::<Decimal, _>(index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            Value::String(row.try_get::<String, _>(index)?)
        }
        "JSON" | "JSONB" => row.try_get::<Value, _>(index)?,
        "UUID" => Value::String(row.try_get::<uuid::Uuid, _>(index)?.to_string()),
        "TIMESTAMPTZ" => Value::String(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(index)?
                .to_rfc3339(),
        ),
        "TIMESTAMP" => Value::String(
            row.try_get::<chrono::NaiveDateTime, _>(index)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        "DATE" => Value::String(row.try_get::<chrono::NaiveDate, _>(index)?.to_string()),
        "TIME" => Value::String(row.try_get::<chrono::NaiveTime, _>(index)?.to_string()),
        "BYTEA" => Value::from(row.try_get::<Vec<u8>, _>(index)?),
        "VOID" => Value::Null,
        _ => {
            let column = row.columns()[index].name().to_string();
            return Err(DbError::unsupported_column(column, type_name));
        }
    };
    Ok(value)
}

// NaN and infinities have no JSON representation.
fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

// Whole numbers that fit an i64 stay numbers; anything else keeps its exact
// digits as a string.
fn decimal(value: Decimal) -> Value {
    let normalized = value.normalize();
    if normalized.scale() == 0 {
        if let Ok(n) = i64::try_from(normalized.mantissa()) {
            return Value::from(n);
        }
    }
    Value::String(value.to_string())
}
