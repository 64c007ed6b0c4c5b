//! Dynamic values exchanged with PostgreSQL.
//!
//! Sessions never know the Rust types of the columns they touch: caller values
//! are serialised with serde into [`Record`]s, bound as [`SqlValue`] parameters,
//! and result rows are decoded back into [`Record`]s before being deserialised
//! into caller types.
//!
//! [`SqlValue`] encodes itself according to the parameter type PostgreSQL infers
//! for each placeholder, so `Clause::eq("age", 30)` binds an `int4`, `int8` or
//! `numeric` depending on the column it is compared with.
//!
//! `numeric` columns with a fractional part (or beyond `i64`) come back as
//! exact decimal strings; map them to `rust_decimal::Decimal` fields.

use crate::error::{OrmError, OrmResult};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use std::error::Error as StdError;
use std::net::IpAddr;
use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type, to_sql_checked};

type BoxError = Box<dyn StdError + Sync + Send>;

/// One result row (or one serialised value): column name -> value.
pub type Record = Map<String, Value>;

/// A dynamically typed SQL parameter or result column.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlValue(pub Value);

impl SqlValue {
    /// The SQL `NULL` value.
    pub fn null() -> Self {
        Self(Value::Null)
    }

    /// Serialise any value into a `SqlValue`.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> OrmResult<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }

    /// Borrow the JSON representation.
    pub fn as_json(&self) -> &Value {
        &self.0
    }

    /// Take the JSON representation.
    pub fn into_json(self) -> Value {
        self.0
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self(Value::String(value))
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<SqlValue> for Value {
    fn from(value: SqlValue) -> Self {
        value.0
    }
}

/// Serialise a value into a [`Record`]; the value must serialise to a JSON object.
pub fn to_record<T: Serialize + ?Sized>(value: &T) -> OrmResult<Record> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(OrmError::serialization(format!(
            "expected a struct or map, got {}",
            json_kind(&other)
        ))),
    }
}

/// Deserialise a [`Record`] into a caller type.
pub fn from_record<T: DeserializeOwned>(record: Record) -> OrmResult<T> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Whether a value counts as blank for primary keys and timestamps.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Current time as it is stored for `created_at`/`updated_at`/`deleted_at`.
pub(crate) fn now_value() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Decode every column of a driver row into a [`Record`].
pub(crate) fn record_from_row(row: &tokio_postgres::Row) -> OrmResult<Record> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value: SqlValue = row
            .try_get(idx)
            .map_err(|e| OrmError::decode(column.name(), e.to_string()))?;
        record.insert(column.name().to_string(), value.0);
    }
    Ok(record)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_text_type(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    ) || matches!(ty.name(), "citext" | "ltree" | "lquery" | "ltxtquery")
        || matches!(ty.kind(), Kind::Enum(_))
}

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    format!("cannot encode {} as {}", json_kind(value), ty.name()).into()
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_timestamptz(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_naive_datetime(s).map(|naive| naive.and_utc())),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect(),
        _ => None,
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        let value = &self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }

        if let Kind::Array(_) = ty.kind() {
            let Value::Array(items) = value else {
                return Err(mismatch(value, ty));
            };
            let items: Vec<SqlValue> = items.iter().cloned().map(SqlValue).collect();
            return items.to_sql(ty, out);
        }

        if is_text_type(ty) {
            out.extend_from_slice(as_text(value).as_bytes());
            return Ok(IsNull::No);
        }

        match *ty {
            Type::BOOL => match value {
                Value::Bool(b) => b.to_sql(ty, out),
                Value::String(s) => s.trim().parse::<bool>()?.to_sql(ty, out),
                other => Err(mismatch(other, ty)),
            },
            Type::INT2 => {
                let n = as_i64(value).ok_or_else(|| mismatch(value, ty))?;
                i16::try_from(n)?.to_sql(ty, out)
            }
            Type::INT4 => {
                let n = as_i64(value).ok_or_else(|| mismatch(value, ty))?;
                i32::try_from(n)?.to_sql(ty, out)
            }
            Type::INT8 => as_i64(value)
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::OID => {
                let n = as_i64(value).ok_or_else(|| mismatch(value, ty))?;
                u32::try_from(n)?.to_sql(ty, out)
            }
            Type::FLOAT4 => (as_f64(value).ok_or_else(|| mismatch(value, ty))? as f32)
                .to_sql(ty, out),
            Type::FLOAT8 => as_f64(value)
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::NUMERIC => {
                let text = match value {
                    Value::Number(n) => n.to_string(),
                    Value::String(s) => s.trim().to_string(),
                    other => return Err(mismatch(other, ty)),
                };
                numeric::encode(&text, out)?;
                Ok(IsNull::No)
            }
            Type::JSON | Type::JSONB => value.to_sql(ty, out),
            Type::UUID => {
                let Value::String(s) = value else {
                    return Err(mismatch(value, ty));
                };
                uuid::Uuid::parse_str(s)?.to_sql(ty, out)
            }
            Type::TIMESTAMPTZ => parse_timestamptz(value)
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::TIMESTAMP => {
                let Value::String(s) = value else {
                    return Err(mismatch(value, ty));
                };
                parse_naive_datetime(s)
                    .ok_or_else(|| mismatch(value, ty))?
                    .to_sql(ty, out)
            }
            Type::DATE => {
                let Value::String(s) = value else {
                    return Err(mismatch(value, ty));
                };
                let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .or_else(|| parse_naive_datetime(s).map(|dt| dt.date()))
                    .ok_or_else(|| mismatch(value, ty))?;
                date.to_sql(ty, out)
            }
            Type::TIME => {
                let Value::String(s) = value else {
                    return Err(mismatch(value, ty));
                };
                NaiveTime::parse_from_str(s, "%H:%M:%S%.f")?.to_sql(ty, out)
            }
            Type::BYTEA => to_bytes(value)
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::INET => {
                let Value::String(s) = value else {
                    return Err(mismatch(value, ty));
                };
                s.parse::<IpAddr>()?.to_sql(ty, out)
            }
            _ => Err(format!("unsupported parameter type {}", ty.name()).into()),
        }
    }

    fn accepts(ty: &Type) -> bool {
        if let Kind::Array(member) = ty.kind() {
            return <SqlValue as ToSql>::accepts(member);
        }
        is_text_type(ty)
            || matches!(
                *ty,
                Type::BOOL
                    | Type::INT2
                    | Type::INT4
                    | Type::INT8
                    | Type::OID
                    | Type::FLOAT4
                    | Type::FLOAT8
                    | Type::NUMERIC
                    | Type::JSON
                    | Type::JSONB
                    | Type::UUID
                    | Type::TIMESTAMPTZ
                    | Type::TIMESTAMP
                    | Type::DATE
                    | Type::TIME
                    | Type::BYTEA
                    | Type::INET
            )
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for SqlValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if let Kind::Array(_) = ty.kind() {
            let items = Vec::<SqlValue>::from_sql(ty, raw)?;
            return Ok(Self(Value::Array(
                items.into_iter().map(|item| item.0).collect(),
            )));
        }

        if is_text_type(ty) {
            return Ok(Self(Value::String(std::str::from_utf8(raw)?.to_string())));
        }

        let value = match *ty {
            Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
            Type::INT2 => Value::from(i16::from_sql(ty, raw)?),
            Type::INT4 => Value::from(i32::from_sql(ty, raw)?),
            Type::INT8 => Value::from(i64::from_sql(ty, raw)?),
            Type::OID => Value::from(u32::from_sql(ty, raw)?),
            Type::FLOAT4 => float_value(f64::from(f32::from_sql(ty, raw)?)),
            Type::FLOAT8 => float_value(f64::from_sql(ty, raw)?),
            Type::NUMERIC => numeric::decode(raw)?,
            Type::JSON | Type::JSONB => Value::from_sql(ty, raw)?,
            Type::UUID => Value::String(uuid::Uuid::from_sql(ty, raw)?.to_string()),
            Type::TIMESTAMPTZ => Value::String(
                DateTime::<Utc>::from_sql(ty, raw)?.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            Type::TIMESTAMP => Value::String(
                NaiveDateTime::from_sql(ty, raw)?
                    .format("%Y-%m-%dT%H:%M:%S%.f")
                    .to_string(),
            ),
            Type::DATE => Value::String(NaiveDate::from_sql(ty, raw)?.format("%Y-%m-%d").to_string()),
            Type::TIME => Value::String(NaiveTime::from_sql(ty, raw)?.format("%H:%M:%S%.f").to_string()),
            Type::BYTEA => Value::Array(raw.iter().map(|b| Value::from(*b)).collect()),
            Type::INET => Value::String(IpAddr::from_sql(ty, raw)?.to_string()),
            _ => return Err(format!("unsupported column type {}", ty.name()).into()),
        };
        Ok(Self(value))
    }

    fn from_sql_null(_: &Type) -> Result<Self, BoxError> {
        Ok(Self(Value::Null))
    }

    fn accepts(ty: &Type) -> bool {
        <SqlValue as ToSql>::accepts(ty)
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// `numeric` goes through `rust_decimal`. Integral values that fit an `i64`
/// decode to JSON numbers, everything else to its exact decimal text;
/// `NaN` and the infinities travel as strings.
mod numeric {
    use super::BoxError;
    use bytes::{BufMut, BytesMut};
    use rust_decimal::Decimal;
    use serde_json::Value;
    use std::str::FromStr;
    use tokio_postgres::types::{FromSql, ToSql, Type};

    const SPECIALS: [(u16, &str); 3] = [(0xC000, "NaN"), (0xD000, "Infinity"), (0xF000, "-Infinity")];

    pub(super) fn encode(text: &str, out: &mut BytesMut) -> Result<(), BoxError> {
        if let Some((sign, _)) = SPECIALS.iter().find(|(_, name)| name.eq_ignore_ascii_case(text)) {
            // ndigits, weight, sign, dscale
            out.put_i16(0);
            out.put_i16(0);
            out.put_u16(*sign);
            out.put_u16(0);
            return Ok(());
        }
        let decimal = if text.contains(['e', 'E']) {
            Decimal::from_scientific(text)?
        } else {
            Decimal::from_str(text)?
        };
        decimal.to_sql(&Type::NUMERIC, out)?;
        Ok(())
    }

    pub(super) fn decode(raw: &[u8]) -> Result<Value, BoxError> {
        let sign = raw.get(4..6).map(|w| u16::from_be_bytes([w[0], w[1]]));
        if let Some((_, name)) = SPECIALS.iter().find(|(s, _)| Some(*s) == sign) {
            return Ok(Value::String((*name).to_string()));
        }
        let decimal = Decimal::from_sql(&Type::NUMERIC, raw)?;
        if decimal.scale() == 0 {
            if let Ok(n) = i64::try_from(decimal) {
                return Ok(Value::from(n));
            }
        }
        Ok(Value::String(decimal.to_string()))
    }
}
