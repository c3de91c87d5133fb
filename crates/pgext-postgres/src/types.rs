//! Value model and Postgres type mapping.
//!
//! [`ExtractedValue`] is what a column accessor reads off a record, and
//! [`PgType`] is the column's declared type mapping. The binary copy encoder
//! and the parameter binder both work from the pair.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgArguments;
use sqlx::Arguments;
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

use crate::{PgExtError, Result};

/// Underlying integer representation of an enumeration member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumRepr {
    I16(i16),
    I32(i32),
    I64(i64),
}

impl EnumRepr {
    /// The plain integer value that is stored for this member.
    pub fn into_value(self) -> ExtractedValue {
        match self {
            EnumRepr::I16(v) => ExtractedValue::SmallInt(v),
            EnumRepr::I32(v) => ExtractedValue::Int(v),
            EnumRepr::I64(v) => ExtractedValue::BigInt(v),
        }
    }
}

/// An enumeration member as read off a record, before coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub label: Cow<'static, str>,
    pub repr: EnumRepr,
}

/// Implemented by application enums that are persisted as integers.
///
/// ```rust,ignore
/// #[derive(Clone, Copy)]
/// enum Status { Active, Inactive }
///
/// impl PgEnum for Status {
///     fn label(&self) -> &'static str {
///         match self { Status::Active => "Active", Status::Inactive => "Inactive" }
///     }
///     fn repr(&self) -> EnumRepr { EnumRepr::I32(*self as i32) }
/// }
/// ```
pub trait PgEnum {
    fn label(&self) -> &'static str;
    fn repr(&self) -> EnumRepr;
}

/// Represents a single column value extracted from a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedValue {
    /// NULL value
    Null,
    /// Boolean (BOOLEAN)
    Bool(bool),
    /// Small integer (SMALLINT)
    SmallInt(i16),
    /// Integer (INTEGER)
    Int(i32),
    /// Big integer (BIGINT)
    BigInt(i64),
    /// Single-precision float (REAL)
    Float(f32),
    /// Double-precision float (DOUBLE PRECISION)
    Double(f64),
    /// Variable-length string (VARCHAR, TEXT)
    String(String),
    /// Binary data (BYTEA)
    Bytes(Vec<u8>),
    /// UUID (UUID)
    Uuid(Uuid),
    /// Date (DATE)
    Date(NaiveDate),
    /// Time (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    Timestamp(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    TimestampTz(DateTime<Utc>),
    /// JSON/JSONB (JSON, JSONB)
    Json(JsonValue),
    /// Array of values (ARRAY)
    Array(Vec<ExtractedValue>),
    /// Decimal/Numeric (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Enumeration member, converted to its integer before it is written
    Enum(EnumValue),
}

impl ExtractedValue {
    /// Wraps an application enum member.
    pub fn from_enum<E: PgEnum>(member: &E) -> Self {
        ExtractedValue::Enum(EnumValue {
            label: Cow::Borrowed(member.label()),
            repr: member.repr(),
        })
    }

    /// Wraps a list of application enum members as an array of `Enum` values.
    pub fn enum_list<E: PgEnum>(members: &[E]) -> Self {
        ExtractedValue::Array(members.iter().map(ExtractedValue::from_enum).collect())
    }

    /// Returns the PostgreSQL type name for this value.
    pub fn pg_type_name(&self) -> &'static str {
        match self {
            ExtractedValue::Null => "NULL",
            ExtractedValue::Bool(_) => "BOOLEAN",
            ExtractedValue::SmallInt(_) => "SMALLINT",
            ExtractedValue::Int(_) => "INTEGER",
            ExtractedValue::BigInt(_) => "BIGINT",
            ExtractedValue::Float(_) => "REAL",
            ExtractedValue::Double(_) => "DOUBLE PRECISION",
            ExtractedValue::String(_) => "TEXT",
            ExtractedValue::Bytes(_) => "BYTEA",
            ExtractedValue::Uuid(_) => "UUID",
            ExtractedValue::Date(_) => "DATE",
            ExtractedValue::Time(_) => "TIME",
            ExtractedValue::Timestamp(_) => "TIMESTAMP",
            ExtractedValue::TimestampTz(_) => "TIMESTAMPTZ",
            ExtractedValue::Json(_) => "JSONB",
            ExtractedValue::Array(_) => "ARRAY",
            ExtractedValue::Decimal(_) => "NUMERIC",
            ExtractedValue::Enum(_) => "ENUM",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ExtractedValue::Null)
    }

    /// Bind this value to a sqlx query as a parameter of the given column type.
    ///
    /// The column type only matters for NULL (which must be sent with the
    /// column's OID) and for enum members, which are bound as their integer.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be bound as that type.
    pub fn bind_as(&self, pg_type: &PgType, arguments: &mut PgArguments) -> Result<()> {
        fn bind_err(kind: &str) -> impl FnOnce(sqlx::error::BoxDynError) -> PgExtError + '_ {
            move |e| PgExtError::Serialization(format!("Failed to bind {}: {}", kind, e))
        }

        match self {
            ExtractedValue::Null => bind_null(pg_type, arguments),
            ExtractedValue::Bool(v) => arguments.add(*v).map_err(bind_err("BOOL")),
            ExtractedValue::SmallInt(v) => arguments.add(*v).map_err(bind_err("SMALLINT")),
            ExtractedValue::Int(v) => arguments.add(*v).map_err(bind_err("INT")),
            ExtractedValue::BigInt(v) => arguments.add(*v).map_err(bind_err("BIGINT")),
            ExtractedValue::Float(v) => arguments.add(*v).map_err(bind_err("FLOAT")),
            ExtractedValue::Double(v) => arguments.add(*v).map_err(bind_err("DOUBLE")),
            ExtractedValue::String(v) => arguments.add(v.clone()).map_err(bind_err("STRING")),
            ExtractedValue::Bytes(v) => arguments.add(v.clone()).map_err(bind_err("BYTES")),
            ExtractedValue::Uuid(v) => arguments.add(*v).map_err(bind_err("UUID")),
            ExtractedValue::Date(v) => arguments.add(*v).map_err(bind_err("DATE")),
            ExtractedValue::Time(v) => arguments.add(*v).map_err(bind_err("TIME")),
            ExtractedValue::Timestamp(v) => arguments.add(*v).map_err(bind_err("TIMESTAMP")),
            ExtractedValue::TimestampTz(v) => arguments.add(*v).map_err(bind_err("TIMESTAMPTZ")),
            ExtractedValue::Json(v) => arguments.add(v.clone()).map_err(bind_err("JSON")),
            ExtractedValue::Decimal(v) => arguments.add(*v).map_err(bind_err("NUMERIC")),
            ExtractedValue::Enum(e) => e.repr.into_value().bind_as(pg_type, arguments),
            ExtractedValue::Array(values) => bind_array(values, pg_type, arguments),
        }
    }
}

/// Binds a typed NULL so the server sees the column's own type.
fn bind_null(pg_type: &PgType, arguments: &mut PgArguments) -> Result<()> {
    let result = match pg_type {
        PgType::Bool => arguments.add(Option::<bool>::None),
        PgType::Int2 => arguments.add(Option::<i16>::None),
        PgType::Int4 => arguments.add(Option::<i32>::None),
        PgType::Int8 => arguments.add(Option::<i64>::None),
        PgType::Float4 => arguments.add(Option::<f32>::None),
        PgType::Float8 => arguments.add(Option::<f64>::None),
        PgType::Numeric => arguments.add(Option::<Decimal>::None),
        PgType::Text | PgType::Varchar => arguments.add(Option::<String>::None),
        PgType::Bytea => arguments.add(Option::<Vec<u8>>::None),
        PgType::Uuid => arguments.add(Option::<Uuid>::None),
        PgType::Date => arguments.add(Option::<NaiveDate>::None),
        PgType::Time => arguments.add(Option::<NaiveTime>::None),
        PgType::Timestamp => arguments.add(Option::<NaiveDateTime>::None),
        PgType::TimestampTz => arguments.add(Option::<DateTime<Utc>>::None),
        PgType::Json | PgType::Jsonb => arguments.add(Option::<JsonValue>::None),
        PgType::Array(elem) => match elem.as_ref() {
            PgType::Int2 => arguments.add(Option::<Vec<i16>>::None),
            PgType::Int4 => arguments.add(Option::<Vec<i32>>::None),
            PgType::Int8 => arguments.add(Option::<Vec<i64>>::None),
            PgType::Bool => arguments.add(Option::<Vec<bool>>::None),
            PgType::Text | PgType::Varchar => arguments.add(Option::<Vec<String>>::None),
            other => {
                return Err(PgExtError::Serialization(format!(
                    "Binding NULL {}[] is not supported",
                    other
                )))
            }
        },
    };
    result.map_err(|e| PgExtError::Serialization(format!("Failed to bind NULL: {}", e)))
}

/// Binds an array as a native Postgres array of the column's element type.
fn bind_array(values: &[ExtractedValue], pg_type: &PgType, arguments: &mut PgArguments) -> Result<()> {
    let elem = match pg_type {
        PgType::Array(elem) => elem.as_ref(),
        PgType::Json | PgType::Jsonb => {
            let json = values
                .iter()
                .map(extracted_to_json)
                .collect::<Result<Vec<_>>>()?;
            return arguments
                .add(JsonValue::Array(json))
                .map_err(|e| PgExtError::Serialization(format!("Failed to bind JSON array: {}", e)));
        }
        other => {
            return Err(PgExtError::Serialization(format!(
                "Cannot bind ARRAY value to {} parameter",
                other
            )))
        }
    };

    // Enum members bind as their integers, like the copy path.
    let values: Vec<ExtractedValue> = values
        .iter()
        .map(|v| match v {
            ExtractedValue::Enum(e) => e.repr.into_value(),
            other => other.clone(),
        })
        .collect();

    macro_rules! collect_elements {
        ($variant:ident, $ty:ty) => {{
            let mut out: Vec<Option<$ty>> = Vec::with_capacity(values.len());
            for value in &values {
                match value {
                    ExtractedValue::$variant(v) => out.push(Some(v.clone())),
                    ExtractedValue::Null => out.push(None),
                    other => {
                        return Err(PgExtError::Serialization(format!(
                            "Cannot bind {} element into {}[] parameter",
                            other.pg_type_name(),
                            elem
                        )))
                    }
                }
            }
            arguments
                .add(out)
                .map_err(|e| PgExtError::Serialization(format!("Failed to bind {}[]: {}", elem, e)))
        }};
    }

    match elem {
        PgType::Int2 => collect_elements!(SmallInt, i16),
        PgType::Int4 => collect_elements!(Int, i32),
        PgType::Int8 => collect_elements!(BigInt, i64),
        PgType::Bool => collect_elements!(Bool, bool),
        PgType::Text | PgType::Varchar => collect_elements!(String, String),
        PgType::Uuid => collect_elements!(Uuid, Uuid),
        PgType::Float8 => collect_elements!(Double, f64),
        other => Err(PgExtError::Serialization(format!(
            "Binding {}[] parameters is not supported",
            other
        ))),
    }
}

/// Converts a value to JSON. Enum members become their label.
pub fn extracted_to_json(value: &ExtractedValue) -> Result<JsonValue> {
    Ok(match value {
        ExtractedValue::Null => JsonValue::Null,
        ExtractedValue::Bool(v) => JsonValue::Bool(*v),
        ExtractedValue::SmallInt(v) => JsonValue::from(*v),
        ExtractedValue::Int(v) => JsonValue::from(*v),
        ExtractedValue::BigInt(v) => JsonValue::from(*v),
        ExtractedValue::Float(v) => JsonValue::from(*v),
        ExtractedValue::Double(v) => JsonValue::from(*v),
        ExtractedValue::String(v) => JsonValue::String(v.clone()),
        ExtractedValue::Uuid(v) => JsonValue::String(v.to_string()),
        ExtractedValue::Date(v) => JsonValue::String(v.to_string()),
        ExtractedValue::Time(v) => JsonValue::String(v.to_string()),
        ExtractedValue::Timestamp(v) => JsonValue::String(v.to_string()),
        ExtractedValue::TimestampTz(v) => JsonValue::String(v.to_rfc3339()),
        ExtractedValue::Json(v) => v.clone(),
        ExtractedValue::Decimal(v) => JsonValue::String(v.to_string()),
        ExtractedValue::Enum(e) => JsonValue::String(e.label.to_string()),
        ExtractedValue::Array(values) => {
            JsonValue::Array(values.iter().map(extracted_to_json).collect::<Result<_>>()?)
        }
        ExtractedValue::Bytes(_) => {
            return Err(PgExtError::Serialization(
                "BYTEA values have no JSON representation".to_string(),
            ))
        }
    })
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ExtractedValue {
                fn from(value: $ty) -> Self {
                    ExtractedValue::$variant(value)
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    f32 => Float,
    f64 => Double,
    String => String,
    Vec<u8> => Bytes,
    Uuid => Uuid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
    JsonValue => Json,
    Decimal => Decimal,
}

impl From<&str> for ExtractedValue {
    fn from(value: &str) -> Self {
        ExtractedValue::String(value.to_string())
    }
}

impl<T: Into<ExtractedValue>> From<Option<T>> for ExtractedValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ExtractedValue::Null)
    }
}

/// Postgres column type mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Varchar,
    Bytea,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
    Jsonb,
    /// One-dimensional array of the element type
    Array(Box<PgType>),
}

impl PgType {
    /// Shorthand for `PgType::Array(Box::new(elem))`.
    pub fn array_of(elem: PgType) -> Self {
        PgType::Array(Box::new(elem))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, PgType::Array(_))
    }

    /// The type's OID from `pg_type`.
    pub fn oid(&self) -> u32 {
        match self {
            PgType::Bool => 16,
            PgType::Bytea => 17,
            PgType::Int8 => 20,
            PgType::Int2 => 21,
            PgType::Int4 => 23,
            PgType::Text => 25,
            PgType::Json => 114,
            PgType::Float4 => 700,
            PgType::Float8 => 701,
            PgType::Varchar => 1043,
            PgType::Date => 1082,
            PgType::Time => 1083,
            PgType::Timestamp => 1114,
            PgType::TimestampTz => 1184,
            PgType::Numeric => 1700,
            PgType::Uuid => 2950,
            PgType::Jsonb => 3802,
            PgType::Array(elem) => elem.array_oid(),
        }
    }

    /// OID of the array type whose elements are `self`.
    fn array_oid(&self) -> u32 {
        match self {
            PgType::Bool => 1000,
            PgType::Bytea => 1001,
            PgType::Int2 => 1005,
            PgType::Int4 => 1007,
            PgType::Text => 1009,
            PgType::Varchar => 1015,
            PgType::Int8 => 1016,
            PgType::Float4 => 1021,
            PgType::Float8 => 1022,
            PgType::Timestamp => 1115,
            PgType::Date => 1182,
            PgType::Time => 1183,
            PgType::TimestampTz => 1185,
            PgType::Numeric => 1231,
            PgType::Json => 199,
            PgType::Uuid => 2951,
            PgType::Jsonb => 3807,
            // Nested arrays share the element array's OID in Postgres.
            PgType::Array(elem) => elem.array_oid(),
        }
    }

    /// SQL spelling of the type, as used in DDL.
    pub fn sql_name(&self) -> Cow<'static, str> {
        let name = match self {
            PgType::Bool => "BOOLEAN",
            PgType::Int2 => "SMALLINT",
            PgType::Int4 => "INTEGER",
            PgType::Int8 => "BIGINT",
            PgType::Float4 => "REAL",
            PgType::Float8 => "DOUBLE PRECISION",
            PgType::Numeric => "NUMERIC",
            PgType::Text => "TEXT",
            PgType::Varchar => "VARCHAR",
            PgType::Bytea => "BYTEA",
            PgType::Uuid => "UUID",
            PgType::Date => "DATE",
            PgType::Time => "TIME",
            PgType::Timestamp => "TIMESTAMP",
            PgType::TimestampTz => "TIMESTAMPTZ",
            PgType::Json => "JSON",
            PgType::Jsonb => "JSONB",
            PgType::Array(elem) => return Cow::Owned(format!("{}[]", elem.sql_name())),
        };
        Cow::Borrowed(name)
    }
}

impl fmt::Display for PgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}
