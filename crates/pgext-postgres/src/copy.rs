//! Binary `COPY ... FROM STDIN (FORMAT BINARY)` encoding.
//!
//! [`BinaryCopyEncoder`] produces the `PGCOPY` stream: a fixed header, one
//! tuple per row (i16 field count, then an i32 length and the binary value for
//! each field) and a trailer. Values are encoded according to the destination
//! column's [`PgType`], so the encoder holds the column types of the target
//! statement and refuses any row that does not match them.
//!
//! [`CopySink`] is the seam between the encoder and the wire: the bulk loader
//! sends encoded chunks into a sink and either finishes or aborts it.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, Timelike};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgCopyIn};
use std::ops::DerefMut;

use crate::types::{ExtractedValue, PgType};
use crate::{PgExtError, Result};

/// Signature that opens every binary copy stream.
pub const COPY_SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// Days between 0001-01-01 (day 1 in chrono's CE count) and 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;

/// Microseconds between the Unix epoch and 2000-01-01 00:00:00 UTC.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;

/// Streaming encoder for one binary copy stream.
#[derive(Debug)]
pub struct BinaryCopyEncoder {
    buf: BytesMut,
    column_types: Vec<PgType>,
    /// Index of the next field in the current row; `None` before the first row
    field_cursor: Option<usize>,
    rows: u64,
    finished: bool,
}

impl BinaryCopyEncoder {
    /// Creates an encoder for the given ordered column types and writes the header.
    pub fn new(column_types: Vec<PgType>) -> Result<Self> {
        if column_types.is_empty() {
            return Err(PgExtError::Validation(
                "Binary copy requires at least one column".to_string(),
            ));
        }
        if column_types.len() > i16::MAX as usize {
            return Err(PgExtError::Validation(format!(
                "Binary copy supports at most {} columns, got {}",
                i16::MAX,
                column_types.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(8 * 1024);
        buf.extend_from_slice(COPY_SIGNATURE);
        buf.put_i32(0); // Flags: no OIDs
        buf.put_i32(0); // Header extension length

        Ok(Self {
            buf,
            column_types,
            field_cursor: None,
            rows: 0,
            finished: false,
        })
    }

    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }

    /// Number of rows started so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Bytes encoded but not yet taken with [`take_chunk`](Self::take_chunk).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Starts a new tuple. The previous tuple must be complete.
    pub fn start_row(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_row_complete()?;
        self.buf.put_i16(self.column_types.len() as i16);
        self.field_cursor = Some(0);
        self.rows += 1;
        Ok(())
    }

    /// Writes the next field of the current tuple.
    pub fn write(&mut self, value: &ExtractedValue) -> Result<()> {
        self.ensure_open()?;
        let index = match self.field_cursor {
            Some(index) if index < self.column_types.len() => index,
            Some(_) => {
                return Err(PgExtError::Protocol(format!(
                    "Row {} already has all {} fields",
                    self.rows,
                    self.column_types.len()
                )))
            }
            None => {
                return Err(PgExtError::Protocol(
                    "Field written before the first row was started".to_string(),
                ))
            }
        };

        encode_field(&mut self.buf, value, &self.column_types[index]).map_err(|e| match e {
            PgExtError::Protocol(msg) => {
                PgExtError::Protocol(format!("row {}, field {}: {}", self.rows, index + 1, msg))
            }
            other => other,
        })?;
        self.field_cursor = Some(index + 1);
        Ok(())
    }

    /// Writes the trailer. The last tuple must be complete.
    pub fn finish(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_row_complete()?;
        self.buf.put_i16(-1);
        self.finished = true;
        Ok(())
    }

    /// Hands out everything encoded so far.
    pub fn take_chunk(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(PgExtError::Protocol("Copy stream already finished".to_string()));
        }
        Ok(())
    }

    fn ensure_row_complete(&self) -> Result<()> {
        match self.field_cursor {
            Some(written) if written != self.column_types.len() => Err(PgExtError::Protocol(format!(
                "Row {} has {} fields, expected {}",
                self.rows,
                written,
                self.column_types.len()
            ))),
            _ => Ok(()),
        }
    }
}

/// Writes one field: its i32 length (-1 for NULL) followed by the value.
pub fn encode_field(buf: &mut BytesMut, value: &ExtractedValue, pg_type: &PgType) -> Result<()> {
    if value.is_null() {
        buf.put_i32(-1);
        return Ok(());
    }

    // Reserve the length word and patch it once the body is written.
    let len_pos = buf.len();
    buf.put_i32(0);
    encode_value(buf, value, pg_type)?;
    let body_len = buf.len() - len_pos - 4;
    let body_len = i32::try_from(body_len).map_err(|_| {
        PgExtError::Protocol(format!("Field of {} bytes exceeds the copy field limit", body_len))
    })?;
    buf[len_pos..len_pos + 4].copy_from_slice(&body_len.to_be_bytes());
    Ok(())
}

fn mismatch(value: &ExtractedValue, pg_type: &PgType) -> PgExtError {
    PgExtError::Protocol(format!(
        "cannot encode {} value as {}",
        value.pg_type_name(),
        pg_type
    ))
}

fn encode_value(buf: &mut BytesMut, value: &ExtractedValue, pg_type: &PgType) -> Result<()> {
    use ExtractedValue as V;

    match (value, pg_type) {
        (V::Bool(v), PgType::Bool) => buf.put_u8(u8::from(*v)),

        (V::SmallInt(v), PgType::Int2) => buf.put_i16(*v),
        (V::SmallInt(v), PgType::Int4) => buf.put_i32(i32::from(*v)),
        (V::SmallInt(v), PgType::Int8) => buf.put_i64(i64::from(*v)),
        (V::Int(v), PgType::Int2) => buf.put_i16(narrow(*v, value, pg_type)?),
        (V::Int(v), PgType::Int4) => buf.put_i32(*v),
        (V::Int(v), PgType::Int8) => buf.put_i64(i64::from(*v)),
        (V::BigInt(v), PgType::Int2) => buf.put_i16(narrow(*v, value, pg_type)?),
        (V::BigInt(v), PgType::Int4) => buf.put_i32(narrow(*v, value, pg_type)?),
        (V::BigInt(v), PgType::Int8) => buf.put_i64(*v),

        (V::Float(v), PgType::Float4) => buf.put_f32(*v),
        (V::Float(v), PgType::Float8) => buf.put_f64(f64::from(*v)),
        (V::Double(v), PgType::Float8) => buf.put_f64(*v),

        (V::Decimal(v), PgType::Numeric) => encode_numeric(buf, v),

        (V::String(v), PgType::Text | PgType::Varchar | PgType::Json) => {
            buf.extend_from_slice(v.as_bytes())
        }
        (V::String(v), PgType::Jsonb) => {
            buf.put_u8(1);
            buf.extend_from_slice(v.as_bytes());
        }
        (V::Json(v), PgType::Json) => buf.extend_from_slice(serde_json::to_string(v)?.as_bytes()),
        (V::Json(v), PgType::Jsonb) => {
            buf.put_u8(1);
            buf.extend_from_slice(serde_json::to_string(v)?.as_bytes());
        }

        (V::Bytes(v), PgType::Bytea) => buf.extend_from_slice(v),
        (V::Uuid(v), PgType::Uuid) => buf.extend_from_slice(v.as_bytes()),

        (V::Date(v), PgType::Date) => buf.put_i32(v.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE),
        (V::Time(v), PgType::Time) => {
            let micros = i64::from(v.num_seconds_from_midnight()) * 1_000_000
                + i64::from(v.nanosecond()) / 1_000;
            buf.put_i64(micros);
        }
        (V::Timestamp(v), PgType::Timestamp | PgType::TimestampTz) => {
            buf.put_i64(v.and_utc().timestamp_micros() - PG_EPOCH_OFFSET_MICROS)
        }
        (V::TimestampTz(v), PgType::TimestampTz | PgType::Timestamp) => {
            buf.put_i64(v.timestamp_micros() - PG_EPOCH_OFFSET_MICROS)
        }

        // Enum members that were not coerced to integers: labels for text, JSON strings for json.
        (V::Enum(e), PgType::Text | PgType::Varchar) => buf.extend_from_slice(e.label.as_bytes()),
        (V::Enum(_) | V::Array(_), PgType::Json) => {
            let json = crate::types::extracted_to_json(value)?;
            buf.extend_from_slice(serde_json::to_string(&json)?.as_bytes());
        }
        (V::Enum(_) | V::Array(_), PgType::Jsonb) => {
            let json = crate::types::extracted_to_json(value)?;
            buf.put_u8(1);
            buf.extend_from_slice(serde_json::to_string(&json)?.as_bytes());
        }
        (V::Enum(e), PgType::Int2 | PgType::Int4 | PgType::Int8) => {
            encode_value(buf, &e.repr.into_value(), pg_type)?
        }

        (V::Array(values), PgType::Array(elem)) => encode_array(buf, values, elem)?,

        _ => return Err(mismatch(value, pg_type)),
    }
    Ok(())
}

fn narrow<S, T>(v: S, value: &ExtractedValue, pg_type: &PgType) -> Result<T>
where
    S: Copy + std::fmt::Display,
    T: TryFrom<S>,
{
    T::try_from(v).map_err(|_| {
        PgExtError::Protocol(format!(
            "{} value {} out of range for {}",
            value.pg_type_name(),
            v,
            pg_type
        ))
    })
}

/// One-dimensional array: ndim, has-null flag, element OID, length, lower bound, elements.
fn encode_array(buf: &mut BytesMut, values: &[ExtractedValue], elem: &PgType) -> Result<()> {
    if elem.is_array() || values.iter().any(|v| matches!(v, ExtractedValue::Array(_))) {
        return Err(PgExtError::Protocol(
            "multi-dimensional arrays are not supported".to_string(),
        ));
    }

    let len = i32::try_from(values.len()).map_err(|_| {
        PgExtError::Protocol(format!("array of {} elements is too large", values.len()))
    })?;
    let has_null = values.iter().any(ExtractedValue::is_null);

    if values.is_empty() {
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_u32(elem.oid());
        return Ok(());
    }

    buf.put_i32(1);
    buf.put_i32(i32::from(has_null));
    buf.put_u32(elem.oid());
    buf.put_i32(len);
    buf.put_i32(1);

    for value in values {
        encode_field(buf, value, elem)?;
    }
    Ok(())
}

/// NUMERIC: ndigits, weight, sign, dscale, then base-10000 digit groups.
fn encode_numeric(buf: &mut BytesMut, value: &Decimal) {
    let scale = value.scale() as usize;
    let sign = if value.is_sign_negative() && !value.is_zero() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };

    let digits = value.mantissa().unsigned_abs().to_string();
    let (int_part, frac_part) = if digits.len() > scale {
        let (int_part, frac_part) = digits.split_at(digits.len() - scale);
        (int_part.to_string(), frac_part.to_string())
    } else {
        (String::new(), format!("{:0>width$}", digits, width = scale))
    };

    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let int_digits = format!("{}{}", "0".repeat(int_pad), int_part);
    let frac_digits = format!("{}{}", frac_part, "0".repeat(frac_pad));

    let to_groups = |s: &str| -> Vec<i16> {
        s.as_bytes()
            .chunks(4)
            .map(|chunk| {
                chunk
                    .iter()
                    .fold(0i16, |acc, d| acc * 10 + i16::from(d - b'0'))
            })
            .collect()
    };

    let int_groups = to_groups(&int_digits);
    let mut weight = int_groups.len() as i16 - 1;
    let mut groups: Vec<i16> = int_groups;
    groups.extend(to_groups(&frac_digits));

    let leading_zeros = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading_zeros);
    weight -= leading_zeros as i16;
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        weight = 0;
    }

    buf.put_i16(groups.len() as i16);
    buf.put_i16(weight);
    buf.put_u16(sign);
    buf.put_u16(scale as u16);
    for group in groups {
        buf.put_i16(group);
    }
}

/// Destination of an encoded copy stream.
#[async_trait]
pub trait CopySink: Send {
    /// Sends one chunk of the encoded stream.
    async fn send(&mut self, chunk: Bytes) -> Result<()>;

    /// Completes the copy and returns the number of rows the server accepted.
    async fn finish(self) -> Result<u64>;

    /// Aborts the copy; the server discards everything sent so far.
    async fn abort(self, reason: &str) -> Result<()>;
}

#[async_trait]
impl<C> CopySink for PgCopyIn<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn send(&mut self, chunk: Bytes) -> Result<()> {
        PgCopyIn::send(self, chunk).await?;
        Ok(())
    }

    async fn finish(self) -> Result<u64> {
        Ok(PgCopyIn::finish(self).await?)
    }

    async fn abort(self, reason: &str) -> Result<()> {
        Ok(PgCopyIn::abort(self, reason.to_string()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnumRepr, EnumValue};
    use chrono::{NaiveDate, NaiveTime};
    use std::borrow::Cow;
    use std::str::FromStr;

    fn encoded(value: &ExtractedValue, pg_type: &PgType) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_field(&mut buf, value, pg_type).unwrap();
        buf.to_vec()
    }

    fn status(label: &'static str, repr: i32) -> ExtractedValue {
        ExtractedValue::Enum(EnumValue {
            label: Cow::Borrowed(label),
            repr: EnumRepr::I32(repr),
        })
    }

    #[test]
    fn test_header_and_trailer() {
        let mut encoder = BinaryCopyEncoder::new(vec![PgType::Int4]).unwrap();
        encoder.finish().unwrap();
        let bytes = encoder.take_chunk();

        let mut expected = COPY_SIGNATURE.to_vec();
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
        expected.extend_from_slice(&(-1i16).to_be_bytes());
        assert_eq!(bytes.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_row_frame_layout() {
        let mut encoder = BinaryCopyEncoder::new(vec![PgType::Int4, PgType::Text]).unwrap();
        let header_len = encoder.take_chunk().len();
        assert_eq!(header_len, 19);

        encoder.start_row().unwrap();
        encoder.write(&ExtractedValue::Int(7)).unwrap();
        encoder.write(&ExtractedValue::Null).unwrap();
        let row = encoder.take_chunk();

        let mut expected = 2i16.to_be_bytes().to_vec();
        expected.extend_from_slice(&4i32.to_be_bytes());
        expected.extend_from_slice(&7i32.to_be_bytes());
        expected.extend_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(row.as_ref(), expected.as_slice());
        assert_eq!(encoder.rows(), 1);
    }

    #[test]
    fn test_short_row_is_protocol_error() {
        let mut encoder = BinaryCopyEncoder::new(vec![PgType::Int4, PgType::Int4]).unwrap();
        encoder.start_row().unwrap();
        encoder.write(&ExtractedValue::Int(1)).unwrap();

        assert!(matches!(encoder.start_row(), Err(PgExtError::Protocol(_))));
        assert!(matches!(encoder.finish(), Err(PgExtError::Protocol(_))));
    }

    #[test]
    fn test_long_row_is_protocol_error() {
        let mut encoder = BinaryCopyEncoder::new(vec![PgType::Int4]).unwrap();
        encoder.start_row().unwrap();
        encoder.write(&ExtractedValue::Int(1)).unwrap();
        let result = encoder.write(&ExtractedValue::Int(2));
        assert!(matches!(result, Err(PgExtError::Protocol(_))));
    }

    #[test]
    fn test_write_before_row_is_protocol_error() {
        let mut encoder = BinaryCopyEncoder::new(vec![PgType::Int4]).unwrap();
        let result = encoder.write(&ExtractedValue::Int(1));
        assert!(matches!(result, Err(PgExtError::Protocol(_))));
    }

    #[test]
    fn test_write_after_finish_is_protocol_error() {
        let mut encoder = BinaryCopyEncoder::new(vec![PgType::Int4]).unwrap();
        encoder.finish().unwrap();
        assert!(matches!(encoder.start_row(), Err(PgExtError::Protocol(_))));
    }

    #[test]
    fn test_no_columns_rejected() {
        assert!(matches!(
            BinaryCopyEncoder::new(Vec::new()),
            Err(PgExtError::Validation(_))
        ));
    }

    #[test]
    fn test_integer_widening_and_narrowing() {
        assert_eq!(
            encoded(&ExtractedValue::SmallInt(2), &PgType::Int8),
            [0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 2]
        );
        assert_eq!(
            encoded(&ExtractedValue::BigInt(300), &PgType::Int2),
            [0, 0, 0, 2, 1, 44]
        );

        let mut buf = BytesMut::new();
        let result = encode_field(&mut buf, &ExtractedValue::BigInt(i64::MAX), &PgType::Int4);
        assert!(matches!(result, Err(PgExtError::Protocol(_))));
    }

    #[test]
    fn test_type_mismatch_is_protocol_error() {
        let mut buf = BytesMut::new();
        let result = encode_field(&mut buf, &ExtractedValue::String("x".into()), &PgType::Int4);
        assert!(matches!(result, Err(PgExtError::Protocol(_))));
    }

    #[test]
    fn test_text_and_jsonb() {
        assert_eq!(
            encoded(&ExtractedValue::String("hi".into()), &PgType::Text),
            [0, 0, 0, 2, b'h', b'i']
        );
        assert_eq!(
            encoded(&ExtractedValue::Json(serde_json::json!(1)), &PgType::Jsonb),
            [0, 0, 0, 2, 1, b'1']
        );
    }

    #[test]
    fn test_date_time_epochs() {
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        assert_eq!(
            encoded(&ExtractedValue::Date(epoch), &PgType::Date),
            [0, 0, 0, 4, 0, 0, 0, 0]
        );
        let next_day = NaiveDate::from_ymd_opt(2000, 1, 2).unwrap();
        assert_eq!(
            encoded(&ExtractedValue::Date(next_day), &PgType::Date),
            [0, 0, 0, 4, 0, 0, 0, 1]
        );

        let ts = epoch.and_hms_opt(0, 0, 1).unwrap();
        let mut expected = 8i32.to_be_bytes().to_vec();
        expected.extend_from_slice(&1_000_000i64.to_be_bytes());
        assert_eq!(encoded(&ExtractedValue::Timestamp(ts), &PgType::Timestamp), expected);

        let time = NaiveTime::from_hms_micro_opt(0, 0, 2, 5).unwrap();
        let mut expected = 8i32.to_be_bytes().to_vec();
        expected.extend_from_slice(&2_000_005i64.to_be_bytes());
        assert_eq!(encoded(&ExtractedValue::Time(time), &PgType::Time), expected);
    }

    fn numeric_body(text: &str) -> Vec<i16> {
        let mut buf = BytesMut::new();
        encode_numeric(&mut buf, &Decimal::from_str(text).unwrap());
        buf.chunks(2)
            .map(|c| i16::from_be_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_numeric_encoding() {
        // ndigits, weight, sign, dscale, digits...
        assert_eq!(numeric_body("12345.678"), vec![3, 1, 0, 3, 1, 2345, 6780]);
        assert_eq!(numeric_body("1.85"), vec![2, 0, 0, 2, 1, 8500]);
        assert_eq!(numeric_body("0.00001"), vec![1, -2, 0, 5, 1000]);
        assert_eq!(numeric_body("-10000"), vec![1, 1, 0x4000, 0, 1]);
        assert_eq!(numeric_body("0"), vec![0, 0, 0, 0]);
        assert_eq!(numeric_body("0.00"), vec![0, 0, 0, 2]);
    }

    #[test]
    fn test_int_array_layout() {
        let value = ExtractedValue::Array(vec![ExtractedValue::Int(0), ExtractedValue::Int(2)]);
        let bytes = encoded(&value, &PgType::array_of(PgType::Int4));

        let mut expected = Vec::new();
        expected.extend_from_slice(&36i32.to_be_bytes());
        expected.extend_from_slice(&1i32.to_be_bytes()); // ndim
        expected.extend_from_slice(&0i32.to_be_bytes()); // has nulls
        expected.extend_from_slice(&23u32.to_be_bytes()); // int4
        expected.extend_from_slice(&2i32.to_be_bytes()); // length
        expected.extend_from_slice(&1i32.to_be_bytes()); // lower bound
        for v in [0i32, 2] {
            expected.extend_from_slice(&4i32.to_be_bytes());
            expected.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_empty_array_layout() {
        let bytes = encoded(&ExtractedValue::Array(Vec::new()), &PgType::array_of(PgType::Int4));
        let mut expected = 12i32.to_be_bytes().to_vec();
        expected.extend_from_slice(&0i32.to_be_bytes());
        expected.extend_from_slice(&0i32.to_be_bytes());
        expected.extend_from_slice(&23u32.to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_nested_array_rejected() {
        let nested = ExtractedValue::Array(vec![ExtractedValue::Array(vec![ExtractedValue::Int(1)])]);
        let mut buf = BytesMut::new();
        let result = encode_field(&mut buf, &nested, &PgType::array_of(PgType::Int4));
        assert!(matches!(result, Err(PgExtError::Protocol(_))));
    }

    #[test]
    fn test_unconverted_enum_encodings() {
        assert_eq!(
            encoded(&status("Active", 0), &PgType::Text),
            [0, 0, 0, 6, b'A', b'c', b't', b'i', b'v', b'e']
        );
        let list = ExtractedValue::Array(vec![status("Active", 0)]);
        let bytes = encoded(&list, &PgType::Jsonb);
        assert_eq!(&bytes[4..], b"\x01[\"Active\"]");

        let mut buf = BytesMut::new();
        let result = encode_field(&mut buf, &list, &PgType::Bytea);
        assert!(matches!(result, Err(PgExtError::Protocol(_))));
    }
}
