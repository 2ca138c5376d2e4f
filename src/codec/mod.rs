//! Typed row encoding: a binary wire format for on-disk storage, plus a
//! companion text format used only by adapters (import/export tooling),
//! never by the table's own read/write path.
//!
//! # Binary format
//!
//! ```text
//! [NULL bitmap: ceil(n_columns / 8) bytes]
//! [column_0 bytes if not null]
//! [column_1 bytes if not null]
//! ...
//! ```
//!
//! Fixed-width columns (`I8`..`F64`, `Decimal`, `Date`, `Time`, `Uuid`,
//! `Ipv6`) occupy their [`ColumnType::fixed_width`] bytes unconditionally
//! when not null. Variable-width columns (`Str`, `Bytes`) are
//! length-prefixed with a `u32`. A null column contributes zero bytes
//! beyond its bitmap bit.
//!
//! The NULL bitmap is written even for non-nullable columns (their bit is
//! always clear) so the row layout does not depend on which columns happen
//! to be nullable — a schema migration that flips nullability without
//! changing column order does not change the byte layout of existing rows.

#[cfg(test)]
mod tests;

use std::io;

use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::schema::{Column, ColumnType, Schema};

/// Errors raised while encoding or decoding a row against a [`Schema`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A NOT NULL column received a null value, or a row had the wrong
    /// number of values for its schema.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A value's Rust variant does not match the column's declared type.
    /// FlintDB never implicitly widens (e.g. `U32` into an `I64` column is
    /// rejected, not silently promoted).
    #[error("type mismatch: column {column:?} expects {expected:?}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        actual: &'static str,
    },

    /// A value exceeded the declared bound of its column (string/bytes
    /// length, or a decimal mantissa outside its precision).
    #[error("numeric overflow: {0}")]
    NumericOverflow(String),

    /// Text-format parse failure (adapters only).
    #[error("malformed text row: {0}")]
    MalformedText(String),
}

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Fixed-scale decimal mantissa; the scale itself lives in the schema.
    Decimal(i64),
    Str(String),
    Bytes(Vec<u8>),
    /// Days since the Unix epoch.
    Date(i32),
    /// Microseconds since the Unix epoch.
    Time(i64),
    Uuid([u8; 16]),
    Ipv6([u8; 16]),
    Null,
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::I8(_) => "I8",
            Value::U8(_) => "U8",
            Value::I16(_) => "I16",
            Value::U16(_) => "U16",
            Value::I32(_) => "I32",
            Value::U32(_) => "U32",
            Value::I64(_) => "I64",
            Value::U64(_) => "U64",
            Value::F32(_) => "F32",
            Value::F64(_) => "F64",
            Value::Decimal(_) => "DECIMAL",
            Value::Str(_) => "STRING",
            Value::Bytes(_) => "BYTES",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Uuid(_) => "UUID",
            Value::Ipv6(_) => "IPV6",
            Value::Null => "NULL",
        }
    }

    /// Whether this value's runtime variant matches `ty`, ignoring NULL
    /// (nullability is checked separately against the column's flag).
    fn matches_type(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Value::I8(_), ColumnType::I8)
                | (Value::U8(_), ColumnType::U8)
                | (Value::I16(_), ColumnType::I16)
                | (Value::U16(_), ColumnType::U16)
                | (Value::I32(_), ColumnType::I32)
                | (Value::U32(_), ColumnType::U32)
                | (Value::I64(_), ColumnType::I64)
                | (Value::U64(_), ColumnType::U64)
                | (Value::F32(_), ColumnType::F32)
                | (Value::F64(_), ColumnType::F64)
                | (Value::Decimal(_), ColumnType::Decimal { .. })
                | (Value::Str(_), ColumnType::Str(_))
                | (Value::Bytes(_), ColumnType::Bytes(_))
                | (Value::Date(_), ColumnType::Date)
                | (Value::Time(_), ColumnType::Time)
                | (Value::Uuid(_), ColumnType::Uuid)
                | (Value::Ipv6(_), ColumnType::Ipv6)
        )
    }
}

/// A full row: one [`Value`] per schema column, in column order.
pub type Row = Vec<Value>;

fn bitmap_len(n_columns: usize) -> usize {
    n_columns.div_ceil(8)
}

fn bit_set(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] |= 1 << (index % 8);
}

fn bit_get(bitmap: &[u8], index: usize) -> bool {
    (bitmap[index / 8] >> (index % 8)) & 1 == 1
}

/// Encodes and decodes rows against a fixed [`Schema`].
#[derive(Debug, Clone)]
pub struct RowCodec {
    columns: Vec<Column>,
}

impl RowCodec {
    pub fn new(schema: &Schema) -> Self {
        Self {
            columns: schema.columns.clone(),
        }
    }

    /// Validate and binary-encode a row.
    pub fn encode(&self, row: &[Value]) -> Result<Vec<u8>, CodecError> {
        if row.len() != self.columns.len() {
            return Err(CodecError::Constraint(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                self.columns.len()
            )));
        }

        let mut bitmap = vec![0u8; bitmap_len(self.columns.len())];
        let mut body = Vec::new();

        for (i, (col, value)) in self.columns.iter().zip(row.iter()).enumerate() {
            if matches!(value, Value::Null) {
                if !col.nullable {
                    return Err(CodecError::Constraint(format!(
                        "column {:?} is NOT NULL",
                        col.name
                    )));
                }
                bit_set(&mut bitmap, i);
                continue;
            }

            if !value.matches_type(col.ty) {
                return Err(CodecError::TypeMismatch {
                    column: col.name.clone(),
                    expected: col.ty,
                    actual: value.type_name(),
                });
            }

            encode_value(col, value, &mut body)?;
        }

        let mut out = Vec::with_capacity(bitmap.len() + body.len());
        out.extend_from_slice(&bitmap);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a row previously produced by [`RowCodec::encode`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Row, CodecError> {
        let bm_len = bitmap_len(self.columns.len());
        if bytes.len() < bm_len {
            return Err(CodecError::Encoding(EncodingError::UnexpectedEof {
                needed: bm_len,
                available: bytes.len(),
            }));
        }
        let bitmap = &bytes[..bm_len];
        let mut offset = bm_len;
        let mut row = Vec::with_capacity(self.columns.len());

        for (i, col) in self.columns.iter().enumerate() {
            if bit_get(bitmap, i) {
                row.push(Value::Null);
                continue;
            }
            let (value, consumed) = decode_value(col, &bytes[offset..])?;
            offset += consumed;
            row.push(value);
        }

        Ok(row)
    }

    /// Render a row as a pipe-delimited text tuple. Used only by import and
    /// export tooling outside the table's own I/O path; never stored on
    /// disk.
    pub fn to_text(&self, row: &[Value]) -> Result<String, CodecError> {
        if row.len() != self.columns.len() {
            return Err(CodecError::Constraint(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        let mut fields = Vec::with_capacity(row.len());
        for value in row {
            fields.push(match value {
                Value::Null => "\\N".to_string(),
                Value::I8(v) => v.to_string(),
                Value::U8(v) => v.to_string(),
                Value::I16(v) => v.to_string(),
                Value::U16(v) => v.to_string(),
                Value::I32(v) => v.to_string(),
                Value::U32(v) => v.to_string(),
                Value::I64(v) => v.to_string(),
                Value::U64(v) => v.to_string(),
                Value::F32(v) => v.to_string(),
                Value::F64(v) => v.to_string(),
                Value::Decimal(v) => v.to_string(),
                Value::Date(v) => v.to_string(),
                Value::Time(v) => v.to_string(),
                Value::Str(s) => s.replace('\\', "\\\\").replace('|', "\\|"),
                Value::Bytes(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
                Value::Uuid(u) | Value::Ipv6(u) => {
                    u.iter().map(|byte| format!("{byte:02x}")).collect()
                }
            });
        }
        Ok(fields.join("|"))
    }

    /// Parse a pipe-delimited text tuple into typed values, per this
    /// codec's schema. The counterpart to [`RowCodec::to_text`].
    pub fn from_text(&self, line: &str) -> Result<Row, CodecError> {
        let fields: Vec<&str> = split_unescaped(line);
        if fields.len() != self.columns.len() {
            return Err(CodecError::MalformedText(format!(
                "expected {} fields, got {}",
                self.columns.len(),
                fields.len()
            )));
        }
        let mut row = Vec::with_capacity(fields.len());
        for (col, field) in self.columns.iter().zip(fields.iter()) {
            if *field == "\\N" {
                if !col.nullable {
                    return Err(CodecError::Constraint(format!(
                        "column {:?} is NOT NULL",
                        col.name
                    )));
                }
                row.push(Value::Null);
                continue;
            }
            row.push(parse_text_value(col, field)?);
        }
        Ok(row)
    }
}

fn split_unescaped(line: &str) -> Vec<&str> {
    // Fields are separated by unescaped `|`. `\|` is a literal pipe within a
    // field, so we can't use `str::split` directly.
    let mut fields = Vec::new();
    let mut start = 0;
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            i += 2;
            continue;
        }
        if bytes[i] == b'|' {
            fields.push(&line[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    fields.push(&line[start..]);
    fields
}

fn parse_text_value(col: &Column, field: &str) -> Result<Value, CodecError> {
    let bad = |e: String| CodecError::MalformedText(format!("column {:?}: {e}", col.name));
    Ok(match col.ty {
        ColumnType::I8 => Value::I8(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::U8 => Value::U8(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::I16 => Value::I16(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::U16 => Value::U16(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::I32 => Value::I32(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::U32 => Value::U32(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::I64 => Value::I64(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::U64 => Value::U64(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::F32 => Value::F32(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::F64 => Value::F64(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::Decimal { .. } => Value::Decimal(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::Date => Value::Date(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::Time => Value::Time(field.parse().map_err(|_| bad(field.into()))?),
        ColumnType::Str(_) => Value::Str(field.replace("\\|", "|").replace("\\\\", "\\")),
        ColumnType::Bytes(_) => Value::Bytes(parse_hex(field).map_err(bad)?),
        ColumnType::Uuid => {
            let bytes = parse_hex(field).map_err(bad)?;
            let arr: [u8; 16] = bytes
                .try_into()
                .map_err(|_| bad("UUID must be 16 bytes".into()))?;
            Value::Uuid(arr)
        }
        ColumnType::Ipv6 => {
            let bytes = parse_hex(field).map_err(bad)?;
            let arr: [u8; 16] = bytes
                .try_into()
                .map_err(|_| bad("IPV6 must be 16 bytes".into()))?;
            Value::Ipv6(arr)
        }
        ColumnType::Nil => Value::Null,
    })
}

fn parse_hex(field: &str) -> Result<Vec<u8>, String> {
    if field.len() % 2 != 0 {
        return Err("odd-length hex string".into());
    }
    (0..field.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&field[i..i + 2], 16).map_err(|_| "invalid hex digit".into()))
        .collect()
}

fn encode_value(col: &Column, value: &Value, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    match (col.ty, value) {
        (ColumnType::I8, Value::I8(v)) => v.encode_to(buf)?,
        (ColumnType::U8, Value::U8(v)) => v.encode_to(buf)?,
        (ColumnType::I16, Value::I16(v)) => v.encode_to(buf)?,
        (ColumnType::U16, Value::U16(v)) => v.encode_to(buf)?,
        (ColumnType::I32, Value::I32(v)) => v.encode_to(buf)?,
        (ColumnType::U32, Value::U32(v)) => v.encode_to(buf)?,
        (ColumnType::I64, Value::I64(v)) => v.encode_to(buf)?,
        (ColumnType::U64, Value::U64(v)) => v.encode_to(buf)?,
        (ColumnType::F32, Value::F32(v)) => v.encode_to(buf)?,
        (ColumnType::F64, Value::F64(v)) => v.encode_to(buf)?,
        (ColumnType::Date, Value::Date(v)) => v.encode_to(buf)?,
        (ColumnType::Time, Value::Time(v)) => v.encode_to(buf)?,
        (ColumnType::Uuid, Value::Uuid(v)) => v.encode_to(buf)?,
        (ColumnType::Ipv6, Value::Ipv6(v)) => v.encode_to(buf)?,
        (ColumnType::Decimal { precision, .. }, Value::Decimal(v)) => {
            let limit = 10i64.checked_pow(precision as u32).unwrap_or(i64::MAX);
            if v.unsigned_abs() as i128 >= limit as i128 {
                return Err(CodecError::NumericOverflow(format!(
                    "column {:?}: mantissa {v} exceeds precision {precision}",
                    col.name
                )));
            }
            v.encode_to(buf)?
        }
        (ColumnType::Str(max_len), Value::Str(s)) => {
            if s.len() as u32 > max_len {
                return Err(CodecError::NumericOverflow(format!(
                    "column {:?}: string of {} bytes exceeds STRING({max_len})",
                    col.name,
                    s.len()
                )));
            }
            s.encode_to(buf)?
        }
        (ColumnType::Bytes(max_len), Value::Bytes(b)) => {
            if b.len() as u32 > max_len {
                return Err(CodecError::NumericOverflow(format!(
                    "column {:?}: {} bytes exceeds BYTES({max_len})",
                    col.name,
                    b.len()
                )));
            }
            b.encode_to(buf)?
        }
        (ColumnType::Nil, Value::Null) => {}
        _ => unreachable!("matches_type checked compatibility before encode_value"),
    }
    Ok(())
}

fn decode_value(col: &Column, buf: &[u8]) -> Result<(Value, usize), CodecError> {
    Ok(match col.ty {
        ColumnType::I8 => {
            let (v, n) = i8::decode_from(buf)?;
            (Value::I8(v), n)
        }
        ColumnType::U8 => {
            let (v, n) = u8::decode_from(buf)?;
            (Value::U8(v), n)
        }
        ColumnType::I16 => {
            let (v, n) = i16::decode_from(buf)?;
            (Value::I16(v), n)
        }
        ColumnType::U16 => {
            let (v, n) = u16::decode_from(buf)?;
            (Value::U16(v), n)
        }
        ColumnType::I32 => {
            let (v, n) = i32::decode_from(buf)?;
            (Value::I32(v), n)
        }
        ColumnType::U32 => {
            let (v, n) = u32::decode_from(buf)?;
            (Value::U32(v), n)
        }
        ColumnType::I64 => {
            let (v, n) = i64::decode_from(buf)?;
            (Value::I64(v), n)
        }
        ColumnType::U64 => {
            let (v, n) = u64::decode_from(buf)?;
            (Value::U64(v), n)
        }
        ColumnType::F32 => {
            let (v, n) = f32::decode_from(buf)?;
            (Value::F32(v), n)
        }
        ColumnType::F64 => {
            let (v, n) = f64::decode_from(buf)?;
            (Value::F64(v), n)
        }
        ColumnType::Decimal { .. } => {
            let (v, n) = i64::decode_from(buf)?;
            (Value::Decimal(v), n)
        }
        ColumnType::Date => {
            let (v, n) = i32::decode_from(buf)?;
            (Value::Date(v), n)
        }
        ColumnType::Time => {
            let (v, n) = i64::decode_from(buf)?;
            (Value::Time(v), n)
        }
        ColumnType::Uuid => {
            let (v, n) = <[u8; 16]>::decode_from(buf)?;
            (Value::Uuid(v), n)
        }
        ColumnType::Ipv6 => {
            let (v, n) = <[u8; 16]>::decode_from(buf)?;
            (Value::Ipv6(v), n)
        }
        ColumnType::Str(_) => {
            let (v, n) = String::decode_from(buf)?;
            (Value::Str(v), n)
        }
        ColumnType::Bytes(_) => {
            let (v, n) = Vec::<u8>::decode_from(buf)?;
            (Value::Bytes(v), n)
        }
        ColumnType::Nil => (Value::Null, 0),
    })
}
