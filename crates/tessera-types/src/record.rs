//! The record format: a varint header length, one varint serial type per
//! value, then the value bodies packed in the same order.
//!
//! See: <https://www.sqlite.org/fileformat.html#record_format>

use tessera_error::{Result, TesseraError};

use crate::serial_type::{
    SerialTypeClass, classify_serial_type, get_varint, serial_type_for, serial_type_len,
    varint_len, write_varint,
};
use crate::value::SqliteValue;

/// Serialize `values` into a record.
///
/// An empty value list is rejected: every stored row has at least one
/// column.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_record(values: &[SqliteValue]) -> Result<Vec<u8>> {
    if values.is_empty() {
        return Err(TesseraError::EmptyRecord);
    }

    let serial_types: Vec<u64> = values.iter().map(serial_type_for).collect();
    let types_len: usize = serial_types.iter().map(|&st| varint_len(st)).sum();
    let header_len = header_len_fixed_point(types_len);
    let body_len: usize = serial_types
        .iter()
        .map(|&st| serial_type_len(st).unwrap_or(0) as usize)
        .sum();

    let mut buf = vec![0u8; header_len + body_len];
    let mut offset = write_varint(&mut buf, header_len as u64);
    for &st in &serial_types {
        offset += write_varint(&mut buf[offset..], st);
    }
    debug_assert_eq!(offset, header_len);

    for (value, &st) in values.iter().zip(&serial_types) {
        let len = serial_type_len(st).unwrap_or(0) as usize;
        encode_body(value, &mut buf[offset..offset + len]);
        offset += len;
    }

    Ok(buf)
}

/// Parse a record back into values.
///
/// Malformed input is reported as a codec error, never a panic.
#[allow(clippy::cast_possible_truncation)]
pub fn decode_record(data: &[u8]) -> Result<Vec<SqliteValue>> {
    let (header_len, serial_types) = record_header(data)?;

    let mut offset = header_len;
    let mut values = Vec::with_capacity(serial_types.len());
    for (column, &st) in serial_types.iter().enumerate() {
        let needed = serial_type_len(st)
            .ok_or(TesseraError::ReservedSerialType { code: st, column })?;
        let available = data.len() - offset;
        if needed > available as u64 {
            return Err(TesseraError::TruncatedBody {
                column,
                needed,
                available,
            });
        }
        let end = offset + needed as usize;
        values.push(decode_body(st, &data[offset..end], column)?);
        offset = end;
    }

    Ok(values)
}

/// Read only the header: `(header_len, serial_types)`.
#[allow(clippy::cast_possible_truncation)]
pub fn record_header(data: &[u8]) -> Result<(usize, Vec<u64>)> {
    if data.is_empty() {
        return Err(TesseraError::truncated_header("record is empty"));
    }
    let (declared, first) = get_varint(data);
    if first == 0 {
        return Err(TesseraError::InvalidVarint { offset: 0 });
    }
    if declared < first as u64 || declared > data.len() as u64 {
        return Err(TesseraError::truncated_header(format!(
            "declared header length {declared} but {} bytes present",
            data.len()
        )));
    }
    let header_len = declared as usize;

    let mut serial_types = Vec::new();
    let mut offset = first;
    while offset < header_len {
        let (st, consumed) = get_varint(&data[offset..]);
        if consumed == 0 {
            return Err(TesseraError::InvalidVarint { offset });
        }
        offset += consumed;
        if offset > header_len {
            return Err(TesseraError::HeaderLengthMismatch {
                declared,
                actual: offset,
            });
        }
        serial_types.push(st);
    }

    Ok((header_len, serial_types))
}

/// Smallest header length `h` with `varint_len(h) + types_len == h`.
fn header_len_fixed_point(types_len: usize) -> usize {
    let mut header_len = types_len + 1;
    loop {
        let needed = varint_len(header_len as u64) + types_len;
        if needed <= header_len {
            return header_len;
        }
        header_len = needed;
    }
}

fn decode_body(serial_type: u64, bytes: &[u8], column: usize) -> Result<SqliteValue> {
    Ok(match classify_serial_type(serial_type) {
        SerialTypeClass::Null => SqliteValue::Null,
        SerialTypeClass::Zero => SqliteValue::Integer(0),
        SerialTypeClass::One => SqliteValue::Integer(1),
        SerialTypeClass::Integer => SqliteValue::Integer(sign_extend_be(bytes)),
        SerialTypeClass::Float => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            SqliteValue::Float(f64::from_be_bytes(raw))
        }
        SerialTypeClass::Text => match std::str::from_utf8(bytes) {
            Ok(s) => SqliteValue::Text(s.to_owned()),
            Err(_) => return Err(TesseraError::InvalidText { column }),
        },
        SerialTypeClass::Blob => SqliteValue::Blob(bytes.to_vec()),
        SerialTypeClass::Reserved => {
            return Err(TesseraError::ReservedSerialType {
                code: serial_type,
                column,
            });
        }
    })
}

/// Big-endian two's complement of 1..=8 bytes, including the 3- and 6-byte
/// widths.
#[allow(clippy::cast_possible_wrap)]
fn sign_extend_be(bytes: &[u8]) -> i64 {
    let negative = bytes.first().is_some_and(|b| b & 0x80 != 0);
    let seed = if negative { u64::MAX } else { 0 };
    bytes
        .iter()
        .fold(seed, |acc, &b| (acc << 8) | u64::from(b)) as i64
}

fn encode_body(value: &SqliteValue, buf: &mut [u8]) {
    match value {
        SqliteValue::Null => {}
        SqliteValue::Integer(i) => {
            // Serial types 8/9 give an empty slice here.
            let be = i.to_be_bytes();
            buf.copy_from_slice(&be[8 - buf.len()..]);
        }
        SqliteValue::Float(f) => buf.copy_from_slice(&f.to_be_bytes()),
        SqliteValue::Text(s) => buf.copy_from_slice(s.as_bytes()),
        SqliteValue::Blob(b) => buf.copy_from_slice(b),
    }
}
