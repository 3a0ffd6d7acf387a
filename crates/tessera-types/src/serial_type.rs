//! Varints and record serial types.
//!
//! Each value in a record is described by a serial type stored as a varint
//! in the record header:
//!
//! | Serial type   | Body bytes | Meaning                    |
//! |---------------|------------|----------------------------|
//! | 0             | 0          | NULL                       |
//! | 1..=4         | 1, 2, 3, 4 | big-endian signed integer  |
//! | 5             | 6          | 48-bit big-endian integer  |
//! | 6             | 8          | 64-bit big-endian integer  |
//! | 7             | 8          | IEEE 754 float, big-endian |
//! | 8, 9          | 0          | integer constants 0 and 1  |
//! | 10, 11        | n/a        | reserved                   |
//! | N >= 12, even | (N-12)/2   | BLOB                       |
//! | N >= 13, odd  | (N-13)/2   | TEXT                       |

use crate::SqliteValue;

/// Longest possible varint encoding.
pub const MAX_VARINT_LEN: usize = 9;

/// Body length of a serial type in bytes; `None` for the reserved codes
/// 10 and 11.
pub const fn serial_type_len(serial_type: u64) -> Option<u64> {
    match serial_type {
        0 | 8 | 9 => Some(0),
        1..=4 => Some(serial_type),
        5 => Some(6),
        6 | 7 => Some(8),
        10 | 11 => None,
        n if n % 2 == 0 => Some((n - 12) / 2),
        n => Some((n - 13) / 2),
    }
}

/// What kind of value a serial type holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialTypeClass {
    Null,
    /// Serial types 1..=6.
    Integer,
    Float,
    /// Serial type 8.
    Zero,
    /// Serial type 9.
    One,
    Reserved,
    Blob,
    Text,
}

pub const fn classify_serial_type(serial_type: u64) -> SerialTypeClass {
    match serial_type {
        0 => SerialTypeClass::Null,
        1..=6 => SerialTypeClass::Integer,
        7 => SerialTypeClass::Float,
        8 => SerialTypeClass::Zero,
        9 => SerialTypeClass::One,
        10 | 11 => SerialTypeClass::Reserved,
        n if n % 2 == 0 => SerialTypeClass::Blob,
        _ => SerialTypeClass::Text,
    }
}

/// Smallest integer serial type that holds `value`.
///
/// 0 and 1 use the body-less constants 8 and 9.
#[allow(clippy::cast_sign_loss)]
pub const fn serial_type_for_integer(value: i64) -> u64 {
    if value == 0 {
        return 8;
    }
    if value == 1 {
        return 9;
    }
    // One's complement folds negatives onto the same magnitude bands.
    let u = if value < 0 {
        !(value as u64)
    } else {
        value as u64
    };
    if u <= 0x7F {
        1
    } else if u <= 0x7FFF {
        2
    } else if u <= 0x7F_FFFF {
        3
    } else if u <= 0x7FFF_FFFF {
        4
    } else if u <= 0x7FFF_FFFF_FFFF {
        5
    } else {
        6
    }
}

/// Serial type describing `value` in a record header.
#[allow(clippy::cast_possible_truncation)]
pub fn serial_type_for(value: &SqliteValue) -> u64 {
    match value {
        SqliteValue::Null => 0,
        SqliteValue::Integer(i) => serial_type_for_integer(*i),
        SqliteValue::Float(_) => 7,
        SqliteValue::Text(s) => 13 + 2 * s.len() as u64,
        SqliteValue::Blob(b) => 12 + 2 * b.len() as u64,
    }
}

/// Number of bytes `value` occupies as a varint.
pub const fn varint_len(value: u64) -> usize {
    if value > 0x00FF_FFFF_FFFF_FFFF {
        return MAX_VARINT_LEN;
    }
    let mut len = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        len += 1;
        rest >>= 7;
    }
    len
}

/// Decode a varint, returning `(value, bytes_consumed)`.
///
/// Truncated input yields `(0, 0)`: a consumed count of zero is the failure
/// signal.
pub fn get_varint(buf: &[u8]) -> (u64, usize) {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN - 1).enumerate() {
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return (value, i + 1);
        }
    }
    match buf.get(MAX_VARINT_LEN - 1) {
        // The ninth byte contributes all eight bits.
        Some(&last) => ((value << 8) | u64::from(last), MAX_VARINT_LEN),
        None => (0, 0),
    }
}

/// [`get_varint`] as an `Option`, for `?`-style callers.
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    match get_varint(buf) {
        (_, 0) => None,
        decoded => Some(decoded),
    }
}

/// Append the varint encoding of `value` to `out`; returns the byte count.
pub fn put_varint(out: &mut Vec<u8>, value: u64) -> usize {
    let mut scratch = [0u8; MAX_VARINT_LEN];
    let len = write_varint(&mut scratch, value);
    out.extend_from_slice(&scratch[..len]);
    len
}

/// Write the varint encoding of `value` into the front of `buf`.
///
/// Returns the number of bytes written, or 0 when `buf` is shorter than
/// [`varint_len`]`(value)`.
#[allow(clippy::cast_possible_truncation)]
pub fn write_varint(buf: &mut [u8], value: u64) -> usize {
    let len = varint_len(value);
    let Some(dst) = buf.get_mut(..len) else {
        return 0;
    };
    if len == MAX_VARINT_LEN {
        dst[8] = value as u8;
        let mut v = value >> 8;
        for byte in dst[..8].iter_mut().rev() {
            *byte = (v as u8 & 0x7F) | 0x80;
            v >>= 7;
        }
    } else {
        let mut v = value;
        for (i, byte) in dst.iter_mut().enumerate().rev() {
            let cont = if i == len - 1 { 0 } else { 0x80 };
            *byte = (v as u8 & 0x7F) | cont;
            v >>= 7;
        }
    }
    len
}
