//! Core value and wire types: dynamically-typed values, the record format
//! (varints, serial types, header/body layout), and the VDBE opcode set.

pub mod opcode;
pub mod record;
pub mod serial_type;
pub mod value;

pub use opcode::{Opcode, P4, VdbeOp};
pub use record::{decode_record, encode_record, record_header};
pub use serial_type::{
    get_varint, put_varint, read_varint, serial_type_for, serial_type_len, varint_len,
    write_varint,
};
pub use value::SqliteValue;

/// Column type affinity.
///
/// The discriminants are the single-character codes carried in affinity
/// strings (`P4::Affinity`), matching `SQLITE_AFF_*`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum TypeAffinity {
    /// No preference. BLOB or no declared type.
    Blob = b'A',
    /// Prefers text. TEXT, VARCHAR, CLOB.
    Text = b'B',
    /// Prefers numeric storage. NUMERIC, DECIMAL, BOOLEAN, DATE.
    Numeric = b'C',
    /// Prefers integer storage. INTEGER, INT, BIGINT.
    Integer = b'D',
    /// Prefers float storage. REAL, DOUBLE, FLOAT.
    Real = b'E',
}

impl TypeAffinity {
    /// Determine the affinity of a declared column type.
    ///
    /// First match wins: "INT" → INTEGER; "CHAR"/"CLOB"/"TEXT" → TEXT;
    /// "BLOB" or empty → BLOB; "REAL"/"FLOA"/"DOUB" → REAL; else NUMERIC.
    pub fn from_type_name(type_name: &str) -> Self {
        let upper = type_name.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if ["CHAR", "CLOB", "TEXT"].iter().any(|k| upper.contains(k)) {
            Self::Text
        } else if upper.trim().is_empty() || upper.contains("BLOB") {
            Self::Blob
        } else if ["REAL", "FLOA", "DOUB"].iter().any(|k| upper.contains(k)) {
            Self::Real
        } else {
            Self::Numeric
        }
    }

    /// The affinity-string character for this affinity.
    pub const fn as_char(self) -> char {
        self as u8 as char
    }

    /// Parse an affinity-string character. Unknown characters map to BLOB
    /// (no coercion).
    pub const fn from_char(c: char) -> Self {
        match c {
            'B' | 'b' => Self::Text,
            'C' | 'c' => Self::Numeric,
            'D' | 'd' => Self::Integer,
            'E' | 'e' => Self::Real,
            _ => Self::Blob,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_first_match_rule() {
        assert_eq!(TypeAffinity::from_type_name("INTEGER"), TypeAffinity::Integer);
        assert_eq!(TypeAffinity::from_type_name("varchar(20)"), TypeAffinity::Text);
        // "POINT" contains "INT".
        assert_eq!(TypeAffinity::from_type_name("POINT"), TypeAffinity::Integer);
        assert_eq!(TypeAffinity::from_type_name(""), TypeAffinity::Blob);
        assert_eq!(TypeAffinity::from_type_name("DOUBLE"), TypeAffinity::Real);
        assert_eq!(TypeAffinity::from_type_name("DECIMAL(10,2)"), TypeAffinity::Numeric);
    }

    #[test]
    fn affinity_chars_round_trip() {
        for aff in [
            TypeAffinity::Blob,
            TypeAffinity::Text,
            TypeAffinity::Numeric,
            TypeAffinity::Integer,
            TypeAffinity::Real,
        ] {
            assert_eq!(TypeAffinity::from_char(aff.as_char()), aff);
        }
        assert_eq!(TypeAffinity::Integer.as_char(), 'D');
    }
}
