use std::cmp::Ordering;
use std::fmt;

use crate::TypeAffinity;

/// A dynamically-typed SQL value.
///
/// The five storage classes of the record format: NULL, INTEGER, REAL,
/// TEXT and BLOB. Values are immutable once built; operations return new
/// values.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum SqliteValue {
    /// SQL NULL.
    Null,
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit IEEE 754 floating-point number.
    Float(f64),
    /// A UTF-8 text string.
    Text(String),
    /// A binary large object.
    Blob(Vec<u8>),
}

impl SqliteValue {
    /// The affinity that best describes this value's storage class.
    pub const fn affinity(&self) -> TypeAffinity {
        match self {
            Self::Null | Self::Blob(_) => TypeAffinity::Blob,
            Self::Integer(_) => TypeAffinity::Integer,
            Self::Float(_) => TypeAffinity::Real,
            Self::Text(_) => TypeAffinity::Text,
        }
    }

    /// The `typeof()` name: "null", "integer", "real", "text" or "blob".
    pub const fn typeof_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Float(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Integer coercion: NULL and BLOB become 0, REAL truncates, TEXT is
    /// parsed with 0 on failure.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_integer(&self) -> i64 {
        match self {
            Self::Null | Self::Blob(_) => 0,
            Self::Integer(i) => *i,
            Self::Float(f) => *f as i64,
            Self::Text(s) => {
                let t = s.trim();
                t.parse::<i64>()
                    .unwrap_or_else(|_| t.parse::<f64>().map_or(0, |f| f as i64))
            }
        }
    }

    /// Float coercion with the same rules as [`to_integer`](Self::to_integer).
    #[allow(clippy::cast_precision_loss)]
    pub fn to_float(&self) -> f64 {
        match self {
            Self::Null | Self::Blob(_) => 0.0,
            Self::Integer(i) => *i as f64,
            Self::Float(f) => *f,
            Self::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        }
    }

    /// Text coercion as `CAST(x AS TEXT)` performs it.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => format_sqlite_float(*f),
            Self::Text(s) => s.clone(),
            Self::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// SQL truth value: `None` for NULL, otherwise whether the numeric
    /// coercion is non-zero.
    #[allow(clippy::float_cmp)]
    pub fn truthiness(&self) -> Option<bool> {
        match self {
            Self::Null => None,
            Self::Integer(i) => Some(*i != 0),
            other => Some(other.to_float() != 0.0),
        }
    }

    /// Apply column affinity before storage.
    ///
    /// TEXT turns numbers into text; NUMERIC/INTEGER parse well-formed
    /// numeric text; INTEGER also narrows exact-integer reals; REAL widens
    /// integers. BLOB never converts.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::float_cmp
    )]
    pub fn apply_affinity(self, affinity: TypeAffinity) -> Self {
        match (affinity, self) {
            (TypeAffinity::Blob, v) => v,
            (TypeAffinity::Text, v @ (Self::Integer(_) | Self::Float(_))) => {
                Self::Text(v.to_text())
            }
            (TypeAffinity::Text, v) => v,
            (TypeAffinity::Numeric | TypeAffinity::Integer, Self::Text(s)) => {
                numeric_from_text(&s).unwrap_or(Self::Text(s))
            }
            (TypeAffinity::Integer, Self::Float(f)) => {
                let i = f as i64;
                if (-9.223_372_036_854_776e18..9.223_372_036_854_776e18).contains(&f)
                    && i as f64 == f
                {
                    Self::Integer(i)
                } else {
                    Self::Float(f)
                }
            }
            (TypeAffinity::Real, Self::Integer(i)) => Self::Float(i as f64),
            (TypeAffinity::Real, Self::Text(s)) => match numeric_from_text(&s) {
                Some(Self::Integer(i)) => Self::Float(i as f64),
                Some(other) => other,
                None => Self::Text(s),
            },
            (_, v) => v,
        }
    }

    fn from_float_result(f: f64) -> Self {
        if f.is_nan() { Self::Null } else { Self::Float(f) }
    }

    /// `self + other`; integer overflow promotes to REAL, NULL propagates.
    #[must_use]
    pub fn sql_add(&self, other: &Self) -> Self {
        self.arith(other, i64::checked_add, |a, b| a + b)
    }

    /// `self - other`.
    #[must_use]
    pub fn sql_sub(&self, other: &Self) -> Self {
        self.arith(other, i64::checked_sub, |a, b| a - b)
    }

    /// `self * other`.
    #[must_use]
    pub fn sql_mul(&self, other: &Self) -> Self {
        self.arith(other, i64::checked_mul, |a, b| a * b)
    }

    /// `self / other`. Integer division truncates; division by zero is NULL.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn sql_div(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => Self::Null,
            (_, b) if b.to_float() == 0.0 => Self::Null,
            _ => self.arith(other, i64::checked_div, |a, b| a / b),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn arith(
        &self,
        other: &Self,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> Self {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => Self::Null,
            (Self::Integer(a), Self::Integer(b)) => int_op(*a, *b).map_or_else(
                || Self::from_float_result(float_op(*a as f64, *b as f64)),
                Self::Integer,
            ),
            _ => Self::from_float_result(float_op(self.to_float(), other.to_float())),
        }
    }

    /// NULL < numeric < text < blob.
    const fn sort_class(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Integer(_) | Self::Float(_) => 1,
            Self::Text(_) => 2,
            Self::Blob(_) => 3,
        }
    }
}

impl fmt::Display for SqliteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => f.write_str(&format_sqlite_float(*v)),
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Blob(b) => {
                f.write_str("X'")?;
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                f.write_str("'")
            }
        }
    }
}

impl PartialEq for SqliteValue {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Equal))
    }
}

impl PartialOrd for SqliteValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let (a, b) = (self.sort_class(), other.sort_class());
        if a != b {
            return Some(a.cmp(&b));
        }
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Float(b)) => Some(int_float_cmp(*a, *b)),
            (Self::Float(a), Self::Integer(b)) => Some(int_float_cmp(*b, *a).reverse()),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Blob(a), Self::Blob(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<i64> for SqliteValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for SqliteValue {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for SqliteValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<String> for SqliteValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for SqliteValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<Vec<u8>> for SqliteValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Blob(b)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqliteValue {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

/// Parse text that is a well-formed numeric literal. Exact-integer results
/// become INTEGER.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
fn numeric_from_text(s: &str) -> Option<SqliteValue> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(i) = t.parse::<i64>() {
        return Some(SqliteValue::Integer(i));
    }
    let f = t.parse::<f64>().ok()?;
    let lower = t.to_ascii_lowercase();
    if lower.contains("inf") || lower.contains("nan") {
        return None;
    }
    let i = f as i64;
    if (-9.223_372_036_854_776e18..9.223_372_036_854_776e18).contains(&f) && i as f64 == f {
        Some(SqliteValue::Integer(i))
    } else {
        Some(SqliteValue::Float(f))
    }
}

/// Integer/float comparison that stays exact for |i| > 2^53.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn int_float_cmp(i: i64, r: f64) -> Ordering {
    if r.is_nan() {
        return Ordering::Greater;
    }
    if r < -9.223_372_036_854_776e18 {
        return Ordering::Greater;
    }
    if r >= 9.223_372_036_854_776e18 {
        return Ordering::Less;
    }
    match i.cmp(&(r as i64)) {
        Ordering::Equal => (i as f64).partial_cmp(&r).unwrap_or(Ordering::Equal),
        ord => ord,
    }
}

/// Render a REAL so it always reads as a real: `120.0`, not `120`.
#[must_use]
pub fn format_sqlite_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Inf" } else { "-Inf" }.to_owned();
    }
    let s = format!("{f}");
    if s.contains(['.', 'e', 'E']) {
        s
    } else {
        format!("{s}.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_across_classes() {
        assert!(SqliteValue::Null < SqliteValue::Integer(-5));
        assert!(SqliteValue::Integer(3) < SqliteValue::Float(3.5));
        assert!(SqliteValue::Float(1e300) < SqliteValue::Text(String::new()));
        assert!(SqliteValue::Text("z".to_owned()) < SqliteValue::Blob(vec![]));
        assert_eq!(SqliteValue::Integer(2), SqliteValue::Float(2.0));
    }

    #[test]
    fn int_float_compare_precision() {
        // 2^53 + 1 is not representable as f64.
        let big = 9_007_199_254_740_993_i64;
        assert!(SqliteValue::Integer(big) > SqliteValue::Float(9_007_199_254_740_992.0));
    }

    #[test]
    fn arithmetic_null_and_overflow() {
        let one = SqliteValue::Integer(1);
        assert!(one.sql_add(&SqliteValue::Null).is_null());
        assert_eq!(
            SqliteValue::Integer(i64::MAX).sql_add(&one),
            SqliteValue::Float(9.223_372_036_854_776e18)
        );
        assert_eq!(
            SqliteValue::Integer(7).sql_div(&SqliteValue::Integer(2)),
            SqliteValue::Integer(3)
        );
        assert!(SqliteValue::Integer(7).sql_div(&SqliteValue::Integer(0)).is_null());
        assert!(SqliteValue::Float(7.0).sql_div(&SqliteValue::Float(0.0)).is_null());
        assert_eq!(
            SqliteValue::Integer(6).sql_mul(&SqliteValue::Float(0.5)),
            SqliteValue::Float(3.0)
        );
        assert_eq!(
            SqliteValue::Integer(1).sql_sub(&SqliteValue::Integer(3)),
            SqliteValue::Integer(-2)
        );
    }

    #[test]
    fn affinity_coercion() {
        let v = SqliteValue::Text("42".to_owned()).apply_affinity(TypeAffinity::Integer);
        assert_eq!(v.as_integer(), Some(42));
        let v = SqliteValue::Text("4.5".to_owned()).apply_affinity(TypeAffinity::Numeric);
        assert_eq!(v.as_float(), Some(4.5));
        let v = SqliteValue::Integer(3).apply_affinity(TypeAffinity::Text);
        assert_eq!(v.as_text(), Some("3"));
        let v = SqliteValue::Integer(3).apply_affinity(TypeAffinity::Real);
        assert_eq!(v.as_float(), Some(3.0));
        let v = SqliteValue::Text("abc".to_owned()).apply_affinity(TypeAffinity::Integer);
        assert_eq!(v.as_text(), Some("abc"));
        let v = SqliteValue::Float(5.0).apply_affinity(TypeAffinity::Integer);
        assert_eq!(v.as_integer(), Some(5));
    }

    #[test]
    fn truthiness() {
        assert_eq!(SqliteValue::Null.truthiness(), None);
        assert_eq!(SqliteValue::Integer(0).truthiness(), Some(false));
        assert_eq!(SqliteValue::Float(0.25).truthiness(), Some(true));
        assert_eq!(SqliteValue::Text("x".to_owned()).truthiness(), Some(false));
    }

    #[test]
    fn display_forms() {
        assert_eq!(SqliteValue::Float(120.0).to_string(), "120.0");
        assert_eq!(SqliteValue::Text("it's".to_owned()).to_string(), "'it''s'");
        assert_eq!(SqliteValue::Blob(vec![0xCA, 0xFE]).to_string(), "X'CAFE'");
        assert_eq!(SqliteValue::from(None::<i64>).to_string(), "NULL");
    }
}
