use thiserror::Error;

/// Primary error type for the record codec and the statement compilers.
///
/// Variants fall into three categories (see [`ErrorCategory`]):
/// validation failures are detected before any instruction is emitted,
/// codec failures come only from decoding untrusted bytes, and compile
/// failures carry the offending name or construct for diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TesseraError {
    // === Validation Errors ===
    /// No statement was handed to the compiler.
    #[error("no statement to compile")]
    MissingStatement,

    /// A statement named an empty table.
    #[error("table name must not be empty")]
    EmptyTableName,

    /// INSERT with no rows.
    #[error("INSERT into {table} has no rows")]
    EmptyValues { table: String },

    /// A record must carry at least one value.
    #[error("cannot encode an empty record")]
    EmptyRecord,

    /// An INSERT row does not supply one value per target column.
    #[error("row {row} has {actual} values for {expected} columns")]
    ColumnCountMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },

    /// UPDATE column list and value list differ in length.
    #[error("{columns} columns assigned {values} values")]
    AssignmentCountMismatch { columns: usize, values: usize },

    /// No such table.
    #[error("no such table: {name}")]
    NoSuchTable { name: String },

    /// No such column.
    #[error("no such column: {name}")]
    NoSuchColumn { name: String },

    /// No such index.
    #[error("no such index: {name}")]
    NoSuchIndex { name: String },

    /// Table already exists.
    #[error("table {name} already exists")]
    TableExists { name: String },

    /// Index already exists.
    #[error("index {name} already exists")]
    IndexExists { name: String },

    /// Code generator configuration could not be parsed.
    #[error("invalid codegen configuration: {detail}")]
    InvalidConfig { detail: String },

    // === Codec Errors ===
    /// The record header ends before its declared length.
    #[error("record header truncated: {detail}")]
    TruncatedHeader { detail: String },

    /// A varint ran past the end of its buffer.
    #[error("invalid varint at offset {offset}")]
    InvalidVarint { offset: usize },

    /// A value body is shorter than its serial type declares.
    #[error("record body truncated: column {column} needs {needed} bytes, {available} remain")]
    TruncatedBody {
        column: usize,
        needed: u64,
        available: usize,
    },

    /// Declared header length disagrees with where the serial types end.
    #[error("record header length {declared} does not match parsed length {actual}")]
    HeaderLengthMismatch { declared: u64, actual: usize },

    /// Serial types 10 and 11 are reserved.
    #[error("reserved serial type {code} in column {column}")]
    ReservedSerialType { code: u64, column: usize },

    /// A text value is not valid UTF-8.
    #[error("column {column} holds text that is not valid UTF-8")]
    InvalidText { column: usize },

    // === Compile Errors ===
    /// A name that survived validation could not be bound during codegen.
    #[error("unresolved reference: {name}")]
    UnresolvedReference { name: String },

    /// A construct the compiler rejects.
    #[error("unsupported construct: {construct}")]
    Unsupported { construct: String },

    /// Aggregate used where no aggregate context exists.
    #[error("misuse of aggregate: {name}()")]
    MisuseOfAggregate { name: String },

    /// Compound SELECT arms disagree on result width.
    #[error("SELECTs to the left and right of {operator} do not have the same number of result columns")]
    CompoundArity { operator: String },

    /// ORDER BY term of a compound SELECT names no result column.
    #[error("{ordinal} ORDER BY term does not match any column in the result set")]
    OrderByTermMismatch { ordinal: String },

    /// Invariant violation inside the compiler itself.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The three error families surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad input detected before emission.
    Validation,
    /// Malformed record bytes.
    Codec,
    /// Statement is well-formed but cannot be lowered.
    Compile,
}

/// SQLite result codes for the subset this crate can produce.
///
/// These match the numeric values from C SQLite's `sqlite3.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Database disk image is malformed.
    Corrupt = 11,
    /// Data type mismatch.
    Mismatch = 20,
    /// Library used incorrectly.
    Misuse = 21,
    /// OS feature not available.
    NoLfs = 22,
}

impl TesseraError {
    /// Which family this error belongs to.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingStatement
            | Self::EmptyTableName
            | Self::EmptyValues { .. }
            | Self::EmptyRecord
            | Self::ColumnCountMismatch { .. }
            | Self::AssignmentCountMismatch { .. }
            | Self::NoSuchTable { .. }
            | Self::NoSuchColumn { .. }
            | Self::NoSuchIndex { .. }
            | Self::TableExists { .. }
            | Self::IndexExists { .. }
            | Self::InvalidConfig { .. } => ErrorCategory::Validation,
            Self::TruncatedHeader { .. }
            | Self::InvalidVarint { .. }
            | Self::TruncatedBody { .. }
            | Self::HeaderLengthMismatch { .. }
            | Self::ReservedSerialType { .. }
            | Self::InvalidText { .. } => ErrorCategory::Codec,
            Self::UnresolvedReference { .. }
            | Self::Unsupported { .. }
            | Self::MisuseOfAggregate { .. }
            | Self::CompoundArity { .. }
            | Self::OrderByTermMismatch { .. }
            | Self::Internal(_) => ErrorCategory::Compile,
        }
    }

    /// Map this error to a SQLite error code for compatibility.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingStatement | Self::EmptyRecord | Self::InvalidConfig { .. } => {
                ErrorCode::Misuse
            }
            Self::TruncatedHeader { .. }
            | Self::InvalidVarint { .. }
            | Self::TruncatedBody { .. }
            | Self::HeaderLengthMismatch { .. }
            | Self::ReservedSerialType { .. } => ErrorCode::Corrupt,
            Self::InvalidText { .. } => ErrorCode::Mismatch,
            Self::Unsupported { .. } => ErrorCode::NoLfs,
            Self::Internal(_) => ErrorCode::Internal,
            _ => ErrorCode::Error,
        }
    }

    /// The name this error is about, when it has one.
    pub fn offending_name(&self) -> Option<&str> {
        match self {
            Self::NoSuchTable { name }
            | Self::NoSuchColumn { name }
            | Self::NoSuchIndex { name }
            | Self::TableExists { name }
            | Self::IndexExists { name }
            | Self::UnresolvedReference { name }
            | Self::MisuseOfAggregate { name } => Some(name),
            Self::EmptyValues { table } => Some(table),
            Self::Unsupported { construct } => Some(construct),
            Self::CompoundArity { operator } => Some(operator),
            _ => None,
        }
    }

    /// Whether the caller can fix this by correcting the statement.
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Validation | ErrorCategory::Compile
        ) && !matches!(self, Self::Internal(_))
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::NoSuchTable { .. } | Self::NoSuchIndex { .. } => {
                Some("Check the name against the schema catalog")
            }
            Self::NoSuchColumn { .. } => Some("Qualify the column or check its spelling"),
            Self::ColumnCountMismatch { .. } | Self::AssignmentCountMismatch { .. } => {
                Some("Supply exactly one value per listed column")
            }
            Self::Unsupported { .. } => Some("Rewrite the statement without this construct"),
            Self::MisuseOfAggregate { .. } => {
                Some("Move aggregate calls into the result list or HAVING")
            }
            Self::TruncatedHeader { .. }
            | Self::TruncatedBody { .. }
            | Self::InvalidVarint { .. }
            | Self::HeaderLengthMismatch { .. } => Some("The record bytes are corrupt or incomplete"),
            _ => None,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an unsupported-construct error.
    pub fn unsupported(construct: impl Into<String>) -> Self {
        Self::Unsupported {
            construct: construct.into(),
        }
    }

    /// Create a no-such-table error.
    pub fn no_such_table(name: impl Into<String>) -> Self {
        Self::NoSuchTable { name: name.into() }
    }

    /// Create a no-such-column error.
    pub fn no_such_column(name: impl Into<String>) -> Self {
        Self::NoSuchColumn { name: name.into() }
    }

    /// Create a truncated-header error.
    pub fn truncated_header(detail: impl Into<String>) -> Self {
        Self::TruncatedHeader {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `TesseraError`.
pub type Result<T> = std::result::Result<T, TesseraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TesseraError::no_such_table("users");
        assert_eq!(err.to_string(), "no such table: users");
        let err = TesseraError::no_such_column("t.x");
        assert_eq!(err.to_string(), "no such column: t.x");
    }

    #[test]
    fn error_display_row_mismatch() {
        let err = TesseraError::ColumnCountMismatch {
            row: 2,
            expected: 3,
            actual: 1,
        };
        assert_eq!(err.to_string(), "row 2 has 1 values for 3 columns");
    }

    #[test]
    fn error_display_compound() {
        let err = TesseraError::CompoundArity {
            operator: "UNION ALL".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "SELECTs to the left and right of UNION ALL do not have the same number of result columns"
        );
    }

    #[test]
    fn categories() {
        assert_eq!(
            TesseraError::MissingStatement.category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            TesseraError::NoSuchIndex {
                name: "i".to_owned()
            }
            .category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            TesseraError::InvalidVarint { offset: 3 }.category(),
            ErrorCategory::Codec
        );
        assert_eq!(
            TesseraError::unsupported("INTERSECT").category(),
            ErrorCategory::Compile
        );
        assert_eq!(
            TesseraError::internal("x").category(),
            ErrorCategory::Compile
        );
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            TesseraError::truncated_header("x").error_code(),
            ErrorCode::Corrupt
        );
        assert_eq!(TesseraError::internal("x").error_code(), ErrorCode::Internal);
        assert_eq!(
            TesseraError::no_such_table("t").error_code(),
            ErrorCode::Error
        );
        assert_eq!(ErrorCode::Corrupt as i32, 11);
    }

    #[test]
    fn offending_name_is_carried() {
        let err = TesseraError::unsupported("EXCEPT");
        assert_eq!(err.offending_name(), Some("EXCEPT"));
        assert_eq!(TesseraError::EmptyRecord.offending_name(), None);
    }

    #[test]
    fn recoverability() {
        assert!(TesseraError::no_such_table("t").is_user_recoverable());
        assert!(!TesseraError::internal("bug").is_user_recoverable());
        assert!(!TesseraError::InvalidVarint { offset: 0 }.is_user_recoverable());
    }

    #[test]
    fn suggestions() {
        assert!(TesseraError::no_such_column("x").suggestion().is_some());
        assert!(TesseraError::EmptyRecord.suggestion().is_none());
    }
}
