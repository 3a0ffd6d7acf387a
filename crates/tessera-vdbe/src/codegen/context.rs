use serde::{Deserialize, Serialize};
use tessera_error::{Result, TesseraError};

use crate::ProgramBuilder;

/// Configuration for the code generator.
///
/// Missing fields take their defaults when deserializing, so a partial JSON
/// object such as `{"foreign_keys": true}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenContext {
    /// Keep secondary indexes in step with INSERT, UPDATE and DELETE.
    pub maintain_indexes: bool,
    /// Check foreign keys before each DELETE (`PRAGMA foreign_keys`).
    pub foreign_keys: bool,
    /// Compile `DELETE FROM t` without WHERE to a single `Clear`.
    pub truncate_optimization: bool,
    /// Recycle temporary registers. Off by default, which keeps register
    /// numbering strictly increasing within a program.
    pub reuse_temp_registers: bool,
}

impl Default for CodegenContext {
    fn default() -> Self {
        Self {
            maintain_indexes: true,
            foreign_keys: false,
            truncate_optimization: true,
            reuse_temp_registers: false,
        }
    }
}

impl CodegenContext {
    /// Parse a context from a JSON object.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| TesseraError::InvalidConfig {
            detail: e.to_string(),
        })
    }

    /// Fresh builder for one compilation under this context.
    pub(crate) fn builder(&self) -> ProgramBuilder {
        if self.reuse_temp_registers {
            ProgramBuilder::with_temp_reuse()
        } else {
            ProgramBuilder::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ctx = CodegenContext::default();
        assert!(ctx.maintain_indexes);
        assert!(!ctx.foreign_keys);
        assert!(ctx.truncate_optimization);
        assert!(!ctx.reuse_temp_registers);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let ctx = CodegenContext::from_json(r#"{"foreign_keys": true}"#).unwrap();
        assert!(ctx.foreign_keys);
        assert!(ctx.maintain_indexes);
        assert!(ctx.truncate_optimization);
    }

    #[test]
    fn test_malformed_json_is_a_validation_error() {
        let err = CodegenContext::from_json("{\"foreign_keys\": 3").unwrap_err();
        assert!(matches!(err, TesseraError::InvalidConfig { .. }));
        assert_eq!(err.category(), tessera_error::ErrorCategory::Validation);
    }

    #[test]
    fn test_builder_honours_temp_reuse() {
        let ctx = CodegenContext {
            reuse_temp_registers: true,
            ..CodegenContext::default()
        };
        let mut b = ctx.builder();
        let t = b.alloc_temp();
        b.free_temp(t);
        assert_eq!(b.alloc_temp(), t);

        let mut b = CodegenContext::default().builder();
        let t = b.alloc_temp();
        b.free_temp(t);
        assert_ne!(b.alloc_temp(), t);
    }
}
