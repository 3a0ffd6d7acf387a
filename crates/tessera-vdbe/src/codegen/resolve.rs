//! Name resolution: unresolved `Column` references to cursor reads.

use tessera_ast::{ColumnName, Expr};
use tessera_error::{Result, TesseraError};

use super::schema::TableSchema;

/// Names that reach the rowid when no real column shadows them.
const ROWID_ALIASES: [&str; 3] = ["rowid", "_rowid_", "oid"];

/// One table visible to name resolution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScopeTable<'a> {
    pub table: &'a TableSchema,
    /// Name the statement refers to the table by (alias or table name).
    pub visible_name: &'a str,
    pub cursor: i32,
}

/// The FROM list of one statement, in declaration order.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope<'a> {
    tables: Vec<ScopeTable<'a>>,
}

impl<'a> Scope<'a> {
    /// Scope with no tables; every column reference fails.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scope over a single table, as for UPDATE and DELETE.
    pub fn single(table: &'a TableSchema, cursor: i32) -> Self {
        let mut scope = Self::empty();
        scope.push(table, &table.name, cursor);
        scope
    }

    pub fn push(&mut self, table: &'a TableSchema, visible_name: &'a str, cursor: i32) {
        self.tables.push(ScopeTable {
            table,
            visible_name,
            cursor,
        });
    }

    pub fn tables(&self) -> &[ScopeTable<'a>] {
        &self.tables
    }

    /// Table whose visible name is exactly `name`.
    pub fn find_table(&self, name: &str) -> Option<&ScopeTable<'a>> {
        self.tables.iter().find(|t| t.visible_name == name)
    }

    /// Rewrite every `Column` in `expr` into `ColumnRef` or `Rowid`.
    /// The input is left untouched.
    pub fn resolve(&self, expr: &Expr) -> Result<Expr> {
        Ok(match expr {
            Expr::Column(name) => self.resolve_name(name)?,
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(self.resolve(left)?),
                right: Box::new(self.resolve(right)?),
            },
            Expr::Aggregate { func, args } => Expr::Aggregate {
                func: *func,
                args: args
                    .iter()
                    .map(|arg| self.resolve(arg))
                    .collect::<Result<_>>()?,
            },
            other => other.clone(),
        })
    }

    fn resolve_name(&self, name: &ColumnName) -> Result<Expr> {
        match &name.table {
            Some(qualifier) => {
                let source = self
                    .find_table(qualifier)
                    .ok_or_else(|| TesseraError::NoSuchTable {
                        name: qualifier.clone(),
                    })?;
                source
                    .column(&name.column)
                    .or_else(|| source.rowid_alias(&name.column))
                    .ok_or_else(|| TesseraError::NoSuchColumn {
                        name: format!("{qualifier}.{}", name.column),
                    })
            }
            None => self
                .tables
                .iter()
                .find_map(|source| source.column(&name.column))
                .or_else(|| {
                    self.tables
                        .first()
                        .and_then(|source| source.rowid_alias(&name.column))
                })
                .ok_or_else(|| TesseraError::NoSuchColumn {
                    name: name.column.clone(),
                }),
        }
    }
}

impl ScopeTable<'_> {
    /// Reference to column `idx` of this table. The rowid alias column
    /// reads the b-tree key.
    pub fn column_ref(&self, idx: usize) -> Expr {
        if self.table.columns[idx].is_ipk {
            Expr::Rowid {
                cursor: self.cursor,
            }
        } else {
            Expr::ColumnRef {
                cursor: self.cursor,
                column: idx,
            }
        }
    }

    fn column(&self, name: &str) -> Option<Expr> {
        self.table.column_index(name).map(|idx| self.column_ref(idx))
    }

    fn rowid_alias(&self, name: &str) -> Option<Expr> {
        ROWID_ALIASES
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(name))
            .then_some(Expr::Rowid {
                cursor: self.cursor,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::test_support::test_schema;
    use tessera_ast::BinaryOp;

    #[test]
    fn test_unqualified_first_match_wins() {
        let schema = test_schema();
        let mut scope = Scope::empty();
        scope.push(&schema[1], "orders", 0);
        scope.push(&schema[0], "users", 1);
        // Both tables have `id`; orders comes first in FROM.
        assert_eq!(
            scope.resolve(&Expr::column("ID")).unwrap(),
            Expr::ColumnRef {
                cursor: 0,
                column: 0
            }
        );
        assert_eq!(
            scope.resolve(&Expr::column("email")).unwrap(),
            Expr::ColumnRef {
                cursor: 1,
                column: 2
            }
        );
    }

    #[test]
    fn test_qualified_name_must_match_exactly() {
        let schema = test_schema();
        let mut scope = Scope::empty();
        scope.push(&schema[0], "u", 3);
        assert_eq!(
            scope.resolve(&Expr::qualified("u", "NAME")).unwrap(),
            Expr::ColumnRef {
                cursor: 3,
                column: 1
            }
        );
        let err = scope.resolve(&Expr::qualified("users", "name")).unwrap_err();
        assert_eq!(
            err,
            TesseraError::NoSuchTable {
                name: "users".to_owned()
            }
        );
        let err = scope.resolve(&Expr::qualified("u", "nope")).unwrap_err();
        assert_eq!(
            err,
            TesseraError::NoSuchColumn {
                name: "u.nope".to_owned()
            }
        );
    }

    #[test]
    fn test_ipk_and_rowid_aliases_read_the_key() {
        let schema = test_schema();
        let scope = Scope::single(&schema[0], 0);
        assert_eq!(
            scope.resolve(&Expr::column("id")).unwrap(),
            Expr::Rowid { cursor: 0 }
        );
        assert_eq!(
            scope.resolve(&Expr::column("_ROWID_")).unwrap(),
            Expr::Rowid { cursor: 0 }
        );
        assert!(Scope::empty().resolve(&Expr::column("rowid")).is_err());
    }

    #[test]
    fn test_resolution_builds_a_new_tree() {
        let schema = test_schema();
        let scope = Scope::single(&schema[1], 0);
        let input = Expr::binary(BinaryOp::Multiply, Expr::column("amount"), Expr::Integer(2));
        let resolved = scope.resolve(&input).unwrap();
        assert!(matches!(input, Expr::Binary { .. }));
        assert_eq!(
            resolved,
            Expr::binary(
                BinaryOp::Multiply,
                Expr::ColumnRef {
                    cursor: 0,
                    column: 2
                },
                Expr::Integer(2)
            )
        );
    }
}
