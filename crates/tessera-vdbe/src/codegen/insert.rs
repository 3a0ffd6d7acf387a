//! INSERT ... VALUES code generation.
//!
//! ```text
//! Init
//! OpenWrite  table (+ one per index)
//! for each row:
//!   NewRowid; load column values; [IPK override]; MakeRecord; Insert
//!   [IdxInsert per index]
//! Close ...; Halt
//! ```

use tessera_ast::{Expr, InsertStatement};
use tessera_error::{Result, TesseraError};
use tessera_types::opcode::{Opcode, P4};

use super::expr::{ExprCtx, emit_expr, emit_value};
use super::resolve::Scope;
use super::schema::{SchemaLookup, TableSchema};
use super::{
    CodegenContext, KeySource, close_cursors, emit_halt, emit_index_inserts, emit_init,
    finish_program, lookup_table, open_index_cursors, reg_offset, rejected,
};
use crate::{ProgramBuilder, VdbeProgram};

/// Compile an INSERT.
///
/// Rows are checked up front: an empty row list or a row whose length
/// differs from the target column count fails before anything is emitted.
/// Exactly one `Insert` instruction is produced per row.
pub fn codegen_insert<S: SchemaLookup + ?Sized>(
    stmt: &InsertStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<VdbeProgram> {
    let _span = tracing::debug_span!("codegen.insert", table = %stmt.table, rows = stmt.rows.len())
        .entered();
    let mut b = ctx.builder();
    emit_insert(&mut b, stmt, schema, ctx).map_err(|e| rejected("insert", e))?;
    let program = finish_program(b, "insert")?;

    let inserts = program.count(Opcode::Insert);
    if inserts != stmt.rows.len() {
        return Err(rejected(
            "insert",
            TesseraError::internal(format!(
                "{inserts} Insert instructions for {} rows",
                stmt.rows.len()
            )),
        ));
    }
    Ok(program)
}

/// INSERT into a table whose rowids are assigned by auto-increment.
///
/// `NewRowid` already yields one past the largest rowid, so this compiles
/// to the same program as [`codegen_insert`].
pub fn codegen_insert_autoincrement<S: SchemaLookup + ?Sized>(
    stmt: &InsertStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<VdbeProgram> {
    codegen_insert(stmt, schema, ctx)
}

/// Each row reordered into table column order. `None` marks a column the
/// statement did not list.
type TableOrderRow = Vec<Option<Expr>>;

fn validate<'s, S: SchemaLookup + ?Sized>(
    stmt: &InsertStatement,
    schema: &'s S,
) -> Result<(&'s TableSchema, Vec<TableOrderRow>)> {
    let table = lookup_table(schema, &stmt.table)?;
    if stmt.rows.is_empty() {
        return Err(TesseraError::EmptyValues {
            table: stmt.table.clone(),
        });
    }

    let targets: Vec<usize> = if stmt.columns.is_empty() {
        (0..table.columns.len()).collect()
    } else {
        stmt.columns
            .iter()
            .map(|name| {
                table
                    .column_index(name)
                    .ok_or_else(|| TesseraError::NoSuchColumn {
                        name: format!("{}.{name}", table.name),
                    })
            })
            .collect::<Result<_>>()?
    };

    // VALUES cannot see any table.
    let scope = Scope::empty();
    let mut rows = Vec::with_capacity(stmt.rows.len());
    for (i, row) in stmt.rows.iter().enumerate() {
        if row.len() != targets.len() {
            return Err(TesseraError::ColumnCountMismatch {
                row: i,
                expected: targets.len(),
                actual: row.len(),
            });
        }
        let mut ordered: TableOrderRow = vec![None; table.columns.len()];
        for (&col, value) in targets.iter().zip(row) {
            ordered[col] = Some(scope.resolve(value)?);
        }
        rows.push(ordered);
    }
    Ok((table, rows))
}

fn emit_insert<S: SchemaLookup + ?Sized>(
    b: &mut ProgramBuilder,
    stmt: &InsertStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<()> {
    let (table, rows) = validate(stmt, schema)?;
    let ncols = reg_offset(table.columns.len())?;
    let exprs = ExprCtx::new();

    emit_init(b);
    let cursor = b.alloc_cursor();
    b.emit_op(
        Opcode::OpenWrite,
        cursor,
        table.root_page,
        0,
        P4::Table(table.name.clone()),
        0,
    );
    let index_cursors = if ctx.maintain_indexes {
        open_index_cursors(b, table)
    } else {
        Vec::new()
    };

    let rowid_reg = b.alloc_reg();
    let col_base = b.alloc_regs(ncols);
    let record_reg = b.alloc_reg();
    let affinity = table.affinity_string();

    for row in &rows {
        b.emit_op(Opcode::NewRowid, cursor, rowid_reg, 0, P4::None, 0);

        for (j, (value, info)) in row.iter().zip(&table.columns).enumerate() {
            let reg = col_base + reg_offset(j)?;
            match value {
                Some(expr) => emit_expr(b, expr, reg, &exprs)?,
                None => match &info.default_value {
                    Some(default) => emit_value(b, default, reg)?,
                    None => {
                        b.emit_op(Opcode::Null, 0, reg, 0, P4::None, 0);
                    }
                },
            }
        }

        if let Some(ipk) = table.ipk_index() {
            // A supplied non-NULL value becomes the rowid; the record stores
            // NULL in the alias column either way.
            let reg = col_base + reg_offset(ipk)?;
            let keep_new_rowid = b.emit_label();
            b.emit_jump_to_label(Opcode::IsNull, reg, 0, keep_new_rowid, P4::None, 0);
            b.emit_op(Opcode::MustBeInt, reg, 0, 0, P4::None, 0);
            b.emit_op(Opcode::SCopy, reg, rowid_reg, 0, P4::None, 0);
            b.resolve_label(keep_new_rowid);
            b.emit_op(Opcode::Null, 0, reg, 0, P4::None, 0);
        }

        b.emit_op(
            Opcode::MakeRecord,
            col_base,
            ncols,
            record_reg,
            P4::Affinity(affinity.clone()),
            0,
        );
        b.emit_op(
            Opcode::Insert,
            cursor,
            record_reg,
            rowid_reg,
            P4::Table(table.name.clone()),
            0,
        );
        emit_index_inserts(
            b,
            table,
            &index_cursors,
            KeySource::Registers {
                base: col_base,
                rowid: rowid_reg,
            },
        )?;
    }

    close_cursors(
        b,
        std::iter::once(cursor).chain(index_cursors.iter().map(|&(c, _)| c)),
    );
    emit_halt(b);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::schema::ColumnInfo;
    use crate::codegen::test_support::*;
    use tessera_types::{SqliteValue, TypeAffinity};

    fn insert(table: &str, columns: &[&str], rows: Vec<Vec<Expr>>) -> InsertStatement {
        InsertStatement {
            table: table.to_owned(),
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows,
        }
    }

    #[test]
    fn test_scenario_users_single_row() {
        let schema = vec![TableSchema::new(
            "users",
            100,
            vec![
                ColumnInfo::basic("id", TypeAffinity::Integer, false),
                ColumnInfo::new("name", "TEXT"),
                ColumnInfo::new("email", "TEXT"),
            ],
        )];
        let stmt = insert(
            "users",
            &["id", "name", "email"],
            vec![vec![
                Expr::Integer(1),
                "Alice".into(),
                "alice@example.com".into(),
            ]],
        );
        let prog = codegen_insert(&stmt, &schema, &CodegenContext::default()).unwrap();
        assert_well_formed(&prog);
        assert_eq!(prog.count(Opcode::Insert), 1);
        let open = prog
            .ops()
            .iter()
            .find(|op| op.opcode == Opcode::OpenWrite)
            .unwrap();
        assert_eq!(open.p2, 100);
        assert!(has_opcodes(
            &prog,
            &[
                Opcode::Init,
                Opcode::OpenWrite,
                Opcode::NewRowid,
                Opcode::MakeRecord,
                Opcode::Insert,
                Opcode::Close,
                Opcode::Halt,
            ]
        ));
    }

    #[test]
    fn test_one_insert_per_row() {
        let schema = test_schema();
        for n in [1_usize, 2, 7, 40] {
            let rows = (0..n)
                .map(|i| {
                    vec![
                        Expr::Integer(i64::try_from(i).unwrap()),
                        "n".into(),
                        "e".into(),
                    ]
                })
                .collect();
            let prog =
                codegen_insert(&insert("users", &[], rows), &schema, &CodegenContext::default())
                    .unwrap();
            assert_eq!(prog.count(Opcode::Insert), n);
            assert!(prog.jump_targets_in_bounds());
        }
    }

    #[test]
    fn test_row_width_mismatch_names_the_row() {
        let schema = test_schema();
        let stmt = insert(
            "users",
            &["name", "email"],
            vec![
                vec!["a".into(), "b".into()],
                vec!["only-one".into()],
            ],
        );
        let err = codegen_insert(&stmt, &schema, &CodegenContext::default()).unwrap_err();
        assert_eq!(
            err,
            TesseraError::ColumnCountMismatch {
                row: 1,
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_empty_rows_and_unknown_names() {
        let schema = test_schema();
        let ctx = CodegenContext::default();
        let err = codegen_insert(&insert("users", &[], vec![]), &schema, &ctx).unwrap_err();
        assert!(matches!(err, TesseraError::EmptyValues { .. }));
        let err = codegen_insert(&insert("ghosts", &[], vec![vec![]]), &schema, &ctx).unwrap_err();
        assert!(matches!(err, TesseraError::NoSuchTable { .. }));
        let err = codegen_insert(
            &insert("users", &["nickname"], vec![vec!["x".into()]]),
            &schema,
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, TesseraError::NoSuchColumn { .. }));
        let err = codegen_insert(
            &insert("users", &["name"], vec![vec![Expr::column("email")]]),
            &schema,
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, TesseraError::NoSuchColumn { .. }));
    }

    #[test]
    fn test_unlisted_columns_take_defaults() {
        let schema = vec![TableSchema::new(
            "t",
            5,
            vec![
                ColumnInfo::new("a", "TEXT"),
                ColumnInfo::new("b", "INTEGER").with_default(SqliteValue::Integer(9)),
            ],
        )];
        let prog = codegen_insert(
            &insert("t", &["a"], vec![vec!["x".into()]]),
            &schema,
            &CodegenContext::default(),
        )
        .unwrap();
        assert!(
            prog.ops()
                .iter()
                .any(|op| op.opcode == Opcode::Integer && op.p1 == 9)
        );
        let record = prog
            .ops()
            .iter()
            .find(|op| op.opcode == Opcode::MakeRecord)
            .unwrap();
        assert_eq!(record.p4, P4::Affinity("BD".to_owned()));
    }

    #[test]
    fn test_index_maintenance_follows_context() {
        let schema = test_schema();
        let stmt = insert(
            "orders",
            &[],
            vec![
                vec![Expr::Integer(1), Expr::Integer(10), Expr::Float(2.5)],
                vec![Expr::Integer(2), Expr::Integer(11), Expr::Float(3.5)],
            ],
        );
        let prog = codegen_insert(&stmt, &schema, &CodegenContext::default()).unwrap();
        assert_eq!(prog.count(Opcode::OpenWrite), 2);
        assert_eq!(prog.count(Opcode::IdxInsert), 2);
        assert_eq!(prog.cursor_count(), 2);

        let ctx = CodegenContext {
            maintain_indexes: false,
            ..CodegenContext::default()
        };
        let prog = codegen_insert(&stmt, &schema, &ctx).unwrap();
        assert_eq!(prog.count(Opcode::IdxInsert), 0);
        assert_eq!(prog.cursor_count(), 1);
    }

    #[test]
    fn test_ipk_value_overrides_new_rowid() {
        let schema = test_schema();
        let stmt = insert(
            "users",
            &["id", "name"],
            vec![vec![Expr::Integer(42), "z".into()]],
        );
        let prog = codegen_insert(&stmt, &schema, &CodegenContext::default()).unwrap();
        assert!(has_opcodes(
            &prog,
            &[
                Opcode::NewRowid,
                Opcode::IsNull,
                Opcode::MustBeInt,
                Opcode::SCopy,
                Opcode::Null,
                Opcode::MakeRecord,
                Opcode::Insert,
            ]
        ));
        assert_well_formed(&prog);
    }

    #[test]
    fn test_autoincrement_matches_plain_insert() {
        let schema = test_schema();
        let stmt = insert("users", &["name"], vec![vec!["a".into()]]);
        let ctx = CodegenContext::default();
        assert_eq!(
            codegen_insert_autoincrement(&stmt, &schema, &ctx).unwrap(),
            codegen_insert(&stmt, &schema, &ctx).unwrap()
        );
    }
}
