//! DELETE code generation.
//!
//! Without a WHERE clause (and with the truncate optimization on) the table
//! is emptied with one `Clear`, so the program does not grow with the table.
//! Otherwise deletion runs in two passes:
//!
//! ```text
//! Init; OpenWrite table (+ indexes); Null rowset
//! [Integer limit; IfNot limit -> done]
//! Rewind -> collected
//! scan: WHERE -> next; Rowid; RowSetAdd; [DecrJumpZero limit -> collected]
//! next: Next -> scan
//! collected:
//!   RowSetRead -> done; NotExists -> collected
//!   [IdxDelete per index]; [FkCheck]; Delete; Goto collected
//! done: Close ...; Halt
//! ```
//!
//! Deleting under a live scan cursor would skip rows, which is why pass 1
//! only collects rowids.

use serde::{Deserialize, Serialize};
use tessera_ast::DeleteStatement;
use tessera_error::Result;
use tessera_types::opcode::{Opcode, P4};

use super::expr::{ExprCtx, emit_filter, reject_aggregates};
use super::resolve::Scope;
use super::schema::{SchemaLookup, TableSchema};
use super::{
    CodegenContext, close_cursors, emit_halt, emit_index_deletes, emit_init, finish_program,
    lookup_table, open_index_cursors, rejected,
};
use crate::{ProgramBuilder, VdbeProgram};

/// Compile a DELETE under `ctx`.
pub fn codegen_delete<S: SchemaLookup + ?Sized>(
    stmt: &DeleteStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<VdbeProgram> {
    let _span = tracing::debug_span!(
        "codegen.delete",
        table = %stmt.table,
        filtered = stmt.where_clause.is_some()
    )
    .entered();
    let mut b = ctx.builder();
    emit_delete(&mut b, stmt, schema, ctx).map_err(|e| rejected("delete", e))?;
    finish_program(b, "delete")
}

/// DELETE that mirrors every removed row into the table's indexes.
pub fn codegen_delete_with_indexes<S: SchemaLookup + ?Sized>(
    stmt: &DeleteStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<VdbeProgram> {
    let ctx = CodegenContext {
        maintain_indexes: true,
        ..ctx.clone()
    };
    codegen_delete(stmt, schema, &ctx)
}

/// DELETE that checks foreign-key constraints before each row is removed.
/// This always takes the row-by-row path.
pub fn codegen_delete_with_foreign_keys<S: SchemaLookup + ?Sized>(
    stmt: &DeleteStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<VdbeProgram> {
    let ctx = CodegenContext {
        foreign_keys: true,
        ..ctx.clone()
    };
    codegen_delete(stmt, schema, &ctx)
}

/// Asymptotic cost of running a compiled DELETE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteCost {
    /// One `Clear` per b-tree, whatever the table size.
    Constant,
    /// Every row is visited; at most `rows` are deleted.
    Linear { rows: u64 },
}

/// Estimate the cost of running `stmt` under `ctx` against a table of
/// `table_rows` rows. Agrees with the program `codegen_delete` emits.
pub fn estimate_delete_cost(
    stmt: &DeleteStatement,
    ctx: &CodegenContext,
    table_rows: u64,
) -> DeleteCost {
    if clears_table(stmt, ctx) {
        return DeleteCost::Constant;
    }
    let rows = effective_limit(stmt).map_or(table_rows, |n| table_rows.min(n.unsigned_abs()));
    DeleteCost::Linear { rows }
}

/// A negative LIMIT means no limit.
fn effective_limit(stmt: &DeleteStatement) -> Option<i64> {
    stmt.limit.filter(|&n| n >= 0)
}

/// Whether `stmt` compiles to a bare `Clear` instead of a row scan.
fn clears_table(stmt: &DeleteStatement, ctx: &CodegenContext) -> bool {
    stmt.where_clause.is_none()
        && effective_limit(stmt).is_none()
        && ctx.truncate_optimization
        && !ctx.foreign_keys
}

fn emit_delete<S: SchemaLookup + ?Sized>(
    b: &mut ProgramBuilder,
    stmt: &DeleteStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<()> {
    let table = lookup_table(schema, &stmt.table)?;
    let limit = effective_limit(stmt);

    if clears_table(stmt, ctx) {
        emit_truncate(b, table, ctx);
        return Ok(());
    }

    let cursor = b.alloc_cursor();
    let filter = stmt
        .where_clause
        .as_ref()
        .map(|w| Scope::single(table, cursor).resolve(w))
        .transpose()?;
    if let Some(filter) = &filter {
        reject_aggregates(filter)?;
    }
    let exprs = ExprCtx::new();

    emit_init(b);
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

    let rowset = b.alloc_reg();
    b.emit_op(Opcode::Null, 0, rowset, 0, P4::None, 0);
    let done = b.emit_label();
    let collected = b.emit_label();

    let limit_reg = match limit {
        Some(n) => {
            let reg = b.alloc_reg();
            match i32::try_from(n) {
                Ok(small) => b.emit_op(Opcode::Integer, small, reg, 0, P4::None, 0),
                Err(_) => b.emit_op(Opcode::Int64, 0, reg, 0, P4::Int64(n), 0),
            };
            b.emit_jump_to_label(Opcode::IfNot, reg, 0, done, P4::None, 0);
            Some(reg)
        }
        None => None,
    };

    // Pass 1: collect rowids.
    b.emit_jump_to_label(Opcode::Rewind, cursor, 0, collected, P4::None, 0);
    let scan = b.label_here();
    let next = b.emit_label();
    if let Some(filter) = &filter {
        emit_filter(b, filter, next, &exprs)?;
    }
    let rowid_tmp = b.alloc_temp();
    b.emit_op(Opcode::Rowid, cursor, rowid_tmp, 0, P4::None, 0);
    b.emit_op(Opcode::RowSetAdd, rowset, rowid_tmp, 0, P4::None, 0);
    b.free_temp(rowid_tmp);
    if let Some(reg) = limit_reg {
        b.emit_jump_to_label(Opcode::DecrJumpZero, reg, 0, collected, P4::None, 0);
    }
    b.resolve_label(next);
    b.emit_jump_to_label(Opcode::Next, cursor, 0, scan, P4::None, 0);

    // Pass 2: delete what was collected.
    b.resolve_label(collected);
    let rowid_reg = b.alloc_reg();
    b.emit_jump_to_label(Opcode::RowSetRead, rowset, rowid_reg, done, P4::None, 0);
    b.emit_jump_to_label(Opcode::NotExists, cursor, rowid_reg, collected, P4::None, 0);
    emit_index_deletes(b, table, &index_cursors, cursor)?;
    if ctx.foreign_keys {
        b.emit_op(Opcode::FkCheck, cursor, 0, 0, P4::Table(table.name.clone()), 0);
    }
    b.emit_op(Opcode::Delete, cursor, 0, 0, P4::Table(table.name.clone()), 0);
    b.emit_jump_to_label(Opcode::Goto, 0, 0, collected, P4::None, 0);

    b.resolve_label(done);
    close_cursors(
        b,
        std::iter::once(cursor).chain(index_cursors.iter().map(|&(c, _)| c)),
    );
    emit_halt(b);
    Ok(())
}

/// `Init; Clear table; [Clear index]*; Halt`.
fn emit_truncate(b: &mut ProgramBuilder, table: &TableSchema, ctx: &CodegenContext) {
    emit_init(b);
    b.emit_op(
        Opcode::Clear,
        table.root_page,
        0,
        0,
        P4::Table(table.name.clone()),
        0,
    );
    if ctx.maintain_indexes {
        for index in &table.indexes {
            b.emit_op(
                Opcode::Clear,
                index.root_page,
                0,
                0,
                P4::Index(index.name.clone()),
                0,
            );
        }
    }
    emit_halt(b);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::schema::{ColumnInfo, IndexSchema};
    use crate::codegen::test_support::*;
    use tessera_ast::{BinaryOp, Expr};
    use tessera_error::TesseraError;

    fn delete(table: &str, where_clause: Option<Expr>, limit: Option<i64>) -> DeleteStatement {
        DeleteStatement {
            table: table.to_owned(),
            where_clause,
            limit,
        }
    }

    fn user_id_gt(n: i64) -> Expr {
        Expr::binary(BinaryOp::Gt, Expr::column("user_id"), Expr::Integer(n))
    }

    #[test]
    fn test_truncate_is_constant_size() {
        let ctx = CodegenContext::default();
        let mut sizes = Vec::new();
        for rows in [0_u64, 10, 1_000_000] {
            let schema = test_schema();
            let stmt = delete("users", None, None);
            assert_eq!(estimate_delete_cost(&stmt, &ctx, rows), DeleteCost::Constant);
            let prog = codegen_delete(&stmt, &schema, &ctx).unwrap();
            assert_well_formed(&prog);
            sizes.push(prog.len());
        }
        assert!(sizes.iter().all(|&n| n == 3), "{sizes:?}");
    }

    #[test]
    fn test_truncate_clears_indexes_too() {
        let schema = test_schema();
        let prog =
            codegen_delete(&delete("orders", None, None), &schema, &CodegenContext::default())
                .unwrap();
        assert_eq!(
            opcode_sequence(&prog),
            vec![Opcode::Init, Opcode::Clear, Opcode::Clear, Opcode::Halt]
        );
        assert_eq!(prog.ops()[2].p1, 201);
    }

    #[test]
    fn test_two_pass_shape() {
        let schema = test_schema();
        let ctx = CodegenContext {
            maintain_indexes: false,
            ..CodegenContext::default()
        };
        let prog = codegen_delete(&delete("orders", Some(user_id_gt(1)), None), &schema, &ctx)
            .unwrap();
        assert_well_formed(&prog);
        assert!(has_opcodes(
            &prog,
            &[
                Opcode::OpenWrite,
                Opcode::Rewind,
                Opcode::IfNot,
                Opcode::Rowid,
                Opcode::RowSetAdd,
                Opcode::Next,
                Opcode::RowSetRead,
                Opcode::NotExists,
                Opcode::Delete,
                Opcode::Goto,
                Opcode::Close,
                Opcode::Halt,
            ]
        ));
        // No Delete inside the scan loop.
        let rewind = opcode_sequence(&prog)
            .iter()
            .position(|&op| op == Opcode::Rewind)
            .unwrap();
        let next = opcode_sequence(&prog)
            .iter()
            .position(|&op| op == Opcode::Next)
            .unwrap();
        assert!(
            prog.ops()[rewind..next]
                .iter()
                .all(|op| op.opcode != Opcode::Delete)
        );
    }

    #[test]
    fn test_truncate_can_be_disabled() {
        let schema = test_schema();
        let ctx = CodegenContext {
            truncate_optimization: false,
            ..CodegenContext::default()
        };
        let prog = codegen_delete(&delete("users", None, None), &schema, &ctx).unwrap();
        assert_eq!(prog.count(Opcode::Clear), 0);
        assert_eq!(prog.count(Opcode::RowSetAdd), 1);
        assert_well_formed(&prog);
    }

    #[test]
    fn test_foreign_key_variant_checks_before_delete() {
        let schema = test_schema();
        let ctx = CodegenContext::default();
        let prog =
            codegen_delete_with_foreign_keys(&delete("users", None, None), &schema, &ctx).unwrap();
        assert_eq!(prog.count(Opcode::Clear), 0);
        let ops = opcode_sequence(&prog);
        let fk = ops.iter().position(|&op| op == Opcode::FkCheck).unwrap();
        assert_eq!(ops[fk + 1], Opcode::Delete);
        assert_well_formed(&prog);
    }

    #[test]
    fn test_index_variant_mirrors_deletes() {
        let schema = test_schema();
        let ctx = CodegenContext {
            maintain_indexes: false,
            ..CodegenContext::default()
        };
        let stmt = delete("orders", Some(user_id_gt(0)), None);
        assert_eq!(codegen_delete(&stmt, &schema, &ctx).unwrap().count(Opcode::IdxDelete), 0);
        let prog = codegen_delete_with_indexes(&stmt, &schema, &ctx).unwrap();
        assert_eq!(prog.count(Opcode::IdxDelete), 1);
        assert!(has_opcodes(&prog, &[Opcode::NotExists, Opcode::IdxDelete, Opcode::Delete]));
    }

    #[test]
    fn test_limit_bounds_collection_and_cost() {
        let schema = test_schema();
        let stmt = delete("users", None, Some(5));
        let ctx = CodegenContext::default();
        let prog = codegen_delete(&stmt, &schema, &ctx).unwrap();
        assert_eq!(prog.count(Opcode::Clear), 0);
        assert_eq!(prog.count(Opcode::DecrJumpZero), 1);
        assert_eq!(estimate_delete_cost(&stmt, &ctx, 100), DeleteCost::Linear { rows: 5 });
        assert_eq!(estimate_delete_cost(&stmt, &ctx, 3), DeleteCost::Linear { rows: 3 });

        let unlimited = delete("users", Some(Expr::Integer(1)), Some(-1));
        assert_eq!(
            estimate_delete_cost(&unlimited, &ctx, 100),
            DeleteCost::Linear { rows: 100 }
        );
        let prog = codegen_delete(&unlimited, &schema, &ctx).unwrap();
        assert_eq!(prog.count(Opcode::DecrJumpZero), 0);
    }

    #[test]
    fn test_estimate_delete_cost_matches_compiled_program() {
        let schema = test_schema();
        let default = CodegenContext::default();
        let with_fks = CodegenContext {
            foreign_keys: true,
            ..CodegenContext::default()
        };
        let no_truncate = CodegenContext {
            truncate_optimization: false,
            ..CodegenContext::default()
        };
        let cases = [
            (delete("users", None, Some(-1)), &default, DeleteCost::Constant),
            (delete("users", None, None), &with_fks, DeleteCost::Linear { rows: 1000 }),
            (delete("users", None, None), &no_truncate, DeleteCost::Linear { rows: 1000 }),
            (delete("users", None, Some(-7)), &with_fks, DeleteCost::Linear { rows: 1000 }),
            (
                delete("orders", Some(user_id_gt(3)), None),
                &default,
                DeleteCost::Linear { rows: 1000 },
            ),
        ];
        for (stmt, ctx, expected) in cases {
            let cost = estimate_delete_cost(&stmt, ctx, 1000);
            assert_eq!(cost, expected, "{stmt:?}");
            let prog = codegen_delete(&stmt, &schema, ctx).unwrap();
            let clears = prog.count(Opcode::Clear) > 0;
            assert_eq!(clears, cost == DeleteCost::Constant, "{stmt:?}");
            assert_eq!(prog.count(Opcode::Delete) == 0, clears, "{stmt:?}");
        }
    }

    #[test]
    fn test_unknown_names_fail() {
        let schema = vec![
            TableSchema::new("t", 2, vec![ColumnInfo::new("a", "")]).with_index(IndexSchema {
                name: "t_a".to_owned(),
                root_page: 3,
                columns: vec!["a".to_owned()],
                unique: false,
            }),
        ];
        let ctx = CodegenContext::default();
        let err = codegen_delete(&delete("u", None, None), &schema, &ctx).unwrap_err();
        assert!(matches!(err, TesseraError::NoSuchTable { .. }));
        let err = codegen_delete(&delete("t", Some(Expr::column("b")), None), &schema, &ctx)
            .unwrap_err();
        assert!(matches!(err, TesseraError::NoSuchColumn { .. }));
    }
}
