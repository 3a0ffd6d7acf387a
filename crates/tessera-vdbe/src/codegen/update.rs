//! UPDATE code generation: a single scan that rewrites matching rows in
//! place.
//!
//! ```text
//! Init; OpenWrite table (+ indexes); Rewind -> done
//! loop:
//!   Rowid; WHERE -> next
//!   Column* (current values); new values over the assigned columns
//!   [IdxDelete old keys]; MakeRecord; Delete; Insert (same rowid)
//!   [IdxInsert new keys]
//! next: Next -> loop
//! done: Close ...; Halt
//! ```

use tessera_ast::{Expr, UpdateStatement};
use tessera_error::{Result, TesseraError};
use tessera_types::opcode::{Opcode, P4};

use super::expr::{ExprCtx, emit_expr, emit_filter, reject_aggregates};
use super::resolve::Scope;
use super::schema::SchemaLookup;
use super::{
    CodegenContext, KeySource, close_cursors, emit_halt, emit_index_deletes, emit_index_inserts,
    emit_init, finish_program, lookup_table, open_index_cursors, reg_offset, rejected,
};
use crate::{ProgramBuilder, VdbeProgram};

/// Compile an UPDATE.
///
/// New-value expressions read the row through the cursor, so they always
/// see pre-update values regardless of assignment order.
pub fn codegen_update<S: SchemaLookup + ?Sized>(
    stmt: &UpdateStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<VdbeProgram> {
    let _span = tracing::debug_span!("codegen.update", table = %stmt.table).entered();
    let mut b = ctx.builder();
    emit_update(&mut b, stmt, schema, ctx).map_err(|e| rejected("update", e))?;
    finish_program(b, "update")
}

fn emit_update<S: SchemaLookup + ?Sized>(
    b: &mut ProgramBuilder,
    stmt: &UpdateStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<()> {
    let table = lookup_table(schema, &stmt.table)?;
    if stmt.columns.len() != stmt.values.len() {
        return Err(TesseraError::AssignmentCountMismatch {
            columns: stmt.columns.len(),
            values: stmt.values.len(),
        });
    }

    let cursor = b.alloc_cursor();
    let scope = Scope::single(table, cursor);

    // (column position, resolved new value)
    let mut assignments: Vec<(usize, Expr)> = Vec::with_capacity(stmt.columns.len());
    for (name, value) in stmt.columns.iter().zip(&stmt.values) {
        let col = table
            .column_index(name)
            .ok_or_else(|| TesseraError::NoSuchColumn {
                name: format!("{}.{name}", table.name),
            })?;
        if table.columns[col].is_ipk {
            return Err(TesseraError::Unsupported {
                construct: format!("assignment to INTEGER PRIMARY KEY column {name}"),
            });
        }
        let value = scope.resolve(value)?;
        reject_aggregates(&value)?;
        assignments.push((col, value));
    }
    let filter = stmt
        .where_clause
        .as_ref()
        .map(|w| scope.resolve(w))
        .transpose()?;
    if let Some(filter) = &filter {
        reject_aggregates(filter)?;
    }

    let exprs = ExprCtx::new();
    let ncols = reg_offset(table.columns.len())?;

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

    let rowid_reg = b.alloc_reg();
    let col_base = b.alloc_regs(ncols);
    let record_reg = b.alloc_reg();

    let done = b.emit_label();
    b.emit_jump_to_label(Opcode::Rewind, cursor, 0, done, P4::None, 0);
    let top = b.label_here();
    let next = b.emit_label();

    b.emit_op(Opcode::Rowid, cursor, rowid_reg, 0, P4::None, 0);
    if let Some(filter) = &filter {
        emit_filter(b, filter, next, &exprs)?;
    }

    for (j, info) in table.columns.iter().enumerate() {
        let reg = col_base + reg_offset(j)?;
        if info.is_ipk {
            b.emit_op(Opcode::Null, 0, reg, 0, P4::None, 0);
        } else {
            b.emit_op(Opcode::Column, cursor, reg_offset(j)?, reg, P4::None, 0);
        }
    }
    for (col, value) in &assignments {
        emit_expr(b, value, col_base + reg_offset(*col)?, &exprs)?;
    }

    emit_index_deletes(b, table, &index_cursors, cursor)?;
    b.emit_op(
        Opcode::MakeRecord,
        col_base,
        ncols,
        record_reg,
        P4::Affinity(table.affinity_string()),
        0,
    );
    b.emit_op(Opcode::Delete, cursor, 0, 0, P4::Table(table.name.clone()), 0);
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

    b.resolve_label(next);
    b.emit_jump_to_label(Opcode::Next, cursor, 0, top, P4::None, 0);
    b.resolve_label(done);
    close_cursors(
        b,
        std::iter::once(cursor).chain(index_cursors.iter().map(|&(c, _)| c)),
    );
    emit_halt(b);
    Ok(())
}
