//! Code generation: statement descriptors to VDBE bytecode.
//!
//! Every public `codegen_*` entry point follows the same contract. It takes
//! an immutable statement, a [`SchemaLookup`] and a [`CodegenContext`],
//! builds into a private [`ProgramBuilder`] and returns the finished
//! program only when every step succeeded. Validation errors are raised
//! before the first instruction is emitted.
//!
//! Programs open with `Init` and end with `Halt`. The table a DML statement
//! targets always gets cursor 0; index cursors follow in schema order.

mod aggregate;
mod compound;
mod context;
pub mod ddl;
pub mod delete;
mod expr;
pub mod insert;
mod resolve;
pub mod schema;
pub mod select;
pub mod update;

pub use context::CodegenContext;
pub use ddl::{
    CatalogKind, CatalogRow, catalog_row, codegen_create_index, codegen_create_table,
    encode_catalog_row,
};
pub use delete::{
    DeleteCost, codegen_delete, codegen_delete_with_foreign_keys, codegen_delete_with_indexes,
    estimate_delete_cost,
};
pub use insert::{codegen_insert, codegen_insert_autoincrement};
pub use schema::{ColumnInfo, IndexSchema, SchemaLookup, TableSchema};
pub use select::{SelectCompilation, SelectDest, codegen_select, emit_select};
pub use update::codegen_update;

use tessera_ast::Statement;
use tessera_error::{Result, TesseraError};
use tessera_types::opcode::{Opcode, P4};

use crate::{ProgramBuilder, VdbeProgram};

/// Compile any supported statement.
///
/// `None` stands for "the parser produced nothing" and is rejected with
/// [`TesseraError::MissingStatement`].
pub fn compile_statement<S: SchemaLookup + ?Sized>(
    stmt: Option<&Statement>,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<VdbeProgram> {
    let Some(stmt) = stmt else {
        tracing::warn!("codegen.rejected: no statement");
        return Err(TesseraError::MissingStatement);
    };
    match stmt {
        Statement::Select(select) => codegen_select(select, schema, ctx).map(|c| c.program),
        Statement::Insert(insert) => codegen_insert(insert, schema, ctx),
        Statement::Update(update) => codegen_update(update, schema, ctx),
        Statement::Delete(delete) => codegen_delete(delete, schema, ctx),
        Statement::CreateTable(create) => codegen_create_table(create, schema, ctx),
        Statement::CreateIndex(create) => codegen_create_index(create, schema, ctx),
    }
}

// ── Shared helpers ──────────────────────────────────────────────────────────

/// Look up the table a statement targets.
pub(crate) fn lookup_table<'s, S: SchemaLookup + ?Sized>(
    schema: &'s S,
    name: &str,
) -> Result<&'s TableSchema> {
    if name.is_empty() {
        return Err(TesseraError::EmptyTableName);
    }
    schema.table(name).ok_or_else(|| TesseraError::NoSuchTable {
        name: name.to_owned(),
    })
}

/// Log a rejected compilation and pass the error through.
pub(crate) fn rejected(kind: &str, err: TesseraError) -> TesseraError {
    tracing::warn!(error = %err, category = ?err.category(), "codegen.{kind}.rejected");
    err
}

/// `Init` jumping to the instruction right after it.
pub(crate) fn emit_init(b: &mut ProgramBuilder) {
    let start = b.emit_label();
    b.emit_jump_to_label(Opcode::Init, 0, 0, start, P4::None, 0);
    b.resolve_label(start);
}

pub(crate) fn emit_halt(b: &mut ProgramBuilder) {
    b.emit_op(Opcode::Halt, 0, 0, 0, P4::None, 0);
}

/// Patch labels and log the program shape.
pub(crate) fn finish_program(b: ProgramBuilder, kind: &str) -> Result<VdbeProgram> {
    let program = b.finish().map_err(|e| rejected(kind, e))?;
    tracing::debug!(
        ops = program.len(),
        registers = program.register_count(),
        cursors = program.cursor_count(),
        "codegen.{kind}.complete"
    );
    Ok(program)
}

/// Open `OpenWrite` cursors on every index of `table`, in schema order.
pub(crate) fn open_index_cursors<'t>(
    b: &mut ProgramBuilder,
    table: &'t TableSchema,
) -> Vec<(i32, &'t IndexSchema)> {
    table
        .indexes
        .iter()
        .map(|index| {
            let cursor = b.alloc_cursor();
            b.emit_op(
                Opcode::OpenWrite,
                cursor,
                index.root_page,
                0,
                P4::Index(index.name.clone()),
                0,
            );
            (cursor, index)
        })
        .collect()
}

pub(crate) fn close_cursors(b: &mut ProgramBuilder, cursors: impl IntoIterator<Item = i32>) {
    for cursor in cursors {
        b.emit_op(Opcode::Close, cursor, 0, 0, P4::None, 0);
    }
}

/// Where the values of an index key come from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum KeySource {
    /// Column `i` lives in register `base + i`; the rowid in `rowid`.
    Registers { base: i32, rowid: i32 },
    /// Read through the table cursor positioned on the row.
    Cursor(i32),
}

/// Build the record key for `index`: the indexed columns followed by the
/// rowid. Returns the register holding the record.
pub(crate) fn emit_index_key(
    b: &mut ProgramBuilder,
    table: &TableSchema,
    index: &IndexSchema,
    source: KeySource,
) -> Result<i32> {
    let width = i32::try_from(index.columns.len() + 1)
        .map_err(|_| TesseraError::internal("index key too wide"))?;
    let key_base = b.alloc_regs(width);

    for (k, col_name) in (0_i32..).zip(&index.columns) {
        let col = table
            .column_index(col_name)
            .ok_or_else(|| TesseraError::NoSuchColumn {
                name: format!("{}.{col_name}", table.name),
            })?;
        let dest = key_base + k;
        let is_ipk = table.columns[col].is_ipk;
        match source {
            KeySource::Registers { rowid, .. } if is_ipk => {
                b.emit_op(Opcode::SCopy, rowid, dest, 0, P4::None, 0);
            }
            KeySource::Registers { base, .. } => {
                b.emit_op(Opcode::SCopy, base + reg_offset(col)?, dest, 0, P4::None, 0);
            }
            KeySource::Cursor(cursor) if is_ipk => {
                b.emit_op(Opcode::Rowid, cursor, dest, 0, P4::None, 0);
            }
            KeySource::Cursor(cursor) => {
                b.emit_op(Opcode::Column, cursor, reg_offset(col)?, dest, P4::None, 0);
            }
        }
    }

    let rowid_dest = key_base + width - 1;
    match source {
        KeySource::Registers { rowid, .. } => {
            b.emit_op(Opcode::SCopy, rowid, rowid_dest, 0, P4::None, 0);
        }
        KeySource::Cursor(cursor) => {
            b.emit_op(Opcode::Rowid, cursor, rowid_dest, 0, P4::None, 0);
        }
    }

    let record = b.alloc_reg();
    b.emit_op(Opcode::MakeRecord, key_base, width, record, P4::None, 0);
    Ok(record)
}

/// One `IdxInsert` per index.
pub(crate) fn emit_index_inserts(
    b: &mut ProgramBuilder,
    table: &TableSchema,
    index_cursors: &[(i32, &IndexSchema)],
    source: KeySource,
) -> Result<()> {
    for &(cursor, index) in index_cursors {
        let key = emit_index_key(b, table, index, source)?;
        b.emit_op(
            Opcode::IdxInsert,
            cursor,
            key,
            0,
            P4::Index(index.name.clone()),
            0,
        );
    }
    Ok(())
}

/// One `IdxDelete` per index, keyed from the row under `table_cursor`.
pub(crate) fn emit_index_deletes(
    b: &mut ProgramBuilder,
    table: &TableSchema,
    index_cursors: &[(i32, &IndexSchema)],
    table_cursor: i32,
) -> Result<()> {
    for &(cursor, index) in index_cursors {
        let key = emit_index_key(b, table, index, KeySource::Cursor(table_cursor))?;
        b.emit_op(
            Opcode::IdxDelete,
            cursor,
            key,
            0,
            P4::Index(index.name.clone()),
            0,
        );
    }
    Ok(())
}

/// Column position or width as an operand.
pub(crate) fn reg_offset(n: usize) -> Result<i32> {
    i32::try_from(n).map_err(|_| TesseraError::internal(format!("operand {n} out of range")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use tessera_types::TypeAffinity;
    use tessera_types::opcode::Opcode;

    use super::schema::{ColumnInfo, IndexSchema, TableSchema};
    use crate::VdbeProgram;

    /// `users(id INTEGER PRIMARY KEY, name TEXT, email TEXT)` at root 100,
    /// `orders(id, user_id, amount REAL)` at root 200 with one index.
    pub fn test_schema() -> Vec<TableSchema> {
        vec![
            TableSchema::new(
                "users",
                100,
                vec![
                    ColumnInfo::basic("id", TypeAffinity::Integer, true),
                    ColumnInfo::new("name", "TEXT"),
                    ColumnInfo::new("email", "TEXT"),
                ],
            ),
            TableSchema::new(
                "orders",
                200,
                vec![
                    ColumnInfo::basic("id", TypeAffinity::Integer, false),
                    ColumnInfo::new("user_id", "INTEGER"),
                    ColumnInfo::new("amount", "REAL"),
                ],
            )
            .with_index(IndexSchema {
                name: "idx_orders_user".to_owned(),
                root_page: 201,
                columns: vec!["user_id".to_owned()],
                unique: false,
            }),
        ]
    }

    pub fn opcode_sequence(prog: &VdbeProgram) -> Vec<Opcode> {
        prog.ops().iter().map(|op| op.opcode).collect()
    }

    /// Whether `expected` occurs in order (not necessarily adjacent).
    pub fn has_opcodes(prog: &VdbeProgram, expected: &[Opcode]) -> bool {
        let mut want = expected.iter().peekable();
        for op in prog.ops() {
            if want.peek() == Some(&&op.opcode) {
                want.next();
            }
        }
        want.peek().is_none()
    }

    /// Init first, Halt last, every jump in range.
    pub fn assert_well_formed(prog: &VdbeProgram) {
        let ops = opcode_sequence(prog);
        assert_eq!(ops.first(), Some(&Opcode::Init), "{}", prog.disassemble());
        assert_eq!(ops.last(), Some(&Opcode::Halt), "{}", prog.disassemble());
        assert!(prog.jump_targets_in_bounds(), "{}", prog.disassemble());
    }
}
