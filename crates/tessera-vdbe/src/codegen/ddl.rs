//! CREATE TABLE and CREATE INDEX.
//!
//! Both allocate a b-tree and record it in the catalog table
//! (`sqlite_master`, root page 1) as a five-column row
//! `(type, name, tbl_name, rootpage, sql)`:
//!
//! ```text
//! Init; CreateBtree -> r[root]; OpenWrite catalog
//! NewRowid; String8 type, name, tbl_name; SCopy r[root]; String8 sql
//! MakeRecord 5; Insert; Close
//! [index: OpenRead table; OpenWrite index (root in register)
//!  Rewind -> done; loop: key columns + Rowid; MakeRecord; IdxInsert
//!  Next -> loop; done: Close both]
//! Halt
//! ```

use serde::{Deserialize, Serialize};
use tessera_ast::{CreateIndexStatement, CreateTableStatement, Statement};
use tessera_error::{Result, TesseraError};
use tessera_types::opcode::{Opcode, P4, p5};
use tessera_types::{SqliteValue, encode_record};

use super::schema::{IndexSchema, SchemaLookup};
use super::{
    CodegenContext, KeySource, emit_halt, emit_index_key, emit_init, finish_program, lookup_table,
    rejected,
};
use crate::{ProgramBuilder, VdbeProgram};

/// Name of the catalog table.
pub const CATALOG_TABLE: &str = "sqlite_master";
/// Root page of the catalog table.
pub const CATALOG_ROOT_PAGE: i32 = 1;
/// Affinity of the catalog columns: text, text, text, integer, text.
const CATALOG_AFFINITY: &str = "BBBDB";

/// The `type` column of a catalog row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CatalogKind {
    Table,
    Index,
}

impl CatalogKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Index => "index",
        }
    }

    /// `P3` of `CreateBtree`.
    const fn btree_flag(self) -> i32 {
        match self {
            Self::Table => 1,
            Self::Index => 2,
        }
    }
}

/// The parts of a catalog row known before the b-tree exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub kind: CatalogKind,
    pub name: String,
    pub tbl_name: String,
    /// Canonical CREATE text, without IF NOT EXISTS.
    pub sql: String,
}

impl CatalogRow {
    /// The full row once the root page is known.
    pub fn values(&self, root_page: i64) -> Vec<SqliteValue> {
        vec![
            SqliteValue::Text(self.kind.as_str().to_owned()),
            SqliteValue::Text(self.name.clone()),
            SqliteValue::Text(self.tbl_name.clone()),
            SqliteValue::Integer(root_page),
            SqliteValue::Text(self.sql.clone()),
        ]
    }
}

/// Catalog row for a CREATE statement.
pub fn catalog_row(stmt: &Statement) -> Result<CatalogRow> {
    match stmt {
        Statement::CreateTable(create) => Ok(table_row(create)),
        Statement::CreateIndex(create) => Ok(index_row(create)),
        other => Err(TesseraError::Unsupported {
            construct: format!("catalog row for {}", other.kind()),
        }),
    }
}

/// Serialize a catalog row as a record.
pub fn encode_catalog_row(row: &CatalogRow, root_page: i64) -> Result<Vec<u8>> {
    encode_record(&row.values(root_page))
}

fn table_row(create: &CreateTableStatement) -> CatalogRow {
    let canonical = CreateTableStatement {
        if_not_exists: false,
        ..create.clone()
    };
    CatalogRow {
        kind: CatalogKind::Table,
        name: create.name.clone(),
        tbl_name: create.name.clone(),
        sql: canonical.to_string(),
    }
}

fn index_row(create: &CreateIndexStatement) -> CatalogRow {
    let canonical = CreateIndexStatement {
        if_not_exists: false,
        ..create.clone()
    };
    CatalogRow {
        kind: CatalogKind::Index,
        name: create.name.clone(),
        tbl_name: create.table.clone(),
        sql: canonical.to_string(),
    }
}

/// Compile CREATE TABLE.
pub fn codegen_create_table<S: SchemaLookup + ?Sized>(
    stmt: &CreateTableStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<VdbeProgram> {
    let _span = tracing::debug_span!("codegen.create_table", table = %stmt.name).entered();
    let mut b = ctx.builder();
    emit_create_table(&mut b, stmt, schema).map_err(|e| rejected("create_table", e))?;
    finish_program(b, "create_table")
}

fn emit_create_table<S: SchemaLookup + ?Sized>(
    b: &mut ProgramBuilder,
    stmt: &CreateTableStatement,
    schema: &S,
) -> Result<()> {
    if stmt.name.is_empty() {
        return Err(TesseraError::EmptyTableName);
    }
    if schema.index(&stmt.name).is_some() {
        return Err(TesseraError::IndexExists {
            name: stmt.name.clone(),
        });
    }
    if schema.table(&stmt.name).is_some() {
        if stmt.if_not_exists {
            tracing::debug!(table = %stmt.name, "codegen.create_table.exists");
            emit_init(b);
            emit_halt(b);
            return Ok(());
        }
        return Err(TesseraError::TableExists {
            name: stmt.name.clone(),
        });
    }
    if stmt.columns.is_empty() {
        return Err(TesseraError::Unsupported {
            construct: format!("table {} with no columns", stmt.name),
        });
    }

    emit_init(b);
    let catalog = b.alloc_cursor();
    emit_catalog_insert(b, catalog, &table_row(stmt))?;
    b.emit_op(Opcode::Close, catalog, 0, 0, P4::None, 0);
    emit_halt(b);
    Ok(())
}

/// Compile CREATE INDEX, including the pass that fills the new index from
/// the table's existing rows.
///
/// UNIQUE is recorded in the catalog text but not enforced while filling.
pub fn codegen_create_index<S: SchemaLookup + ?Sized>(
    stmt: &CreateIndexStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<VdbeProgram> {
    let _span = tracing::debug_span!(
        "codegen.create_index",
        index = %stmt.name,
        table = %stmt.table
    )
    .entered();
    let mut b = ctx.builder();
    emit_create_index(&mut b, stmt, schema).map_err(|e| rejected("create_index", e))?;
    finish_program(b, "create_index")
}

fn emit_create_index<S: SchemaLookup + ?Sized>(
    b: &mut ProgramBuilder,
    stmt: &CreateIndexStatement,
    schema: &S,
) -> Result<()> {
    if schema.table(&stmt.name).is_some() {
        return Err(TesseraError::TableExists {
            name: stmt.name.clone(),
        });
    }
    if schema.index(&stmt.name).is_some() {
        if stmt.if_not_exists {
            tracing::debug!(index = %stmt.name, "codegen.create_index.exists");
            emit_init(b);
            emit_halt(b);
            return Ok(());
        }
        return Err(TesseraError::IndexExists {
            name: stmt.name.clone(),
        });
    }
    let table = lookup_table(schema, &stmt.table)?;
    if stmt.columns.is_empty() {
        return Err(TesseraError::Unsupported {
            construct: format!("index {} with no columns", stmt.name),
        });
    }
    if let Some(missing) = stmt.columns.iter().find(|c| table.column_index(c).is_none()) {
        return Err(TesseraError::NoSuchColumn {
            name: format!("{}.{missing}", table.name),
        });
    }

    emit_init(b);
    let catalog = b.alloc_cursor();
    let root = emit_catalog_insert(b, catalog, &index_row(stmt))?;
    b.emit_op(Opcode::Close, catalog, 0, 0, P4::None, 0);

    let table_cursor = b.alloc_cursor();
    let index_cursor = b.alloc_cursor();
    b.emit_op(
        Opcode::OpenRead,
        table_cursor,
        table.root_page,
        0,
        P4::Table(table.name.clone()),
        0,
    );
    b.emit_op(
        Opcode::OpenWrite,
        index_cursor,
        root,
        0,
        P4::Index(stmt.name.clone()),
        p5::P2ISREG,
    );
    let index = IndexSchema {
        name: stmt.name.clone(),
        root_page: 0,
        columns: stmt.columns.clone(),
        unique: stmt.unique,
    };
    let done = b.emit_label();
    b.emit_jump_to_label(Opcode::Rewind, table_cursor, 0, done, P4::None, 0);
    let top = b.label_here();
    let key = emit_index_key(b, table, &index, KeySource::Cursor(table_cursor))?;
    b.emit_op(
        Opcode::IdxInsert,
        index_cursor,
        key,
        0,
        P4::Index(stmt.name.clone()),
        0,
    );
    b.emit_jump_to_label(Opcode::Next, table_cursor, 0, top, P4::None, 0);
    b.resolve_label(done);
    b.emit_op(Opcode::Close, table_cursor, 0, 0, P4::None, 0);
    b.emit_op(Opcode::Close, index_cursor, 0, 0, P4::None, 0);
    emit_halt(b);
    Ok(())
}

/// Allocate the b-tree and append its catalog row through `catalog`.
/// Returns the register holding the new root page.
fn emit_catalog_insert(b: &mut ProgramBuilder, catalog: i32, row: &CatalogRow) -> Result<i32> {
    let root = b.alloc_reg();
    b.emit_op(
        Opcode::CreateBtree,
        0,
        root,
        row.kind.btree_flag(),
        P4::None,
        0,
    );
    b.emit_op(
        Opcode::OpenWrite,
        catalog,
        CATALOG_ROOT_PAGE,
        0,
        P4::Table(CATALOG_TABLE.to_owned()),
        0,
    );
    let rowid = b.alloc_reg();
    let base = b.alloc_regs(5);
    let record = b.alloc_reg();
    b.emit_op(Opcode::NewRowid, catalog, rowid, 0, P4::None, 0);
    let text = [row.kind.as_str(), &row.name, &row.tbl_name];
    for (i, value) in (0_i32..).zip(text) {
        b.emit_op(
            Opcode::String8,
            0,
            base + i,
            0,
            P4::Str(value.to_owned()),
            0,
        );
    }
    b.emit_op(Opcode::SCopy, root, base + 3, 0, P4::None, 0);
    b.emit_op(Opcode::String8, 0, base + 4, 0, P4::Str(row.sql.clone()), 0);
    b.emit_op(
        Opcode::MakeRecord,
        base,
        5,
        record,
        P4::Affinity(CATALOG_AFFINITY.to_owned()),
        0,
    );
    b.emit_op(
        Opcode::Insert,
        catalog,
        record,
        rowid,
        P4::Table(CATALOG_TABLE.to_owned()),
        0,
    );
    Ok(root)
}
