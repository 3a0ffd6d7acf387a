//! An in-memory database that compiles statements and runs them.

use std::collections::HashMap;

use tessera_ast::Statement;
use tessera_error::TesseraError;
use tessera_types::{SqliteValue, decode_record};
use tessera_vdbe::VdbeProgram;
use tessera_vdbe::codegen::ddl::{CATALOG_ROOT_PAGE, CATALOG_TABLE};
use tessera_vdbe::codegen::{
    CodegenContext, IndexSchema, SchemaLookup, TableSchema, codegen_select, compile_statement,
};

use crate::engine::{Engine, ExecStats, Execution};
use crate::storage::Tree;
use crate::{EngineError, Result};

/// `child.column` holds rowids of `parent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub parent: String,
    pub child: String,
    pub column: String,
}

/// Rows produced by one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Result column names; empty for statements that return no rows.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqliteValue>>,
    pub stats: ExecStats,
}

/// B-trees by root page plus the schema the code generator compiles
/// against.
#[derive(Debug)]
pub struct MemDatabase {
    pub(crate) trees: HashMap<i32, Tree>,
    next_root: i32,
    schema: Vec<TableSchema>,
    pub(crate) foreign_keys: Vec<ForeignKey>,
    ctx: CodegenContext,
    step_limit: u64,
}

impl Default for MemDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDatabase {
    /// An empty database holding only the catalog table.
    pub fn new() -> Self {
        Self::with_context(CodegenContext::default())
    }

    pub fn with_context(ctx: CodegenContext) -> Self {
        let mut trees = HashMap::new();
        trees.insert(CATALOG_ROOT_PAGE, Tree::table());
        Self {
            trees,
            next_root: CATALOG_ROOT_PAGE + 1,
            schema: Vec::new(),
            foreign_keys: Vec::new(),
            ctx,
            step_limit: 1_000_000,
        }
    }

    pub fn context(&self) -> &CodegenContext {
        &self.ctx
    }

    pub fn set_context(&mut self, ctx: CodegenContext) {
        self.ctx = ctx;
    }

    /// Maximum instructions one program may execute.
    pub fn set_step_limit(&mut self, limit: u64) {
        self.step_limit = limit;
    }

    pub(crate) fn step_limit(&self) -> u64 {
        self.step_limit
    }

    pub fn schema(&self) -> &[TableSchema] {
        &self.schema
    }

    /// Register a foreign key checked by `FkCheck` when `parent` rows are
    /// deleted.
    pub fn add_foreign_key(&mut self, parent: &str, child: &str, column: &str) {
        self.foreign_keys.push(ForeignKey {
            parent: parent.to_owned(),
            child: child.to_owned(),
            column: column.to_owned(),
        });
    }

    /// Allocate an empty b-tree and return its root page.
    pub(crate) fn create_tree(&mut self, tree: Tree) -> i32 {
        let root = self.next_root;
        self.next_root += 1;
        self.trees.insert(root, tree);
        root
    }

    /// Compile `stmt` against the current schema, run it, and fold any
    /// catalog changes back into the schema.
    pub fn execute(&mut self, stmt: &Statement) -> Result<QueryResult> {
        let _span = tracing::debug_span!("harness.execute", kind = stmt.kind()).entered();
        let (program, columns) = match stmt {
            Statement::Select(select) => {
                let compiled = codegen_select(select, &self.schema, &self.ctx)?;
                (compiled.program, compiled.column_names)
            }
            other => (
                compile_statement(Some(other), &self.schema, &self.ctx)?,
                Vec::new(),
            ),
        };
        let execution = self.run(&program)?;
        if matches!(stmt, Statement::CreateTable(_) | Statement::CreateIndex(_)) {
            self.reload_schema(stmt)?;
        }
        Ok(QueryResult {
            columns,
            rows: execution.rows,
            stats: execution.stats,
        })
    }

    /// Run an already compiled program.
    pub fn run(&mut self, program: &VdbeProgram) -> Result<Execution> {
        Engine::new(self, program).run()
    }

    /// Decoded catalog rows `(type, name, tbl_name, rootpage, sql)` in
    /// insertion order.
    pub fn catalog(&self) -> Result<Vec<Vec<SqliteValue>>> {
        Ok(self
            .table_rows_at(CATALOG_ROOT_PAGE)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    /// Decoded rows of a table, by rowid.
    pub fn table_rows(&self, name: &str) -> Result<Vec<(i64, Vec<SqliteValue>)>> {
        let root = if name.eq_ignore_ascii_case(CATALOG_TABLE) {
            CATALOG_ROOT_PAGE
        } else {
            self.lookup(name)?.root_page
        };
        self.table_rows_at(root)
    }

    fn table_rows_at(&self, root: i32) -> Result<Vec<(i64, Vec<SqliteValue>)>> {
        match self.trees.get(&root) {
            Some(Tree::Table(rows)) => rows
                .iter()
                .map(|(rowid, record)| Ok((*rowid, decode_record(record)?)))
                .collect(),
            _ => Err(EngineError::NoSuchRoot { root }),
        }
    }

    /// Entries of an index, in key order.
    pub fn index_entries(&self, name: &str) -> Result<Vec<Vec<SqliteValue>>> {
        let (_, index) = self
            .schema
            .index(name)
            .ok_or_else(|| TesseraError::NoSuchIndex {
                name: name.to_owned(),
            })?;
        match self.trees.get(&index.root_page) {
            Some(Tree::Index(keys)) => Ok(keys.iter().map(|k| k.0.clone()).collect()),
            _ => Err(EngineError::NoSuchRoot {
                root: index.root_page,
            }),
        }
    }

    fn lookup(&self, name: &str) -> Result<&TableSchema> {
        Ok(self
            .schema
            .table(name)
            .ok_or_else(|| TesseraError::NoSuchTable {
                name: name.to_owned(),
            })?)
    }

    /// Schema for `name` plus the column holding `column`, for `FkCheck`.
    pub(crate) fn column_of(&self, table: &str, column: &str) -> Result<(i32, usize, bool)> {
        let schema = self.lookup(table)?;
        let idx = schema
            .column_index(column)
            .ok_or_else(|| TesseraError::NoSuchColumn {
                name: format!("{table}.{column}"),
            })?;
        Ok((schema.root_page, idx, schema.columns[idx].is_ipk))
    }

    /// Pick up the object a CREATE statement just recorded in the catalog.
    fn reload_schema(&mut self, stmt: &Statement) -> Result<()> {
        let name = match stmt {
            Statement::CreateTable(create) => &create.name,
            Statement::CreateIndex(create) => &create.name,
            _ => return Ok(()),
        };
        let known = self.schema.table(name).is_some() || self.schema.index(name).is_some();
        if known {
            return Ok(());
        }
        let root = self
            .catalog()?
            .into_iter()
            .find(|row| row.get(1).and_then(SqliteValue::as_text) == Some(name.as_str()))
            .and_then(|row| row.get(3).and_then(SqliteValue::as_integer))
            .and_then(|root| i32::try_from(root).ok())
            .ok_or_else(|| TesseraError::internal(format!("no catalog row for {name}")))?;

        match stmt {
            Statement::CreateTable(create) => {
                self.schema.push(TableSchema::from_create(create, root));
            }
            Statement::CreateIndex(create) => {
                let table = self
                    .schema
                    .iter_mut()
                    .find(|t| t.name.eq_ignore_ascii_case(&create.table))
                    .ok_or_else(|| TesseraError::NoSuchTable {
                        name: create.table.clone(),
                    })?;
                table.indexes.push(IndexSchema {
                    name: create.name.clone(),
                    root_page: root,
                    columns: create.columns.clone(),
                    unique: create.unique,
                });
            }
            _ => {}
        }
        tracing::debug!(name = %name, root, "harness.schema.loaded");
        Ok(())
    }
}
