//! Table and index metadata the code generator reads from the schema catalog.

use serde::{Deserialize, Serialize};
use tessera_ast::CreateTableStatement;
use tessera_types::{SqliteValue, TypeAffinity};

/// Column metadata needed by the code generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Type name as written in CREATE TABLE; empty when none was given.
    pub type_name: String,
    /// Affinity derived from `type_name`.
    pub affinity: TypeAffinity,
    /// True if this column is the INTEGER PRIMARY KEY (rowid alias).
    /// Reads of an IPK column emit `Rowid`, since the value is the b-tree
    /// key rather than a record field.
    pub is_ipk: bool,
    /// True if the column has a NOT NULL constraint.
    pub notnull: bool,
    /// Value used when an INSERT does not list this column.
    pub default_value: Option<SqliteValue>,
}

impl ColumnInfo {
    /// Column whose affinity is derived from its declared type.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            affinity: TypeAffinity::from_type_name(&type_name),
            type_name,
            is_ipk: false,
            notnull: false,
            default_value: None,
        }
    }

    /// Create a basic `ColumnInfo` without type/notnull/default metadata.
    pub fn basic(name: impl Into<String>, affinity: TypeAffinity, is_ipk: bool) -> Self {
        Self {
            name: name.into(),
            type_name: String::new(),
            affinity,
            is_ipk,
            notnull: false,
            default_value: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: SqliteValue) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    /// Index name.
    pub name: String,
    /// Root page number.
    pub root_page: i32,
    /// Indexed column names (leftmost first).
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Table schema as seen by the code generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Root page of the table's b-tree.
    pub root_page: i32,
    /// Column definitions in storage order.
    pub columns: Vec<ColumnInfo>,
    /// Primary-key column names, in key order.
    pub primary_key: Vec<String>,
    /// Indexes on this table.
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, root_page: i32, columns: Vec<ColumnInfo>) -> Self {
        let primary_key = columns
            .iter()
            .filter(|c| c.is_ipk)
            .map(|c| c.name.clone())
            .collect();
        Self {
            name: name.into(),
            root_page,
            columns,
            primary_key,
            indexes: Vec::new(),
        }
    }

    /// Schema for a table created by `stmt` at `root_page`.
    pub fn from_create(stmt: &CreateTableStatement, root_page: i32) -> Self {
        let columns: Vec<ColumnInfo> = stmt
            .columns
            .iter()
            .map(|def| ColumnInfo {
                is_ipk: def.is_integer_primary_key(),
                notnull: def.not_null,
                ..ColumnInfo::new(def.name.clone(), def.type_name.clone())
            })
            .collect();
        let mut table = Self::new(stmt.name.clone(), root_page, columns);
        table.primary_key = stmt
            .columns
            .iter()
            .filter(|def| def.primary_key)
            .map(|def| def.name.clone())
            .collect();
        table
    }

    #[must_use]
    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Build an affinity string for `MakeRecord` (one char per column).
    pub fn affinity_string(&self) -> String {
        self.columns.iter().map(|c| c.affinity.as_char()).collect()
    }

    /// Find a column's 0-based index by name (case-insensitive).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Position of the INTEGER PRIMARY KEY column, if any.
    pub fn ipk_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.is_ipk)
    }

    /// Find an index on this table by name (case-insensitive).
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes
            .iter()
            .find(|idx| idx.name.eq_ignore_ascii_case(name))
    }
}

/// Read access to the schema catalog.
///
/// Implementations are borrowed immutably for the duration of one
/// compilation and may be shared across compiling threads.
pub trait SchemaLookup: Sync {
    /// Table by name (case-insensitive).
    fn table(&self, name: &str) -> Option<&TableSchema>;

    /// Index by name, with the table it belongs to.
    fn index(&self, name: &str) -> Option<(&TableSchema, &IndexSchema)>;
}

impl SchemaLookup for [TableSchema] {
    fn table(&self, name: &str) -> Option<&TableSchema> {
        self.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    fn index(&self, name: &str) -> Option<(&TableSchema, &IndexSchema)> {
        self.iter()
            .find_map(|t| t.index(name).map(|idx| (t, idx)))
    }
}

impl SchemaLookup for Vec<TableSchema> {
    fn table(&self, name: &str) -> Option<&TableSchema> {
        self.as_slice().table(name)
    }

    fn index(&self, name: &str) -> Option<(&TableSchema, &IndexSchema)> {
        self.as_slice().index(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ast::ColumnDef;

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            2,
            vec![
                ColumnInfo {
                    is_ipk: true,
                    ..ColumnInfo::new("id", "INTEGER")
                },
                ColumnInfo::new("Name", "TEXT"),
                ColumnInfo::new("score", "REAL"),
            ],
        )
        .with_index(IndexSchema {
            name: "idx_users_name".to_owned(),
            root_page: 3,
            columns: vec!["name".to_owned()],
            unique: false,
        })
    }

    #[test]
    fn test_affinity_string_follows_column_order() {
        assert_eq!(users().affinity_string(), "DBE");
    }

    #[test]
    fn test_column_lookup_is_case_insensitive() {
        let t = users();
        assert_eq!(t.column_index("NAME"), Some(1));
        assert_eq!(t.column_index("missing"), None);
        assert_eq!(t.ipk_index(), Some(0));
        assert_eq!(t.primary_key, vec!["id".to_owned()]);
    }

    #[test]
    fn test_slice_and_vec_lookup() {
        let schema = vec![users()];
        assert!(schema.table("USERS").is_some());
        assert!(schema.as_slice().table("orders").is_none());
        let (table, index) = schema.index("IDX_USERS_NAME").unwrap();
        assert_eq!(table.name, "users");
        assert_eq!(index.root_page, 3);
    }

    #[test]
    fn test_from_create_marks_rowid_alias() {
        let stmt = CreateTableStatement {
            name: "t".to_owned(),
            columns: vec![
                ColumnDef::new("id", "INTEGER").primary_key(),
                ColumnDef::new("v", "TEXT"),
            ],
            if_not_exists: false,
        };
        let t = TableSchema::from_create(&stmt, 5);
        assert_eq!(t.root_page, 5);
        assert!(t.columns[0].is_ipk);
        assert_eq!(t.columns[1].affinity, TypeAffinity::Text);
        assert_eq!(t.primary_key, vec!["id".to_owned()]);
    }
}
