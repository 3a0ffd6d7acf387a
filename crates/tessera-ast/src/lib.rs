//! Statement descriptors consumed by the tessera code generators.
//!
//! These are the parser's output: fully parsed, not yet resolved. Column
//! references arrive as [`Expr::Column`] names; the code generator rewrites
//! them into cursor-relative [`Expr::ColumnRef`] / [`Expr::Rowid`] nodes on a
//! fresh tree and never mutates the statement it was handed.
//!
//! Every node implements `Display`, which reconstructs SQL text. The catalog
//! writer stores that text in `sqlite_master.sql`, and the SELECT compiler
//! uses it for unnamed result columns.

mod display;

use serde::{Deserialize, Serialize};
use tessera_types::TypeAffinity;

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// A possibly table-qualified column name, as written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnName {
    /// Table name or alias qualifier (`t` in `t.a`).
    pub table: Option<String>,
    /// The column name.
    pub column: String,
}

/// Binary operators with a direct opcode mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Subtract,
    Multiply,
    Divide,
    And,
    Or,
}

impl BinaryOp {
    /// The SQL spelling of the operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// Aggregate functions understood by the GROUP BY machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    GroupConcat,
}

impl AggregateFunc {
    /// Lower-case SQL function name, also used as the `AggStep` payload.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::GroupConcat => "group_concat",
        }
    }

    /// Case-insensitive lookup by SQL function name.
    pub fn from_name(name: &str) -> Option<Self> {
        let func = match name.to_ascii_lowercase().as_str() {
            "count" => Self::Count,
            "sum" => Self::Sum,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "group_concat" => Self::GroupConcat,
            _ => return None,
        };
        Some(func)
    }
}

/// An SQL expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A column reference by name, not yet resolved.
    Column(ColumnName),
    /// A resolved column: field `column` of the row under `cursor`.
    ColumnRef { cursor: i32, column: usize },
    /// The rowid of the row under `cursor`.
    Rowid { cursor: i32 },
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
    /// `left op right`.
    Binary {
        op: BinaryOp,
        left: Box<Self>,
        right: Box<Self>,
    },
    /// An aggregate call. `count(*)` has no arguments.
    Aggregate { func: AggregateFunc, args: Vec<Self> },
}

impl Expr {
    /// Unqualified column reference.
    pub fn column(name: &str) -> Self {
        Self::Column(ColumnName {
            table: None,
            column: name.to_owned(),
        })
    }

    /// `table.column` reference.
    pub fn qualified(table: &str, column: &str) -> Self {
        Self::Column(ColumnName {
            table: Some(table.to_owned()),
            column: column.to_owned(),
        })
    }

    pub fn text(value: &str) -> Self {
        Self::Text(value.to_owned())
    }

    pub fn binary(op: BinaryOp, left: Self, right: Self) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn aggregate(func: AggregateFunc, args: Vec<Self>) -> Self {
        Self::Aggregate { func, args }
    }

    /// `count(*)`.
    pub fn count_star() -> Self {
        Self::Aggregate {
            func: AggregateFunc::Count,
            args: Vec::new(),
        }
    }

    /// Whether an aggregate call appears anywhere in this expression.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            _ => false,
        }
    }

    /// Split a tree of `AND`s into its top-level conjuncts, left to right.
    pub fn conjuncts(&self) -> Vec<&Self> {
        let mut out = Vec::new();
        collect_conjuncts(self, &mut out);
        out
    }
}

fn collect_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    if let Expr::Binary {
        op: BinaryOp::And,
        left,
        right,
    } = expr
    {
        collect_conjuncts(left, out);
        collect_conjuncts(right, out);
    } else {
        out.push(expr);
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

// ---------------------------------------------------------------------------
// SELECT
// ---------------------------------------------------------------------------

/// A projection entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultColumn {
    /// `*`: all columns from all tables.
    Star,
    /// `table.*`: all columns from one table.
    TableStar(String),
    /// `expr [AS alias]`.
    Expr { expr: Expr, alias: Option<String> },
}

impl ResultColumn {
    /// Projection of a bare expression with no alias.
    pub fn expr(expr: Expr) -> Self {
        Self::Expr { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: &str) -> Self {
        Self::Expr {
            expr,
            alias: Some(alias.to_owned()),
        }
    }
}

/// A FROM-list entry. There is no join algebra; each entry is scanned
/// independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            alias: None,
        }
    }

    pub fn aliased(name: &str, alias: &str) -> Self {
        Self {
            name: name.to_owned(),
            alias: Some(alias.to_owned()),
        }
    }

    /// The name this table is referred to by inside the statement.
    pub fn visible_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// An ORDER BY term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderingTerm {
    pub expr: Expr,
    pub direction: SortDirection,
}

impl OrderingTerm {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: SortDirection::Desc,
        }
    }
}

/// `LIMIT expr [OFFSET expr]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitClause {
    pub limit: Expr,
    pub offset: Option<Expr>,
}

/// Compound operators joining SELECT cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompoundOp {
    Union,
    UnionAll,
    Intersect,
    Except,
}

impl CompoundOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Union => "UNION",
            Self::UnionAll => "UNION ALL",
            Self::Intersect => "INTERSECT",
            Self::Except => "EXCEPT",
        }
    }
}

/// One `SELECT ... FROM ... WHERE ... GROUP BY ... HAVING ...` arm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectCore {
    pub distinct: bool,
    pub columns: Vec<ResultColumn>,
    pub from: Vec<TableRef>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
}

/// A full SELECT: the first core, any compound arms, and the trailing
/// ORDER BY / LIMIT that apply to the whole result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectStatement {
    pub core: SelectCore,
    pub compounds: Vec<(CompoundOp, SelectCore)>,
    pub order_by: Vec<OrderingTerm>,
    pub limit: Option<LimitClause>,
}

impl SelectStatement {
    pub fn from_core(core: SelectCore) -> Self {
        Self {
            core,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// DML
// ---------------------------------------------------------------------------

/// `INSERT INTO table [(columns)] VALUES (...), (...)`.
///
/// An empty `columns` list means every table column in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

/// `UPDATE table SET columns[i] = values[i], ... [WHERE ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Expr>,
    pub where_clause: Option<Expr>,
}

/// `DELETE FROM table [WHERE ...] [LIMIT n]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub table: String,
    pub where_clause: Option<Expr>,
    /// A negative limit means no limit.
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// DDL
// ---------------------------------------------------------------------------

/// A column definition in CREATE TABLE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Declared type; empty when none was given.
    pub type_name: String,
    pub primary_key: bool,
    pub not_null: bool,
}

impl ColumnDef {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_owned(),
            type_name: type_name.to_owned(),
            primary_key: false,
            not_null: false,
        }
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Affinity implied by the declared type.
    pub fn affinity(&self) -> TypeAffinity {
        TypeAffinity::from_type_name(&self.type_name)
    }

    /// Whether this column aliases the rowid (`INTEGER PRIMARY KEY`).
    pub fn is_integer_primary_key(&self) -> bool {
        self.primary_key && self.type_name.eq_ignore_ascii_case("INTEGER")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTableStatement {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIndexStatement {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub if_not_exists: bool,
}

// ---------------------------------------------------------------------------
// Statement
// ---------------------------------------------------------------------------

/// Any statement the code generator accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    CreateTable(CreateTableStatement),
    CreateIndex(CreateIndexStatement),
}

impl Statement {
    /// Short lower-case statement kind, used in log spans.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Select(_) => "select",
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
            Self::CreateTable(_) => "create_table",
            Self::CreateIndex(_) => "create_index",
        }
    }
}
