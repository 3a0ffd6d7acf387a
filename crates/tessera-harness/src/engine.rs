//! The fetch-execute loop.
//!
//! Registers are a `Vec<SqliteValue>` indexed by register number. Two kinds
//! of register content do not fit in a value: aggregate accumulators and
//! rowsets. Both live in side tables keyed by register and are dropped
//! whenever the register is overwritten, so `Null r` or `Integer 0, r`
//! resets them.

use std::collections::{BTreeSet, HashMap};

use tessera_types::opcode::{Opcode, P4, VdbeOp, p5};
use tessera_types::{SqliteValue, TypeAffinity, decode_record, encode_record};
use tessera_vdbe::VdbeProgram;

use crate::database::MemDatabase;
use crate::storage::{IndexKey, Position, Tree, compare_rows, compare_values};
use crate::{EngineError, Result};

/// Per-opcode execution counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    executed: HashMap<Opcode, u64>,
    /// Instructions executed in total.
    pub steps: u64,
}

impl ExecStats {
    /// How many times `opcode` was executed.
    pub fn count(&self, opcode: Opcode) -> u64 {
        self.executed.get(&opcode).copied().unwrap_or(0)
    }

    fn record(&mut self, opcode: Opcode) {
        *self.executed.entry(opcode).or_default() += 1;
        self.steps += 1;
    }
}

/// What a program produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub rows: Vec<Vec<SqliteValue>>,
    pub stats: ExecStats,
}

#[derive(Debug)]
struct Sorter {
    nkeys: usize,
    /// One flag per key: true for descending.
    descending: Vec<bool>,
    rows: Vec<(Vec<SqliteValue>, Vec<u8>)>,
    pos: Option<usize>,
}

impl Sorter {
    fn sort(&mut self) {
        let (nkeys, descending) = (self.nkeys, &self.descending);
        self.rows.sort_by(|(a, _), (b, _)| {
            (0..nkeys)
                .map(|i| {
                    let ord = match (a.get(i), b.get(i)) {
                        (Some(x), Some(y)) => compare_values(x, y),
                        (x, y) => x.is_some().cmp(&y.is_some()),
                    };
                    if descending.get(i).copied().unwrap_or(false) {
                        ord.reverse()
                    } else {
                        ord
                    }
                })
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

#[derive(Debug)]
enum Source {
    /// A b-tree owned by the database.
    Root(i32),
    /// A b-tree owned by the cursor and dropped with it.
    Ephemeral(Tree),
    Sorter(Sorter),
}

#[derive(Debug)]
struct Cursor {
    source: Source,
    position: Option<Position>,
}

#[derive(Debug, Clone)]
enum AggState {
    Count(i64),
    Sum {
        int: Option<i64>,
        float: f64,
        any: bool,
        overflowed: bool,
    },
    Avg {
        total: f64,
        n: u64,
    },
    Min(Option<SqliteValue>),
    Max(Option<SqliteValue>),
    GroupConcat(Option<String>),
}

impl AggState {
    fn new(name: &str) -> Option<Self> {
        Some(match name {
            "count" => Self::Count(0),
            "sum" => Self::Sum {
                int: Some(0),
                float: 0.0,
                any: false,
                overflowed: false,
            },
            "avg" => Self::Avg { total: 0.0, n: 0 },
            "min" => Self::Min(None),
            "max" => Self::Max(None),
            "group_concat" => Self::GroupConcat(None),
            _ => return None,
        })
    }

    fn step(&mut self, args: &[SqliteValue]) {
        let first = args.first();
        let want = if matches!(self, Self::Min(_)) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        };
        match self {
            Self::Count(n) => {
                if first.is_none_or(|v| !v.is_null()) {
                    *n += 1;
                }
            }
            Self::Sum {
                int,
                float,
                any,
                overflowed,
            } => {
                let Some(v) = first.filter(|v| !v.is_null()) else {
                    return;
                };
                *any = true;
                *float += v.to_float();
                match (v, *int) {
                    (SqliteValue::Integer(i), Some(acc)) => match acc.checked_add(*i) {
                        Some(sum) => *int = Some(sum),
                        None => {
                            *overflowed = true;
                            *int = None;
                        }
                    },
                    _ => *int = None,
                }
            }
            Self::Avg { total, n } => {
                if let Some(v) = first.filter(|v| !v.is_null()) {
                    *total += v.to_float();
                    *n += 1;
                }
            }
            Self::Min(best) | Self::Max(best) => {
                let Some(v) = first.filter(|v| !v.is_null()) else {
                    return;
                };
                let replace = match &*best {
                    None => true,
                    Some(current) => compare_values(v, current) == want,
                };
                if replace {
                    *best = Some(v.clone());
                }
            }
            Self::GroupConcat(acc) => {
                let Some(v) = first.filter(|v| !v.is_null()) else {
                    return;
                };
                let separator = args.get(1).map_or_else(|| ",".to_owned(), SqliteValue::to_text);
                match acc {
                    Some(s) => {
                        s.push_str(&separator);
                        s.push_str(&v.to_text());
                    }
                    None => *acc = Some(v.to_text()),
                }
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(self) -> SqliteValue {
        match self {
            Self::Count(n) => SqliteValue::Integer(n),
            Self::Sum {
                int,
                float,
                any,
                overflowed,
            } => match (any, int) {
                (false, _) => SqliteValue::Null,
                (true, Some(i)) if !overflowed => SqliteValue::Integer(i),
                _ => SqliteValue::Float(float),
            },
            Self::Avg { total, n } => {
                if n == 0 {
                    SqliteValue::Null
                } else {
                    SqliteValue::Float(total / n as f64)
                }
            }
            Self::Min(v) | Self::Max(v) => v.unwrap_or(SqliteValue::Null),
            Self::GroupConcat(s) => s.map_or(SqliteValue::Null, SqliteValue::Text),
        }
    }
}

/// Runs one program against a database.
#[derive(Debug)]
pub struct Engine<'a> {
    db: &'a mut MemDatabase,
    ops: &'a [VdbeOp],
    registers: Vec<SqliteValue>,
    cursors: HashMap<i32, Cursor>,
    aggregates: HashMap<i32, AggState>,
    rowsets: HashMap<i32, BTreeSet<i64>>,
    rows: Vec<Vec<SqliteValue>>,
    stats: ExecStats,
}

fn register_index(r: i32) -> usize {
    usize::try_from(r).unwrap_or(0)
}

impl<'a> Engine<'a> {
    pub fn new(db: &'a mut MemDatabase, program: &'a VdbeProgram) -> Self {
        let count = register_index(program.register_count()) + 1;
        Self {
            db,
            ops: program.ops(),
            registers: vec![SqliteValue::Null; count],
            cursors: HashMap::new(),
            aggregates: HashMap::new(),
            rowsets: HashMap::new(),
            rows: Vec::new(),
            stats: ExecStats::default(),
        }
    }

    /// Execute until `Halt` or the end of the program.
    #[allow(clippy::too_many_lines)]
    pub fn run(mut self) -> Result<Execution> {
        let limit = self.db.step_limit();
        let ops = self.ops;
        let mut pc = 0_usize;
        while let Some(op) = ops.get(pc) {
            if self.stats.steps >= limit {
                return Err(EngineError::StepLimit { limit });
            }
            self.stats.record(op.opcode);
            let mut next = pc + 1;
            match op.opcode {
                // ── Control flow ────────────────────────────────────────
                Opcode::Init | Opcode::Goto => next = self.target(op.p2)?,
                Opcode::Halt => break,
                Opcode::Noop => {}
                Opcode::Gosub => {
                    self.set_reg(op.p1, SqliteValue::Integer(addr_value(pc + 1)));
                    next = self.target(op.p2)?;
                }
                Opcode::Return => next = self.target_reg(op.p1)?,
                Opcode::InitCoroutine => {
                    self.set_reg(op.p1, SqliteValue::Integer(i64::from(op.p3)));
                    if op.p2 != 0 {
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::Yield => {
                    let resume = self.target_reg(op.p1)?;
                    self.set_reg(op.p1, SqliteValue::Integer(addr_value(pc + 1)));
                    next = resume;
                }
                Opcode::EndCoroutine => {
                    // Leave through the p2 of the Yield that last resumed us.
                    let after_yield = self.target_reg(op.p1)?;
                    let caller = after_yield
                        .checked_sub(1)
                        .and_then(|a| ops.get(a))
                        .filter(|c| c.opcode == Opcode::Yield)
                        .ok_or_else(|| bad_operand(op, pc, "no calling Yield"))?;
                    next = self.target(caller.p2)?;
                }
                Opcode::If | Opcode::IfNot => {
                    let truth = self.reg(op.p1).truthiness();
                    let jump = match truth {
                        None => op.p3 != 0,
                        Some(t) => t == (op.opcode == Opcode::If),
                    };
                    if jump {
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::IfPos => {
                    let v = self.reg(op.p1).to_integer();
                    if v > 0 {
                        self.set_reg(
                            op.p1,
                            SqliteValue::Integer(v.saturating_sub(i64::from(op.p3))),
                        );
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::DecrJumpZero => {
                    let v = self.reg(op.p1).to_integer().saturating_sub(1);
                    self.set_reg(op.p1, SqliteValue::Integer(v));
                    if v == 0 {
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::MustBeInt => {
                    let value = self.reg(op.p1).clone();
                    match value.apply_affinity(TypeAffinity::Integer) {
                        SqliteValue::Null => {}
                        v @ SqliteValue::Integer(_) => self.set_reg(op.p1, v),
                        _ if op.p2 != 0 => next = self.target(op.p2)?,
                        other => {
                            return Err(EngineError::TypeMismatch {
                                actual: other.typeof_str(),
                            });
                        }
                    }
                }
                Opcode::IsNull | Opcode::NotNull => {
                    if self.reg(op.p1).is_null() == (op.opcode == Opcode::IsNull) {
                        next = self.target(op.p2)?;
                    }
                }

                // ── Constants and registers ─────────────────────────────
                Opcode::Integer => self.set_reg(op.p2, SqliteValue::Integer(i64::from(op.p1))),
                Opcode::Int64 | Opcode::Real | Opcode::String8 | Opcode::String | Opcode::Blob => {
                    let value = match &op.p4 {
                        P4::Int64(v) => SqliteValue::Integer(*v),
                        P4::Int(v) => SqliteValue::Integer(i64::from(*v)),
                        P4::Real(v) => SqliteValue::Float(*v),
                        P4::Str(s) => SqliteValue::Text(s.clone()),
                        P4::Blob(b) => SqliteValue::Blob(b.clone()),
                        _ => return Err(bad_operand(op, pc, "constant without payload")),
                    };
                    self.set_reg(op.p2, value);
                }
                Opcode::Null => {
                    for r in op.p2..=op.p3.max(op.p2) {
                        self.set_reg(r, SqliteValue::Null);
                    }
                }
                Opcode::Copy => {
                    for i in 0..=op.p3.max(0) {
                        let v = self.reg(op.p1 + i).clone();
                        self.set_reg(op.p2 + i, v);
                    }
                }
                Opcode::SCopy => {
                    let v = self.reg(op.p1).clone();
                    self.set_reg(op.p2, v);
                }

                // ── Comparison and arithmetic ───────────────────────────
                Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let result = compare(op.opcode, self.reg(op.p3), self.reg(op.p1), op.p5);
                    if op.p5 & p5::STOREP2 != 0 {
                        let stored = result.map_or(SqliteValue::Null, |b| {
                            SqliteValue::Integer(i64::from(b))
                        });
                        self.set_reg(op.p2, stored);
                    } else if result.unwrap_or(op.p5 & p5::JUMPIFNULL != 0) {
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::Add | Opcode::Subtract | Opcode::Multiply | Opcode::Divide => {
                    let (a, b) = (self.reg(op.p2), self.reg(op.p1));
                    let v = match op.opcode {
                        Opcode::Add => a.sql_add(b),
                        Opcode::Subtract => a.sql_sub(b),
                        Opcode::Multiply => a.sql_mul(b),
                        _ => a.sql_div(b),
                    };
                    self.set_reg(op.p3, v);
                }
                Opcode::And | Opcode::Or => {
                    let (a, b) = (
                        self.reg(op.p1).truthiness(),
                        self.reg(op.p2).truthiness(),
                    );
                    let v = if op.opcode == Opcode::And {
                        match (a, b) {
                            (Some(false), _) | (_, Some(false)) => Some(false),
                            (Some(true), Some(true)) => Some(true),
                            _ => None,
                        }
                    } else {
                        match (a, b) {
                            (Some(true), _) | (_, Some(true)) => Some(true),
                            (Some(false), Some(false)) => Some(false),
                            _ => None,
                        }
                    };
                    self.set_reg(
                        op.p3,
                        v.map_or(SqliteValue::Null, |b| SqliteValue::Integer(i64::from(b))),
                    );
                }

                // ── Cursors ─────────────────────────────────────────────
                Opcode::OpenRead | Opcode::OpenWrite => {
                    let root = if op.p5 & p5::P2ISREG != 0 {
                        i32::try_from(self.reg(op.p2).to_integer())
                            .map_err(|_| bad_operand(op, pc, "root page out of range"))?
                    } else {
                        op.p2
                    };
                    if !self.db.trees.contains_key(&root) {
                        return Err(EngineError::NoSuchRoot { root });
                    }
                    self.open(op.p1, Source::Root(root));
                }
                Opcode::OpenEphemeral => {
                    let tree = if matches!(op.p4, P4::SortOrder(_)) {
                        Tree::index()
                    } else {
                        Tree::table()
                    };
                    self.open(op.p1, Source::Ephemeral(tree));
                }
                Opcode::SorterOpen => {
                    let descending = match &op.p4 {
                        P4::SortOrder(order) => order.chars().map(|c| c == '-').collect(),
                        _ => Vec::new(),
                    };
                    let sorter = Sorter {
                        nkeys: usize::try_from(op.p2).unwrap_or(0),
                        descending,
                        rows: Vec::new(),
                        pos: None,
                    };
                    self.open(op.p1, Source::Sorter(sorter));
                }
                Opcode::Close => {
                    self.cursors.remove(&op.p1);
                }
                Opcode::Rewind | Opcode::Last => {
                    let tree = self.tree(op.p1, pc)?;
                    let position = if op.opcode == Opcode::Rewind {
                        tree.first()
                    } else {
                        tree.last()
                    };
                    let empty = position.is_none();
                    self.cursor_mut(op.p1, pc)?.position = position;
                    if empty {
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::Next | Opcode::Prev => {
                    let tree = self.tree(op.p1, pc)?;
                    let position = match &self.cursor(op.p1, pc)?.position {
                        Some(at) if op.opcode == Opcode::Next => tree.after(at),
                        Some(at) => tree.before(at),
                        None => None,
                    };
                    let more = position.is_some();
                    self.cursor_mut(op.p1, pc)?.position = position;
                    if more {
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::NotExists => {
                    let rowid = self.reg(op.p3).to_integer();
                    let exists =
                        matches!(self.tree(op.p1, pc)?, Tree::Table(rows) if rows.contains_key(&rowid));
                    if exists {
                        self.cursor_mut(op.p1, pc)?.position = Some(Position::Rowid(rowid));
                    } else {
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::Found | Opcode::NotFound => {
                    let probe = self.record_values(op, pc, op.p3)?;
                    let found = self.tree(op.p1, pc)?.contains_prefix(&probe);
                    if found == (op.opcode == Opcode::Found) {
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::Column => {
                    let row = self.current_row(op.p1, pc)?;
                    let field = usize::try_from(op.p2).unwrap_or(usize::MAX);
                    let v = row.into_iter().nth(field).unwrap_or(SqliteValue::Null);
                    self.set_reg(op.p3, v);
                }
                Opcode::Rowid => {
                    let rowid = self.current_rowid(op.p1, pc)?;
                    self.set_reg(op.p2, SqliteValue::Integer(rowid));
                }
                Opcode::MakeRecord => {
                    let affinities: Vec<char> = match &op.p4 {
                        P4::Affinity(a) => a.chars().collect(),
                        _ => Vec::new(),
                    };
                    let values: Vec<SqliteValue> = (0..op.p2.max(0))
                        .zip(0_usize..)
                        .map(|(i, n)| {
                            let v = self.reg(op.p1 + i).clone();
                            match affinities.get(n) {
                                Some(&c) => v.apply_affinity(TypeAffinity::from_char(c)),
                                None => v,
                            }
                        })
                        .collect();
                    self.set_reg(op.p3, SqliteValue::Blob(encode_record(&values)?));
                }
                Opcode::NewRowid => {
                    let rowid = self.tree(op.p1, pc)?.next_rowid();
                    self.set_reg(op.p2, SqliteValue::Integer(rowid));
                }
                Opcode::Insert => {
                    let record = self.record_bytes(op, pc, op.p2)?;
                    let rowid = self.reg(op.p3).to_integer();
                    let bad = bad_operand(op, pc, "Insert into an index");
                    match self.tree_mut(op.p1, pc)? {
                        Tree::Table(rows) => {
                            rows.insert(rowid, record);
                        }
                        Tree::Index(_) => return Err(bad),
                    }
                    self.cursor_mut(op.p1, pc)?.position = Some(Position::Rowid(rowid));
                }
                Opcode::Delete => {
                    let position = self.cursor(op.p1, pc)?.position.clone();
                    let tree = self.tree_mut(op.p1, pc)?;
                    match (tree, position) {
                        (Tree::Table(rows), Some(Position::Rowid(rowid))) => {
                            rows.remove(&rowid);
                        }
                        (Tree::Index(keys), Some(Position::Key(key))) => {
                            keys.remove(&key);
                        }
                        _ => return Err(EngineError::NoCurrentRow { cursor: op.p1, pc }),
                    }
                }
                Opcode::Clear => {
                    self.db
                        .trees
                        .get_mut(&op.p1)
                        .ok_or(EngineError::NoSuchRoot { root: op.p1 })?
                        .clear();
                }
                Opcode::IdxInsert | Opcode::IdxDelete => {
                    let key = IndexKey(self.record_values(op, pc, op.p2)?);
                    let insert = op.opcode == Opcode::IdxInsert;
                    let bad = bad_operand(op, pc, "index op on a table");
                    match self.tree_mut(op.p1, pc)? {
                        Tree::Index(keys) if insert => {
                            keys.insert(key);
                        }
                        Tree::Index(keys) => {
                            keys.remove(&key);
                        }
                        Tree::Table(_) => return Err(bad),
                    }
                }

                // ── Sorter ──────────────────────────────────────────────
                Opcode::SorterInsert => {
                    let bytes = self.record_bytes(op, pc, op.p2)?;
                    let values = decode_record(&bytes)?;
                    self.sorter_mut(op, pc)?.rows.push((values, bytes));
                }
                Opcode::SorterSort => {
                    let sorter = self.sorter_mut(op, pc)?;
                    sorter.sort();
                    let empty = sorter.rows.is_empty();
                    sorter.pos = (!empty).then_some(0);
                    if empty {
                        next = self.target(op.p2)?;
                    }
                }
                Opcode::SorterData => {
                    let sorter = self.sorter_mut(op, pc)?;
                    let bytes = sorter
                        .pos
                        .and_then(|p| sorter.rows.get(p))
                        .map(|(_, bytes)| bytes.clone())
                        .ok_or(EngineError::NoCurrentRow { cursor: op.p1, pc })?;
                    self.set_reg(op.p2, SqliteValue::Blob(bytes));
                }
                Opcode::SorterNext => {
                    let sorter = self.sorter_mut(op, pc)?;
                    let following = sorter.pos.map(|p| p + 1).filter(|p| *p < sorter.rows.len());
                    sorter.pos = following;
                    if following.is_some() {
                        next = self.target(op.p2)?;
                    }
                }

                // ── RowSet ──────────────────────────────────────────────
                Opcode::RowSetAdd => {
                    let rowid = self.reg(op.p2).to_integer();
                    self.rowsets.entry(op.p1).or_default().insert(rowid);
                }
                Opcode::RowSetRead => {
                    match self.rowsets.get_mut(&op.p1).and_then(BTreeSet::pop_first) {
                        Some(rowid) => self.set_reg(op.p3, SqliteValue::Integer(rowid)),
                        None => next = self.target(op.p2)?,
                    }
                }

                // ── Aggregates ──────────────────────────────────────────
                Opcode::AggStep => {
                    let name = func_name(op).ok_or_else(|| bad_operand(op, pc, "missing function"))?;
                    let args: Vec<SqliteValue> = (0..i32::from(op.p5))
                        .map(|i| self.reg(op.p2 + i).clone())
                        .collect();
                    let mut state = match self.aggregates.remove(&op.p3) {
                        Some(state) => state,
                        None => AggState::new(name)
                            .ok_or_else(|| bad_operand(op, pc, "unknown aggregate"))?,
                    };
                    state.step(&args);
                    self.aggregates.insert(op.p3, state);
                }
                Opcode::AggFinal => {
                    let name = func_name(op).ok_or_else(|| bad_operand(op, pc, "missing function"))?;
                    let state = match self.aggregates.remove(&op.p1) {
                        Some(state) => state,
                        None => AggState::new(name)
                            .ok_or_else(|| bad_operand(op, pc, "unknown aggregate"))?,
                    };
                    self.set_reg(op.p1, state.finish());
                }

                // ── Output and constraints ──────────────────────────────
                Opcode::ResultRow => {
                    let row = (0..op.p2.max(0))
                        .map(|i| self.reg(op.p1 + i).clone())
                        .collect();
                    self.rows.push(row);
                }
                Opcode::FkCheck => self.check_foreign_keys(op, pc)?,
                Opcode::CreateBtree => {
                    let tree = if op.p3 == 2 {
                        Tree::index()
                    } else {
                        Tree::table()
                    };
                    let root = self.db.create_tree(tree);
                    self.set_reg(op.p2, SqliteValue::Integer(i64::from(root)));
                }
            }
            pc = next;
        }
        tracing::debug!(
            steps = self.stats.steps,
            rows = self.rows.len(),
            "harness.run.complete"
        );
        Ok(Execution {
            rows: self.rows,
            stats: self.stats,
        })
    }

    // ── Registers ───────────────────────────────────────────────────────

    fn reg(&self, r: i32) -> &SqliteValue {
        self.registers
            .get(register_index(r))
            .unwrap_or(&SqliteValue::Null)
    }

    fn set_reg(&mut self, r: i32, value: SqliteValue) {
        let idx = register_index(r);
        if idx >= self.registers.len() {
            self.registers.resize(idx + 1, SqliteValue::Null);
        }
        self.registers[idx] = value;
        self.aggregates.remove(&r);
        self.rowsets.remove(&r);
    }

    fn record_bytes(&self, op: &VdbeOp, pc: usize, r: i32) -> Result<Vec<u8>> {
        match self.reg(r) {
            SqliteValue::Blob(bytes) => Ok(bytes.clone()),
            other => Err(bad_operand(
                op,
                pc,
                &format!("expected a record, got {}", other.typeof_str()),
            )),
        }
    }

    fn record_values(&self, op: &VdbeOp, pc: usize, r: i32) -> Result<Vec<SqliteValue>> {
        Ok(decode_record(&self.record_bytes(op, pc, r)?)?)
    }

    // ── Jumps ───────────────────────────────────────────────────────────

    /// A jump target; one past the last instruction ends the program.
    fn target(&self, p2: i32) -> Result<usize> {
        usize::try_from(p2)
            .ok()
            .filter(|t| *t <= self.ops.len())
            .ok_or(EngineError::BadJump {
                target: i64::from(p2),
            })
    }

    fn target_reg(&self, r: i32) -> Result<usize> {
        let value = self.reg(r).to_integer();
        usize::try_from(value)
            .ok()
            .filter(|t| *t <= self.ops.len())
            .ok_or(EngineError::BadJump { target: value })
    }

    // ── Cursors ─────────────────────────────────────────────────────────

    fn open(&mut self, cursor: i32, source: Source) {
        self.cursors.insert(
            cursor,
            Cursor {
                source,
                position: None,
            },
        );
    }

    fn cursor(&self, cursor: i32, pc: usize) -> Result<&Cursor> {
        self.cursors
            .get(&cursor)
            .ok_or(EngineError::CursorNotOpen { cursor, pc })
    }

    fn cursor_mut(&mut self, cursor: i32, pc: usize) -> Result<&mut Cursor> {
        self.cursors
            .get_mut(&cursor)
            .ok_or(EngineError::CursorNotOpen { cursor, pc })
    }

    fn tree(&self, cursor: i32, pc: usize) -> Result<&Tree> {
        match &self.cursor(cursor, pc)?.source {
            Source::Root(root) => self
                .db
                .trees
                .get(root)
                .ok_or(EngineError::NoSuchRoot { root: *root }),
            Source::Ephemeral(tree) => Ok(tree),
            Source::Sorter(_) => Err(EngineError::BadOperand {
                opcode: Opcode::OpenRead,
                pc,
                detail: format!("cursor {cursor} is a sorter"),
            }),
        }
    }

    fn tree_mut(&mut self, cursor: i32, pc: usize) -> Result<&mut Tree> {
        let Self { db, cursors, .. } = self;
        match &mut cursors
            .get_mut(&cursor)
            .ok_or(EngineError::CursorNotOpen { cursor, pc })?
            .source
        {
            Source::Root(root) => db
                .trees
                .get_mut(root)
                .ok_or(EngineError::NoSuchRoot { root: *root }),
            Source::Ephemeral(tree) => Ok(tree),
            Source::Sorter(_) => Err(EngineError::BadOperand {
                opcode: Opcode::OpenWrite,
                pc,
                detail: format!("cursor {cursor} is a sorter"),
            }),
        }
    }

    fn sorter_mut(&mut self, op: &VdbeOp, pc: usize) -> Result<&mut Sorter> {
        let bad = bad_operand(op, pc, "not a sorter cursor");
        match &mut self.cursor_mut(op.p1, pc)?.source {
            Source::Sorter(sorter) => Ok(sorter),
            _ => Err(bad),
        }
    }

    /// Fields of the row under `cursor`.
    fn current_row(&self, cursor: i32, pc: usize) -> Result<Vec<SqliteValue>> {
        let no_row = EngineError::NoCurrentRow { cursor, pc };
        let c = self.cursor(cursor, pc)?;
        if let Source::Sorter(sorter) = &c.source {
            return sorter
                .pos
                .and_then(|p| sorter.rows.get(p))
                .map(|(values, _)| values.clone())
                .ok_or(no_row);
        }
        match (self.tree(cursor, pc)?, &c.position) {
            (Tree::Table(rows), Some(Position::Rowid(rowid))) => {
                let record = rows.get(rowid).ok_or(no_row)?;
                Ok(decode_record(record)?)
            }
            (Tree::Index(_), Some(Position::Key(key))) => Ok(key.0.clone()),
            _ => Err(no_row),
        }
    }

    fn current_rowid(&self, cursor: i32, pc: usize) -> Result<i64> {
        match &self.cursor(cursor, pc)?.position {
            Some(Position::Rowid(rowid)) => Ok(*rowid),
            Some(Position::Key(key)) => key
                .0
                .last()
                .map(SqliteValue::to_integer)
                .ok_or(EngineError::NoCurrentRow { cursor, pc }),
            None => Err(EngineError::NoCurrentRow { cursor, pc }),
        }
    }

    fn check_foreign_keys(&self, op: &VdbeOp, pc: usize) -> Result<()> {
        let P4::Table(parent) = &op.p4 else {
            return Err(bad_operand(op, pc, "FkCheck without a table"));
        };
        let rowid = self.current_rowid(op.p1, pc)?;
        for fk in self
            .db
            .foreign_keys
            .iter()
            .filter(|fk| fk.parent.eq_ignore_ascii_case(parent))
        {
            let (root, column, is_ipk) = self.db.column_of(&fk.child, &fk.column)?;
            let Some(Tree::Table(rows)) = self.db.trees.get(&root) else {
                return Err(EngineError::NoSuchRoot { root });
            };
            for (child_rowid, record) in rows {
                let value = if is_ipk {
                    SqliteValue::Integer(*child_rowid)
                } else {
                    decode_record(record)?
                        .into_iter()
                        .nth(column)
                        .unwrap_or(SqliteValue::Null)
                };
                if value == SqliteValue::Integer(rowid) {
                    return Err(EngineError::ForeignKeyViolation {
                        parent: parent.clone(),
                        child: fk.child.clone(),
                        rowid,
                    });
                }
            }
        }
        Ok(())
    }
}

fn bad_operand(op: &VdbeOp, pc: usize, detail: &str) -> EngineError {
    EngineError::BadOperand {
        opcode: op.opcode,
        pc,
        detail: detail.to_owned(),
    }
}

fn addr_value(addr: usize) -> i64 {
    i64::try_from(addr).unwrap_or(i64::MAX)
}

fn func_name(op: &VdbeOp) -> Option<&str> {
    match &op.p4 {
        P4::FuncName(name) => Some(name),
        _ => None,
    }
}

/// `lhs OP rhs`; `None` is SQL NULL.
fn compare(opcode: Opcode, lhs: &SqliteValue, rhs: &SqliteValue, flags: u8) -> Option<bool> {
    use std::cmp::Ordering::{Equal, Greater, Less};

    if lhs.is_null() || rhs.is_null() {
        if flags & p5::NULLEQ == 0 {
            return None;
        }
        let both = lhs.is_null() && rhs.is_null();
        return Some(match opcode {
            Opcode::Eq | Opcode::Le | Opcode::Ge => both,
            Opcode::Ne => !both,
            _ => false,
        });
    }
    let ord = compare_rows(std::slice::from_ref(lhs), std::slice::from_ref(rhs));
    Some(match opcode {
        Opcode::Eq => ord == Equal,
        Opcode::Ne => ord != Equal,
        Opcode::Lt => ord == Less,
        Opcode::Le => ord != Greater,
        Opcode::Gt => ord == Greater,
        _ => ord != Less,
    })
}
