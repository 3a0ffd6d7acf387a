//! SELECT code generation.
//!
//! A statement is first planned: wildcards are expanded, every name is
//! resolved against the FROM list and ORDER BY / GROUP BY ordinals and
//! aliases are replaced by the result expressions they denote. Only then
//! is anything emitted, so a name error never leaves a half-built program.
//!
//! Non-aggregate shape (nested loops, one per FROM table):
//!
//! ```text
//! OpenRead*; [LIMIT/OFFSET setup]; [DISTINCT / sorter setup]
//! Rewind c0 -> end
//!   Rewind c1 -> next0
//!     WHERE -> next1
//!     project; [distinct]; [OFFSET]; dispose; [LIMIT]
//!     (or: project + keys -> SorterInsert)
//!   next1: Next c1
//! next0: Next c0
//! end: [SorterSort; drain loop with distinct / OFFSET / dispose / LIMIT]
//! Close*
//! ```

use tessera_ast::{
    ColumnName, Expr, LimitClause, OrderingTerm, ResultColumn, SelectCore, SelectStatement,
    SortDirection,
};
use tessera_error::{Result, TesseraError};
use tessera_types::opcode::{Opcode, P4, p5};

use super::aggregate::emit_aggregate;
use super::compound::emit_compound;
use super::expr::{ExprCtx, emit_expr, emit_filter, reject_aggregates};
use super::resolve::Scope;
use super::schema::SchemaLookup;
use super::{CodegenContext, emit_halt, emit_init, finish_program, lookup_table, reg_offset, rejected};
use crate::{Label, ProgramBuilder, VdbeProgram};

/// Where each result row goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectDest {
    /// `ResultRow` to the caller.
    Output,
    /// Append to the rowid table open on `cursor` under a fresh rowid.
    Table { cursor: i32 },
    /// Insert as a key of the index open on `cursor`; duplicates collapse.
    Set { cursor: i32 },
    /// Copy into the registers starting at `base_reg`. Each row overwrites
    /// the previous one, so this is meant for single-row queries.
    Mem { base_reg: i32 },
    /// Copy into the registers starting at `base_reg`, then `Yield` through
    /// `yield_reg` to the consuming coroutine.
    Coroutine { yield_reg: i32, base_reg: i32 },
}

/// A compiled SELECT together with its result column names.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectCompilation {
    pub program: VdbeProgram,
    /// Display names, one per result column.
    pub column_names: Vec<String>,
}

/// Compile a SELECT whose rows are returned with `ResultRow`.
pub fn codegen_select<S: SchemaLookup + ?Sized>(
    stmt: &SelectStatement,
    schema: &S,
    ctx: &CodegenContext,
) -> Result<SelectCompilation> {
    let _span = tracing::debug_span!(
        "codegen.select",
        table = stmt.core.from.first().map_or("", |t| t.name.as_str()),
        arms = stmt.compounds.len() + 1
    )
    .entered();
    let mut b = ctx.builder();
    emit_init(&mut b);
    let column_names =
        emit_select(&mut b, stmt, schema, SelectDest::Output).map_err(|e| rejected("select", e))?;
    emit_halt(&mut b);
    let program = finish_program(b, "select")?;
    Ok(SelectCompilation {
        program,
        column_names,
    })
}

/// Emit the body of a SELECT into a program under construction, sending
/// rows to `dest`. No `Init`/`Halt` is emitted.
///
/// This is the building block for statements that consume a query, such as
/// a coroutine feeding an INSERT. On error the builder holds a partial body
/// and should be discarded.
pub fn emit_select<S: SchemaLookup + ?Sized>(
    b: &mut ProgramBuilder,
    stmt: &SelectStatement,
    schema: &S,
    dest: SelectDest,
) -> Result<Vec<String>> {
    if !stmt.compounds.is_empty() {
        return emit_compound(b, stmt, schema, dest);
    }
    let plan = plan_select(b, &stmt.core, &stmt.order_by, stmt.limit.as_ref(), schema)?;
    emit_plan(b, &plan, dest)?;
    Ok(plan.names)
}

// ── Planning ────────────────────────────────────────────────────────────────

/// A cursor the SELECT reads from.
#[derive(Debug, Clone)]
pub(crate) struct PlanSource {
    pub cursor: i32,
    /// Root page and table name, for sources this SELECT opens itself.
    /// Ephemeral sources are opened and closed by whoever owns them.
    pub table: Option<(i32, String)>,
}

/// A fully resolved SELECT, ready to emit.
#[derive(Debug, Clone)]
pub(crate) struct SelectPlan {
    pub sources: Vec<PlanSource>,
    pub projection: Vec<Expr>,
    pub names: Vec<String>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<(Expr, SortDirection)>,
    pub distinct: bool,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

impl SelectPlan {
    /// A plan that copies every column of an already-open ephemeral cursor.
    pub fn scan_ephemeral(cursor: i32, names: Vec<String>) -> Self {
        let projection = (0..names.len())
            .map(|column| Expr::ColumnRef { cursor, column })
            .collect();
        Self {
            sources: vec![PlanSource {
                cursor,
                table: None,
            }],
            projection,
            names,
            filter: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            distinct: false,
            limit: None,
            offset: None,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty()
            || self.projection.iter().any(Expr::contains_aggregate)
            || self.having.as_ref().is_some_and(Expr::contains_aggregate)
            || self.order_by.iter().any(|(e, _)| e.contains_aggregate())
    }

    pub fn width(&self) -> Result<i32> {
        reg_offset(self.projection.len())
    }
}

/// "1st", "2nd", "3rd", "4th", ... "11th", "12th", "13th", "21st".
pub(crate) fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

fn display_name(expr: &Expr) -> String {
    match expr {
        Expr::Column(ColumnName { column, .. }) => column.clone(),
        other => other.to_string(),
    }
}

/// Resolve one SELECT core. Cursors for the FROM tables are allocated
/// here; nothing is emitted.
pub(crate) fn plan_select<S: SchemaLookup + ?Sized>(
    b: &mut ProgramBuilder,
    core: &SelectCore,
    order_by: &[OrderingTerm],
    limit: Option<&LimitClause>,
    schema: &S,
) -> Result<SelectPlan> {
    let mut scope = Scope::empty();
    let mut sources = Vec::with_capacity(core.from.len());
    for table_ref in &core.from {
        let table = lookup_table(schema, &table_ref.name)?;
        let cursor = b.alloc_cursor();
        scope.push(table, table_ref.visible_name(), cursor);
        sources.push(PlanSource {
            cursor,
            table: Some((table.root_page, table.name.clone())),
        });
    }

    let mut projection = Vec::new();
    let mut names = Vec::new();
    let mut aliases: Vec<Option<&str>> = Vec::new();
    let qualify = scope.tables().len() > 1;
    for column in &core.columns {
        match column {
            ResultColumn::Star => {
                if scope.tables().is_empty() {
                    return Err(TesseraError::UnresolvedReference {
                        name: "*".to_owned(),
                    });
                }
                for source in scope.tables() {
                    for (i, info) in source.table.columns.iter().enumerate() {
                        projection.push(source.column_ref(i));
                        names.push(if qualify {
                            format!("{}.{}", source.visible_name, info.name)
                        } else {
                            info.name.clone()
                        });
                        aliases.push(None);
                    }
                }
            }
            ResultColumn::TableStar(name) => {
                let source = scope
                    .find_table(name)
                    .ok_or_else(|| TesseraError::NoSuchTable { name: name.clone() })?;
                for (i, info) in source.table.columns.iter().enumerate() {
                    projection.push(source.column_ref(i));
                    names.push(info.name.clone());
                    aliases.push(None);
                }
            }
            ResultColumn::Expr { expr, alias } => {
                projection.push(scope.resolve(expr)?);
                names.push(alias.clone().unwrap_or_else(|| display_name(expr)));
                aliases.push(alias.as_deref());
            }
        }
    }

    // ORDER BY / GROUP BY terms: ordinal, then result alias, then a plain
    // expression over the FROM tables.
    let resolve_term = |i: usize, term: &Expr| -> Result<Expr> {
        match term {
            Expr::Integer(k) => usize::try_from(*k)
                .ok()
                .filter(|k| (1..=projection.len()).contains(k))
                .map(|k| projection[k - 1].clone())
                .ok_or_else(|| TesseraError::OrderByTermMismatch {
                    ordinal: ordinal(i + 1),
                }),
            Expr::Column(ColumnName {
                table: None,
                column,
            }) => match aliases
                .iter()
                .position(|a| a.is_some_and(|a| a.eq_ignore_ascii_case(column)))
            {
                Some(pos) => Ok(projection[pos].clone()),
                None => scope.resolve(term),
            },
            _ => scope.resolve(term),
        }
    };

    let filter = core
        .where_clause
        .as_ref()
        .map(|w| scope.resolve(w))
        .transpose()?;
    if let Some(filter) = &filter {
        reject_aggregates(filter)?;
    }

    let group_by = core
        .group_by
        .iter()
        .enumerate()
        .map(|(i, term)| {
            let resolved = resolve_term(i, term)?;
            reject_aggregates(&resolved)?;
            Ok(resolved)
        })
        .collect::<Result<Vec<_>>>()?;

    let having = core
        .having
        .as_ref()
        .map(|h| scope.resolve(h))
        .transpose()?;

    let order_by = order_by
        .iter()
        .enumerate()
        .map(|(i, term)| Ok((resolve_term(i, &term.expr)?, term.direction)))
        .collect::<Result<Vec<_>>>()?;

    let (limit, offset) = plan_limit(limit)?;

    let plan = SelectPlan {
        sources,
        projection,
        names,
        filter,
        group_by,
        having,
        order_by,
        distinct: core.distinct,
        limit,
        offset,
    };
    if plan.having.is_some() && !plan.is_aggregate() {
        return Err(TesseraError::Unsupported {
            construct: "HAVING clause on a non-aggregate query".to_owned(),
        });
    }
    Ok(plan)
}

/// LIMIT and OFFSET are constants: they see no table.
pub(crate) fn plan_limit(limit: Option<&LimitClause>) -> Result<(Option<Expr>, Option<Expr>)> {
    let Some(clause) = limit else {
        return Ok((None, None));
    };
    let scope = Scope::empty();
    let limit = scope.resolve(&clause.limit)?;
    reject_aggregates(&limit)?;
    let offset = clause
        .offset
        .as_ref()
        .map(|o| scope.resolve(o))
        .transpose()?;
    if let Some(offset) = &offset {
        reject_aggregates(offset)?;
    }
    Ok((Some(limit), offset))
}

// ── Emission ────────────────────────────────────────────────────────────────

pub(crate) fn emit_plan(b: &mut ProgramBuilder, plan: &SelectPlan, dest: SelectDest) -> Result<()> {
    if plan.is_aggregate() {
        return emit_aggregate(b, plan, dest);
    }

    open_sources(b, &plan.sources);
    let done = b.emit_label();
    let limits = Limits::emit(b, plan, done)?;
    let output = RowOutput::prepare(b, plan, !plan.order_by.is_empty())?;

    let scan_end = if output.has_sorter() {
        b.emit_label()
    } else {
        done
    };
    let scan = Scan::open(b, &plan.sources, scan_end);
    let exprs = ExprCtx::new();
    if let Some(filter) = &plan.filter {
        emit_filter(b, filter, scan.skip, &exprs)?;
    }
    output.emit_row(b, &plan.projection, &exprs, &limits, dest, scan.skip, done)?;
    scan.close(b);

    if output.has_sorter() {
        b.resolve_label(scan_end);
        output.emit_drain(b, &limits, dest, done)?;
    }
    b.resolve_label(done);
    output.close(b);
    close_sources(b, &plan.sources);
    Ok(())
}

pub(crate) fn open_sources(b: &mut ProgramBuilder, sources: &[PlanSource]) {
    for source in sources {
        if let Some((root_page, name)) = &source.table {
            b.emit_op(
                Opcode::OpenRead,
                source.cursor,
                *root_page,
                0,
                P4::Table(name.clone()),
                0,
            );
        }
    }
}

pub(crate) fn close_sources(b: &mut ProgramBuilder, sources: &[PlanSource]) {
    for source in sources.iter().filter(|s| s.table.is_some()) {
        b.emit_op(Opcode::Close, source.cursor, 0, 0, P4::None, 0);
    }
}

/// Nested scan loops over the FROM cursors.
pub(crate) struct Scan {
    /// (cursor, loop head, advance point), outermost first.
    levels: Vec<(i32, Label, Label)>,
    /// Where a rejected row jumps: the innermost advance point, or the scan
    /// exit when there are no sources.
    pub skip: Label,
}

impl Scan {
    pub fn open(b: &mut ProgramBuilder, sources: &[PlanSource], exit: Label) -> Self {
        let mut levels = Vec::with_capacity(sources.len());
        let mut outer_next = exit;
        for source in sources {
            let next = b.emit_label();
            b.emit_jump_to_label(Opcode::Rewind, source.cursor, 0, outer_next, P4::None, 0);
            let head = b.label_here();
            levels.push((source.cursor, head, next));
            outer_next = next;
        }
        Self {
            levels,
            skip: outer_next,
        }
    }

    pub fn close(self, b: &mut ProgramBuilder) {
        for &(cursor, head, next) in self.levels.iter().rev() {
            b.resolve_label(next);
            b.emit_jump_to_label(Opcode::Next, cursor, 0, head, P4::None, 0);
        }
    }
}

/// LIMIT and OFFSET counters.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Limits {
    limit: Option<i32>,
    offset: Option<i32>,
}

impl Limits {
    /// Load the counters. LIMIT 0 jumps straight to `done`.
    pub fn emit(b: &mut ProgramBuilder, plan: &SelectPlan, done: Label) -> Result<Self> {
        let exprs = ExprCtx::new();
        let mut limits = Self::default();
        if let Some(limit) = &plan.limit {
            let reg = b.alloc_reg();
            emit_expr(b, limit, reg, &exprs)?;
            b.emit_op(Opcode::MustBeInt, reg, 0, 0, P4::None, 0);
            b.emit_jump_to_label(Opcode::IfNot, reg, 0, done, P4::None, 0);
            limits.limit = Some(reg);
        }
        if let Some(offset) = &plan.offset {
            let reg = b.alloc_reg();
            emit_expr(b, offset, reg, &exprs)?;
            b.emit_op(Opcode::MustBeInt, reg, 0, 0, P4::None, 0);
            limits.offset = Some(reg);
        }
        Ok(limits)
    }

    fn emit_offset_skip(self, b: &mut ProgramBuilder, skip: Label) {
        if let Some(reg) = self.offset {
            b.emit_jump_to_label(Opcode::IfPos, reg, 1, skip, P4::None, 0);
        }
    }

    fn emit_limit_check(self, b: &mut ProgramBuilder, done: Label) {
        if let Some(reg) = self.limit {
            b.emit_jump_to_label(Opcode::DecrJumpZero, reg, 0, done, P4::None, 0);
        }
    }
}

/// Duplicate elimination for SELECT DISTINCT.
#[derive(Debug, Clone, Copy)]
enum Distinct {
    None,
    /// Probe-and-insert against an ephemeral key index.
    Unordered { cursor: i32 },
    /// Rows arrive sorted on every result column: compare with the
    /// previous tuple.
    Ordered { first: i32, prev: i32 },
}

#[derive(Debug, Clone)]
struct SorterOut {
    cursor: i32,
    keys: Vec<(Expr, SortDirection)>,
    /// Sort keys followed by the result columns.
    block: i32,
    record: i32,
}

/// Everything between "a row qualified" and "the row reached `dest`".
#[derive(Debug, Clone)]
pub(crate) struct RowOutput {
    width: i32,
    /// Result registers for the direct path and the sorter drain.
    result: i32,
    distinct: Distinct,
    sorter: Option<SorterOut>,
}

/// Whether the leading ORDER BY terms are exactly the result columns.
fn order_covers_projection(order_by: &[(Expr, SortDirection)], projection: &[Expr]) -> bool {
    if order_by.len() < projection.len() {
        return false;
    }
    let lead = &order_by[..projection.len()];
    let mut used = vec![false; lead.len()];
    projection.iter().all(|p| {
        match (0..lead.len()).find(|&i| !used[i] && lead[i].0 == *p) {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

impl RowOutput {
    /// Allocate registers and open the DISTINCT index and sorter as needed.
    pub fn prepare(b: &mut ProgramBuilder, plan: &SelectPlan, use_sorter: bool) -> Result<Self> {
        let width = plan.width()?;
        let result = b.alloc_regs(width);

        let distinct = if !plan.distinct {
            Distinct::None
        } else if use_sorter && order_covers_projection(&plan.order_by, &plan.projection) {
            let first = b.alloc_reg();
            b.emit_op(Opcode::Integer, 1, first, 0, P4::None, 0);
            let prev = b.alloc_regs(width);
            Distinct::Ordered { first, prev }
        } else {
            let cursor = b.alloc_cursor();
            b.emit_op(
                Opcode::OpenEphemeral,
                cursor,
                width,
                0,
                P4::SortOrder("+".repeat(plan.projection.len())),
                0,
            );
            Distinct::Unordered { cursor }
        };

        let sorter = if use_sorter {
            let cursor = b.alloc_cursor();
            let nkeys = reg_offset(plan.order_by.len())?;
            let directions: String = plan
                .order_by
                .iter()
                .map(|(_, dir)| match dir {
                    SortDirection::Asc => '+',
                    SortDirection::Desc => '-',
                })
                .collect();
            b.emit_op(
                Opcode::SorterOpen,
                cursor,
                nkeys,
                0,
                P4::SortOrder(directions),
                0,
            );
            Some(SorterOut {
                cursor,
                keys: plan.order_by.clone(),
                block: b.alloc_regs(nkeys + width),
                record: b.alloc_reg(),
            })
        } else {
            None
        };

        Ok(Self {
            width,
            result,
            distinct,
            sorter,
        })
    }

    pub fn has_sorter(&self) -> bool {
        self.sorter.is_some()
    }

    /// Evaluate `projection` for the current row and push it toward `dest`
    /// (directly, or into the sorter). Rejected rows jump to `skip`.
    #[allow(clippy::too_many_arguments)]
    pub fn emit_row(
        &self,
        b: &mut ProgramBuilder,
        projection: &[Expr],
        exprs: &ExprCtx,
        limits: &Limits,
        dest: SelectDest,
        skip: Label,
        done: Label,
    ) -> Result<()> {
        match &self.sorter {
            Some(sorter) => {
                let nkeys = reg_offset(sorter.keys.len())?;
                let result = sorter.block + nkeys;
                emit_columns(b, projection, result, exprs)?;
                if let Distinct::Unordered { cursor } = self.distinct {
                    emit_distinct_probe(b, cursor, result, self.width, skip);
                }
                for (i, (key, _)) in (0_i32..).zip(&sorter.keys) {
                    emit_expr(b, key, sorter.block + i, exprs)?;
                }
                b.emit_op(
                    Opcode::MakeRecord,
                    sorter.block,
                    nkeys + self.width,
                    sorter.record,
                    P4::None,
                    0,
                );
                b.emit_op(
                    Opcode::SorterInsert,
                    sorter.cursor,
                    sorter.record,
                    0,
                    P4::None,
                    0,
                );
            }
            None => {
                emit_columns(b, projection, self.result, exprs)?;
                if let Distinct::Unordered { cursor } = self.distinct {
                    emit_distinct_probe(b, cursor, self.result, self.width, skip);
                }
                limits.emit_offset_skip(b, skip);
                emit_dispose(b, dest, self.result, self.width);
                limits.emit_limit_check(b, done);
            }
        }
        Ok(())
    }

    /// Sort and replay the buffered rows through DISTINCT, OFFSET, `dest`
    /// and LIMIT.
    pub fn emit_drain(
        &self,
        b: &mut ProgramBuilder,
        limits: &Limits,
        dest: SelectDest,
        done: Label,
    ) -> Result<()> {
        let Some(sorter) = &self.sorter else {
            return Ok(());
        };
        let nkeys = reg_offset(sorter.keys.len())?;

        b.emit_jump_to_label(Opcode::SorterSort, sorter.cursor, 0, done, P4::None, 0);
        let head = b.label_here();
        let skip = b.emit_label();
        b.emit_op(
            Opcode::SorterData,
            sorter.cursor,
            sorter.record,
            0,
            P4::None,
            0,
        );
        for i in 0..self.width {
            b.emit_op(
                Opcode::Column,
                sorter.cursor,
                nkeys + i,
                self.result + i,
                P4::None,
                0,
            );
        }

        if let Distinct::Ordered { first, prev } = self.distinct {
            let fresh = b.emit_label();
            b.emit_jump_to_label(Opcode::IfPos, first, 1, fresh, P4::None, 0);
            for i in 0..self.width {
                b.emit_jump_to_label(
                    Opcode::Ne,
                    self.result + i,
                    prev + i,
                    fresh,
                    P4::None,
                    p5::NULLEQ,
                );
            }
            b.emit_jump_to_label(Opcode::Goto, 0, 0, skip, P4::None, 0);
            b.resolve_label(fresh);
            b.emit_op(Opcode::Copy, self.result, prev, self.width - 1, P4::None, 0);
        }

        limits.emit_offset_skip(b, skip);
        emit_dispose(b, dest, self.result, self.width);
        limits.emit_limit_check(b, done);
        b.resolve_label(skip);
        b.emit_jump_to_label(Opcode::SorterNext, sorter.cursor, 0, head, P4::None, 0);
        Ok(())
    }

    pub fn close(&self, b: &mut ProgramBuilder) {
        if let Distinct::Unordered { cursor } = self.distinct {
            b.emit_op(Opcode::Close, cursor, 0, 0, P4::None, 0);
        }
        if let Some(sorter) = &self.sorter {
            b.emit_op(Opcode::Close, sorter.cursor, 0, 0, P4::None, 0);
        }
    }
}

fn emit_columns(b: &mut ProgramBuilder, exprs_in: &[Expr], base: i32, ctx: &ExprCtx) -> Result<()> {
    for (i, expr) in (0_i32..).zip(exprs_in) {
        emit_expr(b, expr, base + i, ctx)?;
    }
    Ok(())
}

/// Skip the row if its tuple is already in the DISTINCT index, otherwise
/// remember it.
fn emit_distinct_probe(b: &mut ProgramBuilder, cursor: i32, result: i32, width: i32, skip: Label) {
    let key = b.alloc_temp();
    b.emit_op(Opcode::MakeRecord, result, width, key, P4::None, 0);
    b.emit_jump_to_label(Opcode::Found, cursor, key, skip, P4::None, 0);
    b.emit_op(Opcode::IdxInsert, cursor, key, 0, P4::None, 0);
    b.free_temp(key);
}

/// Hand the `width` registers at `result` to `dest`.
pub(crate) fn emit_dispose(b: &mut ProgramBuilder, dest: SelectDest, result: i32, width: i32) {
    match dest {
        SelectDest::Output => {
            b.emit_op(Opcode::ResultRow, result, width, 0, P4::None, 0);
        }
        SelectDest::Table { cursor } => {
            let record = b.alloc_temp();
            let rowid = b.alloc_temp();
            b.emit_op(Opcode::MakeRecord, result, width, record, P4::None, 0);
            b.emit_op(Opcode::NewRowid, cursor, rowid, 0, P4::None, 0);
            b.emit_op(Opcode::Insert, cursor, record, rowid, P4::None, 0);
            b.free_temp(rowid);
            b.free_temp(record);
        }
        SelectDest::Set { cursor } => {
            let record = b.alloc_temp();
            b.emit_op(Opcode::MakeRecord, result, width, record, P4::None, 0);
            b.emit_op(Opcode::IdxInsert, cursor, record, 0, P4::None, 0);
            b.free_temp(record);
        }
        SelectDest::Mem { base_reg } => {
            b.emit_op(Opcode::Copy, result, base_reg, width - 1, P4::None, 0);
        }
        SelectDest::Coroutine {
            yield_reg,
            base_reg,
        } => {
            b.emit_op(Opcode::Copy, result, base_reg, width - 1, P4::None, 0);
            b.emit_op(Opcode::Yield, yield_reg, 0, 0, P4::None, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::test_support::*;
    use tessera_ast::{AggregateFunc, BinaryOp, TableRef};

    fn select(columns: Vec<ResultColumn>, from: &[&str]) -> SelectStatement {
        SelectStatement::from_core(SelectCore {
            columns,
            from: from.iter().map(|t| TableRef::new(t)).collect(),
            ..SelectCore::default()
        })
    }

    fn compile(stmt: &SelectStatement) -> SelectCompilation {
        let schema = test_schema();
        let compiled = codegen_select(stmt, &schema, &CodegenContext::default()).unwrap();
        assert_well_formed(&compiled.program);
        compiled
    }

    fn compile_err(stmt: &SelectStatement) -> TesseraError {
        let schema = test_schema();
        codegen_select(stmt, &schema, &CodegenContext::default()).unwrap_err()
    }

    #[test]
    fn test_full_scan_shape() {
        let stmt = select(vec![ResultColumn::Star], &["users"]);
        let compiled = compile(&stmt);
        assert_eq!(compiled.column_names, vec!["id", "name", "email"]);
        assert_eq!(
            opcode_sequence(&compiled.program),
            vec![
                Opcode::Init,
                Opcode::OpenRead,
                Opcode::Rewind,
                Opcode::Rowid,
                Opcode::Column,
                Opcode::Column,
                Opcode::ResultRow,
                Opcode::Next,
                Opcode::Close,
                Opcode::Halt,
            ]
        );
    }

    #[test]
    fn test_multi_table_star_qualifies_names() {
        let stmt = select(vec![ResultColumn::Star], &["users", "orders"]);
        let compiled = compile(&stmt);
        assert_eq!(compiled.column_names.len(), 6);
        assert_eq!(compiled.column_names[0], "users.id");
        assert_eq!(compiled.column_names[5], "orders.amount");
        assert_eq!(compiled.program.count(Opcode::Rewind), 2);
        assert_eq!(compiled.program.count(Opcode::Next), 2);
        assert_eq!(compiled.program.cursor_count(), 2);
    }

    #[test]
    fn test_table_star_and_display_names() {
        let mut stmt = select(
            vec![
                ResultColumn::TableStar("o".to_owned()),
                ResultColumn::aliased(Expr::column("amount"), "amt"),
                ResultColumn::expr(Expr::binary(
                    BinaryOp::Add,
                    Expr::column("user_id"),
                    Expr::Integer(1),
                )),
            ],
            &[],
        );
        stmt.core.from = vec![TableRef::aliased("orders", "o")];
        let compiled = compile(&stmt);
        assert_eq!(
            compiled.column_names,
            vec!["id", "user_id", "amount", "amt", "user_id + 1"]
        );
    }

    #[test]
    fn test_no_from_evaluates_once() {
        let stmt = select(vec![ResultColumn::expr(Expr::Integer(7))], &[]);
        let compiled = compile(&stmt);
        assert_eq!(
            opcode_sequence(&compiled.program),
            vec![
                Opcode::Init,
                Opcode::Integer,
                Opcode::ResultRow,
                Opcode::Halt
            ]
        );
    }

    #[test]
    fn test_register_reuse_shrinks_filter_registers() {
        let mut stmt = select(vec![ResultColumn::expr(Expr::column("name"))], &["users"]);
        stmt.core.where_clause = Some(Expr::binary(
            BinaryOp::Or,
            Expr::binary(
                BinaryOp::And,
                Expr::binary(BinaryOp::Gt, Expr::column("id"), Expr::Integer(1)),
                Expr::binary(BinaryOp::Ne, Expr::column("name"), Expr::Integer(7)),
            ),
            Expr::binary(BinaryOp::Lt, Expr::column("id"), Expr::Integer(0)),
        ));
        let schema = test_schema();
        let plain = codegen_select(&stmt, &schema, &CodegenContext::default()).unwrap();
        let reused = codegen_select(
            &stmt,
            &schema,
            &CodegenContext {
                reuse_temp_registers: true,
                ..CodegenContext::default()
            },
        )
        .unwrap();
        assert_well_formed(&plain.program);
        assert_well_formed(&reused.program);
        assert_eq!(
            opcode_sequence(&plain.program),
            opcode_sequence(&reused.program)
        );
        assert!(
            reused.program.register_count() < plain.program.register_count(),
            "{} vs {}",
            reused.program.register_count(),
            plain.program.register_count()
        );
    }

    #[test]
    fn test_where_and_limit_offset() {
        let mut stmt = select(vec![ResultColumn::expr(Expr::column("name"))], &["users"]);
        stmt.core.where_clause = Some(Expr::binary(
            BinaryOp::Gt,
            Expr::column("id"),
            Expr::Integer(3),
        ));
        stmt.limit = Some(LimitClause {
            limit: Expr::Integer(10),
            offset: Some(Expr::Integer(2)),
        });
        let compiled = compile(&stmt);
        assert!(has_opcodes(
            &compiled.program,
            &[
                Opcode::Integer,
                Opcode::MustBeInt,
                Opcode::IfNot,
                Opcode::Rewind,
                Opcode::IfNot,
                Opcode::Column,
                Opcode::IfPos,
                Opcode::ResultRow,
                Opcode::DecrJumpZero,
                Opcode::Next,
            ]
        ));
    }

    #[test]
    fn test_order_by_uses_sorter() {
        let mut stmt = select(vec![ResultColumn::expr(Expr::column("name"))], &["users"]);
        stmt.order_by = vec![OrderingTerm::desc(Expr::column("email"))];
        let compiled = compile(&stmt);
        let prog = &compiled.program;
        assert!(has_opcodes(
            prog,
            &[
                Opcode::SorterOpen,
                Opcode::Rewind,
                Opcode::MakeRecord,
                Opcode::SorterInsert,
                Opcode::Next,
                Opcode::SorterSort,
                Opcode::SorterData,
                Opcode::Column,
                Opcode::ResultRow,
                Opcode::SorterNext,
            ]
        ));
        let open = prog
            .ops()
            .iter()
            .find(|op| op.opcode == Opcode::SorterOpen)
            .unwrap();
        assert_eq!(open.p4, P4::SortOrder("-".to_owned()));
    }

    #[test]
    fn test_order_by_ordinal_and_alias() {
        let mut stmt = select(
            vec![
                ResultColumn::expr(Expr::column("name")),
                ResultColumn::aliased(Expr::column("email"), "e"),
            ],
            &["users"],
        );
        stmt.order_by = vec![
            OrderingTerm::asc(Expr::Integer(2)),
            OrderingTerm::asc(Expr::column("E")),
        ];
        compile(&stmt);

        stmt.order_by = vec![OrderingTerm::asc(Expr::Integer(3))];
        assert!(matches!(
            compile_err(&stmt),
            TesseraError::OrderByTermMismatch { .. }
        ));
    }

    #[test]
    fn test_distinct_strategies() {
        let mut stmt = select(vec![ResultColumn::expr(Expr::column("name"))], &["users"]);
        stmt.core.distinct = true;
        let unordered = compile(&stmt).program;
        assert_eq!(unordered.count(Opcode::OpenEphemeral), 1);
        assert_eq!(unordered.count(Opcode::Found), 1);

        stmt.order_by = vec![OrderingTerm::asc(Expr::column("name"))];
        let ordered = compile(&stmt).program;
        assert_eq!(ordered.count(Opcode::OpenEphemeral), 0);
        assert!(has_opcodes(
            &ordered,
            &[Opcode::SorterData, Opcode::IfPos, Opcode::Ne, Opcode::Goto, Opcode::Copy]
        ));

        stmt.order_by = vec![OrderingTerm::asc(Expr::column("email"))];
        let mixed = compile(&stmt).program;
        assert_eq!(mixed.count(Opcode::Found), 1);
        assert_eq!(mixed.count(Opcode::SorterOpen), 1);
    }

    #[test]
    fn test_resolution_errors() {
        let stmt = select(vec![ResultColumn::expr(Expr::column("nope"))], &["users"]);
        assert!(matches!(compile_err(&stmt), TesseraError::NoSuchColumn { .. }));
        let stmt = select(vec![ResultColumn::Star], &["missing"]);
        assert!(matches!(compile_err(&stmt), TesseraError::NoSuchTable { .. }));
        let stmt = select(vec![ResultColumn::TableStar("o".to_owned())], &["users"]);
        assert!(matches!(compile_err(&stmt), TesseraError::NoSuchTable { .. }));
        let stmt = select(vec![ResultColumn::Star], &[]);
        assert!(matches!(
            compile_err(&stmt),
            TesseraError::UnresolvedReference { .. }
        ));
    }

    #[test]
    fn test_aggregates_in_where_are_misuse() {
        let mut stmt = select(vec![ResultColumn::Star], &["users"]);
        stmt.core.where_clause = Some(Expr::binary(
            BinaryOp::Gt,
            Expr::aggregate(AggregateFunc::Count, vec![]),
            Expr::Integer(1),
        ));
        assert!(matches!(
            compile_err(&stmt),
            TesseraError::MisuseOfAggregate { .. }
        ));
    }

    #[test]
    fn test_having_without_aggregation_fails() {
        let mut stmt = select(vec![ResultColumn::expr(Expr::column("name"))], &["users"]);
        stmt.core.having = Some(Expr::binary(
            BinaryOp::Eq,
            Expr::column("name"),
            Expr::text("x"),
        ));
        assert!(matches!(compile_err(&stmt), TesseraError::Unsupported { .. }));
    }

    #[test]
    fn test_destinations() {
        let schema = test_schema();
        let stmt = select(vec![ResultColumn::expr(Expr::column("name"))], &["users"]);
        for (dest, opcode) in [
            (SelectDest::Table { cursor: 9 }, Opcode::Insert),
            (SelectDest::Set { cursor: 9 }, Opcode::IdxInsert),
            (SelectDest::Mem { base_reg: 1 }, Opcode::Copy),
            (
                SelectDest::Coroutine {
                    yield_reg: 1,
                    base_reg: 2,
                },
                Opcode::Yield,
            ),
        ] {
            let mut b = ProgramBuilder::new();
            b.alloc_regs(2);
            emit_select(&mut b, &stmt, &schema, dest).unwrap();
            let prog = b.finish().unwrap();
            assert_eq!(prog.count(opcode), 1, "{dest:?}");
            assert_eq!(prog.count(Opcode::ResultRow), 0);
        }
    }

    #[test]
    fn test_ordinals() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(2), "2nd");
        assert_eq!(ordinal(3), "3rd");
        assert_eq!(ordinal(4), "4th");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(12), "12th");
        assert_eq!(ordinal(22), "22nd");
    }
}
