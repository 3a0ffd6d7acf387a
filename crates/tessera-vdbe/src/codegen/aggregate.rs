//! Aggregate queries: GROUP BY, HAVING and aggregate functions.
//!
//! Without GROUP BY every qualifying row feeds one set of accumulators and
//! exactly one row is produced. With GROUP BY the rows are first sorted on
//! the group key, then replayed:
//!
//! ```text
//! pass 1: scan; WHERE; keys + args + bare columns -> SorterInsert
//! pass 2: SorterSort -> end
//! loop:   SorterData; Column* -> current keys, args, bare columns
//!         IfPos first -> same          (first row opens the first group)
//!         Ne key_i, prev_i -> boundary (NULLs compare equal)
//!         Goto same
//! boundary: Gosub output; reset accumulators
//! same:   prev = keys; AggStep*; last-row bare columns
//!         SorterNext -> loop
//! end:    IfPos first -> done          (no rows at all)
//!         Gosub output; Goto done
//! output: AggFinal*; HAVING -> return; emit row; return: Return
//! ```

use tessera_ast::{AggregateFunc, Expr};
use tessera_error::{Result, TesseraError};
use tessera_types::opcode::{Opcode, P4, p5};

use super::expr::{ExprCtx, emit_expr, emit_filter};
use super::reg_offset;
use super::select::{
    Limits, RowOutput, Scan, SelectDest, SelectPlan, close_sources, open_sources,
};
use crate::{Label, ProgramBuilder};

/// One distinct aggregate call and its registers.
#[derive(Debug, Clone)]
struct AggCall {
    expr: Expr,
    func: AggregateFunc,
    args: Vec<Expr>,
    accumulator: i32,
    /// First of `args.len()` argument registers.
    arg_base: i32,
}

impl AggCall {
    fn nargs(&self) -> Result<u8> {
        u8::try_from(self.args.len())
            .map_err(|_| TesseraError::internal("too many aggregate arguments"))
    }
}

/// Gather aggregate calls, deduplicated, rejecting nested aggregates.
fn collect_aggregates(expr: &Expr, out: &mut Vec<Expr>) -> Result<()> {
    match expr {
        Expr::Aggregate { func, args } => {
            if args.iter().any(Expr::contains_aggregate) {
                return Err(TesseraError::MisuseOfAggregate {
                    name: func.name().to_owned(),
                });
            }
            if !out.contains(expr) {
                out.push(expr.clone());
            }
        }
        Expr::Binary { left, right, .. } => {
            collect_aggregates(left, out)?;
            collect_aggregates(right, out)?;
        }
        _ => {}
    }
    Ok(())
}

/// Column reads outside aggregates and outside group-key expressions.
fn collect_bare_columns(expr: &Expr, keys: &[Expr], out: &mut Vec<Expr>) {
    if keys.contains(expr) {
        return;
    }
    match expr {
        Expr::ColumnRef { .. } | Expr::Rowid { .. } => {
            if !out.contains(expr) {
                out.push(expr.clone());
            }
        }
        Expr::Binary { left, right, .. } => {
            collect_bare_columns(left, keys, out);
            collect_bare_columns(right, keys, out);
        }
        _ => {}
    }
}

/// Load every accumulator with its identity value.
fn emit_reset(b: &mut ProgramBuilder, aggs: &[AggCall]) {
    for agg in aggs {
        match agg.func {
            AggregateFunc::Count => {
                b.emit_op(Opcode::Integer, 0, agg.accumulator, 0, P4::None, 0);
            }
            AggregateFunc::GroupConcat => {
                b.emit_op(
                    Opcode::String8,
                    0,
                    agg.accumulator,
                    0,
                    P4::Str(String::new()),
                    0,
                );
            }
            AggregateFunc::Sum | AggregateFunc::Avg | AggregateFunc::Min | AggregateFunc::Max => {
                b.emit_op(Opcode::Null, 0, agg.accumulator, 0, P4::None, 0);
            }
        }
    }
}

fn emit_steps(b: &mut ProgramBuilder, aggs: &[AggCall]) -> Result<()> {
    for agg in aggs {
        b.emit_op(
            Opcode::AggStep,
            0,
            agg.arg_base,
            agg.accumulator,
            P4::FuncName(agg.func.name().to_owned()),
            agg.nargs()?,
        );
    }
    Ok(())
}

fn emit_finals(b: &mut ProgramBuilder, aggs: &[AggCall]) -> Result<()> {
    for agg in aggs {
        b.emit_op(
            Opcode::AggFinal,
            agg.accumulator,
            i32::from(agg.nargs()?),
            0,
            P4::FuncName(agg.func.name().to_owned()),
            0,
        );
    }
    Ok(())
}

/// Set `count` registers from `first` to NULL.
fn emit_null_range(b: &mut ProgramBuilder, first: i32, count: i32) {
    if count > 0 {
        b.emit_op(Opcode::Null, 0, first, first + count - 1, P4::None, 0);
    }
}

pub(crate) fn emit_aggregate(
    b: &mut ProgramBuilder,
    plan: &SelectPlan,
    dest: SelectDest,
) -> Result<()> {
    let mut found = Vec::new();
    for expr in plan
        .projection
        .iter()
        .chain(plan.having.iter())
        .chain(plan.order_by.iter().map(|(e, _)| e))
    {
        collect_aggregates(expr, &mut found)?;
    }
    let mut bare = Vec::new();
    for expr in plan
        .projection
        .iter()
        .chain(plan.having.iter())
        .chain(plan.order_by.iter().map(|(e, _)| e))
    {
        collect_bare_columns(expr, &plan.group_by, &mut bare);
    }

    let aggs = found
        .into_iter()
        .map(|expr| {
            let Expr::Aggregate { func, args } = &expr else {
                return Err(TesseraError::internal("non-aggregate collected"));
            };
            let (func, args) = (*func, args.clone());
            let arg_base = b.alloc_regs(reg_offset(args.len())?);
            Ok(AggCall {
                accumulator: b.alloc_reg(),
                expr,
                func,
                args,
                arg_base,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    open_sources(b, &plan.sources);
    let done = b.emit_label();
    let limits = Limits::emit(b, plan, done)?;

    if plan.group_by.is_empty() {
        emit_single_group(b, plan, dest, &aggs, &bare, &limits, done)?;
    } else {
        emit_grouped(b, plan, dest, &aggs, &bare, &limits, done)?;
    }
    close_sources(b, &plan.sources);
    Ok(())
}

/// Aggregates with no GROUP BY: one group, one output row even for an
/// empty input.
#[allow(clippy::too_many_arguments)]
fn emit_single_group(
    b: &mut ProgramBuilder,
    plan: &SelectPlan,
    dest: SelectDest,
    aggs: &[AggCall],
    bare: &[Expr],
    limits: &Limits,
    done: Label,
) -> Result<()> {
    let nbare = reg_offset(bare.len())?;
    let bare_base = b.alloc_regs(nbare);
    emit_reset(b, aggs);
    emit_null_range(b, bare_base, nbare);
    let output = RowOutput::prepare(b, plan, false)?;

    let scan_end = b.emit_label();
    let scan = Scan::open(b, &plan.sources, scan_end);
    let raw = ExprCtx::new();
    if let Some(filter) = &plan.filter {
        emit_filter(b, filter, scan.skip, &raw)?;
    }
    for agg in aggs {
        for (i, arg) in (0_i32..).zip(&agg.args) {
            emit_expr(b, arg, agg.arg_base + i, &raw)?;
        }
    }
    emit_steps(b, aggs)?;
    for (i, column) in (0_i32..).zip(bare) {
        emit_expr(b, column, bare_base + i, &raw)?;
    }
    scan.close(b);
    b.resolve_label(scan_end);

    emit_finals(b, aggs)?;
    let mut bound = ExprCtx::new();
    for agg in aggs {
        bound.bind(agg.expr.clone(), agg.accumulator);
    }
    for (i, column) in (0_i32..).zip(bare) {
        bound.bind(column.clone(), bare_base + i);
    }
    if let Some(having) = &plan.having {
        emit_filter(b, having, done, &bound)?;
    }
    output.emit_row(b, &plan.projection, &bound, limits, dest, done, done)?;
    b.resolve_label(done);
    output.close(b);
    Ok(())
}

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
fn emit_grouped(
    b: &mut ProgramBuilder,
    plan: &SelectPlan,
    dest: SelectDest,
    aggs: &[AggCall],
    bare: &[Expr],
    limits: &Limits,
    done: Label,
) -> Result<()> {
    let nkeys = reg_offset(plan.group_by.len())?;
    let nargs = reg_offset(aggs.iter().map(|a| a.args.len()).sum())?;
    let nbare = reg_offset(bare.len())?;
    let width = nkeys + nargs + nbare;

    // Pass 1: sort qualifying rows on the group key.
    let group_sorter = b.alloc_cursor();
    b.emit_op(
        Opcode::SorterOpen,
        group_sorter,
        nkeys,
        0,
        P4::SortOrder("+".repeat(plan.group_by.len())),
        0,
    );
    let block = b.alloc_regs(width);
    let group_record = b.alloc_reg();

    let scan_end = b.emit_label();
    let scan = Scan::open(b, &plan.sources, scan_end);
    let raw = ExprCtx::new();
    if let Some(filter) = &plan.filter {
        emit_filter(b, filter, scan.skip, &raw)?;
    }
    for (i, key) in (0_i32..).zip(&plan.group_by) {
        emit_expr(b, key, block + i, &raw)?;
    }
    let mut slot = block + nkeys;
    for agg in aggs {
        for arg in &agg.args {
            emit_expr(b, arg, slot, &raw)?;
            slot += 1;
        }
    }
    for column in bare {
        emit_expr(b, column, slot, &raw)?;
        slot += 1;
    }
    b.emit_op(Opcode::MakeRecord, block, width, group_record, P4::None, 0);
    b.emit_op(Opcode::SorterInsert, group_sorter, group_record, 0, P4::None, 0);
    scan.close(b);
    b.resolve_label(scan_end);

    // Pass 2: walk the groups.
    let output = RowOutput::prepare(b, plan, !plan.order_by.is_empty())?;
    emit_reset(b, aggs);
    let first = b.alloc_reg();
    b.emit_op(Opcode::Integer, 1, first, 0, P4::None, 0);
    let prev = b.alloc_regs(nkeys);
    emit_null_range(b, prev, nkeys);
    let current = b.alloc_regs(nkeys);
    let current_bare = b.alloc_regs(nbare);
    let group_bare = b.alloc_regs(nbare);
    emit_null_range(b, group_bare, nbare);
    let return_reg = b.alloc_reg();

    let groups_end = b.emit_label();
    let output_sub = b.emit_label();
    let boundary = b.emit_label();
    let same_group = b.emit_label();
    let after_groups = b.emit_label();

    b.emit_jump_to_label(Opcode::SorterSort, group_sorter, 0, groups_end, P4::None, 0);
    let head = b.label_here();
    b.emit_op(
        Opcode::SorterData,
        group_sorter,
        group_record,
        0,
        P4::None,
        0,
    );
    for i in 0..nkeys {
        b.emit_op(Opcode::Column, group_sorter, i, current + i, P4::None, 0);
    }
    let mut field = nkeys;
    for agg in aggs {
        for i in 0..reg_offset(agg.args.len())? {
            b.emit_op(
                Opcode::Column,
                group_sorter,
                field,
                agg.arg_base + i,
                P4::None,
                0,
            );
            field += 1;
        }
    }
    for i in 0..nbare {
        b.emit_op(
            Opcode::Column,
            group_sorter,
            field,
            current_bare + i,
            P4::None,
            0,
        );
        field += 1;
    }

    b.emit_jump_to_label(Opcode::IfPos, first, 1, same_group, P4::None, 0);
    for i in 0..nkeys {
        b.emit_jump_to_label(
            Opcode::Ne,
            current + i,
            prev + i,
            boundary,
            P4::None,
            p5::NULLEQ,
        );
    }
    b.emit_jump_to_label(Opcode::Goto, 0, 0, same_group, P4::None, 0);

    b.resolve_label(boundary);
    b.emit_jump_to_label(Opcode::Gosub, return_reg, 0, output_sub, P4::None, 0);
    emit_reset(b, aggs);

    b.resolve_label(same_group);
    b.emit_op(Opcode::Copy, current, prev, nkeys - 1, P4::None, 0);
    emit_steps(b, aggs)?;
    if nbare > 0 {
        b.emit_op(Opcode::Copy, current_bare, group_bare, nbare - 1, P4::None, 0);
    }
    b.emit_jump_to_label(Opcode::SorterNext, group_sorter, 0, head, P4::None, 0);

    b.resolve_label(groups_end);
    b.emit_jump_to_label(Opcode::IfPos, first, 0, after_groups, P4::None, 0);
    b.emit_jump_to_label(Opcode::Gosub, return_reg, 0, output_sub, P4::None, 0);
    b.emit_jump_to_label(Opcode::Goto, 0, 0, after_groups, P4::None, 0);

    // Output subroutine: finalize, filter, emit.
    b.resolve_label(output_sub);
    emit_finals(b, aggs)?;
    let mut bound = ExprCtx::new();
    for (i, key) in (0_i32..).zip(&plan.group_by) {
        bound.bind(key.clone(), prev + i);
    }
    for agg in aggs {
        bound.bind(agg.expr.clone(), agg.accumulator);
    }
    for (i, column) in (0_i32..).zip(bare) {
        bound.bind(column.clone(), group_bare + i);
    }
    let sub_return = b.emit_label();
    if let Some(having) = &plan.having {
        emit_filter(b, having, sub_return, &bound)?;
    }
    output.emit_row(b, &plan.projection, &bound, limits, dest, sub_return, done)?;
    b.resolve_label(sub_return);
    b.emit_op(Opcode::Return, return_reg, 0, 0, P4::None, 0);

    b.resolve_label(after_groups);
    output.emit_drain(b, limits, dest, done)?;
    b.resolve_label(done);
    b.emit_op(Opcode::Close, group_sorter, 0, 0, P4::None, 0);
    output.close(b);
    Ok(())
}
