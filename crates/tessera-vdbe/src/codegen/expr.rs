//! Expression compilation into a caller-chosen register.

use tessera_ast::{BinaryOp, Expr};
use tessera_error::{Result, TesseraError};
use tessera_types::SqliteValue;
use tessera_types::opcode::{Opcode, P4, p5};

use super::reg_offset;
use crate::{Label, ProgramBuilder};

/// Sub-expressions whose values already sit in registers.
///
/// Aggregate queries bind accumulators, group keys and last-row columns
/// here before compiling the result list, so those sub-trees become a
/// plain register copy.
#[derive(Debug, Default)]
pub(crate) struct ExprCtx {
    bindings: Vec<(Expr, i32)>,
}

impl ExprCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, expr: Expr, reg: i32) {
        self.bindings.push((expr, reg));
    }

    fn lookup(&self, expr: &Expr) -> Option<i32> {
        self.bindings
            .iter()
            .find(|(bound, _)| bound == expr)
            .map(|&(_, reg)| reg)
    }
}

const fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Subtract => Opcode::Subtract,
        BinaryOp::Multiply => Opcode::Multiply,
        BinaryOp::Divide => Opcode::Divide,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
    }
}

/// Compile `expr`, leaving its value in `target`.
///
/// `expr` must already be resolved; a leftover `Column` is reported as an
/// unresolved reference.
pub(crate) fn emit_expr(
    b: &mut ProgramBuilder,
    expr: &Expr,
    target: i32,
    ctx: &ExprCtx,
) -> Result<()> {
    if let Some(reg) = ctx.lookup(expr) {
        b.emit_op(Opcode::SCopy, reg, target, 0, P4::None, 0);
        return Ok(());
    }

    match expr {
        Expr::ColumnRef { cursor, column } => {
            b.emit_op(Opcode::Column, *cursor, reg_offset(*column)?, target, P4::None, 0);
        }
        Expr::Rowid { cursor } => {
            b.emit_op(Opcode::Rowid, *cursor, target, 0, P4::None, 0);
        }
        Expr::Integer(v) => emit_integer(b, *v, target),
        Expr::Float(v) => {
            b.emit_op(Opcode::Real, 0, target, 0, P4::Real(*v), 0);
        }
        Expr::Text(s) => {
            b.emit_op(Opcode::String8, 0, target, 0, P4::Str(s.clone()), 0);
        }
        Expr::Blob(bytes) => {
            b.emit_op(
                Opcode::Blob,
                reg_offset(bytes.len())?,
                target,
                0,
                P4::Blob(bytes.clone()),
                0,
            );
        }
        Expr::Null => {
            b.emit_op(Opcode::Null, 0, target, 0, P4::None, 0);
        }
        Expr::Binary { op, left, right } => {
            let lhs = b.alloc_temp();
            emit_expr(b, left, lhs, ctx)?;
            let rhs = b.alloc_temp();
            emit_expr(b, right, rhs, ctx)?;
            let opcode = binary_opcode(*op);
            if opcode.is_comparison() {
                // r[target] = r[lhs] OP r[rhs]
                b.emit_op(opcode, rhs, target, lhs, P4::None, p5::STOREP2);
            } else if matches!(op, BinaryOp::And | BinaryOp::Or) {
                b.emit_op(opcode, lhs, rhs, target, P4::None, 0);
            } else {
                b.emit_op(opcode, rhs, lhs, target, P4::None, 0);
            }
            b.free_temp(rhs);
            b.free_temp(lhs);
        }
        Expr::Column(name) => {
            return Err(TesseraError::UnresolvedReference {
                name: name.table.as_ref().map_or_else(
                    || name.column.clone(),
                    |t| format!("{t}.{}", name.column),
                ),
            });
        }
        Expr::Aggregate { func, .. } => {
            return Err(TesseraError::MisuseOfAggregate {
                name: func.name().to_owned(),
            });
        }
    }
    Ok(())
}

fn emit_integer(b: &mut ProgramBuilder, v: i64, target: i32) {
    match i32::try_from(v) {
        Ok(small) => {
            b.emit_op(Opcode::Integer, small, target, 0, P4::None, 0);
        }
        Err(_) => {
            b.emit_op(Opcode::Int64, 0, target, 0, P4::Int64(v), 0);
        }
    }
}

/// Load a constant value into `target`.
pub(crate) fn emit_value(b: &mut ProgramBuilder, value: &SqliteValue, target: i32) -> Result<()> {
    let literal = match value {
        SqliteValue::Null => Expr::Null,
        SqliteValue::Integer(v) => Expr::Integer(*v),
        SqliteValue::Float(v) => Expr::Float(*v),
        SqliteValue::Text(s) => Expr::Text(s.clone()),
        SqliteValue::Blob(bytes) => Expr::Blob(bytes.clone()),
    };
    emit_expr(b, &literal, target, &ExprCtx::new())
}

/// Test each top-level conjunct of `filter`, jumping to `skip` as soon as
/// one is false or NULL.
pub(crate) fn emit_filter(
    b: &mut ProgramBuilder,
    filter: &Expr,
    skip: Label,
    ctx: &ExprCtx,
) -> Result<()> {
    for term in filter.conjuncts() {
        let reg = b.alloc_temp();
        emit_expr(b, term, reg, ctx)?;
        b.emit_jump_to_label(Opcode::IfNot, reg, 1, skip, P4::None, 0);
        b.free_temp(reg);
    }
    Ok(())
}

/// Reject any aggregate call inside `expr`, naming it.
pub(crate) fn reject_aggregates(expr: &Expr) -> Result<()> {
    match expr {
        Expr::Aggregate { func, .. } => Err(TesseraError::MisuseOfAggregate {
            name: func.name().to_owned(),
        }),
        Expr::Binary { left, right, .. } => {
            reject_aggregates(left)?;
            reject_aggregates(right)
        }
        _ => Ok(()),
    }
}
