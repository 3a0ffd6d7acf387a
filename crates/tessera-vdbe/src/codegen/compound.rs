//! UNION and UNION ALL.
//!
//! Arms are applied left to right. Every arm up to and including the last
//! UNION feeds one ephemeral index, which collapses duplicate rows. Arms
//! after it (all UNION ALL) append to an ephemeral rowid table, into which
//! the index is drained first. The final structure is then scanned like a
//! one-table SELECT, so ORDER BY, LIMIT and OFFSET work unchanged.

use tessera_ast::{ColumnName, CompoundOp, Expr, SelectStatement};
use tessera_error::{Result, TesseraError};
use tessera_types::opcode::{Opcode, P4};

use super::schema::SchemaLookup;
use super::select::{SelectDest, SelectPlan, emit_plan, ordinal, plan_limit, plan_select};
use crate::ProgramBuilder;

pub(crate) fn emit_compound<S: SchemaLookup + ?Sized>(
    b: &mut ProgramBuilder,
    stmt: &SelectStatement,
    schema: &S,
    dest: SelectDest,
) -> Result<Vec<String>> {
    if let Some((op, _)) = stmt
        .compounds
        .iter()
        .find(|(op, _)| matches!(op, CompoundOp::Intersect | CompoundOp::Except))
    {
        return Err(TesseraError::Unsupported {
            construct: op.as_str().to_owned(),
        });
    }

    let first = plan_select(b, &stmt.core, &[], None, schema)?;
    let width = first.width()?;
    let mut arms = vec![first];
    for (op, core) in &stmt.compounds {
        let plan = plan_select(b, core, &[], None, schema)?;
        if plan.width()? != width {
            return Err(TesseraError::CompoundArity {
                operator: op.as_str().to_owned(),
            });
        }
        arms.push(plan);
    }
    let names = arms[0].names.clone();

    // Compound ORDER BY names a result column, never a table column.
    let order_columns = stmt
        .order_by
        .iter()
        .enumerate()
        .map(|(i, term)| {
            let column = match &term.expr {
                Expr::Integer(k) => usize::try_from(*k)
                    .ok()
                    .filter(|k| (1..=names.len()).contains(k))
                    .map(|k| k - 1),
                Expr::Column(ColumnName {
                    table: None,
                    column,
                }) => names.iter().position(|n| n.eq_ignore_ascii_case(column)),
                _ => None,
            };
            column
                .map(|c| (c, term.direction))
                .ok_or_else(|| TesseraError::OrderByTermMismatch {
                    ordinal: ordinal(i + 1),
                })
        })
        .collect::<Result<Vec<_>>>()?;
    let (limit, offset) = plan_limit(stmt.limit.as_ref())?;

    // Arm i joins arm i-1 through compounds[i-1].
    let last_union = stmt
        .compounds
        .iter()
        .rposition(|(op, _)| *op == CompoundOp::Union)
        .map(|i| i + 1);

    let mut opened = Vec::new();
    let mut final_cursor = None;
    let mut remaining = &arms[..];

    if let Some(last) = last_union {
        let set = b.alloc_cursor();
        b.emit_op(
            Opcode::OpenEphemeral,
            set,
            width,
            0,
            P4::SortOrder("+".repeat(names.len())),
            0,
        );
        opened.push(set);
        for arm in &arms[..=last] {
            emit_plan(b, arm, SelectDest::Set { cursor: set })?;
        }
        remaining = &arms[last + 1..];
        final_cursor = Some(set);
    }

    if !remaining.is_empty() {
        let table = b.alloc_cursor();
        b.emit_op(Opcode::OpenEphemeral, table, width, 0, P4::None, 0);
        opened.push(table);
        if let Some(set) = final_cursor {
            let drain = SelectPlan::scan_ephemeral(set, names.clone());
            emit_plan(b, &drain, SelectDest::Table { cursor: table })?;
        }
        for arm in remaining {
            emit_plan(b, arm, SelectDest::Table { cursor: table })?;
        }
        final_cursor = Some(table);
    }

    let Some(final_cursor) = final_cursor else {
        return Err(TesseraError::internal("compound with no arms"));
    };
    let mut output = SelectPlan::scan_ephemeral(final_cursor, names.clone());
    output.order_by = order_columns
        .into_iter()
        .map(|(column, dir)| {
            (
                Expr::ColumnRef {
                    cursor: final_cursor,
                    column,
                },
                dir,
            )
        })
        .collect();
    output.limit = limit;
    output.offset = offset;
    emit_plan(b, &output, dest)?;

    for cursor in opened {
        b.emit_op(Opcode::Close, cursor, 0, 0, P4::None, 0);
    }
    tracing::debug!(
        arms = arms.len(),
        deduplicated = last_union.map_or(0, |l| l + 1),
        "codegen.select.compound"
    );
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::CodegenContext;
    use crate::codegen::select::codegen_select;
    use crate::codegen::test_support::*;
    use tessera_ast::{LimitClause, OrderingTerm, ResultColumn, SelectCore, TableRef};

    fn core(column: &str, table: &str) -> SelectCore {
        SelectCore {
            columns: vec![ResultColumn::expr(Expr::column(column))],
            from: vec![TableRef::new(table)],
            ..SelectCore::default()
        }
    }

    fn compound(ops: &[CompoundOp]) -> SelectStatement {
        let mut stmt = SelectStatement::from_core(core("id", "users"));
        for op in ops {
            stmt.compounds.push((*op, core("user_id", "orders")));
        }
        stmt
    }

    fn compile(stmt: &SelectStatement) -> Result<crate::VdbeProgram> {
        let schema = test_schema();
        codegen_select(stmt, &schema, &CodegenContext::default()).map(|c| c.program)
    }

    #[test]
    fn test_union_collapses_through_an_index() {
        let prog = compile(&compound(&[CompoundOp::Union])).unwrap();
        assert_well_formed(&prog);
        assert_eq!(prog.count(Opcode::OpenEphemeral), 1);
        // Both arms insert into the set; the drain emits rows.
        assert_eq!(prog.count(Opcode::IdxInsert), 2);
        assert_eq!(prog.count(Opcode::ResultRow), 1);
        let open = prog
            .ops()
            .iter()
            .find(|op| op.opcode == Opcode::OpenEphemeral)
            .unwrap();
        assert_eq!(open.p4, P4::SortOrder("+".to_owned()));
    }

    #[test]
    fn test_union_all_appends_to_a_table() {
        let prog = compile(&compound(&[CompoundOp::UnionAll])).unwrap();
        assert_well_formed(&prog);
        assert_eq!(prog.count(Opcode::OpenEphemeral), 1);
        assert_eq!(prog.count(Opcode::IdxInsert), 0);
        assert_eq!(prog.count(Opcode::NewRowid), 2);
        assert_eq!(prog.count(Opcode::Insert), 2);
    }

    #[test]
    fn test_mixed_chain_drains_set_into_table() {
        let prog = compile(&compound(&[CompoundOp::Union, CompoundOp::UnionAll])).unwrap();
        assert_well_formed(&prog);
        assert_eq!(prog.count(Opcode::OpenEphemeral), 2);
        assert_eq!(prog.count(Opcode::IdxInsert), 2);
        // Drain of the set plus the trailing arm.
        assert_eq!(prog.count(Opcode::Insert), 2);

        // A UNION after UNION ALL dedups the whole prefix.
        let prog = compile(&compound(&[CompoundOp::UnionAll, CompoundOp::Union])).unwrap();
        assert_eq!(prog.count(Opcode::OpenEphemeral), 1);
        assert_eq!(prog.count(Opcode::IdxInsert), 3);
    }

    #[test]
    fn test_order_by_and_limit_apply_to_the_whole_compound() {
        let mut stmt = compound(&[CompoundOp::UnionAll]);
        stmt.order_by = vec![OrderingTerm::desc(Expr::Integer(1))];
        stmt.limit = Some(LimitClause {
            limit: Expr::Integer(3),
            offset: None,
        });
        let prog = compile(&stmt).unwrap();
        assert_well_formed(&prog);
        assert!(has_opcodes(
            &prog,
            &[
                Opcode::SorterOpen,
                Opcode::SorterSort,
                Opcode::ResultRow,
                Opcode::DecrJumpZero,
                Opcode::SorterNext,
            ]
        ));

        stmt.order_by = vec![OrderingTerm::asc(Expr::column("ID"))];
        assert!(compile(&stmt).is_ok());
        stmt.order_by = vec![OrderingTerm::asc(Expr::column("email"))];
        assert_eq!(
            compile(&stmt).unwrap_err(),
            TesseraError::OrderByTermMismatch {
                ordinal: "1st".to_owned()
            }
        );
    }

    #[test]
    fn test_intersect_and_except_are_rejected() {
        for op in [CompoundOp::Intersect, CompoundOp::Except] {
            let err = compile(&compound(&[CompoundOp::Union, op])).unwrap_err();
            assert_eq!(
                err,
                TesseraError::Unsupported {
                    construct: op.as_str().to_owned()
                }
            );
        }
    }

    #[test]
    fn test_arms_must_agree_on_width() {
        let mut stmt = compound(&[]);
        let mut wide = core("id", "orders");
        wide.columns.push(ResultColumn::expr(Expr::column("amount")));
        stmt.compounds.push((CompoundOp::UnionAll, wide));
        assert_eq!(
            compile(&stmt).unwrap_err(),
            TesseraError::CompoundArity {
                operator: "UNION ALL".to_owned()
            }
        );
    }
}
