//! Control-token resolution and operand unboxing for operator calls.
//!
//! Every synthesized unit takes one trailing init-control input and yields one trailing
//! control output. The control handed to a new call is found by walking backwards from
//! its first operand until a block argument (the block's trailing control argument) or
//! an earlier unit call (its trailing control result) is reached.

use crate::compile::{LowerError, PassOptions};
use crate::ir::{BlockId, Graph, OpId, OpKind, ValueDef, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSource {
    BlockArg(BlockId),
    Instance(OpId),
    Other(OpId),
}

pub fn classify(graph: &Graph, v: ValueId) -> ControlSource {
    match graph.value(v).def {
        ValueDef::BlockArg { block, .. } => ControlSource::BlockArg(block),
        ValueDef::OpResult { op, .. } => match graph.kind(op) {
            OpKind::Instance { .. } => ControlSource::Instance(op),
            _ => ControlSource::Other(op),
        },
    }
}

/// Trailing control argument of `block`.
pub fn block_control(graph: &Graph, block: BlockId) -> Result<ValueId, LowerError> {
    let ctrl = graph
        .block_args(block)
        .last()
        .copied()
        .ok_or_else(|| LowerError::structural("block has no trailing control argument"))?;
    if !graph.ty(ctrl).is_none() {
        return Err(LowerError::structural(format!(
            "last block argument should be a control token, found {}",
            graph.ty(ctrl)
        )));
    }
    Ok(ctrl)
}

/// Control token shared by `operands`, or the trailing control of `enclosing` when
/// there are none.
///
/// Only the first operand is followed; operands are assumed to share one control
/// lineage (see [`check_lineage`]).
pub fn resolve_control(
    graph: &Graph,
    operands: &[ValueId],
    enclosing: BlockId,
    max_depth: usize,
) -> Result<ValueId, LowerError> {
    match operands.first() {
        None => block_control(graph, enclosing),
        Some(&first) => resolve_from(graph, first, 0, max_depth),
    }
}

fn resolve_from(
    graph: &Graph,
    v: ValueId,
    depth: usize,
    max_depth: usize,
) -> Result<ValueId, LowerError> {
    if depth > max_depth {
        return Err(LowerError::precondition(format!(
            "control lineage deeper than max_control_depth={max_depth}"
        )));
    }
    match classify(graph, v) {
        ControlSource::BlockArg(block) => block_control(graph, block),
        ControlSource::Instance(op) => graph.results(op).last().copied().ok_or_else(|| {
            LowerError::structural("unit call without a trailing control result")
        }),
        ControlSource::Other(op) => {
            let Some(&next) = graph.operands(op).first() else {
                return Err(LowerError::precondition(format!(
                    "no control lineage: {} has no operands to follow",
                    graph.kind(op).name()
                )));
            };
            resolve_from(graph, next, depth + 1, max_depth)
        }
    }
}

/// Underlying `[payload, control]` channels of a boxed stream value; any other value
/// is returned as is.
pub fn resolve_operand(graph: &Graph, boxed: ValueId) -> Vec<ValueId> {
    match graph.defining_op(boxed) {
        Some(op) if matches!(graph.kind(op), OpKind::Cast) => graph.operands(op).to_vec(),
        _ => vec![boxed],
    }
}

/// Unboxed operands of `op` followed by exactly one control token.
pub fn resolve_operands(
    graph: &Graph,
    op: OpId,
    enclosing: BlockId,
    options: &PassOptions,
) -> Result<Vec<ValueId>, LowerError> {
    let groups: Vec<Vec<ValueId>> = graph
        .operands(op)
        .iter()
        .map(|&v| resolve_operand(graph, v))
        .collect();
    let mut out: Vec<ValueId> = groups.iter().flatten().copied().collect();
    check_lineage(graph, op, &groups, options)?;
    let ctrl = resolve_control(graph, &out, enclosing, options.max_control_depth)?;
    out.push(ctrl);
    Ok(out)
}

/// Flags operand groups whose control lineages diverge from the first group's.
pub fn check_lineage(
    graph: &Graph,
    op: OpId,
    groups: &[Vec<ValueId>],
    options: &PassOptions,
) -> Result<(), LowerError> {
    if groups.len() < 2 {
        return Ok(());
    }
    let mut lineages = Vec::with_capacity(groups.len());
    for group in groups {
        let Some(&first) = group.first() else {
            continue;
        };
        lineages.push(resolve_from(graph, first, 0, options.max_control_depth)?);
    }
    let Some((&head, rest)) = lineages.split_first() else {
        return Ok(());
    };
    let diverging = rest.iter().filter(|&&c| c != head).count();
    if diverging == 0 {
        return Ok(());
    }
    if options.strict_control_lineage {
        return Err(LowerError::precondition(format!(
            "{} operands resolve to {} distinct control tokens",
            graph.kind(op).name(),
            diverging + 1
        )));
    }
    tracing::warn!(
        op = graph.kind(op).name(),
        diverging,
        "operands do not share a control lineage; using the first operand's"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::LowerErrorKind;
    use crate::types::Ty;

    fn payload() -> Ty {
        Ty::Tuple(vec![Ty::i64(), Ty::i1()])
    }

    #[test]
    fn block_argument_resolves_to_trailing_control() {
        let mut g = Graph::new();
        let b = g.new_block(&[payload(), Ty::None, Ty::None]);
        let args = g.block_args(b).to_vec();
        let ctrl = resolve_control(&g, &[args[0]], b, 8).expect("resolve");
        assert_eq!(ctrl, args[2]);
        assert_eq!(resolve_control(&g, &[], b, 8).expect("resolve"), args[2]);
    }

    #[test]
    fn instance_resolves_to_last_result_through_other_ops() {
        let mut g = Graph::new();
        let b = g.new_block(&[Ty::None]);
        let init = g.block_args(b)[0];
        let call = g.append_op(
            b,
            OpKind::Instance {
                callee: "stream_create".to_string(),
            },
            vec![init],
            &[payload(), Ty::None, Ty::None],
        );
        let res = g.results(call).to_vec();
        let unpack = g.append_op(b, OpKind::HsUnpack, vec![res[0]], &[Ty::i64(), Ty::i1()]);
        let data = g.result(unpack, 0);
        assert_eq!(resolve_control(&g, &[data], b, 8).expect("resolve"), res[2]);
    }

    #[test]
    fn depth_guard_trips() {
        let mut g = Graph::new();
        let b = g.new_block(&[Ty::i64(), Ty::None]);
        let mut v = g.block_args(b)[0];
        for _ in 0..5 {
            let op = g.append_op(
                b,
                OpKind::Binary(crate::ir::BinOp::Add),
                vec![v, v],
                &[Ty::i64()],
            );
            v = g.result(op, 0);
        }
        let err = resolve_control(&g, &[v], b, 3).expect_err("too deep");
        assert_eq!(err.kind, LowerErrorKind::Precondition);
        assert!(resolve_control(&g, &[v], b, 5).is_ok());
    }

    #[test]
    fn boxed_value_unboxes_to_cast_inputs() {
        let mut g = Graph::new();
        let b = g.new_block(&[payload(), Ty::None, Ty::None]);
        let args = g.block_args(b).to_vec();
        let cast = g.append_op(
            b,
            OpKind::Cast,
            vec![args[0], args[1]],
            &[Ty::stream(Ty::i64())],
        );
        let boxed = g.result(cast, 0);
        assert_eq!(resolve_operand(&g, boxed), vec![args[0], args[1]]);
        assert_eq!(resolve_operand(&g, args[2]), vec![args[2]]);
    }
}
