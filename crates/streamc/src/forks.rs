//! Fan-out and discard materialization.
//!
//! Handshake values are point-to-point channels: each must be read by exactly one
//! consumer. [`materialize_forks_and_sinks`] restores that over a finished block,
//! [`dematerialize_forks_and_sinks`] strips a block back to plain multi-use values.

use std::collections::BTreeMap;

use crate::compile::LowerError;
use crate::ir::{BlockId, Graph, OpId, OpKind, ValueDef, ValueId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    pub forks: usize,
    pub discards: usize,
}

type UseMap = BTreeMap<ValueId, Vec<(OpId, usize)>>;

/// Values defined directly in `block`, arguments first, then op results in order.
fn defined_values(graph: &Graph, block: BlockId) -> Vec<ValueId> {
    let mut out = graph.block_args(block).to_vec();
    for &op in graph.block_ops(block) {
        out.extend_from_slice(graph.results(op));
    }
    out
}

fn use_map(graph: &Graph, block: BlockId) -> UseMap {
    let mut uses: UseMap = BTreeMap::new();
    for v in defined_values(graph, block) {
        uses.insert(v, Vec::new());
    }
    for op in graph.walk_ops(block) {
        for (i, &operand) in graph.operands(op).iter().enumerate() {
            if let Some(list) = uses.get_mut(&operand) {
                list.push((op, i));
            }
        }
    }
    uses
}

pub fn materialize_forks_and_sinks(
    graph: &mut Graph,
    block: BlockId,
) -> Result<MaterializeStats, LowerError> {
    let forks = add_fork_ops(graph, block)?;
    let discards = add_discard_ops(graph, block);
    Ok(MaterializeStats { forks, discards })
}

fn add_fork_ops(graph: &mut Graph, block: BlockId) -> Result<usize, LowerError> {
    let uses = use_map(graph, block);
    let mut count = 0;
    for (v, users) in uses {
        if users.len() < 2 {
            continue;
        }
        let pos = match graph.value(v).def {
            ValueDef::BlockArg { .. } => 0,
            ValueDef::OpResult { op, .. } => {
                graph.position(block, op).ok_or_else(|| {
                    LowerError::structural("forked value is not defined in the block")
                })? + 1
            }
        };
        let ty = graph.ty(v).clone();
        let fork = graph.insert_op_at(block, pos, OpKind::Fork, vec![v], &vec![ty; users.len()]);
        for (i, (user, index)) in users.into_iter().enumerate() {
            let out = graph.result(fork, i);
            graph.set_operand(user, index, out);
        }
        count += 1;
    }
    Ok(count)
}

fn add_discard_ops(graph: &mut Graph, block: BlockId) -> usize {
    let uses = use_map(graph, block);
    let mut count = 0;
    for (v, users) in uses {
        if users.is_empty() {
            graph.insert_op_before_terminator(block, OpKind::Discard, vec![v], &[]);
            count += 1;
        }
    }
    count
}

/// Removes every discard and fork in `block`, reconnecting fork outputs' consumers
/// to the forked value.
pub fn dematerialize_forks_and_sinks(graph: &mut Graph, block: BlockId) {
    let ops = graph.block_ops(block).to_vec();
    for op in ops {
        match graph.kind(op) {
            OpKind::Discard => graph.erase_op(op),
            OpKind::Fork => {
                let input = graph.operands(op)[0];
                let outs = graph.results(op).to_vec();
                for out in outs {
                    graph.replace_all_uses(out, input);
                }
                graph.erase_op(op);
            }
            _ => {}
        }
    }
}

pub fn verify_single_use(graph: &Graph, block: BlockId, unit: &str) -> Result<(), LowerError> {
    for (v, users) in use_map(graph, block) {
        if users.len() == 1 {
            continue;
        }
        let def = match graph.value(v).def {
            ValueDef::BlockArg { index, .. } => format!("argument {index}"),
            ValueDef::OpResult { op, index } => {
                format!("result {index} of {}", graph.kind(op).name())
            }
        };
        return Err(LowerError::structural(format!(
            "in {unit}: {def} ({}) has {} uses, expected exactly one",
            graph.ty(v),
            users.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::LowerErrorKind;
    use crate::ir::BinOp;
    use crate::types::Ty;

    fn sample() -> (Graph, BlockId) {
        let mut g = Graph::new();
        let b = g.new_block(&[Ty::i64(), Ty::i64(), Ty::None]);
        let args = g.block_args(b).to_vec();
        let sq = g.append_op(b, OpKind::Binary(BinOp::Mul), vec![args[0], args[0]], &[Ty::i64()]);
        let sq = g.result(sq, 0);
        g.append_op(b, OpKind::HsReturn, vec![sq, args[2]], &[]);
        (g, b)
    }

    #[test]
    fn fork_and_discard_are_inserted() {
        let (mut g, b) = sample();
        assert!(verify_single_use(&g, b, "t").is_err());
        let stats = materialize_forks_and_sinks(&mut g, b).expect("materialize");
        assert_eq!(stats, MaterializeStats { forks: 1, discards: 1 });
        verify_single_use(&g, b, "t").expect("single use");
        assert_eq!(g.kind(g.block_ops(b)[0]), &OpKind::Fork);
        let term = g.terminator(b).expect("terminator");
        assert_eq!(g.kind(term), &OpKind::HsReturn);
    }

    #[test]
    fn materialize_is_idempotent() {
        let (mut g, b) = sample();
        materialize_forks_and_sinks(&mut g, b).expect("materialize");
        let before = g.block_ops(b).to_vec();
        let stats = materialize_forks_and_sinks(&mut g, b).expect("materialize");
        assert_eq!(stats, MaterializeStats::default());
        assert_eq!(g.block_ops(b), before.as_slice());
    }

    #[test]
    fn dematerialize_restores_direct_uses() {
        let (mut g, b) = sample();
        materialize_forks_and_sinks(&mut g, b).expect("materialize");
        dematerialize_forks_and_sinks(&mut g, b);
        assert!(g
            .block_ops(b)
            .iter()
            .all(|&op| !matches!(g.kind(op), OpKind::Fork | OpKind::Discard)));
        let x = g.block_args(b)[0];
        assert_eq!(g.uses(x).len(), 2);
        let err = verify_single_use(&g, b, "t").expect_err("multi use again");
        assert_eq!(err.kind, LowerErrorKind::Structural);
    }
}
