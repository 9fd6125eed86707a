//! Straight-line operator bodies to dataflow form.
//!
//! The body block gains a trailing control argument; constants become control-triggered
//! handshake constants and the `stream.yield` terminator becomes a `handshake.return`
//! that also hands the control token back. Output is in single-use form.

use crate::compile::LowerError;
use crate::forks::{materialize_forks_and_sinks, MaterializeStats};
use crate::ir::{BlockId, Graph, OpKind};
use crate::types::Ty;

pub fn lower_body(graph: &mut Graph, block: BlockId) -> Result<MaterializeStats, LowerError> {
    let ops = graph.block_ops(block).to_vec();
    let Some((&term, rest)) = ops.split_last() else {
        return Err(LowerError::legalization("operator body is empty"));
    };
    if !matches!(graph.kind(term), OpKind::Yield) {
        return Err(LowerError::legalization(format!(
            "operator body must end in stream.yield, found {}",
            graph.kind(term).name()
        )));
    }
    for &op in rest {
        if !graph.op(op).regions.is_empty() {
            return Err(LowerError::unsupported(format!(
                "nested regions in operator bodies are not supported ({})",
                graph.kind(op).name()
            )));
        }
        match graph.kind(op) {
            OpKind::Constant { .. }
            | OpKind::Binary(_)
            | OpKind::Cmp(_)
            | OpKind::Select
            | OpKind::Pack
            | OpKind::Unpack => {}
            other => {
                return Err(LowerError::unsupported(format!(
                    "{} cannot appear in an operator body",
                    other.name()
                )))
            }
        }
    }

    let ctrl = graph.add_block_arg(block, Ty::None);
    for &op in rest {
        if let OpKind::Constant { value } = *graph.kind(op) {
            graph.set_kind(op, OpKind::HsConstant { value });
            graph.set_operands(op, vec![ctrl]);
        }
    }
    let mut operands = graph.operands(term).to_vec();
    operands.push(ctrl);
    graph.set_kind(term, OpKind::HsReturn);
    graph.set_operands(term, operands);

    materialize_forks_and_sinks(graph, block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::LowerErrorKind;
    use crate::forks::verify_single_use;
    use crate::ir::BinOp;

    #[test]
    fn constants_are_triggered_by_body_control() {
        let mut g = Graph::new();
        let b = g.new_block(&[Ty::i64()]);
        let x = g.block_args(b)[0];
        let c = g.append_op(b, OpKind::Constant { value: 2 }, vec![], &[Ty::i64()]);
        let cv = g.result(c, 0);
        let mul = g.append_op(b, OpKind::Binary(BinOp::Mul), vec![x, cv], &[Ty::i64()]);
        let y = g.result(mul, 0);
        g.append_op(b, OpKind::Yield, vec![y], &[]);

        lower_body(&mut g, b).expect("lower body");
        assert_eq!(g.block_args(b).len(), 2);
        assert_eq!(g.kind(c), &OpKind::HsConstant { value: 2 });
        let term = g.terminator(b).expect("terminator");
        assert_eq!(g.kind(term), &OpKind::HsReturn);
        assert_eq!(g.operands(term).len(), 2);
        verify_single_use(&g, b, "body").expect("single use");
    }

    #[test]
    fn missing_yield_is_rejected() {
        let mut g = Graph::new();
        let b = g.new_block(&[Ty::i64()]);
        let x = g.block_args(b)[0];
        g.append_op(b, OpKind::Binary(BinOp::Add), vec![x, x], &[Ty::i64()]);
        let err = lower_body(&mut g, b).expect_err("no yield");
        assert_eq!(err.kind, LowerErrorKind::Legalization);
    }

    #[test]
    fn stream_ops_in_body_are_unsupported() {
        let mut g = Graph::new();
        let b = g.new_block(&[Ty::i64()]);
        let x = g.block_args(b)[0];
        g.append_op(b, OpKind::Sink, vec![x], &[]);
        g.append_op(b, OpKind::Yield, vec![x], &[]);
        let err = lower_body(&mut g, b).expect_err("sink in body");
        assert_eq!(err.kind, LowerErrorKind::Unsupported);
    }
}
