//! Create and reduce: operators whose output depends on earlier activations.
//!
//! State lives only in sequential buffers. A register is a one-slot buffer whose
//! input is rebound, after its consumers exist, to a value computed from its own
//! output.

use crate::compile::LowerError;
use crate::ir::{BinOp, BlockId, CmpPred, Graph, OpId, OpKind};
use crate::lower::{
    expect_stream_operands, finish_unit, new_unit_block, take_body, BlockBuilder, LoweringCtx,
};
use crate::types::Ty;

/// Literal stream source.
///
/// Driven by the first init control token only; later init tokens are dropped by the
/// first-use register. Emits one activation per literal and then an EOS activation
/// carrying a zero payload, after which the internal control loop stops.
pub fn lower_create(
    graph: &mut Graph,
    ctx: &mut LoweringCtx<'_>,
    op: OpId,
    enclosing: BlockId,
    values: &[i64],
) -> Result<(), LowerError> {
    let result = graph
        .results(op)
        .first()
        .copied()
        .ok_or_else(|| LowerError::legalization("stream.create has no result"))?;
    let elem = match graph.ty(result).stream_element() {
        Some(elem @ Ty::Int(_)) => elem.clone(),
        Some(other) => {
            return Err(LowerError::precondition(format!(
                "stream.create only supports integer elements, found {other}"
            )))
        }
        None => {
            return Err(LowerError::legalization(format!(
                "stream.create must produce a stream, found {}",
                graph.ty(result)
            )))
        }
    };

    let block = graph.new_block(&[Ty::None]);
    let mut b = BlockBuilder::new(graph, block);
    let ctrl_in = b.arg(0);

    // First-use register: lets exactly one init token through.
    let false_val = b.constant(0, Ty::i1(), ctrl_in);
    let fst = b.buffer(1, vec![1], false_val);
    let fst = b.graph.result(fst, 0);
    let (use_ctrl, _) = b.cond_br(fst, ctrl_in);

    // Internal control loop. The placeholder is rebound once `finished` exists.
    let placeholder = b.op(OpKind::Never, vec![], &[Ty::None]);
    let placeholder_val = b.graph.result(placeholder, 0);
    let ctrl_buf = b.buffer(1, Vec::new(), placeholder_val);
    let ctrl_buf = b.graph.result(ctrl_buf, 0);
    let ctrl = b.value(OpKind::Merge, vec![use_ctrl, ctrl_buf], Ty::None);

    let bubble = b.constant(0, elem, ctrl);
    let reversed: Vec<i64> = values.iter().rev().copied().collect();
    let data_buf = b.buffer(values.len().max(1), reversed, bubble);
    let data = b.graph.result(data_buf, 0);

    let one = b.constant(1, Ty::i64(), ctrl);
    let size = b.constant(values.len() as i64, Ty::i64(), ctrl);
    let cnt_op = b.buffer(1, vec![0], one);
    let cnt = b.graph.result(cnt_op, 0);
    let finished = b.value(OpKind::Cmp(CmpPred::Eq), vec![cnt, size], Ty::i1());
    let new_cnt = b.value(OpKind::Binary(BinOp::Add), vec![cnt, one], Ty::i64());
    b.graph.set_operand(cnt_op, 0, new_cnt);

    let (_, keep_going) = b.cond_br(finished, ctrl);
    b.graph.replace_all_uses(placeholder_val, keep_going);
    b.graph.erase_op(placeholder);

    let tuple_out = b.pack(data, finished);
    b.set_return(vec![tuple_out, ctrl, ctrl_in]);
    finish_unit(graph, ctx, op, enclosing, block)?;
    Ok(())
}

/// Accumulates silently until EOS, then emits the accumulator twice: tagged
/// `eos=false` on the EOS activation and tagged `eos=true` right after it.
pub fn lower_reduce(
    graph: &mut Graph,
    ctx: &mut LoweringCtx<'_>,
    op: OpId,
    enclosing: BlockId,
    init: i64,
) -> Result<(), LowerError> {
    expect_stream_operands(graph, op, Some(1))?;
    let result = graph
        .results(op)
        .first()
        .copied()
        .ok_or_else(|| LowerError::legalization("stream.reduce has no result"))?;
    let acc_ty = graph
        .ty(result)
        .stream_element()
        .cloned()
        .ok_or_else(|| {
            LowerError::legalization(format!(
                "stream.reduce must produce a stream, found {}",
                graph.ty(result)
            ))
        })?;
    let width = ctx.options.buffer_width;
    if acc_ty != Ty::Int(width) {
        return Err(LowerError::precondition(format!(
            "stream.reduce accumulator must be i{width} to fit a sequential buffer, found {acc_ty}"
        )));
    }

    let body = take_body(graph, op)?;
    let body_term = graph
        .terminator(body)
        .ok_or_else(|| LowerError::legalization("stream.reduce body has no terminator"))?;
    let [acc_next, body_ctrl] = graph.operands(body_term) else {
        return Err(LowerError::legalization(format!(
            "stream.reduce body must yield exactly one accumulator, found {} value(s)",
            graph.operands(body_term).len().saturating_sub(1)
        )));
    };
    let (acc_next, body_ctrl) = (*acc_next, *body_ctrl);
    if graph.ty(acc_next) != &acc_ty {
        return Err(LowerError::type_conversion(format!(
            "stream.reduce body yields {}, expected {acc_ty}",
            graph.ty(acc_next)
        )));
    }

    let block = new_unit_block(graph, op)?;
    let mut b = BlockBuilder::new(graph, block);
    let tuple_in = b.arg(0);
    let stream_ctrl = b.arg(1);
    let init_ctrl = b.last_arg();
    let (data, eos) = b.unpack(tuple_in)?;

    let acc_op = b.buffer(1, vec![init], acc_next);
    let acc = b.graph.result(acc_op, 0);
    let (acc_out, acc_loop) = b.cond_br(eos, acc);
    let (eos_out, _) = b.cond_br(eos, eos);
    let (ctrl_out, _) = b.cond_br(eos, body_ctrl);

    graph.merge_block(body, block, &[acc_loop, data, stream_ctrl])?;

    let mut b = BlockBuilder::new(graph, block);
    let eos_false = b.constant(0, Ty::i1(), ctrl_out);
    let tuple_val = b.pack(acc_out, eos_false);
    let tuple_eos = b.pack(acc_out, eos_out);

    // Two-deep select register: first the value, then the EOS tuple.
    let bubble = b.constant(0, Ty::Int(32), ctrl_out);
    let select = b.buffer(2, vec![1, 0], bubble);
    let select = b.graph.result(select, 0);
    let tuple_ty = b.graph.ty(tuple_val).clone();
    let tuple_out = b.value(OpKind::Mux, vec![select, tuple_val, tuple_eos], tuple_ty);
    let ctrl_mux = b.value(OpKind::Mux, vec![select, ctrl_out, ctrl_out], Ty::None);
    b.set_return(vec![tuple_out, ctrl_mux, init_ctrl]);
    finish_unit(graph, ctx, op, enclosing, block)?;
    Ok(())
}
