//! Map, filter, split, combine and sink: one output activation per input activation.

use crate::compile::LowerError;
use crate::ir::{BlockId, Graph, OpId, OpKind, ValueId};
use crate::lower::{
    expect_stream_operands, finish_unit, new_unit_block, take_body, BlockBuilder, LoweringCtx,
};
use crate::types::Ty;

/// Body results minus the trailing control token, plus that token.
fn split_body_results(
    b: &BlockBuilder<'_>,
    op_name: &str,
    expected: usize,
) -> Result<(Vec<ValueId>, ValueId), LowerError> {
    let mut results = b.terminator_operands()?;
    if results.len() != expected + 1 {
        return Err(LowerError::legalization(format!(
            "{op_name} body yields {} value(s), expected {expected}",
            results.len().saturating_sub(1)
        )));
    }
    let ctrl = results.pop().ok_or_else(|| {
        LowerError::legalization(format!("{op_name} body does not return a control token"))
    })?;
    Ok((results, ctrl))
}

/// Output list `[pack(r0, eos), ctrl, pack(r1, eos), ctrl, ..., init]`.
fn pack_each(
    b: &mut BlockBuilder<'_>,
    results: &[ValueId],
    eos: ValueId,
    ctrl: ValueId,
    init: ValueId,
) -> Vec<ValueId> {
    let mut out = Vec::with_capacity(results.len() * 2 + 1);
    for &r in results {
        out.push(b.pack(r, eos));
        out.push(ctrl);
    }
    out.push(init);
    out
}

/// `(data, eos)` of the single input stream with the body merged onto `data`.
fn single_input_body(
    graph: &mut Graph,
    op: OpId,
) -> Result<(BlockId, ValueId, ValueId), LowerError> {
    expect_stream_operands(graph, op, Some(1))?;
    let body = take_body(graph, op)?;
    let block = new_unit_block(graph, op)?;
    let mut b = BlockBuilder::new(graph, block);
    let tuple_in = b.arg(0);
    let stream_ctrl = b.arg(1);
    let (data, eos) = b.unpack(tuple_in)?;
    graph.merge_block(body, block, &[data, stream_ctrl])?;
    Ok((block, data, eos))
}

pub fn lower_map(
    graph: &mut Graph,
    ctx: &mut LoweringCtx<'_>,
    op: OpId,
    enclosing: BlockId,
) -> Result<(), LowerError> {
    let (block, _data, eos) = single_input_body(graph, op)?;
    let mut b = BlockBuilder::new(graph, block);
    let init = b.last_arg();
    let (results, ctrl) = split_body_results(&b, "stream.map", 1)?;
    let outputs = pack_each(&mut b, &results, eos, ctrl, init);
    b.set_return(outputs);
    finish_unit(graph, ctx, op, enclosing, block)?;
    Ok(())
}

/// Suppressed activations drop both the payload and its control token; the EOS
/// activation always passes.
pub fn lower_filter(
    graph: &mut Graph,
    ctx: &mut LoweringCtx<'_>,
    op: OpId,
    enclosing: BlockId,
) -> Result<(), LowerError> {
    let (block, data, eos) = single_input_body(graph, op)?;
    let mut b = BlockBuilder::new(graph, block);
    let init = b.last_arg();
    let (results, ctrl) = split_body_results(&b, "stream.filter", 1)?;
    let cond = results[0];
    if b.graph.ty(cond) != &Ty::i1() {
        return Err(LowerError::type_conversion(format!(
            "stream.filter predicate must be i1, found {}",
            b.graph.ty(cond)
        )));
    }
    let tuple_out = b.pack(data, eos);
    let cond_or_eos = b.or(cond, eos);
    let (data_taken, _) = b.cond_br(cond_or_eos, tuple_out);
    let (ctrl_taken, _) = b.cond_br(cond_or_eos, ctrl);
    b.set_return(vec![data_taken, ctrl_taken, init]);
    finish_unit(graph, ctx, op, enclosing, block)?;
    Ok(())
}

pub fn lower_split(
    graph: &mut Graph,
    ctx: &mut LoweringCtx<'_>,
    op: OpId,
    enclosing: BlockId,
) -> Result<(), LowerError> {
    let arity = graph.results(op).len();
    let (block, _data, eos) = single_input_body(graph, op)?;
    let mut b = BlockBuilder::new(graph, block);
    let init = b.last_arg();
    let (results, ctrl) = split_body_results(&b, "stream.split", arity)?;
    let outputs = pack_each(&mut b, &results, eos, ctrl, init);
    b.set_return(outputs);
    finish_unit(graph, ctx, op, enclosing, block)?;
    Ok(())
}

/// Fires only when every input has an activation ready; the output EOS is the OR of
/// the input EOS flags at that joint activation.
pub fn lower_combine(
    graph: &mut Graph,
    ctx: &mut LoweringCtx<'_>,
    op: OpId,
    enclosing: BlockId,
) -> Result<(), LowerError> {
    expect_stream_operands(graph, op, None)?;
    let inputs = graph.operands(op).len();
    if inputs == 0 {
        return Err(LowerError::legalization(
            "stream.combine needs at least one input stream",
        ));
    }
    let arity = graph.results(op).len();
    let body = take_body(graph, op)?;
    let block = new_unit_block(graph, op)?;

    let mut b = BlockBuilder::new(graph, block);
    let mut body_inputs = Vec::with_capacity(inputs + 1);
    let mut eos_inputs = Vec::with_capacity(inputs);
    let mut ctrl_inputs = Vec::with_capacity(inputs);
    for i in 0..inputs {
        let tuple_in = b.arg(2 * i);
        let stream_ctrl = b.arg(2 * i + 1);
        let (data, eos) = b.unpack(tuple_in)?;
        body_inputs.push(data);
        eos_inputs.push(eos);
        ctrl_inputs.push(stream_ctrl);
    }
    let init = b.last_arg();
    let joined = b.value(OpKind::Join, ctrl_inputs, Ty::None);
    body_inputs.push(joined);
    graph.merge_block(body, block, &body_inputs)?;

    let mut b = BlockBuilder::new(graph, block);
    let (results, ctrl) = split_body_results(&b, "stream.combine", arity)?;
    let mut eos = eos_inputs[0];
    for &next in &eos_inputs[1..] {
        eos = b.or(eos, next);
    }
    let outputs = pack_each(&mut b, &results, eos, ctrl, init);
    b.set_return(outputs);
    finish_unit(graph, ctx, op, enclosing, block)?;
    Ok(())
}

/// Returns only the init control; the unused payload channels get their discards from
/// fan-out materialization.
pub fn lower_sink(
    graph: &mut Graph,
    ctx: &mut LoweringCtx<'_>,
    op: OpId,
    enclosing: BlockId,
) -> Result<(), LowerError> {
    expect_stream_operands(graph, op, Some(1))?;
    let block = new_unit_block(graph, op)?;
    let mut b = BlockBuilder::new(graph, block);
    let init = b.last_arg();
    b.set_return(vec![init]);
    finish_unit(graph, ctx, op, enclosing, block)?;
    Ok(())
}
