//! Shared machinery for the per-operator subcircuit builders.
//!
//! Each stream operator is rebuilt as a standalone handshake function (a synthesized
//! unit) and the operator itself is replaced by a `handshake.instance` of it.
//! Stateless builders live in `lower_stateless`, stateful ones in `lower_stateful`.

use crate::compile::{LowerError, PassOptions};
use crate::control::resolve_operands;
use crate::ir::{BinOp, BlockId, Func, FuncKind, Graph, OpId, OpKind, ValueId};
use crate::lower_stateful::{lower_create, lower_reduce};
use crate::lower_stateless::{lower_combine, lower_filter, lower_map, lower_sink, lower_split};
use crate::symbols::SymbolUniquer;
use crate::types::{lower_type, lower_types, Ty};

pub struct LoweringCtx<'a> {
    pub options: &'a PassOptions,
    pub uniquer: &'a mut SymbolUniquer,
    pub units: Vec<Func>,
}

impl<'a> LoweringCtx<'a> {
    pub fn new(options: &'a PassOptions, uniquer: &'a mut SymbolUniquer) -> Self {
        Self {
            options,
            uniquer,
            units: Vec::new(),
        }
    }
}

/// Rewrites one op of a function body. Ops that need no rewrite are left in place for
/// the legality check.
pub fn lower_op(
    graph: &mut Graph,
    ctx: &mut LoweringCtx<'_>,
    op: OpId,
    enclosing: BlockId,
) -> Result<(), LowerError> {
    match graph.kind(op).clone() {
        OpKind::Create { values } => lower_create(graph, ctx, op, enclosing, &values),
        OpKind::Map => lower_map(graph, ctx, op, enclosing),
        OpKind::Filter => lower_filter(graph, ctx, op, enclosing),
        OpKind::Reduce { init } => lower_reduce(graph, ctx, op, enclosing, init),
        OpKind::Split => lower_split(graph, ctx, op, enclosing),
        OpKind::Combine => lower_combine(graph, ctx, op, enclosing),
        OpKind::Sink => lower_sink(graph, ctx, op, enclosing),
        OpKind::Pack | OpKind::Unpack => lower_pack_unpack(graph, op),
        OpKind::Return => lower_return(graph, op, enclosing, ctx.options),
        _ => Ok(()),
    }
}

/// `stream.pack`/`stream.unpack` map one-to-one onto the handshake primitives.
pub fn lower_pack_unpack(graph: &mut Graph, op: OpId) -> Result<(), LowerError> {
    if let Some(&v) = graph.operands(op).iter().find(|&&v| graph.ty(v).is_stream()) {
        return Err(LowerError::type_conversion(format!(
            "{} cannot take a stream operand ({})",
            graph.kind(op).name(),
            graph.ty(v)
        )));
    }
    let kind = match graph.kind(op) {
        OpKind::Pack => OpKind::HsPack,
        _ => OpKind::HsUnpack,
    };
    graph.set_kind(op, kind);
    Ok(())
}

pub fn lower_return(
    graph: &mut Graph,
    op: OpId,
    enclosing: BlockId,
    options: &PassOptions,
) -> Result<(), LowerError> {
    let operands = resolve_operands(graph, op, enclosing, options)?;
    graph.set_kind(op, OpKind::HsReturn);
    graph.set_operands(op, operands);
    Ok(())
}

/// Appends ops to one block, ahead of its terminator once it has one.
pub struct BlockBuilder<'g> {
    pub graph: &'g mut Graph,
    pub block: BlockId,
}

impl<'g> BlockBuilder<'g> {
    pub fn new(graph: &'g mut Graph, block: BlockId) -> Self {
        Self { graph, block }
    }

    pub fn arg(&self, index: usize) -> ValueId {
        self.graph.block_args(self.block)[index]
    }

    pub fn last_arg(&self) -> ValueId {
        let args = self.graph.block_args(self.block);
        args[args.len() - 1]
    }

    pub fn op(&mut self, kind: OpKind, operands: Vec<ValueId>, result_tys: &[Ty]) -> OpId {
        self.graph
            .insert_op_before_terminator(self.block, kind, operands, result_tys)
    }

    pub fn value(&mut self, kind: OpKind, operands: Vec<ValueId>, ty: Ty) -> ValueId {
        let op = self.op(kind, operands, &[ty]);
        self.graph.result(op, 0)
    }

    pub fn constant(&mut self, value: i64, ty: Ty, trigger: ValueId) -> ValueId {
        self.value(OpKind::HsConstant { value }, vec![trigger], ty)
    }

    pub fn buffer(&mut self, slots: usize, init: Vec<i64>, input: ValueId) -> OpId {
        let ty = self.graph.ty(input).clone();
        self.op(OpKind::Buffer { slots, init }, vec![input], &[ty])
    }

    /// `(data, eos)` halves of an EOS-tagged payload tuple.
    pub fn unpack(&mut self, tuple: ValueId) -> Result<(ValueId, ValueId), LowerError> {
        let fields = match self.graph.ty(tuple).tuple_fields() {
            Some(fields) if fields.len() == 2 => fields.to_vec(),
            _ => {
                return Err(LowerError::type_conversion(format!(
                    "expected an EOS-tagged payload tuple, found {}",
                    self.graph.ty(tuple)
                )))
            }
        };
        let op = self.op(OpKind::HsUnpack, vec![tuple], &fields);
        Ok((self.graph.result(op, 0), self.graph.result(op, 1)))
    }

    pub fn pack(&mut self, data: ValueId, eos: ValueId) -> ValueId {
        let ty = Ty::Tuple(vec![self.graph.ty(data).clone(), self.graph.ty(eos).clone()]);
        self.value(OpKind::HsPack, vec![data, eos], ty)
    }

    /// `(true, false)` outputs of a conditional branch.
    pub fn cond_br(&mut self, cond: ValueId, data: ValueId) -> (ValueId, ValueId) {
        let ty = self.graph.ty(data).clone();
        let op = self.op(OpKind::CondBranch, vec![cond, data], &[ty.clone(), ty]);
        (self.graph.result(op, 0), self.graph.result(op, 1))
    }

    pub fn or(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.value(OpKind::Binary(BinOp::Or), vec![a, b], Ty::i1())
    }

    /// Replaces the block terminator (if any) with `handshake.return(operands)`.
    pub fn set_return(&mut self, operands: Vec<ValueId>) -> OpId {
        if let Some(term) = self.graph.terminator(self.block) {
            self.graph.erase_op(term);
        }
        self.graph
            .append_op(self.block, OpKind::HsReturn, operands, &[])
    }

    pub fn terminator_operands(&self) -> Result<Vec<ValueId>, LowerError> {
        let term = self
            .graph
            .terminator(self.block)
            .ok_or_else(|| LowerError::legalization("lowered body has no terminator"))?;
        Ok(self.graph.operands(term).to_vec())
    }
}

/// Entry block for a unit: the lowered operand channels plus a trailing init control.
pub fn new_unit_block(graph: &mut Graph, op: OpId) -> Result<BlockId, LowerError> {
    let operand_tys: Vec<Ty> = graph
        .operands(op)
        .iter()
        .map(|&v| graph.ty(v).clone())
        .collect();
    let mut arg_tys = lower_types(&operand_tys)?;
    arg_tys.push(Ty::None);
    Ok(graph.new_block(&arg_tys))
}

/// Detaches the single body block of `op`.
pub fn take_body(graph: &mut Graph, op: OpId) -> Result<BlockId, LowerError> {
    let mut regions = graph.take_regions(op);
    if regions.len() != 1 {
        return Err(LowerError::legalization(format!(
            "{} expects exactly one body region, found {}",
            graph.kind(op).name(),
            regions.len()
        )));
    }
    Ok(regions.remove(0))
}

pub fn expect_stream_operands(
    graph: &Graph,
    op: OpId,
    count: Option<usize>,
) -> Result<(), LowerError> {
    let operands = graph.operands(op);
    if let Some(count) = count {
        if operands.len() != count {
            return Err(LowerError::legalization(format!(
                "{} expects {count} stream operand(s), found {}",
                graph.kind(op).name(),
                operands.len()
            )));
        }
    }
    if let Some(&v) = operands.iter().find(|&&v| !graph.ty(v).is_stream()) {
        return Err(LowerError::legalization(format!(
            "{} operand must be a stream, found {}",
            graph.kind(op).name(),
            graph.ty(v)
        )));
    }
    Ok(())
}

/// Wraps `block` into a freshly named unit and swaps `op` for a call to it.
pub fn finish_unit(
    graph: &mut Graph,
    ctx: &mut LoweringCtx<'_>,
    op: OpId,
    enclosing: BlockId,
    block: BlockId,
) -> Result<String, LowerError> {
    let term = graph
        .terminator(block)
        .ok_or_else(|| LowerError::legalization("unit body has no terminator"))?;
    let result_types: Vec<Ty> = graph
        .operands(term)
        .iter()
        .map(|&v| graph.ty(v).clone())
        .collect();
    let operands = resolve_operands(graph, op, enclosing, ctx.options)?;
    let name = ctx.uniquer.unique_name(graph.kind(op));
    replace_with_instance(graph, op, &name, operands, &result_types)?;
    tracing::debug!(unit = %name, results = result_types.len(), "synthesized unit");
    ctx.units.push(Func {
        name: name.clone(),
        kind: FuncKind::Handshake,
        private: true,
        body: block,
        result_types,
    });
    Ok(name)
}

/// Inserts a call to `callee` where `op` stands, re-boxes each stream result from its
/// `(payload, control)` pair and erases `op`.
pub fn replace_with_instance(
    graph: &mut Graph,
    op: OpId,
    callee: &str,
    operands: Vec<ValueId>,
    result_types: &[Ty],
) -> Result<OpId, LowerError> {
    let old_results = graph.results(op).to_vec();
    if result_types.len() != old_results.len() * 2 + 1 {
        return Err(LowerError::legalization(format!(
            "unit {callee} yields {} values, expected {} for {} stream result(s)",
            result_types.len(),
            old_results.len() * 2 + 1,
            old_results.len()
        )));
    }
    let block = graph
        .op(op)
        .parent
        .ok_or_else(|| LowerError::structural("replaced op is not placed in a block"))?;
    let pos = graph
        .position(block, op)
        .ok_or_else(|| LowerError::structural("replaced op is missing from its block"))?;
    let instance = graph.insert_op_at(
        block,
        pos,
        OpKind::Instance {
            callee: callee.to_string(),
        },
        operands,
        result_types,
    );
    for (i, &old) in old_results.iter().enumerate() {
        let old_ty = graph.ty(old).clone();
        if !old_ty.is_stream() {
            return Err(LowerError::legalization(format!(
                "can only replace stream results, found {old_ty}"
            )));
        }
        if lower_type(&old_ty)? != result_types[2 * i..2 * i + 2] {
            return Err(LowerError::type_conversion(format!(
                "unit {callee} result {i} does not carry {old_ty}"
            )));
        }
        let tuple = graph.result(instance, 2 * i);
        let ctrl = graph.result(instance, 2 * i + 1);
        let cast = graph.insert_op_at(
            block,
            pos + 1 + i,
            OpKind::Cast,
            vec![tuple, ctrl],
            &[old_ty],
        );
        let boxed = graph.result(cast, 0);
        graph.replace_all_uses(old, boxed);
    }
    graph.erase_op(op);
    Ok(instance)
}
