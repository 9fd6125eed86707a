//! Arena-backed IR shared by the stream input form and the handshake output form.
//!
//! Values, operations and blocks live in three flat arenas owned by a [`Graph`] and are
//! referred to by index. Every region is a single block; an operation owning a body
//! (map, filter, ...) keeps the block id in `regions`.

use std::collections::BTreeMap;

use crate::compile::LowerError;
use crate::types::Ty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    BlockArg { block: BlockId, index: usize },
    OpResult { op: OpId, index: usize },
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: Ty,
    pub def: ValueDef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    DivS,
    RemS,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
}

impl BinOp {
    pub const ALL: [BinOp; 10] = [
        BinOp::Add,
        BinOp::Sub,
        BinOp::Mul,
        BinOp::DivS,
        BinOp::RemS,
        BinOp::And,
        BinOp::Or,
        BinOp::Xor,
        BinOp::Shl,
        BinOp::ShrS,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BinOp::Add => "arith.addi",
            BinOp::Sub => "arith.subi",
            BinOp::Mul => "arith.muli",
            BinOp::DivS => "arith.divsi",
            BinOp::RemS => "arith.remsi",
            BinOp::And => "arith.andi",
            BinOp::Or => "arith.ori",
            BinOp::Xor => "arith.xori",
            BinOp::Shl => "arith.shli",
            BinOp::ShrS => "arith.shrsi",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl CmpPred {
    pub fn name(self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Slt => "slt",
            CmpPred::Sle => "sle",
            CmpPred::Sgt => "sgt",
            CmpPred::Sge => "sge",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "eq" => Some(CmpPred::Eq),
            "ne" => Some(CmpPred::Ne),
            "slt" => Some(CmpPred::Slt),
            "sle" => Some(CmpPred::Sle),
            "sgt" => Some(CmpPred::Sgt),
            "sge" => Some(CmpPred::Sge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Stream,
    Func,
    Arith,
    Handshake,
    Builtin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Create { values: Vec<i64> },
    Map,
    Filter,
    Reduce { init: i64 },
    Split,
    Combine,
    Sink,
    Pack,
    Unpack,
    Yield,

    Return,

    Constant { value: i64 },
    Binary(BinOp),
    Cmp(CmpPred),
    Select,

    /// Emits `value` once per token on its single control operand.
    HsConstant { value: i64 },
    HsPack,
    HsUnpack,
    /// Sequential buffer. `init` is stored in handshake order: the last entry is
    /// the first token emitted.
    Buffer { slots: usize, init: Vec<i64> },
    CondBranch,
    Merge,
    Join,
    Mux,
    Never,
    Instance { callee: String },
    HsReturn,
    Discard,
    Fork,

    /// Boxes the lowered channels of a stream value back into one stream-typed value
    /// while conversion is in flight.
    Cast,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Create { .. } => "stream.create",
            OpKind::Map => "stream.map",
            OpKind::Filter => "stream.filter",
            OpKind::Reduce { .. } => "stream.reduce",
            OpKind::Split => "stream.split",
            OpKind::Combine => "stream.combine",
            OpKind::Sink => "stream.sink",
            OpKind::Pack => "stream.pack",
            OpKind::Unpack => "stream.unpack",
            OpKind::Yield => "stream.yield",
            OpKind::Return => "func.return",
            OpKind::Constant { .. } => "arith.constant",
            OpKind::Binary(op) => op.name(),
            OpKind::Cmp(_) => "arith.cmpi",
            OpKind::Select => "arith.select",
            OpKind::HsConstant { .. } => "handshake.constant",
            OpKind::HsPack => "handshake.pack",
            OpKind::HsUnpack => "handshake.unpack",
            OpKind::Buffer { .. } => "handshake.buffer",
            OpKind::CondBranch => "handshake.cond_br",
            OpKind::Merge => "handshake.merge",
            OpKind::Join => "handshake.join",
            OpKind::Mux => "handshake.mux",
            OpKind::Never => "handshake.never",
            OpKind::Instance { .. } => "handshake.instance",
            OpKind::HsReturn => "handshake.return",
            OpKind::Discard => "handshake.sink",
            OpKind::Fork => "handshake.fork",
            OpKind::Cast => "builtin.unrealized_conversion_cast",
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            OpKind::Create { .. }
            | OpKind::Map
            | OpKind::Filter
            | OpKind::Reduce { .. }
            | OpKind::Split
            | OpKind::Combine
            | OpKind::Sink
            | OpKind::Pack
            | OpKind::Unpack
            | OpKind::Yield => Dialect::Stream,
            OpKind::Return => Dialect::Func,
            OpKind::Constant { .. } | OpKind::Binary(_) | OpKind::Cmp(_) | OpKind::Select => {
                Dialect::Arith
            }
            OpKind::Cast => Dialect::Builtin,
            _ => Dialect::Handshake,
        }
    }

    /// Stream operators that carry a user-supplied body.
    pub fn has_body(&self) -> bool {
        matches!(
            self,
            OpKind::Map | OpKind::Filter | OpKind::Reduce { .. } | OpKind::Split | OpKind::Combine
        )
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, OpKind::Yield | OpKind::Return | OpKind::HsReturn)
    }
}

#[derive(Debug, Clone)]
pub struct OpData {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub regions: Vec<BlockId>,
    pub parent: Option<BlockId>,
    pub erased: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BlockData {
    pub args: Vec<ValueId>,
    pub ops: Vec<OpId>,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    values: Vec<ValueData>,
    ops: Vec<OpData>,
    blocks: Vec<BlockData>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_block(&mut self, arg_tys: &[Ty]) -> BlockId {
        let block = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData::default());
        for ty in arg_tys {
            self.add_block_arg(block, ty.clone());
        }
        block
    }

    pub fn add_block_arg(&mut self, block: BlockId, ty: Ty) -> ValueId {
        let index = self.blocks[block.index()].args.len();
        let v = self.new_value(ty, ValueDef::BlockArg { block, index });
        self.blocks[block.index()].args.push(v);
        v
    }

    /// Replaces the argument list of `block`. Old arguments stay in the arena and must
    /// have been rewired by the caller.
    pub fn reset_block_args(&mut self, block: BlockId, arg_tys: &[Ty]) -> Vec<ValueId> {
        self.blocks[block.index()].args.clear();
        arg_tys
            .iter()
            .map(|ty| self.add_block_arg(block, ty.clone()))
            .collect()
    }

    fn new_value(&mut self, ty: Ty, def: ValueDef) -> ValueId {
        let v = ValueId(self.values.len() as u32);
        self.values.push(ValueData { ty, def });
        v
    }

    pub fn block_args(&self, block: BlockId) -> &[ValueId] {
        &self.blocks[block.index()].args
    }

    pub fn block_ops(&self, block: BlockId) -> &[OpId] {
        &self.blocks[block.index()].ops
    }

    pub fn op(&self, op: OpId) -> &OpData {
        &self.ops[op.index()]
    }

    pub fn kind(&self, op: OpId) -> &OpKind {
        &self.ops[op.index()].kind
    }

    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v.index()]
    }

    pub fn ty(&self, v: ValueId) -> &Ty {
        &self.values[v.index()].ty
    }

    pub fn operands(&self, op: OpId) -> &[ValueId] {
        &self.ops[op.index()].operands
    }

    pub fn results(&self, op: OpId) -> &[ValueId] {
        &self.ops[op.index()].results
    }

    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        self.ops[op.index()].results[index]
    }

    pub fn defining_op(&self, v: ValueId) -> Option<OpId> {
        match self.values[v.index()].def {
            ValueDef::OpResult { op, .. } => Some(op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    pub fn owner_block(&self, v: ValueId) -> Option<BlockId> {
        match self.values[v.index()].def {
            ValueDef::BlockArg { block, .. } => Some(block),
            ValueDef::OpResult { op, .. } => self.ops[op.index()].parent,
        }
    }

    /// Creates an operation that is not yet placed in any block.
    pub fn create_op(&mut self, kind: OpKind, operands: Vec<ValueId>, result_tys: &[Ty]) -> OpId {
        let op = OpId(self.ops.len() as u32);
        let results = result_tys
            .iter()
            .enumerate()
            .map(|(index, ty)| self.new_value(ty.clone(), ValueDef::OpResult { op, index }))
            .collect();
        self.ops.push(OpData {
            kind,
            operands,
            results,
            regions: Vec::new(),
            parent: None,
            erased: false,
        });
        op
    }

    pub fn append_op(
        &mut self,
        block: BlockId,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_tys: &[Ty],
    ) -> OpId {
        let op = self.create_op(kind, operands, result_tys);
        self.place_op(block, self.blocks[block.index()].ops.len(), op);
        op
    }

    pub fn insert_op_at(
        &mut self,
        block: BlockId,
        pos: usize,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_tys: &[Ty],
    ) -> OpId {
        let op = self.create_op(kind, operands, result_tys);
        self.place_op(block, pos, op);
        op
    }

    /// Inserts before the block terminator, or at the end when there is none yet.
    pub fn insert_op_before_terminator(
        &mut self,
        block: BlockId,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_tys: &[Ty],
    ) -> OpId {
        let pos = match self.terminator(block) {
            Some(term) => self.position(block, term).unwrap_or(0),
            None => self.blocks[block.index()].ops.len(),
        };
        self.insert_op_at(block, pos, kind, operands, result_tys)
    }

    fn place_op(&mut self, block: BlockId, pos: usize, op: OpId) {
        self.ops[op.index()].parent = Some(block);
        self.blocks[block.index()].ops.insert(pos, op);
    }

    pub fn position(&self, block: BlockId, op: OpId) -> Option<usize> {
        self.blocks[block.index()].ops.iter().position(|&o| o == op)
    }

    pub fn attach_region(&mut self, op: OpId, block: BlockId) {
        self.ops[op.index()].regions.push(block);
    }

    pub fn take_regions(&mut self, op: OpId) -> Vec<BlockId> {
        std::mem::take(&mut self.ops[op.index()].regions)
    }

    pub fn terminator(&self, block: BlockId) -> Option<OpId> {
        let last = *self.blocks[block.index()].ops.last()?;
        self.ops[last.index()].kind.is_terminator().then_some(last)
    }

    pub fn set_kind(&mut self, op: OpId, kind: OpKind) {
        self.ops[op.index()].kind = kind;
    }

    pub fn set_operand(&mut self, op: OpId, index: usize, v: ValueId) {
        self.ops[op.index()].operands[index] = v;
    }

    pub fn set_operands(&mut self, op: OpId, operands: Vec<ValueId>) {
        self.ops[op.index()].operands = operands;
    }

    pub fn live_ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.ops
            .iter()
            .enumerate()
            .filter(|(_, data)| !data.erased)
            .map(|(i, _)| OpId(i as u32))
    }

    /// Ops that can read `v`: those of its owning block and the blocks nested under it.
    /// Values of unplaced ops fall back to the whole arena.
    fn candidate_users(&self, v: ValueId) -> Vec<OpId> {
        match self.owner_block(v) {
            Some(block) => self.walk_ops(block),
            None => self.live_ops().collect(),
        }
    }

    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        for op in self.candidate_users(old) {
            for operand in self.ops[op.index()].operands.iter_mut() {
                if *operand == old {
                    *operand = new;
                }
            }
        }
    }

    /// Every `(op, operand index)` that reads `v`.
    pub fn uses(&self, v: ValueId) -> Vec<(OpId, usize)> {
        let mut out = Vec::new();
        for op in self.candidate_users(v) {
            for (i, &operand) in self.ops[op.index()].operands.iter().enumerate() {
                if operand == v {
                    out.push((op, i));
                }
            }
        }
        out
    }

    /// Unlinks `op` from its block and marks it erased. Uses of its results are left
    /// to the caller.
    pub fn erase_op(&mut self, op: OpId) {
        if let Some(block) = self.ops[op.index()].parent.take() {
            self.blocks[block.index()].ops.retain(|&o| o != op);
        }
        let regions = std::mem::take(&mut self.ops[op.index()].regions);
        for block in regions {
            let nested: Vec<OpId> = self.blocks[block.index()].ops.clone();
            for inner in nested {
                self.erase_op(inner);
            }
        }
        self.ops[op.index()].erased = true;
    }

    /// Moves every op of `src` to the end of `dst`, substituting `src`'s arguments
    /// with `replacements`.
    pub fn merge_block(
        &mut self,
        src: BlockId,
        dst: BlockId,
        replacements: &[ValueId],
    ) -> Result<(), LowerError> {
        let args = self.blocks[src.index()].args.clone();
        if args.len() != replacements.len() {
            return Err(LowerError::legalization(format!(
                "body expects {} arguments but {} values are available",
                args.len(),
                replacements.len()
            )));
        }
        let ops = std::mem::take(&mut self.blocks[src.index()].ops);
        for op in ops {
            self.ops[op.index()].parent = Some(dst);
            self.blocks[dst.index()].ops.push(op);
        }
        // Builders may already have wired `src`'s arguments into ops of `dst`.
        let subst: BTreeMap<ValueId, ValueId> =
            args.iter().copied().zip(replacements.iter().copied()).collect();
        for op in self.walk_ops(dst) {
            for operand in self.ops[op.index()].operands.iter_mut() {
                if let Some(&repl) = subst.get(operand) {
                    *operand = repl;
                }
            }
        }
        Ok(())
    }

    /// All live ops of `block` and, recursively, of the blocks their regions own.
    pub fn walk_ops(&self, block: BlockId) -> Vec<OpId> {
        let mut out = Vec::new();
        self.walk_into(block, &mut out);
        out
    }

    fn walk_into(&self, block: BlockId, out: &mut Vec<OpId>) {
        for &op in &self.blocks[block.index()].ops {
            out.push(op);
            for &region in &self.ops[op.index()].regions {
                self.walk_into(region, out);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    /// Function over stream values, before lowering.
    Stream,
    /// Handshake dataflow function (converted or synthesized).
    Handshake,
}

#[derive(Debug, Clone)]
pub struct Func {
    pub name: String,
    pub kind: FuncKind,
    pub private: bool,
    pub body: BlockId,
    pub result_types: Vec<Ty>,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub graph: Graph,
    pub funcs: Vec<Func>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn func(&self, name: &str) -> Option<&Func> {
        self.funcs.iter().find(|f| f.name == name)
    }

    pub fn arg_types(&self, func: &Func) -> Vec<Ty> {
        self.graph
            .block_args(func.body)
            .iter()
            .map(|&v| self.graph.ty(v).clone())
            .collect()
    }

    pub fn symbol_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.funcs.iter().map(|f| f.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_block_rewires_arguments() {
        let mut g = Graph::new();
        let dst = g.new_block(&[Ty::i64()]);
        let x = g.block_args(dst)[0];
        let src = g.new_block(&[Ty::i64()]);
        let y = g.block_args(src)[0];
        let add = g.append_op(src, OpKind::Binary(BinOp::Add), vec![y, y], &[Ty::i64()]);
        g.merge_block(src, dst, &[x]).expect("merge");
        assert_eq!(g.block_ops(dst), &[add]);
        assert_eq!(g.operands(add), &[x, x]);
        assert_eq!(g.uses(x).len(), 2);
        assert!(g.block_ops(src).is_empty());
    }

    #[test]
    fn merge_block_rewires_arguments_already_read_in_destination() {
        let mut g = Graph::new();
        let dst = g.new_block(&[Ty::i64()]);
        let x = g.block_args(dst)[0];
        let src = g.new_block(&[Ty::i64()]);
        let y = g.block_args(src)[0];
        // Wired before the merge, as stateful builders do with body arguments.
        let early = g.append_op(dst, OpKind::Binary(BinOp::Mul), vec![y, x], &[Ty::i64()]);
        g.append_op(src, OpKind::Yield, vec![y], &[]);
        g.merge_block(src, dst, &[x]).expect("merge");
        assert_eq!(g.operands(early), &[x, x]);
        assert_eq!(g.uses(x).len(), 3);
        assert!(g.uses(y).is_empty());
    }

    #[test]
    fn replace_all_uses_reaches_nested_regions() {
        let mut g = Graph::new();
        let outer = g.new_block(&[Ty::i64(), Ty::i64()]);
        let (a, b) = (g.block_args(outer)[0], g.block_args(outer)[1]);
        let map = g.append_op(outer, OpKind::Map, vec![], &[]);
        let inner = g.new_block(&[]);
        let add = g.append_op(inner, OpKind::Binary(BinOp::Add), vec![a, a], &[Ty::i64()]);
        g.attach_region(map, inner);
        g.replace_all_uses(a, b);
        assert_eq!(g.operands(add), &[b, b]);
        assert_eq!(g.uses(b).len(), 2);
    }

    #[test]
    fn erase_unlinks_and_hides_uses() {
        let mut g = Graph::new();
        let b = g.new_block(&[Ty::None]);
        let ctrl = g.block_args(b)[0];
        let c = g.append_op(b, OpKind::HsConstant { value: 1 }, vec![ctrl], &[Ty::i64()]);
        assert_eq!(g.uses(ctrl), vec![(c, 0)]);
        g.erase_op(c);
        assert!(g.uses(ctrl).is_empty());
        assert!(g.block_ops(b).is_empty());
    }

    #[test]
    fn terminator_is_last_op_only() {
        let mut g = Graph::new();
        let b = g.new_block(&[Ty::None]);
        let ctrl = g.block_args(b)[0];
        assert_eq!(g.terminator(b), None);
        let ret = g.append_op(b, OpKind::HsReturn, vec![ctrl], &[]);
        assert_eq!(g.terminator(b), Some(ret));
        let k = g.insert_op_before_terminator(b, OpKind::Never, vec![], &[Ty::None]);
        assert_eq!(g.block_ops(b), &[k, ret]);
    }
}
