//! Token-level interpreter for lowered handshake modules.
//!
//! The circuit is read as a Kahn process network: every value is an unbounded FIFO
//! channel, every op is a process that fires once all the inputs it needs hold a
//! token. Unit calls are inlined. Sequential buffers are modelled by preloading their
//! output channel with the initial tokens, which gives the same token order as a
//! shift register without tracking slots. Merge takes the lowest-index ready input,
//! which makes runs reproducible.

use std::collections::{BTreeMap, VecDeque};

use crate::compile::{LowerError, LowerErrorKind};
use crate::ir::{BinOp, BlockId, CmpPred, Dialect, Module, OpKind, ValueId};

const MAX_INLINE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Int(i64),
    Unit,
    Tuple(Vec<Token>),
}

impl Token {
    /// Payload token of a lowered stream: `(data, eos)`.
    pub fn elem(data: i64, eos: bool) -> Self {
        Token::Tuple(vec![Token::Int(data), Token::Int(i64::from(eos))])
    }

    pub fn as_elem(&self) -> Option<(i64, bool)> {
        match self {
            Token::Tuple(fields) => match fields.as_slice() {
                [Token::Int(data), Token::Int(eos)] => Some((*data, *eos != 0)),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_int(&self) -> Result<i64, LowerError> {
        match self {
            Token::Int(v) => Ok(*v),
            other => Err(sim_error(format!("expected an integer token, found {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Upper bound on op firings before the run is cut off.
    pub fuel: usize,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self { fuel: 100_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimOutput {
    /// Tokens that reached each result of the simulated function, in arrival order.
    pub results: Vec<Vec<Token>>,
    pub firings: usize,
    /// False when the run stopped on fuel rather than running out of enabled ops.
    pub quiescent: bool,
}

impl SimOutput {
    /// `(data, eos)` pairs of a payload result.
    pub fn elems(&self, result: usize) -> Vec<(i64, bool)> {
        self.results
            .get(result)
            .map(|tokens| tokens.iter().filter_map(Token::as_elem).collect())
            .unwrap_or_default()
    }
}

fn sim_error(message: impl Into<String>) -> LowerError {
    LowerError::new(LowerErrorKind::Simulation, message.into())
}

type Chan = usize;

#[derive(Debug)]
enum NodeKind {
    Op(OpKind),
    Forward,
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    inputs: Vec<Chan>,
    outputs: Vec<Chan>,
}

#[derive(Debug, Default)]
struct Network {
    chans: Vec<VecDeque<Token>>,
    nodes: Vec<Node>,
}

impl Network {
    fn chan(&mut self) -> Chan {
        self.chans.push(VecDeque::new());
        self.chans.len() - 1
    }

    fn instantiate(
        &mut self,
        module: &Module,
        func: &str,
        args: &[Chan],
        results: &[Chan],
        depth: usize,
    ) -> Result<(), LowerError> {
        if depth > MAX_INLINE_DEPTH {
            return Err(sim_error(format!("unit calls nested deeper than {MAX_INLINE_DEPTH}")));
        }
        let f = module
            .func(func)
            .ok_or_else(|| sim_error(format!("unknown function {func:?}")))?;
        let graph = &module.graph;
        let block = f.body;
        let params = graph.block_args(block);
        if params.len() != args.len() {
            return Err(sim_error(format!(
                "{func} takes {} inputs, {} given",
                params.len(),
                args.len()
            )));
        }
        check_single_consumer(module, block, func)?;

        let mut chans: BTreeMap<ValueId, Chan> =
            params.iter().copied().zip(args.iter().copied()).collect();
        for &op in graph.block_ops(block) {
            for &v in graph.results(op) {
                let c = self.chan();
                chans.insert(v, c);
            }
        }
        let lookup = |v: ValueId| {
            chans
                .get(&v)
                .copied()
                .ok_or_else(|| sim_error(format!("in {func}: value defined outside the function")))
        };

        for &op in graph.block_ops(block) {
            let inputs = graph
                .operands(op)
                .iter()
                .map(|&v| lookup(v))
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = graph
                .results(op)
                .iter()
                .map(|&v| lookup(v))
                .collect::<Result<Vec<_>, _>>()?;
            match graph.kind(op) {
                OpKind::HsReturn => {
                    if inputs.len() != results.len() {
                        return Err(sim_error(format!(
                            "{func} returns {} values, caller expects {}",
                            inputs.len(),
                            results.len()
                        )));
                    }
                    for (&from, &to) in inputs.iter().zip(results) {
                        self.nodes.push(Node {
                            kind: NodeKind::Forward,
                            inputs: vec![from],
                            outputs: vec![to],
                        });
                    }
                }
                OpKind::Instance { callee } => {
                    self.instantiate(module, callee, &inputs, &outputs, depth + 1)?;
                }
                kind => {
                    if !matches!(kind.dialect(), Dialect::Handshake | Dialect::Arith) {
                        return Err(sim_error(format!(
                            "in {func}: {} cannot be simulated",
                            kind.name()
                        )));
                    }
                    check_shape(kind, inputs.len(), outputs.len()).map_err(|msg| {
                        sim_error(format!("in {func}: {} {msg}", kind.name()))
                    })?;
                    if let OpKind::Buffer { init, .. } = kind {
                        for &v in init.iter().rev() {
                            self.chans[outputs[0]].push_back(Token::Int(v));
                        }
                    }
                    self.nodes.push(Node {
                        kind: NodeKind::Op(kind.clone()),
                        inputs,
                        outputs,
                    });
                }
            }
        }
        Ok(())
    }

    fn ready(&self, c: Chan) -> bool {
        !self.chans[c].is_empty()
    }

    fn pop(&mut self, c: Chan) -> Result<Token, LowerError> {
        self.chans[c]
            .pop_front()
            .ok_or_else(|| sim_error("read from an empty channel"))
    }

    fn push(&mut self, c: Chan, t: Token) {
        self.chans[c].push_back(t);
    }

    /// Fires node `i` once if it is enabled. Returns whether it fired.
    fn try_fire(&mut self, i: usize) -> Result<bool, LowerError> {
        let node = &self.nodes[i];
        let inputs = node.inputs.clone();
        let outputs = node.outputs.clone();
        let kind = match &node.kind {
            NodeKind::Forward => None,
            NodeKind::Op(kind) => Some(kind.clone()),
        };
        let Some(kind) = kind else {
            if !self.ready(inputs[0]) {
                return Ok(false);
            }
            let t = self.pop(inputs[0])?;
            self.push(outputs[0], t);
            return Ok(true);
        };

        match kind {
            OpKind::Merge => {
                let Some(&c) = inputs.iter().find(|&&c| self.ready(c)) else {
                    return Ok(false);
                };
                let t = self.pop(c)?;
                self.push(outputs[0], t);
                Ok(true)
            }
            OpKind::Mux => {
                let Some(front) = self.chans[inputs[0]].front() else {
                    return Ok(false);
                };
                let sel = front.as_int()?;
                let data = usize::try_from(sel)
                    .ok()
                    .and_then(|s| inputs.get(s + 1).copied())
                    .ok_or_else(|| sim_error(format!("mux select {sel} out of range")))?;
                if !self.ready(data) {
                    return Ok(false);
                }
                self.pop(inputs[0])?;
                let t = self.pop(data)?;
                self.push(outputs[0], t);
                Ok(true)
            }
            OpKind::Never => Ok(false),
            kind => {
                if inputs.is_empty() || !inputs.iter().all(|&c| self.ready(c)) {
                    return Ok(false);
                }
                let mut toks = Vec::with_capacity(inputs.len());
                for &c in &inputs {
                    toks.push(self.pop(c)?);
                }
                for (c, t) in fire(&kind, toks, &outputs)? {
                    self.push(c, t);
                }
                Ok(true)
            }
        }
    }
}

/// Operand and result counts a node needs before it can be wired up.
fn check_shape(kind: &OpKind, inputs: usize, outputs: usize) -> Result<(), String> {
    let ok = match kind {
        OpKind::CondBranch => inputs == 2 && outputs == 2,
        OpKind::Binary(_) | OpKind::Cmp(_) => inputs == 2 && outputs == 1,
        OpKind::Select => inputs == 3 && outputs == 1,
        OpKind::HsConstant { .. } | OpKind::Buffer { .. } => inputs == 1 && outputs == 1,
        OpKind::Mux => inputs >= 2 && outputs == 1,
        OpKind::Merge | OpKind::Join | OpKind::HsPack => inputs >= 1 && outputs == 1,
        OpKind::Fork => inputs == 1 && outputs >= 1,
        OpKind::HsUnpack => inputs == 1 && outputs >= 1,
        OpKind::Discard => inputs == 1 && outputs == 0,
        OpKind::Never => inputs == 0 && outputs == 1,
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("has {inputs} operand(s) and {outputs} result(s)"))
    }
}

/// Output tokens of one firing of a strict (all-inputs) node.
fn fire(
    kind: &OpKind,
    mut toks: Vec<Token>,
    outputs: &[Chan],
) -> Result<Vec<(Chan, Token)>, LowerError> {
    let out = match kind {
        OpKind::HsConstant { value } => vec![(outputs[0], Token::Int(*value))],
        OpKind::Buffer { .. } => vec![(outputs[0], toks.remove(0))],
        OpKind::HsPack => vec![(outputs[0], Token::Tuple(toks))],
        OpKind::HsUnpack => match toks.remove(0) {
            Token::Tuple(fields) if fields.len() == outputs.len() => {
                outputs.iter().copied().zip(fields).collect()
            }
            other => return Err(sim_error(format!("cannot unpack {other:?}"))),
        },
        OpKind::CondBranch => {
            let data = toks.remove(1);
            let taken = if toks[0].as_int()? != 0 { outputs[0] } else { outputs[1] };
            vec![(taken, data)]
        }
        OpKind::Join => vec![(outputs[0], Token::Unit)],
        OpKind::Fork => outputs.iter().map(|&c| (c, toks[0].clone())).collect(),
        OpKind::Discard => Vec::new(),
        OpKind::Binary(op) => {
            let v = binary(*op, toks[0].as_int()?, toks[1].as_int()?)?;
            vec![(outputs[0], Token::Int(v))]
        }
        OpKind::Cmp(pred) => {
            let v = compare(*pred, toks[0].as_int()?, toks[1].as_int()?);
            vec![(outputs[0], Token::Int(i64::from(v)))]
        }
        OpKind::Select => {
            let pick = if toks[0].as_int()? != 0 { 1 } else { 2 };
            vec![(outputs[0], toks.swap_remove(pick))]
        }
        other => return Err(sim_error(format!("{} cannot be simulated", other.name()))),
    };
    Ok(out)
}

fn binary(op: BinOp, a: i64, b: i64) -> Result<i64, LowerError> {
    let v = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::DivS | BinOp::RemS if b == 0 => {
            return Err(sim_error(format!("{} by zero", op.name())))
        }
        BinOp::DivS => a.wrapping_div(b),
        BinOp::RemS => a.wrapping_rem(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32),
        BinOp::ShrS => a.wrapping_shr(b as u32),
    };
    Ok(v)
}

fn compare(pred: CmpPred, a: i64, b: i64) -> bool {
    match pred {
        CmpPred::Eq => a == b,
        CmpPred::Ne => a != b,
        CmpPred::Slt => a < b,
        CmpPred::Sle => a <= b,
        CmpPred::Sgt => a > b,
        CmpPred::Sge => a >= b,
    }
}

/// Channels have one reader each; a value with two consumers would split its tokens.
fn check_single_consumer(module: &Module, block: BlockId, func: &str) -> Result<(), LowerError> {
    let graph = &module.graph;
    let mut uses: BTreeMap<ValueId, usize> = BTreeMap::new();
    for &op in graph.block_ops(block) {
        for &v in graph.operands(op) {
            *uses.entry(v).or_default() += 1;
        }
    }
    if let Some((v, n)) = uses.into_iter().find(|&(_, n)| n > 1) {
        return Err(sim_error(format!(
            "in {func}: value of type {} has {n} consumers; materialize forks first",
            graph.ty(v)
        )));
    }
    Ok(())
}

/// Runs `func` with the given token sequence preloaded on each argument.
#[tracing::instrument(skip(module, inputs, options))]
pub fn simulate(
    module: &Module,
    func: &str,
    inputs: &[Vec<Token>],
    options: &SimOptions,
) -> Result<SimOutput, LowerError> {
    let f = module
        .func(func)
        .ok_or_else(|| sim_error(format!("unknown function {func:?}")))?;
    let mut net = Network::default();
    let args: Vec<Chan> = inputs
        .iter()
        .map(|tokens| {
            let c = net.chan();
            net.chans[c].extend(tokens.iter().cloned());
            c
        })
        .collect();
    let results: Vec<Chan> = (0..f.result_types.len()).map(|_| net.chan()).collect();
    net.instantiate(module, func, &args, &results, 0)?;

    let mut firings = 0;
    let quiescent = loop {
        let mut progress = false;
        for i in 0..net.nodes.len() {
            if net.try_fire(i)? {
                progress = true;
                firings += 1;
                if firings >= options.fuel {
                    break;
                }
            }
        }
        if !progress {
            break true;
        }
        if firings >= options.fuel {
            break false;
        }
    };
    tracing::debug!(firings, quiescent, nodes = net.nodes.len(), "simulation finished");
    Ok(SimOutput {
        results: results
            .iter()
            .map(|&c| net.chans[c].iter().cloned().collect())
            .collect(),
        firings,
        quiescent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Func, FuncKind};
    use crate::types::Ty;

    fn counter_module() -> Module {
        let mut m = Module::new();
        let g = &mut m.graph;
        let b = g.new_block(&[Ty::None]);
        let ctrl = g.block_args(b)[0];
        let fork = g.append_op(b, OpKind::Fork, vec![ctrl], &[Ty::None, Ty::None]);
        let (c0, c1) = (g.result(fork, 0), g.result(fork, 1));
        let one = g.append_op(b, OpKind::HsConstant { value: 5 }, vec![c0], &[Ty::i64()]);
        let one = g.result(one, 0);
        let buf = g.append_op(
            b,
            OpKind::Buffer {
                slots: 2,
                init: vec![2, 1],
            },
            vec![one],
            &[Ty::i64()],
        );
        let out = g.result(buf, 0);
        g.append_op(b, OpKind::HsReturn, vec![out, c1], &[]);
        m.funcs.push(Func {
            name: "counter".to_string(),
            kind: FuncKind::Handshake,
            private: false,
            body: b,
            result_types: vec![Ty::i64(), Ty::None],
        });
        m
    }

    #[test]
    fn buffer_emits_initial_tokens_last_first() {
        let m = counter_module();
        let out = simulate(&m, "counter", &[vec![Token::Unit]], &SimOptions::default())
            .expect("simulate");
        assert!(out.quiescent);
        assert_eq!(out.results[0], vec![Token::Int(1), Token::Int(2), Token::Int(5)]);
        assert_eq!(out.results[1], vec![Token::Unit]);
    }

    #[test]
    fn multi_consumer_values_are_rejected() {
        let mut m = Module::new();
        let g = &mut m.graph;
        let b = g.new_block(&[Ty::None]);
        let ctrl = g.block_args(b)[0];
        g.append_op(b, OpKind::HsReturn, vec![ctrl, ctrl], &[]);
        m.funcs.push(Func {
            name: "dup".to_string(),
            kind: FuncKind::Handshake,
            private: false,
            body: b,
            result_types: vec![Ty::None, Ty::None],
        });
        let err = simulate(&m, "dup", &[vec![Token::Unit]], &SimOptions::default())
            .expect_err("two consumers");
        assert_eq!(err.kind, LowerErrorKind::Simulation);
    }

    #[test]
    fn division_by_zero_is_reported() {
        let err = binary(BinOp::DivS, 1, 0).expect_err("div by zero");
        assert_eq!(err.kind, LowerErrorKind::Simulation);
        assert_eq!(binary(BinOp::RemS, 7, 3).expect("rem"), 1);
    }

    #[test]
    fn malformed_nodes_are_reported_not_run() {
        let doc = serde_json::json!({
            "schema_version": streamc_contracts::HANDSHAKE_MODULE_SCHEMA_VERSION,
            "funcs": [{
                "name": "branchy",
                "args": [{"name": "%c", "type": "i1"}],
                "results": ["i1"],
                "body": [
                    {"op": "handshake.cond_br", "operands": ["%c"],
                     "results": [{"name": "%t", "type": "i1"}, {"name": "%f", "type": "i1"}]},
                    {"op": "handshake.sink", "operands": ["%f"]},
                    {"op": "handshake.return", "operands": ["%t"]}
                ]
            }]
        });
        let bytes = serde_json::to_vec(&doc).expect("encode");
        let m = crate::module_json::parse_stream_module(&bytes).expect("parse");
        let err = simulate(&m, "branchy", &[vec![Token::Int(1)]], &SimOptions::default())
            .expect_err("one-operand cond_br");
        assert_eq!(err.kind, LowerErrorKind::Simulation);
        assert!(err.message.contains("handshake.cond_br"), "{err}");
    }
}
