//! Pass driver: stream module in, handshake module out.
//!
//! Phases run strictly in order and any failure aborts the run:
//! operator bodies to dataflow form, per-function conversion of signatures and
//! operators, removal of dead boxing casts, legality check, then fan-out/discard
//! materialization over every function.

use std::collections::BTreeSet;

use crate::body::lower_body;
use crate::compile::{LowerError, PassOptions};
use crate::forks::{dematerialize_forks_and_sinks, materialize_forks_and_sinks, verify_single_use};
use crate::ir::{BlockId, Dialect, FuncKind, Graph, Module, OpId, OpKind, ValueId};
use crate::lower::{lower_op, lower_pack_unpack, LoweringCtx};
use crate::symbols::SymbolUniquer;
use crate::types::{lower_type, lower_types, Ty};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LowerStats {
    /// Synthesized unit names in creation order.
    pub units: Vec<String>,
    pub forks: usize,
    pub discards: usize,
}

#[tracing::instrument(skip_all)]
pub fn lower_stream_to_handshake(
    module: &mut Module,
    options: &PassOptions,
) -> Result<LowerStats, LowerError> {
    transform_bodies(module)?;

    let mut uniquer = SymbolUniquer::new(module);
    let mut ctx = LoweringCtx::new(options, &mut uniquer);
    for i in 0..module.funcs.len() {
        if module.funcs[i].kind != FuncKind::Stream {
            continue;
        }
        let body = module.funcs[i].body;
        let result_types =
            convert_signature(&mut module.graph, body, &module.funcs[i].result_types)?;
        let ops = module.graph.block_ops(body).to_vec();
        for op in ops {
            if module.graph.op(op).erased {
                continue;
            }
            lower_op(&mut module.graph, &mut ctx, op, body)?;
        }
        let func = &mut module.funcs[i];
        func.result_types = result_types;
        func.kind = FuncKind::Handshake;
        tracing::debug!(func = %func.name, "converted function");
    }
    let mut funcs = std::mem::take(&mut ctx.units);
    let mut stats = LowerStats {
        units: funcs.iter().map(|u| u.name.clone()).collect(),
        ..LowerStats::default()
    };
    // Units are defined ahead of their callers.
    funcs.append(&mut module.funcs);
    module.funcs = funcs;

    for func in &module.funcs {
        lower_nested_pack_unpack(&mut module.graph, func.body)?;
    }
    for func in &module.funcs {
        remove_dead_casts(&mut module.graph, func.body, &func.name)?;
    }
    check_legality(module)?;

    for func in &module.funcs {
        let m = materialize_forks_and_sinks(&mut module.graph, func.body)?;
        stats.forks += m.forks;
        stats.discards += m.discards;
        if options.verify_single_use {
            verify_single_use(&module.graph, func.body, &func.name)?;
        }
    }
    tracing::debug!(
        units = stats.units.len(),
        forks = stats.forks,
        discards = stats.discards,
        "lowered module"
    );
    Ok(stats)
}

/// Runs the body delegate on every operator region, then strips its forks and
/// discards so the operator builders see plain multi-use values.
fn transform_bodies(module: &mut Module) -> Result<(), LowerError> {
    for func in &module.funcs {
        if func.kind != FuncKind::Stream {
            continue;
        }
        for op in module.graph.block_ops(func.body).to_vec() {
            if !module.graph.kind(op).has_body() {
                continue;
            }
            for region in module.graph.op(op).regions.clone() {
                lower_body(&mut module.graph, region)?;
                dematerialize_forks_and_sinks(&mut module.graph, region);
            }
        }
    }
    Ok(())
}

/// Splits stream arguments into payload and control channels and appends the init
/// control argument. Old stream arguments are re-boxed through casts so that
/// operator lowering can unbox them uniformly. Returns the lowered result types.
fn convert_signature(
    graph: &mut Graph,
    body: BlockId,
    result_types: &[Ty],
) -> Result<Vec<Ty>, LowerError> {
    let old_args = graph.block_args(body).to_vec();
    let old_tys: Vec<Ty> = old_args.iter().map(|&v| graph.ty(v).clone()).collect();
    let mut arg_tys = lower_types(&old_tys)?;
    arg_tys.push(Ty::None);
    let mut lowered_results = lower_types(result_types)?;
    lowered_results.push(Ty::None);

    let new_args = graph.reset_block_args(body, &arg_tys);
    let mut next = 0;
    let mut casts = 0;
    for (&old, ty) in old_args.iter().zip(&old_tys) {
        let width = lower_type(ty)?.len();
        let channels = new_args[next..next + width].to_vec();
        next += width;
        if ty.is_stream() {
            let cast = graph.insert_op_at(body, casts, OpKind::Cast, channels, &[ty.clone()]);
            casts += 1;
            let boxed = graph.result(cast, 0);
            graph.replace_all_uses(old, boxed);
        } else {
            graph.replace_all_uses(old, channels[0]);
        }
    }
    Ok(lowered_results)
}

/// `stream.pack`/`stream.unpack` carried into units by merged bodies.
fn lower_nested_pack_unpack(graph: &mut Graph, block: BlockId) -> Result<(), LowerError> {
    for op in graph.walk_ops(block) {
        if matches!(graph.kind(op), OpKind::Pack | OpKind::Unpack) {
            lower_pack_unpack(graph, op)?;
        }
    }
    Ok(())
}

fn remove_dead_casts(graph: &mut Graph, block: BlockId, func: &str) -> Result<(), LowerError> {
    let casts: Vec<OpId> = graph
        .block_ops(block)
        .iter()
        .copied()
        .filter(|&op| matches!(graph.kind(op), OpKind::Cast))
        .collect();
    let read: BTreeSet<ValueId> = graph
        .walk_ops(block)
        .into_iter()
        .flat_map(|op| graph.operands(op).iter().copied())
        .collect();
    for op in casts {
        if let Some(&v) = graph.results(op).iter().find(|v| read.contains(v)) {
            let users: Vec<&str> = graph
                .uses(v)
                .iter()
                .map(|&(user, _)| graph.kind(user).name())
                .collect();
            return Err(LowerError::legalization(format!(
                "in {func}: boxed stream value is still used after conversion by {}",
                users.join(", ")
            )));
        }
        graph.erase_op(op);
    }
    Ok(())
}

/// Every function must be a handshake function built only from handshake and
/// non-constant arithmetic ops, with no stream-typed value left anywhere.
pub fn check_legality(module: &Module) -> Result<(), LowerError> {
    let graph = &module.graph;
    for func in &module.funcs {
        if func.kind != FuncKind::Handshake {
            return Err(LowerError::legalization(format!(
                "function {} was not converted to a handshake function",
                func.name
            )));
        }
        if let Some(&v) = graph
            .block_args(func.body)
            .iter()
            .find(|&&v| graph.ty(v).contains_stream())
        {
            return Err(LowerError::legalization(format!(
                "in {}: argument of type {} survived conversion",
                func.name,
                graph.ty(v)
            )));
        }
        for op in graph.walk_ops(func.body) {
            check_op(graph, op, &func.name)?;
        }
    }
    Ok(())
}

fn check_op(graph: &Graph, op: OpId, func: &str) -> Result<(), LowerError> {
    let kind = graph.kind(op);
    let legal = match kind.dialect() {
        Dialect::Handshake => true,
        Dialect::Arith => !matches!(kind, OpKind::Constant { .. }),
        Dialect::Stream | Dialect::Func | Dialect::Builtin => false,
    };
    if !legal {
        return Err(LowerError::legalization(format!(
            "in {func}: failed to legalize {}",
            kind.name()
        )));
    }
    if let Some(&v) = graph
        .results(op)
        .iter()
        .find(|&&v| graph.ty(v).contains_stream())
    {
        return Err(LowerError::legalization(format!(
            "in {func}: {} produces a {} value",
            kind.name(),
            graph.ty(v)
        )));
    }
    Ok(())
}
