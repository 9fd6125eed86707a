#![allow(dead_code)]

use serde_json::{json, Value};
use streamc::ir::Module;
use streamc::module_json::parse_stream_module;
use streamc::pass::{lower_stream_to_handshake, LowerStats};
use streamc::sim::{simulate, SimOptions, SimOutput, Token};
use streamc::{LowerError, PassOptions};
use streamc_contracts::STREAM_MODULE_SCHEMA_VERSION;

pub fn module(funcs: Vec<Value>) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schema_version": STREAM_MODULE_SCHEMA_VERSION,
        "funcs": funcs,
    }))
    .expect("encode stream module JSON")
}

pub fn func(name: &str, args: &[(&str, &str)], results: &[&str], body: Vec<Value>) -> Value {
    json!({
        "name": name,
        "args": values(args),
        "results": results,
        "body": body,
    })
}

fn values(vs: &[(&str, &str)]) -> Vec<Value> {
    vs.iter()
        .map(|(name, ty)| json!({ "name": name, "type": ty }))
        .collect()
}

pub fn op(name: &str, operands: &[&str], results: &[(&str, &str)]) -> Value {
    json!({
        "op": name,
        "operands": operands,
        "results": values(results),
    })
}

pub fn op_with(
    name: &str,
    operands: &[&str],
    results: &[(&str, &str)],
    attrs: Value,
    regions: Vec<Value>,
) -> Value {
    json!({
        "op": name,
        "operands": operands,
        "results": values(results),
        "attrs": attrs,
        "regions": regions,
    })
}

pub fn region(args: &[(&str, &str)], body: Vec<Value>) -> Value {
    json!({ "args": values(args), "body": body })
}

pub fn constant(result: &str, value: i64) -> Value {
    op_with(
        "arith.constant",
        &[],
        &[(result, "i64")],
        json!({ "value": value }),
        vec![],
    )
}

pub fn create(result: &str, values: &[i64]) -> Value {
    op_with(
        "stream.create",
        &[],
        &[(result, "stream<i64>")],
        json!({ "values": values }),
        vec![],
    )
}

/// `map(input, x -> x <op> k)`.
pub fn map_const(input: &str, result: &str, arith: &str, k: i64) -> Value {
    op_with(
        "stream.map",
        &[input],
        &[(result, "stream<i64>")],
        json!({}),
        vec![region(
            &[("%x", "i64")],
            vec![
                constant("%k", k),
                op(arith, &["%x", "%k"], &[("%y", "i64")]),
                op("stream.yield", &["%y"], &[]),
            ],
        )],
    )
}

/// `filter(input, x -> x % 2 == 0)`.
pub fn filter_even(input: &str, result: &str) -> Value {
    op_with(
        "stream.filter",
        &[input],
        &[(result, "stream<i64>")],
        json!({}),
        vec![region(
            &[("%x", "i64")],
            vec![
                constant("%two", 2),
                op("arith.remsi", &["%x", "%two"], &[("%r", "i64")]),
                constant("%zero", 0),
                op_with(
                    "arith.cmpi",
                    &["%r", "%zero"],
                    &[("%even", "i1")],
                    json!({ "predicate": "eq" }),
                    vec![],
                ),
                op("stream.yield", &["%even"], &[]),
            ],
        )],
    )
}

/// `reduce(input, init, (acc, x) -> acc + x)`.
pub fn reduce_add(input: &str, result: &str, acc_ty: &str, init: i64) -> Value {
    let result_ty = format!("stream<{acc_ty}>");
    op_with(
        "stream.reduce",
        &[input],
        &[(result, result_ty.as_str())],
        json!({ "init": init }),
        vec![region(
            &[("%acc", acc_ty), ("%x", "i64")],
            vec![
                op("arith.addi", &["%acc", "%x"], &[("%sum", acc_ty)]),
                op("stream.yield", &["%sum"], &[]),
            ],
        )],
    )
}

pub fn sink(input: &str) -> Value {
    op("stream.sink", &[input], &[])
}

pub fn ret(operands: &[&str]) -> Value {
    op("func.return", operands, &[])
}

/// Single `main` function returning one `stream<i64>`.
pub fn main_returning(body: Vec<Value>) -> Vec<u8> {
    module(vec![func("main", &[], &["stream<i64>"], body)])
}

pub fn lower_with(bytes: &[u8], options: &PassOptions) -> Result<(Module, LowerStats), LowerError> {
    let mut m = parse_stream_module(bytes)?;
    let stats = lower_stream_to_handshake(&mut m, options)?;
    Ok((m, stats))
}

pub fn lower(bytes: &[u8]) -> (Module, LowerStats) {
    lower_with(bytes, &PassOptions::default()).expect("lower stream module")
}

/// Lowers `bytes` and drives `main` with `init_tokens` init control tokens.
pub fn run_main(bytes: &[u8], init_tokens: usize) -> SimOutput {
    let (m, _) = lower(bytes);
    let ctrl = vec![Token::Unit; init_tokens];
    let out = simulate(&m, "main", &[ctrl], &SimOptions::default()).expect("simulate main");
    assert!(out.quiescent, "circuit did not settle: {out:?}");
    out
}
