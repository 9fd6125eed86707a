//! JSON documents for stream and handshake modules.
//!
//! Values are named per function (`"%0"`, `"%acc"`, ...) and may be referenced before
//! their definition, which feedback loops in handshake modules need. A region body
//! has its own namespace and sees only its arguments and its own values.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use streamc_contracts::{
    HANDSHAKE_MODULE_SCHEMA_VERSION, STREAM_MODULE_SCHEMA_VERSION,
    STREAM_MODULE_SCHEMA_VERSIONS_SUPPORTED,
};

use crate::compile::LowerError;
use crate::ir::{BinOp, BlockId, CmpPred, Func, FuncKind, Graph, Module, OpId, OpKind, ValueId};
use crate::types::Ty;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDoc {
    pub schema_version: String,
    pub funcs: Vec<FuncDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FuncDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub private: bool,
    #[serde(default)]
    pub args: Vec<ValueDoc>,
    #[serde(default)]
    pub results: Vec<String>,
    pub body: Vec<OpDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpDoc {
    pub op: String,
    #[serde(default)]
    pub operands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ValueDoc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<RegionDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionDoc {
    #[serde(default)]
    pub args: Vec<ValueDoc>,
    pub body: Vec<OpDoc>,
}

pub fn parse_stream_module(bytes: &[u8]) -> Result<Module, LowerError> {
    let doc: ModuleDoc = serde_json::from_slice(bytes)
        .map_err(|e| LowerError::parse(format!("invalid module document: {e}")))?;
    module_from_doc(&doc)
}

pub fn module_from_doc(doc: &ModuleDoc) -> Result<Module, LowerError> {
    let kind = if STREAM_MODULE_SCHEMA_VERSIONS_SUPPORTED.contains(&doc.schema_version.as_str()) {
        FuncKind::Stream
    } else if doc.schema_version == HANDSHAKE_MODULE_SCHEMA_VERSION {
        FuncKind::Handshake
    } else {
        return Err(LowerError::parse(format!(
            "unsupported schema_version {:?} (expected {STREAM_MODULE_SCHEMA_VERSION})",
            doc.schema_version
        )));
    };

    let mut module = Module::new();
    for f in &doc.funcs {
        if module.func(&f.name).is_some() {
            return Err(LowerError::parse(format!("duplicate function {:?}", f.name)));
        }
        let func = parse_func(&mut module.graph, f, kind)?;
        module.funcs.push(func);
    }
    Ok(module)
}

pub fn load_module_file(path: &Path) -> anyhow::Result<Module> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read module: {}", path.display()))?;
    parse_stream_module(&bytes).with_context(|| format!("parse module: {}", path.display()))
}

struct FuncParser<'d> {
    func: &'d str,
    names: BTreeMap<&'d str, ValueId>,
    pending: Vec<(OpId, &'d OpDoc)>,
}

impl<'d> FuncParser<'d> {
    fn new(func: &'d str) -> Self {
        Self {
            func,
            names: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    fn define(&mut self, name: &'d str, v: ValueId) -> Result<(), LowerError> {
        if self.names.insert(name, v).is_some() {
            return Err(LowerError::parse(format!(
                "in {}: value {name:?} is defined twice",
                self.func
            )));
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<ValueId, LowerError> {
        self.names.get(name).copied().ok_or_else(|| {
            LowerError::parse(format!("in {}: undefined value {name:?}", self.func))
        })
    }

    /// First pass: blocks, ops and results. Operands are bound afterwards.
    fn build_block(
        &mut self,
        graph: &mut Graph,
        args: &'d [ValueDoc],
        body: &'d [OpDoc],
    ) -> Result<BlockId, LowerError> {
        let arg_tys = args
            .iter()
            .map(|a| parse_ty(self.func, &a.ty))
            .collect::<Result<Vec<_>, _>>()?;
        let block = graph.new_block(&arg_tys);
        for (a, &v) in args.iter().zip(graph.block_args(block)) {
            self.define(&a.name, v)?;
        }
        for op_doc in body {
            let kind = parse_op_kind(self.func, op_doc)?;
            let result_tys = op_doc
                .results
                .iter()
                .map(|r| parse_ty(self.func, &r.ty))
                .collect::<Result<Vec<_>, _>>()?;
            let op = graph.append_op(block, kind, Vec::new(), &result_tys);
            for (r, &v) in op_doc.results.iter().zip(graph.results(op)) {
                self.define(&r.name, v)?;
            }
            for region in &op_doc.regions {
                let mut nested = FuncParser::new(self.func);
                let inner = nested.build_block(graph, &region.args, &region.body)?;
                nested.bind_operands(graph)?;
                graph.attach_region(op, inner);
            }
            self.pending.push((op, op_doc));
        }
        Ok(block)
    }

    fn bind_operands(&self, graph: &mut Graph) -> Result<(), LowerError> {
        for &(op, doc) in &self.pending {
            let operands = doc
                .operands
                .iter()
                .map(|name| self.lookup(name))
                .collect::<Result<Vec<_>, _>>()?;
            graph.set_operands(op, operands);
        }
        Ok(())
    }
}

fn parse_func(graph: &mut Graph, f: &FuncDoc, kind: FuncKind) -> Result<Func, LowerError> {
    let mut parser = FuncParser::new(&f.name);
    let body = parser.build_block(graph, &f.args, &f.body)?;
    parser.bind_operands(graph)?;
    let result_types = f
        .results
        .iter()
        .map(|t| parse_ty(&f.name, t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Func {
        name: f.name.clone(),
        kind,
        private: f.private,
        body,
        result_types,
    })
}

fn parse_ty(func: &str, s: &str) -> Result<Ty, LowerError> {
    Ty::parse_named(s).ok_or_else(|| LowerError::parse(format!("in {func}: unknown type {s:?}")))
}

fn attr<'a>(func: &str, doc: &'a OpDoc, key: &str) -> Result<&'a Value, LowerError> {
    doc.attrs.get(key).ok_or_else(|| {
        LowerError::parse(format!("in {func}: {} is missing attribute {key:?}", doc.op))
    })
}

fn attr_i64(func: &str, doc: &OpDoc, key: &str) -> Result<i64, LowerError> {
    attr(func, doc, key)?.as_i64().ok_or_else(|| {
        LowerError::parse(format!("in {func}: {}.{key} must be an integer", doc.op))
    })
}

fn attr_i64_list(func: &str, doc: &OpDoc, key: &str) -> Result<Vec<i64>, LowerError> {
    let bad = || LowerError::parse(format!("in {func}: {}.{key} must be an integer list", doc.op));
    attr(func, doc, key)?
        .as_array()
        .ok_or_else(bad)?
        .iter()
        .map(|v| v.as_i64().ok_or_else(bad))
        .collect()
}

fn attr_str<'a>(func: &str, doc: &'a OpDoc, key: &str) -> Result<&'a str, LowerError> {
    attr(func, doc, key)?.as_str().ok_or_else(|| {
        LowerError::parse(format!("in {func}: {}.{key} must be a string", doc.op))
    })
}

fn parse_op_kind(func: &str, doc: &OpDoc) -> Result<OpKind, LowerError> {
    if let Some(op) = BinOp::ALL.iter().find(|b| b.name() == doc.op) {
        return Ok(OpKind::Binary(*op));
    }
    let kind = match doc.op.as_str() {
        "stream.create" => OpKind::Create {
            values: attr_i64_list(func, doc, "values")?,
        },
        "stream.map" => OpKind::Map,
        "stream.filter" => OpKind::Filter,
        "stream.reduce" => OpKind::Reduce {
            init: attr_i64(func, doc, "init")?,
        },
        "stream.split" => OpKind::Split,
        "stream.combine" => OpKind::Combine,
        "stream.sink" => OpKind::Sink,
        "stream.pack" => OpKind::Pack,
        "stream.unpack" => OpKind::Unpack,
        "stream.yield" => OpKind::Yield,
        "func.return" => OpKind::Return,
        "arith.constant" => OpKind::Constant {
            value: attr_i64(func, doc, "value")?,
        },
        "arith.cmpi" => {
            let pred = attr_str(func, doc, "predicate")?;
            OpKind::Cmp(CmpPred::parse(pred).ok_or_else(|| {
                LowerError::parse(format!("in {func}: unknown arith.cmpi predicate {pred:?}"))
            })?)
        }
        "arith.select" => OpKind::Select,
        "handshake.constant" => OpKind::HsConstant {
            value: attr_i64(func, doc, "value")?,
        },
        "handshake.pack" => OpKind::HsPack,
        "handshake.unpack" => OpKind::HsUnpack,
        "handshake.buffer" => {
            let slots = attr_i64(func, doc, "slots")?;
            let init = attr_i64_list(func, doc, "init")?;
            let slots = usize::try_from(slots)
                .ok()
                .filter(|&s| s >= 1 && s >= init.len())
                .ok_or_else(|| {
                    LowerError::parse(format!(
                        "in {func}: handshake.buffer needs 1 <= slots and init.len() <= slots"
                    ))
                })?;
            OpKind::Buffer { slots, init }
        }
        "handshake.cond_br" => OpKind::CondBranch,
        "handshake.merge" => OpKind::Merge,
        "handshake.join" => OpKind::Join,
        "handshake.mux" => OpKind::Mux,
        "handshake.never" => OpKind::Never,
        "handshake.instance" => OpKind::Instance {
            callee: attr_str(func, doc, "callee")?.to_string(),
        },
        "handshake.return" => OpKind::HsReturn,
        "handshake.sink" => OpKind::Discard,
        "handshake.fork" => OpKind::Fork,
        "builtin.unrealized_conversion_cast" => OpKind::Cast,
        other => {
            return Err(LowerError::parse(format!(
                "in {func}: unknown operation {other:?}"
            )))
        }
    };
    Ok(kind)
}

fn op_attrs(kind: &OpKind) -> BTreeMap<String, Value> {
    let mut attrs = BTreeMap::new();
    match kind {
        OpKind::Create { values } => {
            attrs.insert("values".to_string(), json!(values));
        }
        OpKind::Reduce { init } => {
            attrs.insert("init".to_string(), json!(init));
        }
        OpKind::Constant { value } | OpKind::HsConstant { value } => {
            attrs.insert("value".to_string(), json!(value));
        }
        OpKind::Cmp(pred) => {
            attrs.insert("predicate".to_string(), json!(pred.name()));
        }
        OpKind::Buffer { slots, init } => {
            attrs.insert("slots".to_string(), json!(slots));
            attrs.insert("init".to_string(), json!(init));
        }
        OpKind::Instance { callee } => {
            attrs.insert("callee".to_string(), json!(callee));
        }
        _ => {}
    }
    attrs
}

fn value_name(v: ValueId) -> String {
    format!("%{}", v.index())
}

fn value_docs(graph: &Graph, values: &[ValueId]) -> Vec<ValueDoc> {
    values
        .iter()
        .map(|&v| ValueDoc {
            name: value_name(v),
            ty: graph.ty(v).to_string(),
        })
        .collect()
}

fn block_docs(graph: &Graph, block: BlockId) -> Vec<OpDoc> {
    graph
        .block_ops(block)
        .iter()
        .map(|&op| OpDoc {
            op: graph.kind(op).name().to_string(),
            operands: graph.operands(op).iter().map(|&v| value_name(v)).collect(),
            results: value_docs(graph, graph.results(op)),
            attrs: op_attrs(graph.kind(op)),
            regions: graph
                .op(op)
                .regions
                .iter()
                .map(|&r| RegionDoc {
                    args: value_docs(graph, graph.block_args(r)),
                    body: block_docs(graph, r),
                })
                .collect(),
        })
        .collect()
}

/// Prints `module`; the handshake schema is used once every function is converted.
pub fn to_doc(module: &Module) -> ModuleDoc {
    let lowered = module.funcs.iter().all(|f| f.kind == FuncKind::Handshake);
    let schema_version = if lowered {
        HANDSHAKE_MODULE_SCHEMA_VERSION
    } else {
        STREAM_MODULE_SCHEMA_VERSION
    };
    ModuleDoc {
        schema_version: schema_version.to_string(),
        funcs: module
            .funcs
            .iter()
            .map(|f| FuncDoc {
                name: f.name.clone(),
                private: f.private,
                args: value_docs(&module.graph, module.graph.block_args(f.body)),
                results: f.result_types.iter().map(Ty::to_string).collect(),
                body: block_docs(&module.graph, f.body),
            })
            .collect(),
    }
}

pub fn to_json(module: &Module) -> Value {
    // Plain strings, maps and vectors only, so serialization cannot fail.
    serde_json::to_value(to_doc(module)).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::LowerErrorKind;

    #[test]
    fn forward_references_resolve() {
        let doc = json!({
            "schema_version": HANDSHAKE_MODULE_SCHEMA_VERSION,
            "funcs": [{
                "name": "counter",
                "args": [{"name": "%ctrl", "type": "none"}],
                "results": ["i64", "none"],
                "body": [
                    {"op": "handshake.constant", "operands": ["%ctrl"],
                     "results": [{"name": "%one", "type": "i64"}], "attrs": {"value": 1}},
                    {"op": "handshake.buffer", "operands": ["%next"],
                     "results": [{"name": "%cnt", "type": "i64"}],
                     "attrs": {"slots": 1, "init": [0]}},
                    {"op": "arith.addi", "operands": ["%cnt", "%one"],
                     "results": [{"name": "%next", "type": "i64"}]},
                    {"op": "handshake.return", "operands": ["%cnt", "%ctrl"]}
                ]
            }]
        });
        let bytes = serde_json::to_vec(&doc).expect("encode");
        let module = parse_stream_module(&bytes).expect("parse");
        let f = module.func("counter").expect("func");
        assert_eq!(f.kind, FuncKind::Handshake);
        let ops = module.graph.block_ops(f.body);
        let buffer = ops[1];
        let add = ops[2];
        assert_eq!(module.graph.operands(buffer), module.graph.results(add));
    }

    #[test]
    fn unknown_names_are_parse_errors() {
        let doc = json!({
            "schema_version": STREAM_MODULE_SCHEMA_VERSION,
            "funcs": [{
                "name": "f",
                "body": [{"op": "func.return", "operands": ["%missing"]}]
            }]
        });
        let bytes = serde_json::to_vec(&doc).expect("encode");
        let err = parse_stream_module(&bytes).expect_err("undefined value");
        assert_eq!(err.kind, LowerErrorKind::Parse);

        let doc = json!({"schema_version": "streamc.stream-module@9.9.9", "funcs": []});
        let bytes = serde_json::to_vec(&doc).expect("encode");
        let err = parse_stream_module(&bytes).expect_err("bad schema");
        assert_eq!(err.kind, LowerErrorKind::Parse);
    }

    #[test]
    fn load_module_file_reports_the_path() {
        let dir = std::env::temp_dir().join(format!("streamc-load-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let good = dir.join("empty.json");
        let doc = json!({"schema_version": STREAM_MODULE_SCHEMA_VERSION, "funcs": []});
        std::fs::write(&good, serde_json::to_vec(&doc).expect("encode")).expect("write");
        let module = load_module_file(&good).expect("load");
        assert!(module.funcs.is_empty());

        let missing = dir.join("missing.json");
        let err = load_module_file(&missing).expect_err("missing file");
        assert!(format!("{err:#}").contains("missing.json"), "{err:#}");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
