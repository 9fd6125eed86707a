use std::collections::BTreeSet;

use crate::ir::{Module, OpKind};

/// Operator name with dialect separators flattened, e.g. `stream.map` -> `stream_map`.
pub fn bare_op_name(kind: &OpKind) -> String {
    kind.name().replace('.', "_")
}

/// Hands out collision-free names for synthesized units.
///
/// Seeded with every symbol the module defines; every name handed out is reserved
/// immediately, so one instance must be shared by all builders of a pass run.
#[derive(Debug, Clone, Default)]
pub struct SymbolUniquer {
    used: BTreeSet<String>,
}

impl SymbolUniquer {
    pub fn new(module: &Module) -> Self {
        let mut out = Self::default();
        for name in module.symbol_names() {
            out.add_symbol(name.to_string());
        }
        out
    }

    pub fn add_symbol(&mut self, name: String) {
        self.used.insert(name);
    }

    pub fn unique_name(&mut self, kind: &OpKind) -> String {
        let base = bare_op_name(kind);
        let mut name = base.clone();
        let mut cnt = 1u32;
        while self.used.contains(&name) {
            name = format!("{base}_{cnt}");
            cnt += 1;
        }
        self.add_symbol(name.clone());
        name
    }
}
