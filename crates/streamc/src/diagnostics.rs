use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use streamc_contracts::STREAMC_DIAG_SCHEMA_VERSION;

use crate::compile::{LowerError, LowerErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Parse,
    Type,
    Lower,
    Materialize,
    Simulate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub stage: Stage,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
}

impl Diagnostic {
    pub fn error(code: &str, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Error,
            stage,
            message: message.into(),
            data: BTreeMap::new(),
        }
    }
}

impl LowerErrorKind {
    pub fn stage(self) -> Stage {
        match self {
            LowerErrorKind::Parse => Stage::Parse,
            LowerErrorKind::TypeConversion => Stage::Type,
            LowerErrorKind::Precondition
            | LowerErrorKind::Legalization
            | LowerErrorKind::Unsupported => Stage::Lower,
            LowerErrorKind::Structural => Stage::Materialize,
            LowerErrorKind::Simulation => Stage::Simulate,
        }
    }
}

impl LowerError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut d = Diagnostic::error(self.kind.code(), self.kind.stage(), self.message.clone());
        d.data
            .insert("kind".to_string(), Value::String(format!("{:?}", self.kind)));
        d
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub schema_version: String,
    pub ok: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    pub fn ok() -> Self {
        Self {
            schema_version: STREAMC_DIAG_SCHEMA_VERSION.to_string(),
            ok: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn from_error(err: &LowerError) -> Self {
        Self::ok().with_diagnostics(vec![err.to_diagnostic()])
    }

    pub fn with_diagnostics(mut self, mut diagnostics: Vec<Diagnostic>) -> Self {
        diagnostics.sort_by(|a, b| {
            a.code
                .cmp(&b.code)
                .then_with(|| a.message.cmp(&b.message))
        });
        self.ok = diagnostics.iter().all(|d| d.severity != Severity::Error);
        self.diagnostics = diagnostics;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_report_is_not_ok() {
        let err = LowerError::precondition("stream.reduce accumulator must be i64");
        let report = Report::from_error(&err);
        assert!(!report.ok);
        let v = serde_json::to_value(&report).expect("serialize");
        assert_eq!(v["schema_version"], STREAMC_DIAG_SCHEMA_VERSION);
        assert_eq!(v["diagnostics"][0]["code"], "E_STREAM_PRECONDITION");
        assert_eq!(v["diagnostics"][0]["stage"], "lower");
        assert_eq!(v["diagnostics"][0]["severity"], "error");
        assert_eq!(v["diagnostics"][0]["data"]["kind"], "Precondition");
        assert!(v["diagnostics"][0].get("notes").is_none());
    }

    #[test]
    fn warnings_keep_report_ok() {
        let mut d = Diagnostic::error("W_STREAM_LINEAGE", Stage::Lower, "diverging control");
        d.severity = Severity::Warning;
        let report = Report::ok().with_diagnostics(vec![d]);
        assert!(report.ok);
    }
}
