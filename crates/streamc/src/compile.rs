use std::fmt::Display;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PassOptions {
    /// Only integer width the sequential buffer primitive accepts for accumulators.
    pub buffer_width: u32,
    pub max_control_depth: usize,
    pub strict_control_lineage: bool,
    pub verify_single_use: bool,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            buffer_width: 64,
            max_control_depth: 64,
            strict_control_lineage: false,
            verify_single_use: true,
        }
    }
}

impl PassOptions {
    pub fn from_json(bytes: &[u8]) -> Result<Self, LowerError> {
        serde_json::from_slice(bytes).map_err(|e| {
            LowerError::parse(format!("invalid pass options: {e}"))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerErrorKind {
    Parse,
    TypeConversion,
    Precondition,
    Legalization,
    Structural,
    Unsupported,
    Simulation,
}

impl LowerErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            LowerErrorKind::Parse => "E_STREAM_PARSE",
            LowerErrorKind::TypeConversion => "E_STREAM_TYPE",
            LowerErrorKind::Precondition => "E_STREAM_PRECONDITION",
            LowerErrorKind::Legalization => "E_STREAM_LEGALIZE",
            LowerErrorKind::Structural => "E_STREAM_STRUCTURE",
            LowerErrorKind::Unsupported => "E_STREAM_UNSUPPORTED",
            LowerErrorKind::Simulation => "E_STREAM_SIM",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LowerError {
    pub kind: LowerErrorKind,
    pub message: String,
}

impl LowerError {
    pub fn new(kind: LowerErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(LowerErrorKind::Parse, message.into())
    }

    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::new(LowerErrorKind::TypeConversion, message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(LowerErrorKind::Precondition, message.into())
    }

    pub fn legalization(message: impl Into<String>) -> Self {
        Self::new(LowerErrorKind::Legalization, message.into())
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::new(LowerErrorKind::Structural, message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(LowerErrorKind::Unsupported, message.into())
    }
}

impl std::error::Error for LowerError {}

impl Display for LowerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_when_fields_missing() {
        let opts = PassOptions::from_json(br#"{"strict_control_lineage": true}"#).expect("parse");
        assert!(opts.strict_control_lineage);
        assert_eq!(opts.buffer_width, 64);
        assert!(opts.verify_single_use);
    }

    #[test]
    fn options_reject_unknown_fields() {
        let err = PassOptions::from_json(br#"{"bufer_width": 32}"#).expect_err("typo");
        assert_eq!(err.kind, LowerErrorKind::Parse);
    }
}
