//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings that
//! appear in machine-readable I/O: stream module documents consumed by the lowering
//! pass, handshake module documents it produces, and diagnostic reports.

pub const STREAM_MODULE_SCHEMA_VERSION: &str = "streamc.stream-module@0.1.0";
pub const HANDSHAKE_MODULE_SCHEMA_VERSION: &str = "streamc.handshake-module@0.1.0";
pub const STREAMC_DIAG_SCHEMA_VERSION: &str = "streamc.diag@0.1.0";

pub const STREAM_MODULE_SCHEMA_VERSIONS_SUPPORTED: &[&str] = &[STREAM_MODULE_SCHEMA_VERSION];
