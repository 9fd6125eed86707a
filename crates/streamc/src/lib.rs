pub mod body;
pub mod compile;
pub mod control;
pub mod diagnostics;
pub mod forks;
pub mod ir;
pub mod lower;
pub mod lower_stateful;
pub mod lower_stateless;
pub mod module_json;
pub mod pass;
pub mod sim;
pub mod symbols;
pub mod types;

pub use compile::{LowerError, LowerErrorKind, PassOptions};
pub use pass::{lower_stream_to_handshake, LowerStats};
