//! CLI command implementations.

pub mod install;
pub mod listen;
pub mod triggers;
