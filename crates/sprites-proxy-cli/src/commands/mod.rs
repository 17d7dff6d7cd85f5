//! CLI subcommand implementations.

pub mod ensure;
pub mod forward;
pub mod server;
