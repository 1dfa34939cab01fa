//! Domain model

pub mod command;
pub mod dev_server;
pub mod mcp;
pub mod pty;
pub mod repair;
pub mod types;
