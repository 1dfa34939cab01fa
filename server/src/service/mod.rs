//! Service layer

pub mod agent_bridge;
pub mod dev_server;
pub mod pty;
pub mod reaper;
pub mod repair;
pub mod resolver;
pub mod tracker;
pub mod validator;
