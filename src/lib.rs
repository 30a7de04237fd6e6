//! Reader agent runtime: execution queue and agent task coordination.

pub mod agent;
pub mod config;
pub mod error;
pub mod queue;
