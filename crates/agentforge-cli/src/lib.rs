//! agentforge CLI Library
//!
//! Talks to `agentforged` over its HTTP control API.

pub mod client;
pub mod feature_cmd;
pub mod fmt;
pub mod policy_cmd;
pub mod run_cmd;
pub mod schedule_cmd;
pub mod sse;
