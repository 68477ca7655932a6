#![deny(clippy::as_conversions)]

pub mod kv;
mod node;
pub mod progress;
pub mod raft;
pub mod raft_log;
pub mod storage;
mod task;

pub use node::*;
