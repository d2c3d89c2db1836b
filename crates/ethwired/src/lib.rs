//! ethwired: RLPx node daemon.
//!
//! The binary in `main.rs` is a thin wrapper around [`node::Node`]; the
//! library half exists so end-to-end tests can run several nodes in one
//! process.

pub mod dispatch;
pub mod node;
pub mod session;
pub mod status;

pub use node::{Node, NodeServices};
