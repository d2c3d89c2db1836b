//! ethwire-core: RLPx transport primitives, wire constants, and message types.
//! All other ethwire crates depend on this one.

pub mod config;
pub mod crypto;
pub mod frame;
pub mod message;
pub mod mux;
pub mod wire;

pub use crypto::{Keypair, NodeId, SessionSecrets};
pub use frame::{FrameCodec, FrameEgress, FrameHeader, FrameIngress};
pub use mux::{EgressMux, FrameReader, FrameWriter, IngressMux, Packet};
