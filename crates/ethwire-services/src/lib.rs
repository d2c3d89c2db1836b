//! ethwire-services: the `eth` and `par` capabilities and everything they
//! lean on: request state, reputation, and the chain collaborators.

pub mod capability;
pub mod chain;
pub mod eth;
pub mod peer;
pub mod reputation;
pub mod warp;

pub use capability::{
    Capability, CapabilityError, CapabilityEvent, CapabilityWorker, HostCommand, HostHandle, PeerAction,
};
pub use chain::{BlockChain, BlockQueue, ImportResult, MemoryChain, MemoryTxQueue, TransactionQueue};
pub use eth::{EthCapability, SyncState, SyncStatus};
pub use peer::{Asking, RequestState};
pub use reputation::{Reputation, ReputationRegistry};
pub use warp::{FileSnapshotStore, SnapshotStorage, WarpCapability, WarpProgress};
