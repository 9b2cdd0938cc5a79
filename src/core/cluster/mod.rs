// src/core/cluster/mod.rs

//! Cluster membership and artifact distribution: the registry directory,
//! the shard target selector, and the authenticated peer transport.

pub mod registry;
pub mod selector;
pub mod transport;

pub use registry::{NodeRecord, Registry};
pub use selector::DistributionStrategy;
pub use transport::PeerClient;
