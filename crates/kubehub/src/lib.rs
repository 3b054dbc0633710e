//! Keel kubehub: the cluster gateway contract, its kube-rs implementation,
//! the identity-stamping wrapper and an in-memory gateway for tests.

#![forbid(unsafe_code)]

pub mod client;
pub mod gateway;
pub mod identified;
pub mod memory;

pub use client::KubeGateway;
pub use gateway::{ClusterGateway, ListOpts, PatchType};
pub use identified::IdentifiedResources;
pub use memory::MemoryGateway;
