//! Registry Replicator Library
//!
//! Replicates container images and manifest lists between OCI registries.
//! Only blobs missing at the destination are copied, every byte is verified
//! against its digest, and progress is checkpointed so an interrupted run
//! picks up where it stopped.

pub mod concurrency;
pub mod config;
pub mod digest;
pub mod error;
pub mod image;
pub mod logging;
pub mod registry;
pub mod replication;
pub mod secrets;

pub use config::ReplicatorConfig;
pub use digest::Digest;
pub use error::{ReplicationError, Result};
pub use registry::{RegistryClient, RegistryEndpoint};
pub use replication::{ReplicationJob, ReplicationService};
