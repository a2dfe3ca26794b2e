//! Registry operations module - Internal modular organization
//!
//! Each group of distribution API v2 calls lives in its own file and shares
//! one authenticated [`RegistryTransport`](crate::registry::transport::RegistryTransport).

pub mod blob_operations;
pub mod manifest_operations;
pub mod repository_operations;

pub use blob_operations::BlobOperations;
pub use manifest_operations::ManifestOperations;
pub use repository_operations::RepositoryOperations;
