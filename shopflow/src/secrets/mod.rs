//! Tiered secret storage.
//!
//! A [`SecretStore`] reads the latest credential payload from a versioned
//! secret service and falls back to a blob store when that fails. Backends
//! are plain traits so cloud services, the local filesystem and in-memory
//! test doubles plug in the same way.

pub mod backend;
pub mod file;
pub mod memory;
pub mod store;

pub use backend::{BackendVersion, BlobStore, SecretVersion, StoreBackend, VersionId, VersionedSecretService};
pub use file::{FileBlobStore, FileSecretService};
pub use memory::{InMemoryBlobStore, InMemorySecretService};
pub use store::{SecretStore, StoreMode};
