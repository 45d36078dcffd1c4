//! Storage seams for the Spindle platform.
//!
//! The production S3/SDB wire drivers live outside the core; everything in
//! here programs against the `BlobStore` / `KvCache` / `Catalog` traits.
//! The in-memory drivers are the reference implementations, used by tests
//! and the standalone server role.

pub mod blob;
pub mod catalog;
pub mod codec;
pub mod kv;

pub use blob::{BlobObject, BlobStore, MemoryBlobStore};
pub use catalog::{Catalog, CatalogRow, MemoryCatalog};
pub use kv::{KvCache, MemoryKv};

use thiserror::Error;

/// Errors surfaced by the storage drivers.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("corrupt object: {0}")]
    Corrupt(String),
}
