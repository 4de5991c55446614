//! Store backends.
//!
//! The filesystem core talks to the key-value store through the [`KvStore`]
//! trait and nothing else: get a value, put a value, delete a key, list keys
//! under a prefix. Every call is one logical unit; retries and timeouts live
//! inside the backend (etcd's client machinery), never in the callers.
//!
//! Two backends ship: [`EtcdStore`] for a live etcd v3 cluster and
//! [`MemStore`] for tests and offline runs.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemStore;

use async_trait::async_trait;
use thiserror::Error;

/// Failure surfaced by a store backend.
///
/// The filesystem layer does not look inside; every variant maps to `EIO` at
/// the FUSE boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd request failed: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The four operations the filesystem is allowed to use.
///
/// Keys are UTF-8 strings with `/`-delimited structure, values are opaque
/// bytes. `list` returns every key starting with the given prefix, keys only.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Returns `false` when the key was not present.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
