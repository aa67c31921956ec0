//!  Storage is organized through [stretch_store::StretchStore] on top of a [Backend].
//!  The basic idea is:
//!   - A scope groups everything `tacks` owns inside a bucket.
//!   - The `internal` collection keeps counters, the `stretches` collection keeps one document per
//!     stretch keyed by its decimal id.
//!   - The backend only has to provide a handful of atomic primitives. Nothing on top of them
//!     takes locks.

pub mod couchbase;
pub mod memory;
pub mod stretch_store;

use std::ops::Deref;

use async_trait::async_trait;
use thiserror::Error;

pub use stretch_store::{Provisioning, StretchStore};

#[cfg(test)]
use mockall::automock;

pub const INTERNAL_COLLECTION: &str = "internal";
pub const STRETCHES_COLLECTION: &str = "stretches";

/// Collections that must exist in the scope before anything can be recorded.
pub const REQUIRED_COLLECTIONS: [&str; 2] = [INTERNAL_COLLECTION, STRETCHES_COLLECTION];

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity loss, timeouts and temporary failures of the backend.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A scope or collection being created already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Insert found a document under the key.
    #[error("document with key '{0}' already exists")]
    KeyExists(String),

    #[error("unknown collection {0}")]
    UnknownCollection(Keyspace),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The stored value can't take part in the operation, e.g. incrementing a non-numeric document.
    #[error("bad value under key '{0}'")]
    BadValue(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Unavailable(value.to_string())
    }
}

/// Fully qualified collection inside the configured bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Keyspace {
    pub scope: String,
    pub collection: String,
}

impl Keyspace {
    pub fn new(scope: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            collection: collection.into(),
        }
    }
}

impl std::fmt::Display for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.scope, self.collection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSpec {
    pub name: String,
    pub collections: Vec<String>,
}

/// Atomic building blocks a store must provide. Every operation is a single round trip to the
/// backend and is atomic there.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Lists scopes of the bucket together with their collections.
    async fn scopes(&self) -> Result<Vec<ScopeSpec>, StoreError>;

    /// Fails with [StoreError::AlreadyExists] if the scope is already there.
    async fn create_scope(&self, scope: &str) -> Result<(), StoreError>;

    /// Fails with [StoreError::AlreadyExists] if the collection is already there.
    async fn create_collection(&self, scope: &str, collection: &str) -> Result<(), StoreError>;

    /// Creates the counter with `initial` if it's absent, otherwise adds `delta`. Returns the value
    /// the counter holds afterwards.
    async fn increment(
        &self,
        keyspace: &Keyspace,
        key: &str,
        delta: u64,
        initial: u64,
    ) -> Result<u64, StoreError>;

    /// Fails with [StoreError::KeyExists] instead of replacing a document.
    async fn insert(&self, keyspace: &Keyspace, key: &str, value: Vec<u8>)
        -> Result<(), StoreError>;

    /// Creates or replaces a document.
    async fn upsert(&self, keyspace: &Keyspace, key: &str, value: Vec<u8>)
        -> Result<(), StoreError>;

    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

#[async_trait]
impl<T> Backend for T
where
    T: Deref + Send + Sync,
    T::Target: Backend,
{
    async fn scopes(&self) -> Result<Vec<ScopeSpec>, StoreError> {
        self.deref().scopes().await
    }

    async fn create_scope(&self, scope: &str) -> Result<(), StoreError> {
        self.deref().create_scope(scope).await
    }

    async fn create_collection(&self, scope: &str, collection: &str) -> Result<(), StoreError> {
        self.deref().create_collection(scope, collection).await
    }

    async fn increment(
        &self,
        keyspace: &Keyspace,
        key: &str,
        delta: u64,
        initial: u64,
    ) -> Result<u64, StoreError> {
        self.deref().increment(keyspace, key, delta, initial).await
    }

    async fn insert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.deref().insert(keyspace, key, value).await
    }

    async fn upsert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.deref().upsert(keyspace, key, value).await
    }

    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.deref().get(keyspace, key).await
    }
}
