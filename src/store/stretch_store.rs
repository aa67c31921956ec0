use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::{
    allocator::Counter,
    error::{Error, Result},
    stretch::{Stretch, StretchId},
};

use super::{
    Backend, Keyspace, StoreError, INTERNAL_COLLECTION, REQUIRED_COLLECTIONS, STRETCHES_COLLECTION,
};

/// What [StretchStore::ensure_namespace] had to create. Empty when the store was already set up.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Provisioning {
    pub created_scope: bool,
    pub created_collections: Vec<&'static str>,
}

impl Provisioning {
    pub fn is_empty(&self) -> bool {
        !self.created_scope && self.created_collections.is_empty()
    }
}

/// Owns the create/finalize lifecycle of stretch documents.
///
/// ```text
/// [nonexistent] --insert(open)--> [open] --upsert(closed)--> [closed]
/// ```
pub struct StretchStore<B> {
    backend: B,
    scope: String,
    stretches: Keyspace,
}

impl<B: Backend> StretchStore<B> {
    pub fn new(backend: B, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        Self {
            stretches: Keyspace::new(scope.clone(), STRETCHES_COLLECTION),
            scope,
            backend,
        }
    }

    /// Makes sure the scope and its collections exist. Safe to call on every start and while
    /// another instance provisions the same scope: losing a creation race counts as success.
    #[instrument(skip(self), fields(scope = %self.scope))]
    pub async fn ensure_namespace(&self) -> Result<Provisioning> {
        let scopes = self
            .backend
            .scopes()
            .await
            .map_err(Error::ProvisioningFailed)?;

        let mut provisioning = Provisioning::default();

        let existing = match scopes.into_iter().find(|s| s.name == self.scope) {
            Some(scope) => scope.collections,
            None => {
                provisioning.created_scope = created(self.backend.create_scope(&self.scope).await)?;
                vec![]
            }
        };

        for collection in REQUIRED_COLLECTIONS {
            if existing.iter().any(|c| c == collection) {
                continue;
            }
            let result = self
                .backend
                .create_collection(&self.scope, collection)
                .await;
            if created(result)? {
                provisioning.created_collections.push(collection);
            }
        }

        if !provisioning.is_empty() {
            info!("Provisioned {provisioning:?}");
        }
        Ok(provisioning)
    }

    /// Stores a new stretch. Never replaces an existing document.
    #[instrument(skip(self, stretch))]
    pub async fn insert(&self, id: StretchId, stretch: &Stretch) -> Result<()> {
        let value = serde_json::to_vec(stretch)?;
        self.backend
            .insert(&self.stretches, &id.key(), value)
            .await
            .map_err(|e| match e {
                StoreError::KeyExists(_) => Error::DuplicateId(id),
                e => Error::from(e),
            })?;
        debug!("Inserted stretch {id}");
        Ok(())
    }

    /// Replaces the stretch, creating it if it's missing. Repeating it with the same stretch leaves
    /// the same document behind.
    #[instrument(skip(self, stretch))]
    pub async fn upsert(&self, id: StretchId, stretch: &Stretch) -> Result<()> {
        let value = serde_json::to_vec(stretch)?;
        self.backend
            .upsert(&self.stretches, &id.key(), value)
            .await
            .map_err(Error::from)?;
        debug!("Upserted stretch {id}");
        Ok(())
    }

    pub async fn get(&self, id: StretchId) -> Result<Option<Stretch>> {
        let raw = self
            .backend
            .get(&self.stretches, &id.key())
            .await
            .map_err(Error::from)?;
        Ok(raw.map(|raw| serde_json::from_slice(&raw)).transpose()?)
    }

    /// Counter living next to the stretches, in the `internal` collection.
    pub fn counter(&self) -> KeyspaceCounter<&B> {
        KeyspaceCounter {
            backend: &self.backend,
            keyspace: Keyspace::new(self.scope.clone(), INTERNAL_COLLECTION),
        }
    }
}

/// Treats "already exists" as a creation done by someone else.
fn created(result: Result<(), StoreError>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(StoreError::AlreadyExists(what)) => {
            debug!("{what} was created concurrently");
            Ok(false)
        }
        Err(e) => Err(Error::ProvisioningFailed(e)),
    }
}

/// [Counter] backed by one collection of a [Backend].
pub struct KeyspaceCounter<B> {
    backend: B,
    keyspace: Keyspace,
}

#[async_trait]
impl<B: Backend> Counter for KeyspaceCounter<B> {
    async fn increment(&self, key: &str, initial: u64) -> Result<u64, StoreError> {
        self.backend.increment(&self.keyspace, key, 1, initial).await
    }
}
