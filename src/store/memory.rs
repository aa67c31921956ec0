use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Backend, Keyspace, ScopeSpec, StoreError};

type Documents = HashMap<String, Vec<u8>>;

/// In-process [Backend]. Every operation runs under one lock, which gives it the same atomicity
/// the remote store offers per document. Counters are kept as ASCII decimal documents, exactly like
/// the remote store keeps them.
#[derive(Default)]
pub struct MemoryBackend {
    scopes: Mutex<BTreeMap<String, BTreeMap<String, Documents>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_collection<T>(
        &self,
        keyspace: &Keyspace,
        operation: impl FnOnce(&mut Documents) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut scopes = self.scopes.lock().await;
        let documents = scopes
            .get_mut(&keyspace.scope)
            .and_then(|collections| collections.get_mut(&keyspace.collection))
            .ok_or_else(|| StoreError::UnknownCollection(keyspace.clone()))?;
        operation(documents)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn scopes(&self) -> Result<Vec<ScopeSpec>, StoreError> {
        let scopes = self.scopes.lock().await;
        Ok(scopes
            .iter()
            .map(|(name, collections)| ScopeSpec {
                name: name.clone(),
                collections: collections.keys().cloned().collect(),
            })
            .collect())
    }

    async fn create_scope(&self, scope: &str) -> Result<(), StoreError> {
        let mut scopes = self.scopes.lock().await;
        if scopes.contains_key(scope) {
            return Err(StoreError::AlreadyExists(format!("scope '{scope}'")));
        }
        debug!("Creating scope {scope}");
        scopes.insert(scope.to_owned(), BTreeMap::new());
        Ok(())
    }

    async fn create_collection(&self, scope: &str, collection: &str) -> Result<(), StoreError> {
        let mut scopes = self.scopes.lock().await;
        let collections = scopes
            .get_mut(scope)
            .ok_or_else(|| StoreError::UnknownCollection(Keyspace::new(scope, collection)))?;
        if collections.contains_key(collection) {
            return Err(StoreError::AlreadyExists(format!(
                "collection '{scope}.{collection}'"
            )));
        }
        debug!("Creating collection {scope}.{collection}");
        collections.insert(collection.to_owned(), Documents::new());
        Ok(())
    }

    async fn increment(
        &self,
        keyspace: &Keyspace,
        key: &str,
        delta: u64,
        initial: u64,
    ) -> Result<u64, StoreError> {
        self.with_collection(keyspace, |documents| {
            let next = match documents.get(key) {
                None => initial,
                Some(raw) => std::str::from_utf8(raw)
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| StoreError::BadValue(key.to_owned()))?
                    // The remote store wraps on overflow as well.
                    .wrapping_add(delta),
            };
            documents.insert(key.to_owned(), next.to_string().into_bytes());
            Ok(next)
        })
        .await
    }

    async fn insert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.with_collection(keyspace, |documents| {
            if documents.contains_key(key) {
                return Err(StoreError::KeyExists(key.to_owned()));
            }
            documents.insert(key.to_owned(), value);
            Ok(())
        })
        .await
    }

    async fn upsert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.with_collection(keyspace, |documents| {
            documents.insert(key.to_owned(), value);
            Ok(())
        })
        .await
    }

    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_collection(keyspace, |documents| Ok(documents.get(key).cloned()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::store::{Backend, Keyspace, StoreError};

    use super::MemoryBackend;

    async fn backend_with(keyspace: &Keyspace) -> Result<MemoryBackend> {
        let backend = MemoryBackend::new();
        backend.create_scope(&keyspace.scope).await?;
        backend
            .create_collection(&keyspace.scope, &keyspace.collection)
            .await?;
        Ok(backend)
    }

    #[tokio::test]
    async fn increment_creates_then_adds() -> Result<()> {
        let keyspace = Keyspace::new("tacks", "internal");
        let backend = backend_with(&keyspace).await?;

        assert_eq!(backend.increment(&keyspace, "next-id", 1, 1).await?, 1);
        assert_eq!(backend.increment(&keyspace, "next-id", 1, 1).await?, 2);
        assert_eq!(backend.increment(&keyspace, "next-id", 5, 1).await?, 7);
        assert_eq!(
            backend.get(&keyspace, "next-id").await?,
            Some(b"7".to_vec())
        );
        Ok(())
    }

    #[tokio::test]
    async fn increment_rejects_non_numeric_documents() -> Result<()> {
        let keyspace = Keyspace::new("tacks", "internal");
        let backend = backend_with(&keyspace).await?;
        backend
            .upsert(&keyspace, "next-id", b"{\"oops\":1}".to_vec())
            .await?;

        let result = backend.increment(&keyspace, "next-id", 1, 1).await;
        assert!(matches!(result, Err(StoreError::BadValue(key)) if key == "next-id"));
        Ok(())
    }

    #[tokio::test]
    async fn insert_does_not_replace() -> Result<()> {
        let keyspace = Keyspace::new("tacks", "stretches");
        let backend = backend_with(&keyspace).await?;

        backend.insert(&keyspace, "1", b"first".to_vec()).await?;
        let second = backend.insert(&keyspace, "1", b"second".to_vec()).await;

        assert!(matches!(second, Err(StoreError::KeyExists(key)) if key == "1"));
        assert_eq!(backend.get(&keyspace, "1").await?, Some(b"first".to_vec()));

        backend.upsert(&keyspace, "1", b"third".to_vec()).await?;
        assert_eq!(backend.get(&keyspace, "1").await?, Some(b"third".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn operations_need_the_collection() -> Result<()> {
        let backend = MemoryBackend::new();
        let keyspace = Keyspace::new("tacks", "stretches");

        let result = backend.get(&keyspace, "1").await;
        assert!(matches!(result, Err(StoreError::UnknownCollection(k)) if k == keyspace));

        backend.create_scope("tacks").await?;
        assert!(matches!(
            backend.create_scope("tacks").await,
            Err(StoreError::AlreadyExists(_))
        ));
        Ok(())
    }
}
