//! [Backend] on a Couchbase cluster. Scopes and collections go through the management API, documents
//! and counters through the data service.

mod kv;
mod management;
pub mod protocol;

use async_trait::async_trait;
use tracing::info;

use crate::config::Config;

use self::{kv::KvClient, management::ManagementClient, protocol::Opcode};

use super::{Backend, Keyspace, ScopeSpec, StoreError};

pub struct CouchbaseBackend {
    management: ManagementClient,
    kv: KvClient,
}

impl CouchbaseBackend {
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let management = ManagementClient::new(config)?;
        let kv = KvClient::connect(config).await?;
        info!(
            "Connected to {} bucket {}",
            config.endpoint.host, config.bucket
        );
        Ok(Self { management, kv })
    }
}

#[async_trait]
impl Backend for CouchbaseBackend {
    async fn scopes(&self) -> Result<Vec<ScopeSpec>, StoreError> {
        self.management.scopes().await
    }

    async fn create_scope(&self, scope: &str) -> Result<(), StoreError> {
        self.management.create_scope(scope).await
    }

    async fn create_collection(&self, scope: &str, collection: &str) -> Result<(), StoreError> {
        self.management.create_collection(scope, collection).await
    }

    async fn increment(
        &self,
        keyspace: &Keyspace,
        key: &str,
        delta: u64,
        initial: u64,
    ) -> Result<u64, StoreError> {
        self.kv.increment(keyspace, key, delta, initial).await
    }

    async fn insert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.kv.store(Opcode::Add, keyspace, key, value).await
    }

    async fn upsert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.kv.store(Opcode::Set, keyspace, key, value).await
    }

    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.kv.get(keyspace, key).await
    }
}
