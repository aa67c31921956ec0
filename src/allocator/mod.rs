//! Minting of stretch identifiers.
//!
//! Uniqueness between concurrently running instances relies entirely on the backend incrementing
//! the counter atomically. Nothing is read and written back from here.

use async_trait::async_trait;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

use crate::{
    error::{Error, Result},
    store::StoreError,
    stretch::StretchId,
};

/// Key of the counter inside the `internal` collection.
pub const NEXT_ID_KEY: &str = "next-id";

/// Value the counter is created with. The first stretch of a namespace gets this id.
pub const FIRST_ID: u64 = 1;

/// Durable counter living server-side.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Counter: Send + Sync {
    /// Atomically creates the counter with `initial` if it's absent, otherwise adds one to it.
    /// Returns the value the counter holds afterwards.
    async fn increment(&self, key: &str, initial: u64) -> Result<u64, StoreError>;
}

pub struct IdAllocator<C> {
    counter: C,
}

impl<C: Counter> IdAllocator<C> {
    pub fn new(counter: C) -> Self {
        Self { counter }
    }

    /// Returns an id greater than every id handed out before in this namespace. The value after
    /// the increment is the id, so ids go 1, 2, 3...
    pub async fn allocate(&self) -> Result<StretchId> {
        let id = self
            .counter
            .increment(NEXT_ID_KEY, FIRST_ID)
            .await
            .inspect_err(|e| error!("Failed to increment {NEXT_ID_KEY}: {e}"))
            .map_err(Error::AllocationFailed)?;
        debug!("Allocated id {id}");
        Ok(StretchId::new(id))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc};

    use anyhow::Result;
    use futures::future::try_join_all;

    use crate::{
        error::Error,
        store::{memory::MemoryBackend, StoreError, StretchStore},
        stretch::StretchId,
    };

    use super::{IdAllocator, MockCounter, FIRST_ID, NEXT_ID_KEY};

    async fn store() -> Result<Arc<StretchStore<MemoryBackend>>> {
        let store = StretchStore::new(MemoryBackend::new(), "tacks");
        store.ensure_namespace().await?;
        Ok(Arc::new(store))
    }

    #[tokio::test]
    async fn ids_start_at_one_and_increase() -> Result<()> {
        let store = store().await?;
        let allocator = IdAllocator::new(store.counter());

        assert_eq!(allocator.allocate().await?, StretchId::new(1));
        assert_eq!(allocator.allocate().await?, StretchId::new(2));
        assert_eq!(allocator.allocate().await?, StretchId::new(3));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_are_distinct_and_consecutive() -> Result<()> {
        const CALLERS: u64 = 64;
        let store = store().await?;

        let handles = (0..CALLERS).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { IdAllocator::new(store.counter()).allocate().await })
        });
        let ids = try_join_all(handles)
            .await?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let distinct = ids.iter().map(|id| id.get()).collect::<BTreeSet<_>>();
        assert_eq!(distinct.len() as u64, CALLERS);
        assert_eq!(
            distinct.into_iter().collect::<Vec<_>>(),
            (FIRST_ID..FIRST_ID + CALLERS).collect::<Vec<_>>()
        );
        Ok(())
    }

    #[tokio::test]
    async fn uses_counter_verbatim() -> Result<()> {
        let mut counter = MockCounter::new();
        counter
            .expect_increment()
            .withf(|key, initial| key == NEXT_ID_KEY && *initial == FIRST_ID)
            .returning(|_, _| Ok(u64::MAX));

        let id = IdAllocator::new(counter).allocate().await?;
        assert_eq!(id.key(), "18446744073709551615");
        Ok(())
    }

    #[tokio::test]
    async fn counter_failure_is_allocation_failure() {
        let mut counter = MockCounter::new();
        counter
            .expect_increment()
            .times(1)
            .returning(|key, _| Err(StoreError::BadValue(key.to_owned())));

        let result = IdAllocator::new(counter).allocate().await;
        assert!(matches!(
            result,
            Err(Error::AllocationFailed(StoreError::BadValue(_)))
        ));
    }
}
