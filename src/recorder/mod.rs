//! A single recording: allocate an id, store the open stretch, block until cancelled, then close
//! the stretch. Cancellation is the only suspension point and it always leads to closing.

pub mod shutdown;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::{
    allocator::{Counter, IdAllocator},
    error::Result,
    store::{Backend, StretchStore},
    stretch::{Stretch, StretchDraft, StretchId},
    utils::clock::Clock,
};

/// A stretch that has been stored open and waits to be closed.
pub struct Recording<'a, B, K: ?Sized> {
    store: &'a StretchStore<B>,
    clock: &'a K,
    stretch: Stretch,
}

impl<'a, B: Backend, K: Clock + ?Sized> Recording<'a, B, K> {
    /// Allocates an id and stores the open stretch. Nothing is written if allocation fails.
    #[instrument(skip_all)]
    pub async fn begin<C: Counter>(
        allocator: &IdAllocator<C>,
        store: &'a StretchStore<B>,
        clock: &'a K,
        draft: StretchDraft,
    ) -> Result<Self> {
        let id = allocator.allocate().await?;
        let stretch = Stretch::open(id, draft, clock.time());
        store.insert(id, &stretch).await?;
        info!("Recording stretch {id} from {}", stretch.start);

        Ok(Self {
            store,
            clock,
            stretch,
        })
    }

    pub fn id(&self) -> StretchId {
        self.stretch.id
    }

    pub fn stretch(&self) -> &Stretch {
        &self.stretch
    }

    /// Waits for `shutdown` and stores the closed stretch. If storing fails the stretch stays open
    /// in the store and the error is returned as is.
    #[instrument(skip_all, fields(id = %self.stretch.id))]
    pub async fn finish(mut self, shutdown: CancellationToken) -> Result<Stretch> {
        shutdown.cancelled().await;

        self.stretch.close(self.clock.time())?;
        self.store
            .upsert(self.stretch.id, &self.stretch)
            .await
            .inspect_err(|e| error!("Stretch {} was left open: {e}", self.stretch.id))?;
        info!("Committed stretch {}", self.stretch.id);
        Ok(self.stretch)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use anyhow::Result;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use crate::{
        allocator::{IdAllocator, MockCounter},
        error::Error,
        store::{memory::MemoryBackend, MockBackend, StoreError, StretchStore},
        stretch::{parse_attrs, StretchDraft, StretchId},
        utils::{clock::Clock, logging::TEST_LOGGING},
    };

    use super::Recording;

    /// Clock that moves forward by a fixed step every time it's read.
    struct SteppingClock {
        start: DateTime<Utc>,
        reads: AtomicI64,
        step: Duration,
    }

    impl SteppingClock {
        fn new(step: Duration) -> Self {
            Self {
                start: Utc.with_ymd_and_hms(2022, 9, 1, 10, 0, 0).unwrap(),
                reads: AtomicI64::new(0),
                step,
            }
        }
    }

    impl Clock for SteppingClock {
        fn time(&self) -> DateTime<Utc> {
            let reads = self.reads.fetch_add(1, Ordering::SeqCst) as i32;
            self.start + self.step * reads
        }
    }

    async fn store() -> Result<StretchStore<MemoryBackend>> {
        let store = StretchStore::new(MemoryBackend::new(), "tacks");
        store.ensure_namespace().await?;
        Ok(store)
    }

    #[tokio::test]
    async fn records_open_then_closed_stretch() -> Result<()> {
        *TEST_LOGGING;
        let store = store().await?;
        let allocator = IdAllocator::new(store.counter());
        // Six stretches were recorded before.
        for _ in 0..6 {
            allocator.allocate().await?;
        }

        let clock = SteppingClock::new(Duration::minutes(45));
        let draft = StretchDraft {
            description: "review".into(),
            tags: vec!["work".into(), "work".into()],
            attrs: parse_attrs(&["env:prod"])?,
        };

        let recording = Recording::begin(&allocator, &store, &clock, draft).await?;
        assert_eq!(recording.id(), StretchId::new(7));

        let stored = store.get(recording.id()).await?.expect("open stretch stored");
        assert!(stored.is_open());
        assert_eq!(stored.start, clock.start);
        assert_eq!(stored.tags, vec!["work", "work"]);

        let shutdown = CancellationToken::new();
        let (closed, still_open) = tokio::join!(recording.finish(shutdown.clone()), async {
            tokio::task::yield_now().await;
            let still_open = store.get(StretchId::new(7)).await;
            shutdown.cancel();
            still_open
        });
        assert!(still_open?.expect("open stretch stored").is_open());

        let closed = closed?;
        assert_eq!(closed.end, Some(clock.start + Duration::minutes(45)));
        assert_eq!(closed.duration(), Some(Duration::minutes(45)));

        let stored = store.get(StretchId::new(7)).await?.expect("closed stretch stored");
        assert_eq!(stored, closed);
        assert_eq!(stored.start, clock.start);
        assert_eq!(stored.attrs["env"], "prod");
        Ok(())
    }

    #[tokio::test]
    async fn failed_allocation_writes_nothing() -> Result<()> {
        let mut counter = MockCounter::new();
        counter
            .expect_increment()
            .returning(|_, _| Err(StoreError::Unavailable("connection refused".into())));
        let mut backend = MockBackend::new();
        backend.expect_insert().never();

        let store = StretchStore::new(backend, "tacks");
        let clock = SteppingClock::new(Duration::seconds(1));
        let result = Recording::begin(
            &IdAllocator::new(counter),
            &store,
            &clock,
            StretchDraft::default(),
        )
        .await;

        assert!(matches!(result, Err(Error::AllocationFailed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn failed_close_leaves_stretch_open() -> Result<()> {
        let store = store().await?;
        let clock = SteppingClock::new(Duration::seconds(30));
        let allocator = IdAllocator::new(store.counter());
        let recording =
            Recording::begin(&allocator, &store, &clock, StretchDraft::default()).await?;
        let id = recording.id();

        let mut failing = MockBackend::new();
        failing
            .expect_upsert()
            .times(1)
            .returning(|_, _, _| Err(StoreError::Unavailable("timed out".into())));
        let failing_store = StretchStore::new(failing, "tacks");
        let recording = Recording {
            store: &failing_store,
            clock: &clock,
            stretch: recording.stretch().clone(),
        };

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result = recording.finish(shutdown).await;

        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        let stored = store.get(id).await?.expect("open stretch stored");
        assert!(stored.is_open());
        Ok(())
    }
}
