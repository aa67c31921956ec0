use std::{
    future::Future,
    io::{self, Write},
};

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Args;
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    allocator::IdAllocator,
    config::Config,
    error::Error,
    recorder::{shutdown::detect_shutdown, Recording},
    store::{couchbase::CouchbaseBackend, Backend, StretchStore},
    stretch::{parse_attrs, AttrParseError, Stretch, StretchDraft},
    utils::{
        clock::{Clock, DefaultClock},
        time::format_duration,
    },
};

#[derive(Args, Debug)]
pub struct RecordCommand {
    #[arg(
        long,
        default_value = "",
        help = "Description of what will be done in this stretch"
    )]
    description: String,
    #[arg(
        long = "tag",
        value_delimiter = ',',
        help = "Used to set the tags of the stretch"
    )]
    tags: Vec<String>,
    #[arg(
        long = "attr",
        value_delimiter = ',',
        help = "Used to set the attributes of the stretch. In the form 'key:value'"
    )]
    attrs: Vec<String>,
}

impl RecordCommand {
    pub fn into_draft(self) -> Result<StretchDraft, AttrParseError> {
        Ok(StretchDraft {
            attrs: parse_attrs(&self.attrs)?,
            description: self.description,
            tags: self.tags,
        })
    }
}

pub async fn process_record_command(command: RecordCommand, config: Config) -> Result<()> {
    let draft = command.into_draft().map_err(Error::from)?;

    let backend = CouchbaseBackend::connect(&config)
        .await
        .map_err(Error::from)?;
    let store = StretchStore::new(backend, config.scope);

    let shutdown = CancellationToken::new();
    let listener = tokio::spawn(detect_shutdown(shutdown.clone()));

    let clock = DefaultClock;
    let mut out = io::stdout();
    let recording = record(&store, &clock, draft, shutdown, &mut out);
    until_interrupted(recording, listener).await?;
    Ok(())
}

/// Drives `recording` while `listener` waits for Ctrl-C. A listener that fails aborts the command,
/// since nothing could ever stop the recording.
async fn until_interrupted<T>(
    recording: impl Future<Output = Result<T>>,
    mut listener: JoinHandle<io::Result<()>>,
) -> Result<T> {
    tokio::pin!(recording);
    select! {
        result = &mut recording => result,
        listened = &mut listener => {
            listened?.context("could not listen for Ctrl-C")?;
            recording.await
        }
    }
}

/// Provisions the store, records one stretch and reports progress into `out`.
pub async fn record<B: Backend, K: Clock>(
    store: &StretchStore<B>,
    clock: &K,
    draft: StretchDraft,
    shutdown: CancellationToken,
    out: &mut impl Write,
) -> Result<Stretch> {
    let provisioning = store.ensure_namespace().await?;
    if !provisioning.is_empty() {
        writeln!(out, "Setting up database")?;
    }

    let allocator = IdAllocator::new(store.counter());
    let recording = Recording::begin(&allocator, store, clock, draft).await?;
    let id = recording.id();
    writeln!(out, "Recording stretch {id}")?;
    out.flush()?;

    let stretch = recording.finish(shutdown).await?;
    let duration = stretch.duration().unwrap_or_else(Duration::zero);
    writeln!(
        out,
        "Committed stretch {id} of duration {}",
        format_duration(duration)
    )?;
    Ok(stretch)
}

#[cfg(test)]
mod tests {
    use std::io;

    use anyhow::Result;
    use chrono::{DateTime, TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use crate::{
        error::Error,
        store::{memory::MemoryBackend, MockBackend, StoreError, StretchStore},
        stretch::{StretchDraft, StretchId},
        utils::{clock::Clock, logging::TEST_LOGGING},
    };

    use super::{record, until_interrupted, RecordCommand};

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn time(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2022, 9, 1, 10, 0, 0).unwrap())
    }

    fn cancelled() -> CancellationToken {
        let token = CancellationToken::new();
        token.cancel();
        token
    }

    #[tokio::test]
    async fn reports_setup_only_on_first_run() -> Result<()> {
        *TEST_LOGGING;
        let store = StretchStore::new(MemoryBackend::new(), "tacks");

        let mut out = Vec::new();
        let first = record(&store, &clock(), StretchDraft::default(), cancelled(), &mut out).await?;
        assert_eq!(
            String::from_utf8(out)?,
            "Setting up database\nRecording stretch 1\nCommitted stretch 1 of duration 0s\n"
        );
        assert_eq!(first.id, StretchId::new(1));

        let mut out = Vec::new();
        record(&store, &clock(), StretchDraft::default(), cancelled(), &mut out).await?;
        assert_eq!(
            String::from_utf8(out)?,
            "Recording stretch 2\nCommitted stretch 2 of duration 0s\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn provisioning_failure_stops_before_allocation() -> Result<()> {
        let mut backend = MockBackend::new();
        backend
            .expect_scopes()
            .returning(|| Err(StoreError::PermissionDenied("admin only".into())));
        backend.expect_increment().never();
        backend.expect_insert().never();
        let store = StretchStore::new(backend, "tacks");

        let mut out = Vec::new();
        let error = record(&store, &clock(), StretchDraft::default(), cancelled(), &mut out)
            .await
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::ProvisioningFailed(_))
        ));
        assert!(out.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failing_interrupt_listener_aborts() -> Result<()> {
        let store = StretchStore::new(MemoryBackend::new(), "tacks");
        let mut out = Vec::new();
        let clock = clock();
        let recording = record(
            &store,
            &clock,
            StretchDraft::default(),
            CancellationToken::new(),
            &mut out,
        );
        let listener = tokio::spawn(async { Err(io::Error::other("no signal driver")) });

        let error = until_interrupted(recording, listener).await.unwrap_err();
        assert!(error.to_string().contains("could not listen for Ctrl-C"));
        Ok(())
    }

    #[tokio::test]
    async fn interrupt_commits_the_stretch() -> Result<()> {
        let store = StretchStore::new(MemoryBackend::new(), "tacks");
        let shutdown = CancellationToken::new();
        let mut out = Vec::new();
        let clock = clock();
        let recording = record(
            &store,
            &clock,
            StretchDraft::default(),
            shutdown.clone(),
            &mut out,
        );
        let listener = tokio::spawn(async move {
            shutdown.cancel();
            Ok(())
        });

        let stretch = until_interrupted(recording, listener).await?;
        assert!(!stretch.is_open());
        assert_eq!(store.get(stretch.id).await?, Some(stretch));
        Ok(())
    }

    #[test]
    fn rejects_malformed_attr() {
        let command = RecordCommand {
            description: String::new(),
            tags: vec![],
            attrs: vec!["env:prod".into(), "badattr".into()],
        };
        let error = command.into_draft().unwrap_err();
        assert_eq!(error.entry, "badattr");
    }
}
