use thiserror::Error;

use crate::{
    config::ConfigError,
    store::StoreError,
    stretch::{AttrParseError, StretchId},
};

/// Everything that can abort a `tacks` invocation. None of these are retried: they are surfaced to
/// the top-level caller, which exits with a non-zero status.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    ConfigInvalid(#[from] ConfigError),

    #[error(transparent)]
    AttrParse(#[from] AttrParseError),

    #[error("store is unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// The store answered but refused the request, e.g. missing permissions or a collection that
    /// went away.
    #[error(transparent)]
    Store(StoreError),

    #[error("could not get id for stretch: {0}")]
    AllocationFailed(#[source] StoreError),

    /// A stretch already lives under a freshly allocated id. Either the counter was reset or
    /// somebody wrote into the stretches collection by hand.
    #[error("stretch {0} already exists")]
    DuplicateId(StretchId),

    #[error("could not setup scopes and collections: {0}")]
    ProvisioningFailed(#[source] StoreError),

    #[error("stretch {0} is already closed")]
    AlreadyClosed(StretchId),

    #[error("malformed stretch record: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<StoreError> for Error {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(_) => Error::StoreUnavailable(value),
            value => Error::Store(value),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
