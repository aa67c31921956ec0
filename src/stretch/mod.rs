//! The single persisted entity of `tacks`: a stretch of tracked time.
//!
//! A stretch is created *open* (no `end`) as soon as recording starts and is closed exactly once
//! when the user stops tracking.

mod attrs;
mod id;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

pub use attrs::{parse_attrs, AttrParseError};
pub use id::StretchId;

use crate::error::{Error, Result};

/// The part of a stretch supplied by the user on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StretchDraft {
    pub description: String,
    pub tags: Vec<String>,
    pub attrs: BTreeMap<String, String>,
}

/// Stretch as it is stored in the `stretches` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stretch {
    pub id: StretchId,
    #[serde(default)]
    pub description: String,
    pub start: DateTime<Utc>,
    /// `null` on the wire while the stretch is still being recorded.
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attrs: BTreeMap<String, String>,
}

impl Stretch {
    pub fn open(id: StretchId, draft: StretchDraft, start: DateTime<Utc>) -> Self {
        let StretchDraft {
            description,
            tags,
            attrs,
        } = draft;
        Self {
            id,
            description,
            start,
            end: None,
            tags,
            attrs,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Moves the stretch from open to closed. This can happen only once.
    ///
    /// If the wall clock went backwards while recording, the end is pinned to the start so that a
    /// closed stretch never has a negative duration.
    pub fn close(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.end.is_some() {
            return Err(Error::AlreadyClosed(self.id));
        }

        let end = if at < self.start {
            warn!(
                "Clock went backwards while recording stretch {}: start {} end {at}",
                self.id, self.start
            );
            self.start
        } else {
            at
        };
        self.end = Some(end);
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end - self.start)
    }
}

/// Older clients write `null` instead of an empty array or object.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
