use std::path::PathBuf;

use ferry_common::MessageIdentity;
use serde::Deserialize;

use crate::{MemoryMessageStore, Result, backends::Snapshot};

mod defaults {
    pub const fn handled_retention_secs() -> u64 {
        5 * 60
    }
}

/// Configuration for the message store
///
/// # Examples
///
/// Snapshot-backed store in RON config:
/// ```ron
/// Ferry (
///     store: (
///         backend: File(path: "/var/lib/ferry"),
///         identity: IdAndDestination,
///     ),
/// )
/// ```
///
/// Memory-only store with a row limit:
/// ```ron
/// Ferry (
///     store: (
///         backend: Memory,
///         capacity: Some(10000),
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    /// Uniqueness scope for stored envelopes
    #[serde(default)]
    pub identity: MessageIdentity,

    /// How long handled envelopes are kept before `delete_expired` removes them
    #[serde(default = "defaults::handled_retention_secs")]
    pub handled_retention_secs: u64,

    /// Maximum number of inbox and outbox rows (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub enum BackendConfig {
    /// Tables live in memory only and are lost on exit
    #[default]
    Memory,
    /// Tables are snapshotted into `path` after every mutation
    File { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            identity: MessageIdentity::default(),
            handled_retention_secs: defaults::handled_retention_secs(),
            capacity: None,
        }
    }
}

/// Runtime settings shared by every backend
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    pub identity: MessageIdentity,
    pub handled_retention: chrono::Duration,
    pub capacity: Option<usize>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreConfig::default().settings()
    }
}

impl StoreConfig {
    #[must_use]
    pub fn settings(&self) -> StoreSettings {
        StoreSettings {
            identity: self.identity,
            handled_retention: i64::try_from(self.handled_retention_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            capacity: self.capacity,
        }
    }

    /// Build the configured store, loading the previous snapshot if any
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot directory is invalid or the snapshot
    /// cannot be read.
    pub async fn into_store(self) -> Result<MemoryMessageStore> {
        let settings = self.settings();
        match self.backend {
            BackendConfig::Memory => Ok(MemoryMessageStore::with_settings(settings)),
            BackendConfig::File { path } => {
                let snapshot = Snapshot::open(&path).await?;
                MemoryMessageStore::restore(snapshot, settings).await
            }
        }
    }
}
