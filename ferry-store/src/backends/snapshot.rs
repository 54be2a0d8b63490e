use std::path::{Component, Path, PathBuf};

use ferry_common::internal;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Result, StoreError, ValidationError};

const SNAPSHOT_FILE: &str = "ferry.store";

/// On-disk snapshot of a memory store
///
/// The full table state is written after every mutation using the
/// "write to temp, then rename" pattern, so a crash leaves either the previous
/// or the new snapshot, never a partial one.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    /// Generation of the last snapshot written
    written: tokio::sync::Mutex<u64>,
}

impl Snapshot {
    /// Validate a store directory
    ///
    /// Rejects `..` components, relative paths and system directories.
    pub fn validate_path(path: &Path) -> std::result::Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentTraversal(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc",
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/boot",
            "/sys",
            "/proc",
            "/dev",
        ];

        for prefix in sensitive_prefixes {
            if path.starts_with(prefix) {
                return Err(ValidationError::SystemDirectory {
                    prefix,
                    path: path.display().to_string(),
                });
            }
        }

        Ok(())
    }

    /// Prepare `directory` for snapshots, creating it if needed
    pub async fn open(directory: &Path) -> Result<Self> {
        Self::validate_path(directory)?;

        if !tokio::fs::try_exists(directory).await? {
            internal!("{} does not exist, creating...", directory.display());
            tokio::fs::create_dir_all(directory).await?;
        } else if !tokio::fs::metadata(directory).await?.is_dir() {
            return Err(ValidationError::NotDirectory(directory.display().to_string()).into());
        }

        let path = directory.join(SNAPSHOT_FILE);
        let stale = path.with_extension("tmp");
        if tokio::fs::try_exists(&stale).await? {
            internal!(
                level = INFO,
                "Removing incomplete snapshot {}",
                stale.display()
            );
            tokio::fs::remove_file(&stale).await?;
        }

        Ok(Self {
            path,
            written: tokio::sync::Mutex::new(0),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot, if any
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }

        let bytes = tokio::fs::read(&self.path).await?;
        let (tables, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(Some(tables))
    }

    pub fn encode<T: Serialize>(tables: &T) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            tables,
            bincode::config::standard(),
        )?)
    }

    /// Write `bytes` as generation `generation`
    ///
    /// Concurrent writers may finish out of order. A snapshot older than the
    /// one already on disk is skipped.
    pub async fn write(&self, generation: u64, bytes: Vec<u8>) -> Result<()> {
        let mut written = self.written.lock().await;
        if *written >= generation {
            return Ok(());
        }

        let temp = self.path.with_extension("tmp");
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(StoreError::Io)?;

        *written = generation;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_components() {
        let err = Snapshot::validate_path(Path::new("/var/lib/../etc")).expect_err("rejected");
        assert!(err.to_string().contains("cannot contain '..'"));
    }

    #[test]
    fn rejects_relative_paths() {
        let err = Snapshot::validate_path(Path::new("relative/path")).expect_err("rejected");
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    #[cfg(unix)]
    fn rejects_system_directories() {
        for path in ["/etc/ferry", "/proc/ferry", "/dev/ferry", "/usr/bin/ferry"] {
            let err = Snapshot::validate_path(Path::new(path)).expect_err("rejected");
            assert!(
                err.to_string().contains("system directory"),
                "Wrong error for path {path}"
            );
        }
    }

    #[test]
    #[cfg(unix)]
    fn accepts_data_directories() {
        assert!(Snapshot::validate_path(Path::new("/var/lib/ferry")).is_ok());
    }

    #[tokio::test]
    async fn stale_generations_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshot = Snapshot::open(dir.path()).await.expect("opens");

        snapshot
            .write(2, Snapshot::encode(&2u32).expect("encodes"))
            .await
            .expect("writes");
        snapshot
            .write(1, Snapshot::encode(&1u32).expect("encodes"))
            .await
            .expect("skips");

        assert_eq!(snapshot.load::<u32>().await.expect("loads"), Some(2));
    }
}
