//! Durable restart-epoch counter.
//!
//! Each process start bumps the epoch by one and rewrites it, so epochs are
//! strictly increasing across the node's lifetimes. Disconnect ids embed the
//! epoch, which is how stale frames from a previous lifetime are recognized
//! and discarded.

use {
    crate::error::Result,
    log::{debug, warn},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// File name components under the data directory.
const EPOCH_SUBDIR: &str = "peer_service";
const EPOCH_FILE: &str = "cluster_state";

/// Loads and persists the local restart epoch.
///
/// Without a data directory the store is volatile: every start loads zero
/// and persistence is a no-op.
#[derive(Debug)]
pub struct EpochStore {
    path: Option<PathBuf>,
}

impl EpochStore {
    /// Open a store rooted at `data_dir`, or a volatile store when `None`.
    pub fn open(data_dir: Option<&Path>) -> Self {
        Self {
            path: data_dir.map(|d| d.join(EPOCH_SUBDIR).join(EPOCH_FILE)),
        }
    }

    /// Read the last persisted epoch, or zero when absent or unreadable.
    pub fn load(&self) -> u64 {
        let Some(path) = &self.path else {
            return 0;
        };
        match fs::read(path) {
            Ok(bytes) => match bincode::deserialize::<u64>(&bytes) {
                Ok(epoch) => epoch,
                Err(e) => {
                    warn!("corrupt epoch file {}: {}", path.display(), e);
                    0
                }
            },
            Err(e) => {
                debug!("no epoch file at {} ({})", path.display(), e);
                0
            }
        }
    }

    /// Load the stored epoch, bump it by one, and persist the new value.
    pub fn bump(&self) -> u64 {
        let epoch = self.load().saturating_add(1);
        self.persist(epoch);
        epoch
    }

    /// Write `epoch` to disk. Failures are logged and otherwise ignored;
    /// membership keeps working with an unpersisted epoch.
    pub fn persist(&self, epoch: u64) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = self.try_persist(path, epoch) {
            warn!("failed to persist epoch {} to {}: {}", epoch, path.display(), e);
        }
    }

    fn try_persist(&self, path: &Path, epoch: u64) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(&epoch)?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_store() {
        let store = EpochStore::open(None);
        assert_eq!(store.load(), 0);
        assert_eq!(store.bump(), 1);
        // Nothing persisted: a reload still starts from zero.
        assert_eq!(store.load(), 0);
    }

    #[test]
    fn test_bump_is_monotonic_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::open(Some(dir.path()));
        assert_eq!(store.load(), 0);
        assert_eq!(store.bump(), 1);

        let reopened = EpochStore::open(Some(dir.path()));
        assert_eq!(reopened.load(), 1);
        assert_eq!(reopened.bump(), 2);
        assert_eq!(reopened.load(), 2);
    }

    #[test]
    fn test_corrupt_file_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::open(Some(dir.path()));
        store.persist(5);
        let path = dir.path().join(EPOCH_SUBDIR).join(EPOCH_FILE);
        fs::write(&path, b"bad").unwrap();
        assert_eq!(store.load(), 0);
    }
}
