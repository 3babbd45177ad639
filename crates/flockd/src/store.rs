//! Object-store adapter.
//!
//! The on-disk object store is an external collaborator; the membership
//! core only needs to initialize it when the cluster's store backend is
//! learned, and to purge stale objects when a node rejoins after a crash
//! with an epoch increment, so old replicas cannot shadow live data.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{info, warn};

use flock_proto::error::{FlockError, FlockResult};

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare the store under the daemon's data directory.
    async fn init(&self, base: &Path) -> FlockResult<()>;

    /// Move aside objects that predate this node's rejoin. Invoked after
    /// a rejoin that incremented the epoch.
    async fn purge_stale_objects(&self) -> FlockResult<()>;
}

/// Default flat-directory store backend.
pub struct PlainStore {
    obj_dir: PathBuf,
}

impl PlainStore {
    pub fn new(base: &Path) -> Self {
        Self {
            obj_dir: base.join("obj"),
        }
    }
}

#[async_trait]
impl StoreAdapter for PlainStore {
    fn name(&self) -> &str {
        "plain"
    }

    async fn init(&self, _base: &Path) -> FlockResult<()> {
        fs::create_dir_all(&self.obj_dir)
            .await
            .map_err(|_| FlockError::Eio)?;
        info!("plain store ready at {}", self.obj_dir.display());
        Ok(())
    }

    async fn purge_stale_objects(&self) -> FlockResult<()> {
        let stale_dir = self.obj_dir.join(".stale");
        fs::create_dir_all(&stale_dir)
            .await
            .map_err(|_| FlockError::Eio)?;

        let mut moved = 0usize;
        let mut entries = fs::read_dir(&self.obj_dir)
            .await
            .map_err(|_| FlockError::Eio)?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name() else { continue };
            if let Err(e) = fs::rename(&path, stale_dir.join(name)).await {
                warn!("failed to move stale object {}: {}", path.display(), e);
                continue;
            }
            moved += 1;
        }

        if moved > 0 {
            info!("purged {} stale objects", moved);
        }
        Ok(())
    }
}

/// Store adapter used before a backend is configured and in tests.
pub struct NullStore;

#[async_trait]
impl StoreAdapter for NullStore {
    fn name(&self) -> &str {
        "null"
    }

    async fn init(&self, _base: &Path) -> FlockResult<()> {
        Ok(())
    }

    async fn purge_stale_objects(&self) -> FlockResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_plain_store_init_creates_obj_dir() {
        let dir = TempDir::new().unwrap();
        let store = PlainStore::new(dir.path());
        store.init(dir.path()).await.unwrap();
        assert!(dir.path().join("obj").is_dir());
    }

    #[tokio::test]
    async fn test_purge_moves_objects_aside() {
        let dir = TempDir::new().unwrap();
        let store = PlainStore::new(dir.path());
        store.init(dir.path()).await.unwrap();

        let obj = dir.path().join("obj").join("00000001");
        fs::write(&obj, b"stale").await.unwrap();

        store.purge_stale_objects().await.unwrap();
        assert!(!obj.exists());
        assert!(dir.path().join("obj").join(".stale").join("00000001").exists());
    }
}
