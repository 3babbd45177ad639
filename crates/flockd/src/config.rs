//! Cluster configuration and epoch log persistence.
//!
//! The epoch log is an append-only record of `epoch -> sorted node list`,
//! one file per epoch under `<dir>/epoch/`. A restarting node reads it to
//! claim its prior history, and join admission compares a joiner's claimed
//! membership against the entry committed at the claimed epoch.
//!
//! The whole log is indexed in memory at open time so `read` and `latest`
//! cost a map lookup rather than a directory scan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs;
use tracing::{debug, error};

use flock_proto::error::{FlockError, FlockResult};
use flock_proto::node::{ClusterInfo, EpochRecord, Node};

/// Save cluster info to the config file.
pub async fn save_config(dir: &Path, cinfo: &ClusterInfo) -> FlockResult<()> {
    let path = dir.join("config");
    let data = bincode::serialize(cinfo).map_err(|_| FlockError::SystemError)?;
    fs::write(&path, &data).await.map_err(|e| {
        error!("failed to write config to {}: {}", path.display(), e);
        FlockError::Eio
    })?;
    debug!("saved config: epoch={}", cinfo.epoch);
    Ok(())
}

/// Load cluster info from the config file.
pub async fn load_config(dir: &Path) -> FlockResult<ClusterInfo> {
    let path = dir.join("config");
    if !path.exists() {
        return Err(FlockError::NotFormatted);
    }
    let data = fs::read(&path).await.map_err(|e| {
        error!("failed to read config from {}: {}", path.display(), e);
        FlockError::Eio
    })?;
    bincode::deserialize(&data).map_err(|_| {
        error!("corrupt config file: {}", path.display());
        FlockError::SystemError
    })
}

/// The durable epoch log plus its in-memory index.
pub struct EpochStore {
    epoch_dir: PathBuf,
    index: BTreeMap<u32, EpochRecord>,
}

impl EpochStore {
    /// Open (creating if needed) the epoch log under `dir/epoch` and load
    /// every committed record.
    pub async fn open(dir: &Path) -> FlockResult<Self> {
        let epoch_dir = dir.join("epoch");
        fs::create_dir_all(&epoch_dir)
            .await
            .map_err(|_| FlockError::Eio)?;

        let mut index = BTreeMap::new();
        let mut entries = fs::read_dir(&epoch_dir).await.map_err(|_| FlockError::Eio)?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(epoch) = name.parse::<u32>() else {
                continue;
            };
            let data = fs::read(entry.path()).await.map_err(|_| FlockError::Eio)?;
            let record: EpochRecord = bincode::deserialize(&data).map_err(|_| {
                error!("corrupt epoch log: {}", entry.path().display());
                FlockError::SystemError
            })?;
            index.insert(epoch, record);
        }

        Ok(Self { epoch_dir, index })
    }

    /// Durably record the membership committed at the transition into
    /// `epoch`. Idempotent for the same `(epoch, nodes)` tuple; rewriting
    /// an epoch with different members is refused, the log is append-only.
    pub async fn append(&mut self, epoch: u32, ctime: u64, nodes: Vec<Node>) -> FlockResult<()> {
        if epoch == 0 {
            return Err(FlockError::InvalidEpoch);
        }
        if let Some(existing) = self.index.get(&epoch) {
            if existing.nodes == nodes {
                return Ok(());
            }
            error!("refusing to rewrite epoch {} with different members", epoch);
            return Err(FlockError::InvalidEpoch);
        }

        let record = EpochRecord {
            epoch,
            ctime,
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            nodes,
        };

        let path = self.epoch_dir.join(format!("{:08}", epoch));
        let data = bincode::serialize(&record).map_err(|_| FlockError::SystemError)?;
        fs::write(&path, &data).await.map_err(|e| {
            error!("failed to write epoch log {}: {}", epoch, e);
            FlockError::Eio
        })?;

        debug!("saved epoch log: epoch={}, nodes={}", epoch, record.nodes.len());
        self.index.insert(epoch, record);
        Ok(())
    }

    /// The membership committed at `epoch`, or empty if absent.
    pub fn read(&self, epoch: u32) -> Vec<Node> {
        self.index
            .get(&epoch)
            .map(|r| r.nodes.clone())
            .unwrap_or_default()
    }

    /// The highest committed epoch, 0 if none.
    pub fn latest(&self) -> u32 {
        self.index.keys().next_back().copied().unwrap_or(0)
    }

    /// The full record at the highest committed epoch.
    pub fn latest_record(&self) -> Option<&EpochRecord> {
        self.index.values().next_back()
    }
}
