//! Persistent disk state backed by redb.
//!
//! Two tables mirror the hierarchical layout: `disks` holds one entry per
//! attached disk keyed by its identity, `mounts` holds one entry per mounted
//! partition keyed by `(identity, partition)`. Values are JSON so missing
//! optional fields read back as defaults.
//!
//! Every logical update runs in its own write transaction, which keeps a
//! mount entry from ever outliving its disk entry.

use crate::disk::{DiskId, DiskKind, MountRecord};
use crate::error::{Error, Result};
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DISKS: TableDefinition<&str, &[u8]> = TableDefinition::new("disks");
const MOUNTS: TableDefinition<(&str, u32), &[u8]> = TableDefinition::new("mounts");

/// Stored metadata of a disk.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct DiskEntry {
    kind: DiskKind,
}

/// Stored metadata of a mount.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct MountEntry {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    filesystem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

/// A disk and its mounts as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedDisk {
    /// Disk identity.
    pub id: DiskId,
    /// Disk kind.
    pub kind: DiskKind,
    /// Mount records, ordered by partition.
    pub mounts: Vec<MountRecord>,
}

/// Raw entries captured by a read transaction.
struct RawDisk {
    key: String,
    value: Vec<u8>,
    mounts: Vec<(u32, Vec<u8>)>,
}

/// Durable record of what should be attached and mounted.
pub struct StateStore {
    db: Database,
    path: PathBuf,
}

impl StateStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path).map_err(db)?;
        debug!(path = %path.display(), "opened state store");
        Ok(Self { db, path })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or update a disk entry.
    pub fn upsert_disk(&self, id: &DiskId, kind: DiskKind) -> Result<()> {
        let value = encode(&DiskEntry { kind })?;
        let key = id.key();

        let txn = self.db.begin_write().map_err(db)?;
        {
            let mut disks = txn.open_table(DISKS).map_err(db)?;
            disks.insert(key.as_str(), value.as_slice()).map_err(db)?;
        }
        txn.commit().map_err(db)?;

        debug!(disk = %id, kind = %kind, "persisted disk");
        Ok(())
    }

    /// Insert or update a mount entry. The disk entry must already exist.
    pub fn upsert_mount(&self, id: &DiskId, record: &MountRecord) -> Result<()> {
        let value = encode(&MountEntry {
            filesystem: record.filesystem.clone(),
            options: record.options.clone(),
            name: record.name.clone(),
        })?;
        let key = id.key();

        let txn = self.db.begin_write().map_err(db)?;
        {
            let disks = txn.open_table(DISKS).map_err(db)?;
            if disks.get(key.as_str()).map_err(db)?.is_none() {
                return Err(Error::NotAttached(key));
            }
            let mut mounts = txn.open_table(MOUNTS).map_err(db)?;
            mounts
                .insert((key.as_str(), record.partition), value.as_slice())
                .map_err(db)?;
        }
        txn.commit().map_err(db)?;

        debug!(disk = %id, partition = record.partition, "persisted mount");
        Ok(())
    }

    /// Remove one mount entry. Missing entries are ignored.
    pub fn remove_mount(&self, id: &DiskId, partition: u32) -> Result<()> {
        let key = id.key();
        let txn = self.db.begin_write().map_err(db)?;
        {
            let mut mounts = txn.open_table(MOUNTS).map_err(db)?;
            mounts.remove((key.as_str(), partition)).map_err(db)?;
        }
        txn.commit().map_err(db)?;
        Ok(())
    }

    /// Remove a disk entry and all of its mounts.
    ///
    /// Returns whether a disk entry existed.
    pub fn remove_disk(&self, id: &DiskId) -> Result<bool> {
        let key = id.key();
        let txn = self.db.begin_write().map_err(db)?;
        let existed;
        {
            let mut disks = txn.open_table(DISKS).map_err(db)?;
            existed = disks.remove(key.as_str()).map_err(db)?.is_some();

            let mut mounts = txn.open_table(MOUNTS).map_err(db)?;
            let partitions: Vec<u32> = mounts
                .range((key.as_str(), 0u32)..=(key.as_str(), u32::MAX))
                .map_err(db)?
                .filter_map(|entry| entry.ok().map(|(k, _)| k.value().1))
                .collect();
            for partition in partitions {
                mounts.remove((key.as_str(), partition)).map_err(db)?;
            }
        }
        txn.commit().map_err(db)?;

        if existed {
            debug!(disk = %id, "removed disk state");
        }
        Ok(existed)
    }

    /// Read one disk and its mounts.
    pub fn get_disk(&self, id: &DiskId) -> Result<Option<PersistedDisk>> {
        let key = id.key();
        let txn = self.db.begin_read().map_err(db)?;
        let disks = match txn.open_table(DISKS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(db(e)),
        };
        let Some(value) = disks.get(key.as_str()).map_err(db)? else {
            return Ok(None);
        };
        let raw = RawDisk {
            key: key.clone(),
            value: value.value().to_vec(),
            mounts: read_mounts(&txn, Some(key.as_str()))?.remove(&key).unwrap_or_default(),
        };
        Ok(decode_disk(raw))
    }

    /// Snapshot of every persisted disk.
    ///
    /// Entries are decoded as the iterator advances. Undecodable disks and
    /// mount entries without a disk are skipped with a warning.
    pub fn list_disks(&self) -> Result<impl Iterator<Item = PersistedDisk>> {
        let txn = self.db.begin_read().map_err(db)?;
        let disks = match txn.open_table(DISKS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new().into_iter().filter_map(decode_disk)),
            Err(e) => return Err(db(e)),
        };

        let mut mounts = read_mounts(&txn, None)?;
        let mut raw = Vec::new();
        for entry in disks.iter().map_err(db)? {
            let (key, value) = entry.map_err(db)?;
            let key = key.value().to_string();
            raw.push(RawDisk {
                mounts: mounts.remove(&key).unwrap_or_default(),
                key,
                value: value.value().to_vec(),
            });
        }
        for (orphan, entries) in mounts {
            warn!(disk = %orphan, count = entries.len(), "skipping mount entries without a disk");
        }

        Ok(raw.into_iter().filter_map(decode_disk))
    }

    /// Delete every disk and mount entry.
    pub fn clear_all(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(db)?;
        txn.delete_table(MOUNTS).map_err(db)?;
        txn.delete_table(DISKS).map_err(db)?;
        txn.commit().map_err(db)?;

        debug!("cleared all disk state");
        Ok(())
    }
}

type MountMap = std::collections::BTreeMap<String, Vec<(u32, Vec<u8>)>>;

fn read_mounts(txn: &redb::ReadTransaction, only: Option<&str>) -> Result<MountMap> {
    let mut out = MountMap::new();
    let table = match txn.open_table(MOUNTS) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(out),
        Err(e) => return Err(db(e)),
    };

    let entries = match only {
        Some(key) => table.range((key, 0u32)..=(key, u32::MAX)).map_err(db)?,
        None => table.iter().map_err(db)?,
    };
    for entry in entries {
        let (key, value) = entry.map_err(db)?;
        let (disk, partition) = key.value();
        out.entry(disk.to_string())
            .or_default()
            .push((partition, value.value().to_vec()));
    }
    Ok(out)
}

fn decode_disk(raw: RawDisk) -> Option<PersistedDisk> {
    let entry: DiskEntry = match serde_json::from_slice(&raw.value) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(disk = %raw.key, error = %e, "skipping unreadable disk entry");
            return None;
        }
    };

    let mounts = raw
        .mounts
        .into_iter()
        .filter_map(|(partition, value)| {
            match serde_json::from_slice::<MountEntry>(&value) {
                Ok(m) => Some(MountRecord {
                    partition,
                    filesystem: m.filesystem,
                    options: m.options,
                    name: m.name,
                }),
                Err(e) => {
                    warn!(disk = %raw.key, partition, error = %e, "skipping unreadable mount entry");
                    None
                }
            }
        })
        .collect();

    Some(PersistedDisk {
        id: DiskId::from_stored(&raw.key),
        kind: entry.kind,
        mounts,
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Database(e.to_string()))
}

/// Convert any redb error into a crate error.
fn db<E: Into<redb::Error>>(e: E) -> Error {
    Error::from(e.into())
}
