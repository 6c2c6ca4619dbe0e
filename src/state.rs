//! Persistent dirty-tracking state.
//!
//! Foreground note mutations never touch the network; they mark state here
//! and a later sync cycle does the wire work. The revision guard is the
//! store's central safety property: a sync cycle snapshots the revision
//! before its network calls and may clear dirty flags only if no mutation
//! happened in between.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::fsutil;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncStateData {
    #[serde(default)]
    dirty_note_ids: BTreeSet<String>,
    #[serde(default)]
    deleted_note_ids: BTreeSet<String>,
    #[serde(default)]
    deleted_folder_ids: BTreeSet<String>,
    #[serde(default)]
    note_list_dirty: bool,
    /// RFC3339 of the last cloud manifest this device has seen.
    #[serde(default)]
    last_synced_drive_ts: String,
    /// note ID → content hash at the moment it was last confirmed synced.
    /// An entry exists iff the note has been pushed or pulled at least once.
    #[serde(default)]
    last_synced_note_hash: BTreeMap<String, String>,
    /// Incremented on every mutation. Strictly monotonic.
    #[serde(default)]
    revision: u64,
}

/// Everything a sync cycle needs to know about pending local work, captured
/// atomically with the revision it was observed at.
#[derive(Debug, Clone)]
pub struct DirtySnapshot {
    pub dirty_notes: Vec<String>,
    pub deleted_notes: Vec<String>,
    pub deleted_folders: Vec<String>,
    pub note_list_dirty: bool,
    pub revision: u64,
}

/// The baseline advance a finished sync cycle wants to commit.
#[derive(Debug, Clone, Default)]
pub struct SyncCommit {
    /// Cloud manifest timestamp observed or produced by this cycle.
    pub cloud_ts: String,
    /// note ID → hash for every note confirmed pushed or pulled.
    pub synced_hashes: BTreeMap<String, String>,
    /// Note deletions confirmed remotely.
    pub deleted_notes: Vec<String>,
    /// Folder deletions confirmed remotely.
    pub deleted_folders: Vec<String>,
}

/// Dirty sets, tombstones, and the last-synced baseline, persisted to
/// `sync_state.json`.
///
/// Reads take the read lock; mutations take the write lock, bump the
/// revision, and persist a cloned view after releasing the lock so the disk
/// write never serializes readers.
pub struct SyncStateStore {
    path: PathBuf,
    inner: RwLock<SyncStateData>,
}

impl SyncStateStore {
    /// Load from `path`. A missing file is an empty state. Corrupt JSON is
    /// an empty state with `note_list_dirty` set: the pending work the file
    /// described is unknown, so the next cycle re-reconciles everything
    /// rather than trusting a clean slate.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match fsutil::read_json_opt::<SyncStateData>(&path) {
            Ok(Some(data)) => data,
            Ok(None) => SyncStateData::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "sync state unreadable, starting dirty");
                SyncStateData {
                    note_list_dirty: true,
                    ..SyncStateData::default()
                }
            }
        };
        Self {
            path,
            inner: RwLock::new(data),
        }
    }

    // -----------------------------------------------------------------------
    // Mutations (foreground API)
    // -----------------------------------------------------------------------

    /// Record a local edit. Re-marking a deleted note as dirty resurrects it.
    pub fn mark_note_dirty(&self, id: &str) -> Result<()> {
        self.mutate(|data| {
            data.deleted_note_ids.remove(id);
            data.dirty_note_ids.insert(id.to_string());
        })
    }

    /// Record a local deletion. A note is never both dirty and deleted.
    pub fn mark_note_deleted(&self, id: &str) -> Result<()> {
        self.mutate(|data| {
            data.dirty_note_ids.remove(id);
            data.deleted_note_ids.insert(id.to_string());
        })
    }

    pub fn mark_folder_deleted(&self, id: &str) -> Result<()> {
        self.mutate(|data| {
            data.deleted_folder_ids.insert(id.to_string());
        })
    }

    /// Record a structural change: reorder, folder rename, archive toggle.
    pub fn mark_dirty(&self) -> Result<()> {
        self.mutate(|data| {
            data.note_list_dirty = true;
        })
    }

    // -----------------------------------------------------------------------
    // Sync-cycle API
    // -----------------------------------------------------------------------

    pub fn dirty_snapshot(&self) -> DirtySnapshot {
        let data = self.inner.read();
        DirtySnapshot {
            dirty_notes: data.dirty_note_ids.iter().cloned().collect(),
            deleted_notes: data.deleted_note_ids.iter().cloned().collect(),
            deleted_folders: data.deleted_folder_ids.iter().cloned().collect(),
            note_list_dirty: data.note_list_dirty,
            revision: data.revision,
        }
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    pub fn baseline_hash(&self, id: &str) -> Option<String> {
        self.inner.read().last_synced_note_hash.get(id).cloned()
    }

    pub fn baseline_hashes(&self) -> BTreeMap<String, String> {
        self.inner.read().last_synced_note_hash.clone()
    }

    pub fn last_synced_drive_ts(&self) -> String {
        self.inner.read().last_synced_drive_ts.clone()
    }

    pub fn is_note_dirty(&self, id: &str) -> bool {
        self.inner.read().dirty_note_ids.contains(id)
    }

    /// Commit a finished sync cycle, clearing dirty flags — but only when no
    /// mutation happened since `expected_revision` was snapshotted. Returns
    /// `false` (and changes nothing) on a revision mismatch; the caller
    /// falls back to `update_synced_state`.
    ///
    /// On success only the notes named in the commit leave the dirty set:
    /// a note whose upload failed this cycle stays dirty for the next one.
    pub fn clear_dirty_if_unchanged(
        &self,
        expected_revision: u64,
        commit: &SyncCommit,
    ) -> Result<bool> {
        let snapshot = {
            let mut data = self.inner.write();
            if data.revision != expected_revision {
                return Ok(false);
            }
            for id in commit.synced_hashes.keys() {
                data.dirty_note_ids.remove(id);
            }
            for id in &commit.deleted_notes {
                data.deleted_note_ids.remove(id);
                // A note confirmed gone is never left dirty
                data.dirty_note_ids.remove(id);
            }
            for id in &commit.deleted_folders {
                data.deleted_folder_ids.remove(id);
            }
            data.note_list_dirty = false;
            Self::advance_baseline(&mut data, commit);
            data.revision += 1;
            data.clone()
        };
        self.persist(&snapshot)?;
        Ok(true)
    }

    /// Advance the baseline for the keys that were actually synced without
    /// touching dirty flags. Used when edits raced the sync cycle: the next
    /// cycle re-pushes whatever is still dirty, and the baseline keeps the
    /// three-way comparison honest.
    pub fn update_synced_state(&self, commit: &SyncCommit) -> Result<()> {
        self.mutate(|data| {
            Self::advance_baseline(data, commit);
        })
    }

    /// Flush the current state to disk. Called on shutdown.
    pub fn flush(&self) -> Result<()> {
        let snapshot = self.inner.read().clone();
        self.persist(&snapshot)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn advance_baseline(data: &mut SyncStateData, commit: &SyncCommit) {
        if !commit.cloud_ts.is_empty() {
            data.last_synced_drive_ts = commit.cloud_ts.clone();
        }
        for (id, hash) in &commit.synced_hashes {
            data.last_synced_note_hash.insert(id.clone(), hash.clone());
        }
        for id in &commit.deleted_notes {
            data.last_synced_note_hash.remove(id);
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut SyncStateData)) -> Result<()> {
        let snapshot = {
            let mut data = self.inner.write();
            f(&mut data);
            data.revision += 1;
            data.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, data: &SyncStateData) -> Result<()> {
        fsutil::atomic_write_json(&self.path, data)
            .map_err(|e| SyncError::StatePersist(e.to_string()))
    }
}
