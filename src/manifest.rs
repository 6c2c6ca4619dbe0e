//! Crash-safe persistence of the local manifest (`noteList_v2.json`).
//!
//! Writes are staged to `<path>.tmp`, fsynced, and renamed in place. A
//! `.bak` copy of the last successfully-loaded version is kept. Recovery on
//! read walks main → tmp → bak → rebuild-from-physical, so a crash at any
//! point leaves a loadable manifest.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::Result;
use crate::fsutil;
use crate::local::NoteStore;
use crate::types::{NoteList, NoteMetadata, TopLevelItem};

/// Local manifest store. One instance per app-data directory.
pub struct ManifestStore {
    path: PathBuf,
    inner: RwLock<NoteList>,
}

impl ManifestStore {
    /// Load the manifest, running the recovery chain if needed. The rebuilt
    /// manifest (from physical note files) is only used when every on-disk
    /// copy is gone or unreadable.
    pub fn load(path: impl Into<PathBuf>, notes: &dyn NoteStore) -> Self {
        let path = path.into();
        let list = Self::load_with_recovery(&path, notes);
        // Last-known-good snapshot for the next recovery
        if path.exists() {
            if let Err(e) = fs::copy(&path, fsutil::bak_path(&path)) {
                tracing::warn!(error = %e, "could not refresh manifest backup");
            }
        }
        Self {
            path,
            inner: RwLock::new(list),
        }
    }

    fn load_with_recovery(path: &Path, notes: &dyn NoteStore) -> NoteList {
        for candidate in [path.to_path_buf(), fsutil::tmp_path(path), fsutil::bak_path(path)] {
            match fsutil::read_json_opt::<NoteList>(&candidate) {
                Ok(Some(list)) => {
                    if candidate != path {
                        tracing::warn!(recovered_from = %candidate.display(), "manifest recovered");
                    }
                    return list;
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "manifest copy unreadable");
                }
            }
        }
        tracing::warn!("no manifest copy loadable, rebuilding from note files");
        Self::rebuild_from_physical(notes)
    }

    /// Minimal manifest from whatever note files exist on disk. Ordering is
    /// reconstructed as a flat list; the integrity validator tidies it up.
    fn rebuild_from_physical(notes: &dyn NoteStore) -> NoteList {
        let mut list = NoteList::empty();
        let ids = match notes.list_note_ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "could not enumerate note files");
                return list;
            }
        };
        for id in ids {
            match notes.load_note(&id) {
                Ok(note) => {
                    let meta = NoteMetadata::from_note(&note);
                    if note.archived {
                        list.archived_top_level_order.push(TopLevelItem::note(&id));
                    } else {
                        list.top_level_order.push(TopLevelItem::note(&id));
                    }
                    list.notes.push(meta);
                }
                Err(e) => {
                    tracing::warn!(note_id = %id, error = %e, "skipping unreadable note during rebuild");
                }
            }
        }
        list
    }

    pub fn get(&self) -> NoteList {
        self.inner.read().clone()
    }

    /// Replace and persist the manifest atomically.
    pub fn save(&self, list: NoteList) -> Result<()> {
        fsutil::atomic_write_json(&self.path, &list)?;
        *self.inner.write() = list;
        Ok(())
    }

    /// Mutate the in-memory manifest and persist the result.
    pub fn update(&self, f: impl FnOnce(&mut NoteList)) -> Result<NoteList> {
        let updated = {
            let mut list = self.inner.write();
            f(&mut list);
            list.clone()
        };
        fsutil::atomic_write_json(&self.path, &updated)?;
        Ok(updated)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::FsNoteStore;
    use crate::types::Note;

    fn make_note(id: &str) -> Note {
        Note {
            id: id.to_string(),
            title: format!("Note {id}"),
            content: "body".to_string(),
            content_header: None,
            language: "plaintext".to_string(),
            modified_time: "2025-01-01T00:00:00Z".to_string(),
            archived: false,
            folder_id: None,
        }
    }

    fn setup() -> (tempfile::TempDir, FsNoteStore, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let notes = FsNoteStore::new(dir.path().join("notes"));
        let path = dir.path().join("noteList_v2.json");
        (dir, notes, path)
    }

    #[test]
    fn save_and_reload() {
        let (_dir, notes, path) = setup();
        let store = ManifestStore::load(&path, &notes);

        let mut list = store.get();
        list.upsert_note(NoteMetadata::from_note(&make_note("n1")));
        store.save(list).unwrap();

        let store = ManifestStore::load(&path, &notes);
        assert!(store.get().note("n1").is_some());
    }

    #[test]
    fn recovers_from_bak_when_main_corrupt() {
        let (_dir, notes, path) = setup();
        {
            let store = ManifestStore::load(&path, &notes);
            let mut list = store.get();
            list.upsert_note(NoteMetadata::from_note(&make_note("n1")));
            store.save(list).unwrap();
        }
        // Second load snapshots .bak, then the main copy is corrupted
        {
            let _store = ManifestStore::load(&path, &notes);
        }
        fs::write(&path, b"{ truncated").unwrap();

        let store = ManifestStore::load(&path, &notes);
        assert!(store.get().note("n1").is_some(), "should recover from .bak");
    }

    #[test]
    fn rebuilds_from_physical_files() {
        let (_dir, notes, path) = setup();
        notes.save_note(&make_note("n1")).unwrap();
        notes.save_note(&make_note("n2")).unwrap();

        let store = ManifestStore::load(&path, &notes);
        let list = store.get();
        assert_eq!(list.notes.len(), 2);
        assert_eq!(list.top_level_order.len(), 2);
    }

    #[test]
    fn missing_manifest_with_no_notes_is_empty() {
        let (_dir, notes, path) = setup();
        let store = ManifestStore::load(&path, &notes);
        assert!(store.get().notes.is_empty());
    }

    #[test]
    fn update_persists() {
        let (_dir, notes, path) = setup();
        let store = ManifestStore::load(&path, &notes);
        store
            .update(|list| {
                list.upsert_note(NoteMetadata::from_note(&make_note("n9")));
            })
            .unwrap();

        let reloaded = ManifestStore::load(&path, &notes);
        assert!(reloaded.get().note("n9").is_some());
    }
}
