//! Narrow seam to the note persistence layer.
//!
//! The orchestrator, integrity validator, and migrator need only these four
//! methods of the full note layer. Methods are synchronous; the filesystem
//! implementation blocks briefly, and async callers should expect that.

use std::fs;
use std::path::PathBuf;

use crate::error::{Result, SyncError};
use crate::fsutil;
use crate::types::Note;

/// Storage interface covering only what the sync core needs.
pub trait NoteStore: Send + Sync {
    fn load_note(&self, id: &str) -> Result<Note>;
    fn save_note(&self, note: &Note) -> Result<()>;
    fn delete_note(&self, id: &str) -> Result<()>;
    /// IDs of the physical note files present on disk, whether or not the
    /// manifest knows them.
    fn list_note_ids(&self) -> Result<Vec<String>>;
}

/// Filesystem-backed store: one `<id>.json` per note under `notes/`.
pub struct FsNoteStore {
    dir: PathBuf,
}

impl FsNoteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn note_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl NoteStore for FsNoteStore {
    fn load_note(&self, id: &str) -> Result<Note> {
        fsutil::read_json_opt(&self.note_path(id))?
            .ok_or_else(|| SyncError::NoteNotFound(id.to_string()))
    }

    fn save_note(&self, note: &Note) -> Result<()> {
        fsutil::atomic_write_json(&self.note_path(&note.id), note)
    }

    fn delete_note(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.note_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_note_ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Staged `.json.tmp` writes fail the suffix check and are skipped
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
