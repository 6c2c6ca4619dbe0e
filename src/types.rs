//! Core data model: notes, the manifest, backup records, and the content
//! hashes that anchor three-way merge decisions.
//!
//! Everything persisted here is camelCase JSON — the format note files and
//! manifests already use on disk and in the cloud, so peers on older builds
//! keep round-tripping.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Note
// ============================================================================

/// A note as stored in `notes/<id>.json`. The sync core treats `content` as
/// opaque; only the metadata projection below is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    /// First-line preview shown in list views; carried through sync untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_header: Option<String>,
    pub language: String,
    /// RFC3339. Excluded from `content_hash` so identical content
    /// round-tripped across devices hashes equal.
    pub modified_time: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

impl Note {
    /// Stable hash over identity and content fields. `modified_time` and
    /// `content_header` are deliberately excluded.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.id.as_str(),
            self.title.as_str(),
            self.content.as_str(),
            self.language.as_str(),
            if self.archived { "1" } else { "0" },
            self.folder_id.as_deref().unwrap_or(""),
        ] {
            // Length framing keeps ("ab","c") distinct from ("a","bc").
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hex(&hasher.finalize())
    }

    /// Hash of the content bytes alone. Used to recognize conflict-copy
    /// duplicates whose titles were rewritten.
    pub fn dedup_hash(&self) -> String {
        hex(&Sha256::digest(self.content.as_bytes()))
    }

    /// `modified_time` parsed for ordering; unparseable stamps sort earliest
    /// so a well-formed peer wins.
    pub fn modified_at(&self) -> chrono::DateTime<chrono::Utc> {
        parse_rfc3339(&self.modified_time)
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub(crate) fn parse_rfc3339(ts: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}

// ============================================================================
// Manifest
// ============================================================================

/// Compact projection of a note for the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMetadata {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_header: Option<String>,
    pub language: String,
    pub modified_time: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    pub content_hash: String,
}

impl NoteMetadata {
    pub fn from_note(note: &Note) -> Self {
        Self {
            id: note.id.clone(),
            title: note.title.clone(),
            content_header: note.content_header.clone(),
            language: note.language.clone(),
            modified_time: note.modified_time.clone(),
            archived: note.archived,
            folder_id: note.folder_id.clone(),
            content_hash: note.content_hash(),
        }
    }

    pub fn modified_at(&self) -> chrono::DateTime<chrono::Utc> {
        parse_rfc3339(&self.modified_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopLevelItemType {
    Note,
    Folder,
}

/// One entry of the user-visible layout ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopLevelItem {
    #[serde(rename = "type")]
    pub item_type: TopLevelItemType,
    pub id: String,
}

impl TopLevelItem {
    pub fn note(id: impl Into<String>) -> Self {
        Self {
            item_type: TopLevelItemType::Note,
            id: id.into(),
        }
    }

    pub fn folder(id: impl Into<String>) -> Self {
        Self {
            item_type: TopLevelItemType::Folder,
            id: id.into(),
        }
    }
}

pub const NOTE_LIST_VERSION: u32 = 2;

/// The manifest: a single JSON file persisted both locally and remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteList {
    pub version: u32,
    pub notes: Vec<NoteMetadata>,
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub top_level_order: Vec<TopLevelItem>,
    #[serde(default)]
    pub archived_top_level_order: Vec<TopLevelItem>,
    #[serde(default)]
    pub collapsed_folder_ids: Vec<String>,
    /// Per-process UUID of the device that last uploaded this manifest.
    /// Peers use it to skip change-feed batches they caused themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_client_id: Option<String>,
}

impl NoteList {
    pub fn empty() -> Self {
        Self {
            version: NOTE_LIST_VERSION,
            notes: Vec::new(),
            folders: Vec::new(),
            top_level_order: Vec::new(),
            archived_top_level_order: Vec::new(),
            collapsed_folder_ids: Vec::new(),
            last_sync_client_id: None,
        }
    }

    pub fn note(&self, id: &str) -> Option<&NoteMetadata> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.id == id)
    }

    /// Insert or replace the metadata entry for a note.
    pub fn upsert_note(&mut self, meta: NoteMetadata) {
        match self.notes.iter_mut().find(|n| n.id == meta.id) {
            Some(slot) => *slot = meta,
            None => self.notes.push(meta),
        }
    }

    pub fn remove_note(&mut self, id: &str) {
        self.notes.retain(|n| n.id != id);
        self.top_level_order.retain(|e| e.id != id);
        self.archived_top_level_order.retain(|e| e.id != id);
    }

    pub fn remove_folder(&mut self, id: &str) {
        self.folders.retain(|f| f.id != id);
        self.top_level_order.retain(|e| e.id != id);
        self.archived_top_level_order.retain(|e| e.id != id);
        self.collapsed_folder_ids.retain(|f| f != id);
    }
}

// ============================================================================
// Migration state
// ============================================================================

/// Persisted once migration to the app-data scope completes; read-only after.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    pub migrated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<String>,
    #[serde(default)]
    pub old_data_deleted: bool,
}

// ============================================================================
// Cloud-wins backups
// ============================================================================

/// Why a local note was backed up before being overwritten or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudWinReason {
    #[serde(rename = "cloud-delete-during-pull")]
    CloudDeleteDuringPull,
    #[serde(rename = "cloud-delete-during-conflict-merge")]
    CloudDeleteDuringConflictMerge,
    #[serde(rename = "cloud-wins-overwrite")]
    CloudWinsOverwrite,
}

/// Record written to `cloud_wins_backups/` before cloud authority replaces
/// or deletes local content. The reverse direction is never backed up:
/// local overwrites of cloud are explicit user intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudWinBackupRecord {
    pub note_id: String,
    pub reason: CloudWinReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_note: Option<Note>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_note: Option<Note>,
    pub timestamp: String,
}
