//! Reconciles the manifest with the physical note files.
//!
//! Runs at startup and after every sync. Most divergences are repaired
//! silently (ghost entries, stale ordering, misplaced archive state);
//! the two that destroy or resurrect user data — orphan files and
//! far-future timestamps — are surfaced as issues for the user to decide.

use std::collections::HashSet;

use regex::Regex;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::local::NoteStore;
use crate::manifest::ManifestStore;
use crate::types::{NoteList, NoteMetadata, TopLevelItem, TopLevelItemType};

/// A divergence that needs a user decision.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityIssue {
    /// A physical note file the manifest does not reference.
    OrphanFile { note_id: String, title: String },
    /// A note stamped implausibly far in the future.
    FutureModifiedTime { note_id: String, modified_time: String },
}

impl IntegrityIssue {
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrityIssue::OrphanFile { .. } => "orphan_file",
            IntegrityIssue::FutureModifiedTime { .. } => "future_modified_time",
        }
    }

    pub fn note_id(&self) -> &str {
        match self {
            IntegrityIssue::OrphanFile { note_id, .. } => note_id,
            IntegrityIssue::FutureModifiedTime { note_id, .. } => note_id,
        }
    }
}

/// User decision for a surfaced issue.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityFix {
    /// Re-register an orphan file in the manifest.
    RestoreToManifest { note_id: String },
    /// Remove an orphan file from disk.
    DeleteFromDisk { note_id: String },
    /// Clamp a future timestamp to now.
    ClampModifiedTime { note_id: String },
}

/// Outcome of a validation pass.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub issues: Vec<IntegrityIssue>,
    /// Human-readable notes about silent repairs.
    pub repairs: Vec<String>,
    /// Whether the manifest was modified and persisted.
    pub manifest_changed: bool,
}

pub struct IntegrityValidator {
    conflict_title: Regex,
    pending: parking_lot::Mutex<Vec<IntegrityIssue>>,
    future_skew: chrono::Duration,
}

impl IntegrityValidator {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            conflict_title: Regex::new(r"(?i)conflict copy").expect("static pattern"),
            pending: parking_lot::Mutex::new(Vec::new()),
            future_skew: chrono::Duration::from_std(config.future_skew)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
        }
    }

    /// Validate and repair. Silent repairs are applied and persisted;
    /// issues needing a decision are retained until drained by the UI.
    pub fn validate(
        &self,
        manifest: &ManifestStore,
        notes: &dyn NoteStore,
    ) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let mut list = manifest.get();
        let before = list.clone();

        let physical: HashSet<String> = notes.list_note_ids()?.into_iter().collect();

        self.drop_ghost_entries(&mut list, &physical, &mut report);
        self.surface_orphans(&list, &physical, notes, &mut report);
        self.prune_dangling_order(&mut list, &mut report);
        self.append_missing_active(&mut list, &mut report);
        self.relocate_archived(&mut list, &mut report);
        self.clear_bad_folder_refs(&mut list, &mut report);
        self.surface_future_timestamps(&list, &mut report);
        self.delete_conflict_duplicates(&mut list, notes, &mut report)?;

        if list != before {
            manifest.save(list)?;
            report.manifest_changed = true;
        }

        if !report.issues.is_empty() {
            self.pending.lock().extend(report.issues.iter().cloned());
        }
        Ok(report)
    }

    /// Issues accumulated since the last drain. The UI presents these once.
    pub fn drain_issues(&self) -> Vec<IntegrityIssue> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Apply user decisions for previously surfaced issues.
    pub fn apply_fixes(
        &self,
        fixes: &[IntegrityFix],
        manifest: &ManifestStore,
        notes: &dyn NoteStore,
    ) -> Result<()> {
        for fix in fixes {
            match fix {
                IntegrityFix::RestoreToManifest { note_id } => {
                    let note = notes.load_note(note_id)?;
                    manifest.update(|list| {
                        list.upsert_note(NoteMetadata::from_note(&note));
                        let item = TopLevelItem::note(note_id);
                        if note.archived {
                            if !list.archived_top_level_order.contains(&item) {
                                list.archived_top_level_order.push(item);
                            }
                        } else if !list.top_level_order.contains(&item) {
                            list.top_level_order.push(item);
                        }
                    })?;
                }
                IntegrityFix::DeleteFromDisk { note_id } => {
                    notes.delete_note(note_id)?;
                }
                IntegrityFix::ClampModifiedTime { note_id } => {
                    let mut note = notes.load_note(note_id)?;
                    note.modified_time =
                        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                    notes.save_note(&note)?;
                    let meta = NoteMetadata::from_note(&note);
                    manifest.update(|list| list.upsert_note(meta))?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Passes
    // -----------------------------------------------------------------------

    /// Manifest entries with no physical file cannot be recovered; remove.
    fn drop_ghost_entries(
        &self,
        list: &mut NoteList,
        physical: &HashSet<String>,
        report: &mut IntegrityReport,
    ) {
        let ghosts: Vec<String> = list
            .notes
            .iter()
            .filter(|n| !physical.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        for id in ghosts {
            tracing::warn!(note_id = %id, "manifest entry has no file, removing");
            report.repairs.push(format!("removed ghost entry {id}"));
            list.remove_note(&id);
        }
    }

    /// Physical files the manifest does not know. Restoring or deleting is
    /// the user's call.
    fn surface_orphans(
        &self,
        list: &NoteList,
        physical: &HashSet<String>,
        notes: &dyn NoteStore,
        report: &mut IntegrityReport,
    ) {
        for id in physical {
            if list.note(id).is_some() {
                continue;
            }
            let title = match notes.load_note(id) {
                Ok(note) => note.title,
                Err(e) => {
                    // Unreadable strays are surfaced too; the user can only
                    // sensibly delete them, but that stays their call.
                    tracing::warn!(note_id = %id, error = %e, "orphan file unreadable");
                    String::new()
                }
            };
            report.issues.push(IntegrityIssue::OrphanFile {
                note_id: id.clone(),
                title,
            });
        }
    }

    /// Order entries pointing at IDs that no longer exist.
    fn prune_dangling_order(&self, list: &mut NoteList, report: &mut IntegrityReport) {
        let note_ids: HashSet<&str> = list.notes.iter().map(|n| n.id.as_str()).collect();
        let folder_ids: HashSet<&str> = list.folders.iter().map(|f| f.id.as_str()).collect();
        let exists = |item: &TopLevelItem| match item.item_type {
            TopLevelItemType::Note => note_ids.contains(item.id.as_str()),
            TopLevelItemType::Folder => folder_ids.contains(item.id.as_str()),
        };

        let before = list.top_level_order.len() + list.archived_top_level_order.len();
        list.top_level_order.retain(&exists);
        list.archived_top_level_order.retain(&exists);
        let removed = before - list.top_level_order.len() - list.archived_top_level_order.len();
        if removed > 0 {
            report
                .repairs
                .push(format!("pruned {removed} dangling order entries"));
        }
    }

    /// Every active note/folder must appear somewhere in the active order.
    fn append_missing_active(&self, list: &mut NoteList, report: &mut IntegrityReport) {
        let ordered: HashSet<String> = list
            .top_level_order
            .iter()
            .chain(&list.archived_top_level_order)
            .map(|e| e.id.clone())
            .collect();

        let mut appended = 0;
        let missing_notes: Vec<TopLevelItem> = list
            .notes
            .iter()
            .filter(|n| !n.archived && !ordered.contains(&n.id))
            .map(|n| TopLevelItem::note(&n.id))
            .collect();
        let missing_folders: Vec<TopLevelItem> = list
            .folders
            .iter()
            .filter(|f| !f.archived && !ordered.contains(&f.id))
            .map(|f| TopLevelItem::folder(&f.id))
            .collect();
        appended += missing_notes.len() + missing_folders.len();
        list.top_level_order.extend(missing_notes);
        list.top_level_order.extend(missing_folders);
        if appended > 0 {
            report
                .repairs
                .push(format!("appended {appended} unlisted items to order"));
        }
    }

    /// Archived items belong in the archived order, and vice versa.
    fn relocate_archived(&self, list: &mut NoteList, report: &mut IntegrityReport) {
        let archived: HashSet<String> = list
            .notes
            .iter()
            .filter(|n| n.archived)
            .map(|n| n.id.clone())
            .chain(
                list.folders
                    .iter()
                    .filter(|f| f.archived)
                    .map(|f| f.id.clone()),
            )
            .collect();

        let misplaced: Vec<TopLevelItem> = list
            .top_level_order
            .iter()
            .filter(|e| archived.contains(&e.id))
            .cloned()
            .collect();
        if !misplaced.is_empty() {
            report
                .repairs
                .push(format!("moved {} archived items out of active order", misplaced.len()));
            list.top_level_order.retain(|e| !archived.contains(&e.id));
            for item in misplaced {
                if !list.archived_top_level_order.contains(&item) {
                    list.archived_top_level_order.push(item);
                }
            }
        }
    }

    /// An archived note cannot live inside an active folder.
    fn clear_bad_folder_refs(&self, list: &mut NoteList, report: &mut IntegrityReport) {
        let active_folders: HashSet<String> = list
            .folders
            .iter()
            .filter(|f| !f.archived)
            .map(|f| f.id.clone())
            .collect();
        let mut cleared = 0;
        for note in &mut list.notes {
            if note.archived {
                if let Some(folder_id) = &note.folder_id {
                    if active_folders.contains(folder_id) {
                        note.folder_id = None;
                        cleared += 1;
                    }
                }
            }
        }
        if cleared > 0 {
            report
                .repairs
                .push(format!("cleared folder refs on {cleared} archived notes"));
        }
    }

    fn surface_future_timestamps(&self, list: &NoteList, report: &mut IntegrityReport) {
        let horizon = chrono::Utc::now() + self.future_skew;
        for note in &list.notes {
            if note.modified_at() > horizon {
                report.issues.push(IntegrityIssue::FutureModifiedTime {
                    note_id: note.id.clone(),
                    modified_time: note.modified_time.clone(),
                });
            }
        }
    }

    /// Conflict copies whose content duplicates another note are leftovers
    /// of resolved conflicts; delete them outright.
    fn delete_conflict_duplicates(
        &self,
        list: &mut NoteList,
        notes: &dyn NoteStore,
        report: &mut IntegrityReport,
    ) -> Result<()> {
        let mut hashes: Vec<(String, String, bool)> = Vec::new(); // (id, dedup, is_copy)
        for meta in &list.notes {
            match notes.load_note(&meta.id) {
                Ok(note) => {
                    let is_copy = self.conflict_title.is_match(&note.title);
                    hashes.push((note.id.clone(), note.dedup_hash(), is_copy));
                }
                Err(e) => {
                    tracing::warn!(note_id = %meta.id, error = %e, "skipping unreadable note");
                }
            }
        }

        let mut to_delete: Vec<String> = Vec::new();
        for (id, hash, is_copy) in &hashes {
            if !is_copy {
                continue;
            }
            let duplicated = hashes
                .iter()
                .any(|(other_id, other_hash, _)| other_id != id && other_hash == hash);
            if duplicated {
                to_delete.push(id.clone());
            }
        }

        for id in to_delete {
            tracing::info!(note_id = %id, "deleting duplicate conflict copy");
            notes.delete_note(&id)?;
            list.remove_note(&id);
            report
                .repairs
                .push(format!("deleted duplicate conflict copy {id}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::FsNoteStore;
    use crate::types::{Folder, Note};

    fn make_note(id: &str, content: &str) -> Note {
        Note {
            id: id.to_string(),
            title: format!("Note {id}"),
            content: content.to_string(),
            content_header: None,
            language: "plaintext".to_string(),
            modified_time: "2025-01-01T00:00:00Z".to_string(),
            archived: false,
            folder_id: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        notes: FsNoteStore,
        manifest: ManifestStore,
        validator: IntegrityValidator,
    }

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let notes = FsNoteStore::new(dir.path().join("notes"));
        let manifest = ManifestStore::load(dir.path().join("noteList_v2.json"), &notes);
        let validator = IntegrityValidator::new(&SyncConfig::default());
        Fixture {
            _dir: dir,
            notes,
            manifest,
            validator,
        }
    }

    fn register(fx: &Fixture, note: &Note) {
        fx.notes.save_note(note).unwrap();
        fx.manifest
            .update(|list| {
                list.upsert_note(NoteMetadata::from_note(note));
                let item = TopLevelItem::note(&note.id);
                if note.archived {
                    list.archived_top_level_order.push(item);
                } else {
                    list.top_level_order.push(item);
                }
            })
            .unwrap();
    }

    #[test]
    fn orphan_file_is_surfaced_not_fixed() {
        let fx = setup();
        fx.notes.save_note(&make_note("stray", "content")).unwrap();

        let report = fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind(), "orphan_file");
        // The file itself is untouched
        assert!(fx.notes.load_note("stray").is_ok());
    }

    #[test]
    fn ghost_entry_silently_removed() {
        let fx = setup();
        fx.manifest
            .update(|list| {
                list.upsert_note(NoteMetadata::from_note(&make_note("ghost", "x")));
                list.top_level_order.push(TopLevelItem::note("ghost"));
            })
            .unwrap();

        let report = fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        assert!(report.issues.is_empty());
        assert!(report.manifest_changed);
        assert!(fx.manifest.get().note("ghost").is_none());
        assert!(fx.manifest.get().top_level_order.is_empty());
    }

    #[test]
    fn dangling_order_entry_pruned_and_missing_appended() {
        let fx = setup();
        register(&fx, &make_note("n1", "x"));
        fx.manifest
            .update(|list| {
                list.top_level_order.push(TopLevelItem::note("gone"));
                list.top_level_order.retain(|e| e.id != "n1"); // n1 unlisted
            })
            .unwrap();

        fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        let list = fx.manifest.get();
        assert_eq!(list.top_level_order.len(), 1);
        assert_eq!(list.top_level_order[0].id, "n1");
    }

    #[test]
    fn archived_note_moves_to_archived_order() {
        let fx = setup();
        let mut note = make_note("n1", "x");
        note.archived = true;
        fx.notes.save_note(&note).unwrap();
        fx.manifest
            .update(|list| {
                list.upsert_note(NoteMetadata::from_note(&note));
                // Wrongly listed in the active order
                list.top_level_order.push(TopLevelItem::note("n1"));
            })
            .unwrap();

        fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        let list = fx.manifest.get();
        assert!(list.top_level_order.is_empty());
        assert_eq!(list.archived_top_level_order.len(), 1);
    }

    #[test]
    fn archived_note_in_active_folder_loses_ref() {
        let fx = setup();
        let mut note = make_note("n1", "x");
        note.archived = true;
        note.folder_id = Some("f1".to_string());
        fx.notes.save_note(&note).unwrap();
        fx.manifest
            .update(|list| {
                list.folders.push(Folder {
                    id: "f1".to_string(),
                    name: "Active".to_string(),
                    archived: false,
                });
                list.upsert_note(NoteMetadata::from_note(&note));
            })
            .unwrap();

        fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        assert_eq!(fx.manifest.get().note("n1").unwrap().folder_id, None);
    }

    #[test]
    fn future_timestamp_surfaced() {
        let fx = setup();
        let mut note = make_note("n1", "x");
        note.modified_time = (chrono::Utc::now() + chrono::Duration::hours(2))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        register(&fx, &note);

        let report = fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind(), "future_modified_time");
    }

    #[test]
    fn conflict_copy_duplicate_auto_deleted() {
        let fx = setup();
        register(&fx, &make_note("orig", "shared body"));
        let mut copy = make_note("copy", "shared body");
        copy.title = "Note orig (conflict copy)".to_string();
        register(&fx, &copy);

        fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        assert!(fx.manifest.get().note("copy").is_none());
        assert!(fx.notes.load_note("copy").is_err());
        assert!(fx.manifest.get().note("orig").is_some());
    }

    #[test]
    fn conflict_copy_with_unique_content_kept() {
        let fx = setup();
        register(&fx, &make_note("orig", "body A"));
        let mut copy = make_note("copy", "body B");
        copy.title = "Note orig (conflict copy)".to_string();
        register(&fx, &copy);

        fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        assert!(fx.manifest.get().note("copy").is_some());
    }

    #[test]
    fn fixes_apply() {
        let fx = setup();
        fx.notes.save_note(&make_note("stray", "keep me")).unwrap();
        fx.notes.save_note(&make_note("junk", "drop me")).unwrap();

        fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        let issues = fx.validator.drain_issues();
        assert_eq!(issues.len(), 2);
        // Drained once: a second drain is empty
        assert!(fx.validator.drain_issues().is_empty());

        fx.validator
            .apply_fixes(
                &[
                    IntegrityFix::RestoreToManifest {
                        note_id: "stray".to_string(),
                    },
                    IntegrityFix::DeleteFromDisk {
                        note_id: "junk".to_string(),
                    },
                ],
                &fx.manifest,
                &fx.notes,
            )
            .unwrap();

        assert!(fx.manifest.get().note("stray").is_some());
        assert!(fx.notes.load_note("junk").is_err());
    }

    #[test]
    fn clean_state_reports_nothing() {
        let fx = setup();
        register(&fx, &make_note("n1", "x"));
        let report = fx.validator.validate(&fx.manifest, &fx.notes).unwrap();
        assert!(report.issues.is_empty());
        assert!(report.repairs.is_empty());
        assert!(!report.manifest_changed);
    }
}
