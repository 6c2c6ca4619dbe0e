//! One-shot migration from the user-visible cloud folder to the private
//! app-data scope.
//!
//! The legacy layout lived where users could see it — and they edited,
//! moved, and deleted files there by hand. The private scope removes that
//! failure mode. Migration runs once per account: the first device to
//! finish writes a completion marker that peers discover, so the copy never
//! happens twice. Any copy failure aborts with legacy data untouched.
//!
//! Runs before the operations queue starts, so it talks to the remote
//! clients directly.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::fsutil;
use crate::remote::{FileQuery, RemoteClient, RemoteFileMeta};
use crate::types::{Folder, MigrationState, Note, NoteList, NoteMetadata};

const RECOVERED_FOLDER_NAME: &str = "Recovered Notes";
const JSON_MIME: &str = "application/json";

/// The user's answer to the migration prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationChoice {
    /// Keep syncing against the legacy folder.
    Skip,
    /// Migrate and keep the legacy folder as a manual backup.
    MigrateKeep,
    /// Migrate and delete the legacy folder.
    MigrateDelete,
}

/// How the migration check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// User chose to stay on the legacy folder (or the prompt timed out).
    LegacyMode,
    /// This device (or a peer) had already migrated.
    AlreadyMigrated,
    /// No cloud data anywhere; nothing to move.
    FreshInstall,
    /// The copy ran to completion on this device.
    Migrated { legacy_deleted: bool },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MigrationMarker {
    completed_at: String,
}

pub struct Migrator {
    legacy: Arc<dyn RemoteClient>,
    app_data: Arc<dyn RemoteClient>,
    state_path: PathBuf,
    events: EventBus,
    config: SyncConfig,
}

struct ScopeLayout {
    root_id: String,
    notes_id: Option<String>,
}

impl Migrator {
    pub fn new(
        legacy: Arc<dyn RemoteClient>,
        app_data: Arc<dyn RemoteClient>,
        state_path: impl Into<PathBuf>,
        events: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            legacy,
            app_data,
            state_path: state_path.into(),
            events,
            config,
        }
    }

    pub fn state(&self) -> MigrationState {
        fsutil::read_json_opt(&self.state_path)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Decide whether to migrate, prompt the user when needed, and run the
    /// copy. `choices` is the UI's answer channel (capacity 1); a bounded
    /// wait defaults to legacy mode.
    pub async fn ensure_migrated(
        &self,
        choices: &mut mpsc::Receiver<MigrationChoice>,
    ) -> Result<MigrationOutcome> {
        if self.state().migrated {
            return Ok(MigrationOutcome::AlreadyMigrated);
        }

        // A peer may have migrated while this device was offline
        if self.app_data_has_content().await? {
            tracing::info!("app-data scope already populated, adopting peer migration");
            self.save_state(MigrationState {
                migrated: true,
                migrated_at: Some(now()),
                old_data_deleted: false,
            })?;
            return Ok(MigrationOutcome::AlreadyMigrated);
        }

        let legacy_layout = match self.find_layout(self.legacy.as_ref()).await? {
            Some(layout) => layout,
            None => {
                // Nothing in the cloud at all: a fresh install
                self.save_state(MigrationState {
                    migrated: true,
                    migrated_at: Some(now()),
                    old_data_deleted: false,
                })?;
                return Ok(MigrationOutcome::FreshInstall);
            }
        };

        self.events.emit(SyncEvent::MigrationPrompt(vec![
            MigrationChoice::Skip,
            MigrationChoice::MigrateKeep,
            MigrationChoice::MigrateDelete,
        ]));
        let choice =
            match tokio::time::timeout(self.config.migration_choice_timeout, choices.recv()).await
            {
                Ok(Some(choice)) => choice,
                Ok(None) | Err(_) => {
                    tracing::info!("no migration answer, staying in legacy mode");
                    MigrationChoice::Skip
                }
            };

        match choice {
            MigrationChoice::Skip => Ok(MigrationOutcome::LegacyMode),
            MigrationChoice::MigrateKeep | MigrationChoice::MigrateDelete => {
                self.run_copy(&legacy_layout).await?;
                self.save_state(MigrationState {
                    migrated: true,
                    migrated_at: Some(now()),
                    old_data_deleted: false,
                })?;

                let mut legacy_deleted = false;
                if choice == MigrationChoice::MigrateDelete {
                    legacy_deleted = self.delete_legacy(&legacy_layout).await;
                    if legacy_deleted {
                        self.save_state(MigrationState {
                            migrated: true,
                            migrated_at: Some(now()),
                            old_data_deleted: true,
                        })?;
                    }
                }
                self.events.log("cloud storage migration complete");
                Ok(MigrationOutcome::Migrated { legacy_deleted })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn app_data_has_content(&self) -> Result<bool> {
        let Some(layout) = self.find_layout(self.app_data.as_ref()).await? else {
            return Ok(false);
        };
        let children = self
            .app_data
            .list_files(&FileQuery::children_of(&layout.root_id))
            .await
            .map_err(SyncError::Remote)?;
        Ok(children
            .iter()
            .any(|f| f.name == self.config.migration_marker_name || f.name == self.config.manifest_name))
    }

    async fn find_layout(&self, client: &dyn RemoteClient) -> Result<Option<ScopeLayout>> {
        let roots = client
            .list_files(&FileQuery::named(&self.config.root_folder_name))
            .await
            .map_err(SyncError::Remote)?;
        let Some(root) = roots.first() else {
            return Ok(None);
        };
        let notes = client
            .list_files(
                &FileQuery::named(&self.config.notes_folder_name).in_folder(&root.id),
            )
            .await
            .map_err(SyncError::Remote)?;
        Ok(Some(ScopeLayout {
            root_id: root.id.clone(),
            notes_id: notes.first().map(|f| f.id.clone()),
        }))
    }

    /// Copy manifest and note files into the app-data scope. Any failure
    /// propagates, aborting the migration with legacy data untouched.
    async fn run_copy(&self, legacy: &ScopeLayout) -> Result<()> {
        // Legacy manifest; a missing one is rebuilt empty so orphan
        // recovery below can still register strays.
        let mut manifest = match self.download_legacy_manifest(&legacy.root_id).await? {
            Some(list) => list,
            None => NoteList::empty(),
        };

        let note_files = match &legacy.notes_id {
            Some(notes_id) => self
                .legacy
                .list_files(&FileQuery::children_of(notes_id))
                .await
                .map_err(SyncError::Remote)?
                .into_iter()
                .filter(|f| f.name.ends_with(".json"))
                .collect(),
            None => Vec::new(),
        };

        let survivors = self.cleanup_legacy_orphans(&mut manifest, note_files).await?;

        // Build the private layout only once the legacy side is readable
        let app_root = self
            .app_data
            .create_folder(&self.config.root_folder_name, None)
            .await
            .map_err(SyncError::Remote)?;
        let app_notes = self
            .app_data
            .create_folder(&self.config.notes_folder_name, Some(&app_root))
            .await
            .map_err(SyncError::Remote)?;

        self.app_data
            .create_file(
                &self.config.manifest_name,
                &serde_json::to_vec(&manifest)?,
                Some(&app_root),
                JSON_MIME,
            )
            .await
            .map_err(SyncError::Remote)?;

        for file in &survivors {
            let bytes = self
                .legacy
                .download_file(&file.id)
                .await
                .map_err(SyncError::Remote)?;
            self.app_data
                .create_file(&file.name, &bytes, Some(&app_notes), JSON_MIME)
                .await
                .map_err(SyncError::Remote)?;
        }

        let marker = MigrationMarker { completed_at: now() };
        self.app_data
            .create_file(
                &self.config.migration_marker_name,
                &serde_json::to_vec(&marker)?,
                Some(&app_root),
                JSON_MIME,
            )
            .await
            .map_err(SyncError::Remote)?;
        Ok(())
    }

    /// Handle legacy `notes/` files the legacy manifest does not reference:
    /// duplicates of known content are deleted from the cloud, everything
    /// else is registered under a "Recovered Notes" folder in the manifest
    /// being copied (the local manifest is untouched — the next pull
    /// reflects the recovery).
    ///
    /// "Known content" means the notes the legacy manifest references —
    /// the account's own record of what exists. The device running the
    /// copy may be brand new with no local data, so nothing here may
    /// depend on its local store.
    ///
    /// Returns the files that should be copied to the new scope.
    async fn cleanup_legacy_orphans(
        &self,
        manifest: &mut NoteList,
        note_files: Vec<RemoteFileMeta>,
    ) -> Result<Vec<RemoteFileMeta>> {
        let referenced: std::collections::HashSet<String> = manifest
            .notes
            .iter()
            .map(|n| format!("{}.json", n.id))
            .collect();

        let mut known_hashes: std::collections::HashSet<String> =
            std::collections::HashSet::new();
        for file in note_files.iter().filter(|f| referenced.contains(&f.name)) {
            let bytes = self
                .legacy
                .download_file(&file.id)
                .await
                .map_err(SyncError::Remote)?;
            match serde_json::from_slice::<Note>(&bytes) {
                Ok(note) => {
                    known_hashes.insert(note.dedup_hash());
                }
                Err(e) => {
                    // Still copied later; it just cannot anchor dedup.
                    tracing::warn!(file = %file.name, error = %e, "referenced legacy note unparseable");
                }
            }
        }

        let mut survivors = Vec::new();
        let mut recovered_folder: Option<String> = None;

        for file in note_files {
            if referenced.contains(&file.name) {
                survivors.push(file);
                continue;
            }
            let note: Note = match self
                .legacy
                .download_file(&file.id)
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            {
                Some(note) => note,
                None => {
                    // Not a parseable note; leave it behind in the legacy
                    // folder rather than guessing.
                    tracing::warn!(file = %file.name, "unparseable legacy stray, leaving in place");
                    continue;
                }
            };

            if known_hashes.contains(&note.dedup_hash()) {
                // Exact content of a known note, or a conflict copy of one:
                // a leftover, not user data.
                tracing::info!(file = %file.name, "deleting duplicate legacy stray");
                self.legacy
                    .delete_file(&file.id)
                    .await
                    .map_err(SyncError::Remote)?;
                continue;
            }

            let folder_id = match &recovered_folder {
                Some(id) => id.clone(),
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    manifest.folders.push(Folder {
                        id: id.clone(),
                        name: RECOVERED_FOLDER_NAME.to_string(),
                        archived: false,
                    });
                    recovered_folder = Some(id.clone());
                    id
                }
            };
            let mut recovered = note.clone();
            recovered.folder_id = Some(folder_id);
            manifest.upsert_note(NoteMetadata::from_note(&recovered));
            tracing::info!(note_id = %note.id, "recovered unreferenced legacy note");
            survivors.push(file);
        }

        Ok(survivors)
    }

    async fn download_legacy_manifest(&self, root_id: &str) -> Result<Option<NoteList>> {
        let metas = self
            .legacy
            .list_files(&FileQuery::named(&self.config.manifest_name).in_folder(root_id))
            .await
            .map_err(SyncError::Remote)?;
        let Some(meta) = metas.first() else {
            return Ok(None);
        };
        let bytes = match self.legacy.download_file(&meta.id).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    /// Best-effort removal of the legacy root. Failures are logged, never
    /// fatal: the data was already copied.
    async fn delete_legacy(&self, legacy: &ScopeLayout) -> bool {
        match self.legacy.delete_file(&legacy.root_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "legacy folder deletion failed");
                self.events
                    .log("could not delete the old cloud folder; it can be removed by hand");
                false
            }
        }
    }

    fn save_state(&self, state: MigrationState) -> Result<()> {
        fsutil::atomic_write_json(&self.state_path, &state)
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
