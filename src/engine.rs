//! The sync orchestrator.
//!
//! Every full sync runs the same phases under one mutex: acquire the cloud
//! baseline, push local changes, pull cloud changes against the three-way
//! baseline, resolve conflicts newest-wins, then commit through the
//! revision guard. Foreground edits never wait on this mutex — they only
//! mark state dirty — so a sync can take as long as the network needs.
//!
//! Conflict-prone decisions all reduce to three hashes per note: the local
//! content hash, the cloud content hash (from the cloud manifest), and the
//! baseline hash recorded at the last confirmed sync. Equal-to-baseline
//! means "unchanged on that side"; both sides diverging is a conflict.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backup::BackupLog;
use crate::config::SyncConfig;
use crate::error::{RemoteErrorKind, Result, SyncError};
use crate::events::{DriveStatus, EventBus, SyncEvent};
use crate::file_ids::FileIdCache;
use crate::local::NoteStore;
use crate::manifest::ManifestStore;
use crate::queue::OpsQueue;
use crate::remote::FileQuery;
use crate::state::{DirtySnapshot, SyncCommit, SyncStateStore};
use crate::types::{CloudWinReason, Note, NoteList, NoteMetadata, TopLevelItem};

pub const JSON_MIME: &str = "application/json";

/// Resolved IDs of the remote folder layout.
#[derive(Debug, Clone)]
pub struct RemoteFolders {
    pub root_id: String,
    pub notes_id: String,
}

/// Counters for one sync cycle, in the shape the UI log line wants.
#[derive(Debug, Default, Clone)]
pub struct SyncOutcome {
    pub pushed: usize,
    pub pulled: usize,
    pub deleted_remote: usize,
    pub deleted_local: usize,
    pub conflicts: usize,
    /// Per-note failures that did not abort the cycle.
    pub errors: Vec<String>,
}

impl SyncOutcome {
    fn changed_anything(&self) -> bool {
        self.pushed + self.pulled + self.deleted_remote + self.deleted_local + self.conflicts > 0
    }
}

pub struct SyncEngineOptions {
    pub queue: Arc<OpsQueue>,
    pub state: Arc<SyncStateStore>,
    pub manifest: Arc<ManifestStore>,
    pub notes: Arc<dyn NoteStore>,
    pub file_ids: Arc<FileIdCache>,
    pub backups: BackupLog,
    pub events: EventBus,
    pub config: SyncConfig,
    /// Per-process UUID stamped into every manifest upload.
    pub client_id: String,
}

pub struct SyncEngine {
    queue: Arc<OpsQueue>,
    state: Arc<SyncStateStore>,
    manifest: Arc<ManifestStore>,
    notes: Arc<dyn NoteStore>,
    file_ids: Arc<FileIdCache>,
    backups: BackupLog,
    events: EventBus,
    config: SyncConfig,
    client_id: String,
    sync_lock: tokio::sync::Mutex<()>,
    layout: Mutex<Option<RemoteFolders>>,
    manifest_file_id: Mutex<Option<String>>,
}

/// What the pull phase decided about one cloud note.
enum PullDecision {
    UpToDate { hash: String },
    Download,
    Conflict,
    Skip,
}

impl SyncEngine {
    pub fn new(options: SyncEngineOptions) -> Self {
        Self {
            queue: options.queue,
            state: options.state,
            manifest: options.manifest,
            notes: options.notes,
            file_ids: options.file_ids,
            backups: options.backups,
            events: options.events,
            config: options.config,
            client_id: options.client_id,
            sync_lock: tokio::sync::Mutex::new(()),
            layout: Mutex::new(None),
            manifest_file_id: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The remote layout, once a sync has resolved it.
    pub fn remote_layout(&self) -> Option<RemoteFolders> {
        self.layout.lock().clone()
    }

    /// Run one full sync cycle. Serialized with every other entry point by
    /// the sync mutex.
    pub async fn sync_notes(&self) -> Result<SyncOutcome> {
        let _guard = self.sync_lock.lock().await;
        self.events.status(DriveStatus::Syncing);

        let result = self.run_cycle().await;
        match &result {
            Ok(outcome) => {
                self.events.status(DriveStatus::Synced);
                if outcome.pulled + outcome.deleted_local + outcome.conflicts > 0 {
                    self.events.emit(SyncEvent::NotesUpdated);
                }
                if outcome.changed_anything() {
                    self.events.log(format!(
                        "sync: {} pushed, {} pulled, {} conflicts",
                        outcome.pushed, outcome.pulled, outcome.conflicts
                    ));
                }
                for error in &outcome.errors {
                    tracing::warn!(error = %error, "sync item failure");
                }
            }
            Err(e) => {
                match e.remote_kind() {
                    Some(RemoteErrorKind::Auth) | Some(RemoteErrorKind::Quota) => {
                        self.events.status(DriveStatus::Offline);
                        self.events.error(e.to_string());
                    }
                    _ if e.is_cancelled() => {}
                    _ => {
                        self.events.status(DriveStatus::Offline);
                    }
                }
                tracing::warn!(error = %e, "sync cycle failed");
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Cycle
    // -----------------------------------------------------------------------

    async fn run_cycle(&self) -> Result<SyncOutcome> {
        let snapshot = self.state.dirty_snapshot();
        let layout = self.ensure_layout().await?;

        // Phase 0 — baseline acquisition
        match self.fetch_cloud_manifest(&layout).await? {
            None => self.fresh_cloud_push(&layout, &snapshot).await,
            Some((cloud_list, cloud_ts)) => {
                self.three_way_sync(&layout, &snapshot, cloud_list, cloud_ts)
                    .await
            }
        }
    }

    /// Fresh cloud: nothing remote yet, so everything local goes up.
    async fn fresh_cloud_push(
        &self,
        layout: &RemoteFolders,
        snapshot: &DirtySnapshot,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();
        let mut commit = SyncCommit {
            deleted_notes: snapshot.deleted_notes.clone(),
            deleted_folders: snapshot.deleted_folders.clone(),
            ..SyncCommit::default()
        };

        let mut merged = self.manifest.get();
        for id in &commit.deleted_notes {
            merged.remove_note(id);
        }
        for id in &commit.deleted_folders {
            merged.remove_folder(id);
        }

        let note_ids: Vec<String> = merged.notes.iter().map(|n| n.id.clone()).collect();
        for id in &note_ids {
            let note = match self.notes.load_note(id) {
                Ok(note) => note,
                Err(e) => {
                    outcome.errors.push(format!("{id}: {e}"));
                    continue;
                }
            };
            match self.upload_note(layout, &note).await {
                Ok(()) => {
                    commit
                        .synced_hashes
                        .insert(id.clone(), note.content_hash());
                    merged.upsert_note(NoteMetadata::from_note(&note));
                    outcome.pushed += 1;
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => outcome.errors.push(format!("{id}: {e}")),
            }
        }

        let uploaded_ts = self.upload_manifest(layout, &mut merged).await?;
        commit.cloud_ts = uploaded_ts;
        self.manifest.save(merged)?;
        self.commit_state(snapshot, &commit)?;
        Ok(outcome)
    }

    async fn three_way_sync(
        &self,
        layout: &RemoteFolders,
        snapshot: &DirtySnapshot,
        cloud_list: NoteList,
        cloud_ts: String,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();
        let mut commit = SyncCommit::default();
        let local_list = self.manifest.get();

        let dirty_at_snapshot: HashSet<&str> =
            snapshot.dirty_notes.iter().map(String::as_str).collect();
        let deleted_at_snapshot: HashSet<&str> =
            snapshot.deleted_notes.iter().map(String::as_str).collect();

        // Structural divergence: local layout wins only when the user moved
        // things around here; otherwise the cloud's layout is authoritative.
        let mut merged = if snapshot.note_list_dirty {
            let mut m = local_list.clone();
            // Note entries still start from the cloud's view; the phases
            // below overwrite them per note.
            m.notes = cloud_list.notes.clone();
            m
        } else {
            cloud_list.clone()
        };

        let mut conflicts: Vec<NoteMetadata> = Vec::new();

        // Phase 1 — push local changes
        for id in &snapshot.dirty_notes {
            let note = match self.notes.load_note(id) {
                Ok(note) => note,
                Err(SyncError::NoteNotFound(_)) => {
                    // Dirty but gone from disk: nothing to push. Leave the
                    // flag; the integrity validator untangles it.
                    continue;
                }
                Err(e) => {
                    outcome.errors.push(format!("{id}: {e}"));
                    continue;
                }
            };
            let local_hash = note.content_hash();
            let baseline = self.state.baseline_hash(id);
            let cloud_entry = cloud_list.note(id);

            if baseline.as_deref() == Some(local_hash.as_str()) {
                // Dirty flag without a content change. A conflict needs both
                // sides diverged from the baseline, and this side has not:
                // never push, never arbitrate. A cloud edit in that window
                // is a plain pull, and a cloud deletion a plain local
                // delete — both belong to the next phase, so only the
                // nothing-changed-anywhere case commits here.
                if cloud_entry.is_some_and(|e| e.content_hash == local_hash) {
                    commit.synced_hashes.insert(id.clone(), local_hash);
                }
                continue;
            }

            if let Some(entry) = cloud_entry {
                if entry.content_hash == local_hash {
                    // Same content on both sides already
                    commit.synced_hashes.insert(id.clone(), local_hash);
                    continue;
                }
                if baseline.as_deref() != Some(entry.content_hash.as_str()) {
                    // Both sides moved: defer to conflict resolution, do not
                    // clobber the cloud copy yet.
                    conflicts.push(entry.clone());
                    continue;
                }
            }

            match self.upload_note(layout, &note).await {
                Ok(()) => {
                    commit.synced_hashes.insert(id.clone(), local_hash);
                    merged.upsert_note(NoteMetadata::from_note(&note));
                    outcome.pushed += 1;
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => outcome.errors.push(format!("{id}: {e}")),
            }
        }

        // Phase 1b — propagate local deletions
        for id in &snapshot.deleted_notes {
            match self.delete_remote_note(layout, id).await {
                Ok(()) => {
                    commit.deleted_notes.push(id.clone());
                    merged.remove_note(id);
                    outcome.deleted_remote += 1;
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => outcome.errors.push(format!("{id}: {e}")),
            }
        }
        for id in &snapshot.deleted_folders {
            // Folders exist only as manifest entries
            merged.remove_folder(id);
            commit.deleted_folders.push(id.clone());
        }

        // Phase 2 — pull cloud changes
        for cloud_meta in &cloud_list.notes {
            let id = cloud_meta.id.as_str();
            if deleted_at_snapshot.contains(id)
                || commit.synced_hashes.contains_key(id)
                || conflicts.iter().any(|c| c.id == id)
            {
                continue;
            }

            let decision = match self.notes.load_note(id) {
                Err(SyncError::NoteNotFound(_)) => PullDecision::Download,
                Err(e) => {
                    outcome.errors.push(format!("{id}: {e}"));
                    PullDecision::Skip
                }
                Ok(local_note) => {
                    let local_hash = local_note.content_hash();
                    let baseline = self.state.baseline_hash(id);
                    if cloud_meta.content_hash == local_hash {
                        PullDecision::UpToDate { hash: local_hash }
                    } else if baseline.as_deref() == Some(local_hash.as_str()) {
                        // Cloud changed, local did not. The local copy is
                        // still backed up before it is replaced.
                        self.backups.record(
                            CloudWinReason::CloudWinsOverwrite,
                            id,
                            Some(&local_note),
                            None,
                        );
                        PullDecision::Download
                    } else if baseline.as_deref() == Some(cloud_meta.content_hash.as_str()) {
                        // Local changed, cloud did not: push-side concern.
                        PullDecision::Skip
                    } else {
                        PullDecision::Conflict
                    }
                }
            };

            match decision {
                PullDecision::UpToDate { hash } => {
                    commit.synced_hashes.insert(id.to_string(), hash);
                }
                PullDecision::Download => match self.download_note(cloud_meta).await {
                    Ok(Some(cloud_note)) => {
                        if self.save_pulled_note(&cloud_note, &dirty_at_snapshot) {
                            commit
                                .synced_hashes
                                .insert(id.to_string(), cloud_meta.content_hash.clone());
                            merged.upsert_note(cloud_meta.clone());
                            outcome.pulled += 1;
                        }
                    }
                    Ok(None) => {
                        // Listed in the cloud manifest but the file is gone;
                        // the next cycle sees a corrected manifest.
                        tracing::warn!(note_id = id, "cloud manifest entry without file");
                        merged.remove_note(id);
                    }
                    Err(e) => outcome.errors.push(format!("{id}: {e}")),
                },
                PullDecision::Conflict => conflicts.push(cloud_meta.clone()),
                PullDecision::Skip => {}
            }
        }

        // Phase 2b — remote deletions: local notes the cloud manifest lost
        for local_meta in &local_list.notes {
            let id = local_meta.id.as_str();
            if cloud_list.note(id).is_some()
                || deleted_at_snapshot.contains(id)
                || commit.synced_hashes.contains_key(id)
            {
                continue;
            }
            let baseline = self.state.baseline_hash(id);
            match self.notes.load_note(id) {
                Err(_) => continue,
                Ok(local_note) => {
                    if baseline.is_some() {
                        let locally_changed =
                            baseline.as_deref() != Some(local_note.content_hash().as_str());
                        if dirty_at_snapshot.contains(id) && locally_changed {
                            // Deleted remotely but genuinely edited here: the
                            // push phase already re-created it.
                            continue;
                        }
                        self.backups.record(
                            CloudWinReason::CloudDeleteDuringPull,
                            id,
                            Some(&local_note),
                            None,
                        );
                        if let Err(e) = self.notes.delete_note(id) {
                            outcome.errors.push(format!("{id}: {e}"));
                            continue;
                        }
                        merged.remove_note(id);
                        commit.deleted_notes.push(id.to_string());
                        outcome.deleted_local += 1;
                    } else {
                        // Never synced and unknown to the cloud: a device
                        // joining an existing account with pre-existing data.
                        match self.upload_note(layout, &local_note).await {
                            Ok(()) => {
                                commit
                                    .synced_hashes
                                    .insert(id.to_string(), local_note.content_hash());
                                merged.upsert_note(NoteMetadata::from_note(&local_note));
                                outcome.pushed += 1;
                            }
                            Err(e) if e.is_cancelled() => {}
                            Err(e) => outcome.errors.push(format!("{id}: {e}")),
                        }
                    }
                }
            }
        }

        // Phase 3 — conflict resolution, newest modified_time wins
        for cloud_meta in &conflicts {
            match self
                .resolve_conflict(layout, cloud_meta, &dirty_at_snapshot)
                .await
            {
                Ok(Some((hash, meta, pulled))) => {
                    commit.synced_hashes.insert(cloud_meta.id.clone(), hash);
                    merged.upsert_note(meta);
                    outcome.conflicts += 1;
                    if pulled {
                        outcome.pulled += 1;
                    } else {
                        outcome.pushed += 1;
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => outcome.errors.push(format!("{}: {}", cloud_meta.id, e)),
            }
        }

        self.reconcile_order(&mut merged);

        // Commit
        let current = self.state.dirty_snapshot();
        let revision_unchanged = current.revision == snapshot.revision;
        let note_list_only = !revision_unchanged && {
            let before: BTreeSet<&String> = snapshot.dirty_notes.iter().collect();
            let after: BTreeSet<&String> = current.dirty_notes.iter().collect();
            let deleted_before: BTreeSet<&String> = snapshot.deleted_notes.iter().collect();
            let deleted_after: BTreeSet<&String> = current.deleted_notes.iter().collect();
            after.is_subset(&before) && deleted_after == deleted_before
        };

        let manifest_diverged =
            !Self::lists_equivalent(&merged, &cloud_list) || snapshot.note_list_dirty;
        if manifest_diverged && (revision_unchanged || note_list_only) {
            // Upload failure aborts the commit: baseline stays put, dirty
            // flags stay set, and the next cycle retries.
            commit.cloud_ts = self.upload_manifest(layout, &mut merged).await?;
        } else {
            commit.cloud_ts = cloud_ts;
        }

        self.manifest.save(merged)?;
        self.commit_state(snapshot, &commit)?;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Phase helpers
    // -----------------------------------------------------------------------

    /// Upload one note body, creating or updating as needed.
    async fn upload_note(&self, layout: &RemoteFolders, note: &Note) -> Result<()> {
        let bytes = serde_json::to_vec(note)?;
        let name = self.config.note_file_name(&note.id);
        match self.queue.get_file_id(&note.id, &layout.notes_id).await? {
            Some(file_id) => match self.queue.update_file(&file_id, bytes.clone()).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_not_found() => {
                    // Cache pointed at a file someone deleted underneath us
                    self.file_ids.invalidate(&note.id);
                    self.queue
                        .create_file(
                            Some(&note.id),
                            &name,
                            bytes,
                            Some(&layout.notes_id),
                            JSON_MIME,
                        )
                        .await?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => {
                self.queue
                    .create_file(
                        Some(&note.id),
                        &name,
                        bytes,
                        Some(&layout.notes_id),
                        JSON_MIME,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Delete the remote file for a tombstoned note. Absence counts as
    /// success: the deletion is already true remotely.
    async fn delete_remote_note(&self, layout: &RemoteFolders, id: &str) -> Result<()> {
        match self.queue.get_file_id(id, &layout.notes_id).await? {
            None => Ok(()),
            Some(file_id) => match self.queue.delete_file(&file_id, Some(id)).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    /// Download and parse a note body. `Ok(None)` when the file is gone.
    async fn download_note(&self, meta: &NoteMetadata) -> Result<Option<Note>> {
        let layout = match self.remote_layout() {
            Some(layout) => layout,
            None => return Ok(None),
        };
        let file_id = match self.queue.get_file_id(&meta.id, &layout.notes_id).await? {
            Some(file_id) => file_id,
            None => return Ok(None),
        };
        let bytes = match self.queue.download(&file_id).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Save a downloaded note unless it became dirty after the snapshot —
    /// the download must never clobber an edit that raced it.
    fn save_pulled_note(&self, note: &Note, dirty_at_snapshot: &HashSet<&str>) -> bool {
        if self.state.is_note_dirty(&note.id) && !dirty_at_snapshot.contains(note.id.as_str()) {
            tracing::info!(note_id = %note.id, "skipping pull into freshly edited note");
            return false;
        }
        match self.notes.save_note(note) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(note_id = %note.id, error = %e, "saving pulled note failed");
                false
            }
        }
    }

    /// Resolve one conflicted note. Returns the committed hash, the winning
    /// metadata, and whether the cloud side won.
    async fn resolve_conflict(
        &self,
        layout: &RemoteFolders,
        cloud_meta: &NoteMetadata,
        dirty_at_snapshot: &HashSet<&str>,
    ) -> Result<Option<(String, NoteMetadata, bool)>> {
        let id = cloud_meta.id.as_str();
        let local = match self.notes.load_note(id) {
            Ok(note) => note,
            Err(SyncError::NoteNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let cloud_note = match self.download_note(cloud_meta).await? {
            Some(note) => note,
            None => {
                // The cloud side of the conflict vanished mid-merge. Keep
                // the local edit; it re-pushes next cycle.
                self.backups.record(
                    CloudWinReason::CloudDeleteDuringConflictMerge,
                    id,
                    Some(&local),
                    None,
                );
                return Ok(None);
            }
        };

        // Ties prefer local: the user in front of this device wins.
        if local.modified_at() >= cloud_note.modified_at() {
            self.upload_note(layout, &local).await?;
            let hash = local.content_hash();
            Ok(Some((hash, NoteMetadata::from_note(&local), false)))
        } else {
            self.backups.record(
                CloudWinReason::CloudWinsOverwrite,
                id,
                Some(&local),
                Some(&cloud_note),
            );
            if !self.save_pulled_note(&cloud_note, dirty_at_snapshot) {
                return Ok(None);
            }
            let hash = cloud_note.content_hash();
            Ok(Some((hash, NoteMetadata::from_note(&cloud_note), true)))
        }
    }

    /// Every surviving note must appear in exactly one order list.
    fn reconcile_order(&self, list: &mut NoteList) {
        let known: HashSet<String> = list
            .top_level_order
            .iter()
            .chain(&list.archived_top_level_order)
            .map(|e| e.id.clone())
            .collect();
        let missing: Vec<(bool, String)> = list
            .notes
            .iter()
            .filter(|n| !known.contains(&n.id))
            .map(|n| (n.archived, n.id.clone()))
            .collect();
        for (archived, id) in missing {
            let item = TopLevelItem::note(id);
            if archived {
                list.archived_top_level_order.push(item);
            } else {
                list.top_level_order.push(item);
            }
        }
    }

    fn commit_state(&self, snapshot: &DirtySnapshot, commit: &SyncCommit) -> Result<()> {
        let cleared = self.state.clear_dirty_if_unchanged(snapshot.revision, commit)?;
        if !cleared {
            tracing::info!("edits raced the sync; keeping dirty flags");
            self.state.update_synced_state(commit)?;
        }
        Ok(())
    }

    /// Compare manifests ignoring the uploader stamp.
    fn lists_equivalent(a: &NoteList, b: &NoteList) -> bool {
        let mut a = a.clone();
        let mut b = b.clone();
        a.last_sync_client_id = None;
        b.last_sync_client_id = None;
        a == b
    }

    // -----------------------------------------------------------------------
    // Remote layout and manifest
    // -----------------------------------------------------------------------

    async fn ensure_layout(&self) -> Result<RemoteFolders> {
        if let Some(layout) = self.remote_layout() {
            return Ok(layout);
        }
        let root_id = match self
            .queue
            .list(FileQuery::named(&self.config.root_folder_name))
            .await?
            .first()
        {
            Some(meta) => meta.id.clone(),
            None => {
                self.queue
                    .create_folder(&self.config.root_folder_name, None)
                    .await?
            }
        };
        let notes_id = match self
            .queue
            .list(
                FileQuery::named(&self.config.notes_folder_name).in_folder(&root_id),
            )
            .await?
            .first()
        {
            Some(meta) => meta.id.clone(),
            None => {
                self.queue
                    .create_folder(&self.config.notes_folder_name, Some(&root_id))
                    .await?
            }
        };
        // Prime the file-ID cache with one walk instead of a listing per
        // note on the first cycle.
        let files = self
            .queue
            .list(FileQuery::children_of(&notes_id))
            .await?;
        self.file_ids.rebuild(files.iter().filter_map(|f| {
            f.name
                .strip_suffix(".json")
                .map(|stem| (stem.to_string(), f.id.clone()))
        }));

        let layout = RemoteFolders { root_id, notes_id };
        *self.layout.lock() = Some(layout.clone());
        Ok(layout)
    }

    /// The cloud manifest and its modification stamp, or `None` on a fresh
    /// cloud.
    async fn fetch_cloud_manifest(
        &self,
        layout: &RemoteFolders,
    ) -> Result<Option<(NoteList, String)>> {
        let metas = self
            .queue
            .list(FileQuery::named(&self.config.manifest_name).in_folder(&layout.root_id))
            .await?;
        let meta = match metas.first() {
            Some(meta) => meta.clone(),
            None => return Ok(None),
        };
        *self.manifest_file_id.lock() = Some(meta.id.clone());

        let bytes = match self.queue.download(&meta.id).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<NoteList>(&bytes) {
            Ok(list) => Ok(Some((list, meta.modified_time))),
            Err(e) => {
                // An unreadable cloud manifest is treated like a missing
                // one; the push-all path rewrites it from local truth.
                tracing::warn!(error = %e, "cloud manifest unparseable, rewriting");
                Ok(None)
            }
        }
    }

    /// Upload the manifest, stamping this process's client ID. Returns the
    /// server modification time.
    async fn upload_manifest(
        &self,
        layout: &RemoteFolders,
        list: &mut NoteList,
    ) -> Result<String> {
        list.last_sync_client_id = Some(self.client_id.clone());
        let bytes = serde_json::to_vec(list)?;

        let existing = { self.manifest_file_id.lock().clone() };
        let meta = match existing {
            Some(file_id) => match self.queue.update_file(&file_id, bytes.clone()).await {
                Ok(meta) => meta,
                Err(e) if e.is_not_found() => {
                    *self.manifest_file_id.lock() = None;
                    self.queue
                        .create_file(
                            None,
                            &self.config.manifest_name,
                            bytes,
                            Some(&layout.root_id),
                            JSON_MIME,
                        )
                        .await?
                }
                Err(e) => return Err(e),
            },
            None => {
                self.queue
                    .create_file(
                        None,
                        &self.config.manifest_name,
                        bytes,
                        Some(&layout.root_id),
                        JSON_MIME,
                    )
                    .await?
            }
        };
        *self.manifest_file_id.lock() = Some(meta.id.clone());
        Ok(meta.modified_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::FsNoteStore;
    use crate::remote::{InMemoryRemote, RemoteClient};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        remote: Arc<InMemoryRemote>,
        notes: Arc<FsNoteStore>,
        state: Arc<SyncStateStore>,
        manifest: Arc<ManifestStore>,
        engine: SyncEngine,
    }

    fn make_note(id: &str, content: &str, modified: &str) -> Note {
        Note {
            id: id.to_string(),
            title: format!("Note {id}"),
            content: content.to_string(),
            content_header: None,
            language: "plaintext".to_string(),
            modified_time: modified.to_string(),
            archived: false,
            folder_id: None,
        }
    }

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let notes = Arc::new(FsNoteStore::new(dir.path().join("notes")));
        let state = Arc::new(SyncStateStore::load(dir.path().join("sync_state.json")));
        let manifest = Arc::new(ManifestStore::load(
            dir.path().join("noteList_v2.json"),
            notes.as_ref(),
        ));
        let config = SyncConfig {
            debounce_window: Duration::from_millis(10),
            ..SyncConfig::default()
        };
        let file_ids = Arc::new(FileIdCache::new(config.negative_cache_ttl));
        let queue = OpsQueue::start(
            Arc::clone(&remote) as Arc<dyn RemoteClient>,
            Arc::clone(&file_ids),
            &config,
        );
        let engine = SyncEngine::new(SyncEngineOptions {
            queue,
            state: Arc::clone(&state),
            manifest: Arc::clone(&manifest),
            notes: Arc::clone(&notes) as Arc<dyn NoteStore>,
            file_ids,
            backups: BackupLog::new(dir.path().join("cloud_wins_backups"), 100),
            events: EventBus::disabled(),
            config,
            client_id: "client-test".to_string(),
        });
        Fixture {
            _dir: dir,
            remote,
            notes,
            state,
            manifest,
            engine,
        }
    }

    fn add_local_note(fx: &Fixture, note: &Note) {
        fx.notes.save_note(note).unwrap();
        fx.manifest
            .update(|list| {
                list.upsert_note(NoteMetadata::from_note(note));
                list.top_level_order.push(TopLevelItem::note(&note.id));
            })
            .unwrap();
        fx.state.mark_note_dirty(&note.id).unwrap();
    }

    #[tokio::test]
    async fn first_sync_uploads_everything_and_creates_manifest() {
        let fx = setup();
        add_local_note(&fx, &make_note("n1", "hello", "2025-01-01T00:00:00Z"));

        let outcome = fx.engine.sync_notes().await.unwrap();
        assert_eq!(outcome.pushed, 1);

        let layout = fx.engine.remote_layout().unwrap();
        let file_id = fx.remote.find_id("n1.json", Some(&layout.notes_id)).unwrap();
        let uploaded: Note =
            serde_json::from_slice(&fx.remote.content_of(&file_id).unwrap()).unwrap();
        assert_eq!(uploaded.content, "hello");

        let manifest_id = fx.remote.find_id("noteList_v2.json", Some(&layout.root_id));
        assert!(manifest_id.is_some());

        let snap = fx.state.dirty_snapshot();
        assert!(snap.dirty_notes.is_empty());
        assert_eq!(
            fx.state.baseline_hash("n1"),
            Some(make_note("n1", "hello", "x").content_hash())
        );
    }

    #[tokio::test]
    async fn both_empty_is_a_noop_with_manifests() {
        let fx = setup();
        let outcome = fx.engine.sync_notes().await.unwrap();
        assert!(!outcome.changed_anything());

        let layout = fx.engine.remote_layout().unwrap();
        assert!(fx
            .remote
            .find_id("noteList_v2.json", Some(&layout.root_id))
            .is_some());
    }

    #[tokio::test]
    async fn repeated_sync_is_idempotent() {
        let fx = setup();
        add_local_note(&fx, &make_note("n1", "hello", "2025-01-01T00:00:00Z"));
        fx.engine.sync_notes().await.unwrap();

        let updates_before = fx.remote.calls.updates.load(std::sync::atomic::Ordering::SeqCst);
        let creates_before = fx.remote.calls.creates.load(std::sync::atomic::Ordering::SeqCst);

        let outcome = fx.engine.sync_notes().await.unwrap();
        assert!(!outcome.changed_anything());
        assert_eq!(
            fx.remote.calls.updates.load(std::sync::atomic::Ordering::SeqCst),
            updates_before
        );
        assert_eq!(
            fx.remote.calls.creates.load(std::sync::atomic::Ordering::SeqCst),
            creates_before
        );
    }

    #[tokio::test]
    async fn failed_upload_keeps_note_dirty() {
        let fx = setup();
        add_local_note(&fx, &make_note("n1", "hello", "2025-01-01T00:00:00Z"));
        // First sync bootstraps the cloud; second one hits the failure
        fx.engine.sync_notes().await.unwrap();

        fx.notes
            .save_note(&make_note("n1", "hello again", "2025-01-02T00:00:00Z"))
            .unwrap();
        fx.state.mark_note_dirty("n1").unwrap();
        fx.remote
            .fail_next("update", crate::error::RemoteError::transient("flaky"));

        let outcome = fx.engine.sync_notes().await.unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert!(fx.state.is_note_dirty("n1"), "failed push must stay dirty");

        // Next cycle succeeds and clears it
        let outcome = fx.engine.sync_notes().await.unwrap();
        assert_eq!(outcome.pushed, 1);
        assert!(!fx.state.is_note_dirty("n1"));
    }

    #[tokio::test]
    async fn local_deletion_propagates() {
        let fx = setup();
        add_local_note(&fx, &make_note("n1", "bye", "2025-01-01T00:00:00Z"));
        fx.engine.sync_notes().await.unwrap();

        fx.notes.delete_note("n1").unwrap();
        fx.manifest.update(|l| l.remove_note("n1")).unwrap();
        fx.state.mark_note_deleted("n1").unwrap();

        let outcome = fx.engine.sync_notes().await.unwrap();
        assert_eq!(outcome.deleted_remote, 1);

        let layout = fx.engine.remote_layout().unwrap();
        assert!(fx.remote.find_id("n1.json", Some(&layout.notes_id)).is_none());
        assert!(fx.state.dirty_snapshot().deleted_notes.is_empty());
        assert_eq!(fx.state.baseline_hash("n1"), None);
    }

    #[tokio::test]
    async fn remote_deletion_pulls_back_with_backup() {
        let fx = setup();
        add_local_note(&fx, &make_note("n1", "keep?", "2025-01-01T00:00:00Z"));
        fx.engine.sync_notes().await.unwrap();

        // Another device deletes the note and rewrites the manifest
        let layout = fx.engine.remote_layout().unwrap();
        let file_id = fx.remote.find_id("n1.json", Some(&layout.notes_id)).unwrap();
        fx.remote.delete_file(&file_id).await.unwrap();
        let manifest_id = fx
            .remote
            .find_id("noteList_v2.json", Some(&layout.root_id))
            .unwrap();
        let mut cloud_list: NoteList =
            serde_json::from_slice(&fx.remote.content_of(&manifest_id).unwrap()).unwrap();
        cloud_list.remove_note("n1");
        cloud_list.last_sync_client_id = Some("other-device".to_string());
        fx.remote
            .update_file(&manifest_id, &serde_json::to_vec(&cloud_list).unwrap())
            .await
            .unwrap();

        let outcome = fx.engine.sync_notes().await.unwrap();
        assert_eq!(outcome.deleted_local, 1);
        assert!(fx.notes.load_note("n1").is_err());
        assert!(fx.manifest.get().note("n1").is_none());
    }

    #[tokio::test]
    async fn stale_dirty_flag_never_arbitrates_conflict() {
        let fx = setup();
        add_local_note(&fx, &make_note("n1", "shared", "2025-01-05T00:00:00Z"));
        fx.engine.sync_notes().await.unwrap();

        // A spurious dirty mark with no content change
        fx.state.mark_note_dirty("n1").unwrap();

        // Another device edits n1. Its stamp is OLDER than the local one,
        // so conflict arbitration would wrongly pick the unchanged local
        // copy and clobber the cloud's real edit.
        let layout = fx.engine.remote_layout().unwrap();
        let file_id = fx.remote.find_id("n1.json", Some(&layout.notes_id)).unwrap();
        let cloud_note = make_note("n1", "real edit", "2025-01-02T00:00:00Z");
        fx.remote
            .update_file(&file_id, &serde_json::to_vec(&cloud_note).unwrap())
            .await
            .unwrap();
        let manifest_id = fx
            .remote
            .find_id("noteList_v2.json", Some(&layout.root_id))
            .unwrap();
        let mut cloud_list: NoteList =
            serde_json::from_slice(&fx.remote.content_of(&manifest_id).unwrap()).unwrap();
        cloud_list.upsert_note(NoteMetadata::from_note(&cloud_note));
        cloud_list.last_sync_client_id = Some("other-device".to_string());
        fx.remote
            .update_file(&manifest_id, &serde_json::to_vec(&cloud_list).unwrap())
            .await
            .unwrap();

        let outcome = fx.engine.sync_notes().await.unwrap();

        // Plain pull, no conflict, no push of the stale local copy
        assert_eq!(outcome.conflicts, 0);
        assert_eq!(outcome.pushed, 0);
        assert_eq!(outcome.pulled, 1);
        assert_eq!(fx.notes.load_note("n1").unwrap().content, "real edit");
        let remote_note: Note =
            serde_json::from_slice(&fx.remote.content_of(&file_id).unwrap()).unwrap();
        assert_eq!(remote_note.content, "real edit", "cloud edit must survive");
        assert!(!fx.state.is_note_dirty("n1"));
    }

    #[tokio::test]
    async fn download_never_overwrites_concurrent_edit() {
        let fx = setup();
        // Cloud has n1; local has never seen it but edits it mid-sync via a
        // racing save+dirty. Simulate by pre-marking dirty AFTER snapshot:
        // here we approximate by marking the note dirty through the state
        // store from within the pull via a pre-seeded local edit.
        add_local_note(&fx, &make_note("n1", "local", "2025-01-01T00:00:00Z"));
        fx.engine.sync_notes().await.unwrap();

        // Cloud gains a newer n1 via another device
        let layout = fx.engine.remote_layout().unwrap();
        let file_id = fx.remote.find_id("n1.json", Some(&layout.notes_id)).unwrap();
        let cloud_note = make_note("n1", "cloud", "2025-03-01T00:00:00Z");
        fx.remote
            .update_file(&file_id, &serde_json::to_vec(&cloud_note).unwrap())
            .await
            .unwrap();
        let manifest_id = fx
            .remote
            .find_id("noteList_v2.json", Some(&layout.root_id))
            .unwrap();
        let mut cloud_list: NoteList =
            serde_json::from_slice(&fx.remote.content_of(&manifest_id).unwrap()).unwrap();
        cloud_list.upsert_note(NoteMetadata::from_note(&cloud_note));
        cloud_list.last_sync_client_id = Some("other-device".to_string());
        fx.remote
            .update_file(&manifest_id, &serde_json::to_vec(&cloud_list).unwrap())
            .await
            .unwrap();

        // The guard: dirty set after the snapshot would be taken. We drive
        // save_pulled_note directly to pin the contract.
        fx.state.mark_note_dirty("n1").unwrap();
        let empty: HashSet<&str> = HashSet::new();
        let saved = fx
            .engine
            .save_pulled_note(&cloud_note, &empty);
        assert!(!saved, "freshly dirty note must not be overwritten");
        assert_eq!(fx.notes.load_note("n1").unwrap().content, "local");
    }
}
