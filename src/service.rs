//! Top-level wiring: the piece the application embeds.
//!
//! Connection flow: startup integrity check → migration check → operations
//! queue start → initial sync → polling loop. Inbound UI commands
//! (`sync_now`, `respond_to_migration`, `apply_integrity_fixes`, `logout`)
//! land here and fan out to the owning component.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use crate::backup::BackupLog;
use crate::config::SyncConfig;
use crate::engine::{SyncEngine, SyncEngineOptions, SyncOutcome};
use crate::error::{Result, SyncError};
use crate::events::{DriveStatus, EventBus, SyncEvent};
use crate::file_ids::FileIdCache;
use crate::integrity::{IntegrityFix, IntegrityIssue, IntegrityValidator};
use crate::local::NoteStore;
use crate::manifest::ManifestStore;
use crate::migration::{MigrationChoice, MigrationOutcome, Migrator};
use crate::poller::PollController;
use crate::queue::OpsQueue;
use crate::remote::RemoteClient;
use crate::state::SyncStateStore;

pub struct SyncServiceOptions {
    /// Client bound to the user-visible legacy scope.
    pub legacy_client: Arc<dyn RemoteClient>,
    /// Client bound to the private app-data scope.
    pub app_data_client: Arc<dyn RemoteClient>,
    pub notes: Arc<dyn NoteStore>,
    /// App-data directory holding `sync_state.json`, the manifest, backups.
    pub data_dir: PathBuf,
    pub events: EventBus,
    pub config: SyncConfig,
}

pub struct SyncService {
    legacy_client: Arc<dyn RemoteClient>,
    app_data_client: Arc<dyn RemoteClient>,
    notes: Arc<dyn NoteStore>,
    data_dir: PathBuf,
    events: EventBus,
    config: SyncConfig,
    client_id: String,

    state: Arc<SyncStateStore>,
    manifest: Arc<ManifestStore>,
    validator: IntegrityValidator,

    engine: Mutex<Option<Arc<SyncEngine>>>,
    queue: Mutex<Option<Arc<OpsQueue>>>,
    poller: Mutex<Option<tokio::task::JoinHandle<()>>>,

    poll_reset: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    migration_tx: mpsc::Sender<MigrationChoice>,
    migration_rx: tokio::sync::Mutex<mpsc::Receiver<MigrationChoice>>,
}

impl SyncService {
    pub fn new(options: SyncServiceOptions) -> Arc<Self> {
        let state = Arc::new(SyncStateStore::load(
            options.data_dir.join("sync_state.json"),
        ));
        let manifest = Arc::new(ManifestStore::load(
            options.data_dir.join(&options.config.manifest_name),
            options.notes.as_ref(),
        ));
        let validator = IntegrityValidator::new(&options.config);
        let (shutdown, _) = watch::channel(false);
        let (migration_tx, migration_rx) = mpsc::channel(1);

        Arc::new(Self {
            legacy_client: options.legacy_client,
            app_data_client: options.app_data_client,
            notes: options.notes,
            data_dir: options.data_dir,
            events: options.events,
            config: options.config,
            client_id: uuid::Uuid::new_v4().to_string(),
            state,
            manifest,
            validator,
            engine: Mutex::new(None),
            queue: Mutex::new(None),
            poller: Mutex::new(None),
            poll_reset: Arc::new(Notify::new()),
            shutdown,
            migration_tx,
            migration_rx: tokio::sync::Mutex::new(migration_rx),
        })
    }

    /// Foreground mutation hooks for the note layer. These touch only the
    /// sync state; the network work happens on the next cycle.
    pub fn mark_note_dirty(&self, id: &str) -> Result<()> {
        self.state.mark_note_dirty(id)
    }

    pub fn mark_note_deleted(&self, id: &str) -> Result<()> {
        self.state.mark_note_deleted(id)
    }

    pub fn mark_folder_deleted(&self, id: &str) -> Result<()> {
        self.state.mark_folder_deleted(id)
    }

    pub fn mark_note_list_dirty(&self) -> Result<()> {
        self.state.mark_dirty()
    }

    /// Bring the connection up: integrity check, migration, queue, initial
    /// sync, polling. Safe to call once per login.
    pub async fn connect(self: &Arc<Self>) -> Result<MigrationOutcome> {
        self.events.status(DriveStatus::LoggingIn);

        if let Err(e) = self.validator.validate(&self.manifest, self.notes.as_ref()) {
            tracing::warn!(error = %e, "startup integrity check failed");
        }

        let migrator = Migrator::new(
            Arc::clone(&self.legacy_client),
            Arc::clone(&self.app_data_client),
            self.data_dir.join("drive_storage_migration.json"),
            self.events.clone(),
            self.config.clone(),
        );
        let mut shutdown_rx = self.shutdown.subscribe();
        let outcome = {
            let mut choices = self.migration_rx.lock().await;
            tokio::select! {
                outcome = migrator.ensure_migrated(&mut choices) => outcome?,
                _ = shutdown_rx.changed() => return Err(SyncError::OperationCancelled),
            }
        };

        let client: Arc<dyn RemoteClient> = match outcome {
            MigrationOutcome::LegacyMode => Arc::clone(&self.legacy_client),
            _ => Arc::clone(&self.app_data_client),
        };

        let file_ids = Arc::new(FileIdCache::new(self.config.negative_cache_ttl));
        let queue = OpsQueue::start(client, Arc::clone(&file_ids), &self.config);
        let engine = Arc::new(SyncEngine::new(SyncEngineOptions {
            queue: Arc::clone(&queue),
            state: Arc::clone(&self.state),
            manifest: Arc::clone(&self.manifest),
            notes: Arc::clone(&self.notes),
            file_ids,
            backups: BackupLog::new(
                self.data_dir.join("cloud_wins_backups"),
                self.config.backup_cap,
            ),
            events: self.events.clone(),
            config: self.config.clone(),
            client_id: self.client_id.clone(),
        }));
        *self.queue.lock() = Some(Arc::clone(&queue));
        *self.engine.lock() = Some(Arc::clone(&engine));

        // Initial sync: offline here is not fatal, the poller keeps trying
        if let Err(e) = engine.sync_notes().await {
            tracing::warn!(error = %e, "initial sync failed");
        }
        if let Err(e) = self.validator.validate(&self.manifest, self.notes.as_ref()) {
            tracing::warn!(error = %e, "post-sync integrity check failed");
        }

        let poller = PollController::new(
            Arc::clone(&engine),
            queue,
            self.config.clone(),
            Arc::clone(&self.poll_reset),
            self.shutdown.subscribe(),
        );
        *self.poller.lock() = Some(tokio::spawn(poller.run()));
        Ok(outcome)
    }

    /// User-triggered sync. Defers the next poll: the feed would only echo
    /// this sync's own writes.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        let engine = self
            .engine
            .lock()
            .clone()
            .ok_or(SyncError::NotConnected)?;
        self.poll_reset.notify_one();
        let outcome = engine.sync_notes().await?;
        if let Err(e) = self.validator.validate(&self.manifest, self.notes.as_ref()) {
            tracing::warn!(error = %e, "post-sync integrity check failed");
        }
        Ok(outcome)
    }

    /// Answer the migration prompt. Extra answers are dropped.
    pub fn respond_to_migration(&self, choice: MigrationChoice) {
        let _ = self.migration_tx.try_send(choice);
    }

    /// Abort a connect stuck in login or the migration wait.
    pub fn cancel_login(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Integrity issues waiting for a user decision, drained once.
    pub fn drain_integrity_issues(&self) -> Vec<IntegrityIssue> {
        self.validator.drain_issues()
    }

    pub fn apply_integrity_fixes(&self, fixes: &[IntegrityFix]) -> Result<()> {
        self.validator
            .apply_fixes(fixes, &self.manifest, self.notes.as_ref())?;
        self.events.emit(SyncEvent::NotesReload);
        Ok(())
    }

    /// Tear the connection down: stop polling, cancel pending operations,
    /// flush state to disk.
    pub async fn logout(&self) {
        let _ = self.shutdown.send(true);
        let poller = self.poller.lock().take();
        if let Some(handle) = poller {
            let _ = handle.await;
        }
        let queue = self.queue.lock().take();
        if let Some(queue) = queue {
            queue.cleanup().await;
        }
        *self.engine.lock() = None;
        if let Err(e) = self.state.flush() {
            tracing::warn!(error = %e, "sync state flush on logout failed");
        }
        self.events.status(DriveStatus::Offline);
    }
}
