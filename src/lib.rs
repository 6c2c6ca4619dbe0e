//! Cloud synchronization core for a local-first note application.
//!
//! Keeps a filesystem-backed note store eventually consistent with a remote
//! document service across any number of devices on one account. The pieces:
//!
//! - [`queue::OpsQueue`] — serializes remote writes, coalesces superseded
//!   ones, and keeps inspection non-blocking during network I/O
//! - [`state::SyncStateStore`] — dirty/deleted tracking with a revision
//!   guard that detects edits racing a sync cycle
//! - [`engine::SyncEngine`] — push → pull → conflict phases over a
//!   three-way baseline of content hashes
//! - [`poller::PollController`] — adaptive change-feed polling with
//!   self-change suppression
//! - [`migration::Migrator`] — one-shot move into the private app-data
//!   scope, with a completion marker peers discover
//! - [`integrity::IntegrityValidator`] — manifest/filesystem reconciliation
//! - [`backup::BackupLog`] — local copies of anything the cloud overwrites
//! - [`service::SyncService`] — the facade the application embeds
//!
//! The remote service is abstracted behind [`remote::RemoteClient`]; auth
//! lives with the embedder. [`remote::InMemoryRemote`] backs the test suite.

pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod file_ids;
pub mod fsutil;
pub mod integrity;
pub mod local;
pub mod manifest;
pub mod migration;
pub mod poller;
pub mod queue;
pub mod remote;
pub mod service;
pub mod state;
pub mod types;

pub use backup::BackupLog;
pub use config::SyncConfig;
pub use engine::{RemoteFolders, SyncEngine, SyncEngineOptions, SyncOutcome};
pub use error::{RemoteError, RemoteErrorKind, Result, SyncError};
pub use events::{DriveStatus, EventBus, EventCallback, SyncEvent};
pub use file_ids::FileIdCache;
pub use integrity::{IntegrityFix, IntegrityIssue, IntegrityReport, IntegrityValidator};
pub use local::{FsNoteStore, NoteStore};
pub use manifest::ManifestStore;
pub use migration::{MigrationChoice, MigrationOutcome, Migrator};
pub use poller::PollController;
pub use queue::OpsQueue;
pub use remote::{
    Change, ChangeList, FileQuery, InMemoryRemote, RemoteClient, RemoteFileMeta, RemoteScope,
};
pub use service::{SyncService, SyncServiceOptions};
pub use state::{DirtySnapshot, SyncCommit, SyncStateStore};
pub use types::{
    CloudWinBackupRecord, CloudWinReason, Folder, MigrationState, Note, NoteList, NoteMetadata,
    TopLevelItem, TopLevelItemType,
};
