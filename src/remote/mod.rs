//! Remote-service abstraction.
//!
//! The sync core talks to the cloud exclusively through `RemoteClient` — a
//! capability set over a hierarchical document service with per-file IDs,
//! listing, metadata, and a server-assigned change-feed token. All auth
//! lives in the collaborator that constructs the client; the core never
//! sees credentials. Failures surface unchanged as `RemoteError`.

pub mod memory;

use async_trait::async_trait;

use crate::error::RemoteError;

pub use memory::InMemoryRemote;

/// Metadata for a remote file.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFileMeta {
    pub id: String,
    pub name: String,
    pub parents: Vec<String>,
    /// RFC3339, server-assigned.
    pub modified_time: String,
    pub created_time: Option<String>,
    pub md5: Option<String>,
}

/// Listing filter. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileQuery {
    pub name: Option<String>,
    pub parent_id: Option<String>,
}

impl FileQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            parent_id: None,
        }
    }

    pub fn in_folder(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn children_of(parent_id: impl Into<String>) -> Self {
        Self {
            name: None,
            parent_id: Some(parent_id.into()),
        }
    }
}

/// One change-feed entry. `file` is populated for live files; removals may
/// carry only the ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub file_id: String,
    pub removed: bool,
    pub file: Option<RemoteFileMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeList {
    pub changes: Vec<Change>,
    pub new_token: String,
}

/// Which remote namespace a client instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteScope {
    /// The user-visible folder hierarchy of the account. Pre-migration data
    /// lives here, where the user can (and does) touch it.
    Legacy,
    /// The private per-app namespace invisible to the user's file browser.
    AppData,
}

/// Capability set over the remote document service.
///
/// Implementations are stateless wrappers around the service API; the
/// operations queue provides serialization and the orchestrator provides
/// retry policy, so methods here fail fast and surface errors unchanged.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn create_file(
        &self,
        name: &str,
        content: &[u8],
        parent_id: Option<&str>,
        mime_type: &str,
    ) -> Result<RemoteFileMeta, RemoteError>;

    async fn update_file(&self, file_id: &str, content: &[u8])
        -> Result<RemoteFileMeta, RemoteError>;

    async fn delete_file(&self, file_id: &str) -> Result<(), RemoteError>;

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, RemoteError>;

    async fn get_metadata(&self, file_id: &str) -> Result<RemoteFileMeta, RemoteError>;

    async fn list_files(&self, query: &FileQuery) -> Result<Vec<RemoteFileMeta>, RemoteError>;

    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String, RemoteError>;

    /// Token positioned at "now"; `list_changes` with it returns only
    /// subsequent changes.
    async fn get_start_page_token(&self) -> Result<String, RemoteError>;

    async fn list_changes(&self, token: &str) -> Result<ChangeList, RemoteError>;
}
