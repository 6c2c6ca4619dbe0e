//! In-process `RemoteClient` with a full change feed.
//!
//! Backs the test suite and headless embedding: folders, files, integer
//! page tokens over an append-only change log, injectable failures, and
//! per-operation call counters for asserting wire traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{RemoteError, RemoteErrorKind};

use super::{Change, ChangeList, FileQuery, RemoteClient, RemoteFileMeta};

#[derive(Debug, Clone)]
struct StoredFile {
    meta: RemoteFileMeta,
    content: Vec<u8>,
    is_folder: bool,
}

/// Calls observed per operation, for test assertions.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub creates: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    pub downloads: AtomicU64,
    pub lists: AtomicU64,
    pub changes: AtomicU64,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, StoredFile>,
    change_log: Vec<Change>,
    next_id: u64,
    /// Pending one-shot failures keyed by operation name.
    fail_next: HashMap<&'static str, RemoteError>,
    clock: u64,
    /// Artificial latency applied at the top of every operation.
    latency: Option<std::time::Duration>,
}

impl Inner {
    fn alloc_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Deterministic strictly-increasing RFC3339 stamps.
    fn tick(&mut self) -> String {
        self.clock += 1;
        let base = chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        (base + chrono::Duration::seconds(self.clock as i64))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    fn record_change(&mut self, file_id: &str, removed: bool) {
        let file = if removed {
            None
        } else {
            self.files.get(file_id).map(|f| f.meta.clone())
        };
        self.change_log.push(Change {
            file_id: file_id.to_string(),
            removed,
            file,
        });
    }

    fn take_failure(&mut self, op: &'static str) -> Option<RemoteError> {
        self.fail_next.remove(op)
    }
}

/// In-memory remote store. Cheap to clone handles via `Arc`.
#[derive(Default)]
pub struct InMemoryRemote {
    inner: Mutex<Inner>,
    pub calls: CallCounts,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `op` fail with `err`. Operation names:
    /// `create`, `update`, `delete`, `download`, `list`, `metadata`,
    /// `folder`, `token`, `changes`.
    pub fn fail_next(&self, op: &'static str, err: RemoteError) {
        self.inner.lock().fail_next.insert(op, err);
    }

    /// Delay every operation by `latency`, simulating a slow link.
    pub fn set_latency(&self, latency: Option<std::time::Duration>) {
        self.inner.lock().latency = latency;
    }

    async fn simulate_latency(&self) {
        let latency = { self.inner.lock().latency };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Raw content of a file, bypassing counters. Test helper.
    pub fn content_of(&self, file_id: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .files
            .get(file_id)
            .map(|f| f.content.clone())
    }

    /// Find a file ID by name within a parent. Test helper.
    pub fn find_id(&self, name: &str, parent_id: Option<&str>) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .files
            .values()
            .find(|f| {
                f.meta.name == name
                    && match parent_id {
                        Some(p) => f.meta.parents.iter().any(|x| x == p),
                        None => true,
                    }
            })
            .map(|f| f.meta.id.clone())
    }

    /// Number of live (non-folder) files. Test helper.
    pub fn file_count(&self) -> usize {
        self.inner.lock().files.values().filter(|f| !f.is_folder).count()
    }

    fn not_found(file_id: &str) -> RemoteError {
        RemoteError::new(RemoteErrorKind::NotFound, format!("no such file: {file_id}"))
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn create_file(
        &self,
        name: &str,
        content: &[u8],
        parent_id: Option<&str>,
        _mime_type: &str,
    ) -> Result<RemoteFileMeta, RemoteError> {
        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure("create") {
            return Err(err);
        }
        let id = inner.alloc_id("file");
        let now = inner.tick();
        let meta = RemoteFileMeta {
            id: id.clone(),
            name: name.to_string(),
            parents: parent_id.map(|p| vec![p.to_string()]).unwrap_or_default(),
            modified_time: now.clone(),
            created_time: Some(now),
            md5: None,
        };
        inner.files.insert(
            id.clone(),
            StoredFile {
                meta: meta.clone(),
                content: content.to_vec(),
                is_folder: false,
            },
        );
        inner.record_change(&id, false);
        Ok(meta)
    }

    async fn update_file(
        &self,
        file_id: &str,
        content: &[u8],
    ) -> Result<RemoteFileMeta, RemoteError> {
        self.calls.updates.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure("update") {
            return Err(err);
        }
        let now = inner.tick();
        let file = inner
            .files
            .get_mut(file_id)
            .ok_or_else(|| Self::not_found(file_id))?;
        file.content = content.to_vec();
        file.meta.modified_time = now;
        let meta = file.meta.clone();
        inner.record_change(file_id, false);
        Ok(meta)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), RemoteError> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure("delete") {
            return Err(err);
        }
        if inner.files.remove(file_id).is_none() {
            return Err(Self::not_found(file_id));
        }
        inner.record_change(file_id, true);
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, RemoteError> {
        self.calls.downloads.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure("download") {
            return Err(err);
        }
        inner
            .files
            .get(file_id)
            .map(|f| f.content.clone())
            .ok_or_else(|| Self::not_found(file_id))
    }

    async fn get_metadata(&self, file_id: &str) -> Result<RemoteFileMeta, RemoteError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure("metadata") {
            return Err(err);
        }
        inner
            .files
            .get(file_id)
            .map(|f| f.meta.clone())
            .ok_or_else(|| Self::not_found(file_id))
    }

    async fn list_files(&self, query: &FileQuery) -> Result<Vec<RemoteFileMeta>, RemoteError> {
        self.calls.lists.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure("list") {
            return Err(err);
        }
        let mut out: Vec<RemoteFileMeta> = inner
            .files
            .values()
            .filter(|f| match &query.name {
                Some(name) => f.meta.name == *name,
                None => true,
            })
            .filter(|f| match &query.parent_id {
                Some(parent) => f.meta.parents.iter().any(|p| p == parent),
                None => true,
            })
            .map(|f| f.meta.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String, RemoteError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure("folder") {
            return Err(err);
        }
        let id = inner.alloc_id("folder");
        let now = inner.tick();
        let meta = RemoteFileMeta {
            id: id.clone(),
            name: name.to_string(),
            parents: parent_id.map(|p| vec![p.to_string()]).unwrap_or_default(),
            modified_time: now.clone(),
            created_time: Some(now),
            md5: None,
        };
        inner.files.insert(
            id.clone(),
            StoredFile {
                meta,
                content: Vec::new(),
                is_folder: true,
            },
        );
        inner.record_change(&id, false);
        Ok(id)
    }

    async fn get_start_page_token(&self) -> Result<String, RemoteError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure("token") {
            return Err(err);
        }
        Ok(inner.change_log.len().to_string())
    }

    async fn list_changes(&self, token: &str) -> Result<ChangeList, RemoteError> {
        self.calls.changes.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure("changes") {
            return Err(err);
        }
        let from: usize = token.parse().map_err(|_| {
            RemoteError::new(RemoteErrorKind::Permanent, format!("bad page token: {token}"))
        })?;
        let from = from.min(inner.change_log.len());
        Ok(ChangeList {
            changes: inner.change_log[from..].to_vec(),
            new_token: inner.change_log.len().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn create_update_download() {
        block_on(async {
            let remote = InMemoryRemote::new();
            let meta = remote
                .create_file("n1.json", b"v1", None, "application/json")
                .await
                .unwrap();

            remote.update_file(&meta.id, b"v2").await.unwrap();
            assert_eq!(remote.download_file(&meta.id).await.unwrap(), b"v2");
            assert_eq!(remote.calls.updates.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn update_bumps_modified_time() {
        block_on(async {
            let remote = InMemoryRemote::new();
            let meta = remote
                .create_file("n1.json", b"v1", None, "application/json")
                .await
                .unwrap();
            let updated = remote.update_file(&meta.id, b"v2").await.unwrap();
            assert!(updated.modified_time > meta.modified_time);
        });
    }

    #[test]
    fn list_filters_by_name_and_parent() {
        block_on(async {
            let remote = InMemoryRemote::new();
            let folder = remote.create_folder("notes", None).await.unwrap();
            remote
                .create_file("a.json", b"", Some(&folder), "application/json")
                .await
                .unwrap();
            remote
                .create_file("b.json", b"", None, "application/json")
                .await
                .unwrap();

            let in_folder = remote
                .list_files(&FileQuery::children_of(&folder))
                .await
                .unwrap();
            assert_eq!(in_folder.len(), 1);
            assert_eq!(in_folder[0].name, "a.json");

            let by_name = remote
                .list_files(&FileQuery::named("b.json"))
                .await
                .unwrap();
            assert_eq!(by_name.len(), 1);
        });
    }

    #[test]
    fn change_feed_advances() {
        block_on(async {
            let remote = InMemoryRemote::new();
            let token = remote.get_start_page_token().await.unwrap();

            let meta = remote
                .create_file("n1.json", b"x", None, "application/json")
                .await
                .unwrap();
            remote.delete_file(&meta.id).await.unwrap();

            let list = remote.list_changes(&token).await.unwrap();
            assert_eq!(list.changes.len(), 2);
            assert!(!list.changes[0].removed);
            assert!(list.changes[1].removed);

            // Feed is drained after consuming the new token
            let list2 = remote.list_changes(&list.new_token).await.unwrap();
            assert!(list2.changes.is_empty());
        });
    }

    #[test]
    fn injected_failure_fires_once() {
        block_on(async {
            let remote = InMemoryRemote::new();
            remote.fail_next("create", RemoteError::transient("flaky"));

            let err = remote
                .create_file("n1.json", b"", None, "application/json")
                .await
                .unwrap_err();
            assert_eq!(err.kind, RemoteErrorKind::Transient);

            remote
                .create_file("n1.json", b"", None, "application/json")
                .await
                .unwrap();
        });
    }

    #[test]
    fn delete_missing_is_not_found() {
        block_on(async {
            let remote = InMemoryRemote::new();
            let err = remote.delete_file("ghost").await.unwrap_err();
            assert_eq!(err.kind, RemoteErrorKind::NotFound);
        });
    }
}
