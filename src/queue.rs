//! The remote operations queue.
//!
//! All remote traffic funnels through one worker task: at most one write is
//! in flight at any moment, reads run FIFO, and writes to the same file
//! coalesce — a newer update supersedes a pending one (which resolves
//! `OperationCancelled`), a delete cancels a pending update or create for
//! the same note, and a delete arriving while its create is still pending
//! cancels the create and skips the network entirely.
//!
//! A debounce window collapses rapid consecutive updates to the same file
//! into a single call carrying the latest bytes. Updates arriving while an
//! update on the same file is in flight park until that call returns, then
//! coalesce.
//!
//! The pending-map lock is held only for bookkeeping, never across network
//! I/O, so `has_items` and `wait_for_empty` stay non-blocking while a call
//! is on the wire. The queue never retries: errors surface to the caller
//! unchanged, and retry policy belongs to the orchestrator.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::file_ids::FileIdCache;
use crate::remote::{ChangeList, FileQuery, RemoteClient, RemoteFileMeta};

// ============================================================================
// Operation payloads and outcomes
// ============================================================================

#[derive(Debug)]
pub enum OpPayload {
    Create {
        /// Set when the file holds a note, enabling delete-cancels-create
        /// and file-ID cache population.
        note_id: Option<String>,
        name: String,
        content: Vec<u8>,
        parent_id: Option<String>,
        mime_type: String,
    },
    Update {
        file_id: String,
        content: Vec<u8>,
    },
    Delete {
        file_id: String,
        note_id: Option<String>,
    },
    Download {
        file_id: String,
    },
    List {
        query: FileQuery,
    },
    GetFileId {
        note_id: String,
        folder_id: String,
    },
    Changes {
        token: String,
    },
    StartToken,
    CreateFolder {
        name: String,
        parent_id: Option<String>,
    },
}

#[derive(Debug)]
pub enum OpOutcome {
    Created(RemoteFileMeta),
    Updated(RemoteFileMeta),
    Deleted,
    Downloaded(Vec<u8>),
    Files(Vec<RemoteFileMeta>),
    FileId(Option<String>),
    Changes(ChangeList),
    Token(String),
    Folder(String),
}

struct QueueItem {
    payload: OpPayload,
    tx: oneshot::Sender<Result<OpOutcome>>,
}

enum Signal {
    /// A coalescable update for this file ID is parked in the write map.
    Write(String),
    /// A coalescable create for this note ID is parked in the create map.
    Create(String),
    /// FIFO item: reads, deletes, and non-note creates.
    Item(Box<QueueItem>),
}

#[derive(Default)]
struct WriteSlot {
    item: Option<QueueItem>,
    deadline: Option<Instant>,
    in_flight: bool,
    queued: bool,
}

#[derive(Default)]
struct PendingWrites {
    updates: HashMap<String, WriteSlot>,
    creates: HashMap<String, WriteSlot>,
}

struct Shared {
    client: Arc<dyn RemoteClient>,
    file_ids: Arc<FileIdCache>,
    pending: Mutex<PendingWrites>,
    /// Accepted operations not yet resolved (includes the one in flight).
    outstanding: AtomicUsize,
    closed: AtomicBool,
    empty_notify: Notify,
    debounce: Duration,
}

impl Shared {
    /// Resolve one operation's result channel and update bookkeeping.
    fn finish(&self, tx: oneshot::Sender<Result<OpOutcome>>, result: Result<OpOutcome>) {
        let _ = tx.send(result);
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.empty_notify.notify_waiters();
        }
    }

    fn cancel(&self, item: QueueItem) {
        self.finish(item.tx, Err(SyncError::OperationCancelled));
    }
}

// ============================================================================
// OpsQueue
// ============================================================================

/// Handle to the queue. Cheap to clone through `Arc`.
pub struct OpsQueue {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Signal>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OpsQueue {
    /// Start the queue with its dedicated worker task. Must be called from
    /// within a tokio runtime.
    pub fn start(
        client: Arc<dyn RemoteClient>,
        file_ids: Arc<FileIdCache>,
        config: &SyncConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            client,
            file_ids,
            pending: Mutex::new(PendingWrites::default()),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            empty_notify: Notify::new(),
            debounce: config.debounce_window,
        });

        let worker = tokio::spawn(worker_loop(Arc::clone(&shared), rx, shutdown_rx));
        Arc::new(Self {
            shared,
            tx,
            shutdown: shutdown_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    // -----------------------------------------------------------------------
    // Typed operations
    // -----------------------------------------------------------------------

    pub async fn create_file(
        &self,
        note_id: Option<&str>,
        name: &str,
        content: Vec<u8>,
        parent_id: Option<&str>,
        mime_type: &str,
    ) -> Result<RemoteFileMeta> {
        let payload = OpPayload::Create {
            note_id: note_id.map(str::to_string),
            name: name.to_string(),
            content,
            parent_id: parent_id.map(str::to_string),
            mime_type: mime_type.to_string(),
        };
        match self.enqueue(payload).await? {
            OpOutcome::Created(meta) => Ok(meta),
            other => unreachable_outcome(other),
        }
    }

    pub async fn update_file(&self, file_id: &str, content: Vec<u8>) -> Result<RemoteFileMeta> {
        let payload = OpPayload::Update {
            file_id: file_id.to_string(),
            content,
        };
        match self.enqueue(payload).await? {
            OpOutcome::Updated(meta) => Ok(meta),
            other => unreachable_outcome(other),
        }
    }

    pub async fn delete_file(&self, file_id: &str, note_id: Option<&str>) -> Result<()> {
        let payload = OpPayload::Delete {
            file_id: file_id.to_string(),
            note_id: note_id.map(str::to_string),
        };
        match self.enqueue(payload).await? {
            OpOutcome::Deleted => Ok(()),
            other => unreachable_outcome(other),
        }
    }

    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let payload = OpPayload::Download {
            file_id: file_id.to_string(),
        };
        match self.enqueue(payload).await? {
            OpOutcome::Downloaded(bytes) => Ok(bytes),
            other => unreachable_outcome(other),
        }
    }

    pub async fn list(&self, query: FileQuery) -> Result<Vec<RemoteFileMeta>> {
        match self.enqueue(OpPayload::List { query }).await? {
            OpOutcome::Files(files) => Ok(files),
            other => unreachable_outcome(other),
        }
    }

    /// Resolve a note's remote file ID through the cache; misses go to the
    /// wire at most once per burst.
    pub async fn get_file_id(&self, note_id: &str, folder_id: &str) -> Result<Option<String>> {
        let cache = Arc::clone(&self.shared.file_ids);
        cache
            .resolve_with(note_id, || async {
                let payload = OpPayload::GetFileId {
                    note_id: note_id.to_string(),
                    folder_id: folder_id.to_string(),
                };
                match self.enqueue(payload).await? {
                    OpOutcome::FileId(id) => Ok(id),
                    other => unreachable_outcome(other),
                }
            })
            .await
    }

    pub async fn list_changes(&self, token: &str) -> Result<ChangeList> {
        let payload = OpPayload::Changes {
            token: token.to_string(),
        };
        match self.enqueue(payload).await? {
            OpOutcome::Changes(list) => Ok(list),
            other => unreachable_outcome(other),
        }
    }

    pub async fn start_page_token(&self) -> Result<String> {
        match self.enqueue(OpPayload::StartToken).await? {
            OpOutcome::Token(token) => Ok(token),
            other => unreachable_outcome(other),
        }
    }

    pub async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        let payload = OpPayload::CreateFolder {
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
        };
        match self.enqueue(payload).await? {
            OpOutcome::Folder(id) => Ok(id),
            other => unreachable_outcome(other),
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// True while any accepted operation is unresolved. Never blocks on
    /// in-flight I/O.
    pub fn has_items(&self) -> bool {
        self.shared.outstanding.load(Ordering::SeqCst) > 0
    }

    /// Wait until every accepted operation has resolved.
    pub async fn wait_for_empty(&self) {
        loop {
            let notified = self.shared.empty_notify.notified();
            if !self.has_items() {
                return;
            }
            notified.await;
        }
    }

    /// Stop the worker and cancel everything pending. Subsequent enqueues
    /// resolve `OperationCancelled` immediately.
    pub async fn cleanup(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // -----------------------------------------------------------------------
    // Enqueue internals
    // -----------------------------------------------------------------------

    async fn enqueue(&self, payload: OpPayload) -> Result<OpOutcome> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SyncError::OperationCancelled);
        }
        let (tx, rx) = oneshot::channel();
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        let item = QueueItem { payload, tx };

        if let Some(signal) = self.route(item) {
            if self.tx.send(signal).await.is_err() {
                // Worker gone: the operation never became visible to anyone,
                // so settle the bookkeeping here.
                if self.shared.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.shared.empty_notify.notify_waiters();
                }
                return Err(SyncError::OperationCancelled);
            }
        }

        rx.await.unwrap_or(Err(SyncError::OperationCancelled))
    }

    /// Apply the coalescing/cancellation rules. Returns the signal to send,
    /// or `None` when the item was absorbed (coalesced or resolved in place).
    fn route(&self, item: QueueItem) -> Option<Signal> {
        match &item.payload {
            OpPayload::Update { file_id, .. } => {
                let file_id = file_id.clone();
                let mut pending = self.shared.pending.lock();
                let slot = pending.updates.entry(file_id.clone()).or_default();
                if let Some(prev) = slot.item.take() {
                    self.shared.cancel(prev);
                }
                slot.deadline = Some(Instant::now() + self.shared.debounce);
                slot.item = Some(item);
                if slot.in_flight || slot.queued {
                    // Parked: the worker re-checks the slot when the current
                    // call returns or the queued signal is handled.
                    None
                } else {
                    slot.queued = true;
                    Some(Signal::Write(file_id))
                }
            }
            OpPayload::Create {
                note_id: Some(note_id),
                ..
            } => {
                let note_id = note_id.clone();
                let mut pending = self.shared.pending.lock();
                let slot = pending.creates.entry(note_id.clone()).or_default();
                if let Some(prev) = slot.item.take() {
                    self.shared.cancel(prev);
                }
                slot.item = Some(item);
                if slot.in_flight || slot.queued {
                    None
                } else {
                    slot.queued = true;
                    Some(Signal::Create(note_id))
                }
            }
            OpPayload::Delete { file_id, note_id } => {
                let mut pending = self.shared.pending.lock();
                // A pending update to a file being deleted is wasted work
                if let Some(slot) = pending.updates.get_mut(file_id) {
                    if let Some(prev) = slot.item.take() {
                        self.shared.cancel(prev);
                    }
                }
                // Delete after a create that never executed: nothing exists
                // remotely, so cancel the create and succeed without I/O
                if let Some(note_id) = note_id {
                    if let Some(slot) = pending.creates.get_mut(note_id) {
                        if !slot.in_flight {
                            if let Some(prev) = slot.item.take() {
                                self.shared.cancel(prev);
                                drop(pending);
                                self.shared.finish(item.tx, Ok(OpOutcome::Deleted));
                                return None;
                            }
                        }
                    }
                }
                Some(Signal::Item(Box::new(item)))
            }
            _ => Some(Signal::Item(Box::new(item))),
        }
    }
}

fn unreachable_outcome(outcome: OpOutcome) -> ! {
    // The worker maps each payload to exactly one outcome variant.
    unreachable!("mismatched queue outcome: {outcome:?}")
}

// ============================================================================
// Worker
// ============================================================================

async fn worker_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Signal>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Signals re-scheduled by the worker itself (a parked write discovered
    // after an in-flight call returned). Processed before new submissions.
    let mut retries: VecDeque<Signal> = VecDeque::new();

    loop {
        let signal = if let Some(signal) = retries.pop_front() {
            signal
        } else {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = rx.recv() => match received {
                    Some(signal) => signal,
                    None => break,
                },
            }
        };

        match signal {
            Signal::Write(file_id) => {
                handle_write(&shared, &mut shutdown, &mut retries, &file_id, false).await;
            }
            Signal::Create(note_id) => {
                handle_write(&shared, &mut shutdown, &mut retries, &note_id, true).await;
            }
            Signal::Item(item) => {
                let QueueItem { payload, tx } = *item;
                let result = execute(&shared, payload).await;
                shared.finish(tx, result);
            }
        }

        if *shutdown.borrow() {
            break;
        }
    }

    drain(&shared, &mut rx, retries);
}

/// Execute the latest item parked in a write slot, honoring the debounce
/// deadline. `is_create` selects the create map over the update map.
async fn handle_write(
    shared: &Arc<Shared>,
    shutdown: &mut watch::Receiver<bool>,
    retries: &mut VecDeque<Signal>,
    key: &str,
    is_create: bool,
) {
    // Debounce: wait out the deadline with no lock held, so late updates
    // keep replacing the parked item until the last moment.
    loop {
        let deadline = {
            let pending = shared.pending.lock();
            let slot = if is_create {
                pending.creates.get(key)
            } else {
                pending.updates.get(key)
            };
            match slot {
                Some(slot) if slot.item.is_some() => slot.deadline,
                _ => {
                    drop(pending);
                    clear_slot(shared, key, is_create);
                    return; // superseded by a delete
                }
            }
        };
        match deadline {
            Some(deadline) if deadline > Instant::now() => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = shutdown.changed() => return,
                }
            }
            _ => break,
        }
    }

    let item = {
        let mut pending = shared.pending.lock();
        let slot = if is_create {
            pending.creates.get_mut(key)
        } else {
            pending.updates.get_mut(key)
        };
        let Some(slot) = slot else { return };
        slot.queued = false;
        match slot.item.take() {
            Some(item) => {
                slot.in_flight = true;
                item
            }
            None => {
                drop(pending);
                clear_slot(shared, key, is_create);
                return;
            }
        }
    };

    // Lock released: the network call runs with inspection unobstructed
    let QueueItem { payload, tx } = item;
    let result = execute(shared, payload).await;
    shared.finish(tx, result);

    let requeue = {
        let mut guard = shared.pending.lock();
        let map = if is_create {
            &mut guard.creates
        } else {
            &mut guard.updates
        };
        let (requeue, remove) = match map.get_mut(key) {
            Some(slot) => {
                slot.in_flight = false;
                if slot.item.is_some() && !slot.queued {
                    // An update parked while we were on the wire
                    slot.queued = true;
                    (true, false)
                } else {
                    (false, slot.item.is_none())
                }
            }
            None => (false, false),
        };
        if remove {
            map.remove(key);
        }
        requeue
    };
    if requeue {
        let key = key.to_string();
        retries.push_back(if is_create {
            Signal::Create(key)
        } else {
            Signal::Write(key)
        });
    }
}

fn clear_slot(shared: &Arc<Shared>, key: &str, is_create: bool) {
    let mut pending = shared.pending.lock();
    let map = if is_create {
        &mut pending.creates
    } else {
        &mut pending.updates
    };
    let removable = map
        .get(key)
        .map(|slot| slot.item.is_none() && !slot.in_flight)
        .unwrap_or(false);
    if removable {
        map.remove(key);
    }
}

async fn execute(shared: &Arc<Shared>, payload: OpPayload) -> Result<OpOutcome> {
    let client = &shared.client;
    match payload {
        OpPayload::Create {
            note_id,
            name,
            content,
            parent_id,
            mime_type,
        } => {
            let meta = client
                .create_file(&name, &content, parent_id.as_deref(), &mime_type)
                .await?;
            if let Some(note_id) = note_id {
                shared.file_ids.insert(&note_id, &meta.id);
            }
            Ok(OpOutcome::Created(meta))
        }
        OpPayload::Update { file_id, content } => {
            let meta = client.update_file(&file_id, &content).await?;
            Ok(OpOutcome::Updated(meta))
        }
        OpPayload::Delete { file_id, note_id } => {
            client.delete_file(&file_id).await?;
            if let Some(note_id) = note_id {
                shared.file_ids.invalidate(&note_id);
            }
            Ok(OpOutcome::Deleted)
        }
        OpPayload::Download { file_id } => {
            Ok(OpOutcome::Downloaded(client.download_file(&file_id).await?))
        }
        OpPayload::List { query } => Ok(OpOutcome::Files(client.list_files(&query).await?)),
        OpPayload::GetFileId { note_id, folder_id } => {
            let query = FileQuery::named(format!("{note_id}.json")).in_folder(folder_id);
            let files = client.list_files(&query).await?;
            Ok(OpOutcome::FileId(files.first().map(|f| f.id.clone())))
        }
        OpPayload::Changes { token } => Ok(OpOutcome::Changes(client.list_changes(&token).await?)),
        OpPayload::StartToken => Ok(OpOutcome::Token(client.get_start_page_token().await?)),
        OpPayload::CreateFolder { name, parent_id } => Ok(OpOutcome::Folder(
            client.create_folder(&name, parent_id.as_deref()).await?,
        )),
    }
}

/// Cancel everything still pending after shutdown.
fn drain(shared: &Arc<Shared>, rx: &mut mpsc::Receiver<Signal>, retries: VecDeque<Signal>) {
    rx.close();
    let mut leftovers: Vec<QueueItem> = Vec::new();

    while let Ok(signal) = rx.try_recv() {
        if let Signal::Item(item) = signal {
            leftovers.push(*item);
        }
    }
    for signal in retries {
        if let Signal::Item(item) = signal {
            leftovers.push(*item);
        }
    }
    {
        let mut guard = shared.pending.lock();
        let pending = &mut *guard;
        for slot in pending
            .updates
            .values_mut()
            .chain(pending.creates.values_mut())
        {
            if let Some(item) = slot.item.take() {
                leftovers.push(item);
            }
        }
        pending.updates.clear();
        pending.creates.clear();
    }
    for item in leftovers {
        shared.cancel(item);
    }
    shared.empty_notify.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::InMemoryRemote;
    use std::time::Duration;

    fn test_config() -> SyncConfig {
        SyncConfig {
            debounce_window: Duration::from_millis(50),
            queue_capacity: 8,
            ..SyncConfig::default()
        }
    }

    fn setup() -> (Arc<InMemoryRemote>, Arc<FileIdCache>, Arc<OpsQueue>) {
        let remote = Arc::new(InMemoryRemote::new());
        let cache = Arc::new(FileIdCache::new(Duration::from_secs(30)));
        let queue = OpsQueue::start(
            Arc::clone(&remote) as Arc<dyn RemoteClient>,
            Arc::clone(&cache),
            &test_config(),
        );
        (remote, cache, queue)
    }

    #[tokio::test]
    async fn rapid_updates_coalesce_to_one_call() {
        let (remote, _cache, queue) = setup();
        let meta = remote
            .create_file("f1.json", b"v0", None, "application/json")
            .await
            .unwrap();

        let (r1, r2, r3) = tokio::join!(
            queue.update_file(&meta.id, b"v1".to_vec()),
            queue.update_file(&meta.id, b"v2".to_vec()),
            queue.update_file(&meta.id, b"v3".to_vec()),
        );

        // Exactly one survivor; the superseded ones are cancelled
        let results = [r1, r2, r3];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let cancelled = results
            .iter()
            .filter(|r| matches!(r, Err(SyncError::OperationCancelled)))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(cancelled, 2);

        assert_eq!(
            remote.calls.updates.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(remote.content_of(&meta.id).unwrap(), b"v3");
    }

    #[tokio::test]
    async fn sequential_updates_each_hit_the_wire() {
        let (remote, _cache, queue) = setup();
        let meta = remote
            .create_file("f1.json", b"v0", None, "application/json")
            .await
            .unwrap();

        queue.update_file(&meta.id, b"v1".to_vec()).await.unwrap();
        queue.update_file(&meta.id, b"v2".to_vec()).await.unwrap();

        assert_eq!(
            remote.calls.updates.load(std::sync::atomic::Ordering::SeqCst),
            2
        );
        assert_eq!(remote.content_of(&meta.id).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn delete_cancels_pending_create_without_network() {
        let (remote, _cache, queue) = setup();
        let fixture = remote
            .create_file("busy.json", b"x", None, "application/json")
            .await
            .unwrap();

        // Occupy the worker with a slow download so the create stays pending
        remote.set_latency(Some(Duration::from_millis(80)));
        let busy = tokio::spawn({
            let queue = Arc::clone(&queue);
            let id = fixture.id.clone();
            async move { queue.download(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let create = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move {
                queue
                    .create_file(Some("n1"), "n1.json", b"body".to_vec(), None, "application/json")
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The create never executed; the delete must cancel it and succeed
        // without touching the wire.
        queue.delete_file("unassigned", Some("n1")).await.unwrap();

        let create_result = create.await.unwrap();
        assert!(matches!(create_result, Err(SyncError::OperationCancelled)));
        busy.await.unwrap().unwrap();

        assert!(remote.find_id("n1.json", None).is_none());
        assert_eq!(
            remote.calls.deletes.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn create_populates_file_id_cache() {
        let (_remote, cache, queue) = setup();
        let meta = queue
            .create_file(Some("n1"), "n1.json", b"x".to_vec(), None, "application/json")
            .await
            .unwrap();
        assert_eq!(cache.get("n1"), Some(meta.id));
    }

    #[tokio::test]
    async fn delete_invalidates_file_id_cache() {
        let (_remote, cache, queue) = setup();
        let meta = queue
            .create_file(Some("n1"), "n1.json", b"x".to_vec(), None, "application/json")
            .await
            .unwrap();
        queue.delete_file(&meta.id, Some("n1")).await.unwrap();
        assert_eq!(cache.get("n1"), None);
    }

    #[tokio::test]
    async fn get_file_id_lists_once_and_caches() {
        let (remote, _cache, queue) = setup();
        let folder = remote.create_folder("notes", None).await.unwrap();
        remote
            .create_file("n1.json", b"x", Some(&folder), "application/json")
            .await
            .unwrap();

        let id1 = queue.get_file_id("n1", &folder).await.unwrap();
        let id2 = queue.get_file_id("n1", &folder).await.unwrap();
        assert!(id1.is_some());
        assert_eq!(id1, id2);
        assert_eq!(remote.calls.lists.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_surface_unchanged() {
        let (remote, _cache, queue) = setup();
        let meta = remote
            .create_file("f1.json", b"x", None, "application/json")
            .await
            .unwrap();
        remote.fail_next("update", RemoteError::transient("reset by peer"));

        let err = queue.update_file(&meta.id, b"y".to_vec()).await.unwrap_err();
        assert_eq!(
            err.remote_kind(),
            Some(crate::error::RemoteErrorKind::Transient)
        );
        // No retry happened
        assert_eq!(
            remote.calls.updates.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn enqueue_after_cleanup_is_cancelled_not_panic() {
        let (_remote, _cache, queue) = setup();
        queue.cleanup().await;

        let err = queue.download("anything").await.unwrap_err();
        assert!(matches!(err, SyncError::OperationCancelled));
    }

    #[tokio::test]
    async fn cleanup_cancels_parked_items() {
        let (_remote, _cache, queue) = setup();

        let parked = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.update_file("f-slow", b"data".to_vec()).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.cleanup().await;

        let result = parked.await.unwrap();
        assert!(matches!(result, Err(SyncError::OperationCancelled)));
        assert!(!queue.has_items());
    }

    #[tokio::test]
    async fn wait_for_empty_sees_quiescence() {
        let (remote, _cache, queue) = setup();
        let meta = remote
            .create_file("f1.json", b"x", None, "application/json")
            .await
            .unwrap();

        let update = tokio::spawn({
            let queue = Arc::clone(&queue);
            let id = meta.id.clone();
            async move { queue.update_file(&id, b"y".to_vec()).await }
        });
        // Let the update register before waiting
        while !queue.has_items() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        queue.wait_for_empty().await;
        assert!(!queue.has_items());
        update.await.unwrap().unwrap();
        assert_eq!(remote.content_of(&meta.id).unwrap(), b"y");
    }

    #[tokio::test]
    async fn reads_flow_fifo() {
        let (remote, _cache, queue) = setup();
        let meta = remote
            .create_file("f1.json", b"hello", None, "application/json")
            .await
            .unwrap();

        let bytes = queue.download(&meta.id).await.unwrap();
        assert_eq!(bytes, b"hello");

        let files = queue.list(FileQuery::named("f1.json")).await.unwrap();
        assert_eq!(files.len(), 1);

        let token = queue.start_page_token().await.unwrap();
        let changes = queue.list_changes(&token).await.unwrap();
        assert!(changes.changes.is_empty());
    }
}
