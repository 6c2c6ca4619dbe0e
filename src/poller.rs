//! Adaptive change-feed polling.
//!
//! One cooperative loop: sleep, list changes, decide relevance, maybe
//! trigger a full sync. The interval stretches while nothing happens and
//! snaps back when changes land. A reset signal (user-triggered sync just
//! ran) jumps the interval to the cap — the change feed is about to show us
//! our own writes, so there is nothing urgent to look for.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::error::{RemoteErrorKind, Result};
use crate::queue::OpsQueue;
use crate::remote::Change;
use crate::types::NoteList;

pub struct PollController {
    engine: Arc<SyncEngine>,
    queue: Arc<OpsQueue>,
    config: SyncConfig,
    reset: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

/// What one poll tick concluded.
#[derive(Debug, PartialEq)]
enum TickOutcome {
    Quiet,
    SelfChange,
    Relevant,
    Offline,
}

impl PollController {
    pub fn new(
        engine: Arc<SyncEngine>,
        queue: Arc<OpsQueue>,
        config: SyncConfig,
        reset: Arc<Notify>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            queue,
            config,
            reset,
            shutdown,
        }
    }

    /// Run until the shutdown channel fires. Consumes the controller; spawn
    /// it on its own task.
    pub async fn run(mut self) {
        let mut interval = self.config.poll_initial;
        let mut token: Option<String> = None;

        loop {
            if *self.shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.reset.notified() => {
                    // A sync just ran elsewhere; defer the next look as far
                    // as allowed.
                    interval = self.config.poll_max;
                    continue;
                }
                _ = self.shutdown.changed() => return,
            }

            match self.tick(&mut token).await {
                Ok(TickOutcome::Relevant) => interval = self.config.poll_initial,
                Ok(TickOutcome::Quiet) | Ok(TickOutcome::SelfChange) => {
                    interval = grow(interval, self.config.poll_growth, self.config.poll_max);
                }
                Ok(TickOutcome::Offline) => {
                    interval = self.config.poll_max;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "poll tick failed");
                    interval = grow(interval, self.config.poll_growth, self.config.poll_max);
                }
            }

            if *self.shutdown.borrow() {
                return;
            }
        }
    }

    async fn tick(&self, token: &mut Option<String>) -> Result<TickOutcome> {
        let current = match token.clone() {
            Some(t) => t,
            None => {
                let fresh = match self.queue.start_page_token().await {
                    Ok(t) => t,
                    Err(e) if is_offline(&e) => return Ok(TickOutcome::Offline),
                    Err(e) => return Err(e),
                };
                *token = Some(fresh.clone());
                fresh
            }
        };

        let list = match self.queue.list_changes(&current).await {
            Ok(list) => list,
            Err(e) if is_offline(&e) => return Ok(TickOutcome::Offline),
            Err(e) => return Err(e),
        };

        let relevant: Vec<&Change> = list
            .changes
            .iter()
            .filter(|c| self.is_relevant(c))
            .collect();

        if relevant.is_empty() {
            *token = Some(list.new_token);
            return Ok(TickOutcome::Quiet);
        }

        if self.is_own_manifest_write(&relevant).await {
            tracing::debug!("change feed only echoed our own manifest write");
            *token = Some(list.new_token);
            return Ok(TickOutcome::SelfChange);
        }

        tracing::info!(changes = relevant.len(), "remote changes detected");
        // Advance past this batch regardless of how the sync goes; the sync
        // reads cloud state directly, not the feed.
        *token = Some(list.new_token);
        let _ = self.engine.sync_notes().await;
        Ok(TickOutcome::Relevant)
    }

    /// A change matters when it touches the manifest in our root, anything
    /// in our notes folder, or any `.json` file (conservative: folder
    /// moves can hide parentage).
    fn is_relevant(&self, change: &Change) -> bool {
        let Some(file) = &change.file else {
            // Removals without metadata: only a subsequent sync can tell.
            return change.removed;
        };
        let layout = self.engine.remote_layout();
        if let Some(layout) = &layout {
            if file.parents.iter().any(|p| *p == layout.root_id)
                && file.name == self.config.manifest_name
            {
                return true;
            }
            if file.parents.iter().any(|p| *p == layout.notes_id) {
                return true;
            }
        }
        file.name.ends_with(".json")
    }

    /// True when the batch is solely the manifest we ourselves just wrote.
    async fn is_own_manifest_write(&self, relevant: &[&Change]) -> bool {
        let only_manifest = relevant
            .iter()
            .all(|c| !c.removed && c.file.as_ref().is_some_and(|f| f.name == self.config.manifest_name));
        if !only_manifest {
            return false;
        }
        let Some(change) = relevant.first() else {
            return false;
        };
        let bytes = match self.queue.download(&change.file_id).await {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        match serde_json::from_slice::<NoteList>(&bytes) {
            Ok(list) => list.last_sync_client_id.as_deref() == Some(self.engine.client_id()),
            Err(_) => false,
        }
    }
}

fn grow(interval: Duration, factor: f64, cap: Duration) -> Duration {
    let grown = interval.mul_f64(factor.max(1.0));
    grown.min(cap)
}

fn is_offline(e: &crate::error::SyncError) -> bool {
    matches!(
        e.remote_kind(),
        Some(RemoteErrorKind::Transient) | Some(RemoteErrorKind::Auth)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_capped() {
        let cap = Duration::from_secs(300);
        let mut interval = Duration::from_secs(30);
        for _ in 0..20 {
            interval = grow(interval, 1.5, cap);
        }
        assert_eq!(interval, cap);
    }

    #[test]
    fn growth_factor_below_one_never_shrinks() {
        let cap = Duration::from_secs(300);
        let interval = grow(Duration::from_secs(30), 0.5, cap);
        assert_eq!(interval, Duration::from_secs(30));
    }
}
