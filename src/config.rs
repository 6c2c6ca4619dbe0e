//! Tuning knobs for the sync core.

use std::time::Duration;

/// Configuration for the sync core. `Default` gives the values the shipped
/// app uses; embedders override individual fields.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Polling interval after a poll that observed changes.
    pub poll_initial: Duration,
    /// Multiplier applied to the interval after a quiet poll.
    pub poll_growth: f64,
    /// Upper bound on the polling interval. A reset signal jumps straight
    /// here, deferring the next poll.
    pub poll_max: Duration,
    /// Window during which rapid consecutive updates to the same remote file
    /// collapse into a single network call.
    pub debounce_window: Duration,
    /// Capacity of the queue submission channel. Enqueue blocks when full.
    pub queue_capacity: usize,
    /// Maximum number of files kept in `cloud_wins_backups/`, pruned oldest
    /// first.
    pub backup_cap: usize,
    /// How long to wait for the user's migration choice before defaulting to
    /// legacy mode.
    pub migration_choice_timeout: Duration,
    /// `modified_time` stamps further than this into the future are surfaced
    /// as integrity issues.
    pub future_skew: Duration,
    /// How long a failed file-ID lookup is remembered before retrying.
    pub negative_cache_ttl: Duration,
    /// Name of the remote root folder, in both the legacy visible scope and
    /// the private app-data scope. Peers must agree on this.
    pub root_folder_name: String,
    /// Name of the notes subfolder under the root.
    pub notes_folder_name: String,
    /// File name of the manifest, locally and remotely.
    pub manifest_name: String,
    /// File name of the migration completion marker in the app-data scope.
    pub migration_marker_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_initial: Duration::from_secs(30),
            poll_growth: 1.5,
            poll_max: Duration::from_secs(300),
            debounce_window: Duration::from_millis(300),
            queue_capacity: 64,
            backup_cap: 100,
            migration_choice_timeout: Duration::from_secs(300),
            future_skew: Duration::from_secs(120),
            negative_cache_ttl: Duration::from_secs(30),
            root_folder_name: "inkpad".to_string(),
            notes_folder_name: "notes".to_string(),
            manifest_name: "noteList_v2.json".to_string(),
            migration_marker_name: "migration_complete.json".to_string(),
        }
    }
}

impl SyncConfig {
    /// Remote file name for a note.
    pub fn note_file_name(&self, note_id: &str) -> String {
        format!("{note_id}.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.poll_initial, Duration::from_secs(30));
        assert_eq!(cfg.poll_max, Duration::from_secs(300));
        assert_eq!(cfg.backup_cap, 100);
        assert_eq!(cfg.note_file_name("n1"), "n1.json");
    }
}
