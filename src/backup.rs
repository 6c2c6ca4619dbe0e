//! Backup log for notes the cloud is about to overwrite or delete.
//!
//! Written before any cloud-wins action so a user can always dig their
//! content back out of `cloud_wins_backups/`. Strictly best-effort: a
//! failed backup write is logged and never blocks the sync.

use std::fs;
use std::path::PathBuf;

use crate::error::Result;
use crate::fsutil;
use crate::types::{CloudWinBackupRecord, CloudWinReason, Note};

pub struct BackupLog {
    dir: PathBuf,
    cap: usize,
}

impl BackupLog {
    pub fn new(dir: impl Into<PathBuf>, cap: usize) -> Self {
        Self {
            dir: dir.into(),
            cap,
        }
    }

    /// Record `local` (and the cloud side, when there is one) before the
    /// cloud version wins. Best-effort: callers ignore the result beyond
    /// logging.
    pub fn record(
        &self,
        reason: CloudWinReason,
        note_id: &str,
        local: Option<&Note>,
        cloud: Option<&Note>,
    ) {
        let now = chrono::Utc::now();
        let record = CloudWinBackupRecord {
            note_id: note_id.to_string(),
            reason,
            local_note: local.cloned(),
            cloud_note: cloud.cloned(),
            timestamp: now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        };
        let file_name = format!(
            "cloud_wins_{}_{}.json",
            now.format("%Y%m%d%H%M%S%3f"),
            note_id
        );
        if let Err(e) = fsutil::atomic_write_json(&self.dir.join(&file_name), &record) {
            tracing::warn!(note_id, error = %e, "cloud-wins backup write failed");
            return;
        }
        if let Err(e) = self.prune() {
            tracing::warn!(error = %e, "cloud-wins backup prune failed");
        }
    }

    /// Trim the directory to the cap, oldest first. File names sort
    /// chronologically by construction.
    fn prune(&self) -> Result<()> {
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("cloud_wins_") && name.ends_with(".json") {
                names.push(name);
            }
        }
        if names.len() <= self.cap {
            return Ok(());
        }
        names.sort();
        let excess = names.len() - self.cap;
        for name in &names[..excess] {
            fs::remove_file(self.dir.join(name))?;
        }
        Ok(())
    }

    /// All backup records currently on disk, oldest first. Test and
    /// recovery-UI helper.
    pub fn records(&self) -> Result<Vec<CloudWinBackupRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("cloud_wins_") && n.ends_with(".json"))
            .collect();
        names.sort();
        let mut records = Vec::new();
        for name in names {
            if let Some(record) = fsutil::read_json_opt(&self.dir.join(name))? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_note(id: &str, content: &str) -> Note {
        Note {
            id: id.to_string(),
            title: id.to_string(),
            content: content.to_string(),
            content_header: None,
            language: "plaintext".to_string(),
            modified_time: "2025-01-01T00:00:00Z".to_string(),
            archived: false,
            folder_id: None,
        }
    }

    #[test]
    fn records_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let log = BackupLog::new(dir.path().join("cloud_wins_backups"), 100);

        let local = make_note("n1", "X");
        let cloud = make_note("n1", "Y");
        log.record(
            CloudWinReason::CloudWinsOverwrite,
            "n1",
            Some(&local),
            Some(&cloud),
        );

        let records = log.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, CloudWinReason::CloudWinsOverwrite);
        assert_eq!(records[0].local_note.as_ref().unwrap().content, "X");
        assert_eq!(records[0].cloud_note.as_ref().unwrap().content, "Y");
    }

    #[test]
    fn prunes_oldest_beyond_cap() {
        let dir = tempfile::tempdir().unwrap();
        let log = BackupLog::new(dir.path().join("cloud_wins_backups"), 3);

        for i in 0..5 {
            let note = make_note(&format!("n{i}"), "body");
            log.record(CloudWinReason::CloudDeleteDuringPull, &note.id, Some(&note), None);
            // Distinct millisecond stamps keep file names ordered
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let records = log.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].note_id, "n2");
        assert_eq!(records[2].note_id, "n4");
    }

    #[test]
    fn empty_dir_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = BackupLog::new(dir.path().join("cloud_wins_backups"), 100);
        assert!(log.records().unwrap().is_empty());
    }
}
