//! Run status file and the `status` command.
//!
//! `.stitch/run-status.json` is rewritten atomically on every progress
//! change of a run, so `stitch status` in another terminal sees where the
//! run is without touching the queue file the run owns.

use crate::data_dir::write_atomic;
use crate::feature::FeatureStatus;
use crate::orchestrator::{RunProgress, RunSummary};
use crate::queue::FeatureQueue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::watch;

/// The JSON payload written to `run-status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusData {
    pub pid: u32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub progress: RunProgress,
    /// Present once the run has finished.
    pub summary: Option<RunSummary>,
}

pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data; readers never see a partial file.
    pub fn write(&self, data: &RunStatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;
        write_atomic(&self.path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns None if the file does not exist.
    pub fn read(&self) -> Result<Option<RunStatusData>, StatusError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let data = serde_json::from_str(&contents)
                    .map_err(|e| StatusError::Deserialize { source: e })?;
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StatusError::Read {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

/// Mirror a run's progress into the status file until the run drops its
/// sender. Returns the last data written.
pub async fn mirror_progress(
    file: StatusFile,
    run_id: String,
    mut progress: watch::Receiver<RunProgress>,
) -> RunStatusData {
    let mut data = RunStatusData {
        pid: std::process::id(),
        run_id,
        started_at: Utc::now(),
        progress: progress.borrow_and_update().clone(),
        summary: None,
    };
    loop {
        if let Err(e) = file.write(&data) {
            tracing::warn!(path = %file.path().display(), error = %e, "failed to write run status");
        }
        if progress.changed().await.is_err() {
            break;
        }
        data.progress = progress.borrow_and_update().clone();
    }
    data
}

/// Record the finished run's summary in the status file.
pub fn write_final(path: &Path, mut data: RunStatusData, summary: &RunSummary) {
    data.summary = Some(summary.clone());
    if let Err(e) = StatusFile::new(path.to_path_buf()).write(&data) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write run status");
    }
}

/// Format a duration into human-readable elapsed time (e.g., "3h 42m").
fn format_elapsed(duration: chrono::Duration) -> String {
    let total_secs = duration.num_seconds().max(0);
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Print per-status counts, and with `verbose` one line per feature.
pub fn display_queue(queue: &FeatureQueue, verbose: bool) {
    if queue.is_empty() {
        println!("Queue is empty. Import a plan with `stitch import <plan.json>`.");
        return;
    }
    let counts: Vec<String> = queue
        .counts()
        .into_iter()
        .map(|(status, n)| format!("{status}={n}"))
        .collect();
    println!("Features: {} ({})", queue.len(), counts.join(", "));

    match queue.get_next_runnable() {
        Some(next) => println!("Next runnable: {} ({})", next.id, next.name),
        None => println!("Next runnable: none"),
    }

    if !verbose {
        for f in queue
            .features()
            .filter(|f| matches!(f.status, FeatureStatus::Failed | FeatureStatus::Blocked))
        {
            println!(
                "  {:<10} {:<20} {}",
                f.status.as_str(),
                f.id,
                f.error_message.as_deref().unwrap_or("")
            );
        }
        return;
    }

    println!();
    println!("  {:<12} {:<20} {:>8}  NAME", "STATUS", "ID", "ATTEMPTS");
    for f in queue.features() {
        println!(
            "  {:<12} {:<20} {:>8}  {}",
            f.status.as_str(),
            f.id,
            f.integration_attempts,
            f.name
        );
        if !f.dependencies.is_empty() {
            let deps: Vec<&str> = f.dependencies.iter().map(String::as_str).collect();
            println!("      depends on: {}", deps.join(", "));
        }
        for file in &f.generated_files {
            println!("      generated: {}", file.display());
        }
        if let Some(msg) = &f.error_message {
            println!("      error: {msg}");
        }
    }
}

/// Print the last run's status file. Returns Ok(false) when no run has
/// written one.
pub fn display_run(status_path: &Path) -> Result<bool, StatusError> {
    let Some(data) = StatusFile::new(status_path.to_path_buf()).read()? else {
        return Ok(false);
    };
    let elapsed = data.progress.updated_at - data.started_at;
    match &data.summary {
        Some(summary) => {
            println!(
                "Last run {}: finished ({:?}) after {}",
                data.run_id,
                summary.stop_reason,
                format_elapsed(elapsed)
            );
            println!(
                "  processed={} succeeded={} failed={} blocked={}",
                summary.processed,
                summary.succeeded,
                summary.failed,
                summary.blocked.len()
            );
        }
        None => {
            println!(
                "Run {} (pid {}): {:?}, {} elapsed",
                data.run_id,
                data.pid,
                data.progress.phase,
                format_elapsed(elapsed)
            );
            if let Some(current) = &data.progress.current_feature {
                println!("  current feature: {current}");
            }
            println!(
                "  processed={} succeeded={} failed={}",
                data.progress.processed, data.progress.succeeded, data.progress.failed
            );
        }
    }
    Ok(true)
}

/// Errors from status file operations.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to serialize status: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to deserialize status: {source}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write status file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read status file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{RunPhase, StopReason};
    use tempfile::tempdir;

    fn sample() -> RunStatusData {
        RunStatusData {
            pid: 42,
            run_id: "run-1".into(),
            started_at: Utc::now(),
            progress: RunProgress {
                phase: RunPhase::Integrating,
                current_feature: Some("auth".into()),
                processed: 2,
                succeeded: 1,
                failed: 0,
                updated_at: Utc::now(),
            },
            summary: None,
        }
    }

    #[test]
    fn test_status_file_read_roundtrip() {
        let dir = tempdir().unwrap();
        let file = StatusFile::new(dir.path().join("run-status.json"));
        file.write(&sample()).unwrap();

        let read = file.read().unwrap().unwrap();
        assert_eq!(read.run_id, "run-1");
        assert_eq!(read.progress.phase, RunPhase::Integrating);
        assert_eq!(read.progress.current_feature.as_deref(), Some("auth"));
        assert!(read.summary.is_none());
    }

    #[test]
    fn test_status_file_read_missing_returns_none() {
        let dir = tempdir().unwrap();
        let file = StatusFile::new(dir.path().join("nope.json"));
        assert!(file.read().unwrap().is_none());
        assert!(!display_run(file.path()).unwrap());
    }

    #[test]
    fn test_status_file_read_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run-status.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = StatusFile::new(path).read().unwrap_err();
        assert!(matches!(err, StatusError::Deserialize { .. }));
        assert!(err.to_string().starts_with("failed to deserialize status"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_status_file_write_error_names_path() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let path = blocker.join("run-status.json");
        let err = StatusFile::new(path).write(&sample()).unwrap_err();
        assert!(matches!(err, StatusError::Write { .. }));
        assert!(err.to_string().contains("not-a-dir"));
    }

    #[test]
    fn test_status_file_remove() {
        let dir = tempdir().unwrap();
        let file = StatusFile::new(dir.path().join("run-status.json"));
        file.write(&sample()).unwrap();
        file.remove();
        assert!(!file.path().exists());
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(chrono::Duration::seconds(5)), "5s");
        assert_eq!(format_elapsed(chrono::Duration::seconds(125)), "2m 5s");
        assert_eq!(format_elapsed(chrono::Duration::seconds(3 * 3600 + 42 * 60)), "3h 42m");
        assert_eq!(format_elapsed(chrono::Duration::seconds(-4)), "0s");
    }

    #[tokio::test]
    async fn test_mirror_progress_tracks_last_update() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run-status.json");
        let (tx, rx) = watch::channel(RunProgress::default());
        let mirror = tokio::spawn(mirror_progress(
            StatusFile::new(path.clone()),
            "run-7".into(),
            rx,
        ));

        let mut progress = RunProgress::default();
        progress.phase = RunPhase::Finished;
        progress.processed = 3;
        tx.send_replace(progress);
        drop(tx);

        let data = mirror.await.unwrap();
        assert_eq!(data.progress.processed, 3);
        let on_disk = StatusFile::new(path.clone()).read().unwrap().unwrap();
        assert_eq!(on_disk.progress.phase, RunPhase::Finished);

        let summary = RunSummary {
            processed: 3,
            succeeded: 3,
            failed: 0,
            blocked: Vec::new(),
            failures: Vec::new(),
            manual_review: Vec::new(),
            already_integrated: Vec::new(),
            written: Vec::new(),
            stop_reason: StopReason::Exhausted,
            dry_run: false,
        };
        write_final(&path, data, &summary);
        let on_disk = StatusFile::new(path.clone()).read().unwrap().unwrap();
        assert_eq!(on_disk.summary.unwrap().succeeded, 3);
        assert!(display_run(&path).unwrap());
    }
}
