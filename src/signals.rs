//! Signal handling for graceful shutdown.
//!
//! SIGINT, SIGTERM and a STOP file all request a stop. The run finishes the
//! feature in flight and then ends. A second SIGINT exits immediately;
//! subprocesses die with their handles.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit status for an interrupted run (128 + SIGINT).
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Shared shutdown state. Cloning shares the same token.
#[derive(Clone)]
pub struct SignalHandler {
    token: CancellationToken,
}

/// What the STOP-file check found.
#[derive(Debug, PartialEq)]
pub enum StopFileStatus {
    NotPresent,
    /// The file was present and has been deleted.
    Detected,
}

impl SignalHandler {
    /// A handler wired to `token` with no listeners. Use `install` in the
    /// binary.
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Create a handler and spawn SIGINT/SIGTERM listeners. Needs a tokio
    /// runtime.
    pub fn install(token: CancellationToken) -> Self {
        let handler = Self::new(token);
        handler.spawn_sigint_listener();
        handler.spawn_sigterm_listener();
        handler
    }

    pub fn request_shutdown(&self) {
        self.token.cancel();
    }

    /// If the STOP file exists, delete it and request shutdown.
    pub fn check_stop_file(&self, stop_path: &Path) -> StopFileStatus {
        if !stop_path.exists() {
            return StopFileStatus::NotPresent;
        }
        tracing::info!(path = %stop_path.display(), "STOP file detected, requesting shutdown");
        if let Err(e) = std::fs::remove_file(stop_path) {
            tracing::warn!(path = %stop_path.display(), error = %e, "failed to delete STOP file");
        }
        self.request_shutdown();
        StopFileStatus::Detected
    }

    /// Poll for the STOP file until it appears or shutdown is requested
    /// some other way.
    pub fn watch_stop_file(&self, stop_path: PathBuf, interval: Duration) {
        let handler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handler.token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if handler.check_stop_file(&stop_path) == StopFileStatus::Detected {
                    return;
                }
            }
        });
    }

    fn spawn_sigint_listener(&self) {
        let handler = self.clone();
        tokio::spawn(async move {
            let mut sigint =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGINT handler");
                        return;
                    }
                };

            sigint.recv().await;
            tracing::warn!("caught SIGINT, finishing current feature (Ctrl+C again to abort)");
            handler.request_shutdown();

            sigint.recv().await;
            tracing::warn!("second SIGINT, aborting run");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        });
    }

    fn spawn_sigterm_listener(&self) {
        let handler = self.clone();
        tokio::spawn(async move {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };

            sigterm.recv().await;
            tracing::warn!("caught SIGTERM, finishing current feature");
            handler.request_shutdown();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn make_handler() -> (SignalHandler, CancellationToken) {
        let token = CancellationToken::new();
        (SignalHandler::new(token.clone()), token)
    }

    #[test]
    fn test_request_shutdown_cancels_token() {
        let (handler, token) = make_handler();
        assert!(!token.is_cancelled());
        handler.request_shutdown();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_stop_file_not_present() {
        let (handler, token) = make_handler();
        let dir = tempdir().unwrap();
        assert_eq!(
            handler.check_stop_file(&dir.path().join("STOP")),
            StopFileStatus::NotPresent
        );
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_stop_file_detected_and_deleted() {
        let (handler, token) = make_handler();
        let dir = tempdir().unwrap();
        let stop_path = dir.path().join("STOP");
        fs::write(&stop_path, "").unwrap();

        assert_eq!(handler.check_stop_file(&stop_path), StopFileStatus::Detected);
        assert!(token.is_cancelled());
        assert!(!stop_path.exists(), "STOP file should be deleted");
    }

    #[test]
    fn test_handler_is_clone() {
        let (handler, token) = make_handler();
        let cloned = handler.clone();
        cloned.request_shutdown();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_watch_stop_file_cancels_token() {
        let (handler, token) = make_handler();
        let dir = tempdir().unwrap();
        let stop_path = dir.path().join("STOP");
        handler.watch_stop_file(stop_path.clone(), Duration::from_millis(20));

        fs::write(&stop_path, "").unwrap();
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("STOP file was not noticed");
        assert!(!stop_path.exists());
    }

    #[tokio::test]
    async fn test_watch_stop_file_ends_when_cancelled_elsewhere() {
        let (handler, token) = make_handler();
        let dir = tempdir().unwrap();
        let stop_path = dir.path().join("STOP");
        handler.watch_stop_file(stop_path.clone(), Duration::from_millis(20));

        token.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        fs::write(&stop_path, "").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(stop_path.exists(), "watcher should have stopped polling");
    }
}
