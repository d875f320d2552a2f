//! Background runs keyed by run id.
//!
//! `RunRegistry::spawn` starts one orchestrator pass on its own task and
//! returns a `RunHandle` the caller can poll, await or cancel. The registry
//! keeps a status entry per run until `prune_finished` drops it. Runs under
//! different ids are not coordinated with each other; starting two against
//! the same tree is the caller's mistake to avoid.

use crate::error::{Result, StitchError};
use crate::orchestrator::{Orchestrator, RunProgress, RunSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    Running,
    Finished { failed: u32 },
    Cancelled,
    Errored { message: String },
}

impl RunState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunState,
    pub progress: RunProgress,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What a finished run hands back.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    /// Whether any feature is Failed once the run ends.
    pub has_failures: bool,
}

pub struct RunHandle {
    pub run_id: String,
    progress: watch::Receiver<RunProgress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunOutcome>>,
}

impl RunHandle {
    /// A fresh receiver for the run's progress. It reports closed once the
    /// run is over.
    pub fn progress(&self) -> watch::Receiver<RunProgress> {
        self.progress.clone()
    }

    /// Ask the run to stop after the feature in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<RunOutcome> {
        self.task
            .await
            .map_err(|e| StitchError::infra(format!("run task failed: {e}")))?
    }
}

#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, Entry>>>,
    next_id: Arc<AtomicU64>,
}

struct Entry {
    status: RunStatus,
    cancel: CancellationToken,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("run-{}-{n}", Utc::now().format("%Y%m%dT%H%M%S"))
    }

    fn with_runs<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        // A panic while holding the lock leaves plain data behind; keep going.
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut runs)
    }

    /// Start `orchestrator` on a background task. `cancel` is the parent
    /// token (signals, STOP file); the run gets a child of it.
    pub fn spawn(&self, orchestrator: Orchestrator, cancel: &CancellationToken) -> RunHandle {
        let run_id = self.allocate_id();
        let token = cancel.child_token();
        let (tx, rx) = watch::channel(RunProgress::default());

        self.with_runs(|runs| {
            runs.insert(
                run_id.clone(),
                Entry {
                    status: RunStatus {
                        run_id: run_id.clone(),
                        state: RunState::Running,
                        progress: RunProgress::default(),
                        started_at: Utc::now(),
                        finished_at: None,
                    },
                    cancel: token.clone(),
                },
            );
        });

        let forward = self.clone();
        let forward_id = run_id.clone();
        let mut forward_rx = rx.clone();
        tokio::spawn(async move {
            while forward_rx.changed().await.is_ok() {
                let progress = forward_rx.borrow_and_update().clone();
                forward.update(&forward_id, |s| s.progress = progress);
            }
        });

        let registry = self.clone();
        let task_id = run_id.clone();
        let task_token = token.clone();
        let mut orchestrator = orchestrator
            .with_cancellation(token.clone())
            .with_progress(tx);
        let task = tokio::spawn(async move {
            let result = orchestrator.run().await;
            let has_failures = orchestrator.queue().has_failures();
            // Dropping the orchestrator closes the progress channel.
            drop(orchestrator);

            let state = match &result {
                Ok(_) if task_token.is_cancelled() => RunState::Cancelled,
                Ok(summary) => RunState::Finished {
                    failed: summary.failed,
                },
                Err(e) => RunState::Errored {
                    message: e.to_string(),
                },
            };
            tracing::info!(run_id = %task_id, ?state, "run ended");
            registry.update(&task_id, |s| {
                s.state = state;
                s.finished_at = Some(Utc::now());
            });
            result.map(|summary| RunOutcome {
                summary,
                has_failures,
            })
        });

        tracing::info!(run_id = %run_id, "run started");
        RunHandle {
            run_id,
            progress: rx,
            cancel: token,
            task,
        }
    }

    fn update(&self, run_id: &str, f: impl FnOnce(&mut RunStatus)) {
        self.with_runs(|runs| {
            if let Some(entry) = runs.get_mut(run_id) {
                f(&mut entry.status);
            }
        });
    }

    pub fn poll(&self, run_id: &str) -> Option<RunStatus> {
        self.with_runs(|runs| runs.get(run_id).map(|e| e.status.clone()))
    }

    pub fn list(&self) -> Vec<RunStatus> {
        let mut all: Vec<RunStatus> =
            self.with_runs(|runs| runs.values().map(|e| e.status.clone()).collect());
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    /// Request cancellation. Returns false for unknown or finished runs.
    pub fn cancel(&self, run_id: &str) -> bool {
        self.with_runs(|runs| match runs.get(run_id) {
            Some(entry) if !entry.status.state.is_finished() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        })
    }

    /// Drop entries of finished runs. Returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        self.with_runs(|runs| {
            let before = runs.len();
            runs.retain(|_, e| !e.status.state.is_finished());
            before - runs.len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{GenerationOutcome, Generator, NoopTelemetry, TestRun, TestRunner, Vcs};
    use crate::config::StitchConfig;
    use crate::feature::Feature;
    use crate::orchestrator::{Collaborators, StopReason};
    use crate::queue::FeatureQueue;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::time::Duration;

    struct FailingGenerator;

    #[async_trait]
    impl Generator for FailingGenerator {
        async fn generate(&self, _feature: &Feature) -> GenerationOutcome {
            GenerationOutcome::failed("offline")
        }
    }

    struct NoTests;

    #[async_trait]
    impl TestRunner for NoTests {
        async fn run_all(&self) -> Result<TestRun> {
            Ok(TestRun {
                stdout: "no tests ran in 0.01s".into(),
                stderr: String::new(),
                exit_code: Some(5),
            })
        }

        async fn collect_test_ids(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct NoVcs;

    #[async_trait]
    impl Vcs for NoVcs {
        async fn commit(&self, _files: &[PathBuf], _message: &str) -> bool {
            false
        }
    }

    fn orchestrator(features: &[&str]) -> Orchestrator {
        let mut queue = FeatureQueue::in_memory();
        for id in features {
            queue.add_feature(Feature::new(*id, *id)).unwrap();
        }
        Orchestrator::new(
            StitchConfig::default(),
            queue,
            Collaborators {
                generator: Arc::new(FailingGenerator),
                tests: Arc::new(NoTests),
                vcs: Arc::new(NoVcs),
                telemetry: Arc::new(NoopTelemetry),
            },
        )
    }

    async fn wait_finished(registry: &RunRegistry, run_id: &str) -> RunStatus {
        for _ in 0..100 {
            if let Some(status) = registry.poll(run_id) {
                if status.state.is_finished() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn test_spawn_poll_and_join() {
        let registry = RunRegistry::new();
        let handle = registry.spawn(orchestrator(&["a"]), &CancellationToken::new());
        let run_id = handle.run_id.clone();
        assert!(registry.poll(&run_id).is_some());

        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.summary.failed, 1);
        assert!(outcome.has_failures);

        let status = wait_finished(&registry, &run_id).await;
        assert_eq!(status.state, RunState::Finished { failed: 1 });
        assert!(status.finished_at.is_some());
        assert!(!registry.cancel(&run_id));
    }

    #[tokio::test]
    async fn test_cancelled_parent_stops_run() {
        let registry = RunRegistry::new();
        let parent = CancellationToken::new();
        parent.cancel();
        let handle = registry.spawn(orchestrator(&["a", "b"]), &parent);
        let run_id = handle.run_id.clone();

        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.summary.processed, 0);
        assert_eq!(outcome.summary.stop_reason, StopReason::Cancelled);
        assert_eq!(wait_finished(&registry, &run_id).await.state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_progress_channel_closes_when_run_ends() {
        let registry = RunRegistry::new();
        let handle = registry.spawn(orchestrator(&["a"]), &CancellationToken::new());
        let mut rx = handle.progress();
        while rx.changed().await.is_ok() {}
        assert_eq!(rx.borrow().processed, 1);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_ids_are_unique_and_prunable() {
        let registry = RunRegistry::new();
        let first = registry.spawn(orchestrator(&[]), &CancellationToken::new());
        let second = registry.spawn(orchestrator(&[]), &CancellationToken::new());
        assert_ne!(first.run_id, second.run_id);
        let ids = (first.run_id.clone(), second.run_id.clone());

        first.join().await.unwrap();
        second.join().await.unwrap();
        wait_finished(&registry, &ids.0).await;
        wait_finished(&registry, &ids.1).await;

        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.prune_finished(), 2);
        assert!(registry.poll(&ids.0).is_none());
        assert!(!registry.cancel("run-unknown"));
    }
}
