//! Drives runnable features, one at a time, through generation, integrity
//! scanning, target resolution, conflict analysis, integration and the
//! checkpoint.
//!
//! A failure marks the feature Failed and blocks its direct dependents.
//! Unless the run is configured to continue, the run stops there.
//! Cancellation is checked between features only. A feature that has
//! started integrating always finishes or fails cleanly.

use crate::checkpoint::{self, IntegrationCheckpoint, TestBaseline};
use crate::collaborators::{Generator, SpanId, Telemetry, TestRunner, Vcs};
use crate::config::StitchConfig;
use crate::conflict::{self, Assessment, ConflictAnalyzer, ConflictGroup, MergeStrategy};
use crate::error::{Result, StitchError};
use crate::feature::{Feature, FeatureStatus};
use crate::integrity::{self, IntegrityScanner};
use crate::merge::{MergeEngine, WrittenFile};
use crate::pysource;
use crate::queue::FeatureQueue;
use crate::target::{Candidate, TargetResolver};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// The external systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn Generator>,
    pub tests: Arc<dyn TestRunner>,
    pub vcs: Arc<dyn Vcs>,
    pub telemetry: Arc<dyn Telemetry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Starting,
    Baseline,
    Generating,
    Integrating,
    Checkpoint,
    Finished,
}

/// Snapshot published after every step of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProgress {
    pub phase: RunPhase,
    pub current_feature: Option<String>,
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            phase: RunPhase::Starting,
            current_feature: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing left that can run.
    Exhausted,
    MaxFeatures,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFailure {
    pub feature_id: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub blocked: Vec<String>,
    pub failures: Vec<FeatureFailure>,
    /// Generated files no target could be inferred for, and targets no
    /// strategy could be applied to automatically.
    pub manual_review: Vec<PathBuf>,
    pub already_integrated: Vec<PathBuf>,
    pub written: Vec<PathBuf>,
    pub stop_reason: StopReason,
    pub dry_run: bool,
}

impl RunSummary {
    fn new(dry_run: bool) -> Self {
        Self {
            processed: 0,
            succeeded: 0,
            failed: 0,
            blocked: Vec::new(),
            failures: Vec::new(),
            manual_review: Vec::new(),
            already_integrated: Vec::new(),
            written: Vec::new(),
            stop_reason: StopReason::Exhausted,
            dry_run,
        }
    }

    pub fn print(&self) {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        println!(
            "Run finished{mode}: processed={} succeeded={} failed={} blocked={}",
            self.processed,
            self.succeeded,
            self.failed,
            self.blocked.len()
        );
        for f in &self.failures {
            println!("  FAILED {} [{}]: {}", f.feature_id, f.kind, f.message);
        }
        if !self.blocked.is_empty() {
            println!("  Blocked: {}", self.blocked.join(", "));
        }
        for path in &self.manual_review {
            println!("  Manual review: {}", path.display());
        }
        for path in &self.already_integrated {
            println!("  Already integrated: {}", path.display());
        }
    }
}

/// What integrating one feature produced, kept for rollback and reporting.
#[derive(Default)]
struct Integration {
    written: Vec<WrittenFile>,
    targets: Vec<PathBuf>,
    manual_review: Vec<PathBuf>,
    already_integrated: Vec<PathBuf>,
}

pub struct Orchestrator {
    config: StitchConfig,
    queue: FeatureQueue,
    collaborators: Collaborators,
    resolver: TargetResolver,
    scanner: IntegrityScanner,
    analyzer: ConflictAnalyzer,
    engine: MergeEngine,
    /// Target -> names of the features that wrote it during this run.
    session: BTreeMap<PathBuf, Vec<String>>,
    cancel: CancellationToken,
    progress: Option<watch::Sender<RunProgress>>,
    state: RunProgress,
}

impl Orchestrator {
    pub fn new(config: StitchConfig, queue: FeatureQueue, collaborators: Collaborators) -> Self {
        Self {
            resolver: TargetResolver::new(&config.resolver),
            scanner: IntegrityScanner::new(&config.integrity),
            analyzer: ConflictAnalyzer::new(&config.conflict),
            engine: MergeEngine::new(),
            config,
            queue,
            collaborators,
            session: BTreeMap::new(),
            cancel: CancellationToken::new(),
            progress: None,
            state: RunProgress::default(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, tx: watch::Sender<RunProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn queue(&self) -> &FeatureQueue {
        &self.queue
    }

    fn publish(&mut self, phase: RunPhase, current: Option<&str>) {
        self.state.phase = phase;
        self.state.current_feature = current.map(str::to_string);
        self.state.updated_at = Utc::now();
        if let Some(tx) = &self.progress {
            tx.send_replace(self.state.clone());
        }
    }

    /// Process runnable features until none remain, the feature limit is
    /// hit, a failure stops the run, or cancellation is requested.
    pub async fn run(&mut self) -> Result<RunSummary> {
        if self.config.run.dry_run {
            return self.dry_run();
        }

        let recovered = self.queue.recover_interrupted()?;
        if !recovered.is_empty() {
            tracing::info!(features = ?recovered, "recovered features from an interrupted run");
        }

        self.publish(RunPhase::Baseline, None);
        let baseline = TestBaseline::capture(self.collaborators.tests.as_ref()).await;
        let checkpoint = IntegrationCheckpoint::new(
            self.config.checkpoint.clone(),
            self.config.project.clone(),
            Arc::clone(&self.collaborators.tests),
            baseline,
        );

        let mut summary = RunSummary::new(false);
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("stop requested, ending run between features");
                summary.stop_reason = StopReason::Cancelled;
                break;
            }
            if let Some(max) = self.config.run.max_features {
                if summary.processed >= max {
                    summary.stop_reason = StopReason::MaxFeatures;
                    break;
                }
            }
            let Some(feature) = self.queue.get_next_runnable().cloned() else {
                summary.stop_reason = StopReason::Exhausted;
                break;
            };

            tracing::info!(feature_id = %feature.id, name = %feature.name, "processing feature");
            summary.processed += 1;
            self.state.processed = summary.processed;

            let mut integration = Integration::default();
            let outcome = self
                .process_feature(&feature, &checkpoint, &mut integration)
                .await;
            summary.manual_review.append(&mut integration.manual_review);
            summary
                .already_integrated
                .append(&mut integration.already_integrated);

            match outcome {
                Ok(()) => {
                    summary.succeeded += 1;
                    summary.written.extend(integration.targets);
                    self.state.succeeded = summary.succeeded;
                    tracing::info!(feature_id = %feature.id, "feature complete");
                }
                Err(e) => {
                    summary.failed += 1;
                    self.state.failed = summary.failed;
                    self.fail_feature(&feature, &e, &integration, &mut summary)?;
                    if self.config.run.stop_on_failure {
                        summary.stop_reason = StopReason::Failure;
                        break;
                    }
                }
            }
        }

        self.publish(RunPhase::Finished, None);
        Ok(summary)
    }

    fn fail_feature(
        &mut self,
        feature: &Feature,
        error: &StitchError,
        integration: &Integration,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if self.config.run.rollback_on_failure && !integration.written.is_empty() {
            if let Err(e) = self.engine.rollback(&integration.written) {
                tracing::error!(feature_id = %feature.id, error = %e, "rollback failed");
            }
            for target in &integration.targets {
                if let Some(names) = self.session.get_mut(target) {
                    names.retain(|n| n != &feature.name);
                }
            }
        }

        summary.failures.push(FeatureFailure {
            feature_id: feature.id.clone(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        });

        let status = self
            .queue
            .get(&feature.id)
            .map(|f| f.status)
            .unwrap_or(FeatureStatus::Pending);
        if !status.can_transition_to(FeatureStatus::Failed) {
            // Errors raised before the feature left Pending/Generated.
            tracing::error!(feature_id = %feature.id, %status, error = %error, "feature could not start");
            return Ok(());
        }
        let blocked = self.queue.mark_failed(&feature.id, &error.to_string())?;
        summary.blocked.extend(blocked);
        Ok(())
    }

    async fn process_feature(
        &mut self,
        feature: &Feature,
        checkpoint: &IntegrationCheckpoint,
        integration: &mut Integration,
    ) -> Result<()> {
        let mut feature = feature.clone();
        if feature.status == FeatureStatus::Pending {
            self.queue.transition(&feature.id, FeatureStatus::Developing)?;
            self.publish(RunPhase::Generating, Some(&feature.id));
            let files = self.generate(&feature).await?;
            self.queue.set_generated_files(&feature.id, files.clone())?;
            self.queue.transition(&feature.id, FeatureStatus::Generated)?;
            feature.generated_files = files;
        }

        self.queue.transition(&feature.id, FeatureStatus::Integrating)?;
        self.publish(RunPhase::Integrating, Some(&feature.id));
        let span = self.span_start(&feature);

        let result = self.integrate_and_check(&feature, checkpoint, integration).await;

        self.span_end(span, result.is_ok());
        result
    }

    async fn integrate_and_check(
        &mut self,
        feature: &Feature,
        checkpoint: &IntegrationCheckpoint,
        integration: &mut Integration,
    ) -> Result<()> {
        self.integrate(feature, integration)?;

        self.queue.transition(&feature.id, FeatureStatus::Checkpoint)?;
        self.publish(RunPhase::Checkpoint, Some(&feature.id));
        let modified: Vec<PathBuf> = integration.written.iter().map(|w| w.path.clone()).collect();
        let results = checkpoint.run_all(&modified, &feature.name).await;
        for r in &results {
            println!("  {r}");
        }
        if !checkpoint::summarize(&results) {
            let failed: Vec<String> = results
                .iter()
                .filter(|r| r.status == checkpoint::CheckStatus::Failed)
                .map(|r| format!("{}: {}", r.check, r.errors.join("; ")))
                .collect();
            return Err(StitchError::Checkpoint(failed.join(" | ")));
        }

        if self.config.run.commit && !modified.is_empty() {
            let message = format!("stitch: integrate {} ({})", feature.name, feature.id);
            if !self.collaborators.vcs.commit(&modified, &message).await {
                tracing::warn!(feature_id = %feature.id, "nothing committed");
            }
        }

        self.queue.transition(&feature.id, FeatureStatus::Complete)?;
        Ok(())
    }

    async fn generate(&self, feature: &Feature) -> Result<Vec<PathBuf>> {
        let attempts = self.config.generator.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let outcome = self.collaborators.generator.generate(feature).await;
            if outcome.success && !outcome.output_files.is_empty() {
                tracing::info!(
                    feature_id = %feature.id,
                    files = outcome.output_files.len(),
                    attempt,
                    "generation succeeded"
                );
                return Ok(outcome.output_files);
            }
            last_error = outcome
                .error
                .unwrap_or_else(|| "generator produced no files".to_string());
            tracing::warn!(
                feature_id = %feature.id,
                attempt,
                max_attempts = attempts,
                error = %last_error,
                "generation attempt failed"
            );
        }
        Err(StitchError::Generation {
            feature_id: feature.id.clone(),
            message: last_error,
        })
    }

    fn load_candidates(&self, feature: &Feature) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for source in &feature.generated_files {
            let candidate = Candidate::load(feature, source).map_err(|e| {
                StitchError::infra(format!("reading {}: {e}", source.display()))
            })?;
            let issues = self.scanner.scan(&candidate.content);
            for issue in issues.iter().filter(|i| !i.is_truncation()) {
                tracing::info!(file = %source.display(), %issue, "integrity advisory");
            }
            if integrity::has_truncation(&issues) {
                let messages: Vec<String> = issues
                    .iter()
                    .filter(|i| i.is_truncation())
                    .map(|i| i.to_string())
                    .collect();
                if self.config.integrity.truncation_blocking {
                    return Err(StitchError::Truncation {
                        path: source.clone(),
                        issues: messages,
                    });
                }
                tracing::warn!(file = %source.display(), issues = ?messages, "truncation not blocking");
            }
            candidates.push(candidate);
        }
        Ok(candidates)
    }

    /// Write every target the feature produces. Files written so far are
    /// left in `integration` so the caller can roll them back.
    fn integrate(&mut self, feature: &Feature, integration: &mut Integration) -> Result<()> {
        let candidates = self.load_candidates(feature)?;
        let (groups, unresolved) = conflict::group_candidates(&self.resolver, candidates);
        for c in &unresolved {
            tracing::warn!(feature_id = %feature.id, file = %c.source.display(), "no target inferred, needs manual review");
            integration.manual_review.push(c.source.clone());
        }
        if groups.is_empty() {
            let source = feature.generated_files.first().cloned().unwrap_or_default();
            return Err(StitchError::conflict(source, "no target could be inferred"));
        }

        for group in groups {
            let dest = self.config.root().join(&group.target);
            let content = match self.analyzer.assess(&dest, &group) {
                Assessment::AlreadyIntegrated => {
                    tracing::info!(target = %group.target.display(), "already integrated, skipping");
                    integration.already_integrated.push(group.target.clone());
                    continue;
                }
                Assessment::NewFile => group.candidates[0].content.clone(),
                Assessment::Resolve {
                    strategy,
                    report,
                    blocked,
                } => {
                    if let Some(report) = &report {
                        tracing::info!(target = %group.target.display(), %strategy, risk = %report.risk_level, "conflict analysis");
                    }
                    if let Some(reason) = blocked {
                        tracing::warn!(target = %group.target.display(), %reason, "target needs manual review");
                        integration.manual_review.push(group.target.clone());
                        return Err(StitchError::conflict(&group.target, reason));
                    }
                    self.resolve_group(&dest, &group, strategy)?
                }
            };
            let written = self.engine.write_target(&dest, &content)?;
            integration.written.push(written);
            integration.targets.push(group.target.clone());
            self.session
                .entry(group.target.clone())
                .or_default()
                .push(feature.name.clone());
        }
        Ok(())
    }

    /// Merge a group, refusing a discarding strategy that would drop what
    /// an earlier feature of this run put at the destination.
    fn resolve_group(
        &self,
        dest: &Path,
        group: &ConflictGroup,
        strategy: MergeStrategy,
    ) -> Result<String> {
        let merged = self.engine.merge(dest, &group.candidates, strategy)?;
        let Some(writers) = self.session.get(&group.target).filter(|w| !w.is_empty()) else {
            return Ok(merged);
        };
        if !strategy.discards_content() || !dest.exists() {
            return Ok(merged);
        }
        let existing = std::fs::read_to_string(dest)?;
        let lost = dropped_symbols(&existing, &merged);
        if lost.is_empty() {
            return Ok(merged);
        }
        Err(StitchError::conflict(
            &group.target,
            format!(
                "strategy '{strategy}' would discard {} written earlier in this run by {}",
                lost.into_iter().collect::<Vec<_>>().join(", "),
                writers.join(", ")
            ),
        ))
    }

    /// Analyse without generating, writing or checkpointing. Features
    /// without generated output are reported as needing generation.
    fn dry_run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::new(true);
        let mut planned: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        let features: Vec<Feature> = self
            .queue
            .features()
            .filter(|f| matches!(f.status, FeatureStatus::Pending | FeatureStatus::Generated))
            .cloned()
            .collect();

        for feature in features {
            if let Some(max) = self.config.run.max_features {
                if summary.processed >= max {
                    summary.stop_reason = StopReason::MaxFeatures;
                    break;
                }
            }
            summary.processed += 1;
            println!("[{}] {}", feature.id, feature.name);
            if feature.generated_files.is_empty() {
                println!("  would generate (no generated output yet)");
                continue;
            }
            let candidates = match self.load_candidates(&feature) {
                Ok(c) => c,
                Err(e) => {
                    println!("  would fail: {e}");
                    summary.failed += 1;
                    continue;
                }
            };
            let (groups, unresolved) = conflict::group_candidates(&self.resolver, candidates);
            for c in unresolved {
                println!("  manual review: {} (no target inferred)", c.source.display());
                summary.manual_review.push(c.source);
            }
            for group in groups {
                let dest = self.config.root().join(&group.target);
                let decision = match self.analyzer.assess(&dest, &group) {
                    Assessment::AlreadyIntegrated => {
                        println!("  {}: already integrated", group.target.display());
                        summary.already_integrated.push(group.target);
                        continue;
                    }
                    Assessment::NewFile => "would write new file".to_string(),
                    Assessment::Resolve {
                        strategy,
                        report,
                        blocked,
                    } => {
                        let risk = report
                            .map(|r| format!(" risk={} ({})", r.risk_level, r.risk_score))
                            .unwrap_or_default();
                        match blocked {
                            Some(reason) => {
                                summary.manual_review.push(group.target.clone());
                                format!("would block: {reason}{risk}")
                            }
                            None => format!("would {strategy}{risk}"),
                        }
                    }
                };
                println!("  {}: {decision}", group.target.display());
                let earlier = planned.entry(group.target).or_default();
                if !earlier.is_empty() {
                    println!("    also written this run by: {}", earlier.join(", "));
                }
                earlier.push(feature.name.clone());
            }
        }
        Ok(summary)
    }

    fn span_start(&self, feature: &Feature) -> Option<SpanId> {
        let telemetry = &self.collaborators.telemetry;
        let span = match telemetry.start_span("integrate_feature") {
            Ok(span) => span,
            Err(e) => {
                tracing::debug!(error = %e, "telemetry unavailable");
                return None;
            }
        };
        for (key, value) in [("feature.id", &feature.id), ("feature.name", &feature.name)] {
            if let Err(e) = telemetry.set_attribute(span, key, value) {
                tracing::debug!(error = %e, "telemetry attribute dropped");
            }
        }
        Some(span)
    }

    fn span_end(&self, span: Option<SpanId>, success: bool) {
        if let Some(span) = span {
            if let Err(e) = self.collaborators.telemetry.end_span(span, success) {
                tracing::debug!(error = %e, "telemetry span not closed");
            }
        }
    }
}

fn dropped_symbols(before: &str, after: &str) -> BTreeSet<String> {
    let before = pysource::parse_module(before).0;
    let after = pysource::parse_module(after).0;
    let mut kept = after.class_names();
    kept.extend(after.function_names());
    let mut had = before.class_names();
    had.extend(before.function_names());
    had.difference(&kept).cloned().collect()
}
