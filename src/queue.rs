//! Dependency-ordered feature registry with a persisted state machine.
//!
//! The queue owns every feature, its dependency edges and its lifecycle
//! state. Every mutating operation auto-saves the JSON document so a
//! crashed run resumes from the last consistent state.
//!
//! Scheduling never reorders: `get_next_runnable` walks features in
//! declared order and returns the first one whose dependencies are all
//! Complete.

use crate::data_dir::write_atomic;
use crate::error::{Result, StitchError};
use crate::feature::{Feature, FeatureStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// The persisted queue document.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueDocument {
    version: u32,
    features: BTreeMap<String, Feature>,
    order: Vec<String>,
    saved_at: DateTime<Utc>,
}

/// A plan file: the backlog as produced by the planning step.
#[derive(Debug, Deserialize)]
pub struct Plan {
    pub features: Vec<PlanFeature>,
}

#[derive(Debug, Deserialize)]
pub struct PlanFeature {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "targetFiles")]
    pub target_files: Vec<PathBuf>,
}

/// Outcome of importing a plan.
#[derive(Debug, Default, PartialEq)]
pub struct ImportReport {
    pub added: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct FeatureQueue {
    path: Option<PathBuf>,
    features: BTreeMap<String, Feature>,
    order: Vec<String>,
}

impl FeatureQueue {
    /// A queue that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            features: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Open the queue persisted at `path`, or start an empty one if the file
    /// does not exist yet. A file that exists but cannot be understood is a
    /// `CorruptState` error, never an empty queue.
    pub fn open(path: &Path) -> Result<Self> {
        let mut queue = Self {
            path: Some(path.to_path_buf()),
            features: BTreeMap::new(),
            order: Vec::new(),
        };

        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(queue),
            Err(e) => return Err(e.into()),
        };

        let doc = parse_document(&contents).map_err(|reason| StitchError::CorruptState {
            path: path.to_path_buf(),
            reason,
        })?;

        for id in &doc.order {
            if !doc.features.contains_key(id) {
                return Err(StitchError::CorruptState {
                    path: path.to_path_buf(),
                    reason: format!("order lists unknown feature '{id}'"),
                });
            }
        }

        queue.features = doc.features;
        queue.order = doc.order;
        // Records missing from `order` are appended in id order so none are lost.
        let listed: HashSet<String> = queue.order.iter().cloned().collect();
        let missing: Vec<String> = queue
            .features
            .keys()
            .filter(|id| !listed.contains(*id))
            .cloned()
            .collect();
        queue.order.extend(missing);

        tracing::debug!(
            path = %path.display(),
            features = queue.order.len(),
            "loaded feature queue"
        );
        Ok(queue)
    }

    /// Persist the queue. No-op for in-memory queues.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = QueueDocument {
            version: SCHEMA_VERSION,
            features: self.features.clone(),
            order: self.order.clone(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&doc)?;
        write_atomic(path, json.as_bytes())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.get(id)
    }

    /// Features in declared order.
    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.order.iter().filter_map(|id| self.features.get(id))
    }

    /// Register a new feature at the end of the queue. Dependencies must
    /// already be registered.
    pub fn add_feature(&mut self, feature: Feature) -> Result<()> {
        if self.features.contains_key(&feature.id) {
            return Err(StitchError::Usage(format!(
                "feature '{}' already exists",
                feature.id
            )));
        }
        if let Some(dep) = feature
            .dependencies
            .iter()
            .find(|d| !self.features.contains_key(*d))
        {
            return Err(StitchError::Usage(format!(
                "feature '{}' depends on unknown feature '{dep}'",
                feature.id
            )));
        }
        tracing::debug!(feature_id = %feature.id, "adding feature");
        self.order.push(feature.id.clone());
        self.features.insert(feature.id.clone(), feature);
        self.save()
    }

    /// Add every feature of a plan in plan order. Ids already present are
    /// skipped; a dependency on an id that is neither queued nor in the plan
    /// rejects the whole plan before anything is added.
    pub fn import_plan(&mut self, plan: Plan) -> Result<ImportReport> {
        let plan_ids: HashSet<&str> = plan.features.iter().map(|f| f.id.as_str()).collect();
        for pf in &plan.features {
            for dep in &pf.dependencies {
                if !plan_ids.contains(dep.as_str()) && !self.features.contains_key(dep) {
                    return Err(StitchError::Usage(format!(
                        "plan feature '{}' depends on unknown feature '{dep}'",
                        pf.id
                    )));
                }
            }
        }

        let mut report = ImportReport::default();
        let mut pending: Vec<Feature> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for pf in plan.features {
            if self.features.contains_key(&pf.id) || !seen.insert(pf.id.clone()) {
                tracing::warn!(feature_id = %pf.id, "feature already queued, skipping");
                report.skipped.push(pf.id);
                continue;
            }
            pending.push(
                Feature::new(pf.id, pf.name)
                    .with_description(pf.description)
                    .with_dependencies(pf.dependencies)
                    .with_target_files(pf.target_files),
            );
        }

        // Plans may list a feature before its dependency. Order them in a
        // staging list first so a cycle leaves the queue untouched.
        let mut placed: HashSet<String> = HashSet::new();
        let mut staged: Vec<Feature> = Vec::new();
        let mut remaining = pending;
        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for feature in remaining {
                if feature
                    .dependencies
                    .iter()
                    .all(|d| self.features.contains_key(d) || placed.contains(d))
                {
                    placed.insert(feature.id.clone());
                    staged.push(feature);
                } else {
                    deferred.push(feature);
                }
            }
            if deferred.len() == before {
                let ids: Vec<String> = deferred.iter().map(|f| f.id.clone()).collect();
                return Err(StitchError::Usage(format!(
                    "plan contains a dependency cycle among: {}",
                    ids.join(", ")
                )));
            }
            remaining = deferred;
        }

        for feature in staged {
            report.added.push(feature.id.clone());
            self.order.push(feature.id.clone());
            self.features.insert(feature.id.clone(), feature);
        }
        self.save()?;
        Ok(report)
    }

    /// Read a plan file from disk and import it.
    pub fn import_from_plan(&mut self, plan_path: &Path) -> Result<ImportReport> {
        let contents = std::fs::read_to_string(plan_path)?;
        let plan: Plan = serde_json::from_str(&contents)?;
        self.import_plan(plan)
    }

    /// First feature, in declared order, that is Pending or Generated and
    /// whose dependencies are all Complete.
    pub fn get_next_runnable(&self) -> Option<&Feature> {
        self.features().find(|f| {
            matches!(f.status, FeatureStatus::Pending | FeatureStatus::Generated)
                && f.dependencies.iter().all(|d| {
                    self.features
                        .get(d)
                        .map(|dep| dep.status == FeatureStatus::Complete)
                        .unwrap_or(false)
                })
        })
    }

    /// Move a feature along one edge of the lifecycle graph.
    pub fn transition(&mut self, id: &str, to: FeatureStatus) -> Result<()> {
        let feature = self.get_mut(id)?;
        let from = feature.status;
        if !from.can_transition_to(to) {
            return Err(StitchError::InvalidTransition {
                feature_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        feature.status = to;
        if matches!(from, FeatureStatus::Failed | FeatureStatus::Blocked) {
            feature.error_message = None;
        }
        tracing::debug!(feature_id = id, %from, %to, "feature transition");
        self.save()
    }

    /// Record generation output for a feature.
    pub fn set_generated_files(&mut self, id: &str, files: Vec<PathBuf>) -> Result<()> {
        self.get_mut(id)?.generated_files = files;
        self.save()
    }

    /// Fail a feature and block its direct Pending dependents. Returns the
    /// ids that were blocked.
    pub fn mark_failed(&mut self, id: &str, message: &str) -> Result<Vec<String>> {
        let feature = self.get_mut(id)?;
        let from = feature.status;
        if !from.can_transition_to(FeatureStatus::Failed) {
            return Err(StitchError::InvalidTransition {
                feature_id: id.to_string(),
                from: from.to_string(),
                to: FeatureStatus::Failed.to_string(),
            });
        }
        feature.status = FeatureStatus::Failed;
        feature.error_message = Some(message.to_string());
        tracing::warn!(feature_id = id, error = message, "feature failed");

        let blocked = self.block_dependents(id);
        self.save()?;
        Ok(blocked)
    }

    /// Block every Pending feature whose dependencies directly contain `id`.
    /// Only one hop: dependents of dependents are left alone.
    fn block_dependents(&mut self, id: &str) -> Vec<String> {
        let mut blocked = Vec::new();
        for dep_id in &self.order {
            let Some(f) = self.features.get_mut(dep_id) else {
                continue;
            };
            if f.status == FeatureStatus::Pending && f.dependencies.contains(id) {
                f.status = FeatureStatus::Blocked;
                f.error_message = Some(format!("dependency '{id}' failed"));
                tracing::info!(feature_id = %f.id, dependency = id, "feature blocked");
                blocked.push(f.id.clone());
            }
        }
        blocked
    }

    /// Increment and return the integration attempt counter.
    pub fn record_integration_attempt(&mut self, id: &str) -> Result<u32> {
        let feature = self.get_mut(id)?;
        feature.integration_attempts += 1;
        let n = feature.integration_attempts;
        self.save()?;
        Ok(n)
    }

    /// Reset one Failed or Blocked feature. Returns the state it landed in.
    pub fn reset(&mut self, id: &str) -> Result<FeatureStatus> {
        let target = self.get_mut(id)?.reset_target();
        self.transition(id, target)?;
        Ok(target)
    }

    /// Reset every Failed and Blocked feature. Returns the ids reset.
    pub fn reset_failed(&mut self) -> Result<Vec<String>> {
        let ids: Vec<String> = self
            .features()
            .filter(|f| matches!(f.status, FeatureStatus::Failed | FeatureStatus::Blocked))
            .map(|f| f.id.clone())
            .collect();
        for id in &ids {
            let feature = self.get_mut(id)?;
            feature.status = feature.reset_target();
            feature.error_message = None;
        }
        self.save()?;
        Ok(ids)
    }

    /// Return every feature to Pending, discarding generated output and
    /// attempt counters.
    pub fn reset_all(&mut self) -> Result<usize> {
        for feature in self.features.values_mut() {
            feature.status = FeatureStatus::Pending;
            feature.generated_files.clear();
            feature.integration_attempts = 0;
            feature.error_message = None;
        }
        self.save()?;
        Ok(self.features.len())
    }

    /// Features left mid-pipeline by a crashed run go back to the last
    /// state they can safely restart from.
    pub fn recover_interrupted(&mut self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for id in &self.order {
            let Some(f) = self.features.get_mut(id) else {
                continue;
            };
            if f.status.is_transient() {
                let to = f.reset_target();
                tracing::warn!(feature_id = %id, from = %f.status, %to, "recovering interrupted feature");
                f.status = to;
                recovered.push(id.clone());
            }
        }
        if !recovered.is_empty() {
            self.save()?;
        }
        Ok(recovered)
    }

    /// Count of features per status, in lifecycle order, zero counts omitted.
    pub fn counts(&self) -> Vec<(FeatureStatus, usize)> {
        FeatureStatus::ALL
            .iter()
            .map(|s| (*s, self.features.values().filter(|f| f.status == *s).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.features
            .values()
            .any(|f| f.status == FeatureStatus::Failed)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Feature> {
        self.features
            .get_mut(id)
            .ok_or_else(|| StitchError::NotFound(format!("feature '{id}'")))
    }
}

/// Parse a queue document of any known version.
fn parse_document(contents: &str) -> std::result::Result<QueueDocument, String> {
    let value: Value = serde_json::from_str(contents).map_err(|e| e.to_string())?;
    let value = migrate(value)?;
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Bring an older queue document up to `SCHEMA_VERSION`.
///
/// Version 1 documents have no `version` key, store features as an array
/// with snake_case keys and upper-case status names, and carry no attempt
/// counter or save timestamp.
fn migrate(mut value: Value) -> std::result::Result<Value, String> {
    let Some(obj) = value.as_object_mut() else {
        return Err("queue document is not a JSON object".to_string());
    };

    let version = obj.get("version").and_then(Value::as_u64).unwrap_or(1);
    match version {
        1 => {}
        v if v == SCHEMA_VERSION as u64 => return Ok(value),
        v => return Err(format!("unsupported queue schema version {v}")),
    }

    tracing::info!("migrating v1 queue document");

    let records: Vec<Value> = match obj.remove("features") {
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) => map.into_iter().map(|(_, v)| v).collect(),
        Some(_) => return Err("features must be an array or object".to_string()),
        None => Vec::new(),
    };

    let mut features = serde_json::Map::new();
    let mut derived_order = Vec::new();
    for record in records {
        let migrated = migrate_v1_record(record)?;
        let id = migrated
            .get("id")
            .and_then(Value::as_str)
            .ok_or("feature record without id")?
            .to_string();
        derived_order.push(Value::String(id.clone()));
        features.insert(id, migrated);
    }

    let order = match obj.remove("order") {
        Some(Value::Array(ids)) => ids,
        _ => derived_order,
    };

    let saved_at = obj
        .remove("saved_at")
        .or_else(|| obj.remove("savedAt"))
        .unwrap_or_else(|| Value::String(Utc::now().to_rfc3339()));

    Ok(serde_json::json!({
        "version": SCHEMA_VERSION,
        "features": features,
        "order": order,
        "savedAt": saved_at,
    }))
}

fn migrate_v1_record(record: Value) -> std::result::Result<Value, String> {
    let Value::Object(mut map) = record else {
        return Err("feature record is not an object".to_string());
    };

    for (old, new) in [
        ("target_files", "targetFiles"),
        ("generated_files", "generatedFiles"),
        ("error_message", "errorMessage"),
        ("integration_attempts", "integrationAttempts"),
    ] {
        if let Some(v) = map.remove(old) {
            map.insert(new.to_string(), v);
        }
    }

    if let Some(Value::String(status)) = map.get("status") {
        let normalized = match status.to_ascii_lowercase().as_str() {
            "in_progress" | "developing" => "developing",
            "done" | "completed" | "complete" => "complete",
            other => {
                if FeatureStatus::ALL.iter().any(|s| s.as_str() == other) {
                    other
                } else {
                    return Err(format!("unknown feature status '{status}'"));
                }
            }
        }
        .to_string();
        map.insert("status".to_string(), Value::String(normalized));
    } else {
        map.insert("status".to_string(), Value::String("pending".to_string()));
    }

    if !map.contains_key("name") {
        if let Some(id) = map.get("id").cloned() {
            map.insert("name".to_string(), id);
        }
    }

    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue_ab() -> FeatureQueue {
        let mut q = FeatureQueue::in_memory();
        q.add_feature(Feature::new("a", "alpha")).unwrap();
        q.add_feature(Feature::new("b", "beta").with_dependencies(["a"]))
            .unwrap();
        q
    }

    fn drive_to_complete(q: &mut FeatureQueue, id: &str) {
        for s in [
            FeatureStatus::Developing,
            FeatureStatus::Generated,
            FeatureStatus::Integrating,
            FeatureStatus::Checkpoint,
            FeatureStatus::Complete,
        ] {
            q.transition(id, s).unwrap();
        }
    }

    #[test]
    fn test_next_runnable_respects_dependencies() {
        let mut q = queue_ab();
        assert_eq!(q.get_next_runnable().unwrap().id, "a");

        q.transition("a", FeatureStatus::Developing).unwrap();
        // b depends on a, which is not Complete.
        assert!(q.get_next_runnable().is_none());

        q.transition("a", FeatureStatus::Generated).unwrap();
        assert_eq!(q.get_next_runnable().unwrap().id, "a");

        q.transition("a", FeatureStatus::Integrating).unwrap();
        q.transition("a", FeatureStatus::Checkpoint).unwrap();
        q.transition("a", FeatureStatus::Complete).unwrap();
        assert_eq!(q.get_next_runnable().unwrap().id, "b");
    }

    #[test]
    fn test_next_runnable_keeps_declared_order() {
        let mut q = FeatureQueue::in_memory();
        q.add_feature(Feature::new("z", "zulu")).unwrap();
        q.add_feature(Feature::new("a", "alpha")).unwrap();
        assert_eq!(q.get_next_runnable().unwrap().id, "z");
    }

    #[test]
    fn test_fail_blocks_direct_dependents_only() {
        let mut q = queue_ab();
        q.add_feature(Feature::new("c", "gamma").with_dependencies(["b"]))
            .unwrap();

        q.transition("a", FeatureStatus::Developing).unwrap();
        let blocked = q.mark_failed("a", "generator crashed").unwrap();

        assert_eq!(blocked, vec!["b"]);
        assert_eq!(q.get("b").unwrap().status, FeatureStatus::Blocked);
        assert_eq!(q.get("c").unwrap().status, FeatureStatus::Pending);
        assert!(q.get_next_runnable().is_none());
    }

    #[test]
    fn test_only_pending_dependents_are_blocked() {
        let mut q = FeatureQueue::in_memory();
        q.add_feature(Feature::new("a", "alpha")).unwrap();
        q.add_feature(Feature::new("b", "beta")).unwrap();
        q.add_feature(Feature::new("c", "gamma").with_dependencies(["a", "b"]))
            .unwrap();
        drive_to_complete(&mut q, "a");
        q.transition("b", FeatureStatus::Developing).unwrap();
        let blocked = q.mark_failed("b", "x").unwrap();
        assert_eq!(blocked, vec!["c"]);
        // a is Complete and untouched.
        assert_eq!(q.get("a").unwrap().status, FeatureStatus::Complete);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut q = queue_ab();
        let err = q.transition("a", FeatureStatus::Complete).unwrap_err();
        assert!(matches!(err, StitchError::InvalidTransition { .. }));
        assert_eq!(q.get("a").unwrap().status, FeatureStatus::Pending);
    }

    #[test]
    fn test_add_rejects_duplicates_and_unknown_deps() {
        let mut q = queue_ab();
        assert!(q.add_feature(Feature::new("a", "again")).is_err());
        assert!(q
            .add_feature(Feature::new("x", "x").with_dependencies(["nope"]))
            .is_err());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_reset_chooses_generated_when_output_exists() {
        let mut q = queue_ab();
        q.transition("a", FeatureStatus::Developing).unwrap();
        q.set_generated_files("a", vec![PathBuf::from("gen/a.py")])
            .unwrap();
        q.transition("a", FeatureStatus::Generated).unwrap();
        q.transition("a", FeatureStatus::Integrating).unwrap();
        q.mark_failed("a", "write failed").unwrap();

        assert_eq!(q.reset("a").unwrap(), FeatureStatus::Generated);
        let a = q.get("a").unwrap();
        assert!(a.error_message.is_none());

        // b was blocked; resetting it goes to Pending.
        assert_eq!(q.reset("b").unwrap(), FeatureStatus::Pending);
    }

    #[test]
    fn test_reset_rejects_non_terminal() {
        let mut q = queue_ab();
        assert!(q.reset("a").is_err());
    }

    #[test]
    fn test_reset_failed_and_all() {
        let mut q = queue_ab();
        q.transition("a", FeatureStatus::Developing).unwrap();
        q.mark_failed("a", "boom").unwrap();
        let reset = q.reset_failed().unwrap();
        assert_eq!(reset, vec!["a", "b"]);
        assert!(q.features().all(|f| f.status == FeatureStatus::Pending));

        drive_to_complete(&mut q, "a");
        q.record_integration_attempt("a").unwrap();
        assert_eq!(q.reset_all().unwrap(), 2);
        let a = q.get("a").unwrap();
        assert_eq!(a.status, FeatureStatus::Pending);
        assert_eq!(a.integration_attempts, 0);
    }

    #[test]
    fn test_recover_interrupted() {
        let mut q = queue_ab();
        q.transition("a", FeatureStatus::Developing).unwrap();
        let recovered = q.recover_interrupted().unwrap();
        assert_eq!(recovered, vec!["a"]);
        assert_eq!(q.get("a").unwrap().status, FeatureStatus::Pending);
    }

    #[test]
    fn test_persist_round_trip_preserves_order_and_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        {
            let mut q = FeatureQueue::open(&path).unwrap();
            q.add_feature(Feature::new("z", "zulu")).unwrap();
            q.add_feature(Feature::new("a", "alpha").with_dependencies(["z"]))
                .unwrap();
            q.transition("z", FeatureStatus::Developing).unwrap();
            q.mark_failed("z", "boom").unwrap();
        }

        let q = FeatureQueue::open(&path).unwrap();
        let ids: Vec<&str> = q.features().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a"]);
        assert_eq!(q.get("z").unwrap().status, FeatureStatus::Failed);
        assert_eq!(q.get("z").unwrap().error_message.as_deref(), Some("boom"));
        assert_eq!(q.get("a").unwrap().status, FeatureStatus::Blocked);

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], SCHEMA_VERSION);
        assert!(raw.get("savedAt").is_some());
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let q = FeatureQueue::open(&dir.path().join("nope.json")).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_open_corrupt_file_is_corrupt_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FeatureQueue::open(&path).err().unwrap();
        assert!(matches!(err, StitchError::CorruptState { .. }));
    }

    #[test]
    fn test_open_rejects_order_with_unknown_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(
            &path,
            r#"{"version":2,"features":{},"order":["ghost"],"savedAt":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(
            FeatureQueue::open(&path),
            Err(StitchError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_migrates_v1_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(
            &path,
            r#"{
                "features": [
                    {"id": "a", "name": "alpha", "status": "COMPLETE", "target_files": ["src/a.py"]},
                    {"id": "b", "status": "IN_PROGRESS", "dependencies": ["a"], "error_message": null}
                ]
            }"#,
        )
        .unwrap();

        let q = FeatureQueue::open(&path).unwrap();
        let a = q.get("a").unwrap();
        assert_eq!(a.status, FeatureStatus::Complete);
        assert_eq!(a.target_files, vec![PathBuf::from("src/a.py")]);
        let b = q.get("b").unwrap();
        assert_eq!(b.status, FeatureStatus::Developing);
        assert_eq!(b.name, "b");
        assert_eq!(b.integration_attempts, 0);
    }

    #[test]
    fn test_migration_rejects_unknown_status() {
        let err = migrate(serde_json::json!({
            "features": [{"id": "a", "status": "exploded"}]
        }))
        .unwrap_err();
        assert!(err.contains("exploded"));
    }

    #[test]
    fn test_unsupported_version_is_corrupt() {
        assert!(migrate(serde_json::json!({"version": 99})).is_err());
    }

    #[test]
    fn test_import_plan_out_of_order_dependencies() {
        let mut q = FeatureQueue::in_memory();
        let plan: Plan = serde_json::from_str(
            r#"{"features": [
                {"id": "b", "name": "beta", "dependencies": ["a"]},
                {"id": "a", "name": "alpha", "targetFiles": ["src/pkg/alpha.py"]}
            ]}"#,
        )
        .unwrap();
        let report = q.import_plan(plan).unwrap();
        assert_eq!(report.added, vec!["a", "b"]);
        assert_eq!(
            q.get("a").unwrap().target_files,
            vec![PathBuf::from("src/pkg/alpha.py")]
        );
    }

    #[test]
    fn test_import_plan_rejects_unknown_dependency() {
        let mut q = FeatureQueue::in_memory();
        let plan: Plan = serde_json::from_str(
            r#"{"features": [{"id": "b", "name": "beta", "dependencies": ["ghost"]}]}"#,
        )
        .unwrap();
        assert!(q.import_plan(plan).is_err());
        assert!(q.is_empty());
    }

    #[test]
    fn test_import_plan_rejects_cycle() {
        let mut q = FeatureQueue::in_memory();
        let plan: Plan = serde_json::from_str(
            r#"{"features": [
                {"id": "c", "name": "c"},
                {"id": "a", "name": "a", "dependencies": ["b"]},
                {"id": "b", "name": "b", "dependencies": ["a"]}
            ]}"#,
        )
        .unwrap();
        let err = q.import_plan(plan).unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert!(q.is_empty());
        assert!(q.get("c").is_none());
    }

    #[test]
    fn test_import_plan_skips_existing() {
        let mut q = queue_ab();
        let plan: Plan = serde_json::from_str(
            r#"{"features": [{"id": "a", "name": "alpha"}, {"id": "c", "name": "gamma"}]}"#,
        )
        .unwrap();
        let report = q.import_plan(plan).unwrap();
        assert_eq!(report.added, vec!["c"]);
        assert_eq!(report.skipped, vec!["a"]);
    }

    #[test]
    fn test_counts() {
        let mut q = queue_ab();
        q.transition("a", FeatureStatus::Developing).unwrap();
        let counts = q.counts();
        assert_eq!(
            counts,
            vec![(FeatureStatus::Pending, 1), (FeatureStatus::Developing, 1)]
        );
    }
}
