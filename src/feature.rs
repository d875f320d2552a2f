//! Feature records and the lifecycle state machine they move through.
//!
//! A feature is created Pending, driven forward by the orchestrator, and
//! only ever leaves a terminal state through an explicit reset.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Lifecycle state of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    Developing,
    Generated,
    Integrating,
    Checkpoint,
    Complete,
    Failed,
    Blocked,
}

impl FeatureStatus {
    pub const ALL: [FeatureStatus; 8] = [
        FeatureStatus::Pending,
        FeatureStatus::Developing,
        FeatureStatus::Generated,
        FeatureStatus::Integrating,
        FeatureStatus::Checkpoint,
        FeatureStatus::Complete,
        FeatureStatus::Failed,
        FeatureStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureStatus::Pending => "pending",
            FeatureStatus::Developing => "developing",
            FeatureStatus::Generated => "generated",
            FeatureStatus::Integrating => "integrating",
            FeatureStatus::Checkpoint => "checkpoint",
            FeatureStatus::Complete => "complete",
            FeatureStatus::Failed => "failed",
            FeatureStatus::Blocked => "blocked",
        }
    }

    /// Terminal for the current run. Failed and Blocked can still be reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FeatureStatus::Complete | FeatureStatus::Failed | FeatureStatus::Blocked
        )
    }

    /// States a crashed run can leave behind mid-feature.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FeatureStatus::Developing | FeatureStatus::Integrating | FeatureStatus::Checkpoint
        )
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, to: FeatureStatus) -> bool {
        use FeatureStatus::*;
        matches!(
            (self, to),
            (Pending, Developing)
                | (Developing, Generated)
                | (Developing, Failed)
                | (Generated, Integrating)
                | (Integrating, Checkpoint)
                | (Integrating, Failed)
                | (Checkpoint, Complete)
                | (Checkpoint, Failed)
                | (Pending, Blocked)
                | (Failed, Pending)
                | (Failed, Generated)
                | (Blocked, Pending)
                | (Blocked, Generated)
        )
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of generated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub target_files: Vec<PathBuf>,
    #[serde(default)]
    pub generated_files: Vec<PathBuf>,
    pub status: FeatureStatus,
    #[serde(default)]
    pub integration_attempts: u32,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Feature {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            dependencies: BTreeSet::new(),
            target_files: Vec::new(),
            generated_files: Vec::new(),
            status: FeatureStatus::Pending,
            integration_attempts: 0,
            error_message: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.target_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Where a reset should send this feature: straight back to integration
    /// when generated output already exists, otherwise to regeneration.
    pub fn reset_target(&self) -> FeatureStatus {
        if self.generated_files.is_empty() {
            FeatureStatus::Pending
        } else {
            FeatureStatus::Generated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_edges() {
        use FeatureStatus::*;
        assert!(Pending.can_transition_to(Developing));
        assert!(Developing.can_transition_to(Generated));
        assert!(Generated.can_transition_to(Integrating));
        assert!(Integrating.can_transition_to(Checkpoint));
        assert!(Checkpoint.can_transition_to(Complete));
    }

    #[test]
    fn test_illegal_edges() {
        use FeatureStatus::*;
        assert!(!Pending.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Pending));
        assert!(!Generated.can_transition_to(Blocked));
        assert!(!Developing.can_transition_to(Blocked));
        assert!(!Checkpoint.can_transition_to(Integrating));
    }

    #[test]
    fn test_reset_edges() {
        use FeatureStatus::*;
        for from in [Failed, Blocked] {
            assert!(from.can_transition_to(Pending));
            assert!(from.can_transition_to(Generated));
        }
    }

    #[test]
    fn test_reset_target_depends_on_generated_files() {
        let mut f = Feature::new("a", "alpha");
        assert_eq!(f.reset_target(), FeatureStatus::Pending);
        f.generated_files.push(PathBuf::from(".stitch/generated/a/alpha.py"));
        assert_eq!(f.reset_target(), FeatureStatus::Generated);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&FeatureStatus::Checkpoint).unwrap();
        assert_eq!(json, "\"checkpoint\"");
    }

    #[test]
    fn test_feature_serializes_camel_case() {
        let f = Feature::new("a", "alpha").with_dependencies(["b"]);
        let v = serde_json::to_value(&f).unwrap();
        assert!(v.get("integrationAttempts").is_some());
        assert!(v.get("targetFiles").is_some());
        assert_eq!(v["dependencies"][0], "b");
    }
}
