//! Execution context passed by value through planning and execution

use crate::core::plan::StepOutcomeGroup;
use serde::{Deserialize, Serialize};

/// Account / organization / project a pipeline runs in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub account_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl Scope {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            org_id: None,
            project_id: None,
        }
    }

    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new("default").with_org("default").with_project("default")
    }
}

/// Where a sweeping output can be seen from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    Step,
    Stage,
    Pipeline,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Step => "STEP",
            Visibility::Stage => "STAGE",
            Visibility::Pipeline => "PIPELINE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STEP" => Some(Visibility::Step),
            "STAGE" => Some(Visibility::Stage),
            "PIPELINE" => Some(Visibility::Pipeline),
            _ => None,
        }
    }
}

/// One frame of the execution stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    /// Plan node id
    pub setup_id: String,
    /// Id of this particular run of the node
    pub runtime_id: String,
    pub identifier: String,
    pub group: Option<StepOutcomeGroup>,
}

impl Level {
    pub fn new(setup_id: impl Into<String>, identifier: impl Into<String>, group: Option<StepOutcomeGroup>) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: uuid::Uuid::new_v4().to_string(),
            identifier: identifier.into(),
            group,
        }
    }
}

/// Immutable execution context for one node run.
///
/// Entering a child node produces a new `Ambiance` with one more level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ambiance {
    pub plan_execution_id: String,
    pub scope: Scope,
    #[serde(default)]
    pub levels: Vec<Level>,
}

impl Ambiance {
    pub fn new(plan_execution_id: impl Into<String>, scope: Scope) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            scope,
            levels: Vec::new(),
        }
    }

    pub fn with_level(&self, level: Level) -> Self {
        let mut next = self.clone();
        next.levels.push(level);
        next
    }

    pub fn account_id(&self) -> &str {
        &self.scope.account_id
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    fn stage_level_index(&self) -> Option<usize> {
        self.levels
            .iter()
            .rposition(|l| l.group == Some(StepOutcomeGroup::Stage))
    }

    pub fn stage_runtime_id(&self) -> Option<&str> {
        self.stage_level_index().map(|i| self.levels[i].runtime_id.as_str())
    }

    fn key_for_levels(&self, count: usize) -> String {
        let mut key = self.plan_execution_id.clone();
        for level in &self.levels[..count] {
            key.push('/');
            key.push_str(&level.runtime_id);
        }
        key
    }

    /// Storage scope for an output written from this node with `visibility`
    pub fn scope_key(&self, visibility: Visibility) -> String {
        match visibility {
            Visibility::Pipeline => self.key_for_levels(0),
            Visibility::Stage => match self.stage_level_index() {
                Some(index) => self.key_for_levels(index + 1),
                None => self.key_for_levels(0),
            },
            Visibility::Step => self.key_for_levels(self.levels.len()),
        }
    }

    /// Scopes visible from this node, innermost first
    pub fn lookup_scopes(&self) -> Vec<String> {
        (0..=self.levels.len())
            .rev()
            .map(|count| self.key_for_levels(count))
            .collect()
    }
}
