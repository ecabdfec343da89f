//! Workflow routing by plan category.
//!
//! Resolution order: caller-supplied routing, then a stored definition, then
//! the built-in table. Anything else resolves to [`ResolutionSource::None`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::roles::AgentType;
use crate::KernelError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanningDepth {
    None,
    Light,
    Standard,
    Deep,
}

impl PlanningDepth {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Light => "light",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "light" => Some(Self::Light),
            "standard" => Some(Self::Standard),
            "deep" => Some(Self::Deep),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub planning_depth: PlanningDepth,
    pub workflow_path: Vec<AgentType>,
    #[serde(default)]
    pub skip_agents: Vec<AgentType>,
    #[serde(default)]
    pub requires_research: bool,
    #[serde(default)]
    pub requires_brainstorm: bool,
}

impl WorkflowConfig {
    /// # Errors
    /// Returns [`KernelError::Validation`] for an empty path or a skip list
    /// that overlaps the path.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.workflow_path.is_empty() {
            return Err(KernelError::Validation(
                "workflow_path MUST contain at least one agent".to_string(),
            ));
        }
        let path: BTreeSet<AgentType> = self.workflow_path.iter().copied().collect();
        if let Some(overlap) = self.skip_agents.iter().find(|agent| path.contains(agent)) {
            return Err(KernelError::Validation(format!(
                "{overlap} cannot be both on the workflow path and skipped"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub category: String,
    pub config: WorkflowConfig,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    CategorizationResult,
    DbDefinition,
    StaticFallback,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowResolution {
    pub category: Option<String>,
    pub source: ResolutionSource,
    pub config: Option<WorkflowConfig>,
}

/// Trims, lower-cases and folds `-` and spaces to `_`. Blank input yields
/// `None`.
#[must_use]
pub fn normalize_category(value: &str) -> Option<String> {
    let normalized: String = value
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| if ch == '-' || ch == ' ' { '_' } else { ch })
        .collect();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

pub const STATIC_CATEGORIES: [&str; 8] = [
    "feature",
    "bugfix",
    "refactor",
    "investigation",
    "documentation",
    "quick_task",
    "orchestration",
    "advisory",
];

/// Built-in routing for the known categories.
#[must_use]
pub fn static_workflow(category: &str) -> Option<WorkflowConfig> {
    use AgentType as A;
    use PlanningDepth as D;

    let (planning_depth, workflow_path, skip_agents, requires_research, requires_brainstorm): (
        PlanningDepth,
        &[AgentType],
        &[AgentType],
        bool,
        bool,
    ) = match category {
        "feature" => (
            D::Deep,
            &[A::Researcher, A::Architect, A::Executor, A::Reviewer, A::Tester, A::Archivist],
            &[],
            true,
            false,
        ),
        "bugfix" => (
            D::Light,
            &[A::Researcher, A::Executor, A::Reviewer, A::Tester],
            &[A::Architect, A::Brainstorm],
            true,
            false,
        ),
        "refactor" => (
            D::Standard,
            &[A::Architect, A::Executor, A::Reviewer, A::Tester],
            &[A::Brainstorm],
            false,
            false,
        ),
        "investigation" => (
            D::Light,
            &[A::Analyst, A::Researcher, A::Archivist],
            &[A::Executor, A::Tester],
            true,
            false,
        ),
        "documentation" => (
            D::Light,
            &[A::Researcher, A::Archivist, A::Reviewer],
            &[A::Executor, A::Tester],
            true,
            false,
        ),
        "quick_task" => (
            D::None,
            &[A::Runner],
            &[A::Researcher, A::Brainstorm, A::Architect],
            false,
            false,
        ),
        "orchestration" => (
            D::Deep,
            &[A::Coordinator, A::Brainstorm, A::Architect, A::Executor, A::Reviewer, A::Tester],
            &[],
            true,
            true,
        ),
        "advisory" => (
            D::None,
            &[A::Brainstorm, A::Coordinator],
            &[A::Executor, A::Tester, A::Reviewer],
            false,
            true,
        ),
        _ => return None,
    };

    Some(WorkflowConfig {
        planning_depth,
        workflow_path: workflow_path.to_vec(),
        skip_agents: skip_agents.to_vec(),
        requires_research,
        requires_brainstorm,
    })
}

/// Resolves routing for `category`.
///
/// `explicit` wins verbatim. Otherwise `lookup` is asked for a stored
/// definition of the normalized category, then the static table.
///
/// # Errors
/// Propagates errors from `lookup`.
pub fn resolve_category_workflow<E>(
    category: Option<&str>,
    explicit: Option<WorkflowConfig>,
    lookup: impl FnOnce(&str) -> Result<Option<WorkflowConfig>, E>,
) -> Result<WorkflowResolution, E> {
    let category = category.and_then(normalize_category);

    if let Some(config) = explicit {
        return Ok(WorkflowResolution {
            category,
            source: ResolutionSource::CategorizationResult,
            config: Some(config),
        });
    }

    let Some(name) = category else {
        return Ok(WorkflowResolution {
            category: None,
            source: ResolutionSource::None,
            config: None,
        });
    };

    if let Some(config) = lookup(&name)? {
        return Ok(WorkflowResolution {
            category: Some(name),
            source: ResolutionSource::DbDefinition,
            config: Some(config),
        });
    }

    match static_workflow(&name) {
        Some(config) => Ok(WorkflowResolution {
            category: Some(name),
            source: ResolutionSource::StaticFallback,
            config: Some(config),
        }),
        None => Ok(WorkflowResolution {
            category: Some(name),
            source: ResolutionSource::None,
            config: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err:?}"),
        }
    }

    fn no_definitions(_: &str) -> Result<Option<WorkflowConfig>, Infallible> {
        Ok(None)
    }

    fn custom() -> WorkflowConfig {
        WorkflowConfig {
            planning_depth: PlanningDepth::Light,
            workflow_path: vec![AgentType::Executor],
            skip_agents: vec![AgentType::Tester],
            requires_research: false,
            requires_brainstorm: false,
        }
    }

    #[test]
    fn every_static_category_is_valid() {
        for category in STATIC_CATEGORIES {
            let config = static_workflow(category);
            assert!(config.is_some(), "{category}");
            if let Some(config) = config {
                must(config.validate());
            }
        }
    }

    #[test]
    fn explicit_routing_wins_verbatim() {
        let resolution = must(resolve_category_workflow(
            Some("Feature"),
            Some(custom()),
            |_| -> Result<Option<WorkflowConfig>, Infallible> {
                panic!("stored definitions must not be consulted")
            },
        ));
        assert_eq!(resolution.source, ResolutionSource::CategorizationResult);
        assert_eq!(resolution.config, Some(custom()));
        assert_eq!(resolution.category.as_deref(), Some("feature"));
    }

    #[test]
    fn stored_definition_beats_static_table() {
        let resolution = must(resolve_category_workflow(Some("bugfix"), None, |name| {
            assert_eq!(name, "bugfix");
            Ok::<_, Infallible>(Some(custom()))
        }));
        assert_eq!(resolution.source, ResolutionSource::DbDefinition);
        assert_eq!(resolution.config, Some(custom()));
    }

    #[test]
    fn static_fallback_and_none() {
        let fallback = must(resolve_category_workflow(Some(" Quick-Task "), None, no_definitions));
        assert_eq!(fallback.source, ResolutionSource::StaticFallback);
        assert_eq!(fallback.category.as_deref(), Some("quick_task"));

        let unknown = must(resolve_category_workflow(Some("gardening"), None, no_definitions));
        assert_eq!(unknown.source, ResolutionSource::None);
        assert!(unknown.config.is_none());

        let missing = must(resolve_category_workflow(Some("   "), None, no_definitions));
        assert_eq!(missing.source, ResolutionSource::None);
        assert!(missing.category.is_none());
    }

    #[test]
    fn skip_list_must_not_overlap_path() {
        let mut config = custom();
        config.skip_agents.push(AgentType::Executor);
        assert!(config.validate().is_err());
        config.workflow_path.clear();
        assert!(config.validate().is_err());
    }
}
