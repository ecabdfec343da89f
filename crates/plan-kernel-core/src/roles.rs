//! Agent role catalogue and boundary checks.
//!
//! Hubs (coordinator, analyst, runner) route work; every other role is a
//! spoke with a fixed set of roles it may hand control to.

use serde::{Deserialize, Serialize};

use crate::plan::{recompute_current_phase, ConfirmationState, Plan, Step, StepStatus, StepType};
use crate::KernelError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Coordinator,
    Analyst,
    Runner,
    Researcher,
    Brainstorm,
    Architect,
    Executor,
    Reviewer,
    Tester,
    Revisionist,
    Archivist,
    Worker,
}

impl AgentType {
    pub const ALL: [Self; 12] = [
        Self::Coordinator,
        Self::Analyst,
        Self::Runner,
        Self::Researcher,
        Self::Brainstorm,
        Self::Architect,
        Self::Executor,
        Self::Reviewer,
        Self::Tester,
        Self::Revisionist,
        Self::Archivist,
        Self::Worker,
    ];

    pub const HUBS: [Self; 3] = [Self::Coordinator, Self::Analyst, Self::Runner];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Analyst => "analyst",
            Self::Runner => "runner",
            Self::Researcher => "researcher",
            Self::Brainstorm => "brainstorm",
            Self::Architect => "architect",
            Self::Executor => "executor",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
            Self::Revisionist => "revisionist",
            Self::Archivist => "archivist",
            Self::Worker => "worker",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let wanted = value.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|agent| agent.as_str() == wanted)
    }

    /// Parses a role name, reporting unknown names as validation errors.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for unrecognized role names.
    pub fn parse_required(value: &str) -> Result<Self, KernelError> {
        Self::parse(value)
            .ok_or_else(|| KernelError::Validation(format!("unknown agent type: {value}")))
    }

    #[must_use]
    pub fn is_hub(self) -> bool {
        self.capabilities().is_hub
    }

    #[must_use]
    pub fn capabilities(self) -> &'static AgentCapabilities {
        match self {
            Self::Coordinator => &COORDINATOR,
            Self::Analyst => &ANALYST,
            Self::Runner => &RUNNER,
            Self::Researcher => &RESEARCHER,
            Self::Brainstorm => &BRAINSTORM,
            Self::Architect => &ARCHITECT,
            Self::Executor => &EXECUTOR,
            Self::Reviewer => &REVIEWER,
            Self::Tester => &TESTER,
            Self::Revisionist => &REVISIONIST,
            Self::Archivist => &ARCHIVIST,
            Self::Worker => &WORKER,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentCapabilities {
    pub is_hub: bool,
    pub can_spawn_subagents: bool,
    pub can_implement: bool,
    pub can_finalize: bool,
    /// Work must stay inside the session's declared file scope.
    pub scope_limited: bool,
    pub primary_responsibility: &'static str,
    pub must_handoff_to: &'static [AgentType],
    pub forbidden_actions: &'static [&'static str],
    pub primary_step_types: &'static [StepType],
}

use AgentType as A;
use StepType as S;

static COORDINATOR: AgentCapabilities = AgentCapabilities {
    is_hub: true,
    can_spawn_subagents: true,
    can_implement: false,
    can_finalize: false,
    scope_limited: false,
    primary_responsibility: "orchestrate plans and route work to specialist roles",
    must_handoff_to: &AgentType::ALL,
    forbidden_actions: &["edit source files", "run builds directly"],
    primary_step_types: &[S::Planning, S::Confirmation],
};

static ANALYST: AgentCapabilities = AgentCapabilities {
    is_hub: true,
    can_spawn_subagents: true,
    can_implement: false,
    can_finalize: false,
    scope_limited: false,
    primary_responsibility: "run iterative investigations and dispatch analysis work",
    must_handoff_to: &[
        A::Executor,
        A::Researcher,
        A::Brainstorm,
        A::Architect,
        A::Tester,
        A::Reviewer,
        A::Worker,
    ],
    forbidden_actions: &["edit source files"],
    primary_step_types: &[S::Analysis],
};

static RUNNER: AgentCapabilities = AgentCapabilities {
    is_hub: true,
    can_spawn_subagents: true,
    can_implement: true,
    can_finalize: true,
    scope_limited: false,
    primary_responsibility: "carry small tasks end to end without a full plan",
    must_handoff_to: &AgentType::ALL,
    forbidden_actions: &[],
    primary_step_types: &[S::Standard],
};

static RESEARCHER: AgentCapabilities = AgentCapabilities {
    is_hub: false,
    can_spawn_subagents: false,
    can_implement: false,
    can_finalize: false,
    scope_limited: false,
    primary_responsibility: "gather facts and prior art",
    must_handoff_to: &[A::Coordinator, A::Analyst, A::Architect],
    forbidden_actions: &["edit source files", "spawn agents"],
    primary_step_types: &[S::Research],
};

static BRAINSTORM: AgentCapabilities = AgentCapabilities {
    is_hub: false,
    can_spawn_subagents: false,
    can_implement: false,
    can_finalize: false,
    scope_limited: false,
    primary_responsibility: "explore solution options",
    must_handoff_to: &[A::Coordinator, A::Architect],
    forbidden_actions: &["edit source files", "spawn agents"],
    primary_step_types: &[S::Planning],
};

static ARCHITECT: AgentCapabilities = AgentCapabilities {
    is_hub: false,
    can_spawn_subagents: false,
    can_implement: false,
    can_finalize: false,
    scope_limited: false,
    primary_responsibility: "produce the design and the step plan",
    must_handoff_to: &[A::Coordinator, A::Executor],
    forbidden_actions: &["edit source files", "spawn agents"],
    primary_step_types: &[S::Planning],
};

static EXECUTOR: AgentCapabilities = AgentCapabilities {
    is_hub: false,
    can_spawn_subagents: false,
    can_implement: true,
    can_finalize: false,
    scope_limited: true,
    primary_responsibility: "implement planned code changes",
    must_handoff_to: &[A::Coordinator, A::Reviewer, A::Tester, A::Revisionist],
    forbidden_actions: &["spawn agents", "archive plans"],
    primary_step_types: &[S::Code, S::Build, S::Fix, S::Refactor],
};

static REVIEWER: AgentCapabilities = AgentCapabilities {
    is_hub: false,
    can_spawn_subagents: false,
    can_implement: false,
    can_finalize: false,
    scope_limited: false,
    primary_responsibility: "review changes and run build verification",
    must_handoff_to: &[A::Coordinator, A::Tester, A::Revisionist, A::Archivist],
    forbidden_actions: &["edit source files", "spawn agents"],
    primary_step_types: &[S::Validation, S::Build],
};

static TESTER: AgentCapabilities = AgentCapabilities {
    is_hub: false,
    can_spawn_subagents: false,
    can_implement: false,
    can_finalize: false,
    scope_limited: true,
    primary_responsibility: "write and run tests",
    must_handoff_to: &[A::Coordinator, A::Revisionist, A::Archivist],
    forbidden_actions: &["edit non-test source files", "spawn agents"],
    primary_step_types: &[S::Test],
};

static REVISIONIST: AgentCapabilities = AgentCapabilities {
    is_hub: false,
    can_spawn_subagents: false,
    can_implement: false,
    can_finalize: false,
    scope_limited: false,
    primary_responsibility: "revise the plan after failures",
    must_handoff_to: &[A::Coordinator, A::Executor, A::Reviewer],
    forbidden_actions: &["edit source files", "spawn agents"],
    primary_step_types: &[S::Planning, S::Fix],
};

static ARCHIVIST: AgentCapabilities = AgentCapabilities {
    is_hub: false,
    can_spawn_subagents: false,
    can_implement: false,
    can_finalize: true,
    scope_limited: false,
    primary_responsibility: "document results and archive the plan",
    must_handoff_to: &[A::Coordinator],
    forbidden_actions: &["edit source files", "spawn agents"],
    primary_step_types: &[S::Documentation],
};

static WORKER: AgentCapabilities = AgentCapabilities {
    is_hub: false,
    can_spawn_subagents: false,
    can_implement: true,
    can_finalize: false,
    scope_limited: true,
    primary_responsibility: "complete one scoped task under a hub",
    must_handoff_to: &AgentType::HUBS,
    forbidden_actions: &["spawn agents", "modify the plan", "exceed declared scope"],
    primary_step_types: &[],
};

/// Which role owns a step of the given type when no explicit assignee is set.
#[must_use]
pub fn owner_for_step_type(step_type: StepType) -> AgentType {
    match step_type {
        S::Research => A::Researcher,
        S::Analysis => A::Analyst,
        S::Planning => A::Architect,
        S::Code | S::Build | S::Fix | S::Refactor | S::Deploy | S::Migration | S::Critical => {
            A::Executor
        }
        S::Test => A::Tester,
        S::Validation => A::Reviewer,
        S::Documentation => A::Archivist,
        S::Standard | S::Confirmation => A::Coordinator,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RoleAction {
    Continue,
    Handoff,
    Block,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoleValidation {
    pub agent_type: AgentType,
    pub action: RoleAction,
    pub recommended_agent: Option<AgentType>,
    pub warnings: Vec<String>,
}

/// Inputs for a role check beyond the plan snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RoleContext<'a> {
    pub plan: &'a Plan,
    /// Number of registered build scripts for the plan's workspace.
    pub build_script_count: usize,
    pub confirmations: &'a [ConfirmationState],
}

fn handles(agent: AgentType, step_type: StepType) -> bool {
    let capabilities = agent.capabilities();
    agent == AgentType::Worker
        || capabilities.primary_step_types.contains(&step_type)
        || owner_for_step_type(step_type) == agent
        || (step_type == StepType::Standard && capabilities.can_implement)
}

/// Most frequent step type, ties broken by first appearance.
fn dominant_step_type(steps: &[&Step]) -> Option<StepType> {
    let mut counts: Vec<(StepType, usize)> = Vec::new();
    for step in steps {
        match counts.iter_mut().find(|(kind, _)| *kind == step.step_type) {
            Some((_, count)) => *count += 1,
            None => counts.push((step.step_type, 1)),
        }
    }
    let best = counts.iter().map(|(_, count)| *count).max()?;
    counts
        .into_iter()
        .find(|(_, count)| *count == best)
        .map(|(kind, _)| kind)
}

fn successor_for(agent: AgentType, wanted: AgentType) -> AgentType {
    if wanted.is_hub() || agent.capabilities().must_handoff_to.contains(&wanted) {
        wanted
    } else {
        AgentType::Coordinator
    }
}

/// Decides whether `agent` should keep working on the plan, hand off or stop.
#[must_use]
pub fn validate_agent(agent: AgentType, context: &RoleContext<'_>) -> RoleValidation {
    let plan = context.plan;
    let outcome = |action, recommended_agent, warnings| RoleValidation {
        agent_type: agent,
        action,
        recommended_agent,
        warnings,
    };

    if plan.is_archived() {
        let warning = vec![format!("plan {} is archived", plan.id)];
        return if agent == AgentType::Coordinator {
            outcome(RoleAction::Continue, None, warning)
        } else {
            outcome(RoleAction::Block, Some(AgentType::Coordinator), warning)
        };
    }

    let mut warnings = Vec::new();
    let any_open = plan.steps.iter().any(|step| step.status.is_open());

    if agent.is_hub() {
        if !any_open && !plan.steps.is_empty() {
            warnings.push("all steps are done; consider archiving the plan".to_string());
        }
        return outcome(RoleAction::Continue, None, warnings);
    }

    let current_phase = plan
        .current_phase
        .clone()
        .or_else(|| recompute_current_phase(&plan.steps));
    let open_in_phase: Vec<&Step> = plan
        .steps
        .iter()
        .filter(|step| step.status.is_open() && Some(&step.phase) == current_phase.as_ref())
        .collect();

    match agent {
        AgentType::Reviewer => {
            let has_build_steps = plan
                .steps
                .iter()
                .any(|step| step.step_type == StepType::Build);
            if has_build_steps && context.build_script_count == 0 {
                warnings.push(
                    "plan has build steps but no build scripts are registered".to_string(),
                );
            }
        }
        AgentType::Tester => {
            if !plan.steps.iter().any(|step| step.step_type == StepType::Test) {
                warnings.push("plan has no test steps".to_string());
            }
        }
        AgentType::Executor => {
            for step in open_in_phase.iter().filter(|step| {
                step.step_type.is_high_risk()
                    && !context.confirmations.iter().any(|item| item.covers(step))
            }) {
                warnings.push(format!(
                    "step {} ({}) is high-risk and not yet confirmed",
                    step.index, step.task
                ));
            }
        }
        AgentType::Archivist => {
            if any_open {
                let remaining = plan.steps.iter().filter(|step| step.status.is_open()).count();
                warnings.push(format!("{remaining} steps are still open"));
                return outcome(RoleAction::Block, Some(AgentType::Coordinator), warnings);
            }
            return outcome(RoleAction::Continue, None, warnings);
        }
        _ => {}
    }

    if !any_open {
        let next = successor_for(agent, AgentType::Archivist);
        return outcome(RoleAction::Handoff, Some(next), warnings);
    }

    if !open_in_phase.is_empty()
        && open_in_phase
            .iter()
            .all(|step| step.status == StepStatus::Blocked)
    {
        warnings.push(format!(
            "all {} open steps in the current phase are blocked",
            open_in_phase.len()
        ));
        return outcome(RoleAction::Block, Some(AgentType::Coordinator), warnings);
    }

    if open_in_phase
        .iter()
        .any(|step| handles(agent, step.step_type))
    {
        return outcome(RoleAction::Continue, None, warnings);
    }

    let recommended = dominant_step_type(&open_in_phase)
        .map_or(AgentType::Coordinator, |kind| {
            successor_for(agent, owner_for_step_type(kind))
        });
    outcome(RoleAction::Handoff, Some(recommended), warnings)
}

/// Checks a proposed transfer of control. Hubs are valid successors for
/// every role.
///
/// # Errors
/// Returns [`KernelError::BoundaryViolation`] when `from` may not hand work
/// to `to`.
pub fn validate_handoff(from: AgentType, to: AgentType) -> Result<(), KernelError> {
    if to.is_hub() || from.capabilities().must_handoff_to.contains(&to) {
        return Ok(());
    }
    Err(KernelError::BoundaryViolation(format!(
        "{from} cannot hand off to {to}; allowed successors: {}",
        from.capabilities()
            .must_handoff_to
            .iter()
            .map(|agent| agent.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}
