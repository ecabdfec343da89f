//! Plan snapshots and the pure step state machine.
//!
//! Every mutating helper here works on a `Vec<Step>` owned by the caller and
//! leaves indices as a contiguous 0-based permutation on success. On error
//! the vector is left untouched.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::roles::AgentType;
use crate::{KernelError, PlanId, ProgramId, StepId, WorkspaceId};

pub const CURRENT_PLAN_SCHEMA_VERSION: u32 = 2;

const HIGH_RISK_KEYWORDS: [&str; 10] = [
    "delete",
    "drop table",
    "production",
    "deploy",
    "migrate",
    "rm -rf",
    "force push",
    "irreversible",
    "credential",
    "secret",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Done,
    Blocked,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "done" => Some(Self::Done),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Done)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Standard,
    Analysis,
    Research,
    Planning,
    Code,
    Build,
    Fix,
    Refactor,
    Test,
    Validation,
    Documentation,
    Confirmation,
    Critical,
    Deploy,
    Migration,
}

impl StepType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Analysis => "analysis",
            Self::Research => "research",
            Self::Planning => "planning",
            Self::Code => "code",
            Self::Build => "build",
            Self::Fix => "fix",
            Self::Refactor => "refactor",
            Self::Test => "test",
            Self::Validation => "validation",
            Self::Documentation => "documentation",
            Self::Confirmation => "confirmation",
            Self::Critical => "critical",
            Self::Deploy => "deploy",
            Self::Migration => "migration",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(Self::Standard),
            "analysis" => Some(Self::Analysis),
            "research" => Some(Self::Research),
            "planning" => Some(Self::Planning),
            "code" => Some(Self::Code),
            "build" => Some(Self::Build),
            "fix" => Some(Self::Fix),
            "refactor" => Some(Self::Refactor),
            "test" => Some(Self::Test),
            "validation" => Some(Self::Validation),
            "documentation" => Some(Self::Documentation),
            "confirmation" => Some(Self::Confirmation),
            "critical" => Some(Self::Critical),
            "deploy" => Some(Self::Deploy),
            "migration" => Some(Self::Migration),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_high_risk(self) -> bool {
        matches!(
            self,
            Self::Critical | Self::Deploy | Self::Migration | Self::Confirmation
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

impl PlanStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub id: StepId,
    pub index: usize,
    pub phase: String,
    pub task: String,
    pub status: StepStatus,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub notes: Option<String>,
    pub assignee: Option<String>,
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase {
    pub position: usize,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub id: PlanId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    pub description: String,
    pub status: PlanStatus,
    pub category: Option<String>,
    pub priority: Priority,
    /// `None` marks a legacy plan whose phases are implied by step strings.
    pub schema_version: Option<u32>,
    pub current_phase: Option<String>,
    pub current_agent: Option<AgentType>,
    pub program_id: Option<ProgramId>,
    pub steps: Vec<Step>,
    pub phases: Vec<Phase>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Plan {
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.schema_version.is_none()
    }

    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.status == PlanStatus::Archived
    }

    #[must_use]
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Phase names in plan order: explicit records first, then any phase only
    /// mentioned by a step.
    #[must_use]
    pub fn phase_order(&self) -> Vec<String> {
        merge_phases(&self.phases, &self.steps)
            .into_iter()
            .map(|phase| phase.name)
            .collect()
    }

    #[must_use]
    pub fn steps_in_phase(&self, phase: &str) -> Vec<&Step> {
        self.steps.iter().filter(|step| step.phase == phase).collect()
    }

    /// Rejects mutation of archived plans.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the plan is archived.
    pub fn ensure_mutable(&self) -> Result<(), KernelError> {
        if self.is_archived() {
            return Err(KernelError::Validation(format!(
                "plan {} is archived and cannot be modified",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSummary {
    pub id: PlanId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    pub status: PlanStatus,
    pub category: Option<String>,
    pub priority: Priority,
    pub current_phase: Option<String>,
    pub current_agent: Option<AgentType>,
    pub program_id: Option<ProgramId>,
    pub step_count: usize,
    pub done_count: usize,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewStep {
    pub phase: String,
    pub task: String,
    #[serde(default, rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
}

impl NewStep {
    #[must_use]
    pub fn new(phase: &str, task: &str, step_type: StepType) -> Self {
        Self {
            phase: phase.to_string(),
            task: task.to_string(),
            step_type,
            notes: None,
            assignee: None,
        }
    }

    /// Validates required fields.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when phase or task is blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.phase.trim().is_empty() {
            return Err(KernelError::Validation(
                "step phase MUST be provided".to_string(),
            ));
        }
        if self.task.trim().is_empty() {
            return Err(KernelError::Validation(
                "step task MUST be provided".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn into_step(self, index: usize) -> Step {
        Step {
            id: StepId::generate(),
            index,
            phase: self.phase.trim().to_string(),
            task: self.task.trim().to_string(),
            status: StepStatus::Pending,
            step_type: self.step_type,
            notes: self.notes,
            assignee: self.assignee,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPlan {
    pub workspace_id: WorkspaceId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub steps: Vec<NewStep>,
    /// Explicit phase order; phases only named by steps are appended.
    #[serde(default)]
    pub phases: Vec<String>,
    #[serde(default)]
    pub created_by: Option<AgentType>,
}

impl NewPlan {
    /// Validates the plan header and every initial step.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for blank titles, blank step fields
    /// or duplicate phase names.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.title.trim().is_empty() {
            return Err(KernelError::Validation(
                "plan title MUST be provided".to_string(),
            ));
        }
        for step in &self.steps {
            step.validate()?;
        }
        let mut seen = BTreeSet::new();
        for phase in &self.phases {
            if phase.trim().is_empty() {
                return Err(KernelError::Validation(
                    "phase names MUST NOT be blank".to_string(),
                ));
            }
            if !seen.insert(phase.trim()) {
                return Err(KernelError::Validation(format!(
                    "duplicate phase name: {phase}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepUpdate {
    pub index: usize,
    #[serde(default)]
    pub status: Option<StepStatus>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmationState {
    pub plan_id: PlanId,
    pub phase: String,
    /// `None` confirms the whole phase.
    pub step_id: Option<StepId>,
    pub confirmed_by: String,
    pub confirmed_at: OffsetDateTime,
}

impl ConfirmationState {
    #[must_use]
    pub fn covers(&self, step: &Step) -> bool {
        match &self.step_id {
            Some(step_id) => step_id == &step.id,
            None => self.phase == step.phase,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderValidationWarning {
    pub step_index: usize,
    pub phase: String,
    pub pending_step_index: usize,
    pub pending_phase: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidationRecord {
    pub merged_step_id: StepId,
    pub merged_index: usize,
    pub original_indices: Vec<usize>,
    pub original_tasks: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NoteType {
    Info,
    Warning,
    Instruction,
    ProgramUpgradeSuggested,
}

impl NoteType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Instruction => "instruction",
            Self::ProgramUpgradeSuggested => "program_upgrade_suggested",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "instruction" => Some(Self::Instruction),
            "program_upgrade_suggested" => Some(Self::ProgramUpgradeSuggested),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanNote {
    pub id: i64,
    pub plan_id: PlanId,
    pub note_type: NoteType,
    pub message: String,
    pub created_at: OffsetDateTime,
    pub consumed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryKind {
    ProgramUpgrade,
    LegacyShapeUpgrade,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Advisory {
    pub kind: AdvisoryKind,
    pub message: String,
}

/// True when completing `step` needs a prior [`ConfirmationState`].
#[must_use]
pub fn requires_step_confirmation(step: &Step) -> bool {
    if step.step_type.is_high_risk() {
        return true;
    }
    let task = step.task.to_lowercase();
    HIGH_RISK_KEYWORDS
        .iter()
        .any(|keyword| task.contains(keyword))
}

#[must_use]
pub fn is_confirmed(step: &Step, confirmations: &[ConfirmationState]) -> bool {
    confirmations.iter().any(|item| item.covers(step))
}

/// Applies one status/notes update in place.
///
/// # Errors
/// Returns [`KernelError::Validation`] for an unknown index and
/// [`KernelError::ConfirmationRequired`] when a high-risk step would reach
/// `done` without a matching confirmation.
pub fn apply_step_update(
    steps: &mut [Step],
    update: &StepUpdate,
    confirmations: &[ConfirmationState],
    now: OffsetDateTime,
) -> Result<(), KernelError> {
    let len = steps.len();
    let step = steps
        .get_mut(update.index)
        .ok_or_else(|| index_error(update.index, len))?;

    if let Some(status) = update.status {
        if status == StepStatus::Done
            && step.status != StepStatus::Done
            && requires_step_confirmation(step)
            && !is_confirmed(step, confirmations)
        {
            return Err(KernelError::ConfirmationRequired(format!(
                "step {} ({}) is high-risk and must be confirmed before completion",
                step.index, step.task
            )));
        }

        if status == StepStatus::Done && step.status != StepStatus::Done {
            step.completed_at = Some(now);
        } else if status != StepStatus::Done {
            step.completed_at = None;
        }
        step.status = status;
    }

    if let Some(notes) = &update.notes {
        step.notes = if notes.trim().is_empty() {
            None
        } else {
            Some(notes.clone())
        };
    }

    if let Some(assignee) = &update.assignee {
        step.assignee = if assignee.trim().is_empty() {
            None
        } else {
            Some(assignee.clone())
        };
    }

    Ok(())
}

/// Reports done steps that sit in a later phase than a still-open
/// (pending or blocked) step. Advisory only.
#[must_use]
pub fn validate_step_order(steps: &[Step]) -> Vec<OrderValidationWarning> {
    let order = phase_order_of(steps);
    let rank: BTreeMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(position, name)| (name.as_str(), position))
        .collect();

    let mut warnings = Vec::new();
    for done in steps.iter().filter(|step| step.status == StepStatus::Done) {
        let done_rank = rank.get(done.phase.as_str()).copied().unwrap_or(0);
        let earliest_open = steps.iter().find(|candidate| {
            matches!(candidate.status, StepStatus::Pending | StepStatus::Blocked)
                && rank.get(candidate.phase.as_str()).copied().unwrap_or(0) < done_rank
        });
        if let Some(open) = earliest_open {
            warnings.push(OrderValidationWarning {
                step_index: done.index,
                phase: done.phase.clone(),
                pending_step_index: open.index,
                pending_phase: open.phase.clone(),
                message: format!(
                    "step {} in phase '{}' completed while step {} in earlier phase '{}' is {}",
                    done.index,
                    done.phase,
                    open.index,
                    open.phase,
                    open.status.as_str()
                ),
            });
        }
    }
    warnings
}

/// Distinct phase names in order of first appearance.
#[must_use]
pub fn phase_order_of(steps: &[Step]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut order = Vec::new();
    for step in steps {
        if seen.insert(step.phase.as_str()) {
            order.push(step.phase.clone());
        }
    }
    order
}

#[must_use]
pub fn derive_phases(steps: &[Step]) -> Vec<Phase> {
    phase_order_of(steps)
        .into_iter()
        .enumerate()
        .map(|(position, name)| Phase { position, name })
        .collect()
}

/// Keeps existing phase records in place and appends phases introduced by
/// steps.
#[must_use]
pub fn merge_phases(existing: &[Phase], steps: &[Step]) -> Vec<Phase> {
    let mut names: Vec<String> = existing.iter().map(|phase| phase.name.clone()).collect();
    for name in phase_order_of(steps) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
        .into_iter()
        .enumerate()
        .map(|(position, name)| Phase { position, name })
        .collect()
}

#[must_use]
pub fn recompute_current_phase(steps: &[Step]) -> Option<String> {
    steps
        .iter()
        .find(|step| step.status.is_open())
        .or_else(|| steps.last())
        .map(|step| step.phase.clone())
}

/// Phases with at least one step where every step is `done`.
#[must_use]
pub fn completed_phases(steps: &[Step]) -> BTreeSet<String> {
    phase_order_of(steps)
        .into_iter()
        .filter(|phase| {
            steps
                .iter()
                .filter(|step| &step.phase == phase)
                .all(|step| step.status == StepStatus::Done)
        })
        .collect()
}

#[must_use]
pub fn newly_completed_phases(before: &[Step], after: &[Step]) -> Vec<String> {
    let previously = completed_phases(before);
    completed_phases(after)
        .into_iter()
        .filter(|phase| !previously.contains(phase))
        .collect()
}

#[must_use]
pub fn is_phase_complete(steps: &[Step], phase: &str) -> bool {
    let mut in_phase = steps.iter().filter(|step| step.phase == phase).peekable();
    in_phase.peek().is_some() && in_phase.all(|step| step.status == StepStatus::Done)
}

/// Inserts `step` at position `at` (`at == len` appends).
///
/// # Errors
/// Returns [`KernelError::Validation`] when `at` is past the end.
pub fn insert_step(steps: &mut Vec<Step>, at: usize, step: Step) -> Result<(), KernelError> {
    if at > steps.len() {
        return Err(KernelError::Validation(format!(
            "insert position {at} is out of range for {} steps",
            steps.len()
        )));
    }
    steps.insert(at, step);
    renumber(steps);
    Ok(())
}

/// Removes and returns the step at `index`.
///
/// # Errors
/// Returns [`KernelError::Validation`] for an unknown index.
pub fn delete_step(steps: &mut Vec<Step>, index: usize) -> Result<Step, KernelError> {
    if index >= steps.len() {
        return Err(index_error(index, steps.len()));
    }
    let removed = steps.remove(index);
    renumber(steps);
    Ok(removed)
}

/// Moves the step at `from` so that it ends up at `to`.
///
/// # Errors
/// Returns [`KernelError::Validation`] when either index is out of range.
pub fn move_step(steps: &mut Vec<Step>, from: usize, to: usize) -> Result<(), KernelError> {
    if from >= steps.len() {
        return Err(index_error(from, steps.len()));
    }
    if to >= steps.len() {
        return Err(index_error(to, steps.len()));
    }
    let step = steps.remove(from);
    steps.insert(to, step);
    renumber(steps);
    Ok(())
}

/// Swaps a step with its neighbour.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the step is already at the edge
/// in the requested direction or the index is unknown.
pub fn reorder_step(
    steps: &mut [Step],
    index: usize,
    direction: MoveDirection,
) -> Result<(), KernelError> {
    if index >= steps.len() {
        return Err(index_error(index, steps.len()));
    }
    let neighbour = match direction {
        MoveDirection::Up if index > 0 => index - 1,
        MoveDirection::Down if index + 1 < steps.len() => index + 1,
        _ => {
            return Err(KernelError::Validation(format!(
                "step {index} cannot move {} any further",
                match direction {
                    MoveDirection::Up => "up",
                    MoveDirection::Down => "down",
                }
            )))
        }
    };
    steps.swap(index, neighbour);
    renumber(steps);
    Ok(())
}

/// Stable sort by phase rank. Phases missing from `order` keep their
/// first-appearance order after the listed ones.
pub fn sort_by_phase(steps: &mut [Step], order: &[String]) {
    let mut full_order: Vec<String> = order.to_vec();
    for name in phase_order_of(steps) {
        if !full_order.contains(&name) {
            full_order.push(name);
        }
    }
    let rank: BTreeMap<String, usize> = full_order
        .into_iter()
        .enumerate()
        .map(|(position, name)| (name, position))
        .collect();
    steps.sort_by_key(|step| rank.get(&step.phase).copied().unwrap_or(usize::MAX));
    renumber(steps);
}

/// Rearranges steps so that new position `i` holds the step previously at
/// `order[i]`.
///
/// # Errors
/// Returns [`KernelError::Validation`] unless `order` is a permutation of
/// `0..steps.len()`.
pub fn set_order(steps: &mut Vec<Step>, order: &[usize]) -> Result<(), KernelError> {
    if order.len() != steps.len() {
        return Err(KernelError::Validation(format!(
            "order lists {} positions but plan has {} steps",
            order.len(),
            steps.len()
        )));
    }
    let distinct: BTreeSet<usize> = order.iter().copied().collect();
    if distinct.len() != order.len() || order.iter().any(|index| *index >= steps.len()) {
        return Err(KernelError::Validation(
            "order MUST be a permutation of existing step indices".to_string(),
        ));
    }
    let reordered: Vec<Step> = order.iter().map(|index| steps[*index].clone()).collect();
    *steps = reordered;
    renumber(steps);
    Ok(())
}

/// Merges the steps at `indices` into one step carrying `task`.
///
/// # Errors
/// Returns [`KernelError::Validation`] when fewer than two distinct indices
/// are given, an index is unknown or the task is blank.
pub fn consolidate_steps(
    steps: &mut Vec<Step>,
    indices: &[usize],
    task: &str,
) -> Result<ConsolidationRecord, KernelError> {
    if task.trim().is_empty() {
        return Err(KernelError::Validation(
            "consolidated task MUST be provided".to_string(),
        ));
    }
    let selected: BTreeSet<usize> = indices.iter().copied().collect();
    if selected.len() < 2 {
        return Err(KernelError::Validation(
            "consolidation needs at least two distinct steps".to_string(),
        ));
    }
    if let Some(bad) = selected.iter().find(|index| **index >= steps.len()) {
        return Err(index_error(*bad, steps.len()));
    }

    let merged: Vec<&Step> = selected.iter().map(|index| &steps[*index]).collect();
    let first = merged[0];
    let status = if merged.iter().all(|step| step.status == StepStatus::Done) {
        StepStatus::Done
    } else if merged.iter().any(|step| step.status == StepStatus::Blocked) {
        StepStatus::Blocked
    } else if merged.iter().any(|step| step.status == StepStatus::Active) {
        StepStatus::Active
    } else {
        StepStatus::Pending
    };
    let step_type = merged
        .iter()
        .map(|step| step.step_type)
        .find(|step_type| step_type.is_high_risk())
        .unwrap_or(first.step_type);
    let notes: Vec<&str> = merged
        .iter()
        .filter_map(|step| step.notes.as_deref())
        .filter(|note| !note.trim().is_empty())
        .collect();
    let completed_at = if status == StepStatus::Done {
        merged.iter().filter_map(|step| step.completed_at).max()
    } else {
        None
    };

    let replacement = Step {
        id: first.id.clone(),
        index: first.index,
        phase: first.phase.clone(),
        task: task.trim().to_string(),
        status,
        step_type,
        notes: if notes.is_empty() {
            None
        } else {
            Some(notes.join("\n"))
        },
        assignee: first.assignee.clone(),
        completed_at,
    };
    let record = ConsolidationRecord {
        merged_step_id: replacement.id.clone(),
        merged_index: replacement.index,
        original_indices: selected.iter().copied().collect(),
        original_tasks: merged.iter().map(|step| step.task.clone()).collect(),
    };

    let keep_at = replacement.index;
    let mut rebuilt = Vec::with_capacity(steps.len() - selected.len() + 1);
    for step in steps.drain(..) {
        if step.index == keep_at {
            rebuilt.push(replacement.clone());
        } else if !selected.contains(&step.index) {
            rebuilt.push(step);
        }
    }
    *steps = rebuilt;
    renumber(steps);

    Ok(ConsolidationRecord {
        merged_index: steps
            .iter()
            .position(|step| step.id == record.merged_step_id)
            .unwrap_or(record.merged_index),
        ..record
    })
}

pub fn renumber(steps: &mut [Step]) {
    for (position, step) in steps.iter_mut().enumerate() {
        step.index = position;
    }
}

/// Checks that indices are exactly `0..len` in order and step ids are unique.
///
/// # Errors
/// Returns [`KernelError::InvariantViolation`] on any gap, duplicate or
/// out-of-order index.
pub fn ensure_contiguous_indices(steps: &[Step]) -> Result<(), KernelError> {
    for (position, step) in steps.iter().enumerate() {
        if step.index != position {
            return Err(KernelError::InvariantViolation(format!(
                "step index {} found at position {position}",
                step.index
            )));
        }
    }
    let ids: BTreeSet<&StepId> = steps.iter().map(|step| &step.id).collect();
    if ids.len() != steps.len() {
        return Err(KernelError::InvariantViolation(
            "duplicate step id within plan".to_string(),
        ));
    }
    Ok(())
}

/// Suggests promoting an oversized plan to a program. Never applied
/// automatically.
#[must_use]
pub fn program_upgrade_advisory(plan: &Plan, threshold: usize) -> Option<Advisory> {
    if plan.program_id.is_some() || plan.steps.len() <= threshold {
        return None;
    }
    Some(Advisory {
        kind: AdvisoryKind::ProgramUpgrade,
        message: format!(
            "plan has {} steps (threshold {threshold}); consider promoting it to a program and splitting work across child plans",
            plan.steps.len()
        ),
    })
}

#[must_use]
pub fn legacy_shape_advisory(plan: &Plan) -> Option<Advisory> {
    if !plan.is_legacy() {
        return None;
    }
    Some(Advisory {
        kind: AdvisoryKind::LegacyShapeUpgrade,
        message: format!(
            "plan uses implicit phases ({} derived from step labels); upgrade it to record explicit phases",
            plan.phases.len()
        ),
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanTemplate {
    Feature,
    Bugfix,
    Refactor,
    Documentation,
    Analysis,
    Investigation,
}

impl PlanTemplate {
    #[must_use]
    pub fn category(self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Refactor => "refactor",
            Self::Documentation => "documentation",
            Self::Analysis | Self::Investigation => "investigation",
        }
    }

    #[must_use]
    pub fn steps(self) -> Vec<NewStep> {
        use StepType as T;
        let rows: &[(&str, &str, StepType)] = match self {
            Self::Feature => &[
                ("research", "Survey existing code paths touched by the feature", T::Research),
                ("design", "Draft the design and agree interfaces", T::Planning),
                ("implementation", "Implement the feature", T::Code),
                ("implementation", "Build the project", T::Build),
                ("verification", "Write and run tests for the feature", T::Test),
                ("verification", "Review the change set", T::Validation),
                ("documentation", "Update user-facing documentation", T::Documentation),
            ],
            Self::Bugfix => &[
                ("investigation", "Reproduce the defect", T::Analysis),
                ("investigation", "Identify the root cause", T::Research),
                ("fix", "Apply the fix", T::Fix),
                ("verification", "Add a regression test", T::Test),
                ("verification", "Review the fix", T::Validation),
            ],
            Self::Refactor => &[
                ("analysis", "Map current structure and callers", T::Analysis),
                ("design", "Plan the target structure", T::Planning),
                ("refactor", "Restructure the code", T::Refactor),
                ("refactor", "Build the project", T::Build),
                ("verification", "Run the full test suite", T::Test),
                ("verification", "Review behaviour parity", T::Validation),
            ],
            Self::Documentation => &[
                ("research", "Collect the facts to document", T::Research),
                ("writing", "Write the documentation", T::Documentation),
                ("verification", "Review the documentation", T::Validation),
            ],
            Self::Analysis => &[
                ("analysis", "Define the questions to answer", T::Planning),
                ("analysis", "Gather evidence", T::Analysis),
                ("report", "Summarise findings", T::Documentation),
            ],
            Self::Investigation => &[
                ("investigation", "Collect symptoms and logs", T::Research),
                ("investigation", "Form and test hypotheses", T::Analysis),
                ("report", "Record conclusions and next actions", T::Documentation),
            ],
        };
        rows.iter()
            .map(|(phase, task, step_type)| NewStep::new(phase, task, *step_type))
            .collect()
    }
}

fn index_error(index: usize, len: usize) -> KernelError {
    KernelError::Validation(format!(
        "step index {index} is out of range for {len} steps"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_time() -> OffsetDateTime {
        must(crate::parse_rfc3339_utc("2026-02-07T12:00:00Z"))
    }

    fn fixture_steps(rows: &[(&str, &str, StepType)]) -> Vec<Step> {
        rows.iter()
            .enumerate()
            .map(|(index, (phase, task, step_type))| {
                NewStep::new(phase, task, *step_type).into_step(index)
            })
            .collect()
    }

    fn fixture_confirmation(step: &Step) -> ConfirmationState {
        ConfirmationState {
            plan_id: PlanId::from("plan_fixture"),
            phase: step.phase.clone(),
            step_id: Some(step.id.clone()),
            confirmed_by: "operator".to_string(),
            confirmed_at: fixture_time(),
        }
    }

    fn done(index: usize) -> StepUpdate {
        StepUpdate {
            index,
            status: Some(StepStatus::Done),
            notes: None,
            assignee: None,
        }
    }

    #[test]
    fn high_risk_detection_uses_type_and_keywords() {
        let steps = fixture_steps(&[
            ("ship", "Roll out", StepType::Deploy),
            ("cleanup", "Delete stale branches", StepType::Standard),
            ("code", "Write parser", StepType::Code),
        ]);
        assert!(requires_step_confirmation(&steps[0]));
        assert!(requires_step_confirmation(&steps[1]));
        assert!(!requires_step_confirmation(&steps[2]));
    }

    #[test]
    fn high_risk_step_needs_confirmation_before_done() {
        let mut steps = fixture_steps(&[("ship", "Deploy to production", StepType::Deploy)]);

        let err = apply_step_update(&mut steps, &done(0), &[], fixture_time());
        assert!(matches!(err, Err(KernelError::ConfirmationRequired(_))));
        assert_eq!(steps[0].status, StepStatus::Pending);

        let confirmation = fixture_confirmation(&steps[0]);
        must(apply_step_update(
            &mut steps,
            &done(0),
            &[confirmation],
            fixture_time(),
        ));
        assert_eq!(steps[0].status, StepStatus::Done);
        assert_eq!(steps[0].completed_at, Some(fixture_time()));
    }

    #[test]
    fn phase_level_confirmation_covers_every_step_in_phase() {
        let mut steps = fixture_steps(&[
            ("release", "Migrate schema", StepType::Migration),
            ("release", "Deploy service", StepType::Deploy),
        ]);
        let confirmation = ConfirmationState {
            step_id: None,
            ..fixture_confirmation(&steps[0])
        };
        must(apply_step_update(&mut steps, &done(0), &[confirmation.clone()], fixture_time()));
        must(apply_step_update(&mut steps, &done(1), &[confirmation], fixture_time()));
        assert!(steps.iter().all(|step| step.status == StepStatus::Done));
    }

    #[test]
    fn reopening_a_step_clears_completion_time() {
        let mut steps = fixture_steps(&[("code", "Write parser", StepType::Code)]);
        must(apply_step_update(&mut steps, &done(0), &[], fixture_time()));
        must(apply_step_update(
            &mut steps,
            &StepUpdate {
                index: 0,
                status: Some(StepStatus::Active),
                notes: Some("needs rework".to_string()),
                assignee: None,
            },
            &[],
            fixture_time(),
        ));
        assert_eq!(steps[0].completed_at, None);
        assert_eq!(steps[0].notes.as_deref(), Some("needs rework"));
    }

    #[test]
    fn order_validation_flags_later_phase_completion() {
        let mut steps = fixture_steps(&[
            ("design", "Sketch API", StepType::Planning),
            ("build", "Implement API", StepType::Code),
        ]);
        must(apply_step_update(&mut steps, &done(1), &[], fixture_time()));

        let warnings = validate_step_order(&steps);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].step_index, 1);
        assert_eq!(warnings[0].pending_step_index, 0);
        assert_eq!(warnings[0].pending_phase, "design");
    }

    #[test]
    fn order_validation_ignores_active_earlier_steps() {
        let mut steps = fixture_steps(&[
            ("design", "Sketch API", StepType::Planning),
            ("build", "Implement API", StepType::Code),
        ]);
        steps[0].status = StepStatus::Active;
        steps[1].status = StepStatus::Done;
        assert!(validate_step_order(&steps).is_empty());
    }

    #[test]
    fn consolidation_merges_and_renumbers() {
        let mut steps = fixture_steps(&[
            ("build", "Write parser", StepType::Code),
            ("build", "Write lexer", StepType::Code),
            ("build", "Write parser again", StepType::Code),
            ("test", "Test parser", StepType::Test),
        ]);
        steps[0].status = StepStatus::Done;
        steps[2].status = StepStatus::Active;
        let original_id = steps[0].id.clone();

        let record = must(consolidate_steps(&mut steps, &[2, 0], "Write parser"));

        assert_eq!(steps.len(), 3);
        assert_eq!(record.original_indices, vec![0, 2]);
        assert_eq!(record.merged_index, 0);
        assert_eq!(steps[0].id, original_id);
        assert_eq!(steps[0].status, StepStatus::Active);
        assert_eq!(steps[1].task, "Write lexer");
        must(ensure_contiguous_indices(&steps));
    }

    #[test]
    fn consolidation_keeps_high_risk_type() {
        let mut steps = fixture_steps(&[
            ("ship", "Prepare release notes", StepType::Documentation),
            ("ship", "Roll out", StepType::Deploy),
        ]);
        let _ = must(consolidate_steps(&mut steps, &[0, 1], "Ship release"));
        assert_eq!(steps[0].step_type, StepType::Deploy);
        assert!(requires_step_confirmation(&steps[0]));
    }

    #[test]
    fn consolidation_rejects_single_step() {
        let mut steps = fixture_steps(&[("a", "one", StepType::Code), ("a", "two", StepType::Code)]);
        assert!(consolidate_steps(&mut steps, &[1, 1], "merged").is_err());
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn sort_by_phase_is_stable() {
        let mut steps = fixture_steps(&[
            ("test", "t1", StepType::Test),
            ("build", "b1", StepType::Code),
            ("test", "t2", StepType::Test),
            ("build", "b2", StepType::Code),
        ]);
        sort_by_phase(&mut steps, &["build".to_string(), "test".to_string()]);
        let tasks: Vec<&str> = steps.iter().map(|step| step.task.as_str()).collect();
        assert_eq!(tasks, vec!["b1", "b2", "t1", "t2"]);
        must(ensure_contiguous_indices(&steps));
    }

    #[test]
    fn set_order_requires_permutation() {
        let mut steps = fixture_steps(&[
            ("a", "zero", StepType::Code),
            ("a", "one", StepType::Code),
            ("a", "two", StepType::Code),
        ]);
        assert!(set_order(&mut steps, &[0, 0, 1]).is_err());
        assert!(set_order(&mut steps, &[0, 1]).is_err());
        must(set_order(&mut steps, &[2, 0, 1]));
        let tasks: Vec<&str> = steps.iter().map(|step| step.task.as_str()).collect();
        assert_eq!(tasks, vec!["two", "zero", "one"]);
    }

    #[test]
    fn reorder_rejects_moves_past_edges() {
        let mut steps = fixture_steps(&[("a", "zero", StepType::Code), ("a", "one", StepType::Code)]);
        assert!(reorder_step(&mut steps, 0, MoveDirection::Up).is_err());
        assert!(reorder_step(&mut steps, 1, MoveDirection::Down).is_err());
        must(reorder_step(&mut steps, 1, MoveDirection::Up));
        assert_eq!(steps[0].task, "one");
    }

    #[test]
    fn newly_completed_phase_is_reported_once() {
        let before = fixture_steps(&[
            ("build", "b1", StepType::Code),
            ("build", "b2", StepType::Code),
            ("test", "t1", StepType::Test),
        ]);
        let mut after = before.clone();
        after[0].status = StepStatus::Done;
        assert!(newly_completed_phases(&before, &after).is_empty());
        let mut complete = after.clone();
        complete[1].status = StepStatus::Done;
        assert_eq!(newly_completed_phases(&after, &complete), vec!["build".to_string()]);
        assert!(newly_completed_phases(&complete, &complete).is_empty());
        assert_eq!(recompute_current_phase(&complete).as_deref(), Some("test"));
    }

    #[test]
    fn templates_produce_valid_steps() {
        for template in [
            PlanTemplate::Feature,
            PlanTemplate::Bugfix,
            PlanTemplate::Refactor,
            PlanTemplate::Documentation,
            PlanTemplate::Analysis,
            PlanTemplate::Investigation,
        ] {
            let steps = template.steps();
            assert!(!steps.is_empty());
            for step in &steps {
                must(step.validate());
            }
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(usize),
        Delete(usize),
        Move(usize, usize),
        Reorder(usize, bool),
        Consolidate(usize, usize),
        SortByPhase,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..40).prop_map(Op::Insert),
            (0usize..40).prop_map(Op::Delete),
            (0usize..40, 0usize..40).prop_map(|(from, to)| Op::Move(from, to)),
            (0usize..40, any::<bool>()).prop_map(|(index, up)| Op::Reorder(index, up)),
            (0usize..40, 0usize..40).prop_map(|(a, b)| Op::Consolidate(a, b)),
            Just(Op::SortByPhase),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_indices_stay_contiguous(initial in 0usize..12, ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut steps: Vec<Step> = (0..initial)
                .map(|index| NewStep::new(&format!("phase-{}", index % 3), &format!("task {index}"), StepType::Code).into_step(index))
                .collect();

            for (counter, op) in ops.into_iter().enumerate() {
                let _ = match op {
                    Op::Insert(at) => {
                        let step = NewStep::new(&format!("phase-{}", counter % 4), &format!("inserted {counter}"), StepType::Code);
                        insert_step(&mut steps, at, step.into_step(0))
                    }
                    Op::Delete(index) => delete_step(&mut steps, index).map(|_| ()),
                    Op::Move(from, to) => move_step(&mut steps, from, to),
                    Op::Reorder(index, up) => reorder_step(
                        &mut steps,
                        index,
                        if up { MoveDirection::Up } else { MoveDirection::Down },
                    ),
                    Op::Consolidate(a, b) => consolidate_steps(&mut steps, &[a, b], "merged").map(|_| ()),
                    Op::SortByPhase => {
                        sort_by_phase(&mut steps, &[]);
                        Ok(())
                    }
                };
                prop_assert!(ensure_contiguous_indices(&steps).is_ok());
            }
        }
    }
}
