//! Workspaces, plans and the persisted step state machine.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use plan_kernel_core::approval::{ApprovalOracle, ApprovalRequest};
use plan_kernel_core::graph::PhaseCompletionReport;
use plan_kernel_core::plan::{
    self as machine, ConfirmationState, ConsolidationRecord, MoveDirection, NewPlan, NewStep,
    NoteType, OrderValidationWarning, Phase, Plan, PlanNote, PlanStatus, PlanSummary,
    PlanTemplate, Priority, Step, StepStatus, StepType, StepUpdate, CURRENT_PLAN_SCHEMA_VERSION,
};
use plan_kernel_core::roles::AgentType;
use plan_kernel_core::workflow::normalize_category;
use plan_kernel_core::{
    workspace_name_from_path, KernelError, PlanId, ProgramId, StepId, Workspace, WorkspaceId,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::locks::{plan_key, program_key, LegacyFileLock};
use crate::programs::satisfy_phase_dependencies;
use crate::{
    collect_rows, enum_column, format_optional_time, format_time, optional_enum_column,
    optional_time_column, sql_int, time_column, usize_column, PendingEvent, SqlitePlanStore,
};

const PLAN_COLUMNS: &str = "plan_id, workspace_id, title, description, status, category, priority,
     schema_version, current_phase, current_agent, program_id, created_at, updated_at";

const STEP_COLUMNS: &str =
    "step_id, step_index, phase, task, status, step_type, notes, assignee, completed_at";

/// Where a new step lands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepPosition {
    Start,
    #[default]
    End,
    At(usize),
}

impl StepPosition {
    fn resolve(self, len: usize) -> usize {
        match self {
            Self::Start => 0,
            Self::End => len,
            Self::At(index) => index,
        }
    }
}

/// Result of a status update: the saved plan plus advisory output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepMutation {
    pub plan: Plan,
    /// Order warnings that involve one of the updated steps.
    pub warnings: Vec<OrderValidationWarning>,
    /// Phases this mutation finished.
    pub completed_phases: Vec<String>,
    /// Dependency edges released by those phases, committed with the
    /// step change. Empty for plans outside a program.
    pub phase_reports: Vec<PhaseCompletionReport>,
}

#[derive(Debug, Deserialize)]
struct LegacyPlanFile {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    current_agent: Option<String>,
    #[serde(default)]
    steps: Vec<LegacyStep>,
}

#[derive(Debug, Deserialize)]
struct LegacyStep {
    phase: String,
    task: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "type")]
    step_type: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    assignee: Option<String>,
}

impl LegacyPlanFile {
    fn into_plan(
        self,
        id: PlanId,
        workspace_id: WorkspaceId,
        now: OffsetDateTime,
    ) -> Result<Plan, KernelError> {
        if self.title.trim().is_empty() {
            return Err(KernelError::Validation(
                "legacy plan title MUST be provided".to_string(),
            ));
        }
        let status = parse_or(self.status.as_deref(), "plan status", PlanStatus::parse, PlanStatus::Active)?;
        let priority = parse_or(self.priority.as_deref(), "priority", Priority::parse, Priority::Medium)?;
        let current_agent = self
            .current_agent
            .as_deref()
            .map(AgentType::parse_required)
            .transpose()?;

        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, raw) in self.steps.into_iter().enumerate() {
            let status = parse_or(raw.status.as_deref(), "step status", StepStatus::parse, StepStatus::Pending)?;
            let step_type = parse_or(raw.step_type.as_deref(), "step type", StepType::parse, StepType::Standard)?;
            let mut step = NewStep {
                phase: raw.phase,
                task: raw.task,
                step_type,
                notes: raw.notes,
                assignee: raw.assignee,
            };
            step.validate()?;
            step.phase = step.phase.trim().to_string();
            let mut step = step.into_step(index);
            step.status = status;
            if status == StepStatus::Done {
                step.completed_at = Some(now);
            }
            steps.push(step);
        }

        Ok(Plan {
            id,
            workspace_id,
            title: self.title.trim().to_string(),
            description: self.description,
            status,
            category: self.category.as_deref().and_then(normalize_category),
            priority,
            schema_version: None,
            current_phase: machine::recompute_current_phase(&steps),
            current_agent,
            program_id: None,
            phases: machine::derive_phases(&steps),
            steps,
            created_at: now,
            updated_at: now,
        })
    }
}

fn parse_or<T>(
    raw: Option<&str>,
    label: &str,
    parse: impl Fn(&str) -> Option<T>,
    default: T,
) -> Result<T, KernelError> {
    match raw {
        None => Ok(default),
        Some(value) => parse(value)
            .ok_or_else(|| KernelError::Validation(format!("invalid {label}: {value}"))),
    }
}

impl SqlitePlanStore {
    /// Registers a project directory, or refreshes its name and path when it
    /// is already known.
    pub fn register_workspace(&mut self, path: &str, name: Option<&str>) -> Result<Workspace> {
        let path = path.trim();
        if path.is_empty() {
            return Err(KernelError::Validation("workspace path MUST be provided".to_string()).into());
        }
        let id = WorkspaceId::from_path(path);
        let name = name
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map_or_else(|| workspace_name_from_path(path), str::to_string);

        self.write(&[], |tx, now| {
            tx.execute(
                "INSERT INTO workspaces(workspace_id, name, path, registered_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id) DO UPDATE SET name = excluded.name, path = excluded.path",
                params![id.as_str(), name, path, format_time(now)?],
            )
            .context("failed to upsert workspace")?;
            let workspace = require_workspace(tx, &id)?;
            let event = PendingEvent::workspace(
                "workspace_registered",
                json!({ "workspace_id": workspace.id, "name": workspace.name }),
            );
            Ok((workspace, Some(event)))
        })
    }

    pub fn get_workspace(&self, workspace_id: &WorkspaceId) -> Result<Workspace> {
        self.read(|conn| {
            load_workspace(conn, workspace_id)?.ok_or_else(|| {
                KernelError::NotFound(format!("workspace {workspace_id}")).into()
            })
        })
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT workspace_id, name, path, registered_at
                 FROM workspaces
                 ORDER BY registered_at ASC, workspace_id ASC",
            )?;
            let rows = stmt.query_map([], parse_workspace_row)?;
            collect_rows(rows)
        })
    }

    /// Fails with `not_found` unless the plan exists inside `workspace_id`.
    pub fn ensure_plan_in_workspace(
        &self,
        plan_id: &PlanId,
        workspace_id: &WorkspaceId,
    ) -> Result<()> {
        let owner: Option<String> = self.read(|conn| {
            conn.query_row(
                "SELECT workspace_id FROM plans WHERE plan_id = ?1",
                params![plan_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up plan workspace")
        })?;
        match owner {
            Some(owner) if owner == workspace_id.as_str() => Ok(()),
            _ => Err(KernelError::NotFound(format!(
                "plan {plan_id} in workspace {workspace_id}"
            ))
            .into()),
        }
    }

    pub fn create_plan(&mut self, input: &NewPlan) -> Result<Plan> {
        input.validate()?;
        let plan_id = PlanId::generate();
        let threshold = self.config.auto_upgrade_step_threshold;

        self.write(&[plan_key(&plan_id)], |tx, now| {
            require_workspace(tx, &input.workspace_id).map_err(|_| {
                KernelError::Validation(format!("unknown workspace {}", input.workspace_id))
            })?;

            let steps: Vec<Step> = input
                .steps
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, step)| step.into_step(index))
                .collect();
            let explicit: Vec<Phase> = input
                .phases
                .iter()
                .enumerate()
                .map(|(position, name)| Phase {
                    position,
                    name: name.trim().to_string(),
                })
                .collect();

            let plan = Plan {
                id: plan_id.clone(),
                workspace_id: input.workspace_id.clone(),
                title: input.title.trim().to_string(),
                description: input.description.clone(),
                status: PlanStatus::Active,
                category: input.category.as_deref().and_then(normalize_category),
                priority: input.priority,
                schema_version: Some(CURRENT_PLAN_SCHEMA_VERSION),
                current_phase: machine::recompute_current_phase(&steps),
                current_agent: input.created_by,
                program_id: None,
                phases: machine::merge_phases(&explicit, &steps),
                steps,
                created_at: now,
                updated_at: now,
            };

            insert_plan_row(tx, &plan)?;
            save_plan(tx, &plan)?;
            attach_upgrade_note(tx, &plan, threshold, now)?;

            let mut event = PendingEvent::plan(
                "plan_created",
                &plan.id,
                json!({ "title": plan.title, "step_count": plan.steps.len() }),
            );
            if let Some(agent) = plan.current_agent {
                event = event.with_agent(agent);
            }
            Ok((plan, Some(event)))
        })
    }

    pub fn create_plan_from_template(
        &mut self,
        workspace_id: &WorkspaceId,
        title: &str,
        template: PlanTemplate,
        created_by: Option<AgentType>,
    ) -> Result<Plan> {
        self.create_plan(&NewPlan {
            workspace_id: workspace_id.clone(),
            title: title.to_string(),
            description: String::new(),
            category: Some(template.category().to_string()),
            priority: Priority::Medium,
            steps: template.steps(),
            phases: Vec::new(),
            created_by,
        })
    }

    /// Current state of a plan. Archived plans are read from the archive
    /// copy; legacy plans get their phases derived without any write.
    pub fn get_plan(&self, plan_id: &PlanId) -> Result<Plan> {
        self.read(|conn| require_plan(conn, plan_id))
    }

    pub fn list_plans(
        &self,
        workspace_id: &WorkspaceId,
        include_archived: bool,
    ) -> Result<Vec<PlanSummary>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.plan_id, p.workspace_id, p.title, p.status, p.category, p.priority,
                        p.current_phase, p.current_agent, p.program_id, p.updated_at,
                        CASE WHEN p.status = 'archived'
                             THEN (SELECT COUNT(*) FROM archived_steps a WHERE a.plan_id = p.plan_id)
                             ELSE (SELECT COUNT(*) FROM steps s WHERE s.plan_id = p.plan_id) END,
                        CASE WHEN p.status = 'archived'
                             THEN (SELECT COUNT(*) FROM archived_steps a
                                   WHERE a.plan_id = p.plan_id AND a.status = 'done')
                             ELSE (SELECT COUNT(*) FROM steps s
                                   WHERE s.plan_id = p.plan_id AND s.status = 'done') END
                 FROM plans p
                 WHERE p.workspace_id = ?1 AND (?2 = 1 OR p.status <> 'archived')
                 ORDER BY p.created_at ASC, p.plan_id ASC",
            )?;
            let rows = stmt.query_map(
                params![workspace_id.as_str(), crate::bool_to_sql(include_archived)],
                |row| {
                    Ok(PlanSummary {
                        id: PlanId::from(row.get::<_, String>(0)?),
                        workspace_id: WorkspaceId(row.get(1)?),
                        title: row.get(2)?,
                        status: enum_column(row, 3, "plan status", PlanStatus::parse)?,
                        category: row.get(4)?,
                        priority: enum_column(row, 5, "priority", Priority::parse)?,
                        current_phase: row.get(6)?,
                        current_agent: optional_enum_column(row, 7, "agent type", AgentType::parse)?,
                        program_id: row.get::<_, Option<String>>(8)?.map(ProgramId::from),
                        updated_at: time_column(row, 9)?,
                        step_count: usize_column(row, 10)?,
                        done_count: usize_column(row, 11)?,
                    })
                },
            )?;
            collect_rows(rows)
        })
    }

    pub fn update_step(&mut self, plan_id: &PlanId, update: &StepUpdate) -> Result<StepMutation> {
        self.apply_step_updates(plan_id, std::slice::from_ref(update), "step_updated")
    }

    /// Applies every update or none of them.
    pub fn batch_update_steps(
        &mut self,
        plan_id: &PlanId,
        updates: &[StepUpdate],
    ) -> Result<StepMutation> {
        if updates.is_empty() {
            return Err(KernelError::Validation(
                "batch update needs at least one step".to_string(),
            )
            .into());
        }
        self.apply_step_updates(plan_id, updates, "steps_batch_updated")
    }

    fn apply_step_updates(
        &mut self,
        plan_id: &PlanId,
        updates: &[StepUpdate],
        event_type: &'static str,
    ) -> Result<StepMutation> {
        let mut keys = vec![plan_key(plan_id)];
        keys.extend(self.read(|conn| plan_program(conn, plan_id))?.as_ref().map(program_key));

        // The IMMEDIATE transaction also serialises membership changes that
        // land between the lookup above and the lock.
        let (plan, (completed_phases, phase_reports)) =
            self.mutate_plan_locked(&keys, plan_id, event_type, |tx, plan, now| {
                let confirmations = load_confirmations(tx, &plan.id)?;
                let before = plan.steps.clone();
                for update in updates {
                    machine::apply_step_update(&mut plan.steps, update, &confirmations, now)?;
                }
                let completed = machine::newly_completed_phases(&before, &plan.steps);

                let mut reports = Vec::new();
                let mut events = Vec::new();
                if plan.program_id.is_some() {
                    for phase in &completed {
                        let (report, event) = satisfy_phase_dependencies(tx, plan, phase, now)?;
                        reports.push(report);
                        events.extend(event);
                    }
                }
                Ok(((completed, reports), events))
            })?;

        let touched: BTreeSet<usize> = updates.iter().map(|update| update.index).collect();
        let warnings = machine::validate_step_order(&plan.steps)
            .into_iter()
            .filter(|warning| {
                touched.contains(&warning.step_index) || touched.contains(&warning.pending_step_index)
            })
            .collect();

        Ok(StepMutation {
            plan,
            warnings,
            completed_phases,
            phase_reports,
        })
    }

    pub fn insert_step(
        &mut self,
        plan_id: &PlanId,
        position: StepPosition,
        step: &NewStep,
    ) -> Result<Plan> {
        step.validate()?;
        let (plan, ()) = self.mutate_plan(plan_id, "step_inserted", |_, plan, _| {
            let at = position.resolve(plan.steps.len());
            machine::insert_step(&mut plan.steps, at, step.clone().into_step(at))?;
            Ok(())
        })?;
        Ok(plan)
    }

    pub fn delete_step(&mut self, plan_id: &PlanId, index: usize) -> Result<Plan> {
        let (plan, _) = self.mutate_plan(plan_id, "step_deleted", |_, plan, _| {
            Ok(machine::delete_step(&mut plan.steps, index)?)
        })?;
        Ok(plan)
    }

    pub fn reorder_step(
        &mut self,
        plan_id: &PlanId,
        index: usize,
        direction: MoveDirection,
    ) -> Result<Plan> {
        let (plan, ()) = self.mutate_plan(plan_id, "step_reordered", |_, plan, _| {
            Ok(machine::reorder_step(&mut plan.steps, index, direction)?)
        })?;
        Ok(plan)
    }

    pub fn move_step(&mut self, plan_id: &PlanId, from: usize, to: usize) -> Result<Plan> {
        let (plan, ()) = self.mutate_plan(plan_id, "step_moved", |_, plan, _| {
            Ok(machine::move_step(&mut plan.steps, from, to)?)
        })?;
        Ok(plan)
    }

    /// Groups steps by phase. Without an explicit order the plan's own phase
    /// order is used.
    pub fn sort_by_phase(&mut self, plan_id: &PlanId, order: Option<&[String]>) -> Result<Plan> {
        let (plan, ()) = self.mutate_plan(plan_id, "steps_sorted", |_, plan, _| {
            let order = order.map_or_else(|| plan.phase_order(), <[String]>::to_vec);
            machine::sort_by_phase(&mut plan.steps, &order);
            Ok(())
        })?;
        Ok(plan)
    }

    pub fn set_order(&mut self, plan_id: &PlanId, order: &[usize]) -> Result<Plan> {
        let (plan, ()) = self.mutate_plan(plan_id, "steps_reordered", |_, plan, _| {
            Ok(machine::set_order(&mut plan.steps, order)?)
        })?;
        Ok(plan)
    }

    pub fn consolidate_steps(
        &mut self,
        plan_id: &PlanId,
        indices: &[usize],
        task: &str,
    ) -> Result<(Plan, ConsolidationRecord)> {
        self.mutate_plan(plan_id, "steps_consolidated", |tx, plan, now| {
            let record = machine::consolidate_steps(&mut plan.steps, indices, task)?;
            tx.execute(
                "INSERT INTO step_consolidations(plan_id, merged_step_id, task, consolidated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    plan.id.as_str(),
                    record.merged_step_id.as_str(),
                    task.trim(),
                    format_time(now)?
                ],
            )
            .context("failed to record step consolidation")?;
            let consolidation_id = tx.last_insert_rowid();
            for (index, original) in record.original_indices.iter().zip(&record.original_tasks) {
                tx.execute(
                    "INSERT INTO step_consolidation_sources(consolidation_id, original_index, original_task)
                     VALUES (?1, ?2, ?3)",
                    params![consolidation_id, sql_int(*index)?, original],
                )
                .context("failed to record consolidated step")?;
            }
            Ok(record)
        })
    }

    pub fn confirm_step(
        &mut self,
        plan_id: &PlanId,
        index: usize,
        confirmed_by: &str,
    ) -> Result<ConfirmationState> {
        let confirmed_by = required_confirmer(confirmed_by)?;
        self.write(&[plan_key(plan_id)], |tx, now| {
            let plan = require_plan(tx, plan_id)?;
            plan.ensure_mutable()?;
            let step = plan.step(index).ok_or_else(|| {
                KernelError::Validation(format!(
                    "step index {index} is out of range for {} steps",
                    plan.steps.len()
                ))
            })?;
            record_step_confirmation(tx, &plan, step, &confirmed_by, now)
        })
    }

    /// Confirms every step of `phase`, including steps added later.
    pub fn confirm_phase(
        &mut self,
        plan_id: &PlanId,
        phase: &str,
        confirmed_by: &str,
    ) -> Result<ConfirmationState> {
        let confirmed_by = required_confirmer(confirmed_by)?;
        self.write(&[plan_key(plan_id)], |tx, now| {
            let plan = require_plan(tx, plan_id)?;
            plan.ensure_mutable()?;
            if !plan.phase_order().iter().any(|name| name == phase) {
                return Err(KernelError::Validation(format!(
                    "plan {plan_id} has no phase '{phase}'"
                ))
                .into());
            }
            let confirmation = ConfirmationState {
                plan_id: plan.id.clone(),
                phase: phase.to_string(),
                step_id: None,
                confirmed_by,
                confirmed_at: now,
            };
            insert_confirmation(tx, &confirmation)?;
            let event = PendingEvent::plan(
                "phase_confirmed",
                &plan.id,
                json!({ "phase": phase, "confirmed_by": confirmation.confirmed_by }),
            )
            .with_program(plan.program_id.as_ref());
            Ok((confirmation, Some(event)))
        })
    }

    /// Asks the approval service to confirm a step. The service is called
    /// without holding any lock; the confirmation is then recorded against
    /// the step id, wherever the step sits by then.
    pub fn request_step_confirmation(
        &mut self,
        plan_id: &PlanId,
        index: usize,
        oracle: &dyn ApprovalOracle,
    ) -> Result<ConfirmationState> {
        let plan = self.get_plan(plan_id)?;
        plan.ensure_mutable()?;
        let step = plan.step(index).cloned().ok_or_else(|| {
            KernelError::Validation(format!(
                "step index {index} is out of range for {} steps",
                plan.steps.len()
            ))
        })?;

        let request = ApprovalRequest {
            request_id: Ulid::new().to_string().to_lowercase(),
            plan_id: plan.id.clone(),
            step_index: Some(index),
            command: step.task.clone(),
            reason: format!(
                "{} step in phase '{}' needs confirmation before completion",
                step.step_type.as_str(),
                step.phase
            ),
        };
        let verdict = oracle.request_approval(&request, self.config.approval_timeout())?;
        if !verdict.approved {
            return Err(KernelError::ConfirmationRequired(format!(
                "approval request {} was denied by {}{}",
                request.request_id,
                verdict.responder,
                verdict
                    .comment
                    .as_deref()
                    .map(|comment| format!(": {comment}"))
                    .unwrap_or_default()
            ))
            .into());
        }

        self.write(&[plan_key(plan_id)], |tx, now| {
            let plan = require_plan(tx, plan_id)?;
            plan.ensure_mutable()?;
            let current = plan
                .steps
                .iter()
                .find(|candidate| candidate.id == step.id)
                .ok_or_else(|| {
                    KernelError::NotFound(format!("step {} in plan {plan_id}", step.id))
                })?;
            record_step_confirmation(tx, &plan, current, &verdict.responder, now)
        })
    }

    pub fn add_note(
        &mut self,
        plan_id: &PlanId,
        note_type: NoteType,
        message: &str,
    ) -> Result<PlanNote> {
        if message.trim().is_empty() {
            return Err(KernelError::Validation("note message MUST be provided".to_string()).into());
        }
        self.write(&[plan_key(plan_id)], |tx, now| {
            let plan = require_plan(tx, plan_id)?;
            let note = insert_note(tx, &plan.id, note_type, message.trim(), now)?;
            let event = PendingEvent::plan(
                "note_added",
                &plan.id,
                json!({ "note_id": note.id, "note_type": note_type.as_str() }),
            )
            .with_program(plan.program_id.as_ref());
            Ok((note, Some(event)))
        })
    }

    pub fn list_notes(&self, plan_id: &PlanId, pending_only: bool) -> Result<Vec<PlanNote>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT note_id, plan_id, note_type, message, created_at, consumed_at
                 FROM plan_notes
                 WHERE plan_id = ?1 AND (?2 = 0 OR consumed_at IS NULL)
                 ORDER BY note_id ASC",
            )?;
            let rows = stmt.query_map(
                params![plan_id.as_str(), crate::bool_to_sql(pending_only)],
                parse_note_row,
            )?;
            collect_rows(rows)
        })
    }

    /// Moves the plan's steps into the archive tables. The plan stays
    /// readable; further mutations are rejected.
    pub fn archive_plan(&mut self, plan_id: &PlanId) -> Result<Plan> {
        self.write(&[plan_key(plan_id)], |tx, now| {
            let plan = archive_plan_rows(tx, plan_id, now)?;
            let event = PendingEvent::plan(
                "plan_archived",
                &plan.id,
                json!({ "step_count": plan.steps.len() }),
            )
            .with_program(plan.program_id.as_ref());
            Ok((plan, Some(event)))
        })
    }

    /// Copies the plan to the archive with reason `deleted`, detaches it from
    /// its program and removes the live rows. Sessions and lineage remain.
    pub fn delete_plan(&mut self, plan_id: &PlanId) -> Result<()> {
        let program_id = self.read(|conn| plan_program(conn, plan_id))?;
        let mut keys = vec![plan_key(plan_id)];
        if let Some(program_id) = &program_id {
            keys.push(program_key(program_id));
        }

        self.write(&keys, |tx, now| {
            let plan = require_plan(tx, plan_id)?;
            if plan.program_id != program_id {
                return Err(KernelError::Validation(format!(
                    "program membership of plan {plan_id} changed while waiting for locks"
                ))
                .into());
            }

            if plan.is_archived() {
                tx.execute(
                    "UPDATE archived_plans SET reason = 'deleted', archived_at = ?2 WHERE plan_id = ?1",
                    params![plan_id.as_str(), format_time(now)?],
                )
                .context("failed to mark archived plan deleted")?;
            } else {
                write_archive_copy(tx, &plan, "deleted", now)?;
            }

            if let Some(program_id) = &plan.program_id {
                tx.execute(
                    "DELETE FROM program_plans WHERE plan_id = ?1",
                    params![plan_id.as_str()],
                )
                .context("failed to remove plan from program manifest")?;
                tx.execute(
                    "UPDATE programs SET updated_at = ?2 WHERE program_id = ?1",
                    params![program_id.as_str(), format_time(now)?],
                )
                .context("failed to touch program")?;
            }
            tx.execute(
                "DELETE FROM program_dependencies WHERE source_plan_id = ?1 OR target_plan_id = ?1",
                params![plan_id.as_str()],
            )
            .context("failed to drop plan dependencies")?;
            tx.execute("DELETE FROM plans WHERE plan_id = ?1", params![plan_id.as_str()])
                .context("failed to delete plan")?;

            let event = PendingEvent::plan("plan_deleted", &plan.id, json!({ "title": plan.title }))
                .with_program(plan.program_id.as_ref());
            Ok(((), Some(event)))
        })
    }

    /// Converts a legacy plan to explicit phase records. Only ever runs on
    /// request.
    pub fn upgrade_legacy_plan(&mut self, plan_id: &PlanId) -> Result<Plan> {
        let (plan, ()) = self.mutate_plan(plan_id, "plan_upgraded", |_, plan, _| {
            if !plan.is_legacy() {
                return Err(KernelError::Validation(format!(
                    "plan {} already records explicit phases",
                    plan.id
                ))
                .into());
            }
            plan.schema_version = Some(CURRENT_PLAN_SCHEMA_VERSION);
            plan.phases = machine::derive_phases(&plan.steps);
            Ok(())
        })?;
        Ok(plan)
    }

    /// Imports an on-disk legacy plan document as a legacy plan. The file is
    /// held under its `.lock` sibling while it is read.
    pub fn import_legacy_plan_file(
        &mut self,
        workspace_id: &WorkspaceId,
        path: &Path,
    ) -> Result<Plan> {
        let legacy: LegacyPlanFile = {
            let _file_lock = LegacyFileLock::acquire(path, &self.config)?;
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read legacy plan file {}", path.display()))?;
            serde_json::from_str(&raw).map_err(|err| {
                KernelError::Validation(format!(
                    "malformed legacy plan file {}: {err}",
                    path.display()
                ))
            })?
        };
        let plan_id = legacy.id.clone().map_or_else(PlanId::generate, PlanId::from);

        self.write(&[plan_key(&plan_id)], |tx, now| {
            require_workspace(tx, workspace_id).map_err(|_| {
                KernelError::Validation(format!("unknown workspace {workspace_id}"))
            })?;
            if plan_program(tx, &plan_id).is_ok() {
                return Err(KernelError::Validation(format!(
                    "plan {plan_id} already exists"
                ))
                .into());
            }
            let plan = legacy.into_plan(plan_id.clone(), workspace_id.clone(), now)?;
            insert_plan_row(tx, &plan)?;
            save_plan(tx, &plan)?;
            let event = PendingEvent::plan(
                "legacy_plan_imported",
                &plan.id,
                json!({ "source": path.display().to_string(), "step_count": plan.steps.len() }),
            );
            Ok((plan, Some(event)))
        })
    }

    /// Loads a live plan under its lock, lets `apply` change it, then
    /// re-derives phases and `current_phase` and saves it.
    fn mutate_plan<T>(
        &mut self,
        plan_id: &PlanId,
        event_type: &'static str,
        apply: impl FnOnce(&Transaction<'_>, &mut Plan, OffsetDateTime) -> Result<T>,
    ) -> Result<(Plan, T)> {
        self.mutate_plan_locked(&[plan_key(plan_id)], plan_id, event_type, |tx, plan, now| {
            apply(tx, plan, now).map(|value| (value, Vec::new()))
        })
    }

    /// [`Self::mutate_plan`] under an explicit lock set. Events returned by
    /// `apply` are recorded after the plan's own event.
    fn mutate_plan_locked<T>(
        &mut self,
        keys: &[String],
        plan_id: &PlanId,
        event_type: &'static str,
        apply: impl FnOnce(&Transaction<'_>, &mut Plan, OffsetDateTime) -> Result<(T, Vec<PendingEvent>)>,
    ) -> Result<(Plan, T)> {
        let threshold = self.config.auto_upgrade_step_threshold;
        self.write_all(keys, |tx, now| {
            let mut plan = require_plan(tx, plan_id)?;
            plan.ensure_mutable()?;
            let (value, extra_events) = apply(tx, &mut plan, now)?;

            plan.current_phase = machine::recompute_current_phase(&plan.steps);
            plan.phases = if plan.is_legacy() {
                machine::derive_phases(&plan.steps)
            } else {
                machine::merge_phases(&plan.phases, &plan.steps)
            };
            plan.updated_at = now;
            save_plan(tx, &plan)?;
            attach_upgrade_note(tx, &plan, threshold, now)?;

            let event = PendingEvent::plan(
                event_type,
                &plan.id,
                json!({
                    "step_count": plan.steps.len(),
                    "current_phase": plan.current_phase,
                }),
            )
            .with_program(plan.program_id.as_ref());
            let mut events = vec![event];
            events.extend(extra_events);
            Ok(((plan, value), events))
        })
    }
}

fn required_confirmer(confirmed_by: &str) -> Result<String> {
    let confirmed_by = confirmed_by.trim();
    if confirmed_by.is_empty() {
        return Err(KernelError::Validation("confirmed_by MUST be provided".to_string()).into());
    }
    Ok(confirmed_by.to_string())
}

fn record_step_confirmation(
    tx: &Connection,
    plan: &Plan,
    step: &Step,
    confirmed_by: &str,
    now: OffsetDateTime,
) -> Result<(ConfirmationState, Option<PendingEvent>)> {
    let confirmation = ConfirmationState {
        plan_id: plan.id.clone(),
        phase: step.phase.clone(),
        step_id: Some(step.id.clone()),
        confirmed_by: confirmed_by.to_string(),
        confirmed_at: now,
    };
    insert_confirmation(tx, &confirmation)?;
    let event = PendingEvent::plan(
        "step_confirmed",
        &plan.id,
        json!({
            "step_index": step.index,
            "step_id": step.id,
            "confirmed_by": confirmed_by,
        }),
    )
    .with_program(plan.program_id.as_ref());
    Ok((confirmation, Some(event)))
}

fn parse_workspace_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: WorkspaceId(row.get(0)?),
        name: row.get(1)?,
        path: row.get(2)?,
        registered_at: time_column(row, 3)?,
    })
}

pub(crate) fn load_workspace(
    conn: &Connection,
    workspace_id: &WorkspaceId,
) -> Result<Option<Workspace>> {
    conn.query_row(
        "SELECT workspace_id, name, path, registered_at FROM workspaces WHERE workspace_id = ?1",
        params![workspace_id.as_str()],
        parse_workspace_row,
    )
    .optional()
    .context("failed to load workspace")
}

pub(crate) fn require_workspace(conn: &Connection, workspace_id: &WorkspaceId) -> Result<Workspace> {
    load_workspace(conn, workspace_id)?
        .ok_or_else(|| KernelError::NotFound(format!("workspace {workspace_id}")).into())
}

fn parse_plan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        id: PlanId::from(row.get::<_, String>(0)?),
        workspace_id: WorkspaceId(row.get(1)?),
        title: row.get(2)?,
        description: row.get(3)?,
        status: enum_column(row, 4, "plan status", PlanStatus::parse)?,
        category: row.get(5)?,
        priority: enum_column(row, 6, "priority", Priority::parse)?,
        schema_version: row.get(7)?,
        current_phase: row.get(8)?,
        current_agent: optional_enum_column(row, 9, "agent type", AgentType::parse)?,
        program_id: row.get::<_, Option<String>>(10)?.map(ProgramId::from),
        steps: Vec::new(),
        phases: Vec::new(),
        created_at: time_column(row, 11)?,
        updated_at: time_column(row, 12)?,
    })
}

fn parse_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: StepId::from(row.get::<_, String>(0)?),
        index: usize_column(row, 1)?,
        phase: row.get(2)?,
        task: row.get(3)?,
        status: enum_column(row, 4, "step status", StepStatus::parse)?,
        step_type: enum_column(row, 5, "step type", StepType::parse)?,
        notes: row.get(6)?,
        assignee: row.get(7)?,
        completed_at: optional_time_column(row, 8)?,
    })
}

fn parse_note_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanNote> {
    Ok(PlanNote {
        id: row.get(0)?,
        plan_id: PlanId::from(row.get::<_, String>(1)?),
        note_type: enum_column(row, 2, "note type", NoteType::parse)?,
        message: row.get(3)?,
        created_at: time_column(row, 4)?,
        consumed_at: optional_time_column(row, 5)?,
    })
}

/// Full plan snapshot. The header always comes from `plans`; steps and
/// phases come from the archive tables once the plan is archived.
pub(crate) fn load_plan(conn: &Connection, plan_id: &PlanId) -> Result<Option<Plan>> {
    let header = conn
        .query_row(
            &format!("SELECT {PLAN_COLUMNS} FROM plans WHERE plan_id = ?1"),
            params![plan_id.as_str()],
            parse_plan_row,
        )
        .optional()
        .context("failed to load plan")?;
    let Some(mut plan) = header else {
        return Ok(None);
    };

    let (steps_table, phases_table) = if plan.is_archived() {
        ("archived_steps", "archived_plan_phases")
    } else {
        ("steps", "plan_phases")
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM {steps_table} WHERE plan_id = ?1 ORDER BY step_index ASC"
    ))?;
    let rows = stmt.query_map(params![plan_id.as_str()], parse_step_row)?;
    plan.steps = collect_rows(rows)?;

    plan.phases = if plan.is_legacy() {
        machine::derive_phases(&plan.steps)
    } else {
        let mut stmt = conn.prepare(&format!(
            "SELECT position, name FROM {phases_table} WHERE plan_id = ?1 ORDER BY position ASC"
        ))?;
        let rows = stmt.query_map(params![plan_id.as_str()], |row| {
            Ok(Phase {
                position: usize_column(row, 0)?,
                name: row.get(1)?,
            })
        })?;
        collect_rows(rows)?
    };

    Ok(Some(plan))
}

pub(crate) fn require_plan(conn: &Connection, plan_id: &PlanId) -> Result<Plan> {
    load_plan(conn, plan_id)?.ok_or_else(|| KernelError::NotFound(format!("plan {plan_id}")).into())
}

/// Program membership of a plan; `not_found` when the plan does not exist.
pub(crate) fn plan_program(conn: &Connection, plan_id: &PlanId) -> Result<Option<ProgramId>> {
    let row: Option<Option<String>> = conn
        .query_row(
            "SELECT program_id FROM plans WHERE plan_id = ?1",
            params![plan_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to look up plan program")?;
    match row {
        Some(program_id) => Ok(program_id.map(ProgramId::from)),
        None => Err(KernelError::NotFound(format!("plan {plan_id}")).into()),
    }
}

fn insert_plan_row(tx: &Connection, plan: &Plan) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO plans({PLAN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            plan.id.as_str(),
            plan.workspace_id.as_str(),
            plan.title,
            plan.description,
            plan.status.as_str(),
            plan.category,
            plan.priority.as_str(),
            plan.schema_version,
            plan.current_phase,
            plan.current_agent.map(AgentType::as_str),
            plan.program_id.as_ref().map(ProgramId::as_str),
            format_time(plan.created_at)?,
            format_time(plan.updated_at)?,
        ],
    )
    .context("failed to insert plan")?;
    Ok(())
}

fn update_plan_row(tx: &Connection, plan: &Plan) -> Result<()> {
    tx.execute(
        "UPDATE plans
         SET title = ?2, description = ?3, status = ?4, category = ?5, priority = ?6,
             schema_version = ?7, current_phase = ?8, current_agent = ?9, program_id = ?10,
             updated_at = ?11
         WHERE plan_id = ?1",
        params![
            plan.id.as_str(),
            plan.title,
            plan.description,
            plan.status.as_str(),
            plan.category,
            plan.priority.as_str(),
            plan.schema_version,
            plan.current_phase,
            plan.current_agent.map(AgentType::as_str),
            plan.program_id.as_ref().map(ProgramId::as_str),
            format_time(plan.updated_at)?,
        ],
    )
    .context("failed to update plan")?;
    Ok(())
}

/// Writes header, phases and steps of a live plan. Indices are checked
/// before anything is written.
pub(crate) fn save_plan(tx: &Connection, plan: &Plan) -> Result<()> {
    machine::ensure_contiguous_indices(&plan.steps)?;
    update_plan_row(tx, plan)?;

    if !plan.is_legacy() {
        tx.execute(
            "DELETE FROM plan_phases WHERE plan_id = ?1",
            params![plan.id.as_str()],
        )
        .context("failed to clear plan phases")?;
        for phase in &plan.phases {
            tx.execute(
                "INSERT INTO plan_phases(plan_id, position, name) VALUES (?1, ?2, ?3)",
                params![plan.id.as_str(), sql_int(phase.position)?, phase.name],
            )
            .context("failed to write plan phase")?;
        }
    }

    // Park existing rows on negative indices so the upserts below never
    // collide on (plan_id, step_index); rows still negative afterwards were
    // removed from the plan.
    tx.execute(
        "UPDATE steps SET step_index = -step_index - 1 WHERE plan_id = ?1",
        params![plan.id.as_str()],
    )
    .context("failed to park step indices")?;
    for step in &plan.steps {
        tx.execute(
            "INSERT INTO steps(step_id, plan_id, step_index, phase, task, status, step_type, notes, assignee, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(step_id) DO UPDATE SET
               step_index = excluded.step_index,
               phase = excluded.phase,
               task = excluded.task,
               status = excluded.status,
               step_type = excluded.step_type,
               notes = excluded.notes,
               assignee = excluded.assignee,
               completed_at = excluded.completed_at",
            params![
                step.id.as_str(),
                plan.id.as_str(),
                sql_int(step.index)?,
                step.phase,
                step.task,
                step.status.as_str(),
                step.step_type.as_str(),
                step.notes,
                step.assignee,
                format_optional_time(step.completed_at)?,
            ],
        )
        .context("failed to write step")?;
    }
    tx.execute(
        "DELETE FROM steps WHERE plan_id = ?1 AND step_index < 0",
        params![plan.id.as_str()],
    )
    .context("failed to delete removed steps")?;
    Ok(())
}

fn write_archive_copy(
    tx: &Connection,
    plan: &Plan,
    reason: &str,
    now: OffsetDateTime,
) -> Result<()> {
    tx.execute(
        "DELETE FROM archived_plans WHERE plan_id = ?1",
        params![plan.id.as_str()],
    )
    .context("failed to clear previous archive copy")?;
    tx.execute(
        &format!(
            "INSERT INTO archived_plans({PLAN_COLUMNS}, reason, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            plan.id.as_str(),
            plan.workspace_id.as_str(),
            plan.title,
            plan.description,
            plan.status.as_str(),
            plan.category,
            plan.priority.as_str(),
            plan.schema_version,
            plan.current_phase,
            plan.current_agent.map(AgentType::as_str),
            plan.program_id.as_ref().map(ProgramId::as_str),
            format_time(plan.created_at)?,
            format_time(plan.updated_at)?,
            reason,
            format_time(now)?,
        ],
    )
    .context("failed to archive plan header")?;

    if !plan.is_legacy() {
        for phase in &plan.phases {
            tx.execute(
                "INSERT INTO archived_plan_phases(plan_id, position, name) VALUES (?1, ?2, ?3)",
                params![plan.id.as_str(), sql_int(phase.position)?, phase.name],
            )
            .context("failed to archive plan phase")?;
        }
    }
    for step in &plan.steps {
        tx.execute(
            &format!(
                "INSERT INTO archived_steps(plan_id, {STEP_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                plan.id.as_str(),
                step.id.as_str(),
                sql_int(step.index)?,
                step.phase,
                step.task,
                step.status.as_str(),
                step.step_type.as_str(),
                step.notes,
                step.assignee,
                format_optional_time(step.completed_at)?,
            ],
        )
        .context("failed to archive step")?;
    }
    Ok(())
}

/// Archives one live plan inside the caller's transaction and returns the
/// archived snapshot.
pub(crate) fn archive_plan_rows(
    tx: &Connection,
    plan_id: &PlanId,
    now: OffsetDateTime,
) -> Result<Plan> {
    let mut plan = require_plan(tx, plan_id)?;
    plan.ensure_mutable()?;
    plan.status = PlanStatus::Archived;
    plan.updated_at = now;

    write_archive_copy(tx, &plan, "archived", now)?;
    tx.execute("DELETE FROM steps WHERE plan_id = ?1", params![plan_id.as_str()])
        .context("failed to remove archived steps")?;
    tx.execute(
        "DELETE FROM plan_phases WHERE plan_id = ?1",
        params![plan_id.as_str()],
    )
    .context("failed to remove archived phases")?;
    update_plan_row(tx, &plan)?;
    Ok(plan)
}

pub(crate) fn load_confirmations(
    conn: &Connection,
    plan_id: &PlanId,
) -> Result<Vec<ConfirmationState>> {
    let mut stmt = conn.prepare(
        "SELECT plan_id, phase, step_id, confirmed_by, confirmed_at
         FROM step_confirmations
         WHERE plan_id = ?1
         ORDER BY confirmation_id ASC",
    )?;
    let rows = stmt.query_map(params![plan_id.as_str()], |row| {
        Ok(ConfirmationState {
            plan_id: PlanId::from(row.get::<_, String>(0)?),
            phase: row.get(1)?,
            step_id: row.get::<_, Option<String>>(2)?.map(StepId::from),
            confirmed_by: row.get(3)?,
            confirmed_at: time_column(row, 4)?,
        })
    })?;
    collect_rows(rows)
}

fn insert_confirmation(tx: &Connection, confirmation: &ConfirmationState) -> Result<()> {
    tx.execute(
        "INSERT INTO step_confirmations(plan_id, phase, step_id, confirmed_by, confirmed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            confirmation.plan_id.as_str(),
            confirmation.phase,
            confirmation.step_id.as_ref().map(StepId::as_str),
            confirmation.confirmed_by,
            format_time(confirmation.confirmed_at)?,
        ],
    )
    .context("failed to record confirmation")?;
    Ok(())
}

fn insert_note(
    tx: &Connection,
    plan_id: &PlanId,
    note_type: NoteType,
    message: &str,
    now: OffsetDateTime,
) -> Result<PlanNote> {
    tx.execute(
        "INSERT INTO plan_notes(plan_id, note_type, message, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![plan_id.as_str(), note_type.as_str(), message, format_time(now)?],
    )
    .context("failed to insert plan note")?;
    Ok(PlanNote {
        id: tx.last_insert_rowid(),
        plan_id: plan_id.clone(),
        note_type,
        message: message.to_string(),
        created_at: now,
        consumed_at: None,
    })
}

/// Returns the plan's pending notes and marks them consumed.
pub(crate) fn take_pending_notes(
    tx: &Connection,
    plan_id: &PlanId,
    now: OffsetDateTime,
) -> Result<Vec<PlanNote>> {
    let mut stmt = tx.prepare(
        "SELECT note_id, plan_id, note_type, message, created_at, consumed_at
         FROM plan_notes
         WHERE plan_id = ?1 AND consumed_at IS NULL
         ORDER BY note_id ASC",
    )?;
    let rows = stmt.query_map(params![plan_id.as_str()], parse_note_row)?;
    let mut notes = collect_rows(rows)?;
    tx.execute(
        "UPDATE plan_notes SET consumed_at = ?2 WHERE plan_id = ?1 AND consumed_at IS NULL",
        params![plan_id.as_str(), format_time(now)?],
    )
    .context("failed to consume plan notes")?;
    for note in &mut notes {
        note.consumed_at = Some(now);
    }
    Ok(notes)
}

/// Attaches the program-upgrade suggestion the first time the plan crosses
/// the threshold. Returns whether a note was added.
fn attach_upgrade_note(
    tx: &Connection,
    plan: &Plan,
    threshold: usize,
    now: OffsetDateTime,
) -> Result<bool> {
    let Some(advisory) = machine::program_upgrade_advisory(plan, threshold) else {
        return Ok(false);
    };
    let already: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM plan_notes WHERE plan_id = ?1 AND note_type = ?2",
            params![plan.id.as_str(), NoteType::ProgramUpgradeSuggested.as_str()],
            |row| row.get(0),
        )
        .context("failed to check upgrade notes")?;
    if already > 0 {
        return Ok(false);
    }
    insert_note(tx, &plan.id, NoteType::ProgramUpgradeSuggested, &advisory.message, now)?;
    Ok(true)
}
