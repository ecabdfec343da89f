//! Programs: plan manifests, cross-plan dependency edges and risks.

use anyhow::{Context, Result};
use plan_kernel_core::graph::{
    self, DependencyStatus, DependencyType, GraphValidation, NewDependency, PhaseCompletionReport,
    Program, ProgramDependency, ProgramStatus,
};
use plan_kernel_core::plan::{is_phase_complete, Plan};
use plan_kernel_core::risk::{detect_blocked_step_risks, DetectedBy, NewRisk, ProgramRisk, RiskSeverity, RiskType};
use plan_kernel_core::{KernelError, PlanId, ProgramId, WorkspaceId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use crate::locks::{plan_key, program_key};
use crate::plans::{archive_plan_rows, plan_program, require_plan, require_workspace};
use crate::{
    collect_rows, enum_column, format_optional_time, format_time, optional_time_column,
    time_column, PendingEvent, SqlitePlanStore,
};

const DEPENDENCY_COLUMNS: &str = "dependency_id, program_id, source_plan_id, source_phase,
     target_plan_id, target_phase, dependency_type, status, created_at, satisfied_at";

/// A program with its dependency edges and risks, as returned by
/// [`SqlitePlanStore::get_program`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgramDetail {
    pub program: Program,
    pub dependencies: Vec<ProgramDependency>,
    pub risks: Vec<ProgramRisk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskInsert {
    pub risk: ProgramRisk,
    /// False when an identical risk (same title and source plan) already
    /// existed.
    pub created: bool,
}

impl SqlitePlanStore {
    pub fn create_program(
        &mut self,
        workspace_id: &WorkspaceId,
        title: &str,
        description: &str,
    ) -> Result<Program> {
        let title = required_title(title)?;
        let program_id = ProgramId::generate();
        self.write(&[program_key(&program_id)], |tx, now| {
            let program = insert_program(tx, &program_id, workspace_id, &title, description, now)?;
            let event = PendingEvent::program(
                "program_created",
                &program.id,
                json!({ "title": program.title, "workspace_id": program.workspace_id }),
            );
            Ok((program, Some(event)))
        })
    }

    pub fn get_program(&self, program_id: &ProgramId) -> Result<ProgramDetail> {
        self.read(|conn| {
            let program = require_program(conn, program_id)?;
            let dependencies = load_dependencies(conn, program_id)?;
            let risks = load_risks(conn, program_id)?;
            Ok(ProgramDetail {
                program,
                dependencies,
                risks,
            })
        })
    }

    pub fn list_programs(&self, workspace_id: &WorkspaceId) -> Result<Vec<Program>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT program_id FROM programs
                 WHERE workspace_id = ?1
                 ORDER BY created_at ASC, program_id ASC",
            )?;
            let rows = stmt.query_map(params![workspace_id.as_str()], |row| row.get::<_, String>(0))?;
            let ids = collect_rows(rows)?;
            ids.into_iter()
                .map(|id| require_program(conn, &ProgramId::from(id)))
                .collect()
        })
    }

    /// Fails with `not_found` unless the program exists inside `workspace_id`.
    pub fn ensure_program_in_workspace(
        &self,
        program_id: &ProgramId,
        workspace_id: &WorkspaceId,
    ) -> Result<()> {
        let owner: Option<String> = self.read(|conn| {
            conn.query_row(
                "SELECT workspace_id FROM programs WHERE program_id = ?1",
                params![program_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up program workspace")
        })?;
        match owner {
            Some(owner) if owner == workspace_id.as_str() => Ok(()),
            _ => Err(KernelError::NotFound(format!(
                "program {program_id} in workspace {workspace_id}"
            ))
            .into()),
        }
    }

    /// Appends a plan to the program manifest and records the membership on
    /// the plan in the same transaction.
    pub fn add_plan_to_program(&mut self, program_id: &ProgramId, plan_id: &PlanId) -> Result<Program> {
        self.write(&[plan_key(plan_id), program_key(program_id)], |tx, now| {
            let program = require_active_program(tx, program_id)?;
            attach_plan(tx, &program, plan_id, now)?;
            let program = require_program(tx, program_id)?;
            let event = PendingEvent::plan(
                "plan_added_to_program",
                plan_id,
                json!({ "position": program.manifest.len().saturating_sub(1) }),
            )
            .with_program(Some(program_id));
            Ok((program, Some(event)))
        })
    }

    /// Removes a plan from the manifest and drops every edge touching it.
    pub fn remove_plan_from_program(
        &mut self,
        program_id: &ProgramId,
        plan_id: &PlanId,
    ) -> Result<Program> {
        self.write(&[plan_key(plan_id), program_key(program_id)], |tx, now| {
            let program = require_active_program(tx, program_id)?;
            if !program.contains(plan_id) {
                return Err(KernelError::Validation(format!(
                    "plan {plan_id} is not part of program {program_id}"
                ))
                .into());
            }
            let dropped = tx
                .execute(
                    "DELETE FROM program_dependencies
                     WHERE program_id = ?1 AND (source_plan_id = ?2 OR target_plan_id = ?2)",
                    params![program_id.as_str(), plan_id.as_str()],
                )
                .context("failed to drop plan dependencies")?;
            tx.execute(
                "DELETE FROM program_plans WHERE program_id = ?1 AND plan_id = ?2",
                params![program_id.as_str(), plan_id.as_str()],
            )
            .context("failed to remove plan from manifest")?;
            tx.execute(
                "UPDATE plans SET program_id = NULL, updated_at = ?2 WHERE plan_id = ?1",
                params![plan_id.as_str(), format_time(now)?],
            )
            .context("failed to clear plan program")?;
            touch_program(tx, program_id, now)?;

            let program = require_program(tx, program_id)?;
            let event = PendingEvent::plan(
                "plan_removed_from_program",
                plan_id,
                json!({ "dropped_dependencies": dropped }),
            )
            .with_program(Some(program_id));
            Ok((program, Some(event)))
        })
    }

    /// Creates a program in the plan's workspace holding just this plan.
    pub fn promote_plan_to_program(&mut self, plan_id: &PlanId, title: Option<&str>) -> Result<Program> {
        let program_id = ProgramId::generate();
        self.write(&[plan_key(plan_id), program_key(&program_id)], |tx, now| {
            let plan = require_plan(tx, plan_id)?;
            plan.ensure_mutable()?;
            if let Some(existing) = &plan.program_id {
                return Err(KernelError::Validation(format!(
                    "plan {plan_id} already belongs to program {existing}"
                ))
                .into());
            }
            let title = match title {
                Some(title) => required_title(title)?,
                None => plan.title.clone(),
            };
            let program = insert_program(
                tx,
                &program_id,
                &plan.workspace_id,
                &title,
                &format!("Promoted from plan {plan_id}"),
                now,
            )?;
            attach_plan(tx, &program, plan_id, now)?;
            let program = require_program(tx, &program_id)?;
            let event = PendingEvent::plan("plan_promoted", plan_id, json!({ "title": program.title }))
                .with_program(Some(&program_id));
            Ok((program, Some(event)))
        })
    }

    /// Adds or updates an edge. Setting the same source and target again
    /// updates its type; the edge is stored satisfied when the source phase
    /// is already complete.
    pub fn set_dependency(
        &mut self,
        program_id: &ProgramId,
        dependency: &NewDependency,
    ) -> Result<ProgramDependency> {
        dependency.validate()?;
        self.write(&[program_key(program_id)], |tx, now| {
            let program = require_active_program(tx, program_id)?;
            for plan_id in [&dependency.source_plan_id, &dependency.target_plan_id] {
                if !program.contains(plan_id) {
                    return Err(KernelError::Validation(format!(
                        "plan {plan_id} is not part of program {program_id}"
                    ))
                    .into());
                }
            }

            let existing = load_dependencies(tx, program_id)?;
            graph::check_candidate_edge(
                &existing,
                &dependency.source_plan_id,
                &dependency.target_plan_id,
            )?;

            let source_phase = dependency.source_phase.trim().to_string();
            let target_phase = dependency
                .target_phase
                .as_deref()
                .map(str::trim)
                .filter(|phase| !phase.is_empty())
                .map(str::to_string);
            let source_plan = require_plan(tx, &dependency.source_plan_id)?;
            let source_done = is_phase_complete(&source_plan.steps, &source_phase);

            let matching = existing.iter().find(|edge| {
                edge.source_plan_id == dependency.source_plan_id
                    && edge.source_phase == source_phase
                    && edge.target_plan_id == dependency.target_plan_id
                    && edge.target_phase == target_phase
            });

            let dependency_id = if let Some(edge) = matching {
                let status = if source_done {
                    DependencyStatus::Satisfied
                } else {
                    edge.status
                };
                let satisfied_at = match (status, edge.satisfied_at) {
                    (DependencyStatus::Satisfied, None) => Some(now),
                    (_, at) => at,
                };
                tx.execute(
                    "UPDATE program_dependencies
                     SET dependency_type = ?2, status = ?3, satisfied_at = ?4
                     WHERE dependency_id = ?1",
                    params![
                        edge.id,
                        dependency.dependency_type.as_str(),
                        status.as_str(),
                        format_optional_time(satisfied_at)?,
                    ],
                )
                .context("failed to update dependency")?;
                edge.id
            } else {
                let (status, satisfied_at) = if source_done {
                    (DependencyStatus::Satisfied, Some(now))
                } else {
                    (DependencyStatus::Pending, None)
                };
                tx.execute(
                    &format!(
                        "INSERT INTO program_dependencies({DEPENDENCY_COLUMNS})
                         VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                    ),
                    params![
                        program_id.as_str(),
                        dependency.source_plan_id.as_str(),
                        source_phase,
                        dependency.target_plan_id.as_str(),
                        target_phase,
                        dependency.dependency_type.as_str(),
                        status.as_str(),
                        format_time(now)?,
                        format_optional_time(satisfied_at)?,
                    ],
                )
                .context("failed to insert dependency")?;
                tx.last_insert_rowid()
            };
            touch_program(tx, program_id, now)?;

            let edge = require_dependency(tx, program_id, dependency_id)?;
            let event = PendingEvent::program(
                "dependency_set",
                program_id,
                json!({
                    "dependency_id": edge.id,
                    "source_plan_id": edge.source_plan_id,
                    "target_plan_id": edge.target_plan_id,
                    "status": edge.status.as_str(),
                }),
            );
            Ok((edge, Some(event)))
        })
    }

    pub fn remove_dependency(&mut self, program_id: &ProgramId, dependency_id: i64) -> Result<()> {
        self.write(&[program_key(program_id)], |tx, now| {
            require_active_program(tx, program_id)?;
            let removed = tx
                .execute(
                    "DELETE FROM program_dependencies WHERE program_id = ?1 AND dependency_id = ?2",
                    params![program_id.as_str(), dependency_id],
                )
                .context("failed to delete dependency")?;
            if removed == 0 {
                return Err(KernelError::NotFound(format!(
                    "dependency {dependency_id} in program {program_id}"
                ))
                .into());
            }
            touch_program(tx, program_id, now)?;
            let event = PendingEvent::program(
                "dependency_removed",
                program_id,
                json!({ "dependency_id": dependency_id }),
            );
            Ok(((), Some(event)))
        })
    }

    /// Edges into `plan_id`, or every edge of the program when no plan is
    /// given.
    pub fn get_dependencies(
        &self,
        program_id: &ProgramId,
        plan_id: Option<&PlanId>,
    ) -> Result<Vec<ProgramDependency>> {
        self.read(|conn| {
            require_program(conn, program_id)?;
            let edges = load_dependencies(conn, program_id)?;
            Ok(match plan_id {
                Some(plan_id) => edges
                    .into_iter()
                    .filter(|edge| &edge.target_plan_id == plan_id)
                    .collect(),
                None => edges,
            })
        })
    }

    /// Edges out of `plan_id`.
    pub fn get_dependents_of(
        &self,
        program_id: &ProgramId,
        plan_id: &PlanId,
    ) -> Result<Vec<ProgramDependency>> {
        self.read(|conn| {
            require_program(conn, program_id)?;
            Ok(load_dependencies(conn, program_id)?
                .into_iter()
                .filter(|edge| &edge.source_plan_id == plan_id)
                .collect())
        })
    }

    pub fn validate_no_cycles(&self, program_id: &ProgramId) -> Result<GraphValidation> {
        self.read(|conn| {
            require_program(conn, program_id)?;
            Ok(graph::validate_no_cycles(&load_dependencies(conn, program_id)?))
        })
    }

    /// Flips pending edges out of a completed phase to satisfied and reports
    /// which target plans have no unsatisfied `blocks` edge left. Does
    /// nothing for plans outside a program or phases with open steps.
    pub fn announce_phase_completion(
        &mut self,
        plan_id: &PlanId,
        phase: &str,
    ) -> Result<PhaseCompletionReport> {
        let Some(program_id) = self.read(|conn| plan_program(conn, plan_id))? else {
            let plan = self.get_plan(plan_id)?;
            return Ok(PhaseCompletionReport {
                plan_id: Some(plan_id.clone()),
                phase: phase.to_string(),
                phase_complete: is_phase_complete(&plan.steps, phase),
                ..PhaseCompletionReport::default()
            });
        };

        self.write(&[plan_key(plan_id), program_key(&program_id)], |tx, now| {
            let plan = require_plan(tx, plan_id)?;
            satisfy_phase_dependencies(tx, &plan, phase, now)
        })
    }

    pub fn add_risk(&mut self, program_id: &ProgramId, risk: &NewRisk) -> Result<RiskInsert> {
        risk.validate()?;
        self.write(&[program_key(program_id)], |tx, now| {
            require_active_program(tx, program_id)?;
            let inserted = upsert_risk(tx, program_id, risk, now)?;
            let event = inserted.created.then(|| {
                PendingEvent::program(
                    "risk_added",
                    program_id,
                    json!({
                        "risk_id": inserted.risk.id,
                        "risk_type": inserted.risk.risk_type.as_str(),
                        "severity": inserted.risk.severity.as_str(),
                    }),
                )
            });
            Ok((inserted, event))
        })
    }

    pub fn list_risks(&self, program_id: &ProgramId) -> Result<Vec<ProgramRisk>> {
        self.read(|conn| {
            require_program(conn, program_id)?;
            load_risks(conn, program_id)
        })
    }

    /// Scans blocked steps of every manifest plan and records a risk per
    /// blocked step with notes. Already known risks are returned with
    /// `created == false`.
    pub fn detect_risks(&mut self, program_id: &ProgramId) -> Result<Vec<RiskInsert>> {
        self.write(&[program_key(program_id)], |tx, now| {
            let program = require_active_program(tx, program_id)?;
            let mut results = Vec::new();
            for plan_id in &program.manifest {
                let plan = require_plan(tx, plan_id)?;
                for candidate in detect_blocked_step_risks(&plan) {
                    results.push(upsert_risk(tx, program_id, &candidate, now)?);
                }
            }
            let created = results.iter().filter(|item| item.created).count();
            let event = (created > 0).then(|| {
                PendingEvent::program("risks_detected", program_id, json!({ "created": created }))
            });
            Ok((results, event))
        })
    }

    /// Archives every manifest plan and marks the program archived. The
    /// manifest and edges stay in place.
    pub fn archive_program(&mut self, program_id: &ProgramId) -> Result<Program> {
        let manifest = self.read(|conn| Ok(require_program(conn, program_id)?.manifest))?;
        let mut keys: Vec<String> = manifest.iter().map(plan_key).collect();
        keys.push(program_key(program_id));

        self.write(&keys, |tx, now| {
            let program = require_active_program(tx, program_id)?;
            if program.manifest != manifest {
                return Err(KernelError::Validation(format!(
                    "manifest of program {program_id} changed while waiting for locks"
                ))
                .into());
            }
            let mut archived = Vec::new();
            for plan_id in &program.manifest {
                let plan = require_plan(tx, plan_id)?;
                if !plan.is_archived() {
                    archive_plan_rows(tx, plan_id, now)?;
                    archived.push(plan_id.clone());
                }
            }
            tx.execute(
                "UPDATE programs SET status = ?2, updated_at = ?3 WHERE program_id = ?1",
                params![
                    program_id.as_str(),
                    ProgramStatus::Archived.as_str(),
                    format_time(now)?
                ],
            )
            .context("failed to archive program")?;

            let program = require_program(tx, program_id)?;
            let event = PendingEvent::program(
                "program_archived",
                program_id,
                json!({ "archived_plans": archived }),
            );
            Ok((program, Some(event)))
        })
    }
}

fn required_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(KernelError::Validation("program title MUST be provided".to_string()).into());
    }
    Ok(title.to_string())
}

fn insert_program(
    tx: &Connection,
    program_id: &ProgramId,
    workspace_id: &WorkspaceId,
    title: &str,
    description: &str,
    now: OffsetDateTime,
) -> Result<Program> {
    require_workspace(tx, workspace_id)
        .map_err(|_| KernelError::Validation(format!("unknown workspace {workspace_id}")))?;
    tx.execute(
        "INSERT INTO programs(program_id, workspace_id, title, description, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            program_id.as_str(),
            workspace_id.as_str(),
            title,
            description,
            ProgramStatus::Active.as_str(),
            format_time(now)?,
        ],
    )
    .context("failed to insert program")?;
    Ok(Program {
        id: program_id.clone(),
        workspace_id: workspace_id.clone(),
        title: title.to_string(),
        description: description.to_string(),
        status: ProgramStatus::Active,
        manifest: Vec::new(),
        created_at: now,
        updated_at: now,
    })
}

fn attach_plan(
    tx: &Connection,
    program: &Program,
    plan_id: &PlanId,
    now: OffsetDateTime,
) -> Result<()> {
    let plan = require_plan(tx, plan_id)?;
    plan.ensure_mutable()?;
    if plan.workspace_id != program.workspace_id {
        return Err(KernelError::Validation(format!(
            "plan {plan_id} belongs to workspace {} but program {} belongs to {}",
            plan.workspace_id, program.id, program.workspace_id
        ))
        .into());
    }
    if let Some(existing) = &plan.program_id {
        return Err(KernelError::Validation(format!(
            "plan {plan_id} already belongs to program {existing}"
        ))
        .into());
    }

    let next_position: i64 = tx
        .query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM program_plans WHERE program_id = ?1",
            params![program.id.as_str()],
            |row| row.get(0),
        )
        .context("failed to compute manifest position")?;
    tx.execute(
        "INSERT INTO program_plans(program_id, plan_id, position) VALUES (?1, ?2, ?3)",
        params![program.id.as_str(), plan_id.as_str(), next_position],
    )
    .context("failed to add plan to manifest")?;
    tx.execute(
        "UPDATE plans SET program_id = ?2, updated_at = ?3 WHERE plan_id = ?1",
        params![plan_id.as_str(), program.id.as_str(), format_time(now)?],
    )
    .context("failed to record plan program")?;
    touch_program(tx, &program.id, now)
}

/// Flips pending edges out of `phase` when every step of it is finished and
/// reports the target plans left with no unsatisfied `blocks` edge. Runs
/// inside the caller's write transaction.
pub(crate) fn satisfy_phase_dependencies(
    tx: &Connection,
    plan: &Plan,
    phase: &str,
    now: OffsetDateTime,
) -> Result<(PhaseCompletionReport, Option<PendingEvent>)> {
    let mut report = PhaseCompletionReport {
        plan_id: Some(plan.id.clone()),
        phase: phase.to_string(),
        phase_complete: is_phase_complete(&plan.steps, phase),
        ..PhaseCompletionReport::default()
    };
    let Some(program_id) = plan.program_id.as_ref() else {
        return Ok((report, None));
    };
    if !report.phase_complete {
        return Ok((report, None));
    }

    let mut stmt = tx.prepare(
        "SELECT dependency_id FROM program_dependencies
         WHERE program_id = ?1 AND source_plan_id = ?2 AND source_phase = ?3
           AND status = 'pending'
         ORDER BY dependency_id ASC",
    )?;
    let rows = stmt.query_map(
        params![program_id.as_str(), plan.id.as_str(), phase],
        |row| row.get::<_, i64>(0),
    )?;
    let flipped = collect_rows(rows)?;
    if flipped.is_empty() {
        return Ok((report, None));
    }
    for dependency_id in &flipped {
        tx.execute(
            "UPDATE program_dependencies SET status = 'satisfied', satisfied_at = ?2
             WHERE dependency_id = ?1",
            params![dependency_id, format_time(now)?],
        )
        .context("failed to satisfy dependency")?;
    }
    touch_program(tx, program_id, now)?;

    let edges = load_dependencies(tx, program_id)?;
    report.unblocked_plans = graph::unblocked_targets(&edges, &flipped);
    report.satisfied_dependencies = flipped;
    let event = PendingEvent::plan(
        "phase_completed",
        &plan.id,
        json!({
            "phase": phase,
            "satisfied_dependencies": report.satisfied_dependencies,
            "unblocked_plans": report.unblocked_plans,
        }),
    )
    .with_program(Some(program_id));
    Ok((report, Some(event)))
}

fn touch_program(tx: &Connection, program_id: &ProgramId, now: OffsetDateTime) -> Result<()> {
    tx.execute(
        "UPDATE programs SET updated_at = ?2 WHERE program_id = ?1",
        params![program_id.as_str(), format_time(now)?],
    )
    .context("failed to touch program")?;
    Ok(())
}

pub(crate) fn load_program(conn: &Connection, program_id: &ProgramId) -> Result<Option<Program>> {
    let program = conn
        .query_row(
            "SELECT program_id, workspace_id, title, description, status, created_at, updated_at
             FROM programs
             WHERE program_id = ?1",
            params![program_id.as_str()],
            |row| {
                Ok(Program {
                    id: ProgramId::from(row.get::<_, String>(0)?),
                    workspace_id: WorkspaceId(row.get(1)?),
                    title: row.get(2)?,
                    description: row.get(3)?,
                    status: enum_column(row, 4, "program status", ProgramStatus::parse)?,
                    manifest: Vec::new(),
                    created_at: time_column(row, 5)?,
                    updated_at: time_column(row, 6)?,
                })
            },
        )
        .optional()
        .context("failed to load program")?;
    let Some(mut program) = program else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT plan_id FROM program_plans WHERE program_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![program_id.as_str()], |row| {
        Ok(PlanId::from(row.get::<_, String>(0)?))
    })?;
    program.manifest = collect_rows(rows)?;
    Ok(Some(program))
}

pub(crate) fn require_program(conn: &Connection, program_id: &ProgramId) -> Result<Program> {
    load_program(conn, program_id)?
        .ok_or_else(|| KernelError::NotFound(format!("program {program_id}")).into())
}

fn require_active_program(conn: &Connection, program_id: &ProgramId) -> Result<Program> {
    let program = require_program(conn, program_id)?;
    if program.status == ProgramStatus::Archived {
        return Err(KernelError::Validation(format!(
            "program {program_id} is archived and cannot be modified"
        ))
        .into());
    }
    Ok(program)
}

fn parse_dependency_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgramDependency> {
    Ok(ProgramDependency {
        id: row.get(0)?,
        program_id: ProgramId::from(row.get::<_, String>(1)?),
        source_plan_id: PlanId::from(row.get::<_, String>(2)?),
        source_phase: row.get(3)?,
        target_plan_id: PlanId::from(row.get::<_, String>(4)?),
        target_phase: row.get(5)?,
        dependency_type: enum_column(row, 6, "dependency type", DependencyType::parse)?,
        status: enum_column(row, 7, "dependency status", DependencyStatus::parse)?,
        created_at: time_column(row, 8)?,
        satisfied_at: optional_time_column(row, 9)?,
    })
}

fn load_dependencies(conn: &Connection, program_id: &ProgramId) -> Result<Vec<ProgramDependency>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DEPENDENCY_COLUMNS}
         FROM program_dependencies
         WHERE program_id = ?1
         ORDER BY dependency_id ASC"
    ))?;
    let rows = stmt.query_map(params![program_id.as_str()], parse_dependency_row)?;
    collect_rows(rows)
}

fn require_dependency(
    conn: &Connection,
    program_id: &ProgramId,
    dependency_id: i64,
) -> Result<ProgramDependency> {
    conn.query_row(
        &format!(
            "SELECT {DEPENDENCY_COLUMNS}
             FROM program_dependencies
             WHERE program_id = ?1 AND dependency_id = ?2"
        ),
        params![program_id.as_str(), dependency_id],
        parse_dependency_row,
    )
    .optional()
    .context("failed to load dependency")?
    .ok_or_else(|| {
        KernelError::NotFound(format!("dependency {dependency_id} in program {program_id}")).into()
    })
}

fn load_risks(conn: &Connection, program_id: &ProgramId) -> Result<Vec<ProgramRisk>> {
    let mut stmt = conn.prepare(
        "SELECT risk_id, program_id, title, risk_type, severity, description, source_plan_id,
                detected_by, created_at
         FROM program_risks
         WHERE program_id = ?1
         ORDER BY risk_id ASC",
    )?;
    let rows = stmt.query_map(params![program_id.as_str()], parse_risk_row)?;
    let mut risks = collect_rows(rows)?;
    for risk in &mut risks {
        risk.affected_plans = load_affected_plans(conn, risk.id)?;
    }
    Ok(risks)
}

fn parse_risk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgramRisk> {
    Ok(ProgramRisk {
        id: row.get(0)?,
        program_id: ProgramId::from(row.get::<_, String>(1)?),
        title: row.get(2)?,
        risk_type: enum_column(row, 3, "risk type", RiskType::parse)?,
        severity: enum_column(row, 4, "risk severity", RiskSeverity::parse)?,
        description: row.get(5)?,
        source_plan_id: row.get::<_, Option<String>>(6)?.map(PlanId::from),
        affected_plans: Vec::new(),
        detected_by: enum_column(row, 7, "detected_by", DetectedBy::parse)?,
        created_at: time_column(row, 8)?,
    })
}

fn load_affected_plans(conn: &Connection, risk_id: i64) -> Result<Vec<PlanId>> {
    let mut stmt = conn.prepare(
        "SELECT plan_id FROM risk_affected_plans WHERE risk_id = ?1 ORDER BY plan_id ASC",
    )?;
    let rows = stmt.query_map(params![risk_id], |row| {
        Ok(PlanId::from(row.get::<_, String>(0)?))
    })?;
    collect_rows(rows)
}

/// Inserts a risk unless one with the same title and source plan exists.
fn upsert_risk(
    tx: &Connection,
    program_id: &ProgramId,
    risk: &NewRisk,
    now: OffsetDateTime,
) -> Result<RiskInsert> {
    let title = risk.title.trim();
    let source = risk.source_plan_id.as_ref().map(PlanId::as_str);
    let existing = tx
        .query_row(
            "SELECT risk_id, program_id, title, risk_type, severity, description, source_plan_id,
                    detected_by, created_at
             FROM program_risks
             WHERE program_id = ?1 AND title = ?2 AND source_plan_id IS ?3",
            params![program_id.as_str(), title, source],
            parse_risk_row,
        )
        .optional()
        .context("failed to look up existing risk")?;
    if let Some(mut risk) = existing {
        risk.affected_plans = load_affected_plans(tx, risk.id)?;
        return Ok(RiskInsert {
            risk,
            created: false,
        });
    }

    tx.execute(
        "INSERT INTO program_risks(program_id, title, risk_type, severity, description,
                                   source_plan_id, detected_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            program_id.as_str(),
            title,
            risk.risk_type.as_str(),
            risk.effective_severity().as_str(),
            risk.description,
            source,
            risk.detected_by.as_str(),
            format_time(now)?,
        ],
    )
    .context("failed to insert risk")?;
    let risk_id = tx.last_insert_rowid();
    for plan_id in &risk.affected_plans {
        tx.execute(
            "INSERT OR IGNORE INTO risk_affected_plans(risk_id, plan_id) VALUES (?1, ?2)",
            params![risk_id, plan_id.as_str()],
        )
        .context("failed to record affected plan")?;
    }

    Ok(RiskInsert {
        risk: ProgramRisk {
            id: risk_id,
            program_id: program_id.clone(),
            title: title.to_string(),
            risk_type: risk.risk_type,
            severity: risk.effective_severity(),
            description: risk.description.clone(),
            source_plan_id: risk.source_plan_id.clone(),
            affected_plans: load_affected_plans(tx, risk_id)?,
            detected_by: risk.detected_by,
            created_at: now,
        },
        created: true,
    })
}
