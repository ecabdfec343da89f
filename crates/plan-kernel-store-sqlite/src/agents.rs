//! Agent sessions, handoff lineage, limit flags and the build-script
//! registry.

use anyhow::{Context, Result};
use plan_kernel_core::handoff::{
    detect_limit_breaches, is_session_stale, next_lineage_timestamp, AgentSession, HandoffRequest,
    LimitFlag, LimitFlagKind, LineageEntry, SessionCompletion, SessionStart,
};
use plan_kernel_core::plan::{Plan, PlanNote};
use plan_kernel_core::roles::{validate_agent, validate_handoff, AgentType, RoleContext, RoleValidation};
use plan_kernel_core::{KernelError, PlanId, SessionId, WorkspaceId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tracing::warn;

use crate::locks::plan_key;
use crate::plans::{load_confirmations, require_plan, require_workspace, take_pending_notes};
use crate::{
    bool_to_sql, collect_rows, enum_column, format_time, optional_time_column, time_column,
    PendingEvent, SqlitePlanStore,
};

const SESSION_COLUMNS: &str = "session_id, plan_id, agent_type, started_at, completed_at, summary,
     is_orphaned, step_budget, token_budget, steps_completed, tokens_used";

const LIMIT_FLAG_COLUMNS: &str =
    "flag_id, plan_id, session_id, agent_type, kind, detail, created_at, consumed_at";

/// Everything an agent needs when it picks up a plan.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInitialisation {
    pub session: AgentSession,
    pub validation: RoleValidation,
    /// Notes left for the next agent; now marked consumed.
    pub pending_notes: Vec<PlanNote>,
    /// Limit flags raised by earlier workers; now marked consumed.
    pub limit_flags: Vec<LimitFlag>,
    pub stale_sessions_flagged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandoffOutcome {
    pub lineage: LineageEntry,
    pub limit_flags: Vec<LimitFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildScript {
    pub id: i64,
    pub workspace_id: WorkspaceId,
    pub plan_id: Option<PlanId>,
    pub name: String,
    pub command: String,
    pub directory: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewBuildScript {
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub plan_id: Option<PlanId>,
    pub name: String,
    pub command: String,
    #[serde(default = "current_directory")]
    pub directory: String,
}

fn current_directory() -> String {
    ".".to_string()
}

impl NewBuildScript {
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.name.trim().is_empty() {
            return Err(KernelError::Validation("build script name MUST be provided".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(KernelError::Validation(
                "build script command MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

impl SqlitePlanStore {
    /// Opens a session for `agent` on the plan, makes it the current agent
    /// and hands over pending notes and limit flags.
    pub fn initialise_agent(
        &mut self,
        plan_id: &PlanId,
        agent: AgentType,
        start: &SessionStart,
    ) -> Result<AgentInitialisation> {
        let stale_after = self.config.stale_session_after();
        self.write(&[plan_key(plan_id)], |tx, now| {
            let mut plan = require_plan(tx, plan_id)?;
            let stale_sessions_flagged = flag_stale_sessions(tx, Some(plan_id), now, stale_after)?.len();

            let session = AgentSession {
                id: SessionId::generate(),
                plan_id: plan_id.clone(),
                agent_type: agent,
                started_at: now,
                completed_at: None,
                summary: None,
                is_orphaned: false,
                step_budget: start.step_budget,
                token_budget: start.token_budget,
                steps_completed: 0,
                tokens_used: 0,
                declared_scope: start
                    .declared_scope
                    .iter()
                    .map(|path| path.trim().to_string())
                    .filter(|path| !path.is_empty())
                    .collect(),
                files_touched: Vec::new(),
                artifacts: Vec::new(),
            };
            insert_session(tx, &session)?;

            if !plan.is_archived() {
                tx.execute(
                    "UPDATE plans SET current_agent = ?2, updated_at = ?3 WHERE plan_id = ?1",
                    params![plan_id.as_str(), agent.as_str(), format_time(now)?],
                )
                .context("failed to set current agent")?;
                plan.current_agent = Some(agent);
            }

            let pending_notes = take_pending_notes(tx, plan_id, now)?;
            let limit_flags = take_limit_flags(tx, plan_id, now)?;
            let validation = role_validation(tx, &plan, agent)?;

            let event = PendingEvent::plan(
                "agent_initialised",
                plan_id,
                json!({
                    "session_id": session.id,
                    "action": validation.action,
                    "stale_sessions_flagged": stale_sessions_flagged,
                }),
            )
            .with_program(plan.program_id.as_ref())
            .with_agent(agent);
            Ok((
                AgentInitialisation {
                    session,
                    validation,
                    pending_notes,
                    limit_flags,
                    stale_sessions_flagged,
                },
                Some(event),
            ))
        })
    }

    /// Closes a session with its summary and usage figures.
    pub fn complete_agent(
        &mut self,
        session_id: &SessionId,
        completion: &SessionCompletion,
    ) -> Result<AgentSession> {
        completion.validate()?;
        let plan_id = self.read(|conn| Ok(require_session(conn, session_id)?.plan_id))?;

        self.write(&[plan_key(&plan_id)], |tx, now| {
            let mut session = require_session(tx, session_id)?;
            if !session.is_open() {
                return Err(KernelError::Validation(format!(
                    "session {session_id} is already completed"
                ))
                .into());
            }
            tx.execute(
                "UPDATE agent_sessions
                 SET completed_at = ?2, summary = ?3, steps_completed = ?4, tokens_used = ?5
                 WHERE session_id = ?1",
                params![
                    session_id.as_str(),
                    format_time(now)?,
                    completion.summary.trim(),
                    completion.steps_completed,
                    sql_u64(completion.tokens_used)?,
                ],
            )
            .context("failed to complete session")?;
            for path in &completion.files_touched {
                tx.execute(
                    "INSERT OR IGNORE INTO session_files(session_id, path) VALUES (?1, ?2)",
                    params![session_id.as_str(), path.trim()],
                )
                .context("failed to record touched file")?;
            }
            let offset = session.artifacts.len();
            for (position, artifact) in completion.artifacts.iter().enumerate() {
                tx.execute(
                    "INSERT INTO session_artifacts(session_id, position, artifact) VALUES (?1, ?2, ?3)",
                    params![session_id.as_str(), crate::sql_int(offset + position)?, artifact],
                )
                .context("failed to record artifact")?;
            }
            session = require_session(tx, session_id)?;

            let event = PendingEvent::plan(
                "agent_completed",
                &session.plan_id,
                json!({
                    "session_id": session.id,
                    "steps_completed": session.steps_completed,
                    "tokens_used": session.tokens_used,
                }),
            )
            .with_agent(session.agent_type);
            Ok((session, Some(event)))
        })
    }

    /// Records a transfer of control. Only hubs and the roles listed in the
    /// sender's `must_handoff_to` are accepted.
    pub fn handoff(&mut self, plan_id: &PlanId, request: &HandoffRequest) -> Result<HandoffOutcome> {
        validate_handoff(request.from, request.to)?;
        let data = request.normalized_data()?;

        self.write(&[plan_key(plan_id)], |tx, now| {
            let plan = require_plan(tx, plan_id)?;
            plan.ensure_mutable()?;

            let previous: Option<String> = tx
                .query_row(
                    "SELECT recorded_at FROM lineage WHERE plan_id = ?1 ORDER BY seq DESC LIMIT 1",
                    params![plan_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read previous lineage entry")?;
            let previous = previous
                .map(|raw| plan_kernel_core::parse_rfc3339_utc(&raw))
                .transpose()?;
            let timestamp = next_lineage_timestamp(previous, now);

            tx.execute(
                "INSERT INTO lineage(plan_id, from_agent, to_agent, reason, data_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    plan_id.as_str(),
                    request.from.as_str(),
                    request.to.as_str(),
                    request.reason.trim(),
                    serde_json::to_string(&data).context("failed to serialize handoff data")?,
                    format_time(timestamp)?,
                ],
            )
            .context("failed to append lineage")?;
            let lineage = LineageEntry {
                seq: tx.last_insert_rowid(),
                plan_id: plan_id.clone(),
                from_agent: request.from,
                to_agent: request.to,
                reason: request.reason.trim().to_string(),
                data,
                timestamp,
            };

            tx.execute(
                "UPDATE plans SET current_agent = ?2, updated_at = ?3 WHERE plan_id = ?1",
                params![plan_id.as_str(), request.to.as_str(), format_time(now)?],
            )
            .context("failed to set current agent")?;

            let limit_flags = if request.from == AgentType::Worker {
                record_worker_breaches(tx, plan_id, now)?
            } else {
                Vec::new()
            };

            let event = PendingEvent::plan(
                "handoff",
                plan_id,
                json!({
                    "seq": lineage.seq,
                    "from": request.from,
                    "to": request.to,
                    "limit_flags": limit_flags.len(),
                }),
            )
            .with_program(plan.program_id.as_ref())
            .with_agent(request.from);
            Ok((
                HandoffOutcome {
                    lineage,
                    limit_flags,
                },
                Some(event),
            ))
        })
    }

    /// Marks open sessions older than `threshold` as orphaned. Sessions are
    /// never deleted.
    pub fn sweep_stale_sessions(&mut self, threshold: time::Duration) -> Result<Vec<SessionId>> {
        self.write(&[], |tx, now| {
            let flagged = flag_stale_sessions(tx, None, now, threshold)?;
            let event = (!flagged.is_empty()).then(|| {
                PendingEvent::workspace("sessions_swept", json!({ "flagged": flagged }))
            });
            Ok((flagged, event))
        })
    }

    pub fn list_sessions(&self, plan_id: &PlanId) -> Result<Vec<AgentSession>> {
        self.read(|conn| {
            require_plan(conn, plan_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS}
                 FROM agent_sessions
                 WHERE plan_id = ?1
                 ORDER BY started_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(params![plan_id.as_str()], parse_session_row)?;
            let mut sessions = collect_rows(rows)?;
            for session in &mut sessions {
                load_session_children(conn, session)?;
            }
            Ok(sessions)
        })
    }

    /// Lineage entries for a plan in append order. Entries survive plan
    /// deletion.
    pub fn get_lineage(&self, plan_id: &PlanId) -> Result<Vec<LineageEntry>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, plan_id, from_agent, to_agent, reason, data_json, recorded_at
                 FROM lineage
                 WHERE plan_id = ?1
                 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![plan_id.as_str()], |row| {
                let raw: String = row.get(5)?;
                let data = serde_json::from_str(&raw).map_err(|err| {
                    crate::invalid_column(5, rusqlite::types::Type::Text, format!("invalid data_json: {err}"))
                })?;
                Ok(LineageEntry {
                    seq: row.get(0)?,
                    plan_id: PlanId::from(row.get::<_, String>(1)?),
                    from_agent: enum_column(row, 2, "agent type", AgentType::parse)?,
                    to_agent: enum_column(row, 3, "agent type", AgentType::parse)?,
                    reason: row.get(4)?,
                    data,
                    timestamp: time_column(row, 6)?,
                })
            })?;
            collect_rows(rows)
        })
    }

    /// Returns unconsumed limit flags for the plan and marks them consumed.
    pub fn consume_limit_flags(&mut self, plan_id: &PlanId) -> Result<Vec<LimitFlag>> {
        self.write(&[plan_key(plan_id)], |tx, now| {
            require_plan(tx, plan_id)?;
            Ok((take_limit_flags(tx, plan_id, now)?, None))
        })
    }

    pub fn validate_agent_for_plan(&self, plan_id: &PlanId, agent: AgentType) -> Result<RoleValidation> {
        self.read(|conn| {
            let plan = require_plan(conn, plan_id)?;
            role_validation(conn, &plan, agent)
        })
    }

    pub fn add_build_script(&mut self, script: &NewBuildScript) -> Result<BuildScript> {
        script.validate()?;
        let keys: Vec<String> = script.plan_id.iter().map(plan_key).collect();
        self.write(&keys, |tx, now| {
            require_workspace(tx, &script.workspace_id)?;
            if let Some(plan_id) = &script.plan_id {
                let plan = require_plan(tx, plan_id)?;
                if plan.workspace_id != script.workspace_id {
                    return Err(KernelError::NotFound(format!(
                        "plan {plan_id} in workspace {}",
                        script.workspace_id
                    ))
                    .into());
                }
            }
            tx.execute(
                "INSERT INTO build_scripts(workspace_id, plan_id, name, command, directory, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    script.workspace_id.as_str(),
                    script.plan_id.as_ref().map(PlanId::as_str),
                    script.name.trim(),
                    script.command.trim(),
                    script.directory.trim(),
                    format_time(now)?,
                ],
            )
            .context("failed to insert build script")?;
            let created = BuildScript {
                id: tx.last_insert_rowid(),
                workspace_id: script.workspace_id.clone(),
                plan_id: script.plan_id.clone(),
                name: script.name.trim().to_string(),
                command: script.command.trim().to_string(),
                directory: script.directory.trim().to_string(),
                created_at: now,
            };
            let mut event = PendingEvent::workspace(
                "build_script_added",
                json!({ "script_id": created.id, "name": created.name }),
            );
            event.plan_id = created.plan_id.clone();
            Ok((created, Some(event)))
        })
    }

    /// Scripts of the workspace; with a plan, workspace-wide scripts plus the
    /// plan's own.
    pub fn list_build_scripts(
        &self,
        workspace_id: &WorkspaceId,
        plan_id: Option<&PlanId>,
    ) -> Result<Vec<BuildScript>> {
        self.read(|conn| load_build_scripts(conn, workspace_id, plan_id))
    }

    pub fn delete_build_script(&mut self, workspace_id: &WorkspaceId, script_id: i64) -> Result<()> {
        self.write(&[], |tx, _| {
            let removed = tx
                .execute(
                    "DELETE FROM build_scripts WHERE workspace_id = ?1 AND script_id = ?2",
                    params![workspace_id.as_str(), script_id],
                )
                .context("failed to delete build script")?;
            if removed == 0 {
                return Err(KernelError::NotFound(format!(
                    "build script {script_id} in workspace {workspace_id}"
                ))
                .into());
            }
            let event = PendingEvent::workspace(
                "build_script_deleted",
                json!({ "script_id": script_id, "workspace_id": workspace_id }),
            );
            Ok(((), Some(event)))
        })
    }
}

fn sql_u64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow::anyhow!("value {value} does not fit in an sqlite integer"))
}

fn u64_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw).map_err(|_| {
        crate::invalid_column(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid non-negative integer: {raw}"),
        )
    })
}

fn optional_u64_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Option<u64>> {
    match row.get::<_, Option<i64>>(index)? {
        None => Ok(None),
        Some(_) => u64_column(row, index).map(Some),
    }
}

fn role_validation(conn: &Connection, plan: &Plan, agent: AgentType) -> Result<RoleValidation> {
    let build_script_count = load_build_scripts(conn, &plan.workspace_id, Some(&plan.id))?.len();
    let confirmations = load_confirmations(conn, &plan.id)?;
    Ok(validate_agent(
        agent,
        &RoleContext {
            plan,
            build_script_count,
            confirmations: &confirmations,
        },
    ))
}

fn insert_session(tx: &Connection, session: &AgentSession) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO agent_sessions({SESSION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, 0, ?5, ?6, 0, 0)"
        ),
        params![
            session.id.as_str(),
            session.plan_id.as_str(),
            session.agent_type.as_str(),
            format_time(session.started_at)?,
            session.step_budget,
            session.token_budget.map(sql_u64).transpose()?,
        ],
    )
    .context("failed to insert agent session")?;
    for path in &session.declared_scope {
        tx.execute(
            "INSERT OR IGNORE INTO session_scope(session_id, path) VALUES (?1, ?2)",
            params![session.id.as_str(), path],
        )
        .context("failed to record session scope")?;
    }
    Ok(())
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentSession> {
    Ok(AgentSession {
        id: SessionId::from(row.get::<_, String>(0)?),
        plan_id: PlanId::from(row.get::<_, String>(1)?),
        agent_type: enum_column(row, 2, "agent type", AgentType::parse)?,
        started_at: time_column(row, 3)?,
        completed_at: optional_time_column(row, 4)?,
        summary: row.get(5)?,
        is_orphaned: row.get::<_, i64>(6)? != 0,
        step_budget: row.get(7)?,
        token_budget: optional_u64_column(row, 8)?,
        steps_completed: row.get(9)?,
        tokens_used: u64_column(row, 10)?,
        declared_scope: Vec::new(),
        files_touched: Vec::new(),
        artifacts: Vec::new(),
    })
}

fn load_strings(conn: &Connection, sql: &str, session_id: &SessionId) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![session_id.as_str()], |row| row.get::<_, String>(0))?;
    collect_rows(rows)
}

fn load_session_children(conn: &Connection, session: &mut AgentSession) -> Result<()> {
    session.declared_scope = load_strings(
        conn,
        "SELECT path FROM session_scope WHERE session_id = ?1 ORDER BY path ASC",
        &session.id,
    )?;
    session.files_touched = load_strings(
        conn,
        "SELECT path FROM session_files WHERE session_id = ?1 ORDER BY path ASC",
        &session.id,
    )?;
    session.artifacts = load_strings(
        conn,
        "SELECT artifact FROM session_artifacts WHERE session_id = ?1 ORDER BY position ASC",
        &session.id,
    )?;
    Ok(())
}

fn require_session(conn: &Connection, session_id: &SessionId) -> Result<AgentSession> {
    let session = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE session_id = ?1"),
            params![session_id.as_str()],
            parse_session_row,
        )
        .optional()
        .context("failed to load agent session")?;
    let Some(mut session) = session else {
        return Err(KernelError::NotFound(format!("session {session_id}")).into());
    };
    load_session_children(conn, &mut session)?;
    Ok(session)
}

/// Flags open, stale sessions as orphaned, optionally limited to one plan.
fn flag_stale_sessions(
    tx: &Connection,
    plan_id: Option<&PlanId>,
    now: OffsetDateTime,
    threshold: time::Duration,
) -> Result<Vec<SessionId>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {SESSION_COLUMNS}
         FROM agent_sessions
         WHERE completed_at IS NULL AND is_orphaned = 0 AND (?1 IS NULL OR plan_id = ?1)
         ORDER BY started_at ASC"
    ))?;
    let rows = stmt.query_map(params![plan_id.map(PlanId::as_str)], parse_session_row)?;
    let stale: Vec<SessionId> = collect_rows(rows)?
        .into_iter()
        .filter(|session| is_session_stale(session, now, threshold))
        .map(|session| session.id)
        .collect();

    for session_id in &stale {
        tx.execute(
            "UPDATE agent_sessions SET is_orphaned = ?2 WHERE session_id = ?1",
            params![session_id.as_str(), bool_to_sql(true)],
        )
        .context("failed to flag stale session")?;
        warn!(session_id = %session_id, "flagged stale agent session as orphaned");
    }
    Ok(stale)
}

/// Checks the worker's latest session on the plan against its budgets and
/// declared scope and stores one flag per breach.
fn record_worker_breaches(
    tx: &Connection,
    plan_id: &PlanId,
    now: OffsetDateTime,
) -> Result<Vec<LimitFlag>> {
    let latest = tx
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS}
                 FROM agent_sessions
                 WHERE plan_id = ?1 AND agent_type = ?2
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT 1"
            ),
            params![plan_id.as_str(), AgentType::Worker.as_str()],
            parse_session_row,
        )
        .optional()
        .context("failed to load latest worker session")?;
    let Some(mut session) = latest else {
        return Ok(Vec::new());
    };
    load_session_children(tx, &mut session)?;

    let mut flags = Vec::new();
    for breach in detect_limit_breaches(&session) {
        tx.execute(
            "INSERT INTO limit_flags(plan_id, session_id, agent_type, kind, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                plan_id.as_str(),
                session.id.as_str(),
                session.agent_type.as_str(),
                breach.kind.as_str(),
                breach.detail,
                format_time(now)?,
            ],
        )
        .context("failed to record limit flag")?;
        warn!(
            plan_id = %plan_id,
            session_id = %session.id,
            kind = breach.kind.as_str(),
            "worker exceeded its limits"
        );
        flags.push(LimitFlag {
            id: tx.last_insert_rowid(),
            plan_id: plan_id.clone(),
            session_id: session.id.clone(),
            agent_type: session.agent_type,
            kind: breach.kind,
            detail: breach.detail,
            created_at: now,
            consumed_at: None,
        });
    }
    Ok(flags)
}

fn take_limit_flags(tx: &Connection, plan_id: &PlanId, now: OffsetDateTime) -> Result<Vec<LimitFlag>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {LIMIT_FLAG_COLUMNS}
         FROM limit_flags
         WHERE plan_id = ?1 AND consumed_at IS NULL
         ORDER BY flag_id ASC"
    ))?;
    let rows = stmt.query_map(params![plan_id.as_str()], |row| {
        Ok(LimitFlag {
            id: row.get(0)?,
            plan_id: PlanId::from(row.get::<_, String>(1)?),
            session_id: SessionId::from(row.get::<_, String>(2)?),
            agent_type: enum_column(row, 3, "agent type", AgentType::parse)?,
            kind: enum_column(row, 4, "limit flag kind", LimitFlagKind::parse)?,
            detail: row.get(5)?,
            created_at: time_column(row, 6)?,
            consumed_at: optional_time_column(row, 7)?,
        })
    })?;
    let mut flags = collect_rows(rows)?;
    tx.execute(
        "UPDATE limit_flags SET consumed_at = ?2 WHERE plan_id = ?1 AND consumed_at IS NULL",
        params![plan_id.as_str(), format_time(now)?],
    )
    .context("failed to consume limit flags")?;
    for flag in &mut flags {
        flag.consumed_at = Some(now);
    }
    Ok(flags)
}

fn load_build_scripts(
    conn: &Connection,
    workspace_id: &WorkspaceId,
    plan_id: Option<&PlanId>,
) -> Result<Vec<BuildScript>> {
    let mut stmt = conn.prepare(
        "SELECT script_id, workspace_id, plan_id, name, command, directory, created_at
         FROM build_scripts
         WHERE workspace_id = ?1 AND (plan_id IS NULL OR ?2 IS NULL OR plan_id = ?2)
         ORDER BY script_id ASC",
    )?;
    let rows = stmt.query_map(
        params![workspace_id.as_str(), plan_id.map(PlanId::as_str)],
        |row| {
            Ok(BuildScript {
                id: row.get(0)?,
                workspace_id: WorkspaceId(row.get(1)?),
                plan_id: row.get::<_, Option<String>>(2)?.map(PlanId::from),
                name: row.get(3)?,
                command: row.get(4)?,
                directory: row.get(5)?,
                created_at: time_column(row, 6)?,
            })
        },
    )?;
    collect_rows(rows)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use plan_kernel_core::plan::{NewStep, NoteType, StepType};
    use plan_kernel_core::roles::RoleAction;
    use plan_kernel_core::KernelConfig;
    use serde_json::Value;

    use super::*;
    use crate::test_support::{
        fixture_plan, fixture_store, fixture_workspace, kernel_code, must, must_err, new_plan,
        temp_db_path,
    };
    use crate::StoreContext;

    fn request(from: AgentType, to: AgentType, reason: &str) -> HandoffRequest {
        HandoffRequest {
            from,
            to,
            reason: reason.to_string(),
            data: None,
        }
    }

    #[test]
    fn handoff_outside_boundaries_is_rejected_without_lineage() {
        let mut store = fixture_store();
        let workspace = fixture_workspace(&mut store);
        let plan = fixture_plan(&mut store, &workspace);

        let err = must_err(store.handoff(
            &plan.id,
            &request(AgentType::Tester, AgentType::Executor, "fix it yourself"),
        ));
        assert_eq!(kernel_code(&err), Some("boundary_violation"));
        assert!(must(store.get_lineage(&plan.id)).is_empty());

        let outcome = must(store.handoff(
            &plan.id,
            &request(AgentType::Tester, AgentType::Revisionist, "tests failing"),
        ));
        assert_eq!(outcome.lineage.to_agent, AgentType::Revisionist);
        assert_eq!(
            must(store.get_plan(&plan.id)).current_agent,
            Some(AgentType::Revisionist)
        );

        let bad_data = HandoffRequest {
            data: Some(Value::from(3)),
            ..request(AgentType::Revisionist, AgentType::Coordinator, "done")
        };
        let err = must_err(store.handoff(&plan.id, &bad_data));
        assert_eq!(kernel_code(&err), Some("validation"));
    }

    #[test]
    fn lineage_timestamps_strictly_increase() {
        let mut store = fixture_store();
        let workspace = fixture_workspace(&mut store);
        let plan = fixture_plan(&mut store, &workspace);

        for _ in 0..5 {
            must(store.handoff(
                &plan.id,
                &request(AgentType::Coordinator, AgentType::Executor, "implement"),
            ));
            must(store.handoff(
                &plan.id,
                &request(AgentType::Executor, AgentType::Coordinator, "implemented"),
            ));
        }
        let lineage = must(store.get_lineage(&plan.id));
        assert_eq!(lineage.len(), 10);
        for pair in lineage.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
            assert!(pair[0].seq < pair[1].seq);
        }
        assert_eq!(lineage[0].data, Value::Object(serde_json::Map::new()));
    }

    #[test]
    fn lineage_is_append_only() {
        let mut store = fixture_store();
        let workspace = fixture_workspace(&mut store);
        let plan = fixture_plan(&mut store, &workspace);
        must(store.handoff(
            &plan.id,
            &request(AgentType::Coordinator, AgentType::Architect, "design"),
        ));

        assert!(store
            .connection()
            .execute("UPDATE lineage SET reason = 'rewritten'", [])
            .is_err());
        assert!(store.connection().execute("DELETE FROM lineage", []).is_err());

        must(store.delete_plan(&plan.id));
        assert_eq!(must(store.get_lineage(&plan.id)).len(), 1);
    }

    #[test]
    fn initialise_hands_over_notes_and_sets_current_agent() {
        let mut store = fixture_store();
        let workspace = fixture_workspace(&mut store);
        let plan = fixture_plan(&mut store, &workspace);
        must(store.add_note(&plan.id, NoteType::Info, "staging is down until noon"));

        let init = must(store.initialise_agent(
            &plan.id,
            AgentType::Architect,
            &SessionStart::default(),
        ));
        assert_eq!(init.pending_notes.len(), 1);
        assert!(init.pending_notes[0].consumed_at.is_some());
        assert_eq!(init.validation.action, RoleAction::Continue);
        assert_eq!(must(store.get_plan(&plan.id)).current_agent, Some(AgentType::Architect));

        let again = must(store.initialise_agent(
            &plan.id,
            AgentType::Coordinator,
            &SessionStart::default(),
        ));
        assert!(again.pending_notes.is_empty());
        assert_eq!(must(store.list_sessions(&plan.id)).len(), 2);
    }

    #[test]
    fn completing_twice_is_rejected() {
        let mut store = fixture_store();
        let workspace = fixture_workspace(&mut store);
        let plan = fixture_plan(&mut store, &workspace);
        let init = must(store.initialise_agent(
            &plan.id,
            AgentType::Executor,
            &SessionStart::default(),
        ));

        let completion = SessionCompletion {
            summary: "implemented handlers".to_string(),
            artifacts: vec!["src/handlers.rs".to_string()],
            files_touched: vec!["src/handlers.rs".to_string()],
            steps_completed: 2,
            tokens_used: 12_000,
        };
        let closed = must(store.complete_agent(&init.session.id, &completion));
        assert!(!closed.is_open());
        assert_eq!(closed.artifacts, vec!["src/handlers.rs".to_string()]);
        assert_eq!(closed.tokens_used, 12_000);

        let err = must_err(store.complete_agent(&init.session.id, &completion));
        assert_eq!(kernel_code(&err), Some("validation"));
        let missing = must_err(store.complete_agent(&SessionId::from("sess_missing"), &completion));
        assert_eq!(kernel_code(&missing), Some("not_found"));
    }

    #[test]
    fn worker_breaches_become_flags_for_the_next_agent() {
        let mut store = fixture_store();
        let workspace = fixture_workspace(&mut store);
        let plan = fixture_plan(&mut store, &workspace);
        let init = must(store.initialise_agent(
            &plan.id,
            AgentType::Worker,
            &SessionStart {
                step_budget: Some(1),
                token_budget: Some(1_000),
                declared_scope: vec!["src/api".to_string()],
            },
        ));
        must(store.complete_agent(
            &init.session.id,
            &SessionCompletion {
                summary: "wired routes".to_string(),
                artifacts: Vec::new(),
                files_touched: vec!["src/api/routes.rs".to_string(), "Cargo.toml".to_string()],
                steps_completed: 3,
                tokens_used: 5_000,
            },
        ));

        let outcome = must(store.handoff(
            &plan.id,
            &request(AgentType::Worker, AgentType::Coordinator, "task finished"),
        ));
        let kinds: Vec<LimitFlagKind> = outcome.limit_flags.iter().map(|flag| flag.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LimitFlagKind::StepBudgetExceeded,
                LimitFlagKind::TokenBudgetExceeded,
                LimitFlagKind::ScopeEscalation,
            ]
        );

        let next = must(store.initialise_agent(
            &plan.id,
            AgentType::Coordinator,
            &SessionStart::default(),
        ));
        assert_eq!(next.limit_flags.len(), 3);
        assert!(must(store.consume_limit_flags(&plan.id)).is_empty());
    }

    #[test]
    fn stale_sessions_are_flagged_not_deleted() {
        let db_path = temp_db_path("stale");
        let context = must(StoreContext::new(&db_path, KernelConfig::default()));
        let mut store = must(context.connect());
        must(store.migrate());
        let workspace = fixture_workspace(&mut store);
        let plan = fixture_plan(&mut store, &workspace);
        let init = must(store.initialise_agent(
            &plan.id,
            AgentType::Executor,
            &SessionStart::default(),
        ));

        assert!(must(store.sweep_stale_sessions(time::Duration::hours(1))).is_empty());
        let flagged = must(store.sweep_stale_sessions(time::Duration::seconds(-1)));
        assert_eq!(flagged, vec![init.session.id.clone()]);

        let sessions = must(store.list_sessions(&plan.id));
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_orphaned);
        assert!(must(store.sweep_stale_sessions(time::Duration::seconds(-1))).is_empty());
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn reviewer_warns_without_build_scripts() {
        let mut store = fixture_store();
        let workspace = fixture_workspace(&mut store);
        let plan = must(store.create_plan(&new_plan(
            &workspace,
            "Review",
            vec![
                NewStep::new("review", "Build release artifacts", StepType::Build),
                NewStep::new("review", "Review diff", StepType::Validation),
            ],
        )));

        let validation = must(store.validate_agent_for_plan(&plan.id, AgentType::Reviewer));
        assert_eq!(validation.action, RoleAction::Continue);
        assert!(validation
            .warnings
            .iter()
            .any(|warning| warning.contains("no build scripts")));

        let script = must(store.add_build_script(&NewBuildScript {
            workspace_id: workspace.id.clone(),
            plan_id: Some(plan.id.clone()),
            name: "release".to_string(),
            command: "cargo build --release".to_string(),
            directory: ".".to_string(),
        }));
        let validation = must(store.validate_agent_for_plan(&plan.id, AgentType::Reviewer));
        assert!(validation.warnings.is_empty());
        assert_eq!(must(store.list_build_scripts(&workspace.id, None)).len(), 1);

        must(store.delete_build_script(&workspace.id, script.id));
        let err = must_err(store.delete_build_script(&workspace.id, script.id));
        assert_eq!(kernel_code(&err), Some("not_found"));
    }
}
