//! Ordered, append-only schema migrations.
//!
//! Entries are never edited or reordered once released; new schema goes in a
//! new entry with the next version.

use anyhow::{anyhow, Context, Result};
use plan_kernel_core::{format_rfc3339, now_utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::info;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core_plans_programs",
        sql: SCHEMA_V1,
    },
    Migration {
        version: 2,
        name: "agent_sessions_lineage",
        sql: SCHEMA_V2,
    },
    Migration {
        version: 3,
        name: "workflow_definitions_events",
        sql: SCHEMA_V3,
    },
];

#[must_use]
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS workspaces (
  workspace_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  path TEXT NOT NULL,
  registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS programs (
  program_id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL REFERENCES workspaces(workspace_id),
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL CHECK (status IN ('active', 'archived')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS plans (
  plan_id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL REFERENCES workspaces(workspace_id),
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL CHECK (status IN ('active', 'paused', 'completed', 'archived')),
  category TEXT,
  priority TEXT NOT NULL CHECK (priority IN ('low', 'medium', 'high', 'critical')),
  schema_version INTEGER,
  current_phase TEXT,
  current_agent TEXT,
  program_id TEXT REFERENCES programs(program_id),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_plans_workspace ON plans(workspace_id, status);

CREATE TABLE IF NOT EXISTS plan_phases (
  plan_id TEXT NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
  position INTEGER NOT NULL CHECK (position >= 0),
  name TEXT NOT NULL,
  PRIMARY KEY (plan_id, position),
  UNIQUE (plan_id, name)
);

CREATE TABLE IF NOT EXISTS steps (
  step_id TEXT PRIMARY KEY,
  plan_id TEXT NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
  step_index INTEGER NOT NULL,
  phase TEXT NOT NULL,
  task TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending', 'active', 'done', 'blocked')),
  step_type TEXT NOT NULL,
  notes TEXT,
  assignee TEXT,
  completed_at TEXT,
  UNIQUE (plan_id, step_index)
);

CREATE TABLE IF NOT EXISTS step_confirmations (
  confirmation_id INTEGER PRIMARY KEY AUTOINCREMENT,
  plan_id TEXT NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
  phase TEXT NOT NULL,
  step_id TEXT,
  confirmed_by TEXT NOT NULL,
  confirmed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS plan_notes (
  note_id INTEGER PRIMARY KEY AUTOINCREMENT,
  plan_id TEXT NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
  note_type TEXT NOT NULL,
  message TEXT NOT NULL,
  created_at TEXT NOT NULL,
  consumed_at TEXT
);

CREATE TABLE IF NOT EXISTS step_consolidations (
  consolidation_id INTEGER PRIMARY KEY AUTOINCREMENT,
  plan_id TEXT NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
  merged_step_id TEXT NOT NULL,
  task TEXT NOT NULL,
  consolidated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS step_consolidation_sources (
  consolidation_id INTEGER NOT NULL REFERENCES step_consolidations(consolidation_id) ON DELETE CASCADE,
  original_index INTEGER NOT NULL,
  original_task TEXT NOT NULL,
  PRIMARY KEY (consolidation_id, original_index)
);

CREATE TABLE IF NOT EXISTS archived_plans (
  plan_id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL,
  title TEXT NOT NULL,
  description TEXT NOT NULL,
  status TEXT NOT NULL,
  category TEXT,
  priority TEXT NOT NULL,
  schema_version INTEGER,
  current_phase TEXT,
  current_agent TEXT,
  program_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  reason TEXT NOT NULL CHECK (reason IN ('archived', 'deleted')),
  archived_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS archived_plan_phases (
  plan_id TEXT NOT NULL REFERENCES archived_plans(plan_id) ON DELETE CASCADE,
  position INTEGER NOT NULL,
  name TEXT NOT NULL,
  PRIMARY KEY (plan_id, position)
);

CREATE TABLE IF NOT EXISTS archived_steps (
  plan_id TEXT NOT NULL REFERENCES archived_plans(plan_id) ON DELETE CASCADE,
  step_id TEXT NOT NULL,
  step_index INTEGER NOT NULL,
  phase TEXT NOT NULL,
  task TEXT NOT NULL,
  status TEXT NOT NULL,
  step_type TEXT NOT NULL,
  notes TEXT,
  assignee TEXT,
  completed_at TEXT,
  PRIMARY KEY (plan_id, step_id)
);

CREATE TABLE IF NOT EXISTS program_plans (
  program_id TEXT NOT NULL REFERENCES programs(program_id) ON DELETE CASCADE,
  plan_id TEXT NOT NULL UNIQUE REFERENCES plans(plan_id),
  position INTEGER NOT NULL,
  PRIMARY KEY (program_id, plan_id)
);

CREATE TABLE IF NOT EXISTS program_dependencies (
  dependency_id INTEGER PRIMARY KEY AUTOINCREMENT,
  program_id TEXT NOT NULL REFERENCES programs(program_id) ON DELETE CASCADE,
  source_plan_id TEXT NOT NULL,
  source_phase TEXT NOT NULL,
  target_plan_id TEXT NOT NULL,
  target_phase TEXT,
  dependency_type TEXT NOT NULL CHECK (dependency_type IN ('blocks', 'informs')),
  status TEXT NOT NULL CHECK (status IN ('pending', 'satisfied')),
  created_at TEXT NOT NULL,
  satisfied_at TEXT,
  CHECK (source_plan_id <> target_plan_id)
);

CREATE INDEX IF NOT EXISTS idx_program_dependencies_source
  ON program_dependencies(program_id, source_plan_id, source_phase);

CREATE TABLE IF NOT EXISTS program_risks (
  risk_id INTEGER PRIMARY KEY AUTOINCREMENT,
  program_id TEXT NOT NULL REFERENCES programs(program_id) ON DELETE CASCADE,
  title TEXT NOT NULL,
  risk_type TEXT NOT NULL CHECK (risk_type IN ('conflict', 'behavior_change', 'dependency', 'other')),
  severity TEXT NOT NULL CHECK (severity IN ('low', 'medium', 'high', 'critical')),
  description TEXT NOT NULL,
  source_plan_id TEXT,
  detected_by TEXT NOT NULL CHECK (detected_by IN ('auto', 'manual')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS risk_affected_plans (
  risk_id INTEGER NOT NULL REFERENCES program_risks(risk_id) ON DELETE CASCADE,
  plan_id TEXT NOT NULL,
  PRIMARY KEY (risk_id, plan_id)
);
";

const SCHEMA_V2: &str = r"
CREATE TABLE IF NOT EXISTS agent_sessions (
  session_id TEXT PRIMARY KEY,
  plan_id TEXT NOT NULL,
  agent_type TEXT NOT NULL,
  started_at TEXT NOT NULL,
  completed_at TEXT,
  summary TEXT,
  is_orphaned INTEGER NOT NULL DEFAULT 0 CHECK (is_orphaned IN (0, 1)),
  step_budget INTEGER,
  token_budget INTEGER,
  steps_completed INTEGER NOT NULL DEFAULT 0,
  tokens_used INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_agent_sessions_plan ON agent_sessions(plan_id, started_at);

CREATE TABLE IF NOT EXISTS session_scope (
  session_id TEXT NOT NULL REFERENCES agent_sessions(session_id) ON DELETE CASCADE,
  path TEXT NOT NULL,
  PRIMARY KEY (session_id, path)
);

CREATE TABLE IF NOT EXISTS session_files (
  session_id TEXT NOT NULL REFERENCES agent_sessions(session_id) ON DELETE CASCADE,
  path TEXT NOT NULL,
  PRIMARY KEY (session_id, path)
);

CREATE TABLE IF NOT EXISTS session_artifacts (
  session_id TEXT NOT NULL REFERENCES agent_sessions(session_id) ON DELETE CASCADE,
  position INTEGER NOT NULL,
  artifact TEXT NOT NULL,
  PRIMARY KEY (session_id, position)
);

CREATE TABLE IF NOT EXISTS lineage (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  plan_id TEXT NOT NULL,
  from_agent TEXT NOT NULL,
  to_agent TEXT NOT NULL,
  reason TEXT NOT NULL,
  data_json TEXT NOT NULL DEFAULT '{}' CHECK (json_valid(data_json)),
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lineage_plan_seq ON lineage(plan_id, seq);

CREATE TRIGGER IF NOT EXISTS trg_lineage_no_update
BEFORE UPDATE ON lineage
BEGIN
  SELECT RAISE(FAIL, 'lineage is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_lineage_no_delete
BEFORE DELETE ON lineage
BEGIN
  SELECT RAISE(FAIL, 'lineage is append-only');
END;

CREATE TABLE IF NOT EXISTS limit_flags (
  flag_id INTEGER PRIMARY KEY AUTOINCREMENT,
  plan_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  agent_type TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('step_budget_exceeded', 'token_budget_exceeded', 'scope_escalation')),
  detail TEXT NOT NULL,
  created_at TEXT NOT NULL,
  consumed_at TEXT
);

CREATE TABLE IF NOT EXISTS build_scripts (
  script_id INTEGER PRIMARY KEY AUTOINCREMENT,
  workspace_id TEXT NOT NULL REFERENCES workspaces(workspace_id),
  plan_id TEXT,
  name TEXT NOT NULL,
  command TEXT NOT NULL,
  directory TEXT NOT NULL,
  created_at TEXT NOT NULL
);
";

const SCHEMA_V3: &str = r"
CREATE TABLE IF NOT EXISTS workflow_definitions (
  category TEXT PRIMARY KEY,
  planning_depth TEXT NOT NULL CHECK (planning_depth IN ('none', 'light', 'standard', 'deep')),
  requires_research INTEGER NOT NULL CHECK (requires_research IN (0, 1)),
  requires_brainstorm INTEGER NOT NULL CHECK (requires_brainstorm IN (0, 1)),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_definition_path (
  category TEXT NOT NULL REFERENCES workflow_definitions(category) ON DELETE CASCADE,
  position INTEGER NOT NULL,
  agent_type TEXT NOT NULL,
  PRIMARY KEY (category, position)
);

CREATE TABLE IF NOT EXISTS workflow_definition_skips (
  category TEXT NOT NULL REFERENCES workflow_definitions(category) ON DELETE CASCADE,
  agent_type TEXT NOT NULL,
  PRIMARY KEY (category, agent_type)
);

CREATE TABLE IF NOT EXISTS plan_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  plan_id TEXT,
  program_id TEXT,
  event_type TEXT NOT NULL,
  agent TEXT,
  payload_json TEXT NOT NULL DEFAULT '{}' CHECK (json_valid(payload_json)),
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_plan_events_plan_seq ON plan_events(plan_id, event_seq);

CREATE TRIGGER IF NOT EXISTS trg_plan_events_no_update
BEFORE UPDATE ON plan_events
BEGIN
  SELECT RAISE(FAIL, 'plan_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_plan_events_no_delete
BEFORE DELETE ON plan_events
BEGIN
  SELECT RAISE(FAIL, 'plan_events is append-only');
END;
";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: String,
}

/// Applies every pending migration, each in its own transaction.
///
/// Returns the versions applied by this call; an up-to-date database yields
/// an empty list.
pub fn run_migrations(conn: &mut Connection) -> Result<Vec<i64>> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .context("failed to ensure schema_migrations exists")?;

    let recorded: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .optional()
        .context("failed to read schema_migrations")?
        .flatten();
    let known = latest_version();
    if let Some(recorded) = recorded {
        if recorded > known {
            return Err(anyhow!(
                "database schema version {recorded} is newer than this binary supports ({known})"
            ));
        }
    }

    let mut applied = Vec::new();
    for migration in MIGRATIONS {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start migration {}", migration.version))?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1",
                params![migration.version],
                |_| Ok(()),
            )
            .optional()
            .context("failed to query schema_migrations")?
            .is_some();
        if exists {
            continue;
        }

        tx.execute_batch(migration.sql)
            .with_context(|| format!("failed to apply migration {} ({})", migration.version, migration.name))?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        tx.execute(
            "INSERT INTO schema_migrations(version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, now],
        )
        .with_context(|| format!("failed to record migration {}", migration.version))?;
        tx.commit()
            .with_context(|| format!("failed to commit migration {}", migration.version))?;

        info!(version = migration.version, name = migration.name, "applied schema migration");
        applied.push(migration.version);
    }

    Ok(applied)
}

pub fn applied_migrations(conn: &Connection) -> Result<Vec<AppliedMigration>> {
    let mut stmt = conn
        .prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version ASC")
        .context("failed to prepare schema_migrations query")?;
    let rows = stmt.query_map([], |row| {
        Ok(AppliedMigration {
            version: row.get(0)?,
            name: row.get(1)?,
            applied_at: row.get(2)?,
        })
    })?;
    crate::collect_rows(rows)
}
