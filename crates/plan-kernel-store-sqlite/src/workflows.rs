use anyhow::{Context, Result};
use plan_kernel_core::roles::AgentType;
use plan_kernel_core::workflow::{
    normalize_category, resolve_category_workflow, PlanningDepth, WorkflowConfig,
    WorkflowDefinition, WorkflowResolution,
};
use plan_kernel_core::KernelError;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use crate::locks::workflow_key;
use crate::{bool_to_sql, collect_rows, enum_column, format_time, sql_int, time_column};
use crate::{PendingEvent, SqlitePlanStore};

fn required_category(category: &str) -> Result<String> {
    normalize_category(category).ok_or_else(|| {
        KernelError::Validation("workflow category MUST be provided".to_string()).into()
    })
}

impl SqlitePlanStore {
    /// Stores (or replaces) the routing for a category.
    pub fn set_workflow_definition(
        &mut self,
        category: &str,
        config: &WorkflowConfig,
    ) -> Result<WorkflowDefinition> {
        let category = required_category(category)?;
        config.validate()?;

        self.write(&[workflow_key(&category)], |tx, now| {
            tx.execute(
                "INSERT INTO workflow_definitions(category, planning_depth, requires_research, requires_brainstorm, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(category) DO UPDATE SET
                   planning_depth = excluded.planning_depth,
                   requires_research = excluded.requires_research,
                   requires_brainstorm = excluded.requires_brainstorm,
                   updated_at = excluded.updated_at",
                params![
                    category,
                    config.planning_depth.as_str(),
                    bool_to_sql(config.requires_research),
                    bool_to_sql(config.requires_brainstorm),
                    format_time(now)?,
                ],
            )
            .context("failed to upsert workflow definition")?;
            tx.execute(
                "DELETE FROM workflow_definition_path WHERE category = ?1",
                params![category],
            )
            .context("failed to clear workflow path")?;
            tx.execute(
                "DELETE FROM workflow_definition_skips WHERE category = ?1",
                params![category],
            )
            .context("failed to clear workflow skips")?;
            for (position, agent) in config.workflow_path.iter().enumerate() {
                tx.execute(
                    "INSERT INTO workflow_definition_path(category, position, agent_type) VALUES (?1, ?2, ?3)",
                    params![category, sql_int(position)?, agent.as_str()],
                )
                .context("failed to write workflow path")?;
            }
            for agent in &config.skip_agents {
                tx.execute(
                    "INSERT OR IGNORE INTO workflow_definition_skips(category, agent_type) VALUES (?1, ?2)",
                    params![category, agent.as_str()],
                )
                .context("failed to write workflow skip")?;
            }

            let definition = require_definition(tx, &category)?;
            let event = PendingEvent::workspace(
                "workflow_definition_set",
                json!({ "category": category, "planning_depth": config.planning_depth }),
            );
            Ok((definition, Some(event)))
        })
    }

    pub fn get_workflow_definition(&self, category: &str) -> Result<WorkflowDefinition> {
        let category = required_category(category)?;
        self.read(|conn| require_definition(conn, &category))
    }

    pub fn delete_workflow_definition(&mut self, category: &str) -> Result<()> {
        let category = required_category(category)?;
        self.write(&[workflow_key(&category)], |tx, _| {
            let removed = tx
                .execute(
                    "DELETE FROM workflow_definitions WHERE category = ?1",
                    params![category],
                )
                .context("failed to delete workflow definition")?;
            if removed == 0 {
                return Err(KernelError::NotFound(format!("workflow definition {category}")).into());
            }
            let event = PendingEvent::workspace(
                "workflow_definition_deleted",
                json!({ "category": category }),
            );
            Ok(((), Some(event)))
        })
    }

    pub fn list_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT category FROM workflow_definitions ORDER BY category ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            collect_rows(rows)?
                .iter()
                .map(|category| require_definition(conn, category))
                .collect()
        })
    }

    /// Resolves routing for a category: explicit routing first, then a
    /// stored definition, then the built-in table.
    pub fn resolve_category_workflow(
        &self,
        category: Option<&str>,
        explicit: Option<WorkflowConfig>,
    ) -> Result<WorkflowResolution> {
        self.read(|conn| {
            resolve_category_workflow(category, explicit, |name| {
                Ok(load_definition(conn, name)?.map(|definition| definition.config))
            })
        })
    }
}

fn load_agents(conn: &Connection, sql: &str, category: &str) -> Result<Vec<AgentType>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![category], |row| {
        enum_column(row, 0, "agent type", AgentType::parse)
    })?;
    collect_rows(rows)
}

fn load_definition(conn: &Connection, category: &str) -> Result<Option<WorkflowDefinition>> {
    let header = conn
        .query_row(
            "SELECT planning_depth, requires_research, requires_brainstorm, updated_at
             FROM workflow_definitions
             WHERE category = ?1",
            params![category],
            |row| {
                Ok((
                    enum_column(row, 0, "planning depth", PlanningDepth::parse)?,
                    row.get::<_, i64>(1)? != 0,
                    row.get::<_, i64>(2)? != 0,
                    time_column(row, 3)?,
                ))
            },
        )
        .optional()
        .context("failed to load workflow definition")?;
    let Some((planning_depth, requires_research, requires_brainstorm, updated_at)) = header else {
        return Ok(None);
    };

    let workflow_path = load_agents(
        conn,
        "SELECT agent_type FROM workflow_definition_path WHERE category = ?1 ORDER BY position ASC",
        category,
    )?;
    let skip_agents = load_agents(
        conn,
        "SELECT agent_type FROM workflow_definition_skips WHERE category = ?1 ORDER BY agent_type ASC",
        category,
    )?;

    Ok(Some(WorkflowDefinition {
        category: category.to_string(),
        config: WorkflowConfig {
            planning_depth,
            workflow_path,
            skip_agents,
            requires_research,
            requires_brainstorm,
        },
        updated_at,
    }))
}

fn require_definition(conn: &Connection, category: &str) -> Result<WorkflowDefinition> {
    load_definition(conn, category)?
        .ok_or_else(|| KernelError::NotFound(format!("workflow definition {category}")).into())
}
