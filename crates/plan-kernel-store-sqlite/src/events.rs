use anyhow::{Context, Result};
use plan_kernel_core::roles::AgentType;
use plan_kernel_core::{now_utc, PlanId, ProgramId};
use rusqlite::{params, Connection};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;
use ulid::Ulid;

use crate::{
    collect_rows, format_time, optional_enum_column, time_column, SqlitePlanStore,
};

/// A committed mutation as seen by the event log and by sinks.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct PlanEvent {
    /// Zero when the event could not be written to `plan_events`.
    pub seq: i64,
    pub event_id: String,
    pub plan_id: Option<PlanId>,
    pub program_id: Option<ProgramId>,
    pub event_type: String,
    pub agent: Option<AgentType>,
    pub payload: Value,
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event_type: &'static str,
    pub plan_id: Option<PlanId>,
    pub program_id: Option<ProgramId>,
    pub agent: Option<AgentType>,
    pub payload: Value,
}

impl PendingEvent {
    #[must_use]
    pub fn plan(event_type: &'static str, plan_id: &PlanId, payload: Value) -> Self {
        Self {
            event_type,
            plan_id: Some(plan_id.clone()),
            program_id: None,
            agent: None,
            payload,
        }
    }

    #[must_use]
    pub fn program(event_type: &'static str, program_id: &ProgramId, payload: Value) -> Self {
        Self {
            event_type,
            plan_id: None,
            program_id: Some(program_id.clone()),
            agent: None,
            payload,
        }
    }

    #[must_use]
    pub fn workspace(event_type: &'static str, payload: Value) -> Self {
        Self {
            event_type,
            plan_id: None,
            program_id: None,
            agent: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_program(mut self, program_id: Option<&ProgramId>) -> Self {
        self.program_id = program_id.cloned();
        self
    }

    #[must_use]
    pub fn with_agent(mut self, agent: AgentType) -> Self {
        self.agent = Some(agent);
        self
    }
}

/// Receives a copy of every committed event. Delivery is fire-and-forget:
/// errors are logged and never reach the caller of the mutation.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &PlanEvent) -> Result<()>;
}

fn insert_event(conn: &Connection, event: &PlanEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO plan_events(event_id, plan_id, program_id, event_type, agent, payload_json, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.plan_id.as_ref().map(PlanId::as_str),
            event.program_id.as_ref().map(ProgramId::as_str),
            event.event_type,
            event.agent.map(AgentType::as_str),
            serde_json::to_string(&event.payload).context("failed to serialize event payload")?,
            format_time(event.recorded_at)?,
        ],
    )
    .context("failed to append plan event")?;
    Ok(conn.last_insert_rowid())
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanEvent> {
    let payload_raw: String = row.get(6)?;
    let payload = serde_json::from_str(&payload_raw).map_err(|err| {
        crate::invalid_column(6, rusqlite::types::Type::Text, format!("invalid payload_json: {err}"))
    })?;
    Ok(PlanEvent {
        seq: row.get(0)?,
        event_id: row.get(1)?,
        plan_id: row.get::<_, Option<String>>(2)?.map(PlanId::from),
        program_id: row.get::<_, Option<String>>(3)?.map(ProgramId::from),
        event_type: row.get(4)?,
        agent: optional_enum_column(row, 5, "agent", AgentType::parse)?,
        payload,
        recorded_at: time_column(row, 7)?,
    })
}

impl SqlitePlanStore {
    /// Records `pending` in `plan_events` and hands it to every sink.
    /// Failures are logged and swallowed.
    pub(crate) fn emit(&self, pending: PendingEvent) {
        let mut event = PlanEvent {
            seq: 0,
            event_id: Ulid::new().to_string().to_lowercase(),
            plan_id: pending.plan_id,
            program_id: pending.program_id,
            event_type: pending.event_type.to_string(),
            agent: pending.agent,
            payload: pending.payload,
            recorded_at: now_utc(),
        };

        match insert_event(&self.conn, &event) {
            Ok(seq) => event.seq = seq,
            Err(err) => warn!(
                event_type = %event.event_type,
                error = %format!("{err:#}"),
                "failed to record plan event"
            ),
        }

        for sink in &self.sinks {
            if let Err(err) = sink.deliver(&event) {
                warn!(
                    event_type = %event.event_type,
                    error = %format!("{err:#}"),
                    "event sink delivery failed"
                );
            }
        }
    }

    pub fn list_events(
        &self,
        plan_id: Option<&PlanId>,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<PlanEvent>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_seq, event_id, plan_id, program_id, event_type, agent, payload_json, recorded_at
                 FROM plan_events
                 WHERE event_seq > ?1 AND (?2 IS NULL OR plan_id = ?2)
                 ORDER BY event_seq ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![
                    after_seq,
                    plan_id.map(PlanId::as_str),
                    crate::sql_int(limit)?
                ],
                parse_event_row,
            )?;
            collect_rows(rows)
        })
    }
}
