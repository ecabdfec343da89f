#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite persistence for the plan kernel.
//!
//! Every mutation takes the entity lock(s) for the plan or program it
//! touches, then runs inside one `IMMEDIATE` transaction. Events are written
//! and forwarded only after that transaction commits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use plan_kernel_core::{format_rfc3339, now_utc, parse_rfc3339_utc, KernelConfig};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tracing::info;

mod agents;
pub mod approval;
mod events;
pub mod locks;
pub mod migrations;
mod plans;
mod programs;
mod workflows;

pub use agents::{AgentInitialisation, BuildScript, HandoffOutcome, NewBuildScript};
pub use approval::TcpApprovalOracle;
pub use events::{EventSink, PendingEvent, PlanEvent};
pub use locks::{EntityLockGuard, EntityLocks, LegacyFileLock};
pub use migrations::AppliedMigration;
pub use plans::{StepMutation, StepPosition};
pub use programs::{ProgramDetail, RiskInsert};

/// Shared wiring built once at startup: database location, the in-process
/// lock table and configuration. Each thread opens its own connection from
/// it.
#[derive(Clone)]
pub struct StoreContext {
    db_path: PathBuf,
    locks: Arc<EntityLocks>,
    config: KernelConfig,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl StoreContext {
    pub fn new(db_path: impl Into<PathBuf>, config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let locks = Arc::new(EntityLocks::new(&config));
        Ok(Self {
            db_path: db_path.into(),
            locks,
            config,
            sinks: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn connect(&self) -> Result<SqlitePlanStore> {
        SqlitePlanStore::open_with(
            &self.db_path,
            self.config.clone(),
            Arc::clone(&self.locks),
            self.sinks.clone(),
        )
    }
}

pub struct SqlitePlanStore {
    conn: Connection,
    locks: Arc<EntityLocks>,
    config: KernelConfig,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SqlitePlanStore {
    /// Opens a store with default configuration and a private lock table.
    pub fn open(path: &Path) -> Result<Self> {
        let config = KernelConfig::default();
        let locks = Arc::new(EntityLocks::new(&config));
        Self::open_with(path, config, locks, Vec::new())
    }

    pub fn open_with(
        path: &Path,
        config: KernelConfig,
        locks: Arc<EntityLocks>,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            locks,
            config,
            sinks,
        })
    }

    pub fn migrate(&mut self) -> Result<Vec<i64>> {
        migrations::run_migrations(&mut self.conn)
    }

    pub fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        self.read(migrations::applied_migrations)
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Runs `op` under the given entity locks inside an `IMMEDIATE`
    /// transaction. The returned event is recorded after commit.
    pub(crate) fn write<T>(
        &mut self,
        keys: &[String],
        op: impl FnOnce(&Transaction<'_>, OffsetDateTime) -> Result<(T, Option<PendingEvent>)>,
    ) -> Result<T> {
        self.write_all(keys, |tx, now| {
            op(tx, now).map(|(value, event)| (value, event.into_iter().collect()))
        })
    }

    /// Like [`Self::write`], for mutations that emit several events. They are
    /// recorded in order after the commit.
    pub(crate) fn write_all<T>(
        &mut self,
        keys: &[String],
        op: impl FnOnce(&Transaction<'_>, OffsetDateTime) -> Result<(T, Vec<PendingEvent>)>,
    ) -> Result<T> {
        let guard = self.locks.acquire(keys)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start write transaction")?;
        let (value, events) = op(&tx, now_utc())?;
        tx.commit().context("failed to commit write transaction")?;
        drop(guard);

        for event in events {
            info!(
                event_type = event.event_type,
                plan_id = ?event.plan_id,
                program_id = ?event.program_id,
                "committed mutation"
            );
            self.emit(event);
        }
        Ok(value)
    }

    /// Runs `op` inside a deferred transaction so multi-statement reads see
    /// one snapshot.
    pub(crate) fn read<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start read transaction")?;
        let value = op(&tx)?;
        tx.commit().context("failed to finish read transaction")?;
        Ok(value)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_int(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} does not fit in an sqlite integer"))
}

fn format_time(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn format_optional_time(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(format_time).transpose()
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn time_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| {
        invalid_column(index, rusqlite::types::Type::Text, err.to_string())
    })
}

fn optional_time_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| {
        parse_rfc3339_utc(&value)
            .map_err(|err| invalid_column(index, rusqlite::types::Type::Text, err.to_string()))
    })
    .transpose()
}

fn enum_column<T>(
    row: &rusqlite::Row<'_>,
    index: usize,
    label: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    parse(&raw).ok_or_else(|| {
        invalid_column(
            index,
            rusqlite::types::Type::Text,
            format!("invalid {label}: {raw}"),
        )
    })
}

fn optional_enum_column<T>(
    row: &rusqlite::Row<'_>,
    index: usize,
    label: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| {
        parse(&value).ok_or_else(|| {
            invalid_column(
                index,
                rusqlite::types::Type::Text,
                format!("invalid {label}: {value}"),
            )
        })
    })
    .transpose()
}

fn usize_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(index)?;
    usize::try_from(raw).map_err(|_| {
        invalid_column(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid non-negative integer: {raw}"),
        )
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

#[cfg(test)]
fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!("schema check failed: missing column {table_name}.{required}"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::test_support::{fixture_store, must, temp_db_path};
    use super::*;

    #[test]
    fn migration_runner_is_idempotent() {
        let mut store = fixture_store();
        let first = must(store.applied_migrations());
        let tables_before = must(table_names(store.connection()));

        let reapplied = must(store.migrate());
        assert!(reapplied.is_empty());
        assert_eq!(must(store.applied_migrations()), first);
        assert_eq!(must(table_names(store.connection())), tables_before);
        assert_eq!(
            first.iter().map(|item| item.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn newer_schema_version_is_fatal() {
        let mut store = fixture_store();
        if let Err(err) = store.connection().execute(
            "INSERT INTO schema_migrations(version, name, applied_at) VALUES (99, 'future', '2030-01-01T00:00:00Z')",
            [],
        ) {
            panic!("failed to seed future migration: {err}");
        }
        let err = match store.migrate() {
            Ok(_) => panic!("expected migrate to fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("newer than this binary supports"));
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        for table in [
            "workspaces",
            "plans",
            "plan_phases",
            "steps",
            "archived_plans",
            "archived_steps",
            "programs",
            "program_plans",
            "program_dependencies",
            "program_risks",
            "agent_sessions",
            "lineage",
            "limit_flags",
            "workflow_definitions",
            "plan_events",
        ] {
            assert!(must(table_exists(store.connection(), table)), "{table}");
        }
        must(ensure_table_has_columns(
            store.connection(),
            "steps",
            &["step_id", "plan_id", "step_index", "phase", "task", "status", "step_type"],
        ));

        let trigger_count = match store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'trigger'
               AND name IN ('trg_lineage_no_update', 'trg_lineage_no_delete',
                            'trg_plan_events_no_update', 'trg_plan_events_no_delete')",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query trigger contract: {err}"),
        };
        assert_eq!(trigger_count, 4);
    }

    #[test]
    fn sqlite_busy_timeout_allows_write_after_lock_release() {
        let db_path = temp_db_path("busy");
        let context = must(StoreContext::new(&db_path, KernelConfig::default()));
        {
            let mut setup = must(context.connect());
            must(setup.migrate());
        }

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let writer_context = context.clone();
        let handle = std::thread::spawn(move || {
            let mut store = writer_context.connect()?;
            store.register_workspace("/srv/busy", None)
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let result = match handle.join() {
            Ok(result) => result,
            Err(err) => panic!("writer thread join failed: {err:?}"),
        };
        assert!(result.is_ok(), "write should succeed after lock release: {:?}", result.err());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn listings_read_committed_snapshot_during_foreign_write() {
        let db_path = temp_db_path("snapshot");
        let context = must(StoreContext::new(&db_path, KernelConfig::default()));
        let mut store = must(context.connect());
        must(store.migrate());
        let workspace = must(store.register_workspace("/srv/committed", None));

        let writer = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open writer connection: {err}"),
        };
        if let Err(err) = writer.execute_batch(
            "BEGIN IMMEDIATE;
             INSERT INTO workspaces(workspace_id, name, path, registered_at)
             VALUES ('ws_pending', 'pending', '/srv/pending', '2030-01-01T00:00:00Z');",
        ) {
            panic!("failed to stage uncommitted workspace: {err}");
        }

        let listed = must(store.list_workspaces());
        assert_eq!(
            listed.iter().map(|item| item.id.clone()).collect::<Vec<_>>(),
            vec![workspace.id.clone()]
        );
        assert!(must(store.list_plans(&workspace.id, true)).is_empty());
        assert!(must(store.list_events(None, 0, 10))
            .iter()
            .all(|event| event.event_type == "workspace_registered"));

        if let Err(err) = writer.execute_batch("ROLLBACK;") {
            panic!("failed to roll back staged workspace: {err}");
        }
        assert_eq!(must(store.list_workspaces()).len(), 1);
        let _ = std::fs::remove_file(&db_path);
    }

    fn table_names(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }
}
