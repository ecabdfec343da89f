use std::path::PathBuf;

use plan_kernel_core::plan::{NewPlan, NewStep, Plan, Priority, StepType};
use plan_kernel_core::Workspace;

use crate::SqlitePlanStore;

pub(crate) fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err:#}"),
    }
}

pub(crate) fn must_err<T: std::fmt::Debug>(result: anyhow::Result<T>) -> anyhow::Error {
    match result {
        Ok(value) => panic!("expected an error, got {value:?}"),
        Err(err) => err,
    }
}

pub(crate) fn kernel_code(err: &anyhow::Error) -> Option<&'static str> {
    err.downcast_ref::<plan_kernel_core::KernelError>()
        .map(plan_kernel_core::KernelError::code)
}

pub(crate) fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "plan-kernel-{label}-{}.sqlite3",
        ulid::Ulid::new().to_string().to_lowercase()
    ))
}

/// Migrated store on a fresh temp file. WAL needs a real file, so no
/// in-memory databases here.
pub(crate) fn fixture_store() -> SqlitePlanStore {
    let path = temp_db_path("fixture");
    let mut store = must(SqlitePlanStore::open(&path));
    must(store.migrate());
    store
}

pub(crate) fn fixture_workspace(store: &mut SqlitePlanStore) -> Workspace {
    must(store.register_workspace("/srv/fixture", None))
}

pub(crate) fn new_plan(workspace: &Workspace, title: &str, steps: Vec<NewStep>) -> NewPlan {
    NewPlan {
        workspace_id: workspace.id.clone(),
        title: title.to_string(),
        description: String::new(),
        category: Some("feature".to_string()),
        priority: Priority::Medium,
        steps,
        phases: Vec::new(),
        created_by: None,
    }
}

pub(crate) fn fixture_plan(store: &mut SqlitePlanStore, workspace: &Workspace) -> Plan {
    must(store.create_plan(&new_plan(
        workspace,
        "Fixture plan",
        vec![
            NewStep::new("design", "Sketch the API", StepType::Planning),
            NewStep::new("build", "Implement handlers", StepType::Code),
            NewStep::new("build", "Wire routes", StepType::Code),
            NewStep::new("verify", "Run integration tests", StepType::Test),
        ],
    )))
}
