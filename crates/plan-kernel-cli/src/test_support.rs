use std::path::PathBuf;

use plan_kernel_store_sqlite::SqlitePlanStore;

pub(crate) fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

pub(crate) fn temp_path(label: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "plan-kernel-cli-{label}-{}.{extension}",
        ulid::Ulid::new().to_string().to_lowercase()
    ))
}

pub(crate) fn open_store() -> SqlitePlanStore {
    let mut store = must(SqlitePlanStore::open(&temp_path("tools", "sqlite3")));
    must(store.migrate());
    store
}
