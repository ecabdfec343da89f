//! Per-entity write locks.
//!
//! [`EntityLocks`] serializes writers to the same plan or program inside one
//! process. [`LegacyFileLock`] is only for on-disk legacy plan files, which
//! other processes may still touch.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use plan_kernel_core::{KernelConfig, KernelError, PlanId, ProgramId};
use tracing::debug;

#[must_use]
pub fn plan_key(plan_id: &PlanId) -> String {
    format!("plan:{plan_id}")
}

#[must_use]
pub fn program_key(program_id: &ProgramId) -> String {
    format!("program:{program_id}")
}

#[must_use]
pub fn workflow_key(category: &str) -> String {
    format!("workflow:{category}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff {
    attempts: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    fn from_config(config: &KernelConfig) -> Self {
        Self {
            attempts: config.lock_retry_attempts.max(1),
            base: Duration::from_millis(config.lock_retry_base_ms),
            max: Duration::from_millis(config.lock_retry_max_ms),
        }
    }

    /// Runs `try_once` until it succeeds or attempts run out, doubling the
    /// sleep between tries up to the cap.
    fn run(&self, key: &str, mut try_once: impl FnMut() -> bool) -> Result<(), KernelError> {
        let mut delay = self.base;
        for attempt in 1..=self.attempts {
            if try_once() {
                return Ok(());
            }
            if attempt < self.attempts {
                debug!(key, attempt, delay_ms = delay.as_millis(), "lock busy, retrying");
                thread::sleep(delay);
                delay = (delay * 2).min(self.max);
            }
        }
        Err(KernelError::LockTimeout {
            key: key.to_string(),
            attempts: self.attempts,
        })
    }
}

#[derive(Debug)]
pub struct EntityLocks {
    held: Mutex<HashSet<String>>,
    backoff: Backoff,
}

impl EntityLocks {
    #[must_use]
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            backoff: Backoff::from_config(config),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        // A panic while holding the set cannot leave it half-updated.
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        self.held().contains(key)
    }

    /// Acquires every key in the given order. Keys already taken earlier in
    /// the list are released again if a later one times out.
    ///
    /// # Errors
    /// Returns [`KernelError::LockTimeout`] when a key stays busy through all
    /// retry attempts.
    pub fn acquire(self: &Arc<Self>, keys: &[String]) -> Result<EntityLockGuard, KernelError> {
        let mut guard = EntityLockGuard {
            locks: Arc::clone(self),
            keys: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            if guard.keys.contains(key) {
                continue;
            }
            self.backoff
                .run(key, || self.held().insert(key.clone()))?;
            guard.keys.push(key.clone());
        }
        Ok(guard)
    }

    fn release(&self, key: &str) {
        self.held().remove(key);
    }
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct EntityLockGuard {
    locks: Arc<EntityLocks>,
    keys: Vec<String>,
}

impl EntityLockGuard {
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for EntityLockGuard {
    fn drop(&mut self) {
        for key in self.keys.iter().rev() {
            self.locks.release(key);
        }
    }
}

/// Advisory exclusive lock on `<file>.lock` next to a legacy plan file.
#[derive(Debug)]
pub struct LegacyFileLock {
    file: File,
    path: PathBuf,
}

impl LegacyFileLock {
    /// # Errors
    /// Returns [`KernelError::LockTimeout`] when another holder keeps the
    /// lock through all retries, or [`KernelError::Validation`] when the lock
    /// file cannot be created.
    pub fn acquire(target: &Path, config: &KernelConfig) -> Result<Self, KernelError> {
        let path = PathBuf::from(format!("{}.lock", target.display()));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| {
                KernelError::Validation(format!(
                    "cannot open lock file {}: {err}",
                    path.display()
                ))
            })?;

        let key = path.display().to_string();
        Backoff::from_config(config).run(&key, || FileExt::try_lock_exclusive(&file).is_ok())?;
        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LegacyFileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "failed to release legacy file lock");
        }
    }
}
