//! Project-scoped execution lock.
//!
//! At most one calibration run may hold the lock for a project. Acquisition
//! never waits: a held lock fails immediately with `LockConflict`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{CalibError, CalibResult};
use crate::types::ProjectId;

/// Non-blocking mutex keyed by project id.
pub trait ExecutionLock: Send + Sync {
    /// Take the lock for `project`, or fail with `LockConflict` if it is held.
    fn try_acquire(&self, project: &ProjectId) -> CalibResult<()>;

    /// Release the lock. Releasing a lock that is not held is a no-op.
    fn release(&self, project: &ProjectId) -> CalibResult<()>;

    fn is_locked(&self, project: &ProjectId) -> CalibResult<bool>;
}

fn poison_err<T>(_: PoisonError<T>) -> CalibError {
    CalibError::storage("execution lock poisoned")
}

/// In-process lock table.
#[derive(Debug, Default)]
pub struct InMemoryExecutionLock {
    held: Mutex<HashSet<ProjectId>>,
}

impl InMemoryExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionLock for InMemoryExecutionLock {
    fn try_acquire(&self, project: &ProjectId) -> CalibResult<()> {
        let mut held = self.held.lock().map_err(poison_err)?;
        if !held.insert(project.clone()) {
            return Err(CalibError::LockConflict {
                project_id: project.clone(),
            });
        }
        Ok(())
    }

    fn release(&self, project: &ProjectId) -> CalibResult<()> {
        let mut held = self.held.lock().map_err(poison_err)?;
        held.remove(project);
        Ok(())
    }

    fn is_locked(&self, project: &ProjectId) -> CalibResult<bool> {
        let held = self.held.lock().map_err(poison_err)?;
        Ok(held.contains(project))
    }
}

/// Held lock. Released exactly once: by `release`, or on drop if the holder
/// bailed out early.
pub struct ExecutionLockGuard {
    lock: Arc<dyn ExecutionLock>,
    project: ProjectId,
    released: bool,
}

impl ExecutionLockGuard {
    pub fn acquire(lock: Arc<dyn ExecutionLock>, project: ProjectId) -> CalibResult<Self> {
        lock.try_acquire(&project)?;
        tracing::debug!(project_id = %project, "execution lock acquired");
        Ok(Self {
            lock,
            project,
            released: false,
        })
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn release(mut self) -> CalibResult<()> {
        self.released = true;
        let result = self.lock.release(&self.project);
        tracing::debug!(project_id = %self.project, "execution lock released");
        result
    }
}

impl Drop for ExecutionLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.lock.release(&self.project) {
            tracing::error!(project_id = %self.project, error = %e, "failed to release execution lock");
        } else {
            tracing::warn!(project_id = %self.project, "execution lock released on drop");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lock that counts releases, for checking the exactly-once guarantee.
    #[derive(Default)]
    pub(crate) struct CountingLock {
        pub(crate) inner: InMemoryExecutionLock,
        pub(crate) releases: AtomicUsize,
    }

    impl ExecutionLock for CountingLock {
        fn try_acquire(&self, project: &ProjectId) -> CalibResult<()> {
            self.inner.try_acquire(project)
        }

        fn release(&self, project: &ProjectId) -> CalibResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(project)
        }

        fn is_locked(&self, project: &ProjectId) -> CalibResult<bool> {
            self.inner.is_locked(project)
        }
    }

    #[test]
    fn second_acquire_conflicts() {
        let lock = InMemoryExecutionLock::new();
        let project = ProjectId::new("proj-a");

        lock.try_acquire(&project).unwrap();
        let err = lock.try_acquire(&project).unwrap_err();
        assert!(matches!(err, CalibError::LockConflict { .. }));

        // Other projects are independent.
        lock.try_acquire(&ProjectId::new("proj-b")).unwrap();

        lock.release(&project).unwrap();
        assert!(!lock.is_locked(&project).unwrap());
        lock.try_acquire(&project).unwrap();
    }

    #[test]
    fn guard_releases_once_on_explicit_release() {
        let lock = Arc::new(CountingLock::default());
        let project = ProjectId::new("proj-a");

        let guard = ExecutionLockGuard::acquire(lock.clone(), project.clone()).unwrap();
        assert!(lock.is_locked(&project).unwrap());
        guard.release().unwrap();

        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked(&project).unwrap());
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = Arc::new(CountingLock::default());
        let project = ProjectId::new("proj-a");

        {
            let _guard = ExecutionLockGuard::acquire(lock.clone(), project.clone()).unwrap();
            let again = ExecutionLockGuard::acquire(lock.clone(), project.clone());
            assert!(matches!(again, Err(CalibError::LockConflict { .. })));
        }

        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked(&project).unwrap());
    }
}
