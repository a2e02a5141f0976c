//! Advisory, file-based exclusive locking for a single repository identity.
//!
//! One lock file per `(name, arch)` under the management root: each
//! repository identity is serialized through its own lock rather than a
//! single global one. The underlying OS lock (`fs4::FileExt`) is acquired
//! on a blocking thread, since file locking can't suspend cooperatively.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs4::fs_std::FileExt;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::arch::Architecture;
use crate::error::{Error, Result, ResultIoExt};

/// How long to keep retrying a held lock before giving up. `None` means
/// fail-fast: try exactly once.
#[derive(Debug, Clone, Copy)]
pub struct LockTimeout(pub Option<Duration>);

impl Default for LockTimeout {
    /// Lock acquisition has a configurable timeout; the default is fail-fast.
    fn default() -> Self {
        LockTimeout(None)
    }
}

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A held exclusive lock on one repository `(name, arch)`. The lock is
/// released when this value is dropped.
pub struct RepoLock {
    file: Option<File>,
    path: PathBuf,
}

impl RepoLock {
    /// The conventional lock file path for `(repo, arch)` under `management_root`.
    pub fn path_for(management_root: &Path, repo: &str, arch: Architecture) -> PathBuf {
        management_root.join(format!(".lock-{repo}-{arch}"))
    }

    /// Acquire the exclusive lock for `(repo, arch)` under `management_root`,
    /// retrying at [`RETRY_INTERVAL`] until `timeout` elapses. A `None`
    /// timeout tries exactly once.
    pub async fn acquire(
        management_root: &Path,
        repo: &str,
        arch: Architecture,
        timeout: LockTimeout,
    ) -> Result<Self> {
        let path = Self::path_for(management_root, repo, arch);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_io_err(parent)?;
        }

        let deadline = timeout.0.map(|d| Instant::now() + d);
        let timeout_err = || Error::LockTimeout {
            repo: repo.to_string(),
            arch: arch.to_string(),
        };

        loop {
            let open_path = path.clone();
            let attempt = tokio::task::spawn_blocking(move || try_acquire(&open_path))
                .await
                .map_err(|e| Error::Io {
                    error: std::io::Error::other(e.to_string()),
                    path: path.display().to_string(),
                })?;

            match attempt {
                Ok(file) => {
                    debug!(path = %path.display(), "acquired repository lock");
                    return Ok(RepoLock {
                        file: Some(file),
                        path,
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let Some(deadline) = deadline else {
                        return Err(timeout_err());
                    };
                    if Instant::now() >= deadline {
                        warn!(path = %path.display(), "timed out waiting for repository lock");
                        return Err(timeout_err());
                    }
                    sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e).map_io_err(&path),
            }
        }
    }
}

fn try_acquire(path: &Path) -> std::io::Result<File> {
    let file = File::options().create(true).write(true).open(path)?;
    file.try_lock_exclusive()?;
    Ok(file)
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "failed to release repository lock");
            }
        }
    }
}

/// Acquire locks for two repository identities in canonical `(name, arch)`
/// lexicographic order, so two concurrent moves between the same pair of
/// repositories can never deadlock. When both identities are the same
/// (the common case: a move between two layers of one repository), only
/// one lock is taken.
pub async fn acquire_pair(
    management_root: &Path,
    a: (&str, Architecture),
    b: (&str, Architecture),
    timeout: LockTimeout,
) -> Result<(RepoLock, Option<RepoLock>)> {
    let key = |name: &str, arch: Architecture| format!("{name}-{arch}");

    if key(a.0, a.1) == key(b.0, b.1) {
        let lock = RepoLock::acquire(management_root, a.0, a.1, timeout).await?;
        return Ok((lock, None));
    }

    let (first, second) = if key(a.0, a.1) <= key(b.0, b.1) { (a, b) } else { (b, a) };

    let first_lock = RepoLock::acquire(management_root, first.0, first.1, timeout).await?;
    let second_lock = RepoLock::acquire(management_root, second.0, second.1, timeout).await?;
    Ok((first_lock, Some(second_lock)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();

        let lock = RepoLock::acquire(dir.path(), "core", Architecture::X86_64, LockTimeout::default())
            .await
            .unwrap();
        drop(lock);

        let lock = RepoLock::acquire(dir.path(), "core", Architecture::X86_64, LockTimeout::default())
            .await
            .unwrap();
        drop(lock);
    }

    #[tokio::test]
    async fn fail_fast_when_already_held() {
        let dir = tempfile::tempdir().unwrap();

        let _held = RepoLock::acquire(dir.path(), "core", Architecture::X86_64, LockTimeout::default())
            .await
            .unwrap();
        let err = RepoLock::acquire(dir.path(), "core", Architecture::X86_64, LockTimeout::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn pair_acquisition_collapses_to_one_lock_for_same_repo() {
        let dir = tempfile::tempdir().unwrap();
        let (first, second) = acquire_pair(
            dir.path(),
            ("core", Architecture::X86_64),
            ("core", Architecture::X86_64),
            LockTimeout::default(),
        )
        .await
        .unwrap();
        assert!(second.is_none());
        drop(first);
    }

    #[tokio::test]
    async fn pair_acquisition_orders_distinct_repos_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        let (first, second) = acquire_pair(
            dir.path(),
            ("extra", Architecture::X86_64),
            ("core", Architecture::X86_64),
            LockTimeout::default(),
        )
        .await
        .unwrap();
        assert!(second.is_some());
        drop(first);
        drop(second);
    }
}
