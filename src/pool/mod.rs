//! Content-addressed pool storage and repository-layer symlink orchestration.
//!
//! Path components are validated before use and writes land via an
//! exclusive-create staging file renamed into place, so a pool entry is
//! either absent or fully written, never partial. One pool entry is shared
//! by every layer that links to it. Symlinks are relative so a whole data
//! directory can be relocated without breaking them.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;

use crate::error::{Error, Result, ResultIoExt};

fn reject_unsafe_component(component: &str) -> Result<()> {
    let bad = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0');

    if bad {
        return Err(Error::Io {
            error: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsafe path component: {component:?}"),
            ),
            path: component.to_string(),
        });
    }
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn sha256_of(path: &Path) -> Result<String> {
    let data = fs::read(path).await.map_io_err(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(to_hex(&hasher.finalize()))
}

/// Build `to_path` relative to `from_dir`, for symlink targets that must
/// survive the whole data tree being moved or bind-mounted elsewhere.
fn relative_from(from_dir: &Path, to_path: &Path) -> PathBuf {
    let from: Vec<Component> = from_dir.components().collect();
    let to: Vec<Component> = to_path.components().collect();

    let shared = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in shared..from.len() {
        result.push("..");
    }
    for component in &to[shared..] {
        result.push(component.as_os_str());
    }
    result
}

/// The content-addressed pool backing zero or more repository layers.
pub struct Pool {
    pool_dir: PathBuf,
}

impl Pool {
    pub fn new(pool_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool_dir: pool_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.pool_dir
    }

    /// Copy `src_path` into the pool under its own basename. If an entry of
    /// that name already exists, compare content by SHA-256: identical is a
    /// no-op, differing is [`Error::PoolCollision`].
    pub async fn place(&self, src_path: &Path) -> Result<PathBuf> {
        let basename = src_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Io {
                error: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
                path: src_path.display().to_string(),
            })?;
        reject_unsafe_component(basename)?;

        fs::create_dir_all(&self.pool_dir)
            .await
            .map_io_err(&self.pool_dir)?;
        let final_path = self.pool_dir.join(basename);

        if fs::try_exists(&final_path).await.map_io_err(&final_path)? {
            let existing_hash = sha256_of(&final_path).await?;
            let incoming_hash = sha256_of(src_path).await?;
            if existing_hash == incoming_hash {
                return Ok(final_path);
            }
            return Err(Error::PoolCollision {
                basename: basename.to_string(),
            });
        }

        let tmp_path = self
            .pool_dir
            .join(format!(".{basename}.tmp-{}", std::process::id()));
        fs::copy(src_path, &tmp_path).await.map_io_err(&tmp_path)?;
        fs::rename(&tmp_path, &final_path)
            .await
            .map_io_err(&final_path)?;

        Ok(final_path)
    }

    /// Remove pool entries whose basename is not present in `referenced`.
    /// Returns the basenames actually removed.
    pub async fn collect(&self, referenced: &HashSet<String>) -> Result<Vec<String>> {
        if !fs::try_exists(&self.pool_dir).await.map_io_err(&self.pool_dir)? {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        let mut entries = fs::read_dir(&self.pool_dir).await.map_io_err(&self.pool_dir)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(&self.pool_dir)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || referenced.contains(&name) {
                continue;
            }
            let path = entry.path();
            fs::remove_file(&path).await.map_io_err(&path)?;
            removed.push(name);
        }

        Ok(removed)
    }
}

/// Symlink orchestration for a single repository-layer directory.
pub struct Layout {
    layer_dir: PathBuf,
}

impl Layout {
    pub fn new(layer_dir: impl Into<PathBuf>) -> Self {
        Self {
            layer_dir: layer_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.layer_dir
    }

    /// Create a relative symlink in this layer pointing at `pool_path`. An
    /// existing symlink to the same target is a no-op; to a different
    /// target is [`Error::LinkConflict`].
    pub async fn link(&self, pool_path: &Path) -> Result<PathBuf> {
        let basename = pool_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Io {
                error: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
                path: pool_path.display().to_string(),
            })?;
        reject_unsafe_component(basename)?;

        fs::create_dir_all(&self.layer_dir)
            .await
            .map_io_err(&self.layer_dir)?;
        let link_path = self.layer_dir.join(basename);
        let target = relative_from(&self.layer_dir, pool_path);

        match fs::symlink_metadata(&link_path).await {
            Ok(_) => {
                let existing_target = fs::read_link(&link_path).await.map_io_err(&link_path)?;
                if existing_target == target {
                    return Ok(link_path);
                }
                return Err(Error::LinkConflict {
                    path: link_path.display().to_string(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).map_io_err(&link_path),
        }

        #[cfg(unix)]
        fs::symlink(&target, &link_path)
            .await
            .map_io_err(&link_path)?;

        Ok(link_path)
    }

    /// Remove the symlink named `filename` from this layer. Already-absent
    /// is a no-op, matching remove/move semantics elsewhere in the engine.
    pub async fn unlink(&self, filename: &str) -> Result<()> {
        reject_unsafe_component(filename)?;
        let link_path = self.layer_dir.join(filename);
        match fs::remove_file(&link_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).map_io_err(&link_path),
        }
    }

    /// List the basenames this layer currently links to, used to compute
    /// what a pool [`Pool::collect`] pass may safely remove.
    pub async fn linked_basenames(&self) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        if !fs::try_exists(&self.layer_dir).await.map_io_err(&self.layer_dir)? {
            return Ok(out);
        }

        let mut entries = fs::read_dir(&self.layer_dir).await.map_io_err(&self.layer_dir)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(&self.layer_dir)? {
            let path = entry.path();
            let metadata = fs::symlink_metadata(&path).await.map_io_err(&path)?;
            if !metadata.file_type().is_symlink() {
                continue;
            }
            let target = fs::read_link(&path).await.map_io_err(&path)?;
            if let Some(basename) = target.file_name().and_then(|n| n.to_str()) {
                out.insert(basename.to_string());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn write_file(path: &Path, content: &[u8]) {
        let mut f = fs::File::create(path).await.unwrap();
        f.write_all(content).await.unwrap();
    }

    #[tokio::test]
    async fn place_copies_new_entry_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = dir.path().join("src");
        fs::create_dir_all(&src_dir).await.unwrap();
        let src = src_dir.join("foo-1.0-1-any.pkg.tar.zst");
        write_file(&src, b"hello").await;

        let pool = Pool::new(dir.path().join("pool"));
        let placed = pool.place(&src).await.unwrap();
        assert_eq!(placed, dir.path().join("pool/foo-1.0-1-any.pkg.tar.zst"));
        assert_eq!(fs::read(&placed).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn place_is_idempotent_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = dir.path().join("src");
        fs::create_dir_all(&src_dir).await.unwrap();
        let src = src_dir.join("foo.pkg.tar.zst");
        write_file(&src, b"hello").await;

        let pool = Pool::new(dir.path().join("pool"));
        pool.place(&src).await.unwrap();
        pool.place(&src).await.unwrap();
    }

    #[tokio::test]
    async fn place_rejects_differing_content_at_same_basename() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = dir.path().join("src");
        fs::create_dir_all(&src_dir).await.unwrap();
        let pool = Pool::new(dir.path().join("pool"));

        let a = src_dir.join("foo.pkg.tar.zst");
        write_file(&a, b"hello").await;
        pool.place(&a).await.unwrap();

        let b = dir.path().join("other/foo.pkg.tar.zst");
        fs::create_dir_all(b.parent().unwrap()).await.unwrap();
        write_file(&b, b"goodbye").await;

        let err = pool.place(&b).await.unwrap_err();
        assert!(matches!(err, Error::PoolCollision { .. }));
    }

    #[tokio::test]
    async fn link_and_unlink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pool_dir = dir.path().join("pool");
        fs::create_dir_all(&pool_dir).await.unwrap();
        let pool_path = pool_dir.join("foo.pkg.tar.zst");
        write_file(&pool_path, b"hello").await;

        let layout = Layout::new(dir.path().join("os/x86_64/stable"));
        let link_path = layout.link(&pool_path).await.unwrap();
        assert!(fs::symlink_metadata(&link_path).await.unwrap().file_type().is_symlink());

        layout.link(&pool_path).await.unwrap();

        layout.unlink("foo.pkg.tar.zst").await.unwrap();
        assert!(!fs::try_exists(&link_path).await.unwrap());

        layout.unlink("foo.pkg.tar.zst").await.unwrap();
    }

    #[tokio::test]
    async fn link_conflict_when_existing_symlink_points_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let pool_dir = dir.path().join("pool");
        fs::create_dir_all(&pool_dir).await.unwrap();
        let a = pool_dir.join("a.pkg.tar.zst");
        let b = pool_dir.join("foo.pkg.tar.zst");
        write_file(&a, b"a").await;
        write_file(&b, b"b").await;

        let layout_dir = dir.path().join("os/x86_64/stable");
        fs::create_dir_all(&layout_dir).await.unwrap();
        #[cfg(unix)]
        tokio::fs::symlink("../../../pool/a.pkg.tar.zst", layout_dir.join("foo.pkg.tar.zst"))
            .await
            .unwrap();

        let layout = Layout::new(layout_dir);
        let err = layout.link(&b).await.unwrap_err();
        assert!(matches!(err, Error::LinkConflict { .. }));
    }

    #[tokio::test]
    async fn collect_removes_only_unreferenced_entries() {
        let dir = tempfile::tempdir().unwrap();
        let pool_dir = dir.path().join("pool");
        fs::create_dir_all(&pool_dir).await.unwrap();
        write_file(&pool_dir.join("keep.pkg.tar.zst"), b"keep").await;
        write_file(&pool_dir.join("gone.pkg.tar.zst"), b"gone").await;

        let pool = Pool::new(pool_dir.clone());
        let mut referenced = HashSet::new();
        referenced.insert("keep.pkg.tar.zst".to_string());

        let removed = pool.collect(&referenced).await.unwrap();
        assert_eq!(removed, vec!["gone.pkg.tar.zst".to_string()]);
        assert!(fs::try_exists(pool_dir.join("keep.pkg.tar.zst")).await.unwrap());
        assert!(!fs::try_exists(pool_dir.join("gone.pkg.tar.zst")).await.unwrap());
    }
}
