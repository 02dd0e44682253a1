//! External-storage abstraction for redo logs and meta files.
//!
//! The redo subsystem reads and writes whole objects by path. Two backends
//! are provided: a local filesystem root (the `file` scheme, with `nfs` and
//! `local` rewritten to it) and `blackhole`, which keeps the redo component
//! alive while degrading every operation to a no-op.

use crate::core::error::{SluiceError, SluiceResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Suffix of in-flight writes; [`LocalStorage::walk_dir`] never reports them.
const TMP_SUFFIX: &str = ".tmp";

/// One object listed by [`ExternalStorage::walk_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the storage root, `/`-separated.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Durable object storage addressed by relative path.
///
/// `write_file` is atomic per object: readers observe either the old or the
/// new content, never a partial write. `walk_dir` returns a consistent
/// snapshot of the names present at entry; concurrent writes during the walk
/// are allowed and may or may not be reflected.
#[async_trait]
pub trait ExternalStorage: Send + Sync {
    /// Write (or replace) a whole object.
    async fn write_file(&self, path: &str, data: &[u8]) -> SluiceResult<()>;

    /// Read a whole object. A missing object is
    /// [`SluiceError::FileNotFound`], which callers treat as empty.
    async fn read_file(&self, path: &str) -> SluiceResult<Vec<u8>>;

    /// Delete an object. A missing object is [`SluiceError::FileNotFound`].
    async fn delete_file(&self, path: &str) -> SluiceResult<()>;

    /// Whether an object exists.
    async fn file_exists(&self, path: &str) -> SluiceResult<bool>;

    /// List objects, optionally restricted to a path prefix.
    async fn walk_dir(&self, prefix: Option<&str>) -> SluiceResult<Vec<FileEntry>>;
}

/// Delete every listed object whose path satisfies `pred`.
///
/// Objects that disappear mid-sweep are skipped. Returns the removed paths.
pub async fn remove_files_if<F>(
    storage: &dyn ExternalStorage,
    pred: F,
) -> SluiceResult<Vec<String>>
where
    F: Fn(&str) -> bool + Send,
{
    let mut removed = Vec::new();
    for entry in storage.walk_dir(None).await? {
        if !pred(&entry.path) {
            continue;
        }
        match storage.delete_file(&entry.path).await {
            Ok(()) => removed.push(entry.path),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(removed)
}

/// Delete an explicit list of objects, ignoring ones already gone.
pub async fn delete_files(storage: &dyn ExternalStorage, paths: &[String]) -> SluiceResult<()> {
    for path in paths {
        match storage.delete_file(path).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// A parsed and scheme-normalized storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUrl {
    /// Normalized scheme: `file` or `blackhole`.
    pub scheme: String,
    /// Root path (empty for `blackhole`).
    pub path: String,
}

impl StorageUrl {
    /// Whether this URL names the blackhole backend.
    pub fn is_blackhole(&self) -> bool {
        self.scheme == "blackhole"
    }
}

/// Parse a storage URL, rewriting `nfs` and `local` to `file`.
///
/// Anything other than `file`/`nfs`/`local`/`blackhole` is rejected:
/// remote object stores are configured through dedicated deployments and
/// are not reachable from this process.
pub fn parse_storage_url(raw: &str) -> SluiceResult<StorageUrl> {
    let (scheme, rest) = raw
        .split_once("://")
        .ok_or_else(|| SluiceError::invalid_config(format!("storage url {raw:?} has no scheme")))?;

    let scheme = match scheme {
        "file" | "nfs" | "local" => "file",
        "blackhole" => "blackhole",
        other => {
            return Err(SluiceError::invalid_config(format!(
                "unsupported storage scheme {other:?}"
            )))
        }
    };

    if scheme == "file" && rest.is_empty() {
        return Err(SluiceError::invalid_config(
            "file storage url has an empty path",
        ));
    }

    Ok(StorageUrl {
        scheme: scheme.to_string(),
        path: rest.to_string(),
    })
}

/// Open the backend named by a raw storage URL.
pub fn open_storage(raw: &str) -> SluiceResult<Arc<dyn ExternalStorage>> {
    let url = parse_storage_url(raw)?;
    if url.is_blackhole() {
        return Ok(Arc::new(BlackholeStorage));
    }
    Ok(Arc::new(LocalStorage::new(PathBuf::from(url.path))?))
}

/// Filesystem-backed storage rooted at a directory.
#[derive(Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create the backend, creating the root directory if needed.
    pub fn new(root: PathBuf) -> SluiceResult<Self> {
        std::fs::create_dir_all(&root).map_err(SluiceError::storage_api)?;
        Ok(Self { root })
    }

    /// The storage root on disk.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl ExternalStorage for LocalStorage {
    async fn write_file(&self, path: &str, data: &[u8]) -> SluiceResult<()> {
        let target = self.full_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(SluiceError::storage_api)?;
        }

        // Write-then-rename so readers never observe a partial object.
        let tmp = self.full_path(&format!("{path}{TMP_SUFFIX}"));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(SluiceError::storage_api)?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(SluiceError::storage_api)?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> SluiceResult<Vec<u8>> {
        match tokio::fs::read(self.full_path(path)).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SluiceError::FileNotFound { path: path.into() })
            }
            Err(err) => Err(SluiceError::storage_api(err)),
        }
    }

    async fn delete_file(&self, path: &str) -> SluiceResult<()> {
        match tokio::fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SluiceError::FileNotFound { path: path.into() })
            }
            Err(err) => Err(SluiceError::storage_api(err)),
        }
    }

    async fn file_exists(&self, path: &str) -> SluiceResult<bool> {
        tokio::fs::try_exists(self.full_path(path))
            .await
            .map_err(SluiceError::storage_api)
    }

    async fn walk_dir(&self, prefix: Option<&str>) -> SluiceResult<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(SluiceError::storage_api(err)),
            };
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(SluiceError::storage_api)?
            {
                let file_type = entry.file_type().await.map_err(SluiceError::storage_api)?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&self.root)
                    .map_err(SluiceError::storage_api)?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if rel.ends_with(TMP_SUFFIX) {
                    continue;
                }
                if let Some(prefix) = prefix {
                    if !rel.starts_with(prefix) {
                        continue;
                    }
                }
                let size = entry
                    .metadata()
                    .await
                    .map_err(SluiceError::storage_api)?
                    .len();
                entries.push(FileEntry { path: rel, size });
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

/// Storage that accepts every write and holds nothing.
#[derive(Debug, Default)]
pub struct BlackholeStorage;

#[async_trait]
impl ExternalStorage for BlackholeStorage {
    async fn write_file(&self, _path: &str, _data: &[u8]) -> SluiceResult<()> {
        Ok(())
    }

    async fn read_file(&self, path: &str) -> SluiceResult<Vec<u8>> {
        Err(SluiceError::FileNotFound { path: path.into() })
    }

    async fn delete_file(&self, _path: &str) -> SluiceResult<()> {
        Ok(())
    }

    async fn file_exists(&self, _path: &str) -> SluiceResult<bool> {
        Ok(false)
    }

    async fn walk_dir(&self, _prefix: Option<&str>) -> SluiceResult<Vec<FileEntry>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_local_schemes_to_file() {
        for raw in ["file:///tmp/redo", "nfs:///tmp/redo", "local:///tmp/redo"] {
            let url = parse_storage_url(raw).unwrap();
            assert_eq!(url.scheme, "file");
            assert_eq!(url.path, "/tmp/redo");
        }
    }

    #[test]
    fn recognizes_blackhole() {
        let url = parse_storage_url("blackhole://").unwrap();
        assert!(url.is_blackhole());
    }

    #[test]
    fn rejects_unknown_schemes_and_missing_paths() {
        assert!(parse_storage_url("s3://bucket/redo").is_err());
        assert!(parse_storage_url("not-a-url").is_err());
        assert!(parse_storage_url("file://").is_err());
    }

    #[tokio::test]
    async fn local_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf()).unwrap();

        storage.write_file("a.meta", b"one").await.unwrap();
        storage.write_file("a.meta", b"two").await.unwrap();
        assert_eq!(storage.read_file("a.meta").await.unwrap(), b"two");
        assert!(storage.file_exists("a.meta").await.unwrap());

        storage.delete_file("a.meta").await.unwrap();
        let err = storage.read_file("a.meta").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn walk_dir_lists_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf()).unwrap();

        storage.write_file("x.log", b"x").await.unwrap();
        storage.write_file("sub/y.log", b"yy").await.unwrap();

        let entries = storage.walk_dir(None).await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["sub/y.log", "x.log"]);
        assert_eq!(entries[0].size, 2);

        let filtered = storage.walk_dir(Some("sub/")).await.unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn remove_files_if_applies_the_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf()).unwrap();

        storage.write_file("keep.log", b"k").await.unwrap();
        storage.write_file("drop.log", b"d").await.unwrap();

        let removed = remove_files_if(&storage, |p| p.starts_with("drop"))
            .await
            .unwrap();
        assert_eq!(removed, vec!["drop.log".to_string()]);
        assert!(storage.file_exists("keep.log").await.unwrap());
        assert!(!storage.file_exists("drop.log").await.unwrap());
    }

    #[tokio::test]
    async fn blackhole_degrades_to_no_ops() {
        let storage = BlackholeStorage;
        storage.write_file("a", b"x").await.unwrap();
        assert!(storage.read_file("a").await.unwrap_err().is_not_found());
        assert!(!storage.file_exists("a").await.unwrap());
        assert!(storage.walk_dir(None).await.unwrap().is_empty());
        storage.delete_file("a").await.unwrap();
    }
}
