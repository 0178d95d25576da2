//! Keyed blob storage for training snapshots.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use thiserror::Error;
use tracing::warn;

use super::KEY_PREFIX;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no blob stored under `{0}`")]
    NotFound(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(path.display().to_string());
        }
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Named artifact storage. Writing a key twice replaces the previous blob.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// One file per key inside a run directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl BlobStore for DirectoryStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|err| StoreError::io(&self.root, err))?;

        // Write next to the target and rename, so readers never see a partial blob.
        let target = self.path(key);
        let staging = self.root.join(format!(".{key}.partial"));
        let mut file = fs::File::create(&staging).map_err(|err| StoreError::io(&staging, err))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|err| StoreError::io(&staging, err))?;
        fs::rename(&staging, &target).map_err(|err| StoreError::io(&target, err))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path(key);
        fs::read(&path).map_err(|err| StoreError::io(&path, err))
    }
}

/// A single snapshot file; every key resolves to it.
#[derive(Debug, Clone)]
pub struct FileBlob {
    path: PathBuf,
}

impl FileBlob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BlobStore for FileBlob {
    fn put(&self, _key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        fs::write(&self.path, bytes).map_err(|err| StoreError::io(&self.path, err))
    }

    fn get(&self, _key: &str) -> Result<Vec<u8>, StoreError> {
        fs::read(&self.path).map_err(|err| StoreError::io(&self.path, err))
    }
}

/// Remote store addressed as `{base}/{key}`: PUT to write, GET to read.
#[derive(Debug, Clone)]
pub struct HttpStore {
    base: String,
    client: Client,
}

impl HttpStore {
    pub fn new(base: &str) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| StoreError::Http(err.to_string()))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{key}", self.base)
    }
}

impl BlobStore for HttpStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let url = self.url(key);
        let response = self
            .client
            .put(&url)
            .body(bytes.to_vec())
            .send()
            .map_err(|err| StoreError::Http(format!("PUT {url}: {err}")))?;
        if !response.status().is_success() {
            return Err(StoreError::Http(format!("PUT {url}: {}", response.status())));
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.url(key);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| StoreError::Http(format!("GET {url}: {err}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(url)),
            status if !status.is_success() => {
                Err(StoreError::Http(format!("GET {url}: {status}")))
            }
            _ => response
                .bytes()
                .map(|bytes| bytes.to_vec())
                .map_err(|err| StoreError::Http(format!("GET {url}: {err}"))),
        }
    }
}

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let blobs = self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut keys: Vec<String> = blobs.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl BlobStore for MemoryStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let blobs = self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

/// Writes go to `primary`; checkpoint blobs are also copied to `mirror` on a best-effort basis.
pub struct MirroredStore {
    primary: Box<dyn BlobStore>,
    mirror: Box<dyn BlobStore>,
}

impl MirroredStore {
    pub fn new(primary: Box<dyn BlobStore>, mirror: Box<dyn BlobStore>) -> Self {
        Self { primary, mirror }
    }
}

impl BlobStore for MirroredStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.primary.put(key, bytes)?;
        if key.starts_with(KEY_PREFIX) {
            if let Err(err) = self.mirror.put(key, bytes) {
                warn!(key, error = %err, "failed to mirror checkpoint");
            }
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match self.primary.get(key) {
            Err(StoreError::NotFound(_)) => self.mirror.get(key),
            other => other,
        }
    }
}

/// Pick the store a run resumes from.
///
/// An http(s) URL reads from a remote store, an existing file is used as-is, any other
/// path is treated as a run directory. Without a path the run's own store is used.
pub fn resolve_restore_source(
    runpath: Option<&str>,
    run_store: Arc<dyn BlobStore>,
) -> Result<Arc<dyn BlobStore>, StoreError> {
    let Some(runpath) = runpath.map(str::trim).filter(|path| !path.is_empty()) else {
        return Ok(run_store);
    };
    if runpath.starts_with("http://") || runpath.starts_with("https://") {
        return Ok(Arc::new(HttpStore::new(runpath)?));
    }
    let path = Path::new(runpath);
    if path.is_file() {
        Ok(Arc::new(FileBlob::new(path)))
    } else {
        Ok(Arc::new(DirectoryStore::new(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_store_overwrites_and_reports_missing_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DirectoryStore::new(dir.path().join("run"));

        store.put("checkpoint_latest", b"first").expect("put");
        store.put("checkpoint_latest", b"second").expect("put");
        assert_eq!(store.get("checkpoint_latest").expect("get"), b"second");
        assert!(!dir.path().join("run/.checkpoint_latest.partial").exists());
        assert!(matches!(store.get("checkpoint_7"), Err(StoreError::NotFound(_))));
    }

    struct FailingStore;

    impl BlobStore for FailingStore {
        fn put(&self, key: &str, _bytes: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Http(format!("refused {key}")))
        }

        fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            Err(StoreError::NotFound(key.to_string()))
        }
    }

    #[test]
    fn mirror_failures_do_not_fail_the_write() {
        let store = MirroredStore::new(Box::new(MemoryStore::new()), Box::new(FailingStore));
        store.put("checkpoint_3", b"blob").expect("primary write succeeds");
        assert_eq!(store.get("checkpoint_3").expect("get"), b"blob");
    }

    #[test]
    fn only_checkpoints_are_mirrored() {
        let mirror = Arc::new(MemoryStore::new());

        struct Shared(Arc<MemoryStore>);
        impl BlobStore for Shared {
            fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
                self.0.put(key, bytes)
            }
            fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
                self.0.get(key)
            }
        }

        let store = MirroredStore::new(
            Box::new(MemoryStore::new()),
            Box::new(Shared(mirror.clone())),
        );
        store.put("checkpoint_1", b"a").expect("put");
        store.put("config.json", b"{}").expect("put");
        assert_eq!(mirror.keys(), vec!["checkpoint_1".to_string()]);
    }

    #[test]
    fn restore_source_follows_the_runpath_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("snapshot.bin");
        fs::write(&file, b"snapshot").expect("write");

        let run: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        run.put("checkpoint_latest", b"own").expect("put");

        let own = resolve_restore_source(None, run.clone()).expect("resolve");
        assert_eq!(own.get("checkpoint_latest").expect("get"), b"own");

        let blank = resolve_restore_source(Some("  "), run.clone()).expect("resolve");
        assert_eq!(blank.get("checkpoint_latest").expect("get"), b"own");

        let single = resolve_restore_source(file.to_str(), run.clone()).expect("resolve");
        assert_eq!(single.get("checkpoint_99").expect("get"), b"snapshot");

        let other_run = resolve_restore_source(dir.path().to_str(), run).expect("resolve");
        assert_eq!(other_run.get("snapshot.bin").expect("get"), b"snapshot");
    }
}
