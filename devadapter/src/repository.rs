/// Update repository synchronisation
///
/// Lists index files in the remote object store and downloads objects into
/// a local directory. Downloads are grouped into batches; every member of a
/// batch reports against the same counters, in whatever order they finish.

use std::collections::VecDeque;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("No object with key '{0}'")]
    MissingKey(String),
    #[error("Invalid object key '{0}'")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One page of keys from the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub keys: Vec<String>,
    /// The store had more keys than it returned
    pub truncated: bool,
}

/// Remote object store, already configured with credentials and bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, prefix: Option<&str>) -> Result<Listing>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Serves a mirrored repository from a local directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    max_keys: Option<usize>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_keys: None,
        }
    }

    /// Return at most `max_keys` keys per listing, flagging the rest as truncated
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for DirectoryStore {
    async fn list(&self, prefix: Option<&str>) -> Result<Listing> {
        let mut keys = Vec::new();
        let mut pending = VecDeque::from([(self.root.clone(), String::new())]);

        while let Some((dir, key_prefix)) = pending.pop_front() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{}{}", key_prefix, name);
                if entry.file_type().await?.is_dir() {
                    pending.push_back((entry.path(), format!("{}/", key)));
                } else if prefix.map_or(true, |prefix| key.starts_with(prefix)) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        let truncated = match self.max_keys {
            Some(max) if keys.len() > max => {
                keys.truncate(max);
                true
            }
            _ => false,
        };
        Ok(Listing { keys, truncated })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::MissingKey(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Completion counters shared by every download in one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadBatch {
    pub completed: usize,
    pub count: usize,
    pub success: usize,
}

impl DownloadBatch {
    pub fn new(count: usize) -> Self {
        Self {
            completed: 0,
            count,
            success: 0,
        }
    }

    /// Count one finished member and return the resulting snapshot
    fn record(&mut self, ok: bool) -> Self {
        if self.completed < self.count {
            self.completed += 1;
            if ok {
                self.success += 1;
            }
        }
        *self
    }

    pub fn is_finished(&self) -> bool {
        self.completed == self.count
    }

    /// Partial success counts as success
    pub fn succeeded(&self) -> bool {
        self.success > 0
    }

    pub fn all_succeeded(&self) -> bool {
        self.count > 0 && self.success == self.count
    }
}

/// Result of one object download within a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub key: String,
    pub path: PathBuf,
    pub ok: bool,
    /// Batch counters including this download
    pub batch: DownloadBatch,
}

/// Local file name for an object key: the key's last `/` segment under `dir`
pub fn local_path(dir: &Path, key: &str) -> Option<PathBuf> {
    key.rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(|name| dir.join(name))
}

/// Lists and downloads update files from the repository
#[derive(Clone)]
pub struct RepositoryClient {
    store: Arc<dyn ObjectStore>,
    extension: String,
}

impl RepositoryClient {
    pub fn new(store: Arc<dyn ObjectStore>, extension: impl Into<String>) -> Self {
        Self {
            store,
            extension: extension.into(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// List index file keys under `prefix`
    ///
    /// The handler gets `None` on a store error and a possibly empty list
    /// otherwise. A truncated listing is delivered as-is.
    pub fn list_index_files<F>(&self, prefix: Option<String>, handler: F)
    where
        F: FnOnce(Option<Vec<String>>) + Send + 'static,
    {
        let store = self.store.clone();
        let extension = self.extension.clone();

        tokio::spawn(async move {
            match store.list(prefix.as_deref()).await {
                Ok(listing) => {
                    if listing.truncated {
                        log::warn!(
                            "REPO: listing under {:?} truncated at {} keys",
                            prefix,
                            listing.keys.len()
                        );
                    }
                    let keys: Vec<String> = listing
                        .keys
                        .into_iter()
                        .filter(|key| key.ends_with(&extension))
                        .collect();
                    log::debug!("REPO: {} index files under {:?}", keys.len(), prefix);
                    handler(Some(keys));
                }
                Err(e) => {
                    log::error!("REPO: listing under {:?} failed: {}", prefix, e);
                    handler(None);
                }
            }
        });
    }

    pub fn download_file<F>(&self, key: String, dir: PathBuf, handler: F)
    where
        F: Fn(FileOutcome) + Send + Sync + 'static,
    {
        self.download_files(vec![key], dir, handler);
    }

    /// Download every key into `dir` as one batch
    ///
    /// The handler runs once per key with the batch counters at that point;
    /// exactly one call observes `completed == count`. An empty key list is
    /// reported as a single finished, unsuccessful outcome with no key.
    pub fn download_files<F>(&self, keys: Vec<String>, dir: PathBuf, handler: F)
    where
        F: Fn(FileOutcome) + Send + Sync + 'static,
    {
        if keys.is_empty() {
            log::warn!("REPO: empty download batch");
            handler(FileOutcome {
                key: String::new(),
                path: dir,
                ok: false,
                batch: DownloadBatch::new(0),
            });
            return;
        }

        let batch = Arc::new(Mutex::new(DownloadBatch::new(keys.len())));
        let handler = Arc::new(handler);
        log::debug!("REPO: downloading {} objects into {}", keys.len(), dir.display());

        for key in keys {
            let store = self.store.clone();
            let batch = batch.clone();
            let handler = handler.clone();
            let dir = dir.clone();

            tokio::spawn(async move {
                let (path, ok) = match local_path(&dir, &key) {
                    Some(path) => match fetch(store.as_ref(), &key, &path).await {
                        Ok(()) => (path, true),
                        Err(e) => {
                            log::error!("REPO: download of '{}' failed: {}", key, e);
                            (path, false)
                        }
                    },
                    None => {
                        log::error!("REPO: key '{}' has no file name", key);
                        (dir.clone(), false)
                    }
                };

                let snapshot = batch.lock().unwrap_or_else(PoisonError::into_inner).record(ok);
                log::debug!(
                    "REPO: '{}' done ({}/{} complete, {} ok)",
                    key,
                    snapshot.completed,
                    snapshot.count,
                    snapshot.success
                );
                handler(FileOutcome {
                    key,
                    path,
                    ok,
                    batch: snapshot,
                });
            });
        }
    }
}

async fn fetch(store: &dyn ObjectStore, key: &str, path: &Path) -> Result<()> {
    let bytes = store.get(key).await?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
