use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use keto_core::{Error, NodeId, NodeTags, Pool, Result};

use crate::provider::TagStore;

/// On-disk layout of a [`FileTagStore`].
///
/// ```json
/// {
///   "pools": [{ "name": "compute", "nodes": ["i-1"], "tags": { "Role": "compute" } }],
///   "nodes": { "i-1": { "KubeletToken": "Success" } }
/// }
/// ```
///
/// A node listed in a pool but missing from `nodes` has no tags of its own.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TagDocument {
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeTags>,
}

impl TagDocument {
    fn knows(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id) || self.pools.iter().any(|p| p.nodes.contains(id))
    }
}

/// Tag store backed by a JSON file shared between processes.
///
/// Every operation takes an advisory lock on the file (shared for reads,
/// exclusive for writes), so a server and a client on the same host can
/// use one document without trampling each other's updates.
pub struct FileTagStore {
    path: PathBuf,
    node_id: Option<NodeId>,
}

impl FileTagStore {
    pub fn new(path: impl Into<PathBuf>, node_id: Option<NodeId>) -> Self {
        Self {
            path: path.into(),
            node_id,
        }
    }

    async fn read_doc(&self) -> Result<TagDocument> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut lock = DocLock::acquire(&path, false)?;
            load(&mut lock.file, &path)
        })
        .await
        .map_err(|e| Error::Store(format!("tag store task failed: {e}")))?
    }

    async fn update_doc<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut TagDocument) -> Result<()> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut lock = DocLock::acquire(&path, true)?;
            let mut doc = load(&mut lock.file, &path)?;
            mutate(&mut doc)?;
            store(&mut lock.file, &path, &doc)
        })
        .await
        .map_err(|e| Error::Store(format!("tag store task failed: {e}")))?
    }
}

/// Advisory lock on the tag document, released on drop.
struct DocLock {
    file: File,
    path: PathBuf,
}

impl DocLock {
    /// Block until the lock is held: shared for readers, exclusive for writers.
    fn acquire(path: &Path, exclusive: bool) -> Result<Self> {
        let file = open(path, exclusive)?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| io_err(path, e))?;
        debug!(path = %path.display(), exclusive, "Locked tag document");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for DocLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            error!(
                path = %self.path.display(),
                error = %e,
                "Failed to release tag document lock"
            );
        }
    }
}

fn io_err(path: &Path, e: std::io::Error) -> Error {
    Error::Store(format!("{}: {e}", path.display()))
}

fn open(path: &Path, write: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .open(path)
        .map_err(|e| io_err(path, e))
}

fn load(file: &mut File, path: &Path) -> Result<TagDocument> {
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| io_err(path, e))?;
    if content.trim().is_empty() {
        return Ok(TagDocument::default());
    }
    serde_json::from_str(&content)
        .map_err(|e| Error::Store(format!("invalid tag document {}: {e}", path.display())))
}

fn store(file: &mut File, path: &Path, doc: &TagDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| Error::Store(format!("failed to encode tag document: {e}")))?;
    file.seek(SeekFrom::Start(0)).map_err(|e| io_err(path, e))?;
    file.set_len(0).map_err(|e| io_err(path, e))?;
    file.write_all(json.as_bytes())
        .map_err(|e| io_err(path, e))?;
    file.sync_all().map_err(|e| io_err(path, e))
}

#[async_trait]
impl TagStore for FileTagStore {
    async fn node_id(&self) -> Result<NodeId> {
        self.node_id.clone().ok_or_else(|| {
            Error::ConfigInvalid("no node id configured for the file tag store".into())
        })
    }

    async fn describe_pools(&self, filter: &NodeTags) -> Result<Vec<Pool>> {
        let doc = self.read_doc().await?;
        Ok(doc.pools.into_iter().filter(|p| p.matches(filter)).collect())
    }

    async fn node_tags(&self, id: &NodeId) -> Result<NodeTags> {
        let doc = self.read_doc().await?;
        if !doc.knows(id) {
            return Err(Error::NotFound(id.clone()));
        }
        Ok(doc.nodes.get(id).cloned().unwrap_or_default())
    }

    async fn set_node_tags(&self, id: &NodeId, tags: &NodeTags) -> Result<()> {
        let id = id.clone();
        let tags = tags.clone();
        debug!(node = %id, tags = %tags, path = %self.path.display(), "writing node tags");
        self.update_doc(move |doc| {
            if !doc.knows(&id) {
                return Err(Error::NotFound(id));
            }
            doc.nodes.entry(id).or_default().merge(&tags);
            Ok(())
        })
        .await
    }
}
