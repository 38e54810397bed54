//! Durable blob storage scoped to one stream instance.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::RelayError;

/// Key the event playlist is persisted under.
pub const PLAYLIST_KEY: &str = "playlist.m3u8";

/// Named blob storage. Failures are reported as `false`/`None`, never as
/// panics; callers decide whether a failed write matters.
pub trait BlobStore: Send + Sync {
    fn exists(&self, key: &str) -> bool;
    fn load(&self, key: &str) -> Option<Bytes>;
    fn save(&self, key: &str, data: &[u8]) -> bool;
    fn delete(&self, key: &str) -> bool;
    /// Removes every blob of this instance.
    fn clear(&self) -> bool;
}

/// Files under a single directory, one file per key.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store for one event, at `<root>/<event_id>/`.
    pub fn for_event(root: impl AsRef<Path>, event_id: &str) -> Result<Self, RelayError> {
        if !is_plain_key(event_id) {
            return Err(RelayError::storage(format!("invalid event id `{event_id}`")));
        }
        Self::new(root.as_ref().join(event_id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        if is_plain_key(key) {
            Some(self.root.join(key))
        } else {
            warn!(key, "refusing storage key outside the instance directory");
            None
        }
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn is_plain_key(key: &str) -> bool {
    !key.is_empty() && key != "." && !key.contains(['/', '\\']) && !key.contains("..")
}

impl BlobStore for FileStore {
    fn exists(&self, key: &str) -> bool {
        self.path(key).is_some_and(|p| p.is_file())
    }

    fn load(&self, key: &str) -> Option<Bytes> {
        let path = self.path(key)?;
        fs::read(path).ok().map(Bytes::from)
    }

    fn save(&self, key: &str, data: &[u8]) -> bool {
        let Some(path) = self.path(key) else {
            return false;
        };
        match self.write_atomic(&path, data) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "failed to persist blob");
                false
            }
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.path(key).is_some_and(|p| fs::remove_file(p).is_ok())
    }

    fn clear(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return false;
        };
        let mut ok = true;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && fs::remove_file(&path).is_err() {
                ok = false;
            }
        }
        ok
    }
}

enum WriteOp {
    Save { key: String, data: Bytes },
    Flush(oneshot::Sender<()>),
}

/// Ordered, non-blocking writes into a [`BlobStore`].
///
/// Writes are queued to a task that performs them one at a time on the
/// blocking pool, so callers may submit while holding a lock on an async
/// worker. Created outside a runtime, the writer saves inline.
#[derive(Clone)]
pub struct BlobWriter {
    store: Arc<dyn BlobStore>,
    queue: Option<mpsc::UnboundedSender<WriteOp>>,
}

impl BlobWriter {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        let queue = match Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::unbounded_channel();
                handle.spawn(run_writer(Arc::clone(&store), rx));
                Some(tx)
            }
            Err(_) => {
                debug!("no runtime, blob writes run inline");
                None
            }
        };
        Self { store, queue }
    }

    /// Queues `data` to be saved under `key`. Failures are logged.
    pub fn save(&self, key: impl Into<String>, data: Bytes) {
        let op = WriteOp::Save {
            key: key.into(),
            data,
        };
        let op = match &self.queue {
            Some(queue) => match queue.send(op) {
                Ok(()) => return,
                Err(mpsc::error::SendError(op)) => op,
            },
            None => op,
        };
        if let WriteOp::Save { key, data } = op {
            save_logged(&*self.store, &key, &data);
        }
    }

    /// Resolves once every write queued before the call has finished.
    pub async fn flush(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        let (done, finished) = oneshot::channel();
        if queue.send(WriteOp::Flush(done)).is_ok() {
            let _ = finished.await;
        }
    }
}

fn save_logged(store: &dyn BlobStore, key: &str, data: &[u8]) -> bool {
    let saved = store.save(key, data);
    if !saved {
        warn!(key, "failed to persist blob");
    }
    saved
}

async fn run_writer(store: Arc<dyn BlobStore>, mut queue: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = queue.recv().await {
        match op {
            WriteOp::Save { key, data } => {
                let store = Arc::clone(&store);
                let written =
                    tokio::task::spawn_blocking(move || save_logged(&*store, &key, &data)).await;
                if let Err(e) = written {
                    warn!(error = %e, "blob write task failed");
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("blob writer drained");
}

/// In-memory store, for streams that need no persistence across restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl BlobStore for MemoryStore {
    fn exists(&self, key: &str) -> bool {
        self.blobs.lock().contains_key(key)
    }

    fn load(&self, key: &str) -> Option<Bytes> {
        self.blobs.lock().get(key).cloned()
    }

    fn save(&self, key: &str, data: &[u8]) -> bool {
        self.blobs
            .lock()
            .insert(key.to_owned(), Bytes::copy_from_slice(data));
        true
    }

    fn delete(&self, key: &str) -> bool {
        self.blobs.lock().remove(key).is_some()
    }

    fn clear(&self) -> bool {
        self.blobs.lock().clear();
        true
    }
}
