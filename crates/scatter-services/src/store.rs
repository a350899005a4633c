//! Content-addressable object store.
//!
//! Objects live under a local cache root, nested by id:
//!   {local_root}/ab/cd/ef/{rest-of-id}
//!
//! A remote backend (HTTP or shared directory) with the same layout makes
//! objects visible to other nodes. Reads fall through to the remote and
//! cache the result. Writes land locally first and are uploaded when the
//! write stream is closed. Objects are immutable once closed, apart from
//! the well-known ids rewritten through `replace`.

use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use bytes::Bytes;
use memmap2::Mmap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use scatter_core::config::StoreConfig;
use scatter_core::ObjectId;

use crate::remote::RemoteBackend;

const PARTIAL_SUFFIX: &str = "partial";

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {0} already exists")]
    AlreadyExists(ObjectId),

    #[error("object {0} is being written by another local writer")]
    Locked(ObjectId),

    #[error("object {id} not available after {waited:?}")]
    Timeout { id: ObjectId, waited: Duration },

    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("remote store: {0:#}")]
    Remote(anyhow::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    local_root: PathBuf,
    remote: Option<RemoteBackend>,
}

impl ObjectStore {
    pub fn new(local_root: impl Into<PathBuf>, remote: Option<RemoteBackend>) -> anyhow::Result<Self> {
        let local_root = local_root.into();
        std::fs::create_dir_all(&local_root)
            .with_context(|| format!("failed to create store root: {}", local_root.display()))?;
        Ok(Self { local_root, remote })
    }

    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        let remote = RemoteBackend::parse(&config.remote)
            .with_context(|| format!("invalid store.remote {:?}", config.remote))?;
        Self::new(&config.local_root, remote)
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn remote(&self) -> Option<&RemoteBackend> {
        self.remote.as_ref()
    }

    pub fn local_path(&self, id: &ObjectId) -> PathBuf {
        let mut path = self.local_root.clone();
        for segment in id.path_segments() {
            path.push(segment);
        }
        path
    }

    /// Open an object for reading, fetching it from the remote if needed.
    ///
    /// Keeps retrying with backoff until `timeout` has passed, since the
    /// producer may not have uploaded it yet.
    pub async fn open_ro(&self, id: &ObjectId, timeout: Duration) -> Result<ReadStream, StoreError> {
        let path = self.local_path(id);
        let started = Instant::now();
        let deadline = started + timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match tokio::fs::File::open(&path).await {
                Ok(file) => return Ok(ReadStream { file, path }),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path)(e)),
            }

            if let Some(remote) = &self.remote {
                match self.fetch_into_place(remote, id, &path).await {
                    Ok(true) => {
                        tracing::debug!(id = id.short(), "object fetched from remote");
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(id = id.short(), error = %e, "remote fetch failed"),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Timeout {
                    id: *id,
                    waited: now.duration_since(started),
                });
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn fetch_into_place(
        &self,
        remote: &RemoteBackend,
        id: &ObjectId,
        path: &Path,
    ) -> Result<bool, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let tmp = path.with_extension(format!("fetch-{:08x}", rand::random::<u32>()));
        let fetched = remote.fetch(id, &tmp).await;
        match fetched {
            Ok(true) => {
                tokio::fs::rename(&tmp, path).await.map_err(io_err(path))?;
                Ok(true)
            }
            Ok(false) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Ok(false)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(StoreError::Remote(e))
            }
        }
    }

    /// Create a new object. Fails if it already exists locally or another
    /// local writer holds it.
    pub fn create_wo(&self, id: &ObjectId) -> Result<WriteStream, StoreError> {
        if self.local_path(id).exists() {
            return Err(StoreError::AlreadyExists(*id));
        }
        self.open_writer(id)
    }

    fn open_writer(&self, id: &ObjectId) -> Result<WriteStream, StoreError> {
        let path = self.local_path(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let partial = path.with_extension(PARTIAL_SUFFIX);
        // No truncate until the lock is ours.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&partial)
            .map_err(io_err(&partial))?;

        // SAFETY: flock on a descriptor we own; the lock lives as long as the fd.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(StoreError::Locked(*id));
            }
            return Err(io_err(&partial)(err));
        }
        file.set_len(0).map_err(io_err(&partial))?;

        Ok(WriteStream {
            file: Some(tokio::fs::File::from_std(file)),
            id: *id,
            path,
            partial,
            remote: self.remote.clone(),
        })
    }

    /// Remove the object from the remote, then locally.
    pub async fn erase(&self, id: &ObjectId) -> Result<(), StoreError> {
        if let Some(remote) = &self.remote {
            remote.delete(id).await.map_err(StoreError::Remote)?;
        }
        self.evict_local(id)?;
        tracing::debug!(id = id.short(), "object erased");
        Ok(())
    }

    /// Last modification time. The remote is authoritative when configured.
    pub async fn get_mtime(&self, id: &ObjectId) -> Result<Option<SystemTime>, StoreError> {
        if let Some(remote) = &self.remote {
            if let Some(stat) = remote.stat(id).await.map_err(StoreError::Remote)? {
                return Ok(stat.modified.or(Some(SystemTime::UNIX_EPOCH)));
            }
        }
        let path = self.local_path(id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.modified().map_err(io_err(&path))?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// A local copy is enough; otherwise ask the remote.
    pub async fn exists(&self, id: &ObjectId) -> Result<bool, StoreError> {
        if self.local_path(id).exists() {
            return Ok(true);
        }
        match &self.remote {
            Some(remote) => Ok(remote.stat(id).await.map_err(StoreError::Remote)?.is_some()),
            None => Ok(false),
        }
    }

    /// Write a whole object. Returns false if it already existed, which is
    /// not an error: same id means same content.
    pub async fn put(&self, id: &ObjectId, data: &[u8]) -> Result<bool, StoreError> {
        if self.exists(id).await? {
            return Ok(false);
        }
        let mut stream = match self.create_wo(id) {
            Ok(stream) => stream,
            Err(StoreError::AlreadyExists(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        stream
            .write_all(data)
            .await
            .map_err(io_err(&self.local_path(id)))?;
        stream.close().await?;
        Ok(true)
    }

    /// Overwrite an object in place, locally and remotely.
    ///
    /// Only for the few mutable objects with well-known ids. Both the local
    /// rename and the remote upload swap the content atomically, so a
    /// concurrent reader sees the old or the new version, never a gap.
    pub async fn replace(&self, id: &ObjectId, data: &[u8]) -> Result<(), StoreError> {
        let mut stream = self.open_writer(id)?;
        stream
            .write_all(data)
            .await
            .map_err(io_err(&self.local_path(id)))?;
        stream.close().await
    }

    /// Read a whole object, waiting up to `timeout` for it to appear.
    pub async fn load(&self, id: &ObjectId, timeout: Duration) -> Result<Bytes, StoreError> {
        let stream = self.open_ro(id, timeout).await?;
        let path = stream.path;
        drop(stream.file);

        let file = std::fs::File::open(&path).map_err(io_err(&path))?;
        let len = file.metadata().map_err(io_err(&path))?.len();
        if len == 0 {
            return Ok(Bytes::new());
        }
        // SAFETY: objects are immutable once renamed into place.
        let mmap = unsafe { Mmap::map(&file).map_err(io_err(&path))? };
        Ok(Bytes::copy_from_slice(&mmap))
    }

    /// Drop the local copy only. Returns true if there was one.
    pub fn evict_local(&self, id: &ObjectId) -> Result<bool, StoreError> {
        let path = self.local_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    pub fn clear_local(&self) {
        if let Ok(entries) = std::fs::read_dir(&self.local_root) {
            for entry in entries.flatten() {
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
    }

    /// Complete objects in the local cache.
    pub fn local_count(&self) -> usize {
        fn walk(dir: &Path) -> usize {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|entry| {
                    let path = entry.path();
                    if path.is_dir() {
                        walk(&path)
                    } else if path.extension().is_none() {
                        1
                    } else {
                        0
                    }
                })
                .sum()
        }
        walk(&self.local_root)
    }
}

/// A local, complete object open for reading.
#[derive(Debug)]
pub struct ReadStream {
    file: tokio::fs::File,
    path: PathBuf,
}

impl ReadStream {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsyncRead for ReadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

/// An object being written. Holds an exclusive lock until dropped or closed.
///
/// Nothing is visible, locally or remotely, until `close` succeeds.
/// Dropping without closing discards the data.
pub struct WriteStream {
    file: Option<tokio::fs::File>,
    id: ObjectId,
    path: PathBuf,
    partial: PathBuf,
    remote: Option<RemoteBackend>,
}

impl WriteStream {
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Flush, move into place, and upload.
    ///
    /// If the upload fails the local copy is removed again, so a retry
    /// starts from a clean slate.
    pub async fn close(mut self) -> Result<(), StoreError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush().await.map_err(io_err(&self.partial))?;
        file.sync_all().await.map_err(io_err(&self.partial))?;
        tokio::fs::rename(&self.partial, &self.path)
            .await
            .map_err(io_err(&self.path))?;
        // Lock released only after the rename.
        drop(file);

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.store(&self.id, &self.path).await {
                let _ = tokio::fs::remove_file(&self.path).await;
                return Err(StoreError::Remote(e));
            }
        }
        tracing::debug!(id = self.id.short(), "object written");
        Ok(())
    }

    fn file_mut(&mut self) -> io::Result<&mut tokio::fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write stream closed"))
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}

impl AsyncWrite for WriteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.file_mut() {
            Ok(file) => Pin::new(file).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.file_mut() {
            Ok(file) => Pin::new(file).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.file_mut() {
            Ok(file) => Pin::new(file).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
