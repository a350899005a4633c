//! Remote backing stores for the object store.
//!
//! Two flavours share one path layout (`ab/cd/ef/<rest>`):
//!   - `Http`: a WebDAV-style server. GET, chunked PUT, DELETE, MKCOL, HEAD.
//!   - `Dir`:  a directory every node can see (NFS mount, or a temp dir in tests).
//!
//! Nothing here retries. The store's `open_ro` loop is the only retry point.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use scatter_core::ObjectId;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What a remote knows about one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub modified: Option<SystemTime>,
    pub len: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum RemoteBackend {
    Http { client: reqwest::Client, base: String },
    Dir { root: PathBuf },
}

/// `ab/cd/ef/<rest>` for an id.
pub fn object_path(id: &ObjectId) -> String {
    id.path_segments().join("/")
}

impl RemoteBackend {
    /// Parse a `store.remote` setting. Empty means no remote.
    pub fn parse(spec: &str) -> Result<Option<Self>> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(None);
        }
        if spec.starts_with("http://") || spec.starts_with("https://") {
            return Self::http(spec).map(Some);
        }
        Ok(Some(Self::dir(spec)))
    }

    pub fn http(base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::Http {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(root: impl Into<PathBuf>) -> Self {
        Self::Dir { root: root.into() }
    }

    /// Download `id` into `dest`. Ok(false) if the remote does not have it (yet).
    pub async fn fetch(&self, id: &ObjectId, dest: &Path) -> Result<bool> {
        match self {
            Self::Http { client, base } => {
                let url = format!("{base}/{}", object_path(id));
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("GET {url}"))?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok(false);
                }
                if !resp.status().is_success() {
                    bail!("GET {url}: {}", resp.status());
                }

                let mut file = tokio::fs::File::create(dest)
                    .await
                    .with_context(|| format!("create {}", dest.display()))?;
                let mut body = resp.bytes_stream();
                while let Some(chunk) = body.next().await {
                    let chunk = chunk.with_context(|| format!("GET {url}: body"))?;
                    file.write_all(&chunk).await.context("write fetched object")?;
                }
                file.sync_all().await.context("sync fetched object")?;
                Ok(true)
            }
            Self::Dir { root } => {
                let src = root.join(object_path(id));
                match tokio::fs::copy(&src, dest).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e).with_context(|| format!("copy {}", src.display())),
                }
            }
        }
    }

    /// Upload a complete local file as `id`, creating parent collections first.
    pub async fn store(&self, id: &ObjectId, src: &Path) -> Result<()> {
        match self {
            Self::Http { client, base } => {
                let segments = id.path_segments();
                let mkcol = Method::from_bytes(b"MKCOL").context("MKCOL method")?;
                let mut collection = base.clone();
                for segment in &segments[..segments.len() - 1] {
                    collection.push('/');
                    collection.push_str(segment);
                    let url = format!("{collection}/");
                    let resp = client
                        .request(mkcol.clone(), &url)
                        .send()
                        .await
                        .with_context(|| format!("MKCOL {url}"))?;
                    let status = resp.status();
                    // 405/409/301 all mean the collection is already there.
                    if !status.is_success()
                        && status != StatusCode::METHOD_NOT_ALLOWED
                        && status != StatusCode::CONFLICT
                        && status != StatusCode::MOVED_PERMANENTLY
                    {
                        bail!("MKCOL {url}: {status}");
                    }
                }

                let url = format!("{base}/{}", object_path(id));
                let file = tokio::fs::File::open(src)
                    .await
                    .with_context(|| format!("open {}", src.display()))?;
                let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
                let resp = client
                    .put(&url)
                    .body(body)
                    .send()
                    .await
                    .with_context(|| format!("PUT {url}"))?;
                if !resp.status().is_success() {
                    bail!("PUT {url}: {}", resp.status());
                }
                tracing::debug!(%url, "object uploaded");
                Ok(())
            }
            Self::Dir { root } => {
                let dest = root.join(object_path(id));
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                let tmp = dest.with_extension(format!("upload-{}", rand::random::<u32>()));
                tokio::fs::copy(src, &tmp)
                    .await
                    .with_context(|| format!("copy to {}", tmp.display()))?;
                tokio::fs::rename(&tmp, &dest)
                    .await
                    .with_context(|| format!("rename into {}", dest.display()))?;
                Ok(())
            }
        }
    }

    /// Delete `id`. Deleting something already gone succeeds.
    pub async fn delete(&self, id: &ObjectId) -> Result<()> {
        match self {
            Self::Http { client, base } => {
                let url = format!("{base}/{}", object_path(id));
                let resp = client
                    .delete(&url)
                    .send()
                    .await
                    .with_context(|| format!("DELETE {url}"))?;
                let status = resp.status();
                if status.is_success() || status == StatusCode::NOT_FOUND {
                    Ok(())
                } else {
                    bail!("DELETE {url}: {status}")
                }
            }
            Self::Dir { root } => {
                let path = root.join(object_path(id));
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
                }
            }
        }
    }

    /// None if the remote does not have `id`.
    pub async fn stat(&self, id: &ObjectId) -> Result<Option<RemoteStat>> {
        match self {
            Self::Http { client, base } => {
                let url = format!("{base}/{}", object_path(id));
                let resp = client
                    .head(&url)
                    .send()
                    .await
                    .with_context(|| format!("HEAD {url}"))?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !resp.status().is_success() {
                    bail!("HEAD {url}: {}", resp.status());
                }
                let modified = resp
                    .headers()
                    .get(reqwest::header::LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_http_date);
                let len = resp
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                Ok(Some(RemoteStat { modified, len }))
            }
            Self::Dir { root } => {
                let path = root.join(object_path(id));
                match tokio::fs::metadata(&path).await {
                    Ok(meta) => Ok(Some(RemoteStat {
                        modified: meta.modified().ok(),
                        len: Some(meta.len()),
                    })),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
                }
            }
        }
    }
}

/// `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(SystemTime::from)
}

/// The inverse of `parse_http_date`, for servers.
pub fn format_http_date(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
