//! Scatter integration test harness.
//!
//! Every test builds a small fleet inside the test process: nodes bound
//! to loopback UDP ports, workers running as tokio tasks, and an
//! in-process HTTP server standing in for the remote object store.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=scatter_services=debug to watch the protocol.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::task::JoinHandle;

use scatter_core::config::MessengerConfig;
use scatter_core::{Endpoint, ObjectId};
use scatter_services::remote::format_http_date;
use scatter_services::{
    publish_peer_list, Messenger, ObjectStore, PeerListKind, PeerListWatcher, RemoteBackend,
    WorkDistributor, WorkItem,
};

mod dispatch;
mod store;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);
static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Fresh, empty directory unique to this process and call.
pub fn temp_dir(tag: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("scatter-it-{tag}-{}-{n}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Loopback, OS-assigned port.
pub fn loopback() -> Endpoint {
    Endpoint::new(std::net::Ipv4Addr::LOCALHOST, 0)
}

/// Short timeouts so retries and sinbins happen within a test run.
pub fn fast_messenger() -> MessengerConfig {
    MessengerConfig {
        ack_timeout_ms: 100,
        ..MessengerConfig::default()
    }
}

// ── Remote store server ───────────────────────────────────────────────────────

/// Minimal WebDAV-ish server over a directory: GET, HEAD, PUT, DELETE, MKCOL.
pub struct DavServer {
    pub url: String,
    pub root: PathBuf,
    handle: JoinHandle<()>,
}

impl Drop for DavServer {
    fn drop(&mut self) {
        self.handle.abort();
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub async fn start_dav_server() -> Result<DavServer> {
    let root = temp_dir("dav");
    let app = Router::new().fallback(dav).with_state(Arc::new(root.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(DavServer {
        url: format!("http://{addr}/objects"),
        root,
        handle,
    })
}

async fn dav(State(root): State<Arc<PathBuf>>, req: Request) -> Response {
    let Some(rel) = req.uri().path().strip_prefix("/objects/") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if rel.split('/').any(|seg| seg == "..") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let path = root.join(rel.trim_end_matches('/'));

    match req.method().as_str() {
        "GET" => match tokio::fs::read(&path).await {
            Ok(data) => (StatusCode::OK, data).into_response(),
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        "HEAD" => match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                let modified = meta.modified().map(format_http_date).unwrap_or_default();
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::LAST_MODIFIED, modified)
                    .header(header::CONTENT_LENGTH, meta.len())
                    .body(Body::empty())
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            _ => StatusCode::NOT_FOUND.into_response(),
        },
        "PUT" => {
            if !path.parent().is_some_and(Path::is_dir) {
                return StatusCode::CONFLICT.into_response();
            }
            let Ok(body) = axum::body::to_bytes(req.into_body(), usize::MAX).await else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            let tmp = path.with_extension("put");
            if tokio::fs::write(&tmp, &body).await.is_err()
                || tokio::fs::rename(&tmp, &path).await.is_err()
            {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            StatusCode::CREATED.into_response()
        }
        "DELETE" => match tokio::fs::remove_file(&path).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        "MKCOL" => {
            if path.exists() {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            match tokio::fs::create_dir(&path).await {
                Ok(()) => StatusCode::CREATED.into_response(),
                Err(_) => StatusCode::CONFLICT.into_response(),
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

/// A store with its own empty cache, backed by the shared server.
pub fn node_store(server: &DavServer) -> Result<ObjectStore> {
    let remote = RemoteBackend::http(&server.url)?;
    ObjectStore::new(temp_dir("node"), Some(remote))
}

/// A bound but not yet peered node.
pub fn node(server: &DavServer, config: MessengerConfig) -> Result<WorkDistributor> {
    let messenger = Messenger::bind(loopback(), config)?;
    let watcher = PeerListWatcher::new(Duration::from_secs(60), Duration::from_secs(5));
    Ok(WorkDistributor::new(messenger, node_store(server)?, watcher))
}

/// Publish both lists through the remote, then have every node load them.
pub async fn form_fleet<'a>(
    server: &DavServer,
    clients: &mut [&'a mut WorkDistributor],
    workers: &mut [&'a mut WorkDistributor],
) -> Result<()> {
    let client_eps: Vec<_> = clients.iter().map(|n| n.local_endpoint()).collect();
    let worker_eps: Vec<_> = workers.iter().map(|n| n.local_endpoint()).collect();
    let publisher = node_store(server)?;
    publish_peer_list(&publisher, PeerListKind::Client, &client_eps).await?;
    publish_peer_list(&publisher, PeerListKind::Worker, &worker_eps).await?;
    for node in clients.iter_mut().chain(workers.iter_mut()) {
        node.refresh_peers().await?;
    }
    let _ = std::fs::remove_dir_all(publisher.local_root());
    Ok(())
}

/// Reads the input object, appends `command`, stores the result under the
/// request's derived output id.
pub async fn append_handler(store: ObjectStore, item: WorkItem) -> Result<ObjectId> {
    let input = store
        .load(&item.resource_id, Duration::from_secs(5))
        .await
        .context("load input")?;
    let mut output = input.to_vec();
    output.extend_from_slice(&item.command);
    let id = item.output_id();
    store.put(&id, &output).await.context("store output")?;
    Ok(id)
}

/// Run `node` as an appending worker until the handle is aborted.
pub fn spawn_append_worker(mut node: WorkDistributor) -> JoinHandle<Result<()>> {
    let store = node.store().clone();
    tokio::spawn(async move {
        node.process_requests(move |item| append_handler(store.clone(), item))
            .await
    })
}
