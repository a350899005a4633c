//! Peer lists — who is in the fleet.
//!
//! Two well-known store objects hold newline-separated `address:port`
//! lines: one for clients, one for workers. Both sides poll their
//! modification times and rebuild the messenger's peer table when either
//! changes.

use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};

use scatter_core::{Endpoint, EndpointError, ObjectId};

use crate::messenger::Messenger;
use crate::store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerListKind {
    Client,
    Worker,
}

impl PeerListKind {
    pub fn object_id(self) -> ObjectId {
        match self {
            PeerListKind::Client => ObjectId::CLIENT_PEER_LIST,
            PeerListKind::Worker => ObjectId::WORKER_PEER_LIST,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PeerListKind::Client => "client",
            PeerListKind::Worker => "worker",
        }
    }
}

impl std::str::FromStr for PeerListKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client" | "clients" => Ok(PeerListKind::Client),
            "worker" | "workers" => Ok(PeerListKind::Worker),
            other => anyhow::bail!("unknown peer list {other:?} (expected client or worker)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("peer list line {line}: {source}")]
pub struct PeerListError {
    pub line: usize,
    #[source]
    pub source: EndpointError,
}

/// One endpoint per line. Blank lines are skipped; anything else that
/// does not parse fails the whole list.
pub fn parse_peer_list(text: &str) -> Result<Vec<Endpoint>, PeerListError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            line.parse()
                .map_err(|source| PeerListError { line: i + 1, source })
        })
        .collect()
}

pub fn format_peer_list(endpoints: &[Endpoint]) -> String {
    endpoints.iter().map(|e| format!("{e}\n")).collect()
}

/// Replace a published list in place. Readers polling concurrently see
/// either the old list or the new one.
pub async fn publish_peer_list(
    store: &ObjectStore,
    kind: PeerListKind,
    endpoints: &[Endpoint],
) -> Result<()> {
    store
        .replace(&kind.object_id(), format_peer_list(endpoints).as_bytes())
        .await
        .with_context(|| format!("publish {} list", kind.name()))?;
    tracing::info!(list = kind.name(), peers = endpoints.len(), "peer list published");
    Ok(())
}

/// Raw lines of both lists, always fetched fresh. A list that was never
/// published reads as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStrings {
    pub clients: Vec<String>,
    pub workers: Vec<String>,
}

pub async fn peer_string_lists(store: &ObjectStore, timeout: Duration) -> Result<PeerStrings> {
    Ok(PeerStrings {
        clients: fetch_lines(store, PeerListKind::Client, timeout).await?,
        workers: fetch_lines(store, PeerListKind::Worker, timeout).await?,
    })
}

async fn fetch_lines(store: &ObjectStore, kind: PeerListKind, timeout: Duration) -> Result<Vec<String>> {
    let id = kind.object_id();
    if store.remote().is_some() {
        // The cached copy may be stale.
        store.evict_local(&id)?;
    }
    if !store.exists(&id).await? {
        return Ok(Vec::new());
    }
    let bytes = store
        .load(&id, timeout)
        .await
        .with_context(|| format!("load {} list", kind.name()))?;
    let text = std::str::from_utf8(&bytes)
        .with_context(|| format!("{} list is not UTF-8", kind.name()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Decides when the peer lists need reloading.
#[derive(Debug)]
pub struct PeerListWatcher {
    interval: Duration,
    load_timeout: Duration,
    next_check: Instant,
    seen: [Option<SystemTime>; 2],
    loaded_once: bool,
}

impl PeerListWatcher {
    /// The first `refresh_if_due` always checks.
    pub fn new(interval: Duration, load_timeout: Duration) -> Self {
        Self {
            interval,
            load_timeout,
            next_check: Instant::now(),
            seen: [None, None],
            loaded_once: false,
        }
    }

    /// Check the lists if the interval has passed. Returns true if the
    /// messenger's peers were replaced.
    pub async fn refresh_if_due(&mut self, store: &ObjectStore, messenger: &mut Messenger) -> Result<bool> {
        if Instant::now() < self.next_check {
            return Ok(false);
        }
        self.refresh(store, messenger).await
    }

    /// Check now, regardless of the interval.
    pub async fn refresh(&mut self, store: &ObjectStore, messenger: &mut Messenger) -> Result<bool> {
        self.next_check = Instant::now() + self.interval;
        let current = [
            store.get_mtime(&PeerListKind::Client.object_id()).await?,
            store.get_mtime(&PeerListKind::Worker.object_id()).await?,
        ];
        if self.loaded_once && current == self.seen {
            return Ok(false);
        }

        let strings = peer_string_lists(store, self.load_timeout).await?;
        let clients = parse_lines(&strings.clients, PeerListKind::Client)?;
        let workers = parse_lines(&strings.workers, PeerListKind::Worker)?;
        tracing::info!(
            clients = clients.len(),
            workers = workers.len(),
            "peer lists changed, reloading"
        );
        messenger.set_peers(&clients, &workers);
        self.seen = current;
        self.loaded_once = true;
        Ok(true)
    }
}

fn parse_lines(lines: &[String], kind: PeerListKind) -> Result<Vec<Endpoint>> {
    parse_peer_list(&lines.join("\n")).with_context(|| format!("malformed {} peer list", kind.name()))
}
