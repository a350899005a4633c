//! Peer table — per-endpoint delivery accounting.

use std::collections::BTreeMap;
use std::time::Instant;

use scatter_core::Endpoint;

/// Tracked state for one peer.
///
/// Rebuilt wholesale on every peer-list reload; counters do not survive.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub endpoint: Endpoint,

    /// Workers receive ring-routed requests. Clients only send them.
    pub is_worker: bool,

    /// Resends since anything was last heard from this peer.
    pub retries_since_last_received: u64,

    /// Excluded from ring routing until this instant. None = active.
    pub sinbin_until: Option<Instant>,

    /// Messages sent to this peer that are still waiting for an ack.
    pub unacked_estimate: u64,
}

impl Peer {
    pub fn new(endpoint: Endpoint, is_worker: bool) -> Self {
        Self {
            endpoint,
            is_worker,
            retries_since_last_received: 0,
            sinbin_until: None,
            unacked_estimate: 0,
        }
    }

    pub fn is_sinbinned(&self, now: Instant) -> bool {
        matches!(self.sinbin_until, Some(until) if now <= until)
    }

    /// Clear an elapsed sinbin. Returns true if one was cleared.
    pub fn expire_sinbin(&mut self, now: Instant) -> bool {
        match self.sinbin_until {
            Some(until) if now > until => {
                self.sinbin_until = None;
                true
            }
            _ => false,
        }
    }

    /// Anything heard from the peer proves it is alive.
    pub fn mark_received(&mut self) {
        self.retries_since_last_received = 0;
        self.sinbin_until = None;
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: BTreeMap<Endpoint, Peer>,
    worker_count: usize,
}

impl PeerTable {
    /// Build a table from the two published lists. An endpoint on both
    /// lists is a worker.
    pub fn from_lists(clients: &[Endpoint], workers: &[Endpoint]) -> Self {
        let mut peers = BTreeMap::new();
        for client in clients {
            peers.insert(*client, Peer::new(*client, false));
        }
        for worker in workers {
            peers.insert(*worker, Peer::new(*worker, true));
        }
        let worker_count = peers.values().filter(|p| p.is_worker).count();
        Self {
            peers,
            worker_count,
        }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&Peer> {
        self.peers.get(endpoint)
    }

    pub fn get_mut(&mut self, endpoint: &Endpoint) -> Option<&mut Peer> {
        self.peers.get_mut(endpoint)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.is_worker)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
