//! Consistent-hash ring over worker endpoints.
//!
//! Each worker occupies `replicas` positions so load spreads evenly.
//! The ring only orders candidates; deciding whether a candidate is
//! acceptable (sinbinned, overcommitted) is the messenger's job.

use scatter_core::Endpoint;

/// Ring position of an arbitrary key: the first 8 bytes of its BLAKE3
/// digest, little-endian.
pub fn ring_hash(key: &[u8]) -> u64 {
    let digest = blake3::hash(key);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

#[derive(Debug, Clone, Default)]
pub struct PeerRing {
    /// Sorted by (position, endpoint).
    entries: Vec<(u64, Endpoint)>,
}

impl PeerRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ring from scratch.
    pub fn build(workers: impl IntoIterator<Item = Endpoint>, replicas: u32) -> Self {
        let mut ring = Self::new();
        for worker in workers {
            ring.push_replicas(worker, replicas);
        }
        ring.entries.sort_unstable();
        ring
    }

    /// Add one peer at `replicas` positions.
    pub fn insert(&mut self, endpoint: Endpoint, replicas: u32) {
        self.push_replicas(endpoint, replicas);
        self.entries.sort_unstable();
    }

    fn push_replicas(&mut self, endpoint: Endpoint, replicas: u32) {
        self.entries.extend(
            (0..replicas).map(|i| (ring_hash(&endpoint.replica_key(i)), endpoint)),
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every ring entry, starting at the first position ≥ hash(key) and
    /// wrapping around once. Physical peers repeat, one per replica.
    pub fn candidates(&self, key: &[u8]) -> Candidates<'_> {
        let position = ring_hash(key);
        let start = self.entries.partition_point(|(p, _)| *p < position);
        Candidates {
            entries: &self.entries,
            start,
            taken: 0,
        }
    }
}

pub struct Candidates<'a> {
    entries: &'a [(u64, Endpoint)],
    start: usize,
    taken: usize,
}

impl Iterator for Candidates<'_> {
    type Item = Endpoint;

    fn next(&mut self) -> Option<Endpoint> {
        if self.taken >= self.entries.len() {
            return None;
        }
        let idx = (self.start + self.taken) % self.entries.len();
        self.taken += 1;
        Some(self.entries[idx].1)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.entries.len() - self.taken;
        (left, Some(left))
    }
}
