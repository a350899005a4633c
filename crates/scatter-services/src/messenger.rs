//! Reliable messenger — checksummed, acknowledged datagrams.
//!
//! Every non-ack message is held in the awaiting-ack set until the peer
//! acks it. Messages that wait longer than the ack timeout are resent
//! from inside `receive`, so retries happen while the caller is idle.
//! A peer that keeps missing acks is sinbinned: ring routing skips it
//! until the window passes or it is heard from again.
//!
//! Delivery is at-least-once. Duplicate requests are not filtered; the
//! work layer is idempotent by resource id.
//!
//! One messenger owns one socket and all protocol state. Every operation
//! takes `&mut self`, so there is never more than one caller in flight.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use scatter_core::config::MessengerConfig;
use scatter_core::wire::{new_message_id, MAX_MESSAGE_SIZE};
use scatter_core::{Endpoint, Message, ObjectId, WireError};

use crate::peer::{Peer, PeerTable};
use crate::ring::PeerRing;
use crate::transport::DatagramSocket;

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("message has neither a resource id nor an endpoint")]
    Unaddressed,

    #[error("no eligible worker for resource {0}")]
    NoPeerAvailable(ObjectId),

    #[error("incoming message {0:#018x} collides with one awaiting ack")]
    InFlightCollision(u64),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone)]
struct InFlight {
    message: Message,
    sent_at: Instant,
}

/// Snapshot for logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessengerStats {
    pub peers: usize,
    pub workers: usize,
    pub sinbinned: usize,
    pub awaiting_ack: usize,
}

/// A peer carrying noticeably more than its share of outstanding work.
pub fn overcommitted(
    unacked: u64,
    awaiting_total: usize,
    workers: usize,
    floor: u64,
    ratio: f64,
) -> bool {
    if unacked <= floor {
        return false;
    }
    let fair_share = awaiting_total as f64 / workers.max(1) as f64;
    unacked as f64 > ratio * fair_share
}

pub struct Messenger {
    socket: DatagramSocket,
    config: MessengerConfig,
    peers: PeerTable,
    ring: PeerRing,
    /// Ordered by message id, which is roughly send order.
    awaiting_ack: BTreeMap<u64, InFlight>,
    recv_buf: Vec<u8>,
}

impl Messenger {
    pub fn new(socket: DatagramSocket, config: MessengerConfig) -> Self {
        Self {
            socket,
            config,
            peers: PeerTable::default(),
            ring: PeerRing::new(),
            awaiting_ack: BTreeMap::new(),
            recv_buf: vec![0u8; MAX_MESSAGE_SIZE + 1],
        }
    }

    /// Bind a socket and wrap it. Failure here is a setup error.
    pub fn bind(endpoint: Endpoint, config: MessengerConfig) -> Result<Self> {
        let socket = DatagramSocket::bind(endpoint)
            .with_context(|| format!("messenger cannot bind {endpoint}"))?;
        Ok(Self::new(socket, config))
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.socket.local_endpoint()
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn peer(&self, endpoint: &Endpoint) -> Option<&Peer> {
        self.peers.get(endpoint)
    }

    pub fn awaiting_ack(&self) -> usize {
        self.awaiting_ack.len()
    }

    pub fn stats(&self) -> MessengerStats {
        let now = Instant::now();
        MessengerStats {
            peers: self.peers.len(),
            workers: self.peers.worker_count(),
            sinbinned: self.peers.iter().filter(|p| p.is_sinbinned(now)).count(),
            awaiting_ack: self.awaiting_ack.len(),
        }
    }

    /// Replace the peer table and rebuild the ring from scratch.
    ///
    /// Messages already awaiting ack keep their bound endpoint and are
    /// resent there even if it dropped off the list.
    pub fn set_peers(&mut self, clients: &[Endpoint], workers: &[Endpoint]) {
        self.peers = PeerTable::from_lists(clients, workers);
        self.ring = PeerRing::build(
            self.peers.workers().map(|p| p.endpoint),
            self.config.ring_replicas,
        );
        let stats = self.stats();
        tracing::info!(
            peers = stats.peers,
            workers = stats.workers,
            ring_entries = self.ring.len(),
            awaiting_ack = stats.awaiting_ack,
            "peer table rebuilt"
        );
    }

    /// The worker a fresh send for `resource_id` would go to right now.
    pub fn route(&self, resource_id: &ObjectId) -> Option<Endpoint> {
        let now = Instant::now();
        let awaiting = self.awaiting_ack.len();
        let workers = self.peers.worker_count();
        self.ring.candidates(resource_id.as_bytes()).find(|ep| {
            let Some(peer) = self.peers.get(ep) else {
                return false;
            };
            if peer.is_sinbinned(now) {
                return false;
            }
            !overcommitted(
                peer.unacked_estimate,
                awaiting,
                workers,
                self.config.overcommit_floor,
                self.config.overcommit_ratio,
            )
        })
    }

    /// Send a message and, unless it is an ack, track it until acked.
    /// Returns the message id.
    pub async fn send(&mut self, mut message: Message, is_resend: bool) -> Result<u64> {
        if message.resource_id.is_none() && message.endpoint.is_none() {
            return Err(MessengerError::Unaddressed.into());
        }
        if !is_resend && !message.is_ack() {
            message.message_id = new_message_id();
        }
        message.seal();

        let now = Instant::now();
        if let Some(peer) = message.endpoint.and_then(|ep| self.peers.get_mut(&ep)) {
            if peer.expire_sinbin(now) {
                tracing::info!(peer = %peer.endpoint, "sinbin expired");
            }
            if is_resend {
                if peer.retries_since_last_received > self.config.max_retries
                    && !peer.is_sinbinned(now)
                {
                    peer.sinbin_until = Some(now + self.config.sinbin_window());
                    tracing::warn!(
                        peer = %peer.endpoint,
                        retries = peer.retries_since_last_received,
                        window_ms = self.config.sinbin_window().as_millis() as u64,
                        "peer sinbinned"
                    );
                } else {
                    peer.retries_since_last_received += 1;
                }
            }
        }

        // A bound message (explicit target, or a resend) never re-routes.
        let target = match (message.endpoint, message.resource_id) {
            (Some(endpoint), _) => endpoint,
            (None, Some(resource_id)) => {
                let endpoint = self
                    .route(&resource_id)
                    .ok_or(MessengerError::NoPeerAvailable(resource_id))?;
                message.endpoint = Some(endpoint);
                endpoint
            }
            (None, None) => return Err(MessengerError::Unaddressed.into()),
        };

        let bytes = message.encode().map_err(MessengerError::from)?;
        match self.socket.send_to(&bytes, target).await {
            Ok(_) => tracing::trace!(
                peer = %target,
                message_id = message.message_id,
                ack = message.is_ack(),
                len = bytes.len(),
                resend = is_resend,
                "message sent"
            ),
            // Indistinguishable from loss on the wire; the retry path covers it.
            Err(e) => tracing::warn!(peer = %target, error = %e, "send_to failed"),
        }

        let message_id = message.message_id;
        if !message.is_ack() {
            if !is_resend {
                if let Some(peer) = self.peers.get_mut(&target) {
                    peer.unacked_estimate += 1;
                }
            }
            self.awaiting_ack.insert(
                message_id,
                InFlight {
                    message,
                    sent_at: Instant::now(),
                },
            );
        }
        Ok(message_id)
    }

    /// Resend the oldest message whose ack is overdue. Returns true if one was resent.
    pub async fn retry_step(&mut self) -> Result<bool> {
        let now = Instant::now();
        let ack_timeout = self.config.ack_timeout();
        let overdue = self
            .awaiting_ack
            .iter()
            .find(|(_, f)| now.duration_since(f.sent_at) > ack_timeout)
            .map(|(id, _)| *id);
        let Some(message_id) = overdue else {
            return Ok(false);
        };
        let Some(in_flight) = self.awaiting_ack.remove(&message_id) else {
            return Ok(false);
        };
        tracing::debug!(
            message_id,
            peer = ?in_flight.message.endpoint,
            waited_ms = now.duration_since(in_flight.sent_at).as_millis() as u64,
            "ack overdue, resending"
        );
        self.send(in_flight.message, true).await?;
        Ok(true)
    }

    /// Time until the next overdue ack, capped at `cap`.
    fn next_retry_in(&self, now: Instant, cap: Duration) -> Duration {
        let ack_timeout = self.config.ack_timeout();
        self.awaiting_ack
            .values()
            .map(|f| (f.sent_at + ack_timeout).saturating_duration_since(now))
            .min()
            .map_or(cap, |d| d.min(cap))
    }

    /// Receive one validated message.
    ///
    /// Returns `Ok(None)` once `timeout` passes with nothing acceptable.
    /// Overdue messages are resent while waiting.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            while self.retry_step().await? {
                if self.socket.wait_readable(Duration::ZERO).await? || Instant::now() >= deadline {
                    break;
                }
            }

            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            // Wake up a little after the next ack falls due so it is strictly overdue.
            let wait = self
                .next_retry_in(now, remaining)
                .saturating_add(Duration::from_millis(1))
                .min(remaining);
            if !self.socket.wait_readable(wait).await? {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                continue;
            }

            let Some((len, from)) = self.socket.try_recv_from(&mut self.recv_buf)? else {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                continue;
            };
            let decoded = Message::decode(&self.recv_buf[..len]);
            if let Some(message) = self.accept(decoded, from)? {
                return Ok(Some(message));
            }
        }
    }

    fn accept(
        &mut self,
        decoded: Result<Message, WireError>,
        from: SocketAddr,
    ) -> Result<Option<Message>> {
        let mut message = match decoded {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%from, error = %e, "discarding datagram");
                return Ok(None);
            }
        };
        let sender = match Endpoint::try_from(from) {
            Ok(ep) if self.peers.get(&ep).is_some() => ep,
            _ => {
                tracing::warn!(%from, "discarding datagram from unknown peer");
                return Ok(None);
            }
        };
        if !message.check_checksum() {
            tracing::warn!(peer = %sender, message_id = message.message_id, "checksum mismatch, discarding");
            return Ok(None);
        }
        message.endpoint = Some(sender);

        if message.is_ack() {
            if let Some(peer) = self.peers.get_mut(&sender) {
                peer.unacked_estimate = peer.unacked_estimate.saturating_sub(1);
            }
            match self.awaiting_ack.remove(&message.message_id) {
                Some(original) => message.resource_id = original.message.resource_id,
                None => {
                    tracing::debug!(
                        peer = %sender,
                        message_id = message.message_id,
                        "duplicate or stale ack, discarding"
                    );
                    return Ok(None);
                }
            }
        } else if self.awaiting_ack.contains_key(&message.message_id) {
            tracing::error!(peer = %sender, message_id = message.message_id, "incoming id already in flight");
            return Err(MessengerError::InFlightCollision(message.message_id).into());
        }

        if let Some(peer) = self.peers.get_mut(&sender) {
            peer.mark_received();
        }
        tracing::trace!(
            peer = %sender,
            message_id = message.message_id,
            ack = message.is_ack(),
            len = message.payload.len(),
            "message received"
        );
        Ok(Some(message))
    }
}
