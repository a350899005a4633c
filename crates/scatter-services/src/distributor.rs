//! Work distributor — request/response over the messenger.
//!
//! A client names an input object and a command; the request is routed by
//! the input's id, so the same input keeps landing on the same worker.
//! The worker runs a handler and answers in the ack: either the id of the
//! output object it wrote to the store, or an error string.
//!
//! Handlers should name their output with `WorkItem::output_id`, which is
//! derived from the request. A resent request then rewrites the same
//! object instead of producing a second one.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::FutureExt;

use scatter_core::config::ScatterConfig;
use scatter_core::wire::MAX_PAYLOAD;
use scatter_core::{Endpoint, Message, ObjectId, WorkOutcome, WorkRequest};

use crate::messenger::Messenger;
use crate::peer_lists::PeerListWatcher;
use crate::store::ObjectStore;

/// How long a worker waits per receive before re-checking peer lists.
const WORKER_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request {request_id:#018x} failed on {from}: {reason}")]
    Remote {
        request_id: u64,
        from: Endpoint,
        reason: String,
    },

    #[error("no response in {waited:?} with {pending} request(s) outstanding")]
    NoProgress { waited: Duration, pending: usize },
}

/// A validated response, matched to its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResponse {
    pub request_id: u64,
    /// Routing key of the original request.
    pub resource_id: Option<ObjectId>,
    pub from: Endpoint,
    pub outcome: WorkOutcome,
}

impl WorkResponse {
    /// The output id, or the worker's error as a `DispatchError`.
    pub fn into_result(self) -> Result<ObjectId, DispatchError> {
        match self.outcome {
            WorkOutcome::Done(id) => Ok(id),
            WorkOutcome::Failed(reason) => Err(DispatchError::Remote {
                request_id: self.request_id,
                from: self.from,
                reason,
            }),
        }
    }
}

/// One request as a handler sees it.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub request_id: u64,
    pub resource_id: ObjectId,
    pub command: Bytes,
    pub from: Endpoint,
}

impl WorkItem {
    /// Deterministic output name for this input and command.
    pub fn output_id(&self) -> ObjectId {
        ObjectId::derive(&self.resource_id, &self.command)
    }
}

/// What a failing handler reports about where it was.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub endpoint: Endpoint,
    /// The command being executed.
    pub op: String,
}

impl WorkerContext {
    fn describe_failure(&self, reason: &str) -> String {
        format!("{} at {}: {}", self.op, self.endpoint, reason)
    }
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Error text that fits in one ack.
fn fit_error(mut text: String) -> String {
    let limit = MAX_PAYLOAD - 2;
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

pub struct WorkDistributor {
    messenger: Messenger,
    store: ObjectStore,
    watcher: PeerListWatcher,
}

impl WorkDistributor {
    pub fn new(messenger: Messenger, store: ObjectStore, watcher: PeerListWatcher) -> Self {
        Self {
            messenger,
            store,
            watcher,
        }
    }

    /// Bind, open the store, and load the peer lists.
    pub async fn from_config(config: &ScatterConfig) -> Result<Self> {
        let bind: Endpoint = config
            .network
            .bind
            .parse()
            .with_context(|| format!("invalid network.bind {:?}", config.network.bind))?;
        let messenger = Messenger::bind(bind, config.messenger.clone())?;
        let store = ObjectStore::from_config(&config.store)?;
        let watcher = PeerListWatcher::new(config.dispatch.peer_refresh(), config.store.open_timeout());
        let mut distributor = Self::new(messenger, store, watcher);
        distributor.refresh_peers().await?;
        Ok(distributor)
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn messenger_mut(&mut self) -> &mut Messenger {
        &mut self.messenger
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.messenger.local_endpoint()
    }

    /// Reload peer lists now if they changed.
    pub async fn refresh_peers(&mut self) -> Result<bool> {
        self.watcher.refresh(&self.store, &mut self.messenger).await
    }

    async fn refresh_peers_if_due(&mut self) -> Result<()> {
        self.watcher
            .refresh_if_due(&self.store, &mut self.messenger)
            .await?;
        Ok(())
    }

    // ── Client side ───────────────────────────────────────────────────────────

    /// Send one request. Returns the request id its response will carry.
    pub async fn send_request(&mut self, resource_id: ObjectId, command: impl Into<Bytes>) -> Result<u64> {
        self.refresh_peers_if_due().await?;
        let payload = WorkRequest::new(resource_id, command)
            .encode()
            .context("encode work request")?;
        let request_id = self
            .messenger
            .send(Message::to_resource(resource_id, payload), false)
            .await?;
        tracing::debug!(request_id, resource = resource_id.short(), "request sent");
        Ok(request_id)
    }

    /// Wait up to `timeout` for one well-formed response.
    ///
    /// Error responses are returned like any other; it is up to the caller
    /// whether to fail on them.
    pub async fn receive_response(&mut self, timeout: Duration) -> Result<Option<WorkResponse>> {
        self.refresh_peers_if_due().await?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(message) = self.messenger.receive(remaining).await? else {
                return Ok(None);
            };
            let from = message.endpoint.unwrap_or_default();
            if !message.is_ack() {
                tracing::warn!(peer = %from, message_id = message.message_id, "client got a request, ignoring");
                continue;
            }
            match WorkOutcome::decode(&message.payload) {
                Ok(outcome) => {
                    if let WorkOutcome::Failed(reason) = &outcome {
                        tracing::warn!(peer = %from, request_id = message.message_id, %reason, "error response");
                    }
                    return Ok(Some(WorkResponse {
                        request_id: message.message_id,
                        resource_id: message.resource_id,
                        from,
                        outcome,
                    }));
                }
                Err(e) => {
                    tracing::warn!(peer = %from, request_id = message.message_id, error = %e, "discarding malformed response");
                }
            }
        }
    }

    // ── Worker side ───────────────────────────────────────────────────────────

    /// Serve requests forever. Only fatal errors return.
    pub async fn process_requests<H, Fut>(&mut self, mut handler: H) -> Result<()>
    where
        H: FnMut(WorkItem) -> Fut,
        Fut: Future<Output = Result<ObjectId>>,
    {
        tracing::info!(endpoint = %self.local_endpoint(), "worker loop started");
        loop {
            self.process_one(&mut handler, WORKER_POLL).await?;
        }
    }

    /// Handle at most one request, waiting up to `timeout` for it.
    /// Returns true if a request was answered.
    pub async fn process_one<H, Fut>(&mut self, handler: &mut H, timeout: Duration) -> Result<bool>
    where
        H: FnMut(WorkItem) -> Fut,
        Fut: Future<Output = Result<ObjectId>>,
    {
        self.refresh_peers_if_due().await?;
        let Some(request) = self.messenger.receive(timeout).await? else {
            return Ok(false);
        };
        let from = request.endpoint.unwrap_or_default();
        if request.is_ack() {
            tracing::debug!(peer = %from, message_id = request.message_id, "worker got an ack, ignoring");
            return Ok(false);
        }

        let work = match WorkRequest::decode(&request.payload) {
            Ok(work) => work,
            Err(e) => {
                tracing::warn!(peer = %from, message_id = request.message_id, error = %e, "malformed request");
                let outcome = WorkOutcome::Failed(format!("{e}"));
                self.messenger
                    .send(Message::ack_for(&request, outcome.encode()), false)
                    .await?;
                return Ok(true);
            }
        };

        let context = WorkerContext {
            endpoint: self.local_endpoint(),
            op: String::from_utf8_lossy(&work.command).into_owned(),
        };
        let item = WorkItem {
            request_id: request.message_id,
            resource_id: work.resource_id,
            command: work.command,
            from,
        };
        tracing::debug!(peer = %from, request_id = item.request_id, resource = item.resource_id.short(), op = %context.op, "handling request");

        // Any exit other than Ok, including a panic, becomes an error ack.
        let result = AssertUnwindSafe(async { handler(item).await })
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(output)) => WorkOutcome::Done(output),
            Ok(Err(e)) => WorkOutcome::Failed(fit_error(context.describe_failure(&format!("{e:#}")))),
            Err(panic) => WorkOutcome::Failed(fit_error(context.describe_failure(&panic_reason(&*panic)))),
        };
        if let WorkOutcome::Failed(reason) = &outcome {
            tracing::warn!(peer = %from, request_id = request.message_id, %reason, "handler failed");
        }

        self.messenger
            .send(Message::ack_for(&request, outcome.encode()), false)
            .await?;
        Ok(true)
    }
}
