//! Ordered work distributor — responses come back in request order.
//!
//! Requests go out as fast as the caller sends them. Responses that
//! arrive ahead of their turn are stashed until everything before them
//! has been handed out.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

use scatter_core::ObjectId;

use crate::distributor::{DispatchError, WorkDistributor, WorkResponse};

pub struct OrderedDistributor {
    inner: WorkDistributor,
    /// Outstanding request ids, oldest first.
    pending: VecDeque<u64>,
    /// Responses that arrived before their turn.
    stash: HashMap<u64, WorkResponse>,
    no_progress: Duration,
}

impl OrderedDistributor {
    /// `no_progress`: how long a receive may go without any response
    /// before giving up.
    pub fn new(inner: WorkDistributor, no_progress: Duration) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            stash: HashMap::new(),
            no_progress,
        }
    }

    pub fn inner(&self) -> &WorkDistributor {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut WorkDistributor {
        &mut self.inner
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn send_request(&mut self, resource_id: ObjectId, command: impl Into<Bytes>) -> Result<u64> {
        // Collect whatever is already waiting so acks don't pile up behind a long send burst.
        while let Some(response) = self.inner.receive_response(Duration::ZERO).await? {
            self.file(response);
        }
        let request_id = self.inner.send_request(resource_id, command).await?;
        self.pending.push_back(request_id);
        Ok(request_id)
    }

    /// The result of the oldest outstanding request, or None if nothing is
    /// outstanding.
    ///
    /// An error response is returned as `Err` after it has been retired, so
    /// the caller may carry on with the next one.
    pub async fn receive_response(&mut self) -> Result<Option<ObjectId>> {
        loop {
            let Some(&head) = self.pending.front() else {
                return Ok(None);
            };
            if let Some(response) = self.stash.remove(&head) {
                self.pending.pop_front();
                return Ok(Some(response.into_result()?));
            }

            let Some(response) = self.inner.receive_response(self.no_progress).await? else {
                tracing::error!(pending = self.pending.len(), "no progress");
                return Err(DispatchError::NoProgress {
                    waited: self.no_progress,
                    pending: self.pending.len(),
                }
                .into());
            };
            if response.request_id == head {
                self.pending.pop_front();
                return Ok(Some(response.into_result()?));
            }
            self.file(response);
        }
    }

    fn file(&mut self, response: WorkResponse) {
        if self.pending.contains(&response.request_id) {
            tracing::trace!(request_id = response.request_id, "response stashed until its turn");
            self.stash.insert(response.request_id, response);
        } else {
            tracing::debug!(request_id = response.request_id, "response for unknown request, dropping");
        }
    }
}
