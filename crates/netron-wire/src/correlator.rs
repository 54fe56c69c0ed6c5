//! Request correlation: matches responses to pending calls.
//!
//! Responses on one connection may arrive in any order, so every request is
//! keyed by a per-peer, monotonically increasing id. The correlator is not
//! synchronized itself; its owner serializes access (see
//! [`RemotePeer`](crate::peer::RemotePeer)).

use crate::message::WireResponse;
use netron_types::{NetronError, NetronResult};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Receiving end of a pending request.
pub type ResponseReceiver = oneshot::Receiver<NetronResult<WireResponse>>;

/// A pending request waiting for its response.
#[derive(Debug)]
pub struct Awaiter {
    request_id: u64,
    tx: oneshot::Sender<NetronResult<WireResponse>>,
}

impl Awaiter {
    /// Id of the request this awaiter belongs to.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    fn resolve(self, response: WireResponse) {
        // The caller may have given up (timeout, dropped future).
        let _ = self.tx.send(Ok(response));
    }

    fn reject(self, err: NetronError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Table of outstanding requests for one peer.
#[derive(Debug)]
pub struct RequestCorrelator {
    next_id: u64,
    pending: HashMap<u64, Awaiter>,
}

impl RequestCorrelator {
    /// Create an empty correlator. Ids start at 1; 0 is never issued.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate a request id and register its awaiter.
    pub fn register(&mut self) -> (u64, ResponseReceiver) {
        let request_id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, Awaiter { request_id, tx });
        (request_id, rx)
    }

    /// Deliver a response. Returns false when no request with this id is
    /// pending (late response after a timeout or a reconnect).
    pub fn resolve(&mut self, request_id: u64, response: WireResponse) -> bool {
        match self.pending.remove(&request_id) {
            Some(awaiter) => {
                awaiter.resolve(response);
                true
            }
            None => false,
        }
    }

    /// Fail a single request.
    pub fn reject(&mut self, request_id: u64, err: NetronError) -> bool {
        match self.pending.remove(&request_id) {
            Some(awaiter) => {
                awaiter.reject(err);
                true
            }
            None => false,
        }
    }

    /// Forget a request without notifying its caller.
    pub fn cancel(&mut self, request_id: u64) -> bool {
        self.pending.remove(&request_id).is_some()
    }

    /// Fail every pending request, returning how many were rejected.
    pub fn reject_all(&mut self, mut make_err: impl FnMut() -> NetronError) -> usize {
        let count = self.pending.len();
        for (_, awaiter) in self.pending.drain() {
            awaiter.reject(make_err());
        }
        count
    }

    /// Ids of the pending requests, ascending.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
