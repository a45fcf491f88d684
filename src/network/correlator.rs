//! Request/response correlation over the transport socket
//!
//! Every correlated call gets a fresh UUID that travels as `request_id` and is
//! registered before the frame is sent. The server echoes it back in the
//! response's `type` (or `channel`) field. Servers that answer on a channel
//! named after the operation instead resolve the oldest pending call for that
//! operation.
//!
//! Timeouts, send failures and undecodable payloads all resolve the call to
//! `None` with a warning; they never surface as errors.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::socket::{ConnectSocket, ListenerToken};
use super::Frame;
use crate::constants::DEFAULT_REQUEST_TIMEOUT_MS;
use crate::protocol::{detect_control, parse_inbound, Inbound, Operation, Request};
use crate::updates::UpdateHub;

/// A call waiting for its response
struct PendingRequest {
    operation: Operation,
    seq: u64,
    created_at: Instant,
    timeout: Duration,
    resolver: oneshot::Sender<Value>,
}

/// Removes a call's entry when the call ends, including when its future is
/// dropped before an answer arrives
struct PendingGuard<'a> {
    pending: &'a DashMap<Uuid, PendingRequest>,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

pub struct RequestCorrelator {
    socket: Arc<ConnectSocket>,
    hub: UpdateHub,
    timeout: Duration,
    pending: DashMap<Uuid, PendingRequest>,
    seq: AtomicU64,
}

impl RequestCorrelator {
    pub fn new(socket: Arc<ConnectSocket>, hub: UpdateHub) -> Self {
        Self::with_timeout(socket, hub, Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
    }

    pub fn with_timeout(socket: Arc<ConnectSocket>, hub: UpdateHub, timeout: Duration) -> Self {
        Self {
            socket,
            hub,
            timeout,
            pending: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Route inbound frames of the socket's current connection through this
    /// correlator. Must be repeated after every (re)connect.
    pub fn attach(self: &Arc<Self>) -> ListenerToken {
        let correlator = Arc::downgrade(self);
        self.socket.add_listener(move |frame| {
            if let Some(correlator) = correlator.upgrade() {
                correlator.route(frame);
            }
        })
    }

    /// Send `request` and wait for its response with the default timeout
    pub async fn call<T: DeserializeOwned>(&self, request: Request) -> Option<T> {
        self.call_with_timeout(request, self.timeout).await
    }

    pub async fn call_with_timeout<T: DeserializeOwned>(
        &self,
        mut request: Request,
        timeout: Duration,
    ) -> Option<T> {
        let operation = request.operation;
        let request_id = Uuid::new_v4();
        request.request_id = Some(request_id);

        let (resolver, response) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingRequest {
                operation,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                created_at: Instant::now(),
                timeout,
                resolver,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id,
        };

        if let Err(e) = self.socket.try_send(Frame::Text(request.encode())) {
            tracing::warn!("{} not sent: {}", operation, e);
            return None;
        }
        tracing::debug!("Sent {} ({})", operation, request_id);

        let data = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(data)) => data,
            Ok(Err(_)) => {
                tracing::debug!("{} ({}) abandoned", operation, request_id);
                return None;
            }
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", operation, timeout);
                return None;
            }
        };

        match serde_json::from_value(data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Unexpected payload for {}: {}", operation, e);
                None
            }
        }
    }

    /// Send a command the server does not answer. The frame still carries a
    /// request id so server logs can be matched up.
    pub fn notify(&self, request: Request) -> bool {
        let operation = request.operation;
        let frame = Frame::Text(request.with_request_id(Uuid::new_v4()).encode());
        match self.socket.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{} not sent: {}", operation, e);
                false
            }
        }
    }

    /// Handle one inbound frame
    pub fn route(&self, frame: &Frame) {
        let text = match frame {
            Frame::Text(text) => text.as_str(),
            Frame::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len());
                    return;
                }
            },
            _ => return,
        };

        if detect_control(text).is_some() {
            return;
        }

        match parse_inbound(text) {
            Ok(Inbound::Response { channel, data }) => self.resolve(&channel, data),
            Ok(Inbound::Update(change)) => {
                self.hub.publish(change);
            }
            Ok(Inbound::Event { name }) => tracing::debug!("Ignoring event {}", name),
            Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
        }
    }

    fn resolve(&self, channel: &str, data: Value) {
        let key = match Uuid::parse_str(channel) {
            Ok(request_id) => Some(request_id),
            Err(_) => channel
                .parse::<Operation>()
                .ok()
                .and_then(|operation| self.oldest_pending(operation)),
        };

        let pending = key.and_then(|key| self.pending.remove(&key));
        match pending {
            Some((request_id, pending)) => {
                tracing::debug!(
                    "{} ({}) answered after {:?} of {:?}",
                    pending.operation,
                    request_id,
                    pending.created_at.elapsed(),
                    pending.timeout
                );
                let _ = pending.resolver.send(data);
            }
            None => tracing::debug!("No pending request for {}, dropping response", channel),
        }
    }

    fn oldest_pending(&self, operation: Operation) -> Option<Uuid> {
        self.pending
            .iter()
            .filter(|entry| entry.operation == operation && !entry.resolver.is_closed())
            .min_by_key(|entry| entry.seq)
            .map(|entry| *entry.key())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Abandon every pending call; their callers resolve to `None` at once
    pub fn clear(&self) {
        self.pending.clear();
    }
}
