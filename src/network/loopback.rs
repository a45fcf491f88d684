//! In-memory transport
//!
//! [`loopback`] returns a [`LoopbackDialer`] for the client side and a
//! [`LoopbackServer`] that yields one [`LoopbackPeer`] per accepted dial. The
//! peer sees every frame the client sends and can push frames back, which is
//! all a volume server does from the bridge's point of view.

use async_trait::async_trait;
use futures_util::{sink, stream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Dialer, Frame, FrameSink, FrameStream};
use crate::error::NetworkError;

/// Create a connected dialer/server pair
pub fn loopback() -> (LoopbackDialer, LoopbackServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let dialer = LoopbackDialer {
        accept_tx,
        online: Arc::new(AtomicBool::new(true)),
        refuse: Arc::new(AtomicUsize::new(0)),
        dials: Arc::new(AtomicUsize::new(0)),
    };
    (dialer, LoopbackServer { accept_rx })
}

#[derive(Clone)]
pub struct LoopbackDialer {
    accept_tx: mpsc::UnboundedSender<LoopbackPeer>,
    online: Arc<AtomicBool>,
    refuse: Arc<AtomicUsize>,
    dials: Arc<AtomicUsize>,
}

impl LoopbackDialer {
    /// Refuse every dial while offline
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Refuse the next `count` dials, then accept again
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Dial attempts made so far, refused ones included
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, url: &str) -> Result<(FrameSink, FrameStream), NetworkError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        if !self.online.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionFailed(format!("{} is offline", url)));
        }
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(NetworkError::ConnectionFailed(format!("{} refused", url)));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel::<Frame>();
        let (server_tx, server_rx) = mpsc::unbounded_channel::<Result<Frame, NetworkError>>();

        let peer = LoopbackPeer {
            url: url.to_string(),
            outbound: server_tx,
            inbound: client_rx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| NetworkError::ConnectionFailed("loopback server dropped".into()))?;

        let sink = sink::unfold(client_tx, |tx, frame: Frame| async move {
            tx.send(frame).map_err(|_| NetworkError::Closed)?;
            Ok::<_, NetworkError>(tx)
        });
        let stream = stream::unfold(server_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Accepting side of a loopback pair
pub struct LoopbackServer {
    accept_rx: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl LoopbackServer {
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.accept_rx.recv().await
    }

    pub fn try_accept(&mut self) -> Option<LoopbackPeer> {
        self.accept_rx.try_recv().ok()
    }
}

/// Server end of one loopback connection
pub struct LoopbackPeer {
    url: String,
    outbound: mpsc::UnboundedSender<Result<Frame, NetworkError>>,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackPeer {
    /// URL the client dialed
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a frame to the client; false once the client is gone
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(Ok(frame)).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Make the client's read side fail
    pub fn fail(&self, error: NetworkError) -> bool {
        self.outbound.send(Err(error)).is_ok()
    }

    /// Next frame from the client; `None` once the client dropped its sink
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.inbound.try_recv().ok()
    }
}
