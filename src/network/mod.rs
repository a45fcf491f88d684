//! Network subsystem for the socket backend
//!
//! A [`Dialer`] opens one message-oriented connection and hands back its two
//! halves as boxed [`Frame`] sink/stream. [`ws::WsDialer`] speaks WebSocket;
//! [`loopback::LoopbackDialer`] keeps everything in memory.

pub mod correlator;
pub mod discovery;
pub mod loopback;
pub mod socket;
pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::pin::Pin;

use crate::error::NetworkError;

pub use correlator::RequestCorrelator;
pub use discovery::discover_server;
pub use loopback::{LoopbackDialer, LoopbackPeer};
pub use socket::{ConnectSocket, ListenerToken};
pub use ws::WsDialer;

/// One message on the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            _ => None,
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = NetworkError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, NetworkError>> + Send>>;

/// Opens connections to a volume server
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<(FrameSink, FrameStream), NetworkError>;
}
