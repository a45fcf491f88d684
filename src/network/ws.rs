//! WebSocket dialer

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{Dialer, Frame, FrameSink, FrameStream};
use crate::constants::CONNECT_TIMEOUT_MS;
use crate::error::NetworkError;

/// Dials `ws://host:port` with tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsDialer {
    connect_timeout: Duration,
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::new(Duration::from_millis(CONNECT_TIMEOUT_MS))
    }
}

impl WsDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<(FrameSink, FrameStream), NetworkError> {
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        tracing::debug!("WebSocket handshake with {} complete", url);
        let (write, read) = stream.split();

        let sink = write
            .sink_map_err(|e| NetworkError::SendFailed(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, NetworkError>(to_message(frame))));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(NetworkError::ReceiveFailed(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data.to_vec()),
        Frame::Ping(data) => Message::Ping(data.to_vec()),
        Frame::Pong(data) => Message::Pong(data.to_vec()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(data) => Some(Frame::Binary(Bytes::from(data))),
        Message::Ping(data) => Some(Frame::Ping(Bytes::from(data))),
        Message::Pong(data) => Some(Frame::Pong(Bytes::from(data))),
        Message::Close(_) => Some(Frame::Close),
        // raw frames are never surfaced when reading
        Message::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_mapping() {
        assert_eq!(
            from_message(to_message(Frame::text("hello"))),
            Some(Frame::text("hello"))
        );
        assert_eq!(
            from_message(Message::Ping(vec![1, 2])),
            Some(Frame::Ping(Bytes::from_static(&[1, 2])))
        );
        assert!(matches!(to_message(Frame::Close), Message::Close(None)));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // nothing listens on a freshly released port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = WsDialer::new(Duration::from_secs(2));
        let result = dialer.dial(&format!("ws://127.0.0.1:{}", port)).await;
        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
    }
}
