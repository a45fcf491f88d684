//! Transport socket
//!
//! [`ConnectSocket`] owns at most one live connection. Reconnecting always
//! tears the previous connection down first, listeners included, so two
//! connections never deliver the same push twice.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{Dialer, Frame};
use crate::constants::HEARTBEAT_WAIT_MS;
use crate::error::NetworkError;
use crate::protocol::{detect_control, ControlKind};

/// How long `close` waits for the Close frame to be flushed
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Raw frame observer
pub type Listener = Arc<dyn Fn(&Frame) + Send + Sync>;

type ListenerMap = Mutex<BTreeMap<u64, Listener>>;

/// Removes exactly the listener it was returned for
#[derive(Debug)]
pub struct ListenerToken {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl ListenerToken {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().remove(&self.id);
        }
    }
}

struct Connection {
    url: String,
    alive: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct ConnectSocket {
    dialer: Arc<dyn Dialer>,
    heartbeat_wait: Duration,
    connection: Mutex<Option<Connection>>,
    listeners: Arc<ListenerMap>,
    next_listener: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ConnectSocket {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self::with_heartbeat_wait(dialer, Duration::from_millis(HEARTBEAT_WAIT_MS))
    }

    pub fn with_heartbeat_wait(dialer: Arc<dyn Dialer>, heartbeat_wait: Duration) -> Self {
        Self {
            dialer,
            heartbeat_wait,
            connection: Mutex::new(None),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener: AtomicU64::new(1),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a connection to `url`, closing any previous one first
    pub async fn connect(&self, url: &str) -> Result<(), NetworkError> {
        self.connect_with(url, |_| {}).await
    }

    /// Like [`ConnectSocket::connect`], running `on_open` once the new
    /// connection is dialed but before its first frame is read. Listeners
    /// added there see everything the server sends.
    pub async fn connect_with<F>(&self, url: &str, on_open: F) -> Result<(), NetworkError>
    where
        F: FnOnce(&Self),
    {
        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown().await;

        let (mut sink, mut stream) = self.dialer.dial(url).await?;
        on_open(self);
        let alive = Arc::new(AtomicBool::new(true));
        let (outbound, mut queue) = mpsc::unbounded_channel::<Frame>();

        let writer_alive = alive.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                let closing = frame == Frame::Close;
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!("Write failed: {}", e);
                    writer_alive.store(false, Ordering::SeqCst);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_alive = alive.clone();
        let listeners = self.listeners.clone();
        let reader_url = url.to_string();
        let reader = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Frame::Close) => break,
                    Ok(frame) => dispatch(&listeners, &frame),
                    Err(e) => {
                        tracing::warn!("Read from {} failed: {}", reader_url, e);
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            tracing::info!("Connection to {} ended", reader_url);
        });

        tracing::info!("Connected to {}", url);
        *self.connection.lock() = Some(Connection {
            url: url.to_string(),
            alive,
            outbound,
            reader,
            writer,
        });
        Ok(())
    }

    /// Hand a frame to the open connection. Fails without queueing anything
    /// when there is none.
    pub fn try_send(&self, frame: Frame) -> Result<(), NetworkError> {
        let connection = self.connection.lock();
        match connection.as_ref() {
            Some(conn) if conn.alive.load(Ordering::SeqCst) => {
                conn.outbound.send(frame).map_err(|_| NetworkError::Closed)
            }
            _ => Err(NetworkError::NotConnected),
        }
    }

    pub fn send(&self, frame: Frame) -> bool {
        match self.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Dropping outgoing frame: {}", e);
                false
            }
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Register a raw frame observer. Listeners run on the reader task and
    /// are all discarded by `close` and `connect`.
    pub fn add_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(listener));
        ListenerToken {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .map(|conn| conn.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn url(&self) -> Option<String> {
        self.connection.lock().as_ref().map(|conn| conn.url.clone())
    }

    /// Best-effort graceful close. A peer that already hung up is not an error.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.listeners.lock().clear();
        let Some(conn) = self.connection.lock().take() else {
            return;
        };

        conn.alive.store(false, Ordering::SeqCst);
        // fails silently when the writer already stopped
        let _ = conn.outbound.send(Frame::Close);
        drop(conn.outbound);

        let mut writer = conn.writer;
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
        conn.reader.abort();
        tracing::info!("Closed connection to {}", conn.url);
    }

    /// Ping the server and wait for its pong.
    ///
    /// A WebSocket pong and a textual `{"type": "Pong"}` both count.
    pub async fn heartbeat(&self) -> bool {
        if !self.is_connected() {
            return false;
        }

        let (tx, rx) = oneshot::channel::<()>();
        let tx = Mutex::new(Some(tx));
        let token = self.add_listener(move |frame| {
            let is_pong = match frame {
                Frame::Pong(_) => true,
                Frame::Text(text) => detect_control(text) == Some(ControlKind::Pong),
                _ => false,
            };
            if is_pong {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });

        let alive = self.send(Frame::Ping(Bytes::new()))
            && matches!(tokio::time::timeout(self.heartbeat_wait, rx).await, Ok(Ok(())));
        token.unsubscribe();

        if !alive {
            tracing::warn!("Heartbeat got no pong within {:?}", self.heartbeat_wait);
        }
        alive
    }
}

impl Drop for ConnectSocket {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get_mut().take() {
            conn.reader.abort();
            conn.writer.abort();
        }
    }
}

fn dispatch(listeners: &ListenerMap, frame: &Frame) {
    // snapshot so a listener may unsubscribe itself
    let snapshot: Vec<Listener> = listeners.lock().values().cloned().collect();
    for listener in snapshot {
        listener(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::loopback::{loopback, LoopbackServer};
    use crate::network::LoopbackDialer;
    use std::sync::atomic::AtomicUsize;

    fn socket() -> (ConnectSocket, LoopbackDialer, LoopbackServer) {
        let (dialer, server) = loopback();
        let socket = ConnectSocket::new(Arc::new(dialer.clone()));
        (socket, dialer, server)
    }

    fn counter(socket: &ConnectSocket) -> (Arc<AtomicUsize>, ListenerToken) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let token = socket.add_listener(move |frame| {
            if matches!(frame, Frame::Text(_)) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        (count, token)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_disconnected() {
        let (socket, _dialer, _server) = socket();
        assert_eq!(socket.try_send(Frame::text("x")), Err(NetworkError::NotConnected));
        assert!(!socket.send_text("\"get_playback_devices\""));
        assert!(!socket.is_connected());
        assert!(!socket.heartbeat().await);
    }

    #[tokio::test]
    async fn test_send_and_listen() {
        let (socket, _dialer, mut server) = socket();
        socket.connect("ws://mixer:9002").await.unwrap();
        let mut peer = server.accept().await.unwrap();
        assert_eq!(socket.url().as_deref(), Some("ws://mixer:9002"));

        assert!(socket.send_text("hello"));
        assert_eq!(peer.recv().await, Some(Frame::text("hello")));

        let (count, _token) = counter(&socket);
        peer.send_text("{}");
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_listener() {
        let (socket, _dialer, mut server) = socket();
        socket.connect("ws://mixer:9002").await.unwrap();
        let peer = server.accept().await.unwrap();

        let (first, first_token) = counter(&socket);
        let (second, _second_token) = counter(&socket);
        first_token.unsubscribe();
        assert_eq!(socket.listener_count(), 1);

        peer.send_text("{}");
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_sends_close_and_drops_listeners() {
        let (socket, _dialer, mut server) = socket();
        socket.connect("ws://mixer:9002").await.unwrap();
        let mut peer = server.accept().await.unwrap();
        let (_count, _token) = counter(&socket);

        socket.close().await;
        assert_eq!(peer.recv().await, Some(Frame::Close));
        assert_eq!(socket.listener_count(), 0);
        assert!(!socket.is_connected());
        assert!(!socket.send_text("late"));

        // closing twice is harmless
        socket.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_replaces_connection() {
        let (socket, dialer, mut server) = socket();
        socket.connect("ws://mixer:9002").await.unwrap();
        let mut first = server.accept().await.unwrap();
        let (old_count, _token) = counter(&socket);

        socket.connect("ws://mixer:9003").await.unwrap();
        let second = server.accept().await.unwrap();
        assert_eq!(first.recv().await, Some(Frame::Close));
        assert_eq!(dialer.dial_count(), 2);

        let (new_count, _token) = counter(&socket);
        first.send_text("{}");
        second.send_text("{}");
        settle().await;
        assert_eq!(old_count.load(Ordering::SeqCst), 0);
        assert_eq!(new_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_disconnected() {
        let (socket, dialer, mut server) = socket();
        dialer.set_online(false);
        assert!(socket.connect("ws://mixer:9002").await.is_err());
        assert!(!socket.is_connected());
        assert!(server.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_on_open_listener_sees_first_frame() {
        let (socket, _dialer, mut server) = socket();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        let dialed = socket.connect_with("ws://mixer:9002", move |socket| {
            socket.add_listener(move |frame| {
                if matches!(frame, Frame::Text(_)) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            });
        });
        let (connected, peer) = tokio::join!(dialed, async {
            let peer = server.accept().await.unwrap();
            // pushed before connect_with has even returned
            peer.send_text("{}");
            peer
        });
        connected.unwrap();

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(peer);
    }

    #[tokio::test]
    async fn test_read_error_marks_disconnected() {
        let (socket, _dialer, mut server) = socket();
        socket.connect("ws://mixer:9002").await.unwrap();
        let peer = server.accept().await.unwrap();

        assert!(peer.fail(NetworkError::ReceiveFailed("reset".into())));
        settle().await;
        assert!(!socket.is_connected());
        assert_eq!(socket.try_send(Frame::text("x")), Err(NetworkError::NotConnected));
    }

    #[tokio::test]
    async fn test_peer_hangup_marks_disconnected() {
        let (socket, _dialer, mut server) = socket();
        socket.connect("ws://mixer:9002").await.unwrap();
        let peer = server.accept().await.unwrap();
        drop(peer);
        settle().await;
        assert!(!socket.is_connected());
        assert!(!socket.send_text("x"));
    }

    #[tokio::test]
    async fn test_heartbeat_pong_frame() {
        let (socket, _dialer, mut server) = socket();
        socket.connect("ws://mixer:9002").await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let responder = tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                if let Frame::Ping(data) = frame {
                    peer.send(Frame::Pong(data));
                }
            }
        });

        assert!(socket.heartbeat().await);
        // the one-shot pong listener is gone again
        assert_eq!(socket.listener_count(), 0);
        socket.close().await;
        responder.abort();
    }

    #[tokio::test]
    async fn test_heartbeat_text_pong() {
        let (socket, _dialer, mut server) = socket();
        socket.connect("ws://mixer:9002").await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let responder = tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                if matches!(frame, Frame::Ping(_)) {
                    peer.send_text(r#"{"type":"Pong"}"#);
                }
            }
        });

        assert!(socket.heartbeat().await);
        responder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_times_out() {
        let (dialer, mut server) = loopback();
        let socket = ConnectSocket::with_heartbeat_wait(Arc::new(dialer), Duration::from_secs(2));
        socket.connect("ws://mixer:9002").await.unwrap();
        let _peer = server.accept().await.unwrap();

        let started = tokio::time::Instant::now();
        assert!(!socket.heartbeat().await);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(socket.listener_count(), 0);
    }
}
