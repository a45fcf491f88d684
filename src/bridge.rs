//! Application context
//!
//! A [`Bridge`] is created once at startup and owns everything the client
//! needs: the selected (and debounced) controller, the update hub and the
//! connection session. It is passed to whoever needs it; there is no global
//! instance.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::controller::{select_backend, DebouncedController, NativeInvoker, VolumeController};
use crate::error::Result;
use crate::network::{Dialer, WsDialer};
use crate::protocol::ServerAddress;
use crate::session::{ConnectOutcome, ConnectionState, Session};
use crate::updates::{Subscription, UpdateHub};

pub struct Bridge {
    config: AppConfig,
    hub: UpdateHub,
    controller: Arc<dyn VolumeController>,
    session: Arc<Session>,
    connecting: Mutex<CancellationToken>,
}

impl Bridge {
    /// Build the context, choosing the native backend when `native` is given
    pub fn new(
        config: AppConfig,
        native: Option<Arc<dyn NativeInvoker>>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let hub = UpdateHub::default();
        let backend = select_backend(native, dialer, hub.clone(), &config);
        let controller: Arc<dyn VolumeController> =
            Arc::new(DebouncedController::new(backend, &config.debounce));
        let session = Session::new(controller.clone(), config.session.clone());

        Self {
            config,
            hub,
            controller,
            session,
            connecting: Mutex::new(CancellationToken::new()),
        }
    }

    /// Socket backend over WebSocket
    pub fn websocket(config: AppConfig) -> Self {
        let dialer = Arc::new(WsDialer::new(config.bridge.connect_timeout()));
        Self::new(config, None, dialer)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<dyn VolumeController> {
        &self.controller
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn hub(&self) -> &UpdateHub {
        &self.hub
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Find a server without user input
    pub async fn discover(&self) -> Option<ServerAddress> {
        self.controller.discover_server().await
    }

    /// Connect (with retries) to `address`
    pub async fn start(&self, address: &ServerAddress) -> Result<ConnectOutcome> {
        let cancel = self.connecting.lock().child_token();
        self.session.connect(address, &cancel).await
    }

    /// Abort every `start` that is still retrying. Later calls to `start`
    /// are unaffected.
    pub fn cancel_start(&self) {
        let previous = std::mem::replace(&mut *self.connecting.lock(), CancellationToken::new());
        previous.cancel();
    }

    pub async fn shutdown(&self) {
        self.cancel_start();
        self.session.logout().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::loopback::loopback;
    use crate::network::Frame;
    use crate::protocol::{encode_response, Operation, Request};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_query_shutdown() {
        let (dialer, mut server) = loopback();
        let bridge = Bridge::new(AppConfig::default(), None, Arc::new(dialer));
        let address = ServerAddress::new("127.0.0.1", 9002).unwrap();

        let outcome = bridge.start(&address).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Connected { attempts: 1 });
        assert_eq!(bridge.state(), ConnectionState::Connected);

        let mut peer = server.accept().await.unwrap();
        let responder = tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                let Frame::Text(text) = frame else { continue };
                let request = Request::decode(&text).unwrap();
                if request.operation == Operation::GetAllDevices {
                    let id = request.request_id.unwrap().to_string();
                    peer.send_text(encode_response(&id, &json!(["spk1"])).unwrap());
                }
            }
        });

        assert_eq!(bridge.controller().get_all_devices().await, vec!["spk1"]);

        bridge.shutdown().await;
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        responder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_start() {
        let (dialer, _server) = loopback();
        dialer.set_online(false);
        let bridge = Arc::new(Bridge::new(AppConfig::default(), None, Arc::new(dialer)));
        let address = ServerAddress::new("127.0.0.1", 9002).unwrap();

        let starting = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.start(&address).await })
        };
        tokio::time::sleep(Duration::from_millis(1200)).await;
        bridge.cancel_start();

        let outcome = starting.await.unwrap().unwrap();
        assert_eq!(outcome, ConnectOutcome::Cancelled);
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_start_reaches_every_pending_start() {
        let (dialer, _server) = loopback();
        dialer.set_online(false);
        let bridge = Arc::new(Bridge::new(AppConfig::default(), None, Arc::new(dialer.clone())));
        let address = ServerAddress::new("127.0.0.1", 9002).unwrap();

        let spawn_start = |bridge: Arc<Bridge>, address: ServerAddress| {
            tokio::spawn(async move { bridge.start(&address).await })
        };
        let first = spawn_start(bridge.clone(), address.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = spawn_start(bridge.clone(), address.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        bridge.cancel_start();

        assert_eq!(first.await.unwrap().unwrap(), ConnectOutcome::Cancelled);
        assert_eq!(second.await.unwrap().unwrap(), ConnectOutcome::Cancelled);

        // a fresh start is not born cancelled
        dialer.set_online(true);
        let outcome = bridge.start(&address).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Connected { attempts: 1 });
        bridge.shutdown().await;
    }
}
