//! Controller backed by a remote volume server

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::{BackendKind, VolumeController};
use crate::config::{AppConfig, DiscoveryConfig};
use crate::error::{Result, ValidationError};
use crate::network::correlator::RequestCorrelator;
use crate::network::discovery;
use crate::network::socket::{ConnectSocket, ListenerToken};
use crate::network::Dialer;
use crate::protocol::{
    AppIdentifier, AudioApplication, AudioDevice, DeviceIdentifier, Operation, Request,
    ServerAddress, VolumePercent,
};
use crate::updates::UpdateHub;

/// Talks to the server through one [`ConnectSocket`]. Queries are correlated
/// by request id; set/mute/unmute are sent without waiting for an answer.
pub struct SocketController {
    socket: Arc<ConnectSocket>,
    correlator: Arc<RequestCorrelator>,
    discovery: DiscoveryConfig,
    router: Mutex<Option<ListenerToken>>,
}

impl SocketController {
    pub fn new(dialer: Arc<dyn Dialer>, hub: UpdateHub, config: &AppConfig) -> Self {
        let socket = Arc::new(ConnectSocket::with_heartbeat_wait(
            dialer,
            config.bridge.heartbeat_wait(),
        ));
        let correlator = Arc::new(RequestCorrelator::with_timeout(
            socket.clone(),
            hub,
            config.bridge.request_timeout(),
        ));
        Self {
            socket,
            correlator,
            discovery: config.discovery.clone(),
            router: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &Arc<ConnectSocket> {
        &self.socket
    }

    async fn query<T: DeserializeOwned>(&self, request: Request) -> Option<T> {
        self.correlator.call(request).await
    }

    fn command(&self, request: Request) -> bool {
        self.correlator.notify(request)
    }
}

#[async_trait]
impl VolumeController for SocketController {
    fn backend(&self) -> BackendKind {
        BackendKind::Socket
    }

    async fn get_all_devices(&self) -> Vec<DeviceIdentifier> {
        self.query(Request::new(Operation::GetAllDevices))
            .await
            .unwrap_or_default()
    }

    async fn get_device_volume(&self, id: &str) -> VolumePercent {
        self.query(Request::new(Operation::DeviceGetVolume).with_id(id))
            .await
            .unwrap_or(VolumePercent::ZERO)
    }

    async fn set_device_volume(&self, id: &str, volume: f32) -> std::result::Result<bool, ValidationError> {
        let volume = VolumePercent::new(volume)?;
        Ok(self.command(
            Request::new(Operation::DeviceSetVolume)
                .with_id(id)
                .with_volume(volume),
        ))
    }

    async fn mute_device(&self, id: &str) -> bool {
        self.command(Request::new(Operation::DeviceMute).with_id(id))
    }

    async fn unmute_device(&self, id: &str) -> bool {
        self.command(Request::new(Operation::DeviceUnmute).with_id(id))
    }

    async fn get_playback_devices(&self) -> Vec<AudioDevice> {
        self.query(Request::new(Operation::GetPlaybackDevices))
            .await
            .unwrap_or_default()
    }

    async fn get_application(&self, id: AppIdentifier) -> Option<AudioApplication> {
        self.query::<Option<AudioApplication>>(Request::new(Operation::GetApplication).with_id(id))
            .await
            .flatten()
    }

    async fn get_application_icon(&self, id: AppIdentifier) -> Option<Vec<u8>> {
        self.query::<Option<Vec<u8>>>(Request::new(Operation::ApplicationGetIcon).with_id(id))
            .await
            .flatten()
    }

    async fn get_application_volume(&self, id: AppIdentifier) -> VolumePercent {
        self.query(Request::new(Operation::ApplicationGetVolume).with_id(id))
            .await
            .unwrap_or(VolumePercent::ZERO)
    }

    async fn set_application_volume(
        &self,
        id: AppIdentifier,
        volume: f32,
    ) -> std::result::Result<bool, ValidationError> {
        let volume = VolumePercent::new(volume)?;
        Ok(self.command(
            Request::new(Operation::ApplicationSetVolume)
                .with_id(id)
                .with_volume(volume),
        ))
    }

    async fn mute_application(&self, id: AppIdentifier) -> bool {
        self.command(Request::new(Operation::ApplicationMute).with_id(id))
    }

    async fn unmute_application(&self, id: AppIdentifier) -> bool {
        self.command(Request::new(Operation::ApplicationUnmute).with_id(id))
    }

    async fn get_device_applications(&self, device_id: &str) -> Vec<AppIdentifier> {
        self.query(Request::new(Operation::GetDeviceApplications).with_id(device_id))
            .await
            .unwrap_or_default()
    }

    async fn setup(&self, address: &ServerAddress) -> Result<()> {
        // answers addressed to the old connection can never arrive
        self.correlator.clear();
        let correlator = self.correlator.clone();
        let mut router = None;
        // connecting drops every listener, so the router goes back on before
        // the first frame of the new connection is read
        self.socket
            .connect_with(&address.ws_url(), |_| router = Some(correlator.attach()))
            .await?;
        *self.router.lock() = router;
        Ok(())
    }

    async fn close(&self) {
        if let Some(router) = self.router.lock().take() {
            router.unsubscribe();
        }
        self.correlator.clear();
        self.socket.close().await;
    }

    async fn heartbeat(&self) -> bool {
        self.socket.heartbeat().await
    }

    async fn discover_server(&self) -> Option<ServerAddress> {
        match discovery::discover_server(&self.discovery).await {
            Ok(address) => Some(address),
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        }
    }
}
