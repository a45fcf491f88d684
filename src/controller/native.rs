//! Controller backed by an in-process invocation channel
//!
//! The host application registers a [`NativeInvoker`] that executes named
//! operations (`device_get_volume`, `application_mute`, ...) with a parameter
//! object `{id, volume?}`. The channel is reliable, so there is no
//! correlation, retry or connection state here.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use super::{BackendKind, VolumeController};
use crate::error::{Result, ValidationError};
use crate::protocol::{
    AppIdentifier, AudioApplication, AudioDevice, DeviceIdentifier, Operation, Request,
    ServerAddress, VolumePercent,
};

/// Executes named operations in-process
#[async_trait]
pub trait NativeInvoker: Send + Sync {
    async fn invoke(&self, operation: Operation, args: Value) -> Result<Value>;
}

pub struct NativeController {
    invoker: Arc<dyn NativeInvoker>,
}

impl NativeController {
    pub fn new(invoker: Arc<dyn NativeInvoker>) -> Self {
        Self { invoker }
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Option<T> {
        let operation = request.operation;
        let value = match self.invoker.invoke(operation, request.params_value()).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("{} failed: {}", operation, e);
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Unexpected payload for {}: {}", operation, e);
                None
            }
        }
    }

    async fn command(&self, request: Request) -> bool {
        let operation = request.operation;
        match self.invoker.invoke(operation, request.params_value()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("{} failed: {}", operation, e);
                false
            }
        }
    }
}

#[async_trait]
impl VolumeController for NativeController {
    fn backend(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn get_all_devices(&self) -> Vec<DeviceIdentifier> {
        self.call(Request::new(Operation::GetAllDevices))
            .await
            .unwrap_or_default()
    }

    async fn get_device_volume(&self, id: &str) -> VolumePercent {
        self.call(Request::new(Operation::DeviceGetVolume).with_id(id))
            .await
            .unwrap_or(VolumePercent::ZERO)
    }

    async fn set_device_volume(&self, id: &str, volume: f32) -> std::result::Result<bool, ValidationError> {
        let volume = VolumePercent::new(volume)?;
        Ok(self
            .command(
                Request::new(Operation::DeviceSetVolume)
                    .with_id(id)
                    .with_volume(volume),
            )
            .await)
    }

    async fn mute_device(&self, id: &str) -> bool {
        self.command(Request::new(Operation::DeviceMute).with_id(id)).await
    }

    async fn unmute_device(&self, id: &str) -> bool {
        self.command(Request::new(Operation::DeviceUnmute).with_id(id)).await
    }

    async fn get_playback_devices(&self) -> Vec<AudioDevice> {
        self.call(Request::new(Operation::GetPlaybackDevices))
            .await
            .unwrap_or_default()
    }

    async fn get_application(&self, id: AppIdentifier) -> Option<AudioApplication> {
        self.call::<Option<AudioApplication>>(Request::new(Operation::GetApplication).with_id(id))
            .await
            .flatten()
    }

    async fn get_application_icon(&self, id: AppIdentifier) -> Option<Vec<u8>> {
        self.call::<Option<Vec<u8>>>(Request::new(Operation::ApplicationGetIcon).with_id(id))
            .await
            .flatten()
    }

    async fn get_application_volume(&self, id: AppIdentifier) -> VolumePercent {
        self.call(Request::new(Operation::ApplicationGetVolume).with_id(id))
            .await
            .unwrap_or(VolumePercent::ZERO)
    }

    async fn set_application_volume(
        &self,
        id: AppIdentifier,
        volume: f32,
    ) -> std::result::Result<bool, ValidationError> {
        let volume = VolumePercent::new(volume)?;
        Ok(self
            .command(
                Request::new(Operation::ApplicationSetVolume)
                    .with_id(id)
                    .with_volume(volume),
            )
            .await)
    }

    async fn mute_application(&self, id: AppIdentifier) -> bool {
        self.command(Request::new(Operation::ApplicationMute).with_id(id)).await
    }

    async fn unmute_application(&self, id: AppIdentifier) -> bool {
        self.command(Request::new(Operation::ApplicationUnmute).with_id(id)).await
    }

    async fn get_device_applications(&self, device_id: &str) -> Vec<AppIdentifier> {
        self.call(Request::new(Operation::GetDeviceApplications).with_id(device_id))
            .await
            .unwrap_or_default()
    }

    async fn setup(&self, address: &ServerAddress) -> Result<()> {
        tracing::debug!("Native backend ignores server address {}", address);
        Ok(())
    }

    async fn close(&self) {}

    async fn heartbeat(&self) -> bool {
        true
    }

    /// The host answers `discover_server_address` with `"host:port"`
    async fn discover_server(&self) -> Option<ServerAddress> {
        let found: String = self
            .call(Request::new(Operation::DiscoverServerAddress))
            .await?;
        match ServerAddress::parse(&found) {
            Ok(address) => Some(address),
            Err(e) => {
                tracing::warn!("Discovered address {:?} rejected: {}", found, e);
                None
            }
        }
    }
}
