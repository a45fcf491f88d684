//! Volume controller facade
//!
//! [`VolumeController`] is the one operation surface the rest of the client
//! talks to. [`native::NativeController`] forwards each operation to an
//! in-process invocation channel, [`socket::SocketController`] sends it to a
//! remote volume server. [`select::select_backend`] picks one at startup and
//! [`debounced::DebouncedController`] wraps it for UI use.
//!
//! Error policy shared by every implementation: only input validation (on
//! `set_*_volume`) and `setup` report errors. Transport trouble degrades to
//! an empty/default value and a logged warning.

pub mod debounced;
pub mod native;
pub mod select;
pub mod socket;

use async_trait::async_trait;
use std::fmt;

use crate::error::{Result, ValidationError};
use crate::protocol::{
    AppIdentifier, AudioApplication, AudioDevice, DeviceIdentifier, ServerAddress, VolumePercent,
};

pub use debounced::DebouncedController;
pub use native::{NativeController, NativeInvoker};
pub use select::select_backend;
pub use socket::SocketController;

/// Which transport a controller uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    Socket,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => f.write_str("native"),
            BackendKind::Socket => f.write_str("socket"),
        }
    }
}

#[async_trait]
pub trait VolumeController: Send + Sync {
    fn backend(&self) -> BackendKind;

    // ============= DEVICE =============

    /// Identifiers of every known device
    async fn get_all_devices(&self) -> Vec<DeviceIdentifier>;
    async fn get_device_volume(&self, id: &str) -> VolumePercent;
    /// `volume` is a `[0, 1]` fraction. Out-of-range input is rejected before
    /// anything is sent; `Ok(false)` means the command was not dispatched.
    async fn set_device_volume(&self, id: &str, volume: f32) -> std::result::Result<bool, ValidationError>;
    async fn mute_device(&self, id: &str) -> bool;
    async fn unmute_device(&self, id: &str) -> bool;
    async fn get_playback_devices(&self) -> Vec<AudioDevice>;

    // =========== APPLICATION ===========

    async fn get_application(&self, id: AppIdentifier) -> Option<AudioApplication>;
    /// Raw icon image bytes
    async fn get_application_icon(&self, id: AppIdentifier) -> Option<Vec<u8>>;
    async fn get_application_volume(&self, id: AppIdentifier) -> VolumePercent;
    async fn set_application_volume(
        &self,
        id: AppIdentifier,
        volume: f32,
    ) -> std::result::Result<bool, ValidationError>;
    async fn mute_application(&self, id: AppIdentifier) -> bool;
    async fn unmute_application(&self, id: AppIdentifier) -> bool;
    async fn get_device_applications(&self, device_id: &str) -> Vec<AppIdentifier>;

    // ============ CONNECTION ============

    /// Point the controller at a server. Replaces any previous connection.
    async fn setup(&self, address: &ServerAddress) -> Result<()>;
    async fn close(&self);
    async fn heartbeat(&self) -> bool;
    async fn discover_server(&self) -> Option<ServerAddress>;
}

/// Operations derived from [`VolumeController`], shared by every backend
#[async_trait]
pub trait VolumeControllerExt: VolumeController {
    /// Unmute when `currently_muted`, mute otherwise
    async fn toggle_mute_device(&self, id: &str, currently_muted: bool) -> bool {
        if currently_muted {
            self.unmute_device(id).await
        } else {
            self.mute_device(id).await
        }
    }

    async fn toggle_mute_application(&self, id: AppIdentifier, currently_muted: bool) -> bool {
        if currently_muted {
            self.unmute_application(id).await
        } else {
            self.mute_application(id).await
        }
    }

    /// Devices with their application ids, in playback-device order
    async fn device_overview(&self) -> Vec<(AudioDevice, Vec<AppIdentifier>)> {
        let mut overview = Vec::new();
        for device in self.get_playback_devices().await {
            let apps = self.get_device_applications(&device.id).await;
            overview.push((device, apps));
        }
        overview
    }
}

impl<T: VolumeController + ?Sized> VolumeControllerExt for T {}
