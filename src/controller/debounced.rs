//! Debounced controller decorator
//!
//! Wraps any [`VolumeController`] so that bursts of identical operations
//! collapse into one backend call per key. Volume input is validated before
//! it enters a debounce window, so a bad value fails immediately and never
//! displaces a good one.

use async_trait::async_trait;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use super::{BackendKind, VolumeController};
use crate::config::DebounceConfig;
use crate::debounce::{Debouncer, Dropped, KeyedDebouncer};
use crate::error::{Result, ValidationError};
use crate::protocol::{
    AppIdentifier, AudioApplication, AudioDevice, DeviceIdentifier, ServerAddress, VolumePercent,
};

type Shared = Arc<dyn VolumeController>;

fn per_key<K, A, T, KF, F, Fut>(
    inner: &Shared,
    delay: Duration,
    key_of: KF,
    op: F,
) -> KeyedDebouncer<K, A, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    A: Send + 'static,
    T: Clone + Send + 'static,
    KF: Fn(&A) -> K + Send + Sync + 'static,
    F: Fn(Shared, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let inner = inner.clone();
    KeyedDebouncer::new(delay, key_of, move |args| op(inner.clone(), args))
}

fn shared<T, F, Fut>(inner: &Shared, delay: Duration, op: F) -> Debouncer<(), T>
where
    T: Clone + Send + 'static,
    F: Fn(Shared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let inner = inner.clone();
    Debouncer::new(delay, move |_: ()| op(inner.clone()))
}

fn settle<T: Default>(result: std::result::Result<T, Dropped>, operation: &str) -> T {
    result.unwrap_or_else(|e| {
        tracing::warn!("{}: {}", operation, e);
        T::default()
    })
}

pub struct DebouncedController {
    inner: Shared,
    all_devices: Debouncer<(), Vec<DeviceIdentifier>>,
    device_volume: KeyedDebouncer<String, String, VolumePercent>,
    set_device_volume: KeyedDebouncer<String, (String, VolumePercent), bool>,
    mute_device: KeyedDebouncer<String, String, bool>,
    unmute_device: KeyedDebouncer<String, String, bool>,
    playback_devices: Debouncer<(), Vec<AudioDevice>>,
    application: KeyedDebouncer<AppIdentifier, AppIdentifier, Option<AudioApplication>>,
    application_icon: KeyedDebouncer<AppIdentifier, AppIdentifier, Option<Vec<u8>>>,
    application_volume: KeyedDebouncer<AppIdentifier, AppIdentifier, VolumePercent>,
    set_application_volume: KeyedDebouncer<AppIdentifier, (AppIdentifier, VolumePercent), bool>,
    mute_application: KeyedDebouncer<AppIdentifier, AppIdentifier, bool>,
    unmute_application: KeyedDebouncer<AppIdentifier, AppIdentifier, bool>,
    device_applications: KeyedDebouncer<String, String, Vec<AppIdentifier>>,
    heartbeat: Debouncer<(), bool>,
}

impl DebouncedController {
    pub fn new(inner: Shared, delays: &DebounceConfig) -> Self {
        let by_name = |id: &String| id.clone();
        let by_app = |id: &AppIdentifier| *id;

        Self {
            all_devices: shared(&inner, delays.normal(), |c| async move {
                c.get_all_devices().await
            }),
            device_volume: per_key(&inner, delays.fast(), by_name, |c, id: String| async move {
                c.get_device_volume(&id).await
            }),
            set_device_volume: per_key(
                &inner,
                delays.normal(),
                |args: &(String, VolumePercent)| args.0.clone(),
                |c, (id, volume): (String, VolumePercent)| async move {
                    c.set_device_volume(&id, volume.value()).await.unwrap_or(false)
                },
            ),
            mute_device: per_key(&inner, delays.normal(), by_name, |c, id: String| async move {
                c.mute_device(&id).await
            }),
            unmute_device: per_key(&inner, delays.normal(), by_name, |c, id: String| async move {
                c.unmute_device(&id).await
            }),
            playback_devices: shared(&inner, delays.fast(), |c| async move {
                c.get_playback_devices().await
            }),
            application: per_key(&inner, delays.slow(), by_app, |c, id: AppIdentifier| async move {
                c.get_application(id).await
            }),
            application_icon: per_key(&inner, delays.slow(), by_app, |c, id: AppIdentifier| async move {
                c.get_application_icon(id).await
            }),
            application_volume: per_key(&inner, delays.fast(), by_app, |c, id: AppIdentifier| async move {
                c.get_application_volume(id).await
            }),
            set_application_volume: per_key(
                &inner,
                delays.normal(),
                |args: &(AppIdentifier, VolumePercent)| args.0,
                |c, (id, volume): (AppIdentifier, VolumePercent)| async move {
                    c.set_application_volume(id, volume.value()).await.unwrap_or(false)
                },
            ),
            mute_application: per_key(&inner, delays.normal(), by_app, |c, id: AppIdentifier| async move {
                c.mute_application(id).await
            }),
            unmute_application: per_key(&inner, delays.normal(), by_app, |c, id: AppIdentifier| async move {
                c.unmute_application(id).await
            }),
            device_applications: per_key(&inner, delays.normal(), by_name, |c, id: String| async move {
                c.get_device_applications(&id).await
            }),
            heartbeat: shared(&inner, delays.super_fast(), |c| async move { c.heartbeat().await }),
            inner,
        }
    }

    pub fn inner(&self) -> &Shared {
        &self.inner
    }
}

#[async_trait]
impl VolumeController for DebouncedController {
    fn backend(&self) -> BackendKind {
        self.inner.backend()
    }

    async fn get_all_devices(&self) -> Vec<DeviceIdentifier> {
        settle(self.all_devices.call(()).await, "get_all_devices")
    }

    async fn get_device_volume(&self, id: &str) -> VolumePercent {
        settle(self.device_volume.call(id.to_string()).await, "device_get_volume")
    }

    async fn set_device_volume(&self, id: &str, volume: f32) -> std::result::Result<bool, ValidationError> {
        let volume = VolumePercent::new(volume)?;
        let pending = self.set_device_volume.call((id.to_string(), volume));
        Ok(settle(pending.await, "device_set_volume"))
    }

    async fn mute_device(&self, id: &str) -> bool {
        settle(self.mute_device.call(id.to_string()).await, "device_mute")
    }

    async fn unmute_device(&self, id: &str) -> bool {
        settle(self.unmute_device.call(id.to_string()).await, "device_unmute")
    }

    async fn get_playback_devices(&self) -> Vec<AudioDevice> {
        settle(self.playback_devices.call(()).await, "get_playback_devices")
    }

    async fn get_application(&self, id: AppIdentifier) -> Option<AudioApplication> {
        settle(self.application.call(id).await, "get_application")
    }

    async fn get_application_icon(&self, id: AppIdentifier) -> Option<Vec<u8>> {
        settle(self.application_icon.call(id).await, "application_get_icon")
    }

    async fn get_application_volume(&self, id: AppIdentifier) -> VolumePercent {
        settle(self.application_volume.call(id).await, "application_get_volume")
    }

    async fn set_application_volume(
        &self,
        id: AppIdentifier,
        volume: f32,
    ) -> std::result::Result<bool, ValidationError> {
        let volume = VolumePercent::new(volume)?;
        let pending = self.set_application_volume.call((id, volume));
        Ok(settle(pending.await, "application_set_volume"))
    }

    async fn mute_application(&self, id: AppIdentifier) -> bool {
        settle(self.mute_application.call(id).await, "application_mute")
    }

    async fn unmute_application(&self, id: AppIdentifier) -> bool {
        settle(self.unmute_application.call(id).await, "application_unmute")
    }

    async fn get_device_applications(&self, device_id: &str) -> Vec<AppIdentifier> {
        settle(
            self.device_applications.call(device_id.to_string()).await,
            "get_device_applications",
        )
    }

    async fn setup(&self, address: &ServerAddress) -> Result<()> {
        self.inner.setup(address).await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    async fn heartbeat(&self) -> bool {
        settle(self.heartbeat.call(()).await, "heartbeat")
    }

    async fn discover_server(&self) -> Option<ServerAddress> {
        self.inner.discover_server().await
    }
}
