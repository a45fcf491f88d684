//! Client-side projection of the mixer
//!
//! Devices and applications are fetched explicitly and afterwards only
//! changed through [`MixerState::apply`], the single path by which server
//! pushes reach the cached entities.

use std::collections::{HashMap, HashSet};

use crate::controller::VolumeController;
use crate::protocol::{
    AppIdentifier, AudioApplication, AudioDevice, ChangeType, DeviceIdentifier, EntityState,
    Identifier, UpdateChange,
};

/// Outcome of applying one change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A cached entity was modified or removed
    Updated,
    /// The entity has to be fetched again
    NeedsRefresh,
    /// The change refers to nothing cached
    Ignored,
}

#[derive(Debug, Default)]
pub struct MixerState {
    devices: HashMap<DeviceIdentifier, AudioDevice>,
    applications: HashMap<AppIdentifier, AudioApplication>,
    device_applications: HashMap<DeviceIdentifier, Vec<AppIdentifier>>,
    icon_paths: HashMap<AppIdentifier, String>,
    stale: HashSet<Identifier>,
}

impl MixerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached device list
    pub fn set_devices(&mut self, devices: Vec<AudioDevice>) {
        self.devices = devices.into_iter().map(|d| (d.id.clone(), d)).collect();
    }

    pub fn set_device_applications(&mut self, device_id: &str, apps: Vec<AppIdentifier>) {
        self.device_applications.insert(device_id.to_string(), apps);
    }

    pub fn insert_application(&mut self, app: AudioApplication) {
        self.stale.remove(&Identifier::App(app.process.id));
        self.applications.insert(app.process.id, app);
    }

    pub fn device(&self, id: &str) -> Option<&AudioDevice> {
        self.devices.get(id)
    }

    pub fn application(&self, id: AppIdentifier) -> Option<&AudioApplication> {
        self.applications.get(&id)
    }

    /// Devices sorted by id
    pub fn devices(&self) -> Vec<&AudioDevice> {
        let mut devices: Vec<_> = self.devices.values().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn applications_of(&self, device_id: &str) -> &[AppIdentifier] {
        self.device_applications
            .get(device_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn icon_path(&self, id: AppIdentifier) -> Option<&str> {
        self.icon_paths.get(&id).map(String::as_str)
    }

    pub fn is_stale(&self, id: &Identifier) -> bool {
        self.stale.contains(id)
    }

    /// Apply a server push
    pub fn apply(&mut self, update: &UpdateChange) -> Applied {
        match (&update.id, &update.change) {
            (Identifier::Device(id), ChangeType::AudioVolume { volume, mute }) => {
                match self.devices.get_mut(id) {
                    Some(device) => {
                        device.volume.current = *volume;
                        device.volume.muted = *mute;
                        Applied::Updated
                    }
                    None => Applied::Ignored,
                }
            }
            (Identifier::App(id), ChangeType::AudioVolume { volume, mute }) => {
                match self.applications.get_mut(id) {
                    Some(app) => {
                        app.volume.current = *volume;
                        app.volume.muted = *mute;
                        Applied::Updated
                    }
                    None => Applied::Ignored,
                }
            }
            (Identifier::App(id), ChangeType::IconPathChange { path }) => {
                self.icon_paths.insert(*id, path.clone());
                self.stale.insert(update.id.clone());
                Applied::NeedsRefresh
            }
            (Identifier::Device(id), ChangeType::IconPathChange { .. }) => {
                tracing::debug!("Ignoring icon change for device {}", id);
                Applied::Ignored
            }
            (_, ChangeType::StateChange { state: EntityState::Created }) => {
                self.stale.insert(update.id.clone());
                Applied::NeedsRefresh
            }
            (Identifier::Device(id), ChangeType::StateChange { state: EntityState::Disconnect }) => {
                self.stale.remove(&update.id);
                self.device_applications.remove(id);
                match self.devices.remove(id) {
                    Some(_) => Applied::Updated,
                    None => Applied::Ignored,
                }
            }
            (Identifier::App(id), ChangeType::StateChange { state: EntityState::Disconnect }) => {
                // the id may be reused by a new process, forget everything about it
                self.stale.remove(&update.id);
                self.icon_paths.remove(id);
                for apps in self.device_applications.values_mut() {
                    apps.retain(|app| app != id);
                }
                match self.applications.remove(id) {
                    Some(_) => Applied::Updated,
                    None => Applied::Ignored,
                }
            }
        }
    }

    /// Fetch every entity marked stale by [`MixerState::apply`]
    pub async fn refresh_stale(&mut self, controller: &dyn VolumeController) {
        let stale: Vec<Identifier> = self.stale.drain().collect();
        let mut devices_dirty = false;

        for id in stale {
            match id {
                Identifier::App(app_id) => match controller.get_application(app_id).await {
                    Some(app) => self.insert_application(app),
                    None => tracing::debug!("Application {} vanished before refresh", app_id),
                },
                Identifier::Device(_) => devices_dirty = true,
            }
        }

        if devices_dirty {
            let devices = controller.get_playback_devices().await;
            self.set_devices(devices);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AudioVolume, ProcessInfo, SessionDirection, SessionType, VolumePercent};

    fn device(id: &str) -> AudioDevice {
        AudioDevice {
            id: id.into(),
            name: id.into(),
            friendly_name: id.into(),
            direction: SessionDirection::Render,
            is_default: false,
            volume: AudioVolume::default(),
        }
    }

    fn app(id: AppIdentifier) -> AudioApplication {
        AudioApplication {
            process: ProcessInfo {
                id,
                name: format!("app{}", id),
                path: None,
            },
            session_type: SessionType::Application,
            direction: SessionDirection::Render,
            volume: AudioVolume::default(),
            sound_playing: false,
            device_id: None,
        }
    }

    fn volume(id: Identifier, level: f32, mute: bool) -> UpdateChange {
        UpdateChange {
            id,
            change: ChangeType::AudioVolume {
                volume: VolumePercent::new(level).unwrap(),
                mute,
            },
        }
    }

    fn state(id: Identifier, state: EntityState) -> UpdateChange {
        UpdateChange {
            id,
            change: ChangeType::StateChange { state },
        }
    }

    #[test]
    fn test_volume_change_updates_cached_entities() {
        let mut mixer = MixerState::new();
        mixer.set_devices(vec![device("spk1")]);
        mixer.insert_application(app(1234));

        assert_eq!(
            mixer.apply(&volume(Identifier::Device("spk1".into()), 0.3, true)),
            Applied::Updated
        );
        let spk1 = mixer.device("spk1").unwrap();
        assert_eq!(spk1.volume.current.value(), 0.3);
        assert!(spk1.volume.muted);

        assert_eq!(mixer.apply(&volume(Identifier::App(1234), 0.9, false)), Applied::Updated);
        assert_eq!(mixer.application(1234).unwrap().volume.current.value(), 0.9);

        assert_eq!(mixer.apply(&volume(Identifier::App(1), 0.5, false)), Applied::Ignored);
    }

    #[test]
    fn test_disconnect_forgets_reused_pid() {
        let mut mixer = MixerState::new();
        mixer.insert_application(app(1234));
        mixer.set_device_applications("spk1", vec![1234, 42]);
        mixer.apply(&UpdateChange {
            id: Identifier::App(1234),
            change: ChangeType::IconPathChange {
                path: "C:/old.exe".into(),
            },
        });

        assert_eq!(
            mixer.apply(&state(Identifier::App(1234), EntityState::Disconnect)),
            Applied::Updated
        );
        assert!(mixer.application(1234).is_none());
        assert_eq!(mixer.icon_path(1234), None);
        assert!(!mixer.is_stale(&Identifier::App(1234)));
        assert_eq!(mixer.applications_of("spk1"), &[42]);
    }

    #[test]
    fn test_created_and_icon_mark_stale() {
        let mut mixer = MixerState::new();

        assert_eq!(
            mixer.apply(&state(Identifier::App(7), EntityState::Created)),
            Applied::NeedsRefresh
        );
        assert!(mixer.is_stale(&Identifier::App(7)));

        let icon = UpdateChange {
            id: Identifier::App(8),
            change: ChangeType::IconPathChange {
                path: "/usr/bin/player".into(),
            },
        };
        assert_eq!(mixer.apply(&icon), Applied::NeedsRefresh);
        assert_eq!(mixer.icon_path(8), Some("/usr/bin/player"));
    }

    #[test]
    fn test_device_disconnect() {
        let mut mixer = MixerState::new();
        mixer.set_devices(vec![device("spk1"), device("hdmi")]);
        mixer.set_device_applications("hdmi", vec![1]);

        mixer.apply(&state(Identifier::Device("hdmi".into()), EntityState::Disconnect));
        assert_eq!(mixer.devices().len(), 1);
        assert!(mixer.applications_of("hdmi").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_stale_uses_controller() {
        use crate::controller::testing::RecordingController;

        let controller = RecordingController::new();
        let mut mixer = MixerState::new();
        mixer.apply(&state(Identifier::App(1234), EntityState::Created));
        mixer.apply(&state(Identifier::Device("usb".into()), EntityState::Created));

        mixer.refresh_stale(controller.as_ref()).await;

        let mut calls = controller.calls();
        calls.sort();
        assert_eq!(calls, vec!["get_application 1234", "get_playback_devices"]);
        assert!(!mixer.is_stale(&Identifier::App(1234)));
    }
}
