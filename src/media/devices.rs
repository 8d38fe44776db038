use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;

use crate::media::capture::{self, CaptureStream};
use crate::types::{DeviceKind, MediaDeviceInfo};
use crate::utils::{Error, Result};

/// Access to one family of capture devices. Providers enumerate what is
/// available and open live streams; they never hold session state.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    fn kind(&self) -> DeviceKind;
    fn devices(&self) -> Vec<MediaDeviceInfo>;
    async fn open(&self, device_id: &str) -> Result<CaptureStream>;
}

/// Enumerates and opens capture devices through registered providers and
/// remembers the current selection per kind. Selection only moves after an
/// open succeeds, so a failed open never costs the caller their working
/// device.
pub struct DeviceManager {
    providers: HashMap<DeviceKind, Arc<dyn CaptureProvider>>,
    selected: Mutex<HashMap<DeviceKind, String>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            selected: Mutex::new(HashMap::new()),
        }
    }

    /// A manager backed entirely by deterministic synthetic sources; what
    /// the demo binary and the tests run on.
    pub fn synthetic() -> Self {
        let mut manager = Self::new();
        manager.register(Arc::new(SyntheticProvider::microphones()));
        manager.register(Arc::new(SyntheticProvider::cameras()));
        manager.register(Arc::new(SyntheticProvider::screens()));
        manager
    }

    /// Synthetic camera and screen sources with real microphone input.
    #[cfg(feature = "audio-capture")]
    pub fn with_system_audio() -> Self {
        let mut manager = Self::synthetic();
        manager.register(Arc::new(SystemAudioProvider));
        manager
    }

    pub fn register(&mut self, provider: Arc<dyn CaptureProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn list_devices(&self, kind: DeviceKind) -> Vec<MediaDeviceInfo> {
        self.providers
            .get(&kind)
            .map(|p| p.devices())
            .unwrap_or_default()
    }

    pub fn selected_id(&self, kind: DeviceKind) -> Option<String> {
        self.selected.lock().get(&kind).cloned()
    }

    /// Opens a capture stream. With no explicit id the current selection is
    /// used, falling back to the first enumerated device.
    pub async fn open(&self, kind: DeviceKind, device_id: Option<&str>) -> Result<CaptureStream> {
        let provider = self
            .providers
            .get(&kind)
            .ok_or_else(|| Error::DeviceUnavailable(format!("no provider for {:?}", kind)))?;

        let id = match device_id {
            Some(id) => id.to_string(),
            None => self
                .selected
                .lock()
                .get(&kind)
                .cloned()
                .or_else(|| provider.devices().first().map(|d| d.id.clone()))
                .ok_or_else(|| {
                    Error::DeviceUnavailable(format!("no {:?} devices available", kind))
                })?,
        };

        let stream = provider.open(&id).await?;
        self.selected.lock().insert(kind, stream.device.id.clone());
        info!("Opened {:?} device {}", kind, stream.device.label);
        Ok(stream)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::synthetic()
    }
}

/// Deterministic generator-backed devices.
pub struct SyntheticProvider {
    kind: DeviceKind,
    devices: Vec<MediaDeviceInfo>,
}

impl SyntheticProvider {
    fn device(id: &str, label: &str, kind: DeviceKind) -> MediaDeviceInfo {
        MediaDeviceInfo {
            id: id.to_string(),
            label: label.to_string(),
            kind,
        }
    }

    pub fn microphones() -> Self {
        Self {
            kind: DeviceKind::Microphone,
            devices: vec![
                Self::device("synthetic-mic-1", "Synthetic Microphone 1", DeviceKind::Microphone),
                Self::device("synthetic-mic-2", "Synthetic Microphone 2", DeviceKind::Microphone),
            ],
        }
    }

    pub fn cameras() -> Self {
        Self {
            kind: DeviceKind::Camera,
            devices: vec![
                Self::device("synthetic-cam-1", "Synthetic Camera 1", DeviceKind::Camera),
                Self::device("synthetic-cam-2", "Synthetic Camera 2", DeviceKind::Camera),
            ],
        }
    }

    pub fn screens() -> Self {
        Self {
            kind: DeviceKind::Screen,
            devices: vec![Self::device("screen-1", "Entire Screen", DeviceKind::Screen)],
        }
    }
}

#[async_trait]
impl CaptureProvider for SyntheticProvider {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn devices(&self) -> Vec<MediaDeviceInfo> {
        self.devices.clone()
    }

    async fn open(&self, device_id: &str) -> Result<CaptureStream> {
        let device = self
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceUnavailable(format!("unknown device {}", device_id)))?;

        Ok(match self.kind {
            DeviceKind::Microphone => capture::synthetic_audio_stream(device),
            DeviceKind::Camera => capture::synthetic_video_stream(device, capture::CAMERA_FRAME),
            DeviceKind::Screen => capture::synthetic_video_stream(device, capture::SCREEN_FRAME),
        })
    }
}

/// Real microphones via cpal.
#[cfg(feature = "audio-capture")]
pub struct SystemAudioProvider;

#[cfg(feature = "audio-capture")]
#[async_trait]
impl CaptureProvider for SystemAudioProvider {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Microphone
    }

    fn devices(&self) -> Vec<MediaDeviceInfo> {
        capture::system_audio::input_device_names()
            .into_iter()
            .map(|name| MediaDeviceInfo {
                id: name.clone(),
                label: name,
                kind: DeviceKind::Microphone,
            })
            .collect()
    }

    async fn open(&self, device_id: &str) -> Result<CaptureStream> {
        let device = MediaDeviceInfo {
            id: device_id.to_string(),
            label: device_id.to_string(),
            kind: DeviceKind::Microphone,
        };
        tokio::task::spawn_blocking(move || capture::system_audio::open_input(device))
            .await
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_falls_back_to_first_device_and_records_selection() {
        let manager = DeviceManager::synthetic();
        assert_eq!(manager.selected_id(DeviceKind::Microphone), None);

        let stream = manager.open(DeviceKind::Microphone, None).await.unwrap();
        assert_eq!(stream.device.id, "synthetic-mic-1");
        assert_eq!(
            manager.selected_id(DeviceKind::Microphone),
            Some("synthetic-mic-1".to_string())
        );
    }

    #[tokio::test]
    async fn failed_open_leaves_selection_untouched() {
        let manager = DeviceManager::synthetic();
        manager
            .open(DeviceKind::Camera, Some("synthetic-cam-2"))
            .await
            .unwrap();

        match manager.open(DeviceKind::Camera, Some("no-such-cam")).await {
            Err(Error::DeviceUnavailable(_)) => {}
            other => panic!("expected DeviceUnavailable, got {:?}", other.err().map(|e| e.to_string())),
        }
        assert_eq!(
            manager.selected_id(DeviceKind::Camera),
            Some("synthetic-cam-2".to_string())
        );
    }

    #[tokio::test]
    async fn kinds_enumerate_independently() {
        let manager = DeviceManager::synthetic();
        assert_eq!(manager.list_devices(DeviceKind::Microphone).len(), 2);
        assert_eq!(manager.list_devices(DeviceKind::Camera).len(), 2);
        assert_eq!(manager.list_devices(DeviceKind::Screen).len(), 1);
    }
}
