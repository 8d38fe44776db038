use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::media::capture::{CaptureStream, MediaChunk};
use crate::types::{MediaDeviceInfo, TrackKind, VideoSource};
use crate::utils::{Error, Result};

const TAP_CAPACITY: usize = 256;

/// One outbound media track. The RTC track handed to peer connections stays
/// the same for the track's whole life; device switches and screen shares
/// only repoint the capture stream feeding it, so peers never renegotiate.
pub struct LocalTrack {
    pub kind: TrackKind,
    device: Mutex<MediaDeviceInfo>,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    tap: broadcast::Sender<MediaChunk>,
    source_tx: mpsc::Sender<CaptureStream>,
    pump: JoinHandle<()>,
}

impl LocalTrack {
    pub fn new(stream: CaptureStream) -> Self {
        let kind = stream.device.kind.track_kind();
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
        };
        let track_id = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            track_id.to_owned(),
            "interview-room".to_owned(),
        ));
        let enabled = Arc::new(AtomicBool::new(true));
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        let (source_tx, source_rx) = mpsc::channel(4);
        let device = Mutex::new(stream.device.clone());

        info!("Local {:?} track opened on {}", kind, stream.device.label);
        let pump = tokio::spawn(Self::run_pump(
            stream.chunks,
            source_rx,
            rtc.clone(),
            enabled.clone(),
            tap.clone(),
        ));

        Self {
            kind,
            device,
            rtc,
            enabled,
            tap,
            source_tx,
            pump,
        }
    }

    /// Moves chunks from the current capture source into the RTC track and
    /// the recorder tap. A disabled track swallows chunks instead; a source
    /// that ends leaves the slot parked until the next swap arrives.
    async fn run_pump(
        initial: mpsc::Receiver<MediaChunk>,
        mut source_rx: mpsc::Receiver<CaptureStream>,
        rtc: Arc<TrackLocalStaticSample>,
        enabled: Arc<AtomicBool>,
        tap: broadcast::Sender<MediaChunk>,
    ) {
        let mut current = Some(initial);
        loop {
            tokio::select! {
                swapped = source_rx.recv() => match swapped {
                    Some(stream) => {
                        debug!("Track source swapped to {}", stream.device.label);
                        current = Some(stream.chunks);
                    }
                    None => break,
                },
                chunk = async { current.as_mut().unwrap().recv().await }, if current.is_some() => {
                    match chunk {
                        Some(chunk) => {
                            if !enabled.load(Ordering::Relaxed) {
                                continue;
                            }
                            let sample = Sample {
                                data: chunk.payload.clone(),
                                duration: chunk.duration,
                                ..Default::default()
                            };
                            if let Err(e) = rtc.write_sample(&sample).await {
                                debug!("Dropped sample: {}", e);
                            }
                            let _ = tap.send(chunk);
                        }
                        None => current = None,
                    }
                },
            }
        }
    }

    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    pub fn device(&self) -> MediaDeviceInfo {
        self.device.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Flips the enabled gate and returns the new state.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn tap(&self) -> broadcast::Receiver<MediaChunk> {
        self.tap.subscribe()
    }

    /// Replaces the capture source behind the track in place.
    pub async fn swap_source(&self, stream: CaptureStream) -> Result<()> {
        *self.device.lock() = stream.device.clone();
        self.source_tx
            .send(stream)
            .await
            .map_err(|_| Error::Media("track pump is gone".to_string()))
    }

    pub(crate) fn source_sender(&self) -> mpsc::Sender<CaptureStream> {
        self.source_tx.clone()
    }

    pub(crate) fn set_device(&self, device: MediaDeviceInfo) {
        *self.device.lock() = device;
    }

    /// Stops the pump and, through it, the capture source.
    pub async fn stop(self) {
        let device = self.device.lock().clone();
        drop(self.source_tx);
        let _ = self.pump.await;
        info!("Local {:?} track on {} stopped", self.kind, device.label);
    }
}

/// What a track looked like at a point in time; recorded into artifact
/// metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackSummary {
    pub kind: TrackKind,
    pub device: String,
    pub enabled: bool,
}

/// The local participant's capture state: at most one audio and one video
/// track, and which feed currently backs the video slot.
pub struct LocalMediaState {
    audio: Mutex<Option<LocalTrack>>,
    video: Mutex<Option<LocalTrack>>,
    video_source: Mutex<VideoSource>,
}

impl LocalMediaState {
    pub fn new() -> Self {
        Self {
            audio: Mutex::new(None),
            video: Mutex::new(None),
            video_source: Mutex::new(VideoSource::Camera),
        }
    }

    pub fn set_audio(&self, track: LocalTrack) -> Option<LocalTrack> {
        self.audio.lock().replace(track)
    }

    pub fn set_video(&self, track: LocalTrack) -> Option<LocalTrack> {
        self.video.lock().replace(track)
    }

    pub fn has_active_track(&self) -> bool {
        self.audio.lock().is_some() || self.video.lock().is_some()
    }

    pub fn audio_enabled(&self) -> Option<bool> {
        self.audio.lock().as_ref().map(|t| t.is_enabled())
    }

    pub fn video_enabled(&self) -> Option<bool> {
        self.video.lock().as_ref().map(|t| t.is_enabled())
    }

    pub fn toggle_audio(&self) -> Result<bool> {
        match self.audio.lock().as_ref() {
            Some(track) => Ok(track.toggle()),
            None => Err(Error::NoActiveStream),
        }
    }

    pub fn toggle_video(&self) -> Result<bool> {
        match self.video.lock().as_ref() {
            Some(track) => Ok(track.toggle()),
            None => Err(Error::NoActiveStream),
        }
    }

    pub fn video_source(&self) -> VideoSource {
        *self.video_source.lock()
    }

    pub fn set_video_source(&self, source: VideoSource) {
        *self.video_source.lock() = source;
    }

    pub fn audio_device(&self) -> Option<MediaDeviceInfo> {
        self.audio.lock().as_ref().map(|t| t.device())
    }

    pub fn video_device(&self) -> Option<MediaDeviceInfo> {
        self.video.lock().as_ref().map(|t| t.device())
    }

    /// RTC handles for attaching the local stream to a new peer connection.
    pub fn rtc_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        let mut tracks = Vec::new();
        if let Some(track) = self.audio.lock().as_ref() {
            tracks.push(track.rtc());
        }
        if let Some(track) = self.video.lock().as_ref() {
            tracks.push(track.rtc());
        }
        tracks
    }

    /// Chunk taps for the recorder, one per live track.
    pub fn taps(&self) -> Vec<broadcast::Receiver<MediaChunk>> {
        let mut taps = Vec::new();
        if let Some(track) = self.audio.lock().as_ref() {
            taps.push(track.tap());
        }
        if let Some(track) = self.video.lock().as_ref() {
            taps.push(track.tap());
        }
        taps
    }

    pub fn summaries(&self) -> Vec<TrackSummary> {
        let mut out = Vec::new();
        if let Some(track) = self.audio.lock().as_ref() {
            out.push(TrackSummary {
                kind: TrackKind::Audio,
                device: track.device().label,
                enabled: track.is_enabled(),
            });
        }
        if let Some(track) = self.video.lock().as_ref() {
            out.push(TrackSummary {
                kind: TrackKind::Video,
                device: track.device().label,
                enabled: track.is_enabled(),
            });
        }
        out
    }

    /// Swaps the capture source behind the audio track. The lock is released
    /// before the hand-off so the pump can drain freely.
    pub async fn swap_audio(&self, stream: CaptureStream) -> Result<()> {
        let sender = {
            let guard = self.audio.lock();
            match guard.as_ref() {
                Some(track) => {
                    track.set_device(stream.device.clone());
                    track.source_sender()
                }
                None => return Err(Error::NoActiveStream),
            }
        };
        sender
            .send(stream)
            .await
            .map_err(|_| Error::Media("audio pump is gone".to_string()))
    }

    pub async fn swap_video(&self, stream: CaptureStream) -> Result<()> {
        let sender = {
            let guard = self.video.lock();
            match guard.as_ref() {
                Some(track) => {
                    track.set_device(stream.device.clone());
                    track.source_sender()
                }
                None => return Err(Error::NoActiveStream),
            }
        };
        sender
            .send(stream)
            .await
            .map_err(|_| Error::Media("video pump is gone".to_string()))
    }

    /// Empties both slots, handing the tracks back for teardown.
    pub fn take_tracks(&self) -> Vec<LocalTrack> {
        let mut out = Vec::new();
        if let Some(track) = self.audio.lock().take() {
            out.push(track);
        }
        if let Some(track) = self.video.lock().take() {
            out.push(track);
        }
        out
    }
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self::new()
    }
}
