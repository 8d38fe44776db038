use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::types::{MediaDeviceInfo, TrackKind};

/// One captured slice of media, timestamped relative to capture start.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub kind: TrackKind,
    pub timestamp_ms: u64,
    pub duration: Duration,
    pub payload: Bytes,
}

/// A live capture source. The producer stops on its own once the receiver
/// is dropped, so handing the stream to a track (or dropping it) is the
/// whole lifecycle.
pub struct CaptureStream {
    pub device: MediaDeviceInfo,
    pub chunks: mpsc::Receiver<MediaChunk>,
}

pub(crate) const AUDIO_FRAME: Duration = Duration::from_millis(20);
pub(crate) const CAMERA_FRAME: Duration = Duration::from_millis(33);
pub(crate) const SCREEN_FRAME: Duration = Duration::from_millis(100);

const AUDIO_SAMPLE_RATE: f32 = 8000.0;
const AUDIO_SAMPLES_PER_FRAME: usize = 160;
const FRAME_WIDTH: usize = 32;
const FRAME_HEIGHT: usize = 24;

fn device_seed(id: &str) -> u32 {
    id.bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32))
}

/// Deterministic sine-tone source; the tone frequency is derived from the
/// device id so two synthetic microphones are distinguishable.
pub fn synthetic_audio_stream(device: MediaDeviceInfo) -> CaptureStream {
    let (tx, rx) = mpsc::channel(64);
    let tone_hz = 220.0 + (device_seed(&device.id) % 440) as f32;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(AUDIO_FRAME);
        let mut timestamp_ms = 0u64;
        let mut phase = 0f32;
        loop {
            interval.tick().await;
            let mut buf = Vec::with_capacity(AUDIO_SAMPLES_PER_FRAME * 2);
            for _ in 0..AUDIO_SAMPLES_PER_FRAME {
                let value = (phase.sin() * 8000.0) as i16;
                buf.extend_from_slice(&value.to_le_bytes());
                phase += 2.0 * std::f32::consts::PI * tone_hz / AUDIO_SAMPLE_RATE;
                if phase > 2.0 * std::f32::consts::PI {
                    phase -= 2.0 * std::f32::consts::PI;
                }
            }
            let chunk = MediaChunk {
                kind: TrackKind::Audio,
                timestamp_ms,
                duration: AUDIO_FRAME,
                payload: Bytes::from(buf),
            };
            timestamp_ms += AUDIO_FRAME.as_millis() as u64;
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    CaptureStream { device, chunks: rx }
}

/// Deterministic moving-gradient frame source used for cameras and screen
/// capture alike; only the frame interval differs.
pub fn synthetic_video_stream(device: MediaDeviceInfo, frame_interval: Duration) -> CaptureStream {
    let (tx, rx) = mpsc::channel(64);
    let seed = device_seed(&device.id) as u8;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(frame_interval);
        let mut timestamp_ms = 0u64;
        let mut frame_index = 0u32;
        loop {
            interval.tick().await;
            let mut buf = Vec::with_capacity(8 + FRAME_WIDTH * FRAME_HEIGHT);
            buf.extend_from_slice(&frame_index.to_le_bytes());
            buf.extend_from_slice(&(FRAME_WIDTH as u16).to_le_bytes());
            buf.extend_from_slice(&(FRAME_HEIGHT as u16).to_le_bytes());
            for y in 0..FRAME_HEIGHT {
                for x in 0..FRAME_WIDTH {
                    buf.push(seed.wrapping_add((x + y) as u8).wrapping_add(frame_index as u8));
                }
            }
            let chunk = MediaChunk {
                kind: TrackKind::Video,
                timestamp_ms,
                duration: frame_interval,
                payload: Bytes::from(buf),
            };
            timestamp_ms += frame_interval.as_millis() as u64;
            frame_index = frame_index.wrapping_add(1);
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    CaptureStream { device, chunks: rx }
}

#[cfg(feature = "audio-capture")]
pub(crate) mod system_audio {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::SampleFormat;
    use log::warn;

    use super::*;
    use crate::utils::{Error, Result};

    pub fn input_device_names() -> Vec<String> {
        let host = cpal::default_host();
        match host.input_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                warn!("Failed to enumerate input devices: {}", e);
                Vec::new()
            }
        }
    }

    /// Opens a microphone on a dedicated thread. cpal streams are not Send,
    /// so the stream lives and dies on that thread; the capture callback
    /// forwards chunks and flips `done` once the consumer goes away.
    pub fn open_input(device: MediaDeviceInfo) -> Result<CaptureStream> {
        let (tx, rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let name = device.id.clone();

        std::thread::spawn(move || match build_stream(&name, tx) {
            Ok((stream, done)) => {
                let _ = ready_tx.send(Ok(()));
                while !done.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(100));
                }
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        });

        ready_rx
            .recv()
            .map_err(|_| Error::DeviceUnavailable("capture thread exited".to_string()))??;
        Ok(CaptureStream { device, chunks: rx })
    }

    fn build_stream(
        name: &str,
        tx: mpsc::Sender<MediaChunk>,
    ) -> Result<(cpal::Stream, Arc<AtomicBool>)> {
        let host = cpal::default_host();
        let device = host
            .input_devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| Error::DeviceUnavailable(format!("input device {} not found", name)))?;

        let config = device
            .default_input_config()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        let format = config.sample_format();
        let done = Arc::new(AtomicBool::new(false));
        let err_fn = |err| warn!("Input stream error: {}", err);

        let stream = match format {
            SampleFormat::F32 => {
                let done = done.clone();
                let mut timestamp_ms = 0u64;
                device.build_input_stream(
                    &config.into(),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mut buf = Vec::with_capacity(data.len() * 2);
                        for s in data {
                            let value = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                            buf.extend_from_slice(&value.to_le_bytes());
                        }
                        forward(&tx, &done, &mut timestamp_ms, buf, channels, sample_rate);
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let done = done.clone();
                let mut timestamp_ms = 0u64;
                device.build_input_stream(
                    &config.into(),
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let mut buf = Vec::with_capacity(data.len() * 2);
                        for s in data {
                            buf.extend_from_slice(&s.to_le_bytes());
                        }
                        forward(&tx, &done, &mut timestamp_ms, buf, channels, sample_rate);
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(Error::DeviceUnavailable(format!(
                    "unsupported sample format: {:?}",
                    other
                )))
            }
        }
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        Ok((stream, done))
    }

    fn forward(
        tx: &mpsc::Sender<MediaChunk>,
        done: &AtomicBool,
        timestamp_ms: &mut u64,
        buf: Vec<u8>,
        channels: usize,
        sample_rate: u32,
    ) {
        let frames = (buf.len() / 2) / channels.max(1);
        let duration = Duration::from_secs_f64(frames as f64 / sample_rate as f64);
        let chunk = MediaChunk {
            kind: TrackKind::Audio,
            timestamp_ms: *timestamp_ms,
            duration,
            payload: Bytes::from(buf),
        };
        *timestamp_ms += duration.as_millis() as u64;
        if tx.try_send(chunk).is_err() && tx.is_closed() {
            done.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceKind;

    fn mic(id: &str) -> MediaDeviceInfo {
        MediaDeviceInfo {
            id: id.to_string(),
            label: id.to_string(),
            kind: DeviceKind::Microphone,
        }
    }

    #[tokio::test]
    async fn audio_chunks_advance_monotonically() {
        let mut stream = synthetic_audio_stream(mic("synthetic-mic-1"));
        let first = stream.chunks.recv().await.unwrap();
        let second = stream.chunks.recv().await.unwrap();
        assert_eq!(first.kind, TrackKind::Audio);
        assert_eq!(first.payload.len(), AUDIO_SAMPLES_PER_FRAME * 2);
        assert!(second.timestamp_ms > first.timestamp_ms);
    }

    #[tokio::test]
    async fn producer_stops_when_receiver_dropped() {
        let stream = synthetic_audio_stream(mic("synthetic-mic-1"));
        drop(stream);
        // Nothing to assert directly; the producer task exits on its next
        // send. Yield so it gets the chance before the test runtime drops.
        tokio::task::yield_now().await;
    }
}
