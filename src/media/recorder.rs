use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::media::capture::MediaChunk;
use crate::media::tracks::TrackSummary;
use crate::types::TrackKind;
use crate::utils::{Error, Result};

const MAGIC: &[u8; 4] = b"IRRC";
const FORMAT_VERSION: u16 = 1;
const MAX_BUFFERED_CHUNKS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Finalizing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub recording_id: Uuid,
    pub room_id: String,
    pub started_at: DateTime<Utc>,
    pub tracks: Vec<TrackSummary>,
    pub chunk_count: usize,
}

struct TimedChunk {
    offset_ms: u64,
    kind: TrackKind,
    payload: Bytes,
}

struct ActiveRecording {
    id: Uuid,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    tracks: Vec<TrackSummary>,
    chunks: Arc<Mutex<Vec<TimedChunk>>>,
    stop: watch::Sender<bool>,
    collectors: Vec<JoinHandle<()>>,
}

struct RecorderInner {
    state: RecorderState,
    active: Option<ActiveRecording>,
}

/// Buffers the local captured stream while recording and finalizes it into
/// exactly one artifact on stop. Always the local stream, never a mix of
/// remote peers.
pub struct SessionRecorder {
    room_id: String,
    inner: Mutex<RecorderInner>,
}

impl SessionRecorder {
    pub fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            inner: Mutex::new(RecorderInner {
                state: RecorderState::Idle,
                active: None,
            }),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.inner.lock().state
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Recording
    }

    /// Starts buffering from the given track taps. One collector task per
    /// tap; chunks are timestamped against the recording start so device
    /// swaps mid-recording keep a consistent timeline.
    pub fn start(
        &self,
        taps: Vec<broadcast::Receiver<MediaChunk>>,
        tracks: Vec<TrackSummary>,
    ) -> Result<()> {
        if taps.is_empty() {
            return Err(Error::NoActiveStream);
        }

        let mut inner = self.inner.lock();
        if inner.state != RecorderState::Idle {
            return Err(Error::RecorderBusy);
        }

        let id = Uuid::new_v4();
        let started_instant = Instant::now();
        let chunks: Arc<Mutex<Vec<TimedChunk>>> = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, _) = watch::channel(false);

        let mut collectors = Vec::with_capacity(taps.len());
        for mut tap in taps {
            let chunks = chunks.clone();
            let mut stop_rx = stop_tx.subscribe();
            collectors.push(tokio::spawn(async move {
                let mut at_capacity = false;
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        received = tap.recv() => match received {
                            Ok(chunk) => {
                                let offset_ms = started_instant.elapsed().as_millis() as u64;
                                let mut guard = chunks.lock();
                                if guard.len() < MAX_BUFFERED_CHUNKS {
                                    guard.push(TimedChunk {
                                        offset_ms,
                                        kind: chunk.kind,
                                        payload: chunk.payload,
                                    });
                                } else if !at_capacity {
                                    at_capacity = true;
                                    warn!("Recording buffer full, dropping further chunks");
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Recorder fell behind, skipped {} chunks", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }));
        }

        inner.state = RecorderState::Recording;
        inner.active = Some(ActiveRecording {
            id,
            started_at: Utc::now(),
            started_instant,
            tracks,
            chunks,
            stop: stop_tx,
            collectors,
        });
        info!("Recording {} started for room {}", id, self.room_id);
        Ok(())
    }

    /// Finalizes the buffered chunks into a single artifact and returns to
    /// Idle. Never returns a partial recording.
    pub async fn stop(&self) -> Result<RecordingArtifact> {
        let active = {
            let mut inner = self.inner.lock();
            if inner.state != RecorderState::Recording {
                return Err(Error::RecorderNotActive);
            }
            match inner.active.take() {
                Some(active) => {
                    inner.state = RecorderState::Finalizing;
                    active
                }
                None => {
                    inner.state = RecorderState::Idle;
                    return Err(Error::RecorderNotActive);
                }
            }
        };

        let _ = active.stop.send(true);
        for collector in active.collectors {
            let _ = collector.await;
        }

        let mut chunks = match Arc::try_unwrap(active.chunks) {
            Ok(m) => m.into_inner(),
            Err(shared) => std::mem::take(&mut *shared.lock()),
        };
        chunks.sort_by_key(|c| c.offset_ms);

        let metadata = RecordingMetadata {
            recording_id: active.id,
            room_id: self.room_id.clone(),
            started_at: active.started_at,
            tracks: active.tracks,
            chunk_count: chunks.len(),
        };
        let artifact = RecordingArtifact::assemble(&metadata, &chunks)?;

        self.inner.lock().state = RecorderState::Idle;
        info!(
            "Recording {} finalized: {} chunks, {} bytes",
            active.id,
            metadata.chunk_count,
            artifact.data.len()
        );
        Ok(artifact)
    }

    /// Drops an in-progress recording without producing an artifact. Used
    /// when the room is left mid-recording.
    pub fn abort(&self) -> bool {
        let mut inner = self.inner.lock();
        let aborted = inner.active.take();
        inner.state = RecorderState::Idle;
        match aborted {
            Some(active) => {
                let _ = active.stop.send(true);
                warn!("Recording {} aborted, buffer discarded", active.id);
                true
            }
            None => false,
        }
    }
}

/// A finalized recording: one self-contained blob plus the filename to save
/// it under.
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub file_name: String,
    pub data: Bytes,
}

impl RecordingArtifact {
    fn assemble(metadata: &RecordingMetadata, chunks: &[TimedChunk]) -> Result<Self> {
        let meta_bytes = serde_json::to_vec(metadata)?;
        let mut buf = BytesMut::with_capacity(
            MAGIC.len() + 2 + 4 + meta_bytes.len() + chunks.iter().map(|c| 13 + c.payload.len()).sum::<usize>(),
        );
        buf.put_slice(MAGIC);
        buf.put_u16(FORMAT_VERSION);
        buf.put_u32(meta_bytes.len() as u32);
        buf.put_slice(&meta_bytes);
        for chunk in chunks {
            buf.put_u8(match chunk.kind {
                TrackKind::Audio => 0,
                TrackKind::Video => 1,
            });
            buf.put_u64(chunk.offset_ms);
            buf.put_u32(chunk.payload.len() as u32);
            buf.put_slice(&chunk.payload);
        }

        let file_name = format!(
            "interview-recording-{}.irr",
            metadata.started_at.format("%Y%m%d-%H%M%S")
        );
        Ok(Self {
            file_name,
            data: buf.freeze(),
        })
    }

    /// Reads the metadata header back out of the container.
    pub fn metadata(&self) -> Result<RecordingMetadata> {
        let mut buf = self.data.clone();
        if buf.len() < MAGIC.len() + 6 || &buf[..MAGIC.len()] != MAGIC {
            return Err(Error::Media("not a recording container".to_string()));
        }
        buf.advance(MAGIC.len());
        let version = buf.get_u16();
        if version != FORMAT_VERSION {
            return Err(Error::Media(format!(
                "unsupported recording format version {}",
                version
            )));
        }
        let meta_len = buf.get_u32() as usize;
        if buf.len() < meta_len {
            return Err(Error::Media("truncated recording metadata".to_string()));
        }
        let metadata = serde_json::from_slice(&buf[..meta_len])?;
        Ok(metadata)
    }

    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&self.file_name);
        std::fs::write(&path, &self.data)?;
        info!("Recording exported to {}", path.display());
        Ok(path)
    }
}
