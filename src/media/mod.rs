pub mod capture;
pub mod devices;
pub mod recorder;
pub mod tracks;

pub use capture::{CaptureStream, MediaChunk};
pub use devices::{CaptureProvider, DeviceManager};
pub use recorder::{RecorderState, RecordingArtifact, RecordingMetadata, SessionRecorder};
pub use tracks::{LocalMediaState, LocalTrack, TrackSummary};
