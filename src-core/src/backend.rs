//! Platform backend seam.
//!
//! Binds concrete source and sink types so the orchestrator can be driven
//! by the Windows capture stack or by the mock backend in tests.

use crate::error::CaptureError;
use crate::params::{CaptureParams, RecordingMode};
use crate::sink::MediaSink;
use crate::source::{AudioFormat, AudioSource, VideoSource};

/// Factory for the components of one recording.
///
/// Each `open_*` call performs the component's init phase; failures are
/// surfaced as [`CaptureError::InitFailed`] and the orchestrator decides
/// whether they are fatal or downgrade the recording.
pub trait CaptureBackend {
    type Video: VideoSource;
    type Audio: AudioSource;
    type Sink: MediaSink;

    /// Open the desktop duplication stream on the configured monitor.
    fn open_screen(&mut self, params: &CaptureParams) -> Result<Self::Video, CaptureError>;

    /// Open a loopback capture of the default render endpoint.
    fn open_system_audio(&mut self) -> Result<Self::Audio, CaptureError>;

    /// Open a capture of the default microphone endpoint.
    fn open_microphone(&mut self) -> Result<Self::Audio, CaptureError>;

    /// Open the container sink for the resolved recording mode.
    /// `dimensions` is required for the video-bearing variants and
    /// `audio_format` for the audio-bearing ones.
    fn open_sink(
        &mut self,
        params: &CaptureParams,
        mode: RecordingMode,
        dimensions: Option<(u32, u32)>,
        audio_format: Option<AudioFormat>,
    ) -> Result<Self::Sink, CaptureError>;
}
