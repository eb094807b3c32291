//! Media sink abstraction.
//!
//! The real implementation wraps the Media Foundation sink writer; tests
//! use [`crate::mock::RecordingSink`], which records every submission.

use crate::error::CaptureError;

/// Single-consumer container sink. All methods must be called from the
/// capture thread; submissions on one stream must arrive in emission order.
pub trait MediaSink {
    /// Submit one BGRA video frame. `elapsed_ms` is wall time since the
    /// recording epoch, carried for diagnostics only; presentation
    /// timestamps come from the per-stream sample clock.
    fn add_video_frame(&mut self, data: &[u8], elapsed_ms: u64) -> Result<(), CaptureError>;

    /// Submit PCM frames to the combined audio track. No-op when the sink
    /// was opened without an audio stream.
    fn add_audio_frame(&mut self, data: &[u8], frames: u32, elapsed_ms: u64)
        -> Result<(), CaptureError>;

    /// Submit PCM frames to the system audio track. Dual-track only.
    fn add_system_audio_frame(
        &mut self,
        data: &[u8],
        frames: u32,
        elapsed_ms: u64,
    ) -> Result<(), CaptureError>;

    /// Submit PCM frames to the microphone track. Dual-track only.
    fn add_mic_audio_frame(
        &mut self,
        data: &[u8],
        frames: u32,
        elapsed_ms: u64,
    ) -> Result<(), CaptureError>;

    /// Flush all streams, mark end-of-stream on every stream that carried
    /// data, and close the container. Idempotent.
    fn finalize(&mut self) -> Result<(), CaptureError>;

    /// Release the sink and reset its state so a subsequent recording in
    /// the same process starts clean. Safe to call more than once.
    fn cleanup(&mut self);
}
