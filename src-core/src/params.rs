//! Capture parameters, validation, and recording-mode resolution.

use std::path::PathBuf;

use crate::error::CaptureError;

/// Screen sub-rectangle to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Defensive limits on the capture loop. Not exposed on the CLI; tests
/// lower them to exercise the watchdog paths.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogLimits {
    /// Abort if the loop spins more often than this per second.
    pub max_loop_iterations_per_sec: u32,
    /// Hard cap on unlimited-duration recordings, in milliseconds.
    pub unlimited_ceiling_ms: u64,
}

impl Default for WatchdogLimits {
    fn default() -> Self {
        Self {
            max_loop_iterations_per_sec: 2000,
            unlimited_ceiling_ms: 60_000,
        }
    }
}

/// Which audio sources are enabled for a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSources {
    None,
    System,
    Microphone,
    Both,
}

/// The concrete muxer initialization variant, resolved from which sources
/// actually came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
    /// Video, no audio track
    Video,
    /// Video plus one combined audio track
    VideoSingleAudio,
    /// Video plus separate system and microphone tracks
    VideoDualAudio,
    /// One audio track, no video
    AudioSingle,
    /// Separate system and microphone tracks, no video
    AudioDual,
}

impl RecordingMode {
    /// Resolve the muxer variant from the final (video, system, mic) tuple.
    /// Returns `None` when no source survived initialization.
    pub fn resolve(video: bool, system: bool, mic: bool) -> Option<Self> {
        match (video, system, mic) {
            (true, false, false) => Some(RecordingMode::Video),
            (true, true, false) | (true, false, true) => Some(RecordingMode::VideoSingleAudio),
            (true, true, true) => Some(RecordingMode::VideoDualAudio),
            (false, true, false) | (false, false, true) => Some(RecordingMode::AudioSingle),
            (false, true, true) => Some(RecordingMode::AudioDual),
            (false, false, false) => None,
        }
    }

    pub fn has_video(self) -> bool {
        matches!(
            self,
            RecordingMode::Video | RecordingMode::VideoSingleAudio | RecordingMode::VideoDualAudio
        )
    }

    pub fn has_audio(self) -> bool {
        !matches!(self, RecordingMode::Video)
    }

    /// Whether system and microphone audio land on separate tracks.
    pub fn dual_track(self) -> bool {
        matches!(
            self,
            RecordingMode::VideoDualAudio | RecordingMode::AudioDual
        )
    }
}

/// Immutable description of one recording. Built by the caller, validated
/// once, then read-only for the lifetime of the capture.
#[derive(Debug, Clone)]
pub struct CaptureParams {
    pub output_path: PathBuf,
    /// Target frame rate, 1..=120. Out-of-range values fall back to 30.
    pub fps: u32,
    /// Duration in whole seconds; 0 means unlimited (watchdog still applies).
    pub duration_secs: u32,
    pub enable_video: bool,
    pub enable_system_audio: bool,
    pub enable_microphone: bool,
    pub monitor_index: u32,
    pub cursor_enabled: bool,
    pub region: Option<Region>,
    pub watchdog: WatchdogLimits,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("capture.mp4"),
            fps: 30,
            duration_secs: 0,
            enable_video: false,
            enable_system_audio: false,
            enable_microphone: false,
            monitor_index: 0,
            cursor_enabled: true,
            region: None,
            watchdog: WatchdogLimits::default(),
        }
    }
}

impl CaptureParams {
    /// Validate and normalize the parameters in place.
    ///
    /// Out-of-range frame rates fall back to 30. When no source is enabled
    /// the recording defaults to video plus both audio sources. The output
    /// extension is forced to `.mp4`.
    pub fn validate_and_finalize(&mut self) -> Result<(), CaptureError> {
        if self.fps == 0 || self.fps > 120 {
            self.fps = 30;
        }

        if !self.enable_video && !self.enable_system_audio && !self.enable_microphone {
            self.enable_video = true;
            self.enable_system_audio = true;
            self.enable_microphone = true;
        }

        if let Some(region) = &self.region {
            if region.width == 0 || region.height == 0 {
                return Err(CaptureError::InvalidRegion(format!(
                    "{}x{} at ({}, {})",
                    region.width, region.height, region.x, region.y
                )));
            }
        }

        self.normalize_extension();
        Ok(())
    }

    /// Force the output extension to `.mp4` regardless of what was given.
    fn normalize_extension(&mut self) {
        let is_mp4 = self
            .output_path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("mp4"))
            .unwrap_or(false);
        if !is_mp4 {
            self.output_path.set_extension("mp4");
        }
    }

    pub fn audio_sources(&self) -> AudioSources {
        match (self.enable_system_audio, self.enable_microphone) {
            (true, true) => AudioSources::Both,
            (true, false) => AudioSources::System,
            (false, true) => AudioSources::Microphone,
            (false, false) => AudioSources::None,
        }
    }

    /// True when video is disabled and at least one audio source is enabled.
    pub fn audio_only_mode(&self) -> bool {
        !self.enable_video && (self.enable_system_audio || self.enable_microphone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_everything_when_nothing_selected() {
        let mut params = CaptureParams::default();
        params.validate_and_finalize().unwrap();
        assert!(params.enable_video);
        assert!(params.enable_system_audio);
        assert!(params.enable_microphone);
        assert_eq!(params.audio_sources(), AudioSources::Both);
        assert!(!params.audio_only_mode());
    }

    #[test]
    fn out_of_range_fps_falls_back_to_30() {
        let mut params = CaptureParams {
            fps: 500,
            enable_video: true,
            ..Default::default()
        };
        params.validate_and_finalize().unwrap();
        assert_eq!(params.fps, 30);

        params.fps = 0;
        params.validate_and_finalize().unwrap();
        assert_eq!(params.fps, 30);
    }

    #[test]
    fn valid_fps_is_preserved() {
        let mut params = CaptureParams {
            fps: 120,
            enable_video: true,
            ..Default::default()
        };
        params.validate_and_finalize().unwrap();
        assert_eq!(params.fps, 120);
    }

    #[test]
    fn extension_is_coerced_to_mp4() {
        for (input, expected) in [
            ("out.avi", "out.mp4"),
            ("out", "out.mp4"),
            ("out.MP4", "out.MP4"),
            ("out.mp4", "out.mp4"),
            ("dir/clip.mkv", "dir/clip.mp4"),
        ] {
            let mut params = CaptureParams {
                output_path: PathBuf::from(input),
                enable_video: true,
                ..Default::default()
            };
            params.validate_and_finalize().unwrap();
            assert_eq!(params.output_path, PathBuf::from(expected), "input {input}");
        }
    }

    #[test]
    fn audio_only_mode_detection() {
        let mut params = CaptureParams {
            enable_microphone: true,
            ..Default::default()
        };
        params.validate_and_finalize().unwrap();
        assert!(params.audio_only_mode());
        assert_eq!(params.audio_sources(), AudioSources::Microphone);

        params.enable_video = true;
        assert!(!params.audio_only_mode());
    }

    #[test]
    fn zero_sized_region_is_rejected() {
        let mut params = CaptureParams {
            enable_video: true,
            region: Some(Region {
                x: 0,
                y: 0,
                width: 0,
                height: 600,
            }),
            ..Default::default()
        };
        assert!(matches!(
            params.validate_and_finalize(),
            Err(CaptureError::InvalidRegion(_))
        ));
    }

    #[test]
    fn mode_resolution_covers_all_variants() {
        use RecordingMode::*;
        assert_eq!(RecordingMode::resolve(true, false, false), Some(Video));
        assert_eq!(
            RecordingMode::resolve(true, true, false),
            Some(VideoSingleAudio)
        );
        assert_eq!(
            RecordingMode::resolve(true, false, true),
            Some(VideoSingleAudio)
        );
        assert_eq!(RecordingMode::resolve(true, true, true), Some(VideoDualAudio));
        assert_eq!(RecordingMode::resolve(false, true, false), Some(AudioSingle));
        assert_eq!(RecordingMode::resolve(false, false, true), Some(AudioSingle));
        assert_eq!(RecordingMode::resolve(false, true, true), Some(AudioDual));
        assert_eq!(RecordingMode::resolve(false, false, false), None);
    }

    #[test]
    fn dual_track_flags() {
        assert!(RecordingMode::VideoDualAudio.dual_track());
        assert!(RecordingMode::AudioDual.dual_track());
        assert!(!RecordingMode::VideoSingleAudio.dual_track());
        assert!(!RecordingMode::AudioSingle.dual_track());
        assert!(!RecordingMode::Video.dual_track());
    }
}
