//! Hardware-free backend for tests and development machines.
//!
//! `MockAudioSource` paces packet production off the wall clock with the
//! same arithmetic the silence synthesizer uses, so a polling loop
//! receives sample-rate-accurate totals without any audio hardware.
//! `RecordingSink` stamps submissions with real stream clocks and records
//! them for inspection, which lets the full orchestrator run end-to-end in
//! CI on any platform.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::clock::StreamClock;
use crate::error::CaptureError;
use crate::params::{CaptureParams, RecordingMode};
use crate::silence::SilenceClock;
use crate::sink::MediaSink;
use crate::source::{AudioFormat, AudioPacket, AudioPoll, AudioSource, FramePoll, VideoSource};

/// Which container stream a submission went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    SystemAudio,
    MicAudio,
}

/// One recorded sink submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub stream: StreamKind,
    pub bytes: usize,
    pub frames: u32,
    pub timestamp: i64,
    pub duration: i64,
    pub elapsed_ms: u64,
}

/// Everything a [`RecordingSink`] observed, shared with the test through
/// the backend.
#[derive(Debug, Default)]
pub struct SinkLog {
    pub mode: Option<RecordingMode>,
    /// Sample rate the combined-track clock was opened with.
    pub combined_output_rate: Option<u32>,
    pub submissions: Vec<Submission>,
    pub finalize_calls: u32,
    pub cleanup_calls: u32,
}

impl SinkLog {
    pub fn count(&self, stream: StreamKind) -> usize {
        self.submissions.iter().filter(|s| s.stream == stream).count()
    }

    pub fn total_frames(&self, stream: StreamKind) -> u64 {
        self.submissions
            .iter()
            .filter(|s| s.stream == stream)
            .map(|s| s.frames as u64)
            .sum()
    }

    pub fn timestamps(&self, stream: StreamKind) -> Vec<i64> {
        self.submissions
            .iter()
            .filter(|s| s.stream == stream)
            .map(|s| s.timestamp)
            .collect()
    }
}

/// What the mock screen source observed.
#[derive(Debug, Default)]
pub struct ScreenLog {
    pub polls: u32,
    pub last_dual_track: Option<bool>,
}

/// Deterministic video source: every poll yields a fresh BGRA frame of the
/// configured geometry, except every `pending_every`-th poll when set.
pub struct MockScreenSource {
    width: u32,
    height: u32,
    capturing: bool,
    cleanup_calls: u32,
    pending_every: Option<u32>,
    access_lost_after: Option<u32>,
    log: Arc<Mutex<ScreenLog>>,
}

impl MockScreenSource {
    pub fn new(width: u32, height: u32, log: Arc<Mutex<ScreenLog>>) -> Self {
        Self {
            width,
            height,
            capturing: false,
            cleanup_calls: 0,
            pending_every: None,
            access_lost_after: None,
            log,
        }
    }

    /// Make every `n`-th poll report no new frame.
    pub fn with_pending_every(mut self, n: u32) -> Self {
        self.pending_every = Some(n);
        self
    }

    /// Report access lost after `n` successful polls.
    pub fn with_access_lost_after(mut self, n: u32) -> Self {
        self.access_lost_after = Some(n);
        self
    }

    pub fn cleanup_calls(&self) -> u32 {
        self.cleanup_calls
    }
}

impl VideoSource for MockScreenSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        self.capturing = true;
        Ok(())
    }

    fn poll_frame(&mut self, dual_track: bool) -> Result<FramePoll, CaptureError> {
        if !self.capturing {
            return Err(CaptureError::FrameFailed {
                detail: "screen source not capturing".to_string(),
            });
        }
        let mut log = self.log.lock().unwrap();
        log.polls += 1;
        log.last_dual_track = Some(dual_track);
        let polls = log.polls;
        drop(log);

        if let Some(limit) = self.access_lost_after {
            if polls > limit {
                return Err(CaptureError::AccessLost);
            }
        }
        if let Some(n) = self.pending_every {
            if polls % n == 0 {
                return Ok(FramePoll::Pending);
            }
        }

        let size = (self.width * self.height * 4) as usize;
        Ok(FramePoll::Frame(vec![(polls % 251) as u8; size]))
    }

    fn stop(&mut self) {
        self.capturing = false;
    }

    fn cleanup(&mut self) {
        if self.cleanup_calls == 0 {
            self.capturing = false;
        }
        self.cleanup_calls += 1;
    }
}

/// Audio source pacing packets off the wall clock.
///
/// From `start()` onward it owes `sample_rate × elapsed / 1000` frames and
/// pays the deficit out in chunks of at most 50 ms, exactly like a shared
/// mode capture ring drained by a polling loop.
pub struct MockAudioSource {
    format: AudioFormat,
    pacer: SilenceClock,
    started: Option<Instant>,
    buf: Vec<u8>,
    capturing: bool,
    cleanup_calls: u32,
    fail_start: bool,
    min_packet_ms: u64,
}

impl MockAudioSource {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            pacer: SilenceClock::new(format.sample_rate),
            started: None,
            buf: Vec::new(),
            capturing: false,
            cleanup_calls: 0,
            fail_start: false,
            // Accumulate like a real capture ring: no packet until a full
            // chunk's worth of frames is owed.
            min_packet_ms: 50,
        }
    }

    /// Make `start()` fail, to exercise downgrade paths.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Emit packets as soon as any frames are owed instead of waiting for
    /// a full chunk.
    pub fn with_min_packet_ms(mut self, ms: u64) -> Self {
        self.min_packet_ms = ms;
        self
    }

    pub fn cleanup_calls(&self) -> u32 {
        self.cleanup_calls
    }
}

impl AudioSource for MockAudioSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.fail_start {
            return Err(CaptureError::InitFailed {
                component: "mock audio",
                detail: "start refused".to_string(),
            });
        }
        self.capturing = true;
        self.started = Some(Instant::now());
        self.pacer.reset();
        // Establish the pacing epoch at the moment capture starts.
        self.pacer.take(0);
        Ok(())
    }

    fn poll(&mut self) -> Result<AudioPoll<'_>, CaptureError> {
        if !self.capturing {
            return Ok(AudioPoll::Idle);
        }
        let now_ms = self
            .started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let min_frames = self.format.sample_rate as u64 * self.min_packet_ms / 1000;
        if self.pacer.deficit(now_ms) < min_frames.max(1) {
            return Ok(AudioPoll::Idle);
        }
        let frames = self.pacer.take(now_ms);
        if frames == 0 {
            return Ok(AudioPoll::Idle);
        }

        let bytes = frames as usize * self.format.block_align() as usize;
        if self.buf.len() < bytes {
            self.buf.resize(bytes, 0);
        }
        Ok(AudioPoll::Packet(AudioPacket {
            data: &self.buf[..bytes],
            frames,
            synthesized: false,
        }))
    }

    fn release(&mut self, _frames: u32) {}

    fn stop(&mut self) {
        self.capturing = false;
    }

    fn cleanup(&mut self) {
        if self.cleanup_calls == 0 {
            self.capturing = false;
            self.buf = Vec::new();
        }
        self.cleanup_calls += 1;
    }
}

/// Sink that stamps submissions with real stream clocks and records them.
pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
    video: Option<StreamClock>,
    audio: Option<StreamClock>,
    system: Option<StreamClock>,
    mic: Option<StreamClock>,
    finalized: bool,
    cleaned: bool,
    fail_video_submissions: bool,
}

impl RecordingSink {
    pub fn open(
        log: Arc<Mutex<SinkLog>>,
        mode: RecordingMode,
        fps: u32,
        audio_format: Option<AudioFormat>,
        fail_video_submissions: bool,
    ) -> Result<Self, CaptureError> {
        let source_rate = audio_format.map(|f| f.sample_rate);
        let require_rate = || {
            source_rate.ok_or_else(|| CaptureError::InitFailed {
                component: "mock sink",
                detail: "audio-bearing mode without an audio format".to_string(),
            })
        };

        let mut sink = Self {
            log,
            video: None,
            audio: None,
            system: None,
            mic: None,
            finalized: false,
            cleaned: false,
            fail_video_submissions,
        };

        if mode.has_video() {
            sink.video = Some(StreamClock::new(fps));
        }
        match mode {
            RecordingMode::Video => {}
            // The combined video+audio variant declares 44.1 kHz on its
            // output type regardless of the mix format; its clock follows.
            RecordingMode::VideoSingleAudio => {
                require_rate()?;
                sink.audio = Some(StreamClock::new(44_100));
            }
            RecordingMode::AudioSingle => {
                sink.audio = Some(StreamClock::new(require_rate()?));
            }
            RecordingMode::VideoDualAudio | RecordingMode::AudioDual => {
                let rate = require_rate()?;
                sink.system = Some(StreamClock::new(rate));
                sink.mic = Some(StreamClock::new(rate));
            }
        }

        let mut log = sink.log.lock().unwrap();
        log.mode = Some(mode);
        log.combined_output_rate = sink.audio.as_ref().map(|c| c.units_per_second());
        drop(log);

        Ok(sink)
    }

    fn record(
        &mut self,
        clock_stream: StreamKind,
        data_len: usize,
        frames: u32,
        elapsed_ms: u64,
    ) {
        let clock = match clock_stream {
            StreamKind::Video => self.video.as_mut(),
            StreamKind::Audio => self.audio.as_mut(),
            StreamKind::SystemAudio => self.system.as_mut(),
            StreamKind::MicAudio => self.mic.as_mut(),
        }
        .expect("stream not configured");

        let submission = Submission {
            stream: clock_stream,
            bytes: data_len,
            frames,
            timestamp: clock.timestamp(),
            duration: clock.duration_of(frames),
            elapsed_ms,
        };
        clock.advance(frames);
        self.log.lock().unwrap().submissions.push(submission);
    }
}

impl MediaSink for RecordingSink {
    fn add_video_frame(&mut self, data: &[u8], elapsed_ms: u64) -> Result<(), CaptureError> {
        if self.video.is_none() {
            return Ok(());
        }
        if self.fail_video_submissions {
            return Err(CaptureError::SubmitFailed {
                stream: "video",
                detail: "injected failure".to_string(),
            });
        }
        self.record(StreamKind::Video, data.len(), 1, elapsed_ms);
        Ok(())
    }

    fn add_audio_frame(
        &mut self,
        data: &[u8],
        frames: u32,
        elapsed_ms: u64,
    ) -> Result<(), CaptureError> {
        if self.audio.is_none() {
            // No combined track configured; silently ignored.
            return Ok(());
        }
        self.record(StreamKind::Audio, data.len(), frames, elapsed_ms);
        Ok(())
    }

    fn add_system_audio_frame(
        &mut self,
        data: &[u8],
        frames: u32,
        elapsed_ms: u64,
    ) -> Result<(), CaptureError> {
        if self.system.is_none() {
            return Err(CaptureError::SubmitFailed {
                stream: "system audio",
                detail: "dual-track not active".to_string(),
            });
        }
        self.record(StreamKind::SystemAudio, data.len(), frames, elapsed_ms);
        Ok(())
    }

    fn add_mic_audio_frame(
        &mut self,
        data: &[u8],
        frames: u32,
        elapsed_ms: u64,
    ) -> Result<(), CaptureError> {
        if self.mic.is_none() {
            return Err(CaptureError::SubmitFailed {
                stream: "microphone audio",
                detail: "dual-track not active".to_string(),
            });
        }
        self.record(StreamKind::MicAudio, data.len(), frames, elapsed_ms);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), CaptureError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.log.lock().unwrap().finalize_calls += 1;
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.video = None;
        self.audio = None;
        self.system = None;
        self.mic = None;
        self.log.lock().unwrap().cleanup_calls += 1;
    }
}

/// Backend wiring the mock components together, with failure injection.
pub struct MockBackend {
    pub width: u32,
    pub height: u32,
    pub screen_fails: bool,
    pub system_fails: bool,
    pub mic_fails: bool,
    pub mic_start_fails: bool,
    pub fail_video_submissions: bool,
    pub screen_pending_every: Option<u32>,
    pub screen_access_lost_after: Option<u32>,
    pub system_format: AudioFormat,
    pub mic_format: AudioFormat,
    sink_log: Arc<Mutex<SinkLog>>,
    screen_log: Arc<Mutex<ScreenLog>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        let stereo_float = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 32,
        };
        Self {
            width: 320,
            height: 180,
            screen_fails: false,
            system_fails: false,
            mic_fails: false,
            mic_start_fails: false,
            fail_video_submissions: false,
            screen_pending_every: None,
            screen_access_lost_after: None,
            system_format: stereo_float,
            mic_format: stereo_float,
            sink_log: Arc::default(),
            screen_log: Arc::default(),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink_log(&self) -> Arc<Mutex<SinkLog>> {
        Arc::clone(&self.sink_log)
    }

    pub fn screen_log(&self) -> Arc<Mutex<ScreenLog>> {
        Arc::clone(&self.screen_log)
    }
}

impl crate::backend::CaptureBackend for MockBackend {
    type Video = MockScreenSource;
    type Audio = MockAudioSource;
    type Sink = RecordingSink;

    fn open_screen(&mut self, _params: &CaptureParams) -> Result<Self::Video, CaptureError> {
        if self.screen_fails {
            return Err(CaptureError::InitFailed {
                component: "screen capture",
                detail: "injected failure".to_string(),
            });
        }
        let mut source =
            MockScreenSource::new(self.width, self.height, Arc::clone(&self.screen_log));
        if let Some(n) = self.screen_pending_every {
            source = source.with_pending_every(n);
        }
        if let Some(n) = self.screen_access_lost_after {
            source = source.with_access_lost_after(n);
        }
        Ok(source)
    }

    fn open_system_audio(&mut self) -> Result<Self::Audio, CaptureError> {
        if self.system_fails {
            return Err(CaptureError::InitFailed {
                component: "system audio",
                detail: "injected failure".to_string(),
            });
        }
        Ok(MockAudioSource::new(self.system_format))
    }

    fn open_microphone(&mut self) -> Result<Self::Audio, CaptureError> {
        if self.mic_fails {
            return Err(CaptureError::InitFailed {
                component: "microphone",
                detail: "injected failure".to_string(),
            });
        }
        let source = MockAudioSource::new(self.mic_format);
        Ok(if self.mic_start_fails {
            source.failing_start()
        } else {
            source
        })
    }

    fn open_sink(
        &mut self,
        params: &CaptureParams,
        mode: RecordingMode,
        _dimensions: Option<(u32, u32)>,
        audio_format: Option<AudioFormat>,
    ) -> Result<Self::Sink, CaptureError> {
        RecordingSink::open(
            Arc::clone(&self.sink_log),
            mode,
            params.fps,
            audio_format,
            self.fail_video_submissions,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn mono_16k() -> AudioFormat {
        AudioFormat {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    #[test]
    fn paced_source_tracks_wall_time() {
        let mut source = MockAudioSource::new(mono_16k());
        source.start().unwrap();
        thread::sleep(Duration::from_millis(120));

        let mut total = 0u64;
        loop {
            match source.poll().unwrap() {
                AudioPoll::Packet(p) => {
                    assert!(p.frames as u64 <= 16_000 * 50 / 1000);
                    assert_eq!(p.data.len(), p.frames as usize * 2);
                    total += p.frames as u64;
                    let frames = p.frames;
                    source.release(frames);
                }
                AudioPoll::Idle => break,
            }
        }
        // ~120 ms of mono audio, within scheduling jitter.
        assert!((1600..=3200).contains(&total), "got {total}");
    }

    #[test]
    fn unstarted_source_is_idle() {
        let mut source = MockAudioSource::new(mono_16k());
        assert!(matches!(source.poll().unwrap(), AudioPoll::Idle));
    }

    #[test]
    fn sink_ignores_combined_audio_without_a_track() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let mut sink = RecordingSink::open(Arc::clone(&log), RecordingMode::Video, 30, None, false)
            .unwrap();
        sink.add_audio_frame(&[0u8; 16], 4, 0).unwrap();
        assert!(log.lock().unwrap().submissions.is_empty());
    }

    #[test]
    fn sink_rejects_dual_routes_in_single_mode() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let mut sink = RecordingSink::open(
            Arc::clone(&log),
            RecordingMode::AudioSingle,
            30,
            Some(mono_16k()),
            false,
        )
        .unwrap();
        assert!(sink.add_system_audio_frame(&[0u8; 4], 2, 0).is_err());
        assert!(sink.add_mic_audio_frame(&[0u8; 4], 2, 0).is_err());
    }

    #[test]
    fn combined_variant_uses_44100_clock() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let fmt = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 32,
        };
        let _sink = RecordingSink::open(
            Arc::clone(&log),
            RecordingMode::VideoSingleAudio,
            30,
            Some(fmt),
            false,
        )
        .unwrap();
        assert_eq!(log.lock().unwrap().combined_output_rate, Some(44_100));

        let log2 = Arc::new(Mutex::new(SinkLog::default()));
        let _sink =
            RecordingSink::open(Arc::clone(&log2), RecordingMode::AudioSingle, 30, Some(fmt), false)
                .unwrap();
        assert_eq!(log2.lock().unwrap().combined_output_rate, Some(48_000));
    }

    #[test]
    fn sink_finalize_and_cleanup_are_idempotent() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let mut sink =
            RecordingSink::open(Arc::clone(&log), RecordingMode::Video, 30, None, false).unwrap();
        sink.finalize().unwrap();
        sink.finalize().unwrap();
        sink.cleanup();
        sink.cleanup();
        let log = log.lock().unwrap();
        assert_eq!(log.finalize_calls, 1);
        assert_eq!(log.cleanup_calls, 1);
    }

    #[test]
    fn source_cleanup_is_idempotent() {
        let mut audio = MockAudioSource::new(mono_16k());
        audio.cleanup();
        audio.cleanup();
        assert_eq!(audio.cleanup_calls(), 2);

        let mut screen = MockScreenSource::new(4, 4, Arc::default());
        screen.cleanup();
        screen.cleanup();
        assert_eq!(screen.cleanup_calls(), 2);
    }
}
