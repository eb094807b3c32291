//! End-to-end recordings against the mock backend.
//!
//! Each scenario runs the real orchestrator (init, probe, capture loop,
//! teardown) with hardware-free sources and a sink that records every
//! submission, then checks counts, timestamps, and stop reasons.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use deskmux_core::engine::Reporter;
use deskmux_core::mock::{MockBackend, StreamKind};
use deskmux_core::{run, CancelToken, CaptureParams, RecordingMode, StopReason, WatchdogKind};

#[derive(Default)]
struct TestReporter {
    statuses: Vec<String>,
}

impl Reporter for TestReporter {
    fn status(&mut self, message: &str) {
        self.statuses.push(message.to_string());
    }

    fn progress(&mut self, _frames: u64, _elapsed_ms: u64) {}
}

fn params(video: bool, system: bool, mic: bool) -> CaptureParams {
    let mut params = CaptureParams {
        output_path: PathBuf::from("scenario.mp4"),
        enable_video: video,
        enable_system_audio: system,
        enable_microphone: mic,
        ..Default::default()
    };
    params.validate_and_finalize().unwrap();
    params
}

#[test]
fn video_only_two_seconds_at_30fps() {
    let mut backend = MockBackend::new();
    let log = backend.sink_log();
    let mut reporter = TestReporter::default();

    let mut p = params(true, false, false);
    p.duration_secs = 2;
    p.fps = 30;

    let stats = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap();

    assert_eq!(stats.stop_reason, StopReason::DurationElapsed);
    assert!(!stats.audio_enabled);
    // Off-by-one margin: never more than fps * duration + fps.
    assert!(stats.total_frames <= 30 * 2 + 30);
    assert!(stats.total_frames >= 45, "got {}", stats.total_frames);

    let log = log.lock().unwrap();
    assert_eq!(log.mode, Some(RecordingMode::Video));
    assert_eq!(log.count(StreamKind::Video) as u64, stats.total_frames);
    assert_eq!(log.count(StreamKind::Audio), 0);
    assert_eq!(log.count(StreamKind::SystemAudio), 0);
    assert_eq!(log.count(StreamKind::MicAudio), 0);

    // Timestamps derive from the frame counter and the target rate alone:
    // 0, 333_333, 666_666, ...
    for (n, submission) in log
        .submissions
        .iter()
        .filter(|s| s.stream == StreamKind::Video)
        .enumerate()
    {
        assert_eq!(submission.timestamp, (n as u64 * 10_000_000 / 30) as i64);
        assert_eq!(submission.duration, 333_333);
    }

    assert_eq!(log.finalize_calls, 1);
    assert_eq!(log.cleanup_calls, 1);
}

#[test]
fn video_plus_dual_audio_one_second_at_60fps() {
    let mut backend = MockBackend::new();
    let log = backend.sink_log();
    let screen_log = backend.screen_log();
    let mut reporter = TestReporter::default();

    let mut p = params(true, true, true);
    p.duration_secs = 1;
    p.fps = 60;

    let stats = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap();

    assert_eq!(stats.stop_reason, StopReason::DurationElapsed);
    assert!(stats.audio_enabled);
    assert_eq!(stats.audio_format.unwrap().sample_rate, 48_000);

    let log = log.lock().unwrap();
    assert_eq!(log.mode, Some(RecordingMode::VideoDualAudio));
    assert!(log.count(StreamKind::Video) > 0);
    assert_eq!(log.count(StreamKind::Audio), 0);

    // Frame-count timestamps at the target rate: k * 166_666 ticks.
    for (n, ts) in log.timestamps(StreamKind::Video).iter().enumerate() {
        assert_eq!(*ts, (n as u64 * 10_000_000 / 60) as i64);
    }

    // Both tracks carry roughly one second of 48 kHz audio on independent
    // clocks.
    let system_frames = log.total_frames(StreamKind::SystemAudio);
    let mic_frames = log.total_frames(StreamKind::MicAudio);
    assert!(
        (43_000..=50_000).contains(&system_frames),
        "system {system_frames}"
    );
    assert!((43_000..=50_000).contains(&mic_frames), "mic {mic_frames}");
    let drift = system_frames.abs_diff(mic_frames);
    assert!(drift <= 4_800, "tracks drifted {drift} frames apart");

    for stream in [StreamKind::SystemAudio, StreamKind::MicAudio] {
        let timestamps = log.timestamps(stream);
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(timestamps[0], 0);
    }

    // Dual-track frame acquisition asks for unflipped rows.
    assert_eq!(screen_log.lock().unwrap().last_dual_track, Some(true));
}

#[test]
fn audio_only_microphone_half_second() {
    let mut backend = MockBackend::new();
    backend.mic_format = deskmux_core::AudioFormat {
        sample_rate: 44_100,
        channels: 1,
        bits_per_sample: 16,
    };
    let log = backend.sink_log();
    let mut reporter = TestReporter::default();

    let mut p = params(false, false, true);
    p.output_path = PathBuf::from("voice.wav");
    p.validate_and_finalize().unwrap();
    assert_eq!(p.output_path, PathBuf::from("voice.mp4"));

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        canceller.cancel();
    });

    let stats = run(&mut backend, &p, &mut reporter, &cancel).unwrap();
    stopper.join().unwrap();

    assert_eq!(stats.stop_reason, StopReason::Cancelled);
    assert!(stats.audio_enabled);
    assert_eq!(stats.total_frames, 0);

    let log = log.lock().unwrap();
    assert_eq!(log.mode, Some(RecordingMode::AudioSingle));
    // Audio-only single track declares the source rate on its output type.
    assert_eq!(log.combined_output_rate, Some(44_100));
    assert_eq!(log.count(StreamKind::Video), 0);

    // ~500 ms of 44.1 kHz mono in ~50 ms buffers.
    let total = log.total_frames(StreamKind::Audio);
    assert!((19_000..=24_500).contains(&total), "got {total}");
    let buffers = log.count(StreamKind::Audio);
    assert!((7..=14).contains(&buffers), "got {buffers} buffers");
}

#[test]
fn absent_microphone_downgrades_to_video_only() {
    let mut backend = MockBackend::new();
    backend.mic_fails = true;
    let log = backend.sink_log();
    let mut reporter = TestReporter::default();

    let mut p = params(true, false, true);
    p.duration_secs = 1;

    let stats = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap();

    assert!(!stats.audio_enabled);
    assert!(stats.audio_format.is_none());
    assert_eq!(stats.downgraded, vec!["microphone"]);
    assert!(stats.total_frames > 0);
    assert!(reporter
        .statuses
        .iter()
        .any(|s| s.contains("Failed to initialize microphone")));

    let log = log.lock().unwrap();
    assert_eq!(log.mode, Some(RecordingMode::Video));
    assert_eq!(log.count(StreamKind::Audio), 0);
}

#[test]
fn cancellation_stops_a_long_recording_promptly() {
    let mut backend = MockBackend::new();
    let log = backend.sink_log();
    let mut reporter = TestReporter::default();

    let mut p = params(true, false, false);
    p.duration_secs = 10;

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        canceller.cancel();
    });

    let stats = run(&mut backend, &p, &mut reporter, &cancel).unwrap();
    stopper.join().unwrap();

    assert_eq!(stats.stop_reason, StopReason::Cancelled);
    // The loop observes the flag within one iteration.
    assert!(
        (450..=800).contains(&stats.duration_ms),
        "stopped after {} ms",
        stats.duration_ms
    );
    // Roughly half a second of frames, not ten seconds' worth.
    assert!(stats.total_frames <= 30, "got {}", stats.total_frames);

    let log = log.lock().unwrap();
    assert_eq!(log.finalize_calls, 1);
    assert_eq!(log.cleanup_calls, 1);
}

#[test]
fn unlimited_recording_hits_the_watchdog_ceiling() {
    let mut backend = MockBackend::new();
    let log = backend.sink_log();
    let mut reporter = TestReporter::default();

    let mut p = params(true, false, false);
    p.duration_secs = 0;
    p.watchdog.unlimited_ceiling_ms = 800;

    let stats = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap();

    assert_eq!(
        stats.stop_reason,
        StopReason::Watchdog(WatchdogKind::UnlimitedCeiling)
    );
    // Ceiling checks happen on one-second boundaries.
    assert!(
        (800..=2_000).contains(&stats.duration_ms),
        "stopped after {} ms",
        stats.duration_ms
    );
    assert!(reporter.statuses.iter().any(|s| s.contains("EMERGENCY")));

    // The container is still finalized into a well-formed file.
    let log = log.lock().unwrap();
    assert_eq!(log.finalize_calls, 1);
    assert_eq!(log.cleanup_calls, 1);
}

#[test]
fn combined_track_declares_44100_even_for_48k_input() {
    let mut backend = MockBackend::new();
    let log = backend.sink_log();
    let mut reporter = TestReporter::default();

    let mut p = params(true, false, true);
    p.duration_secs = 1;

    let stats = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap();
    assert!(stats.audio_enabled);
    assert_eq!(stats.audio_format.unwrap().sample_rate, 48_000);

    let log = log.lock().unwrap();
    assert_eq!(log.mode, Some(RecordingMode::VideoSingleAudio));
    assert_eq!(log.combined_output_rate, Some(44_100));

    // Timestamps follow the declared 44.1 kHz output rate, not the 48 kHz
    // input rate.
    let mut emitted = 0u64;
    for submission in log
        .submissions
        .iter()
        .filter(|s| s.stream == StreamKind::Audio)
    {
        assert_eq!(submission.timestamp, (emitted * 10_000_000 / 44_100) as i64);
        emitted += submission.frames as u64;
    }
    assert!(emitted > 0);
}

#[test]
fn rejected_video_submissions_do_not_kill_the_recording() {
    let mut backend = MockBackend::new();
    backend.fail_video_submissions = true;
    let log = backend.sink_log();
    let mut reporter = TestReporter::default();

    let mut p = params(true, false, false);
    p.duration_secs = 1;

    let stats = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap();

    assert_eq!(stats.stop_reason, StopReason::DurationElapsed);
    assert_eq!(stats.total_frames, 0);
    assert_eq!(log.lock().unwrap().finalize_calls, 1);
}

#[test]
fn access_lost_finalizes_a_partial_recording() {
    let mut backend = MockBackend::new();
    backend.screen_access_lost_after = Some(5);
    let log = backend.sink_log();
    let mut reporter = TestReporter::default();

    let mut p = params(true, false, false);
    p.duration_secs = 5;

    let stats = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap();

    assert_eq!(stats.stop_reason, StopReason::AccessLost);
    assert_eq!(stats.total_frames, 5);
    assert!(stats.duration_ms < 2_000);
    assert_eq!(log.lock().unwrap().finalize_calls, 1);
}

#[test]
fn screen_init_failure_is_fatal_for_video_recordings() {
    let mut backend = MockBackend::new();
    backend.screen_fails = true;
    let mut reporter = TestReporter::default();

    let p = params(true, false, false);
    let err = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap_err();
    assert!(err.to_string().contains("screen capture"));
    assert_eq!(err.stats.total_frames, 0);
}

#[test]
fn audio_only_with_no_working_source_is_fatal() {
    let mut backend = MockBackend::new();
    backend.mic_fails = true;
    backend.system_fails = true;
    let mut reporter = TestReporter::default();

    let p = params(false, true, true);
    let err = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap_err();
    assert!(err.to_string().contains("audio"));
    assert!(reporter
        .statuses
        .iter()
        .any(|s| s.contains("Audio-only mode requires working audio capture")));
}

#[test]
fn pending_frames_count_as_failed_without_advancing_the_clock() {
    let mut backend = MockBackend::new();
    backend.screen_pending_every = Some(4);
    let mut reporter = TestReporter::default();

    let mut p = params(true, false, false);
    p.duration_secs = 1;

    let stats = run(&mut backend, &p, &mut reporter, &CancelToken::new()).unwrap();
    assert!(stats.failed_frames > 0);
    // Retried slots still land close to the target frame count.
    assert!(stats.total_frames >= 20, "got {}", stats.total_frames);
    assert!(stats.total_frames <= 30 + 30);
}
