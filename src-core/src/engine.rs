//! Capture orchestrator.
//!
//! One thread owns the whole pipeline: it paces video acquisition to the
//! target frame rate, polls the audio sources continuously, forwards
//! buffers to the muxer, and gates on duration, cancellation, and the
//! defensive watchdogs. All source I/O is cooperative and non-blocking;
//! the only suspension point is a short sleep at the bottom of each
//! iteration.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::CaptureBackend;
use crate::cancel::CancelToken;
use crate::error::{CaptureError, RecordingError};
use crate::params::{AudioSources, CaptureParams, RecordingMode};
use crate::sink::MediaSink;
use crate::source::{AudioPoll, AudioSource, FramePoll, VideoSource};

/// Audio probe: up to five polls, 100 ms apart.
const PROBE_ATTEMPTS: u32 = 5;
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive empty audio polls tolerated in audio-only mode.
const MAX_AUDIO_FAILURES: u32 = 1000;

/// Why the capture loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The requested duration elapsed.
    DurationElapsed,
    /// The cancellation flag was set.
    Cancelled,
    /// A defensive guard tripped; the recording was finalized early.
    Watchdog(WatchdogKind),
    /// The compositor invalidated the duplication stream.
    AccessLost,
    /// Audio-only capture produced nothing for too long.
    AudioStalled,
    /// The recording never reached the capture loop.
    #[default]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogKind {
    /// The loop spun faster than the per-second iteration limit.
    LoopRunaway,
    /// An unlimited-duration recording hit the hard ceiling.
    UnlimitedCeiling,
}

/// Statistics accumulated over one recording.
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub total_frames: u64,
    pub failed_frames: u64,
    pub duration_ms: u64,
    pub audio_enabled: bool,
    pub audio_format: Option<crate::source::AudioFormat>,
    /// Components that were requested but failed to initialize.
    pub downgraded: Vec<&'static str>,
    pub stop_reason: StopReason,
}

/// Status and progress sinks injected into [`run`].
///
/// Status receives human-readable state transitions; progress is emitted
/// once per captured frame and is expected to rate-limit itself.
pub trait Reporter {
    fn status(&mut self, message: &str);
    fn progress(&mut self, frames: u64, elapsed_ms: u64);
}

/// Default reporter printing to the terminal.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn status(&mut self, message: &str) {
        println!("{}", message);
    }

    fn progress(&mut self, frames: u64, elapsed_ms: u64) {
        if frames % 30 == 0 {
            println!("Captured {} frames in {} ms", frames, elapsed_ms);
        }
    }
}

enum AudioRoute {
    Combined,
    System,
    Microphone,
}

impl AudioRoute {
    fn stream_name(&self) -> &'static str {
        match self {
            AudioRoute::Combined => "audio",
            AudioRoute::System => "system audio",
            AudioRoute::Microphone => "microphone audio",
        }
    }
}

/// Run one recording to completion.
///
/// Owns init, the capture loop, and teardown; every resource acquired
/// during init is released on every exit path. Cancellation and watchdog
/// stops finalize the container normally and report success with partial
/// stats; init failures and finalize failures surface as
/// [`RecordingError`] carrying whatever was accumulated.
pub fn run<B: CaptureBackend>(
    backend: &mut B,
    params: &CaptureParams,
    reporter: &mut dyn Reporter,
    cancel: &CancelToken,
) -> Result<CaptureStats, RecordingError> {
    let mut stats = CaptureStats::default();
    reporter.status("Initializing capture...");

    // Screen first: required unless the recording is audio-only.
    let mut screen = if params.audio_only_mode() {
        None
    } else {
        match backend.open_screen(params) {
            Ok(source) => {
                let (w, h) = source.dimensions();
                info!(width = w, height = h, "screen capture initialized");
                Some(source)
            }
            Err(err) => {
                reporter.status("Error: Failed to initialize screen capture");
                return Err(RecordingError::new(err, stats));
            }
        }
    };

    let sources = params.audio_sources();
    let want_mic = matches!(sources, AudioSources::Microphone | AudioSources::Both);
    let want_system = matches!(sources, AudioSources::System | AudioSources::Both);

    let mut mic = if want_mic {
        match backend.open_microphone() {
            Ok(source) => {
                reporter.status("Microphone initialized successfully");
                Some(source)
            }
            Err(err) => {
                warn!(error = %err, "{}", CaptureError::Downgraded { component: "microphone" });
                reporter.status("Warning: Failed to initialize microphone");
                stats.downgraded.push("microphone");
                None
            }
        }
    } else {
        None
    };

    let mut system = if want_system {
        match backend.open_system_audio() {
            Ok(source) => {
                reporter.status("System audio initialized successfully");
                Some(source)
            }
            Err(err) => {
                warn!(error = %err, "{}", CaptureError::Downgraded { component: "system audio" });
                reporter.status("Warning: Failed to initialize system audio");
                stats.downgraded.push("system audio");
                None
            }
        }
    } else {
        None
    };

    // The recording's audio format is whichever source came up; the
    // microphone wins when both did.
    let adopted_format = mic
        .as_ref()
        .map(|s| s.format())
        .or_else(|| system.as_ref().map(|s| s.format()));

    if (want_mic || want_system) && mic.is_none() && system.is_none() {
        if params.audio_only_mode() {
            reporter.status("Error: Audio-only mode requires working audio capture");
            return Err(RecordingError::new(
                CaptureError::InitFailed {
                    component: "audio capture",
                    detail: "no audio source available in audio-only mode".to_string(),
                },
                stats,
            ));
        }
        reporter.status("Warning: No audio sources available, continuing with video-only");
    }

    // Probe phase: confirm the surviving sources actually deliver before
    // committing to an audio-bearing muxer variant. Skipped in audio-only
    // mode, where sources start directly and stay started.
    if (mic.is_some() || system.is_some()) && !params.audio_only_mode() {
        reporter.status("Testing audio capture availability...");
        let mut probe_ok = false;

        if let Some(source) = mic.as_mut() {
            if source.start().is_ok() {
                if probe_source(source) {
                    probe_ok = true;
                    reporter.status("Microphone test successful");
                }
                source.stop();
            }
        }

        if let Some(source) = system.as_mut() {
            if source.start().is_ok() {
                if probe_source(source) {
                    reporter.status("System audio test successful");
                } else {
                    // A live render endpoint may legitimately be idle.
                    reporter.status("System audio capture ready (no audio currently playing)");
                }
                probe_ok = true;
                source.stop();
            }
        }

        if !probe_ok {
            reporter.status("Warning: No audio data detected, continuing with video-only");
            if let Some(mut source) = mic.take() {
                source.cleanup();
            }
            if let Some(mut source) = system.take() {
                source.cleanup();
            }
        }
    } else if (mic.is_some() || system.is_some()) && params.audio_only_mode() {
        reporter.status("Audio-only mode: starting audio capture directly");
        let mut start_failed = false;
        if let Some(source) = mic.as_mut() {
            if source.start().is_err() {
                reporter.status("Error: Failed to start microphone capture for audio-only mode");
                start_failed = true;
            }
        }
        if let Some(source) = system.as_mut() {
            if source.start().is_err() {
                reporter.status("Error: Failed to start system audio capture for audio-only mode");
                start_failed = true;
            }
        }
        if start_failed {
            reporter.status("Error: Audio-only mode requires working audio capture");
            cleanup_sources(&mut screen, &mut mic, &mut system);
            return Err(RecordingError::new(
                CaptureError::InitFailed {
                    component: "audio capture",
                    detail: "audio source refused to start".to_string(),
                },
                stats,
            ));
        }
    }

    // Resolve the muxer variant from what actually survived.
    let mode = match RecordingMode::resolve(screen.is_some(), system.is_some(), mic.is_some()) {
        Some(mode) => mode,
        None => {
            return Err(RecordingError::new(
                CaptureError::InitFailed {
                    component: "capture",
                    detail: "no source survived initialization".to_string(),
                },
                stats,
            ));
        }
    };
    let audio_enabled = mode.has_audio();
    stats.audio_enabled = audio_enabled;
    stats.audio_format = if audio_enabled { adopted_format } else { None };
    debug!(?mode, "recording mode resolved");

    let dimensions = screen.as_ref().map(|s| s.dimensions());
    let mut sink = match backend.open_sink(params, mode, dimensions, stats.audio_format) {
        Ok(sink) => sink,
        Err(err) => {
            reporter.status("Error: Failed to initialize muxer");
            cleanup_sources(&mut screen, &mut mic, &mut system);
            return Err(RecordingError::new(err, stats));
        }
    };

    if let Some(source) = screen.as_mut() {
        if let Err(err) = source.start() {
            reporter.status("Error: Failed to start screen capture");
            cleanup_sources(&mut screen, &mut mic, &mut system);
            sink.cleanup();
            return Err(RecordingError::new(err, stats));
        }
    }

    // (Re)start the audio sources for the recording proper. A source that
    // refuses to restart leaves its track empty rather than killing the
    // recording.
    if !params.audio_only_mode() {
        let mic_restart_failed = mic.as_mut().map(|s| s.start().is_err()).unwrap_or(false);
        if mic_restart_failed {
            reporter.status("Warning: Failed to restart microphone capture");
            if let Some(mut source) = mic.take() {
                source.cleanup();
            }
        }
        let system_restart_failed = system.as_mut().map(|s| s.start().is_err()).unwrap_or(false);
        if system_restart_failed {
            reporter.status("Warning: Failed to restart system audio capture");
            if let Some(mut source) = system.take() {
                source.cleanup();
            }
        }
    }
    let audio_enabled = mic.is_some() || system.is_some();
    stats.audio_enabled = audio_enabled;
    if !audio_enabled {
        stats.audio_format = None;
    }

    let start = Instant::now();
    reporter.status(&format!(
        "Recording started: {} ({})",
        params.output_path.display(),
        if audio_enabled { "with audio" } else { "video only" }
    ));

    // Main capture loop.
    let dual = mode.dual_track();
    let frame_interval_ms = (1000 / params.fps) as u64;
    let mut next_frame_ms: u64 = 0;
    let mut frame_count: u64 = 0;
    let mut failed_frames: u64 = 0;
    let mut consecutive_audio_failures: u32 = 0;
    let mut loop_iterations: u32 = 0;
    let mut next_watchdog_check_ms: u64 = 1000;
    let stop_reason;

    loop {
        let now_ms = start.elapsed().as_millis() as u64;
        loop_iterations += 1;

        if cancel.is_cancelled() {
            stop_reason = StopReason::Cancelled;
            break;
        }

        // Defensive guards, evaluated once per second of wall time.
        if now_ms >= next_watchdog_check_ms {
            if loop_iterations > params.watchdog.max_loop_iterations_per_sec {
                reporter.status("EMERGENCY: Loop frequency too high, stopping recording");
                stop_reason = StopReason::Watchdog(WatchdogKind::LoopRunaway);
                break;
            }
            loop_iterations = 0;
            next_watchdog_check_ms = now_ms + 1000;

            if params.duration_secs == 0 && now_ms > params.watchdog.unlimited_ceiling_ms {
                reporter.status("EMERGENCY: Unlimited recording hit the hard ceiling, stopping");
                stop_reason = StopReason::Watchdog(WatchdogKind::UnlimitedCeiling);
                break;
            }
        }

        if params.duration_secs > 0 && now_ms >= params.duration_secs as u64 * 1000 {
            stop_reason = StopReason::DurationElapsed;
            break;
        }

        // Video path, paced to the target frame rate.
        if let Some(source) = screen.as_mut() {
            if now_ms >= next_frame_ms {
                match source.poll_frame(dual) {
                    Ok(FramePoll::Frame(frame)) => {
                        match sink.add_video_frame(&frame, now_ms) {
                            Ok(()) => {
                                frame_count += 1;
                                reporter.progress(frame_count, now_ms);
                            }
                            Err(err) => warn!(error = %err, "video submission rejected"),
                        }
                        next_frame_ms += frame_interval_ms;
                    }
                    // No frame and no cache: retry the same slot next pass.
                    Ok(FramePoll::Pending) => failed_frames += 1,
                    Err(CaptureError::AccessLost) => {
                        reporter.status("Warning: Display access lost, finalizing partial recording");
                        stop_reason = StopReason::AccessLost;
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "frame capture failed");
                        failed_frames += 1;
                        next_frame_ms += frame_interval_ms;
                    }
                }
            }
        }

        // Audio path, every iteration regardless of the frame clock.
        if audio_enabled {
            let mut audio_success = false;

            if dual {
                if let Some(source) = system.as_mut() {
                    audio_success |= pump_audio(source, &mut sink, AudioRoute::System, now_ms);
                }
                if let Some(source) = mic.as_mut() {
                    audio_success |= pump_audio(source, &mut sink, AudioRoute::Microphone, now_ms);
                }
            } else {
                if let Some(source) = mic.as_mut() {
                    audio_success |= pump_audio(source, &mut sink, AudioRoute::Combined, now_ms);
                }
                if let Some(source) = system.as_mut() {
                    audio_success |= pump_audio(source, &mut sink, AudioRoute::Combined, now_ms);
                }
            }

            if audio_success {
                consecutive_audio_failures = 0;
            } else {
                consecutive_audio_failures += 1;
                if params.audio_only_mode() && consecutive_audio_failures > MAX_AUDIO_FAILURES {
                    reporter.status(
                        "Error: Too many audio capture failures in audio-only mode, stopping recording",
                    );
                    stop_reason = StopReason::AudioStalled;
                    break;
                }
            }
        }

        // 5 ms covers the 50 ms audio ring comfortably; without audio,
        // sleep toward the next frame slot.
        if audio_enabled {
            thread::sleep(Duration::from_millis(5));
        } else {
            let now_ms = start.elapsed().as_millis() as u64;
            let until_next = next_frame_ms.saturating_sub(now_ms);
            thread::sleep(Duration::from_millis(until_next.clamp(1, 5)));
        }
    }

    stats.total_frames = frame_count;
    stats.failed_frames = failed_frames;
    stats.duration_ms = start.elapsed().as_millis() as u64;
    stats.stop_reason = stop_reason;

    reporter.status("Stopping capture...");
    if let Some(source) = screen.as_mut() {
        source.stop();
    }
    if let Some(source) = mic.as_mut() {
        source.stop();
    }
    if let Some(source) = system.as_mut() {
        source.stop();
    }

    reporter.status("Finalizing recording...");
    let finalize_result = sink.finalize();

    cleanup_sources(&mut screen, &mut mic, &mut system);
    sink.cleanup();

    if let Err(err) = finalize_result {
        reporter.status("Error: Failed to finalize recording");
        return Err(RecordingError::new(err, stats));
    }

    if params.audio_only_mode() {
        reporter.status(&format!("Audio recording completed: {} ms", stats.duration_ms));
    } else {
        reporter.status(&format!(
            "Recording completed: {} frames, {} ms",
            stats.total_frames, stats.duration_ms
        ));
    }

    match stats.stop_reason {
        StopReason::AudioStalled => Err(RecordingError::new(CaptureError::AudioStalled, stats)),
        _ => Ok(stats),
    }
}

/// Poll one source up to five times, 100 ms apart, looking for any
/// non-empty packet.
fn probe_source<A: AudioSource>(source: &mut A) -> bool {
    for _ in 0..PROBE_ATTEMPTS {
        thread::sleep(PROBE_INTERVAL);
        let frames = match source.poll() {
            Ok(AudioPoll::Packet(packet)) if packet.frames > 0 => packet.frames,
            Ok(_) => continue,
            Err(err) => {
                debug!(error = %err, "audio probe poll failed");
                continue;
            }
        };
        source.release(frames);
        return true;
    }
    false
}

/// Drain one packet from a source into the sink. Returns whether a packet
/// was obtained; submission rejections are logged and do not count as
/// failures (a single dropped sample must not terminate the recording).
fn pump_audio<A: AudioSource, S: MediaSink>(
    source: &mut A,
    sink: &mut S,
    route: AudioRoute,
    elapsed_ms: u64,
) -> bool {
    let frames = match source.poll() {
        Ok(AudioPoll::Packet(packet)) if packet.frames > 0 => {
            let result = match route {
                AudioRoute::Combined => sink.add_audio_frame(packet.data, packet.frames, elapsed_ms),
                AudioRoute::System => {
                    sink.add_system_audio_frame(packet.data, packet.frames, elapsed_ms)
                }
                AudioRoute::Microphone => {
                    sink.add_mic_audio_frame(packet.data, packet.frames, elapsed_ms)
                }
            };
            if let Err(err) = result {
                warn!(error = %err, stream = route.stream_name(), "audio submission rejected");
            }
            packet.frames
        }
        Ok(_) => return false,
        Err(err) => {
            warn!(error = %err, stream = route.stream_name(), "audio poll failed");
            return false;
        }
    };
    source.release(frames);
    true
}

fn cleanup_sources<V: VideoSource, A: AudioSource>(
    screen: &mut Option<V>,
    mic: &mut Option<A>,
    system: &mut Option<A>,
) {
    if let Some(mut source) = screen.take() {
        source.stop();
        source.cleanup();
    }
    if let Some(mut source) = mic.take() {
        source.stop();
        source.cleanup();
    }
    if let Some(mut source) = system.take() {
        source.stop();
        source.cleanup();
    }
}
