//! Capture and muxing core for the deskmux desktop recorder.
//!
//! The pipeline pulls raw desktop frames from the compositor, optionally
//! pulls two independent audio streams (system loopback and microphone),
//! and feeds a real-time muxer that emits one MP4 with an H.264 video
//! track and zero, one, or two AAC audio tracks.
//!
//! The orchestrator ([`engine::run`]) is platform-independent and driven
//! through the [`backend::CaptureBackend`] seam; the Windows
//! implementation lives in [`win`], and [`mock`] provides hardware-free
//! components that run the full pipeline in tests on any platform.

pub mod backend;
pub mod cancel;
pub mod clock;
pub mod engine;
pub mod error;
pub mod mock;
pub mod params;
pub mod silence;
pub mod sink;
pub mod source;
#[cfg(windows)]
pub mod win;

pub use backend::CaptureBackend;
pub use cancel::{spawn_emergency_watchdog, CancelToken, WATCHDOG_EXIT_CODE};
pub use engine::{run, CaptureStats, ConsoleReporter, Reporter, StopReason, WatchdogKind};
pub use error::{CaptureError, RecordingError};
pub use params::{AudioSources, CaptureParams, RecordingMode, Region, WatchdogLimits};
pub use source::AudioFormat;
