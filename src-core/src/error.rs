//! Error types for capture and muxing operations.

use std::fmt;

use crate::engine::CaptureStats;

/// Error type for capture operations.
#[derive(Debug)]
pub enum CaptureError {
    /// A required component refused to initialize
    InitFailed {
        component: &'static str,
        detail: String,
    },
    /// An optional source failed; the recording continues without it
    Downgraded { component: &'static str },
    /// The desktop duplication stream was invalidated by the compositor
    AccessLost,
    /// A frame or audio packet could not be acquired
    FrameFailed { detail: String },
    /// A single buffer was rejected by the muxer
    SubmitFailed {
        stream: &'static str,
        detail: String,
    },
    /// The sink writer could not close cleanly
    FinalizeFailed { detail: String },
    /// Too many consecutive empty polls in audio-only mode
    AudioStalled,
    /// Invalid capture region specification
    InvalidRegion(String),
    /// Capture is not available on this platform
    NotSupported(&'static str),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::InitFailed { component, detail } => {
                write!(f, "failed to initialize {}: {}", component, detail)
            }
            CaptureError::Downgraded { component } => {
                write!(f, "{} unavailable, continuing without it", component)
            }
            CaptureError::AccessLost => write!(f, "desktop duplication access lost"),
            CaptureError::FrameFailed { detail } => write!(f, "frame acquisition failed: {}", detail),
            CaptureError::SubmitFailed { stream, detail } => {
                write!(f, "failed to submit {} sample: {}", stream, detail)
            }
            CaptureError::FinalizeFailed { detail } => {
                write!(f, "failed to finalize output: {}", detail)
            }
            CaptureError::AudioStalled => {
                write!(f, "too many consecutive audio capture failures")
            }
            CaptureError::InvalidRegion(msg) => write!(f, "invalid region: {}", msg),
            CaptureError::NotSupported(what) => write!(f, "not supported: {}", what),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<CaptureError> for String {
    fn from(err: CaptureError) -> Self {
        err.to_string()
    }
}

/// A recording failure together with whatever statistics the capture loop
/// accumulated before the failure.
#[derive(Debug)]
pub struct RecordingError {
    pub error: CaptureError,
    pub stats: CaptureStats,
}

impl RecordingError {
    pub fn new(error: CaptureError, stats: CaptureStats) -> Self {
        Self { error, stats }
    }
}

impl fmt::Display for RecordingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for RecordingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_failed_display() {
        let err = CaptureError::InitFailed {
            component: "screen capture",
            detail: "no adapter".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to initialize screen capture: no adapter"
        );
    }

    #[test]
    fn submit_failed_display() {
        let err = CaptureError::SubmitFailed {
            stream: "video",
            detail: "0x80004005".to_string(),
        };
        assert!(err.to_string().contains("video"));
    }

    #[test]
    fn error_converts_to_string() {
        let msg: String = CaptureError::AccessLost.into();
        assert_eq!(msg, "desktop duplication access lost");
    }
}
