//! Windows capture stack: DXGI desktop duplication, WASAPI audio, and the
//! Media Foundation sink writer.

mod audio;
mod console;
mod muxer;
mod screen;

pub use audio::{Endpoint, WasapiSource};
pub use console::install_console_handler;
pub use muxer::MfMuxer;
pub use screen::DxgiScreenSource;

use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{
    CoInitializeEx, CoUninitialize, COINIT_APARTMENTTHREADED, COINIT_MULTITHREADED,
};

use crate::backend::CaptureBackend;
use crate::cancel::CancelToken;
use crate::engine::{self, CaptureStats, Reporter};
use crate::error::{CaptureError, RecordingError};
use crate::params::{CaptureParams, RecordingMode};
use crate::source::AudioFormat;

/// Scoped COM initialization with the apartment-threaded → multithreaded
/// fallback the capture stack needs (GUI hosts bring their own STA, plain
/// CLI threads take MTA). Balanced on drop.
pub struct ComGuard {
    initialized_here: bool,
}

impl ComGuard {
    pub fn new() -> Result<Self, CaptureError> {
        // Safety: per-thread COM init; failures are reported, success is
        // balanced by CoUninitialize in drop.
        unsafe {
            let hr = CoInitializeEx(None, COINIT_APARTMENTTHREADED);
            if hr.is_ok() {
                return Ok(Self {
                    initialized_here: true,
                });
            }
            let hr = CoInitializeEx(None, COINIT_MULTITHREADED);
            if hr.is_ok() {
                return Ok(Self {
                    initialized_here: true,
                });
            }
            // Already initialized in an incompatible mode is fine; the
            // thread has working COM either way.
            if hr == RPC_E_CHANGED_MODE {
                return Ok(Self {
                    initialized_here: false,
                });
            }
            Err(CaptureError::InitFailed {
                component: "COM",
                detail: format!("0x{:08X}", hr.0),
            })
        }
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized_here {
            unsafe { CoUninitialize() };
        }
    }
}

/// The real capture backend.
#[derive(Debug, Default)]
pub struct WindowsBackend;

impl CaptureBackend for WindowsBackend {
    type Video = DxgiScreenSource;
    type Audio = WasapiSource;
    type Sink = MfMuxer;

    fn open_screen(&mut self, params: &CaptureParams) -> Result<Self::Video, CaptureError> {
        DxgiScreenSource::new(params.monitor_index)
    }

    fn open_system_audio(&mut self) -> Result<Self::Audio, CaptureError> {
        WasapiSource::new(Endpoint::Loopback)
    }

    fn open_microphone(&mut self) -> Result<Self::Audio, CaptureError> {
        WasapiSource::new(Endpoint::Microphone)
    }

    fn open_sink(
        &mut self,
        params: &CaptureParams,
        mode: RecordingMode,
        dimensions: Option<(u32, u32)>,
        audio_format: Option<AudioFormat>,
    ) -> Result<Self::Sink, CaptureError> {
        MfMuxer::open(
            &params.output_path,
            mode,
            params.fps,
            dimensions,
            audio_format,
        )
    }
}

/// Run one recording against the real Windows stack.
pub fn record(
    params: &CaptureParams,
    reporter: &mut dyn Reporter,
    cancel: &CancelToken,
) -> Result<CaptureStats, RecordingError> {
    let _com = ComGuard::new().map_err(|e| RecordingError::new(e, CaptureStats::default()))?;
    let mut backend = WindowsBackend;
    engine::run(&mut backend, params, reporter, cancel)
}
