//! WASAPI audio sources.
//!
//! One type covers both endpoints: loopback capture of the default render
//! device (what the OS is playing back) and direct capture of the default
//! microphone. The two differ only in endpoint selection and stream flags.
//!
//! When the endpoint delivers no packets the source fabricates silence
//! through [`SilenceClock`], keeping the stream timeline continuous so the
//! muxed track stays aligned with video duration.

use std::slice;
use std::time::Instant;

use tracing::{debug, info, warn};
use windows::Win32::Media::Audio::{
    eCapture, eConsole, eRender, IAudioCaptureClient, IAudioClient, IMMDevice,
    IMMDeviceEnumerator, MMDeviceEnumerator, AUDCLNT_SHAREMODE_SHARED,
    AUDCLNT_STREAMFLAGS_LOOPBACK, WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
};
use windows::Win32::Media::KernelStreaming::WAVE_FORMAT_EXTENSIBLE;
use windows::Win32::Media::Multimedia::KSDATAFORMAT_SUBTYPE_IEEE_FLOAT;
use windows::Win32::System::Com::{CoCreateInstance, CoTaskMemFree, CLSCTX_ALL};

use crate::error::CaptureError;
use crate::silence::SilenceClock;
use crate::source::{AudioFormat, AudioPacket, AudioPoll, AudioSource};

/// 50 ms shared-mode buffer, in 100-nanosecond units.
const BUFFER_DURATION: i64 = 500_000;

/// AUDCLNT_BUFFERFLAGS_SILENT
const BUFFERFLAGS_SILENT: u32 = 0x2;

/// Which endpoint a [`WasapiSource`] captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Default render endpoint with the loopback flag: records the mix the
    /// OS is playing back.
    Loopback,
    /// Default capture endpoint.
    Microphone,
}

impl Endpoint {
    fn component(self) -> &'static str {
        match self {
            Endpoint::Loopback => "system audio",
            Endpoint::Microphone => "microphone",
        }
    }
}

/// Shared-mode WASAPI capture on a default endpoint.
pub struct WasapiSource {
    endpoint: Endpoint,
    enumerator: Option<IMMDeviceEnumerator>,
    device: Option<IMMDevice>,
    audio_client: Option<IAudioClient>,
    capture_client: Option<IAudioCaptureClient>,
    format: AudioFormat,
    block_align: u32,
    capturing: bool,
    created: Instant,
    silence: SilenceClock,
    silence_buf: Vec<u8>,
    last_synthesized: bool,
}

/// Parse sample rate, channels, and bit depth out of a mix format,
/// recognizing the WAVE_FORMAT_EXTENSIBLE float sub-format.
///
/// # Safety
/// `format` must point to a valid WAVEFORMATEX (optionally extensible).
unsafe fn parse_wave_format(format: *const WAVEFORMATEX) -> (AudioFormat, u32) {
    let fmt = &*format;
    let mut is_float = false;
    if fmt.wFormatTag == WAVE_FORMAT_EXTENSIBLE as u16 {
        let ext = format as *const WAVEFORMATEXTENSIBLE;
        let sub_format = std::ptr::read_unaligned(std::ptr::addr_of!((*ext).SubFormat));
        is_float = sub_format == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT;
    } else if fmt.wFormatTag == 3 {
        // WAVE_FORMAT_IEEE_FLOAT
        is_float = true;
    }
    debug!(
        rate = fmt.nSamplesPerSec,
        channels = fmt.nChannels,
        bits = fmt.wBitsPerSample,
        is_float,
        "endpoint mix format"
    );
    (
        AudioFormat {
            sample_rate: fmt.nSamplesPerSec,
            channels: fmt.nChannels,
            bits_per_sample: fmt.wBitsPerSample,
        },
        fmt.nBlockAlign as u32,
    )
}

impl WasapiSource {
    /// Open the endpoint's audio client in shared mode with a 50 ms buffer
    /// and fetch its capture service. COM must be initialized on the
    /// calling thread.
    pub fn new(endpoint: Endpoint) -> Result<Self, CaptureError> {
        let component = endpoint.component();
        let init_err = |detail: String| CaptureError::InitFailed { component, detail };

        unsafe {
            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                    .map_err(|e| init_err(format!("device enumerator: {e}")))?;

            let flow = match endpoint {
                Endpoint::Loopback => eRender,
                Endpoint::Microphone => eCapture,
            };
            let device = enumerator
                .GetDefaultAudioEndpoint(flow, eConsole)
                .map_err(|e| init_err(format!("default endpoint: {e}")))?;

            let audio_client: IAudioClient = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|e| init_err(format!("audio client: {e}")))?;

            let mix_format = audio_client
                .GetMixFormat()
                .map_err(|e| init_err(format!("mix format: {e}")))?;
            let (format, block_align) = parse_wave_format(mix_format);

            let stream_flags = match endpoint {
                Endpoint::Loopback => AUDCLNT_STREAMFLAGS_LOOPBACK,
                Endpoint::Microphone => 0,
            };

            let init_result = audio_client.Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                stream_flags,
                BUFFER_DURATION,
                0,
                mix_format,
                None,
            );
            CoTaskMemFree(Some(mix_format as *const _));
            init_result.map_err(|e| init_err(format!("client initialize: {e}")))?;

            let buffer_frames = audio_client
                .GetBufferSize()
                .map_err(|e| init_err(format!("buffer size: {e}")))?;

            let capture_client: IAudioCaptureClient = audio_client
                .GetService()
                .map_err(|e| init_err(format!("capture service: {e}")))?;

            info!(
                component,
                rate = format.sample_rate,
                channels = format.channels,
                bits = format.bits_per_sample,
                buffer_frames,
                "audio capture initialized"
            );

            Ok(Self {
                endpoint,
                enumerator: Some(enumerator),
                device: Some(device),
                audio_client: Some(audio_client),
                capture_client: Some(capture_client),
                format,
                block_align,
                capturing: false,
                created: Instant::now(),
                silence: SilenceClock::new(format.sample_rate),
                silence_buf: Vec::new(),
                last_synthesized: false,
            })
        }
    }
}

impl AudioSource for WasapiSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        let client = self.audio_client.as_ref().ok_or(CaptureError::InitFailed {
            component: self.endpoint.component(),
            detail: "audio client not open".to_string(),
        })?;
        // Safety: client is a live IAudioClient.
        unsafe { client.Start() }.map_err(|e| CaptureError::InitFailed {
            component: self.endpoint.component(),
            detail: format!("start: {e}"),
        })?;
        self.capturing = true;
        debug!(component = self.endpoint.component(), "audio capture started");
        Ok(())
    }

    fn poll(&mut self) -> Result<AudioPoll<'_>, CaptureError> {
        if !self.capturing {
            return Ok(AudioPoll::Idle);
        }
        let capture_client = match &self.capture_client {
            Some(client) => client,
            None => return Ok(AudioPoll::Idle),
        };

        unsafe {
            let packet_frames = capture_client.GetNextPacketSize().map_err(|e| {
                CaptureError::FrameFailed {
                    detail: format!("{}: next packet size: {e}", self.endpoint.component()),
                }
            })?;

            if packet_frames == 0 {
                // Endpoint idle: fabricate exactly as much silence as wall
                // time owes the stream.
                let now_ms = self.created.elapsed().as_millis() as u64;
                let frames = self.silence.take(now_ms);
                if frames == 0 {
                    return Ok(AudioPoll::Idle);
                }
                let bytes = frames as usize * self.block_align as usize;
                if self.silence_buf.len() < bytes {
                    self.silence_buf.resize(bytes, 0);
                }
                self.last_synthesized = true;
                return Ok(AudioPoll::Packet(AudioPacket {
                    data: &self.silence_buf[..bytes],
                    frames,
                    synthesized: true,
                }));
            }

            let mut data_ptr: *mut u8 = std::ptr::null_mut();
            let mut frames: u32 = 0;
            let mut flags: u32 = 0;
            capture_client
                .GetBuffer(&mut data_ptr, &mut frames, &mut flags, None, None)
                .map_err(|e| CaptureError::FrameFailed {
                    detail: format!("{}: get buffer: {e}", self.endpoint.component()),
                })?;

            let bytes = frames as usize * self.block_align as usize;
            if flags & BUFFERFLAGS_SILENT != 0 {
                std::ptr::write_bytes(data_ptr, 0, bytes);
            }

            self.last_synthesized = false;
            // Safety: the ring buffer stays mapped until release(), which
            // requires re-borrowing this source mutably.
            let data = slice::from_raw_parts(data_ptr, bytes);
            Ok(AudioPoll::Packet(AudioPacket {
                data,
                frames,
                synthesized: false,
            }))
        }
    }

    fn release(&mut self, frames: u32) {
        // Synthesized packets live in our own storage; nothing to return.
        if self.last_synthesized {
            return;
        }
        if let Some(client) = &self.capture_client {
            // Safety: paired with the GetBuffer of the packet just consumed.
            if let Err(err) = unsafe { client.ReleaseBuffer(frames) } {
                warn!(
                    component = self.endpoint.component(),
                    error = %err,
                    "failed to release capture buffer"
                );
            }
        }
    }

    fn stop(&mut self) {
        if let Some(client) = &self.audio_client {
            // Safety: client is a live IAudioClient.
            if let Err(err) = unsafe { client.Stop() } {
                warn!(
                    component = self.endpoint.component(),
                    error = %err,
                    "failed to stop audio client"
                );
            }
        }
        self.capturing = false;
        debug!(component = self.endpoint.component(), "audio capture stopped");
    }

    fn cleanup(&mut self) {
        self.capturing = false;
        self.capture_client = None;
        self.audio_client = None;
        self.device = None;
        self.enumerator = None;
        self.silence_buf = Vec::new();
    }
}

impl Drop for WasapiSource {
    fn drop(&mut self) {
        self.cleanup();
    }
}
