//! Media Foundation sink writer muxer.
//!
//! Owns one MP4 container per recording: one H.264 stream when video is
//! enabled and zero, one, or two AAC streams depending on the recording
//! mode. Presentation timestamps come exclusively from per-stream
//! [`StreamClock`]s; wall time is never consulted.

use std::path::Path;

use tracing::{debug, info, warn};
use windows::core::{HRESULT, PCWSTR};
use windows::Win32::Media::MediaFoundation::{
    IMFAttributes, IMFMediaType, IMFSinkWriter, MFAudioFormat_AAC, MFAudioFormat_Float,
    MFAudioFormat_PCM, MFCreateAttributes, MFCreateMediaType, MFCreateMemoryBuffer,
    MFCreateSample, MFCreateSinkWriterFromURL, MFMediaType_Audio, MFMediaType_Video, MFShutdown,
    MFStartup, MFSTARTUP_NOSOCKET, MFVideoFormat_ARGB32, MFVideoFormat_H264,
    MFVideoInterlace_Progressive, MFNominalRange_0_255, MFTranscodeContainerType_MPEG4,
    MF_LOW_LATENCY, MF_MT_AUDIO_AVG_BYTES_PER_SECOND, MF_MT_AUDIO_BITS_PER_SAMPLE,
    MF_MT_AUDIO_BLOCK_ALIGNMENT, MF_MT_AUDIO_NUM_CHANNELS, MF_MT_AUDIO_SAMPLES_PER_SECOND,
    MF_MT_AVG_BITRATE, MF_MT_FRAME_RATE, MF_MT_FRAME_SIZE, MF_MT_INTERLACE_MODE,
    MF_MT_MAJOR_TYPE, MF_MT_SUBTYPE, MF_MT_VIDEO_NOMINAL_RANGE,
    MF_READWRITE_ENABLE_HARDWARE_TRANSFORMS, MF_SINK_WRITER_DISABLE_THROTTLING,
    MF_TRANSCODE_CONTAINERTYPE, MF_VERSION, MF_SINK_WRITER_ALL_STREAMS,
};

use crate::clock::StreamClock;
use crate::error::CaptureError;
use crate::params::RecordingMode;
use crate::sink::MediaSink;
use crate::source::AudioFormat;

/// Finalizing a writer that processed no samples fails with this code; an
/// empty recording is still a well-formed (if useless) file, so it is
/// tolerated.
const MF_E_SINK_NO_SAMPLES_PROCESSED: HRESULT = HRESULT(0xC00D4A44_u32 as i32);

/// AAC output bitrate for every audio stream.
const AAC_BITRATE: u32 = 96_000;

/// Output sample rate declared on the combined video+audio track. The
/// audio-only and dual-track variants declare the source rate instead;
/// this asymmetry is historical but carried intentionally; timestamps
/// always derive from the declared output rate.
const COMBINED_OUTPUT_SAMPLE_RATE: u32 = 44_100;

fn init_err(detail: String) -> CaptureError {
    CaptureError::InitFailed {
        component: "muxer",
        detail,
    }
}

fn submit_err(stream: &'static str) -> impl Fn(windows::core::Error) -> CaptureError {
    move |e| CaptureError::SubmitFailed {
        stream,
        detail: e.to_string(),
    }
}

struct StreamState {
    index: u32,
    clock: StreamClock,
}

/// One recording's sink writer plus all per-stream state. The orchestrator
/// holds the sole handle, which enforces the single-active-muxer invariant
/// by construction.
pub struct MfMuxer {
    writer: Option<IMFSinkWriter>,
    mode: RecordingMode,
    video: Option<StreamState>,
    audio: Option<StreamState>,
    system: Option<StreamState>,
    mic: Option<StreamState>,
    width: u32,
    height: u32,
    input_block_align: u32,
    mf_started: bool,
    finalized: bool,
}

impl MfMuxer {
    /// Open the container and declare streams for the given mode.
    ///
    /// `dimensions` is required for the video-bearing variants,
    /// `audio_format` for the audio-bearing ones.
    pub fn open(
        path: &Path,
        mode: RecordingMode,
        fps: u32,
        dimensions: Option<(u32, u32)>,
        audio_format: Option<AudioFormat>,
    ) -> Result<Self, CaptureError> {
        // Safety: balanced by MFShutdown in cleanup(), including on every
        // failed-open path via drop.
        unsafe { MFStartup(MF_VERSION, MFSTARTUP_NOSOCKET) }
            .map_err(|e| init_err(format!("MFStartup: {e}")))?;

        let mut muxer = Self {
            writer: None,
            mode,
            video: None,
            audio: None,
            system: None,
            mic: None,
            width: 0,
            height: 0,
            input_block_align: 0,
            mf_started: true,
            finalized: false,
        };
        muxer.configure(path, fps, dimensions, audio_format)?;
        Ok(muxer)
    }

    fn configure(
        &mut self,
        path: &Path,
        fps: u32,
        dimensions: Option<(u32, u32)>,
        audio_format: Option<AudioFormat>,
    ) -> Result<(), CaptureError> {
        let url: Vec<u16> = path
            .as_os_str()
            .to_string_lossy()
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();

        unsafe {
            let mut attributes: Option<IMFAttributes> = None;
            MFCreateAttributes(&mut attributes, 4)
                .map_err(|e| init_err(format!("attributes: {e}")))?;
            let attributes =
                attributes.ok_or_else(|| init_err("attributes missing".to_string()))?;

            // The container type attribute is load-bearing: without it the
            // writer picks a default that does not emit a well-formed moov
            // atom.
            if let Err(err) =
                attributes.SetGUID(&MF_TRANSCODE_CONTAINERTYPE, &MFTranscodeContainerType_MPEG4)
            {
                warn!(error = %err, "failed to set MP4 container type");
            }
            if let Err(err) = attributes.SetUINT32(&MF_LOW_LATENCY, 1) {
                warn!(error = %err, "failed to set low latency mode");
            }
            if let Err(err) = attributes.SetUINT32(&MF_SINK_WRITER_DISABLE_THROTTLING, 1) {
                warn!(error = %err, "failed to disable throttling");
            }
            if let Err(err) = attributes.SetUINT32(&MF_READWRITE_ENABLE_HARDWARE_TRANSFORMS, 1) {
                warn!(error = %err, "failed to enable hardware transforms");
            }

            let writer =
                MFCreateSinkWriterFromURL(PCWSTR(url.as_ptr()), None, Some(&attributes))
                    .map_err(|e| init_err(format!("sink writer: {e}")))?;

            if self.mode.has_video() {
                let (width, height) =
                    dimensions.ok_or_else(|| init_err("missing video dimensions".to_string()))?;
                self.width = width;
                self.height = height;

                let out_type = create_video_output_type(width, height, fps)?;
                let index = writer
                    .AddStream(&out_type)
                    .map_err(|e| init_err(format!("video stream: {e}")))?;
                let in_type = create_video_input_type(width, height, fps)?;
                writer
                    .SetInputMediaType(index, &in_type, None)
                    .map_err(|e| init_err(format!("video input type: {e}")))?;
                self.video = Some(StreamState {
                    index,
                    clock: StreamClock::new(fps),
                });
            }

            if self.mode.has_audio() {
                let format = audio_format
                    .ok_or_else(|| init_err("missing audio format".to_string()))?;
                self.input_block_align = format.block_align();

                if self.mode.dual_track() {
                    for slot in [&mut self.system, &mut self.mic] {
                        let out_type = create_audio_output_type(&format, format.sample_rate)?;
                        let index = writer
                            .AddStream(&out_type)
                            .map_err(|e| init_err(format!("audio stream: {e}")))?;
                        *slot = Some(StreamState {
                            index,
                            clock: StreamClock::new(format.sample_rate),
                        });
                    }
                    // Input types are set after both AddStream calls, in
                    // stream order.
                    for slot in [&self.system, &self.mic] {
                        let stream = slot.as_ref().expect("dual streams just created");
                        let in_type = create_audio_input_type(&format)?;
                        writer
                            .SetInputMediaType(stream.index, &in_type, None)
                            .map_err(|e| init_err(format!("audio input type: {e}")))?;
                    }
                    info!(
                        system_stream = self.system.as_ref().map(|s| s.index),
                        mic_stream = self.mic.as_ref().map(|s| s.index),
                        "dual-track audio configured"
                    );
                } else {
                    let output_rate = if self.mode.has_video() {
                        COMBINED_OUTPUT_SAMPLE_RATE
                    } else {
                        format.sample_rate
                    };
                    if output_rate != format.sample_rate {
                        debug!(
                            input_rate = format.sample_rate,
                            output_rate, "combined track declares a fixed output rate"
                        );
                    }
                    let out_type = create_audio_output_type(&format, output_rate)?;
                    let index = writer
                        .AddStream(&out_type)
                        .map_err(|e| init_err(format!("audio stream: {e}")))?;
                    let in_type = create_audio_input_type(&format)?;
                    writer
                        .SetInputMediaType(index, &in_type, None)
                        .map_err(|e| init_err(format!("audio input type: {e}")))?;
                    self.audio = Some(StreamState {
                        index,
                        clock: StreamClock::new(output_rate),
                    });
                }
            }

            writer
                .BeginWriting()
                .map_err(|e| init_err(format!("begin writing: {e}")))?;
            self.writer = Some(writer);
        }

        info!(
            mode = ?self.mode,
            output = %path.display(),
            "muxer initialized"
        );
        Ok(())
    }

    /// Build a sample around a fresh memory buffer, stamp it from the
    /// stream clock, and submit it.
    fn write_sample(
        writer: &IMFSinkWriter,
        stream: &mut StreamState,
        payload: &[u8],
        buffer_len: u32,
        units: u32,
        label: &'static str,
    ) -> Result<(), CaptureError> {
        let err = submit_err(label);
        unsafe {
            let sample = MFCreateSample().map_err(&err)?;
            let buffer = MFCreateMemoryBuffer(buffer_len).map_err(&err)?;

            let mut data_ptr: *mut u8 = std::ptr::null_mut();
            buffer.Lock(&mut data_ptr, None, None).map_err(&err)?;
            let copy_len = payload.len().min(buffer_len as usize);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), data_ptr, copy_len);
            buffer.Unlock().map_err(&err)?;
            buffer.SetCurrentLength(buffer_len).map_err(&err)?;
            sample.AddBuffer(&buffer).map_err(&err)?;

            sample.SetSampleTime(stream.clock.timestamp()).map_err(&err)?;
            sample
                .SetSampleDuration(stream.clock.duration_of(units))
                .map_err(&err)?;
            writer.WriteSample(stream.index, &sample).map_err(&err)?;
        }
        stream.clock.advance(units);
        Ok(())
    }
}

impl MediaSink for MfMuxer {
    fn add_video_frame(&mut self, data: &[u8], elapsed_ms: u64) -> Result<(), CaptureError> {
        let writer = match &self.writer {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let stream = match &mut self.video {
            Some(stream) => stream,
            None => return Ok(()),
        };
        // Buffer size comes from stored geometry, not the caller.
        let buffer_len = self.width * self.height * 4;
        Self::write_sample(writer, stream, data, buffer_len, 1, "video")?;

        if stream.clock.position() % 30 == 0 {
            debug!(
                frames = stream.clock.position(),
                elapsed_ms, "video progress"
            );
        }
        Ok(())
    }

    fn add_audio_frame(
        &mut self,
        data: &[u8],
        frames: u32,
        _elapsed_ms: u64,
    ) -> Result<(), CaptureError> {
        let writer = match &self.writer {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let stream = match &mut self.audio {
            // Video-only recordings silently ignore audio submissions.
            None => return Ok(()),
            Some(stream) => stream,
        };
        let buffer_len = frames * self.input_block_align;
        Self::write_sample(writer, stream, data, buffer_len, frames, "audio")
    }

    fn add_system_audio_frame(
        &mut self,
        data: &[u8],
        frames: u32,
        _elapsed_ms: u64,
    ) -> Result<(), CaptureError> {
        let writer = self.writer.as_ref().ok_or_else(|| CaptureError::SubmitFailed {
            stream: "system audio",
            detail: "muxer closed".to_string(),
        })?;
        let stream = self.system.as_mut().ok_or_else(|| CaptureError::SubmitFailed {
            stream: "system audio",
            detail: "dual-track not active".to_string(),
        })?;
        let buffer_len = frames * self.input_block_align;
        Self::write_sample(writer, stream, data, buffer_len, frames, "system audio")
    }

    fn add_mic_audio_frame(
        &mut self,
        data: &[u8],
        frames: u32,
        _elapsed_ms: u64,
    ) -> Result<(), CaptureError> {
        let writer = self.writer.as_ref().ok_or_else(|| CaptureError::SubmitFailed {
            stream: "microphone audio",
            detail: "muxer closed".to_string(),
        })?;
        let stream = self.mic.as_mut().ok_or_else(|| CaptureError::SubmitFailed {
            stream: "microphone audio",
            detail: "dual-track not active".to_string(),
        })?;
        let buffer_len = frames * self.input_block_align;
        Self::write_sample(writer, stream, data, buffer_len, frames, "microphone audio")
    }

    fn finalize(&mut self) -> Result<(), CaptureError> {
        if self.finalized {
            return Ok(());
        }
        let writer = match &self.writer {
            Some(writer) => writer,
            None => return Ok(()),
        };

        unsafe {
            if let Err(err) = writer.Flush(MF_SINK_WRITER_ALL_STREAMS) {
                warn!(error = %err, "failed to flush sink writer");
            }

            // End-of-stream tick for every stream that carried data, at its
            // final clock position.
            let mut any_data = false;
            for stream in [&self.video, &self.audio, &self.system, &self.mic]
                .into_iter()
                .flatten()
            {
                if stream.clock.position() == 0 {
                    continue;
                }
                any_data = true;
                if let Err(err) = writer.SendStreamTick(stream.index, stream.clock.timestamp()) {
                    warn!(
                        stream = stream.index,
                        error = %err,
                        "failed to send end-of-stream tick"
                    );
                }
            }
            if !any_data {
                info!("no samples captured, finalizing anyway for a well-formed container");
            }

            match writer.Finalize() {
                Ok(()) => {}
                Err(err) if err.code() == MF_E_SINK_NO_SAMPLES_PROCESSED => {
                    info!("finalize reported an empty media file, treating as success");
                }
                Err(err) => {
                    return Err(CaptureError::FinalizeFailed {
                        detail: err.to_string(),
                    });
                }
            }
        }

        self.finalized = true;
        info!("sink writer finalized");
        Ok(())
    }

    fn cleanup(&mut self) {
        self.writer = None;
        self.video = None;
        self.audio = None;
        self.system = None;
        self.mic = None;
        self.width = 0;
        self.height = 0;
        self.input_block_align = 0;
        if self.mf_started {
            // Safety: balances the MFStartup in open().
            if let Err(err) = unsafe { MFShutdown() } {
                warn!(error = %err, "MFShutdown failed");
            }
            self.mf_started = false;
        }
    }
}

impl Drop for MfMuxer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn create_video_output_type(
    width: u32,
    height: u32,
    fps: u32,
) -> Result<IMFMediaType, CaptureError> {
    unsafe {
        let media_type = MFCreateMediaType().map_err(|e| init_err(format!("media type: {e}")))?;
        let set = |r: windows::core::Result<()>| r.map_err(|e| init_err(format!("video output type: {e}")));

        set(media_type.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Video))?;
        set(media_type.SetGUID(&MF_MT_SUBTYPE, &MFVideoFormat_H264))?;
        set(media_type.SetUINT32(&MF_MT_AVG_BITRATE, adaptive_bitrate(width)))?;
        set(media_type.SetUINT64(&MF_MT_FRAME_SIZE, ((width as u64) << 32) | height as u64))?;
        set(media_type.SetUINT64(&MF_MT_FRAME_RATE, ((fps as u64) << 32) | 1))?;
        set(media_type.SetUINT32(&MF_MT_INTERLACE_MODE, MFVideoInterlace_Progressive.0 as u32))?;
        if let Err(err) =
            media_type.SetUINT32(&MF_MT_VIDEO_NOMINAL_RANGE, MFNominalRange_0_255.0 as u32)
        {
            debug!(error = %err, "failed to set nominal range");
        }
        Ok(media_type)
    }
}

fn create_video_input_type(
    width: u32,
    height: u32,
    fps: u32,
) -> Result<IMFMediaType, CaptureError> {
    unsafe {
        let media_type = MFCreateMediaType().map_err(|e| init_err(format!("media type: {e}")))?;
        let set = |r: windows::core::Result<()>| r.map_err(|e| init_err(format!("video input type: {e}")));

        set(media_type.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Video))?;
        set(media_type.SetGUID(&MF_MT_SUBTYPE, &MFVideoFormat_ARGB32))?;
        set(media_type.SetUINT64(&MF_MT_FRAME_SIZE, ((width as u64) << 32) | height as u64))?;
        set(media_type.SetUINT64(&MF_MT_FRAME_RATE, ((fps as u64) << 32) | 1))?;
        set(media_type.SetUINT32(&MF_MT_INTERLACE_MODE, MFVideoInterlace_Progressive.0 as u32))?;
        Ok(media_type)
    }
}

fn create_audio_output_type(
    format: &AudioFormat,
    output_rate: u32,
) -> Result<IMFMediaType, CaptureError> {
    unsafe {
        let media_type = MFCreateMediaType().map_err(|e| init_err(format!("media type: {e}")))?;
        let set = |r: windows::core::Result<()>| r.map_err(|e| init_err(format!("audio output type: {e}")));

        set(media_type.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Audio))?;
        set(media_type.SetGUID(&MF_MT_SUBTYPE, &MFAudioFormat_AAC))?;
        set(media_type.SetUINT32(&MF_MT_AUDIO_SAMPLES_PER_SECOND, output_rate))?;
        set(media_type.SetUINT32(&MF_MT_AUDIO_NUM_CHANNELS, format.channels as u32))?;
        // AAC carries 16-bit samples regardless of the capture depth.
        set(media_type.SetUINT32(&MF_MT_AUDIO_BITS_PER_SAMPLE, 16))?;
        set(media_type.SetUINT32(&MF_MT_AVG_BITRATE, AAC_BITRATE))?;
        Ok(media_type)
    }
}

fn create_audio_input_type(format: &AudioFormat) -> Result<IMFMediaType, CaptureError> {
    unsafe {
        let media_type = MFCreateMediaType().map_err(|e| init_err(format!("media type: {e}")))?;
        let set = |r: windows::core::Result<()>| r.map_err(|e| init_err(format!("audio input type: {e}")));

        set(media_type.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Audio))?;
        let subtype = if format.is_float() {
            &MFAudioFormat_Float
        } else {
            &MFAudioFormat_PCM
        };
        set(media_type.SetGUID(&MF_MT_SUBTYPE, subtype))?;
        set(media_type.SetUINT32(&MF_MT_AUDIO_SAMPLES_PER_SECOND, format.sample_rate))?;
        set(media_type.SetUINT32(&MF_MT_AUDIO_NUM_CHANNELS, format.channels as u32))?;
        set(media_type.SetUINT32(&MF_MT_AUDIO_BITS_PER_SAMPLE, format.bits_per_sample as u32))?;
        set(media_type.SetUINT32(&MF_MT_AUDIO_BLOCK_ALIGNMENT, format.block_align()))?;
        set(media_type.SetUINT32(&MF_MT_AUDIO_AVG_BYTES_PER_SECOND, format.bytes_per_second()))?;
        Ok(media_type)
    }
}

/// Bitrate ladder keyed on output width.
fn adaptive_bitrate(width: u32) -> u32 {
    if width >= 1920 {
        1_200_000
    } else if width >= 1280 {
        800_000
    } else {
        500_000
    }
}
