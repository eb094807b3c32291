//! Source abstractions for the capture loop.
//!
//! The orchestrator only sees these traits; the DXGI and WASAPI
//! implementations live in [`crate::win`] and the hardware-free ones in
//! [`crate::mock`].

use crate::error::CaptureError;

/// PCM format of an audio source, taken from the endpoint's mix format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// Shared-mode mix formats are IEEE float at 32 bits, integer PCM below.
    pub fn is_float(&self) -> bool {
        self.bits_per_sample == 32
    }

    /// Bytes per frame across all channels.
    pub fn block_align(&self) -> u32 {
        self.channels as u32 * self.bits_per_sample as u32 / 8
    }

    /// Average bytes per second.
    pub fn bytes_per_second(&self) -> u32 {
        self.block_align() * self.sample_rate
    }
}

/// Result of one non-blocking video poll.
#[derive(Debug)]
pub enum FramePoll {
    /// A BGRA frame, `width * height * 4` bytes, owned by the caller for
    /// one loop iteration.
    Frame(Vec<u8>),
    /// The compositor had nothing new and no cached frame exists yet.
    Pending,
}

/// One audio buffer as handed out by a source.
///
/// The payload either borrows the OS capture ring (release it through
/// [`AudioSource::release`]) or the source's own silence storage
/// (`synthesized`, for which release is a no-op).
#[derive(Debug)]
pub struct AudioPacket<'a> {
    pub data: &'a [u8],
    pub frames: u32,
    pub synthesized: bool,
}

/// Result of one non-blocking audio poll.
#[derive(Debug)]
pub enum AudioPoll<'a> {
    Packet(AudioPacket<'a>),
    /// No data owed: the ring is empty and silence is caught up.
    Idle,
}

/// A paced video producer (the desktop duplication stream).
pub trait VideoSource {
    /// Capture dimensions in pixels, fixed at init.
    fn dimensions(&self) -> (u32, u32);

    /// Mark the source capturing. No-op if already capturing.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Non-blocking frame acquisition.
    ///
    /// Row order depends on `dual_track`: single-track output is flipped
    /// bottom-up to correct the compositor's orientation for the encoder,
    /// dual-track output is copied top-down because that encoder path
    /// expects unflipped input.
    fn poll_frame(&mut self, dual_track: bool) -> Result<FramePoll, CaptureError>;

    fn stop(&mut self);

    /// Release everything the source holds. Safe to call more than once.
    fn cleanup(&mut self);
}

/// A continuously-polled audio producer (loopback or microphone).
pub trait AudioSource {
    fn format(&self) -> AudioFormat;

    fn start(&mut self) -> Result<(), CaptureError>;

    /// Non-blocking packet acquisition; synthesizes silence to keep the
    /// stream timeline continuous when the endpoint is idle.
    fn poll(&mut self) -> Result<AudioPoll<'_>, CaptureError>;

    /// Return an OS-owned packet to the capture ring. Must be called with
    /// the frame count of the packet most recently polled; no-op when that
    /// packet was synthesized silence.
    fn release(&mut self, frames: u32);

    fn stop(&mut self);

    /// Release everything the source holds. Safe to call more than once.
    fn cleanup(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_derivations() {
        let float = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 32,
        };
        assert!(float.is_float());
        assert_eq!(float.block_align(), 8);
        assert_eq!(float.bytes_per_second(), 384_000);

        let pcm = AudioFormat {
            sample_rate: 44_100,
            channels: 1,
            bits_per_sample: 16,
        };
        assert!(!pcm.is_float());
        assert_eq!(pcm.block_align(), 2);
        assert_eq!(pcm.bytes_per_second(), 88_200);
    }
}
