//! Desktop duplication video source.
//!
//! Polls the compositor's frame queue with zero timeout, copies the GPU
//! texture through a staging surface into a plain BGRA buffer, and keeps a
//! one-frame cache so the capture loop can hold its target frame rate when
//! the compositor has nothing new.

use std::ptr;

use tracing::{debug, info, warn};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_FLAG, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ,
    D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIFactory1, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
    DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_DESC, DXGI_OUTDUPL_FRAME_INFO,
};
use windows::Win32::Foundation::HMODULE;

use crate::error::CaptureError;
use crate::source::{FramePoll, VideoSource};

/// Frames above this size are never cached; once exceeded, caching stays
/// off for the remainder of the recording.
const MAX_CACHE_BYTES: usize = 32 * 1024 * 1024;

fn init_err(detail: String) -> CaptureError {
    CaptureError::InitFailed {
        component: "screen capture",
        detail,
    }
}

/// Releases the acquired compositor frame when the copy scope ends.
struct AcquiredFrame<'a>(&'a IDXGIOutputDuplication);

impl Drop for AcquiredFrame<'_> {
    fn drop(&mut self) {
        // Safety: paired with the successful AcquireNextFrame that created
        // this guard.
        if let Err(err) = unsafe { self.0.ReleaseFrame() } {
            warn!(error = %err, "failed to release duplication frame");
        }
    }
}

/// DXGI desktop duplication stream on one monitor.
pub struct DxgiScreenSource {
    device: Option<ID3D11Device>,
    context: Option<ID3D11DeviceContext>,
    duplication: Option<IDXGIOutputDuplication>,
    width: u32,
    height: u32,
    capturing: bool,
    cached_frame: Option<Vec<u8>>,
    cache_disabled: bool,
}

impl DxgiScreenSource {
    /// Open a duplication stream on the given output of the first adapter.
    pub fn new(monitor_index: u32) -> Result<Self, CaptureError> {
        unsafe {
            let factory: IDXGIFactory1 = CreateDXGIFactory1()
                .map_err(|e| init_err(format!("DXGI factory: {e}")))?;
            let adapter = factory
                .EnumAdapters1(0)
                .map_err(|e| init_err(format!("no graphics adapter: {e}")))?;
            let output = adapter
                .EnumOutputs(monitor_index)
                .map_err(|e| init_err(format!("monitor {monitor_index} not found: {e}")))?;
            let output1: IDXGIOutput1 = output
                .cast()
                .map_err(|e| init_err(format!("output does not support duplication: {e}")))?;

            let mut device: Option<ID3D11Device> = None;
            let mut context: Option<ID3D11DeviceContext> = None;
            let mut feature_level = D3D_FEATURE_LEVEL::default();
            D3D11CreateDevice(
                &adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_FLAG(0),
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                Some(&mut feature_level),
                Some(&mut context),
            )
            .map_err(|e| init_err(format!("D3D11 device: {e}")))?;
            let device = device.ok_or_else(|| init_err("D3D11 device missing".to_string()))?;
            let context = context.ok_or_else(|| init_err("D3D11 context missing".to_string()))?;

            let duplication = output1
                .DuplicateOutput(&device)
                .map_err(|e| init_err(format!("desktop duplication: {e}")))?;

            let mut desc = DXGI_OUTDUPL_DESC::default();
            duplication.GetDesc(&mut desc);
            let width = desc.ModeDesc.Width;
            let height = desc.ModeDesc.Height;
            info!(width, height, monitor_index, "screen capture initialized");

            Ok(Self {
                device: Some(device),
                context: Some(context),
                duplication: Some(duplication),
                width,
                height,
                capturing: false,
                cached_frame: None,
                cache_disabled: false,
            })
        }
    }
}

impl VideoSource for DxgiScreenSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.duplication.is_none() {
            return Err(init_err("duplication stream not open".to_string()));
        }
        self.capturing = true;
        debug!("screen capture started");
        Ok(())
    }

    fn poll_frame(&mut self, dual_track: bool) -> Result<FramePoll, CaptureError> {
        let (duplication, device, context) =
            match (&self.duplication, &self.device, &self.context) {
                (Some(d), Some(dev), Some(ctx)) if self.capturing => (d, dev, ctx),
                _ => {
                    return Err(CaptureError::FrameFailed {
                        detail: "screen source not capturing".to_string(),
                    })
                }
            };

        unsafe {
            let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
            let mut resource: Option<IDXGIResource> = None;
            if let Err(err) = duplication.AcquireNextFrame(0, &mut frame_info, &mut resource) {
                if err.code() == DXGI_ERROR_WAIT_TIMEOUT {
                    // No new frame; replay the cache to hold the frame rate.
                    return Ok(match &self.cached_frame {
                        Some(cached) => FramePoll::Frame(cached.clone()),
                        None => FramePoll::Pending,
                    });
                }
                if err.code() == DXGI_ERROR_ACCESS_LOST {
                    return Err(CaptureError::AccessLost);
                }
                return Err(CaptureError::FrameFailed {
                    detail: format!("AcquireNextFrame: {err}"),
                });
            }
            let _release = AcquiredFrame(duplication);

            let resource = resource.ok_or_else(|| CaptureError::FrameFailed {
                detail: "AcquireNextFrame returned no resource".to_string(),
            })?;
            let texture: ID3D11Texture2D = resource.cast().map_err(|e| CaptureError::FrameFailed {
                detail: format!("frame texture interface: {e}"),
            })?;

            let mut desc = D3D11_TEXTURE2D_DESC::default();
            texture.GetDesc(&mut desc);
            desc.Usage = D3D11_USAGE_STAGING;
            desc.CPUAccessFlags = D3D11_CPU_ACCESS_READ.0 as u32;
            desc.BindFlags = 0;
            desc.MiscFlags = 0;

            let mut staging: Option<ID3D11Texture2D> = None;
            device
                .CreateTexture2D(&desc, None, Some(&mut staging))
                .map_err(|e| CaptureError::FrameFailed {
                    detail: format!("staging texture: {e}"),
                })?;
            let staging = staging.ok_or_else(|| CaptureError::FrameFailed {
                detail: "staging texture missing".to_string(),
            })?;

            context.CopyResource(&staging, &texture);

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            context
                .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| CaptureError::FrameFailed {
                    detail: format!("staging map: {e}"),
                })?;

            let width = desc.Width as usize;
            let height = desc.Height as usize;
            let row_bytes = width * 4;
            let mut frame = vec![0u8; row_bytes * height];
            let src = mapped.pData as *const u8;

            // The compositor hands rows out top-down; the single-track
            // encoder path expects bottom-up input, the dual-track path
            // expects it unflipped.
            for y in 0..height {
                let src_row = if dual_track { y } else { height - 1 - y };
                ptr::copy_nonoverlapping(
                    src.add(src_row * mapped.RowPitch as usize),
                    frame.as_mut_ptr().add(y * row_bytes),
                    row_bytes,
                );
            }

            context.Unmap(&staging, 0);

            if !self.cache_disabled {
                if frame.len() <= MAX_CACHE_BYTES {
                    self.cached_frame = Some(frame.clone());
                } else {
                    debug!(bytes = frame.len(), "frame exceeds cache ceiling, caching disabled");
                    self.cached_frame = None;
                    self.cache_disabled = true;
                }
            }

            Ok(FramePoll::Frame(frame))
        }
    }

    fn stop(&mut self) {
        self.capturing = false;
        debug!("screen capture stopped");
    }

    fn cleanup(&mut self) {
        self.capturing = false;
        self.duplication = None;
        self.context = None;
        self.device = None;
        self.cached_frame = None;
    }
}

impl Drop for DxgiScreenSource {
    fn drop(&mut self) {
        self.cleanup();
    }
}
