//! V4L2 camera capture via the `v4l` crate.

use crate::frame;
use image::RgbImage;
use rollcall_core::sampler::{FrameSource, SourceError};
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Frames dequeued per mmap stream before it is torn down.
const CAPTURE_BATCH: usize = 8;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

impl From<CameraError> for SourceError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::CaptureFailed(_) => SourceError::ReadFailed(e.to_string()),
            _ => SourceError::OpenFailed(e.to_string()),
        }
    }
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// Motion JPEG, decoded per frame.
    Mjpeg,
    /// 8-bit grayscale, replicated to RGB.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// A V4L2 camera exposed as a [`FrameSource`].
///
/// The stream never ends on its own; callers bound it with sampler limits.
pub struct CameraSource {
    device: Option<Device>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
    pending: VecDeque<RgbImage>,
}

impl CameraSource {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUEST_WIDTH;
        fmt.height = REQUEST_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, or GREY)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device: Some(device),
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
            pending: VecDeque::new(),
        })
    }

    fn capture_batch(&mut self) -> Result<(), CameraError> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| CameraError::CaptureFailed("camera released".into()))?;
        let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        for _ in 0..CAPTURE_BATCH {
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let image = to_rgb(self.pixel_format, &buf[..used], self.width, self.height)?;
            tracing::trace!(seq = meta.sequence, "captured frame");
            self.pending.push_back(image);
        }
        Ok(())
    }

    /// List available V4L2 video capture devices as `(path, card name)`.
    pub fn list_devices() -> Vec<(String, String)> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| (path, caps.card))
            })
            .collect()
    }
}

fn to_rgb(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, CameraError> {
    let converted = match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
        PixelFormat::Mjpeg => frame::mjpeg_to_rgb(buf),
    };
    converted.map_err(|e| CameraError::CaptureFailed(format!("{format:?} conversion failed: {e}")))
}

impl FrameSource for CameraSource {
    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if self.device.is_none() {
            return Ok(None);
        }
        if self.pending.is_empty() {
            self.capture_batch()?;
        }
        Ok(self.pending.pop_front())
    }

    fn release(&mut self) {
        if self.device.take().is_some() {
            self.pending.clear();
            tracing::info!(device = %self.device_path, "camera released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_missing_device() {
        let result = CameraSource::open("/dev/video-does-not-exist");
        assert!(matches!(result, Err(CameraError::DeviceNotFound(_))));
    }

    #[test]
    fn test_list_devices_reports_existing_nodes() {
        for (path, _card) in CameraSource::list_devices() {
            assert!(path.starts_with("/dev/video"));
            assert!(Path::new(&path).exists());
        }
    }

    #[test]
    fn test_camera_error_maps_to_source_error() {
        let open: SourceError = CameraError::DeviceBusy.into();
        assert!(matches!(open, SourceError::OpenFailed(_)));
        let read: SourceError = CameraError::CaptureFailed("timeout".into()).into();
        assert!(matches!(read, SourceError::ReadFailed(_)));
    }

    #[test]
    fn test_to_rgb_grey() {
        let img = to_rgb(PixelFormat::Grey, &[50; 6], 3, 2).unwrap();
        assert_eq!(img.get_pixel(2, 1).0, [50, 50, 50]);
        assert!(to_rgb(PixelFormat::Yuyv, &[0; 4], 3, 2).is_err());
    }
}
