//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameSource};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

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

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }
}

/// How long a frame dequeue may block before capture fails.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

const STREAM_BUFFERS: u32 = 4;

/// V4L2 camera device handle. The device is released on drop.
///
/// Streaming starts on the first captured frame and keeps running until the
/// camera is dropped.
pub struct Camera {
    stream: Option<MmapStream<'static>>,
    frame_timeout: Duration,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and request
    /// the given capture resolution.
    ///
    /// The driver may negotiate a different size; the negotiated one is what
    /// `width`/`height` report and what frames carry.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
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

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; grayscale-only sensors come back as GREY or Y16.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            stream: None,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Bound how long [`capture_frame`](Self::capture_frame) waits for the
    /// driver. Zero waits forever.
    pub fn set_frame_timeout(&mut self, timeout: Duration) {
        let timeout = timeout.min(Duration::from_millis(i32::MAX as u64));
        self.frame_timeout = timeout;
        if let Some(stream) = self.stream.as_mut() {
            apply_timeout(stream, timeout);
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        self.frame_timeout
    }

    /// Capture the next frame, converting to grayscale if needed.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (format, width, height, timeout) =
            (self.pixel_format, self.width, self.height, self.frame_timeout);

        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.start_stream()?,
        };
        let stream = self.stream.insert(stream);

        let (buf, meta) = stream.next().map_err(|e| dequeue_error(e, timeout))?;
        let sequence = meta.sequence;
        let gray = to_grayscale(format, width, height, buf)?;
        let is_dark = frame::is_dark_frame(&gray, frame::DARK_FRAME_THRESHOLD);

        Ok(Frame {
            data: gray,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        })
    }

    fn start_stream(&self) -> Result<MmapStream<'static>, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
        apply_timeout(&mut stream, self.frame_timeout);
        tracing::debug!(
            device = %self.device_path,
            buffers = STREAM_BUFFERS,
            timeout_ms = self.frame_timeout.as_millis() as u64,
            "streaming started"
        );
        Ok(stream)
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "released camera");
    }
}

fn apply_timeout(stream: &mut MmapStream<'static>, timeout: Duration) {
    if timeout.is_zero() {
        stream.clear_timeout();
    } else {
        stream.set_timeout(timeout);
    }
}

fn dequeue_error(e: io::Error, timeout: Duration) -> CameraError {
    if e.kind() == io::ErrorKind::TimedOut {
        tracing::warn!(timeout_ms = timeout.as_millis() as u64, "camera delivered no frame");
        CameraError::CaptureFailed(format!("no frame within {} ms", timeout.as_millis()))
    } else {
        CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
    }
}

/// Convert a raw buffer to grayscale based on the negotiated format.
fn to_grayscale(
    format: PixelFormat,
    width: u32,
    height: u32,
    buf: &[u8],
) -> Result<Vec<u8>, CameraError> {
    let pixels = (width * height) as usize;

    match format {
        PixelFormat::Grey => {
            if buf.len() < pixels {
                return Err(CameraError::CaptureFailed(format!(
                    "GREY buffer too short: expected {pixels}, got {}",
                    buf.len()
                )));
            }
            Ok(buf[..pixels].to_vec())
        }
        PixelFormat::Y16 => y16_to_grayscale(buf, pixels),
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
    }
}

/// Y16: 16-bit little-endian per pixel, keep the high byte.
fn y16_to_grayscale(buf: &[u8], pixels: usize) -> Result<Vec<u8>, CameraError> {
    let expected_bytes = pixels * 2;
    if buf.len() < expected_bytes {
        return Err(CameraError::CaptureFailed(format!(
            "Y16 buffer too short: expected {expected_bytes}, got {}",
            buf.len()
        )));
    }
    Ok(buf[..expected_bytes]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let buf = [0x34, 0x12, 0xff, 0xab];
        assert_eq!(y16_to_grayscale(&buf, 2).unwrap(), vec![0x12, 0xab]);
    }

    #[test]
    fn test_y16_short_buffer() {
        assert!(y16_to_grayscale(&[0u8; 3], 2).is_err());
    }

    #[test]
    fn test_grey_buffer_is_truncated_to_frame() {
        let gray = to_grayscale(PixelFormat::Grey, 2, 2, &[1, 2, 3, 4, 99]).unwrap();
        assert_eq!(gray, vec![1, 2, 3, 4]);
        assert!(to_grayscale(PixelFormat::Grey, 2, 2, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_dequeue_timeout_is_a_capture_failure() {
        let err = dequeue_error(
            io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF"),
            Duration::from_millis(1500),
        );
        assert!(
            matches!(err, CameraError::CaptureFailed(ref msg) if msg.contains("no frame within 1500 ms")),
            "{err}"
        );

        let err = dequeue_error(io::Error::other("EIO"), DEFAULT_FRAME_TIMEOUT);
        assert!(matches!(err, CameraError::CaptureFailed(ref msg) if msg.contains("dequeue")));
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/does-not-exist-video", 640, 480).err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }
}
